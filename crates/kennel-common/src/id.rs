//! Container handles and process identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{KennelError, KennelResult};

/// A validated container handle.
///
/// Handles are the namespacing key for everything a container owns: its
/// depot directory, its iptables chains and its network allocation.
///
/// Handles must:
/// - Be 1-128 characters long
/// - Contain only alphanumeric characters, `-`, `_` and `.`
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerHandle(String);

impl ContainerHandle {
    /// Maximum length of a handle.
    pub const MAX_LENGTH: usize = 128;

    /// Number of hex characters used by [`Self::instance_id`].
    pub const INSTANCE_ID_LEN: usize = 10;

    /// Create a new handle, validating the format.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::InvalidHandle`] if the format is invalid.
    pub fn new(handle: impl Into<String>) -> KennelResult<Self> {
        let handle = handle.into();
        Self::validate(&handle)?;
        Ok(Self(handle))
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, deterministic identifier derived from the handle.
    ///
    /// First ten hex characters of the SHA-256 of the handle. Used where
    /// kernel name limits apply (chain names, interface names).
    #[must_use]
    pub fn instance_id(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut id = hex::encode(digest);
        id.truncate(Self::INSTANCE_ID_LEN);
        id
    }

    /// Trailing `max` characters of the handle.
    ///
    /// Handles are ASCII, so slicing by byte is safe.
    #[must_use]
    pub fn tail(&self, max: usize) -> &str {
        let start = self.0.len().saturating_sub(max);
        &self.0[start..]
    }

    fn validate(handle: &str) -> KennelResult<()> {
        let invalid = || KennelError::InvalidHandle {
            handle: handle.to_string(),
        };

        if handle.is_empty() || handle.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        let mut chars = handle.chars();
        if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if chars.any(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.')) {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerHandle {
    type Err = KennelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerHandle {
    type Error = KennelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerHandle> for String {
    fn from(handle: ContainerHandle) -> Self {
        handle.0
    }
}

impl AsRef<str> for ContainerHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one process execution inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(String);

impl ProcessId {
    /// Generate a new random process ID.
    ///
    /// The ID is a 16-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..8]))
    }

    /// Use a caller-chosen ID.
    ///
    /// # Errors
    ///
    /// Returns [`KennelError::InvalidHandle`] if the ID would not be a
    /// safe single path component.
    pub fn new(id: impl Into<String>) -> KennelResult<Self> {
        let id = id.into();
        ContainerHandle::validate(&id)?;
        Ok(Self(id))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProcessId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_handles() {
        assert!(ContainerHandle::new("abc123").is_ok());
        assert!(ContainerHandle::new("my-container").is_ok());
        assert!(ContainerHandle::new("my_container.v2").is_ok());
        assert!(ContainerHandle::new("a".repeat(128)).is_ok());
    }

    #[test]
    fn invalid_handles() {
        assert!(ContainerHandle::new("").is_err());
        assert!(ContainerHandle::new("-invalid").is_err());
        assert!(ContainerHandle::new(".hidden").is_err());
        assert!(ContainerHandle::new("has/slash").is_err());
        assert!(ContainerHandle::new("a".repeat(129)).is_err());
    }

    #[test]
    fn instance_id_is_deterministic() {
        let a = ContainerHandle::new("some-handle").unwrap();
        let b = ContainerHandle::new("some-handle").unwrap();
        let c = ContainerHandle::new("other-handle").unwrap();

        assert_eq!(a.instance_id(), b.instance_id());
        assert_ne!(a.instance_id(), c.instance_id());
        assert_eq!(a.instance_id().len(), ContainerHandle::INSTANCE_ID_LEN);
        assert!(a.instance_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tail_keeps_the_end() {
        let handle = ContainerHandle::new("0123456789").unwrap();
        assert_eq!(handle.tail(4), "6789");
        assert_eq!(handle.tail(40), "0123456789");
    }

    #[test]
    fn deserialize_validates() {
        let ok: ContainerHandle = serde_json::from_str("\"box-1\"").unwrap();
        assert_eq!(ok.as_str(), "box-1");
        assert!(serde_json::from_str::<ContainerHandle>("\"../etc\"").is_err());
    }

    #[test]
    fn generated_process_ids_differ() {
        let a = ProcessId::generate();
        let b = ProcessId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }
}
