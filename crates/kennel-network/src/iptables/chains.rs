//! Chain naming.

use kennel_common::{ContainerHandle, KennelError, KennelResult};

/// Kernel limit on chain names (`XT_EXTENSION_MAXNAMELEN` minus NUL, minus
/// the three characters iptables reserves).
pub const MAX_CHAIN_NAME: usize = 28;

const INSTANCE_INFIX: &str = "instance-";
const LOG_SUFFIX: &str = "-log";

/// Longest chain prefix that still fits every instance log chain.
pub const MAX_PREFIX_LEN: usize =
    MAX_CHAIN_NAME - INSTANCE_INFIX.len() - ContainerHandle::INSTANCE_ID_LEN - LOG_SUFFIX.len();

pub(super) fn validate_prefix(prefix: &str) -> KennelResult<()> {
    if prefix.len() > MAX_PREFIX_LEN {
        return Err(KennelError::Config {
            message: format!("iptables chain prefix {prefix:?} is longer than {MAX_PREFIX_LEN} characters"),
        });
    }
    if prefix.chars().any(|c| c.is_whitespace() || c == '!') {
        return Err(KennelError::Config {
            message: format!("iptables chain prefix {prefix:?} contains invalid characters"),
        });
    }
    Ok(())
}

/// Host-wide chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalChains {
    /// filter: traffic from containers to the host.
    pub input: String,
    /// filter: traffic forwarded from container bridges.
    pub forward: String,
    /// filter: fallback policy after instance rules (deny networks).
    pub default: String,
    /// nat: dispatches to instance DNAT chains.
    pub prerouting: String,
    /// nat: masquerading for outbound traffic.
    pub postrouting: String,
}

impl GlobalChains {
    /// Names under `prefix`.
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            input: format!("{prefix}input"),
            forward: format!("{prefix}forward"),
            default: format!("{prefix}default"),
            prerouting: format!("{prefix}prerouting"),
            postrouting: format!("{prefix}postrouting"),
        }
    }
}

/// Chains owned by one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceChains {
    /// Instance chain; the same name exists in both filter and nat.
    pub instance: String,
    /// filter: LOG companion.
    pub log: String,
}

impl InstanceChains {
    /// Names for `handle` under `prefix`.
    #[must_use]
    pub fn new(prefix: &str, handle: &ContainerHandle) -> Self {
        let instance = format!("{prefix}{INSTANCE_INFIX}{}", handle.instance_id());
        let log = format!("{instance}{LOG_SUFFIX}");
        Self { instance, log }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names_fit_the_kernel_limit() {
        let handle = ContainerHandle::new("a".repeat(128)).unwrap();
        let chains = InstanceChains::new(&"x".repeat(MAX_PREFIX_LEN), &handle);
        assert!(chains.instance.len() <= MAX_CHAIN_NAME);
        assert_eq!(chains.log.len(), MAX_CHAIN_NAME);
    }

    #[test]
    fn names_are_deterministic() {
        let handle = ContainerHandle::new("box-1").unwrap();
        let a = InstanceChains::new("w--", &handle);
        let b = InstanceChains::new("w--", &handle);
        assert_eq!(a, b);
        assert!(a.instance.starts_with("w--instance-"));
        assert_eq!(a.log, format!("{}-log", a.instance));
    }

    #[test]
    fn global_names() {
        let chains = GlobalChains::new("w--");
        assert_eq!(chains.input, "w--input");
        assert_eq!(chains.postrouting, "w--postrouting");
    }

    #[test]
    fn prefix_validation() {
        assert!(validate_prefix("w--").is_ok());
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("abcdef").is_err());
        assert!(validate_prefix("a b").is_err());
    }
}
