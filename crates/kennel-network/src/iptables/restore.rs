//! `iptables-restore` payloads and `iptables -S` line handling.

use super::Table;

/// Quote an argument for an `iptables-restore` line.
#[must_use]
pub fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return arg.to_string();
    }
    format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Split an `iptables -S` or restore line into arguments.
///
/// Understands double quotes with backslash escapes, which is how iptables
/// prints comments and log prefixes.
///
/// # Errors
///
/// Returns an error for an unterminated quote.
pub fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(format!("dangling escape in {line:?}")),
                        },
                        Some(other) => current.push(other),
                        None => return Err(format!("unterminated quote in {line:?}")),
                    }
                }
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// One table's worth of commands, committed atomically.
pub(super) fn payload(table: Table, lines: &[Vec<String>]) -> String {
    let mut out = format!("*{table}\n");
    for line in lines {
        let quoted: Vec<String> = line.iter().map(|arg| quote(arg)).collect();
        out.push_str(&quoted.join(" "));
        out.push('\n');
    }
    out.push_str("COMMIT\n");
    out
}
