//! ZPAM common types
//!
//! Shared error taxonomy, the configuration surface, and address helpers
//! used by every other crate in the workspace.

pub mod config;
pub mod error;

pub use config::ZpamConfig;
pub use error::{ZpamError, ZpamResult};

/// Normalize an envelope address for map keys and list lookups.
///
/// Strips angle brackets and whitespace, lowercases the whole address.
pub fn normalize_address(addr: &str) -> String {
    addr.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}

/// Extract the domain part of an email address, lowercased.
///
/// Returns an empty string when the address has no `@`.
pub fn extract_domain(email: &str) -> String {
    normalize_address(email)
        .split('@')
        .nth(1)
        .unwrap_or("")
        .to_string()
}

/// Extract the address inside a display-name header value.
///
/// `"Alice" <alice@example.com>` becomes `alice@example.com`.
pub fn extract_address(header_value: &str) -> String {
    match (header_value.rfind('<'), header_value.rfind('>')) {
        (Some(start), Some(end)) if start < end => {
            header_value[start + 1..end].trim().to_lowercase()
        }
        _ => normalize_address(header_value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("<Bob@Example.COM>"), "bob@example.com");
        assert_eq!(normalize_address("  alice@test.org "), "alice@test.org");
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("user@Sub.Example.com"), "sub.example.com");
        assert_eq!(extract_domain("not-an-address"), "");
    }

    #[test]
    fn test_extract_address_with_display_name() {
        assert_eq!(
            extract_address("\"Alice\" <Alice@Microsoft.com>"),
            "alice@microsoft.com"
        );
        assert_eq!(extract_address("plain@example.com"), "plain@example.com");
    }
}
