//! Deterministic trampoline name derivation.
//!
//! Names must be stable across runs and machines (distinct package
//! compilations of the same code must agree) and collision-free within a
//! package. Both properties come from hashing the `rule:target` pair and
//! keeping the first four bytes, the same truncated-digest scheme used for
//! instruction discriminators elsewhere in the stack.

use sha2::{Digest, Sha256};

const BEFORE_PREFIX: &str = "__weft_before_";
const AFTER_PREFIX: &str = "__weft_after_";

/// Stable 8-hex-char suffix for a (rule, target) pair.
pub fn trampoline_suffix(rule: &str, target: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", rule, target).as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn before_name(rule: &str, target: &str) -> String {
    format!(
        "{}{}_{}",
        BEFORE_PREFIX,
        sanitize(rule),
        trampoline_suffix(rule, target)
    )
}

pub fn after_name(rule: &str, target: &str) -> String {
    format!(
        "{}{}_{}",
        AFTER_PREFIX,
        sanitize(rule),
        trampoline_suffix(rule, target)
    )
}

/// Rule names come from config files and may contain characters that are not
/// valid in an identifier; map them to underscores.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic() {
        assert_eq!(
            before_name("db_query", "Conn::query"),
            before_name("db_query", "Conn::query")
        );
        assert_eq!(
            after_name("db_query", "Conn::query"),
            after_name("db_query", "Conn::query")
        );
    }

    #[test]
    fn names_differ_by_rule_and_target() {
        assert_ne!(
            before_name("r1", "f"),
            before_name("r2", "f"),
            "different rules must not collide"
        );
        assert_ne!(
            before_name("r1", "f"),
            before_name("r1", "g"),
            "different targets must not collide"
        );
        assert_ne!(before_name("r1", "f"), after_name("r1", "f"));
    }

    #[test]
    fn sanitizes_non_identifier_characters() {
        let name = before_name("http/serve-v2", "serve");
        assert!(name.starts_with("__weft_before_http_serve_v2_"));
        assert!(syn::parse_str::<syn::Ident>(&name).is_ok());
    }
}
