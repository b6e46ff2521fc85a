//! Stable id generation for the Tag-Injecting Transform (component B).
//!
//! `generate_stable_id` is the only place in the crate that computes an md5
//! digest; everything else treats a jsx id as an opaque, parseable string.

use md5::{Digest, Md5};

/// `hash = first 8 hex chars of md5(file ":" line ":" column)`.
/// `id = "<prefix>-<hash>"` when `prefix` is non-empty, otherwise just `hash`.
pub fn generate_stable_id(file: &str, line: u32, column: u32, prefix: Option<&str>) -> String {
    let input = format!("{file}:{line}:{column}");
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let hash = hex::encode(digest);
    let hash = &hash[..8];

    match prefix {
        Some(p) if !p.is_empty() => format!("{p}-{hash}"),
        _ => hash.to_string(),
    }
}

/// Parsed form of a jsx id: an optional prefix plus the 8-hex-char hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: Option<String>,
    pub hash: String,
}

/// Split an id produced by [`generate_stable_id`] back into prefix + hash.
/// Returns `None` if the id isn't a valid jsx id (see [`is_valid_id`]).
pub fn parse_id(id: &str) -> Option<ParsedId> {
    if !is_valid_id(id) {
        return None;
    }
    match id.rsplit_once('-') {
        Some((prefix, hash)) => Some(ParsedId {
            prefix: Some(prefix.to_string()),
            hash: hash.to_string(),
        }),
        None => Some(ParsedId {
            prefix: None,
            hash: id.to_string(),
        }),
    }
}

/// A valid id is an optional prefix followed by a `-` and exactly 8 hex
/// characters, or exactly 8 hex characters on their own.
pub fn is_valid_id(id: &str) -> bool {
    let hash_part = match id.rsplit_once('-') {
        Some((_, hash)) => hash,
        None => id,
    };
    hash_part.len() == 8 && hash_part.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_stability_same_inputs_same_id() {
        let a = generate_stable_id("/src/App.tsx", 10, 4, None);
        let b = generate_stable_id("/src/App.tsx", 10, 4, None);
        assert_eq!(a, b);
    }

    #[test]
    fn id_changes_with_line() {
        let a = generate_stable_id("/src/App.tsx", 10, 4, None);
        let b = generate_stable_id("/src/App.tsx", 11, 4, None);
        assert_ne!(a, b);
    }

    #[test]
    fn id_changes_with_column() {
        let a = generate_stable_id("/src/App.tsx", 10, 4, None);
        let b = generate_stable_id("/src/App.tsx", 10, 5, None);
        assert_ne!(a, b);
    }

    #[test]
    fn id_changes_with_file() {
        let a = generate_stable_id("/src/App.tsx", 10, 4, None);
        let b = generate_stable_id("/src/Other.tsx", 10, 4, None);
        assert_ne!(a, b);
    }

    #[test]
    fn id_with_prefix_has_prefix_dash_hash_shape() {
        let id = generate_stable_id("/src/App.tsx", 10, 4, Some("demo"));
        assert!(id.starts_with("demo-"));
        assert_eq!(id.len(), "demo-".len() + 8);
    }

    #[test]
    fn id_without_prefix_is_bare_hash() {
        let id = generate_stable_id("/src/App.tsx", 10, 4, None);
        assert_eq!(id.len(), 8);
    }

    #[test]
    fn id_with_empty_prefix_is_bare_hash() {
        let id = generate_stable_id("/src/App.tsx", 10, 4, Some(""));
        assert_eq!(id.len(), 8);
    }

    #[test]
    fn generated_ids_are_always_valid() {
        assert!(is_valid_id(&generate_stable_id("/a.tsx", 1, 1, None)));
        assert!(is_valid_id(&generate_stable_id("/a.tsx", 1, 1, Some("p"))));
    }

    #[test]
    fn is_valid_rejects_known_bad_inputs() {
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("123"));
        assert!(!is_valid_id("123456789"));
        assert!(!is_valid_id("1234567g"));
    }

    #[test]
    fn parse_id_roundtrips_prefixed() {
        let id = generate_stable_id("/a.tsx", 3, 7, Some("demo"));
        let parsed = parse_id(&id).unwrap();
        assert_eq!(parsed.prefix.as_deref(), Some("demo"));
        assert_eq!(parsed.hash.len(), 8);
    }

    #[test]
    fn parse_id_roundtrips_unprefixed() {
        let id = generate_stable_id("/a.tsx", 3, 7, None);
        let parsed = parse_id(&id).unwrap();
        assert_eq!(parsed.prefix, None);
        assert_eq!(parsed.hash, id);
    }

    #[test]
    fn parse_id_rejects_invalid() {
        assert!(parse_id("not-an-id").is_none());
        assert!(parse_id("").is_none());
    }
}
