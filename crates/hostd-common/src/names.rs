//! Snapshot naming.
//!
//! A snapshot is an instance whose name is `parent/leaf`. The parent linkage
//! is derived from the name only, so every call site goes through
//! [`split_snapshot_name`] instead of splitting strings itself.
//!
//! Names carrying the delimiter anywhere other than the single parent/leaf
//! boundary are not supported: instance names and snapshot leaf names are
//! rejected by [`validate_instance_name`] and [`validate_url_segment`].

use crate::{HostdError, Result};

/// Separator between the parent instance name and the snapshot leaf name.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// Default auto-naming pattern for new snapshots.
pub const DEFAULT_SNAPSHOT_PATTERN: &str = "snap%d";

/// Split `parent/leaf` on the first delimiter.
///
/// Returns `(name, None)` when the name has no delimiter, i.e. it is not a
/// snapshot name.
pub fn split_snapshot_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, leaf)) => (parent, Some(leaf)),
        None => (name, None),
    }
}

pub fn is_snapshot_name(name: &str) -> bool {
    name.contains(SNAPSHOT_DELIMITER)
}

pub fn snapshot_full_name(parent: &str, leaf: &str) -> String {
    format!("{parent}{SNAPSHOT_DELIMITER}{leaf}")
}

/// Checks that a value can be used verbatim as one URL path segment.
pub fn validate_url_segment(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(HostdError::bad_request("Name cannot be empty"));
    }

    if value == "." || value == ".." {
        return Err(HostdError::bad_request(format!("Name cannot be {value:?}")));
    }

    for forbidden in ['/', '?', '&', '+', '#', '%'] {
        if value.contains(forbidden) {
            return Err(HostdError::bad_request(format!(
                "Cannot contain {forbidden:?}"
            )));
        }
    }

    if value.chars().any(|c| c.is_control()) {
        return Err(HostdError::bad_request("Cannot contain control characters"));
    }

    Ok(())
}

/// Instance names addressed by the snapshot collection endpoints must not be
/// snapshot names themselves.
pub fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() || is_snapshot_name(name) {
        return Err(HostdError::bad_request("Invalid instance name"));
    }

    Ok(())
}

/// Resolve the auto-naming pattern against the names already in use.
///
/// The pattern may contain at most one `%d`, which is replaced with the
/// lowest non-negative index not yet taken. A pattern without `%d` is used
/// as-is when free and otherwise gets `-%d` appended.
pub fn next_snapshot_name<S: AsRef<str>>(pattern: &str, existing: &[S]) -> Result<String> {
    let taken = |candidate: &str| existing.iter().any(|name| name.as_ref() == candidate);

    let pattern = match pattern.matches("%d").count() {
        0 if !taken(pattern) => return Ok(pattern.to_string()),
        0 => format!("{pattern}-%d"),
        1 => pattern.to_string(),
        _ => {
            return Err(HostdError::bad_request(
                "Snapshot pattern may contain '%d' only once",
            ))
        }
    };

    let mut index = 0usize;
    loop {
        let candidate = pattern.replacen("%d", &index.to_string(), 1);
        if !taken(&candidate) {
            return Ok(candidate);
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_snapshot_name() {
        assert_eq!(split_snapshot_name("c1/snap0"), ("c1", Some("snap0")));
        assert_eq!(split_snapshot_name("c1"), ("c1", None));
        // Only the first delimiter separates parent from leaf.
        assert_eq!(split_snapshot_name("c1/a/b"), ("c1", Some("a/b")));
    }

    #[test]
    fn test_validate_url_segment() {
        assert!(validate_url_segment("snap0").is_ok());
        assert!(validate_url_segment("before-upgrade_2").is_ok());
        assert!(validate_url_segment("").is_err());
        assert!(validate_url_segment("..").is_err());
        assert!(validate_url_segment("a/b").is_err());
        assert!(validate_url_segment("a?b").is_err());
        assert!(validate_url_segment("a&b").is_err());
        assert!(validate_url_segment("a+b").is_err());
    }

    #[test]
    fn test_validate_instance_name() {
        assert!(validate_instance_name("c1").is_ok());
        assert!(validate_instance_name("c1/snap0").is_err());
        assert!(validate_instance_name("").is_err());
    }

    #[test]
    fn test_next_snapshot_name_sequential() {
        let existing = ["snap0", "snap1", "snap2"];
        assert_eq!(next_snapshot_name("snap%d", &existing).unwrap(), "snap3");
        let none: [&str; 0] = [];
        assert_eq!(next_snapshot_name("snap%d", &none).unwrap(), "snap0");
    }

    #[test]
    fn test_next_snapshot_name_fills_gap() {
        let existing = ["snap0", "snap2", "snap3"];
        assert_eq!(next_snapshot_name("snap%d", &existing).unwrap(), "snap1");
    }

    #[test]
    fn test_next_snapshot_name_custom_patterns() {
        let existing = ["nightly", "nightly-0"];
        assert_eq!(next_snapshot_name("nightly", &existing).unwrap(), "nightly-1");
        assert_eq!(next_snapshot_name("weekly", &existing).unwrap(), "weekly");
        assert!(next_snapshot_name("s%d-%d", &existing).is_err());
    }
}
