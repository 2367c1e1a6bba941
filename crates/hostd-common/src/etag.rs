use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{HostdError, Result};

/// Hash a value into an ETag: sha256 of its JSON encoding, hex encoded.
pub fn etag_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let encoded = serde_json::to_vec(value)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Compare a client supplied `If-Match` value against the current state.
///
/// A missing or empty header skips the check. Surrounding quotes are ignored.
pub fn check_if_match<T: Serialize + ?Sized>(if_match: Option<&str>, current: &T) -> Result<()> {
    let supplied = match if_match.map(|v| v.trim().trim_matches('"')) {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(()),
    };

    let expected = etag_hash(current)?;
    if supplied != expected {
        return Err(HostdError::PreconditionFailed(format!(
            "ETag doesn't match: {supplied} vs {expected}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let a = etag_hash(&["2024-01-01T00:00:00Z"]).unwrap();
        let b = etag_hash(&["2024-01-01T00:00:00Z"]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, etag_hash(&["2024-01-02T00:00:00Z"]).unwrap());
    }

    #[test]
    fn test_if_match() {
        let state = [Some("2024-01-01T00:00:00Z")];
        let tag = etag_hash(&state).unwrap();

        assert!(check_if_match(None, &state).is_ok());
        assert!(check_if_match(Some(""), &state).is_ok());
        assert!(check_if_match(Some(&tag), &state).is_ok());
        assert!(check_if_match(Some(&format!("\"{tag}\"")), &state).is_ok());

        let err = check_if_match(Some("stale"), &state).unwrap_err();
        assert!(matches!(err, HostdError::PreconditionFailed(_)));
    }
}
