//! Stable identities for monitored objects within a cell.
//!
//! The identity is the raw 20-byte SHA-1 digest of
//! `cell_name + "!" + host_name + "!" + object_name`.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::error::{BemError, Result};

/// 160-bit content-derived issue identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; 20]);

impl Identity {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Rebuild from a stored binary column.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            BemError::IdentityConflict(format!(
                "stored identity has {} bytes, expected 20",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub fn compute_identity(cell_name: &str, host_name: &str, object_name: &str) -> Identity {
    let mut hasher = Sha1::new();
    hasher.update(cell_name.as_bytes());
    hasher.update(b"!");
    hasher.update(host_name.as_bytes());
    hasher.update(b"!");
    hasher.update(object_name.as_bytes());
    let digest = hasher.finalize();

    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    Identity(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let id = compute_identity("prod", "web01", "http");
        assert_eq!(id.to_hex(), "165b03ad4d327b4b628540bba46bd0dfbc4b9d29");
    }

    #[test]
    fn test_host_object_uses_empty_object() {
        let id = compute_identity("prod", "web01", "");
        assert_eq!(id.to_hex(), "20aefe72cbbd845ad24ed9e3214e3e48c071eb95");
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(
            compute_identity("prod", "web01", "http"),
            compute_identity("prod", "web01", "http")
        );
    }

    #[test]
    fn test_each_component_changes_identity() {
        let base = compute_identity("prod", "web01", "http");
        assert_ne!(base, compute_identity("test", "web01", "http"));
        assert_ne!(base, compute_identity("prod", "web02", "http"));
        assert_ne!(base, compute_identity("prod", "web01", "https"));
    }

    #[test]
    fn test_from_slice_round_trip_and_length_check() {
        let id = compute_identity("a", "b", "c");
        assert_eq!(Identity::from_slice(id.as_bytes()).unwrap(), id);
        assert!(matches!(
            Identity::from_slice(&[1, 2, 3]),
            Err(BemError::IdentityConflict(_))
        ));
    }
}
