//! Session identifiers.
//!
//! A session id tags every event a policy engine emits, so listeners that
//! serve several sessions can route them.

use std::fmt;

use rand_core::{OsRng, RngCore};

/// Opaque session identifier.
///
/// Generated ids are 16 random bytes; callers that already own an id (for
/// instance one echoed by a license server) can wrap it with `From`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    /// Create a new random session id.
    pub fn random() -> Self {
        let mut id = vec![0u8; 16];
        let mut rng = OsRng;
        rng.fill_bytes(&mut id);
        Self(id)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for SessionId {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::SessionId;

    #[test]
    fn random_ids_are_16_bytes_and_distinct() {
        let a = SessionId::random();
        let b = SessionId::random();
        assert_eq!(a.as_bytes().len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(SessionId::from("ab").to_string(), "6162");
    }
}
