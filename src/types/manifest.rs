//! The manifest record naming the latest binary for a platform.

use serde::{Deserialize, Serialize};

use super::hash::{self, Hash};

/// The small JSON record published next to the blobs. Its single required
/// field is the expected content hash of the latest binary, carried as
/// standard base64 (unlike path segments, which use the URL-safe form).
/// Unknown keys are ignored on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Sha256", with = "hash::std_base64")]
    pub sha256: Hash,
}

impl Manifest {
    pub fn new(sha256: Hash) -> Self {
        Self { sha256 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn serializes_standard_base64() {
        let hash = Hash::of(b"binary");
        let json = serde_json::to_string(&Manifest::new(hash)).unwrap();
        let expected = STANDARD.encode(hash.as_bytes());
        assert_eq!(json, format!("{{\"Sha256\":\"{expected}\"}}"));
    }

    #[test]
    fn roundtrips() {
        let manifest = Manifest::new(Hash::of(b"binary"));
        let json = serde_json::to_vec(&manifest).unwrap();
        let back: Manifest = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn ignores_unknown_keys() {
        let hash = Hash::of(b"binary");
        let json = format!(
            "{{\"Sha256\":\"{}\",\"Extra\":42}}",
            STANDARD.encode(hash.as_bytes())
        );
        let manifest: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest.sha256, hash);
    }

    #[test]
    fn rejects_short_hash() {
        let json = format!("{{\"Sha256\":\"{}\"}}", STANDARD.encode([1u8; 16]));
        assert!(serde_json::from_str::<Manifest>(&json).is_err());
    }

    #[test]
    fn rejects_missing_hash() {
        assert!(serde_json::from_str::<Manifest>("{}").is_err());
    }
}
