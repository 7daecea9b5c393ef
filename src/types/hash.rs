//! SHA-256 content hashes and their textual encodings.
//!
//! Artifacts are identified by the hash of their plaintext content. Two
//! encodings are in play and must not be mixed: path and URL segments carry
//! the URL-safe base64 form, while the manifest JSON carries the standard
//! base64 form. Both are padded and both round-trip losslessly.

use std::fmt;
use std::io::{self, Read};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Size of a SHA-256 digest in bytes.
pub const HASH_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("invalid base64 hash: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("hash must be {HASH_LEN} bytes, got {0}")]
    Length(usize),
}

/// A SHA-256 content hash.
///
/// Equality is constant-time byte equality on the 32-byte digest.
#[derive(Clone, Copy)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hash a byte slice in one shot.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Stream a reader through the hasher in 64 KiB chunks.
    pub fn of_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut hasher = Hasher::new();
        let mut buffer = [0u8; 65536];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize())
    }

    /// Check `data` against this hash in constant time.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }

    /// URL-safe base64 form, used in filesystem and URL path segments.
    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    /// Inverse of [`Hash::encode`]. Rejects anything that is not exactly a
    /// 32-byte digest.
    pub fn decode(s: &str) -> Result<Self, HashError> {
        let bytes = URL_SAFE.decode(s)?;
        let len = bytes.len();
        let digest: [u8; HASH_LEN] = bytes.try_into().map_err(|_| HashError::Length(len))?;
        Ok(Self(digest))
    }
}

impl PartialEq for Hash {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for Hash {}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.encode())
    }
}

/// Streaming SHA-256 accumulator. Does not buffer its input.
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Hash {
        Hash(self.0.finalize().into())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Serde adapter for the manifest's hash field: standard base64 with
/// padding, as opposed to the URL-safe form used in paths.
pub mod std_base64 {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(hash.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != HASH_LEN {
            return Err(serde::de::Error::custom(format!(
                "hash must be {HASH_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut digest = [0u8; HASH_LEN];
        digest.copy_from_slice(&bytes);
        Ok(Hash::from_bytes(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let hash = Hash::of(b"some binary content");
        let encoded = hash.encode();
        assert_eq!(Hash::decode(&encoded).unwrap(), hash);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let short = URL_SAFE.encode([0u8; 16]);
        assert!(matches!(Hash::decode(&short), Err(HashError::Length(16))));
    }

    #[test]
    fn decode_rejects_bad_base64() {
        assert!(matches!(
            Hash::decode("not/base64!"),
            Err(HashError::Encoding(_))
        ));
    }

    #[test]
    fn verify_matches_content() {
        let hash = Hash::of(b"payload");
        assert!(hash.verify(b"payload"));
        assert!(!hash.verify(b"tampered"));
    }

    #[test]
    fn streaming_matches_oneshot() {
        let data = vec![7u8; 200_000];
        let mut cursor = std::io::Cursor::new(&data);
        assert_eq!(Hash::of_reader(&mut cursor).unwrap(), Hash::of(&data));
    }
}
