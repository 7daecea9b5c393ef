//! Caller-distinguishable errors for the update and publish operations.

use thiserror::Error;

use crate::io::delta::DeltaError;
use crate::io::fetch::FetchError;
use crate::keyring::KeyringError;
use crate::templates::TemplateError;

/// Errors surfaced by the consumer pipeline. Which of these abort a run and
/// which merely push the state machine towards the full download is decided
/// in the pipeline itself; the kinds stay distinguishable for the caller.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Fetch(FetchError),

    #[error("update cancelled")]
    Cancelled,

    #[error("malformed manifest: {0}")]
    ManifestMalformed(String),

    #[error("manifest signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("patch application failed: {0}")]
    Patch(#[from] DeltaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FetchError> for UpdateError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled(_) => UpdateError::Cancelled,
            FetchError::Decryption(inner) => UpdateError::Decryption(inner.to_string()),
            other => UpdateError::Fetch(other),
        }
    }
}

impl From<KeyringError> for UpdateError {
    fn from(err: KeyringError) -> Self {
        match err {
            KeyringError::SignatureInvalid(msg) => UpdateError::SignatureInvalid(msg),
            other => UpdateError::Decryption(other.to_string()),
        }
    }
}

/// Errors aborting a publish. Unreadable old blobs during delta generation
/// are not errors at all; they are logged and skipped.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("keyring error: {0}")]
    Keyring(#[from] KeyringError),

    #[error("failed to encode manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("delta against {old} failed: {source}")]
    Delta {
        old: String,
        #[source]
        source: DeltaError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_cancellation_surfaces_as_cancelled() {
        let err = UpdateError::from(FetchError::Cancelled("http://example".into()));
        assert!(matches!(err, UpdateError::Cancelled));
    }

    #[test]
    fn fetch_decryption_surfaces_as_decryption() {
        let err = UpdateError::from(FetchError::Decryption(KeyringError::Decryption(
            "bad header".into(),
        )));
        assert!(matches!(err, UpdateError::Decryption(_)));
    }

    #[test]
    fn signature_failure_keeps_its_kind() {
        let err = UpdateError::from(KeyringError::SignatureInvalid("bad sig".into()));
        assert!(matches!(err, UpdateError::SignatureInvalid(_)));
    }
}
