//! Artifact transport.
//!
//! Fetches a URL into a byte reader. `file://` URLs resolve to local paths
//! (the testing hook); anything else is an HTTP GET. When the keyring is
//! armed the body is piped through the decryptor before the caller sees it,
//! with a small eager pre-read so malformed PGP headers surface here rather
//! than deep inside a later copy.

use std::io::{Cursor, Read};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::keyring::{KeyringError, KeyringView};

pub const DEFAULT_MANIFEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PATCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FULL_TIMEOUT: Duration = Duration::from_secs(600);

/// How many plaintext bytes the decryption wrapper reads eagerly.
const DECRYPT_PREFIX: usize = 1024;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("GET {url} failed with status {status}")]
    Failed { status: u16, url: String },

    #[error("GET {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("deadline elapsed fetching {0}")]
    Cancelled(String),

    #[error(transparent)]
    Decryption(#[from] KeyringError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A per-phase deadline. `Default` selects the phase's built-in default,
/// `None` disables the deadline entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Default,
    None,
    After(Duration),
}

impl Timeout {
    /// A zero duration also selects the default, so `After(Duration::ZERO)`
    /// and `Default` are interchangeable.
    pub fn resolve(self, default: Duration) -> Option<Duration> {
        match self {
            Timeout::Default => Some(default),
            Timeout::None => None,
            Timeout::After(d) if d.is_zero() => Some(default),
            Timeout::After(d) => Some(d),
        }
    }
}

/// The three deadline classes of the consumer: manifest (10 s), patch
/// (60 s) and full download (600 s), each independently overridable.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub manifest: Timeout,
    pub patch: Timeout,
    pub full: Timeout,
}

impl Timeouts {
    pub fn manifest_deadline(&self) -> Option<Duration> {
        self.manifest.resolve(DEFAULT_MANIFEST_TIMEOUT)
    }

    pub fn patch_deadline(&self) -> Option<Duration> {
        self.patch.resolve(DEFAULT_PATCH_TIMEOUT)
    }

    pub fn full_deadline(&self) -> Option<Duration> {
        self.full.resolve(DEFAULT_FULL_TIMEOUT)
    }
}

/// A fetched payload, already decrypted when the keyring is armed.
pub type Payload = Box<dyn Read + Send>;

/// Fetch `url` into a byte reader under `deadline`. A non-200 response is
/// an immediate error and its body is dropped. When `keyring` is armed the
/// returned reader yields plaintext.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    keyring: Option<&KeyringView>,
    deadline: Option<Duration>,
) -> Result<Payload, FetchError> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fetch_inner(client, url, keyring))
            .await
            .map_err(|_| FetchError::Cancelled(url.to_string()))?,
        None => fetch_inner(client, url, keyring).await,
    }
}

async fn fetch_inner(
    client: &reqwest::Client,
    url: &str,
    keyring: Option<&KeyringView>,
) -> Result<Payload, FetchError> {
    debug!(url, "fetch");
    let raw: Box<dyn Read + Send + Sync> = if let Some(path) = url.strip_prefix("file://") {
        Box::new(std::fs::File::open(path)?)
    } else {
        let response = client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Failed {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body: Bytes = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;
        Box::new(Cursor::new(body))
    };

    match keyring {
        Some(keyring) if keyring.has_keys() => decrypting_reader(keyring, raw),
        _ => Ok(raw),
    }
}

/// Wrap `raw` in the keyring's decryptor, eagerly pre-reading a prefix so
/// header errors surface from `fetch` itself. The prefix is transparently
/// chained back in front of the continuing stream.
fn decrypting_reader(
    keyring: &KeyringView,
    raw: Box<dyn Read + Send + Sync>,
) -> Result<Payload, FetchError> {
    let mut plain = keyring.decrypt(raw)?;
    let mut prefix = vec![0u8; DECRYPT_PREFIX];
    let mut filled = 0;
    while filled < DECRYPT_PREFIX / 2 {
        let n = plain.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    prefix.truncate(filled);
    Ok(Box::new(Cursor::new(prefix).chain(plain)))
}
