//! The consumer-side update pipeline.
//!
//! Each `fetch()` call runs one pass of the state machine: learn the
//! expected hash from the manifest, compare against the running binary,
//! try to patch the current image forward, and fall back to the full blob
//! when patching is impossible or produces the wrong bytes. Candidate
//! binaries are fully materialised and hash-verified before anything is
//! surfaced; the pipeline never writes to disk.

use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::GzDecoder;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::io::delta::{DiffCodec, ZstdDelta};
use crate::io::fetch::{self, Payload, Timeouts};
use crate::keyring::KeyringView;
use crate::ops::error::UpdateError;
use crate::templates::{TemplateKind, TemplateSet, UrlInfo};
use crate::types::{Hash, Manifest, Platform};

/// Default poll interval between successive `fetch()` calls.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Outcome of one pipeline pass.
pub enum UpdateOutcome {
    /// The running binary already matches the published hash.
    NotNeeded,
    /// A verified replacement binary, byte-equal to the published one.
    Replacement(Vec<u8>),
}

/// Consumer configuration. Everything except the base URL and platform has
/// a working default.
pub struct UpdateConfig {
    /// Base URL of the artifact tree: `http(s)://…` or `file://…`.
    pub base_url: String,
    pub platform: Platform,
    pub templates: TemplateSet,
    /// Armed keyring enables payload decryption and manifest verification.
    pub keyring: Option<KeyringView>,
    /// Sleep between passes; the first pass never sleeps.
    pub interval: Duration,
    pub timeouts: Timeouts,
    pub codec: Arc<dyn DiffCodec>,
    /// Path of the binary to patch. Defaults to the running executable;
    /// overriding it is the test hook.
    pub self_path: Option<PathBuf>,
    /// Overrides the `binary_name` template variable, which otherwise
    /// derives from the self path's file name.
    pub binary_name: Option<String>,
    /// Cancels sleeps, fetches and blocking copies.
    pub cancel: CancellationToken,
}

impl UpdateConfig {
    pub fn new(base_url: impl Into<String>, platform: Platform) -> Self {
        Self {
            base_url: base_url.into(),
            platform,
            templates: TemplateSet::defaults(),
            keyring: None,
            interval: DEFAULT_INTERVAL,
            timeouts: Timeouts::default(),
            codec: Arc::new(ZstdDelta::default()),
            self_path: None,
            binary_name: None,
            cancel: CancellationToken::new(),
        }
    }
}

pub struct UpdatePipeline {
    config: UpdateConfig,
    client: reqwest::Client,
    ran_once: AtomicBool,
}

impl UpdatePipeline {
    pub fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            ran_once: AtomicBool::new(false),
        }
    }

    /// Run one pass of the update state machine.
    ///
    /// The first call starts immediately; every subsequent call sleeps for
    /// the configured interval first. Two passes with no publisher activity
    /// in between are observably identical apart from that sleep.
    pub async fn fetch(&self) -> Result<UpdateOutcome, UpdateError> {
        if self.ran_once.swap(true, Ordering::SeqCst) {
            debug!(interval = ?self.config.interval, "sleeping before poll");
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.config.cancel.cancelled() => return Err(UpdateError::Cancelled),
            }
        }

        let expected = self.fetch_manifest().await?;
        debug!(expected = %expected, "upstream hash");

        let self_path = self.self_path();
        let current = match &self_path {
            Some(path) => match self.hash_self(path).await {
                Ok(hash) => Some(hash),
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(err) => {
                    debug!(%err, "cannot read current binary, patching disabled");
                    None
                }
            },
            None => None,
        };

        if current.as_ref() == Some(&expected) {
            return Ok(UpdateOutcome::NotNeeded);
        }

        if let (Some(path), Some(old)) = (&self_path, &current) {
            match self.try_patch(path, old, &expected).await {
                Ok(replacement) => return Ok(UpdateOutcome::Replacement(replacement)),
                Err(err) if patch_recoverable(&err) => {
                    debug!(%err, "patch path failed, falling back to full download");
                }
                Err(err) => return Err(err),
            }
        }

        let replacement = self.try_full(&expected).await?;
        Ok(UpdateOutcome::Replacement(replacement))
    }

    fn self_path(&self) -> Option<PathBuf> {
        match &self.config.self_path {
            Some(path) => Some(path.clone()),
            None => match std::env::current_exe() {
                Ok(path) => Some(path),
                Err(err) => {
                    debug!(%err, "cannot locate own executable");
                    None
                }
            },
        }
    }

    fn binary_name(&self, self_path: Option<&Path>) -> String {
        if let Some(name) = &self.config.binary_name {
            return name.clone();
        }
        self_path
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    }

    fn armed_keyring(&self) -> Option<&KeyringView> {
        self.config.keyring.as_ref().filter(|k| k.has_keys())
    }

    fn url_info(&self, old_hash: &str, new_hash: &str) -> UrlInfo {
        let mut info = UrlInfo::new(&self.config.platform, self.armed_keyring().is_some());
        info.old_hash = old_hash.to_string();
        info.new_hash = new_hash.to_string();
        info.binary_name = self.binary_name(self.self_path().as_deref());
        info
    }

    fn url_for(&self, kind: TemplateKind, info: &UrlInfo) -> Result<String, UpdateError> {
        let path = self.config.templates.render(kind, info)?;
        Ok(format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path
        ))
    }

    async fn fetch_payload(
        &self,
        url: &str,
        keyring: Option<&KeyringView>,
        deadline: Option<Duration>,
    ) -> Result<Payload, UpdateError> {
        tokio::select! {
            result = fetch::fetch(&self.client, url, keyring, deadline) => {
                result.map_err(UpdateError::from)
            }
            _ = self.config.cancel.cancelled() => Err(UpdateError::Cancelled),
        }
    }

    /// Fetch and validate the manifest, returning the expected hash.
    ///
    /// The manifest itself is never encrypted. When the keyring is armed,
    /// the sibling `.asc` detached signature is fetched (also unencrypted)
    /// and verified over the exact manifest bytes before they are parsed;
    /// signature failures are fatal.
    async fn fetch_manifest(&self) -> Result<Hash, UpdateError> {
        let info = self.url_info("", "");
        let url = self.url_for(TemplateKind::Manifest, &info)?;
        let deadline = self.config.timeouts.manifest_deadline();

        let reader = self.fetch_payload(&url, None, deadline).await?;
        let bytes = self.read_all(reader).await?;

        if let Some(keyring) = self.armed_keyring() {
            let sig_reader = self
                .fetch_payload(&format!("{url}.asc"), None, deadline)
                .await?;
            let sig = self.read_all(sig_reader).await?;
            keyring.verify_detached(&bytes, Cursor::new(sig))?;
        }

        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|err| UpdateError::ManifestMalformed(err.to_string()))?;
        Ok(manifest.sha256)
    }

    async fn hash_self(&self, path: &Path) -> Result<Hash, UpdateError> {
        let path = path.to_path_buf();
        let cancel = self.config.cancel.clone();
        run_blocking(self.config.cancel.clone(), move || {
            let file = std::fs::File::open(&path)?;
            let mut reader = CancelReader::new(file, cancel);
            Ok(Hash::of_reader(&mut reader)?)
        })
        .await
    }

    async fn try_patch(
        &self,
        self_path: &Path,
        old: &Hash,
        expected: &Hash,
    ) -> Result<Vec<u8>, UpdateError> {
        let info = self.url_info(&old.encode(), &expected.encode());
        let url = self.url_for(TemplateKind::Diff, &info)?;
        let deadline = self.config.timeouts.patch_deadline();

        let diff = self
            .fetch_payload(&url, self.armed_keyring(), deadline)
            .await?;

        let codec = Arc::clone(&self.config.codec);
        let path = self_path.to_path_buf();
        let cancel = self.config.cancel.clone();
        let patched = run_blocking(self.config.cancel.clone(), move || {
            let mut old_file = std::fs::File::open(&path)?;
            let mut diff = CancelReader::new(diff, cancel);
            let mut out = Vec::new();
            codec.patch(&mut old_file, &mut out, &mut diff)?;
            Ok(out)
        })
        .await?;

        verify_candidate(patched, expected)
    }

    async fn try_full(&self, expected: &Hash) -> Result<Vec<u8>, UpdateError> {
        let info = self.url_info("", &expected.encode());
        let url = self.url_for(TemplateKind::Blob, &info)?;
        let deadline = self.config.timeouts.full_deadline();

        let blob = self
            .fetch_payload(&url, self.armed_keyring(), deadline)
            .await?;

        let cancel = self.config.cancel.clone();
        let bytes = run_blocking(self.config.cancel.clone(), move || {
            let mut gunzip = GzDecoder::new(CancelReader::new(blob, cancel));
            let mut out = Vec::new();
            gunzip.read_to_end(&mut out)?;
            Ok(out)
        })
        .await?;

        verify_candidate(bytes, expected)
    }

    async fn read_all(&self, reader: Payload) -> Result<Vec<u8>, UpdateError> {
        let cancel = self.config.cancel.clone();
        run_blocking(self.config.cancel.clone(), move || {
            let mut reader = CancelReader::new(reader, cancel);
            let mut out = Vec::new();
            reader.read_to_end(&mut out)?;
            Ok(out)
        })
        .await
    }
}

/// Which patch-path failures push the machine to the full download instead
/// of aborting the pass.
fn patch_recoverable(err: &UpdateError) -> bool {
    matches!(
        err,
        UpdateError::Fetch(_)
            | UpdateError::Decryption(_)
            | UpdateError::HashMismatch { .. }
            | UpdateError::Patch(_)
            | UpdateError::Io(_)
    )
}

fn verify_candidate(bytes: Vec<u8>, expected: &Hash) -> Result<Vec<u8>, UpdateError> {
    let actual = Hash::of(&bytes);
    if actual != *expected {
        return Err(UpdateError::HashMismatch {
            expected: expected.encode(),
            actual: actual.encode(),
        });
    }
    Ok(bytes)
}

/// Run blocking work on the blocking pool, mapping a cancellation observed
/// mid-copy back to `Cancelled`.
async fn run_blocking<T, F>(cancel: CancellationToken, work: F) -> Result<T, UpdateError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, UpdateError> + Send + 'static,
{
    let result = task::spawn_blocking(work)
        .await
        .map_err(|err| UpdateError::Io(io::Error::other(err)))?;
    match result {
        Err(_) if cancel.is_cancelled() => Err(UpdateError::Cancelled),
        other => other,
    }
}

/// Reader adapter that fails fast once the pipeline is cancelled, bounding
/// blocking copies to one chunk after the signal.
struct CancelReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R> CancelReader<R> {
    fn new(inner: R, cancel: CancellationToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancelReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Not `Interrupted`: read_to_end would silently retry it.
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("update cancelled"));
        }
        self.inner.read(buf)
    }
}
