//! Publisher: build the content-addressed artifact tree for a new binary.
//!
//! One publish writes three artifact families under the output root: the
//! compressed (optionally encrypted) full blob, the manifest with its
//! optional detached signature, and one binary delta per previously
//! published binary found next to the new blob. Deltas are computed over
//! plaintext uncompressed binaries, never over gzip or PGP envelopes, so
//! old blobs are opened through the same decrypt+gunzip path the consumer
//! uses.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::io::delta::DiffCodec;
use crate::keyring::{FileHints, KeyringView};
use crate::ops::error::BuildError;
use crate::templates::{TemplateKind, TemplateSet, UrlInfo};
use crate::types::{Hash, Manifest, Platform};

pub struct ArtifactBuilder<'a> {
    templates: &'a TemplateSet,
    codec: &'a dyn DiffCodec,
    keyring: Option<&'a KeyringView>,
}

impl<'a> ArtifactBuilder<'a> {
    pub fn new(
        templates: &'a TemplateSet,
        codec: &'a dyn DiffCodec,
        keyring: Option<&'a KeyringView>,
    ) -> Self {
        Self {
            templates,
            codec,
            keyring,
        }
    }

    fn armed_keyring(&self) -> Option<&'a KeyringView> {
        self.keyring.filter(|k| k.has_keys())
    }

    /// Publish the binary at `source` for `platform` under `output_root`.
    ///
    /// The builder is stateless between invocations: it never reads its own
    /// prior manifests, only the blob files present on disk. Re-publishing
    /// an identical binary overwrites its artifacts in place.
    pub fn publish(
        &self,
        source: &Path,
        platform: &Platform,
        output_root: &Path,
    ) -> Result<Hash, BuildError> {
        let keyring = self.armed_keyring();

        let mut src = File::open(source)?;
        let new_hash = Hash::of_reader(&mut src)?;
        src.seek(SeekFrom::Start(0))?;
        let mtime = src.metadata().ok().and_then(|m| m.modified().ok());

        let mut info = UrlInfo::new(platform, keyring.is_some());
        info.new_hash = new_hash.encode();
        info.binary_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let blob_rel = self.templates.render(TemplateKind::Blob, &info)?;
        // The literal packet records the path as it would be named without
        // encryption; interoperating decryptors surface it as the filename.
        let hint_name = if keyring.is_some() {
            let mut plain = info.clone();
            plain.is_encrypted = false;
            self.templates.render(TemplateKind::Blob, &plain)?
        } else {
            blob_rel.clone()
        };

        let blob_path = output_root.join(&blob_rel);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(blob = %blob_path.display(), "writing blob");
        self.write_blob(&mut src, &blob_path, &hint_name, mtime, keyring)?;

        self.write_manifest(&info, &new_hash, output_root, keyring)?;

        self.generate_diffs(&blob_path, &info, output_root, keyring)?;

        Ok(new_hash)
    }

    /// Stream the source binary through gzip (and the PGP envelope when the
    /// keyring is armed) into the blob file. Layers close in inverse order.
    fn write_blob(
        &self,
        src: &mut File,
        blob_path: &Path,
        hint_name: &str,
        mtime: Option<SystemTime>,
        keyring: Option<&KeyringView>,
    ) -> Result<(), BuildError> {
        let file = File::create(blob_path)?;
        match keyring {
            Some(keyring) => {
                let message = keyring.encrypt_writer(
                    file,
                    FileHints {
                        filename: hint_name,
                        mtime,
                    },
                )?;
                let mut gz = GzEncoder::new(message, Compression::default());
                io::copy(src, &mut gz)?;
                let message = gz.finish()?;
                message
                    .finalize()
                    .map_err(|e| BuildError::Keyring(crate::keyring::KeyringError::Encryption(
                        e.to_string(),
                    )))?;
            }
            None => {
                let mut gz = GzEncoder::new(file, Compression::default());
                io::copy(src, &mut gz)?;
                gz.finish()?;
            }
        }
        Ok(())
    }

    /// Write the manifest, and its armored detached signature when signing
    /// is enabled. The signature covers the exact bytes written to disk.
    fn write_manifest(
        &self,
        info: &UrlInfo,
        new_hash: &Hash,
        output_root: &Path,
        keyring: Option<&KeyringView>,
    ) -> Result<(), BuildError> {
        let manifest_rel = {
            let mut info = info.clone();
            info.old_hash.clear();
            info.new_hash.clear();
            self.templates.render(TemplateKind::Manifest, &info)?
        };
        let manifest_path = output_root.join(&manifest_rel);
        if let Some(parent) = manifest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manifest_bytes = serde_json::to_vec(&Manifest::new(*new_hash))?;
        info!(manifest = %manifest_path.display(), "writing manifest");
        fs::write(&manifest_path, &manifest_bytes)?;

        if let Some(keyring) = keyring {
            let sig_path = sibling_signature_path(&manifest_path);
            debug!(signature = %sig_path.display(), "signing manifest");
            let sig_file = File::create(&sig_path)?;
            keyring.sign_detached(&manifest_bytes, sig_file)?;
        }
        Ok(())
    }

    /// Regenerate the delta family: one diff per sibling blob, keyed by the
    /// old hash recovered from the sibling's file name. Old blobs that fail
    /// to open are skipped; consumers on that version simply take the full
    /// path on their next update. Diff write failures abort the publish.
    fn generate_diffs(
        &self,
        blob_path: &Path,
        info: &UrlInfo,
        output_root: &Path,
        keyring: Option<&KeyringView>,
    ) -> Result<(), BuildError> {
        let blob_dir = match blob_path.parent() {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let blob_name = blob_path.file_name().unwrap_or_default().to_os_string();

        for entry in fs::read_dir(blob_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if entry.file_name() == blob_name {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let old_hash = old_hash_from_name(&name, keyring.is_some());

            let mut diff_info = info.clone();
            diff_info.old_hash = old_hash;
            let diff_rel = self.templates.render(TemplateKind::Diff, &diff_info)?;
            let diff_path = output_root.join(&diff_rel);
            let diff_hint = if keyring.is_some() {
                let mut plain = diff_info.clone();
                plain.is_encrypted = false;
                self.templates.render(TemplateKind::Diff, &plain)?
            } else {
                diff_rel.clone()
            };

            let mut old_plain = match self.open_blob(&entry.path(), keyring) {
                Ok(reader) => reader,
                Err(err) => {
                    warn!(old = %entry.path().display(), %err, "skipping unreadable old blob");
                    continue;
                }
            };
            let mut new_plain = self.open_blob(blob_path, keyring)?;

            if let Some(parent) = diff_path.parent() {
                remove_regular_files(parent)?;
                fs::create_dir_all(parent)?;
            }

            debug!(diff = %diff_path.display(), "writing delta");
            match keyring {
                Some(keyring) => {
                    // Diffs travel under the same envelope as blobs; the
                    // delta inside still covers plaintext binaries.
                    let mut message = keyring.encrypt_writer(
                        File::create(&diff_path)?,
                        FileHints {
                            filename: &diff_hint,
                            mtime: None,
                        },
                    )?;
                    self.codec
                        .diff(&mut old_plain, &mut new_plain, &mut message)
                        .map_err(|source| BuildError::Delta { old: name, source })?;
                    message.finalize().map_err(|e| {
                        BuildError::Keyring(crate::keyring::KeyringError::Encryption(
                            e.to_string(),
                        ))
                    })?;
                }
                None => {
                    let mut sink = File::create(&diff_path)?;
                    self.codec
                        .diff(&mut old_plain, &mut new_plain, &mut sink)
                        .map_err(|source| BuildError::Delta { old: name, source })?;
                }
            }
        }
        Ok(())
    }

    /// Open a blob the way the consumer does: decrypt when the keyring is
    /// armed, then gunzip. Deltas are always taken over plaintext.
    fn open_blob(
        &self,
        path: &Path,
        keyring: Option<&KeyringView>,
    ) -> Result<Box<dyn Read + Send>, BuildError> {
        let file = File::open(path)?;
        let plain: Box<dyn Read + Send> = match keyring {
            Some(keyring) => keyring.decrypt(file)?,
            None => Box::new(file),
        };
        Ok(Box::new(GzDecoder::new(plain)))
    }
}

/// `<manifest-path>.asc`, appending to whatever extension the manifest has.
fn sibling_signature_path(manifest_path: &Path) -> PathBuf {
    let mut path = manifest_path.as_os_str().to_os_string();
    path.push(".asc");
    PathBuf::from(path)
}

/// Recover the old hash from a sibling blob's file name: strip the `.gpg`
/// suffix when encrypting, then the final extension.
fn old_hash_from_name(name: &str, encrypted: bool) -> String {
    let name = if encrypted {
        name.strip_suffix(".gpg").unwrap_or(name)
    } else {
        name
    };
    match name.rfind('.') {
        Some(dot) => name[..dot].to_string(),
        None => name.to_string(),
    }
}

/// Delete the regular files of `path`, leaving subdirectories alone. A
/// missing directory is fine.
fn remove_regular_files(path: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            debug!(stale = %entry.path().display(), "removing stale delta");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_hash_strips_extension() {
        assert_eq!(old_hash_from_name("abc123=.gz", false), "abc123=");
        assert_eq!(old_hash_from_name("abc123=", false), "abc123=");
    }

    #[test]
    fn old_hash_strips_gpg_then_extension() {
        assert_eq!(old_hash_from_name("abc123=.gz.gpg", true), "abc123=");
        // Without encryption the .gpg suffix is treated as the extension.
        assert_eq!(old_hash_from_name("abc123=.gz.gpg", false), "abc123=.gz");
    }

    #[test]
    fn signature_path_appends_suffix() {
        assert_eq!(
            sibling_signature_path(Path::new("out/linux_amd64.json")),
            Path::new("out/linux_amd64.json.asc")
        );
    }
}
