//! Keyring capability views.
//!
//! A keyring is a flat list of OpenPGP certificates. This module carves it
//! into the capabilities the publisher and consumer actually use: the set of
//! encryption recipients, the single signing entity, stream decryption, and
//! detached signature creation/verification. The keyring is "armed" iff it
//! holds at least one usable decryption secret; every encryption decision on
//! both sides keys off that predicate.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use sequoia_openpgp as openpgp;

use openpgp::armor;
use openpgp::cert::{Cert, CertParser};
use openpgp::crypto::{KeyPair, SessionKey};
use openpgp::packet::{PKESK, SKESK};
use openpgp::parse::stream::{
    DecryptionHelper, DecryptorBuilder, DetachedVerifierBuilder, MessageLayer, MessageStructure,
    VerificationHelper,
};
use openpgp::parse::Parse;
use openpgp::policy::StandardPolicy;
use openpgp::serialize::stream::{Armorer, Encryptor2, LiteralWriter, Message, Recipient, Signer};
use openpgp::types::{DataFormat, SymmetricAlgorithm};
use openpgp::KeyHandle;
use thiserror::Error;

const POLICY: &StandardPolicy = &StandardPolicy::new();

#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("failed to parse keyring: {0}")]
    Parse(String),

    #[error("keyring has no usable secret key for this operation")]
    NoSecretKey,

    #[error("keyring has no encryption recipients")]
    NoRecipients,

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Metadata recorded in the literal packet of an encrypted blob. The
/// filename deliberately names the payload *without* its `.gpg` suffix.
#[derive(Debug, Clone)]
pub struct FileHints<'a> {
    pub filename: &'a str,
    pub mtime: Option<SystemTime>,
}

/// A keyring presented as two disjoint capability sets: encryption-target
/// public keys and a single signing entity.
pub struct KeyringView {
    certs: Vec<Cert>,
}

impl KeyringView {
    pub fn from_certs(certs: Vec<Cert>) -> Self {
        Self { certs }
    }

    /// Parse an armored keyring, possibly holding several concatenated
    /// certificates.
    pub fn from_reader<R: Read + Send + Sync>(reader: R) -> Result<Self, KeyringError> {
        let certs = CertParser::from_reader(reader)
            .map_err(|e| KeyringError::Parse(e.to_string()))?
            .collect::<openpgp::Result<Vec<Cert>>>()
            .map_err(|e| KeyringError::Parse(e.to_string()))?;
        Ok(Self::from_certs(certs))
    }

    pub fn from_file(path: &Path) -> Result<Self, KeyringError> {
        Self::from_reader(File::open(path)?)
    }

    pub fn certs(&self) -> &[Cert] {
        &self.certs
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Whether the keyring is armed: it holds at least one unlocked secret
    /// key capable of decryption.
    pub fn has_keys(&self) -> bool {
        self.certs.iter().any(Self::decryption_capable)
    }

    fn decryption_capable(cert: &Cert) -> bool {
        cert.keys()
            .with_policy(POLICY, None)
            .secret()
            .for_transport_encryption()
            .for_storage_encryption()
            .any(|ka| !ka.key().secret().is_encrypted())
    }

    /// The entity whose key signs the manifest and the encrypted blobs.
    ///
    /// Selection partitions the keyring by role: if any certificate carries
    /// no decryption-capable secret material, the first such certificate is
    /// the signer (in a publisher+consumer keyring, the publisher); when
    /// every certificate can decrypt, the first one signs.
    pub fn signer(&self) -> Option<&Cert> {
        self.certs
            .iter()
            .find(|cert| !Self::decryption_capable(cert))
            .or_else(|| self.certs.first())
    }

    /// Every encryption-capable public subkey across the keyring. Each
    /// certificate with such a subkey becomes an encryption target.
    pub fn encryption_recipients(&self) -> Vec<Recipient<'_>> {
        let mut recipients = Vec::new();
        for cert in &self.certs {
            for ka in cert
                .keys()
                .with_policy(POLICY, None)
                .supported()
                .alive()
                .revoked(false)
                .for_transport_encryption()
                .for_storage_encryption()
            {
                recipients.push(ka.into());
            }
        }
        recipients
    }

    /// Resolve the signer's secret signing key. Locked secrets are treated
    /// as unusable: there is no passphrase prompt anywhere in the system.
    pub fn signing_keypair(&self) -> Result<KeyPair, KeyringError> {
        let cert = self.signer().ok_or(KeyringError::NoSecretKey)?;
        let ka = cert
            .keys()
            .with_policy(POLICY, None)
            .secret()
            .for_signing()
            .find(|ka| !ka.key().secret().is_encrypted())
            .ok_or(KeyringError::NoSecretKey)?;
        ka.key()
            .clone()
            .into_keypair()
            .map_err(|e| KeyringError::Signing(e.to_string()))
    }

    fn decryption_keypairs(&self) -> Result<Vec<KeyPair>, KeyringError> {
        let mut keys = Vec::new();
        for cert in &self.certs {
            for ka in cert
                .keys()
                .with_policy(POLICY, None)
                .secret()
                .for_transport_encryption()
                .for_storage_encryption()
            {
                if ka.key().secret().is_encrypted() {
                    continue;
                }
                if let Ok(pair) = ka.key().clone().into_keypair() {
                    keys.push(pair);
                }
            }
        }
        if keys.is_empty() {
            return Err(KeyringError::NoSecretKey);
        }
        Ok(keys)
    }

    /// Wrap a ciphertext stream in a decryptor, returning a plaintext
    /// reader. Embedded signatures are NOT verified here; the content hash
    /// bound by the manifest is the integrity boundary.
    pub fn decrypt<R>(&self, source: R) -> Result<Box<dyn Read + Send>, KeyringError>
    where
        R: Read + Send + Sync + 'static,
    {
        let helper = DecryptHelper {
            keys: self.decryption_keypairs()?,
            certs: self.certs.clone(),
        };
        let decryptor = DecryptorBuilder::from_reader(source)
            .map_err(|e| KeyringError::Decryption(e.to_string()))?
            .with_policy(POLICY, None, helper)
            .map_err(|e| KeyringError::Decryption(e.to_string()))?;
        Ok(Box::new(decryptor))
    }

    /// Verify an armored detached signature over `message` against the
    /// keyring. Any failure, including a structurally valid signature from a
    /// key outside the keyring, is `SignatureInvalid`.
    pub fn verify_detached<R>(&self, message: &[u8], signature: R) -> Result<(), KeyringError>
    where
        R: Read + Send + Sync + 'static,
    {
        let helper = VerifyHelper {
            certs: self.certs.clone(),
        };
        let mut verifier = DetachedVerifierBuilder::from_reader(signature)
            .map_err(|e| KeyringError::SignatureInvalid(e.to_string()))?
            .with_policy(POLICY, None, helper)
            .map_err(|e| KeyringError::SignatureInvalid(e.to_string()))?;
        verifier
            .verify_bytes(message)
            .map_err(|e| KeyringError::SignatureInvalid(e.to_string()))
    }

    /// Write an armored detached signature over `message` into `sink`,
    /// using the signer entity's secret key.
    pub fn sign_detached<W>(&self, message: &[u8], sink: W) -> Result<(), KeyringError>
    where
        W: Write + Send + Sync,
    {
        let keypair = self.signing_keypair()?;
        let sig = Message::new(sink);
        let sig = Armorer::new(sig)
            .kind(armor::Kind::Signature)
            .build()
            .map_err(|e| KeyringError::Signing(e.to_string()))?;
        let mut sig = Signer::new(sig, keypair)
            .detached()
            .build()
            .map_err(|e| KeyringError::Signing(e.to_string()))?;
        sig.write_all(message)?;
        sig.finalize()
            .map_err(|e| KeyringError::Signing(e.to_string()))?;
        Ok(())
    }

    /// Build the layered writer for an encrypted blob: encryptor for every
    /// recipient, then the signer, then a binary literal packet carrying
    /// `hints`. No compression layer is added; the payload is already
    /// gzipped and a second pass only hurts determinism.
    ///
    /// Bytes written to the returned message are encrypted into `sink`;
    /// callers must `finalize()` it after the copy.
    pub fn encrypt_writer<'a, W>(
        &'a self,
        sink: W,
        hints: FileHints<'_>,
    ) -> Result<Message<'a>, KeyringError>
    where
        W: Write + Send + Sync + 'a,
    {
        let recipients = self.encryption_recipients();
        if recipients.is_empty() {
            return Err(KeyringError::NoRecipients);
        }
        let keypair = self.signing_keypair()?;

        let message = Message::new(sink);
        let message = Encryptor2::for_recipients(message, recipients)
            .symmetric_algo(SymmetricAlgorithm::AES256)
            .build()
            .map_err(|e| KeyringError::Encryption(e.to_string()))?;
        let message = Signer::new(message, keypair)
            .build()
            .map_err(|e| KeyringError::Encryption(e.to_string()))?;
        let literal = LiteralWriter::new(message).format(DataFormat::Binary);
        let literal = literal
            .filename(hints.filename)
            .map_err(|e| KeyringError::Encryption(e.to_string()))?;
        let literal = match hints.mtime {
            Some(mtime) => literal
                .date(mtime)
                .map_err(|e| KeyringError::Encryption(e.to_string()))?,
            None => literal,
        };
        literal
            .build()
            .map_err(|e| KeyringError::Encryption(e.to_string()))
    }
}

struct DecryptHelper {
    keys: Vec<KeyPair>,
    certs: Vec<Cert>,
}

impl VerificationHelper for DecryptHelper {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, _structure: MessageStructure) -> openpgp::Result<()> {
        // Embedded signatures are not the integrity boundary; the content
        // hash bound by the manifest is.
        Ok(())
    }
}

impl DecryptionHelper for DecryptHelper {
    fn decrypt<D>(
        &mut self,
        pkesks: &[PKESK],
        _skesks: &[SKESK],
        sym_algo: Option<SymmetricAlgorithm>,
        mut decrypt: D,
    ) -> openpgp::Result<Option<openpgp::Fingerprint>>
    where
        D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
    {
        for pkesk in pkesks {
            for pair in self.keys.iter_mut() {
                if let Some((algo, session_key)) = pkesk.decrypt(pair, sym_algo) {
                    if decrypt(algo, &session_key) {
                        return Ok(None);
                    }
                }
            }
        }
        Err(anyhow::anyhow!("no usable decryption key for this message"))
    }
}

struct VerifyHelper {
    certs: Vec<Cert>,
}

impl VerificationHelper for VerifyHelper {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure.into_iter() {
            if let MessageLayer::SignatureGroup { results } = layer {
                if results.into_iter().any(|result| result.is_ok()) {
                    return Ok(());
                }
            }
        }
        Err(anyhow::anyhow!("no valid signature from the keyring"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openpgp::cert::CertBuilder;

    fn publisher_cert() -> Cert {
        let (cert, _) = CertBuilder::new()
            .add_userid("Publisher (test) <publisher@example.com>")
            .add_signing_subkey()
            .add_transport_encryption_subkey()
            .generate()
            .expect("generate publisher cert");
        cert
    }

    fn consumer_cert() -> Cert {
        let (cert, _) = CertBuilder::new()
            .add_userid("Consumer (test) <consumer@example.com>")
            .add_transport_encryption_subkey()
            .generate()
            .expect("generate consumer cert");
        cert
    }

    #[test]
    fn empty_keyring_is_unarmed() {
        let keyring = KeyringView::from_certs(Vec::new());
        assert!(!keyring.has_keys());
        assert!(keyring.signer().is_none());
    }

    #[test]
    fn public_only_keyring_is_unarmed() {
        let keyring =
            KeyringView::from_certs(vec![publisher_cert().strip_secret_key_material()]);
        assert!(!keyring.has_keys());
    }

    #[test]
    fn secret_keyring_is_armed() {
        let keyring = KeyringView::from_certs(vec![publisher_cert(), consumer_cert()]);
        assert!(keyring.has_keys());
    }

    #[test]
    fn recipients_cover_every_encryption_subkey() {
        let keyring = KeyringView::from_certs(vec![publisher_cert(), consumer_cert()]);
        assert_eq!(keyring.encryption_recipients().len(), 2);
    }

    #[test]
    fn signer_prefers_non_decryption_entity() {
        // Consumer-side keyring: the publisher half is public only, the
        // consumer half can decrypt. The publisher must be the signer.
        let publisher = publisher_cert().strip_secret_key_material();
        let fingerprint = publisher.fingerprint();
        let keyring = KeyringView::from_certs(vec![consumer_cert(), publisher]);
        assert_eq!(keyring.signer().unwrap().fingerprint(), fingerprint);
    }

    #[test]
    fn signer_falls_back_to_first_entity() {
        let publisher = publisher_cert();
        let fingerprint = publisher.fingerprint();
        let keyring = KeyringView::from_certs(vec![publisher, consumer_cert()]);
        assert_eq!(keyring.signer().unwrap().fingerprint(), fingerprint);
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let keyring = KeyringView::from_certs(vec![publisher_cert(), consumer_cert()]);
        let plaintext = b"This is a nice test message.";

        let mut ciphertext = Vec::new();
        let mut message = keyring
            .encrypt_writer(
                &mut ciphertext,
                FileHints {
                    filename: "test",
                    mtime: Some(SystemTime::now()),
                },
            )
            .expect("build encryptor");
        message.write_all(plaintext).unwrap();
        message.finalize().expect("finalize message");

        let mut plain = keyring
            .decrypt(io::Cursor::new(ciphertext))
            .expect("build decryptor");
        let mut out = Vec::new();
        plain.read_to_end(&mut out).expect("read plaintext");
        assert_eq!(out, plaintext);
    }

    #[test]
    fn decrypt_garbage_fails() {
        let keyring = KeyringView::from_certs(vec![publisher_cert(), consumer_cert()]);
        let mut result = Vec::new();
        let outcome = keyring
            .decrypt(io::Cursor::new(b"definitely not pgp".to_vec()))
            .and_then(|mut r| {
                r.read_to_end(&mut result)?;
                Ok(())
            });
        assert!(outcome.is_err());
    }

    #[test]
    fn detached_signature_roundtrip() {
        let keyring = KeyringView::from_certs(vec![publisher_cert(), consumer_cert()]);
        let message = b"{\"Sha256\":\"AAAA\"}";

        let mut sig = Vec::new();
        keyring.sign_detached(message, &mut sig).expect("sign");
        keyring
            .verify_detached(message, io::Cursor::new(sig.clone()))
            .expect("verify");

        let mut tampered = message.to_vec();
        tampered[0] ^= 0x01;
        assert!(matches!(
            keyring.verify_detached(&tampered, io::Cursor::new(sig)),
            Err(KeyringError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn foreign_signature_is_invalid() {
        let signer_ring = KeyringView::from_certs(vec![publisher_cert()]);
        let verifier_ring = KeyringView::from_certs(vec![consumer_cert()]);
        let message = b"payload";

        let mut sig = Vec::new();
        signer_ring.sign_detached(message, &mut sig).expect("sign");
        assert!(matches!(
            verifier_ring.verify_detached(message, io::Cursor::new(sig)),
            Err(KeyringError::SignatureInvalid(_))
        ));
    }
}
