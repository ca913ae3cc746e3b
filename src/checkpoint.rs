//! The checkpoint note format and the publisher that periodically commits
//! the integrator's progress to a signed, human-readable checkpoint object.
//!
//! A checkpoint is a tlog-checkpoint-style signed note: an origin line, a
//! decimal size, a base-64 root hash, optional extension lines, a blank
//! line, then one or more `— <keyname> <base64(keyhash||sig)>` signature
//! lines. It is the only object this crate writes unconditionally — every
//! other object (tiles, entry bundles) is content-addressed and
//! conditionally written.

use crate::error::{Result, TesseraError};
use crate::path;
use crate::sequencer::Sequencer;
use crate::storage::traits::{CoordinatorStore, ObjectStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const SIGNATURE_MARKER: &str = "\u{2014} ";

/// Signing errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Signs checkpoint bodies. A trait so the publisher does not depend on a
/// specific signing scheme; the default implementation is Ed25519, as the
/// tlog-checkpoint note format expects.
pub trait Signer: Send + Sync {
    /// The note key name embedded in each signature line.
    fn key_name(&self) -> &str;

    /// The raw 32-byte Ed25519 public key.
    fn public_key(&self) -> [u8; 32];

    /// Sign `message` (the checkpoint body, including its trailing
    /// newline) and return the raw 64-byte Ed25519 signature.
    fn sign(&self, message: &[u8]) -> std::result::Result<[u8; 64], SignerError>;
}

/// Ed25519 checkpoint signer.
pub struct Ed25519Signer {
    key_name: String,
    signing_key: ed25519_dalek::SigningKey,
}

impl Ed25519Signer {
    pub fn new(key_name: impl Into<String>, signing_key: ed25519_dalek::SigningKey) -> Self {
        Self {
            key_name: key_name.into(),
            signing_key,
        }
    }

    /// Build from a hex-encoded 32-byte Ed25519 seed, as loaded from
    /// [`crate::config::TesseraConfig::signing_key`].
    pub fn from_hex_seed(key_name: impl Into<String>, hex_seed: &str) -> std::result::Result<Self, SignerError> {
        let bytes = hex::decode(hex_seed).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignerError::InvalidKey("seed must be exactly 32 bytes".to_string()))?;
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
        Ok(Self::new(key_name, signing_key))
    }
}

impl Signer for Ed25519Signer {
    fn key_name(&self) -> &str {
        &self.key_name
    }

    fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    fn sign(&self, message: &[u8]) -> std::result::Result<[u8; 64], SignerError> {
        use ed25519_dalek::Signer as _;
        Ok(self.signing_key.sign(message).to_bytes())
    }
}

/// The first four bytes of `SHA-256(key_name || '\n' || public_key)`,
/// embedded in each signature line so a verifier can match a signature to
/// the key that produced it without trying every configured key.
pub fn key_hash(key_name: &str, public_key: &[u8; 32]) -> [u8; 4] {
    let mut hasher = Sha256::new();
    hasher.update(key_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(public_key);
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A single `— <keyname> <base64(keyhash||sig)>` signature line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureLine {
    pub key_name: String,
    pub key_hash: [u8; 4],
    pub signature: [u8; 64],
}

impl SignatureLine {
    pub fn new(key_name: impl Into<String>, key_hash: [u8; 4], signature: [u8; 64]) -> Self {
        Self {
            key_name: key_name.into(),
            key_hash,
            signature,
        }
    }

    fn format(&self) -> String {
        let mut blob = Vec::with_capacity(4 + 64);
        blob.extend_from_slice(&self.key_hash);
        blob.extend_from_slice(&self.signature);
        format!("{}{} {}", SIGNATURE_MARKER, self.key_name, BASE64.encode(blob))
    }

    fn parse(line: &str) -> Result<Self> {
        let rest = line
            .strip_prefix(SIGNATURE_MARKER)
            .ok_or_else(|| TesseraError::checkpoint("signature line missing '\u{2014} ' marker"))?;
        let (key_name, encoded) = rest
            .split_once(' ')
            .ok_or_else(|| TesseraError::checkpoint("signature line missing base64 payload"))?;
        let blob = BASE64
            .decode(encoded)
            .map_err(|e| TesseraError::checkpoint(format!("invalid base64 in signature line: {}", e)))?;
        if blob.len() != 4 + 64 {
            return Err(TesseraError::checkpoint(format!(
                "signature payload is {} bytes, expected {}",
                blob.len(),
                4 + 64
            )));
        }
        let mut key_hash = [0u8; 4];
        key_hash.copy_from_slice(&blob[0..4]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&blob[4..68]);
        Ok(Self {
            key_name: key_name.to_string(),
            key_hash,
            signature,
        })
    }
}

/// A tlog-checkpoint-style signed note.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub origin: String,
    pub size: u64,
    pub root_hash: [u8; 32],
    pub extensions: Vec<String>,
    pub signatures: Vec<SignatureLine>,
}

impl Checkpoint {
    /// A freshly formatted, unsigned checkpoint. Callers must add at least
    /// one signature line before [`Checkpoint::format`] produces a valid
    /// note.
    pub fn unsigned(origin: impl Into<String>, size: u64, root_hash: [u8; 32]) -> Self {
        Self {
            origin: origin.into(),
            size,
            root_hash,
            extensions: Vec::new(),
            signatures: Vec::new(),
        }
    }

    pub fn add_signature(&mut self, line: SignatureLine) {
        self.signatures.push(line);
    }

    /// The signed body: origin, size, base-64 root, extension lines, each
    /// newline-terminated. This is exactly the byte string a [`Signer`]
    /// signs and a verifier checks against.
    pub fn signed_body(&self) -> String {
        let mut body = format!("{}\n{}\n{}\n", self.origin, self.size, BASE64.encode(self.root_hash));
        for ext in &self.extensions {
            body.push_str(ext);
            body.push('\n');
        }
        body
    }

    /// The full note text: signed body, a blank line, then one signature
    /// line per entry in [`Checkpoint::signatures`].
    pub fn format(&self) -> String {
        let mut out = self.signed_body();
        out.push('\n');
        for sig in &self.signatures {
            out.push_str(&sig.format());
            out.push('\n');
        }
        out
    }

    /// Parse a full checkpoint note back into its structured form. Does
    /// not verify any signature; see [`crate::witness::verify_signature_line`]
    /// for that.
    pub fn parse(text: &str) -> Result<Self> {
        let (body, sig_block) = text
            .split_once("\n\n")
            .ok_or_else(|| TesseraError::checkpoint("missing blank line separating body from signatures"))?;

        let mut lines = body.split('\n');
        let origin = lines
            .next()
            .ok_or_else(|| TesseraError::checkpoint("missing origin line"))?
            .to_string();
        let size: u64 = lines
            .next()
            .ok_or_else(|| TesseraError::checkpoint("missing size line"))?
            .parse()
            .map_err(|_| TesseraError::checkpoint("size line is not a decimal integer"))?;
        let root_b64 = lines.next().ok_or_else(|| TesseraError::checkpoint("missing root hash line"))?;
        let root_bytes = BASE64
            .decode(root_b64)
            .map_err(|e| TesseraError::checkpoint(format!("invalid base64 root hash: {}", e)))?;
        let root_hash: [u8; 32] = root_bytes
            .try_into()
            .map_err(|_| TesseraError::checkpoint("root hash is not 32 bytes"))?;
        let extensions: Vec<String> = lines.map(|s| s.to_string()).collect();

        let signatures = sig_block
            .split('\n')
            .filter(|l| !l.is_empty())
            .map(SignatureLine::parse)
            .collect::<Result<Vec<_>>>()?;
        if signatures.is_empty() {
            return Err(TesseraError::checkpoint("checkpoint has no signature lines"));
        }

        Ok(Self {
            origin,
            size,
            root_hash,
            extensions,
            signatures,
        })
    }
}

/// Periodically reads the sequencer's integrated tree, signs it (and, if
/// configured, co-signs it through a [`crate::witness::WitnessGateway`]),
/// and writes the result to the fixed checkpoint path.
pub struct CheckpointPublisher<C: CoordinatorStore, O: ObjectStore> {
    sequencer: Arc<Sequencer<C>>,
    object_store: Arc<O>,
    signer: Arc<dyn Signer>,
    origin: String,
    interval: Duration,
    min_staleness: Duration,
    witness_gateway: Option<Arc<crate::witness::WitnessGateway<O>>>,
}

impl<C: CoordinatorStore, O: ObjectStore> CheckpointPublisher<C, O> {
    /// `interval` is clamped to a minimum of 1 second to avoid hammering
    /// the object store.
    pub fn new(
        sequencer: Arc<Sequencer<C>>,
        object_store: Arc<O>,
        signer: Arc<dyn Signer>,
        origin: impl Into<String>,
        interval: Duration,
        min_staleness: Duration,
        witness_gateway: Option<Arc<crate::witness::WitnessGateway<O>>>,
    ) -> Self {
        Self {
            sequencer,
            object_store,
            signer,
            origin: origin.into(),
            interval: interval.max(Duration::from_secs(1)),
            min_staleness,
            witness_gateway,
        }
    }

    /// Run the publish loop forever, logging and continuing past any
    /// single tick's failure.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            match self.publish_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(target: "tessera::checkpoint", "skipped publish tick: checkpoint is fresh");
                }
                Err(e) => {
                    crate::logging::log_checkpoint(0, false, Some(&e.to_string()));
                }
            }
        }
    }

    /// Run a single publish attempt. Returns `Ok(false)` if the tick was
    /// skipped because the existing checkpoint is still fresh, `Ok(true)`
    /// if a new checkpoint was written.
    pub async fn publish_once(&self) -> Result<bool> {
        let (size, root) = self.sequencer.current_tree().await?;

        let last_modified = self.object_store.get_last_modified(path::checkpoint_path()).await?;
        if let Some(last_modified) = last_modified {
            let age = std::time::SystemTime::now()
                .duration_since(last_modified)
                .unwrap_or(Duration::ZERO);
            if age < self.min_staleness {
                return Ok(false);
            }
        }

        let mut checkpoint = Checkpoint::unsigned(self.origin.clone(), size, root);
        let signature = self
            .signer
            .sign(checkpoint.signed_body().as_bytes())
            .map_err(|e| TesseraError::checkpoint(e.to_string()))?;
        checkpoint.add_signature(SignatureLine::new(
            self.signer.key_name().to_string(),
            key_hash(self.signer.key_name(), &self.signer.public_key()),
            signature,
        ));

        let checkpoint = if let Some(gateway) = &self.witness_gateway {
            gateway.witness(checkpoint).await?
        } else {
            checkpoint
        };

        self.object_store
            .set(path::checkpoint_path(), checkpoint.format().into_bytes())
            .await?;
        crate::logging::log_checkpoint(size, true, None);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{MemoryCoordinatorStore, MemoryObjectStore};
    use rand::rngs::OsRng;

    fn test_signer(name: &str) -> Ed25519Signer {
        let signing_key = ed25519_dalek::SigningKey::generate(&mut OsRng);
        Ed25519Signer::new(name, signing_key)
    }

    #[test]
    fn test_checkpoint_round_trips_through_format_and_parse() {
        let signer = test_signer("test-origin");
        let mut cp = Checkpoint::unsigned("T/test", 5, [7u8; 32]);
        let sig = signer.sign(cp.signed_body().as_bytes()).unwrap();
        cp.add_signature(SignatureLine::new(
            signer.key_name().to_string(),
            key_hash(signer.key_name(), &signer.public_key()),
            sig,
        ));

        let text = cp.format();
        let parsed = Checkpoint::parse(&text).unwrap();
        assert_eq!(parsed, cp);
    }

    #[test]
    fn test_scenario_s1_checkpoint_shape() {
        let signer = test_signer("T/test");
        let mut cp = Checkpoint::unsigned("T/test", 1, crate::entry::default_leaf_hash(b"hello"));
        let sig = signer.sign(cp.signed_body().as_bytes()).unwrap();
        cp.add_signature(SignatureLine::new(
            signer.key_name().to_string(),
            key_hash(signer.key_name(), &signer.public_key()),
            sig,
        ));
        let text = cp.format();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("T/test"));
        assert_eq!(lines.next(), Some("1"));
    }

    #[test]
    fn test_parse_rejects_missing_blank_line() {
        assert!(Checkpoint::parse("T/test\n1\nroot").is_err());
    }

    #[test]
    fn test_parse_rejects_truncated_signature_payload() {
        let malformed = "T/test\n1\nAAAA\n\n\u{2014} k AAAA\n";
        assert!(Checkpoint::parse(malformed).is_err());
    }

    #[tokio::test]
    async fn test_publisher_self_initializes_empty_log() {
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sequencer = Arc::new(Sequencer::new(coordinator, 100));
        let signer: Arc<dyn Signer> = Arc::new(test_signer("T/test"));

        let publisher = CheckpointPublisher::new(
            sequencer,
            Arc::clone(&objects),
            signer,
            "T/test",
            Duration::from_secs(1),
            Duration::from_secs(0),
            None,
        );

        assert!(publisher.publish_once().await.unwrap());
        let bytes = objects.get(path::checkpoint_path()).await.unwrap().unwrap();
        let parsed = Checkpoint::parse(&String::from_utf8(bytes).unwrap()).unwrap();
        assert_eq!(parsed.size, 0);
    }

    #[tokio::test]
    async fn test_publisher_skips_when_fresher_than_min_staleness() {
        let coordinator = Arc::new(MemoryCoordinatorStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let sequencer = Arc::new(Sequencer::new(coordinator, 100));
        let signer: Arc<dyn Signer> = Arc::new(test_signer("T/test"));

        let publisher = CheckpointPublisher::new(
            sequencer,
            objects,
            signer,
            "T/test",
            Duration::from_secs(1),
            Duration::from_secs(3600),
            None,
        );

        assert!(publisher.publish_once().await.unwrap());
        assert!(!publisher.publish_once().await.unwrap());
    }
}
