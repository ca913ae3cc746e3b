//! Environment-based configuration for a tessera log instance.
//!
//! # Required / optional environment variables
//!
//! ## Storage
//! - `TESSERA_SQLITE_PATH` - path to the coordination SQLite database
//!   (default: "tessera.sqlite3")
//! - `TESSERA_OBJECT_ROOT` - path to the root of the static object
//!   storage tree (tiles, entry bundles, checkpoint)
//!
//! ## Batching
//! - `TESSERA_BATCH_MAX_SIZE` - max entries per sequencing batch (default: 256)
//! - `TESSERA_BATCH_MAX_AGE_MILLIS` - max age before a partial batch flushes
//!   (default: 100)
//! - `TESSERA_MAX_OUTSTANDING` - back-pressure threshold: sequenced-but-not-
//!   yet-integrated entries beyond which `add` rejects with pushback
//!   (default: 4096)
//!
//! ## Checkpoint signing
//! - `TESSERA_ORIGIN` - the log's origin string, the first line of every
//!   checkpoint note
//! - `TESSERA_SIGNING_KEY` - hex-encoded Ed25519 signing seed (32 bytes)
//! - `TESSERA_CHECKPOINT_INTERVAL_MILLIS` - how often the integrated tree is
//!   published as a signed checkpoint (default: 1000)
//!
//! ## Antispam
//! - `TESSERA_ANTISPAM_PUSHBACK_THRESHOLD` - how far the antispam follower
//!   may lag the integrated tree before `Add` starts returning pushback
//!   (default: 100000)
//!
//! ## Witnessing
//! - `TESSERA_WITNESS_THRESHOLD` - N in the N-of-M witness cosigning policy
//!   (default: 0, meaning witnessing is disabled)
//! - `TESSERA_WITNESS_ENDPOINTS` - comma-separated witness descriptors, each
//!   `<keyname>@<hex ed25519 pubkey>@<base url>`
//!
//! ## Misc
//! - `TESSERA_LOG_LEVEL` - logging level (debug, info, warn, error; default: info)

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("witness policy incomplete: {0}")]
    WitnessPolicyIncomplete(String),
}

/// Main configuration struct for a [`crate::appender::Appender`].
#[derive(Debug, Clone)]
pub struct TesseraConfig {
    /// Path to the coordination SQLite database.
    pub sqlite_path: String,

    /// Root directory of the static object storage tree.
    pub object_root: String,

    /// Maximum number of entries batched into a single sequencing write.
    pub batch_max_size: usize,

    /// Maximum age a partial batch is held before being force-flushed.
    pub batch_max_age: Duration,

    /// Back-pressure threshold on unintegrated entries.
    pub max_outstanding: u64,

    /// The log's origin line, embedded in every checkpoint.
    pub origin: String,

    /// Hex-encoded 32-byte Ed25519 signing seed.
    pub signing_key: String,

    /// How often the integrated tree is republished as a checkpoint.
    pub checkpoint_interval: Duration,

    /// Witness cosigning policy.
    pub witness_policy: WitnessPolicy,

    /// How far the antispam follower may lag the integrated tree before
    /// `Add` starts returning pushback.
    pub antispam_pushback_threshold: u64,

    /// Logging level.
    pub log_level: String,
}

/// A single configured witness: its note key name, Ed25519 public key (used
/// to verify the signature line it returns), and base URL it is POSTed to.
#[derive(Debug, Clone)]
pub struct WitnessEndpoint {
    pub key_name: String,
    pub public_key: [u8; 32],
    pub url: String,
}

/// N-of-M witness cosigning policy. A threshold of zero disables witnessing.
#[derive(Debug, Clone)]
pub struct WitnessPolicy {
    pub threshold: usize,
    pub endpoints: Vec<WitnessEndpoint>,
}

impl WitnessPolicy {
    pub fn disabled() -> Self {
        Self {
            threshold: 0,
            endpoints: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }
}

impl TesseraConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let sqlite_path =
            env::var("TESSERA_SQLITE_PATH").unwrap_or_else(|_| "tessera.sqlite3".to_string());

        let object_root =
            env::var("TESSERA_OBJECT_ROOT").unwrap_or_else(|_| "tessera-objects".to_string());

        let batch_max_size = parse_env_or("TESSERA_BATCH_MAX_SIZE", 256)?;
        let batch_max_age_millis: u64 = parse_env_or("TESSERA_BATCH_MAX_AGE_MILLIS", 100)?;
        let max_outstanding = parse_env_or("TESSERA_MAX_OUTSTANDING", 4096u64)?;

        let origin = env::var("TESSERA_ORIGIN")
            .map_err(|_| ConfigError::MissingEnvVar("TESSERA_ORIGIN".to_string()))?;

        let signing_key = env::var("TESSERA_SIGNING_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("TESSERA_SIGNING_KEY".to_string()))?;
        if hex::decode(&signing_key)
            .map(|b| b.len() != 32)
            .unwrap_or(true)
        {
            return Err(ConfigError::InvalidValue(
                "TESSERA_SIGNING_KEY".to_string(),
                "must be 32 bytes, hex-encoded".to_string(),
            ));
        }

        let checkpoint_interval_millis: u64 =
            parse_env_or("TESSERA_CHECKPOINT_INTERVAL_MILLIS", 1000)?;

        let witness_policy = load_witness_policy()?;

        let antispam_pushback_threshold =
            parse_env_or("TESSERA_ANTISPAM_PUSHBACK_THRESHOLD", 100_000u64)?;

        let log_level = env::var("TESSERA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            sqlite_path,
            object_root,
            batch_max_size,
            batch_max_age: Duration::from_millis(batch_max_age_millis),
            max_outstanding,
            origin,
            signing_key,
            checkpoint_interval: Duration::from_millis(checkpoint_interval_millis),
            witness_policy,
            antispam_pushback_threshold,
            log_level,
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(value) => value.parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), "must be a number".to_string())
        }),
        Err(_) => Ok(default),
    }
}

fn load_witness_policy() -> Result<WitnessPolicy, ConfigError> {
    let threshold: usize = parse_env_or("TESSERA_WITNESS_THRESHOLD", 0usize)?;
    if threshold == 0 {
        return Ok(WitnessPolicy::disabled());
    }

    let raw = env::var("TESSERA_WITNESS_ENDPOINTS").map_err(|_| {
        ConfigError::WitnessPolicyIncomplete("TESSERA_WITNESS_ENDPOINTS required".to_string())
    })?;

    let endpoints: Vec<WitnessEndpoint> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(parse_witness_endpoint)
        .collect::<Result<_, _>>()?;

    if endpoints.len() < threshold {
        return Err(ConfigError::WitnessPolicyIncomplete(format!(
            "threshold {} exceeds configured endpoint count {}",
            threshold,
            endpoints.len()
        )));
    }

    Ok(WitnessPolicy {
        threshold,
        endpoints,
    })
}

/// Parse one `<keyname>@<hex pubkey>@<url>` witness descriptor.
fn parse_witness_endpoint(s: &str) -> Result<WitnessEndpoint, ConfigError> {
    let mut parts = s.splitn(3, '@');
    let key_name = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigError::InvalidValue("TESSERA_WITNESS_ENDPOINTS".to_string(), s.to_string()))?
        .to_string();
    let pubkey_hex = parts
        .next()
        .ok_or_else(|| ConfigError::InvalidValue("TESSERA_WITNESS_ENDPOINTS".to_string(), s.to_string()))?;
    let url = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ConfigError::InvalidValue("TESSERA_WITNESS_ENDPOINTS".to_string(), s.to_string()))?
        .to_string();

    let bytes = hex::decode(pubkey_hex)
        .map_err(|e| ConfigError::InvalidValue("TESSERA_WITNESS_ENDPOINTS".to_string(), e.to_string()))?;
    let public_key: [u8; 32] = bytes.try_into().map_err(|_| {
        ConfigError::InvalidValue(
            "TESSERA_WITNESS_ENDPOINTS".to_string(),
            "public key must be 32 bytes".to_string(),
        )
    })?;

    Ok(WitnessEndpoint {
        key_name,
        public_key,
        url,
    })
}
