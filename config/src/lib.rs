//! Tally Configuration
//!
//! Shared configuration crate for every Tally role.
//!
//! Handles loading configuration from:
//! 1. TALLY_CONFIG env var (explicit path)
//! 2. ./tally.toml (current directory)
//! 3. ~/.tally/config.toml (user home)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tally_crypto::LatticeParams;
use tally_protocol::{MaskingParams, QuerySettings};

const CONFIG_FILE_NAME: &str = "tally.toml";
const CONFIG_DIR_NAME: &str = ".tally";
const HOME_CONFIG_FILE_NAME: &str = "config.toml";

// ============================================================================
// Default Constants
// ============================================================================

const DEFAULT_DB_PATH: &str = "./tally-db";
const DEFAULT_EVENT_CAPACITY: usize = 1024;

const DEFAULT_HOMOMORPHIC_BITS: u64 = 2048;
const DEFAULT_LATTICE: &str = "mlkem768";
const DEFAULT_SECRET_BITS: u64 = tally_protocol::masking::DEFAULT_SECRET_BITS;
const DEFAULT_MASK_BITS: u64 = tally_protocol::masking::DEFAULT_MASK_BITS;
const DEFAULT_MAX_PARTICIPANTS: u64 = tally_protocol::masking::DEFAULT_MAX_PARTICIPANTS;

const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;
const DEFAULT_JITTER_STEP_MS: u64 = 200;
const DEFAULT_JITTER_STEPS: u32 = 10;

const DEFAULT_QUERY_OPERATORS: usize = 3;
const DEFAULT_QUERY_PARTICIPANTS: usize = 2;
const DEFAULT_QUERY_DURATION_SECS: u64 = 30;
const DEFAULT_GRACE_SECS: u64 = 10;

const DEFAULT_NAME: &str = "asker";
const DEFAULT_SANDBOX_OPERATORS: usize = 3;
const DEFAULT_SANDBOX_PARTICIPANTS: usize = 2;
const DEFAULT_MIN_COMMITTEE: usize = 1;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallyConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub submitter: SubmitterConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

/// World-state backend
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Rocksdb,
}

impl std::str::FromStr for LedgerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" => Ok(Self::Rocksdb),
            other => bail!("unknown ledger backend {other:?}, expected memory or rocksdb"),
        }
    }
}

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Commit events buffered per subscriber before the slowest one lags
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            path: DEFAULT_DB_PATH.into(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

fn default_db_path() -> String {
    DEFAULT_DB_PATH.into()
}
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

/// Key sizes and masking magnitudes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_homomorphic_bits")]
    pub homomorphic_bits: u64,
    #[serde(default = "default_lattice")]
    pub lattice: String,
    #[serde(default = "default_secret_bits")]
    pub secret_bits: u64,
    #[serde(default = "default_mask_bits")]
    pub mask_bits: u64,
    #[serde(default = "default_max_participants")]
    pub max_participants: u64,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            homomorphic_bits: DEFAULT_HOMOMORPHIC_BITS,
            lattice: DEFAULT_LATTICE.into(),
            secret_bits: DEFAULT_SECRET_BITS,
            mask_bits: DEFAULT_MASK_BITS,
            max_participants: DEFAULT_MAX_PARTICIPANTS,
        }
    }
}

fn default_homomorphic_bits() -> u64 {
    DEFAULT_HOMOMORPHIC_BITS
}
fn default_lattice() -> String {
    DEFAULT_LATTICE.into()
}
fn default_secret_bits() -> u64 {
    DEFAULT_SECRET_BITS
}
fn default_mask_bits() -> u64 {
    DEFAULT_MASK_BITS
}
fn default_max_participants() -> u64 {
    DEFAULT_MAX_PARTICIPANTS
}

impl CryptoConfig {
    pub fn lattice_params(&self) -> Result<LatticeParams> {
        self.lattice
            .parse()
            .with_context(|| format!("Unknown lattice parameter set: {}", self.lattice))
    }

    pub fn masking_params(&self) -> MaskingParams {
        MaskingParams {
            secret_bits: self.secret_bits,
            mask_bits: self.mask_bits,
            max_participants: self.max_participants,
        }
    }
}

/// Retry policy for ledger writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_jitter_step_ms")]
    pub jitter_step_ms: u64,
    #[serde(default = "default_jitter_steps")]
    pub jitter_steps: u32,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            jitter_step_ms: DEFAULT_JITTER_STEP_MS,
            jitter_steps: DEFAULT_JITTER_STEPS,
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}
fn default_jitter_step_ms() -> u64 {
    DEFAULT_JITTER_STEP_MS
}
fn default_jitter_steps() -> u32 {
    DEFAULT_JITTER_STEPS
}

/// Parameters of queries started by this asker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Committee size N
    #[serde(default = "default_query_operators")]
    pub operators: usize,
    #[serde(default = "default_query_participants")]
    pub participants: usize,
    #[serde(default = "default_query_duration")]
    pub duration_secs: u64,
    #[serde(default)]
    pub allow_partial: bool,
    /// Extra wait past the aggregation deadline before the asker closes the query
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            operators: DEFAULT_QUERY_OPERATORS,
            participants: DEFAULT_QUERY_PARTICIPANTS,
            duration_secs: DEFAULT_QUERY_DURATION_SECS,
            allow_partial: false,
            grace_secs: DEFAULT_GRACE_SECS,
        }
    }
}

fn default_query_operators() -> usize {
    DEFAULT_QUERY_OPERATORS
}
fn default_query_participants() -> usize {
    DEFAULT_QUERY_PARTICIPANTS
}
fn default_query_duration() -> u64 {
    DEFAULT_QUERY_DURATION_SECS
}
fn default_grace_secs() -> u64 {
    DEFAULT_GRACE_SECS
}

impl QueryConfig {
    pub fn settings(&self) -> QuerySettings {
        QuerySettings {
            committee_size: self.operators,
            expected_participants: self.participants,
            duration_secs: self.duration_secs,
            allow_partial: self.allow_partial,
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Local sandbox run by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Asker identity; query ids are `<name>-<counter>`
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_sandbox_operators")]
    pub operators: usize,
    #[serde(default = "default_sandbox_participants")]
    pub participants: usize,
    /// Participants skip aggregations with a smaller committee
    #[serde(default = "default_min_committee")]
    pub min_committee: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            operators: DEFAULT_SANDBOX_OPERATORS,
            participants: DEFAULT_SANDBOX_PARTICIPANTS,
            min_committee: DEFAULT_MIN_COMMITTEE,
        }
    }
}

fn default_name() -> String {
    DEFAULT_NAME.into()
}
fn default_sandbox_operators() -> usize {
    DEFAULT_SANDBOX_OPERATORS
}
fn default_sandbox_participants() -> usize {
    DEFAULT_SANDBOX_PARTICIPANTS
}
fn default_min_committee() -> usize {
    DEFAULT_MIN_COMMITTEE
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

/// Set field from env var if present
fn env_string(var: &impl Fn(&str) -> Option<String>, key: &str, field: &mut String) {
    if let Some(v) = var(key) {
        *field = v;
    }
}

/// Set field from env var if present and parseable
fn env_parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    if let Some(v) = var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        } else {
            log::warn!("Ignoring unparseable {}={}", key, v);
        }
    }
}

/// Check if env var is set to a truthy value ("1" or "true")
fn env_bool(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    var(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

// ============================================================================
// Implementation
// ============================================================================

impl TallyConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                Self::read(&path)?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::read(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check TALLY_CONFIG env var
        if let Ok(path) = env::var("TALLY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            log::warn!("TALLY_CONFIG points at missing file {}", path.display());
        }

        // 2. Check ./tally.toml (current directory)
        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.tally/config.toml
        Self::default_config_path().filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        // Ledger
        if let Some(v) = var("TALLY_LEDGER_BACKEND") {
            self.ledger.backend = v.parse().context("Invalid TALLY_LEDGER_BACKEND")?;
        }
        env_string(&var, "TALLY_DB_PATH", &mut self.ledger.path);

        // Crypto
        env_parse(&var, "TALLY_HOMOMORPHIC_BITS", &mut self.crypto.homomorphic_bits);
        env_string(&var, "TALLY_LATTICE", &mut self.crypto.lattice);
        env_parse(&var, "TALLY_SECRET_BITS", &mut self.crypto.secret_bits);
        env_parse(&var, "TALLY_MASK_BITS", &mut self.crypto.mask_bits);
        env_parse(&var, "TALLY_MAX_PARTICIPANTS", &mut self.crypto.max_participants);

        // Submitter
        env_parse(&var, "TALLY_MAX_RETRIES", &mut self.submitter.max_retries);
        env_parse(&var, "TALLY_BACKOFF_BASE_MS", &mut self.submitter.backoff_base_ms);
        env_parse(&var, "TALLY_JITTER_STEP_MS", &mut self.submitter.jitter_step_ms);
        env_parse(&var, "TALLY_JITTER_STEPS", &mut self.submitter.jitter_steps);

        // Query
        env_parse(&var, "TALLY_QUERY_OPERATORS", &mut self.query.operators);
        env_parse(&var, "TALLY_QUERY_PARTICIPANTS", &mut self.query.participants);
        env_parse(&var, "TALLY_QUERY_DURATION", &mut self.query.duration_secs);
        env_parse(&var, "TALLY_QUERY_GRACE_SECS", &mut self.query.grace_secs);
        if let Some(v) = env_bool(&var, "TALLY_ALLOW_PARTIAL") {
            self.query.allow_partial = v;
        }

        // Sandbox
        env_string(&var, "TALLY_NAME", &mut self.sandbox.name);
        env_parse(&var, "TALLY_SANDBOX_OPERATORS", &mut self.sandbox.operators);
        env_parse(&var, "TALLY_SANDBOX_PARTICIPANTS", &mut self.sandbox.participants);
        env_parse(&var, "TALLY_MIN_COMMITTEE", &mut self.sandbox.min_committee);
        Ok(())
    }

    /// Reject settings the protocol cannot run safely with
    pub fn validate(&self) -> Result<()> {
        self.crypto.lattice_params()?;
        self.query
            .settings()
            .validate()
            .context("Invalid [query] section")?;
        self.crypto
            .masking_params()
            .check_capacity(self.crypto.homomorphic_bits, self.query.operators)
            .context("Masking parameters could overflow the homomorphic modulus")?;
        self.crypto
            .masking_params()
            .check_participants(self.query.participants)
            .context("query.participants exceeds crypto.max_participants")?;

        if self.ledger.event_capacity == 0 {
            bail!("ledger.event_capacity must be positive");
        }
        if self.sandbox.name.is_empty() {
            bail!("sandbox.name must not be empty");
        }
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(HOME_CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = TallyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.submitter.max_retries, 10);
        assert_eq!(config.query.operators, 3);
        assert!(!config.query.allow_partial);
        assert_eq!(config.crypto.lattice_params().unwrap(), LatticeParams::MlKem768);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: TallyConfig = toml::from_str(
            r#"
            [query]
            operators = 5
            allow_partial = true

            [ledger]
            backend = "rocksdb"
            "#,
        )
        .unwrap();

        assert_eq!(config.query.operators, 5);
        assert_eq!(config.query.participants, DEFAULT_QUERY_PARTICIPANTS);
        assert!(config.query.settings().allow_partial);
        assert_eq!(config.ledger.backend, LedgerBackend::Rocksdb);
        assert_eq!(config.ledger.path, DEFAULT_DB_PATH);
        assert_eq!(config.crypto.homomorphic_bits, DEFAULT_HOMOMORPHIC_BITS);
    }

    #[test]
    fn overflowing_masks_rejected() {
        let mut config = TallyConfig::default();
        config.crypto.homomorphic_bits = 512;
        config.crypto.mask_bits = 256;
        config.crypto.max_participants = u64::MAX;
        assert!(config.validate().is_ok());

        config.crypto.homomorphic_bits = 320;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_sections_rejected() {
        let mut config = TallyConfig::default();
        config.crypto.lattice = "kyber9000".into();
        assert!(config.validate().is_err());

        let mut config = TallyConfig::default();
        config.query.participants = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn participants_bounded_by_max_participants() {
        let mut config = TallyConfig::default();
        config.crypto.max_participants = 4;
        config.query.participants = 4;
        assert!(config.validate().is_ok());

        config.query.participants = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_cover_retry_and_grace_settings() {
        let vars = |key: &str| match key {
            "TALLY_JITTER_STEPS" => Some("7".to_string()),
            "TALLY_QUERY_GRACE_SECS" => Some("42".to_string()),
            "TALLY_LEDGER_BACKEND" => Some("RocksDB".to_string()),
            "TALLY_MAX_RETRIES" => Some("not-a-number".to_string()),
            _ => None,
        };
        let mut config = TallyConfig::default();
        config.apply_overrides(vars).unwrap();

        assert_eq!(config.submitter.jitter_steps, 7);
        assert_eq!(config.query.grace_secs, 42);
        assert_eq!(config.query.grace(), Duration::from_secs(42));
        assert_eq!(config.ledger.backend, LedgerBackend::Rocksdb);
        assert_eq!(config.submitter.max_retries, 10);
    }

    #[test]
    fn unknown_ledger_backend_rejected() {
        let mut config = TallyConfig::default();
        config.ledger.backend = LedgerBackend::Rocksdb;
        let err = config
            .apply_overrides(|key| (key == "TALLY_LEDGER_BACKEND").then(|| "postgres".to_string()))
            .unwrap_err();
        assert!(format!("{err:#}").contains("postgres"));
        assert_eq!(config.ledger.backend, LedgerBackend::Rocksdb);

        let mut config = TallyConfig::default();
        config
            .apply_overrides(|key| (key == "TALLY_LEDGER_BACKEND").then(|| "memory".to_string()))
            .unwrap();
        assert_eq!(config.ledger.backend, LedgerBackend::Memory);
    }

    #[test]
    fn sample_roundtrips() {
        let sample = TallyConfig::generate_sample();
        let parsed: TallyConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.sandbox.name, DEFAULT_NAME);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sandbox]\nname = \"carol\"\nmin_committee = 2").unwrap();

        let config = TallyConfig::load_from(file.path()).unwrap();
        assert_eq!(config.sandbox.min_committee, 2);
        assert_eq!(config.sandbox.name, "carol");
    }
}
