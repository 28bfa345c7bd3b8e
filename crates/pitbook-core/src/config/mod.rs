//! TOML configuration with fail-closed validation.
//!
//! [`PitbookConfig::from_toml`] parses and validates in one step: a
//! config that parses but fails validation is never returned. Unknown
//! keys are rejected everywhere so a typo cannot silently disable a
//! limit or widen an allow-list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::context::{ServiceAccount, ServiceAccountRegistry};
use crate::identity::{StaffRole, TenantId};
use crate::store::{StoreOptions, DEFAULT_LEASE_WAIT, DEFAULT_LOCK_WAIT, DEFAULT_POOL_SIZE};
use crate::token::MIN_KEY_LEN;

/// Errors from loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PitbookConfig {
    /// Path of the `SQLite` database file.
    pub db_path: PathBuf,

    /// Store tuning.
    #[serde(default)]
    pub store: StoreSection,

    /// Token verification settings. Required: there is no usable default
    /// for key material.
    pub auth: AuthSection,

    /// Manual-reward rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitSection,

    /// Recovery sweep settings.
    #[serde(default)]
    pub recovery: RecoverySection,

    /// Service accounts available to the service lane.
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccountSection>,
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSection {
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Bound on waiting for a free connection, in milliseconds.
    #[serde(default = "default_lease_wait_ms")]
    pub lease_wait_ms: u64,

    /// Bound on waiting for a per-player lock, in milliseconds.
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            lease_wait_ms: default_lease_wait_ms(),
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

/// `[auth]` section.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    /// Hex-encoded token signing key, at least 32 bytes once decoded.
    pub token_key_hex: String,
}

impl std::fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output and logs.
        f.debug_struct("AuthSection")
            .field("token_key_hex_len", &self.token_key_hex.len())
            .finish()
    }
}

/// `[rate_limit]` section: per-staff manual-reward limiting.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSection {
    /// Requests allowed per staff id per window.
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds.
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: default_rate_max_requests(),
            window_secs: default_rate_window_secs(),
        }
    }
}

/// `[recovery]` section: the accrual recovery sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoverySection {
    /// Whether the sweep loop runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweep passes.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Maximum sessions re-driven per pass.
    #[serde(default = "default_sweep_batch_limit")]
    pub batch_limit: usize,

    /// Service account the sweep acts as. Must name a configured
    /// account when the sweep is enabled.
    #[serde(default)]
    pub service_account: Option<String>,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sweep_interval_secs: default_sweep_interval_secs(),
            batch_limit: default_sweep_batch_limit(),
            service_account: None,
        }
    }
}

/// One `[[service_accounts]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceAccountSection {
    /// Stable account name.
    pub name: String,
    /// Tenant the account operates within.
    pub tenant_id: String,
    /// Role granted to the account (`floor`, `supervisor`, `admin`).
    pub role: String,
}

const fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_lease_wait_ms() -> u64 {
    u64::try_from(DEFAULT_LEASE_WAIT.as_millis()).unwrap_or(u64::MAX)
}

fn default_lock_wait_ms() -> u64 {
    u64::try_from(DEFAULT_LOCK_WAIT.as_millis()).unwrap_or(u64::MAX)
}

const fn default_rate_max_requests() -> u32 {
    30
}

const fn default_rate_window_secs() -> u64 {
    60
}

const fn default_true() -> bool {
    true
}

const fn default_sweep_interval_secs() -> u64 {
    30
}

const fn default_sweep_batch_limit() -> usize {
    64
}

impl PitbookConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a parse error for malformed TOML or unknown keys, and a
    /// validation error for values that parse but cannot be used.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.pool_size == 0 {
            return Err(ConfigError::Validation(
                "store.pool_size must be at least 1".to_string(),
            ));
        }
        self.signing_key()?;
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.max_requests must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.window_secs must be at least 1".to_string(),
            ));
        }
        if self.recovery.enabled {
            if self.recovery.sweep_interval_secs == 0 {
                return Err(ConfigError::Validation(
                    "recovery.sweep_interval_secs must be at least 1".to_string(),
                ));
            }
            if self.recovery.batch_limit == 0 {
                return Err(ConfigError::Validation(
                    "recovery.batch_limit must be at least 1".to_string(),
                ));
            }
            let Some(account) = &self.recovery.service_account else {
                return Err(ConfigError::Validation(
                    "recovery.service_account is required while the sweep is enabled".to_string(),
                ));
            };
            if !self.service_accounts.iter().any(|s| &s.name == account) {
                return Err(ConfigError::Validation(format!(
                    "recovery.service_account {account:?} names no configured service account"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for section in &self.service_accounts {
            if section.name.is_empty() {
                return Err(ConfigError::Validation(
                    "service account name must not be empty".to_string(),
                ));
            }
            if !seen.insert(section.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate service account name {:?}",
                    section.name
                )));
            }
            section.to_account()?;
        }
        Ok(())
    }

    /// Decodes the token signing key.
    ///
    /// # Errors
    ///
    /// Returns a validation error for non-hex input or keys shorter
    /// than the minimum.
    pub fn signing_key(&self) -> Result<Vec<u8>, ConfigError> {
        let key = hex::decode(&self.auth.token_key_hex).map_err(|err| {
            ConfigError::Validation(format!("auth.token_key_hex is not valid hex: {err}"))
        })?;
        if key.len() < MIN_KEY_LEN {
            return Err(ConfigError::Validation(format!(
                "auth.token_key_hex decodes to {} bytes, need at least {MIN_KEY_LEN}",
                key.len()
            )));
        }
        Ok(key)
    }

    /// Store tuning derived from the `[store]` section.
    #[must_use]
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            pool_size: self.store.pool_size,
            lease_wait: Duration::from_millis(self.store.lease_wait_ms),
            lock_wait: Duration::from_millis(self.store.lock_wait_ms),
        }
    }

    /// Builds the service-account registry from the configured accounts.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unparseable roles.
    pub fn service_registry(&self) -> Result<ServiceAccountRegistry, ConfigError> {
        let accounts = self
            .service_accounts
            .iter()
            .map(ServiceAccountSection::to_account)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ServiceAccountRegistry::new(accounts))
    }

    /// The rate-limit window as a duration.
    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }

    /// The sweep interval as a duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.recovery.sweep_interval_secs)
    }
}

impl ServiceAccountSection {
    fn to_account(&self) -> Result<ServiceAccount, ConfigError> {
        let role = StaffRole::parse(&self.role).map_err(|_| {
            ConfigError::Validation(format!(
                "service account {:?} has unknown role {:?}",
                self.name, self.role
            ))
        })?;
        Ok(ServiceAccount {
            name: self.name.clone(),
            tenant_id: TenantId::new(self.tenant_id.clone()),
            role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f000102030405060708090a0b0c0d0e0f";

    fn minimal() -> String {
        format!(
            r#"
            db_path = "/tmp/pitbook.db"

            [auth]
            token_key_hex = "{KEY_HEX}"

            [recovery]
            enabled = false
            "#
        )
    }

    fn full() -> String {
        format!(
            r#"
            db_path = "/var/lib/pitbook/pitbook.db"

            [store]
            pool_size = 8
            lease_wait_ms = 2000
            lock_wait_ms = 1000

            [auth]
            token_key_hex = "{KEY_HEX}"

            [rate_limit]
            max_requests = 10
            window_secs = 30

            [recovery]
            enabled = true
            sweep_interval_secs = 15
            batch_limit = 16
            service_account = "accrual-recovery"

            [[service_accounts]]
            name = "accrual-recovery"
            tenant_id = "lucky-star"
            role = "supervisor"
            "#
        )
    }

    #[test]
    fn minimal_config_applies_defaults() {
        let config = PitbookConfig::from_toml(&minimal()).unwrap();
        assert_eq!(config.store.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.rate_limit.max_requests, 30);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert!(!config.recovery.enabled);
    }

    #[test]
    fn full_config_round_trips_into_typed_views() {
        let config = PitbookConfig::from_toml(&full()).unwrap();
        let options = config.store_options();
        assert_eq!(options.pool_size, 8);
        assert_eq!(options.lease_wait, Duration::from_millis(2000));
        assert_eq!(options.lock_wait, Duration::from_millis(1000));
        assert_eq!(config.signing_key().unwrap().len(), 32);
        let registry = config.service_registry().unwrap();
        let account = registry.lookup("accrual-recovery").unwrap();
        assert_eq!(account.role, StaffRole::Supervisor);
        assert_eq!(account.tenant_id, TenantId::new("lucky-star"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml = minimal().replace("[auth]", "typo_key = 1\n\n[auth]");
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_auth_section_is_rejected() {
        let toml = r#"db_path = "/tmp/pitbook.db""#;
        assert!(matches!(
            PitbookConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn short_key_fails_validation() {
        let toml = minimal().replace(KEY_HEX, "00ff00ff");
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn non_hex_key_fails_validation() {
        let toml = minimal().replace(KEY_HEX, "not-hex-at-all");
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn zero_pool_size_fails_validation() {
        let toml = format!(
            r#"
            db_path = "/tmp/pitbook.db"

            [store]
            pool_size = 0

            [auth]
            token_key_hex = "{KEY_HEX}"

            [recovery]
            enabled = false
            "#
        );
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn unknown_service_role_fails_validation() {
        let toml = full().replace("role = \"supervisor\"", "role = \"owner\"");
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_service_account_names_fail_validation() {
        let extra = r#"
            [[service_accounts]]
            name = "accrual-recovery"
            tenant_id = "golden-gate"
            role = "supervisor"
            "#;
        let toml = format!("{}\n{extra}", full());
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn enabled_sweep_requires_a_known_service_account() {
        let toml = full().replace("service_account = \"accrual-recovery\"", "");
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));

        let toml = full().replace(
            "service_account = \"accrual-recovery\"",
            "service_account = \"no-such-account\"",
        );
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn zero_rate_window_fails_validation() {
        let toml = full().replace("window_secs = 30", "window_secs = 0");
        assert!(matches!(
            PitbookConfig::from_toml(&toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn auth_debug_hides_key_material() {
        let config = PitbookConfig::from_toml(&full()).unwrap();
        let rendered = format!("{:?}", config.auth);
        assert!(!rendered.contains(KEY_HEX));
    }
}
