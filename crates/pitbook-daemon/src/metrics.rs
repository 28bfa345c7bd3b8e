//! Prometheus metrics for issuance and recovery observability.
//!
//! # Metrics Families
//!
//! | Metric | Type | Description | Labels |
//! |--------|------|-------------|--------|
//! | `pitbook_daemon_issuance_total` | Counter | Issuance attempts | `reason`, `outcome` |
//! | `pitbook_daemon_issuance_latency_seconds` | Histogram | Command dispatch latency | `command` |
//! | `pitbook_daemon_player_busy_total` | Counter | Per-player lock contention rejections | `command` |
//! | `pitbook_daemon_authorization_denials_total` | Counter | Denied commands | `command`, `rule` |
//! | `pitbook_daemon_recovery_retries_total` | Counter | Recovery drive outcomes | `outcome` |
//!
//! Contention is a metric, not an error log: `Busy` is a routine,
//! retryable outcome under load.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pitbook_daemon::metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new()?;
//! let metrics = registry.daemon_metrics();
//!
//! metrics.issuance_completed("manual_bonus", "issued");
//! metrics.record_issuance_latency("manual_reward", 0.004);
//!
//! // Export for scraping by whatever layer owns the HTTP surface.
//! let output = registry.encode_text()?;
//! ```

use std::sync::Arc;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Maximum length for label values. Labels are derived from caller input
/// in places, so an upper bound keeps cardinality and memory in check.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Histogram buckets for issuance latency (in seconds). The top buckets
/// cover the bounded per-player lock wait.
pub const ISSUANCE_LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.025, 0.1, 0.5, 1.0, 5.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric registration with the Prometheus registry failed.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Encoding metrics to text format failed.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Result type for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// Daemon metric families.
///
/// Cheap to clone; all fields are internally reference-counted.
#[derive(Clone)]
pub struct DaemonMetrics {
    /// Issuance attempts by reason code and outcome.
    issuance_total: CounterVec,
    /// Command dispatch latency by command name.
    issuance_latency: HistogramVec,
    /// Lock-contention rejections by command name.
    player_busy_total: CounterVec,
    /// Denied commands by command name and denial rule.
    authorization_denials_total: CounterVec,
    /// Recovery drive outcomes.
    recovery_retries_total: CounterVec,
}

impl DaemonMetrics {
    /// Creates the metric families and registers them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (for example if
    /// a metric with the same name is already registered).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let issuance_total = CounterVec::new(
            Opts::new(
                "pitbook_daemon_issuance_total",
                "Total ledger issuance attempts by reason and outcome",
            ),
            &["reason", "outcome"],
        )?;
        registry.register(Box::new(issuance_total.clone()))?;

        let issuance_latency = HistogramVec::new(
            HistogramOpts::new(
                "pitbook_daemon_issuance_latency_seconds",
                "Command dispatch latency in seconds",
            )
            .buckets(ISSUANCE_LATENCY_BUCKETS.to_vec()),
            &["command"],
        )?;
        registry.register(Box::new(issuance_latency.clone()))?;

        let player_busy_total = CounterVec::new(
            Opts::new(
                "pitbook_daemon_player_busy_total",
                "Total commands rejected because the player lock stayed contended",
            ),
            &["command"],
        )?;
        registry.register(Box::new(player_busy_total.clone()))?;

        let authorization_denials_total = CounterVec::new(
            Opts::new(
                "pitbook_daemon_authorization_denials_total",
                "Total commands denied by the authority guard or rate limiter",
            ),
            &["command", "rule"],
        )?;
        registry.register(Box::new(authorization_denials_total.clone()))?;

        let recovery_retries_total = CounterVec::new(
            Opts::new(
                "pitbook_daemon_recovery_retries_total",
                "Total recovery ledger drives by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(recovery_retries_total.clone()))?;

        Ok(Self {
            issuance_total,
            issuance_latency,
            player_busy_total,
            authorization_denials_total,
            recovery_retries_total,
        })
    }

    /// Records a completed issuance attempt.
    ///
    /// # Arguments
    ///
    /// * `reason` - The ledger reason code (e.g. `session_accrual`)
    /// * `outcome` - What happened (e.g. `issued`, `replayed`, `denied`,
    ///   `busy`, `invalid`, `error`)
    pub fn issuance_completed(&self, reason: &str, outcome: &str) {
        let reason = truncate_label(reason);
        let outcome = truncate_label(outcome);
        self.issuance_total
            .with_label_values(&[reason, outcome])
            .inc();
    }

    /// Returns the issuance total for testing purposes.
    #[must_use]
    pub fn issuance_count(&self, reason: &str, outcome: &str) -> f64 {
        let reason = truncate_label(reason);
        let outcome = truncate_label(outcome);
        self.issuance_total
            .with_label_values(&[reason, outcome])
            .get()
    }

    /// Records command dispatch latency.
    pub fn record_issuance_latency(&self, command: &str, latency_secs: f64) {
        let command = truncate_label(command);
        self.issuance_latency
            .with_label_values(&[command])
            .observe(latency_secs);
    }

    /// Records a command rejected by per-player lock contention.
    pub fn player_busy(&self, command: &str) {
        let command = truncate_label(command);
        self.player_busy_total.with_label_values(&[command]).inc();
    }

    /// Returns the contention total for testing purposes.
    #[must_use]
    pub fn busy_count(&self, command: &str) -> f64 {
        let command = truncate_label(command);
        self.player_busy_total.with_label_values(&[command]).get()
    }

    /// Records a denied command.
    ///
    /// # Arguments
    ///
    /// * `command` - The command name (e.g. `manual_reward`)
    /// * `rule` - The denial rule (e.g. `context_missing`,
    ///   `tenant_mismatch`, `forbidden`, `rate_limited`, `establishment`)
    pub fn authorization_denied(&self, command: &str, rule: &str) {
        let command = truncate_label(command);
        let rule = truncate_label(rule);
        self.authorization_denials_total
            .with_label_values(&[command, rule])
            .inc();
    }

    /// Returns the denial total for testing purposes.
    #[must_use]
    pub fn denial_count(&self, command: &str, rule: &str) -> f64 {
        let command = truncate_label(command);
        let rule = truncate_label(rule);
        self.authorization_denials_total
            .with_label_values(&[command, rule])
            .get()
    }

    /// Records a recovery ledger drive.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `recovered`, `replayed`, or `failed`
    pub fn recovery_retried(&self, outcome: &str) {
        let outcome = truncate_label(outcome);
        self.recovery_retries_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Returns the recovery total for testing purposes.
    #[must_use]
    pub fn recovery_retry_count(&self, outcome: &str) -> f64 {
        let outcome = truncate_label(outcome);
        self.recovery_retries_total
            .with_label_values(&[outcome])
            .get()
    }
}

/// Metrics registry wrapper holding the Prometheus registry and the daemon
/// metric families registered with it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    daemon_metrics: DaemonMetrics,
}

impl MetricsRegistry {
    /// Creates a new registry with all daemon metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let daemon_metrics = DaemonMetrics::new(&registry)?;
        Ok(Self {
            registry,
            daemon_metrics,
        })
    }

    /// Returns a reference to the daemon metrics.
    #[must_use]
    pub const fn daemon_metrics(&self) -> &DaemonMetrics {
        &self.daemon_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    /// Returns the underlying Prometheus registry, for registering
    /// additional metrics next to the daemon's.
    #[must_use]
    pub const fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }
}

/// Shared metrics registry handle.
pub type SharedMetricsRegistry = Arc<MetricsRegistry>;

/// Creates a new shared metrics registry.
///
/// # Errors
///
/// Returns an error if metric registration fails.
pub fn new_shared_registry() -> MetricsResult<SharedMetricsRegistry> {
    Ok(Arc::new(MetricsRegistry::new()?))
}

/// Truncates a label value to [`MAX_LABEL_VALUE_LEN`] bytes at a valid
/// UTF-8 character boundary.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // Prometheus counters return exact integer values as f64
mod tests {
    use super::*;

    #[test]
    fn registry_creation_and_encoding() {
        let registry = MetricsRegistry::new().expect("registry creation should succeed");
        assert!(registry.encode_text().is_ok());
    }

    #[test]
    fn issuance_counter_increments_per_label_pair() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon_metrics();

        metrics.issuance_completed("session_accrual", "issued");
        metrics.issuance_completed("session_accrual", "issued");
        metrics.issuance_completed("session_accrual", "replayed");
        metrics.issuance_completed("manual_bonus", "denied");

        assert_eq!(metrics.issuance_count("session_accrual", "issued"), 2.0);
        assert_eq!(metrics.issuance_count("session_accrual", "replayed"), 1.0);
        assert_eq!(metrics.issuance_count("manual_bonus", "denied"), 1.0);
        assert_eq!(metrics.issuance_count("manual_bonus", "issued"), 0.0);
    }

    #[test]
    fn denial_counter_tracks_rules() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon_metrics();

        metrics.authorization_denied("manual_reward", "forbidden");
        metrics.authorization_denied("manual_reward", "forbidden");
        metrics.authorization_denied("manual_reward", "rate_limited");

        assert_eq!(metrics.denial_count("manual_reward", "forbidden"), 2.0);
        assert_eq!(metrics.denial_count("manual_reward", "rate_limited"), 1.0);
    }

    #[test]
    fn busy_and_recovery_counters() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon_metrics();

        metrics.player_busy("session_closed");
        metrics.recovery_retried("recovered");
        metrics.recovery_retried("failed");
        metrics.recovery_retried("failed");

        assert_eq!(metrics.busy_count("session_closed"), 1.0);
        assert_eq!(metrics.recovery_retry_count("recovered"), 1.0);
        assert_eq!(metrics.recovery_retry_count("failed"), 2.0);
    }

    #[test]
    fn all_families_appear_in_text_encoding() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon_metrics();

        // Prometheus only outputs metrics that have been observed.
        metrics.issuance_completed("session_accrual", "issued");
        metrics.record_issuance_latency("session_closed", 0.004);
        metrics.player_busy("session_closed");
        metrics.authorization_denied("manual_reward", "forbidden");
        metrics.recovery_retried("recovered");

        let output = registry.encode_text().unwrap();
        assert!(output.contains("pitbook_daemon_issuance_total"));
        assert!(output.contains("pitbook_daemon_issuance_latency_seconds"));
        assert!(output.contains("pitbook_daemon_player_busy_total"));
        assert!(output.contains("pitbook_daemon_authorization_denials_total"));
        assert!(output.contains("pitbook_daemon_recovery_retries_total"));
    }

    #[test]
    fn long_labels_do_not_panic() {
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon_metrics();

        let long_label = "a".repeat(200);
        metrics.issuance_completed(&long_label, "issued");

        let output = registry.encode_text().unwrap();
        assert!(output.contains("pitbook_daemon_issuance_total"));
    }

    #[test]
    fn label_truncation_is_utf8_safe() {
        // Multi-byte characters crossing the byte boundary must truncate
        // at a character boundary instead of panicking.
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.daemon_metrics();

        let emoji_label = "\u{1F3B0}".repeat(20); // 80 bytes
        assert!(emoji_label.len() > MAX_LABEL_VALUE_LEN);
        metrics.issuance_completed(&emoji_label, "issued");

        let mixed_label = format!("{}{}", "a".repeat(63), "\u{1F3B0}");
        assert!(mixed_label.len() > MAX_LABEL_VALUE_LEN);
        metrics.issuance_completed(&mixed_label, "issued");

        assert!(registry.encode_text().is_ok());
    }

    #[test]
    fn truncate_label_direct() {
        assert_eq!(truncate_label("short"), "short");

        let exact = "a".repeat(MAX_LABEL_VALUE_LEN);
        assert_eq!(truncate_label(&exact), exact);

        let long_ascii = "a".repeat(100);
        assert_eq!(truncate_label(&long_ascii).len(), MAX_LABEL_VALUE_LEN);

        // 63 ASCII bytes then a 4-byte character: must cut before it.
        let boundary = format!("{}{}", "a".repeat(63), "\u{1F3B0}");
        assert_eq!(truncate_label(&boundary), "a".repeat(63));
    }

    #[test]
    fn shared_registry_handle() {
        let registry = new_shared_registry().unwrap();
        registry.daemon_metrics().issuance_completed("promo_bonus", "issued");
        assert_eq!(
            registry.daemon_metrics().issuance_count("promo_bonus", "issued"),
            1.0
        );
    }
}
