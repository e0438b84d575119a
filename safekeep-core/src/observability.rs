/*!
Observability infrastructure for the safekeep pipeline.

This module provides:
- Structured logging setup (JSON or compact text) filtered through `RUST_LOG`
- Prometheus metrics for backups, restores and uploads (`metrics` feature)

The `record_*` functions are always callable; without the `metrics`
feature they compile to nothing.
*/

#[cfg(feature = "metrics")]
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::model::BackupType;
use crate::{BackupError, Result};

/// Global metrics instance; `None` when registration failed
#[cfg(feature = "metrics")]
static METRICS: Lazy<Option<SafekeepMetrics>> = Lazy::new(|| match SafekeepMetrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::warn!(error = %e, "Metrics disabled");
        None
    }
});

/// Metrics collection for pipeline operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct SafekeepMetrics {
    /// Backups by type and outcome
    pub backups_total: IntCounterVec,
    pub backup_duration_seconds: Histogram,
    /// Final artifact size of completed backups
    pub artifact_size_bytes: Histogram,

    /// Restores by outcome
    pub restores_total: IntCounterVec,
    pub restore_duration_seconds: Histogram,

    /// Cloud uploads by outcome
    pub uploads_total: IntCounterVec,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackupError {
    BackupError::observability(format!("Failed to create {name} metric: {e}"))
}

#[cfg(feature = "metrics")]
impl SafekeepMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let backups_total = IntCounterVec::new(
            Opts::new("safekeep_backups_total", "Backups attempted by safekeep"),
            &["backup_type", "outcome"],
        )
        .map_err(|e| metric_error("backups_total", e))?;

        let backup_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "safekeep_backup_duration_seconds",
            "Duration of backup pipelines in seconds",
        ))
        .map_err(|e| metric_error("backup_duration_seconds", e))?;

        let artifact_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "safekeep_artifact_size_bytes",
                "Size of completed backup artifacts in bytes",
            )
            .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).map_err(|e| {
                metric_error("artifact_size_bytes", e)
            })?),
        )
        .map_err(|e| metric_error("artifact_size_bytes", e))?;

        let restores_total = IntCounterVec::new(
            Opts::new("safekeep_restores_total", "Restores attempted by safekeep"),
            &["outcome"],
        )
        .map_err(|e| metric_error("restores_total", e))?;

        let restore_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "safekeep_restore_duration_seconds",
            "Duration of restores in seconds",
        ))
        .map_err(|e| metric_error("restore_duration_seconds", e))?;

        let uploads_total = IntCounterVec::new(
            Opts::new("safekeep_uploads_total", "Cloud uploads attempted by safekeep"),
            &["outcome"],
        )
        .map_err(|e| metric_error("uploads_total", e))?;

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(backups_total.clone()),
            Box::new(backup_duration_seconds.clone()),
            Box::new(artifact_size_bytes.clone()),
            Box::new(restores_total.clone()),
            Box::new(restore_duration_seconds.clone()),
            Box::new(uploads_total.clone()),
        ];
        for collector in collectors {
            registry.register(collector).map_err(|e| {
                BackupError::observability(format!("Failed to register metric: {e}"))
            })?;
        }

        Ok(Self {
            backups_total,
            backup_duration_seconds,
            artifact_size_bytes,
            restores_total,
            restore_duration_seconds,
            uploads_total,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static SafekeepMetrics> {
        METRICS.as_ref()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackupError::observability(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            BackupError::observability(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Record one finished backup pipeline
pub fn record_backup(backup_type: BackupType, success: bool, elapsed: Duration, size_bytes: u64) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = SafekeepMetrics::global() {
        metrics
            .backups_total
            .with_label_values(&[backup_type.as_str(), outcome(success)])
            .inc();
        metrics.backup_duration_seconds.observe(elapsed.as_secs_f64());
        if success {
            metrics.artifact_size_bytes.observe(size_bytes as f64);
        }
    }

    #[cfg(not(feature = "metrics"))]
    let _ = (backup_type, outcome(success), elapsed, size_bytes);
}

/// Record one finished restore
pub fn record_restore(success: bool, elapsed: Duration) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = SafekeepMetrics::global() {
        metrics.restores_total.with_label_values(&[outcome(success)]).inc();
        metrics.restore_duration_seconds.observe(elapsed.as_secs_f64());
    }

    #[cfg(not(feature = "metrics"))]
    let _ = (outcome(success), elapsed);
}

/// Record one cloud upload attempt sequence
pub fn record_upload(success: bool) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = SafekeepMetrics::global() {
        metrics.uploads_total.with_label_values(&[outcome(success)]).inc();
    }

    #[cfg(not(feature = "metrics"))]
    let _ = outcome(success);
}

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_LOG_DIRECTIVE: &str = "safekeep_core=info,safekeep=info";

/// Gather the global metrics in Prometheus text format
///
/// `None` when the crate was built without the `metrics` feature or the
/// registry could not be created.
pub fn gather_metrics() -> Result<Option<String>> {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = SafekeepMetrics::global() {
        return metrics.gather_metrics().map(Some);
    }
    Ok(None)
}

fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| BackupError::observability(format!("Invalid log filter '{directive}': {e}")))
}

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `default_directive`. With `json` set,
/// events are emitted as one JSON object per line; otherwise as compact text.
///
/// # Errors
/// Returns `BackupError::Observability` if `default_directive` is invalid
/// and `RUST_LOG` does not override it, or a global subscriber is already
/// installed.
pub fn init_observability(json: bool, default_directive: &str) -> Result<()> {
    #[cfg(feature = "metrics")]
    SafekeepMetrics::global();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(default_directive)?,
    };

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().compact().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };

    result.map_err(|e| {
        BackupError::observability(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("safekeep observability initialized");
    Ok(())
}

/// Initialize compact text logging with [`DEFAULT_LOG_DIRECTIVE`]
pub fn init_default_observability() -> Result<()> {
    init_observability(false, DEFAULT_LOG_DIRECTIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_is_always_safe() {
        record_backup(BackupType::Full, true, Duration::from_millis(120), 4096);
        record_backup(BackupType::Incremental, false, Duration::from_millis(5), 0);
        record_restore(true, Duration::from_secs(2));
        record_upload(false);
    }

    #[test]
    fn test_default_directive_parses() {
        assert!(parse_filter(DEFAULT_LOG_DIRECTIVE).is_ok());
        assert!(parse_filter("warn,safekeep_core=debug").is_ok());
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let err = parse_filter("safekeep_core=verbose").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Observability);
        assert!(err.to_string().contains("safekeep_core=verbose"));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        record_backup(BackupType::Manual, true, Duration::from_millis(10), 2048);
        record_upload(true);

        let text = gather_metrics().unwrap().unwrap();
        assert!(text.contains("safekeep_backups_total"));
        assert!(text.contains("safekeep_uploads_total"));
    }

    #[cfg(not(feature = "metrics"))]
    #[test]
    fn test_metrics_unavailable_without_feature() {
        record_upload(true);
        assert!(gather_metrics().unwrap().is_none());
    }
}
