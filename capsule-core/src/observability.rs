/*!
Observability infrastructure for the time capsule.

This module provides:
- Structured logging setup through `tracing-subscriber`
- Prometheus metrics for backups, evictions and restores (`metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{CapsuleError, Result};

const DEFAULT_DIRECTIVE: &str = "capsule=info";

/// Global metrics instance; `None` if registration failed
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<CapsuleMetrics>> = OnceLock::new();

/// Metrics collected by the backup manager
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct CapsuleMetrics {
    pub backups_written_total: Counter,
    pub backups_skipped_total: Counter,
    pub backups_evicted_total: Counter,
    pub data_files_removed_total: Counter,
    pub session_size_bytes: Histogram,
    pub restore_duration_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(name: &str, help: &str, registry: &Registry) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| CapsuleError::storage(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| CapsuleError::storage(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(opts: HistogramOpts, registry: &Registry) -> Result<Histogram> {
    let name = opts.common_opts.name.clone();
    let histogram = Histogram::with_opts(opts)
        .map_err(|e| CapsuleError::storage(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| CapsuleError::storage(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl CapsuleMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let backups_written_total = counter(
            "capsule_backups_written_total",
            "Session backups written to the store",
            &registry,
        )?;
        let backups_skipped_total = counter(
            "capsule_backups_skipped_total",
            "Backup writes skipped after a store failure",
            &registry,
        )?;
        let backups_evicted_total = counter(
            "capsule_backups_evicted_total",
            "Automatic backups removed by the retention limit",
            &registry,
        )?;
        let data_files_removed_total = counter(
            "capsule_data_files_removed_total",
            "Map and reflection payloads removed as unreferenced",
            &registry,
        )?;
        let session_size_bytes = histogram(
            HistogramOpts::new("capsule_session_size_bytes", "Serialized session size in bytes")
                .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).unwrap_or_default()),
            &registry,
        )?;
        let restore_duration_seconds = histogram(
            HistogramOpts::new(
                "capsule_restore_duration_seconds",
                "Duration of session restores in seconds",
            ),
            &registry,
        )?;

        Ok(Self {
            backups_written_total,
            backups_skipped_total,
            backups_evicted_total,
            data_files_removed_total,
            session_size_bytes,
            restore_duration_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    pub fn global() -> Option<&'static CapsuleMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::error!(error = %e, "metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_backup_written(&self, size_bytes: usize) {
        self.backups_written_total.inc();
        self.session_size_bytes.observe(size_bytes as f64);
    }

    pub fn record_backup_skipped(&self) {
        self.backups_skipped_total.inc();
    }

    pub fn record_evictions(&self, count: usize) {
        self.backups_evicted_total.inc_by(count as f64);
    }

    pub fn record_data_files_removed(&self, count: usize) {
        self.data_files_removed_total.inc_by(count as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| CapsuleError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| CapsuleError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Measures a restore from creation to [`MetricsTimer::finish`]
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    pub fn start_restore() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        if let Some(metrics) = CapsuleMetrics::global() {
            metrics
                .restore_duration_seconds
                .observe(self.start.elapsed().as_secs_f64());
        }
    }
}

/// Initialize the global tracing subscriber
///
/// The filter comes from `RUST_LOG` when set, otherwise `capsule=info`.
///
/// # Arguments
/// * `json` - Emit JSON lines instead of human-readable output
///
/// # Returns
/// An error if a global subscriber is already installed
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    CapsuleMetrics::global();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false));
        set_global_default(subscriber)
    };

    result.map_err(|e| CapsuleError::validation(format!("Failed to set global tracing subscriber: {e}")))?;

    tracing::info!("capsule observability initialized");
    Ok(())
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording_and_gathering() {
        let metrics = CapsuleMetrics::global().unwrap();
        metrics.record_backup_written(2048);
        metrics.record_backup_skipped();
        metrics.record_evictions(2);
        metrics.record_data_files_removed(1);

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("capsule_backups_written_total"));
        assert!(text.contains("capsule_backups_evicted_total"));
    }

    #[test]
    fn test_metrics_timer() {
        let timer = MetricsTimer::start_restore();
        std::thread::sleep(std::time::Duration::from_millis(1));
        timer.finish();
    }
}

#[cfg(test)]
mod subscriber_tests {
    use super::*;

    #[test]
    fn test_global_subscriber_installs_once() {
        let _ = init_observability(true);
        let err = init_observability(false).unwrap_err();
        assert!(matches!(err, CapsuleError::Validation(_)));
    }
}
