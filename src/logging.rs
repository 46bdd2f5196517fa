use std::io;
/// Structured logging and observability utilities for CTA
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

/// Initialize structured logging with optional JSON output
pub fn init_logging(json_output: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cta=info"));

    let registry = Registry::default().with(env_filter);

    if json_output {
        // JSON output for structured logging aggregation
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::ACTIVE),
            )
            .try_init()?;
    } else {
        // Pretty console output
        registry
            .with(
                fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    }

    Ok(())
}

/// Counters collected while transporting components
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    pub blobs_uploaded: u64,
    pub blobs_skipped: u64,
    pub bytes_uploaded: u64,
    pub manifests_pushed: u64,
    pub components_transported: u64,
    pub components_skipped: u64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of blobs that were already present at the target
    pub fn dedup_rate(&self) -> f64 {
        let total = self.blobs_uploaded + self.blobs_skipped;
        if total == 0 {
            0.0
        } else {
            (self.blobs_skipped as f64) / (total as f64)
        }
    }

    pub fn merge(&mut self, other: &TransportMetrics) {
        self.blobs_uploaded += other.blobs_uploaded;
        self.blobs_skipped += other.blobs_skipped;
        self.bytes_uploaded += other.bytes_uploaded;
        self.manifests_pushed += other.manifests_pushed;
        self.components_transported += other.components_transported;
        self.components_skipped += other.components_skipped;
    }
}

/// Span event logging for blob operations
#[macro_export]
macro_rules! log_blob_skip {
    ($repo:expr, $digest:expr) => {
        tracing::debug!(
            repository = %$repo,
            digest = %$digest,
            "Blob already present, skipping upload"
        );
    };
}

#[macro_export]
macro_rules! log_blob_upload {
    ($repo:expr, $digest:expr, $size:expr) => {
        tracing::debug!(
            repository = %$repo,
            digest = %$digest,
            size_bytes = $size,
            "Uploading blob"
        );
    };
}

#[macro_export]
macro_rules! log_digest_mismatch {
    ($expected:expr, $actual:expr) => {
        tracing::error!(
            expected = %$expected,
            actual = %$actual,
            "Digest verification failed"
        );
    };
}

#[macro_export]
macro_rules! log_remote_operation {
    ($operation:expr, $status:expr, $duration_ms:expr) => {
        tracing::debug!(
            operation = $operation,
            status = $status,
            duration_ms = $duration_ms,
            "Remote operation completed"
        );
    };
}
