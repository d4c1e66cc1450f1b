//! Logging and observability
//!
//! Provides structured logging with:
//! - JSON or pretty console output on stderr
//! - Optional daily rolling log files
//! - Phase and timing helpers keyed by scan id
//! - Audit events for scan-management actions

use anyhow::{Context, Result};
use std::io;
use tracing::{info, Level};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::{config::LoggingConfig, error::ScannerError};

/// Initialize logging with specific configuration
///
/// The returned guard flushes the file writer and must outlive the program's work.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = create_env_filter(&config.level)?;

    let (file_layer, guard) = match &config.file_dir {
        Some(dir) => {
            let appender = rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = Registry::default().with(env_filter).with(file_layer);

    match config.format.as_str() {
        "json" => {
            let console_layer = fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_target(true)
                .with_thread_ids(true);

            registry
                .with(console_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
        _ => {
            let console_layer = fmt::layer()
                .pretty()
                .with_writer(io::stderr)
                .with_target(false);

            registry
                .with(console_layer)
                .try_init()
                .context("Failed to install tracing subscriber")?;
        }
    }

    info!("Logging system initialized with level: {}", config.level);
    Ok(guard)
}

/// Create environment filter from log level string
fn create_env_filter(level: &str) -> Result<EnvFilter> {
    let base_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => return Err(ScannerError::config(format!("Invalid log level: {}", level)).into()),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(base_level.into())
        .from_env()
        .context("Failed to create environment filter")?
        .add_directive("hyper=info".parse()?)
        .add_directive("reqwest=info".parse()?)
        .add_directive("rustls=warn".parse()?);

    Ok(filter)
}

#[macro_export]
macro_rules! log_scan_start {
    ($scan_kind:expr, $target:expr) => {
        tracing::info!(
            scan_kind = $scan_kind,
            target = %$target,
            event = "scan_start",
            "Starting {} of {}",
            $scan_kind,
            $target
        );
    };
}

#[macro_export]
macro_rules! log_scan_complete {
    ($scan_kind:expr, $target:expr, $duration:expr, $results:expr) => {
        tracing::info!(
            scan_kind = $scan_kind,
            target = %$target,
            duration_ms = $duration.as_millis() as u64,
            results_count = $results,
            event = "scan_complete",
            "Completed {} of {} in {}ms with {} results",
            $scan_kind,
            $target,
            $duration.as_millis(),
            $results
        );
    };
}

#[macro_export]
macro_rules! log_port_discovery {
    ($host:expr, $port:expr, $state:expr, $service:expr) => {
        tracing::info!(
            host = %$host,
            port = $port,
            state = $state,
            service = $service,
            event = "port_discovery",
            "Discovered port {}:{} - {} ({})",
            $host,
            $port,
            $state,
            $service.unwrap_or("unknown")
        );
    };
}

#[macro_export]
macro_rules! log_probe_outcome {
    ($outcome:expr) => {
        tracing::debug!(
            probe = %$outcome.name,
            status = $outcome.status.as_str(),
            elapsed_ms = $outcome.elapsed.as_millis() as u64,
            event = "probe_outcome",
            "Probe {} finished: {}",
            $outcome.name,
            $outcome.status.as_str()
        );
    };
}

#[macro_export]
macro_rules! log_waf_verdict {
    ($target:expr, $detected:expr, $waf_type:expr, $confidence:expr) => {
        tracing::info!(
            target_url = %$target,
            detected = $detected,
            waf_type = $waf_type.unwrap_or("none"),
            confidence = $confidence,
            event = "waf_verdict",
            "WAF verdict for {}: detected={} type={} confidence={:.2}",
            $target,
            $detected,
            $waf_type.unwrap_or("none"),
            $confidence
        );
    };
}

#[macro_export]
macro_rules! log_error_with_context {
    ($error:expr, $context:expr) => {
        tracing::error!(
            error = %$error,
            code = $error.code(),
            context = %$context,
            severity = %$error.severity(),
            recoverable = $error.is_recoverable(),
            event = "error",
            "Error in {}: {}",
            $context,
            $error
        );
    };
}

/// Phase logging for one orchestration run
pub struct ScanLogger {
    scan_id: String,
    scan_kind: String,
    target: String,
}

impl ScanLogger {
    pub fn new<S: Into<String>>(scan_id: S, scan_kind: S, target: S) -> Self {
        Self {
            scan_id: scan_id.into(),
            scan_kind: scan_kind.into(),
            target: target.into(),
        }
    }

    pub fn log_phase_start(&self, phase: &str) {
        tracing::info!(
            scan_id = %self.scan_id,
            scan_kind = %self.scan_kind,
            target = %self.target,
            phase = phase,
            event = "phase_start",
            "Starting {} phase for {} of {}",
            phase,
            self.scan_kind,
            self.target
        );
    }

    pub fn log_phase_complete(&self, phase: &str, duration: std::time::Duration) {
        tracing::info!(
            scan_id = %self.scan_id,
            scan_kind = %self.scan_kind,
            target = %self.target,
            phase = phase,
            duration_ms = duration.as_millis() as u64,
            event = "phase_complete",
            "Completed {} phase in {}ms",
            phase,
            duration.as_millis()
        );
    }

    pub fn log_progress(&self, current: usize, total: usize, phase: &str) {
        let percentage = if total == 0 {
            100.0
        } else {
            (current as f64 / total as f64) * 100.0
        };
        tracing::debug!(
            scan_id = %self.scan_id,
            phase = phase,
            current = current,
            total = total,
            event = "progress",
            "Progress: {}/{} ({:.1}%) in {} phase",
            current,
            total,
            percentage,
            phase
        );
    }
}

/// Logs the elapsed time of an operation when dropped
pub struct TimingLogger {
    name: String,
    start_time: std::time::Instant,
}

impl TimingLogger {
    pub fn start<S: Into<String>>(name: S) -> Self {
        let name = name.into();
        tracing::trace!(operation = %name, event = "timing_start", "Starting timing for: {}", name);

        Self {
            name,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn checkpoint(&self, checkpoint_name: &str) {
        let elapsed = self.start_time.elapsed();
        tracing::debug!(
            operation = %self.name,
            checkpoint = checkpoint_name,
            elapsed_ms = elapsed.as_millis() as u64,
            event = "timing_checkpoint",
            "Checkpoint '{}' in '{}': {}ms",
            checkpoint_name,
            self.name,
            elapsed.as_millis()
        );
    }
}

impl Drop for TimingLogger {
    fn drop(&mut self) {
        let elapsed = self.start_time.elapsed();
        tracing::info!(
            operation = %self.name,
            duration_ms = elapsed.as_millis() as u64,
            event = "timing_complete",
            "Completed '{}' in {}ms",
            self.name,
            elapsed.as_millis()
        );
    }
}

/// Audit logging for scan-management actions
pub fn log_audit_event(user: Option<&str>, action: &str, resource: &str, result: &str) {
    tracing::warn!(
        user = user.unwrap_or("system"),
        action = action,
        resource = resource,
        result = result,
        timestamp = %chrono::Utc::now().to_rfc3339(),
        event = "audit",
        "Audit: {} performed {} on {} with result: {}",
        user.unwrap_or("system"),
        action,
        resource,
        result
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_env_filter_creation() {
        assert!(create_env_filter("info").is_ok());
        assert!(create_env_filter("DEBUG").is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        assert!(create_env_filter("invalid").is_err());
    }

    #[test]
    fn test_scan_logger() {
        let logger = ScanLogger::new("test-scan", "recon", "192.168.1.1");
        logger.log_phase_start("port_scanning");
        logger.log_progress(0, 0, "script_executing");
        logger.log_phase_complete("port_scanning", Duration::from_millis(500));
    }
}
