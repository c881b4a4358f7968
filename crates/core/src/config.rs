//! Library configuration surface and the trivial monitoring interface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Minimal metric sink consumed by the core. Adapters to real monitoring
/// systems implement this; the core never assumes more than fire-and-forget
/// recording.
pub trait Monitor: Send + Sync {
    fn incr(&self, name: &str);
    fn record(&self, name: &str, value: f64);
}

/// Monitor that drops every metric.
#[derive(Debug, Default)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn incr(&self, _name: &str) {}
    fn record(&self, _name: &str, _value: f64) {}
}

/// In-memory monitor for tests.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    counters: Mutex<std::collections::HashMap<String, u64>>,
    values: Mutex<std::collections::HashMap<String, f64>>,
}

impl RecordingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.values.lock().get(name).copied()
    }
}

impl Monitor for RecordingMonitor {
    fn incr(&self, name: &str) {
        *self.counters.lock().entry(name.to_owned()).or_insert(0) += 1;
    }

    fn record(&self, name: &str, value: f64) {
        self.values.lock().insert(name.to_owned(), value);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeProfile {
    Development,
    Production,
    Testing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Entry-point configuration.
///
/// `worker_count` of 0 auto-detects from the hardware; the queue capacity
/// bounds per-component work queues.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub profile: RuntimeProfile,
    pub log_level: LogLevel,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub monitoring_enabled: bool,
    pub metrics_interval: Duration,
}

impl NetworkConfig {
    pub fn development() -> Self {
        Self {
            profile: RuntimeProfile::Development,
            log_level: LogLevel::Debug,
            worker_count: 2,
            queue_capacity: 10_000,
            monitoring_enabled: true,
            metrics_interval: Duration::from_secs(5),
        }
    }

    pub fn production() -> Self {
        Self {
            profile: RuntimeProfile::Production,
            log_level: LogLevel::Info,
            worker_count: 0,
            queue_capacity: 10_000,
            monitoring_enabled: true,
            metrics_interval: Duration::from_secs(5),
        }
    }

    pub fn testing() -> Self {
        Self {
            profile: RuntimeProfile::Testing,
            log_level: LogLevel::Warn,
            worker_count: 1,
            queue_capacity: 10_000,
            monitoring_enabled: false,
            metrics_interval: Duration::from_secs(5),
        }
    }

    /// Effective worker count after auto-detection.
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count != 0 {
            return self.worker_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::production()
    }
}

static TRACING_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Process-wide context created at library initialisation.
///
/// Replaces the original's global managers: callers construct one and pass
/// it (or just its monitor) to the components that need it.
pub struct NetworkContext {
    config: NetworkConfig,
    monitor: Arc<dyn Monitor>,
}

impl NetworkContext {
    /// Initialises logging per the config and returns the context. Safe to
    /// call more than once; the subscriber is only installed the first time.
    pub fn initialize(config: NetworkConfig) -> Self {
        Self::with_monitor(config, Arc::new(NullMonitor))
    }

    pub fn with_monitor(config: NetworkConfig, monitor: Arc<dyn Monitor>) -> Self {
        if TRACING_INSTALLED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.as_filter()));
            // Another subscriber may already be installed by the host
            // application; that is not an error.
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }

        Self { config, monitor }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn monitor(&self) -> Arc<dyn Monitor> {
        self.monitor.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_carry_the_documented_defaults() {
        let dev = NetworkConfig::development();
        assert_eq!(dev.worker_count, 2);
        assert_eq!(dev.log_level, LogLevel::Debug);
        assert!(dev.monitoring_enabled);

        let prod = NetworkConfig::production();
        assert_eq!(prod.worker_count, 0);
        assert!(prod.effective_worker_count() >= 1);
        assert_eq!(prod.queue_capacity, 10_000);

        let test = NetworkConfig::testing();
        assert_eq!(test.worker_count, 1);
        assert!(!test.monitoring_enabled);
    }

    #[test]
    fn recording_monitor_counts() {
        let monitor = RecordingMonitor::new();
        monitor.incr("messages_received");
        monitor.incr("messages_received");
        monitor.record("active_connections", 3.0);
        assert_eq!(monitor.counter("messages_received"), 2);
        assert_eq!(monitor.value("active_connections"), Some(3.0));
        assert_eq!(monitor.counter("unknown"), 0);
    }

    #[test]
    fn initialize_is_reentrant() {
        let _a = NetworkContext::initialize(NetworkConfig::testing());
        let _b = NetworkContext::initialize(NetworkConfig::testing());
    }
}
