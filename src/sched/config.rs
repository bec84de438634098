//! Scheduler configuration.
//!
//! Use [`SchedulerBuilder`](super::SchedulerBuilder) rather than filling
//! a [`SchedulerConfig`] by hand.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"fibril-worker"` |
//! | `steal_attempts` | 16 |
//! | `enable_parking` | true |
//! | `default_fiber_stack` | 16 frames |

/// Configuration for a [`FiberScheduler`](super::FiberScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads (0 = available parallelism).
    pub worker_threads: usize,
    /// Stack size per worker thread.
    pub thread_stack_size: usize,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// Maximum peer queues probed per steal pass (capped at the peer
    /// count).
    pub steal_attempts: usize,
    /// Park idle workers (false = spin-yield, for latency experiments).
    pub enable_parking: bool,
    /// Initial continuation-stack frame capacity for new fibers.
    pub default_fiber_stack: usize,
}

impl SchedulerConfig {
    /// Normalizes configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = Self::default_worker_threads();
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = 2 * 1024 * 1024;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "fibril-worker".to_string();
        }
        if self.steal_attempts == 0 {
            self.steal_attempts = 16;
        }
        if self.default_fiber_stack == 0 {
            self.default_fiber_stack = 16;
        }
    }

    pub(crate) fn default_worker_threads() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut config = Self {
            worker_threads: 0,
            thread_stack_size: 0,
            thread_name_prefix: String::new(),
            steal_attempts: 0,
            enable_parking: true,
            default_fiber_stack: 0,
        };
        config.normalize();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_normalized() {
        let config = SchedulerConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.thread_stack_size, 2 * 1024 * 1024);
        assert_eq!(config.thread_name_prefix, "fibril-worker");
        assert_eq!(config.steal_attempts, 16);
        assert_eq!(config.default_fiber_stack, 16);
        assert!(config.enable_parking);
    }

    #[test]
    fn normalize_fills_zeroed_fields() {
        let mut config = SchedulerConfig {
            worker_threads: 3,
            thread_stack_size: 0,
            thread_name_prefix: String::new(),
            steal_attempts: 0,
            enable_parking: false,
            default_fiber_stack: 0,
        };
        config.normalize();
        assert_eq!(config.worker_threads, 3);
        assert!(config.thread_stack_size > 0);
        assert!(!config.thread_name_prefix.is_empty());
        assert_eq!(config.steal_attempts, 16);
        assert_eq!(config.default_fiber_stack, 16);
        assert!(!config.enable_parking);
    }

    #[test]
    fn normalize_keeps_explicit_values() {
        let mut config = SchedulerConfig {
            steal_attempts: 2,
            ..SchedulerConfig::default()
        };
        config.normalize();
        assert_eq!(config.steal_attempts, 2);
    }
}
