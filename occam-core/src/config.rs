use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

static CONFIG: Lazy<Config> = Lazy::new(Config::default);

/// Process-wide tuning knobs, read lazily by the scheduler and the
/// thread pool. Setters may be chained before any task is started.
#[repr(C)]
#[derive(Debug)]
pub struct Config {
    stack_size: AtomicUsize,
    poll_interval_millis: AtomicU64,
    deque_capacity: AtomicUsize,
}

impl Config {
    pub fn get_instance() -> &'static Config {
        &CONFIG
    }

    /// Stack size of pooled worker threads.
    #[must_use]
    pub fn get_stack_size(&self) -> usize {
        self.stack_size.load(Ordering::Acquire)
    }

    /// Interval between two rebalancing passes of the coordinator.
    #[must_use]
    pub fn get_poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis.load(Ordering::Acquire))
    }

    /// Initial capacity of worker deques and the global overflow queue.
    #[must_use]
    pub fn get_deque_capacity(&self) -> usize {
        self.deque_capacity.load(Ordering::Acquire)
    }

    /// Number of cores the coordinator balances the worker count against.
    #[must_use]
    pub fn get_core_count(&self) -> usize {
        num_cpus::get()
    }

    pub fn set_stack_size(&self, stack_size: usize) -> &Self {
        assert!(stack_size > 0, "stack_size must be greater than 0");
        self.stack_size.store(stack_size, Ordering::Release);
        self
    }

    pub fn set_poll_interval(&self, poll_interval: Duration) -> &Self {
        assert!(
            !poll_interval.is_zero(),
            "poll_interval must be greater than 0"
        );
        self.poll_interval_millis
            .store(u64::try_from(poll_interval.as_millis()).unwrap_or(u64::MAX), Ordering::Release);
        self
    }

    pub fn set_deque_capacity(&self, deque_capacity: usize) -> &Self {
        assert!(deque_capacity > 0, "deque_capacity must be greater than 0");
        self.deque_capacity.store(deque_capacity, Ordering::Release);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_size: AtomicUsize::new(1024 * 1024),
            poll_interval_millis: AtomicU64::new(10),
            deque_capacity: AtomicUsize::new(100),
        }
    }
}
