//! Bounded worker pool for handler execution.
//!
//! Handlers run on their own tokio tasks so a dispatcher that stops waiting
//! at a deadline never blocks on them. The pool only bounds how many run at
//! once.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

const DEFAULT_MAX_CONCURRENCY: NonZeroUsize = match NonZeroUsize::new(32) {
    Some(limit) => limit,
    None => NonZeroUsize::MIN,
};

/// Handler concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    max_concurrency: NonZeroUsize,
}

impl SchedulerConfig {
    /// Limit from a plain count, as found in settings files.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] for zero.
    pub fn with_limit(max_concurrency: usize) -> SchedulerResult<Self> {
        NonZeroUsize::new(max_concurrency)
            .map(Self::from)
            .ok_or(SchedulerError::InvalidConfig("max_concurrency must be greater than zero"))
    }

    /// Handlers allowed to execute at the same time.
    #[must_use]
    pub const fn max_concurrency(self) -> NonZeroUsize {
        self.max_concurrency
    }
}

impl From<NonZeroUsize> for SchedulerConfig {
    fn from(max_concurrency: NonZeroUsize) -> Self {
        Self { max_concurrency }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(DEFAULT_MAX_CONCURRENCY)
    }
}

/// Caps concurrent handler executions for one runtime.
///
/// Submitted work is spawned immediately and parks until a slot frees up, so
/// submission itself never waits. Closing the pool fails parked work; work
/// already executing runs to completion.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    slots: Arc<Semaphore>,
    executing: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    /// Pool sized by `config`.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.max_concurrency().get())),
            executing: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Limit this pool was built with.
    #[must_use]
    pub const fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Slots not currently held by a handler.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Handlers holding a slot right now.
    #[must_use]
    pub fn executing(&self) -> usize {
        self.executing.load(Ordering::Acquire)
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses new work and fails work still parked for a slot.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.close();
    }

    /// Runs `work` on its own task once a slot is free.
    ///
    /// The join handle resolves to [`SchedulerError::Closed`] if the pool
    /// closes before `work` obtained a slot; `work` is then never polled.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] when the pool is already closed.
    pub fn spawn<F, T>(&self, work: F) -> SchedulerResult<JoinHandle<SchedulerResult<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let slots = Arc::clone(&self.slots);
        let executing = Arc::clone(&self.executing);
        Ok(tokio::spawn(async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                return Err(SchedulerError::Closed);
            };
            let _executing = ExecutingSlot::enter(executing);
            Ok(work.await)
        }))
    }
}

/// Counts one executing handler for as long as it lives, including when the
/// handler panics and its task unwinds.
struct ExecutingSlot(Arc<AtomicUsize>);

impl ExecutingSlot {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for ExecutingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Errors produced by the worker pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// The pool no longer accepts or starts work.
    #[error("handler pool closed")]
    Closed,
    /// A limit was rejected.
    #[error("invalid handler pool configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result alias for [`SchedulerError`].
pub type SchedulerResult<T> = Result<T, SchedulerError>;
