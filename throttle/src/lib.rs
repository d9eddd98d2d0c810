//! Resource throttling for tree copies
//!
//! A tree copy starts one task per file, so the number of tasks equals the number of files in the
//! tree. This crate provides the two knobs that keep such a fan-out from exhausting the machine:
//!
//! 1. **[`Gate`]** - bounds how many copies hold open file descriptors at the same time. Every
//!    copy task still starts right away, it just parks until it gets a permit.
//! 2. **[`OpsThrottle`]** - a token bucket limiting how many filesystem operations are issued per
//!    interval. Tokens are refilled by [`OpsThrottle::run_replenish`].
//!
//! Both are per-operation values (cheap to clone, shared through an `Arc`), and both can be
//! disabled by constructing them with a limit of `0`, in which case they never wait.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! let gate = throttle::Gate::new(64);
//! let ops = throttle::OpsThrottle::per_second(1000);
//! let cancel = tokio_util::sync::CancellationToken::new();
//! tokio::spawn({
//!     let ops = ops.clone();
//!     let cancel = cancel.clone();
//!     async move { ops.run_replenish(cancel).await }
//! });
//!
//! ops.token().await;
//! let _permit = gate.permit().await;
//! // open files here - the permit is released when dropped
//! cancel.cancel();
//! # }
//! ```

mod semaphore;

/// Bounds the number of concurrently running file copies.
#[derive(Clone, Debug, Default)]
pub struct Gate {
    sem: semaphore::Semaphore,
    limit: usize,
}

/// Held while a copy has files open.
#[derive(Debug)]
pub struct GatePermit {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl Gate {
    /// Creates a gate admitting `limit` holders at once, `0` means no limit.
    ///
    /// Limits above what a tokio semaphore can hold are clamped.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            sem: semaphore::Semaphore::new(limit),
            limit: limit.min(semaphore::MAX_PERMITS),
        }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.sem.is_enabled().then_some(self.limit)
    }

    pub async fn permit(&self) -> GatePermit {
        GatePermit {
            _permit: self.sem.acquire().await,
        }
    }
}

/// Token bucket for filesystem operations.
#[derive(Clone, Debug, Default)]
pub struct OpsThrottle {
    sem: semaphore::Semaphore,
    tokens_per_interval: usize,
    interval: std::time::Duration,
}

impl OpsThrottle {
    /// Creates a bucket refilled to `tokens_per_interval` tokens every `interval`, `0` tokens
    /// disables throttling.
    #[must_use]
    pub fn new(tokens_per_interval: usize, interval: std::time::Duration) -> Self {
        Self {
            sem: semaphore::Semaphore::new(tokens_per_interval),
            tokens_per_interval: tokens_per_interval.min(semaphore::MAX_PERMITS),
            interval,
        }
    }

    /// Creates a bucket allowing `ops_per_second` operations per second, `0` disables throttling.
    ///
    /// Rates divisible by 10 are refilled every 100ms to smooth out bursts.
    #[must_use]
    pub fn per_second(ops_per_second: usize) -> Self {
        if ops_per_second >= 10 && ops_per_second.is_multiple_of(10) {
            Self::new(ops_per_second / 10, std::time::Duration::from_millis(100))
        } else {
            Self::new(ops_per_second, std::time::Duration::from_secs(1))
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.sem.is_enabled()
    }

    /// Takes one token, waiting for a refill if the bucket is empty.
    pub async fn token(&self) {
        self.sem.consume().await;
    }

    /// Refills the bucket every interval until `cancel` fires.
    ///
    /// Returns immediately when throttling is disabled.
    pub async fn run_replenish(&self, cancel: tokio_util::sync::CancellationToken) {
        if !self.sem.is_enabled() {
            return;
        }
        tracing::debug!(
            "replenishing {} ops tokens every {:?}",
            self.tokens_per_interval,
            self.interval
        );
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.interval) => {}
            }
            self.sem.top_up(self.tokens_per_interval);
        }
    }

    #[must_use]
    pub fn available(&self) -> Option<usize> {
        self.sem.available_permits()
    }
}
