//! Retry primitives for convergent repair.
//!
//! The enrollment engine never holds a lock across a multi-step cascade, so
//! two kinds of retry show up everywhere:
//!
//! - **Bounded loops** around an optimistic write that may lose a race
//!   ([`RetryBudget`]).
//! - **Cross-pass tracking** of resources that keep failing to repair, so a
//!   background loop can stop hammering them and escalate instead
//!   ([`RetryTracker`]).
//!
//! # Invariants
//!
//! - A budget never grants more than `max_attempts` attempts.
//! - Tracker decisions depend only on recorded failures and the window.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors raised by retry helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// All attempts were consumed without success.
    #[error("retry budget exhausted after {attempts} attempts for {operation}")]
    Exhausted { operation: String, attempts: u32 },
}

/// Outcome of a single repair attempt on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStatus {
    /// The resource satisfies its invariants again.
    Converged,

    /// Progress was made but another pass is needed.
    Converging,

    /// The resource could not be repaired and needs an operator.
    Diverged,
}

impl RepairStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

/// A bounded number of attempts for one operation.
///
/// ```
/// use hermes_reconcile::RetryBudget;
///
/// let mut budget = RetryBudget::new("adjust", 2);
/// assert!(budget.try_next().is_ok());
/// assert!(budget.try_next().is_ok());
/// assert!(budget.try_next().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct RetryBudget {
    operation: &'static str,
    max_attempts: u32,
    used: u32,
}

impl RetryBudget {
    /// Create a budget; a zero maximum still allows one attempt.
    pub fn new(operation: &'static str, max_attempts: u32) -> Self {
        Self {
            operation,
            max_attempts: max_attempts.max(1),
            used: 0,
        }
    }

    /// Consume one attempt, returning its 1-based number.
    pub fn try_next(&mut self) -> Result<u32, ReconcileError> {
        if self.used >= self.max_attempts {
            return Err(ReconcileError::Exhausted {
                operation: self.operation.to_string(),
                attempts: self.used,
            });
        }
        self.used += 1;
        Ok(self.used)
    }

    /// Number of attempts consumed so far.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// True once at least one attempt has been consumed and failed over.
    pub fn is_retrying(&self) -> bool {
        self.used > 1
    }
}

/// Retry tracker for resources that repeatedly fail to repair.
#[derive(Debug, Clone)]
pub struct RetryTracker<K: Ord + Clone> {
    /// Maximum failures per resource inside one window.
    max_retries: u32,

    /// Window after which the failure count resets.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<K, (u32, Instant)>,
}

impl<K: Ord + Clone> RetryTracker<K> {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.clone()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, key: &K) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Number of failures recorded for a resource in the current window.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|(count, _)| *count).unwrap_or(0)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, key: &K) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default interval between repair passes.
pub const DEFAULT_REPAIR_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of failed repairs before a resource is escalated.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);
