//! Time-bounded rolling window of call outcomes
//!
//! Samples are kept in arrival order. Writers evict expired samples from the
//! front; readers skip them without mutating, so a read never changes what the
//! next read sees.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Outcome of a single protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The operation returned a result
    Success,
    /// The operation returned an error
    Failure,
    /// The operation exceeded its deadline
    Timeout,
}

impl Outcome {
    /// Timeouts are failures as far as the failure rate is concerned
    #[must_use]
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Success)
    }

    /// Label used in logs and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
        }
    }
}

/// One recorded outcome
#[derive(Debug, Clone, Copy)]
pub struct WindowSample {
    /// When the outcome was recorded
    pub at: Instant,
    /// What happened
    pub outcome: Outcome,
}

/// Per-outcome counts inside the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    /// Successful calls
    pub successes: usize,
    /// Failed calls
    pub failures: usize,
    /// Timed-out calls
    pub timeouts: usize,
}

impl WindowCounts {
    /// Total samples
    #[must_use]
    pub fn total(&self) -> usize {
        self.successes + self.failures + self.timeouts
    }

    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure => self.failures += 1,
            Outcome::Timeout => self.timeouts += 1,
        }
    }

    fn remove(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.successes = self.successes.saturating_sub(1),
            Outcome::Failure => self.failures = self.failures.saturating_sub(1),
            Outcome::Timeout => self.timeouts = self.timeouts.saturating_sub(1),
        }
    }
}

/// Sliding window of recent outcomes
#[derive(Debug)]
pub struct RollingWindow {
    samples: VecDeque<WindowSample>,
    /// Running counts over everything in `samples`
    counts: WindowCounts,
    /// Maximum sample age
    span: Duration,
    /// Samples required before a rate is reported
    minimum_throughput: usize,
}

impl RollingWindow {
    /// Create an empty window
    #[must_use]
    pub fn new(span: Duration, minimum_throughput: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            counts: WindowCounts::default(),
            span,
            minimum_throughput,
        }
    }

    /// Window span
    #[must_use]
    pub fn span(&self) -> Duration {
        self.span
    }

    /// Append an outcome and evict samples that fell out of the window
    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        self.evict(now);
        self.samples.push_back(WindowSample { at: now, outcome });
        self.counts.add(outcome);
    }

    /// Counts of samples still inside the window at `now`
    #[must_use]
    pub fn counts(&self, now: Instant) -> WindowCounts {
        let mut counts = self.counts;
        for sample in self.expired(now) {
            counts.remove(sample.outcome);
        }
        counts
    }

    /// Number of samples inside the window at `now`
    #[must_use]
    pub fn count(&self, now: Instant) -> usize {
        self.counts(now).total()
    }

    /// Failure rate (failures + timeouts over total)
    ///
    /// `None` until the window holds `minimum_throughput` samples.
    #[must_use]
    pub fn failure_rate(&self, now: Instant) -> Option<f64> {
        let counts = self.counts(now);
        let total = counts.total();
        if total == 0 || total < self.minimum_throughput {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = (counts.failures + counts.timeouts) as f64 / total as f64;
        Some(rate)
    }

    /// Success rate, under the same throughput rule as [`Self::failure_rate`]
    #[must_use]
    pub fn success_rate(&self, now: Instant) -> Option<f64> {
        let counts = self.counts(now);
        let total = counts.total();
        if total == 0 || total < self.minimum_throughput {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = counts.successes as f64 / total as f64;
        Some(rate)
    }

    /// Drop every sample
    pub fn clear(&mut self) {
        self.samples.clear();
        self.counts = WindowCounts::default();
    }

    /// Change span and throughput, keeping current samples
    pub fn reconfigure(&mut self, span: Duration, minimum_throughput: usize) {
        self.span = span;
        self.minimum_throughput = minimum_throughput;
    }

    /// Samples at the front that are older than the window at `now`
    fn expired(&self, now: Instant) -> impl Iterator<Item = &WindowSample> {
        let span = self.span;
        self.samples
            .iter()
            .take_while(move |s| now.saturating_duration_since(s.at) > span)
    }

    fn evict(&mut self, now: Instant) {
        while let Some(sample) = self.samples.front() {
            if now.saturating_duration_since(sample.at) > self.span {
                self.counts.remove(sample.outcome);
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
