//! Trailing time-bounded health window.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use payfirst_core::HealthSummary;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    /// Percent.
    pub min_success_rate: f64,
    /// Percent.
    pub max_error_rate: f64,
    pub max_avg_processing_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 95.0,
            max_error_rate: 5.0,
            max_avg_processing_ms: 20_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    at: DateTime<Utc>,
    success: bool,
    processing_ms: u64,
}

/// Outcomes from the last `span`, with running sums so that recording and
/// summarising are O(1) amortised.
#[derive(Debug)]
pub struct HealthWindow {
    span: Duration,
    outcomes: VecDeque<Outcome>,
    successes: u64,
    failures: u64,
    total_processing_ms: u128,
}

impl HealthWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            outcomes: VecDeque::new(),
            successes: 0,
            failures: 0,
            total_processing_ms: 0,
        }
    }

    pub fn record_at(&mut self, at: DateTime<Utc>, success: bool, processing_ms: u64) {
        self.outcomes.push_back(Outcome {
            at,
            success,
            processing_ms,
        });
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_processing_ms += u128::from(processing_ms);
        self.prune(at);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now
            .checked_sub_signed(self.span)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        while let Some(oldest) = self.outcomes.front() {
            if oldest.at >= cutoff {
                break;
            }
            let oldest = *oldest;
            self.outcomes.pop_front();
            if oldest.success {
                self.successes -= 1;
            } else {
                self.failures -= 1;
            }
            self.total_processing_ms -= u128::from(oldest.processing_ms);
        }
    }

    pub fn summary_at(&mut self, now: DateTime<Utc>, thresholds: &HealthThresholds) -> HealthSummary {
        self.prune(now);
        let attempts = self.successes + self.failures;
        let window_secs = self.span.num_seconds().max(0) as u64;

        if attempts == 0 {
            return HealthSummary {
                window_secs,
                attempts: 0,
                successes: 0,
                failures: 0,
                success_rate: 100.0,
                error_rate: 0.0,
                avg_processing_ms: 0.0,
                is_healthy: true,
            };
        }

        let success_rate = self.successes as f64 / attempts as f64 * 100.0;
        let error_rate = self.failures as f64 / attempts as f64 * 100.0;
        let avg_processing_ms = self.total_processing_ms as f64 / attempts as f64;
        let is_healthy = success_rate >= thresholds.min_success_rate
            && error_rate <= thresholds.max_error_rate
            && avg_processing_ms <= thresholds.max_avg_processing_ms;

        HealthSummary {
            window_secs,
            attempts,
            successes: self.successes,
            failures: self.failures,
            success_rate,
            error_rate,
            avg_processing_ms,
            is_healthy,
        }
    }
}
