use std::time::{Duration, Instant};

use log::info;

use crate::harness::ExecutionStatus;

/// How often `maybe_report` actually logs.
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Running totals for the fuzzing loop, reported periodically.
#[derive(Debug)]
pub struct FuzzerStats {
    started: Instant,
    last_report: Instant,
    report_interval: Duration,
    pub total_iterations: u64,
    pub successes: u64,
    pub exceptions: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub corpus_admissions: u64,
    pub mutations_without_target: u64,
    pub entries_disabled: u64,
}

impl Default for FuzzerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzerStats {
    pub fn new() -> Self {
        let now = Instant::now();
        FuzzerStats {
            started: now,
            last_report: now,
            report_interval: REPORT_INTERVAL,
            total_iterations: 0,
            successes: 0,
            exceptions: 0,
            crashes: 0,
            timeouts: 0,
            corpus_admissions: 0,
            mutations_without_target: 0,
            entries_disabled: 0,
        }
    }

    pub fn record_status(&mut self, status: &ExecutionStatus) {
        self.total_iterations += 1;
        match status {
            ExecutionStatus::Success => self.successes += 1,
            ExecutionStatus::ExceptionThrown(_) => self.exceptions += 1,
            ExecutionStatus::Crash(_) | ExecutionStatus::ExceptionCrash => self.crashes += 1,
            ExecutionStatus::Timeout => self.timeouts += 1,
            ExecutionStatus::InternalError => {}
        }
    }

    pub fn record_admission(&mut self) {
        self.corpus_admissions += 1;
    }

    pub fn record_no_target(&mut self) {
        self.mutations_without_target += 1;
    }

    pub fn record_disabled(&mut self, count: usize) {
        self.entries_disabled += count as u64;
    }

    /// Iterations per second since the loop started.
    pub fn iterations_per_second(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.total_iterations as f64 / elapsed
    }

    /// Log a progress line when the report interval has elapsed.
    pub fn maybe_report(&mut self, corpus_size: usize, triggered_edges: usize) {
        if self.last_report.elapsed() < self.report_interval {
            return;
        }
        self.last_report = Instant::now();
        info!(
            "iter {} ({:.1}/s) | corpus {} (+{}, -{}) | edges {} | success {} exception {} crash {} timeout {}",
            self.total_iterations,
            self.iterations_per_second(),
            corpus_size,
            self.corpus_admissions,
            self.entries_disabled,
            triggered_edges,
            self.successes,
            self.exceptions,
            self.crashes,
            self.timeouts,
        );
    }

    #[cfg(test)]
    fn with_report_interval(interval: Duration) -> Self {
        let mut stats = Self::new();
        stats.report_interval = interval;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_status_buckets_outcomes() {
        let mut stats = FuzzerStats::new();
        stats.record_status(&ExecutionStatus::Success);
        stats.record_status(&ExecutionStatus::ExceptionThrown(1));
        stats.record_status(&ExecutionStatus::Crash(11));
        stats.record_status(&ExecutionStatus::ExceptionCrash);
        stats.record_status(&ExecutionStatus::Timeout);

        assert_eq!(stats.total_iterations, 5);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.exceptions, 1);
        assert_eq!(stats.crashes, 2);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    fn test_maybe_report_respects_interval() {
        let mut stats = FuzzerStats::with_report_interval(Duration::from_secs(3600));
        let before = stats.last_report;
        stats.maybe_report(0, 0);
        assert_eq!(stats.last_report, before);

        let mut eager = FuzzerStats::with_report_interval(Duration::ZERO);
        let before = eager.last_report;
        eager.maybe_report(0, 0);
        assert!(eager.last_report >= before);
    }

    #[test]
    fn test_iterations_per_second_is_finite() {
        let mut stats = FuzzerStats::new();
        for _ in 0..10 {
            stats.record_status(&ExecutionStatus::Success);
        }
        assert!(stats.iterations_per_second().is_finite());
        assert!(stats.iterations_per_second() >= 0.0);
    }
}
