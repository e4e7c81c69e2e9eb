use std::fmt;
use std::time::Duration;

/// Counters of a fuzzing session, as read by progress reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub trials: u64,
    pub valid_trials: u64,
    pub cycles_completed: usize,
    pub saved_inputs: usize,
    pub favored_inputs: usize,
    pub total_coverage: usize,
    pub valid_coverage: usize,
    pub total_coverage_percent: f64,
    pub valid_coverage_percent: f64,
    /// Executions per second since the previous refresh.
    pub interval_exec_rate: f64,
    /// Executions per second over the whole session.
    pub overall_exec_rate: f64,
}

impl StatsSnapshot {
    /// One `plot_data` line.
    pub fn plot_line(&self) -> String {
        format!(
            "time: {}, trials: {}, valid: {}, fuzz_cycle: {}, saved_inputs: {}, total_cov: {:.2}%, valid_cov: {:.2}%, fps: {:.2}",
            self.elapsed.as_secs(),
            self.trials,
            self.valid_trials,
            self.cycles_completed,
            self.saved_inputs,
            self.total_coverage_percent,
            self.valid_coverage_percent,
            self.interval_exec_rate,
        )
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "elapsed {}s | trials {} ({} valid) | cycles {} | queue {} ({} favored) | cov {} ({:.2}%) valid {} ({:.2}%) | {:.2} exec/s ({:.2} overall)",
            self.elapsed.as_secs(),
            self.trials,
            self.valid_trials,
            self.cycles_completed,
            self.saved_inputs,
            self.favored_inputs,
            self.total_coverage,
            self.total_coverage_percent,
            self.valid_coverage,
            self.valid_coverage_percent,
            self.interval_exec_rate,
            self.overall_exec_rate,
        )
    }
}

/// The libFuzzer-compatible status line.
pub fn status_line(trials: u64, coverage: usize, exec_rate: f64, input_len: usize) -> String {
    format!("#{trials}\tNEW\tcov: {coverage} exec/s: {exec_rate:.0} L: {input_len}")
}

/// Executions per second, zero when no time has passed.
pub fn exec_rate(trials: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { trials as f64 / secs } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plot_line_lists_every_field() {
        let stats = StatsSnapshot {
            elapsed: Duration::from_secs(12),
            trials: 1000,
            valid_trials: 600,
            cycles_completed: 3,
            saved_inputs: 14,
            total_coverage_percent: 1.5,
            valid_coverage_percent: 0.25,
            interval_exec_rate: 83.333,
            ..StatsSnapshot::default()
        };
        assert_eq!(
            stats.plot_line(),
            "time: 12, trials: 1000, valid: 600, fuzz_cycle: 3, saved_inputs: 14, total_cov: 1.50%, valid_cov: 0.25%, fps: 83.33"
        );
    }

    #[test]
    fn status_line_matches_libfuzzer_format() {
        assert_eq!(status_line(42, 17, 1234.4, 8), "#42\tNEW\tcov: 17 exec/s: 1234 L: 8");
    }

    #[test]
    fn exec_rate_handles_zero_elapsed() {
        assert_eq!(exec_rate(10, Duration::ZERO), 0.0);
        assert_eq!(exec_rate(10, Duration::from_secs(2)), 5.0);
    }
}
