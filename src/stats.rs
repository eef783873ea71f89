use std::time::{Duration, Instant};

/// Running totals for one capture session.
#[derive(Debug, Clone)]
pub struct RunStats {
    /// Raw bytes received across all channels
    pub total_size: usize,
    /// Events written per channel
    pub n_events: usize,
    /// Trigger cycles that completed
    pub cycles: usize,
    /// Cycles abandoned after a transient failure
    pub retries: usize,
    pub t_begin: Instant,
    last_report: Instant,
    report_every: Duration,
}

impl Default for RunStats {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            total_size: 0,
            n_events: 0,
            cycles: 0,
            retries: 0,
            t_begin: now,
            last_report: now,
            report_every: Duration::from_secs(1),
        }
    }
}

impl RunStats {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record a completed cycle that wrote `events` and moved `size` bytes.
    pub fn increment(&mut self, events: usize, size: usize) {
        self.n_events += events;
        self.total_size += size;
        self.cycles += 1;
    }

    pub fn retry(&mut self) {
        self.retries += 1;
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.t_begin.elapsed().as_secs_f64()
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.elapsed_secs().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Mean seconds per written event.
    pub fn seconds_per_event(&self) -> Option<f64> {
        (self.n_events > 0).then(|| self.elapsed_secs() / self.n_events as f64)
    }

    /// True at most once per report interval.
    pub fn report_due(&mut self) -> bool {
        if self.last_report.elapsed() >= self.report_every {
            self.last_report = Instant::now();
            true
        } else {
            false
        }
    }
}
