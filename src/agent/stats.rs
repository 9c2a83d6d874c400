use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free run counters shared across the agent's loops.
///
/// Counters are cumulative: the periodic status line reports totals since
/// startup alongside the uptime, so `snapshot()` reads without resetting.
#[derive(Debug, Default)]
pub struct RunStats {
    extract_runs: AtomicU64,
    recompute_runs: AtomicU64,
    pulse_polls: AtomicU64,
    scans_inserted: AtomicU64,
    pulses_emitted: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub extract_runs: u64,
    pub recompute_runs: u64,
    pub pulse_polls: u64,
    pub scans_inserted: u64,
    pub pulses_emitted: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_extract_run(&self) {
        self.extract_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recompute_run(&self) {
        self.recompute_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pulse_poll(&self) {
        self.pulse_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scans_inserted(&self, n: u64) {
        self.scans_inserted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_pulse_emitted(&self) {
        self.pulses_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            extract_runs: self.extract_runs.load(Ordering::Relaxed),
            recompute_runs: self.recompute_runs.load(Ordering::Relaxed),
            pulse_polls: self.pulse_polls.load(Ordering::Relaxed),
            scans_inserted: self.scans_inserted.load(Ordering::Relaxed),
            pulses_emitted: self.pulses_emitted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = RunStats::new();
        stats.record_extract_run();
        stats.record_extract_run();
        stats.record_scans_inserted(17);
        stats.record_pulse_emitted();

        let snap = stats.snapshot();
        assert_eq!(snap.extract_runs, 2);
        assert_eq!(snap.scans_inserted, 17);
        assert_eq!(snap.pulses_emitted, 1);
        assert_eq!(snap.recompute_runs, 0);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let stats = RunStats::new();
        stats.record_pulse_poll();

        assert_eq!(stats.snapshot().pulse_polls, 1);
        assert_eq!(stats.snapshot().pulse_polls, 1);
    }
}
