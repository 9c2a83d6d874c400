//! Cycle-time math: sample derivation, outlier rejection, window snapshots.

pub mod filter;
pub mod pairing;
pub mod window;

use chrono::NaiveDateTime;

pub use filter::{filter_outliers, FilterOutcome};
pub use window::{aggregate_window, WindowMetrics};

/// Acceptance bound for window cycle-time samples, exclusive.
///
/// Samples at or beyond five minutes are clock anomalies or multi-shift
/// stragglers, not cycles.
pub const WINDOW_CT_BOUND_SECS: f64 = 300.0;

/// Acceptance bound for real-time pulse estimates, inclusive.
pub const PULSE_CT_BOUND_SECS: f64 = 600.0;

/// Elapsed seconds from `earlier` to `later`, negative if out of order.
pub fn delta_seconds(earlier: NaiveDateTime, later: NaiveDateTime) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}
