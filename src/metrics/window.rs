//! Windowed metrics aggregation over an ordered scan sequence.

use chrono::NaiveDateTime;

use crate::scan::{self, EquipmentKind, ScanEvent};

use super::{delta_seconds, filter_outliers, pairing, WINDOW_CT_BOUND_SECS};

/// One equipment's computed metrics for one aggregation window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowMetrics {
    /// Equipment-level cycle time: paired entry-to-completion durations for
    /// paired-stage equipment, consecutive completions otherwise.
    pub equipment_ct: Option<f64>,
    /// Process-level cycle time: always consecutive completions.
    pub process_ct: Option<f64>,
    pub pieces_ok: u32,
    pub pieces_ng: u32,
    /// Samples behind `equipment_ct` after outlier rejection.
    pub valid_samples: u32,
    pub outliers_removed: u32,
    pub std_dev: f64,
}

/// Consecutive completion-to-completion deltas, bounded to `(0, 300)`
/// seconds. Non-completion events are skipped over; a delta spans them.
pub fn consecutive_completion_deltas(events: &[ScanEvent]) -> Vec<f64> {
    let mut deltas = Vec::new();
    let mut last: Option<NaiveDateTime> = None;

    for event in events {
        if !scan::is_completion(&event.status) {
            continue;
        }
        if let Some(prev) = last {
            let secs = delta_seconds(prev, event.timestamp);
            if secs > 0.0 && secs < WINDOW_CT_BOUND_SECS {
                deltas.push(secs);
            }
        }
        last = Some(event.timestamp);
    }

    deltas
}

/// Aggregates one window of time-ordered events into a metrics snapshot.
///
/// Two series come out of the same events: the process series (always
/// consecutive completions) and the equipment series (paired durations for
/// PairedStage, falling back to the process series when no pair matched;
/// aliased to the process series for SingleStage). Each series goes through
/// the outlier filter independently; the equipment series drives the
/// sample-count and deviation bookkeeping. Fewer than two events yield an
/// empty snapshot.
pub fn aggregate_window(events: &[ScanEvent], kind: EquipmentKind) -> WindowMetrics {
    if events.len() < 2 {
        return WindowMetrics::default();
    }

    let process_series = consecutive_completion_deltas(events);

    let equipment_series = match kind {
        EquipmentKind::SingleStage => process_series.clone(),
        EquipmentKind::PairedStage => {
            let paired = pairing::paired_durations(events);
            if paired.is_empty() {
                // No entry ever matched; fall back to completion spacing.
                process_series.clone()
            } else {
                paired
            }
        }
    };

    let equipment_out = filter_outliers(&equipment_series);
    let process_out = filter_outliers(&process_series);

    let mut metrics = WindowMetrics {
        equipment_ct: equipment_out.average,
        process_ct: process_out.average,
        valid_samples: equipment_out.valid_count as u32,
        outliers_removed: equipment_out.outliers_removed as u32,
        std_dev: equipment_out.std_dev,
        ..WindowMetrics::default()
    };

    // Piece totals are plain status counts, independent of pairing.
    for event in events {
        if scan::is_ok(&event.status) {
            metrics.pieces_ok += 1;
        }
        if scan::is_ng(&event.status) {
            metrics.pieces_ng += 1;
        }
    }

    metrics
}
