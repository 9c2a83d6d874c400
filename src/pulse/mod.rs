//! Real-time throughput estimation over a live event tail.
//!
//! Window aggregation answers "how did the last hour go"; the pulse
//! estimator answers "how fast is the line moving right now". It keeps the
//! last [`PULSE_BUFFER_LEN`] completion timestamps per equipment and reports
//! the elapsed span divided by the interval count, which stays stable even
//! when single cycles jitter.

use std::collections::VecDeque;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::metrics::{delta_seconds, pairing::BoundedPairingLedger, PULSE_CT_BOUND_SECS};
use crate::scan::{self, EquipmentKind, ScanEvent};

/// Completion timestamps and paired durations retained per equipment.
pub const PULSE_BUFFER_LEN: usize = 30;

/// Pending entries retained while waiting for their completion scan.
pub const PULSE_ENTRY_CACHE_LEN: usize = 100;

/// One real-time snapshot. Emitted the moment a poll observes a completion
/// newer than anything seen before, and only then.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pulse {
    pub equipment_id: String,
    /// Station cycle time: the throughput rate for single-stage equipment,
    /// the mean of buffered entry-to-completion durations otherwise.
    pub equipment_ct: Option<f64>,
    /// Completion throughput rate over the buffer.
    pub process_ct: Option<f64>,
    pub last_serial: String,
    pub last_scan_at: NaiveDateTime,
}

/// Per-equipment estimator state.
///
/// One instance per equipment, owned by that equipment's poll path for the
/// whole agent run. Rebuilding it between polls would discard the buffers
/// the rate is computed from.
#[derive(Debug)]
pub struct PulseEstimator {
    equipment_id: String,
    kind: EquipmentKind,
    last_completion_serial: Option<String>,
    last_completion_at: Option<NaiveDateTime>,
    completion_times: VecDeque<NaiveDateTime>,
    paired_secs: VecDeque<f64>,
    entries: BoundedPairingLedger,
}

impl PulseEstimator {
    pub fn new(equipment_id: impl Into<String>, kind: EquipmentKind) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            kind,
            last_completion_serial: None,
            last_completion_at: None,
            completion_times: VecDeque::with_capacity(PULSE_BUFFER_LEN),
            paired_secs: VecDeque::with_capacity(PULSE_BUFFER_LEN),
            entries: BoundedPairingLedger::new(PULSE_ENTRY_CACHE_LEN),
        }
    }

    /// Feeds one polled tail through the estimator.
    ///
    /// Entry events refresh the pending cache unconditionally. Completion
    /// events update the buffers only when strictly newer than the last
    /// recorded completion, so re-reading an unchanged tail is a no-op and
    /// returns `None`. A pulse comes back exactly when at least one new
    /// completion was seen, even if neither cycle time cleared its bound.
    pub fn ingest(&mut self, tail: &[ScanEvent]) -> Option<Pulse> {
        let mut new_completion = false;

        for event in tail {
            if scan::is_entry(&event.status) {
                self.entries
                    .record_entry(&event.serial_number, event.timestamp);
                continue;
            }
            if !scan::is_completion(&event.status) {
                continue;
            }
            if let Some(last) = self.last_completion_at {
                if event.timestamp <= last {
                    continue;
                }
            }
            new_completion = true;

            self.completion_times.push_back(event.timestamp);
            if self.completion_times.len() > PULSE_BUFFER_LEN {
                self.completion_times.pop_front();
            }

            if self.kind == EquipmentKind::PairedStage {
                if let Some(secs) = self.entries.complete(&event.serial_number, event.timestamp) {
                    if secs > 0.0 && secs < PULSE_CT_BOUND_SECS {
                        self.paired_secs.push_back(secs);
                        if self.paired_secs.len() > PULSE_BUFFER_LEN {
                            self.paired_secs.pop_front();
                        }
                    }
                }
            }

            self.last_completion_serial = Some(event.serial_number.clone());
            self.last_completion_at = Some(event.timestamp);
        }

        if !new_completion {
            return None;
        }

        let process_ct = self.throughput_rate();
        let equipment_ct = match self.kind {
            EquipmentKind::SingleStage => process_ct,
            EquipmentKind::PairedStage => self.paired_mean(),
        };

        // Both are set on the new-completion path above.
        let last_serial = self.last_completion_serial.clone()?;
        let last_scan_at = self.last_completion_at?;

        Some(Pulse {
            equipment_id: self.equipment_id.clone(),
            equipment_ct: equipment_ct.map(round2),
            process_ct: process_ct.map(round2),
            last_serial,
            last_scan_at,
        })
    }

    /// Elapsed span across the completion buffer divided by the number of
    /// intervals it covers. None until two completions are buffered.
    fn throughput_rate(&self) -> Option<f64> {
        if self.completion_times.len() < 2 {
            return None;
        }
        let oldest = *self.completion_times.front()?;
        let newest = *self.completion_times.back()?;
        let rate = delta_seconds(oldest, newest) / (self.completion_times.len() - 1) as f64;
        in_pulse_band(rate)
    }

    fn paired_mean(&self) -> Option<f64> {
        if self.paired_secs.is_empty() {
            return None;
        }
        let mean = self.paired_secs.iter().sum::<f64>() / self.paired_secs.len() as f64;
        in_pulse_band(mean)
    }
}

fn in_pulse_band(secs: f64) -> Option<f64> {
    if secs > 0.0 && secs <= PULSE_CT_BOUND_SECS {
        Some(secs)
    } else {
        None
    }
}

fn round2(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};

    use super::*;

    fn at(offset_secs: i64) -> NaiveDateTime {
        let t0 = NaiveDate::from_ymd_opt(2024, 3, 12)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        t0 + Duration::seconds(offset_secs)
    }

    fn ev(serial: &str, status: &str, offset_secs: i64) -> ScanEvent {
        ScanEvent::new("EQ-01", serial, status, at(offset_secs))
    }

    #[test]
    fn test_unchanged_tail_emits_once() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::SingleStage);
        let tail = vec![ev("S1", "BCMP", 0), ev("S2", "BCMP", 10)];

        assert!(est.ingest(&tail).is_some());
        assert!(est.ingest(&tail).is_none());
        assert!(est.ingest(&tail).is_none());
    }

    #[test]
    fn test_throughput_rate_over_buffer() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::SingleStage);
        let tail = vec![
            ev("S1", "BCMP", 0),
            ev("S2", "BCMP", 10),
            ev("S3", "BCMP", 20),
        ];
        let pulse = est.ingest(&tail).unwrap();

        // Span 20s over 2 intervals.
        assert_eq!(pulse.process_ct, Some(10.0));
        assert_eq!(pulse.equipment_ct, Some(10.0));
        assert_eq!(pulse.last_serial, "S3");
        assert_eq!(pulse.last_scan_at, at(20));
    }

    #[test]
    fn test_first_completion_pulses_without_rate() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::SingleStage);
        let pulse = est.ingest(&[ev("S1", "BCMP", 0)]).unwrap();

        assert_eq!(pulse.process_ct, None);
        assert_eq!(pulse.equipment_ct, None);
        assert_eq!(pulse.last_serial, "S1");
    }

    #[test]
    fn test_paired_stage_reports_pair_mean() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::PairedStage);
        let tail = vec![
            ev("S1", "BREQ", 0),
            ev("S1", "BCMP", 12),
            ev("S2", "BREQ", 20),
            ev("S2", "BCMP", 34),
        ];
        let pulse = est.ingest(&tail).unwrap();

        // Pairs [12, 14]; completion span 22s over 1 interval.
        assert_eq!(pulse.equipment_ct, Some(13.0));
        assert_eq!(pulse.process_ct, Some(22.0));
    }

    #[test]
    fn test_monotonicity_guard_skips_older_completions() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::SingleStage);
        assert!(est.ingest(&[ev("S5", "BCMP", 100)]).is_some());

        // A tail replaying an older record plus one new completion.
        let tail = vec![ev("S4", "BCMP", 50), ev("S6", "BCMP", 110)];
        let pulse = est.ingest(&tail).unwrap();

        assert_eq!(pulse.process_ct, Some(10.0));
        assert_eq!(pulse.last_serial, "S6");
    }

    #[test]
    fn test_buffer_rolls_over_at_capacity() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::SingleStage);
        let mut last = None;
        for i in 0..35 {
            let tail = vec![ev(&format!("S{i}"), "BCMP", i * 10)];
            last = est.ingest(&tail);
        }

        // Buffer holds completions 5..=34: span 290s over 29 intervals.
        let pulse = last.unwrap();
        assert_eq!(pulse.process_ct, Some(10.0));
        assert_eq!(est.completion_times.len(), PULSE_BUFFER_LEN);
    }

    #[test]
    fn test_out_of_band_pair_dropped_but_pulse_still_emitted() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::PairedStage);
        let tail = vec![ev("S1", "BREQ", 0), ev("S1", "BCMP", 700)];
        let pulse = est.ingest(&tail).unwrap();

        assert_eq!(pulse.equipment_ct, None);
        assert_eq!(pulse.process_ct, None);
        assert_eq!(pulse.last_serial, "S1");
        assert!(est.paired_secs.is_empty());
    }

    #[test]
    fn test_entry_cache_eviction_loses_oldest_pair() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::PairedStage);

        let mut tail: Vec<ScanEvent> = (0..=100)
            .map(|i| ev(&format!("S{i}"), "BREQ", i))
            .collect();
        tail.push(ev("S0", "BCMP", 200));
        tail.push(ev("S1", "BCMP", 210));

        let pulse = est.ingest(&tail).unwrap();

        // S0 was evicted when entry 101 arrived; only S1 pairs (209s).
        assert_eq!(pulse.equipment_ct, Some(209.0));
        assert_eq!(est.paired_secs.len(), 1);
    }

    #[test]
    fn test_pulse_rounds_to_two_decimals() {
        let mut est = PulseEstimator::new("EQ-01", EquipmentKind::SingleStage);
        let t0 = at(0);
        let tail = vec![
            ScanEvent::new("EQ-01", "S1", "BCMP", t0),
            ScanEvent::new("EQ-01", "S2", "BCMP", t0 + Duration::milliseconds(3333)),
            ScanEvent::new("EQ-01", "S3", "BCMP", t0 + Duration::milliseconds(6666)),
        ];
        let pulse = est.ingest(&tail).unwrap();
        assert_eq!(pulse.process_ct, Some(3.33));
    }

    #[test]
    fn test_states_do_not_bleed_across_estimators() {
        let mut a = PulseEstimator::new("EQ-01", EquipmentKind::SingleStage);
        let mut b = PulseEstimator::new("EQ-02", EquipmentKind::SingleStage);

        assert!(a.ingest(&[ev("S1", "BCMP", 0)]).is_some());
        let pulse = b.ingest(&[ev("S1", "BCMP", 0)]).unwrap();
        assert_eq!(pulse.equipment_id, "EQ-02");
        assert_eq!(b.completion_times.len(), 1);
    }
}
