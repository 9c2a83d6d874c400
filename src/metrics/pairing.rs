//! Entry-to-completion pairing per equipment serial.

use std::collections::{HashMap, VecDeque};

use chrono::NaiveDateTime;

use crate::scan::{self, ScanEvent};

use super::{delta_seconds, WINDOW_CT_BOUND_SECS};

/// Pending-entry ledger for one equipment.
///
/// Records the latest Entry timestamp per serial (a repeated Entry for the
/// same serial overwrites the earlier one) and yields the elapsed seconds
/// when the serial's Completion arrives. A Completion without a pending
/// entry yields nothing; the event still counts toward piece totals and
/// consecutive-completion samples elsewhere.
#[derive(Debug, Default)]
pub struct PairingLedger {
    pending: HashMap<String, NaiveDateTime>,
}

impl PairingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last entry wins: a repeated Entry replaces the pending timestamp.
    pub fn record_entry(&mut self, serial: &str, ts: NaiveDateTime) {
        self.pending.insert(serial.to_string(), ts);
    }

    /// Consumes the pending entry for `serial` and returns the raw elapsed
    /// seconds from entry to completion. The entry is consumed even when
    /// the caller goes on to reject the duration.
    pub fn complete(&mut self, serial: &str, ts: NaiveDateTime) -> Option<f64> {
        self.pending
            .remove(serial)
            .map(|entry_ts| delta_seconds(entry_ts, ts))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Walks an ordered event window and returns the accepted paired durations,
/// bounded to `(0, 300)` seconds.
pub fn paired_durations(events: &[ScanEvent]) -> Vec<f64> {
    let mut ledger = PairingLedger::new();
    let mut durations = Vec::new();

    for event in events {
        if scan::is_entry(&event.status) {
            ledger.record_entry(&event.serial_number, event.timestamp);
        } else if scan::is_completion(&event.status) {
            if let Some(secs) = ledger.complete(&event.serial_number, event.timestamp) {
                if secs > 0.0 && secs < WINDOW_CT_BOUND_SECS {
                    durations.push(secs);
                }
            }
        }
    }

    durations
}

/// Pairing ledger with a hard cap on pending entries.
///
/// The pulse estimator runs unbounded in time, so equipment that emits
/// entries without ever completing would otherwise grow the ledger forever.
/// On overflow the oldest-inserted entry is evicted first; a repeated Entry
/// refreshes its timestamp in place without changing its eviction position.
#[derive(Debug)]
pub struct BoundedPairingLedger {
    pending: VecDeque<(String, NaiveDateTime)>,
    capacity: usize,
}

impl BoundedPairingLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::with_capacity(capacity.min(128)),
            capacity,
        }
    }

    pub fn record_entry(&mut self, serial: &str, ts: NaiveDateTime) {
        if let Some(slot) = self
            .pending
            .iter_mut()
            .find(|(s, _)| s.as_str() == serial)
        {
            slot.1 = ts;
            return;
        }

        self.pending.push_back((serial.to_string(), ts));
        while self.pending.len() > self.capacity {
            self.pending.pop_front();
        }
    }

    /// Consumes the pending entry for `serial` and returns the raw elapsed
    /// seconds from entry to completion.
    pub fn complete(&mut self, serial: &str, ts: NaiveDateTime) -> Option<f64> {
        let idx = self
            .pending
            .iter()
            .position(|(s, _)| s.as_str() == serial)?;
        let (_, entry_ts) = self.pending.remove(idx)?;
        Some(delta_seconds(entry_ts, ts))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    use super::*;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 12)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn ev(serial: &str, status: &str, offset_secs: i64) -> ScanEvent {
        ScanEvent::new(
            "EQ-01",
            serial,
            status,
            t0() + Duration::seconds(offset_secs),
        )
    }

    #[test]
    fn test_single_pair_with_unmatched_completion() {
        // Entry(S1, t0), Completion(S1, t0+12), Completion(S2, t0+5) with no
        // entry for S2: exactly one paired duration, cache drained.
        let events = vec![
            ev("S1", "BREQ", 0),
            ev("S2", "BCMP", 5),
            ev("S1", "BCMP", 12),
        ];

        let mut ledger = PairingLedger::new();
        let mut durations = Vec::new();
        for e in &events {
            if crate::scan::is_entry(&e.status) {
                ledger.record_entry(&e.serial_number, e.timestamp);
            } else if let Some(d) = ledger.complete(&e.serial_number, e.timestamp) {
                durations.push(d);
            }
        }

        assert_eq!(durations, vec![12.0]);
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn test_last_entry_wins() {
        let events = vec![
            ev("S1", "BREQ", 0),
            ev("S1", "BREQ", 20),
            ev("S1", "BCMP", 35),
        ];
        let durations = paired_durations(&events);
        assert_eq!(durations, vec![15.0]);
    }

    #[test]
    fn test_window_bound_rejects_straggler() {
        let events = vec![ev("S1", "BREQ", 0), ev("S1", "BCMP", 305)];
        assert!(paired_durations(&events).is_empty());

        // The rejected completion still consumed the pending entry.
        let mut ledger = PairingLedger::new();
        ledger.record_entry("S1", t0());
        let raw = ledger.complete("S1", t0() + Duration::seconds(305));
        assert_eq!(raw, Some(305.0));
        assert_eq!(ledger.pending_len(), 0);
    }

    #[test]
    fn test_window_bound_rejects_non_positive() {
        let events = vec![ev("S1", "BREQ", 10), ev("S1", "BCMP", 10)];
        assert!(paired_durations(&events).is_empty());
    }

    #[test]
    fn test_entries_only_accumulate_pending() {
        let events = vec![ev("S1", "BREQ", 0), ev("S2", "BREQ", 1)];
        let mut ledger = PairingLedger::new();
        for e in &events {
            ledger.record_entry(&e.serial_number, e.timestamp);
        }
        assert_eq!(ledger.pending_len(), 2);
        assert_eq!(paired_durations(&events), Vec::<f64>::new());
    }

    #[test]
    fn test_bounded_ledger_evicts_oldest() {
        let mut ledger = BoundedPairingLedger::new(100);
        for i in 0..101 {
            ledger.record_entry(&format!("S{i}"), t0() + Duration::seconds(i));
        }

        assert_eq!(ledger.len(), 100);
        // S0 was evicted; its completion now pairs with nothing.
        assert_eq!(ledger.complete("S0", t0() + Duration::seconds(200)), None);
        // S1 survived.
        assert_eq!(
            ledger.complete("S1", t0() + Duration::seconds(11)),
            Some(10.0)
        );
        assert_eq!(ledger.len(), 99);
    }

    #[test]
    fn test_bounded_ledger_refresh_keeps_position() {
        let mut ledger = BoundedPairingLedger::new(2);
        ledger.record_entry("S1", t0());
        ledger.record_entry("S2", t0() + Duration::seconds(1));
        // Refreshing S1 must not demote S2 to oldest.
        ledger.record_entry("S1", t0() + Duration::seconds(2));
        ledger.record_entry("S3", t0() + Duration::seconds(3));

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.complete("S1", t0() + Duration::seconds(4)), None);
        assert!(ledger.complete("S2", t0() + Duration::seconds(4)).is_some());
        assert!(ledger.complete("S3", t0() + Duration::seconds(4)).is_some());
    }
}
