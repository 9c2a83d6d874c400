//! Scan events and status-token classification.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A single scan observed at an equipment station.
///
/// Timestamps are naive plant-local wall clock: the upstream feed carries no
/// timezone and none is applied anywhere downstream. Within one equipment's
/// stream, events are ordered by timestamp ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEvent {
    pub equipment_id: String,
    pub serial_number: String,
    /// Raw status token as scanned, e.g. "BREQ", "BCMP", "PROCESSED_OK".
    pub status: String,
    pub timestamp: NaiveDateTime,
    /// Opaque source payload, carried through storage untouched.
    pub metadata: Option<serde_json::Value>,
}

impl ScanEvent {
    pub fn new(
        equipment_id: impl Into<String>,
        serial_number: impl Into<String>,
        status: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            serial_number: serial_number.into(),
            status: status.into(),
            timestamp,
            metadata: None,
        }
    }
}

/// Controls how equipment-level cycle time is derived for one equipment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentKind {
    /// Single scan point: equipment CT aliases the consecutive-completion
    /// process CT.
    #[default]
    SingleStage,
    /// Entry and completion scans: equipment CT pairs them per serial.
    PairedStage,
}

impl EquipmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EquipmentKind::SingleStage => "single_stage",
            EquipmentKind::PairedStage => "paired_stage",
        }
    }

    /// Parses a kind token leniently, accepting the legacy station-type
    /// names. Unknown tokens fall back to SingleStage so a misconfigured
    /// equipment degrades to consecutive-completion math instead of
    /// failing its cycle.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "paired_stage" | "paired" | "breq_bcmp" => EquipmentKind::PairedStage,
            _ => EquipmentKind::SingleStage,
        }
    }

    pub fn all() -> &'static [EquipmentKind] {
        &[EquipmentKind::SingleStage, EquipmentKind::PairedStage]
    }
}

impl fmt::Display for EquipmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Status classification. The four predicates are independent: a token may be
// both a completion and an NG (scrap completions count as completions but
// not as OK pieces). All matching is case-insensitive over the trimmed token.

/// Entry scan: the exact token "BREQ".
pub fn is_entry(status: &str) -> bool {
    status.trim().eq_ignore_ascii_case("BREQ")
}

/// Completion scan: token starts with "BCMP", or mentions "PROCESSED" or
/// "COMPLETE".
pub fn is_completion(status: &str) -> bool {
    let s = status.trim().to_ascii_uppercase();
    s.starts_with("BCMP") || s.contains("PROCESSED") || s.contains("COMPLETE")
}

/// Good piece: mentions "OK", or "PROCESSED" without a failure marker.
pub fn is_ok(status: &str) -> bool {
    let s = status.trim().to_ascii_uppercase();
    s.contains("OK") || (s.contains("PROCESSED") && !s.contains("FAIL") && !s.contains("NG"))
}

/// Scrap piece: mentions "NG" or "FAIL".
pub fn is_ng(status: &str) -> bool {
    let s = status.trim().to_ascii_uppercase();
    s.contains("NG") || s.contains("FAIL")
}
