use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};

use crate::scan::EquipmentKind;
use crate::shift::{ShiftCalendar, ShiftSpec};

/// Top-level configuration for the taktoor agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Scan and metrics storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Equipment feed client configuration.
    #[serde(default)]
    pub feed: FeedConfig,

    /// Cycle cadences.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Shift table, first shift also serving as the fallback when a
    /// wall-clock minute matches no entry. Default: the plant's three-shift
    /// day.
    #[serde(default = "default_shifts")]
    pub shifts: Vec<ShiftConfig>,

    /// Equipment registry. Equipment discovered in storage but missing here
    /// is still aggregated, as single-stage.
    #[serde(default)]
    pub equipment: Vec<EquipmentConfig>,
}

/// Scan and metrics storage configuration.
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path. Default: "taktoor.db".
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Days to keep raw scans, by insertion time. 0 disables pruning.
    /// Default: 30.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

/// Equipment feed client configuration.
#[derive(Debug, Deserialize)]
pub struct FeedConfig {
    /// Timeout for a full-page extraction fetch. Default: 10s.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Timeout for a pulse tail fetch. Default: 4s.
    #[serde(default = "default_tail_timeout", with = "humantime_serde")]
    pub tail_timeout: Duration,

    /// Attempts per extraction fetch before giving up on an equipment for
    /// the cycle. Default: 3.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Rows read from the end of the feed on each pulse poll. Default: 50.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

/// Cycle cadences.
#[derive(Debug, Deserialize)]
pub struct SchedulerConfig {
    /// How often to pull feeds into storage. Default: 30s.
    #[serde(default = "default_extract_interval", with = "humantime_serde")]
    pub extract_interval: Duration,

    /// How often to recompute hour and shift windows. Default: 1m.
    #[serde(default = "default_recompute_interval", with = "humantime_serde")]
    pub recompute_interval: Duration,

    /// How often to poll feed tails for the real-time pulse. Default: 5s.
    #[serde(default = "default_pulse_interval", with = "humantime_serde")]
    pub pulse_interval: Duration,

    /// How often to log run counters. Default: 5m.
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
}

/// One shift table row.
#[derive(Debug, Clone, Deserialize)]
pub struct ShiftConfig {
    /// Display name, e.g. "1st Shift".
    pub name: String,

    /// Start of shift, "HH:MM".
    pub start: String,

    /// End of shift, "HH:MM", exclusive.
    pub end: String,

    /// Set when the shift runs past midnight into the next day.
    #[serde(default)]
    pub crosses_midnight: bool,
}

/// One equipment registry row.
#[derive(Debug, Clone, Deserialize)]
pub struct EquipmentConfig {
    /// Stable identifier, used as the storage key.
    pub id: String,

    /// Display name. Default: the id.
    #[serde(default)]
    pub name: String,

    /// How equipment cycle time is derived. Unknown tokens fall back to
    /// single_stage. Default: single_stage.
    #[serde(default, deserialize_with = "lenient_kind")]
    pub kind: EquipmentKind,

    /// Scan feed page URL. Empty means this equipment is never fetched or
    /// pulse-polled; its metrics come from whatever storage already holds.
    #[serde(default)]
    pub feed_url: String,

    /// Inactive equipment is excluded from every cycle. Default: true.
    #[serde(default = "default_true")]
    pub active: bool,

    /// Engineering design cycle time in seconds, informational only.
    #[serde(default)]
    #[allow(dead_code)]
    pub design_ct: Option<f64>,
}

fn lenient_kind<'de, D>(de: D) -> std::result::Result<EquipmentKind, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    Ok(EquipmentKind::parse(&raw))
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> String {
    "taktoor.db".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_tail_timeout() -> Duration {
    Duration::from_secs(4)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_tail_lines() -> usize {
    50
}

fn default_extract_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_recompute_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_pulse_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_true() -> bool {
    true
}

fn default_shifts() -> Vec<ShiftConfig> {
    vec![
        ShiftConfig {
            name: "1st Shift".to_string(),
            start: "07:00".to_string(),
            end: "16:30".to_string(),
            crosses_midnight: false,
        },
        ShiftConfig {
            name: "7th Shift".to_string(),
            start: "16:30".to_string(),
            end: "22:16".to_string(),
            crosses_midnight: false,
        },
        ShiftConfig {
            name: "9th Shift".to_string(),
            start: "22:16".to_string(),
            end: "06:40".to_string(),
            crosses_midnight: true,
        },
    ]
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            feed: FeedConfig::default(),
            scheduler: SchedulerConfig::default(),
            shifts: default_shifts(),
            equipment: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: default_fetch_timeout(),
            tail_timeout: default_tail_timeout(),
            retry_attempts: default_retry_attempts(),
            tail_lines: default_tail_lines(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            extract_interval: default_extract_interval(),
            recompute_interval: default_recompute_interval(),
            pulse_interval: default_pulse_interval(),
            status_interval: default_status_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.storage.path.is_empty() {
            bail!("storage.path is required");
        }

        if self.feed.fetch_timeout.is_zero() {
            bail!("feed.fetch_timeout must be positive");
        }
        if self.feed.tail_timeout.is_zero() {
            bail!("feed.tail_timeout must be positive");
        }
        if self.feed.retry_attempts == 0 {
            bail!("feed.retry_attempts must be positive");
        }
        if self.feed.tail_lines == 0 {
            bail!("feed.tail_lines must be positive");
        }

        if self.scheduler.extract_interval.is_zero() {
            bail!("scheduler.extract_interval must be positive");
        }
        if self.scheduler.recompute_interval.is_zero() {
            bail!("scheduler.recompute_interval must be positive");
        }
        if self.scheduler.pulse_interval.is_zero() {
            bail!("scheduler.pulse_interval must be positive");
        }
        if self.scheduler.status_interval.is_zero() {
            bail!("scheduler.status_interval must be positive");
        }

        // Proves the table is well-formed; resolution itself never fails.
        self.shift_calendar()?;

        let mut seen = HashSet::new();
        for equipment in &self.equipment {
            if equipment.id.is_empty() {
                bail!("equipment entries require a non-empty id");
            }
            if !seen.insert(equipment.id.as_str()) {
                bail!("duplicate equipment id: {}", equipment.id);
            }
        }

        Ok(())
    }

    /// Builds the shift calendar from the configured table.
    pub fn shift_calendar(&self) -> Result<ShiftCalendar> {
        let mut specs = Vec::with_capacity(self.shifts.len());
        for shift in &self.shifts {
            specs.push(
                ShiftSpec::parse(&shift.name, &shift.start, &shift.end, shift.crosses_midnight)
                    .with_context(|| format!("shift {:?}", shift.name))?,
            );
        }
        ShiftCalendar::new(specs)
    }

    /// Equipment that takes part in extraction and pulse polling.
    pub fn polled_equipment(&self) -> Vec<&EquipmentConfig> {
        self.equipment
            .iter()
            .filter(|e| e.active && !e.feed_url.is_empty())
            .collect()
    }

    /// Registry lookup for the aggregation path. Equipment that only exists
    /// in storage is treated as single-stage.
    pub fn kind_of(&self, equipment_id: &str) -> EquipmentKind {
        self.equipment
            .iter()
            .find(|e| e.id == equipment_id)
            .map(|e| e.kind)
            .unwrap_or_default()
    }
}
