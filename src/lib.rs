//! Cycle-time metrics engine for production line equipment.
//!
//! Scan events are pulled from plain-text equipment feeds, stored in
//! SQLite, and aggregated into cycle-time metrics at three horizons: a
//! real-time pulse per completion, a rolling hour and the current shift.

pub mod agent;
pub mod config;
pub mod feed;
pub mod metrics;
pub mod pulse;
pub mod scan;
pub mod shift;
pub mod store;
