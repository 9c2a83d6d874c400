//! Agent orchestration: wires the feed client, the store and the metric
//! pipelines together and drives them on their schedules.
//!
//! Four periodic loops run once started: feed extraction, window
//! recompute, real-time pulse polling and a run status report, plus a
//! daily retention sweep. Every loop is a single task guarded by the
//! shared cancellation token, so a tick never overlaps the previous one
//! and shutdown is a matter of cancelling and joining.

pub mod stats;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::feed::FeedClient;
use crate::metrics::aggregate_window;
use crate::pulse::{Pulse, PulseEstimator};
use crate::scan::EquipmentKind;
use crate::shift::{ShiftCalendar, ShiftWindow};
use crate::store::Store;

use self::stats::RunStats;

/// Capacity of the pulse broadcast channel. Slow subscribers lag and
/// lose old pulses rather than stalling the pulse loop.
const PULSE_CHANNEL_CAPACITY: usize = 256;

/// Interval of the retention sweep.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Main agent that owns all components and background tasks.
pub struct Agent {
    cfg: Arc<Config>,
    store: Store,
    feed: Arc<FeedClient>,
    calendar: ShiftCalendar,
    stats: Arc<RunStats>,
    pulse_tx: broadcast::Sender<Pulse>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started_at: Instant,
}

impl Agent {
    /// Creates the agent and opens the store. A store that cannot be
    /// opened is the one startup error that is fatal to the process.
    pub fn new(cfg: Config) -> Result<Self> {
        let calendar = cfg.shift_calendar()?;
        let feed = Arc::new(FeedClient::new(&cfg.feed).context("building feed client")?);
        let store = Store::open(&cfg.storage.path).context("opening metrics store")?;
        let (pulse_tx, _) = broadcast::channel(PULSE_CHANNEL_CAPACITY);

        Ok(Self {
            cfg: Arc::new(cfg),
            store,
            feed,
            calendar,
            stats: Arc::new(RunStats::new()),
            pulse_tx,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            started_at: Instant::now(),
        })
    }

    /// Starts all background loops. Each loop ticks immediately on
    /// spawn, so the first extraction and recompute happen at startup
    /// rather than one interval later.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Prove the store answers queries before spawning anything.
        let known = self
            .store
            .equipments_with_data()
            .await
            .context("storage probe failed")?;
        info!(
            known_equipment = known.len(),
            polled_equipment = self.cfg.polled_equipment().len(),
            shifts = self.cfg.shifts.len(),
            "storage ready"
        );

        // 1. Feed extraction loop.
        self.spawn_extract_loop();

        // 2. Window recompute loop.
        self.spawn_recompute_loop();

        // 3. Real-time pulse loop.
        self.spawn_pulse_loop();

        // 4. Run status report.
        self.spawn_status_loop();

        // 5. Daily retention sweep.
        self.spawn_retention_loop();

        info!("agent fully started");
        Ok(())
    }

    /// Stops all loops and waits for them to finish. The store worker
    /// shuts down when the last handle is dropped.
    pub async fn stop(&mut self) {
        info!("stopping agent");
        self.cancel.cancel();

        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "agent task failed to join");
            }
        }

        info!("agent stopped");
    }

    /// New subscription to the stream of real-time pulses. Every pulse
    /// persisted by the pulse loop is also published here.
    pub fn subscribe_pulses(&self) -> broadcast::Receiver<Pulse> {
        self.pulse_tx.subscribe()
    }

    fn spawn_extract_loop(&mut self) {
        let cancel = self.cancel.clone();
        let cfg = Arc::clone(&self.cfg);
        let feed = Arc::clone(&self.feed);
        let store = self.store.clone();
        let stats = Arc::clone(&self.stats);

        let handle = tokio::spawn(async move {
            let period = cfg.scheduler.extract_interval;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        extract_cycle(&cfg, &feed, &store, &stats).await;
                        log_overrun("extraction", started.elapsed(), period);
                    }
                }
            }
        });
        self.tasks.push(handle);
    }

    fn spawn_recompute_loop(&mut self) {
        let cancel = self.cancel.clone();
        let cfg = Arc::clone(&self.cfg);
        let calendar = self.calendar.clone();
        let store = self.store.clone();
        let stats = Arc::clone(&self.stats);

        let handle = tokio::spawn(async move {
            let period = cfg.scheduler.recompute_interval;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        recompute_cycle(&cfg, &calendar, &store, &stats).await;
                        log_overrun("recompute", started.elapsed(), period);
                    }
                }
            }
        });
        self.tasks.push(handle);
    }

    fn spawn_pulse_loop(&mut self) {
        let cancel = self.cancel.clone();
        let cfg = Arc::clone(&self.cfg);
        let feed = Arc::clone(&self.feed);
        let store = self.store.clone();
        let stats = Arc::clone(&self.stats);
        let pulse_tx = self.pulse_tx.clone();

        let handle = tokio::spawn(async move {
            // Estimator state lives in this task alone, one estimator
            // per equipment, created lazily on the first poll.
            let mut estimators: HashMap<String, PulseEstimator> = HashMap::new();
            let period = cfg.scheduler.pulse_interval;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let started = Instant::now();
                        pulse_cycle(&cfg, &feed, &store, &stats, &pulse_tx, &mut estimators).await;
                        log_overrun("pulse poll", started.elapsed(), period);
                    }
                }
            }
        });
        self.tasks.push(handle);
    }

    fn spawn_status_loop(&mut self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let started_at = self.started_at;
        let interval = self.cfg.scheduler.status_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        if snapshot.extract_runs == 0 && snapshot.pulse_polls == 0 {
                            continue;
                        }
                        info!(
                            uptime_secs = started_at.elapsed().as_secs(),
                            extract_runs = snapshot.extract_runs,
                            recompute_runs = snapshot.recompute_runs,
                            pulse_polls = snapshot.pulse_polls,
                            scans_inserted = snapshot.scans_inserted,
                            pulses_emitted = snapshot.pulses_emitted,
                            "run status"
                        );
                    }
                }
            }
        });
        self.tasks.push(handle);
    }

    fn spawn_retention_loop(&mut self) {
        let days = self.cfg.storage.retention_days;
        if days == 0 {
            info!("scan retention disabled");
            return;
        }
        let cancel = self.cancel.clone();
        let store = self.store.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match store.delete_older_than(days).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, days, "pruned expired scans"),
                            Err(e) => warn!(error = %e, "retention sweep failed"),
                        }
                    }
                }
            }
        });
        self.tasks.push(handle);
    }
}

/// Logs when a cycle ran longer than its period. The ticker has already
/// skipped the missed ticks at that point.
fn log_overrun(cycle: &str, elapsed: Duration, period: Duration) {
    if elapsed > period {
        warn!(
            cycle,
            elapsed_ms = elapsed.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "cycle overran its period, missed ticks skipped"
        );
    }
}

/// One extraction pass: fetch every polled feed concurrently and store
/// whatever parsed. A failing equipment is skipped for this cycle and
/// never affects the others.
async fn extract_cycle(cfg: &Config, feed: &Arc<FeedClient>, store: &Store, stats: &RunStats) {
    let started = Instant::now();
    let mut inserted = 0u64;
    let mut duplicates = 0u64;

    let mut fetches = JoinSet::new();
    for eq in cfg.polled_equipment() {
        let feed = Arc::clone(feed);
        let id = eq.id.clone();
        let url = eq.feed_url.clone();
        fetches.spawn(async move {
            let result = feed.fetch_scans(&id, &url).await;
            (id, result)
        });
    }

    while let Some(joined) = fetches.join_next().await {
        let (id, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "feed fetch task panicked");
                continue;
            }
        };
        let events = match result {
            Ok(events) => events,
            Err(e) => {
                debug!(equipment = %id, error = %e, "feed fetch failed");
                continue;
            }
        };
        if events.is_empty() {
            continue;
        }
        match store.insert_batch(events).await {
            Ok(outcome) => {
                inserted += outcome.inserted as u64;
                duplicates += outcome.duplicates as u64;
            }
            Err(e) => warn!(equipment = %id, error = %e, "scan insert failed"),
        }
    }

    stats.record_extract_run();
    stats.record_scans_inserted(inserted);

    if inserted > 0 {
        info!(
            inserted,
            duplicates,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "extraction stored new scans"
        );
    }
}

/// One recompute pass: resolve the shift once, then refresh the hour
/// and shift metrics of every target equipment.
async fn recompute_cycle(cfg: &Config, calendar: &ShiftCalendar, store: &Store, stats: &RunStats) {
    let started = Instant::now();
    let now = Local::now().naive_local();
    let hour_start = now - ChronoDuration::hours(1);
    let shift = calendar.resolve(now);

    let discovered = match store.equipments_with_data().await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "equipment discovery failed");
            Vec::new()
        }
    };

    let targets = recompute_targets(cfg, discovered);
    let mut updated = 0usize;

    for (id, kind) in &targets {
        if let Err(e) = recompute_equipment(store, id, *kind, hour_start, &shift, now).await {
            debug!(equipment = %id, error = %e, "window recompute failed");
            continue;
        }
        updated += 1;
    }

    stats.record_recompute_run();
    info!(
        equipment = updated,
        shift = %shift.name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "recompute finished"
    );
}

async fn recompute_equipment(
    store: &Store,
    equipment_id: &str,
    kind: EquipmentKind,
    hour_start: NaiveDateTime,
    shift: &ShiftWindow,
    now: NaiveDateTime,
) -> Result<()> {
    let hour_scans = store.scans_since(equipment_id, hour_start).await?;
    let shift_scans = store.scans_since(equipment_id, shift.start).await?;

    let hour_metrics = aggregate_window(&hour_scans, kind);
    let shift_metrics = aggregate_window(&shift_scans, kind);

    store
        .update_window_metrics(equipment_id, hour_metrics, shift_metrics, shift.clone(), now)
        .await
}

/// The recompute set is the union of the active registry and whatever
/// equipment already has stored scans. Registered equipment keeps its
/// configured kind and its active flag; unregistered equipment found in
/// storage is treated as single stage.
fn recompute_targets(cfg: &Config, discovered: Vec<String>) -> Vec<(String, EquipmentKind)> {
    let mut targets = Vec::new();
    let mut seen = HashSet::new();

    for eq in &cfg.equipment {
        if eq.active && seen.insert(eq.id.clone()) {
            targets.push((eq.id.clone(), eq.kind));
        }
    }
    for id in discovered {
        if cfg.equipment.iter().any(|eq| eq.id == id) {
            continue;
        }
        if seen.insert(id.clone()) {
            targets.push((id, EquipmentKind::SingleStage));
        }
    }

    targets
}

/// One pulse pass: fetch every feed tail concurrently, advance the
/// per-equipment estimator, and persist plus publish whatever pulses
/// come out.
async fn pulse_cycle(
    cfg: &Config,
    feed: &Arc<FeedClient>,
    store: &Store,
    stats: &RunStats,
    pulse_tx: &broadcast::Sender<Pulse>,
    estimators: &mut HashMap<String, PulseEstimator>,
) {
    let mut fetches = JoinSet::new();
    for eq in cfg.polled_equipment() {
        let feed = Arc::clone(feed);
        let id = eq.id.clone();
        let url = eq.feed_url.clone();
        fetches.spawn(async move {
            let result = feed.fetch_tail(&id, &url).await;
            (id, result)
        });
    }

    while let Some(joined) = fetches.join_next().await {
        let (id, result) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "tail fetch task panicked");
                continue;
            }
        };
        let tail = match result {
            Ok(tail) => tail,
            Err(e) => {
                debug!(equipment = %id, error = %e, "tail fetch failed");
                continue;
            }
        };

        let estimator = estimators
            .entry(id.clone())
            .or_insert_with(|| PulseEstimator::new(id.clone(), cfg.kind_of(&id)));

        if let Some(pulse) = estimator.ingest(&tail) {
            if let Err(e) = store.update_pulse(pulse.clone()).await {
                warn!(equipment = %id, error = %e, "pulse persist failed");
                continue;
            }
            // A send error only means nobody is subscribed right now.
            let _ = pulse_tx.send(pulse);
            stats.record_pulse_emitted();
        }
    }

    stats.record_pulse_poll();
}
