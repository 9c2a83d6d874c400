//! Equipment feed client.
//!
//! Each equipment exposes its scan log as an HTML page with the CSV body
//! wrapped in an `<xmp>` block (older firmware uses `<pre>`). Rows carry
//! seven fixed columns; only serial (0), status (5) and timestamp (6) drive
//! the metrics, the rest ride along as opaque metadata.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::scan::ScanEvent;

/// Wire format of column 6, naive plant-local time.
const FEED_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// HTTP client over the equipment feed pages.
pub struct FeedClient {
    http: reqwest::Client,
    fetch_timeout: Duration,
    tail_timeout: Duration,
    retry_attempts: u32,
    tail_lines: usize,
}

impl FeedClient {
    pub fn new(cfg: &FeedConfig) -> Result<Self> {
        let fetch_timeout = if cfg.fetch_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.fetch_timeout
        };
        let tail_timeout = if cfg.tail_timeout.is_zero() {
            Duration::from_secs(4)
        } else {
            cfg.tail_timeout
        };

        let http = reqwest::Client::builder()
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            fetch_timeout,
            tail_timeout,
            retry_attempts: cfg.retry_attempts.max(1),
            tail_lines: cfg.tail_lines,
        })
    }

    /// Fetches and parses the full scan page for one equipment, retrying
    /// transient failures with a linearly growing pause between attempts.
    pub async fn fetch_scans(&self, equipment_id: &str, url: &str) -> Result<Vec<ScanEvent>> {
        let mut last_err = None;

        for attempt in 1..=self.retry_attempts {
            debug!(equipment = equipment_id, attempt, "fetching scan feed");
            match self.get_text(url, self.fetch_timeout).await {
                Ok(body) => return Ok(parse_feed(equipment_id, &body, None)),
                Err(err) => {
                    warn!(
                        equipment = equipment_id,
                        attempt,
                        error = %err,
                        "feed fetch attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < self.retry_attempts {
                        tokio::time::sleep(Duration::from_millis(1000 * u64::from(attempt))).await;
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| anyhow!("no fetch attempts configured"));
        Err(err.context(format!(
            "feed fetch for {equipment_id} failed after {} attempts",
            self.retry_attempts
        )))
    }

    /// Fetches the most recent rows for the pulse poll. Single attempt with
    /// a short timeout; a missed poll just waits for the next tick.
    pub async fn fetch_tail(&self, equipment_id: &str, url: &str) -> Result<Vec<ScanEvent>> {
        let body = self
            .get_text(url, self.tail_timeout)
            .await
            .with_context(|| format!("polling feed tail for {equipment_id}"))?;

        Ok(parse_feed(equipment_id, &body, Some(self.tail_lines)))
    }

    async fn get_text(&self, url: &str, timeout: Duration) -> Result<String> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .header("Accept", "text/csv,text/plain,*/*")
            .send()
            .await
            .context("requesting feed page")?;

        let status = response.status();
        if !status.is_success() {
            bail!("unexpected status {status} from feed page");
        }

        response.text().await.context("reading feed body")
    }
}

/// Extracts the CSV body from a feed page: `<xmp>` block first, `<pre>` as
/// the legacy fallback. Tag matching is ASCII case-insensitive.
pub fn extract_csv(html: &str) -> Option<&str> {
    tag_block(html, "xmp").or_else(|| tag_block(html, "pre"))
}

fn tag_block<'a>(html: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let start = find_ascii_ci(html, &open)? + open.len();
    let len = find_ascii_ci(&html[start..], &close)?;

    Some(html[start..start + len].trim())
}

fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Parses a full feed page into scan events. With `tail` set only the
/// last `n` data rows are considered, which is what the pulse path uses.
pub fn parse_feed(equipment_id: &str, body: &str, tail: Option<usize>) -> Vec<ScanEvent> {
    let Some(csv) = extract_csv(body) else {
        warn!(equipment = equipment_id, "no <xmp> or <pre> block in feed page");
        return Vec::new();
    };

    let lines: Vec<&str> = csv
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));

    let mut events = Vec::new();
    for line in &lines[skip..] {
        if let Some(event) = parse_row(equipment_id, line) {
            events.push(event);
        }
    }

    debug!(
        equipment = equipment_id,
        rows = lines.len() - skip,
        parsed = events.len(),
        "parsed feed rows"
    );

    events
}

/// Parses one fixed-layout CSV row. Rows missing columns, required fields
/// or a well-formed timestamp are dropped, matching what the stations
/// actually emit when a scan is aborted mid-write.
fn parse_row(equipment_id: &str, line: &str) -> Option<ScanEvent> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 7 {
        return None;
    }

    let serial = fields[0];
    let status = fields[5];
    let stamp = fields[6];
    if serial.is_empty() || status.is_empty() || stamp.is_empty() {
        return None;
    }

    let timestamp = NaiveDateTime::parse_from_str(stamp, FEED_TIMESTAMP_FORMAT).ok()?;

    let mut event = ScanEvent::new(equipment_id, serial, status, timestamp);
    event.metadata = Some(serde_json::json!({
        "line": fields[1],
        "model_id": fields[2],
        "equipment_type": fields[3],
        "station_id": fields[4],
    }));

    Some(event)
}
