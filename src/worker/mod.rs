//! Multi-tab query execution
//!
//! One session drives a fixed number of tabs; the phrase list is split
//! into contiguous shards, one per surviving tab, and each tab submits its
//! shard through the page UI while a network tap captures the API
//! responses. Tabs share the result map, the pacing controller and the
//! stop flag, but never exchange work.

mod results;
mod shard;
mod tap;

pub use results::{QueryResult, ResultSet};
pub use shard::partition;
pub use tap::NetworkTap;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chromiumoxide::page::Page;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::decode::{Decoded, Decoder};
use crate::error::ScrapeError;
use crate::rate::RateController;
use crate::scrape::{EventSink, ScrapeEvent};
use crate::session::SessionHandle;
use crate::site::SiteAdapter;
use crate::stats::RunStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Tabs opened per session
    pub tab_count: usize,
    /// Attempts to bring up one tab before giving up on it
    pub tab_retries: u32,
    /// Base backoff between tab attempts; multiplied by the attempt number
    pub tab_retry_base_ms: u64,
    /// Navigation deadline for the target page
    pub nav_timeout_ms: u64,
    /// How long one submitted query may wait for its response
    pub query_timeout_ms: u64,
    /// Submissions per phrase before it is recorded unresolved
    pub query_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tab_count: 10,
            tab_retries: 3,
            tab_retry_base_ms: 500,
            nav_timeout_ms: 30_000,
            query_timeout_ms: 15_000,
            query_attempts: 2,
        }
    }
}

struct TabHandle {
    page: Page,
    tap: NetworkTap,
    rx: mpsc::UnboundedReceiver<Decoded>,
}

/// Runs one session's phrase workload across its tabs.
pub struct WorkerPool {
    config: WorkerConfig,
    adapter: Arc<SiteAdapter>,
    decoder: Arc<Decoder>,
    rate: Arc<RateController>,
    stats: Arc<RunStats>,
    stop: Arc<AtomicBool>,
    events: EventSink,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        adapter: Arc<SiteAdapter>,
        decoder: Arc<Decoder>,
        rate: Arc<RateController>,
        stats: Arc<RunStats>,
        stop: Arc<AtomicBool>,
        events: EventSink,
    ) -> Self {
        Self {
            config,
            adapter,
            decoder,
            rate,
            stats,
            stop,
            events,
        }
    }

    /// Execute `phrases` over the session. Returns the merged result map;
    /// fails only when not a single tab could be provisioned.
    pub async fn run(
        &self,
        session: &SessionHandle,
        phrases: &[String],
    ) -> Result<HashMap<String, QueryResult>, ScrapeError> {
        let tabs = self.provision_tabs(session).await?;
        info!(
            "Running {} phrases over {} tabs",
            phrases.len(),
            tabs.len()
        );

        let results = Arc::new(ResultSet::new());
        let shards = partition(phrases, tabs.len());

        let mut tasks = Vec::with_capacity(tabs.len());
        for (index, (tab, shard)) in tabs.into_iter().zip(shards).enumerate() {
            let worker = TabWorker {
                index,
                page: tab.page,
                _tap: tab.tap,
                rx: tab.rx,
                shard,
                adapter: self.adapter.clone(),
                rate: self.rate.clone(),
                stats: self.stats.clone(),
                results: results.clone(),
                stop: self.stop.clone(),
                events: self.events.clone(),
                config: self.config.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }
        for task in tasks {
            let _ = task.await;
        }

        Ok(results.snapshot())
    }

    /// Bring up the configured number of tabs, each already navigated to
    /// the target page with its network tap attached. Individual tabs may
    /// fail; only a total wipeout is fatal.
    async fn provision_tabs(&self, session: &SessionHandle) -> Result<Vec<TabHandle>, ScrapeError> {
        let wanted = self.config.tab_count.max(1);
        let mut tabs = Vec::with_capacity(wanted);

        for slot in 0..wanted {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match self.open_tab(session).await {
                Ok(tab) => tabs.push(tab),
                Err(e) => warn!("Tab slot {} never came up: {}", slot, e),
            }
        }

        require_tabs(tabs, wanted)
    }

    async fn open_tab(&self, session: &SessionHandle) -> Result<TabHandle, ScrapeError> {
        retry_with_backoff(
            self.config.tab_retries,
            Duration::from_millis(self.config.tab_retry_base_ms),
            || self.try_open_tab(session),
        )
        .await
    }

    async fn try_open_tab(&self, session: &SessionHandle) -> Result<TabHandle, ScrapeError> {
        let page = session.new_tab().await?;

        // The tap must be listening before navigation so no early request
        // slips past it.
        let (tx, rx) = mpsc::unbounded_channel();
        let tap = match NetworkTap::attach(&page, self.decoder.clone(), tx).await {
            Ok(tap) => tap,
            Err(e) => {
                let _ = page.clone().close().await;
                return Err(e);
            }
        };

        let nav = tokio::time::timeout(
            Duration::from_millis(self.config.nav_timeout_ms),
            page.goto(self.adapter.base_url.as_str()),
        )
        .await;
        match nav {
            Ok(Ok(_)) => Ok(TabHandle { page, tap, rx }),
            Ok(Err(e)) => {
                let _ = page.clone().close().await;
                Err(ScrapeError::ConnectionLost(format!("navigation failed: {}", e)))
            }
            Err(_) => {
                let _ = page.clone().close().await;
                Err(ScrapeError::ConnectionLost("navigation timed out".to_string()))
            }
        }
    }
}

/// Empty tab lists are fatal; a partial set only degrades throughput.
fn require_tabs<T>(tabs: Vec<T>, wanted: usize) -> Result<Vec<T>, ScrapeError> {
    if tabs.is_empty() {
        return Err(ScrapeError::NoWorkingTabs(format!(
            "0 of {} tabs provisioned",
            wanted
        )));
    }
    if tabs.len() < wanted {
        warn!("Continuing with {} of {} tabs", tabs.len(), wanted);
    }
    Ok(tabs)
}

/// Run `op` up to `attempts` times with a linearly growing pause between
/// failures, returning the last error once the budget is spent.
async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    base: Duration,
    mut op: F,
) -> Result<T, ScrapeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ScrapeError>>,
{
    let attempts = attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!("Attempt {} failed: {}", attempt, e);
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(base * attempt).await;
                }
            }
        }
    }
    Err(last
        .unwrap_or_else(|| ScrapeError::NoWorkingTabs("retry budget exhausted".to_string())))
}

/// Case-insensitive phrase comparison used for response matching; the
/// service lowercases queries on the way through.
fn phrases_match(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Record a decoded response unless its phrase is already settled; the
/// first write wins and is the only one counted or announced.
fn record_decoded(
    results: &ResultSet,
    stats: &RunStats,
    events: &EventSink,
    tab: usize,
    decoded: &Decoded,
) {
    if results.insert_once(QueryResult::resolved(
        &decoded.phrase,
        decoded.frequency,
        tab,
    )) {
        stats.record_resolved();
        (events)(ScrapeEvent::PhraseResolved {
            phrase: decoded.phrase.clone(),
            frequency: decoded.frequency,
        });
    }
}

/// Give up on a phrase: record it unresolved and announce the outcome, once.
fn record_unresolved(
    results: &ResultSet,
    stats: &RunStats,
    events: &EventSink,
    tab: usize,
    phrase: &str,
) {
    if results.insert_once(QueryResult::unresolved(phrase, tab)) {
        stats.record_unresolved();
        (events)(ScrapeEvent::PhraseUnresolved {
            phrase: phrase.to_string(),
        });
    }
}

/// Drain `rx` until a response matching `phrase` arrives or `window`
/// elapses. Every decoded response seen on the way, matching or not, is
/// handed to `on_decoded`.
async fn await_correlated(
    rx: &mut mpsc::UnboundedReceiver<Decoded>,
    phrase: &str,
    window: Duration,
    mut on_decoded: impl FnMut(&Decoded),
) -> bool {
    let deadline = Instant::now() + window;

    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return false;
        };
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(decoded)) => {
                let matched = phrases_match(&decoded.phrase, phrase);
                on_decoded(&decoded);
                if matched {
                    return true;
                }
            }
            Ok(None) => return false, // tap closed with the page
            Err(_) => return false,
        }
    }
}

struct TabWorker {
    index: usize,
    page: Page,
    // Held so the capture task lives exactly as long as the tab does
    _tap: NetworkTap,
    rx: mpsc::UnboundedReceiver<Decoded>,
    shard: Vec<String>,
    adapter: Arc<SiteAdapter>,
    rate: Arc<RateController>,
    stats: Arc<RunStats>,
    results: Arc<ResultSet>,
    stop: Arc<AtomicBool>,
    events: EventSink,
    config: WorkerConfig,
}

impl TabWorker {
    async fn run(mut self) {
        let mut broke_at = None;
        let shard = self.shard.clone();

        for (position, phrase) in shard.iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                debug!("Tab {} stopping on request", self.index);
                break;
            }
            // Another tab (or a related-phrase response) may have covered it
            if self.results.contains(phrase) {
                continue;
            }

            match self.query(phrase).await {
                Ok(true) => self.rate.on_success(),
                Ok(false) => {
                    record_unresolved(&self.results, &self.stats, &self.events, self.index, phrase);
                    self.rate.on_error();
                }
                Err(e) => {
                    warn!("Tab {} lost: {}", self.index, e);
                    self.stats.record_error();
                    self.rate.on_error();
                    broke_at = Some(position);
                    break;
                }
            }

            self.pace().await;
        }

        // A dead tab's leftover phrases will never run; record them so the
        // caller sees them as unresolved rather than silently missing.
        if let Some(position) = broke_at {
            for phrase in &self.shard[position..] {
                record_unresolved(&self.results, &self.stats, &self.events, self.index, phrase);
            }
        }

        let _ = self.page.clone().close().await;
    }

    /// Submit one phrase, up to `query_attempts` times. Ok(true) means the
    /// response arrived and was recorded; Ok(false) means every attempt
    /// timed out; Err means the tab itself is unusable.
    async fn query(&mut self, phrase: &str) -> Result<bool, ScrapeError> {
        for attempt in 1..=self.config.query_attempts.max(1) {
            self.submit(phrase).await?;
            if self.await_response(phrase).await {
                return Ok(true);
            }
            debug!(
                "Tab {}: no response for '{}' (attempt {})",
                self.index, phrase, attempt
            );
        }
        Ok(false)
    }

    async fn submit(&mut self, phrase: &str) -> Result<(), ScrapeError> {
        // Deliver anything that arrived while we were pacing
        while let Ok(decoded) = self.rx.try_recv() {
            self.record(&decoded);
        }

        let lost = |e: chromiumoxide::error::CdpError| ScrapeError::ConnectionLost(e.to_string());

        let input = self
            .page
            .find_element(self.adapter.input_selector.as_str())
            .await
            .map_err(lost)?;
        input.click().await.map_err(lost)?;

        // Clear the previous phrase; type_str only appends
        self.page
            .evaluate(format!(
                "document.querySelector({:?}).value = ''",
                self.adapter.input_selector
            ))
            .await
            .map_err(lost)?;

        input.type_str(phrase).await.map_err(lost)?;

        if self.adapter.submit_selector.is_empty() {
            input.press_key("Enter").await.map_err(lost)?;
        } else {
            match self
                .page
                .find_element(self.adapter.submit_selector.as_str())
                .await
            {
                Ok(button) => {
                    button.click().await.map_err(lost)?;
                }
                Err(_) => {
                    input.press_key("Enter").await.map_err(lost)?;
                }
            }
        }
        Ok(())
    }

    /// Wait for the response matching `phrase`, recording every decoded
    /// response that shows up in the meantime. Returns whether the phrase
    /// itself was answered before the deadline.
    async fn await_response(&mut self, phrase: &str) -> bool {
        let window = Duration::from_millis(self.config.query_timeout_ms);
        let results = &self.results;
        let stats = &self.stats;
        let events = &self.events;
        let index = self.index;
        await_correlated(&mut self.rx, phrase, window, |decoded| {
            record_decoded(results, stats, events, index, decoded)
        })
        .await
    }

    fn record(&self, decoded: &Decoded) {
        record_decoded(&self.results, &self.stats, &self.events, self.index, decoded);
    }

    /// Sleep out the controller's current delay in short slices so a stop
    /// request never waits behind a long pause.
    async fn pace(&self) {
        let mut remaining = self.rate.current_delay();
        while !remaining.is_zero() {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let slice = remaining.min(Duration::from_millis(250));
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }
}
