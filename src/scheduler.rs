//! Fixed-interval poll loop.
//!
//! Each tick claims the least-recently-fetched feed and ingests it before the
//! next tick is considered. Ticks that come due while an ingestion is still
//! running are dropped, never queued.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::feed::{FeedFetcher, FetchError, IngestSummary, Ingestor};
use crate::storage::{DatabaseError, FeedStore};

// ============================================================================
// Error Types
// ============================================================================

/// The interval passed to `agg` could not be used.
#[derive(Debug, Error)]
pub enum IntervalError {
    #[error("Invalid interval '{input}': {reason}")]
    Invalid { input: String, reason: String },

    #[error("Interval '{0}' must be greater than zero")]
    Zero(String),
}

/// A tick that did not complete. Never fatal to the loop.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("Failed to claim next feed: {0}")]
    Claim(#[source] DatabaseError),

    #[error("Failed to fetch feed {url}: {source}")]
    Fetch {
        feed_id: i64,
        url: String,
        #[source]
        source: FetchError,
    },
}

/// What one successful tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// There are no feeds.
    Idle,
    Ingested { feed_id: i64, summary: IngestSummary },
}

// ============================================================================
// Clock
// ============================================================================

/// Source of wall-clock time for claim timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parse a duration such as `30s`, `1m`, `500ms` or `2h`.
///
/// A bare number is read as seconds.
pub fn parse_interval(input: &str) -> Result<Duration, IntervalError> {
    let interval = duration_str::parse(input.trim()).map_err(|e| IntervalError::Invalid {
        input: input.to_string(),
        reason: e.to_string(),
    })?;

    if interval.is_zero() {
        return Err(IntervalError::Zero(input.to_string()));
    }
    Ok(interval)
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler<S, C> {
    ingestor: Ingestor<S>,
    clock: C,
    interval: Duration,
}

impl<S: FeedStore, C: Clock> Scheduler<S, C> {
    pub fn new(ingestor: Ingestor<S>, clock: C, interval: Duration) -> Self {
        Self {
            ingestor,
            clock,
            interval,
        }
    }

    /// Claim one feed and ingest it.
    ///
    /// The claim stamps the feed's `last_fetched_at_ms` before any network
    /// traffic, so a failed or slow fetch still moves the feed to the back of
    /// the rotation.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickReport, TickError> {
        let now_ms = self.clock.now().timestamp_millis();

        let feed = match self.ingestor.store().claim_next_feed(now_ms).await {
            Ok(feed) => feed,
            Err(DatabaseError::NotFound(_)) => {
                tracing::info!("No feeds to fetch");
                return Ok(TickReport::Idle);
            }
            Err(e) => return Err(TickError::Claim(e)),
        };

        tracing::debug!(feed_id = feed.id, url = %feed.url, "Claimed feed");

        let summary = self
            .ingestor
            .ingest(&feed, cancel)
            .await
            .map_err(|source| TickError::Fetch {
                feed_id: feed.id,
                url: feed.url.clone(),
                source,
            })?;

        Ok(TickReport::Ingested {
            feed_id: feed.id,
            summary,
        })
    }

    /// Tick immediately, then once per interval, until `cancel` fires.
    ///
    /// Tick errors are logged and the loop carries on.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval = ?self.interval, "Collecting feeds");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.tick(&cancel).await {
                Ok(_) => {}
                Err(TickError::Fetch {
                    source: FetchError::Cancelled,
                    ..
                }) => break,
                Err(TickError::Claim(e)) => {
                    tracing::warn!(error = %e, "Failed to claim next feed");
                }
                Err(TickError::Fetch {
                    feed_id,
                    url,
                    source,
                }) => {
                    tracing::warn!(
                        feed_id,
                        url = %url,
                        error = %source,
                        "Failed to fetch feed"
                    );
                }
            }
        }

        tracing::info!("Stopped collecting feeds");
    }
}

/// Parse `interval_str` and poll feeds from `store` until `cancel` fires.
///
/// # Errors
///
/// Returns [`IntervalError`] without polling anything if the interval is
/// malformed or zero.
pub async fn run_polling_loop<S: FeedStore>(
    store: S,
    fetcher: FeedFetcher,
    interval_str: &str,
    cancel: CancellationToken,
) -> Result<(), IntervalError> {
    let interval = parse_interval(interval_str)?;
    Scheduler::new(Ingestor::new(store, fetcher), SystemClock, interval)
        .run(cancel)
        .await;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
