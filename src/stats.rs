//! # Statistics Module
//!
//! Collects metrics about a crawl while the engine runs it.
//!
//! ## Overview
//!
//! The `StatCollector` is updated by the engine at every step of a unit: when a
//! request is enqueued and dispatched, when a middleware drops something, when
//! a response arrives, when a fault becomes a `CrawlException`, and when items
//! move through the pipelines. It is shared through an `Arc` and can be read at
//! any time during or after the crawl.
//!
//! ## Key Metrics Tracked
//!
//! - **Request Metrics**: enqueued, dispatched, dropped and failed requests
//! - **Response Metrics**: received and dropped responses, status code distribution, bytes
//! - **Exception Metrics**: raised, handled by a middleware, and left unhandled
//! - **Item Metrics**: scraped, processed, and dropped items
//!
//! ## Example
//!
//! ```rust,ignore
//! let stats = engine.stats();
//! engine.run(spider).await?;
//!
//! println!("{}", stats.to_json_string_pretty()?);
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::SpiderError;
use dashmap::DashMap;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

// A consistent copy of every counter, used by all presentation methods.
struct StatsSnapshot {
    requests_enqueued: usize,
    requests_dispatched: usize,
    requests_dropped: usize,
    requests_failed: usize,
    responses_received: usize,
    responses_dropped: usize,
    total_bytes_downloaded: usize,
    exceptions_raised: usize,
    exceptions_handled: usize,
    exceptions_unhandled: usize,
    items_scraped: usize,
    items_processed: usize,
    items_dropped_by_pipeline: usize,
    response_status_counts: BTreeMap<u16, usize>,
    elapsed_duration: Duration,
}

impl StatsSnapshot {
    fn formatted_duration(&self) -> String {
        format!("{:?}", self.elapsed_duration)
    }

    fn per_second(&self, count: usize) -> f64 {
        let total_seconds = self.elapsed_duration.as_secs_f64();
        if total_seconds > 0.0 {
            count as f64 / total_seconds
        } else {
            0.0
        }
    }

    fn formatted_bytes(&self) -> String {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        const GB: usize = 1024 * MB;

        if self.total_bytes_downloaded >= GB {
            format!("{:.2} GB", self.total_bytes_downloaded as f64 / GB as f64)
        } else if self.total_bytes_downloaded >= MB {
            format!("{:.2} MB", self.total_bytes_downloaded as f64 / MB as f64)
        } else if self.total_bytes_downloaded >= KB {
            format!("{:.2} KB", self.total_bytes_downloaded as f64 / KB as f64)
        } else {
            format!("{} B", self.total_bytes_downloaded)
        }
    }
}

/// Collects and stores statistics about the engine's operation.
#[derive(Debug, serde::Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    pub start_time: Instant,

    // Request-related metrics
    pub requests_enqueued: AtomicUsize,
    pub requests_dispatched: AtomicUsize,
    pub requests_dropped: AtomicUsize,
    pub requests_failed: AtomicUsize,

    // Response-related metrics
    pub responses_received: AtomicUsize,
    pub responses_dropped: AtomicUsize,
    pub response_status_counts: DashMap<u16, usize>,
    pub total_bytes_downloaded: AtomicUsize,

    // Exception-related metrics
    pub exceptions_raised: AtomicUsize,
    pub exceptions_handled: AtomicUsize,
    pub exceptions_unhandled: AtomicUsize,

    // Item-related metrics
    pub items_scraped: AtomicUsize,
    pub items_processed: AtomicUsize,
    pub items_dropped_by_pipeline: AtomicUsize,
}

impl StatCollector {
    /// Creates a new `StatCollector` with all counters initialized to zero.
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            requests_enqueued: AtomicUsize::new(0),
            requests_dispatched: AtomicUsize::new(0),
            requests_dropped: AtomicUsize::new(0),
            requests_failed: AtomicUsize::new(0),
            responses_received: AtomicUsize::new(0),
            responses_dropped: AtomicUsize::new(0),
            response_status_counts: DashMap::new(),
            total_bytes_downloaded: AtomicUsize::new(0),
            exceptions_raised: AtomicUsize::new(0),
            exceptions_handled: AtomicUsize::new(0),
            exceptions_unhandled: AtomicUsize::new(0),
            items_scraped: AtomicUsize::new(0),
            items_processed: AtomicUsize::new(0),
            items_dropped_by_pipeline: AtomicUsize::new(0),
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        let response_status_counts = self
            .response_status_counts
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        StatsSnapshot {
            requests_enqueued: self.requests_enqueued.load(Ordering::SeqCst),
            requests_dispatched: self.requests_dispatched.load(Ordering::SeqCst),
            requests_dropped: self.requests_dropped.load(Ordering::SeqCst),
            requests_failed: self.requests_failed.load(Ordering::SeqCst),
            responses_received: self.responses_received.load(Ordering::SeqCst),
            responses_dropped: self.responses_dropped.load(Ordering::SeqCst),
            total_bytes_downloaded: self.total_bytes_downloaded.load(Ordering::SeqCst),
            exceptions_raised: self.exceptions_raised.load(Ordering::SeqCst),
            exceptions_handled: self.exceptions_handled.load(Ordering::SeqCst),
            exceptions_unhandled: self.exceptions_unhandled.load(Ordering::SeqCst),
            items_scraped: self.items_scraped.load(Ordering::SeqCst),
            items_processed: self.items_processed.load(Ordering::SeqCst),
            items_dropped_by_pipeline: self.items_dropped_by_pipeline.load(Ordering::SeqCst),
            response_status_counts,
            elapsed_duration: self.start_time.elapsed(),
        }
    }

    pub(crate) fn increment_requests_enqueued(&self) {
        self.requests_enqueued.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_requests_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::SeqCst);
    }

    /// Increments the count of requests dropped by a request middleware.
    pub(crate) fn increment_requests_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::SeqCst);
    }

    /// Increments the count of requests the downloader failed to resolve.
    pub(crate) fn increment_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Records a response, its status code and its body size.
    pub(crate) fn record_response(&self, status_code: u16, bytes: usize) {
        self.responses_received.fetch_add(1, Ordering::SeqCst);
        *self.response_status_counts.entry(status_code).or_insert(0) += 1;
        self.total_bytes_downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    pub(crate) fn increment_responses_dropped(&self) {
        self.responses_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_exceptions_raised(&self) {
        self.exceptions_raised.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_exceptions_handled(&self) {
        self.exceptions_handled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_exceptions_unhandled(&self) {
        self.exceptions_unhandled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_scraped(&self) {
        self.items_scraped.fetch_add(1, Ordering::SeqCst);
    }

    /// Increments the count of items that made it through every pipeline.
    pub(crate) fn increment_items_processed(&self) {
        self.items_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn increment_items_dropped_by_pipeline(&self) {
        self.items_dropped_by_pipeline.fetch_add(1, Ordering::SeqCst);
    }

    /// Converts the statistics into a JSON string.
    pub fn to_json_string(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Converts the statistics into a pretty-printed JSON string.
    pub fn to_json_string_pretty(&self) -> Result<String, SpiderError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Exports the current statistics to a Markdown formatted string.
    pub fn to_markdown_string(&self) -> String {
        let snapshot = self.snapshot();

        let status_codes_list: String = snapshot
            .response_status_counts
            .iter()
            .map(|(code, count)| format!("- **{}**: {}", code, count))
            .collect::<Vec<String>>()
            .join("\n");
        let status_codes_output = if status_codes_list.is_empty() {
            "N/A".to_string()
        } else {
            status_codes_list
        };

        format!(
            r#"# Crawl Statistics Report

- **Duration**: {}
- **Average Speed**: {:.2} req/s, {:.2} resp/s, {:.2} item/s

## Requests
| Metric     | Count |
|------------|-------|
| Enqueued   | {} |
| Dispatched | {} |
| Dropped    | {} |
| Failed     | {} |

## Responses
| Metric     | Count |
|------------|-------|
| Received   | {} |
| Dropped    | {} |
| Downloaded | {} |

## Exceptions
| Metric     | Count |
|------------|-------|
| Raised     | {} |
| Handled    | {} |
| Unhandled  | {} |

## Items
| Metric     | Count |
|------------|-------|
| Scraped    | {} |
| Processed  | {} |
| Dropped    | {} |

## Status Codes
{}
"#,
            snapshot.formatted_duration(),
            snapshot.per_second(snapshot.requests_dispatched),
            snapshot.per_second(snapshot.responses_received),
            snapshot.per_second(snapshot.items_scraped),
            snapshot.requests_enqueued,
            snapshot.requests_dispatched,
            snapshot.requests_dropped,
            snapshot.requests_failed,
            snapshot.responses_received,
            snapshot.responses_dropped,
            snapshot.formatted_bytes(),
            snapshot.exceptions_raised,
            snapshot.exceptions_handled,
            snapshot.exceptions_unhandled,
            snapshot.items_scraped,
            snapshot.items_processed,
            snapshot.items_dropped_by_pipeline,
            status_codes_output
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();

        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration  : {}", snapshot.formatted_duration())?;
        writeln!(
            f,
            "  speed     : req/s: {:.2}, resp/s: {:.2}, item/s: {:.2}",
            snapshot.per_second(snapshot.requests_dispatched),
            snapshot.per_second(snapshot.responses_received),
            snapshot.per_second(snapshot.items_scraped)
        )?;
        writeln!(
            f,
            "  requests  : enqueued: {}, dispatched: {}, drop: {}, fail: {}",
            snapshot.requests_enqueued,
            snapshot.requests_dispatched,
            snapshot.requests_dropped,
            snapshot.requests_failed
        )?;
        writeln!(
            f,
            "  response  : received: {}, drop: {}, downloaded: {}",
            snapshot.responses_received,
            snapshot.responses_dropped,
            snapshot.formatted_bytes()
        )?;
        writeln!(
            f,
            "  exception : raised: {}, handled: {}, unhandled: {}",
            snapshot.exceptions_raised, snapshot.exceptions_handled, snapshot.exceptions_unhandled
        )?;
        writeln!(
            f,
            "  items     : scraped: {}, processed: {}, dropped: {}",
            snapshot.items_scraped, snapshot.items_processed, snapshot.items_dropped_by_pipeline
        )?;

        let status_string = if snapshot.response_status_counts.is_empty() {
            "none".to_string()
        } else {
            snapshot
                .response_status_counts
                .iter()
                .map(|(code, count)| format!("{}: {}", code, count))
                .collect::<Vec<String>>()
                .join(", ")
        };

        writeln!(f, "  status    : {}\n", status_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_every_format() {
        let stats = StatCollector::new();
        stats.increment_requests_enqueued();
        stats.increment_requests_dispatched();
        stats.record_response(200, 2048);
        stats.record_response(404, 10);
        stats.increment_exceptions_raised();
        stats.increment_items_scraped();

        let json: serde_json::Value = serde_json::from_str(&stats.to_json_string().unwrap()).unwrap();
        assert_eq!(json["requests_enqueued"], 1);
        assert_eq!(json["responses_received"], 2);
        assert_eq!(json["response_status_counts"]["404"], 1);

        let markdown = stats.to_markdown_string();
        assert!(markdown.contains("- **200**: 1"));
        assert!(markdown.contains("2.01 KB"));

        let display = stats.to_string();
        assert!(display.contains("raised: 1, handled: 0, unhandled: 0"));
    }
}
