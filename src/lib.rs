//! # spider-engine
//!
//! Crawl orchestration engine of the `spider-lib` web scraping framework.
//!
//! Drives requests through a middleware chain, a pluggable downloader, the
//! spider's extraction and a pipeline chain, then feeds follow-up requests back
//! into the queue. It tracks in-flight work to detect when the crawl is done,
//! bounds fan-out by the downloader's declared concurrency, and runs the same
//! orchestration logic whether collaborators block, use worker threads, or
//! suspend on tokio.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! #[derive(Debug)]
//! struct Page(String);
//!
//! struct SiteSpider;
//!
//! impl Spider for SiteSpider {
//!     type Item = Page;
//!
//!     fn start_urls(&self) -> Vec<&str> {
//!         vec!["https://example.com/"]
//!     }
//!
//!     fn extract(&self, response: &Response) -> MaybePlanned<ParseOutput<Page>> {
//!         let mut output = ParseOutput::new();
//!         output.add_item(Page(response.url.to_string()));
//!         MaybePlanned::ready(output)
//!     }
//! }
//!
//! fn fetch(request: &Request) -> anyhow::Result<Response> {
//!     todo!()
//! }
//!
//! fn main() -> Result<(), SpiderError> {
//!     let engine = EngineBuilder::new(ThreadPoolDownloader::new(fetch)).build()?;
//!     engine.run_blocking(SiteSpider)
//! }
//! ```

pub mod builder;
pub mod concurrency;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod item;
pub mod middleware;
pub mod pipeline;
pub mod planned;
pub mod prelude;
pub mod queue;
pub mod request;
pub mod response;
pub mod spider;
pub mod state;
pub mod stats;

pub use builder::{EngineBuilder, EngineConfig};
pub use downloader::{AsyncDownloader, AsyncFetch, BlockingFetch, Downloader, ThreadPoolDownloader};
pub use engine::Engine;
pub use error::{CrawlException, ErrorKind, SpiderError};
pub use item::{Output, ParseOutput};
pub use middleware::{DedupMiddleware, Middleware, MiddlewareAction};
pub use pipeline::Pipeline;
pub use planned::{MaybePlanned, Planned, PlannedState, gather};
pub use queue::{
    BlockingQueue, BlockingSource, Command, Delivery, MemoryQueue, Queue, QueueEntry, SharedQueue,
    SharedQueueHandle,
};
pub use request::Request;
pub use response::Response;
pub use spider::{CrawlMethod, Spider};
pub use state::EngineState;
pub use stats::StatCollector;

pub use async_trait::async_trait;
pub use tokio;
