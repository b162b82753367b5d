//! # Spider Module
//!
//! Defines the `Spider` trait, the contract a crawler implements to drive the engine.
//!
//! ## Overview
//!
//! A spider decides where a crawl starts, what is extracted from every
//! response, and which locators are followed next. The engine seeds the queue
//! with [`Spider::entry_requests`] once, then for every response that survives
//! the middleware chain it calls, in order:
//!
//! 1. [`Spider::extract`]: items and locators, routed in stream order,
//! 2. [`Spider::next_requests`]: extra locators, merged the same way,
//! 3. [`Spider::on_processing_done`]: a best-effort completion hook.
//!
//! Every hook returns a [`MaybePlanned`], so a spider may answer immediately or
//! hand work off to a thread pool or a tokio task.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! #[derive(Debug)]
//! struct Title(String);
//!
//! struct TitleSpider;
//!
//! impl Spider for TitleSpider {
//!     type Item = Title;
//!
//!     fn start_urls(&self) -> Vec<&str> {
//!         vec!["https://example.com/"]
//!     }
//!
//!     fn extract(&self, response: &Response) -> MaybePlanned<ParseOutput<Title>> {
//!         let mut output = ParseOutput::new();
//!         output.add_item(Title(response.text()));
//!         output.add_url("/next");
//!         MaybePlanned::ready(output)
//!     }
//! }
//! ```

use crate::error::SpiderError;
use crate::item::ParseOutput;
use crate::planned::MaybePlanned;
use crate::request::Request;
use crate::response::Response;
use std::fmt::Debug;

/// Traversal order of the default in-memory queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrawlMethod {
    /// Last in, first out.
    #[default]
    DepthFirst,
    /// First in, first out.
    BreadthFirst,
}

/// Defines the contract for a crawler driven by the engine.
pub trait Spider: Send + Sync + 'static {
    /// The type of item that the spider scrapes.
    type Item: Debug + Send + Sync + 'static;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn crawl_method(&self) -> CrawlMethod {
        CrawlMethod::default()
    }

    /// Absolute locators the crawl starts from.
    fn start_urls(&self) -> Vec<&str> {
        Vec::new()
    }

    /// Requests seeded into the queue once, while the engine prepares.
    fn entry_requests(&self) -> Result<Vec<Request>, SpiderError> {
        let requests: Result<Vec<Request>, url::ParseError> =
            self.start_urls().into_iter().map(Request::parse).collect();
        Ok(requests?)
    }

    /// Extracts items and locators to follow from a response.
    fn extract(&self, response: &Response) -> MaybePlanned<ParseOutput<Self::Item>>;

    /// Additional requests appended after extraction.
    fn next_requests(&self, _response: &Response) -> MaybePlanned<ParseOutput<Self::Item>> {
        MaybePlanned::ready(ParseOutput::new())
    }

    /// Called once the response has been fully routed. Failures are reported, never fatal.
    fn on_processing_done(&self, _response: &Response) -> MaybePlanned<()> {
        MaybePlanned::ready(())
    }
}
