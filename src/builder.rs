//! # Builder Module
//!
//! Provides the `EngineBuilder`, a fluent API for assembling an `Engine` from a
//! downloader, middlewares, pipelines and an optional external queue.
//!
//! ## Overview
//!
//! The builder holds an [`EngineConfig`] plus the registered components and
//! validates the combination in [`EngineBuilder::build`]. Middlewares and
//! pipelines keep their registration order: it is the order requests and items
//! see them.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::prelude::*;
//!
//! fn main() -> Result<(), SpiderError> {
//!     let engine = EngineBuilder::new(ThreadPoolDownloader::new(fetch_page))
//!         .crawl_method(CrawlMethod::BreadthFirst)
//!         .add_middleware(DedupMiddleware::new())
//!         .add_pipeline(PrintPipeline)
//!         .build()?;
//!
//!     engine.run_blocking(MySpider)
//! }
//! ```

use crate::engine::Engine;
use crate::downloader::Downloader;
use crate::error::SpiderError;
use crate::middleware::Middleware;
use crate::pipeline::Pipeline;
use crate::queue::Queue;
use crate::spider::{CrawlMethod, Spider};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Tunables of a crawl.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overrides the spider's traversal order for the in-memory queue.
    pub crawl_method: Option<CrawlMethod>,
    /// Replaces the concurrency the downloader declares. `Some(0)` disables backpressure.
    pub concurrency_override: Option<usize>,
    /// Upper bound on draining; units still running afterwards are aborted.
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            crawl_method: None,
            concurrency_override: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

pub struct EngineBuilder<S: Spider> {
    config: EngineConfig,
    downloader: Arc<dyn Downloader>,
    middlewares: Vec<Box<dyn Middleware>>,
    pipelines: Vec<Box<dyn Pipeline<S>>>,
    queue: Option<Arc<dyn Queue>>,
    _phantom: PhantomData<S>,
}

impl<S: Spider> EngineBuilder<S> {
    /// Creates a builder around the downloader every request is fetched with.
    pub fn new<D: Downloader>(downloader: D) -> Self {
        Self::with_shared_downloader(Arc::new(downloader))
    }

    /// Creates a builder around a downloader the caller keeps a handle to.
    pub fn with_shared_downloader(downloader: Arc<dyn Downloader>) -> Self {
        EngineBuilder {
            config: EngineConfig::default(),
            downloader,
            middlewares: Vec::new(),
            pipelines: Vec::new(),
            queue: None,
            _phantom: PhantomData,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the traversal order of the in-memory queue, overriding the spider's.
    pub fn crawl_method(mut self, method: CrawlMethod) -> Self {
        self.config.crawl_method = Some(method);
        self
    }

    /// Sets the number of units allowed in flight, overriding the downloader's declaration.
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.config.concurrency_override = Some(limit);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Uses an external queue. The engine then never sends Stop on its own.
    pub fn queue<Q: Queue>(self, queue: Q) -> Self {
        self.shared_queue(Arc::new(queue))
    }

    pub fn shared_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn add_middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middlewares.push(Box::new(middleware));
        self
    }

    pub fn add_pipeline<P: Pipeline<S>>(mut self, pipeline: P) -> Self {
        self.pipelines.push(Box::new(pipeline));
        self
    }

    /// Validates the configuration and builds the `Engine`.
    pub fn build(self) -> Result<Engine<S>, SpiderError> {
        self.validate()?;
        Ok(Engine::new(
            self.downloader,
            self.middlewares,
            self.pipelines,
            self.queue,
            self.config,
        ))
    }

    fn validate(&self) -> Result<(), SpiderError> {
        if self.queue.is_some() && self.config.crawl_method.is_some() {
            return Err(SpiderError::ConfigurationError(
                "crawl_method only applies to the in-memory queue, not to an external queue."
                    .to_string(),
            ));
        }
        if self.config.drain_timeout.is_zero() {
            return Err(SpiderError::ConfigurationError(
                "drain_timeout must be greater than 0.".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ParseOutput;
    use crate::planned::MaybePlanned;
    use crate::queue::SharedQueue;
    use crate::request::Request;
    use crate::response::Response;

    struct Noop;

    impl Spider for Noop {
        type Item = ();

        fn extract(&self, _response: &Response) -> MaybePlanned<ParseOutput<()>> {
            MaybePlanned::ready(ParseOutput::new())
        }
    }

    fn fetch(request: &Request) -> anyhow::Result<Response> {
        Ok(Response::new(request.clone(), 200, ""))
    }

    fn builder() -> EngineBuilder<Noop> {
        EngineBuilder::new(crate::ThreadPoolDownloader::new(fetch).pool_size(1))
    }

    #[test]
    fn test_external_queue_rejects_crawl_method() {
        let result = builder()
            .queue(SharedQueue::new())
            .crawl_method(CrawlMethod::BreadthFirst)
            .build();
        assert!(matches!(result, Err(SpiderError::ConfigurationError(_))));
    }

    #[test]
    fn test_zero_drain_timeout_is_rejected() {
        let result = builder().drain_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(SpiderError::ConfigurationError(_))));
    }

    #[test]
    fn test_defaults_build() {
        let engine = builder().concurrency(4).build().unwrap();
        assert_eq!(engine.state(), crate::EngineState::Preparing);
    }
}
