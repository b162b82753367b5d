//! Processing of a single unit: one request taken off the queue, carried
//! through the request middlewares, the downloader, the response middlewares
//! and the spider.
//!
//! Every unit owns a [`UnitGuard`]. Whatever path the unit leaves by (dropped
//! by a middleware, failed fetch, extraction error, full success, or even a
//! panic or abort of its task) dropping the guard releases the backpressure
//! permit and then credits the progress counter exactly once.

use super::middleware_manager::MiddlewareChain;
use super::response_parser::process_response;
use crate::concurrency::Permit;
use crate::downloader::Downloader;
use crate::error::ErrorKind;
use crate::pipeline::Pipeline;
use crate::request::Request;
use crate::spider::Spider;
use crate::state::CrawlProgress;
use crate::stats::StatCollector;
use log::trace;
use std::sync::Arc;

/// Everything a unit task needs, shared by all units of one crawl.
pub(crate) struct UnitContext<S: Spider> {
    pub(crate) spider: Arc<S>,
    pub(crate) downloader: Arc<dyn Downloader>,
    pub(crate) chain: Arc<MiddlewareChain>,
    pub(crate) pipelines: Arc<Vec<Box<dyn Pipeline<S>>>>,
    pub(crate) progress: Arc<CrawlProgress>,
    pub(crate) stats: Arc<StatCollector>,
}

pub(crate) struct UnitGuard {
    permit: Option<Permit>,
    progress: Arc<CrawlProgress>,
}

impl UnitGuard {
    pub(crate) fn new(permit: Permit, progress: Arc<CrawlProgress>) -> Self {
        UnitGuard {
            permit: Some(permit),
            progress,
        }
    }
}

impl Drop for UnitGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.progress.complete();
    }
}

pub(crate) async fn handle_unit<S: Spider>(ctx: Arc<UnitContext<S>>, request: Request, permit: Permit) {
    let _guard = UnitGuard::new(permit, Arc::clone(&ctx.progress));

    trace!("Processing request through middlewares: {}", request.url);
    let Some(request) = ctx.chain.process_request(request).await else {
        return;
    };

    trace!("Fetching {}", request.url);
    ctx.stats.increment_requests_dispatched();
    match ctx.downloader.fetch(request.clone()).resolve().await {
        Ok(response) => {
            ctx.stats.record_response(response.status, response.body.len());
            trace!("Processing response through middlewares: {}", response.url);
            if let Some(response) = ctx.chain.process_response(response).await {
                process_response(&ctx, response).await;
            }
        }
        Err(e) => {
            ctx.stats.increment_requests_failed();
            ctx.chain
                .process_exception(e.attach(ErrorKind::Transport, Some(&request), None))
                .await;
        }
    }
}
