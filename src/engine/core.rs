//! The `Engine`: lifecycle and pump loop of a crawl.
//!
//! The engine moves through `PREPARING -> RUNNING -> DRAINING -> STOPPED`:
//!
//! - **Preparing** builds the middleware chain, picks the queue, starts the
//!   downloader and every pipeline, derives backpressure from the downloader's
//!   declared concurrency and seeds the queue with the spider's entry requests.
//! - **Running** takes a permit, asks the queue for as many requests as there
//!   are free permits and spawns one unit task per request into a `JoinSet`,
//!   until the queue delivers a Stop command.
//! - **Draining** waits for the remaining unit tasks, bounded by the drain
//!   timeout.
//! - **Stopped** stops the downloader and the pipelines.
//!
//! Every fault on the way is turned into a `CrawlException` and routed through
//! the exception phase of the middleware chain. Only configuration and runtime
//! errors surface as `SpiderError`.

use super::middleware_manager::MiddlewareChain;
use super::request_handler::{UnitContext, handle_unit};
use crate::builder::EngineConfig;
use crate::concurrency::Backpressure;
use crate::downloader::Downloader;
use crate::error::{CrawlException, ErrorKind, SpiderError};
use crate::middleware::Middleware;
use crate::pipeline::Pipeline;
use crate::planned::gather;
use crate::queue::{Command, Delivery, MemoryQueue, Queue};
use crate::spider::Spider;
use crate::state::{CrawlProgress, EngineState, Lifecycle};
use crate::stats::StatCollector;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Drives one crawl from entry requests to a drained queue.
///
/// Build it with [`EngineBuilder`](crate::EngineBuilder), then call
/// [`run`](Engine::run) inside a tokio runtime or
/// [`run_blocking`](Engine::run_blocking) from plain synchronous code.
pub struct Engine<S: Spider> {
    downloader: Arc<dyn Downloader>,
    middlewares: Vec<Box<dyn Middleware>>,
    pipelines: Vec<Box<dyn Pipeline<S>>>,
    queue: Option<Arc<dyn Queue>>,
    config: EngineConfig,
    stats: Arc<StatCollector>,
    lifecycle: Arc<Lifecycle>,
}

impl<S: Spider> Engine<S> {
    pub(crate) fn new(
        downloader: Arc<dyn Downloader>,
        middlewares: Vec<Box<dyn Middleware>>,
        pipelines: Vec<Box<dyn Pipeline<S>>>,
        queue: Option<Arc<dyn Queue>>,
        config: EngineConfig,
    ) -> Self {
        Engine {
            downloader,
            middlewares,
            pipelines,
            queue,
            config,
            stats: Arc::new(StatCollector::new()),
            lifecycle: Arc::new(Lifecycle::new()),
        }
    }

    /// Returns a handle to the statistics of this engine, readable during and after the crawl.
    pub fn stats(&self) -> Arc<StatCollector> {
        Arc::clone(&self.stats)
    }

    /// Returns the lifecycle state the engine is currently in.
    pub fn state(&self) -> EngineState {
        self.lifecycle.current()
    }

    /// Subscribes to lifecycle transitions. Take it before calling `run`.
    pub fn state_watch(&self) -> watch::Receiver<EngineState> {
        self.lifecycle.subscribe()
    }

    /// Runs the crawl until the queue delivers Stop and every unit has drained.
    pub async fn run(self, spider: S) -> Result<(), SpiderError> {
        let Engine {
            downloader,
            middlewares,
            pipelines,
            queue,
            config,
            stats,
            lifecycle,
        } = self;
        let spider = Arc::new(spider);
        info!("Engine preparing crawl for spider '{}'", spider.name());

        let chain = Arc::new(MiddlewareChain::new(middlewares, Arc::clone(&stats)));

        let (queue, auto_stop) = match queue {
            Some(queue) => {
                debug!("Using external queue, auto-stop disabled");
                (queue, false)
            }
            None => {
                let method = config.crawl_method.unwrap_or_else(|| spider.crawl_method());
                debug!("Using in-memory queue ({:?})", method);
                (Arc::new(MemoryQueue::new(method)) as Arc<dyn Queue>, true)
            }
        };
        let progress = Arc::new(CrawlProgress::new(queue, auto_stop, Arc::clone(&stats)));

        if let Err(e) = downloader.start().resolve().await {
            chain.process_exception(e.attach(ErrorKind::Transport, None, None)).await;
        }

        let pipelines = Arc::new(pipelines);
        let started = gather(pipelines.iter().map(|p| p.start(&spider)).collect()).await;
        report_all(&chain, started, "start").await;

        let capacity = config
            .concurrency_override
            .unwrap_or_else(|| downloader.concurrency());
        let backpressure = Backpressure::new(capacity);
        info!(
            "Backpressure capacity: {}",
            if backpressure.is_bounded() { capacity.to_string() } else { "unbounded".to_string() }
        );

        match spider.entry_requests() {
            Ok(requests) => {
                for request in requests {
                    if let Err(e) = progress.enqueue(request).await {
                        chain.process_exception(e.attach(ErrorKind::Queue, None, None)).await;
                    }
                }
            }
            Err(e) => {
                chain
                    .process_exception(CrawlException::new(ErrorKind::Extraction, e))
                    .await;
            }
        }
        if auto_stop && progress.pending() == 0 {
            debug!("No entry requests were enqueued");
            progress.signal_stop();
        }

        lifecycle.advance(EngineState::Running);
        let ctx = Arc::new(UnitContext {
            spider: Arc::clone(&spider),
            downloader: Arc::clone(&downloader),
            chain: Arc::clone(&chain),
            pipelines: Arc::clone(&pipelines),
            progress: Arc::clone(&progress),
            stats: Arc::clone(&stats),
        });
        let mut units = JoinSet::new();

        loop {
            while let Some(result) = units.try_join_next() {
                log_unit_result(result);
            }

            let permit = backpressure.acquire().await?;
            let capacity_hint = backpressure.available().saturating_add(1);
            trace!("Pulling up to {} requests", capacity_hint);

            match progress.queue().get(capacity_hint).resolve().await {
                Ok(Delivery::Command(Command::Stop)) => {
                    info!("Stop command received");
                    break;
                }
                Ok(Delivery::Requests(requests)) => {
                    let mut first = Some(permit);
                    for request in requests {
                        let permit = match first.take() {
                            Some(permit) => permit,
                            None => backpressure.acquire().await?,
                        };
                        units.spawn(handle_unit(Arc::clone(&ctx), request, permit));
                    }
                }
                Err(e) => {
                    error!("Queue retrieval failed, draining: {}", e);
                    chain.process_exception(e.attach(ErrorKind::Queue, None, None)).await;
                    break;
                }
            }
        }

        lifecycle.advance(EngineState::Draining);
        debug!("Waiting for {} outstanding units", units.len());
        let drained = tokio::time::timeout(config.drain_timeout, async {
            while let Some(result) = units.join_next().await {
                log_unit_result(result);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Units did not complete within timeout ({}s), aborting {} remaining units",
                config.drain_timeout.as_secs_f64(),
                units.len()
            );
            units.abort_all();
            while units.join_next().await.is_some() {}
        }

        info!("Stopping downloader and pipelines");
        if let Err(e) = downloader.stop().resolve().await {
            chain.process_exception(e.attach(ErrorKind::Transport, None, None)).await;
        }
        let stopped = gather(pipelines.iter().map(|p| p.stop(&spider)).collect()).await;
        report_all(&chain, stopped, "stop").await;

        lifecycle.advance(EngineState::Stopped);
        info!(
            "Crawl finished. Stats: requests_enqueued={}, requests_dispatched={}, items_scraped={}, exceptions_raised={}",
            stats.requests_enqueued.load(Ordering::SeqCst),
            stats.requests_dispatched.load(Ordering::SeqCst),
            stats.items_scraped.load(Ordering::SeqCst),
            stats.exceptions_raised.load(Ordering::SeqCst)
        );
        trace!("{}", stats);
        Ok(())
    }

    /// Runs the crawl on a fresh current-thread runtime, blocking the calling thread.
    ///
    /// Must not be called from inside a tokio runtime.
    pub fn run_blocking(self, spider: S) -> Result<(), SpiderError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(spider))
    }
}

fn log_unit_result(result: Result<(), JoinError>) {
    match result {
        Ok(()) => trace!("Unit completed"),
        Err(e) if e.is_cancelled() => debug!("Unit aborted"),
        Err(e) => error!("A unit task failed: {}", e),
    }
}

/// Routes the failures among pipeline `start`/`stop` outcomes to the exception phase.
async fn report_all(
    chain: &MiddlewareChain,
    outcomes: Result<Vec<Result<(), CrawlException>>, CrawlException>,
    phase: &str,
) {
    let outcomes = match outcomes {
        Ok(outcomes) => outcomes,
        Err(e) => vec![Err(e)],
    };
    for outcome in outcomes {
        if let Err(e) = outcome {
            warn!("Pipeline {} failed: {}", phase, e);
            chain.process_exception(e.attach(ErrorKind::Pipeline, None, None)).await;
        }
    }
}
