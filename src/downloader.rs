//! # Downloader Module
//!
//! The fetch boundary of the engine.
//!
//! ## Overview
//!
//! A [`Downloader`] turns a [`Request`] into a [`Response`]. Its `fetch` may
//! answer inline (blocking I/O on the driver) or return a [`Planned`] settled
//! later by a worker thread or a tokio task. It also declares how many fetches
//! it can run at once; the engine derives its backpressure from that number.
//!
//! Two adapters are provided so a fetch implementation only has to be written
//! in its natural style:
//!
//! - [`ThreadPoolDownloader`]: runs a blocking [`BlockingFetch`] on a fixed set
//!   of OS worker threads.
//! - [`AsyncDownloader`]: runs an [`AsyncFetch`] as tokio tasks.
//!
//! Transport failures come back as [`CrawlException`]s of kind
//! [`ErrorKind::Transport`](crate::error::ErrorKind::Transport).

use crate::error::{CrawlException, ErrorKind};
use crate::planned::{MaybePlanned, Planned};
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;
use kanal::Sender;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace};

pub trait Downloader: Send + Sync + 'static {
    /// Acquires whatever the downloader needs (pools, sessions) before the crawl.
    fn start(&self) -> MaybePlanned<()> {
        MaybePlanned::ready(())
    }

    /// Releases what `start` acquired once the crawl has drained.
    fn stop(&self) -> MaybePlanned<()> {
        MaybePlanned::ready(())
    }

    fn fetch(&self, request: Request) -> MaybePlanned<Response>;

    /// How many fetches may be in flight at once. `0` means no limit.
    fn concurrency(&self) -> usize {
        0
    }
}

/// A fetch routine that blocks the calling thread.
pub trait BlockingFetch: Send + Sync + 'static {
    fn fetch(&self, request: &Request) -> anyhow::Result<Response>;
}

impl<F> BlockingFetch for F
where
    F: Fn(&Request) -> anyhow::Result<Response> + Send + Sync + 'static,
{
    fn fetch(&self, request: &Request) -> anyhow::Result<Response> {
        self(request)
    }
}

/// A fetch routine that suspends instead of blocking.
#[async_trait]
pub trait AsyncFetch: Send + Sync + 'static {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response>;
}

struct FetchJob {
    request: Request,
    planned: Planned<Response>,
}

struct WorkerPool {
    jobs: Sender<FetchJob>,
    workers: Vec<JoinHandle<()>>,
}

/// Runs a [`BlockingFetch`] on `pool_size` OS threads.
///
/// Each `fetch` returns immediately with a [`Planned`] that the worker thread
/// settles once the blocking call returns.
pub struct ThreadPoolDownloader<F: BlockingFetch> {
    fetcher: Arc<F>,
    pool_size: usize,
    pool: Mutex<Option<WorkerPool>>,
}

impl<F: BlockingFetch> ThreadPoolDownloader<F> {
    /// Creates a downloader with one worker per CPU.
    pub fn new(fetcher: F) -> Self {
        Self::from_shared(Arc::new(fetcher), num_cpus::get())
    }

    pub fn from_shared(fetcher: Arc<F>, pool_size: usize) -> Self {
        ThreadPoolDownloader {
            fetcher,
            pool_size: pool_size.max(1),
            pool: Mutex::new(None),
        }
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    fn spawn_pool(&self) -> std::io::Result<WorkerPool> {
        let (jobs, queue) = kanal::unbounded::<FetchJob>();
        let mut workers = Vec::with_capacity(self.pool_size);
        for index in 0..self.pool_size {
            let queue = queue.clone();
            let fetcher = Arc::clone(&self.fetcher);
            let handle = std::thread::Builder::new()
                .name(format!("spider-fetch-{index}"))
                .spawn(move || {
                    while let Ok(job) = queue.recv() {
                        trace!("Worker {} fetching {}", index, job.request.url);
                        // A panicking fetch fails its own job; the worker keeps serving.
                        let fetched =
                            panic::catch_unwind(AssertUnwindSafe(|| fetcher.fetch(&job.request)));
                        match fetched {
                            Ok(Ok(response)) => job.planned.set_result(response),
                            Ok(Err(e)) => job
                                .planned
                                .set_exception(CrawlException::transport(job.request, e)),
                            Err(payload) => {
                                let message = panic_message(payload.as_ref());
                                error!(
                                    "Worker {} panicked fetching {}: {}",
                                    index, job.request.url, message
                                );
                                job.planned.set_exception(CrawlException::transport(
                                    job.request,
                                    anyhow::anyhow!("fetch panicked: {}", message),
                                ))
                            }
                        };
                    }
                    trace!("Worker {} exiting", index);
                })?;
            workers.push(handle);
        }
        Ok(WorkerPool { jobs, workers })
    }
}

impl<F: BlockingFetch> Downloader for ThreadPoolDownloader<F> {
    fn start(&self) -> MaybePlanned<()> {
        let mut pool = self.pool.lock();
        if pool.is_some() {
            return MaybePlanned::ready(());
        }
        match self.spawn_pool() {
            Ok(spawned) => {
                info!("Started {} fetch worker threads", self.pool_size);
                *pool = Some(spawned);
                MaybePlanned::ready(())
            }
            Err(e) => MaybePlanned::fail(CrawlException::new(ErrorKind::Transport, e)),
        }
    }

    fn stop(&self) -> MaybePlanned<()> {
        let Some(WorkerPool { jobs, workers }) = self.pool.lock().take() else {
            return MaybePlanned::ready(());
        };
        // Workers exit once the job channel is closed and empty.
        drop(jobs);
        Planned::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    error!("A fetch worker thread panicked");
                }
            }
            debug!("All fetch worker threads joined");
            Ok::<_, CrawlException>(())
        })
        .into()
    }

    fn fetch(&self, request: Request) -> MaybePlanned<Response> {
        let guard = self.pool.lock();
        let Some(pool) = guard.as_ref() else {
            return MaybePlanned::fail(CrawlException::transport(
                request,
                anyhow::anyhow!("thread pool downloader is not started"),
            ));
        };
        let planned = Planned::new();
        let job = FetchJob {
            request: request.clone(),
            planned: planned.clone(),
        };
        if pool.jobs.send(job).is_err() {
            return MaybePlanned::fail(CrawlException::transport(
                request,
                anyhow::anyhow!("fetch worker pool is closed"),
            ));
        }
        planned.into()
    }

    fn concurrency(&self) -> usize {
        self.pool_size
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs an [`AsyncFetch`] as tokio tasks. Must be used inside a tokio runtime.
pub struct AsyncDownloader<F: AsyncFetch> {
    fetcher: Arc<F>,
    concurrency: usize,
}

impl<F: AsyncFetch> AsyncDownloader<F> {
    /// Creates a downloader declaring `concurrency` parallel fetches (`0` = unbounded).
    pub fn new(fetcher: F, concurrency: usize) -> Self {
        Self::from_shared(Arc::new(fetcher), concurrency)
    }

    pub fn from_shared(fetcher: Arc<F>, concurrency: usize) -> Self {
        AsyncDownloader {
            fetcher,
            concurrency,
        }
    }
}

impl<F: AsyncFetch> Downloader for AsyncDownloader<F> {
    fn fetch(&self, request: Request) -> MaybePlanned<Response> {
        let fetcher = Arc::clone(&self.fetcher);
        Planned::spawn(async move {
            let url = request.url.clone();
            let failed = request.clone();
            let result = fetcher.fetch(request).await;
            trace!("Fetch of {} finished, ok={}", url, result.is_ok());
            result.map_err(|e| CrawlException::transport(failed, e))
        })
        .into()
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn echo(request: &Request) -> anyhow::Result<Response> {
        if request.url.path() == "/broken" {
            anyhow::bail!("connection refused");
        }
        Ok(Response::new(request.clone(), 200, request.url.path().to_string()))
    }

    #[tokio::test]
    async fn test_thread_pool_fetches_on_workers() {
        let downloader = ThreadPoolDownloader::new(echo).pool_size(2);
        assert_eq!(downloader.concurrency(), 2);
        downloader.start().resolve().await.unwrap();

        let ok = downloader.fetch(Request::parse("http://site.test/page").unwrap());
        let broken = downloader.fetch(Request::parse("http://site.test/broken").unwrap());

        assert_eq!(ok.resolve().await.unwrap().text(), "/page");
        let err = broken.resolve().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.request().map(|r| r.url.path()), Some("/broken"));

        downloader.stop().resolve().await.unwrap();
    }

    #[tokio::test]
    async fn test_thread_pool_worker_survives_panicking_fetch() {
        let fetch = |request: &Request| -> anyhow::Result<Response> {
            if request.url.path() == "/explode" {
                panic!("parser blew up");
            }
            echo(request)
        };
        let downloader = ThreadPoolDownloader::new(fetch).pool_size(1);
        downloader.start().resolve().await.unwrap();

        let err = downloader
            .fetch(Request::parse("http://site.test/explode").unwrap())
            .resolve()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("parser blew up"));

        // the single worker is still alive
        let ok = downloader.fetch(Request::parse("http://site.test/after").unwrap());
        assert_eq!(ok.resolve().await.unwrap().text(), "/after");

        downloader.stop().resolve().await.unwrap();
    }

    #[tokio::test]
    async fn test_thread_pool_rejects_fetch_before_start() {
        let downloader = ThreadPoolDownloader::new(echo);
        let err = downloader
            .fetch(Request::parse("http://site.test/page").unwrap())
            .resolve()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    struct Delayed {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AsyncFetch for Delayed {
        async fn fetch(&self, request: Request) -> anyhow::Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Response::new(request, 204, ""))
        }
    }

    #[tokio::test]
    async fn test_async_downloader_returns_planned() {
        let fetcher = Arc::new(Delayed {
            calls: AtomicUsize::new(0),
        });
        let downloader = AsyncDownloader::from_shared(Arc::clone(&fetcher), 4);

        let fetched = downloader.fetch(Request::parse("http://site.test/").unwrap());
        assert!(matches!(fetched, MaybePlanned::Planned(_)));
        assert_eq!(fetched.resolve().await.unwrap().status, 204);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(downloader.concurrency(), 4);
    }
}
