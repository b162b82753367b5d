//! # Queue Module
//!
//! The work queue feeding the engine.
//!
//! ## Overview
//!
//! Requests and control commands share one channel. The engine asks the queue
//! for work with a capacity hint (the number of backpressure permits currently
//! free) and a batching queue may hand back up to that many requests at once.
//! A [`Command::Stop`] delivered by the queue ends the crawl.
//!
//! ## Implementations
//!
//! - [`MemoryQueue`]: the default. LIFO for depth-first traversal, FIFO for
//!   breadth-first. The engine owns it and puts the Stop command itself once
//!   every request it enqueued has been processed.
//! - [`SharedQueue`]: a multi-producer queue backed by a kanal channel. Other
//!   producers keep feeding it through [`SharedQueueHandle`]s and one of them
//!   is responsible for sending Stop.
//! - [`BlockingQueue`]: wraps any [`BlockingSource`] (a queue whose calls
//!   block, such as a network-backed list) by running its calls on tokio's
//!   blocking pool.
//!
//! External queues (the last two) opt out of engine-driven auto-stop.

use crate::error::{CrawlException, ErrorKind};
use crate::planned::{MaybePlanned, Planned};
use crate::request::Request;
use crate::spider::CrawlMethod;
use kanal::{AsyncReceiver, AsyncSender, unbounded_async};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Control sentinels sharing the request channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command {
    /// No more work will arrive: drain and stop.
    Stop,
}

/// Anything that can be put on a queue.
#[derive(Debug, Clone)]
pub enum QueueEntry {
    Request(Request),
    Command(Command),
}

impl From<Request> for QueueEntry {
    fn from(request: Request) -> Self {
        QueueEntry::Request(request)
    }
}

impl From<Command> for QueueEntry {
    fn from(command: Command) -> Self {
        QueueEntry::Command(command)
    }
}

/// What one retrieval hands to the engine.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Between one and `capacity_hint` requests, in delivery order.
    Requests(Vec<Request>),
    Command(Command),
}

pub trait Queue: Send + Sync + 'static {
    /// Retrieves the next command, or up to `capacity_hint` requests.
    ///
    /// Waits (through a pending [`Planned`]) while the queue is empty.
    fn get(&self, capacity_hint: usize) -> MaybePlanned<Delivery>;

    fn put(&self, entries: Vec<QueueEntry>) -> MaybePlanned<()>;
}

fn queue_error(cause: impl Into<anyhow::Error>) -> CrawlException {
    CrawlException::new(ErrorKind::Queue, cause)
}

struct MemoryInner {
    entries: VecDeque<QueueEntry>,
    waiters: VecDeque<(usize, Planned<Delivery>)>,
}

/// The default in-memory queue.
pub struct MemoryQueue {
    method: CrawlMethod,
    inner: Mutex<MemoryInner>,
}

impl MemoryQueue {
    pub fn new(method: CrawlMethod) -> Self {
        MemoryQueue {
            method,
            inner: Mutex::new(MemoryInner {
                entries: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Depth-first traversal.
    pub fn lifo() -> Self {
        Self::new(CrawlMethod::DepthFirst)
    }

    /// Breadth-first traversal.
    pub fn fifo() -> Self {
        Self::new(CrawlMethod::BreadthFirst)
    }

    pub fn method(&self) -> CrawlMethod {
        self.method
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self, entries: &mut VecDeque<QueueEntry>) -> Option<QueueEntry> {
        match self.method {
            CrawlMethod::DepthFirst => entries.pop_back(),
            CrawlMethod::BreadthFirst => entries.pop_front(),
        }
    }

    fn peek_is_command(&self, entries: &VecDeque<QueueEntry>) -> bool {
        let next = match self.method {
            CrawlMethod::DepthFirst => entries.back(),
            CrawlMethod::BreadthFirst => entries.front(),
        };
        matches!(next, Some(QueueEntry::Command(_)))
    }

    /// Takes one delivery. A command is always delivered on its own.
    fn take_batch(&self, entries: &mut VecDeque<QueueEntry>, capacity_hint: usize) -> Option<Delivery> {
        let mut batch = match self.pop(entries)? {
            QueueEntry::Command(command) => return Some(Delivery::Command(command)),
            QueueEntry::Request(request) => vec![request],
        };
        while batch.len() < capacity_hint.max(1) && !self.peek_is_command(entries) {
            match self.pop(entries) {
                Some(QueueEntry::Request(request)) => batch.push(request),
                Some(entry) => {
                    match self.method {
                        CrawlMethod::DepthFirst => entries.push_back(entry),
                        CrawlMethod::BreadthFirst => entries.push_front(entry),
                    }
                    break;
                }
                None => break,
            }
        }
        Some(Delivery::Requests(batch))
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(CrawlMethod::default())
    }
}

impl Queue for MemoryQueue {
    fn get(&self, capacity_hint: usize) -> MaybePlanned<Delivery> {
        let mut inner = self.inner.lock();
        if let Some(delivery) = self.take_batch(&mut inner.entries, capacity_hint) {
            return MaybePlanned::ready(delivery);
        }
        trace!("Memory queue empty, parking retrieval");
        let planned = Planned::new();
        inner.waiters.push_back((capacity_hint, planned.clone()));
        planned.into()
    }

    fn put(&self, entries: Vec<QueueEntry>) -> MaybePlanned<()> {
        let mut handed_over = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.entries.extend(entries);
            while !inner.entries.is_empty() {
                let Some((capacity_hint, waiter)) = inner.waiters.pop_front() else {
                    break;
                };
                // Skip retrievals whose caller went away before anything arrived.
                if waiter.is_done() || waiter.is_orphaned() {
                    continue;
                }
                if let Some(delivery) = self.take_batch(&mut inner.entries, capacity_hint) {
                    handed_over.push((waiter, delivery));
                }
            }
        }
        // Settle outside the lock: waking a waiter may run its callbacks inline.
        for (waiter, delivery) in handed_over {
            waiter.settle(Ok(delivery));
        }
        MaybePlanned::ready(())
    }
}

/// An external multi-producer queue on a kanal channel.
///
/// Retrieval hands out at most `capacity_hint` requests; a command received
/// mid-batch is held back and delivered on the next call.
pub struct SharedQueue {
    tx: AsyncSender<QueueEntry>,
    rx: AsyncReceiver<QueueEntry>,
    held: Arc<Mutex<Option<Command>>>,
}

/// A producer side of a [`SharedQueue`].
#[derive(Clone)]
pub struct SharedQueueHandle {
    tx: AsyncSender<QueueEntry>,
}

impl SharedQueueHandle {
    pub async fn push(&self, request: Request) -> Result<(), CrawlException> {
        self.tx
            .send(QueueEntry::Request(request))
            .await
            .map_err(queue_error)
    }

    /// Asks the consuming engine to drain and stop.
    pub async fn stop(&self) -> Result<(), CrawlException> {
        self.tx
            .send(QueueEntry::Command(Command::Stop))
            .await
            .map_err(queue_error)
    }
}

impl SharedQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded_async();
        SharedQueue {
            tx,
            rx,
            held: Arc::new(Mutex::new(None)),
        }
    }

    pub fn handle(&self) -> SharedQueueHandle {
        SharedQueueHandle {
            tx: self.tx.clone(),
        }
    }

    /// Adds whatever is immediately available to `batch`, holding back a command.
    fn fill(
        rx: &AsyncReceiver<QueueEntry>,
        held: &Mutex<Option<Command>>,
        batch: &mut Vec<Request>,
        capacity_hint: usize,
    ) {
        while batch.len() < capacity_hint.max(1) {
            match rx.try_recv() {
                Ok(Some(QueueEntry::Request(request))) => batch.push(request),
                Ok(Some(QueueEntry::Command(command))) => {
                    *held.lock() = Some(command);
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Settles `parked` with the next delivery.
    ///
    /// If the caller dropped its handle in the meantime, the received entry goes
    /// back on the channel instead.
    async fn park_retrieval(
        rx: AsyncReceiver<QueueEntry>,
        tx: AsyncSender<QueueEntry>,
        held: Arc<Mutex<Option<Command>>>,
        capacity_hint: usize,
        parked: Planned<Delivery>,
    ) {
        let entry = match rx.recv().await {
            Ok(entry) => entry,
            Err(e) => {
                parked.set_exception(queue_error(e));
                return;
            }
        };
        if parked.is_orphaned() {
            trace!("Retrieval abandoned, returning entry to the shared queue");
            if !matches!(tx.try_send(entry), Ok(true)) {
                warn!("Could not return an entry to the shared queue");
            }
            return;
        }
        let delivery = match entry {
            QueueEntry::Command(command) => Delivery::Command(command),
            QueueEntry::Request(request) => {
                let mut batch = vec![request];
                Self::fill(&rx, &held, &mut batch, capacity_hint);
                Delivery::Requests(batch)
            }
        };
        parked.set_result(delivery);
    }
}

impl Default for SharedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for SharedQueue {
    fn get(&self, capacity_hint: usize) -> MaybePlanned<Delivery> {
        if let Some(command) = self.held.lock().take() {
            return MaybePlanned::ready(Delivery::Command(command));
        }

        match self.rx.try_recv() {
            Ok(Some(QueueEntry::Command(command))) => MaybePlanned::ready(Delivery::Command(command)),
            Ok(Some(QueueEntry::Request(request))) => {
                let mut batch = vec![request];
                Self::fill(&self.rx, &self.held, &mut batch, capacity_hint);
                MaybePlanned::ready(Delivery::Requests(batch))
            }
            Ok(None) => {
                let planned = Planned::new();
                tokio::spawn(Self::park_retrieval(
                    self.rx.clone(),
                    self.tx.clone(),
                    Arc::clone(&self.held),
                    capacity_hint,
                    planned.clone(),
                ));
                planned.into()
            }
            Err(e) => {
                warn!("Shared queue receive failed: {}", e);
                MaybePlanned::fail(queue_error(e))
            }
        }
    }

    fn put(&self, entries: Vec<QueueEntry>) -> MaybePlanned<()> {
        for entry in entries {
            match self.tx.try_send(entry) {
                Ok(true) => {}
                Ok(false) => {
                    return MaybePlanned::fail(queue_error(anyhow::anyhow!("shared queue is full")));
                }
                Err(e) => return MaybePlanned::fail(queue_error(e)),
            }
        }
        MaybePlanned::ready(())
    }
}

/// A queue whose calls block the calling thread.
pub trait BlockingSource: Send + Sync + 'static {
    fn get(&self, capacity_hint: usize) -> anyhow::Result<Delivery>;
    fn put(&self, entries: Vec<QueueEntry>) -> anyhow::Result<()>;
}

/// Adapts a [`BlockingSource`] to [`Queue`] by running each call on tokio's blocking pool.
pub struct BlockingQueue<B: BlockingSource> {
    source: Arc<B>,
}

impl<B: BlockingSource> BlockingQueue<B> {
    pub fn new(source: B) -> Self {
        Self::from_shared(Arc::new(source))
    }

    pub fn from_shared(source: Arc<B>) -> Self {
        BlockingQueue { source }
    }
}

impl<B: BlockingSource> Queue for BlockingQueue<B> {
    fn get(&self, capacity_hint: usize) -> MaybePlanned<Delivery> {
        let source = Arc::clone(&self.source);
        Planned::spawn_blocking(move || source.get(capacity_hint).map_err(queue_error)).into()
    }

    fn put(&self, entries: Vec<QueueEntry>) -> MaybePlanned<()> {
        let source = Arc::clone(&self.source);
        debug!("Handing {} entries to blocking queue", entries.len());
        Planned::spawn_blocking(move || source.put(entries).map_err(queue_error)).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(path: &str) -> Request {
        Request::parse(&format!("http://site.test{path}")).unwrap()
    }

    fn paths(delivery: Delivery) -> Vec<String> {
        match delivery {
            Delivery::Requests(requests) => requests.iter().map(|r| r.url.path().to_string()).collect(),
            Delivery::Command(command) => vec![format!("{command:?}")],
        }
    }

    #[tokio::test]
    async fn test_round_trip_returns_request_once() {
        let queue = MemoryQueue::lifo();
        let original = request("/a").with_meta("k", 1);
        queue.put(vec![original.clone().into()]).resolve().await.unwrap();

        match queue.get(1).resolve().await.unwrap() {
            Delivery::Requests(requests) => assert_eq!(requests, vec![original]),
            other => panic!("unexpected delivery: {other:?}"),
        }
        assert!(matches!(queue.get(1), MaybePlanned::Planned(_)));
    }

    #[tokio::test]
    async fn test_lifo_and_fifo_order() {
        let lifo = MemoryQueue::lifo();
        let fifo = MemoryQueue::fifo();
        for queue in [&lifo, &fifo] {
            queue
                .put(vec![request("/1").into(), request("/2").into(), request("/3").into()])
                .resolve()
                .await
                .unwrap();
        }

        assert_eq!(paths(lifo.get(2).resolve().await.unwrap()), vec!["/3", "/2"]);
        assert_eq!(paths(fifo.get(2).resolve().await.unwrap()), vec!["/1", "/2"]);
        assert_eq!(lifo.len(), 1);
    }

    #[tokio::test]
    async fn test_command_is_delivered_alone() {
        let queue = MemoryQueue::fifo();
        queue
            .put(vec![request("/1").into(), Command::Stop.into(), request("/2").into()])
            .resolve()
            .await
            .unwrap();

        assert_eq!(paths(queue.get(10).resolve().await.unwrap()), vec!["/1"]);
        assert_eq!(paths(queue.get(10).resolve().await.unwrap()), vec!["Stop"]);
        assert_eq!(paths(queue.get(10).resolve().await.unwrap()), vec!["/2"]);
    }

    #[tokio::test]
    async fn test_parked_get_is_woken_by_put() {
        let queue = MemoryQueue::lifo();
        let pending = queue.get(4);
        assert!(!pending.is_ready());

        queue.put(vec![Command::Stop.into()]).resolve().await.unwrap();
        assert!(matches!(
            pending.resolve().await.unwrap(),
            Delivery::Command(Command::Stop)
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shared_queue_holds_back_command() {
        let queue = SharedQueue::new();
        let handle = queue.handle();
        handle.push(request("/1")).await.unwrap();
        handle.stop().await.unwrap();

        assert_eq!(paths(queue.get(5).resolve().await.unwrap()), vec!["/1"]);
        assert_eq!(paths(queue.get(5).resolve().await.unwrap()), vec!["Stop"]);
    }

    #[tokio::test]
    async fn test_shared_queue_waits_for_producer() {
        let queue = SharedQueue::new();
        let handle = queue.handle();
        let pending = queue.get(1);

        tokio::spawn(async move {
            handle.push(request("/late")).await.unwrap();
        });

        assert_eq!(paths(pending.resolve().await.unwrap()), vec!["/late"]);
    }

    #[tokio::test]
    async fn test_abandoned_memory_retrieval_keeps_entries() {
        let queue = MemoryQueue::fifo();
        let abandoned = queue.get(4);
        assert!(!abandoned.is_ready());
        drop(abandoned);

        queue.put(vec![request("/kept").into()]).resolve().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(paths(queue.get(4).resolve().await.unwrap()), vec!["/kept"]);
    }

    #[tokio::test]
    async fn test_abandoned_shared_retrieval_keeps_entries() {
        let queue = SharedQueue::new();
        let handle = queue.handle();
        let abandoned = queue.get(4);
        assert!(!abandoned.is_ready());
        drop(abandoned);
        // let the parked retrieval start waiting on the channel
        tokio::task::yield_now().await;

        handle.push(request("/kept")).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), queue.get(4).resolve())
            .await
            .expect("entry was lost")
            .unwrap();
        assert_eq!(paths(next), vec!["/kept"]);
    }

    struct VecSource(Mutex<Vec<QueueEntry>>);

    impl BlockingSource for VecSource {
        fn get(&self, _capacity_hint: usize) -> anyhow::Result<Delivery> {
            match self.0.lock().pop() {
                Some(QueueEntry::Request(r)) => Ok(Delivery::Requests(vec![r])),
                Some(QueueEntry::Command(c)) => Ok(Delivery::Command(c)),
                None => anyhow::bail!("source exhausted"),
            }
        }

        fn put(&self, entries: Vec<QueueEntry>) -> anyhow::Result<()> {
            self.0.lock().extend(entries);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_blocking_queue_adapter() {
        let queue = BlockingQueue::new(VecSource(Mutex::new(Vec::new())));
        queue.put(vec![request("/x").into()]).resolve().await.unwrap();

        assert_eq!(paths(queue.get(1).resolve().await.unwrap()), vec!["/x"]);
        let err = queue.get(1).resolve().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Queue);
    }
}
