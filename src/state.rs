//! Operational state of the engine.
//!
//! This module holds the lifecycle state machine and the progress counter used
//! for termination detection:
//! - [`EngineState`] moves strictly forward through
//!   `Preparing -> Running -> Draining -> Stopped`.
//! - [`ProgressCounter`] counts requests that entered the queue and have not
//!   finished their unit yet.
//! - [`CrawlProgress`] ties the counter to the queue. Every enqueue is counted
//!   before the queue accepts it, and when an internal queue's counter drops to
//!   zero a single Stop command is put on it.

use crate::error::CrawlException;
use crate::planned::MaybePlanned;
use crate::queue::{Command, Queue, QueueEntry};
use crate::request::Request;
use crate::stats::StatCollector;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

/// Lifecycle phase of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Preparing,
    Running,
    Draining,
    Stopped,
}

impl EngineState {
    /// Only forward moves are allowed, one phase at a time.
    pub fn can_transition_to(self, next: EngineState) -> bool {
        matches!(
            (self, next),
            (EngineState::Preparing, EngineState::Running)
                | (EngineState::Running, EngineState::Draining)
                | (EngineState::Draining, EngineState::Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == EngineState::Stopped
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Preparing => "PREPARING",
            EngineState::Running => "RUNNING",
            EngineState::Draining => "DRAINING",
            EngineState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Publishes the current [`EngineState`] to any number of observers.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    tx: watch::Sender<EngineState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(EngineState::Preparing);
        Lifecycle { tx }
    }

    pub(crate) fn current(&self) -> EngineState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.tx.subscribe()
    }

    /// Moves to `next`. Returns `false` and leaves the state alone for an invalid move.
    pub(crate) fn advance(&self, next: EngineState) -> bool {
        let moved = self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            info!("Engine entered {}", next);
        } else {
            error!("Refused engine transition {} -> {}", self.current(), next);
        }
        moved
    }
}

/// Count of entered-but-not-completed requests.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    value: AtomicUsize,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    pub fn increment(&self) -> usize {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements without going below zero and returns the new value.
    pub fn decrement(&self) -> usize {
        let previous = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Enqueue bookkeeping shared by the engine and every in-flight unit.
pub(crate) struct CrawlProgress {
    counter: ProgressCounter,
    queue: Arc<dyn Queue>,
    auto_stop: bool,
    stop_sent: AtomicBool,
    stats: Arc<StatCollector>,
}

impl CrawlProgress {
    pub(crate) fn new(queue: Arc<dyn Queue>, auto_stop: bool, stats: Arc<StatCollector>) -> Self {
        CrawlProgress {
            counter: ProgressCounter::new(),
            queue,
            auto_stop,
            stop_sent: AtomicBool::new(false),
            stats,
        }
    }

    pub(crate) fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub(crate) fn pending(&self) -> usize {
        self.counter.get()
    }

    /// Counts `request` and puts it on the queue. The count is rolled back if the put fails.
    pub(crate) async fn enqueue(&self, request: Request) -> Result<(), CrawlException> {
        let url = request.url.clone();
        let pending = self.counter.increment();
        trace!("Enqueueing {} ({} pending)", url, pending);
        match self.queue.put(vec![QueueEntry::Request(request)]).resolve().await {
            Ok(()) => {
                self.stats.increment_requests_enqueued();
                Ok(())
            }
            Err(e) => {
                self.counter.decrement();
                Err(e)
            }
        }
    }

    /// Marks one unit as fully resolved.
    pub(crate) fn complete(&self) {
        let remaining = self.counter.decrement();
        trace!("Unit completed ({} pending)", remaining);
        if remaining == 0 && self.auto_stop {
            self.signal_stop();
        }
    }

    /// Puts the Stop command on the queue, at most once per crawl.
    pub(crate) fn signal_stop(&self) {
        if self.stop_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("No work left, sending stop command");
        match self.queue.put(vec![QueueEntry::Command(Command::Stop)]) {
            MaybePlanned::Ready(Ok(())) => {}
            MaybePlanned::Ready(Err(e)) => error!("Failed to enqueue stop command: {}", e),
            MaybePlanned::Planned(planned) => planned.add_done_callback(|done| {
                if let Some(Err(e)) = done.take() {
                    error!("Failed to enqueue stop command: {}", e);
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Delivery, MemoryQueue};

    #[test]
    fn test_transitions_only_move_forward() {
        use EngineState::*;
        assert!(Preparing.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Preparing));
        assert!(!Preparing.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Preparing));
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn test_lifecycle_publishes_valid_moves() {
        let lifecycle = Lifecycle::new();
        let rx = lifecycle.subscribe();

        assert!(lifecycle.advance(EngineState::Running));
        assert!(!lifecycle.advance(EngineState::Stopped));
        assert_eq!(*rx.borrow(), EngineState::Running);
    }

    #[test]
    fn test_counter_saturates_at_zero() {
        let counter = ProgressCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.decrement(), 0);
    }

    #[tokio::test]
    async fn test_stop_sent_once_when_counter_drains() {
        let queue = Arc::new(MemoryQueue::fifo());
        let progress = CrawlProgress::new(queue.clone(), true, Arc::new(StatCollector::new()));

        progress.enqueue(Request::parse("http://site.test/a").unwrap()).await.unwrap();
        progress.enqueue(Request::parse("http://site.test/b").unwrap()).await.unwrap();
        assert_eq!(progress.pending(), 2);

        progress.complete();
        assert_eq!(queue.len(), 2);
        progress.complete();
        progress.signal_stop();

        // two requests plus exactly one stop command
        assert_eq!(queue.len(), 3);
        let mut commands = 0;
        while !queue.is_empty() {
            if let Delivery::Command(Command::Stop) = queue.get(1).resolve().await.unwrap() {
                commands += 1;
            }
        }
        assert_eq!(commands, 1);
    }

    #[tokio::test]
    async fn test_external_queue_is_never_auto_stopped() {
        let queue = Arc::new(MemoryQueue::lifo());
        let progress = CrawlProgress::new(queue.clone(), false, Arc::new(StatCollector::new()));

        progress.enqueue(Request::parse("http://site.test/a").unwrap()).await.unwrap();
        progress.complete();
        assert_eq!(queue.len(), 1);
    }
}
