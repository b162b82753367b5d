//! # Planned Module
//!
//! A single-assignment deferred result with done-callbacks.
//!
//! ## Overview
//!
//! Every engine-facing operation (downloader fetch, middleware hook, pipeline
//! stage, spider hook, queue access) returns a [`MaybePlanned`]: either a value
//! that is already known, or a [`Planned`] that will be settled later, possibly
//! from another OS thread. The engine awaits both the same way, so identical
//! orchestration logic runs over blocking collaborators, thread pools, or tokio
//! tasks.
//!
//! A `Planned` moves through three states:
//!
//! - `Pending`: nothing assigned yet.
//! - `Finished`: a result or a [`CrawlException`] was assigned (exactly once).
//! - `Cancelled`: the producer gave up before assigning anything.
//!
//! Done-callbacks fire at most once. A callback attached after the `Planned`
//! settled runs immediately, inside the `add_done_callback` call.
//!
//! ## Adapters
//!
//! - [`Planned::spawn`]: tokio task to `Planned`.
//! - [`Planned::spawn_blocking`]: blocking closure on tokio's blocking pool to `Planned`.
//! - `impl Future for Planned`: `Planned` to awaitable.
//! - [`Planned::wait`]: blocks the calling OS thread until settled.
//! - [`gather`]: many `MaybePlanned` values into one `Planned` of all outcomes.

use crate::error::{CrawlException, ErrorKind};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Lifecycle of a [`Planned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedState {
    Pending,
    Cancelled,
    Finished,
}

type DoneCallback<T> = Box<dyn FnOnce(&Planned<T>) + Send + 'static>;

struct Slot<T> {
    state: PlannedState,
    outcome: Option<Result<T, CrawlException>>,
    callbacks: Vec<DoneCallback<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
}

/// A deferred result that is assigned once and observed through callbacks,
/// `.await`, or a blocking [`wait`](Planned::wait).
pub struct Planned<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Planned<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Planned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Planned")
            .field("state", &self.shared.slot.lock().state)
            .finish()
    }
}

impl<T: Send + 'static> Default for Planned<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Planned<T> {
    /// Creates a pending `Planned`.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    state: PlannedState::Pending,
                    outcome: None,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// Creates a `Planned` that is already finished with `value`.
    pub fn finished(value: T) -> Self {
        let planned = Self::new();
        planned.settle(Ok(value));
        planned
    }

    /// Creates a `Planned` that is already finished with `exception`.
    pub fn failed(exception: CrawlException) -> Self {
        let planned = Self::new();
        planned.settle(Err(exception));
        planned
    }

    pub fn state(&self) -> PlannedState {
        self.shared.slot.lock().state
    }

    /// Returns `true` once the `Planned` is finished or cancelled.
    pub fn is_done(&self) -> bool {
        self.state() != PlannedState::Pending
    }

    /// Returns `true` when this handle is the last one: nobody else can observe the outcome.
    pub(crate) fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }

    /// Assigns the result. Returns `false` if the `Planned` had already settled.
    pub fn set_result(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Assigns an exception. Returns `false` if the `Planned` had already settled.
    pub fn set_exception(&self, exception: CrawlException) -> bool {
        self.settle(Err(exception))
    }

    /// Assigns an outcome, firing callbacks and waking waiters.
    pub(crate) fn settle(&self, outcome: Result<T, CrawlException>) -> bool {
        let (callbacks, wakers) = {
            let mut slot = self.shared.slot.lock();
            if slot.state != PlannedState::Pending {
                return false;
            }
            slot.state = PlannedState::Finished;
            slot.outcome = Some(outcome);
            (
                std::mem::take(&mut slot.callbacks),
                std::mem::take(&mut slot.wakers),
            )
        };
        self.fire(callbacks, wakers);
        true
    }

    /// Cancels a pending `Planned`. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        let (callbacks, wakers) = {
            let mut slot = self.shared.slot.lock();
            if slot.state != PlannedState::Pending {
                return false;
            }
            slot.state = PlannedState::Cancelled;
            (
                std::mem::take(&mut slot.callbacks),
                std::mem::take(&mut slot.wakers),
            )
        };
        self.fire(callbacks, wakers);
        true
    }

    fn fire(&self, callbacks: Vec<DoneCallback<T>>, wakers: Vec<Waker>) {
        self.shared.settled.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(self);
        }
    }

    /// Registers a callback that runs once the `Planned` settles.
    ///
    /// Runs synchronously, before this call returns, if it already settled.
    /// Otherwise it runs on whichever thread settles the `Planned`.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Planned<T>) + Send + 'static,
    {
        {
            let mut slot = self.shared.slot.lock();
            if slot.state == PlannedState::Pending {
                slot.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    /// Moves the outcome out.
    ///
    /// Returns `None` while pending and once the outcome has been taken.
    pub fn take(&self) -> Option<Result<T, CrawlException>> {
        let mut slot = self.shared.slot.lock();
        match slot.state {
            PlannedState::Pending => None,
            PlannedState::Cancelled => Some(Err(CrawlException::cancelled())),
            PlannedState::Finished => slot.outcome.take(),
        }
    }

    /// Blocks the current OS thread until the `Planned` settles.
    ///
    /// Never call this from inside an async task: use `.await` instead.
    pub fn wait(self) -> Result<T, CrawlException> {
        let mut slot = self.shared.slot.lock();
        while slot.state == PlannedState::Pending {
            self.shared.settled.wait(&mut slot);
        }
        match slot.state {
            PlannedState::Cancelled => Err(CrawlException::cancelled()),
            _ => slot.outcome.take().unwrap_or_else(|| Err(consumed())),
        }
    }

    /// Runs `future` as a tokio task and settles the returned `Planned` with its output.
    ///
    /// If the task panics or is aborted, the `Planned` is cancelled.
    pub fn spawn<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<CrawlException>,
    {
        let planned = Self::new();
        let guard = CancelOnDrop(planned.clone());
        tokio::spawn(async move {
            let outcome = future.await.map_err(Into::into);
            guard.0.settle(outcome);
        });
        planned
    }

    /// Runs `work` on tokio's blocking thread pool and settles the returned `Planned`.
    pub fn spawn_blocking<F, E>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<CrawlException>,
    {
        let planned = Self::new();
        let guard = CancelOnDrop(planned.clone());
        tokio::task::spawn_blocking(move || {
            let outcome = work().map_err(Into::into);
            guard.0.settle(outcome);
        });
        planned
    }
}

impl<T: Clone + Send + 'static> Planned<T> {
    /// Returns a copy of the outcome without consuming it.
    pub fn result(&self) -> Option<Result<T, CrawlException>> {
        let slot = self.shared.slot.lock();
        match slot.state {
            PlannedState::Pending => None,
            PlannedState::Cancelled => Some(Err(CrawlException::cancelled())),
            PlannedState::Finished => slot.outcome.clone(),
        }
    }
}

impl<T: Send + 'static> Future for Planned<T> {
    type Output = Result<T, CrawlException>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        match slot.state {
            PlannedState::Pending => {
                if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    slot.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            PlannedState::Cancelled => Poll::Ready(Err(CrawlException::cancelled())),
            PlannedState::Finished => {
                Poll::Ready(slot.outcome.take().unwrap_or_else(|| Err(consumed())))
            }
        }
    }
}

fn consumed() -> CrawlException {
    CrawlException::new(
        ErrorKind::Other,
        anyhow::anyhow!("planned result was already taken"),
    )
}

/// Cancels the wrapped `Planned` if it is dropped before settling (panic or abort).
struct CancelOnDrop<T: Send + 'static>(Planned<T>);

impl<T: Send + 'static> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// The return type of every engine-facing operation: a value known now, or one planned for later.
#[derive(Debug)]
pub enum MaybePlanned<T> {
    Ready(Result<T, CrawlException>),
    Planned(Planned<T>),
}

impl<T: Send + 'static> MaybePlanned<T> {
    pub fn ready(value: T) -> Self {
        MaybePlanned::Ready(Ok(value))
    }

    pub fn fail(cause: impl Into<CrawlException>) -> Self {
        MaybePlanned::Ready(Err(cause.into()))
    }

    pub fn is_ready(&self) -> bool {
        match self {
            MaybePlanned::Ready(_) => true,
            MaybePlanned::Planned(planned) => planned.is_done(),
        }
    }

    /// Resolves to the outcome, suspending only if a `Planned` is still pending.
    pub async fn resolve(self) -> Result<T, CrawlException> {
        match self {
            MaybePlanned::Ready(outcome) => outcome,
            MaybePlanned::Planned(planned) => planned.await,
        }
    }

    /// Converts into a `Planned`, finishing it immediately for a ready value.
    pub fn into_planned(self) -> Planned<T> {
        match self {
            MaybePlanned::Ready(Ok(value)) => Planned::finished(value),
            MaybePlanned::Ready(Err(exception)) => Planned::failed(exception),
            MaybePlanned::Planned(planned) => planned,
        }
    }
}

impl<T> From<Planned<T>> for MaybePlanned<T> {
    fn from(planned: Planned<T>) -> Self {
        MaybePlanned::Planned(planned)
    }
}

impl<T> From<Result<T, CrawlException>> for MaybePlanned<T> {
    fn from(outcome: Result<T, CrawlException>) -> Self {
        MaybePlanned::Ready(outcome)
    }
}

struct Gathered<T> {
    outcomes: Vec<Option<Result<T, CrawlException>>>,
    remaining: usize,
}

/// Combines several deferred values into one `Planned` that finishes when all of them have.
///
/// Outcomes keep the input order. The outcomes of the inner `Planned`s are taken.
pub fn gather<T: Send + 'static>(
    items: Vec<MaybePlanned<T>>,
) -> Planned<Vec<Result<T, CrawlException>>> {
    let combined = Planned::new();
    let pending = items
        .iter()
        .filter(|item| matches!(item, MaybePlanned::Planned(_)))
        .count();
    let state = Arc::new(Mutex::new(Gathered {
        outcomes: Vec::with_capacity(items.len()),
        remaining: pending,
    }));

    let mut waiting = Vec::with_capacity(pending);
    {
        let mut gathered = state.lock();
        for (index, item) in items.into_iter().enumerate() {
            match item {
                MaybePlanned::Ready(outcome) => gathered.outcomes.push(Some(outcome)),
                MaybePlanned::Planned(planned) => {
                    gathered.outcomes.push(None);
                    waiting.push((index, planned));
                }
            }
        }
    }

    if waiting.is_empty() {
        let outcomes = std::mem::take(&mut state.lock().outcomes);
        let _ = combined.settle(Ok(outcomes.into_iter().flatten().collect()));
        return combined;
    }

    for (index, planned) in waiting {
        let state = Arc::clone(&state);
        let combined = combined.clone();
        planned.add_done_callback(move |done| {
            let outcome = done.take().unwrap_or_else(|| Err(consumed()));
            let finished = {
                let mut gathered = state.lock();
                gathered.outcomes[index] = Some(outcome);
                gathered.remaining -= 1;
                if gathered.remaining == 0 {
                    Some(std::mem::take(&mut gathered.outcomes))
                } else {
                    None
                }
            };
            if let Some(outcomes) = finished {
                let _ = combined.settle(Ok(outcomes.into_iter().flatten().collect()));
            }
        });
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_callback_on_finished_planned_runs_inside_attach() {
        let planned = Planned::finished(7u32);
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        planned.add_done_callback(move |p| {
            *seen_clone.lock() = p.result();
        });

        assert_eq!(seen.lock().take().map(|r| r.unwrap()), Some(7));
    }

    #[test]
    fn test_callbacks_fire_once_on_settle() {
        let planned = Planned::<u32>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            planned.add_done_callback(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert!(planned.set_result(1));
        assert!(!planned.set_result(2));
        assert!(!planned.cancel());

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(planned.state(), PlannedState::Finished);
        assert_eq!(planned.result().map(|r| r.unwrap()), Some(1));
    }

    #[test]
    fn test_cancel_reports_cancelled_exception() {
        let planned = Planned::<u32>::new();
        assert!(planned.cancel());
        assert_eq!(planned.state(), PlannedState::Cancelled);

        let err = planned.wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_wait_across_threads() {
        let planned = Planned::<String>::new();
        let producer = planned.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            assert!(producer.set_result("done".to_string()));
        });

        assert_eq!(planned.wait().unwrap(), "done");
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_await_resolves_when_settled_from_thread() {
        let planned = Planned::<u32>::new();
        let producer = planned.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            producer.set_exception(CrawlException::new(
                ErrorKind::Transport,
                anyhow::anyhow!("connection reset"),
            ));
        });

        let err = MaybePlanned::from(planned).resolve().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_spawn_adapters() {
        let from_task = Planned::spawn(async { Ok::<_, CrawlException>(2u32) });
        let from_pool = Planned::spawn_blocking(|| Err::<u32, _>(anyhow::anyhow!("pool failed")));

        assert_eq!(from_task.await.unwrap(), 2);
        assert_eq!(from_pool.await.unwrap_err().kind(), ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_spawn_panicking_task_cancels() {
        let planned: Planned<u32> = Planned::spawn(async {
            if true {
                panic!("fetch task crashed");
            }
            Ok::<_, CrawlException>(1)
        });

        assert_eq!(planned.await.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_orphaned_once_every_observer_is_gone() {
        let planned = Planned::<u32>::new();
        let observer = planned.clone();
        assert!(!planned.is_orphaned());

        drop(observer);
        assert!(planned.is_orphaned());
    }

    #[tokio::test]
    async fn test_gather_keeps_input_order() {
        let late = Planned::<u32>::new();
        let combined = gather(vec![
            MaybePlanned::ready(1),
            MaybePlanned::from(late.clone()),
            MaybePlanned::fail(anyhow::anyhow!("third failed")),
        ]);
        assert!(!combined.is_done());

        assert!(late.set_result(2));
        let outcomes = combined.await.unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(*outcomes[0].as_ref().unwrap(), 1);
        assert_eq!(*outcomes[1].as_ref().unwrap(), 2);
        assert!(outcomes[2].is_err());
    }

    #[test]
    fn test_gather_of_ready_values_finishes_immediately() {
        let combined = gather(vec![MaybePlanned::ready("a"), MaybePlanned::ready("b")]);
        assert_eq!(combined.state(), PlannedState::Finished);
    }
}
