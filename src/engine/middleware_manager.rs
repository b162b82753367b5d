//! The middleware chain wrapped around the downloader.
//!
//! Requests run through the middlewares in registration order, responses and
//! exceptions in reverse. A fault raised by any hook becomes a
//! [`CrawlException`] that enters the exception phase of this same chain; it
//! never escapes to the engine loop.

use crate::error::{CrawlException, ErrorKind};
use crate::middleware::{Middleware, MiddlewareAction};
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatCollector;
use log::{debug, error, trace, warn};
use std::sync::Arc;

pub(crate) struct MiddlewareChain {
    middlewares: Vec<Box<dyn Middleware>>,
    stats: Arc<StatCollector>,
}

impl MiddlewareChain {
    pub(crate) fn new(middlewares: Vec<Box<dyn Middleware>>, stats: Arc<StatCollector>) -> Self {
        trace!(
            "Middleware chain: [{}]",
            middlewares.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
        );
        Self { middlewares, stats }
    }

    /// Runs the request phase. `None` means the unit ends here.
    pub(crate) async fn process_request(&self, request: Request) -> Option<Request> {
        let mut current = request;

        for middleware in self.middlewares.iter() {
            let seen = current.clone();
            match middleware.on_request(current).resolve().await {
                Ok(MiddlewareAction::Continue(next)) => current = next,
                Ok(MiddlewareAction::Drop) => {
                    debug!("Request dropped by middleware '{}': {}", middleware.name(), seen.url);
                    self.stats.increment_requests_dropped();
                    return None;
                }
                Err(e) => {
                    self.process_exception(e.attach(ErrorKind::Middleware, Some(&seen), None))
                        .await;
                    return None;
                }
            }
        }

        Some(current)
    }

    /// Runs the response phase, last registered middleware first.
    pub(crate) async fn process_response(&self, response: Response) -> Option<Response> {
        let mut current = response;

        for middleware in self.middlewares.iter().rev() {
            let seen = current.clone();
            match middleware.on_response(current).resolve().await {
                Ok(MiddlewareAction::Continue(next)) => current = next,
                Ok(MiddlewareAction::Drop) => {
                    debug!("Response dropped by middleware '{}': {}", middleware.name(), seen.url);
                    self.stats.increment_responses_dropped();
                    return None;
                }
                Err(e) => {
                    self.process_exception(e.attach(
                        ErrorKind::Middleware,
                        Some(seen.request()),
                        Some(&seen),
                    ))
                    .await;
                    return None;
                }
            }
        }

        Some(current)
    }

    /// Runs the exception phase, last registered middleware first.
    ///
    /// A middleware that raises while handling an exception ends the phase; the
    /// fault is logged and swallowed.
    pub(crate) async fn process_exception(&self, exception: CrawlException) {
        self.stats.increment_exceptions_raised();
        trace!("Routing exception: {}", exception);
        let mut current = exception;

        for middleware in self.middlewares.iter().rev() {
            let seen = current.clone();
            match middleware.on_exception(current).resolve().await {
                Ok(MiddlewareAction::Continue(next)) => current = next,
                Ok(MiddlewareAction::Drop) => {
                    debug!("Exception handled by middleware '{}': {}", middleware.name(), seen);
                    self.stats.increment_exceptions_handled();
                    return;
                }
                Err(e) => {
                    warn!(
                        "Middleware '{}' failed while handling \"{}\": {}",
                        middleware.name(),
                        seen,
                        e
                    );
                    return;
                }
            }
        }

        self.stats.increment_exceptions_unhandled();
        error!("Unhandled crawl exception: {}", current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planned::MaybePlanned;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_request: bool,
        drop_response: bool,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Recorder {
                name,
                log: Arc::clone(log),
                fail_request: false,
                drop_response: false,
            }
        }
    }

    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn on_request(&self, request: Request) -> MaybePlanned<MiddlewareAction<Request>> {
            self.log.lock().push(format!("{}:request", self.name));
            if self.fail_request {
                return MaybePlanned::fail(anyhow::anyhow!("refused"));
            }
            MaybePlanned::ready(MiddlewareAction::Continue(request))
        }

        fn on_response(&self, response: Response) -> MaybePlanned<MiddlewareAction<Response>> {
            self.log.lock().push(format!("{}:response", self.name));
            if self.drop_response {
                return MaybePlanned::ready(MiddlewareAction::Drop);
            }
            MaybePlanned::ready(MiddlewareAction::Continue(response))
        }

        fn on_exception(
            &self,
            exception: CrawlException,
        ) -> MaybePlanned<MiddlewareAction<CrawlException>> {
            self.log
                .lock()
                .push(format!("{}:exception:{}", self.name, exception.kind()));
            MaybePlanned::ready(MiddlewareAction::Continue(exception))
        }
    }

    fn request() -> Request {
        Request::parse("http://site.test/page").unwrap()
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(StatCollector::new());
        let chain = MiddlewareChain::new(
            vec![Box::new(Recorder::new("outer", &log)), Box::new(Recorder::new("inner", &log))],
            stats,
        );

        let request = chain.process_request(request()).await.unwrap();
        chain
            .process_response(Response::new(request, 200, "ok"))
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["outer:request", "inner:request", "inner:response", "outer:response"]
        );
    }

    #[tokio::test]
    async fn test_request_raise_enters_exception_phase() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(StatCollector::new());
        let mut failing = Recorder::new("failing", &log);
        failing.fail_request = true;
        let chain = MiddlewareChain::new(
            vec![Box::new(Recorder::new("first", &log)), Box::new(failing)],
            Arc::clone(&stats),
        );

        assert!(chain.process_request(request()).await.is_none());
        assert_eq!(
            *log.lock(),
            vec![
                "first:request",
                "failing:request",
                "failing:exception:middleware",
                "first:exception:middleware",
            ]
        );
        assert_eq!(stats.exceptions_raised.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(stats.exceptions_unhandled.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_response_drop_stops_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut dropping = Recorder::new("dropping", &log);
        dropping.drop_response = true;
        let chain = MiddlewareChain::new(
            vec![Box::new(Recorder::new("outer", &log)), Box::new(dropping)],
            Arc::new(StatCollector::new()),
        );

        assert!(chain.process_response(Response::new(request(), 200, "")).await.is_none());
        assert_eq!(*log.lock(), vec!["dropping:response"]);
    }
}
