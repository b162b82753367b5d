//! # Middleware Module
//!
//! Interceptors wrapped around the downloader.
//!
//! A middleware sees every request before it is fetched and every response or
//! exception afterwards. Returning [`MiddlewareAction::Drop`] from any hook ends
//! processing of that unit: a dropped request is never fetched, a dropped
//! response never reaches the spider. Raising (returning a failed
//! [`MaybePlanned`]) turns the fault into a [`CrawlException`] that is sent
//! through the exception hooks of the same chain.
//!
//! Requests traverse middlewares in registration order; responses and
//! exceptions traverse them in reverse, so the last registered middleware is the
//! first to see what comes back.

use crate::error::CrawlException;
use crate::planned::MaybePlanned;
use crate::request::Request;
use crate::response::Response;
use dashmap::DashSet;
use log::{debug, trace};

/// What a middleware hook decided for the value it was handed.
#[derive(Debug)]
pub enum MiddlewareAction<T> {
    /// Pass the (possibly modified) value on to the next middleware.
    Continue(T),
    /// Stop processing this unit.
    Drop,
}

impl<T> From<Option<T>> for MiddlewareAction<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => MiddlewareAction::Continue(value),
            None => MiddlewareAction::Drop,
        }
    }
}

/// Request/response/exception interceptor. Every hook defaults to passing its value through.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_request(&self, request: Request) -> MaybePlanned<MiddlewareAction<Request>> {
        MaybePlanned::ready(MiddlewareAction::Continue(request))
    }

    fn on_response(&self, response: Response) -> MaybePlanned<MiddlewareAction<Response>> {
        MaybePlanned::ready(MiddlewareAction::Continue(response))
    }

    fn on_exception(
        &self,
        exception: CrawlException,
    ) -> MaybePlanned<MiddlewareAction<CrawlException>> {
        MaybePlanned::ready(MiddlewareAction::Continue(exception))
    }
}

/// Drops requests whose fingerprint has already been dispatched.
///
/// Register it to crawl site graphs that link back to pages already visited.
#[derive(Debug, Default)]
pub struct DedupMiddleware {
    seen: DashSet<String>,
}

impl DedupMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

impl Middleware for DedupMiddleware {
    fn name(&self) -> &str {
        "DedupMiddleware"
    }

    fn on_request(&self, request: Request) -> MaybePlanned<MiddlewareAction<Request>> {
        let fingerprint = request.fingerprint();
        if self.seen.insert(fingerprint) {
            trace!("First visit to {}", request.url);
            MaybePlanned::ready(MiddlewareAction::Continue(request))
        } else {
            debug!("Dropping revisit of {}", request.url);
            MaybePlanned::ready(MiddlewareAction::Drop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dedup_drops_second_visit() {
        let dedup = DedupMiddleware::new();
        let first = dedup
            .on_request(Request::parse("http://site.test/a#x").unwrap())
            .resolve()
            .await
            .unwrap();
        let second = dedup
            .on_request(Request::parse("http://site.test/a").unwrap())
            .resolve()
            .await
            .unwrap();

        assert!(matches!(first, MiddlewareAction::Continue(_)));
        assert!(matches!(second, MiddlewareAction::Drop));
        assert_eq!(dedup.seen_count(), 1);
    }

    #[test]
    fn test_action_from_option() {
        assert!(matches!(MiddlewareAction::from(Some(1)), MiddlewareAction::Continue(1)));
        assert!(matches!(MiddlewareAction::<u8>::from(None), MiddlewareAction::Drop));
    }
}
