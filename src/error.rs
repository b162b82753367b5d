//! # Error Module
//!
//! Error types shared by the engine and its collaborators.
//!
//! Two families live here:
//!
//! - [`SpiderError`]: fatal or configuration errors returned to the embedding
//!   application by the builder and the engine entry points.
//! - [`CrawlException`]: a failure tied to a single unit of crawl work. Every
//!   fault raised by a downloader, middleware, pipeline, spider hook or queue is
//!   converted into one of these and delivered to the exception phase of the
//!   middleware chain. It never aborts a crawl.

use crate::request::Request;
use crate::response::Response;
use std::fmt;
use std::sync::Arc;

/// Errors surfaced to the caller of the engine.
#[derive(Debug, thiserror::Error)]
pub enum SpiderError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("General error: {0}")]
    GeneralError(String),
}

/// Where a [`CrawlException`] originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum ErrorKind {
    /// Raised by the downloader while fetching.
    Transport,
    /// Raised inside a middleware hook.
    Middleware,
    /// Raised inside a pipeline stage.
    Pipeline,
    /// Raised by the spider's completion hook.
    CompletionHook,
    /// Raised while extracting items or follow-up requests.
    Extraction,
    /// Raised by the work queue.
    Queue,
    /// The deferred result was cancelled before it settled.
    Cancelled,
    /// Not yet classified. The engine replaces this with the phase it was caught in.
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Middleware => "middleware",
            ErrorKind::Pipeline => "pipeline",
            ErrorKind::CompletionHook => "completion hook",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Queue => "queue",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Other => "crawl",
        };
        f.write_str(name)
    }
}

/// A failure carrying the request and response it belongs to, plus the underlying cause.
#[derive(Debug, Clone)]
pub struct CrawlException {
    kind: ErrorKind,
    request: Option<Request>,
    response: Option<Response>,
    cause: Arc<anyhow::Error>,
}

impl CrawlException {
    /// Creates an exception of the given kind with no request or response attached.
    pub fn new(kind: ErrorKind, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            request: None,
            response: None,
            cause: Arc::new(cause.into()),
        }
    }

    /// Creates a transport exception for a request the downloader failed to resolve.
    pub fn transport(request: Request, cause: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::Transport, cause).with_request(request)
    }

    /// Creates the exception reported when a deferred result is cancelled.
    pub fn cancelled() -> Self {
        Self::new(
            ErrorKind::Cancelled,
            anyhow::anyhow!("planned result was cancelled"),
        )
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_response(mut self, response: Response) -> Self {
        if self.request.is_none() {
            self.request = Some(response.request().clone());
        }
        self.response = Some(response);
        self
    }

    /// Fills in whatever context the exception is still missing.
    ///
    /// An already classified kind, request or response is never overwritten.
    pub(crate) fn attach(
        mut self,
        kind: ErrorKind,
        request: Option<&Request>,
        response: Option<&Response>,
    ) -> Self {
        if self.kind == ErrorKind::Other {
            self.kind = kind;
        }
        if self.response.is_none() {
            self.response = response.cloned();
        }
        if self.request.is_none() {
            self.request = request
                .cloned()
                .or_else(|| self.response.as_ref().map(|r| r.request().clone()));
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

impl fmt::Display for CrawlException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request {
            Some(request) => write!(f, "{} error on {}: {}", self.kind, request.url, self.cause),
            None => write!(f, "{} error: {}", self.kind, self.cause),
        }
    }
}

impl std::error::Error for CrawlException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.cause)
    }
}

impl From<anyhow::Error> for CrawlException {
    fn from(cause: anyhow::Error) -> Self {
        Self::new(ErrorKind::Other, cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn request(path: &str) -> Request {
        Request::new(Url::parse(&format!("http://site.test{path}")).unwrap())
    }

    #[test]
    fn test_attach_keeps_existing_context() {
        let original = request("/a");
        let exc = CrawlException::transport(original.clone(), anyhow::anyhow!("boom"))
            .attach(ErrorKind::Middleware, Some(&request("/b")), None);

        assert_eq!(exc.kind(), ErrorKind::Transport);
        assert_eq!(exc.request(), Some(&original));
        assert!(exc.response().is_none());
    }

    #[test]
    fn test_attach_classifies_and_derives_request_from_response() {
        let req = request("/page");
        let resp = Response::new(req.clone(), 200, "body");
        let exc = CrawlException::from(anyhow::anyhow!("bad markup")).attach(
            ErrorKind::Extraction,
            None,
            Some(&resp),
        );

        assert_eq!(exc.kind(), ErrorKind::Extraction);
        assert_eq!(exc.request(), Some(&req));
        assert_eq!(exc.response().map(|r| r.status), Some(200));
        assert_eq!(
            exc.to_string(),
            "extraction error on http://site.test/page: bad markup"
        );
    }
}
