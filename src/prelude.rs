//! A "prelude" for users of the `spider-engine` crate.
//!
//! This prelude re-exports the most commonly used traits, structs, and macros
//! so that they can be easily imported.
//!
//! # Example
//!
//! ```
//! use spider_engine::prelude::*;
//! ```

pub use crate::{
    // Core structs
    DedupMiddleware,
    Engine,
    EngineBuilder,
    // Core traits
    Downloader,
    Middleware,
    Pipeline,
    Spider,
    // Downloader adapters
    AsyncDownloader,
    AsyncFetch,
    BlockingFetch,
    ThreadPoolDownloader,
    // Values flowing through the engine
    CrawlException,
    CrawlMethod,
    ErrorKind,
    MaybePlanned,
    MiddlewareAction,
    Output,
    ParseOutput,
    Planned,
    Request,
    Response,
    SpiderError,
    // Essential re-exports for trait implementation
    async_trait,
};
