//! # Engine Module
//!
//! Implements the orchestrator that drives a crawl.
//!
//! ## Overview
//!
//! The engine pulls requests off the queue and runs each one as an independent
//! unit task: request middlewares, downloader, response middlewares, spider
//! extraction, pipelines, and re-enqueueing of follow-up requests. It tracks
//! every enqueued request until its unit resolves, which is how it knows when
//! the crawl is over.
//!
//! ## Key Components
//!
//! - **Engine**: lifecycle and the pump loop
//! - **Middleware Chain**: onion-ordered request/response/exception interceptors
//! - **Request Handler**: one unit of work, with its permit and progress guard
//! - **Response Parser**: routing of extracted items and locators
//! - **Item Processor**: the pipeline chain for a single item
//!
//! ## Architecture
//!
//! The driver runs as one tokio task (or, through `run_blocking`, on a single
//! OS thread). Collaborators may settle their results from other threads; the
//! unit tasks await them through `MaybePlanned`, so the orchestration logic is
//! the same whatever the collaborators do underneath.

mod core;
mod item_processor;
mod middleware_manager;
mod request_handler;
mod response_parser;


pub use core::Engine;
