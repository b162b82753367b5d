//! Routes what the spider makes of a response.
//!
//! The output of `extract` is consumed in stream order: items go to the
//! pipelines, requests are enqueued as they are, locators are resolved against
//! the response URL first. The output of `next_requests` is merged the same
//! way afterwards, then the completion hook runs. A failure at any of the three
//! steps is routed to the exception phase and the remaining steps still run.

use super::item_processor::process_item;
use super::request_handler::UnitContext;
use crate::error::{CrawlException, ErrorKind};
use crate::item::{Output, ParseOutput};
use crate::request::Request;
use crate::response::Response;
use crate::spider::Spider;
use log::{debug, trace};

pub(crate) async fn process_response<S: Spider>(ctx: &UnitContext<S>, response: Response) {
    trace!("Extracting from {}", response.url);
    match ctx.spider.extract(&response).resolve().await {
        Ok(output) => route_output(ctx, &response, output).await,
        Err(e) => {
            ctx.chain
                .process_exception(e.attach(ErrorKind::Extraction, None, Some(&response)))
                .await
        }
    }

    match ctx.spider.next_requests(&response).resolve().await {
        Ok(output) => route_output(ctx, &response, output).await,
        Err(e) => {
            ctx.chain
                .process_exception(e.attach(ErrorKind::Extraction, None, Some(&response)))
                .await
        }
    }

    if let Err(e) = ctx.spider.on_processing_done(&response).resolve().await {
        ctx.chain
            .process_exception(e.attach(ErrorKind::CompletionHook, None, Some(&response)))
            .await;
    }
}

async fn route_output<S: Spider>(ctx: &UnitContext<S>, response: &Response, output: ParseOutput<S::Item>) {
    for value in output {
        match value {
            Output::Item(item) => process_item(ctx, response, item).await,
            Output::Request(request) => enqueue(ctx, response, request).await,
            Output::Url(locator) => match response.follow(&locator) {
                Ok(request) => enqueue(ctx, response, request).await,
                Err(e) => {
                    let exception = CrawlException::new(
                        ErrorKind::Extraction,
                        anyhow::Error::new(e).context(format!("cannot follow locator '{locator}'")),
                    )
                    .with_response(response.clone());
                    ctx.chain.process_exception(exception).await;
                }
            },
        }
    }
}

async fn enqueue<S: Spider>(ctx: &UnitContext<S>, response: &Response, request: Request) {
    debug!("Following {} from {}", request.url, response.url);
    if let Err(e) = ctx.progress.enqueue(request).await {
        ctx.chain
            .process_exception(e.attach(ErrorKind::Queue, None, Some(response)))
            .await;
    }
}
