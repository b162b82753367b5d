//! Runs scraped items through the pipelines.
//!
//! Stages run in registration order. A stage that returns `None` drops the
//! item; a stage that fails routes a pipeline exception to the middleware
//! chain. Either way the later stages never see the item.

use super::request_handler::UnitContext;
use crate::error::ErrorKind;
use crate::response::Response;
use crate::spider::Spider;
use log::{debug, trace};

pub(crate) async fn process_item<S: Spider>(ctx: &UnitContext<S>, response: &Response, item: S::Item) {
    ctx.stats.increment_items_scraped();
    let mut current = item;

    for (idx, pipeline) in ctx.pipelines.iter().enumerate() {
        trace!(
            "Processing item through pipeline '{}' ({} of {})",
            pipeline.name(),
            idx + 1,
            ctx.pipelines.len()
        );
        match pipeline.process(&ctx.spider, current).resolve().await {
            Ok(Some(next)) => current = next,
            Ok(None) => {
                debug!("Item dropped by pipeline '{}'", pipeline.name());
                ctx.stats.increment_items_dropped_by_pipeline();
                return;
            }
            Err(e) => {
                ctx.chain
                    .process_exception(e.attach(ErrorKind::Pipeline, None, Some(response)))
                    .await;
                return;
            }
        }
    }

    trace!("Item passed all {} pipelines", ctx.pipelines.len());
    ctx.stats.increment_items_processed();
}
