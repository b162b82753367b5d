//! # Pipeline Module
//!
//! Item consumers. Every scraped item runs through the registered pipelines in
//! registration order; a stage returning `None` halts processing of that item.
//! `start` is called while the engine prepares and `stop` once it has drained.

use crate::planned::MaybePlanned;
use crate::spider::Spider;

pub trait Pipeline<S: Spider>: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Opens whatever the pipeline writes to.
    fn start(&self, _spider: &S) -> MaybePlanned<()> {
        MaybePlanned::ready(())
    }

    /// Filters, transforms or stores an item. `None` stops later stages from seeing it.
    fn process(&self, spider: &S, item: S::Item) -> MaybePlanned<Option<S::Item>>;

    /// Flushes and closes whatever `start` opened.
    fn stop(&self, _spider: &S) -> MaybePlanned<()> {
        MaybePlanned::ready(())
    }
}
