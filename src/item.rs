//! Spider output: scraped items and locators to follow, in the order they were produced.
//!
//! The extraction stream is a sequence of [`Output`] values. Routing is a plain
//! match on the variant: items go through the pipeline chain, requests and
//! locators go back to the queue.

use crate::request::Request;

/// One element of a spider's output stream.
#[derive(Debug)]
pub enum Output<I> {
    /// Structured data for the pipeline chain.
    Item(I),
    /// A fully built request to enqueue as is.
    Request(Request),
    /// A locator, resolved against the URL of the response it was found in.
    Url(String),
}

impl<I> From<Request> for Output<I> {
    fn from(request: Request) -> Self {
        Output::Request(request)
    }
}

/// A possibly lazy stream of [`Output`] values.
///
/// Values added with the `add_*` methods are yielded first, followed by the
/// lazy tail set through [`ParseOutput::lazy`] or [`ParseOutput::chain`].
pub struct ParseOutput<I> {
    buffered: Vec<Output<I>>,
    tail: Option<Box<dyn Iterator<Item = Output<I>> + Send>>,
}

impl<I: Send + 'static> ParseOutput<I> {
    pub fn new() -> Self {
        ParseOutput {
            buffered: Vec::new(),
            tail: None,
        }
    }

    /// Wraps an iterator that is only advanced while the engine routes its values.
    pub fn lazy<It>(iter: It) -> Self
    where
        It: IntoIterator<Item = Output<I>>,
        It::IntoIter: Send + 'static,
    {
        ParseOutput {
            buffered: Vec::new(),
            tail: Some(Box::new(iter.into_iter())),
        }
    }

    /// Appends a lazy iterator after everything already in this output.
    pub fn chain<It>(mut self, iter: It) -> Self
    where
        It: IntoIterator<Item = Output<I>>,
        It::IntoIter: Send + 'static,
    {
        let next: Box<dyn Iterator<Item = Output<I>> + Send> = Box::new(iter.into_iter());
        self.tail = Some(match self.tail.take() {
            Some(tail) => Box::new(tail.chain(next)),
            None => next,
        });
        self
    }

    pub fn add_item(&mut self, item: I) {
        self.push(Output::Item(item));
    }

    pub fn add_request(&mut self, request: Request) {
        self.push(Output::Request(request));
    }

    pub fn add_url(&mut self, locator: impl Into<String>) {
        self.push(Output::Url(locator.into()));
    }

    fn push(&mut self, output: Output<I>) {
        match self.tail.take() {
            // Keep stream order when values are added after a lazy tail.
            Some(tail) => {
                self.tail = Some(Box::new(tail.chain(std::iter::once(output))));
            }
            None => self.buffered.push(output),
        }
    }
}

impl<I: Send + 'static> Default for ParseOutput<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Send + 'static> IntoIterator for ParseOutput<I> {
    type Item = Output<I>;
    type IntoIter = Box<dyn Iterator<Item = Output<I>> + Send>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.buffered.into_iter().chain(self.tail.into_iter().flatten()))
    }
}

impl<I: Send + 'static> FromIterator<Output<I>> for ParseOutput<I> {
    fn from_iter<T: IntoIterator<Item = Output<I>>>(iter: T) -> Self {
        ParseOutput {
            buffered: iter.into_iter().collect(),
            tail: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn describe(output: Output<u32>) -> String {
        match output {
            Output::Item(n) => format!("item:{n}"),
            Output::Request(r) => format!("request:{}", r.url.path()),
            Output::Url(u) => format!("url:{u}"),
        }
    }

    #[test]
    fn test_stream_order_is_preserved() {
        let mut output = ParseOutput::new();
        output.add_item(1);
        output.add_url("/next");
        let mut output = output.chain((2..4).map(Output::Item));
        output.add_request(Request::parse("http://site.test/last").unwrap());

        let seen: Vec<String> = output.into_iter().map(describe).collect();
        assert_eq!(
            seen,
            vec!["item:1", "url:/next", "item:2", "item:3", "request:/last"]
        );
    }

    #[test]
    fn test_lazy_tail_is_not_advanced_early() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let output: ParseOutput<usize> = ParseOutput::lazy((0..3).map(move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            Output::Item(n)
        }));

        let mut stream = output.into_iter();
        assert_eq!(produced.load(Ordering::SeqCst), 0);
        assert!(matches!(stream.next(), Some(Output::Item(0))));
        assert_eq!(produced.load(Ordering::SeqCst), 1);
    }
}
