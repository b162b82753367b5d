//! The unit of crawl work.
//!
//! A [`Request`] carries the locator to fetch plus free-form metadata that
//! middlewares and spiders can use to pass state along the chain. Requests are
//! created from a spider's entry points or by following locators found in a
//! response, and are dropped once their processing chain resolves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// The locator to fetch.
    pub url: Url,
    /// Number of hops from an entry request.
    pub depth: usize,
    /// Arbitrary metadata shared between middlewares and the spider.
    #[serde(default)]
    pub meta: HashMap<String, Value>,
}

impl Request {
    pub fn new(url: Url) -> Self {
        Request {
            url,
            depth: 0,
            meta: HashMap::new(),
        }
    }

    /// Parses an absolute locator into a request.
    pub fn parse(locator: &str) -> Result<Self, url::ParseError> {
        Url::parse(locator).map(Request::new)
    }

    /// Creates a child request one hop deeper than this one.
    pub fn follow(&self, url: Url) -> Self {
        Request {
            url,
            depth: self.depth + 1,
            meta: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn get_meta(&self, key: &str) -> Option<&Value> {
        self.meta.get(key)
    }

    /// A stable identity for revisit detection: the locator without its fragment.
    pub fn fingerprint(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Request {}>", self.url)
    }
}
