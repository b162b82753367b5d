//! The result of resolving a [`Request`].

use crate::request::Request;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Clone)]
pub struct Response {
    /// The final locator, which may differ from the request's after redirects.
    pub url: Url,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    request: Request,
}

impl Response {
    pub fn new(request: Request, status: u16, body: impl Into<Bytes>) -> Self {
        Response {
            url: request.url.clone(),
            status,
            headers: HashMap::new(),
            body: body.into(),
            request,
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// The request this response resolves.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Resolves a possibly relative locator against this response's URL into a child request.
    pub fn follow(&self, locator: &str) -> Result<Request, url::ParseError> {
        let url = self.url.join(locator)?;
        Ok(self.request.follow(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_follow_resolves_relative_locators() {
        let response = Response::new(Request::parse("http://site.test/root/").unwrap(), 200, "");

        let absolute = response.follow("/other").unwrap();
        let relative = response.follow("0").unwrap();

        assert_eq!(absolute.url.as_str(), "http://site.test/other");
        assert_eq!(relative.url.as_str(), "http://site.test/root/0");
        assert_eq!(relative.depth, 1);
    }

    #[test]
    fn test_json_body() {
        let response = Response::new(
            Request::parse("http://site.test/api").unwrap(),
            200,
            r#"{"links": ["/a", "/b"]}"#,
        );
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["links"][1], "/b");
        assert_eq!(response.request().url, response.url);
    }
}
