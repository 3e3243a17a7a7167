//! Request and response types that flow between the worker, the network and
//! the tier store.

use bytes::Bytes;
#[cfg(test)]
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
#[cfg(test)]
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Declared resource type of a request (what the page intends to do with it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  #[default]
  Empty,
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
}

impl Request {
  /// A plain GET for the given URL.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      destination: Destination::Empty,
    }
  }

  /// Parse an absolute URL into a GET request.
  #[cfg(test)]
  pub fn parse(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL '{}': {}", url, e))?;
    Ok(Self::get(url))
  }

  #[cfg(test)]
  pub fn with_method(mut self, method: Method) -> Self {
    self.method = method;
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }
}

/// A fully buffered response.
///
/// The body is an immutable, reference-counted buffer. Handing the same
/// response to the page and to a tier goes through [`Response::tee`], which
/// splits it into two handles over one buffer before anything reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  status: u16,
  headers: BTreeMap<String, String>,
  body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  /// Build a response from already collected parts. Header names are lowercased.
  pub fn from_parts(status: u16, headers: BTreeMap<String, String>, body: Bytes) -> Self {
    let headers = headers
      .into_iter()
      .map(|(name, value)| (name.to_ascii_lowercase(), value))
      .collect();
    Self {
      status,
      headers,
      body,
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn status(&self) -> u16 {
    self.status
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn headers(&self) -> &BTreeMap<String, String> {
    &self.headers
  }

  pub fn body(&self) -> &Bytes {
    &self.body
  }

  #[cfg(test)]
  pub fn text(&self) -> Result<&str> {
    std::str::from_utf8(&self.body).map_err(|e| eyre!("Response body is not UTF-8: {}", e))
  }

  #[cfg(test)]
  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }

  /// Split into a handle for the caller and a handle for persistence.
  pub fn tee(self) -> (Response, Response) {
    (self.clone(), self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_header_lookup_is_case_insensitive() {
    let response = Response::new(200, "ok").with_header("Content-Type", "text/plain");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.header("CONTENT-TYPE"), Some("text/plain"));
  }

  #[test]
  fn test_tee_shares_body() {
    let (served, stored) = Response::new(200, "payload").tee();
    assert_eq!(served.body(), stored.body());
    assert_eq!(served.body().as_ptr(), stored.body().as_ptr());
  }

  #[test]
  fn test_success_range() {
    assert!(Response::new(204, "").is_success());
    assert!(!Response::new(304, "").is_success());
    assert!(!Response::new(503, "").is_success());
  }
}
