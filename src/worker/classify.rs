//! Request classification.

use reqwest::Method;
use std::collections::BTreeSet;
use url::Origin;

use crate::config::Config;
use crate::http::{Destination, Request};

/// Which caching strategy a request gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
  /// Not intercepted: mutating or cross-origin
  Skip,
  StaticAsset,
  Image,
  ApiData,
  DynamicOther,
}

/// Maps requests to a [`Classification`]. Pure and total.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  api_prefixes: Vec<String>,
  data_hosts: Vec<String>,
  image_markers: Vec<String>,
  manifest: BTreeSet<String>,
}

impl Classifier {
  pub fn new(config: &Config) -> Self {
    Self {
      origin: config.origin.origin(),
      api_prefixes: config.api_prefixes.clone(),
      data_hosts: config.data_hosts.clone(),
      image_markers: config.image_markers.clone(),
      manifest: config.manifest.iter().map(|p| normalize_path(p)).collect(),
    }
  }

  pub fn classify(&self, request: &Request) -> Classification {
    if request.method != Method::GET || request.url.origin() != self.origin {
      return Classification::Skip;
    }

    let path = request.url.path();

    if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str()))
      || self
        .data_hosts
        .iter()
        .any(|host| request.url.as_str().contains(host.as_str()))
    {
      return Classification::ApiData;
    }

    if request.destination == Destination::Image
      || self.image_markers.iter().any(|m| path.contains(m.as_str()))
    {
      return Classification::Image;
    }

    if self.manifest.contains(&normalize_path(path)) {
      return Classification::StaticAsset;
    }

    Classification::DynamicOther
  }
}

/// Normalize a path for manifest comparison: `/index.html` and a trailing
/// slash both collapse onto the directory path.
pub fn normalize_path(path: &str) -> String {
  let path = path.strip_suffix("/index.html").unwrap_or(path);
  let path = path.trim_end_matches('/');
  if path.is_empty() {
    "/".to_string()
  } else {
    path.to_string()
  }
}
