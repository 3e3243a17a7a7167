//! Core types for the tier store.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::http::{Request, Response};

/// What a tier is for. Each purpose has its own retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierPurpose {
  /// Build-time asset manifest, populated at install
  Static,
  /// Responses captured lazily during normal operation
  Dynamic,
  /// Explicitly primed data that survives version rollover
  OfflineSnapshot,
}

impl TierPurpose {
  pub const ALL: [TierPurpose; 3] = [
    TierPurpose::Static,
    TierPurpose::Dynamic,
    TierPurpose::OfflineSnapshot,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      TierPurpose::Static => "static",
      TierPurpose::Dynamic => "dynamic",
      TierPurpose::OfflineSnapshot => "offline",
    }
  }
}

impl fmt::Display for TierPurpose {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identity of a tier entry: request method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
  method: String,
  url: String,
}

impl EntryKey {
  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method.as_str(), &request.url)
  }

  /// Key for a GET of `url`.
  pub fn get(url: &url::Url) -> Self {
    Self::new("GET", url)
  }

  fn new(method: &str, url: &url::Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      url: url.to_string(),
    }
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// Stable, fixed-length storage key.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response as persisted in a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub response: Response,
  /// When the response was written into the tier
  pub captured_at: DateTime<Utc>,
}

/// Where a served response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// A tier hit during the primary or fallback step
  Cache { tier: String },
  /// Served through the offline fallback map
  OfflineSnapshot { tier: String },
  /// Generated locally because nothing else was available
  Synthesized,
}

impl fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ResponseSource::Network => write!(f, "network"),
      ResponseSource::Cache { tier } => write!(f, "cache ({})", tier),
      ResponseSource::OfflineSnapshot { tier } => write!(f, "offline snapshot ({})", tier),
      ResponseSource::Synthesized => write!(f, "synthesized"),
    }
  }
}

/// A response handed back to the page, with metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the data was cached (if from a tier)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(tier: &str, stored: StoredResponse) -> Self {
    Self {
      response: stored.response,
      source: ResponseSource::Cache {
        tier: tier.to_string(),
      },
      cached_at: Some(stored.captured_at),
    }
  }

  pub fn from_snapshot(tier: &str, stored: StoredResponse) -> Self {
    Self {
      response: stored.response,
      source: ResponseSource::OfflineSnapshot {
        tier: tier.to_string(),
      },
      cached_at: Some(stored.captured_at),
    }
  }

  pub fn synthesized(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthesized,
      cached_at: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;

  #[test]
  fn test_entry_key_ignores_fragment() {
    let a = EntryKey::from_request(&Request::parse("http://app.test/page#top").unwrap());
    let b = EntryKey::from_request(&Request::parse("http://app.test/page").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
  }

  #[test]
  fn test_entry_key_distinguishes_method() {
    let get = Request::parse("http://app.test/api/orders").unwrap();
    let head = get.clone().with_method(Method::HEAD);
    assert_ne!(
      EntryKey::from_request(&get).hash(),
      EntryKey::from_request(&head).hash()
    );
  }

  #[test]
  fn test_hash_is_hex_sha256() {
    let key = EntryKey::get(&url::Url::parse("http://app.test/").unwrap());
    let hash = key.hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
