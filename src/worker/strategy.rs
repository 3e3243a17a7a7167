//! Per-classification caching strategies.
//!
//! Each strategy is a fixed fallback chain, walked top to bottom:
//!
//! | class          | primary            | fallback          | full miss                 |
//! |----------------|--------------------|-------------------|---------------------------|
//! | static asset   | STATIC tier        | network → STATIC  | network error             |
//! | image          | any tier           | network → DYNAMIC | placeholder SVG           |
//! | api data       | network → DYNAMIC  | DYNAMIC tier      | offline snapshot, then 503|
//! | dynamic other  | network → DYNAMIC  | DYNAMIC tier      | network error             |
//!
//! A static asset requested under another spelling of a manifest path
//! (`/index.html` for `/`, a cache-busting query) falls back to the entry
//! stored for the manifest path.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::classify::{normalize_path, Classification};
use super::offline;
use crate::cache::{EntryKey, Served, TierPurpose, TierRegistry, TierStorage};
use crate::http::Request;
use crate::network::Network;

pub struct StrategyEngine<S: TierStorage, N: Network> {
  tiers: TierRegistry<S>,
  network: Arc<N>,
  origin: Url,
  /// API path → offline snapshot path
  fallbacks: Arc<BTreeMap<String, String>>,
  /// Normalized manifest path → key the asset was pre-warmed under
  manifest: Arc<BTreeMap<String, EntryKey>>,
}

impl<S: TierStorage, N: Network> StrategyEngine<S, N> {
  pub fn new(
    tiers: TierRegistry<S>,
    network: Arc<N>,
    origin: Url,
    fallbacks: BTreeMap<String, String>,
    manifest: &[String],
  ) -> Self {
    let mut keys = BTreeMap::new();
    for path in manifest {
      if let Ok(url) = origin.join(path) {
        keys
          .entry(normalize_path(url.path()))
          .or_insert_with(|| EntryKey::get(&url));
      }
    }

    Self {
      tiers,
      network,
      origin,
      fallbacks: Arc::new(fallbacks),
      manifest: Arc::new(keys),
    }
  }

  /// Produce a response for an intercepted request.
  ///
  /// `Err` is only returned where the chain ends in the network failure
  /// itself (static assets and dynamic content).
  pub async fn handle(&self, class: Classification, request: &Request) -> Result<Served> {
    match class {
      Classification::StaticAsset => self.cache_first_static(request).await,
      Classification::Image => Ok(self.cache_first_image(request).await),
      Classification::ApiData => Ok(self.network_first_api(request).await),
      Classification::DynamicOther => self.network_first_dynamic(request).await,
      Classification::Skip => Err(eyre!("{} is not intercepted", request.url)),
    }
  }

  async fn cache_first_static(&self, request: &Request) -> Result<Served> {
    let key = EntryKey::from_request(request);
    let hit = self.tiers.lookup(TierPurpose::Static, &key).or_else(|| {
      let manifest_key = self
        .manifest
        .get(&normalize_path(request.url.path()))
        .filter(|manifest_key| **manifest_key != key)?;
      self.tiers.lookup(TierPurpose::Static, manifest_key)
    });
    if let Some(stored) = hit {
      return Ok(Served::from_cache(self.tiers.name(TierPurpose::Static), stored));
    }

    let response = self.network.fetch(request).await?;
    if !response.is_success() {
      return Ok(Served::from_network(response));
    }

    let (served, stored) = response.tee();
    self.tiers.store(TierPurpose::Static, &key, &stored);
    Ok(Served::from_network(served))
  }

  async fn cache_first_image(&self, request: &Request) -> Served {
    let key = EntryKey::from_request(request);
    if let Some((tier, stored)) = self.tiers.lookup_any(&key) {
      return Served::from_cache(&tier, stored);
    }

    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        let (served, stored) = response.tee();
        self.tiers.store(TierPurpose::Dynamic, &key, &stored);
        Served::from_network(served)
      }
      Ok(response) => Served::from_network(response),
      Err(e) => {
        debug!(url = %request.url, error = %e, "image unavailable, serving placeholder");
        Served::synthesized(offline::placeholder_image())
      }
    }
  }

  async fn network_first_api(&self, request: &Request) -> Served {
    let key = EntryKey::from_request(request);

    let failure = match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        let (served, stored) = response.tee();
        self.tiers.store(TierPurpose::Dynamic, &key, &stored);
        return Served::from_network(served);
      }
      Ok(response) => format!("Server answered HTTP {}", response.status()),
      Err(e) => e.to_string(),
    };
    debug!(url = %request.url, reason = %failure, "api request failed, trying caches");

    if let Some(stored) = self.tiers.lookup(TierPurpose::Dynamic, &key) {
      return Served::from_cache(self.tiers.name(TierPurpose::Dynamic), stored);
    }

    if let Some(served) = self.offline_snapshot(request) {
      return served;
    }

    Served::synthesized(offline::offline_api_response(&format!(
      "No cached data available for {} ({})",
      request.url.path(),
      failure
    )))
  }

  async fn network_first_dynamic(&self, request: &Request) -> Result<Served> {
    let key = EntryKey::from_request(request);

    match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        let (served, stored) = response.tee();
        self.tiers.store(TierPurpose::Dynamic, &key, &stored);
        Ok(Served::from_network(served))
      }
      Ok(response) => Ok(Served::from_network(response)),
      Err(e) => match self.tiers.lookup(TierPurpose::Dynamic, &key) {
        Some(stored) => Ok(Served::from_cache(
          self.tiers.name(TierPurpose::Dynamic),
          stored,
        )),
        None => Err(e),
      },
    }
  }

  /// Resolve the request path through the fallback map into the snapshot tier.
  fn offline_snapshot(&self, request: &Request) -> Option<Served> {
    let snapshot_path = self.fallbacks.get(request.url.path())?;
    let snapshot_url = self.origin.join(snapshot_path).ok()?;
    let stored = self
      .tiers
      .lookup(TierPurpose::OfflineSnapshot, &EntryKey::get(&snapshot_url))?;
    Some(Served::from_snapshot(
      self.tiers.name(TierPurpose::OfflineSnapshot),
      stored,
    ))
  }
}

impl<S: TierStorage, N: Network> Clone for StrategyEngine<S, N> {
  fn clone(&self) -> Self {
    Self {
      tiers: self.tiers.clone(),
      network: Arc::clone(&self.network),
      origin: self.origin.clone(),
      fallbacks: Arc::clone(&self.fallbacks),
      manifest: Arc::clone(&self.manifest),
    }
  }
}
