//! Control messages exchanged with foreground pages.
//!
//! Wire format: `{ "action": "...", "data": ... }`. Every command is
//! fire-and-forget except `getCacheStatus`, whose answer goes back over the
//! reply channel attached to that one message.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{EntryKey, TierPurpose, TierRegistry, TierStorage};
use crate::http::{Request, Response};
use crate::network::Network;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "camelCase")]
pub enum ControlMessage {
  SkipWaiting,
  ClearAllCaches,
  CacheProductData(Value),
  CacheCustomerData(Value),
  GetCacheStatus,
}

impl ControlMessage {
  pub fn parse(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Malformed control message: {}", e))
  }
}

/// A control message plus the reply channel it arrived with.
#[derive(Debug)]
pub struct Envelope {
  pub message: ControlMessage,
  pub reply: Option<oneshot::Sender<CacheStatus>>,
}

#[cfg(test)]
impl Envelope {
  pub fn new(message: ControlMessage) -> Self {
    Self {
      message,
      reply: None,
    }
  }

  pub fn with_reply(message: ControlMessage, reply: oneshot::Sender<CacheStatus>) -> Self {
    Self {
      message,
      reply: Some(reply),
    }
  }
}

/// Answer to `getCacheStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
  /// Tier name → entry count
  pub caches: BTreeMap<String, usize>,
  pub total_caches: usize,
  /// Milliseconds since the Unix epoch
  pub timestamp: i64,
}

impl CacheStatus {
  pub fn collect<S: TierStorage>(tiers: &TierRegistry<S>) -> Result<Self> {
    let caches = tiers.entry_counts()?;
    Ok(Self {
      total_caches: caches.len(),
      caches,
      timestamp: Utc::now().timestamp_millis(),
    })
  }
}

/// Which feature screen a snapshot serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
  Products,
  Customers,
}

impl SnapshotKind {
  /// Fixed logical path the snapshot is stored under.
  pub fn snapshot_path(self) -> &'static str {
    match self {
      SnapshotKind::Products => "/offline/products.json",
      SnapshotKind::Customers => "/offline/customers.json",
    }
  }
}

/// Outcome of priming one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeReport {
  pub snapshot_url: String,
  pub images_cached: usize,
  pub images_failed: usize,
  /// Cross-origin images left to the browser
  pub images_skipped: usize,
}

/// Store `payload` as the snapshot for `kind`, then cache the images it
/// references. Only same-origin images are cached. Image failures are
/// logged and counted, never returned.
pub async fn prime_snapshot<S: TierStorage, N: Network>(
  tiers: &TierRegistry<S>,
  network: &N,
  origin: &Url,
  kind: SnapshotKind,
  payload: &Value,
) -> Result<PrimeReport> {
  if !(payload.is_array() || payload.is_object()) {
    return Err(eyre!(
      "Snapshot payload for {:?} must be a JSON array or object",
      kind
    ));
  }

  let snapshot_url = origin
    .join(kind.snapshot_path())
    .map_err(|e| eyre!("Invalid snapshot path: {}", e))?;
  let body =
    serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;
  let snapshot = Response::new(200, body)
    .with_header("content-type", "application/json")
    .with_header("x-snapshot-captured-at", Utc::now().to_rfc3339());

  tiers
    .storage()
    .put(
      tiers.name(TierPurpose::OfflineSnapshot),
      &EntryKey::get(&snapshot_url),
      &snapshot,
    )
    .map_err(|e| eyre!("Failed to store {} snapshot: {}", snapshot_url, e))?;

  let mut images_skipped = 0;
  let images: Vec<Url> = image_urls(payload)
    .into_iter()
    .filter_map(|raw| match origin.join(&raw) {
      Ok(url) if url.origin() == origin.origin() => Some(url),
      Ok(url) => {
        debug!(%url, "skipping cross-origin image");
        images_skipped += 1;
        None
      }
      Err(e) => {
        warn!(url = %raw, error = %e, "skipping unparseable image url");
        None
      }
    })
    .collect();

  let results = join_all(images.into_iter().map(|url| async move {
    let request = Request::get(url);
    match network.fetch(&request).await {
      Ok(response) if response.is_success() => {
        tiers.store(
          TierPurpose::OfflineSnapshot,
          &EntryKey::from_request(&request),
          &response,
        )
      }
      Ok(response) => {
        warn!(url = %request.url, status = response.status(), "image not cached");
        false
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "image not cached");
        false
      }
    }
  }))
  .await;

  let images_cached = results.iter().filter(|ok| **ok).count();
  let report = PrimeReport {
    snapshot_url: snapshot_url.to_string(),
    images_cached,
    images_failed: results.len() - images_cached,
    images_skipped,
  };
  info!(
    snapshot = %report.snapshot_url,
    images_cached = report.images_cached,
    images_failed = report.images_failed,
    images_skipped = report.images_skipped,
    "offline snapshot primed"
  );
  Ok(report)
}

/// Image URLs referenced by snapshot entries (`image_url` or `imageUrl`),
/// deduplicated, in first-seen order.
pub fn image_urls(payload: &Value) -> Vec<String> {
  let entries: Vec<&Value> = match payload {
    Value::Array(items) => items.iter().collect(),
    Value::Object(_) => vec![payload],
    _ => Vec::new(),
  };

  let mut seen = BTreeSet::new();
  entries
    .into_iter()
    .filter_map(|entry| {
      entry
        .get("image_url")
        .or_else(|| entry.get("imageUrl"))
        .and_then(Value::as_str)
    })
    .map(str::trim)
    .filter(|url| !url.is_empty())
    .filter(|url| seen.insert(url.to_string()))
    .map(String::from)
    .collect()
}
