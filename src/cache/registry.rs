//! Registry that maps tier purposes to the tiers of the running version.

use color_eyre::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::storage::TierStorage;
use super::types::{EntryKey, StoredResponse, TierPurpose};
use crate::http::Response;

/// Tier names of one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierNames {
  pub static_tier: String,
  pub dynamic_tier: String,
  pub offline_tier: String,
}

impl TierNames {
  /// Static and dynamic tiers follow the app version. The offline tier has its
  /// own version so it outlives app rollovers.
  pub fn new(prefix: &str, version: &str, offline_version: &str) -> Self {
    Self {
      static_tier: format!("{}-static-{}", prefix, version),
      dynamic_tier: format!("{}-dynamic-{}", prefix, version),
      offline_tier: format!("{}-offline-{}", prefix, offline_version),
    }
  }

  pub fn name(&self, purpose: TierPurpose) -> &str {
    match purpose {
      TierPurpose::Static => &self.static_tier,
      TierPurpose::Dynamic => &self.dynamic_tier,
      TierPurpose::OfflineSnapshot => &self.offline_tier,
    }
  }

  /// Whether `name` belongs to this version.
  pub fn is_current(&self, name: &str) -> bool {
    TierPurpose::ALL.iter().any(|p| self.name(*p) == name)
  }
}

/// Injectable handle over the tier store for one worker version.
///
/// Lookups and best-effort writes log storage failures instead of returning
/// them: a broken cache must never fail a response to the page.
pub struct TierRegistry<S: TierStorage> {
  storage: Arc<S>,
  names: TierNames,
}

impl<S: TierStorage> TierRegistry<S> {
  pub fn new(storage: S, names: TierNames) -> Self {
    Self {
      storage: Arc::new(storage),
      names,
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn name(&self, purpose: TierPurpose) -> &str {
    self.names.name(purpose)
  }

  /// Create the tier for `purpose` if missing.
  pub fn open(&self, purpose: TierPurpose) -> Result<()> {
    self.storage.open(self.name(purpose))
  }

  /// Look up `key` in the tier for `purpose`. Storage errors count as a miss.
  pub fn lookup(&self, purpose: TierPurpose, key: &EntryKey) -> Option<StoredResponse> {
    let tier = self.name(purpose);
    match self.storage.get(tier, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(tier, url = key.url(), error = %e, "tier lookup failed, treating as miss");
        None
      }
    }
  }

  /// Look up `key` in every tier. Storage errors count as a miss.
  pub fn lookup_any(&self, key: &EntryKey) -> Option<(String, StoredResponse)> {
    match self.storage.match_any(key) {
      Ok(found) => found,
      Err(e) => {
        warn!(url = key.url(), error = %e, "tier lookup failed, treating as miss");
        None
      }
    }
  }

  /// Persist a response, best-effort. Returns whether it was written.
  pub fn store(&self, purpose: TierPurpose, key: &EntryKey, response: &Response) -> bool {
    let tier = self.name(purpose);
    match self.storage.put(tier, key, response) {
      Ok(()) => {
        debug!(tier, url = key.url(), "stored response");
        true
      }
      Err(e) => {
        warn!(tier, url = key.url(), error = %e, "failed to store response, serving uncached");
        false
      }
    }
  }

  /// Write a batch into the tier for `purpose`, all or nothing.
  pub fn populate(&self, purpose: TierPurpose, entries: &[(EntryKey, Response)]) -> Result<()> {
    self.storage.put_all(self.name(purpose), entries)
  }

  /// Delete every tier that does not belong to this version.
  pub fn prune_stale(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.storage.tier_names()? {
      if self.names.is_current(&name) {
        continue;
      }
      if self.storage.delete_tier(&name)? {
        info!(tier = %name, "deleted stale tier");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Delete every tier, current ones included. Returns how many were removed.
  pub fn clear_all(&self) -> Result<usize> {
    let mut deleted = 0;
    for name in self.storage.tier_names()? {
      if self.storage.delete_tier(&name)? {
        deleted += 1;
      }
    }
    Ok(deleted)
  }

  /// Entry count for every existing tier.
  pub fn entry_counts(&self) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for name in self.storage.tier_names()? {
      let count = self.storage.entry_count(&name)?;
      counts.insert(name, count);
    }
    Ok(counts)
  }
}

impl<S: TierStorage> Clone for TierRegistry<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use url::Url;

  fn registry(version: &str) -> TierRegistry<MemoryStorage> {
    TierRegistry::new(MemoryStorage::new(), TierNames::new("skrm", version, "v1"))
  }

  fn key(path: &str) -> EntryKey {
    EntryKey::get(&Url::parse("http://app.test").unwrap().join(path).unwrap())
  }

  #[test]
  fn test_tier_names() {
    let names = TierNames::new("skrm", "v2", "v1");
    assert_eq!(names.static_tier, "skrm-static-v2");
    assert_eq!(names.dynamic_tier, "skrm-dynamic-v2");
    assert_eq!(names.offline_tier, "skrm-offline-v1");
    assert!(names.is_current("skrm-offline-v1"));
    assert!(!names.is_current("skrm-static-v1"));
    assert!(!names.is_current("skrm-v1"));
  }

  #[test]
  fn test_prune_keeps_current_tiers_only() {
    let registry = registry("v2");
    let storage = registry.storage();
    storage.open("skrm-v1").unwrap();
    storage.open("skrm-static-v1").unwrap();
    storage.open("skrm-dynamic-v1").unwrap();
    registry.open(TierPurpose::Static).unwrap();
    registry.open(TierPurpose::OfflineSnapshot).unwrap();
    registry.store(TierPurpose::Dynamic, &key("/x"), &Response::new(200, "x"));

    let mut deleted = registry.prune_stale().unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["skrm-dynamic-v1", "skrm-static-v1", "skrm-v1"]);

    let mut remaining = storage.tier_names().unwrap();
    remaining.sort();
    assert_eq!(
      remaining,
      vec!["skrm-dynamic-v2", "skrm-offline-v1", "skrm-static-v2"]
    );
  }

  #[test]
  fn test_clear_all_is_idempotent() {
    let registry = registry("v1");
    registry.open(TierPurpose::Static).unwrap();
    registry.store(TierPurpose::Dynamic, &key("/x"), &Response::new(200, "x"));

    assert_eq!(registry.clear_all().unwrap(), 2);
    assert!(registry.storage().tier_names().unwrap().is_empty());
    assert_eq!(registry.clear_all().unwrap(), 0);
    assert!(registry.storage().tier_names().unwrap().is_empty());
  }

  #[test]
  fn test_entry_counts() {
    let registry = registry("v1");
    registry.open(TierPurpose::Static).unwrap();
    for path in ["/a", "/b", "/c"] {
      registry.store(TierPurpose::OfflineSnapshot, &key(path), &Response::new(200, path));
    }

    let counts = registry.entry_counts().unwrap();
    assert_eq!(counts.get("skrm-static-v1"), Some(&0));
    assert_eq!(counts.get("skrm-offline-v1"), Some(&3));
  }
}
