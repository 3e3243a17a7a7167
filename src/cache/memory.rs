use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::storage::TierStorage;
use super::types::{EntryKey, StoredResponse};
use crate::http::Response;

/// In-memory tier storage for tests.
#[derive(Default)]
pub struct MemoryStorage {
  tiers: Mutex<Vec<(String, HashMap<String, StoredResponse>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_tiers<R>(
    &self,
    f: impl FnOnce(&mut Vec<(String, HashMap<String, StoredResponse>)>) -> R,
  ) -> Result<R> {
    let mut tiers = self
      .tiers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut tiers))
  }
}

fn tier_entries<'a>(
  tiers: &'a mut Vec<(String, HashMap<String, StoredResponse>)>,
  tier: &str,
) -> &'a mut HashMap<String, StoredResponse> {
  let index = match tiers.iter().position(|(name, _)| name == tier) {
    Some(index) => index,
    None => {
      tiers.push((tier.to_string(), HashMap::new()));
      tiers.len() - 1
    }
  };
  &mut tiers[index].1
}

impl TierStorage for MemoryStorage {
  fn open(&self, tier: &str) -> Result<()> {
    self.with_tiers(|tiers| {
      tier_entries(tiers, tier);
    })
  }

  fn tier_names(&self) -> Result<Vec<String>> {
    self.with_tiers(|tiers| tiers.iter().map(|(name, _)| name.clone()).collect())
  }

  fn delete_tier(&self, tier: &str) -> Result<bool> {
    self.with_tiers(|tiers| {
      let before = tiers.len();
      tiers.retain(|(name, _)| name != tier);
      tiers.len() != before
    })
  }

  fn get(&self, tier: &str, key: &EntryKey) -> Result<Option<StoredResponse>> {
    self.with_tiers(|tiers| {
      tiers
        .iter()
        .find(|(name, _)| name == tier)
        .and_then(|(_, entries)| entries.get(&key.hash()).cloned())
    })
  }

  fn put(&self, tier: &str, key: &EntryKey, response: &Response) -> Result<()> {
    self.with_tiers(|tiers| {
      tier_entries(tiers, tier).insert(
        key.hash(),
        StoredResponse {
          response: response.clone(),
          captured_at: Utc::now(),
        },
      );
    })
  }

  fn put_all(&self, tier: &str, entries: &[(EntryKey, Response)]) -> Result<()> {
    self.with_tiers(|tiers| {
      let now = Utc::now();
      let target = tier_entries(tiers, tier);
      for (key, response) in entries {
        target.insert(
          key.hash(),
          StoredResponse {
            response: response.clone(),
            captured_at: now,
          },
        );
      }
    })
  }

  fn entry_count(&self, tier: &str) -> Result<usize> {
    self.with_tiers(|tiers| {
      tiers
        .iter()
        .find(|(name, _)| name == tier)
        .map(|(_, entries)| entries.len())
        .unwrap_or(0)
    })
  }
}
