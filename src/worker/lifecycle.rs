//! Worker lifecycle: install → wait → activate → active.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::fmt;
use tracing::info;
use url::Url;

use crate::cache::{EntryKey, TierPurpose, TierRegistry, TierStorage};
use crate::http::Request;
use crate::network::Network;

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Pre-warming the static tier
  Installing,
  /// Installed, waiting for older clients to go away
  Waiting,
  /// Pruning stale tiers and claiming clients
  Activating,
  /// Intercepting fetches
  Active,
  /// Install failed; this version never becomes active
  Redundant,
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// Every manifest asset was fetched and stored
  Installed,
  /// At least one manifest asset could not be fetched
  InstallFailed,
  /// Clients released or skip-waiting requested
  Activate,
  /// Stale tiers pruned and clients claimed
  Activated,
  /// Restarting a version whose tiers are already in place
  Restored,
}

impl LifecycleState {
  /// Pure transition function.
  pub fn next(self, event: LifecycleEvent) -> Result<Self> {
    use LifecycleEvent as E;
    use LifecycleState as S;

    match (self, event) {
      (S::Installing, E::Installed) => Ok(S::Waiting),
      (S::Installing, E::InstallFailed) => Ok(S::Redundant),
      (S::Installing, E::Restored) => Ok(S::Active),
      (S::Waiting, E::Activate) => Ok(S::Activating),
      (S::Activating, E::Activated) => Ok(S::Active),
      (state, event) => Err(eyre!("Invalid lifecycle transition: {:?} in state {}", event, state)),
    }
  }

  pub fn intercepts_fetch(self) -> bool {
    self == LifecycleState::Active
  }
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LifecycleState::Installing => write!(f, "installing"),
      LifecycleState::Waiting => write!(f, "waiting"),
      LifecycleState::Activating => write!(f, "activating"),
      LifecycleState::Active => write!(f, "active"),
      LifecycleState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Whether a waiting worker may activate now.
///
/// A new version waits while pages controlled by an older worker are still
/// open, unless skip-waiting was requested.
pub fn may_activate(skip_waiting: bool, clients_on_previous_version: usize) -> bool {
  skip_waiting || clients_on_previous_version == 0
}

/// Fetch every manifest asset and write them into the static tier.
///
/// All fetches must succeed (with a 2xx status) before anything is written,
/// and the write itself is a single batch. On failure no tier is created or
/// touched. Returns the number of assets stored.
pub async fn prewarm<S: TierStorage, N: Network>(
  tiers: &TierRegistry<S>,
  network: &N,
  origin: &Url,
  manifest: &[String],
) -> Result<usize> {
  let requests = manifest
    .iter()
    .map(|path| {
      origin
        .join(path)
        .map(Request::get)
        .map_err(|e| eyre!("Invalid manifest path '{}': {}", path, e))
    })
    .collect::<Result<Vec<_>>>()?;

  let assets = try_join_all(requests.iter().map(|request| async move {
    let response = network.fetch(request).await?;
    if !response.is_success() {
      return Err(eyre!(
        "Manifest asset {} returned HTTP {}",
        request.url,
        response.status()
      ));
    }
    Ok((EntryKey::from_request(request), response))
  }))
  .await?;

  tiers.populate(TierPurpose::Static, &assets)?;
  tiers.open(TierPurpose::OfflineSnapshot)?;

  info!(
    tier = tiers.name(TierPurpose::Static),
    assets = assets.len(),
    "static tier pre-warmed"
  );
  Ok(assets.len())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, TierNames};
  use crate::http::Response;
  use crate::network::fake::FakeNetwork;

  #[test]
  fn test_happy_path_transitions() {
    let state = LifecycleState::Installing;
    let state = state.next(LifecycleEvent::Installed).unwrap();
    assert_eq!(state, LifecycleState::Waiting);
    let state = state.next(LifecycleEvent::Activate).unwrap();
    assert_eq!(state, LifecycleState::Activating);
    let state = state.next(LifecycleEvent::Activated).unwrap();
    assert_eq!(state, LifecycleState::Active);
    assert!(state.intercepts_fetch());
  }

  #[test]
  fn test_failed_install_is_terminal() {
    let state = LifecycleState::Installing
      .next(LifecycleEvent::InstallFailed)
      .unwrap();
    assert_eq!(state, LifecycleState::Redundant);
    assert!(!state.intercepts_fetch());
    assert!(state.next(LifecycleEvent::Activate).is_err());
    assert!(state.next(LifecycleEvent::Activated).is_err());
  }

  #[test]
  fn test_cannot_skip_install() {
    assert!(LifecycleState::Installing
      .next(LifecycleEvent::Activate)
      .is_err());
    assert!(LifecycleState::Waiting
      .next(LifecycleEvent::Activated)
      .is_err());
    assert!(LifecycleState::Active
      .next(LifecycleEvent::Activate)
      .is_err());
  }

  #[test]
  fn test_may_activate() {
    assert!(may_activate(false, 0));
    assert!(!may_activate(false, 2));
    assert!(may_activate(true, 2));
  }

  fn manifest() -> Vec<String> {
    vec!["/".to_string(), "/app.css".to_string(), "/app.js".to_string()]
  }

  #[tokio::test]
  async fn test_prewarm_stores_every_asset() {
    let origin = Url::parse("http://app.test").unwrap();
    let network = FakeNetwork::new()
      .route("http://app.test/", Response::new(200, "<html>"))
      .route("http://app.test/app.css", Response::new(200, "css"))
      .route("http://app.test/app.js", Response::new(200, "js"));
    let tiers = TierRegistry::new(MemoryStorage::new(), TierNames::new("skrm", "v1", "v1"));

    let stored = prewarm(&tiers, &network, &origin, &manifest())
      .await
      .unwrap();

    assert_eq!(stored, 3);
    assert_eq!(tiers.storage().entry_count("skrm-static-v1").unwrap(), 3);
    assert!(tiers
      .storage()
      .tier_names()
      .unwrap()
      .contains(&"skrm-offline-v1".to_string()));
  }

  #[tokio::test]
  async fn test_prewarm_is_all_or_nothing() {
    let origin = Url::parse("http://app.test").unwrap();
    let network = FakeNetwork::new()
      .route("http://app.test/", Response::new(200, "<html>"))
      .route("http://app.test/app.css", Response::new(200, "css"));
    let tiers = TierRegistry::new(MemoryStorage::new(), TierNames::new("skrm", "v1", "v1"));

    let result = prewarm(&tiers, &network, &origin, &manifest()).await;

    assert!(result.is_err());
    assert!(tiers.storage().tier_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_prewarm_rejects_error_status() {
    let origin = Url::parse("http://app.test").unwrap();
    let network = FakeNetwork::new()
      .route("http://app.test/", Response::new(200, "<html>"))
      .route("http://app.test/app.css", Response::new(404, "missing"))
      .route("http://app.test/app.js", Response::new(200, "js"));
    let tiers = TierRegistry::new(MemoryStorage::new(), TierNames::new("skrm", "v1", "v1"));

    let result = prewarm(&tiers, &network, &origin, &manifest()).await;

    assert!(result.is_err());
    assert_eq!(tiers.storage().entry_count("skrm-static-v1").unwrap(), 0);
  }
}
