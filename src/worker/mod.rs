//! The offline caching worker.
//!
//! [`Worker`] owns one version's tier registry, network and lifecycle state.
//! It is cheap to clone; clones share all state, so concurrent fetch handlers
//! each get their own handle.

pub mod classify;
pub mod clients;
pub mod control;
pub mod lifecycle;
pub mod offline;
pub mod strategy;
pub mod sync;

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::cache::{Served, TierNames, TierPurpose, TierRegistry, TierStorage};
use crate::config::Config;
use crate::http::Request;
use crate::network::Network;

use classify::{Classification, Classifier};
use clients::{ClientNotice, Clients};
use control::{prime_snapshot, CacheStatus, ControlMessage, Envelope, SnapshotKind};
use lifecycle::{LifecycleEvent, LifecycleState};
use strategy::StrategyEngine;
use sync::SyncQueue;

/// Result of intercepting a fetch.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not intercepted; the page goes to the network directly
  Skipped,
  Served(Served),
}

pub struct Worker<S: TierStorage, N: Network> {
  config: Arc<Config>,
  tiers: TierRegistry<S>,
  network: Arc<N>,
  classifier: Arc<Classifier>,
  engine: StrategyEngine<S, N>,
  clients: Clients,
  state: Arc<Mutex<LifecycleState>>,
  skip_waiting: Arc<AtomicBool>,
  sync: Arc<Mutex<SyncQueue>>,
}

impl<S: TierStorage, N: Network> Worker<S, N> {
  pub fn new(config: Config, storage: S, network: Arc<N>, clients: Clients) -> Self {
    let names = TierNames::new(
      &config.cache_prefix,
      &config.version,
      &config.offline_version,
    );
    let tiers = TierRegistry::new(storage, names);
    let engine = StrategyEngine::new(
      tiers.clone(),
      Arc::clone(&network),
      config.origin.clone(),
      config.offline_fallbacks.clone(),
      &config.manifest,
    );

    Self {
      classifier: Arc::new(Classifier::new(&config)),
      config: Arc::new(config),
      tiers,
      network,
      engine,
      clients,
      state: Arc::new(Mutex::new(LifecycleState::Installing)),
      skip_waiting: Arc::new(AtomicBool::new(false)),
      sync: Arc::new(Mutex::new(SyncQueue::new())),
    }
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn state(&self) -> LifecycleState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  #[cfg(test)]
  pub fn tiers(&self) -> &TierRegistry<S> {
    &self.tiers
  }

  #[cfg(test)]
  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  #[cfg(test)]
  pub fn sync_state(&self) -> sync::SyncState {
    match self.sync.lock() {
      Ok(queue) => queue.state().clone(),
      Err(poisoned) => poisoned.into_inner().state().clone(),
    }
  }

  fn transition(&self, event: LifecycleEvent) -> Result<LifecycleState> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let from = *state;
    let next = from.next(event)?;
    debug!(%from, to = %next, ?event, "lifecycle transition");
    *state = next;
    Ok(next)
  }

  /// Install this version: pre-warm the static tier, then activate right away
  /// if nothing holds the worker in waiting.
  ///
  /// A failed pre-warm leaves the worker redundant and the tier store as it
  /// was; the previous version keeps serving.
  pub async fn install(&self) -> Result<LifecycleState> {
    let state = self.state();
    if state != LifecycleState::Installing {
      return Err(eyre!("Cannot install a worker that is already {}", state));
    }

    if let Err(e) = lifecycle::prewarm(
      &self.tiers,
      self.network.as_ref(),
      &self.config.origin,
      &self.config.manifest,
    )
    .await
    {
      self.transition(LifecycleEvent::InstallFailed)?;
      error!(version = self.version(), error = %e, "install failed");
      return Err(e);
    }

    self.transition(LifecycleEvent::Installed)?;
    info!(version = self.version(), "installed");
    self.try_activate().await
  }

  /// Resume a version whose static tier is already populated (a restart of
  /// the active worker). Returns false when a fresh install is needed.
  pub fn restore(&self) -> Result<bool> {
    let static_tier = self.tiers.name(TierPurpose::Static);
    let installed = self
      .tiers
      .storage()
      .tier_names()?
      .iter()
      .any(|name| name == static_tier);
    if !installed {
      return Ok(false);
    }
    self.transition(LifecycleEvent::Restored)?;
    Ok(true)
  }

  /// Request activation without waiting for older clients to close.
  pub async fn skip_waiting(&self) -> Result<LifecycleState> {
    self.skip_waiting.store(true, Ordering::SeqCst);
    self.try_activate().await
  }

  /// Pages controlled by an older version have closed.
  pub async fn clients_released(&self) -> Result<LifecycleState> {
    self.try_activate().await
  }

  async fn try_activate(&self) -> Result<LifecycleState> {
    let state = self.state();
    if state != LifecycleState::Waiting {
      return Ok(state);
    }

    let blocking = self.clients.controlled_by_other(self.version());
    if !lifecycle::may_activate(self.skip_waiting.load(Ordering::SeqCst), blocking) {
      info!(version = self.version(), clients = blocking, "waiting for old clients to close");
      return Ok(state);
    }

    self.activate().await
  }

  /// Prune stale tiers, claim every open page and announce the update.
  async fn activate(&self) -> Result<LifecycleState> {
    // Losing this race to a concurrent activation is not an error
    if self.transition(LifecycleEvent::Activate).is_err() {
      return Ok(self.state());
    }

    // A failed prune leaves stale tiers for the next activation to remove
    let deleted = match self.tiers.prune_stale() {
      Ok(deleted) => deleted.len(),
      Err(e) => {
        warn!(version = self.version(), error = %e, "failed to prune stale tiers");
        0
      }
    };
    let claimed = self.clients.claim(self.version());
    let state = self.transition(LifecycleEvent::Activated)?;

    let notified = self.clients.broadcast(&ClientNotice::WorkerUpdated {
      version: self.version().to_string(),
    });
    info!(
      version = self.version(),
      stale_tiers = deleted,
      claimed,
      notified,
      "activated"
    );
    Ok(state)
  }

  /// Intercept a fetch. Only an active worker intercepts.
  pub async fn fetch(&self, request: &Request) -> Result<FetchOutcome> {
    if !self.state().intercepts_fetch() {
      return Ok(FetchOutcome::Skipped);
    }

    let class = self.classifier.classify(request);
    if class == Classification::Skip {
      return Ok(FetchOutcome::Skipped);
    }

    let served = self.engine.handle(class, request).await?;
    debug!(
      url = %request.url,
      ?class,
      source = %served.source,
      status = served.response.status(),
      "fetch served"
    );
    Ok(FetchOutcome::Served(served))
  }

  /// Handle one control message. Failures are logged, never returned.
  pub async fn message(&self, envelope: Envelope) {
    let Envelope { message, reply } = envelope;

    let result = match message {
      ControlMessage::SkipWaiting => self.skip_waiting().await.map(|_| ()),
      ControlMessage::ClearAllCaches => self.tiers.clear_all().map(|deleted| {
        info!(deleted, "cleared all tiers");
      }),
      ControlMessage::CacheProductData(payload) => {
        self.prime(SnapshotKind::Products, &payload).await
      }
      ControlMessage::CacheCustomerData(payload) => {
        self.prime(SnapshotKind::Customers, &payload).await
      }
      ControlMessage::GetCacheStatus => match reply {
        Some(reply) => CacheStatus::collect(&self.tiers).map(|status| {
          if reply.send(status).is_err() {
            debug!("status requester went away before the reply");
          }
        }),
        None => Err(eyre!("getCacheStatus needs a reply channel")),
      },
    };

    if let Err(e) = result {
      warn!(error = %e, "control message failed");
    }
  }

  /// Parse and handle a raw JSON control message.
  pub async fn message_raw(
    &self,
    raw: &str,
    reply: Option<tokio::sync::oneshot::Sender<CacheStatus>>,
  ) {
    match ControlMessage::parse(raw) {
      Ok(message) => self.message(Envelope { message, reply }).await,
      Err(e) => warn!(error = %e, "ignoring control message"),
    }
  }

  async fn prime(&self, kind: SnapshotKind, payload: &serde_json::Value) -> Result<()> {
    prime_snapshot(
      &self.tiers,
      self.network.as_ref(),
      &self.config.origin,
      kind,
      payload,
    )
    .await
    .map(|_| ())
  }

  /// A page queued work under `tag` while offline.
  pub fn register_sync(&self, tag: &str) {
    match self.sync.lock() {
      Ok(mut queue) => queue.register(tag),
      Err(poisoned) => poisoned.into_inner().register(tag),
    }
  }

  /// Connectivity is back for `tag`. Returns how many pages were notified.
  pub fn sync(&self, tag: &str) -> usize {
    match self.sync.lock() {
      Ok(mut queue) => queue.fire(tag, &self.clients),
      Err(poisoned) => poisoned.into_inner().fire(tag, &self.clients),
    }
  }
}

impl<S: TierStorage, N: Network> Clone for Worker<S, N> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      tiers: self.tiers.clone(),
      network: Arc::clone(&self.network),
      classifier: Arc::clone(&self.classifier),
      engine: self.engine.clone(),
      clients: self.clients.clone(),
      state: Arc::clone(&self.state),
      skip_waiting: Arc::clone(&self.skip_waiting),
      sync: Arc::clone(&self.sync),
    }
  }
}
