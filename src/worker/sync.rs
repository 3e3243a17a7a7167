//! Deferred sync: tell pages to replay offline-queued work when connectivity
//! returns. The queued operations themselves live in the pages.

use std::collections::BTreeSet;
use tracing::{debug, info};

use super::clients::{ClientNotice, Clients};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  /// Registered tags waiting for connectivity
  Pending(BTreeSet<String>),
}

#[derive(Debug, Clone)]
pub struct SyncQueue {
  state: SyncState,
}

impl Default for SyncQueue {
  fn default() -> Self {
    Self {
      state: SyncState::Idle,
    }
  }
}

impl SyncQueue {
  pub fn new() -> Self {
    Self::default()
  }

  #[cfg(test)]
  pub fn state(&self) -> &SyncState {
    &self.state
  }

  /// Record that a page has work queued under `tag`.
  pub fn register(&mut self, tag: &str) {
    match &mut self.state {
      SyncState::Idle => {
        self.state = SyncState::Pending(BTreeSet::from([tag.to_string()]));
      }
      SyncState::Pending(tags) => {
        tags.insert(tag.to_string());
      }
    }
  }

  /// Consume `tag`. Returns whether it had been registered.
  pub fn take(&mut self, tag: &str) -> bool {
    let SyncState::Pending(tags) = &mut self.state else {
      return false;
    };
    let removed = tags.remove(tag);
    if tags.is_empty() {
      self.state = SyncState::Idle;
    }
    removed
  }

  /// Handle a platform sync event: consume the tag and notify every page
  /// that is open right now. Returns how many pages were notified.
  pub fn fire(&mut self, tag: &str, clients: &Clients) -> usize {
    if !self.take(tag) {
      debug!(tag, "sync fired for a tag that was not registered here");
    }

    let notified = clients.broadcast(&ClientNotice::ReplayQueuedWork {
      tag: tag.to_string(),
    });
    info!(tag, clients = notified, "asked clients to replay queued work");
    notified
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_register_and_take() {
    let mut queue = SyncQueue::new();
    assert_eq!(queue.state(), &SyncState::Idle);

    queue.register("sync-offline-orders");
    queue.register("sync-offline-orders");
    queue.register("sync-cart");
    assert_eq!(
      queue.state(),
      &SyncState::Pending(BTreeSet::from([
        "sync-cart".to_string(),
        "sync-offline-orders".to_string()
      ]))
    );

    assert!(queue.take("sync-offline-orders"));
    assert!(!queue.take("sync-offline-orders"));
    assert!(queue.take("sync-cart"));
    assert_eq!(queue.state(), &SyncState::Idle);
  }

  #[test]
  fn test_fire_notifies_open_clients() {
    let clients = Clients::new();
    let mut page = clients.connect(None);
    let mut queue = SyncQueue::new();
    queue.register("sync-offline-orders");

    assert_eq!(queue.fire("sync-offline-orders", &clients), 1);
    assert_eq!(queue.state(), &SyncState::Idle);
    assert_eq!(
      page.try_next(),
      Some(ClientNotice::ReplayQueuedWork {
        tag: "sync-offline-orders".to_string()
      })
    );
  }

  #[test]
  fn test_fire_unregistered_tag_still_broadcasts() {
    let clients = Clients::new();
    let _page = clients.connect(None);
    let mut queue = SyncQueue::new();

    assert_eq!(queue.fire("sync-unknown", &clients), 1);
    assert_eq!(queue.state(), &SyncState::Idle);
  }
}
