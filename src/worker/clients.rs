//! Open page clients and the notices broadcast to them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;

pub type ClientId = u64;

/// Notices sent from the worker to foreground pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientNotice {
  /// A new worker version took control
  WorkerUpdated { version: String },
  /// Connectivity is back; replay work queued while offline
  ReplayQueuedWork { tag: String },
}

struct ClientHandle {
  sender: mpsc::UnboundedSender<ClientNotice>,
  /// Version of the worker controlling this page, if any
  controller: Option<String>,
}

/// Receiving end held by a page.
pub struct ClientConnection {
  pub id: ClientId,
  receiver: mpsc::UnboundedReceiver<ClientNotice>,
}

impl ClientConnection {
  /// Wait for the next notice. `None` once the worker side is gone.
  pub async fn next(&mut self) -> Option<ClientNotice> {
    self.receiver.recv().await
  }

  /// Take a notice if one is already queued.
  #[cfg(test)]
  pub fn try_next(&mut self) -> Option<ClientNotice> {
    self.receiver.try_recv().ok()
  }
}

/// The set of open pages.
///
/// Pages come and go between events, so every operation works on whatever is
/// connected at the moment it runs. A page whose connection was dropped is
/// forgotten on the next enumeration.
#[derive(Clone, Default)]
pub struct Clients {
  inner: Arc<Mutex<BTreeMap<ClientId, ClientHandle>>>,
  next_id: Arc<AtomicU64>,
}

impl Clients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a page, optionally already controlled by worker `controller`.
  pub fn connect(&self, controller: Option<&str>) -> ClientConnection {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
    let (sender, receiver) = mpsc::unbounded_channel();
    self.with_open(|clients| {
      clients.insert(
        id,
        ClientHandle {
          sender,
          controller: controller.map(String::from),
        },
      );
    });
    ClientConnection { id, receiver }
  }

  pub fn disconnect(&self, id: ClientId) {
    self.with_open(|clients| {
      clients.remove(&id);
    });
  }

  /// Number of open pages controlled by a worker other than `version`.
  pub fn controlled_by_other(&self, version: &str) -> usize {
    self.with_open(|clients| {
      clients
        .values()
        .filter(|c| c.controller.as_deref().is_some_and(|v| v != version))
        .count()
    })
  }

  /// Make `version` the controller of every open page. Returns the count.
  pub fn claim(&self, version: &str) -> usize {
    self.with_open(|clients| {
      for client in clients.values_mut() {
        client.controller = Some(version.to_string());
      }
      clients.len()
    })
  }

  /// Controller of a page, if the page is open and controlled.
  #[cfg(test)]
  pub fn controller(&self, id: ClientId) -> Option<String> {
    self.with_open(|clients| clients.get(&id).and_then(|c| c.controller.clone()))
  }

  /// Send `notice` to every open page. Returns how many received it.
  pub fn broadcast(&self, notice: &ClientNotice) -> usize {
    self.with_open(|clients| {
      clients
        .values()
        .filter(|c| c.sender.send(notice.clone()).is_ok())
        .count()
    })
  }

  /// Run `f` over the open pages after dropping closed connections.
  fn with_open<R>(&self, f: impl FnOnce(&mut BTreeMap<ClientId, ClientHandle>) -> R) -> R {
    let mut clients = match self.inner.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        warn!("client registry lock poisoned, recovering");
        poisoned.into_inner()
      }
    };
    clients.retain(|_, c| !c.sender.is_closed());
    f(&mut clients)
  }
}
