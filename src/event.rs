use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::TierStorage;
use crate::http::Request;
use crate::network::Network;
use crate::worker::control::CacheStatus;
use crate::worker::lifecycle::LifecycleState;
use crate::worker::{FetchOutcome, Worker};

/// Events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  /// Platform asks the worker to install
  Install {
    respond: oneshot::Sender<Result<LifecycleState>>,
  },
  /// A page issued a request
  Fetch {
    request: Request,
    respond: oneshot::Sender<Result<FetchOutcome>>,
  },
  /// Raw control message from a page
  Message {
    raw: String,
    reply: Option<oneshot::Sender<CacheStatus>>,
  },
  /// A page queued work for deferred sync
  SyncRegistered { tag: String },
  /// Connectivity returned for a sync tag
  Sync {
    tag: String,
    respond: oneshot::Sender<usize>,
  },
  /// Pages controlled by an older version have closed
  ClientsReleased,
  Shutdown,
}

/// Runs the worker's event loop on a background task.
///
/// Lifecycle and control events are handled one at a time in arrival order.
/// Fetches are spawned so a slow network never blocks other events.
pub struct EventLoop {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  handle: JoinHandle<()>,
}

impl EventLoop {
  pub fn spawn<S, N>(worker: Worker<S, N>) -> Self
  where
    S: TierStorage + 'static,
    N: Network + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        match event {
          WorkerEvent::Install { respond } => {
            let _ = respond.send(worker.install().await);
          }
          WorkerEvent::Fetch { request, respond } => {
            let worker = worker.clone();
            tokio::spawn(async move {
              let _ = respond.send(worker.fetch(&request).await);
            });
          }
          WorkerEvent::Message { raw, reply } => {
            worker.message_raw(&raw, reply).await;
          }
          WorkerEvent::SyncRegistered { tag } => worker.register_sync(&tag),
          WorkerEvent::Sync { tag, respond } => {
            let _ = respond.send(worker.sync(&tag));
          }
          WorkerEvent::ClientsReleased => {
            if let Err(e) = worker.clients_released().await {
              warn!(error = %e, "activation after clients closed failed");
            }
          }
          WorkerEvent::Shutdown => break,
        }
      }
      debug!("worker event loop stopped");
    });

    Self { tx, handle }
  }

  pub fn sender(&self) -> EventSender {
    EventSender {
      tx: self.tx.clone(),
    }
  }

  /// Stop after the events already queued, then wait for the loop to exit.
  pub async fn shutdown(self) -> Result<()> {
    // A closed channel means the loop already exited
    let _ = self.tx.send(WorkerEvent::Shutdown);
    self
      .handle
      .await
      .map_err(|e| eyre!("Worker event loop panicked: {}", e))
  }
}

/// Cloneable handle for delivering events to a running [`EventLoop`].
#[derive(Clone)]
pub struct EventSender {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl EventSender {
  fn send(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker event loop is not running"))
  }

  async fn request<T>(
    &self,
    event: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent,
  ) -> Result<T> {
    let (respond, rx) = oneshot::channel();
    self.send(event(respond))?;
    rx.await
      .map_err(|_| eyre!("Worker dropped the request without answering"))
  }

  pub async fn install(&self) -> Result<LifecycleState> {
    self.request(|respond| WorkerEvent::Install { respond }).await?
  }

  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome> {
    self
      .request(|respond| WorkerEvent::Fetch { request, respond })
      .await?
  }

  /// Fire-and-forget control message.
  pub fn post_message(&self, raw: impl Into<String>) -> Result<()> {
    self.send(WorkerEvent::Message {
      raw: raw.into(),
      reply: None,
    })
  }

  /// Send `getCacheStatus` and wait for the reply.
  pub async fn request_status(&self) -> Result<CacheStatus> {
    self
      .request(|reply| WorkerEvent::Message {
        raw: r#"{"action":"getCacheStatus"}"#.to_string(),
        reply: Some(reply),
      })
      .await
  }

  pub fn register_sync(&self, tag: impl Into<String>) -> Result<()> {
    self.send(WorkerEvent::SyncRegistered { tag: tag.into() })
  }

  pub async fn sync(&self, tag: impl Into<String>) -> Result<usize> {
    let tag = tag.into();
    self
      .request(|respond| WorkerEvent::Sync { tag, respond })
      .await
  }

  pub fn clients_released(&self) -> Result<()> {
    self.send(WorkerEvent::ClientsReleased)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::config::Config;
  use crate::http::Response;
  use crate::network::fake::FakeNetwork;
  use crate::worker::clients::{ClientNotice, Clients};
  use std::sync::Arc;

  fn spawn_worker(clients: Clients) -> (EventLoop, Arc<FakeNetwork>) {
    let config = Config {
      manifest: vec!["/".to_string()],
      ..Config::default()
    };
    let network = Arc::new(
      FakeNetwork::new()
        .route("http://localhost:5173/", Response::new(200, "<html>"))
        .route("http://localhost:5173/api/products", Response::new(200, "[]")),
    );
    let worker = Worker::new(config, MemoryStorage::new(), Arc::clone(&network), clients);
    (EventLoop::spawn(worker), network)
  }

  #[tokio::test]
  async fn test_install_then_fetch() {
    let (event_loop, network) = spawn_worker(Clients::new());
    let sender = event_loop.sender();

    assert_eq!(sender.install().await.unwrap(), LifecycleState::Active);

    let request = Request::parse("http://localhost:5173/api/products").unwrap();
    let outcome = sender.fetch(request).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Served(_)));
    assert_eq!(network.calls("http://localhost:5173/api/products"), 1);

    event_loop.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_messages_are_handled_in_order() {
    let (event_loop, _network) = spawn_worker(Clients::new());
    let sender = event_loop.sender();
    sender.install().await.unwrap();

    sender.post_message(r#"{"action":"clearAllCaches"}"#).unwrap();
    let status = sender.request_status().await.unwrap();
    assert_eq!(status.total_caches, 0);

    event_loop.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_waiting_worker_activates_when_clients_release() {
    let clients = Clients::new();
    let old_page = clients.connect(Some("v0"));
    let mut observer = clients.connect(None);
    let (event_loop, _network) = spawn_worker(clients.clone());
    let sender = event_loop.sender();

    assert_eq!(sender.install().await.unwrap(), LifecycleState::Waiting);

    clients.disconnect(old_page.id);
    sender.clients_released().unwrap();
    assert_eq!(
      observer.next().await,
      Some(ClientNotice::WorkerUpdated {
        version: "v1".to_string()
      })
    );

    event_loop.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_sync_round_trip() {
    let clients = Clients::new();
    let mut page = clients.connect(None);
    let (event_loop, _network) = spawn_worker(clients);
    let sender = event_loop.sender();

    sender.register_sync("sync-offline-orders").unwrap();
    assert_eq!(sender.sync("sync-offline-orders").await.unwrap(), 1);
    assert_eq!(
      page.try_next(),
      Some(ClientNotice::ReplayQueuedWork {
        tag: "sync-offline-orders".to_string()
      })
    );

    event_loop.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_sender_fails_after_shutdown() {
    let (event_loop, _network) = spawn_worker(Clients::new());
    let sender = event_loop.sender();
    event_loop.shutdown().await.unwrap();

    assert!(sender.post_message(r#"{"action":"skipWaiting"}"#).is_err());
    assert!(sender.request_status().await.is_err());
  }
}
