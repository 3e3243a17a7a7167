mod cache;
mod config;
mod event;
mod http;
mod logging;
mod network;
mod worker;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use cache::SqliteStorage;
use event::{EventLoop, EventSender};
use http::{Destination, Request};
use network::HttpNetwork;
use worker::clients::{ClientConnection, Clients};
use worker::control::{ControlMessage, SnapshotKind};
use worker::{FetchOutcome, Worker};

#[derive(Parser, Debug)]
#[command(name = "skrm-proxy")]
#[command(about = "Offline-first caching proxy for the SKRM web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./skrm-proxy.yaml, then $XDG_CONFIG_HOME/skrm-proxy/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version, pre-warming the static tier
  Install,
  /// Fetch a path through the cache strategies and print the body
  Fetch {
    /// Path relative to the origin, e.g. /api/products
    path: String,
    /// Treat the request as an image load
    #[arg(long)]
    image: bool,
  },
  /// Print entry counts per tier
  Status,
  /// Delete every tier
  Clear,
  /// Store a JSON snapshot for offline use and cache the images it references
  Prime {
    kind: PrimeKind,
    /// JSON file holding the snapshot payload
    file: PathBuf,
  },
  /// Ask open pages to replay work queued under a sync tag
  Sync { tag: String },
  /// Activate without waiting for old clients
  SkipWaiting,
  /// Connect as a page: print worker notices as JSON lines and read
  /// commands from stdin (`status`, `queue <tag>`, `sync <tag>`, `release`,
  /// `quit`, or a raw JSON control message)
  Watch {
    /// Also keep a page controlled by this older version open, so a fresh
    /// install waits until `release`
    #[arg(long)]
    old_version: Option<String>,
  },
}

/// Pages opened by `watch` before the worker starts.
struct Pages {
  watcher: ClientConnection,
  old: Option<ClientConnection>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PrimeKind {
  Products,
  Customers,
}

impl From<PrimeKind> for SnapshotKind {
  fn from(kind: PrimeKind) -> Self {
    match kind {
      PrimeKind::Products => SnapshotKind::Products,
      PrimeKind::Customers => SnapshotKind::Customers,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let storage = SqliteStorage::open(config.storage.path.as_deref())?;
  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let origin = config.origin.clone();

  let clients = Clients::new();
  let pages = match &args.command {
    Command::Watch { old_version } => Some(Pages {
      watcher: clients.connect(None),
      old: old_version.as_deref().map(|v| clients.connect(Some(v))),
    }),
    _ => None,
  };

  let worker = Worker::new(config, storage, network, clients.clone());
  let restored = worker.restore()?;
  let event_loop = EventLoop::spawn(worker);
  let sender = event_loop.sender();

  if !restored {
    let state = sender.install().await?;
    info!(%state, "installed before running command");
  } else if matches!(args.command, Command::Install) {
    println!("Already installed; worker is active");
  }

  let result = match pages {
    Some(pages) => watch(&sender, &clients, pages).await,
    None => run(&sender, &origin, args.command).await,
  };
  event_loop.shutdown().await?;
  result
}

async fn run(sender: &EventSender, origin: &url::Url, command: Command) -> Result<()> {
  match command {
    Command::Install => {}
    Command::Fetch { path, image } => {
      let url = origin
        .join(&path)
        .map_err(|e| eyre!("Invalid path '{}': {}", path, e))?;
      let mut request = Request::get(url);
      if image {
        request = request.with_destination(Destination::Image);
      }

      match sender.fetch(request).await? {
        FetchOutcome::Skipped => println!("Not intercepted"),
        FetchOutcome::Served(served) => {
          eprintln!(
            "{} {} ({})",
            served.response.status(),
            served.response.header("content-type").unwrap_or("-"),
            served.source
          );
          if let Some(cached_at) = served.cached_at {
            eprintln!("cached at {}", cached_at.to_rfc3339());
          }
          println!("{}", String::from_utf8_lossy(served.response.body()));
        }
      }
    }
    Command::Status => {
      let status = sender.request_status().await?;
      for (tier, count) in &status.caches {
        println!("{:<32} {}", tier, count);
      }
      println!("{} tiers", status.total_caches);
    }
    Command::Clear => {
      post(sender, &ControlMessage::ClearAllCaches)?;
    }
    Command::Prime { kind, file } => {
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let payload: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse {}: {}", file.display(), e))?;
      let message = match SnapshotKind::from(kind) {
        SnapshotKind::Products => ControlMessage::CacheProductData(payload),
        SnapshotKind::Customers => ControlMessage::CacheCustomerData(payload),
      };
      post(sender, &message)?;
    }
    Command::Sync { tag } => {
      sender.register_sync(tag.as_str())?;
      let notified = sender.sync(tag).await?;
      println!("Notified {} clients", notified);
    }
    Command::SkipWaiting => {
      post(sender, &ControlMessage::SkipWaiting)?;
    }
    Command::Watch { .. } => {}
  }

  Ok(())
}

/// One line typed into a `watch` session.
#[derive(Debug, PartialEq, Eq)]
enum WatchInput {
  Blank,
  Quit,
  Status,
  Queue(String),
  Sync(String),
  Release,
  /// Anything else goes to the worker as a raw control message
  Message(String),
}

impl WatchInput {
  fn parse(line: &str) -> Self {
    let line = line.trim();
    let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match word {
      "" => WatchInput::Blank,
      "quit" => WatchInput::Quit,
      "status" => WatchInput::Status,
      "release" => WatchInput::Release,
      "queue" if !rest.is_empty() => WatchInput::Queue(rest.to_string()),
      "sync" if !rest.is_empty() => WatchInput::Sync(rest.to_string()),
      _ => WatchInput::Message(line.to_string()),
    }
  }
}

async fn watch(sender: &EventSender, clients: &Clients, mut pages: Pages) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();

  loop {
    tokio::select! {
      notice = pages.watcher.next() => {
        let Some(notice) = notice else { break };
        let json = serde_json::to_string(&notice)
          .map_err(|e| eyre!("Failed to encode notice: {}", e))?;
        println!("{}", json);
      }
      line = lines.next_line() => {
        let Some(line) = line.map_err(|e| eyre!("Failed to read stdin: {}", e))? else {
          break;
        };
        match WatchInput::parse(&line) {
          WatchInput::Blank => {}
          WatchInput::Quit => break,
          WatchInput::Status => {
            let status = sender.request_status().await?;
            let json = serde_json::to_string(&status)
              .map_err(|e| eyre!("Failed to encode status: {}", e))?;
            println!("{}", json);
          }
          WatchInput::Queue(tag) => sender.register_sync(tag)?,
          WatchInput::Sync(tag) => {
            sender.sync(tag).await?;
          }
          WatchInput::Release => match pages.old.take() {
            Some(old) => {
              clients.disconnect(old.id);
              sender.clients_released()?;
            }
            None => warn!("no old page is open"),
          },
          WatchInput::Message(raw) => sender.post_message(raw)?,
        }
      }
    }
  }

  Ok(())
}

/// Deliver a control message in its wire format.
fn post(sender: &EventSender, message: &ControlMessage) -> Result<()> {
  let raw =
    serde_json::to_string(message).map_err(|e| eyre!("Failed to encode message: {}", e))?;
  sender.post_message(raw)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_watch_input() {
    assert_eq!(WatchInput::parse("  "), WatchInput::Blank);
    assert_eq!(WatchInput::parse("status"), WatchInput::Status);
    assert_eq!(WatchInput::parse("release"), WatchInput::Release);
    assert_eq!(
      WatchInput::parse("queue sync-offline-orders"),
      WatchInput::Queue("sync-offline-orders".to_string())
    );
    assert_eq!(
      WatchInput::parse("sync  sync-offline-orders "),
      WatchInput::Sync("sync-offline-orders".to_string())
    );
    assert_eq!(
      WatchInput::parse(r#"{"action":"skipWaiting"}"#),
      WatchInput::Message(r#"{"action":"skipWaiting"}"#.to_string())
    );
    // A bare `sync` has no tag and is passed on as-is
    assert_eq!(WatchInput::parse("sync"), WatchInput::Message("sync".to_string()));
  }
}
