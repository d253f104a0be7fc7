mod cache;
mod config;
mod db;
mod http;
mod logging;
mod perf;
mod server;
mod sync;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::cache::{CacheStorage, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::http::{OriginClient, Request};
use crate::perf::PerfMonitor;
use crate::server::AppState;
use crate::sync::{BackgroundSync, SyncQueue, SyncScheduler};
use crate::worker::{Manifest, Scope, ServiceWorker};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline caching worker in front of a web origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to cache, overriding the config file
  #[arg(short, long, env = "SWCACHE_ORIGIN")]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install, activate and proxy requests to the origin
  Serve {
    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,
  },
  /// Pre-cache the static manifest and retire stores of older versions
  Install,
  /// Resolve one request through the worker
  Fetch {
    /// Path under the origin, e.g. /rest/v1/jobs
    path: String,
    /// Request method; anything but GET passes straight through
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Write the response body to stdout
    #[arg(long)]
    body: bool,
  },
  /// List cache stores and their entry counts
  Caches,
  /// Resend queued form submissions now
  Sync,
  /// List queued form submissions
  Queue,
}

type Worker = ServiceWorker<SqliteStorage, OriginClient>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref(), args.origin.as_deref())?;
  let _log_guard = logging::init(&config)?;

  let db = Arc::new(Database::open(&config.database_path()?)?);
  let network = Arc::new(OriginClient::new(&config)?);
  let worker = ServiceWorker::new(
    Arc::new(SqliteStorage::new(Arc::clone(&db))),
    Arc::clone(&network),
    Manifest::current(),
    Scope::new(config.origin.clone(), &config.scope),
  )?;
  let sync = BackgroundSync::new(SyncQueue::new(db), network, &config.sync);

  match args.command {
    Command::Serve { listen } => serve(&config, worker, sync, listen).await,
    Command::Install => install(&worker).await,
    Command::Fetch { path, method, body } => fetch(&worker, &config, &method, &path, body).await,
    Command::Caches => caches(&worker),
    Command::Sync => {
      let report = sync.on_sync(sync.tag()).await?;
      println!(
        "{}: {} attempted, {} flushed, {} failed",
        report.tag, report.attempted, report.flushed, report.failed
      );
      Ok(())
    }
    Command::Queue => {
      let queue = sync.queue();
      for tag in queue.tags()? {
        for submission in queue.pending(&tag)? {
          println!(
            "[{}] {}  {} {}  attempts={}  {}",
            tag,
            submission.id,
            submission.method,
            submission.url,
            submission.attempts,
            submission.last_error.unwrap_or_default()
          );
        }
      }
      Ok(())
    }
  }
}

async fn serve(
  config: &Config,
  worker: Worker,
  sync: BackgroundSync<OriginClient>,
  listen: Option<SocketAddr>,
) -> Result<()> {
  worker.start().await?;

  let (tx, rx) = mpsc::unbounded_channel();
  let sync = Arc::new(sync.with_registrations(tx));
  tokio::spawn(SyncScheduler::new(Arc::clone(&sync), &config.sync).run(rx));

  // Submissions left over from a previous run
  sync.register_pending()?;

  let state = Arc::new(AppState {
    worker,
    sync,
    perf: PerfMonitor::spawn(),
    origin: config.origin.clone(),
  });

  server::serve(state, listen.unwrap_or(config.listen)).await
}

async fn install(worker: &Worker) -> Result<()> {
  let report = worker.start().await?;

  for asset in &report.cached {
    println!("cached  {}", asset);
  }
  for (asset, error) in &report.failed {
    println!("failed  {}  ({})", asset, error);
  }
  println!("{} now {}", worker.manifest().version, worker.state());
  Ok(())
}

async fn fetch(
  worker: &Worker,
  config: &Config,
  method: &str,
  path: &str,
  print_body: bool,
) -> Result<()> {
  // One-shot commands act as an already controlling worker
  worker.activate()?;

  let url = Request::get_path(&config.origin, path)?.url;
  let request = Request::new(method, url);
  let out = worker.handle_fetch(request).await?;
  let response = &out.result.data;

  if print_body {
    use std::io::Write;
    std::io::stdout().write_all(&response.body)?;
  } else {
    println!(
      "{} {}  strategy={}  source={}  bytes={}",
      response.status,
      path,
      out
        .strategy
        .map(|s| s.to_string())
        .unwrap_or_else(|| "passthrough".to_string()),
      out.result.source,
      response.body.len()
    );
    if let Some(cached_at) = out.result.cached_at {
      println!("cached at {}", cached_at.to_rfc3339());
    }
  }
  Ok(())
}

fn caches(worker: &Worker) -> Result<()> {
  let storage = worker.storage();
  for name in storage.keys()? {
    println!("{}  {} entries", name, storage.urls(&name)?.len());
  }
  Ok(())
}
