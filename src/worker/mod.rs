//! The caching worker: lifecycle plus fetch interception.
//!
//! Requests are classified into one of three strategies and resolved through
//! the cache layer. Before activation, and for anything outside the scope,
//! requests go straight to the network.

pub mod classifier;
pub mod lifecycle;
pub mod manifest;

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::http::{Network, Request, Response};

pub use classifier::{Classifier, Strategy};
pub use lifecycle::{InstallReport, WorkerState};
pub use manifest::Manifest;

/// Origin and path prefix a worker controls.
#[derive(Debug, Clone)]
pub struct Scope {
  origin: Url,
  prefix: String,
}

impl Scope {
  pub fn new(origin: Url, prefix: &str) -> Self {
    Self {
      origin,
      prefix: prefix.to_string(),
    }
  }

  pub fn contains(&self, url: &Url) -> bool {
    url.origin() == self.origin.origin() && url.path().starts_with(&self.prefix)
  }
}

/// Result of one intercepted fetch.
#[derive(Debug)]
pub struct Intercepted {
  pub result: CacheResult<Response>,
  /// `None` when the request was passed through untouched
  pub strategy: Option<Strategy>,
}

/// A versioned caching worker in front of one origin.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  layer: CacheLayer<S>,
  network: Arc<N>,
  classifier: Classifier,
  manifest: Manifest,
  scope: Scope,
  state: RwLock<WorkerState>,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, manifest: Manifest, scope: Scope) -> Result<Self> {
    let classifier = Classifier::new(&manifest)?;
    let layer = CacheLayer::new(storage, manifest.store_names());

    Ok(Self {
      layer,
      network,
      classifier,
      manifest,
      scope,
      state: RwLock::new(WorkerState::Parsed),
    })
  }

  pub fn state(&self) -> WorkerState {
    self.state.read().map(|s| *s).unwrap_or(WorkerState::Redundant)
  }

  fn set_state(&self, state: WorkerState) -> Result<()> {
    let mut current = self
      .state
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    debug!(from = %*current, to = %state, "worker state change");
    *current = state;
    Ok(())
  }

  pub fn manifest(&self) -> &Manifest {
    &self.manifest
  }

  pub fn storage(&self) -> &Arc<S> {
    self.layer.storage()
  }

  /// Install, skip waiting, activate and claim in one go.
  pub async fn start(&self) -> Result<InstallReport> {
    let report = self.install().await?;
    self.activate()?;
    Ok(report)
  }

  /// Pre-cache the static manifest. Asset failures are reported, not fatal.
  pub async fn install(&self) -> Result<InstallReport> {
    self.set_state(WorkerState::Installing)?;
    let report = lifecycle::install(
      self.layer.storage().as_ref(),
      self.network.as_ref(),
      &self.manifest,
      &self.scope.origin,
    )
    .await?;
    self.set_state(WorkerState::Installed)?;
    Ok(report)
  }

  /// Delete stores of other versions and start intercepting.
  pub fn activate(&self) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating)?;
    let deleted = lifecycle::activate(self.layer.storage().as_ref(), self.layer.names())?;
    self.set_state(WorkerState::Activated)?;
    info!(version = %self.manifest.version, "worker activated");
    Ok(deleted)
  }

  /// Resolve a request the page issued.
  pub async fn handle_fetch(&self, request: Request) -> Result<Intercepted> {
    let strategy = if self.state().can_intercept_fetch() && self.scope.contains(&request.url) {
      self.classifier.classify(&request)
    } else {
      None
    };

    let Some(strategy) = strategy else {
      debug!(method = %request.method, url = %request.url, "passthrough");
      let response = self.network.fetch(request).await?;
      return Ok(Intercepted {
        result: CacheResult::from_network(response),
        strategy: None,
      });
    };

    let network = Arc::clone(&self.network);
    let fetch_request = request.clone();
    let fetcher = move || async move { network.fetch(fetch_request).await };

    let result = match strategy {
      Strategy::CacheFirst => self.layer.cache_first(&request, fetcher).await?,
      Strategy::NetworkFirst => self.layer.network_first(&request, fetcher).await?,
      Strategy::StaleWhileRevalidate => self.layer.stale_while_revalidate(&request, fetcher).await?,
    };

    debug!(url = %request.url, %strategy, source = %result.source, "intercepted");

    Ok(Intercepted {
      result,
      strategy: Some(strategy),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::db::Database;
  use crate::http::testing::FakeNetwork;

  const ORIGIN: &str = "https://example.com";

  fn worker(network: Arc<FakeNetwork>) -> ServiceWorker<SqliteStorage, FakeNetwork> {
    let storage = SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    let manifest = Manifest::with_version("v1").with_assets(&["/", "/index.html"]);
    let scope = Scope::new(Url::parse(ORIGIN).unwrap(), "/");
    ServiceWorker::new(Arc::new(storage), network, manifest, scope).unwrap()
  }

  fn get(path: &str) -> Request {
    Request::get_path(&Url::parse(ORIGIN).unwrap(), path).unwrap()
  }

  #[tokio::test]
  async fn test_installed_assets_served_without_network() {
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/", Response::ok("home"));
    network.respond("https://example.com/index.html", Response::ok("index"));
    let worker = worker(Arc::clone(&network));

    worker.start().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Activated);
    let calls_after_install = network.calls().len();

    for (path, body) in [("/", "home"), ("/index.html", "index")] {
      let out = worker.handle_fetch(get(path)).await.unwrap();
      assert_eq!(out.strategy, Some(Strategy::CacheFirst));
      assert_eq!(out.result.source, CacheSource::Cache);
      assert_eq!(out.result.data.body, body.as_bytes());
    }
    assert_eq!(network.calls().len(), calls_after_install);
  }

  #[tokio::test]
  async fn test_api_request_goes_network_first() {
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/rest/v1/jobs", Response::ok("[]"));
    let worker = worker(Arc::clone(&network));
    worker.start().await.unwrap();

    let out = worker.handle_fetch(get("/rest/v1/jobs")).await.unwrap();
    assert_eq!(out.strategy, Some(Strategy::NetworkFirst));
    assert_eq!(out.result.source, CacheSource::Network);

    network.fail("https://example.com/rest/v1/jobs");
    let out = worker.handle_fetch(get("/rest/v1/jobs")).await.unwrap();
    assert_eq!(out.result.source, CacheSource::Offline);
    assert_eq!(out.result.data.body, b"[]");
  }

  #[tokio::test]
  async fn test_offline_without_cache_is_an_error() {
    let network = Arc::new(FakeNetwork::new());
    let worker = worker(Arc::clone(&network));
    worker.start().await.unwrap();

    assert!(worker.handle_fetch(get("/rest/v1/courses")).await.is_err());
    assert!(worker.handle_fetch(get("/academy")).await.is_err());
  }

  #[tokio::test]
  async fn test_not_intercepting_before_activation() {
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/rest/v1/jobs", Response::ok("[]"));
    let worker = worker(Arc::clone(&network));

    let out = worker.handle_fetch(get("/rest/v1/jobs")).await.unwrap();
    assert_eq!(out.strategy, None);
    assert!(worker.storage().keys().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_post_and_out_of_scope_pass_through() {
    let network = Arc::new(FakeNetwork::new());
    network.respond("https://example.com/rest/v1/jobs", Response::new(201, ""));
    network.respond("https://cdn.example.org/lib.js", Response::ok("js"));
    let worker = worker(Arc::clone(&network));
    worker.start().await.unwrap();

    let post = Request::new("POST", get("/rest/v1/jobs").url).with_body(b"{}".to_vec());
    let out = worker.handle_fetch(post).await.unwrap();
    assert_eq!(out.strategy, None);
    assert_eq!(out.result.data.status, 201);

    let foreign = Request::get(Url::parse("https://cdn.example.org/lib.js").unwrap());
    let out = worker.handle_fetch(foreign).await.unwrap();
    assert_eq!(out.strategy, None);
    assert!(worker.storage().urls("dynamic-v1").unwrap().is_empty());
  }

  #[test]
  fn test_scope_prefix() {
    let scope = Scope::new(Url::parse(ORIGIN).unwrap(), "/app/");
    assert!(scope.contains(&Url::parse("https://example.com/app/page").unwrap()));
    assert!(!scope.contains(&Url::parse("https://example.com/other").unwrap()));
    assert!(!scope.contains(&Url::parse("http://example.com/app/page").unwrap()));
  }
}
