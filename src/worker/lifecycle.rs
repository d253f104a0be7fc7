//! Install and activate: warming the static store and retiring old versions.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use tracing::{info, warn};
use url::Url;

use super::manifest::{Manifest, StoreNames};
use crate::cache::CacheStorage;
use crate::http::{Network, Request};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Script loaded, nothing run yet
  Parsed,
  Installing,
  /// Installed, waiting to activate
  Installed,
  Activating,
  /// Active and intercepting requests
  Activated,
  /// Replaced by another version
  Redundant,
}

impl WorkerState {
  /// Only an activated worker intercepts requests.
  pub fn can_intercept_fetch(&self) -> bool {
    matches!(self, WorkerState::Activated)
  }
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Parsed => write!(f, "parsed"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Activated => write!(f, "activated"),
      WorkerState::Redundant => write!(f, "redundant"),
    }
  }
}

/// Outcome of pre-caching the manifest.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
  /// Assets now in the static store
  pub cached: Vec<String>,
  /// Assets that could not be cached, with the reason
  pub failed: Vec<(String, String)>,
}

/// Pre-cache every manifest asset into the static store.
///
/// Assets are fetched concurrently and independently: a failing asset is
/// recorded and logged, never aborting the rest. Only a failure to open the
/// store itself is an error.
pub async fn install<S, N>(
  storage: &S,
  network: &N,
  manifest: &Manifest,
  origin: &Url,
) -> Result<InstallReport>
where
  S: CacheStorage,
  N: Network,
{
  let names = manifest.store_names();
  storage.open(&names.static_store)?;

  let store = names.static_store.as_str();
  let fetches = manifest.assets.iter().map(|asset| async move {
    let outcome = precache_asset(storage, network, store, origin, asset).await;
    (asset.clone(), outcome)
  });

  let mut report = InstallReport::default();
  for (asset, outcome) in join_all(fetches).await {
    match outcome {
      Ok(()) => report.cached.push(asset),
      Err(err) => {
        warn!(asset = %asset, error = %err, "failed to pre-cache asset");
        report.failed.push((asset, err.to_string()));
      }
    }
  }

  info!(
    store = %names.static_store,
    cached = report.cached.len(),
    failed = report.failed.len(),
    "install complete"
  );

  Ok(report)
}

async fn precache_asset<S, N>(
  storage: &S,
  network: &N,
  store: &str,
  origin: &Url,
  asset: &str,
) -> Result<()>
where
  S: CacheStorage,
  N: Network,
{
  let request = Request::get_path(origin, asset)?;
  let response = network.fetch(request.clone()).await?;
  if !response.is_cacheable() {
    return Err(eyre!("Unexpected status {}", response.status));
  }
  storage.put(store, &request, &response)
}

/// Delete every store not owned by `names` and make sure both current stores exist.
///
/// Returns the names of the deleted stores.
pub fn activate<S: CacheStorage>(storage: &S, names: &StoreNames) -> Result<Vec<String>> {
  let mut deleted = Vec::new();

  for name in storage.keys()? {
    if !names.contains(&name) {
      storage.delete(&name)?;
      info!(store = %name, "deleted cache store from previous version");
      deleted.push(name);
    }
  }

  storage.open(&names.static_store)?;
  storage.open(&names.dynamic)?;

  Ok(deleted)
}
