//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::CacheResult;
use crate::http::{Request, Response};
use crate::worker::manifest::StoreNames;

/// Cache layer that manages caching strategies and network fetching.
///
/// Reads go to every store; writes made while serving requests only ever
/// go to the dynamic store.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  names: StoreNames,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer writing into the given stores.
  pub fn new(storage: Arc<S>, names: StoreNames) -> Self {
    Self { storage, names }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn names(&self) -> &StoreNames {
    &self.names
  }

  /// Serve from cache if present, otherwise from the network.
  ///
  /// A miss is not backfilled; static assets are populated at install time.
  pub async fn cache_first<F, Fut>(&self, request: &Request, fetcher: F) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    if let Some(cached) = self.storage.match_any(request)? {
      debug!(url = %request.url, "cache-first hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at, false));
    }

    debug!(url = %request.url, "cache-first miss");
    let response = fetcher().await?;
    Ok(CacheResult::from_network(response))
  }

  /// Fetch from the network, falling back to the dynamic store.
  ///
  /// 1. Fetch from network
  /// 2. On 200, write the response to the dynamic store
  /// 3. On network failure, return the dynamic store's entry (offline mode)
  /// 4. With nothing cached, the network error propagates
  pub async fn network_first<F, Fut>(
    &self,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    match fetcher().await {
      Ok(response) => {
        if response.is_cacheable() {
          self.storage.put(&self.names.dynamic, request, &response)?;
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => match self.storage.match_request(&self.names.dynamic, request)? {
        Some(cached) => {
          warn!(url = %request.url, error = %err, "network failed, serving cached response");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        None => Err(err),
      },
    }
  }

  /// Serve the cached response at once while refreshing it in the background.
  ///
  /// The revalidation fetch is spawned before the cache is consulted and is
  /// never awaited when a cached response exists. Without one, the caller
  /// waits for the revalidation result instead.
  pub async fn stale_while_revalidate<F, Fut>(
    &self,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult<Response>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>> + Send + 'static,
  {
    let revalidation = self.spawn_revalidation(request.clone(), fetcher());

    match self.storage.match_any(request)? {
      Some(cached) => {
        debug!(url = %request.url, "serving stale response, revalidating");
        Ok(CacheResult::from_cache(cached.response, cached.cached_at, true))
      }
      None => {
        let response = revalidation
          .await
          .map_err(|e| eyre!("Revalidation of {} failed: {}", request.url, e))??;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  fn spawn_revalidation<Fut>(
    &self,
    request: Request,
    fetch: Fut,
  ) -> tokio::task::JoinHandle<Result<Response>>
  where
    Fut: Future<Output = Result<Response>> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    let store = self.names.dynamic.clone();

    tokio::spawn(async move {
      let response = match fetch.await {
        Ok(response) => response,
        Err(err) => {
          debug!(url = %request.url, error = %err, "revalidation fetch failed");
          return Err(err);
        }
      };

      if response.is_cacheable() {
        if let Err(err) = storage.put(&store, &request, &response) {
          warn!(url = %request.url, error = %err, "failed to store revalidated response");
        }
      }

      Ok(response)
    })
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::traits::CacheSource;
  use crate::db::Database;
  use crate::worker::manifest::Manifest;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use url::Url;

  fn layer() -> CacheLayer<SqliteStorage> {
    let storage = SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    CacheLayer::new(Arc::new(storage), Manifest::with_version("v1").store_names())
  }

  fn get(path: &str) -> Request {
    Request::get_path(&Url::parse("https://example.com").unwrap(), path).unwrap()
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let layer = layer();
    let request = get("/index.html");
    layer
      .storage()
      .put("static-v1", &request, &Response::ok("<html>"))
      .unwrap();

    let calls = AtomicUsize::new(0);
    let result = layer
      .cache_first(&request, || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(Response::ok("from network")) }
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"<html>");
  }

  #[tokio::test]
  async fn test_cache_first_miss_does_not_backfill() {
    let layer = layer();
    let request = get("/favicon.ico");

    let result = layer
      .cache_first(&request, || async { Ok(Response::ok("icon")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(layer.storage().match_any(&request).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_stores_ok_response() {
    let layer = layer();
    let request = get("/rest/v1/jobs");

    let result = layer
      .network_first(&request, || async { Ok(Response::ok("[1,2]")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"[1,2]");
    let cached = layer
      .storage()
      .match_request("dynamic-v1", &request)
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, result.data.body);
  }

  #[tokio::test]
  async fn test_network_first_does_not_store_errors() {
    let layer = layer();
    let request = get("/rest/v1/jobs");

    let result = layer
      .network_first(&request, || async { Ok(Response::new(500, "boom")) })
      .await
      .unwrap();

    assert_eq!(result.data.status, 500);
    assert!(layer.storage().match_any(&request).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_cache() {
    let layer = layer();
    let request = get("/rest/v1/jobs");
    layer
      .storage()
      .put("dynamic-v1", &request, &Response::ok("cached"))
      .unwrap();

    let result = layer
      .network_first(&request, || async { Err(eyre!("offline")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_without_cache_fails() {
    let layer = layer();

    let result = layer
      .network_first(&get("/rest/v1/jobs"), || async { Err(eyre!("offline")) })
      .await;

    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_does_not_wait_for_network() {
    let layer = layer();
    let request = get("/about");
    layer
      .storage()
      .put("dynamic-v1", &request, &Response::ok("old"))
      .unwrap();

    let result = tokio::time::timeout(
      Duration::from_millis(500),
      layer.stale_while_revalidate(&request, || async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Response::ok("new"))
      }),
    )
    .await
    .expect("served without waiting for the network")
    .unwrap();

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data.body, b"old");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_refreshes_cache() {
    let layer = layer();
    let request = get("/about");
    layer
      .storage()
      .put("dynamic-v1", &request, &Response::ok("old"))
      .unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    layer
      .stale_while_revalidate(&request, || async move {
        let _ = tx.send(());
        Ok(Response::ok("new"))
      })
      .await
      .unwrap();

    // Wait for the fetch to run, then give the write a moment to land
    rx.await.unwrap();
    for _ in 0..50 {
      let cached = layer
        .storage()
        .match_request("dynamic-v1", &request)
        .unwrap()
        .unwrap();
      if cached.response.body == b"new" {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("revalidated response was never stored");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_uses_network() {
    let layer = layer();
    let request = get("/about");

    let result = layer
      .stale_while_revalidate(&request, || async { Ok(Response::ok("fresh")) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"fresh");
    let cached = layer
      .storage()
      .match_request("dynamic-v1", &request)
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_propagates_failure() {
    let layer = layer();

    let result = layer
      .stale_while_revalidate(&get("/about"), || async { Err(eyre!("offline")) })
      .await;

    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_ignores_failure_when_cached() {
    let layer = layer();
    let request = get("/about");
    layer
      .storage()
      .put("dynamic-v1", &request, &Response::ok("old"))
      .unwrap();

    let result = layer
      .stale_while_revalidate(&request, || async { Err(eyre!("offline")) })
      .await
      .unwrap();

    assert_eq!(result.data.body, b"old");
  }
}
