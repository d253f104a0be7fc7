//! HTTP interception point: every request the page sends passes through here.

use axum::{
  body::{Body, Bytes},
  extract::State,
  http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
  response::{IntoResponse, Response as HttpResponse},
  routing::{get, post},
  Json, Router,
};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use url::Url;

use crate::cache::{CacheResult, CacheStorage};
use crate::http::types::is_hop_by_hop;
use crate::http::{Network, Request, Response};
use crate::perf::{PerfMessage, PerfMonitor};
use crate::sync::{BackgroundSync, SubmitOutcome};
use crate::worker::ServiceWorker;

/// Header telling the page where a response came from.
pub const SOURCE_HEADER: &str = "x-swcache-source";
/// When a response served from a store was written to it (RFC 3339).
pub const CACHED_AT_HEADER: &str = "x-swcache-cached-at";

pub struct AppState<S: CacheStorage, N: Network> {
  pub worker: ServiceWorker<S, N>,
  pub sync: Arc<BackgroundSync<N>>,
  pub perf: PerfMonitor,
  pub origin: Url,
}

#[derive(Serialize)]
struct StoreInfo {
  name: String,
  entries: usize,
}

pub fn router<S: CacheStorage, N: Network>(state: Arc<AppState<S, N>>) -> Router {
  Router::new()
    .route("/__swcache/caches", get(caches_handler::<S, N>))
    .route("/__swcache/sync", post(sync_handler::<S, N>))
    .route("/__swcache/perf", post(perf_handler::<S, N>))
    .fallback(proxy_handler::<S, N>)
    .with_state(state)
}

pub async fn serve<S: CacheStorage, N: Network>(
  state: Arc<AppState<S, N>>,
  listen: SocketAddr,
) -> Result<()> {
  let listener = TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!("Proxying {} on {}", state.origin, listen);

  axum::serve(listener, router(state))
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Server error: {}", e))?;

  info!("Server shut down");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      warn!("Failed to listen for Ctrl-C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        warn!("Failed to listen for SIGTERM: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
}

async fn proxy_handler<S: CacheStorage, N: Network>(
  State(state): State<Arc<AppState<S, N>>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> HttpResponse {
  let request = match build_request(&state.origin, &method, &uri, &headers, body) {
    Ok(request) => request,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  if state.sync.is_form_submission(&request) {
    return match state.sync.submit(request).await {
      Ok(SubmitOutcome::Sent(response)) => into_http(CacheResult::from_network(response)),
      Ok(SubmitOutcome::Queued { id }) => {
        (StatusCode::ACCEPTED, Json(json!({ "queued": true, "id": id }))).into_response()
      }
      Err(e) => internal_error(e),
    };
  }

  let url = request.url.clone();
  match state.worker.handle_fetch(request).await {
    Ok(out) => into_http(out.result),
    Err(e) => {
      warn!(%url, error = %e, "fetch failed with nothing cached");
      (StatusCode::BAD_GATEWAY, format!("Failed to fetch {}: {}", url, e)).into_response()
    }
  }
}

async fn caches_handler<S: CacheStorage, N: Network>(
  State(state): State<Arc<AppState<S, N>>>,
) -> HttpResponse {
  let storage = state.worker.storage();
  let stores = storage.keys().and_then(|names| {
    names
      .into_iter()
      .map(|name| -> Result<StoreInfo> {
        let entries = storage.urls(&name)?.len();
        Ok(StoreInfo { name, entries })
      })
      .collect::<Result<Vec<_>>>()
  });

  match stores {
    Ok(stores) => Json(stores).into_response(),
    Err(e) => internal_error(e),
  }
}

async fn sync_handler<S: CacheStorage, N: Network>(
  State(state): State<Arc<AppState<S, N>>>,
) -> HttpResponse {
  match state.sync.on_sync(state.sync.tag()).await {
    Ok(report) => Json(report).into_response(),
    Err(e) => internal_error(e),
  }
}

async fn perf_handler<S: CacheStorage, N: Network>(
  State(state): State<Arc<AppState<S, N>>>,
  body: Bytes,
) -> HttpResponse {
  let message = match PerfMessage::parse(&body) {
    Ok(message) => message,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  match state.perf.dispatch(message).await {
    Ok(Some(report)) => Json(report).into_response(),
    Ok(None) => Json(json!({ "ok": true })).into_response(),
    Err(e) => internal_error(e),
  }
}

fn internal_error(e: color_eyre::Report) -> HttpResponse {
  warn!(error = %e, "request failed");
  (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn build_request(
  origin: &Url,
  method: &Method,
  uri: &Uri,
  headers: &HeaderMap,
  body: Bytes,
) -> Result<Request> {
  let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
  let url = origin
    .join(path)
    .map_err(|e| eyre!("Invalid request path {}: {}", path, e))?;

  let headers = headers
    .iter()
    .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect();

  let request = Request::new(method.as_str(), url).with_headers(headers);
  Ok(if body.is_empty() {
    request
  } else {
    request.with_body(body.to_vec())
  })
}

fn into_http(result: CacheResult<Response>) -> HttpResponse {
  let response = result.data;
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let mut http = HttpResponse::new(Body::from(response.body));
  *http.status_mut() = status;

  let out = http.headers_mut();
  for (name, value) in &response.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      out.append(name, value);
    }
  }
  out.insert(
    HeaderName::from_static(SOURCE_HEADER),
    HeaderValue::from_static(result.source.as_str()),
  );
  if let Some(cached_at) = result.cached_at {
    if let Ok(value) = HeaderValue::from_str(&cached_at.to_rfc3339()) {
      out.insert(HeaderName::from_static(CACHED_AT_HEADER), value);
    }
  }

  http
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::SyncConfig;
  use crate::db::Database;
  use crate::http::testing::FakeNetwork;
  use crate::sync::SyncQueue;
  use crate::worker::{Manifest, Scope};

  fn state(network: Arc<FakeNetwork>) -> Arc<AppState<SqliteStorage, FakeNetwork>> {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let origin = Url::parse("https://example.com").unwrap();
    let worker = ServiceWorker::new(
      Arc::new(SqliteStorage::new(Arc::clone(&db))),
      Arc::clone(&network),
      Manifest::with_version("v1").with_assets(&["/"]),
      Scope::new(origin.clone(), "/"),
    )
    .unwrap();
    worker.activate().unwrap();

    let sync = BackgroundSync::new(SyncQueue::new(db), network, &SyncConfig::default());

    Arc::new(AppState {
      worker,
      sync: Arc::new(sync),
      perf: PerfMonitor::spawn(),
      origin,
    })
  }

  async fn body_string(response: HttpResponse) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
      .await
      .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
  }

  async fn call(
    state: &Arc<AppState<SqliteStorage, FakeNetwork>>,
    method: Method,
    uri: &'static str,
    body: &'static [u8],
  ) -> HttpResponse {
    proxy_handler(
      State(Arc::clone(state)),
      method,
      Uri::from_static(uri),
      HeaderMap::new(),
      Bytes::from_static(body),
    )
    .await
  }

  #[tokio::test]
  async fn test_proxy_marks_source() {
    let network = Arc::new(FakeNetwork::new());
    network.respond(
      "https://example.com/rest/v1/jobs?select=*",
      Response::ok("[]").with_header("content-type", "application/json"),
    );
    let state = state(Arc::clone(&network));

    let response = call(&state, Method::GET, "/rest/v1/jobs?select=*", b"").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[SOURCE_HEADER], "network");
    assert_eq!(response.headers()["content-type"], "application/json");
    assert!(response.headers().get(CACHED_AT_HEADER).is_none());
    assert_eq!(body_string(response).await, "[]");

    network.fail("https://example.com/rest/v1/jobs?select=*");
    let response = call(&state, Method::GET, "/rest/v1/jobs?select=*", b"").await;
    assert_eq!(response.headers()[SOURCE_HEADER], "offline");
    let cached_at = response.headers()[CACHED_AT_HEADER].to_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(cached_at).is_ok());
  }

  #[tokio::test]
  async fn test_unrecoverable_failure_is_bad_gateway() {
    let network = Arc::new(FakeNetwork::new());
    let state = state(network);

    let response = call(&state, Method::GET, "/rest/v1/courses", b"").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
  }

  #[tokio::test]
  async fn test_offline_form_post_is_queued() {
    let network = Arc::new(FakeNetwork::new());
    let state = state(network);

    let response = call(
      &state,
      Method::POST,
      "/rest/v1/contact_submissions",
      br#"{"name":"Ada"}"#,
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_string(response).await.contains("\"queued\":true"));
    assert_eq!(state.sync.queue().pending("contact-form").unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_perf_endpoint_rejects_unknown_type() {
    let state = state(Arc::new(FakeNetwork::new()));

    let bad = perf_handler(State(Arc::clone(&state)), Bytes::from_static(br#"{"type":"nope"}"#)).await;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    let ok = perf_handler(State(Arc::clone(&state)), Bytes::from_static(br#"{"type":"get-report"}"#)).await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert!(body_string(ok).await.contains("\"running\":false"));
  }

  #[tokio::test]
  async fn test_caches_endpoint_lists_stores() {
    let state = state(Arc::new(FakeNetwork::new()));

    let response = caches_handler(State(Arc::clone(&state))).await;
    let body = body_string(response).await;
    assert!(body.contains("static-v1"));
    assert!(body.contains("dynamic-v1"));
  }
}
