use crate::config::Config;
use crate::http::types::{is_hop_by_hop, Request, Response};
use crate::http::Network;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;

/// HTTP client used to reach the upstream origin.
#[derive(Clone)]
pub struct OriginClient {
  client: reqwest::Client,
}

impl OriginClient {
  pub fn new(config: &Config) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.network.timeout_secs))
      .user_agent(concat!("swcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }

  async fn send(&self, request: Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    debug!(url = %request.url, status, bytes = body.len(), "origin response");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl Network for OriginClient {
  async fn fetch(&self, request: Request) -> Result<Response> {
    self.send(request).await
  }
}
