use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use std::collections::HashSet;

use super::manifest::Manifest;
use crate::http::Request;

/// Caching strategy applied to an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Strategy::CacheFirst => write!(f, "cache-first"),
      Strategy::NetworkFirst => write!(f, "network-first"),
      Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
    }
  }
}

/// Maps a request to a strategy: static assets, then API patterns, then the default.
#[derive(Debug, Clone)]
pub struct Classifier {
  static_paths: HashSet<String>,
  api_patterns: Vec<Regex>,
}

impl Classifier {
  pub fn new(manifest: &Manifest) -> Result<Self> {
    let api_patterns = manifest
      .api_patterns
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid API pattern {}: {}", p, e)))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      static_paths: manifest.assets.iter().cloned().collect(),
      api_patterns,
    })
  }

  /// Returns `None` for requests that are never intercepted (non-GET).
  pub fn classify(&self, request: &Request) -> Option<Strategy> {
    if !request.is_get() {
      return None;
    }

    let path = request.path();
    if self.static_paths.contains(path) {
      Some(Strategy::CacheFirst)
    } else if self.api_patterns.iter().any(|re| re.is_match(path)) {
      Some(Strategy::NetworkFirst)
    } else {
      Some(Strategy::StaleWhileRevalidate)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn classifier() -> Classifier {
    Classifier::new(&Manifest::with_version("v1")).unwrap()
  }

  fn request(method: &str, path: &str) -> Request {
    let url = Url::parse("https://example.com").unwrap().join(path).unwrap();
    Request::new(method, url)
  }

  #[test]
  fn test_static_assets_are_cache_first() {
    let c = classifier();
    assert_eq!(c.classify(&request("GET", "/")), Some(Strategy::CacheFirst));
    assert_eq!(
      c.classify(&request("GET", "/manifest.json")),
      Some(Strategy::CacheFirst)
    );
    // Query string does not affect the path match
    assert_eq!(
      c.classify(&request("GET", "/index.html?utm=x")),
      Some(Strategy::CacheFirst)
    );
  }

  #[test]
  fn test_api_paths_are_network_first() {
    let c = classifier();
    assert_eq!(
      c.classify(&request("GET", "/rest/v1/jobs?select=*")),
      Some(Strategy::NetworkFirst)
    );
    assert_eq!(
      c.classify(&request("GET", "/rest/v1/forum_posts")),
      Some(Strategy::NetworkFirst)
    );
    assert_eq!(
      c.classify(&request("GET", "/functions/v1/blogger-posts")),
      Some(Strategy::NetworkFirst)
    );
  }

  #[test]
  fn test_everything_else_is_stale_while_revalidate() {
    let c = classifier();
    assert_eq!(
      c.classify(&request("GET", "/academy")),
      Some(Strategy::StaleWhileRevalidate)
    );
    assert_eq!(
      c.classify(&request("GET", "/rest/v1/jobsearch")),
      Some(Strategy::StaleWhileRevalidate)
    );
    // Exact match only for static assets
    assert_eq!(
      c.classify(&request("GET", "/index.html/extra")),
      Some(Strategy::StaleWhileRevalidate)
    );
  }

  #[test]
  fn test_non_get_is_not_intercepted() {
    let c = classifier();
    assert_eq!(c.classify(&request("POST", "/rest/v1/jobs")), None);
    assert_eq!(c.classify(&request("DELETE", "/")), None);
  }

  #[test]
  fn test_static_match_wins_over_api_pattern() {
    let manifest = Manifest::with_version("v1").with_assets(&["/rest/v1/services"]);
    let c = Classifier::new(&manifest).unwrap();
    assert_eq!(
      c.classify(&request("GET", "/rest/v1/services")),
      Some(Strategy::CacheFirst)
    );
  }

  #[test]
  fn test_invalid_pattern_is_rejected() {
    let mut manifest = Manifest::with_version("v1");
    manifest.api_patterns.push("(".to_string());
    assert!(Classifier::new(&manifest).is_err());
  }
}
