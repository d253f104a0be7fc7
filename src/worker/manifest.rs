//! Build-time cache version, static asset manifest and API patterns.

/// Version tag scoping every cache store of this build.
///
/// Set `SWCACHE_CACHE_VERSION` at compile time to roll the stores over.
pub const CACHE_VERSION: &str = match option_env!("SWCACHE_CACHE_VERSION") {
  Some(version) => version,
  None => "v1",
};

/// Paths pre-cached at install time and served cache-first.
pub const STATIC_ASSETS: &[&str] = &[
  "/",
  "/index.html",
  "/favicon.ico",
  "/manifest.json",
  "/placeholder.svg",
  "/images/hero-services.webp",
  "/images/hero-academy.webp",
];

/// Pathname patterns of data endpoints served network-first.
pub const API_PATTERNS: &[&str] = &[
  r"^/rest/v1/(services|courses|jobs|job_applications|forum_posts|forum_replies|ai_tools|blog_posts|profiles)(/|$)",
  r"^/functions/v1/(blogger-posts|imei-lookup)(/|$)",
];

/// Names of the two stores owned by one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
  pub static_store: String,
  pub dynamic: String,
}

impl StoreNames {
  pub fn contains(&self, name: &str) -> bool {
    name == self.static_store || name == self.dynamic
  }
}

/// Everything the worker needs to know about one deployment.
#[derive(Debug, Clone)]
pub struct Manifest {
  pub version: String,
  pub assets: Vec<String>,
  pub api_patterns: Vec<String>,
}

impl Manifest {
  /// The manifest compiled into this build.
  pub fn current() -> Self {
    Self::with_version(CACHE_VERSION)
  }

  pub fn with_version(version: &str) -> Self {
    Self {
      version: version.to_string(),
      assets: STATIC_ASSETS.iter().map(|s| s.to_string()).collect(),
      api_patterns: API_PATTERNS.iter().map(|s| s.to_string()).collect(),
    }
  }

  #[cfg(test)]
  pub fn with_assets(mut self, assets: &[&str]) -> Self {
    self.assets = assets.iter().map(|s| s.to_string()).collect();
    self
  }

  /// Store names derived from this manifest's version.
  pub fn store_names(&self) -> StoreNames {
    StoreNames {
      static_store: format!("static-{}", self.version),
      dynamic: format!("dynamic-{}", self.version),
    }
  }
}
