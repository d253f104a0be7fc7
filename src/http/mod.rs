//! Requests, responses and the network seam the worker fetches through.

pub mod client;
pub mod types;

use color_eyre::Result;
use std::future::Future;

pub use client::OriginClient;
pub use types::{Request, Response};

/// Anything that can carry a request to the origin.
///
/// `Err` means the request never produced a response (transport failure).
/// HTTP error statuses are returned as `Ok` responses.
pub trait Network: Send + Sync + 'static {
  fn fetch(&self, request: Request) -> impl Future<Output = Result<Response>> + Send;
}
