//! Background sync for form submissions that failed while offline.
//!
//! A submission that cannot reach the origin is stored in the queue and a
//! sync is registered for its tag. The scheduler fires the sync, retrying
//! with backoff while any submission still fails. Each submission leaves the
//! queue right after its own successful resend, so a retried sync never
//! sends it twice.

pub mod queue;

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::http::{Network, Request, Response};

pub use queue::{Submission, SyncQueue};

/// What happened to a form submission.
#[derive(Debug)]
pub enum SubmitOutcome {
  /// The origin answered
  Sent(Response),
  /// The origin was unreachable; the submission waits in the queue
  Queued { id: String },
}

/// Summary of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub tag: String,
  pub attempted: usize,
  pub flushed: usize,
  pub failed: usize,
}

impl SyncReport {
  pub fn has_failures(&self) -> bool {
    self.failed > 0
  }
}

/// Sends form submissions and flushes the queue when a sync fires.
pub struct BackgroundSync<N: Network> {
  queue: SyncQueue,
  network: Arc<N>,
  tag: String,
  form_path: String,
  registrations: Option<mpsc::UnboundedSender<String>>,
  // Held for a whole sync run so overlapping runs never resend the same entry
  flushing: Mutex<()>,
}

impl<N: Network> BackgroundSync<N> {
  pub fn new(queue: SyncQueue, network: Arc<N>, config: &SyncConfig) -> Self {
    Self {
      queue,
      network,
      tag: config.tag.clone(),
      form_path: config.form_path.clone(),
      registrations: None,
      flushing: Mutex::new(()),
    }
  }

  /// Send sync registrations to a scheduler.
  pub fn with_registrations(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
    self.registrations = Some(tx);
    self
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  /// Whether a request is a submission of the synced form.
  pub fn is_form_submission(&self, request: &Request) -> bool {
    request.method == "POST" && request.path() == self.form_path
  }

  /// Ask the scheduler to run a sync for this tag.
  pub fn register(&self) {
    match &self.registrations {
      Some(tx) => {
        if tx.send(self.tag.clone()).is_err() {
          warn!(tag = %self.tag, "sync scheduler is gone, registration dropped");
        }
      }
      None => debug!(tag = %self.tag, "no sync scheduler, registration dropped"),
    }
  }

  /// Register a sync when submissions are still queued, e.g. from a
  /// previous run. Returns whether a sync was registered.
  pub fn register_pending(&self) -> Result<bool> {
    if self.queue.pending(&self.tag)?.is_empty() {
      return Ok(false);
    }
    info!(tag = %self.tag, "pending submissions found, registering sync");
    self.register();
    Ok(true)
  }

  /// Try to send a submission now, queueing it if the origin is unreachable.
  pub async fn submit(&self, request: Request) -> Result<SubmitOutcome> {
    let submission = Submission::from_request(&self.tag, &request);

    match self.network.fetch(request).await {
      Ok(response) => {
        // A replay of a queued submission got through; the queued copy is done
        if response.is_success() && self.queue.remove(&submission.id)? {
          debug!(id = %submission.id, "queued copy dropped after replay");
        }
        Ok(SubmitOutcome::Sent(response))
      }
      Err(err) => {
        let mut submission = submission;
        submission.last_error = Some(err.to_string());
        if self.queue.enqueue(&submission)? {
          info!(id = %submission.id, tag = %self.tag, error = %err, "submission queued for background sync");
        } else {
          debug!(id = %submission.id, "submission already queued");
        }
        self.register();
        Ok(SubmitOutcome::Queued { id: submission.id })
      }
    }
  }

  /// Handle a sync event. Events for other tags are ignored.
  ///
  /// Submissions are resent one at a time, oldest first. A failure is
  /// recorded and the run moves on to the next submission.
  pub async fn on_sync(&self, tag: &str) -> Result<SyncReport> {
    let mut report = SyncReport {
      tag: tag.to_string(),
      ..SyncReport::default()
    };
    if tag != self.tag {
      debug!(tag, "ignoring sync for unknown tag");
      return Ok(report);
    }

    let _flushing = self.flushing.lock().await;
    for submission in self.queue.pending(tag)? {
      report.attempted += 1;

      let error = match self.network.fetch(submission.to_request()).await {
        Ok(response) if response.is_success() => None,
        Ok(response) => Some(format!("Origin answered {}", response.status)),
        Err(err) => Some(err.to_string()),
      };

      match error {
        None => {
          self.queue.remove(&submission.id)?;
          report.flushed += 1;
          debug!(id = %submission.id, "submission flushed");
        }
        Some(error) => {
          self.queue.record_failure(&submission.id, &error)?;
          report.failed += 1;
          warn!(id = %submission.id, %error, "submission resend failed");
        }
      }
    }

    info!(
      tag,
      attempted = report.attempted,
      flushed = report.flushed,
      failed = report.failed,
      "sync finished"
    );

    Ok(report)
  }
}

/// Fires registered syncs and retries them with exponential backoff.
pub struct SyncScheduler<N: Network> {
  sync: Arc<BackgroundSync<N>>,
  max_attempts: u32,
  backoff: Duration,
}

impl<N: Network> SyncScheduler<N> {
  pub fn new(sync: Arc<BackgroundSync<N>>, config: &SyncConfig) -> Self {
    Self {
      sync,
      max_attempts: config.max_attempts.max(1),
      backoff: Duration::from_secs(config.backoff_secs),
    }
  }

  /// Process registrations until every sender is dropped.
  pub async fn run(self, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(tag) = rx.recv().await {
      // One run flushes everything queued so far
      while rx.try_recv().is_ok() {}
      self.run_with_retry(&tag).await;
    }
  }

  /// Run a sync, retrying while submissions keep failing.
  pub async fn run_with_retry(&self, tag: &str) -> Option<SyncReport> {
    let mut delay = self.backoff;
    let mut last = None;

    for attempt in 1..=self.max_attempts {
      match self.sync.on_sync(tag).await {
        Ok(report) if !report.has_failures() => return Some(report),
        Ok(report) => {
          warn!(tag, attempt, failed = report.failed, "sync incomplete");
          last = Some(report);
        }
        Err(err) => warn!(tag, attempt, error = %err, "sync failed"),
      }

      if attempt < self.max_attempts {
        tokio::time::sleep(delay).await;
        delay *= 2;
      }
    }

    warn!(tag, "giving up on sync until the next registration");
    last
  }
}
