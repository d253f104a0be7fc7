//! Performance sample aggregation off the request path.
//!
//! A single task owns the ring buffer; everything else talks to it through
//! [`PerfMonitor`]. Page-side messages arrive as JSON tagged by `type`.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Samples kept before the oldest is dropped.
pub const MAX_SAMPLES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
  /// Metric name, e.g. "lcp" or "fetch:/rest/v1/jobs"
  pub name: String,
  pub value: f64,
  #[serde(default = "Utc::now")]
  pub timestamp: DateTime<Utc>,
}

impl Sample {
  pub fn new(name: &str, value: f64) -> Self {
    Self {
      name: name.to_string(),
      value,
      timestamp: Utc::now(),
    }
  }
}

/// A message from the page. Unknown `type` values fail to parse.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PerfMessage {
  Start,
  Stop,
  AddSample { sample: Sample },
  GetReport,
}

impl PerfMessage {
  pub fn parse(json: &[u8]) -> Result<Self> {
    serde_json::from_slice(json).map_err(|e| eyre!("Invalid perf message: {}", e))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
  pub count: usize,
  pub mean: f64,
  pub min: f64,
  pub max: f64,
  pub last: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerfReport {
  pub running: bool,
  pub samples: usize,
  pub metrics: BTreeMap<String, MetricSummary>,
}

enum Command {
  Start,
  Stop,
  AddSample(Sample),
  GetReport(oneshot::Sender<PerfReport>),
}

/// Bounded sample buffer.
struct Sampler {
  running: bool,
  samples: VecDeque<Sample>,
}

impl Sampler {
  fn new() -> Self {
    Self {
      running: false,
      samples: VecDeque::with_capacity(MAX_SAMPLES),
    }
  }

  fn handle(&mut self, command: Command) {
    match command {
      Command::Start => {
        self.running = true;
        self.samples.clear();
      }
      Command::Stop => self.running = false,
      Command::AddSample(sample) => {
        if !self.running {
          debug!(name = %sample.name, "sampler stopped, sample dropped");
          return;
        }
        if self.samples.len() == MAX_SAMPLES {
          self.samples.pop_front();
        }
        self.samples.push_back(sample);
      }
      Command::GetReport(reply) => {
        let _ = reply.send(self.report());
      }
    }
  }

  fn report(&self) -> PerfReport {
    let mut metrics: BTreeMap<String, MetricSummary> = BTreeMap::new();

    for sample in &self.samples {
      metrics
        .entry(sample.name.clone())
        .and_modify(|m| {
          m.count += 1;
          m.mean += (sample.value - m.mean) / m.count as f64;
          m.min = m.min.min(sample.value);
          m.max = m.max.max(sample.value);
          m.last = sample.value;
        })
        .or_insert(MetricSummary {
          count: 1,
          mean: sample.value,
          min: sample.value,
          max: sample.value,
          last: sample.value,
        });
    }

    PerfReport {
      running: self.running,
      samples: self.samples.len(),
      metrics,
    }
  }
}

/// Handle to the sampler task.
#[derive(Clone)]
pub struct PerfMonitor {
  tx: mpsc::UnboundedSender<Command>,
}

impl PerfMonitor {
  /// Spawn the sampler task. It stops when the last handle is dropped.
  pub fn spawn() -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut sampler = Sampler::new();
      while let Some(command) = rx.recv().await {
        sampler.handle(command);
      }
    });

    Self { tx }
  }

  fn send(&self, command: Command) -> Result<()> {
    self
      .tx
      .send(command)
      .map_err(|_| eyre!("Perf sampler has stopped"))
  }

  pub fn start(&self) -> Result<()> {
    self.send(Command::Start)
  }

  pub fn stop(&self) -> Result<()> {
    self.send(Command::Stop)
  }

  pub fn add_sample(&self, sample: Sample) -> Result<()> {
    self.send(Command::AddSample(sample))
  }

  pub async fn report(&self) -> Result<PerfReport> {
    let (reply, rx) = oneshot::channel();
    self.send(Command::GetReport(reply))?;
    rx.await.map_err(|_| eyre!("Perf sampler dropped the report request"))
  }

  /// Apply a page message; `get-report` yields the report.
  pub async fn dispatch(&self, message: PerfMessage) -> Result<Option<PerfReport>> {
    match message {
      PerfMessage::Start => self.start()?,
      PerfMessage::Stop => self.stop()?,
      PerfMessage::AddSample { sample } => self.add_sample(sample)?,
      PerfMessage::GetReport => return self.report().await.map(Some),
    }
    Ok(None)
  }
}
