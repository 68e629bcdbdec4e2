use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::batch::{Batch, BatchId, BatchResult, ResultKind, ResultStatus};

pub const TOPIC_BATCH_CREATED: &str = "batchCreated";
pub const TOPIC_RESULT_UPDATED: &str = "resultUpdated";
pub const TOPIC_BATCH_COMPLETED: &str = "batchCompleted";

/// Best-effort push channel for batch progress. Implementations must not
/// block for long and must never fail the caller.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, topic: &str, payload: &Value);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BatchEvent {
    BatchCreated {
        batch_id: BatchId,
        total: usize,
        angle_count: usize,
        color_count: usize,
        created_at: DateTime<Utc>,
    },
    ResultUpdated {
        batch_id: BatchId,
        index: usize,
        #[serde(rename = "type")]
        kind: ResultKind,
        angle_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        color_key: Option<String>,
        status: ResultStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thumb_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
    BatchCompleted {
        batch_id: BatchId,
        total: usize,
        completed: usize,
        failed: usize,
        completed_at: DateTime<Utc>,
    },
}

impl BatchEvent {
    pub fn batch_created(batch: &Batch) -> Self {
        let color_count = batch
            .results
            .iter()
            .filter(|result| result.kind == ResultKind::Color)
            .count();
        Self::BatchCreated {
            batch_id: batch.id.clone(),
            total: batch.results.len(),
            angle_count: batch.results.len() - color_count,
            color_count,
            created_at: batch.created_at,
        }
    }

    pub fn result_updated(batch_id: &BatchId, result: &BatchResult) -> Self {
        Self::ResultUpdated {
            batch_id: batch_id.clone(),
            index: result.index,
            kind: result.kind,
            angle_key: result.angle_key.clone(),
            color_key: result.color_key.clone(),
            status: result.status,
            image_url: result.image_url.clone(),
            thumb_url: result.thumb_url.clone(),
            error: result.error.clone(),
            job_id: result.job_id.clone(),
        }
    }

    /// Returns `None` until the batch has actually completed.
    pub fn batch_completed(batch: &Batch) -> Option<Self> {
        let completed_at = batch.completed_at?;
        let counts = batch.counts();
        Some(Self::BatchCompleted {
            batch_id: batch.id.clone(),
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed,
            completed_at,
        })
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Self::BatchCreated { .. } => TOPIC_BATCH_CREATED,
            Self::ResultUpdated { .. } => TOPIC_RESULT_UPDATED,
            Self::BatchCompleted { .. } => TOPIC_BATCH_COMPLETED,
        }
    }

    pub fn batch_id(&self) -> &BatchId {
        match self {
            Self::BatchCreated { batch_id, .. }
            | Self::ResultUpdated { batch_id, .. }
            | Self::BatchCompleted { batch_id, .. } => batch_id,
        }
    }

    pub fn publish_to(&self, sink: &dyn NotificationSink) {
        match serde_json::to_value(self) {
            Ok(payload) => sink.publish(self.topic(), &payload),
            Err(err) => {
                tracing::warn!(topic = self.topic(), error = %err, "event serialization failed")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn publish(&self, _topic: &str, _payload: &Value) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub topic: String,
    pub payload: Value,
}

const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// In-process fan-out to any number of subscribers. Slow subscribers lag and
/// lose the oldest messages; publishing with no subscribers drops the message.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, topic: &str, payload: &Value) {
        let _ = self.sender.send(Notification {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
    }
}

#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for FanoutSink {
    fn publish(&self, topic: &str, payload: &Value) {
        for sink in &self.sinks {
            sink.publish(topic, payload);
        }
    }
}

/// Append-only `events.jsonl` log.
///
/// - default fields are `type`, `batch_id`, `ts`
/// - the event payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// `publish` only stamps and queues the line; a blocking writer thread owns
/// the file. Call [`JsonlSink::flush`] before reading the log back.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
    sender: mpsc::UnboundedSender<LogCommand>,
}

#[derive(Debug)]
enum LogCommand {
    Line(String),
    Flush(oneshot::Sender<()>),
}

impl JsonlSink {
    /// Starts the writer; must be called from within a tokio runtime.
    pub fn spawn(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let writer_path = path.clone();
        tokio::task::spawn_blocking(move || run_writer(&writer_path, receiver));
        Self { path, sender }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves once every line queued before this call has been written.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (done, written) = oneshot::channel();
        self.sender
            .send(LogCommand::Flush(done))
            .map_err(|_| anyhow::anyhow!("event log writer stopped"))?;
        written
            .await
            .map_err(|_| anyhow::anyhow!("event log writer stopped"))
    }
}

impl NotificationSink for JsonlSink {
    fn publish(&self, topic: &str, payload: &Value) {
        let line = match serde_json::to_string(&event_record(topic, payload)) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(topic, error = %err, "dropping event; not serializable");
                return;
            }
        };
        if self.sender.send(LogCommand::Line(line)).is_err() {
            tracing::warn!(
                path = %self.path.display(),
                topic,
                "dropping event; event log writer stopped"
            );
        }
    }
}

/// The object written for one event: defaults first, payload fields last.
pub fn event_record(topic: &str, payload: &Value) -> Value {
    let mut event = Map::new();
    event.insert("type".to_string(), Value::String(topic.to_string()));
    if let Some(batch_id) = payload.get("batchId").cloned() {
        event.insert("batch_id".to_string(), batch_id);
    }
    event.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(fields) = payload.as_object() {
        for (key, value) in fields {
            event.insert(key.clone(), value.clone());
        }
    }
    Value::Object(event)
}

fn run_writer(path: &Path, mut receiver: mpsc::UnboundedReceiver<LogCommand>) {
    let mut file: Option<File> = None;
    while let Some(command) = receiver.blocking_recv() {
        match command {
            LogCommand::Line(line) => {
                if let Err(err) = append_line(path, &mut file, &line) {
                    file = None;
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "dropping event; event log write failed"
                    );
                }
            }
            LogCommand::Flush(done) => {
                if let Some(file) = file.as_mut() {
                    let _ = file.flush();
                }
                let _ = done.send(());
            }
        }
    }
    tracing::debug!(path = %path.display(), "event log writer stopped");
}

fn append_line(path: &Path, file: &mut Option<File>, line: &str) -> std::io::Result<()> {
    if file.is_none() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        *file = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }
    let Some(handle) = file.as_mut() else {
        return Ok(());
    };
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
