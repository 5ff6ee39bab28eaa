//! Local sinks for run lifecycle events.
//!
//! [`FileEventLog`] appends one JSON object per run event to a file so a
//! run's metrics survive without a subscriber attached. [`EventFanout`]
//! forwards each event to several publishers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BusError;
use crate::message::Message;
use crate::messages::events::{RunFinished, RunStarted};
use crate::messages::topics;
use crate::traits::EventPublisher;

#[derive(Serialize)]
struct LogLine {
    topic: String,
    at: DateTime<Utc>,
    correlation_id: Uuid,
    event: serde_json::Value,
}

/// Append-only JSON-lines file of `exgraf.run.*` events.
///
/// Other topics are skipped. Each line is flushed before `publish` returns.
pub struct FileEventLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileEventLog {
    /// Open `path` for appending, creating it and its parent directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "appending run events to file");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn render(message: &Message) -> Result<Option<Vec<u8>>, BusError> {
        let event = match message.topic.as_str() {
            topics::RUN_STARTED => serde_json::to_value(message.decode::<RunStarted>()?)?,
            topics::RUN_FINISHED => serde_json::to_value(message.decode::<RunFinished>()?)?,
            _ => return Ok(None),
        };
        let mut line = serde_json::to_vec(&LogLine {
            topic: message.topic.clone(),
            at: message.timestamp,
            correlation_id: message.correlation_id,
            event,
        })?;
        line.push(b'\n');
        Ok(Some(line))
    }
}

#[async_trait]
impl EventPublisher for FileEventLog {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let Some(line) = Self::render(&message)? else {
            debug!(topic = %message.topic, "topic not logged to file");
            return Ok(());
        };
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Publishes every event to each inner publisher in turn.
///
/// A failing sink does not stop the others; the first error is returned
/// after all have been tried.
pub struct EventFanout {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl EventFanout {
    pub fn new(sinks: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventPublisher for EventFanout {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(message.clone()).await {
                warn!(error = %e, topic = %message.topic, "event sink failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
