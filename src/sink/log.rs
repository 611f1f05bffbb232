//! Local append-only scrobble log

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use super::Sink;
use crate::config::LogFormat;
use crate::error::SinkError;
use crate::track::ScrobbleEvent;

/// Appends every scrobble to a local file, one entry per line.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    format: LogFormat,
    echo: bool,
    // Keeps lines whole if deliveries ever overlap.
    write_lock: Mutex<()>,
}

impl LogSink {
    #[must_use]
    pub fn new(path: PathBuf, format: LogFormat, echo: bool) -> Self {
        Self {
            path,
            format,
            echo,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render one log line (without the trailing newline).
    pub fn format_line(&self, event: &ScrobbleEvent) -> Result<String, SinkError> {
        match self.format {
            LogFormat::Jsonl => {
                serde_json::to_string(event).map_err(|e| SinkError::Serialize(e.to_string()))
            }
            LogFormat::Text => Ok(text_line(event)),
        }
    }
}

fn text_line(event: &ScrobbleEvent) -> String {
    let duration = event
        .duration_seconds
        .map_or_else(|| "?".to_string(), |d| d.to_string());
    format!(
        "{} | {} - {} [{}] ({}s watched of {}s)",
        event.scrobbled_at.to_rfc3339(),
        event.artist,
        event.title,
        event.player_name.as_deref().unwrap_or(event.player_id.as_str()),
        event.watched.as_secs(),
        duration
    )
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &ScrobbleEvent) -> Result<(), SinkError> {
        let mut line = self.format_line(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        if self.echo {
            info!(
                "[{}] Scrobbled: {} - {} ({} watched)",
                event.player_id, event.artist, event.title, event.watched
            );
        }

        Ok(())
    }
}
