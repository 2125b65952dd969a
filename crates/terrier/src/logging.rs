//! JSONL query logging on a background writer task, so the resolution path
//! never waits on file I/O.

use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Serialize)]
struct QueryLogEntry {
    ts: String,
    domain: String,
    #[serde(rename = "type")]
    query_type: String,
    rcode: u8,
    answers: u16,
    ms: u64,
}

pub struct QueryLogger {
    sender: mpsc::UnboundedSender<String>,
}

impl QueryLogger {
    /// Create a logger appending to `path`. Requires a tokio runtime; the
    /// writer task owns the file handle.
    pub fn new(path: &str) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let path = PathBuf::from(path);

        tokio::spawn(async move {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }

            let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
                Ok(f) => f,
                Err(e) => {
                    error!("Failed to open query log file {}: {}", path.display(), e);
                    return;
                }
            };

            while let Some(line) = receiver.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!("Failed to write to query log: {}", e);
                }
            }
        });

        Self { sender }
    }

    pub fn log(&self, domain: &str, query_type: &str, rcode: u8, answers: u16, elapsed_ms: u64) {
        let entry = QueryLogEntry {
            ts: Utc::now().to_rfc3339(),
            domain: domain.to_string(),
            query_type: query_type.to_string(),
            rcode,
            answers,
            ms: elapsed_ms,
        };

        match serde_json::to_string(&entry) {
            Ok(json) => {
                if self.sender.send(format!("{}\n", json)).is_err() {
                    debug!("Query log channel closed");
                }
            }
            Err(e) => debug!("Failed to serialize query log entry: {}", e),
        }
    }
}
