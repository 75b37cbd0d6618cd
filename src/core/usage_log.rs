//! Buffered JSONL file writer with size-based rotation.
//!
//! Records are serialized on the caller's task and handed to a background
//! writer over a bounded channel, so a slow disk never blocks request
//! handling. A full channel drops the record with a warning.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

const FLUSH_BATCH: usize = 100;

enum WriterMsg {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Handle to a background JSONL writer.
#[derive(Clone)]
pub struct JsonlWriter {
    sender: mpsc::Sender<WriterMsg>,
    path: PathBuf,
}

impl JsonlWriter {
    /// Create the parent directory and spawn the writer task.
    pub async fn spawn(path: PathBuf, max_bytes: u64, buffer_size: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = open_append(&path).await?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);

        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let task_path = path.clone();
        tokio::spawn(async move {
            writer_task(receiver, task_path, file, size, max_bytes).await;
        });

        tracing::info!(path = %path.display(), "JSONL writer started");
        Ok(Self { sender, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one record (non-blocking).
    pub fn write<T: Serialize>(&self, record: &T) {
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = self.sender.try_send(WriterMsg::Line(line)) {
                    tracing::warn!(path = %self.path.display(), "Failed to queue JSONL record: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize JSONL record: {}", e),
        }
    }

    /// Wait until everything queued so far has reached the file.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WriterMsg::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

async fn writer_task(
    mut receiver: mpsc::Receiver<WriterMsg>,
    path: PathBuf,
    mut file: File,
    mut size: u64,
    max_bytes: u64,
) {
    let mut buffer: Vec<String> = Vec::with_capacity(FLUSH_BATCH);
    let mut flush_interval = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            msg = receiver.recv() => match msg {
                Some(WriterMsg::Line(line)) => {
                    buffer.push(line);
                    if buffer.len() >= FLUSH_BATCH {
                        flush_buffer(&path, &mut file, &mut size, max_bytes, &mut buffer).await;
                    }
                }
                Some(WriterMsg::Flush(ack)) => {
                    flush_buffer(&path, &mut file, &mut size, max_bytes, &mut buffer).await;
                    let _ = ack.send(());
                }
                None => {
                    flush_buffer(&path, &mut file, &mut size, max_bytes, &mut buffer).await;
                    break;
                }
            },
            _ = flush_interval.tick() => {
                flush_buffer(&path, &mut file, &mut size, max_bytes, &mut buffer).await;
            }
        }
    }

    tracing::info!(path = %path.display(), "JSONL writer task stopped");
}

async fn flush_buffer(
    path: &Path,
    file: &mut File,
    size: &mut u64,
    max_bytes: u64,
    buffer: &mut Vec<String>,
) {
    if buffer.is_empty() {
        return;
    }

    let mut output = String::new();
    for line in buffer.drain(..) {
        output.push_str(&line);
        output.push('\n');
    }

    if max_bytes > 0 && *size > 0 && *size + output.len() as u64 > max_bytes {
        match rotate(path).await {
            Ok(fresh) => {
                *file = fresh;
                *size = 0;
            }
            Err(e) => tracing::error!(path = %path.display(), "Failed to rotate JSONL file: {}", e),
        }
    }

    if let Err(e) = file.write_all(output.as_bytes()).await {
        tracing::error!(path = %path.display(), "Failed to write JSONL file: {}", e);
        return;
    }
    if let Err(e) = file.flush().await {
        tracing::error!(path = %path.display(), "Failed to flush JSONL file: {}", e);
    }
    *size += output.len() as u64;
}

/// Move `path` to `path.1` (replacing any previous rotation) and reopen.
async fn rotate(path: &Path) -> std::io::Result<File> {
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    tokio::fs::rename(path, PathBuf::from(rotated)).await?;
    open_append(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("usage.jsonl");
        let writer = JsonlWriter::spawn(path.clone(), 0, 16).await.unwrap();

        writer.write(&json!({"rid": "a", "status": 200}));
        writer.write(&json!({"rid": "b", "status": 503}));
        writer.flush().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["rid"], "a");
        assert_eq!(lines[1]["status"], 503);
    }

    #[tokio::test]
    async fn test_rotates_past_max_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.jsonl");
        let writer = JsonlWriter::spawn(path.clone(), 64, 16).await.unwrap();

        writer.write(&json!({"first": "x".repeat(40)}));
        writer.flush().await;
        writer.write(&json!({"second": "y".repeat(40)}));
        writer.flush().await;

        let rotated = dir.path().join("usage.jsonl.1");
        let old = tokio::fs::read_to_string(&rotated).await.unwrap();
        let current = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(old.contains("first"));
        assert!(current.contains("second"));
        assert!(!current.contains("first"));
    }
}
