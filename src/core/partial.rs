//! Scratch capture of bytes relayed to a streaming client.
//!
//! Every chunk forwarded on a stream is mirrored to `<dir>/<request id>.sse.partial`.
//! A clean finish removes the file; an abnormal end keeps it for inspection.

use crate::core::metrics::get_metrics;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

pub struct PartialRecorder {
    path: PathBuf,
    file: Option<File>,
}

impl PartialRecorder {
    /// Open a capture file for `request_id`. Returns `None` if the directory
    /// or file cannot be created; the stream proceeds without a capture.
    pub async fn create(dir: &Path, request_id: &str) -> Option<Self> {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!(dir = %dir.display(), "Failed to create partials dir: {}", e);
            return None;
        }
        let path = dir.join(format!("{request_id}.sse.partial"));
        match File::create(&path).await {
            Ok(file) => Some(Self {
                path,
                file: Some(file),
            }),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Failed to create partial file: {}", e);
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&mut self, chunk: &[u8]) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(chunk).await {
            tracing::warn!(path = %self.path.display(), "Partial write failed, disabling capture: {}", e);
            self.file = None;
        }
    }

    /// Finish the capture. `keep` retains the file and counts it.
    pub async fn finish(mut self, keep: bool) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        if keep {
            get_metrics().partial_writes.inc();
            tracing::info!(path = %self.path.display(), "Partial stream retained");
        } else if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!(path = %self.path.display(), "Failed to remove partial file: {}", e);
        }
    }
}
