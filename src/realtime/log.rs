//! Per-call session log.
//!
//! Every wire message (both directions) is appended with an ISO-8601
//! timestamp. Writes are fire-and-forget from the caller's point of view; a
//! single writer task keeps entries ordered and un-interleaved, and the
//! termination routine flushes it with a bounded wait.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

enum LogOp {
    Line(String),
    Flush(oneshot::Sender<()>),
}

pub struct SessionLog {
    tx: mpsc::UnboundedSender<LogOp>,
    path: PathBuf,
}

impl SessionLog {
    /// Open the log file (creating parent directories) and start the writer.
    pub fn open(path: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(path.clone(), rx));
        Self { tx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one wire message; timestamped at enqueue time.
    pub fn record(&self, message: &str) {
        let line = format!("[{}] {}", Utc::now().to_rfc3339(), message);
        let _ = self.tx.send(LogOp::Line(line));
    }

    /// Wait until everything queued so far has hit the file, up to `timeout`.
    pub async fn flush(&self, timeout: Duration) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(LogOp::Flush(reply_tx)).is_err() {
            return;
        }
        if tokio::time::timeout(timeout, reply_rx).await.is_err() {
            warn!("Session log flush timed out");
        }
    }
}

async fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogOp>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            error!("Failed to create log directory {}: {e}", parent.display());
        }
    }
    let file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) => {
            error!("Failed to open session log {}: {e}", path.display());
            // Drain so senders never block on a dead log.
            while let Some(op) = rx.recv().await {
                if let LogOp::Flush(reply) = op {
                    let _ = reply.send(());
                }
            }
            return;
        }
    };
    let mut writer = tokio::io::BufWriter::new(file);

    while let Some(op) = rx.recv().await {
        match op {
            LogOp::Line(line) => {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!("Error writing to session log: {e}");
                }
                let _ = writer.write_all(b"\n").await;
            }
            LogOp::Flush(reply) => {
                if let Err(e) = writer.flush().await {
                    error!("Error flushing session log: {e}");
                }
                let _ = reply.send(());
            }
        }
    }
    let _ = writer.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let log = SessionLog::open(path.clone());
        log.record(r#"{"type":"session.update"}"#);
        log.record(r#"{"type":"input_audio_buffer.append"}"#);
        log.flush(Duration::from_secs(1)).await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("session.update"));
        assert!(lines[1].contains("input_audio_buffer.append"));
        // every line carries a timestamp prefix
        assert!(lines.iter().all(|l| l.starts_with('[')));
    }
}
