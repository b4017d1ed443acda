//! Durable JSON-lines stream writer.
//!
//! Producers push records into a bounded queue; a background task drains it
//! in batches (by count or by interval) and writes, flushes and syncs each
//! batch before taking the next. The file is truncated when the writer
//! starts.
//!
//! # Durability
//!
//! [`StreamWriter::close`] drops the queue's sender, waits for the task to
//! drain every pending line and returns only after the final `sync_data`.

use crate::error::{CrawlError, Result};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, instrument};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

pub struct StreamWriter {
    path: PathBuf,
    tx: mpsc::Sender<String>,
    task: JoinHandle<io::Result<u64>>,
}

impl StreamWriter {
    /// Truncate `path` and start the writer task.
    pub async fn start(path: &Path, queue_size: usize) -> Result<Self> {
        Self::with_batching(path, queue_size, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL).await
    }

    #[instrument(level = "info", skip_all, fields(path = %path.display(), queue_size, batch_size))]
    pub async fn with_batching(
        path: &Path,
        queue_size: usize,
        batch_size: usize,
        interval: Duration,
    ) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let task = tokio::spawn(drain(file, rx, batch_size.max(1), interval));
        info!("Stream writer started");
        Ok(Self {
            path: path.to_path_buf(),
            tx,
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one record. Waits while the queue is full.
    pub async fn send<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.tx
            .send(line)
            .await
            .map_err(|_| CrawlError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "stream writer stopped")))
    }

    /// Drain, sync and stop. Returns the number of lines written.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub async fn close(self) -> Result<u64> {
        drop(self.tx);
        let written = self.task.await.map_err(io::Error::other)??;
        info!(lines = written, "Stream writer closed");
        Ok(written)
    }
}

async fn drain(mut file: File, mut rx: mpsc::Receiver<String>, batch_size: usize, interval: Duration) -> io::Result<u64> {
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    let mut written = 0u64;
    let mut tick = time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(line) => {
                    batch.push(line);
                    if batch.len() >= batch_size {
                        written += write_batch(&mut file, &mut batch).await?;
                    }
                }
                None => {
                    written += write_batch(&mut file, &mut batch).await?;
                    return Ok(written);
                }
            },
            _ = tick.tick() => {
                written += write_batch(&mut file, &mut batch).await?;
            }
        }
    }
}

async fn write_batch(file: &mut File, batch: &mut Vec<String>) -> io::Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }
    let mut buf = String::with_capacity(batch.iter().map(|l| l.len() + 1).sum());
    for line in batch.iter() {
        buf.push_str(line);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    file.sync_data().await?;
    let n = batch.len() as u64;
    batch.clear();
    debug!(lines = n, "Batch synced");
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn close_drains_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl");
        let writer = StreamWriter::with_batching(&path, 4, 3, Duration::from_secs(60)).await.unwrap();
        for i in 0..10 {
            writer.send(&json!({"i": i})).await.unwrap();
        }
        assert_eq!(writer.close().await.unwrap(), 10);

        let text = std::fs::read_to_string(&path).unwrap();
        let got: Vec<i64> = text
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["i"].as_i64().unwrap())
            .collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn start_truncates_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "stale\nstale\n").unwrap();
        let writer = StreamWriter::start(&path, 8).await.unwrap();
        writer.send(&json!({"fresh": true})).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"fresh\":true}\n");
    }

    #[tokio::test]
    async fn interval_flushes_partial_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let writer = StreamWriter::with_batching(&path, 8, 100, Duration::from_millis(20)).await.unwrap();
        writer.send(&json!({"a": 1})).await.unwrap();
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
        writer.close().await.unwrap();
    }
}
