// LogStreamer: per-command output pipeline.
//
// Producers enqueue copies of their bytes onto a bounded queue. A single
// consumer task drains it in batches, injects timestamps, redacts sensitive
// values, appends to a local spool file and forwards each batch over the
// control plane's log stream. On finalize the spool is uploaded once more in
// full, then deleted.

use agent_common::{ControlPlane, Environment, LogStream, LogStreamError};
use agent_sdk::{OutputSink, StringUtil, TraceWriter};
use async_trait::async_trait;
use chrono::NaiveTime;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};

/// Slots in the ingestion queue.
pub const QUEUE_CAPACITY: usize = 128;

/// Upper bound of one coalesced batch.
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Source of the time printed in front of each line.
pub type Clock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().time())
}

#[derive(Clone)]
pub struct LogStreamerOptions {
    pub timestamps: bool,
    pub spool_directory: PathBuf,
    pub clock: Clock,
}

impl LogStreamerOptions {
    pub fn new(spool_directory: impl Into<PathBuf>, timestamps: bool) -> Self {
        Self {
            timestamps,
            spool_directory: spool_directory.into(),
            clock: system_clock(),
        }
    }
}

pub struct LogStreamer {
    command_name: String,
    /// `None` once finalized.
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    completed: watch::Receiver<bool>,
}

impl LogStreamer {
    /// Create the spool file and start the delivery task.
    ///
    /// Fails only if the spool file cannot be created.
    pub fn start(
        command_name: &str,
        control_plane: Arc<dyn ControlPlane>,
        environment: Environment,
        options: LogStreamerOptions,
        trace: Arc<dyn TraceWriter>,
    ) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&options.spool_directory)?;
        let spool = tempfile::Builder::new()
            .prefix(&format!("{}-", StringUtil::format_into_safe_filename(command_name)))
            .suffix(".log")
            .tempfile_in(&options.spool_directory)?;
        let (file, spool_path) = spool.into_parts();

        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let (done_tx, done_rx) = watch::channel(false);

        let pipeline = DeliveryPipeline {
            command_name: command_name.to_string(),
            control_plane,
            environment,
            trace,
            stamper: options
                .timestamps
                .then(|| TimestampInjector::new(Arc::clone(&options.clock))),
            spool: tokio::fs::File::from_std(file),
            spool_path,
            stream: None,
        };
        tokio::spawn(async move {
            pipeline.run(receiver).await;
            let _ = done_tx.send(true);
        });

        Ok(Arc::new(Self {
            command_name: command_name.to_string(),
            sender: Mutex::new(Some(sender)),
            completed: done_rx,
        }))
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Enqueue a copy of `data`. After [`LogStreamer::finalize`] this is a
    /// silent no-op.
    pub async fn write(&self, data: &[u8]) -> std::io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return Ok(data.len()),
        };
        // A send error means the pipeline is gone; the bytes are dropped.
        let _ = sender.send(data.to_vec()).await;
        Ok(data.len())
    }

    /// Write `message` followed by a newline.
    pub async fn write_line(&self, message: &str) {
        let _ = self.write(format!("{message}\n").as_bytes()).await;
    }

    pub fn is_finalized(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Close the queue and wait until the pipeline has drained it and
    /// uploaded the full log.
    pub async fn finalize(&self) {
        // Dropping the last sender closes the queue exactly once.
        drop(self.sender.lock().take());
        let mut completed = self.completed.clone();
        let _ = completed.wait_for(|done| *done).await;
    }
}

#[async_trait]
impl OutputSink for LogStreamer {
    async fn write_output(&self, data: &[u8]) -> std::io::Result<usize> {
        self.write(data).await
    }
}

/// Prefixes each line with `[HH:MM:SS.mmm] `.
///
/// `owe_timestamp` is true whenever the next byte starts a new line. Only the
/// delivery task holds an injector, so the flag has a single writer.
pub(crate) struct TimestampInjector {
    clock: Clock,
    owe_timestamp: bool,
}

impl TimestampInjector {
    pub(crate) fn new(clock: Clock) -> Self {
        Self {
            clock,
            owe_timestamp: true,
        }
    }

    pub(crate) fn apply(&mut self, chunk: &[u8]) -> Vec<u8> {
        let prefix = format!("[{}] ", (self.clock)().format("%H:%M:%S%.3f"));
        let mut out = Vec::with_capacity(chunk.len() + prefix.len());
        for line in chunk.split_inclusive(|b| *b == b'\n') {
            if self.owe_timestamp {
                out.extend_from_slice(prefix.as_bytes());
            }
            out.extend_from_slice(line);
            self.owe_timestamp = line.ends_with(b"\n");
        }
        out
    }
}

struct DeliveryPipeline {
    command_name: String,
    control_plane: Arc<dyn ControlPlane>,
    environment: Environment,
    trace: Arc<dyn TraceWriter>,
    stamper: Option<TimestampInjector>,
    spool: tokio::fs::File,
    spool_path: TempPath,
    stream: Option<Box<dyn LogStream>>,
}

impl DeliveryPipeline {
    async fn run(mut self, mut receiver: mpsc::Receiver<Vec<u8>>) {
        self.stream = self.open_stream().await;

        let mut carry: Option<Vec<u8>> = None;
        loop {
            let mut batch = match carry.take() {
                Some(chunk) => chunk,
                None => match receiver.recv().await {
                    Some(chunk) => self.stamp(&chunk),
                    None => break,
                },
            };
            while batch.len() < MAX_BATCH_BYTES {
                let Ok(chunk) = receiver.try_recv() else {
                    break;
                };
                let chunk = self.stamp(&chunk);
                if batch.len() + chunk.len() > MAX_BATCH_BYTES {
                    carry = Some(chunk);
                    break;
                }
                batch.extend_from_slice(&chunk);
            }

            let batch = self.environment.mask(&batch);
            if let Err(e) = self.spool.write_all(&batch).await {
                self.trace.warning(&format!(
                    "Failed to spool logs of '{}': {e}",
                    self.command_name
                ));
            }
            self.forward(&batch).await;
        }

        self.finish().await;
    }

    fn stamp(&mut self, chunk: &[u8]) -> Vec<u8> {
        match self.stamper.as_mut() {
            Some(stamper) => stamper.apply(chunk),
            None => chunk.to_vec(),
        }
    }

    async fn open_stream(&self) -> Option<Box<dyn LogStream>> {
        match self.control_plane.open_log_stream(&self.command_name).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                self.trace.warning(&format!(
                    "Failed to open log stream for '{}': {e}",
                    self.command_name
                ));
                None
            }
        }
    }

    async fn forward(&mut self, batch: &[u8]) {
        if self.stream.is_none() {
            self.stream = self.open_stream().await;
        }
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        match stream.send(batch).await {
            Ok(()) => {}
            Err(LogStreamError::EndOfStream) => {
                self.trace.info(&format!(
                    "Log stream of '{}' ended, reconnecting.",
                    self.command_name
                ));
                self.stream = self.open_stream().await;
                if let Some(stream) = self.stream.as_mut() {
                    if let Err(e) = stream.send(batch).await {
                        self.trace.warning(&format!(
                            "Failed to stream logs of '{}' after reconnect: {e}",
                            self.command_name
                        ));
                    }
                }
            }
            Err(e) => {
                self.trace.warning(&format!(
                    "Failed to stream logs of '{}': {e}",
                    self.command_name
                ));
            }
        }
    }

    async fn finish(mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close().await {
                self.trace.verbose(&format!(
                    "Failed to close log stream of '{}': {e}",
                    self.command_name
                ));
            }
        }

        if let Err(e) = self.spool.flush().await {
            self.trace
                .warning(&format!("Failed to flush spool of '{}': {e}", self.command_name));
        }
        drop(self.spool);

        match read_spool(&self.spool_path).await {
            Ok(content) => {
                if let Err(e) = self
                    .control_plane
                    .save_full_log(&self.command_name, content)
                    .await
                {
                    self.trace.warning(&format!(
                        "Failed to upload full log of '{}': {e}",
                        self.command_name
                    ));
                }
            }
            Err(e) => self.trace.warning(&format!(
                "Failed to read spool of '{}': {e}",
                self.command_name
            )),
        }

        if let Err(e) = self.spool_path.close() {
            self.trace.verbose(&format!("Failed to delete spool file: {e}"));
        }
    }
}

async fn read_spool(path: &Path) -> std::io::Result<Vec<u8>> {
    tokio::fs::read(path).await
}
