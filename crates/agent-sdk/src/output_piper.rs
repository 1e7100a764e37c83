// OutputPiper: copies a child's stdout and stderr into one in-process sink.
//
// Descendants of the child inherit the output handles. When such a
// descendant outlives the child, the read side never reaches EOF, so closing
// must be able to stop the copy loops instead of waiting forever.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Size of each read from the child's output handles.
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// How long a graceful close waits for EOF before giving up.
const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a forced close still lets already-buffered output drain.
const FORCED_CLOSE_DRAIN: Duration = Duration::from_millis(100);

/// Destination for raw process output.
///
/// Implementations may wait for queue capacity but must not block beyond a
/// short enqueue; a full sink stalls the copy loop.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write_output(&self, data: &[u8]) -> std::io::Result<usize>;
}

/// Bridges one or more output handles to a single sink.
pub struct OutputPiper {
    copiers: Vec<JoinHandle<u64>>,
    stop: CancellationToken,
}

impl OutputPiper {
    pub fn new() -> Self {
        Self {
            copiers: Vec::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Start a copy loop from `reader` into `sink`.
    pub fn attach<R>(&mut self, reader: R, sink: Arc<dyn OutputSink>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let stop = self.stop.clone();
        self.copiers.push(tokio::spawn(copy_loop(reader, sink, stop)));
    }

    /// Close the piper.
    ///
    /// A graceful close waits for every handle to reach EOF (bounded by a
    /// timeout). A forced close only allows a short drain window, for when
    /// leftover writers are suspected to hold the handles open.
    ///
    /// Returns the total number of bytes copied.
    pub async fn close(self, force: bool) -> u64 {
        let wait = if force {
            FORCED_CLOSE_DRAIN
        } else {
            GRACEFUL_CLOSE_TIMEOUT
        };

        let stop = self.stop.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            stop.cancel();
        });

        let mut total = 0;
        for copier in self.copiers {
            total += copier.await.unwrap_or(0);
        }
        timer.abort();
        total
    }
}

impl Default for OutputPiper {
    fn default() -> Self {
        Self::new()
    }
}

async fn copy_loop<R>(mut reader: R, sink: Arc<dyn OutputSink>, stop: CancellationToken) -> u64
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let read = tokio::select! {
            result = reader.read(&mut buffer) => result,
            _ = stop.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                copied += n as u64;
                if let Err(e) = sink.write_output(&buffer[..n]).await {
                    tracing::debug!("Output sink rejected {} bytes: {}", n, e);
                }
            }
            Err(e) => {
                tracing::debug!("Output pipe read failed: {}", e);
                break;
            }
        }
    }
    copied
}
