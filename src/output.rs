//! Output capture for the job process.
//!
//! Both pipes of the child are read by their own task and funnelled into a
//! single recorder task. The recorder appends every chunk to the [`History`]
//! first and only then queues it for the live sink, so a slow or vanished
//! live consumer never holds up recording or the child.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Append-only record of everything the job printed.
///
/// One writer (the recorder task), any number of readers. Readers always see
/// whole chunks.
#[derive(Debug, Default)]
pub struct History {
    inner: RwLock<HistoryInner>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct HistoryInner {
    bytes: Vec<u8>,
    closed: bool,
}

/// A slice of history and where to resume reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryChunk {
    pub data: Vec<u8>,
    pub next_offset: usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes recorded so far.
    pub fn len(&self) -> usize {
        self.read().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producing run has finished.
    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Everything recorded from `offset` onward.
    ///
    /// An offset past the end yields no data and leaves the offset as is, so
    /// a reader that is ahead simply waits for the output to catch up.
    pub fn read_from(&self, offset: usize) -> HistoryChunk {
        let inner = self.read();
        let data = inner.bytes.get(offset..).map(<[u8]>::to_vec).unwrap_or_default();
        let next_offset = offset + data.len();
        HistoryChunk { data, next_offset }
    }

    /// Wait until there is output past `offset` or the history is closed.
    ///
    /// Returns `true` if new output is available.
    pub async fn wait_past(&self, offset: usize) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.read();
                if inner.bytes.len() > offset {
                    return true;
                }
                if inner.closed {
                    return false;
                }
            }

            notified.await;
        }
    }

    pub(crate) fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.write().bytes.extend_from_slice(data);
        self.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.write().closed = true;
        self.notify.notify_waiters();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HistoryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HistoryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Which pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Records job output into a shared [`History`].
#[derive(Debug, Clone)]
pub struct OutputRecorder {
    history: Arc<History>,
}

impl OutputRecorder {
    pub const fn new(history: Arc<History>) -> Self {
        Self { history }
    }

    /// Start pumping the given pipes.
    ///
    /// Returns the recording handle (await it to drain the pipes) and the
    /// live feed (drive it to forward output to a consumer).
    pub fn start<O, E>(&self, stdout: Option<O>, stderr: Option<E>) -> (Recording, LiveFeed)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<(Channel, Vec<u8>)>();
        let (live_tx, live_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(pump(Channel::Stdout, stdout, chunk_tx.clone())));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(pump(Channel::Stderr, stderr, chunk_tx.clone())));
        }
        drop(chunk_tx);

        let history = Arc::clone(&self.history);
        let recorder = tokio::spawn(async move {
            let mut live_open = true;
            while let Some((channel, chunk)) = chunk_rx.recv().await {
                trace!(channel = channel.as_str(), len = chunk.len(), "Recording output");
                history.append(&chunk);
                if live_open && live_tx.send(chunk).is_err() {
                    debug!("Live consumer gone, recording history only");
                    live_open = false;
                }
            }
        });

        (
            Recording {
                readers,
                recorder: Some(recorder),
            },
            LiveFeed { rx: live_rx },
        )
    }
}

/// Read `pipe` to EOF, sending each chunk on `tx`.
async fn pump<R>(channel: Channel, mut pipe: R, tx: mpsc::UnboundedSender<(Channel, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((channel, buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(channel = channel.as_str(), error = %e, "Failed to read job output");
                break;
            }
        }
    }
}

/// In-flight pipe readers and the recorder task.
#[derive(Debug)]
pub struct Recording {
    readers: Vec<JoinHandle<()>>,
    recorder: Option<JoinHandle<()>>,
}

impl Recording {
    /// Wait until both pipes hit EOF and every chunk is in the history.
    ///
    /// Cancel safe: if the future is dropped, a later call picks up where
    /// this one stopped.
    pub async fn drain(&mut self) {
        while let Some(reader) = self.readers.last_mut() {
            if let Err(e) = reader.await {
                warn!(error = %e, "Output reader task failed");
            }
            self.readers.pop();
        }
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.await {
                warn!(error = %e, "Output recorder task failed");
            }
            self.recorder = None;
        }
    }

    /// Stop reading; whatever was recorded so far stays in the history.
    pub fn abort(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        if let Some(recorder) = self.recorder.take() {
            recorder.abort();
        }
    }
}

/// Output queued for the live consumer.
#[derive(Debug)]
pub struct LiveFeed {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl LiveFeed {
    /// Forward queued output to `sink` until the recording ends.
    ///
    /// A failing sink stops forwarding; recording is unaffected.
    pub async fn forward_to<W>(mut self, sink: &mut W)
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        while let Some(chunk) = self.rx.recv().await {
            if let Err(e) = sink.write_all(&chunk).await {
                warn!(error = %e, "Live output consumer failed, dropping live stream");
                return;
            }
        }
        if let Err(e) = sink.flush().await {
            warn!(error = %e, "Failed to flush live output");
        }
    }
}
