//! Task Output Buffer
//!
//! Append-only byte sink for a task's combined stdout/stderr. A single
//! producer appends; any number of reader views replay from offset zero
//! and then await further bytes, and chunk channels deliver each write as
//! a discrete message. Sealing the buffer wakes every parked reader to
//! observe end-of-stream.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug)]
struct BufferState {
    data: Vec<u8>,
    sealed: bool,
    streams: Vec<UnboundedSender<Vec<u8>>>,
}

#[derive(Debug)]
struct BufferInner {
    state: Mutex<BufferState>,
    /// Bumped on every append and on seal; readers park on it.
    version: watch::Sender<u64>,
}

/// Fan-out output buffer with a single writer and independent readers.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<BufferInner>,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState {
                    data: Vec::new(),
                    sealed: false,
                    streams: Vec::new(),
                }),
                version,
            }),
        }
    }

    /// Append a chunk and wake parked readers. Writes after seal are
    /// discarded.
    pub fn write(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut state = self.inner.state.lock().expect("buffer lock poisoned");
            if state.sealed {
                debug!("write to sealed output buffer discarded");
                return;
            }
            state.data.extend_from_slice(chunk);
            state.streams.retain(|tx| tx.send(chunk.to_vec()).is_ok());
        }
        self.inner.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Seal the buffer: no further writes are accepted, chunk channels
    /// close, and parked readers wake to drain and observe end-of-stream.
    /// Idempotent.
    pub fn seal(&self) {
        {
            let mut state = self.inner.state.lock().expect("buffer lock poisoned");
            if state.sealed {
                return;
            }
            state.sealed = true;
            state.streams.clear();
        }
        self.inner.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.state.lock().expect("buffer lock poisoned").sealed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().expect("buffer lock poisoned").data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of everything written so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .state
            .lock()
            .expect("buffer lock poisoned")
            .data
            .clone()
    }

    /// A reader view that replays all bytes from offset zero.
    #[must_use]
    pub fn reader(&self) -> OutputReader {
        OutputReader {
            inner: Arc::clone(&self.inner),
            version: self.inner.version.subscribe(),
            offset: 0,
        }
    }

    /// A chunk channel: the bytes buffered so far arrive as the first
    /// message, then each write as its own message; closes on seal.
    #[must_use]
    pub fn stream(&self) -> UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().expect("buffer lock poisoned");
        if !state.data.is_empty() {
            let _ = tx.send(state.data.clone());
        }
        if !state.sealed {
            state.streams.push(tx);
        }
        rx
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, non-owning view over an [`OutputBuffer`] with its own offset.
/// Multiple views interleave without interfering.
#[derive(Debug)]
pub struct OutputReader {
    inner: Arc<BufferInner>,
    version: watch::Receiver<u64>,
    offset: usize,
}

impl OutputReader {
    /// The next unseen chunk, awaiting more bytes when drained. Returns
    /// `None` once the buffer is sealed and fully consumed.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        loop {
            {
                let state = self.inner.state.lock().expect("buffer lock poisoned");
                if self.offset < state.data.len() {
                    let chunk = state.data[self.offset..].to_vec();
                    self.offset = state.data.len();
                    return Some(chunk);
                }
                if state.sealed {
                    return None;
                }
            }
            // The watch channel tracks versions, so an append between the
            // check above and this await still resolves immediately.
            if self.version.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Drain the remaining bytes through end-of-stream.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Lossy UTF-8 convenience over [`Self::read_to_end`].
    pub async fn read_to_string(&mut self) -> String {
        String::from_utf8_lossy(&self.read_to_end().await).into_owned()
    }
}
