//! Bounded chunk delivery between the stdout reader and the chat forwarder.
//!
//! The buffer never drops output: once the cap is reached the two oldest
//! chunks are concatenated to make room, trading granularity for memory.
//! End-of-stream is an explicit close, surfaced to readers as `None`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug)]
pub(crate) struct ChunkBuffer {
    cap: usize,
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Debug)]
struct Inner {
    chunks: VecDeque<String>,
    closed: bool,
}

impl ChunkBuffer {
    pub(crate) fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            cap: cap.max(2),
            inner: Mutex::new(Inner {
                chunks: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        })
    }

    pub(crate) fn push(&self, chunk: String) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            if inner.chunks.len() >= self.cap {
                // Coalesce the two oldest chunks instead of dropping output.
                if let Some(first) = inner.chunks.pop_front() {
                    if let Some(second) = inner.chunks.pop_front() {
                        let mut merged = first;
                        merged.push_str(&second);
                        inner.chunks.push_front(merged);
                    } else {
                        inner.chunks.push_front(first);
                    }
                }
            }
            inner.chunks.push_back(chunk);
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub(crate) fn pop_now(&self) -> Option<String> {
        self.inner.lock().unwrap().chunks.pop_front()
    }

    pub(crate) async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(chunk) = inner.chunks.pop_front() {
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().chunks.len()
    }
}

/// Lazy sequence of text chunks parsed from a handler's stdout. Finite:
/// ends when the process exits or the handler is terminated, and chunks are
/// consumed exactly once.
#[derive(Debug)]
pub struct OutputStream {
    buffer: Arc<ChunkBuffer>,
}

impl OutputStream {
    pub(crate) fn new(buffer: Arc<ChunkBuffer>) -> Self {
        Self { buffer }
    }

    /// Next chunk, waiting if none is buffered. `None` once the stream ends.
    pub async fn next(&mut self) -> Option<String> {
        self.buffer.pop().await
    }

    /// Next chunk only if one is already buffered.
    pub fn try_next(&mut self) -> Option<String> {
        self.buffer.pop_now()
    }

    pub async fn collect(mut self) -> String {
        let mut out = String::new();
        while let Some(chunk) = self.next().await {
            out.push_str(&chunk);
        }
        out
    }
}
