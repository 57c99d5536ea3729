//! Progress reporting
//!
//! Engines call [`ProgressSink`] methods from worker tasks. Hosts that must
//! render from a single thread use [`EventQueue`]: workers enqueue
//! [`ProgressEvent`]s and one consumer drains the [`EventReceiver`].

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::TransferError;
use crate::transfer::state::TransferType;
use crate::transfer::TransferSummary;

/// Receiver of chunk and transfer lifecycle events. Must tolerate calls from many tasks.
pub trait ProgressSink: Send + Sync {
    /// Work is about to begin; `completed_bytes` were done by an earlier run
    fn on_transfer_start(&self, _transfer_type: TransferType, _total_bytes: u64, _completed_bytes: u64) {}

    fn on_chunk_start(&self, _index: usize, _size: u64) {}

    /// Cumulative bytes moved for the current attempt of chunk `index`
    fn on_chunk_progress(&self, _index: usize, _bytes_so_far: u64) {}

    fn on_chunk_complete(&self, _index: usize, _remote_tag: Option<&str>) {}

    fn on_chunk_error(&self, _index: usize, _error: &TransferError, _attempt: u32) {}

    fn on_transfer_complete(&self, _summary: &TransferSummary) {}
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {}

/// Owned copy of a sink call, safe to move across threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    TransferStarted {
        transfer_type: TransferType,
        total_bytes: u64,
        completed_bytes: u64,
    },
    ChunkStarted {
        index: usize,
        size: u64,
    },
    ChunkProgress {
        index: usize,
        bytes: u64,
    },
    ChunkCompleted {
        index: usize,
        remote_tag: Option<String>,
    },
    ChunkFailed {
        index: usize,
        kind: &'static str,
        message: String,
        attempt: u32,
    },
    TransferFinished {
        success: bool,
        bytes_transferred: u64,
        total_bytes: u64,
        duration: Duration,
        error: Option<String>,
    },
}

/// Producer half of the event queue; implements [`ProgressSink`]
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

/// Consumer half of the event queue
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl EventQueue {
    pub fn channel() -> (EventQueue, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventQueue { tx }, EventReceiver { rx })
    }

    fn push(&self, event: ProgressEvent) {
        // Receiver gone means nobody is rendering; events are advisory
        let _ = self.tx.send(event);
    }
}

impl EventReceiver {
    /// Next event, or `None` once every producer is dropped
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Everything queued right now, without waiting
    pub fn drain(&mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl ProgressSink for EventQueue {
    fn on_transfer_start(&self, transfer_type: TransferType, total_bytes: u64, completed_bytes: u64) {
        self.push(ProgressEvent::TransferStarted {
            transfer_type,
            total_bytes,
            completed_bytes,
        });
    }

    fn on_chunk_start(&self, index: usize, size: u64) {
        self.push(ProgressEvent::ChunkStarted { index, size });
    }

    fn on_chunk_progress(&self, index: usize, bytes_so_far: u64) {
        self.push(ProgressEvent::ChunkProgress {
            index,
            bytes: bytes_so_far,
        });
    }

    fn on_chunk_complete(&self, index: usize, remote_tag: Option<&str>) {
        self.push(ProgressEvent::ChunkCompleted {
            index,
            remote_tag: remote_tag.map(str::to_string),
        });
    }

    fn on_chunk_error(&self, index: usize, error: &TransferError, attempt: u32) {
        self.push(ProgressEvent::ChunkFailed {
            index,
            kind: error.kind(),
            message: error.to_string(),
            attempt,
        });
    }

    fn on_transfer_complete(&self, summary: &TransferSummary) {
        self.push(ProgressEvent::TransferFinished {
            success: summary.is_success(),
            bytes_transferred: summary.bytes_transferred,
            total_bytes: summary.total_bytes,
            duration: summary.duration,
            error: summary.error.as_ref().map(|e| e.to_string()),
        });
    }
}

/// Folds events into an overall byte position for rendering
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total_bytes: u64,
    settled_bytes: u64,
    in_flight: HashMap<usize, u64>,
    chunk_sizes: HashMap<usize, u64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes done: completed chunks plus the current attempt of in-flight chunks
    pub fn position(&self) -> u64 {
        self.settled_bytes + self.in_flight.values().sum::<u64>()
    }

    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TransferStarted {
                total_bytes,
                completed_bytes,
                ..
            } => {
                self.total_bytes = *total_bytes;
                self.settled_bytes = *completed_bytes;
                self.in_flight.clear();
            }
            ProgressEvent::ChunkStarted { index, size } => {
                self.chunk_sizes.insert(*index, *size);
                self.in_flight.insert(*index, 0);
            }
            ProgressEvent::ChunkProgress { index, bytes } => {
                self.in_flight.insert(*index, *bytes);
            }
            ProgressEvent::ChunkCompleted { index, .. } => {
                self.in_flight.remove(index);
                self.settled_bytes += self.chunk_sizes.get(index).copied().unwrap_or(0);
            }
            ProgressEvent::ChunkFailed { index, .. } => {
                self.in_flight.insert(*index, 0);
            }
            ProgressEvent::TransferFinished {
                bytes_transferred, ..
            } => {
                self.in_flight.clear();
                self.settled_bytes = *bytes_transferred;
            }
        }
    }
}
