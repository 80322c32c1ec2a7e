//! Outbound priority queue
//!
//! One crossbeam channel per priority level gives O(1) enqueue/dequeue and
//! multi-producer/multi-consumer semantics with FIFO order inside each
//! level. Dequeue scans levels strictly highest-first.
//!
//! Backpressure: past the high-watermark (and at the hard caps) the two
//! sheddable classes are rejected with `Overloaded`; control, voice, and
//! text are never rejected for backpressure alone.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, Priority};

/// An envelope staged for sending, with its resolved targets
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub envelope: Envelope,
    /// Peers this item should be sent to
    pub targets: Vec<crate::protocol::PeerId>,
    /// Queue class; defaults to the message kind's class
    pub priority: Priority,
}

impl OutboundItem {
    pub fn new(envelope: Envelope, targets: Vec<crate::protocol::PeerId>) -> Self {
        let priority = envelope.header.kind.priority();
        Self {
            envelope,
            targets,
            priority,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

struct Level {
    tx: Sender<OutboundItem>,
    rx: Receiver<OutboundItem>,
    size: AtomicUsize,
}

impl Level {
    fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            size: AtomicUsize::new(0),
        }
    }
}

/// Five-level strict priority queue with byte accounting
pub struct MessageQueue {
    levels: [Level; Priority::COUNT],
    bytes: AtomicUsize,
    config: QueueConfig,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            levels: [
                Level::new(),
                Level::new(),
                Level::new(),
                Level::new(),
                Level::new(),
            ],
            bytes: AtomicUsize::new(0),
            config,
        }
    }

    /// Enqueue an item at its priority class
    pub fn enqueue(&self, item: OutboundItem) -> Result<()> {
        let priority = item.priority;
        let item_bytes = item.envelope.wire_len();
        let total = self.len();
        let total_bytes = self.bytes.load(Ordering::Acquire);

        let at_hard_cap =
            total >= self.config.max_messages || total_bytes >= self.config.max_bytes;
        let over_watermark = total >= self.config.high_watermark;

        if priority.sheddable() && (at_hard_cap || over_watermark) {
            return Err(Error::Overloaded);
        }

        let level = &self.levels[priority.index()];
        level
            .tx
            .try_send(item)
            .map_err(|_| Error::InvalidState("queue channel closed".to_string()))?;
        level.size.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_add(item_bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Dequeue the highest-priority pending item
    pub fn dequeue(&self) -> Option<OutboundItem> {
        for level in &self.levels {
            match level.rx.try_recv() {
                Ok(item) => {
                    level.size.fetch_sub(1, Ordering::AcqRel);
                    self.bytes
                        .fetch_sub(item.envelope.wire_len(), Ordering::AcqRel);
                    return Some(item);
                }
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Disconnected) => continue,
            }
        }
        None
    }

    /// Total queued items across all levels
    pub fn len(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.size.load(Ordering::Acquire))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued items per level, highest priority first
    pub fn len_by_priority(&self) -> [usize; Priority::COUNT] {
        let mut out = [0; Priority::COUNT];
        for (i, level) in self.levels.iter().enumerate() {
            out[i] = level.size.load(Ordering::Acquire);
        }
        out
    }

    /// Total queued bytes
    pub fn queued_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }
}
