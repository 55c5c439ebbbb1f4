use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::info;
use tokio::sync::broadcast;

use crate::clock::Clock;

/// How many operator log lines are retained for display.
pub const LOG_CAPACITY: usize = 100;

/// Bounded, FIFO-evicting operator log.
///
/// Every appended line is timestamped `[HH:MM:SS]` and mirrored onto a
/// broadcast channel so connected clients can tail the log live. Slow
/// subscribers lag and skip; they never block the writer.
pub struct LogSink {
    entries: Mutex<VecDeque<String>>,
    live: broadcast::Sender<String>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl LogSink {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (live, _) = broadcast::channel(64);
        LogSink {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            live,
            clock,
            capacity,
        }
    }

    pub fn push(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let entry = format!("[{}] {}", self.clock.now().format("%H:%M:%S"), message);
        info!("{}", message);

        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry.clone());
        // broadcast under the entries lock: `snapshot_and_subscribe` holds
        // the same lock, so every line lands in exactly one of the snapshot
        // and the live feed
        let _ = self.live.send(entry);
    }

    /// Retained lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.live.subscribe()
    }

    /// Snapshot plus a live receiver that starts right after it, with no
    /// line delivered through both.
    pub fn snapshot_and_subscribe(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        match self.entries.lock() {
            Ok(entries) => (entries.iter().cloned().collect(), self.live.subscribe()),
            Err(_) => (Vec::new(), self.live.subscribe()),
        }
    }

    #[cfg(test)]
    pub fn contains(&self, needle: &str) -> bool {
        self.snapshot().iter().any(|line| line.contains(needle))
    }
}
