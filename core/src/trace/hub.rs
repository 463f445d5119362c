//! In-memory ring buffer + live subscribers.

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::trace::TraceRecord;

/// Fanout hub for trace records.
///
/// - `emit(record)`: append to the ring buffer, fan out to subscriber queues.
///   Slow subscribers drop records; tracing never blocks the engine.
/// - `subscribe()`: returns `(snapshot, receiver)` so a live subscriber gets
///   history first, then the tail.
pub struct TraceHub {
    capacity: usize,
    queue_size: usize,
    buffer: Mutex<std::collections::VecDeque<TraceRecord>>,
    subscribers: Mutex<Vec<mpsc::Sender<TraceRecord>>>,
}

impl TraceHub {
    pub fn new(capacity: usize, queue_size: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue_size: queue_size.max(1),
            buffer: Mutex::new(std::collections::VecDeque::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn emit(&self, record: TraceRecord) {
        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(record.clone());
        }

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| {
            match tx.try_send(record.clone()) {
                Ok(()) => true,
                // Queue full: drop the record, keep the subscriber
                Err(mpsc::error::TrySendError::Full(_)) => true,
                // Receiver gone: drop the subscriber
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Current buffer snapshot plus a queue for future records. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self) -> (Vec<TraceRecord>, mpsc::Receiver<TraceRecord>) {
        let (tx, rx) = mpsc::channel(self.queue_size);
        let snapshot = {
            let buffer = self.buffer.lock();
            buffer.iter().cloned().collect()
        };
        self.subscribers.lock().push(tx);
        (snapshot, rx)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}
