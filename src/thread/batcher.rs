//! # Summary
//!
//! Coalesces outgoing Accept and AcceptAck traffic. Whatever is queued when
//! the flush loop wakes up is sent as a single `Batch` to every other
//! replica. Order is kept within a batch but not across batches; receivers
//! rely on the slot and ballot carried by each message.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::message;
use crate::shared::Sender;
use crate::thread::replica;

/// Flush statistics.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BatchStats {
    /// Batches sent
    pub batches: usize,

    /// Smallest batch, in messages
    pub min: usize,

    /// Largest batch, in messages
    pub max: usize,

    /// Messages sent across all batches
    pub total: usize,

    pub accepts: usize,

    pub acks: usize,
}

impl BatchStats {
    pub fn average(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.total as f64 / self.batches as f64
        }
    }

    fn record(&mut self, accepts: usize, acks: usize) {
        let size = accepts + acks;
        self.min = if self.batches == 0 { size } else { self.min.min(size) };
        self.max = self.max.max(size);
        self.batches += 1;
        self.total += size;
        self.accepts += accepts;
        self.acks += acks;
    }
}

pub struct Batcher {
    accept_tx: mpsc::UnboundedSender<message::Accept>,
    ack_tx: mpsc::UnboundedSender<message::AcceptAck>,
    stats: Arc<Mutex<BatchStats>>,
}

impl Batcher {
    /// Starts the flush loop on the current Tokio runtime. `delay` holds each
    /// flush back to let batches grow.
    pub fn spawn<T: Sender>(sender: Arc<T>, delay: Option<Duration>) -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(Mutex::new(BatchStats::default()));
        tokio::spawn(flush(accept_rx, ack_rx, sender, delay, stats.clone()));
        Batcher { accept_tx, ack_tx, stats }
    }

    pub fn send_accept(&self, accept: message::Accept) {
        self.accept_tx.send(accept)
            .expect("[INTERNAL ERROR]: batcher stopped");
    }

    pub fn send_ack(&self, ack: message::AcceptAck) {
        self.ack_tx.send(ack)
            .expect("[INTERNAL ERROR]: batcher stopped");
    }

    pub fn stats(&self) -> BatchStats {
        *self.stats.lock()
    }
}

async fn flush<T: Sender>(
    mut accept_rx: mpsc::UnboundedReceiver<message::Accept>,
    mut ack_rx: mpsc::UnboundedReceiver<message::AcceptAck>,
    sender: Arc<T>,
    delay: Option<Duration>,
    stats: Arc<Mutex<BatchStats>>,
) {
    loop {
        let mut batch = message::Batch::default();

        // Block until there is at least one message
        tokio::select! {
            accept = accept_rx.recv() => match accept {
            | Some(accept) => batch.accepts.push(accept),
            | None => break,
            },
            ack = ack_rx.recv() => match ack {
            | Some(ack) => batch.acks.push(ack),
            | None => break,
            },
        }

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        while let Ok(accept) = accept_rx.try_recv() {
            batch.accepts.push(accept);
        }
        while let Ok(ack) = ack_rx.try_recv() {
            batch.acks.push(ack);
        }

        stats.lock().record(batch.accepts.len(), batch.acks.len());
        trace!("flushing batch of {} accepts and {} acks", batch.accepts.len(), batch.acks.len());
        sender.send_to_all(replica::In::Batch(batch));
    }
    debug!("batcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientId, CommandId, ReplicaId};
    use crate::thread::client;

    #[derive(Default)]
    struct Collect(Mutex<Vec<message::Batch>>);

    impl Sender for Collect {
        fn send_to_all(&self, message: replica::In) {
            if let replica::In::Batch(batch) = message {
                self.0.lock().push(batch);
            }
        }

        fn send_to(&self, _: ReplicaId, _: replica::In) {}

        fn send_to_client(&self, _: ClientId, _: client::In) {}
    }

    fn accept(slot: usize) -> message::Accept {
        message::Accept {
            ballot: 0,
            cmd_id: CommandId { client_id: 1, seq_num: slot as u64 },
            slot,
            command: None,
            weak: false,
        }
    }

    #[tokio::test]
    async fn coalesces_interleaved_traffic() {
        let sender = Arc::new(Collect::default());
        let batcher = Batcher::spawn(sender.clone(), Some(Duration::from_millis(5)));

        for slot in 0..25 {
            batcher.send_accept(accept(slot));
            batcher.send_ack(message::AcceptAck { ballot: 0, slot, replica: 1 });
            if slot % 7 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while batcher.stats().total < 50 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let stats = batcher.stats();
        let batches = sender.0.lock();
        assert_eq!(batches.iter().map(message::Batch::len).sum::<usize>(), 50);
        assert_eq!(stats.total, 50);
        assert_eq!(stats.accepts, 25);
        assert_eq!(stats.acks, 25);
        assert_eq!(stats.batches, batches.len());
        assert!(stats.min as f64 <= stats.average());
        assert!(stats.average() <= stats.max as f64);

        // Order within each message kind survives batching
        let slots = batches.iter()
            .flat_map(|batch| batch.accepts.iter().map(|accept| accept.slot))
            .collect::<Vec<_>>();
        assert_eq!(slots, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn stats_track_extremes() {
        let mut stats = BatchStats::default();
        assert_eq!(stats.average(), 0.0);
        stats.record(3, 1);
        stats.record(1, 0);
        stats.record(2, 6);
        assert_eq!((stats.min, stats.max, stats.total, stats.batches), (1, 8, 13, 3));
        assert_eq!((stats.accepts, stats.acks), (6, 7));
    }
}
