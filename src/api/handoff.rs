/// Bounded hand-off between bus workers and the publisher.
///
/// Bus workers never wait on the sink: when the queue is full the oldest
/// pending record is discarded to make room for the new one.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use super::{records::PackRecord, traits::PublishSink};

/// Producer side, cloned into every orchestrator.
#[derive(Clone)]
pub struct PublishQueue {
    sender: flume::Sender<PackRecord>,
    // Second receiver used only to evict the oldest record.
    evictor: flume::Receiver<PackRecord>,
    dropped: Arc<AtomicU64>,
}

impl PublishQueue {
    /// Create a queue holding at most `capacity` records.
    pub fn with_capacity(capacity: usize) -> (Self, flume::Receiver<PackRecord>) {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        let queue = Self {
            sender,
            evictor: receiver.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, receiver)
    }

    /// Enqueue without blocking.
    pub fn submit(&self, mut record: PackRecord) {
        loop {
            match self.sender.try_send(record) {
                Ok(()) => return,
                Err(flume::TrySendError::Full(returned)) => {
                    if let Ok(oldest) = self.evictor.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "Publish queue full, dropping pack {} record from {}",
                            oldest.address,
                            oldest.last_update.format(super::records::TIMESTAMP_FORMAT)
                        );
                    }
                    record = returned;
                }
                Err(flume::TrySendError::Disconnected(returned)) => {
                    log::warn!(
                        "Publisher has stopped, discarding pack {} record",
                        returned.address
                    );
                    return;
                }
            }
        }
    }

    /// Records discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

/// Drain the queue into `sink` until every producer is gone, then close the
/// sink. Returns the number of records delivered.
pub fn run_publisher(receiver: flume::Receiver<PackRecord>, mut sink: Box<dyn PublishSink>) -> u64 {
    let mut delivered = 0;
    while let Ok(record) = receiver.recv() {
        match sink.publish(&record) {
            Ok(()) => delivered += 1,
            Err(err) => log::warn!("Pack{}: publish failed: {err}", record.address),
        }
    }
    if let Err(err) = sink.close() {
        log::warn!("Closing publish sink failed: {err}");
    }
    log::info!("Publisher stopped after {delivered} records");
    delivered
}
