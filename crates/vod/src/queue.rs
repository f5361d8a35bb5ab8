use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use flume::{Receiver, Sender, TrySendError};
use replay_rtp::RtpPacket;
use tracing::{info, trace, warn};

use crate::VodError;

/// Receives every packet a session forwards, in order.
///
/// Called from the session's broadcaster thread, so implementations should return
/// quickly; a slow sink only costs the session its delivery queue, never ingestion.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: RtpPacket);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The queue was full and the packet was discarded.
    Dropped,
}

/// Bounded hand-off between the pacer and the broadcaster that never blocks the pacer.
pub struct DeliveryQueue {
    id: String,
    tx: Sender<RtpPacket>,
    dropped: Arc<AtomicU64>,
}

impl DeliveryQueue {
    pub fn bounded(id: impl Into<String>, capacity: usize) -> (Self, Receiver<RtpPacket>) {
        let (tx, rx) = flume::bounded(capacity);
        (
            Self {
                id: id.into(),
                tx,
                dropped: Arc::default(),
            },
            rx,
        )
    }

    pub fn push(&self, packet: RtpPacket) -> Result<Enqueue, VodError> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(Enqueue::Queued),
            Err(TrySendError::Full(packet)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    id = %self.id,
                    seq = packet.info.sequence_number,
                    dropped,
                    "VOD queue full, drop packet"
                );
                Ok(Enqueue::Dropped)
            }
            Err(TrySendError::Disconnected(_)) => Err(VodError::QueueClosed(self.id.clone())),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub(crate) struct Broadcaster {
    pub id: String,
    pub rx: Receiver<RtpPacket>,
    pub sink: Arc<dyn PacketSink>,
}

impl Broadcaster {
    pub fn run(self) {
        let mut delivered = 0u64;

        // ends once the pacer drops its end of the queue
        for packet in self.rx.iter() {
            trace!(seq = packet.info.sequence_number, "Broadcasting packet");
            self.sink.deliver(packet);
            delivered += 1;
        }

        info!(id = %self.id, delivered, "VOD broadcast loop stop");
    }
}
