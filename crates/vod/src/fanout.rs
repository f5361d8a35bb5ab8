use std::sync::atomic::{AtomicU64, Ordering};

use flume::{Receiver, Sender, TrySendError};
use indexmap::IndexMap;
use parking_lot::RwLock;
use replay_rtp::RtpPacket;
use tracing::{debug, info, warn};

use crate::queue::PacketSink;

struct Player {
    tx: Sender<RtpPacket>,
    dropped: AtomicU64,
}

/// Copies every delivered packet to each attached player.
///
/// Each player has its own bounded queue; a player that falls behind loses packets
/// without affecting the others, and players whose receiver is gone are detached.
pub struct PlayerFanout {
    default_queue_length: usize,
    players: RwLock<IndexMap<String, Player>>,
}

impl PlayerFanout {
    pub fn new(default_queue_length: usize) -> Self {
        Self {
            default_queue_length: default_queue_length.max(1),
            players: RwLock::default(),
        }
    }

    pub fn add_player(&self, id: impl Into<String>) -> Receiver<RtpPacket> {
        self.add_player_with_capacity(id, self.default_queue_length)
    }

    /// Attaches a player, replacing any player already attached under `id`.
    pub fn add_player_with_capacity(
        &self,
        id: impl Into<String>,
        capacity: usize,
    ) -> Receiver<RtpPacket> {
        let id = id.into();
        let (tx, rx) = flume::bounded(capacity.max(1));

        let mut players = self.players.write();
        if players
            .insert(
                id.clone(),
                Player {
                    tx,
                    dropped: AtomicU64::new(0),
                },
            )
            .is_some()
        {
            warn!(player = %id, "Replacing attached player");
        }
        info!(player = %id, players = players.len(), "Player attached");

        rx
    }

    pub fn remove_player(&self, id: &str) -> bool {
        let removed = self.players.write().shift_remove(id).is_some();
        if removed {
            info!(player = %id, "Player detached");
        }
        removed
    }

    pub fn player_count(&self) -> usize {
        self.players.read().len()
    }

    pub fn player_ids(&self) -> Vec<String> {
        self.players.read().keys().cloned().collect()
    }

    pub fn dropped(&self, id: &str) -> Option<u64> {
        self.players
            .read()
            .get(id)
            .map(|p| p.dropped.load(Ordering::Relaxed))
    }
}

impl PacketSink for PlayerFanout {
    fn deliver(&self, packet: RtpPacket) {
        let mut disconnected = vec![];

        {
            let players = self.players.read();
            for (id, player) in players.iter() {
                match player.tx.try_send(packet.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        player.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(player = %id, "Player queue full, drop packet");
                    }
                    Err(TrySendError::Disconnected(_)) => disconnected.push(id.clone()),
                }
            }
        }

        if disconnected.is_empty() {
            return;
        }

        let mut players = self.players.write();
        for id in disconnected {
            // only prune if it was not replaced in the meantime
            if players.get(&id).is_some_and(|p| p.tx.is_disconnected()) {
                players.shift_remove(&id);
                info!(player = %id, "Player disconnected");
            }
        }
    }
}
