use std::sync::Arc;

use flume::{Receiver, Selector, Sender, TryRecvError};
use tracing::{debug, error, info};

use crate::{
    session::SessionHandle,
    storage::{Block, BlockMeta, BlockStore},
};

enum Handoff {
    Sent,
    PacerGone,
    Stop,
}

/// Reads the blocks of one execution in order and hands them to the pacer.
pub(crate) struct BlockProducer {
    pub id: String,
    pub store: Arc<dyn BlockStore>,
    pub start: BlockMeta,
    pub blocks_tx: Sender<Block>,
    /// Used to empty the block channel on shutdown so the pacer sees the closure sooner.
    pub blocks_drain: Receiver<Block>,
    pub stop_rx: Receiver<()>,
    pub session: SessionHandle,
}

impl BlockProducer {
    pub fn run(self) {
        let Self {
            id,
            store,
            start,
            blocks_tx,
            blocks_drain,
            stop_rx,
            session,
        } = self;

        let execution = start.execution;
        let mut block_id = start.id;
        // set once a stop has been requested from here; the next check then blocks
        let mut await_stop = false;

        loop {
            let stop = if await_stop {
                // the actor signals stop by disconnecting the channel
                let _ = stop_rx.recv();
                true
            } else {
                matches!(
                    stop_rx.try_recv(),
                    Ok(()) | Err(TryRecvError::Disconnected)
                )
            };

            if stop {
                break;
            }

            let meta = match store.fetch_block_meta(&execution, block_id) {
                Ok(meta) => meta,
                Err(e) => {
                    error!(
                        id = %id,
                        block_id,
                        task_id = %execution.task_id,
                        execute_id = execution.execute_id,
                        "Failed to fetch block: {e}"
                    );
                    return;
                }
            };
            debug!(?meta, "Read block info");

            block_id = meta.id + 1;
            info!(
                id = %id,
                task_id = %execution.task_id,
                execute_id = execution.execute_id,
                block_id = meta.id,
                "VOD read next block"
            );

            let data = match store.read_block_payload(&meta) {
                Ok(data) => data,
                Err(e) => {
                    error!(id = %id, block_id = meta.id, "Failed to read block data: {e}");
                    session.stop();
                    await_stop = true;
                    continue;
                }
            };

            let handoff = Selector::new()
                .send(&blocks_tx, Block { meta, data }, |res| match res {
                    Ok(()) => Handoff::Sent,
                    Err(_) => Handoff::PacerGone,
                })
                .recv(&stop_rx, |_| Handoff::Stop)
                .wait();

            match handoff {
                Handoff::Sent => {}
                Handoff::Stop => break,
                Handoff::PacerGone => {
                    // the pacer only exits early after requesting a stop itself
                    debug!(id = %id, "Pacer is gone, waiting for stop");
                    await_stop = true;
                }
            }
        }

        info!(id = %id, "VOD read block loop stop");
        drop(blocks_tx);
        let discarded = blocks_drain.drain().count();
        if discarded > 0 {
            debug!(id = %id, discarded, "Discarded unpaced blocks");
        }
    }
}
