//! Real-time replay of recorded RTP streams.
//!
//! A VOD session reads the blocks of one recording execution from a [`BlockStore`],
//! paces the contained packets against the wall clock and hands them to a
//! [`PacketSink`], usually the session's [`PlayerFanout`]. Each session runs three
//! pipeline threads (block reader, pacer, broadcaster) and a command actor that owns
//! the session state and serializes the stop transition.

use std::borrow::Cow;

use thiserror::Error;

mod config;
mod fanout;
mod file_store;
pub mod pacing;
mod producer;
mod queue;
mod registry;
pub mod sdp;
mod session;
mod storage;

pub use config::VodConfig;
pub use fanout::PlayerFanout;
pub use file_store::{ExecutionWriter, FileBlockStore};
pub use pacing::{MAX_SCALE, PacingCursor, PacingRules, PacingState, Verdict};
pub use queue::{DeliveryQueue, Enqueue, PacketSink};
pub use registry::SessionRegistry;
pub use sdp::{SdpError, TrackDescriptor, TrackSet};
pub use session::{PendingSession, Session, SessionHandle, SessionInfo, SessionState, VodRequest};
pub use storage::{
    Block, BlockMeta, BlockStore, ExecutionRef, MemoryBlockStore, StorageError, StorageResult,
    TaskExecution,
};

pub use replay_rtp::{PacketKind, RtpInfo, RtpPacket};

#[derive(Error, Debug)]
pub enum VodError {
    #[error("Malformed session description: {0}")]
    SdpMalformed(#[from] SdpError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session {0} has stopped")]
    SessionStopped(String),

    #[error("Delivery queue of session {0} is closed")]
    QueueClosed(String),

    #[error("Scale {0} is outside of [-{max}, {max}]", max = MAX_SCALE)]
    ScaleOutOfRange(i32),

    #[error("Invalid configuration: {0}")]
    Config(Cow<'static, str>),

    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Serde/{0}")]
    Serde(#[from] serde_json::Error),
}
