//! Framing and header parsing for RTP packets stored in recorded blocks.
//!
//! A recorded block is a length-prefixed buffer holding a sequence of records, each of
//! which wraps one RTP packet together with the track kind it was captured from.
//! [`RecordReader`] walks those records and yields [`RtpPacket`]s, and
//! [`RtpTimeDuration`] converts RTP timestamps back into playback time.

mod duration;
mod header;
mod record;

pub use duration::*;
pub use header::*;
pub use record::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Block header needs {needed} bytes but only {available} are present")]
    ShortBlock { needed: usize, available: usize },

    #[error("Block declares {declared} bytes but only {available} are present")]
    BlockOverrun { declared: usize, available: usize },

    #[error("Record header needs {needed} bytes but only {available} remain")]
    ShortRecord { needed: usize, available: usize },

    #[error("Record declares {declared} bytes but only {available} remain")]
    RecordOverrun { declared: usize, available: usize },

    #[error("Record declares an empty body")]
    EmptyRecord,

    #[error("Unknown record kind {0}")]
    UnknownKind(u8),
}
