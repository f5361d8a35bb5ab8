use bytes::{Buf, Bytes};
use tracing::warn;

use crate::{DecodeError, RTP_FIXED_HEADER_LENGTH, RtpInfo};

/// Size of the little-endian length that opens every block.
pub const BLOCK_HEADER_LENGTH: usize = 4;
/// Size of the little-endian length that opens every record.
pub const RECORD_HEADER_LENGTH: usize = 4;

/// Track a recorded packet was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Audio = 0,
    Video = 1,
    AudioControl = 2,
    VideoControl = 3,
}

impl PacketKind {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Audio),
            1 => Some(Self::Video),
            2 => Some(Self::AudioControl),
            3 => Some(Self::VideoControl),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One RTP packet extracted from a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub kind: PacketKind,
    /// The complete RTP packet, header included.
    pub data: Bytes,
    pub info: RtpInfo,
}

impl RtpPacket {
    pub fn payload_type(&self) -> u8 {
        self.info.payload_type
    }

    pub fn timestamp(&self) -> u32 {
        self.info.timestamp
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.info.payload_offset..self.info.payload_end]
    }
}

/// Returns the record region of a block, i.e. everything between the block header and the
/// length the header declares.
pub fn block_payload(block: &Bytes) -> Result<Bytes, DecodeError> {
    if block.len() < BLOCK_HEADER_LENGTH {
        return Err(DecodeError::ShortBlock {
            needed: BLOCK_HEADER_LENGTH,
            available: block.len(),
        });
    }

    let declared = read_u32_le(block) as usize;
    if declared < BLOCK_HEADER_LENGTH {
        return Err(DecodeError::ShortBlock {
            needed: BLOCK_HEADER_LENGTH,
            available: declared,
        });
    }
    if declared > block.len() {
        return Err(DecodeError::BlockOverrun {
            declared,
            available: block.len(),
        });
    }

    Ok(block.slice(BLOCK_HEADER_LENGTH..declared))
}

/// Appends one record wrapping `rtp` to `out`.
pub fn encode_record(out: &mut Vec<u8>, kind: PacketKind, rtp: &[u8]) {
    let body_len = (rtp.len() + 1) as u32;
    out.extend_from_slice(&body_len.to_le_bytes());
    out.push(kind.as_byte());
    out.extend_from_slice(rtp);
}

/// Wraps already encoded records into a block.
pub fn encode_block(records: &[u8]) -> Vec<u8> {
    let total = (BLOCK_HEADER_LENGTH + records.len()) as u32;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(records);
    out
}

fn read_u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Walks the records of a block payload.
///
/// Records that frame correctly but do not hold a valid RTP packet are skipped. A framing
/// error ends the walk: it is returned once and the remaining bytes are discarded.
#[derive(Debug, Clone, Default)]
pub struct RecordReader {
    remaining: Bytes,
}

impl RecordReader {
    pub fn new(payload: Bytes) -> Self {
        Self { remaining: payload }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &Bytes {
        &self.remaining
    }

    pub fn next_packet(&mut self) -> Result<Option<RtpPacket>, DecodeError> {
        while !self.remaining.is_empty() {
            let (kind, mut body) = match self.split_record() {
                Ok(record) => record,
                Err(e) => {
                    self.remaining.clear();
                    return Err(e);
                }
            };

            let rtp = body.split_off(1);
            let Some(info) = RtpInfo::parse(&rtp) else {
                let head = &rtp[..rtp.len().min(RTP_FIXED_HEADER_LENGTH)];
                warn!(?kind, bytes = ?head, "Skipping record without a valid RTP header");
                continue;
            };

            return Ok(Some(RtpPacket {
                kind,
                data: rtp,
                info,
            }));
        }

        Ok(None)
    }

    fn split_record(&mut self) -> Result<(PacketKind, Bytes), DecodeError> {
        let available = self.remaining.len();
        if available < RECORD_HEADER_LENGTH {
            return Err(DecodeError::ShortRecord {
                needed: RECORD_HEADER_LENGTH,
                available,
            });
        }

        let declared = read_u32_le(&self.remaining) as usize;
        if declared == 0 {
            return Err(DecodeError::EmptyRecord);
        }
        if declared > available - RECORD_HEADER_LENGTH {
            return Err(DecodeError::RecordOverrun {
                declared,
                available: available - RECORD_HEADER_LENGTH,
            });
        }

        let kind_byte = self.remaining[RECORD_HEADER_LENGTH];
        let kind = PacketKind::from_byte(kind_byte).ok_or(DecodeError::UnknownKind(kind_byte))?;

        self.remaining.advance(RECORD_HEADER_LENGTH);
        Ok((kind, self.remaining.split_to(declared)))
    }
}

impl Iterator for RecordReader {
    type Item = Result<RtpPacket, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RtpPacketBuilder;

    fn video(ts: u32) -> Vec<u8> {
        RtpPacketBuilder::new(96, 1).timestamp(ts).build(b"v")
    }

    #[test]
    fn empty_payload_yields_nothing() {
        let mut reader = RecordReader::new(Bytes::new());
        assert_eq!(reader.next_packet(), Ok(None));
    }

    #[test]
    fn yields_packets_in_order() {
        let mut records = Vec::new();
        encode_record(&mut records, PacketKind::Video, &video(1000));
        encode_record(
            &mut records,
            PacketKind::Audio,
            &RtpPacketBuilder::new(0, 2).timestamp(80).build(b"a"),
        );
        encode_record(&mut records, PacketKind::Video, &video(4600));

        let packets = RecordReader::new(Bytes::from(records))
            .collect::<Result<Vec<_>, _>>()
            .expect("well-formed records");

        let summary = packets
            .iter()
            .map(|p| (p.kind, p.payload_type(), p.timestamp()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (PacketKind::Video, 96, 1000),
                (PacketKind::Audio, 0, 80),
                (PacketKind::Video, 96, 4600),
            ]
        );
        assert_eq!(packets[1].payload(), b"a");
    }

    #[test]
    fn skips_records_that_are_not_rtp() {
        let mut records = Vec::new();
        encode_record(&mut records, PacketKind::Video, &[0x40, 0, 0]);
        encode_record(&mut records, PacketKind::Video, &video(9));

        let mut reader = RecordReader::new(Bytes::from(records));
        let packet = reader.next_packet().unwrap().expect("second record");
        assert_eq!(packet.timestamp(), 9);
        assert_eq!(reader.next_packet(), Ok(None));
    }

    #[test]
    fn record_length_past_end_is_an_error() {
        let mut records = Vec::new();
        encode_record(&mut records, PacketKind::Video, &video(1));
        records.truncate(records.len() - 3);

        let mut reader = RecordReader::new(Bytes::from(records));
        assert!(matches!(
            reader.next_packet(),
            Err(DecodeError::RecordOverrun { .. })
        ));
        assert!(reader.remaining().is_empty());
        assert!(reader.next().is_none());
    }

    #[test]
    fn zero_length_and_unknown_kind_are_errors() {
        let mut reader = RecordReader::new(Bytes::from_static(&[0, 0, 0, 0, 1]));
        assert_eq!(reader.next_packet(), Err(DecodeError::EmptyRecord));

        let mut reader = RecordReader::new(Bytes::from_static(&[1, 0, 0, 0, 9]));
        assert_eq!(reader.next_packet(), Err(DecodeError::UnknownKind(9)));
    }

    #[test]
    fn block_payload_respects_declared_length() {
        let mut records = Vec::new();
        encode_record(&mut records, PacketKind::Video, &video(1));
        let mut block = encode_block(&records);
        // trailing bytes past the declared length are ignored
        block.extend_from_slice(&[0xff; 6]);

        let payload = block_payload(&Bytes::from(block)).expect("valid block");
        assert_eq!(payload.as_ref(), records.as_slice());
    }

    #[test]
    fn block_length_past_end_is_an_error() {
        let mut block = encode_block(&[0; 16]);
        block.truncate(10);

        assert_eq!(
            block_payload(&Bytes::from(block)),
            Err(DecodeError::BlockOverrun {
                declared: 20,
                available: 10
            })
        );
        assert!(matches!(
            block_payload(&Bytes::from_static(&[1, 0])),
            Err(DecodeError::ShortBlock { .. })
        ));
    }
}
