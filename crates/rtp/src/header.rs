pub const RTP_FIXED_HEADER_LENGTH: usize = 12;
pub const RTP_VERSION: u8 = 2;

/// Header fields of a single RTP packet (RFC 3550 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpInfo {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Offset of the first payload byte, past CSRCs and any header extension.
    pub payload_offset: usize,
    /// End of the payload, excluding trailing padding.
    pub payload_end: usize,
}

impl RtpInfo {
    /// Parses the header of `buf`, returning `None` if it is not a well-formed RTP packet.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < RTP_FIXED_HEADER_LENGTH {
            return None;
        }

        let first = buf[0];
        if first >> 6 != RTP_VERSION {
            return None;
        }

        let has_padding = first & 0x20 != 0;
        let has_extension = first & 0x10 != 0;
        let csrc_count = usize::from(first & 0x0f);

        let mut offset = RTP_FIXED_HEADER_LENGTH + csrc_count * 4;

        if has_extension {
            let ext = buf.get(offset..offset + 4)?;
            let words = usize::from(u16::from_be_bytes([ext[2], ext[3]]));
            offset += 4 + words * 4;
        }

        if offset > buf.len() {
            return None;
        }

        let mut payload_end = buf.len();
        if has_padding {
            let padding = usize::from(buf[payload_end - 1]);
            if padding == 0 || offset + padding > payload_end {
                return None;
            }
            payload_end -= padding;
        }

        Some(Self {
            marker: buf[1] & 0x80 != 0,
            payload_type: buf[1] & 0x7f,
            sequence_number: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            payload_offset: offset,
            payload_end,
        })
    }
}

/// Serializes minimal RTP packets (no CSRCs, extension or padding).
///
/// Used when synthesizing recordings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpPacketBuilder {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
}

impl RtpPacketBuilder {
    pub fn new(payload_type: u8, ssrc: u32) -> Self {
        Self {
            payload_type,
            ssrc,
            ..Default::default()
        }
    }

    pub fn sequence_number(mut self, sequence_number: u16) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_FIXED_HEADER_LENGTH + payload.len());
        out.push(RTP_VERSION << 6);
        out.push((u8::from(self.marker) << 7) | (self.payload_type & 0x7f));
        out.extend_from_slice(&self.sequence_number.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}
