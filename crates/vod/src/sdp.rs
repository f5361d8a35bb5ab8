//! Track discovery from a recorded session description.
//!
//! Only what playback needs is extracted: the media type, `a=control` and codec of each
//! media section. Everything else in the description is carried verbatim as the raw text.

use thiserror::Error;
use tracing::{info, warn};

/// Number of audio tracks a session can carry.
pub const AUDIO_SLOTS: usize = 2;

pub const INVALID_CODEC: &str = "invalid codec";

const AUDIO_PLACEHOLDERS: [&str; AUDIO_SLOTS] = ["not set up audio 01", "not set up audio 02"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("Description does not start with a version line")]
    MissingVersion,

    #[error("Line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },

    #[error("Description declares more than {max} audio tracks", max = AUDIO_SLOTS)]
    TooManyAudioTracks,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    pub control: String,
    pub codec: String,
    pub clock_rate: Option<u32>,
}

impl TrackDescriptor {
    fn placeholder(slot: usize) -> Self {
        Self {
            control: AUDIO_PLACEHOLDERS[slot].to_string(),
            codec: INVALID_CODEC.to_string(),
            clock_rate: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSet {
    pub video: Option<TrackDescriptor>,
    pub audio: [TrackDescriptor; AUDIO_SLOTS],
    pub audio_count: usize,
}

impl Default for TrackSet {
    fn default() -> Self {
        Self {
            video: None,
            audio: [TrackDescriptor::placeholder(0), TrackDescriptor::placeholder(1)],
            audio_count: 0,
        }
    }
}

struct MediaSection {
    kind: String,
    first_format: String,
    control: Option<String>,
    rtpmap: Option<(String, Option<u32>)>,
}

impl MediaSection {
    fn into_descriptor(self) -> TrackDescriptor {
        let (codec, clock_rate) = match self.rtpmap {
            Some((name, rate)) => (name, rate),
            None => match static_payload_type(&self.first_format) {
                Some((name, rate)) => (name.to_string(), Some(rate)),
                None => (INVALID_CODEC.to_string(), None),
            },
        };

        TrackDescriptor {
            control: self.control.unwrap_or_default(),
            codec,
            clock_rate,
        }
    }
}

/// Codec names of the statically assigned RTP payload types (RFC 3551).
fn static_payload_type(format: &str) -> Option<(&'static str, u32)> {
    Some(match format.parse::<u8>().ok()? {
        0 => ("PCMU", 8000),
        3 => ("GSM", 8000),
        4 => ("G723", 8000),
        8 => ("PCMA", 8000),
        9 => ("G722", 8000),
        14 => ("MPA", 90_000),
        26 => ("JPEG", 90_000),
        32 => ("MPV", 90_000),
        33 => ("MP2T", 90_000),
        34 => ("H263", 90_000),
        _ => return None,
    })
}

impl TrackSet {
    pub fn from_sdp(raw: &str) -> Result<Self, SdpError> {
        let mut lines = raw
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());

        match lines.next() {
            Some((_, l)) if l.starts_with("v=") => {}
            _ => return Err(SdpError::MissingVersion),
        }

        let mut sections = Vec::<MediaSection>::new();

        for (index, line) in lines {
            let line_no = index + 1;
            let (kind, value) = line.split_once('=').ok_or(SdpError::Malformed {
                line: line_no,
                reason: "expected <type>=<value>",
            })?;
            if kind.len() != 1 {
                return Err(SdpError::Malformed {
                    line: line_no,
                    reason: "line type must be a single character",
                });
            }

            match kind {
                "m" => {
                    let mut fields = value.split_whitespace();
                    let (Some(media), Some(_port), Some(_proto), Some(format)) =
                        (fields.next(), fields.next(), fields.next(), fields.next())
                    else {
                        return Err(SdpError::Malformed {
                            line: line_no,
                            reason: "media line needs a type, port, protocol and format",
                        });
                    };
                    sections.push(MediaSection {
                        kind: media.to_string(),
                        first_format: format.to_string(),
                        control: None,
                        rtpmap: None,
                    });
                }
                "a" => {
                    // session-level attributes do not describe a track
                    let Some(section) = sections.last_mut() else {
                        continue;
                    };
                    if let Some(control) = value.strip_prefix("control:") {
                        section.control = Some(control.trim().to_string());
                    } else if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                        let (format, encoding) =
                            rtpmap.trim().split_once(' ').ok_or(SdpError::Malformed {
                                line: line_no,
                                reason: "rtpmap needs a format and an encoding",
                            })?;
                        if format != section.first_format || section.rtpmap.is_some() {
                            continue;
                        }
                        let mut parts = encoding.trim().split('/');
                        let name = parts.next().unwrap_or_default().to_string();
                        let rate = parts.next().and_then(|r| r.parse().ok());
                        section.rtpmap = Some((name, rate));
                    }
                }
                _ => {}
            }
        }

        let mut tracks = Self::default();

        for section in sections {
            match section.kind.as_str() {
                "video" => {
                    if tracks.video.is_some() {
                        warn!("Ignoring additional video track");
                        continue;
                    }
                    let descriptor = section.into_descriptor();
                    info!(codec = %descriptor.codec, "video codec");
                    tracks.video = Some(descriptor);
                }
                "audio" => {
                    if tracks.audio_count >= AUDIO_SLOTS {
                        return Err(SdpError::TooManyAudioTracks);
                    }
                    let descriptor = section.into_descriptor();
                    info!(codec = %descriptor.codec, slot = tracks.audio_count, "audio codec");
                    tracks.audio[tracks.audio_count] = descriptor;
                    tracks.audio_count += 1;
                }
                _ => {}
            }
        }

        Ok(tracks)
    }

    pub fn video_control(&self) -> &str {
        self.video.as_ref().map(|v| v.control.as_str()).unwrap_or_default()
    }

    pub fn video_codec(&self) -> &str {
        self.video.as_ref().map(|v| v.codec.as_str()).unwrap_or_default()
    }

    /// Video clock rate announced by `a=rtpmap` or the static payload table.
    pub fn video_clock_rate(&self) -> Option<u32> {
        self.video
            .as_ref()
            .and_then(|v| v.clock_rate)
            .filter(|&rate| rate > 0)
    }

    pub fn audio_controls(&self) -> [&str; AUDIO_SLOTS] {
        [self.audio[0].control.as_str(), self.audio[1].control.as_str()]
    }

    pub fn audio_codecs(&self) -> [&str; AUDIO_SLOTS] {
        [self.audio[0].codec.as_str(), self.audio[1].codec.as_str()]
    }
}
