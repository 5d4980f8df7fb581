//! Wire codec for the host streaming session.
//!
//! Every unit on the wire is a self-delimited frame:
//! - length:     u24 BE (bytes after the 9-byte header, sub-header included)
//! - type:       u8 (0 = data, 1 = command, 2 = tag)
//! - flags:      u8
//! - identifier: u32 BE
//! - sub-header:
//!   - command:    pad u8, dependency u32 BE, weight u8
//!   - data / tag: pad u8
//! - payload:
//!   - command: `key=value\r\n` pairs
//!   - data:    16-byte little-endian [`FormatId`] followed by PCM
//!   - tag:     raw title bytes
//!
//! Responses from the host are always command frames.

use std::collections::HashMap;
use std::io::{self, Read};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 9;
/// Largest value the 24-bit length field can carry.
pub const MAX_FRAME_LEN: usize = 0x00FF_FFFF;
/// Encoded size of a [`FormatId`].
pub const FORMAT_ID_LEN: usize = 16;
/// Format tag for interleaved integer PCM.
pub const FORMAT_TAG_PCM: u32 = 1;

const COMMAND_SUBHEADER_LEN: usize = 6;
const PAD_SUBHEADER_LEN: usize = 1;

/// Decoded command payload. Duplicate keys keep the last value.
pub type CommandMap = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("malformed frame header: need 9 bytes, got {0}")]
    MalformedHeader(usize),
    #[error("unknown frame type {0:#x}")]
    UnknownFrameType(u8),
    #[error("unexpected frame type {0:?}")]
    UnexpectedFrameType(FrameType),
    #[error("frame payload of {0} bytes exceeds the 24-bit length field")]
    PayloadTooLarge(usize),
    #[error("frame truncated: header says {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("sub-header does not match frame type {0:?}")]
    SubHeaderMismatch(FrameType),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0,
    Command = 1,
    Tag = 2,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Result<Self, ProtoError> {
        match b {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Command),
            2 => Ok(FrameType::Tag),
            other => Err(ProtoError::UnknownFrameType(other)),
        }
    }
}

/// The fixed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes following the header, sub-header included.
    pub length: u32,
    pub kind: FrameType,
    pub flags: u8,
    pub identifier: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_be_bytes();
        let id = self.identifier.to_be_bytes();
        [
            len[1], len[2], len[3], self.kind as u8, self.flags, id[0], id[1], id[2], id[3],
        ]
    }
}

/// Type-specific header placed between the frame header and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubHeader {
    Command { dependency: u32, weight: u8 },
    Pad,
}

impl SubHeader {
    pub fn len(&self) -> usize {
        match self {
            SubHeader::Command { .. } => COMMAND_SUBHEADER_LEN,
            SubHeader::Pad => PAD_SUBHEADER_LEN,
        }
    }

    fn matches(&self, kind: FrameType) -> bool {
        matches!(
            (self, kind),
            (SubHeader::Command { .. }, FrameType::Command)
                | (SubHeader::Pad, FrameType::Data | FrameType::Tag)
        )
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match *self {
            SubHeader::Command { dependency, weight } => {
                out.push(0);
                out.extend_from_slice(&dependency.to_be_bytes());
                out.push(weight);
            }
            SubHeader::Pad => out.push(0),
        }
    }

    fn decode(kind: FrameType, body: &[u8]) -> Result<Self, ProtoError> {
        match kind {
            FrameType::Command => {
                if body.len() < COMMAND_SUBHEADER_LEN {
                    return Err(ProtoError::Truncated {
                        expected: COMMAND_SUBHEADER_LEN,
                        actual: body.len(),
                    });
                }
                let dependency = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
                Ok(SubHeader::Command {
                    dependency,
                    weight: body[5],
                })
            }
            FrameType::Data | FrameType::Tag => {
                if body.is_empty() {
                    return Err(ProtoError::Truncated {
                        expected: PAD_SUBHEADER_LEN,
                        actual: 0,
                    });
                }
                Ok(SubHeader::Pad)
            }
        }
    }
}

/// A complete frame with its sub-header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub flags: u8,
    pub identifier: u32,
    pub subheader: SubHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Command frame carrying `key=value` pairs.
    pub fn command<I, K, V>(identifier: u32, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Frame {
            kind: FrameType::Command,
            flags: 0,
            identifier,
            subheader: SubHeader::Command {
                dependency: 0,
                weight: 0,
            },
            payload: encode_command(pairs),
        }
    }

    /// Data frame: format descriptor followed by a PCM chunk.
    pub fn data(identifier: u32, format: &FormatId, pcm: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(FORMAT_ID_LEN + pcm.len());
        payload.extend_from_slice(&format.encode());
        payload.extend_from_slice(pcm);
        Frame {
            kind: FrameType::Data,
            flags: 0,
            identifier,
            subheader: SubHeader::Pad,
            payload,
        }
    }

    /// Tag frame carrying raw title bytes.
    pub fn tag(identifier: u32, title: &str) -> Self {
        Frame {
            kind: FrameType::Tag,
            flags: 0,
            identifier,
            subheader: SubHeader::Pad,
            payload: title.as_bytes().to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        encode_frame(
            self.kind,
            self.flags,
            self.identifier,
            &self.subheader,
            &self.payload,
        )
    }
}

/// Encode a frame into a single buffer (header + sub-header + payload).
pub fn encode_frame(
    kind: FrameType,
    flags: u8,
    identifier: u32,
    subheader: &SubHeader,
    payload: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    if !subheader.matches(kind) {
        return Err(ProtoError::SubHeaderMismatch(kind));
    }
    let body_len = subheader.len() + payload.len();
    if body_len > MAX_FRAME_LEN {
        return Err(ProtoError::PayloadTooLarge(body_len));
    }

    let header = FrameHeader {
        length: body_len as u32,
        kind,
        flags,
        identifier,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&header.encode());
    subheader.encode_into(&mut out);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode the fixed header from the start of `bytes`.
pub fn decode_frame_header(bytes: &[u8]) -> Result<FrameHeader, ProtoError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtoError::MalformedHeader(bytes.len()));
    }
    let length = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    let kind = FrameType::from_u8(bytes[3])?;
    let identifier = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    Ok(FrameHeader {
        length,
        kind,
        flags: bytes[4],
        identifier,
    })
}

/// Split a frame body (everything after the header) into sub-header and payload.
pub fn decode_frame_body(header: &FrameHeader, body: &[u8]) -> Result<Frame, ProtoError> {
    if body.len() != header.length as usize {
        return Err(ProtoError::Truncated {
            expected: header.length as usize,
            actual: body.len(),
        });
    }
    let subheader = SubHeader::decode(header.kind, body)?;
    Ok(Frame {
        kind: header.kind,
        flags: header.flags,
        identifier: header.identifier,
        subheader,
        payload: body[subheader.len()..].to_vec(),
    })
}

/// Decode one complete frame from `bytes`. Trailing bytes are rejected.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtoError> {
    let header = decode_frame_header(bytes)?;
    decode_frame_body(&header, &bytes[HEADER_LEN..])
}

/// Read one frame from a blocking reader.
pub fn read_frame(mut r: impl Read) -> Result<Frame, ProtoError> {
    let mut head = [0u8; HEADER_LEN];
    r.read_exact(&mut head)?;
    let header = decode_frame_header(&head)?;
    let mut body = vec![0u8; header.length as usize];
    r.read_exact(&mut body)?;
    decode_frame_body(&header, &body)
}

/// PCM layout of an upload or data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatId {
    pub sample_rate: u32,
    pub bits_per_sample: u32,
    pub channels: u32,
    pub format_tag: u32,
}

impl FormatId {
    pub fn pcm(sample_rate: u32, bits_per_sample: u32, channels: u32) -> Self {
        Self {
            sample_rate,
            bits_per_sample,
            channels,
            format_tag: FORMAT_TAG_PCM,
        }
    }

    /// Encode as four little-endian u32: rate, bits, channels, tag.
    pub fn encode(&self) -> [u8; FORMAT_ID_LEN] {
        let mut out = [0u8; FORMAT_ID_LEN];
        out[0..4].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[4..8].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        out[8..12].copy_from_slice(&self.channels.to_le_bytes());
        out[12..16].copy_from_slice(&self.format_tag.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < FORMAT_ID_LEN {
            return Err(ProtoError::Truncated {
                expected: FORMAT_ID_LEN,
                actual: bytes.len(),
            });
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            sample_rate: word(0),
            bits_per_sample: word(4),
            channels: word(8),
            format_tag: word(12),
        })
    }

    /// Bytes per interleaved frame (all channels), 0 for a degenerate format.
    pub fn bytes_per_frame(&self) -> u64 {
        u64::from(self.bits_per_sample / 8) * u64::from(self.channels)
    }
}

/// Encode `key=value\r\n` pairs.
pub fn encode_command<I, K, V>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out = Vec::new();
    for (k, v) in pairs {
        out.extend_from_slice(k.as_ref().as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_ref().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Scan a command payload into key/value pairs.
///
/// The first `=` ends the key; `\r` or `\n` ends the pair. A final pair without a
/// terminator is still emitted. Unknown keys are kept as-is.
pub fn parse_command_payload(payload: &[u8]) -> CommandMap {
    let mut out = CommandMap::new();
    let mut key = Vec::new();
    let mut value = Vec::new();
    let mut in_value = false;

    let mut flush = |key: &mut Vec<u8>, value: &mut Vec<u8>, in_value: &mut bool| {
        if !key.is_empty() {
            out.insert(
                String::from_utf8_lossy(key).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            );
        }
        key.clear();
        value.clear();
        *in_value = false;
    };

    for &b in payload {
        match b {
            b'\r' | b'\n' => flush(&mut key, &mut value, &mut in_value),
            b'=' if !in_value => in_value = true,
            _ if in_value => value.push(b),
            _ => key.push(b),
        }
    }
    flush(&mut key, &mut value, &mut in_value);
    out
}

/// Read one frame and parse it as a command.
pub fn parse_command(r: impl Read) -> Result<CommandMap, ProtoError> {
    let frame = read_frame(r)?;
    command_from_frame(&frame)
}

/// Parse an already-decoded frame as a command.
pub fn command_from_frame(frame: &Frame) -> Result<CommandMap, ProtoError> {
    if frame.kind != FrameType::Command {
        return Err(ProtoError::UnexpectedFrameType(frame.kind));
    }
    Ok(parse_command_payload(&frame.payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn command_sub() -> SubHeader {
        SubHeader::Command {
            dependency: 0xDEAD_BEEF,
            weight: 7,
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let bytes = encode_frame(FrameType::Command, 0x5A, 0x0102_0304, &command_sub(), b"ab").unwrap();
        assert_eq!(&bytes[0..3], &[0x00, 0x00, 0x08]);
        assert_eq!(bytes[3], 1);
        assert_eq!(bytes[4], 0x5A);
        assert_eq!(&bytes[5..9], &[1, 2, 3, 4]);
        assert_eq!(&bytes[9..15], &[0, 0xDE, 0xAD, 0xBE, 0xEF, 7]);
        assert_eq!(&bytes[15..], b"ab");
    }

    #[test]
    fn frame_roundtrip_preserves_fields_and_length() {
        for (kind, sub, payload) in [
            (FrameType::Command, command_sub(), b"Play=1\r\n".to_vec()),
            (FrameType::Data, SubHeader::Pad, vec![9u8; 300]),
            (FrameType::Tag, SubHeader::Pad, Vec::new()),
        ] {
            let bytes = encode_frame(kind, 3, 42, &sub, &payload).unwrap();
            let header = decode_frame_header(&bytes).unwrap();
            assert_eq!(header.length as usize, sub.len() + payload.len());
            let frame = decode_frame(&bytes).unwrap();
            assert_eq!(frame.kind, kind);
            assert_eq!(frame.flags, 3);
            assert_eq!(frame.identifier, 42);
            assert_eq!(frame.subheader, sub);
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn short_header_is_malformed() {
        let err = decode_frame_header(&[0, 0, 1, 1]).unwrap_err();
        assert!(matches!(err, ProtoError::MalformedHeader(4)));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode_frame_header(&[0, 0, 1, 9, 0, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtoError::UnknownFrameType(9)));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let mut bytes = Frame::tag(1, "title").encode().unwrap();
        bytes.pop();
        let err = decode_frame(&bytes).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated { expected: 6, actual: 5 }));
    }

    #[test]
    fn subheader_must_match_type() {
        let err = encode_frame(FrameType::Data, 0, 0, &command_sub(), b"").unwrap_err();
        assert!(matches!(err, ProtoError::SubHeaderMismatch(FrameType::Data)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; MAX_FRAME_LEN];
        let err = encode_frame(FrameType::Data, 0, 0, &SubHeader::Pad, &payload).unwrap_err();
        assert!(matches!(err, ProtoError::PayloadTooLarge(n) if n == MAX_FRAME_LEN + 1));
    }

    #[test]
    fn format_id_is_little_endian() {
        let format = FormatId::pcm(44_100, 24, 2);
        let bytes = format.encode();
        assert_eq!(&bytes[0..4], &44_100u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[24, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[2, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[1, 0, 0, 0]);
        assert_eq!(FormatId::decode(&bytes).unwrap(), format);
        assert_eq!(format.bytes_per_frame(), 6);
    }

    #[test]
    fn data_frame_starts_with_format() {
        let format = FormatId::pcm(96_000, 32, 2);
        let frame = Frame::data(5, &format, &[1, 2, 3, 4]);
        assert_eq!(&frame.payload[..FORMAT_ID_LEN], &format.encode());
        assert_eq!(&frame.payload[FORMAT_ID_LEN..], &[1, 2, 3, 4]);
    }

    #[test]
    fn command_roundtrip_through_reader() {
        let frame = Frame::command(1, [("Connect", "[fe80::1]:1"), ("Request", "Status")]);
        let bytes = frame.encode().unwrap();
        let map = parse_command(Cursor::new(bytes)).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["Connect"], "[fe80::1]:1");
        assert_eq!(map["Request"], "Status");
    }

    #[test]
    fn command_roundtrip_over_generated_maps() {
        const KEYS: &[&str] = &["Status", "LastTime", "Seek", "Tag", "X-Fw", "k"];
        const VALUES: &[&str] = &["", "1", "Play", "a=b", "==", "[fe80::1]:19644", "-15", "x y"];
        let mut seed: u32 = 0x2545_f491;
        let mut next = |bound: usize| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (seed >> 16) as usize % bound
        };

        for id in 0..64u32 {
            // Picks repeat keys often enough to exercise last-wins.
            let pairs: Vec<(&str, &str)> = (0..next(9))
                .map(|_| (KEYS[next(KEYS.len())], VALUES[next(VALUES.len())]))
                .collect();
            let mut expected = CommandMap::new();
            for (k, v) in &pairs {
                expected.insert(k.to_string(), v.to_string());
            }

            let bytes = Frame::command(id, pairs.iter().copied()).encode().unwrap();
            let map = parse_command(Cursor::new(bytes)).unwrap();
            assert_eq!(map, expected, "pairs {pairs:?}");
        }
    }

    #[test]
    fn parse_command_rejects_data_frames() {
        let bytes = Frame::data(1, &FormatId::pcm(44_100, 16, 2), &[]).encode().unwrap();
        let err = parse_command(Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedFrameType(FrameType::Data)));
    }

    #[test]
    fn payload_scan_handles_terminators_and_duplicates() {
        let map = parse_command_payload(b"Status=Play\nLastTime=12\r\n\r\nStatus=Pause\rX-Fw=a=b\r\nTail=1");
        assert_eq!(map["Status"], "Pause");
        assert_eq!(map["LastTime"], "12");
        assert_eq!(map["X-Fw"], "a=b");
        assert_eq!(map["Tail"], "1");
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn keys_are_case_sensitive() {
        let map = parse_command_payload(b"status=a\r\nStatus=b\r\n");
        assert_eq!(map["status"], "a");
        assert_eq!(map["Status"], "b");
    }

    #[test]
    fn short_read_surfaces_io_error() {
        let err = parse_command(Cursor::new(vec![0u8, 0])).unwrap_err();
        assert!(matches!(err, ProtoError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
