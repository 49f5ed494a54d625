//! Seplos protocol v2.0 frame codec.
//!
//! Frames travel as ASCII text. Apart from the start marker and the
//! terminator, every byte is carried as two uppercase hex characters:
//!
//! ```text
//! '~' VER ADR CID1 CID2 LENGTH INFO.. CHKSUM '\r'
//! ```
//!
//! `LENGTH` carries its own 4-bit checksum in the high nibble, so a corrupted
//! length is rejected before the stated INFO length is trusted. `CHKSUM`
//! covers every ASCII character between the start marker and itself.
use derive_more::{Display, Error};

pub const FRAME_START: u8 = b'~';
pub const FRAME_END: u8 = b'\r';
pub const PROTOCOL_VERSION: u8 = 0x20;
pub const DEVICE_TYPE_BATTERY: u8 = 0x46;

/// Return code carried in CID2 of a normal response.
pub const RESPONSE_OK: u8 = 0x00;

const HEADER_CHARS: usize = 12;
const CHECKSUM_CHARS: usize = 4;
const LENID_MASK: u16 = 0x0FFF;

/// Largest binary payload whose ASCII form fits the 12-bit LENID field.
pub const MAX_PAYLOAD_LEN: usize = (LENID_MASK as usize) / 2;

/// Length of a complete ASCII frame carrying `payload_len` binary bytes.
pub const fn frame_len(payload_len: usize) -> usize {
    1 + HEADER_CHARS + payload_len * 2 + CHECKSUM_CHARS + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub address: u8,
    pub device_type: u8,
    /// Command code on requests, return code on responses.
    pub command: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum FrameError {
    #[display("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[display("no start marker in {len} received bytes")]
    MissingStartMarker { len: usize },
    #[display("frame truncated: need {needed} bytes after start marker, got {available}")]
    Truncated { needed: usize, available: usize },
    #[display("non-hex character in frame {section}")]
    InvalidHex { section: &'static str },
    #[display("length field 0x{field:04X} fails its self-check")]
    LengthChecksum { field: u16 },
    #[display("length field announces an odd INFO length ({lenid})")]
    OddLength { lenid: u16 },
    #[display("checksum mismatch: frame says 0x{stated:04X}, computed 0x{computed:04X}")]
    Checksum { stated: u16, computed: u16 },
    #[display("expected terminator, found 0x{found:02X}")]
    MissingEndMarker { found: u8 },
}

impl FrameError {
    pub fn is_checksum(&self) -> bool {
        matches!(
            self,
            FrameError::Checksum { .. } | FrameError::LengthChecksum { .. }
        )
    }
}

/// 4-bit self-check stored in the high nibble of the LENGTH field.
pub fn length_checksum(lenid: u16) -> u16 {
    let lenid = lenid & LENID_MASK;
    let sum = (lenid & 0xF) + ((lenid >> 4) & 0xF) + ((lenid >> 8) & 0xF);
    (!sum).wrapping_add(1) & 0xF
}

/// LENGTH field for an INFO section of `lenid` ASCII characters.
pub fn encode_length(lenid: u16) -> u16 {
    (length_checksum(lenid) << 12) | (lenid & LENID_MASK)
}

/// Two's complement of the 16-bit sum of the ASCII characters.
pub fn frame_checksum(ascii: &[u8]) -> u16 {
    let sum = ascii
        .iter()
        .fold(0u16, |acc, &byte| acc.wrapping_add(byte as u16));
    (!sum).wrapping_add(1)
}

impl Frame {
    /// A request frame for the battery device type at protocol version 2.0.
    pub fn request(address: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            address,
            device_type: DEVICE_TYPE_BATTERY,
            command,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let lenid = (self.payload.len() * 2) as u16;
        let mut body = format!(
            "{:02X}{:02X}{:02X}{:02X}{:04X}",
            self.version,
            self.address,
            self.device_type,
            self.command,
            encode_length(lenid)
        )
        .into_bytes();
        for byte in &self.payload {
            body.extend_from_slice(format!("{byte:02X}").as_bytes());
        }
        let checksum = frame_checksum(&body);

        let mut frame = Vec::with_capacity(frame_len(self.payload.len()));
        frame.push(FRAME_START);
        frame.extend_from_slice(&body);
        frame.extend_from_slice(format!("{checksum:04X}").as_bytes());
        frame.push(FRAME_END);
        Ok(frame)
    }

    /// Decode and fully validate one frame.
    ///
    /// Bytes before the first start marker and after the terminator are
    /// ignored. Nothing from the frame is returned unless every stage passes.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let start = bytes
            .iter()
            .position(|&b| b == FRAME_START)
            .ok_or(FrameError::MissingStartMarker { len: bytes.len() })?;
        let body = &bytes[start + 1..];

        require(body, HEADER_CHARS)?;
        let header = decode_hex(&body[..HEADER_CHARS], "header")?;
        let length = u16::from_be_bytes([header[4], header[5]]);
        let lenid = length & LENID_MASK;
        if length_checksum(lenid) != length >> 12 {
            return Err(FrameError::LengthChecksum { field: length });
        }
        if lenid % 2 != 0 {
            return Err(FrameError::OddLength { lenid });
        }

        let info_end = HEADER_CHARS + lenid as usize;
        let checksum_end = info_end + CHECKSUM_CHARS;
        require(body, checksum_end + 1)?;

        let payload = decode_hex(&body[HEADER_CHARS..info_end], "payload")?;
        let stated = decode_hex(&body[info_end..checksum_end], "checksum")?;
        let stated = u16::from_be_bytes([stated[0], stated[1]]);
        let computed = frame_checksum(&body[..info_end]);
        if stated != computed {
            return Err(FrameError::Checksum { stated, computed });
        }

        let found = body[checksum_end];
        if found != FRAME_END {
            return Err(FrameError::MissingEndMarker { found });
        }

        Ok(Self {
            version: header[0],
            address: header[1],
            device_type: header[2],
            command: header[3],
            payload,
        })
    }
}

/// Build a complete request frame for `address`.
pub fn encode(address: u8, command: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    Frame::request(address, command, payload.to_vec()).encode()
}

pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    Frame::decode(bytes)
}

fn require(body: &[u8], needed: usize) -> Result<(), FrameError> {
    if body.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: body.len(),
        });
    }
    Ok(())
}

/// Uppercase hex only. The checksum field is not covered by the checksum, so
/// a case change there must be rejected here.
fn decode_hex(ascii: &[u8], section: &'static str) -> Result<Vec<u8>, FrameError> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    ascii
        .chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(high), Some(low)) => Ok((high << 4) | low),
            _ => Err(FrameError::InvalidHex { section }),
        })
        .collect()
}

/// Printable form of a raw ASCII frame for debug logs.
pub fn format_frame(bytes: &[u8]) -> String {
    bytes.escape_ascii().to_string()
}
