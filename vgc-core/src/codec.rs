//! Framing for element values.
//!
//! Text frames (`"<checksum>:<identifier>:<value>\n"`) carry numeric and string values on the
//! small stream. Binary frames (`[magic][id][len LE][timestamp LE?][payload]`) carry byte
//! payloads such as the device descriptor on the large stream.
//!
//! The text checksum is value + identifier + length of `"<identifier>:<value>"`. It catches
//! truncation and most single-character corruption, nothing more; it is not an integrity
//! guarantee and a deliberately altered frame can pass it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::element::{ElementId, ElementRegistry, ElementValue, ValueKind};

pub const FIELD_SEPARATOR: u8 = b':';
pub const MESSAGE_SEPARATOR: u8 = b'\n';

/// Leading bytes of every binary frame.
pub const BINARY_MAGIC: [u8; 4] = [0x56, 0x47, 0x43, 0xB1];
const MAGIC_SIZE: usize = 4;
const ID_SIZE: usize = 1;
const LEN_SIZE: usize = 4;
const TIMESTAMP_SIZE: usize = 8;
const MAX_BINARY_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
/// Longest text line accepted, separator excluded.
pub const MAX_TEXT_LINE: usize = 64 * 1024;

/// Checksum of a text frame body.
pub fn checksum(id: ElementId, value: &str, numeric: Option<f64>) -> f64 {
    let body_len = id.to_string().chars().count() + 1 + value.chars().count();
    numeric.unwrap_or(0.0) + f64::from(id) + body_len as f64
}

/// Encode a value into a text frame.
pub fn encode_text(id: ElementId, value: &ElementValue) -> Result<Vec<u8>, EncodeError> {
    let text = value.to_wire_string().ok_or(EncodeError::BinaryValue(id))?;
    encode_text_raw(id, value.kind(), &text)
}

/// Encode a value already in text form. Used when forwarding so the value is not reformatted.
pub fn encode_text_raw(id: ElementId, kind: ValueKind, value: &str) -> Result<Vec<u8>, EncodeError> {
    if kind.is_binary() {
        return Err(EncodeError::BinaryValue(id));
    }
    if value
        .bytes()
        .any(|b| b == FIELD_SEPARATOR || b == MESSAGE_SEPARATOR || b == 0)
    {
        return Err(EncodeError::ReservedCharacter(id));
    }
    let numeric = if kind.is_numeric() {
        Some(
            value
                .parse::<f64>()
                .map_err(|_| EncodeError::NotNumeric(id))?,
        )
    } else {
        None
    };
    let sum = checksum(id, value, numeric);
    Ok(format!("{}:{}:{}\n", sum, id, value).into_bytes())
}

/// Encode a byte payload into a binary frame.
pub fn encode_binary(
    id: ElementId,
    payload: &[u8],
    timestamp_micros: Option<u64>,
) -> Result<Vec<u8>, EncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| EncodeError::TooLarge)?;
    if len > MAX_BINARY_LEN {
        return Err(EncodeError::TooLarge);
    }
    let ts_len = if timestamp_micros.is_some() {
        TIMESTAMP_SIZE
    } else {
        0
    };
    let mut out = Vec::with_capacity(MAGIC_SIZE + ID_SIZE + LEN_SIZE + ts_len + payload.len());
    out.extend_from_slice(&BINARY_MAGIC);
    out.push(id);
    out.extend_from_slice(&len.to_le_bytes());
    if let Some(ts) = timestamp_micros {
        out.extend_from_slice(&ts.to_le_bytes());
    }
    out.extend_from_slice(payload);
    Ok(out)
}

/// Microseconds since the UNIX epoch, for latency stamps.
pub fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Error encoding a value into a frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("element {0} carries bytes and needs a binary frame")]
    BinaryValue(ElementId),
    #[error("value of element {0} contains a separator")]
    ReservedCharacter(ElementId),
    #[error("value of numeric element {0} does not parse as a number")]
    NotNumeric(ElementId),
    #[error("payload too large")]
    TooLarge,
}

/// Rejected frame surfaced to the caller. Structurally malformed input is not surfaced; it is
/// only counted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("checksum mismatch on element {id}: got {received}, expected {expected}")]
    ChecksumMismatch {
        id: ElementId,
        received: String,
        expected: String,
    },
    #[error("unknown element {0}")]
    UnknownElement(ElementId),
}

/// Per-decoder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodecMetrics {
    pub frames: u64,
    /// Everything dropped, checksum failures included.
    pub malformed: u64,
    pub checksum_failures: u64,
    pub unknown_elements: u64,
    pub bytes_received: u64,
}

impl CodecMetrics {
    /// Share of candidate frames that were dropped.
    pub fn invalid_rate(&self) -> f64 {
        let total = self.frames + self.malformed + self.unknown_elements;
        if total == 0 {
            return 0.0;
        }
        (self.malformed + self.unknown_elements) as f64 / total as f64
    }

    pub fn merge(&mut self, other: &CodecMetrics) {
        self.frames += other.frames;
        self.malformed += other.malformed;
        self.checksum_failures += other.checksum_failures;
        self.unknown_elements += other.unknown_elements;
        self.bytes_received += other.bytes_received;
    }
}

/// One validated text frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TextFrame {
    pub id: ElementId,
    pub value: ElementValue,
    /// Value exactly as it appeared on the wire.
    pub raw_value: String,
}

/// Incremental decoder for the text stream.
pub struct TextDecoder {
    registry: Arc<ElementRegistry>,
    buffer: Vec<u8>,
    /// `buffer[..scanned]` holds no separator.
    scanned: usize,
    /// Dropping the rest of an over-long line until its separator arrives.
    discarding: bool,
    metrics: CodecMetrics,
}

impl TextDecoder {
    pub fn new(registry: Arc<ElementRegistry>) -> Self {
        Self {
            registry,
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            metrics: CodecMetrics::default(),
        }
    }

    /// Append bytes from one read. NUL padding is discarded. A partial line that grows past
    /// [`MAX_TEXT_LINE`] is dropped up to its separator and counted as malformed.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.metrics.bytes_received += bytes.len() as u64;
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != 0));
        if self.discarding {
            match self.buffer.iter().position(|&b| b == MESSAGE_SEPARATOR) {
                Some(pos) => {
                    self.buffer.drain(..=pos);
                    self.discarding = false;
                }
                None => {
                    self.buffer.clear();
                    return;
                }
            }
        }
        self.scan();
    }

    /// Frames complete so far, in arrival order. A trailing partial line stays buffered.
    pub fn frames(&mut self) -> TextFrames<'_> {
        TextFrames { decoder: self }
    }

    pub fn metrics(&self) -> &CodecMetrics {
        &self.metrics
    }

    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Position of the first separator. Bytes before `scanned` are not searched again.
    fn scan(&mut self) -> Option<usize> {
        match self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == MESSAGE_SEPARATOR)
        {
            Some(offset) => {
                self.scanned += offset;
                Some(self.scanned)
            }
            None => {
                self.scanned = self.buffer.len();
                if self.scanned > MAX_TEXT_LINE {
                    self.metrics.malformed += 1;
                    self.buffer.clear();
                    self.scanned = 0;
                    self.discarding = true;
                }
                None
            }
        }
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.scan()?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        self.scanned = 0;
        line.pop();
        Some(line)
    }

    /// `None` means the line was malformed and has been counted.
    fn decode_line(&mut self, line: &[u8]) -> Option<Result<TextFrame, FrameError>> {
        let Ok(text) = std::str::from_utf8(line) else {
            self.metrics.malformed += 1;
            return None;
        };
        let parts: Vec<&str> = text.split(':').collect();
        let [sum, id, raw] = parts.as_slice() else {
            self.metrics.malformed += 1;
            return None;
        };
        let (Ok(received), Ok(id)) = (sum.parse::<f64>(), id.parse::<ElementId>()) else {
            self.metrics.malformed += 1;
            return None;
        };
        let Some(kind) = self.registry.kind(id) else {
            self.metrics.unknown_elements += 1;
            return Some(Err(FrameError::UnknownElement(id)));
        };
        let Some(value) = ElementValue::parse(kind, raw) else {
            self.metrics.malformed += 1;
            return None;
        };
        let numeric = if kind.is_numeric() {
            raw.parse::<f64>().ok()
        } else {
            None
        };
        let expected = checksum(id, raw, numeric).to_string();
        let received = received.to_string();
        if expected != received {
            self.metrics.malformed += 1;
            self.metrics.checksum_failures += 1;
            return Some(Err(FrameError::ChecksumMismatch {
                id,
                received,
                expected,
            }));
        }
        self.metrics.frames += 1;
        Some(Ok(TextFrame {
            id,
            value,
            raw_value: raw.to_string(),
        }))
    }
}

pub struct TextFrames<'a> {
    decoder: &'a mut TextDecoder,
}

impl Iterator for TextFrames<'_> {
    type Item = Result<TextFrame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.decoder.next_line()?;
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_TEXT_LINE {
                self.decoder.metrics.malformed += 1;
                continue;
            }
            if let Some(outcome) = self.decoder.decode_line(&line) {
                return Some(outcome);
            }
        }
    }
}

/// One binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFrame {
    pub id: ElementId,
    pub payload: Vec<u8>,
    pub timestamp_micros: Option<u64>,
}

/// Decode one binary frame from the front of `bytes`. Returns the frame and bytes consumed.
/// `NeedMore` means call again once more bytes have arrived.
pub fn decode_binary(
    bytes: &[u8],
    with_timestamp: bool,
) -> Result<(BinaryFrame, usize), BinaryDecodeError> {
    let header = MAGIC_SIZE + ID_SIZE + LEN_SIZE;
    let ts_len = if with_timestamp { TIMESTAMP_SIZE } else { 0 };
    let magic_seen = bytes.len().min(MAGIC_SIZE);
    if bytes[..magic_seen] != BINARY_MAGIC[..magic_seen] {
        return Err(BinaryDecodeError::BadMagic);
    }
    if bytes.len() < header + ts_len {
        return Err(BinaryDecodeError::NeedMore);
    }
    let id = bytes[MAGIC_SIZE];
    let len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    if len > MAX_BINARY_LEN {
        return Err(BinaryDecodeError::TooLarge);
    }
    let timestamp_micros = if with_timestamp {
        let mut ts = [0u8; TIMESTAMP_SIZE];
        ts.copy_from_slice(&bytes[header..header + TIMESTAMP_SIZE]);
        Some(u64::from_le_bytes(ts))
    } else {
        None
    };
    let start = header + ts_len;
    let end = start + len as usize;
    if bytes.len() < end {
        return Err(BinaryDecodeError::NeedMore);
    }
    Ok((
        BinaryFrame {
            id,
            payload: bytes[start..end].to_vec(),
            timestamp_micros,
        },
        end,
    ))
}

/// Error decoding a binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BinaryDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("bad frame magic")]
    BadMagic,
    #[error("frame too large")]
    TooLarge,
}

/// Incremental decoder for the large stream.
pub struct BinaryDecoder {
    registry: Arc<ElementRegistry>,
    buffer: Vec<u8>,
    with_timestamp: bool,
    metrics: CodecMetrics,
}

impl BinaryDecoder {
    pub fn new(registry: Arc<ElementRegistry>, with_timestamp: bool) -> Self {
        Self {
            registry,
            buffer: Vec::new(),
            with_timestamp,
            metrics: CodecMetrics::default(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.metrics.bytes_received += bytes.len() as u64;
        self.buffer.extend_from_slice(bytes);
    }

    pub fn metrics(&self) -> &CodecMetrics {
        &self.metrics
    }

    /// Next complete frame, if any. Garbage before a magic header is skipped and counted.
    pub fn next_frame(&mut self) -> Option<Result<BinaryFrame, FrameError>> {
        loop {
            if self.buffer.is_empty() {
                return None;
            }
            match decode_binary(&self.buffer, self.with_timestamp) {
                Ok((frame, used)) => {
                    self.buffer.drain(..used);
                    if self.registry.kind(frame.id) != Some(ValueKind::Bytes) {
                        self.metrics.unknown_elements += 1;
                        return Some(Err(FrameError::UnknownElement(frame.id)));
                    }
                    self.metrics.frames += 1;
                    return Some(Ok(frame));
                }
                Err(BinaryDecodeError::NeedMore) => return None,
                Err(BinaryDecodeError::BadMagic) => {
                    self.metrics.malformed += 1;
                    self.resync();
                }
                Err(BinaryDecodeError::TooLarge) => {
                    self.metrics.malformed += 1;
                    self.buffer.clear();
                    return None;
                }
            }
        }
    }

    /// Drop bytes up to the next magic header, keeping a possible partial header at the tail.
    fn resync(&mut self) {
        let next = self.buffer[1..]
            .windows(MAGIC_SIZE)
            .position(|w| w == BINARY_MAGIC)
            .map(|p| p + 1);
        match next {
            Some(at) => {
                self.buffer.drain(..at);
            }
            None => {
                let keep = (MAGIC_SIZE - 1).min(self.buffer.len() - 1);
                let cut = self.buffer.len() - keep;
                self.buffer.drain(..cut);
                while !self.buffer.is_empty() && !BINARY_MAGIC.starts_with(&self.buffer) {
                    self.buffer.remove(0);
                }
            }
        }
    }
}
