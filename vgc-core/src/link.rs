//! Link: one peer connection made of a small (text frames) and a large (binary frames) stream.
//!
//! The host owns the sockets. It hands the link one `Channel` per stream for writing and feeds
//! stream events and received bytes in; the link decodes them into a per-link event queue that
//! the controller drains.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::codec::{
    self, BinaryDecoder, BinaryFrame, CodecMetrics, EncodeError, FrameError, TextDecoder,
    TextFrame,
};
use crate::element::{ElementId, ElementRegistry, ElementValue, ValueKind};

/// Preamble written first on every stream: channel kind + session token.
pub const PREAMBLE_LEN: usize = 1 + 16;

/// Which of the two streams of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Low latency, small payloads: text frames.
    Small = 1,
    /// Bulk payloads: binary frames.
    Large = 2,
}

impl ChannelKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ChannelKind::Small),
            2 => Some(ChannelKind::Large),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            ChannelKind::Small => ChannelKind::Large,
            ChannelKind::Large => ChannelKind::Small,
        }
    }
}

/// First bytes on a stream; tells the accepting side which link and which channel it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub kind: ChannelKind,
    pub token: Uuid,
}

impl Preamble {
    pub fn encode(&self) -> [u8; PREAMBLE_LEN] {
        let mut out = [0u8; PREAMBLE_LEN];
        out[0] = self.kind as u8;
        out[1..].copy_from_slice(self.token.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8; PREAMBLE_LEN]) -> Result<Self, PreambleError> {
        let kind = ChannelKind::from_byte(bytes[0]).ok_or(PreambleError::UnknownChannel(bytes[0]))?;
        let mut token = [0u8; 16];
        token.copy_from_slice(&bytes[1..]);
        Ok(Self {
            kind,
            token: Uuid::from_bytes(token),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PreambleError {
    #[error("unknown channel kind {0}")]
    UnknownChannel(u8),
}

/// Write side of one stream, implemented by the host.
pub trait Channel {
    /// False when a write now would not fit in the transport's buffer.
    fn has_space_available(&self) -> bool;
    fn write(&mut self, bytes: Vec<u8>) -> Result<(), ChannelError>;
    /// Close the stream. Must be idempotent.
    fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no buffer space available")]
    Full,
    #[error("stream closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Streams scheduled, not both reporting open yet.
    Opening,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    EndOfStream(ChannelKind),
    StreamError(ChannelKind, String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Opened,
    Text(TextFrame),
    Binary(BinaryFrame),
    /// Frame failed its checksum.
    InvalidMessage(FrameError),
    UnknownElement(ElementId),
    /// Emitted once, when a stream failure closes the link.
    Disconnected(DisconnectReason),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("link is not open")]
    NotOpen,
    #[error("no buffer space on {0:?} stream")]
    NoSpace(ChannelKind),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct Link<C> {
    id: LinkId,
    token: Uuid,
    state: LinkState,
    small: C,
    large: C,
    small_open: bool,
    large_open: bool,
    text: TextDecoder,
    binary: BinaryDecoder,
    latency_logging: bool,
    events: VecDeque<LinkEvent>,
    sent: u64,
    dropped: u64,
}

impl<C: Channel> Link<C> {
    pub fn new(
        id: LinkId,
        token: Uuid,
        small: C,
        large: C,
        registry: Arc<ElementRegistry>,
        latency_logging: bool,
    ) -> Self {
        Self {
            id,
            token,
            state: LinkState::Idle,
            small,
            large,
            small_open: false,
            large_open: false,
            text: TextDecoder::new(registry.clone()),
            binary: BinaryDecoder::new(registry, latency_logging),
            latency_logging,
            events: VecDeque::new(),
            sent: 0,
            dropped: 0,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
    }

    /// Streams have been handed to the transport.
    pub fn schedule(&mut self) {
        if self.state == LinkState::Idle {
            self.state = LinkState::Opening;
        }
    }

    pub fn on_stream_opened(&mut self, kind: ChannelKind) {
        if self.state == LinkState::Closed || self.state == LinkState::Open {
            return;
        }
        self.state = LinkState::Opening;
        match kind {
            ChannelKind::Small => self.small_open = true,
            ChannelKind::Large => self.large_open = true,
        }
        if self.small_open && self.large_open {
            debug!(link = %self.id, "both streams open");
            self.state = LinkState::Open;
            self.events.push_back(LinkEvent::Opened);
        }
    }

    pub fn on_bytes(&mut self, kind: ChannelKind, bytes: &[u8]) {
        if self.state == LinkState::Closed {
            return;
        }
        match kind {
            ChannelKind::Small => {
                self.text.feed(bytes);
                for outcome in self.text.frames() {
                    self.events.push_back(match outcome {
                        Ok(frame) => LinkEvent::Text(frame),
                        Err(FrameError::UnknownElement(id)) => LinkEvent::UnknownElement(id),
                        Err(e) => LinkEvent::InvalidMessage(e),
                    });
                }
            }
            ChannelKind::Large => {
                self.binary.feed(bytes);
                while let Some(outcome) = self.binary.next_frame() {
                    match outcome {
                        Ok(frame) => {
                            if let Some(sent_at) = frame.timestamp_micros {
                                let latency = codec::timestamp_micros().saturating_sub(sent_at);
                                trace!(link = %self.id, id = frame.id, latency_us = latency, "binary frame");
                            }
                            self.events.push_back(LinkEvent::Binary(frame));
                        }
                        Err(FrameError::UnknownElement(id)) => {
                            self.events.push_back(LinkEvent::UnknownElement(id))
                        }
                        Err(e) => self.events.push_back(LinkEvent::InvalidMessage(e)),
                    }
                }
            }
        }
    }

    pub fn on_stream_error(&mut self, kind: ChannelKind, error: impl fmt::Display) {
        self.fail(DisconnectReason::StreamError(kind, error.to_string()));
    }

    pub fn on_end_of_stream(&mut self, kind: ChannelKind) {
        self.fail(DisconnectReason::EndOfStream(kind));
    }

    fn fail(&mut self, reason: DisconnectReason) {
        if self.state == LinkState::Closed {
            return;
        }
        debug!(link = %self.id, ?reason, "link failed");
        self.shutdown();
        self.events.push_back(LinkEvent::Disconnected(reason));
    }

    /// Close both streams. No event is emitted for a local close.
    pub fn close(&mut self) {
        if self.state != LinkState::Closed {
            debug!(link = %self.id, "closing link");
            self.shutdown();
        }
    }

    fn shutdown(&mut self) {
        self.state = LinkState::Closed;
        self.small.close();
        self.large.close();
    }

    /// Send a value on the stream matching its kind. Dropped, not queued, when the link is not
    /// open or the stream has no space.
    pub fn send(&mut self, id: ElementId, value: &ElementValue) -> Result<(), SendError> {
        match value {
            ElementValue::Bytes(payload) => self.send_binary(id, payload),
            other => {
                let bytes = codec::encode_text(id, other)?;
                self.write(ChannelKind::Small, bytes)
            }
        }
    }

    /// Forward a text frame using the value text exactly as received.
    pub fn send_raw_text(&mut self, id: ElementId, kind: ValueKind, raw: &str) -> Result<(), SendError> {
        let bytes = codec::encode_text_raw(id, kind, raw)?;
        self.write(ChannelKind::Small, bytes)
    }

    pub fn send_binary(&mut self, id: ElementId, payload: &[u8]) -> Result<(), SendError> {
        let ts = self.latency_logging.then(codec::timestamp_micros);
        let bytes = codec::encode_binary(id, payload, ts)?;
        self.write(ChannelKind::Large, bytes)
    }

    fn write(&mut self, kind: ChannelKind, bytes: Vec<u8>) -> Result<(), SendError> {
        let result = self.try_write(kind, bytes);
        match &result {
            Ok(()) => self.sent += 1,
            Err(e) => {
                self.dropped += 1;
                warn!(link = %self.id, error = %e, "send dropped");
            }
        }
        result
    }

    fn try_write(&mut self, kind: ChannelKind, bytes: Vec<u8>) -> Result<(), SendError> {
        if self.state != LinkState::Open {
            return Err(SendError::NotOpen);
        }
        let channel = match kind {
            ChannelKind::Small => &mut self.small,
            ChannelKind::Large => &mut self.large,
        };
        if !channel.has_space_available() {
            return Err(SendError::NoSpace(kind));
        }
        channel.write(bytes)?;
        Ok(())
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Decode counters of both streams combined.
    pub fn metrics(&self) -> CodecMetrics {
        let mut m = *self.text.metrics();
        m.merge(self.binary.metrics());
        m
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<C> fmt::Debug for Link<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("state", &self.state)
            .finish()
    }
}
