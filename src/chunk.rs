// Chunk codec: fixed header, message fragmentation, reassembly, and
// per-direction sequencing.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Length of the fixed chunk header in bytes.
pub const CHUNK_HDR_LEN: usize = 24;

// A sender restarts its sequence counter once it has emitted a value above
// this threshold; the receiver accepts the wrapped value only below
// SEQ_WRAP_CEILING and only when the last value exceeded the threshold.
const SEQ_WRAP_THRESHOLD: u32 = u32::MAX - 1024;
const SEQ_WRAP_CEILING: u32 = 1024;

/// Logical message category carried by a chunk.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Application request/response traffic.
    Message = b'M',
    /// Open-secure-channel exchange (token issue or renewal).
    OpenChannel = b'O',
    /// Close-secure-channel notification.
    CloseChannel = b'C',
}

impl TryFrom<u8> for MessageKind {
    type Error = ChunkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'M' => Ok(MessageKind::Message),
            b'O' => Ok(MessageKind::OpenChannel),
            b'C' => Ok(MessageKind::CloseChannel),
            other => Err(ChunkError::UnknownMessageKind(other)),
        }
    }
}

/// Position of a chunk within its logical message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// More chunks follow.
    Intermediate = b'C',
    /// Last chunk of the message.
    Final = b'F',
    /// The sender abandoned the message; discard accumulated chunks.
    Abort = b'A',
}

impl TryFrom<u8> for ChunkKind {
    type Error = ChunkError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'C' => Ok(ChunkKind::Intermediate),
            b'F' => Ok(ChunkKind::Final),
            b'A' => Ok(ChunkKind::Abort),
            other => Err(ChunkError::UnknownChunkKind(other)),
        }
    }
}

/// Chunk codec error. Every variant is a protocol violation fatal to the
/// owning connection.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Buffer shorter than required.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown message kind byte.
    #[error("unknown message kind {0:#04x}")]
    UnknownMessageKind(u8),

    /// Unknown chunk kind byte.
    #[error("unknown chunk kind {0:#04x}")]
    UnknownChunkKind(u8),

    /// Reserved header field was non-zero.
    #[error("reserved header field must be zero (found {0:#06x})")]
    ReservedNotZero(u16),

    /// Declared chunk length is inconsistent with the header or limits.
    #[error("declared chunk length {declared} invalid (max {max})")]
    DeclaredLengthInvalid {
        /// Length carried in the header.
        declared: u32,
        /// Configured maximum chunk size.
        max: usize,
    },

    /// Frame length does not match the declared chunk length.
    #[error("frame of {actual} bytes does not match declared length {declared}")]
    FrameLengthMismatch {
        /// Length carried in the header.
        declared: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// Sequence number was not exactly one greater than the last accepted.
    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap {
        /// Sequence number the receiver expected.
        expected: u32,
        /// Sequence number carried by the chunk.
        actual: u32,
    },

    /// Accumulated chunk count exceeded the configured maximum.
    #[error("message exceeds maximum of {max} chunks")]
    TooManyChunks {
        /// Configured chunk count limit.
        max: u32,
    },

    /// Message size exceeded the configured maximum.
    #[error("message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge {
        /// Offending size in bytes.
        size: usize,
        /// Configured maximum message size.
        max: usize,
    },

    /// Chunks of one message carried differing request ids.
    #[error("request id changed mid-message: expected {expected}, got {actual}")]
    RequestIdMismatch {
        /// Request id of the first chunk.
        expected: u32,
        /// Request id of the offending chunk.
        actual: u32,
    },

    /// Chunks of one message carried differing message kinds.
    #[error("message kind changed mid-message")]
    KindMismatch,
}

/// Size and count bounds applied to both directions of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Maximum size of one chunk in bytes, header included.
    pub max_chunk_size: usize,
    /// Maximum number of chunks per logical message.
    pub max_chunk_count: u32,
    /// Maximum reassembled message size in bytes.
    pub max_message_size: usize,
}

impl ChunkLimits {
    /// Payload capacity of one chunk.
    pub fn body_budget(&self) -> usize {
        self.max_chunk_size.saturating_sub(CHUNK_HDR_LEN)
    }

    /// Clamps both limit sets to their common subset, ignoring zero fields in
    /// the peer's announcement (zero means "no preference").
    pub fn negotiate(&self, peer: &ChunkLimits) -> ChunkLimits {
        fn pick(local: usize, peer: usize) -> usize {
            if peer == 0 {
                local
            } else {
                local.min(peer)
            }
        }
        ChunkLimits {
            max_chunk_size: pick(self.max_chunk_size, peer.max_chunk_size),
            max_chunk_count: if peer.max_chunk_count == 0 {
                self.max_chunk_count
            } else {
                self.max_chunk_count.min(peer.max_chunk_count)
            },
            max_message_size: pick(self.max_message_size, peer.max_message_size),
        }
    }
}

/// Fixed header as carried at the front of every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Logical message category.
    pub kind: MessageKind,
    /// Position within the message.
    pub chunk: ChunkKind,
    /// Owning channel identifier.
    pub channel_id: u32,
    /// Security token protecting the chunk.
    pub token_id: u32,
    /// Per-direction sequence number.
    pub sequence: u32,
    /// Request correlation identifier.
    pub request_id: u32,
    /// Payload length in bytes (header excluded).
    pub body_len: u32,
}

impl ChunkHeader {
    /// Encodes the header into a byte array.
    pub fn encode(&self) -> [u8; CHUNK_HDR_LEN] {
        let mut buf = [0u8; CHUNK_HDR_LEN];
        buf[0] = self.kind as u8;
        buf[1] = self.chunk as u8;
        // bytes 2..4 reserved (zero)
        let total = CHUNK_HDR_LEN as u32 + self.body_len;
        buf[4..8].copy_from_slice(&total.to_be_bytes());
        buf[8..12].copy_from_slice(&self.channel_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.token_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.sequence.to_be_bytes());
        buf[20..24].copy_from_slice(&self.request_id.to_be_bytes());
        buf
    }

    /// Parses a header from the provided buffer.
    pub fn parse(bytes: &[u8]) -> Result<Self, ChunkError> {
        if bytes.len() < CHUNK_HDR_LEN {
            return Err(ChunkError::BufferTooShort {
                expected: CHUNK_HDR_LEN,
                actual: bytes.len(),
            });
        }

        let kind = MessageKind::try_from(bytes[0])?;
        let chunk = ChunkKind::try_from(bytes[1])?;
        let reserved = u16::from_be_bytes([bytes[2], bytes[3]]);
        if reserved != 0 {
            return Err(ChunkError::ReservedNotZero(reserved));
        }

        let total = u32::from_be_bytes(bytes[4..8].try_into().expect("4 byte slice"));
        if (total as usize) < CHUNK_HDR_LEN {
            return Err(ChunkError::DeclaredLengthInvalid {
                declared: total,
                max: usize::MAX,
            });
        }

        Ok(Self {
            kind,
            chunk,
            channel_id: u32::from_be_bytes(bytes[8..12].try_into().expect("4 byte slice")),
            token_id: u32::from_be_bytes(bytes[12..16].try_into().expect("4 byte slice")),
            sequence: u32::from_be_bytes(bytes[16..20].try_into().expect("4 byte slice")),
            request_id: u32::from_be_bytes(bytes[20..24].try_into().expect("4 byte slice")),
            body_len: total - CHUNK_HDR_LEN as u32,
        })
    }

    /// Total chunk length, header included.
    pub fn total_len(&self) -> usize {
        CHUNK_HDR_LEN + self.body_len as usize
    }
}

/// Splits a complete frame into its header and payload, checking that the
/// frame length matches the declared chunk length.
pub fn split_frame(frame: &[u8]) -> Result<(ChunkHeader, &[u8]), ChunkError> {
    let header = ChunkHeader::parse(frame)?;
    if frame.len() != header.total_len() {
        return Err(ChunkError::FrameLengthMismatch {
            declared: header.total_len(),
            actual: frame.len(),
        });
    }
    Ok((header, &frame[CHUNK_HDR_LEN..]))
}

/// A complete logical message reassembled from chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message category.
    pub kind: MessageKind,
    /// Request correlation identifier.
    pub request_id: u32,
    /// Reassembled payload.
    pub payload: Bytes,
}

/// Per-direction monotonic sequence number source. Never reset except on
/// explicit connection renegotiation.
#[derive(Debug, Clone)]
pub struct Sequencer {
    next: u32,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// Creates a sequencer starting at 1.
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Returns the next sequence number, wrapping below 1024 once the counter
    /// passes `u32::MAX - 1024`.
    pub fn advance(&mut self) -> u32 {
        let seq = self.next;
        self.next = if seq > SEQ_WRAP_THRESHOLD { 1 } else { seq + 1 };
        seq
    }

    /// Restarts the sequence, valid only on connection renegotiation.
    pub fn reset(&mut self) {
        self.next = 1;
    }
}

/// Fragments a logical message into chunks of at most
/// `limits.max_chunk_size` bytes each, header included. Only the last chunk is
/// marked final; sequence numbers are drawn consecutively from `seq`.
#[allow(clippy::too_many_arguments)]
pub fn encode_message(
    seq: &mut Sequencer,
    kind: MessageKind,
    channel_id: u32,
    token_id: u32,
    request_id: u32,
    payload: &[u8],
    limits: &ChunkLimits,
) -> Result<Vec<Bytes>, ChunkError> {
    if payload.len() > limits.max_message_size {
        return Err(ChunkError::MessageTooLarge {
            size: payload.len(),
            max: limits.max_message_size,
        });
    }

    let budget = limits.body_budget();
    if budget == 0 {
        return Err(ChunkError::MessageTooLarge {
            size: payload.len(),
            max: 0,
        });
    }
    let chunk_count = if payload.is_empty() {
        1
    } else {
        payload.len().div_ceil(budget)
    };
    if chunk_count > limits.max_chunk_count as usize {
        return Err(ChunkError::MessageTooLarge {
            size: payload.len(),
            max: budget * limits.max_chunk_count as usize,
        });
    }

    let mut chunks = Vec::with_capacity(chunk_count);
    for index in 0..chunk_count {
        let start = index * budget;
        let end = payload.len().min(start + budget);
        let body = &payload[start..end];
        let header = ChunkHeader {
            kind,
            chunk: if index + 1 == chunk_count {
                ChunkKind::Final
            } else {
                ChunkKind::Intermediate
            },
            channel_id,
            token_id,
            sequence: seq.advance(),
            request_id,
            body_len: body.len() as u32,
        };
        let mut frame = BytesMut::with_capacity(CHUNK_HDR_LEN + body.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(body);
        chunks.push(frame.freeze());
    }

    Ok(chunks)
}

/// Encodes a single abort chunk telling the peer to discard the in-progress
/// message identified by `request_id`.
pub fn encode_abort(
    seq: &mut Sequencer,
    channel_id: u32,
    token_id: u32,
    request_id: u32,
) -> Bytes {
    let header = ChunkHeader {
        kind: MessageKind::Message,
        chunk: ChunkKind::Abort,
        channel_id,
        token_id,
        sequence: seq.advance(),
        request_id,
        body_len: 0,
    };
    Bytes::copy_from_slice(&header.encode())
}

/// Result of feeding one chunk to a [`ChunkAssembly`].
#[derive(Debug)]
pub enum Accepted {
    /// A final chunk arrived; the message is complete and the assembly reset.
    Complete(Message),
    /// More chunks are needed.
    Incomplete,
    /// The sender aborted the message; accumulated chunks were discarded.
    Aborted {
        /// Request id of the abandoned message.
        request_id: u32,
    },
}

/// Inbound reassembly state for one connection direction. Sequence continuity
/// spans messages; only the per-message accumulation resets on completion.
#[derive(Debug, Default)]
pub struct ChunkAssembly {
    last_seq: Option<u32>,
    chunk_count: u32,
    kind: Option<MessageKind>,
    request_id: Option<u32>,
    buf: BytesMut,
}

impl ChunkAssembly {
    /// Creates an empty assembly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks accumulated for the in-progress message.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Appends one chunk, verifying sequencing and size bounds.
    pub fn accept(
        &mut self,
        header: &ChunkHeader,
        body: &[u8],
        limits: &ChunkLimits,
    ) -> Result<Accepted, ChunkError> {
        self.check_sequence(header.sequence)?;
        self.last_seq = Some(header.sequence);

        if header.chunk == ChunkKind::Abort {
            let request_id = header.request_id;
            self.reset_message();
            return Ok(Accepted::Aborted { request_id });
        }

        if let Some(expected) = self.request_id {
            if expected != header.request_id {
                return Err(ChunkError::RequestIdMismatch {
                    expected,
                    actual: header.request_id,
                });
            }
        }
        if let Some(kind) = self.kind {
            if kind != header.kind {
                return Err(ChunkError::KindMismatch);
            }
        }

        if self.chunk_count + 1 > limits.max_chunk_count {
            return Err(ChunkError::TooManyChunks {
                max: limits.max_chunk_count,
            });
        }
        if self.buf.len() + body.len() > limits.max_message_size {
            return Err(ChunkError::MessageTooLarge {
                size: self.buf.len() + body.len(),
                max: limits.max_message_size,
            });
        }

        self.kind = Some(header.kind);
        self.request_id = Some(header.request_id);
        self.chunk_count += 1;
        self.buf.extend_from_slice(body);

        if header.chunk == ChunkKind::Final {
            let message = Message {
                kind: header.kind,
                request_id: header.request_id,
                payload: self.buf.split().freeze(),
            };
            self.reset_message();
            return Ok(Accepted::Complete(message));
        }

        Ok(Accepted::Incomplete)
    }

    fn check_sequence(&self, sequence: u32) -> Result<(), ChunkError> {
        let Some(last) = self.last_seq else {
            return Ok(());
        };
        let expected = last.wrapping_add(1);
        if sequence == expected {
            return Ok(());
        }
        // Wrap rule: a sender past the threshold restarts below 1024.
        if last > SEQ_WRAP_THRESHOLD && sequence < SEQ_WRAP_CEILING {
            return Ok(());
        }
        Err(ChunkError::SequenceGap {
            expected,
            actual: sequence,
        })
    }

    fn reset_message(&mut self) {
        self.chunk_count = 0;
        self.kind = None;
        self.request_id = None;
        self.buf.clear();
    }
}

/// Accumulates raw stream bytes and yields complete chunk frames, using the
/// length field at offset 4 of the fixed header.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_chunk_size: usize,
}

impl FrameBuffer {
    /// Creates a frame buffer bounded by the connection's chunk size limit.
    pub fn new(max_chunk_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_chunk_size,
        }
    }

    /// Appends stream bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Updates the chunk size bound after limit negotiation.
    pub fn set_max_chunk_size(&mut self, max_chunk_size: usize) {
        self.max_chunk_size = max_chunk_size;
    }

    /// Pops the next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ChunkError> {
        if self.buf.len() < 8 {
            return Ok(None);
        }
        let declared =
            u32::from_be_bytes(self.buf[4..8].try_into().expect("4 byte slice")) as usize;
        if declared < CHUNK_HDR_LEN || declared > self.max_chunk_size {
            return Err(ChunkError::DeclaredLengthInvalid {
                declared: declared as u32,
                max: self.max_chunk_size,
            });
        }
        if self.buf.len() < declared {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(declared).freeze()))
    }
}
