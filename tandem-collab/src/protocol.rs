//! Binary wire protocol for document synchronization.
//!
//! Wire format (one frame):
//! ```text
//! ┌──────────┬──────────────┬──────────────────────────┐
//! │ msg_type │ length       │ payload                  │
//! │ 1 byte   │ LEB128 varint│ `length` bytes           │
//! └──────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! Payloads by type:
//! - `SyncStep1`: encoded state vector
//! - `SyncStep2`, `Update`: encoded update record
//! - `Awareness`: bincode-encoded [`crate::awareness::AwarenessUpdate`]
//! - `Heartbeat`, `SyncDone`: empty
//!
//! Frames arrive over byte streams in arbitrary chunks. [`FrameDecoder`]
//! buffers partial frames and refuses to allocate for declared lengths
//! above its limit.

use tandem_core::encoding::{peek_var_u64, write_var_u64, ReadError};

/// Default upper bound for a single frame payload (4 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// State vector, opens the handshake
    SyncStep1 = 0,
    /// Updates the peer is missing, answers SyncStep1
    SyncStep2 = 1,
    /// Incremental update
    Update = 2,
    /// Participant table delta
    Awareness = 3,
    /// Liveness ping
    Heartbeat = 4,
    /// Acknowledges that a SyncStep2 was merged
    SyncDone = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::SyncStep1),
            1 => Ok(Self::SyncStep2),
            2 => Ok(Self::Update),
            3 => Ok(Self::Awareness),
            4 => Ok(Self::Heartbeat),
            5 => Ok(Self::SyncDone),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, state_vector)
    }

    pub fn sync_step2(update: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, update)
    }

    pub fn update(update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, update)
    }

    pub fn awareness(payload: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, payload)
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, Vec::new())
    }

    pub fn sync_done() -> Self {
        Self::new(MessageType::SyncDone, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 5 + self.payload.len());
        buf.push(self.msg_type as u8);
        write_var_u64(&mut buf, self.payload.len() as u64);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode exactly one frame from `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut decoder = FrameDecoder::new(bytes.len().max(1));
        decoder.push(bytes);
        match decoder.next_frame()? {
            Some(frame) if decoder.buffered() == 0 => Ok(frame),
            Some(_) => Err(ProtocolError::Malformed("trailing bytes after frame".into())),
            None => Err(ProtocolError::Malformed("incomplete frame".into())),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared payload length exceeds the decoder's limit
    FrameTooLarge { declared: u64, max: usize },
    /// Frame type byte not known to this version
    UnknownMessageType(u8),
    /// Frame or payload could not be parsed
    Malformed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge { declared, max } => {
                write!(f, "Frame too large: {declared} bytes (max {max})")
            }
            Self::UnknownMessageType(t) => write!(f, "Unknown message type: {t}"),
            Self::Malformed(e) => write!(f, "Malformed frame: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ReadError> for ProtocolError {
    fn from(e: ReadError) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// Incremental frame decoder over a byte stream.
///
/// Feed arbitrary chunks with [`push`](Self::push) and pull complete frames
/// with [`next_frame`](Self::next_frame). Frames of unknown type are skipped.
/// An oversized frame is reported once and its payload discarded as it
/// arrives, so the stream stays aligned without buffering the payload.
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
    /// Bytes of a rejected frame still to discard.
    skip: u64,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self { buf: Vec::new(), max_frame_len, skip: 0 }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Bytes held for an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame, e.g. when the connection is replaced.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.skip = 0;
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        if self.skip > 0 {
            let n = (self.skip.min(bytes.len() as u64)) as usize;
            self.skip -= n as u64;
            bytes = &bytes[n..];
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if self.skip > 0 || self.buf.is_empty() {
                return Ok(None);
            }
            let (len, header) = match peek_var_u64(&self.buf[1..]) {
                Ok(Some(prefix)) => prefix,
                Ok(None) => return Ok(None),
                Err(e) => {
                    // No way to find the next frame boundary
                    self.buf.clear();
                    return Err(e.into());
                }
            };
            let header = header + 1;

            if len > self.max_frame_len as u64 {
                let available = (self.buf.len() - header) as u64;
                let consumed = available.min(len);
                self.skip = len - consumed;
                self.buf.drain(..header + consumed as usize);
                log::warn!("Rejecting frame of {len} bytes (max {})", self.max_frame_len);
                return Err(ProtocolError::FrameTooLarge {
                    declared: len,
                    max: self.max_frame_len,
                });
            }

            let len = len as usize;
            if self.buf.len() < header + len {
                return Ok(None);
            }
            let type_byte = self.buf[0];
            let payload = self.buf[header..header + len].to_vec();
            self.buf.drain(..header + len);

            match MessageType::try_from(type_byte) {
                Ok(msg_type) => return Ok(Some(Frame { msg_type, payload })),
                Err(_) => {
                    log::debug!("Skipping frame with unknown type {type_byte}");
                    continue;
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_layout() {
        let frame = Frame::update(vec![7; 300]);
        let bytes = frame.encode();
        assert_eq!(bytes[0], 2);
        // 300 = 0b10_0101100 -> [0xAC, 0x02]
        assert_eq!(&bytes[1..3], &[0xAC, 0x02]);
        assert_eq!(bytes.len(), 3 + 300);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let a = Frame::sync_step1(vec![1, 2, 3]).encode();
        let b = Frame::heartbeat().encode();
        let stream: Vec<u8> = a.iter().chain(b.iter()).copied().collect();

        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for byte in stream {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![Frame::sync_step1(vec![1, 2, 3]), Frame::heartbeat()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected_without_allocation() {
        let mut decoder = FrameDecoder::new(16);
        let mut bytes = vec![MessageType::Update as u8];
        write_var_u64(&mut bytes, 1 << 40);
        bytes.extend_from_slice(&[0; 8]);
        decoder.push(&bytes);

        let err = decoder.next_frame().unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge { declared: 1 << 40, max: 16 });
        assert_eq!(decoder.buffered(), 0);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_stream_realigns_after_oversized_frame() {
        let mut decoder = FrameDecoder::new(4);
        let big = Frame::update(vec![9; 10]).encode();
        let small = Frame::sync_done().encode();

        decoder.push(&big[..5]);
        assert!(decoder.next_frame().is_err());
        decoder.push(&big[5..]);
        decoder.push(&small);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::sync_done()));
    }

    #[test]
    fn test_unknown_types_are_skipped() {
        let mut bytes = vec![0x42, 2, 0xAA, 0xBB];
        bytes.extend(Frame::heartbeat().encode());
        let mut decoder = FrameDecoder::default();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::heartbeat()));
    }

    #[test]
    fn test_malformed_length_prefix() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&[2, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(matches!(decoder.next_frame(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_single_frame_errors() {
        assert!(Frame::decode(&[2, 5, 1]).is_err());
        let mut two = Frame::heartbeat().encode();
        two.extend(Frame::heartbeat().encode());
        assert!(Frame::decode(&two).is_err());
    }
}
