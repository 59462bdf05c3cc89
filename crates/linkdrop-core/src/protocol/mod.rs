//! Linkdrop wire protocol.
//!
//! Every message on the channel is either a UTF-8 text frame or an opaque
//! binary frame ([`WireMessage`]).
//!
//! - Binary frames carry file data as chunk packets.
//! - Text frames carry JSON control messages discriminated by `type`.
//!   Anything else on a text frame is a plain chat message.
//!
//! ## Chunk Packet
//!
//! ```text
//! ┌──────┬──────────┬──────────┬──────────┬──────────────┬──────────┬──────────┐
//! │ type │  idLen   │    id    │   seq    │  payloadLen  │  crc32   │ payload  │
//! │  u8  │ u32 (LE) │  idLen B │ u32 (LE) │   u32 (LE)   │ u32 (LE) │ payloadLen B
//! └──────┴──────────┴──────────┴──────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! - type: always `0x01`
//! - crc32: CRC32 of `payload` only
//!
//! ## Stream Envelope
//!
//! Stream transports (TCP) that lack message boundaries wrap each
//! [`WireMessage`] in an envelope:
//!
//! ```text
//! ┌────────────┬────────────┬────────────┬─────────────────────┐
//! │   Magic    │  Version   │    Kind    │      Length         │
//! │  4 bytes   │  2 bytes   │   1 byte   │   4 bytes (BE)      │
//! ├────────────┴────────────┴────────────┴─────────────────────┤
//! │                        Payload                             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Magic: `0x4C 0x4B 0x44 0x50` ("LKDP")
//! - Version: `0x01 0x00` (1.0)


use serde::{Deserialize, Serialize};

use crate::checksum::chunk_crc32;
use crate::error::{Error, Result};
use crate::transfer::TransferId;

/// Type byte of a chunk packet.
pub const CHUNK_PACKET_TYPE: u8 = 1;

/// Fixed bytes in a chunk packet besides the id and payload.
pub const CHUNK_HEADER_FIXED_SIZE: usize = 1 + 4 + 4 + 4 + 4;

/// Envelope magic bytes: "LKDP"
pub const MAGIC: [u8; 4] = [0x4C, 0x4B, 0x44, 0x50];

/// Envelope header size in bytes
pub const HEADER_SIZE: usize = 11;

/// Maximum envelope payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// UTF-8 text frame
    Text(String),
    /// Opaque binary frame
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Size in bytes as accounted against the channel's buffered amount.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }
}

/// A decoded chunk packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPacket {
    /// Transfer this chunk belongs to
    pub id: TransferId,
    /// Zero-based, dense chunk index
    pub seq: u32,
    /// Declared CRC32 of `payload`
    pub crc32: u32,
    /// Chunk bytes
    pub payload: Vec<u8>,
}

impl ChunkPacket {
    /// Whether the declared CRC32 matches the payload.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        chunk_crc32(&self.payload) == self.crc32
    }
}

/// Encode a chunk packet, computing the payload CRC32.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_chunk(id: &TransferId, seq: u32, payload: &[u8]) -> Vec<u8> {
    let id = id.as_str().as_bytes();
    let mut buf = Vec::with_capacity(CHUNK_HEADER_FIXED_SIZE + id.len() + payload.len());
    buf.push(CHUNK_PACKET_TYPE);
    buf.extend_from_slice(&(id.len() as u32).to_le_bytes());
    buf.extend_from_slice(id);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&chunk_crc32(payload).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode a chunk packet.
///
/// The payload CRC32 is not checked here; see [`ChunkPacket::is_intact`].
///
/// # Errors
///
/// Returns [`Error::ProtocolError`] if the type byte is wrong, the id is not
/// UTF-8, or a declared length runs past the end of the buffer.
pub fn decode_chunk(data: &[u8]) -> Result<ChunkPacket> {
    let mut cursor = Cursor { data, pos: 0 };

    let kind = cursor.take(1)?[0];
    if kind != CHUNK_PACKET_TYPE {
        return Err(Error::ProtocolError(format!(
            "unknown binary packet type: {kind:#x}"
        )));
    }

    let id_len = cursor.u32()? as usize;
    let id = std::str::from_utf8(cursor.take(id_len)?)
        .map_err(|e| Error::ProtocolError(format!("transfer id is not UTF-8: {e}")))?;
    let id = TransferId::from(id);
    let seq = cursor.u32()?;
    let payload_len = cursor.u32()? as usize;
    let crc32 = cursor.u32()?;
    let payload = cursor.take(payload_len)?.to_vec();

    if cursor.pos != data.len() {
        return Err(Error::ProtocolError(format!(
            "{} trailing bytes after chunk payload",
            data.len() - cursor.pos
        )));
    }

    Ok(ChunkPacket {
        id,
        seq,
        crc32,
        payload,
    })
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Error::ProtocolError(format!(
                    "chunk packet truncated: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// JSON control messages, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Sender announces a file
    #[serde(rename_all = "camelCase")]
    FileOffer {
        /// Transfer id
        id: TransferId,
        /// File name
        name: String,
        /// Total size in bytes
        size: u64,
        /// Bytes per chunk
        chunk_size: u32,
    },
    /// Receiver accepts, optionally resuming
    #[serde(rename_all = "camelCase")]
    FileAccept {
        /// Transfer id
        id: TransferId,
        /// Bytes the receiver already has
        start_offset: u64,
    },
    /// Receiver asks for one chunk again
    #[serde(rename_all = "camelCase")]
    ChunkNack {
        /// Transfer id
        id: TransferId,
        /// Chunk to retransmit
        seq: u32,
    },
    /// Receiver has every byte and reports its whole-file checksum
    #[serde(rename_all = "camelCase")]
    FileCompleteAck {
        /// Transfer id
        id: TransferId,
        /// Receiver's finalized running CRC32
        receiver_crc32: u32,
    },
    /// Either side abandons the transfer
    #[serde(rename_all = "camelCase")]
    FileCancel {
        /// Transfer id
        id: TransferId,
        /// Human-readable reason
        reason: String,
    },
}

impl ControlMessage {
    /// The transfer this message refers to.
    #[must_use]
    pub const fn transfer_id(&self) -> &TransferId {
        match self {
            Self::FileOffer { id, .. }
            | Self::FileAccept { id, .. }
            | Self::ChunkNack { id, .. }
            | Self::FileCompleteAck { id, .. }
            | Self::FileCancel { id, .. } => id,
        }
    }

    /// Wire name of the message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FileOffer { .. } => "file-offer",
            Self::FileAccept { .. } => "file-accept",
            Self::ChunkNack { .. } => "chunk-nack",
            Self::FileCompleteAck { .. } => "file-complete-ack",
            Self::FileCancel { .. } => "file-cancel",
        }
    }

    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// What a text frame turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundText {
    /// A recognised control message
    Control(ControlMessage),
    /// Anything else: plain chat from older peers or the user
    Chat(String),
}

/// Classify an inbound text frame.
///
/// Unparseable JSON, or JSON whose `type` is not a control message, falls
/// back to chat. This keeps peers that only speak plain text working.
#[must_use]
pub fn classify_text(text: &str) -> InboundText {
    serde_json::from_str::<ControlMessage>(text)
        .map_or_else(|_| InboundText::Chat(text.to_string()), InboundText::Control)
}

/// Envelope kinds on stream transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Text frame
    Text = 0x01,
    /// Binary frame
    Binary = 0x02,
}

impl FrameKind {
    /// Parse a frame kind from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Text),
            0x02 => Some(Self::Binary),
            _ => None,
        }
    }
}

/// A stream envelope header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// Protocol version (major, minor)
    pub version: (u8, u8),
    /// Frame kind
    pub kind: FrameKind,
    /// Payload length
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = self.version.0;
        buf[5] = self.version.1;
        buf[6] = self.kind as u8;
        buf[7..11].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode a header from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is invalid.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(Error::ProtocolError("invalid magic bytes".to_string()));
        }

        let version = (buf[4], buf[5]);
        if version.0 != crate::PROTOCOL_VERSION.0 {
            return Err(Error::UnsupportedVersion {
                major: version.0,
                minor: version.1,
            });
        }

        let kind = FrameKind::from_byte(buf[6])
            .ok_or_else(|| Error::ProtocolError(format!("unknown frame kind: {:#x}", buf[6])))?;

        let payload_length = u32::from_be_bytes([buf[7], buf[8], buf[9], buf[10]]);

        if payload_length as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::ProtocolError(format!(
                "payload too large: {payload_length} bytes"
            )));
        }

        Ok(Self {
            version,
            kind,
            payload_length,
        })
    }
}

/// Read one enveloped message from a stream.
///
/// # Errors
///
/// Returns an error if reading fails, the envelope is invalid, or a text
/// frame is not UTF-8.
pub async fn read_frame<R>(reader: &mut R) -> Result<WireMessage>
where
    R: tokio::io::AsyncReadExt + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;

    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if header.payload_length > 0 {
        reader.read_exact(&mut payload).await?;
    }

    match header.kind {
        FrameKind::Binary => Ok(WireMessage::Binary(payload)),
        FrameKind::Text => String::from_utf8(payload)
            .map(WireMessage::Text)
            .map_err(|e| Error::ProtocolError(format!("text frame is not UTF-8: {e}"))),
    }
}

/// Write one enveloped message to a stream.
///
/// # Errors
///
/// Returns an error if the message is too large or writing fails.
pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    let (kind, payload) = match message {
        WireMessage::Text(text) => (FrameKind::Text, text.as_bytes()),
        WireMessage::Binary(bytes) => (FrameKind::Binary, bytes.as_slice()),
    };

    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::ProtocolError(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    #[allow(clippy::cast_possible_truncation)]
    let header = FrameHeader {
        version: crate::PROTOCOL_VERSION,
        kind,
        payload_length: payload.len() as u32,
    };

    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}
