//! Wire messages carried inside frames.
//!
//! Two small protocols share the [`super::framing::FrameCodec`] framing:
//! the mailbox delivery protocol (§ stage / commit / abort) and the monitor
//! liveness protocol (register / heartbeat / query). Payload values use the
//! canonical encoding from [`mpcal_tla::codec`].
//!
//! Messages are a tag byte followed by fixed-width big-endian scalars and
//! encoded values. Tags are disjoint across the two protocols so a frame
//! accidentally sent to the wrong service decodes to an error, not to a
//! plausible message.

use bytes::{BufMut, Bytes, BytesMut};
use mpcal_tla::{CodecError, Value};

const TAG_BATCH: u8 = 0x10;
const TAG_COMMIT: u8 = 0x11;
const TAG_ABORT: u8 = 0x12;

const TAG_REPLY_OK: u8 = 0x20;
const TAG_REPLY_FULL: u8 = 0x21;

const TAG_REGISTER: u8 = 0x30;
const TAG_HEARTBEAT: u8 = 0x31;
const TAG_QUERY: u8 = 0x32;

const TAG_STATUS_OK: u8 = 0x40;
const TAG_STATUS_ALIVE: u8 = 0x41;
const TAG_STATUS_SUSPECTED: u8 = 0x42;

/// A message from a mailbox writer to a mailbox listener.
///
/// One critical section's writes to one peer travel as a single `Batch`
/// staged under `(sender, seq)`, made visible by `Commit` and discarded by
/// `Abort`. Retried batches and commits after a reconnect reuse the same
/// sequence number, which is what lets the receiver filter duplicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxMessage {
    /// Stage the values of one commit attempt.
    Batch {
        /// Process-stable writer identity.
        sender: u64,
        /// Commit sequence number, monotonic per sender.
        seq: u64,
        /// The values written in the critical section, in write order.
        values: Vec<Value>,
    },
    /// Make the staged batch visible to the reader.
    Commit {
        /// Writer identity, as in the batch.
        sender: u64,
        /// Sequence number of the staged batch.
        seq: u64,
    },
    /// Discard the staged batch.
    Abort {
        /// Writer identity, as in the batch.
        sender: u64,
        /// Sequence number of the staged batch.
        seq: u64,
    },
}

/// Listener's answer to a [`MailboxMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxReply {
    /// Accepted (staged, committed, or aborted).
    Ok,
    /// The inbox has no room for the batch; the writer should abort and
    /// retry the section later.
    Full,
}

impl MailboxMessage {
    /// Encode into a frame payload.
    ///
    /// # Errors
    ///
    /// Fails only if a value exceeds the codec's aggregate limits.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Batch {
                sender,
                seq,
                values,
            } => {
                buf.put_u8(TAG_BATCH);
                buf.put_u64(*sender);
                buf.put_u64(*seq);
                let count =
                    u32::try_from(values.len()).map_err(|_| CodecError::TooLarge(values.len()))?;
                buf.put_u32(count);
                for value in values {
                    value.encode(&mut buf)?;
                }
            },
            Self::Commit { sender, seq } => {
                buf.put_u8(TAG_COMMIT);
                buf.put_u64(*sender);
                buf.put_u64(*seq);
            },
            Self::Abort { sender, seq } => {
                buf.put_u8(TAG_ABORT);
                buf.put_u64(*sender);
                buf.put_u64(*seq);
            },
        }
        Ok(buf.freeze())
    }

    /// Decode from a full frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on malformed, truncated, or trailing input.
    pub fn from_bytes(input: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = input;
        let tag = take_u8(&mut cursor)?;
        let message = match tag {
            TAG_BATCH => {
                let sender = take_u64(&mut cursor)?;
                let seq = take_u64(&mut cursor)?;
                let count = take_u32(&mut cursor)? as usize;
                if count > cursor.len() {
                    return Err(CodecError::UnexpectedEof);
                }
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(Value::decode(&mut cursor)?);
                }
                Self::Batch {
                    sender,
                    seq,
                    values,
                }
            },
            TAG_COMMIT => Self::Commit {
                sender: take_u64(&mut cursor)?,
                seq: take_u64(&mut cursor)?,
            },
            TAG_ABORT => Self::Abort {
                sender: take_u64(&mut cursor)?,
                seq: take_u64(&mut cursor)?,
            },
            other => return Err(CodecError::InvalidTag(other)),
        };
        expect_consumed(cursor)?;
        Ok(message)
    }
}

impl MailboxReply {
    /// Encode into a frame payload.
    #[must_use]
    pub fn to_bytes(self) -> Bytes {
        let tag = match self {
            Self::Ok => TAG_REPLY_OK,
            Self::Full => TAG_REPLY_FULL,
        };
        Bytes::copy_from_slice(&[tag])
    }

    /// Decode from a full frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on malformed input.
    pub fn from_bytes(input: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = input;
        let reply = match take_u8(&mut cursor)? {
            TAG_REPLY_OK => Self::Ok,
            TAG_REPLY_FULL => Self::Full,
            other => return Err(CodecError::InvalidTag(other)),
        };
        expect_consumed(cursor)?;
        Ok(reply)
    }
}

/// A request to the monitor service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorRequest {
    /// Begin tracking heartbeats for a peer.
    Register {
        /// The peer's self-identifier.
        peer: Value,
        /// Sender wall clock, milliseconds since the Unix epoch. Carried
        /// for diagnostics; the monitor judges liveness by its own clock.
        timestamp_ms: u64,
    },
    /// Periodic liveness signal for a registered peer.
    Heartbeat {
        /// The peer's self-identifier.
        peer: Value,
        /// Sender wall clock, as in `Register`.
        timestamp_ms: u64,
    },
    /// Ask whether a peer is currently considered alive.
    Query {
        /// The peer being asked about.
        peer: Value,
    },
}

/// The monitor's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorReply {
    /// Register/heartbeat acknowledged.
    Ok,
    /// The queried peer showed evidence of life within the window.
    Alive,
    /// The queried peer is suspected dead.
    Suspected,
}

impl MonitorRequest {
    /// Encode into a frame payload.
    ///
    /// # Errors
    ///
    /// Fails only if the peer value exceeds the codec's aggregate limits.
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        match self {
            Self::Register { peer, timestamp_ms } => {
                buf.put_u8(TAG_REGISTER);
                buf.put_u64(*timestamp_ms);
                peer.encode(&mut buf)?;
            },
            Self::Heartbeat { peer, timestamp_ms } => {
                buf.put_u8(TAG_HEARTBEAT);
                buf.put_u64(*timestamp_ms);
                peer.encode(&mut buf)?;
            },
            Self::Query { peer } => {
                buf.put_u8(TAG_QUERY);
                peer.encode(&mut buf)?;
            },
        }
        Ok(buf.freeze())
    }

    /// Decode from a full frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on malformed, truncated, or trailing input.
    pub fn from_bytes(input: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = input;
        let request = match take_u8(&mut cursor)? {
            TAG_REGISTER => {
                let timestamp_ms = take_u64(&mut cursor)?;
                let peer = Value::decode(&mut cursor)?;
                Self::Register { peer, timestamp_ms }
            },
            TAG_HEARTBEAT => {
                let timestamp_ms = take_u64(&mut cursor)?;
                let peer = Value::decode(&mut cursor)?;
                Self::Heartbeat { peer, timestamp_ms }
            },
            TAG_QUERY => Self::Query {
                peer: Value::decode(&mut cursor)?,
            },
            other => return Err(CodecError::InvalidTag(other)),
        };
        expect_consumed(cursor)?;
        Ok(request)
    }
}

impl MonitorReply {
    /// Encode into a frame payload.
    #[must_use]
    pub fn to_bytes(self) -> Bytes {
        let tag = match self {
            Self::Ok => TAG_STATUS_OK,
            Self::Alive => TAG_STATUS_ALIVE,
            Self::Suspected => TAG_STATUS_SUSPECTED,
        };
        Bytes::copy_from_slice(&[tag])
    }

    /// Decode from a full frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] on malformed input.
    pub fn from_bytes(input: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = input;
        let reply = match take_u8(&mut cursor)? {
            TAG_STATUS_OK => Self::Ok,
            TAG_STATUS_ALIVE => Self::Alive,
            TAG_STATUS_SUSPECTED => Self::Suspected,
            other => return Err(CodecError::InvalidTag(other)),
        };
        expect_consumed(cursor)?;
        Ok(reply)
    }
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if cursor.len() < n {
        return Err(CodecError::UnexpectedEof);
    }
    let (head, rest) = cursor.split_at(n);
    *cursor = rest;
    Ok(head)
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8, CodecError> {
    Ok(take(cursor, 1)?[0])
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32, CodecError> {
    let bytes = take(cursor, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64, CodecError> {
    let bytes = take(cursor, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

fn expect_consumed(cursor: &[u8]) -> Result<(), CodecError> {
    if cursor.is_empty() {
        Ok(())
    } else {
        Err(CodecError::TrailingBytes(cursor.len()))
    }
}
