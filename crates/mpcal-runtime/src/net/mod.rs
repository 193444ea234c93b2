//! Shared networking plumbing: framing and wire message definitions.

pub mod framing;
pub mod wire;

pub use framing::{FrameCodec, MAX_FRAME_SIZE};
pub use wire::{MailboxMessage, MailboxReply, MonitorReply, MonitorRequest};
