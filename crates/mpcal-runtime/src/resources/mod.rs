//! Built-in resource implementations.
//!
//! Everything a running MPCal program needs out of the box: an
//! archetype-private register, TCP mailboxes, host channel bridges, a
//! failure detector, and the placeholder for unused parameters. Each
//! implements the [`crate::resource::ArchetypeResource`] protocol.

pub mod channel;
pub mod failure_detector;
pub mod local;
pub mod mailboxes;
pub mod placeholder;

pub use channel::{InputChannel, OutputChannel};
pub use failure_detector::{FailureDetector, FailureDetectorConfig, FailureDetectorSlot};
pub use local::LocalRegister;
pub use mailboxes::{LocalMailbox, MailboxConfig, MailboxKind, RemoteMailbox, TcpMailboxes};
pub use placeholder::PlaceHolder;
