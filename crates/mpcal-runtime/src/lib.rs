//! # mpcal-runtime
//!
//! The distributed runtime that executes compiled Modular PlusCal (MPCal)
//! archetypes as independent processes communicating over the network.
//!
//! The compiler front-end is out of scope here: it emits ordinary
//! sequential code that drives this runtime. What the runtime provides is
//! the *critical section* abstraction — atomic multi-resource sections
//! spanning network mailboxes, local state, and host-visible I/O — and the
//! machinery to survive peer crashes, buffer contention, and shutdown:
//!
//! - [`context::ArchetypeContext`]: the label-stepped scheduler with
//!   speculative execution, abort, and two-phase commit across resources.
//! - [`resource::ArchetypeResource`]: the contract every mailbox, register,
//!   channel, or failure-detector adapter satisfies.
//! - [`resources`]: the built-in implementations.
//! - [`monitor`]: the node-liveness service backing the failure detector.
//!
//! ## Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use mpcal_runtime::context::{Archetype, ArchetypeContext};
//! use mpcal_runtime::error::Result;
//! use mpcal_runtime::resources::LocalRegister;
//! use mpcal_tla::Value;
//!
//! struct ACounter;
//!
//! #[async_trait]
//! impl Archetype for ACounter {
//!     fn name(&self) -> &'static str {
//!         "ACounter"
//!     }
//!
//!     fn entry_label(&self) -> &'static str {
//!         "bump"
//!     }
//!
//!     async fn section(&self, label: &str, ctx: &mut ArchetypeContext) -> Result<()> {
//!         match label {
//!             "bump" => {
//!                 let n = ctx.read("count", &[]).await?;
//!                 ctx.write("count", &[], n.add(&Value::number(1))?).await?;
//!                 ctx.done().await
//!             },
//!             _ => unreachable!(),
//!         }
//!     }
//! }
//!
//! # async fn demo() -> Result<()> {
//! let (mut ctx, handle) = ArchetypeContext::builder(Value::number(1), ACounter)
//!     .resource("count", LocalRegister::maker(Value::number(0)))
//!     .finish();
//! ctx.run().await?;
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod error;
pub mod monitor;
pub mod net;
pub mod resource;
pub mod resources;
pub mod retry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::context::{Archetype, ArchetypeContext, Constants, ContextHandle};
    pub use crate::error::{Result, RuntimeError};
    pub use crate::resource::{ArchetypeResource, ResourceMaker};
    pub use crate::resources::{
        FailureDetector, FailureDetectorConfig, InputChannel, LocalRegister, MailboxConfig,
        MailboxKind, OutputChannel, PlaceHolder, TcpMailboxes,
    };
}

pub use context::{Archetype, ArchetypeContext, Constants, ContextHandle};
pub use error::RuntimeError;
pub use resource::ArchetypeResource;
pub use retry::RetryPolicy;
