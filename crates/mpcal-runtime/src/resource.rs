//! The two-phase resource protocol.
//!
//! An [`ArchetypeResource`] is the interface between an MPCal archetype and
//! some external environment: a local register, a network mailbox, a host
//! channel, a failure detector. Implementations live in
//! [`crate::resources`]; this module describes what is expected of them.
//!
//! # Protocol
//!
//! Within a critical section the archetype issues any number of
//! `read_value`, `write_value`, and `index` calls. At the section's label
//! boundary the driver runs the commit protocol:
//!
//! 1. `pre_commit` is asked of every touched resource. A resource that
//!    cannot honor the section's accesses answers with
//!    [`RuntimeError::CriticalSectionAborted`]; it must not commit anything
//!    irreversibly here.
//! 2. If every pre-commit succeeded, `commit` is issued to every touched
//!    resource. Commit must be unconditional; it is the only operation that
//!    may block indefinitely.
//! 3. If any pre-commit requested an abort, every touched resource receives
//!    `abort` instead, which must restore state indistinguishable from the
//!    last successful commit and is infallible and idempotent within a
//!    section.
//!
//! Reads are snapshot-stable within a section: re-reading before commit
//! returns a value consistent with the first read. Writes become visible to
//! peers only at commit, but a read after a write in the same section sees
//! the written value.

use async_trait::async_trait;
use mpcal_tla::Value;

use crate::error::{Result, RuntimeError};

/// A resource participating in the critical-section protocol.
///
/// The leaf/map mixins of the protocol are the default method bodies:
/// `index` defaults to the leaf trap, `read_value`/`write_value` default to
/// the map trap. A leaf resource overrides the value operations; a map
/// resource overrides `index`. The commit lifecycle defaults
/// (`pre_commit`/`commit` succeed immediately, `abort` is a no-op) suit
/// resources with no tentative state.
#[async_trait]
pub trait ArchetypeResource: Send {
    /// Return the resource's current value.
    ///
    /// May block until a value is available (e.g. a mailbox receive), but
    /// must use a bounded wait and report
    /// [`RuntimeError::CriticalSectionAborted`] rather than parking the
    /// driver forever.
    ///
    /// # Errors
    ///
    /// The default body is the map-mixin trap: reading a map resource is a
    /// [`RuntimeError::ProtocolMisuse`].
    async fn read_value(&mut self) -> Result<Value> {
        Err(RuntimeError::map_read_write())
    }

    /// Update the resource's value. Takes effect at `commit`.
    ///
    /// # Errors
    ///
    /// The default body is the map-mixin trap, as for [`Self::read_value`].
    async fn write_value(&mut self, _value: Value) -> Result<()> {
        Err(RuntimeError::map_read_write())
    }

    /// Return the sub-resource at the given index. Must not block.
    ///
    /// Sub-resources are owned by the map resource, which fans the commit
    /// lifecycle out to every sub-resource indexed since the last commit
    /// and closes them transitively.
    ///
    /// # Errors
    ///
    /// The default body is the leaf-mixin trap: indexing a leaf resource is
    /// a [`RuntimeError::ProtocolMisuse`].
    fn index(&mut self, _index: &Value) -> Result<&mut dyn ArchetypeResource> {
        Err(RuntimeError::leaf_indexed())
    }

    /// Signal whether it is reasonable to go ahead with a commit. Called
    /// after at least one value/index operation since the last terminal
    /// call. May block briefly; must not commit irreversibly.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::CriticalSectionAborted`] requests an abort of the
    /// whole section; any other error is fatal.
    async fn pre_commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Unconditionally commit the section's tentative state. Only called
    /// when every sibling pre-commit succeeded.
    ///
    /// # Errors
    ///
    /// Errors here are fatal to the archetype; implementations retry
    /// transient failures internally before giving up.
    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Discard tentative state, restoring the last committed state.
    /// Infallible, and idempotent within a single critical section.
    async fn abort(&mut self) {}

    /// Release background tasks and connections. Called exactly once, when
    /// the archetype stops running (never mid-section).
    ///
    /// # Errors
    ///
    /// Close failures are reported to the caller of the driver but do not
    /// affect other resources' close calls.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A boxed resource instance, as owned by a context or a map resource.
pub type BoxResource = Box<dyn ArchetypeResource>;

/// Descriptor from which a context builds a resource at construction time.
///
/// Makers run on the driver task inside the async runtime, so a maker may
/// spawn background tasks but must not block.
pub type ResourceMaker = Box<dyn FnOnce() -> BoxResource + Send>;

/// Wrap a closure producing a concrete resource into a [`ResourceMaker`].
pub fn maker<R>(make: impl FnOnce() -> R + Send + 'static) -> ResourceMaker
where
    R: ArchetypeResource + 'static,
{
    Box::new(move || {
        let resource: BoxResource = Box::new(make());
        resource
    })
}
