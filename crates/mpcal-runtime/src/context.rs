//! Archetype contexts: the label-stepped critical-section scheduler.
//!
//! An [`ArchetypeContext`] owns everything one running archetype needs: its
//! self-identifier, its live resources, its bound constants, and the close
//! signal. The generated (or hand-written) archetype body is an
//! [`Archetype`]: a jump table from label to critical-section code. The
//! driver loop in [`ArchetypeContext::run`] owns every commit and abort
//! decision; section code only reads, writes, and jumps.
//!
//! The program counter is itself a resource: a local register named `.pc`,
//! written by [`ArchetypeContext::goto`]. Because it participates in the
//! same shadow-state protocol as every other register, aborting a section
//! rewinds control flow with no special cases.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mpcal_tla::Value;
use tracing::{debug, info, warn};

use crate::error::{Result, RuntimeError};
use crate::resource::{ArchetypeResource, BoxResource, ResourceMaker};
use crate::resources::local::LocalRegister;
use crate::retry::RetryPolicy;

/// Name of the implicit program-counter register.
pub const PC_RESOURCE: &str = ".pc";

/// Label value signalling archetype termination.
pub const DONE_LABEL: &str = "Done";

/// One archetype body: a state machine keyed by label.
///
/// Each [`Archetype::section`] invocation executes exactly one labeled
/// critical section and finishes by jumping — [`ArchetypeContext::goto`] to
/// reach another label, or [`ArchetypeContext::done`] to terminate. The
/// driver, not the section, decides whether the section's effects commit.
///
/// Returning [`RuntimeError::CriticalSectionAborted`] from a section is the
/// `await`-style voluntary abort: the driver rolls the section back and
/// re-enters it from the same label after a backoff.
#[async_trait]
pub trait Archetype: Send + Sync + 'static {
    /// Human-readable archetype name, used in logs.
    fn name(&self) -> &'static str;

    /// The label the archetype starts at.
    fn entry_label(&self) -> &'static str;

    /// Execute the critical section at `label`.
    ///
    /// # Errors
    ///
    /// Resource errors propagate with `?`; the driver sorts them into
    /// retryable, shutdown, and fatal per the runtime taxonomy.
    async fn section(&self, label: &str, ctx: &mut ArchetypeContext) -> Result<()>;
}

/// Read-only constant bindings, shareable with resource factories.
#[derive(Debug, Clone, Default)]
pub struct Constants(Arc<BTreeMap<String, Value>>);

impl Constants {
    /// Build from name/value pairs.
    #[must_use]
    pub fn new(pairs: impl IntoIterator<Item = (impl Into<String>, Value)>) -> Self {
        Self(Arc::new(
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    /// Look up a constant.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Look up a constant, failing with the runtime taxonomy.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::UnknownConstant`] when the name is unbound.
    pub fn require(&self, name: &str) -> Result<Value> {
        self.get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownConstant(name.to_string()))
    }
}

/// Clonable handle carrying the close signal for a context.
///
/// `close` may be called from any task, any number of times. The driver
/// notices at its next resource operation or section boundary, aborts
/// whatever the current section touched, closes every resource, and makes
/// [`ArchetypeContext::run`] return `Ok(())`.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    closing: Arc<AtomicBool>,
}

impl ContextHandle {
    /// Request that the context shut down.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Whether close has been requested.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

struct ResourceSlot {
    name: String,
    resource: BoxResource,
}

/// Builder for an [`ArchetypeContext`].
pub struct ContextBuilder {
    self_id: Value,
    archetype: Arc<dyn Archetype>,
    constants: BTreeMap<String, Value>,
    resources: Vec<(String, ResourceMaker)>,
    retry: RetryPolicy,
}

impl ContextBuilder {
    /// Bind one constant value.
    #[must_use]
    pub fn define_constant(mut self, name: impl Into<String>, value: Value) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    /// Merge a pre-built constants table (individual
    /// [`Self::define_constant`] calls win on collision).
    #[must_use]
    pub fn constants(mut self, constants: &Constants) -> Self {
        for (name, value) in constants.0.iter() {
            self.constants
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Bind a named resource parameter to a maker.
    #[must_use]
    pub fn resource(mut self, name: impl Into<String>, maker: ResourceMaker) -> Self {
        self.resources.push((name.into(), maker));
        self
    }

    /// Override the abort-retry backoff policy.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Instantiate every resource and produce the context plus its handle.
    ///
    /// Must run inside the async runtime: makers may spawn background
    /// tasks (mailbox listeners, failure-detector pollers).
    #[must_use]
    pub fn finish(self) -> (ArchetypeContext, ContextHandle) {
        let mut slots = Vec::with_capacity(self.resources.len() + 1);
        let mut by_name = HashMap::new();

        // The program counter is slot 0, initialized to the entry label.
        let entry = Value::string(self.archetype.entry_label());
        slots.push(ResourceSlot {
            name: PC_RESOURCE.to_string(),
            resource: Box::new(LocalRegister::new(entry)),
        });
        by_name.insert(PC_RESOURCE.to_string(), 0);

        for (name, maker) in self.resources {
            let slot = slots.len();
            slots.push(ResourceSlot {
                name: name.clone(),
                resource: maker(),
            });
            by_name.insert(name, slot);
        }

        let closing = Arc::new(AtomicBool::new(false));
        let handle = ContextHandle {
            closing: Arc::clone(&closing),
        };
        let context = ArchetypeContext {
            self_id: self.self_id,
            archetype: self.archetype,
            constants: Constants(Arc::new(self.constants)),
            slots,
            by_name,
            dirty: Vec::new(),
            closing,
            retry: self.retry,
            started: false,
        };
        (context, handle)
    }
}

/// The execution context of one archetype instance.
///
/// Created before the archetype starts, driven by exactly one task, closed
/// once. Section code receives `&mut ArchetypeContext` and interacts with
/// resources exclusively through [`Self::read`], [`Self::write`], and
/// [`Self::goto`].
pub struct ArchetypeContext {
    self_id: Value,
    archetype: Arc<dyn Archetype>,
    constants: Constants,
    slots: Vec<ResourceSlot>,
    by_name: HashMap<String, usize>,
    /// Slots touched since the last commit boundary, in first-touch order.
    dirty: Vec<usize>,
    closing: Arc<AtomicBool>,
    retry: RetryPolicy,
    started: bool,
}

impl ArchetypeContext {
    /// Start building a context for `archetype` running as `self_id`.
    #[must_use]
    pub fn builder(self_id: Value, archetype: impl Archetype) -> ContextBuilder {
        ContextBuilder {
            self_id,
            archetype: Arc::new(archetype),
            constants: BTreeMap::new(),
            resources: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// The archetype's self-identifier.
    #[must_use]
    pub fn self_id(&self) -> &Value {
        &self.self_id
    }

    /// The bound constants.
    #[must_use]
    pub fn constants(&self) -> &Constants {
        &self.constants
    }

    /// Read one constant value.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::UnknownConstant`] when the deployment did not bind it.
    pub fn constant(&self, name: &str) -> Result<Value> {
        self.constants.require(name)
    }

    /// Read a resource (optionally through a path of map indices).
    ///
    /// # Errors
    ///
    /// Propagates resource errors; [`RuntimeError::ContextClosed`] once
    /// close has been requested.
    pub async fn read(&mut self, name: &str, path: &[Value]) -> Result<Value> {
        self.target(name, path)?.read_value().await
    }

    /// Write a resource (optionally through a path of map indices). The
    /// write takes effect at commit.
    ///
    /// # Errors
    ///
    /// Propagates resource errors; [`RuntimeError::ContextClosed`] once
    /// close has been requested.
    pub async fn write(&mut self, name: &str, path: &[Value], value: Value) -> Result<()> {
        self.target(name, path)?.write_value(value).await
    }

    /// Jump to `label`: the critical section ends here and, once the commit
    /// protocol succeeds, execution continues at `label`.
    ///
    /// # Errors
    ///
    /// As for [`Self::write`].
    pub async fn goto(&mut self, label: &str) -> Result<()> {
        self.write(PC_RESOURCE, &[], Value::string(label)).await
    }

    /// Jump to the termination label.
    ///
    /// # Errors
    ///
    /// As for [`Self::write`].
    pub async fn done(&mut self) -> Result<()> {
        self.goto(DONE_LABEL).await
    }

    /// Resolve a resource operation target, marking the root slot dirty.
    fn target(&mut self, name: &str, path: &[Value]) -> Result<&mut dyn ArchetypeResource> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(RuntimeError::ContextClosed);
        }
        let slot = *self
            .by_name
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownResource(name.to_string()))?;
        if !self.dirty.contains(&slot) {
            self.dirty.push(slot);
        }
        let mut target: &mut dyn ArchetypeResource = self.slots[slot].resource.as_mut();
        for index in path {
            target = target.index(index)?;
        }
        Ok(target)
    }

    fn close_requested(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Drive the archetype to termination.
    ///
    /// Runs the label loop: read `.pc`, execute the section, commit or
    /// abort-and-retry, until the archetype jumps to [`DONE_LABEL`] or the
    /// context is closed. Always closes every resource exactly once before
    /// returning.
    ///
    /// # Errors
    ///
    /// Fatal resource or type errors. A close while running is not a
    /// failure: the result is `Ok(())`.
    pub async fn run(&mut self) -> Result<()> {
        if self.started {
            return Err(RuntimeError::misuse("context run twice"));
        }
        self.started = true;

        let archetype = Arc::clone(&self.archetype);
        info!(archetype = archetype.name(), self_id = %self.self_id, "archetype starting");

        let result = self.drive(archetype.as_ref()).await;

        match &result {
            Ok(()) => info!(archetype = archetype.name(), "archetype stopped"),
            Err(error) => warn!(archetype = archetype.name(), %error, "archetype failed"),
        }

        let close_result = self.close_resources().await;
        result.and(close_result)
    }

    async fn drive(&mut self, archetype: &dyn Archetype) -> Result<()> {
        loop {
            if self.close_requested() {
                self.abort_section().await;
                return Ok(());
            }

            let label = match self.read(PC_RESOURCE, &[]).await {
                Ok(pc) => pc.as_str()?.to_string(),
                Err(RuntimeError::ContextClosed) => {
                    self.abort_section().await;
                    return Ok(());
                },
                Err(error) => return Err(error),
            };

            if label == DONE_LABEL {
                // Nothing left to run; the trailing pc read needs no commit.
                self.abort_section().await;
                return Ok(());
            }

            match archetype.section(&label, self).await {
                Ok(()) => match self.finish_section(&label).await {
                    Ok(()) => {},
                    Err(RuntimeError::ContextClosed) => return Ok(()),
                    Err(error) => return Err(error),
                },
                Err(RuntimeError::CriticalSectionAborted) => {
                    debug!(label, "critical section aborted; retrying");
                    self.abort_section().await;
                    if !self.close_requested() {
                        self.retry.pause().await;
                    }
                },
                Err(RuntimeError::ContextClosed) => {
                    self.abort_section().await;
                    return Ok(());
                },
                Err(error) => {
                    self.abort_section().await;
                    return Err(error);
                },
            }
        }
    }

    /// Run the commit protocol at a label boundary.
    async fn finish_section(&mut self, label: &str) -> Result<()> {
        if self.close_requested() {
            self.abort_section().await;
            return Err(RuntimeError::ContextClosed);
        }
        match self.pre_commit_section().await {
            Ok(()) => {
                self.commit_section().await?;
                self.retry.reset();
                Ok(())
            },
            Err(RuntimeError::CriticalSectionAborted) => {
                debug!(label, "pre-commit rejected; retrying section");
                self.abort_section().await;
                if !self.close_requested() {
                    self.retry.pause().await;
                }
                Ok(())
            },
            Err(error) => {
                self.abort_section().await;
                Err(error)
            },
        }
    }

    async fn pre_commit_section(&mut self) -> Result<()> {
        let dirty = self.dirty.clone();
        for slot in dirty {
            self.slots[slot].resource.pre_commit().await?;
        }
        Ok(())
    }

    async fn commit_section(&mut self) -> Result<()> {
        let dirty = std::mem::take(&mut self.dirty);
        for slot in dirty {
            self.slots[slot].resource.commit().await?;
        }
        Ok(())
    }

    async fn abort_section(&mut self) {
        let dirty = std::mem::take(&mut self.dirty);
        for slot in dirty {
            self.slots[slot].resource.abort().await;
        }
    }

    async fn close_resources(&mut self) -> Result<()> {
        let mut first_error = None;
        for slot in &mut self.slots {
            if let Err(error) = slot.resource.close().await {
                warn!(resource = %slot.name, %error, "resource close failed");
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}
