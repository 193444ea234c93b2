//! Archetype-private register.

use async_trait::async_trait;
use mpcal_tla::Value;

use crate::error::Result;
use crate::resource::{self, ArchetypeResource, ResourceMaker};

/// A leaf resource holding one value in archetype-private memory.
///
/// The first write in a critical section remembers the prior value; abort
/// restores it, commit forgets it. This is the shadow-state technique every
/// stateful resource uses, in its smallest form.
#[derive(Debug)]
pub struct LocalRegister {
    value: Value,
    /// Present iff this register has been written in the current section.
    old_value: Option<Value>,
}

impl LocalRegister {
    /// A register holding `initial`.
    #[must_use]
    pub fn new(initial: Value) -> Self {
        Self {
            value: initial,
            old_value: None,
        }
    }

    /// Maker for context construction.
    #[must_use]
    pub fn maker(initial: Value) -> ResourceMaker {
        resource::maker(move || Self::new(initial))
    }
}

#[async_trait]
impl ArchetypeResource for LocalRegister {
    async fn read_value(&mut self) -> Result<Value> {
        Ok(self.value.clone())
    }

    async fn write_value(&mut self, value: Value) -> Result<()> {
        if self.old_value.is_none() {
            self.old_value = Some(self.value.clone());
        }
        self.value = value;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.old_value = None;
        Ok(())
    }

    async fn abort(&mut self) {
        if let Some(old) = self.old_value.take() {
            self.value = old;
        }
    }
}
