//! Stand-in for declared-but-unused archetype parameters.

use async_trait::async_trait;
use mpcal_tla::Value;

use crate::error::{Result, RuntimeError};
use crate::resource::{self, ArchetypeResource, ResourceMaker};

/// A resource that accepts no operation.
///
/// Deployments bind a placeholder to archetype parameters that the chosen
/// configuration never exercises (e.g. a failure detector on a server that
/// runs with failure exploration disabled). Touching it is a programmer
/// error and is diagnosed as such rather than silently tolerated.
#[derive(Debug, Default)]
pub struct PlaceHolder;

impl PlaceHolder {
    /// Maker for context construction.
    #[must_use]
    pub fn maker() -> ResourceMaker {
        resource::maker(|| Self)
    }

    fn accessed() -> RuntimeError {
        RuntimeError::misuse("placeholder resource accessed; bind a real resource")
    }
}

#[async_trait]
impl ArchetypeResource for PlaceHolder {
    async fn read_value(&mut self) -> Result<Value> {
        Err(Self::accessed())
    }

    async fn write_value(&mut self, _value: Value) -> Result<()> {
        Err(Self::accessed())
    }

    fn index(&mut self, _index: &Value) -> Result<&mut dyn ArchetypeResource> {
        Err(Self::accessed())
    }
}
