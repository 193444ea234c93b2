//! Bridges between an archetype and its embedding host process.
//!
//! Both directions are modeled on bounded `tokio::sync::mpsc` queues owned
//! by the host. There is no cross-resource atomicity beyond the section's
//! own commit: an input value is consumed at commit (aborting replays it),
//! and an output value is published exactly at commit.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use mpcal_tla::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{Result, RuntimeError};
use crate::resource::{self, ArchetypeResource, ResourceMaker};

/// How long a blocked input read waits before letting the driver abort the
/// section and re-check for shutdown.
const RECV_POLL: Duration = Duration::from_millis(20);

/// Host-to-archetype value stream. Leaf, read-only.
#[derive(Debug)]
pub struct InputChannel {
    rx: mpsc::Receiver<Value>,
    /// Values consumed in an aborted section, to re-deliver in order.
    replay: VecDeque<Value>,
    /// Values handed to the current section, pending commit.
    pending: Vec<Value>,
}

impl InputChannel {
    /// Wrap the receiving half of a host channel.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Value>) -> Self {
        Self {
            rx,
            replay: VecDeque::new(),
            pending: Vec::new(),
        }
    }

    /// Maker for context construction.
    #[must_use]
    pub fn maker(rx: mpsc::Receiver<Value>) -> ResourceMaker {
        resource::maker(move || Self::new(rx))
    }
}

#[async_trait]
impl ArchetypeResource for InputChannel {
    async fn read_value(&mut self) -> Result<Value> {
        if let Some(value) = self.replay.pop_front() {
            self.pending.push(value.clone());
            return Ok(value);
        }
        match timeout(RECV_POLL, self.rx.recv()).await {
            Ok(Some(value)) => {
                self.pending.push(value.clone());
                Ok(value)
            },
            // Sender dropped or nothing arrived in time: let the driver
            // abort, back off, and retry (or notice a pending close).
            Ok(None) | Err(_) => Err(RuntimeError::CriticalSectionAborted),
        }
    }

    async fn write_value(&mut self, _value: Value) -> Result<()> {
        Err(RuntimeError::misuse("input channel is read-only"))
    }

    async fn commit(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    async fn abort(&mut self) {
        for value in self.pending.drain(..).rev() {
            self.replay.push_front(value);
        }
    }
}

/// Archetype-to-host value stream. Leaf, write-only.
#[derive(Debug)]
pub struct OutputChannel {
    tx: mpsc::Sender<Value>,
    /// Writes buffered in the current section, published at commit.
    buffered: Vec<Value>,
}

impl OutputChannel {
    /// Wrap the sending half of a host channel.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Value>) -> Self {
        Self {
            tx,
            buffered: Vec::new(),
        }
    }

    /// Maker for context construction.
    #[must_use]
    pub fn maker(tx: mpsc::Sender<Value>) -> ResourceMaker {
        resource::maker(move || Self::new(tx))
    }
}

#[async_trait]
impl ArchetypeResource for OutputChannel {
    async fn read_value(&mut self) -> Result<Value> {
        Err(RuntimeError::misuse("output channel is write-only"))
    }

    async fn write_value(&mut self, value: Value) -> Result<()> {
        self.buffered.push(value);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        for value in std::mem::take(&mut self.buffered) {
            self.tx.send(value).await.map_err(|_| {
                RuntimeError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "output channel receiver dropped",
                ))
            })?;
        }
        Ok(())
    }

    async fn abort(&mut self) {
        self.buffered.clear();
    }
}
