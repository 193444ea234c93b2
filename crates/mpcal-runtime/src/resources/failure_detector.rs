//! Boolean suspicion of peers, backed by a monitor.
//!
//! A failure detector is a mapped resource: indexing it with a peer
//! identifier yields a read-only boolean sub-resource, `true` meaning
//! "peer suspected dead". Each sub-resource owns a poller task that
//! queries the peer's monitor every `pull_interval` and caches the
//! verdict; reads return the cache and therefore block for at most one
//! round-trip (the initial poll).
//!
//! Suspicion is deliberately two-way: a suspected peer whose heartbeats
//! resume becomes unsuspected again as evidence accumulates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mpcal_tla::Value;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::monitor::MonitorClient;
use crate::net::wire::{MonitorReply, MonitorRequest};
use crate::resource::{self, ArchetypeResource, BoxResource, ResourceMaker};

/// Deployment callback mapping a peer identifier to its monitor address.
pub type MonitorAddressFn = dyn Fn(&Value) -> String + Send + Sync;

/// Failure-detector tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDetectorConfig {
    /// Cadence of monitor polling.
    #[serde(default = "default_pull_interval", with = "humantime_serde")]
    pub pull_interval: Duration,

    /// Silence tolerated on one query (dial plus reply) before the poll
    /// counts as evidence of death.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

const fn default_pull_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            pull_interval: default_pull_interval(),
            timeout: default_timeout(),
        }
    }
}

/// The mapped failure-detector resource.
pub struct FailureDetector {
    monitor_addr_of: Arc<MonitorAddressFn>,
    config: FailureDetectorConfig,
    slots: BTreeMap<Value, BoxResource>,
    touched: Vec<Value>,
}

impl FailureDetector {
    /// Maker for context construction.
    #[must_use]
    pub fn maker(
        monitor_addr_of: impl Fn(&Value) -> String + Send + Sync + 'static,
        config: FailureDetectorConfig,
    ) -> ResourceMaker {
        let monitor_addr_of: Arc<MonitorAddressFn> = Arc::new(monitor_addr_of);
        resource::maker(move || Self {
            monitor_addr_of,
            config,
            slots: BTreeMap::new(),
            touched: Vec::new(),
        })
    }
}

#[async_trait]
impl ArchetypeResource for FailureDetector {
    fn index(&mut self, index: &Value) -> Result<&mut dyn ArchetypeResource> {
        if !self.slots.contains_key(index) {
            let addr = (self.monitor_addr_of)(index);
            debug!(peer = %index, monitor = %addr, "starting failure-detector poller");
            let slot = FailureDetectorSlot::start(addr, index.clone(), &self.config);
            self.slots.insert(index.clone(), Box::new(slot));
        }
        if !self.touched.contains(index) {
            self.touched.push(index.clone());
        }
        match self.slots.get_mut(index) {
            Some(slot) => Ok(&mut **slot),
            None => Err(RuntimeError::misuse("failure-detector slot missing")),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let touched = std::mem::take(&mut self.touched);
        for index in &touched {
            if let Some(slot) = self.slots.get_mut(index) {
                slot.commit().await?;
            }
        }
        Ok(())
    }

    async fn abort(&mut self) {
        let touched = std::mem::take(&mut self.touched);
        for index in &touched {
            if let Some(slot) = self.slots.get_mut(index) {
                slot.abort().await;
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for (index, slot) in &mut self.slots {
            if let Err(error) = slot.close().await {
                warn!(peer = %index, %error, "failure-detector close failed");
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

/// One peer's suspicion status.
pub struct FailureDetectorSlot {
    status: watch::Receiver<Option<bool>>,
    /// First read of a section pins the value for snapshot stability;
    /// commit and abort release the pin.
    pinned: Option<bool>,
    first_poll_timeout: Duration,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FailureDetectorSlot {
    /// Spawn the poller for `peer` against the monitor at `addr`.
    #[must_use]
    pub fn start(addr: String, peer: Value, config: &FailureDetectorConfig) -> Self {
        let (status_tx, status) = watch::channel(None);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            addr,
            peer,
            config.clone(),
            status_tx,
            shutdown_rx,
        ));
        Self {
            status,
            pinned: None,
            // One dial plus one reply.
            first_poll_timeout: config.timeout + config.timeout,
            shutdown,
            task,
        }
    }
}

#[async_trait]
impl ArchetypeResource for FailureDetectorSlot {
    async fn read_value(&mut self) -> Result<Value> {
        if let Some(suspected) = self.pinned {
            return Ok(Value::bool(suspected));
        }
        let cached = *self.status.borrow();
        let suspected = match cached {
            Some(suspected) => suspected,
            // No poll has completed yet: wait for the first one, at most
            // one round-trip. A silent monitor counts as suspicion.
            None => {
                let mut status = self.status.clone();
                let outcome = match timeout(self.first_poll_timeout, status.wait_for(Option::is_some)).await {
                    Ok(Ok(verdict)) => (*verdict).unwrap_or(true),
                    _ => true,
                };
                outcome
            },
        };
        self.pinned = Some(suspected);
        Ok(Value::bool(suspected))
    }

    async fn write_value(&mut self, _value: Value) -> Result<()> {
        Err(RuntimeError::misuse("failure detector is read-only"))
    }

    async fn commit(&mut self) -> Result<()> {
        self.pinned = None;
        Ok(())
    }

    async fn abort(&mut self) {
        self.pinned = None;
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.task).await;
        Ok(())
    }
}

async fn poll_loop(
    addr: String,
    peer: Value,
    config: FailureDetectorConfig,
    status: watch::Sender<Option<bool>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut client = MonitorClient::new(addr).with_timeouts(config.timeout, config.timeout);
    loop {
        let request = MonitorRequest::Query { peer: peer.clone() };
        let suspected = match client.request(&request).await {
            Ok(MonitorReply::Alive) => false,
            Ok(MonitorReply::Suspected | MonitorReply::Ok) => true,
            Err(error) => {
                debug!(%error, "failure-detector query failed; suspecting");
                true
            },
        };
        if status.send(Some(suspected)).is_err() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(config.pull_interval) => {},
            _ = async {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            } => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{HeartbeatClient, Monitor, MonitorConfig};

    fn fast_config() -> FailureDetectorConfig {
        FailureDetectorConfig {
            pull_interval: Duration::from_millis(50),
            timeout: Duration::from_millis(300),
        }
    }

    async fn serving_monitor(window: Duration) -> Arc<Monitor> {
        let monitor = Arc::new(
            Monitor::bind("127.0.0.1:0", MonitorConfig { window })
                .await
                .unwrap(),
        );
        let server = Arc::clone(&monitor);
        tokio::spawn(async move {
            server.serve().await.unwrap();
        });
        monitor
    }

    #[tokio::test]
    async fn unreachable_monitor_means_suspected() {
        let config = fast_config();
        let mut slot =
            FailureDetectorSlot::start("127.0.0.1:1".to_string(), Value::number(1), &config);
        assert_eq!(slot.read_value().await.unwrap(), Value::bool(true));
        slot.close().await.unwrap();
    }

    #[tokio::test]
    async fn tracked_peer_reads_alive_then_suspected_after_silence() {
        let window = Duration::from_millis(250);
        let monitor = serving_monitor(window).await;
        let addr = monitor.local_addr().to_string();
        let peer = Value::number(2);
        let config = fast_config();

        let heartbeats =
            HeartbeatClient::start(addr.clone(), peer.clone(), Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut slot = FailureDetectorSlot::start(addr, peer, &config);
        assert_eq!(slot.read_value().await.unwrap(), Value::bool(false));
        slot.commit().await.unwrap();

        heartbeats.stop().await;
        tokio::time::sleep(window + Duration::from_millis(200)).await;
        assert_eq!(slot.read_value().await.unwrap(), Value::bool(true));

        slot.close().await.unwrap();
        monitor.close();
    }

    #[tokio::test]
    async fn reads_are_pinned_within_a_section() {
        let window = Duration::from_millis(200);
        let monitor = serving_monitor(window).await;
        let addr = monitor.local_addr().to_string();
        let peer = Value::number(5);
        let config = fast_config();

        let heartbeats =
            HeartbeatClient::start(addr.clone(), peer.clone(), Duration::from_millis(40));
        tokio::time::sleep(Duration::from_millis(120)).await;

        let mut slot = FailureDetectorSlot::start(addr, peer, &config);
        assert_eq!(slot.read_value().await.unwrap(), Value::bool(false));

        // The world changes mid-section...
        heartbeats.stop().await;
        tokio::time::sleep(window + Duration::from_millis(200)).await;

        // ...but the section's snapshot does not.
        assert_eq!(slot.read_value().await.unwrap(), Value::bool(false));

        // A new section sees the new truth.
        slot.abort().await;
        assert_eq!(slot.read_value().await.unwrap(), Value::bool(true));

        slot.close().await.unwrap();
        monitor.close();
    }

    #[tokio::test]
    async fn writing_suspicion_is_misuse() {
        let config = fast_config();
        let mut slot =
            FailureDetectorSlot::start("127.0.0.1:1".to_string(), Value::number(1), &config);
        assert!(matches!(
            slot.write_value(Value::bool(false)).await.unwrap_err(),
            RuntimeError::ProtocolMisuse(_)
        ));
        slot.close().await.unwrap();
    }
}
