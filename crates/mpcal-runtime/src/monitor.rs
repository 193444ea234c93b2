//! Node-liveness monitor service.
//!
//! A monitor is a separately addressable TCP server answering three
//! requests: `Register` (begin tracking a peer), `Heartbeat` (liveness
//! signal), and `Query` (is this peer alive?). Failure-detector resources
//! are its clients.
//!
//! Evidence of life comes from two sources, judged uniformly:
//!
//! - **The shim**: [`Monitor::run_archetype`] marks an archetype alive for
//!   exactly the duration of its run. The monitor owns the lifetime tying;
//!   the context never references the monitor, only the driver wrapper
//!   does.
//! - **Heartbeats**: archetypes in other processes run a
//!   [`HeartbeatClient`], which registers on startup, heartbeats on an
//!   interval, and silently re-registers after a monitor restart.
//!
//! Heartbeat timestamps only ever advance, so concurrent heartbeats for
//! one peer over different connections cannot make its status oscillate.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use mpcal_tla::Value;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::context::ArchetypeContext;
use crate::error::{Result, RuntimeError};
use crate::net::framing::FrameCodec;
use crate::net::wire::{MonitorReply, MonitorRequest};

/// Monitor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Silence tolerated after the last heartbeat before a remotely
    /// tracked peer is suspected.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
}

const fn default_window() -> Duration {
    Duration::from_secs(5)
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
        }
    }
}

struct MonitorState {
    window: Duration,
    /// Last heartbeat instant per remotely tracked peer.
    heartbeats: Mutex<HashMap<Value, Instant>>,
    /// Peers currently running in-process under the shim.
    running: Mutex<BTreeSet<Value>>,
}

impl MonitorState {
    fn observe(&self, peer: Value) {
        let now = Instant::now();
        let mut heartbeats = self.heartbeats.lock().expect("monitor lock");
        let entry = heartbeats.entry(peer).or_insert(now);
        // Monotonic: evidence of life never moves backwards.
        if now > *entry {
            *entry = now;
        }
    }

    fn is_alive(&self, peer: &Value) -> bool {
        if self.running.lock().expect("monitor lock").contains(peer) {
            return true;
        }
        self.heartbeats
            .lock()
            .expect("monitor lock")
            .get(peer)
            .is_some_and(|last| last.elapsed() < self.window)
    }
}

/// The monitor server.
pub struct Monitor {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    state: Arc<MonitorState>,
    shutdown: watch::Sender<bool>,
}

impl Monitor {
    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound.
    pub async fn bind(addr: &str, config: MonitorConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);
        info!(%local_addr, "monitor listening");
        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            state: Arc::new(MonitorState {
                window: config.window,
                heartbeats: Mutex::new(HashMap::new()),
                running: Mutex::new(BTreeSet::new()),
            }),
            shutdown,
        })
    }

    /// The bound address (useful when binding port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve clients until [`Monitor::close`].
    ///
    /// # Errors
    ///
    /// Fails if called twice, or on an unrecoverable accept error.
    pub async fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("monitor lock")
            .take()
            .ok_or_else(|| RuntimeError::misuse("monitor served twice"))?;
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "monitor client connected");
                        let state = Arc::clone(&self.state);
                        let shutdown = self.shutdown.subscribe();
                        tokio::spawn(serve_client(stream, state, shutdown));
                    },
                    Err(error) => {
                        warn!(%error, "monitor accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    },
                },
                _ = async {
                    while !*shutdown.borrow() {
                        if shutdown.changed().await.is_err() {
                            break;
                        }
                    }
                } => break,
            }
        }
        Ok(())
    }

    /// Stop serving. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run an archetype context under this monitor: the archetype's peer
    /// identifier counts as alive for exactly the duration of the run.
    ///
    /// # Errors
    ///
    /// Whatever [`ArchetypeContext::run`] returns.
    pub async fn run_archetype(&self, ctx: &mut ArchetypeContext) -> Result<()> {
        let peer = ctx.self_id().clone();
        self.state
            .running
            .lock()
            .expect("monitor lock")
            .insert(peer.clone());
        let result = ctx.run().await;
        self.state.running.lock().expect("monitor lock").remove(&peer);
        result
    }
}

async fn serve_client(
    stream: TcpStream,
    state: Arc<MonitorState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = async {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            } => break,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                debug!(%error, "monitor connection error");
                break;
            },
            None => break,
        };
        let request = match MonitorRequest::from_bytes(&frame) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, "malformed monitor frame");
                break;
            },
        };
        let reply = match request {
            MonitorRequest::Register { peer, .. } | MonitorRequest::Heartbeat { peer, .. } => {
                state.observe(peer);
                MonitorReply::Ok
            },
            MonitorRequest::Query { peer } => {
                if state.is_alive(&peer) {
                    MonitorReply::Alive
                } else {
                    MonitorReply::Suspected
                }
            },
        };
        if let Err(error) = framed.send(reply.to_bytes()).await {
            debug!(%error, "monitor reply failed");
            break;
        }
    }
}

/// Request/reply client for a monitor, reconnecting lazily.
pub struct MonitorClient {
    addr: String,
    dial_timeout: Duration,
    round_trip_timeout: Duration,
    conn: Option<Framed<TcpStream, FrameCodec>>,
}

impl MonitorClient {
    /// A client for the monitor at `addr`.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout: Duration::from_secs(1),
            round_trip_timeout: Duration::from_secs(2),
            conn: None,
        }
    }

    /// Override the connection and round-trip timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, dial: Duration, round_trip: Duration) -> Self {
        self.dial_timeout = dial;
        self.round_trip_timeout = round_trip;
        self
    }

    /// One request/reply exchange. Drops the connection on any failure so
    /// the next call reconnects.
    ///
    /// # Errors
    ///
    /// I/O errors, timeouts, and malformed replies.
    pub async fn request(&mut self, request: &MonitorRequest) -> std::io::Result<MonitorReply> {
        use std::io::{Error, ErrorKind};

        let payload = request
            .to_bytes()
            .map_err(|error| Error::new(ErrorKind::InvalidData, error))?;

        if self.conn.is_none() {
            let stream = timeout(self.dial_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| Error::new(ErrorKind::TimedOut, "monitor dial timed out"))??;
            stream.set_nodelay(true)?;
            self.conn = Some(Framed::new(stream, FrameCodec::new()));
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::new(ErrorKind::NotConnected, "monitor not connected"));
        };

        let exchange = async {
            conn.send(payload).await?;
            match timeout(self.round_trip_timeout, conn.next()).await {
                Ok(Some(Ok(frame))) => MonitorReply::from_bytes(&frame)
                    .map_err(|error| Error::new(ErrorKind::InvalidData, error)),
                Ok(Some(Err(error))) => Err(error),
                Ok(None) => Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "monitor connection closed",
                )),
                Err(_) => Err(Error::new(ErrorKind::TimedOut, "monitor reply timed out")),
            }
        };
        let result = exchange.await;
        if result.is_err() {
            self.conn = None;
        }
        result
    }
}

/// Background heartbeat loop for an archetype running in a different
/// process from its monitor.
pub struct HeartbeatClient {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatClient {
    /// Start heartbeating `peer` to the monitor at `addr` every
    /// `interval`. Registers on the first exchange and re-registers
    /// whenever the connection is re-established, so a restarted monitor
    /// picks the peer back up lazily.
    #[must_use]
    pub fn start(addr: impl Into<String>, peer: Value, interval: Duration) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(heartbeat_loop(addr.into(), peer, interval, shutdown_rx));
        Self { shutdown, task }
    }

    /// Stop heartbeating and wait for the loop to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.task).await;
    }
}

async fn heartbeat_loop(
    addr: String,
    peer: Value,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut client = MonitorClient::new(addr.clone());
    let mut registered = false;
    loop {
        let request = if registered {
            MonitorRequest::Heartbeat {
                peer: peer.clone(),
                timestamp_ms: unix_millis(),
            }
        } else {
            MonitorRequest::Register {
                peer: peer.clone(),
                timestamp_ms: unix_millis(),
            }
        };
        match client.request(&request).await {
            Ok(MonitorReply::Ok) => registered = true,
            Ok(_) => {
                warn!(%addr, "unexpected monitor reply to heartbeat");
            },
            Err(error) => {
                debug!(%addr, %error, "heartbeat failed; will re-register");
                registered = false;
            },
        }
        tokio::select! {
            () = tokio::time::sleep(interval) => {},
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

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
