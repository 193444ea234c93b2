//! Reliable in-order buffered TCP mailboxes.
//!
//! A mailbox network is one mapped resource: indexing it with a peer
//! identifier yields either this archetype's own inbox (**Local**) or an
//! outbound queue to another address (**Remote**), as decided by the
//! deployment's address callback.
//!
//! # Delivery protocol
//!
//! One critical section's writes to one peer travel as a single staged
//! batch:
//!
//! 1. `pre_commit` sends `Batch { sender, seq, values }`. The listener
//!    stages it if the inbox has room, else replies `Full` (which surfaces
//!    as a section abort — backpressure).
//! 2. `commit` sends `Commit { sender, seq }`; the listener moves the
//!    staged values into the inbox. Commits are applied at most once per
//!    `(sender, seq)`, so a retry after a lost ack or reconnect cannot
//!    duplicate messages.
//! 3. `abort` sends `Abort`; the listener discards the staged batch. A
//!    dropped connection discards it too.
//!
//! FIFO per (sender, receiver) pair follows from a single ordered
//! connection per remote sub-resource plus the total order of commits
//! within one archetype.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mpcal_tla::Value;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{Result, RuntimeError};
use crate::net::framing::FrameCodec;
use crate::net::wire::{MailboxMessage, MailboxReply};
use crate::resource::{self, ArchetypeResource, BoxResource, ResourceMaker};
use crate::retry::RetryPolicy;

/// Whether a mailbox index addresses this archetype's inbox or a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
    /// This archetype's own inbox; runs the listener.
    Local,
    /// An outbound queue to another archetype's listener.
    Remote,
}

/// Deployment callback mapping a mailbox index to a kind and address.
pub type AddressFn = dyn Fn(&Value) -> (MailboxKind, String) + Send + Sync;

/// Tuning knobs for a mailbox network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Committed messages an inbox holds before refusing new batches.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,

    /// How long a blocked inbox read waits before letting the driver abort
    /// the section (and notice a pending close).
    #[serde(default = "default_recv_poll", with = "humantime_serde")]
    pub recv_poll: Duration,

    /// Connection establishment timeout.
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Timeout for one request/reply exchange with a listener.
    #[serde(default = "default_round_trip_timeout", with = "humantime_serde")]
    pub round_trip_timeout: Duration,

    /// Commit attempts (reconnect + re-send) before a broken connection
    /// escalates from transient aborts to a fatal I/O error.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
}

const fn default_inbox_capacity() -> usize {
    128
}

const fn default_recv_poll() -> Duration {
    Duration::from_millis(200)
}

const fn default_dial_timeout() -> Duration {
    Duration::from_secs(1)
}

const fn default_round_trip_timeout() -> Duration {
    Duration::from_secs(2)
}

const fn default_commit_retries() -> u32 {
    16
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
            recv_poll: default_recv_poll(),
            dial_timeout: default_dial_timeout(),
            round_trip_timeout: default_round_trip_timeout(),
            commit_retries: default_commit_retries(),
        }
    }
}

/// The mapped mailbox resource.
///
/// Sub-resources materialize lazily on first index and are owned (and
/// closed) by this resource. A sub-resource counts as touched from its
/// first index in a section; the commit lifecycle fans out to every
/// touched sub-resource.
pub struct TcpMailboxes {
    address_of: Arc<AddressFn>,
    config: MailboxConfig,
    subs: BTreeMap<Value, BoxResource>,
    touched: Vec<Value>,
}

impl TcpMailboxes {
    /// Maker for context construction.
    #[must_use]
    pub fn maker(
        address_of: impl Fn(&Value) -> (MailboxKind, String) + Send + Sync + 'static,
        config: MailboxConfig,
    ) -> ResourceMaker {
        let address_of: Arc<AddressFn> = Arc::new(address_of);
        resource::maker(move || Self {
            address_of,
            config,
            subs: BTreeMap::new(),
            touched: Vec::new(),
        })
    }
}

#[async_trait]
impl ArchetypeResource for TcpMailboxes {
    fn index(&mut self, index: &Value) -> Result<&mut dyn ArchetypeResource> {
        if !self.subs.contains_key(index) {
            let (kind, addr) = (self.address_of)(index);
            debug!(index = %index, ?kind, %addr, "materializing mailbox");
            let sub: BoxResource = match kind {
                MailboxKind::Local => Box::new(LocalMailbox::start(&addr, &self.config)?),
                MailboxKind::Remote => Box::new(RemoteMailbox::new(addr, self.config.clone())),
            };
            self.subs.insert(index.clone(), sub);
        }
        if !self.touched.contains(index) {
            self.touched.push(index.clone());
        }
        match self.subs.get_mut(index) {
            Some(sub) => Ok(&mut **sub),
            None => Err(RuntimeError::misuse("mailbox sub-resource missing")),
        }
    }

    async fn pre_commit(&mut self) -> Result<()> {
        let touched = self.touched.clone();
        for index in &touched {
            if let Some(sub) = self.subs.get_mut(index) {
                sub.pre_commit().await?;
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let touched = std::mem::take(&mut self.touched);
        for index in &touched {
            if let Some(sub) = self.subs.get_mut(index) {
                sub.commit().await?;
            }
        }
        Ok(())
    }

    async fn abort(&mut self) {
        let touched = std::mem::take(&mut self.touched);
        for index in &touched {
            if let Some(sub) = self.subs.get_mut(index) {
                sub.abort().await;
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for (index, sub) in &mut self.subs {
            if let Err(error) = sub.close().await {
                warn!(index = %index, %error, "mailbox close failed");
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

// ---------------------------------------------------------------------
// Local (inbox) side
// ---------------------------------------------------------------------

/// Inbox state shared between the archetype reader and listener tasks.
struct Inbox {
    capacity: usize,
    state: Mutex<InboxState>,
    /// Wakes the (single) archetype reader when a batch commits.
    readable: Notify,
}

#[derive(Default)]
struct InboxState {
    queue: VecDeque<Value>,
    /// Highest committed sequence number per sender identity.
    committed_seq: HashMap<u64, u64>,
}

impl Inbox {
    fn pop(&self) -> Option<Value> {
        self.state.lock().expect("inbox lock").queue.pop_front()
    }

    fn requeue_front(&self, values: Vec<Value>) {
        let mut state = self.state.lock().expect("inbox lock");
        for value in values.into_iter().rev() {
            state.queue.push_front(value);
        }
    }
}

/// This archetype's own inbox: a listener plus a committed message queue.
pub struct LocalMailbox {
    inbox: Arc<Inbox>,
    /// Messages handed to the current section, re-queued in order on abort
    /// and acknowledged (dropped) on commit.
    held: Vec<Value>,
    recv_poll: Duration,
    local_addr: std::net::SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl LocalMailbox {
    /// Bind `addr` and start the listener.
    ///
    /// Binding is synchronous (no network wait) so this is callable from
    /// the non-blocking `index` path; the accept loop runs as a background
    /// task owned by this resource and stops at `close`.
    ///
    /// # Errors
    ///
    /// A bind failure is a deployment error and is fatal.
    pub fn start(addr: &str, config: &MailboxConfig) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let listener = TcpListener::from_std(std_listener)?;

        let inbox = Arc::new(Inbox {
            capacity: config.inbox_capacity,
            state: Mutex::new(InboxState::default()),
            readable: Notify::new(),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&inbox), shutdown_rx));
        debug!(%local_addr, "mailbox listening");

        Ok(Self {
            inbox,
            held: Vec::new(),
            recv_poll: config.recv_poll,
            local_addr,
            shutdown,
            accept_task,
        })
    }

    /// The bound listener address (useful when binding port 0).
    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl ArchetypeResource for LocalMailbox {
    async fn read_value(&mut self) -> Result<Value> {
        if let Some(value) = self.inbox.pop() {
            self.held.push(value.clone());
            return Ok(value);
        }
        // Bounded wait: a commit wakes us immediately via the notifier;
        // otherwise give the driver a chance to abort and re-check for
        // shutdown.
        if timeout(self.recv_poll, self.inbox.readable.notified())
            .await
            .is_err()
        {
            return Err(RuntimeError::CriticalSectionAborted);
        }
        match self.inbox.pop() {
            Some(value) => {
                self.held.push(value.clone());
                Ok(value)
            },
            None => Err(RuntimeError::CriticalSectionAborted),
        }
    }

    async fn write_value(&mut self, _value: Value) -> Result<()> {
        Err(RuntimeError::misuse("local mailbox inbox is receive-only"))
    }

    async fn commit(&mut self) -> Result<()> {
        self.held.clear();
        Ok(())
    }

    async fn abort(&mut self) {
        let held = std::mem::take(&mut self.held);
        self.inbox.requeue_front(held);
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let _ = (&mut self.accept_task).await;
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, inbox: Arc<Inbox>, mut shutdown: watch::Receiver<bool>) {
    let shutdown_for_writers = shutdown.clone();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!(%peer, "mailbox writer connected");
                    let inbox = Arc::clone(&inbox);
                    let shutdown = shutdown_for_writers.clone();
                    tokio::spawn(serve_writer(stream, inbox, shutdown));
                },
                Err(error) => {
                    warn!(%error, "mailbox accept failed");
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
}

/// One connected writer: stage, commit, or discard batches.
async fn serve_writer(stream: TcpStream, inbox: Arc<Inbox>, mut shutdown: watch::Receiver<bool>) {
    let mut framed = Framed::new(stream, FrameCodec::new());
    // The batch staged on this connection, if any.
    let mut staged: Option<(u64, u64, Vec<Value>)> = None;

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
                debug!(%error, "mailbox connection error");
                break;
            },
            // Writer disconnected; the staged batch dies with the
            // connection.
            None => break,
        };
        let message = match MailboxMessage::from_bytes(&frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "malformed mailbox frame");
                break;
            },
        };
        let reply = apply_message(message, &mut staged, &inbox);
        if let Err(error) = framed.send(reply.to_bytes()).await {
            debug!(%error, "mailbox reply failed");
            break;
        }
    }
}

fn apply_message(
    message: MailboxMessage,
    staged: &mut Option<(u64, u64, Vec<Value>)>,
    inbox: &Inbox,
) -> MailboxReply {
    match message {
        MailboxMessage::Batch {
            sender,
            seq,
            values,
        } => {
            let state = inbox.state.lock().expect("inbox lock");
            let already_committed = state
                .committed_seq
                .get(&sender)
                .is_some_and(|&committed| seq <= committed);
            if already_committed {
                // A retry of a batch we already applied: stage nothing, so
                // the matching commit acknowledges without re-delivering.
                *staged = Some((sender, seq, Vec::new()));
                MailboxReply::Ok
            } else if state.queue.len() + values.len() > inbox.capacity {
                MailboxReply::Full
            } else {
                drop(state);
                *staged = Some((sender, seq, values));
                MailboxReply::Ok
            }
        },
        MailboxMessage::Commit { sender, seq } => match staged.take() {
            Some((staged_sender, staged_seq, values))
                if staged_sender == sender && staged_seq == seq =>
            {
                let mut state = inbox.state.lock().expect("inbox lock");
                let already_committed = state
                    .committed_seq
                    .get(&sender)
                    .is_some_and(|&committed| seq <= committed);
                if !already_committed {
                    state.queue.extend(values);
                    state.committed_seq.insert(sender, seq);
                    inbox.readable.notify_one();
                }
                MailboxReply::Ok
            },
            _ => {
                // Commit with no matching staged batch: if it was already
                // applied, acknowledge; otherwise make the writer re-send
                // the batch first.
                let state = inbox.state.lock().expect("inbox lock");
                let already_committed = state
                    .committed_seq
                    .get(&sender)
                    .is_some_and(|&committed| seq <= committed);
                if already_committed {
                    MailboxReply::Ok
                } else {
                    MailboxReply::Full
                }
            },
        },
        MailboxMessage::Abort { .. } => {
            *staged = None;
            MailboxReply::Ok
        },
    }
}

// ---------------------------------------------------------------------
// Remote (outbound) side
// ---------------------------------------------------------------------

/// Outbound queue to one peer's listener.
pub struct RemoteMailbox {
    addr: String,
    config: MailboxConfig,
    /// Process-stable writer identity for receiver-side deduplication.
    sender_id: u64,
    /// Sequence number of the in-progress (next) commit.
    seq: u64,
    /// Values written in the current section, in write order.
    buffered: Vec<Value>,
    /// Whether the current batch is staged at the receiver over the
    /// current connection.
    batch_staged: bool,
    conn: Option<Framed<TcpStream, FrameCodec>>,
}

impl RemoteMailbox {
    /// An outbound mailbox to `addr`. Connects lazily.
    #[must_use]
    pub fn new(addr: String, config: MailboxConfig) -> Self {
        Self {
            addr,
            config,
            sender_id: rand::random(),
            seq: 1,
            buffered: Vec::new(),
            batch_staged: false,
            conn: None,
        }
    }

    #[cfg(test)]
    fn with_identity(addr: String, config: MailboxConfig, sender_id: u64, seq: u64) -> Self {
        let mut mailbox = Self::new(addr, config);
        mailbox.sender_id = sender_id;
        mailbox.seq = seq;
        mailbox
    }

    async fn round_trip(&mut self, message: &MailboxMessage) -> std::io::Result<MailboxReply> {
        use std::io::{Error, ErrorKind};

        let payload = message
            .to_bytes()
            .map_err(|error| Error::new(ErrorKind::InvalidData, error))?;

        if self.conn.is_none() {
            let stream = timeout(self.config.dial_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| Error::new(ErrorKind::TimedOut, "mailbox dial timed out"))??;
            stream.set_nodelay(true)?;
            self.conn = Some(Framed::new(stream, FrameCodec::new()));
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(Error::new(ErrorKind::NotConnected, "mailbox not connected"));
        };

        conn.send(payload).await?;
        match timeout(self.config.round_trip_timeout, conn.next()).await {
            Ok(Some(Ok(frame))) => MailboxReply::from_bytes(&frame)
                .map_err(|error| Error::new(ErrorKind::InvalidData, error)),
            Ok(Some(Err(error))) => Err(error),
            Ok(None) => Err(Error::new(
                ErrorKind::UnexpectedEof,
                "mailbox connection closed",
            )),
            Err(_) => Err(Error::new(ErrorKind::TimedOut, "mailbox reply timed out")),
        }
    }

    async fn commit_attempt(&mut self) -> std::io::Result<()> {
        use std::io::{Error, ErrorKind};

        if !self.batch_staged {
            let batch = MailboxMessage::Batch {
                sender: self.sender_id,
                seq: self.seq,
                values: self.buffered.clone(),
            };
            match self.round_trip(&batch).await? {
                MailboxReply::Ok => self.batch_staged = true,
                MailboxReply::Full => {
                    return Err(Error::new(
                        ErrorKind::WouldBlock,
                        "peer inbox full during commit",
                    ));
                },
            }
        }
        let commit = MailboxMessage::Commit {
            sender: self.sender_id,
            seq: self.seq,
        };
        match self.round_trip(&commit).await? {
            MailboxReply::Ok => Ok(()),
            MailboxReply::Full => Err(Error::new(ErrorKind::Other, "peer rejected commit")),
        }
    }
}

#[async_trait]
impl ArchetypeResource for RemoteMailbox {
    async fn read_value(&mut self) -> Result<Value> {
        Err(RuntimeError::misuse("remote mailbox is send-only"))
    }

    async fn write_value(&mut self, value: Value) -> Result<()> {
        self.buffered.push(value);
        Ok(())
    }

    async fn pre_commit(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let batch = MailboxMessage::Batch {
            sender: self.sender_id,
            seq: self.seq,
            values: self.buffered.clone(),
        };
        match self.round_trip(&batch).await {
            Ok(MailboxReply::Ok) => {
                self.batch_staged = true;
                Ok(())
            },
            Ok(MailboxReply::Full) => {
                debug!(addr = %self.addr, "peer inbox full; aborting section");
                Err(RuntimeError::CriticalSectionAborted)
            },
            Err(error) => {
                debug!(addr = %self.addr, %error, "mailbox pre-commit failed; aborting section");
                self.conn = None;
                Err(RuntimeError::CriticalSectionAborted)
            },
        }
    }

    async fn commit(&mut self) -> Result<()> {
        if self.buffered.is_empty() {
            return Ok(());
        }
        let mut retry = RetryPolicy::default();
        let mut attempt = 0;
        loop {
            match self.commit_attempt().await {
                Ok(()) => {
                    self.seq += 1;
                    self.buffered.clear();
                    self.batch_staged = false;
                    return Ok(());
                },
                Err(error) => {
                    // Reconnect and re-send the batch; the receiver's
                    // sequence window filters anything it already applied.
                    self.conn = None;
                    self.batch_staged = false;
                    attempt += 1;
                    if attempt >= self.config.commit_retries {
                        warn!(addr = %self.addr, %error, "mailbox commit failed permanently");
                        return Err(RuntimeError::Io(error));
                    }
                    debug!(addr = %self.addr, %error, attempt, "mailbox commit retrying");
                    retry.pause().await;
                },
            }
        }
    }

    async fn abort(&mut self) {
        if self.batch_staged {
            let message = MailboxMessage::Abort {
                sender: self.sender_id,
                seq: self.seq,
            };
            if self.round_trip(&message).await.is_err() {
                // The receiver discards the staged batch with the
                // connection, so a failed abort notification is harmless.
                self.conn = None;
            }
        }
        self.buffered.clear();
        self.batch_staged = false;
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.close().await;
        }
        Ok(())
    }
}
