// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Demultiplexer for one child process speaking newline-delimited JSON-RPC.
//!
//! One dedicated reader task per child: responses complete one-shot pending
//! slots, notifications fan out to predicate-filtered subscribers. A single
//! writer mutex keeps stdin framing atomic across concurrent callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::message::{self, Incoming, Notification, Request, RpcErrorObject};
use super::stderr::{spawn_stderr_drain, StderrRing};

/// Per-subscriber queue depth. The reader blocks when a queue is full rather
/// than dropping, preserving event order; turn subscribers drain promptly and
/// exit on the terminal notification, so the window is bounded.
const SUBSCRIBER_QUEUE: usize = 256;

/// Bytes of child stderr retained for failure diagnostics.
const STDERR_CAPACITY: usize = 16 * 1024;

type PendingSlot = oneshot::Sender<Result<Value, RpcErrorObject>>;
type Predicate = Box<dyn Fn(&Notification) -> bool + Send + Sync>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Outcome of a failed [`RpcTransport::call`].
#[derive(Debug, Clone)]
pub enum CallError {
    /// The child replied with a JSON-RPC error object.
    Rpc(RpcErrorObject),
    /// The transport died before a reply arrived.
    Transport { reason: String, stderr_tail: String },
}

impl CallError {
    /// Whether this is a "method not found" protocol error.
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Rpc(err) if err.code == message::METHOD_NOT_FOUND)
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(err) => write!(f, "rpc error {}: {}", err.code, err.message),
            Self::Transport { reason, stderr_tail } => {
                if stderr_tail.is_empty() {
                    write!(f, "transport failure: {reason}")
                } else {
                    write!(f, "transport failure: {reason}; stderr: {}", stderr_tail.trim_end())
                }
            }
        }
    }
}

impl std::error::Error for CallError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReaderState {
    Running,
    ClosedClean,
    ClosedError(String),
}

struct Subscriber {
    id: u64,
    predicate: Predicate,
    tx: mpsc::Sender<Notification>,
}

/// Owns one child process and demultiplexes its stdout.
pub struct RpcTransport {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<i64, PendingSlot>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicI64,
    next_sub_id: AtomicU64,
    reader_state: Mutex<ReaderState>,
    stderr: Arc<Mutex<StderrRing>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl RpcTransport {
    /// Spawn a child process and attach a transport to its stdio.
    pub fn spawn(mut cmd: Command) -> std::io::Result<Arc<Self>> {
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin =
            child.stdin.take().ok_or_else(|| std::io::Error::other("child stdin missing"))?;
        let stdout =
            child.stdout.take().ok_or_else(|| std::io::Error::other("child stdout missing"))?;
        let stderr =
            child.stderr.take().ok_or_else(|| std::io::Error::other("child stderr missing"))?;

        let transport = Self::attach(Box::new(stdin), stdout, Some(child));
        spawn_stderr_drain(stderr, Arc::clone(&transport.stderr));
        Ok(transport)
    }

    /// Attach a transport to an arbitrary reader/writer pair. Used by tests
    /// to drive the protocol over an in-memory duplex pipe.
    pub fn connect<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::attach(Box::new(writer), reader, None)
    }

    fn attach<R>(writer: BoxedWriter, reader: R, child: Option<Child>) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let transport = Arc::new(Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            next_sub_id: AtomicU64::new(1),
            reader_state: Mutex::new(ReaderState::Running),
            stderr: Arc::new(Mutex::new(StderrRing::new(STDERR_CAPACITY))),
            child: tokio::sync::Mutex::new(child),
        });

        let for_reader = Arc::clone(&transport);
        tokio::spawn(async move { for_reader.reader_loop(reader).await });

        transport
    }

    /// Issue one request and await its reply.
    ///
    /// The pending slot is registered before the frame is written so a reply
    /// racing the write cannot be lost.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CallError> {
        if let Some(reason) = self.closed_reason() {
            return Err(self.transport_failure(reason));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = Request::new(id, method, params);
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                self.pending.lock().remove(&id);
                return Err(self.transport_failure(format!("serialize request: {e}")));
            }
        };
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            let Some(stdin) = writer.as_mut() else {
                self.pending.lock().remove(&id);
                return Err(self.transport_failure("stdin closed".to_owned()));
            };
            if let Err(e) = stdin.write_all(&line).await {
                self.pending.lock().remove(&id);
                return Err(self.transport_failure(format!("write to child stdin: {e}")));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.lock().remove(&id);
                return Err(self.transport_failure(format!("flush child stdin: {e}")));
            }
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(CallError::Rpc(err)),
            // Slot dropped without a reply: the reader terminated.
            Err(_) => {
                let reason = self.closed_reason().unwrap_or_else(|| "reader terminated".to_owned());
                Err(self.transport_failure(reason))
            }
        }
    }

    /// Subscribe to notifications matching `predicate`, in arrival order.
    ///
    /// Dropping the returned stream unsubscribes; an abandoned receiver is
    /// also pruned by the reader on the first failed delivery, so it cannot
    /// wedge the reader loop.
    pub fn subscribe<F>(self: &Arc<Self>, predicate: F) -> NotificationStream
    where
        F: Fn(&Notification) -> bool + Send + Sync + 'static,
    {
        let id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers.lock().push(Subscriber { id, predicate: Box::new(predicate), tx });
        NotificationStream { id, rx, transport: Arc::clone(self) }
    }

    /// Subscribe to all notifications for one conversation.
    pub fn subscribe_conversation(self: &Arc<Self>, conversation_id: &str) -> NotificationStream {
        let wanted = conversation_id.to_owned();
        self.subscribe(move |note| note.conversation_id() == Some(wanted.as_str()))
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Close stdin, wait up to `grace` for the child to exit, then kill it.
    /// All pending calls complete with a transport failure.
    pub async fn close(&self, grace: Duration) {
        // Dropping the writer closes the child's stdin.
        self.writer.lock().await.take();

        let mut child_slot = self.child.lock().await;
        if let Some(child) = child_slot.as_mut() {
            let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();
            if !exited {
                warn!("child did not exit within {grace:?}, killing");
                let _ = child.kill().await;
            }
        }
        *child_slot = None;
        drop(child_slot);

        {
            let mut state = self.reader_state.lock();
            if *state == ReaderState::Running {
                *state = ReaderState::ClosedClean;
            }
        }
        self.fail_open_work();
    }

    /// Whether the reader has terminated.
    pub fn is_closed(&self) -> bool {
        *self.reader_state.lock() != ReaderState::Running
    }

    /// The retained stderr tail for diagnostics.
    pub fn stderr_tail(&self) -> String {
        self.stderr.lock().tail()
    }

    fn closed_reason(&self) -> Option<String> {
        match &*self.reader_state.lock() {
            ReaderState::Running => None,
            ReaderState::ClosedClean => Some("transport closed".to_owned()),
            ReaderState::ClosedError(reason) => Some(reason.clone()),
        }
    }

    fn transport_failure(&self, reason: String) -> CallError {
        CallError::Transport { reason, stderr_tail: self.stderr_tail() }
    }

    /// Fail every pending call and terminate all subscriber streams.
    ///
    /// Slots are dropped rather than completed, so waiting callers observe a
    /// transport failure (with the stderr tail) rather than an RPC error.
    fn fail_open_work(&self) {
        let slots: Vec<PendingSlot> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        if !slots.is_empty() {
            debug!(count = slots.len(), "failing pending calls on transport termination");
        }
        drop(slots);
        self.subscribers.lock().clear();
    }

    async fn reader_loop<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        use tokio::io::AsyncBufReadExt;

        let mut lines = BufReader::new(reader).lines();
        let outcome = loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.dispatch_line(&line).await,
                Ok(None) => break ReaderState::ClosedError("child closed stdout".to_owned()),
                Err(e) => break ReaderState::ClosedError(format!("read child stdout: {e}")),
            }
        };

        {
            let mut state = self.reader_state.lock();
            // close() may have already marked a clean shutdown.
            if *state == ReaderState::Running {
                *state = outcome;
            }
        }
        self.fail_open_work();
    }

    async fn dispatch_line(&self, line: &str) {
        match message::parse_line(line) {
            Some(Incoming::Response { id, result }) => {
                let slot = self.pending.lock().remove(&id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    // Not fatal: e.g. the caller timed out and dropped out.
                    None => warn!(id, "response with no matching pending request"),
                }
            }
            Some(Incoming::Notification(note)) => {
                // Snapshot matching senders, then deliver outside the lock so
                // a full queue blocks the reader without holding it.
                let targets: Vec<(u64, mpsc::Sender<Notification>)> = {
                    let subs = self.subscribers.lock();
                    subs.iter()
                        .filter(|s| (s.predicate)(&note))
                        .map(|s| (s.id, s.tx.clone()))
                        .collect()
                };
                for (id, tx) in targets {
                    if tx.send(note.clone()).await.is_err() {
                        self.unsubscribe(id);
                    }
                }
            }
            None => debug!(line, "unparsable or unroutable line from child"),
        }
    }
}

/// A bounded, ordered stream of notifications matching one subscription.
pub struct NotificationStream {
    id: u64,
    rx: mpsc::Receiver<Notification>,
    transport: Arc<RpcTransport>,
}

impl NotificationStream {
    /// Next matching notification, or `None` when the transport terminates.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.id);
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
