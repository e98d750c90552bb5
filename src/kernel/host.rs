//! Execution hosts and the channels between kernel and contexts
//!
//! Each process's code runs in an execution context supplied by an
//! [`ExecutionHost`]. Contexts share no memory with the kernel: the kernel
//! posts [`KernelMessage`]s into a per-context [`Mailbox`], and contexts send
//! raw JSON requests through an [`Outbox`] into the single kernel inbox.
//!
//! Both directions are unbounded FIFO channels, so messages from one context
//! reach the kernel in the order they were sent, and messages to one context
//! arrive in the order the kernel posted them.

use super::message::KernelMessage;
use super::process::Pid;
use crate::platform::KeyEvent;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// Everything the kernel reacts to, one at a time
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A raw request from a process's execution context
    Syscall { pid: Pid, payload: Value },
    /// A key press from the keyboard source
    Key(KeyEvent),
    /// Reaper tick
    Reap,
    /// Stop the run loop
    Shutdown,
}

/// Sending half of the kernel inbox
pub type KernelSender = UnboundedSender<Inbound>;

/// Receiving half of a context's mailbox
pub type MailboxReceiver = UnboundedReceiver<KernelMessage>;

/// Kernel side of a context's mailbox
#[derive(Debug, Clone)]
pub struct Mailbox {
    pid: Pid,
    tx: UnboundedSender<KernelMessage>,
}

impl Mailbox {
    pub fn new(pid: Pid, tx: UnboundedSender<KernelMessage>) -> Self {
        Self { pid, tx }
    }

    /// Deliver a message. A context that has gone away just misses it.
    pub fn post(&self, message: KernelMessage) {
        if self.tx.unbounded_send(message).is_err() {
            trace!(pid = %self.pid, "mailbox closed; message dropped");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The kernel is no longer accepting messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("kernel inbox is closed")]
pub struct Disconnected;

/// A context's way into the kernel inbox. Every request is tagged with the
/// sender's pid, so a context cannot speak for another process.
#[derive(Debug, Clone)]
pub struct Outbox {
    pid: Pid,
    tx: KernelSender,
}

impl Outbox {
    pub fn new(pid: Pid, tx: KernelSender) -> Self {
        Self { pid, tx }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn send(&self, payload: Value) -> Result<(), Disconnected> {
        self.tx
            .unbounded_send(Inbound::Syscall {
                pid: self.pid,
                payload,
            })
            .map_err(|_| Disconnected)
    }
}

/// Everything a host needs to start a context
#[derive(Debug)]
pub struct LaunchSpec {
    pub pid: Pid,
    /// The resolved executable contents
    pub code: String,
    /// Messages from the kernel, starting with the `run` action
    pub inbox: MailboxReceiver,
    /// Requests to the kernel
    pub outbox: Outbox,
}

/// Errors starting an execution context
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable has no `#!` interpreter line")]
    MissingInterpreter,
    #[error("no program named {0:?}")]
    UnknownProgram(String),
    #[error("failed to start context: {0}")]
    Io(#[from] std::io::Error),
}

/// A running, isolated execution context
pub trait ExecutionContext {
    /// Stop executing. Must not block and must be safe to call once the
    /// code has already stopped on its own.
    fn terminate(&mut self);
}

/// Something that can create execution contexts from code
pub trait ExecutionHost {
    fn launch(&mut self, spec: LaunchSpec) -> Result<Box<dyn ExecutionContext>, LaunchError>;
}
