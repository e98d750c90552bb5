//! Pipes
//!
//! A pipe is an unbounded character buffer backing a file descriptor.
//! Writes append and never fail; reads take from the front and never block.
//! A single data listener may be attached: it runs synchronously after every
//! write, with the pipe itself as argument, so it can drain what arrived.

use super::process::Pid;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A pipe shared between fd tables
pub type SharedPipe = Rc<RefCell<Pipe>>;

/// Callback run after each write
pub type DataCallback = Box<dyn FnMut(&mut Pipe)>;

/// How much to take from a pipe on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAmount {
    /// Drain the whole buffer
    All,
    /// Up to this many characters
    UpTo(usize),
}

impl ReadAmount {
    /// Wire form: any negative amount means "everything"
    pub fn from_wire(amount: i64) -> Self {
        usize::try_from(amount).map_or(ReadAmount::All, ReadAmount::UpTo)
    }
}

struct Listener {
    owner: Option<Pid>,
    callback: DataCallback,
}

/// An unbounded pipe buffer
#[derive(Default)]
pub struct Pipe {
    buffer: String,
    listener: Option<Listener>,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pipe ready to be shared between fd tables
    pub fn shared() -> SharedPipe {
        Rc::new(RefCell::new(Self::new()))
    }

    /// Append data, then notify the listener if one is registered
    pub fn write(&mut self, data: &str) {
        self.buffer.push_str(data);

        if let Some(mut listener) = self.listener.take() {
            (listener.callback)(self);
            // The callback may have installed a replacement; keep the newer one
            if self.listener.is_none() {
                self.listener = Some(listener);
            }
        }
    }

    /// Take data from the front of the buffer
    pub fn read(&mut self, amount: ReadAmount) -> String {
        match amount {
            ReadAmount::All => std::mem::take(&mut self.buffer),
            ReadAmount::UpTo(n) => {
                let split = self
                    .buffer
                    .char_indices()
                    .nth(n)
                    .map_or(self.buffer.len(), |(idx, _)| idx);
                let rest = self.buffer.split_off(split);
                std::mem::replace(&mut self.buffer, rest)
            }
        }
    }

    /// Is there anything to read?
    pub fn poll(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Number of buffered characters
    pub fn len(&self) -> usize {
        self.buffer.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Install the data listener, replacing any previous one
    pub fn register_data_callback(&mut self, callback: DataCallback) {
        self.listener = Some(Listener {
            owner: None,
            callback,
        });
    }

    /// Install a listener on behalf of a process
    pub fn register_owned_callback(&mut self, owner: Pid, callback: DataCallback) {
        self.listener = Some(Listener {
            owner: Some(owner),
            callback,
        });
    }

    /// Remove the data listener
    pub fn clear_data_callback(&mut self) {
        self.listener = None;
    }

    /// Remove the listener only if `owner` installed it.
    /// Returns whether a listener was removed.
    pub fn clear_callback_owned_by(&mut self, owner: Pid) -> bool {
        match &self.listener {
            Some(listener) if listener.owner == Some(owner) => {
                self.listener = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Pid of the process that owns the current listener
    pub fn listener_owner(&self) -> Option<Pid> {
        self.listener.as_ref().and_then(|l| l.owner)
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("buffer", &self.buffer)
            .field("listener", &self.listener.as_ref().map(|l| l.owner))
            .finish()
    }
}
