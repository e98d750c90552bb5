//! Process abstraction
//!
//! A process is the unit of isolation: it owns a pid, its argument vector,
//! a lifecycle state, a table of open file descriptors and the execution
//! context running its code. Nothing is shared with other processes except
//! pipes handed over through the fd table.

use super::host::{ExecutionContext, Mailbox};
use super::message::KernelMessage;
use super::pipe::{Pipe, SharedPipe};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::debug;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// File descriptor - an index into a process's fd table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fd(pub usize);

impl Fd {
    pub const STDIN: Fd = Fd(0);
    pub const STDOUT: Fd = Fd(1);
    pub const STDERR: Fd = Fd(2);
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Process lifecycle state. Serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProcessState {
    /// Code is still being resolved
    NotStarted = 1,
    /// The execution context is live
    Running = 2,
    /// Terminated or never started; waiting to be reaped
    Finished = 3,
}

impl ProcessState {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessState::NotStarted => "not-started",
            ProcessState::Running => "running",
            ProcessState::Finished => "finished",
        }
    }
}

impl From<ProcessState> for u8 {
    fn from(state: ProcessState) -> u8 {
        state.code()
    }
}

impl TryFrom<u8> for ProcessState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ProcessState::NotStarted),
            2 => Ok(ProcessState::Running),
            3 => Ok(ProcessState::Finished),
            other => Err(format!("unknown process state {}", other)),
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A process's file descriptor table.
///
/// Slots are indexed by fd number and may be closed (`None`). New slots are
/// only ever appended, so a closed fd number is never handed out again.
#[derive(Debug)]
pub struct FdTable {
    slots: Vec<Option<SharedPipe>>,
}

impl FdTable {
    /// A table with fresh stdin, stdout and stderr pipes
    pub fn new() -> Self {
        Self {
            slots: vec![Some(Pipe::shared()), Some(Pipe::shared()), Some(Pipe::shared())],
        }
    }

    /// A table whose fds 0, 1 and 2 are the given pipes
    pub fn with_stdio(stdio: &[SharedPipe; 3]) -> Self {
        Self {
            slots: stdio.iter().cloned().map(Some).collect(),
        }
    }

    /// Append a pipe, returning its fd
    pub fn push(&mut self, pipe: SharedPipe) -> Fd {
        self.slots.push(Some(pipe));
        Fd(self.slots.len() - 1)
    }

    pub fn get(&self, fd: Fd) -> Option<&SharedPipe> {
        self.slots.get(fd.0).and_then(|slot| slot.as_ref())
    }

    /// Close a slot. Out-of-range or already closed fds are a no-op.
    pub fn close(&mut self, fd: Fd) -> Option<SharedPipe> {
        self.slots.get_mut(fd.0).and_then(|slot| slot.take())
    }

    pub fn contains(&self, fd: Fd) -> bool {
        self.get(fd).is_some()
    }

    /// Number of slots, open or closed
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Open fds and their pipes
    pub fn iter(&self) -> impl Iterator<Item = (Fd, &SharedPipe)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|p| (Fd(i), p)))
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A process in the system
pub struct Process {
    /// Unique process identifier
    pub pid: Pid,

    /// Argument vector; `argv[0]` is the executable path
    pub argv: Vec<String>,

    /// Current state
    pub state: ProcessState,

    /// File descriptor table
    pub files: FdTable,

    /// Kernel side of the channel into the execution context
    mailbox: Option<Mailbox>,

    /// The execution context running this process's code
    context: Option<Box<dyn ExecutionContext>>,

    /// Pipes this process has installed listeners on
    listening: Vec<Weak<RefCell<Pipe>>>,

    // stdio pipes as created, for handing to a parent on spawn
    stdio: [SharedPipe; 3],
}

impl Process {
    pub fn new(pid: Pid, argv: Vec<String>) -> Self {
        let stdio = [Pipe::shared(), Pipe::shared(), Pipe::shared()];
        let files = FdTable::with_stdio(&stdio);

        Self {
            pid,
            argv,
            state: ProcessState::NotStarted,
            files,
            mailbox: None,
            context: None,
            listening: Vec::new(),
            stdio,
        }
    }

    /// The executable path
    pub fn path(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// The stdin, stdout and stderr pipes this process was created with
    pub fn stdio(&self) -> [SharedPipe; 3] {
        self.stdio.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub fn is_finished(&self) -> bool {
        self.state == ProcessState::Finished
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    /// NOT_STARTED -> RUNNING
    pub(crate) fn attach(&mut self, mailbox: Mailbox, context: Box<dyn ExecutionContext>) {
        self.mailbox = Some(mailbox);
        self.context = Some(context);
        self.state = ProcessState::Running;
    }

    /// A clone of the mailbox, for listeners that outlive this borrow
    pub fn mailbox(&self) -> Option<Mailbox> {
        self.mailbox.clone()
    }

    /// Send a message to the execution context. Dropped if there is none.
    pub fn post(&self, message: KernelMessage) {
        match &self.mailbox {
            Some(mailbox) => mailbox.post(message),
            None => debug!(pid = %self.pid, "no execution context; message dropped"),
        }
    }

    /// Remember that this process installed a listener on `pipe`
    pub(crate) fn track_listener(&mut self, pipe: &SharedPipe) {
        self.listening.retain(|w| w.strong_count() > 0);
        self.listening.push(Rc::downgrade(pipe));
    }

    /// Move to FINISHED: tear down the execution context and drop every
    /// listener this process installed. Open fds are left as they are.
    pub(crate) fn finish(&mut self) {
        if let Some(mut context) = self.context.take() {
            context.terminate();
        }
        self.mailbox = None;

        for pipe in self.listening.drain(..).filter_map(|w| w.upgrade()) {
            pipe.borrow_mut().clear_callback_owned_by(self.pid);
        }

        self.state = ProcessState::Finished;
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("argv", &self.argv)
            .field("state", &self.state)
            .field("fds", &self.files.len())
            .field("context", &self.context.is_some())
            .finish()
    }
}
