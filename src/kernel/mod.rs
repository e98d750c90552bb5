//! The kernel - process table, boot, interrupt routing and reaping
//!
//! The kernel is an explicitly owned object. It reacts to one [`Inbound`]
//! item at a time and runs each to completion, so the process table and every
//! fd table are only ever touched from one place and need no locking.
//! Execution contexts may run in parallel; they only reach the kernel by
//! queueing requests on its inbox.

pub mod config;
pub mod host;
pub mod message;
pub mod pipe;
pub mod process;
pub mod syscall;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, KernelConfig};
pub use host::{
    Disconnected, ExecutionContext, ExecutionHost, Inbound, KernelSender, LaunchError,
    LaunchSpec, Mailbox, MailboxReceiver, Outbox,
};
pub use message::{
    ActionCode, Interrupt, KernelAction, KernelMessage, RequestError, Response, ResponseBody,
    ResponseCode, Signal, Syscall,
};
pub use pipe::{Pipe, ReadAmount, SharedPipe};
pub use process::{Fd, FdTable, Pid, Process, ProcessState};
pub use syscall::{Dispatch, IgnoreReason};

use crate::platform::{DisplaySink, KeyEvent};
use crate::vfs::{self, FileSystem, FsError};
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedReceiver};
use std::collections::BTreeMap;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Why a process could not start
#[derive(Debug, Error)]
pub enum StartError {
    #[error("cannot load executable: {0}")]
    Resolve(#[from] FsError),
    #[error("cannot launch executable: {0}")]
    Launch(#[from] LaunchError),
}

/// Why [`Kernel::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// A shutdown was requested through the inbox
    Shutdown,
    /// The root process finished and the kernel is configured to stop with it
    RootFinished,
}

/// The kernel manages all system state
pub struct Kernel {
    config: KernelConfig,
    fs: Box<dyn FileSystem>,
    host: Box<dyn ExecutionHost>,
    display: Box<dyn DisplaySink>,
    /// All processes that have not been reaped yet
    processes: BTreeMap<Pid, Process>,
    /// Next PID to allocate
    next_pid: u32,
    /// The process started by `boot`
    root: Option<Pid>,
    inbox_tx: KernelSender,
    inbox: UnboundedReceiver<Inbound>,
}

impl Kernel {
    pub fn new(
        config: KernelConfig,
        fs: impl FileSystem + 'static,
        host: impl ExecutionHost + 'static,
        display: impl DisplaySink + 'static,
    ) -> Self {
        let (inbox_tx, inbox) = mpsc::unbounded();
        Self {
            config,
            fs: Box::new(fs),
            host: Box::new(host),
            display: Box::new(display),
            processes: BTreeMap::new(),
            next_pid: 1, // PID 0 is reserved
            root: None,
            inbox_tx,
            inbox,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// A handle for feeding the inbox (keyboard, reaper, shutdown)
    pub fn sender(&self) -> KernelSender {
        self.inbox_tx.clone()
    }

    /// Start the root process from the configured boot path
    pub fn boot(&mut self) -> Pid {
        let argv = self.config.boot_argv();
        info!(path = %self.config.boot_path, "booting");
        let pid = self.spawn(argv);
        self.root = Some(pid);
        pid
    }

    pub fn root(&self) -> Option<Pid> {
        self.root
    }

    /// Create a process, register it and try to start it
    pub fn spawn(&mut self, argv: Vec<String>) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        debug!(%pid, ?argv, "process created");
        self.processes.insert(pid, Process::new(pid, argv));
        self.start(pid);
        pid
    }

    /// Resolve the executable and launch it. On failure the process goes
    /// straight to FINISHED; only the log hears about it.
    fn start(&mut self, pid: Pid) {
        let launched = self.launch(pid);
        let Some(process) = self.processes.get_mut(&pid) else {
            return;
        };

        match launched {
            Ok((mailbox, context)) => {
                process.attach(mailbox, context);
                process.post(KernelMessage::run(process.argv.clone(), pid));
                debug!(%pid, path = process.path(), "process running");
            }
            Err(e) => {
                warn!(%pid, path = process.path(), error = %e, "process failed to start");
                process.finish();
            }
        }
    }

    fn launch(&mut self, pid: Pid) -> Result<(Mailbox, Box<dyn ExecutionContext>), StartError> {
        let path = self
            .processes
            .get(&pid)
            .map(|p| p.path().to_string())
            .unwrap_or_default();
        let code = vfs::read_to_string(self.fs.as_ref(), &path)?;

        let (tx, rx) = mpsc::unbounded();
        let context = self.host.launch(LaunchSpec {
            pid,
            code,
            inbox: rx,
            outbox: Outbox::new(pid, self.inbox_tx.clone()),
        })?;
        Ok((Mailbox::new(pid, tx), context))
    }

    /// Get a process by PID
    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Get a process mutably
    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(&pid)
    }

    /// State of a process. A pid that is not in the table reads as FINISHED.
    pub fn process_state(&self, pid: Pid) -> ProcessState {
        self.processes
            .get(&pid)
            .map_or(ProcessState::Finished, |p| p.state)
    }

    /// PIDs currently in the process table, ascending
    pub fn pids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    /// Forcefully finish a process. Returns false if it was already finished
    /// or does not exist.
    pub fn terminate(&mut self, pid: Pid) -> bool {
        match self.processes.get_mut(&pid) {
            Some(process) if !process.is_finished() => {
                process.finish();
                debug!(%pid, "process finished");
                true
            }
            _ => false,
        }
    }

    /// Remove every FINISHED process from the table
    pub fn reap(&mut self) -> Vec<Pid> {
        let finished: Vec<Pid> = self
            .processes
            .values()
            .filter(|p| p.is_finished())
            .map(|p| p.pid)
            .collect();

        for pid in &finished {
            self.processes.remove(pid);
            debug!(%pid, "process reaped");
        }
        finished
    }

    /// Forward a key press to the root process, and only to it
    pub fn deliver_key(&mut self, key: KeyEvent) {
        let sig = self.config.keyboard_signal;
        match self.root.and_then(|pid| self.processes.get(&pid)) {
            Some(root) if root.is_running() => {
                root.post(KernelMessage::Interrupt(Interrupt::key(sig, key.key)));
            }
            _ => trace!(key = %key.key, "no running root process; key dropped"),
        }
    }

    /// Process one inbound item to completion
    pub fn dispatch(&mut self, inbound: Inbound) -> Option<Halt> {
        match inbound {
            Inbound::Syscall { pid, payload } => {
                self.handle(pid, &payload);
            }
            Inbound::Key(key) => self.deliver_key(key),
            Inbound::Reap => {
                self.reap();
            }
            Inbound::Shutdown => return Some(Halt::Shutdown),
        }
        None
    }

    /// Dispatch everything already queued without waiting for more.
    /// Returns how many items were processed.
    pub fn run_until_stalled(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(Some(inbound)) = self.inbox.try_next() {
            handled += 1;
            if self.dispatch(inbound).is_some() {
                break;
            }
        }
        handled
    }

    /// Serve the inbox until shutdown or, if configured, until the root
    /// process has finished.
    pub async fn run(&mut self) -> Halt {
        loop {
            if self.root_finished() {
                info!("root process finished; halting");
                return Halt::RootFinished;
            }

            let Some(inbound) = self.inbox.next().await else {
                return Halt::Shutdown;
            };
            if let Some(halt) = self.dispatch(inbound) {
                info!("shutdown requested");
                return halt;
            }
        }
    }

    fn root_finished(&self) -> bool {
        self.config.halt_on_root_exit
            && self
                .root
                .is_some_and(|pid| self.process_state(pid) == ProcessState::Finished)
    }

    /// Start a thread that posts a reap tick every `reap_interval_ms`.
    /// It stops by itself once the kernel is dropped.
    pub fn spawn_reaper(&self) -> std::io::Result<JoinHandle<()>> {
        let tx = self.sender();
        let interval = self.config.reap_interval();
        thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || {
                loop {
                    thread::sleep(interval);
                    if tx.unbounded_send(Inbound::Reap).is_err() {
                        break;
                    }
                }
            })
    }
}
