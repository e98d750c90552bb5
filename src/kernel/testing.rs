//! Test doubles for the kernel: a host that runs nothing and records
//! everything, and a display that keeps every frame.

use super::config::KernelConfig;
use super::host::{
    ExecutionContext, ExecutionHost, LaunchError, LaunchSpec, MailboxReceiver, Outbox,
};
use super::message::KernelMessage;
use super::process::Pid;
use super::Kernel;
use crate::platform::DisplaySink;
use crate::vfs::TreeFs;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
struct HostState {
    launched: Vec<Pid>,
    terminated: Vec<Pid>,
    codes: HashMap<Pid, String>,
    inboxes: HashMap<Pid, MailboxReceiver>,
    outboxes: HashMap<Pid, Outbox>,
}

/// Shared view of what a [`ScriptedHost`] has seen
#[derive(Clone, Default)]
pub struct HostLog {
    state: Rc<RefCell<HostState>>,
}

impl HostLog {
    pub fn launched(&self) -> Vec<Pid> {
        self.state.borrow().launched.clone()
    }

    pub fn terminated(&self) -> Vec<Pid> {
        self.state.borrow().terminated.clone()
    }

    pub fn code(&self, pid: Pid) -> Option<String> {
        self.state.borrow().codes.get(&pid).cloned()
    }

    /// The context side of a process's outbox, to send requests as it
    pub fn outbox(&self, pid: Pid) -> Option<Outbox> {
        self.state.borrow().outboxes.get(&pid).cloned()
    }

    /// Drain everything the kernel has posted to `pid` so far
    pub fn messages(&self, pid: Pid) -> Vec<KernelMessage> {
        let mut state = self.state.borrow_mut();
        let Some(inbox) = state.inboxes.get_mut(&pid) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Ok(Some(message)) = inbox.try_next() {
            out.push(message);
        }
        out
    }
}

/// An execution host whose contexts never run any code
#[derive(Default)]
pub struct ScriptedHost {
    log: HostLog,
    fail_on: Option<String>,
}

impl ScriptedHost {
    /// Refuse to launch executables whose contents are exactly `code`
    pub fn failing_on(code: &str) -> Self {
        Self {
            log: HostLog::default(),
            fail_on: Some(code.to_string()),
        }
    }

    pub fn log(&self) -> HostLog {
        self.log.clone()
    }
}

impl ExecutionHost for ScriptedHost {
    fn launch(&mut self, spec: LaunchSpec) -> Result<Box<dyn ExecutionContext>, LaunchError> {
        if self.fail_on.as_deref() == Some(spec.code.as_str()) {
            return Err(LaunchError::UnknownProgram(spec.code));
        }

        let mut state = self.log.state.borrow_mut();
        state.launched.push(spec.pid);
        state.codes.insert(spec.pid, spec.code);
        state.inboxes.insert(spec.pid, spec.inbox);
        state.outboxes.insert(spec.pid, spec.outbox);

        Ok(Box::new(ScriptedContext {
            pid: spec.pid,
            log: self.log.clone(),
        }))
    }
}

struct ScriptedContext {
    pid: Pid,
    log: HostLog,
}

impl ExecutionContext for ScriptedContext {
    fn terminate(&mut self) {
        self.log.state.borrow_mut().terminated.push(self.pid);
    }
}

/// Display sink that records every DRAW
#[derive(Clone, Default)]
pub struct RecordingDisplay {
    draws: Rc<RefCell<Vec<(String, Value)>>>,
}

impl RecordingDisplay {
    pub fn draws(&self) -> Vec<(String, Value)> {
        self.draws.borrow().clone()
    }
}

impl DisplaySink for RecordingDisplay {
    fn draw(&mut self, form: &str, data: &Value) {
        self.draws.borrow_mut().push((form.to_string(), data.clone()));
    }
}

/// A kernel over a filesystem holding `files`, with default config
pub fn kernel(files: &[(&str, &str)]) -> (Kernel, HostLog, RecordingDisplay) {
    let mut fs = TreeFs::new();
    for (path, contents) in files {
        fs.insert_file(path, *contents)
            .unwrap_or_else(|e| panic!("bad test file {path}: {e}"));
    }

    let host = ScriptedHost::default();
    let log = host.log();
    let display = RecordingDisplay::default();
    let kernel = Kernel::new(KernelConfig::default(), fs, host, display.clone());
    (kernel, log, display)
}
