//! Syscall dispatcher
//!
//! Every request from an execution context ends up in [`Kernel::handle`]. The
//! sender's pid is attached by its [`Outbox`](super::Outbox), so handlers only
//! ever touch the fd table of the process that asked.

use super::message::{
    ActionCode, Interrupt, KernelMessage, Response, ResponseBody, ResponseCode, Signal, Syscall,
};
use super::pipe::{ReadAmount, SharedPipe};
use super::process::{Fd, Pid};
use super::Kernel;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace};

/// Outcome of dispatching one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled(ActionCode),
    Ignored(IgnoreReason),
}

/// Why a request was dropped without effect
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IgnoreReason {
    #[error("no process {0}")]
    UnknownProcess(Pid),
    #[error("{0} is not running")]
    NotRunning(Pid),
    #[error("rejected request: {0}")]
    Rejected(String),
    #[error("{action}: {fd} is not open")]
    BadFd { action: ActionCode, fd: Fd },
}

impl Kernel {
    /// Validate and execute one raw request from `pid`.
    ///
    /// Requests from processes that are gone or no longer running, and
    /// requests that do not validate, are dropped.
    pub fn handle(&mut self, pid: Pid, payload: &Value) -> Dispatch {
        match self.processes.get(&pid) {
            None => return ignored(pid, IgnoreReason::UnknownProcess(pid)),
            Some(process) if !process.is_running() => {
                return ignored(pid, IgnoreReason::NotRunning(pid));
            }
            Some(_) => {}
        }

        match Syscall::parse(payload) {
            Ok(call) => self.syscall(pid, call),
            Err(e) => ignored(pid, IgnoreReason::Rejected(e.to_string())),
        }
    }

    /// Execute a validated request on behalf of a running process
    pub fn syscall(&mut self, pid: Pid, call: Syscall) -> Dispatch {
        let action = call.action();
        trace!(%pid, %action, "syscall");

        let outcome = match call {
            Syscall::Terminate => self.sys_terminate(pid),
            Syscall::ReadFromFd {
                fd,
                amount,
                response_code,
            } => self.sys_read(pid, fd, amount, response_code),
            Syscall::WriteToFd { fd, data } => self.sys_write(pid, fd, &data),
            Syscall::ListenOnFd { fd, sig } => self.sys_listen(pid, fd, sig),
            Syscall::CloseFd { fd } => self.sys_close(pid, fd),
            Syscall::SpawnSubprocess {
                args,
                response_code,
            } => self.sys_spawn(pid, args, response_code),
            Syscall::GetProcessState { pid: target, response_code } => {
                self.sys_process_state(pid, target, response_code)
            }
            Syscall::Draw { form, data } => self.sys_draw(&form, &data),
            Syscall::LogData { data } => self.sys_log(pid, &data),
        };

        match outcome {
            Ok(()) => Dispatch::Handled(action),
            Err(reason) => ignored(pid, reason),
        }
    }

    /// The pipe behind one of `pid`'s fds
    fn pipe(&self, pid: Pid, fd: Fd) -> Option<SharedPipe> {
        self.processes.get(&pid)?.files.get(fd).cloned()
    }

    fn respond(&self, pid: Pid, code: ResponseCode, body: ResponseBody) {
        if let Some(process) = self.processes.get(&pid) {
            process.post(KernelMessage::Response(Response { code, body }));
        }
    }

    fn sys_terminate(&mut self, pid: Pid) -> Result<(), IgnoreReason> {
        self.terminate(pid);
        Ok(())
    }

    /// Never blocks: an empty pipe or a bad fd reads as ""
    fn sys_read(
        &mut self,
        pid: Pid,
        fd: Fd,
        amount: ReadAmount,
        code: ResponseCode,
    ) -> Result<(), IgnoreReason> {
        let data = self
            .pipe(pid, fd)
            .map(|pipe| pipe.borrow_mut().read(amount))
            .unwrap_or_default();
        self.respond(pid, code, ResponseBody::Data { data });
        Ok(())
    }

    fn sys_write(&mut self, pid: Pid, fd: Fd, data: &str) -> Result<(), IgnoreReason> {
        let pipe = self.pipe(pid, fd).ok_or(IgnoreReason::BadFd {
            action: ActionCode::WriteToFd,
            fd,
        })?;
        pipe.borrow_mut().write(data);
        Ok(())
    }

    /// Install `pid` as the pipe's data listener. Each later write is drained
    /// in full and delivered as one interrupt carrying `sig`.
    fn sys_listen(&mut self, pid: Pid, fd: Fd, sig: Signal) -> Result<(), IgnoreReason> {
        let bad_fd = IgnoreReason::BadFd {
            action: ActionCode::ListenOnFd,
            fd,
        };
        let pipe = self.pipe(pid, fd).ok_or(bad_fd)?;
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(IgnoreReason::UnknownProcess(pid))?;
        let mailbox = process.mailbox().ok_or(IgnoreReason::NotRunning(pid))?;

        pipe.borrow_mut().register_owned_callback(
            pid,
            Box::new(move |pipe| {
                let data = pipe.read(ReadAmount::All);
                mailbox.post(KernelMessage::Interrupt(Interrupt::data(sig, data)));
            }),
        );
        process.track_listener(&pipe);
        Ok(())
    }

    fn sys_close(&mut self, pid: Pid, fd: Fd) -> Result<(), IgnoreReason> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(IgnoreReason::UnknownProcess(pid))?;
        if let Some(pipe) = process.files.close(fd) {
            pipe.borrow_mut().clear_callback_owned_by(pid);
        }
        Ok(())
    }

    /// Create a child and give the parent fds for the child's stdio. The
    /// parent gets them even if the child failed to start.
    fn sys_spawn(
        &mut self,
        pid: Pid,
        args: Vec<String>,
        code: Option<ResponseCode>,
    ) -> Result<(), IgnoreReason> {
        let child = self.spawn(args);
        let stdio = self
            .processes
            .get(&child)
            .map(|p| p.stdio())
            .ok_or(IgnoreReason::UnknownProcess(child))?;

        let parent = self
            .processes
            .get_mut(&pid)
            .ok_or(IgnoreReason::UnknownProcess(pid))?;
        let [stdin, stdout, stderr] = stdio.map(|pipe| parent.files.push(pipe));
        debug!(parent = %pid, %child, %stdin, %stdout, %stderr, "subprocess spawned");

        if let Some(code) = code {
            self.respond(
                pid,
                code,
                ResponseBody::Spawned {
                    pid: child,
                    stdin,
                    stdout,
                    stderr,
                },
            );
        }
        Ok(())
    }

    fn sys_process_state(
        &mut self,
        pid: Pid,
        target: Pid,
        code: ResponseCode,
    ) -> Result<(), IgnoreReason> {
        let state = self.process_state(target);
        self.respond(pid, code, ResponseBody::State { state });
        Ok(())
    }

    fn sys_draw(&mut self, form: &str, data: &Value) -> Result<(), IgnoreReason> {
        self.display.draw(form, data);
        Ok(())
    }

    fn sys_log(&mut self, pid: Pid, data: &Value) -> Result<(), IgnoreReason> {
        let text = match data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        info!(target: "jascos::process", pid = pid.0, "Process {} says {}", pid.0, text);
        Ok(())
    }
}

fn ignored(pid: Pid, reason: IgnoreReason) -> Dispatch {
    debug!(%pid, %reason, "request ignored");
    Dispatch::Ignored(reason)
}
