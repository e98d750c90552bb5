//! Native execution host
//!
//! Executables are text files whose first line names a program with an
//! interpreter directive, e.g. `#!echo`. [`ThreadHost`] keeps a registry of
//! programs and runs each launched process on its own OS thread. Nothing is
//! shared with the kernel thread apart from the two message channels.

pub mod client;
pub mod programs;

pub use client::{Child, ClientError, Syscalls};

use crate::kernel::{
    ExecutionContext, ExecutionHost, KernelAction, KernelMessage, LaunchError, LaunchSpec,
    MailboxReceiver, Pid, Syscall,
};
use futures::StreamExt;
use futures::future::{AbortHandle, Abortable, FutureExt, LocalBoxFuture};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

/// A program entry point. Called on the context's own thread once the
/// process has received its `run` action.
pub type Program = Arc<dyn Fn(Syscalls) -> LocalBoxFuture<'static, ()> + Send + Sync>;

/// The program named by an executable's `#!` line
pub fn interpreter(code: &str) -> Option<&str> {
    let name = code.lines().next()?.strip_prefix("#!")?.trim();
    (!name.is_empty()).then_some(name)
}

/// Runs every process on a dedicated thread
#[derive(Default, Clone)]
pub struct ThreadHost {
    programs: HashMap<String, Program>,
}

impl ThreadHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host that knows the built-in programs (`init` and `echo`)
    pub fn with_builtins() -> Self {
        let mut host = Self::new();
        host.register("init", programs::init);
        host.register("echo", programs::echo);
        host
    }

    /// Register a program under its interpreter name, replacing any previous one
    pub fn register<F, Fut>(&mut self, name: &str, program: F)
    where
        F: Fn(Syscalls) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let program: Program = Arc::new(move |sys| program(sys).boxed_local());
        self.programs.insert(name.to_string(), program);
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }
}

impl ExecutionHost for ThreadHost {
    fn launch(&mut self, spec: LaunchSpec) -> Result<Box<dyn ExecutionContext>, LaunchError> {
        let name = interpreter(&spec.code).ok_or(LaunchError::MissingInterpreter)?;
        let program = self
            .programs
            .get(name)
            .cloned()
            .ok_or_else(|| LaunchError::UnknownProgram(name.to_string()))?;

        let LaunchSpec {
            pid, inbox, outbox, ..
        } = spec;
        let (abort, registration) = AbortHandle::new_pair();

        thread::Builder::new()
            .name(format!("pid-{}", pid.0))
            .spawn(move || {
                let process = async move {
                    let mut inbox = inbox;
                    let Some(args) = wait_for_run(pid, &mut inbox).await else {
                        return;
                    };
                    program(Syscalls::new(pid, args, inbox, outbox.clone())).await;
                    // Returning from a program is process exit
                    let _ = outbox.send(Syscall::Terminate.to_value());
                };

                match futures::executor::block_on(Abortable::new(process, registration)) {
                    Ok(()) => debug!(%pid, "context exited"),
                    Err(_) => debug!(%pid, "context aborted"),
                }
            })?;

        Ok(Box::new(ThreadContext { abort }))
    }
}

/// Skip anything that arrives before the `run` action
async fn wait_for_run(pid: Pid, inbox: &mut MailboxReceiver) -> Option<Vec<String>> {
    while let Some(message) = inbox.next().await {
        match message {
            KernelMessage::Action(KernelAction::Run { args, .. }) => return Some(args),
            other => trace!(%pid, ?other, "message before run; dropped"),
        }
    }
    None
}

struct ThreadContext {
    abort: AbortHandle,
}

impl ExecutionContext for ThreadContext {
    fn terminate(&mut self) {
        self.abort.abort();
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.abort.abort();
    }
}
