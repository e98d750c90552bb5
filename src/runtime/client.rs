//! Context-side syscall client
//!
//! Programs never see the wire protocol. They call methods on [`Syscalls`],
//! which encodes requests, tracks the ones awaiting a response and sorts
//! incoming kernel messages into responses and interrupts.
//!
//! The client is single-threaded: it lives on its context's thread and may be
//! cloned freely between futures running there. Whichever future is polled
//! reads the mailbox; every message it takes in wakes all other waiters so
//! each can check whether it was the one answered.

use crate::kernel::{
    ActionCode, Disconnected, Fd, Interrupt, KernelMessage, MailboxReceiver, Outbox, Pid,
    ProcessState, ReadAmount, Response, ResponseBody, ResponseCode, Signal, Syscall,
};
use futures::StreamExt;
use futures::future;
use serde_json::Value;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("kernel connection closed")]
    Disconnected,
    #[error("unexpected response to {0}")]
    UnexpectedResponse(ActionCode),
}

impl From<Disconnected> for ClientError {
    fn from(_: Disconnected) -> Self {
        ClientError::Disconnected
    }
}

/// The fds a parent receives for a freshly spawned child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    pub pid: Pid,
    pub stdin: Fd,
    pub stdout: Fd,
    pub stderr: Fd,
}

struct Inner {
    pid: Pid,
    args: Vec<String>,
    outbox: Outbox,
    inbox: RefCell<MailboxReceiver>,
    /// Set once the kernel side of the mailbox is gone
    closed: Cell<bool>,
    /// In-flight requests, keyed by correlation code
    pending: RefCell<Slab<Option<ResponseBody>>>,
    interrupts: RefCell<VecDeque<Interrupt>>,
    /// Futures parked in `wait_for`
    waiters: RefCell<Vec<Waker>>,
}

impl Inner {
    /// Take mail until `ready` yields a value or the mailbox is empty
    fn poll_until<T>(
        &self,
        cx: &mut Context<'_>,
        ready: &impl Fn(&Inner) -> Option<T>,
    ) -> Poll<Result<T, ClientError>> {
        loop {
            if let Some(value) = ready(self) {
                return Poll::Ready(Ok(value));
            }
            if self.closed.get() {
                return Poll::Ready(Err(ClientError::Disconnected));
            }
            let polled = self.inbox.borrow_mut().poll_next_unpin(cx);
            match polled {
                Poll::Ready(Some(message)) => {
                    self.accept(message);
                    self.wake_waiters();
                }
                Poll::Ready(None) => {
                    self.closed.set(true);
                    self.wake_waiters();
                }
                Poll::Pending => {
                    let mut waiters = self.waiters.borrow_mut();
                    if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
                        waiters.push(cx.waker().clone());
                    }
                    return Poll::Pending;
                }
            }
        }
    }

    fn wake_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        for waker in waiters {
            waker.wake();
        }
    }

    fn accept(&self, message: KernelMessage) {
        match message {
            KernelMessage::Response(Response { code, body }) => {
                self.complete(code, body);
            }
            KernelMessage::Interrupt(interrupt) => {
                self.interrupts.borrow_mut().push_back(interrupt);
            }
            KernelMessage::Action(action) => {
                trace!(pid = %self.pid, ?action, "unexpected action dropped");
            }
        }
    }

    fn complete(&self, code: ResponseCode, response: ResponseBody) -> bool {
        let mut pending = self.pending.borrow_mut();
        match code.as_index().and_then(|key| pending.get_mut(key)) {
            Some(slot) if slot.is_none() => {
                *slot = Some(response);
                true
            }
            _ => {
                trace!(pid = %self.pid, %code, "stray response dropped");
                false
            }
        }
    }
}

/// Wakes the other waiters when a `wait_for` future goes away, finished or
/// not, since it may have been the one registered with the mailbox.
struct WakeOnDrop<'a>(&'a Inner);

impl Drop for WakeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.wake_waiters();
    }
}

/// A reserved correlation slot, released when the call ends or is dropped
struct PendingSlot<'a> {
    inner: &'a Inner,
    key: usize,
}

impl<'a> PendingSlot<'a> {
    fn reserve(inner: &'a Inner) -> Self {
        let key = inner.pending.borrow_mut().insert(None);
        Self { inner, key }
    }

    fn code(&self) -> ResponseCode {
        ResponseCode::from(self.key)
    }

    fn take(&self) -> Option<ResponseBody> {
        self.inner
            .pending
            .borrow_mut()
            .get_mut(self.key)
            .and_then(Option::take)
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.borrow_mut();
        if pending.contains(self.key) {
            pending.remove(self.key);
        }
    }
}

/// A process's handle on the kernel
#[derive(Clone)]
pub struct Syscalls {
    inner: Rc<Inner>,
}

impl Syscalls {
    pub fn new(pid: Pid, args: Vec<String>, inbox: MailboxReceiver, outbox: Outbox) -> Self {
        Self {
            inner: Rc::new(Inner {
                pid,
                args,
                outbox,
                inbox: RefCell::new(inbox),
                closed: Cell::new(false),
                pending: RefCell::new(Slab::new()),
                interrupts: RefCell::new(VecDeque::new()),
                waiters: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// The argument vector from the `run` action; `args()[0]` is the executable
    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    fn send(&self, call: Syscall) -> Result<(), ClientError> {
        self.inner.outbox.send(call.to_value())?;
        Ok(())
    }

    pub fn write(&self, fd: Fd, data: &str) -> Result<(), ClientError> {
        self.send(Syscall::WriteToFd {
            fd,
            data: data.to_string(),
        })
    }

    pub fn close(&self, fd: Fd) -> Result<(), ClientError> {
        self.send(Syscall::CloseFd { fd })
    }

    /// Ask for an interrupt carrying `sig` on every later write to `fd`
    pub fn listen(&self, fd: Fd, sig: Signal) -> Result<(), ClientError> {
        self.send(Syscall::ListenOnFd { fd, sig })
    }

    pub fn draw(&self, form: &str, data: Value) -> Result<(), ClientError> {
        self.send(Syscall::Draw {
            form: form.to_string(),
            data,
        })
    }

    pub fn log(&self, data: impl Into<Value>) -> Result<(), ClientError> {
        self.send(Syscall::LogData { data: data.into() })
    }

    pub fn terminate(&self) -> Result<(), ClientError> {
        self.send(Syscall::Terminate)
    }

    /// Read from `fd`. Never waits for data: an empty pipe gives "".
    pub async fn read(&self, fd: Fd, amount: ReadAmount) -> Result<String, ClientError> {
        let body = self
            .call(|response_code| Syscall::ReadFromFd {
                fd,
                amount,
                response_code,
            })
            .await?;
        match body {
            ResponseBody::Data { data } => Ok(data),
            _ => Err(ClientError::UnexpectedResponse(ActionCode::ReadFromFd)),
        }
    }

    pub async fn spawn(&self, args: Vec<String>) -> Result<Child, ClientError> {
        let body = self
            .call(|code| Syscall::SpawnSubprocess {
                args,
                response_code: Some(code),
            })
            .await?;
        match body {
            ResponseBody::Spawned {
                pid,
                stdin,
                stdout,
                stderr,
            } => Ok(Child {
                pid,
                stdin,
                stdout,
                stderr,
            }),
            _ => Err(ClientError::UnexpectedResponse(ActionCode::SpawnSubprocess)),
        }
    }

    pub async fn process_state(&self, pid: Pid) -> Result<ProcessState, ClientError> {
        let body = self
            .call(|response_code| Syscall::GetProcessState { pid, response_code })
            .await?;
        match body {
            ResponseBody::State { state } => Ok(state),
            _ => Err(ClientError::UnexpectedResponse(ActionCode::GetProcessState)),
        }
    }

    /// The oldest interrupt not yet taken, waiting for one if none is queued
    pub async fn next_interrupt(&self) -> Result<Interrupt, ClientError> {
        self.wait_for(|inner| inner.interrupts.borrow_mut().pop_front())
            .await
    }

    /// The oldest queued interrupt carrying `sig`. Others stay queued.
    pub async fn next_interrupt_with(&self, sig: Signal) -> Result<Interrupt, ClientError> {
        self.wait_for(|inner| {
            let mut queue = inner.interrupts.borrow_mut();
            let at = queue.iter().position(|i| i.sig == sig)?;
            queue.remove(at)
        })
        .await
    }

    /// Wait until `fd` has data and return all of it.
    ///
    /// Installs a listener first and then reads, so data written before the
    /// listener took effect is not missed. The listener stays installed.
    pub async fn read_blocking(&self, fd: Fd, sig: Signal) -> Result<String, ClientError> {
        self.listen(fd, sig)?;
        let data = self.read(fd, ReadAmount::All).await?;
        if !data.is_empty() {
            return Ok(data);
        }
        loop {
            let interrupt = self.next_interrupt_with(sig).await?;
            match interrupt.data {
                Some(data) if !data.is_empty() => return Ok(data),
                _ => continue,
            }
        }
    }

    /// Fill the slot for `code`. Unknown or already answered codes are dropped.
    pub fn complete(&self, code: ResponseCode, response: ResponseBody) -> bool {
        let filled = self.inner.complete(code, response);
        if filled {
            self.inner.wake_waiters();
        }
        filled
    }

    /// Requests still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Send a correlated request and wait for its response
    async fn call(
        &self,
        request: impl FnOnce(ResponseCode) -> Syscall,
    ) -> Result<ResponseBody, ClientError> {
        let slot = PendingSlot::reserve(&self.inner);
        self.send(request(slot.code()))?;
        self.wait_for(|_| slot.take()).await
    }

    /// Pump the mailbox until `ready` yields a value
    async fn wait_for<T>(&self, ready: impl Fn(&Inner) -> Option<T>) -> Result<T, ClientError> {
        let inner: &Inner = &self.inner;
        let _wake = WakeOnDrop(inner);
        future::poll_fn(|cx| inner.poll_until(cx, &ready)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Inbound;
    use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
    use futures::FutureExt;
    use futures::executor::{LocalPool, block_on};
    use futures::future;
    use futures::task::LocalSpawnExt;
    use serde_json::json;

    struct Harness {
        sys: Syscalls,
        mail: UnboundedSender<KernelMessage>,
        kernel: UnboundedReceiver<Inbound>,
    }

    fn harness() -> Harness {
        let (mail, inbox) = mpsc::unbounded();
        let (kernel_tx, kernel) = mpsc::unbounded();
        let sys = Syscalls::new(
            Pid(7),
            vec!["/bin/test".to_string()],
            inbox,
            Outbox::new(Pid(7), kernel_tx),
        );
        Harness { sys, mail, kernel }
    }

    impl Harness {
        fn sent(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(Some(Inbound::Syscall { payload, .. })) = self.kernel.try_next() {
                out.push(payload);
            }
            out
        }

        fn reply(&self, code: u64, body: ResponseBody) {
            self.mail
                .unbounded_send(KernelMessage::Response(Response {
                    code: ResponseCode(code.into()),
                    body,
                }))
                .unwrap();
        }

        fn interrupt(&self, interrupt: Interrupt) {
            self.mail
                .unbounded_send(KernelMessage::Interrupt(interrupt))
                .unwrap();
        }
    }

    #[test]
    fn test_fire_and_forget_encoding() {
        let mut h = harness();
        h.sys.write(Fd(1), "out").unwrap();
        h.sys.listen(Fd(4), Signal(7)).unwrap();
        h.sys.close(Fd(4)).unwrap();
        h.sys.draw("text-display", json!("abc")).unwrap();
        h.sys.log("hello").unwrap();
        h.sys.terminate().unwrap();

        assert_eq!(
            h.sent(),
            vec![
                json!({"action": 3, "fd": 1, "data": "out"}),
                json!({"action": 4, "fd": 4, "sig": 7}),
                json!({"action": 5, "fd": 4}),
                json!({"action": 32, "form": "text-display", "data": "abc"}),
                json!({"action": 255, "data": "hello"}),
                json!({"action": 1}),
            ]
        );
    }

    #[test]
    fn test_read_waits_for_its_response() {
        let mut h = harness();
        // The answer is already queued when the read starts waiting
        h.reply(0, ResponseBody::Data { data: "abc".to_string() });

        let data = block_on(h.sys.read(Fd(0), ReadAmount::UpTo(3))).unwrap();
        assert_eq!(data, "abc");
        assert_eq!(
            h.sent(),
            vec![json!({"action": 2, "fd": 0, "amount": 3, "response_code": 0})]
        );
    }

    #[test]
    fn test_responses_matched_by_code() {
        let h = harness();
        let sys = h.sys.clone();

        // Both requests are in flight before the kernel answers, in reverse order
        let (data, state, ()) = block_on(future::join3(
            sys.read(Fd(0), ReadAmount::All),
            sys.process_state(Pid(3)),
            async {
                h.reply(1, ResponseBody::State { state: ProcessState::Running });
                h.reply(0, ResponseBody::Data { data: "first".to_string() });
            },
        ));
        assert_eq!(data.unwrap(), "first");
        assert_eq!(state.unwrap(), ProcessState::Running);
    }

    #[test]
    fn test_idle_interrupt_wait_does_not_starve_calls() {
        let h = harness();
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();

        let idle = h.sys.clone();
        spawner
            .spawn_local(async move {
                let _ = idle.next_interrupt().await;
            })
            .unwrap();
        let state = Rc::new(RefCell::new(None));
        let (sys, slot) = (h.sys.clone(), state.clone());
        spawner
            .spawn_local(async move {
                *slot.borrow_mut() = Some(sys.process_state(Pid(1)).await);
            })
            .unwrap();

        pool.run_until_stalled();
        assert!(state.borrow().is_none());

        h.reply(0, ResponseBody::State { state: ProcessState::Running });
        pool.run_until_stalled();
        assert_eq!(*state.borrow(), Some(Ok(ProcessState::Running)));

        // The idle waiter still gets the next interrupt
        h.interrupt(Interrupt::key(Signal::KEYBOARD, "x".to_string()));
        pool.run_until_stalled();
        assert!(h.sys.inner.interrupts.borrow().is_empty());
    }

    #[test]
    fn test_dropped_call_releases_its_code() {
        let mut h = harness();
        let sys = h.sys.clone();
        let mut read = Box::pin(sys.read(Fd(0), ReadAmount::All));
        assert!((&mut read).now_or_never().is_none());
        assert_eq!(h.sys.pending_calls(), 1);
        assert_eq!(h.sent().len(), 1);

        drop(read);
        assert_eq!(h.sys.pending_calls(), 0);
        // A late answer to the abandoned request is dropped
        let late = ResponseBody::Data {
            data: "late".to_string(),
        };
        assert!(!h.sys.complete(ResponseCode(json!(0)), late));

        h.reply(0, ResponseBody::Data { data: "fresh".to_string() });
        assert_eq!(block_on(h.sys.read(Fd(0), ReadAmount::All)).unwrap(), "fresh");
        assert_eq!(h.sys.pending_calls(), 0);
    }

    #[test]
    fn test_spawn_response() {
        let h = harness();
        h.reply(
            0,
            ResponseBody::Spawned {
                pid: Pid(8),
                stdin: Fd(3),
                stdout: Fd(4),
                stderr: Fd(5),
            },
        );
        let child = block_on(h.sys.spawn(vec!["/bin/echo".to_string()])).unwrap();
        assert_eq!(
            child,
            Child {
                pid: Pid(8),
                stdin: Fd(3),
                stdout: Fd(4),
                stderr: Fd(5)
            }
        );
    }

    #[test]
    fn test_mismatched_body_is_an_error() {
        let h = harness();
        h.reply(0, ResponseBody::Data { data: String::new() });
        assert_eq!(
            block_on(h.sys.process_state(Pid(1))),
            Err(ClientError::UnexpectedResponse(ActionCode::GetProcessState))
        );
    }

    #[test]
    fn test_stray_codes_are_dropped() {
        let h = harness();
        let empty = || ResponseBody::Data { data: String::new() };
        assert!(!h.sys.complete(ResponseCode(json!(42)), empty()));
        assert!(!h.sys.complete(ResponseCode(json!("0")), empty()));

        h.reply(42, ResponseBody::Data { data: "nobody".to_string() });
        h.reply(0, ResponseBody::Data { data: "mine".to_string() });
        assert_eq!(block_on(h.sys.read(Fd(0), ReadAmount::All)).unwrap(), "mine");
    }

    #[test]
    fn test_interrupts_queue_while_waiting() {
        let h = harness();
        h.interrupt(Interrupt::key(Signal::KEYBOARD, "a".to_string()));
        h.reply(0, ResponseBody::Data { data: String::new() });

        block_on(h.sys.read(Fd(0), ReadAmount::All)).unwrap();
        let interrupt = block_on(h.sys.next_interrupt()).unwrap();
        assert_eq!(interrupt.key.as_deref(), Some("a"));
    }

    #[test]
    fn test_read_blocking_waits_for_interrupt() {
        let mut h = harness();
        h.reply(0, ResponseBody::Data { data: String::new() });
        h.interrupt(Interrupt::key(Signal::KEYBOARD, "k".to_string()));
        h.interrupt(Interrupt::data(Signal(9), "late".to_string()));

        let data = block_on(h.sys.read_blocking(Fd(4), Signal(9))).unwrap();
        assert_eq!(data, "late");
        assert_eq!(
            h.sent(),
            vec![
                json!({"action": 4, "fd": 4, "sig": 9}),
                json!({"action": 2, "fd": 4, "amount": -1, "response_code": 0}),
            ]
        );

        // The keyboard interrupt is still there
        let key = block_on(h.sys.next_interrupt()).unwrap();
        assert_eq!(key.sig, Signal::KEYBOARD);
    }

    #[test]
    fn test_read_blocking_returns_buffered_data() {
        let h = harness();
        h.reply(0, ResponseBody::Data { data: "ready".to_string() });
        assert_eq!(block_on(h.sys.read_blocking(Fd(4), Signal(9))).unwrap(), "ready");
    }

    #[test]
    fn test_pending_calls_fail_when_kernel_hangs_up() {
        let Harness { sys, mail, kernel: _kernel } = harness();
        drop(mail);
        assert_eq!(
            block_on(sys.read(Fd(0), ReadAmount::All)),
            Err(ClientError::Disconnected)
        );
        assert_eq!(block_on(sys.next_interrupt()), Err(ClientError::Disconnected));
    }

    #[test]
    fn test_send_after_kernel_gone() {
        let Harness { sys, mail: _mail, kernel } = harness();
        drop(kernel);
        assert_eq!(sys.write(Fd(1), "x"), Err(ClientError::Disconnected));
        assert_eq!(
            block_on(sys.read(Fd(1), ReadAmount::All)),
            Err(ClientError::Disconnected)
        );
    }

    #[test]
    fn test_args() {
        let h = harness();
        assert_eq!(h.sys.pid(), Pid(7));
        assert_eq!(h.sys.args(), &["/bin/test".to_string()]);
    }
}
