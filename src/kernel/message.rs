//! Wire protocol between the kernel and execution contexts
//!
//! Contexts talk to the kernel with action requests: JSON objects carrying a
//! numeric `action` code plus action-specific fields. The kernel validates
//! each one into a closed [`Syscall`] before touching any state; anything that
//! does not validate is reported as a [`RequestError`] and dropped.
//!
//! The kernel talks back with [`KernelMessage`]s: the `run` action that starts
//! a process, responses correlated by a code the requester chose, and
//! interrupts.

use super::pipe::ReadAmount;
use super::process::{Fd, Pid, ProcessState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Action codes. These are stable wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ActionCode {
    Terminate = 1,
    ReadFromFd = 2,
    WriteToFd = 3,
    ListenOnFd = 4,
    CloseFd = 5,
    SpawnSubprocess = 8,
    GetProcessState = 9,
    Draw = 32,
    LogData = 255,
}

impl ActionCode {
    pub fn from_code(code: u64) -> Option<Self> {
        Some(match code {
            1 => ActionCode::Terminate,
            2 => ActionCode::ReadFromFd,
            3 => ActionCode::WriteToFd,
            4 => ActionCode::ListenOnFd,
            5 => ActionCode::CloseFd,
            8 => ActionCode::SpawnSubprocess,
            9 => ActionCode::GetProcessState,
            32 => ActionCode::Draw,
            255 => ActionCode::LogData,
            _ => return None,
        })
    }

    pub fn code(&self) -> u32 {
        *self as u32
    }

    /// Name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ActionCode::Terminate => "terminate",
            ActionCode::ReadFromFd => "read_from_fd",
            ActionCode::WriteToFd => "write_to_fd",
            ActionCode::ListenOnFd => "listen_on_fd",
            ActionCode::CloseFd => "close_fd",
            ActionCode::SpawnSubprocess => "spawn_subprocess",
            ActionCode::GetProcessState => "get_process_state",
            ActionCode::Draw => "draw",
            ActionCode::LogData => "log_data",
        }
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Interrupt signal number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(pub u32);

impl Signal {
    /// Key presses delivered to the root process
    pub const KEYBOARD: Signal = Signal(1);
}

/// Correlation code pairing a request with its response.
///
/// The kernel never interprets it: whatever the requester put in
/// `response_code` comes back unchanged in the response's `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseCode(pub Value);

impl ResponseCode {
    /// The code as a slot index, when it is a non-negative integer
    pub fn as_index(&self) -> Option<usize> {
        self.0.as_u64().and_then(|n| usize::try_from(n).ok())
    }
}

impl From<usize> for ResponseCode {
    fn from(index: usize) -> Self {
        ResponseCode(Value::from(index))
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an inbound request was rejected
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request has no numeric `action`")]
    MissingAction,
    #[error("unknown action code {0}")]
    UnknownAction(u64),
    #[error("{action} is missing field `{field}`")]
    MissingField {
        action: ActionCode,
        field: &'static str,
    },
    #[error("{action} field `{field}` has the wrong type")]
    InvalidField {
        action: ActionCode,
        field: &'static str,
    },
}

/// Wire shape of an action request as a context sends it
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestFrame {
    pub action: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fd: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<ResponseCode>,
}

/// A validated action request
#[derive(Debug, Clone, PartialEq)]
pub enum Syscall {
    Terminate,
    ReadFromFd {
        fd: Fd,
        amount: ReadAmount,
        response_code: ResponseCode,
    },
    WriteToFd {
        fd: Fd,
        data: String,
    },
    ListenOnFd {
        fd: Fd,
        sig: Signal,
    },
    CloseFd {
        fd: Fd,
    },
    SpawnSubprocess {
        args: Vec<String>,
        response_code: Option<ResponseCode>,
    },
    GetProcessState {
        pid: Pid,
        response_code: ResponseCode,
    },
    Draw {
        form: String,
        data: Value,
    },
    LogData {
        data: Value,
    },
}

/// Field access on one request, scoped to the action being parsed.
/// `null` counts as absent.
struct Fields<'a> {
    action: ActionCode,
    payload: &'a Value,
}

impl<'a> Fields<'a> {
    fn get(&self, field: &'static str) -> Option<&'a Value> {
        self.payload.get(field).filter(|v| !v.is_null())
    }

    fn missing(&self, field: &'static str) -> RequestError {
        RequestError::MissingField {
            action: self.action,
            field,
        }
    }

    fn invalid(&self, field: &'static str) -> RequestError {
        RequestError::InvalidField {
            action: self.action,
            field,
        }
    }

    fn require(&self, field: &'static str) -> Result<&'a Value, RequestError> {
        self.get(field).ok_or_else(|| self.missing(field))
    }

    fn fd(&self) -> Result<Fd, RequestError> {
        let fd = self.require("fd")?.as_u64().ok_or_else(|| self.invalid("fd"))?;
        usize::try_from(fd).map(Fd).map_err(|_| self.invalid("fd"))
    }

    fn number(&self, field: &'static str) -> Result<u32, RequestError> {
        let value = self.require(field)?.as_u64().ok_or_else(|| self.invalid(field))?;
        u32::try_from(value).map_err(|_| self.invalid(field))
    }

    fn string(&self, field: &'static str) -> Result<String, RequestError> {
        match self.require(field)? {
            Value::String(s) => Ok(s.clone()),
            _ => Err(self.invalid(field)),
        }
    }

    fn amount(&self) -> Result<ReadAmount, RequestError> {
        match self.get("amount") {
            None => Ok(ReadAmount::All),
            Some(v) => v
                .as_i64()
                .map(ReadAmount::from_wire)
                .ok_or_else(|| self.invalid("amount")),
        }
    }

    fn args(&self) -> Result<Vec<String>, RequestError> {
        let args = self
            .require("args")?
            .as_array()
            .ok_or_else(|| self.invalid("args"))?
            .iter()
            .map(|arg| arg.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| self.invalid("args"))?;
        if args.is_empty() {
            return Err(self.invalid("args"));
        }
        Ok(args)
    }

    fn response_code(&self) -> Option<ResponseCode> {
        self.get("response_code").cloned().map(ResponseCode)
    }
}

impl Syscall {
    /// Validate an inbound payload.
    ///
    /// Only `action` and the fields that action uses are looked at; anything
    /// else in the object is ignored whatever its type.
    pub fn parse(payload: &Value) -> Result<Self, RequestError> {
        let code = payload
            .get("action")
            .and_then(Value::as_u64)
            .ok_or(RequestError::MissingAction)?;
        let action = ActionCode::from_code(code).ok_or(RequestError::UnknownAction(code))?;
        let fields = Fields { action, payload };

        Ok(match action {
            ActionCode::Terminate => Syscall::Terminate,
            ActionCode::ReadFromFd => Syscall::ReadFromFd {
                fd: fields.fd()?,
                amount: fields.amount()?,
                response_code: fields
                    .response_code()
                    .ok_or_else(|| fields.missing("response_code"))?,
            },
            ActionCode::WriteToFd => Syscall::WriteToFd {
                fd: fields.fd()?,
                data: fields.string("data")?,
            },
            ActionCode::ListenOnFd => Syscall::ListenOnFd {
                fd: fields.fd()?,
                sig: Signal(fields.number("sig")?),
            },
            ActionCode::CloseFd => Syscall::CloseFd { fd: fields.fd()? },
            ActionCode::SpawnSubprocess => Syscall::SpawnSubprocess {
                args: fields.args()?,
                response_code: fields.response_code(),
            },
            ActionCode::GetProcessState => Syscall::GetProcessState {
                pid: Pid(fields.number("pid")?),
                response_code: fields
                    .response_code()
                    .ok_or_else(|| fields.missing("response_code"))?,
            },
            ActionCode::Draw => Syscall::Draw {
                form: fields.string("form")?,
                data: fields.require("data")?.clone(),
            },
            ActionCode::LogData => Syscall::LogData {
                data: fields.get("data").cloned().unwrap_or(Value::Null),
            },
        })
    }

    pub fn action(&self) -> ActionCode {
        match self {
            Syscall::Terminate => ActionCode::Terminate,
            Syscall::ReadFromFd { .. } => ActionCode::ReadFromFd,
            Syscall::WriteToFd { .. } => ActionCode::WriteToFd,
            Syscall::ListenOnFd { .. } => ActionCode::ListenOnFd,
            Syscall::CloseFd { .. } => ActionCode::CloseFd,
            Syscall::SpawnSubprocess { .. } => ActionCode::SpawnSubprocess,
            Syscall::GetProcessState { .. } => ActionCode::GetProcessState,
            Syscall::Draw { .. } => ActionCode::Draw,
            Syscall::LogData { .. } => ActionCode::LogData,
        }
    }

    /// Wire form of this request
    pub fn to_frame(&self) -> RequestFrame {
        let mut frame = RequestFrame {
            action: u64::from(self.action().code()),
            ..RequestFrame::default()
        };
        match self {
            Syscall::Terminate => {}
            Syscall::ReadFromFd {
                fd,
                amount,
                response_code,
            } => {
                frame.fd = Some(fd.0);
                frame.amount = Some(match amount {
                    ReadAmount::All => -1,
                    ReadAmount::UpTo(n) => i64::try_from(*n).unwrap_or(i64::MAX),
                });
                frame.response_code = Some(response_code.clone());
            }
            Syscall::WriteToFd { fd, data } => {
                frame.fd = Some(fd.0);
                frame.data = Some(Value::String(data.clone()));
            }
            Syscall::ListenOnFd { fd, sig } => {
                frame.fd = Some(fd.0);
                frame.sig = Some(sig.0);
            }
            Syscall::CloseFd { fd } => frame.fd = Some(fd.0),
            Syscall::SpawnSubprocess {
                args,
                response_code,
            } => {
                frame.args = Some(args.clone());
                frame.response_code = response_code.clone();
            }
            Syscall::GetProcessState { pid, response_code } => {
                frame.pid = Some(pid.0);
                frame.response_code = Some(response_code.clone());
            }
            Syscall::Draw { form, data } => {
                frame.form = Some(form.clone());
                frame.data = Some(data.clone());
            }
            Syscall::LogData { data } => frame.data = Some(data.clone()),
        }
        frame
    }

    /// JSON payload as sent by a context
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.to_frame()).unwrap_or(Value::Null)
    }
}

/// Actions the kernel asks a context to perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum KernelAction {
    /// Start executing with this argument vector
    Run { args: Vec<String>, pid: Pid },
}

/// Result fields of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Spawned {
        pid: Pid,
        stdin: Fd,
        stdout: Fd,
        stderr: Fd,
    },
    State {
        state: ProcessState,
    },
    Data {
        data: String,
    },
}

/// A response to a correlated request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: ResponseCode,
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// An asynchronous signal outside the request/response flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    pub sig: Signal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Interrupt {
    pub fn data(sig: Signal, data: String) -> Self {
        Self {
            sig,
            data: Some(data),
            key: None,
        }
    }

    pub fn key(sig: Signal, key: String) -> Self {
        Self {
            sig,
            data: None,
            key: Some(key),
        }
    }
}

/// Everything the kernel sends to an execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KernelMessage {
    Action(KernelAction),
    Response(Response),
    Interrupt(Interrupt),
}

impl KernelMessage {
    pub fn run(args: Vec<String>, pid: Pid) -> Self {
        KernelMessage::Action(KernelAction::Run { args, pid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_codes() {
        let codes = [
            (1, ActionCode::Terminate),
            (2, ActionCode::ReadFromFd),
            (3, ActionCode::WriteToFd),
            (4, ActionCode::ListenOnFd),
            (5, ActionCode::CloseFd),
            (8, ActionCode::SpawnSubprocess),
            (9, ActionCode::GetProcessState),
            (32, ActionCode::Draw),
            (255, ActionCode::LogData),
        ];
        for (code, action) in codes {
            assert_eq!(ActionCode::from_code(code), Some(action));
            assert_eq!(u64::from(action.code()), code);
        }
        assert_eq!(ActionCode::from_code(6), None);
    }

    #[test]
    fn test_parse_write() {
        let call = Syscall::parse(&json!({"action": 3, "fd": 1, "data": "hi"})).unwrap();
        assert_eq!(
            call,
            Syscall::WriteToFd {
                fd: Fd(1),
                data: "hi".to_string()
            }
        );
    }

    #[test]
    fn test_parse_read_defaults_to_drain() {
        let call = Syscall::parse(&json!({"action": 2, "fd": 0, "response_code": 4})).unwrap();
        assert_eq!(
            call,
            Syscall::ReadFromFd {
                fd: Fd(0),
                amount: ReadAmount::All,
                response_code: ResponseCode(json!(4))
            }
        );
    }

    #[test]
    fn test_parse_spawn_without_response_code() {
        let call = Syscall::parse(&json!({"action": 8, "args": ["/bin/echo", "x"]})).unwrap();
        assert_eq!(
            call,
            Syscall::SpawnSubprocess {
                args: vec!["/bin/echo".to_string(), "x".to_string()],
                response_code: None
            }
        );
    }

    #[test]
    fn test_parse_rejections() {
        assert!(matches!(
            Syscall::parse(&json!("hello")),
            Err(RequestError::MissingAction)
        ));
        assert!(matches!(
            Syscall::parse(&json!({"fd": 1})),
            Err(RequestError::MissingAction)
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": "3", "fd": 1})),
            Err(RequestError::MissingAction)
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": 77})),
            Err(RequestError::UnknownAction(77))
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": 3, "data": "x"})),
            Err(RequestError::MissingField { field: "fd", .. })
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": 3, "fd": 1, "data": 5})),
            Err(RequestError::InvalidField { field: "data", .. })
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": 8, "args": []})),
            Err(RequestError::InvalidField { field: "args", .. })
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": 9, "pid": 3})),
            Err(RequestError::MissingField { field: "response_code", .. })
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": 5, "fd": -1})),
            Err(RequestError::InvalidField { field: "fd", .. })
        ));
        assert!(matches!(
            Syscall::parse(&json!({"action": 8, "args": ["/bin/echo", 3]})),
            Err(RequestError::InvalidField { field: "args", .. })
        ));
    }

    #[test]
    fn test_unused_fields_are_not_checked() {
        let call = Syscall::parse(&json!({"action": 1, "fd": "n/a", "data": 12})).unwrap();
        assert_eq!(call, Syscall::Terminate);

        let call = Syscall::parse(&json!({"action": 5, "fd": 3, "sig": "x", "args": {}})).unwrap();
        assert_eq!(call, Syscall::CloseFd { fd: Fd(3) });
    }

    #[test]
    fn test_response_code_is_opaque() {
        let call = Syscall::parse(&json!({"action": 9, "pid": 1, "response_code": "req-1"}));
        assert_eq!(
            call.unwrap(),
            Syscall::GetProcessState {
                pid: Pid(1),
                response_code: ResponseCode(json!("req-1"))
            }
        );

        let code = json!({"id": [1, 2]});
        let call = Syscall::parse(&json!({"action": 2, "fd": 0, "response_code": code}));
        assert!(matches!(
            call.unwrap(),
            Syscall::ReadFromFd { response_code, .. } if response_code.0 == code
        ));

        assert_eq!(ResponseCode::from(3usize).as_index(), Some(3));
        assert_eq!(ResponseCode(json!("req-1")).as_index(), None);
        assert_eq!(ResponseCode(json!(-2)).as_index(), None);
    }

    #[test]
    fn test_frame_round_trip() {
        let calls = [
            Syscall::Terminate,
            Syscall::ListenOnFd {
                fd: Fd(4),
                sig: Signal(7),
            },
            Syscall::ReadFromFd {
                fd: Fd(0),
                amount: ReadAmount::UpTo(3),
                response_code: ResponseCode(json!(1)),
            },
            Syscall::Draw {
                form: "text-display".to_string(),
                data: json!("abc"),
            },
        ];
        for call in calls {
            assert_eq!(Syscall::parse(&call.to_value()).unwrap(), call);
        }
    }

    #[test]
    fn test_kernel_message_shapes() {
        let run = KernelMessage::run(vec!["/boot/init".to_string()], Pid(1));
        assert_eq!(
            serde_json::to_value(&run).unwrap(),
            json!({"type": "action", "action": "run", "args": ["/boot/init"], "pid": 1})
        );

        let state = KernelMessage::Response(Response {
            code: ResponseCode(json!(9)),
            body: ResponseBody::State {
                state: ProcessState::Running,
            },
        });
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({"type": "response", "code": 9, "state": 2})
        );

        let echoed = KernelMessage::Response(Response {
            code: ResponseCode(json!("req-1")),
            body: ResponseBody::Data {
                data: String::new(),
            },
        });
        assert_eq!(
            serde_json::to_value(&echoed).unwrap(),
            json!({"type": "response", "code": "req-1", "data": ""})
        );

        let key = KernelMessage::Interrupt(Interrupt::key(Signal::KEYBOARD, "a".to_string()));
        assert_eq!(
            serde_json::to_value(&key).unwrap(),
            json!({"type": "interrupt", "sig": 1, "key": "a"})
        );
    }
}
