//! Error handling utils.
//!
//! Splits *recoverable* conditions (IO, timeout, channel-closed, protocol,
//! out-of-range, type mismatch — ordinary [`Error`] variants propagated
//! with `?`) from *fatal* ones (out of memory, assertion failure, invalid
//! bytecode after verification — always routed through
//! [`Vm`](crate::vm::Vm)'s configured fatal hook rather than returned).
use std::fmt;

use crate::value::Value;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all recoverable error cases for the runtime core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed marshal input: {0}")]
    Protocol(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{0}")]
    Timeout(&'static str),

    #[error("deadline expired")]
    DeadlineExpired,

    #[error("type error: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: i64, len: usize },

    #[error("stack overflow")]
    StackOverflow,

    #[error("fiber is not in a resumable state: {0:?}")]
    NotResumable(crate::fiber::FiberStatus),

    #[error("unregistered abstract type: {0}")]
    UnknownAbstractType(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

/// A fatal condition: the taxonomy entries which §7 says are never
/// recoverable (`OutOfMemory`, `AssertionFailure`, invalid bytecode after
/// the unmarshal verifier ran). Delivered to [`Vm`](crate::vm::Vm)'s fatal
/// hook, which by default aborts the process — a host may install a
/// different hook (e.g. to unwind a whole embedding cleanly) but cannot
/// recover the specific operation that triggered it.
#[derive(Debug, Clone)]
pub enum Fatal {
    OutOfMemory,
    AssertionFailure(String),
    InvalidBytecode(String),
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::OutOfMemory => write!(f, "out of memory"),
            Fatal::AssertionFailure(msg) => write!(f, "assertion failure: {msg}"),
            Fatal::InvalidBytecode(msg) => write!(f, "invalid bytecode: {msg}"),
        }
    }
}

/// Non-local return code from a fiber's `continue`, per §4.2/§9. `panic`
/// is modeled as `Signal::Error`, replacing the source's longjmp-based
/// unwinding with an explicit result type threaded through interpreter
/// frames (the interpreter itself is out of scope here; this crate only
/// needs to carry the signal across a `continue`/`yield` boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ok,
    Error,
    Debug,
    Yield,
    User0,
    User1,
    User2,
    User3,
    User4,
    /// Internal: only ever produced by the event loop, never by bytecode.
    Event,
    /// A fiber signals this to ask the scheduler to hand it back to the
    /// outer driver instead of auto-rescheduling it (spec §4.3 main loop
    /// step 2, "INTERRUPT: return that fiber to the caller so the outer
    /// driver can re-schedule it explicitly"). The fiber is left `Pending`,
    /// same as a plain yield, but is not touched by the supervisor-routing
    /// logic in `ev::Loop::handle_signal`.
    Interrupt,
}

impl Signal {
    pub fn is_user(self) -> bool {
        matches!(
            self,
            Signal::User0 | Signal::User1 | Signal::User2 | Signal::User3 | Signal::User4
        )
    }

    pub fn as_keyword_name(self) -> &'static str {
        match self {
            Signal::Ok => "ok",
            Signal::Error => "error",
            Signal::Debug => "debug",
            Signal::Yield => "yield",
            Signal::User0 => "user0",
            Signal::User1 => "user1",
            Signal::User2 => "user2",
            Signal::User3 => "user3",
            Signal::User4 => "user4",
            Signal::Event => "event",
            Signal::Interrupt => "interrupt",
        }
    }
}

/// A panic payload paired with the signal that carried it, returned by
/// [`Fiber::continue_`](crate::fiber::Fiber::continue_).
#[derive(Debug, Clone)]
pub struct SignalResult {
    pub signal: Signal,
    pub value: Value,
}

impl SignalResult {
    pub fn ok(value: Value) -> Self {
        Self {
            signal: Signal::Ok,
            value,
        }
    }

    pub fn error(value: Value) -> Self {
        Self {
            signal: Signal::Error,
            value,
        }
    }
}
