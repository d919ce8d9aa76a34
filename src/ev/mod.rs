//! The single-threaded event loop and everything it schedules: pollable
//! streams, timeouts, the scheduled-task ring and CSP channels. Keeps the
//! same shape as a `coio`/fiber pairing that leans on an event loop it
//! doesn't itself own, except this one is fully self-contained: "a stream
//! you wait on, a channel you give/take on, a fiber you park".
pub mod backend;
pub mod channel;
pub mod runloop;
pub mod stream;
pub mod task;
pub mod timeout;

pub use backend::{Interest, PollBackend, ReadyEvent, TestBackend};
pub use channel::{select, ChannelObj, Outcome, SelectClause, SelectResult};
pub use runloop::{Loop, ThreadResult};
pub use stream::{
    Listener, ListenerEvent, ListenerMachine, ListenerMask, ListenerOutcome, Stream, StreamFlags, StreamMethods,
};
pub use task::{Task, TaskQueue};
pub use timeout::{TimeoutEntry, TimeoutHeap};

#[cfg(feature = "threaded")]
pub use channel::threaded::ThreadedChannel;

/// Construct the platform's native poll backend, honoring
/// [`crate::vm::VmConfig::poll_backend_override`] when set (currently only
/// `"poll"` is accepted as an override, to force the portable fallback on a
/// platform that also has a native backend, e.g. for testing).
pub fn new_backend(override_name: Option<&str>) -> std::io::Result<Box<dyn PollBackend>> {
    if override_name == Some("poll") {
        return Ok(Box::new(backend::poll::PollFdBackend::new()?));
    }
    native_backend()
}

#[cfg(target_os = "linux")]
fn native_backend() -> std::io::Result<Box<dyn PollBackend>> {
    Ok(Box::new(backend::epoll::EpollBackend::new()?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn native_backend() -> std::io::Result<Box<dyn PollBackend>> {
    Ok(Box::new(backend::kqueue::KqueueBackend::new()?))
}

#[cfg(windows)]
fn native_backend() -> std::io::Result<Box<dyn PollBackend>> {
    Ok(Box::new(backend::iocp::IocpBackend::new()?))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    windows
)))]
fn native_backend() -> std::io::Result<Box<dyn PollBackend>> {
    Ok(Box::new(backend::poll::PollFdBackend::new()?))
}
