//! Shared polling abstraction the event loop drives, with one real backend
//! per platform plus a deterministic in-memory one for tests (spec §4.3).
use std::time::Duration;

pub mod poll;

#[cfg(target_os = "linux")]
pub mod epoll;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;

#[cfg(windows)]
pub mod iocp;

/// Which directions of readiness a registration cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub fd: std::os::raw::c_int,
    pub readable: bool,
    pub writable: bool,
    pub hup: bool,
    pub error: bool,
}

/// A readiness multiplexer. Implementations register/deregister raw file
/// descriptors and report which became ready within a bounded wait.
/// `None` as a timeout means "wait indefinitely" (still bounded in practice
/// by any registered fiber timeout that the event loop computes and passes
/// in instead).
pub trait PollBackend {
    fn register(&mut self, fd: std::os::raw::c_int, interest: Interest) -> std::io::Result<()>;
    fn modify(&mut self, fd: std::os::raw::c_int, interest: Interest) -> std::io::Result<()>;
    fn deregister(&mut self, fd: std::os::raw::c_int) -> std::io::Result<()>;
    fn poll(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<ReadyEvent>>;

    /// Used by `Loop::post_event`: force the next `poll` to return promptly
    /// even if nothing registered became ready, e.g. because a cross-thread
    /// `threaded_call` just finished.
    fn wake(&self) -> std::io::Result<()>;
}

/// Deterministic backend for tests: readiness is driven entirely by
/// `set_ready`/`clear_ready` rather than by real file descriptors, so tests
/// never depend on timing.
#[derive(Default)]
pub struct TestBackend {
    registered: std::collections::HashMap<std::os::raw::c_int, Interest>,
    ready: std::collections::HashSet<std::os::raw::c_int>,
    woken: std::cell::Cell<bool>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&mut self, fd: std::os::raw::c_int) {
        self.ready.insert(fd);
    }

    pub fn clear_ready(&mut self, fd: std::os::raw::c_int) {
        self.ready.remove(&fd);
    }
}

impl PollBackend for TestBackend {
    fn register(&mut self, fd: std::os::raw::c_int, interest: Interest) -> std::io::Result<()> {
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: std::os::raw::c_int, interest: Interest) -> std::io::Result<()> {
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: std::os::raw::c_int) -> std::io::Result<()> {
        self.registered.remove(&fd);
        self.ready.remove(&fd);
        Ok(())
    }

    fn poll(&mut self, _timeout: Option<Duration>) -> std::io::Result<Vec<ReadyEvent>> {
        self.woken.set(false);
        let events = self
            .ready
            .iter()
            .filter_map(|fd| {
                self.registered.get(fd).map(|interest| ReadyEvent {
                    fd: *fd,
                    readable: interest.readable,
                    writable: interest.writable,
                    hup: false,
                    error: false,
                })
            })
            .collect();
        Ok(events)
    }

    fn wake(&self) -> std::io::Result<()> {
        self.woken.set(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_reports_only_ready_registered_fds() {
        let mut backend = TestBackend::new();
        backend.register(3, Interest::READABLE).unwrap();
        backend.register(4, Interest::WRITABLE).unwrap();
        backend.set_ready(3);
        let events = backend.poll(None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fd, 3);
        assert!(events[0].readable);
    }
}
