//! BSD/macOS backend built on `kqueue(2)`. Registrations are one-shot
//! per `(fd, filter)` pair (`EV_ADD` re-arms them every call, so `modify`
//! is just another `register`), and the wakeup pipe rides the same kqueue
//! as a plain readable fd rather than `EVFILT_USER` — kept symmetric with
//! the epoll/poll backends' self-pipe instead of reaching for a
//! platform-specific shortcut (see `DESIGN.md`).
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Interest, PollBackend, ReadyEvent};

pub struct KqueueBackend {
    kq: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    registered: HashMap<RawFd, Interest>,
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut pipe_fds = [0 as c_int; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(kq) };
            return Err(err);
        }
        let (wake_read, wake_write) = (pipe_fds[0], pipe_fds[1]);
        unsafe {
            let flags = libc::fcntl(wake_read, libc::F_GETFL, 0);
            libc::fcntl(wake_read, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        let mut backend = KqueueBackend {
            kq,
            wake_read,
            wake_write,
            registered: HashMap::new(),
        };
        backend.apply(wake_read, Interest::READABLE, libc::EV_ADD)?;
        Ok(backend)
    }

    /// Register (or re-register, since every `EVFILT_READ`/`EVFILT_WRITE`
    /// add is one-shot until the next `register`/`modify`) interest for a
    /// single fd, deleting whichever filter is no longer wanted.
    fn apply(&self, fd: RawFd, interest: Interest, base_flags: u16) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        changes.push(make_kevent(
            fd,
            libc::EVFILT_READ,
            if interest.readable { base_flags } else { libc::EV_DELETE },
        ));
        changes.push(make_kevent(
            fd,
            libc::EVFILT_WRITE,
            if interest.writable { base_flags } else { libc::EV_DELETE },
        ));
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as c_int,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        // ENOENT from the EV_DELETE half (filter was never armed) is
        // expected and harmless; any other failure is real.
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }
}

fn make_kevent(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as usize,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

impl PollBackend for KqueueBackend {
    fn register(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        self.apply(fd, interest, libc::EV_ADD)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        self.apply(fd, interest, libc::EV_ADD)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: c_int) -> io::Result<()> {
        let _ = self.apply(fd, Interest { readable: false, writable: false }, libc::EV_ADD);
        self.registered.remove(&fd);
        Ok(())
    }

    /// `EVFILT_TIMER` with an absolute millisecond deadline isn't supported
    /// on every kqueue variant (notably older NetBSD/OpenBSD), so the timer
    /// here is an ordinary one-shot relative kevent submitted alongside the
    /// readiness changes each call, with a one-millisecond floor.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let mut out_events: Vec<libc::kevent> =
            vec![unsafe { MaybeUninit::zeroed().assume_init() }; self.registered.len() * 2 + 1];
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos().max(if d.is_zero() { 0 } else { 1_000_000 }) as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const _);
        let rc = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                out_events.as_mut_ptr(),
                out_events.len() as c_int,
                ts_ptr,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut merged: HashMap<RawFd, ReadyEvent> = HashMap::new();
        for ev in out_events.iter().take(rc as usize) {
            let fd = ev.ident as RawFd;
            if fd == self.wake_read {
                let mut buf = [0u8; 64];
                unsafe {
                    while libc::read(self.wake_read, buf.as_mut_ptr() as *mut _, buf.len()) > 0 {}
                }
                continue;
            }
            let entry = merged.entry(fd).or_insert(ReadyEvent {
                fd,
                readable: false,
                writable: false,
                hup: false,
                error: false,
            });
            entry.readable |= ev.filter == libc::EVFILT_READ;
            entry.writable |= ev.filter == libc::EVFILT_WRITE;
            entry.hup |= ev.flags & libc::EV_EOF != 0;
            entry.error |= ev.flags & libc::EV_ERROR != 0;
        }
        Ok(merged.into_values().collect())
    }

    fn wake(&self) -> io::Result<()> {
        let byte = [1u8];
        let rc = unsafe { libc::write(self.wake_write, byte.as_ptr() as *const _, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }
}
