//! Portable fallback backend built on POSIX `poll(2)`. Used on any target
//! without a more specific backend, and as the one exercised by the doc
//! examples since it has no platform-specific setup.
use std::io;
use std::os::raw::c_int;
use std::time::Duration;

use super::{Interest, PollBackend, ReadyEvent};

pub struct PollFdBackend {
    fds: Vec<libc::pollfd>,
    wake_read: c_int,
    wake_write: c_int,
}

impl PollFdBackend {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (wake_read, wake_write) = (fds[0], fds[1]);
        unsafe {
            let flags = libc::fcntl(wake_read, libc::F_GETFL, 0);
            libc::fcntl(wake_read, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok(PollFdBackend {
            fds: vec![libc::pollfd {
                fd: wake_read,
                events: libc::POLLIN,
                revents: 0,
            }],
            wake_read,
            wake_write,
        })
    }

    fn index_of(&self, fd: c_int) -> Option<usize> {
        self.fds.iter().position(|p| p.fd == fd)
    }
}

impl Drop for PollFdBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

fn events_for(interest: Interest) -> i16 {
    let mut mask = 0;
    if interest.readable {
        mask |= libc::POLLIN;
    }
    if interest.writable {
        mask |= libc::POLLOUT;
    }
    mask as i16
}

impl PollBackend for PollFdBackend {
    fn register(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        self.fds.push(libc::pollfd {
            fd,
            events: events_for(interest),
            revents: 0,
        });
        Ok(())
    }

    fn modify(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        if let Some(idx) = self.index_of(fd) {
            self.fds[idx].events = events_for(interest);
            Ok(())
        } else {
            self.register(fd, interest)
        }
    }

    fn deregister(&mut self, fd: c_int) -> io::Result<()> {
        if let Some(idx) = self.index_of(fd) {
            self.fds.swap_remove(idx);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let timeout_ms = timeout.map(|d| d.as_millis().min(i32::MAX as u128) as i32).unwrap_or(-1);
        let rc = unsafe {
            libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut drained_wake_pipe = false;
        let mut out = Vec::with_capacity(rc.max(0) as usize);
        for entry in self.fds.iter_mut() {
            if entry.revents == 0 {
                continue;
            }
            if entry.fd == self.wake_read {
                drained_wake_pipe = true;
                entry.revents = 0;
                continue;
            }
            out.push(ReadyEvent {
                fd: entry.fd,
                readable: entry.revents & libc::POLLIN != 0,
                writable: entry.revents & libc::POLLOUT != 0,
                hup: entry.revents & libc::POLLHUP != 0,
                error: entry.revents & libc::POLLERR != 0,
            });
            entry.revents = 0;
        }
        if drained_wake_pipe {
            let mut buf = [0u8; 64];
            unsafe {
                while libc::read(self.wake_read, buf.as_mut_ptr() as *mut _, buf.len()) > 0 {}
            }
        }
        Ok(out)
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
