//! Linux backend built on `epoll(7)`, edge-triggering intentionally left
//! off (level-triggered) so a registration that's only partially drained
//! in one loop iteration is reported again next time without extra
//! bookkeeping here — see `DESIGN.md` for why that was chosen over ET.
use std::collections::HashMap;
use std::io;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{Interest, PollBackend, ReadyEvent};

pub struct EpollBackend {
    epfd: RawFd,
    wake_read: RawFd,
    wake_write: RawFd,
    registered: HashMap<RawFd, Interest>,
}

fn epoll_mask(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.readable {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.writable {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut pipe_fds = [0 as c_int; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err);
        }
        let (wake_read, wake_write) = (pipe_fds[0], pipe_fds[1]);
        unsafe {
            let flags = libc::fcntl(wake_read, libc::F_GETFL, 0);
            libc::fcntl(wake_read, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        let mut backend = EpollBackend {
            epfd,
            wake_read,
            wake_write,
            registered: HashMap::new(),
        };
        backend.epoll_ctl(libc::EPOLL_CTL_ADD, wake_read, epoll_mask(Interest::READABLE))?;
        Ok(backend)
    }

    fn epoll_ctl(&self, op: c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

impl PollBackend for EpollBackend {
    fn register(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, epoll_mask(interest))?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: c_int, interest: Interest) -> io::Result<()> {
        self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, epoll_mask(interest))?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn deregister(&mut self, fd: c_int) -> io::Result<()> {
        let _ = self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0);
        self.registered.remove(&fd);
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<ReadyEvent>> {
        let timeout_ms = timeout.map(|d| d.as_millis().min(i32::MAX as u128) as i32).unwrap_or(-1);
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.registered.len() + 1];
        let rc = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut out = Vec::with_capacity(rc as usize);
        for event in events.iter().take(rc as usize) {
            let fd = event.u64 as RawFd;
            if fd == self.wake_read {
                let mut buf = [0u8; 64];
                unsafe {
                    while libc::read(self.wake_read, buf.as_mut_ptr() as *mut _, buf.len()) > 0 {}
                }
                continue;
            }
            out.push(ReadyEvent {
                fd,
                readable: event.events & libc::EPOLLIN as u32 != 0,
                writable: event.events & libc::EPOLLOUT as u32 != 0,
                hup: event.events & libc::EPOLLHUP as u32 != 0,
                error: event.events & libc::EPOLLERR as u32 != 0,
            });
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
