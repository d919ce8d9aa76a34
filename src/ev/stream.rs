//! Streams and listeners.
//!
//! A [`Stream`] wraps an OS-pollable handle; a [`Listener`] is the
//! state-machine callback attached to it that a fiber parks behind while
//! waiting for readiness. Listeners are kept in a plain `Vec<Rc<Listener>>`
//! here — there is no reason to hand-roll an intrusive list in safe Rust
//! when the owning `Stream` already has somewhere to put a growable
//! collection.
use std::cell::RefCell;
use std::os::raw::c_int;
use std::rc::Rc;

use crate::error::Result;
use crate::fiber::FiberHandle;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct StreamFlags: u32 {
        const READABLE        = 1 << 0;
        const WRITABLE         = 1 << 1;
        const ACCEPTABLE       = 1 << 2;
        const UDPSERVER        = 1 << 3;
        const SOCKET           = 1 << 4;
        const IOCP_REGISTERED  = 1 << 5;
        const CLOSED           = 1 << 6;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct ListenerMask: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        /// Marks a listener that doesn't itself correspond to a waiting
        /// fiber (e.g. an internally-spawned watcher); `fiber` is `None`.
        const SPAWNER = 1 << 2;
    }
}

/// Events delivered to a [`Listener`]'s state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    Init,
    Deinit,
    Close,
    Mark,
    Read,
    Write,
    Err,
    Hup,
    /// IOCP-only: a previously issued overlapped operation completed.
    Complete,
    User,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    Done,
    NotDone,
}

/// The state machine itself, parameterized by whatever payload the
/// listener needs to carry (spec: "an opaque per-machine payload"). Event
/// handlers return `Done` to have the listener unregistered and its
/// payload dropped, or `NotDone` to stay armed.
pub trait ListenerMachine {
    fn handle(&mut self, event: ListenerEvent, stream: &Stream) -> ListenerOutcome;
}

/// A listener attached to a stream, parameterized by the fiber it wakes.
pub struct Listener {
    pub fiber: Option<FiberHandle>,
    pub mask: ListenerMask,
    machine: RefCell<Box<dyn ListenerMachine>>,
}

impl Listener {
    pub fn new(fiber: Option<FiberHandle>, mask: ListenerMask, machine: Box<dyn ListenerMachine>) -> Rc<Self> {
        Rc::new(Listener {
            fiber,
            mask,
            machine: RefCell::new(machine),
        })
    }

    fn dispatch(&self, event: ListenerEvent, stream: &Stream) -> ListenerOutcome {
        self.machine.borrow_mut().handle(event, stream)
    }
}

/// Method vtable a [`Stream`] consults for I/O: close, read, chunk, write.
pub trait StreamMethods {
    fn close(&mut self) -> Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Read up to `max` bytes as a single chunk (`ev/chunk`'s backing op):
    /// may return fewer bytes than `max` without that meaning EOF.
    fn chunk(&mut self, max: usize) -> Result<Vec<u8>>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

pub struct Stream {
    pub handle: c_int,
    flags: RefCell<StreamFlags>,
    listeners: RefCell<Vec<Rc<Listener>>>,
    methods: RefCell<Box<dyn StreamMethods>>,
}

impl Stream {
    pub fn new(handle: c_int, flags: StreamFlags, methods: Box<dyn StreamMethods>) -> Rc<Self> {
        Rc::new(Stream {
            handle,
            flags: RefCell::new(flags),
            listeners: RefCell::new(Vec::new()),
            methods: RefCell::new(methods),
        })
    }

    pub fn flags(&self) -> StreamFlags {
        *self.flags.borrow()
    }

    /// True iff every bit in `required` is set (`ev/stream_flags`, §6).
    pub fn has_flags(&self, required: StreamFlags) -> bool {
        self.flags().contains(required)
    }

    pub fn is_closed(&self) -> bool {
        self.flags().contains(StreamFlags::CLOSED)
    }

    /// Attach a listener, rejecting a duplicate event mask on the same
    /// stream per §4.3 ("Duplicate event bits on the same stream are
    /// rejected").
    pub fn add_listener(&self, listener: Rc<Listener>) -> Result<()> {
        let mut listeners = self.listeners.borrow_mut();
        if listeners.iter().any(|l| l.mask.intersects(listener.mask)) {
            return Err(crate::error::Error::protocol(
                "duplicate listener event mask on stream",
            ));
        }
        listener.dispatch(ListenerEvent::Init, self);
        listeners.push(listener);
        Ok(())
    }

    pub fn listeners(&self) -> Vec<Rc<Listener>> {
        self.listeners.borrow().clone()
    }

    /// Deliver `event` to every listener, removing ones whose handler
    /// answers `Done` (after giving them a final `Deinit`).
    pub fn dispatch(&self, event: ListenerEvent) {
        let mut listeners = self.listeners.borrow_mut();
        listeners.retain(|listener| match listener.dispatch(event, self) {
            ListenerOutcome::NotDone => true,
            ListenerOutcome::Done => {
                listener.dispatch(ListenerEvent::Deinit, self);
                false
            }
        });
    }

    /// Cancel and drop every listener immediately (used by `cancel()` on a
    /// waiting fiber and by `close()`).
    pub fn cancel_listeners(&self) {
        self.dispatch(ListenerEvent::Cancel);
        self.listeners.borrow_mut().clear();
    }

    /// Cancel and drop exactly one listener, identified by `Rc` identity,
    /// leaving any others on this stream untouched (used when only one of
    /// several fibers parked on the same stream is being resumed/canceled).
    pub fn cancel_listener(&self, listener: &Rc<Listener>) {
        let removed = {
            let mut listeners = self.listeners.borrow_mut();
            listeners
                .iter()
                .position(|l| Rc::ptr_eq(l, listener))
                .map(|pos| listeners.remove(pos))
        };
        if let Some(listener) = removed {
            listener.dispatch(ListenerEvent::Cancel, self);
        }
    }

    pub fn close(&self) -> Result<()> {
        self.dispatch(ListenerEvent::Close);
        self.listeners.borrow_mut().clear();
        self.flags.borrow_mut().insert(StreamFlags::CLOSED);
        self.methods.borrow_mut().close()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.methods.borrow_mut().read(buf)
    }

    pub fn chunk(&self, max: usize) -> Result<Vec<u8>> {
        self.methods.borrow_mut().chunk(max)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.methods.borrow_mut().write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullMethods;
    impl StreamMethods for NullMethods {
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        fn chunk(&mut self, _max: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
    }

    struct CountingMachine {
        events: Rc<RefCell<Vec<ListenerEvent>>>,
        done_after: ListenerEvent,
    }
    impl ListenerMachine for CountingMachine {
        fn handle(&mut self, event: ListenerEvent, _stream: &Stream) -> ListenerOutcome {
            self.events.borrow_mut().push(event);
            if event == self.done_after {
                ListenerOutcome::Done
            } else {
                ListenerOutcome::NotDone
            }
        }
    }

    #[test]
    fn duplicate_masks_are_rejected() {
        let stream = Stream::new(3, StreamFlags::READABLE, Box::new(NullMethods));
        let events = Rc::new(RefCell::new(Vec::new()));
        let l1 = Listener::new(
            None,
            ListenerMask::READ,
            Box::new(CountingMachine { events: events.clone(), done_after: ListenerEvent::Cancel }),
        );
        let l2 = Listener::new(
            None,
            ListenerMask::READ,
            Box::new(CountingMachine { events: events.clone(), done_after: ListenerEvent::Cancel }),
        );
        stream.add_listener(l1).unwrap();
        assert!(stream.add_listener(l2).is_err());
    }

    #[test]
    fn done_outcome_removes_listener() {
        let stream = Stream::new(3, StreamFlags::READABLE, Box::new(NullMethods));
        let events = Rc::new(RefCell::new(Vec::new()));
        let listener = Listener::new(
            None,
            ListenerMask::READ,
            Box::new(CountingMachine { events: events.clone(), done_after: ListenerEvent::Read }),
        );
        stream.add_listener(listener).unwrap();
        assert_eq!(stream.listeners().len(), 1);
        stream.dispatch(ListenerEvent::Read);
        assert_eq!(stream.listeners().len(), 0);
        assert_eq!(
            *events.borrow(),
            vec![ListenerEvent::Init, ListenerEvent::Read, ListenerEvent::Deinit]
        );
    }
}
