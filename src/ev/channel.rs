//! CSP channels. A channel is exposed to guest code as a [`Value::Abstract`]
//! wrapping a [`ChannelObj`]; the give/take/select operations below are the
//! Rust-level primitives a host's `ev/give`, `ev/take`, `ev/select` and
//! `ev/rselect` bindings call into, following the same give-finds-a-
//! waiting-reader-or-buffers, take-finds-a-buffered-item-or-parks shape as
//! [`crate::fiber::channel::Channel`], but operating on [`Value`] and
//! suspending the *calling fiber* (via the event loop) rather than blocking
//! the OS thread.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rand::seq::SliceRandom;

use crate::error::{Error, Result, Signal};
use crate::fiber::FiberHandle;
use crate::heap::Heap;
use crate::registry::{AbstractTypeId, AbstractTypeRegistry, AbstractVtable};
use crate::value::{AbstractObj, Value};

use super::runloop::Loop;

pub const CHANNEL_TYPE_NAME: &str = "channel";

/// Registers the `"channel"` abstract type (mark callback only: a channel
/// has no sensible string form, ordering or host-visible fields, so every
/// other vtable slot stays `None` and falls back to the type-error path).
pub fn register_abstract_type(registry: &AbstractTypeRegistry) {
    registry.register(AbstractVtable {
        type_id: AbstractTypeId(Rc::from(CHANNEL_TYPE_NAME)),
        mark: Some(mark_channel),
        gc: None,
        tostring: None,
        get: None,
        put: None,
        marshal: None,
        unmarshal: None,
        compare: None,
        hash: None,
        call: None,
    });
}

fn mark_channel(obj: &AbstractObj, heap: &Heap) {
    if let Some(chan) = obj.data.borrow().downcast_ref::<Rc<ChannelObj>>() {
        chan.mark(heap);
    }
}

/// Wrap a channel as a guest-visible [`Value`]. The abstract type must have
/// been registered with [`register_abstract_type`] first (done once by
/// [`crate::vm::Vm::new`]).
pub fn into_value(chan: Rc<ChannelObj>) -> Value {
    Value::Abstract(Rc::new(AbstractObj {
        header: crate::value::GcHeader::new(),
        type_id: AbstractTypeId(Rc::from(CHANNEL_TYPE_NAME)),
        data: RefCell::new(Box::new(chan)),
    }))
}

/// Recover the [`ChannelObj`] a guest-visible channel value wraps.
pub fn from_value(value: &Value) -> Result<Rc<ChannelObj>> {
    match value {
        Value::Abstract(obj) if obj.type_id.name() == CHANNEL_TYPE_NAME => obj
            .data
            .borrow()
            .downcast_ref::<Rc<ChannelObj>>()
            .cloned()
            .ok_or_else(|| Error::protocol("channel abstract object holds the wrong payload type")),
        _ => Err(Error::TypeMismatch {
            expected: "channel",
            actual: "other",
        }),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum PendingMode {
    Read,
    Write,
    ChoiceRead,
    ChoiceWrite,
}

struct PendingEntry {
    fiber: FiberHandle,
    sched_id: u64,
    mode: PendingMode,
    /// Offered payload for a `ChoiceWrite` entry: the value hasn't been
    /// pushed into `items` yet, so whoever claims this entry takes it
    /// straight from here.
    value: Option<Value>,
}

/// A bounded (or rendezvous, capacity 0) FIFO channel of [`Value`]s plus the
/// queues of fibers parked waiting to read or write it.
pub struct ChannelObj {
    items: RefCell<VecDeque<Value>>,
    readers: RefCell<VecDeque<PendingEntry>>,
    writers: RefCell<VecDeque<PendingEntry>>,
    capacity: usize,
    closed: Cell<bool>,
}

/// Outcome of `give`/`take`/`select`: either it ran to completion inline, or
/// the calling fiber must suspend (`Signal::Event`) and be resumed later by
/// the scheduler once a counterpart shows up.
pub enum Outcome<T> {
    Done(T),
    Suspend,
}

impl ChannelObj {
    pub fn new(capacity: usize) -> Rc<Self> {
        Rc::new(ChannelObj {
            items: RefCell::new(VecDeque::new()),
            readers: RefCell::new(VecDeque::new()),
            writers: RefCell::new(VecDeque::new()),
            capacity,
            closed: Cell::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn count(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    fn mark(&self, heap: &Heap) {
        for item in self.items.borrow().iter() {
            heap.mark_reachable(item);
        }
        for writer in self.writers.borrow().iter() {
            if let Some(value) = &writer.value {
                heap.mark_reachable(value);
            }
        }
    }

    /// Drop any pending entry whose fiber's generation no longer matches
    /// (it resumed via some other path since registering here).
    fn pop_live_reader(&self) -> Option<PendingEntry> {
        loop {
            let reader = self.readers.borrow_mut().pop_front()?;
            if reader.fiber.sched_id() == reader.sched_id {
                return Some(reader);
            }
        }
    }

    fn pop_live_plain_writer(&self) -> Option<PendingEntry> {
        loop {
            let front_is_plain = matches!(
                self.writers.borrow().front(),
                Some(entry) if entry.mode == PendingMode::Write
            );
            if !front_is_plain {
                return None;
            }
            let writer = self.writers.borrow_mut().pop_front()?;
            if writer.fiber.sched_id() == writer.sched_id {
                return Some(writer);
            }
        }
    }

    fn pop_live_choice_writer(&self) -> Option<PendingEntry> {
        let mut stash = Vec::new();
        let result = loop {
            let Some(writer) = self.writers.borrow_mut().pop_front() else {
                break None;
            };
            if writer.mode != PendingMode::ChoiceWrite {
                stash.push(writer);
                continue;
            }
            if writer.fiber.sched_id() == writer.sched_id {
                break Some(writer);
            }
        };
        for entry in stash.into_iter().rev() {
            self.writers.borrow_mut().push_front(entry);
        }
        result
    }

    /// `ev/give`: hand `value` straight to a live pending reader if one
    /// exists, else buffer it; if that pushes the buffer past `capacity`,
    /// the calling fiber must suspend until a `take` frees a slot.
    pub fn give(&self, loop_: &Loop, fiber: &FiberHandle, value: Value) -> Result<Outcome<()>> {
        if self.closed.get() {
            return Err(Error::ChannelClosed("cannot write to a closed channel"));
        }
        if let Some(reader) = self.pop_live_reader() {
            let resume = match reader.mode {
                PendingMode::ChoiceRead => take_tuple(value),
                _ => value,
            };
            loop_.schedule(reader.fiber, resume, Signal::Ok);
            return Ok(Outcome::Done(()));
        }
        self.items.borrow_mut().push_back(value);
        if self.count() > self.capacity {
            let sched_id = fiber.bump_sched_id();
            self.writers.borrow_mut().push_back(PendingEntry {
                fiber: fiber.clone(),
                sched_id,
                mode: PendingMode::Write,
                value: None,
            });
            return Ok(Outcome::Suspend);
        }
        Ok(Outcome::Done(()))
    }

    /// `ev/take`: pop a buffered item if one exists
    /// (waking one parked writer since that frees a slot), else claim a
    /// directly-offered `ChoiceWrite` value, else park as a reader. Reading
    /// a closed, empty channel resolves immediately to `nil`.
    pub fn take(&self, loop_: &Loop, fiber: &FiberHandle) -> Outcome<Value> {
        if let Some(value) = self.items.borrow_mut().pop_front() {
            if let Some(writer) = self.pop_live_plain_writer() {
                loop_.schedule(writer.fiber, Value::Nil, Signal::Ok);
            }
            return Outcome::Done(value);
        }
        if let Some(writer) = self.pop_live_choice_writer() {
            let value = writer.value.unwrap_or(Value::Nil);
            loop_.schedule(writer.fiber, give_tuple(), Signal::Ok);
            return Outcome::Done(value);
        }
        if self.closed.get() {
            return Outcome::Done(Value::Nil);
        }
        let sched_id = fiber.bump_sched_id();
        self.readers.borrow_mut().push_back(PendingEntry {
            fiber: fiber.clone(),
            sched_id,
            mode: PendingMode::Read,
            value: None,
        });
        Outcome::Suspend
    }

    /// `ev/close`: wake every parked fiber (choice-parked ones get a
    /// `[:close chan]` marker, plain ones get `nil`) and mark the channel
    /// closed so subsequent `take`s on an empty buffer resolve to `nil`
    /// instead of parking, and `give` errors.
    pub fn close(&self, loop_: &Loop) {
        self.closed.set(true);
        for reader in self.readers.borrow_mut().drain(..) {
            let value = match reader.mode {
                PendingMode::ChoiceRead => close_tuple(),
                _ => Value::Nil,
            };
            loop_.schedule(reader.fiber, value, Signal::Ok);
        }
        for writer in self.writers.borrow_mut().drain(..) {
            let value = match writer.mode {
                PendingMode::ChoiceWrite => close_tuple(),
                _ => Value::Nil,
            };
            loop_.schedule(writer.fiber, value, Signal::Ok);
        }
    }
}

/// One clause of an `ev/select`/`ev/rselect` list: a bare channel to read,
/// or a `(channel, value)` pair to write.
pub enum SelectClause {
    Read(Rc<ChannelObj>),
    Write(Rc<ChannelObj>, Value),
}

/// Which clause fired and how, by index into the original clause list.
pub enum SelectResult {
    Take(usize, Value),
    Give(usize),
    Closed(usize),
}

/// `ev/select` (`shuffle = false`) / `ev/rselect` (`shuffle = true`, spec
/// §4.4 "fair selection via Fisher-Yates"). Scans clauses for one that can
/// proceed without blocking; if none can, registers a `Choice*` pending
/// entry on every clause and suspends, so whichever fires first wins and
/// the rest are later discarded as stale via `sched_id`.
pub fn select(
    clauses: &[SelectClause],
    loop_: &Loop,
    fiber: &FiberHandle,
    shuffle: bool,
) -> Result<Outcome<SelectResult>> {
    let mut order: Vec<usize> = (0..clauses.len()).collect();
    if shuffle {
        order.shuffle(&mut rand::thread_rng());
    }
    for &i in &order {
        match &clauses[i] {
            SelectClause::Read(chan) => {
                if let Some(value) = chan.items.borrow_mut().pop_front() {
                    if let Some(writer) = chan.pop_live_plain_writer() {
                        loop_.schedule(writer.fiber, Value::Nil, Signal::Ok);
                    }
                    return Ok(Outcome::Done(SelectResult::Take(i, value)));
                }
                if let Some(writer) = chan.pop_live_choice_writer() {
                    let value = writer.value.unwrap_or(Value::Nil);
                    loop_.schedule(writer.fiber, give_tuple(), Signal::Ok);
                    return Ok(Outcome::Done(SelectResult::Take(i, value)));
                }
                if chan.closed.get() {
                    return Ok(Outcome::Done(SelectResult::Closed(i)));
                }
            }
            SelectClause::Write(chan, value) => {
                if chan.closed.get() {
                    return Err(Error::ChannelClosed("cannot write to a closed channel"));
                }
                if let Some(reader) = chan.pop_live_reader() {
                    let resume = match reader.mode {
                        PendingMode::ChoiceRead => take_tuple(value.clone()),
                        _ => value.clone(),
                    };
                    loop_.schedule(reader.fiber, resume, Signal::Ok);
                    return Ok(Outcome::Done(SelectResult::Give(i)));
                }
                if !chan.is_full() {
                    chan.items.borrow_mut().push_back(value.clone());
                    return Ok(Outcome::Done(SelectResult::Give(i)));
                }
            }
        }
    }
    let sched_id = fiber.bump_sched_id();
    for clause in clauses {
        match clause {
            SelectClause::Read(chan) => chan.readers.borrow_mut().push_back(PendingEntry {
                fiber: fiber.clone(),
                sched_id,
                mode: PendingMode::ChoiceRead,
                value: None,
            }),
            SelectClause::Write(chan, value) => chan.writers.borrow_mut().push_back(PendingEntry {
                fiber: fiber.clone(),
                sched_id,
                mode: PendingMode::ChoiceWrite,
                value: Some(value.clone()),
            }),
        }
    }
    Ok(Outcome::Suspend)
}

fn keyword(name: &str) -> Value {
    Value::Keyword(crate::value::LString::new(name.as_bytes().to_vec()))
}

fn take_tuple(value: Value) -> Value {
    Value::Tuple(Rc::new(crate::value::TupleObj {
        header: crate::value::GcHeader::new(),
        items: vec![keyword("take"), value].into_boxed_slice(),
        source_flag: false,
    }))
}

fn give_tuple() -> Value {
    Value::Tuple(Rc::new(crate::value::TupleObj {
        header: crate::value::GcHeader::new(),
        items: vec![keyword("give")].into_boxed_slice(),
        source_flag: false,
    }))
}

fn close_tuple() -> Value {
    Value::Tuple(Rc::new(crate::value::TupleObj {
        header: crate::value::GcHeader::new(),
        items: vec![keyword("close")].into_boxed_slice(),
        source_flag: false,
    }))
}

/// A cross-thread channel: items are marshaled byte buffers rather than
/// live `Value`s, since `Value` isn't
/// `Send`, guarded by a single mutex held across every push/pop/close. Built
/// only with the `threaded` feature, mirroring the crossbeam-backed
/// cross-thread path the `threaded` feature flag was added in `Cargo.toml`
/// for.
#[cfg(feature = "threaded")]
pub mod threaded {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use crate::error::{Error, Result};
    use crate::marshal::{decode, encode, MarshalFlags};
    use crate::registry::Registry;
    use crate::value::Value;

    struct State {
        items: VecDeque<Vec<u8>>,
        closed: bool,
    }

    pub struct ThreadedChannel {
        state: Mutex<State>,
        capacity: usize,
    }

    impl ThreadedChannel {
        pub fn new(capacity: usize) -> Arc<Self> {
            Arc::new(ThreadedChannel {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                }),
                capacity,
            })
        }

        pub fn capacity(&self) -> usize {
            self.capacity
        }

        pub fn is_full(&self) -> bool {
            self.state.lock().unwrap().items.len() >= self.capacity
        }

        /// Marshal `value` with the `UNSAFE` flag (threaded channels cross
        /// VM boundaries but never process boundaries, so raw pointers and
        /// fiber/abstract payloads the marshal codec would otherwise reject
        /// are acceptable here) and enqueue the bytes. Never suspends the
        /// caller; a writer wanting backpressure checks `is_full` itself.
        pub fn push(&self, value: &Value, registry: &Registry) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::ChannelClosed("cannot write to a closed channel"));
            }
            let mut buf = Vec::new();
            encode::marshal(&mut buf, value, Some(registry), None, MarshalFlags::UNSAFE)?;
            state.items.push_back(buf);
            Ok(())
        }

        /// `Ok(None)` means "empty, not closed" (caller should poll again
        /// later); a closed, empty channel decodes to `nil` like its
        /// same-thread counterpart.
        pub fn pop(&self, registry: &Registry) -> Result<Option<Value>> {
            let mut state = self.state.lock().unwrap();
            match state.items.pop_front() {
                Some(bytes) => {
                    let mut cursor = 0usize;
                    let value = decode::unmarshal(&bytes, Some(registry), None, MarshalFlags::UNSAFE, &mut cursor)?;
                    Ok(Some(value))
                }
                None if state.closed => Ok(Some(Value::Nil)),
                None => Ok(None),
            }
        }

        pub fn close(&self) {
            self.state.lock().unwrap().closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalResult;
    use crate::fiber::FiberBuilder;

    fn fiber() -> FiberHandle {
        FiberBuilder::new().spawn(|_f, v| SignalResult::ok(v))
    }

    fn test_loop() -> Loop {
        Loop::new(Box::new(crate::ev::backend::TestBackend::new()))
    }

    #[test]
    fn rendezvous_give_before_take_parks_writer() {
        let chan = ChannelObj::new(0);
        let loop_ = test_loop();
        let writer = fiber();
        match chan.give(&loop_, &writer, Value::Int(1)).unwrap() {
            Outcome::Suspend => {}
            Outcome::Done(()) => panic!("capacity-0 channel should park the writer"),
        }
        assert_eq!(chan.count(), 1);
    }

    #[test]
    fn take_drains_buffered_item_and_wakes_writer() {
        let chan = ChannelObj::new(0);
        let loop_ = test_loop();
        let writer = fiber();
        chan.give(&loop_, &writer, Value::Int(42)).unwrap();
        let taker = fiber();
        match chan.take(&loop_, &taker) {
            Outcome::Done(Value::Int(n)) => assert_eq!(n, 42),
            _ => panic!("expected an immediately available item"),
        }
        assert!(loop_.has_scheduled(&writer));
    }

    #[test]
    fn take_on_empty_channel_parks_reader() {
        let chan = ChannelObj::new(1);
        let loop_ = test_loop();
        let reader = fiber();
        match chan.take(&loop_, &reader) {
            Outcome::Suspend => {}
            Outcome::Done(_) => panic!("empty channel should park the reader"),
        }
    }

    #[test]
    fn close_wakes_parked_reader_with_nil() {
        let chan = ChannelObj::new(0);
        let loop_ = test_loop();
        let reader = fiber();
        assert!(matches!(chan.take(&loop_, &reader), Outcome::Suspend));
        chan.close(&loop_);
        assert!(loop_.has_scheduled(&reader));
    }

    #[test]
    fn give_to_closed_channel_errors() {
        let chan = ChannelObj::new(1);
        let loop_ = test_loop();
        chan.close(&loop_);
        let writer = fiber();
        assert!(chan.give(&loop_, &writer, Value::Nil).is_err());
    }

    #[test]
    fn take_on_closed_empty_channel_resolves_to_nil() {
        let chan = ChannelObj::new(1);
        let loop_ = test_loop();
        chan.close(&loop_);
        let taker = fiber();
        match chan.take(&loop_, &taker) {
            Outcome::Done(Value::Nil) => {}
            _ => panic!("closed+empty take should resolve to nil inline"),
        }
    }

    #[test]
    fn select_prefers_an_immediately_ready_clause() {
        let ready = ChannelObj::new(0);
        let empty = ChannelObj::new(1);
        let loop_ = test_loop();
        let writer = fiber();
        ready.give(&loop_, &writer, Value::Int(9)).unwrap();
        let caller = fiber();
        let clauses = [SelectClause::Read(empty), SelectClause::Read(ready)];
        match select(&clauses, &loop_, &caller, false).unwrap() {
            Outcome::Done(SelectResult::Take(1, Value::Int(9))) => {}
            _ => panic!("expected clause 1 (the ready one) to fire"),
        }
    }

    #[test]
    fn select_with_no_ready_clause_suspends() {
        let a = ChannelObj::new(1);
        let b = ChannelObj::new(1);
        let loop_ = test_loop();
        let caller = fiber();
        let clauses = [SelectClause::Read(a), SelectClause::Read(b)];
        assert!(matches!(
            select(&clauses, &loop_, &caller, true).unwrap(),
            Outcome::Suspend
        ));
    }
}
