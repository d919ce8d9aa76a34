//! Cooperative multitasking: fibers, their frame stacks and signals, plus
//! the condition-variable style primitives built on top of them (spec §4.2).
//!
//! Unlike a C-backed fiber module, there is no real stack switching here:
//! a [`Fiber`] is a record of value-stack, call frames and status that the
//! bytecode dispatcher (out of scope for this crate) drives by calling
//! [`Fiber::push_frame`]/[`Fiber::pop_frame`] as it steps, and
//! [`Fiber::resume`]/[`Fiber::yield_`] to transfer control at a `continue`
//! boundary. A fiber wrapping a plain native closure ([`FiberBody::Native`])
//! runs that closure to completion in one step; it can still report
//! `Signal::Yield` but resuming it again re-enters the closure from its own
//! start unless the closure maintains its own resume point. This mirrors
//! the restriction the marshal codec places on fiber serialization (only
//! `Pending`/`Dead`/non-C fibers survive the round trip) by keeping the
//! notion of "this fiber has C frames on it" explicit rather than magic.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result, Signal, SignalResult};
use crate::value::Value;

pub mod channel;
pub mod sync;

pub use channel::{Channel, RecvError, Sender, Receiver, SendError, TryRecvError, TrySendError};
pub use sync::{Cond, Latch, LatchGuard, Mutex, MutexGuard};

/// Mirrors the status machine in spec §4.2 (`fiber_status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    Dead,
    Pending,
    New,
    Alive,
    Debug,
    Error,
    User0,
    User1,
    User2,
    User3,
    User4,
}

impl FiberStatus {
    pub fn is_resumable(self) -> bool {
        matches!(self, FiberStatus::New | FiberStatus::Pending)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FiberStatus::Dead | FiberStatus::Error)
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct FiberFlags: u32 {
        /// Set while bytecode frames belonging to a native (host) call are
        /// on the stack; such a fiber cannot be marshaled (§4.5).
        const HAS_C_FRAMES   = 1 << 0;
        /// Set once the fiber has been handed to another fiber as a "child"
        /// via resume, to detect resume-cycles.
        const RESUMING       = 1 << 1;
        /// Errors signaled in this fiber bubble to its resumer instead of
        /// being captured as a `Signal::Error` return value.
        const ERROR_BUBBLES  = 1 << 2;
        /// Set while this fiber has a `Task` sitting on the event loop's
        /// task queue, guarding against double-enqueue (spec §3 "Task").
        const SCHEDULED      = 1 << 3;
    }
}

/// One bytecode call frame: which function is executing, where the
/// instruction pointer and the base of its stack window are, and the
/// lexical environment it closes over. Kept intentionally thin since the
/// dispatcher that interprets `FuncDef::bytecode` lives outside this crate.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function: Rc<crate::value::FunctionObj>,
    pub pc: u32,
    pub frame_base: usize,
    pub is_tail: bool,
}

/// A fiber's value stack and frame stack, wrapped in `Rc<RefCell<_>>` so a
/// [`FuncEnv::OnStack`](crate::funcdef::FuncEnv::OnStack) closure can borrow
/// into its owner without that owner also being `Copy`.
pub struct Fiber {
    pub name: Option<String>,
    status: Cell<FiberStatus>,
    flags: Cell<FiberFlags>,
    stack: RefCell<Vec<Value>>,
    frames: RefCell<Vec<Frame>>,
    body: RefCell<Option<FiberBody>>,
    /// The fiber that last called `resume` on this one; used to route
    /// `Signal::Error` when `ERROR_BUBBLES` is unset (errors return to the
    /// resumer rather than propagating further, per §4.2 "error containment").
    resumer: RefCell<Option<FiberHandle>>,
    /// Monotonic generation counter bumped every time the scheduler (`ev`)
    /// schedules or parks this fiber; lets a stale wakeup (e.g. a channel
    /// handoff that arrives after the fiber already resumed via a timeout)
    /// be detected by comparing against the id captured when the wakeup
    /// was registered (spec §4.3 "Cancellation").
    sched_id: Cell<u64>,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

/// A fiber's entry point. `Native` closures run eagerly to completion (or
/// until they themselves return a yield signal); there is deliberately no
/// `Bytecode` variant here because stepping bytecode frames is the
/// dispatcher's job, not this struct's — a bytecode fiber is simply one
/// whose `body` is `None` and whose frames are pushed/popped directly by
/// that dispatcher.
enum FiberBody {
    Native(Box<dyn FnMut(&mut Fiber, Value) -> SignalResult>),
}

impl Fiber {
    fn new_raw(name: Option<String>, body: Option<FiberBody>) -> Rc<Self> {
        Rc::new(Fiber {
            name,
            status: Cell::new(FiberStatus::New),
            flags: Cell::new(FiberFlags::empty()),
            stack: RefCell::new(Vec::new()),
            frames: RefCell::new(Vec::new()),
            body: RefCell::new(body),
            resumer: RefCell::new(None),
            sched_id: Cell::new(0),
        })
    }

    pub fn status(&self) -> FiberStatus {
        self.status.get()
    }

    pub fn flags(&self) -> FiberFlags {
        self.flags.get()
    }

    pub fn set_flag(&self, flag: FiberFlags, on: bool) {
        let mut flags = self.flags.get();
        flags.set(flag, on);
        self.flags.set(flags);
    }

    pub fn push_frame(&self, frame: Frame) {
        self.frames.borrow_mut().push(frame);
    }

    pub fn pop_frame(&self) -> Option<Frame> {
        self.frames.borrow_mut().pop()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Clone of the `index`-th frame, bottom-counted (used by
    /// [`crate::marshal`]'s fiber serialization to walk the call stack
    /// without handing out a borrow of the frame vector itself).
    pub fn frame_at(&self, index: usize) -> Frame {
        self.frames.borrow()[index].clone()
    }

    pub fn stack_len(&self) -> usize {
        self.stack.borrow().len()
    }

    pub fn stack_push(&self, value: Value) {
        self.stack.borrow_mut().push(value);
    }

    pub fn stack_get(&self, index: usize) -> Value {
        self.stack.borrow()[index].clone()
    }

    pub fn stack_set(&self, index: usize, value: Value) {
        self.stack.borrow_mut()[index] = value;
    }

    pub fn stack_truncate(&self, len: usize) {
        self.stack.borrow_mut().truncate(len);
    }

    /// Transfer control into this fiber, passing `arg` as the resume value
    /// and `signal` as how it is being resumed (`Ok` for an ordinary
    /// wakeup, `Error` for a cancellation — spec §8 "fiber cancelled with
    /// value e while suspended: on its next resume, the current bytecode
    /// site raises with e"). Returns the [`Signal`] the fiber came back
    /// with and the value it produced (an ordinary return, a yielded value,
    /// or an error payload).
    ///
    /// A native (closure-bodied) fiber has no bytecode site to raise at, so
    /// `signal == Signal::Error` short-circuits straight to an ERROR status
    /// without invoking the closure at all — the one sound interpretation
    /// available without a dispatcher to hand the signal to.
    pub fn continue_(self: &Rc<Self>, arg: Value, signal: Signal) -> Result<SignalResult> {
        if !self.status.get().is_resumable() {
            return Err(Error::NotResumable(self.status.get()));
        }
        if signal == Signal::Error {
            self.status.set(FiberStatus::Error);
            return Ok(SignalResult::error(arg));
        }
        self.status.set(FiberStatus::Alive);
        let result = match self.body.borrow_mut().as_mut() {
            Some(FiberBody::Native(f)) => f(
                // SAFETY-free: `Fiber` isn't `Sync`/`Send` and all access
                // happens on the single thread driving the event loop, so a
                // second mutable borrow through `&mut Fiber` here is sound
                // as long as the closure doesn't re-enter `continue_` on
                // itself, which would already be rejected by the status
                // check above.
                unsafe { &mut *(Rc::as_ptr(self) as *mut Fiber) },
                arg,
            ),
            None => SignalResult::error(Value::Nil),
        };
        self.status.set(match result.signal {
            Signal::Ok | Signal::Error => FiberStatus::Dead,
            Signal::Yield => FiberStatus::Pending,
            Signal::Debug => FiberStatus::Debug,
            Signal::User0 => FiberStatus::User0,
            Signal::User1 => FiberStatus::User1,
            Signal::User2 => FiberStatus::User2,
            Signal::User3 => FiberStatus::User3,
            Signal::User4 => FiberStatus::User4,
            Signal::Event | Signal::Interrupt => FiberStatus::Pending,
        });
        Ok(result)
    }

    /// Record which fiber should receive a bubbled error, mirroring the
    /// resumer link a C fiber implicitly keeps on its call stack.
    pub fn set_resumer(&self, resumer: Option<FiberHandle>) {
        *self.resumer.borrow_mut() = resumer;
    }

    pub fn resumer(&self) -> Option<FiberHandle> {
        self.resumer.borrow().clone()
    }

    /// Current scheduling generation. Bumped by [`Fiber::bump_sched_id`]
    /// every time the event loop schedules or parks this fiber.
    pub fn sched_id(&self) -> u64 {
        self.sched_id.get()
    }

    /// Advance and return the new generation id, invalidating any pending
    /// timeout/channel-wait entry that captured the previous one.
    pub fn bump_sched_id(&self) -> u64 {
        let next = self.sched_id.get().wrapping_add(1);
        self.sched_id.set(next);
        next
    }

    /// Rebuild a fiber from its unmarshaled parts (spec §4.5 "Fiber
    /// serialization"). The reconstructed fiber has no native body; it is a
    /// bytecode fiber whose frames were restored directly, same as one
    /// built by [`FiberBuilder::spawn_bytecode`].
    fn from_parts(name: Option<String>, status: FiberStatus, flags: FiberFlags, stack: Vec<Value>, frames: Vec<Frame>) -> Rc<Self> {
        Rc::new(Fiber {
            name,
            status: Cell::new(status),
            flags: Cell::new(flags),
            stack: RefCell::new(stack),
            frames: RefCell::new(frames),
            body: RefCell::new(None),
            resumer: RefCell::new(None),
            sched_id: Cell::new(0),
        })
    }
}

/// A reference-counted handle to a [`Fiber`], cheap to clone and usable as
/// a hash key / equality key by identity (spec's fiber values compare and
/// hash by which fiber object they are, never by content).
#[derive(Clone)]
pub struct FiberHandle(Rc<Fiber>);

impl FiberHandle {
    pub fn ptr_eq(&self, other: &FiberHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn hash_key(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn status(&self) -> FiberStatus {
        self.0.status()
    }

    pub fn stack_get(&self, index: usize) -> Value {
        self.0.stack_get(index)
    }

    pub fn stack_set(&self, index: usize, value: Value) {
        self.0.stack_set(index, value)
    }

    pub fn continue_(&self, arg: Value, signal: Signal) -> Result<SignalResult> {
        self.0.continue_(arg, signal)
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn sched_id(&self) -> u64 {
        self.0.sched_id()
    }

    pub fn bump_sched_id(&self) -> u64 {
        self.0.bump_sched_id()
    }

    pub fn flags(&self) -> FiberFlags {
        self.0.flags()
    }

    pub fn set_flag(&self, flag: FiberFlags, on: bool) {
        self.0.set_flag(flag, on)
    }

    pub fn is_scheduled(&self) -> bool {
        self.0.flags().contains(FiberFlags::SCHEDULED)
    }

    pub fn resumer(&self) -> Option<FiberHandle> {
        self.0.resumer()
    }

    pub fn set_resumer(&self, resumer: Option<FiberHandle>) {
        self.0.set_resumer(resumer)
    }

    pub fn frame_depth(&self) -> usize {
        self.0.frame_depth()
    }

    pub fn frame_at(&self, index: usize) -> Frame {
        self.0.frame_at(index)
    }

    pub fn stack_len(&self) -> usize {
        self.0.stack_len()
    }

    /// Rebuild a fiber from unmarshaled parts; see [`Fiber::from_parts`].
    pub fn from_parts(name: Option<String>, status: FiberStatus, flags: FiberFlags, stack: Vec<Value>, frames: Vec<Frame>) -> Self {
        FiberHandle(Fiber::from_parts(name, status, flags, stack, frames))
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fiber {:#x}>", self.hash_key())
    }
}

/// Factory for fibers: name + stack-ish config, then `start`/`spawn`.
pub struct FiberBuilder {
    name: Option<String>,
    error_bubbles: bool,
}

impl FiberBuilder {
    pub fn new() -> Self {
        FiberBuilder {
            name: None,
            error_bubbles: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Controls whether an uncaught error in the fiber propagates to its
    /// resumer (`true`, the default) or is only ever visible via
    /// `continue_`'s returned `Signal::Error` (`false`).
    pub fn error_bubbles(mut self, yes: bool) -> Self {
        self.error_bubbles = yes;
        self
    }

    /// Build a fiber that runs `body` to completion (or until it signals a
    /// yield) each time it's continued.
    pub fn spawn(self, body: impl FnMut(&mut Fiber, Value) -> SignalResult + 'static) -> FiberHandle {
        let fiber = Fiber::new_raw(self.name, Some(FiberBody::Native(Box::new(body))));
        fiber.set_flag(FiberFlags::ERROR_BUBBLES, self.error_bubbles);
        FiberHandle(fiber)
    }

    /// Build an empty fiber with no native body; its frames are expected to
    /// be pushed directly by a bytecode dispatcher.
    pub fn spawn_bytecode(self) -> FiberHandle {
        let fiber = Fiber::new_raw(self.name, None);
        fiber.set_flag(FiberFlags::ERROR_BUBBLES, self.error_bubbles);
        FiberHandle(fiber)
    }
}

impl Default for FiberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative scheduler-local run queue of fibers that are `Pending` and
/// ready to be resumed on the next loop iteration; consulted by the `ev`
/// module's task ring (spec §4.3).
#[derive(Default)]
pub struct ReadyQueue {
    queue: RefCell<VecDeque<FiberHandle>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, fiber: FiberHandle) {
        self.queue.borrow_mut().push_back(fiber);
    }

    pub fn pop(&self) -> Option<FiberHandle> {
        self.queue.borrow_mut().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fiber_is_resumable_and_dies_after_one_native_run() {
        let fiber = FiberBuilder::new().name("worker").spawn(|_fiber, arg| {
            SignalResult::ok(arg)
        });
        assert_eq!(fiber.status(), FiberStatus::New);
        let result = fiber.continue_(Value::Int(7), Signal::Ok).unwrap();
        assert_eq!(result.signal, Signal::Ok);
        assert_eq!(fiber.status(), FiberStatus::Dead);
    }

    #[test]
    fn continuing_a_dead_fiber_errors() {
        let fiber = FiberBuilder::new().spawn(|_fiber, arg| SignalResult::ok(arg));
        fiber.continue_(Value::Nil, Signal::Ok).unwrap();
        assert!(fiber.continue_(Value::Nil, Signal::Ok).is_err());
    }

    #[test]
    fn yielded_fiber_goes_pending() {
        let fiber = FiberBuilder::new().spawn(|_fiber, _arg| SignalResult {
            signal: Signal::Yield,
            value: Value::Int(1),
        });
        let result = fiber.continue_(Value::Nil, Signal::Ok).unwrap();
        assert_eq!(result.signal, Signal::Yield);
        assert_eq!(fiber.status(), FiberStatus::Pending);
    }

    #[test]
    fn error_signal_short_circuits_a_native_fiber_to_error_status() {
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let fiber = FiberBuilder::new().spawn(move |_fiber, arg| {
            ran2.set(true);
            SignalResult::ok(arg)
        });
        let result = fiber.continue_(Value::Int(9), Signal::Error).unwrap();
        assert_eq!(result.signal, Signal::Error);
        assert_eq!(result.value, Value::Int(9));
        assert_eq!(fiber.status(), FiberStatus::Error);
        assert!(!ran.get(), "the closure must not run when resumed with an error signal");
    }

    #[test]
    fn handles_compare_by_identity() {
        let a = FiberBuilder::new().spawn(|_f, v| SignalResult::ok(v));
        let b = a.clone();
        let c = FiberBuilder::new().spawn(|_f, v| SignalResult::ok(v));
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }
}
