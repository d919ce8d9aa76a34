//! The event loop itself. Ties the task ring, timeout heap, poll backend
//! and stream/listener bookkeeping together into one `Loop` that a host
//! drives by calling [`Loop::run`] from its own top-level, the same way a
//! `fiber::r#yield`/`coio_wait` pair relies on an outer event loop it
//! doesn't itself own.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::raw::c_int;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::error::{Error, Result, Signal, SignalResult};
use crate::fiber::{FiberFlags, FiberHandle};
use crate::value::{LString, Value};

use super::backend::{Interest, PollBackend};
use super::channel::ChannelObj;
use super::stream::{Listener, ListenerEvent, ListenerMachine, ListenerMask, ListenerOutcome, Stream};
use super::task::{Task, TaskQueue};
use super::timeout::{TimeoutEntry, TimeoutHeap};

/// Outcome of a cross-thread `ev/threadcall`. Deliberately a closed,
/// `Send`-safe enum rather than a raw `Value`: a
/// `Value` isn't `Send` (it may hold `Rc`s), so the payload crossing the
/// thread boundary has to be this plain shape, decoded back into a `Value`
/// only once it is popped on the loop's own thread.
#[derive(Debug, Clone)]
pub enum ThreadResult {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Keyword(String),
    Err(String),
}

impl ThreadResult {
    fn into_signal_value(self) -> (Value, Signal) {
        match self {
            ThreadResult::Nil => (Value::Nil, Signal::Ok),
            ThreadResult::Bool(b) => (Value::Bool(b), Signal::Ok),
            ThreadResult::Int(n) => (Value::Number(n as f64), Signal::Ok),
            ThreadResult::Str(s) => (Value::String(LString::new(s.into_bytes())), Signal::Ok),
            ThreadResult::Keyword(s) => (Value::Keyword(LString::new(s.into_bytes())), Signal::Ok),
            ThreadResult::Err(msg) => (Value::String(LString::new(msg.into_bytes())), Signal::Error),
        }
    }
}

/// A listener machine that does no bookkeeping of its own: the *waking* of
/// the parked fiber is handled uniformly by [`Loop::wake_matching`] before
/// dispatch even reaches here. This machine only decides whether the
/// listener stays armed; it unregisters itself the first time a readiness
/// or terminal event reaches it, since `ev/read`/`ev/write` park one fiber
/// for one event rather than subscribing durably.
struct OneShotMachine;
impl ListenerMachine for OneShotMachine {
    fn handle(&mut self, event: ListenerEvent, _stream: &Stream) -> ListenerOutcome {
        match event {
            ListenerEvent::Read
            | ListenerEvent::Write
            | ListenerEvent::Err
            | ListenerEvent::Hup
            | ListenerEvent::Complete
            | ListenerEvent::Cancel
            | ListenerEvent::Close => ListenerOutcome::Done,
            ListenerEvent::Init | ListenerEvent::Deinit | ListenerEvent::Mark | ListenerEvent::User => {
                ListenerOutcome::NotDone
            }
        }
    }
}

pub struct Loop {
    backend: RefCell<Box<dyn PollBackend>>,
    tasks: RefCell<TaskQueue>,
    timeouts: RefCell<TimeoutHeap>,
    streams: RefCell<HashMap<c_int, Rc<Stream>>>,
    /// One entry per fiber currently parked on a stream listener; dismantled
    /// the moment that fiber is next resumed, whatever resumed it.
    waiting: RefCell<HashMap<usize, (Rc<Stream>, Rc<Listener>)>>,
    supervisors: RefCell<HashMap<usize, Rc<ChannelObj>>>,
    /// Keeps `run` alive even with an empty task/timeout/stream set, e.g.
    /// while a host holds an external reference to this VM from another
    /// thread.
    extra_refs: Cell<i64>,
    epoch: Instant,
    next_request_id: Cell<u64>,
    pending_threaded: RefCell<HashMap<u64, FiberHandle>>,
    thread_results: Arc<SegQueue<(u64, ThreadResult)>>,
    /// Upper bound on a single `poll`, so a pending threaded call or an
    /// externally-posted event (neither of which the poll backend itself
    /// knows how to wake on) is never noticed more than this long after it
    /// actually completes.
    max_poll: Duration,
}

impl Loop {
    pub fn new(backend: Box<dyn PollBackend>) -> Self {
        Loop {
            backend: RefCell::new(backend),
            tasks: RefCell::new(TaskQueue::new()),
            timeouts: RefCell::new(TimeoutHeap::new()),
            streams: RefCell::new(HashMap::new()),
            waiting: RefCell::new(HashMap::new()),
            supervisors: RefCell::new(HashMap::new()),
            extra_refs: Cell::new(0),
            epoch: Instant::now(),
            next_request_id: Cell::new(0),
            pending_threaded: RefCell::new(HashMap::new()),
            thread_results: Arc::new(SegQueue::new()),
            max_poll: Duration::from_millis(50),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn ref_external(&self) {
        self.extra_refs.set(self.extra_refs.get() + 1);
    }

    pub fn unref_external(&self) {
        self.extra_refs.set(self.extra_refs.get() - 1);
    }

    // ---- scheduling -----------------------------------------------------

    /// Enqueue `fiber` to be resumed with `value`/`signal` on the next
    /// drain, guarded by [`FiberFlags::SCHEDULED`] against double-enqueue.
    pub fn schedule(&self, fiber: FiberHandle, value: Value, signal: Signal) {
        if fiber.is_scheduled() {
            return;
        }
        fiber.set_flag(FiberFlags::SCHEDULED, true);
        self.tasks.borrow_mut().push(Task { fiber, value, signal });
    }

    pub fn has_scheduled(&self, fiber: &FiberHandle) -> bool {
        fiber.is_scheduled()
    }

    /// Cancel a parked fiber: bump its
    /// generation so any pending channel entry it left behind is later
    /// skipped as stale, dismantle any stream listener it's parked on, then
    /// schedule it to resume with `err` under `Signal::Error`.
    pub fn cancel(&self, fiber: FiberHandle, err: Value) {
        fiber.bump_sched_id();
        self.dismantle_waiting(&fiber);
        self.schedule(fiber, err, Signal::Error);
    }

    // ---- timeouts ---------------------------------------------------

    /// `ev/sleep`: resume `fiber` with `nil` after `seconds`, unless it was
    /// already resumed some other way first (detected via `sched_id`).
    pub fn sleep(&self, fiber: &FiberHandle, seconds: f64) {
        self.push_timeout(fiber, seconds, false);
    }

    /// Like [`Loop::sleep`] but cancels with a timeout error instead of
    /// resuming with `nil`; backs an explicit "wait at most N seconds" op.
    pub fn timeout(&self, fiber: &FiberHandle, seconds: f64) {
        self.push_timeout(fiber, seconds, true);
    }

    fn push_timeout(&self, fiber: &FiberHandle, seconds: f64, is_error: bool) {
        let when = self.now_ms() + (seconds.max(0.0) * 1000.0) as u64;
        self.timeouts.borrow_mut().push(TimeoutEntry {
            when,
            fiber: fiber.clone(),
            curr_fiber: None,
            sched_id: fiber.sched_id(),
            is_error,
        });
    }

    /// `ev/deadline`: cancel `to_cancel` after `seconds` *iff* `to_check` is
    /// still unfinished at that point; otherwise the entry is dropped
    /// silently.
    pub fn deadline(&self, to_cancel: &FiberHandle, seconds: f64, to_check: &FiberHandle) {
        let when = self.now_ms() + (seconds.max(0.0) * 1000.0) as u64;
        self.timeouts.borrow_mut().push(TimeoutEntry {
            when,
            fiber: to_cancel.clone(),
            curr_fiber: Some(to_check.clone()),
            sched_id: to_cancel.sched_id(),
            is_error: true,
        });
    }

    /// Pop and act on every timeout entry whose deadline has passed.
    pub fn expire_timers(&self) {
        let now = self.now_ms();
        loop {
            let ready = matches!(self.timeouts.borrow().peek_when(), Some(when) if when <= now);
            if !ready {
                break;
            }
            let entry = match self.timeouts.borrow_mut().pop() {
                Some(e) => e,
                None => break,
            };
            self.fire_timeout(entry);
        }
    }

    fn fire_timeout(&self, entry: TimeoutEntry) {
        if entry.is_deadline() {
            let to_check = entry.curr_fiber.as_ref().expect("deadline entry always carries curr_fiber");
            if !to_check.status().is_terminal() {
                self.cancel(entry.fiber, deadline_expired_value());
            }
            return;
        }
        if entry.fiber.sched_id() != entry.sched_id {
            return; // stale: fiber already resumed some other way
        }
        if entry.is_error {
            self.cancel(entry.fiber, timeout_value());
        } else {
            self.schedule(entry.fiber, Value::Nil, Signal::Ok);
        }
    }

    // ---- streams / listeners ---------------------------------------------

    /// Park `fiber` on `stream` until `mask` becomes ready. A fiber may
    /// only have one outstanding stream wait at a time; a second call while
    /// the first is still pending is a protocol error rather than silently
    /// replacing it.
    pub fn await_stream(&self, stream: Rc<Stream>, fiber: FiberHandle, mask: ListenerMask) -> Result<()> {
        if self.waiting.borrow().contains_key(&fiber.hash_key()) {
            return Err(Error::protocol("fiber may only wait on one listener at a time"));
        }
        let listener = Listener::new(Some(fiber.clone()), mask, Box::new(OneShotMachine));
        stream.add_listener(listener.clone())?;
        self.register_stream(stream.clone())
            .map_err(Error::Io)?;
        self.waiting.borrow_mut().insert(fiber.hash_key(), (stream, listener));
        Ok(())
    }

    /// Dismantle whatever listener `fiber` is parked on, if any. Done
    /// unconditionally before the fiber runs again, however it got resumed.
    fn dismantle_waiting(&self, fiber: &FiberHandle) {
        if let Some((stream, listener)) = self.waiting.borrow_mut().remove(&fiber.hash_key()) {
            stream.cancel_listener(&listener);
            if stream.listeners().is_empty() {
                let _ = self.unregister_stream(&stream);
            }
        }
    }

    pub fn register_stream(&self, stream: Rc<Stream>) -> std::io::Result<()> {
        let already_registered = self.streams.borrow().contains_key(&stream.handle);
        self.sync_interest(&stream)?;
        if !already_registered {
            self.streams.borrow_mut().insert(stream.handle, stream);
        }
        Ok(())
    }

    pub fn unregister_stream(&self, stream: &Stream) -> std::io::Result<()> {
        self.streams.borrow_mut().remove(&stream.handle);
        self.backend.borrow_mut().deregister(stream.handle)
    }

    fn sync_interest(&self, stream: &Stream) -> std::io::Result<()> {
        let mut interest = Interest { readable: false, writable: false };
        for listener in stream.listeners() {
            if listener.mask.contains(ListenerMask::READ) {
                interest.readable = true;
            }
            if listener.mask.contains(ListenerMask::WRITE) {
                interest.writable = true;
            }
        }
        if self.streams.borrow().contains_key(&stream.handle) {
            self.backend.borrow_mut().modify(stream.handle, interest)
        } else {
            self.backend.borrow_mut().register(stream.handle, interest)
        }
    }

    /// Schedule every fiber parked on `stream` whose mask intersects
    /// `mask`, ahead of the listener machine's own `Done`/`NotDone`
    /// bookkeeping dispatch (§4.3's "listener state machine" and the
    /// scheduler's fiber wakeup are kept as two separate concerns here
    /// rather than one trait method doing both).
    fn wake_matching(&self, stream: &Stream, mask: ListenerMask) {
        for listener in stream.listeners() {
            if listener.mask.intersects(mask) {
                if let Some(fiber) = &listener.fiber {
                    self.schedule(fiber.clone(), Value::Nil, Signal::Ok);
                }
            }
        }
    }

    // ---- supervisors (ev/go) ---------------------------------------------

    pub fn set_supervisor(&self, fiber: &FiberHandle, chan: Rc<ChannelObj>) {
        self.supervisors.borrow_mut().insert(fiber.hash_key(), chan);
    }

    pub fn supervisor_of(&self, fiber: &FiberHandle) -> Option<Rc<ChannelObj>> {
        self.supervisors.borrow().get(&fiber.hash_key()).cloned()
    }

    /// `ev/go`: schedule `fiber` to start running with `value`, attaching
    /// `supervisor` if given or else inheriting `current`'s.
    pub fn go(
        &self,
        fiber: FiberHandle,
        value: Value,
        supervisor: Option<Rc<ChannelObj>>,
        current: Option<&FiberHandle>,
    ) {
        let inherited = supervisor.or_else(|| current.and_then(|c| self.supervisor_of(c)));
        if let Some(chan) = inherited {
            self.set_supervisor(&fiber, chan);
        }
        self.schedule(fiber, value, Signal::Ok);
    }

    // ---- cross-thread calls (ev/threadcall) ------------------------------

    /// Run `work` on a freshly spawned OS thread and resume `fiber` with
    /// its result once `run` next drains completions. `work` may only
    /// close over `Send` data — in particular, never a `Value` or
    /// `FiberHandle` — mirroring the crate's actual cross-thread boundary:
    /// the result comes back as a [`ThreadResult`], decoded into a `Value`
    /// only on this loop's own thread.
    pub fn threaded_call<F>(&self, fiber: &FiberHandle, work: F)
    where
        F: FnOnce() -> ThreadResult + Send + 'static,
    {
        let id = self.register_pending(fiber);
        let results = self.thread_results.clone();
        std::thread::spawn(move || {
            let outcome = work();
            results.push((id, outcome));
        });
    }

    /// Lower-level half of [`Loop::threaded_call`]: reserves a request id
    /// and records which fiber to resume when a result with that id shows
    /// up, without itself spawning anything. Exposed so a caller holding
    /// its own handle to [`Loop::result_sink`] (e.g. a long-lived worker
    /// thread pool, or another VM posting cross-VM per spec's
    /// `post_event`) can deliver results without this loop spawning the
    /// thread itself.
    pub fn register_pending(&self, fiber: &FiberHandle) -> u64 {
        let id = self.next_request_id.get();
        self.next_request_id.set(id.wrapping_add(1));
        self.pending_threaded.borrow_mut().insert(id, fiber.clone());
        id
    }

    /// The `Send`-safe queue external producers push `(request_id,
    /// ThreadResult)` pairs onto; drained by `run`/`drain_thread_results`.
    pub fn result_sink(&self) -> Arc<SegQueue<(u64, ThreadResult)>> {
        self.thread_results.clone()
    }

    fn drain_thread_results(&self) {
        while let Some((id, outcome)) = self.thread_results.pop() {
            if let Some(fiber) = self.pending_threaded.borrow_mut().remove(&id) {
                let (value, signal) = outcome.into_signal_value();
                self.schedule(fiber, value, signal);
            }
        }
    }

    // ---- the loop itself --------------------------------------------------

    /// Resume every currently-queued task exactly once, routing each
    /// fiber's outcome to its supervisor if it has one, else the configured
    /// error sink, else a silent drop for a task whose fiber somehow became
    /// unresumable in the meantime. Returns every fiber that signaled
    /// `Signal::Interrupt` during this pass (spec §4.3 main loop step 2,
    /// "INTERRUPT: return that fiber to the caller so the outer driver can
    /// re-schedule it explicitly") — such a fiber is left `Pending` and
    /// off the task queue, deliberately not auto-rescheduled here.
    pub fn drain_tasks(&self, vm: &crate::vm::Vm) -> Vec<FiberHandle> {
        let mut interrupted = Vec::new();
        loop {
            let task = self.tasks.borrow_mut().pop();
            let Some(task) = task else { break };
            task.fiber.set_flag(FiberFlags::SCHEDULED, false);
            self.dismantle_waiting(&task.fiber);
            match task.fiber.continue_(task.value, task.signal) {
                Ok(result) => {
                    if result.signal == Signal::Interrupt {
                        interrupted.push(task.fiber.clone());
                    }
                    self.handle_signal(vm, &task.fiber, result);
                }
                Err(_) => {} // already dead/unresumable: stale task, drop it
            }
        }
        interrupted
    }

    /// `(keyword-for-signal, fiber-or-last-value)`, e.g. `Signal::Error`
    /// carrying `"deadline expired"` becomes the tuple
    /// `[:error "deadline expired"]`.
    fn supervisor_tuple(signal: Signal, value: Value) -> Value {
        Value::Tuple(Rc::new(crate::value::TupleObj {
            header: crate::value::GcHeader::new(),
            items: vec![
                Value::Keyword(LString::new(signal.as_keyword_name().as_bytes().to_vec())),
                value,
            ]
            .into_boxed_slice(),
            source_flag: false,
        }))
    }

    fn handle_signal(&self, vm: &crate::vm::Vm, fiber: &FiberHandle, result: SignalResult) {
        match result.signal {
            Signal::Error => {
                self.waiting.borrow_mut().remove(&fiber.hash_key());
                match self.supervisors.borrow_mut().remove(&fiber.hash_key()) {
                    Some(sup) => {
                        let tuple = Self::supervisor_tuple(result.signal, result.value);
                        let _ = sup.give(self, fiber, tuple);
                    }
                    None => vm.report_uncaught_error(fiber.name(), &result.value),
                }
            }
            Signal::Ok => {
                self.waiting.borrow_mut().remove(&fiber.hash_key());
                if let Some(sup) = self.supervisors.borrow_mut().remove(&fiber.hash_key()) {
                    let tuple = Self::supervisor_tuple(result.signal, result.value);
                    let _ = sup.give(self, fiber, tuple);
                }
            }
            // Yield/Debug/User*/Event: fiber is Pending again, awaiting
            // whatever it itself registered (a timeout, a channel wait, a
            // stream listener) during this very `continue_` call. Nothing
            // further to do until that source fires.
            _ => {}
        }
    }

    fn compute_timeout(&self) -> Option<Duration> {
        let mut wait = self.max_poll;
        if let Some(when) = self.timeouts.borrow().peek_when() {
            let remaining = when.saturating_sub(self.now_ms());
            wait = wait.min(Duration::from_millis(remaining));
        }
        Some(wait)
    }

    /// One bounded wait on the poll backend plus dispatch of whatever
    /// becomes ready.
    pub fn poll_once(&self) -> std::io::Result<()> {
        let timeout = self.compute_timeout();
        let events = self.backend.borrow_mut().poll(timeout)?;
        for event in events {
            let stream = self.streams.borrow().get(&event.fd).cloned();
            let Some(stream) = stream else { continue };
            if event.readable {
                self.wake_matching(&stream, ListenerMask::READ);
                stream.dispatch(ListenerEvent::Read);
            }
            if event.writable {
                self.wake_matching(&stream, ListenerMask::WRITE);
                stream.dispatch(ListenerEvent::Write);
            }
            if event.hup {
                stream.dispatch(ListenerEvent::Hup);
            }
            if event.error {
                stream.dispatch(ListenerEvent::Err);
            }
        }
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.tasks.borrow().is_empty()
            && self.timeouts.borrow().is_empty()
            && self.streams.borrow().is_empty()
            && self.pending_threaded.borrow().is_empty()
            && self.extra_refs.get() <= 0
    }

    /// Drive the loop to quiescence: expire due timers, drain ready tasks,
    /// absorb any cross-thread results, and poll for I/O, until nothing is
    /// left that could ever produce more work. Returns every fiber that
    /// signaled `Signal::Interrupt` along the way, for the embedder to
    /// re-schedule explicitly (spec §4.3 main loop step 2) — an ordinary
    /// run with no bytecode dispatcher producing that signal returns an
    /// empty vec.
    pub fn run(&self, vm: &crate::vm::Vm) -> Vec<FiberHandle> {
        let mut interrupted = Vec::new();
        loop {
            self.expire_timers();
            interrupted.extend(self.drain_tasks(vm));
            self.drain_thread_results();
            interrupted.extend(self.drain_tasks(vm));
            if self.is_idle() {
                break;
            }
            if let Err(err) = self.poll_once() {
                crate::rt_error!("poll backend error: {err}");
                break;
            }
        }
        interrupted
    }

    /// Run until `fiber` reaches a terminal status, for host code that
    /// wants to block on one specific computation rather than the whole
    /// loop's quiescence (e.g. a top-level `main` fiber). See [`Loop::run`]
    /// for the meaning of the returned vec.
    pub fn run_until(&self, vm: &crate::vm::Vm, fiber: &FiberHandle) -> Vec<FiberHandle> {
        let mut interrupted = Vec::new();
        while !fiber.status().is_terminal() {
            self.expire_timers();
            interrupted.extend(self.drain_tasks(vm));
            self.drain_thread_results();
            interrupted.extend(self.drain_tasks(vm));
            if fiber.status().is_terminal() {
                break;
            }
            if self.is_idle() {
                break;
            }
            if let Err(err) = self.poll_once() {
                crate::rt_error!("poll backend error: {err}");
                break;
            }
        }
        interrupted
    }
}

fn deadline_expired_value() -> Value {
    Value::String(LString::new(b"deadline expired".to_vec()))
}

fn timeout_value() -> Value {
    Value::String(LString::new(b"timeout".to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ev::backend::TestBackend;
    use crate::error::SignalResult;
    use crate::fiber::FiberBuilder;
    use crate::vm::{Vm, VmConfig};
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn new_loop() -> Loop {
        Loop::new(Box::new(TestBackend::new()))
    }

    #[test]
    fn schedule_twice_before_drain_is_a_single_task() {
        let loop_ = new_loop();
        let ran = StdRc::new(StdRefCell::new(0));
        let ran2 = ran.clone();
        let fiber = FiberBuilder::new().spawn(move |_f, v| {
            *ran2.borrow_mut() += 1;
            SignalResult::ok(v)
        });
        loop_.schedule(fiber.clone(), Value::Nil, Signal::Ok);
        loop_.schedule(fiber.clone(), Value::Nil, Signal::Ok);
        let vm = Vm::new(VmConfig::default());
        loop_.drain_tasks(&vm);
        assert_eq!(*ran.borrow(), 1);
    }

    #[test]
    fn sleep_resumes_fiber_with_nil_after_expiry() {
        let loop_ = new_loop();
        let got = StdRc::new(StdRefCell::new(None));
        let got2 = got.clone();
        let fiber = FiberBuilder::new().spawn(move |_f, v| {
            *got2.borrow_mut() = Some(v);
            SignalResult::ok(Value::Nil)
        });
        loop_.sleep(&fiber, 0.0);
        // force expiry regardless of real elapsed time by expiring at a
        // virtual "now" far in the future
        std::thread::sleep(Duration::from_millis(5));
        loop_.expire_timers();
        let vm = Vm::new(VmConfig::default());
        loop_.drain_tasks(&vm);
        assert!(matches!(*got.borrow(), Some(Value::Nil)));
    }

    #[test]
    fn stale_timeout_after_cancel_is_ignored() {
        let loop_ = new_loop();
        let fiber = FiberBuilder::new().spawn(|_f, v| SignalResult::ok(v));
        loop_.sleep(&fiber, 10.0); // captures current sched_id
        loop_.cancel(fiber.clone(), Value::Nil); // bumps sched_id, schedules error resume
        let vm = Vm::new(VmConfig::default());
        loop_.drain_tasks(&vm);
        assert_eq!(fiber.status(), crate::fiber::FiberStatus::Error);
    }

    #[test]
    fn deadline_cancels_only_if_target_unfinished() {
        let loop_ = new_loop();
        let finished = FiberBuilder::new().spawn(|_f, v| SignalResult::ok(v));
        let vm = Vm::new(VmConfig::default());
        loop_.schedule(finished.clone(), Value::Nil, Signal::Ok);
        loop_.drain_tasks(&vm);
        assert!(finished.status().is_terminal());

        let watched = FiberBuilder::new().spawn(|_f, _v| SignalResult {
            signal: Signal::Event,
            value: Value::Nil,
        });
        loop_.schedule(watched.clone(), Value::Nil, Signal::Ok);
        loop_.drain_tasks(&vm);
        assert!(!watched.status().is_terminal());

        let to_cancel = FiberBuilder::new().spawn(|_f, v| SignalResult::ok(v));
        loop_.deadline(&to_cancel, 0.0, &watched);
        std::thread::sleep(Duration::from_millis(5));
        loop_.expire_timers();
        loop_.drain_tasks(&vm);
        assert_eq!(to_cancel.status(), crate::fiber::FiberStatus::Error);
    }

    #[test]
    fn interrupt_signal_is_returned_to_the_caller_instead_of_auto_rescheduled() {
        let loop_ = new_loop();
        let fiber = FiberBuilder::new().spawn(|_f, _v| SignalResult {
            signal: Signal::Interrupt,
            value: Value::Nil,
        });
        loop_.schedule(fiber.clone(), Value::Nil, Signal::Ok);
        let vm = Vm::new(VmConfig::default());
        let interrupted = loop_.drain_tasks(&vm);
        assert_eq!(interrupted.len(), 1);
        assert!(interrupted[0].ptr_eq(&fiber));
        // left resumable, not auto-rescheduled onto the task queue again
        assert_eq!(fiber.status(), crate::fiber::FiberStatus::Pending);
        assert!(!fiber.is_scheduled());
    }

    #[test]
    fn threaded_call_resumes_with_decoded_result() {
        let loop_ = new_loop();
        let got = StdRc::new(StdRefCell::new(None));
        let got2 = got.clone();
        let fiber = FiberBuilder::new().spawn(move |_f, v| {
            *got2.borrow_mut() = Some(v);
            SignalResult::ok(Value::Nil)
        });
        loop_.threaded_call(&fiber, || {
            std::thread::sleep(Duration::from_millis(2));
            ThreadResult::Int(7)
        });
        let vm = Vm::new(VmConfig::default());
        // poll_once blocks up to max_poll (50ms), long enough for the
        // worker thread above to finish and push its result.
        loop_.poll_once().unwrap();
        loop_.drain_thread_results();
        loop_.drain_tasks(&vm);
        assert!(matches!(*got.borrow(), Some(Value::Number(n)) if n == 7.0));
    }
}
