//! The `Vm`: bundles a [`Heap`], the abstract-type/C-function/value
//! registries, and the scheduler's ready queue behind one handle threaded
//! through every operation, resolving spec §9's "Global VM state" open
//! question in favor of an explicit context object rather than thread-local
//! globals (there is exactly one VM per OS thread in this model anyway,
//! since `Value` can't cross threads, but an explicit handle keeps
//! multiple independent VMs in the same process possible and keeps every
//! call site honest about what state it touches).
use std::rc::Rc;

use crate::error::{Error, Fatal, Result};
use crate::ev;
use crate::fiber::ReadyQueue;
use crate::heap::{Heap, HeapConfig};
use crate::registry::{AbstractTypeRegistry, Registry};

/// Tunables read once when a [`Vm`] is constructed. Never re-read from the
/// process environment by this crate (spec §6); a host that wants
/// environment-driven configuration reads the variables itself and passes
/// the result in here.
#[derive(Clone)]
pub struct VmConfig {
    pub heap: HeapConfig,
    /// Growth factor applied to a fiber's value stack when it needs to
    /// grow past its current capacity.
    pub stack_growth_factor: f64,
    /// Default capacity for channels created without an explicit one.
    pub default_channel_capacity: usize,
    /// Overrides automatic backend selection in `ev` (epoll/kqueue/IOCP);
    /// `None` picks the platform default.
    pub poll_backend_override: Option<&'static str>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            heap: HeapConfig::default(),
            stack_growth_factor: 1.5,
            default_channel_capacity: 0,
            poll_backend_override: None,
        }
    }
}

pub type FatalHook = Box<dyn Fn(&Fatal)>;

fn default_fatal_hook(fatal: &Fatal) {
    crate::log::guard_against_reentrant_fatal(|| {
        crate::rt_fatal!("{fatal}");
    });
    std::process::abort();
}

/// Sink for an uncaught error surfacing from a fiber with no supervisor
/// channel (spec §4.3 main loop step 2, "emit a stack trace via the
/// configured error sink"). Default logs at [`crate::log::RuntimeLevel::Error`].
pub type ErrorSink = Box<dyn Fn(Option<&str>, &crate::value::Value)>;

fn default_error_sink(fiber_name: Option<&str>, value: &crate::value::Value) {
    crate::rt_error!("uncaught error in fiber {:?}: {:?}", fiber_name.unwrap_or("?"), value);
}

pub struct Vm {
    pub config: VmConfig,
    pub heap: Heap,
    pub abstract_types: Rc<AbstractTypeRegistry>,
    pub registry: Registry,
    pub ready: ReadyQueue,
    /// The event loop backing every `ev/*` operation for this VM (spec §4.3).
    /// One per `Vm`, matching this module's "exactly one VM per OS thread"
    /// design note: a `Loop`'s poll backend owns raw OS resources (an epoll
    /// fd, a kqueue, an IOCP) that are never shared across VMs.
    pub ev: ev::Loop,
    fatal_hook: FatalHook,
    error_sink: ErrorSink,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let abstract_types = Rc::new(AbstractTypeRegistry::new());
        let heap = Heap::new(config.heap, abstract_types.clone());
        let backend = ev::new_backend(config.poll_backend_override)
            .unwrap_or_else(|_| Box::new(ev::TestBackend::new()) as Box<dyn ev::PollBackend>);
        let registry = Registry::new();
        crate::ev::channel::register_abstract_type(&abstract_types);
        Vm {
            config,
            heap,
            abstract_types,
            registry,
            ready: ReadyQueue::new(),
            ev: ev::Loop::new(backend),
            fatal_hook: Box::new(default_fatal_hook),
            error_sink: Box::new(default_error_sink),
        }
    }

    /// Run this VM's event loop until it becomes idle (spec §4.3's exit
    /// condition): no scheduled tasks, no pending timeouts, no registered
    /// streams, and no external reference holding it open. Returns any
    /// fibers that signaled `Signal::Interrupt` along the way (see
    /// [`ev::Loop::run`]) for the embedder to re-schedule explicitly.
    pub fn run(&self) -> Vec<crate::fiber::FiberHandle> {
        self.ev.run(self)
    }

    /// Install a custom sink for uncaught errors from supervisor-less
    /// fibers (spec §4.3 main loop step 2). The default logs via
    /// [`crate::log`] at error level and returns normally; replacing it
    /// never changes whether the erroring fiber itself is recoverable, only
    /// where the report goes.
    pub fn set_error_sink(&mut self, sink: impl Fn(Option<&str>, &crate::value::Value) + 'static) {
        self.error_sink = Box::new(sink);
    }

    pub fn report_uncaught_error(&self, fiber_name: Option<&str>, value: &crate::value::Value) {
        (self.error_sink)(fiber_name, value);
    }

    /// Install a custom hook for the non-recoverable error taxonomy (spec
    /// §7): out-of-memory, assertion failures, and bytecode that fails the
    /// unmarshal verifier. The default hook logs and aborts the process;
    /// an embedder that wants to unwind a whole request instead of the
    /// whole process can replace it, but cannot make the triggering
    /// operation itself succeed.
    pub fn set_fatal_hook(&mut self, hook: impl Fn(&Fatal) + 'static) {
        self.fatal_hook = Box::new(hook);
    }

    /// Report a fatal condition and never return: the hook either aborts
    /// the process itself or this function does it for the hook.
    pub fn fatal(&self, fatal: Fatal) -> ! {
        (self.fatal_hook)(&fatal);
        std::process::abort();
    }

    pub fn require(&self, name: &str) -> Result<crate::value::Value> {
        self.registry.require(name)
    }

    pub fn protocol_error(&self, msg: impl Into<String>) -> Error {
        Error::protocol(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn default_config_has_sane_stack_growth() {
        let vm = Vm::new(VmConfig::default());
        assert!(vm.config.stack_growth_factor > 1.0);
    }

    #[test]
    fn custom_fatal_hook_is_invoked_before_abort() {
        // `Vm::fatal` always aborts the process after running the hook, so
        // we can't call it here; exercise the hook directly instead.
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let mut vm = Vm::new(VmConfig::default());
        vm.set_fatal_hook(move |_| ran2.set(true));
        (vm.fatal_hook)(&Fatal::OutOfMemory);
        assert!(ran.get());
    }
}
