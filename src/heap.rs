//! Mark-and-sweep heap (spec §3 "Garbage collector").
//!
//! Every allocation that owns a [`crate::value::GcHeader`] gets registered
//! here via [`Heap::track`]; the heap then holds one extra strong `Rc` per
//! live allocation, standing in for an intrusive linked list of all
//! objects — `sweep` drops that `Rc` for anything left unreachable, which
//! is what actually frees the allocation (barring any other strong
//! references a host still holds, which is the escape hatch that keeps
//! cyclic object graphs safe to build without a cycle detector).
//!
//! `Value::Fiber` and `Value::CFunction` are deliberately not tracked here:
//! fiber lifetime is owned by the scheduler that created them and
//! C-functions are normally `'static` registry entries, so neither needs
//! collecting the way heap-allocated strings/arrays/tables do.
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::registry::AbstractTypeRegistry;
use crate::value::Value;

pub mod scratch;
pub use scratch::Scratch;

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub live_objects: usize,
    pub collections: u64,
    pub last_swept: usize,
}

/// Tunables read once at [`Heap::new`]; nothing here is re-read from the
/// process environment.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    /// Bytes of estimated allocation pressure between automatic
    /// collections. Defaults to 4 KiB.
    pub pressure_interval: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            pressure_interval: 4096,
        }
    }
}

pub struct Heap {
    objects: RefCell<Vec<Value>>,
    roots: RefCell<Vec<Value>>,
    worklist: RefCell<Vec<Value>>,
    lock_depth: Cell<u32>,
    bytes_since_collect: Cell<usize>,
    config: HeapConfig,
    stats: Cell<HeapStats>,
    abstract_types: Rc<AbstractTypeRegistry>,
    scratch: Scratch,
    /// Fibers have no `GcHeader` (tracked by `hash_key()` instead), so their
    /// "already marked" bit can't live in `set_reachable`'s header dance;
    /// this is that bit, scoped to one `collect()` pass.
    visited_fibers: RefCell<std::collections::HashSet<usize>>,
}

impl Heap {
    pub fn new(config: HeapConfig, abstract_types: Rc<AbstractTypeRegistry>) -> Self {
        Heap {
            objects: RefCell::new(Vec::new()),
            roots: RefCell::new(Vec::new()),
            worklist: RefCell::new(Vec::new()),
            lock_depth: Cell::new(0),
            bytes_since_collect: Cell::new(0),
            config,
            stats: Cell::new(HeapStats::default()),
            abstract_types,
            scratch: Scratch::new(),
            visited_fibers: RefCell::new(std::collections::HashSet::new()),
        }
    }

    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = self.stats.get();
        stats.live_objects = self.objects.borrow().len();
        stats
    }

    /// Register a freshly allocated heap object so the collector knows
    /// about it, and charge its estimated size against the collection
    /// pressure counter, running an automatic collection if the interval
    /// has been exceeded and the heap isn't locked.
    pub fn track(&self, value: Value, estimated_size: usize) {
        self.objects.borrow_mut().push(value);
        let pending = self.bytes_since_collect.get() + estimated_size;
        if pending >= self.config.pressure_interval {
            self.bytes_since_collect.set(0);
            self.maybe_collect();
        } else {
            self.bytes_since_collect.set(pending);
        }
    }

    pub fn gcroot(&self, value: Value) {
        self.roots.borrow_mut().push(value);
    }

    pub fn gcunroot(&self, value: &Value) {
        let mut roots = self.roots.borrow_mut();
        if let Some(pos) = roots.iter().position(|v| crate::value::identical(v, value)) {
            roots.remove(pos);
        }
    }

    pub fn gcunrootall(&self) {
        self.roots.borrow_mut().clear();
    }

    /// Increments the reentrant disable counter; while nonzero, automatic
    /// (pressure-triggered) collections are skipped. An explicit
    /// [`Heap::collect`] call still runs regardless, matching the source's
    /// "lock only blocks the *implicit* collector" behavior.
    pub fn gclock(&self) {
        self.lock_depth.set(self.lock_depth.get() + 1);
    }

    pub fn gcunlock(&self) {
        self.lock_depth.set(self.lock_depth.get().saturating_sub(1));
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth.get() > 0
    }

    fn maybe_collect(&self) {
        if !self.is_locked() {
            self.collect();
        }
    }

    /// Mark reachable objects and drop the rest. Exposed publicly so an
    /// [`AbstractVtable`](crate::registry::AbstractVtable)'s `mark`
    /// callback can recurse into its own children during this same pass.
    pub fn mark_reachable(&self, value: &Value) {
        if let Value::Fiber(f) = value {
            if !self.visited_fibers.borrow_mut().insert(f.hash_key()) {
                return;
            }
            self.worklist.borrow_mut().push(value.clone());
            return;
        }
        let already = match set_reachable(value, true) {
            Some(was) => was,
            None => return,
        };
        if already {
            return;
        }
        self.worklist.borrow_mut().push(value.clone());
    }

    pub fn collect(&self) -> HeapStats {
        self.visited_fibers.borrow_mut().clear();
        {
            let roots = self.roots.borrow();
            for root in roots.iter() {
                self.mark_reachable(root);
            }
        }
        loop {
            let next = self.worklist.borrow_mut().pop();
            match next {
                Some(value) => self.mark_children(&value),
                None => break,
            }
        }
        let swept = self.sweep();
        let mut stats = self.stats.get();
        stats.collections += 1;
        stats.last_swept = swept;
        stats.live_objects = self.objects.borrow().len();
        self.stats.set(stats);
        stats
    }

    fn mark_children(&self, value: &Value) {
        match value {
            Value::Array(a) => {
                for item in a.borrow().items.iter() {
                    self.mark_reachable(item);
                }
            }
            Value::Tuple(t) => {
                for item in t.items.iter() {
                    self.mark_reachable(item);
                }
            }
            Value::Table(t) => {
                let t = t.borrow();
                for (k, v) in t.entries.iter() {
                    self.mark_reachable(k);
                    self.mark_reachable(v);
                }
                if let Some(proto) = &t.prototype {
                    self.mark_reachable(proto);
                }
            }
            Value::Struct(s) => {
                for (k, v) in s.entries.iter() {
                    self.mark_reachable(k);
                    self.mark_reachable(v);
                }
                if let Some(proto) = &s.prototype {
                    self.mark_reachable(&Value::Struct(proto.clone()));
                }
            }
            Value::Function(f) => {
                self.mark_funcdef(&f.def);
                for env in f.envs.iter() {
                    let env = env.borrow();
                    for i in 0..env.len() {
                        self.mark_reachable(&env.get(i));
                    }
                }
            }
            Value::Abstract(a) => {
                if let Some(vtable) = self.abstract_types.lookup(a.type_id.name()) {
                    if let Some(mark_fn) = vtable.mark {
                        mark_fn(a, self);
                    }
                }
            }
            // A fiber has no header of its own; its stack slots and each
            // frame's function are what actually need marking.
            Value::Fiber(f) => {
                for i in 0..f.stack_len() {
                    self.mark_reachable(&f.stack_get(i));
                }
                for i in 0..f.frame_depth() {
                    self.mark_reachable(&Value::Function(f.frame_at(i).function));
                }
            }
            // Buffer, String, Symbol, Keyword carry no Value children.
            _ => {}
        }
    }

    /// Constants embedded in a function's bytecode can themselves be
    /// tables, tuples, nested function templates, etc.; walk the whole
    /// `FuncDef` tree since it's finite and shared, not per-instance.
    fn mark_funcdef(&self, def: &Rc<crate::funcdef::FuncDef>) {
        for constant in def.constants.iter() {
            self.mark_reachable(constant);
        }
        for sub in def.sub_defs.iter() {
            self.mark_funcdef(sub);
        }
    }

    fn sweep(&self) -> usize {
        let mut objects = self.objects.borrow_mut();
        let before = objects.len();
        objects.retain(|value| {
            let keep = get_reachable(value).expect("only headered values are tracked");
            if keep {
                set_reachable(value, false);
            } else {
                self.deinit(value);
            }
            keep
        });
        before - objects.len()
    }

    fn deinit(&self, value: &Value) {
        if let Value::Abstract(a) = value {
            if let Some(vtable) = self.abstract_types.lookup(a.type_id.name()) {
                if let Some(gc_fn) = vtable.gc {
                    gc_fn(a);
                }
            }
        }
    }
}

/// Reads the current reachable bit for any headered value, returning the
/// *previous* value. Handles `Buffer`/`Array`/`Table` specially since their
/// header lives behind a `RefCell` and can't be handed out as a reference.
fn get_reachable(value: &Value) -> Option<bool> {
    Some(match value {
        Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => s.header.reachable.get(),
        Value::Buffer(b) => b.borrow().header.reachable.get(),
        Value::Array(a) => a.borrow().header.reachable.get(),
        Value::Table(t) => t.borrow().header.reachable.get(),
        Value::Tuple(t) => t.header.reachable.get(),
        Value::Struct(s) => s.header.reachable.get(),
        Value::Function(f) => f.header.reachable.get(),
        Value::Abstract(a) => a.header.reachable.get(),
        _ => return None,
    })
}

/// Sets the reachable bit, returning the previous value (or `None` for
/// values with no header, e.g. `Nil`/`Number`/`Fiber`/`CFunction`).
fn set_reachable(value: &Value, reachable: bool) -> Option<bool> {
    Some(match value {
        Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => {
            s.header.reachable.replace(reachable)
        }
        Value::Buffer(b) => b.borrow().header.reachable.replace(reachable),
        Value::Array(a) => a.borrow().header.reachable.replace(reachable),
        Value::Table(t) => t.borrow().header.reachable.replace(reachable),
        Value::Tuple(t) => t.header.reachable.replace(reachable),
        Value::Struct(s) => s.header.reachable.replace(reachable),
        Value::Function(f) => f.header.reachable.replace(reachable),
        Value::Abstract(a) => a.header.reachable.replace(reachable),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{int_value, LString};
    use std::rc::Rc;

    fn test_heap() -> Heap {
        Heap::new(HeapConfig::default(), Rc::new(AbstractTypeRegistry::new()))
    }

    #[test]
    fn unrooted_string_is_collected() {
        let heap = test_heap();
        let s = Value::String(LString::new(b"hello".to_vec()));
        heap.track(s, 5);
        assert_eq!(heap.stats().live_objects, 1);
        heap.collect();
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn rooted_string_survives_collection() {
        let heap = test_heap();
        let s = Value::String(LString::new(b"hello".to_vec()));
        heap.track(s.clone(), 5);
        heap.gcroot(s.clone());
        heap.collect();
        assert_eq!(heap.stats().live_objects, 1);
        heap.gcunroot(&s);
        heap.collect();
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn locked_heap_skips_automatic_collection() {
        let heap = Heap::new(
            HeapConfig { pressure_interval: 1 },
            Rc::new(AbstractTypeRegistry::new()),
        );
        heap.gclock();
        let s = Value::String(LString::new(b"x".to_vec()));
        heap.track(s, 100);
        assert_eq!(heap.stats().live_objects, 1);
        heap.gcunlock();
        heap.collect();
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn numeric_values_have_no_header_and_are_ignored() {
        let heap = test_heap();
        assert!(get_reachable(&int_value(3)).is_none());
    }
}
