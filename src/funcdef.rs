//! `FuncDef` (immutable bytecode function metadata) and `FuncEnv` (closure
//! environments, on-stack or detached).
use std::rc::Rc;

use crate::fiber::FiberHandle;
use crate::value::Value;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct FuncFlags: u32 {
        const VARIADIC   = 1 << 0;
        const HAS_ENVS   = 1 << 1;
        const NEEDS_ENV  = 1 << 2;
        const NAMED      = 1 << 3;
        const STRUCT_ARG = 1 << 4;
    }
}

/// `birth_pc..death_pc` is the instruction range a local is live for; used
/// by debuggers/printers external to this crate but threaded through here
/// because it's part of `FuncDef`'s on-disk shape (§3, §4.5 lead byte 215).
#[derive(Debug, Clone)]
pub struct SymbolMapEntry {
    pub birth_pc: u32,
    pub death_pc: u32,
    pub slot: u32,
    pub symbol: Rc<crate::value::LString>,
}

#[derive(Debug, Clone, Copy)]
pub struct SourceMapEntry {
    pub line: u32,
    pub column: u32,
}

/// One environment slot a `FuncDef` may capture from its defining scope:
/// `parent_index` selects which of the *defining* function's envs (or its
/// own stack frame, when `None`) the nested function should capture.
#[derive(Debug, Clone, Copy)]
pub struct EnvDescriptor {
    pub parent_index: Option<u32>,
}

/// Immutable metadata describing one bytecode function. Everything here is
/// produced by the (out-of-scope) compiler; this crate only needs to be
/// able to hold, mark, and marshal it.
#[derive(Debug)]
pub struct FuncDef {
    pub flags: FuncFlags,
    pub slot_count: u32,
    pub min_arity: u32,
    pub max_arity: u32,
    pub constants: Vec<Value>,
    pub sub_defs: Vec<Rc<FuncDef>>,
    pub envs: Vec<EnvDescriptor>,
    pub bytecode: Vec<u32>,
    pub source_map: Option<Vec<SourceMapEntry>>,
    pub symbol_map: Option<Vec<SymbolMapEntry>>,
    /// `closure_bits[slot]` is `true` iff some nested function captures
    /// that slot; the interpreter (out of scope here) uses this to decide
    /// whether a slot must live in a heap-backed cell.
    pub closure_bits: Option<Vec<bool>>,
    pub name: Option<String>,
    pub source: Option<String>,
}

impl FuncDef {
    pub fn is_variadic(&self) -> bool {
        self.flags.contains(FuncFlags::VARIADIC)
    }

    pub fn arity_ok(&self, argc: usize) -> bool {
        let argc = argc as u32;
        if self.is_variadic() {
            argc >= self.min_arity
        } else {
            argc >= self.min_arity && argc <= self.max_arity
        }
    }
}

/// A closure environment. Either a live window into a fiber's value stack
/// (`OnStack`) or a private owned array (`Detached`). §3: an on-stack
/// environment must be detached before its owning fiber is destroyed or
/// serialized.
#[derive(Debug)]
pub enum FuncEnv {
    OnStack {
        fiber: FiberHandle,
        offset: usize,
        len: usize,
    },
    Detached {
        values: Vec<Value>,
    },
}

impl FuncEnv {
    pub fn len(&self) -> usize {
        match self {
            FuncEnv::OnStack { len, .. } => *len,
            FuncEnv::Detached { values } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Value {
        match self {
            FuncEnv::OnStack { fiber, offset, .. } => fiber.stack_get(offset + index),
            FuncEnv::Detached { values } => values[index].clone(),
        }
    }

    pub fn set(&mut self, index: usize, value: Value) {
        match self {
            FuncEnv::OnStack { fiber, offset, .. } => fiber.stack_set(*offset + index, value),
            FuncEnv::Detached { values } => values[index] = value,
        }
    }

    /// Copy the on-stack window into an owned array. No-op for an
    /// already-detached env. Called before a fiber is dropped or marshaled
    /// (§3, §4.5 "Fiber serialization").
    pub fn detach(&mut self) {
        if let FuncEnv::OnStack { fiber, offset, len } = self {
            let values = (0..*len).map(|i| fiber.stack_get(*offset + i)).collect();
            *self = FuncEnv::Detached { values };
        }
    }

    pub fn is_on_stack(&self) -> bool {
        matches!(self, FuncEnv::OnStack { .. })
    }
}
