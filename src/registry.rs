//! Glue: the polymorphic abstract-type vtable, the C-function registry, and
//! the value<->symbol registry consulted by `registry-ref` marshaling
//! (spec §4.5, §9 "Polymorphic abstract types").
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::value::{AbstractObj, Value};
use crate::vm::Vm;

/// Identifies an abstract type by its registered name. Interned as an
/// `Rc<str>` so cloning a [`Value::Abstract`] never allocates.
#[derive(Clone)]
pub struct AbstractTypeId(pub Rc<str>);

impl AbstractTypeId {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AbstractTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for AbstractTypeId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for AbstractTypeId {}

/// Dispatch table for one abstract type, named after the entries listed in
/// §9: `mark`, `gc`, `tostring`, `get`, `put`, `marshal`, `unmarshal`,
/// `compare`, `hash`, `next`, `call`. Every slot is optional; a type which
/// doesn't implement an operation simply leaves it `None` and callers fall
/// back to a type-error.
pub struct AbstractVtable {
    pub type_id: AbstractTypeId,
    pub mark: Option<fn(&AbstractObj, &Heap)>,
    pub gc: Option<fn(&AbstractObj)>,
    pub tostring: Option<fn(&AbstractObj) -> String>,
    pub get: Option<fn(&AbstractObj, &Value) -> Option<Value>>,
    pub put: Option<fn(&AbstractObj, Value, Value) -> Result<()>>,
    pub marshal: Option<fn(&AbstractObj, &mut Vec<u8>) -> Result<()>>,
    pub unmarshal: Option<fn(&[u8]) -> Result<(Box<dyn std::any::Any>, usize)>>,
    pub compare: Option<fn(&AbstractObj, &AbstractObj) -> std::cmp::Ordering>,
    pub hash: Option<fn(&AbstractObj) -> u64>,
    pub call: Option<fn(&mut Vm, &AbstractObj, &[Value]) -> Result<Value>>,
}

/// Maps type names to vtables. Populated by host collaborators before any
/// value of that type is created or unmarshaled.
#[derive(Default)]
pub struct AbstractTypeRegistry {
    types: RefCell<HashMap<String, Rc<AbstractVtable>>>,
}

impl AbstractTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, vtable: AbstractVtable) {
        let name = vtable.type_id.name().to_owned();
        self.types.borrow_mut().insert(name, Rc::new(vtable));
    }

    pub fn lookup(&self, name: &str) -> Option<Rc<AbstractVtable>> {
        self.types.borrow().get(name).cloned()
    }
}

/// A foreign (host-provided) callable. `Value::CFunction` carries an `Rc`
/// to one of these so cloning a value never re-boxes the closure.
pub struct CFunction {
    pub name: String,
    pub func: Box<dyn Fn(&mut Vm, &[Value]) -> Result<Value>>,
}

impl fmt::Debug for CFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<cfunction {}>", self.name)
    }
}

/// Caller-provided reverse lookup (value -> symbolic name) used to shortcut
/// C-functions and known abstract types into the `registry-ref` lead byte
/// during marshaling (§4.5), plus the forward direction used on unmarshal.
#[derive(Default)]
pub struct Registry {
    forward: RefCell<HashMap<String, Value>>,
    /// Reverse map keyed by identity (pointer address of the underlying Rc
    /// allocation), since `Value` itself isn't `Hash` in a way that's
    /// meaningful across all variants for this purpose.
    reverse: RefCell<HashMap<usize, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(addr) = identity_addr(&value) {
            self.reverse.borrow_mut().insert(addr, name.clone());
        }
        self.forward.borrow_mut().insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.forward.borrow().get(name).cloned()
    }

    pub fn name_of(&self, value: &Value) -> Option<String> {
        identity_addr(value).and_then(|addr| self.reverse.borrow().get(&addr).cloned())
    }

    pub fn require(&self, name: &str) -> Result<Value> {
        self.get(name)
            .ok_or_else(|| Error::Protocol(format!("unregistered reference: {name}")))
    }
}

fn identity_addr(value: &Value) -> Option<usize> {
    match value {
        Value::CFunction(c) => Some(Rc::as_ptr(c) as usize),
        Value::Abstract(a) => Some(Rc::as_ptr(a) as usize),
        Value::Function(f) => Some(Rc::as_ptr(f) as usize),
        _ => None,
    }
}
