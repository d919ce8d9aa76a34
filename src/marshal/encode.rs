//! Writer half of the marshal codec. [`Marshaler`] carries the reference
//! table (shared across every reference-typed value in one [`marshal`]
//! call) plus the separate funcenv/funcdef intern tables, in the shape of
//! a stateful writer you push values through rather than a one-shot
//! recursive serializer.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::fiber::{FiberFlags, FiberHandle, FiberStatus};
use crate::funcdef::{FuncDef, FuncEnv, SourceMapEntry, SymbolMapEntry};
use crate::registry::{AbstractTypeRegistry, Registry};
use crate::value::{AbstractObj, ArrayObj, BufferObj, FunctionObj, LString, StructObj, TableObj, TupleObj, Value, WeakMode};

use super::lead;
use super::varint::{write_count, write_ifield};
use super::{MarshalFlags, MAX_DEPTH};

/// Marshal `value` to the end of `buf`. `registry`, when given, shortcuts
/// any C-function or abstract value it recognizes into a `registry-ref`
/// lead byte instead of a full body. `abstract_types` resolves an
/// abstract's own `marshal` vtable hook; an abstract with no registry
/// entry and no such hook cannot be marshaled.
pub fn marshal(
    buf: &mut Vec<u8>,
    value: &Value,
    registry: Option<&Registry>,
    abstract_types: Option<&AbstractTypeRegistry>,
    flags: MarshalFlags,
) -> Result<()> {
    let mut m = Marshaler::new(registry, abstract_types, flags);
    m.write_value(buf, value, 0)
}

struct Marshaler<'a> {
    registry: Option<&'a Registry>,
    abstract_types: Option<&'a AbstractTypeRegistry>,
    flags: MarshalFlags,
    seen: HashMap<usize, u32>,
    next_ref: u32,
    funcdefs: HashMap<usize, u32>,
    next_funcdef: u32,
    funcenvs: HashMap<usize, u32>,
    next_funcenv: u32,
}

impl<'a> Marshaler<'a> {
    fn new(registry: Option<&'a Registry>, abstract_types: Option<&'a AbstractTypeRegistry>, flags: MarshalFlags) -> Self {
        Marshaler {
            registry,
            abstract_types,
            flags,
            seen: HashMap::new(),
            next_ref: 0,
            funcdefs: HashMap::new(),
            next_funcdef: 0,
            funcenvs: HashMap::new(),
            next_funcenv: 0,
        }
    }

    fn cycles_tracked(&self) -> bool {
        !self.flags.contains(MarshalFlags::NO_CYCLES)
    }

    /// `true` if a `reference` byte was already written for `identity` (the
    /// caller should stop, having emitted nothing else). Memoization is a
    /// no-op under `NO_CYCLES`.
    fn check_seen(&mut self, identity: usize, buf: &mut Vec<u8>) -> bool {
        if !self.cycles_tracked() {
            return false;
        }
        if let Some(&id) = self.seen.get(&identity) {
            buf.push(lead::REFERENCE);
            write_count(buf, id as u64);
            true
        } else {
            false
        }
    }

    fn register_seen(&mut self, identity: usize) {
        if self.cycles_tracked() {
            let id = self.next_ref;
            self.next_ref += 1;
            self.seen.insert(identity, id);
        }
    }

    fn require_unsafe(&self) -> Result<()> {
        if self.flags.contains(MarshalFlags::UNSAFE) {
            Ok(())
        } else {
            Err(Error::protocol("UNSAFE flag required to marshal this value"))
        }
    }

    fn write_value(&mut self, buf: &mut Vec<u8>, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("marshal recursion too deep"));
        }
        match value {
            Value::Nil => buf.push(lead::NIL),
            Value::Bool(false) => buf.push(lead::FALSE),
            Value::Bool(true) => buf.push(lead::TRUE),
            Value::Number(n) => {
                let as_i32 = *n as i32;
                if (as_i32 as f64) == *n {
                    self.write_int_value(buf, as_i32);
                } else {
                    buf.push(lead::REAL);
                    buf.extend_from_slice(&n.to_le_bytes());
                }
            }
            Value::Int(i) => self.write_int_value(buf, *i),
            Value::Pointer(p) => {
                self.require_unsafe()?;
                buf.push(lead::UNSAFE_POINTER);
                buf.extend_from_slice(&(*p as u64).to_le_bytes());
            }
            Value::String(s) => self.write_lstring(buf, s, lead::STRING),
            Value::Symbol(s) => self.write_lstring(buf, s, lead::SYMBOL),
            Value::Keyword(s) => self.write_lstring(buf, s, lead::KEYWORD),
            Value::Buffer(b) => self.write_buffer(buf, b),
            Value::Array(a) => self.write_array(buf, a, depth)?,
            Value::Tuple(t) => self.write_tuple(buf, t, depth)?,
            Value::Table(t) => self.write_table(buf, t, depth)?,
            Value::Struct(s) => self.write_struct(buf, s, depth)?,
            Value::Function(f) => self.write_function(buf, f, depth)?,
            Value::Fiber(f) => self.write_fiber(buf, f, depth)?,
            Value::Abstract(a) => self.write_abstract(buf, value, a, depth)?,
            Value::CFunction(c) => self.write_cfunction(buf, value, c)?,
        }
        Ok(())
    }

    fn write_int_value(&self, buf: &mut Vec<u8>, v: i32) {
        if (0..=199).contains(&v) {
            buf.push(v as u8);
        } else {
            buf.push(lead::LONG_INT);
            buf.extend_from_slice(&v.to_be_bytes());
        }
    }

    fn write_lstring(&mut self, buf: &mut Vec<u8>, s: &Rc<LString>, tag: u8) {
        let identity = Rc::as_ptr(s) as usize;
        if self.check_seen(identity, buf) {
            return;
        }
        self.register_seen(identity);
        buf.push(tag);
        write_count(buf, s.bytes.len() as u64);
        buf.extend_from_slice(&s.bytes);
    }

    fn write_buffer(&mut self, buf: &mut Vec<u8>, b: &Rc<RefCell<BufferObj>>) {
        let identity = Rc::as_ptr(b) as usize;
        if self.check_seen(identity, buf) {
            return;
        }
        self.register_seen(identity);
        let bytes = b.borrow().bytes.clone();
        buf.push(lead::BUFFER);
        write_count(buf, bytes.len() as u64);
        buf.extend_from_slice(&bytes);
    }

    fn write_array(&mut self, buf: &mut Vec<u8>, a: &Rc<RefCell<ArrayObj>>, depth: usize) -> Result<()> {
        let identity = Rc::as_ptr(a) as usize;
        if self.check_seen(identity, buf) {
            return Ok(());
        }
        self.register_seen(identity);
        let items = a.borrow().items.clone();
        buf.push(lead::ARRAY);
        write_count(buf, items.len() as u64);
        for item in items.iter() {
            self.write_value(buf, item, depth + 1)?;
        }
        Ok(())
    }

    /// Tuples memoize *after* their children, which is what makes a cycle
    /// through a tuple impossible by construction: nothing
    /// inside it can reference the tuple itself until it's fully written.
    fn write_tuple(&mut self, buf: &mut Vec<u8>, t: &Rc<TupleObj>, depth: usize) -> Result<()> {
        let identity = Rc::as_ptr(t) as usize;
        if self.check_seen(identity, buf) {
            return Ok(());
        }
        buf.push(lead::TUPLE);
        write_count(buf, t.items.len() as u64);
        write_ifield(buf, t.source_flag as i64);
        for item in t.items.iter() {
            self.write_value(buf, item, depth + 1)?;
        }
        self.register_seen(identity);
        Ok(())
    }

    fn write_table(&mut self, buf: &mut Vec<u8>, t: &Rc<RefCell<TableObj>>, depth: usize) -> Result<()> {
        let identity = Rc::as_ptr(t) as usize;
        if self.check_seen(identity, buf) {
            return Ok(());
        }
        self.register_seen(identity);
        let (entries, prototype, weak) = {
            let t = t.borrow();
            (t.entries.clone(), t.prototype.clone(), t.weak)
        };
        let has_proto = prototype.is_some();
        let tag = match (weak, has_proto) {
            (WeakMode::None, false) => lead::TABLE,
            (WeakMode::None, true) => lead::TABLE_PROTO,
            (WeakMode::Key, false) => lead::WEAK_TABLE_KEY,
            (WeakMode::Value, false) => lead::WEAK_TABLE_VALUE,
            (WeakMode::KeyValue, false) => lead::WEAK_TABLE_KEY_VALUE,
            (WeakMode::Key, true) => lead::WEAK_TABLE_PROTO_KEY,
            (WeakMode::Value, true) => lead::WEAK_TABLE_PROTO_VALUE,
            (WeakMode::KeyValue, true) => lead::WEAK_TABLE_PROTO_KEY_VALUE,
        };
        buf.push(tag);
        if let Some(proto) = &prototype {
            self.write_value(buf, proto, depth + 1)?;
        }
        write_count(buf, entries.len() as u64);
        for (k, v) in entries.iter() {
            self.write_value(buf, k, depth + 1)?;
            self.write_value(buf, v, depth + 1)?;
        }
        Ok(())
    }

    fn write_struct(&mut self, buf: &mut Vec<u8>, s: &Rc<StructObj>, depth: usize) -> Result<()> {
        let identity = Rc::as_ptr(s) as usize;
        if self.check_seen(identity, buf) {
            return Ok(());
        }
        let tag = if s.prototype.is_some() { lead::STRUCT_PROTO } else { lead::STRUCT };
        buf.push(tag);
        if let Some(proto) = &s.prototype {
            self.write_struct(buf, proto, depth + 1)?;
        }
        write_count(buf, s.entries.len() as u64);
        for (k, v) in s.entries.iter() {
            self.write_value(buf, k, depth + 1)?;
            self.write_value(buf, v, depth + 1)?;
        }
        self.register_seen(identity);
        Ok(())
    }

    fn write_function(&mut self, buf: &mut Vec<u8>, f: &Rc<FunctionObj>, depth: usize) -> Result<()> {
        let identity = Rc::as_ptr(f) as usize;
        if self.check_seen(identity, buf) {
            return Ok(());
        }
        self.register_seen(identity);
        buf.push(lead::FUNCTION);
        write_count(buf, f.envs.len() as u64);
        self.write_funcdef(buf, &f.def, depth + 1)?;
        for env in f.envs.iter() {
            self.write_funcenv(buf, env, depth + 1)?;
        }
        Ok(())
    }

    fn write_funcdef(&mut self, buf: &mut Vec<u8>, def: &Rc<FuncDef>, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("marshal recursion too deep"));
        }
        let identity = Rc::as_ptr(def) as usize;
        if let Some(&id) = self.funcdefs.get(&identity) {
            buf.push(lead::FUNCDEF_REF);
            write_count(buf, id as u64);
            return Ok(());
        }
        let id = self.next_funcdef;
        self.next_funcdef += 1;
        self.funcdefs.insert(identity, id);

        write_ifield(buf, def.flags.bits() as i64);
        write_count(buf, def.slot_count as u64);
        write_count(buf, def.min_arity as u64);
        write_count(buf, def.max_arity as u64);
        write_count(buf, def.constants.len() as u64);
        for c in def.constants.iter() {
            self.write_value(buf, c, depth + 1)?;
        }
        write_count(buf, def.sub_defs.len() as u64);
        for sub in def.sub_defs.iter() {
            self.write_funcdef(buf, sub, depth + 1)?;
        }
        write_count(buf, def.envs.len() as u64);
        for env_desc in def.envs.iter() {
            match env_desc.parent_index {
                Some(i) => write_ifield(buf, i as i64),
                None => write_ifield(buf, -1),
            }
        }
        write_count(buf, def.bytecode.len() as u64);
        for instr in def.bytecode.iter() {
            buf.extend_from_slice(&instr.to_le_bytes());
        }
        self.write_option_source_map(buf, &def.source_map);
        self.write_option_symbol_map(buf, &def.symbol_map);
        write_option_closure_bits(buf, &def.closure_bits);
        write_option_string(buf, &def.name);
        write_option_string(buf, &def.source);
        Ok(())
    }

    fn write_option_source_map(&self, buf: &mut Vec<u8>, map: &Option<Vec<SourceMapEntry>>) {
        match map {
            Some(entries) => {
                buf.push(1);
                write_count(buf, entries.len() as u64);
                for e in entries {
                    write_count(buf, e.line as u64);
                    write_count(buf, e.column as u64);
                }
            }
            None => buf.push(0),
        }
    }

    /// Symbol-map entries are debugger metadata, not graph-shared
    /// structure; each entry's symbol is written as a plain length+bytes
    /// pair rather than routed through the value reference table.
    fn write_option_symbol_map(&self, buf: &mut Vec<u8>, map: &Option<Vec<SymbolMapEntry>>) {
        match map {
            Some(entries) => {
                buf.push(1);
                write_count(buf, entries.len() as u64);
                for e in entries {
                    write_count(buf, e.birth_pc as u64);
                    write_count(buf, e.death_pc as u64);
                    write_count(buf, e.slot as u64);
                    write_count(buf, e.symbol.bytes.len() as u64);
                    buf.extend_from_slice(&e.symbol.bytes);
                }
            }
            None => buf.push(0),
        }
    }

    fn write_funcenv(&mut self, buf: &mut Vec<u8>, env: &Rc<RefCell<FuncEnv>>, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("marshal recursion too deep"));
        }
        let identity = Rc::as_ptr(env) as usize;
        if let Some(&id) = self.funcenvs.get(&identity) {
            buf.push(lead::FUNCENV_REF);
            write_count(buf, id as u64);
            return Ok(());
        }
        let id = self.next_funcenv;
        self.next_funcenv += 1;
        self.funcenvs.insert(identity, id);

        let values: Vec<Value> = {
            // An on-stack env must be detached before it can outlive the
            // fiber it borrows from (§3); marshaling one is exactly such an
            // escape, so detach it in place here.
            let mut e = env.borrow_mut();
            e.detach();
            (0..e.len()).map(|i| e.get(i)).collect()
        };
        write_count(buf, values.len() as u64);
        for v in values.iter() {
            self.write_value(buf, v, depth + 1)?;
        }
        Ok(())
    }

    /// Rejected when `status == ALIVE` or the fiber has native frames on
    /// its stack; otherwise a header followed by a top-to-bottom frame
    /// walk.
    fn write_fiber(&mut self, buf: &mut Vec<u8>, f: &FiberHandle, depth: usize) -> Result<()> {
        let identity = f.hash_key();
        if self.check_seen(identity, buf) {
            return Ok(());
        }
        if f.status() == FiberStatus::Alive || f.flags().contains(FiberFlags::HAS_C_FRAMES) {
            return Err(Error::protocol(
                "cannot marshal a fiber that is alive or has native frames on its stack",
            ));
        }
        self.register_seen(identity);
        buf.push(lead::FIBER);
        write_ifield(buf, f.flags().bits() as i64);
        write_ifield(buf, status_code(f.status()));
        let frame_depth = f.frame_depth();
        write_count(buf, frame_depth as u64);
        write_count(buf, f.stack_len() as u64);
        for i in (0..frame_depth).rev() {
            let frame = f.frame_at(i);
            let upper = if i + 1 < frame_depth { f.frame_at(i + 1).frame_base } else { f.stack_len() };
            write_ifield(buf, frame.is_tail as i64);
            write_count(buf, frame.frame_base as u64);
            write_count(buf, frame.pc as u64);
            self.write_function(buf, &frame.function, depth + 1)?;
            let slot_count = upper.saturating_sub(frame.frame_base);
            write_count(buf, slot_count as u64);
            for slot in frame.frame_base..upper {
                self.write_value(buf, &f.stack_get(slot), depth + 1)?;
            }
        }
        Ok(())
    }

    fn write_abstract(&mut self, buf: &mut Vec<u8>, value: &Value, a: &Rc<AbstractObj>, _depth: usize) -> Result<()> {
        let identity = Rc::as_ptr(a) as usize;
        if self.check_seen(identity, buf) {
            return Ok(());
        }
        if let Some(name) = self.registry.and_then(|r| r.name_of(value)) {
            self.register_seen(identity);
            buf.push(lead::REGISTRY_REF);
            write_count(buf, name.len() as u64);
            buf.extend_from_slice(name.as_bytes());
            return Ok(());
        }
        self.register_seen(identity);
        let type_name = a.type_id.name();
        let vtable = self
            .abstract_types
            .and_then(|types| types.lookup(type_name))
            .ok_or_else(|| Error::protocol(format!("abstract type {type_name} has no marshal hook")))?;
        let marshal_fn = vtable
            .marshal
            .ok_or_else(|| Error::protocol(format!("abstract type {type_name} has no marshal hook")))?;
        buf.push(lead::ABSTRACT);
        write_count(buf, type_name.len() as u64);
        buf.extend_from_slice(type_name.as_bytes());
        marshal_fn(a, buf)
    }

    fn write_cfunction(&mut self, buf: &mut Vec<u8>, value: &Value, c: &Rc<crate::registry::CFunction>) -> Result<()> {
        if let Some(name) = self.registry.and_then(|r| r.name_of(value)) {
            buf.push(lead::REGISTRY_REF);
            write_count(buf, name.len() as u64);
            buf.extend_from_slice(name.as_bytes());
            return Ok(());
        }
        // An anonymous C-function has no symbolic identity to marshal;
        // `UNSAFE` only lets the raw address travel as a same-process
        // round-trip token (see `decode::read_abstract_or_cfunction`).
        self.require_unsafe()?;
        buf.push(lead::UNSAFE_CFUNCTION);
        buf.extend_from_slice(&(Rc::as_ptr(c) as usize as u64).to_le_bytes());
        Ok(())
    }
}

fn status_code(status: FiberStatus) -> i64 {
    match status {
        FiberStatus::Dead => 0,
        FiberStatus::Pending => 1,
        FiberStatus::New => 2,
        FiberStatus::Alive => 3,
        FiberStatus::Debug => 4,
        FiberStatus::Error => 5,
        FiberStatus::User0 => 6,
        FiberStatus::User1 => 7,
        FiberStatus::User2 => 8,
        FiberStatus::User3 => 9,
        FiberStatus::User4 => 10,
    }
}

fn write_option_string(buf: &mut Vec<u8>, s: &Option<String>) {
    match s {
        Some(s) => {
            buf.push(1);
            write_count(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        None => buf.push(0),
    }
}

fn write_option_closure_bits(buf: &mut Vec<u8>, bits: &Option<Vec<bool>>) {
    match bits {
        Some(bits) => {
            buf.push(1);
            write_count(buf, bits.len() as u64);
            let mut packed = Vec::with_capacity((bits.len() + 7) / 8);
            let mut byte = 0u8;
            let mut n = 0u8;
            for &b in bits {
                if b {
                    byte |= 1 << n;
                }
                n += 1;
                if n == 8 {
                    packed.push(byte);
                    byte = 0;
                    n = 0;
                }
            }
            if n > 0 {
                packed.push(byte);
            }
            buf.extend_from_slice(&packed);
        }
        None => buf.push(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{int_value, GcHeader};

    #[test]
    fn short_ints_take_a_single_byte() {
        let mut buf = Vec::new();
        marshal(&mut buf, &int_value(42), None, None, MarshalFlags::empty()).unwrap();
        assert_eq!(buf, vec![42]);
    }

    #[test]
    fn negative_ints_use_the_long_lead_byte() {
        let mut buf = Vec::new();
        marshal(&mut buf, &Value::Int(-3), None, None, MarshalFlags::empty()).unwrap();
        assert_eq!(buf[0], lead::LONG_INT);
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn nil_and_booleans_are_one_byte() {
        let mut buf = Vec::new();
        marshal(&mut buf, &Value::Nil, None, None, MarshalFlags::empty()).unwrap();
        marshal(&mut buf, &Value::Bool(true), None, None, MarshalFlags::empty()).unwrap();
        marshal(&mut buf, &Value::Bool(false), None, None, MarshalFlags::empty()).unwrap();
        assert_eq!(buf, vec![lead::NIL, lead::TRUE, lead::FALSE]);
    }

    #[test]
    fn unsafe_pointer_requires_the_flag() {
        let mut buf = Vec::new();
        let err = marshal(&mut buf, &Value::Pointer(0x1000), None, None, MarshalFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        buf.clear();
        marshal(&mut buf, &Value::Pointer(0x1000), None, None, MarshalFlags::UNSAFE).unwrap();
        assert_eq!(buf[0], lead::UNSAFE_POINTER);
    }

    #[test]
    fn self_referential_array_emits_a_reference_byte() {
        let arr = Rc::new(RefCell::new(ArrayObj {
            header: GcHeader::new(),
            items: vec![Value::Nil],
        }));
        arr.borrow_mut().items[0] = Value::Array(arr.clone());
        let mut buf = Vec::new();
        marshal(&mut buf, &Value::Array(arr), None, None, MarshalFlags::empty()).unwrap();
        assert!(buf.contains(&lead::REFERENCE));
    }
}
