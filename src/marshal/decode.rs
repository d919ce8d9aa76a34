//! Reader half of the marshal codec. [`Unmarshaler`] mirrors
//! [`super::encode::Marshaler`]'s reference-table bookkeeping bit for bit:
//! the same lead bytes, the same before/after-children registration split
//! per type, the same separate funcdef/funcenv intern tables.
//!
//! The reference table here is a `Vec<Option<Value>>` rather than the
//! writer's `HashMap<usize, u32>`: a decoded id is a plain index, and a slot
//! is reserved (pushed as `None`) at the exact point in the traversal where
//! the writer assigned that id, then filled in once the value exists. For
//! array/table/abstract, the reservation and the fill happen together
//! (their `RefCell` lets children be parsed into an already-shared `Rc`);
//! for function/fiber, the slot can only be filled after the whole body is
//! read, since neither has interior mutability to hang a placeholder off —
//! see `DESIGN.md` for what that costs.
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::fiber::{FiberFlags, FiberHandle, FiberStatus, Frame};
use crate::funcdef::{EnvDescriptor, FuncDef, FuncEnv, FuncFlags, SourceMapEntry, SymbolMapEntry};
use crate::registry::{AbstractTypeRegistry, Registry};
use crate::value::{AbstractObj, ArrayObj, BufferObj, FunctionObj, GcHeader, LString, StructObj, TableObj, TupleObj, Value, WeakMode};

use super::lead;
use super::varint::{read_count, read_exact, read_ifield, read_u8};
use super::{MarshalFlags, MAX_DEPTH};

/// Unmarshal one value from `bytes` starting at `*cursor`, advancing it past
/// what was read. `registry` resolves `registry-ref` back to the value it
/// names; `abstract_types` resolves an abstract's own `unmarshal` hook.
pub fn unmarshal(
    bytes: &[u8],
    registry: Option<&Registry>,
    abstract_types: Option<&AbstractTypeRegistry>,
    flags: MarshalFlags,
    cursor: &mut usize,
) -> Result<Value> {
    let mut u = Unmarshaler::new(registry, abstract_types, flags);
    u.read_value(bytes, cursor, 0)
}

struct Unmarshaler<'a> {
    registry: Option<&'a Registry>,
    abstract_types: Option<&'a AbstractTypeRegistry>,
    flags: MarshalFlags,
    seen: Vec<Option<Value>>,
    funcdefs: Vec<Option<Rc<FuncDef>>>,
    funcenvs: Vec<Option<Rc<RefCell<FuncEnv>>>>,
}

impl<'a> Unmarshaler<'a> {
    fn new(registry: Option<&'a Registry>, abstract_types: Option<&'a AbstractTypeRegistry>, flags: MarshalFlags) -> Self {
        Unmarshaler {
            registry,
            abstract_types,
            flags,
            seen: Vec::new(),
            funcdefs: Vec::new(),
            funcenvs: Vec::new(),
        }
    }

    fn cycles_tracked(&self) -> bool {
        !self.flags.contains(MarshalFlags::NO_CYCLES)
    }

    fn require_unsafe(&self) -> Result<()> {
        if self.flags.contains(MarshalFlags::UNSAFE) {
            Ok(())
        } else {
            Err(Error::protocol("UNSAFE flag required to unmarshal this value"))
        }
    }

    /// Reserve the next reference-table slot, to be [`Self::fill`]ed once
    /// the value it names exists. Mirrors `Marshaler::register_seen`'s
    /// `next_ref` counter exactly, so ids line up even though the `Value`
    /// itself may not be constructable yet.
    fn reserve(&mut self) -> Option<usize> {
        if !self.cycles_tracked() {
            return None;
        }
        self.seen.push(None);
        Some(self.seen.len() - 1)
    }

    fn fill(&mut self, slot: Option<usize>, value: Value) {
        if let Some(id) = slot {
            self.seen[id] = Some(value);
        }
    }

    fn resolve_reference(&self, id: u64) -> Result<Value> {
        self.seen
            .get(id as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| Error::protocol(format!("reference to unresolved or unknown id {id}")))
    }

    fn read_value(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("unmarshal recursion too deep"));
        }
        let b0 = read_u8(bytes, cursor)?;
        if b0 <= 199 {
            return Ok(Value::Int(b0 as i32));
        }
        match b0 {
            lead::REAL => {
                let raw = read_exact(bytes, cursor, 8)?;
                let arr: [u8; 8] = raw.try_into().unwrap();
                Ok(Value::Number(f64::from_le_bytes(arr)))
            }
            lead::NIL => Ok(Value::Nil),
            lead::FALSE => Ok(Value::Bool(false)),
            lead::TRUE => Ok(Value::Bool(true)),
            lead::LONG_INT => {
                let raw = read_exact(bytes, cursor, 4)?;
                let arr: [u8; 4] = raw.try_into().unwrap();
                Ok(Value::Int(i32::from_be_bytes(arr)))
            }
            lead::STRING => self.read_lstring(bytes, cursor, Value::String as fn(Rc<LString>) -> Value),
            lead::SYMBOL => self.read_lstring(bytes, cursor, Value::Symbol as fn(Rc<LString>) -> Value),
            lead::KEYWORD => self.read_lstring(bytes, cursor, Value::Keyword as fn(Rc<LString>) -> Value),
            lead::BUFFER => self.read_buffer(bytes, cursor),
            lead::ARRAY => self.read_array(bytes, cursor, depth),
            lead::TUPLE => self.read_tuple(bytes, cursor, depth),
            lead::TABLE | lead::TABLE_PROTO => self.read_table(bytes, cursor, depth, WeakMode::None, b0 == lead::TABLE_PROTO),
            lead::WEAK_TABLE_KEY => self.read_table(bytes, cursor, depth, WeakMode::Key, false),
            lead::WEAK_TABLE_VALUE => self.read_table(bytes, cursor, depth, WeakMode::Value, false),
            lead::WEAK_TABLE_KEY_VALUE => self.read_table(bytes, cursor, depth, WeakMode::KeyValue, false),
            lead::WEAK_TABLE_PROTO_KEY => self.read_table(bytes, cursor, depth, WeakMode::Key, true),
            lead::WEAK_TABLE_PROTO_VALUE => self.read_table(bytes, cursor, depth, WeakMode::Value, true),
            lead::WEAK_TABLE_PROTO_KEY_VALUE => self.read_table(bytes, cursor, depth, WeakMode::KeyValue, true),
            lead::STRUCT => self.read_struct(bytes, cursor, depth, false),
            lead::STRUCT_PROTO => self.read_struct(bytes, cursor, depth, true),
            lead::FUNCTION => self.read_function(bytes, cursor, depth),
            lead::FIBER => self.read_fiber(bytes, cursor, depth),
            lead::ABSTRACT => self.read_abstract(bytes, cursor, depth),
            lead::REGISTRY_REF => self.read_registry_ref(bytes, cursor),
            lead::REFERENCE => {
                let id = read_count(bytes, cursor)?;
                self.resolve_reference(id)
            }
            lead::UNSAFE_POINTER => {
                self.require_unsafe()?;
                let raw = read_exact(bytes, cursor, 8)?;
                let arr: [u8; 8] = raw.try_into().unwrap();
                Ok(Value::Pointer(u64::from_le_bytes(arr) as usize))
            }
            lead::WEAK_ARRAY => {
                // No `Value` variant models a weak array (`ArrayObj` carries
                // no weak-mode field); this crate's own encoder never emits
                // this byte. Decoding one from a foreign stream degrades to
                // a plain array rather than erroring, per DESIGN.md.
                self.read_array(bytes, cursor, depth)
            }
            lead::UNSAFE_CFUNCTION => {
                self.require_unsafe()?;
                let _addr = read_exact(bytes, cursor, 8)?;
                Err(Error::protocol(
                    "cannot reconstruct an anonymous cfunction from its marshaled address",
                ))
            }
            lead::THREADED_ABSTRACT => Err(Error::protocol("threaded-abstract lead byte is not supported on decode")),
            lead::POINTER_BUFFER => Err(Error::protocol("pointer-buffer lead byte is not supported on decode")),
            other => Err(Error::protocol(format!("unknown lead byte {other}"))),
        }
    }

    fn read_lstring(&mut self, bytes: &[u8], cursor: &mut usize, wrap: fn(Rc<LString>) -> Value) -> Result<Value> {
        let slot = self.reserve();
        let len = read_count(bytes, cursor)? as usize;
        let raw = read_exact(bytes, cursor, len)?;
        let s = LString::new(raw.to_vec().into_boxed_slice());
        let value = wrap(s);
        self.fill(slot, value.clone());
        Ok(value)
    }

    fn read_buffer(&mut self, bytes: &[u8], cursor: &mut usize) -> Result<Value> {
        let slot = self.reserve();
        let len = read_count(bytes, cursor)? as usize;
        let raw = read_exact(bytes, cursor, len)?;
        let value = Value::Buffer(Rc::new(RefCell::new(BufferObj {
            header: GcHeader::new(),
            bytes: raw.to_vec(),
        })));
        self.fill(slot, value.clone());
        Ok(value)
    }

    /// Slot reserved and filled with a live (empty) `Rc<RefCell<_>>` before
    /// children are read, mirroring `write_array`'s before-children
    /// registration: a value inside this array that refers back to it via
    /// `reference` resolves correctly.
    fn read_array(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Value> {
        let slot = self.reserve();
        let len = read_count(bytes, cursor)? as usize;
        let arr = Rc::new(RefCell::new(ArrayObj {
            header: GcHeader::new(),
            items: Vec::with_capacity(len.min(1 << 20)),
        }));
        let value = Value::Array(arr.clone());
        self.fill(slot, value.clone());
        for _ in 0..len {
            let item = self.read_value(bytes, cursor, depth + 1)?;
            arr.borrow_mut().items.push(item);
        }
        Ok(value)
    }

    /// Tuples memoize *after* their children (mirrors `write_tuple`): a
    /// tuple can never legally reference itself, so there is nothing lost
    /// by only reserving the slot once it's fully built.
    fn read_tuple(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Value> {
        let len = read_count(bytes, cursor)? as usize;
        let source_flag = read_ifield(bytes, cursor)? != 0;
        let mut items = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            items.push(self.read_value(bytes, cursor, depth + 1)?);
        }
        let value = Value::Tuple(Rc::new(TupleObj {
            header: GcHeader::new(),
            items: items.into_boxed_slice(),
            source_flag,
        }));
        if self.cycles_tracked() {
            self.seen.push(Some(value.clone()));
        }
        Ok(value)
    }

    fn read_table(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize, weak: WeakMode, has_proto: bool) -> Result<Value> {
        let slot = self.reserve();
        let table = Rc::new(RefCell::new(TableObj::new(weak)));
        let value = Value::Table(table.clone());
        self.fill(slot, value.clone());
        if has_proto {
            let proto = self.read_value(bytes, cursor, depth + 1)?;
            table.borrow_mut().prototype = Some(proto);
        }
        let len = read_count(bytes, cursor)? as usize;
        for _ in 0..len {
            let k = self.read_value(bytes, cursor, depth + 1)?;
            let v = self.read_value(bytes, cursor, depth + 1)?;
            table.borrow_mut().entries.push((k, v));
        }
        Ok(value)
    }

    /// Structs memoize *after* their children too (mirrors `write_struct`),
    /// so the prototype chain (itself struct-valued, recursed the same way)
    /// is parsed before this struct gets a reference id.
    fn read_struct(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize, has_proto: bool) -> Result<Value> {
        let prototype = if has_proto {
            let Value::Struct(p) = self.read_struct_inner(bytes, cursor, depth + 1)? else {
                unreachable!("read_struct_inner always returns Value::Struct")
            };
            Some(p)
        } else {
            None
        };
        let len = read_count(bytes, cursor)? as usize;
        let mut entries = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            let k = self.read_value(bytes, cursor, depth + 1)?;
            let v = self.read_value(bytes, cursor, depth + 1)?;
            entries.push((k, v));
        }
        let value = Value::Struct(Rc::new(StructObj {
            header: GcHeader::new(),
            entries: entries.into_boxed_slice(),
            prototype,
        }));
        if self.cycles_tracked() {
            self.seen.push(Some(value.clone()));
        }
        Ok(value)
    }

    /// A prototype struct is itself preceded by its own `struct`/`struct-proto`
    /// lead byte (`write_struct` recurses into `write_struct`, not
    /// `write_value`), so read it the same way rather than through
    /// `read_value`'s generic dispatch.
    fn read_struct_inner(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("unmarshal recursion too deep"));
        }
        let tag = read_u8(bytes, cursor)?;
        match tag {
            lead::STRUCT => self.read_struct(bytes, cursor, depth, false),
            lead::STRUCT_PROTO => self.read_struct(bytes, cursor, depth, true),
            lead::REFERENCE => {
                let id = read_count(bytes, cursor)?;
                self.resolve_reference(id)
            }
            other => Err(Error::protocol(format!("expected a struct prototype, found lead byte {other}"))),
        }
    }

    /// Functions reserve their slot before the body (mirrors
    /// `write_function`'s before-children registration, for ordinary
    /// sharing of the same function value elsewhere in the graph) but can
    /// only be filled in after: `FunctionObj` has no interior mutability to
    /// hang a placeholder off. A function embedding a `reference` to
    /// itself — impossible to produce from a real fiber's closures, since a
    /// function can't close over a `FunctionObj` still being constructed —
    /// fails with a protocol error instead of the silent wrong answer a
    /// half-built placeholder would risk. See `DESIGN.md`.
    fn read_function(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Value> {
        let slot = self.reserve();
        let env_count = read_count(bytes, cursor)? as usize;
        let def = self.read_funcdef(bytes, cursor, depth + 1)?;
        let mut envs = Vec::with_capacity(env_count.min(1 << 20));
        for _ in 0..env_count {
            envs.push(self.read_funcenv(bytes, cursor, depth + 1)?);
        }
        let value = Value::Function(Rc::new(FunctionObj {
            header: GcHeader::new(),
            def,
            envs,
        }));
        self.fill(slot, value.clone());
        Ok(value)
    }

    fn read_funcdef(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Rc<FuncDef>> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("unmarshal recursion too deep"));
        }
        let tag_peek = *bytes.get(*cursor).ok_or_else(|| Error::protocol("unexpected end of marshaled input"))?;
        if tag_peek == lead::FUNCDEF_REF {
            *cursor += 1;
            let id = read_count(bytes, cursor)? as usize;
            return self
                .funcdefs
                .get(id)
                .and_then(|slot| slot.clone())
                .ok_or_else(|| Error::protocol(format!("funcdef reference to unresolved id {id}")));
        }
        // Not a back-reference: reserve this funcdef's id up front (mirrors
        // `next_funcdef`'s pre-order assignment) before recursing into
        // `sub_defs`, which may themselves contain `funcdef-ref`s pointing
        // back to ids assigned earlier in the same top-level function.
        let id = self.funcdefs.len();
        self.funcdefs.push(None);

        let flags = FuncFlags::from_bits_truncate(read_ifield(bytes, cursor)? as u32);
        let slot_count = read_count(bytes, cursor)? as u32;
        let min_arity = read_count(bytes, cursor)? as u32;
        let max_arity = read_count(bytes, cursor)? as u32;

        let const_count = read_count(bytes, cursor)? as usize;
        let mut constants = Vec::with_capacity(const_count.min(1 << 20));
        for _ in 0..const_count {
            constants.push(self.read_value(bytes, cursor, depth + 1)?);
        }

        let sub_count = read_count(bytes, cursor)? as usize;
        let mut sub_defs = Vec::with_capacity(sub_count.min(1 << 20));
        for _ in 0..sub_count {
            sub_defs.push(self.read_funcdef(bytes, cursor, depth + 1)?);
        }

        let env_count = read_count(bytes, cursor)? as usize;
        let mut envs = Vec::with_capacity(env_count.min(1 << 20));
        for _ in 0..env_count {
            let raw = read_ifield(bytes, cursor)?;
            envs.push(EnvDescriptor {
                parent_index: if raw < 0 { None } else { Some(raw as u32) },
            });
        }

        let bytecode_count = read_count(bytes, cursor)? as usize;
        let mut bytecode = Vec::with_capacity(bytecode_count.min(1 << 20));
        for _ in 0..bytecode_count {
            let raw = read_exact(bytes, cursor, 4)?;
            let arr: [u8; 4] = raw.try_into().unwrap();
            bytecode.push(u32::from_le_bytes(arr));
        }

        let source_map = self.read_option_source_map(bytes, cursor)?;
        let symbol_map = self.read_option_symbol_map(bytes, cursor)?;
        let closure_bits = read_option_closure_bits(bytes, cursor)?;
        let name = read_option_string(bytes, cursor)?;
        let source = read_option_string(bytes, cursor)?;

        let def = Rc::new(FuncDef {
            flags,
            slot_count,
            min_arity,
            max_arity,
            constants,
            sub_defs,
            envs,
            bytecode,
            source_map,
            symbol_map,
            closure_bits,
            name,
            source,
        });
        self.funcdefs[id] = Some(def.clone());
        Ok(def)
    }

    fn read_option_source_map(&mut self, bytes: &[u8], cursor: &mut usize) -> Result<Option<Vec<SourceMapEntry>>> {
        let tag = read_u8(bytes, cursor)?;
        if tag == 0 {
            return Ok(None);
        }
        let n = read_count(bytes, cursor)? as usize;
        let mut entries = Vec::with_capacity(n.min(1 << 20));
        for _ in 0..n {
            let line = read_count(bytes, cursor)? as u32;
            let column = read_count(bytes, cursor)? as u32;
            entries.push(SourceMapEntry { line, column });
        }
        Ok(Some(entries))
    }

    fn read_option_symbol_map(&mut self, bytes: &[u8], cursor: &mut usize) -> Result<Option<Vec<SymbolMapEntry>>> {
        let tag = read_u8(bytes, cursor)?;
        if tag == 0 {
            return Ok(None);
        }
        let n = read_count(bytes, cursor)? as usize;
        let mut entries = Vec::with_capacity(n.min(1 << 20));
        for _ in 0..n {
            let birth_pc = read_count(bytes, cursor)? as u32;
            let death_pc = read_count(bytes, cursor)? as u32;
            let slot = read_count(bytes, cursor)? as u32;
            let len = read_count(bytes, cursor)? as usize;
            let raw = read_exact(bytes, cursor, len)?;
            entries.push(SymbolMapEntry {
                birth_pc,
                death_pc,
                slot,
                symbol: LString::new(raw.to_vec().into_boxed_slice()),
            });
        }
        Ok(Some(entries))
    }

    fn read_funcenv(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Rc<RefCell<FuncEnv>>> {
        if depth > MAX_DEPTH {
            return Err(Error::protocol("unmarshal recursion too deep"));
        }
        let tag_peek = *bytes.get(*cursor).ok_or_else(|| Error::protocol("unexpected end of marshaled input"))?;
        if tag_peek == lead::FUNCENV_REF {
            *cursor += 1;
            let id = read_count(bytes, cursor)? as usize;
            return self
                .funcenvs
                .get(id)
                .and_then(|slot| slot.clone())
                .ok_or_else(|| Error::protocol(format!("funcenv reference to unresolved id {id}")));
        }
        let id = self.funcenvs.len();
        self.funcenvs.push(None);
        let len = read_count(bytes, cursor)? as usize;
        let mut values = Vec::with_capacity(len.min(1 << 20));
        for _ in 0..len {
            values.push(self.read_value(bytes, cursor, depth + 1)?);
        }
        let env = Rc::new(RefCell::new(FuncEnv::Detached { values }));
        self.funcenvs[id] = Some(env.clone());
        Ok(env)
    }

    /// Mirrors `write_fiber`'s before-children registration: the slot is
    /// reserved up front (so sibling objects reachable through this fiber's
    /// stack get correctly-ordered ids) but, like function, can only be
    /// filled after `FiberHandle::from_parts` exists — a fiber holding a
    /// live reference to itself on its own stack is the same documented
    /// limitation as self-referential functions.
    fn read_fiber(&mut self, bytes: &[u8], cursor: &mut usize, depth: usize) -> Result<Value> {
        let slot = self.reserve();
        let flags = FiberFlags::from_bits_truncate(read_ifield(bytes, cursor)? as u32);
        let status = status_from_code(read_ifield(bytes, cursor)?)?;
        let frame_count = read_count(bytes, cursor)? as usize;
        let stack_len = read_count(bytes, cursor)? as usize;

        let mut stack: Vec<Value> = vec![Value::Nil; stack_len];
        let mut frames_rev = Vec::with_capacity(frame_count.min(1 << 20));
        for _ in 0..frame_count {
            let is_tail = read_ifield(bytes, cursor)? != 0;
            let frame_base = read_count(bytes, cursor)? as usize;
            let pc = read_count(bytes, cursor)? as u32;
            let Value::Function(function) = self.read_function(bytes, cursor, depth + 1)? else {
                return Err(Error::protocol("expected a function in fiber frame"));
            };
            let slot_count = read_count(bytes, cursor)? as usize;
            for i in 0..slot_count {
                let idx = frame_base + i;
                let v = self.read_value(bytes, cursor, depth + 1)?;
                if idx >= stack.len() {
                    return Err(Error::protocol("fiber frame slot out of bounds"));
                }
                stack[idx] = v;
            }
            frames_rev.push(Frame {
                function,
                pc,
                frame_base,
                is_tail,
            });
        }
        frames_rev.reverse();

        let handle = FiberHandle::from_parts(None, status, flags, stack, frames_rev);
        let value = Value::Fiber(handle);
        self.fill(slot, value.clone());
        Ok(value)
    }

    /// An abstract value has interior mutability (`data: RefCell<_>`), so —
    /// unlike function/fiber — it can be registered before its body is
    /// decoded and genuinely support self-reference: the placeholder is a
    /// real, shareable `Rc<AbstractObj>` from the moment its type name is
    /// known, with `data` filled in once the vtable hook returns.
    fn read_abstract(&mut self, bytes: &[u8], cursor: &mut usize, _depth: usize) -> Result<Value> {
        let type_len = read_count(bytes, cursor)? as usize;
        let raw = read_exact(bytes, cursor, type_len)?;
        let type_name = String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("abstract type name is not valid UTF-8"))?;

        let vtable = self
            .abstract_types
            .and_then(|types| types.lookup(&type_name))
            .ok_or_else(|| Error::protocol(format!("abstract type {type_name} is not registered")))?;
        let unmarshal_fn = vtable
            .unmarshal
            .ok_or_else(|| Error::protocol(format!("abstract type {type_name} has no unmarshal hook")))?;

        let slot = self.reserve();
        let obj = Rc::new(AbstractObj {
            header: GcHeader::new(),
            type_id: vtable.type_id.clone(),
            data: RefCell::new(Box::new(())),
        });
        let value = Value::Abstract(obj.clone());
        self.fill(slot, value.clone());

        let (data, consumed) = unmarshal_fn(&bytes[*cursor..])?;
        *cursor += consumed;
        *obj.data.borrow_mut() = data;
        Ok(value)
    }

    /// `registry-ref` resolves via `Registry::require`. Mirrors the
    /// writer's asymmetry: an abstract registered this way is memoized into
    /// the reference table (so a later plain `reference` byte resolves
    /// back to it), a cfunction is not (`write_cfunction`'s registry-ref
    /// path never calls `register_seen`).
    fn read_registry_ref(&mut self, bytes: &[u8], cursor: &mut usize) -> Result<Value> {
        let len = read_count(bytes, cursor)? as usize;
        let raw = read_exact(bytes, cursor, len)?;
        let name = String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("registry name is not valid UTF-8"))?;
        let value = self
            .registry
            .ok_or_else(|| Error::protocol("no registry available to resolve registry-ref"))?
            .require(&name)?;
        if matches!(value, Value::Abstract(_)) && self.cycles_tracked() {
            self.seen.push(Some(value.clone()));
        }
        Ok(value)
    }
}

fn status_from_code(code: i64) -> Result<FiberStatus> {
    Ok(match code {
        0 => FiberStatus::Dead,
        1 => FiberStatus::Pending,
        2 => FiberStatus::New,
        3 => FiberStatus::Alive,
        4 => FiberStatus::Debug,
        5 => FiberStatus::Error,
        6 => FiberStatus::User0,
        7 => FiberStatus::User1,
        8 => FiberStatus::User2,
        9 => FiberStatus::User3,
        10 => FiberStatus::User4,
        other => return Err(Error::protocol(format!("invalid fiber status code {other}"))),
    })
}

fn read_option_string(bytes: &[u8], cursor: &mut usize) -> Result<Option<String>> {
    let tag = read_u8(bytes, cursor)?;
    if tag == 0 {
        return Ok(None);
    }
    let len = read_count(bytes, cursor)? as usize;
    let raw = read_exact(bytes, cursor, len)?;
    Ok(Some(String::from_utf8(raw.to_vec()).map_err(|_| Error::protocol("string field is not valid UTF-8"))?))
}

fn read_option_closure_bits(bytes: &[u8], cursor: &mut usize) -> Result<Option<Vec<bool>>> {
    let tag = read_u8(bytes, cursor)?;
    if tag == 0 {
        return Ok(None);
    }
    let n = read_count(bytes, cursor)? as usize;
    let packed_len = (n + 7) / 8;
    let raw = read_exact(bytes, cursor, packed_len)?;
    let mut bits = Vec::with_capacity(n);
    for i in 0..n {
        let byte = raw[i / 8];
        bits.push(byte & (1 << (i % 8)) != 0);
    }
    Ok(Some(bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{int_value, GcHeader};
    use std::cell::RefCell as StdRefCell;

    fn roundtrip(value: &Value) -> Value {
        let mut buf = Vec::new();
        super::super::encode::marshal(&mut buf, value, None, None, MarshalFlags::empty()).unwrap();
        let mut cursor = 0;
        let back = unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).unwrap();
        assert_eq!(cursor, buf.len());
        back
    }

    #[test]
    fn roundtrips_short_and_long_ints() {
        assert_eq!(roundtrip(&Value::Int(42)), Value::Int(42));
        assert_eq!(roundtrip(&Value::Int(-7)), Value::Int(-7));
        assert_eq!(roundtrip(&int_value(1_000_000)), int_value(1_000_000));
    }

    #[test]
    fn roundtrips_nil_bool_number() {
        assert_eq!(roundtrip(&Value::Nil), Value::Nil);
        assert_eq!(roundtrip(&Value::Bool(true)), Value::Bool(true));
        assert_eq!(roundtrip(&Value::Number(3.5)), Value::Number(3.5));
    }

    #[test]
    fn roundtrips_strings_symbols_keywords() {
        assert_eq!(roundtrip(&Value::String(LString::new(*b"hello"))), Value::String(LString::new(*b"hello")));
        assert_eq!(roundtrip(&Value::Keyword(LString::new(*b"ok"))), Value::Keyword(LString::new(*b"ok")));
    }

    #[test]
    fn roundtrips_a_flat_tuple() {
        let tuple = Value::Tuple(Rc::new(TupleObj {
            header: GcHeader::new(),
            items: vec![int_value(1), Value::Bool(false)].into_boxed_slice(),
            source_flag: true,
        }));
        assert_eq!(roundtrip(&tuple), tuple);
    }

    #[test]
    fn self_referential_array_round_trips_with_identity_preserved() {
        let arr = Rc::new(StdRefCell::new(ArrayObj {
            header: GcHeader::new(),
            items: vec![Value::Nil],
        }));
        arr.borrow_mut().items[0] = Value::Array(arr.clone());
        let mut buf = Vec::new();
        super::super::encode::marshal(&mut buf, &Value::Array(arr), None, None, MarshalFlags::empty()).unwrap();
        let mut cursor = 0;
        let back = unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).unwrap();
        let Value::Array(back) = back else { panic!("expected array") };
        let Value::Array(inner) = &back.borrow().items[0] else { panic!("expected nested array") };
        assert!(Rc::ptr_eq(&back, inner));
    }

    #[test]
    fn shared_array_reference_is_preserved_across_a_tuple() {
        let shared = Value::Array(Rc::new(StdRefCell::new(ArrayObj {
            header: GcHeader::new(),
            items: vec![Value::Int(1)],
        })));
        let tuple = Value::Tuple(Rc::new(TupleObj {
            header: GcHeader::new(),
            items: vec![shared.clone(), shared].into_boxed_slice(),
            source_flag: false,
        }));
        let back = roundtrip(&tuple);
        let Value::Tuple(back) = back else { panic!("expected tuple") };
        let (Value::Array(a), Value::Array(b)) = (&back.items[0], &back.items[1]) else {
            panic!("expected arrays")
        };
        assert!(Rc::ptr_eq(a, b));
    }

    #[test]
    fn unsafe_pointer_requires_the_flag_on_decode() {
        let mut buf = Vec::new();
        buf.push(lead::UNSAFE_POINTER);
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        let mut cursor = 0;
        assert!(unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).is_err());
        cursor = 0;
        assert_eq!(
            unmarshal(&buf, None, None, MarshalFlags::UNSAFE, &mut cursor).unwrap(),
            Value::Pointer(0x1000)
        );
    }

    #[test]
    fn unknown_lead_byte_is_a_protocol_error() {
        let buf = vec![254u8];
        let mut cursor = 0;
        let err = unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn truncated_input_is_a_protocol_error() {
        let buf = vec![lead::STRING, 5, b'h', b'i'];
        let mut cursor = 0;
        assert!(unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).is_err());
    }

    #[test]
    fn recursion_guard_rejects_deeply_nested_arrays() {
        let mut buf = Vec::new();
        for _ in 0..(MAX_DEPTH + 10) {
            buf.push(lead::ARRAY);
            buf.push(1);
        }
        buf.push(0);
        let mut cursor = 0;
        let err = unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
