//! The self-describing binary marshaling codec: lead-byte wire model,
//! reference table for cyclic/shared graphs, registry shortcuts for
//! C-functions and abstract types, funcenv/funcdef interning, and fiber
//! serialization.
//!
//! `encode`/`decode` split into a writer and an iterator/cursor reader:
//! [`encode::Marshaler`] is the reference-table-carrying writer,
//! [`decode::Unmarshaler`] the bounds-checked reader. This doesn't ride on
//! `rmp`/msgpack — the wire model here is this crate's own, so the
//! lead-byte table and reference-table bookkeeping are hand-rolled in
//! [`lead`] and [`varint`].
pub mod decode;
pub mod encode;
mod lead;
mod varint;

pub use decode::unmarshal;
pub use encode::marshal;

/// Deep-recursion guard for both directions: exceeding it raises rather
/// than overflowing the native stack. Chosen generously above any
/// structure a hand-written test fixture would nest, while still well
/// below a fiber's native call-stack limit.
pub const MAX_DEPTH: usize = 512;

bitflags::bitflags! {
    #[derive(Default)]
    pub struct MarshalFlags: u32 {
        /// Disables the reference table. Only safe for inputs already
        /// known to be tree-shaped; a cyclic graph marshaled with this set
        /// will recurse until [`MAX_DEPTH`] raises (or, for a genuine
        /// cycle through arrays/tables, never terminate — the caller's
        /// responsibility to avoid).
        const NO_CYCLES = 1 << 0;
        /// Required to marshal or unmarshal raw pointers, cfunctions,
        /// threaded-abstracts, or pointer-buffers; absent, those lead
        /// bytes raise on both directions.
        const UNSAFE = 1 << 1;
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::value::{int_value, LString, TupleObj, Value};

    #[test]
    fn roundtrips_a_flat_tuple() {
        let tuple = Value::Tuple(Rc::new(TupleObj {
            header: crate::value::GcHeader::new(),
            items: vec![int_value(42), Value::Bool(true), Value::Nil, Value::String(LString::new(*b"hi"))]
                .into_boxed_slice(),
            source_flag: true,
        }));
        let mut buf = Vec::new();
        marshal(&mut buf, &tuple, None, None, MarshalFlags::empty()).unwrap();
        let mut cursor = 0;
        let back = unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).unwrap();
        assert_eq!(back, tuple);
        assert_eq!(cursor, buf.len());
    }

    #[test]
    fn shared_array_reference_is_preserved_within_one_graph() {
        let shared = Value::Array(Rc::new(std::cell::RefCell::new(crate::value::ArrayObj {
            header: crate::value::GcHeader::new(),
            items: vec![Value::Int(1)],
        })));
        let tuple = Value::Tuple(Rc::new(TupleObj {
            header: crate::value::GcHeader::new(),
            items: vec![shared.clone(), shared.clone()].into_boxed_slice(),
            source_flag: false,
        }));
        let mut buf = Vec::new();
        marshal(&mut buf, &tuple, None, None, MarshalFlags::empty()).unwrap();
        let mut cursor = 0;
        let back = unmarshal(&buf, None, None, MarshalFlags::empty(), &mut cursor).unwrap();
        let Value::Tuple(back) = back else { panic!("expected tuple") };
        let (Value::Array(a), Value::Array(b)) = (&back.items[0], &back.items[1]) else {
            panic!("expected arrays")
        };
        assert!(Rc::ptr_eq(a, b));
    }
}
