//! Lead byte constants for the wire format. Values `0..=199` never appear
//! here: at the top level they are short non-negative integers encoded
//! inline with no lead byte at all.

pub const REAL: u8 = 200;
pub const NIL: u8 = 201;
pub const FALSE: u8 = 202;
pub const TRUE: u8 = 203;
pub const FIBER: u8 = 204;
pub const LONG_INT: u8 = 205;
pub const STRING: u8 = 206;
pub const SYMBOL: u8 = 207;
pub const KEYWORD: u8 = 208;
pub const ARRAY: u8 = 209;
pub const TUPLE: u8 = 210;
pub const TABLE: u8 = 211;
pub const TABLE_PROTO: u8 = 212;
pub const STRUCT: u8 = 213;
pub const BUFFER: u8 = 214;
pub const FUNCTION: u8 = 215;
pub const REGISTRY_REF: u8 = 216;
pub const ABSTRACT: u8 = 217;
pub const REFERENCE: u8 = 218;
pub const FUNCENV_REF: u8 = 219;
pub const FUNCDEF_REF: u8 = 220;
pub const UNSAFE_CFUNCTION: u8 = 221;
pub const UNSAFE_POINTER: u8 = 222;
pub const STRUCT_PROTO: u8 = 223;
pub const THREADED_ABSTRACT: u8 = 224;
pub const POINTER_BUFFER: u8 = 225;

/// `226..=231`: weak-table variants, ±prototype crossed with the three
/// [`crate::value::WeakMode`] variants that aren't `None`. Order within the
/// range is this crate's own choice; see `DESIGN.md`.
pub const WEAK_TABLE_KEY: u8 = 226;
pub const WEAK_TABLE_VALUE: u8 = 227;
pub const WEAK_TABLE_KEY_VALUE: u8 = 228;
pub const WEAK_TABLE_PROTO_KEY: u8 = 229;
pub const WEAK_TABLE_PROTO_VALUE: u8 = 230;
pub const WEAK_TABLE_PROTO_KEY_VALUE: u8 = 231;

pub const WEAK_ARRAY: u8 = 232;

/// Base of the compact big-integer encoding used for internal count/offset
/// fields (not top-level values): `BIGINT_BASE + nbytes`, followed by
/// `nbytes` little-endian bytes. `nbytes` ranges `1..=8`.
pub const BIGINT_BASE: u8 = 0xF0;
