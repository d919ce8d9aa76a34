//! Execution substrate for an embeddable, cooperative dynamic-language
//! runtime.
//!
//! This crate contains no compiler and no bytecode interpreter — it is the
//! substrate such a language sits on top of:
//!
//! - [`value`]: the tagged [`Value`] type and the heap-object structs
//!   (strings, arrays, tuples, tables, structs, functions, abstract types)
//!   it can point to.
//! - [`heap`]: the mark-and-sweep collector those allocations live under.
//! - [`fiber`]: resumable fibers (cooperative call stacks), their CSP
//!   channels, and condition-variable style synchronization.
//! - [`ev`]: the single-threaded event loop a host drives to turn I/O
//!   readiness and timers into fiber resumptions.
//! - [`marshal`]: the self-describing binary codec for serializing values,
//!   including cyclic graphs, across a wire or into storage.
//! - [`registry`]: the glue connecting host-provided C functions,
//!   polymorphic abstract types, and named values to the rest of the
//!   system.
//! - [`vm`]: [`Vm`], the context object bundling all of the above.
//!
//! ### Features
//!
//! - `threaded` — enables the cross-thread channel variant in
//!   [`fiber::channel`] used to hand marshaled values between independent
//!   VMs running on separate OS threads.
#![allow(clippy::let_and_return)]

pub mod error;
pub mod ev;
pub mod fiber;
pub mod funcdef;
pub mod heap;
pub mod log;
pub mod marshal;
pub mod registry;
pub mod value;
pub mod vm;

pub use error::{Error, Result};
pub use value::Value;
pub use vm::Vm;
