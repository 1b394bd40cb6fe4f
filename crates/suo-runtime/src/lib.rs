//! The Suo bootstrap runtime.
//!
//! Suo values are tagged 32-bit words living in a fixed-size heap with a
//! precise semi-space copying collector. On top of that sit the three
//! bootstrap components every lispish system needs: a reader, a writer,
//! and an evaluator, each written with an explicit heap-allocated frame
//! stack so that no input can make them eat the host call stack.
//!
//! The compiler (see the `suo-compiler` crate) runs as a client of this
//! runtime: its quoted literals live here, and its output is a closure
//! record in this heap.

pub mod boot;
pub mod eval;
pub mod heap;
pub mod reader;
pub mod value;
pub mod writer;

pub use boot::Runtime;
pub use heap::{Heap, Root, DEFAULT_SPACE_WORDS};
pub use value::Value;
