#![cfg_attr(not(any(feature = "std", test)), no_std)]

//! Interpreter core for the dnx dialogue VM: a stack-based bytecode machine
//! that drives narrative flow (dialogue lines, branching choices, weighted
//! random continuations, persistent flags, host calls) for game-style hosts.
//!
//! This crate is the hard engineering described by the project: opcode
//! dispatch, the value model, the call/flag/local-variable machinery, the
//! choice/choose state machine, the text-pause protocol and the binary image
//! loader. It builds `no_std + alloc` by default so it can be embedded in
//! constrained game runtimes; enable the `std` feature for
//! `std::error::Error` impls and file-based loading.

extern crate alloc;

#[allow(unused_imports)]
pub(crate) use alloc::{boxed::Box, format, string::String, string::ToString, vec, vec::Vec};

pub mod error;
pub mod host;
pub mod image;
pub mod interpolate;
pub mod opcode;
pub mod translation;
pub mod value;
pub mod vm;

pub use error::{LoadError, VmError};
pub use host::{ChanceCallback, FunctionRegistry, MapRegistry, WeightedCallback};
pub use image::BinaryImage;
pub use opcode::Opcode;
pub use value::Value;
pub use vm::Vm;
