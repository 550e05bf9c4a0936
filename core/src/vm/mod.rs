//! The execution core (§4.2–§4.5): opcode dispatch, the flag preamble, and
//! the choice/choose state machine, built on the value model, image loader
//! and host bridge the rest of this crate provides.

mod frame;
mod locals;
mod runtime;
mod stack;

pub use runtime::{ChoiceOption, ChoiceState, Vm};
