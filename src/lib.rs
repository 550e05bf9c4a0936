#![cfg_attr(not(any(feature = "std", test)), no_std)]

//! `dnx`: the host-facing facade over [`dnx_core`], the dialogue VM's
//! interpreter core.
//!
//! Hosts that just want to load a binary image and drive a [`Vm`] can depend
//! on this crate alone — it re-exports the core's public surface and adds a
//! single combined [`EngineError`] spanning both "load an image" and "run a
//! scene" failures, so host integration code can use `?` across the whole
//! lifecycle without matching on two different error enums. Enable the
//! `disasm` feature to pull in [`dnx_fmt`]'s disassembler as well.

extern crate alloc;

pub use dnx_core::{
    ChanceCallback, FunctionRegistry, LoadError, MapRegistry, Opcode, Value, Vm, VmError,
};
pub use dnx_core::error::Fault;
pub use dnx_core::host::{DefaultRandom, SharedRandom, WeightedCallback};
pub use dnx_core::image::BinaryImage;

#[cfg(feature = "disasm")]
pub use dnx_fmt as fmt;

/// A single error type spanning the two phases of a dialogue VM's lifetime:
/// loading a [`BinaryImage`] and then running it. Host code that wants one
/// `?`-friendly error across both phases (rather than matching `LoadError`
/// and `Fault` separately) can use this instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to load binary image: {0}")]
    Load(#[from] LoadError),
    #[error("VM execution failed: {0}")]
    Run(#[from] Fault),
}

/// Parses a `.dnx` binary image from bytes already in memory.
pub fn load(bytes: &[u8]) -> Result<BinaryImage, EngineError> {
    dnx_core::image::parse(bytes).map_err(EngineError::from)
}

/// Parses a `.dnx` binary image from a path on disk. Requires the `std`
/// feature, matching how the rest of this crate gates file I/O.
#[cfg(feature = "std")]
pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<BinaryImage, EngineError> {
    dnx_core::image::load_from_path(path).map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_converts_into_engine_error() {
        let err = load(b"DN").unwrap_err();
        assert!(matches!(err, EngineError::Load(LoadError::Truncated { .. })));
    }
}
