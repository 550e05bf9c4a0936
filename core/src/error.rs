//! Error taxonomy (§7): `LoadError` for binary-image parsing failures,
//! `VmError` for everything that can go wrong once the VM is running.
//!
//! Both carry manual `Display` impls so the core stays `no_std`-friendly;
//! `std::error::Error` is implemented only behind the `std` feature, mirroring
//! how the rest of this crate gates std-only capability.

use core::fmt;

use crate::String;

/// Failures while parsing a binary image (§4.8).
#[derive(Debug, Clone, PartialEq)]
pub enum LoadError {
    BadSignature,
    UnsupportedVersion(u8),
    Truncated { wanted: usize, have: usize },
    InvalidCompression,
    InvalidUtf8,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::BadSignature => write!(f, "binary image: bad signature, expected \"DNX\""),
            LoadError::UnsupportedVersion(v) => {
                write!(f, "binary image: unsupported version byte {v}")
            }
            LoadError::Truncated { wanted, have } => write!(
                f,
                "binary image: truncated stream, wanted {wanted} bytes but only {have} remain"
            ),
            LoadError::InvalidCompression => {
                write!(f, "binary image: DEFLATE payload failed to decompress")
            }
            LoadError::InvalidUtf8 => write!(f, "binary image: string table entry is not valid UTF-8"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LoadError {}

/// Runtime failures (§7). Every variant names the opcode and `ip` at which
/// the failure occurred so host logs can pinpoint the offending instruction
/// without a debugger.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Operator applied to tags it doesn't support (e.g. `+` on array+int).
    Type { op: String, lhs: String, rhs: String },
    /// Integer division or modulo by zero.
    DivideByZero,
    /// Unknown scene/function/definition/external-function name.
    Lookup { kind: LookupKind, name: String },
    /// Array/choice/local index out of range.
    Bounds { what: &'static str, index: i64, len: usize },
    /// Choice/choose state machine used out of sequence, or a chance/weighted
    /// callback returned an invalid selection.
    State(&'static str),
    /// An external function invoked through the host registry returned an
    /// error of its own.
    Host(String),
    /// The decoded opcode byte does not correspond to any known instruction.
    BadOpcode { ip: usize, byte: u8 },
    /// Dialogue opcode executed while `translation_loaded == false`.
    TranslationNotLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Scene,
    Function,
    Definition,
    ExternalFunction,
    Flag,
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LookupKind::Scene => "scene",
            LookupKind::Function => "function",
            LookupKind::Definition => "definition",
            LookupKind::ExternalFunction => "external function",
            LookupKind::Flag => "flag",
        };
        write!(f, "{s}")
    }
}

impl VmError {
    pub fn type_mismatch(op: &str, lhs: &str, rhs: &str) -> VmError {
        VmError::Type {
            op: op.into(),
            lhs: lhs.into(),
            rhs: rhs.into(),
        }
    }

    pub fn lookup(kind: LookupKind, name: impl Into<String>) -> VmError {
        VmError::Lookup { kind, name: name.into() }
    }

    pub fn bounds(what: &'static str, index: i64, len: usize) -> VmError {
        VmError::Bounds { what, index, len }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Type { op, lhs, rhs } => {
                write!(f, "type error: `{op}` does not support {lhs} and {rhs}")
            }
            VmError::DivideByZero => write!(f, "division by zero"),
            VmError::Lookup { kind, name } => write!(f, "unknown {kind} \"{name}\""),
            VmError::Bounds { what, index, len } => {
                write!(f, "{what} index {index} out of bounds (len {len})")
            }
            VmError::State(msg) => write!(f, "invalid VM state: {msg}"),
            VmError::Host(msg) => write!(f, "host function error: {msg}"),
            VmError::BadOpcode { ip, byte } => {
                write!(f, "bad opcode 0x{byte:02x} at ip {ip}")
            }
            VmError::TranslationNotLoaded => {
                write!(f, "dialogue opcode executed before a translation table was loaded")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for VmError {}

/// A `VmError` annotated with where it happened. `update()` and every
/// sub-execution driver return `Result<_, Fault>` so a failure message
/// always identifies the offending opcode and `ip`, per §7.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub ip: usize,
    pub opcode: &'static str,
    pub error: VmError,
}

impl Fault {
    pub fn new(ip: usize, opcode: &'static str, error: VmError) -> Fault {
        Fault { ip, opcode, error }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (opcode {} at ip {})", self.error, self.opcode, self.ip)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Fault {}

/// Failures from the save-state supplement (`Vm::save_flags` / `load_flags`,
/// `save_globals` / `load_globals`): postcard encode/decode errors, kept
/// separate from [`VmError`] because they belong to host persistence, not
/// scene execution.
#[cfg(feature = "serde")]
#[derive(Debug)]
pub enum SaveError {
    Encode(postcard::Error),
    Decode(postcard::Error),
}

#[cfg(feature = "serde")]
impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveError::Encode(e) => write!(f, "failed to encode save data: {e}"),
            SaveError::Decode(e) => write!(f, "failed to decode save data: {e}"),
        }
    }
}

#[cfg(all(feature = "serde", feature = "std"))]
impl std::error::Error for SaveError {}
