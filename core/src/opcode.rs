//! The instruction set and its decoder (§4.1).
//!
//! Every instruction is a one-byte tag followed by 0, 4, 8 or 12 operand
//! bytes (one or two little-endian `i32`s, or one little-endian `f64`).
//! `decode` reads exactly one instruction starting at a byte offset and
//! returns the decoded `Opcode` together with the offset of the first byte
//! *after* the operand — callers must treat that offset, not the opcode's own
//! address, as the base for relative jump targets (§4.1).

use crate::error::{Fault, VmError};

macro_rules! tags {
    ($($name:ident = $value:expr),* $(,)?) => {
        $(pub const $name: u8 = $value;)*
    };
}

tags! {
    TAG_NOP = 0x00,
    TAG_SAVE = 0x01,
    TAG_LOAD = 0x02,
    TAG_PUSH_UNDEFINED = 0x03,
    TAG_PUSH_ARRAY_INDEX = 0x04,
    TAG_SET_ARRAY_INDEX = 0x05,
    TAG_POP = 0x06,
    TAG_DUPLICATE = 0x07,
    TAG_DUPLICATE2 = 0x08,
    TAG_ADDITION = 0x09,
    TAG_SUBTRACTION = 0x0A,
    TAG_MULTIPLY = 0x0B,
    TAG_DIVIDE = 0x0C,
    TAG_MODULO = 0x0D,
    TAG_NEGATE = 0x0E,
    TAG_INVERT = 0x0F,
    TAG_BIT_LEFT_SHIFT = 0x10,
    TAG_BIT_RIGHT_SHIFT = 0x11,
    TAG_BIT_AND = 0x12,
    TAG_BIT_OR = 0x13,
    TAG_BIT_XOR = 0x14,
    TAG_BIT_NEGATE = 0x15,
    TAG_POWER = 0x16,
    TAG_COMPARE_EQ = 0x17,
    TAG_COMPARE_GT = 0x18,
    TAG_COMPARE_LT = 0x19,
    TAG_COMPARE_GTE = 0x1A,
    TAG_COMPARE_LTE = 0x1B,
    TAG_COMPARE_NEQ = 0x1C,
    TAG_EXIT = 0x1D,
    TAG_RETURN = 0x1E,
    TAG_CHOICE_BEGIN = 0x1F,
    TAG_CHOICE_SELECT = 0x20,
    TAG_CHOOSE_SEL = 0x21,
    TAG_TEXT_RUN = 0x22,

    TAG_FREE_LOCAL = 0x40,
    TAG_PUSH_INT = 0x41,
    TAG_PUSH_STRING = 0x42,
    TAG_PUSH_BINARY_STRING = 0x43,
    TAG_MAKE_ARRAY = 0x44,
    TAG_SET_VAR_GLOBAL = 0x45,
    TAG_SET_VAR_LOCAL = 0x46,
    TAG_PUSH_VAR_GLOBAL = 0x47,
    TAG_PUSH_VAR_LOCAL = 0x48,
    TAG_JUMP = 0x49,
    TAG_JUMP_TRUTHY = 0x4A,
    TAG_JUMP_FALSEY = 0x4B,
    TAG_CHOICE_ADD = 0x4C,
    TAG_CHOICE_ADD_TRUTHY = 0x4D,
    TAG_CHOOSE_ADD = 0x4E,
    TAG_CHOOSE_ADD_TRUTHY = 0x4F,

    TAG_PUSH_INTERPOLATED_STRING = 0x60,
    TAG_PUSH_BINARY_INTERPOLATED_STRING = 0x61,
    TAG_CALL = 0x62,
    TAG_CALL_EXTERNAL = 0x63,

    TAG_PUSH_DOUBLE = 0x70,
}

/// A single decoded VM instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Opcode {
    Nop,
    Save,
    Load,
    PushUndefined,
    PushArrayIndex,
    SetArrayIndex,
    Pop,
    Duplicate,
    Duplicate2,
    Addition,
    Subtraction,
    Multiply,
    Divide,
    Modulo,
    Negate,
    Invert,
    BitLeftShift,
    BitRightShift,
    BitAnd,
    BitOr,
    BitXor,
    BitNegate,
    Power,
    CompareEq,
    CompareGt,
    CompareLt,
    CompareGte,
    CompareLte,
    CompareNeq,
    Exit,
    Return,
    ChoiceBegin,
    ChoiceSelect,
    ChooseSel,
    TextRun,

    FreeLocal(i32),
    PushInt(i32),
    PushString(i32),
    PushBinaryString(i32),
    MakeArray(i32),
    SetVarGlobal(i32),
    SetVarLocal(i32),
    PushVarGlobal(i32),
    PushVarLocal(i32),
    Jump(i32),
    JumpTruthy(i32),
    JumpFalsey(i32),
    ChoiceAdd(i32),
    ChoiceAddTruthy(i32),
    ChooseAdd(i32),
    ChooseAddTruthy(i32),

    PushInterpolatedString(i32, i32),
    PushBinaryInterpolatedString(i32, i32),
    Call(i32, i32),
    CallExternal(i32, i32),

    PushDouble(f64),
}

impl Opcode {
    /// Mnemonic used by the disassembler and by error/trace messages.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Save => "save",
            Opcode::Load => "load",
            Opcode::PushUndefined => "push.undefined",
            Opcode::PushArrayIndex => "push.array_index",
            Opcode::SetArrayIndex => "set.array_index",
            Opcode::Pop => "pop",
            Opcode::Duplicate => "dup",
            Opcode::Duplicate2 => "dup2",
            Opcode::Addition => "add",
            Opcode::Subtraction => "sub",
            Opcode::Multiply => "mul",
            Opcode::Divide => "div",
            Opcode::Modulo => "mod",
            Opcode::Negate => "neg",
            Opcode::Invert => "invert",
            Opcode::BitLeftShift => "shl",
            Opcode::BitRightShift => "shr",
            Opcode::BitAnd => "bit_and",
            Opcode::BitOr => "bit_or",
            Opcode::BitXor => "bit_xor",
            Opcode::BitNegate => "bit_not",
            Opcode::Power => "pow",
            Opcode::CompareEq => "cmp.eq",
            Opcode::CompareGt => "cmp.gt",
            Opcode::CompareLt => "cmp.lt",
            Opcode::CompareGte => "cmp.gte",
            Opcode::CompareLte => "cmp.lte",
            Opcode::CompareNeq => "cmp.neq",
            Opcode::Exit => "exit",
            Opcode::Return => "return",
            Opcode::ChoiceBegin => "choice.begin",
            Opcode::ChoiceSelect => "choice.select",
            Opcode::ChooseSel => "choose.sel",
            Opcode::TextRun => "text.run",
            Opcode::FreeLocal(_) => "free_local",
            Opcode::PushInt(_) => "push.int",
            Opcode::PushString(_) => "push.string",
            Opcode::PushBinaryString(_) => "push.binary_string",
            Opcode::MakeArray(_) => "make_array",
            Opcode::SetVarGlobal(_) => "set.global",
            Opcode::SetVarLocal(_) => "set.local",
            Opcode::PushVarGlobal(_) => "push.global",
            Opcode::PushVarLocal(_) => "push.local",
            Opcode::Jump(_) => "jump",
            Opcode::JumpTruthy(_) => "jump.truthy",
            Opcode::JumpFalsey(_) => "jump.falsey",
            Opcode::ChoiceAdd(_) => "choice.add",
            Opcode::ChoiceAddTruthy(_) => "choice.add_truthy",
            Opcode::ChooseAdd(_) => "choose.add",
            Opcode::ChooseAddTruthy(_) => "choose.add_truthy",
            Opcode::PushInterpolatedString(_, _) => "push.interpolated_string",
            Opcode::PushBinaryInterpolatedString(_, _) => "push.binary_interpolated_string",
            Opcode::Call(_, _) => "call",
            Opcode::CallExternal(_, _) => "call.external",
            Opcode::PushDouble(_) => "push.double",
        }
    }
}

#[inline]
fn read_i32(bytes: &[u8], at: usize) -> Result<i32, Fault> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| Fault::new(at, "<operand>", VmError::Bounds { what: "instruction stream", index: at as i64, len: bytes.len() }))?;
    Ok(i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

#[inline]
fn read_f64(bytes: &[u8], at: usize) -> Result<f64, Fault> {
    let slice = bytes
        .get(at..at + 8)
        .ok_or_else(|| Fault::new(at, "<operand>", VmError::Bounds { what: "instruction stream", index: at as i64, len: bytes.len() }))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(f64::from_le_bytes(buf))
}

/// Decodes exactly one instruction at byte offset `ip`.
///
/// Returns the opcode and the offset of the first byte after its operand(s) —
/// jump targets in §4.1 are relative to *that* offset, never to `ip` itself.
pub fn decode(bytes: &[u8], ip: usize) -> Result<(Opcode, usize), Fault> {
    let tag = *bytes
        .get(ip)
        .ok_or_else(|| Fault::new(ip, "<eof>", VmError::Bounds { what: "instruction stream", index: ip as i64, len: bytes.len() }))?;
    let after_tag = ip + 1;

    macro_rules! no_operand {
        ($op:expr) => {
            Ok(($op, after_tag))
        };
    }
    macro_rules! one_i32 {
        ($ctor:expr) => {{
            let v = read_i32(bytes, after_tag)?;
            Ok(($ctor(v), after_tag + 4))
        }};
    }
    macro_rules! two_i32 {
        ($ctor:expr) => {{
            let a = read_i32(bytes, after_tag)?;
            let b = read_i32(bytes, after_tag + 4)?;
            Ok(($ctor(a, b), after_tag + 8))
        }};
    }

    match tag {
        TAG_NOP => no_operand!(Opcode::Nop),
        TAG_SAVE => no_operand!(Opcode::Save),
        TAG_LOAD => no_operand!(Opcode::Load),
        TAG_PUSH_UNDEFINED => no_operand!(Opcode::PushUndefined),
        TAG_PUSH_ARRAY_INDEX => no_operand!(Opcode::PushArrayIndex),
        TAG_SET_ARRAY_INDEX => no_operand!(Opcode::SetArrayIndex),
        TAG_POP => no_operand!(Opcode::Pop),
        TAG_DUPLICATE => no_operand!(Opcode::Duplicate),
        TAG_DUPLICATE2 => no_operand!(Opcode::Duplicate2),
        TAG_ADDITION => no_operand!(Opcode::Addition),
        TAG_SUBTRACTION => no_operand!(Opcode::Subtraction),
        TAG_MULTIPLY => no_operand!(Opcode::Multiply),
        TAG_DIVIDE => no_operand!(Opcode::Divide),
        TAG_MODULO => no_operand!(Opcode::Modulo),
        TAG_NEGATE => no_operand!(Opcode::Negate),
        TAG_INVERT => no_operand!(Opcode::Invert),
        TAG_BIT_LEFT_SHIFT => no_operand!(Opcode::BitLeftShift),
        TAG_BIT_RIGHT_SHIFT => no_operand!(Opcode::BitRightShift),
        TAG_BIT_AND => no_operand!(Opcode::BitAnd),
        TAG_BIT_OR => no_operand!(Opcode::BitOr),
        TAG_BIT_XOR => no_operand!(Opcode::BitXor),
        TAG_BIT_NEGATE => no_operand!(Opcode::BitNegate),
        TAG_POWER => no_operand!(Opcode::Power),
        TAG_COMPARE_EQ => no_operand!(Opcode::CompareEq),
        TAG_COMPARE_GT => no_operand!(Opcode::CompareGt),
        TAG_COMPARE_LT => no_operand!(Opcode::CompareLt),
        TAG_COMPARE_GTE => no_operand!(Opcode::CompareGte),
        TAG_COMPARE_LTE => no_operand!(Opcode::CompareLte),
        TAG_COMPARE_NEQ => no_operand!(Opcode::CompareNeq),
        TAG_EXIT => no_operand!(Opcode::Exit),
        TAG_RETURN => no_operand!(Opcode::Return),
        TAG_CHOICE_BEGIN => no_operand!(Opcode::ChoiceBegin),
        TAG_CHOICE_SELECT => no_operand!(Opcode::ChoiceSelect),
        TAG_CHOOSE_SEL => no_operand!(Opcode::ChooseSel),
        TAG_TEXT_RUN => no_operand!(Opcode::TextRun),

        TAG_FREE_LOCAL => one_i32!(Opcode::FreeLocal),
        TAG_PUSH_INT => one_i32!(Opcode::PushInt),
        TAG_PUSH_STRING => one_i32!(Opcode::PushString),
        TAG_PUSH_BINARY_STRING => one_i32!(Opcode::PushBinaryString),
        TAG_MAKE_ARRAY => one_i32!(Opcode::MakeArray),
        TAG_SET_VAR_GLOBAL => one_i32!(Opcode::SetVarGlobal),
        TAG_SET_VAR_LOCAL => one_i32!(Opcode::SetVarLocal),
        TAG_PUSH_VAR_GLOBAL => one_i32!(Opcode::PushVarGlobal),
        TAG_PUSH_VAR_LOCAL => one_i32!(Opcode::PushVarLocal),
        TAG_JUMP => one_i32!(Opcode::Jump),
        TAG_JUMP_TRUTHY => one_i32!(Opcode::JumpTruthy),
        TAG_JUMP_FALSEY => one_i32!(Opcode::JumpFalsey),
        TAG_CHOICE_ADD => one_i32!(Opcode::ChoiceAdd),
        TAG_CHOICE_ADD_TRUTHY => one_i32!(Opcode::ChoiceAddTruthy),
        TAG_CHOOSE_ADD => one_i32!(Opcode::ChooseAdd),
        TAG_CHOOSE_ADD_TRUTHY => one_i32!(Opcode::ChooseAddTruthy),

        TAG_PUSH_INTERPOLATED_STRING => two_i32!(Opcode::PushInterpolatedString),
        TAG_PUSH_BINARY_INTERPOLATED_STRING => two_i32!(Opcode::PushBinaryInterpolatedString),
        TAG_CALL => two_i32!(Opcode::Call),
        TAG_CALL_EXTERNAL => two_i32!(Opcode::CallExternal),

        TAG_PUSH_DOUBLE => {
            let v = read_f64(bytes, after_tag)?;
            Ok((Opcode::PushDouble(v), after_tag + 8))
        }

        other => Err(Fault::new(ip, "<unknown>", VmError::BadOpcode { ip, byte: other })),
    }
}

/// Encodes one instruction, appending its bytes to `out`. Used by the test
/// suite and by tooling that synthesizes `.dnx` images; the VM itself never
/// encodes, only decodes.
pub fn encode(op: Opcode, out: &mut crate::Vec<u8>) {
    macro_rules! push_i32 {
        ($v:expr) => {
            out.extend_from_slice(&$v.to_le_bytes())
        };
    }
    match op {
        Opcode::Nop => out.push(TAG_NOP),
        Opcode::Save => out.push(TAG_SAVE),
        Opcode::Load => out.push(TAG_LOAD),
        Opcode::PushUndefined => out.push(TAG_PUSH_UNDEFINED),
        Opcode::PushArrayIndex => out.push(TAG_PUSH_ARRAY_INDEX),
        Opcode::SetArrayIndex => out.push(TAG_SET_ARRAY_INDEX),
        Opcode::Pop => out.push(TAG_POP),
        Opcode::Duplicate => out.push(TAG_DUPLICATE),
        Opcode::Duplicate2 => out.push(TAG_DUPLICATE2),
        Opcode::Addition => out.push(TAG_ADDITION),
        Opcode::Subtraction => out.push(TAG_SUBTRACTION),
        Opcode::Multiply => out.push(TAG_MULTIPLY),
        Opcode::Divide => out.push(TAG_DIVIDE),
        Opcode::Modulo => out.push(TAG_MODULO),
        Opcode::Negate => out.push(TAG_NEGATE),
        Opcode::Invert => out.push(TAG_INVERT),
        Opcode::BitLeftShift => out.push(TAG_BIT_LEFT_SHIFT),
        Opcode::BitRightShift => out.push(TAG_BIT_RIGHT_SHIFT),
        Opcode::BitAnd => out.push(TAG_BIT_AND),
        Opcode::BitOr => out.push(TAG_BIT_OR),
        Opcode::BitXor => out.push(TAG_BIT_XOR),
        Opcode::BitNegate => out.push(TAG_BIT_NEGATE),
        Opcode::Power => out.push(TAG_POWER),
        Opcode::CompareEq => out.push(TAG_COMPARE_EQ),
        Opcode::CompareGt => out.push(TAG_COMPARE_GT),
        Opcode::CompareLt => out.push(TAG_COMPARE_LT),
        Opcode::CompareGte => out.push(TAG_COMPARE_GTE),
        Opcode::CompareLte => out.push(TAG_COMPARE_LTE),
        Opcode::CompareNeq => out.push(TAG_COMPARE_NEQ),
        Opcode::Exit => out.push(TAG_EXIT),
        Opcode::Return => out.push(TAG_RETURN),
        Opcode::ChoiceBegin => out.push(TAG_CHOICE_BEGIN),
        Opcode::ChoiceSelect => out.push(TAG_CHOICE_SELECT),
        Opcode::ChooseSel => out.push(TAG_CHOOSE_SEL),
        Opcode::TextRun => out.push(TAG_TEXT_RUN),

        Opcode::FreeLocal(v) => { out.push(TAG_FREE_LOCAL); push_i32!(v); }
        Opcode::PushInt(v) => { out.push(TAG_PUSH_INT); push_i32!(v); }
        Opcode::PushString(v) => { out.push(TAG_PUSH_STRING); push_i32!(v); }
        Opcode::PushBinaryString(v) => { out.push(TAG_PUSH_BINARY_STRING); push_i32!(v); }
        Opcode::MakeArray(v) => { out.push(TAG_MAKE_ARRAY); push_i32!(v); }
        Opcode::SetVarGlobal(v) => { out.push(TAG_SET_VAR_GLOBAL); push_i32!(v); }
        Opcode::SetVarLocal(v) => { out.push(TAG_SET_VAR_LOCAL); push_i32!(v); }
        Opcode::PushVarGlobal(v) => { out.push(TAG_PUSH_VAR_GLOBAL); push_i32!(v); }
        Opcode::PushVarLocal(v) => { out.push(TAG_PUSH_VAR_LOCAL); push_i32!(v); }
        Opcode::Jump(v) => { out.push(TAG_JUMP); push_i32!(v); }
        Opcode::JumpTruthy(v) => { out.push(TAG_JUMP_TRUTHY); push_i32!(v); }
        Opcode::JumpFalsey(v) => { out.push(TAG_JUMP_FALSEY); push_i32!(v); }
        Opcode::ChoiceAdd(v) => { out.push(TAG_CHOICE_ADD); push_i32!(v); }
        Opcode::ChoiceAddTruthy(v) => { out.push(TAG_CHOICE_ADD_TRUTHY); push_i32!(v); }
        Opcode::ChooseAdd(v) => { out.push(TAG_CHOOSE_ADD); push_i32!(v); }
        Opcode::ChooseAddTruthy(v) => { out.push(TAG_CHOOSE_ADD_TRUTHY); push_i32!(v); }

        Opcode::PushInterpolatedString(a, b) => { out.push(TAG_PUSH_INTERPOLATED_STRING); push_i32!(a); push_i32!(b); }
        Opcode::PushBinaryInterpolatedString(a, b) => { out.push(TAG_PUSH_BINARY_INTERPOLATED_STRING); push_i32!(a); push_i32!(b); }
        Opcode::Call(a, b) => { out.push(TAG_CALL); push_i32!(a); push_i32!(b); }
        Opcode::CallExternal(a, b) => { out.push(TAG_CALL_EXTERNAL); push_i32!(a); push_i32!(b); }

        Opcode::PushDouble(v) => { out.push(TAG_PUSH_DOUBLE); out.extend_from_slice(&v.to_le_bytes()); }
    }
}
