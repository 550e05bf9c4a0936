//! Disassembler / debug formatter for `dnx` binary images (§4.10 of the
//! design spec): a reduced-depth collaborator, not part of the VM's
//! correctness contract.
//!
//! [`disassemble`] is read-only and best-effort: a malformed instruction
//! stream produces an inline `<bad opcode 0xNN>` marker rather than aborting
//! the whole listing, because the point of a disassembler is debugging a
//! possibly-broken image, not validating one (that's the loader's job, in
//! `dnx_core::image`).

use std::fmt::Write as _;

use dnx_core::image::{BinaryImage, StringRef};
use dnx_core::opcode::{self, Opcode};

/// Produces a full human-readable listing of `image`: scene and function
/// tables first, then the decoded instruction stream, one line per
/// instruction, string/definition references resolved inline as comments.
pub fn disassemble(image: &BinaryImage) -> String {
    let mut out = String::new();
    write_symbol_table(&mut out, image, "scenes", &image.scenes);
    write_symbol_table(&mut out, image, "functions", &image.functions);
    write_definitions(&mut out, image);
    writeln!(out, "\n; -- instructions --").ok();
    write_instructions(&mut out, image);
    out
}

fn write_symbol_table(
    out: &mut String,
    image: &BinaryImage,
    label: &str,
    table: &hashbrown::HashMap<u32, Vec<i32>>,
) {
    if table.is_empty() {
        return;
    }
    writeln!(out, "; -- {label} --").ok();
    let mut entries: Vec<(&u32, &Vec<i32>)> = table.iter().collect();
    entries.sort_by_key(|(id, _)| **id);
    for (id, offsets) in entries {
        let name = image.symbol_name(*id).unwrap_or("<unknown>");
        let entry = offsets.first().copied().unwrap_or(-1);
        write!(out, "{name} (id {id}): entry={entry}").ok();
        if offsets.len() > 1 {
            write!(out, ", flags=[").ok();
            for (i, pair) in offsets[1..].chunks(2).enumerate() {
                if i > 0 {
                    write!(out, ", ").ok();
                }
                match pair {
                    [value_ip, name_ip] => write!(out, "(value@{value_ip}, name@{name_ip})").ok(),
                    [value_ip] => write!(out, "(value@{value_ip}, <missing name offset>)").ok(),
                    _ => None,
                };
            }
            write!(out, "]").ok();
        }
        writeln!(out).ok();
    }
    writeln!(out).ok();
}

fn write_definitions(out: &mut String, image: &BinaryImage) {
    if image.definitions.is_empty() {
        return;
    }
    writeln!(out, "; -- definitions --").ok();
    let mut entries: Vec<(&u32, &dnx_core::image::Definition)> = image.definitions.iter().collect();
    entries.sort_by_key(|(id, _)| **id);
    for (id, def) in entries {
        let name = image.symbol_name(*id).unwrap_or("<unknown>");
        let text = image.resolve_string_ref(def.resolve_ref()).unwrap_or("<missing>");
        let table = match def.resolve_ref() {
            StringRef::Internal(_) => "string_table",
            StringRef::Translation(_) => "translation_table",
        };
        write!(out, "{name} (id {id}): {table} = {text:?}").ok();
        match def.bytecode_offset {
            Some(offset) => writeln!(out, ", args@{offset}").ok(),
            None => writeln!(out).ok(),
        };
    }
    writeln!(out).ok();
}

fn write_instructions(out: &mut String, image: &BinaryImage) {
    let bytes = &image.instructions;
    let mut ip = 0usize;
    while ip < bytes.len() {
        match opcode::decode(bytes, ip) {
            Ok((op, next_ip)) => {
                writeln!(out, "{ip:>6}  {}", format_instruction(image, &op)).ok();
                ip = next_ip;
            }
            Err(fault) => {
                let byte = bytes.get(ip).copied().unwrap_or(0);
                writeln!(out, "{ip:>6}  <bad opcode 0x{byte:02x}> ({})", fault.error).ok();
                ip += 1;
            }
        }
    }
}

/// Renders one decoded instruction, resolving string/definition references
/// into inline comments so a developer can read dialogue content without
/// cross-referencing tables by hand.
fn format_instruction(image: &BinaryImage, op: &Opcode) -> String {
    let mnemonic = op.mnemonic();
    match *op {
        Opcode::PushString(id) => {
            format_operand_with_comment(mnemonic, id, image.translation_table.get(id as usize))
        }
        Opcode::PushBinaryString(id) => {
            format_operand_with_comment(mnemonic, id, image.string_table.get(id as usize))
        }
        Opcode::PushInterpolatedString(id, argc) => {
            let comment = image.translation_table.get(id as usize);
            format!("{mnemonic} {id}, {argc}{}", comment_suffix(comment))
        }
        Opcode::PushBinaryInterpolatedString(id, argc) => {
            let comment = image.string_table.get(id as usize);
            format!("{mnemonic} {id}, {argc}{}", comment_suffix(comment))
        }
        Opcode::CallExternal(id, argc) => {
            let comment = image.string_table.get(id as usize);
            format!("{mnemonic} {id}, {argc}{}", comment_suffix(comment))
        }
        Opcode::Call(id, argc) => format!("{mnemonic} {id}, {argc}"),
        Opcode::SetVarGlobal(id) | Opcode::PushVarGlobal(id) => {
            format_operand_with_comment(mnemonic, id, image.symbol_name(id as u32))
        }
        Opcode::FreeLocal(v)
        | Opcode::MakeArray(v)
        | Opcode::SetVarLocal(v)
        | Opcode::PushVarLocal(v)
        | Opcode::Jump(v)
        | Opcode::JumpTruthy(v)
        | Opcode::JumpFalsey(v)
        | Opcode::ChoiceAdd(v)
        | Opcode::ChoiceAddTruthy(v)
        | Opcode::ChooseAdd(v)
        | Opcode::ChooseAddTruthy(v)
        | Opcode::PushInt(v) => format!("{mnemonic} {v}"),
        Opcode::PushDouble(v) => format!("{mnemonic} {v}"),
        _ => mnemonic.to_string(),
    }
}

fn format_operand_with_comment(mnemonic: &str, id: i32, resolved: Option<&String>) -> String {
    format!("{mnemonic} {id}{}", comment_suffix(resolved))
}

fn comment_suffix(resolved: Option<&String>) -> String {
    match resolved {
        Some(s) => format!("  ; {s:?}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnx_core::image::Definition;
    use dnx_core::opcode::encode;
    use hashbrown::HashMap;

    fn sample() -> BinaryImage {
        let mut bytes = Vec::new();
        encode(Opcode::PushInt(3), &mut bytes);
        encode(Opcode::PushBinaryString(0), &mut bytes);
        encode(Opcode::TextRun, &mut bytes);
        encode(Opcode::Exit, &mut bytes);

        let mut scenes = HashMap::new();
        scenes.insert(0u32, vec![0]);
        let mut definitions = HashMap::new();
        definitions.insert(1u32, Definition { string_ref: 0, bytecode_offset: None });

        BinaryImage {
            string_table: vec!["main".to_string(), "hello".to_string()],
            translation_table: Vec::new(),
            translation_loaded: true,
            instructions: bytes,
            scenes,
            functions: HashMap::new(),
            definitions,
            external_functions: Vec::new(),
        }
    }

    #[test]
    fn lists_scenes_and_resolves_string_comments() {
        let text = disassemble(&sample());
        assert!(text.contains("main (id 0): entry=0"));
        assert!(text.contains("push.binary_string 0  ; \"main\""));
    }

    #[test]
    fn never_panics_on_a_truncated_instruction_stream() {
        let mut image = sample();
        image.instructions = vec![opcode::TAG_PUSH_INT, 0x01];
        let text = disassemble(&image);
        assert!(text.contains("<bad opcode"));
    }

    #[test]
    fn unknown_opcode_is_reported_inline_not_fatal() {
        let mut image = sample();
        image.instructions = vec![0xFF, 0x00];
        let text = disassemble(&image);
        assert!(text.contains("<bad opcode 0xff>"));
    }
}
