//! The binary image: a parsed, (mostly) immutable on-disk program (§3, §4.8).
//!
//! `BinaryImage` is built once by [`parse`] and then shared read-only by the
//! VM, except for `translation_table`, which `Vm::load_translation_file`
//! (or [`BinaryImage::set_translation_table`] directly) may replace.

use hashbrown::HashMap;

use crate::error::LoadError;
use crate::{String, Vec};

const SIGNATURE: &[u8; 3] = b"DNX";
const SUPPORTED_VERSION: u8 = 1;

const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_INTERNAL_TRANSLATION: u8 = 0x02;

/// High bit of a definition's `string_ref`: set ⇒ index into
/// `translation_table`, clear ⇒ index into `string_table` (§3).
const TRANSLATION_TAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub string_ref: u32,
    pub bytecode_offset: Option<i32>,
}

impl Definition {
    /// Decodes `string_ref` into which table it points at, and the index
    /// within that table (§3, §4.7).
    pub fn resolve_ref(&self) -> StringRef {
        if self.string_ref & TRANSLATION_TAG != 0 {
            StringRef::Translation((self.string_ref & !TRANSLATION_TAG) as usize)
        } else {
            StringRef::Internal(self.string_ref as usize)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringRef {
    Internal(usize),
    Translation(usize),
}

/// The deserialized form of a compiled dialogue program; the VM's sole input.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryImage {
    pub string_table: Vec<String>,
    pub translation_table: Vec<String>,
    pub translation_loaded: bool,
    pub instructions: Vec<u8>,
    pub scenes: HashMap<u32, Vec<i32>>,
    pub functions: HashMap<u32, Vec<i32>>,
    pub definitions: HashMap<u32, Definition>,
    pub external_functions: Vec<u32>,
}

impl BinaryImage {
    /// Symbol IDs in `scenes`/`functions`/`definitions` are indices into
    /// `string_table` (§3: the internal string table holds "symbol names,
    /// external-function names, binary string literals"). This resolves a
    /// human-readable name to its symbol ID by linear scan, which is fine for
    /// the handful of lookups `run_scene`/disassembly perform per call.
    pub fn symbol_id(&self, name: &str) -> Option<u32> {
        self.string_table
            .iter()
            .position(|s| s == name)
            .map(|i| i as u32)
    }

    pub fn symbol_name(&self, id: u32) -> Option<&str> {
        self.string_table.get(id as usize).map(String::as_str)
    }

    pub fn scene_offsets(&self, name: &str) -> Option<&Vec<i32>> {
        let id = self.symbol_id(name)?;
        self.scenes.get(&id)
    }

    pub fn function_offsets_by_id(&self, id: u32) -> Option<&Vec<i32>> {
        self.functions.get(&id)
    }

    pub fn resolve_string_ref(&self, r: StringRef) -> Option<&str> {
        match r {
            StringRef::Internal(i) => self.string_table.get(i).map(String::as_str),
            StringRef::Translation(i) => self.translation_table.get(i).map(String::as_str),
        }
    }

    /// Replaces `translation_table` wholesale (§4.9) and marks translations
    /// as loaded. Callers (`Vm::load_translation_file`) are responsible for
    /// refusing this while a scene is live (§5) and for invalidating any
    /// definition cache.
    pub fn set_translation_table(&mut self, entries: Vec<String>) {
        self.translation_table = entries;
        self.translation_loaded = true;
    }

    /// Serializes back to the uncompressed wire format (§4.8), used by the
    /// round-trip property test and by tooling. The VM never calls this.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_u32(&mut body, self.scenes.len() as u32);
        for (id, offsets) in sorted(&self.scenes) {
            write_u32(&mut body, id);
            write_u16(&mut body, offsets.len() as u16);
            for o in offsets {
                write_i32(&mut body, o);
            }
        }
        write_u32(&mut body, self.functions.len() as u32);
        for (id, offsets) in sorted(&self.functions) {
            write_u32(&mut body, id);
            write_u16(&mut body, offsets.len() as u16);
            for o in offsets {
                write_i32(&mut body, o);
            }
        }
        write_u32(&mut body, self.definitions.len() as u32);
        let mut defs: Vec<(&u32, &Definition)> = self.definitions.iter().collect();
        defs.sort_by_key(|(id, _)| **id);
        for (id, def) in defs {
            write_u32(&mut body, *id);
            write_u32(&mut body, def.string_ref);
            write_i32(&mut body, def.bytecode_offset.unwrap_or(-1));
        }
        write_u32(&mut body, self.instructions.len() as u32);
        body.extend_from_slice(&self.instructions);
        write_u32(&mut body, self.string_table.len() as u32);
        for s in &self.string_table {
            body.extend_from_slice(s.as_bytes());
            body.push(0);
        }
        write_u32(&mut body, self.translation_table.len() as u32);
        for s in &self.translation_table {
            body.extend_from_slice(s.as_bytes());
            body.push(0);
        }
        write_u32(&mut body, self.external_functions.len() as u32);
        for id in &self.external_functions {
            write_u32(&mut body, *id);
        }

        let mut out = Vec::new();
        out.extend_from_slice(SIGNATURE);
        out.push(SUPPORTED_VERSION);
        let flags = if self.translation_loaded { FLAG_INTERNAL_TRANSLATION } else { 0 };
        out.push(flags);
        write_u32(&mut out, body.len() as u32);
        out.extend_from_slice(&body);
        out
    }
}

fn sorted(map: &HashMap<u32, Vec<i32>>) -> Vec<(u32, &Vec<i32>)> {
    let mut v: Vec<(u32, &Vec<i32>)> = map.iter().map(|(k, v)| (*k, v)).collect();
    v.sort_by_key(|(k, _)| *k);
    v
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn write_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// A cursor over the byte stream with bounds-checked reads (§4.8): every
/// truncation becomes a `LoadError::Truncated`, never a panic.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + n)
            .ok_or(LoadError::Truncated { wanted: n, have: self.bytes.len().saturating_sub(self.pos) })?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, LoadError> {
        Ok(self.u32()? as i32)
    }

    fn cstr(&mut self) -> Result<String, LoadError> {
        let start = self.pos;
        loop {
            let b = self.u8()?;
            if b == 0 {
                break;
            }
        }
        let raw = &self.bytes[start..self.pos - 1];
        core::str::from_utf8(raw)
            .map(String::from)
            .map_err(|_| LoadError::InvalidUtf8)
    }
}

/// Parses a complete `.dnx` binary image (§4.8).
pub fn parse(bytes: &[u8]) -> Result<BinaryImage, LoadError> {
    let mut cursor = Cursor::new(bytes);
    let sig = cursor.take(3)?;
    if sig != SIGNATURE {
        return Err(LoadError::BadSignature);
    }
    let version = cursor.u8()?;
    if version != SUPPORTED_VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }
    let flags = cursor.u8()?;
    let compressed = flags & FLAG_COMPRESSED != 0;
    let has_internal_translation = flags & FLAG_INTERNAL_TRANSLATION != 0;

    let body: Vec<u8> = if compressed {
        let decomp_size = cursor.u32()? as usize;
        let comp_size = cursor.u32()? as usize;
        let comp_bytes = cursor.take(comp_size)?;
        // Raw DEFLATE payload prefixed by a 2-byte zlib header we must skip.
        let raw = comp_bytes.get(2..).ok_or(LoadError::InvalidCompression)?;
        let decompressed =
            miniz_oxide::inflate::decompress_to_vec(raw).map_err(|_| LoadError::InvalidCompression)?;
        if decompressed.len() != decomp_size {
            return Err(LoadError::InvalidCompression);
        }
        decompressed
    } else {
        let size = cursor.u32()? as usize;
        cursor.take(size)?.to_vec()
    };

    parse_body(&body, has_internal_translation)
}

fn parse_body(body: &[u8], has_internal_translation: bool) -> Result<BinaryImage, LoadError> {
    let mut c = Cursor::new(body);

    let scenes = parse_symbol_table(&mut c)?;
    let functions = parse_symbol_table(&mut c)?;

    let definition_count = c.u32()?;
    let mut definitions = HashMap::new();
    for _ in 0..definition_count {
        let symbol_id = c.u32()?;
        let string_ref = c.u32()?;
        let bytecode_offset = c.i32()?;
        definitions.insert(
            symbol_id,
            Definition {
                string_ref,
                bytecode_offset: if bytecode_offset < 0 { None } else { Some(bytecode_offset) },
            },
        );
    }

    let bytecode_bytes = c.u32()? as usize;
    let instructions = c.take(bytecode_bytes)?.to_vec();

    let internal_string_count = c.u32()?;
    let mut string_table = Vec::with_capacity(internal_string_count as usize);
    for _ in 0..internal_string_count {
        string_table.push(c.cstr()?);
    }

    let translation_string_count = c.u32()?;
    let mut translation_table = Vec::with_capacity(translation_string_count as usize);
    for _ in 0..translation_string_count {
        translation_table.push(c.cstr()?);
    }

    let external_function_count = c.u32()?;
    let mut external_functions = Vec::with_capacity(external_function_count as usize);
    for _ in 0..external_function_count {
        external_functions.push(c.u32()?);
    }

    Ok(BinaryImage {
        string_table,
        translation_table,
        translation_loaded: has_internal_translation,
        instructions,
        scenes,
        functions,
        definitions,
        external_functions,
    })
}

fn parse_symbol_table(c: &mut Cursor<'_>) -> Result<HashMap<u32, Vec<i32>>, LoadError> {
    let count = c.u32()?;
    let mut table = HashMap::new();
    for _ in 0..count {
        let symbol_id = c.u32()?;
        let offset_count = c.u16()?;
        let mut offsets = Vec::with_capacity(offset_count as usize);
        for _ in 0..offset_count {
            offsets.push(c.i32()?);
        }
        table.insert(symbol_id, offsets);
    }
    Ok(table)
}

#[cfg(feature = "std")]
pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<BinaryImage, LoadError> {
    let bytes = std::fs::read(path).map_err(|_| LoadError::Truncated { wanted: 0, have: 0 })?;
    parse(&bytes)
}
