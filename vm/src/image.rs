//! Persisted bytecode images.
//!
//! Little-endian `"MALG"` container: constant pool, bound-function
//! table, type table, code section, and the pc→source side table.
//! Native functions are stored by their stable registration id and
//! re-attached to fn pointers on load.

use std::path::Path;

use malang_object::{
    FieldInfo, FunctionId, MethodInfo, TypeFlags, TypeId, TypeStore,
};

use crate::builtins;
use crate::{BoundFunctionMap, Constant, FunctionKind, Program};

const IMAGE_MAGIC: &[u8; 4] = b"MALG";
const IMAGE_VERSION: u16 = 1;

/// Number of types `TypeStore::new` pre-registers; images carry them
/// for validation but reconstruct them from the store itself.
const BUILTIN_TYPES: u32 = 8;

const NO_ID: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageError {
    pub message: String,
}

impl ImageError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid image: {}", self.message)
    }
}

impl std::error::Error for ImageError {}

pub fn save(program: &Program, path: &Path) -> std::io::Result<()> {
    std::fs::write(path, encode(program))
}

pub fn load(path: &Path) -> Result<Program, ImageError> {
    let bytes = std::fs::read(path)
        .map_err(|err| ImageError::new(format!("read failed: {err}")))?;
    decode(&bytes)
}

// ── encoding ──────────────────────────────────────────────────────────

pub fn encode(program: &Program) -> Vec<u8> {
    let mut out = Vec::with_capacity(program.code.len() + 1024);
    out.extend_from_slice(IMAGE_MAGIC);
    write_u16(&mut out, IMAGE_VERSION);
    write_u32(&mut out, program.entry.0);

    write_u32(&mut out, program.constants.len() as u32);
    for constant in &program.constants {
        match constant {
            Constant::Fixnum(n) => {
                out.push(0);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Constant::Double(d) => {
                out.push(1);
                out.extend_from_slice(&d.to_bits().to_le_bytes());
            }
            Constant::Char(c) => {
                out.push(2);
                write_u32(&mut out, *c as u32);
            }
            Constant::Str(text) => {
                out.push(3);
                write_u32(&mut out, text.len() as u32);
                out.extend_from_slice(text.as_bytes());
            }
        }
    }

    write_u32(&mut out, program.functions.len() as u32);
    for function in program.functions.iter() {
        write_string(&mut out, &function.name);
        match function.kind {
            FunctionKind::Bytecode { entry, num_locals } => {
                out.push(0);
                write_u32(&mut out, entry as u32);
                write_u16(&mut out, num_locals);
            }
            FunctionKind::Native { native_id, .. } => {
                out.push(1);
                write_u32(&mut out, native_id);
                write_u16(&mut out, 0);
            }
        }
        out.push(function.params.len() as u8);
        for param in &function.params {
            write_u32(&mut out, param.0);
        }
        write_u32(&mut out, function.ret.0);
    }

    write_u32(&mut out, program.types.len() as u32);
    for info in program.types.iter() {
        write_string(&mut out, &info.name);
        write_u32(&mut out, info.parent.map(|p| p.0).unwrap_or(NO_ID));
        out.push(info.flags.bits());
        write_u32(&mut out, info.element_type.map(|e| e.0).unwrap_or(NO_ID));
        write_u16(&mut out, info.fields.len() as u16);
        for field in &info.fields {
            write_string(&mut out, &field.name);
            write_u32(&mut out, field.ty.0);
        }
        write_u16(&mut out, info.methods.len() as u16);
        for method in &info.methods {
            write_string(&mut out, &method.name);
            out.push(method.params.len() as u8);
            for param in &method.params {
                write_u32(&mut out, param.0);
            }
            write_u32(&mut out, method.ret.0);
            write_u32(&mut out, method.function.0);
        }
    }

    write_u32(&mut out, program.code.len() as u32);
    out.extend_from_slice(&program.code);
    write_u32(&mut out, program.source_map.len() as u32);
    out.extend_from_slice(&program.source_map);
    write_string(&mut out, &program.source_name);
    out
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, text: &str) {
    write_u16(out, text.len() as u16);
    out.extend_from_slice(text.as_bytes());
}

// ── decoding ──────────────────────────────────────────────────────────

pub fn decode(bytes: &[u8]) -> Result<Program, ImageError> {
    let mut r = Reader { bytes, pos: 0 };

    let magic = r.take(4)?;
    if magic != IMAGE_MAGIC {
        return Err(ImageError::new("bad magic"));
    }
    let version = r.u16()?;
    if version != IMAGE_VERSION {
        return Err(ImageError::new(format!("unsupported version {version}")));
    }
    let entry = FunctionId(r.u32()?);

    let constant_count = r.u32()? as usize;
    let mut constants = Vec::with_capacity(constant_count);
    for _ in 0..constant_count {
        let constant = match r.u8()? {
            0 => Constant::Fixnum(r.u32()? as i32),
            1 => Constant::Double(f64::from_bits(r.u64()?)),
            2 => {
                let raw = r.u32()?;
                Constant::Char(
                    char::from_u32(raw)
                        .ok_or_else(|| ImageError::new("bad char constant"))?,
                )
            }
            3 => {
                let len = r.u32()? as usize;
                let bytes = r.take(len)?;
                Constant::Str(
                    String::from_utf8(bytes.to_vec()).map_err(|_| {
                        ImageError::new("string constant is not UTF-8")
                    })?,
                )
            }
            tag => {
                return Err(ImageError::new(format!(
                    "unknown constant tag {tag}"
                )))
            }
        };
        constants.push(constant);
    }

    let function_count = r.u32()? as usize;
    let mut functions = BoundFunctionMap::new();
    for index in 0..function_count {
        let name = r.string()?;
        let kind_tag = r.u8()?;
        let id_or_entry = r.u32()?;
        let num_locals = r.u16()?;
        let param_count = r.u8()? as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(TypeId(r.u32()?));
        }
        let ret = TypeId(r.u32()?);
        let kind = match kind_tag {
            0 => FunctionKind::Bytecode {
                entry: id_or_entry as usize,
                num_locals,
            },
            1 => {
                let native =
                    builtins::native_by_id(id_or_entry).ok_or_else(|| {
                        ImageError::new(format!(
                            "unknown native id {id_or_entry}"
                        ))
                    })?;
                FunctionKind::Native {
                    native,
                    native_id: id_or_entry,
                }
            }
            tag => {
                return Err(ImageError::new(format!(
                    "unknown function kind {tag}"
                )))
            }
        };
        let id = functions
            .add(&name, params, ret, kind)
            .ok_or_else(|| ImageError::new("duplicate function record"))?;
        if id.0 as usize != index {
            return Err(ImageError::new("function table out of order"));
        }
    }
    if entry.0 as usize >= function_count {
        return Err(ImageError::new("entry id out of range"));
    }

    let type_count = r.u32()?;
    if type_count < BUILTIN_TYPES {
        return Err(ImageError::new("type table too small"));
    }
    let mut types = TypeStore::new();
    // Records for each type, applied once every id exists.
    struct TypeRecord {
        parent: Option<TypeId>,
        fields: Vec<FieldInfo>,
        methods: Vec<MethodInfo>,
    }
    let mut records = Vec::with_capacity(type_count as usize);
    for index in 0..type_count {
        let name = r.string()?;
        let parent = r.u32()?;
        let flags = TypeFlags::from_bits(r.u8()?)
            .ok_or_else(|| ImageError::new("bad type flags"))?;
        let element = r.u32()?;

        if index < BUILTIN_TYPES {
            if types.get(TypeId(index)).name != name {
                return Err(ImageError::new("builtin type table mismatch"));
            }
        } else if flags.contains(TypeFlags::ARRAY) {
            if element == NO_ID || element >= index {
                return Err(ImageError::new("array type without element"));
            }
            let id = types.array_of(TypeId(element));
            if id.0 != index {
                return Err(ImageError::new("type table out of order"));
            }
        } else {
            let id = types
                .declare_class(&name, None)
                .ok_or_else(|| ImageError::new("duplicate type record"))?;
            if id.0 != index {
                return Err(ImageError::new("type table out of order"));
            }
        }

        let field_count = r.u16()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            let field_name = r.string()?;
            let ty = TypeId(r.u32()?);
            fields.push(FieldInfo {
                name: field_name,
                ty,
            });
        }
        let method_count = r.u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let method_name = r.string()?;
            let param_count = r.u8()? as usize;
            let mut params = Vec::with_capacity(param_count);
            for _ in 0..param_count {
                params.push(TypeId(r.u32()?));
            }
            let ret = TypeId(r.u32()?);
            let function = FunctionId(r.u32()?);
            methods.push(MethodInfo {
                name: method_name,
                params,
                ret,
                function,
            });
        }
        records.push(TypeRecord {
            parent: (parent != NO_ID).then_some(TypeId(parent)),
            fields,
            methods,
        });
    }
    for (index, record) in records.into_iter().enumerate() {
        let info = types.get_mut(TypeId(index as u32));
        info.parent = record.parent;
        info.fields = record.fields;
        info.methods = record.methods;
    }

    let code_len = r.u32()? as usize;
    let code = r.take(code_len)?.to_vec();
    let map_len = r.u32()? as usize;
    let source_map = r.take(map_len)?.to_vec();
    let source_name = r.string()?;

    Ok(Program {
        types,
        functions,
        constants,
        code,
        entry,
        source_map,
        source_name,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ImageError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| ImageError::new("unexpected end of image"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ImageError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, ImageError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, ImageError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn string(&mut self) -> Result<String, ImageError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ImageError::new("string field is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_program() -> Program {
        crate::compile(
            "class Point { x : int y : int }\n\
             extend int { fn double() -> int { return @ * 2 } }\n\
             fn add(a: int, b: int) -> int { return a + b }\n\
             p := Point()\n\
             p.x = add(1, 2)\n\
             println(21.double())\n\
             println(\"hello\")\n\
             println(2.5 + 1)\n",
            "sample.ma",
        )
        .expect("sample compiles")
    }

    #[test]
    fn encode_decode_encode_is_identity() {
        let program = sample_program();
        let encoded = encode(&program);
        let decoded = decode(&encoded).expect("image decodes");
        assert_eq!(encode(&decoded), encoded);
    }

    #[test]
    fn decode_preserves_program_shape() {
        let program = sample_program();
        let decoded = decode(&encode(&program)).expect("image decodes");
        assert_eq!(decoded.code, program.code);
        assert_eq!(decoded.constants, program.constants);
        assert_eq!(decoded.entry, program.entry);
        assert_eq!(decoded.functions.len(), program.functions.len());
        assert_eq!(decoded.types.len(), program.types.len());
        assert_eq!(decoded.source_map, program.source_map);
        assert_eq!(decoded.source_name, program.source_name);
    }

    #[test]
    fn decoded_image_still_runs() {
        let program = sample_program();
        let decoded = decode(&encode(&program)).expect("image decodes");
        let output = crate::SharedOutput::new();
        let mut vm = crate::Vm::with_output(decoded, Box::new(output.clone()));
        crate::interpreter::run(&mut vm).expect("decoded program runs");
        assert_eq!(output.take_string(), "42\nhello\n3.5\n");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut encoded = encode(&sample_program());
        encoded[0] = b'X';
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn truncated_image_is_rejected() {
        let encoded = encode(&sample_program());
        assert!(decode(&encoded[..encoded.len() / 2]).is_err());
    }
}
