//! SPIR-V metadata extraction
//!
//! Modules arrive as SPIR-V blobs from the compiler toolchain. The runtime
//! needs the kernel entry points and each kernel's parameter layout (byte
//! size and pointer-ness per parameter) before native compilation, both for
//! argument validation at launch and for the device-variable shadow-kernel
//! protocol. Only type and function declarations are walked; function
//! bodies are ignored.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ZeroForgeError, ZfResult};

/// SPIR-V magic number (little-endian)
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

const OP_ENTRY_POINT: u16 = 15;
const OP_TYPE_VOID: u16 = 19;
const OP_TYPE_BOOL: u16 = 20;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_FLOAT: u16 = 22;
const OP_TYPE_VECTOR: u16 = 23;
const OP_TYPE_IMAGE: u16 = 25;
const OP_TYPE_SAMPLER: u16 = 26;
const OP_TYPE_SAMPLED_IMAGE: u16 = 27;
const OP_TYPE_STRUCT: u16 = 30;
const OP_TYPE_POINTER: u16 = 32;
const OP_TYPE_FUNCTION: u16 = 33;
const OP_FUNCTION: u16 = 54;

/// Classification of one kernel parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Passed by value (ints, floats, vectors, structs)
    Scalar,
    /// Pointer into a memory buffer
    Buffer,
    Image,
    Sampler,
}

/// One kernel parameter as declared in the IL
#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub index: u32,
    /// Byte size of the value the launch must supply
    pub size: usize,
    pub kind: ArgKind,
}

/// Parameter layout of one kernel entry point
#[derive(Debug, Clone)]
pub struct KernelInfo {
    pub name: String,
    pub args: Vec<ArgInfo>,
}

impl KernelInfo {
    pub fn num_args(&self) -> usize {
        self.args.len()
    }
}

#[derive(Debug, Clone)]
enum Ty {
    Void,
    Bool,
    Int(usize),
    Float(usize),
    Vector { component: u32, count: u32 },
    Struct(Vec<u32>),
    Pointer,
    Image,
    Sampler,
    SampledImage,
}

/// Parse kernel entry points and their parameter layouts from a SPIR-V blob.
///
/// Fails with `InvalidValue` on malformed input (bad magic, truncated
/// instruction stream, dangling type references).
pub fn parse_kernel_info(il: &[u8]) -> ZfResult<HashMap<String, Arc<KernelInfo>>> {
    let words = to_words(il)?;
    if words.len() < 5 {
        return Err(ZeroForgeError::InvalidValue(
            "SPIR-V blob shorter than header".to_string(),
        ));
    }
    if words[0] != SPIRV_MAGIC {
        return Err(ZeroForgeError::InvalidValue(format!(
            "invalid SPIR-V magic: 0x{:08x}",
            words[0]
        )));
    }

    let mut entry_points: Vec<(u32, String)> = Vec::new();
    let mut types: HashMap<u32, Ty> = HashMap::new();
    // function type id -> parameter type ids
    let mut fn_types: HashMap<u32, Vec<u32>> = HashMap::new();
    // function id -> function type id
    let mut functions: HashMap<u32, u32> = HashMap::new();

    let mut pos = 5;
    while pos < words.len() {
        let first = words[pos];
        let word_count = (first >> 16) as usize;
        let opcode = (first & 0xffff) as u16;
        if word_count == 0 || pos + word_count > words.len() {
            return Err(ZeroForgeError::InvalidValue(format!(
                "truncated SPIR-V instruction at word {}",
                pos
            )));
        }
        let operands = &words[pos + 1..pos + word_count];

        let handled = matches!(
            opcode,
            OP_ENTRY_POINT
                | OP_TYPE_VOID
                | OP_TYPE_BOOL
                | OP_TYPE_INT
                | OP_TYPE_FLOAT
                | OP_TYPE_VECTOR
                | OP_TYPE_IMAGE
                | OP_TYPE_SAMPLER
                | OP_TYPE_SAMPLED_IMAGE
                | OP_TYPE_STRUCT
                | OP_TYPE_POINTER
                | OP_TYPE_FUNCTION
                | OP_FUNCTION
        );
        if handled && operands.is_empty() {
            return Err(ZeroForgeError::InvalidValue(format!(
                "instruction with opcode {} is missing operands",
                opcode
            )));
        }

        match opcode {
            OP_ENTRY_POINT => {
                // ExecutionModel, entry point id, literal name, interfaces
                if operands.len() < 3 {
                    return Err(ZeroForgeError::InvalidValue(
                        "malformed OpEntryPoint".to_string(),
                    ));
                }
                let id = operands[1];
                let name = decode_literal_string(&operands[2..]);
                entry_points.push((id, name));
            }
            OP_TYPE_VOID => {
                types.insert(operands[0], Ty::Void);
            }
            OP_TYPE_BOOL => {
                types.insert(operands[0], Ty::Bool);
            }
            OP_TYPE_INT => {
                if operands.len() < 2 {
                    return Err(ZeroForgeError::InvalidValue("malformed OpTypeInt".to_string()));
                }
                types.insert(operands[0], Ty::Int(operands[1] as usize / 8));
            }
            OP_TYPE_FLOAT => {
                if operands.len() < 2 {
                    return Err(ZeroForgeError::InvalidValue(
                        "malformed OpTypeFloat".to_string(),
                    ));
                }
                types.insert(operands[0], Ty::Float(operands[1] as usize / 8));
            }
            OP_TYPE_VECTOR => {
                if operands.len() < 3 {
                    return Err(ZeroForgeError::InvalidValue(
                        "malformed OpTypeVector".to_string(),
                    ));
                }
                types.insert(
                    operands[0],
                    Ty::Vector {
                        component: operands[1],
                        count: operands[2],
                    },
                );
            }
            OP_TYPE_IMAGE => {
                types.insert(operands[0], Ty::Image);
            }
            OP_TYPE_SAMPLER => {
                types.insert(operands[0], Ty::Sampler);
            }
            OP_TYPE_SAMPLED_IMAGE => {
                types.insert(operands[0], Ty::SampledImage);
            }
            OP_TYPE_STRUCT => {
                types.insert(operands[0], Ty::Struct(operands[1..].to_vec()));
            }
            OP_TYPE_POINTER => {
                // storage class at operands[1] is not needed for sizing
                types.insert(operands[0], Ty::Pointer);
            }
            OP_TYPE_FUNCTION => {
                if operands.len() < 2 {
                    return Err(ZeroForgeError::InvalidValue(
                        "malformed OpTypeFunction".to_string(),
                    ));
                }
                fn_types.insert(operands[0], operands[2..].to_vec());
            }
            OP_FUNCTION => {
                if operands.len() < 4 {
                    return Err(ZeroForgeError::InvalidValue(
                        "malformed OpFunction".to_string(),
                    ));
                }
                functions.insert(operands[1], operands[3]);
            }
            _ => {}
        }
        pos += word_count;
    }

    let mut infos = HashMap::new();
    for (id, name) in entry_points {
        let fn_type = functions.get(&id).ok_or_else(|| {
            ZeroForgeError::InvalidValue(format!(
                "entry point '{}' has no matching OpFunction",
                name
            ))
        })?;
        let param_type_ids = fn_types.get(fn_type).ok_or_else(|| {
            ZeroForgeError::InvalidValue(format!(
                "entry point '{}' references unknown function type",
                name
            ))
        })?;

        let mut args = Vec::with_capacity(param_type_ids.len());
        for (index, type_id) in param_type_ids.iter().enumerate() {
            let ty = types.get(type_id).ok_or_else(|| {
                ZeroForgeError::InvalidValue(format!(
                    "parameter {} of '{}' references unknown type id {}",
                    index, name, type_id
                ))
            })?;
            args.push(ArgInfo {
                index: index as u32,
                size: size_of_type(ty, &types),
                kind: kind_of_type(ty),
            });
        }
        tracing::trace!(kernel = %name, num_args = args.len(), "parsed kernel entry point");
        infos.insert(name.clone(), Arc::new(KernelInfo { name, args }));
    }

    Ok(infos)
}

fn to_words(il: &[u8]) -> ZfResult<Vec<u32>> {
    if il.len() % 4 != 0 {
        return Err(ZeroForgeError::InvalidValue(format!(
            "SPIR-V blob length {} is not word-aligned",
            il.len()
        )));
    }
    Ok(il
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Decode a nul-terminated literal string packed little-endian into words
fn decode_literal_string(operands: &[u32]) -> String {
    let mut bytes = Vec::new();
    'outer: for word in operands {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                break 'outer;
            }
            bytes.push(byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn size_of_type(ty: &Ty, types: &HashMap<u32, Ty>) -> usize {
    match ty {
        Ty::Void => 0,
        Ty::Bool => 1,
        Ty::Int(size) | Ty::Float(size) => *size,
        Ty::Vector { component, count } => {
            let comp = types
                .get(component)
                .map(|t| size_of_type(t, types))
                .unwrap_or(0);
            comp * *count as usize
        }
        Ty::Struct(members) => members
            .iter()
            .map(|m| types.get(m).map(|t| size_of_type(t, types)).unwrap_or(0))
            .sum(),
        Ty::Pointer | Ty::Image | Ty::Sampler | Ty::SampledImage => std::mem::size_of::<u64>(),
    }
}

fn kind_of_type(ty: &Ty) -> ArgKind {
    match ty {
        Ty::Pointer => ArgKind::Buffer,
        Ty::Image | Ty::SampledImage => ArgKind::Image,
        Ty::Sampler => ArgKind::Sampler,
        _ => ArgKind::Scalar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal SPIR-V emitter for parser tests
    struct Emitter {
        words: Vec<u32>,
        next_id: u32,
    }

    impl Emitter {
        fn new() -> Self {
            // magic, version 1.0, generator, bound (patched at finish), schema
            Emitter {
                words: vec![SPIRV_MAGIC, 0x0001_0000, 0, 0, 0],
                next_id: 1,
            }
        }

        fn id(&mut self) -> u32 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        fn instr(&mut self, opcode: u16, operands: &[u32]) {
            let word_count = operands.len() as u32 + 1;
            self.words.push((word_count << 16) | opcode as u32);
            self.words.extend_from_slice(operands);
        }

        fn string_words(s: &str) -> Vec<u32> {
            let mut bytes: Vec<u8> = s.as_bytes().to_vec();
            bytes.push(0);
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        }

        fn finish(mut self) -> Vec<u8> {
            self.words[3] = self.next_id;
            self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
        }
    }

    fn build_two_kernel_module() -> Vec<u8> {
        let mut e = Emitter::new();
        let void_ty = e.id();
        let f32_ty = e.id();
        let u32_ty = e.id();
        let ptr_ty = e.id();
        let fn_add_ty = e.id();
        let fn_scale_ty = e.id();
        let fn_add = e.id();
        let fn_scale = e.id();

        let mut op = vec![6u32, fn_add];
        op.extend(Emitter::string_words("vec_add"));
        e.instr(OP_ENTRY_POINT, &op);
        let mut op = vec![6u32, fn_scale];
        op.extend(Emitter::string_words("vec_scale"));
        e.instr(OP_ENTRY_POINT, &op);

        e.instr(OP_TYPE_VOID, &[void_ty]);
        e.instr(OP_TYPE_FLOAT, &[f32_ty, 32]);
        e.instr(OP_TYPE_INT, &[u32_ty, 32, 0]);
        // pointer to CrossWorkgroup f32
        e.instr(OP_TYPE_POINTER, &[ptr_ty, 5, f32_ty]);
        // vec_add(*f32, *f32, *f32, u32)
        e.instr(OP_TYPE_FUNCTION, &[fn_add_ty, void_ty, ptr_ty, ptr_ty, ptr_ty, u32_ty]);
        // vec_scale(*f32, f32)
        e.instr(OP_TYPE_FUNCTION, &[fn_scale_ty, void_ty, ptr_ty, f32_ty]);
        e.instr(OP_FUNCTION, &[void_ty, fn_add, 0, fn_add_ty]);
        e.instr(OP_FUNCTION, &[void_ty, fn_scale, 0, fn_scale_ty]);

        e.finish()
    }

    #[test]
    fn test_parse_entry_points_and_args() {
        let il = build_two_kernel_module();
        let infos = parse_kernel_info(&il).expect("parse should succeed");
        assert_eq!(infos.len(), 2);

        let add = &infos["vec_add"];
        assert_eq!(add.num_args(), 4);
        assert_eq!(add.args[0].kind, ArgKind::Buffer);
        assert_eq!(add.args[0].size, 8);
        assert_eq!(add.args[3].kind, ArgKind::Scalar);
        assert_eq!(add.args[3].size, 4);

        let scale = &infos["vec_scale"];
        assert_eq!(scale.num_args(), 2);
        assert_eq!(scale.args[1].kind, ArgKind::Scalar);
        assert_eq!(scale.args[1].size, 4);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut il = build_two_kernel_module();
        il[0] = 0xff;
        let err = parse_kernel_info(&il).unwrap_err();
        assert!(matches!(err, ZeroForgeError::InvalidValue(_)));
    }

    #[test]
    fn test_unaligned_blob_rejected() {
        let mut il = build_two_kernel_module();
        il.push(0);
        assert!(parse_kernel_info(&il).is_err());
    }

    #[test]
    fn test_truncated_instruction_rejected() {
        let il = build_two_kernel_module();
        // chop the last instruction mid-way
        let truncated = &il[..il.len() - 4];
        assert!(parse_kernel_info(truncated).is_err());
    }

    #[test]
    fn test_zero_arg_kernel() {
        let mut e = Emitter::new();
        let void_ty = e.id();
        let fn_ty = e.id();
        let f = e.id();
        let mut op = vec![6u32, f];
        op.extend(Emitter::string_words("init_counters"));
        e.instr(OP_ENTRY_POINT, &op);
        e.instr(OP_TYPE_VOID, &[void_ty]);
        e.instr(OP_TYPE_FUNCTION, &[fn_ty, void_ty]);
        e.instr(OP_FUNCTION, &[void_ty, f, 0, fn_ty]);

        let infos = parse_kernel_info(&e.finish()).expect("parse should succeed");
        assert_eq!(infos["init_counters"].num_args(), 0);
    }
}
