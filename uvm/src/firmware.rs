//! Firmware image parsing and inspection.
//!
//! An image is a little-endian import table followed by raw code: an i32
//! entry count, then per entry an i32 argument count, two flag bytes
//! (external, varargs), an i32 result size, an i32 entry offset for
//! internal entries only, and a NUL-terminated name. Everything after the
//! table is the code region and executes from offset 0.

use std::fmt::Write as _;

use crate::host::SymbolResolver;
use crate::vm::{Firmware, Import, ImportTarget, MAX_NATIVE_ARGS, OpCode, POINTER_SIZE};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FirmwareError {
    UnexpectedEof,
    InvalidImportCount(i32),
    InvalidFlag(u8),
    InvalidUtf8,
    TooManyArguments { name: String, count: i32 },
    InvalidReturnSize { name: String, size: i32 },
    InvalidEntryOffset { name: String, offset: i32 },
    UnresolvedImport { name: String },
}

impl std::fmt::Display for FirmwareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareError::UnexpectedEof => write!(f, "firmware image ended unexpectedly"),
            FirmwareError::InvalidImportCount(count) => {
                write!(f, "invalid import count {count}")
            }
            FirmwareError::InvalidFlag(value) => {
                write!(f, "flag byte {value:#04x} is neither 0 nor 1")
            }
            FirmwareError::InvalidUtf8 => write!(f, "import name is not valid UTF-8"),
            FirmwareError::TooManyArguments { name, count } => {
                write!(
                    f,
                    "external import '{name}' declares {count} arguments, at most {MAX_NATIVE_ARGS} are supported"
                )
            }
            FirmwareError::InvalidReturnSize { name, size } => {
                write!(
                    f,
                    "import '{name}' declares result size {size}, expected -1 or 0..=8"
                )
            }
            FirmwareError::InvalidEntryOffset { name, offset } => {
                write!(
                    f,
                    "internal import '{name}' entry offset {offset} is outside the code region"
                )
            }
            FirmwareError::UnresolvedImport { name } => {
                write!(f, "unresolved external import '{name}'")
            }
        }
    }
}

impl std::error::Error for FirmwareError {}

/// Parses and links a firmware image. Every external import is resolved
/// through `resolver` before this returns, so a missing host symbol fails
/// the load instead of a later call.
pub fn load_firmware(
    bytes: &[u8],
    resolver: &dyn SymbolResolver,
) -> Result<Firmware, FirmwareError> {
    let mut cursor = Cursor::new(bytes);
    let import_count = cursor.read_i32()?;
    if import_count < 0 {
        return Err(FirmwareError::InvalidImportCount(import_count));
    }

    let mut imports = Vec::new();
    for _ in 0..import_count {
        let arg_count = cursor.read_i32()?;
        let is_external = cursor.read_bool()?;
        let varargs = cursor.read_bool()?;
        let out_size_raw = cursor.read_i32()?;
        let raw_offset = if is_external { 0 } else { cursor.read_i32()? };
        let name = cursor.read_cstring()?;

        let out_size = match out_size_raw {
            -1 => POINTER_SIZE as u8,
            0..=8 => out_size_raw as u8,
            size => return Err(FirmwareError::InvalidReturnSize { name, size }),
        };

        let target = if is_external {
            if arg_count < 0 || arg_count as usize > MAX_NATIVE_ARGS {
                return Err(FirmwareError::TooManyArguments {
                    name,
                    count: arg_count,
                });
            }
            let ptr = resolver
                .resolve(&name)
                .ok_or_else(|| FirmwareError::UnresolvedImport { name: name.clone() })?;
            ImportTarget::Native { ptr }
        } else {
            if raw_offset < 0 {
                return Err(FirmwareError::InvalidEntryOffset {
                    name,
                    offset: raw_offset,
                });
            }
            ImportTarget::Code {
                offset: raw_offset as u32,
            }
        };

        imports.push(Import {
            name,
            arg_count,
            varargs,
            out_size,
            target,
        });
    }

    let code = cursor.rest().to_vec();
    // Entry offsets point into the code region, which is only delimited
    // once the whole table has been read.
    for import in &imports {
        if let ImportTarget::Code { offset } = import.target
            && offset as usize >= code.len()
        {
            return Err(FirmwareError::InvalidEntryOffset {
                name: import.name.clone(),
                offset: offset as i32,
            });
        }
    }

    Ok(Firmware { imports, code })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodeError {
    InvalidOpcode {
        offset: usize,
        opcode: u8,
    },
    TruncatedOperand {
        offset: usize,
        opcode: u8,
        expected_bytes: usize,
    },
    UnknownCallTarget {
        offset: usize,
        id: u32,
    },
}

impl std::fmt::Display for CodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeError::InvalidOpcode { offset, opcode } => {
                write!(f, "invalid opcode {opcode:#04x} at offset {offset}")
            }
            CodeError::TruncatedOperand {
                offset,
                opcode,
                expected_bytes,
            } => {
                write!(
                    f,
                    "instruction at offset {offset} (opcode {opcode:#04x}) is missing {expected_bytes} operand bytes"
                )
            }
            CodeError::UnknownCallTarget { offset, id } => {
                write!(
                    f,
                    "call at offset {offset} names import id {id}, which is not in the import table"
                )
            }
        }
    }
}

impl std::error::Error for CodeError {}

/// Linear sweep over the code region checking opcode validity, operand
/// completeness and call targets. Branch targets are data here, they cannot
/// be checked without executing.
///
/// Opt-in: the loader does not run this, images are free to hide data in
/// never-reached code bytes.
pub fn validate_firmware(firmware: &Firmware) -> Result<(), CodeError> {
    let code = &firmware.code;
    let mut ip = 0usize;
    while ip < code.len() {
        let offset = ip;
        let opcode = code[ip];
        ip += 1;
        match opcode {
            x if x == OpCode::Push as u8 => {
                let len = read_u32(code, &mut ip).ok_or(CodeError::TruncatedOperand {
                    offset,
                    opcode,
                    expected_bytes: 4,
                })? as usize;
                if code.len() - ip < len {
                    return Err(CodeError::TruncatedOperand {
                        offset,
                        opcode,
                        expected_bytes: len,
                    });
                }
                ip += len;
            }
            x if x == OpCode::Call as u8 => {
                let id = read_u32(code, &mut ip).ok_or(CodeError::TruncatedOperand {
                    offset,
                    opcode,
                    expected_bytes: 4,
                })?;
                if firmware.imports.get(id as usize).is_none() {
                    return Err(CodeError::UnknownCallTarget { offset, id });
                }
            }
            x if x == OpCode::Pop as u8
                || x == OpCode::Load as u8
                || x == OpCode::Store as u8
                || x == OpCode::Branch as u8
                || x == OpCode::Ret as u8
                || x == OpCode::SetRsp as u8
                || x == OpCode::GetRsp as u8 => {}
            opcode => return Err(CodeError::InvalidOpcode { offset, opcode }),
        }
    }
    Ok(())
}

/// Renders the import table and a linear disassembly of the code region.
pub fn disassemble_firmware(firmware: &Firmware) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "imports ({}):", firmware.imports.len());
    for (id, import) in firmware.imports.iter().enumerate() {
        match import.target {
            ImportTarget::Code { offset } => {
                let _ = writeln!(
                    out,
                    "  [{id:04}] {:<20} internal entry={offset} argc={}",
                    import.name, import.arg_count
                );
            }
            ImportTarget::Native { ptr } => {
                let _ = writeln!(
                    out,
                    "  [{id:04}] {:<20} external at {:#x} argc={} varargs={} out={}",
                    import.name, ptr as usize, import.arg_count, import.varargs, import.out_size
                );
            }
        }
    }

    let code = &firmware.code;
    let _ = writeln!(out, "code ({} bytes):", code.len());
    let mut ip = 0usize;
    while ip < code.len() {
        let start = ip;
        let opcode = code[ip];
        ip += 1;
        let instruction = match opcode {
            x if x == OpCode::Push as u8 => {
                let Some(len) = read_u32(code, &mut ip) else {
                    let _ = write_truncated_line(&mut out, code, start);
                    break;
                };
                let len = len as usize;
                if code.len() - ip < len {
                    let _ = write_truncated_line(&mut out, code, start);
                    break;
                }
                let payload = &code[ip..ip + len];
                ip += len;
                format!("push {}", format_payload(payload))
            }
            x if x == OpCode::Call as u8 => {
                let Some(id) = read_u32(code, &mut ip) else {
                    let _ = write_truncated_line(&mut out, code, start);
                    break;
                };
                match firmware.imports.get(id as usize) {
                    Some(import) => format!("call {id} ; {}", import.name),
                    None => format!("call {id} ; unknown import"),
                }
            }
            x if x == OpCode::Pop as u8 => OpCode::Pop.mnemonic().to_string(),
            x if x == OpCode::Load as u8 => OpCode::Load.mnemonic().to_string(),
            x if x == OpCode::Store as u8 => OpCode::Store.mnemonic().to_string(),
            x if x == OpCode::Branch as u8 => OpCode::Branch.mnemonic().to_string(),
            x if x == OpCode::Ret as u8 => OpCode::Ret.mnemonic().to_string(),
            x if x == OpCode::SetRsp as u8 => OpCode::SetRsp.mnemonic().to_string(),
            x if x == OpCode::GetRsp as u8 => OpCode::GetRsp.mnemonic().to_string(),
            other => format!(".byte 0x{other:02X} ; invalid opcode"),
        };
        let _ = writeln!(
            out,
            "{start:04}\t{:<14}\t{instruction}",
            format_hex_window(&code[start..ip])
        );
    }
    out
}

fn write_truncated_line(out: &mut String, code: &[u8], start: usize) -> std::fmt::Result {
    let window = &code[start..(start + 8).min(code.len())];
    writeln!(out, "{start:04}\t{:<14}\t<truncated>", format_hex_bytes(window))
}

fn format_payload(payload: &[u8]) -> String {
    let text = payload.strip_suffix(&[0]).unwrap_or(payload);
    if !text.is_empty() && text.iter().all(|&b| (0x20..0x7F).contains(&b)) {
        if let Ok(text) = std::str::from_utf8(text) {
            return format!("{}b \"{text}\"", payload.len());
        }
    }
    if payload.len() <= 8 {
        format!("{}b [{}]", payload.len(), format_hex_bytes(payload))
    } else {
        format!("{}b [{} ..]", payload.len(), format_hex_bytes(&payload[..8]))
    }
}

fn format_hex_window(bytes: &[u8]) -> String {
    if bytes.len() <= 12 {
        format_hex_bytes(bytes)
    } else {
        format!("{} ..", format_hex_bytes(&bytes[..12]))
    }
}

fn format_hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_u32(code: &[u8], ip: &mut usize) -> Option<u32> {
    let end = ip.checked_add(4)?;
    let slice = code.get(*ip..end)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    *ip = end;
    Some(u32::from_le_bytes(buf))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, FirmwareError> {
        let byte = *self
            .bytes
            .get(self.offset)
            .ok_or(FirmwareError::UnexpectedEof)?;
        self.offset += 1;
        Ok(byte)
    }

    fn read_i32(&mut self) -> Result<i32, FirmwareError> {
        Ok(i32::from_le_bytes(self.read_exact_array::<4>()?))
    }

    fn read_bool(&mut self) -> Result<bool, FirmwareError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(FirmwareError::InvalidFlag(other)),
        }
    }

    fn read_cstring(&mut self) -> Result<String, FirmwareError> {
        let start = self.offset;
        let nul = self.bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or(FirmwareError::UnexpectedEof)?;
        let raw = &self.bytes[start..start + nul];
        self.offset = start + nul + 1;
        String::from_utf8(raw.to_vec()).map_err(|_| FirmwareError::InvalidUtf8)
    }

    fn read_exact_array<const N: usize>(&mut self) -> Result<[u8; N], FirmwareError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_exact(N)?);
        Ok(array)
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], FirmwareError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(FirmwareError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or(FirmwareError::UnexpectedEof)?;
        self.offset = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.offset..];
        self.offset = self.bytes.len();
        slice
    }
}
