use std::collections::HashMap;

use crate::vm::OpCode;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildError {
    DuplicateLabel(String),
    UnknownLabel(String),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::DuplicateLabel(name) => write!(f, "label '{name}' is already defined"),
            BuildError::UnknownLabel(name) => write!(f, "label '{name}' is never defined"),
        }
    }
}

impl std::error::Error for BuildError {}

struct Fixup {
    /// Byte position of the placeholder offset inside the code buffer.
    at: usize,
    /// Position of the branch opcode the offset is relative to.
    opcode_at: u32,
    label: String,
}

enum PendingTarget {
    External,
    Internal { entry: String },
}

struct PendingImport {
    name: String,
    arg_count: i32,
    varargs: bool,
    out_size: i32,
    target: PendingTarget,
}

/// Assembles firmware images: an import table plus code, with labels in
/// place of raw branch displacements and entry offsets. `finish` resolves
/// every label and serializes the wire format the loader reads back.
pub struct FirmwareBuilder {
    imports: Vec<PendingImport>,
    code: Vec<u8>,
    labels: HashMap<String, u32>,
    fixups: Vec<Fixup>,
}

impl FirmwareBuilder {
    pub fn new() -> Self {
        Self {
            imports: Vec::new(),
            code: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    /// Current code position, where the next instruction will land.
    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn label(&mut self, name: &str) -> Result<(), BuildError> {
        if self.labels.contains_key(name) {
            return Err(BuildError::DuplicateLabel(name.to_string()));
        }
        self.labels.insert(name.to_string(), self.position());
        Ok(())
    }

    /// Declares a host function import. Returns the id `call` takes.
    pub fn import_external(
        &mut self,
        name: &str,
        arg_count: i32,
        varargs: bool,
        out_size: i32,
    ) -> u32 {
        let id = self.imports.len() as u32;
        self.imports.push(PendingImport {
            name: name.to_string(),
            arg_count,
            varargs,
            out_size,
            target: PendingTarget::External,
        });
        id
    }

    /// Declares an in-image subroutine whose entry point is `entry`, a label
    /// defined elsewhere in the code. Returns the id `call` takes.
    pub fn import_internal(&mut self, name: &str, arg_count: i32, entry: &str) -> u32 {
        let id = self.imports.len() as u32;
        self.imports.push(PendingImport {
            name: name.to_string(),
            arg_count,
            varargs: false,
            out_size: 0,
            target: PendingTarget::Internal {
                entry: entry.to_string(),
            },
        });
        id
    }

    pub fn push(&mut self, payload: &[u8]) {
        self.emit_opcode(OpCode::Push);
        self.emit_u32(payload.len() as u32);
        self.code.extend_from_slice(payload);
    }

    pub fn push_u8(&mut self, value: u8) {
        self.push(&[value]);
    }

    pub fn push_u32(&mut self, value: u32) {
        self.push(&value.to_le_bytes());
    }

    pub fn push_i32(&mut self, value: i32) {
        self.push(&value.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.push(&value.to_le_bytes());
    }

    /// Pushes `text` with a trailing NUL, ready to hand to C.
    pub fn push_cstr(&mut self, text: &str) {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        self.push(&payload);
    }

    pub fn pop(&mut self) {
        self.emit_opcode(OpCode::Pop);
    }

    pub fn load(&mut self) {
        self.emit_opcode(OpCode::Load);
    }

    pub fn store(&mut self) {
        self.emit_opcode(OpCode::Store);
    }

    pub fn branch(&mut self) {
        self.emit_opcode(OpCode::Branch);
    }

    /// Emits a branch to `label`: a 4-byte offset push patched at `finish`,
    /// then the branch opcode. The condition cell must already be on the
    /// stack underneath.
    pub fn branch_to(&mut self, label: &str) {
        self.emit_opcode(OpCode::Push);
        self.emit_u32(4);
        let at = self.code.len();
        self.emit_u32(0);
        let opcode_at = self.position();
        self.fixups.push(Fixup {
            at,
            opcode_at,
            label: label.to_string(),
        });
        self.emit_opcode(OpCode::Branch);
    }

    pub fn call(&mut self, id: u32) {
        self.emit_opcode(OpCode::Call);
        self.emit_u32(id);
    }

    pub fn ret(&mut self) {
        self.emit_opcode(OpCode::Ret);
    }

    pub fn set_rsp(&mut self) {
        self.emit_opcode(OpCode::SetRsp);
    }

    pub fn get_rsp(&mut self) {
        self.emit_opcode(OpCode::GetRsp);
    }

    /// Resolves labels and serializes the image.
    pub fn finish(mut self) -> Result<Vec<u8>, BuildError> {
        for fixup in self.fixups.drain(..) {
            let target = self
                .labels
                .get(&fixup.label)
                .copied()
                .ok_or_else(|| BuildError::UnknownLabel(fixup.label.clone()))?;
            let offset = target as i64 - fixup.opcode_at as i64;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&(offset as i32).to_le_bytes());
        }

        let mut image = Vec::with_capacity(16 + self.code.len());
        image.extend_from_slice(&(self.imports.len() as i32).to_le_bytes());
        for import in &self.imports {
            image.extend_from_slice(&import.arg_count.to_le_bytes());
            match &import.target {
                PendingTarget::External => {
                    image.push(1);
                    image.push(u8::from(import.varargs));
                    image.extend_from_slice(&import.out_size.to_le_bytes());
                }
                PendingTarget::Internal { entry } => {
                    image.push(0);
                    image.push(u8::from(import.varargs));
                    image.extend_from_slice(&import.out_size.to_le_bytes());
                    let offset = self
                        .labels
                        .get(entry)
                        .copied()
                        .ok_or_else(|| BuildError::UnknownLabel(entry.clone()))?;
                    image.extend_from_slice(&(offset as i32).to_le_bytes());
                }
            }
            image.extend_from_slice(import.name.as_bytes());
            image.push(0);
        }
        image.extend_from_slice(&self.code);
        Ok(image)
    }

    fn emit_opcode(&mut self, opcode: OpCode) {
        self.code.push(opcode as u8);
    }

    fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }
}

impl Default for FirmwareBuilder {
    fn default() -> Self {
        Self::new()
    }
}
