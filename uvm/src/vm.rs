use crate::heap::HeapArena;

mod bridge;

/// Default guest heap size, 5 MiB.
pub const DEFAULT_HEAP_SIZE: usize = 5 * 1024 * 1024;

/// Most arguments a native call can carry. Matches the register budget of
/// the trampoline emitters, so the limit holds on every backend.
pub const MAX_NATIVE_ARGS: usize = 4;

/// Width of a host pointer, used for pointer-sized results and `getrsp`.
pub const POINTER_SIZE: usize = std::mem::size_of::<*const ()>();

#[derive(Debug)]
pub enum VmError {
    StackUnderflow { at: usize },
    CodeBounds { at: usize },
    BranchOutOfBounds { at: usize, target: i64 },
    HeapAccess { at: usize, addr: u64, len: usize },
    InvalidOpcode { at: usize, opcode: u8 },
    UnknownImport { at: usize, id: u32 },
    NativeCall(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackUnderflow { at } => {
                write!(f, "operand stack underflow at offset {at}")
            }
            VmError::CodeBounds { at } => {
                write!(f, "instruction fetch past the end of code at offset {at}")
            }
            VmError::BranchOutOfBounds { at, target } => {
                write!(f, "branch at offset {at} targets {target}, outside the code region")
            }
            VmError::HeapAccess { at, addr, len } => {
                write!(
                    f,
                    "heap access of {len} bytes at address {addr:#x} is out of bounds (offset {at})"
                )
            }
            VmError::InvalidOpcode { at, opcode } => {
                write!(f, "invalid opcode {opcode:#04x} at offset {at}")
            }
            VmError::UnknownImport { at, id } => {
                write!(f, "call to unknown import id {id} at offset {at}")
            }
            VmError::NativeCall(message) => write!(f, "native call error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

pub type VmResult<T> = Result<T, VmError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Push = 0,
    Pop = 1,
    Load = 2,
    Store = 3,
    Branch = 4,
    Call = 5,
    Ret = 6,
    SetRsp = 7,
    GetRsp = 8,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Push => "push",
            OpCode::Pop => "pop",
            OpCode::Load => "load",
            OpCode::Store => "store",
            OpCode::Branch => "branch",
            OpCode::Call => "call",
            OpCode::Ret => "ret",
            OpCode::SetRsp => "setrsp",
            OpCode::GetRsp => "getrsp",
        }
    }
}

/// One operand-stack slot: a length-tagged little-endian byte string.
///
/// Cells keep the width they were pushed with. Reading one as a number
/// zero-extends, so a 4-byte cell and the same value pushed as 8 bytes
/// behave identically in calls and conditions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cell {
    bytes: Box<[u8]>,
}

impl Cell {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn from_u32(value: u32) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    pub fn from_u64(value: u64) -> Self {
        Self::from_bytes(&value.to_le_bytes())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Numeric value of the cell: up to the first 8 bytes, zero-extended.
    pub fn as_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        let take = self.bytes.len().min(8);
        buf[..take].copy_from_slice(&self.bytes[..take]);
        u64::from_le_bytes(buf)
    }

    /// A cell is truthy when any of its bytes is nonzero. The empty cell is
    /// falsy.
    fn truthy(&self) -> bool {
        self.bytes.iter().any(|&b| b != 0)
    }

    /// Branch displacement carried by the cell. Cells of at least 4 bytes
    /// are read as a signed 32-bit value so backward branches stay
    /// representable; narrower cells zero-extend and can only go forward.
    fn branch_offset(&self) -> i64 {
        if self.bytes.len() >= 4 {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&self.bytes[..4]);
            i32::from_le_bytes(buf) as i64
        } else {
            self.as_u64() as i64
        }
    }
}

/// Where a `call` lands: an offset into this image's code, or a host
/// function resolved while the firmware was loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportTarget {
    Code { offset: u32 },
    Native { ptr: *const () },
}

/// One entry of the firmware import table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub arg_count: i32,
    pub varargs: bool,
    /// Result bytes pushed after a native call returns, already resolved to
    /// a concrete width in 0..=8. Unused for code targets.
    pub out_size: u8,
    pub target: ImportTarget,
}

/// A loaded firmware image: the import table with every external name
/// resolved, plus the raw code region. Execution starts at code offset 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Firmware {
    pub imports: Vec<Import>,
    pub code: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub heap_size: usize,
    /// Call natives through freshly emitted machine-code trampolines. On
    /// targets without an emitter this is off and calls go through a fixed
    /// set of C call shapes instead.
    pub emitted_trampolines: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            emitted_trampolines: bridge::emitter_supported(),
        }
    }
}

enum StepOutcome {
    Continue,
    Halted,
}

pub struct Vm {
    firmware: Firmware,
    /// Code instruction pointer, an offset into `firmware.code`.
    cip: usize,
    stack: Vec<Cell>,
    returns: Vec<usize>,
    /// Guest stack pointer register. Starts at the arena base; the VM never
    /// touches it outside `setrsp`/`getrsp`.
    rsp: u64,
    heap: HeapArena,
    bridge: bridge::NativeBridge,
}

impl Vm {
    pub fn new(firmware: Firmware) -> Self {
        Self::with_config(firmware, VmConfig::default())
    }

    pub fn with_config(firmware: Firmware, config: VmConfig) -> Self {
        Self {
            firmware,
            cip: 0,
            stack: Vec::new(),
            returns: Vec::new(),
            rsp: 0,
            heap: HeapArena::new(config.heap_size),
            bridge: bridge::NativeBridge::new(config.emitted_trampolines),
        }
    }

    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    pub fn stack(&self) -> &[Cell] {
        &self.stack
    }

    pub fn cip(&self) -> usize {
        self.cip
    }

    pub fn rsp(&self) -> u64 {
        self.rsp
    }

    pub fn heap(&self) -> &HeapArena {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut HeapArena {
        &mut self.heap
    }

    /// Runs from the current `cip` until a `ret` with an empty return stack
    /// or a trap. On a trap the VM state is left as it was when the fault
    /// was detected.
    pub fn run(&mut self) -> VmResult<()> {
        loop {
            match self.step()? {
                StepOutcome::Continue => {}
                StepOutcome::Halted => return Ok(()),
            }
        }
    }

    fn step(&mut self) -> VmResult<StepOutcome> {
        let at = self.cip;
        let opcode = self.read_u8(at)?;
        self.execute_instruction(opcode, at)
    }

    fn execute_instruction(&mut self, opcode: u8, at: usize) -> VmResult<StepOutcome> {
        match opcode {
            x if x == OpCode::Push as u8 => {
                let len = self.read_u32(at)? as usize;
                let cell = Cell::from_bytes(self.read_slice(len, at)?);
                self.stack.push(cell);
            }
            x if x == OpCode::Pop as u8 => {
                self.pop_cell(at)?;
            }
            x if x == OpCode::Load as u8 => {
                let len = self.pop_cell(at)?.as_u64() as usize;
                let addr = self.pop_cell(at)?.as_u64();
                let cell = Cell::from_bytes(
                    self.heap
                        .read(addr, len)
                        .ok_or(VmError::HeapAccess { at, addr, len })?,
                );
                self.stack.push(cell);
            }
            x if x == OpCode::Store as u8 => {
                let value = self.pop_cell(at)?;
                let addr = self.pop_cell(at)?.as_u64();
                self.heap
                    .write(addr, value.bytes())
                    .ok_or(VmError::HeapAccess {
                        at,
                        addr,
                        len: value.len(),
                    })?;
            }
            x if x == OpCode::Branch as u8 => {
                let offset = self.pop_cell(at)?.branch_offset();
                let condition = self.pop_cell(at)?;
                if condition.truthy() {
                    // Displacements are relative to the branch opcode itself.
                    let target = at as i64 + offset;
                    if target < 0 || target as usize >= self.firmware.code.len() {
                        return Err(VmError::BranchOutOfBounds { at, target });
                    }
                    self.cip = target as usize;
                }
            }
            x if x == OpCode::Call as u8 => {
                let id = self.read_u32(at)?;
                self.execute_call(id, at)?;
            }
            x if x == OpCode::Ret as u8 => match self.returns.pop() {
                Some(address) => self.cip = address,
                None => return Ok(StepOutcome::Halted),
            },
            x if x == OpCode::SetRsp as u8 => {
                self.rsp = self.pop_cell(at)?.as_u64();
            }
            x if x == OpCode::GetRsp as u8 => {
                let cell = Cell::from_bytes(&self.rsp.to_le_bytes()[..POINTER_SIZE]);
                self.stack.push(cell);
            }
            other => return Err(VmError::InvalidOpcode { at, opcode: other }),
        }
        Ok(StepOutcome::Continue)
    }

    fn execute_call(&mut self, id: u32, at: usize) -> VmResult<()> {
        let import = self
            .firmware
            .imports
            .get(id as usize)
            .ok_or(VmError::UnknownImport { at, id })?;
        let arg_count = import.arg_count.max(0) as usize;
        let varargs = import.varargs;
        let out_size = import.out_size;
        let target = import.target;

        match target {
            ImportTarget::Code { offset } => {
                let entry = offset as usize;
                if entry >= self.firmware.code.len() {
                    return Err(VmError::CodeBounds { at });
                }
                self.returns.push(self.cip);
                self.cip = entry;
            }
            ImportTarget::Native { ptr } => {
                // The loader caps external arg counts at MAX_NATIVE_ARGS; a
                // forged negative count pops nothing.
                let mut cells = Vec::with_capacity(arg_count);
                for _ in 0..arg_count {
                    cells.push(self.pop_cell(at)?);
                }
                // cells[0] was on top of the stack; the first cell pushed
                // becomes the first C argument.
                let args: Vec<u64> = cells.iter().rev().map(marshal_native_arg).collect();
                let result = self.bridge.invoke(ptr, &args, varargs)?;
                if out_size > 0 {
                    self.stack
                        .push(Cell::from_bytes(&result.to_le_bytes()[..out_size as usize]));
                }
            }
        }
        Ok(())
    }

    fn pop_cell(&mut self, at: usize) -> VmResult<Cell> {
        self.stack.pop().ok_or(VmError::StackUnderflow { at })
    }

    fn read_u8(&mut self, at: usize) -> VmResult<u8> {
        if self.cip >= self.firmware.code.len() {
            return Err(VmError::CodeBounds { at });
        }
        let value = self.firmware.code[self.cip];
        self.cip += 1;
        Ok(value)
    }

    fn read_u32(&mut self, at: usize) -> VmResult<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read_slice(4, at)?);
        Ok(u32::from_le_bytes(buf))
    }

    fn read_slice(&mut self, len: usize, at: usize) -> VmResult<&[u8]> {
        let end = self
            .cip
            .checked_add(len)
            .ok_or(VmError::CodeBounds { at })?;
        let slice = self
            .firmware
            .code
            .get(self.cip..end)
            .ok_or(VmError::CodeBounds { at })?;
        self.cip = end;
        Ok(slice)
    }
}

/// How a cell crosses into a C argument register: cells up to 8 bytes go by
/// value, zero-extended; wider cells pass a pointer to their bytes. The
/// caller keeps the cells alive until the native call returns.
fn marshal_native_arg(cell: &Cell) -> u64 {
    if cell.len() <= 8 {
        cell.as_u64()
    } else {
        cell.bytes().as_ptr() as u64
    }
}
