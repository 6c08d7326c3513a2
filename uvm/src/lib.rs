pub mod builder;
pub mod firmware;
pub mod heap;
pub mod host;
pub mod vm;

pub use builder::{BuildError, FirmwareBuilder};
pub use firmware::{
    CodeError, FirmwareError, disassemble_firmware, load_firmware, validate_firmware,
};
pub use heap::HeapArena;
pub use host::{OverrideRegistry, SymbolResolver, process_symbol};
pub use vm::{
    Cell, DEFAULT_HEAP_SIZE, Firmware, Import, ImportTarget, MAX_NATIVE_ARGS, OpCode,
    POINTER_SIZE, Vm, VmConfig, VmError, VmResult,
};
