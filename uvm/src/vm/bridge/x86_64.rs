use super::super::{VmError, VmResult};
use super::NativeBackend;

pub(super) struct X86_64Backend;

impl NativeBackend for X86_64Backend {
    type ScratchPage = BackendScratchPage;

    fn emit_call_stub(target: *const (), args: &[u64], varargs: bool) -> VmResult<Vec<u8>> {
        emit_call_stub_bytes(target, args, varargs)
    }

    fn scratch_page() -> VmResult<Self::ScratchPage> {
        BackendScratchPage::new(super::SCRATCH_LEN)
    }

    fn install_stub(page: &mut Self::ScratchPage, code: &[u8]) -> VmResult<()> {
        page.install(code)
    }

    fn stub_entry(page: &Self::ScratchPage) -> *const u8 {
        page.ptr
    }
}

/// A page-granular region that flips between writable and executable. It is
/// allocated writable and becomes executable on the first install.
pub(super) struct BackendScratchPage {
    ptr: *mut u8,
    len: usize,
}

impl BackendScratchPage {
    fn new(len: usize) -> VmResult<Self> {
        let ptr = alloc_scratch_region(len)?;
        Ok(Self { ptr, len })
    }

    fn install(&mut self, code: &[u8]) -> VmResult<()> {
        if code.len() > self.len {
            return Err(VmError::NativeCall(format!(
                "call stub of {} bytes exceeds the {}-byte scratch region",
                code.len(),
                self.len
            )));
        }
        make_region_writable(self.ptr, self.len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr, code.len());
        }
        make_region_executable(self.ptr, self.len)
    }
}

impl Drop for BackendScratchPage {
    fn drop(&mut self) {
        let _ = free_scratch_region(self.ptr, self.len);
    }
}

#[cfg(target_os = "linux")]
const ARG_MOVS: [[u8; 2]; 4] = [
    [0x48, 0xBF], // mov rdi, imm64
    [0x48, 0xBE], // mov rsi, imm64
    [0x48, 0xBA], // mov rdx, imm64
    [0x48, 0xB9], // mov rcx, imm64
];

#[cfg(target_os = "windows")]
const ARG_MOVS: [[u8; 2]; 4] = [
    [0x48, 0xB9], // mov rcx, imm64
    [0x48, 0xBA], // mov rdx, imm64
    [0x49, 0xB8], // mov r8, imm64
    [0x49, 0xB9], // mov r9, imm64
];

/// System V stub. The caller's `call` left rsp 8 below a 16-byte boundary,
/// pushing rbx restores alignment for the callee.
#[cfg(target_os = "linux")]
fn emit_call_stub_bytes(target: *const (), args: &[u64], varargs: bool) -> VmResult<Vec<u8>> {
    if args.len() > ARG_MOVS.len() {
        return Err(VmError::NativeCall(format!(
            "stub emitter given {} arguments, only {} fit in registers",
            args.len(),
            ARG_MOVS.len()
        )));
    }
    let mut code = Vec::with_capacity(80);
    code.push(0x53); // push rbx
    code.extend_from_slice(&[0x48, 0xBB]); // mov rbx, imm64 (target)
    code.extend_from_slice(&(target as u64).to_le_bytes());
    for (index, value) in args.iter().enumerate() {
        code.extend_from_slice(&ARG_MOVS[index]);
        code.extend_from_slice(&value.to_le_bytes());
    }
    if varargs {
        code.extend_from_slice(&[0x31, 0xC0]); // xor eax, eax (no vector arguments)
    }
    code.extend_from_slice(&[0xFF, 0xD3]); // call rbx
    code.push(0x5B); // pop rbx
    code.push(0xC3); // ret
    Ok(code)
}

/// Win64 stub. `sub rsp, 40` covers the callee's 32-byte shadow space and
/// realigns the stack. Variadic callees need no extra handling, integer
/// arguments land in the same registers either way.
#[cfg(target_os = "windows")]
fn emit_call_stub_bytes(target: *const (), args: &[u64], _varargs: bool) -> VmResult<Vec<u8>> {
    if args.len() > ARG_MOVS.len() {
        return Err(VmError::NativeCall(format!(
            "stub emitter given {} arguments, only {} fit in registers",
            args.len(),
            ARG_MOVS.len()
        )));
    }
    let mut code = Vec::with_capacity(80);
    code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x28]); // sub rsp, 40
    for (index, value) in args.iter().enumerate() {
        code.extend_from_slice(&ARG_MOVS[index]);
        code.extend_from_slice(&value.to_le_bytes());
    }
    code.extend_from_slice(&[0x48, 0xB8]); // mov rax, imm64 (target)
    code.extend_from_slice(&(target as u64).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]); // call rax
    code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x28]); // add rsp, 40
    code.push(0xC3); // ret
    Ok(code)
}

#[cfg(target_os = "linux")]
fn alloc_scratch_region(len: usize) -> VmResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(VmError::NativeCall(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "linux")]
fn make_region_writable(ptr: *mut u8, len: usize) -> VmResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_WRITE) };
    if rc != 0 {
        return Err(VmError::NativeCall(format!(
            "mprotect(PROT_READ|PROT_WRITE) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn make_region_executable(ptr: *mut u8, len: usize) -> VmResult<()> {
    let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
    if rc != 0 {
        return Err(VmError::NativeCall(format!(
            "mprotect(PROT_READ|PROT_EXEC) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn free_scratch_region(ptr: *mut u8, len: usize) -> VmResult<()> {
    if ptr.is_null() {
        return Ok(());
    }
    let rc = unsafe { libc::munmap(ptr as *mut _, len) };
    if rc != 0 {
        return Err(VmError::NativeCall(format!(
            "munmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn alloc_scratch_region(len: usize) -> VmResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(VmError::NativeCall(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(target_os = "windows")]
fn make_region_writable(ptr: *mut u8, len: usize) -> VmResult<()> {
    use windows_sys::Win32::System::Memory::{PAGE_READWRITE, VirtualProtect};

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_READWRITE, &mut old_protect) };
    if ok == 0 {
        return Err(VmError::NativeCall(format!(
            "VirtualProtect(PAGE_READWRITE) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn make_region_executable(ptr: *mut u8, len: usize) -> VmResult<()> {
    use windows_sys::Win32::{
        Foundation::HANDLE,
        System::{
            Diagnostics::Debug::FlushInstructionCache,
            Memory::{PAGE_EXECUTE_READ, VirtualProtect},
            Threading::GetCurrentProcess,
        },
    };

    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(ptr as *mut _, len, PAGE_EXECUTE_READ, &mut old_protect) };
    if ok == 0 {
        return Err(VmError::NativeCall(format!(
            "VirtualProtect(PAGE_EXECUTE_READ) failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let process: HANDLE = unsafe { GetCurrentProcess() };
    let ok = unsafe { FlushInstructionCache(process, ptr as *const _, len) };
    if ok == 0 {
        return Err(VmError::NativeCall(format!(
            "FlushInstructionCache failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(target_os = "windows")]
fn free_scratch_region(ptr: *mut u8, _len: usize) -> VmResult<()> {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    if ptr.is_null() {
        return Ok(());
    }
    let ok = unsafe { VirtualFree(ptr as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        return Err(VmError::NativeCall(format!(
            "VirtualFree failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
