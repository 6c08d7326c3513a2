use super::super::{VmError, VmResult};
use super::NativeBackend;

pub(super) struct AArch64Backend;

impl NativeBackend for AArch64Backend {
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

/// Scratch region for emitted stubs. On Linux it flips between writable and
/// executable with `mprotect`; on macOS it is mapped `MAP_JIT` and writes go
/// through the per-thread JIT write-protect toggle instead.
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
        write_stub_code(self.ptr, code)?;
        make_region_executable(self.ptr, self.len)
    }
}

impl Drop for BackendScratchPage {
    fn drop(&mut self) {
        let _ = free_scratch_region(self.ptr, self.len);
    }
}

// x0..x3 carry the marshaled arguments, x16 is the intra-procedure scratch
// register holding the call target.
const ARG_REGISTERS: [u8; 4] = [0, 1, 2, 3];
const TARGET_REGISTER: u8 = 16;

fn emit_call_stub_bytes(target: *const (), args: &[u64], varargs: bool) -> VmResult<Vec<u8>> {
    // AAPCS64 on macOS passes every anonymous argument on the stack, which
    // a register-only stub cannot express.
    #[cfg(target_os = "macos")]
    if varargs {
        return Err(VmError::NativeCall(
            "variadic natives are not callable through emitted stubs on aarch64-macos".to_string(),
        ));
    }
    #[cfg(target_os = "linux")]
    let _ = varargs; // x0..x7 carry fixed and variadic integers alike

    if args.len() > ARG_REGISTERS.len() {
        return Err(VmError::NativeCall(format!(
            "stub emitter given {} arguments, only {} fit in registers",
            args.len(),
            ARG_REGISTERS.len()
        )));
    }
    let mut code = Vec::with_capacity(96);
    emit_u32(&mut code, 0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
    for (index, value) in args.iter().enumerate() {
        emit_mov_imm64(&mut code, ARG_REGISTERS[index], *value);
    }
    emit_mov_imm64(&mut code, TARGET_REGISTER, target as u64);
    emit_u32(&mut code, 0xD63F_0200); // blr x16
    emit_u32(&mut code, 0xA8C1_7BFD); // ldp x29, x30, [sp], #16
    emit_u32(&mut code, 0xD65F_03C0); // ret
    Ok(code)
}

/// Loads a 64-bit immediate into `dst`: a `movz` for the low 16 bits zeroes
/// the whole register, then a `movk` per remaining nonzero 16-bit chunk.
fn emit_mov_imm64(code: &mut Vec<u8>, dst: u8, value: u64) {
    let parts = [
        (value & 0xFFFF) as u32,
        ((value >> 16) & 0xFFFF) as u32,
        ((value >> 32) & 0xFFFF) as u32,
        ((value >> 48) & 0xFFFF) as u32,
    ];
    emit_u32(code, 0xD280_0000 | (parts[0] << 5) | dst as u32);
    for (shift_index, &part) in parts.iter().enumerate().skip(1) {
        if part != 0 {
            emit_u32(
                code,
                0xF280_0000 | ((shift_index as u32) << 21) | (part << 5) | dst as u32,
            );
        }
    }
}

fn emit_u32(code: &mut Vec<u8>, instruction: u32) {
    code.extend_from_slice(&instruction.to_le_bytes());
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

#[cfg(target_os = "macos")]
fn alloc_scratch_region(len: usize) -> VmResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(VmError::NativeCall(format!(
            "mmap(MAP_JIT) failed: {}",
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

#[cfg(target_os = "macos")]
fn make_region_writable(_ptr: *mut u8, _len: usize) -> VmResult<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn write_stub_code(ptr: *mut u8, code: &[u8]) -> VmResult<()> {
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        __clear_cache(ptr as *mut libc::c_char, ptr.add(code.len()) as *mut libc::c_char);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn write_stub_code(ptr: *mut u8, code: &[u8]) -> VmResult<()> {
    unsafe {
        let use_write_protect = pthread_jit_write_protect_supported_np() != 0;
        if use_write_protect {
            pthread_jit_write_protect_np(0);
        }
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        if use_write_protect {
            pthread_jit_write_protect_np(1);
        }
        sys_icache_invalidate(ptr as *mut libc::c_void, code.len());
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

#[cfg(target_os = "macos")]
fn make_region_executable(_ptr: *mut u8, _len: usize) -> VmResult<()> {
    Ok(())
}

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

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(target_os = "macos")]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
    fn sys_icache_invalidate(start: *mut libc::c_void, size: libc::size_t);
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn forty_two() -> u64 {
        42
    }

    extern "C" fn weighted_sum(a: u64, b: u64, c: u64, d: u64) -> u64 {
        a.wrapping_add(b.wrapping_mul(2))
            .wrapping_add(c.wrapping_mul(3))
            .wrapping_add(d.wrapping_mul(4))
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
            .collect()
    }

    fn run_stub(target: *const (), args: &[u64], varargs: bool) -> u64 {
        let code = emit_call_stub_bytes(target, args, varargs).expect("stub should emit");
        let mut page =
            BackendScratchPage::new(super::super::SCRATCH_LEN).expect("scratch page should map");
        page.install(&code).expect("stub should install");
        let entry: super::super::StubEntry = unsafe { std::mem::transmute(page.ptr) };
        unsafe { entry() }
    }

    #[test]
    fn mov_imm64_zeroes_then_patches() {
        let mut code = Vec::new();
        emit_mov_imm64(&mut code, 0, 0);
        assert_eq!(words(&code), vec![0xD280_0000]); // movz x0, #0

        code.clear();
        emit_mov_imm64(&mut code, 16, 0x1234_0000_5678);
        // movz x16, #0x5678 then movk x16, #0x1234, lsl #32; the zero part
        // in between needs no instruction.
        assert_eq!(words(&code), vec![0xD28A_CF10, 0xF2C2_4690]);
    }

    #[test]
    fn stub_frames_the_call() {
        let code = emit_call_stub_bytes(forty_two as *const (), &[], false)
            .expect("stub should emit");
        let words = words(&code);
        assert_eq!(words.first(), Some(&0xA9BF_7BFD)); // stp x29, x30, [sp, #-16]!
        assert_eq!(words.last(), Some(&0xD65F_03C0)); // ret
        assert!(words.contains(&0xD63F_0200)); // blr x16
    }

    #[test]
    fn stub_calls_a_no_arg_native() {
        assert_eq!(run_stub(forty_two as *const (), &[], false), 42);
    }

    #[test]
    fn arguments_reach_registers_in_order() {
        assert_eq!(
            run_stub(weighted_sum as *const (), &[1, 2, 3, 4], false),
            30
        );
    }

    #[test]
    fn page_is_rewritten_between_installs() {
        extern "C" fn seven() -> u64 {
            7
        }

        let mut page =
            BackendScratchPage::new(super::super::SCRATCH_LEN).expect("scratch page should map");
        for (target, expected) in [
            (forty_two as *const (), 42u64),
            (seven as *const (), 7),
            (forty_two as *const (), 42),
        ] {
            let code = emit_call_stub_bytes(target, &[], false).expect("stub should emit");
            page.install(&code).expect("stub should install");
            let entry: super::super::StubEntry = unsafe { std::mem::transmute(page.ptr) };
            assert_eq!(unsafe { entry() }, expected);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn variadic_stub_calls_snprintf() {
        let mut buf = [0u8; 64];
        let format = b"%d\0";
        let snprintf: unsafe extern "C" fn(
            *mut libc::c_char,
            libc::size_t,
            *const libc::c_char,
            ...
        ) -> libc::c_int = libc::snprintf;
        let args = [
            buf.as_mut_ptr() as u64,
            buf.len() as u64,
            format.as_ptr() as u64,
            42,
        ];
        let written = run_stub(snprintf as *const (), &args, true);
        assert_eq!(written, 2);
        assert_eq!(&buf[..3], b"42\0");
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn variadic_stubs_are_refused() {
        let err = emit_call_stub_bytes(forty_two as *const (), &[1], true)
            .expect_err("variadic emit should fail here");
        assert!(matches!(err, VmError::NativeCall(_)));
    }
}
