use super::{MAX_NATIVE_ARGS, VmError, VmResult};

#[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")))]
mod x86_64;

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
mod aarch64;

mod shapes;

/// Scratch region size for emitted stubs. A full four-argument stub stays
/// under 100 bytes on both architectures, one page is plenty.
#[cfg(any(
    all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
))]
const SCRATCH_LEN: usize = 4096;

#[cfg(any(
    all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
))]
type StubEntry = unsafe extern "C" fn() -> u64;

/// One trampoline backend: emits a self-contained call stub with the target
/// address and argument values baked in as immediates, and owns the
/// executable scratch region the stub runs from.
#[cfg(any(
    all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
))]
trait NativeBackend {
    type ScratchPage;

    fn emit_call_stub(target: *const (), args: &[u64], varargs: bool) -> VmResult<Vec<u8>>;
    fn scratch_page() -> VmResult<Self::ScratchPage>;
    fn install_stub(page: &mut Self::ScratchPage, code: &[u8]) -> VmResult<()>;
    fn stub_entry(page: &Self::ScratchPage) -> *const u8;
}

#[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")))]
type ActiveBackend = x86_64::X86_64Backend;

#[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos")))]
type ActiveBackend = aarch64::AArch64Backend;

#[cfg(any(
    all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
    all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
))]
type ScratchPage = <ActiveBackend as NativeBackend>::ScratchPage;

pub(super) fn emitter_supported() -> bool {
    (cfg!(target_arch = "x86_64") && (cfg!(target_os = "linux") || cfg!(target_os = "windows")))
        || (cfg!(target_arch = "aarch64")
            && (cfg!(target_os = "linux") || cfg!(target_os = "macos")))
}

/// Dispatches native calls for one VM. Holding it by `&mut` through every
/// invocation is what keeps the single scratch page sound: a second call
/// cannot start while a stub is still running.
pub(super) struct NativeBridge {
    #[cfg_attr(
        not(any(
            all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
            all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
        )),
        allow(dead_code)
    )]
    emit: bool,
    #[cfg(any(
        all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
        all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
    ))]
    scratch: Option<ScratchPage>,
}

impl NativeBridge {
    pub(super) fn new(emit: bool) -> Self {
        Self {
            emit,
            #[cfg(any(
                all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
                all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
            ))]
            scratch: None,
        }
    }

    pub(super) fn invoke(
        &mut self,
        target: *const (),
        args: &[u64],
        varargs: bool,
    ) -> VmResult<u64> {
        if args.len() > MAX_NATIVE_ARGS {
            return Err(VmError::NativeCall(format!(
                "native call with {} arguments, at most {MAX_NATIVE_ARGS} are supported",
                args.len()
            )));
        }
        #[cfg(any(
            all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
            all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
        ))]
        if self.emit {
            return self.invoke_emitted(target, args, varargs);
        }
        shapes::invoke_call(target, args, varargs)
    }

    #[cfg(any(
        all(target_arch = "x86_64", any(target_os = "linux", target_os = "windows")),
        all(target_arch = "aarch64", any(target_os = "linux", target_os = "macos"))
    ))]
    fn invoke_emitted(
        &mut self,
        target: *const (),
        args: &[u64],
        varargs: bool,
    ) -> VmResult<u64> {
        let code = ActiveBackend::emit_call_stub(target, args, varargs)?;
        if self.scratch.is_none() {
            self.scratch = Some(ActiveBackend::scratch_page()?);
        }
        let scratch = self
            .scratch
            .as_mut()
            .ok_or_else(|| VmError::NativeCall("scratch page unavailable".to_string()))?;
        ActiveBackend::install_stub(scratch, &code)?;
        let entry: StubEntry = unsafe { std::mem::transmute(ActiveBackend::stub_entry(scratch)) };
        Ok(unsafe { entry() })
    }
}
