use std::collections::HashMap;

/// Maps an import name to a callable host address during firmware loading.
///
/// The loader resolves every external import through one of these before it
/// returns, so resolution policy lives entirely with the embedder.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<*const ()>;
}

/// Name to function-pointer bindings supplied by the embedder.
///
/// As a [`SymbolResolver`] it consults its own bindings first and falls back
/// to [`process_symbol`], so a program can call straight into libc while the
/// embedder overrides or stubs individual names. An empty registry resolves
/// purely from the process.
pub struct OverrideRegistry {
    bindings: HashMap<String, *const ()>,
}

impl OverrideRegistry {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Binds `name` to `function`, replacing any previous binding.
    pub fn bind(&mut self, name: impl Into<String>, function: *const ()) {
        self.bindings.insert(name.into(), function);
    }

    pub fn get(&self, name: &str) -> Option<*const ()> {
        self.bindings.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl Default for OverrideRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolResolver for OverrideRegistry {
    fn resolve(&self, name: &str) -> Option<*const ()> {
        self.get(name).or_else(|| process_symbol(name))
    }
}

/// Looks `name` up among the symbols already linked into this process.
#[cfg(unix)]
pub fn process_symbol(name: &str) -> Option<*const ()> {
    let symbol = std::ffi::CString::new(name).ok()?;
    let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
    if address.is_null() {
        None
    } else {
        Some(address as *const ())
    }
}

/// Looks `name` up among the symbols already linked into this process.
///
/// There is no `RTLD_DEFAULT` equivalent on Windows, so this walks every
/// module loaded into the process and asks each one in turn.
#[cfg(windows)]
pub fn process_symbol(name: &str) -> Option<*const ()> {
    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::LibraryLoader::GetProcAddress;
    use windows_sys::Win32::System::ProcessStatus::K32EnumProcessModules;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let symbol = std::ffi::CString::new(name).ok()?;
    let mut modules = [std::ptr::null_mut::<std::ffi::c_void>(); 512];
    let mut needed = 0u32;
    let ok = unsafe {
        K32EnumProcessModules(
            GetCurrentProcess(),
            modules.as_mut_ptr(),
            std::mem::size_of_val(&modules) as u32,
            &mut needed,
        )
    };
    if ok == 0 {
        return None;
    }
    let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(modules.len());
    for &module in &modules[..count] {
        let address = unsafe { GetProcAddress(module, symbol.as_ptr() as *const u8) };
        if let Some(address) = address {
            return Some(address as *const ());
        }
    }
    None
}

#[cfg(not(any(unix, windows)))]
pub fn process_symbol(_name: &str) -> Option<*const ()> {
    None
}
