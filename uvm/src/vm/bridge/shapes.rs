use super::super::{VmError, VmResult};

// Fixed C call shapes, one per arity. Every marshaled argument is a u64 by
// the time it gets here, so these five signatures cover all register-passed
// calls without emitting code. Callees that return nothing leave the result
// register undefined; a zero out size discards it upstream.
type Call0 = unsafe extern "C" fn() -> u64;
type Call1 = unsafe extern "C" fn(u64) -> u64;
type Call2 = unsafe extern "C" fn(u64, u64) -> u64;
type Call3 = unsafe extern "C" fn(u64, u64, u64) -> u64;
type Call4 = unsafe extern "C" fn(u64, u64, u64, u64) -> u64;

// Variadic callees go through a C-variadic shape so the compiler applies
// the target's variadic convention (on aarch64-macos that means the stack,
// which baked-register stubs cannot express). The first argument is treated
// as the only named parameter, the printf pattern.
type VarArgCall = unsafe extern "C" fn(u64, ...) -> u64;

pub(super) fn invoke_call(target: *const (), args: &[u64], varargs: bool) -> VmResult<u64> {
    let result = unsafe {
        if varargs && !args.is_empty() {
            let call: VarArgCall = std::mem::transmute(target);
            match args.len() {
                1 => call(args[0]),
                2 => call(args[0], args[1]),
                3 => call(args[0], args[1], args[2]),
                4 => call(args[0], args[1], args[2], args[3]),
                len => {
                    return Err(VmError::NativeCall(format!(
                        "native call with {len} arguments, at most 4 are supported"
                    )));
                }
            }
        } else {
            match args.len() {
                0 => std::mem::transmute::<*const (), Call0>(target)(),
                1 => std::mem::transmute::<*const (), Call1>(target)(args[0]),
                2 => std::mem::transmute::<*const (), Call2>(target)(args[0], args[1]),
                3 => std::mem::transmute::<*const (), Call3>(target)(args[0], args[1], args[2]),
                4 => std::mem::transmute::<*const (), Call4>(target)(
                    args[0], args[1], args[2], args[3],
                ),
                len => {
                    return Err(VmError::NativeCall(format!(
                        "native call with {len} arguments, at most 4 are supported"
                    )));
                }
            }
        }
    };
    Ok(result)
}
