use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Mutex;

use uvm::{
    Cell, FirmwareBuilder, OverrideRegistry, POINTER_SIZE, Vm, VmConfig, VmError, load_firmware,
};

fn trampoline_emitter_supported() -> bool {
    (cfg!(target_arch = "x86_64") && (cfg!(target_os = "linux") || cfg!(target_os = "windows")))
        || (cfg!(target_arch = "aarch64")
            && (cfg!(target_os = "linux") || cfg!(target_os = "macos")))
}

/// Portable dispatch always, emitted trampolines where the host has them.
fn backend_modes() -> Vec<bool> {
    let mut modes = vec![false];
    if trampoline_emitter_supported() {
        modes.push(true);
    }
    modes
}

/// Variadic emission is refused on aarch64-macos; the portable shape
/// covers that host.
#[cfg(unix)]
fn vararg_backend_modes() -> Vec<bool> {
    let mut modes = vec![false];
    if trampoline_emitter_supported()
        && !(cfg!(target_arch = "aarch64") && cfg!(target_os = "macos"))
    {
        modes.push(true);
    }
    modes
}

fn run_image(image: &[u8], overrides: &OverrideRegistry, emitted: bool) -> Vm {
    let firmware = load_firmware(image, overrides).expect("image should load");
    let mut vm = Vm::with_config(
        firmware,
        VmConfig {
            emitted_trampolines: emitted,
            ..VmConfig::default()
        },
    );
    vm.run().expect("vm should run");
    vm
}

extern "C" fn weighted_sum(a: u64, b: u64, c: u64, d: u64) -> u64 {
    a.wrapping_add(b.wrapping_mul(2))
        .wrapping_add(c.wrapping_mul(3))
        .wrapping_add(d.wrapping_mul(4))
}

extern "C" fn cstr_len(text: *const c_char) -> u64 {
    unsafe { CStr::from_ptr(text) }.to_bytes().len() as u64
}

extern "C" fn prefix_plus_len(prefix: u64, text: *const c_char) -> u64 {
    prefix.wrapping_add(unsafe { CStr::from_ptr(text) }.to_bytes().len() as u64)
}

extern "C" fn big_number() -> u64 {
    0x0807_0605_0403_0201
}

extern "C" fn echo(value: u64) -> u64 {
    value
}

#[test]
fn arguments_arrive_in_push_order() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("weighted_sum", weighted_sum as *const ());
    let mut builder = FirmwareBuilder::new();
    let sum = builder.import_external("weighted_sum", 4, false, 8);
    builder.push_u64(1);
    builder.push_u64(2);
    builder.push_u64(3);
    builder.push_u64(4);
    builder.call(sum);
    builder.ret();
    let image = builder.finish().expect("image should build");

    for emitted in backend_modes() {
        let vm = run_image(&image, &overrides, emitted);
        // 1 + 2*2 + 3*3 + 4*4
        assert_eq!(vm.stack(), &[Cell::from_u64(30)], "emitted={emitted}");
    }
}

#[test]
fn wide_cells_pass_as_pointers() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("cstr_len", cstr_len as *const ());
    let mut builder = FirmwareBuilder::new();
    let length = builder.import_external("cstr_len", 1, false, 8);
    builder.push_cstr("twelve chars!");
    builder.call(length);
    builder.ret();
    let image = builder.finish().expect("image should build");

    for emitted in backend_modes() {
        let vm = run_image(&image, &overrides, emitted);
        assert_eq!(vm.stack(), &[Cell::from_u64(13)], "emitted={emitted}");
    }
}

#[test]
fn narrow_and_wide_arguments_mix() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("prefix_plus_len", prefix_plus_len as *const ());
    let mut builder = FirmwareBuilder::new();
    let sum = builder.import_external("prefix_plus_len", 2, false, 8);
    builder.push_u8(0xEE); // must survive the call
    builder.push_u8(5);
    builder.push_cstr("hello big str");
    builder.call(sum);
    builder.ret();
    let image = builder.finish().expect("image should build");

    for emitted in backend_modes() {
        let vm = run_image(&image, &overrides, emitted);
        assert_eq!(
            vm.stack(),
            &[Cell::from_bytes(&[0xEE]), Cell::from_u64(18)],
            "emitted={emitted}"
        );
    }
}

#[test]
fn result_cells_follow_the_declared_out_size() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("big_number", big_number as *const ());
    let mut builder = FirmwareBuilder::new();
    let discarded = builder.import_external("big_number", 0, false, 0);
    let low_byte = builder.import_external("big_number", 0, false, 1);
    let low_word = builder.import_external("big_number", 0, false, 4);
    builder.call(discarded);
    builder.call(low_byte);
    builder.call(low_word);
    builder.ret();
    let image = builder.finish().expect("image should build");

    for emitted in backend_modes() {
        let vm = run_image(&image, &overrides, emitted);
        assert_eq!(
            vm.stack(),
            &[Cell::from_bytes(&[0x01]), Cell::from_u32(0x0403_0201)],
            "emitted={emitted}"
        );
    }
}

#[test]
fn pointer_width_results_use_out_size_minus_one() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("big_number", big_number as *const ());
    let mut builder = FirmwareBuilder::new();
    let wide = builder.import_external("big_number", 0, false, -1);
    builder.call(wide);
    builder.ret();
    let image = builder.finish().expect("image should build");

    let expected = Cell::from_bytes(&0x0807_0605_0403_0201u64.to_le_bytes()[..POINTER_SIZE]);
    for emitted in backend_modes() {
        let vm = run_image(&image, &overrides, emitted);
        assert_eq!(vm.stack(), &[expected.clone()], "emitted={emitted}");
    }
}

#[test]
fn missing_arguments_underflow() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("prefix_plus_len", prefix_plus_len as *const ());
    let mut builder = FirmwareBuilder::new();
    let sum = builder.import_external("prefix_plus_len", 2, false, 8);
    builder.push_u64(1); // one cell, two declared
    builder.call(sum);
    builder.ret();
    let image = builder.finish().expect("image should build");

    let firmware = load_firmware(&image, &overrides).expect("image should load");
    let mut vm = Vm::new(firmware);
    let err = vm.run().expect_err("a short stack should trap");
    assert!(matches!(err, VmError::StackUnderflow { at: 13 }));
}

#[test]
fn rsp_cells_round_trip_through_natives() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("echo", echo as *const ());
    let mut builder = FirmwareBuilder::new();
    let id = builder.import_external("echo", 1, false, -1);
    builder.push_u64(0x2000);
    builder.set_rsp();
    builder.get_rsp();
    builder.call(id);
    builder.ret();
    let image = builder.finish().expect("image should build");

    let expected = Cell::from_bytes(&0x2000u64.to_le_bytes()[..POINTER_SIZE]);
    for emitted in backend_modes() {
        let vm = run_image(&image, &overrides, emitted);
        assert_eq!(vm.stack(), &[expected.clone()], "emitted={emitted}");
        assert_eq!(vm.rsp(), 0x2000);
    }
}

#[test]
fn repeated_calls_reuse_the_bridge() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("echo", echo as *const ());
    let mut builder = FirmwareBuilder::new();
    let id = builder.import_external("echo", 1, false, 8);
    for value in [7u64, 8, 9] {
        builder.push_u64(value);
        builder.call(id);
    }
    builder.ret();
    let image = builder.finish().expect("image should build");

    for emitted in backend_modes() {
        let vm = run_image(&image, &overrides, emitted);
        assert_eq!(
            vm.stack(),
            &[Cell::from_u64(7), Cell::from_u64(8), Cell::from_u64(9)],
            "emitted={emitted}"
        );
    }
}

#[test]
fn argument_counts_beyond_the_marshaler_trap() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("weighted_sum", weighted_sum as *const ());
    let mut builder = FirmwareBuilder::new();
    let sum = builder.import_external("weighted_sum", 4, false, 8);
    for value in 1..=5u8 {
        builder.push_u8(value);
    }
    builder.call(sum);
    builder.ret();
    let image = builder.finish().expect("image should build");

    // the loader caps external counts, so forge a wider one
    let mut firmware = load_firmware(&image, &overrides).expect("image should load");
    firmware.imports[0].arg_count = 5;
    let mut vm = Vm::new(firmware);
    let err = vm.run().expect_err("a five-argument native call should trap");
    match err {
        VmError::NativeCall(message) => assert!(message.contains("5 arguments")),
        other => panic!("expected a native-call error, got {other:?}"),
    }
}

#[cfg(unix)]
#[test]
fn varargs_printf_returns_the_rendered_length() {
    let mut builder = FirmwareBuilder::new();
    let printf = builder.import_external("printf", 2, true, 4);
    builder.push_cstr("Hello world! The answer to life, the universe, and everything is %d\n");
    builder.push_u32(42);
    builder.call(printf);
    builder.ret();
    let image = builder.finish().expect("image should build");

    let rendered = format!(
        "Hello world! The answer to life, the universe, and everything is {}\n",
        42
    );
    for emitted in vararg_backend_modes() {
        let vm = run_image(&image, &OverrideRegistry::new(), emitted);
        assert_eq!(
            vm.stack(),
            &[Cell::from_u32(rendered.len() as u32)],
            "emitted={emitted}"
        );
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
#[test]
fn emitted_variadic_calls_are_refused_on_this_target() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("record_rendered", record_rendered as *const ());
    let mut builder = FirmwareBuilder::new();
    let rendered = builder.import_external("record_rendered", 2, true, 8);
    builder.push_cstr("%d");
    builder.push_u32(42);
    builder.call(rendered);
    builder.ret();
    let image = builder.finish().expect("image should build");

    let firmware = load_firmware(&image, &overrides).expect("image should load");
    let mut vm = Vm::with_config(
        firmware,
        VmConfig {
            emitted_trampolines: true,
            ..VmConfig::default()
        },
    );
    let err = vm.run().expect_err("variadic emission should be refused");
    assert!(matches!(err, VmError::NativeCall(_)));
}

static RECORDED: Mutex<Vec<String>> = Mutex::new(Vec::new());

extern "C" fn record_text(text: *const c_char) {
    let text = unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned();
    RECORDED.lock().expect("recorder lock should be clean").push(text);
}

extern "C" fn record_rendered(format: *const c_char, value: u64) -> u64 {
    let format = unsafe { CStr::from_ptr(format) }.to_string_lossy().into_owned();
    let rendered = format.replace("%d", &value.to_string());
    let length = rendered.len() as u64;
    RECORDED
        .lock()
        .expect("recorder lock should be clean")
        .push(rendered);
    length
}

#[test]
fn the_demo_scenario_records_both_natives() {
    let mut overrides = OverrideRegistry::new();
    overrides.bind("record_rendered", record_rendered as *const ());
    overrides.bind("record_text", record_text as *const ());
    let mut builder = FirmwareBuilder::new();
    let rendered = builder.import_external("record_rendered", 2, false, -1);
    let text = builder.import_external("record_text", 1, false, 0);
    builder.push_cstr("Cool demo");
    builder.call(text);
    builder.push_cstr("Hello world! The answer to life, the universe, and everything is %d\n");
    builder.push_u32(42);
    builder.call(rendered);
    builder.ret();
    let image = builder.finish().expect("image should build");

    let expected = "Hello world! The answer to life, the universe, and everything is 42\n";
    for emitted in backend_modes() {
        RECORDED.lock().expect("recorder lock should be clean").clear();
        let vm = run_image(&image, &overrides, emitted);
        assert_eq!(
            RECORDED
                .lock()
                .expect("recorder lock should be clean")
                .as_slice(),
            &["Cool demo".to_string(), expected.to_string()],
            "emitted={emitted}"
        );
        assert_eq!(
            vm.stack(),
            &[Cell::from_bytes(
                &(expected.len() as u64).to_le_bytes()[..POINTER_SIZE]
            )],
            "emitted={emitted}"
        );
    }
}
