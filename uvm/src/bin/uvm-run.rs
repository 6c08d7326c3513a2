use std::ffi::CStr;
use std::io;
use std::os::raw::c_char;

use uvm::{
    BuildError, DEFAULT_HEAP_SIZE, FirmwareBuilder, OverrideRegistry, Vm, VmConfig,
    disassemble_firmware, load_firmware, validate_firmware,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliConfig {
    image_path: Option<String>,
    emit_demo_path: Option<String>,
    disasm: bool,
    validate: bool,
    heap_size: Option<usize>,
    portable_calls: bool,
    show_help: bool,
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cli = CliConfig::default();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--help" | "-h" => cli.show_help = true,
            "--disasm" => cli.disasm = true,
            "--validate" => cli.validate = true,
            "--portable-calls" => cli.portable_calls = true,
            "--emit-demo" => {
                index += 1;
                let path = args
                    .get(index)
                    .ok_or_else(|| "missing value for --emit-demo".to_string())?;
                cli.emit_demo_path = Some(path.clone());
            }
            "--heap-size" => {
                index += 1;
                let raw = args
                    .get(index)
                    .ok_or_else(|| "missing value for --heap-size".to_string())?;
                let bytes: usize = raw
                    .parse()
                    .map_err(|_| format!("invalid --heap-size value '{raw}'"))?;
                cli.heap_size = Some(bytes);
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option '{other}'"));
            }
            other => {
                if cli.image_path.is_some() {
                    return Err(format!("unexpected extra argument '{other}'"));
                }
                cli.image_path = Some(other.to_string());
            }
        }
        index += 1;
    }
    Ok(cli)
}

fn print_usage() {
    println!("usage: uvm-run [options] <image>");
    println!();
    println!("options:");
    println!("  --disasm            print the import table and disassembly, do not run");
    println!("  --validate          structurally check the code region, do not run");
    println!("  --heap-size BYTES   guest heap arena size (default {DEFAULT_HEAP_SIZE})");
    println!("  --portable-calls    route native calls through fixed call shapes");
    println!("  --emit-demo PATH    write the built-in demo image to PATH and exit");
    println!("  -h, --help          show this help");
}

/// Demo native: prints the C string argument it receives from the guest.
extern "C" fn nativefunc(text: *const c_char) {
    if text.is_null() {
        return;
    }
    let text = unsafe { CStr::from_ptr(text) };
    println!("{}", text.to_string_lossy());
}

/// Demo native: returns the sum of its arguments.
extern "C" fn uvm_add(a: u64, b: u64) -> u64 {
    a.wrapping_add(b)
}

fn register_demo_bindings(overrides: &mut OverrideRegistry) {
    overrides.bind("nativefunc", nativefunc as *const ());
    overrides.bind("uvm_add", uvm_add as *const ());
}

/// The image `--emit-demo` writes: greets through an override native, sums
/// 40 and 2 through another, and hands the result to printf resolved
/// straight from the process.
fn build_demo_image() -> Result<Vec<u8>, BuildError> {
    let mut builder = FirmwareBuilder::new();
    let printf = builder.import_external("printf", 2, true, -1);
    let nativefunc = builder.import_external("nativefunc", 1, false, 0);
    let uvm_add = builder.import_external("uvm_add", 2, false, 8);

    builder.push_cstr("Cool demo");
    builder.call(nativefunc);

    builder.push_cstr("Hello world! The answer to life, the universe, and everything is %d\n");
    builder.push_u32(40);
    builder.push_u32(2);
    builder.call(uvm_add);
    builder.call(printf);
    builder.pop();
    builder.ret();
    builder.finish()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;

    if cli.show_help {
        print_usage();
        return Ok(());
    }

    if let Some(path) = cli.emit_demo_path.as_ref() {
        let image = build_demo_image()?;
        std::fs::write(path, &image)?;
        println!("wrote {} bytes to {path}", image.len());
        return Ok(());
    }

    let Some(image_path) = cli.image_path.as_ref() else {
        print_usage();
        return Err(io::Error::other("missing image path").into());
    };
    let bytes = std::fs::read(image_path)?;

    let mut overrides = OverrideRegistry::new();
    register_demo_bindings(&mut overrides);
    let firmware = load_firmware(&bytes, &overrides)?;

    if cli.disasm {
        print!("{}", disassemble_firmware(&firmware));
        return Ok(());
    }
    if cli.validate {
        validate_firmware(&firmware)?;
        println!(
            "ok: {} imports, {} code bytes",
            firmware.imports.len(),
            firmware.code.len()
        );
        return Ok(());
    }

    let mut config = VmConfig::default();
    if let Some(heap_size) = cli.heap_size {
        config.heap_size = heap_size;
    }
    if cli.portable_calls {
        config.emitted_trampolines = false;
    }
    let mut vm = Vm::with_config(firmware, config);
    vm.run()?;
    println!("vm halted; stack holds {} cells", vm.stack().len());
    Ok(())
}
