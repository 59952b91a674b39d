use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();

    if arch == "aarch64" {
        compile_asm_archive(&out_dir, "src/arch/aarch64/boot.S", "boot");
        compile_asm_archive(&out_dir, "src/arch/aarch64/switch.S", "switch");
    }
}

fn compile_asm_archive(out_dir: &PathBuf, src: &str, name: &str) {
    let obj = out_dir.join(format!("{name}.o"));

    println!("cargo:rerun-if-changed={}", src);

    let status = Command::new("aarch64-linux-gnu-gcc")
        .args(&["-c", src, "-o", obj.to_str().unwrap(), "-nostdlib", "-ffreestanding"])
        .status()
        .unwrap_or_else(|e| panic!("failed to invoke assembler for {src}: {e}"));
    assert!(status.success(), "failed to compile {src}");

    let archive = out_dir.join(format!("lib{name}.a"));
    let status = Command::new("aarch64-linux-gnu-ar")
        .args(&["crs", archive.to_str().unwrap(), obj.to_str().unwrap()])
        .status()
        .unwrap_or_else(|e| panic!("failed to invoke archiver for {name}: {e}"));
    assert!(status.success(), "failed to archive {name}");

    println!("cargo:rustc-link-search=native={}", out_dir.display());
    println!("cargo:rustc-link-lib=static={name}");
}
