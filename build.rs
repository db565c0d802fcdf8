fn main() {
    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();

    // The hypervisor shim only exists on Apple Silicon macOS. Elsewhere the
    // crate still builds so the device emulation can be tested off-target.
    if os == "macos" && arch == "aarch64" {
        // Link against Hypervisor framework
        println!("cargo:rustc-link-lib=framework=Hypervisor");
        println!("cargo:rerun-if-changed=src/hypervisor/ffi.c");

        // Build the Hypervisor FFI bindings
        cc::Build::new()
            .file("src/hypervisor/ffi.c")
            .compile("hvffi");
    }
}
