use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // `helpers.c` is written against the POSIX `sigsetjmp` family, so there is
    // nothing to build on other hosts.
    if env::var("CARGO_CFG_UNIX").is_err() {
        return;
    }

    let mut build = cc::Build::new();
    build.warnings(true);
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap();
    build.define(&format!("CFG_TARGET_OS_{os}"), None);
    build.define(&format!("CFG_TARGET_ARCH_{arch}"), None);
    println!("cargo:rerun-if-changed=src/helpers.c");
    build.file("src/helpers.c");
    build.compile("wasmjit-helpers");
}
