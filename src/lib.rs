//! Native execution support for a WebAssembly JIT compiler.
//!
//! This crate bundles the two halves a code generator links against:
//!
//! * the runtime ([`wasmjit_runtime`], re-exported at the crate root), which
//!   owns execution contexts, linear memories, tables, the GC heap, exception
//!   handlers and the trap machinery, and exposes the [`libcalls`] that
//!   generated code calls into;
//! * debugger integration ([`jit_debug`]), which describes compiled
//!   functions to `gdb`/`lldb` and symbolicates trap backtraces.
//!
//! A typical embedding configures the runtime once, creates a [`VMContext`]
//! per instance and enters generated code through [`call_trampoline`]:
//!
//! ```no_run
//! let mut config = wasmjit::RuntimeConfig::new();
//! config.wasm_stack_size(2 << 20);
//! wasmjit::init(&config);
//!
//! let mut ctx = wasmjit::VMContext::new(0);
//! ctx.alloc_memory(&config, 1, None)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

#![warn(missing_docs)]

pub use wasmjit_jit_debug as jit_debug;
pub use wasmjit_runtime::*;

/// Applies `config`'s process-wide settings and installs the trap handlers.
///
/// Calling this up front is optional; the first [`catch_traps`] on any
/// thread installs the handlers lazily with the default configuration.
pub fn init(config: &RuntimeConfig) {
    config.apply();
    init_traps();
    log::debug!("wasmjit runtime {VERSION} initialized");
}
