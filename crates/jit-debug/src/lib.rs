//! Debugger support for JIT-compiled wasm functions.
//!
//! A [`JitDebugInfo`] collects the name and address range of every function
//! of a compiled module. [`JitDebugInfo::register`] turns it into a small ELF
//! image with DWARF subprogram entries and publishes it through the GDB JIT
//! interface, so `gdb` and `lldb` can name JIT frames. The same table, once
//! made active with [`JitDebugInfo::set_active`], serves in-process address
//! lookup for trap backtraces.

#![warn(missing_docs, trivial_numeric_casts, unused_extern_crates)]

mod gdb_jit_int;
mod image;
mod registry;

pub use crate::gdb_jit_int::GdbJitImageRegistration;
pub use crate::image::{FunctionInfo, JitDebugInfo, MAX_NAME_LEN, Symbolized};
pub use crate::registry::{
    DUMP_ENV, JitRegistration, active_range, clear_active, format_backtrace, lookup,
};

/// Failures while synthesizing a debug image.
#[derive(Debug, thiserror::Error)]
pub enum DebugInfoError {
    /// There is nothing to describe.
    #[error("no functions were added")]
    NoFunctions,
    /// The host architecture has no ELF machine mapping here.
    #[error("debug images are not supported on this architecture")]
    UnsupportedArchitecture,
    /// DWARF emission failed.
    #[error("failed to emit DWARF")]
    Dwarf(#[from] gimli::write::Error),
    /// Object emission failed.
    #[error("failed to write the object file")]
    Object(#[from] object::write::Error),
    /// The emitted object did not have the expected layout.
    #[error("unexpected object file layout")]
    MalformedImage,
}
