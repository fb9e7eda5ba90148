//! Runtime library support for code emitted by the wasmjit compiler.
//!
//! Generated code and the runtime share one [`VMContext`] per module
//! instance. Generated code reads the context's fixed prefix directly and
//! calls back into the runtime through the [`libcalls`] catalog; the host
//! enters generated code with [`call_trampoline`] or
//! [`call_trampoline_on_stack`], which convert any trap into a [`TrapCode`].

#![warn(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

#[cfg(not(unix))]
compile_error!("wasmjit-runtime supports Unix hosts only");

mod code_memory;
mod config;
mod exception;
mod gc;
mod memory;
mod mmap;
mod segments;
mod stack;
mod table;
mod trap;
mod traphandlers;
mod vmcontext;

pub mod interp_bridge;
pub mod libcalls;
pub mod wasi;

pub use crate::code_memory::CodeMemory;
pub use crate::config::{DEFAULT_SIGALTSTACK_SIZE, DEFAULT_WASM_STACK_SIZE, RuntimeConfig};
pub use crate::exception::{
    JMP_BUF_SIZE, JmpBuf, Landing, catch_exception, handler_depth, sigsetjmp_address,
};
pub use crate::gc::{
    AbstractHeapType, GcError, GcFlags, GcHeader, GcHeap, GcKind, GcRef, GcStats, RefValue,
    TypeCache, TypeInfo, current_heap_ptr, set_heap, set_type_cache, take_heap, with_heap,
    with_type_cache,
};
pub use crate::memory::{Memory, MemoryError, VMMemoryDefinition, WASM_PAGE_SIZE};
pub use crate::mmap::{Mmap, page_size};
pub use crate::segments::{
    add_data_segment, add_elem_segment, clear_segments, data_element_size, init_data_segments,
    init_elem_segments,
};
pub use crate::stack::{SUPPORTED_ARCH, StackError, WasmStack};
pub use crate::table::{SharedTable, VMTableEntry};
pub use crate::trap::{Frame, MAX_TRAP_FRAMES, Trap, TrapCode};
pub use crate::traphandlers::{
    call_trampoline, call_trampoline_on_stack, catch_traps, clear_trap, init_traps, last_trap,
    raise_trap, set_sigaltstack_size,
};
pub use crate::vmcontext::{VMContext, VMFunctionBody, VMTrampoline, offsets};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
