//! The independent stack generated code can run on.
//!
//! Running wasm on its own guarded stack keeps deep wasm recursion from
//! exhausting the host thread's stack: overflow hits the guard page below
//! the region and is reported as [`TrapCode::StackOverflow`].
//!
//! [`TrapCode::StackOverflow`]: crate::TrapCode::StackOverflow

use crate::config::DEFAULT_WASM_STACK_SIZE;
use crate::mmap::{self, Mmap};
use crate::vmcontext::{VMContext, VMFunctionBody, VMTrampoline};
use anyhow::{Context, Result};
use std::ops::Range;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        use x86_64::wasmjit_stack_switch_call;
        /// Whether this host can switch stacks.
        pub const SUPPORTED_ARCH: bool = true;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use aarch64::wasmjit_stack_switch_call;
        /// Whether this host can switch stacks.
        pub const SUPPORTED_ARCH: bool = true;
    } else {
        /// Whether this host can switch stacks.
        pub const SUPPORTED_ARCH: bool = false;

        unsafe extern "C" fn wasmjit_stack_switch_call(
            _stack_top: *mut u8,
            _trampoline: VMTrampoline,
            _vmctx: *mut VMContext,
            _values: *mut i64,
            _func: *const VMFunctionBody,
        ) -> i32 {
            unreachable!();
        }
    }
}

/// Errors sizing an independent stack.
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// The requested size overflows the address space once rounded.
    #[error("wasm stack size {0:#x} is too large")]
    TooLarge(usize),
}

/// A separately mapped stack with one inaccessible guard page below it.
#[derive(Debug)]
pub struct WasmStack {
    mmap: Mmap,
    guard_size: usize,
}

impl WasmStack {
    /// Maps a stack of at least `size` usable bytes, rounded up to whole
    /// pages. A size of 0 selects the default of 1 MiB.
    pub fn new(size: usize) -> Result<WasmStack> {
        let size = if size == 0 { DEFAULT_WASM_STACK_SIZE } else { size };
        let page = mmap::page_size();
        let total = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .and_then(|s| s.checked_add(page))
            .ok_or(StackError::TooLarge(size))?;

        let mut mmap = Mmap::reserve(total).context("failed to allocate wasm stack")?;
        mmap.make_accessible(page..total)
            .context("failed to open wasm stack")?;
        log::debug!(
            "allocated wasm stack of {:#x} bytes at {:p}",
            total - page,
            mmap.as_mut_ptr()
        );
        Ok(WasmStack {
            mmap,
            guard_size: page,
        })
    }

    /// The initial stack pointer: the 16-byte aligned end of the mapping.
    pub fn top(&self) -> *mut u8 {
        let end = self.mmap.as_mut_ptr() as usize + self.mmap.len();
        (end & !0xf) as *mut u8
    }

    /// Addresses of the guard page.
    pub fn guard_range(&self) -> Range<usize> {
        let base = self.mmap.as_mut_ptr() as usize;
        base..base + self.guard_size
    }

    /// Addresses of the usable stack.
    pub fn range(&self) -> Range<usize> {
        let base = self.mmap.as_mut_ptr() as usize;
        base + self.guard_size..self.top() as usize
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.mmap.len() - self.guard_size
    }

    /// Whether `addr` falls in the guard page.
    pub fn is_guard_fault(&self, addr: usize) -> bool {
        self.guard_range().contains(&addr)
    }
}

/// Calls `trampoline` on `stack`.
///
/// # Safety
///
/// Same as calling `trampoline` directly. Anything the call leaves on the
/// stack is abandoned when it traps.
pub(crate) unsafe fn call_on_stack(
    stack: &WasmStack,
    trampoline: VMTrampoline,
    vmctx: *mut VMContext,
    values: *mut i64,
    func: *const VMFunctionBody,
) -> i32 {
    debug_assert!(SUPPORTED_ARCH);
    unsafe { wasmjit_stack_switch_call(stack.top(), trampoline, vmctx, values, func) }
}
