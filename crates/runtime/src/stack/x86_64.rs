// The routine below must stay in sync with `call_on_stack` in `stack.rs`:
// the argument order is the ABI both sides agree on.

use crate::vmcontext::{VMContext, VMFunctionBody, VMTrampoline};
use core::arch::naked_asm;

/// Calls `trampoline(vmctx, values, func)` with the stack pointer moved to
/// `stack_top`, then switches back and returns the trampoline's result.
#[unsafe(naked)]
pub(super) unsafe extern "C" fn wasmjit_stack_switch_call(
    stack_top: *mut u8,              // rdi
    trampoline: VMTrampoline,        // rsi
    vmctx: *mut VMContext,           // rdx
    values: *mut i64,                // rcx
    func: *const VMFunctionBody,     // r8
) -> i32 {
    naked_asm!(
        "
        // Build a normal frame record on the host stack so unwinders and our
        // own frame walk can step back out of the switched-to stack.
        push rbp
        mov rbp, rsp
        push rbx

        // rbx is callee-saved, so it survives the call and remembers where
        // the host stack was.
        mov rbx, rsp
        mov rsp, rdi

        mov rax, rsi
        mov rdi, rdx
        mov rsi, rcx
        mov rdx, r8
        call rax

        mov rsp, rbx
        pop rbx
        pop rbp
        ret
        ",
    );
}
