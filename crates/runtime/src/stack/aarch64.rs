// The routine below must stay in sync with `call_on_stack` in `stack.rs`:
// the argument order is the ABI both sides agree on.

use crate::vmcontext::{VMContext, VMFunctionBody, VMTrampoline};
use core::arch::naked_asm;

/// Calls `trampoline(vmctx, values, func)` with the stack pointer moved to
/// `stack_top`, then switches back and returns the trampoline's result.
#[unsafe(naked)]
pub(super) unsafe extern "C" fn wasmjit_stack_switch_call(
    stack_top: *mut u8,              // x0
    trampoline: VMTrampoline,        // x1
    vmctx: *mut VMContext,           // x2
    values: *mut i64,                // x3
    func: *const VMFunctionBody,     // x4
) -> i32 {
    naked_asm!(
        "
        // Frame record plus a slot for x19 on the host stack.
        stp x29, x30, [sp, #-32]!
        mov x29, sp
        str x19, [sp, #16]

        // x19 is callee-saved, so it survives the call and remembers where
        // the host stack was.
        mov x19, sp
        mov sp, x0

        mov x9, x1
        mov x0, x2
        mov x1, x3
        mov x2, x4
        blr x9

        mov sp, x19
        ldr x19, [sp, #16]
        ldp x29, x30, [sp], #32
        ret
        ",
    );
}
