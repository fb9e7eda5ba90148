#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use anyhow::Result;
use wasmjit::{TrapCode, VMContext, WasmStack, call_trampoline_on_stack, last_trap};

const STACK_SIZE: usize = 256 * 1024;

/// Infinite recursion that pushes a return address (and on aarch64 a frame
/// record) per level.
fn recurse_forever() -> Result<(wasmjit::CodeMemory, wasmjit::VMTrampoline)> {
    #[cfg(target_arch = "x86_64")]
    let code = vec![0xe8, 0xfb, 0xff, 0xff, 0xff]; // call .
    #[cfg(target_arch = "aarch64")]
    let code = crate::insns(&[
        0xa9bf_7bfd, // stp x29, x30, [sp, #-16]!
        0x97ff_ffff, // bl .-4
    ]);
    crate::trampoline(&code)
}

/// Stores the stack pointer it runs with into `values[0]`.
fn report_sp() -> Result<(wasmjit::CodeMemory, wasmjit::VMTrampoline)> {
    #[cfg(target_arch = "x86_64")]
    let code = vec![
        0x48, 0x89, 0x26, // mov [rsi], rsp
        0x31, 0xc0, // xor eax, eax
        0xc3, // ret
    ];
    #[cfg(target_arch = "aarch64")]
    let code = crate::insns(&[
        0x9100_03e8, // mov x8, sp
        0xf900_0028, // str x8, [x1]
        0x5280_0000, // mov w0, #0
        0xd65f_03c0, // ret
    ]);
    crate::trampoline(&code)
}

#[test]
fn calls_run_on_the_wasm_stack() -> Result<()> {
    let mut ctx = VMContext::new(0);
    ctx.alloc_wasm_stack(STACK_SIZE)?;
    let vmctx: *mut VMContext = &mut *ctx;
    let (code, entry) = report_sp()?;

    let mut values = [0i64];
    let ret = unsafe { call_trampoline_on_stack(Some(entry), vmctx, values.as_mut_ptr(), code.as_ptr()) };
    assert_eq!(ret, 0);
    let stack = ctx.wasm_stack().unwrap();
    assert!(stack.range().contains(&(values[0] as usize)));
    assert!(values[0] as usize <= ctx.wasm_stack_top() as usize);
    Ok(())
}

#[test]
fn without_a_stack_the_host_stack_is_used() -> Result<()> {
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;
    let (code, entry) = report_sp()?;

    let mut values = [0i64];
    let ret = unsafe { call_trampoline_on_stack(Some(entry), vmctx, values.as_mut_ptr(), code.as_ptr()) };
    assert_eq!(ret, 0);
    let local = 0u8;
    let distance = (&local as *const u8 as usize).abs_diff(values[0] as usize);
    assert!(distance < 1 << 20);
    Ok(())
}

#[test]
fn overflowing_the_wasm_stack_is_stack_overflow() -> Result<()> {
    let mut ctx = VMContext::new(0);
    ctx.alloc_wasm_stack(STACK_SIZE)?;
    let vmctx: *mut VMContext = &mut *ctx;
    let (code, entry) = recurse_forever()?;

    for _ in 0..2 {
        let mut values = [0i64];
        let ret = unsafe { call_trampoline_on_stack(Some(entry), vmctx, values.as_mut_ptr(), code.as_ptr()) };
        assert_eq!(ret, TrapCode::StackOverflow.as_raw());

        let trap = last_trap().unwrap();
        let stack: &WasmStack = ctx.wasm_stack().unwrap();
        assert!(stack.guard_range().contains(&trap.fault_addr));
        let range = stack.range();
        assert_eq!(trap.stack_bounds, (range.start, range.end));
    }
    Ok(())
}
