use anyhow::Result;
use std::ptr;
use wasmjit::libcalls::raw;
use wasmjit::{
    GcHeap, TrapCode, VMContext, call_trampoline, catch_traps, clear_trap, last_trap, set_heap,
    take_heap,
};

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn trap_instructions_decode_their_immediate() -> Result<()> {
    let expected = [
        (0, TrapCode::UnreachableCodeReached),
        (1, TrapCode::HeapOutOfBounds),
        (2, TrapCode::BadSignature),
        (3, TrapCode::BadConversionToInteger),
        (4, TrapCode::IntegerDivisionByZero),
        (5, TrapCode::IntegerOverflow),
        (42, TrapCode::Unknown),
    ];
    let mut ctx = VMContext::new(0);
    ctx.set_current_func_index(9);
    let vmctx: *mut VMContext = &mut *ctx;
    let mut values = [0i64; 1];

    for (imm, code) in expected {
        let (mem, entry) = crate::trap_instruction(imm)?;
        let ret = unsafe { call_trampoline(Some(entry), vmctx, values.as_mut_ptr(), mem.as_ptr()) };
        assert_eq!(ret, code.as_raw(), "immediate {imm}");

        let trap = last_trap().unwrap();
        assert_eq!(trap.code, code);
        assert_eq!(trap.trap_immediate, Some(u16::from(imm)));
        assert_eq!(trap.func_index, Some(9));
        assert!(mem.range().contains(&trap.pc));
        assert_ne!(trap.signal, 0);
        assert!(trap.to_string().starts_with("wasm trap: "));
    }
    Ok(())
}

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn regions_are_reusable_after_a_trap() -> Result<()> {
    let (trap_mem, trap) = crate::trap_instruction(0)?;
    let (load_mem, load) = crate::load_byte()?;
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;
    let byte = 5u8;

    for _ in 0..3 {
        let mut values = [0i64];
        let ret = unsafe { call_trampoline(Some(trap), vmctx, values.as_mut_ptr(), trap_mem.as_ptr()) };
        assert_eq!(ret, TrapCode::UnreachableCodeReached.as_raw());

        let mut values = [&byte as *const u8 as i64];
        let ret = unsafe { call_trampoline(Some(load), vmctx, values.as_mut_ptr(), load_mem.as_ptr()) };
        assert_eq!(ret, 0);
    }
    Ok(())
}

#[test]
fn null_inputs_are_rejected() {
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;
    let mut values = [0i64];
    unsafe {
        assert_eq!(call_trampoline(None, vmctx, values.as_mut_ptr(), ptr::null()), -1);
        assert_eq!(
            wasmjit::call_trampoline_on_stack(None, vmctx, values.as_mut_ptr(), ptr::null()),
            -1
        );
    }
}

#[test]
fn libcall_traps_unwind_to_the_region() {
    set_heap(Some(GcHeap::new(4096)));
    let mut reached = false;
    let trap = unsafe {
        catch_traps(ptr::null_mut(), || {
            let array = raw::array_new(0, 3, 0);
            raw::array_set(array, 0, 3, 1);
            reached = true;
        })
    }
    .unwrap_err();
    assert_eq!(trap.code, TrapCode::HeapOutOfBounds);
    assert!(!reached);
    assert_eq!(trap.signal, 0);

    let trap = unsafe {
        catch_traps(ptr::null_mut(), || {
            let _ = raw::struct_get(0, 0, 0);
        })
    }
    .unwrap_err();
    assert_eq!(trap.code, TrapCode::UnreachableCodeReached);

    let trap =
        unsafe { catch_traps(ptr::null_mut(), || raw::check_indirect_call_type(1, 2)) }.unwrap_err();
    assert_eq!(trap.code, TrapCode::BadSignature);
    take_heap();
}

#[test]
fn uncaught_exception_and_exit_codes() {
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;

    let trap = unsafe { catch_traps(vmctx, || raw::throw(vmctx, 1, ptr::null(), 0)) }.unwrap_err();
    assert_eq!(trap.code, TrapCode::UncaughtException);
    assert_eq!(trap.code.as_raw(), 8);

    let trap = unsafe {
        catch_traps(vmctx, || {
            let _ = raw::proc_exit(vmctx, 3);
        })
    }
    .unwrap_err();
    assert_eq!(trap.code, TrapCode::Exit);
    assert_eq!(ctx.wasi_exit_code(), Some(3));
}

#[test]
fn trap_state_is_per_thread() {
    clear_trap();
    unsafe { raw::check_indirect_call_type(1, 2) };
    assert_eq!(last_trap().map(|t| t.code), Some(TrapCode::BadSignature));

    let other = std::thread::spawn(|| last_trap().map(|t| t.code)).join().unwrap();
    assert_eq!(other, None);
    clear_trap();
    assert!(last_trap().is_none());
}
