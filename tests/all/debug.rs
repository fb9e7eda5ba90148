#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use anyhow::Result;
use object::{Object, ObjectSection, ObjectSymbol};
use wasmjit::jit_debug::{self, JitDebugInfo};
use wasmjit::{TrapCode, VMContext, call_trampoline, last_trap};

/// `outer` sets up a frame and calls `inner`, which sets up its own frame
/// and executes a trap instruction with immediate 3.
struct TwoFrames {
    code: Vec<u8>,
    outer_len: u32,
    inner_start: u64,
    inner_len: u32,
    trap_offset: u64,
    return_offset: u64,
}

#[cfg(target_arch = "x86_64")]
fn two_frames() -> TwoFrames {
    let code = vec![
        // outer
        0x55, // push rbp
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0xe8, 0x07, 0x00, 0x00, 0x00, // call inner
        0x5d, // pop rbp
        0x31, 0xc0, // xor eax, eax
        0xc3, // ret
        0xcc, 0xcc, 0xcc, // padding
        // inner
        0x55, // push rbp
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0x0f, 0x0b, 0x03, // ud2; .byte 3
    ];
    TwoFrames {
        code,
        outer_len: 16,
        inner_start: 16,
        inner_len: 7,
        trap_offset: 4,
        return_offset: 9,
    }
}

#[cfg(target_arch = "aarch64")]
fn two_frames() -> TwoFrames {
    let code = crate::insns(&[
        // outer
        0xa9bf_7bfd, // stp x29, x30, [sp, #-16]!
        0x9100_03fd, // mov x29, sp
        0x9400_0006, // bl inner
        0xa8c1_7bfd, // ldp x29, x30, [sp], #16
        0x5280_0000, // mov w0, #0
        0xd65f_03c0, // ret
        0xd503_201f, // nop
        0xd503_201f, // nop
        // inner
        0xa9bf_7bfd, // stp x29, x30, [sp, #-16]!
        0x9100_03fd, // mov x29, sp
        0xd420_0060, // brk #3
    ]);
    TwoFrames {
        code,
        outer_len: 32,
        inner_start: 32,
        inner_len: 12,
        trap_offset: 8,
        return_offset: 12,
    }
}

#[test]
fn trap_backtrace_names_jit_frames() -> Result<()> {
    let program = two_frames();
    let (mem, entry) = crate::trampoline(&program.code)?;
    let base = mem.as_ptr() as u64;

    let mut info = JitDebugInfo::new();
    info.add_function("outer", base, program.outer_len, 0);
    info.add_function("inner", base + program.inner_start, program.inner_len, 1);
    let registration = info.register()?;
    assert!(registration.is_registered());
    info.set_active();
    assert_eq!(jit_debug::active_range(), Some((base, base + program.code.len() as u64)));

    let mut ctx = VMContext::new(2);
    ctx.set_current_func_index(1);
    let vmctx: *mut VMContext = &mut *ctx;
    let mut values = [0i64];
    let ret = unsafe { call_trampoline(Some(entry), vmctx, values.as_mut_ptr(), mem.as_ptr()) };
    assert_eq!(ret, TrapCode::BadConversionToInteger.as_raw());

    let trap = last_trap().unwrap();
    let trap_pc = base + program.inner_start + program.trap_offset;
    let return_pc = base + program.return_offset;
    assert_eq!(trap.pc as u64, trap_pc);
    assert_eq!(trap.frame_lr as u64, return_pc);
    let pcs: Vec<u64> = trap.frame_pcs().map(|pc| pc as u64).collect();
    assert_eq!(pcs, [trap_pc, return_pc]);

    let expected = format!(
        "  #0 0x{trap_pc:x} inner+0x{:x}\n  #1 0x{return_pc:x} outer+0x{:x}\n",
        program.trap_offset, program.return_offset
    );
    assert_eq!(trap.backtrace(), expected);

    let sym = jit_debug::lookup(trap_pc).unwrap();
    assert_eq!((sym.name.as_str(), sym.func_idx), ("inner", 1));

    jit_debug::clear_active();
    assert!(trap.backtrace().contains("<unknown>"));
    drop(registration);
    Ok(())
}

#[test]
fn registered_image_describes_functions() -> Result<()> {
    let mut info = JitDebugInfo::new();
    info.add_function("wasm_function_0", 0x7000_0000, 0x80, 0);
    info.add_function("wasm_function_1", 0x7000_0080, 0x40, 1);
    let registration = info.register()?;
    let image = registration.image().unwrap();

    let file = object::File::parse(image)?;
    let text = file.section_by_name(".text").unwrap();
    assert_eq!((text.address(), text.size()), (0x7000_0000, 0xc0));
    assert!(file.section_by_name(".debug_info").is_some());
    let names: Vec<_> = file
        .symbols()
        .filter_map(|s| s.name().ok().map(str::to_string))
        .collect();
    assert!(names.iter().any(|n| n == "wasm_function_0"));
    assert!(names.iter().any(|n| n == "wasm_function_1"));
    Ok(())
}

#[test]
fn dump_via_environment() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("jit-image.o");

    let mut info = JitDebugInfo::new();
    info.add_function("dumped", 0x6000_0000, 0x10, 0);
    // Only this test touches the variable.
    unsafe { std::env::set_var(jit_debug::DUMP_ENV, &path) };
    let registration = info.register();
    unsafe { std::env::remove_var(jit_debug::DUMP_ENV) };
    let registration = registration?;

    assert_eq!(std::fs::read(&path)?, registration.image().unwrap());
    Ok(())
}
