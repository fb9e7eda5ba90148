use test_log::test;
use wasmjit::libcalls::raw;
use wasmjit::wasi::errno;
use wasmjit::{VMContext, catch_traps};

fn read(ctx: &VMContext, at: usize, len: usize) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(ctx.get_memory_ptr(0).add(at), len).to_vec() }
}

fn read_u32(ctx: &VMContext, at: usize) -> u32 {
    let bytes = read(ctx, at, 4);
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[test]
fn arguments_and_environment_land_in_linear_memory() -> anyhow::Result<()> {
    let mut ctx = VMContext::new(0);
    ctx.alloc_guarded_memory(1, None)?;
    ctx.set_wasi_args(&["main.wasm", "--fast"]);
    ctx.set_wasi_env(&[("LANG", "C")]);
    let vmctx: *mut VMContext = &mut *ctx;

    unsafe {
        assert_eq!(raw::args_sizes_get(vmctx, 0, 4), errno::SUCCESS);
        assert_eq!(raw::args_get(vmctx, 16, 256), errno::SUCCESS);
        assert_eq!(raw::environ_sizes_get(vmctx, 8, 12), errno::SUCCESS);
        assert_eq!(raw::environ_get(vmctx, 32, 512), errno::SUCCESS);
    }
    assert_eq!((read_u32(&ctx, 0), read_u32(&ctx, 4)), (2, 17));
    assert_eq!((read_u32(&ctx, 16), read_u32(&ctx, 20)), (256, 266));
    assert_eq!(read(&ctx, 256, 17), b"main.wasm\0--fast\0");
    assert_eq!((read_u32(&ctx, 8), read_u32(&ctx, 12)), (1, 7));
    assert_eq!(read_u32(&ctx, 32), 512);
    assert_eq!(read(&ctx, 512, 7), b"LANG=C\0");

    let end = wasmjit::WASM_PAGE_SIZE as i64;
    assert_eq!(unsafe { raw::args_get(vmctx, end - 4, 0) }, errno::FAULT);
    Ok(())
}

#[test]
fn exit_unwinds_with_its_code() {
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;
    assert_eq!(unsafe { raw::sched_yield(vmctx) }, errno::SUCCESS);

    let mut after_exit = false;
    let trap = unsafe {
        catch_traps(vmctx, || {
            let _ = raw::proc_exit(vmctx, 42);
            after_exit = true;
        })
    }
    .unwrap_err();
    assert_eq!(trap.code, wasmjit::TrapCode::Exit);
    assert!(!after_exit);
    assert_eq!(ctx.wasi_exit_code(), Some(42));
}
