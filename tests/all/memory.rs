use anyhow::Result;
use wasmjit::libcalls::raw;
use wasmjit::{RuntimeConfig, TrapCode, VMContext, WASM_PAGE_SIZE, call_trampoline, last_trap};

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn grow_then_store_past_the_end() -> Result<()> {
    let mut ctx = VMContext::new(0);
    ctx.alloc_guarded_memory(1, None)?;
    let vmctx: *mut VMContext = &mut *ctx;

    assert_eq!(unsafe { raw::memory_grow(vmctx, 0, 1, -1) }, 1);
    assert_eq!(ctx.get_memory_size(0), 131072);
    assert_eq!(unsafe { raw::memory_size(vmctx, 0) }, 2);

    let (code, store) = crate::store_byte()?;
    let base = ctx.get_memory_ptr(0) as i64;
    let mut values = [base + 131071];
    let ret = unsafe { call_trampoline(Some(store), vmctx, values.as_mut_ptr(), code.as_ptr()) };
    assert_eq!(ret, 0);
    assert_eq!(unsafe { *ctx.get_memory_ptr(0).add(131071) }, 1);

    let mut values = [base + 131072];
    let ret = unsafe { call_trampoline(Some(store), vmctx, values.as_mut_ptr(), code.as_ptr()) };
    assert_eq!(ret, TrapCode::HeapOutOfBounds.as_raw());
    let trap = last_trap().unwrap();
    assert_eq!(trap.fault_addr, (base + 131072) as usize);
    Ok(())
}

#[test]
fn failed_growth_leaves_size_unchanged() -> Result<()> {
    let mut ctx = VMContext::new(0);
    ctx.alloc_guarded_memory(1, Some(2))?;
    let vmctx: *mut VMContext = &mut *ctx;
    unsafe {
        assert_eq!(raw::memory_grow(vmctx, 0, 2, -1), -1);
        assert_eq!(raw::memory_size(vmctx, 0), 1);
        assert_eq!(raw::memory_grow(vmctx, 0, -1, -1), -1);
        assert_eq!(raw::memory_grow(vmctx, 0, 0, -1), 1);
        assert_eq!(raw::memory_grow(vmctx, 0, 1, -1), 1);
        assert_eq!(raw::memory_grow(vmctx, 0, 1, -1), -1);
        assert_eq!(raw::memory_size(vmctx, 0), 2);
    }
    Ok(())
}

#[test]
fn growth_preserves_contents_in_both_modes() -> Result<()> {
    for guard_pages in [true, false] {
        let mut config = RuntimeConfig::new();
        config.guard_pages(guard_pages);
        let mut ctx = VMContext::new(0);
        ctx.alloc_memory(&config, 1, None)?;
        let vmctx: *mut VMContext = &mut *ctx;

        unsafe {
            raw::memory_fill(vmctx, 0, 100, 0xab, 16);
            assert_eq!(raw::memory_grow(vmctx, 0, 3, -1), 1);
        }
        let bytes = unsafe { std::slice::from_raw_parts(ctx.get_memory_ptr(0), ctx.get_memory_size(0)) };
        assert_eq!(bytes.len(), 4 * WASM_PAGE_SIZE);
        assert!(bytes[100..116].iter().all(|&b| b == 0xab));
        assert!(bytes[116..].iter().all(|&b| b == 0));
    }
    Ok(())
}

#[test]
fn bulk_operations_trap_out_of_bounds() -> Result<()> {
    let mut ctx = VMContext::new(0);
    ctx.alloc_guarded_memory(1, None)?;
    let vmctx: *mut VMContext = &mut *ctx;
    let len = WASM_PAGE_SIZE as i64;

    let fill = unsafe {
        wasmjit::catch_traps(vmctx, || raw::memory_fill(vmctx, 0, len - 4, 1, 5))
    };
    assert_eq!(fill.unwrap_err().code, TrapCode::HeapOutOfBounds);

    let copy = unsafe {
        wasmjit::catch_traps(vmctx, || raw::memory_copy(vmctx, 0, 0, 0, len - 1, 2))
    };
    assert_eq!(copy.unwrap_err().code, TrapCode::HeapOutOfBounds);

    // Overlapping copy within the same memory.
    unsafe {
        wasmjit::catch_traps(vmctx, || {
            raw::memory_fill(vmctx, 0, 0, 7, 4);
            raw::memory_copy(vmctx, 0, 0, 2, 0, 4);
        })
    }?;
    let head = unsafe { std::slice::from_raw_parts(ctx.get_memory_ptr(0), 8) };
    assert_eq!(head, [7, 7, 7, 7, 7, 7, 0, 0]);
    Ok(())
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
mod guard_property {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn accesses_split_at_current_length(
            pages in 1usize..4,
            inside in any::<prop::sample::Index>(),
            past in 0usize..(1 << 30),
        ) {
            let mut ctx = VMContext::new(0);
            ctx.alloc_guarded_memory(pages, None).unwrap();
            let vmctx: *mut VMContext = &mut *ctx;
            let len = pages * WASM_PAGE_SIZE;
            let base = ctx.get_memory_ptr(0) as usize;
            let (code, load) = crate::load_byte().unwrap();

            let mut values = [(base + inside.index(len)) as i64];
            let ok = unsafe { call_trampoline(Some(load), vmctx, values.as_mut_ptr(), code.as_ptr()) };
            prop_assert_eq!(ok, 0);

            let mut values = [(base + len + past) as i64];
            let trapped = unsafe { call_trampoline(Some(load), vmctx, values.as_mut_ptr(), code.as_ptr()) };
            prop_assert_eq!(trapped, TrapCode::HeapOutOfBounds.as_raw());
        }
    }
}
