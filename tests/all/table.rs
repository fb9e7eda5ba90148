use std::ptr;
use wasmjit::libcalls::raw;
use wasmjit::{
    SharedTable, TrapCode, VMContext, VMTableEntry, add_data_segment, add_elem_segment, catch_traps,
    clear_segments, init_data_segments, init_elem_segments,
};

fn entries(ctx: &VMContext, idx: u32) -> Vec<VMTableEntry> {
    let (base, len) = ctx.table(idx).unwrap();
    unsafe { std::slice::from_raw_parts(base, len).to_vec() }
}

#[test]
fn shared_table_backs_table_zero() {
    let mut shared = SharedTable::new(2);
    shared.set(1, 0x1000 as *const _, 3);
    let mut a = VMContext::new(0);
    let mut b = VMContext::new(0);
    a.use_shared_table(&shared);
    b.use_shared_table(&shared);
    assert!(!a.owns_indirect_table());
    assert_eq!(a.table0(), b.table0());
    assert_eq!(entries(&b, 0)[1].type_index, 3);

    a.alloc_indirect_table(4);
    assert!(a.owns_indirect_table());
    assert_eq!(a.table0().1, 4);
    assert_eq!(shared.get(1).map(|e| e.type_index), Some(3));
}

#[test]
fn grow_fill_and_copy_through_libcalls() {
    let tables = [SharedTable::new(2), SharedTable::new(1)];
    let ptrs = tables.iter().map(SharedTable::as_ptr).collect::<Vec<_>>();
    let mut ctx = VMContext::new(0);
    ctx.set_table_pointers(&ptrs, &[2, 1], Some(&[-1, 4][..]));
    let vmctx: *mut VMContext = &mut *ctx;
    assert_eq!(ctx.table_count(), 2);

    unsafe {
        assert_eq!(raw::table_grow(vmctx, 1, 3, 0x2000), 1);
        assert_eq!(raw::table_grow(vmctx, 1, 1, 0), -1);
    }
    let grown = entries(&ctx, 1);
    assert_eq!(grown.len(), 4);
    assert_eq!(grown[3], VMTableEntry::untyped(0x2000));

    let result = unsafe {
        catch_traps(vmctx, || {
            raw::table_fill(vmctx, 0, 0, 0x3000, 2);
            raw::table_copy(vmctx, 1, 0, 0, 0, 2);
        })
    };
    assert!(result.is_ok());
    assert_eq!(entries(&ctx, 1)[..2], [VMTableEntry::untyped(0x3000); 2]);

    let trap = unsafe { catch_traps(vmctx, || raw::table_copy(vmctx, 0, 1, 0, 2, 3)) }.unwrap_err();
    assert_eq!(trap.code, TrapCode::HeapOutOfBounds);
}

#[test]
fn passive_segments_initialize_tables_and_memory() -> anyhow::Result<()> {
    init_elem_segments(1);
    add_elem_segment(0, &[0x10, 0x20, 0x30]);
    init_data_segments(1);
    add_data_segment(0, b"hello");

    let mut ctx = VMContext::new(0);
    ctx.alloc_indirect_table(3);
    ctx.alloc_guarded_memory(1, None)?;
    let vmctx: *mut VMContext = &mut *ctx;

    unsafe {
        catch_traps(vmctx, || {
            raw::table_init(vmctx, 0, 0, 0, 1, 2);
            raw::memory_init(vmctx, 0, 0, 8, 1, 4);
        })
    }?;
    assert_eq!(entries(&ctx, 0)[..2], [VMTableEntry::untyped(0x20), VMTableEntry::untyped(0x30)]);
    let bytes = unsafe { std::slice::from_raw_parts(ctx.get_memory_ptr(0).add(8), 4) };
    assert_eq!(bytes, b"ello");

    // After a drop only empty ranges are accepted.
    unsafe {
        raw::elem_drop(vmctx, 0);
        raw::data_drop(vmctx, 0);
        catch_traps(vmctx, || {
            raw::table_init(vmctx, 0, 0, 0, 0, 0);
            raw::memory_init(vmctx, 0, 0, 0, 0, 0);
        })?;
        let trap = catch_traps(vmctx, || raw::memory_init(vmctx, 0, 0, 0, 0, 1)).unwrap_err();
        assert_eq!(trap.code, TrapCode::HeapOutOfBounds);
        let trap = catch_traps(vmctx, || raw::table_init(vmctx, 0, 0, 0, 0, 1)).unwrap_err();
        assert_eq!(trap.code, TrapCode::HeapOutOfBounds);
    }
    clear_segments();

    let trap = unsafe { catch_traps(ptr::null_mut(), || raw::table_fill(ptr::null_mut(), 0, 0, 0, 1)) }
        .unwrap_err();
    assert_eq!(trap.code, TrapCode::HeapOutOfBounds);
    Ok(())
}
