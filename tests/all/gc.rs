use test_log::test;
use wasmjit::libcalls::raw;
use wasmjit::{GcHeap, RefValue, TrapCode, VMContext, catch_traps, current_heap_ptr, set_heap, take_heap};

#[test]
fn struct_fields_read_back() {
    set_heap(Some(GcHeap::new(64 * 1024)));
    unsafe {
        let fields = [7i64, 0];
        let s = raw::struct_new(0, fields.as_ptr(), 2);
        assert!(matches!(RefValue::decode(s), RefValue::Heap(_)));
        assert_eq!(raw::struct_get(s, 0, 0), 7);
        raw::struct_set(s, 0, 1, 42);
        assert_eq!(raw::struct_get(s, 0, 1), 42);
        assert_eq!(raw::struct_get(s, 0, 0), 7);
    }
    take_heap();
}

#[test]
fn array_fill_then_overlapping_copy() {
    set_heap(Some(GcHeap::new(64 * 1024)));
    let contents = unsafe {
        let a = raw::array_new(0, 5, 0);
        raw::array_fill(a, 1, 9, 2);
        raw::array_copy(a, 3, a, 0, 2);
        assert_eq!(raw::array_len(a), 5);
        (0..5).map(|i| raw::array_get(a, 0, i)).collect::<Vec<_>>()
    };
    assert_eq!(contents, [0, 9, 9, 0, 9]);

    let trap = unsafe {
        catch_traps(std::ptr::null_mut(), || {
            let a = raw::array_new(0, 2, 0);
            raw::array_fill(a, 1, 1, 2);
        })
    }
    .unwrap_err();
    assert_eq!(trap.code, TrapCode::HeapOutOfBounds);
    take_heap();
}

#[test]
fn collection_frees_unrooted_objects() {
    set_heap(Some(GcHeap::new(64 * 1024)));
    let mut ctx = VMContext::new(0);
    ctx.set_gc_heap(current_heap_ptr());
    let vmctx: *mut VMContext = &mut *ctx;

    let (kept, freed) = unsafe {
        let kept = raw::array_new(0, 4, 1);
        let _garbage = raw::array_new(0, 4, 2);
        let holder = raw::struct_new(1, [kept].as_ptr(), 1);
        let freed = raw::gc_collect(vmctx, [holder].as_ptr(), 1);
        (kept, freed)
    };
    assert_eq!(freed, 1);
    assert_eq!(unsafe { raw::array_get(kept, 0, 3) }, 1);

    let freed = unsafe { raw::gc_collect(vmctx, std::ptr::null(), 0) };
    assert_eq!(freed, 2);
    let heap = take_heap().unwrap();
    assert_eq!(heap.used(), 0);
    assert_eq!(heap.stats().total_collections, 2);
}
