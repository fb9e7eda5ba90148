use test_log::test;
use wasmjit::libcalls::raw;
use wasmjit::{VMContext, catch_exception, handler_depth};

#[test]
fn inner_catch_then_delegate_to_outer() {
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;
    let mut inner_landed = 0;
    let mut after_delegate = false;

    let outer_landed = unsafe {
        let outer = raw::try_begin(vmctx, 1);
        catch_exception(outer, || {
            let inner = raw::try_begin(vmctx, 2);
            let payload = [11i64, 12];
            inner_landed = catch_exception(inner, || {
                raw::throw(vmctx, 5, payload.as_ptr(), 2);
            });
            raw::delegate(vmctx, 1);
            after_delegate = true;
        })
    };

    assert_eq!(inner_landed, 2);
    assert_eq!(outer_landed, 1);
    assert!(!after_delegate);
    assert_eq!(handler_depth(&ctx), 1);
    unsafe {
        assert_eq!(raw::get_tag(vmctx), 5);
        assert_eq!(raw::get_value_count(vmctx), 2);
        assert_eq!(raw::get_value(vmctx, 1), 12);
        assert_eq!(raw::get_value(vmctx, 2), 0);
        raw::try_end(vmctx, 1);
    }
    assert_eq!(handler_depth(&ctx), 0);
}

#[test]
fn spilled_locals_survive_the_jump() {
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;
    let landed = unsafe {
        let buf = raw::try_begin(vmctx, 3);
        let locals = [100i64, 200, 300];
        raw::spill_locals(vmctx, locals.as_ptr(), 3);
        catch_exception(buf, || raw::throw(vmctx, 1, std::ptr::null(), 0))
    };
    assert_eq!(landed, 3);
    unsafe {
        assert_eq!(raw::get_spilled_local(vmctx, 2), 300);
        assert_eq!(raw::get_value_count(vmctx), 0);
        raw::try_end(vmctx, 3);
        assert_eq!(raw::get_spilled_local(vmctx, 2), 0);
    }
}

#[test]
fn rethrow_reaches_the_enclosing_handler() {
    let mut ctx = VMContext::new(0);
    let vmctx: *mut VMContext = &mut *ctx;
    let landed = unsafe {
        let buf = raw::try_begin(vmctx, 9);
        catch_exception(buf, || raw::throw_ref(vmctx, 0))
    };
    assert_eq!(landed, 9);
    unsafe { raw::try_end(vmctx, 9) };

    // A body that returns normally lands nowhere.
    let landed = unsafe {
        let buf = raw::try_begin(vmctx, 4);
        let landed = catch_exception(buf, || {});
        raw::try_end(vmctx, 4);
        landed
    };
    assert_eq!(landed, 0);
    assert_eq!(handler_depth(&ctx), 0);
}
