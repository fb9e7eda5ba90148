use wasmjit::VMContext;
use wasmjit::interp_bridge::{
    add_interp_func, clear_interp_callback, clear_interp_funcs, find_interp_func, init_interp_funcs,
    interp_trampoline, set_interp_callback,
};

unsafe extern "C" fn record_call(
    func_idx: i32,
    args: *mut i64,
    num_args: i32,
    results: *mut i64,
    num_results: i32,
) -> i32 {
    let args = unsafe { std::slice::from_raw_parts(args, num_args as usize) };
    if num_results == 1 {
        unsafe { *results = i64::from(func_idx) * 100 + args[0] * args[1] };
    }
    0
}

// The only test in this binary that touches the process-wide bridge state.
#[test]
fn registered_functions_run_in_the_interpreter() {
    init_interp_funcs(4);
    add_interp_func(3, 2, 1);
    let func = find_interp_func(3).unwrap();
    let addr = interp_trampoline(func.params, func.results).unwrap();
    type Binary = unsafe extern "C" fn(*mut VMContext, *mut VMContext, i64, i64) -> i64;
    let call = unsafe { std::mem::transmute::<usize, Binary>(addr) };

    let mut ctx = VMContext::new(4);
    ctx.set_current_func_index(3);
    let vmctx: *mut VMContext = &mut *ctx;

    set_interp_callback(record_call);
    assert_eq!(unsafe { call(vmctx, vmctx, 6, 7) }, 342);
    clear_interp_callback();
    assert_eq!(unsafe { call(vmctx, vmctx, 6, 7) }, 0);

    clear_interp_funcs();
    assert!(find_interp_func(3).is_none());
}
