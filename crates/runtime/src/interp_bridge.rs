//! Dispatching selected functions to an interpreter instead of generated code.
//!
//! The embedder registers one process-wide callback and describes which
//! function indices it wants to handle. Generated code calls those functions
//! through the fixed-arity trampolines below, which use the normal wasm call
//! ABI (`callee vmctx, caller vmctx, args...`), marshal the arguments into an
//! `i64` array and forward them to the callback.

use crate::vmcontext::VMContext;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// The interpreter entry point.
///
/// Receives the function index, its arguments and space for its results;
/// returns 0 on success.
pub type InterpCallback = unsafe extern "C" fn(
    func_idx: i32,
    args: *mut i64,
    num_args: i32,
    results: *mut i64,
    num_results: i32,
) -> i32;

/// A function that should be run by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpFunc {
    /// The wasm function index.
    pub func_idx: i32,
    /// Number of parameters.
    pub params: i32,
    /// Number of results.
    pub results: i32,
}

static CALLBACK: AtomicUsize = AtomicUsize::new(0);

struct InterpFuncs {
    funcs: Vec<InterpFunc>,
    capacity: usize,
}

static FUNCS: RwLock<InterpFuncs> = RwLock::new(InterpFuncs {
    funcs: Vec::new(),
    capacity: 0,
});

/// Installs the interpreter callback.
pub fn set_interp_callback(callback: InterpCallback) {
    CALLBACK.store(callback as usize, Ordering::Release);
}

/// Removes the interpreter callback; trampolines then return 0.
pub fn clear_interp_callback() {
    CALLBACK.store(0, Ordering::Release);
}

/// Whether a callback is installed.
pub fn has_interp_callback() -> bool {
    callback().is_some()
}

fn callback() -> Option<InterpCallback> {
    match CALLBACK.load(Ordering::Acquire) {
        0 => None,
        // Only ever stored from an `InterpCallback` above.
        addr => Some(unsafe { std::mem::transmute::<usize, InterpCallback>(addr) }),
    }
}

/// Resets the function table to hold at most `capacity` entries.
pub fn init_interp_funcs(capacity: usize) {
    let mut table = FUNCS.write().unwrap_or_else(PoisonError::into_inner);
    table.funcs = Vec::with_capacity(capacity);
    table.capacity = capacity;
}

/// Records that `func_idx` runs in the interpreter. Ignored once the table
/// is full or before [`init_interp_funcs`].
pub fn add_interp_func(func_idx: i32, params: i32, results: i32) {
    let mut table = FUNCS.write().unwrap_or_else(PoisonError::into_inner);
    if table.funcs.len() >= table.capacity {
        log::debug!("interpreter function table full, dropping function {func_idx}");
        return;
    }
    table.funcs.push(InterpFunc {
        func_idx,
        params,
        results,
    });
}

/// Empties the function table and releases its storage.
pub fn clear_interp_funcs() {
    let mut table = FUNCS.write().unwrap_or_else(PoisonError::into_inner);
    table.funcs = Vec::new();
    table.capacity = 0;
}

/// Looks up the registration for `func_idx`.
pub fn find_interp_func(func_idx: i32) -> Option<InterpFunc> {
    let table = FUNCS.read().unwrap_or_else(PoisonError::into_inner);
    table.funcs.iter().find(|f| f.func_idx == func_idx).copied()
}

/// Forwards a call to the interpreter on behalf of `ctx`'s current function.
unsafe fn dispatch(ctx: *mut VMContext, args: &mut [i64], num_results: i32) -> i64 {
    let Some(callback) = callback() else {
        return 0;
    };
    let func_idx = unsafe { ctx.as_ref() }.map_or(-1, |ctx| ctx.debug_current_func_idx);
    let mut result = 0i64;
    let results = if num_results == 0 {
        std::ptr::null_mut()
    } else {
        &raw mut result
    };
    let args_ptr = if args.is_empty() {
        std::ptr::null_mut()
    } else {
        args.as_mut_ptr()
    };
    unsafe {
        callback(func_idx, args_ptr, args.len() as i32, results, num_results);
    }
    result
}

macro_rules! trampolines {
    ($( $name:ident ( $($arg:ident),* ) -> $results:literal; )*) => {
        $(
            unsafe extern "C" fn $name(
                ctx: *mut VMContext,
                _caller: *mut VMContext,
                $($arg: i64),*
            ) -> i64 {
                unsafe { dispatch(ctx, &mut [$($arg),*], $results) }
            }
        )*
    };
}

trampolines! {
    trampoline_0_0() -> 0;
    trampoline_0_1() -> 1;
    trampoline_1_0(a0) -> 0;
    trampoline_1_1(a0) -> 1;
    trampoline_2_0(a0, a1) -> 0;
    trampoline_2_1(a0, a1) -> 1;
    trampoline_3_1(a0, a1, a2) -> 1;
    trampoline_4_1(a0, a1, a2, a3) -> 1;
    trampoline_5_1(a0, a1, a2, a3, a4) -> 1;
    trampoline_6_1(a0, a1, a2, a3, a4, a5) -> 1;
}

/// The address of the trampoline for a signature, or `None` when no
/// trampoline has that shape.
pub fn interp_trampoline(params: i32, results: i32) -> Option<usize> {
    let addr = match (params, results) {
        (0, 0) => trampoline_0_0 as *const () as usize,
        (0, 1) => trampoline_0_1 as *const () as usize,
        (1, 0) => trampoline_1_0 as *const () as usize,
        (1, 1) => trampoline_1_1 as *const () as usize,
        (2, 0) => trampoline_2_0 as *const () as usize,
        (2, 1) => trampoline_2_1 as *const () as usize,
        (3, 1) => trampoline_3_1 as *const () as usize,
        (4, 1) => trampoline_4_1 as *const () as usize,
        (5, 1) => trampoline_5_1 as *const () as usize,
        (6, 1) => trampoline_6_1 as *const () as usize,
        _ => return None,
    };
    Some(addr)
}
