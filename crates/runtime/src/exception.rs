//! Exception handling for `try`/`catch`/`delegate`.
//!
//! Each context keeps a chain of handler nodes, innermost first. Entering a
//! `try` block pushes a node and hands generated code the node's jump buffer
//! to arm with `sigsetjmp`; `throw` records the exception payload on the
//! context and jumps to the innermost handler with the handler's id as the
//! resume value. Matching the thrown tag against the landed handler's catch
//! clauses is left to generated code, which re-dispatches with `delegate`
//! when nothing matches.

use crate::trap::TrapCode;
use crate::vmcontext::VMContext;
use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ptr;

/// Storage for a platform `sigjmp_buf`.
#[repr(C, align(16))]
pub struct JmpBuf([u8; JMP_BUF_SIZE]);

/// Byte size reserved for each handler's jump buffer.
pub const JMP_BUF_SIZE: usize = 512;

#[repr(C)]
struct HandlerNode {
    buf: JmpBuf,
    prev: *mut HandlerNode,
    id: i32,
}

/// Per-context exception bookkeeping: the handler chain and the in-flight
/// exception.
pub(crate) struct ExceptionState {
    head: *mut HandlerNode,
    tag: i32,
    values: Vec<i64>,
    spilled: Vec<i64>,
}

impl Default for ExceptionState {
    fn default() -> ExceptionState {
        ExceptionState {
            head: ptr::null_mut(),
            tag: 0,
            values: Vec::new(),
            spilled: Vec::new(),
        }
    }
}

impl ExceptionState {
    fn depth(&self) -> usize {
        let mut n = 0;
        let mut node = self.head;
        while let Some(h) = unsafe { node.as_ref() } {
            n += 1;
            node = h.prev;
        }
        n
    }
}

unsafe extern "C" {
    fn wasmjit_siglongjmp(buf: *mut c_void, value: i32) -> !;
    fn wasmjit_catch_landing(
        buf: *mut c_void,
        body: unsafe extern "C" fn(*mut c_void),
        payload: *mut c_void,
    ) -> i32;
    fn wasmjit_jmp_buf_size() -> usize;
    fn wasmjit_sigsetjmp_address() -> *mut c_void;
}

/// Where a `throw` or `delegate` resumes: a handler's armed buffer and the
/// value `sigsetjmp` will return there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landing {
    buf: *mut JmpBuf,
    id: i32,
}

impl Landing {
    /// The id of the handler control lands in.
    pub fn handler_id(&self) -> i32 {
        self.id
    }

    /// Jumps to the handler.
    ///
    /// # Safety
    ///
    /// The handler's buffer must have been armed by a frame that is still
    /// live, and every frame between here and there must be free of
    /// destructors.
    pub unsafe fn resume(self) -> ! {
        unsafe { wasmjit_siglongjmp(self.buf.cast(), self.id) }
    }
}

unsafe fn state<'a>(vmctx: *mut VMContext) -> Result<&'a mut ExceptionState, TrapCode> {
    match unsafe { vmctx.as_mut() } {
        Some(ctx) => Ok(&mut ctx.exceptions),
        None => Err(TrapCode::UncaughtException),
    }
}

fn copy_values(values: *const i64, count: i32) -> Result<Vec<i64>, TrapCode> {
    let count = usize::try_from(count).unwrap_or(0);
    if count == 0 || values.is_null() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    out.try_reserve_exact(count)
        .map_err(|_| TrapCode::AllocationFailure)?;
    out.extend_from_slice(unsafe { std::slice::from_raw_parts(values, count) });
    Ok(out)
}

/// Pushes handler `id` and returns its jump buffer for the caller to arm.
///
/// Handler ids must be nonzero: they are delivered as `sigsetjmp`'s return
/// value.
pub unsafe fn try_begin(vmctx: *mut VMContext, id: i32) -> Result<*mut JmpBuf, TrapCode> {
    let state = unsafe { state(vmctx)? };
    let node = unsafe { alloc::alloc(Layout::new::<HandlerNode>()) }.cast::<HandlerNode>();
    if node.is_null() {
        return Err(TrapCode::AllocationFailure);
    }
    unsafe {
        node.write(HandlerNode {
            buf: JmpBuf([0; JMP_BUF_SIZE]),
            prev: state.head,
            id,
        });
        state.head = node;
        Ok(&raw mut (*node).buf)
    }
}

unsafe fn free_node(node: *mut HandlerNode) {
    unsafe { alloc::dealloc(node.cast(), Layout::new::<HandlerNode>()) }
}

/// Leaves handler `id`'s `try` block normally.
///
/// Pops the innermost handler if it is `id` and always discards the
/// exception payload and spilled locals.
pub unsafe fn try_end(vmctx: *mut VMContext, id: i32) {
    let Ok(state) = (unsafe { state(vmctx) }) else {
        return;
    };
    if let Some(head) = unsafe { state.head.as_ref() } {
        if head.id == id {
            let node = state.head;
            state.head = head.prev;
            unsafe { free_node(node) };
        }
    }
    state.values = Vec::new();
    state.spilled = Vec::new();
}

/// Records a thrown exception and finds the innermost handler.
pub unsafe fn throw(
    vmctx: *mut VMContext,
    tag: i32,
    values: *const i64,
    count: i32,
) -> Result<Landing, TrapCode> {
    let state = unsafe { state(vmctx)? };
    state.values = Vec::new();
    state.tag = tag;
    state.values = copy_values(values, count)?;
    innermost(state)
}

/// Rethrows the in-flight exception to the innermost handler.
pub unsafe fn throw_ref(vmctx: *mut VMContext, _exnref: i64) -> Result<Landing, TrapCode> {
    innermost(unsafe { state(vmctx)? })
}

fn innermost(state: &ExceptionState) -> Result<Landing, TrapCode> {
    match unsafe { state.head.as_mut() } {
        Some(head) => Ok(Landing {
            buf: &raw mut head.buf,
            id: head.id,
        }),
        None => Err(TrapCode::UncaughtException),
    }
}

/// Pops `depth` handlers and targets the next one out.
pub unsafe fn delegate(vmctx: *mut VMContext, depth: i32) -> Result<Landing, TrapCode> {
    let state = unsafe { state(vmctx)? };
    for _ in 0..depth.max(0) {
        let node = state.head;
        let Some(head) = (unsafe { node.as_ref() }) else {
            break;
        };
        state.head = head.prev;
        unsafe { free_node(node) };
    }
    innermost(state)
}

/// Tag of the in-flight exception.
pub unsafe fn get_tag(vmctx: *mut VMContext) -> i32 {
    unsafe { state(vmctx) }.map_or(0, |s| s.tag)
}

/// Payload value `idx` of the in-flight exception, or 0.
pub unsafe fn get_value(vmctx: *mut VMContext, idx: i32) -> i64 {
    let Ok(state) = (unsafe { state(vmctx) }) else {
        return 0;
    };
    usize::try_from(idx)
        .ok()
        .and_then(|i| state.values.get(i).copied())
        .unwrap_or(0)
}

/// Number of payload values of the in-flight exception.
pub unsafe fn get_value_count(vmctx: *mut VMContext) -> i32 {
    unsafe { state(vmctx) }.map_or(0, |s| s.values.len() as i32)
}

/// Saves `count` locals so a catch block can restore them after landing.
pub unsafe fn spill_locals(vmctx: *mut VMContext, locals: *const i64, count: i32) -> Result<(), TrapCode> {
    let state = unsafe { state(vmctx)? };
    state.spilled = Vec::new();
    state.spilled = copy_values(locals, count)?;
    Ok(())
}

/// Spilled local `idx`, or 0.
pub unsafe fn get_spilled_local(vmctx: *mut VMContext, idx: i32) -> i64 {
    let Ok(state) = (unsafe { state(vmctx) }) else {
        return 0;
    };
    usize::try_from(idx)
        .ok()
        .and_then(|i| state.spilled.get(i).copied())
        .unwrap_or(0)
}

/// Address of the platform `sigsetjmp`, which generated code calls directly
/// on the buffer returned by [`try_begin`] so that the saved state belongs
/// to its own frame.
pub fn sigsetjmp_address() -> usize {
    unsafe { wasmjit_sigsetjmp_address() as usize }
}

/// Arms `buf` and runs `f`, acting as the host-side catch block of a
/// handler. Returns the handler id if a throw landed here, or 0 if `f`
/// returned.
///
/// # Safety
///
/// `buf` must come from [`try_begin`] and stay in the chain while `f` runs.
/// Anything `f` owns when control lands is leaked.
pub unsafe fn catch_exception<F: FnOnce()>(buf: *mut JmpBuf, f: F) -> i32 {
    unsafe extern "C" fn call<F: FnOnce()>(payload: *mut c_void) {
        if let Some(f) = unsafe { (*payload.cast::<Option<F>>()).take() } {
            f();
        }
    }
    let mut f = Some(f);
    unsafe { wasmjit_catch_landing(buf.cast(), call::<F>, (&raw mut f).cast()) }
}

/// Frees every handler still linked from `ctx`.
pub(crate) fn free_handler_chain(ctx: &mut VMContext) {
    let state = &mut ctx.exceptions;
    while !state.head.is_null() {
        let node = state.head;
        state.head = unsafe { (*node).prev };
        unsafe { free_node(node) };
    }
}

/// Number of handlers currently linked from `ctx`.
pub fn handler_depth(ctx: &VMContext) -> usize {
    ctx.exceptions.depth()
}
