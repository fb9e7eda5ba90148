//! WebAssembly trap handling, which is built on top of the lower-level
//! signalhandling mechanisms.
//!
//! Generated code runs inside a "trapping region" set up by [`catch_traps`].
//! Traps reach the region's jump buffer two ways: the signal handlers in the
//! `unix` module convert hardware faults and explicit trap instructions, and
//! libcalls call [`raise_trap`] after they have released every resource.
//! Either way the details land in thread-local state that [`catch_traps`]
//! turns into a [`Trap`] once control is back.

mod backtrace;
mod unix;

pub use self::unix::set_sigaltstack_size;

use crate::stack::{self, WasmStack};
use crate::trap::{Frame, MAX_TRAP_FRAMES, Trap, TrapCode};
use crate::vmcontext::{VMContext, VMFunctionBody, VMTrampoline};
use std::cell::Cell;
use std::ptr;
use std::sync::Once;

unsafe extern "C" {
    fn wasmjit_setjmp(
        jmp_buf: *mut *const u8,
        callback: unsafe extern "C" fn(*mut u8),
        payload: *mut u8,
    ) -> i32;
    fn wasmjit_longjmp(jmp_buf: *const u8) -> !;
}

/// This function performs the low-overhead signal handler initialization that
/// we want to do eagerly to ensure a more-deterministic global process state.
///
/// This can be called multiple times, having no effect after the first call.
pub fn init_traps() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe { unix::platform_init() });
}

/// The calling thread's trap bookkeeping.
///
/// Everything is a `Cell` of plain data with a const initializer so the
/// signal handlers can read and write it without allocating.
pub(crate) struct TrapState {
    pub(crate) active: Cell<bool>,
    jmp_buf: Cell<*const u8>,
    pub(crate) vmctx: Cell<*mut VMContext>,
    pub(crate) code: Cell<i32>,
    pub(crate) signal: Cell<i32>,
    pub(crate) pc: Cell<usize>,
    pub(crate) lr: Cell<usize>,
    pub(crate) fp: Cell<usize>,
    pub(crate) frame_lr: Cell<usize>,
    pub(crate) fault_addr: Cell<usize>,
    pub(crate) trap_imm: Cell<i32>,
    pub(crate) func_idx: Cell<i32>,
    pub(crate) stack_low: Cell<usize>,
    pub(crate) stack_high: Cell<usize>,
    pub(crate) frames: Cell<[Frame; MAX_TRAP_FRAMES]>,
    pub(crate) frame_count: Cell<usize>,
}

const NO_FRAME: Frame = Frame { pc: 0, fp: 0 };

impl TrapState {
    const fn new() -> TrapState {
        TrapState {
            active: Cell::new(false),
            jmp_buf: Cell::new(ptr::null()),
            vmctx: Cell::new(ptr::null_mut()),
            code: Cell::new(0),
            signal: Cell::new(0),
            pc: Cell::new(0),
            lr: Cell::new(0),
            fp: Cell::new(0),
            frame_lr: Cell::new(0),
            fault_addr: Cell::new(0),
            trap_imm: Cell::new(-1),
            func_idx: Cell::new(-1),
            stack_low: Cell::new(0),
            stack_high: Cell::new(0),
            frames: Cell::new([NO_FRAME; MAX_TRAP_FRAMES]),
            frame_count: Cell::new(0),
        }
    }

    /// Clears everything describing the last trap.
    fn reset(&self) {
        self.code.set(0);
        self.signal.set(0);
        self.pc.set(0);
        self.lr.set(0);
        self.fp.set(0);
        self.frame_lr.set(0);
        self.fault_addr.set(0);
        self.trap_imm.set(-1);
        self.func_idx.set(-1);
        self.frame_count.set(0);
    }

    /// Records the function index published by the active context.
    pub(crate) fn record_func_idx(&self) {
        let vmctx = self.vmctx.get();
        if !vmctx.is_null() {
            self.func_idx.set(unsafe { (*vmctx).debug_current_func_idx });
        }
    }

    /// Records the trap's top frame and, when the stack bounds are known,
    /// the frame-pointer chain above it.
    pub(crate) fn record_frames(&self, pc: usize, fp: usize) {
        let mut frames = [NO_FRAME; MAX_TRAP_FRAMES];
        let count = backtrace::walk_frames(
            pc,
            fp,
            (self.stack_low.get(), self.stack_high.get()),
            wasmjit_jit_debug::active_range(),
            &mut frames,
        );
        self.frames.set(frames);
        self.frame_count.set(count);
    }

    /// Whether the frame record at `fp` may be read: inside the
    /// recorded stack and 16-byte aligned.
    pub(crate) fn frame_record_readable(&self, fp: usize) -> bool {
        let (low, high) = (self.stack_low.get(), self.stack_high.get());
        high > low && fp >= low && fp + 2 * size_of::<usize>() <= high && fp % 16 == 0
    }

    fn snapshot(&self) -> Option<Trap> {
        let code = TrapCode::from_raw(self.code.get())?;
        let frames = self.frames.get();
        Some(Trap {
            code,
            signal: self.signal.get(),
            pc: self.pc.get(),
            lr: self.lr.get(),
            fp: self.fp.get(),
            frame_lr: self.frame_lr.get(),
            fault_addr: self.fault_addr.get(),
            trap_immediate: u16::try_from(self.trap_imm.get()).ok(),
            func_index: u32::try_from(self.func_idx.get()).ok(),
            stack_bounds: (self.stack_low.get(), self.stack_high.get()),
            frames: frames[..self.frame_count.get()].iter().copied().collect(),
        })
    }
}

thread_local! {
    static STATE: TrapState = const { TrapState::new() };
}

pub(crate) fn with_state<R>(f: impl FnOnce(&TrapState) -> R) -> R {
    STATE.with(f)
}

/// The parts of the trapping region an inner `catch_traps` overwrites.
struct Region {
    active: bool,
    jmp_buf: *const u8,
    vmctx: *mut VMContext,
    stack: (usize, usize),
}

impl Region {
    fn save(state: &TrapState) -> Region {
        Region {
            active: state.active.get(),
            jmp_buf: state.jmp_buf.get(),
            vmctx: state.vmctx.get(),
            stack: (state.stack_low.get(), state.stack_high.get()),
        }
    }

    fn restore(self, state: &TrapState) {
        state.active.set(self.active);
        state.jmp_buf.set(self.jmp_buf);
        state.vmctx.set(self.vmctx);
        state.stack_low.set(self.stack.0);
        state.stack_high.set(self.stack.1);
    }
}

/// Catches any wasm traps that happen within the execution of `closure`,
/// returning them as a `Result`.
///
/// Regions nest: an inner region restores the outer one when it returns.
///
/// # Safety
///
/// Highly unsafe since `closure` won't have any dtors run when it traps.
pub unsafe fn catch_traps<F>(vmctx: *mut VMContext, closure: F) -> Result<(), Trap>
where
    F: FnOnce(),
{
    init_traps();
    unix::lazy_per_thread_init()?;

    let stack = match unsafe { vmctx.as_ref() }.and_then(|ctx| ctx.wasm_stack()) {
        Some(stack) => {
            let range = stack.range();
            (range.start, range.end)
        }
        None => unix::host_stack_bounds(),
    };

    let mut closure = Some(closure);
    with_state(|state| {
        let outer = Region::save(state);
        state.reset();
        state.vmctx.set(vmctx);
        state.stack_low.set(stack.0);
        state.stack_high.set(stack.1);
        state.active.set(true);

        let ret = unsafe {
            wasmjit_setjmp(
                state.jmp_buf.as_ptr(),
                call_closure::<F>,
                (&raw mut closure).cast(),
            )
        };
        outer.restore(state);

        if ret == 1 {
            return Ok(());
        }
        Err(state
            .snapshot()
            .unwrap_or_else(|| Trap::new(TrapCode::Unknown)))
    })
}

unsafe extern "C" fn call_closure<F>(payload: *mut u8)
where
    F: FnOnce(),
{
    if let Some(f) = unsafe { (*payload.cast::<Option<F>>()).take() } {
        f();
    }
}

/// Records `code` as the current trap and, inside a trapping region, unwinds
/// to it. Outside a region it returns so the caller can produce its
/// sentinel.
///
/// # Safety
///
/// Inside a region no Rust destructors may be on the stack between here and
/// the region's [`catch_traps`]. They will be skipped and not executed.
pub unsafe fn raise_trap(code: TrapCode) {
    let jmp_buf = with_state(|state| {
        state.code.set(code.as_raw());
        state.signal.set(0);
        state.trap_imm.set(-1);
        state.frame_count.set(0);
        state.record_func_idx();
        if state.active.get() {
            state.jmp_buf.get()
        } else {
            ptr::null()
        }
    });
    if !jmp_buf.is_null() {
        unsafe { wasmjit_longjmp(jmp_buf) }
    }
}

/// Invokes an entry trampoline inside a trapping region.
///
/// Returns -1 if any input is null, the trap code if the call trapped, and
/// the trampoline's own result otherwise.
///
/// # Safety
///
/// `trampoline` and `func` must be code emitted for `vmctx`'s module.
pub unsafe fn call_trampoline(
    trampoline: Option<VMTrampoline>,
    vmctx: *mut VMContext,
    values: *mut i64,
    func: *const VMFunctionBody,
) -> i32 {
    let Some(trampoline) = trampoline else {
        return -1;
    };
    if vmctx.is_null() || values.is_null() || func.is_null() {
        return -1;
    }
    let mut ret = 0;
    let result = unsafe {
        catch_traps(vmctx, || {
            ret = trampoline(vmctx, values, func);
        })
    };
    match result {
        Ok(()) => ret,
        Err(trap) => trap.code.as_raw(),
    }
}

/// Like [`call_trampoline`], but runs the call on the context's independent
/// stack. Falls back to [`call_trampoline`] when the context has no stack
/// or this host cannot switch stacks.
///
/// # Safety
///
/// Same as [`call_trampoline`].
pub unsafe fn call_trampoline_on_stack(
    trampoline: Option<VMTrampoline>,
    vmctx: *mut VMContext,
    values: *mut i64,
    func: *const VMFunctionBody,
) -> i32 {
    let stack: *const WasmStack = match unsafe { vmctx.as_ref() }.and_then(|c| c.wasm_stack()) {
        Some(stack) if stack::SUPPORTED_ARCH => stack,
        _ => return unsafe { call_trampoline(trampoline, vmctx, values, func) },
    };
    let Some(trampoline) = trampoline else {
        return -1;
    };
    if values.is_null() || func.is_null() {
        return -1;
    }
    let mut ret = 0;
    let result = unsafe {
        catch_traps(vmctx, || {
            ret = stack::call_on_stack(&*stack, trampoline, vmctx, values, func);
        })
    };
    match result {
        Ok(()) => ret,
        Err(trap) => trap.code.as_raw(),
    }
}

/// The calling thread's most recent trap, if any.
pub fn last_trap() -> Option<Trap> {
    with_state(|state| state.snapshot())
}

/// Forgets the calling thread's most recent trap.
pub fn clear_trap() {
    with_state(|state| state.reset());
}
