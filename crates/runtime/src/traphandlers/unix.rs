//! Signal handlers turning faults in generated code into traps.

use super::{TrapState, with_state};
use crate::config::DEFAULT_SIGALTSTACK_SIZE;
use crate::mmap::{self, Mmap};
use crate::trap::{Trap, TrapCode};
use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of the alternate signal stack, not including its guard page.
static SIGALTSTACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_SIGALTSTACK_SIZE);

/// Faults this far below the host stack's low end count as host stack
/// overflow.
const HOST_STACK_SLOP: usize = 64 * 1024;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        const FPE_INTDIV: libc::c_int = 1;
        const FPE_INTOVF: libc::c_int = 2;
    } else {
        const FPE_INTDIV: libc::c_int = 7;
        const FPE_INTOVF: libc::c_int = 8;
    }
}

/// Assumed host stack size when the thread's bounds can't be queried.
const FALLBACK_HOST_STACK: usize = 8 << 20;

/// Sets the size of the alternate signal stack installed by threads that
/// haven't entered generated code yet. Zero restores the default.
pub fn set_sigaltstack_size(size: usize) {
    let size = if size == 0 {
        DEFAULT_SIGALTSTACK_SIZE
    } else {
        size
    };
    SIGALTSTACK_SIZE.store(size, Ordering::Relaxed);
}

pub(super) unsafe fn platform_init() {
    let register = |signal: i32, on_stack: bool| {
        let mut handler: libc::sigaction = unsafe { mem::zeroed() };
        // SA_SIGINFO gives us access to the faulting pc and address.
        //
        // SA_NODEFER lets a fault inside the handler reach the default
        // action instead of blocking forever.
        //
        // SA_ONSTACK is what lets stack overflow be handled at all: the
        // handler runs on the sigaltstack set up per thread below.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        if on_stack {
            handler.sa_flags |= libc::SA_ONSTACK;
        }
        handler.sa_sigaction = trap_handler as *const () as usize;
        unsafe {
            libc::sigemptyset(&mut handler.sa_mask);
            if libc::sigaction(signal, &handler, ptr::null_mut()) != 0 {
                panic!(
                    "unable to install signal handler: {}",
                    io::Error::last_os_error(),
                );
            }
        }
    };

    // Explicit trap instructions: `ud2` on x86_64, `brk` on aarch64.
    register(libc::SIGILL, false);
    register(libc::SIGTRAP, false);

    // Guard page hits, both for linear memory and for the stacks.
    register(libc::SIGSEGV, true);
    register(libc::SIGBUS, true);

    // x86 uses SIGFPE to report division by zero
    if cfg!(target_arch = "x86_64") {
        register(libc::SIGFPE, false);
    }
    log::debug!("installed trap signal handlers");
}

unsafe extern "C" fn trap_handler(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let jmp_buf = with_state(|state| {
        // Faults outside a trapping region aren't ours.
        if !state.active.get() {
            return ptr::null();
        }
        unsafe { record_signal(state, signum, siginfo, context) };
        state.jmp_buf.get()
    });

    if jmp_buf.is_null() {
        // Reset to the default action and return; the faulting instruction
        // runs again and takes the process down as if we were never here.
        unsafe {
            let mut dfl: libc::sigaction = mem::zeroed();
            dfl.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut dfl.sa_mask);
            libc::sigaction(signum, &dfl, ptr::null_mut());
        }
        return;
    }
    unsafe { super::wasmjit_longjmp(jmp_buf) }
}

/// Fills in `state` for a signal taken in generated code. Runs in signal
/// context: no allocation, no locks, no logging.
unsafe fn record_signal(
    state: &TrapState,
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let regs = unsafe { get_registers(context) };
    state.signal.set(signum);
    state.pc.set(regs.pc);
    state.lr.set(regs.lr);
    state.fp.set(regs.fp);
    state.fault_addr.set(0);
    state.trap_imm.set(-1);
    state.frame_lr.set(if state.frame_record_readable(regs.fp) {
        unsafe { *((regs.fp + mem::size_of::<usize>()) as *const usize) }
    } else {
        0
    });

    let code = match signum {
        libc::SIGILL | libc::SIGTRAP => match unsafe { trap_immediate(regs.pc) } {
            Some(imm) => {
                state.trap_imm.set(i32::from(imm));
                TrapCode::from_trap_immediate(imm)
            }
            None => TrapCode::Unknown,
        },
        libc::SIGFPE => match unsafe { (*siginfo).si_code } {
            FPE_INTDIV => TrapCode::IntegerDivisionByZero,
            FPE_INTOVF => TrapCode::IntegerOverflow,
            _ => TrapCode::Unknown,
        },
        libc::SIGSEGV | libc::SIGBUS => {
            let addr = unsafe { fault_address(siginfo) };
            state.fault_addr.set(addr);
            unsafe { classify_fault(state, addr) }
        }
        _ => TrapCode::Unknown,
    };
    state.code.set(code.as_raw());
    state.record_func_idx();
    state.record_frames(regs.pc, regs.fp);
}

/// Attributes a memory fault to linear memory, the wasm stack, or the host
/// stack, in that order.
unsafe fn classify_fault(state: &TrapState, addr: usize) -> TrapCode {
    if let Some(ctx) = unsafe { state.vmctx.get().as_ref() } {
        if let Some(memory0) = unsafe { ctx.memory0.as_ref() } {
            if memory0.is_guard_fault(addr) {
                return TrapCode::HeapOutOfBounds;
            }
        }
        if let Some(stack) = &ctx.wasm_stack {
            if stack.is_guard_fault(addr) {
                return TrapCode::StackOverflow;
            }
        }
    }
    // The main thread's guard gap can sit inside the reported bounds, so the
    // whole host stack plus the slop below it counts as exhaustion.
    let (low, high) = HOST_STACK.with(|s| s.get());
    if low != 0 && addr >= low.saturating_sub(HOST_STACK_SLOP) && addr < high {
        return TrapCode::StackOverflow;
    }
    TrapCode::Unknown
}

/// Decodes the immediate of the explicit trap instruction at `pc`.
#[cfg(target_arch = "x86_64")]
unsafe fn trap_immediate(pc: usize) -> Option<u16> {
    // ud2 followed by a one-byte immediate.
    let insn = pc as *const u8;
    unsafe {
        if *insn == 0x0f && *insn.add(1) == 0x0b {
            Some(u16::from(*insn.add(2)))
        } else {
            None
        }
    }
}

/// Decodes the immediate of the explicit trap instruction at `pc`.
#[cfg(target_arch = "aarch64")]
unsafe fn trap_immediate(pc: usize) -> Option<u16> {
    const BRK_MASK: u32 = 0xffe0_001f;
    const BRK: u32 = 0xd420_0000;

    // Some kernels report the pc after the brk.
    for candidate in [pc, pc.wrapping_sub(4)] {
        if candidate == 0 || candidate % 4 != 0 {
            continue;
        }
        let insn = unsafe { *(candidate as *const u32) };
        if insn & BRK_MASK == BRK {
            return Some(((insn >> 5) & 0xffff) as u16);
        }
    }
    None
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn trap_immediate(_pc: usize) -> Option<u16> {
    None
}

unsafe fn fault_address(siginfo: *const libc::siginfo_t) -> usize {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            unsafe { (*siginfo).si_addr() as usize }
        } else {
            unsafe { (*siginfo).si_addr as usize }
        }
    }
}

struct Registers {
    pc: usize,
    fp: usize,
    lr: usize,
}

unsafe fn get_registers(cx: *mut libc::c_void) -> Registers {
    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            Registers {
                pc: cx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize,
                fp: cx.uc_mcontext.gregs[libc::REG_RBP as usize] as usize,
                lr: 0,
            }
        } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            Registers {
                pc: cx.uc_mcontext.pc as usize,
                fp: cx.uc_mcontext.regs[29] as usize,
                lr: cx.uc_mcontext.regs[30] as usize,
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            let ss = unsafe { &(*cx.uc_mcontext).__ss };
            Registers {
                pc: ss.__rip as usize,
                fp: ss.__rbp as usize,
                lr: 0,
            }
        } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
            let cx = unsafe { &*(cx as *const libc::ucontext_t) };
            let ss = unsafe { &(*cx.uc_mcontext).__ss };
            Registers {
                pc: ss.__pc as usize,
                fp: ss.__fp as usize,
                lr: ss.__lr as usize,
            }
        } else {
            compile_error!("unsupported platform");
        }
    }
}

thread_local! {
    /// `(low, high)` of this thread's native stack, or zeros until
    /// `lazy_per_thread_init` runs.
    static HOST_STACK: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

pub(super) fn host_stack_bounds() -> (usize, usize) {
    HOST_STACK.with(|s| s.get())
}

/// A thread's first entry into generated code installs a sigaltstack and
/// records the native stack bounds.
pub(super) fn lazy_per_thread_init() -> Result<(), Trap> {
    if HOST_STACK.with(|s| s.get()) == (0, 0) {
        let bounds = query_host_stack();
        HOST_STACK.with(|s| s.set(bounds));
    }
    setup_unix_sigaltstack()
}

fn query_host_stack() -> (usize, usize) {
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            unsafe {
                let mut attr: libc::pthread_attr_t = mem::zeroed();
                if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) == 0 {
                    let mut addr = ptr::null_mut();
                    let mut size = 0;
                    let r = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
                    libc::pthread_attr_destroy(&mut attr);
                    if r == 0 && size != 0 {
                        return (addr as usize, addr as usize + size);
                    }
                }
            }
        } else if #[cfg(target_os = "macos")] {
            unsafe {
                let thread = libc::pthread_self();
                let top = libc::pthread_get_stackaddr_np(thread) as usize;
                let size = libc::pthread_get_stacksize_np(thread);
                if top != 0 && size != 0 {
                    return (top - size, top);
                }
            }
        }
    }
    let marker = 0u8;
    let sp = (&raw const marker) as usize;
    log::warn!("couldn't query the host stack; assuming {FALLBACK_HOST_STACK:#x} bytes below {sp:#x}");
    (sp.saturating_sub(FALLBACK_HOST_STACK), sp)
}

fn setup_unix_sigaltstack() -> Result<(), Trap> {
    thread_local! {
        /// Thread-local state is lazy-initialized on the first time it's used,
        /// and dropped when the thread exits.
        static TLS: RefCell<Tls> = const { RefCell::new(Tls::None) };
    }

    enum Tls {
        None,
        // Unmapped on thread exit by `Mmap`'s drop.
        Allocated { _mmap: Mmap },
        BigEnough,
    }

    let size = SIGALTSTACK_SIZE.load(Ordering::Relaxed);
    TLS.with(|slot| unsafe {
        let mut slot = slot.borrow_mut();
        if !matches!(*slot, Tls::None) {
            return Ok(());
        }

        // Check to see if the existing sigaltstack, if it exists, is big
        // enough. If so we don't need to allocate our own.
        let mut old_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) == 0
            && old_stack.ss_flags & libc::SS_DISABLE == 0
            && old_stack.ss_size >= size
        {
            *slot = Tls::BigEnough;
            return Ok(());
        }

        // ... but failing that we need to allocate our own, with a guard
        // page below it.
        let guard_size = mmap::page_size();
        let stack_size = mmap::round_up_to_page_size(size);
        let mut mmap = match Mmap::reserve(guard_size + stack_size) {
            Ok(mmap) => mmap,
            Err(e) => {
                log::warn!("failed to allocate sigaltstack: {e:#}");
                return Err(Trap::new(TrapCode::AllocationFailure));
            }
        };
        if let Err(e) = mmap.make_accessible(guard_size..guard_size + stack_size) {
            log::warn!("failed to allocate sigaltstack: {e:#}");
            return Err(Trap::new(TrapCode::AllocationFailure));
        }
        let new_stack = libc::stack_t {
            ss_sp: mmap.as_mut_ptr().add(guard_size).cast(),
            ss_flags: 0,
            ss_size: stack_size,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) != 0 {
            log::warn!(
                "registering sigaltstack failed: {}",
                io::Error::last_os_error()
            );
            return Err(Trap::new(TrapCode::AllocationFailure));
        }
        log::trace!("installed {stack_size:#x} byte sigaltstack");

        *slot = Tls::Allocated { _mmap: mmap };
        Ok(())
    })
}
