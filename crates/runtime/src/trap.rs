//! Trap codes shared between generated code, the runtime and embedders.

use smallvec::SmallVec;
use std::fmt;

/// Maximum number of frames recorded when a trap unwinds the stack.
pub const MAX_TRAP_FRAMES: usize = 32;

/// The reason a call into generated code was aborted.
///
/// The discriminants are part of the ABI: generated code and the call
/// trampolines exchange them as plain `i32` values, with `0` meaning "no
/// trap".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(i32)]
pub enum TrapCode {
    /// An out-of-bounds access to linear memory, a table, a passive segment or
    /// a GC array.
    #[error("out of bounds memory access")]
    HeapOutOfBounds = 1,

    /// The call stack was exhausted.
    #[error("call stack exhausted")]
    StackOverflow = 2,

    /// An `unreachable` instruction was executed, or a null GC reference was
    /// dereferenced.
    #[error("unreachable code executed")]
    UnreachableCodeReached = 3,

    /// The signature of an indirect call target didn't match, or a
    /// `ref.cast` failed.
    #[error("indirect call type mismatch")]
    BadSignature = 4,

    /// A float-to-int conversion was out of range or NaN.
    #[error("invalid conversion to integer")]
    BadConversionToInteger = 5,

    /// Integer division by zero.
    #[error("integer divide by zero")]
    IntegerDivisionByZero = 6,

    /// Integer arithmetic overflowed.
    #[error("integer overflow")]
    IntegerOverflow = 7,

    /// An exception was thrown with no handler left to receive it.
    #[error("uncaught exception")]
    UncaughtException = 8,

    /// A fault the runtime could not attribute to any of the other codes.
    #[error("unknown trap")]
    Unknown = 99,

    /// The program asked to exit through `proc_exit`.
    #[error("program exited")]
    Exit = 100,

    /// The runtime could not allocate memory on behalf of generated code.
    #[error("runtime allocation failed")]
    AllocationFailure = 101,
}

impl TrapCode {
    /// Decodes a raw code, returning `None` for `0` and any unassigned value.
    pub fn from_raw(raw: i32) -> Option<TrapCode> {
        Some(match raw {
            1 => TrapCode::HeapOutOfBounds,
            2 => TrapCode::StackOverflow,
            3 => TrapCode::UnreachableCodeReached,
            4 => TrapCode::BadSignature,
            5 => TrapCode::BadConversionToInteger,
            6 => TrapCode::IntegerDivisionByZero,
            7 => TrapCode::IntegerOverflow,
            8 => TrapCode::UncaughtException,
            99 => TrapCode::Unknown,
            100 => TrapCode::Exit,
            101 => TrapCode::AllocationFailure,
            _ => return None,
        })
    }

    /// The ABI value of this code.
    pub fn as_raw(self) -> i32 {
        self as i32
    }

    /// Maps the immediate operand of an explicit trap instruction emitted by
    /// the code generator to a trap code.
    pub fn from_trap_immediate(imm: u16) -> TrapCode {
        match imm {
            0 => TrapCode::UnreachableCodeReached,
            1 => TrapCode::HeapOutOfBounds,
            2 => TrapCode::BadSignature,
            3 => TrapCode::BadConversionToInteger,
            4 => TrapCode::IntegerDivisionByZero,
            5 => TrapCode::IntegerOverflow,
            _ => TrapCode::Unknown,
        }
    }
}

/// One captured activation: the program counter and the frame pointer it
/// executes with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Frame {
    /// Program counter (the faulting pc for the first frame, return
    /// addresses for the rest).
    pub pc: usize,
    /// Frame pointer of the activation.
    pub fp: usize,
}

/// A trap raised while generated code was executing, with everything the
/// signal handler or libcall recorded about it.
#[derive(Debug, Clone)]
pub struct Trap {
    /// Why execution stopped.
    pub code: TrapCode,
    /// The signal that delivered the trap, or 0 if it was raised by a libcall.
    pub signal: i32,
    /// Program counter at the faulting instruction.
    pub pc: usize,
    /// Link register at the time of the fault (0 where the architecture has
    /// none).
    pub lr: usize,
    /// Frame pointer at the time of the fault.
    pub fp: usize,
    /// Return address stored in the faulting frame's frame record.
    pub frame_lr: usize,
    /// Faulting data address for memory faults.
    pub fault_addr: usize,
    /// Immediate of the trap instruction, if one was decoded.
    pub trap_immediate: Option<u16>,
    /// The function index generated code published in its context.
    pub func_index: Option<u32>,
    /// Bounds of the stack the walk was validated against, as `(low, high)`.
    pub stack_bounds: (usize, usize),
    /// Captured frames, innermost first.
    pub frames: SmallVec<[Frame; 8]>,
}

impl Trap {
    /// A trap with only a code and no machine state attached.
    pub fn new(code: TrapCode) -> Trap {
        Trap {
            code,
            signal: 0,
            pc: 0,
            lr: 0,
            fp: 0,
            frame_lr: 0,
            fault_addr: 0,
            trap_immediate: None,
            func_index: None,
            stack_bounds: (0, 0),
            frames: SmallVec::new(),
        }
    }

    /// Program counters of the captured frames, innermost first.
    pub fn frame_pcs(&self) -> impl Iterator<Item = usize> + '_ {
        self.frames.iter().map(|f| f.pc)
    }

    /// Symbolicates the captured frames against the active JIT debug
    /// registration.
    pub fn backtrace(&self) -> String {
        let pcs = self.frame_pcs().map(|pc| pc as u64).collect::<Vec<_>>();
        wasmjit_jit_debug::format_backtrace(&pcs)
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wasm trap: {}", self.code)?;
        if self.pc != 0 {
            write!(f, " at pc {:#x}", self.pc)?;
        }
        if let Some(idx) = self.func_index {
            write!(f, " in function {idx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Trap {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.code)
    }
}

impl From<TrapCode> for Trap {
    fn from(code: TrapCode) -> Trap {
        Trap::new(code)
    }
}
