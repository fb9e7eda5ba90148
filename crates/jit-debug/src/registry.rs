//! Debugger registration and the process-wide "active" function table used
//! to symbolicate trap backtraces.

use crate::gdb_jit_int::GdbJitImageRegistration;
use crate::image::{FunctionInfo, JitDebugInfo, Symbolized, lookup_in};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Names a file that receives a copy of every registered image.
pub const DUMP_ENV: &str = "WASMJIT_JIT_DEBUG_DUMP";

/// A registered image; dropping it unregisters the image from the debugger.
pub struct JitRegistration {
    gdb: Option<GdbJitImageRegistration>,
}

impl JitRegistration {
    /// Whether an image was actually handed to the debugger.
    pub fn is_registered(&self) -> bool {
        self.gdb.is_some()
    }

    /// The registered image, if any.
    pub fn image(&self) -> Option<&[u8]> {
        self.gdb.as_ref().map(|g| g.file())
    }
}

impl std::fmt::Debug for JitRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitRegistration")
            .field("image_len", &self.image().map(<[u8]>::len))
            .finish()
    }
}

impl JitDebugInfo {
    /// Builds the image and announces it through the GDB JIT interface.
    ///
    /// Nothing is registered when no functions were added. When
    /// `WASMJIT_JIT_DEBUG_DUMP` is set the image is also written to that
    /// path.
    pub fn register(&self) -> Result<JitRegistration> {
        self.register_with_dump(std::env::var_os(DUMP_ENV).map(PathBuf::from).as_deref())
    }

    pub(crate) fn register_with_dump(&self, dump: Option<&Path>) -> Result<JitRegistration> {
        if self.functions().is_empty() {
            return Ok(JitRegistration { gdb: None });
        }
        let image = self
            .build_image()
            .context("failed to build the JIT debug image")?;
        if let Some(path) = dump {
            match std::fs::write(path, &image) {
                Ok(()) => log::debug!("dumped {} byte debug image to {}", image.len(), path.display()),
                Err(e) => log::warn!("failed to dump debug image to {}: {e}", path.display()),
            }
        }
        log::debug!(
            "registered {} JIT functions with the debugger ({:#x}..{:#x})",
            self.functions().len(),
            self.low_pc(),
            self.high_pc()
        );
        Ok(JitRegistration {
            gdb: Some(GdbJitImageRegistration::register(image)),
        })
    }

    /// Makes this table the one consulted by [`active_range`], [`lookup`]
    /// and [`format_backtrace`].
    pub fn set_active(&self) {
        set_active_functions(Some(self));
    }
}

// The range is read from signal handlers and must stay lock-free.
static ACTIVE_LOW: AtomicU64 = AtomicU64::new(0);
static ACTIVE_HIGH: AtomicU64 = AtomicU64::new(0);
static ACTIVE: RwLock<Option<Arc<[FunctionInfo]>>> = RwLock::new(None);

fn set_active_functions(info: Option<&JitDebugInfo>) {
    let mut active = ACTIVE.write().unwrap_or_else(PoisonError::into_inner);
    // Close the range first so a concurrent reader never pairs a new bound
    // with an old one.
    ACTIVE_HIGH.store(0, Ordering::Release);
    ACTIVE_LOW.store(0, Ordering::Release);
    match info {
        Some(info) if !info.functions().is_empty() => {
            *active = Some(info.functions().into());
            ACTIVE_LOW.store(info.low_pc(), Ordering::Release);
            ACTIVE_HIGH.store(info.high_pc(), Ordering::Release);
        }
        _ => *active = None,
    }
}

/// Forgets the active table.
pub fn clear_active() {
    set_active_functions(None);
}

/// The code range of the active table, if one is set.
///
/// Safe to call from a signal handler.
pub fn active_range() -> Option<(u64, u64)> {
    let low = ACTIVE_LOW.load(Ordering::Acquire);
    let high = ACTIVE_HIGH.load(Ordering::Acquire);
    (low < high).then_some((low, high))
}

/// Resolves `addr` against the active table.
pub fn lookup(addr: u64) -> Option<Symbolized> {
    let active = ACTIVE.read().unwrap_or_else(PoisonError::into_inner);
    lookup_in(active.as_deref()?, addr)
}

/// Renders one line per frame, naming the containing function where the
/// active table knows it.
pub fn format_backtrace(pcs: &[u64]) -> String {
    let active = ACTIVE.read().unwrap_or_else(PoisonError::into_inner);
    let functions = active.as_deref().unwrap_or(&[]);
    let mut out = String::new();
    for (i, &pc) in pcs.iter().enumerate() {
        let _ = match lookup_in(functions, pc) {
            Some(sym) => writeln!(out, "  #{i} 0x{pc:x} {}+0x{:x}", sym.name, sym.offset),
            None => writeln!(out, "  #{i} 0x{pc:x} <unknown>"),
        };
    }
    out
}
