//! The WASI preview1 primitives that interact with the trap machinery and
//! the context's own state: process exit, yielding, and the argument and
//! environment vectors.

use crate::trap::TrapCode;
use crate::vmcontext::VMContext;

/// `errno` values from the preview1 ABI.
pub mod errno {
    /// No error.
    pub const SUCCESS: i64 = 0;
    /// No memory to operate on.
    pub const BADF: i64 = 8;
    /// A guest pointer is out of bounds.
    pub const FAULT: i64 = 21;
}

/// Arguments, environment and exit status for one context.
#[derive(Debug, Default)]
pub(crate) struct WasiState {
    /// NUL-terminated argument strings.
    args: Vec<Vec<u8>>,
    /// NUL-terminated `KEY=VALUE` strings.
    env: Vec<Vec<u8>>,
    exit_code: Option<i32>,
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

impl VMContext {
    /// Sets the strings returned by `args_get`.
    pub fn set_wasi_args<S: AsRef<str>>(&mut self, args: &[S]) {
        self.wasi.args = args.iter().map(|a| nul_terminated(a.as_ref())).collect();
    }

    /// Sets the variables returned by `environ_get`.
    pub fn set_wasi_env<K: AsRef<str>, V: AsRef<str>>(&mut self, env: &[(K, V)]) {
        self.wasi.env = env
            .iter()
            .map(|(k, v)| nul_terminated(&format!("{}={}", k.as_ref(), v.as_ref())))
            .collect();
    }

    /// The code passed to `proc_exit`, if the program has exited.
    pub fn wasi_exit_code(&self) -> Option<i32> {
        self.wasi.exit_code
    }

    /// Forgets a previous `proc_exit`.
    pub fn clear_wasi_exit(&mut self) {
        self.wasi.exit_code = None;
    }
}

/// Records the exit code and ends the call with [`TrapCode::Exit`].
pub unsafe fn proc_exit(vmctx: *mut VMContext, code: i64) -> Result<i64, TrapCode> {
    let Some(ctx) = (unsafe { vmctx.as_mut() }) else {
        return Ok(0);
    };
    log::debug!("guest requested exit with code {code}");
    ctx.wasi.exit_code = Some(code as i32);
    Err(TrapCode::Exit)
}

/// Yields the thread.
pub unsafe fn sched_yield(_vmctx: *mut VMContext) -> i64 {
    std::thread::yield_now();
    errno::SUCCESS
}

/// Bounds-checked view of memory 0.
struct GuestMemory {
    base: *mut u8,
    len: usize,
}

impl GuestMemory {
    unsafe fn of(ctx: &VMContext) -> Option<GuestMemory> {
        let memory = unsafe { ctx.memory0.as_ref()? };
        if memory.base.is_null() {
            return None;
        }
        Some(GuestMemory {
            base: memory.base,
            len: memory.current_length(),
        })
    }

    fn check(&self, ptr: u32, len: usize) -> Result<(), i64> {
        let ptr = ptr as usize;
        if ptr > self.len || len > self.len - ptr {
            return Err(errno::FAULT);
        }
        Ok(())
    }

    fn write_u32(&mut self, ptr: u32, value: u32) {
        unsafe {
            self.base
                .add(ptr as usize)
                .cast::<[u8; 4]>()
                .write(value.to_le_bytes())
        };
    }

    fn write_bytes(&mut self, ptr: u32, bytes: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(ptr as usize), bytes.len())
        };
    }
}

fn buf_size(strings: &[Vec<u8>]) -> usize {
    strings.iter().map(Vec::len).sum()
}

unsafe fn sizes_get(
    vmctx: *mut VMContext,
    strings: impl Fn(&VMContext) -> &[Vec<u8>],
    count_ptr: i64,
    size_ptr: i64,
) -> i64 {
    let Some(ctx) = (unsafe { vmctx.as_ref() }) else {
        return errno::BADF;
    };
    let Some(mut mem) = (unsafe { GuestMemory::of(ctx) }) else {
        return errno::BADF;
    };
    let (count_ptr, size_ptr) = (count_ptr as u32, size_ptr as u32);
    if let Err(e) = mem.check(count_ptr, 4).and(mem.check(size_ptr, 4)) {
        return e;
    }
    let strings = strings(ctx);
    mem.write_u32(count_ptr, strings.len() as u32);
    mem.write_u32(size_ptr, buf_size(strings) as u32);
    errno::SUCCESS
}

unsafe fn strings_get(
    vmctx: *mut VMContext,
    strings: impl Fn(&VMContext) -> &[Vec<u8>],
    ptrs: i64,
    buf: i64,
) -> i64 {
    let Some(ctx) = (unsafe { vmctx.as_ref() }) else {
        return errno::BADF;
    };
    let Some(mut mem) = (unsafe { GuestMemory::of(ctx) }) else {
        return errno::BADF;
    };
    let strings = strings(ctx);
    let (ptrs, buf) = (ptrs as u32, buf as u32);
    if let Err(e) = mem
        .check(ptrs, strings.len() * 4)
        .and(mem.check(buf, buf_size(strings)))
    {
        return e;
    }

    let mut offset = buf;
    for (i, s) in strings.iter().enumerate() {
        mem.write_u32(ptrs + 4 * i as u32, offset);
        mem.write_bytes(offset, s);
        offset += s.len() as u32;
    }
    errno::SUCCESS
}

/// Writes the argument count and total argument buffer size.
pub unsafe fn args_sizes_get(vmctx: *mut VMContext, argc_ptr: i64, buf_size_ptr: i64) -> i64 {
    unsafe { sizes_get(vmctx, |ctx| ctx.wasi.args.as_slice(), argc_ptr, buf_size_ptr) }
}

/// Writes the argument pointers to `argv` and the strings to `argv_buf`.
pub unsafe fn args_get(vmctx: *mut VMContext, argv: i64, argv_buf: i64) -> i64 {
    unsafe { strings_get(vmctx, |ctx| ctx.wasi.args.as_slice(), argv, argv_buf) }
}

/// Writes the variable count and total environment buffer size.
pub unsafe fn environ_sizes_get(vmctx: *mut VMContext, count_ptr: i64, buf_size_ptr: i64) -> i64 {
    unsafe { sizes_get(vmctx, |ctx| ctx.wasi.env.as_slice(), count_ptr, buf_size_ptr) }
}

/// Writes the variable pointers to `environ` and the strings to
/// `environ_buf`.
pub unsafe fn environ_get(vmctx: *mut VMContext, environ: i64, environ_buf: i64) -> i64 {
    unsafe { strings_get(vmctx, |ctx| ctx.wasi.env.as_slice(), environ, environ_buf) }
}
