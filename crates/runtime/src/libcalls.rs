//! Runtime library calls.
//!
//! These functions are called by generated code, and therefore must take
//! certain care about some things:
//!
//! * They must only contain basic, raw i32/i64/pointer parameters that are
//!   safe to pass across the system ABI.
//!
//! * If any nested function propagates an `Err(trap)` out to the library
//!   function frame, we need to raise it. Raising a trap (or landing in an
//!   exception handler) is a non-local jump: drops **will not** be run for
//!   anything still live on the stack. The implementations therefore finish
//!   all of their work, releasing every borrow and allocation, before the
//!   `raw` wrapper converts their result and jumps.
//!
//! All libcalls are listed once in [`foreach_libcall!`]; the `raw` entry
//! points and the [`Libcall`] table a code generator resolves addresses from
//! are both generated from that list.

use crate::exception::{JmpBuf, Landing};
use crate::gc::ops;
use crate::trap::TrapCode;
use crate::traphandlers::raise_trap;
use crate::vmcontext::VMContext;

pub use crate::exception::{
    delegate, get_spilled_local, get_tag, get_value, get_value_count, spill_locals, throw,
    throw_ref, try_begin, try_end,
};
pub(crate) use crate::gc::ops::{
    alloc_array_slow, alloc_struct_slow, array_copy, array_fill, array_get, array_len, array_new,
    array_new_fixed, array_set, check_indirect_call_type, gc_collect, ref_cast, ref_test,
    struct_get, struct_new, struct_set,
};
pub(crate) use crate::memory::{memory_copy, memory_fill, memory_grow, memory_size};
pub(crate) use crate::segments::{
    array_init_data, array_init_elem, array_new_data, array_new_elem, data_drop, elem_drop,
    memory_init,
};
pub(crate) use crate::table::{table_copy, table_fill, table_grow, table_init};
pub use crate::wasi::{
    args_get, args_sizes_get, environ_get, environ_sizes_get, proc_exit, sched_yield,
};

/// Invokes `$mac` with the signature of every libcall.
///
/// Each entry is `name(param: type, ...) -> result;`, where the result is
/// omitted for libcalls that return nothing.
#[macro_export]
macro_rules! foreach_libcall {
    ($mac:ident) => {
        $mac! {
            // Linear memory.
            memory_grow(vmctx: *mut VMContext, idx: i32, delta: i32, max_pages: i32) -> i32;
            memory_size(vmctx: *mut VMContext, idx: i32) -> i32;
            memory_fill(vmctx: *mut VMContext, idx: i32, dst: i64, val: i32, len: i64);
            memory_copy(vmctx: *mut VMContext, dst_idx: i32, src_idx: i32, dst: i64, src: i64, len: i64);
            memory_init(vmctx: *mut VMContext, mem: i32, seg: i32, dst: i32, src: i32, len: i32);
            data_drop(vmctx: *mut VMContext, seg: i32);

            // Tables.
            table_grow(vmctx: *mut VMContext, idx: i32, delta: i64, init: i64) -> i32;
            table_fill(vmctx: *mut VMContext, idx: i32, dst: i32, val: i64, len: i32);
            table_copy(vmctx: *mut VMContext, dst_idx: i32, src_idx: i32, dst: i32, src: i32, len: i32);
            table_init(vmctx: *mut VMContext, idx: i32, elem: i32, dst: i32, src: i32, len: i32);
            elem_drop(vmctx: *mut VMContext, seg: i32);

            // GC objects.
            struct_new(type_idx: i32, fields: *const i64, num_fields: i32) -> i64;
            struct_get(value: i64, type_idx: i32, field: i32) -> i64;
            struct_set(value: i64, type_idx: i32, field: i32, new: i64);
            array_new(type_idx: i32, len: i32, fill: i64) -> i64;
            array_new_fixed(type_idx: i32, elems: *const i64, len: i32) -> i64;
            array_get(value: i64, type_idx: i32, idx: i32) -> i64;
            array_set(value: i64, type_idx: i32, idx: i32, new: i64);
            array_len(value: i64) -> i32;
            array_fill(value: i64, start: i32, fill: i64, count: i32);
            array_copy(dst: i64, dst_start: i32, src: i64, src_start: i32, count: i32);
            array_new_data(vmctx: *mut VMContext, type_idx: i32, seg: i32, offset: i32, len: i32) -> i64;
            array_new_elem(vmctx: *mut VMContext, type_idx: i32, seg: i32, offset: i32, len: i32) -> i64;
            array_init_data(vmctx: *mut VMContext, type_idx: i32, seg: i32, array: i64, arr_offset: i32, seg_offset: i32, len: i32);
            array_init_elem(vmctx: *mut VMContext, type_idx: i32, seg: i32, array: i64, arr_offset: i32, seg_offset: i32, len: i32);
            ref_test(value: i64, type_idx: i32, nullable: i32) -> i32;
            ref_cast(value: i64, type_idx: i32, nullable: i32) -> i64;
            check_indirect_call_type(actual: i32, expected: i32);
            register_struct_inline(vmctx: *mut VMContext, obj: *mut u8, size: i32) -> i64;
            register_array_inline(vmctx: *mut VMContext, obj: *mut u8, size: i32) -> i64;
            alloc_struct_slow(vmctx: *mut VMContext, type_idx: i32, fields: *const i64, num_fields: i32) -> i64;
            alloc_array_slow(vmctx: *mut VMContext, type_idx: i32, len: i32, fill: i64) -> i64;
            gc_collect(vmctx: *mut VMContext, roots: *const i64, num_roots: i32) -> i32;

            // Exceptions.
            try_begin(vmctx: *mut VMContext, id: i32) -> *mut JmpBuf;
            try_end(vmctx: *mut VMContext, id: i32);
            throw(vmctx: *mut VMContext, tag: i32, values: *const i64, count: i32);
            throw_ref(vmctx: *mut VMContext, exnref: i64);
            delegate(vmctx: *mut VMContext, depth: i32);
            get_tag(vmctx: *mut VMContext) -> i32;
            get_value(vmctx: *mut VMContext, idx: i32) -> i64;
            get_value_count(vmctx: *mut VMContext) -> i32;
            spill_locals(vmctx: *mut VMContext, locals: *const i64, count: i32);
            get_spilled_local(vmctx: *mut VMContext, idx: i32) -> i64;

            // WASI.
            proc_exit(vmctx: *mut VMContext, code: i64) -> i64;
            sched_yield(vmctx: *mut VMContext) -> i64;
            args_sizes_get(vmctx: *mut VMContext, argc_ptr: i64, buf_size_ptr: i64) -> i64;
            args_get(vmctx: *mut VMContext, argv: i64, argv_buf: i64) -> i64;
            environ_sizes_get(vmctx: *mut VMContext, count_ptr: i64, buf_size_ptr: i64) -> i64;
            environ_get(vmctx: *mut VMContext, environ: i64, environ_buf: i64) -> i64;
        }
    };
}

/// Raw functions which are actually called from generated code.
///
/// Each delegates to the implementation of the same name in the parent
/// module and then converts its result with [`LibcallResult`], which is
/// where traps are raised and exception handlers are entered.
pub mod raw {
    use crate::exception::JmpBuf;
    use crate::vmcontext::VMContext;

    macro_rules! libcall {
        (
            $(
                $name:ident( $( $pname:ident: $param:ty ),* ) $(-> $result:ty)?;
            )*
        ) => {
            $(
                #[allow(unused_unsafe, reason = "some implementations are safe")]
                #[allow(clippy::too_many_arguments, reason = "mirrors the wasm operands")]
                pub unsafe extern "C" fn $name( $( $pname: $param ),* ) $(-> $result)? {
                    unsafe {
                        let result = super::$name($($pname),*);
                        super::LibcallResult::into_abi(result)
                    }
                }

                // This works around a `rustc` bug where compiling with LTO
                // will sometimes strip out some of these symbols resulting
                // in a linking failure.
                const _: () = {
                    #[used]
                    static I_AM_USED: unsafe extern "C" fn($($param),*) $(-> $result)? = $name;
                };
            )*
        };
    }

    crate::foreach_libcall!(libcall);
}

/// Converts an implementation's return value into the libcall's ABI return
/// value, raising traps and entering exception handlers along the way.
pub trait LibcallResult {
    /// The value generated code receives.
    type Abi;

    /// Performs the conversion.
    ///
    /// # Safety
    ///
    /// May jump out of the calling frame; see [`raise_trap`].
    unsafe fn into_abi(self) -> Self::Abi;
}

macro_rules! libcall_result_plain {
    ($($t:ty,)*) => {
        $(
            impl LibcallResult for $t {
                type Abi = $t;
                unsafe fn into_abi(self) -> $t {
                    self
                }
            }
        )*
    };
}

libcall_result_plain! {
    (),
    i32,
    i64,
    *mut JmpBuf,
}

/// What a trapping libcall returns when no trapping region is active and
/// `raise_trap` comes back.
pub trait TrapSentinel {
    /// The sentinel.
    const SENTINEL: Self;
}

impl TrapSentinel for () {
    const SENTINEL: () = ();
}

impl TrapSentinel for i32 {
    const SENTINEL: i32 = 0;
}

impl TrapSentinel for i64 {
    const SENTINEL: i64 = 0;
}

impl TrapSentinel for *mut JmpBuf {
    const SENTINEL: *mut JmpBuf = std::ptr::null_mut();
}

impl<T: TrapSentinel> LibcallResult for Result<T, TrapCode> {
    type Abi = T;

    unsafe fn into_abi(self) -> T {
        match self {
            Ok(value) => value,
            Err(code) => {
                unsafe { raise_trap(code) };
                T::SENTINEL
            }
        }
    }
}

/// Successful `throw`s and `delegate`s never return: they resume in the
/// handler's frame.
impl LibcallResult for Result<Landing, TrapCode> {
    type Abi = ();

    unsafe fn into_abi(self) {
        match self {
            Ok(landing) => unsafe { landing.resume() },
            Err(code) => unsafe { raise_trap(code) },
        }
    }
}

unsafe fn register_struct_inline(
    vmctx: *mut VMContext,
    obj: *mut u8,
    size: i32,
) -> Result<i64, TrapCode> {
    unsafe { ops::register_inline(vmctx, obj, size) }
}

unsafe fn register_array_inline(
    vmctx: *mut VMContext,
    obj: *mut u8,
    size: i32,
) -> Result<i64, TrapCode> {
    unsafe { ops::register_inline(vmctx, obj, size) }
}

macro_rules! declare_libcalls {
    (
        $(
            $name:ident( $( $pname:ident: $param:ty ),* ) $(-> $result:ty)?;
        )*
    ) => {
        /// An index of a runtime service callable from generated code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types, reason = "named after the libcall")]
        #[allow(missing_docs, reason = "macro-generated")]
        pub enum Libcall {
            $( $name, )*
        }

        impl Libcall {
            /// Every libcall, in catalog order.
            pub const ALL: &'static [Libcall] = &[ $( Libcall::$name, )* ];

            /// The symbol name of this libcall.
            pub fn name(self) -> &'static str {
                match self {
                    $( Libcall::$name => concat!("wasmjit_", stringify!($name)), )*
                }
            }

            /// The address generated code calls.
            pub fn address(self) -> usize {
                match self {
                    $( Libcall::$name => raw::$name as *const () as usize, )*
                }
            }
        }
    };
}

crate::foreach_libcall!(declare_libcalls);
