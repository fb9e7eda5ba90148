//! The in-memory image list that `gdb` and `lldb` read to discover JIT
//! code.
//!
//! Debuggers break on `__jit_debug_register_code` and, when it is hit, read
//! `__jit_debug_descriptor` to find which image was added or removed. Both
//! symbol names and the layout of the two structs below are dictated by the
//! debuggers. Every mutation of the list happens under [`LIST_LOCK`].

use std::ptr;
use std::sync::{Mutex, PoisonError};

#[repr(C)]
struct CodeEntry {
    next: *mut CodeEntry,
    prev: *mut CodeEntry,
    image: *const u8,
    image_len: u64,
}

#[repr(u32)]
#[derive(Clone, Copy)]
enum Action {
    None = 0,
    Register = 1,
    Unregister = 2,
}

#[repr(C)]
struct Descriptor {
    version: u32,
    action: u32,
    relevant: *mut CodeEntry,
    first: *mut CodeEntry,
}

#[allow(non_upper_case_globals, reason = "name fixed by the debugger protocol")]
#[unsafe(no_mangle)]
#[used]
static mut __jit_debug_descriptor: Descriptor = Descriptor {
    version: 1,
    action: Action::None as u32,
    relevant: ptr::null_mut(),
    first: ptr::null_mut(),
};

/// The debugger's breakpoint target. It must not be inlined or folded away.
#[unsafe(no_mangle)]
#[inline(never)]
extern "C" fn __jit_debug_register_code() {
    let marker = 0u8;
    unsafe {
        let _ = ptr::read_volatile(&marker);
    }
}

static LIST_LOCK: Mutex<()> = Mutex::new(());

/// Publishes `entry` as the subject of `action` and stops in the debugger.
///
/// Callers hold [`LIST_LOCK`].
unsafe fn notify(descriptor: *mut Descriptor, entry: *mut CodeEntry, action: Action) {
    unsafe {
        (*descriptor).relevant = entry;
        (*descriptor).action = action as u32;
        __jit_debug_register_code();
        (*descriptor).action = Action::None as u32;
        (*descriptor).relevant = ptr::null_mut();
    }
}

/// Pushes a new entry for `image` at the head of the list.
fn link(image: &[u8]) -> *mut CodeEntry {
    let _guard = LIST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let descriptor = &raw mut __jit_debug_descriptor;
    unsafe {
        let head = (*descriptor).first;
        let entry = Box::into_raw(Box::new(CodeEntry {
            next: head,
            prev: ptr::null_mut(),
            image: image.as_ptr(),
            image_len: image.len() as u64,
        }));
        if let Some(head) = head.as_mut() {
            head.prev = entry;
        }
        (*descriptor).first = entry;
        notify(descriptor, entry, Action::Register);
        entry
    }
}

/// Removes `entry` from wherever it sits in the list and frees it.
///
/// `entry` must come from [`link`] and not have been unlinked yet.
unsafe fn unlink(entry: *mut CodeEntry) {
    let _guard = LIST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let descriptor = &raw mut __jit_debug_descriptor;
    unsafe {
        let CodeEntry { next, prev, .. } = *entry;
        match prev.as_mut() {
            Some(prev) => prev.next = next,
            None => (*descriptor).first = next,
        }
        if let Some(next) = next.as_mut() {
            next.prev = prev;
        }
        notify(descriptor, entry, Action::Unregister);
        drop(Box::from_raw(entry));
    }
}

/// An ELF image the debugger currently knows about.
///
/// The image bytes are owned here so the pointer handed to the debugger
/// stays valid; dropping the value takes the image off the list.
pub struct GdbJitImageRegistration {
    entry: *mut CodeEntry,
    file: Vec<u8>,
}

impl GdbJitImageRegistration {
    /// Adds `file` to the debugger's image list.
    pub fn register(file: Vec<u8>) -> Self {
        let entry = link(&file);
        Self { entry, file }
    }

    /// The bytes the debugger was given.
    pub fn file(&self) -> &[u8] {
        &self.file
    }
}

impl Drop for GdbJitImageRegistration {
    fn drop(&mut self) {
        unsafe { unlink(self.entry) }
    }
}

// `entry` is only dereferenced while `LIST_LOCK` is held.
unsafe impl Send for GdbJitImageRegistration {}
unsafe impl Sync for GdbJitImageRegistration {}

#[cfg(test)]
fn listed_images() -> Vec<(usize, u64)> {
    let _guard = LIST_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let mut images = Vec::new();
    unsafe {
        let mut entry = (*(&raw const __jit_debug_descriptor)).first;
        while let Some(e) = entry.as_ref() {
            images.push((e.image as usize, e.image_len));
            entry = e.next;
        }
    }
    images
}
