//! Runtime-wide knobs chosen by the embedder before contexts are created.

/// Default size of the independent wasm stack.
pub const DEFAULT_WASM_STACK_SIZE: usize = 1 << 20;

/// Default size of the alternate signal stack installed per thread.
pub const DEFAULT_SIGALTSTACK_SIZE: usize = 64 * 1024;

/// Global configuration for memories, stacks and GC heaps created by this
/// runtime.
///
/// This structure exposes a builder-like interface and is primarily consumed
/// by [`VMContext::alloc_memory`](crate::VMContext::alloc_memory),
/// [`VMContext::alloc_wasm_stack`](crate::VMContext::alloc_wasm_stack) and
/// [`GcHeap::with_config`](crate::GcHeap::with_config).
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub(crate) guard_pages: bool,
    pub(crate) wasm_stack_size: usize,
    pub(crate) gc_heap_capacity: usize,
    pub(crate) gc_object_capacity: usize,
    pub(crate) sigaltstack_size: usize,
}

impl RuntimeConfig {
    /// Creates a new configuration object with the default configuration
    /// specified.
    pub fn new() -> RuntimeConfig {
        RuntimeConfig {
            guard_pages: true,
            wasm_stack_size: DEFAULT_WASM_STACK_SIZE,
            gc_heap_capacity: crate::gc::DEFAULT_HEAP_CAPACITY,
            gc_object_capacity: crate::gc::DEFAULT_OBJECT_CAPACITY,
            sigaltstack_size: DEFAULT_SIGALTSTACK_SIZE,
        }
    }

    /// Configures whether 32-bit linear memories are backed by a large
    /// guarded reservation.
    ///
    /// When enabled (the default) generated code may omit bounds checks: an
    /// out-of-bounds access faults in the guard region and is reported as
    /// [`TrapCode::HeapOutOfBounds`](crate::TrapCode::HeapOutOfBounds). When
    /// disabled memories are plain heap allocations and every access must be
    /// checked explicitly.
    pub fn guard_pages(&mut self, enable: bool) -> &mut Self {
        self.guard_pages = enable;
        self
    }

    /// Configures the size, in bytes, of the independent stack generated code
    /// runs on when called through the stack-switching trampoline.
    pub fn wasm_stack_size(&mut self, size: usize) -> &mut Self {
        self.wasm_stack_size = size;
        self
    }

    /// Configures the initial byte capacity of GC heaps.
    pub fn gc_heap_capacity(&mut self, bytes: usize) -> &mut Self {
        self.gc_heap_capacity = bytes;
        self
    }

    /// Configures the initial number of object-table slots of GC heaps.
    pub fn gc_object_capacity(&mut self, objects: usize) -> &mut Self {
        self.gc_object_capacity = objects;
        self
    }

    /// Configures the size of the alternate signal stack each thread installs
    /// the first time it enters generated code.
    pub fn sigaltstack_size(&mut self, size: usize) -> &mut Self {
        self.sigaltstack_size = size;
        self
    }

    /// Applies the process-wide parts of this configuration.
    ///
    /// Only affects threads that have not yet entered generated code.
    pub fn apply(&self) {
        crate::traphandlers::set_sigaltstack_size(self.sigaltstack_size);
    }
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let mut config = RuntimeConfig::new();
        assert!(config.guard_pages);
        assert_eq!(config.wasm_stack_size, DEFAULT_WASM_STACK_SIZE);
        config
            .guard_pages(false)
            .wasm_stack_size(2 << 20)
            .gc_heap_capacity(4096)
            .gc_object_capacity(16);
        assert!(!config.guard_pages);
        assert_eq!(config.wasm_stack_size, 2 << 20);
        assert_eq!(config.gc_heap_capacity, 4096);
        assert_eq!(config.gc_object_capacity, 16);
    }
}
