use gc_arena::Collect;

/// Hard limits enforced by the runtime.
///
/// A `Limits` value is fixed when a [`Lua`](crate::Lua) instance is created and copied into every
/// thread created afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Collect)]
#[collect(require_static)]
pub struct Limits {
    /// Maximum number of value slots in a single thread's stack.
    pub max_stack: usize,
    /// Extra slots beyond `max_stack` that may be used once, after a stack overflow, to run error
    /// handlers. Overflowing the headroom is an "error in error handling".
    pub error_headroom: usize,
    /// Free slots guaranteed to every native function above its arguments.
    pub min_stack: usize,
    /// Maximum nesting of coroutine resumes and protected calls ("C stack overflow").
    pub max_native_depth: usize,
    /// Maximum number of hops through `__index`, `__newindex` and `__call` chains.
    pub max_tag_loop: usize,
    /// Maximum number of frames on a single thread.
    pub max_frames: usize,
    /// If set, allocating past this many bytes raises a memory error at the next allocation point
    /// in the VM.
    pub memory_limit: Option<usize>,
}

impl Limits {
    pub const DEFAULT_MAX_STACK: usize = 1_000_000;
    pub const DEFAULT_ERROR_HEADROOM: usize = 200;
    pub const DEFAULT_MIN_STACK: usize = 20;
    pub const DEFAULT_MAX_NATIVE_DEPTH: usize = 200;
    pub const DEFAULT_MAX_TAG_LOOP: usize = 2000;
    pub const DEFAULT_MAX_FRAMES: usize = 200_000;

    pub fn with_memory_limit(self, memory_limit: usize) -> Self {
        Self {
            memory_limit: Some(memory_limit),
            ..self
        }
    }

    /// The absolute stack ceiling while an overflow is being handled.
    pub fn overflow_stack(&self) -> usize {
        self.max_stack + self.error_headroom
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_stack: Self::DEFAULT_MAX_STACK,
            error_headroom: Self::DEFAULT_ERROR_HEADROOM,
            min_stack: Self::DEFAULT_MIN_STACK,
            max_native_depth: Self::DEFAULT_MAX_NATIVE_DEPTH,
            max_tag_loop: Self::DEFAULT_MAX_TAG_LOOP,
            max_frames: Self::DEFAULT_MAX_FRAMES,
            memory_limit: None,
        }
    }
}
