use std::{
    fmt,
    hash::{Hash, Hasher},
};

use allocator_api2::boxed;
use gc_arena::{allocator_api::MetricsAlloc, Collect, Collection, Gc, Mutation};

use crate::{Context, Error, Execution, Function, Stack, Thread};

/// What a native function asks the executor to do once it has returned.
#[derive(Collect)]
#[collect(no_drop)]
pub enum CallbackReturn<'gc> {
    /// Return the values on the stack to the caller.
    Return,
    /// Run the given sequence in place of this callback.
    Sequence(BoxSequence<'gc>),
    /// Yield the values on the stack to the resumer, optionally continuing with `then` once
    /// resumed.
    Yield { then: Option<BoxSequence<'gc>> },
    /// Call `function` with the values on the stack as arguments.
    ///
    /// If `then` is given, the sequence is polled with the results of the call, otherwise the
    /// results are returned directly to the caller.
    Call {
        function: Function<'gc>,
        then: Option<BoxSequence<'gc>>,
    },
    /// Call `function` inside of an error barrier.
    ///
    /// On success the caller receives `true` followed by the results of `function`, on error it
    /// receives `false` and the error value. If `handler` is given it is called with the error
    /// value before any frame is unwound, and its first result replaces the error value.
    Protected {
        function: Function<'gc>,
        handler: Option<Function<'gc>>,
    },
    /// Resume `thread` with the values on the stack, and wait for it to yield or return.
    Resume {
        thread: Thread<'gc>,
        then: Option<BoxSequence<'gc>>,
    },
    /// Close every pending to-be-closed variable of the running thread and finish it as though
    /// its main function returned nothing.
    Terminate,
}

/// A native function.
pub trait CallbackFn<'gc>: Collect {
    fn call(
        &self,
        ctx: Context<'gc>,
        exec: Execution<'gc, '_>,
        stack: Stack<'gc, '_>,
    ) -> Result<CallbackReturn<'gc>, Error<'gc>>;
}

/// The header of every callback allocation, followed in memory by the callback itself.
pub struct CallbackInner<'gc> {
    call: unsafe fn(
        *const CallbackInner<'gc>,
        Context<'gc>,
        Execution<'gc, '_>,
        Stack<'gc, '_>,
    ) -> Result<CallbackReturn<'gc>, Error<'gc>>,
}

// SAFETY: The header holds no `Gc` pointers. The callback following it is traced through the
// allocation it was created with.
unsafe impl<'gc> Collect for CallbackInner<'gc> {
    fn needs_trace() -> bool
    where
        Self: Sized,
    {
        false
    }

    fn trace(&self, _cc: &Collection) {}
}

/// A garbage collected native function, callable from scripts.
///
/// Stored as a single pointer to a header holding the call function followed by the callback
/// value, so a `Callback` is the same size as any other `Gc` pointer.
#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Callback<'gc>(Gc<'gc, CallbackInner<'gc>>);

impl<'gc> Callback<'gc> {
    pub fn new<C: CallbackFn<'gc> + 'gc>(mc: &Mutation<'gc>, callback: C) -> Self {
        #[repr(C)]
        struct HeaderCallback<'gc, C> {
            header: CallbackInner<'gc>,
            callback: C,
        }

        // SAFETY: The header has no `Gc` pointers to trace.
        unsafe impl<'gc, C: Collect> Collect for HeaderCallback<'gc, C> {
            fn needs_trace() -> bool
            where
                Self: Sized,
            {
                C::needs_trace()
            }

            fn trace(&self, cc: &Collection) {
                self.callback.trace(cc)
            }
        }

        let hc = Gc::new(
            mc,
            HeaderCallback {
                header: CallbackInner {
                    call: |ptr, ctx, exec, stack| unsafe {
                        let hc = ptr as *const HeaderCallback<C>;
                        ((*hc).callback).call(ctx, exec, stack)
                    },
                },
                callback,
            },
        );

        // SAFETY: `HeaderCallback` is `#[repr(C)]` with the header as its first field.
        Self(unsafe { Gc::cast::<CallbackInner>(hc) })
    }

    /// Create a callback from a plain function which holds no GC values.
    pub fn from_fn<F>(mc: &Mutation<'gc>, call: F) -> Callback<'gc>
    where
        F: 'static
            + Fn(Context<'gc>, Execution<'gc, '_>, Stack<'gc, '_>) -> Result<CallbackReturn<'gc>, Error<'gc>>,
    {
        Self::from_fn_with(mc, (), move |_, ctx, exec, stack| call(ctx, exec, stack))
    }

    /// Create a native closure which owns the values in `root`.
    ///
    /// `root` is traced as long as the callback is alive, so it is the place to keep any GC values
    /// the function body needs.
    pub fn from_fn_with<R, F>(mc: &Mutation<'gc>, root: R, call: F) -> Callback<'gc>
    where
        R: 'gc + Collect,
        F: 'static
            + Fn(
                &R,
                Context<'gc>,
                Execution<'gc, '_>,
                Stack<'gc, '_>,
            ) -> Result<CallbackReturn<'gc>, Error<'gc>>,
    {
        #[derive(Collect)]
        #[collect(no_drop)]
        struct RootCallback<R, F> {
            root: R,
            #[collect(require_static)]
            call: F,
        }

        impl<'gc, R, F> CallbackFn<'gc> for RootCallback<R, F>
        where
            R: 'gc + Collect,
            F: 'static
                + Fn(
                    &R,
                    Context<'gc>,
                    Execution<'gc, '_>,
                    Stack<'gc, '_>,
                ) -> Result<CallbackReturn<'gc>, Error<'gc>>,
        {
            fn call(
                &self,
                ctx: Context<'gc>,
                exec: Execution<'gc, '_>,
                stack: Stack<'gc, '_>,
            ) -> Result<CallbackReturn<'gc>, Error<'gc>> {
                (self.call)(&self.root, ctx, exec, stack)
            }
        }

        Callback::new(mc, RootCallback { root, call })
    }

    pub fn from_inner(inner: Gc<'gc, CallbackInner<'gc>>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, CallbackInner<'gc>> {
        self.0
    }

    pub fn as_ptr(self) -> *const () {
        Gc::as_ptr(self.0) as *const ()
    }

    pub fn call(
        self,
        ctx: Context<'gc>,
        exec: Execution<'gc, '_>,
        stack: Stack<'gc, '_>,
    ) -> Result<CallbackReturn<'gc>, Error<'gc>> {
        unsafe { (self.0.call)(Gc::as_ptr(self.0), ctx, exec, stack) }
    }
}

impl<'gc> fmt::Debug for Callback<'gc> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("Callback").field(&self.as_ptr()).finish()
    }
}

impl<'gc> PartialEq for Callback<'gc> {
    fn eq(&self, other: &Callback<'gc>) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<'gc> Eq for Callback<'gc> {}

impl<'gc> Hash for Callback<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_ptr().hash(state)
    }
}

/// What a [`Sequence`] asks the executor to do after being polled.
pub enum SequencePoll<'gc> {
    /// The sequence is not finished, poll it again with an empty stack.
    Pending,
    /// The sequence is finished, return the values on the stack to the caller.
    Return,
    /// Call `function` with the values on the stack. If `is_tail` is false, the sequence is
    /// polled again with the results.
    Call {
        function: Function<'gc>,
        is_tail: bool,
    },
    /// Yield the values on the stack. If `is_tail` is false, the sequence is polled again with
    /// the resume arguments.
    Yield { is_tail: bool },
    /// Resume `thread` with the values on the stack. If `is_tail` is false, the sequence is
    /// polled again with the values the thread yields or returns.
    Resume { thread: Thread<'gc>, is_tail: bool },
}

/// A native continuation: a state machine driven by the executor.
///
/// Sequences let native functions call back into scripts, yield and resume threads without
/// holding a Rust stack frame across the call, which is what makes such calls suspendable.
pub trait Sequence<'gc>: Collect {
    fn poll(
        &mut self,
        ctx: Context<'gc>,
        exec: Execution<'gc, '_>,
        stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>>;

    /// Called in place of `poll` when the last call made by this sequence raised an error.
    ///
    /// The default re-raises the error, which continues unwinding below this sequence.
    fn error(
        &mut self,
        _ctx: Context<'gc>,
        _exec: Execution<'gc, '_>,
        error: Error<'gc>,
        _stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>> {
        Err(error)
    }

    /// Whether a yield is allowed while this sequence is waiting on a call.
    ///
    /// A sequence which is not yieldable marks a native boundary that cannot be suspended: any
    /// yield above it raises an error instead.
    fn yieldable(&self) -> bool {
        true
    }
}

#[derive(Collect)]
#[collect(no_drop)]
pub struct BoxSequence<'gc>(boxed::Box<dyn Sequence<'gc> + 'gc, MetricsAlloc<'gc>>);

impl<'gc> fmt::Debug for BoxSequence<'gc> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("Sequence")
            .field(&(&*self.0 as *const dyn Sequence))
            .finish()
    }
}

impl<'gc> BoxSequence<'gc> {
    pub fn new(mc: &Mutation<'gc>, sequence: impl Sequence<'gc> + 'gc) -> Self {
        let b = boxed::Box::new_in(sequence, MetricsAlloc::new(mc));
        let (ptr, alloc) = boxed::Box::into_raw_with_allocator(b);
        // SAFETY: We are converting the box to a trait object and back with the same allocator.
        let b = unsafe { boxed::Box::from_raw_in(ptr as *mut dyn Sequence<'gc>, alloc) };
        Self(b)
    }

    pub fn poll(
        &mut self,
        ctx: Context<'gc>,
        exec: Execution<'gc, '_>,
        stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>> {
        self.0.poll(ctx, exec, stack)
    }

    pub fn error(
        &mut self,
        ctx: Context<'gc>,
        exec: Execution<'gc, '_>,
        error: Error<'gc>,
        stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>> {
        self.0.error(ctx, exec, error, stack)
    }

    pub fn yieldable(&self) -> bool {
        self.0.yieldable()
    }
}
