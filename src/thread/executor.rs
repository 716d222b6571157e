use std::hash::{Hash, Hasher};

use allocator_api2::vec;
use gc_arena::{allocator_api::MetricsAlloc, lock::RefLock, Collect, Gc, Mutation};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    BoxSequence, CallbackReturn, Context, Error, FromMultiValue, Fuel, Function, IntoMultiValue,
    SequencePoll, Stack, Thread, ThreadMode, Variadic,
};

use super::{
    thread::{Frame, ThreadState},
    vm::run_vm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorMode {
    /// There are no threads being run and the `Executor` must be restarted to do any work.
    Stopped,
    /// The main thread has errored or returned (or yielded) values that must be taken to move the
    /// `Executor` to the `Stopped` (or `Suspended`) state.
    Result,
    /// There is an active thread in the `ThreadMode::Normal` state and it can be run with
    /// `Executor::step`.
    Normal,
    /// The bottom thread has yielded and is waiting on being resumed.
    Suspended,
    /// The `Executor` is currently inside its own `Executor::step` function.
    Running,
}

#[derive(Debug, Copy, Clone, Error)]
#[error("bad executor mode: {found:?}, expected {expected:?}")]
pub struct BadExecutorMode {
    pub found: ExecutorMode,
    pub expected: ExecutorMode,
}

pub type ExecutorInner<'gc> = RefLock<vec::Vec<Thread<'gc>, MetricsAlloc<'gc>>>;

/// The entry point for running scripts.
///
/// An `Executor` runs a stack of [`Thread`]s: the bottom one is the thread it was started with,
/// every thread above it was resumed by the thread below. All script code runs, directly or
/// indirectly, inside of `Executor::step`.
///
/// # Panics
///
/// `Executor` has no protection against re-entrancy. Calling its methods (other than
/// `Executor::mode`) from a callback it is running will panic. Callbacks should use
/// [`CallbackReturn`] to call scripts or resume threads on the same executor instead.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Executor<'gc>(Gc<'gc, ExecutorInner<'gc>>);

impl<'gc> PartialEq for Executor<'gc> {
    fn eq(&self, other: &Executor<'gc>) -> bool {
        Gc::ptr_eq(self.0, other.0)
    }
}

impl<'gc> Eq for Executor<'gc> {}

impl<'gc> Hash for Executor<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Gc::as_ptr(self.0).hash(state)
    }
}

impl<'gc> Executor<'gc> {
    const FUEL_PER_CALLBACK: i32 = 8;
    const FUEL_PER_SEQ_STEP: i32 = 4;
    const FUEL_PER_STEP: i32 = 4;
    const VM_GRANULARITY: u32 = 64;

    /// Creates a new `Executor` with a stopped main thread.
    pub fn new(ctx: Context<'gc>) -> Self {
        Self::run(&ctx, Thread::new_main(ctx))
    }

    /// Creates a new `Executor` that begins running the given thread.
    pub fn run(mc: &Mutation<'gc>, thread: Thread<'gc>) -> Self {
        let mut thread_stack = vec::Vec::new_in(MetricsAlloc::new(mc));
        thread_stack.push(thread);
        Executor(Gc::new(mc, RefLock::new(thread_stack)))
    }

    /// Creates a new `Executor` with a new main thread running the given function.
    pub fn start(
        ctx: Context<'gc>,
        function: Function<'gc>,
        args: impl IntoMultiValue<'gc>,
    ) -> Self {
        let thread = Thread::new_main(ctx);
        // A new thread is always stopped.
        let _ = thread.start(ctx, function, args);
        Self::run(&ctx, thread)
    }

    pub fn from_inner(inner: Gc<'gc, ExecutorInner<'gc>>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, ExecutorInner<'gc>> {
        self.0
    }

    pub fn as_ptr(self) -> *const () {
        Gc::as_ptr(self.0) as *const ()
    }

    pub fn mode(self) -> ExecutorMode {
        if let Ok(thread_stack) = self.0.try_borrow() {
            if thread_stack.len() > 1 {
                ExecutorMode::Normal
            } else {
                match thread_stack[0].mode() {
                    ThreadMode::Stopped => ExecutorMode::Stopped,
                    ThreadMode::Result => ExecutorMode::Result,
                    ThreadMode::Normal | ThreadMode::Waiting => ExecutorMode::Normal,
                    ThreadMode::Suspended => ExecutorMode::Suspended,
                    ThreadMode::Running => ExecutorMode::Running,
                }
            }
        } else {
            ExecutorMode::Running
        }
    }

    /// Runs the VM for a period of time controlled by the `fuel` parameter.
    ///
    /// The VM and callbacks consume fuel as they run, and `Executor::step` returns as soon as
    /// `Fuel::should_continue()` returns false *and some minimal positive progress has been made*.
    ///
    /// Returns `false` if the fuel ran out but there is more work to do, and `true` if no more
    /// progress can be made. Once `true` is returned, `Executor::mode()` is no longer
    /// `ExecutorMode::Normal`.
    pub fn step(self, ctx: Context<'gc>, fuel: &mut Fuel) -> bool {
        let mut thread_stack = self.0.borrow_mut(&ctx);

        loop {
            let mut top_thread = thread_stack[thread_stack.len() - 1];
            let mut res_thread = None;
            match top_thread.mode() {
                ThreadMode::Normal => {}
                ThreadMode::Running => {
                    panic!("`Executor` thread already running")
                }
                _ => {
                    if thread_stack.len() == 1 {
                        break true;
                    } else {
                        thread_stack.pop();
                        res_thread = Some(top_thread);
                        top_thread = thread_stack[thread_stack.len() - 1];
                    }
                }
            }

            let mut top_state = top_thread.state_mut(&ctx);
            let top_state = &mut *top_state;
            if let Some(res_thread) = res_thread {
                deliver_result(ctx, top_state, res_thread);
            }

            if top_state.mode() == ThreadMode::Normal {
                match top_state.frames.pop() {
                    Some(Frame::Callback { bottom, callback }) => {
                        fuel.consume(Self::FUEL_PER_CALLBACK);
                        let exec = Execution {
                            executor: self,
                            fuel,
                            thread: top_thread,
                            yieldable: top_state.is_yieldable(),
                            frames: &top_state.frames,
                        };
                        let res = callback
                            .call(ctx, exec, Stack::new(&mut top_state.stack, bottom))
                            .and_then(|ret| {
                                top_state
                                    .check_native_stack(ctx)
                                    .map_err(|fault| fault.into_error(ctx))?;
                                Ok(ret)
                            });
                        match res {
                            Ok(ret) => callback_ret(
                                ctx,
                                &mut thread_stack,
                                top_thread,
                                top_state,
                                bottom,
                                ret,
                            ),
                            Err(err) => {
                                top_state.stack.truncate(bottom);
                                top_state.raise_native(err);
                            }
                        }
                    }
                    Some(Frame::Sequence {
                        bottom,
                        mut sequence,
                        pending_error,
                    }) => {
                        fuel.consume(Self::FUEL_PER_SEQ_STEP);
                        let reraised = pending_error.is_some();
                        let exec = Execution {
                            executor: self,
                            fuel,
                            thread: top_thread,
                            yieldable: top_state.is_yieldable(),
                            frames: &top_state.frames,
                        };
                        let stack = Stack::new(&mut top_state.stack, bottom);
                        let fin = match pending_error {
                            Some(err) => sequence.error(ctx, exec, err, stack),
                            None => sequence.poll(ctx, exec, stack),
                        }
                        .and_then(|poll| {
                            top_state
                                .check_native_stack(ctx)
                                .map_err(|fault| fault.into_error(ctx))?;
                            Ok(poll)
                        });

                        match fin {
                            Ok(poll) => {
                                let ret = sequence_return(sequence, poll);
                                callback_ret(
                                    ctx,
                                    &mut thread_stack,
                                    top_thread,
                                    top_state,
                                    bottom,
                                    ret,
                                );
                            }
                            Err(err) => {
                                top_state.stack.truncate(bottom);
                                if reraised {
                                    top_state.frames.push(Frame::Error {
                                        error: err,
                                        unwinding: true,
                                    });
                                } else {
                                    top_state.raise_native(err);
                                }
                            }
                        }
                    }
                    Some(frame @ Frame::Lua(_)) => {
                        top_state.frames.push(frame);
                        match run_vm(ctx, top_thread, top_state, Self::VM_GRANULARITY) {
                            Err(err) => top_state.raise(err),
                            Ok(remaining) => {
                                fuel.consume((Self::VM_GRANULARITY - remaining) as i32);
                            }
                        }
                    }
                    Some(frame @ Frame::Error { .. }) => {
                        top_state.frames.push(frame);
                        top_state.step_error(ctx);
                    }
                    Some(frame @ Frame::Closing { .. }) => {
                        top_state.frames.push(frame);
                        top_state.step_closing(ctx);
                    }
                    _ => panic!("tried to step invalid frame type"),
                }
            }

            fuel.consume(Self::FUEL_PER_STEP);

            if !fuel.should_continue() {
                top_state.shrink_stack();
                break false;
            }
        }
    }

    pub fn take_result<T: FromMultiValue<'gc>>(
        self,
        ctx: Context<'gc>,
    ) -> Result<Result<T, Error<'gc>>, BadExecutorMode> {
        let bad_mode = |found| BadExecutorMode {
            found,
            expected: ExecutorMode::Result,
        };
        let mode = self.mode();
        if mode != ExecutorMode::Result {
            return Err(bad_mode(mode));
        }
        let thread_stack = self.0.borrow();
        thread_stack[0]
            .take_result(ctx)
            .map_err(|_| bad_mode(ExecutorMode::Running))
    }

    /// Resume a suspended executor, passing `args` to the yield of its bottom thread.
    pub fn resume(
        self,
        ctx: Context<'gc>,
        args: impl IntoMultiValue<'gc>,
    ) -> Result<(), BadExecutorMode> {
        self.check_suspended()?;
        let thread_stack = self.0.borrow();
        thread_stack[0]
            .resume(ctx, args)
            .map_err(|_| self.suspended_error())
    }

    /// Resume a suspended executor by raising `error` from the yield of its bottom thread.
    pub fn resume_err(self, ctx: Context<'gc>, error: Error<'gc>) -> Result<(), BadExecutorMode> {
        self.check_suspended()?;
        let thread_stack = self.0.borrow();
        thread_stack[0]
            .resume_err(ctx, error)
            .map_err(|_| self.suspended_error())
    }

    /// Reset this `Executor` entirely, leaving it with its bottom thread stopped.
    pub fn reset(self, mc: &Mutation<'gc>) -> Result<(), BadExecutorMode> {
        let mut thread_stack = self.0.try_borrow_mut(mc).map_err(|_| BadExecutorMode {
            found: ExecutorMode::Running,
            expected: ExecutorMode::Stopped,
        })?;
        thread_stack.truncate(1);
        thread_stack[0].reset(mc).map_err(|_| BadExecutorMode {
            found: ExecutorMode::Running,
            expected: ExecutorMode::Stopped,
        })
    }

    /// Reset this `Executor` and begin running the given function on its bottom thread.
    pub fn restart(
        self,
        ctx: Context<'gc>,
        function: Function<'gc>,
        args: impl IntoMultiValue<'gc>,
    ) -> Result<(), BadExecutorMode> {
        self.reset(&ctx)?;
        let thread_stack = self.0.borrow();
        thread_stack[0]
            .start(ctx, function, args)
            .map_err(|_| BadExecutorMode {
                found: ExecutorMode::Running,
                expected: ExecutorMode::Stopped,
            })
    }

    fn check_suspended(self) -> Result<(), BadExecutorMode> {
        match self.mode() {
            ExecutorMode::Suspended => Ok(()),
            found => Err(BadExecutorMode {
                found,
                expected: ExecutorMode::Suspended,
            }),
        }
    }

    fn suspended_error(self) -> BadExecutorMode {
        BadExecutorMode {
            found: self.mode(),
            expected: ExecutorMode::Suspended,
        }
    }
}

/// Hand the results of a thread that finished, yielded or died to the thread which resumed it.
fn deliver_result<'gc>(ctx: Context<'gc>, top_state: &mut ThreadState<'gc>, res_thread: Thread<'gc>) {
    let mode = top_state.mode();
    if mode != ThreadMode::Waiting {
        // The waiting thread was changed from outside of the executor.
        top_state.raise(Error::from(super::BadThreadMode {
            found: mode,
            expected: Some(ThreadMode::Waiting),
        }));
        return;
    }

    assert!(matches!(top_state.frames.pop(), Some(Frame::WaitThread)));
    match res_thread.try_state_mut(&ctx) {
        Some(mut res_state) if res_state.mode() == ThreadMode::Result => {
            match res_state.take_result() {
                Ok(vals) => {
                    let bottom = top_state.stack.len();
                    top_state.stack.extend(vals);
                    top_state.return_to(bottom);
                }
                // Message handlers already ran on the thread that raised the error.
                Err(err) => top_state.frames.push(Frame::Error {
                    error: err,
                    unwinding: true,
                }),
            }
        }
        res_state => {
            let found = res_state.map_or(ThreadMode::Running, |s| s.mode());
            top_state.raise(Error::from(super::BadThreadMode {
                found,
                expected: Some(ThreadMode::Result),
            }));
        }
    }
}

fn sequence_return<'gc>(sequence: BoxSequence<'gc>, poll: SequencePoll<'gc>) -> CallbackReturn<'gc> {
    let then = |sequence, is_tail: bool| if is_tail { None } else { Some(sequence) };
    match poll {
        SequencePoll::Pending => CallbackReturn::Sequence(sequence),
        SequencePoll::Return => CallbackReturn::Return,
        SequencePoll::Yield { is_tail } => CallbackReturn::Yield {
            then: then(sequence, is_tail),
        },
        SequencePoll::Call { function, is_tail } => CallbackReturn::Call {
            function,
            then: then(sequence, is_tail),
        },
        SequencePoll::Resume { thread, is_tail } => CallbackReturn::Resume {
            thread,
            then: then(sequence, is_tail),
        },
    }
}

fn callback_ret<'gc>(
    ctx: Context<'gc>,
    thread_stack: &mut vec::Vec<Thread<'gc>, MetricsAlloc<'gc>>,
    top_thread: Thread<'gc>,
    top_state: &mut ThreadState<'gc>,
    bottom: usize,
    ret: CallbackReturn<'gc>,
) {
    fn push_then<'gc>(state: &mut ThreadState<'gc>, bottom: usize, then: Option<BoxSequence<'gc>>) {
        if let Some(sequence) = then {
            state.frames.push(Frame::Sequence {
                bottom,
                sequence,
                pending_error: None,
            });
        }
    }

    fn fail<'gc>(ctx: Context<'gc>, state: &mut ThreadState<'gc>, bottom: usize, message: &str) {
        state.stack.truncate(bottom);
        state.raise_native(Error::message(ctx, message));
    }

    let native_depth = thread_stack.len() + top_state.protected_depth;
    let max_native_depth = top_state.limits.max_native_depth;

    match ret {
        CallbackReturn::Return => {
            top_state.return_to(bottom);
        }
        CallbackReturn::Sequence(sequence) => {
            push_then(top_state, bottom, Some(sequence));
        }
        CallbackReturn::Yield { then } => {
            if top_thread.is_main() {
                fail(ctx, top_state, bottom, "attempt to yield from outside a coroutine");
            } else if !top_state.is_yieldable() {
                fail(ctx, top_state, bottom, "attempt to yield across a C-call boundary");
            } else {
                trace!(values = top_state.stack.len() - bottom, "thread yielded");
                push_then(top_state, bottom, then);
                top_state.frames.push(Frame::Yielded);
                top_state.frames.push(Frame::Result { bottom });
            }
        }
        CallbackReturn::Call { function, then } => {
            push_then(top_state, bottom, then);
            if let Err(fault) = top_state.push_call(ctx, bottom, function) {
                top_state.raise(fault.into_error(ctx));
            }
        }
        CallbackReturn::Protected { function, handler } => {
            if native_depth >= max_native_depth {
                fail(ctx, top_state, bottom, "C stack overflow");
                return;
            }
            top_state.frames.push(Frame::Protected { bottom, handler });
            top_state.protected_depth += 1;
            if let Err(fault) = top_state.push_call(ctx, bottom, function) {
                top_state.raise(fault.into_error(ctx));
            }
        }
        CallbackReturn::Resume { thread, then } => {
            // A failed resume is delivered to `then` like an error raised by the thread.
            push_then(top_state, bottom, then);

            if native_depth >= max_native_depth {
                fail(ctx, top_state, bottom, "C stack overflow");
                return;
            }

            let args = Variadic(top_state.stack.drain(bottom..).collect::<Vec<_>>());
            if let Err(err) = thread.resume(ctx, args) {
                debug!(found = ?err.found, "bad coroutine resume");
                let message = match err.found {
                    ThreadMode::Stopped | ThreadMode::Result => "cannot resume dead coroutine",
                    _ => "cannot resume non-suspended coroutine",
                };
                fail(ctx, top_state, bottom, message);
                return;
            }

            debug!("resuming coroutine");
            top_state.frames.push(Frame::WaitThread);
            thread_stack.push(thread);
        }
        CallbackReturn::Terminate => {
            top_state.stack.truncate(bottom);
            top_state.terminate(&ctx);
        }
    }
}

/// Execution state passed to callbacks when they are run by an `Executor`.
pub struct Execution<'gc, 'a> {
    executor: Executor<'gc>,
    fuel: &'a mut Fuel,
    thread: Thread<'gc>,
    yieldable: bool,
    frames: &'a [Frame<'gc>],
}

impl<'gc, 'a> Execution<'gc, 'a> {
    /// The fuel parameter passed to `Executor::step`.
    pub fn fuel(&mut self) -> &mut Fuel {
        self.fuel
    }

    /// The currently executing thread.
    pub fn current_thread(&self) -> CurrentThread<'gc> {
        CurrentThread {
            thread: self.thread,
            is_main: self.thread.is_main(),
        }
    }

    /// The currently running executor.
    ///
    /// Do not call methods on this from callbacks! It is provided only so that callbacks can
    /// identify the executor running them.
    pub fn executor(&self) -> Executor<'gc> {
        self.executor
    }

    /// Whether the running native function may yield.
    pub fn is_yieldable(&self) -> bool {
        !self.thread.is_main() && self.yieldable
    }

    /// The frames of the current thread below the running native function.
    pub(crate) fn frames(&self) -> &[Frame<'gc>] {
        self.frames
    }
}

#[derive(Debug, Copy, Clone)]
pub struct CurrentThread<'gc> {
    pub thread: Thread<'gc>,
    pub is_main: bool,
}
