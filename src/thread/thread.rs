use std::{
    cell::{Cell, RefCell, RefMut},
    fmt,
    hash::{Hash, Hasher},
};

use allocator_api2::vec;
use gc_arena::{
    allocator_api::MetricsAlloc,
    barrier,
    lock::{Lock, RefLock},
    Collect, Gc, Mutation,
};
use tracing::{debug, trace};

use crate::{
    closure::{OpenUpValue, UpValue, UpValueState},
    config::Limits,
    meta_ops::{self, MetaMethod, MetaOperatorError},
    types::{RegisterIndex, VarCount},
    BoxSequence, Callback, Context, Error, FromMultiValue, Function, IntoMultiValue, Value,
};

use super::{
    debug::{self, Hook},
    BadThreadMode, VMError,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadMode {
    /// No frames are on the thread and there are no available results, the thread can be started.
    Stopped,
    /// The thread has returned or yielded values (or an error) which must be taken.
    Result,
    /// The thread has frames which can be stepped by an executor.
    Normal,
    /// The thread has yielded, or was started suspended, and is waiting to be resumed.
    Suspended,
    /// The thread has resumed another thread and is waiting for it to yield or return.
    Waiting,
    /// The thread is currently borrowed by an executor step.
    Running,
}

impl ThreadMode {
    /// The name reported for a thread in this mode by `coroutine.status`.
    pub fn status_name(self) -> &'static str {
        match self {
            ThreadMode::Running => "running",
            ThreadMode::Normal | ThreadMode::Waiting => "normal",
            ThreadMode::Suspended => "suspended",
            ThreadMode::Stopped | ThreadMode::Result => "dead",
        }
    }
}

#[derive(Collect)]
#[collect(no_drop)]
pub struct ThreadInner<'gc> {
    state: RefLock<ThreadState<'gc>>,
    // Kept outside of `state` so the hook of a running thread can be changed from a callback.
    hook: Lock<Option<Hook<'gc>>>,
    #[collect(require_static)]
    hook_counter: Cell<u32>,
    #[collect(require_static)]
    is_main: bool,
}

/// A coroutine: a stack of values and a stack of frames which an [`Executor`] can step.
///
/// [`Executor`]: crate::Executor
#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Thread<'gc>(Gc<'gc, ThreadInner<'gc>>);

impl<'gc> fmt::Debug for Thread<'gc> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("Thread")
            .field(&Gc::as_ptr(self.0))
            .finish()
    }
}

impl<'gc> PartialEq for Thread<'gc> {
    fn eq(&self, other: &Thread<'gc>) -> bool {
        Gc::ptr_eq(self.0, other.0)
    }
}

impl<'gc> Eq for Thread<'gc> {}

impl<'gc> Hash for Thread<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Gc::as_ptr(self.0).hash(state)
    }
}

impl<'gc> Thread<'gc> {
    /// A new, stopped coroutine.
    pub fn new(ctx: Context<'gc>) -> Thread<'gc> {
        Self::with_kind(ctx, false)
    }

    /// A new, stopped main thread. Main threads cannot yield and cannot be closed.
    pub fn new_main(ctx: Context<'gc>) -> Thread<'gc> {
        Self::with_kind(ctx, true)
    }

    fn with_kind(ctx: Context<'gc>, is_main: bool) -> Thread<'gc> {
        let alloc = MetricsAlloc::new(&ctx);
        Thread(Gc::new(
            &ctx,
            ThreadInner {
                state: RefLock::new(ThreadState {
                    stack: vec::Vec::new_in(alloc.clone()),
                    frames: vec::Vec::new_in(alloc.clone()),
                    open_upvalues: vec::Vec::new_in(alloc.clone()),
                    tbc: vec::Vec::new_in(alloc),
                    hook_depth: 0,
                    protected_depth: 0,
                    overflowed: false,
                    limits: *ctx.limits(),
                    last_error: None,
                }),
                hook: Lock::new(None),
                hook_counter: Cell::new(0),
                is_main,
            },
        ))
    }

    pub fn from_inner(inner: Gc<'gc, ThreadInner<'gc>>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, ThreadInner<'gc>> {
        self.0
    }

    pub fn is_main(self) -> bool {
        self.0.is_main
    }

    pub fn mode(self) -> ThreadMode {
        match self.try_state() {
            Some(state) => state.mode(),
            None => ThreadMode::Running,
        }
    }

    /// `running`, `normal`, `suspended` or `dead`.
    pub fn status(self) -> &'static str {
        self.mode().status_name()
    }

    pub fn hook(self) -> Option<Hook<'gc>> {
        self.0.hook.get()
    }

    /// Install or remove the debug hook of this thread. Resets the instruction counter.
    pub fn set_hook(self, mc: &Mutation<'gc>, hook: Option<Hook<'gc>>) {
        barrier::field!(Gc::write(mc, self.0), ThreadInner, hook)
            .unlock()
            .set(hook);
        self.0.hook_counter.set(0);
    }

    /// Count one instruction towards the count hook, returns true if it should fire.
    pub(crate) fn tick_hook_counter(self, count: u32) -> bool {
        if count == 0 {
            return false;
        }
        let c = self.0.hook_counter.get() + 1;
        if c >= count {
            self.0.hook_counter.set(0);
            true
        } else {
            self.0.hook_counter.set(c);
            false
        }
    }

    /// The error that killed this thread, if it died with one. Survives taking the result.
    pub fn last_error(self) -> Option<Error<'gc>> {
        self.try_state()
            .and_then(|state| state.last_error.clone())
    }

    /// Start a stopped thread running `function`, leaving it in `Normal` mode.
    pub fn start(
        self,
        ctx: Context<'gc>,
        function: Function<'gc>,
        args: impl IntoMultiValue<'gc>,
    ) -> Result<(), BadThreadMode> {
        let mut state = self.check_mode(&ctx, ThreadMode::Stopped)?;
        state.last_error = None;
        let bottom = state.stack.len();
        state.stack.extend(args.into_multi_value(ctx));
        if let Err(fault) = state.push_call(ctx, bottom, function) {
            state.raise(fault.into_error(ctx));
        }
        Ok(())
    }

    /// Start a stopped thread in the `Suspended` mode, `function` is called on the first resume.
    pub fn start_suspended(
        self,
        mc: &Mutation<'gc>,
        function: Function<'gc>,
    ) -> Result<(), BadThreadMode> {
        let mut state = self.check_mode(mc, ThreadMode::Stopped)?;
        state.last_error = None;
        state.frames.push(Frame::Start(function));
        Ok(())
    }

    /// Resume a suspended thread with the given arguments, moving it to `Normal` mode.
    pub fn resume(
        self,
        ctx: Context<'gc>,
        args: impl IntoMultiValue<'gc>,
    ) -> Result<(), BadThreadMode> {
        let mut state = self.check_mode(&ctx, ThreadMode::Suspended)?;
        let bottom = state.stack.len();
        state.stack.extend(args.into_multi_value(ctx));

        match state.frames.pop() {
            Some(Frame::Start(function)) => {
                assert!(bottom == 0 && state.open_upvalues.is_empty() && state.frames.is_empty());
                if let Err(fault) = state.push_call(ctx, bottom, function) {
                    state.raise(fault.into_error(ctx));
                }
            }
            Some(Frame::Yielded) => state.return_to(bottom),
            _ => panic!("top frame of a suspended thread is not resumable"),
        }
        Ok(())
    }

    /// Resume a suspended thread by raising `error` at the point where it yielded.
    pub fn resume_err(self, ctx: Context<'gc>, error: Error<'gc>) -> Result<(), BadThreadMode> {
        let mut state = self.check_mode(&ctx, ThreadMode::Suspended)?;
        match state.frames.pop() {
            Some(Frame::Yielded) => state.raise(error),
            Some(frame @ Frame::Start(_)) => {
                state.frames.push(frame);
                return Err(BadThreadMode {
                    found: ThreadMode::Suspended,
                    expected: None,
                });
            }
            _ => panic!("top frame of a suspended thread is not resumable"),
        }
        Ok(())
    }

    /// Take the values returned or yielded by this thread, or the error it died with.
    pub fn take_result<T: FromMultiValue<'gc>>(
        self,
        ctx: Context<'gc>,
    ) -> Result<Result<T, Error<'gc>>, BadThreadMode> {
        let mut state = self.check_mode(&ctx, ThreadMode::Result)?;
        Ok(state
            .take_result()
            .and_then(|vals| Ok(T::from_multi_value(ctx, vals)?)))
    }

    /// Clear every frame and value, leaving the thread `Stopped`. Pending to-be-closed variables
    /// are dropped without being closed.
    pub fn reset(self, mc: &Mutation<'gc>) -> Result<(), BadThreadMode> {
        let mut state = self.try_state_mut(mc).ok_or(BadThreadMode {
            found: ThreadMode::Running,
            expected: None,
        })?;
        state.reset(mc);
        Ok(())
    }

    /// Unwind a suspended thread so that the next resume runs every pending `__close` metamethod
    /// and then finishes the thread.
    pub(crate) fn prepare_close(self, mc: &Mutation<'gc>) -> Result<(), BadThreadMode> {
        let mut state = self.check_mode(mc, ThreadMode::Suspended)?;
        state.frames.clear();
        state.close_upvalues(mc, 0);
        state.frames.push(Frame::Closing {
            bottom: 0,
            error: None,
        });
        state.frames.push(Frame::Yielded);
        debug!("closing suspended thread");
        Ok(())
    }

    fn state_cell(self, mc: &Mutation<'gc>) -> &'gc RefCell<ThreadState<'gc>> {
        barrier::field!(Gc::write(mc, self.0), ThreadInner, state).unlock()
    }

    /// Mutably borrow the thread state.
    ///
    /// # Panics
    ///
    /// If the thread is running.
    pub(crate) fn state_mut(self, mc: &Mutation<'gc>) -> RefMut<'gc, ThreadState<'gc>> {
        self.state_cell(mc).borrow_mut()
    }

    pub(crate) fn try_state_mut(self, mc: &Mutation<'gc>) -> Option<RefMut<'gc, ThreadState<'gc>>> {
        self.state_cell(mc).try_borrow_mut().ok()
    }

    /// Read the state of a thread which is not running.
    pub(crate) fn try_state(self) -> Option<std::cell::Ref<'gc, ThreadState<'gc>>> {
        Gc::as_ref(self.0).state.try_borrow().ok()
    }

    fn check_mode(
        self,
        mc: &Mutation<'gc>,
        expected: ThreadMode,
    ) -> Result<RefMut<'gc, ThreadState<'gc>>, BadThreadMode> {
        assert!(expected != ThreadMode::Running);
        let state = self.try_state_mut(mc).ok_or(BadThreadMode {
            found: ThreadMode::Running,
            expected: Some(expected),
        })?;

        let found = state.mode();
        if found != expected {
            Err(BadThreadMode {
                found,
                expected: Some(expected),
            })
        } else {
            Ok(state)
        }
    }
}

/// A failure inside of the call machinery.
///
/// Dispatch-loop errors stay structured so the VM can add the `chunk:line:` position and a
/// variable name before they become script errors.
pub(crate) enum Fault<'gc> {
    VM(VMError),
    Error(Error<'gc>),
}

impl<'gc> Fault<'gc> {
    pub(crate) fn into_error(self, ctx: Context<'gc>) -> Error<'gc> {
        match self {
            Fault::VM(err) => Error::message(ctx, err.to_string()),
            Fault::Error(err) => err,
        }
    }
}

impl<'gc> From<VMError> for Fault<'gc> {
    fn from(err: VMError) -> Self {
        Fault::VM(err)
    }
}

impl<'gc> From<MetaOperatorError> for Fault<'gc> {
    fn from(err: MetaOperatorError) -> Self {
        Fault::VM(err.into())
    }
}

impl<'gc> From<Error<'gc>> for Fault<'gc> {
    fn from(err: Error<'gc>) -> Self {
        Fault::Error(err)
    }
}

#[derive(Collect)]
#[collect(no_drop)]
pub(crate) struct ThreadState<'gc> {
    pub(crate) stack: vec::Vec<Value<'gc>, MetricsAlloc<'gc>>,
    pub(crate) frames: vec::Vec<Frame<'gc>, MetricsAlloc<'gc>>,
    /// Sorted by stack index.
    pub(crate) open_upvalues: vec::Vec<UpValue<'gc>, MetricsAlloc<'gc>>,
    /// Stack indices of pending to-be-closed variables, in increasing order.
    pub(crate) tbc: vec::Vec<usize, MetricsAlloc<'gc>>,
    pub(crate) hook_depth: usize,
    pub(crate) protected_depth: usize,
    /// Set by the first stack overflow, the error headroom is in use until the stack shrinks back.
    pub(crate) overflowed: bool,
    pub(crate) limits: Limits,
    pub(crate) last_error: Option<Error<'gc>>,
}

#[derive(Debug, Copy, Clone, Collect)]
#[collect(require_static)]
pub(crate) enum LuaReturn {
    /// Place the results at the bottom of the returning frame, as normal.
    Normal(VarCount),
    /// Synthetic metamethod call, do the operation specified in `MetaReturn`.
    Meta(MetaReturn),
}

#[derive(Debug, Copy, Clone, Collect)]
#[collect(require_static)]
pub(crate) enum MetaReturn {
    /// Discard every result.
    None,
    /// Place the first result in a register of the calling frame.
    Register(RegisterIndex),
    /// Skip the next instruction if the truthiness of the first result is equal to this.
    SkipIf(bool),
}

/// The state of a running script function.
#[derive(Debug, Clone, Collect)]
#[collect(require_static)]
pub(crate) struct LuaFrame {
    pub(crate) bottom: usize,
    pub(crate) base: usize,
    /// Set when the last call returned a variable number of results, which then sit above the
    /// frame's registers at the top of the stack.
    pub(crate) is_variable: bool,
    pub(crate) pc: usize,
    pub(crate) stack_size: usize,
    pub(crate) expected_return: Option<LuaReturn>,
    pub(crate) is_tail: bool,
    /// The hooks for this pc already ran, skip them when the instruction is re-entered.
    pub(crate) hooked_pc: Option<usize>,
    pub(crate) return_hooked: bool,
    pub(crate) entered: bool,
    pub(crate) hook_last_pc: Option<usize>,
    /// Operands of a `Concat` still to be joined after a `__concat` call.
    pub(crate) pending_concat: Option<u8>,
}

impl LuaFrame {
    /// The index of the instruction being executed.
    pub(crate) fn current_pc(&self) -> usize {
        debug::current_pc(self.pc, self.hooked_pc)
    }

    /// Arrange for the current instruction to run again once the pending call returns.
    pub(crate) fn reenter(&mut self) {
        self.pc -= 1;
        self.hooked_pc = Some(self.pc);
    }
}

#[derive(Debug, Collect)]
#[collect(no_drop)]
pub(crate) enum Frame<'gc> {
    Lua(LuaFrame),
    /// A function waiting for the first resume of its thread.
    Start(Function<'gc>),
    Callback {
        bottom: usize,
        callback: Callback<'gc>,
    },
    Sequence {
        bottom: usize,
        sequence: BoxSequence<'gc>,
        pending_error: Option<Error<'gc>>,
    },
    /// An error barrier, results returned to it are prefixed with `true`.
    Protected {
        bottom: usize,
        handler: Option<Function<'gc>>,
    },
    /// A message handler running on behalf of the `Protected` frame below it.
    Handler { bottom: usize },
    /// A debug hook call, its results are discarded.
    Hook { bottom: usize },
    /// Closing the to-be-closed variables at or above `bottom`, one `__close` call at a time.
    Closing {
        bottom: usize,
        error: Option<Error<'gc>>,
    },
    /// Waiting on another thread which this thread resumed.
    WaitThread,
    Yielded,
    /// Values at `bottom..` are ready to be taken.
    Result { bottom: usize },
    /// An error propagating down the frame stack.
    ///
    /// Handlers are searched for before the error starts `unwinding`.
    Error {
        error: Error<'gc>,
        unwinding: bool,
    },
}

impl<'gc> ThreadState<'gc> {
    pub(crate) fn mode(&self) -> ThreadMode {
        match self.frames.last() {
            None => ThreadMode::Stopped,
            Some(frame) => match frame {
                Frame::Start(_) | Frame::Yielded => ThreadMode::Suspended,
                Frame::Result { .. } => ThreadMode::Result,
                Frame::Error { .. } if self.frames.len() == 1 => ThreadMode::Result,
                Frame::WaitThread => ThreadMode::Waiting,
                _ => ThreadMode::Normal,
            },
        }
    }

    fn reset(&mut self, mc: &Mutation<'gc>) {
        self.close_upvalues(mc, 0);
        self.stack.clear();
        self.frames.clear();
        self.tbc.clear();
        self.hook_depth = 0;
        self.protected_depth = 0;
        self.overflowed = false;
        self.last_error = None;
    }

    pub(crate) fn take_result(&mut self) -> Result<vec::Drain<'_, Value<'gc>, MetricsAlloc<'gc>>, Error<'gc>> {
        match self.frames.pop() {
            Some(Frame::Result { bottom }) => Ok(self.stack.drain(bottom..)),
            Some(Frame::Error { error, .. }) => {
                assert!(self.frames.is_empty());
                self.stack.clear();
                Err(error)
            }
            _ => panic!("no results available to take"),
        }
    }

    fn overflow(&mut self, ctx: Context<'gc>) -> Fault<'gc> {
        if self.overflowed {
            debug!("stack overflow while handling a stack overflow");
            Error::error_in_error_handling(ctx).into()
        } else {
            self.overflowed = true;
            debug!(
                stack = self.stack.len(),
                frames = self.frames.len(),
                "stack overflow"
            );
            VMError::StackOverflow.into()
        }
    }

    /// Make room for a stack of `needed` slots, failing with a stack overflow past the limit.
    pub(crate) fn ensure_stack(&mut self, ctx: Context<'gc>, needed: usize) -> Result<(), Fault<'gc>> {
        let limit = if self.overflowed {
            self.limits.overflow_stack()
        } else {
            self.limits.max_stack
        };
        if needed > limit {
            return Err(self.overflow(ctx));
        }

        let capacity = self.stack.capacity();
        if needed > capacity {
            let new_capacity = needed.max(capacity + capacity / 2).min(limit);
            trace!(from = capacity, to = new_capacity, "growing stack");
            self.stack.reserve_exact(new_capacity - self.stack.len());
        }
        Ok(())
    }

    /// Fail with a stack overflow if a native function pushed the stack past its limit.
    pub(crate) fn check_native_stack(&mut self, ctx: Context<'gc>) -> Result<(), Fault<'gc>> {
        let limit = if self.overflowed {
            self.limits.overflow_stack()
        } else {
            self.limits.max_stack
        };
        if self.stack.len() > limit {
            Err(self.overflow(ctx))
        } else {
            Ok(())
        }
    }

    fn check_frames(&mut self, ctx: Context<'gc>) -> Result<(), Fault<'gc>> {
        let limit = if self.overflowed {
            self.limits.max_frames + self.limits.error_headroom
        } else {
            self.limits.max_frames
        };
        if self.frames.len() >= limit {
            Err(self.overflow(ctx))
        } else {
            Ok(())
        }
    }

    /// Give back memory after an error was caught, and leave the overflow state once the stack is
    /// back under its limit.
    pub(crate) fn shrink_if_oversized(&mut self) {
        let len = self.stack.len();
        if self.overflowed
            && len < self.limits.max_stack
            && self.frames.len() < self.limits.max_frames
        {
            self.overflowed = false;
        }

        self.shrink_stack();
    }

    /// Release stack capacity once less than a third of it is in use, keeping twice the used
    /// size.
    pub(crate) fn shrink_stack(&mut self) {
        let len = self.stack.len();
        let capacity = self.stack.capacity();
        if len * 3 < capacity {
            let keep = (len * 2).max(self.limits.min_stack * 2);
            if keep < capacity {
                trace!(from = capacity, to = keep, "shrinking stack");
                self.stack.shrink_to(keep);
            }
        }
    }

    /// Call `function` with the arguments at `bottom..`.
    pub(crate) fn push_call(
        &mut self,
        ctx: Context<'gc>,
        bottom: usize,
        function: Function<'gc>,
    ) -> Result<(), Fault<'gc>> {
        self.stack.insert(bottom, function.into());
        self.call_function(ctx, bottom, function, false)
    }

    /// Call the value at `func_index` with the arguments above it, following `__call`
    /// metamethods.
    pub(crate) fn call_at(
        &mut self,
        ctx: Context<'gc>,
        func_index: usize,
        is_tail: bool,
    ) -> Result<(), Fault<'gc>> {
        let function = self.resolve_call(ctx, func_index)?;
        self.call_function(ctx, func_index, function, is_tail)
    }

    /// Make the value at `func_index` a function by inserting its `__call` handlers below it.
    pub(crate) fn resolve_call(
        &mut self,
        ctx: Context<'gc>,
        func_index: usize,
    ) -> Result<Function<'gc>, Fault<'gc>> {
        for _ in 0..self.limits.max_tag_loop {
            let v = self.stack[func_index];
            if let Value::Function(f) = v {
                return Ok(f);
            }

            let mm = meta_ops::metamethod(ctx, v, MetaMethod::Call);
            if mm.is_nil() {
                return Err(MetaOperatorError::BadType {
                    action: "call",
                    type_name: v.type_name(),
                    operand: 0,
                }
                .into());
            }
            self.ensure_stack(ctx, self.stack.len() + 1)?;
            self.stack.insert(func_index, mm);
        }
        Err(MetaOperatorError::ChainTooLong("__call").into())
    }

    /// Push the frame for `function`, which must already sit at `func_index` with its arguments
    /// above it.
    pub(crate) fn call_function(
        &mut self,
        ctx: Context<'gc>,
        func_index: usize,
        function: Function<'gc>,
        is_tail: bool,
    ) -> Result<(), Fault<'gc>> {
        self.check_frames(ctx)?;

        match function {
            Function::Closure(closure) => {
                let proto = closure.prototype();
                let fixed_params = proto.fixed_params as usize;
                let stack_size = proto.stack_size as usize;
                let arg_count = self.stack.len() - func_index - 1;
                let var_count = if proto.has_varargs {
                    arg_count.saturating_sub(fixed_params)
                } else {
                    0
                };
                let base = func_index + 1 + var_count;

                self.ensure_stack(ctx, base + stack_size)?;
                // Varargs are kept below the registers, between the function and its base.
                if var_count > 0 {
                    self.stack[func_index + 1..].rotate_left(fixed_params);
                }
                self.stack.truncate(base + fixed_params.min(arg_count));
                self.stack.resize(base + stack_size, Value::Nil);

                self.frames.push(Frame::Lua(LuaFrame {
                    bottom: func_index,
                    base,
                    is_variable: false,
                    pc: 0,
                    stack_size,
                    expected_return: None,
                    is_tail,
                    hooked_pc: None,
                    return_hooked: false,
                    entered: false,
                    hook_last_pc: None,
                    pending_concat: None,
                }));
            }
            Function::Callback(callback) => {
                self.stack.remove(func_index);
                self.ensure_stack(ctx, self.stack.len() + self.limits.min_stack)?;
                self.frames.push(Frame::Callback {
                    bottom: func_index,
                    callback,
                });
            }
        }
        Ok(())
    }

    /// Deliver the values at `bottom..` to the top frame, as the results of its last call.
    pub(crate) fn return_to(&mut self, bottom: usize) {
        match self.frames.last_mut() {
            None => {
                self.frames.push(Frame::Result { bottom });
            }
            Some(Frame::Sequence {
                bottom: seq_bottom, ..
            }) => {
                assert!(bottom >= *seq_bottom);
                self.stack.drain(*seq_bottom..bottom);
            }
            Some(Frame::Lua(LuaFrame {
                expected_return,
                is_variable,
                base,
                stack_size,
                pc,
                ..
            })) => match expected_return.take() {
                Some(LuaReturn::Normal(ret_count)) => {
                    let return_len = ret_count
                        .to_constant()
                        .map(|c| c as usize)
                        .unwrap_or(self.stack.len() - bottom);

                    self.stack.truncate(bottom + return_len);
                    self.stack.resize(bottom + return_len, Value::Nil);

                    *is_variable = ret_count.is_variable();
                    if !ret_count.is_variable() {
                        self.stack.resize(*base + *stack_size, Value::Nil);
                    }
                }
                Some(LuaReturn::Meta(meta_ret)) => {
                    let meta_val = self.stack.get(bottom).copied().unwrap_or_default();
                    self.stack.truncate(bottom);
                    if !*is_variable {
                        self.stack.resize(*base + *stack_size, Value::Nil);
                    }

                    match meta_ret {
                        MetaReturn::None => {}
                        MetaReturn::Register(reg) => {
                            self.stack[*base + reg.0 as usize] = meta_val;
                        }
                        MetaReturn::SkipIf(skip_if) => {
                            if meta_val.to_bool() == skip_if {
                                *pc += 1;
                            }
                        }
                    }
                }
                None => panic!("lua frame has no pending call to return to"),
            },
            Some(Frame::Protected { .. }) => {
                self.frames.pop();
                self.protected_depth -= 1;
                self.stack.insert(bottom, Value::Boolean(true));
                self.return_to(bottom);
            }
            Some(Frame::Handler { bottom: handler_bottom }) => {
                let handler_bottom = *handler_bottom;
                let value = self.stack.get(bottom).copied().unwrap_or_default();
                self.stack.truncate(handler_bottom);
                self.frames.pop();
                self.frames.push(Frame::Error {
                    error: Error::from_value(value),
                    unwinding: true,
                });
            }
            Some(Frame::Hook { bottom: hook_bottom }) => {
                let hook_bottom = *hook_bottom;
                self.frames.pop();
                self.hook_depth -= 1;
                self.stack.truncate(hook_bottom);
            }
            Some(Frame::Closing { .. }) => {
                self.stack.truncate(bottom);
            }
            Some(_) => panic!("frame cannot be returned to"),
        }
    }

    /// Find the open upvalue for `stack_index`, or open a new one.
    pub(crate) fn open_upvalue(
        &mut self,
        mc: &Mutation<'gc>,
        thread: Thread<'gc>,
        stack_index: usize,
    ) -> UpValue<'gc> {
        let search = self.open_upvalues.binary_search_by_key(&stack_index, |uv| {
            match uv.get() {
                UpValueState::Open(open) => open.stack_index,
                UpValueState::Closed(_) => panic!("closed upvalue in the open upvalue list"),
            }
        });

        match search {
            Ok(i) => self.open_upvalues[i],
            Err(i) => {
                let uv = UpValue::new(
                    mc,
                    UpValueState::Open(OpenUpValue {
                        thread,
                        stack_index,
                    }),
                );
                self.open_upvalues.insert(i, uv);
                uv
            }
        }
    }

    /// Close every open upvalue at or above `bottom`, moving the stack values into them.
    pub(crate) fn close_upvalues(&mut self, mc: &Mutation<'gc>, bottom: usize) {
        let start = self.open_upvalues.partition_point(|uv| match uv.get() {
            UpValueState::Open(open) => open.stack_index < bottom,
            UpValueState::Closed(_) => true,
        });

        for uv in self.open_upvalues.drain(start..) {
            if let UpValueState::Open(open) = uv.get() {
                uv.set(
                    mc,
                    UpValueState::Closed(
                        self.stack
                            .get(open.stack_index)
                            .copied()
                            .unwrap_or_default(),
                    ),
                );
            }
        }
    }

    /// Pop the highest pending to-be-closed variable at or above `bottom`.
    pub(crate) fn pop_tbc(&mut self, bottom: usize) -> Option<usize> {
        match self.tbc.last() {
            Some(&idx) if idx >= bottom => self.tbc.pop(),
            _ => None,
        }
    }

    pub(crate) fn has_tbc(&self, bottom: usize) -> bool {
        matches!(self.tbc.last(), Some(&idx) if idx >= bottom)
    }

    /// Start raising `error` from the top frame.
    pub(crate) fn raise(&mut self, error: Error<'gc>) {
        let error = error.with_backtrace(|| debug::backtrace(&self.frames, &self.stack));
        self.frames.push(Frame::Error {
            error,
            unwinding: false,
        });
    }

    /// Raise an error coming from a native function that was called by the top frame.
    pub(crate) fn raise_native(&mut self, error: Error<'gc>) {
        let error = error.with_backtrace(|| {
            let mut bt = std::vec![debug::native_frame(&self.frames, &self.stack)];
            bt.extend(debug::backtrace(&self.frames, &self.stack));
            bt
        });
        self.frames.push(Frame::Error {
            error,
            unwinding: false,
        });
    }

    /// Take one step of error propagation for the `Error` frame on top.
    pub(crate) fn step_error(&mut self, ctx: Context<'gc>) {
        let Some(Frame::Error { error, unwinding }) = self.frames.pop() else {
            panic!("top frame is not an error");
        };

        if !unwinding {
            self.search_handler(ctx, error);
        } else {
            self.unwind(ctx, error);
        }
    }

    fn search_handler(&mut self, ctx: Context<'gc>, error: Error<'gc>) {
        use crate::error::ErrorKind;

        enum Found<'gc> {
            MessageHandler(Function<'gc>),
            RunningHandler,
            Nothing,
        }

        let found = if matches!(
            error.kind(),
            ErrorKind::ErrorInErrorHandling | ErrorKind::Memory
        ) {
            Found::Nothing
        } else {
            let barrier = self.frames.iter().rev().find(|frame| {
                !matches!(
                    frame,
                    Frame::Lua(_)
                        | Frame::Sequence { .. }
                        | Frame::Closing { .. }
                        | Frame::Hook { .. }
                )
            });
            match barrier {
                Some(Frame::Handler { .. }) => Found::RunningHandler,
                Some(&Frame::Protected {
                    handler: Some(handler),
                    ..
                }) => Found::MessageHandler(handler),
                _ => Found::Nothing,
            }
        };

        match found {
            Found::MessageHandler(handler) => {
                let bottom = self.stack.len();
                self.frames.push(Frame::Handler { bottom });
                self.stack.push(handler.into());
                self.stack.push(error.to_value(ctx));
                if self.call_function(ctx, bottom, handler, false).is_err() {
                    // The handler frame stays, the failure unwinds through it.
                    self.stack.truncate(bottom);
                    self.frames.push(Frame::Error {
                        error: Error::error_in_error_handling(ctx),
                        unwinding: true,
                    });
                }
            }
            Found::RunningHandler => {
                debug!("error raised inside of a message handler");
                self.frames.push(Frame::Error {
                    error: Error::error_in_error_handling(ctx),
                    unwinding: true,
                });
            }
            Found::Nothing => self.frames.push(Frame::Error {
                error,
                unwinding: true,
            }),
        }
    }

    fn unwind(&mut self, ctx: Context<'gc>, error: Error<'gc>) {
        match self.frames.pop() {
            Some(Frame::Lua(LuaFrame { bottom, .. })) => {
                self.close_upvalues(&ctx, bottom);
                if self.has_tbc(bottom) {
                    self.frames.push(Frame::Closing {
                        bottom,
                        error: Some(error),
                    });
                } else {
                    self.stack.truncate(bottom);
                    self.frames.push(Frame::Error {
                        error,
                        unwinding: true,
                    });
                }
            }
            Some(Frame::Sequence {
                bottom,
                sequence,
                pending_error,
            }) => {
                assert!(pending_error.is_none());
                self.stack.truncate(bottom);
                self.frames.push(Frame::Sequence {
                    bottom,
                    sequence,
                    pending_error: Some(error),
                });
            }
            Some(Frame::Protected { bottom, .. }) => {
                trace!("protected call caught an error");
                self.protected_depth -= 1;
                self.stack.truncate(bottom);
                self.stack.push(Value::Boolean(false));
                self.stack.push(error.to_value(ctx));
                self.shrink_if_oversized();
                self.return_to(bottom);
            }
            Some(Frame::Handler { .. }) => {
                self.frames.push(Frame::Error {
                    error,
                    unwinding: true,
                });
            }
            Some(Frame::Hook { bottom }) => {
                self.hook_depth -= 1;
                self.stack.truncate(bottom);
                self.frames.push(Frame::Error {
                    error,
                    unwinding: true,
                });
            }
            Some(Frame::Closing { bottom, .. }) => {
                self.frames.push(Frame::Closing {
                    bottom,
                    error: Some(error),
                });
            }
            None => {
                debug!(error = %error.to_extern(), "thread died with an error");
                self.last_error = Some(error.clone());
                self.frames.push(Frame::Error {
                    error,
                    unwinding: true,
                });
            }
            Some(_) => panic!("invalid frame below an error"),
        }
    }

    /// Take one step of the `Closing` frame on top: call the next `__close` metamethod, or finish
    /// once none are left.
    pub(crate) fn step_closing(&mut self, ctx: Context<'gc>) {
        let (bottom, error) = match self.frames.last() {
            Some(Frame::Closing { bottom, error }) => (*bottom, error.clone()),
            _ => panic!("top frame is not a closing frame"),
        };

        while let Some(idx) = self.pop_tbc(bottom) {
            let value = self.stack.get(idx).copied().unwrap_or_default();
            self.stack.truncate(idx + 1);
            match meta_ops::close(ctx, value) {
                Ok(None) => continue,
                Ok(Some(mm)) => {
                    let call_bottom = self.stack.len();
                    self.stack.push(mm);
                    self.stack.push(value);
                    self.stack.push(match &error {
                        Some(err) => err.to_value(ctx),
                        None => Value::Nil,
                    });
                    if let Err(fault) = self.call_at(ctx, call_bottom, false) {
                        self.stack.truncate(call_bottom);
                        self.raise(fault.into_error(ctx));
                    }
                    return;
                }
                // The value was checked when it was marked, it may only have lost its metamethod
                // since.
                Err(_) => {
                    let err = VMError::NonClosable("?".to_owned());
                    self.raise(Error::message(ctx, err.to_string()));
                    return;
                }
            }
        }

        self.frames.pop();
        self.stack.truncate(bottom);
        match error {
            Some(error) => self.frames.push(Frame::Error {
                error,
                unwinding: true,
            }),
            None => self.return_to(bottom),
        }
    }

    /// Finish the running thread from inside one of its callbacks, closing its pending
    /// to-be-closed variables first.
    pub(crate) fn terminate(&mut self, mc: &Mutation<'gc>) {
        debug!("terminating running thread");
        self.close_upvalues(mc, 0);
        self.frames.clear();
        self.frames.push(Frame::Closing {
            bottom: 0,
            error: None,
        });
    }

    /// Whether a yield from the top of this thread would cross a non-yieldable native boundary.
    pub(crate) fn is_yieldable(&self) -> bool {
        self.frames.iter().all(|frame| match frame {
            Frame::Sequence { sequence, .. } => sequence.yieldable(),
            _ => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{Lua, Thread, Value};

    #[test]
    fn test_stack_resizing() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            let thread = Thread::new(ctx);
            let mut state = thread.state_mut(&ctx);

            state.stack.clear();
            state.stack.shrink_to_fit();
            state.stack.reserve_exact(1000);
            state.stack.resize(1000, Value::Nil);
            let capacity = state.stack.capacity();
            assert!(state.ensure_stack(ctx, capacity + 1).is_ok());
            assert!(state.stack.capacity() > capacity);
            assert!(state.stack.capacity() < capacity * 2);

            state.stack.clear();
            state.stack.shrink_to_fit();
            state.stack.reserve_exact(300);
            state.stack.resize(200, Value::Nil);
            let capacity = state.stack.capacity();
            state.shrink_stack();
            assert_eq!(state.stack.capacity(), capacity);

            state.stack.truncate(90);
            state.shrink_stack();
            assert!(state.stack.capacity() >= 180);
            assert!(state.stack.capacity() < 300);

            let max_stack = ctx.limits().max_stack;
            assert!(state.ensure_stack(ctx, max_stack + 1).is_err());
        });
    }
}
