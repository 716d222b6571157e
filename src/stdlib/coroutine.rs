use gc_arena::Collect;
use tracing::debug;

use crate::{
    BoxSequence, Callback, CallbackReturn, Context, Error, Execution, Function, Sequence,
    SequencePoll, Stack, Table, Thread, ThreadMode, Value, Variadic,
};

use super::argument;

pub fn load_coroutine<'gc>(ctx: Context<'gc>) {
    let coroutine = Table::new(&ctx);

    coroutine.set_field(
        ctx,
        "create",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let function: Function = argument(ctx, &stack, 0, "create")?;
            let thread = Thread::new(ctx);
            thread.start_suspended(&ctx, function)?;
            stack.replace(ctx, thread);
            Ok(CallbackReturn::Return)
        }),
    );

    coroutine.set_field(
        ctx,
        "resume",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let thread: Thread = argument(ctx, &stack, 0, "resume")?;
            stack.pop_front();
            Ok(CallbackReturn::Resume {
                thread,
                then: Some(BoxSequence::new(&ctx, ResumeResult::Resume)),
            })
        }),
    );

    coroutine.set_field(
        ctx,
        "yield",
        Callback::from_fn(&ctx, |_, _, _| Ok(CallbackReturn::Yield { then: None })),
    );

    coroutine.set_field(
        ctx,
        "status",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let thread: Thread = argument(ctx, &stack, 0, "status")?;
            stack.replace(ctx, thread.status());
            Ok(CallbackReturn::Return)
        }),
    );

    coroutine.set_field(
        ctx,
        "running",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let current = exec.current_thread();
            stack.replace(ctx, (current.thread, current.is_main));
            Ok(CallbackReturn::Return)
        }),
    );

    coroutine.set_field(
        ctx,
        "isyieldable",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let yieldable = match argument::<Option<Thread>>(ctx, &stack, 0, "isyieldable")? {
                Some(thread) if thread != exec.current_thread().thread => !thread.is_main(),
                _ => exec.is_yieldable(),
            };
            stack.replace(ctx, yieldable);
            Ok(CallbackReturn::Return)
        }),
    );

    coroutine.set_field(
        ctx,
        "wrap",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let function: Function = argument(ctx, &stack, 0, "wrap")?;
            let thread = Thread::new(ctx);
            thread.start_suspended(&ctx, function)?;
            stack.replace(
                ctx,
                Callback::from_fn_with(&ctx, thread, |&thread, ctx, _, _| {
                    Ok(CallbackReturn::Resume {
                        thread,
                        then: Some(BoxSequence::new(&ctx, ResumeResult::Wrap)),
                    })
                }),
            );
            Ok(CallbackReturn::Return)
        }),
    );

    coroutine.set_field(
        ctx,
        "close",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let thread: Thread = argument(ctx, &stack, 0, "close")?;
            stack.clear();

            if thread == exec.current_thread().thread {
                return if thread.is_main() {
                    Err(Error::message(ctx, "cannot close main thread"))
                } else {
                    Ok(CallbackReturn::Terminate)
                };
            }

            match thread.mode() {
                ThreadMode::Stopped => {
                    match thread.last_error() {
                        Some(err) => stack.replace(ctx, (false, err.to_value(ctx))),
                        None => stack.replace(ctx, true),
                    }
                    Ok(CallbackReturn::Return)
                }
                ThreadMode::Result => {
                    match thread.take_result::<Variadic<Value>>(ctx)? {
                        Ok(_) => stack.replace(ctx, true),
                        Err(err) => stack.replace(ctx, (false, err.to_value(ctx))),
                    }
                    Ok(CallbackReturn::Return)
                }
                ThreadMode::Suspended => {
                    debug!("closing suspended coroutine");
                    thread.prepare_close(&ctx)?;
                    Ok(CallbackReturn::Resume {
                        thread,
                        then: Some(BoxSequence::new(&ctx, ResumeResult::Close)),
                    })
                }
                ThreadMode::Normal | ThreadMode::Waiting => {
                    Err(Error::message(ctx, "cannot close a normal coroutine"))
                }
                ThreadMode::Running => Err(Error::message(ctx, "cannot close a running coroutine")),
            }
        }),
    );

    ctx.globals().set_field(ctx, "coroutine", coroutine);
}

/// How a resumed coroutine's results are handed back to the caller.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(require_static)]
enum ResumeResult {
    /// `true, ...` or `false, err`.
    Resume,
    /// The results as they are, errors are raised again.
    Wrap,
    /// `true` or `false, err`, discarding any results.
    Close,
}

impl<'gc> Sequence<'gc> for ResumeResult {
    fn poll(
        &mut self,
        ctx: Context<'gc>,
        _exec: Execution<'gc, '_>,
        mut stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>> {
        match self {
            ResumeResult::Resume => stack.push_front(Value::Boolean(true)),
            ResumeResult::Wrap => {}
            ResumeResult::Close => stack.replace(ctx, true),
        }
        Ok(SequencePoll::Return)
    }

    fn error(
        &mut self,
        ctx: Context<'gc>,
        _exec: Execution<'gc, '_>,
        error: Error<'gc>,
        mut stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>> {
        match self {
            ResumeResult::Wrap => Err(error),
            ResumeResult::Resume | ResumeResult::Close => {
                stack.replace(ctx, (false, error.to_value(ctx)));
                Ok(SequencePoll::Return)
            }
        }
    }
}
