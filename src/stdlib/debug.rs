use std::fmt::Write;

use crate::{
    closure::UpValueState,
    compiled::FunctionRef,
    thread::{self, FrameInfo, Frame, Hook, HookMask},
    Callback, CallbackReturn, Context, Error, Execution, Function, Stack, Table, Thread, Value,
};

use super::{argument, bad_argument};

pub fn load_debug<'gc>(ctx: Context<'gc>) {
    let debug = Table::new(&ctx);

    debug.set_field(
        ctx,
        "traceback",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let (target, arg) = thread_argument(&exec, &stack);
            let message = match stack.get(arg) {
                Value::Nil => None,
                v => match v.into_string(ctx) {
                    Some(s) => Some(s),
                    // Other messages are returned untouched.
                    None => {
                        stack.replace(ctx, v);
                        return Ok(CallbackReturn::Return);
                    }
                },
            };
            let level = argument::<Option<i64>>(ctx, &stack, arg + 1, "traceback")?;

            let backtrace = match target {
                None => {
                    let level = level.unwrap_or(1);
                    let mut backtrace = Vec::new();
                    if level <= 0 {
                        backtrace.push(thread::native_frame(exec.frames(), stack.full()));
                    }
                    backtrace.extend(
                        thread::backtrace(exec.frames(), stack.full())
                            .into_iter()
                            .skip(level.max(1) as usize - 1),
                    );
                    backtrace
                }
                Some(target) => {
                    let state = inspect(ctx, target)?;
                    let backtrace = thread::backtrace(&state.frames, &state.stack);
                    backtrace
                        .into_iter()
                        .skip(level.unwrap_or(0).max(0) as usize)
                        .collect()
                }
            };

            let mut out = String::new();
            if let Some(message) = message {
                writeln!(out, "{}", message.display_lossy())?;
            }
            out.push_str("stack traceback:");
            for frame in &backtrace {
                write!(out, "\n\t{}", frame)?;
            }
            stack.replace(ctx, out);
            Ok(CallbackReturn::Return)
        }),
    );

    debug.set_field(
        ctx,
        "getinfo",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let (target, arg) = thread_argument(&exec, &stack);
            let what = argument::<Option<crate::String>>(ctx, &stack, arg + 1, "getinfo")?;
            let what = what.map_or(&b"flnStu"[..], |s| s.as_bytes());

            let info = match stack.get(arg) {
                Value::Function(function) => FrameInfo {
                    function: Some(function),
                    prototype: match function {
                        Function::Closure(c) => Some(c.prototype()),
                        Function::Callback(_) => None,
                    },
                    current_line: None,
                    name: None,
                    is_tail: false,
                },
                _ => {
                    let level: i64 = argument(ctx, &stack, arg, "getinfo")?;
                    let info = match target {
                        None if level == 0 => Some(FrameInfo {
                            function: None,
                            prototype: None,
                            current_line: None,
                            name: None,
                            is_tail: false,
                        }),
                        None => level_info(exec.frames(), stack.full(), level),
                        Some(target) => {
                            let state = inspect(ctx, target)?;
                            let info = level_info(&state.frames, &state.stack, level + 1);
                            info
                        }
                    };
                    match info {
                        Some(info) => info,
                        None => {
                            stack.replace(ctx, Value::Nil);
                            return Ok(CallbackReturn::Return);
                        }
                    }
                }
            };

            let table = info_table(ctx, &info, what)?;
            stack.replace(ctx, table);
            Ok(CallbackReturn::Return)
        }),
    );

    debug.set_field(
        ctx,
        "getlocal",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let (target, arg) = thread_argument(&exec, &stack);
            let n: i64 = argument(ctx, &stack, arg + 1, "getlocal")?;

            // Only parameter names are known for a function which is not running.
            if let Value::Function(function) = stack.get(arg) {
                let name = match function {
                    Function::Closure(c) if n > 0 && n <= c.prototype().fixed_params as i64 => c
                        .prototype()
                        .active_locals(0)
                        .nth(n as usize - 1)
                        .map(|local| local.name),
                    _ => None,
                };
                stack.replace(ctx, name);
                return Ok(CallbackReturn::Return);
            }

            let level: i64 = argument(ctx, &stack, arg, "getlocal")?;
            let found = match target {
                None => {
                    let index = frame_index(exec.frames(), level)
                        .ok_or_else(|| bad_argument(ctx, arg, "getlocal", "level out of range"))?;
                    thread::frame_local(exec.frames(), stack.full(), index, n)
                        .map(|(name, slot)| (name, stack.full()[slot]))
                }
                Some(target) => {
                    let state = inspect(ctx, target)?;
                    let index = frame_index(&state.frames, level + 1)
                        .ok_or_else(|| bad_argument(ctx, arg, "getlocal", "level out of range"))?;
                    let found = thread::frame_local(&state.frames, &state.stack, index, n);
                    found.map(|(name, slot)| (name, state.stack[slot]))
                }
            };

            match found {
                Some((name, value)) => stack.replace(ctx, (name, value)),
                None => stack.replace(ctx, Value::Nil),
            }
            Ok(CallbackReturn::Return)
        }),
    );

    debug.set_field(
        ctx,
        "setlocal",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let (target, arg) = thread_argument(&exec, &stack);
            let level: i64 = argument(ctx, &stack, arg, "setlocal")?;
            let n: i64 = argument(ctx, &stack, arg + 1, "setlocal")?;
            let value = stack.get(arg + 2);

            let name = match target {
                None => {
                    let index = frame_index(exec.frames(), level)
                        .ok_or_else(|| bad_argument(ctx, arg, "setlocal", "level out of range"))?;
                    let found = thread::frame_local(exec.frames(), stack.full(), index, n);
                    found.map(|(name, slot)| {
                        stack.full_mut()[slot] = value;
                        name
                    })
                }
                Some(target) => {
                    let mut state = target
                        .try_state_mut(&ctx)
                        .ok_or_else(|| Error::message(ctx, "cannot inspect a running thread"))?;
                    let index = frame_index(&state.frames, level + 1)
                        .ok_or_else(|| bad_argument(ctx, arg, "setlocal", "level out of range"))?;
                    let found = thread::frame_local(&state.frames, &state.stack, index, n);
                    found.map(|(name, slot)| {
                        state.stack[slot] = value;
                        name
                    })
                }
            };

            stack.replace(ctx, name);
            Ok(CallbackReturn::Return)
        }),
    );

    debug.set_field(
        ctx,
        "getupvalue",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let function: Function = argument(ctx, &stack, 0, "getupvalue")?;
            let n: i64 = argument(ctx, &stack, 1, "getupvalue")?;

            let found = match upvalue_slot(ctx, function, n) {
                Some((name, state)) => {
                    let value = match state {
                        UpValueState::Closed(v) => v,
                        UpValueState::Open(open) if open.thread == exec.current_thread().thread => {
                            stack.full()[open.stack_index]
                        }
                        UpValueState::Open(open) => inspect(ctx, open.thread)?.stack[open.stack_index],
                    };
                    Some((name, value))
                }
                None => None,
            };

            match found {
                Some((name, value)) => stack.replace(ctx, (name, value)),
                None => stack.clear(),
            }
            Ok(CallbackReturn::Return)
        }),
    );

    debug.set_field(
        ctx,
        "setupvalue",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let function: Function = argument(ctx, &stack, 0, "setupvalue")?;
            let n: i64 = argument(ctx, &stack, 1, "setupvalue")?;
            let value = stack.get(2);

            let Function::Closure(closure) = function else {
                stack.clear();
                return Ok(CallbackReturn::Return);
            };
            let Some((name, state)) = upvalue_slot(ctx, function, n) else {
                stack.clear();
                return Ok(CallbackReturn::Return);
            };

            match state {
                UpValueState::Closed(_) => closure.upvalues()[n as usize - 1]
                    .set(&ctx, UpValueState::Closed(value)),
                UpValueState::Open(open) if open.thread == exec.current_thread().thread => {
                    stack.full_mut()[open.stack_index] = value;
                }
                UpValueState::Open(open) => match open.thread.try_state_mut(&ctx) {
                    Some(mut state) => state.stack[open.stack_index] = value,
                    None => return Err(Error::message(ctx, "cannot inspect a running thread")),
                },
            }
            stack.replace(ctx, name);
            Ok(CallbackReturn::Return)
        }),
    );

    debug.set_field(
        ctx,
        "sethook",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let (target, arg) = thread_argument(&exec, &stack);
            let target = target.unwrap_or(exec.current_thread().thread);

            let hook = match argument::<Option<Function>>(ctx, &stack, arg, "sethook")? {
                None => None,
                Some(function) => {
                    let mask = argument::<Option<crate::String>>(ctx, &stack, arg + 1, "sethook")?;
                    let count = argument::<Option<i64>>(ctx, &stack, arg + 2, "sethook")?;
                    let hook = Hook {
                        function,
                        mask: HookMask::from_bytes(mask.map_or(&b""[..], |m| m.as_bytes())),
                        count: count.unwrap_or(0).clamp(0, u32::MAX as i64) as u32,
                    };
                    hook.is_active().then_some(hook)
                }
            };

            target.set_hook(&ctx, hook);
            stack.clear();
            Ok(CallbackReturn::Return)
        }),
    );

    debug.set_field(
        ctx,
        "gethook",
        Callback::from_fn(&ctx, |ctx, exec, mut stack| {
            let (target, _) = thread_argument(&exec, &stack);
            let target = target.unwrap_or(exec.current_thread().thread);
            match target.hook() {
                Some(hook) => stack.replace(
                    ctx,
                    (
                        hook.function,
                        ctx.intern(&hook.mask.to_bytes()),
                        hook.count as i64,
                    ),
                ),
                None => stack.replace(ctx, Value::Nil),
            }
            Ok(CallbackReturn::Return)
        }),
    );

    ctx.globals().set_field(ctx, "debug", debug);
}

/// An optional leading thread argument, `None` when it is absent or names the running thread.
///
/// Returns the index of the first argument after it.
fn thread_argument<'gc>(
    exec: &Execution<'gc, '_>,
    stack: &Stack<'gc, '_>,
) -> (Option<Thread<'gc>>, usize) {
    match stack.get(0) {
        Value::Thread(t) if t == exec.current_thread().thread => (None, 1),
        Value::Thread(t) => (Some(t), 1),
        _ => (None, 0),
    }
}

/// Borrow the state of a thread which is not the running one.
fn inspect<'gc>(
    ctx: Context<'gc>,
    thread: Thread<'gc>,
) -> Result<std::cell::Ref<'gc, thread::ThreadState<'gc>>, Error<'gc>> {
    thread
        .try_state()
        .ok_or_else(|| Error::message(ctx, "cannot inspect a running thread"))
}

fn frame_index(frames: &[Frame<'_>], level: i64) -> Option<usize> {
    if level < 1 {
        return None;
    }
    thread::frame_at_level(frames, level as usize)
}

fn level_info<'gc>(frames: &[Frame<'gc>], stack: &[Value<'gc>], level: i64) -> Option<FrameInfo<'gc>> {
    let index = frame_index(frames, level)?;
    Some(thread::frame_info(frames, stack, index))
}

fn upvalue_slot<'gc>(
    ctx: Context<'gc>,
    function: Function<'gc>,
    n: i64,
) -> Option<(crate::String<'gc>, UpValueState<'gc>)> {
    let Function::Closure(closure) = function else {
        return None;
    };
    let i = usize::try_from(n).ok()?.checked_sub(1)?;
    let upvalue = closure.upvalues().get(i)?;
    let name = closure
        .prototype()
        .upvalue_names
        .get(i)
        .copied()
        .unwrap_or_else(|| ctx.intern_static(b"?"));
    Some((name, upvalue.get()))
}

fn info_table<'gc>(ctx: Context<'gc>, info: &FrameInfo<'gc>, what: &[u8]) -> Result<Table<'gc>, Error<'gc>> {
    let table = Table::new(&ctx);
    for &option in what {
        match option {
            b'S' => match info.prototype {
                Some(proto) => {
                    let source = proto.chunk_name;
                    let (kind, line_defined) = match proto.reference {
                        FunctionRef::Chunk => ("main", 0),
                        ref r => ("Lua", r.line_defined().map_or(0, |l| l.0 as i64)),
                    };
                    let last_line = proto
                        .opcode_line_numbers
                        .iter()
                        .map(|&(_, l)| l.0 as i64)
                        .max()
                        .unwrap_or(line_defined);
                    table.set_field(ctx, "source", source);
                    table.set_field(ctx, "short_src", source);
                    table.set_field(ctx, "what", kind);
                    table.set_field(ctx, "linedefined", line_defined);
                    table.set_field(
                        ctx,
                        "lastlinedefined",
                        if kind == "main" { 0 } else { last_line },
                    );
                }
                None => {
                    table.set_field(ctx, "source", "=[C]");
                    table.set_field(ctx, "short_src", "[C]");
                    table.set_field(ctx, "what", "C");
                    table.set_field(ctx, "linedefined", -1);
                    table.set_field(ctx, "lastlinedefined", -1);
                }
            },
            b'l' => {
                let line = info.current_line.map_or(-1, |l| l.0 as i64);
                table.set_field(ctx, "currentline", line);
            }
            b'n' => match &info.name {
                Some(name) => {
                    table.set_field(ctx, "name", name.name.clone());
                    table.set_field(ctx, "namewhat", name.kind);
                }
                None => {
                    table.set_field(ctx, "namewhat", "");
                }
            },
            b't' => {
                table.set_field(ctx, "istailcall", info.is_tail);
            }
            b'u' => {
                let (nups, nparams, is_vararg) = match info.function {
                    Some(Function::Closure(c)) => {
                        let proto = c.prototype();
                        (c.upvalues().len() as i64, proto.fixed_params as i64, proto.has_varargs)
                    }
                    _ => (0, 0, true),
                };
                table.set_field(ctx, "nups", nups);
                table.set_field(ctx, "nparams", nparams);
                table.set_field(ctx, "isvararg", is_vararg);
            }
            b'f' => {
                table.set_field(ctx, "func", info.function);
            }
            _ => {
                return Err(bad_argument(ctx, 1, "getinfo", "invalid option"));
            }
        }
    }
    Ok(table)
}
