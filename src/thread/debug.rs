//! Introspection of thread frames: tracebacks, variable names for error messages, frame levels
//! and debug hooks.

use gc_arena::{Collect, Gc};

use crate::{
    closure::FunctionPrototype,
    compiled::{FunctionRef, LineNumber},
    error::BacktraceFrame,
    opcode::OpCode,
    types::{ConstantIndex8, RegisterIndex},
    Closure, Constant, Function, Value,
};

use super::{
    error::VariableName,
    thread::{Frame, LuaFrame, LuaReturn},
};

/// The events a debug hook is called for.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HookMask {
    pub call: bool,
    pub ret: bool,
    pub line: bool,
}

impl HookMask {
    /// Parses a mask string made of `c`, `r` and `l`, unknown characters are ignored.
    pub fn from_bytes(mask: &[u8]) -> Self {
        HookMask {
            call: mask.contains(&b'c'),
            ret: mask.contains(&b'r'),
            line: mask.contains(&b'l'),
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut mask = Vec::new();
        if self.call {
            mask.push(b'c');
        }
        if self.ret {
            mask.push(b'r');
        }
        if self.line {
            mask.push(b'l');
        }
        mask
    }

    pub fn is_empty(self) -> bool {
        !(self.call || self.ret || self.line)
    }
}

/// A debug hook installed on a thread.
///
/// Hooks are only run for script functions. The hook function is called with the event name and,
/// for line events, the new line.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Hook<'gc> {
    pub function: Function<'gc>,
    #[collect(require_static)]
    pub mask: HookMask,
    /// Run the hook every `count` instructions, 0 disables the count event.
    pub count: u32,
}

impl<'gc> Hook<'gc> {
    pub fn is_active(&self) -> bool {
        !self.mask.is_empty() || self.count > 0
    }
}

/// The closure running in a Lua frame.
pub(crate) fn frame_closure<'gc>(stack: &[Value<'gc>], bottom: usize) -> Closure<'gc> {
    match stack[bottom] {
        Value::Function(Function::Closure(c)) => c,
        _ => panic!("lua frame bottom is not a closure"),
    }
}

/// The index of the instruction a Lua frame is executing.
///
/// The stored pc already points past an instruction that is in progress, unless the instruction
/// was interrupted before it ran and will be re-entered.
pub(crate) fn current_pc(pc: usize, hooked_pc: Option<usize>) -> usize {
    if hooked_pc == Some(pc) {
        pc
    } else {
        pc.saturating_sub(1)
    }
}

fn constant_name<'gc>(proto: &FunctionPrototype<'gc>, key: ConstantIndex8) -> Option<String> {
    match proto.constants.get(key.0 as usize)? {
        Constant::String(s) => Some(s.display_lossy().to_string()),
        _ => None,
    }
}

fn writes_register(op: &OpCode, reg: RegisterIndex) -> bool {
    let r = reg.0;
    match *op {
        OpCode::Move { dest, .. }
        | OpCode::LoadConstant { dest, .. }
        | OpCode::LoadBool { dest, .. }
        | OpCode::NewTable { dest }
        | OpCode::GetTable { dest, .. }
        | OpCode::GetField { dest, .. }
        | OpCode::GetUpTable { dest, .. }
        | OpCode::GetUpValue { dest, .. }
        | OpCode::Closure { dest, .. }
        | OpCode::Concat { dest, .. }
        | OpCode::Length { dest, .. }
        | OpCode::Not { dest, .. }
        | OpCode::Minus { dest, .. }
        | OpCode::BitNot { dest, .. }
        | OpCode::Arith { dest, .. }
        | OpCode::ArithK { dest, .. }
        | OpCode::TestSet { dest, .. } => dest.0 == r,
        OpCode::LoadNil { dest, count } => {
            r >= dest.0 && (r as usize) < dest.0 as usize + count.max(1) as usize
        }
        OpCode::Method { base, .. } => r == base.0 || r as usize == base.0 as usize + 1,
        OpCode::Call { func, .. } => r >= func.0,
        OpCode::VarArgs { dest, .. } => r >= dest.0,
        OpCode::GenericForCall { base, .. } => r as usize >= base.0 as usize + 4,
        OpCode::NumericForPrep { base, .. } | OpCode::NumericForLoop { base, .. } => {
            r >= base.0 && (r as usize) < base.0 as usize + 4
        }
        OpCode::GenericForLoop { base, .. } => r as usize == base.0 as usize + 2,
        _ => false,
    }
}

/// The last instruction before `pc` that set `reg`, if it is certain to have run.
fn find_set_register(proto: &FunctionPrototype<'_>, pc: usize, reg: RegisterIndex) -> Option<usize> {
    let mut set_at = None;
    // Instructions before a forward jump target may have been skipped.
    let mut jump_target = 0;
    for (i, op) in proto.opcodes.iter().enumerate().take(pc) {
        if let OpCode::Jump { offset, .. } = *op {
            let dest = (i as isize + 1 + offset as isize) as usize;
            if i < dest && dest <= pc && dest > jump_target {
                jump_target = dest;
            }
        }
        if writes_register(op, reg) {
            set_at = if i < jump_target { None } else { Some(i) };
        }
    }
    set_at
}

/// Name the value held in `reg` at instruction `pc`, for error messages.
pub(crate) fn register_name<'gc>(
    proto: &FunctionPrototype<'gc>,
    pc: usize,
    reg: RegisterIndex,
) -> Option<VariableName> {
    if let Some(name) = proto.local_name(reg, pc) {
        return Some(VariableName {
            kind: "local",
            name: name.display_lossy().to_string(),
        });
    }

    let set_at = find_set_register(proto, pc, reg)?;
    match proto.opcodes[set_at] {
        OpCode::Move { dest, source } if source.0 < dest.0 => register_name(proto, set_at, source),
        OpCode::GetUpTable { table, key, .. } => {
            let is_env = proto
                .upvalue_names
                .get(table.0 as usize)
                .is_some_and(|n| n.as_bytes() == b"_ENV");
            Some(VariableName {
                kind: if is_env { "global" } else { "field" },
                name: constant_name(proto, key)?,
            })
        }
        OpCode::GetField { table, key, .. } => {
            let is_env = proto
                .local_name(table, set_at)
                .is_some_and(|n| n.as_bytes() == b"_ENV");
            Some(VariableName {
                kind: if is_env { "global" } else { "field" },
                name: constant_name(proto, key)?,
            })
        }
        OpCode::GetUpValue { source, .. } => Some(VariableName {
            kind: "upvalue",
            name: proto
                .upvalue_names
                .get(source.0 as usize)?
                .display_lossy()
                .to_string(),
        }),
        OpCode::LoadConstant { constant, .. } => match proto.constants.get(constant.0 as usize)? {
            Constant::String(s) => Some(VariableName {
                kind: "constant",
                name: s.display_lossy().to_string(),
            }),
            _ => None,
        },
        OpCode::Method { key, .. } => Some(VariableName {
            kind: "method",
            name: constant_name(proto, key)?,
        }),
        _ => None,
    }
}

fn metamethod_event(op: &OpCode) -> Option<&'static str> {
    Some(match op {
        OpCode::GetTable { .. }
        | OpCode::GetField { .. }
        | OpCode::GetUpTable { .. }
        | OpCode::Method { .. } => "index",
        OpCode::SetTable { .. } | OpCode::SetField { .. } | OpCode::SetUpTable { .. } => {
            "newindex"
        }
        OpCode::Arith { op, .. } | OpCode::ArithK { op, .. } => {
            op.metamethod().name().trim_start_matches("__")
        }
        OpCode::Eq { .. } | OpCode::EqK { .. } => "eq",
        OpCode::Less { .. } => "lt",
        OpCode::LessEq { .. } => "le",
        OpCode::Concat { .. } => "concat",
        OpCode::Length { .. } => "len",
        OpCode::Minus { .. } => "unm",
        OpCode::BitNot { .. } => "bnot",
        OpCode::Return { .. } | OpCode::Close { .. } => "close",
        _ => return None,
    })
}

/// How the function running in `frames[index]` was called, judged from the frame below it.
pub(crate) fn call_site_name<'gc>(
    frames: &[Frame<'gc>],
    stack: &[Value<'gc>],
    index: usize,
) -> Option<VariableName> {
    let caller = frames.get(index.checked_sub(1)?)?;
    match caller {
        Frame::Lua(frame) => {
            let proto = frame_closure(stack, frame.bottom).prototype();
            let call_pc = frame.current_pc();
            let op = proto.opcodes.get(call_pc)?;
            match frame.expected_return {
                Some(LuaReturn::Meta(_)) => Some(VariableName {
                    kind: "metamethod",
                    name: metamethod_event(op)?.to_owned(),
                }),
                Some(LuaReturn::Normal(_)) => match *op {
                    OpCode::Call { func, .. } => register_name(&proto, call_pc, func),
                    OpCode::GenericForCall { .. } => Some(VariableName {
                        kind: "for iterator",
                        name: "for iterator".to_owned(),
                    }),
                    _ => None,
                },
                None => None,
            }
        }
        Frame::Hook { .. } => Some(hook_name()),
        Frame::Sequence { .. } => match frames.get(index.checked_sub(2)?)? {
            Frame::Hook { .. } => Some(hook_name()),
            _ => None,
        },
        _ => None,
    }
}

fn hook_name() -> VariableName {
    VariableName {
        kind: "hook",
        name: "?".to_owned(),
    }
}

fn describe_name(name: VariableName) -> String {
    match name.kind {
        "global" => format!("function '{}'", name.name),
        kind => format!("{} '{}'", kind, name.name),
    }
}

fn describe_lua_function<'gc>(frames: &[Frame<'gc>], stack: &[Value<'gc>], index: usize) -> String {
    let Frame::Lua(LuaFrame { bottom, is_tail, .. }) = frames[index] else {
        panic!("not a lua frame");
    };
    let proto = frame_closure(stack, bottom).prototype();
    if let FunctionRef::Chunk = proto.reference {
        return "main chunk".to_owned();
    }

    if !is_tail {
        if let Some(name) = call_site_name(frames, stack, index) {
            return describe_name(name);
        }
    }

    format!(
        "function <{}:{}>",
        proto.chunk_name.display_lossy(),
        proto.reference.line_defined().unwrap_or_default()
    )
}

/// The traceback of the given frames, innermost first.
pub(crate) fn backtrace<'gc>(frames: &[Frame<'gc>], stack: &[Value<'gc>]) -> Vec<BacktraceFrame> {
    let mut backtrace = Vec::new();
    for (i, frame) in frames.iter().enumerate().rev() {
        match frame {
            Frame::Lua(frame) => {
                let proto = frame_closure(stack, frame.bottom).prototype();
                backtrace.push(BacktraceFrame::Lua {
                    chunk_name: proto.chunk_name.display_lossy().to_string(),
                    line_number: proto.line_number(frame.current_pc()),
                    function: describe_lua_function(frames, stack, i),
                    is_tail: frame.is_tail,
                });
            }
            Frame::Sequence { .. } | Frame::Protected { .. } => {
                backtrace.push(BacktraceFrame::Native {
                    name: call_site_name(frames, stack, i).map(describe_name),
                });
            }
            _ => {}
        }
    }
    backtrace
}

/// The traceback entry for a native function called by the top frame.
pub(crate) fn native_frame<'gc>(frames: &[Frame<'gc>], stack: &[Value<'gc>]) -> BacktraceFrame {
    BacktraceFrame::Native {
        name: call_site_name(frames, stack, frames.len()).map(describe_name),
    }
}

/// The frame index of a call level, where level 1 is the top function activation.
///
/// Only Lua frames and native frames which are still in progress count as levels.
pub(crate) fn frame_at_level(frames: &[Frame<'_>], level: usize) -> Option<usize> {
    frames
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, f)| {
            matches!(
                f,
                Frame::Lua(_)
                    | Frame::Sequence { .. }
                    | Frame::Protected { .. }
                    | Frame::Callback { .. }
            )
        })
        .nth(level.checked_sub(1)?)
        .map(|(i, _)| i)
}

/// What the debug library reports about a single call level.
#[derive(Debug, Clone)]
pub struct FrameInfo<'gc> {
    pub function: Option<Function<'gc>>,
    pub prototype: Option<Gc<'gc, FunctionPrototype<'gc>>>,
    pub current_line: Option<LineNumber>,
    pub name: Option<VariableName>,
    pub is_tail: bool,
}

pub(crate) fn frame_info<'gc>(
    frames: &[Frame<'gc>],
    stack: &[Value<'gc>],
    index: usize,
) -> FrameInfo<'gc> {
    match frames[index] {
        Frame::Lua(ref frame) => {
            let closure = frame_closure(stack, frame.bottom);
            let proto = closure.prototype();
            FrameInfo {
                function: Some(Function::Closure(closure)),
                prototype: Some(proto),
                current_line: proto.line_number(frame.current_pc()),
                name: if frame.is_tail {
                    None
                } else {
                    call_site_name(frames, stack, index)
                },
                is_tail: frame.is_tail,
            }
        }
        Frame::Callback { callback, .. } => FrameInfo {
            function: Some(Function::Callback(callback)),
            prototype: None,
            current_line: None,
            name: call_site_name(frames, stack, index),
            is_tail: false,
        },
        _ => FrameInfo {
            function: None,
            prototype: None,
            current_line: None,
            name: call_site_name(frames, stack, index),
            is_tail: false,
        },
    }
}

/// The name and stack slot of local `n` of the Lua frame at `index`.
///
/// Positive `n` counts active locals in declaration order, negative `n` counts varargs.
pub(crate) fn frame_local<'gc>(
    frames: &[Frame<'gc>],
    stack: &[Value<'gc>],
    index: usize,
    n: i64,
) -> Option<(String, usize)> {
    let Frame::Lua(ref frame) = frames[index] else {
        return None;
    };
    let (bottom, base) = (frame.bottom, frame.base);

    if n > 0 {
        let proto = frame_closure(stack, bottom).prototype();
        let local = proto
            .active_locals(frame.current_pc())
            .nth(n as usize - 1)?;
        Some((
            local.name.display_lossy().to_string(),
            base + local.register.0 as usize,
        ))
    } else if n < 0 {
        let var_count = base - bottom - 1;
        let i = n.unsigned_abs() as usize;
        if i <= var_count {
            Some(("(vararg)".to_owned(), bottom + i))
        } else {
            None
        }
    } else {
        None
    }
}

/// `chunk:line:` for the Lua function at `level`, used to position error messages.
pub(crate) fn location<'gc>(
    frames: &[Frame<'gc>],
    stack: &[Value<'gc>],
    level: usize,
) -> Option<String> {
    let index = frame_at_level(frames, level)?;
    let info = frame_info(frames, stack, index);
    let proto = info.prototype?;
    Some(match info.current_line {
        Some(line) => format!("{}:{}:", proto.chunk_name.display_lossy(), line),
        None => format!("{}:", proto.chunk_name.display_lossy()),
    })
}
