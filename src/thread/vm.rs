use allocator_api2::vec;
use gc_arena::{allocator_api::MetricsAlloc, Collect, Gc};

use crate::{
    closure::{FunctionPrototype, UpValue, UpValueState},
    meta_ops::{self, MetaCall, MetaResult, NotClosable},
    number,
    opcode::OpCode,
    types::{ConstantIndex8, RegisterIndex, UpValueDescriptor, UpValueIndex, VarCount},
    BoxSequence, Closure, Constant, Context, Error, Execution, Function, Sequence, SequencePoll,
    Stack, String, Table, Thread, Value,
};

use super::{
    debug::{self, Hook},
    thread::{Fault, Frame, LuaFrame, LuaReturn, MetaReturn, ThreadState},
    VMError, VariableName,
};

/// Runs the top Lua frame for at most `instructions` instructions, or until the top frame may
/// have changed.
///
/// Returns the number of instructions that were not run. Errors are positioned with the
/// `chunk:line:` of the failing instruction, the caller is responsible for raising them.
pub(crate) fn run_vm<'gc>(
    ctx: Context<'gc>,
    thread: Thread<'gc>,
    state: &mut ThreadState<'gc>,
    mut instructions: u32,
) -> Result<u32, Error<'gc>> {
    assert_ne!(instructions, 0);

    let (bottom, base) = {
        let frame = lua_frame(state);
        (frame.bottom, frame.base)
    };
    let closure = debug::frame_closure(&state.stack, bottom);
    let proto = closure.prototype();
    let hook = thread.hook().filter(|hook| hook.is_active());

    let vm = Vm {
        ctx,
        thread,
        closure,
        proto,
        bottom,
        base,
        hook,
    };

    loop {
        if vm.run_hooks(state) {
            break;
        }

        let frame = lua_frame(state);
        let pc = frame.pc;
        let op = proto.opcodes[pc];
        frame.pc += 1;
        instructions -= 1;

        match vm.step(state, op) {
            Ok(Flow::Continue) => {
                if instructions == 0 {
                    break;
                }
            }
            Ok(Flow::Leave) => break,
            Err(fault) => return Err(vm.positioned_error(pc, &op, fault)),
        }
    }

    Ok(instructions)
}

enum Flow {
    Continue,
    /// The top frame may have changed, return to the executor.
    Leave,
}

pub(crate) fn lua_frame<'a>(state: &'a mut ThreadState<'_>) -> &'a mut LuaFrame {
    match state.frames.last_mut() {
        Some(Frame::Lua(frame)) => frame,
        _ => panic!("top frame is not a lua frame"),
    }
}

struct Vm<'gc> {
    ctx: Context<'gc>,
    thread: Thread<'gc>,
    closure: Closure<'gc>,
    proto: Gc<'gc, FunctionPrototype<'gc>>,
    bottom: usize,
    base: usize,
    hook: Option<Hook<'gc>>,
}

impl<'gc> Vm<'gc> {
    fn reg(&self, r: RegisterIndex) -> usize {
        self.base + r.0 as usize
    }

    fn constant(&self, c: ConstantIndex8) -> Value<'gc> {
        self.proto.constants[c.0 as usize].into()
    }

    fn step(&self, state: &mut ThreadState<'gc>, op: OpCode) -> Result<Flow, Fault<'gc>> {
        let ctx = self.ctx;

        match op {
            OpCode::Move { dest, source } => {
                state.stack[self.reg(dest)] = state.stack[self.reg(source)];
            }

            OpCode::LoadConstant { dest, constant } => {
                state.stack[self.reg(dest)] = self.proto.constants[constant.0 as usize].into();
            }

            OpCode::LoadBool {
                dest,
                value,
                skip_next,
            } => {
                state.stack[self.reg(dest)] = Value::Boolean(value);
                if skip_next {
                    lua_frame(state).pc += 1;
                }
            }

            OpCode::LoadNil { dest, count } => {
                let start = self.reg(dest);
                state.stack[start..start + count as usize].fill(Value::Nil);
            }

            OpCode::NewTable { dest } => {
                state.stack[self.reg(dest)] = Value::Table(Table::new(&ctx));
                ctx.check_memory()?;
            }

            OpCode::GetTable { dest, table, key } => {
                let table = state.stack[self.reg(table)];
                let key = state.stack[self.reg(key)];
                return self.store(state, dest, meta_ops::index(ctx, table, key)?);
            }

            OpCode::SetTable { table, key, value } => {
                let table = state.stack[self.reg(table)];
                let key = state.stack[self.reg(key)];
                let value = state.stack[self.reg(value)];
                return self.discard(state, meta_ops::new_index(ctx, table, key, value)?);
            }

            OpCode::GetField { dest, table, key } => {
                let table = state.stack[self.reg(table)];
                let result = meta_ops::index(ctx, table, self.constant(key))?;
                return self.store(state, dest, result);
            }

            OpCode::SetField { table, key, value } => {
                let table = state.stack[self.reg(table)];
                let value = state.stack[self.reg(value)];
                let call = meta_ops::new_index(ctx, table, self.constant(key), value)?;
                return self.discard(state, call);
            }

            OpCode::GetUpTable { dest, table, key } => {
                let table = self.get_upvalue(state, table);
                let result = meta_ops::index(ctx, table, self.constant(key))?;
                return self.store(state, dest, result);
            }

            OpCode::SetUpTable { table, key, value } => {
                let table = self.get_upvalue(state, table);
                let value = state.stack[self.reg(value)];
                let call = meta_ops::new_index(ctx, table, self.constant(key), value)?;
                return self.discard(state, call);
            }

            OpCode::GetUpValue { dest, source } => {
                state.stack[self.reg(dest)] = self.get_upvalue(state, source);
            }

            OpCode::SetUpValue { dest, source } => {
                let value = state.stack[self.reg(source)];
                self.set_upvalue(state, dest, value);
            }

            OpCode::Method { base, table, key } => {
                let table = state.stack[self.reg(table)];
                let result = meta_ops::index(ctx, table, self.constant(key))?;
                state.stack[self.reg(base) + 1] = table;
                return self.store(state, base, result);
            }

            OpCode::Call {
                func,
                args,
                returns,
            } => {
                let func_index = self.reg(func);
                if let Some(args) = args.to_constant() {
                    state.stack.truncate(func_index + 1 + args as usize);
                }
                let frame = lua_frame(state);
                frame.is_variable = false;
                frame.expected_return = Some(LuaReturn::Normal(returns));
                state.call_at(ctx, func_index, false)?;
                return Ok(Flow::Leave);
            }

            OpCode::TailCall { func, args } => {
                if state.has_tbc(self.bottom) {
                    return Err(VMError::TailCallTbc.into());
                }

                let func_index = self.reg(func);
                if let Some(args) = args.to_constant() {
                    state.stack.truncate(func_index + 1 + args as usize);
                }
                let function = state.resolve_call(ctx, func_index)?;

                state.close_upvalues(&ctx, self.bottom);
                let len = state.stack.len() - func_index;
                state.stack.copy_within(func_index.., self.bottom);
                state.stack.truncate(self.bottom + len);
                state.frames.pop();
                state.call_function(ctx, self.bottom, function, true)?;
                return Ok(Flow::Leave);
            }

            OpCode::Return { start, count } => {
                if state.has_tbc(self.bottom) {
                    state.close_upvalues(&ctx, self.bottom);
                    lua_frame(state).reenter();
                    self.close_next(state, self.bottom)?;
                    return Ok(Flow::Leave);
                }

                if self.run_return_hook(state) {
                    return Ok(Flow::Leave);
                }

                let start = self.reg(start);
                let count = match count.to_constant() {
                    Some(count) => count as usize,
                    None => state.stack.len() - start,
                };

                state.frames.pop();
                state.close_upvalues(&ctx, self.bottom);
                state.stack.copy_within(start..start + count, self.bottom);
                state.stack.truncate(self.bottom + count);
                state.return_to(self.bottom);
                return Ok(Flow::Leave);
            }

            OpCode::VarArgs { dest, count } => {
                let var_start = self.bottom + 1;
                let var_count = self.base - var_start;
                let dest = self.reg(dest);
                match count.to_constant() {
                    Some(count) => {
                        for i in 0..count as usize {
                            state.stack[dest + i] = if i < var_count {
                                state.stack[var_start + i]
                            } else {
                                Value::Nil
                            };
                        }
                    }
                    None => {
                        state.ensure_stack(ctx, dest + var_count)?;
                        state.stack.truncate(dest);
                        state
                            .stack
                            .extend_from_within(var_start..var_start + var_count);
                        lua_frame(state).is_variable = true;
                    }
                }
            }

            OpCode::Jump {
                offset,
                close_upvalues,
            } => {
                if let Some(r) = close_upvalues.to_u8() {
                    state.close_upvalues(&ctx, self.reg(RegisterIndex(r)));
                }
                jump(lua_frame(state), offset);
            }

            OpCode::Test { value, is_true } => {
                if state.stack[self.reg(value)].to_bool() == is_true {
                    lua_frame(state).pc += 1;
                }
            }

            OpCode::TestSet {
                dest,
                value,
                is_true,
            } => {
                let value = state.stack[self.reg(value)];
                if value.to_bool() == is_true {
                    lua_frame(state).pc += 1;
                } else {
                    state.stack[self.reg(dest)] = value;
                }
            }

            OpCode::Closure { dest, proto } => {
                let proto = self.proto.prototypes[proto.0 as usize];
                let mut upvalues =
                    vec::Vec::with_capacity_in(proto.upvalues.len(), MetricsAlloc::new(&ctx));
                for &desc in proto.upvalues.iter() {
                    upvalues.push(match desc {
                        UpValueDescriptor::ParentLocal(reg) => {
                            state.open_upvalue(&ctx, self.thread, self.reg(reg))
                        }
                        UpValueDescriptor::Outer(i) => self.closure.upvalues()[i.0 as usize],
                    });
                }
                let closure = Closure::from_parts(&ctx, proto, upvalues);
                state.stack[self.reg(dest)] = closure.into();
                ctx.check_memory()?;
            }

            OpCode::NumericForPrep { base, skip } => {
                if !for_prep(&mut state.stack[self.reg(base)..self.reg(base) + 4])? {
                    jump(lua_frame(state), skip);
                }
            }

            OpCode::NumericForLoop { base, skip } => {
                if for_loop(&mut state.stack[self.reg(base)..self.reg(base) + 4]) {
                    jump(lua_frame(state), skip);
                }
            }

            OpCode::GenericForCall { base, var_count } => {
                let base = self.reg(base);
                state.stack.truncate(base + 4);
                state.stack.extend_from_within(base..base + 3);
                let frame = lua_frame(state);
                frame.is_variable = false;
                frame.expected_return = Some(LuaReturn::Normal(VarCount::constant(var_count)));
                state.call_at(ctx, base + 4, false)?;
                return Ok(Flow::Leave);
            }

            OpCode::GenericForLoop { base, skip } => {
                let base = self.reg(base);
                let control = state.stack[base + 4];
                if !control.is_nil() {
                    state.stack[base + 2] = control;
                    jump(lua_frame(state), skip);
                }
            }

            OpCode::Concat {
                dest,
                source,
                count,
            } => return self.concat(state, dest, source, count),

            OpCode::Length { dest, source } => {
                let result = meta_ops::len(ctx, state.stack[self.reg(source)])?;
                return self.store(state, dest, result);
            }

            OpCode::Not { dest, source } => {
                state.stack[self.reg(dest)] = Value::Boolean(!state.stack[self.reg(source)].to_bool());
            }

            OpCode::Minus { dest, source } => {
                let result = meta_ops::negate(ctx, state.stack[self.reg(source)])?;
                return self.store(state, dest, result);
            }

            OpCode::BitNot { dest, source } => {
                let result = meta_ops::bitwise_not(ctx, state.stack[self.reg(source)])?;
                return self.store(state, dest, result);
            }

            OpCode::Arith {
                op,
                dest,
                left,
                right,
            } => {
                let left = state.stack[self.reg(left)];
                let right = state.stack[self.reg(right)];
                let result = meta_ops::arithmetic(ctx, op, left, right)?;
                return self.store(state, dest, result);
            }

            OpCode::ArithK {
                op,
                dest,
                left,
                right,
            } => {
                let left = state.stack[self.reg(left)];
                let result = meta_ops::arithmetic(ctx, op, left, self.constant(right))?;
                return self.store(state, dest, result);
            }

            OpCode::Eq {
                skip_if,
                left,
                right,
            } => {
                let left = state.stack[self.reg(left)];
                let right = state.stack[self.reg(right)];
                let result = meta_ops::equal(ctx, left, right)?;
                return self.compare(state, skip_if, result);
            }

            OpCode::EqK {
                skip_if,
                left,
                right,
            } => {
                let left = state.stack[self.reg(left)];
                let result = meta_ops::equal(ctx, left, self.constant(right))?;
                return self.compare(state, skip_if, result);
            }

            OpCode::Less {
                skip_if,
                left,
                right,
            } => {
                let left = state.stack[self.reg(left)];
                let right = state.stack[self.reg(right)];
                let result = meta_ops::less_than(ctx, left, right)?;
                return self.compare(state, skip_if, result);
            }

            OpCode::LessEq {
                skip_if,
                left,
                right,
            } => {
                let left = state.stack[self.reg(left)];
                let right = state.stack[self.reg(right)];
                let result = meta_ops::less_equal(ctx, left, right)?;
                return self.compare(state, skip_if, result);
            }

            OpCode::ToBeClosed { reg } => {
                let index = self.reg(reg);
                match meta_ops::close(ctx, state.stack[index]) {
                    Ok(None) => {}
                    Ok(Some(_)) => state.tbc.push(index),
                    Err(NotClosable) => {
                        let pc = lua_frame(state).current_pc();
                        return Err(VMError::NonClosable(self.local_name(pc, reg)).into());
                    }
                }
            }

            OpCode::Close { from } => {
                let from = self.reg(from);
                state.close_upvalues(&ctx, from);
                if state.has_tbc(from) {
                    lua_frame(state).reenter();
                    self.close_next(state, from)?;
                    return Ok(Flow::Leave);
                }
            }
        }

        Ok(Flow::Continue)
    }

    fn local_name(&self, pc: usize, reg: RegisterIndex) -> std::string::String {
        self.proto
            .local_name(reg, pc)
            .map(|name| name.display_lossy().to_string())
            .unwrap_or_else(|| "?".to_owned())
    }

    fn get_upvalue(&self, state: &ThreadState<'gc>, index: UpValueIndex) -> Value<'gc> {
        let upvalue = self.closure.upvalues()[index.0 as usize];
        match upvalue.get() {
            UpValueState::Open(open) if open.thread == self.thread => state.stack[open.stack_index],
            UpValueState::Open(open) => match open.thread.try_state() {
                Some(other) => other.stack[open.stack_index],
                None => panic!("upvalue is open on a running thread"),
            },
            UpValueState::Closed(value) => value,
        }
    }

    fn set_upvalue(&self, state: &mut ThreadState<'gc>, index: UpValueIndex, value: Value<'gc>) {
        let upvalue: UpValue<'gc> = self.closure.upvalues()[index.0 as usize];
        match upvalue.get() {
            UpValueState::Open(open) if open.thread == self.thread => {
                state.stack[open.stack_index] = value;
            }
            UpValueState::Open(open) => match open.thread.try_state_mut(&self.ctx) {
                Some(mut other) => other.stack[open.stack_index] = value,
                None => panic!("upvalue is open on a running thread"),
            },
            UpValueState::Closed(_) => upvalue.set(&self.ctx, UpValueState::Closed(value)),
        }
    }

    /// Place the result of an operator in `dest`, calling its metamethod if there is one.
    fn store<const N: usize>(
        &self,
        state: &mut ThreadState<'gc>,
        dest: RegisterIndex,
        result: MetaResult<'gc, N>,
    ) -> Result<Flow, Fault<'gc>> {
        match result {
            MetaResult::Value(v) => {
                state.stack[self.reg(dest)] = v;
                Ok(Flow::Continue)
            }
            MetaResult::Call(call) => {
                self.meta_call(state, call, MetaReturn::Register(dest))?;
                Ok(Flow::Leave)
            }
        }
    }

    fn discard<const N: usize>(
        &self,
        state: &mut ThreadState<'gc>,
        call: Option<MetaCall<'gc, N>>,
    ) -> Result<Flow, Fault<'gc>> {
        match call {
            None => Ok(Flow::Continue),
            Some(call) => {
                self.meta_call(state, call, MetaReturn::None)?;
                Ok(Flow::Leave)
            }
        }
    }

    fn compare(
        &self,
        state: &mut ThreadState<'gc>,
        skip_if: bool,
        result: MetaResult<'gc, 2>,
    ) -> Result<Flow, Fault<'gc>> {
        match result {
            MetaResult::Value(v) => {
                if v.to_bool() == skip_if {
                    lua_frame(state).pc += 1;
                }
                Ok(Flow::Continue)
            }
            MetaResult::Call(call) => {
                self.meta_call(state, call, MetaReturn::SkipIf(skip_if))?;
                Ok(Flow::Leave)
            }
        }
    }

    fn meta_call<const N: usize>(
        &self,
        state: &mut ThreadState<'gc>,
        call: MetaCall<'gc, N>,
        ret: MetaReturn,
    ) -> Result<(), Fault<'gc>> {
        lua_frame(state).expected_return = Some(LuaReturn::Meta(ret));
        let func_index = state.stack.len();
        state.ensure_stack(self.ctx, func_index + 1 + N)?;
        state.stack.push(call.function.into());
        state.stack.extend(call.args);
        state.call_function(self.ctx, func_index, call.function, false)
    }

    /// Call the `__close` metamethod of the highest pending to-be-closed variable at or above
    /// `from`.
    ///
    /// The calling instruction must already be set up to run again, the callee frame is pushed on
    /// top of it.
    fn close_next(&self, state: &mut ThreadState<'gc>, from: usize) -> Result<(), Fault<'gc>> {
        let Some(index) = state.pop_tbc(from) else {
            return Ok(());
        };
        let value = state.stack[index];
        match meta_ops::close(self.ctx, value) {
            Ok(None) => Ok(()),
            Ok(Some(mm)) => {
                lua_frame(state).expected_return = Some(LuaReturn::Meta(MetaReturn::None));
                let func_index = state.stack.len();
                state.ensure_stack(self.ctx, func_index + 3)?;
                state.stack.extend([mm, value, Value::Nil]);
                state.call_at(self.ctx, func_index, false)
            }
            Err(NotClosable) => {
                let pc = lua_frame(state).current_pc();
                let reg = RegisterIndex((index - self.base) as u8);
                Err(VMError::NonClosable(self.local_name(pc, reg)).into())
            }
        }
    }

    /// Concatenate the `count` values at `source`, right to left.
    ///
    /// A `__concat` call leaves the number of values still to be joined in the frame, and the
    /// instruction runs again with them once the call returns.
    fn concat(
        &self,
        state: &mut ThreadState<'gc>,
        dest: RegisterIndex,
        source: RegisterIndex,
        count: u8,
    ) -> Result<Flow, Fault<'gc>> {
        let ctx = self.ctx;
        let first = self.reg(source);
        let mut n = lua_frame(state).pending_concat.take().unwrap_or(count) as usize;

        while n > 1 {
            let run = state.stack[first..first + n]
                .iter()
                .rev()
                .take_while(|v| matches!(v, Value::String(_) | Value::Integer(_) | Value::Number(_)))
                .count();
            if run >= 2 {
                if let Ok(s) = String::concat(ctx, &state.stack[first + n - run..first + n]) {
                    state.stack[first + n - run] = Value::String(s);
                    n = n - run + 1;
                    continue;
                }
            }

            let left = RegisterIndex(source.0 + n as u8 - 2);
            let right = RegisterIndex(source.0 + n as u8 - 1);
            let result = meta_ops::concat(ctx, state.stack[self.reg(left)], state.stack[self.reg(right)])
                .map_err(|error| {
                    let pc = lua_frame(state).current_pc();
                    let reg = if error.operand() == Some(1) { right } else { left };
                    VMError::Operator {
                        error,
                        variable: debug::register_name(&self.proto, pc, reg),
                    }
                })?;
            match result {
                MetaResult::Value(v) => {
                    state.stack[self.reg(left)] = v;
                    n -= 1;
                }
                MetaResult::Call(call) => {
                    let frame = lua_frame(state);
                    frame.pending_concat = Some(n as u8 - 1);
                    frame.reenter();
                    self.meta_call(state, call, MetaReturn::Register(left))?;
                    return Ok(Flow::Leave);
                }
            }
        }

        state.stack[self.reg(dest)] = state.stack[first];
        ctx.check_memory()?;
        Ok(Flow::Continue)
    }

    /// Run the call, count and line hooks due before the instruction at the frame's pc.
    ///
    /// Returns true if a hook call was pushed, the instruction then runs once the hook returns.
    fn run_hooks(&self, state: &mut ThreadState<'gc>) -> bool {
        let in_hook = state.hook_depth > 0;
        let frame = lua_frame(state);
        let pc = frame.pc;
        if frame.hooked_pc.take() == Some(pc) {
            return false;
        }
        let Some(hook) = self.hook else {
            return false;
        };
        if in_hook {
            return false;
        }

        let mut events = Vec::new();
        if !frame.entered {
            frame.entered = true;
            if hook.mask.call && pc == 0 {
                events.push((if frame.is_tail { "tail call" } else { "call" }, None));
            }
        }
        if self.thread.tick_hook_counter(hook.count) {
            events.push(("count", None));
        }
        if hook.mask.line {
            let line = self.proto.line_number(pc);
            let new_line = match frame.hook_last_pc {
                None => true,
                Some(last) => pc <= last || self.proto.line_number(last) != line,
            };
            if let (true, Some(line)) = (new_line, line) {
                events.push(("line", Some(line.0 as i64)));
            }
        }
        frame.hook_last_pc = Some(pc);

        if events.is_empty() {
            return false;
        }
        frame.hooked_pc = Some(pc);
        self.push_hook(state, hook, events);
        true
    }

    fn run_return_hook(&self, state: &mut ThreadState<'gc>) -> bool {
        let in_hook = state.hook_depth > 0;
        let frame = lua_frame(state);
        match self.hook {
            Some(hook) if hook.mask.ret && !frame.return_hooked && !in_hook => {
                frame.return_hooked = true;
                frame.reenter();
                self.push_hook(state, hook, std::vec![("return", None)]);
                true
            }
            _ => false,
        }
    }

    fn push_hook(
        &self,
        state: &mut ThreadState<'gc>,
        hook: Hook<'gc>,
        events: Vec<(&'static str, Option<i64>)>,
    ) {
        let bottom = state.stack.len();
        state.frames.push(Frame::Hook { bottom });
        state.hook_depth += 1;
        state.frames.push(Frame::Sequence {
            bottom,
            sequence: BoxSequence::new(
                &self.ctx,
                HookSequence {
                    function: hook.function,
                    events,
                    next: 0,
                },
            ),
            pending_error: None,
        });
    }

    /// Turn a failure of the instruction at `pc` into a script error, naming the offending
    /// variable and prefixing the position.
    fn positioned_error(&self, pc: usize, op: &OpCode, fault: Fault<'gc>) -> Error<'gc> {
        let mut error = match fault {
            Fault::Error(error) => return error,
            Fault::VM(error) => error,
        };

        if let VMError::Operator { error, variable } = &mut error {
            if variable.is_none() {
                *variable = error
                    .operand()
                    .and_then(|i| operator_operands(op).get(i).copied().flatten())
                    .and_then(|operand| operand_name(&self.proto, pc, operand));
            }
        }

        let chunk = self.proto.chunk_name.display_lossy();
        let message = match self.proto.line_number(pc) {
            Some(line) => format!("{}:{}: {}", chunk, line, error),
            None => format!("{}:?: {}", chunk, error),
        };
        Error::message(self.ctx, message)
    }
}

fn jump(frame: &mut LuaFrame, offset: i16) {
    frame.pc = (frame.pc as isize + offset as isize) as usize;
}

#[derive(Copy, Clone)]
enum Operand {
    Register(RegisterIndex),
    UpValue(UpValueIndex),
    Constant(ConstantIndex8),
    ForIterator,
}

/// The operands of an instruction in the order operator errors count them.
fn operator_operands(op: &OpCode) -> [Option<Operand>; 2] {
    match *op {
        OpCode::GetTable { table, key, .. } | OpCode::SetTable { table, key, .. } => [
            Some(Operand::Register(table)),
            Some(Operand::Register(key)),
        ],
        OpCode::GetField { table, key, .. }
        | OpCode::SetField { table, key, .. }
        | OpCode::Method { table, key, .. } => [
            Some(Operand::Register(table)),
            Some(Operand::Constant(key)),
        ],
        OpCode::GetUpTable { table, key, .. } | OpCode::SetUpTable { table, key, .. } => [
            Some(Operand::UpValue(table)),
            Some(Operand::Constant(key)),
        ],
        OpCode::Call { func, .. } | OpCode::TailCall { func, .. } => {
            [Some(Operand::Register(func)), None]
        }
        OpCode::GenericForCall { .. } => [Some(Operand::ForIterator), None],
        OpCode::Length { source, .. }
        | OpCode::Minus { source, .. }
        | OpCode::BitNot { source, .. } => [Some(Operand::Register(source)), None],
        OpCode::Arith { left, right, .. } => [
            Some(Operand::Register(left)),
            Some(Operand::Register(right)),
        ],
        OpCode::ArithK { left, right, .. } => [
            Some(Operand::Register(left)),
            Some(Operand::Constant(right)),
        ],
        _ => [None, None],
    }
}

fn operand_name<'gc>(
    proto: &FunctionPrototype<'gc>,
    pc: usize,
    operand: Operand,
) -> Option<VariableName> {
    match operand {
        Operand::Register(reg) => debug::register_name(proto, pc, reg),
        Operand::UpValue(index) => Some(VariableName {
            kind: "upvalue",
            name: proto
                .upvalue_names
                .get(index.0 as usize)?
                .display_lossy()
                .to_string(),
        }),
        Operand::Constant(index) => match proto.constants.get(index.0 as usize)? {
            Constant::String(s) => Some(VariableName {
                kind: "constant",
                name: s.display_lossy().to_string(),
            }),
            _ => None,
        },
        Operand::ForIterator => Some(VariableName {
            kind: "for iterator",
            name: "for iterator".to_owned(),
        }),
    }
}

/// Prepare a numeric for loop in `regs` (initial value, limit, step, loop variable), returns
/// false if the loop should be skipped.
///
/// Integer loops keep the remaining iteration count in the limit slot, as an unsigned count.
fn for_prep(regs: &mut [Value<'_>]) -> Result<bool, VMError> {
    fn number(v: Value<'_>, what: &'static str) -> Result<f64, VMError> {
        match v {
            Value::Integer(i) => Ok(i as f64),
            Value::Number(n) => Ok(n),
            _ => Err(VMError::ForType(what)),
        }
    }

    match (regs[0], regs[2]) {
        (Value::Integer(init), Value::Integer(step)) => {
            if step == 0 {
                return Err(VMError::ForZeroStep);
            }
            let Some(limit) = for_limit(regs[1], init, step)? else {
                return Ok(false);
            };
            let count = if step > 0 {
                (limit as u64).wrapping_sub(init as u64) / step as u64
            } else {
                (init as u64).wrapping_sub(limit as u64) / ((-(step + 1)) as u64 + 1)
            };
            regs[1] = Value::Integer(count as i64);
            regs[3] = Value::Integer(init);
            Ok(true)
        }
        (init, step) => {
            let limit = number(regs[1], "limit")?;
            let step = number(step, "step")?;
            let init = number(init, "initial value")?;
            if step == 0.0 {
                return Err(VMError::ForZeroStep);
            }
            if if step > 0.0 { limit < init } else { init < limit } {
                return Ok(false);
            }
            regs[0] = Value::Number(init);
            regs[1] = Value::Number(limit);
            regs[2] = Value::Number(step);
            regs[3] = Value::Number(init);
            Ok(true)
        }
    }
}

/// Convert the limit of an integer loop to an integer, clipping floats towards the loop.
///
/// Returns `None` if the loop should not run at all.
fn for_limit(limit: Value<'_>, init: i64, step: i64) -> Result<Option<i64>, VMError> {
    let limit = match limit {
        Value::Integer(i) => i,
        Value::Number(f) => {
            let clipped = if step < 0 {
                number::float_ceil_to_integer(f)
            } else {
                number::float_floor_to_integer(f)
            };
            match clipped {
                Some(i) => i,
                // Out of range or NaN.
                None if f > 0.0 => {
                    if step < 0 {
                        return Ok(None);
                    }
                    i64::MAX
                }
                None => {
                    if step > 0 {
                        return Ok(None);
                    }
                    i64::MIN
                }
            }
        }
        _ => return Err(VMError::ForType("limit")),
    };

    if if step > 0 { init > limit } else { init < limit } {
        Ok(None)
    } else {
        Ok(Some(limit))
    }
}

/// Advance a numeric for loop, returns true if the loop body should run again.
fn for_loop(regs: &mut [Value<'_>]) -> bool {
    match (regs[0], regs[1], regs[2]) {
        (Value::Integer(index), Value::Integer(count), Value::Integer(step)) => {
            let count = count as u64;
            if count == 0 {
                return false;
            }
            let index = index.wrapping_add(step);
            regs[0] = Value::Integer(index);
            regs[1] = Value::Integer((count - 1) as i64);
            regs[3] = Value::Integer(index);
            true
        }
        (Value::Number(index), Value::Number(limit), Value::Number(step)) => {
            let index = index + step;
            let continues = if step > 0.0 {
                index <= limit
            } else {
                limit <= index
            };
            if continues {
                regs[0] = Value::Number(index);
                regs[3] = Value::Number(index);
            }
            continues
        }
        _ => panic!("numeric for loop registers were not prepared"),
    }
}

/// Calls a hook function once for every pending event.
#[derive(Collect)]
#[collect(no_drop)]
struct HookSequence<'gc> {
    function: Function<'gc>,
    #[collect(require_static)]
    events: Vec<(&'static str, Option<i64>)>,
    next: usize,
}

impl<'gc> Sequence<'gc> for HookSequence<'gc> {
    fn poll(
        &mut self,
        ctx: Context<'gc>,
        _exec: Execution<'gc, '_>,
        mut stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>> {
        stack.clear();
        match self.events.get(self.next) {
            Some(&(event, line)) => {
                self.next += 1;
                stack.push_back(Value::String(ctx.intern_static(event.as_bytes())));
                if let Some(line) = line {
                    stack.push_back(Value::Integer(line));
                }
                Ok(SequencePoll::Call {
                    function: self.function,
                    is_tail: false,
                })
            }
            None => Ok(SequencePoll::Return),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_prep_integer() {
        let mut regs = [
            Value::Integer(1),
            Value::Integer(10),
            Value::Integer(3),
            Value::Nil,
        ];
        assert!(for_prep(&mut regs).unwrap());
        assert_eq!(regs[1], Value::Integer(3));
        let mut seen = std::vec![regs[3]];
        while for_loop(&mut regs) {
            seen.push(regs[3]);
        }
        assert_eq!(
            seen,
            [1, 4, 7, 10].map(Value::Integer).to_vec()
        );
    }

    #[test]
    fn test_for_prep_edges() {
        let mut regs = [
            Value::Integer(i64::MAX - 1),
            Value::Number(f64::INFINITY),
            Value::Integer(1),
            Value::Nil,
        ];
        assert!(for_prep(&mut regs).unwrap());
        assert!(for_loop(&mut regs));
        assert_eq!(regs[3], Value::Integer(i64::MAX));
        assert!(!for_loop(&mut regs));

        let mut regs = [Value::Integer(1), Value::Number(0.5), Value::Integer(1), Value::Nil];
        assert!(!for_prep(&mut regs).unwrap());

        let mut regs = [Value::Integer(3), Value::Number(1.5), Value::Integer(-1), Value::Nil];
        assert!(for_prep(&mut regs).unwrap());
        assert_eq!(regs[1], Value::Integer(1));

        let mut regs = [Value::Integer(1), Value::Integer(2), Value::Integer(0), Value::Nil];
        assert!(matches!(for_prep(&mut regs), Err(VMError::ForZeroStep)));

        let mut regs = [Value::Boolean(true), Value::Integer(2), Value::Integer(1), Value::Nil];
        assert_eq!(
            for_prep(&mut regs).unwrap_err().to_string(),
            "'for' initial value must be a number"
        );
    }

    #[test]
    fn test_for_float() {
        let mut regs = [
            Value::Number(0.0),
            Value::Integer(1),
            Value::Number(0.25),
            Value::Nil,
        ];
        assert!(for_prep(&mut regs).unwrap());
        let mut count = 1;
        while for_loop(&mut regs) {
            count += 1;
        }
        assert_eq!(count, 5);
        assert_eq!(regs[3], Value::Number(1.0));
    }
}
