use gc_arena::Collect;

use crate::{
    meta_ops::MetaMethod,
    types::{
        ConstantIndex16, ConstantIndex8, Opt254, PrototypeIndex, RegisterIndex, UpValueIndex,
        VarCount,
    },
};

/// Binary arithmetic and bitwise operators sharing the `Arith` / `ArithK` opcodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Collect)]
#[collect(require_static)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn metamethod(self) -> MetaMethod {
        match self {
            ArithOp::Add => MetaMethod::Add,
            ArithOp::Sub => MetaMethod::Sub,
            ArithOp::Mul => MetaMethod::Mul,
            ArithOp::Div => MetaMethod::Div,
            ArithOp::IDiv => MetaMethod::IDiv,
            ArithOp::Mod => MetaMethod::Mod,
            ArithOp::Pow => MetaMethod::Pow,
            ArithOp::BAnd => MetaMethod::BAnd,
            ArithOp::BOr => MetaMethod::BOr,
            ArithOp::BXor => MetaMethod::BXor,
            ArithOp::Shl => MetaMethod::Shl,
            ArithOp::Shr => MetaMethod::Shr,
        }
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }
}

/// The instruction set of the register VM.
///
/// Registers are relative to the base of the running frame. Jump offsets are relative to the
/// opcode *following* the jump.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(require_static)]
pub enum OpCode {
    Move {
        dest: RegisterIndex,
        source: RegisterIndex,
    },
    LoadConstant {
        dest: RegisterIndex,
        constant: ConstantIndex16,
    },
    LoadBool {
        dest: RegisterIndex,
        value: bool,
        skip_next: bool,
    },
    LoadNil {
        dest: RegisterIndex,
        count: u8,
    },
    NewTable {
        dest: RegisterIndex,
    },
    GetTable {
        dest: RegisterIndex,
        table: RegisterIndex,
        key: RegisterIndex,
    },
    SetTable {
        table: RegisterIndex,
        key: RegisterIndex,
        value: RegisterIndex,
    },
    GetField {
        dest: RegisterIndex,
        table: RegisterIndex,
        key: ConstantIndex8,
    },
    SetField {
        table: RegisterIndex,
        key: ConstantIndex8,
        value: RegisterIndex,
    },
    GetUpTable {
        dest: RegisterIndex,
        table: UpValueIndex,
        key: ConstantIndex8,
    },
    SetUpTable {
        table: UpValueIndex,
        key: ConstantIndex8,
        value: RegisterIndex,
    },
    GetUpValue {
        dest: RegisterIndex,
        source: UpValueIndex,
    },
    SetUpValue {
        dest: UpValueIndex,
        source: RegisterIndex,
    },
    /// `base + 1 = table; base = table[key]`, preparing a method call.
    Method {
        base: RegisterIndex,
        table: RegisterIndex,
        key: ConstantIndex8,
    },
    Call {
        func: RegisterIndex,
        args: VarCount,
        returns: VarCount,
    },
    TailCall {
        func: RegisterIndex,
        args: VarCount,
    },
    Return {
        start: RegisterIndex,
        count: VarCount,
    },
    VarArgs {
        dest: RegisterIndex,
        count: VarCount,
    },
    Jump {
        offset: i16,
        close_upvalues: Opt254,
    },
    /// Skips the next opcode if the truthiness of `value` is `is_true`.
    Test {
        value: RegisterIndex,
        is_true: bool,
    },
    /// Skips the next opcode if the truthiness of `value` is `is_true`, otherwise moves `value`
    /// into `dest`.
    TestSet {
        dest: RegisterIndex,
        value: RegisterIndex,
        is_true: bool,
    },
    Closure {
        dest: RegisterIndex,
        proto: PrototypeIndex,
    },
    /// Registers `base..base + 3` hold the initial value, limit and step, `base + 3` is the
    /// visible loop variable. If the loop does not run, jumps by `skip`.
    NumericForPrep {
        base: RegisterIndex,
        skip: i16,
    },
    /// Advances the loop and jumps by `skip` (backwards) if the loop continues.
    NumericForLoop {
        base: RegisterIndex,
        skip: i16,
    },
    /// Registers `base..base + 4` hold the iterator function, state, control variable and closing
    /// value. Calls the iterator and places `var_count` results at `base + 4`.
    GenericForCall {
        base: RegisterIndex,
        var_count: u8,
    },
    /// If `base + 4` is not nil, copies it into the control variable and jumps by `skip`.
    GenericForLoop {
        base: RegisterIndex,
        skip: i16,
    },
    Concat {
        dest: RegisterIndex,
        source: RegisterIndex,
        count: u8,
    },
    Length {
        dest: RegisterIndex,
        source: RegisterIndex,
    },
    Not {
        dest: RegisterIndex,
        source: RegisterIndex,
    },
    Minus {
        dest: RegisterIndex,
        source: RegisterIndex,
    },
    BitNot {
        dest: RegisterIndex,
        source: RegisterIndex,
    },
    Arith {
        op: ArithOp,
        dest: RegisterIndex,
        left: RegisterIndex,
        right: RegisterIndex,
    },
    ArithK {
        op: ArithOp,
        dest: RegisterIndex,
        left: RegisterIndex,
        right: ConstantIndex8,
    },
    /// Skips the next opcode if `(left == right) == skip_if`.
    Eq {
        skip_if: bool,
        left: RegisterIndex,
        right: RegisterIndex,
    },
    EqK {
        skip_if: bool,
        left: RegisterIndex,
        right: ConstantIndex8,
    },
    Less {
        skip_if: bool,
        left: RegisterIndex,
        right: RegisterIndex,
    },
    LessEq {
        skip_if: bool,
        left: RegisterIndex,
        right: RegisterIndex,
    },
    /// Marks `reg` as a to-be-closed variable.
    ToBeClosed {
        reg: RegisterIndex,
    },
    /// Closes upvalues and to-be-closed variables at or above `from`.
    Close {
        from: RegisterIndex,
    },
}

/// The indices an opcode refers to, used to check prototypes.
#[derive(Debug, Default)]
pub(crate) struct Operands {
    pub registers: Vec<usize>,
    pub constant: Option<usize>,
    pub upvalue: Option<usize>,
    pub prototype: Option<usize>,
    pub jump: Option<i16>,
}

impl OpCode {
    pub(crate) fn operands(&self) -> Operands {
        fn r(r: RegisterIndex) -> usize {
            r.0 as usize
        }

        fn range(start: RegisterIndex, count: VarCount) -> Vec<usize> {
            match count.to_constant() {
                Some(0) | None => vec![],
                Some(c) => vec![r(start), r(start) + c as usize - 1],
            }
        }

        let mut o = Operands::default();
        match *self {
            OpCode::Move { dest, source }
            | OpCode::Length { dest, source }
            | OpCode::Not { dest, source }
            | OpCode::Minus { dest, source }
            | OpCode::BitNot { dest, source } => o.registers = vec![r(dest), r(source)],
            OpCode::LoadConstant { dest, constant } => {
                o.registers = vec![r(dest)];
                o.constant = Some(constant.0 as usize);
            }
            OpCode::LoadBool { dest, skip_next, .. } => {
                o.registers = vec![r(dest)];
                if skip_next {
                    o.jump = Some(1);
                }
            }
            OpCode::LoadNil { dest, count } => {
                o.registers = vec![r(dest), r(dest) + count.max(1) as usize - 1]
            }
            OpCode::NewTable { dest } => o.registers = vec![r(dest)],
            OpCode::GetTable { dest, table, key } => {
                o.registers = vec![r(dest), r(table), r(key)]
            }
            OpCode::SetTable { table, key, value } => {
                o.registers = vec![r(table), r(key), r(value)]
            }
            OpCode::GetField { dest, table, key } => {
                o.registers = vec![r(dest), r(table)];
                o.constant = Some(key.0 as usize);
            }
            OpCode::SetField { table, key, value } => {
                o.registers = vec![r(table), r(value)];
                o.constant = Some(key.0 as usize);
            }
            OpCode::GetUpTable { dest, table, key } => {
                o.registers = vec![r(dest)];
                o.upvalue = Some(table.0 as usize);
                o.constant = Some(key.0 as usize);
            }
            OpCode::SetUpTable { table, key, value } => {
                o.registers = vec![r(value)];
                o.upvalue = Some(table.0 as usize);
                o.constant = Some(key.0 as usize);
            }
            OpCode::GetUpValue { dest, source } => {
                o.registers = vec![r(dest)];
                o.upvalue = Some(source.0 as usize);
            }
            OpCode::SetUpValue { dest, source } => {
                o.registers = vec![r(source)];
                o.upvalue = Some(dest.0 as usize);
            }
            OpCode::Method { base, table, key } => {
                o.registers = vec![r(base), r(base) + 1, r(table)];
                o.constant = Some(key.0 as usize);
            }
            OpCode::Call { func, args, .. } | OpCode::TailCall { func, args } => {
                o.registers = vec![r(func)];
                o.registers.extend(range(RegisterIndex(func.0.saturating_add(1)), args));
            }
            OpCode::Return { start, count } => o.registers = range(start, count),
            OpCode::VarArgs { dest, count } => {
                o.registers = vec![r(dest)];
                o.registers.extend(range(dest, count));
            }
            OpCode::Jump { offset, .. } => o.jump = Some(offset),
            OpCode::Test { value, .. } => {
                o.registers = vec![r(value)];
                o.jump = Some(1);
            }
            OpCode::TestSet { dest, value, .. } => {
                o.registers = vec![r(dest), r(value)];
                o.jump = Some(1);
            }
            OpCode::Closure { dest, proto } => {
                o.registers = vec![r(dest)];
                o.prototype = Some(proto.0 as usize);
            }
            OpCode::NumericForPrep { base, skip } | OpCode::NumericForLoop { base, skip } => {
                o.registers = vec![r(base), r(base) + 3];
                o.jump = Some(skip);
            }
            OpCode::GenericForCall { base, var_count } => {
                o.registers = vec![r(base), r(base) + 3 + var_count.max(3) as usize];
            }
            OpCode::GenericForLoop { base, skip } => {
                o.registers = vec![r(base), r(base) + 4];
                o.jump = Some(skip);
            }
            OpCode::Concat {
                dest,
                source,
                count,
            } => {
                o.registers = vec![r(dest), r(source), r(source) + count.max(1) as usize - 1]
            }
            OpCode::Arith {
                dest, left, right, ..
            } => o.registers = vec![r(dest), r(left), r(right)],
            OpCode::ArithK {
                dest, left, right, ..
            } => {
                o.registers = vec![r(dest), r(left)];
                o.constant = Some(right.0 as usize);
            }
            OpCode::Eq { left, right, .. }
            | OpCode::Less { left, right, .. }
            | OpCode::LessEq { left, right, .. } => {
                o.registers = vec![r(left), r(right)];
                o.jump = Some(1);
            }
            OpCode::EqK { left, right, .. } => {
                o.registers = vec![r(left)];
                o.constant = Some(right.0 as usize);
                o.jump = Some(1);
            }
            OpCode::ToBeClosed { reg } => o.registers = vec![r(reg)],
            OpCode::Close { from } => o.registers = vec![r(from)],
        }
        o
    }
}
