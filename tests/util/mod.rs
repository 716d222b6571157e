#![allow(dead_code)]

use sil::{
    compiled::LocalVariable,
    types::{RegisterIndex, UpValueDescriptor, UpValueIndex},
    Closure, CompiledPrototype, Constant, Context, Executor, ExternError, FromMultiValue,
    FunctionPrototype, FunctionRef, LineNumber, Lua, StashedExecutor,
};

pub use sil::{
    opcode::{ArithOp, OpCode},
    types::{ConstantIndex16, ConstantIndex8, Opt254, PrototypeIndex, VarCount},
};

pub type Proto = CompiledPrototype<&'static str>;

/// Builds prototypes by hand, every opcode sits on its own line starting from line 1.
pub struct Builder {
    proto: Proto,
}

impl Builder {
    /// A top-level chunk, taking `_ENV` as its only upvalue.
    pub fn chunk(stack_size: u16) -> Self {
        Builder {
            proto: CompiledPrototype {
                reference: FunctionRef::Chunk,
                fixed_params: 0,
                has_varargs: true,
                stack_size,
                constants: Vec::new(),
                opcodes: Vec::new(),
                opcode_line_numbers: Vec::new(),
                upvalues: vec![UpValueDescriptor::Outer(UpValueIndex(0))],
                upvalue_names: vec!["_ENV"],
                locals: Vec::new(),
                prototypes: Vec::new(),
            },
        }
    }

    /// A named function defined at `line`, without upvalues.
    pub fn function(name: &'static str, line: u64, params: u8, stack_size: u16) -> Self {
        Builder {
            proto: CompiledPrototype {
                reference: FunctionRef::Named(name, LineNumber(line)),
                fixed_params: params,
                has_varargs: false,
                stack_size,
                constants: Vec::new(),
                opcodes: Vec::new(),
                opcode_line_numbers: Vec::new(),
                upvalues: Vec::new(),
                upvalue_names: Vec::new(),
                locals: Vec::new(),
                prototypes: Vec::new(),
            },
        }
    }

    pub fn varargs(mut self) -> Self {
        self.proto.has_varargs = true;
        self
    }

    pub fn constants(mut self, constants: impl IntoIterator<Item = Constant<&'static str>>) -> Self {
        self.proto.constants.extend(constants);
        self
    }

    pub fn upvalue(mut self, name: &'static str, desc: UpValueDescriptor) -> Self {
        self.proto.upvalues.push(desc);
        self.proto.upvalue_names.push(name);
        self
    }

    pub fn local(mut self, name: &'static str, register: u8, start_pc: usize, end_pc: usize) -> Self {
        self.proto.locals.push(LocalVariable {
            name,
            register: RegisterIndex(register),
            start_pc,
            end_pc,
        });
        self
    }

    pub fn prototype(mut self, proto: Proto) -> Self {
        self.proto.prototypes.push(proto);
        self
    }

    pub fn code(mut self, opcodes: impl IntoIterator<Item = OpCode>) -> Proto {
        let first_line = self.proto.reference.line_defined().map_or(1, |l| l.0);
        self.proto.opcodes.extend(opcodes);
        self.proto.opcode_line_numbers = (0..self.proto.opcodes.len())
            .map(|pc| (pc, LineNumber(first_line + pc as u64)))
            .collect();
        self.proto
            .validate()
            .expect("hand assembled prototype is invalid");
        self.proto
    }
}

pub fn r(i: u8) -> RegisterIndex {
    RegisterIndex(i)
}

pub fn k(i: u8) -> ConstantIndex8 {
    ConstantIndex8(i)
}

pub fn k16(i: u16) -> ConstantIndex16 {
    ConstantIndex16(i)
}

pub fn up(i: u8) -> UpValueIndex {
    UpValueIndex(i)
}

pub fn fixed(n: u8) -> VarCount {
    VarCount::constant(n)
}

pub fn var() -> VarCount {
    VarCount::variable()
}

/// `dest = _ENV[name]`, with `name` at constant `key`.
pub fn get_global(dest: u8, key: u8) -> OpCode {
    OpCode::GetUpTable {
        dest: r(dest),
        table: up(0),
        key: k(key),
    }
}

pub fn set_global(key: u8, value: u8) -> OpCode {
    OpCode::SetUpTable {
        table: up(0),
        key: k(key),
        value: r(value),
    }
}

pub fn load(dest: u8, constant: u16) -> OpCode {
    OpCode::LoadConstant {
        dest: r(dest),
        constant: k16(constant),
    }
}

pub fn call(func: u8, args: VarCount, returns: VarCount) -> OpCode {
    OpCode::Call {
        func: r(func),
        args,
        returns,
    }
}

pub fn ret(start: u8, count: VarCount) -> OpCode {
    OpCode::Return {
        start: r(start),
        count,
    }
}

pub fn closure(dest: u8, proto: u8) -> OpCode {
    OpCode::Closure {
        dest: r(dest),
        proto: PrototypeIndex(proto),
    }
}

pub fn jump(offset: i16) -> OpCode {
    OpCode::Jump {
        offset,
        close_upvalues: Opt254::none(),
    }
}

pub fn closure_for<'gc>(ctx: Context<'gc>, proto: &Proto) -> Closure<'gc> {
    let fp = FunctionPrototype::from_compiled_map_strings(
        &ctx,
        ctx.intern_static(b"test"),
        proto,
        |s| ctx.intern(s.as_bytes()),
    );
    Closure::new(&ctx, fp, Some(ctx.globals()))
}

pub fn start(lua: &mut Lua, proto: &Proto) -> StashedExecutor {
    lua.enter(|ctx| {
        let closure = closure_for(ctx, proto);
        ctx.stash(Executor::start(ctx, closure.into(), ()))
    })
}

pub fn run<R: for<'gc> FromMultiValue<'gc>>(lua: &mut Lua, proto: &Proto) -> Result<R, ExternError> {
    let executor = start(lua, proto);
    lua.execute::<R>(&executor)
}

/// The error value of a failed run, as a string.
pub fn error_message(err: &ExternError) -> String {
    err.root_cause().to_string()
}
