//! The prototype format handed to the runtime by an external compiler or loader.
//!
//! Nothing in this crate produces `CompiledPrototype`s from source text. Prototypes are trusted:
//! the VM only asserts on malformed bytecode, [`CompiledPrototype::validate`] exists for loaders
//! that want to check a prototype up front.

use std::fmt;

use gc_arena::Collect;
use thiserror::Error;

use crate::{
    opcode::OpCode,
    types::{RegisterIndex, UpValueDescriptor},
    Constant,
};

/// A source line number, starting from 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Collect)]
#[collect(require_static)]
pub struct LineNumber(pub u64);

impl fmt::Display for LineNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a function was defined, used for diagnostics.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub enum FunctionRef<S> {
    /// A function declared with a name, `function name() ... end`.
    Named(S, LineNumber),
    /// An anonymous function expression.
    Expression(LineNumber),
    /// The top-level chunk.
    Chunk,
}

impl<S> FunctionRef<S> {
    pub fn as_string_ref(&self) -> FunctionRef<&S> {
        match self {
            FunctionRef::Named(n, l) => FunctionRef::Named(n, *l),
            FunctionRef::Expression(l) => FunctionRef::Expression(*l),
            FunctionRef::Chunk => FunctionRef::Chunk,
        }
    }

    pub fn map_strings<S2>(self, f: impl Fn(S) -> S2) -> FunctionRef<S2> {
        match self {
            FunctionRef::Named(n, l) => FunctionRef::Named(f(n), l),
            FunctionRef::Expression(l) => FunctionRef::Expression(l),
            FunctionRef::Chunk => FunctionRef::Chunk,
        }
    }

    pub fn line_defined(&self) -> Option<LineNumber> {
        match self {
            FunctionRef::Named(_, l) | FunctionRef::Expression(l) => Some(*l),
            FunctionRef::Chunk => None,
        }
    }
}

/// Debug information for a local variable, live for the opcodes in `start_pc..end_pc`.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct LocalVariable<S> {
    pub name: S,
    pub register: RegisterIndex,
    pub start_pc: usize,
    pub end_pc: usize,
}

impl<S> LocalVariable<S> {
    pub fn map_string<S2>(self, f: impl Fn(S) -> S2) -> LocalVariable<S2> {
        LocalVariable {
            name: f(self.name),
            register: self.register,
            start_pc: self.start_pc,
            end_pc: self.end_pc,
        }
    }

    pub fn is_active(&self, pc: usize) -> bool {
        self.start_pc <= pc && pc < self.end_pc
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPrototype<S> {
    pub reference: FunctionRef<S>,
    pub fixed_params: u8,
    pub has_varargs: bool,
    pub stack_size: u16,
    pub constants: Vec<Constant<S>>,
    pub opcodes: Vec<OpCode>,
    /// Sorted by opcode index, each entry gives the line of every opcode from that index up to the
    /// next entry.
    pub opcode_line_numbers: Vec<(usize, LineNumber)>,
    pub upvalues: Vec<UpValueDescriptor>,
    pub upvalue_names: Vec<S>,
    pub locals: Vec<LocalVariable<S>>,
    pub prototypes: Vec<CompiledPrototype<S>>,
}

#[derive(Debug, Clone, Error)]
pub enum PrototypeError {
    #[error("opcode {pc} uses register {register} outside of stack size {stack_size}")]
    RegisterOutOfRange {
        pc: usize,
        register: usize,
        stack_size: u16,
    },
    #[error("opcode {pc} uses constant {constant} but there are only {count}")]
    ConstantOutOfRange {
        pc: usize,
        constant: usize,
        count: usize,
    },
    #[error("opcode {pc} uses upvalue {upvalue} but there are only {count}")]
    UpValueOutOfRange {
        pc: usize,
        upvalue: usize,
        count: usize,
    },
    #[error("opcode {pc} uses prototype {prototype} but there are only {count}")]
    PrototypeOutOfRange {
        pc: usize,
        prototype: usize,
        count: usize,
    },
    #[error("opcode {pc} jumps to {target} outside of the function")]
    BadJump { pc: usize, target: isize },
    #[error("function does not end in a return")]
    MissingReturn,
    #[error("upvalue descriptor {0} refers outside of its parent")]
    BadUpValueDescriptor(usize),
}

impl<S> CompiledPrototype<S> {
    /// The line number for the opcode at `pc`.
    pub fn line_number(&self, pc: usize) -> Option<LineNumber> {
        line_for_pc(&self.opcode_line_numbers, pc)
    }

    /// The name of the local variable held in `register` while the opcode at `pc` executes.
    pub fn local_name(&self, register: RegisterIndex, pc: usize) -> Option<&S> {
        self.locals
            .iter()
            .rev()
            .find(|l| l.register == register && l.is_active(pc))
            .map(|l| &l.name)
    }

    /// Checks operand bounds of every opcode in this prototype and all nested prototypes.
    pub fn validate(&self) -> Result<(), PrototypeError> {
        self.validate_with_parent(None)
    }

    fn validate_with_parent(&self, parent: Option<&Self>) -> Result<(), PrototypeError> {
        for (i, &desc) in self.upvalues.iter().enumerate() {
            let valid = match (desc, parent) {
                (UpValueDescriptor::ParentLocal(r), Some(p)) => (r.0 as u16) < p.stack_size,
                (UpValueDescriptor::Outer(u), Some(p)) => (u.0 as usize) < p.upvalues.len(),
                // Top-level closures get fresh upvalues, the first one bound to the environment.
                (_, None) => true,
            };
            if !valid {
                return Err(PrototypeError::BadUpValueDescriptor(i));
            }
        }

        if !matches!(
            self.opcodes.last(),
            Some(OpCode::Return { .. } | OpCode::TailCall { .. })
        ) {
            return Err(PrototypeError::MissingReturn);
        }

        for (pc, op) in self.opcodes.iter().enumerate() {
            let operands = op.operands();
            for register in operands.registers {
                if register >= self.stack_size as usize {
                    return Err(PrototypeError::RegisterOutOfRange {
                        pc,
                        register,
                        stack_size: self.stack_size,
                    });
                }
            }
            if let Some(constant) = operands.constant {
                if constant >= self.constants.len() {
                    return Err(PrototypeError::ConstantOutOfRange {
                        pc,
                        constant,
                        count: self.constants.len(),
                    });
                }
            }
            if let Some(upvalue) = operands.upvalue {
                if upvalue >= self.upvalues.len() {
                    return Err(PrototypeError::UpValueOutOfRange {
                        pc,
                        upvalue,
                        count: self.upvalues.len(),
                    });
                }
            }
            if let Some(prototype) = operands.prototype {
                if prototype >= self.prototypes.len() {
                    return Err(PrototypeError::PrototypeOutOfRange {
                        pc,
                        prototype,
                        count: self.prototypes.len(),
                    });
                }
            }
            if let Some(offset) = operands.jump {
                let target = pc as isize + 1 + offset as isize;
                if target < 0 || target as usize > self.opcodes.len() {
                    return Err(PrototypeError::BadJump { pc, target });
                }
            }
        }

        for proto in &self.prototypes {
            proto.validate_with_parent(Some(self))?;
        }

        Ok(())
    }
}

pub(crate) fn line_for_pc(line_numbers: &[(usize, LineNumber)], pc: usize) -> Option<LineNumber> {
    match line_numbers.binary_search_by_key(&pc, |(opi, _)| *opi) {
        Ok(i) => Some(line_numbers[i].1),
        Err(0) => None,
        Err(i) => Some(line_numbers[i - 1].1),
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        opcode::OpCode,
        types::{ConstantIndex16, RegisterIndex, VarCount},
    };

    use super::*;

    fn proto(opcodes: Vec<OpCode>) -> CompiledPrototype<&'static str> {
        CompiledPrototype {
            reference: FunctionRef::Chunk,
            fixed_params: 0,
            has_varargs: true,
            stack_size: 2,
            constants: vec![Constant::Integer(1)],
            opcodes,
            opcode_line_numbers: vec![(0, LineNumber(1)), (2, LineNumber(4))],
            upvalues: vec![],
            upvalue_names: vec![],
            locals: vec![LocalVariable {
                name: "x",
                register: RegisterIndex(0),
                start_pc: 1,
                end_pc: 3,
            }],
            prototypes: vec![],
        }
    }

    #[test]
    fn test_validate() {
        let good = proto(vec![
            OpCode::LoadConstant {
                dest: RegisterIndex(0),
                constant: ConstantIndex16(0),
            },
            OpCode::Return {
                start: RegisterIndex(0),
                count: VarCount::constant(1),
            },
        ]);
        assert!(good.validate().is_ok());

        let bad_register = proto(vec![
            OpCode::LoadConstant {
                dest: RegisterIndex(2),
                constant: ConstantIndex16(0),
            },
            OpCode::Return {
                start: RegisterIndex(0),
                count: VarCount::constant(0),
            },
        ]);
        assert!(matches!(
            bad_register.validate(),
            Err(PrototypeError::RegisterOutOfRange { register: 2, .. })
        ));

        let bad_constant = proto(vec![
            OpCode::LoadConstant {
                dest: RegisterIndex(0),
                constant: ConstantIndex16(1),
            },
            OpCode::Return {
                start: RegisterIndex(0),
                count: VarCount::constant(0),
            },
        ]);
        assert!(matches!(
            bad_constant.validate(),
            Err(PrototypeError::ConstantOutOfRange { .. })
        ));

        let no_return = proto(vec![OpCode::LoadNil {
            dest: RegisterIndex(0),
            count: 1,
        }]);
        assert!(matches!(
            no_return.validate(),
            Err(PrototypeError::MissingReturn)
        ));
    }

    #[test]
    fn test_debug_info() {
        let p = proto(vec![]);
        assert_eq!(p.line_number(0), Some(LineNumber(1)));
        assert_eq!(p.line_number(1), Some(LineNumber(1)));
        assert_eq!(p.line_number(5), Some(LineNumber(4)));
        assert_eq!(p.local_name(RegisterIndex(0), 0), None);
        assert_eq!(p.local_name(RegisterIndex(0), 2), Some(&"x"));
    }
}
