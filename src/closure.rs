use std::hash::{Hash, Hasher};

use allocator_api2::{boxed, vec, SliceExt};
use gc_arena::{allocator_api::MetricsAlloc, lock::Lock, Collect, Gc, Mutation};

use crate::{
    compiled::{line_for_pc, CompiledPrototype, FunctionRef, LineNumber, LocalVariable},
    opcode::OpCode,
    types::{RegisterIndex, UpValueDescriptor},
    Constant, String, Table, Thread, Value,
};

/// A compiled function, ready to be turned into [`Closure`]s.
///
/// A prototype is only executable code, it has none of its "upvalues" set and cannot be called
/// directly.
#[derive(Debug, Collect)]
#[collect(no_drop)]
pub struct FunctionPrototype<'gc> {
    pub chunk_name: String<'gc>,
    pub reference: FunctionRef<String<'gc>>,
    pub fixed_params: u8,
    pub has_varargs: bool,
    pub stack_size: u16,
    pub constants: boxed::Box<[Constant<String<'gc>>], MetricsAlloc<'gc>>,
    pub opcodes: boxed::Box<[OpCode], MetricsAlloc<'gc>>,
    pub opcode_line_numbers: boxed::Box<[(usize, LineNumber)], MetricsAlloc<'gc>>,
    pub upvalues: boxed::Box<[UpValueDescriptor], MetricsAlloc<'gc>>,
    pub upvalue_names: boxed::Box<[String<'gc>], MetricsAlloc<'gc>>,
    pub locals: boxed::Box<[LocalVariable<String<'gc>>], MetricsAlloc<'gc>>,
    pub prototypes: boxed::Box<[Gc<'gc, FunctionPrototype<'gc>>], MetricsAlloc<'gc>>,
}

impl<'gc> FunctionPrototype<'gc> {
    pub fn from_compiled(
        mc: &Mutation<'gc>,
        chunk_name: String<'gc>,
        compiled_function: &CompiledPrototype<String<'gc>>,
    ) -> Self {
        Self::from_compiled_map_strings(mc, chunk_name, compiled_function, |s| *s)
    }

    pub fn from_compiled_map_strings<S>(
        mc: &Mutation<'gc>,
        chunk_name: String<'gc>,
        compiled_function: &CompiledPrototype<S>,
        map_string: impl Fn(&S) -> String<'gc>,
    ) -> Self {
        fn new<'gc, S>(
            mc: &Mutation<'gc>,
            chunk_name: String<'gc>,
            compiled_function: &CompiledPrototype<S>,
            map_string: impl Fn(&S) -> String<'gc> + Copy,
        ) -> FunctionPrototype<'gc> {
            let alloc = MetricsAlloc::new(mc);

            let mut constants = vec::Vec::new_in(alloc.clone());
            constants.extend(
                compiled_function
                    .constants
                    .iter()
                    .map(|c| c.as_string_ref().map_string(map_string)),
            );

            let opcodes = SliceExt::to_vec_in(compiled_function.opcodes.as_slice(), alloc.clone());
            let opcode_line_numbers = SliceExt::to_vec_in(
                compiled_function.opcode_line_numbers.as_slice(),
                alloc.clone(),
            );
            let upvalues =
                SliceExt::to_vec_in(compiled_function.upvalues.as_slice(), alloc.clone());

            let mut upvalue_names = vec::Vec::new_in(alloc.clone());
            upvalue_names.extend(compiled_function.upvalue_names.iter().map(map_string));

            let mut locals = vec::Vec::new_in(alloc.clone());
            locals.extend(compiled_function.locals.iter().map(|l| LocalVariable {
                name: map_string(&l.name),
                register: l.register,
                start_pc: l.start_pc,
                end_pc: l.end_pc,
            }));

            let mut prototypes = vec::Vec::new_in(alloc);
            prototypes.extend(
                compiled_function
                    .prototypes
                    .iter()
                    .map(|cf| Gc::new(mc, new(mc, chunk_name, cf, map_string))),
            );

            FunctionPrototype {
                chunk_name,
                reference: compiled_function
                    .reference
                    .as_string_ref()
                    .map_strings(map_string),
                fixed_params: compiled_function.fixed_params,
                has_varargs: compiled_function.has_varargs,
                stack_size: compiled_function.stack_size,
                constants: constants.into_boxed_slice(),
                opcodes: opcodes.into_boxed_slice(),
                opcode_line_numbers: opcode_line_numbers.into_boxed_slice(),
                upvalues: upvalues.into_boxed_slice(),
                upvalue_names: upvalue_names.into_boxed_slice(),
                locals: locals.into_boxed_slice(),
                prototypes: prototypes.into_boxed_slice(),
            }
        }

        new(mc, chunk_name, compiled_function, &map_string)
    }

    pub fn line_number(&self, pc: usize) -> Option<LineNumber> {
        line_for_pc(&self.opcode_line_numbers, pc)
    }

    pub fn local_name(&self, register: RegisterIndex, pc: usize) -> Option<String<'gc>> {
        self.locals
            .iter()
            .rev()
            .find(|l| l.register == register && l.is_active(pc))
            .map(|l| l.name)
    }

    /// Locals active at `pc`, in declaration order.
    pub fn active_locals(&self, pc: usize) -> impl Iterator<Item = &LocalVariable<String<'gc>>> {
        self.locals.iter().filter(move |l| l.is_active(pc))
    }
}

/// An upvalue that still aliases a live stack slot of some thread.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct OpenUpValue<'gc> {
    pub thread: Thread<'gc>,
    pub stack_index: usize,
}

#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub enum UpValueState<'gc> {
    Open(OpenUpValue<'gc>),
    Closed(Value<'gc>),
}

pub type UpValueInner<'gc> = Lock<UpValueState<'gc>>;

/// A shared, mutable cell captured by closures.
///
/// Every closure capturing the same variable shares the same `UpValue`. While the declaring frame
/// is alive the upvalue is open and reads and writes go to the stack slot, once the frame exits
/// the value is moved into the upvalue itself.
#[derive(Debug, Collect, Copy, Clone)]
#[collect(no_drop)]
pub struct UpValue<'gc>(Gc<'gc, UpValueInner<'gc>>);

impl<'gc> PartialEq for UpValue<'gc> {
    fn eq(&self, other: &UpValue<'gc>) -> bool {
        Gc::ptr_eq(self.0, other.0)
    }
}

impl<'gc> Eq for UpValue<'gc> {}

impl<'gc> UpValue<'gc> {
    pub fn new(mc: &Mutation<'gc>, state: UpValueState<'gc>) -> Self {
        Self(Gc::new(mc, Lock::new(state)))
    }

    pub fn from_inner(inner: Gc<'gc, UpValueInner<'gc>>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, UpValueInner<'gc>> {
        self.0
    }

    pub fn get(self) -> UpValueState<'gc> {
        self.0.get()
    }

    pub fn set(self, mc: &Mutation<'gc>, state: UpValueState<'gc>) {
        self.0.set(mc, state)
    }

    pub fn is_open(self) -> bool {
        matches!(self.get(), UpValueState::Open(_))
    }
}

#[derive(Debug, Collect)]
#[collect(no_drop)]
pub struct ClosureInner<'gc> {
    proto: Gc<'gc, FunctionPrototype<'gc>>,
    upvalues: vec::Vec<UpValue<'gc>, MetricsAlloc<'gc>>,
}

/// A garbage collected pointer to an executable script function.
///
/// A `Closure` is a [`FunctionPrototype`] bound to its upvalues.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Closure<'gc>(Gc<'gc, ClosureInner<'gc>>);

impl<'gc> PartialEq for Closure<'gc> {
    fn eq(&self, other: &Closure<'gc>) -> bool {
        Gc::ptr_eq(self.0, other.0)
    }
}

impl<'gc> Eq for Closure<'gc> {}

impl<'gc> Hash for Closure<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Gc::as_ptr(self.0).hash(state)
    }
}

impl<'gc> Closure<'gc> {
    /// Create a top-level closure.
    ///
    /// Every upvalue of the prototype starts out closed. The first one, conventionally `_ENV`, is
    /// set to `environment`, the rest are nil.
    pub fn new(
        mc: &Mutation<'gc>,
        proto: FunctionPrototype<'gc>,
        environment: Option<Table<'gc>>,
    ) -> Closure<'gc> {
        let proto = Gc::new(mc, proto);
        let mut upvalues = vec::Vec::new_in(MetricsAlloc::new(mc));

        for i in 0..proto.upvalues.len() {
            let value = match environment {
                Some(env) if i == 0 => Value::Table(env),
                _ => Value::Nil,
            };
            upvalues.push(UpValue::new(mc, UpValueState::Closed(value)));
        }

        Closure(Gc::new(mc, ClosureInner { proto, upvalues }))
    }

    pub fn from_parts(
        mc: &Mutation<'gc>,
        proto: Gc<'gc, FunctionPrototype<'gc>>,
        upvalues: vec::Vec<UpValue<'gc>, MetricsAlloc<'gc>>,
    ) -> Self {
        Self(Gc::new(mc, ClosureInner { proto, upvalues }))
    }

    pub fn from_inner(inner: Gc<'gc, ClosureInner<'gc>>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, ClosureInner<'gc>> {
        self.0
    }

    pub fn prototype(self) -> Gc<'gc, FunctionPrototype<'gc>> {
        self.0.proto
    }

    pub fn upvalues(self) -> &'gc [UpValue<'gc>] {
        &Gc::as_ref(self.0).upvalues
    }
}

#[cfg(test)]
mod tests {
    use gc_arena::rootless_arena;

    use crate::{
        compiled::FunctionRef,
        types::{UpValueIndex, VarCount},
    };

    use super::*;
    use std::prelude::rust_2021::vec;

    #[test]
    fn test_top_level_closure() {
        rootless_arena(|mc| {
            let compiled = CompiledPrototype {
                reference: FunctionRef::Chunk,
                fixed_params: 0,
                has_varargs: true,
                stack_size: 1,
                constants: vec![],
                opcodes: vec![OpCode::Return {
                    start: RegisterIndex(0),
                    count: VarCount::constant(0),
                }],
                opcode_line_numbers: vec![(0, LineNumber(1))],
                upvalues: vec![
                    UpValueDescriptor::Outer(UpValueIndex(0)),
                    UpValueDescriptor::Outer(UpValueIndex(1)),
                ],
                upvalue_names: vec!["_ENV", "other"],
                locals: vec![],
                prototypes: vec![],
            };

            let name = String::from_static(mc, "test");
            let proto = FunctionPrototype::from_compiled_map_strings(mc, name, &compiled, |s| {
                String::from_static(mc, *s)
            });
            assert_eq!(proto.upvalue_names[0], "_ENV");
            assert_eq!(proto.line_number(0), Some(LineNumber(1)));

            let env = Table::new(mc);
            let closure = Closure::new(mc, proto, Some(env));
            assert_eq!(closure.upvalues().len(), 2);
            assert!(matches!(
                closure.upvalues()[0].get(),
                UpValueState::Closed(Value::Table(t)) if t == env
            ));
            assert!(matches!(
                closure.upvalues()[1].get(),
                UpValueState::Closed(Value::Nil)
            ));
            assert!(!closure.upvalues()[0].is_open());
        });
    }
}
