use core::fmt;

use gc_arena::{DynamicRoot, DynamicRootSet, Gc, Mutation, Rootable};

use crate::{
    callback::CallbackInner,
    closure::ClosureInner,
    error::{ErrorKind, LuaError},
    string::StringInner,
    table::TableInner,
    thread::{ExecutorInner, ThreadInner},
    userdata::UserDataInner,
    Callback, Closure, Error, Executor, Function, LightUserData, RuntimeError, String, Table,
    Thread, UserData, Value,
};

/// A type that can be rooted in a [`DynamicRootSet`], producing a `'static` handle.
///
/// Implemented for every GC object type of the crate, and for [`Function`], [`Value`] and
/// [`Error`], which may hold any of them.
pub trait Stashable<'gc> {
    type Stashed;

    fn stash(self, mc: &Mutation<'gc>, roots: DynamicRootSet<'gc>) -> Self::Stashed;
}

/// The inverse of [`Stashable`].
pub trait Fetchable {
    type Fetched<'gc>;

    fn fetch<'gc>(&self, roots: DynamicRootSet<'gc>) -> Self::Fetched<'gc>;
}

macro_rules! stashed_object {
    ($stashed:ident, $object:ident, $inner:ty) => {
        #[derive(Clone)]
        pub struct $stashed(DynamicRoot<Rootable![Gc<'_, $inner>]>);

        impl fmt::Debug for $stashed {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($stashed))
                    .field(&self.0.as_ptr())
                    .finish()
            }
        }

        impl<'gc> Stashable<'gc> for $object<'gc> {
            type Stashed = $stashed;

            fn stash(self, mc: &Mutation<'gc>, roots: DynamicRootSet<'gc>) -> Self::Stashed {
                $stashed(roots.stash::<Rootable![Gc<'_, $inner>]>(mc, self.into_inner()))
            }
        }

        impl Fetchable for $stashed {
            type Fetched<'gc> = $object<'gc>;

            fn fetch<'gc>(&self, roots: DynamicRootSet<'gc>) -> Self::Fetched<'gc> {
                $object::from_inner(*roots.fetch(&self.0))
            }
        }
    };
}

stashed_object!(StashedString, String, StringInner);
stashed_object!(StashedTable, Table, TableInner<'_>);
stashed_object!(StashedClosure, Closure, ClosureInner<'_>);
stashed_object!(StashedCallback, Callback, CallbackInner<'_>);
stashed_object!(StashedThread, Thread, ThreadInner<'_>);
stashed_object!(StashedUserData, UserData, UserDataInner<'_>);
stashed_object!(StashedExecutor, Executor, ExecutorInner<'_>);

#[derive(Debug, Clone)]
pub enum StashedFunction {
    Closure(StashedClosure),
    Callback(StashedCallback),
}

impl<'gc> Stashable<'gc> for Function<'gc> {
    type Stashed = StashedFunction;

    fn stash(self, mc: &Mutation<'gc>, roots: DynamicRootSet<'gc>) -> Self::Stashed {
        match self {
            Function::Closure(closure) => StashedFunction::Closure(closure.stash(mc, roots)),
            Function::Callback(callback) => StashedFunction::Callback(callback.stash(mc, roots)),
        }
    }
}

impl Fetchable for StashedFunction {
    type Fetched<'gc> = Function<'gc>;

    fn fetch<'gc>(&self, roots: DynamicRootSet<'gc>) -> Self::Fetched<'gc> {
        match self {
            StashedFunction::Closure(closure) => Function::Closure(closure.fetch(roots)),
            StashedFunction::Callback(callback) => Function::Callback(callback.fetch(roots)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StashedValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    LightUserData(LightUserData),
    String(StashedString),
    Table(StashedTable),
    Function(StashedFunction),
    Thread(StashedThread),
    UserData(StashedUserData),
}

impl<'gc> Stashable<'gc> for Value<'gc> {
    type Stashed = StashedValue;

    fn stash(self, mc: &Mutation<'gc>, roots: DynamicRootSet<'gc>) -> Self::Stashed {
        match self {
            Value::Nil => StashedValue::Nil,
            Value::Boolean(b) => StashedValue::Boolean(b),
            Value::Integer(i) => StashedValue::Integer(i),
            Value::Number(n) => StashedValue::Number(n),
            Value::LightUserData(p) => StashedValue::LightUserData(p),
            Value::String(s) => StashedValue::String(s.stash(mc, roots)),
            Value::Table(t) => StashedValue::Table(t.stash(mc, roots)),
            Value::Function(f) => StashedValue::Function(f.stash(mc, roots)),
            Value::Thread(t) => StashedValue::Thread(t.stash(mc, roots)),
            Value::UserData(u) => StashedValue::UserData(u.stash(mc, roots)),
        }
    }
}

impl Fetchable for StashedValue {
    type Fetched<'gc> = Value<'gc>;

    fn fetch<'gc>(&self, roots: DynamicRootSet<'gc>) -> Self::Fetched<'gc> {
        match self {
            StashedValue::Nil => Value::Nil,
            StashedValue::Boolean(b) => Value::Boolean(*b),
            StashedValue::Integer(i) => Value::Integer(*i),
            StashedValue::Number(n) => Value::Number(*n),
            StashedValue::LightUserData(p) => Value::LightUserData(*p),
            StashedValue::String(s) => Value::String(s.fetch(roots)),
            StashedValue::Table(t) => Value::Table(t.fetch(roots)),
            StashedValue::Function(f) => Value::Function(f.fetch(roots)),
            StashedValue::Thread(t) => Value::Thread(t.fetch(roots)),
            StashedValue::UserData(u) => Value::UserData(u.fetch(roots)),
        }
    }
}

/// A stashed [`Error`], keeping the error's kind and traceback.
#[derive(Debug, Clone)]
pub enum StashedError {
    Lua {
        value: StashedValue,
        kind: ErrorKind,
        backtrace: Option<Vec<crate::error::BacktraceFrame>>,
    },
    Runtime(RuntimeError),
}

impl<'gc> Stashable<'gc> for Error<'gc> {
    type Stashed = StashedError;

    fn stash(self, mc: &Mutation<'gc>, roots: DynamicRootSet<'gc>) -> Self::Stashed {
        match self {
            Error::Lua(err) => StashedError::Lua {
                value: err.value.stash(mc, roots),
                kind: err.kind,
                backtrace: err.backtrace,
            },
            Error::Runtime(err) => StashedError::Runtime(err),
        }
    }
}

impl Fetchable for StashedError {
    type Fetched<'gc> = Error<'gc>;

    fn fetch<'gc>(&self, roots: DynamicRootSet<'gc>) -> Self::Fetched<'gc> {
        match self {
            StashedError::Lua {
                value,
                kind,
                backtrace,
            } => Error::Lua(LuaError {
                value: value.fetch(roots),
                kind: *kind,
                backtrace: backtrace.clone(),
            }),
            StashedError::Runtime(err) => Error::Runtime(err.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Lua;

    use super::*;

    #[test]
    fn test_stash_across_mutations() {
        let mut lua = Lua::new();
        let (table, value) = lua.enter(|ctx| {
            let t = Table::new(&ctx);
            t.set(ctx, 1, "one").unwrap();
            let s = Value::String(ctx.intern(b"kept"));
            (ctx.stash(t), ctx.stash(s))
        });

        lua.gc_collect();

        lua.enter(|ctx| {
            let t = ctx.fetch(&table);
            assert_eq!(t.get(ctx, 1), Value::String(ctx.intern(b"one")));
            assert_eq!(ctx.fetch(&value), Value::String(ctx.intern(b"kept")));
        });
    }
}
