//! A register-based bytecode virtual machine for the Sil scripting language.
//!
//! This crate executes prototypes produced by an external compiler: it owns the call stack, the
//! protected-call and error unwinding machinery, coroutines, to-be-closed variables and debug
//! hooks. Everything lives inside of a single [`gc_arena`] arena held by [`Lua`].

pub use gc_arena;

pub mod callback;
pub mod closure;
pub mod compiled;
pub mod config;
pub mod constant;
pub mod conversion;
pub mod error;
pub mod fuel;
pub mod function;
pub mod lua;
pub mod meta_ops;
pub mod number;
pub mod opcode;
pub mod raw_ops;
pub mod registry;
pub mod stack;
pub mod stash;
pub mod stdlib;
pub mod string;
pub mod table;
pub mod thread;
pub mod types;
pub mod userdata;
pub mod value;

pub use self::{
    callback::{BoxSequence, Callback, CallbackFn, CallbackReturn, Sequence, SequencePoll},
    closure::{Closure, FunctionPrototype, UpValue},
    compiled::{CompiledPrototype, FunctionRef, LineNumber, PrototypeError},
    config::Limits,
    constant::Constant,
    conversion::{FromMultiValue, FromValue, IntoMultiValue, IntoValue, Variadic},
    error::{BacktraceFrame, Error, ErrorKind, ExternError, LuaError, RuntimeError, TypeError},
    fuel::Fuel,
    function::Function,
    lua::{Context, Lua, State},
    meta_ops::MetaMethod,
    registry::Registry,
    stack::Stack,
    stash::{
        StashedCallback, StashedClosure, StashedError, StashedExecutor, StashedFunction,
        StashedString, StashedTable, StashedThread, StashedUserData, StashedValue,
    },
    string::String,
    table::{InvalidTableKey, Table},
    thread::{
        BadExecutorMode, BadThreadMode, CurrentThread, Execution, Executor, ExecutorMode, Hook,
        HookMask, Thread, ThreadMode,
    },
    userdata::{LightUserData, UserData},
    value::Value,
};
