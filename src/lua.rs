use std::ops::Deref;

use gc_arena::{Arena, Collect, Mutation, Rootable};
use tracing::debug;

use crate::{
    config::Limits,
    stash::{Fetchable, Stashable},
    stdlib::{load_base, load_coroutine, load_debug},
    string::InternedStringSet,
    Callback, CallbackReturn, Error, ExternError, FromMultiValue, Fuel, IntoValue, InvalidTableKey,
    Registry, RuntimeError, StashedExecutor, String, Table, Value,
};

/// Everything reachable from the root of a [`Lua`] instance.
#[derive(Collect)]
#[collect(no_drop)]
pub struct State<'gc> {
    pub globals: Table<'gc>,
    pub registry: Registry<'gc>,
    pub strings: InternedStringSet<'gc>,
    /// Metatable shared by every userdata wrapping a [`RuntimeError`].
    pub error_metatable: Table<'gc>,
    /// Allocated up front so that reporting a memory error never allocates.
    pub memory_error: String<'gc>,
    pub limits: Limits,
}

impl<'gc> State<'gc> {
    fn new(mc: &Mutation<'gc>, limits: Limits) -> State<'gc> {
        let strings = InternedStringSet::new(mc);

        let error_metatable = Table::new(mc);
        let tostring = Callback::from_fn(mc, |ctx, _, mut stack| {
            let shown = match stack.get(0) {
                Value::UserData(ud) => match ud.downcast_static::<RuntimeError>() {
                    Ok(err) => err.to_string(),
                    Err(_) => stack.get(0).display().to_string(),
                },
                v => v.display().to_string(),
            };
            stack.replace(ctx, ctx.intern(shown.as_bytes()));
            Ok(CallbackReturn::Return)
        });
        // String keys are always valid.
        let _ = error_metatable.set_value(
            mc,
            Value::String(strings.intern_static(mc, b"__tostring")),
            tostring.into(),
        );

        State {
            globals: Table::new(mc),
            registry: Registry::new(mc),
            strings,
            error_metatable,
            memory_error: strings.intern_static(mc, b"not enough memory"),
            limits,
        }
    }

    pub fn ctx(&'gc self, mutation: &'gc Mutation<'gc>) -> Context<'gc> {
        Context {
            mutation,
            state: self,
        }
    }
}

/// A handle to the mutation context and the root [`State`], passed to everything that runs
/// inside of [`Lua::enter`].
#[derive(Copy, Clone)]
pub struct Context<'gc> {
    mutation: &'gc Mutation<'gc>,
    pub(crate) state: &'gc State<'gc>,
}

impl<'gc> Deref for Context<'gc> {
    type Target = Mutation<'gc>;

    fn deref(&self) -> &Self::Target {
        self.mutation
    }
}

impl<'gc> Context<'gc> {
    pub fn mutation(self) -> &'gc Mutation<'gc> {
        self.mutation
    }

    pub fn globals(self) -> Table<'gc> {
        self.state.globals
    }

    pub fn registry(self) -> Registry<'gc> {
        self.state.registry
    }

    pub fn limits(self) -> &'gc Limits {
        &self.state.limits
    }

    pub fn intern(self, s: &[u8]) -> String<'gc> {
        self.state.strings.intern(&self, s)
    }

    pub fn intern_static(self, s: &'static [u8]) -> String<'gc> {
        self.state.strings.intern_static(&self, s)
    }

    pub fn set_global<K: IntoValue<'gc>, V: IntoValue<'gc>>(
        self,
        key: K,
        value: V,
    ) -> Result<Value<'gc>, InvalidTableKey> {
        self.state.globals.set(self, key, value)
    }

    pub fn get_global<K: IntoValue<'gc>>(self, key: K) -> Value<'gc> {
        self.state.globals.get(self, key)
    }

    pub fn stash<S: Stashable<'gc>>(self, s: S) -> S::Stashed {
        self.state.registry.stash(&self, s)
    }

    pub fn fetch<F: Fetchable>(self, f: &F) -> F::Fetched<'gc> {
        self.state.registry.fetch(f)
    }

    /// Raises a memory error if the configured memory limit has been exceeded.
    pub fn check_memory(self) -> Result<(), Error<'gc>> {
        match self.state.limits.memory_limit {
            Some(limit) if self.mutation.metrics().total_allocation() > limit => {
                Err(Error::memory(self))
            }
            _ => Ok(()),
        }
    }
}

pub type PanicHandler = Box<dyn Fn(&ExternError)>;

/// A complete runtime instance: a GC arena holding the globals, the registry and every object
/// created by the scripts running inside of it.
pub struct Lua {
    arena: Arena<Rootable![State<'_>]>,
    panic_handler: Option<PanicHandler>,
}

impl Default for Lua {
    fn default() -> Self {
        Lua::new()
    }
}

impl Lua {
    /// An instance with default limits and an empty global table.
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Lua {
            arena: Arena::<Rootable![State<'_>]>::new(|mc| State::new(mc, limits)),
            panic_handler: None,
        }
    }

    /// An instance with the base library loaded.
    pub fn core() -> Self {
        let mut lua = Lua::new();
        lua.load_core();
        lua
    }

    /// An instance with the base, coroutine and debug libraries loaded.
    pub fn full() -> Self {
        let mut lua = Lua::new();
        lua.load_full();
        lua
    }

    pub fn load_core(&mut self) {
        self.enter(|ctx| load_base(ctx));
    }

    pub fn load_full(&mut self) {
        self.enter(|ctx| {
            load_base(ctx);
            load_coroutine(ctx);
            load_debug(ctx);
        });
    }

    /// Set the function run by [`Lua::execute_unprotected`] before aborting the process.
    pub fn set_panic_handler(&mut self, handler: impl Fn(&ExternError) + 'static) {
        self.panic_handler = Some(Box::new(handler));
    }

    /// Perform a full collection cycle.
    pub fn gc_collect(&mut self) {
        self.arena.collect_all();
    }

    /// Bytes currently allocated inside the arena.
    pub fn total_memory(&self) -> usize {
        self.arena.metrics().total_allocation()
    }

    /// Run code inside the arena.
    ///
    /// Pays off any collection debt afterwards, so every `enter` is a safe point for the
    /// collector.
    pub fn enter<F, T>(&mut self, f: F) -> T
    where
        F: for<'gc> FnOnce(Context<'gc>) -> T,
    {
        const COLLECTOR_GRANULARITY: f64 = 1024.0;

        let r = self.arena.mutate(move |mc, state| f(state.ctx(mc)));
        if self.arena.metrics().allocation_debt() > COLLECTOR_GRANULARITY {
            self.arena.collect_debt();
        }
        r
    }

    /// A version of [`Lua::enter`] that converts any error into an [`ExternError`].
    pub fn try_enter<F, R>(&mut self, f: F) -> Result<R, ExternError>
    where
        F: for<'gc> FnOnce(Context<'gc>) -> Result<R, Error<'gc>>,
    {
        self.enter(move |ctx| f(ctx).map_err(Error::into_extern))
    }

    /// Run an executor to completion and take its result.
    ///
    /// The executor is stepped in bounded slices with a chance to collect garbage in between.
    pub fn execute<R: for<'gc> FromMultiValue<'gc>>(
        &mut self,
        executor: &StashedExecutor,
    ) -> Result<R, ExternError> {
        const FUEL_PER_GC: i32 = 4096;

        loop {
            let mut fuel = Fuel::with(FUEL_PER_GC);

            if self.enter(|ctx| ctx.fetch(executor).step(ctx, &mut fuel)) {
                break;
            }
        }

        self.try_enter(|ctx| ctx.fetch(executor).take_result::<R>(ctx)?)
    }

    /// Run an executor to completion, treating an error which escapes every protected call as
    /// fatal: the panic handler is run and the process is aborted.
    pub fn execute_unprotected<R: for<'gc> FromMultiValue<'gc>>(
        &mut self,
        executor: &StashedExecutor,
    ) -> R {
        match self.execute::<R>(executor) {
            Ok(r) => r,
            Err(err) => {
                debug!(error = %err, "unprotected error, aborting");
                if let Some(handler) = &self.panic_handler {
                    handler(&err);
                }
                std::process::abort()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globals_and_interning() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            ctx.set_global("answer", 42).unwrap();
            assert_eq!(ctx.get_global("answer"), Value::Integer(42));
            assert_eq!(ctx.intern(b"abc"), ctx.intern(b"abc"));
            assert_eq!(ctx.intern_static(b"abc"), ctx.intern(b"abc"));
            assert!(ctx.set_global(Value::Nil, 1).is_err());
        });
    }

    #[test]
    fn test_memory_limit() {
        let mut lua = Lua::with_limits(Limits::default().with_memory_limit(1 << 16));
        let over = lua.enter(|ctx| {
            assert!(ctx.check_memory().is_ok());
            let t = Table::new(&ctx);
            for i in 0..100_000 {
                t.set(ctx, i, i).unwrap();
            }
            ctx.check_memory().map_err(|e| e.kind())
        });
        assert_eq!(over, Err(crate::error::ErrorKind::Memory));
    }
}
