use allocator_api2::vec;
use gc_arena::{allocator_api::MetricsAlloc, Collect};

use crate::{Callback, CallbackReturn, Closure, Context, IntoMultiValue};

/// Any callable function: a script closure or a native callback.
#[derive(Debug, Copy, Clone, Collect, PartialEq, Eq, Hash)]
#[collect(no_drop)]
pub enum Function<'gc> {
    Closure(Closure<'gc>),
    Callback(Callback<'gc>),
}

impl<'gc> From<Closure<'gc>> for Function<'gc> {
    fn from(closure: Closure<'gc>) -> Self {
        Self::Closure(closure)
    }
}

impl<'gc> From<Callback<'gc>> for Function<'gc> {
    fn from(callback: Callback<'gc>) -> Self {
        Self::Callback(callback)
    }
}

impl<'gc> Function<'gc> {
    /// Bind the given arguments to the front of this function's arguments.
    ///
    /// The bound arguments are owned by the returned native closure.
    pub fn bind(self, ctx: Context<'gc>, args: impl IntoMultiValue<'gc>) -> Function<'gc> {
        let mut bound = vec::Vec::new_in(MetricsAlloc::new(&ctx));
        bound.extend(args.into_multi_value(ctx));
        if bound.is_empty() {
            return self;
        }

        Callback::from_fn_with(&ctx, (self, bound), |(function, bound), _, _, mut stack| {
            for &v in bound.iter().rev() {
                stack.push_front(v);
            }
            Ok(CallbackReturn::Call {
                function: *function,
                then: None,
            })
        })
        .into()
    }

    /// Number of fixed parameters and whether varargs are accepted, native functions have no
    /// declared signature.
    pub fn signature(self) -> Option<(u8, bool)> {
        match self {
            Function::Closure(c) => {
                let proto = c.prototype();
                Some((proto.fixed_params, proto.has_varargs))
            }
            Function::Callback(_) => None,
        }
    }
}
