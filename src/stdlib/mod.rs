mod base;
mod coroutine;
mod debug;

pub use self::{base::load_base, coroutine::load_coroutine, debug::load_debug};

use crate::{Context, Error, FromValue, Stack};

/// "bad argument #n to 'name' (message)", with `n` counting from 1.
pub(crate) fn bad_argument<'gc>(
    ctx: Context<'gc>,
    n: usize,
    name: &str,
    message: impl std::fmt::Display,
) -> Error<'gc> {
    Error::message(ctx, format!("bad argument #{} to '{}' ({})", n + 1, name, message))
}

/// Convert the argument at `n`, reporting a failed conversion as a bad argument.
pub(crate) fn argument<'gc, T: FromValue<'gc>>(
    ctx: Context<'gc>,
    stack: &Stack<'gc, '_>,
    n: usize,
    name: &str,
) -> Result<T, Error<'gc>> {
    T::from_value(ctx, stack.get(n)).map_err(|err| {
        let found = if n >= stack.len() {
            "no value"
        } else {
            err.found
        };
        bad_argument(
            ctx,
            n,
            name,
            format_args!("{} expected, got {}", err.expected, found),
        )
    })
}
