use std::{error::Error as StdError, fmt, string::String as StdString, sync::Arc};

use gc_arena::{Collect, Gc};
use thiserror::Error;

use crate::{compiled::LineNumber, Context, FromValue, Function, IntoValue, UserData, Value};

#[derive(Debug, Clone, Copy, Error)]
#[error("type error, expected {expected}, found {found}")]
pub struct TypeError {
    pub expected: &'static str,
    pub found: &'static str,
}

/// The class of a script error.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Collect)]
#[collect(require_static)]
pub enum ErrorKind {
    /// Any error raised while running code, including errors raised with `error`.
    Runtime,
    /// An error reported by a compiler or loader, passed through unchanged.
    Syntax,
    /// The memory limit was exceeded.
    Memory,
    /// An error raised while already handling an error: a failing message handler or an overflow
    /// of the stack's error headroom. Message handlers are not run for these.
    ErrorInErrorHandling,
}

/// An error raised directly from script code, carrying a script value.
///
/// Any [`Value`] can be raised as an error and it will be contained here.
#[derive(Debug, Clone, Collect)]
#[collect(no_drop)]
pub struct LuaError<'gc> {
    pub value: Value<'gc>,
    pub kind: ErrorKind,
    pub backtrace: Option<Vec<BacktraceFrame>>,
}

impl<'gc> fmt::Display for LuaError<'gc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            pretty_print_error_with_backtrace(f, &self.value.display(), self.backtrace.as_deref())
        } else {
            write!(f, "{}", self.value.display())
        }
    }
}

impl<'gc> From<Value<'gc>> for LuaError<'gc> {
    fn from(value: Value<'gc>) -> Self {
        LuaError {
            value,
            kind: ErrorKind::Runtime,
            backtrace: None,
        }
    }
}

/// A [`LuaError`] that is not bound to the GC context.
///
/// All primitive values (nil, booleans, integers, numbers) are represented here exactly. Strings
/// are converted *lossily* into normal Rust strings. Tables, functions, threads, and userdata are
/// stored in their *raw pointer* form.
#[derive(Debug, Clone, Error)]
pub enum ExternLuaError {
    #[error("nil")]
    Nil,
    #[error("{0}")]
    Boolean(bool),
    #[error("{0}")]
    Integer(i64),
    #[error("{0}")]
    Number(f64),
    #[error("{0}")]
    String(StdString),
    #[error("<table {0:p}>")]
    Table(*const ()),
    #[error("<function {0:p}>")]
    Function(*const ()),
    #[error("<thread {0:p}>")]
    Thread(*const ()),
    #[error("<userdata {0:p}>")]
    UserData(*const ()),
    #[error("<light userdata {0:p}>")]
    LightUserData(*const ()),
}

impl<'gc> From<Value<'gc>> for ExternLuaError {
    fn from(error: Value<'gc>) -> Self {
        match error {
            Value::Nil => ExternLuaError::Nil,
            Value::Boolean(b) => ExternLuaError::Boolean(b),
            Value::Integer(i) => ExternLuaError::Integer(i),
            Value::Number(n) => ExternLuaError::Number(n),
            Value::String(s) => ExternLuaError::String(s.display_lossy().to_string()),
            Value::Table(t) => ExternLuaError::Table(Gc::as_ptr(t.into_inner()) as *const ()),
            Value::Function(Function::Callback(c)) => ExternLuaError::Function(c.as_ptr()),
            Value::Function(Function::Closure(c)) => {
                ExternLuaError::Function(Gc::as_ptr(c.into_inner()) as *const ())
            }
            Value::Thread(t) => ExternLuaError::Thread(Gc::as_ptr(t.into_inner()) as *const ()),
            Value::UserData(u) => ExternLuaError::UserData(Gc::as_ptr(u.into_inner()) as *const ()),
            Value::LightUserData(p) => ExternLuaError::LightUserData(p.0),
        }
    }
}

// SAFETY: The pointers in `ExternLuaError` are not actually dereferenced at all, they are purely
// informational.
unsafe impl Send for ExternLuaError {}
unsafe impl Sync for ExternLuaError {}

/// One level of a traceback, captured when an error is raised.
#[derive(Debug, Clone, PartialEq, Eq, Collect)]
#[collect(require_static)]
pub enum BacktraceFrame {
    Lua {
        chunk_name: StdString,
        line_number: Option<LineNumber>,
        /// How the function is described, eg. `function 'f'` or `main chunk`.
        function: StdString,
        /// Frames were discarded below this one by tail calls.
        is_tail: bool,
    },
    Native {
        name: Option<StdString>,
    },
}

impl fmt::Display for BacktraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BacktraceFrame::Lua {
                chunk_name,
                line_number,
                function,
                is_tail,
            } => {
                write!(f, "{chunk_name}:")?;
                if let Some(line) = line_number {
                    write!(f, "{line}:")?;
                }
                write!(f, " in {function}")?;
                if *is_tail {
                    write!(f, "\n\t(...tail calls...)")?;
                }
                Ok(())
            }
            BacktraceFrame::Native { name: Some(name) } => write!(f, "[C]: in {name}"),
            BacktraceFrame::Native { name: None } => write!(f, "[C]: in ?"),
        }
    }
}

/// A shareable, dynamically typed wrapper around a normal Rust error.
///
/// Rust errors can be caught and re-raised through scripts which allows for unrestricted sharing,
/// so this type contains its error inside an `Arc` pointer to allow for this.
#[derive(Debug, Clone, Collect)]
#[collect(require_static)]
pub struct RuntimeError {
    pub error: Arc<anyhow::Error>,
    pub backtrace: Option<Vec<BacktraceFrame>>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            pretty_print_error_with_backtrace(f, &self.error, self.backtrace.as_deref())
        } else {
            write!(f, "{}", self.error)
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for RuntimeError {
    fn from(err: E) -> Self {
        Self::new(err)
    }
}

impl RuntimeError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self {
            error: Arc::new(err.into()),
            backtrace: None,
        }
    }

    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        self.error.root_cause()
    }

    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.is::<E>()
    }

    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl AsRef<dyn StdError + 'static> for RuntimeError {
    fn as_ref(&self) -> &(dyn StdError + 'static) {
        (*self.error).as_ref()
    }
}

/// An error that can be raised from script code.
///
/// This can be either a [`LuaError`] containing a script [`Value`], or a [`RuntimeError`]
/// containing a Rust error.
#[derive(Debug, Clone, Collect)]
#[collect(no_drop)]
pub enum Error<'gc> {
    Lua(LuaError<'gc>),
    Runtime(RuntimeError),
}

impl<'gc> fmt::Display for Error<'gc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            match self {
                Error::Lua(err) => write!(f, "lua error: {:#}", err),
                Error::Runtime(err) => write!(f, "runtime error: {:#}", err),
            }
        } else {
            match self {
                Error::Lua(err) => write!(f, "lua error: {}", err),
                Error::Runtime(err) => write!(f, "runtime error: {}", err),
            }
        }
    }
}

impl<'gc> From<Value<'gc>> for Error<'gc> {
    fn from(value: Value<'gc>) -> Self {
        Self::from_value(value)
    }
}

impl<'gc> From<LuaError<'gc>> for Error<'gc> {
    fn from(error: LuaError<'gc>) -> Self {
        Self::Lua(error)
    }
}

impl<'gc> From<RuntimeError> for Error<'gc> {
    fn from(error: RuntimeError) -> Self {
        Self::Runtime(error)
    }
}

impl<'gc, E: Into<anyhow::Error>> From<E> for Error<'gc> {
    fn from(error: E) -> Self {
        Self::Runtime(RuntimeError::new(error))
    }
}

impl<'gc> Error<'gc> {
    /// Turn a script [`Value`] into an `Error`.
    ///
    /// If the provided value is a [`UserData`] object which holds a [`RuntimeError`], then this
    /// conversion will clone the held `RuntimeError` and properly return an [`Error::Runtime`]
    /// variant. This is how Rust errors are properly transported through scripts: a
    /// `RuntimeError` which is turned into a `Value` with [`Error::to_value`] will always turn back
    /// into a `RuntimeError` error with [`Error::from_value`].
    ///
    /// If the given value is *any other* kind of value, then this will return a [`LuaError`]
    /// instead.
    pub fn from_value(value: Value<'gc>) -> Self {
        if let Value::UserData(ud) = value {
            if let Ok(err) = ud.downcast_static::<RuntimeError>() {
                return Error::Runtime(err.clone());
            }
        }

        Error::Lua(value.into())
    }

    /// A runtime error holding a message string.
    pub fn message(ctx: Context<'gc>, message: impl Into<StdString>) -> Self {
        Error::Lua(LuaError {
            value: Value::String(ctx.intern(message.into().as_bytes())),
            kind: ErrorKind::Runtime,
            backtrace: None,
        })
    }

    /// The error raised when the memory limit is exceeded, its message is allocated up front.
    pub fn memory(ctx: Context<'gc>) -> Self {
        Error::Lua(LuaError {
            value: Value::String(ctx.state.memory_error),
            kind: ErrorKind::Memory,
            backtrace: None,
        })
    }

    pub fn error_in_error_handling(ctx: Context<'gc>) -> Self {
        Error::Lua(LuaError {
            value: Value::String(ctx.intern_static(b"error in error handling")),
            kind: ErrorKind::ErrorInErrorHandling,
            backtrace: None,
        })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Lua(err) => err.kind,
            Error::Runtime(_) => ErrorKind::Runtime,
        }
    }

    pub fn backtrace(&self) -> Option<&[BacktraceFrame]> {
        match self {
            Error::Lua(err) => err.backtrace.as_deref(),
            Error::Runtime(err) => err.backtrace.as_deref(),
        }
    }

    /// Attach a traceback, unless one has already been captured closer to where the error was
    /// first raised.
    pub fn with_backtrace(mut self, backtrace: impl FnOnce() -> Vec<BacktraceFrame>) -> Self {
        let slot = match &mut self {
            Error::Lua(err) => &mut err.backtrace,
            Error::Runtime(err) => &mut err.backtrace,
        };
        if slot.is_none() {
            *slot = Some(backtrace());
        }
        self
    }

    /// Convert an `Error` into a script value.
    ///
    /// For Lua errors, this simply returns the original [`Value`] directly.
    ///
    /// For Rust errors, this will return a [`UserData`] value which holds a [`RuntimeError`]. The
    /// `UserData` object shares a metatable with a `__tostring` metamethod which prints the error
    /// properly when printed from a script.
    pub fn to_value(&self, ctx: Context<'gc>) -> Value<'gc> {
        match self {
            Error::Lua(err) => err.value,
            Error::Runtime(err) => {
                let ud = UserData::new_static(&ctx, err.clone());
                ud.set_metatable(&ctx, Some(ctx.state.error_metatable));
                ud.into()
            }
        }
    }

    pub fn to_extern(&self) -> ExternError {
        self.clone().into_extern()
    }

    pub fn into_extern(self) -> ExternError {
        self.into()
    }
}

impl<'gc> IntoValue<'gc> for Error<'gc> {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        self.to_value(ctx)
    }
}

impl<'gc> FromValue<'gc> for Error<'gc> {
    fn from_value(_: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        Ok(Error::from_value(value))
    }
}

/// An [`enum@Error`] that is not bound to the GC context.
#[derive(Debug, Clone)]
pub enum ExternError {
    Lua {
        error: ExternLuaError,
        kind: ErrorKind,
        backtrace: Option<Vec<BacktraceFrame>>,
    },
    Runtime(RuntimeError),
}

impl fmt::Display for ExternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            match self {
                ExternError::Lua {
                    error, backtrace, ..
                } => {
                    write!(f, "lua error: ")?;
                    pretty_print_error_with_backtrace(f, error, backtrace.as_deref())
                }
                ExternError::Runtime(err) => {
                    write!(f, "runtime error: {:#}", err)
                }
            }
        } else {
            match self {
                ExternError::Lua { error, .. } => write!(f, "lua error: {error}"),
                ExternError::Runtime(err) => write!(f, "runtime error: {err}"),
            }
        }
    }
}

impl StdError for ExternError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ExternError::Lua { error, .. } => Some(error),
            ExternError::Runtime(err) => Some(err.as_ref()),
        }
    }
}

impl ExternError {
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        match self {
            ExternError::Lua { error, .. } => error,
            ExternError::Runtime(err) => err.root_cause(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExternError::Lua { kind, .. } => *kind,
            ExternError::Runtime(_) => ErrorKind::Runtime,
        }
    }

    pub fn backtrace(&self) -> Option<&[BacktraceFrame]> {
        match self {
            ExternError::Lua { backtrace, .. } => backtrace.as_deref(),
            ExternError::Runtime(err) => err.backtrace.as_deref(),
        }
    }

    /// Write the error message followed by its `stack traceback:`, if one was captured.
    pub fn pretty_print(&self, writer: &mut impl fmt::Write) -> Result<(), fmt::Error> {
        match self {
            ExternError::Lua {
                error, backtrace, ..
            } => pretty_print_error_with_backtrace(writer, error, backtrace.as_deref()),
            ExternError::Runtime(err) => {
                pretty_print_error_with_backtrace(writer, &err.error, err.backtrace.as_deref())
            }
        }
    }
}

impl From<ExternLuaError> for ExternError {
    fn from(error: ExternLuaError) -> Self {
        Self::Lua {
            error,
            kind: ErrorKind::Runtime,
            backtrace: None,
        }
    }
}

impl From<RuntimeError> for ExternError {
    fn from(error: RuntimeError) -> Self {
        Self::Runtime(error)
    }
}

impl<'gc> From<Error<'gc>> for ExternError {
    fn from(err: Error<'gc>) -> Self {
        match err {
            Error::Lua(err) => ExternError::Lua {
                error: err.value.into(),
                kind: err.kind,
                backtrace: err.backtrace,
            },
            Error::Runtime(e) => e.into(),
        }
    }
}

pub(crate) fn pretty_print_error_with_backtrace(
    writer: &mut impl fmt::Write,
    error: &dyn fmt::Display,
    backtrace: Option<&[BacktraceFrame]>,
) -> Result<(), fmt::Error> {
    write!(writer, "{}", error)?;
    if let Some(backtrace) = backtrace {
        write!(writer, "\nstack traceback:")?;
        for frame in backtrace {
            write!(writer, "\n\t{}", frame)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceback_format() {
        let backtrace = vec![
            BacktraceFrame::Native {
                name: Some("function 'error'".to_owned()),
            },
            BacktraceFrame::Lua {
                chunk_name: "test".to_owned(),
                line_number: Some(LineNumber(3)),
                function: "local 'f'".to_owned(),
                is_tail: true,
            },
            BacktraceFrame::Lua {
                chunk_name: "test".to_owned(),
                line_number: Some(LineNumber(7)),
                function: "main chunk".to_owned(),
                is_tail: false,
            },
            BacktraceFrame::Native { name: None },
        ];

        let error = ExternError::Lua {
            error: ExternLuaError::String("test:3: boom".to_owned()),
            kind: ErrorKind::Runtime,
            backtrace: Some(backtrace),
        };

        let mut out = StdString::new();
        error.pretty_print(&mut out).unwrap();
        assert_eq!(
            out,
            "test:3: boom\nstack traceback:\n\t[C]: in function 'error'\n\ttest:3: in local 'f'\n\t\
             (...tail calls...)\n\ttest:7: in main chunk\n\t[C]: in ?"
        );
        assert_eq!(error.to_string(), "lua error: test:3: boom");
        assert_eq!(error.kind(), ErrorKind::Runtime);
    }
}
