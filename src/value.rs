use std::fmt;

use gc_arena::{Collect, Gc};

use crate::{
    number, Callback, Closure, Constant, Context, Function, LightUserData, String, Table, Thread,
    UserData,
};

/// The single data type for all script variables.
///
/// Every value that script code can manipulate directly is ultimately some kind of `Value`.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub enum Value<'gc> {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    LightUserData(LightUserData),
    String(String<'gc>),
    Table(Table<'gc>),
    Function(Function<'gc>),
    Thread(Thread<'gc>),
    UserData(UserData<'gc>),
}

impl<'gc> Default for Value<'gc> {
    fn default() -> Self {
        Value::Nil
    }
}

impl<'gc> Value<'gc> {
    pub fn type_name(self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::Thread(_) => "thread",
            Value::LightUserData(_) | Value::UserData(_) => "userdata",
        }
    }

    /// Returns a proxy object which can display any `Value` the way `tostring` does without
    /// metamethods.
    ///
    /// Floats always print with a fractional part or exponent, strings are displayed lossily, and
    /// reference types print as `"typename: 0x..."`.
    pub fn display(self) -> impl fmt::Display + 'gc {
        struct ValueDisplay<'gc>(Value<'gc>);

        impl<'gc> fmt::Display for ValueDisplay<'gc> {
            fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> std::fmt::Result {
                match self.0 {
                    Value::Nil => write!(fmt, "nil"),
                    Value::Boolean(b) => write!(fmt, "{}", b),
                    Value::Integer(i) => write!(fmt, "{}", i),
                    Value::Number(f) => write!(fmt, "{}", number::format_float(f)),
                    Value::String(s) => write!(fmt, "{}", s.display_lossy()),
                    Value::Table(t) => write!(fmt, "table: {:p}", t.as_ptr()),
                    Value::Function(Function::Closure(c)) => {
                        write!(fmt, "function: {:p}", Gc::as_ptr(c.into_inner()))
                    }
                    Value::Function(Function::Callback(c)) => {
                        write!(fmt, "function: builtin: {:p}", c.as_ptr())
                    }
                    Value::Thread(t) => write!(fmt, "thread: {:p}", Gc::as_ptr(t.into_inner())),
                    Value::LightUserData(p) => write!(fmt, "userdata: {:p}", p.0),
                    Value::UserData(u) => {
                        write!(fmt, "userdata: {:p}", Gc::as_ptr(u.into_inner()))
                    }
                }
            }
        }

        ValueDisplay(self)
    }

    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    /// `nil` and `false` are false, anything else is true.
    pub fn to_bool(self) -> bool {
        match self {
            Value::Nil => false,
            Value::Boolean(false) => false,
            _ => true,
        }
    }

    /// Converts value to either a Number or an Integer, if possible.
    pub fn to_numeric(self) -> Option<Self> {
        self.to_constant()
            .and_then(|c| c.to_numeric())
            .map(|c| c.into())
    }

    /// Interprets Numbers, Integers, and Strings as a Number, if possible.
    pub fn to_number(self) -> Option<f64> {
        self.to_constant().and_then(|c| c.to_number())
    }

    /// Interprets Numbers, Integers, and Strings as an Integer, if possible.
    pub fn to_integer(self) -> Option<i64> {
        self.to_constant().and_then(|c| c.to_integer())
    }

    /// Interprets Numbers, Integers, and Strings as a String, otherwise returns None.
    pub fn into_string(self, ctx: Context<'gc>) -> Option<String<'gc>> {
        match self {
            Value::Integer(i) => Some(ctx.intern(i.to_string().as_bytes())),
            Value::Number(n) => Some(ctx.intern(number::format_float(n).as_bytes())),
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_constant(self) -> Option<Constant<String<'gc>>> {
        match self {
            Value::Nil => Some(Constant::Nil),
            Value::Boolean(b) => Some(Constant::Boolean(b)),
            Value::Integer(i) => Some(Constant::Integer(i)),
            Value::Number(n) => Some(Constant::Number(n)),
            Value::String(s) => Some(Constant::String(s)),
            _ => None,
        }
    }

    /// The metatable consulted for metamethods on this value, light userdata never has one.
    pub fn metatable(self) -> Option<Table<'gc>> {
        match self {
            Value::Table(t) => t.metatable(),
            Value::UserData(u) => u.metatable(),
            _ => None,
        }
    }
}

/// Raw equality: no metamethods, integers and floats compare by mathematical value.
impl<'gc> PartialEq for Value<'gc> {
    fn eq(&self, other: &Value<'gc>) -> bool {
        match (*self, *other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                number::float_to_integer(b) == Some(a)
            }
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Thread(a), Value::Thread(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $value:expr),* $(,)?) => {
        $(
            impl<'gc> From<$ty> for Value<'gc> {
                fn from($v: $ty) -> Value<'gc> {
                    $value
                }
            }
        )*
    };
}

value_from! {
    bool => |v| Value::Boolean(v),
    i64 => |v| Value::Integer(v),
    f64 => |v| Value::Number(v),
    LightUserData => |v| Value::LightUserData(v),
    String<'gc> => |v| Value::String(v),
    Table<'gc> => |v| Value::Table(v),
    Function<'gc> => |v| Value::Function(v),
    Closure<'gc> => |v| Value::Function(Function::Closure(v)),
    Callback<'gc> => |v| Value::Function(Function::Callback(v)),
    Thread<'gc> => |v| Value::Thread(v),
    UserData<'gc> => |v| Value::UserData(v),
}

impl<'gc> From<Constant<String<'gc>>> for Value<'gc> {
    fn from(constant: Constant<String<'gc>>) -> Self {
        match constant {
            Constant::Nil => Value::Nil,
            Constant::Boolean(b) => Value::Boolean(b),
            Constant::Integer(i) => Value::Integer(i),
            Constant::Number(n) => Value::Number(n),
            Constant::String(s) => Value::String(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use gc_arena::rootless_arena;

    use super::*;

    #[test]
    fn test_raw_equality() {
        rootless_arena(|mc| {
            assert_eq!(Value::Integer(3), Value::Number(3.0));
            assert_ne!(Value::Integer(3), Value::Number(3.5));
            assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
            assert_ne!(Value::Boolean(false), Value::Nil);

            let a = String::from_static(mc, "a");
            let b = String::from_slice(mc, "a");
            assert_eq!(Value::String(a), Value::String(b));

            let t1 = Table::new(mc);
            let t2 = Table::new(mc);
            assert_eq!(Value::Table(t1), Value::Table(t1));
            assert_ne!(Value::Table(t1), Value::Table(t2));
        });
    }

    #[test]
    fn test_truthiness_and_display() {
        assert!(!Value::Nil.to_bool());
        assert!(!Value::Boolean(false).to_bool());
        assert!(Value::Integer(0).to_bool());
        assert_eq!(Value::Number(2.0).display().to_string(), "2.0");
        assert_eq!(Value::Integer(-7).display().to_string(), "-7");
        assert_eq!(Value::Nil.type_name(), "nil");
        assert_eq!(Value::LightUserData(LightUserData(std::ptr::null())).type_name(), "userdata");
    }
}
