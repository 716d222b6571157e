use std::{
    iter,
    ops::{Deref, DerefMut},
    string::String as StdString,
};

use gc_arena::Collect;

use crate::{
    Callback, Closure, Context, Function, LightUserData, String, Table, Thread, TypeError,
    UserData, Value,
};

/// Conversion of a Rust value into a single script value.
pub trait IntoValue<'gc> {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc>;
}

impl<'gc, T: Into<Value<'gc>>> IntoValue<'gc> for T {
    fn into_value(self, _: Context<'gc>) -> Value<'gc> {
        self.into()
    }
}

macro_rules! impl_int_into {
    ($($i:ty),* $(,)?) => {
        $(
            impl<'gc> IntoValue<'gc> for $i {
                fn into_value(self, _: Context<'gc>) -> Value<'gc> {
                    Value::Integer(self.into())
                }
            }
        )*
    };
}
impl_int_into!(i8, u8, i16, u16, i32, u32);

macro_rules! impl_float_into {
    ($($f:ty),* $(,)?) => {
        $(
            impl<'gc> IntoValue<'gc> for $f {
                fn into_value(self, _: Context<'gc>) -> Value<'gc> {
                    Value::Number(self.into())
                }
            }
        )*
    };
}
impl_float_into!(f32);

impl<'gc> IntoValue<'gc> for &'static str {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        Value::String(ctx.intern_static(self.as_bytes()))
    }
}

impl<'gc> IntoValue<'gc> for StdString {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        Value::String(ctx.intern(self.as_bytes()))
    }
}

impl<'gc> IntoValue<'gc> for &StdString {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        Value::String(ctx.intern(self.as_bytes()))
    }
}

impl<'gc, T: IntoValue<'gc>> IntoValue<'gc> for Option<T> {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        match self {
            Some(t) => t.into_value(ctx),
            None => Value::Nil,
        }
    }
}

impl<'gc, T: IntoValue<'gc>> IntoValue<'gc> for Vec<T> {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        let table = Table::new(&ctx);
        for (i, v) in self.into_iter().enumerate() {
            table.set_value(&ctx, Value::Integer(i as i64 + 1), v.into_value(ctx)).ok();
        }
        table.into()
    }
}

impl<'gc, T: IntoValue<'gc>, const N: usize> IntoValue<'gc> for [T; N] {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        let table = Table::new(&ctx);
        for (i, v) in self.into_iter().enumerate() {
            table.set_value(&ctx, Value::Integer(i as i64 + 1), v.into_value(ctx)).ok();
        }
        table.into()
    }
}

/// Conversion of a single script value into a Rust value.
pub trait FromValue<'gc>: Sized {
    fn from_value(ctx: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError>;
}

impl<'gc> FromValue<'gc> for Value<'gc> {
    fn from_value(_: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        Ok(value)
    }
}

macro_rules! impl_from {
    ($([$e:ident ($t:ty) $name:literal])*) => {
        $(
            impl<'gc> FromValue<'gc> for $t {
                fn from_value(_: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
                    match value {
                        Value::$e(a) => Ok(a.into()),
                        _ => Err(TypeError {
                            expected: $name,
                            found: value.type_name(),
                        }),
                    }
                }
            }
        )*
    };
}
impl_from! {
    [Boolean (bool) "boolean"]
    [String (String<'gc>) "string"]
    [Table (Table<'gc>) "table"]
    [Function (Function<'gc>) "function"]
    [Thread (Thread<'gc>) "thread"]
    [UserData (UserData<'gc>) "userdata"]
    [LightUserData (LightUserData) "light userdata"]
}

impl<'gc> FromValue<'gc> for Closure<'gc> {
    fn from_value(_: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        match value {
            Value::Function(Function::Closure(c)) => Ok(c),
            _ => Err(TypeError {
                expected: "closure",
                found: value.type_name(),
            }),
        }
    }
}

impl<'gc> FromValue<'gc> for Callback<'gc> {
    fn from_value(_: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        match value {
            Value::Function(Function::Callback(c)) => Ok(c),
            _ => Err(TypeError {
                expected: "callback",
                found: value.type_name(),
            }),
        }
    }
}

macro_rules! impl_int_from {
    ($($i:ty),* $(,)?) => {
        $(
            impl<'gc> FromValue<'gc> for $i {
                fn from_value(_: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
                    value
                        .to_integer()
                        .and_then(|i| <$i>::try_from(i).ok())
                        .ok_or(TypeError {
                            expected: stringify!($i),
                            found: value.type_name(),
                        })
                }
            }
        )*
    };
}
impl_int_from!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize);

macro_rules! impl_float_from {
    ($($f:ty),* $(,)?) => {
        $(
            impl<'gc> FromValue<'gc> for $f {
                fn from_value(_: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
                    value.to_number().map(|n| n as $f).ok_or(TypeError {
                        expected: "number",
                        found: value.type_name(),
                    })
                }
            }
        )*
    };
}
impl_float_from!(f32, f64);

impl<'gc> FromValue<'gc> for StdString {
    fn from_value(ctx: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        match value.into_string(ctx) {
            Some(s) => Ok(s.display_lossy().to_string()),
            None => Err(TypeError {
                expected: "string",
                found: value.type_name(),
            }),
        }
    }
}

impl<'gc, T: FromValue<'gc>> FromValue<'gc> for Option<T> {
    fn from_value(ctx: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        Ok(if value.is_nil() {
            None
        } else {
            Some(T::from_value(ctx, value)?)
        })
    }
}

impl<'gc, T: FromValue<'gc>> FromValue<'gc> for Vec<T> {
    fn from_value(ctx: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        let table = Table::from_value(ctx, value)?;
        let len = table.length();
        let mut res = Vec::with_capacity(len.max(0) as usize);
        for i in 1..=len {
            res.push(T::from_value(ctx, table.get_value(Value::Integer(i)))?);
        }
        Ok(res)
    }
}

impl<'gc, T: FromValue<'gc>, const N: usize> FromValue<'gc> for [T; N] {
    fn from_value(ctx: Context<'gc>, value: Value<'gc>) -> Result<Self, TypeError> {
        let table = Table::from_value(ctx, value)?;
        let mut res = Vec::with_capacity(N);
        for i in 1..=N {
            res.push(T::from_value(ctx, table.get_value(Value::Integer(i as i64)))?);
        }
        <[T; N]>::try_from(res).map_err(|_| TypeError {
            expected: "array",
            found: "table",
        })
    }
}

/// Conversion of a Rust value into any number of script values.
pub trait IntoMultiValue<'gc> {
    type Iter: Iterator<Item = Value<'gc>>;

    fn into_multi_value(self, ctx: Context<'gc>) -> Self::Iter;
}

impl<'gc, T: IntoValue<'gc>> IntoMultiValue<'gc> for T {
    type Iter = iter::Once<Value<'gc>>;

    fn into_multi_value(self, ctx: Context<'gc>) -> Self::Iter {
        iter::once(self.into_value(ctx))
    }
}

/// Conversion of any number of script values into a Rust value.
///
/// Missing values are treated as nil, extra values are ignored unless the target is a
/// [`Variadic`].
pub trait FromMultiValue<'gc>: Sized {
    fn from_multi_value(
        ctx: Context<'gc>,
        values: impl Iterator<Item = Value<'gc>>,
    ) -> Result<Self, TypeError>;
}

impl<'gc, T: FromValue<'gc>> FromMultiValue<'gc> for T {
    fn from_multi_value(
        ctx: Context<'gc>,
        mut values: impl Iterator<Item = Value<'gc>>,
    ) -> Result<Self, TypeError> {
        T::from_value(ctx, values.next().unwrap_or_default())
    }
}

/// Every remaining value, for functions taking or returning a variable number of values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Collect)]
#[collect(no_drop)]
pub struct Variadic<T>(pub Vec<T>);

impl<T> Variadic<T> {
    pub fn new() -> Self {
        Self(Vec::new())
    }
}

impl<T> Deref for Variadic<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Variadic<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<T> From<Vec<T>> for Variadic<T> {
    fn from(v: Vec<T>) -> Self {
        Self(v)
    }
}

impl<T> FromIterator<T> for Variadic<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(Vec::from_iter(iter))
    }
}

impl<T> IntoIterator for Variadic<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'gc, T: IntoValue<'gc>> IntoMultiValue<'gc> for Variadic<T> {
    type Iter = std::vec::IntoIter<Value<'gc>>;

    fn into_multi_value(self, ctx: Context<'gc>) -> Self::Iter {
        self.0
            .into_iter()
            .map(|v| v.into_value(ctx))
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl<'gc, T: FromValue<'gc>> FromMultiValue<'gc> for Variadic<T> {
    fn from_multi_value(
        ctx: Context<'gc>,
        values: impl Iterator<Item = Value<'gc>>,
    ) -> Result<Self, TypeError> {
        values.map(|v| T::from_value(ctx, v)).collect()
    }
}

macro_rules! impl_tuple {
    () => (
        impl<'gc> IntoMultiValue<'gc> for () {
            type Iter = iter::Empty<Value<'gc>>;

            fn into_multi_value(self, _: Context<'gc>) -> Self::Iter {
                iter::empty()
            }
        }

        impl<'gc> FromMultiValue<'gc> for () {
            fn from_multi_value(
                _: Context<'gc>,
                _: impl Iterator<Item = Value<'gc>>,
            ) -> Result<Self, TypeError> {
                Ok(())
            }
        }
    );

    ($($name:ident)+) => (
        impl<'gc, $($name,)*> IntoMultiValue<'gc> for ($($name,)*)
            where $($name: IntoMultiValue<'gc>,)*
        {
            type Iter = std::vec::IntoIter<Value<'gc>>;

            #[allow(non_snake_case)]
            fn into_multi_value(self, ctx: Context<'gc>) -> Self::Iter {
                let ($($name,)*) = self;
                let mut values = Vec::new();
                $(values.extend($name.into_multi_value(ctx));)*
                values.into_iter()
            }
        }

        impl<'gc, $($name,)*> FromMultiValue<'gc> for ($($name,)*)
            where $($name: FromMultiValue<'gc>,)*
        {
            #[allow(non_snake_case)]
            fn from_multi_value(
                ctx: Context<'gc>,
                mut values: impl Iterator<Item = Value<'gc>>,
            ) -> Result<Self, TypeError> {
                $(let $name = FromMultiValue::from_multi_value(ctx, &mut values)?;)*
                Ok(($($name,)*))
            }
        }
    );
}

macro_rules! smaller_tuples_too {
    ($m: ident, $ty: ident) => {
        $m!{}
        $m!{$ty}
    };

    ($m: ident, $ty: ident $($tt: ident)*) => {
        smaller_tuples_too!{$m, $($tt)*}
        $m!{$ty $($tt)*}
    };
}

smaller_tuples_too!(impl_tuple, L K J I H G F E D C B A);

#[cfg(test)]
mod tests {
    use crate::Lua;

    use super::*;

    #[test]
    fn test_multi_value_conversions() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            let values: Vec<Value> = (1, true, "hello").into_multi_value(ctx).collect();
            assert!(matches!(
                values.as_slice(),
                [Value::Integer(1), Value::Boolean(true), Value::String(s)] if s == b"hello"
            ));

            let (a, b, c): (i32, Option<bool>, StdString) =
                FromMultiValue::from_multi_value(ctx, (7, Value::Nil, "x").into_multi_value(ctx))
                    .unwrap();
            assert_eq!((a, b, c), (7, None, "x".to_owned()));

            let (first, rest): (i64, Variadic<i64>) =
                FromMultiValue::from_multi_value(ctx, (1, 2, 3).into_multi_value(ctx)).unwrap();
            assert_eq!(first, 1);
            assert_eq!(rest.0, vec![2, 3]);

            assert!(i64::from_value(ctx, Value::Number(1.5)).is_err());
            assert_eq!(u8::from_value(ctx, Value::Number(3.0)).unwrap(), 3);
        });
    }

    #[test]
    fn test_table_conversions() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            let table = [1, 2, 3].into_value(ctx);
            let back = <Vec<i64>>::from_value(ctx, table).unwrap();
            assert_eq!(back, vec![1, 2, 3]);
            let array = <[i64; 2]>::from_value(ctx, table).unwrap();
            assert_eq!(array, [1, 2]);
        });
    }
}
