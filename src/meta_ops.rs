//! Metamethod aware operators.
//!
//! None of these functions call anything themselves. When an operation needs a metamethod, it
//! returns the function to call and its arguments and leaves the call to the VM or to a native
//! function returning [`CallbackReturn::Call`](crate::CallbackReturn::Call).

use gc_arena::Collect;
use thiserror::Error;

use crate::{
    opcode::ArithOp, raw_ops, table::InvalidTableKey, Context, Function, IntoValue, String,
    Value, Variadic,
};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Collect)]
#[collect(require_static)]
pub enum MetaMethod {
    Index,
    NewIndex,
    Call,
    Len,
    Eq,
    Lt,
    Le,
    Concat,
    Unm,
    BNot,
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Close,
    ToString,
    Name,
    Metatable,
}

impl MetaMethod {
    pub const fn name(self) -> &'static str {
        match self {
            MetaMethod::Index => "__index",
            MetaMethod::NewIndex => "__newindex",
            MetaMethod::Call => "__call",
            MetaMethod::Len => "__len",
            MetaMethod::Eq => "__eq",
            MetaMethod::Lt => "__lt",
            MetaMethod::Le => "__le",
            MetaMethod::Concat => "__concat",
            MetaMethod::Unm => "__unm",
            MetaMethod::BNot => "__bnot",
            MetaMethod::Add => "__add",
            MetaMethod::Sub => "__sub",
            MetaMethod::Mul => "__mul",
            MetaMethod::Div => "__div",
            MetaMethod::IDiv => "__idiv",
            MetaMethod::Mod => "__mod",
            MetaMethod::Pow => "__pow",
            MetaMethod::BAnd => "__band",
            MetaMethod::BOr => "__bor",
            MetaMethod::BXor => "__bxor",
            MetaMethod::Shl => "__shl",
            MetaMethod::Shr => "__shr",
            MetaMethod::Close => "__close",
            MetaMethod::ToString => "__tostring",
            MetaMethod::Name => "__name",
            MetaMethod::Metatable => "__metatable",
        }
    }
}

impl<'gc> IntoValue<'gc> for MetaMethod {
    fn into_value(self, ctx: Context<'gc>) -> Value<'gc> {
        Value::String(ctx.intern_static(self.name().as_bytes()))
    }
}

/// Errors raised by operators, without the name of the offending variable.
#[derive(Debug, Copy, Clone, Error)]
pub enum MetaOperatorError {
    /// `operand` is the position of the offending value among the operator's operands.
    #[error("attempt to {action} a {type_name} value")]
    BadType {
        action: &'static str,
        type_name: &'static str,
        operand: usize,
    },
    #[error("attempt to compare two {0} values")]
    CompareSame(&'static str),
    #[error("attempt to compare {0} with {1}")]
    Compare(&'static str, &'static str),
    #[error("'{0}' chain too long; possible loop")]
    ChainTooLong(&'static str),
    #[error(transparent)]
    InvalidKey(#[from] InvalidTableKey),
    #[error("attempt to perform 'n//0'")]
    IntDivByZero,
    #[error("attempt to perform 'n%0'")]
    IntModByZero,
    #[error("number has no integer representation")]
    NoIntegerRepresentation { operand: usize },
}

impl MetaOperatorError {
    /// The operand a variable name should be reported for, if any.
    pub fn operand(&self) -> Option<usize> {
        match *self {
            MetaOperatorError::BadType { operand, .. }
            | MetaOperatorError::NoIntegerRepresentation { operand } => Some(operand),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct MetaCall<'gc, const N: usize> {
    pub function: Function<'gc>,
    pub args: [Value<'gc>; N],
}

#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub enum MetaResult<'gc, const N: usize> {
    Value(Value<'gc>),
    Call(MetaCall<'gc, N>),
}

impl<'gc, const N: usize> From<Value<'gc>> for MetaResult<'gc, N> {
    fn from(value: Value<'gc>) -> Self {
        Self::Value(value)
    }
}

impl<'gc, const N: usize> From<MetaCall<'gc, N>> for MetaResult<'gc, N> {
    fn from(call: MetaCall<'gc, N>) -> Self {
        MetaResult::Call(call)
    }
}

/// The metamethod `method` of `value`, or nil.
pub fn metamethod<'gc>(ctx: Context<'gc>, value: Value<'gc>, method: MetaMethod) -> Value<'gc> {
    match value.metatable() {
        Some(mt) => mt.get(ctx, method),
        None => Value::Nil,
    }
}

/// The metamethod `method` of `lhs`, falling back to the one of `rhs`.
fn binary_metamethod<'gc>(
    ctx: Context<'gc>,
    lhs: Value<'gc>,
    rhs: Value<'gc>,
    method: MetaMethod,
) -> Option<Value<'gc>> {
    let mm = metamethod(ctx, lhs, method);
    if !mm.is_nil() {
        return Some(mm);
    }
    let mm = metamethod(ctx, rhs, method);
    if !mm.is_nil() {
        return Some(mm);
    }
    None
}

fn bad_type(action: &'static str, value: Value<'_>, operand: usize) -> MetaOperatorError {
    MetaOperatorError::BadType {
        action,
        type_name: value.type_name(),
        operand,
    }
}

pub fn index<'gc>(
    ctx: Context<'gc>,
    table: Value<'gc>,
    key: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    let mut table = table;
    for _ in 0..ctx.limits().max_tag_loop {
        let idx = match table {
            Value::Table(t) => {
                let v = t.get_value(key);
                if !v.is_nil() {
                    return Ok(MetaResult::Value(v));
                }

                let idx = metamethod(ctx, table, MetaMethod::Index);
                if idx.is_nil() {
                    return Ok(MetaResult::Value(Value::Nil));
                }
                idx
            }
            _ => {
                let idx = metamethod(ctx, table, MetaMethod::Index);
                if idx.is_nil() {
                    return Err(bad_type("index", table, 0));
                }
                idx
            }
        };

        if let Value::Function(function) = idx {
            return Ok(MetaResult::Call(MetaCall {
                function,
                args: [table, key],
            }));
        }
        table = idx;
    }

    Err(MetaOperatorError::ChainTooLong("__index"))
}

pub fn new_index<'gc>(
    ctx: Context<'gc>,
    table: Value<'gc>,
    key: Value<'gc>,
    value: Value<'gc>,
) -> Result<Option<MetaCall<'gc, 3>>, MetaOperatorError> {
    let mut table = table;
    for _ in 0..ctx.limits().max_tag_loop {
        let idx = match table {
            Value::Table(t) => {
                let idx = metamethod(ctx, table, MetaMethod::NewIndex);
                // The metamethod is only consulted for absent keys.
                if idx.is_nil() || !t.get_value(key).is_nil() {
                    t.set_value(&ctx, key, value)?;
                    return Ok(None);
                }
                idx
            }
            _ => {
                let idx = metamethod(ctx, table, MetaMethod::NewIndex);
                if idx.is_nil() {
                    return Err(bad_type("index", table, 0));
                }
                idx
            }
        };

        if let Value::Function(function) = idx {
            return Ok(Some(MetaCall {
                function,
                args: [table, key, value],
            }));
        }
        table = idx;
    }

    Err(MetaOperatorError::ChainTooLong("__newindex"))
}

/// Resolve a value into something callable, following `__call` metamethods.
///
/// Every value passed through along the way is bound as a leading argument of the returned
/// function.
pub fn call<'gc>(ctx: Context<'gc>, v: Value<'gc>) -> Result<Function<'gc>, MetaOperatorError> {
    let mut v = v;
    let mut bound = Vec::new();
    for _ in 0..ctx.limits().max_tag_loop {
        if let Value::Function(f) = v {
            return Ok(if bound.is_empty() {
                f
            } else {
                bound.reverse();
                f.bind(ctx, Variadic(bound))
            });
        }

        let mm = metamethod(ctx, v, MetaMethod::Call);
        if mm.is_nil() {
            return Err(bad_type("call", v, 0));
        }
        bound.push(v);
        v = mm;
    }

    Err(MetaOperatorError::ChainTooLong("__call"))
}

pub fn arithmetic<'gc>(
    ctx: Context<'gc>,
    op: ArithOp,
    lhs: Value<'gc>,
    rhs: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    if let Some(v) = raw_ops::arithmetic(op, lhs, rhs) {
        return Ok(v.into());
    }

    if let Some(mm) = binary_metamethod(ctx, lhs, rhs, op.metamethod()) {
        return Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [lhs, rhs],
        }));
    }

    Err(arithmetic_error(op, lhs, rhs))
}

fn arithmetic_error<'gc>(op: ArithOp, lhs: Value<'gc>, rhs: Value<'gc>) -> MetaOperatorError {
    let (ln, rn) = (lhs.to_numeric(), rhs.to_numeric());
    if op.is_bitwise() {
        if ln.is_some() && rn.is_some() {
            let operand = if lhs.to_integer().is_none() { 0 } else { 1 };
            return MetaOperatorError::NoIntegerRepresentation { operand };
        }
        let operand = if ln.is_none() { 0 } else { 1 };
        let bad = if operand == 0 { lhs } else { rhs };
        return bad_type("perform bitwise operation on", bad, operand);
    }

    match (op, ln, rn) {
        (ArithOp::IDiv, Some(Value::Integer(_)), Some(Value::Integer(0))) => {
            MetaOperatorError::IntDivByZero
        }
        (ArithOp::Mod, Some(Value::Integer(_)), Some(Value::Integer(0))) => {
            MetaOperatorError::IntModByZero
        }
        _ => {
            let operand = if ln.is_none() { 0 } else { 1 };
            let bad = if operand == 0 { lhs } else { rhs };
            bad_type("perform arithmetic on", bad, operand)
        }
    }
}

pub fn negate<'gc>(
    ctx: Context<'gc>,
    v: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    if let Some(r) = raw_ops::negate(v) {
        return Ok(r.into());
    }

    let mm = metamethod(ctx, v, MetaMethod::Unm);
    if !mm.is_nil() {
        return Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [v, v],
        }));
    }

    Err(bad_type("perform arithmetic on", v, 0))
}

pub fn bitwise_not<'gc>(
    ctx: Context<'gc>,
    v: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    if let Some(r) = raw_ops::bitwise_not(v) {
        return Ok(r.into());
    }

    let mm = metamethod(ctx, v, MetaMethod::BNot);
    if !mm.is_nil() {
        return Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [v, v],
        }));
    }

    if v.to_numeric().is_some() {
        Err(MetaOperatorError::NoIntegerRepresentation { operand: 0 })
    } else {
        Err(bad_type("perform bitwise operation on", v, 0))
    }
}

pub fn len<'gc>(ctx: Context<'gc>, v: Value<'gc>) -> Result<MetaResult<'gc, 1>, MetaOperatorError> {
    let mm = metamethod(ctx, v, MetaMethod::Len);
    if !mm.is_nil() {
        return Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [v],
        }));
    }

    match v {
        Value::String(s) => Ok(MetaResult::Value(s.len().into())),
        Value::Table(t) => Ok(MetaResult::Value(t.length().into())),
        v => Err(bad_type("get length of", v, 0)),
    }
}

/// Equality with `__eq` fallback, only tables and full userdata of the same kind consult it.
pub fn equal<'gc>(
    ctx: Context<'gc>,
    lhs: Value<'gc>,
    rhs: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    if lhs == rhs {
        return Ok(Value::Boolean(true).into());
    }

    match (lhs, rhs) {
        (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_)) => {
            match binary_metamethod(ctx, lhs, rhs, MetaMethod::Eq) {
                Some(mm) => Ok(MetaResult::Call(MetaCall {
                    function: call(ctx, mm)?,
                    args: [lhs, rhs],
                })),
                None => Ok(Value::Boolean(false).into()),
            }
        }
        _ => Ok(Value::Boolean(false).into()),
    }
}

fn compare_error(lhs: Value<'_>, rhs: Value<'_>) -> MetaOperatorError {
    let (l, r) = (lhs.type_name(), rhs.type_name());
    if l == r {
        MetaOperatorError::CompareSame(l)
    } else {
        MetaOperatorError::Compare(l, r)
    }
}

pub fn less_than<'gc>(
    ctx: Context<'gc>,
    lhs: Value<'gc>,
    rhs: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    if let Some(b) = raw_ops::less_than(lhs, rhs) {
        return Ok(Value::Boolean(b).into());
    }

    match binary_metamethod(ctx, lhs, rhs, MetaMethod::Lt) {
        Some(mm) => Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [lhs, rhs],
        })),
        None => Err(compare_error(lhs, rhs)),
    }
}

pub fn less_equal<'gc>(
    ctx: Context<'gc>,
    lhs: Value<'gc>,
    rhs: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    if let Some(b) = raw_ops::less_equal(lhs, rhs) {
        return Ok(Value::Boolean(b).into());
    }

    match binary_metamethod(ctx, lhs, rhs, MetaMethod::Le) {
        Some(mm) => Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [lhs, rhs],
        })),
        None => Err(compare_error(lhs, rhs)),
    }
}

fn is_concatable(v: Value<'_>) -> bool {
    matches!(v, Value::String(_) | Value::Integer(_) | Value::Number(_))
}

pub fn concat<'gc>(
    ctx: Context<'gc>,
    lhs: Value<'gc>,
    rhs: Value<'gc>,
) -> Result<MetaResult<'gc, 2>, MetaOperatorError> {
    if is_concatable(lhs) && is_concatable(rhs) {
        if let Ok(s) = String::concat(ctx, &[lhs, rhs]) {
            return Ok(Value::String(s).into());
        }
    }

    match binary_metamethod(ctx, lhs, rhs, MetaMethod::Concat) {
        Some(mm) => Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [lhs, rhs],
        })),
        None => {
            let operand = if is_concatable(lhs) { 1 } else { 0 };
            let bad = if operand == 0 { lhs } else { rhs };
            Err(bad_type("concatenate", bad, operand))
        }
    }
}

/// Converts a value to a string the way `tostring` does, honouring `__tostring` and `__name`.
pub fn tostring<'gc>(
    ctx: Context<'gc>,
    v: Value<'gc>,
) -> Result<MetaResult<'gc, 1>, MetaOperatorError> {
    let mm = metamethod(ctx, v, MetaMethod::ToString);
    if !mm.is_nil() {
        return Ok(MetaResult::Call(MetaCall {
            function: call(ctx, mm)?,
            args: [v],
        }));
    }

    Ok(match v {
        Value::String(_) => MetaResult::Value(v),
        v => {
            let s = match metamethod(ctx, v, MetaMethod::Name) {
                Value::String(name) => {
                    // Only tables and userdata have metatables, both display as `type: address`.
                    let shown = v.display().to_string();
                    format!("{}{}", name.display_lossy(), &shown[v.type_name().len()..])
                }
                _ => v.display().to_string(),
            };
            MetaResult::Value(Value::String(ctx.intern(s.as_bytes())))
        }
    })
}

#[derive(Debug, Copy, Clone, Error)]
#[error("value has no '__close' metamethod")]
pub struct NotClosable;

/// The `__close` metamethod of a to-be-closed value.
///
/// `Ok(None)` means the value is false or nil and nothing needs to be closed.
pub fn close<'gc>(ctx: Context<'gc>, v: Value<'gc>) -> Result<Option<Value<'gc>>, NotClosable> {
    if !v.to_bool() {
        return Ok(None);
    }
    let mm = metamethod(ctx, v, MetaMethod::Close);
    if mm.is_nil() {
        Err(NotClosable)
    } else {
        Ok(Some(mm))
    }
}

#[cfg(test)]
mod tests {
    use crate::{Lua, Table};

    use super::*;

    #[test]
    fn test_index_chain() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            let base = Table::new(&ctx);
            base.set(ctx, "x", 7).unwrap();

            let mid = Table::new(&ctx);
            let mid_mt = Table::new(&ctx);
            mid_mt.set(ctx, MetaMethod::Index, base).unwrap();
            mid.set_metatable(&ctx, Some(mid_mt));

            let top = Table::new(&ctx);
            let top_mt = Table::new(&ctx);
            top_mt.set(ctx, MetaMethod::Index, mid).unwrap();
            top.set_metatable(&ctx, Some(top_mt));

            let key = "x".into_value(ctx);
            assert!(matches!(
                index(ctx, top.into(), key),
                Ok(MetaResult::Value(Value::Integer(7)))
            ));

            let looping = Table::new(&ctx);
            let looping_mt = Table::new(&ctx);
            looping_mt.set(ctx, MetaMethod::Index, looping).unwrap();
            looping.set_metatable(&ctx, Some(looping_mt));
            assert!(matches!(
                index(ctx, looping.into(), key),
                Err(MetaOperatorError::ChainTooLong("__index"))
            ));

            assert_eq!(
                index(ctx, Value::Nil, key).unwrap_err().to_string(),
                "attempt to index a nil value"
            );
        });
    }

    #[test]
    fn test_new_index_sets_present_keys_raw() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            let t = Table::new(&ctx);
            let mt = Table::new(&ctx);
            let other = Table::new(&ctx);
            mt.set(ctx, MetaMethod::NewIndex, other).unwrap();
            t.set_metatable(&ctx, Some(mt));
            t.set(ctx, 1, true).unwrap();

            assert!(new_index(ctx, t.into(), Value::Integer(1), Value::Integer(5))
                .unwrap()
                .is_none());
            assert_eq!(t.get(ctx, 1), Value::Integer(5));

            assert!(new_index(ctx, t.into(), Value::Integer(2), Value::Integer(6))
                .unwrap()
                .is_none());
            assert_eq!(t.get(ctx, 2), Value::Nil);
            assert_eq!(other.get(ctx, 2), Value::Integer(6));

            assert!(matches!(
                new_index(ctx, t.into(), Value::Nil, Value::Integer(1)),
                Err(MetaOperatorError::InvalidKey(InvalidTableKey::IsNil))
            ));
        });
    }

    #[test]
    fn test_operator_errors() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            let t = Value::Table(Table::new(&ctx));
            assert_eq!(
                arithmetic(ctx, ArithOp::Add, Value::Integer(1), t)
                    .unwrap_err()
                    .to_string(),
                "attempt to perform arithmetic on a table value"
            );
            assert_eq!(
                arithmetic(ctx, ArithOp::IDiv, Value::Integer(1), Value::Integer(0))
                    .unwrap_err()
                    .to_string(),
                "attempt to perform 'n//0'"
            );
            assert_eq!(
                arithmetic(ctx, ArithOp::Mod, Value::Integer(1), Value::Integer(0))
                    .unwrap_err()
                    .to_string(),
                "attempt to perform 'n%0'"
            );
            assert!(matches!(
                arithmetic(ctx, ArithOp::BOr, Value::Number(1.5), Value::Integer(1)),
                Err(MetaOperatorError::NoIntegerRepresentation { operand: 0 })
            ));
            assert_eq!(
                less_than(ctx, Value::Integer(1), Value::Boolean(true))
                    .unwrap_err()
                    .to_string(),
                "attempt to compare number with boolean"
            );
            assert_eq!(
                less_equal(ctx, t, t).unwrap_err().to_string(),
                "attempt to compare two table values"
            );
            assert!(matches!(
                concat(ctx, Value::Integer(1), Value::Nil),
                Err(MetaOperatorError::BadType { operand: 1, .. })
            ));
            assert!(matches!(
                arithmetic(ctx, ArithOp::Add, "10".into_value(ctx), Value::Integer(1)),
                Ok(MetaResult::Value(Value::Integer(11)))
            ));
        });
    }

    #[test]
    fn test_equal_without_metamethod() {
        let mut lua = Lua::new();
        lua.enter(|ctx| {
            let a = Value::Table(Table::new(&ctx));
            let b = Value::Table(Table::new(&ctx));
            assert!(matches!(
                equal(ctx, a, a),
                Ok(MetaResult::Value(Value::Boolean(true)))
            ));
            assert!(matches!(
                equal(ctx, a, b),
                Ok(MetaResult::Value(Value::Boolean(false)))
            ));
            assert!(matches!(
                equal(ctx, Value::Integer(1), Value::Number(1.0)),
                Ok(MetaResult::Value(Value::Boolean(true)))
            ));
        });
    }
}
