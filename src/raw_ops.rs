//! Operators on primitive values that never consult a metatable.
//!
//! Every function returns `None` when its operands are not of a type the operator handles
//! directly, which is the signal to fall back to metamethods.

use crate::{opcode::ArithOp, Value};

pub fn arithmetic<'gc>(op: ArithOp, lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    match op {
        ArithOp::Add => add(lhs, rhs),
        ArithOp::Sub => subtract(lhs, rhs),
        ArithOp::Mul => multiply(lhs, rhs),
        ArithOp::Div => float_divide(lhs, rhs),
        ArithOp::IDiv => floor_divide(lhs, rhs),
        ArithOp::Mod => modulo(lhs, rhs),
        ArithOp::Pow => exponentiate(lhs, rhs),
        ArithOp::BAnd => bitwise_and(lhs, rhs),
        ArithOp::BOr => bitwise_or(lhs, rhs),
        ArithOp::BXor => bitwise_xor(lhs, rhs),
        ArithOp::Shl => shift_left(lhs, rhs),
        ArithOp::Shr => shift_right(lhs, rhs),
    }
}

pub fn add<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        return Some(Value::Integer(a.wrapping_add(b)));
    }
    Some(lhs.to_constant()?.add(&rhs.to_constant()?)?.into())
}

pub fn subtract<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        return Some(Value::Integer(a.wrapping_sub(b)));
    }
    Some(lhs.to_constant()?.subtract(&rhs.to_constant()?)?.into())
}

pub fn multiply<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        return Some(Value::Integer(a.wrapping_mul(b)));
    }
    Some(lhs.to_constant()?.multiply(&rhs.to_constant()?)?.into())
}

pub fn float_divide<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.float_divide(&rhs.to_constant()?)?.into())
}

/// Integer division by zero also returns `None`, callers must check for it first.
pub fn floor_divide<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.floor_divide(&rhs.to_constant()?)?.into())
}

/// Integer modulo by zero also returns `None`, callers must check for it first.
pub fn modulo<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.modulo(&rhs.to_constant()?)?.into())
}

pub fn exponentiate<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.exponentiate(&rhs.to_constant()?)?.into())
}

pub fn negate<'gc>(v: Value<'gc>) -> Option<Value<'gc>> {
    Some(v.to_constant()?.negate()?.into())
}

pub fn bitwise_not<'gc>(v: Value<'gc>) -> Option<Value<'gc>> {
    Some(v.to_constant()?.bitwise_not()?.into())
}

pub fn bitwise_and<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.bitwise_and(&rhs.to_constant()?)?.into())
}

pub fn bitwise_or<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.bitwise_or(&rhs.to_constant()?)?.into())
}

pub fn bitwise_xor<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.bitwise_xor(&rhs.to_constant()?)?.into())
}

pub fn shift_left<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.shift_left(&rhs.to_constant()?)?.into())
}

pub fn shift_right<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<Value<'gc>> {
    Some(lhs.to_constant()?.shift_right(&rhs.to_constant()?)?.into())
}

/// Numbers compare by mathematical value and strings byte-wise, strings are never coerced.
pub fn less_than<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<bool> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        return Some(a < b);
    }
    lhs.to_constant()?.less_than(&rhs.to_constant()?)
}

pub fn less_equal<'gc>(lhs: Value<'gc>, rhs: Value<'gc>) -> Option<bool> {
    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        return Some(a <= b);
    }
    lhs.to_constant()?.less_equal(&rhs.to_constant()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_arithmetic() {
        assert_eq!(
            arithmetic(ArithOp::Add, Value::Integer(i64::MAX), Value::Integer(1)),
            Some(Value::Integer(i64::MIN))
        );
        assert_eq!(
            arithmetic(ArithOp::Div, Value::Integer(7), Value::Integer(2)),
            Some(Value::Number(3.5))
        );
        assert_eq!(
            arithmetic(ArithOp::IDiv, Value::Integer(-7), Value::Integer(2)),
            Some(Value::Integer(-4))
        );
        assert_eq!(
            arithmetic(ArithOp::Mod, Value::Integer(-7), Value::Integer(3)),
            Some(Value::Integer(2))
        );
        assert_eq!(arithmetic(ArithOp::IDiv, Value::Integer(1), Value::Integer(0)), None);
        assert_eq!(arithmetic(ArithOp::Mod, Value::Integer(1), Value::Integer(0)), None);
        assert_eq!(
            arithmetic(ArithOp::IDiv, Value::Number(1.0), Value::Integer(0)),
            Some(Value::Number(f64::INFINITY))
        );
        assert_eq!(
            arithmetic(ArithOp::BAnd, Value::Number(3.0), Value::Integer(1)),
            Some(Value::Integer(1))
        );
        assert_eq!(arithmetic(ArithOp::BAnd, Value::Number(3.5), Value::Integer(1)), None);
        assert_eq!(arithmetic(ArithOp::Add, Value::Nil, Value::Integer(1)), None);
    }

    #[test]
    fn test_raw_comparison() {
        assert_eq!(less_than(Value::Integer(1), Value::Number(1.5)), Some(true));
        assert_eq!(less_equal(Value::Number(2.0), Value::Integer(2)), Some(true));
        assert_eq!(less_than(Value::Integer(i64::MAX), Value::Number(2f64.powi(63))), Some(true));
        assert_eq!(less_than(Value::Nil, Value::Integer(1)), None);
        assert_eq!(less_than(Value::Number(f64::NAN), Value::Integer(1)), Some(false));
    }
}
