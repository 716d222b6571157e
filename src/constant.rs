use std::hash::{Hash, Hasher};

use gc_arena::Collect;

use crate::number;

/// A value that can appear in a prototype's constant pool.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub enum Constant<S> {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(S),
}

impl<S> Constant<S> {
    pub fn to_bool(&self) -> bool {
        !matches!(self, Self::Nil | Self::Boolean(false))
    }

    pub fn as_string_ref(&self) -> Constant<&S> {
        match self {
            Constant::Nil => Constant::Nil,
            Constant::Boolean(b) => Constant::Boolean(*b),
            Constant::Integer(i) => Constant::Integer(*i),
            Constant::Number(n) => Constant::Number(*n),
            Constant::String(s) => Constant::String(s),
        }
    }

    pub fn map_string<S2>(self, f: impl FnOnce(S) -> S2) -> Constant<S2> {
        match self {
            Constant::Nil => Constant::Nil,
            Constant::Boolean(b) => Constant::Boolean(b),
            Constant::Integer(i) => Constant::Integer(i),
            Constant::Number(n) => Constant::Number(n),
            Constant::String(s) => Constant::String(f(s)),
        }
    }
}

impl<S: AsRef<[u8]>> Constant<S> {
    /// Converts the given constant to an integer or number, if possible.
    ///
    /// Strings are coerced by parsing them as numerals after trimming whitespace.
    pub fn to_numeric(&self) -> Option<Constant<S>> {
        match self {
            &Self::Integer(a) => Some(Constant::Integer(a)),
            &Self::Number(a) => Some(Constant::Number(a)),
            Self::String(a) => match number::parse(a.as_ref())? {
                number::Numeral::Integer(i) => Some(Constant::Integer(i)),
                number::Numeral::Float(n) => Some(Constant::Number(n)),
            },
            _ => None,
        }
    }

    /// Interprets Numbers, Integers, and Strings as a Number, if possible.
    pub fn to_number(&self) -> Option<f64> {
        match self.to_numeric()? {
            Self::Integer(a) => Some(a as f64),
            Self::Number(a) => Some(a),
            _ => None,
        }
    }

    /// Interprets Numbers, Integers, and Strings as an Integer, if possible.
    ///
    /// Floats only convert when they have an exact integer representation.
    pub fn to_integer(&self) -> Option<i64> {
        match self.to_numeric()? {
            Self::Integer(a) => Some(a),
            Self::Number(a) => number::float_to_integer(a),
            _ => None,
        }
    }

    fn numeric_pair(&self, rhs: &Self) -> Option<(Self, Self)> {
        Some((self.to_numeric()?, rhs.to_numeric()?))
    }

    pub fn add(&self, rhs: &Self) -> Option<Self> {
        Some(match self.numeric_pair(rhs)? {
            (Self::Integer(a), Self::Integer(b)) => Self::Integer(a.wrapping_add(b)),
            (a, b) => Self::Number(a.to_number()? + b.to_number()?),
        })
    }

    pub fn subtract(&self, rhs: &Self) -> Option<Self> {
        Some(match self.numeric_pair(rhs)? {
            (Self::Integer(a), Self::Integer(b)) => Self::Integer(a.wrapping_sub(b)),
            (a, b) => Self::Number(a.to_number()? - b.to_number()?),
        })
    }

    pub fn multiply(&self, rhs: &Self) -> Option<Self> {
        Some(match self.numeric_pair(rhs)? {
            (Self::Integer(a), Self::Integer(b)) => Self::Integer(a.wrapping_mul(b)),
            (a, b) => Self::Number(a.to_number()? * b.to_number()?),
        })
    }

    /// Always returns a Number, even when called with Integer arguments.
    pub fn float_divide(&self, rhs: &Self) -> Option<Self> {
        Some(Self::Number(self.to_number()? / rhs.to_number()?))
    }

    /// Returns an Integer only if both arguments are Integers, rounding towards negative
    /// infinity. Integer division by zero yields `None`, callers must check for it first.
    pub fn floor_divide(&self, rhs: &Self) -> Option<Self> {
        match self.numeric_pair(rhs)? {
            (Self::Integer(a), Self::Integer(b)) => {
                if b == 0 {
                    return None;
                }
                let d = a.wrapping_div(b);
                let r = a.wrapping_rem(b);
                Some(Self::Integer(if r != 0 && (r ^ b) < 0 { d - 1 } else { d }))
            }
            (a, b) => Some(Self::Number((a.to_number()? / b.to_number()?).floor())),
        }
    }

    /// The modulus operator, whose result takes the sign of the divisor.
    pub fn modulo(&self, rhs: &Self) -> Option<Self> {
        match self.numeric_pair(rhs)? {
            (Self::Integer(a), Self::Integer(b)) => {
                if b == 0 {
                    return None;
                }
                let r = a.wrapping_rem(b);
                Some(Self::Integer(if r != 0 && (r ^ b) < 0 { r + b } else { r }))
            }
            (a, b) => {
                let (a, b) = (a.to_number()?, b.to_number()?);
                let r = a % b;
                Some(Self::Number(if r != 0.0 && (r < 0.0) != (b < 0.0) {
                    r + b
                } else {
                    r
                }))
            }
        }
    }

    /// Always returns a Number, even when called with Integer arguments.
    pub fn exponentiate(&self, rhs: &Self) -> Option<Self> {
        Some(Self::Number(self.to_number()?.powf(rhs.to_number()?)))
    }

    pub fn negate(&self) -> Option<Self> {
        match self {
            &Self::Integer(a) => Some(Self::Integer(a.wrapping_neg())),
            &Self::Number(a) => Some(Self::Number(-a)),
            s => s.to_numeric()?.negate(),
        }
    }

    pub fn bitwise_not(&self) -> Option<Self> {
        Some(Self::Integer(!self.to_integer()?))
    }

    pub fn bitwise_and(&self, rhs: &Self) -> Option<Self> {
        Some(Self::Integer(self.to_integer()? & rhs.to_integer()?))
    }

    pub fn bitwise_or(&self, rhs: &Self) -> Option<Self> {
        Some(Self::Integer(self.to_integer()? | rhs.to_integer()?))
    }

    pub fn bitwise_xor(&self, rhs: &Self) -> Option<Self> {
        Some(Self::Integer(self.to_integer()? ^ rhs.to_integer()?))
    }

    pub fn shift_left(&self, rhs: &Self) -> Option<Self> {
        Some(Self::Integer(number::shift_left(
            self.to_integer()?,
            rhs.to_integer()?,
        )))
    }

    pub fn shift_right(&self, rhs: &Self) -> Option<Self> {
        Some(Self::Integer(number::shift_left(
            self.to_integer()?,
            rhs.to_integer()?.wrapping_neg(),
        )))
    }

    /// Raw equality: integers and floats compare by mathematical value.
    pub fn is_equal(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Integer(a), Self::Number(b)) | (Self::Number(b), Self::Integer(a)) => {
                number::float_to_integer(*b) == Some(*a)
            }
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a.as_ref() == b.as_ref(),
            _ => false,
        }
    }

    /// `None` if the two constants cannot be ordered without a metamethod.
    pub fn less_than(&self, rhs: &Self) -> Option<bool> {
        Some(match (self, rhs) {
            (Self::Integer(a), Self::Integer(b)) => a < b,
            (Self::Number(a), Self::Number(b)) => a < b,
            (&Self::Integer(a), &Self::Number(b)) => number::int_less_than_float(a, b),
            (&Self::Number(a), &Self::Integer(b)) => number::float_less_than_int(a, b),
            (Self::String(a), Self::String(b)) => {
                number::compare_strings(a.as_ref(), b.as_ref()).is_lt()
            }
            _ => return None,
        })
    }

    pub fn less_equal(&self, rhs: &Self) -> Option<bool> {
        Some(match (self, rhs) {
            (Self::Integer(a), Self::Integer(b)) => a <= b,
            (Self::Number(a), Self::Number(b)) => a <= b,
            (&Self::Integer(a), &Self::Number(b)) => number::int_less_equal_float(a, b),
            (&Self::Number(a), &Self::Integer(b)) => number::float_less_equal_int(a, b),
            (Self::String(a), Self::String(b)) => {
                number::compare_strings(a.as_ref(), b.as_ref()).is_le()
            }
            _ => return None,
        })
    }
}

impl<S: AsRef<[u8]>> PartialEq for Constant<S> {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

/// Wrapper for a `Constant` that implements Hash and Eq, and only compares equal when the types are
/// bit for bit identical.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct IdenticalConstant<S>(pub Constant<S>);

impl<S: AsRef<[u8]>> PartialEq for IdenticalConstant<S> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Constant::Nil, Constant::Nil) => true,
            (Constant::Boolean(a), Constant::Boolean(b)) => a == b,
            (Constant::Integer(a), Constant::Integer(b)) => a == b,
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a.as_ref() == b.as_ref(),
            _ => false,
        }
    }
}

impl<S: AsRef<[u8]>> Eq for IdenticalConstant<S> {}

impl<S: AsRef<[u8]>> Hash for IdenticalConstant<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Constant::Nil => 0u8.hash(state),
            Constant::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Constant::Integer(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Constant::Number(n) => {
                3u8.hash(state);
                n.to_bits().hash(state);
            }
            Constant::String(s) => {
                4u8.hash(state);
                s.as_ref().hash(state);
            }
        }
    }
}
