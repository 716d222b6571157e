//! Numeral parsing, formatting and the exact integer / float conversions shared by the raw
//! operators and the VM.

use std::{cmp::Ordering, str};

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Numeral {
    Integer(i64),
    Float(f64),
}

/// Parses a numeral the way string to number coercion does: surrounding whitespace is ignored,
/// hex integers wrap around, decimal integers that overflow become floats.
pub fn parse(s: &[u8]) -> Option<Numeral> {
    let s = trim_whitespace(s);
    let (is_neg, digits) = read_sign(s);
    if digits.len() >= 2 && digits[0] == b'0' && matches!(digits[1], b'x' | b'X') {
        let digits = &digits[2..];
        if let Some(i) = read_hex_integer(digits) {
            return Some(Numeral::Integer(if is_neg { i.wrapping_neg() } else { i }));
        }
        let f = read_hex_float(digits)?;
        return Some(Numeral::Float(if is_neg { -f } else { f }));
    }

    if let Some(i) = read_dec_integer(is_neg, digits) {
        return Some(Numeral::Integer(i));
    }
    if matches!(digits.first(), Some(b'+' | b'-'))
        || !digits
            .iter()
            .all(|&c| c.is_ascii_digit() || matches!(c, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return None;
    }
    let f: f64 = str::from_utf8(digits).ok()?.parse().ok()?;
    Some(Numeral::Float(if is_neg { -f } else { f }))
}

/// Converts a float with an exact integer representation to that integer.
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f.floor() == f {
        float_in_range(f)
    } else {
        None
    }
}

/// Converts a float to an integer rounding towards negative infinity, if the result fits.
pub fn float_floor_to_integer(f: f64) -> Option<i64> {
    float_in_range(f.floor())
}

/// Converts a float to an integer rounding towards positive infinity, if the result fits.
pub fn float_ceil_to_integer(f: f64) -> Option<i64> {
    float_in_range(f.ceil())
}

fn float_in_range(f: f64) -> Option<i64> {
    // -2^63 is exactly representable, 2^63 is the first float out of range.
    if f >= -9223372036854775808.0 && f < 9223372036854775808.0 {
        Some(f as i64)
    } else {
        None
    }
}

/// Logical shift, negative shift amounts shift right.
pub fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> -n) as i64
    }
}

// Integers in this range convert to floats without losing precision.
fn int_fits_float(i: i64) -> bool {
    const MAX_EXACT: i64 = 1 << 53;
    (-MAX_EXACT..=MAX_EXACT).contains(&i)
}

pub fn int_less_than_float(i: i64, f: f64) -> bool {
    if int_fits_float(i) {
        (i as f64) < f
    } else {
        match float_ceil_to_integer(f) {
            Some(fi) => i < fi,
            None => f > 0.0,
        }
    }
}

pub fn int_less_equal_float(i: i64, f: f64) -> bool {
    if int_fits_float(i) {
        (i as f64) <= f
    } else {
        match float_floor_to_integer(f) {
            Some(fi) => i <= fi,
            None => f > 0.0,
        }
    }
}

pub fn float_less_than_int(f: f64, i: i64) -> bool {
    if int_fits_float(i) {
        f < (i as f64)
    } else {
        match float_floor_to_integer(f) {
            Some(fi) => fi < i,
            None => f < 0.0,
        }
    }
}

pub fn float_less_equal_int(f: f64, i: i64) -> bool {
    if int_fits_float(i) {
        f <= (i as f64)
    } else {
        match float_ceil_to_integer(f) {
            Some(fi) => fi <= i,
            None => f < 0.0,
        }
    }
}

/// String ordering is byte order, embedded zero bytes sort below every other byte.
pub fn compare_strings(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Formats a float with 14 significant digits, keeping a trailing `.0` on integral values so
/// that floats never print like integers.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan" } else { "nan" }.to_owned();
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf" } else { "inf" }.to_owned();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_owned();
    }

    const PRECISION: i32 = 14;
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, f);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);

    let mut out = if exp < -4 || exp >= PRECISION {
        format!(
            "{}e{}{:02}",
            strip_fraction_zeros(mantissa),
            if exp < 0 { '-' } else { '+' },
            exp.abs()
        )
    } else {
        let fixed = format!("{:.*}", (PRECISION - 1 - exp) as usize, f);
        strip_fraction_zeros(&fixed).to_owned()
    };

    if !out.contains(&['.', 'e'][..]) {
        out.push_str(".0");
    }
    out
}

fn strip_fraction_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn trim_whitespace(s: &[u8]) -> &[u8] {
    let is_space = |c: &u8| matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c);
    let start = s.iter().position(|c| !is_space(c)).unwrap_or(s.len());
    let end = s.iter().rposition(|c| !is_space(c)).map_or(start, |i| i + 1);
    &s[start..end.max(start)]
}

fn read_sign(s: &[u8]) -> (bool, &[u8]) {
    match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    }
}

fn read_dec_integer(is_neg: bool, s: &[u8]) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let mut i: u64 = 0;
    for &c in s {
        if !c.is_ascii_digit() {
            return None;
        }
        i = i.checked_mul(10)?.checked_add((c - b'0') as u64)?;
    }
    if is_neg {
        if i <= i64::MAX as u64 + 1 {
            Some((i as i64).wrapping_neg())
        } else {
            None
        }
    } else {
        i.try_into().ok()
    }
}

fn read_hex_integer(s: &[u8]) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    let mut i: u64 = 0;
    for &c in s {
        let d = (c as char).to_digit(16)?;
        i = i.wrapping_mul(16).wrapping_add(d as u64);
    }
    Some(i as i64)
}

fn read_hex_float(s: &[u8]) -> Option<f64> {
    let (mantissa, exponent) = match s.iter().position(|&c| c == b'p' || c == b'P') {
        Some(p) => (&s[..p], Some(&s[p + 1..])),
        None => (s, None),
    };

    let mut value = 0.0f64;
    let mut scale = 0i32;
    let mut seen_dot = false;
    let mut any_digit = false;
    for &c in mantissa {
        if c == b'.' {
            if seen_dot {
                return None;
            }
            seen_dot = true;
        } else {
            value = value * 16.0 + (c as char).to_digit(16)? as f64;
            any_digit = true;
            if seen_dot {
                scale -= 4;
            }
        }
    }
    if !any_digit {
        return None;
    }

    if let Some(exponent) = exponent {
        let (neg, digits) = read_sign(exponent);
        let e = read_dec_integer(false, digits)?;
        let e: i32 = e.try_into().ok()?;
        scale += if neg { -e } else { e };
    }

    Some(value * 2f64.powi(scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(parse(b"  42  "), Some(Numeral::Integer(42)));
        assert_eq!(parse(b"-0x10"), Some(Numeral::Integer(-16)));
        assert_eq!(parse(b"0xffffffffffffffff"), Some(Numeral::Integer(-1)));
        assert_eq!(parse(b"0x1p4"), Some(Numeral::Float(16.0)));
        assert_eq!(parse(b"1.5e1"), Some(Numeral::Float(15.0)));
        assert_eq!(
            parse(b"9223372036854775808"),
            Some(Numeral::Float(9223372036854775808.0))
        );
        assert_eq!(
            parse(b"-9223372036854775808"),
            Some(Numeral::Integer(i64::MIN))
        );
        assert_eq!(parse(b"inf"), None);
        assert_eq!(parse(b"1 2"), None);
        assert_eq!(parse(b""), None);
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(1e15), "1e+15");
        assert_eq!(format_float(1e100), "1e+100");
        assert_eq!(format_float(f64::INFINITY), "inf");
        assert_eq!(format_float(1.0 / 3.0), "0.33333333333333");
    }

    #[test]
    fn test_int_float_order() {
        let big = i64::MAX;
        assert!(int_less_than_float(big, 9223372036854775808.0));
        assert!(!int_less_than_float(big, 9223372036854774784.0));
        assert!(float_less_than_int(-1e300, i64::MIN));
        assert!(!int_less_than_float(1, f64::NAN));
        assert!(int_less_equal_float(3, 3.0));
        assert!(float_less_equal_int(2.5, 3));
    }

    #[test]
    fn test_shift() {
        assert_eq!(shift_left(1, 63), i64::MIN);
        assert_eq!(shift_left(-1, -63), 1);
        assert_eq!(shift_left(1, 64), 0);
    }
}
