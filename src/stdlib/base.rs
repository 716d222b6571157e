use std::io::{self, Write};

use gc_arena::Collect;

use crate::{
    meta_ops::{self, MetaMethod, MetaResult},
    table::NextValue,
    thread, BoxSequence, Callback, CallbackReturn, Context, Error, Execution, Function, Sequence,
    SequencePoll, Stack, String, Table, Value,
};

use super::{argument, bad_argument};

pub fn load_base<'gc>(ctx: Context<'gc>) {
    let globals = ctx.globals();

    globals.set_field(
        ctx,
        "print",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let values = stack.drain(..).collect();
            Ok(CallbackReturn::Sequence(BoxSequence::new(
                &ctx,
                ToStrings::new(values, Finish::Print),
            )))
        }),
    );

    globals.set_field(
        ctx,
        "error",
        Callback::from_fn(&ctx, |ctx, exec, stack| {
            let value = stack.get(0);
            let level = argument::<Option<i64>>(ctx, &stack, 1, "error")?.unwrap_or(1);

            let value = match value {
                Value::String(msg) if level > 0 => {
                    match thread::location(exec.frames(), stack.full(), level as usize) {
                        Some(loc) => {
                            let mut positioned = loc.into_bytes();
                            positioned.push(b' ');
                            positioned.extend_from_slice(msg.as_bytes());
                            Value::String(ctx.intern(&positioned))
                        }
                        None => value,
                    }
                }
                _ => value,
            };
            Err(Error::from_value(value))
        }),
    );

    globals.set_field(
        ctx,
        "assert",
        Callback::from_fn(&ctx, |ctx, _, stack| {
            if stack.is_empty() {
                return Err(bad_argument(ctx, 0, "assert", "value expected"));
            }
            if stack.get(0).to_bool() {
                Ok(CallbackReturn::Return)
            } else if stack.len() < 2 {
                Err(Error::message(ctx, "assertion failed!"))
            } else {
                Err(Error::from_value(stack.get(1)))
            }
        }),
    );

    globals.set_field(
        ctx,
        "pcall",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            if stack.is_empty() {
                return Err(bad_argument(ctx, 0, "pcall", "value expected"));
            }
            let function = match meta_ops::call(ctx, stack.get(0)) {
                Ok(function) => function,
                Err(err) => {
                    stack.replace(ctx, (false, err.to_string()));
                    return Ok(CallbackReturn::Return);
                }
            };
            stack.pop_front();
            Ok(CallbackReturn::Protected {
                function,
                handler: None,
            })
        }),
    );

    globals.set_field(
        ctx,
        "xpcall",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let handler: Function = argument(ctx, &stack, 1, "xpcall")?;
            let function = match meta_ops::call(ctx, stack.get(0)) {
                Ok(function) => function,
                // The handler still sees the failed call.
                Err(err) => {
                    let message = Value::String(ctx.intern(err.to_string().as_bytes()));
                    Callback::from_fn_with(&ctx, message, |&message, _, _, _| {
                        Err(Error::from_value(message))
                    })
                    .into()
                }
            };
            stack.drain(..2);
            Ok(CallbackReturn::Protected {
                function,
                handler: Some(handler),
            })
        }),
    );

    globals.set_field(
        ctx,
        "select",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let count = stack.len() as i64 - 1;
            if let Value::String(s) = stack.get(0) {
                if s.as_bytes() == b"#" {
                    stack.replace(ctx, count);
                    return Ok(CallbackReturn::Return);
                }
            }

            let i: i64 = argument(ctx, &stack, 0, "select")?;
            if i > 0 {
                stack.drain(..(i.min(count + 1) as usize));
            } else if i < 0 && count + i >= 0 {
                stack.drain(..((count + i + 1) as usize));
            } else {
                return Err(bad_argument(ctx, 0, "select", "index out of range"));
            }
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "type",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            if stack.is_empty() {
                return Err(bad_argument(ctx, 0, "type", "value expected"));
            }
            let type_name = stack.get(0).type_name();
            stack.replace(ctx, type_name);
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "tostring",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            if stack.is_empty() {
                return Err(bad_argument(ctx, 0, "tostring", "value expected"));
            }
            let value = stack.get(0);
            stack.clear();
            Ok(CallbackReturn::Sequence(BoxSequence::new(
                &ctx,
                ToStrings::new(vec![value], Finish::Return),
            )))
        }),
    );

    globals.set_field(
        ctx,
        "tonumber",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            if stack.is_empty() {
                return Err(bad_argument(ctx, 0, "tonumber", "value expected"));
            }
            let result = match argument::<Option<i64>>(ctx, &stack, 1, "tonumber")? {
                None => stack.get(0).to_numeric().unwrap_or(Value::Nil),
                Some(base) => {
                    let s: String = argument(ctx, &stack, 0, "tonumber")?;
                    if !(2..=36).contains(&base) {
                        return Err(bad_argument(ctx, 1, "tonumber", "base out of range"));
                    }
                    parse_integer(s.as_bytes(), base as u32).map_or(Value::Nil, Value::Integer)
                }
            };
            stack.replace(ctx, result);
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "rawget",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let table: Table = argument(ctx, &stack, 0, "rawget")?;
            let value = table.get_value(stack.get(1));
            stack.replace(ctx, value);
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "rawset",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let table: Table = argument(ctx, &stack, 0, "rawset")?;
            table.set_value(&ctx, stack.get(1), stack.get(2))?;
            stack.replace(ctx, table);
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "rawequal",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            if stack.len() < 2 {
                return Err(bad_argument(ctx, stack.len(), "rawequal", "value expected"));
            }
            let equal = stack.get(0) == stack.get(1);
            stack.replace(ctx, equal);
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "rawlen",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let len = match stack.get(0) {
                Value::Table(t) => t.length(),
                Value::String(s) => s.len(),
                _ => {
                    return Err(bad_argument(ctx, 0, "rawlen", "table or string expected"));
                }
            };
            stack.replace(ctx, len);
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "setmetatable",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let table: Table = argument(ctx, &stack, 0, "setmetatable")?;
            let metatable = match stack.get(1) {
                Value::Nil => None,
                Value::Table(mt) => Some(mt),
                _ => {
                    return Err(bad_argument(ctx, 1, "setmetatable", "nil or table expected"));
                }
            };
            if let Some(current) = table.metatable() {
                if !current.get(ctx, MetaMethod::Metatable).is_nil() {
                    return Err(Error::message(ctx, "cannot change a protected metatable"));
                }
            }
            table.set_metatable(&ctx, metatable);
            stack.replace(ctx, table);
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "getmetatable",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let result = match stack.get(0).metatable() {
                Some(mt) => match mt.get(ctx, MetaMethod::Metatable) {
                    Value::Nil => mt.into(),
                    protected => protected,
                },
                None => Value::Nil,
            };
            stack.replace(ctx, result);
            Ok(CallbackReturn::Return)
        }),
    );

    let next = Callback::from_fn(&ctx, |ctx, _, mut stack| {
        let table: Table = argument(ctx, &stack, 0, "next")?;
        match table.next(stack.get(1)) {
            NextValue::Found { key, value } => stack.replace(ctx, (key, value)),
            NextValue::Last => stack.replace(ctx, Value::Nil),
            NextValue::NotFound => {
                return Err(Error::message(ctx, "invalid key to 'next'"));
            }
        }
        Ok(CallbackReturn::Return)
    });
    globals.set_field(ctx, "next", next);

    globals.set_field(
        ctx,
        "pairs",
        Callback::from_fn_with(&ctx, next, |&next, ctx, _, mut stack| {
            let table: Table = argument(ctx, &stack, 0, "pairs")?;
            stack.replace(ctx, (next, table, Value::Nil));
            Ok(CallbackReturn::Return)
        }),
    );

    let inext = Callback::from_fn(&ctx, |ctx, _, mut stack| {
        let (table, i): (Table, i64) = stack.consume(ctx)?;
        let i = i.wrapping_add(1);
        match table.get(ctx, i) {
            Value::Nil => stack.replace(ctx, Value::Nil),
            value => stack.replace(ctx, (i, value)),
        }
        Ok(CallbackReturn::Return)
    });

    globals.set_field(
        ctx,
        "ipairs",
        Callback::from_fn_with(&ctx, inext, |&inext, ctx, _, mut stack| {
            let table: Table = argument(ctx, &stack, 0, "ipairs")?;
            stack.replace(ctx, (inext, table, 0));
            Ok(CallbackReturn::Return)
        }),
    );

    globals.set_field(
        ctx,
        "collectgarbage",
        Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let option = argument::<Option<String>>(ctx, &stack, 0, "collectgarbage")?;
            match option.as_ref().map(|s| s.as_bytes()).unwrap_or(b"collect") {
                b"count" => {
                    let kbytes = ctx.metrics().total_allocation() as f64 / 1024.0;
                    stack.replace(ctx, kbytes);
                }
                // Collection happens between executor steps, there is nothing to do from inside.
                b"collect" | b"step" => stack.replace(ctx, 0),
                _ => {
                    let option = option.map(|s| s.display_lossy().to_string());
                    return Err(bad_argument(
                        ctx,
                        0,
                        "collectgarbage",
                        format_args!("invalid option '{}'", option.unwrap_or_default()),
                    ));
                }
            }
            Ok(CallbackReturn::Return)
        }),
    );
}

/// Parse an integer in `base`, accepting surrounding whitespace and a leading minus sign.
fn parse_integer(s: &[u8], base: u32) -> Option<i64> {
    let s = s.trim_ascii();
    let (negative, digits) = match s.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, s),
    };
    if digits.is_empty() {
        return None;
    }

    let mut n: i64 = 0;
    for &b in digits {
        let d = (b as char).to_digit(base)?;
        n = n.wrapping_mul(base as i64).wrapping_add(d as i64);
    }
    Some(if negative { n.wrapping_neg() } else { n })
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Collect)]
#[collect(require_static)]
enum Finish {
    Print,
    Return,
}

/// Converts values to strings one at a time, calling `__tostring` metamethods as it goes.
#[derive(Collect)]
#[collect(no_drop)]
struct ToStrings<'gc> {
    values: Vec<Value<'gc>>,
    strings: Vec<String<'gc>>,
    waiting: bool,
    finish: Finish,
}

impl<'gc> ToStrings<'gc> {
    fn new(values: Vec<Value<'gc>>, finish: Finish) -> Self {
        Self {
            strings: Vec::with_capacity(values.len()),
            values,
            waiting: false,
            finish,
        }
    }
}

impl<'gc> Sequence<'gc> for ToStrings<'gc> {
    fn poll(
        &mut self,
        ctx: Context<'gc>,
        _exec: Execution<'gc, '_>,
        mut stack: Stack<'gc, '_>,
    ) -> Result<SequencePoll<'gc>, Error<'gc>> {
        if self.waiting {
            self.waiting = false;
            match stack.get(0) {
                Value::String(s) => self.strings.push(s),
                _ => return Err(Error::message(ctx, "'__tostring' must return a string")),
            }
        }
        stack.clear();

        while let Some(&value) = self.values.get(self.strings.len()) {
            match meta_ops::tostring(ctx, value)? {
                MetaResult::Value(Value::String(s)) => self.strings.push(s),
                MetaResult::Value(v) => self.strings.push(ctx.intern(v.display().to_string().as_bytes())),
                MetaResult::Call(call) => {
                    stack.extend(call.args);
                    self.waiting = true;
                    return Ok(SequencePoll::Call {
                        function: call.function,
                        is_tail: false,
                    });
                }
            }
        }

        match self.finish {
            Finish::Print => {
                let mut stdout = io::stdout().lock();
                for (i, s) in self.strings.iter().enumerate() {
                    if i != 0 {
                        stdout.write_all(b"\t")?;
                    }
                    stdout.write_all(s.as_bytes())?;
                }
                stdout.write_all(b"\n")?;
                stdout.flush()?;
            }
            Finish::Return => stack.extend(self.strings.iter().map(|&s| Value::String(s))),
        }
        Ok(SequencePoll::Return)
    }

    fn yieldable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer(b"ff", 16), Some(255));
        assert_eq!(parse_integer(b"  -101 ", 2), Some(-5));
        assert_eq!(parse_integer(b"zz", 36), Some(36 * 36 - 1));
        assert_eq!(parse_integer(b"12", 2), None);
        assert_eq!(parse_integer(b"-", 10), None);
        assert_eq!(parse_integer(b"", 10), None);
    }
}
