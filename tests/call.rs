mod util;

use sil::{Callback, CallbackReturn, Constant, ExternError, Lua, Table, Value, Variadic};

use self::util::*;

#[test]
fn callback_receives_arguments() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    lua.try_enter(|ctx| {
        let callback = Callback::from_fn(&ctx, |_, _, mut stack| {
            stack.push_back(Value::Integer(42));
            Ok(CallbackReturn::Return)
        });
        ctx.set_global("callback", callback)?;
        Ok(())
    })?;

    let proto = Builder::chunk(3)
        .constants([
            Constant::String("callback"),
            Constant::Integer(1),
            Constant::Integer(2),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            load(2, 2),
            call(0, fixed(2), var()),
            ret(0, var()),
        ]);

    assert_eq!(run::<(i64, i64, i64)>(&mut lua, &proto)?, (1, 2, 42));
    Ok(())
}

#[test]
fn call_closure() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    let add = Builder::function("add", 10, 2, 3).code([
        OpCode::Arith {
            op: ArithOp::Add,
            dest: r(2),
            left: r(0),
            right: r(1),
        },
        ret(2, fixed(1)),
    ]);
    let proto = Builder::chunk(3)
        .constants([Constant::Integer(3), Constant::Integer(4)])
        .prototype(add)
        .code([
            closure(0, 0),
            load(1, 0),
            load(2, 1),
            call(0, fixed(2), fixed(1)),
            ret(0, fixed(1)),
        ]);

    assert_eq!(run::<i64>(&mut lua, &proto)?, 7);
    Ok(())
}

#[test]
fn varargs_count_nils() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    let count = Builder::function("count", 1, 0, 3)
        .varargs()
        .upvalue("_ENV", sil::types::UpValueDescriptor::Outer(up(0)))
        .constants([Constant::String("select"), Constant::String("#")])
        .code([
            get_global(0, 0),
            load(1, 1),
            OpCode::VarArgs {
                dest: r(2),
                count: var(),
            },
            call(0, var(), fixed(1)),
            ret(0, fixed(1)),
        ]);
    let proto = Builder::chunk(4)
        .constants([Constant::Integer(1)])
        .prototype(count)
        .code([
            closure(0, 0),
            load(1, 0),
            OpCode::LoadNil {
                dest: r(2),
                count: 2,
            },
            call(0, fixed(3), fixed(1)),
            ret(0, fixed(1)),
        ]);

    assert_eq!(run::<i64>(&mut lua, &proto)?, 3);
    Ok(())
}

#[test]
fn return_counts_are_adjusted() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    let three = Builder::function("three", 1, 0, 3)
        .constants([
            Constant::Integer(1),
            Constant::Integer(2),
            Constant::Integer(3),
        ])
        .code([load(0, 0), load(1, 1), load(2, 2), ret(0, fixed(3))]);

    let all = Builder::chunk(1)
        .prototype(three.clone())
        .code([closure(0, 0), call(0, fixed(0), var()), ret(0, var())]);
    let values = run::<Variadic<i64>>(&mut lua, &all)?;
    assert_eq!(&values[..], &[1, 2, 3]);

    let padded = Builder::chunk(5)
        .prototype(three.clone())
        .code([closure(0, 0), call(0, fixed(0), fixed(5)), ret(0, fixed(5))]);
    assert_eq!(
        run::<(i64, i64, i64, Option<i64>, Option<i64>)>(&mut lua, &padded)?,
        (1, 2, 3, None, None)
    );

    let truncated = Builder::chunk(1)
        .prototype(three)
        .code([closure(0, 0), call(0, fixed(0), fixed(1)), ret(0, var())]);
    let values = run::<Variadic<i64>>(&mut lua, &truncated)?;
    assert_eq!(&values[..], &[1]);

    Ok(())
}

#[test]
fn call_nil_global() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    let proto = Builder::chunk(1)
        .constants([Constant::String("nope")])
        .code([get_global(0, 0), call(0, fixed(0), fixed(0)), ret(0, fixed(0))]);

    let err = run::<()>(&mut lua, &proto).unwrap_err();
    assert_eq!(
        error_message(&err),
        "test:2: attempt to call a nil value (global 'nope')"
    );
    Ok(())
}

#[test]
fn call_metamethod() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    lua.try_enter(|ctx| {
        let callable = Table::new(&ctx);
        let mt = Table::new(&ctx);
        mt.set(
            ctx,
            "__call",
            Callback::from_fn(&ctx, |ctx, _, mut stack| {
                let count = stack.len() as i64;
                let first_is_self = matches!(stack.get(0), Value::Table(_));
                stack.replace(ctx, (count, first_is_self));
                Ok(CallbackReturn::Return)
            }),
        )?;
        callable.set_metatable(&ctx, Some(mt));
        ctx.set_global("callable", callable)?;
        Ok(())
    })?;

    let proto = Builder::chunk(3)
        .constants([
            Constant::String("callable"),
            Constant::Integer(1),
            Constant::Integer(2),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            load(2, 2),
            call(0, fixed(2), fixed(2)),
            ret(0, fixed(2)),
        ]);

    assert_eq!(run::<(i64, bool)>(&mut lua, &proto)?, (3, true));
    Ok(())
}

#[test]
fn callback_calls_back_into_script() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    lua.try_enter(|ctx| {
        // Calls its first argument with the rest of the arguments.
        let apply = Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let function = stack.from_front(ctx)?;
            Ok(CallbackReturn::Call {
                function,
                then: None,
            })
        });
        ctx.set_global("apply", apply)?;
        Ok(())
    })?;

    let double = Builder::function("double", 1, 1, 2).code([
        OpCode::Arith {
            op: ArithOp::Add,
            dest: r(1),
            left: r(0),
            right: r(0),
        },
        ret(1, fixed(1)),
    ]);
    let proto = Builder::chunk(3)
        .constants([Constant::String("apply"), Constant::Integer(21)])
        .prototype(double)
        .code([
            get_global(0, 0),
            closure(1, 0),
            load(2, 1),
            call(0, fixed(2), fixed(1)),
            ret(0, fixed(1)),
        ]);

    assert_eq!(run::<i64>(&mut lua, &proto)?, 42);
    Ok(())
}

#[test]
fn select_negative_indices() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    let select = |index: i64| {
        Builder::chunk(4)
            .constants([
                Constant::String("select"),
                Constant::Integer(index),
                Constant::String("a"),
                Constant::String("b"),
            ])
            .code([
                get_global(0, 0),
                load(1, 1),
                load(2, 2),
                load(3, 3),
                call(0, fixed(3), var()),
                ret(0, var()),
            ])
    };

    assert_eq!(run::<String>(&mut lua, &select(-1))?, "b");
    assert_eq!(
        run::<(String, String)>(&mut lua, &select(-2))?,
        ("a".to_owned(), "b".to_owned())
    );
    for index in [-3, i64::MIN] {
        let err = run::<()>(&mut lua, &select(index)).unwrap_err();
        assert_eq!(
            error_message(&err),
            "bad argument #1 to 'select' (index out of range)"
        );
    }
    Ok(())
}
