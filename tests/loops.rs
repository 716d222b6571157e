mod util;

use sil::{Constant, ExternError, Lua, Table};

use self::util::*;

/// `local sum = 0; for i = init, limit, step do sum = sum + i end; return sum`
fn numeric_sum(
    init: Constant<&'static str>,
    limit: Constant<&'static str>,
    step: Constant<&'static str>,
) -> Proto {
    Builder::chunk(5)
        .constants([Constant::Integer(0), init, limit, step])
        .local("sum", 0, 1, 8)
        .local("i", 4, 5, 7)
        .code([
            load(0, 0),
            load(1, 1),
            load(2, 2),
            load(3, 3),
            OpCode::NumericForPrep {
                base: r(1),
                skip: 2,
            },
            OpCode::Arith {
                op: ArithOp::Add,
                dest: r(0),
                left: r(0),
                right: r(4),
            },
            OpCode::NumericForLoop {
                base: r(1),
                skip: -2,
            },
            ret(0, fixed(1)),
        ])
}

#[test]
fn integer_loops() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    let ascending = numeric_sum(
        Constant::Integer(1),
        Constant::Integer(10),
        Constant::Integer(1),
    );
    assert_eq!(run::<i64>(&mut lua, &ascending)?, 55);

    let down = numeric_sum(
        Constant::Integer(10),
        Constant::Integer(1),
        Constant::Integer(-3),
    );
    assert_eq!(run::<i64>(&mut lua, &down)?, 10 + 7 + 4 + 1);

    let empty = numeric_sum(
        Constant::Integer(5),
        Constant::Integer(1),
        Constant::Integer(1),
    );
    assert_eq!(run::<i64>(&mut lua, &empty)?, 0);

    // A float limit is clipped to the integers the loop can reach.
    let clipped = numeric_sum(
        Constant::Integer(1),
        Constant::Number(3.5),
        Constant::Integer(1),
    );
    assert_eq!(run::<i64>(&mut lua, &clipped)?, 6);

    // Stops at the end of the integer range instead of wrapping around.
    let edge = Builder::chunk(5)
        .constants([
            Constant::Integer(0),
            Constant::Integer(i64::MAX - 2),
            Constant::Integer(i64::MAX),
            Constant::Integer(1),
        ])
        .code([
            load(0, 0),
            load(1, 1),
            load(2, 2),
            load(3, 3),
            OpCode::NumericForPrep {
                base: r(1),
                skip: 2,
            },
            OpCode::ArithK {
                op: ArithOp::Add,
                dest: r(0),
                left: r(0),
                right: k(3),
            },
            OpCode::NumericForLoop {
                base: r(1),
                skip: -2,
            },
            ret(0, fixed(1)),
        ]);
    assert_eq!(run::<i64>(&mut lua, &edge)?, 3);

    Ok(())
}

#[test]
fn float_loops() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    let halves = numeric_sum(
        Constant::Number(1.0),
        Constant::Number(2.0),
        Constant::Number(0.5),
    );
    assert_eq!(run::<f64>(&mut lua, &halves)?, 4.5);

    let mixed = numeric_sum(
        Constant::Integer(1),
        Constant::Integer(2),
        Constant::Number(0.25),
    );
    assert_eq!(run::<f64>(&mut lua, &mixed)?, 1.0 + 1.25 + 1.5 + 1.75 + 2.0);

    Ok(())
}

#[test]
fn loop_errors() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    let zero = numeric_sum(
        Constant::Integer(1),
        Constant::Integer(10),
        Constant::Integer(0),
    );
    let err = run::<i64>(&mut lua, &zero).unwrap_err();
    assert_eq!(error_message(&err), "test:5: 'for' step is zero");

    let string_limit = numeric_sum(
        Constant::Integer(1),
        Constant::String("10"),
        Constant::Integer(1),
    );
    let err = run::<i64>(&mut lua, &string_limit).unwrap_err();
    assert_eq!(error_message(&err), "test:5: 'for' limit must be a number");

    let no_iterator = Builder::chunk(7).code([
        OpCode::LoadNil {
            dest: r(0),
            count: 4,
        },
        OpCode::GenericForCall {
            base: r(0),
            var_count: 1,
        },
        OpCode::GenericForLoop {
            base: r(0),
            skip: -2,
        },
        ret(0, fixed(0)),
    ]);
    let err = run::<()>(&mut lua, &no_iterator).unwrap_err();
    assert_eq!(
        error_message(&err),
        "test:2: attempt to call a nil value (for iterator 'for iterator')"
    );

    Ok(())
}

/// `local sum = 0; for _, v in iter(t) do sum = sum + v end; return sum`
fn generic_sum(iter: &'static str) -> Proto {
    Builder::chunk(8)
        .constants([
            Constant::String(iter),
            Constant::String("t"),
            Constant::Integer(0),
        ])
        .code([
            load(0, 2),
            get_global(1, 0),
            get_global(2, 1),
            call(1, fixed(1), fixed(3)),
            OpCode::LoadNil {
                dest: r(4),
                count: 1,
            },
            jump(1),
            OpCode::Arith {
                op: ArithOp::Add,
                dest: r(0),
                left: r(0),
                right: r(6),
            },
            OpCode::GenericForCall {
                base: r(1),
                var_count: 2,
            },
            OpCode::GenericForLoop {
                base: r(1),
                skip: -3,
            },
            ret(0, fixed(1)),
        ])
}

#[test]
fn generic_loops() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    lua.try_enter(|ctx| {
        let t = Table::new(&ctx);
        t.set(ctx, 1, 10)?;
        t.set(ctx, 2, 20)?;
        t.set(ctx, 3, 30)?;
        // Not visited by `ipairs`.
        t.set(ctx, 5, 1000)?;
        ctx.set_global("t", t)?;
        Ok(())
    })?;
    assert_eq!(run::<i64>(&mut lua, &generic_sum("ipairs"))?, 60);
    assert_eq!(run::<i64>(&mut lua, &generic_sum("pairs"))?, 1060);

    lua.try_enter(|ctx| {
        let t = Table::new(&ctx);
        t.set(ctx, "a", 1)?;
        t.set(ctx, "b", 2)?;
        t.set(ctx, "c", 3)?;
        ctx.set_global("t", t)?;
        Ok(())
    })?;
    assert_eq!(run::<i64>(&mut lua, &generic_sum("pairs"))?, 6);

    Ok(())
}
