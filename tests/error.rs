mod util;

use std::{cell::Cell, rc::Rc};

use sil::{
    types::UpValueDescriptor, BacktraceFrame, Callback, CallbackReturn, Constant, ErrorKind,
    ExternError, Fuel, Limits, LineNumber, Lua,
};

use self::util::*;

/// `function f() error("boom") end`, defined at line 10 so the call sits on line 12.
fn raising() -> Proto {
    Builder::function("f", 10, 0, 2)
        .upvalue("_ENV", UpValueDescriptor::Outer(up(0)))
        .constants([Constant::String("error"), Constant::String("boom")])
        .code([
            get_global(0, 0),
            load(1, 1),
            call(0, fixed(1), fixed(0)),
            ret(0, fixed(0)),
        ])
}

/// `return pcall(f)`
fn pcall_chunk(f: Proto) -> Proto {
    Builder::chunk(2)
        .constants([Constant::String("pcall")])
        .prototype(f)
        .code([
            get_global(0, 0),
            closure(1, 0),
            call(0, fixed(1), fixed(2)),
            ret(0, fixed(2)),
        ])
}

#[test]
fn error_positions() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    let result = run::<(bool, String)>(&mut lua, &pcall_chunk(raising()))?;
    assert_eq!(result, (false, "test:12: boom".to_owned()));

    // Level 2 points at the caller of `f`, the main chunk calling it on line 2.
    let f = Builder::function("f", 10, 0, 3)
        .upvalue("_ENV", UpValueDescriptor::Outer(up(0)))
        .constants([
            Constant::String("error"),
            Constant::String("boom"),
            Constant::Integer(2),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            load(2, 2),
            call(0, fixed(2), fixed(0)),
            ret(0, fixed(0)),
        ]);
    let chunk = Builder::chunk(1)
        .prototype(f)
        .code([closure(0, 0), call(0, fixed(0), fixed(0)), ret(0, fixed(0))]);
    let err = run::<()>(&mut lua, &chunk).unwrap_err();
    assert_eq!(error_message(&err), "test:2: boom");

    // Level 0 adds no position.
    let chunk = Builder::chunk(4)
        .constants([
            Constant::String("pcall"),
            Constant::String("error"),
            Constant::String("plain"),
            Constant::Integer(0),
        ])
        .code([
            get_global(0, 0),
            get_global(1, 1),
            load(2, 2),
            load(3, 3),
            call(0, fixed(3), fixed(2)),
            ret(0, fixed(2)),
        ]);
    assert_eq!(
        run::<(bool, String)>(&mut lua, &chunk)?,
        (false, "plain".to_owned())
    );

    Ok(())
}

#[test]
fn non_string_errors() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    let chunk = Builder::chunk(3)
        .constants([
            Constant::String("pcall"),
            Constant::String("error"),
            Constant::Integer(42),
        ])
        .code([
            get_global(0, 0),
            get_global(1, 1),
            load(2, 2),
            call(0, fixed(2), fixed(2)),
            ret(0, fixed(2)),
        ]);
    assert_eq!(run::<(bool, i64)>(&mut lua, &chunk)?, (false, 42));

    let chunk = Builder::chunk(3)
        .constants([Constant::String("pcall"), Constant::String("assert")])
        .code([
            get_global(0, 0),
            get_global(1, 1),
            OpCode::LoadBool {
                dest: r(2),
                value: false,
                skip_next: false,
            },
            call(0, fixed(2), fixed(2)),
            ret(0, fixed(2)),
        ]);
    assert_eq!(
        run::<(bool, String)>(&mut lua, &chunk)?,
        (false, "assertion failed!".to_owned())
    );

    Ok(())
}

#[test]
fn operator_errors_name_variables() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    let f = Builder::function("f", 10, 0, 2)
        .upvalue("_ENV", UpValueDescriptor::Outer(up(0)))
        .constants([Constant::String("x"), Constant::Integer(1)])
        .code([
            get_global(0, 0),
            OpCode::ArithK {
                op: ArithOp::Add,
                dest: r(1),
                left: r(0),
                right: k(1),
            },
            ret(1, fixed(1)),
        ]);
    assert_eq!(
        run::<(bool, String)>(&mut lua, &pcall_chunk(f))?,
        (
            false,
            "test:11: attempt to perform arithmetic on a nil value (global 'x')".to_owned()
        )
    );

    let f = Builder::function("f", 10, 1, 2)
        .local("t", 0, 0, 2)
        .constants([Constant::String("field")])
        .code([
            OpCode::GetField {
                dest: r(1),
                table: r(0),
                key: k(0),
            },
            ret(1, fixed(1)),
        ]);
    assert_eq!(
        run::<(bool, String)>(&mut lua, &pcall_chunk(f))?,
        (
            false,
            "test:10: attempt to index a nil value (local 't')".to_owned()
        )
    );

    Ok(())
}

#[test]
fn message_handlers() -> Result<(), ExternError> {
    let mut lua = Lua::core();
    lua.try_enter(|ctx| {
        ctx.set_global(
            "handler",
            Callback::from_fn(&ctx, |ctx, _, mut stack| {
                let message: String = stack.from_front(ctx)?;
                stack.replace(ctx, format!("handled: {message}"));
                Ok(CallbackReturn::Return)
            }),
        )?;
        ctx.set_global(
            "bad_handler",
            Callback::from_fn(&ctx, |ctx, _, _| {
                Err(sil::Error::message(ctx, "handler failed"))
            }),
        )?;
        Ok(())
    })?;

    let xpcall_chunk = |handler: &'static str| {
        Builder::chunk(3)
            .constants([Constant::String("xpcall"), Constant::String(handler)])
            .prototype(raising())
            .code([
                get_global(0, 0),
                closure(1, 0),
                get_global(2, 1),
                call(0, fixed(2), fixed(2)),
                ret(0, fixed(2)),
            ])
    };

    assert_eq!(
        run::<(bool, String)>(&mut lua, &xpcall_chunk("handler"))?,
        (false, "handled: test:12: boom".to_owned())
    );
    assert_eq!(
        run::<(bool, String)>(&mut lua, &xpcall_chunk("bad_handler"))?,
        (false, "error in error handling".to_owned())
    );

    Ok(())
}

#[test]
fn traceback_as_handler() -> Result<(), ExternError> {
    let mut lua = Lua::full();

    let chunk = Builder::chunk(3)
        .constants([
            Constant::String("xpcall"),
            Constant::String("debug"),
            Constant::String("traceback"),
        ])
        .prototype(raising())
        .code([
            get_global(0, 0),
            closure(1, 0),
            get_global(2, 1),
            OpCode::GetField {
                dest: r(2),
                table: r(2),
                key: k(2),
            },
            call(0, fixed(2), fixed(2)),
            ret(0, fixed(2)),
        ]);

    let (ok, message) = run::<(bool, String)>(&mut lua, &chunk)?;
    assert!(!ok);
    assert!(message.starts_with("test:12: boom\nstack traceback:\n\t"));
    assert!(message.contains("test:12: in function <test:10>"));

    Ok(())
}

#[test]
fn uncaught_errors_carry_backtraces() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    let chunk = Builder::chunk(1)
        .prototype(raising())
        .code([closure(0, 0), call(0, fixed(0), fixed(0)), ret(0, fixed(0))]);
    let err = run::<()>(&mut lua, &chunk).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(error_message(&err), "test:12: boom");
    let backtrace = err.backtrace().expect("no backtrace captured");
    assert!(matches!(backtrace[0], BacktraceFrame::Native { .. }));
    assert!(backtrace.iter().any(|frame| matches!(
        frame,
        BacktraceFrame::Lua {
            chunk_name,
            line_number: Some(LineNumber(12)),
            ..
        } if chunk_name == "test"
    )));
    assert!(backtrace.iter().any(|frame| matches!(
        frame,
        BacktraceFrame::Lua {
            line_number: Some(LineNumber(2)),
            ..
        }
    )));

    let mut pretty = String::new();
    err.pretty_print(&mut pretty).unwrap();
    assert!(pretty.contains("stack traceback:"));

    Ok(())
}

#[test]
fn errors_are_values() -> Result<(), ExternError> {
    let mut lua = Lua::core();
    lua.try_enter(|ctx| {
        ctx.set_global(
            "fail",
            Callback::from_fn(&ctx, |_, _, _| {
                Err(anyhow::anyhow!("rust failure").into())
            }),
        )?;
        Ok(())
    })?;

    let chunk = Builder::chunk(2)
        .constants([Constant::String("pcall"), Constant::String("fail")])
        .code([
            get_global(0, 0),
            get_global(1, 1),
            call(0, fixed(1), fixed(2)),
            ret(0, fixed(2)),
        ]);
    let executor = start(&mut lua, &chunk);
    lua.enter(|ctx| {
        let executor = ctx.fetch(&executor);
        assert!(executor.step(ctx, &mut Fuel::with(i32::MAX)));
        let (ok, error): (bool, sil::Error) = executor.take_result(ctx).unwrap().unwrap();
        assert!(!ok);
        assert!(matches!(error, sil::Error::Runtime(_)));
        assert_eq!(error.to_string(), "runtime error: rust failure");
    });

    Ok(())
}

/// `return xpcall(f, handler)` for two globals.
fn xpcall_globals(f: &'static str, handler: &'static str) -> Proto {
    Builder::chunk(3)
        .constants([
            Constant::String("xpcall"),
            Constant::String(f),
            Constant::String(handler),
        ])
        .code([
            get_global(0, 0),
            get_global(1, 1),
            get_global(2, 2),
            call(0, fixed(2), fixed(2)),
            ret(0, fixed(2)),
        ])
}

#[test]
fn memory_errors_skip_message_handlers() -> Result<(), ExternError> {
    let mut lua = Lua::core();
    let handled = Rc::new(Cell::new(false));
    let handler_ran = handled.clone();
    lua.try_enter(move |ctx| {
        ctx.set_global(
            "oom",
            Callback::from_fn(&ctx, |ctx, _, _| Err(sil::Error::memory(ctx))),
        )?;
        ctx.set_global(
            "handler",
            Callback::from_fn(&ctx, move |_, _, _| {
                handler_ran.set(true);
                Ok(CallbackReturn::Return)
            }),
        )?;
        Ok(())
    })?;

    assert_eq!(
        run::<(bool, String)>(&mut lua, &xpcall_globals("oom", "handler"))?,
        (false, "not enough memory".to_owned())
    );
    assert!(!handled.get());
    Ok(())
}

fn install_flood(lua: &mut Lua) -> Result<(), ExternError> {
    lua.try_enter(|ctx| {
        ctx.set_global(
            "flood",
            Callback::from_fn(&ctx, |_, _, mut stack| {
                stack.resize(2000);
                Ok(CallbackReturn::Return)
            }),
        )?;
        Ok(())
    })
}

#[test]
fn native_functions_overflow_the_stack() -> Result<(), ExternError> {
    let mut lua = Lua::with_limits(Limits {
        max_stack: 1000,
        ..Limits::default()
    });
    lua.load_core();
    install_flood(&mut lua)?;

    // Twice, the second overflow is not taken as happening during error handling.
    let chunk = Builder::chunk(4)
        .constants([Constant::String("pcall"), Constant::String("flood")])
        .code([
            get_global(0, 0),
            get_global(1, 1),
            call(0, fixed(1), fixed(2)),
            get_global(2, 0),
            get_global(3, 1),
            call(2, fixed(1), fixed(2)),
            ret(0, fixed(4)),
        ]);
    assert_eq!(
        run::<(bool, String, bool, String)>(&mut lua, &chunk)?,
        (
            false,
            "stack overflow".to_owned(),
            false,
            "stack overflow".to_owned()
        )
    );
    Ok(())
}

#[test]
fn overflow_while_handling_overflow() -> Result<(), ExternError> {
    let mut lua = Lua::with_limits(Limits {
        max_stack: 1000,
        ..Limits::default()
    });
    lua.load_core();
    install_flood(&mut lua)?;

    assert_eq!(
        run::<(bool, String)>(&mut lua, &xpcall_globals("flood", "flood"))?,
        (false, "error in error handling".to_owned())
    );
    Ok(())
}
