mod util;

use std::{cell::RefCell, rc::Rc};

use sil::{
    types::UpValueDescriptor, Callback, CallbackReturn, Constant, ExternError, Lua, Table, Value,
};

use self::util::*;

type Log = Rc<RefCell<Vec<String>>>;

/// Installs `closable(name)`, returning a value whose `__close` logs `name:err`, `failing(msg)`,
/// returning a value whose `__close` raises `msg`, and `mark(name)` which logs `name`.
fn install(lua: &mut Lua) -> Log {
    let log = Log::default();

    let closable_log = log.clone();
    let mark_log = log.clone();
    lua.enter(move |ctx| {
        let closable = Callback::from_fn(&ctx, move |ctx, _, mut stack| {
            let name: String = stack.from_front(ctx)?;
            let log = closable_log.clone();
            let mt = Table::new(&ctx);
            mt.set_field(
                ctx,
                "__close",
                Callback::from_fn(&ctx, move |_, _, stack| {
                    let err = match stack.get(1) {
                        Value::Nil => "nil".to_owned(),
                        Value::String(s) => s.display_lossy().to_string(),
                        v => v.type_name().to_owned(),
                    };
                    log.borrow_mut().push(format!("{name}:{err}"));
                    Ok(CallbackReturn::Return)
                }),
            );
            let value = Table::new(&ctx);
            value.set_metatable(&ctx, Some(mt));
            stack.replace(ctx, value);
            Ok(CallbackReturn::Return)
        });
        let mark = Callback::from_fn(&ctx, move |ctx, _, mut stack| {
            let name: String = stack.from_front(ctx)?;
            mark_log.borrow_mut().push(name);
            Ok(CallbackReturn::Return)
        });
        let failing = Callback::from_fn(&ctx, |ctx, _, mut stack| {
            let message: String = stack.from_front(ctx)?;
            let mt = Table::new(&ctx);
            mt.set_field(
                ctx,
                "__close",
                Callback::from_fn(&ctx, move |ctx, _, _| {
                    Err(sil::Error::message(ctx, message.clone()))
                }),
            );
            let value = Table::new(&ctx);
            value.set_metatable(&ctx, Some(mt));
            stack.replace(ctx, value);
            Ok(CallbackReturn::Return)
        });
        ctx.globals().set_field(ctx, "closable", closable);
        ctx.globals().set_field(ctx, "failing", failing);
        ctx.globals().set_field(ctx, "mark", mark);
    });

    log
}

fn tbc(reg: u8) -> OpCode {
    OpCode::ToBeClosed { reg: r(reg) }
}

#[test]
fn closed_in_reverse_order_on_return() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    let log = install(&mut lua);

    let chunk = Builder::chunk(3)
        .constants([
            Constant::String("closable"),
            Constant::String("a"),
            Constant::String("b"),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            call(0, fixed(1), fixed(1)),
            tbc(0),
            get_global(1, 0),
            load(2, 2),
            call(1, fixed(1), fixed(1)),
            tbc(1),
            ret(0, fixed(0)),
        ]);
    run::<()>(&mut lua, &chunk)?;

    assert_eq!(*log.borrow(), ["b:nil", "a:nil"]);
    Ok(())
}

#[test]
fn closed_at_block_exit() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    let log = install(&mut lua);

    let chunk = Builder::chunk(2)
        .constants([
            Constant::String("closable"),
            Constant::String("block"),
            Constant::String("mark"),
            Constant::String("after"),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            call(0, fixed(1), fixed(1)),
            tbc(0),
            OpCode::Close { from: r(0) },
            get_global(0, 2),
            load(1, 3),
            call(0, fixed(1), fixed(0)),
            ret(0, fixed(0)),
        ]);
    run::<()>(&mut lua, &chunk)?;

    assert_eq!(*log.borrow(), ["block:nil", "after"]);
    Ok(())
}

#[test]
fn closed_with_error() -> Result<(), ExternError> {
    let mut lua = Lua::core();
    let log = install(&mut lua);

    // function f() local x <close> = closable("x"); error("oops") end
    let f = Builder::function("f", 10, 0, 3)
        .upvalue("_ENV", UpValueDescriptor::Outer(up(0)))
        .constants([
            Constant::String("closable"),
            Constant::String("x"),
            Constant::String("error"),
            Constant::String("oops"),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            call(0, fixed(1), fixed(1)),
            tbc(0),
            get_global(1, 2),
            load(2, 3),
            call(1, fixed(1), fixed(0)),
            ret(0, fixed(0)),
        ]);
    let chunk = Builder::chunk(2)
        .constants([Constant::String("pcall")])
        .prototype(f)
        .code([
            get_global(0, 0),
            closure(1, 0),
            call(0, fixed(1), fixed(2)),
            ret(0, fixed(2)),
        ]);

    assert_eq!(
        run::<(bool, String)>(&mut lua, &chunk)?,
        (false, "test:16: oops".to_owned())
    );
    assert_eq!(*log.borrow(), ["x:test:16: oops"]);
    Ok(())
}

#[test]
fn close_error_replaces_return_values() -> Result<(), ExternError> {
    let mut lua = Lua::core();
    let log = install(&mut lua);

    // function f()
    //     local a <close> = closable("a")
    //     local x <close> = failing("close failed")
    //     return 1
    // end
    let f = Builder::function("f", 10, 0, 4)
        .upvalue("_ENV", UpValueDescriptor::Outer(up(0)))
        .constants([
            Constant::String("closable"),
            Constant::String("a"),
            Constant::String("failing"),
            Constant::String("close failed"),
            Constant::Integer(1),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            call(0, fixed(1), fixed(1)),
            tbc(0),
            get_global(1, 2),
            load(2, 3),
            call(1, fixed(1), fixed(1)),
            tbc(1),
            load(2, 4),
            ret(2, fixed(1)),
        ]);
    let chunk = Builder::chunk(2)
        .constants([Constant::String("pcall")])
        .prototype(f)
        .code([
            get_global(0, 0),
            closure(1, 0),
            call(0, fixed(1), var()),
            ret(0, var()),
        ]);

    assert_eq!(
        run::<(bool, String)>(&mut lua, &chunk)?,
        (false, "close failed".to_owned())
    );
    assert_eq!(*log.borrow(), ["a:close failed"]);
    Ok(())
}

#[test]
fn non_closable_values() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    let chunk = Builder::chunk(1)
        .constants([Constant::Integer(5)])
        .local("v", 0, 1, 3)
        .code([load(0, 0), tbc(0), ret(0, fixed(0))]);
    let err = run::<()>(&mut lua, &chunk).unwrap_err();
    assert_eq!(
        error_message(&err),
        "test:2: variable 'v' got a non-closable value"
    );

    // `nil` and `false` are ignored.
    let chunk = Builder::chunk(2)
        .code([
            OpCode::LoadNil {
                dest: r(0),
                count: 1,
            },
            tbc(0),
            OpCode::LoadBool {
                dest: r(1),
                value: false,
                skip_next: false,
            },
            tbc(1),
            ret(0, fixed(0)),
        ]);
    run::<()>(&mut lua, &chunk)?;

    Ok(())
}

#[test]
fn no_tail_call_with_pending_close() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    let log = install(&mut lua);

    let chunk = Builder::chunk(3)
        .constants([
            Constant::String("closable"),
            Constant::String("a"),
            Constant::String("mark"),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            call(0, fixed(1), fixed(1)),
            tbc(0),
            get_global(1, 2),
            load(2, 1),
            OpCode::TailCall {
                func: r(1),
                args: fixed(1),
            },
            ret(0, var()),
        ]);
    let err = run::<()>(&mut lua, &chunk).unwrap_err();
    let message = "test:7: cannot tail call out of a function with pending to-be-closed variables";
    assert_eq!(error_message(&err), message);
    assert_eq!(*log.borrow(), [format!("a:{message}")]);

    Ok(())
}

#[test]
fn closing_a_coroutine_closes_its_variables() -> Result<(), ExternError> {
    let mut lua = Lua::full();
    let log = install(&mut lua);

    // function() local x <close> = closable("co"); coroutine.yield() end
    let body = Builder::function("body", 10, 0, 3)
        .upvalue("_ENV", UpValueDescriptor::Outer(up(0)))
        .constants([
            Constant::String("closable"),
            Constant::String("co"),
            Constant::String("coroutine"),
            Constant::String("yield"),
        ])
        .code([
            get_global(0, 0),
            load(1, 1),
            call(0, fixed(1), fixed(1)),
            tbc(0),
            get_global(1, 2),
            OpCode::GetField {
                dest: r(1),
                table: r(1),
                key: k(3),
            },
            call(1, fixed(0), fixed(0)),
            ret(0, fixed(0)),
        ]);

    // local co = coroutine.create(body); coroutine.resume(co); return coroutine.close(co)
    let field = |dest: u8, key: u8| OpCode::GetField {
        dest: r(dest),
        table: r(0),
        key: k(key),
    };
    let chunk = Builder::chunk(4)
        .constants([
            Constant::String("coroutine"),
            Constant::String("create"),
            Constant::String("resume"),
            Constant::String("close"),
        ])
        .prototype(body)
        .code([
            get_global(0, 0),
            field(1, 1),
            closure(2, 0),
            call(1, fixed(1), fixed(1)),
            field(2, 2),
            OpCode::Move {
                dest: r(3),
                source: r(1),
            },
            call(2, fixed(1), fixed(0)),
            field(2, 3),
            OpCode::Move {
                dest: r(3),
                source: r(1),
            },
            call(2, fixed(1), fixed(1)),
            ret(2, fixed(1)),
        ]);

    assert!(log.borrow().is_empty());
    assert!(run::<bool>(&mut lua, &chunk)?);
    assert_eq!(*log.borrow(), ["co:nil"]);

    Ok(())
}
