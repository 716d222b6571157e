mod util;

use sil::{
    types::UpValueDescriptor, Callback, CallbackReturn, Constant, Context, ExternError, Lua,
    MetaMethod, Table, Value,
};

use self::util::*;

/// Sets global `name` to an empty table with the given metatable.
fn global_with_metatable<'gc>(ctx: Context<'gc>, name: &'static str, mt: Table<'gc>) {
    let t = Table::new(&ctx);
    t.set_metatable(&ctx, Some(mt));
    ctx.globals().set_field(ctx, name, t);
}

/// A callback returning the type names of its first two arguments, joined by a space.
fn argument_types<'gc>(ctx: Context<'gc>) -> Callback<'gc> {
    Callback::from_fn(&ctx, |ctx, _, mut stack| {
        let types = format!(
            "{} {}",
            stack.get(0).type_name(),
            stack.get(1).type_name()
        );
        stack.replace(ctx, types);
        Ok(CallbackReturn::Return)
    })
}

fn returning<'gc>(
    ctx: Context<'gc>,
    value: impl Fn(Context<'gc>) -> Value<'gc> + 'static,
) -> Callback<'gc> {
    Callback::from_fn(&ctx, move |ctx, _, mut stack| {
        stack.replace(ctx, value(ctx));
        Ok(CallbackReturn::Return)
    })
}

/// `dest = (left == right)`
fn equals(dest: u8, left: u8, right: u8) -> [OpCode; 3] {
    [
        OpCode::Eq {
            skip_if: false,
            left: r(left),
            right: r(right),
        },
        OpCode::LoadBool {
            dest: r(dest),
            value: true,
            skip_next: true,
        },
        OpCode::LoadBool {
            dest: r(dest),
            value: false,
            skip_next: false,
        },
    ]
}

/// `dest = (left < right)`
fn less(dest: u8, left: u8, right: u8) -> [OpCode; 3] {
    [
        OpCode::Less {
            skip_if: false,
            left: r(left),
            right: r(right),
        },
        OpCode::LoadBool {
            dest: r(dest),
            value: true,
            skip_next: true,
        },
        OpCode::LoadBool {
            dest: r(dest),
            value: false,
            skip_next: false,
        },
    ]
}

#[test]
fn index_with_function_and_table() -> Result<(), ExternError> {
    let mut lua = Lua::new();

    // function(t, k) return k .. "!" end
    let index = Builder::function("index", 20, 2, 3)
        .constants([Constant::String("!")])
        .code([
            load(2, 0),
            OpCode::Concat {
                dest: r(0),
                source: r(1),
                count: 2,
            },
            ret(0, fixed(1)),
        ]);
    lua.enter(|ctx| {
        let mt = Table::new(&ctx);
        mt.set_field(ctx, "__index", closure_for(ctx, &index));
        global_with_metatable(ctx, "obj", mt);

        let defaults = Table::new(&ctx);
        defaults.set_field(ctx, "x", 1);
        let mt = Table::new(&ctx);
        mt.set_field(ctx, "__index", defaults);
        global_with_metatable(ctx, "inherits", mt);
    });

    let chunk = Builder::chunk(3)
        .constants([
            Constant::String("obj"),
            Constant::String("hello"),
            Constant::String("inherits"),
            Constant::String("x"),
            Constant::String("y"),
        ])
        .code([
            get_global(0, 0),
            OpCode::GetField {
                dest: r(0),
                table: r(0),
                key: k(1),
            },
            get_global(1, 2),
            OpCode::GetField {
                dest: r(2),
                table: r(1),
                key: k(4),
            },
            OpCode::GetField {
                dest: r(1),
                table: r(1),
                key: k(3),
            },
            ret(0, fixed(3)),
        ]);

    assert_eq!(
        run::<(String, i64, Option<i64>)>(&mut lua, &chunk)?,
        ("hello!".to_owned(), 1, None)
    );
    Ok(())
}

#[test]
fn new_index_function() -> Result<(), ExternError> {
    let mut lua = Lua::core();

    // function(t, k, v) store[k] = v end
    let new_index = Builder::function("new_index", 20, 3, 4)
        .upvalue("_ENV", UpValueDescriptor::Outer(up(0)))
        .constants([Constant::String("store")])
        .code([
            get_global(3, 0),
            OpCode::SetTable {
                table: r(3),
                key: r(1),
                value: r(2),
            },
            ret(0, fixed(0)),
        ]);
    lua.enter(|ctx| {
        ctx.globals().set_field(ctx, "store", Table::new(&ctx));
        let mt = Table::new(&ctx);
        mt.set_field(ctx, "__newindex", closure_for(ctx, &new_index));
        global_with_metatable(ctx, "obj", mt);
    });

    // obj.a = 5 return store.a, rawget(obj, "a")
    let chunk = Builder::chunk(5)
        .constants([
            Constant::String("obj"),
            Constant::String("a"),
            Constant::Integer(5),
            Constant::String("store"),
            Constant::String("rawget"),
        ])
        .code([
            get_global(0, 0),
            load(1, 2),
            OpCode::SetField {
                table: r(0),
                key: k(1),
                value: r(1),
            },
            get_global(1, 3),
            OpCode::GetField {
                dest: r(1),
                table: r(1),
                key: k(1),
            },
            get_global(2, 4),
            OpCode::Move {
                dest: r(3),
                source: r(0),
            },
            load(4, 1),
            call(2, fixed(2), fixed(1)),
            ret(1, fixed(2)),
        ]);

    assert_eq!(
        run::<(i64, Option<i64>)>(&mut lua, &chunk)?,
        (5, None)
    );
    Ok(())
}

#[test]
fn arithmetic_and_concat() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    lua.enter(|ctx| {
        let mt = Table::new(&ctx);
        mt.set(ctx, MetaMethod::Add, argument_types(ctx)).unwrap();
        mt.set(ctx, MetaMethod::Concat, argument_types(ctx)).unwrap();
        mt.set(ctx, MetaMethod::Unm, argument_types(ctx)).unwrap();
        global_with_metatable(ctx, "obj", mt);
    });

    // return obj + 1, 1 + obj, "s" .. obj, -obj
    let chunk = Builder::chunk(6)
        .constants([
            Constant::String("obj"),
            Constant::Integer(1),
            Constant::String("s"),
        ])
        .code([
            get_global(0, 0),
            OpCode::ArithK {
                op: ArithOp::Add,
                dest: r(1),
                left: r(0),
                right: k(1),
            },
            load(5, 1),
            OpCode::Arith {
                op: ArithOp::Add,
                dest: r(2),
                left: r(5),
                right: r(0),
            },
            load(4, 2),
            OpCode::Move {
                dest: r(5),
                source: r(0),
            },
            OpCode::Concat {
                dest: r(3),
                source: r(4),
                count: 2,
            },
            OpCode::Minus {
                dest: r(4),
                source: r(0),
            },
            ret(1, fixed(4)),
        ]);

    assert_eq!(
        run::<(String, String, String, String)>(&mut lua, &chunk)?,
        (
            "table number".to_owned(),
            "number table".to_owned(),
            "string table".to_owned(),
            "table table".to_owned()
        )
    );
    Ok(())
}

#[test]
fn comparisons() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    lua.enter(|ctx| {
        let mt = Table::new(&ctx);
        mt.set(ctx, MetaMethod::Eq, returning(ctx, |_| Value::Boolean(true)))
            .unwrap();
        mt.set(ctx, MetaMethod::Lt, returning(ctx, |_| Value::Integer(1)))
            .unwrap();
        global_with_metatable(ctx, "a", mt);
        global_with_metatable(ctx, "b", mt);
        ctx.globals().set_field(ctx, "plain", Table::new(&ctx));
    });

    // return a == b, a == plain, a < b
    let mut code = vec![get_global(0, 0), get_global(1, 1), get_global(2, 2)];
    code.extend(equals(3, 0, 1));
    code.extend(equals(4, 0, 2));
    code.extend(less(5, 0, 1));
    code.push(ret(3, fixed(3)));
    let chunk = Builder::chunk(6)
        .constants([
            Constant::String("a"),
            Constant::String("b"),
            Constant::String("plain"),
        ])
        .code(code);

    assert_eq!(
        run::<(bool, bool, bool)>(&mut lua, &chunk)?,
        (true, true, true)
    );

    // There is no `__le`, and it is not derived from `__lt`.
    let chunk = Builder::chunk(3)
        .constants([Constant::String("a"), Constant::String("b")])
        .code([
            get_global(0, 0),
            get_global(1, 1),
            OpCode::LessEq {
                skip_if: false,
                left: r(0),
                right: r(1),
            },
            OpCode::LoadBool {
                dest: r(2),
                value: true,
                skip_next: false,
            },
            ret(2, fixed(1)),
        ]);
    let err = run::<bool>(&mut lua, &chunk).unwrap_err();
    assert_eq!(
        error_message(&err),
        "test:3: attempt to compare two table values"
    );

    Ok(())
}

#[test]
fn length() -> Result<(), ExternError> {
    let mut lua = Lua::new();
    lua.enter(|ctx| {
        let mt = Table::new(&ctx);
        mt.set(ctx, MetaMethod::Len, returning(ctx, |_| Value::Integer(42)))
            .unwrap();
        global_with_metatable(ctx, "obj", mt);
    });

    let chunk = Builder::chunk(2)
        .constants([Constant::String("obj"), Constant::String("four")])
        .code([
            get_global(0, 0),
            OpCode::Length {
                dest: r(0),
                source: r(0),
            },
            load(1, 1),
            OpCode::Length {
                dest: r(1),
                source: r(1),
            },
            ret(0, fixed(2)),
        ]);

    assert_eq!(run::<(i64, i64)>(&mut lua, &chunk)?, (42, 4));
    Ok(())
}
