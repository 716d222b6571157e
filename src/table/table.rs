use std::{
    hash::{Hash, Hasher},
    mem,
};

use gc_arena::{lock::RefLock, Collect, Gc, Mutation};

use crate::{Context, IntoValue, Value};

use super::raw::{InvalidTableKey, NextValue, RawTable};

/// The associative array at the heart of the language.
///
/// A `Table` maps non-nil, non-NaN [`Value`]s to values. Integer keys counting up from 1 live in
/// an internal array part. Assigning nil removes an entry.
///
/// Every method on `Table` is "raw": none of them ever consult the metatable. Metamethod aware
/// indexing lives in [`meta_ops`](crate::meta_ops) and is driven by an
/// [`Executor`](crate::Executor).
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Table<'gc>(Gc<'gc, TableInner<'gc>>);

pub type TableInner<'gc> = RefLock<TableState<'gc>>;

#[derive(Debug, Collect)]
#[collect(no_drop)]
pub struct TableState<'gc> {
    pub entries: RawTable<'gc>,
    pub metatable: Option<Table<'gc>>,
}

impl<'gc> PartialEq for Table<'gc> {
    fn eq(&self, other: &Table<'gc>) -> bool {
        Gc::ptr_eq(self.0, other.0)
    }
}

impl<'gc> Eq for Table<'gc> {}

impl<'gc> Hash for Table<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_ptr().hash(state)
    }
}

impl<'gc> Table<'gc> {
    pub fn new(mc: &Mutation<'gc>) -> Table<'gc> {
        Table(Gc::new(
            mc,
            RefLock::new(TableState {
                entries: RawTable::new(mc),
                metatable: None,
            }),
        ))
    }

    pub fn from_inner(inner: Gc<'gc, TableInner<'gc>>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, TableInner<'gc>> {
        self.0
    }

    /// The identity of this table, as printed by `tostring`.
    pub fn as_ptr(self) -> *const () {
        Gc::as_ptr(self.0) as *const ()
    }

    pub fn get<K: IntoValue<'gc>>(self, ctx: Context<'gc>, key: K) -> Value<'gc> {
        self.get_value(key.into_value(ctx))
    }

    pub fn set<K: IntoValue<'gc>, V: IntoValue<'gc>>(
        self,
        ctx: Context<'gc>,
        key: K,
        value: V,
    ) -> Result<Value<'gc>, InvalidTableKey> {
        self.set_value(&ctx, key.into_value(ctx), value.into_value(ctx))
    }

    /// Sets a string field, which can never be an invalid key.
    pub fn set_field<V: IntoValue<'gc>>(
        self,
        ctx: Context<'gc>,
        key: &'static str,
        value: V,
    ) -> Value<'gc> {
        let key = Value::String(ctx.intern_static(key.as_bytes()));
        self.0
            .borrow_mut(&ctx)
            .entries
            .set(key, value.into_value(ctx))
            .unwrap_or_default()
    }

    pub fn get_value(self, key: Value<'gc>) -> Value<'gc> {
        self.0.borrow().entries.get(key)
    }

    pub fn set_value(
        self,
        mc: &Mutation<'gc>,
        key: Value<'gc>,
        value: Value<'gc>,
    ) -> Result<Value<'gc>, InvalidTableKey> {
        self.0.borrow_mut(mc).entries.set(key, value)
    }

    /// Returns a border of the table: an `n >= 0` where `t[n]` is non-nil (or `n` is 0) and
    /// `t[n + 1]` is nil. For a sequence this is its length.
    pub fn length(self) -> i64 {
        self.0.borrow().entries.length()
    }

    /// Returns the next pair after this key in traversal order, `Nil` starts a traversal.
    ///
    /// Existing fields may be cleared during a traversal. Adding new keys during a traversal
    /// leaves the order unspecified.
    pub fn next(self, key: Value<'gc>) -> NextValue<'gc> {
        self.0.borrow().entries.next(key)
    }

    pub fn iter(self) -> Iter<'gc> {
        Iter {
            table: self,
            prev: Some(Value::Nil),
        }
    }

    pub fn metatable(self) -> Option<Table<'gc>> {
        self.0.borrow().metatable
    }

    /// Replaces the metatable, returning the previous one.
    pub fn set_metatable(
        self,
        mc: &Mutation<'gc>,
        metatable: Option<Table<'gc>>,
    ) -> Option<Table<'gc>> {
        mem::replace(&mut self.0.borrow_mut(mc).metatable, metatable)
    }
}

/// Iterates over the pairs of a table with [`Table::next`].
#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Iter<'gc> {
    table: Table<'gc>,
    prev: Option<Value<'gc>>,
}

impl<'gc> Iterator for Iter<'gc> {
    type Item = (Value<'gc>, Value<'gc>);

    fn next(&mut self) -> Option<Self::Item> {
        match self.table.next(self.prev.take()?) {
            NextValue::Found { key, value } => {
                self.prev = Some(key);
                Some((key, value))
            }
            NextValue::Last | NextValue::NotFound => None,
        }
    }
}

impl<'gc> IntoIterator for Table<'gc> {
    type Item = (Value<'gc>, Value<'gc>);
    type IntoIter = Iter<'gc>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
