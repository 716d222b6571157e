use std::{
    fmt,
    hash::{BuildHasherDefault, Hash, Hasher},
    mem,
};

use ahash::AHasher;
use allocator_api2::vec;
use gc_arena::{allocator_api::MetricsAlloc, Collect, Gc, Mutation};
use hashbrown::HashMap;
use thiserror::Error;

use crate::{
    number, Callback, Closure, Function, LightUserData, String, Table, Thread, UserData, Value,
};

#[derive(Debug, Copy, Clone, Error)]
pub enum InvalidTableKey {
    #[error("index is NaN")]
    IsNaN,
    #[error("index is nil")]
    IsNil,
}

#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
pub enum NextValue<'gc> {
    Found { key: Value<'gc>, value: Value<'gc> },
    Last,
    NotFound,
}

/// The storage behind a [`Table`]: an array part for the keys `1..=n` and an insertion ordered
/// map part for everything else.
///
/// Removing a key from the map part leaves a nil entry behind so that a traversal with `next`
/// may clear fields as it goes. Dead entries are compacted away when new keys are inserted.
#[derive(Collect)]
#[collect(no_drop)]
pub struct RawTable<'gc> {
    array: vec::Vec<Value<'gc>, MetricsAlloc<'gc>>,
    entries: vec::Vec<(Value<'gc>, Value<'gc>), MetricsAlloc<'gc>>,
    index: HashMap<CanonicalKey<'gc>, usize, BuildHasherDefault<AHasher>, MetricsAlloc<'gc>>,
    dead: usize,
}

impl<'gc> fmt::Debug for RawTable<'gc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.array
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| !v.is_nil())
                    .map(|(i, v)| (Value::Integer(i as i64 + 1), *v))
                    .chain(self.entries.iter().filter(|(_, v)| !v.is_nil()).copied()),
            )
            .finish()
    }
}

impl<'gc> RawTable<'gc> {
    pub fn new(mc: &Mutation<'gc>) -> Self {
        Self {
            array: vec::Vec::new_in(MetricsAlloc::new(mc)),
            entries: vec::Vec::new_in(MetricsAlloc::new(mc)),
            index: HashMap::with_hasher_in(BuildHasherDefault::default(), MetricsAlloc::new(mc)),
            dead: 0,
        }
    }

    pub fn get(&self, key: Value<'gc>) -> Value<'gc> {
        if let Some(index) = to_array_index(key) {
            if index < self.array.len() {
                return self.array[index];
            }
        }

        match CanonicalKey::new(key) {
            Ok(key) => match self.index.get(&key) {
                Some(&i) => self.entries[i].1,
                None => Value::Nil,
            },
            Err(_) => Value::Nil,
        }
    }

    /// Sets the value for a key, returning the previous value.
    pub fn set(
        &mut self,
        key: Value<'gc>,
        value: Value<'gc>,
    ) -> Result<Value<'gc>, InvalidTableKey> {
        let canonical = CanonicalKey::new(key)?;

        if let Some(index) = to_array_index(key) {
            if index < self.array.len() {
                return Ok(mem::replace(&mut self.array[index], value));
            } else if index == self.array.len() && !value.is_nil() {
                let old = self.remove_entry(canonical);
                self.array.push(value);
                self.migrate_array_keys();
                return Ok(old);
            }
        }

        if let Some(&i) = self.index.get(&canonical) {
            let old = mem::replace(&mut self.entries[i].1, value);
            match (old.is_nil(), value.is_nil()) {
                (false, true) => self.dead += 1,
                (true, false) => self.dead -= 1,
                _ => {}
            }
            return Ok(old);
        }

        if !value.is_nil() {
            if self.dead > 0 && self.dead * 2 >= self.entries.len() {
                self.compact();
            }
            self.index.insert(canonical, self.entries.len());
            self.entries.push((canonical.to_value(), value));
        }
        Ok(Value::Nil)
    }

    /// Returns a 'border' for this table.
    pub fn length(&self) -> i64 {
        // Binary search for a border. Entry at max must be nil, min must be 0 or its entry must
        // be non-nil.
        fn binary_search(mut min: i64, mut max: i64, is_nil: impl Fn(i64) -> bool) -> i64 {
            while max - min > 1 {
                let mid = min + (max - min) / 2;
                if is_nil(mid) {
                    max = mid;
                } else {
                    min = mid;
                }
            }
            min
        }

        let array_len = self.array.len() as i64;
        if array_len > 0 && self.array[array_len as usize - 1].is_nil() {
            return binary_search(0, array_len, |i| self.array[i as usize - 1].is_nil());
        }

        let map_is_nil = |i: i64| self.get(Value::Integer(i)).is_nil();
        if self.entries.len() == self.dead || map_is_nil(array_len + 1) {
            return array_len;
        }

        let min = array_len + 1;
        let mut max = min;
        while !map_is_nil(max) {
            if max == i64::MAX {
                return i64::MAX;
            }
            max = max.checked_mul(2).unwrap_or(i64::MAX);
        }
        binary_search(min, max, map_is_nil)
    }

    /// Returns the pair following `key` in traversal order, `Nil` starts the traversal.
    pub fn next(&self, key: Value<'gc>) -> NextValue<'gc> {
        let start_entry = if key.is_nil() {
            if let Some(found) = self.next_in_array(0) {
                return found;
            }
            0
        } else if let Some(index) = to_array_index(key).filter(|&i| i < self.array.len()) {
            if let Some(found) = self.next_in_array(index + 1) {
                return found;
            }
            0
        } else {
            match CanonicalKey::new(key)
                .ok()
                .and_then(|key| self.index.get(&key))
            {
                Some(&i) => i + 1,
                None => return NextValue::NotFound,
            }
        };

        self.entries[start_entry.min(self.entries.len())..]
            .iter()
            .find(|(_, v)| !v.is_nil())
            .map(|&(key, value)| NextValue::Found { key, value })
            .unwrap_or(NextValue::Last)
    }

    fn next_in_array(&self, start: usize) -> Option<NextValue<'gc>> {
        (start..self.array.len())
            .find(|&i| !self.array[i].is_nil())
            .map(|i| NextValue::Found {
                key: Value::Integer(i as i64 + 1),
                value: self.array[i],
            })
    }

    fn remove_entry(&mut self, key: CanonicalKey<'gc>) -> Value<'gc> {
        match self.index.get(&key) {
            Some(&i) => {
                let old = mem::take(&mut self.entries[i].1);
                if !old.is_nil() {
                    self.dead += 1;
                }
                old
            }
            None => Value::Nil,
        }
    }

    // After the array part grows, pull any directly following integer keys out of the map.
    fn migrate_array_keys(&mut self) {
        loop {
            let next = CanonicalKey::Integer(self.array.len() as i64 + 1);
            let value = self.remove_entry(next);
            if value.is_nil() {
                break;
            }
            self.array.push(value);
        }
    }

    fn compact(&mut self) {
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (i, &(key, _)) in self.entries.iter().enumerate() {
            if let Ok(key) = CanonicalKey::new(key) {
                self.index.insert(key, i);
            }
        }
        self.dead = 0;
    }
}

/// Table keys with floats normalized: a float with an exact integer value is the same key as
/// that integer.
#[derive(Debug, Copy, Clone, Collect)]
#[collect(no_drop)]
enum CanonicalKey<'gc> {
    Boolean(bool),
    Integer(i64),
    Number(u64),
    String(String<'gc>),
    Table(Table<'gc>),
    Closure(Closure<'gc>),
    Callback(Callback<'gc>),
    Thread(Thread<'gc>),
    UserData(UserData<'gc>),
    LightUserData(LightUserData),
}

impl<'gc> CanonicalKey<'gc> {
    fn new(value: Value<'gc>) -> Result<Self, InvalidTableKey> {
        Ok(match value {
            Value::Nil => return Err(InvalidTableKey::IsNil),
            Value::Boolean(b) => Self::Boolean(b),
            Value::Integer(i) => Self::Integer(i),
            Value::Number(n) => {
                if n.is_nan() {
                    return Err(InvalidTableKey::IsNaN);
                }
                match number::float_to_integer(n) {
                    Some(i) => Self::Integer(i),
                    None => Self::Number(n.to_bits()),
                }
            }
            Value::String(s) => Self::String(s),
            Value::Table(t) => Self::Table(t),
            Value::Function(Function::Closure(c)) => Self::Closure(c),
            Value::Function(Function::Callback(c)) => Self::Callback(c),
            Value::Thread(t) => Self::Thread(t),
            Value::UserData(u) => Self::UserData(u),
            Value::LightUserData(p) => Self::LightUserData(p),
        })
    }

    fn to_value(self) -> Value<'gc> {
        match self {
            Self::Boolean(b) => Value::Boolean(b),
            Self::Integer(i) => Value::Integer(i),
            Self::Number(n) => Value::Number(f64::from_bits(n)),
            Self::String(s) => Value::String(s),
            Self::Table(t) => Value::Table(t),
            Self::Closure(c) => Value::Function(Function::Closure(c)),
            Self::Callback(c) => Value::Function(Function::Callback(c)),
            Self::Thread(t) => Value::Thread(t),
            Self::UserData(u) => Value::UserData(u),
            Self::LightUserData(p) => Value::LightUserData(p),
        }
    }
}

impl<'gc> PartialEq for CanonicalKey<'gc> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => a == b,
            (Self::Closure(a), Self::Closure(b)) => a == b,
            (Self::Callback(a), Self::Callback(b)) => a == b,
            (Self::Thread(a), Self::Thread(b)) => a == b,
            (Self::UserData(a), Self::UserData(b)) => a == b,
            (Self::LightUserData(a), Self::LightUserData(b)) => a == b,
            _ => false,
        }
    }
}

impl<'gc> Eq for CanonicalKey<'gc> {}

impl<'gc> Hash for CanonicalKey<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        mem::discriminant(self).hash(state);
        match self {
            Self::Boolean(b) => b.hash(state),
            Self::Integer(i) => i.hash(state),
            Self::Number(n) => n.hash(state),
            Self::String(s) => s.hash(state),
            Self::Table(t) => t.hash(state),
            Self::Closure(c) => Gc::as_ptr(c.into_inner()).hash(state),
            Self::Callback(c) => c.hash(state),
            Self::Thread(t) => t.hash(state),
            Self::UserData(u) => u.hash(state),
            Self::LightUserData(p) => p.hash(state),
        }
    }
}

// Returns the zero based array slot for integral keys, including floats with integral values.
fn to_array_index(key: Value<'_>) -> Option<usize> {
    let i = match key {
        Value::Integer(i) => i,
        Value::Number(f) => number::float_to_integer(f)?,
        _ => return None,
    };
    usize::try_from(i.checked_sub(1)?).ok()
}
