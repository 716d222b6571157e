use std::{
    fmt,
    hash::{BuildHasherDefault, Hash, Hasher},
    ops,
    str::{self, Utf8Error},
};

use ahash::AHasher;
use gc_arena::{
    allocator_api::MetricsAlloc, barrier::Unlock, lock::RefLock, metrics::Metrics, Collect, Collection, Gc, GcWeak,
    Mutation, StaticCollect,
};
use hashbrown::{hash_map, raw::RawTable, HashMap};
use thiserror::Error;

use crate::{number, Context, Value};

/// The script string type.
///
/// Strings are immutable byte sequences. They may contain arbitrary bytes including embedded
/// zeros, and are not necessarily UTF-8.
#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct String<'gc>(Gc<'gc, StringInner>);

#[derive(Collect)]
#[collect(require_static)]
pub struct StringInner {
    hash: u64,
    bytes: Bytes,
}

enum Bytes {
    Static(&'static [u8]),
    // Owned buffers live outside of the GC allocation, so their size is reported to the arena
    // metrics for as long as they are alive.
    Owned { buffer: Box<[u8]>, metrics: Metrics },
}

impl Drop for Bytes {
    fn drop(&mut self) {
        if let Bytes::Owned { buffer, metrics } = self {
            metrics.mark_external_deallocation(buffer.len());
        }
    }
}

impl<'gc> String<'gc> {
    pub fn from_buffer(mc: &Mutation<'gc>, buffer: Box<[u8]>) -> String<'gc> {
        let metrics = mc.metrics().clone();
        metrics.mark_external_allocation(buffer.len());
        String(Gc::new(
            mc,
            StringInner {
                hash: str_hash(&buffer),
                bytes: Bytes::Owned { buffer, metrics },
            },
        ))
    }

    pub fn from_slice(mc: &Mutation<'gc>, s: impl AsRef<[u8]>) -> String<'gc> {
        Self::from_buffer(mc, s.as_ref().into())
    }

    pub fn from_static<S: ?Sized + AsRef<[u8]>>(mc: &Mutation<'gc>, s: &'static S) -> String<'gc> {
        String(Gc::new(
            mc,
            StringInner {
                hash: str_hash(s.as_ref()),
                bytes: Bytes::Static(s.as_ref()),
            },
        ))
    }

    pub fn from_inner(inner: Gc<'gc, StringInner>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, StringInner> {
        self.0
    }

    pub fn stored_hash(self) -> u64 {
        self.0.hash
    }

    pub fn as_bytes(self) -> &'gc [u8] {
        match &Gc::as_ref(self.0).bytes {
            Bytes::Static(s) => s,
            Bytes::Owned { buffer, .. } => buffer,
        }
    }

    pub fn len(self) -> i64 {
        self.as_bytes().len() as i64
    }

    pub fn is_empty(self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn to_str(self) -> Result<&'gc str, Utf8Error> {
        str::from_utf8(self.as_bytes())
    }

    /// Display a potentially non-utf8 `String` in a lossy way.
    pub fn display_lossy(self) -> impl fmt::Display + 'gc {
        struct Lossy<'a>(&'a [u8]);

        impl<'a> fmt::Display for Lossy<'a> {
            fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt.write_str(&std::string::String::from_utf8_lossy(self.0))
            }
        }

        Lossy(self.as_bytes())
    }

    /// Concatenates strings and numbers, numbers are converted with their usual formatting.
    pub fn concat(ctx: Context<'gc>, values: &[Value<'gc>]) -> Result<String<'gc>, BadConcatType> {
        let mut bytes = Vec::new();
        for &value in values {
            match value {
                Value::String(s) => bytes.extend_from_slice(s.as_bytes()),
                Value::Integer(i) => bytes.extend_from_slice(i.to_string().as_bytes()),
                Value::Number(n) => bytes.extend_from_slice(number::format_float(n).as_bytes()),
                v => {
                    return Err(BadConcatType {
                        bad_type: v.type_name(),
                    })
                }
            }
        }
        Ok(ctx.intern(&bytes))
    }
}

fn str_hash(s: &[u8]) -> u64 {
    let mut state = AHasher::default();
    state.write(s);
    state.finish()
}

impl<'gc> fmt::Debug for String<'gc> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "String({:?})", self.display_lossy().to_string())
    }
}

impl<'gc> fmt::Display for String<'gc> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.display_lossy())
    }
}

#[derive(Debug, Copy, Clone, Error)]
#[error("cannot concatenate a {bad_type} value")]
pub struct BadConcatType {
    pub bad_type: &'static str,
}

impl<'gc> ops::Deref for String<'gc> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<'gc> AsRef<[u8]> for String<'gc> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl<'gc, T> PartialEq<T> for String<'gc>
where
    T: ?Sized + AsRef<[u8]>,
{
    fn eq(&self, other: &T) -> bool {
        self.as_bytes() == other.as_ref()
    }
}

impl<'gc> Eq for String<'gc> {}

impl<'gc> Hash for String<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.stored_hash())
    }
}

struct InternedDynStringsInner<'gc>(
    RefLock<RawTable<(GcWeak<'gc, StringInner>, u64), MetricsAlloc<'gc>>>,
);

#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
struct InternedDynStrings<'gc>(Gc<'gc, InternedDynStringsInner<'gc>>);

// Interned strings are held weakly, entries whose string has been collected are pruned while
// tracing.
unsafe impl<'gc> Collect for InternedDynStringsInner<'gc> {
    fn trace(&self, cc: &Collection) {
        // SAFETY: No new Gc pointers are adopted or reparented.
        let mut dyn_strings = unsafe { self.0.unlock_unchecked() }.borrow_mut();
        unsafe {
            for bucket in dyn_strings.iter() {
                let s = bucket.as_ref().0;
                if s.is_dropped(cc) {
                    // SAFETY: it is okay to erase items yielded by the iterator.
                    dyn_strings.erase(bucket);
                } else {
                    s.trace(cc);
                }
            }
        }
    }
}

impl<'gc> InternedDynStrings<'gc> {
    fn new(mc: &Mutation<'gc>) -> Self {
        Self(Gc::new(
            mc,
            InternedDynStringsInner(RefLock::new(RawTable::new_in(MetricsAlloc::new(mc)))),
        ))
    }

    fn intern(self, mc: &Mutation<'gc>, s: &[u8]) -> String<'gc> {
        let hash = str_hash(s);

        // SAFETY: If a new string is added, we call the write barrier.
        let mut dyn_strings = unsafe { self.0 .0.unlock_unchecked() }.borrow_mut();

        // SAFETY: The RawTable outlives the iterator
        unsafe {
            for bucket in dyn_strings.iter_hash(hash) {
                let (key, _) = *bucket.as_ref();
                match key.upgrade(mc).map(String::from_inner) {
                    Some(existing) if existing == s => return existing,
                    Some(_) => {}
                    // SAFETY: it is okay to erase items yielded by the iterator.
                    None => dyn_strings.erase(bucket),
                }
            }
        }

        Gc::write(mc, self.0);

        let s = String::from_slice(mc, s);
        dyn_strings.insert(hash, (Gc::downgrade(s.into_inner()), hash), |(_, hash)| *hash);
        s
    }
}

#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
struct InternedStaticStrings<'gc>(
    Gc<
        'gc,
        RefLock<
            HashMap<
                StaticCollect<*const [u8]>,
                String<'gc>,
                BuildHasherDefault<AHasher>,
                MetricsAlloc<'gc>,
            >,
        >,
    >,
);

impl<'gc> InternedStaticStrings<'gc> {
    fn new(mc: &Mutation<'gc>) -> Self {
        Self(Gc::new(
            mc,
            RefLock::new(HashMap::with_hasher_in(
                BuildHasherDefault::default(),
                MetricsAlloc::new(mc),
            )),
        ))
    }

    fn intern(self, mc: &Mutation<'gc>, s: &'static [u8]) -> String<'gc> {
        match self.0.borrow_mut(mc).entry(StaticCollect(s as *const _)) {
            hash_map::Entry::Occupied(occupied) => *occupied.get(),
            hash_map::Entry::Vacant(vacant) => *vacant.insert(String::from_static(mc, s)),
        }
    }
}

/// A set of shared, immutable `String` values that are de-duplicated to save space.
///
/// Dynamic strings are held weakly: if a previously interned string is still live it is returned
/// instead of allocating a new one. Static strings are keyed by address and kept forever.
#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct InternedStringSet<'gc> {
    dyn_strings: InternedDynStrings<'gc>,
    static_strings: InternedStaticStrings<'gc>,
}

impl<'gc> InternedStringSet<'gc> {
    pub fn new(mc: &Mutation<'gc>) -> InternedStringSet<'gc> {
        InternedStringSet {
            dyn_strings: InternedDynStrings::new(mc),
            static_strings: InternedStaticStrings::new(mc),
        }
    }

    pub fn intern(self, mc: &Mutation<'gc>, s: &[u8]) -> String<'gc> {
        self.dyn_strings.intern(mc, s)
    }

    pub fn intern_static(self, mc: &Mutation<'gc>, s: &'static [u8]) -> String<'gc> {
        self.static_strings.intern(mc, s)
    }
}
