use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
};

use gc_arena::{lock::Lock, Collect, Gc, Mutation, StaticCollect};
use thiserror::Error;

use crate::Table;

#[derive(Debug, Copy, Clone, Error)]
#[error("userdata type mismatch")]
pub struct BadUserDataType;

/// A bare host pointer with no metatable, compared by address.
///
/// The pointer is never dereferenced by the runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Collect)]
#[collect(require_static)]
pub struct LightUserData(pub *const ());

impl LightUserData {
    pub fn from_ref<T>(r: &T) -> Self {
        LightUserData(r as *const T as *const ())
    }
}

#[derive(Collect)]
#[collect(no_drop)]
pub struct UserDataInner<'gc> {
    data: StaticCollect<Box<dyn Any>>,
    metatable: Lock<Option<Table<'gc>>>,
}

/// A garbage collected box holding an arbitrary `'static` host value.
///
/// Like [`Table`]s, `UserData` may have a metatable which lets scripts trigger metamethods when
/// operating on it. There is no interior mutability on the held value, use `RefCell` or similar
/// if the host needs to mutate it.
#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct UserData<'gc>(Gc<'gc, UserDataInner<'gc>>);

impl<'gc> fmt::Debug for UserData<'gc> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_tuple("UserData")
            .field(&Gc::as_ptr(self.0))
            .finish()
    }
}

impl<'gc> PartialEq for UserData<'gc> {
    fn eq(&self, other: &Self) -> bool {
        Gc::ptr_eq(self.0, other.0)
    }
}

impl<'gc> Eq for UserData<'gc> {}

impl<'gc> Hash for UserData<'gc> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Gc::as_ptr(self.0).hash(state)
    }
}

impl<'gc> UserData<'gc> {
    pub fn new_static<T: 'static>(mc: &Mutation<'gc>, val: T) -> Self {
        UserData(Gc::new(
            mc,
            UserDataInner {
                data: StaticCollect(Box::new(val)),
                metatable: Lock::new(None),
            },
        ))
    }

    pub fn from_inner(inner: Gc<'gc, UserDataInner<'gc>>) -> Self {
        Self(inner)
    }

    pub fn into_inner(self) -> Gc<'gc, UserDataInner<'gc>> {
        self.0
    }

    pub fn is_static<T: 'static>(self) -> bool {
        self.0.data.0.is::<T>()
    }

    pub fn downcast_static<T: 'static>(self) -> Result<&'gc T, BadUserDataType> {
        Gc::as_ref(self.0)
            .data
            .0
            .downcast_ref::<T>()
            .ok_or(BadUserDataType)
    }

    pub fn metatable(self) -> Option<Table<'gc>> {
        self.0.metatable.get()
    }

    pub fn set_metatable(
        self,
        mc: &Mutation<'gc>,
        metatable: Option<Table<'gc>>,
    ) -> Option<Table<'gc>> {
        gc_arena::barrier::field!(Gc::write(mc, self.0), UserDataInner, metatable)
            .unlock()
            .replace(metatable)
    }
}

#[cfg(test)]
mod tests {
    use gc_arena::rootless_arena;

    use super::*;

    #[test]
    fn test_downcast() {
        rootless_arena(|mc| {
            let ud = UserData::new_static(mc, 17u32);
            assert!(ud.is_static::<u32>());
            assert!(!ud.is_static::<i32>());
            assert_eq!(*ud.downcast_static::<u32>().unwrap(), 17);
            assert!(ud.downcast_static::<String>().is_err());

            let mt = Table::new(mc);
            assert!(ud.set_metatable(mc, Some(mt)).is_none());
            assert_eq!(ud.metatable(), Some(mt));
        });
    }

    #[test]
    fn test_light_userdata_identity() {
        let a = 1u8;
        let b = 1u8;
        assert_eq!(LightUserData::from_ref(&a), LightUserData::from_ref(&a));
        assert_ne!(LightUserData::from_ref(&a), LightUserData::from_ref(&b));
    }
}
