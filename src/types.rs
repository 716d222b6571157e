use std::fmt;

use gc_arena::Collect;

macro_rules! operand_index {
    ($(#[$meta:meta])* $name:ident($int:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Collect)]
        #[collect(require_static)]
        pub struct $name(pub $int);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

operand_index!(
    /// A register of the running frame, counted from the frame's base.
    RegisterIndex(u8),
    "r"
);
operand_index!(
    /// A constant of the running prototype, for operands with a single byte to spare.
    ConstantIndex8(u8),
    "k"
);
operand_index!(
    /// A constant of the running prototype, for `LoadConstant`.
    ConstantIndex16(u16),
    "k"
);
operand_index!(
    /// An upvalue of the running closure.
    UpValueIndex(u8),
    "u"
);
operand_index!(
    /// A nested prototype of the running prototype.
    PrototypeIndex(u8),
    "p"
);

/// An optional byte, `Some` for 0 through 254 and `None` stored as 255.
#[derive(Copy, Clone, Eq, PartialEq, Collect)]
#[collect(require_static)]
pub struct Opt254(u8);

impl Opt254 {
    const NONE: u8 = u8::MAX;

    pub fn none() -> Opt254 {
        Opt254(Self::NONE)
    }

    /// Returns `None` for 255, which does not fit.
    pub fn try_some(v: u8) -> Option<Opt254> {
        (v != Self::NONE).then_some(Opt254(v))
    }

    /// # Panics
    ///
    /// Panics if `v` is 255.
    pub fn some(v: u8) -> Opt254 {
        Self::try_some(v).unwrap_or_else(|| panic!("Opt254 cannot hold 255"))
    }

    pub fn to_u8(self) -> Option<u8> {
        (self.0 != Self::NONE).then_some(self.0)
    }
}

impl fmt::Debug for Opt254 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Opt254").field(&self.to_u8()).finish()
    }
}

/// A number of arguments or results: either a constant from 0 to 254, or "variable", meaning every
/// value up to the top of the stack.
#[derive(Copy, Clone, Eq, PartialEq, Collect)]
#[collect(require_static)]
pub struct VarCount(Opt254);

impl VarCount {
    pub fn variable() -> VarCount {
        VarCount(Opt254::none())
    }

    pub fn constant(constant: u8) -> VarCount {
        VarCount(Opt254::some(constant))
    }

    pub fn try_constant(constant: u8) -> Option<VarCount> {
        Opt254::try_some(constant).map(VarCount)
    }

    pub fn is_variable(self) -> bool {
        self.to_constant().is_none()
    }

    pub fn to_constant(self) -> Option<u8> {
        self.0.to_u8()
    }
}

impl fmt::Debug for VarCount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_constant() {
            Some(n) => write!(f, "VarCount({n})"),
            None => write!(f, "VarCount(variable)"),
        }
    }
}

/// Where a closure finds each of its upvalues when it is created.
#[derive(Debug, Collect, Clone, Copy, PartialEq, Eq)]
#[collect(require_static)]
pub enum UpValueDescriptor {
    /// Open (or share) an upvalue aliasing a register of the frame creating the closure.
    ParentLocal(RegisterIndex),
    /// Share an upvalue of the closure creating the closure.
    Outer(UpValueIndex),
}
