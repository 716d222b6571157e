mod raw;
mod table;

pub use self::{
    raw::{InvalidTableKey, NextValue, RawTable},
    table::{Iter, Table, TableInner, TableState},
};
