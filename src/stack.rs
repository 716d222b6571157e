use std::{
    iter,
    ops::{Bound, Index, IndexMut, RangeBounds},
    slice,
};

use allocator_api2::vec;
use gc_arena::allocator_api::MetricsAlloc;

use crate::{Context, FromMultiValue, FromValue, IntoMultiValue, IntoValue, TypeError, Value};

/// The window of a thread's stack visible to a running native function.
///
/// Index 0 is the first argument. Everything below the window belongs to other frames and is not
/// reachable through this API.
pub struct Stack<'gc, 'a> {
    values: &'a mut vec::Vec<Value<'gc>, MetricsAlloc<'gc>>,
    bottom: usize,
}

impl<'gc, 'a> Stack<'gc, 'a> {
    pub fn new(values: &'a mut vec::Vec<Value<'gc>, MetricsAlloc<'gc>>, bottom: usize) -> Self {
        assert!(values.len() >= bottom);
        Self { values, bottom }
    }

    pub fn reborrow(&mut self) -> Stack<'gc, '_> {
        Stack {
            values: self.values,
            bottom: self.bottom,
        }
    }

    /// A window over the top of this one, starting at `bottom`.
    pub fn sub_stack(&mut self, bottom: usize) -> Stack<'gc, '_> {
        Stack {
            values: self.values,
            bottom: self.bottom + bottom,
        }
    }

    pub fn get(&self, i: usize) -> Value<'gc> {
        self.values
            .get(self.bottom + i)
            .copied()
            .unwrap_or_default()
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut Value<'gc>> {
        self.values.get_mut(self.bottom + i)
    }

    /// Sets the value at `i`, growing the window with nils if necessary.
    pub fn set(&mut self, i: usize, value: Value<'gc>) {
        let i = self.bottom + i;
        if i >= self.values.len() {
            self.values.resize(i + 1, Value::Nil);
        }
        self.values[i] = value;
    }

    pub fn push_back(&mut self, value: Value<'gc>) {
        self.values.push(value);
    }

    pub fn push_front(&mut self, value: Value<'gc>) {
        self.values.insert(self.bottom, value);
    }

    pub fn pop_back(&mut self) -> Option<Value<'gc>> {
        if self.values.len() > self.bottom {
            self.values.pop()
        } else {
            None
        }
    }

    pub fn pop_front(&mut self) -> Option<Value<'gc>> {
        if self.values.len() > self.bottom {
            Some(self.values.remove(self.bottom))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.values.len() - self.bottom
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.values.truncate(self.bottom);
    }

    pub fn resize(&mut self, size: usize) {
        self.values.resize(self.bottom + size, Value::Nil);
    }

    pub fn extend<I: IntoIterator<Item = Value<'gc>>>(&mut self, iter: I) {
        self.values.extend(iter);
    }

    pub fn drain<R: RangeBounds<usize>>(&mut self, range: R) -> vec::Drain<'_, Value<'gc>, MetricsAlloc<'gc>> {
        let start = match range.start_bound() {
            Bound::Included(&i) => self.bottom + i,
            Bound::Excluded(&i) => self.bottom + i + 1,
            Bound::Unbounded => self.bottom,
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => self.bottom + i + 1,
            Bound::Excluded(&i) => self.bottom + i,
            Bound::Unbounded => self.values.len(),
        };
        self.values.drain(start..end)
    }

    pub fn iter(&self) -> iter::Copied<slice::Iter<'_, Value<'gc>>> {
        self.values[self.bottom..].iter().copied()
    }

    pub fn into_back(&mut self, ctx: Context<'gc>, v: impl IntoMultiValue<'gc>) {
        for v in v.into_multi_value(ctx) {
            self.values.push(v.into_value(ctx));
        }
    }

    pub fn into_front(&mut self, ctx: Context<'gc>, v: impl IntoMultiValue<'gc>) {
        let len = self.values.len();
        self.into_back(ctx, v);
        let pushed = self.values.len() - len;
        self.values[self.bottom..].rotate_right(pushed);
    }

    pub fn from_back<V: FromValue<'gc>>(&mut self, ctx: Context<'gc>) -> Result<V, TypeError> {
        V::from_value(ctx, self.pop_back().unwrap_or_default())
    }

    pub fn from_front<V: FromValue<'gc>>(&mut self, ctx: Context<'gc>) -> Result<V, TypeError> {
        V::from_value(ctx, self.pop_front().unwrap_or_default())
    }

    /// Replace the entire window with the given values.
    pub fn replace(&mut self, ctx: Context<'gc>, v: impl IntoMultiValue<'gc>) {
        self.clear();
        self.into_back(ctx, v);
    }

    /// Convert the whole window, leaving it empty.
    pub fn consume<V: FromMultiValue<'gc>>(&mut self, ctx: Context<'gc>) -> Result<V, TypeError> {
        V::from_multi_value(ctx, self.values.drain(self.bottom..))
    }

    /// The entire stack of the running thread, including every frame below this window.
    pub(crate) fn full(&self) -> &[Value<'gc>] {
        self.values
    }

    pub(crate) fn full_mut(&mut self) -> &mut [Value<'gc>] {
        self.values
    }
}

impl<'gc, 'a> Index<usize> for Stack<'gc, 'a> {
    type Output = Value<'gc>;

    fn index(&self, i: usize) -> &Value<'gc> {
        &self.values[self.bottom + i]
    }
}

impl<'gc, 'a> IndexMut<usize> for Stack<'gc, 'a> {
    fn index_mut(&mut self, i: usize) -> &mut Value<'gc> {
        &mut self.values[self.bottom + i]
    }
}

impl<'gc, 'a, 'b> IntoIterator for &'b Stack<'gc, 'a> {
    type Item = Value<'gc>;
    type IntoIter = iter::Copied<slice::Iter<'b, Value<'gc>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use gc_arena::rootless_arena;

    use super::*;
    use std::prelude::rust_2021::vec;

    #[test]
    fn test_window_operations() {
        rootless_arena(|mc| {
            let mut values = vec::Vec::new_in(MetricsAlloc::new(mc));
            values.push(Value::Integer(-1));
            values.push(Value::Integer(-2));

            let mut stack = Stack::new(&mut values, 2);
            assert!(stack.is_empty());
            stack.push_back(Value::Integer(2));
            stack.push_front(Value::Integer(1));
            stack.set(3, Value::Boolean(true));
            assert_eq!(stack.len(), 4);
            assert_eq!(stack.get(0), Value::Integer(1));
            assert_eq!(stack.get(2), Value::Nil);
            assert_eq!(stack.get(10), Value::Nil);

            assert_eq!(stack.pop_front(), Some(Value::Integer(1)));
            assert_eq!(stack.pop_back(), Some(Value::Boolean(true)));
            let drained: Vec<_> = stack.drain(..).collect();
            assert_eq!(drained, vec![Value::Integer(2), Value::Nil]);
            assert_eq!(stack.pop_back(), None);
            assert_eq!(stack.full().len(), 2);

            let mut sub = stack.sub_stack(0);
            sub.resize(3);
            assert_eq!(sub.len(), 3);
            sub.clear();
            assert_eq!(values.as_slice(), &[Value::Integer(-1), Value::Integer(-2)]);
        });
    }
}
