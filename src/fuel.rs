/// A budget for the amount of work done by a single call to [`Executor::step`].
///
/// One unit of fuel is roughly one VM instruction. Native functions, sequence polls and executor
/// bookkeeping consume a few units each, so a step always returns to the host in bounded time.
/// Nesting of native work is bounded separately by
/// [`Limits::max_native_depth`](crate::config::Limits::max_native_depth).
///
/// [`Executor::step`]: crate::Executor::step
#[derive(Debug, Clone)]
pub struct Fuel {
    fuel: i32,
    interrupted: bool,
}

impl Fuel {
    pub fn with(fuel: i32) -> Self {
        Self {
            fuel,
            interrupted: false,
        }
    }

    /// Credit fuel without letting the total grow past `max_fuel`, and clear any interrupt.
    ///
    /// Meant for hosts reusing one `Fuel` across many steps.
    pub fn refill(&mut self, fuel: i32, max_fuel: i32) {
        self.fuel = self.fuel.saturating_add(fuel).min(max_fuel);
        self.interrupted = false;
    }

    pub fn consume(&mut self, fuel: i32) {
        self.fuel = self.fuel.saturating_sub(fuel);
    }

    pub fn remaining(&self) -> i32 {
        self.fuel
    }

    /// Make the running step return as soon as possible without consuming anything.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn should_continue(&self) -> bool {
        self.fuel > 0 && !self.interrupted
    }
}
