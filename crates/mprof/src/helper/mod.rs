use std::cell::Cell;

thread_local! {
    static REENTRANCY: Cell<usize> = const { Cell::new(0) };
}

/// Reentrancy guard
pub(crate) struct Reentrancy(usize);

impl Reentrancy {
    /// Create new reentrancy guard.
    #[inline]
    pub(crate) fn new() -> Self {
        // `try_with` fails while the thread local is being torn down,
        // treat that as nested so the allocator stays out of the way.
        let depth = REENTRANCY
            .try_with(|counter| {
                let depth = counter.get() + 1;
                counter.set(depth);
                depth
            })
            .unwrap_or(usize::MAX);

        Self(depth)
    }
}

impl Reentrancy {
    /// Return true if first enter the scope.
    #[inline]
    pub(crate) fn is_ok(&self) -> bool {
        self.0 == 1
    }
}

impl Drop for Reentrancy {
    #[inline]
    fn drop(&mut self) {
        if self.0 != usize::MAX {
            _ = REENTRANCY.try_with(|counter| counter.set(counter.get() - 1));
        }
    }
}
