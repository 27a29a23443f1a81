//! Temporarily swap the implementation behind a shared name.
//!
//! For call sites that cannot take a proxy as a parameter: the call site reads
//! its collaborator from a [`Binding`], and a test installs the proxy for the
//! lifetime of an [`OverrideGuard`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub struct Binding<T: ?Sized> {
    current: Mutex<Arc<T>>,
}

impl<T: ?Sized> Binding<T> {
    pub fn new(value: Arc<T>) -> Self {
        Self {
            current: Mutex::new(value),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Arc<T>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.slot())
    }

    /// Bind `value` until the returned guard drops, then restore the previous binding.
    #[must_use = "the override is undone as soon as the guard drops"]
    pub fn install(&self, value: Arc<T>) -> OverrideGuard<'_, T> {
        let previous = std::mem::replace(&mut *self.slot(), value);
        OverrideGuard {
            binding: self,
            previous: Some(previous),
        }
    }
}

pub struct OverrideGuard<'a, T: ?Sized> {
    binding: &'a Binding<T>,
    previous: Option<Arc<T>>,
}

impl<T: ?Sized> Drop for OverrideGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.binding.slot() = previous;
        }
    }
}

/// Run `f` with `value` bound, restoring the original afterwards, even on panic.
pub fn with_override<T: ?Sized, R>(binding: &Binding<T>, value: Arc<T>, f: impl FnOnce() -> R) -> R {
    let _guard = binding.install(value);
    f()
}

#[cfg(test)]
mod tests {
    use super::{with_override, Binding};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::Arc;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Live;
    struct Canned;

    impl Greeter for Live {
        fn greet(&self) -> String {
            "live".to_string()
        }
    }

    impl Greeter for Canned {
        fn greet(&self) -> String {
            "canned".to_string()
        }
    }

    #[test]
    fn guard_restores_on_drop() {
        let binding: Binding<dyn Greeter> = Binding::new(Arc::new(Live));
        {
            let _guard = binding.install(Arc::new(Canned));
            assert_eq!(binding.get().greet(), "canned");
        }
        assert_eq!(binding.get().greet(), "live");
    }

    #[test]
    fn nested_overrides_unwind_in_order() {
        let binding: Binding<str> = Binding::new(Arc::from("a"));
        let outer = binding.install(Arc::from("b"));
        {
            let _inner = binding.install(Arc::from("c"));
            assert_eq!(&*binding.get(), "c");
        }
        assert_eq!(&*binding.get(), "b");
        drop(outer);
        assert_eq!(&*binding.get(), "a");
    }

    #[test]
    fn panics_still_restore_the_original() {
        let binding: Binding<dyn Greeter> = Binding::new(Arc::new(Live));
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            with_override(&binding, Arc::new(Canned), || {
                assert_eq!(binding.get().greet(), "canned");
                panic!("code under test failed");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(binding.get().greet(), "live");
    }
}
