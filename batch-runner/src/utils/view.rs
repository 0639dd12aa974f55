//! Lazily recomputed views over mutable collections.
//!
//! A collection owns a [`DerivedView`] and calls [`DerivedView::touch`] on every
//! mutation. Readers call [`DerivedView::get_or_compute`], which recomputes
//! only when something changed since the last read.

use std::sync::Arc;

use parking_lot::Mutex;

struct ViewState<T> {
    generation: u64,
    dirty: bool,
    cached: Option<(u64, Arc<T>)>,
}

/// Cached derivation of a source collection.
pub struct DerivedView<T> {
    state: Mutex<ViewState<T>>,
}

impl<T> DerivedView<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ViewState {
                generation: 0,
                dirty: true,
                cached: None,
            }),
        }
    }

    /// Record a mutation of the source collection.
    pub fn touch(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.dirty = true;
    }

    /// Current mutation counter.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Return the cached view, recomputing it first if the source changed.
    ///
    /// `compute` runs under the view's own lock, so it must not call back into
    /// this view.
    pub fn get_or_compute<F>(&self, compute: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        let mut state = self.state.lock();
        if !state.dirty
            && let Some((generation, value)) = &state.cached
            && *generation == state.generation
        {
            return value.clone();
        }

        let value = Arc::new(compute());
        state.cached = Some((state.generation, value.clone()));
        state.dirty = false;
        value
    }
}

impl<T> Default for DerivedView<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_recomputes_only_after_touch() {
        let view: DerivedView<usize> = DerivedView::new();
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            42
        };

        assert_eq!(*view.get_or_compute(compute), 42);
        assert_eq!(*view.get_or_compute(compute), 42);
        assert_eq!(calls.get(), 1);
        assert!(!view.is_dirty());

        view.touch();
        assert!(view.is_dirty());
        assert_eq!(*view.get_or_compute(compute), 42);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_generation_counts_mutations() {
        let view: DerivedView<()> = DerivedView::new();
        assert_eq!(view.generation(), 0);
        view.touch();
        view.touch();
        assert_eq!(view.generation(), 2);
    }
}
