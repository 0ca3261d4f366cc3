//! Wrapper memoization.
//!
//! Wrappers are cached by the address of the object they wrap and by wrapper
//! type. The cache holds only weak references: a wrapper lives as long as its
//! callers keep it, and the wrapped object as long as the wrapper does.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{CaptureError, Result};

type ErasedWeak = Weak<dyn Any + Send + Sync>;

/// Result of a wrap request.
pub enum Wrapping<W> {
    /// The wrapper for this source, new or reused.
    Wrapped(Arc<W>),
    /// The source is itself a wrapper issued by this cache.
    AlreadyWrapped,
}

#[derive(Default)]
struct State {
    by_source: HashMap<(TypeId, usize), ErasedWeak>,
    issued: HashMap<usize, ErasedWeak>,
}

impl State {
    fn prune(&mut self) {
        self.by_source.retain(|_, w| w.strong_count() > 0);
        self.issued.retain(|_, w| w.strong_count() > 0);
    }
}

/// Identity-keyed cache of live wrappers.
#[derive(Default)]
pub struct WrapCache {
    state: Mutex<State>,
}

fn address<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

impl WrapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live wrapper of type `W` for `source`, or build one.
    pub fn get_or_wrap<S, W>(&self, source: &Arc<S>, make: impl FnOnce() -> W) -> Result<Wrapping<W>>
    where
        S: ?Sized,
        W: Send + Sync + 'static,
    {
        let addr = address(source);
        let mut state = self
            .state
            .lock()
            .map_err(|_| CaptureError::Internal("wrap cache lock poisoned".to_string()))?;

        if state.issued.get(&addr).is_some_and(|w| w.strong_count() > 0) {
            return Ok(Wrapping::AlreadyWrapped);
        }

        let key = (TypeId::of::<W>(), addr);
        if let Some(existing) = state.by_source.get(&key).and_then(Weak::upgrade) {
            return existing
                .downcast::<W>()
                .map(Wrapping::Wrapped)
                .map_err(|_| CaptureError::Internal("wrapper type mismatch".to_string()));
        }

        state.prune();
        let wrapper = Arc::new(make());
        let erased: Arc<dyn Any + Send + Sync> = wrapper.clone();
        state.by_source.insert(key, Arc::downgrade(&erased));
        state.issued.insert(address(&wrapper), Arc::downgrade(&erased));

        Ok(Wrapping::Wrapped(wrapper))
    }

    /// True if `candidate` is a live wrapper issued by this cache.
    pub fn is_wrapper<T: ?Sized>(&self, candidate: &Arc<T>) -> bool {
        self.state
            .lock()
            .map(|state| {
                state
                    .issued
                    .get(&address(candidate))
                    .is_some_and(|w| w.strong_count() > 0)
            })
            .unwrap_or(false)
    }

    /// Number of live wrappers.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.issued.values().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for WrapCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapCache").field("live", &self.len()).finish()
    }
}
