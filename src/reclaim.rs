//! Deferred release of allocations the real-time path may still be reading.
//!
//! Swapping an `ArcSwap` publishes the new value, but a guard taken by the IO
//! cycle just before the swap can keep the old value alive. If that guard were
//! the last owner, the deallocation would happen inside the audio callback.
//! Retired values are parked here instead and dropped on a later
//! administrative call, once nothing but the graveyard holds them.

use std::sync::Arc;

/// Parking lot for values retired from the real-time path.
#[derive(Default)]
pub(crate) struct Graveyard {
    retired: Vec<Arc<dyn Send + Sync>>,
}

impl Graveyard {
    /// Park `value` and free anything no longer referenced elsewhere.
    pub(crate) fn retire<T: Send + Sync + 'static>(&mut self, value: Arc<T>) {
        self.retired.push(value);
        self.collect();
    }

    /// Drop every parked value that only the graveyard still owns.
    pub(crate) fn collect(&mut self) {
        self.retired.retain(|value| Arc::strong_count(value) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.retired.len()
    }
}
