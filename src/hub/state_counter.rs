use std::sync::atomic::{AtomicU64, Ordering};

/// Logical clock of a hub: every fact the hub publishes about itself is stamped with a fresh
///  value, and peers use the stamps to tell newer from older information.
#[derive(Debug, Default)]
pub struct StateCounter {
    value: AtomicU64,
}

impl StateCounter {
    pub fn new() -> StateCounter {
        Default::default()
    }

    /// returns the new value
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
