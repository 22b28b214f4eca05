use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Parity {
    Even,
    Odd,
}

/// Hands out circuit ids for one physical connection. The two ends of a connection are
///  configured with opposite parities, so ids they allocate independently never collide.
#[derive(Debug)]
pub struct ConnectionIdAllocator {
    next: AtomicU64,
}

impl ConnectionIdAllocator {
    pub fn new(parity: Parity) -> ConnectionIdAllocator {
        ConnectionIdAllocator {
            next: AtomicU64::new(match parity {
                Parity::Even => 2,
                Parity::Odd => 1,
            }),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(2, Ordering::Relaxed)
    }
}
