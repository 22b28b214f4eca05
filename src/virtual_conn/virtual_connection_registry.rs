use std::collections::hash_map::Entry;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::trace;

use crate::connection::ConnectionId;
use crate::virtual_conn::virtual_connection::{VcKey, VirtualConnection};

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RegisterError {
    #[error("virtual connection with identical endpoint keys {0:?}")]
    IdenticalKeys(VcKey),
    #[error("virtual connection {0:?} / {1:?} is already registered")]
    Duplicate(VcKey, VcKey),
    #[error("limit of {0} virtual connections reached")]
    Full(usize),
}

/// Lookup table of the circuits passing through a hub. Every circuit is stored under both its
///  endpoints' keys, and the two keys are always inserted and removed in a single critical
///  section. The number of circuits is checked in that same critical section.
pub struct VirtualConnectionRegistry {
    max_circuits: usize,
    entries: Mutex<FxHashMap<VcKey, Arc<VirtualConnection>>>,
}

impl VirtualConnectionRegistry {
    pub fn new(max_circuits: usize) -> VirtualConnectionRegistry {
        VirtualConnectionRegistry {
            max_circuits,
            entries: Default::default(),
        }
    }

    pub async fn register(&self, vc: VirtualConnection) -> Result<Arc<VirtualConnection>, RegisterError> {
        let (key_a, key_b) = vc.keys();
        if key_a == key_b {
            return Err(RegisterError::IdenticalKeys(key_a));
        }

        let mut entries = self.entries.lock().await;
        if entries.contains_key(&key_a) || entries.contains_key(&key_b) {
            return Err(RegisterError::Duplicate(key_a, key_b));
        }
        if entries.len() / 2 >= self.max_circuits {
            return Err(RegisterError::Full(self.max_circuits));
        }

        let vc = Arc::new(vc);
        entries.insert(key_a, vc.clone());
        entries.insert(key_b, vc.clone());
        trace!("registered virtual connection {:?}", vc);
        Ok(vc)
    }

    pub async fn find(&self, key: &VcKey) -> Option<Arc<VirtualConnection>> {
        self.entries.lock().await
            .get(key)
            .cloned()
    }

    /// Removes the circuit under both its keys. Returns `None` if it was removed before - two
    ///  sides closing the same circuit concurrently is a normal race.
    pub async fn remove(&self, key: &VcKey) -> Option<Arc<VirtualConnection>> {
        let mut entries = self.entries.lock().await;
        let vc = match entries.entry(*key) {
            Entry::Occupied(e) => e.remove(),
            Entry::Vacant(_) => return None,
        };

        let (key_a, key_b) = vc.keys();
        let other_key = if &key_a == key { key_b } else { key_a };
        entries.remove(&other_key);
        Some(vc)
    }

    /// removes and returns every circuit with an endpoint on the given physical connection
    pub async fn remove_all_with_prefix(&self, connection: ConnectionId) -> Vec<Arc<VirtualConnection>> {
        let mut entries = self.entries.lock().await;

        let keys = entries.keys()
            .filter(|k| k.connection == connection)
            .cloned()
            .collect::<Vec<_>>();

        let mut result = Vec::new();
        for key in keys {
            if let Some(vc) = entries.remove(&key) {
                let (key_a, key_b) = vc.keys();
                let other_key = if key_a == key { key_b } else { key_a };
                entries.remove(&other_key);
                result.push(vc);
            }
        }
        result
    }

    /// number of registered circuits
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len() / 2
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
