use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::communicator::Communicator;

/// Open communicators of one session, keyed by address
///
/// Owned by whoever runs the session; `cleanup` closes everything still
/// registered, e.g. at the end of a test.
#[derive(Default)]
pub struct CommRegistry {
    comms: Mutex<HashMap<String, Arc<dyn Communicator>>>,
}

impl CommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the communicator's address, replacing any previous entry
    pub fn register(&self, comm: Arc<dyn Communicator>) -> Option<Arc<dyn Communicator>> {
        let address = comm.address();
        debug!(comm = %comm.name(), %address, "registered communicator");
        self.comms.lock().insert(address, comm)
    }

    pub fn unregister(&self, address: &str) -> Option<Arc<dyn Communicator>> {
        self.comms.lock().remove(address)
    }

    pub fn get(&self, address: &str) -> Option<Arc<dyn Communicator>> {
        self.comms.lock().get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.comms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every registered communicator
    pub async fn cleanup(&self) -> usize {
        let comms: Vec<_> = self.comms.lock().drain().map(|(_, c)| c).collect();
        let n = comms.len();
        join_all(comms.iter().map(|c| c.close(false))).await;
        if n > 0 {
            info!(closed = n, "registry cleaned up");
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Comm;
    use crate::message::Direction;
    use crate::transport::BufferBackend;

    #[tokio::test]
    async fn cleanup_closes_everything() {
        let backend = BufferBackend::new();
        let registry = CommRegistry::new();
        let mut comms = Vec::new();
        for name in ["a", "b"] {
            let comm: Arc<dyn Communicator> = Arc::new(
                Comm::builder(name, Direction::Recv)
                    .backend(backend.clone())
                    .build()
                    .await
                    .unwrap(),
            );
            registry.register(comm.clone());
            comms.push(comm);
        }
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&comms[0].address()).is_some());

        assert!(registry.unregister(&comms[1].address()).is_some());
        assert_eq!(registry.cleanup().await, 1);
        assert!(registry.is_empty());
        assert!(comms[0].is_closed());
        assert!(comms[1].is_open());
    }
}
