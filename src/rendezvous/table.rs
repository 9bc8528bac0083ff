/**
 * rendezvous/table.rs
 *
 * Pairing table: waiting registrations keyed by identifier
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{oneshot, RwLock};

use crate::protocol::{DialRequest, DialResponse};

/// Delivery path to the task owning a waiting control connection
#[derive(Debug)]
pub struct ControlHandle {
    tx: oneshot::Sender<DialResponse>,
}

impl ControlHandle {
    /// Hand `response` to the owning task. Fails if that task has gone away.
    pub fn deliver(self, response: DialResponse) -> Result<(), DialResponse> {
        self.tx.send(response)
    }
}

/// A registration as seen by the rendezvous server
#[derive(Debug)]
pub struct EndpointMapping {
    pub id: String,
    pub peer_id: String,
    /// Observed remote address of the control connection
    pub public_addr: String,
    /// Self-reported, not verified
    pub private_addr: String,
    registration: u64,
    control: ControlHandle,
}

impl EndpointMapping {
    /// Build a mapping from a request and the address the transport observed.
    /// The receiver resolves once a counterpart completes the pairing.
    pub fn new(request: &DialRequest, public_addr: String) -> (Self, oneshot::Receiver<DialResponse>) {
        static NEXT_REGISTRATION: AtomicU64 = AtomicU64::new(1);

        let (tx, rx) = oneshot::channel();
        let mapping = Self {
            id: request.my_id.clone(),
            peer_id: request.peer_id.clone(),
            public_addr,
            private_addr: request.my_private_addr.clone(),
            registration: NEXT_REGISTRATION.fetch_add(1, Ordering::Relaxed),
            control: ControlHandle { tx },
        };
        (mapping, rx)
    }

    pub fn registration(&self) -> u64 {
        self.registration
    }

    /// What the counterpart is told about this endpoint
    pub fn describe(&self) -> DialResponse {
        DialResponse {
            peer_id: self.id.clone(),
            peer_public_addr: self.public_addr.clone(),
            peer_private_addr: self.private_addr.clone(),
        }
    }

    pub fn into_control(self) -> ControlHandle {
        self.control
    }
}

/// Result of registering with the table
#[derive(Debug)]
pub enum Registration {
    /// The counterpart was waiting; its entry has been evicted and ours was
    /// never stored
    Paired {
        mine: EndpointMapping,
        peer: EndpointMapping,
    },
    /// Stored; wait for a counterpart to complete the pairing
    Waiting {
        /// A previous registration for the same id that was overwritten
        displaced: Option<EndpointMapping>,
    },
}

/// Waiting registrations, at most one per identifier.
///
/// Every mutation takes the write lock; matching and eviction of a pair
/// happen inside one critical section.
#[derive(Debug, Default)]
pub struct PairingTable {
    entries: RwLock<HashMap<String, EndpointMapping>>,
}

impl PairingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match `mapping` against a waiting counterpart, or store it.
    ///
    /// A counterpart matches when its id is our `peer_id` and its `peer_id`
    /// is our id.
    pub async fn register(&self, mapping: EndpointMapping) -> Registration {
        let mut entries = self.entries.write().await;

        let complementary = entries
            .get(&mapping.peer_id)
            .is_some_and(|peer| peer.peer_id == mapping.id && peer.id != mapping.id);

        if complementary {
            if let Some(peer) = entries.remove(&mapping.peer_id) {
                // At most one live mapping per id: drop our own stale entry
                entries.remove(&mapping.id);
                return Registration::Paired {
                    mine: mapping,
                    peer,
                };
            }
        }

        let displaced = entries.insert(mapping.id.clone(), mapping);
        Registration::Waiting { displaced }
    }

    /// Evict `id` only if it still holds the given registration
    pub async fn remove_registration(&self, id: &str, registration: u64) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(id) {
            Some(entry) if entry.registration == registration => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Observed and reported addresses of a waiting registration
    pub async fn get(&self, id: &str) -> Option<DialResponse> {
        self.entries.read().await.get(id).map(EndpointMapping::describe)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
