// src/network/pending.rs

use crate::network::connection::ConnectionId;
use crate::network::message::UpdateBatch;
use crate::store::{ClassId, PolicyUpdateOp, Reference, Uri};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Shared between the event loop and producer threads; hold the lock only
/// for the duration of one table operation.
pub type SharedPending = Arc<Mutex<PendingUpdates>>;

#[derive(Debug, Default)]
struct PeerInterest {
    resolved: HashSet<Uri>,
    updates: BTreeMap<Reference, PolicyUpdateOp>,
}

/// Per-peer resolved URIs and the coalesced updates not yet flushed to them.
/// A later operation on the same (class, URI) replaces the earlier one.
#[derive(Debug, Default)]
pub struct PendingUpdates {
    peers: HashMap<ConnectionId, PeerInterest>,
}

impl PendingUpdates {
    pub fn shared() -> SharedPending {
        Arc::new(Mutex::new(PendingUpdates::default()))
    }

    pub fn register(&mut self, conn: ConnectionId) {
        self.peers.entry(conn).or_default();
    }

    /// Forget a peer; returns how many unflushed updates were discarded.
    pub fn unregister(&mut self, conn: ConnectionId) -> usize {
        self.peers
            .remove(&conn)
            .map(|p| p.updates.len())
            .unwrap_or(0)
    }

    pub fn is_registered(&self, conn: ConnectionId) -> bool {
        self.peers.contains_key(&conn)
    }

    pub fn resolve(&mut self, conn: ConnectionId, uri: Uri) {
        self.peers.entry(conn).or_default().resolved.insert(uri);
    }

    pub fn unresolve(&mut self, conn: ConnectionId, uri: &Uri) {
        if let Some(peer) = self.peers.get_mut(&conn) {
            peer.resolved.remove(uri);
        }
    }

    pub fn is_interested(&self, conn: ConnectionId, uri: &Uri) -> bool {
        self.peers
            .get(&conn)
            .map(|p| p.resolved.contains(uri))
            .unwrap_or(false)
    }

    /// Queue an update for every registered peer that resolved `uri`, except
    /// `exclude`. Returns the number of peers it was queued for.
    pub fn add(
        &mut self,
        class_id: ClassId,
        uri: &Uri,
        op: PolicyUpdateOp,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let mut queued = 0;
        for (id, peer) in self.peers.iter_mut() {
            if Some(*id) == exclude || !peer.resolved.contains(uri) {
                continue;
            }
            peer.updates.insert(Reference::new(class_id, uri.clone()), op);
            queued += 1;
        }
        queued
    }

    /// Queue an update for one registered peer regardless of its interests.
    pub fn add_for(
        &mut self,
        conn: ConnectionId,
        class_id: ClassId,
        uri: Uri,
        op: PolicyUpdateOp,
    ) -> bool {
        match self.peers.get_mut(&conn) {
            Some(peer) => {
                peer.updates.insert(Reference::new(class_id, uri), op);
                true
            }
            None => false,
        }
    }

    pub fn pending_for(&self, conn: ConnectionId) -> usize {
        self.peers.get(&conn).map(|p| p.updates.len()).unwrap_or(0)
    }

    pub fn has_pending(&self) -> bool {
        self.peers.values().any(|p| !p.updates.is_empty())
    }

    pub fn take(&mut self, conn: ConnectionId) -> Option<UpdateBatch> {
        let peer = self.peers.get_mut(&conn)?;
        if peer.updates.is_empty() {
            return None;
        }
        Some(into_batch(std::mem::take(&mut peer.updates)))
    }

    /// Drain every non-empty map, clearing it.
    pub fn take_all(&mut self) -> Vec<(ConnectionId, UpdateBatch)> {
        let mut out: Vec<(ConnectionId, UpdateBatch)> = self
            .peers
            .iter_mut()
            .filter(|(_, p)| !p.updates.is_empty())
            .map(|(id, p)| (*id, into_batch(std::mem::take(&mut p.updates))))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }
}

fn into_batch(updates: BTreeMap<Reference, PolicyUpdateOp>) -> UpdateBatch {
    let mut batch = UpdateBatch::default();
    for (reference, op) in updates {
        batch.push(reference, op);
    }
    batch
}
