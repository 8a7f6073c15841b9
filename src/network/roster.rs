// src/network/roster.rs

use crate::network::connection::{Connection, ConnectionId, ConnectionInfo};
use std::collections::HashMap;

/// Live connections owned by the listener loop, keyed by id.
#[derive(Default)]
pub struct Roster {
    conns: HashMap<ConnectionId, Connection>,
    next_id: u64,
}

impl Roster {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
            next_id: 1,
        }
    }

    /// Ids are never reused within one listener.
    pub fn allocate_id(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_id.max(1));
        self.next_id = id.as_u64() + 1;
        id
    }

    pub fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.id(), conn);
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.conns.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.conns.values_mut()
    }

    /// Remove every closed connection and return them.
    pub fn reap_closed(&mut self) -> Vec<Connection> {
        let closed: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|c| c.is_closed())
            .map(Connection::id)
            .collect();
        closed
            .into_iter()
            .filter_map(|id| self.conns.remove(&id))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self.conns.values().map(Connection::info).collect();
        infos.sort_by_key(|i| i.id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::ConnectionLimits;

    fn conn(roster: &mut Roster) -> Connection {
        Connection::new(
            roster.allocate_id(),
            "127.0.0.1:1".parse().unwrap(),
            ConnectionLimits {
                max_frame_bytes: 64,
                outbound_high_water_bytes: 64,
            },
        )
    }

    #[test]
    fn ids_are_unique_and_closed_connections_are_reaped() {
        let mut roster = Roster::new();
        let a = conn(&mut roster);
        let b = conn(&mut roster);
        assert_ne!(a.id(), b.id());
        let (ida, idb) = (a.id(), b.id());
        roster.insert(a);
        roster.insert(b);

        roster.get_mut(ida).unwrap().close();
        let reaped = roster.reap_closed();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id(), ida);
        assert_eq!(roster.ids(), vec![idb]);
        assert!(roster.get_mut(ida).is_none());
    }
}
