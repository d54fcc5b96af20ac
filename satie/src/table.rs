//! Live-connection table keyed by connection id.
//!
//! Written only by the reactor thread. A registered id is always present
//! here; removal is the first step of teardown and is idempotent.

use std::collections::HashMap;
use std::sync::Arc;

use libc::c_int;

use crate::conn::{ConnHandle, Connection};

#[derive(Default)]
pub struct ConnectionTable {
    map: HashMap<c_int, Arc<ConnHandle>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, conn: Connection) -> Arc<ConnHandle> {
        let handle = Arc::new(ConnHandle::new(conn));
        self.map.insert(handle.id, Arc::clone(&handle));
        handle
    }

    pub fn get(&self, id: c_int) -> Option<&Arc<ConnHandle>> {
        self.map.get(&id)
    }

    pub fn contains(&self, id: c_int) -> bool {
        self.map.contains_key(&id)
    }

    /// Detach `id`. Buffers and any mapped response region are released
    /// when the last handle clone drops. Removing an absent id is a no-op.
    pub fn remove(&mut self, id: c_int) -> Option<Arc<ConnHandle>> {
        self.map.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn ids(&self) -> Vec<c_int> {
        self.map.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn conn(fd: c_int) -> Connection {
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12345);
        Connection::new(fd, peer, 1024)
    }

    #[test]
    fn insert_get_remove() {
        let mut table = ConnectionTable::new();
        table.insert(conn(5));
        assert!(table.contains(5));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(5).unwrap().id, 5);

        assert!(table.remove(5).is_some());
        assert!(table.get(5).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut table = ConnectionTable::new();
        table.insert(conn(7));
        assert!(table.remove(7).is_some());
        assert!(table.remove(7).is_none());
        assert!(table.is_empty());
    }
}
