use std::collections::HashMap;
use std::net::SocketAddr;

use super::transport::{ServerTransport, TransportConfig};

pub type ClientId = u32;

/// Result of admitting a client into the table.
#[derive(Debug)]
pub struct Admission {
    pub client_id: ClientId,
    /// The earlier session from the same address, if any.
    pub replaced: Option<ClientConnection>,
}

#[derive(Debug)]
pub struct ClientConnection {
    pub addr: SocketAddr,
    pub client_id: ClientId,
    pub name: String,
    pub digest: String,
    pub transport: ServerTransport,
    pub last_received_tic: u64,
}

impl ClientConnection {
    pub fn new(
        addr: SocketAddr,
        client_id: ClientId,
        name: String,
        digest: String,
        config: TransportConfig,
        tic: u64,
    ) -> Self {
        Self {
            addr,
            client_id,
            name,
            digest,
            transport: ServerTransport::new(config),
            last_received_tic: tic,
        }
    }

    pub fn is_timed_out(&self, tic: u64, timeout_tics: u64) -> bool {
        tic.saturating_sub(self.last_received_tic) > timeout_tics
    }

    pub fn touch(&mut self, tic: u64) {
        self.last_received_tic = tic;
    }
}

/// Connected clients keyed by id, with a reverse index by address.
#[derive(Debug)]
pub struct ConnectionManager {
    clients_by_addr: HashMap<SocketAddr, ClientId>,
    clients: HashMap<ClientId, ClientConnection>,
    max_clients: usize,
    timeout_tics: u64,
}

impl ConnectionManager {
    pub fn new(max_clients: usize, timeout_tics: u64) -> Self {
        Self {
            clients_by_addr: HashMap::new(),
            clients: HashMap::new(),
            max_clients,
            timeout_tics,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    fn free_id(&self) -> ClientId {
        (1..)
            .find(|id| !self.clients.contains_key(id))
            .unwrap_or(ClientId::MAX)
    }

    /// Adds a client under the lowest free id. A client already connected
    /// from `addr` is evicted and handed back in the admission. Returns
    /// `None` when the table is full.
    pub fn insert(
        &mut self,
        addr: SocketAddr,
        name: String,
        digest: String,
        config: TransportConfig,
        tic: u64,
    ) -> Option<Admission> {
        if self.is_full() && !self.clients_by_addr.contains_key(&addr) {
            return None;
        }
        let replaced = self.remove_by_addr(&addr);
        if self.is_full() {
            return None;
        }

        let client_id = self.free_id();
        let connection = ClientConnection::new(addr, client_id, name, digest, config, tic);
        self.clients.insert(client_id, connection);
        self.clients_by_addr.insert(addr, client_id);
        Some(Admission {
            client_id,
            replaced,
        })
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&ClientConnection> {
        self.clients_by_addr
            .get(addr)
            .and_then(|id| self.clients.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientConnection> {
        let id = self.clients_by_addr.get(addr)?;
        self.clients.get_mut(id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&client_id)
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<ClientConnection> {
        let conn = self.clients.remove(&client_id)?;
        self.clients_by_addr.remove(&conn.addr);
        Some(conn)
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<ClientConnection> {
        let client_id = self.clients_by_addr.remove(addr)?;
        self.clients.remove(&client_id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientConnection> {
        self.clients.values_mut()
    }

    /// Ids of clients silent for longer than the timeout. They stay in
    /// the table until removed.
    pub fn timed_out(&self, tic: u64) -> Vec<ClientId> {
        let mut ids: Vec<_> = self
            .clients
            .values()
            .filter(|c| c.is_timed_out(tic, self.timeout_tics))
            .map(|c| c.client_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn add(manager: &mut ConnectionManager, port: u16, tic: u64) -> Option<ClientId> {
        manager.insert(
            addr(port),
            format!("player{}", port),
            String::new(),
            TransportConfig::default(),
            tic,
        )
        .map(|admission| admission.client_id)
    }

    #[test]
    fn test_lowest_free_id() {
        let mut manager = ConnectionManager::new(4, 100);
        assert_eq!(add(&mut manager, 1, 0), Some(1));
        assert_eq!(add(&mut manager, 2, 0), Some(2));
        assert_eq!(add(&mut manager, 3, 0), Some(3));

        manager.remove(2);
        assert_eq!(add(&mut manager, 4, 0), Some(2));
        assert_eq!(manager.get_by_addr(&addr(4)).unwrap().client_id, 2);
    }

    #[test]
    fn test_full_table() {
        let mut manager = ConnectionManager::new(1, 100);
        assert!(add(&mut manager, 1, 0).is_some());
        assert!(manager.is_full());
        assert_eq!(add(&mut manager, 2, 0), None);

        // Same address reconnecting replaces its old slot.
        assert_eq!(add(&mut manager, 1, 0), Some(1));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_reconnect_hands_back_old_session() {
        let mut manager = ConnectionManager::new(4, 100);
        add(&mut manager, 1, 0);
        add(&mut manager, 2, 0);
        manager.remove(1);
        add(&mut manager, 3, 0);

        let admission = manager
            .insert(addr(2), "again".into(), String::new(), TransportConfig::default(), 5)
            .unwrap();
        let old = admission.replaced.unwrap();
        assert_eq!(old.client_id, 2);
        assert_eq!(old.name, "player2");
        assert_eq!(admission.client_id, 2);
        assert_eq!(manager.len(), 2);

        let fresh = manager
            .insert(addr(4), "new".into(), String::new(), TransportConfig::default(), 5)
            .unwrap();
        assert!(fresh.replaced.is_none());
    }

    #[test]
    fn test_timeouts_in_tics() {
        let mut manager = ConnectionManager::new(4, 10);
        add(&mut manager, 1, 0);
        add(&mut manager, 2, 0);
        manager.get_by_addr_mut(&addr(2)).unwrap().touch(8);

        assert!(manager.timed_out(10).is_empty());
        assert_eq!(manager.timed_out(11), vec![1]);

        manager.remove_by_addr(&addr(1));
        assert!(manager.get(1).is_none());
        assert_eq!(manager.ids(), vec![2]);
    }
}
