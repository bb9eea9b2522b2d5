//! Network locations of peers and the rules for reaching them.
//!
//! A [`Contact`] is *where* something listens, not *who* it is: the same
//! node may be known under several contacts and a contact may be learned
//! before anything is known about the node behind it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::storage::{Object, ObjectStore, StorageError, StoreExt};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub address: IpAddr,
    pub port: u16,
}

impl Contact {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// `hash(address, port)`.
    pub fn id(&self) -> String {
        crypto::content_id_of(&[self.address.to_string().as_bytes(), &self.port.to_be_bytes()])
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Reason this contact can never be dialled, if any.
    pub fn unroutable_reason(&self) -> Option<&'static str> {
        if self.port == 0 {
            return Some("port 0");
        }
        if self.address.is_unspecified() {
            return Some("unspecified address");
        }
        if self.address.is_multicast() {
            return Some("multicast address");
        }
        if let IpAddr::V4(v4) = self.address {
            if v4.is_broadcast() {
                return Some("broadcast address");
            }
        }
        None
    }
}

impl From<SocketAddr> for Contact {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl std::fmt::Display for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl Object for Contact {
    const KIND: &'static str = "contact";

    fn object_id(&self) -> String {
        self.id()
    }
}

/// Index of a local network interface.
pub type NetworkId = usize;

/// A local interface this node listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub id: NetworkId,
    pub address: IpAddr,
    pub port: u16,
    pub discovery_port: u16,
    pub broadcast: Option<IpAddr>,
}

impl Network {
    /// Our own contact on this interface.
    pub fn contact(&self) -> Contact {
        Contact::new(self.address, self.port)
    }

    /// Whether `contact` can be dialled from this interface.
    ///
    /// Address families must match, loopback only reaches loopback, and a
    /// network never targets itself.
    pub fn reaches(&self, contact: &Contact) -> bool {
        if contact.unroutable_reason().is_some() || *contact == self.contact() {
            return false;
        }
        if self.address.is_ipv4() != contact.address.is_ipv4() {
            return false;
        }
        self.address.is_loopback() == contact.address.is_loopback()
    }
}

/// Known contacts, persisted in the object store.
pub struct ContactRegistry {
    store: Arc<dyn ObjectStore>,
    networks: Vec<Network>,
}

impl ContactRegistry {
    pub fn new(store: Arc<dyn ObjectStore>, networks: Vec<Network>) -> Self {
        Self { store, networks }
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    pub fn network(&self, id: NetworkId) -> Option<&Network> {
        self.networks.get(id)
    }

    /// Whether `contact` is one of our own listening contacts.
    pub fn is_local(&self, contact: &Contact) -> bool {
        self.networks.iter().any(|n| n.contact() == *contact)
    }

    /// Remember a contact. Returns `true` if it was not known before.
    /// Our own contacts and unroutable ones are ignored.
    pub fn record(&self, contact: &Contact) -> Result<bool, StorageError> {
        if self.is_local(contact) || contact.unroutable_reason().is_some() {
            return Ok(false);
        }
        if self.store.is_known::<Contact>(&contact.id())? {
            return Ok(false);
        }
        self.store.store(contact)?;
        Ok(true)
    }

    pub fn all(&self) -> Result<Vec<Contact>, StorageError> {
        self.store.get_all::<Contact>()
    }

    /// Known contacts reachable from `network`.
    pub fn reachable(&self, network: NetworkId) -> Result<Vec<Contact>, StorageError> {
        let Some(network) = self.network(network) else {
            return Ok(Vec::new());
        };
        Ok(self
            .all()?
            .into_iter()
            .filter(|c| network.reaches(c))
            .collect())
    }

    /// First local network that reaches `contact`.
    pub fn route(&self, contact: &Contact) -> Option<NetworkId> {
        self.networks.iter().find(|n| n.reaches(contact)).map(|n| n.id)
    }
}
