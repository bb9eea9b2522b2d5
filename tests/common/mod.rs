//! In-process transport and node builders for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hush::config::Config;
use hush::contact::{Contact, Network};
use hush::context::Context;
use hush::identity::Identity;
use hush::storage::SqliteStore;
use hush::transport::{Datagram, Transport};

/// Routes payloads between loopback transports by contact.
#[derive(Default)]
pub struct LoopbackHub {
    inboxes: Mutex<HashMap<Contact, VecDeque<Datagram>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(self: &Arc<Self>, contact: Contact) -> Arc<dyn Transport> {
        self.inboxes
            .lock()
            .expect("hub lock")
            .insert(contact.clone(), VecDeque::new());
        Arc::new(LoopbackTransport {
            hub: self.clone(),
            contact,
        })
    }
}

pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    contact: Contact,
}

impl Transport for LoopbackTransport {
    fn local_contact(&self) -> Contact {
        self.contact.clone()
    }

    fn send(&self, contact: &Contact, bytes: &[u8]) -> bool {
        let mut inboxes = self.hub.inboxes.lock().expect("hub lock");
        match inboxes.get_mut(contact) {
            Some(inbox) => {
                inbox.push_back((bytes.to_vec(), self.contact.socket_addr()));
                true
            }
            None => false,
        }
    }

    fn broadcast_lan(&self, _bytes: &[u8]) -> bool {
        false
    }

    fn receive_blocking(&self) -> Result<Option<Datagram>, hush::transport::TransportError> {
        let next = self
            .hub
            .inboxes
            .lock()
            .expect("hub lock")
            .get_mut(&self.contact)
            .and_then(VecDeque::pop_front);
        if next.is_none() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(next)
    }
}

pub fn loopback_network(port: u16) -> Network {
    Network {
        id: 0,
        address: "127.0.0.1".parse().expect("address"),
        port,
        discovery_port: 0,
        broadcast: None,
    }
}

/// Config with short job intervals and fast polling.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.workers.poll_interval_ms = 5;
    config.schedule.discover_secs = 1;
    config.schedule.publish_secs = 1;
    config.schedule.reannounce_parts_secs = 1;
    config.schedule.catch_up_secs = 2;
    config
}

pub fn node(config: Config, port: u16) -> Arc<Context> {
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory store"));
    let identity = Identity::generate().expect("identity");
    Arc::new(Context::new(config, store, identity, vec![loopback_network(port)]).expect("context"))
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
