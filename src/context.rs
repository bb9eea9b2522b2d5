//! Per-process node state, passed explicitly to every component.
//!
//! A [`Context`] owns the identity, the store, the contact registry, the key
//! exchange coordinator and both work queues. It also turns router
//! [`Action`]s into outbound queue items and exposes the local API used by
//! the CLI: start a conversation, send a message, read a conversation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::contact::{Contact, ContactRegistry, Network, NetworkId};
use crate::conversation::{ClearMessage, CodecError, Conversation, Draft, EncryptedMessage};
use crate::identity::{Identity, IdentityError, Node};
use crate::kep::{KepCoordinator, KepError};
use crate::logging;
use crate::protocol::{
    now_millis, CatchUpRequest, ContactAnnouncement, EnvelopeError, MessagePropagation, NodeSet,
    Request, RequestData,
};
use crate::queue::{Destination, InboundItem, OutboundItem, WorkQueue};
use crate::router::Action;
use crate::storage::{ObjectStore, SqliteStore, StorageError, StoreExt};

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("unknown conversation {0}")]
    UnknownConversation(String),
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("key exchange error: {0}")]
    Kep(#[from] KepError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// Local networks described by the configuration, in interface order.
pub fn networks_from_config(config: &Config) -> Vec<Network> {
    config
        .network
        .interfaces
        .iter()
        .enumerate()
        .map(|(id, interface)| Network {
            id,
            address: interface.address,
            port: config.network.port,
            discovery_port: config.network.discovery_port,
            broadcast: interface.broadcast,
        })
        .collect()
}

pub struct Context {
    config: Config,
    identity: Arc<Identity>,
    store: Arc<dyn ObjectStore>,
    contacts: ContactRegistry,
    kep: KepCoordinator,
    inbound: WorkQueue<InboundItem>,
    outbound: WorkQueue<OutboundItem>,
    /// Last `time_sent` we stamped; message nonces need it strictly rising.
    last_sent: Mutex<u64>,
}

impl Context {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        identity: Identity,
        networks: Vec<Network>,
    ) -> Result<Self, ContextError> {
        let identity = Arc::new(identity);
        store.store(identity.node())?;

        let contacts = ContactRegistry::new(store.clone(), networks);
        for addr in &config.network.bootstrap {
            let contact = Contact::from(*addr);
            if contacts.record(&contact)? {
                debug!(contact = %contact, "recorded bootstrap contact");
            }
        }

        let kep = KepCoordinator::new(identity.clone(), store.clone(), config.node.key_length);
        Ok(Self {
            config,
            identity,
            store,
            contacts,
            kep,
            inbound: WorkQueue::new(),
            outbound: WorkQueue::new(),
            last_sent: Mutex::new(0),
        })
    }

    /// Open the store under `config.node.data_dir`, loading or creating the
    /// local identity.
    pub fn open(config: Config) -> Result<Self, ContextError> {
        let store = Arc::new(SqliteStore::open(&config.store_path())?);
        let (identity, created) = Identity::load_or_create(store.as_ref())?;
        if created {
            info!(node = %logging::node_id(identity.id()), name = identity.name(), "created identity");
        }
        let networks = networks_from_config(&config);
        Self::new(config, store, identity, networks)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn contacts(&self) -> &ContactRegistry {
        &self.contacts
    }

    pub fn kep(&self) -> &KepCoordinator {
        &self.kep
    }

    pub fn inbound(&self) -> &WorkQueue<InboundItem> {
        &self.inbound
    }

    pub fn outbound(&self) -> &WorkQueue<OutboundItem> {
        &self.outbound
    }

    /// Queue raw bytes as if a listener had received them.
    pub fn deliver(&self, bytes: Vec<u8>, origin: SocketAddr, network: NetworkId) {
        self.inbound.push(InboundItem {
            bytes,
            origin,
            network,
        });
    }

    // -----------------------------------------------------------------------
    // Outbound fan-out
    // -----------------------------------------------------------------------

    /// Turn router actions into outbound queue items.
    pub fn dispatch(&self, actions: Vec<Action>) -> Result<(), ContextError> {
        for action in actions {
            match action {
                Action::Send { request, to } => self.send_to(request, &to),
                Action::Broadcast(request) => self.broadcast(request)?,
                Action::Relay(request) => self.fan_out(&request)?,
            }
        }
        Ok(())
    }

    /// Queue `request` for one contact, through the first network that
    /// reaches it.
    pub fn send_to(&self, request: Request, to: &Contact) {
        let Some(network) = self.contacts.route(to) else {
            debug!(to = %to, status = %request.status(), "no network reaches contact");
            return;
        };
        self.outbound.push(OutboundItem {
            network,
            request,
            destination: Destination::Contact(to.clone()),
        });
    }

    /// Send a request we originated to every reachable contact. Persisted
    /// types are logged first so that copies flooded back to us are dropped.
    pub fn broadcast(&self, request: Request) -> Result<(), ContextError> {
        if request.info().persisted {
            let id = request.id()?;
            self.store.log_request(
                &id,
                request.status().as_str(),
                request.timestamp,
                &request.to_json()?,
            )?;
        }
        self.fan_out(&request)
    }

    fn fan_out(&self, request: &Request) -> Result<(), ContextError> {
        let mut queued = 0;
        for network in self.contacts.networks() {
            for contact in self.contacts.reachable(network.id)? {
                self.outbound.push(OutboundItem {
                    network: network.id,
                    request: request.clone(),
                    destination: Destination::Contact(contact),
                });
                queued += 1;
            }
        }
        trace!(status = %request.status(), queued, "fanned out");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Periodic jobs
    // -----------------------------------------------------------------------

    /// `BCP` on every network that has a broadcast address.
    pub fn announce(&self) -> Result<(), ContextError> {
        for network in self.contacts.networks() {
            if network.broadcast.is_none() {
                continue;
            }
            let request = Request::new(RequestData::Bcp(ContactAnnouncement {
                author: network.contact(),
            }));
            self.outbound.push(OutboundItem {
                network: network.id,
                request,
                destination: Destination::Lan,
            });
        }
        Ok(())
    }

    /// Ask every reachable contact for its contacts and nodes.
    pub fn discover(&self) -> Result<(), ContextError> {
        for network in self.contacts.networks() {
            let author = network.contact();
            for contact in self.contacts.reachable(network.id)? {
                for data in [
                    RequestData::Dcp(ContactAnnouncement {
                        author: author.clone(),
                    }),
                    RequestData::Dnp(ContactAnnouncement {
                        author: author.clone(),
                    }),
                ] {
                    self.outbound.push(OutboundItem {
                        network: network.id,
                        request: Request::new(data),
                        destination: Destination::Contact(contact.clone()),
                    });
                }
            }
        }
        Ok(())
    }

    /// Broadcast our own node.
    pub fn publish(&self) -> Result<(), ContextError> {
        self.broadcast(Request::new(RequestData::Npp(NodeSet {
            nodes: vec![self.identity.node().clone()],
        })))
    }

    /// Re-send our stored `KEP` requests for recent conversations.
    pub fn reannounce_parts(&self) -> Result<(), ContextError> {
        let requests = self
            .kep
            .announcements_since(now_millis(), self.config.pending_conversation_ttl())?;
        for request in requests {
            self.broadcast(request)?;
        }
        Ok(())
    }

    /// Ask every reachable contact for what we may have missed.
    pub fn catch_up(&self) -> Result<(), ContextError> {
        let end = now_millis();
        let beginning = end.saturating_sub(self.config.catch_up_window().as_millis() as u64);
        for network in self.contacts.networks() {
            for contact in self.contacts.reachable(network.id)? {
                self.outbound.push(OutboundItem {
                    network: network.id,
                    request: Request::new(RequestData::WupIni(CatchUpRequest {
                        beginning,
                        end,
                        author: network.contact(),
                    })),
                    destination: Destination::Contact(contact),
                });
            }
        }
        Ok(())
    }

    pub fn expire_pending(&self) -> Result<(), ContextError> {
        self.kep
            .expire_pending(now_millis(), self.config.pending_conversation_ttl())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Local API
    // -----------------------------------------------------------------------

    /// Create (or find) the conversation between us and `member_ids`, and
    /// broadcast our key parts if they have not been sent yet.
    pub fn start_conversation<S: AsRef<str>>(&self, member_ids: &[S]) -> Result<String, ContextError> {
        let mut members = vec![self.identity.node().clone()];
        for id in member_ids {
            let id = id.as_ref();
            if id == self.identity.id() {
                continue;
            }
            let node = self
                .store
                .get_by_id::<Node>(id)?
                .ok_or_else(|| ContextError::UnknownNode(id.to_string()))?;
            members.push(node);
        }
        let (conversation, requests) = self.kep.initiate(&members)?;
        for request in requests {
            self.broadcast(request)?;
        }
        Ok(conversation)
    }

    /// Encrypt, store and broadcast a message from us.
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<EncryptedMessage, ContextError> {
        let conversation = self.conversation(conversation_id)?;
        let draft = Draft::new(self.identity.id(), conversation_id).with_content(content);
        let message = conversation.seal(draft, self.next_send_time())?;
        self.store.store(&message)?;
        self.broadcast(Request::new(RequestData::Mpp(MessagePropagation {
            message: message.clone(),
            conversation_id: conversation_id.to_string(),
        })))?;
        debug!(
            conversation = %logging::conversation_id(conversation_id),
            message = %message.id(),
            "sent message"
        );
        Ok(message)
    }

    /// Decrypted messages of a conversation, oldest first. Messages that fail
    /// to decrypt are skipped.
    pub fn read_conversation(&self, conversation_id: &str) -> Result<Vec<ClearMessage>, ContextError> {
        let conversation = self.conversation(conversation_id)?;
        let mut messages = self.store.children::<EncryptedMessage>(conversation_id)?;
        messages.sort_by(|a, b| (a.time_sent, a.id()).cmp(&(b.time_sent, b.id())));

        let mut clear = Vec::with_capacity(messages.len());
        for message in &messages {
            match conversation.open(message) {
                Ok(opened) => clear.push(opened),
                Err(CodecError::KeyUnavailable(id)) => {
                    return Err(CodecError::KeyUnavailable(id).into())
                }
                Err(err) => warn!(message = %message.id(), error = %err, "skipping unreadable message"),
            }
        }
        Ok(clear)
    }

    fn next_send_time(&self) -> u64 {
        let mut last = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        *last = now_millis().max(*last + 1);
        *last
    }

    pub fn conversation(&self, id: &str) -> Result<Conversation, ContextError> {
        self.store
            .get_by_id::<Conversation>(id)?
            .ok_or_else(|| ContextError::UnknownConversation(id.to_string()))
    }

    pub fn conversations(&self) -> Result<Vec<Conversation>, ContextError> {
        Ok(self.store.get_all::<Conversation>()?)
    }

    pub fn nodes(&self) -> Result<Vec<Node>, ContextError> {
        Ok(self.store.get_all::<Node>()?)
    }
}
