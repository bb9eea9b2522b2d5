//! Request router.
//!
//! Every incoming envelope goes through the same steps:
//!
//! ```text
//! received -> parsed -> validated -> checked -> logged (persisted types,
//! first copy only) -> handled -> actions
//! ```
//!
//! The check step covers what needs local state: key parts addressed to us
//! are opened and verified, and message authors are matched against known
//! conversations. Nothing that fails it reaches the request log, so it is
//! never served in a catch-up reply.
//!
//! Handlers never send anything themselves. They return [`Action`]s that the
//! [`Context`] turns into outbound queue items. Rejections are final and stay
//! inside the router; the only error that escapes [`Router::process`] with
//! [`RouterError::is_fatal`] set is a broken key reconstruction.
//!
//! A `WUP_REP` bundle is unwrapped by feeding each contained request back
//! through [`Router::process_request`] with relaying suppressed. The flag is
//! passed down the call, never stored, so nested bundles cannot turn it back
//! on.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::contact::Contact;
use crate::context::Context;
use crate::conversation::{conversation_id, Conversation, EncryptedMessage};
use crate::identity::Node;
use crate::kep::{KepError, Verified};
use crate::logging;
use crate::protocol::{
    now_millis, CatchUpReply, CatchUpRequest, ContactAnnouncement, ContactSet, EnvelopeError,
    MessagePropagation, NodeSet, Request, RequestData, Status, ValidationError,
};
use crate::storage::{StorageError, StoreExt};

/// How many `WUP_REP` bundles may be nested inside one another.
pub const MAX_CATCH_UP_DEPTH: usize = 4;

/// Follow-up produced by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Reply to one contact.
    Send { request: Request, to: Contact },
    /// A request we originated, for every reachable contact.
    Broadcast(Request),
    /// Flood a received request onward unchanged.
    Relay(Request),
}

/// Why a request was dropped. Terminal: nothing is retried or reported to
/// the sender.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("malformed envelope: {0}")]
    Malformed(EnvelopeError),
    #[error("unknown status {0:?}")]
    UnknownStatus(String),
    #[error("invalid request: {0}")]
    Invalid(#[from] ValidationError),
    #[error("invalid key part: {0}")]
    InvalidPart(KepError),
    #[error("not addressed to this node")]
    NotForUs,
    #[error("duplicate request")]
    Duplicate,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("key reconstruction invariant violated: {0}")]
    Invariant(KepError),
    #[error("key exchange failed: {0}")]
    Kep(KepError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

impl RouterError {
    /// Processing must stop: local state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouterError::Invariant(_))
    }
}

/// Split key exchange errors into drops and real failures.
fn classify(err: KepError) -> Result<Rejection, RouterError> {
    match err {
        KepError::HashMismatch
        | KepError::BadSignature(_)
        | KepError::PartLength { .. }
        | KepError::NotAMember(_)
        | KepError::UnverifiedAuthor(_) => Ok(Rejection::InvalidPart(err)),
        KepError::InvariantViolation { .. } => Err(RouterError::Invariant(err)),
        KepError::Storage(err) => Err(RouterError::Storage(err)),
        other => Err(RouterError::Kep(other)),
    }
}

#[derive(Debug)]
pub enum Outcome {
    Accepted {
        request_id: String,
        status: Status,
        actions: Vec<Action>,
    },
    Rejected(Rejection),
}

impl Outcome {
    pub fn actions(&self) -> &[Action] {
        match self {
            Outcome::Accepted { actions, .. } => actions,
            Outcome::Rejected(_) => &[],
        }
    }

    pub fn into_actions(self) -> Vec<Action> {
        match self {
            Outcome::Accepted { actions, .. } => actions,
            Outcome::Rejected(_) => Vec::new(),
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Rejected(rejection) => Some(rejection),
            Outcome::Accepted { .. } => None,
        }
    }
}

/// Result of one handler: follow-up actions, or a reason to drop.
type Handled = Result<Vec<Action>, Rejection>;

pub struct Router {
    ctx: Arc<Context>,
}

impl Router {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Route raw bytes from the network.
    pub fn process(&self, bytes: &[u8]) -> Result<Outcome, RouterError> {
        let limit = self.ctx.config().node.max_envelope_bytes;
        match Request::parse_bounded(bytes, limit) {
            Ok(request) => self.process_request(request, 0, false),
            Err(EnvelopeError::UnknownStatus(status)) => {
                trace!(%status, "unknown status");
                Ok(Outcome::Rejected(Rejection::UnknownStatus(status)))
            }
            Err(err) => {
                trace!(error = %err, "malformed envelope");
                Ok(Outcome::Rejected(Rejection::Malformed(err)))
            }
        }
    }

    /// Route a parsed request. `depth` counts enclosing catch-up bundles;
    /// `suppress_relay` is set for everything unwrapped from one.
    pub fn process_request(
        &self,
        request: Request,
        depth: usize,
        suppress_relay: bool,
    ) -> Result<Outcome, RouterError> {
        let status = request.status();
        let info = status.info();
        let request_id = request.id()?;
        let rid = logging::request_id(&request_id);

        if let Err(err) = request.validate(now_millis(), self.ctx.config().max_clock_skew()) {
            debug!(request = %rid, %status, error = %err, "invalid request");
            return Ok(Outcome::Rejected(err.into()));
        }

        if info.persisted && self.ctx.store().has_request(&request_id)? {
            trace!(request = %rid, %status, "duplicate");
            return Ok(Outcome::Rejected(Rejection::Duplicate));
        }

        let verified = match self.check(&request)? {
            Ok(verified) => verified,
            Err(rejection) => {
                debug!(request = %rid, %status, reason = %rejection, "rejected");
                return Ok(Outcome::Rejected(rejection));
            }
        };

        if info.persisted {
            let logged = self.ctx.store().log_request(
                &request_id,
                status.as_str(),
                request.timestamp,
                &request.to_json()?,
            )?;
            if !logged {
                trace!(request = %rid, %status, "duplicate");
                return Ok(Outcome::Rejected(Rejection::Duplicate));
            }
        }

        trace!(request = %rid, %status, depth, "dispatching");
        let mut actions = match self.handle(&request, depth, verified)? {
            Ok(actions) => actions,
            Err(Rejection::NotForUs) => Vec::new(),
            Err(rejection) => {
                debug!(request = %rid, %status, reason = %rejection, "rejected");
                return Ok(Outcome::Rejected(rejection));
            }
        };

        if info.relayed && !suppress_relay {
            actions.push(Action::Relay(request));
        }
        Ok(Outcome::Accepted {
            request_id,
            status,
            actions,
        })
    }

    /// Checks that need local state. A verified key part is handed on to the
    /// handler so it is not opened twice.
    fn check(&self, request: &Request) -> Result<Result<Option<Verified>, Rejection>, RouterError> {
        match &request.data {
            RequestData::Kep(p) => match self.ctx.kep().verify(p) {
                Ok(verified) => Ok(Ok(Some(verified))),
                Err(err) => classify(err).map(Err),
            },
            RequestData::Mpp(p) => {
                let store = self.ctx.store();
                match store.get_by_id::<Conversation>(&p.conversation_id)? {
                    Some(conversation) => Ok(author_rejection(&conversation, &p.message)
                        .map_or(Ok(None), Err)),
                    None => Ok(Ok(None)),
                }
            }
            _ => Ok(Ok(None)),
        }
    }

    fn handle(
        &self,
        request: &Request,
        depth: usize,
        verified: Option<Verified>,
    ) -> Result<Handled, RouterError> {
        match &request.data {
            RequestData::Bcp(p) => self.on_contact_announcement(p),
            RequestData::Dcp(p) => self.on_discover_contacts(p),
            RequestData::Dnp(p) => self.on_discover_nodes(p),
            RequestData::Csp(p) => self.on_contact_set(p),
            RequestData::Npp(p) => self.on_node_set(p),
            RequestData::Kep(_) => self.on_key_exchange(verified),
            RequestData::Mpp(p) => self.on_message(p),
            RequestData::WupIni(p) => self.on_catch_up_request(p),
            RequestData::WupRep(p) => self.on_catch_up_reply(p, depth),
        }
    }

    fn record_contact(&self, contact: &Contact) -> Result<(), RouterError> {
        if self.ctx.contacts().record(contact)? {
            debug!(contact = %contact, "new contact");
        }
        Ok(())
    }

    fn on_contact_announcement(&self, p: &ContactAnnouncement) -> Result<Handled, RouterError> {
        self.record_contact(&p.author)?;
        Ok(Ok(Vec::new()))
    }

    fn on_discover_contacts(&self, p: &ContactAnnouncement) -> Result<Handled, RouterError> {
        self.record_contact(&p.author)?;
        let contacts = self.ctx.contacts();
        let mut known: Vec<Contact> = contacts
            .all()?
            .into_iter()
            .filter(|c| *c != p.author)
            .collect();
        if let Some(own) = contacts
            .route(&p.author)
            .and_then(|id| contacts.network(id))
            .map(|n| n.contact())
        {
            known.push(own);
        }
        let reply = Request::new(RequestData::Csp(ContactSet { contacts: known }));
        Ok(Ok(vec![Action::Send {
            request: reply,
            to: p.author.clone(),
        }]))
    }

    fn on_discover_nodes(&self, p: &ContactAnnouncement) -> Result<Handled, RouterError> {
        self.record_contact(&p.author)?;
        let nodes = self.ctx.store().get_all::<Node>()?;
        let reply = Request::new(RequestData::Npp(NodeSet { nodes }));
        Ok(Ok(vec![Action::Send {
            request: reply,
            to: p.author.clone(),
        }]))
    }

    fn on_contact_set(&self, p: &ContactSet) -> Result<Handled, RouterError> {
        for contact in &p.contacts {
            self.record_contact(contact)?;
        }
        Ok(Ok(Vec::new()))
    }

    /// New nodes get stored, and a pairwise conversation with each of them
    /// is started.
    fn on_node_set(&self, p: &NodeSet) -> Result<Handled, RouterError> {
        let store = self.ctx.store();
        let own = self.ctx.identity().node();
        let mut actions = Vec::new();
        for node in &p.nodes {
            if node.id == own.id {
                continue;
            }
            if !store.is_known::<Node>(&node.id)? {
                store.store(node)?;
                debug!(node = %logging::node_id(&node.id), name = %node.name, "new node");
            }
            // Also restarts a pairwise exchange that expired while pending.
            if store.is_known::<Conversation>(&conversation_id(&[&own.id, &node.id]))? {
                continue;
            }
            match self.ctx.kep().initiate(&[own.clone(), node.clone()]) {
                Ok((_, requests)) => actions.extend(requests.into_iter().map(Action::Broadcast)),
                Err(err) => return classify(err).map(Err),
            }
        }
        Ok(Ok(actions))
    }

    fn on_key_exchange(&self, verified: Option<Verified>) -> Result<Handled, RouterError> {
        let Some(Verified::Part(part)) = verified else {
            return Ok(Err(Rejection::NotForUs));
        };
        let progress = match self.ctx.kep().accept(part) {
            Ok(progress) => progress,
            Err(err) => return classify(err).map(Err),
        };
        Ok(Ok(progress
            .announce
            .into_iter()
            .map(Action::Broadcast)
            .collect()))
    }

    /// Messages for conversations we are not part of are relayed but not
    /// kept.
    fn on_message(&self, p: &MessagePropagation) -> Result<Handled, RouterError> {
        let store = self.ctx.store();
        let Some(conversation) = store.get_by_id::<Conversation>(&p.conversation_id)? else {
            return Ok(Err(Rejection::NotForUs));
        };
        let message = &p.message;
        if let Some(rejection) = author_rejection(&conversation, message) {
            return Ok(Err(rejection));
        }
        if !store.is_known::<EncryptedMessage>(&message.id())? {
            let mut stored = message.clone();
            stored.time_received = Some(now_millis());
            store.store(&stored)?;
            debug!(
                conversation = %logging::conversation_id(&conversation.id),
                author = %logging::node_id(&message.author),
                "stored message"
            );
        }
        Ok(Ok(Vec::new()))
    }

    /// Answer with every logged request in the window, clamped to the
    /// configured catch-up window and split to respect the envelope limit.
    fn on_catch_up_request(&self, p: &CatchUpRequest) -> Result<Handled, RouterError> {
        self.record_contact(&p.author)?;
        let window = self.ctx.config().catch_up_window().as_millis() as u64;
        let beginning = p.beginning.max(p.end.saturating_sub(window));
        let budget = self.ctx.config().node.max_envelope_bytes / 2;

        let mut bundles: Vec<Vec<Request>> = Vec::new();
        let mut current = Vec::new();
        let mut size = 0;
        for body in self.ctx.store().requests_between(beginning, p.end)? {
            let request: Request = match serde_json::from_str(&body) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable logged request");
                    continue;
                }
            };
            if !current.is_empty() && size + body.len() > budget {
                bundles.push(std::mem::take(&mut current));
                size = 0;
            }
            size += body.len();
            current.push(request);
        }
        if !current.is_empty() {
            bundles.push(current);
        }

        debug!(to = %p.author, bundles = bundles.len(), "answering catch-up");
        Ok(Ok(bundles
            .into_iter()
            .map(|requests| Action::Send {
                request: Request::new(RequestData::WupRep(CatchUpReply { requests })),
                to: p.author.clone(),
            })
            .collect()))
    }

    fn on_catch_up_reply(&self, p: &CatchUpReply, depth: usize) -> Result<Handled, RouterError> {
        if depth >= MAX_CATCH_UP_DEPTH {
            return Ok(Err(ValidationError::CatchUpTooDeep(MAX_CATCH_UP_DEPTH).into()));
        }
        let mut actions = Vec::new();
        for inner in &p.requests {
            let status = inner.status();
            if !status.info().persisted && status != Status::WupRep {
                trace!(%status, "skipping non-replayable bundled request");
                continue;
            }
            match self.process_request(inner.clone(), depth + 1, true)? {
                Outcome::Accepted { actions: more, .. } => actions.extend(more),
                Outcome::Rejected(rejection) => {
                    trace!(%status, reason = %rejection, "bundled request dropped");
                }
            }
        }
        Ok(Ok(actions))
    }
}

fn author_rejection(conversation: &Conversation, message: &EncryptedMessage) -> Option<Rejection> {
    if conversation.is_member(&message.author) {
        return None;
    }
    Some(ValidationError::AuthorNotMember(message.author.clone()).into())
}

/// Log a fatal router error. Callers raise the stop signal afterwards.
pub fn report_fatal(err: &RouterError) {
    error!(error = %err, "stopping: unrecoverable protocol state");
}
