//! Thread layout of a running node.
//!
//! - one listener per network interface, feeding the inbound queue
//! - `workers.inbound` router workers draining the inbound queue
//! - `workers.outbound` senders draining the outbound queue
//! - one scheduler thread running the periodic jobs
//!
//! All threads share one [`StopSignal`]. [`Runtime::stop`] raises it and
//! joins every thread; a handler in flight finishes first.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::context::{Context, ContextError};
use crate::queue::{Destination, StopSignal};
use crate::router::{report_fatal, Outcome, Router, RouterError};
use crate::scheduler::{Job, Scheduler};
use crate::transport::{TcpTransport, Transport, TransportError, TransportLimits};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{transports} transports for {networks} networks")]
    NetworkMismatch { networks: usize, transports: usize },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("router error: {0}")]
    Router(#[from] RouterError),
    #[error("context error: {0}")]
    Context(#[from] ContextError),
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
    #[error("thread {0} panicked")]
    Panicked(String),
}

type Worker = JoinHandle<Result<(), RuntimeError>>;

pub struct Runtime {
    ctx: Arc<Context>,
    stop: StopSignal,
    workers: Vec<(String, Worker)>,
}

impl Runtime {
    /// Bind a [`TcpTransport`] for every configured network and start.
    pub fn bind(ctx: Arc<Context>) -> Result<Self, RuntimeError> {
        let config = ctx.config();
        let limits = TransportLimits {
            send_timeout: config.send_timeout(),
            idle_wait: config.poll_interval(),
            max_payload: config.node.max_envelope_bytes,
        };
        let transports = ctx
            .contacts()
            .networks()
            .iter()
            .map(|network| {
                TcpTransport::bind(network, limits).map(|t| Arc::new(t) as Arc<dyn Transport>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::start(ctx, transports)
    }

    /// Start all threads. `transports[i]` serves network `i`.
    pub fn start(
        ctx: Arc<Context>,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<Self, RuntimeError> {
        let networks = ctx.contacts().networks().len();
        if transports.len() != networks {
            return Err(RuntimeError::NetworkMismatch {
                networks,
                transports: transports.len(),
            });
        }

        let mut runtime = Self {
            ctx: ctx.clone(),
            stop: StopSignal::new(),
            workers: Vec::new(),
        };

        for (network, transport) in transports.iter().enumerate() {
            let transport = transport.clone();
            let ctx = ctx.clone();
            let stop = runtime.stop.clone();
            runtime.spawn(format!("listener-{network}"), move || {
                listen(network, transport.as_ref(), &ctx, &stop)
            })?;
        }
        for index in 0..ctx.config().workers.inbound {
            let ctx = ctx.clone();
            let stop = runtime.stop.clone();
            runtime.spawn(format!("inbound-{index}"), move || route_inbound(ctx, &stop))?;
        }
        for index in 0..ctx.config().workers.outbound {
            let ctx = ctx.clone();
            let transports = transports.clone();
            let stop = runtime.stop.clone();
            runtime.spawn(format!("outbound-{index}"), move || {
                send_outbound(&ctx, &transports, &stop);
                Ok(())
            })?;
        }
        {
            let mut scheduler = jobs(&ctx);
            let stop = runtime.stop.clone();
            runtime.spawn("scheduler".to_string(), move || {
                scheduler.run(&stop);
                Ok(())
            })?;
        }

        info!(
            node = %crate::logging::node_id(ctx.identity().id()),
            name = ctx.identity().name(),
            networks,
            "node started"
        );
        Ok(runtime)
    }

    fn spawn(
        &mut self,
        name: String,
        body: impl FnOnce() -> Result<(), RuntimeError> + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|source| {
                self.stop.stop();
                RuntimeError::Spawn {
                    name: name.clone(),
                    source,
                }
            })?;
        self.workers.push((name, handle));
        Ok(())
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Raise the stop signal and join every thread. Returns the first error
    /// any thread ended with.
    pub fn stop(self) -> Result<(), RuntimeError> {
        self.stop.stop();
        let mut first_error = None;
        for (name, handle) in self.workers {
            let result = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Panicked(name.clone())),
            };
            if let Err(err) = result {
                error!(thread = %name, error = %err, "thread failed");
                first_error.get_or_insert(err);
            } else {
                debug!(thread = %name, "thread joined");
            }
        }
        info!("node stopped");
        first_error.map_or(Ok(()), Err)
    }
}

fn listen(
    network: usize,
    transport: &dyn Transport,
    ctx: &Context,
    stop: &StopSignal,
) -> Result<(), RuntimeError> {
    while !stop.is_stopped() {
        match transport.receive_blocking() {
            Ok(Some((bytes, origin))) => {
                trace!(network, %origin, len = bytes.len(), "received");
                ctx.deliver(bytes, origin, network);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(network, error = %err, "receive failed");
                stop.sleep(ctx.config().poll_interval());
            }
        }
    }
    Ok(())
}

fn route_inbound(ctx: Arc<Context>, stop: &StopSignal) -> Result<(), RuntimeError> {
    let router = Router::new(ctx.clone());
    let poll = ctx.config().poll_interval();
    while !stop.is_stopped() {
        let Some(item) = ctx.inbound().pop() else {
            stop.sleep(poll);
            continue;
        };
        match router.process(&item.bytes) {
            Ok(Outcome::Accepted { actions, .. }) => {
                if let Err(err) = ctx.dispatch(actions) {
                    warn!(error = %err, "failed to queue follow-ups");
                }
            }
            Ok(Outcome::Rejected(_)) => {}
            Err(err) if err.is_fatal() => {
                report_fatal(&err);
                stop.stop();
                return Err(err.into());
            }
            Err(err) => error!(origin = %item.origin, error = %err, "failed to process request"),
        }
    }
    Ok(())
}

fn send_outbound(ctx: &Context, transports: &[Arc<dyn Transport>], stop: &StopSignal) {
    let poll = ctx.config().poll_interval();
    while !stop.is_stopped() {
        let Some(item) = ctx.outbound().pop() else {
            stop.sleep(poll);
            continue;
        };
        let Some(transport) = transports.get(item.network) else {
            warn!(network = item.network, "no transport for network");
            continue;
        };
        let bytes = match item.request.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode request");
                continue;
            }
        };
        let status = item.request.status();
        match &item.destination {
            Destination::Contact(contact) => {
                if transport.send(contact, &bytes) {
                    trace!(%status, to = %contact, "delivered");
                }
            }
            Destination::Lan => {
                if transport.broadcast_lan(&bytes) {
                    trace!(%status, network = item.network, "broadcast");
                }
            }
        }
    }
}

/// The periodic job table.
pub fn jobs(ctx: &Arc<Context>) -> Scheduler<ContextError> {
    let schedule = &ctx.config().schedule;
    let secs = std::time::Duration::from_secs;
    let mut scheduler = Scheduler::new();

    let table: [(&'static str, u64, fn(&Context) -> Result<(), ContextError>); 6] = [
        ("announce", schedule.announce_secs, Context::announce),
        ("discover", schedule.discover_secs, Context::discover),
        ("publish", schedule.publish_secs, Context::publish),
        ("reannounce_parts", schedule.reannounce_parts_secs, Context::reannounce_parts),
        ("catch_up", schedule.catch_up_secs, Context::catch_up),
        ("expire_pending", schedule.expire_pending_secs, Context::expire_pending),
    ];
    for (name, interval, run) in table {
        let ctx = ctx.clone();
        scheduler.add(Job::new(name, secs(interval.max(1)), move || run(&ctx)));
    }
    scheduler
}
