//! Point-to-point and LAN transport.
//!
//! Directed requests go over TCP: connect, write the whole envelope, close.
//! `BCP` announcements go out as UDP broadcasts on the discovery port. One
//! [`Transport`] serves one local network interface.

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::contact::{Contact, Network};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),
}

/// Bytes plus the address they came from.
pub type Datagram = (Vec<u8>, SocketAddr);

pub trait Transport: Send + Sync {
    /// Where peers reach us on this interface.
    fn local_contact(&self) -> Contact;

    /// Deliver `bytes` to `contact`. Best effort: `false` on any failure,
    /// never retried.
    fn send(&self, contact: &Contact, bytes: &[u8]) -> bool;

    /// Broadcast `bytes` to the LAN discovery port. `false` when the
    /// interface has no broadcast address or the send failed.
    fn broadcast_lan(&self, bytes: &[u8]) -> bool;

    /// Wait briefly for the next incoming payload. `Ok(None)` when nothing
    /// arrived, so callers can check for shutdown between calls.
    fn receive_blocking(&self) -> Result<Option<Datagram>, TransportError>;
}

/// Limits applied by [`TcpTransport`].
#[derive(Debug, Clone, Copy)]
pub struct TransportLimits {
    pub send_timeout: Duration,
    /// How long one `receive_blocking` call waits before returning `None`.
    pub idle_wait: Duration,
    pub max_payload: usize,
}

const UDP_POLL: Duration = Duration::from_millis(10);

pub struct TcpTransport {
    network: Network,
    listener: TcpListener,
    discovery: Option<UdpSocket>,
    limits: TransportLimits,
}

impl TcpTransport {
    pub fn bind(network: &Network, limits: TransportLimits) -> Result<Self, TransportError> {
        let addr = SocketAddr::new(network.address, network.port);
        let listener = TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind { addr, source })?;

        let discovery = match network.broadcast {
            Some(broadcast) => {
                let udp_addr = SocketAddr::new(broadcast, network.discovery_port);
                let socket = UdpSocket::bind(udp_addr)
                    .and_then(|s| s.set_read_timeout(Some(UDP_POLL)).map(|_| s))
                    .map_err(|source| TransportError::Bind {
                        addr: udp_addr,
                        source,
                    })?;
                Some(socket)
            }
            None => None,
        };

        info!(
            network = network.id,
            tcp = %addr,
            discovery = network.broadcast.is_some(),
            "listening"
        );
        Ok(Self {
            network: network.clone(),
            listener,
            discovery,
            limits,
        })
    }

    fn read_stream(&self, mut stream: TcpStream) -> std::io::Result<Vec<u8>> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.limits.send_timeout))?;
        let mut bytes = Vec::new();
        (&mut stream)
            .take(self.limits.max_payload as u64 + 1)
            .read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    fn try_accept(&self) -> Result<Option<Datagram>, TransportError> {
        match self.listener.accept() {
            Ok((stream, origin)) => match self.read_stream(stream) {
                Ok(bytes) if bytes.len() > self.limits.max_payload => {
                    debug!(%origin, "dropping oversized payload");
                    Ok(None)
                }
                Ok(bytes) => Ok(Some((bytes, origin))),
                Err(err) => {
                    debug!(%origin, error = %err, "failed to read connection");
                    Ok(None)
                }
            },
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(TransportError::Receive(err)),
        }
    }

    fn try_discovery(&self) -> Result<Option<Datagram>, TransportError> {
        let Some(socket) = &self.discovery else {
            std::thread::sleep(UDP_POLL);
            return Ok(None);
        };
        let mut buffer = vec![0u8; 65_535];
        match socket.recv_from(&mut buffer) {
            Ok((len, origin)) => {
                buffer.truncate(len);
                Ok(Some((buffer, origin)))
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(err) => Err(TransportError::Receive(err)),
        }
    }

    fn unspecified(&self) -> IpAddr {
        match self.network.address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl Transport for TcpTransport {
    fn local_contact(&self) -> Contact {
        self.network.contact()
    }

    fn send(&self, contact: &Contact, bytes: &[u8]) -> bool {
        let addr = contact.socket_addr();
        let result = TcpStream::connect_timeout(&addr, self.limits.send_timeout).and_then(|mut stream| {
            stream.set_write_timeout(Some(self.limits.send_timeout))?;
            stream.write_all(bytes)?;
            stream.shutdown(Shutdown::Write)
        });
        match result {
            Ok(()) => {
                trace!(to = %addr, len = bytes.len(), "sent");
                true
            }
            Err(err) => {
                warn!(to = %addr, error = %err, "send failed");
                false
            }
        }
    }

    fn broadcast_lan(&self, bytes: &[u8]) -> bool {
        let Some(broadcast) = self.network.broadcast else {
            return false;
        };
        let target = SocketAddr::new(broadcast, self.network.discovery_port);
        let result = UdpSocket::bind(SocketAddr::new(self.unspecified(), 0)).and_then(|socket| {
            socket.set_broadcast(true)?;
            socket.send_to(bytes, target)
        });
        match result {
            Ok(_) => true,
            Err(err) => {
                warn!(to = %target, error = %err, "broadcast failed");
                false
            }
        }
    }

    fn receive_blocking(&self) -> Result<Option<Datagram>, TransportError> {
        let deadline = Instant::now() + self.limits.idle_wait;
        loop {
            if let Some(datagram) = self.try_accept()? {
                return Ok(Some(datagram));
            }
            if let Some(datagram) = self.try_discovery()? {
                return Ok(Some(datagram));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TransportLimits {
        TransportLimits {
            send_timeout: Duration::from_secs(1),
            idle_wait: Duration::from_millis(100),
            max_payload: 64,
        }
    }

    fn bind_ephemeral(id: usize) -> TcpTransport {
        // Grab a free port, then bind the transport to it.
        let spare = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = spare.local_addr().unwrap().port();
        drop(spare);
        let network = Network {
            id,
            address: "127.0.0.1".parse().unwrap(),
            port,
            discovery_port: 0,
            broadcast: None,
        };
        TcpTransport::bind(&network, limits()).unwrap()
    }

    fn receive_within(transport: &TcpTransport, attempts: usize) -> Option<Datagram> {
        (0..attempts).find_map(|_| transport.receive_blocking().unwrap())
    }

    #[test]
    fn test_send_and_receive_over_tcp() {
        let receiver = bind_ephemeral(0);
        let sender = bind_ephemeral(1);
        assert!(sender.send(&receiver.local_contact(), b"{\"hello\":1}"));
        let (bytes, origin) = receive_within(&receiver, 20).unwrap();
        assert_eq!(bytes, b"{\"hello\":1}");
        assert!(origin.ip().is_loopback());
    }

    #[test]
    fn test_idle_receive_returns_none() {
        let transport = bind_ephemeral(0);
        assert!(transport.receive_blocking().unwrap().is_none());
    }

    #[test]
    fn test_oversized_payload_is_dropped() {
        let receiver = bind_ephemeral(0);
        let sender = bind_ephemeral(1);
        assert!(sender.send(&receiver.local_contact(), &[b'x'; 65]));
        assert!(receive_within(&receiver, 5).is_none());
    }

    #[test]
    fn test_send_to_closed_port_fails() {
        let sender = bind_ephemeral(0);
        let spare = TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = Contact::from(spare.local_addr().unwrap());
        drop(spare);
        assert!(!sender.send(&closed, b"nobody home"));
    }

    #[test]
    fn test_broadcast_without_address_is_noop() {
        assert!(!bind_ephemeral(0).broadcast_lan(b"BCP"));
    }
}
