//! Datagram transport for IKE messages
//!
//! Sending goes through the [`Transport`] trait so the engine can run over
//! real sockets or an in-memory channel. Receiving is push-based: a listener
//! hands every datagram to [`Daemon::dispatch`](super::daemon::Daemon::dispatch).

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::daemon::Daemon;
use super::nat::{add_non_esp_marker, strip_non_esp_marker};
use super::{Error, Result};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65535;

/// Outbound side of the IKE transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one IKE message
    ///
    /// `from` selects the local endpoint; a port of 4500 means the message
    /// goes out NAT-T encapsulated.
    async fn send(&self, to: SocketAddr, from: SocketAddr, packet: &[u8]) -> Result<()>;

    /// Local address used to reach `remote`
    fn local_addr(&self, remote: SocketAddr) -> SocketAddr;
}

/// UDP transport on the IKE port and, optionally, the NAT-T port
#[derive(Debug)]
pub struct UdpTransport {
    ike: UdpSocket,
    natt: Option<UdpSocket>,
}

impl UdpTransport {
    /// Bind the IKE socket and, if given, the NAT-T socket
    ///
    /// # Errors
    ///
    /// Returns `Io` if either address cannot be bound.
    pub async fn bind(ike: SocketAddr, natt: Option<SocketAddr>) -> Result<Self> {
        let ike = UdpSocket::bind(ike)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let natt = match natt {
            Some(addr) => Some(
                UdpSocket::bind(addr)
                    .await
                    .map_err(|e| Error::Io(e.to_string()))?,
            ),
            None => None,
        };
        Ok(UdpTransport { ike, natt })
    }

    /// Address of the IKE socket
    pub fn ike_addr(&self) -> Result<SocketAddr> {
        self.ike.local_addr().map_err(|e| Error::Io(e.to_string()))
    }

    /// Address of the NAT-T socket, if bound
    pub fn natt_addr(&self) -> Option<SocketAddr> {
        self.natt.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn uses_natt(&self, from: SocketAddr) -> bool {
        self.natt_addr().map_or(false, |addr| addr.port() == from.port())
    }

    /// Feed received datagrams to `daemon` until a socket fails
    ///
    /// # Errors
    ///
    /// Returns `Io` when receiving fails.
    pub async fn serve(self: Arc<Self>, daemon: Arc<Daemon>) -> Result<()> {
        let ike_addr = self.ike_addr()?;
        info!(ike = %ike_addr, natt = ?self.natt_addr(), "IKE transport listening");

        let mut ike_buf = vec![0u8; MAX_DATAGRAM];
        let mut natt_buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.ike.recv_from(&mut ike_buf) => {
                    let (len, from) = received.map_err(|e| Error::Io(e.to_string()))?;
                    daemon.dispatch(&ike_buf[..len], from, ike_addr);
                }
                received = recv_natt(self.natt.as_ref(), &mut natt_buf) => {
                    let (len, from, to) = received?;
                    match strip_non_esp_marker(&natt_buf[..len]) {
                        Some(message) => daemon.dispatch(message, from, to),
                        None => debug!(peer = %from, "Ignoring ESP datagram on NAT-T port"),
                    }
                }
            }
        }
    }
}

async fn recv_natt(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> Result<(usize, SocketAddr, SocketAddr)> {
    let Some(socket) = socket else {
        return std::future::pending().await;
    };
    let (len, from) = socket
        .recv_from(buf)
        .await
        .map_err(|e| Error::Io(e.to_string()))?;
    let to = socket.local_addr().map_err(|e| Error::Io(e.to_string()))?;
    Ok((len, from, to))
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, from: SocketAddr, packet: &[u8]) -> Result<()> {
        let sent = match (&self.natt, self.uses_natt(from)) {
            (Some(natt), true) => natt.send_to(&add_non_esp_marker(packet), to).await,
            _ => self.ike.send_to(packet, to).await,
        };
        if let Err(e) = sent {
            warn!(peer = %to, error = %e, "Failed to send IKE message");
            return Err(Error::Io(e.to_string()));
        }
        Ok(())
    }

    fn local_addr(&self, _remote: SocketAddr) -> SocketAddr {
        self.ike
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}

/// Datagram captured by a [`MemoryTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Destination
    pub to: SocketAddr,
    /// Source
    pub from: SocketAddr,
    /// IKE message
    pub packet: Vec<u8>,
}

/// Transport that hands sent datagrams to a channel
///
/// Used to wire daemons together in tests and simulations.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    local: SocketAddr,
    tx: mpsc::UnboundedSender<Datagram>,
}

impl MemoryTransport {
    /// Transport bound to `local`, with the receiving end of its output
    pub fn new(local: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Datagram>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemoryTransport { local, tx }, rx)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: SocketAddr, from: SocketAddr, packet: &[u8]) -> Result<()> {
        self.tx
            .send(Datagram {
                to,
                from,
                packet: packet.to_vec(),
            })
            .map_err(|_| Error::Io("transport closed".into()))
    }

    fn local_addr(&self, _remote: SocketAddr) -> SocketAddr {
        self.local
    }
}
