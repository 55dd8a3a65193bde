//! The reliable-UDP transport facade.
//!
//! Blastoff does not implement reliable UDP itself; it consumes an
//! ENet-style transport through the traits in this module. A [`Host`] owns
//! one UDP socket and yields [`Event`]s when serviced, [`Peer`]s are the
//! per-connection handles belonging to a host, and [`Packet`]s are the
//! native payload buffers exchanged on numbered channels.
//!
//! Two rules shape everything built on top:
//!
//! * **Single-owner hosts.** A host must only be serviced, dialed from and
//!   flushed by the one task that owns it. The single sanctioned crossing
//!   is the gateway handing a client [`Peer`] to that client's bridge:
//!   from then on only the bridge sends on the peer, while the gateway
//!   merely observes events for it.
//! * **Linear packets.** A [`Packet`] value owns its native buffer.
//!   Sending consumes the packet (a failed send destroys it inside the
//!   transport); every other path destroys it when the value drops. No
//!   code path can leak or double-destroy a buffer.

pub mod memory;

use bitflags::bitflags;
use std::{fmt, future::Future, net::SocketAddr, time::Duration};
use thiserror::Error;

/// Channel number a packet travels on.
///
/// [`crate::control::ADMIN_CHANNEL_ID`] is reserved for control traffic.
pub type ChannelId = u8;

/// Stable identifier of a peer, usable as a map key for the peer's
/// lifetime. Network addresses repeat across sessions; peer ids do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

bitflags! {
    /// Delivery guarantees requested for a packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        /// Retransmitted until acknowledged.
        const RELIABLE = 1 << 0;
        /// Exempt from the channel's ordering.
        const UNSEQUENCED = 1 << 1;
        /// Large payloads may be fragmented without retransmission.
        const UNRELIABLE_FRAGMENT = 1 << 3;
    }
}

/// Parameters for creating a [`Host`].
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Address to listen on. `None` creates a client-only host that can
    /// dial out but never accepts.
    pub bind: Option<SocketAddr>,
    /// Maximum simultaneously connected peers.
    pub max_peers: usize,
    /// Maximum channels per connection; `0` lets the connecting side's
    /// request win.
    pub channel_limit: usize,
    /// Inbound bandwidth cap in bytes/sec; `0` is unlimited.
    pub incoming_bandwidth: u32,
    /// Outbound bandwidth cap in bytes/sec; `0` is unlimited.
    pub outgoing_bandwidth: u32,
}

impl HostOptions {
    /// Options for a listening host with no channel or bandwidth limits.
    pub fn bind(addr: SocketAddr, max_peers: usize) -> Self {
        Self {
            bind: Some(addr),
            max_peers,
            channel_limit: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
        }
    }

    /// Options for an outbound-only host.
    pub fn client_only(max_peers: usize) -> Self {
        Self {
            bind: None,
            max_peers,
            channel_limit: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
        }
    }
}

/// What one `service` call observed.
#[derive(Debug)]
pub enum Event<P, K> {
    /// Nothing happened within the timeout.
    None,
    /// A dial completed (outbound) or a new peer arrived (inbound).
    Connect { peer: P },
    /// A packet arrived from `peer` on `channel`.
    Receive {
        peer: P,
        channel: ChannelId,
        packet: K,
    },
    /// The peer disconnected.
    Disconnect { peer: P },
    /// The peer was lost to the transport's keepalive timeout.
    DisconnectTimeout { peer: P },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("couldn't bind reliable-UDP host to {0}")]
    Bind(SocketAddr),
    #[error("no reliable-UDP host is listening at {0}")]
    NoRoute(SocketAddr),
    #[error("{0} refused the connection")]
    Refused(SocketAddr),
    #[error("peer is not connected")]
    NotConnected,
}

/// Factory for transport hosts. Handles are cheap to clone; every task
/// creates and then exclusively services its own host.
pub trait Transport: Clone + Send + 'static {
    type Host: Host<Peer = Self::Peer, Packet = Self::Packet>;
    type Peer: Peer<Packet = Self::Packet>;
    type Packet: Packet;

    fn create_host(&self, options: HostOptions) -> Result<Self::Host, TransportError>;
}

/// One UDP socket plus its connection state machine.
///
/// Dropping a host tears down every peer belonging to it. Hosts need not
/// be `Send`: each lives and dies on the task that created it.
pub trait Host {
    type Peer: Peer;
    type Packet: Packet;

    /// Starts a connection handshake toward `addr`. Success only means the
    /// dial is in flight; completion is a later [`Event::Connect`].
    fn connect(
        &mut self,
        addr: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<Self::Peer, TransportError>;

    /// Waits up to `timeout` for the next transport event.
    fn service(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Event<Self::Peer, Self::Packet>, TransportError>>;

    /// Pushes queued outbound packets onto the wire immediately.
    fn flush(&mut self);
}

/// Connection handle belonging to some host.
///
/// Handles clone cheaply and may be carried across tasks, but sends must
/// follow the single-writer rule described in the module docs.
pub trait Peer: Clone + Send + 'static {
    type Packet: Packet;

    /// Stable id for this peer, suitable as a session-map key.
    fn id(&self) -> PeerId;

    /// Sends `packet` on `channel`. The transport takes ownership of the
    /// packet whether or not the send succeeds.
    fn send(&self, channel: ChannelId, packet: Self::Packet) -> Result<(), TransportError>;

    /// Sends a freshly created packet carrying a copy of `data`.
    fn send_bytes(
        &self,
        data: &[u8],
        channel: ChannelId,
        flags: PacketFlags,
    ) -> Result<(), TransportError>;

    /// Starts a graceful disconnect; `Disconnect` events follow on both
    /// hosts. `data` is an opaque word delivered with the notification.
    fn disconnect(&self, data: u32);
}

/// A native packet buffer. Dropping the value destroys the buffer.
pub trait Packet: Send + 'static {
    fn data(&self) -> &[u8];
    fn flags(&self) -> PacketFlags;
}
