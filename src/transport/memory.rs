//! In-process implementation of the transport facade.
//!
//! Hosts registered on one [`MemoryTransport`] reach each other through
//! per-host event mailboxes: connects, packets and disconnects are
//! delivered immediately and in order, so `flush` is a no-op and every
//! channel behaves reliable-ordered regardless of flags. This is the
//! transport the test suite runs on — packet accounting is observable
//! through [`MemoryTransport::live_packets`], and [`MemoryPeer::time_out`]
//! injects the keepalive loss a real network would produce — but nothing
//! here is test-gated, so it doubles as a loopback transport for local
//! experiments.

use super::{
    ChannelId, Event, Host, HostOptions, Packet, PacketFlags, Peer, PeerId, Transport,
    TransportError,
};
use ahash::AHashMap;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

type MemoryEvent = Event<MemoryPeer, MemoryPacket>;

/// Handle to an in-process network. Clones share the same network.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    network: Arc<Mutex<Network>>,
    live_packets: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of packets created but not yet destroyed, network-wide.
    /// Settles back to zero once every host and queue is torn down.
    pub fn live_packets(&self) -> usize {
        self.live_packets.load(Ordering::SeqCst)
    }

    fn network(&self) -> MutexGuard<'_, Network> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryTransport {
    type Host = MemoryHost;
    type Peer = MemoryPeer;
    type Packet = MemoryPacket;

    fn create_host(&self, options: HostOptions) -> Result<MemoryHost, TransportError> {
        let (mailbox, events) = flume::unbounded();
        let mut network = self.network();
        if let Some(addr) = options.bind {
            if network.bound.contains_key(&addr) {
                return Err(TransportError::Bind(addr));
            }
        }
        let id = HostId(network.next_host_id);
        network.next_host_id += 1;
        network.hosts.insert(
            id,
            HostEntry {
                mailbox,
                peers: Vec::new(),
                max_peers: options.max_peers,
            },
        );
        if let Some(addr) = options.bind {
            network.bound.insert(addr, id);
        }
        Ok(MemoryHost {
            transport: self.clone(),
            id,
            bind: options.bind,
            events,
        })
    }
}

#[derive(Default)]
struct Network {
    hosts: AHashMap<HostId, HostEntry>,
    bound: AHashMap<SocketAddr, HostId>,
    next_host_id: u64,
    next_peer_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HostId(u64);

struct HostEntry {
    mailbox: flume::Sender<MemoryEvent>,
    /// This host's end of every link it participates in; drained on
    /// teardown to notify the other sides.
    peers: Vec<MemoryPeer>,
    max_peers: usize,
}

/// An in-process host. Service it from its owning task only.
pub struct MemoryHost {
    transport: MemoryTransport,
    id: HostId,
    bind: Option<SocketAddr>,
    events: flume::Receiver<MemoryEvent>,
}

impl Host for MemoryHost {
    type Peer = MemoryPeer;
    type Packet = MemoryPacket;

    fn connect(
        &mut self,
        addr: SocketAddr,
        _channel_count: usize,
        _data: u32,
    ) -> Result<MemoryPeer, TransportError> {
        let mut network = self.transport.network();
        let network = &mut *network;
        let &target = network
            .bound
            .get(&addr)
            .ok_or(TransportError::NoRoute(addr))?;
        let target_entry = network
            .hosts
            .get(&target)
            .ok_or(TransportError::NoRoute(addr))?;
        if target_entry.peers.len() >= target_entry.max_peers {
            return Err(TransportError::Refused(addr));
        }
        let remote_mailbox = target_entry.mailbox.clone();
        let local_entry = network
            .hosts
            .get(&self.id)
            .ok_or(TransportError::NoRoute(addr))?;

        let link = Arc::new(Link {
            connected: AtomicBool::new(true),
            ends: [
                End {
                    id: PeerId(network.next_peer_id),
                    mailbox: local_entry.mailbox.clone(),
                },
                End {
                    id: PeerId(network.next_peer_id + 1),
                    mailbox: remote_mailbox,
                },
            ],
            live_packets: Arc::clone(&self.transport.live_packets),
        });
        network.next_peer_id += 2;

        let local = MemoryPeer {
            link: Arc::clone(&link),
            end: 0,
        };
        let remote = MemoryPeer { link, end: 1 };

        // Both sides observe the handshake completing as a Connect event.
        let _ = local.local_end().mailbox.send(Event::Connect {
            peer: local.clone(),
        });
        let _ = remote.local_end().mailbox.send(Event::Connect {
            peer: remote.clone(),
        });

        if let Some(entry) = network.hosts.get_mut(&self.id) {
            entry.peers.push(local.clone());
        }
        if let Some(entry) = network.hosts.get_mut(&target) {
            entry.peers.push(remote);
        }
        Ok(local)
    }

    async fn service(&mut self, timeout: Duration) -> Result<MemoryEvent, TransportError> {
        match tokio::time::timeout(timeout, self.events.recv_async()).await {
            Ok(Ok(event)) => Ok(event),
            // Timed out, or the network entry vanished under us.
            _ => Ok(Event::None),
        }
    }

    fn flush(&mut self) {
        // Delivery is immediate; nothing is ever queued on the wire side.
    }
}

impl Drop for MemoryHost {
    fn drop(&mut self) {
        let peers = {
            let mut network = self.transport.network();
            if let Some(addr) = self.bind {
                network.bound.remove(&addr);
            }
            network
                .hosts
                .remove(&self.id)
                .map(|entry| entry.peers)
                .unwrap_or_default()
        };
        for peer in peers {
            peer.disconnect(0);
        }
        // Anything still queued for this host — packets included — is
        // destroyed with it.
        for event in self.events.try_iter() {
            drop(event);
        }
    }
}

struct Link {
    connected: AtomicBool,
    ends: [End; 2],
    live_packets: Arc<AtomicUsize>,
}

struct End {
    id: PeerId,
    mailbox: flume::Sender<MemoryEvent>,
}

/// Handle to one end of an in-process link.
#[derive(Clone)]
pub struct MemoryPeer {
    link: Arc<Link>,
    end: usize,
}

impl MemoryPeer {
    fn local_end(&self) -> &End {
        &self.link.ends[self.end]
    }

    fn remote_end(&self) -> &End {
        &self.link.ends[1 - self.end]
    }

    fn counterpart(&self) -> MemoryPeer {
        MemoryPeer {
            link: Arc::clone(&self.link),
            end: 1 - self.end,
        }
    }

    /// Severs the link as if the transport's keepalive expired: both hosts
    /// observe `DisconnectTimeout`.
    pub fn time_out(&self) {
        if self.link.connected.swap(false, Ordering::SeqCst) {
            let _ = self.remote_end().mailbox.send(Event::DisconnectTimeout {
                peer: self.counterpart(),
            });
            let _ = self.local_end().mailbox.send(Event::DisconnectTimeout {
                peer: self.clone(),
            });
        }
    }
}

impl Peer for MemoryPeer {
    type Packet = MemoryPacket;

    fn id(&self) -> PeerId {
        self.local_end().id
    }

    fn send(&self, channel: ChannelId, packet: MemoryPacket) -> Result<(), TransportError> {
        if !self.link.connected.load(Ordering::SeqCst) {
            // The packet drops here, which destroys it.
            return Err(TransportError::NotConnected);
        }
        self.remote_end()
            .mailbox
            .send(Event::Receive {
                peer: self.counterpart(),
                channel,
                packet,
            })
            .map_err(|_| TransportError::NotConnected)
    }

    fn send_bytes(
        &self,
        data: &[u8],
        channel: ChannelId,
        flags: PacketFlags,
    ) -> Result<(), TransportError> {
        let packet = MemoryPacket::new(data, flags, Arc::clone(&self.link.live_packets));
        self.send(channel, packet)
    }

    fn disconnect(&self, _data: u32) {
        if self.link.connected.swap(false, Ordering::SeqCst) {
            let _ = self.remote_end().mailbox.send(Event::Disconnect {
                peer: self.counterpart(),
            });
            let _ = self.local_end().mailbox.send(Event::Disconnect { peer: self.clone() });
        }
    }
}

impl fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("id", &self.id())
            .field("connected", &self.link.connected.load(Ordering::SeqCst))
            .finish()
    }
}

/// A payload buffer on the in-process network. Dropping the value destroys
/// it, decrementing the transport's live-packet gauge.
pub struct MemoryPacket {
    data: Box<[u8]>,
    flags: PacketFlags,
    live: Arc<AtomicUsize>,
}

impl MemoryPacket {
    fn new(data: &[u8], flags: PacketFlags, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            data: data.into(),
            flags,
            live,
        }
    }
}

impl Packet for MemoryPacket {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn flags(&self) -> PacketFlags {
        self.flags
    }
}

impl Drop for MemoryPacket {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemoryPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPacket")
            .field("len", &self.data.len())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn next_event(host: &mut MemoryHost) -> MemoryEvent {
        for _ in 0..100 {
            match host.service(Duration::from_millis(10)).await.unwrap() {
                Event::None => {}
                event => return event,
            }
        }
        panic!("no event arrived");
    }

    #[tokio::test]
    async fn connect_notifies_both_sides() {
        let transport = MemoryTransport::new();
        let mut server = transport
            .create_host(HostOptions::bind(addr(40001), 4))
            .unwrap();
        let mut client = transport.create_host(HostOptions::client_only(1)).unwrap();

        let dialed = client.connect(addr(40001), 8, 0).unwrap();
        let Event::Connect { peer } = next_event(&mut client).await else {
            panic!("client missed its connect event");
        };
        assert_eq!(peer.id(), dialed.id());
        let Event::Connect { peer: accepted } = next_event(&mut server).await else {
            panic!("server missed the connect event");
        };
        assert_ne!(accepted.id(), dialed.id());
    }

    #[tokio::test]
    async fn packets_round_trip_preserving_channel_and_flags() {
        let transport = MemoryTransport::new();
        let mut server = transport
            .create_host(HostOptions::bind(addr(40002), 4))
            .unwrap();
        let mut client = transport.create_host(HostOptions::client_only(1)).unwrap();
        let dialed = client.connect(addr(40002), 8, 0).unwrap();
        let _ = next_event(&mut client).await;
        let _ = next_event(&mut server).await;

        dialed
            .send_bytes(b"hello", 7, PacketFlags::RELIABLE | PacketFlags::UNSEQUENCED)
            .unwrap();
        let Event::Receive {
            channel, packet, ..
        } = next_event(&mut server).await
        else {
            panic!("server missed the packet");
        };
        assert_eq!(channel, 7);
        assert_eq!(packet.data(), b"hello");
        assert!(packet.flags().contains(PacketFlags::UNSEQUENCED));
    }

    #[tokio::test]
    async fn disconnect_notifies_both_sides_and_fails_later_sends() {
        let transport = MemoryTransport::new();
        let mut server = transport
            .create_host(HostOptions::bind(addr(40003), 4))
            .unwrap();
        let mut client = transport.create_host(HostOptions::client_only(1)).unwrap();
        let dialed = client.connect(addr(40003), 8, 0).unwrap();
        let _ = next_event(&mut client).await;
        let _ = next_event(&mut server).await;

        dialed.disconnect(0);
        assert!(matches!(
            next_event(&mut client).await,
            Event::Disconnect { .. }
        ));
        assert!(matches!(
            next_event(&mut server).await,
            Event::Disconnect { .. }
        ));
        assert!(matches!(
            dialed.send_bytes(b"late", 0, PacketFlags::RELIABLE),
            Err(TransportError::NotConnected)
        ));
        assert_eq!(transport.live_packets(), 0);
    }

    #[tokio::test]
    async fn dropping_a_host_tears_down_its_links() {
        let transport = MemoryTransport::new();
        let mut server = transport
            .create_host(HostOptions::bind(addr(40004), 4))
            .unwrap();
        let mut client = transport.create_host(HostOptions::client_only(1)).unwrap();
        client.connect(addr(40004), 8, 0).unwrap();
        let _ = next_event(&mut client).await;
        let _ = next_event(&mut server).await;

        drop(client);
        assert!(matches!(
            next_event(&mut server).await,
            Event::Disconnect { .. }
        ));
    }

    #[tokio::test]
    async fn bind_conflicts_and_unknown_routes_error() {
        let transport = MemoryTransport::new();
        let _server = transport
            .create_host(HostOptions::bind(addr(40005), 4))
            .unwrap();
        assert!(matches!(
            transport.create_host(HostOptions::bind(addr(40005), 4)),
            Err(TransportError::Bind(_))
        ));

        let mut client = transport.create_host(HostOptions::client_only(1)).unwrap();
        assert!(matches!(
            client.connect(addr(40999), 8, 0),
            Err(TransportError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn undelivered_packets_are_destroyed_with_the_host() {
        let transport = MemoryTransport::new();
        let mut server = transport
            .create_host(HostOptions::bind(addr(40006), 4))
            .unwrap();
        let mut client = transport.create_host(HostOptions::client_only(1)).unwrap();
        let dialed = client.connect(addr(40006), 8, 0).unwrap();
        let _ = next_event(&mut client).await;
        let _ = next_event(&mut server).await;

        dialed.send_bytes(b"one", 0, PacketFlags::RELIABLE).unwrap();
        dialed.send_bytes(b"two", 0, PacketFlags::RELIABLE).unwrap();
        assert_eq!(transport.live_packets(), 2);

        // Never serviced; the mailbox dies with the host.
        drop(server);
        assert_eq!(transport.live_packets(), 0);
    }
}
