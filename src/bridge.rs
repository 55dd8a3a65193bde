//! The per-client bridge: the state machine owning the outbound half of
//! one client's session.
//!
//! Every accepted client gets its own bridge task with its own outbound
//! host. The bridge captures the client's first packet as the admission
//! token, dials the default remote, presents the token on the admin
//! channel, and — once the remote validates the client — relays packets in
//! both directions, preserving channel ids. A remote can hand the session
//! to another remote mid-flight with `RedirectClient`; the bridge re-dials
//! and re-presents the retained token while the client-facing peer stays
//! up, so the client never notices the move.
//!
//! Every transport call happens on the bridge's task. The gateway crosses
//! over only through the bounded command queue and the one-shot close
//! signal, and never sends on a client peer once its bridge owns it.

use crate::{
    control::{ServerCommand, ADMIN_CHANNEL_ID},
    registry::{RemoteId, RemoteRegistry},
    transport::{ChannelId, Event, Host, Packet, PacketFlags, Peer, PeerId, Transport},
};
use anyhow::{bail, ensure, Context};
use std::{mem, sync::Arc, time::Duration};
use tokio::sync::oneshot;

/// How long one `service` call may block the bridge loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Peer cap on a bridge's outbound host. At most two links are live at
/// once (the current remote, plus a redirect target in flight); the cap
/// just leaves a wide margin.
pub(crate) const OUTBOUND_PEER_LIMIT: usize = 100;

/// Channels requested on a session's first dial. The admin channel id has
/// to fall inside the negotiated range.
const FIRST_DIAL_CHANNELS: usize = 250;

/// Channels requested on a redirect dial; zero defers to the remote's own
/// limit.
const REDIRECT_DIAL_CHANNELS: usize = 0;

/// Work the gateway hands to a bridge.
pub enum BridgeCommand<K> {
    /// A packet the client sent; owned by the bridge until forwarded.
    ClientPacket { packet: K, channel: ChannelId },
    /// The client disconnected at the transport.
    ClientClosed,
}

/// Where a session stands on its way to relaying payload.
enum Phase<P> {
    /// Freshly accepted; the client's first packet will be the token.
    AwaitingToken,
    /// Dialed the default remote, waiting for the handshake to finish.
    Dialing { remote: P },
    /// Token presented, waiting for the remote to validate the client.
    Authenticating { remote: P },
    /// Validated; payload flows both ways.
    Established { remote: P },
    /// Re-dialing after a redirect. Events for `previous` — the remote we
    /// just left — are stale and must be discarded, not treated as fatal.
    Redirecting { remote: P, previous: PeerId },
    /// Terminal; the run loop exits and tears the session down.
    Closing,
}

impl<P> Phase<P> {
    fn name(&self) -> &'static str {
        match self {
            Phase::AwaitingToken => "awaiting token",
            Phase::Dialing { .. } => "dialing",
            Phase::Authenticating { .. } => "authenticating",
            Phase::Established { .. } => "established",
            Phase::Redirecting { .. } => "redirecting",
            Phase::Closing => "closing",
        }
    }
}

/// One client's relay toward the remote fleet.
pub struct Bridge<T: Transport> {
    client: T::Peer,
    commands: flume::Receiver<BridgeCommand<T::Packet>>,
    close_signal: oneshot::Receiver<()>,
    registry: Arc<RemoteRegistry>,
    outbound: T::Host,
    phase: Phase<T::Peer>,
    token: Vec<u8>,
}

impl<T: Transport> Bridge<T> {
    /// Builds a bridge around an already-created outbound host.
    pub fn new(
        outbound: T::Host,
        client: T::Peer,
        commands: flume::Receiver<BridgeCommand<T::Packet>>,
        close_signal: oneshot::Receiver<()>,
        registry: Arc<RemoteRegistry>,
    ) -> Self {
        Self {
            client,
            commands,
            close_signal,
            registry,
            outbound,
            phase: Phase::AwaitingToken,
            token: Vec::new(),
        }
    }

    /// Drives the session until it ends, then tears it down.
    pub async fn run(mut self) {
        let client = self.client.id();
        if let Err(e) = self.drive().await {
            tracing::warn!("Session {client} failed: {e:#}");
        }
        self.shutdown();
    }

    async fn drive(&mut self) -> anyhow::Result<()> {
        loop {
            if self.close_requested() {
                self.handle_command(BridgeCommand::ClientClosed)?;
            }
            // At most one queued command per iteration, so neither the
            // client side nor the remote side can starve the other.
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command)?,
                Err(flume::TryRecvError::Empty) => {}
                Err(flume::TryRecvError::Disconnected) => self.phase = Phase::Closing,
            }
            if matches!(self.phase, Phase::Closing) {
                return Ok(());
            }
            let event = self
                .outbound
                .service(POLL_INTERVAL)
                .await
                .context("servicing outbound host")?;
            self.handle_event(event)?;
            if matches!(self.phase, Phase::Closing) {
                return Ok(());
            }
        }
    }

    fn close_requested(&mut self) -> bool {
        match self.close_signal.try_recv() {
            Ok(()) => true,
            Err(oneshot::error::TryRecvError::Closed) => true,
            Err(oneshot::error::TryRecvError::Empty) => false,
        }
    }

    fn handle_command(&mut self, command: BridgeCommand<T::Packet>) -> anyhow::Result<()> {
        match command {
            BridgeCommand::ClientPacket { packet, channel } => {
                self.handle_client_packet(packet, channel)
            }
            BridgeCommand::ClientClosed => {
                tracing::debug!("Client {} is gone, closing session", self.client.id());
                self.phase = Phase::Closing;
                Ok(())
            }
        }
    }

    fn handle_client_packet(&mut self, packet: T::Packet, channel: ChannelId) -> anyhow::Result<()> {
        match &self.phase {
            Phase::AwaitingToken => {
                self.token = packet.data().to_vec();
                drop(packet);
                ensure!(!self.token.is_empty(), "client presented an empty token");
                let default = self
                    .registry
                    .default_remote()
                    .context("remote registry has no default")?;
                let remote = self
                    .outbound
                    .connect(default, FIRST_DIAL_CHANNELS, 0)
                    .context("dialing default remote")?;
                tracing::debug!(
                    "Client {} presented a {}-byte token, dialing {default}",
                    self.client.id(),
                    self.token.len()
                );
                self.phase = Phase::Dialing { remote };
                Ok(())
            }
            Phase::Established { remote } => {
                // Ownership moves to the transport; a failed send destroys
                // the packet there.
                if let Err(e) = remote.send(channel, packet) {
                    tracing::warn!("Couldn't forward client packet to remote: {e}");
                }
                self.outbound.flush();
                Ok(())
            }
            // The client must stay silent between token and validation;
            // anything it sends early is destroyed unforwarded.
            Phase::Dialing { .. } | Phase::Authenticating { .. } | Phase::Redirecting { .. } => {
                drop(packet);
                Ok(())
            }
            Phase::Closing => {
                drop(packet);
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, event: Event<T::Peer, T::Packet>) -> anyhow::Result<()> {
        match event {
            Event::None => Ok(()),
            Event::Connect { peer } => self.handle_remote_connected(peer),
            Event::Receive {
                peer,
                channel,
                packet,
            } => self.handle_remote_packet(peer, channel, packet),
            Event::Disconnect { peer } => self.handle_remote_gone(peer, "disconnected"),
            Event::DisconnectTimeout { peer } => self.handle_remote_gone(peer, "timed out"),
        }
    }

    fn handle_remote_connected(&mut self, peer: T::Peer) -> anyhow::Result<()> {
        match mem::replace(&mut self.phase, Phase::Closing) {
            Phase::Dialing { remote } | Phase::Redirecting { remote, .. } => {
                ensure!(
                    peer.id() == remote.id(),
                    "connect event for unexpected {}",
                    peer.id()
                );
                self.present_token(&remote)?;
                tracing::debug!("Remote link {} up, token presented", remote.id());
                self.phase = Phase::Authenticating { remote };
                Ok(())
            }
            phase => bail!("connect event while {}", phase.name()),
        }
    }

    /// The token is the first reliable admin-channel message on every
    /// freshly dialed link, before any other traffic.
    fn present_token(&mut self, remote: &T::Peer) -> anyhow::Result<()> {
        remote
            .send_bytes(&self.token, ADMIN_CHANNEL_ID, PacketFlags::RELIABLE)
            .context("presenting token to remote")?;
        self.outbound.flush();
        Ok(())
    }

    fn handle_remote_packet(
        &mut self,
        peer: T::Peer,
        channel: ChannelId,
        packet: T::Packet,
    ) -> anyhow::Result<()> {
        if self.is_previous_remote(peer.id()) {
            // Stale traffic from a remote we already left.
            drop(packet);
            return Ok(());
        }
        if channel == ADMIN_CHANNEL_ID {
            let command = ServerCommand::decode(packet.data());
            drop(packet);
            self.handle_control(command.context("remote sent a malformed admin frame")?)
        } else {
            self.relay_to_client(channel, packet)
        }
    }

    fn relay_to_client(&mut self, channel: ChannelId, packet: T::Packet) -> anyhow::Result<()> {
        match &self.phase {
            Phase::Established { .. } => {
                if let Err(e) = self.client.send(channel, packet) {
                    tracing::warn!(
                        "Couldn't forward remote packet to client {}: {e}",
                        self.client.id()
                    );
                }
                Ok(())
            }
            phase => {
                drop(packet);
                bail!(
                    "remote sent payload on channel {channel} while {}",
                    phase.name()
                )
            }
        }
    }

    fn handle_control(&mut self, command: ServerCommand) -> anyhow::Result<()> {
        match command {
            ServerCommand::NewInstance(id) => {
                tracing::info!("Remote announced new instance {id}");
                Ok(())
            }
            ServerCommand::ValidateClient => {
                match mem::replace(&mut self.phase, Phase::Closing) {
                    Phase::Authenticating { remote } => {
                        tracing::info!(
                            "Remote {} validated client {}",
                            remote.id(),
                            self.client.id()
                        );
                        self.phase = Phase::Established { remote };
                        Ok(())
                    }
                    Phase::Established { remote } => {
                        tracing::debug!("Duplicate validation from remote {}", remote.id());
                        self.phase = Phase::Established { remote };
                        Ok(())
                    }
                    phase => bail!("remote validated client while {}", phase.name()),
                }
            }
            ServerCommand::RedirectClient(id) => self.redirect(id),
        }
    }

    fn redirect(&mut self, id: RemoteId) -> anyhow::Result<()> {
        // A redirect to a remote we don't know is a protocol error, not
        // something to ignore: the remote now believes the session moved.
        let target = self
            .registry
            .lookup(id)
            .with_context(|| format!("redirect to unknown remote {id}"))?;
        match mem::replace(&mut self.phase, Phase::Closing) {
            Phase::Authenticating { remote }
            | Phase::Established { remote }
            | Phase::Redirecting { remote, .. } => {
                remote.disconnect(0);
                let previous = remote.id();
                let next = self
                    .outbound
                    .connect(target, REDIRECT_DIAL_CHANNELS, 0)
                    .with_context(|| format!("dialing redirect target {id} at {target}"))?;
                tracing::info!(
                    "Redirecting client {} from {previous} to remote {id} at {target}",
                    self.client.id()
                );
                self.phase = Phase::Redirecting {
                    remote: next,
                    previous,
                };
                Ok(())
            }
            phase => bail!("redirect received while {}", phase.name()),
        }
    }

    fn handle_remote_gone(&mut self, peer: T::Peer, what: &str) -> anyhow::Result<()> {
        if self.is_previous_remote(peer.id()) {
            // The expected echo of our own disconnect during a redirect.
            tracing::debug!("Previous remote {} {what}", peer.id());
            return Ok(());
        }
        bail!("remote {} {what}", peer.id())
    }

    fn is_previous_remote(&self, id: PeerId) -> bool {
        matches!(&self.phase, Phase::Redirecting { previous, .. } if *previous == id)
    }

    fn shutdown(self) {
        self.client.disconnect(0);
        // Destroy whatever the gateway queued after we stopped consuming.
        for command in self.commands.try_iter() {
            drop(command);
        }
        tracing::info!("Session {} closed", self.client.id());
        // Dropping the outbound host tears down the remote peer with it.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryHost, MemoryPacket, MemoryPeer, MemoryTransport};
    use crate::transport::HostOptions;
    use std::net::SocketAddr;

    const REMOTE_A: u16 = 9001;
    const REMOTE_B: u16 = 9002;
    const GATEWAY: u16 = 20406;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn next_event(host: &mut MemoryHost) -> Event<MemoryPeer, MemoryPacket> {
        for _ in 0..100 {
            match host.service(Duration::from_millis(10)).await.unwrap() {
                Event::None => {}
                event => return event,
            }
        }
        panic!("no event arrived within the deadline");
    }

    async fn expect_connect(host: &mut MemoryHost) -> MemoryPeer {
        match next_event(host).await {
            Event::Connect { peer } => peer,
            other => panic!("expected a connect event, got {other:?}"),
        }
    }

    async fn expect_receive(host: &mut MemoryHost) -> (ChannelId, MemoryPacket) {
        match next_event(host).await {
            Event::Receive {
                channel, packet, ..
            } => (channel, packet),
            other => panic!("expected a receive event, got {other:?}"),
        }
    }

    /// A bridge wired to a scripted client and two stub remotes, with the
    /// gateway's half of the plumbing driven by the test.
    struct Harness {
        transport: MemoryTransport,
        gateway_host: MemoryHost,
        client_host: MemoryHost,
        client: MemoryPeer,
        remote_a: MemoryHost,
        remote_b: MemoryHost,
        remote_b_id: RemoteId,
        bridge: Bridge<MemoryTransport>,
        commands: flume::Sender<BridgeCommand<MemoryPacket>>,
        close: oneshot::Sender<()>,
    }

    impl Harness {
        async fn new() -> Self {
            let transport = MemoryTransport::new();
            let remote_a = transport
                .create_host(HostOptions::bind(addr(REMOTE_A), 16))
                .unwrap();
            let remote_b = transport
                .create_host(HostOptions::bind(addr(REMOTE_B), 16))
                .unwrap();
            let mut registry = RemoteRegistry::new();
            let remote_b_id = RemoteId::new_v4();
            registry.add_remote(RemoteId::new_v4(), addr(REMOTE_A));
            registry.add_remote(remote_b_id, addr(REMOTE_B));

            let mut gateway_host = transport
                .create_host(HostOptions::bind(addr(GATEWAY), 16))
                .unwrap();
            let mut client_host = transport.create_host(HostOptions::client_only(1)).unwrap();
            client_host.connect(addr(GATEWAY), 8, 0).unwrap();
            let client = expect_connect(&mut client_host).await;
            let client_peer = expect_connect(&mut gateway_host).await;

            let (commands, command_rx) = flume::bounded(16);
            let (close, close_rx) = oneshot::channel();
            let outbound = transport
                .create_host(HostOptions::client_only(OUTBOUND_PEER_LIMIT))
                .unwrap();
            let bridge = Bridge::new(
                outbound,
                client_peer,
                command_rx,
                close_rx,
                Arc::new(registry),
            );
            Self {
                transport,
                gateway_host,
                client_host,
                client,
                remote_a,
                remote_b,
                remote_b_id,
                bridge,
                commands,
                close,
            }
        }

        /// Feeds the client's next packet into the bridge the way the
        /// gateway's accept loop would.
        async fn relay_client_bytes(&mut self, data: &[u8], channel: ChannelId) -> anyhow::Result<()> {
            self.client
                .send_bytes(data, channel, PacketFlags::RELIABLE)
                .unwrap();
            let (channel, packet) = expect_receive(&mut self.gateway_host).await;
            self.bridge
                .handle_command(BridgeCommand::ClientPacket { packet, channel })
        }

        /// Services the bridge's outbound host once and handles the event.
        async fn pump_bridge(&mut self) -> anyhow::Result<()> {
            for _ in 0..100 {
                let event = self.bridge.outbound.service(Duration::from_millis(10)).await?;
                if matches!(event, Event::None) {
                    continue;
                }
                return self.bridge.handle_event(event);
            }
            panic!("bridge saw no outbound event within the deadline");
        }

        /// Runs the admission flow to `Established` against remote A and
        /// returns A's peer for the session.
        async fn establish(&mut self, token: &[u8]) -> MemoryPeer {
            self.relay_client_bytes(token, 0).await.unwrap();
            assert!(matches!(self.bridge.phase, Phase::Dialing { .. }));
            let session = expect_connect(&mut self.remote_a).await;
            self.pump_bridge().await.unwrap();
            let (channel, packet) = expect_receive(&mut self.remote_a).await;
            assert_eq!(channel, ADMIN_CHANNEL_ID);
            assert_eq!(packet.data(), token);
            assert!(packet.flags().contains(PacketFlags::RELIABLE));
            drop(packet);
            session
                .send_bytes(
                    &ServerCommand::ValidateClient.encode(),
                    ADMIN_CHANNEL_ID,
                    PacketFlags::RELIABLE,
                )
                .unwrap();
            self.pump_bridge().await.unwrap();
            assert!(matches!(self.bridge.phase, Phase::Established { .. }));
            session
        }
    }

    #[tokio::test]
    async fn token_capture_dials_the_default_remote() {
        let mut h = Harness::new().await;
        h.relay_client_bytes(&[0x01, 0x02, 0x03, 0x04], 0).await.unwrap();
        assert!(matches!(h.bridge.phase, Phase::Dialing { .. }));

        expect_connect(&mut h.remote_a).await;
        h.pump_bridge().await.unwrap();
        assert!(matches!(h.bridge.phase, Phase::Authenticating { .. }));

        let (channel, packet) = expect_receive(&mut h.remote_a).await;
        assert_eq!(channel, ADMIN_CHANNEL_ID);
        assert_eq!(packet.data(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[tokio::test]
    async fn empty_token_is_fatal() {
        let mut h = Harness::new().await;
        let result = h.relay_client_bytes(b"", 0).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn client_payload_before_validation_is_destroyed() {
        let mut h = Harness::new().await;
        h.relay_client_bytes(b"tok", 0).await.unwrap();
        expect_connect(&mut h.remote_a).await;
        h.pump_bridge().await.unwrap();
        let _token = expect_receive(&mut h.remote_a).await;
        assert_eq!(h.transport.live_packets(), 0);

        h.relay_client_bytes(b"too early", 0).await.unwrap();
        assert!(matches!(h.bridge.phase, Phase::Authenticating { .. }));
        // Destroyed, not queued for later.
        assert_eq!(h.transport.live_packets(), 0);
    }

    #[tokio::test]
    async fn validation_enables_relay_in_both_directions() {
        let mut h = Harness::new().await;
        let session = h.establish(b"tok").await;

        session.send_bytes(b"pong", 3, PacketFlags::RELIABLE).unwrap();
        h.pump_bridge().await.unwrap();
        let (channel, packet) = expect_receive(&mut h.client_host).await;
        assert_eq!((channel, packet.data()), (3, b"pong".as_slice()));

        h.relay_client_bytes(b"ping", 2).await.unwrap();
        let (channel, packet) = expect_receive(&mut h.remote_a).await;
        assert_eq!((channel, packet.data()), (2, b"ping".as_slice()));
    }

    #[tokio::test]
    async fn remote_payload_before_validation_is_fatal() {
        let mut h = Harness::new().await;
        h.relay_client_bytes(b"tok", 0).await.unwrap();
        let session = expect_connect(&mut h.remote_a).await;
        h.pump_bridge().await.unwrap();

        session.send_bytes(b"sneak", 0, PacketFlags::RELIABLE).unwrap();
        assert!(h.pump_bridge().await.is_err());
        assert_eq!(h.transport.live_packets(), 1); // the unread token at remote A
    }

    #[tokio::test]
    async fn short_admin_frame_is_fatal() {
        let mut h = Harness::new().await;
        let session = h.establish(b"tok").await;

        session
            .send_bytes(&[2, 0x00, 0x00], ADMIN_CHANNEL_ID, PacketFlags::RELIABLE)
            .unwrap();
        assert!(h.pump_bridge().await.is_err());
    }

    #[tokio::test]
    async fn redirect_reconnects_and_represents_the_token() {
        let mut h = Harness::new().await;
        let session_a = h.establish(&[0x01, 0x02, 0x03, 0x04]).await;

        let redirect = ServerCommand::RedirectClient(h.remote_b_id).encode();
        session_a
            .send_bytes(&redirect, ADMIN_CHANNEL_ID, PacketFlags::RELIABLE)
            .unwrap();
        h.pump_bridge().await.unwrap();
        assert!(matches!(h.bridge.phase, Phase::Redirecting { .. }));

        // The old link's teardown is expected, not fatal.
        assert!(matches!(
            next_event(&mut h.remote_a).await,
            Event::Disconnect { .. }
        ));
        h.pump_bridge().await.unwrap();
        assert!(matches!(h.bridge.phase, Phase::Redirecting { .. }));

        // The fresh dial completes and the token is presented again.
        let session_b = expect_connect(&mut h.remote_b).await;
        h.pump_bridge().await.unwrap();
        assert!(matches!(h.bridge.phase, Phase::Authenticating { .. }));
        let (channel, packet) = expect_receive(&mut h.remote_b).await;
        assert_eq!(channel, ADMIN_CHANNEL_ID);
        assert_eq!(packet.data(), &[0x01, 0x02, 0x03, 0x04]);
        drop(packet);

        session_b
            .send_bytes(
                &ServerCommand::ValidateClient.encode(),
                ADMIN_CHANNEL_ID,
                PacketFlags::RELIABLE,
            )
            .unwrap();
        h.pump_bridge().await.unwrap();
        assert!(matches!(h.bridge.phase, Phase::Established { .. }));

        h.relay_client_bytes(b"x", 0).await.unwrap();
        let (channel, packet) = expect_receive(&mut h.remote_b).await;
        assert_eq!((channel, packet.data()), (0, b"x".as_slice()));
    }

    #[tokio::test]
    async fn redirect_to_unknown_remote_is_fatal() {
        let mut h = Harness::new().await;
        let session = h.establish(b"tok").await;

        let redirect = ServerCommand::RedirectClient(RemoteId::new_v4()).encode();
        session
            .send_bytes(&redirect, ADMIN_CHANNEL_ID, PacketFlags::RELIABLE)
            .unwrap();
        assert!(h.pump_bridge().await.is_err());

        // No dial was attempted anywhere else.
        assert!(matches!(
            h.remote_b.service(Duration::from_millis(20)).await.unwrap(),
            Event::None
        ));
    }

    #[tokio::test]
    async fn remote_timeout_is_fatal() {
        let mut h = Harness::new().await;
        let session = h.establish(b"tok").await;

        session.time_out();
        assert!(h.pump_bridge().await.is_err());
    }

    #[tokio::test]
    async fn close_command_and_signal_both_end_the_session() {
        let mut h = Harness::new().await;
        h.bridge
            .handle_command(BridgeCommand::ClientClosed)
            .unwrap();
        assert!(matches!(h.bridge.phase, Phase::Closing));

        h.close.send(()).unwrap();
        assert!(h.bridge.close_requested());
    }

    #[tokio::test]
    async fn shutdown_destroys_queued_commands_and_drops_the_client() {
        let mut h = Harness::new().await;
        let _session = h.establish(b"tok").await;

        // Two packets the bridge never got around to consuming.
        for _ in 0..2 {
            h.client.send_bytes(b"queued", 0, PacketFlags::RELIABLE).unwrap();
            let (channel, packet) = expect_receive(&mut h.gateway_host).await;
            h.commands
                .try_send(BridgeCommand::ClientPacket { packet, channel })
                .unwrap();
        }
        assert_eq!(h.transport.live_packets(), 2);

        let bridge = h.bridge;
        bridge.shutdown();
        assert_eq!(h.transport.live_packets(), 0);
        assert!(matches!(
            next_event(&mut h.client_host).await,
            Event::Disconnect { .. }
        ));
    }
}
