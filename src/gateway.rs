//! The gateway: accepts clients on the public host and routes their
//! traffic into per-client bridges.
//!
//! The accept loop owns the inbound host and the session map; both stay on
//! this task for their whole life. A bridge gets its work through a bounded
//! command queue — enqueueing never blocks, because one slow session must
//! not be able to stall event delivery for every other client sharing the
//! inbound host.

use crate::{
    bridge::{Bridge, BridgeCommand, OUTBOUND_PEER_LIMIT},
    registry::{RemoteId, RemoteRegistry},
    transport::{ChannelId, Event, Host, HostOptions, Peer, PeerId, Transport},
};
use ahash::AHashMap;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, thread, time::Duration};
use tokio::{runtime, sync::oneshot, task::LocalSet};

/// Port clients are pointed at by default.
pub const DEFAULT_PORT: u16 = 20406;

/// How long one `service` call may block the accept loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Gateway settings. Everything has a serviceable default except the
/// remote table, which can also be filled programmatically through
/// [`Gateway::add_remote`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public address clients connect to.
    pub bind: SocketAddr,
    /// Cap on simultaneously connected clients.
    pub max_clients: usize,
    /// Depth of each session's gateway→bridge command queue. A client
    /// outpacing its bridge has the overflow dropped — never queued
    /// unboundedly, never blocking the accept loop.
    pub command_queue_depth: usize,
    /// Remotes registered at startup, in order. The first entry becomes
    /// the default every new session dials.
    pub remotes: Vec<RemoteEntry>,
}

/// One remote in the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub id: RemoteId,
    pub address: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_clients: 1024,
            command_queue_depth: 64,
            remotes: Vec::new(),
        }
    }
}

/// The accept loop and its session bookkeeping.
pub struct Gateway<T: Transport> {
    transport: T,
    config: Config,
    registry: RemoteRegistry,
}

struct ClientSession<T: Transport> {
    commands: flume::Sender<BridgeCommand<T::Packet>>,
    close_signal: oneshot::Sender<()>,
    /// Held for bookkeeping; released detached when the session ends,
    /// after the map entry is already gone.
    bridge_task: thread::JoinHandle<()>,
    dropped_packets: u64,
}

impl<T: Transport> Gateway<T> {
    pub fn new(transport: T, config: Config) -> Self {
        let mut registry = RemoteRegistry::new();
        for entry in &config.remotes {
            registry.add_remote(entry.id, entry.address);
        }
        Self {
            transport,
            config,
            registry,
        }
    }

    /// Registers a remote in addition to those from the configuration.
    /// The first remote registered overall becomes the default.
    pub fn add_remote(&mut self, id: RemoteId, addr: SocketAddr) {
        self.registry.add_remote(id, addr);
    }

    /// Runs the accept loop forever.
    ///
    /// Errors only for process-scope failures (no remotes configured, the
    /// public host can't be created). Anything going wrong inside one
    /// session is logged and contained to that session.
    pub async fn run(self) -> anyhow::Result<()> {
        let Gateway {
            transport,
            config,
            registry,
        } = self;
        anyhow::ensure!(!registry.is_empty(), "no remotes configured");
        let mut inbound = transport
            .create_host(HostOptions::bind(config.bind, config.max_clients))
            .context("creating public host")?;
        let registry = Arc::new(registry);
        let mut sessions: AHashMap<PeerId, ClientSession<T>> = AHashMap::new();
        tracing::info!("Gateway listening on {}", config.bind);

        loop {
            let event = match inbound.service(POLL_INTERVAL).await {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Service error on public host: {e}");
                    continue;
                }
            };
            match event {
                Event::None => {}
                Event::Connect { peer } => {
                    accept_client(&transport, &config, &mut sessions, &registry, peer);
                }
                Event::Receive {
                    peer,
                    channel,
                    packet,
                } => {
                    dispatch_client_packet(&mut sessions, peer.id(), packet, channel);
                }
                Event::Disconnect { peer } | Event::DisconnectTimeout { peer } => {
                    close_session(&mut sessions, peer.id());
                }
            }
        }
    }
}

fn accept_client<T: Transport>(
    transport: &T,
    config: &Config,
    sessions: &mut AHashMap<PeerId, ClientSession<T>>,
    registry: &Arc<RemoteRegistry>,
    peer: T::Peer,
) {
    let key = peer.id();
    tracing::info!("Client {key} connected");
    let (command_tx, command_rx) = flume::bounded(config.command_queue_depth);
    let (close_tx, close_rx) = oneshot::channel();
    let transport = transport.clone();
    let registry = Arc::clone(registry);
    let runtime = runtime::Handle::current();

    // One thread per session, so every bridge services its own outbound
    // host from a single execution context.
    let bridge_task = thread::spawn(move || {
        let local_set = LocalSet::new();
        local_set.spawn_local(async move {
            let outbound =
                match transport.create_host(HostOptions::client_only(OUTBOUND_PEER_LIMIT)) {
                    Ok(host) => host,
                    Err(e) => {
                        tracing::warn!("Couldn't create outbound host for client {key}: {e}");
                        peer.disconnect(0);
                        return;
                    }
                };
            Bridge::<T>::new(outbound, peer, command_rx, close_rx, registry)
                .run()
                .await;
        });
        runtime.block_on(local_set);
    });

    sessions.insert(
        key,
        ClientSession {
            commands: command_tx,
            close_signal: close_tx,
            bridge_task,
            dropped_packets: 0,
        },
    );
}

fn dispatch_client_packet<T: Transport>(
    sessions: &mut AHashMap<PeerId, ClientSession<T>>,
    key: PeerId,
    packet: T::Packet,
    channel: ChannelId,
) {
    let Some(session) = sessions.get_mut(&key) else {
        // Stale peer: the session is already gone. Destroy the packet.
        drop(packet);
        return;
    };
    match session
        .commands
        .try_send(BridgeCommand::ClientPacket { packet, channel })
    {
        Ok(()) => {}
        Err(flume::TrySendError::Full(command)) => {
            drop(command);
            session.dropped_packets += 1;
            tracing::warn!(
                "Client {key} outpaced its bridge, dropping packet ({} dropped so far)",
                session.dropped_packets
            );
        }
        Err(flume::TrySendError::Disconnected(command)) => {
            // The bridge already exited; the disconnect event will reap
            // this session shortly.
            drop(command);
        }
    }
}

fn close_session<T: Transport>(sessions: &mut AHashMap<PeerId, ClientSession<T>>, key: PeerId) {
    let Some(session) = sessions.remove(&key) else {
        return;
    };
    tracing::info!("Client {key} disconnected");
    session.commands.try_send(BridgeCommand::ClientClosed).ok();
    session.close_signal.send(()).ok();
    // The map entry is gone before the task handle is released; the bridge
    // finishes teardown on its own thread.
    drop(session.bridge_task);
}
