//! Blastoff: a reliable-UDP reverse proxy for realtime game backends.
//!
//! Clients connect to a single public endpoint; behind it sits a fleet of
//! authoritative backend servers ("remotes"). For every accepted client the
//! gateway runs a dedicated bridge that owns an outbound connection to one
//! remote and relays packets in both directions, channel ids intact.
//!
//! # Session lifecycle
//! A freshly connected client sends exactly one packet before anything
//! else: an opaque admission token. The gateway never parses it — it dials
//! the default remote and presents the token verbatim on a reserved admin
//! channel as the first reliable message of the new link. The remote either
//! validates the client (admin command `ValidateClient`), after which
//! payload relay begins, or never does, in which case the session dies with
//! the link. Payload observed in either direction before validation is a
//! protocol violation and ends the session.
//!
//! A remote can also answer with `RedirectClient`, naming another remote by
//! id. The bridge drops its current link, dials the redirect target, and
//! presents the retained token again; the client-facing connection stays up
//! throughout, so the client never notices the handoff. Remotes are looked
//! up in a registry fixed at startup — the first remote registered is the
//! default that every new session dials.
//!
//! # Transport
//! The reliable-UDP transport is consumed through the traits in
//! [`transport`]: single-owner hosts serviced by exactly one task, and
//! packets modeled as linear values whose drop is the destroy. An
//! in-process implementation ([`transport::memory`]) backs the test suite.

pub mod bridge;
pub mod control;
pub mod gateway;
pub mod registry;
pub mod transport;

pub use control::{ServerCommand, ADMIN_CHANNEL_ID};
pub use gateway::{Config, Gateway, RemoteEntry, DEFAULT_PORT};
pub use registry::{RemoteId, RemoteRegistry};
