//! The admin-channel sub-protocol between remotes and the gateway.
//!
//! Remotes steer a client's bridge with single-frame commands on a channel
//! reserved for control traffic: one tag byte, then the command payload.
//! In the other direction the gateway sends exactly one admin message per
//! (re)connection — the client's opaque token, raw and untagged, as the
//! first reliable message after the handshake.

use crate::registry::RemoteId;
use crate::transport::ChannelId;
use thiserror::Error;

/// Channel reserved for control frames. User payload never travels on it.
pub const ADMIN_CHANNEL_ID: ChannelId = 249;

const TAG_NEW_INSTANCE: u8 = 0;
const TAG_VALIDATE_CLIENT: u8 = 1;
const TAG_REDIRECT_CLIENT: u8 = 2;

/// A command a remote can issue to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// A new remote instance exists. Informational only.
    NewInstance(RemoteId),
    /// The remote accepted the client's token; relay may begin.
    ValidateClient,
    /// Hand the client's session over to the given remote.
    RedirectClient(RemoteId),
}

/// Why an admin frame could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("empty admin frame")]
    Empty,
    #[error("unknown admin command tag {0:#04x}")]
    UnknownTag(u8),
    #[error("admin command {tag:#04x} carried {got} payload bytes, expected {expected}")]
    PayloadLength { tag: u8, got: usize, expected: usize },
}

impl ServerCommand {
    /// Decodes one admin frame. Payload lengths are exact: a frame with
    /// missing or trailing bytes is a protocol violation.
    pub fn decode(frame: &[u8]) -> Result<Self, ControlError> {
        let (&tag, payload) = frame.split_first().ok_or(ControlError::Empty)?;
        match tag {
            TAG_NEW_INSTANCE => Ok(Self::NewInstance(decode_remote_id(tag, payload)?)),
            TAG_VALIDATE_CLIENT => {
                if !payload.is_empty() {
                    return Err(ControlError::PayloadLength {
                        tag,
                        got: payload.len(),
                        expected: 0,
                    });
                }
                Ok(Self::ValidateClient)
            }
            TAG_REDIRECT_CLIENT => Ok(Self::RedirectClient(decode_remote_id(tag, payload)?)),
            other => Err(ControlError::UnknownTag(other)),
        }
    }

    /// Encodes the frame for the remote half of the protocol. The gateway
    /// never sends tagged frames itself; remote implementations and test
    /// stubs do.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::NewInstance(id) => encode_with_remote_id(TAG_NEW_INSTANCE, id),
            Self::ValidateClient => vec![TAG_VALIDATE_CLIENT],
            Self::RedirectClient(id) => encode_with_remote_id(TAG_REDIRECT_CLIENT, id),
        }
    }
}

fn decode_remote_id(tag: u8, payload: &[u8]) -> Result<RemoteId, ControlError> {
    let bytes: [u8; 16] = payload.try_into().map_err(|_| ControlError::PayloadLength {
        tag,
        got: payload.len(),
        expected: 16,
    })?;
    Ok(RemoteId::from_bytes(bytes))
}

fn encode_with_remote_id(tag: u8, id: &RemoteId) -> Vec<u8> {
    let mut frame = Vec::with_capacity(17);
    frame.push(tag);
    frame.extend_from_slice(id.as_bytes());
    frame
}
