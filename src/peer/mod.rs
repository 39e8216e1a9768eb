//! The peer wire protocol: handshake and message framing ([`codec`]),
//! the extension protocol used for magnet metadata exchange
//! ([`extension`]), the per-connection state machine ([`state`]), and the
//! peer session actor itself ([`session`]).

mod codec;
mod extension;
mod session;
mod state;

pub(crate) use session::{Command, PeerSession, PeerStats, Sender};
