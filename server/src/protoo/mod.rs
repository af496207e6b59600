//! The `protoo` signaling sub-protocol: JSON envelopes over WebSocket text frames, one
//! envelope per frame.

mod message;
mod peer;
mod request;

pub use message::{Message, MessageError};
pub use peer::{ConnectionId, Peer, PeerData, PeerError, REQUEST_TIMEOUT};
pub use request::Request;
