//! Control plane for the RainStream SFU media worker.
//!
//! The media worker itself (RTP, DTLS, SRTP, SCTP) runs as a subprocess or as a caller
//! supplied in-library function; this crate speaks its length-prefixed control protocol and
//! exposes the worker-side objects as async proxies: [`worker::Worker`], [`router::Router`],
//! transports, producers and consumers.

mod macros;

pub mod data_structures;
mod messages;
pub mod ortc;
pub mod prelude;
pub mod router;
pub mod rtp_parameters;
pub mod sctp_parameters;
pub mod worker;
pub mod worker_manager;
