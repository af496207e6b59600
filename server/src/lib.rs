//! Signaling and room orchestration for the RainStream SFU.
//!
//! Two services share this crate: the [`cluster_server::ClusterServer`] terminates client
//! WebSocket sessions and hosts [`room::Room`]s; the [`media_server::MediaServer`] manages
//! media workers and announces itself to a signaling coordinator.

pub mod cluster_server;
pub mod media_server;
pub mod protoo;
pub mod room;
pub mod settings;
