//! Data structures shared between the worker control channel and the proxy objects.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::router::consumer::ConsumerId;
use crate::router::data_consumer::DataConsumerId;
use crate::router::data_producer::DataProducerId;
use crate::router::producer::ProducerId;
use crate::router::rtp_observer::RtpObserverId;
use crate::router::transport::TransportId;
use crate::router::RouterId;

/// Opaque application data attached to routers, transports, producers and consumers.
///
/// The worker never interprets it; it travels with the object and comes back verbatim in
/// signaling payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppData(pub Value);

impl AppData {
    pub fn new(value: Value) -> Self {
        Self(value)
    }
}

impl From<Value> for AppData {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Listening IP with an optional announced IP (useful behind NAT).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportListenIp {
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportTuple {
    pub local_ip: String,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub protocol: TransportProtocol,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceRole {
    Controlled,
    Controlling,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Connected,
    Completed,
    Disconnected,
    Closed,
}

impl Default for IceState {
    fn default() -> Self {
        Self::New
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl Default for DtlsState {
    fn default() -> Self {
        Self::New
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SctpState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Direction of a trace event, from the worker point of view.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEventDirection {
    In,
    Out,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportTraceEventType {
    Probation,
    Bwe,
}

/// "trace" event payload emitted by transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportTraceEventData {
    #[serde(rename_all = "camelCase")]
    Probation {
        timestamp: u64,
        direction: TraceEventDirection,
        info: Value,
    },
    #[serde(rename_all = "camelCase")]
    Bwe {
        timestamp: u64,
        direction: TraceEventDirection,
        info: Value,
    },
}

/// Message that can travel over a DataChannel, tagged with its SCTP PPID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebRtcMessage {
    String(String),
    Binary(Bytes),
    EmptyString,
    EmptyBinary,
}

impl WebRtcMessage {
    // PPID values from RFC 8831.
    pub(crate) fn new(ppid: u32, payload: Bytes) -> Self {
        match ppid {
            51 => WebRtcMessage::String(String::from_utf8_lossy(&payload).into_owned()),
            53 => WebRtcMessage::Binary(payload),
            56 => WebRtcMessage::EmptyString,
            57 => WebRtcMessage::EmptyBinary,
            _ => WebRtcMessage::Binary(payload),
        }
    }

    pub(crate) fn into_ppid_and_payload(self) -> (u32, Bytes) {
        match self {
            WebRtcMessage::String(string) => (51, Bytes::from(string.into_bytes())),
            WebRtcMessage::Binary(binary) => (53, binary),
            WebRtcMessage::EmptyString => (56, Bytes::from_static(b" ")),
            WebRtcMessage::EmptyBinary => (57, Bytes::from_static(&[0u8])),
        }
    }
}

// Id paths the worker needs to address an object. The most specific id also doubles as the
// request handler id on the wire.

#[derive(Debug, Copy, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouterInternal {
    pub(crate) router_id: RouterId,
}

#[derive(Debug, Copy, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
}

#[derive(Debug, Copy, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProducerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) producer_id: ProducerId,
}

#[derive(Debug, Copy, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConsumerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) consumer_id: ConsumerId,
    pub(crate) producer_id: ProducerId,
}

#[derive(Debug, Copy, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataProducerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) data_producer_id: DataProducerId,
}

#[derive(Debug, Copy, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataConsumerInternal {
    pub(crate) router_id: RouterId,
    pub(crate) transport_id: TransportId,
    pub(crate) data_consumer_id: DataConsumerId,
    pub(crate) data_producer_id: DataProducerId,
}

#[derive(Debug, Copy, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpObserverInternal {
    pub(crate) router_id: RouterId,
    pub(crate) rtp_observer_id: RtpObserverId,
}
