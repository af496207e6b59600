use crate::data_structures::{
    ConsumerInternal, DataConsumerInternal, DataProducerInternal, ProducerInternal,
    RouterInternal, RtpObserverInternal, TransportInternal, TransportListenIp,
    TransportTraceEventType,
};
use crate::router::consumer::{ConsumerLayers, ConsumerScore, ConsumerType};
use crate::router::data_producer::DataProducerType;
use crate::router::producer::{ProducerTraceEventType, ProducerType};
use crate::router::webrtc_transport::WebRtcTransportData;
use crate::rtp_parameters::{MediaKind, RtpParameters};
use crate::sctp_parameters::{NumSctpStreams, SctpStreamParameters};
use crate::worker::{WorkerDump, WorkerResourceUsage, WorkerUpdateSettings};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;

pub(crate) trait Request: Debug + Serialize {
    type Response: DeserializeOwned;

    fn as_method(&self) -> &'static str;

    /// Handler id component of the wire request; `None` for worker-scoped methods.
    fn handler_id(&self) -> Option<String>;
}

pub(crate) trait Notification: Debug + Serialize {
    fn as_event(&self) -> &'static str;

    fn handler_id(&self) -> Option<String>;
}

macro_rules! request_response {
    (
        $method: literal,
        $request_struct_name: ident { $( $field_name: ident: $field_type: ty, )* },
        $existing_response_type: ty $(,)?
    ) => {
        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $request_struct_name {
            $( pub(crate) $field_name: $field_type, )*
        }

        impl Request for $request_struct_name {
            type Response = $existing_response_type;

            fn as_method(&self) -> &'static str {
                $method
            }

            fn handler_id(&self) -> Option<String> {
                None
            }
        }
    };
    (
        $method: literal,
        $request_struct_name: ident { $( $field_name: ident: $field_type: ty, )* },
        $existing_response_type: ty,
        $( $handler_id_path: ident ).+ $(,)?
    ) => {
        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $request_struct_name {
            $( pub(crate) $field_name: $field_type, )*
        }

        impl Request for $request_struct_name {
            type Response = $existing_response_type;

            fn as_method(&self) -> &'static str {
                $method
            }

            fn handler_id(&self) -> Option<String> {
                Some(self.$( $handler_id_path ).+.to_string())
            }
        }
    };
}

macro_rules! notification {
    (
        $event: literal,
        $notification_struct_name: ident { $( $field_name: ident: $field_type: ty, )* },
        $( $handler_id_path: ident ).+ $(,)?
    ) => {
        #[derive(Debug, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub(crate) struct $notification_struct_name {
            $( pub(crate) $field_name: $field_type, )*
        }

        impl Notification for $notification_struct_name {
            fn as_event(&self) -> &'static str {
                $event
            }

            fn handler_id(&self) -> Option<String> {
                Some(self.$( $handler_id_path ).+.to_string())
            }
        }
    };
}

request_response!("worker.dump", WorkerDumpRequest {}, WorkerDump);

request_response!(
    "worker.getResourceUsage",
    WorkerGetResourceRequest {},
    WorkerResourceUsage,
);

request_response!(
    "worker.updateSettings",
    WorkerUpdateSettingsRequest {
        data: WorkerUpdateSettings,
    },
    (),
);

request_response!(
    "worker.createRouter",
    WorkerCreateRouterRequest {
        internal: RouterInternal,
    },
    (),
);

request_response!(
    "router.close",
    RouterCloseRequest {
        internal: RouterInternal,
    },
    (),
    internal.router_id,
);

request_response!(
    "router.dump",
    RouterDumpRequest {
        internal: RouterInternal,
    },
    Value,
    internal.router_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouterCreateWebRtcTransportData {
    pub(crate) listen_ips: Vec<TransportListenIp>,
    pub(crate) enable_udp: bool,
    pub(crate) enable_tcp: bool,
    pub(crate) prefer_udp: bool,
    pub(crate) prefer_tcp: bool,
    pub(crate) initial_available_outgoing_bitrate: u32,
    pub(crate) enable_sctp: bool,
    pub(crate) num_sctp_streams: NumSctpStreams,
    pub(crate) max_sctp_message_size: u32,
}

request_response!(
    "router.createWebRtcTransport",
    RouterCreateWebRtcTransportRequest {
        internal: TransportInternal,
        data: RouterCreateWebRtcTransportData,
    },
    WebRtcTransportData,
    internal.router_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouterCreatePlainTransportData {
    pub(crate) listen_ip: TransportListenIp,
    pub(crate) rtcp_mux: bool,
    pub(crate) comedia: bool,
    pub(crate) enable_sctp: bool,
    pub(crate) num_sctp_streams: NumSctpStreams,
    pub(crate) max_sctp_message_size: u32,
}

request_response!(
    "router.createPlainTransport",
    RouterCreatePlainTransportRequest {
        internal: TransportInternal,
        data: RouterCreatePlainTransportData,
    },
    crate::router::plain_transport::PlainTransportData,
    internal.router_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouterCreateAudioLevelObserverData {
    pub(crate) max_entries: u16,
    pub(crate) threshold: i8,
    pub(crate) interval: u16,
}

request_response!(
    "router.createAudioLevelObserver",
    RouterCreateAudioLevelObserverRequest {
        internal: RtpObserverInternal,
        data: RouterCreateAudioLevelObserverData,
    },
    (),
    internal.router_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RouterCreateActiveSpeakerObserverData {
    pub(crate) interval: u16,
}

request_response!(
    "router.createActiveSpeakerObserver",
    RouterCreateActiveSpeakerObserverRequest {
        internal: RtpObserverInternal,
        data: RouterCreateActiveSpeakerObserverData,
    },
    (),
    internal.router_id,
);

request_response!(
    "transport.close",
    TransportCloseRequest {
        internal: TransportInternal,
    },
    (),
    internal.transport_id,
);

request_response!(
    "transport.dump",
    TransportDumpRequest {
        internal: TransportInternal,
    },
    Value,
    internal.transport_id,
);

request_response!(
    "transport.getStats",
    TransportGetStatsRequest {
        internal: TransportInternal,
    },
    Value,
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportConnectData {
    pub(crate) dtls_parameters: Value,
}

// The reply (local DTLS role) is not tracked by the orchestrator.
request_response!(
    "transport.connect",
    TransportConnectRequest {
        internal: TransportInternal,
        data: TransportConnectData,
    },
    Value,
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlainTransportConnectData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) rtcp_port: Option<u16>,
}

request_response!(
    "transport.connect",
    PlainTransportConnectRequest {
        internal: TransportInternal,
        data: PlainTransportConnectData,
    },
    Value,
    internal.transport_id,
);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportRestartIceResponse {
    pub(crate) ice_parameters: Value,
}

request_response!(
    "transport.restartIce",
    TransportRestartIceRequest {
        internal: TransportInternal,
    },
    TransportRestartIceResponse,
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportSetMaxBitrateData {
    pub(crate) bitrate: u32,
}

request_response!(
    "transport.setMaxIncomingBitrate",
    TransportSetMaxIncomingBitrateRequest {
        internal: TransportInternal,
        data: TransportSetMaxBitrateData,
    },
    (),
    internal.transport_id,
);

request_response!(
    "transport.setMaxOutgoingBitrate",
    TransportSetMaxOutgoingBitrateRequest {
        internal: TransportInternal,
        data: TransportSetMaxBitrateData,
    },
    (),
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportEnableTraceEventData {
    pub(crate) types: Vec<TransportTraceEventType>,
}

request_response!(
    "transport.enableTraceEvent",
    TransportEnableTraceEventRequest {
        internal: TransportInternal,
        data: TransportEnableTraceEventData,
    },
    (),
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportProduceData {
    pub(crate) kind: MediaKind,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) paused: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportProduceResponse {
    pub(crate) r#type: ProducerType,
}

request_response!(
    "transport.produce",
    TransportProduceRequest {
        internal: ProducerInternal,
        data: TransportProduceData,
    },
    TransportProduceResponse,
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportConsumeData {
    pub(crate) kind: MediaKind,
    pub(crate) rtp_parameters: RtpParameters,
    pub(crate) r#type: ConsumerType,
    pub(crate) paused: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportConsumeResponse {
    pub(crate) paused: bool,
    pub(crate) producer_paused: bool,
    pub(crate) score: ConsumerScore,
}

request_response!(
    "transport.consume",
    TransportConsumeRequest {
        internal: ConsumerInternal,
        data: TransportConsumeData,
    },
    TransportConsumeResponse,
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportProduceDataData {
    pub(crate) r#type: DataProducerType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
    pub(crate) label: String,
    pub(crate) protocol: String,
}

request_response!(
    "transport.produceData",
    TransportProduceDataRequest {
        internal: DataProducerInternal,
        data: TransportProduceDataData,
    },
    (),
    internal.transport_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TransportConsumeDataData {
    pub(crate) r#type: crate::router::data_consumer::DataConsumerType,
    pub(crate) sctp_stream_parameters: Option<SctpStreamParameters>,
    pub(crate) label: String,
    pub(crate) protocol: String,
}

request_response!(
    "transport.consumeData",
    TransportConsumeDataRequest {
        internal: DataConsumerInternal,
        data: TransportConsumeDataData,
    },
    (),
    internal.transport_id,
);

request_response!(
    "producer.close",
    ProducerCloseRequest {
        internal: ProducerInternal,
    },
    (),
    internal.producer_id,
);

request_response!(
    "producer.dump",
    ProducerDumpRequest {
        internal: ProducerInternal,
    },
    Value,
    internal.producer_id,
);

request_response!(
    "producer.getStats",
    ProducerGetStatsRequest {
        internal: ProducerInternal,
    },
    Value,
    internal.producer_id,
);

request_response!(
    "producer.pause",
    ProducerPauseRequest {
        internal: ProducerInternal,
    },
    (),
    internal.producer_id,
);

request_response!(
    "producer.resume",
    ProducerResumeRequest {
        internal: ProducerInternal,
    },
    (),
    internal.producer_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProducerEnableTraceEventData {
    pub(crate) types: Vec<ProducerTraceEventType>,
}

request_response!(
    "producer.enableTraceEvent",
    ProducerEnableTraceEventRequest {
        internal: ProducerInternal,
        data: ProducerEnableTraceEventData,
    },
    (),
    internal.producer_id,
);

request_response!(
    "consumer.close",
    ConsumerCloseRequest {
        internal: ConsumerInternal,
    },
    (),
    internal.consumer_id,
);

request_response!(
    "consumer.dump",
    ConsumerDumpRequest {
        internal: ConsumerInternal,
    },
    Value,
    internal.consumer_id,
);

request_response!(
    "consumer.getStats",
    ConsumerGetStatsRequest {
        internal: ConsumerInternal,
    },
    Value,
    internal.consumer_id,
);

request_response!(
    "consumer.pause",
    ConsumerPauseRequest {
        internal: ConsumerInternal,
    },
    (),
    internal.consumer_id,
);

request_response!(
    "consumer.resume",
    ConsumerResumeRequest {
        internal: ConsumerInternal,
    },
    (),
    internal.consumer_id,
);

request_response!(
    "consumer.setPreferredLayers",
    ConsumerSetPreferredLayersRequest {
        internal: ConsumerInternal,
        data: ConsumerLayers,
    },
    (),
    internal.consumer_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConsumerSetPriorityData {
    pub(crate) priority: u8,
}

request_response!(
    "consumer.setPriority",
    ConsumerSetPriorityRequest {
        internal: ConsumerInternal,
        data: ConsumerSetPriorityData,
    },
    (),
    internal.consumer_id,
);

request_response!(
    "consumer.requestKeyFrame",
    ConsumerRequestKeyFrameRequest {
        internal: ConsumerInternal,
    },
    (),
    internal.consumer_id,
);

request_response!(
    "dataProducer.close",
    DataProducerCloseRequest {
        internal: DataProducerInternal,
    },
    (),
    internal.data_producer_id,
);

request_response!(
    "dataProducer.dump",
    DataProducerDumpRequest {
        internal: DataProducerInternal,
    },
    Value,
    internal.data_producer_id,
);

request_response!(
    "dataProducer.getStats",
    DataProducerGetStatsRequest {
        internal: DataProducerInternal,
    },
    Value,
    internal.data_producer_id,
);

request_response!(
    "dataConsumer.close",
    DataConsumerCloseRequest {
        internal: DataConsumerInternal,
    },
    (),
    internal.data_consumer_id,
);

request_response!(
    "dataConsumer.dump",
    DataConsumerDumpRequest {
        internal: DataConsumerInternal,
    },
    Value,
    internal.data_consumer_id,
);

request_response!(
    "dataConsumer.getStats",
    DataConsumerGetStatsRequest {
        internal: DataConsumerInternal,
    },
    Value,
    internal.data_consumer_id,
);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataConsumerGetBufferedAmountResponse {
    pub(crate) buffered_amount: u32,
}

request_response!(
    "dataConsumer.getBufferedAmount",
    DataConsumerGetBufferedAmountRequest {
        internal: DataConsumerInternal,
    },
    DataConsumerGetBufferedAmountResponse,
    internal.data_consumer_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataConsumerSetBufferedAmountLowThresholdData {
    pub(crate) threshold: u32,
}

request_response!(
    "dataConsumer.setBufferedAmountLowThreshold",
    DataConsumerSetBufferedAmountLowThresholdRequest {
        internal: DataConsumerInternal,
        data: DataConsumerSetBufferedAmountLowThresholdData,
    },
    (),
    internal.data_consumer_id,
);

request_response!(
    "rtpObserver.close",
    RtpObserverCloseRequest {
        internal: RtpObserverInternal,
    },
    (),
    internal.rtp_observer_id,
);

request_response!(
    "rtpObserver.pause",
    RtpObserverPauseRequest {
        internal: RtpObserverInternal,
    },
    (),
    internal.rtp_observer_id,
);

request_response!(
    "rtpObserver.resume",
    RtpObserverResumeRequest {
        internal: RtpObserverInternal,
    },
    (),
    internal.rtp_observer_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RtpObserverAddRemoveProducerData {
    pub(crate) producer_id: crate::router::producer::ProducerId,
}

request_response!(
    "rtpObserver.addProducer",
    RtpObserverAddProducerRequest {
        internal: RtpObserverInternal,
        data: RtpObserverAddRemoveProducerData,
    },
    (),
    internal.rtp_observer_id,
);

request_response!(
    "rtpObserver.removeProducer",
    RtpObserverRemoveProducerRequest {
        internal: RtpObserverInternal,
        data: RtpObserverAddRemoveProducerData,
    },
    (),
    internal.rtp_observer_id,
);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DataProducerSendData {
    pub(crate) ppid: u32,
}

notification!(
    "dataProducer.send",
    DataProducerSendNotification {
        internal: DataProducerInternal,
        data: DataProducerSendData,
    },
    internal.data_producer_id,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterId;

    #[test]
    fn worker_scoped_requests_have_no_handler_id() {
        let request = WorkerDumpRequest {};
        assert_eq!(request.as_method(), "worker.dump");
        assert_eq!(request.handler_id(), None);
    }

    #[test]
    fn object_scoped_requests_use_their_own_id() {
        let router_id = RouterId::new();
        let request = RouterCloseRequest {
            internal: RouterInternal { router_id },
        };
        assert_eq!(request.as_method(), "router.close");
        assert_eq!(request.handler_id(), Some(router_id.to_string()));
    }
}
