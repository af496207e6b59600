//! Single import for the commonly used types of this crate.

pub use crate::data_structures::{
    AppData, DtlsState, IceState, SctpState, TransportListenIp, TransportTraceEventData,
    TransportTraceEventType, TransportTuple, WebRtcMessage,
};
pub use crate::router::active_speaker_observer::{
    ActiveSpeakerObserver, ActiveSpeakerObserverOptions,
};
pub use crate::router::audio_level_observer::{
    AudioLevelObserver, AudioLevelObserverOptions, AudioLevelObserverVolume,
};
pub use crate::router::consumer::{
    Consumer, ConsumerId, ConsumerLayers, ConsumerOptions, ConsumerScore, ConsumerType,
};
pub use crate::router::data_consumer::{
    DataConsumer, DataConsumerId, DataConsumerOptions, DataConsumerType,
};
pub use crate::router::data_producer::{
    DataProducer, DataProducerId, DataProducerOptions, DataProducerType,
};
pub use crate::router::plain_transport::{
    PlainTransport, PlainTransportOptions, PlainTransportRemoteParameters,
};
pub use crate::router::producer::{
    Producer, ProducerId, ProducerOptions, ProducerScore, ProducerType,
};
pub use crate::router::rtp_observer::{
    RtpObserver, RtpObserverAddProducerOptions, RtpObserverId,
};
pub use crate::router::transport::{
    ConsumeDataError, ConsumeError, ProduceDataError, ProduceError, Transport, TransportId,
};
pub use crate::router::webrtc_transport::{
    WebRtcTransport, WebRtcTransportOptions, WebRtcTransportRemoteParameters,
};
pub use crate::router::{Router, RouterId, RouterOptions};
pub use crate::rtp_parameters::{
    MediaKind, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
};
pub use crate::sctp_parameters::{NumSctpStreams, SctpParameters, SctpStreamParameters};
pub use crate::worker::{
    EmbeddedWorkerFn, EmbeddedWorkerIo, ExitError, RequestError, Worker, WorkerLogLevel,
    WorkerLogTag, WorkerSettings, WorkerUpdateSettings,
};
pub use crate::worker_manager::WorkerManager;
