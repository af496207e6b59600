//! Base transport machinery shared by the concrete transport kinds.

use crate::data_structures::{
    AppData, ConsumerInternal, DataConsumerInternal, DataProducerInternal, ProducerInternal,
    TransportInternal, TransportTraceEventData, TransportTraceEventType,
};
use crate::messages::{
    TransportConsumeData, TransportConsumeDataData, TransportConsumeDataRequest,
    TransportConsumeRequest, TransportDumpRequest, TransportEnableTraceEventData,
    TransportEnableTraceEventRequest, TransportGetStatsRequest, TransportProduceData,
    TransportProduceDataData, TransportProduceDataRequest, TransportProduceRequest,
    TransportSetMaxBitrateData, TransportSetMaxIncomingBitrateRequest,
    TransportSetMaxOutgoingBitrateRequest,
};
use crate::ortc;
use crate::router::consumer::{Consumer, ConsumerId, ConsumerOptions, ConsumerType};
use crate::router::data_consumer::{DataConsumer, DataConsumerId, DataConsumerOptions, DataConsumerType};
use crate::router::data_producer::{DataProducer, DataProducerId, DataProducerOptions, DataProducerType};
use crate::router::producer::{Producer, ProducerId, ProducerOptions};
use crate::router::{Router, RouterId};
use crate::uuid_based_wrapper_type;
use crate::worker::{Channel, PayloadChannel, RequestError};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::HandlerId;
use log::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

uuid_based_wrapper_type!(
    /// Transport identifier.
    TransportId
);

#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("producer with id \"{0}\" not found")]
    ProducerNotFound(ProducerId),
    #[error("the remote endpoint cannot consume producer with id \"{0}\"")]
    BadConsumerRtpCapabilities(ProducerId),
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

#[derive(Debug, Error)]
pub enum ProduceDataError {
    #[error("SCTP stream parameters are required for this transport")]
    SctpStreamParametersRequired,
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

#[derive(Debug, Error)]
pub enum ConsumeDataError {
    #[error("data producer with id \"{0}\" not found")]
    DataProducerNotFound(DataProducerId),
    #[error("transport has no SCTP association")]
    NoSctpAssociation,
    #[error("no free SCTP stream id available")]
    NoFreeSctpStreamId,
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

/// A transport connects an endpoint with a router and carries producers and consumers.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Transport id.
    fn id(&self) -> TransportId;

    /// Id of the router this transport belongs to.
    fn router_id(&self) -> RouterId;

    /// Custom application data.
    fn app_data(&self) -> &AppData;

    /// Whether the transport is closed.
    fn closed(&self) -> bool;

    /// Instruct the router to receive media from the endpoint over this transport.
    async fn produce(&self, producer_options: ProducerOptions) -> Result<Producer, ProduceError>;

    /// Instruct the router to send media from the given producer over this transport.
    async fn consume(&self, consumer_options: ConsumerOptions) -> Result<Consumer, ConsumeError>;

    /// Instruct the router to receive data messages over this transport.
    async fn produce_data(
        &self,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError>;

    /// Instruct the router to send data messages from the given data producer over this
    /// transport.
    async fn consume_data(
        &self,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError>;

    /// Dump Transport.
    async fn dump(&self) -> Result<Value, RequestError>;

    /// Get transport statistics.
    async fn get_stats(&self) -> Result<Value, RequestError>;

    /// Set maximum incoming bitrate for media streams sent by the remote endpoint.
    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), RequestError>;

    /// Set maximum outgoing bitrate for media streams sent to the remote endpoint.
    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<(), RequestError>;

    /// Instruct the transport to emit "trace" events of the given types.
    async fn enable_trace_event(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError>;

    /// Callback is called on transport "trace" events.
    fn on_trace(
        &self,
        callback: Box<dyn Fn(&TransportTraceEventData) + Send + Sync + 'static>,
    ) -> HandlerId;

    /// Callback is called when the transport is closed for whatever reason.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send + 'static>) -> HandlerId;

    /// Close the transport; all its producers and consumers close with it.
    fn close(&self);

    #[doc(hidden)]
    fn boxed_clone(&self) -> Box<dyn Transport>;
}

impl Clone for Box<dyn Transport> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// State and request plumbing shared by all transport kinds.
pub(super) struct TransportCommon {
    pub(super) internal: TransportInternal,
    pub(super) executor: Arc<Executor<'static>>,
    pub(super) channel: Channel,
    pub(super) payload_channel: PayloadChannel,
    pub(super) app_data: AppData,
    pub(super) router: Router,
    pub(super) closed: AtomicBool,
    // Assignable SCTP stream ids, bounded by MIS; `None` when SCTP is disabled.
    pub(super) sctp_stream_ids: Option<Arc<Mutex<Vec<bool>>>>,
}

impl TransportCommon {
    pub(super) fn new(
        internal: TransportInternal,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        app_data: AppData,
        router: Router,
        max_incoming_sctp_streams: Option<u16>,
    ) -> Self {
        Self {
            internal,
            executor,
            channel,
            payload_channel,
            app_data,
            router,
            closed: AtomicBool::new(false),
            sctp_stream_ids: max_incoming_sctp_streams
                .map(|mis| Arc::new(Mutex::new(vec![false; usize::from(mis)]))),
        }
    }

    pub(super) async fn dump_impl(&self) -> Result<Value, RequestError> {
        self.channel
            .request(TransportDumpRequest {
                internal: self.internal,
            })
            .await
    }

    pub(super) async fn get_stats_impl(&self) -> Result<Value, RequestError> {
        self.channel
            .request(TransportGetStatsRequest {
                internal: self.internal,
            })
            .await
    }

    pub(super) async fn set_max_incoming_bitrate_impl(
        &self,
        bitrate: u32,
    ) -> Result<(), RequestError> {
        self.channel
            .request(TransportSetMaxIncomingBitrateRequest {
                internal: self.internal,
                data: TransportSetMaxBitrateData { bitrate },
            })
            .await
    }

    pub(super) async fn set_max_outgoing_bitrate_impl(
        &self,
        bitrate: u32,
    ) -> Result<(), RequestError> {
        self.channel
            .request(TransportSetMaxOutgoingBitrateRequest {
                internal: self.internal,
                data: TransportSetMaxBitrateData { bitrate },
            })
            .await
    }

    pub(super) async fn enable_trace_event_impl(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError> {
        self.channel
            .request(TransportEnableTraceEventRequest {
                internal: self.internal,
                data: TransportEnableTraceEventData { types },
            })
            .await
    }

    pub(super) async fn produce_impl(
        &self,
        transport: Box<dyn Transport>,
        producer_options: ProducerOptions,
    ) -> Result<Producer, ProduceError> {
        let ProducerOptions {
            kind,
            rtp_parameters,
            paused,
            app_data,
        } = producer_options;

        let producer_id = ProducerId::new();
        let consumable_rtp_parameters = ortc::get_consumable_rtp_parameters(
            kind,
            &rtp_parameters,
            self.router.rtp_capabilities(),
        );

        let response = self
            .channel
            .request(TransportProduceRequest {
                internal: ProducerInternal {
                    router_id: self.internal.router_id,
                    transport_id: self.internal.transport_id,
                    producer_id,
                },
                data: TransportProduceData {
                    kind,
                    rtp_parameters: rtp_parameters.clone(),
                    paused,
                },
            })
            .await
            .map_err(ProduceError::Request)?;

        let producer = Producer::new(
            producer_id,
            kind,
            response.r#type,
            rtp_parameters,
            consumable_rtp_parameters,
            paused,
            Arc::clone(&self.executor),
            self.channel.clone(),
            self.payload_channel.clone(),
            app_data,
            transport,
        );

        self.router.register_producer(&producer);

        Ok(producer)
    }

    pub(super) async fn consume_impl(
        &self,
        transport: Box<dyn Transport>,
        consumer_options: ConsumerOptions,
    ) -> Result<Consumer, ConsumeError> {
        let ConsumerOptions {
            producer_id,
            rtp_capabilities,
            paused,
            app_data,
        } = consumer_options;

        let producer = self
            .router
            .get_producer(&producer_id)
            .ok_or(ConsumeError::ProducerNotFound(producer_id))?;

        if !ortc::can_consume(producer.consumable_rtp_parameters(), &rtp_capabilities) {
            return Err(ConsumeError::BadConsumerRtpCapabilities(producer_id));
        }

        let rtp_parameters = ortc::get_consumer_rtp_parameters(
            producer.consumable_rtp_parameters(),
            &rtp_capabilities,
        );

        let consumer_id = ConsumerId::new();
        let r#type = ConsumerType::from(producer.r#type());

        let response = self
            .channel
            .request(TransportConsumeRequest {
                internal: ConsumerInternal {
                    router_id: self.internal.router_id,
                    transport_id: self.internal.transport_id,
                    consumer_id,
                    producer_id,
                },
                data: TransportConsumeData {
                    kind: producer.kind(),
                    rtp_parameters: rtp_parameters.clone(),
                    r#type,
                    paused,
                },
            })
            .await
            .map_err(ConsumeError::Request)?;

        Ok(Consumer::new(
            consumer_id,
            producer_id,
            producer.kind(),
            r#type,
            rtp_parameters,
            response.paused,
            response.producer_paused,
            response.score,
            Arc::clone(&self.executor),
            self.channel.clone(),
            self.payload_channel.clone(),
            app_data,
            transport,
        ))
    }

    pub(super) async fn produce_data_impl(
        &self,
        transport: Box<dyn Transport>,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError> {
        let DataProducerOptions {
            sctp_stream_parameters,
            label,
            protocol,
            app_data,
        } = data_producer_options;

        let sctp_stream_parameters =
            sctp_stream_parameters.ok_or(ProduceDataError::SctpStreamParametersRequired)?;

        let data_producer_id = DataProducerId::new();

        self.channel
            .request(TransportProduceDataRequest {
                internal: DataProducerInternal {
                    router_id: self.internal.router_id,
                    transport_id: self.internal.transport_id,
                    data_producer_id,
                },
                data: TransportProduceDataData {
                    r#type: DataProducerType::Sctp,
                    sctp_stream_parameters: Some(sctp_stream_parameters),
                    label: label.clone(),
                    protocol: protocol.clone(),
                },
            })
            .await
            .map_err(ProduceDataError::Request)?;

        let data_producer = DataProducer::new(
            data_producer_id,
            DataProducerType::Sctp,
            Some(sctp_stream_parameters),
            label,
            protocol,
            Arc::clone(&self.executor),
            self.channel.clone(),
            self.payload_channel.clone(),
            app_data,
            transport,
        );

        self.router.register_data_producer(&data_producer);

        Ok(data_producer)
    }

    pub(super) async fn consume_data_impl(
        &self,
        transport: Box<dyn Transport>,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError> {
        let DataConsumerOptions {
            data_producer_id,
            ordered,
            max_packet_life_time,
            max_retransmits,
            app_data,
        } = data_consumer_options;

        let data_producer = self
            .router
            .get_data_producer(&data_producer_id)
            .ok_or(ConsumeDataError::DataProducerNotFound(data_producer_id))?;

        let sctp_stream_ids = self
            .sctp_stream_ids
            .as_ref()
            .ok_or(ConsumeDataError::NoSctpAssociation)?;

        let stream_id =
            allocate_sctp_stream_id(sctp_stream_ids).ok_or(ConsumeDataError::NoFreeSctpStreamId)?;

        let producer_parameters = data_producer.sctp_stream_parameters();
        let sctp_stream_parameters = crate::sctp_parameters::SctpStreamParameters {
            stream_id,
            ordered: ordered.or_else(|| producer_parameters.and_then(|p| p.ordered)),
            max_packet_life_time: max_packet_life_time
                .or_else(|| producer_parameters.and_then(|p| p.max_packet_life_time)),
            max_retransmits: max_retransmits
                .or_else(|| producer_parameters.and_then(|p| p.max_retransmits)),
        };

        let data_consumer_id = DataConsumerId::new();

        let request_result = self
            .channel
            .request(TransportConsumeDataRequest {
                internal: DataConsumerInternal {
                    router_id: self.internal.router_id,
                    transport_id: self.internal.transport_id,
                    data_consumer_id,
                    data_producer_id,
                },
                data: TransportConsumeDataData {
                    r#type: DataConsumerType::Sctp,
                    sctp_stream_parameters: Some(sctp_stream_parameters),
                    label: data_producer.label().clone(),
                    protocol: data_producer.protocol().clone(),
                },
            })
            .await;

        if let Err(error) = request_result {
            release_sctp_stream_id(sctp_stream_ids, stream_id);
            return Err(ConsumeDataError::Request(error));
        }

        let data_consumer = DataConsumer::new(
            data_consumer_id,
            DataConsumerType::Sctp,
            Some(sctp_stream_parameters),
            data_producer.label().clone(),
            data_producer.protocol().clone(),
            data_producer_id,
            Arc::clone(&self.executor),
            self.channel.clone(),
            self.payload_channel.clone(),
            app_data,
            transport,
        );

        // The stream id goes back to the pool once the data consumer is gone.
        {
            let sctp_stream_ids = Arc::clone(sctp_stream_ids);
            data_consumer
                .on_close(move || {
                    release_sctp_stream_id(&sctp_stream_ids, stream_id);
                })
                .detach();
        }

        Ok(data_consumer)
    }
}

/// Lowest unused SCTP stream id, marked used.
pub(super) fn allocate_sctp_stream_id(sctp_stream_ids: &Mutex<Vec<bool>>) -> Option<u16> {
    let mut sctp_stream_ids = sctp_stream_ids.lock();
    sctp_stream_ids.iter().position(|used| !used).map(|index| {
        sctp_stream_ids[index] = true;
        index as u16
    })
}

pub(super) fn release_sctp_stream_id(sctp_stream_ids: &Mutex<Vec<bool>>, stream_id: u16) {
    let mut sctp_stream_ids = sctp_stream_ids.lock();
    if let Some(used) = sctp_stream_ids.get_mut(usize::from(stream_id)) {
        *used = false;
    } else {
        warn!("released unknown SCTP stream id {}", stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sctp_stream_ids_are_allocated_lowest_first_within_mis() {
        let pool = Mutex::new(vec![false; 4]);

        assert_eq!(allocate_sctp_stream_id(&pool), Some(0));
        assert_eq!(allocate_sctp_stream_id(&pool), Some(1));
        assert_eq!(allocate_sctp_stream_id(&pool), Some(2));
        assert_eq!(allocate_sctp_stream_id(&pool), Some(3));
        assert_eq!(allocate_sctp_stream_id(&pool), None);
    }

    #[test]
    fn released_sctp_stream_ids_are_reused() {
        let pool = Mutex::new(vec![false; 2]);

        assert_eq!(allocate_sctp_stream_id(&pool), Some(0));
        assert_eq!(allocate_sctp_stream_id(&pool), Some(1));

        release_sctp_stream_id(&pool, 0);
        assert_eq!(allocate_sctp_stream_id(&pool), Some(0));
        assert_eq!(allocate_sctp_stream_id(&pool), None);
    }
}
