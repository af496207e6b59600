//! Plain RTP transport, used for RTP endpoints that do not speak ICE/DTLS (gateways,
//! recorders, ffmpeg-style streamers).

use crate::data_structures::{
    AppData, SctpState, TransportInternal, TransportListenIp, TransportTraceEventData,
    TransportTraceEventType, TransportTuple,
};
use crate::messages::{
    PlainTransportConnectData, PlainTransportConnectRequest, TransportCloseRequest,
};
use crate::router::consumer::{Consumer, ConsumerOptions};
use crate::router::data_consumer::{DataConsumer, DataConsumerOptions};
use crate::router::data_producer::{DataProducer, DataProducerOptions};
use crate::router::producer::{Producer, ProducerOptions};
use crate::router::transport::{
    ConsumeDataError, ConsumeError, ProduceDataError, ProduceError, Transport, TransportCommon,
    TransportId,
};
use crate::router::{Router, RouterId};
use crate::sctp_parameters::{NumSctpStreams, SctpParameters};
use crate::worker::{Channel, PayloadChannel, RequestError, SubscriptionHandler};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Plain transport options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PlainTransportOptions {
    pub listen_ip: TransportListenIp,
    /// Use RTCP-mux (RTP and RTCP in the same port). Default true.
    pub rtcp_mux: bool,
    /// Whether the remote address is learned from the first received packet. Default false.
    pub comedia: bool,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    /// Custom application data.
    pub app_data: AppData,
}

impl PlainTransportOptions {
    pub fn new(listen_ip: TransportListenIp) -> Self {
        Self {
            listen_ip,
            rtcp_mux: true,
            comedia: false,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 262_144,
            app_data: AppData::default(),
        }
    }
}

/// Remote address provided by the endpoint when connecting the transport.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportRemoteParameters {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub rtcp_port: Option<u16>,
}

/// Parameters of a plain transport as reported by the worker at creation time.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlainTransportData {
    tuple: Mutex<TransportTuple>,
    #[serde(default)]
    rtcp_tuple: Mutex<Option<TransportTuple>>,
    #[serde(default)]
    sctp_parameters: Option<SctpParameters>,
    #[serde(default)]
    sctp_state: Mutex<Option<SctpState>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    Tuple {
        tuple: TransportTuple,
    },
    #[serde(rename_all = "camelCase")]
    RtcpTuple {
        rtcp_tuple: TransportTuple,
    },
    #[serde(rename_all = "camelCase")]
    SctpStateChange {
        sctp_state: SctpState,
    },
    Trace(TransportTraceEventData),
}

#[derive(Default)]
struct Handlers {
    tuple: Bag<Arc<dyn Fn(&TransportTuple) + Send + Sync>>,
    rtcp_tuple: Bag<Arc<dyn Fn(&TransportTuple) + Send + Sync>>,
    sctp_state_change: Bag<Arc<dyn Fn(SctpState) + Send + Sync>>,
    trace: Bag<Arc<dyn Fn(&TransportTraceEventData) + Send + Sync>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: TransportId,
    common: TransportCommon,
    data: PlainTransportData,
    handlers: Arc<Handlers>,
    _subscription_handler: Option<SubscriptionHandler>,
    _on_router_close_handler: Mutex<HandlerId>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTransport")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close(true);
    }
}

impl Inner {
    fn close(&self, close_request: bool) {
        if !self.common.closed.swap(true, Ordering::SeqCst) {
            debug!("close()");

            self.handlers.close.call_simple();

            if close_request {
                let channel = self.common.channel.clone();
                let request = TransportCloseRequest {
                    internal: self.common.internal,
                };
                self.common
                    .executor
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("transport closing failed on drop: {}", error);
                        }
                    })
                    .detach();
            }
        }
    }
}

/// Plain transport proxy.
#[derive(Debug, Clone)]
pub struct PlainTransport {
    inner: Arc<Inner>,
}

impl PlainTransport {
    pub(super) fn new(
        id: TransportId,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        data: PlainTransportData,
        app_data: AppData,
        router: Router,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();
        let inner_weak = Arc::<Mutex<Option<Weak<Inner>>>>::default();

        let subscription_handler = {
            let handlers = Arc::clone(&handlers);
            let inner_weak = Arc::clone(&inner_weak);

            channel.subscribe_to_notifications(id.to_string(), move |notification| {
                match serde_json::from_value::<Notification>(notification) {
                    Ok(notification) => {
                        let inner = inner_weak
                            .lock()
                            .as_ref()
                            .and_then(|weak_inner| weak_inner.upgrade());
                        let inner = match inner {
                            Some(inner) => inner,
                            None => return,
                        };

                        match notification {
                            Notification::Tuple { tuple } => {
                                *inner.data.tuple.lock() = tuple.clone();
                                handlers.tuple.call(|callback| {
                                    callback(&tuple);
                                });
                            }
                            Notification::RtcpTuple { rtcp_tuple } => {
                                inner.data.rtcp_tuple.lock().replace(rtcp_tuple.clone());
                                handlers.rtcp_tuple.call(|callback| {
                                    callback(&rtcp_tuple);
                                });
                            }
                            Notification::SctpStateChange { sctp_state } => {
                                inner.data.sctp_state.lock().replace(sctp_state);
                                handlers.sctp_state_change.call(|callback| {
                                    callback(sctp_state);
                                });
                            }
                            Notification::Trace(trace_event_data) => {
                                handlers.trace.call(|callback| {
                                    callback(&trace_event_data);
                                });
                            }
                        }
                    }
                    Err(error) => {
                        error!("failed to parse transport notification: {}", error);
                    }
                }
            })
        };

        let on_router_close_handler = router.on_close({
            let inner_weak = Arc::clone(&inner_weak);

            move || {
                if let Some(inner) = inner_weak
                    .lock()
                    .as_ref()
                    .and_then(|weak_inner| weak_inner.upgrade())
                {
                    inner.close(false);
                }
            }
        });

        let max_incoming_sctp_streams = data.sctp_parameters.map(|sctp_parameters| sctp_parameters.mis);

        let inner = Arc::new(Inner {
            id,
            common: TransportCommon::new(
                TransportInternal {
                    router_id: router.id(),
                    transport_id: id,
                },
                executor,
                channel,
                payload_channel,
                app_data,
                router,
                max_incoming_sctp_streams,
            ),
            data,
            handlers,
            _subscription_handler: subscription_handler,
            _on_router_close_handler: Mutex::new(on_router_close_handler),
        });

        inner_weak.lock().replace(Arc::downgrade(&inner));

        Self { inner }
    }

    /// Local RTP tuple, with the remote side filled in after connect (or comedia learning).
    pub fn tuple(&self) -> TransportTuple {
        self.inner.data.tuple.lock().clone()
    }

    /// Local RTCP tuple when RTCP-mux is disabled.
    pub fn rtcp_tuple(&self) -> Option<TransportTuple> {
        self.inner.data.rtcp_tuple.lock().clone()
    }

    /// SCTP parameters, if SCTP was enabled at creation.
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.inner.data.sctp_parameters
    }

    /// Current SCTP state.
    pub fn sctp_state(&self) -> Option<SctpState> {
        *self.inner.data.sctp_state.lock()
    }

    /// Provide the transport with the remote address.
    pub async fn connect(
        &self,
        remote_parameters: PlainTransportRemoteParameters,
    ) -> Result<(), RequestError> {
        debug!("connect()");

        self.inner
            .common
            .channel
            .request(PlainTransportConnectRequest {
                internal: self.inner.common.internal,
                data: PlainTransportConnectData {
                    ip: remote_parameters.ip,
                    port: remote_parameters.port,
                    rtcp_port: remote_parameters.rtcp_port,
                },
            })
            .await?;

        Ok(())
    }

    /// Callback is called when the transport RTP tuple is set or updated.
    pub fn on_tuple<F: Fn(&TransportTuple) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.tuple.add(Arc::new(callback))
    }

    /// Callback is called when the transport RTCP tuple is set or updated.
    pub fn on_rtcp_tuple<F: Fn(&TransportTuple) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.rtcp_tuple.add(Arc::new(callback))
    }

    /// Callback is called when the transport SCTP state changes.
    pub fn on_sctp_state_change<F: Fn(SctpState) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .sctp_state_change
            .add(Arc::new(callback))
    }
}

#[async_trait]
impl Transport for PlainTransport {
    fn id(&self) -> TransportId {
        self.inner.id
    }

    fn router_id(&self) -> RouterId {
        self.inner.common.internal.router_id
    }

    fn app_data(&self) -> &AppData {
        &self.inner.common.app_data
    }

    fn closed(&self) -> bool {
        self.inner.common.closed.load(Ordering::SeqCst)
    }

    async fn produce(&self, producer_options: ProducerOptions) -> Result<Producer, ProduceError> {
        debug!("produce()");

        self.inner
            .common
            .produce_impl(Box::new(self.clone()), producer_options)
            .await
    }

    async fn consume(&self, consumer_options: ConsumerOptions) -> Result<Consumer, ConsumeError> {
        debug!("consume()");

        self.inner
            .common
            .consume_impl(Box::new(self.clone()), consumer_options)
            .await
    }

    async fn produce_data(
        &self,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError> {
        debug!("produce_data()");

        self.inner
            .common
            .produce_data_impl(Box::new(self.clone()), data_producer_options)
            .await
    }

    async fn consume_data(
        &self,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError> {
        debug!("consume_data()");

        self.inner
            .common
            .consume_data_impl(Box::new(self.clone()), data_consumer_options)
            .await
    }

    async fn dump(&self) -> Result<Value, RequestError> {
        debug!("dump()");

        self.inner.common.dump_impl().await
    }

    async fn get_stats(&self) -> Result<Value, RequestError> {
        debug!("get_stats()");

        self.inner.common.get_stats_impl().await
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), RequestError> {
        debug!("set_max_incoming_bitrate() [bitrate:{}]", bitrate);

        self.inner.common.set_max_incoming_bitrate_impl(bitrate).await
    }

    async fn set_max_outgoing_bitrate(&self, bitrate: u32) -> Result<(), RequestError> {
        debug!("set_max_outgoing_bitrate() [bitrate:{}]", bitrate);

        self.inner.common.set_max_outgoing_bitrate_impl(bitrate).await
    }

    async fn enable_trace_event(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError> {
        debug!("enable_trace_event()");

        self.inner.common.enable_trace_event_impl(types).await
    }

    fn on_trace(
        &self,
        callback: Box<dyn Fn(&TransportTraceEventData) + Send + Sync + 'static>,
    ) -> HandlerId {
        self.inner.handlers.trace.add(Arc::from(callback))
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send + 'static>) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(callback);
        if self.inner.common.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    fn close(&self) {
        self.inner.close(true);
    }

    fn boxed_clone(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}
