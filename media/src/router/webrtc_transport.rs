//! WebRTC transport: ICE + DTLS (+ optional SCTP) connection to a browser or native endpoint.

use crate::data_structures::{
    AppData, DtlsState, IceRole, IceState, SctpState, TransportInternal, TransportListenIp,
    TransportTraceEventData, TransportTraceEventType, TransportTuple,
};
use crate::messages::{TransportCloseRequest, TransportConnectData, TransportConnectRequest, TransportRestartIceRequest};
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

/// WebRTC transport options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WebRtcTransportOptions {
    /// Listening IPs in order of preference (first one is the preferred one).
    pub listen_ips: Vec<TransportListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
    /// Custom application data.
    pub app_data: AppData,
}

impl WebRtcTransportOptions {
    pub fn new(listen_ips: Vec<TransportListenIp>) -> Self {
        Self {
            listen_ips,
            enable_udp: true,
            enable_tcp: false,
            prefer_udp: false,
            prefer_tcp: false,
            initial_available_outgoing_bitrate: 600_000,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 262_144,
            app_data: AppData::default(),
        }
    }
}

/// Remote parameters provided by the endpoint when connecting the transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportRemoteParameters {
    pub dtls_parameters: Value,
}

/// Parameters of a WebRTC transport as reported by the worker at creation time, with the
/// mutable connection state mirrored from later notifications.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebRtcTransportData {
    #[serde(default)]
    ice_role: Option<IceRole>,
    ice_parameters: Mutex<Value>,
    ice_candidates: Vec<Value>,
    #[serde(default)]
    ice_state: Mutex<IceState>,
    #[serde(default)]
    ice_selected_tuple: Mutex<Option<TransportTuple>>,
    dtls_parameters: Mutex<Value>,
    #[serde(default)]
    dtls_state: Mutex<DtlsState>,
    #[serde(default)]
    sctp_parameters: Option<SctpParameters>,
    #[serde(default)]
    sctp_state: Mutex<Option<SctpState>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    #[serde(rename_all = "camelCase")]
    IceStateChange { ice_state: IceState },
    #[serde(rename_all = "camelCase")]
    IceSelectedTupleChange { ice_selected_tuple: TransportTuple },
    #[serde(rename_all = "camelCase")]
    DtlsStateChange {
        dtls_state: DtlsState,
        #[serde(default)]
        dtls_remote_cert: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SctpStateChange { sctp_state: SctpState },
    Trace(TransportTraceEventData),
}

#[derive(Default)]
struct Handlers {
    ice_state_change: Bag<Arc<dyn Fn(IceState) + Send + Sync>>,
    ice_selected_tuple_change: Bag<Arc<dyn Fn(&TransportTuple) + Send + Sync>>,
    dtls_state_change: Bag<Arc<dyn Fn(DtlsState) + Send + Sync>>,
    sctp_state_change: Bag<Arc<dyn Fn(SctpState) + Send + Sync>>,
    trace: Bag<Arc<dyn Fn(&TransportTraceEventData) + Send + Sync>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: TransportId,
    common: TransportCommon,
    data: WebRtcTransportData,
    handlers: Arc<Handlers>,
    _subscription_handler: Option<SubscriptionHandler>,
    _on_router_close_handler: Mutex<HandlerId>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcTransport")
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

/// WebRTC transport proxy.
#[derive(Debug, Clone)]
pub struct WebRtcTransport {
    inner: Arc<Inner>,
}

impl WebRtcTransport {
    pub(super) fn new(
        id: TransportId,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        data: WebRtcTransportData,
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
                            Notification::IceStateChange { ice_state } => {
                                *inner.data.ice_state.lock() = ice_state;
                                handlers.ice_state_change.call(|callback| {
                                    callback(ice_state);
                                });
                            }
                            Notification::IceSelectedTupleChange { ice_selected_tuple } => {
                                inner
                                    .data
                                    .ice_selected_tuple
                                    .lock()
                                    .replace(ice_selected_tuple.clone());
                                handlers.ice_selected_tuple_change.call(|callback| {
                                    callback(&ice_selected_tuple);
                                });
                            }
                            Notification::DtlsStateChange { dtls_state, .. } => {
                                *inner.data.dtls_state.lock() = dtls_state;
                                handlers.dtls_state_change.call(|callback| {
                                    callback(dtls_state);
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

    /// ICE role of the transport (always "controlled" on the server side).
    pub fn ice_role(&self) -> Option<IceRole> {
        self.inner.data.ice_role
    }

    /// Local ICE parameters, updated on ICE restart.
    pub fn ice_parameters(&self) -> Value {
        self.inner.data.ice_parameters.lock().clone()
    }

    /// Local ICE candidates.
    pub fn ice_candidates(&self) -> Vec<Value> {
        self.inner.data.ice_candidates.clone()
    }

    /// Current ICE state.
    pub fn ice_state(&self) -> IceState {
        *self.inner.data.ice_state.lock()
    }

    /// Selected ICE tuple, if the transport is connected.
    pub fn ice_selected_tuple(&self) -> Option<TransportTuple> {
        self.inner.data.ice_selected_tuple.lock().clone()
    }

    /// Local DTLS parameters.
    pub fn dtls_parameters(&self) -> Value {
        self.inner.data.dtls_parameters.lock().clone()
    }

    /// Current DTLS state.
    pub fn dtls_state(&self) -> DtlsState {
        *self.inner.data.dtls_state.lock()
    }

    /// SCTP parameters, if SCTP was enabled at creation.
    pub fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.inner.data.sctp_parameters
    }

    /// Current SCTP state.
    pub fn sctp_state(&self) -> Option<SctpState> {
        *self.inner.data.sctp_state.lock()
    }

    /// Provide the transport with the remote DTLS parameters.
    pub async fn connect(
        &self,
        remote_parameters: WebRtcTransportRemoteParameters,
    ) -> Result<(), RequestError> {
        debug!("connect()");

        self.inner
            .common
            .channel
            .request(TransportConnectRequest {
                internal: self.inner.common.internal,
                data: TransportConnectData {
                    dtls_parameters: remote_parameters.dtls_parameters,
                },
            })
            .await?;

        Ok(())
    }

    /// Restart ICE and return the new local ICE parameters.
    pub async fn restart_ice(&self) -> Result<Value, RequestError> {
        debug!("restart_ice()");

        let response = self
            .inner
            .common
            .channel
            .request(TransportRestartIceRequest {
                internal: self.inner.common.internal,
            })
            .await?;

        *self.inner.data.ice_parameters.lock() = response.ice_parameters.clone();

        Ok(response.ice_parameters)
    }

    /// Callback is called when the transport ICE state changes.
    pub fn on_ice_state_change<F: Fn(IceState) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .ice_state_change
            .add(Arc::new(callback))
    }

    /// Callback is called when the transport ICE selected tuple changes.
    pub fn on_ice_selected_tuple_change<F: Fn(&TransportTuple) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .ice_selected_tuple_change
            .add(Arc::new(callback))
    }

    /// Callback is called when the transport DTLS state changes.
    pub fn on_dtls_state_change<F: Fn(DtlsState) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner
            .handlers
            .dtls_state_change
            .add(Arc::new(callback))
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
impl Transport for WebRtcTransport {
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
