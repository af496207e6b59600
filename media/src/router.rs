//! Per-room media context inside the worker: owns transports and RTP observers, knows which
//! producers exist and who can consume them.

pub mod active_speaker_observer;
pub mod audio_level_observer;
pub mod consumer;
pub mod data_consumer;
pub mod data_producer;
pub mod plain_transport;
pub mod producer;
pub mod rtp_observer;
pub mod transport;
pub mod webrtc_transport;

use crate::data_structures::{AppData, RouterInternal, RtpObserverInternal, TransportInternal};
use crate::messages::{
    RouterCloseRequest, RouterCreateActiveSpeakerObserverData,
    RouterCreateActiveSpeakerObserverRequest, RouterCreateAudioLevelObserverData,
    RouterCreateAudioLevelObserverRequest, RouterCreatePlainTransportData,
    RouterCreatePlainTransportRequest, RouterCreateWebRtcTransportData,
    RouterCreateWebRtcTransportRequest, RouterDumpRequest,
};
use crate::ortc;
use crate::router::active_speaker_observer::{
    ActiveSpeakerObserver, ActiveSpeakerObserverOptions,
};
use crate::router::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use crate::router::data_producer::{DataProducer, DataProducerId, WeakDataProducer};
use crate::router::plain_transport::{PlainTransport, PlainTransportOptions};
use crate::router::producer::{Producer, ProducerId, WeakProducer};
use crate::router::rtp_observer::RtpObserverId;
use crate::router::transport::TransportId;
use crate::router::webrtc_transport::{WebRtcTransport, WebRtcTransportOptions};
use crate::rtp_parameters::{RtpCapabilities, RtpCodecCapability};
use crate::uuid_based_wrapper_type;
use crate::worker::{Channel, PayloadChannel, RequestError, Worker};
use async_executor::Executor;
use event_listener_primitives::{BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

uuid_based_wrapper_type!(
    /// Router identifier.
    RouterId
);

/// Router options.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RouterOptions {
    /// Media codecs the router will be able to route.
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Custom application data.
    pub app_data: AppData,
}

impl RouterOptions {
    pub fn new(media_codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            media_codecs,
            app_data: AppData::default(),
        }
    }
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: RouterId,
    executor: Arc<Executor<'static>>,
    channel: Channel,
    payload_channel: PayloadChannel,
    rtp_capabilities: RtpCapabilities,
    producers: Mutex<HashMap<ProducerId, WeakProducer>>,
    data_producers: Mutex<HashMap<DataProducerId, WeakDataProducer>>,
    handlers: Handlers,
    app_data: AppData,
    // Keeps the worker (and its executor thread) alive while the router exists.
    worker: Worker,
    closed: AtomicBool,
    _on_worker_close_handler: Mutex<HandlerId>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("id", &self.id).finish()
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
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close()");

            self.handlers.close.call_simple();

            if close_request {
                let channel = self.channel.clone();
                let request = RouterCloseRequest {
                    internal: RouterInternal { router_id: self.id },
                };
                self.executor
                    .spawn(async move {
                        if let Err(error) = channel.request(request).await {
                            error!("router closing failed on drop: {}", error);
                        }
                    })
                    .detach();
            }
        }
    }
}

/// Proxy of a router living inside the worker.
#[derive(Debug, Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    pub(crate) fn new(
        id: RouterId,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        payload_channel: PayloadChannel,
        rtp_capabilities: RtpCapabilities,
        app_data: AppData,
        worker: Worker,
    ) -> Self {
        debug!("new()");

        let inner_weak = Arc::<Mutex<Option<Weak<Inner>>>>::default();
        let on_worker_close_handler = worker.on_close({
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

        let inner = Arc::new(Inner {
            id,
            executor,
            channel,
            payload_channel,
            rtp_capabilities,
            producers: Mutex::default(),
            data_producers: Mutex::default(),
            handlers: Handlers::default(),
            app_data,
            worker,
            closed: AtomicBool::new(false),
            _on_worker_close_handler: Mutex::new(on_worker_close_handler),
        });

        inner_weak.lock().replace(Arc::downgrade(&inner));

        Self { inner }
    }

    /// Router identifier.
    pub fn id(&self) -> RouterId {
        self.inner.id
    }

    /// RTP capabilities the router negotiated from its media codecs.
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.inner.rtp_capabilities
    }

    /// Custom application data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the router is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The worker hosting this router.
    pub fn worker(&self) -> &Worker {
        &self.inner.worker
    }

    /// Dump Router.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<Value, RequestError> {
        debug!("dump()");

        self.inner
            .channel
            .request(RouterDumpRequest {
                internal: RouterInternal {
                    router_id: self.inner.id,
                },
            })
            .await
    }

    /// Create a WebRTC transport on this router.
    pub async fn create_webrtc_transport(
        &self,
        webrtc_transport_options: WebRtcTransportOptions,
    ) -> Result<WebRtcTransport, RequestError> {
        debug!("create_webrtc_transport()");

        let transport_id = TransportId::new();
        let internal = TransportInternal {
            router_id: self.inner.id,
            transport_id,
        };

        let data = self
            .inner
            .channel
            .request(RouterCreateWebRtcTransportRequest {
                internal,
                data: RouterCreateWebRtcTransportData {
                    listen_ips: webrtc_transport_options.listen_ips.clone(),
                    enable_udp: webrtc_transport_options.enable_udp,
                    enable_tcp: webrtc_transport_options.enable_tcp,
                    prefer_udp: webrtc_transport_options.prefer_udp,
                    prefer_tcp: webrtc_transport_options.prefer_tcp,
                    initial_available_outgoing_bitrate: webrtc_transport_options
                        .initial_available_outgoing_bitrate,
                    enable_sctp: webrtc_transport_options.enable_sctp,
                    num_sctp_streams: webrtc_transport_options.num_sctp_streams,
                    max_sctp_message_size: webrtc_transport_options.max_sctp_message_size,
                },
            })
            .await?;

        Ok(WebRtcTransport::new(
            transport_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            data,
            webrtc_transport_options.app_data,
            self.clone(),
        ))
    }

    /// Create a plain RTP transport on this router.
    pub async fn create_plain_transport(
        &self,
        plain_transport_options: PlainTransportOptions,
    ) -> Result<PlainTransport, RequestError> {
        debug!("create_plain_transport()");

        let transport_id = TransportId::new();
        let internal = TransportInternal {
            router_id: self.inner.id,
            transport_id,
        };

        let data = self
            .inner
            .channel
            .request(RouterCreatePlainTransportRequest {
                internal,
                data: RouterCreatePlainTransportData {
                    listen_ip: plain_transport_options.listen_ip.clone(),
                    rtcp_mux: plain_transport_options.rtcp_mux,
                    comedia: plain_transport_options.comedia,
                    enable_sctp: plain_transport_options.enable_sctp,
                    num_sctp_streams: plain_transport_options.num_sctp_streams,
                    max_sctp_message_size: plain_transport_options.max_sctp_message_size,
                },
            })
            .await?;

        Ok(PlainTransport::new(
            transport_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            data,
            plain_transport_options.app_data,
            self.clone(),
        ))
    }

    /// Create an audio level observer on this router.
    pub async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> Result<AudioLevelObserver, RequestError> {
        debug!("create_audio_level_observer()");

        let rtp_observer_id = RtpObserverId::new();
        let internal = RtpObserverInternal {
            router_id: self.inner.id,
            rtp_observer_id,
        };

        self.inner
            .channel
            .request(RouterCreateAudioLevelObserverRequest {
                internal,
                data: RouterCreateAudioLevelObserverData {
                    max_entries: options.max_entries,
                    threshold: options.threshold,
                    interval: options.interval,
                },
            })
            .await?;

        Ok(AudioLevelObserver::new(
            rtp_observer_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            options.app_data,
            self.clone(),
        ))
    }

    /// Create an active speaker observer on this router.
    pub async fn create_active_speaker_observer(
        &self,
        options: ActiveSpeakerObserverOptions,
    ) -> Result<ActiveSpeakerObserver, RequestError> {
        debug!("create_active_speaker_observer()");

        let rtp_observer_id = RtpObserverId::new();
        let internal = RtpObserverInternal {
            router_id: self.inner.id,
            rtp_observer_id,
        };

        self.inner
            .channel
            .request(RouterCreateActiveSpeakerObserverRequest {
                internal,
                data: RouterCreateActiveSpeakerObserverData {
                    interval: options.interval,
                },
            })
            .await?;

        Ok(ActiveSpeakerObserver::new(
            rtp_observer_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            options.app_data,
            self.clone(),
        ))
    }

    /// Whether an endpoint with the given RTP capabilities can consume the given producer.
    pub fn can_consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        match self.get_producer(producer_id) {
            Some(producer) => {
                ortc::can_consume(producer.consumable_rtp_parameters(), rtp_capabilities)
            }
            None => {
                warn!(
                    "can_consume() | producer with id \"{}\" not found",
                    producer_id,
                );
                false
            }
        }
    }

    /// Callback is called when the router is closed for whatever reason.
    ///
    /// NOTE: Callback will be called in place if the router is already closed.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the router and all its transports and observers.
    pub fn close(&self) {
        self.inner.close(true);
    }

    pub(crate) fn get_producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.inner
            .producers
            .lock()
            .get(producer_id)
            .and_then(WeakProducer::upgrade)
    }

    pub(crate) fn get_data_producer(
        &self,
        data_producer_id: &DataProducerId,
    ) -> Option<DataProducer> {
        self.inner
            .data_producers
            .lock()
            .get(data_producer_id)
            .and_then(WeakDataProducer::upgrade)
    }

    pub(crate) fn register_producer(&self, producer: &Producer) {
        let producer_id = producer.id();
        self.inner
            .producers
            .lock()
            .insert(producer_id, producer.downgrade());

        let producers_weak = Arc::downgrade(&self.inner);
        producer
            .on_close(move || {
                if let Some(inner) = producers_weak.upgrade() {
                    inner.producers.lock().remove(&producer_id);
                }
            })
            .detach();
    }

    pub(crate) fn register_data_producer(&self, data_producer: &DataProducer) {
        let data_producer_id = data_producer.id();
        self.inner
            .data_producers
            .lock()
            .insert(data_producer_id, data_producer.downgrade());

        let data_producers_weak = Arc::downgrade(&self.inner);
        data_producer
            .on_close(move || {
                if let Some(inner) = data_producers_weak.upgrade() {
                    inner.data_producers.lock().remove(&data_producer_id);
                }
            })
            .detach();
    }
}
