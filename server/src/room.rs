//! A room is one conference: a router on a media worker plus the set of connected peers. It
//! interprets the client signaling protocol and fans every new producer out to consumers on
//! all other peers.

use crate::protoo::{ConnectionId, Peer, Request};
use crate::settings::Settings;
use event_listener_primitives::{BagOnce, HandlerId};
use futures::channel::mpsc::UnboundedSender;
use log::*;
use parking_lot::Mutex;
use rainstream_media::data_structures::{
    DtlsState, TraceEventDirection, TransportTraceEventData, TransportTraceEventType,
};
use rainstream_media::prelude::{
    AudioLevelObserver, AudioLevelObserverOptions, Consumer, ConsumerId, ConsumerLayers,
    ConsumerOptions, DataConsumerOptions, DataProducer, DataProducerId, DataProducerOptions,
    MediaKind, NumSctpStreams, Producer, ProducerId, ProducerOptions, Router, RouterOptions,
    RtpCapabilities, RtpObserver, RtpObserverAddProducerOptions, RtpParameters,
    SctpStreamParameters, Transport, TransportId, WebRtcTransport, WebRtcTransportOptions,
    WebRtcTransportRemoteParameters, Worker,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// The signaling side of one WebSocket connection, before and after peer admission.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub peer_id: String,
    pub connection: ConnectionId,
    pub sender: UnboundedSender<String>,
}

#[derive(Debug, Error)]
pub enum RoomCreateError {
    #[error("failed to create router: {0}")]
    Router(rainstream_media::worker::CreateRouterError),
    #[error("failed to create audio level observer: {0}")]
    AudioLevelObserver(rainstream_media::prelude::RequestError),
}

#[derive(Debug, Error)]
enum RoomError {
    #[error("Peer already joined")]
    PeerAlreadyJoined,
    #[error("Peer not yet joined")]
    PeerNotJoined,
    #[error("transport with id \"{0}\" not found")]
    TransportNotFound(TransportId),
    #[error("producer with id \"{0}\" not found")]
    ProducerNotFound(ProducerId),
    #[error("consumer with id \"{0}\" not found")]
    ConsumerNotFound(ConsumerId),
    #[error("dataProducer with id \"{0}\" not found")]
    DataProducerNotFound(DataProducerId),
    #[error("dataConsumer with id \"{0}\" not found")]
    DataConsumerNotFound(rainstream_media::prelude::DataConsumerId),
    #[error("unknown request.method \"{0}\"")]
    UnknownMethod(String),
    #[error("malformed request data: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Request(rainstream_media::prelude::RequestError),
    #[error("{0}")]
    Produce(rainstream_media::prelude::ProduceError),
    #[error("{0}")]
    ProduceData(rainstream_media::prelude::ProduceDataError),
}

impl From<rainstream_media::prelude::RequestError> for RoomError {
    fn from(error: rainstream_media::prelude::RequestError) -> Self {
        Self::Request(error)
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, RoomError> {
    serde_json::from_value(request.data().clone())
        .map_err(|error| RoomError::BadRequest(error.to_string()))
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct State {
    peers: HashMap<String, Peer>,
}

struct Shared {
    id: String,
    router: Router,
    audio_level_observer: AudioLevelObserver,
    settings: Arc<Settings>,
    state: Mutex<State>,
    handlers: Handlers,
    closed: AtomicBool,
    _observer_handlers: Mutex<Vec<HandlerId>>,
}

/// One conference room.
#[derive(Clone)]
pub struct Room {
    shared: Arc<Shared>,
}

impl Room {
    pub async fn new(
        room_id: String,
        worker: &Worker,
        settings: Arc<Settings>,
    ) -> Result<Self, RoomCreateError> {
        debug!("new() [roomId:{}]", room_id);

        let router = worker
            .create_router(RouterOptions::new(settings.router.media_codecs.clone()))
            .await
            .map_err(RoomCreateError::Router)?;

        let audio_level_observer = router
            .create_audio_level_observer({
                let mut options = AudioLevelObserverOptions::default();
                options.max_entries = 1;
                options.threshold = -80;
                options.interval = 800;
                options
            })
            .await
            .map_err(RoomCreateError::AudioLevelObserver)?;

        let room = Self {
            shared: Arc::new(Shared {
                id: room_id,
                router,
                audio_level_observer,
                settings,
                state: Mutex::new(State {
                    peers: HashMap::new(),
                }),
                handlers: Handlers::default(),
                closed: AtomicBool::new(false),
                _observer_handlers: Mutex::default(),
            }),
        };

        room.wire_audio_level_observer();

        Ok(room)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> &Router {
        &self.shared.router
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<Peer> {
        self.shared.state.lock().peers.get(peer_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().peers.is_empty()
    }

    /// Callback is called when the room is closed for whatever reason.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.shared.handlers.close.add(Box::new(callback))
    }

    /// Close the room: every peer, then the router (which cascades inside the worker).
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [roomId:{}]", self.shared.id);

            let peers = {
                let mut state = self.shared.state.lock();
                std::mem::take(&mut state.peers)
            };
            for (_, peer) in peers {
                peer.close();
                let transports = peer
                    .data()
                    .transports
                    .values()
                    .cloned()
                    .collect::<Vec<_>>();
                for transport in transports {
                    transport.close();
                }
            }

            self.shared.router.close();
            self.shared.handlers.close.call_simple();
        }
    }

    /// Entry point for every request envelope arriving on a WebSocket of this room.
    pub async fn handle_protoo_request(&self, conn: ConnectionHandle, request: Request) {
        debug!(
            "protoo request [method:{}, peerId:{}]",
            request.method(),
            conn.peer_id,
        );

        if self.closed() {
            request.reject(500, "room closed");
            return;
        }

        if request.method() == "getRouterRtpCapabilities" {
            self.admit_peer(&conn, &request);
            return;
        }

        let peer = match self.get_peer(&conn.peer_id) {
            Some(peer) => peer,
            None => {
                warn!(
                    "request from unknown peer [method:{}, peerId:{}]",
                    request.method(),
                    conn.peer_id,
                );
                request.reject(500, "peer not found");
                return;
            }
        };

        if let Err(error) = self.process_peer_request(&peer, &request).await {
            error!(
                "request failed [method:{}, peerId:{}]: {}",
                request.method(),
                conn.peer_id,
                error,
            );
            request.reject(500, &error.to_string());
        }
    }

    /// Route a response envelope to the pending request table of its peer.
    pub fn handle_protoo_response(&self, peer_id: &str, message: crate::protoo::Message) {
        match self.get_peer(peer_id) {
            Some(peer) => peer.handle_response(message),
            None => debug!("response from unknown peer [peerId:{}]", peer_id),
        }
    }

    /// Client-originated notifications are not part of the protocol; log and drop.
    pub fn handle_protoo_notification(&self, peer_id: &str, method: &str, _data: Value) {
        debug!(
            "ignoring notification [method:{}, peerId:{}]",
            method, peer_id,
        );
    }

    /// A WebSocket went away; close its peer unless the peer id was already taken over by a
    /// newer connection.
    pub fn handle_connection_closed(&self, peer_id: &str, connection: ConnectionId) {
        if self.closed() {
            return;
        }

        if let Some(peer) = self.get_peer(peer_id) {
            if peer.connection() == connection {
                self.close_peer(&peer);

                if self.is_empty() {
                    debug!(
                        "last peer in the room left, closing the room [roomId:{}]",
                        self.shared.id,
                    );
                    self.close();
                }
            }
        }
    }

    /// First `getRouterRtpCapabilities` from a peer id: kick any incumbent with the same id,
    /// create the peer, reply with the router capabilities.
    fn admit_peer(&self, conn: &ConnectionHandle, request: &Request) {
        if let Some(existing_peer) = self.get_peer(&conn.peer_id) {
            warn!(
                "there is already a peer with same peerId, closing it [peerId:{}]",
                conn.peer_id,
            );
            self.close_peer(&existing_peer);
        }

        let peer = Peer::new(conn.peer_id.clone(), conn.connection, conn.sender.clone());
        peer.data().consume = true;
        self.shared
            .state
            .lock()
            .peers
            .insert(conn.peer_id.clone(), peer);

        match serde_json::to_value(self.shared.router.rtp_capabilities()) {
            Ok(rtp_capabilities) => request.accept(rtp_capabilities),
            Err(error) => {
                error!("failed to serialize router rtpCapabilities: {}", error);
                request.reject(500, "internal error");
            }
        }
    }

    async fn process_peer_request(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        match request.method() {
            "join" => self.on_join(peer, request).await,
            "createWebRtcTransport" => self.on_create_webrtc_transport(peer, request).await,
            "connectWebRtcTransport" => self.on_connect_webrtc_transport(peer, request).await,
            "restartIce" => self.on_restart_ice(peer, request).await,
            "produce" => self.on_produce(peer, request).await,
            "closeProducer" => self.on_close_producer(peer, request),
            "pauseProducer" => self.on_pause_producer(peer, request).await,
            "resumeProducer" => self.on_resume_producer(peer, request).await,
            "pauseConsumer" => self.on_pause_consumer(peer, request).await,
            "resumeConsumer" => self.on_resume_consumer(peer, request).await,
            "setConsumerPreferredLayers" => {
                self.on_set_consumer_preferred_layers(peer, request).await
            }
            "setConsumerPriority" => self.on_set_consumer_priority(peer, request).await,
            "requestConsumerKeyFrame" => self.on_request_consumer_key_frame(peer, request).await,
            "produceData" => self.on_produce_data(peer, request).await,
            "changeDisplayName" => self.on_change_display_name(peer, request),
            "getTransportStats" => self.on_get_transport_stats(peer, request).await,
            "getProducerStats" => self.on_get_producer_stats(peer, request).await,
            "getConsumerStats" => self.on_get_consumer_stats(peer, request).await,
            "getDataProducerStats" => self.on_get_data_producer_stats(peer, request).await,
            "getDataConsumerStats" => self.on_get_data_consumer_stats(peer, request).await,
            method => Err(RoomError::UnknownMethod(method.to_string())),
        }
    }

    async fn on_join(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct JoinData {
            display_name: String,
            #[serde(default)]
            device: Value,
            rtp_capabilities: RtpCapabilities,
            #[serde(default)]
            sctp_capabilities: Option<Value>,
        }

        if peer.joined() {
            return Err(RoomError::PeerAlreadyJoined);
        }

        let JoinData {
            display_name,
            device,
            rtp_capabilities,
            sctp_capabilities,
        } = parse_data(request)?;

        {
            let mut data = peer.data();
            data.display_name = display_name;
            data.device = device;
            data.rtp_capabilities = Some(rtp_capabilities);
            data.sctp_capabilities = sctp_capabilities;
        }

        // Reply with the already joined peers (all but the new one), then mark it joined.
        let joined_peers = self.joined_peers(Some(peer.id()));

        let peer_infos = joined_peers
            .iter()
            .map(|other_peer| {
                let data = other_peer.data();
                json!({
                    "id": other_peer.id(),
                    "displayName": data.display_name,
                    "device": data.device,
                })
            })
            .collect::<Vec<_>>();

        request.accept(json!({ "peers": peer_infos }));

        peer.data().joined = true;

        // Create consumers (and data consumers) for the existing producers.
        for other_peer in &joined_peers {
            let producers = other_peer
                .data()
                .producers
                .values()
                .cloned()
                .collect::<Vec<_>>();
            for producer in producers {
                self.create_consumer(peer, other_peer, &producer).await;
            }

            let data_producers = other_peer
                .data()
                .data_producers
                .values()
                .cloned()
                .collect::<Vec<_>>();
            for data_producer in data_producers {
                self.create_data_consumer(peer, other_peer, &data_producer)
                    .await;
            }
        }

        // Tell everyone else about the new peer.
        let (display_name, device) = {
            let data = peer.data();
            (data.display_name.clone(), data.device.clone())
        };
        self.notify_joined_peers(
            "newPeer",
            json!({
                "id": peer.id(),
                "displayName": display_name,
                "device": device,
            }),
            Some(peer.id()),
        );

        Ok(())
    }

    async fn on_create_webrtc_transport(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CreateWebRtcTransportData {
            #[serde(default)]
            force_tcp: bool,
            #[serde(default)]
            producing: bool,
            #[serde(default)]
            consuming: bool,
            #[serde(default)]
            sctp_capabilities: Option<Value>,
        }

        // NOTE: The peer is allowed to create transports before joining so it is ready to
        // produce/consume right after `join`.

        let CreateWebRtcTransportData {
            force_tcp,
            producing,
            consuming,
            sctp_capabilities,
        } = parse_data(request)?;

        let transport_settings = &self.shared.settings.webrtc_transport;

        let mut options =
            WebRtcTransportOptions::new(transport_settings.listen_ips.clone());
        options.initial_available_outgoing_bitrate =
            transport_settings.initial_available_outgoing_bitrate;
        options.max_sctp_message_size = transport_settings.max_sctp_message_size;
        options.enable_sctp = sctp_capabilities.is_some();
        if let Some(num_streams) = sctp_capabilities
            .as_ref()
            .and_then(|caps| caps.get("numStreams"))
        {
            options.num_sctp_streams = serde_json::from_value::<NumSctpStreams>(num_streams.clone())
                .map_err(|error| RoomError::BadRequest(error.to_string()))?;
        }
        options.enable_tcp = true;
        if force_tcp {
            options.enable_udp = false;
        } else {
            options.prefer_udp = true;
        }
        options.app_data = json!({ "producing": producing, "consuming": consuming }).into();

        let transport = self
            .shared
            .router
            .create_webrtc_transport(options)
            .await?;

        transport
            .on_sctp_state_change(|sctp_state| {
                debug!("WebRtcTransport \"sctpstatechange\" event [sctpState:{:?}]", sctp_state);
            })
            .detach();

        transport
            .on_dtls_state_change(|dtls_state| {
                if matches!(dtls_state, DtlsState::Failed | DtlsState::Closed) {
                    warn!(
                        "WebRtcTransport \"dtlsstatechange\" event [dtlsState:{:?}]",
                        dtls_state,
                    );
                }
            })
            .detach();

        transport.enable_trace_event(vec![TransportTraceEventType::Bwe]).await?;

        transport
            .on_trace(Box::new({
                let peer = peer.clone();
                let transport_id = transport.id();

                move |trace| {
                    debug!(
                        "transport \"trace\" event [transportId:{}, trace:{:?}]",
                        transport_id, trace,
                    );

                    if let TransportTraceEventData::Bwe {
                        direction: TraceEventDirection::Out,
                        info,
                        ..
                    } = trace
                    {
                        let _ = peer.notify(
                            "downlinkBwe",
                            json!({
                                "desiredBitrate": info.get("desiredBitrate"),
                                "effectiveDesiredBitrate": info.get("effectiveDesiredBitrate"),
                                "availableBitrate": info.get("availableBitrate"),
                            }),
                        );
                    }
                }
            }))
            .detach();

        peer.data()
            .transports
            .insert(transport.id(), transport.clone());

        request.accept(json!({
            "id": transport.id(),
            "iceParameters": transport.ice_parameters(),
            "iceCandidates": transport.ice_candidates(),
            "dtlsParameters": transport.dtls_parameters(),
            "sctpParameters": transport.sctp_parameters(),
        }));

        // If configured, apply the max incoming bitrate limit; best effort.
        if let Some(max_incoming_bitrate) = transport_settings.max_incoming_bitrate {
            if let Err(error) = transport.set_max_incoming_bitrate(max_incoming_bitrate).await {
                warn!("setMaxIncomingBitrate failed: {}", error);
            }
        }

        Ok(())
    }

    async fn on_connect_webrtc_transport(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConnectData {
            transport_id: TransportId,
            dtls_parameters: Value,
        }

        let ConnectData {
            transport_id,
            dtls_parameters,
        } = parse_data(request)?;

        let transport = self.get_transport(peer, transport_id)?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_restart_ice(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RestartIceData {
            transport_id: TransportId,
        }

        let RestartIceData { transport_id } = parse_data(request)?;

        let transport = self.get_transport(peer, transport_id)?;

        let ice_parameters = transport.restart_ice().await?;

        request.accept(ice_parameters);

        Ok(())
    }

    async fn on_produce(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProduceData {
            transport_id: TransportId,
            kind: MediaKind,
            rtp_parameters: RtpParameters,
            #[serde(default)]
            app_data: Option<Value>,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ProduceData {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } = parse_data(request)?;

        let transport = self.get_transport(peer, transport_id)?;

        // Put the peer id into appData so observers can map producers back to peers.
        let mut app_data = match app_data {
            Some(Value::Object(map)) => Value::Object(map),
            _ => json!({}),
        };
        app_data["peerId"] = json!(peer.id());

        let producer = transport
            .produce({
                let mut options = ProducerOptions::new(kind, rtp_parameters);
                options.app_data = app_data.into();
                options
            })
            .await
            .map_err(RoomError::Produce)?;

        peer.data().producers.insert(producer.id(), producer.clone());

        producer
            .on_score({
                let peer = peer.clone();
                let producer_id = producer.id();

                move |score| {
                    let _ = peer.notify(
                        "producerScore",
                        json!({ "producerId": producer_id, "score": score }),
                    );
                }
            })
            .detach();

        producer
            .on_video_orientation_change({
                let producer_id = producer.id();

                move |video_orientation| {
                    debug!(
                        "producer \"videoorientationchange\" event [producerId:{}, videoOrientation:{:?}]",
                        producer_id, video_orientation,
                    );
                }
            })
            .detach();

        producer
            .on_trace({
                let producer_id = producer.id();

                move |trace| {
                    debug!(
                        "producer \"trace\" event [producerId:{}, trace:{:?}]",
                        producer_id, trace,
                    );
                }
            })
            .detach();

        request.accept(json!({ "id": producer.id() }));

        // Optimization: create a server-side consumer on every other joined peer.
        for other_peer in self.joined_peers(Some(peer.id())) {
            self.create_consumer(&other_peer, peer, &producer).await;
        }

        if kind == MediaKind::Audio {
            if let Err(error) = self
                .shared
                .audio_level_observer
                .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
                .await
            {
                warn!("audioLevelObserver.addProducer() failed: {}", error);
            }
        }

        Ok(())
    }

    fn on_close_producer(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProducerData {
            producer_id: ProducerId,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ProducerData { producer_id } = parse_data(request)?;

        let producer = peer
            .data()
            .producers
            .remove(&producer_id)
            .ok_or(RoomError::ProducerNotFound(producer_id))?;

        producer.close();

        request.accept(json!({}));

        Ok(())
    }

    async fn on_pause_producer(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProducerData {
            producer_id: ProducerId,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ProducerData { producer_id } = parse_data(request)?;

        let producer = self.get_producer(peer, producer_id)?;

        producer.pause().await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_resume_producer(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProducerData {
            producer_id: ProducerId,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ProducerData { producer_id } = parse_data(request)?;

        let producer = self.get_producer(peer, producer_id)?;

        producer.resume().await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_pause_consumer(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConsumerData {
            consumer_id: ConsumerId,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ConsumerData { consumer_id } = parse_data(request)?;

        let consumer = self.get_consumer(peer, consumer_id)?;

        consumer.pause().await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_resume_consumer(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConsumerData {
            consumer_id: ConsumerId,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ConsumerData { consumer_id } = parse_data(request)?;

        let consumer = self.get_consumer(peer, consumer_id)?;

        consumer.resume().await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_set_consumer_preferred_layers(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PreferredLayersData {
            consumer_id: ConsumerId,
            spatial_layer: u8,
            #[serde(default)]
            temporal_layer: Option<u8>,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let PreferredLayersData {
            consumer_id,
            spatial_layer,
            temporal_layer,
        } = parse_data(request)?;

        let consumer = self.get_consumer(peer, consumer_id)?;

        consumer
            .set_preferred_layers(ConsumerLayers {
                spatial_layer,
                temporal_layer,
            })
            .await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_set_consumer_priority(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PriorityData {
            consumer_id: ConsumerId,
            priority: u8,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let PriorityData {
            consumer_id,
            priority,
        } = parse_data(request)?;

        let consumer = self.get_consumer(peer, consumer_id)?;

        consumer.set_priority(priority).await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_request_consumer_key_frame(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConsumerData {
            consumer_id: ConsumerId,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ConsumerData { consumer_id } = parse_data(request)?;

        let consumer = self.get_consumer(peer, consumer_id)?;

        consumer.request_key_frame().await?;

        request.accept(json!({}));

        Ok(())
    }

    async fn on_produce_data(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProduceDataData {
            transport_id: TransportId,
            sctp_stream_parameters: SctpStreamParameters,
            #[serde(default)]
            label: String,
            #[serde(default)]
            protocol: String,
            #[serde(default)]
            app_data: Option<Value>,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let ProduceDataData {
            transport_id,
            sctp_stream_parameters,
            label,
            protocol,
            app_data,
        } = parse_data(request)?;

        let transport = self.get_transport(peer, transport_id)?;

        let data_producer = transport
            .produce_data({
                let mut options = DataProducerOptions::new_sctp(sctp_stream_parameters);
                options.label = label;
                options.protocol = protocol;
                options.app_data = app_data.unwrap_or_else(|| json!({})).into();
                options
            })
            .await
            .map_err(RoomError::ProduceData)?;

        peer.data()
            .data_producers
            .insert(data_producer.id(), data_producer.clone());

        request.accept(json!({ "id": data_producer.id() }));

        // Create a server-side data consumer on every other joined peer.
        for other_peer in self.joined_peers(Some(peer.id())) {
            self.create_data_consumer(&other_peer, peer, &data_producer)
                .await;
        }

        Ok(())
    }

    fn on_change_display_name(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DisplayNameData {
            display_name: String,
        }

        if !peer.joined() {
            return Err(RoomError::PeerNotJoined);
        }

        let DisplayNameData { display_name } = parse_data(request)?;

        let old_display_name = {
            let mut data = peer.data();
            std::mem::replace(&mut data.display_name, display_name.clone())
        };

        self.notify_joined_peers(
            "peerDisplayNameChanged",
            json!({
                "peerId": peer.id(),
                "displayName": display_name,
                "oldDisplayName": old_display_name,
            }),
            Some(peer.id()),
        );

        request.accept(json!({}));

        Ok(())
    }

    async fn on_get_transport_stats(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct TransportData {
            transport_id: TransportId,
        }

        let TransportData { transport_id } = parse_data(request)?;

        let transport = self.get_transport(peer, transport_id)?;

        let stats = transport.get_stats().await?;

        request.accept(stats);

        Ok(())
    }

    async fn on_get_producer_stats(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ProducerData {
            producer_id: ProducerId,
        }

        let ProducerData { producer_id } = parse_data(request)?;

        let producer = self.get_producer(peer, producer_id)?;

        let stats = producer.get_stats().await?;

        request.accept(stats);

        Ok(())
    }

    async fn on_get_consumer_stats(&self, peer: &Peer, request: &Request) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ConsumerData {
            consumer_id: ConsumerId,
        }

        let ConsumerData { consumer_id } = parse_data(request)?;

        let consumer = self.get_consumer(peer, consumer_id)?;

        let stats = consumer.get_stats().await?;

        request.accept(stats);

        Ok(())
    }

    async fn on_get_data_producer_stats(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DataProducerData {
            data_producer_id: DataProducerId,
        }

        let DataProducerData { data_producer_id } = parse_data(request)?;

        let data_producer = peer
            .data()
            .data_producers
            .get(&data_producer_id)
            .cloned()
            .ok_or(RoomError::DataProducerNotFound(data_producer_id))?;

        let stats = data_producer.get_stats().await?;

        request.accept(stats);

        Ok(())
    }

    async fn on_get_data_consumer_stats(
        &self,
        peer: &Peer,
        request: &Request,
    ) -> Result<(), RoomError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DataConsumerData {
            data_consumer_id: rainstream_media::prelude::DataConsumerId,
        }

        let DataConsumerData { data_consumer_id } = parse_data(request)?;

        let data_consumer = peer
            .data()
            .data_consumers
            .get(&data_consumer_id)
            .cloned()
            .ok_or(RoomError::DataConsumerNotFound(data_consumer_id))?;

        let stats = data_consumer.get_stats().await?;

        request.accept(stats);

        Ok(())
    }

    /// Create a server-side consumer of `producer` on `consumer_peer`.
    ///
    /// The consumer is created paused and resumed once the client has acknowledged the
    /// `newConsumer` request, so the first RTP (and the key frame it triggers) arrives when
    /// the client is ready to associate the stream.
    async fn create_consumer(&self, consumer_peer: &Peer, producer_peer: &Peer, producer: &Producer) {
        let rtp_capabilities = {
            let data = consumer_peer.data();
            if !data.consume {
                return;
            }
            match &data.rtp_capabilities {
                Some(rtp_capabilities) => rtp_capabilities.clone(),
                None => return,
            }
        };

        if !self
            .shared
            .router
            .can_consume(&producer.id(), &rtp_capabilities)
        {
            return;
        }

        // Must use the transport the remote peer created for consuming.
        let transport = {
            let data = consumer_peer.data();
            data.transports
                .values()
                .find(|transport| {
                    transport.app_data().0.get("consuming").and_then(Value::as_bool)
                        == Some(true)
                })
                .cloned()
        };
        let transport = match transport {
            Some(transport) => transport,
            None => {
                warn!("create_consumer() | transport for consuming not found");
                return;
            }
        };

        let consumer = match transport
            .consume({
                let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities);
                options.paused = true;
                options
            })
            .await
        {
            Ok(consumer) => consumer,
            Err(error) => {
                warn!("create_consumer() | transport.consume(): {}", error);
                return;
            }
        };

        consumer_peer
            .data()
            .consumers
            .insert(consumer.id(), consumer.clone());

        let consumer_id = consumer.id();

        consumer
            .on_transport_close({
                let consumer_peer = consumer_peer.clone();

                move || {
                    consumer_peer.data().consumers.remove(&consumer_id);
                }
            })
            .detach();

        consumer
            .on_producer_close({
                let consumer_peer = consumer_peer.clone();

                move || {
                    consumer_peer.data().consumers.remove(&consumer_id);
                    let _ = consumer_peer
                        .notify("consumerClosed", json!({ "consumerId": consumer_id }));
                }
            })
            .detach();

        consumer
            .on_producer_pause({
                let consumer_peer = consumer_peer.clone();

                move || {
                    let _ = consumer_peer
                        .notify("consumerPaused", json!({ "consumerId": consumer_id }));
                }
            })
            .detach();

        consumer
            .on_producer_resume({
                let consumer_peer = consumer_peer.clone();

                move || {
                    let _ = consumer_peer
                        .notify("consumerResumed", json!({ "consumerId": consumer_id }));
                }
            })
            .detach();

        consumer
            .on_score({
                let consumer_peer = consumer_peer.clone();

                move |score| {
                    let _ = consumer_peer.notify(
                        "consumerScore",
                        json!({ "consumerId": consumer_id, "score": score }),
                    );
                }
            })
            .detach();

        consumer
            .on_layers_change({
                let consumer_peer = consumer_peer.clone();

                move |layers| {
                    let _ = consumer_peer.notify(
                        "consumerLayersChanged",
                        json!({
                            "consumerId": consumer_id,
                            "spatialLayer": layers.map(|layers| layers.spatial_layer),
                            "temporalLayer": layers.and_then(|layers| layers.temporal_layer),
                        }),
                    );
                }
            })
            .detach();

        consumer
            .on_trace(move |trace| {
                debug!(
                    "consumer \"trace\" event [consumerId:{}, trace:{:?}]",
                    consumer_id, trace,
                );
            })
            .detach();

        let new_consumer_result = consumer_peer
            .request(
                "newConsumer",
                json!({
                    "peerId": producer_peer.id(),
                    "producerId": producer.id(),
                    "id": consumer.id(),
                    "kind": consumer.kind(),
                    "rtpParameters": consumer.rtp_parameters(),
                    "type": consumer.r#type(),
                    "appData": producer.app_data(),
                    "producerPaused": consumer.producer_paused(),
                }),
            )
            .await;

        match new_consumer_result {
            Ok(_) => {
                // Now that the client is ready, let RTP flow.
                if let Err(error) = consumer.resume().await {
                    warn!("create_consumer() | consumer.resume(): {}", error);
                    return;
                }

                let _ = consumer_peer.notify(
                    "consumerScore",
                    json!({
                        "consumerId": consumer.id(),
                        "score": consumer.score(),
                    }),
                );
            }
            Err(error) => {
                warn!("create_consumer() | failed: {}", error);
                consumer_peer.data().consumers.remove(&consumer.id());
                consumer.close();
            }
        }
    }

    /// Create a server-side data consumer of `data_producer` on `consumer_peer`.
    async fn create_data_consumer(
        &self,
        consumer_peer: &Peer,
        producer_peer: &Peer,
        data_producer: &DataProducer,
    ) {
        if consumer_peer.data().sctp_capabilities.is_none() {
            return;
        }

        let transport = {
            let data = consumer_peer.data();
            data.transports
                .values()
                .find(|transport| {
                    transport.app_data().0.get("consuming").and_then(Value::as_bool)
                        == Some(true)
                })
                .cloned()
        };
        let transport = match transport {
            Some(transport) => transport,
            None => {
                warn!("create_data_consumer() | transport for consuming not found");
                return;
            }
        };

        let data_consumer = match transport
            .consume_data(DataConsumerOptions::new_sctp(data_producer.id()))
            .await
        {
            Ok(data_consumer) => data_consumer,
            Err(error) => {
                warn!("create_data_consumer() | transport.consume_data(): {}", error);
                return;
            }
        };

        consumer_peer
            .data()
            .data_consumers
            .insert(data_consumer.id(), data_consumer.clone());

        let data_consumer_id = data_consumer.id();

        data_consumer
            .on_transport_close({
                let consumer_peer = consumer_peer.clone();

                move || {
                    consumer_peer.data().data_consumers.remove(&data_consumer_id);
                }
            })
            .detach();

        data_consumer
            .on_data_producer_close({
                let consumer_peer = consumer_peer.clone();

                move || {
                    consumer_peer.data().data_consumers.remove(&data_consumer_id);
                    let _ = consumer_peer.notify(
                        "dataConsumerClosed",
                        json!({ "dataConsumerId": data_consumer_id }),
                    );
                }
            })
            .detach();

        let new_data_consumer_result = consumer_peer
            .request(
                "newDataConsumer",
                json!({
                    "peerId": producer_peer.id(),
                    "dataProducerId": data_producer.id(),
                    "id": data_consumer.id(),
                    "sctpStreamParameters": data_consumer.sctp_stream_parameters(),
                    "label": data_consumer.label(),
                    "protocol": data_consumer.protocol(),
                    "appData": data_producer.app_data(),
                }),
            )
            .await;

        if let Err(error) = new_data_consumer_result {
            warn!("create_data_consumer() | failed: {}", error);
            consumer_peer
                .data()
                .data_consumers
                .remove(&data_consumer.id());
            data_consumer.close();
        }
    }

    /// Close one peer: notify the others, cascade its transports, drop it from the room, and
    /// close the room when it was the last one.
    fn close_peer(&self, peer: &Peer) {
        if peer.closed() {
            return;
        }

        debug!("closing peer [peerId:{}]", peer.id());

        {
            let mut state = self.shared.state.lock();
            // Only remove the map entry if it still belongs to this connection.
            if let Some(current) = state.peers.get(peer.id()) {
                if current.connection() == peer.connection() {
                    state.peers.remove(peer.id());
                }
            }
        }

        if peer.joined() {
            self.notify_joined_peers("peerClosed", json!({ "peerId": peer.id() }), None);
        }

        peer.close();

        let transports = peer.data().transports.values().cloned().collect::<Vec<_>>();
        for transport in transports {
            transport.close();
        }
    }

    fn joined_peers(&self, exclude_peer_id: Option<&str>) -> Vec<Peer> {
        self.shared
            .state
            .lock()
            .peers
            .values()
            .filter(|peer| peer.joined() && Some(peer.id()) != exclude_peer_id)
            .cloned()
            .collect()
    }

    fn notify_joined_peers(&self, method: &str, data: Value, exclude_peer_id: Option<&str>) {
        for peer in self.joined_peers(exclude_peer_id) {
            let _ = peer.notify(method, data.clone());
        }
    }

    fn get_transport(&self, peer: &Peer, transport_id: TransportId) -> Result<WebRtcTransport, RoomError> {
        peer.data()
            .transports
            .get(&transport_id)
            .cloned()
            .ok_or(RoomError::TransportNotFound(transport_id))
    }

    fn get_producer(&self, peer: &Peer, producer_id: ProducerId) -> Result<Producer, RoomError> {
        peer.data()
            .producers
            .get(&producer_id)
            .cloned()
            .ok_or(RoomError::ProducerNotFound(producer_id))
    }

    fn get_consumer(&self, peer: &Peer, consumer_id: ConsumerId) -> Result<Consumer, RoomError> {
        peer.data()
            .consumers
            .get(&consumer_id)
            .cloned()
            .ok_or(RoomError::ConsumerNotFound(consumer_id))
    }

    fn wire_audio_level_observer(&self) {
        let mut observer_handlers = Vec::new();

        observer_handlers.push(self.shared.audio_level_observer.on_volumes({
            let room = self.downgrade();

            move |volumes| {
                let room = match room.upgrade() {
                    Some(room) => room,
                    None => return,
                };

                if let Some(volume) = volumes.first() {
                    let peer_id = volume.producer.app_data().0.get("peerId").cloned();
                    room.notify_joined_peers(
                        "active-speaker",
                        json!({ "peerId": peer_id, "volume": volume.volume }),
                        None,
                    );
                }
            }
        }));

        observer_handlers.push(self.shared.audio_level_observer.on_silence({
            let room = self.downgrade();

            move || {
                if let Some(room) = room.upgrade() {
                    room.notify_joined_peers("active-speaker", json!({ "peerId": null }), None);
                }
            }
        }));

        *self.shared._observer_handlers.lock() = observer_handlers;
    }

    fn downgrade(&self) -> WeakRoom {
        WeakRoom {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

#[derive(Clone)]
struct WeakRoom {
    shared: std::sync::Weak<Shared>,
}

impl WeakRoom {
    fn upgrade(&self) -> Option<Room> {
        self.shared.upgrade().map(|shared| Room { shared })
    }
}
