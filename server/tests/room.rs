mod fixture;

use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use rainstream_media::prelude::WorkerManager;
use rainstream_server::cluster_server::ClusterServer;
use rainstream_server::protoo::{ConnectionId, Message, Request};
use rainstream_server::room::{ConnectionHandle, Room};
use rainstream_server::settings::Settings;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

async fn create_server() -> ClusterServer {
    let _ = env_logger::builder().is_test(true).try_init();

    let settings = Arc::new(Settings::default());
    let worker_manager = WorkerManager::with_embedded_worker(fixture::scripted_worker());

    ClusterServer::new(settings, worker_manager)
        .await
        .expect("failed to create cluster server")
}

async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s: {}", description);
}

/// Simulated protoo client: feeds request envelopes into the room and pumps its outbound
/// socket, acknowledging every server-initiated request the way a real client would.
struct TestClient {
    peer_id: String,
    room: Room,
    conn: ConnectionHandle,
    next_id: u32,
    responses: mpsc::UnboundedReceiver<Message>,
    log: Arc<Mutex<Vec<Message>>>,
}

impl TestClient {
    fn connect(room: &Room, peer_id: &str, connection: u64) -> Self {
        let (sender, mut receiver) = mpsc::unbounded::<String>();
        let (response_sender, responses) = mpsc::unbounded::<Message>();
        let log = Arc::new(Mutex::new(Vec::new()));

        let conn = ConnectionHandle {
            peer_id: peer_id.to_string(),
            connection: ConnectionId(connection),
            sender,
        };

        actix_rt::spawn({
            let room = room.clone();
            let peer_id = peer_id.to_string();
            let log = Arc::clone(&log);

            async move {
                while let Some(raw) = receiver.next().await {
                    match Message::parse(&raw) {
                        Ok(Message::Request { id, method, data }) => {
                            log.lock().push(Message::Request {
                                id,
                                method,
                                data,
                            });
                            room.handle_protoo_response(
                                &peer_id,
                                Message::ResponseSuccess {
                                    id,
                                    data: json!({}),
                                },
                            );
                        }
                        Ok(
                            message @ (Message::ResponseSuccess { .. }
                            | Message::ResponseError { .. }),
                        ) => {
                            let _ = response_sender.unbounded_send(message);
                        }
                        Ok(message @ Message::Notification { .. }) => {
                            log.lock().push(message);
                        }
                        Err(_) => {}
                    }
                }
            }
        });

        Self {
            peer_id: peer_id.to_string(),
            room: room.clone(),
            conn,
            next_id: 0,
            responses,
            log,
        }
    }

    async fn request(&mut self, method: &str, data: Value) -> Result<Value, (i64, String)> {
        self.next_id += 1;
        let id = self.next_id;

        let request = Request::new(id, method.to_string(), data, self.conn.sender.clone());
        let room = self.room.clone();
        let conn = self.conn.clone();
        actix_rt::spawn(async move {
            room.handle_protoo_request(conn, request).await;
        });

        loop {
            let message = self.responses.next().await.expect("socket closed");
            match message {
                Message::ResponseSuccess { id: reply_id, data } if reply_id == id => {
                    return Ok(data);
                }
                Message::ResponseError {
                    id: reply_id,
                    error_code,
                    error_reason,
                } if reply_id == id => {
                    return Err((error_code, error_reason));
                }
                _ => {}
            }
        }
    }

    fn notifications(&self, method: &str) -> Vec<Value> {
        self.log
            .lock()
            .iter()
            .filter_map(|message| match message {
                Message::Notification {
                    method: candidate,
                    data,
                } if candidate == method => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn server_requests(&self, method: &str) -> Vec<Value> {
        self.log
            .lock()
            .iter()
            .filter_map(|message| match message {
                Message::Request {
                    method: candidate,
                    data,
                    ..
                } if candidate == method => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn disconnect(&self) {
        self.room
            .handle_connection_closed(&self.peer_id, self.conn.connection);
    }
}

fn video_rtp_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [
            {
                "mimeType": "video/VP8",
                "payloadType": 96,
                "clockRate": 90000,
                "parameters": {},
                "rtcpFeedback": [],
            },
        ],
        "headerExtensions": [],
        "encodings": [{ "ssrc": 2222 }],
        "rtcp": { "cname": "test" },
    })
}

fn audio_only(capabilities: &Value) -> Value {
    let codecs = capabilities["codecs"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|codec| codec["kind"] == "audio")
        .cloned()
        .collect::<Vec<_>>();

    json!({ "codecs": codecs, "headerExtensions": [] })
}

/// Query capabilities, create one transport, join; returns (router caps, transport id).
async fn prepare_peer(
    client: &mut TestClient,
    display_name: &str,
    producing: bool,
    consuming: bool,
) -> (Value, String) {
    let capabilities = client
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .expect("getRouterRtpCapabilities failed");

    let transport = client
        .request(
            "createWebRtcTransport",
            json!({
                "forceTcp": false,
                "producing": producing,
                "consuming": consuming,
                "sctpCapabilities": { "numStreams": { "OS": 1024, "MIS": 1024 } },
            }),
        )
        .await
        .expect("createWebRtcTransport failed");
    let transport_id = transport["id"].as_str().unwrap().to_string();

    client
        .request(
            "join",
            json!({
                "displayName": display_name,
                "device": { "name": "test" },
                "rtpCapabilities": capabilities,
                "sctpCapabilities": { "numStreams": { "OS": 1024, "MIS": 1024 } },
            }),
        )
        .await
        .expect("join failed");

    (capabilities, transport_id)
}

// S1: a peer can query router capabilities without joining.
#[actix_rt::test]
async fn solo_capability_query() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);

    let capabilities = a
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .unwrap();
    assert!(capabilities["codecs"].as_array().unwrap().len() >= 2);

    assert!(server.has_room("r"));
    let peer = room.get_peer("a").expect("peer not admitted");
    assert!(!peer.joined());
    assert!(peer.data().transports.is_empty());
}

// S2: joining an empty room replies with no other peers and flips the joined flag.
#[actix_rt::test]
async fn join_before_produce() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let capabilities = a
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .unwrap();

    let reply = a
        .request(
            "join",
            json!({
                "displayName": "A",
                "device": { "name": "test" },
                "rtpCapabilities": capabilities,
                "sctpCapabilities": { "numStreams": { "OS": 1024, "MIS": 1024 } },
            }),
        )
        .await
        .unwrap();

    assert_eq!(reply["peers"], json!([]));
    assert!(room.get_peer("a").unwrap().joined());
    assert!(a.notifications("newPeer").is_empty());

    // Joining twice is an error.
    let error = a
        .request(
            "join",
            json!({
                "displayName": "A",
                "device": {},
                "rtpCapabilities": capabilities,
            }),
        )
        .await
        .unwrap_err();
    assert_eq!(error.0, 500);
}

// S3: producing on one peer creates exactly one consumer on the other.
#[actix_rt::test]
async fn two_peer_video_mesh() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let mut b = TestClient::connect(&room, "b", 2);

    let (_, a_transport) = prepare_peer(&mut a, "A", true, false).await;
    prepare_peer(&mut b, "B", false, true).await;

    // A learns about B joining.
    wait_until("A sees newPeer for b", || {
        !a.notifications("newPeer").is_empty()
    })
    .await;

    a.request(
        "connectWebRtcTransport",
        json!({
            "transportId": a_transport,
            "dtlsParameters": { "role": "client", "fingerprints": [] },
        }),
    )
    .await
    .unwrap();

    let produce_reply = a
        .request(
            "produce",
            json!({
                "transportId": a_transport,
                "kind": "video",
                "rtpParameters": video_rtp_parameters(),
                "appData": { "source": "webcam" },
            }),
        )
        .await
        .unwrap();
    let producer_id = produce_reply["id"].as_str().unwrap().to_string();

    wait_until("B receives newConsumer", || {
        !b.server_requests("newConsumer").is_empty()
    })
    .await;

    let new_consumer = b.server_requests("newConsumer").remove(0);
    assert_eq!(new_consumer["peerId"], "a");
    assert_eq!(new_consumer["producerId"], json!(producer_id));
    assert_eq!(new_consumer["kind"], "video");
    assert_eq!(new_consumer["producerPaused"], false);
    assert_eq!(new_consumer["appData"]["source"], "webcam");
    assert_eq!(new_consumer["appData"]["peerId"], "a");

    let a_peer = room.get_peer("a").unwrap();
    let b_peer = room.get_peer("b").unwrap();
    assert_eq!(a_peer.data().consumers.len(), 0);
    assert_eq!(b_peer.data().consumers.len(), 1);

    // After B acknowledged, the server-side consumer is resumed and a score follows.
    wait_until("server-side consumer resumed", || {
        b_peer
            .data()
            .consumers
            .values()
            .next()
            .map(|consumer| !consumer.paused())
            .unwrap_or(false)
    })
    .await;
    wait_until("B receives consumerScore", || {
        !b.notifications("consumerScore").is_empty()
    })
    .await;
}

// S4: pausing a producer propagates producerPaused to the consumer side only.
#[actix_rt::test]
async fn producer_pause_propagates() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let mut b = TestClient::connect(&room, "b", 2);

    let (_, a_transport) = prepare_peer(&mut a, "A", true, false).await;
    prepare_peer(&mut b, "B", false, true).await;

    let produce_reply = a
        .request(
            "produce",
            json!({
                "transportId": a_transport,
                "kind": "video",
                "rtpParameters": video_rtp_parameters(),
            }),
        )
        .await
        .unwrap();
    let producer_id = produce_reply["id"].as_str().unwrap().to_string();

    let b_peer = room.get_peer("b").unwrap();
    wait_until("consumer created on B", || {
        b_peer.data().consumers.len() == 1
    })
    .await;

    a.request("pauseProducer", json!({ "producerId": producer_id }))
        .await
        .unwrap();

    let a_peer = room.get_peer("a").unwrap();
    assert!(a_peer
        .data()
        .producers
        .values()
        .next()
        .unwrap()
        .paused());

    wait_until("B notified consumerPaused", || {
        !b.notifications("consumerPaused").is_empty()
    })
    .await;

    let consumer = b_peer.data().consumers.values().next().unwrap().clone();
    assert!(consumer.producer_paused());
    assert!(!consumer.paused());
}

// S5: a disconnecting peer tears down its producers and the consumers they feed.
#[actix_rt::test]
async fn peer_disconnect_cascades() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let mut b = TestClient::connect(&room, "b", 2);

    let (_, a_transport) = prepare_peer(&mut a, "A", true, false).await;
    prepare_peer(&mut b, "B", false, true).await;

    a.request(
        "produce",
        json!({
            "transportId": a_transport,
            "kind": "video",
            "rtpParameters": video_rtp_parameters(),
        }),
    )
    .await
    .unwrap();

    let b_peer = room.get_peer("b").unwrap();
    wait_until("consumer created on B", || {
        b_peer.data().consumers.len() == 1
    })
    .await;
    let consumer = b_peer.data().consumers.values().next().unwrap().clone();

    let a_peer = room.get_peer("a").unwrap();
    let producer = a_peer.data().producers.values().next().unwrap().clone();

    a.disconnect();

    wait_until("B notified peerClosed", || {
        b.notifications("peerClosed")
            .iter()
            .any(|data| data["peerId"] == "a")
    })
    .await;

    wait_until("producer closed", || producer.closed()).await;
    wait_until("consumer closed", || consumer.closed()).await;
    wait_until("B notified consumerClosed", || {
        !b.notifications("consumerClosed").is_empty()
    })
    .await;
    wait_until("consumer removed from B", || {
        b_peer.data().consumers.is_empty()
    })
    .await;

    assert!(room.get_peer("a").is_none());
    assert!(!room.closed());
}

// S6: the room closes (and is deregistered) when the last peer leaves.
#[actix_rt::test]
async fn last_peer_leaving_closes_room() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let mut b = TestClient::connect(&room, "b", 2);

    prepare_peer(&mut a, "A", true, false).await;
    prepare_peer(&mut b, "B", false, true).await;

    a.disconnect();
    assert!(!room.closed());

    b.disconnect();

    wait_until("room closed", || room.closed()).await;
    assert!(room.router().closed());
    wait_until("room removed from server", || !server.has_room("r")).await;
}

// Invariant 7 (negative side): a peer that cannot consume a producer gets no consumer.
#[actix_rt::test]
async fn fanout_respects_rtp_capabilities() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let mut b = TestClient::connect(&room, "b", 2);

    let (_, a_transport) = prepare_peer(&mut a, "A", true, false).await;

    // B only understands audio.
    let capabilities = b
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .unwrap();
    b.request(
        "createWebRtcTransport",
        json!({ "forceTcp": false, "producing": false, "consuming": true }),
    )
    .await
    .unwrap();
    b.request(
        "join",
        json!({
            "displayName": "B",
            "device": {},
            "rtpCapabilities": audio_only(&capabilities),
        }),
    )
    .await
    .unwrap();

    a.request(
        "produce",
        json!({
            "transportId": a_transport,
            "kind": "video",
            "rtpParameters": video_rtp_parameters(),
        }),
    )
    .await
    .unwrap();

    // Give the fan-out a chance to (wrongly) run, then check nothing was created.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let b_peer = room.get_peer("b").unwrap();
    assert!(b_peer.data().consumers.is_empty());
    assert!(b.server_requests("newConsumer").is_empty());
}

// A peer joining a room with existing producers consumes them during join.
#[actix_rt::test]
async fn late_joiner_consumes_existing_producers() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let (_, a_transport) = prepare_peer(&mut a, "A", true, false).await;

    a.request(
        "produce",
        json!({
            "transportId": a_transport,
            "kind": "video",
            "rtpParameters": video_rtp_parameters(),
        }),
    )
    .await
    .unwrap();

    let mut c = TestClient::connect(&room, "c", 3);
    prepare_peer(&mut c, "C", false, true).await;

    wait_until("C receives newConsumer", || {
        !c.server_requests("newConsumer").is_empty()
    })
    .await;

    let c_peer = room.get_peer("c").unwrap();
    assert_eq!(c_peer.data().consumers.len(), 1);
}

// A second connection with the same peer id replaces the first one.
#[actix_rt::test]
async fn duplicate_peer_id_closes_incumbent() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut first = TestClient::connect(&room, "a", 1);
    prepare_peer(&mut first, "A", true, true).await;

    let mut second = TestClient::connect(&room, "a", 2);
    second
        .request("getRouterRtpCapabilities", json!({}))
        .await
        .unwrap();

    let peer = room.get_peer("a").unwrap();
    assert_eq!(peer.connection(), ConnectionId(2));
    assert!(!peer.joined());

    // The stale connection going away must not remove the new peer.
    first.disconnect();
    assert!(room.get_peer("a").is_some());
    assert!(!room.closed());
}

// produceData fans a data consumer out to every other joined peer.
#[actix_rt::test]
async fn data_channel_fanout() {
    let server = create_server().await;
    let room = server.get_or_create_room("r").await.unwrap();

    let mut a = TestClient::connect(&room, "a", 1);
    let mut b = TestClient::connect(&room, "b", 2);

    let (_, a_transport) = prepare_peer(&mut a, "A", true, false).await;
    prepare_peer(&mut b, "B", false, true).await;

    let reply = a
        .request(
            "produceData",
            json!({
                "transportId": a_transport,
                "sctpStreamParameters": { "streamId": 0, "ordered": true },
                "label": "chat",
                "protocol": "",
            }),
        )
        .await
        .unwrap();
    assert!(reply["id"].as_str().is_some());

    wait_until("B receives newDataConsumer", || {
        !b.server_requests("newDataConsumer").is_empty()
    })
    .await;

    let new_data_consumer = b.server_requests("newDataConsumer").remove(0);
    assert_eq!(new_data_consumer["peerId"], "a");
    assert_eq!(new_data_consumer["label"], "chat");
    let stream_id = new_data_consumer["sctpStreamParameters"]["streamId"]
        .as_u64()
        .unwrap();
    assert!(stream_id < 1024);

    let b_peer = room.get_peer("b").unwrap();
    assert_eq!(b_peer.data().data_consumers.len(), 1);

    // Stats proxies answer for the new objects as well.
    let data_producer_id = reply["id"].as_str().unwrap();
    a.request(
        "getDataProducerStats",
        json!({ "dataProducerId": data_producer_id }),
    )
    .await
    .unwrap();
}
