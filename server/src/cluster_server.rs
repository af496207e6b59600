//! Inbound signaling endpoint: terminates client WebSockets, dispatches them into rooms, and
//! owns the media worker pool.

use crate::protoo::{ConnectionId, Message, Request};
use crate::room::{ConnectionHandle, Room, RoomCreateError};
use crate::settings::{Settings, TlsSettings};
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use actix_web_actors::ws;
use futures::channel::mpsc;
use log::*;
use parking_lot::Mutex;
use rainstream_media::prelude::{Worker, WorkerManager};
use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner {
    settings: Arc<Settings>,
    workers: Vec<Worker>,
    next_worker: AtomicUsize,
    rooms: Mutex<HashMap<String, Room>>,
    next_connection: AtomicU64,
}

/// The server hosting rooms and client WebSocket sessions.
#[derive(Clone)]
pub struct ClusterServer {
    inner: Arc<Inner>,
}

impl ClusterServer {
    pub async fn new(
        settings: Arc<Settings>,
        worker_manager: WorkerManager,
    ) -> anyhow::Result<Self> {
        let num_workers = settings.worker.num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let worker = worker_manager
                .create_worker(settings.worker_settings())
                .await?;

            let pid = worker.pid();
            worker
                .on_died(move |exit_error| {
                    error!("media worker died [pid:{}]: {}", pid, exit_error);
                })
                .detach();

            info!("media worker created [pid:{}]", worker.pid());
            workers.push(worker);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                workers,
                next_worker: AtomicUsize::new(0),
                rooms: Mutex::default(),
                next_connection: AtomicU64::new(0),
            }),
        })
    }

    /// Workers are handed out round-robin, one per new room.
    pub fn get_media_worker(&self) -> &Worker {
        let index = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
        &self.inner.workers[index % self.inner.workers.len()]
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.inner.rooms.lock().contains_key(room_id)
    }

    pub async fn get_or_create_room(&self, room_id: &str) -> Result<Room, RoomCreateError> {
        if let Some(room) = self.inner.rooms.lock().get(room_id) {
            return Ok(room.clone());
        }

        let room = Room::new(
            room_id.to_string(),
            self.get_media_worker(),
            Arc::clone(&self.inner.settings),
        )
        .await?;

        let mut rooms = self.inner.rooms.lock();
        match rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => {
                // Somebody else raced us; keep theirs.
                room.close();
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                entry.insert(room.clone());

                let inner_weak = Arc::downgrade(&self.inner);
                let room_id = room_id.to_string();
                room.on_close(move || {
                    if let Some(inner) = inner_weak.upgrade() {
                        let mut rooms = inner.rooms.lock();
                        if rooms.get(&room_id).map(Room::closed) == Some(true) {
                            debug!("removing closed room [roomId:{}]", room_id);
                            rooms.remove(&room_id);
                        }
                    }
                })
                .detach();

                info!("room created [roomId:{}]", room.id());
                Ok(room)
            }
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Bind and serve until stopped.
    pub async fn run(self) -> anyhow::Result<()> {
        let (ip, port) = self.inner.settings.listen_addr();
        let tls_config = load_rustls_config(&self.inner.settings.tls)?;

        let data = web::Data::new(self);
        let http_server = HttpServer::new({
            let data = data.clone();
            move || {
                App::new()
                    .app_data(data.clone())
                    .route("/", web::get().to(ws_index))
            }
        });

        info!(
            "cluster server listening on {}:{} [tls:{}]",
            ip,
            port,
            tls_config.is_some(),
        );

        let http_server = match tls_config {
            Some(tls_config) => http_server.bind_rustls((ip.as_str(), port), tls_config)?,
            None => http_server.bind((ip.as_str(), port))?,
        };

        http_server.run().await?;

        Ok(())
    }
}

fn load_rustls_config(tls: &TlsSettings) -> anyhow::Result<Option<rustls::ServerConfig>> {
    let (certificate_file, private_key_file) =
        match (&tls.certificate_file, &tls.private_key_file) {
            (Some(certificate_file), Some(private_key_file)) => {
                (certificate_file, private_key_file)
            }
            _ => return Ok(None),
        };

    let certificates = rustls_pemfile::certs(&mut BufReader::new(File::open(certificate_file)?))?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();

    let key = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(
        private_key_file,
    )?))?
    .into_iter()
    .next()
    .map(rustls::PrivateKey)
    .ok_or_else(|| anyhow::anyhow!("no PKCS#8 private key found in {:?}", private_key_file))?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certificates, key)?;

    Ok(Some(config))
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "roomId")]
    room_id: String,
    // Older builds used peerName.
    #[serde(rename = "peerId", alias = "peerName")]
    peer_id: String,
}

async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    server: web::Data<ClusterServer>,
) -> actix_web::Result<HttpResponse> {
    let query = match web::Query::<ConnectQuery>::from_query(req.query_string()) {
        Ok(query) => query.into_inner(),
        Err(_) => {
            warn!("connection request without roomId and/or peerId");
            return Ok(HttpResponse::BadRequest().body("missing roomId or peerId"));
        }
    };

    let offered_protocols = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !offered_protocols
        .split(',')
        .map(str::trim)
        .any(|protocol| protocol == "protoo")
    {
        warn!(
            "connection request with invalid sub-protocol(s): {}",
            offered_protocols,
        );
        return Ok(HttpResponse::Forbidden().body("invalid sub-protocol"));
    }

    debug!(
        "connection request [roomId:{}, peerId:{}]",
        query.room_id, query.peer_id,
    );

    let room = server
        .get_or_create_room(&query.room_id)
        .await
        .map_err(|error| actix_web::error::ErrorInternalServerError(error.to_string()))?;

    ws::WsResponseBuilder::new(
        PeerConnection::new(room, query.peer_id, server.next_connection_id()),
        &req,
        stream,
    )
    .protocols(&["protoo"])
    .start()
}

/// One client WebSocket; parses envelopes and hands them to the room.
struct PeerConnection {
    room: Room,
    peer_id: String,
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<String>,
    receiver: Option<mpsc::UnboundedReceiver<String>>,
}

impl PeerConnection {
    fn new(room: Room, peer_id: String, connection: ConnectionId) -> Self {
        let (sender, receiver) = mpsc::unbounded();

        Self {
            room,
            peer_id,
            connection,
            sender,
            receiver: Some(receiver),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match Message::parse(text) {
            Ok(Message::Request { id, method, data }) => {
                let request = Request::new(id, method, data, self.sender.clone());
                let conn = ConnectionHandle {
                    peer_id: self.peer_id.clone(),
                    connection: self.connection,
                    sender: self.sender.clone(),
                };
                let room = self.room.clone();

                // Requests are dispatched in arrival order but run concurrently, the same as
                // on a single-threaded event loop: a request awaiting the worker (or the
                // client itself) must not block responses arriving on this socket.
                ctx.spawn(actix::fut::wrap_future::<_, Self>(async move {
                    room.handle_protoo_request(conn, request).await;
                }));
            }
            Ok(message @ (Message::ResponseSuccess { .. } | Message::ResponseError { .. })) => {
                self.room.handle_protoo_response(&self.peer_id, message);
            }
            Ok(Message::Notification { method, data }) => {
                self.room
                    .handle_protoo_notification(&self.peer_id, &method, data);
            }
            Err(error) => {
                warn!(
                    "malformed protoo message [peerId:{}]: {}",
                    self.peer_id, error,
                );
            }
        }
    }
}

impl Actor for PeerConnection {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("websocket connected [peerId:{}]", self.peer_id);

        if let Some(receiver) = self.receiver.take() {
            ctx.add_stream(receiver);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!("websocket disconnected [peerId:{}]", self.peer_id);

        self.room
            .handle_connection_closed(&self.peer_id, self.connection);
    }
}

/// Outbound envelopes queued by the room and its peers.
impl StreamHandler<String> for PeerConnection {
    fn handle(&mut self, text: String, ctx: &mut Self::Context) {
        ctx.text(text);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PeerConnection {
    fn handle(&mut self, message: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match message {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Ping(bytes)) => ctx.pong(&bytes),
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => {}
            Err(error) => {
                warn!("websocket protocol error [peerId:{}]: {}", self.peer_id, error);
                ctx.stop();
            }
        }
    }
}
