use crate::protoo::Message;
use futures::channel::{mpsc, oneshot};
use log::*;
use parking_lot::{Mutex, MutexGuard};
use rainstream_media::prelude::{
    Consumer, ConsumerId, DataConsumer, DataConsumerId, DataProducer, DataProducerId, Producer,
    ProducerId, RtpCapabilities, TransportId, WebRtcTransport,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a server-initiated request may stay unanswered by the client.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Identifies one WebSocket connection; a reconnecting peer gets a new one.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum PeerError {
    #[error("peer closed")]
    Closed,
    #[error("request timeout")]
    RequestTimeout,
    #[error("peer rejected request [errorCode:{error_code}]: {error_reason}")]
    Response {
        error_code: i64,
        error_reason: String,
    },
    #[error("transport send failed")]
    TransportSend,
}

/// Media state of one client session, owned by the room actor handling the peer.
#[derive(Default)]
pub struct PeerData {
    pub consume: bool,
    pub joined: bool,
    pub display_name: String,
    pub device: Value,
    pub rtp_capabilities: Option<RtpCapabilities>,
    pub sctp_capabilities: Option<Value>,
    pub transports: HashMap<TransportId, WebRtcTransport>,
    pub producers: HashMap<ProducerId, Producer>,
    pub consumers: HashMap<ConsumerId, Consumer>,
    pub data_producers: HashMap<DataProducerId, DataProducer>,
    pub data_consumers: HashMap<DataConsumerId, DataConsumer>,
}

struct Shared {
    id: String,
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
    next_request_id: Mutex<u32>,
    requests: Mutex<HashMap<u32, oneshot::Sender<Result<Value, PeerError>>>>,
    data: Mutex<PeerData>,
}

/// One client session within a room: its WebSocket, its pending-request table and the media
/// objects it owns.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<Shared>,
}

impl Peer {
    pub fn new(id: String, connection: ConnectionId, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                connection,
                sender,
                closed: AtomicBool::new(false),
                next_request_id: Mutex::new(0),
                requests: Mutex::default(),
                data: Mutex::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.shared.connection
    }

    pub fn closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn joined(&self) -> bool {
        self.shared.data.lock().joined
    }

    /// Media state of the peer. The guard must not be held across await points.
    pub fn data(&self) -> MutexGuard<'_, PeerData> {
        self.shared.data.lock()
    }

    /// Serialise and enqueue one envelope on the WebSocket.
    pub fn send(&self, message: &Message) -> Result<(), PeerError> {
        if self.closed() {
            return Err(PeerError::Closed);
        }

        self.shared
            .sender
            .unbounded_send(message.to_json())
            .map_err(|_| PeerError::TransportSend)
    }

    /// Fire-and-forget notification.
    pub fn notify(&self, method: &str, data: Value) -> Result<(), PeerError> {
        self.send(&Message::Notification {
            method: method.to_string(),
            data,
        })
    }

    /// Send a request to the client and await its response (20 s timeout).
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, PeerError> {
        if self.closed() {
            return Err(PeerError::Closed);
        }

        let id = {
            let mut next_request_id = self.shared.next_request_id.lock();
            if *next_request_id < u32::MAX {
                *next_request_id += 1;
            } else {
                *next_request_id = 1;
            }
            *next_request_id
        };

        debug!("request() [method:{}, id:{}, peerId:{}]", method, id, self.shared.id);

        let (result_sender, result_receiver) = oneshot::channel();
        self.shared.requests.lock().insert(id, result_sender);

        let message = Message::Request {
            id,
            method: method.to_string(),
            data,
        };
        if let Err(error) = self.send(&message) {
            self.shared.requests.lock().remove(&id);
            return Err(error);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, result_receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::Closed),
            Err(_) => {
                self.shared.requests.lock().remove(&id);
                Err(PeerError::RequestTimeout)
            }
        }
    }

    /// Route a response envelope received from the client to its pending request.
    pub fn handle_response(&self, message: Message) {
        let (id, result) = match message {
            Message::ResponseSuccess { id, data } => (id, Ok(data)),
            Message::ResponseError {
                id,
                error_code,
                error_reason,
            } => (
                id,
                Err(PeerError::Response {
                    error_code,
                    error_reason,
                }),
            ),
            _ => return,
        };

        match self.shared.requests.lock().remove(&id) {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                warn!(
                    "received response does not match any sent request [id:{}, peerId:{}]",
                    id, self.shared.id,
                );
            }
        }
    }

    /// Mark the peer closed and reject everything still pending. Transports are closed by the
    /// room, which owns the cascade.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!("close() [peerId:{}]", self.shared.id);

            let requests = std::mem::take(&mut *self.shared.requests.lock());
            for (_, sender) in requests {
                let _ = sender.send(Err(PeerError::Closed));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn set_next_request_id(&self, next_request_id: u32) {
        *self.shared.next_request_id.lock() = next_request_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn create_peer() -> (Peer, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded();
        (Peer::new("alice".to_string(), ConnectionId(1), sender), receiver)
    }

    #[actix_rt::test]
    async fn request_resolves_with_client_response() {
        let (peer, mut receiver) = create_peer();

        let request_fut = peer.request("newConsumer", json!({ "kind": "video" }));
        let responder = async {
            let raw = receiver.next().await.unwrap();
            let message = Message::parse(&raw).unwrap();
            match message {
                Message::Request { id, method, .. } => {
                    assert_eq!(method, "newConsumer");
                    peer.handle_response(Message::ResponseSuccess {
                        id,
                        data: json!({}),
                    });
                }
                _ => panic!("expected request envelope"),
            }
        };

        let (result, ()) = futures::join!(request_fut, responder);
        assert_eq!(result.unwrap(), json!({}));
    }

    #[actix_rt::test]
    async fn request_rejects_with_client_error() {
        let (peer, mut receiver) = create_peer();

        let request_fut = peer.request("newConsumer", json!({}));
        let responder = async {
            let raw = receiver.next().await.unwrap();
            if let Message::Request { id, .. } = Message::parse(&raw).unwrap() {
                peer.handle_response(Message::ResponseError {
                    id,
                    error_code: 403,
                    error_reason: "nope".to_string(),
                });
            }
        };

        let (result, ()) = futures::join!(request_fut, responder);
        assert_eq!(
            result.unwrap_err(),
            PeerError::Response {
                error_code: 403,
                error_reason: "nope".to_string(),
            },
        );
    }

    #[actix_rt::test]
    async fn close_rejects_pending_requests() {
        let (peer, _receiver) = create_peer();

        let request_fut = peer.request("newConsumer", json!({}));
        let closer = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            peer.close();
        };

        let (result, ()) = futures::join!(request_fut, closer);
        assert_eq!(result.unwrap_err(), PeerError::Closed);

        // Requests after close fail immediately.
        let result = peer.request("newConsumer", json!({})).await;
        assert_eq!(result.unwrap_err(), PeerError::Closed);
    }

    #[actix_rt::test]
    async fn request_ids_wrap_to_one() {
        let (peer, mut receiver) = create_peer();
        peer.set_next_request_id(u32::MAX - 1);

        for expected_id in [u32::MAX, 1] {
            let request_fut = peer.request("ping", json!({}));
            let responder = async {
                let raw = receiver.next().await.unwrap();
                if let Message::Request { id, .. } = Message::parse(&raw).unwrap() {
                    assert_eq!(id, expected_id);
                    peer.handle_response(Message::ResponseSuccess {
                        id,
                        data: json!({}),
                    });
                }
            };
            let (result, ()) = futures::join!(request_fut, responder);
            result.unwrap();
        }
    }

    #[actix_rt::test]
    async fn unknown_response_ids_are_dropped() {
        let (peer, _receiver) = create_peer();

        // Must not panic or affect anything.
        peer.handle_response(Message::ResponseSuccess {
            id: 12345,
            data: json!({}),
        });
    }
}
