use crate::messages::Request;
use async_executor::Executor;
use async_fs::File;
use async_io::Timer;
use futures_lite::io::BufReader;
use futures_lite::{future, AsyncReadExt, AsyncWriteExt};
use log::*;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;

// Limits of the length-prefixed framing (4 MiB payload).
pub(crate) const PAYLOAD_MAX_LEN: usize = 4_194_304;
pub(crate) const MESSAGE_MAX_LEN: usize = PAYLOAD_MAX_LEN + 4;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum RequestError {
    #[error("channel already closed")]
    ChannelClosed,
    #[error("request timed out")]
    RequestTimeout,
    #[error("request too big")]
    RequestTooBig,
    #[error("received response error: {reason}")]
    Response { reason: String },
    #[error("received response type error: {reason}")]
    TypeError { reason: String },
    #[error("failed to parse response from worker: {error}")]
    FailedToParse { error: String },
}

/// Messages the worker emits on the channel that are not responses or object notifications.
#[derive(Debug)]
pub(crate) enum InternalMessage {
    /// Debug log line.
    Debug(String),
    /// Warning log line.
    Warn(String),
    /// Error log line.
    Error(String),
    /// Dump log line.
    Dump(String),
    /// Unknown frame.
    Unexpected(Vec<u8>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationFrame {
    target_id: String,
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChannelReceiveMessage {
    #[serde(rename_all = "camelCase")]
    ResponseSuccess {
        id: u32,
        #[allow(dead_code)]
        accepted: bool,
        #[serde(default)]
        data: Option<Value>,
    },
    ResponseError {
        id: u32,
        error: String,
        reason: String,
    },
    Notification(NotificationFrame),
}

fn deserialize_message(bytes: &[u8]) -> Option<InternalMessage> {
    match bytes.first() {
        Some(b'{') => None,
        Some(b'D') => Some(InternalMessage::Debug(
            String::from_utf8_lossy(&bytes[1..]).into_owned(),
        )),
        Some(b'W') => Some(InternalMessage::Warn(
            String::from_utf8_lossy(&bytes[1..]).into_owned(),
        )),
        Some(b'E') => Some(InternalMessage::Error(
            String::from_utf8_lossy(&bytes[1..]).into_owned(),
        )),
        Some(b'X') => Some(InternalMessage::Dump(
            String::from_utf8_lossy(&bytes[1..]).into_owned(),
        )),
        _ => Some(InternalMessage::Unexpected(bytes.to_vec())),
    }
}

type NotificationCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

#[derive(Default)]
struct EventHandlers {
    next_token: usize,
    handlers: HashMap<String, Vec<(usize, NotificationCallback)>>,
}

impl EventHandlers {
    fn add(&mut self, target_id: String, callback: NotificationCallback) -> usize {
        let token = self.next_token;
        self.next_token += 1;
        self.handlers
            .entry(target_id)
            .or_default()
            .push((token, callback));
        token
    }

    fn remove(&mut self, target_id: &str, token: usize) {
        if let Some(callbacks) = self.handlers.get_mut(target_id) {
            callbacks.retain(|(candidate, _)| *candidate != token);
            if callbacks.is_empty() {
                self.handlers.remove(target_id);
            }
        }
    }

    fn get(&self, target_id: &str) -> Vec<NotificationCallback> {
        self.handlers
            .get(target_id)
            .map(|callbacks| {
                callbacks
                    .iter()
                    .map(|(_, callback)| Arc::clone(callback))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Removes the subscription when dropped.
pub struct SubscriptionHandler {
    event_handlers: Weak<Mutex<EventHandlers>>,
    target_id: String,
    token: usize,
}

impl Drop for SubscriptionHandler {
    fn drop(&mut self) {
        if let Some(event_handlers) = self.event_handlers.upgrade() {
            event_handlers.lock().remove(&self.target_id, self.token);
        }
    }
}

struct RequestsContainer {
    next_id: u32,
    senders: HashMap<u32, async_oneshot::Sender<Result<Value, RequestError>>>,
}

impl Default for RequestsContainer {
    fn default() -> Self {
        Self {
            next_id: 0,
            senders: HashMap::new(),
        }
    }
}

struct Inner {
    sender: async_channel::Sender<Vec<u8>>,
    internal_message_receiver: async_channel::Receiver<InternalMessage>,
    requests_container: Arc<Mutex<RequestsContainer>>,
    event_handlers: Arc<Mutex<EventHandlers>>,
    closed: Arc<AtomicBool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            reject_pending_requests(&self.requests_container);
            self.sender.close();
        }
    }
}

fn reject_pending_requests(requests_container: &Mutex<RequestsContainer>) {
    let senders = std::mem::take(&mut requests_container.lock().senders);
    for (_, mut sender) in senders {
        let _ = sender.send(Err(RequestError::ChannelClosed));
    }
}

/// Request/response and notification pipe to the worker, correlated by numeric request id.
#[derive(Clone)]
pub(crate) struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub(super) fn new(executor: Arc<Executor<'static>>, reader: File, writer: File) -> Self {
        let requests_container = Arc::<Mutex<RequestsContainer>>::default();
        let event_handlers = Arc::<Mutex<EventHandlers>>::default();
        let closed = Arc::new(AtomicBool::new(false));

        let internal_message_receiver = {
            let (sender, receiver) = async_channel::unbounded();
            let requests_container = Arc::clone(&requests_container);
            let event_handlers = Arc::clone(&event_handlers);
            let closed = Arc::clone(&closed);

            executor
                .spawn(async move {
                    let mut reader = BufReader::new(reader);
                    let mut len_bytes = [0u8; 4];
                    let mut bytes = Vec::new();

                    loop {
                        if reader.read_exact(&mut len_bytes).await.is_err() {
                            break;
                        }
                        let length = u32::from_le_bytes(len_bytes) as usize;

                        if length > PAYLOAD_MAX_LEN {
                            error!(
                                "received {} bytes payload, max supported is {}, discarding",
                                length, PAYLOAD_MAX_LEN,
                            );
                            if skip_payload(&mut reader, length).await.is_err() {
                                break;
                            }
                            continue;
                        }

                        if length == 0 {
                            continue;
                        }

                        bytes.resize(length, 0);
                        if reader.read_exact(&mut bytes).await.is_err() {
                            break;
                        }

                        match deserialize_message(&bytes) {
                            Some(internal_message) => {
                                let _ = sender.send(internal_message).await;
                            }
                            None => {
                                process_json_message(&bytes, &requests_container, &event_handlers);
                            }
                        }
                    }

                    closed.store(true, Ordering::SeqCst);
                    reject_pending_requests(&requests_container);
                })
                .detach();

            receiver
        };

        let sender = {
            let (sender, receiver) = async_channel::bounded::<Vec<u8>>(1);
            let mut writer = writer;

            executor
                .spawn(async move {
                    let mut bytes = Vec::with_capacity(MESSAGE_MAX_LEN);
                    while let Ok(message) = receiver.recv().await {
                        bytes.clear();
                        bytes.extend_from_slice(&(message.len() as u32).to_le_bytes());
                        bytes.extend_from_slice(&message);

                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }

                    std::io::Result::Ok(())
                })
                .detach();

            sender
        };

        Self {
            inner: Arc::new(Inner {
                sender,
                internal_message_receiver,
                requests_container,
                event_handlers,
                closed,
            }),
        }
    }

    pub(super) fn get_internal_message_receiver(&self) -> async_channel::Receiver<InternalMessage> {
        self.inner.internal_message_receiver.clone()
    }

    pub(crate) async fn request<R: Request>(&self, request: R) -> Result<R::Response, RequestError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RequestError::ChannelClosed);
        }

        let (result_sender, result_receiver) = async_oneshot::oneshot();

        let id = {
            let mut requests_container = self.inner.requests_container.lock();

            if requests_container.next_id < u32::MAX {
                requests_container.next_id += 1;
            } else {
                requests_container.next_id = 1;
            }
            let id = requests_container.next_id;
            requests_container.senders.insert(id, result_sender);

            id
        };

        let method = request.as_method();

        debug!("request() [method:{}, id:{}]", method, id);

        let handler_id = request
            .handler_id()
            .unwrap_or_else(|| "undefined".to_string());
        let payload = match serde_json::to_string(&request) {
            Ok(payload) => payload,
            Err(error) => {
                self.inner.requests_container.lock().senders.remove(&id);
                return Err(RequestError::FailedToParse {
                    error: error.to_string(),
                });
            }
        };

        let message = format!("{}:{}:{}:{}", id, method, handler_id, payload);
        if message.len() > MESSAGE_MAX_LEN {
            self.inner.requests_container.lock().senders.remove(&id);
            return Err(RequestError::RequestTooBig);
        }

        if self.inner.sender.send(message.into_bytes()).await.is_err() {
            self.inner.requests_container.lock().senders.remove(&id);
            return Err(RequestError::ChannelClosed);
        }

        let result = future::or(
            async { result_receiver.await.map_err(|_| RequestError::ChannelClosed)? },
            async {
                Timer::after(REQUEST_TIMEOUT).await;
                Err(RequestError::RequestTimeout)
            },
        )
        .await;

        let data = match result {
            Ok(data) => data,
            Err(error) => {
                self.inner.requests_container.lock().senders.remove(&id);
                return Err(error);
            }
        };

        serde_json::from_value(data).map_err(|error| RequestError::FailedToParse {
            error: error.to_string(),
        })
    }

    /// Subscribe to notifications the worker emits for the given target id.
    ///
    /// Returns `None` if the channel is already closed. The subscription lives until the
    /// returned handler is dropped.
    pub(crate) fn subscribe_to_notifications<F>(
        &self,
        target_id: String,
        callback: F,
    ) -> Option<SubscriptionHandler>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }

        let token = self
            .inner
            .event_handlers
            .lock()
            .add(target_id.clone(), Arc::new(callback));

        Some(SubscriptionHandler {
            event_handlers: Arc::downgrade(&self.inner.event_handlers),
            target_id,
            token,
        })
    }

    pub(crate) fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.inner.close();
    }

    #[cfg(test)]
    pub(crate) fn set_next_request_id(&self, next_id: u32) {
        self.inner.requests_container.lock().next_id = next_id;
    }
}

async fn skip_payload(
    reader: &mut BufReader<File>,
    mut remaining: usize,
) -> std::io::Result<()> {
    let mut scratch = [0u8; 8192];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len());
        reader.read_exact(&mut scratch[..chunk]).await?;
        remaining -= chunk;
    }
    Ok(())
}

fn process_json_message(
    bytes: &[u8],
    requests_container: &Mutex<RequestsContainer>,
    event_handlers: &Mutex<EventHandlers>,
) {
    match serde_json::from_slice::<ChannelReceiveMessage>(bytes) {
        Ok(ChannelReceiveMessage::ResponseSuccess { id, data, .. }) => {
            match requests_container.lock().senders.remove(&id) {
                Some(mut sender) => {
                    let _ = sender.send(Ok(data.unwrap_or_default()));
                }
                None => {
                    debug!("received success response does not match any sent request [id:{}]", id);
                }
            }
        }
        Ok(ChannelReceiveMessage::ResponseError { id, error, reason }) => {
            match requests_container.lock().senders.remove(&id) {
                Some(mut sender) => {
                    let result = if error == "TypeError" {
                        Err(RequestError::TypeError { reason })
                    } else {
                        Err(RequestError::Response { reason })
                    };
                    let _ = sender.send(result);
                }
                None => {
                    debug!("received error response does not match any sent request [id:{}]", id);
                }
            }
        }
        Ok(ChannelReceiveMessage::Notification(notification)) => {
            let callbacks = event_handlers.lock().get(&notification.target_id);
            if callbacks.is_empty() {
                debug!(
                    "received notification for unknown targetId [targetId:{}, event:{}]",
                    notification.target_id, notification.event,
                );
                return;
            }

            let message = serde_json::json!({
                "event": notification.event,
                "data": notification.data,
            });
            for callback in callbacks {
                callback(message.clone());
            }
        }
        Err(error) => {
            warn!(
                "failed to parse channel message: {} [message:{}]",
                error,
                String::from_utf8_lossy(bytes),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::TransportInternal;
    use crate::messages::{TransportConnectData, TransportConnectRequest, WorkerDumpRequest};
    use crate::router::transport::TransportId;
    use crate::router::RouterId;
    use crate::worker::WorkerDump;
    use std::io::{Read, Write};
    use std::os::unix::io::FromRawFd;
    use std::thread;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct PeerEnd {
        reader: std::fs::File,
        writer: std::fs::File,
    }

    impl PeerEnd {
        fn read_frame(&mut self) -> Option<String> {
            let mut len_bytes = [0u8; 4];
            self.reader.read_exact(&mut len_bytes).ok()?;
            let mut payload = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
            self.reader.read_exact(&mut payload).ok()?;
            Some(String::from_utf8(payload).unwrap())
        }

        fn write_frame(&mut self, payload: &[u8]) {
            self.writer
                .write_all(&(payload.len() as u32).to_le_bytes())
                .unwrap();
            self.writer.write_all(payload).unwrap();
        }

        fn write_raw(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).unwrap();
        }
    }

    fn create_channel() -> (Channel, PeerEnd, Arc<Executor<'static>>) {
        init();

        let executor = Arc::new(Executor::new());
        {
            let executor = Arc::clone(&executor);
            let (_sender, receiver) = async_oneshot::oneshot::<()>();
            thread::spawn(move || {
                let _ = future::block_on(executor.run(receiver));
            });
        }

        let (to_channel_read, to_channel_write) = nix::unistd::pipe().unwrap();
        let (from_channel_read, from_channel_write) = nix::unistd::pipe().unwrap();

        let reader: File = unsafe { std::fs::File::from_raw_fd(to_channel_read) }.into();
        let writer: File = unsafe { std::fs::File::from_raw_fd(from_channel_write) }.into();

        let channel = Channel::new(Arc::clone(&executor), reader, writer);

        let peer = PeerEnd {
            reader: unsafe { std::fs::File::from_raw_fd(from_channel_read) },
            writer: unsafe { std::fs::File::from_raw_fd(to_channel_write) },
        };

        (channel, peer, executor)
    }

    #[test]
    fn request_resolves_with_response_data() {
        let (channel, mut peer, _executor) = create_channel();

        let peer_thread = thread::spawn(move || {
            let frame = peer.read_frame().unwrap();
            assert!(frame.starts_with("1:worker.dump:undefined:"));
            peer.write_frame(
                br#"{"id":1,"accepted":true,"data":{"pid":1234,"routerIds":[]}}"#,
            );
            peer
        });

        let dump = future::block_on(channel.request(WorkerDumpRequest {})).unwrap();
        assert_eq!(dump.pid, 1234);
        assert!(dump.router_ids.is_empty());

        peer_thread.join().unwrap();
    }

    #[test]
    fn request_rejects_on_error_response() {
        let (channel, mut peer, _executor) = create_channel();

        let peer_thread = thread::spawn(move || {
            let _ = peer.read_frame().unwrap();
            peer.write_frame(br#"{"id":1,"error":"Error","reason":"not found"}"#);
            peer
        });

        let result = future::block_on(channel.request(WorkerDumpRequest {}));
        assert_eq!(
            result.unwrap_err(),
            RequestError::Response {
                reason: "not found".to_string()
            },
        );

        peer_thread.join().unwrap();
    }

    #[test]
    fn responses_are_correlated_by_id_not_order() {
        let (channel, mut peer, _executor) = create_channel();

        let peer_thread = thread::spawn(move || {
            let first = peer.read_frame().unwrap();
            let second = peer.read_frame().unwrap();
            assert!(first.starts_with("1:"));
            assert!(second.starts_with("2:"));
            // Reply to the second request first.
            peer.write_frame(br#"{"id":2,"accepted":true,"data":{"pid":2,"routerIds":[]}}"#);
            peer.write_frame(br#"{"id":1,"accepted":true,"data":{"pid":1,"routerIds":[]}}"#);
            peer
        });

        let (first, second) = future::block_on(future::zip(
            channel.request(WorkerDumpRequest {}),
            channel.request(WorkerDumpRequest {}),
        ));
        assert_eq!(first.unwrap().pid, 1);
        assert_eq!(second.unwrap().pid, 2);

        peer_thread.join().unwrap();
    }

    #[test]
    fn request_id_wraps_to_one() {
        let (channel, mut peer, _executor) = create_channel();
        channel.set_next_request_id(u32::MAX - 1);

        let peer_thread = thread::spawn(move || {
            let first = peer.read_frame().unwrap();
            assert!(first.starts_with("4294967295:"));
            peer.write_frame(
                br#"{"id":4294967295,"accepted":true,"data":{"pid":1,"routerIds":[]}}"#,
            );
            let second = peer.read_frame().unwrap();
            assert!(second.starts_with("1:"));
            peer.write_frame(br#"{"id":1,"accepted":true,"data":{"pid":1,"routerIds":[]}}"#);
            peer
        });

        future::block_on(async {
            channel.request(WorkerDumpRequest {}).await.unwrap();
            channel.request(WorkerDumpRequest {}).await.unwrap();
        });

        peer_thread.join().unwrap();
    }

    #[test]
    fn notifications_are_dispatched_by_target_id() {
        let (channel, mut peer, _executor) = create_channel();

        let (notified_sender, notified_receiver) = async_oneshot::oneshot();
        let notified_sender = Mutex::new(Some(notified_sender));
        let _handler = channel
            .subscribe_to_notifications("some-target".to_string(), move |notification| {
                if let Some(mut sender) = notified_sender.lock().take() {
                    let _ = sender.send(notification);
                }
            })
            .unwrap();

        // One unknown-target notification (dropped) and one subscribed, in a single write.
        let mut combined = Vec::new();
        for payload in [
            br#"{"targetId":"other","event":"score","data":5}"#.as_ref(),
            br#"{"targetId":"some-target","event":"score","data":7}"#.as_ref(),
        ] {
            combined.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            combined.extend_from_slice(payload);
        }
        peer.write_raw(&combined);

        let notification = future::block_on(notified_receiver).unwrap();
        assert_eq!(notification["event"], "score");
        assert_eq!(notification["data"], 7);
    }

    #[test]
    fn zero_length_frames_are_tolerated() {
        let (channel, mut peer, _executor) = create_channel();

        let (notified_sender, notified_receiver) = async_oneshot::oneshot();
        let notified_sender = Mutex::new(Some(notified_sender));
        let _handler = channel
            .subscribe_to_notifications("t".to_string(), move |notification| {
                if let Some(mut sender) = notified_sender.lock().take() {
                    let _ = sender.send(notification);
                }
            })
            .unwrap();

        peer.write_frame(b"");
        peer.write_frame(br#"{"targetId":"t","event":"running"}"#);

        let notification = future::block_on(notified_receiver).unwrap();
        assert_eq!(notification["event"], "running");
    }

    #[test]
    fn close_rejects_pending_and_subsequent_requests() {
        let (channel, mut peer, _executor) = create_channel();

        let peer_thread = thread::spawn(move || {
            // Swallow the request, never reply.
            let _ = peer.read_frame().unwrap();
            peer
        });

        let result = future::block_on(async {
            let request = channel.request(WorkerDumpRequest {});
            let closer = async {
                // Give the request a chance to be written out first.
                Timer::after(Duration::from_millis(100)).await;
                channel.close();
                future::pending::<Result<WorkerDump, RequestError>>().await
            };
            future::or(request, closer).await
        });
        assert_eq!(result.unwrap_err(), RequestError::ChannelClosed);

        let after_close = future::block_on(channel.request(WorkerDumpRequest {}));
        assert_eq!(after_close.unwrap_err(), RequestError::ChannelClosed);

        peer_thread.join().unwrap();
    }

    #[test]
    fn peer_eof_rejects_pending_requests() {
        let (channel, peer, _executor) = create_channel();

        let result = future::block_on(async {
            let request = async { channel.request(WorkerDumpRequest {}).await };
            let dropper = async {
                Timer::after(Duration::from_millis(100)).await;
                drop(peer);
                future::pending::<Result<WorkerDump, RequestError>>().await
            };
            future::or(request, dropper).await
        });
        assert_eq!(result.unwrap_err(), RequestError::ChannelClosed);
    }

    #[test]
    fn oversized_request_fails_without_being_sent() {
        let (channel, mut peer, _executor) = create_channel();

        let request = TransportConnectRequest {
            internal: TransportInternal {
                router_id: RouterId::new(),
                transport_id: TransportId::new(),
            },
            data: TransportConnectData {
                dtls_parameters: Value::String("x".repeat(MESSAGE_MAX_LEN)),
            },
        };
        let result = future::block_on(channel.request(request));
        assert_eq!(result.unwrap_err(), RequestError::RequestTooBig);

        // The channel stays usable and nothing was written out for the oversized request.
        let peer_thread = thread::spawn(move || {
            let frame = peer.read_frame().unwrap();
            assert!(frame.starts_with("2:worker.dump:undefined:"));
            peer.write_frame(br#"{"id":2,"accepted":true,"data":{"pid":1,"routerIds":[]}}"#);
            peer
        });

        future::block_on(channel.request(WorkerDumpRequest {})).unwrap();
        peer_thread.join().unwrap();
    }
}
