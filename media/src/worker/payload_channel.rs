use crate::messages::Notification;
use crate::worker::channel::{MESSAGE_MAX_LEN, PAYLOAD_MAX_LEN};
use async_executor::Executor;
use async_fs::File;
use bytes::Bytes;
use futures_lite::io::BufReader;
use futures_lite::{AsyncReadExt, AsyncWriteExt};
use log::*;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum NotificationError {
    #[error("channel already closed")]
    ChannelClosed,
    #[error("notification too big")]
    MessageTooLong,
    #[error("failed to serialize notification: {error}")]
    FailedToSerialize { error: String },
}

/// Notification received on the payload channel: decoded JSON header plus payload bytes.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub message: Value,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationHeader {
    target_id: String,
    event: String,
    #[serde(default)]
    data: Value,
}

type NotificationCallback = Arc<dyn Fn(NotificationMessage) + Send + Sync + 'static>;

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
pub struct PayloadSubscriptionHandler {
    event_handlers: Weak<Mutex<EventHandlers>>,
    target_id: String,
    token: usize,
}

impl Drop for PayloadSubscriptionHandler {
    fn drop(&mut self) {
        if let Some(event_handlers) = self.event_handlers.upgrade() {
            event_handlers.lock().remove(&self.target_id, self.token);
        }
    }
}

struct Inner {
    sender: async_channel::Sender<Vec<u8>>,
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
            self.sender.close();
        }
    }
}

/// Companion pipe to [`Channel`](super::channel::Channel) carrying bulk payloads.
///
/// Every logical unit is a pair of frames: a JSON header followed by the payload bytes, even
/// when the payload is empty.
#[derive(Clone)]
pub(crate) struct PayloadChannel {
    inner: Arc<Inner>,
}

impl PayloadChannel {
    pub(super) fn new(executor: Arc<Executor<'static>>, reader: File, writer: File) -> Self {
        let event_handlers = Arc::<Mutex<EventHandlers>>::default();
        let closed = Arc::new(AtomicBool::new(false));

        {
            let event_handlers = Arc::clone(&event_handlers);
            let closed = Arc::clone(&closed);

            executor
                .spawn(async move {
                    let mut reader = BufReader::new(reader);
                    let mut len_bytes = [0u8; 4];
                    let mut bytes = Vec::new();
                    // Header of the unit whose payload frame has not arrived yet.
                    let mut awaiting_payload: Option<NotificationHeader> = None;

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
                            awaiting_payload = None;
                            break;
                        }

                        bytes.resize(length, 0);
                        if length > 0 && reader.read_exact(&mut bytes).await.is_err() {
                            break;
                        }

                        match awaiting_payload.take() {
                            Some(header) => {
                                let callbacks = event_handlers.lock().get(&header.target_id);
                                if callbacks.is_empty() {
                                    debug!(
                                        "received payload notification for unknown targetId \
                                         [targetId:{}, event:{}]",
                                        header.target_id, header.event,
                                    );
                                    continue;
                                }

                                let message = NotificationMessage {
                                    message: serde_json::json!({
                                        "event": header.event,
                                        "data": header.data,
                                    }),
                                    payload: Bytes::copy_from_slice(&bytes),
                                };
                                for callback in callbacks {
                                    callback(message.clone());
                                }
                            }
                            None => match serde_json::from_slice::<NotificationHeader>(&bytes) {
                                Ok(header) => {
                                    awaiting_payload = Some(header);
                                }
                                Err(error) => {
                                    warn!(
                                        "failed to parse payload channel header: {} [message:{}]",
                                        error,
                                        String::from_utf8_lossy(&bytes),
                                    );
                                }
                            },
                        }
                    }

                    closed.store(true, Ordering::SeqCst);
                })
                .detach();
        }

        let sender = {
            let (sender, receiver) = async_channel::bounded::<Vec<u8>>(1);
            let mut writer = writer;

            executor
                .spawn(async move {
                    while let Ok(message) = receiver.recv().await {
                        if writer.write_all(&message).await.is_err() {
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
                event_handlers,
                closed,
            }),
        }
    }

    /// Send a notification with its payload as one header+payload frame pair.
    pub(crate) async fn notify<N: Notification>(
        &self,
        notification: N,
        payload: Bytes,
    ) -> Result<(), NotificationError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NotificationError::ChannelClosed);
        }

        let event = notification.as_event();
        let handler_id = notification
            .handler_id()
            .unwrap_or_else(|| "undefined".to_string());
        let data = serde_json::to_value(&notification).map_err(|error| {
            NotificationError::FailedToSerialize {
                error: error.to_string(),
            }
        })?;

        let header = serde_json::json!({
            "event": event,
            "handlerId": handler_id,
            "data": data,
        })
        .to_string();

        if header.len() > MESSAGE_MAX_LEN || payload.len() > PAYLOAD_MAX_LEN {
            return Err(NotificationError::MessageTooLong);
        }

        // Both frames go out in a single write so another notification cannot interleave
        // between header and payload.
        let mut bytes =
            Vec::with_capacity(header.len() + payload.len() + 8);
        bytes.extend_from_slice(&(header.len() as u32).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);

        self.inner
            .sender
            .send(bytes)
            .await
            .map_err(|_| NotificationError::ChannelClosed)
    }

    /// Subscribe to payload notifications the worker emits for the given target id.
    pub(crate) fn subscribe_to_notifications<F>(
        &self,
        target_id: String,
        callback: F,
    ) -> Option<PayloadSubscriptionHandler>
    where
        F: Fn(NotificationMessage) + Send + Sync + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return None;
        }

        let token = self
            .inner
            .event_handlers
            .lock()
            .add(target_id.clone(), Arc::new(callback));

        Some(PayloadSubscriptionHandler {
            event_handlers: Arc::downgrade(&self.inner.event_handlers),
            target_id,
            token,
        })
    }

    pub(crate) fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::DataProducerInternal;
    use crate::messages::{DataProducerSendData, DataProducerSendNotification};
    use crate::router::data_producer::DataProducerId;
    use crate::router::transport::TransportId;
    use crate::router::RouterId;
    use futures_lite::future;
    use std::io::{Read, Write};
    use std::os::unix::io::FromRawFd;
    use std::thread;

    fn create_payload_channel() -> (PayloadChannel, std::fs::File, std::fs::File) {
        let _ = env_logger::builder().is_test(true).try_init();

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

        let payload_channel = PayloadChannel::new(executor, reader, writer);

        (
            payload_channel,
            unsafe { std::fs::File::from_raw_fd(from_channel_read) },
            unsafe { std::fs::File::from_raw_fd(to_channel_write) },
        )
    }

    fn write_frame(writer: &mut std::fs::File, payload: &[u8]) {
        writer
            .write_all(&(payload.len() as u32).to_le_bytes())
            .unwrap();
        writer.write_all(payload).unwrap();
    }

    #[test]
    fn header_and_payload_frames_form_one_notification() {
        let (payload_channel, _peer_reader, mut peer_writer) = create_payload_channel();

        let (notified_sender, notified_receiver) = async_oneshot::oneshot();
        let notified_sender = Mutex::new(Some(notified_sender));
        let _handler = payload_channel
            .subscribe_to_notifications("dc1".to_string(), move |notification| {
                if let Some(mut sender) = notified_sender.lock().take() {
                    let _ = sender.send(notification);
                }
            })
            .unwrap();

        write_frame(
            &mut peer_writer,
            br#"{"targetId":"dc1","event":"message","data":{"ppid":51}}"#,
        );
        write_frame(&mut peer_writer, b"hello");

        let notification = future::block_on(notified_receiver).unwrap();
        assert_eq!(notification.message["event"], "message");
        assert_eq!(notification.message["data"]["ppid"], 51);
        assert_eq!(notification.payload.as_ref(), b"hello");
    }

    #[test]
    fn zero_length_payload_frame_is_delivered() {
        let (payload_channel, _peer_reader, mut peer_writer) = create_payload_channel();

        let (notified_sender, notified_receiver) = async_oneshot::oneshot();
        let notified_sender = Mutex::new(Some(notified_sender));
        let _handler = payload_channel
            .subscribe_to_notifications("dc1".to_string(), move |notification| {
                if let Some(mut sender) = notified_sender.lock().take() {
                    let _ = sender.send(notification);
                }
            })
            .unwrap();

        write_frame(
            &mut peer_writer,
            br#"{"targetId":"dc1","event":"message","data":{"ppid":56}}"#,
        );
        write_frame(&mut peer_writer, b"");

        let notification = future::block_on(notified_receiver).unwrap();
        assert!(notification.payload.is_empty());
    }

    #[test]
    fn notify_writes_header_then_payload() {
        let (payload_channel, mut peer_reader, _peer_writer) = create_payload_channel();

        let notification = DataProducerSendNotification {
            internal: DataProducerInternal {
                router_id: RouterId::new(),
                transport_id: TransportId::new(),
                data_producer_id: DataProducerId::new(),
            },
            data: DataProducerSendData { ppid: 53 },
        };

        future::block_on(payload_channel.notify(notification, Bytes::from_static(b"abc")))
            .unwrap();

        let mut len_bytes = [0u8; 4];
        peer_reader.read_exact(&mut len_bytes).unwrap();
        let mut header = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        peer_reader.read_exact(&mut header).unwrap();
        let header: Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(header["event"], "dataProducer.send");
        assert_eq!(header["data"]["data"]["ppid"], 53);

        peer_reader.read_exact(&mut len_bytes).unwrap();
        let mut payload = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        peer_reader.read_exact(&mut payload).unwrap();
        assert_eq!(payload, b"abc");
    }
}
