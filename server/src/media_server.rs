//! Outbound control endpoint: a media server dials the signaling coordinator, registers
//! itself and reports liveness. Incoming coordinator traffic beyond the registration reply is
//! logged; room hosting happens in the cluster server.

use crate::protoo::Message;
use crate::settings::Settings;
use actix_codec::Framed;
use awc::ws;
use awc::BoxedSocket;
use futures::future::Either;
use futures::{SinkExt, StreamExt};
use log::*;
use rainstream_media::prelude::{Worker, WorkerManager};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(20);

/// The media-side node: worker pool plus the registration client.
pub struct MediaServer {
    settings: Arc<Settings>,
    workers: Vec<Worker>,
    node_id: String,
}

impl MediaServer {
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

        let node_id = settings
            .node_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            settings,
            workers,
            node_id,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Connect to the coordinator, register, then keep reporting liveness.
    pub async fn run(self) -> anyhow::Result<()> {
        let server_url = self
            .settings
            .server_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--serverUrl is required to run a media server"))?;

        info!("connecting to signaling coordinator at {}", server_url);

        let (response, mut framed) = awc::Client::new()
            .ws(server_url.as_str())
            .protocols(["secret-media"])
            .connect()
            .await
            .map_err(|error| anyhow::anyhow!("websocket connect failed: {}", error))?;

        debug!("connected to coordinator [status:{}]", response.status());

        let mut next_request_id = 0u32;
        self.register_node(&mut framed, &mut next_request_id).await?;

        info!("registered with coordinator [nodeId:{}]", self.node_id);

        loop {
            let tick = tokio::time::sleep(HEARTBEAT_INTERVAL);
            futures::pin_mut!(tick);

            match futures::future::select(framed.next(), tick).await {
                Either::Left((frame, _tick)) => match frame {
                    Some(Ok(ws::Frame::Text(text))) => {
                        self.handle_coordinator_message(&String::from_utf8_lossy(&text));
                    }
                    Some(Ok(ws::Frame::Ping(bytes))) => {
                        framed.send(ws::Message::Pong(bytes)).await?;
                    }
                    Some(Ok(ws::Frame::Close(reason))) => {
                        info!("coordinator closed the connection: {:?}", reason);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        return Err(anyhow::anyhow!("websocket error: {}", error));
                    }
                    None => {
                        info!("coordinator connection ended");
                        return Ok(());
                    }
                },
                Either::Right(((), next_frame)) => {
                    // Release the borrow on the socket before writing the heartbeat.
                    drop(next_frame);

                    let notification = Message::Notification {
                        method: "reportNodeOnline".to_string(),
                        data: json!({
                            "nodeId": self.node_id,
                            "capacity": self.workers.len(),
                            "status": "online",
                        }),
                    };
                    framed
                        .send(ws::Message::Text(notification.to_json().into()))
                        .await?;
                }
            }
        }
    }

    async fn register_node(
        &self,
        framed: &mut Framed<BoxedSocket, ws::Codec>,
        next_request_id: &mut u32,
    ) -> anyhow::Result<()> {
        *next_request_id += 1;
        let id = *next_request_id;

        let request = Message::Request {
            id,
            method: "registerNode".to_string(),
            data: json!({
                "nodeId": self.node_id,
                "serviceType": "media_server",
                "capacity": self.workers.len(),
                "usedCount": 0,
                "status": "online",
            }),
        };
        framed
            .send(ws::Message::Text(request.to_json().into()))
            .await?;

        let reply = tokio::time::timeout(REGISTER_TIMEOUT, async {
            while let Some(frame) = framed.next().await {
                match frame? {
                    ws::Frame::Text(text) => {
                        match Message::parse(&String::from_utf8_lossy(&text)) {
                            Ok(Message::ResponseSuccess { id: reply_id, .. })
                                if reply_id == id =>
                            {
                                return Ok(());
                            }
                            Ok(Message::ResponseError {
                                id: reply_id,
                                error_code,
                                error_reason,
                            }) if reply_id == id => {
                                return Err(anyhow::anyhow!(
                                    "registerNode rejected [errorCode:{}]: {}",
                                    error_code,
                                    error_reason,
                                ));
                            }
                            Ok(_) | Err(_) => {}
                        }
                    }
                    ws::Frame::Close(reason) => {
                        return Err(anyhow::anyhow!(
                            "coordinator closed during registration: {:?}",
                            reason,
                        ));
                    }
                    _ => {}
                }
            }

            Err(anyhow::anyhow!("coordinator connection ended during registration"))
        })
        .await;

        match reply {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("registerNode timed out")),
        }
    }

    fn handle_coordinator_message(&self, raw: &str) {
        match Message::parse(raw) {
            Ok(message) => debug!("coordinator message: {:?}", message),
            Err(error) => warn!("malformed coordinator message: {}", error),
        }
    }
}
