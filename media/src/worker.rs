//! Supervisor for one media worker process (or in-library worker thread).

pub(crate) mod channel;
pub(crate) mod payload_channel;
mod utils;

use crate::data_structures::{AppData, RouterInternal};
use crate::messages::{
    WorkerCreateRouterRequest, WorkerDumpRequest, WorkerGetResourceRequest,
    WorkerUpdateSettingsRequest,
};
use crate::ortc;
use crate::ortc::RtpCapabilitiesError;
use crate::router::{Router, RouterId, RouterOptions};
use crate::worker::utils::WorkerRunResult;
use crate::worker_manager::{WorkerManager, WorkerSource};
use async_executor::Executor;
use async_process::{Child, Command, Stdio};
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use futures_lite::io::BufReader;
use futures_lite::{future, AsyncBufReadExt, StreamExt};
use log::*;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub(crate) use channel::{Channel, InternalMessage};
pub use channel::{RequestError, SubscriptionHandler};
pub(crate) use payload_channel::PayloadChannel;
pub use payload_channel::{NotificationError, NotificationMessage, PayloadSubscriptionHandler};
pub use utils::{EmbeddedWorkerFn, EmbeddedWorkerIo, ExitError};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl Default for WorkerLogLevel {
    fn default() -> Self {
        Self::Error
    }
}

impl WorkerLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

impl Serialize for WorkerLogLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl FromStr for WorkerLogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "debug" => Ok(Self::Debug),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "none" => Ok(Self::None),
            _ => Err(format!("invalid worker log level: {}", value)),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WorkerLogTag {
    Info,
    Ice,
    Dtls,
    Rtp,
    Srtp,
    Rtcp,
    Rtx,
    Bwe,
    Score,
    Simulcast,
    Svc,
    Sctp,
    Message,
}

impl WorkerLogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Ice => "ice",
            Self::Dtls => "dtls",
            Self::Rtp => "rtp",
            Self::Srtp => "srtp",
            Self::Rtcp => "rtcp",
            Self::Rtx => "rtx",
            Self::Bwe => "bwe",
            Self::Score => "score",
            Self::Simulcast => "simulcast",
            Self::Svc => "svc",
            Self::Sctp => "sctp",
            Self::Message => "message",
        }
    }
}

impl Serialize for WorkerLogTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl FromStr for WorkerLogTag {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "info" => Ok(Self::Info),
            "ice" => Ok(Self::Ice),
            "dtls" => Ok(Self::Dtls),
            "rtp" => Ok(Self::Rtp),
            "srtp" => Ok(Self::Srtp),
            "rtcp" => Ok(Self::Rtcp),
            "rtx" => Ok(Self::Rtx),
            "bwe" => Ok(Self::Bwe),
            "score" => Ok(Self::Score),
            "simulcast" => Ok(Self::Simulcast),
            "svc" => Ok(Self::Svc),
            "sctp" => Ok(Self::Sctp),
            "message" => Ok(Self::Message),
            _ => Err(format!("invalid worker log tag: {}", value)),
        }
    }
}

#[derive(Debug)]
pub struct WorkerSettings {
    pub app_data: AppData,
    /// Logging level for logs generated by the media worker.
    pub log_level: WorkerLogLevel,
    /// Log tags for debugging.
    pub log_tags: Vec<WorkerLogTag>,
    /// Minimum RTC port for ICE, DTLS, RTP, etc. Default 10000.
    pub rtc_min_port: u16,
    /// Maximum RTC port for ICE, DTLS, RTP, etc. Default 59999.
    pub rtc_max_port: u16,
    /// Path to the DTLS public certificate file in PEM format. If unset, a certificate is
    /// dynamically created.
    pub dtls_certificate_file: Option<PathBuf>,
    /// Path to the DTLS certificate private key file in PEM format.
    pub dtls_private_key_file: Option<PathBuf>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            app_data: AppData::default(),
            log_level: WorkerLogLevel::default(),
            log_tags: Vec::new(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerUpdateSettings {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
}

#[derive(Debug, Copy, Clone, Deserialize)]
pub struct WorkerResourceUsage {
    /// User CPU time used (in ms).
    pub ru_utime: u64,
    /// System CPU time used (in ms).
    pub ru_stime: u64,
    /// Maximum resident set size.
    pub ru_maxrss: u64,
    /// Page reclaims (soft page faults).
    pub ru_minflt: u64,
    /// Page faults (hard page faults).
    pub ru_majflt: u64,
    /// Voluntary context switches.
    pub ru_nvcsw: u64,
    /// Involuntary context switches.
    pub ru_nivcsw: u64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
#[doc(hidden)]
pub struct WorkerDump {
    pub pid: u32,
    pub router_ids: Vec<RouterId>,
}

#[derive(Debug, Error)]
pub enum CreateRouterError {
    #[error("RTP capabilities generation error: {0}")]
    FailedRtpCapabilitiesGeneration(RtpCapabilitiesError),
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

#[derive(Default)]
struct Handlers {
    new_router: Bag<Arc<dyn Fn(&Router) + Send + Sync>>,
    died: Bag<Arc<dyn Fn(ExitError) + Send + Sync>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    pid: u32,
    channel: Channel,
    payload_channel: PayloadChannel,
    // Keeps the subprocess handle alive; `None` for in-library workers.
    child: Option<Child>,
    executor: Arc<Executor<'static>>,
    handlers: Handlers,
    app_data: AppData,
    subprocess: bool,
    closed: AtomicBool,
    died: Arc<AtomicBool>,
    // Make sure the executor thread outlives the worker.
    _worker_manager: WorkerManager,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker").field("pid", &self.pid).finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("drop()");

        self.close();
    }
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("close()");

            self.handlers.close.call_simple();

            self.channel.close();
            self.payload_channel.close();

            if self.subprocess && !self.died.load(Ordering::SeqCst) {
                unsafe {
                    libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
    }
}

/// Supervises one media worker and owns its control channels.
#[derive(Debug, Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub(crate) async fn new(
        executor: Arc<Executor<'static>>,
        source: WorkerSource,
        worker_settings: WorkerSettings,
        worker_manager: WorkerManager,
    ) -> io::Result<Self> {
        debug!("new()");

        let WorkerSettings {
            app_data,
            log_level,
            log_tags,
            rtc_min_port,
            rtc_max_port,
            dtls_certificate_file,
            dtls_private_key_file,
        } = worker_settings;

        let mut spawn_args: Vec<String> = Vec::new();
        spawn_args.push(format!("--logLevel={}", log_level.as_str()));
        if !log_tags.is_empty() {
            let log_tags = log_tags
                .iter()
                .map(|log_tag| log_tag.as_str())
                .collect::<Vec<_>>()
                .join(",");
            spawn_args.push(format!("--logTags={}", log_tags));
        }
        spawn_args.push(format!("--rtcMinPort={}", rtc_min_port));
        spawn_args.push(format!("--rtcMaxPort={}", rtc_max_port));
        if let Some(dtls_certificate_file) = dtls_certificate_file {
            spawn_args.push(format!(
                "--dtlsCertificateFile={}",
                dtls_certificate_file.display(),
            ));
        }
        if let Some(dtls_private_key_file) = dtls_private_key_file {
            spawn_args.push(format!(
                "--dtlsPrivateKeyFile={}",
                dtls_private_key_file.display(),
            ));
        }

        let subprocess = matches!(source, WorkerSource::Binary(_));
        let run_result = match source {
            WorkerSource::Binary(worker_binary) => {
                debug!(
                    "spawning worker process: {} {}",
                    worker_binary.display(),
                    spawn_args.join(" "),
                );

                let mut command = Command::new(worker_binary);
                command
                    .args(&spawn_args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .env("MEDIASOUP_VERSION", env!("CARGO_PKG_VERSION"));

                utils::spawn_with_worker_channels(Arc::clone(&executor), &mut command)?
            }
            WorkerSource::Embedded(embedded_worker) => {
                debug!("starting in-library worker: {}", spawn_args.join(" "));

                utils::run_embedded_worker(Arc::clone(&executor), embedded_worker, spawn_args)?
            }
        };

        let WorkerRunResult {
            mut child,
            pid,
            channel,
            payload_channel,
            mut status_receiver,
        } = run_result;

        if let Some(child) = child.as_mut() {
            setup_output_forwarding(&executor, child, pid);
        }

        if subprocess {
            wait_for_worker_ready(&channel, &mut status_receiver, pid).await?;
        }

        setup_message_handling(&executor, &channel, &payload_channel, pid);

        let handlers = Handlers::default();
        let died = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(Inner {
            pid,
            channel,
            payload_channel,
            child,
            executor,
            handlers,
            app_data,
            subprocess,
            closed: AtomicBool::new(false),
            died: Arc::clone(&died),
            _worker_manager: worker_manager,
        });

        {
            let inner_weak = Arc::downgrade(&inner);
            inner
                .executor
                .spawn(async move {
                    let status = status_receiver.await;

                    if let Some(inner) = inner_weak.upgrade() {
                        match status {
                            Ok(Ok(())) => {
                                debug!("worker process exited cleanly [pid:{}]", inner.pid);
                            }
                            Ok(Err(exit_error)) => {
                                if !inner.closed.load(Ordering::SeqCst) {
                                    error!(
                                        "worker process died unexpectedly [pid:{}]: {}",
                                        inner.pid, exit_error,
                                    );
                                    inner.died.store(true, Ordering::SeqCst);
                                    inner.handlers.died.call(|callback| callback(exit_error));
                                }
                            }
                            Err(_) => {
                                // Status sender dropped, nothing to report.
                            }
                        }

                        inner.close();
                    }
                })
                .detach();
        }

        Ok(Self { inner })
    }

    /// Worker process identifier (PID), synthetic for in-library workers.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// App custom data.
    pub fn app_data(&self) -> &AppData {
        &self.inner.app_data
    }

    /// Whether the worker is closed.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Dump Worker.
    #[doc(hidden)]
    pub async fn dump(&self) -> Result<WorkerDump, RequestError> {
        debug!("dump()");

        self.inner.channel.request(WorkerDumpRequest {}).await
    }

    /// Get worker process resource usage.
    pub async fn get_resource_usage(&self) -> Result<WorkerResourceUsage, RequestError> {
        debug!("get_resource_usage()");

        self.inner.channel.request(WorkerGetResourceRequest {}).await
    }

    /// Update log settings of a running worker.
    pub async fn update_settings(&self, data: WorkerUpdateSettings) -> Result<(), RequestError> {
        debug!("update_settings()");

        self.inner
            .channel
            .request(WorkerUpdateSettingsRequest { data })
            .await
    }

    /// Create a Router.
    pub async fn create_router(
        &self,
        router_options: RouterOptions,
    ) -> Result<Router, CreateRouterError> {
        debug!("create_router()");

        let RouterOptions {
            app_data,
            media_codecs,
        } = router_options;

        let rtp_capabilities = ortc::generate_router_rtp_capabilities(media_codecs)
            .map_err(CreateRouterError::FailedRtpCapabilitiesGeneration)?;

        let router_id = RouterId::new();
        let internal = RouterInternal { router_id };

        self.inner
            .channel
            .request(WorkerCreateRouterRequest { internal })
            .await
            .map_err(CreateRouterError::Request)?;

        let router = Router::new(
            router_id,
            Arc::clone(&self.inner.executor),
            self.inner.channel.clone(),
            self.inner.payload_channel.clone(),
            rtp_capabilities,
            app_data,
            self.clone(),
        );

        self.inner.handlers.new_router.call(|callback| {
            callback(&router);
        });

        Ok(router)
    }

    /// Callback is called when a new router is created on this worker.
    pub fn on_new_router<F: Fn(&Router) + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.new_router.add(Arc::new(callback))
    }

    /// Callback is called when the worker process exits unexpectedly.
    pub fn on_died<F: Fn(ExitError) + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.died.add(Arc::new(callback))
    }

    /// Callback is called when the worker is closed for whatever reason.
    ///
    /// NOTE: Callback will be called in place if the worker is already closed.
    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(Box::new(callback));
        if self.inner.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    /// Close the worker and everything it hosts.
    pub fn close(&self) {
        self.inner.close();
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.inner.channel
    }
}

fn setup_output_forwarding(executor: &Arc<Executor<'static>>, child: &mut Child, pid: u32) {
    if let Some(stdout) = child.stdout.take() {
        executor
            .spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(Ok(line)) = lines.next().await {
                    debug!("[pid:{}] (stdout) {}", pid, line);
                }
            })
            .detach();
    }

    if let Some(stderr) = child.stderr.take() {
        executor
            .spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(Ok(line)) = lines.next().await {
                    error!("[pid:{}] (stderr) {}", pid, line);
                }
            })
            .detach();
    }
}

async fn wait_for_worker_ready(
    channel: &Channel,
    status_receiver: &mut async_oneshot::Receiver<Result<(), ExitError>>,
    pid: u32,
) -> io::Result<()> {
    #[derive(Deserialize)]
    #[serde(tag = "event", rename_all = "lowercase")]
    enum Notification {
        Running,
    }

    let (ready_sender, ready_receiver) = async_oneshot::oneshot();
    let ready_sender = parking_lot::Mutex::new(Some(ready_sender));
    let _handler = channel.subscribe_to_notifications(pid.to_string(), move |notification| {
        let result = match serde_json::from_value::<Notification>(notification.clone()) {
            Ok(Notification::Running) => {
                debug!("worker process running [pid:{}]", pid);
                Ok(())
            }
            Err(error) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "unexpected first notification from worker [pid:{}]: {:?}; error = {}",
                    pid, notification, error,
                ),
            )),
        };
        if let Some(mut sender) = ready_sender.lock().take() {
            let _ = sender.send(result);
        }
    });

    future::or(
        async move {
            let status = status_receiver.await;
            Err(match status {
                Ok(Err(ExitError::Settings)) => {
                    io::Error::new(io::ErrorKind::InvalidInput, "wrong settings")
                }
                _ => io::Error::new(
                    io::ErrorKind::NotFound,
                    "worker process exited before being ready",
                ),
            })
        },
        async move {
            ready_receiver
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "channel closed"))?
        },
    )
    .await
}

fn setup_message_handling(
    executor: &Arc<Executor<'static>>,
    channel: &Channel,
    _payload_channel: &PayloadChannel,
    pid: u32,
) {
    let channel_receiver = channel.get_internal_message_receiver();
    executor
        .spawn(async move {
            while let Ok(message) = channel_receiver.recv().await {
                match message {
                    InternalMessage::Debug(text) => debug!("[pid:{}] {}", pid, text),
                    InternalMessage::Warn(text) => warn!("[pid:{}] {}", pid, text),
                    InternalMessage::Error(text) => error!("[pid:{}] {}", pid, text),
                    InternalMessage::Dump(text) => println!("{}", text),
                    InternalMessage::Unexpected(data) => error!(
                        "worker[pid:{}] unexpected channel data: {}",
                        pid,
                        String::from_utf8_lossy(&data),
                    ),
                }
            }
        })
        .detach();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::TransportListenIp;
    use crate::router::consumer::ConsumerOptions;
    use crate::router::data_consumer::DataConsumerOptions;
    use crate::router::data_producer::DataProducerOptions;
    use crate::router::plain_transport::{PlainTransportOptions, PlainTransportRemoteParameters};
    use crate::router::producer::ProducerOptions;
    use crate::router::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
    use crate::router::transport::Transport;
    use crate::router::webrtc_transport::{
        WebRtcTransportOptions, WebRtcTransportRemoteParameters,
    };
    use crate::rtp_parameters::{
        MediaKind, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    };
    use crate::sctp_parameters::SctpStreamParameters;
    use crate::worker_manager::WorkerManager;
    use serde_json::{json, Value};
    use std::io::{Read, Write};
    use std::os::unix::io::FromRawFd;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    // In-library worker accepting every request with per-method plausible data.
    fn scripted_worker() -> EmbeddedWorkerFn {
        Arc::new(|_args, io: EmbeddedWorkerIo| {
            let mut reader = unsafe { std::fs::File::from_raw_fd(io.channel_read_fd) };
            let mut writer = unsafe { std::fs::File::from_raw_fd(io.channel_write_fd) };
            let _payload_reader = unsafe { std::fs::File::from_raw_fd(io.payload_read_fd) };
            let _payload_writer = unsafe { std::fs::File::from_raw_fd(io.payload_write_fd) };

            let mut len_bytes = [0u8; 4];
            loop {
                if reader.read_exact(&mut len_bytes).is_err() {
                    return 0;
                }
                let mut payload = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
                if reader.read_exact(&mut payload).is_err() {
                    return 0;
                }
                let message = String::from_utf8(payload).unwrap();
                let mut parts = message.splitn(4, ':');
                let id: u32 = parts.next().unwrap().parse().unwrap();
                let method = parts.next().unwrap_or_default().to_string();

                let data = match method.as_str() {
                    "worker.dump" => Some(json!({ "pid": 1, "routerIds": [] })),
                    "worker.getResourceUsage" => Some(json!({
                        "ru_utime": 10,
                        "ru_stime": 5,
                        "ru_maxrss": 4096,
                        "ru_minflt": 1,
                        "ru_majflt": 0,
                        "ru_nvcsw": 2,
                        "ru_nivcsw": 3,
                    })),
                    "transport.connect" => Some(json!({ "dtlsLocalRole": "client" })),
                    "transport.restartIce" => Some(json!({
                        "iceParameters": {
                            "usernameFragment": "ufrag2",
                            "password": "password2",
                            "iceLite": true,
                        },
                    })),
                    "router.createWebRtcTransport" => Some(json!({
                        "iceRole": "controlled",
                        "iceParameters": {
                            "usernameFragment": "ufrag",
                            "password": "password",
                            "iceLite": true,
                        },
                        "iceCandidates": [],
                        "dtlsParameters": { "role": "auto", "fingerprints": [] },
                        "sctpParameters": {
                            "port": 5000,
                            "OS": 4,
                            "MIS": 4,
                            "maxMessageSize": 262144,
                        },
                    })),
                    "router.createPlainTransport" => Some(json!({
                        "tuple": {
                            "localIp": "127.0.0.1",
                            "localPort": 40001,
                            "protocol": "udp",
                        },
                        "sctpParameters": null,
                    })),
                    "transport.produce" => Some(json!({ "type": "simple" })),
                    "transport.consume" => Some(json!({
                        "paused": true,
                        "producerPaused": false,
                        "score": { "score": 10, "producerScore": 10, "producerScores": [] },
                    })),
                    "transport.getStats" | "producer.getStats" => Some(json!([])),
                    "transport.dump" => Some(json!({})),
                    _ => None,
                };

                let response = match data {
                    Some(data) => json!({ "id": id, "accepted": true, "data": data }),
                    None => json!({ "id": id, "accepted": true }),
                }
                .to_string();
                if writer
                    .write_all(&(response.len() as u32).to_le_bytes())
                    .and_then(|()| writer.write_all(response.as_bytes()))
                    .is_err()
                {
                    return 1;
                }
            }
        })
    }

    fn audio_codec() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Value::Null,
            rtcp_feedback: vec![],
        }
    }

    fn audio_rtp_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Value::Null,
                rtcp_feedback: vec![],
            }],
            header_extensions: vec![],
            encodings: vec![json!({ "ssrc": 1111 })],
            rtcp: None,
        }
    }

    #[test]
    fn worker_object_graph_with_embedded_worker() {
        init();

        let worker_manager = WorkerManager::with_embedded_worker(scripted_worker());

        futures_lite::future::block_on(async move {
            let worker = worker_manager
                .create_worker(WorkerSettings::default())
                .await
                .expect("failed to create worker");
            assert!(!worker.closed());

            assert_eq!(worker.dump().await.expect("failed to dump worker").pid, 1);
            assert_eq!(
                worker
                    .get_resource_usage()
                    .await
                    .expect("failed to get resource usage")
                    .ru_utime,
                10,
            );

            worker
                .update_settings(WorkerUpdateSettings {
                    log_level: WorkerLogLevel::Debug,
                    log_tags: vec![WorkerLogTag::Ice],
                })
                .await
                .expect("failed to update settings");

            let router = worker
                .create_router(RouterOptions::new(vec![audio_codec()]))
                .await
                .expect("failed to create router");
            assert!(!router.closed());
            assert_eq!(router.rtp_capabilities().codecs.len(), 1);

            let transport = router
                .create_webrtc_transport({
                    let mut options = WebRtcTransportOptions::new(vec![TransportListenIp {
                        ip: "127.0.0.1".to_string(),
                        announced_ip: None,
                    }]);
                    options.enable_sctp = true;
                    options
                })
                .await
                .expect("failed to create WebRTC transport");
            assert_eq!(transport.sctp_parameters().unwrap().mis, 4);

            transport
                .connect(WebRtcTransportRemoteParameters {
                    dtls_parameters: json!({ "role": "client", "fingerprints": [] }),
                })
                .await
                .expect("failed to connect transport");

            let ice_parameters = transport
                .restart_ice()
                .await
                .expect("failed to restart ICE");
            assert_eq!(ice_parameters["usernameFragment"], "ufrag2");
            assert_eq!(transport.ice_parameters()["usernameFragment"], "ufrag2");

            let producer = transport
                .produce(ProducerOptions::new(
                    MediaKind::Audio,
                    audio_rtp_parameters(),
                ))
                .await
                .expect("failed to produce");
            assert!(!producer.paused());

            // The consuming endpoint understands the router's only codec.
            let consumer = transport
                .consume({
                    let mut options = ConsumerOptions::new(
                        producer.id(),
                        router.rtp_capabilities().clone(),
                    );
                    options.paused = true;
                    options
                })
                .await
                .expect("failed to consume");
            assert!(consumer.paused());
            assert!(!consumer.producer_paused());
            assert_eq!(consumer.producer_id(), producer.id());
            consumer.resume().await.expect("failed to resume consumer");
            assert!(!consumer.paused());

            let data_producer = transport
                .produce_data(DataProducerOptions::new_sctp(
                    SctpStreamParameters::new_ordered(0),
                ))
                .await
                .expect("failed to produce data");
            let data_consumer = transport
                .consume_data(DataConsumerOptions::new_sctp(data_producer.id()))
                .await
                .expect("failed to consume data");
            assert_eq!(
                data_consumer.data_producer_id(),
                data_producer.id(),
            );
            assert!(data_consumer.sctp_stream_parameters().is_some());

            let plain_transport = router
                .create_plain_transport(PlainTransportOptions::new(TransportListenIp {
                    ip: "127.0.0.1".to_string(),
                    announced_ip: None,
                }))
                .await
                .expect("failed to create plain transport");
            assert_eq!(plain_transport.tuple().local_port, 40001);
            plain_transport
                .connect(PlainTransportRemoteParameters {
                    ip: Some("127.0.0.1".to_string()),
                    port: Some(5004),
                    rtcp_port: None,
                })
                .await
                .expect("failed to connect plain transport");

            let audio_level_observer = router
                .create_audio_level_observer(Default::default())
                .await
                .expect("failed to create audio level observer");
            audio_level_observer
                .add_producer(RtpObserverAddProducerOptions::new(producer.id()))
                .await
                .expect("failed to add producer to observer");
            audio_level_observer
                .pause()
                .await
                .expect("failed to pause observer");
            assert!(audio_level_observer.paused());

            let active_speaker_observer = router
                .create_active_speaker_observer(Default::default())
                .await
                .expect("failed to create active speaker observer");
            assert!(!active_speaker_observer.closed());

            // Worker close cascades to everything.
            worker.close();
            assert!(worker.closed());
            assert!(router.closed());
            assert!(transport.closed());
            assert!(producer.closed());
            assert!(consumer.closed());
            assert!(data_producer.closed());
            assert!(data_consumer.closed());
            assert!(plain_transport.closed());
            assert!(audio_level_observer.closed());
            assert!(active_speaker_observer.closed());
        });
    }
}
