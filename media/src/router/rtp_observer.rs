//! Passive observers watching the producers of a router.

use crate::data_structures::{AppData, RtpObserverInternal};
use crate::messages::{
    RtpObserverAddProducerRequest, RtpObserverAddRemoveProducerData, RtpObserverCloseRequest,
    RtpObserverPauseRequest, RtpObserverRemoveProducerRequest, RtpObserverResumeRequest,
};
use crate::router::producer::ProducerId;
use crate::uuid_based_wrapper_type;
use crate::worker::{Channel, RequestError};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::HandlerId;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

uuid_based_wrapper_type!(
    /// RTP observer identifier.
    RtpObserverId
);

/// Options for adding a producer to an RTP observer.
#[derive(Debug, Copy, Clone)]
pub struct RtpObserverAddProducerOptions {
    pub producer_id: ProducerId,
}

impl RtpObserverAddProducerOptions {
    pub fn new(producer_id: ProducerId) -> Self {
        Self { producer_id }
    }
}

/// An RTP observer watches a subset of the producers of a router and emits events about them.
#[async_trait]
pub trait RtpObserver: Send + Sync {
    /// RTP observer identifier.
    fn id(&self) -> RtpObserverId;

    /// Whether the observer is paused.
    fn paused(&self) -> bool;

    /// Custom application data.
    fn app_data(&self) -> &AppData;

    /// Whether the observer is closed.
    fn closed(&self) -> bool;

    /// Pause the observer; no events are emitted until resumed.
    async fn pause(&self) -> Result<(), RequestError>;

    /// Resume the observer.
    async fn resume(&self) -> Result<(), RequestError>;

    /// Start watching the given producer.
    async fn add_producer(
        &self,
        options: RtpObserverAddProducerOptions,
    ) -> Result<(), RequestError>;

    /// Stop watching the given producer.
    async fn remove_producer(&self, producer_id: ProducerId) -> Result<(), RequestError>;

    /// Callback is called when the observer is paused.
    fn on_pause(&self, callback: Box<dyn Fn() + Send + Sync + 'static>) -> HandlerId;

    /// Callback is called when the observer is resumed.
    fn on_resume(&self, callback: Box<dyn Fn() + Send + Sync + 'static>) -> HandlerId;

    /// Callback is called when the observer is closed for whatever reason.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send + 'static>) -> HandlerId;

    /// Close the observer.
    fn close(&self);
}

/// Request plumbing shared by the concrete observer kinds.
pub(super) struct RtpObserverCommon {
    pub(super) internal: RtpObserverInternal,
    pub(super) executor: Arc<Executor<'static>>,
    pub(super) channel: Channel,
    pub(super) app_data: AppData,
    pub(super) paused: AtomicBool,
    pub(super) closed: AtomicBool,
}

impl RtpObserverCommon {
    pub(super) async fn pause_impl(&self) -> Result<(), RequestError> {
        self.channel
            .request(RtpObserverPauseRequest {
                internal: self.internal,
            })
            .await?;

        self.paused.store(true, Ordering::SeqCst);

        Ok(())
    }

    pub(super) async fn resume_impl(&self) -> Result<(), RequestError> {
        self.channel
            .request(RtpObserverResumeRequest {
                internal: self.internal,
            })
            .await?;

        self.paused.store(false, Ordering::SeqCst);

        Ok(())
    }

    pub(super) async fn add_producer_impl(
        &self,
        producer_id: ProducerId,
    ) -> Result<(), RequestError> {
        self.channel
            .request(RtpObserverAddProducerRequest {
                internal: self.internal,
                data: RtpObserverAddRemoveProducerData { producer_id },
            })
            .await
    }

    pub(super) async fn remove_producer_impl(
        &self,
        producer_id: ProducerId,
    ) -> Result<(), RequestError> {
        self.channel
            .request(RtpObserverRemoveProducerRequest {
                internal: self.internal,
                data: RtpObserverAddRemoveProducerData { producer_id },
            })
            .await
    }

    /// Fire the worker-side close request; the concrete observer handles its own close bag.
    pub(super) fn send_close_request(&self) {
        let channel = self.channel.clone();
        let request = RtpObserverCloseRequest {
            internal: self.internal,
        };
        self.executor
            .spawn(async move {
                if let Err(error) = channel.request(request).await {
                    error!("rtp observer closing failed on drop: {}", error);
                }
            })
            .detach();
    }
}
