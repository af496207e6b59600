//! Audio level observer: reports the loudest producers of a router at a fixed interval.

use crate::data_structures::{AppData, RtpObserverInternal};
use crate::router::producer::{Producer, ProducerId};
use crate::router::rtp_observer::{
    RtpObserver, RtpObserverAddProducerOptions, RtpObserverCommon, RtpObserverId,
};
use crate::router::Router;
use crate::worker::{Channel, RequestError, SubscriptionHandler};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use log::*;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Audio level observer options.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AudioLevelObserverOptions {
    /// Maximum number of entries in the "volumes" event. Default 1.
    pub max_entries: u16,
    /// Minimum average volume (in dBvo from -127 to 0) to be reported. Default -80.
    pub threshold: i8,
    /// Interval in ms for checking audio volumes. Default 1000.
    pub interval: u16,
    /// Custom application data.
    pub app_data: AppData,
}

impl Default for AudioLevelObserverOptions {
    fn default() -> Self {
        Self {
            max_entries: 1,
            threshold: -80,
            interval: 1000,
            app_data: AppData::default(),
        }
    }
}

/// One entry of a "volumes" event.
#[derive(Clone)]
pub struct AudioLevelObserverVolume {
    /// The producer the volume refers to.
    pub producer: Producer,
    /// The average volume in dBvo (-127 means silence, 0 the loudest).
    pub volume: i8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeEntry {
    producer_id: ProducerId,
    volume: i8,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase", content = "data")]
enum Notification {
    Volumes(Vec<VolumeEntry>),
    Silence,
}

#[derive(Default)]
struct Handlers {
    volumes: Bag<Arc<dyn Fn(&[AudioLevelObserverVolume]) + Send + Sync>>,
    silence: Bag<Arc<dyn Fn() + Send + Sync>>,
    pause: Bag<Arc<dyn Fn() + Send + Sync>>,
    resume: Bag<Arc<dyn Fn() + Send + Sync>>,
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: RtpObserverId,
    common: RtpObserverCommon,
    handlers: Arc<Handlers>,
    router: Router,
    _subscription_handler: Option<SubscriptionHandler>,
    _on_router_close_handler: Mutex<HandlerId>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioLevelObserver")
            .field("id", &self.id)
            .finish()
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
        if !self.common.closed.swap(true, Ordering::SeqCst) {
            debug!("close()");

            self.handlers.close.call_simple();

            if close_request {
                self.common.send_close_request();
            }
        }
    }
}

/// Audio level observer proxy.
#[derive(Debug, Clone)]
pub struct AudioLevelObserver {
    inner: Arc<Inner>,
}

impl AudioLevelObserver {
    pub(super) fn new(
        id: RtpObserverId,
        executor: Arc<Executor<'static>>,
        channel: Channel,
        app_data: AppData,
        router: Router,
    ) -> Self {
        debug!("new()");

        let handlers = Arc::<Handlers>::default();
        let inner_weak = Arc::<Mutex<Option<Weak<Inner>>>>::default();

        let subscription_handler = {
            let handlers = Arc::clone(&handlers);
            let inner_weak = Arc::clone(&inner_weak);

            channel.subscribe_to_notifications(id.to_string(), move |notification| {
                match serde_json::from_value::<Notification>(notification) {
                    Ok(notification) => match notification {
                        Notification::Volumes(entries) => {
                            let router = inner_weak
                                .lock()
                                .as_ref()
                                .and_then(|weak_inner| weak_inner.upgrade())
                                .map(|inner| inner.router.clone());
                            let router = match router {
                                Some(router) => router,
                                None => return,
                            };

                            let volumes = entries
                                .into_iter()
                                .filter_map(|entry| {
                                    router.get_producer(&entry.producer_id).map(|producer| {
                                        AudioLevelObserverVolume {
                                            producer,
                                            volume: entry.volume,
                                        }
                                    })
                                })
                                .collect::<Vec<_>>();

                            handlers.volumes.call(|callback| {
                                callback(&volumes);
                            });
                        }
                        Notification::Silence => {
                            handlers.silence.call_simple();
                        }
                    },
                    Err(error) => {
                        error!("failed to parse audio level observer notification: {}", error);
                    }
                }
            })
        };

        let on_router_close_handler = router.on_close({
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
            common: RtpObserverCommon {
                internal: RtpObserverInternal {
                    router_id: router.id(),
                    rtp_observer_id: id,
                },
                executor,
                channel,
                app_data,
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            },
            handlers,
            router,
            _subscription_handler: subscription_handler,
            _on_router_close_handler: Mutex::new(on_router_close_handler),
        });

        inner_weak.lock().replace(Arc::downgrade(&inner));

        Self { inner }
    }

    /// Callback is called at the configured interval with the loudest audio producers.
    pub fn on_volumes<F: Fn(&[AudioLevelObserverVolume]) + Send + Sync + 'static>(
        &self,
        callback: F,
    ) -> HandlerId {
        self.inner.handlers.volumes.add(Arc::new(callback))
    }

    /// Callback is called when no producer was louder than the threshold for the interval.
    pub fn on_silence<F: Fn() + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.silence.add(Arc::new(callback))
    }
}

#[async_trait]
impl RtpObserver for AudioLevelObserver {
    fn id(&self) -> RtpObserverId {
        self.inner.id
    }

    fn paused(&self) -> bool {
        self.inner.common.paused.load(Ordering::SeqCst)
    }

    fn app_data(&self) -> &AppData {
        &self.inner.common.app_data
    }

    fn closed(&self) -> bool {
        self.inner.common.closed.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<(), RequestError> {
        debug!("pause()");

        let was_paused = self.paused();
        self.inner.common.pause_impl().await?;
        if !was_paused {
            self.inner.handlers.pause.call_simple();
        }

        Ok(())
    }

    async fn resume(&self) -> Result<(), RequestError> {
        debug!("resume()");

        let was_paused = self.paused();
        self.inner.common.resume_impl().await?;
        if was_paused {
            self.inner.handlers.resume.call_simple();
        }

        Ok(())
    }

    async fn add_producer(
        &self,
        options: RtpObserverAddProducerOptions,
    ) -> Result<(), RequestError> {
        debug!("add_producer()");

        self.inner
            .common
            .add_producer_impl(options.producer_id)
            .await
    }

    async fn remove_producer(&self, producer_id: ProducerId) -> Result<(), RequestError> {
        debug!("remove_producer()");

        self.inner.common.remove_producer_impl(producer_id).await
    }

    fn on_pause(&self, callback: Box<dyn Fn() + Send + Sync + 'static>) -> HandlerId {
        self.inner.handlers.pause.add(Arc::from(callback))
    }

    fn on_resume(&self, callback: Box<dyn Fn() + Send + Sync + 'static>) -> HandlerId {
        self.inner.handlers.resume.add(Arc::from(callback))
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send + 'static>) -> HandlerId {
        let handler_id = self.inner.handlers.close.add(callback);
        if self.inner.common.closed.load(Ordering::Relaxed) {
            self.inner.handlers.close.call_simple();
        }
        handler_id
    }

    fn close(&self) {
        self.inner.close(true);
    }
}
