//! Owner of the executor thread on which all worker I/O and events run.

use crate::worker::{EmbeddedWorkerFn, Worker, WorkerSettings};
use async_executor::Executor;
use futures_lite::future;
use log::*;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

/// Where new workers come from: an external binary or a caller-supplied in-library function.
#[derive(Clone)]
pub(crate) enum WorkerSource {
    Binary(PathBuf),
    Embedded(EmbeddedWorkerFn),
}

struct Inner {
    executor: Arc<Executor<'static>>,
    source: WorkerSource,
    // Dropping the sender stops the executor thread.
    _stop_sender: async_oneshot::Sender<()>,
}

/// Creates and keeps track of the plumbing shared by all workers of one server instance.
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl WorkerManager {
    /// Manager whose workers are spawned from the given worker binary.
    pub fn new(worker_binary: PathBuf) -> Self {
        Self::with_source(WorkerSource::Binary(worker_binary))
    }

    /// Manager whose workers run in-library on dedicated threads.
    pub fn with_embedded_worker(embedded_worker: EmbeddedWorkerFn) -> Self {
        Self::with_source(WorkerSource::Embedded(embedded_worker))
    }

    fn with_source(source: WorkerSource) -> Self {
        debug!("new()");

        let executor = Arc::new(Executor::new());
        let (stop_sender, stop_receiver) = async_oneshot::oneshot::<()>();
        {
            let executor = Arc::clone(&executor);
            thread::spawn(move || {
                let _ = future::block_on(executor.run(stop_receiver));
            });
        }

        Self {
            inner: Arc::new(Inner {
                executor,
                source,
                _stop_sender: stop_sender,
            }),
        }
    }

    /// Create a worker with the given settings.
    pub async fn create_worker(&self, worker_settings: WorkerSettings) -> io::Result<Worker> {
        debug!("create_worker()");

        Worker::new(
            Arc::clone(&self.inner.executor),
            self.inner.source.clone(),
            worker_settings,
            self.clone(),
        )
        .await
    }
}
