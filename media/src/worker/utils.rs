use crate::worker::channel::Channel;
use crate::worker::payload_channel::PayloadChannel;
use async_executor::Executor;
use async_fs::File;
use async_process::{Child, Command};
use nix::unistd;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

#[derive(Debug, Copy, Clone, Error)]
pub enum ExitError {
    /// Generic error.
    #[error("worker exited with generic error")]
    Generic,
    /// Wrong settings.
    #[error("worker exited with wrong settings error")]
    Settings,
    /// Unknown error.
    #[error("worker exited with unknown error and status code {status_code}")]
    Unknown { status_code: i32 },
    /// Unexpected error.
    #[error("worker exited unexpectedly")]
    Unexpected,
}

/// Pipe ends handed to an in-library worker, from the worker's point of view.
#[derive(Debug, Copy, Clone)]
pub struct EmbeddedWorkerIo {
    /// Requests from the orchestrator arrive here (channel).
    pub channel_read_fd: RawFd,
    /// Responses and notifications go out here (channel).
    pub channel_write_fd: RawFd,
    /// Payload channel counterpart of `channel_read_fd`.
    pub payload_read_fd: RawFd,
    /// Payload channel counterpart of `channel_write_fd`.
    pub payload_write_fd: RawFd,
}

/// In-library worker entry point; runs on a dedicated thread and returns an exit code with the
/// same semantics as the worker binary (0 success, 1 failure, 42 wrong settings).
pub type EmbeddedWorkerFn = Arc<dyn Fn(Vec<String>, EmbeddedWorkerIo) -> i32 + Send + Sync>;

// Workers must not be spawned from multiple threads concurrently, the fd juggling around
// fork/exec is racy otherwise.
static SPAWNING: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(super) struct WorkerRunResult {
    pub(super) child: Option<Child>,
    pub(super) pid: u32,
    pub(super) channel: Channel,
    pub(super) payload_channel: PayloadChannel,
    pub(super) status_receiver: async_oneshot::Receiver<Result<(), ExitError>>,
}

fn pipe() -> io::Result<(RawFd, RawFd)> {
    unistd::pipe().map_err(io::Error::from)
}

fn exit_code_to_result(status_code: i32) -> Result<(), ExitError> {
    match status_code {
        0 => Ok(()),
        1 => Err(ExitError::Generic),
        42 => Err(ExitError::Settings),
        status_code => Err(ExitError::Unknown { status_code }),
    }
}

/// Spawn the worker binary with the channel pipes wired onto fds 3/4 and the payload channel
/// pipes onto fds 5/6, the way the worker expects them.
pub(super) fn spawn_with_worker_channels(
    executor: Arc<Executor<'static>>,
    command: &mut Command,
) -> io::Result<WorkerRunResult> {
    let _lock = SPAWNING.lock();

    let (producer_fd_read, producer_fd_write) = pipe()?;
    let (consumer_fd_read, consumer_fd_write) = pipe()?;
    let (producer_payload_fd_read, producer_payload_fd_write) = pipe()?;
    let (consumer_payload_fd_read, consumer_payload_fd_write) = pipe()?;

    unsafe {
        use async_process::unix::CommandExt;

        command.pre_exec(move || {
            unistd::dup2(producer_fd_read, 3).map_err(io::Error::from)?;
            unistd::dup2(consumer_fd_write, 4).map_err(io::Error::from)?;
            unistd::dup2(producer_payload_fd_read, 5).map_err(io::Error::from)?;
            unistd::dup2(consumer_payload_fd_write, 6).map_err(io::Error::from)?;
            // Duplicated above.
            let _ = unistd::close(producer_fd_read);
            let _ = unistd::close(consumer_fd_write);
            let _ = unistd::close(producer_payload_fd_read);
            let _ = unistd::close(consumer_payload_fd_write);
            // Unused in the child.
            let _ = unistd::close(producer_fd_write);
            let _ = unistd::close(consumer_fd_read);
            let _ = unistd::close(producer_payload_fd_write);
            let _ = unistd::close(consumer_payload_fd_read);

            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let pid = child.id();

    // Unused in the parent.
    let _ = unistd::close(producer_fd_read);
    let _ = unistd::close(consumer_fd_write);
    let _ = unistd::close(producer_payload_fd_read);
    let _ = unistd::close(consumer_payload_fd_write);

    let producer_file: File = unsafe { std::fs::File::from_raw_fd(producer_fd_write) }.into();
    let consumer_file: File = unsafe { std::fs::File::from_raw_fd(consumer_fd_read) }.into();
    let producer_payload_file: File =
        unsafe { std::fs::File::from_raw_fd(producer_payload_fd_write) }.into();
    let consumer_payload_file: File =
        unsafe { std::fs::File::from_raw_fd(consumer_payload_fd_read) }.into();

    let (mut status_sender, status_receiver) = async_oneshot::oneshot();
    let status_fut = child.status();
    executor
        .spawn(async move {
            let result = match status_fut.await {
                Ok(exit_status) => match exit_status.code() {
                    Some(status_code) => exit_code_to_result(status_code),
                    // Killed by signal.
                    None => Err(ExitError::Unexpected),
                },
                Err(_) => Err(ExitError::Unexpected),
            };
            let _ = status_sender.send(result);
        })
        .detach();

    Ok(WorkerRunResult {
        child: Some(child),
        pid,
        channel: Channel::new(Arc::clone(&executor), consumer_file, producer_file),
        payload_channel: PayloadChannel::new(
            executor,
            consumer_payload_file,
            producer_payload_file,
        ),
        status_receiver,
    })
}

/// Run an in-library worker on a dedicated thread, connected over the same pipe pairs a
/// subprocess would get.
pub(super) fn run_embedded_worker(
    executor: Arc<Executor<'static>>,
    embedded_worker: EmbeddedWorkerFn,
    args: Vec<String>,
) -> io::Result<WorkerRunResult> {
    let _lock = SPAWNING.lock();

    let (producer_fd_read, producer_fd_write) = pipe()?;
    let (consumer_fd_read, consumer_fd_write) = pipe()?;
    let (producer_payload_fd_read, producer_payload_fd_write) = pipe()?;
    let (consumer_payload_fd_read, consumer_payload_fd_write) = pipe()?;

    let (mut status_sender, status_receiver) = async_oneshot::oneshot();

    let io = EmbeddedWorkerIo {
        channel_read_fd: producer_fd_read,
        channel_write_fd: consumer_fd_write,
        payload_read_fd: producer_payload_fd_read,
        payload_write_fd: consumer_payload_fd_write,
    };

    thread::spawn(move || {
        let status_code = embedded_worker(args, io);
        let _ = status_sender.send(exit_code_to_result(status_code));
    });

    let producer_file: File = unsafe { std::fs::File::from_raw_fd(producer_fd_write) }.into();
    let consumer_file: File = unsafe { std::fs::File::from_raw_fd(consumer_fd_read) }.into();
    let producer_payload_file: File =
        unsafe { std::fs::File::from_raw_fd(producer_payload_fd_write) }.into();
    let consumer_payload_file: File =
        unsafe { std::fs::File::from_raw_fd(consumer_payload_fd_read) }.into();

    Ok(WorkerRunResult {
        child: None,
        pid: std::process::id(),
        channel: Channel::new(Arc::clone(&executor), consumer_file, producer_file),
        payload_channel: PayloadChannel::new(
            executor,
            consumer_payload_file,
            producer_payload_file,
        ),
        status_receiver,
    })
}
