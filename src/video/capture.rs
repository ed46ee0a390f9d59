//! V4L2 video capture
//!
//! Owns the camera device and a blocking capture worker. The worker waits on
//! the device fd with a bounded poll, dequeues frames from the driver's mmap
//! buffers and copies them into the slot pool; the pipeline consumes through
//! [`Consumer::latest`](super::pool::Consumer::latest).

use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};
use v4l::buffer::Type as BufferType;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Format;

use super::format::{PixelFormat, Resolution};
use super::pool::{frame_pool, Consumer, Producer};
use crate::config::VideoConfig;
use crate::error::{AppError, Result};

/// Device fd poll timeout; expiry is fatal (the camera has gone silent).
const SELECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Video capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device path
    pub device_path: PathBuf,
    /// Requested resolution (not negotiable; a coerced format is an error)
    pub resolution: Resolution,
    /// Requested frame rate
    pub fps: u32,
    /// Number of driver mmap buffers
    pub buffer_count: u32,
}

impl From<&VideoConfig> for CaptureConfig {
    fn from(cfg: &VideoConfig) -> Self {
        Self {
            device_path: PathBuf::from(&cfg.device),
            resolution: Resolution::new(cfg.width, cfg.height),
            fps: cfg.fps,
            buffer_count: cfg.buffers,
        }
    }
}

/// Camera capture source.
pub struct CaptureSource {
    config: CaptureConfig,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CaptureSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Open the device, negotiate format and rate, start streaming and spawn
    /// the capture worker. Returns the consumer side of the frame pool.
    ///
    /// Fails with `CaptureOpenFail` if any initialization step fails; in that
    /// case the worker has already exited and no fds are left open.
    pub async fn start(&self) -> Result<Consumer> {
        info!(
            "starting capture on {} at {} {} fps",
            self.config.device_path.display(),
            self.config.resolution,
            self.config.fps
        );

        self.stop_flag.store(false, Ordering::SeqCst);

        let (producer, consumer) = frame_pool(
            self.config.resolution,
            PixelFormat::Bgr24.bytes_per_pixel(),
        );
        let (init_tx, init_rx) = oneshot::channel();

        let config = self.config.clone();
        let stop_flag = self.stop_flag.clone();
        let handle = tokio::task::spawn_blocking(move || {
            capture_loop(config, producer, stop_flag, init_tx);
        });

        match init_rx.await {
            Ok(Ok(())) => {
                *self.handle.lock().await = Some(handle);
                Ok(consumer)
            }
            Ok(Err(e)) => {
                let _ = handle.await;
                Err(e)
            }
            Err(_) => {
                let _ = handle.await;
                Err(AppError::CaptureOpenFail(
                    "capture worker terminated during initialization".into(),
                ))
            }
        }
    }

    /// Request worker shutdown and join it.
    pub async fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Blocking capture worker. Initialization errors are reported through
/// `init_tx`; runtime errors close the pool as failed so the consumer
/// observes `CaptureGrabFail`.
fn capture_loop(
    config: CaptureConfig,
    mut producer: Producer,
    stop_flag: Arc<AtomicBool>,
    init_tx: oneshot::Sender<Result<()>>,
) {
    let device = match open_device(&config) {
        Ok(device) => device,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    let mut stream =
        match MmapStream::with_buffers(&device, BufferType::VideoCapture, config.buffer_count) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = init_tx.send(Err(AppError::CaptureOpenFail(format!(
                    "failed to map buffers: {}",
                    e
                ))));
                return;
            }
        };

    if let Err(e) = stream.start() {
        let _ = init_tx.send(Err(AppError::CaptureOpenFail(format!(
            "failed to activate stream: {}",
            e
        ))));
        return;
    }

    let _ = init_tx.send(Ok(()));
    info!("capture started");

    let result = run_capture(&config, &device, &mut stream, &mut producer, &stop_flag);
    match result {
        Ok(()) => {
            producer.close(false);
            info!("capture stopped");
        }
        Err(e) => {
            error!("capture worker failed: {}", e);
            producer.close(true);
        }
    }
    // Dropping the stream turns streaming off and unmaps the buffers;
    // dropping the device closes the fd.
}

fn open_device(config: &CaptureConfig) -> Result<Device> {
    let device = Device::with_path(&config.device_path).map_err(|e| {
        AppError::CaptureOpenFail(format!(
            "failed to open device {}: {}",
            config.device_path.display(),
            e
        ))
    })?;

    let requested = Format::new(
        config.resolution.width,
        config.resolution.height,
        PixelFormat::Bgr24.to_fourcc(),
    );
    let actual = device
        .set_format(&requested)
        .map_err(|e| AppError::CaptureOpenFail(format!("failed to set format: {}", e)))?;
    if actual.fourcc != requested.fourcc {
        return Err(AppError::CaptureOpenFail(format!(
            "requested pixel format rejected, driver offered {}",
            actual.fourcc
        )));
    }
    if actual.width != requested.width || actual.height != requested.height {
        return Err(AppError::CaptureOpenFail(format!(
            "requested geometry rejected, driver offered {}x{}",
            actual.width, actual.height
        )));
    }

    device
        .set_params(&Parameters::with_fps(config.fps))
        .map_err(|e| AppError::CaptureOpenFail(format!("failed to set frame rate: {}", e)))?;

    Ok(device)
}

fn run_capture(
    config: &CaptureConfig,
    device: &Device,
    stream: &mut MmapStream<'_>,
    producer: &mut Producer,
    stop_flag: &AtomicBool,
) -> Result<()> {
    let fd = device.handle().fd();
    let expected = PixelFormat::Bgr24.frame_size(config.resolution);

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return Ok(());
        }

        wait_readable(fd, SELECT_TIMEOUT)?;

        // Cancellation checkpoint before the dequeue.
        if stop_flag.load(Ordering::Relaxed) {
            return Ok(());
        }

        let (buf, meta) = match stream.next() {
            Ok(frame) => frame,
            // EAGAIN and EINTR are transparent retries.
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                continue
            }
            Err(e) => {
                return Err(AppError::CaptureGrabFail(format!(
                    "failed to dequeue buffer: {}",
                    e
                )))
            }
        };

        // Cancellation checkpoint after the dequeue.
        if stop_flag.load(Ordering::Relaxed) {
            return Ok(());
        }

        let used = meta.bytesused as usize;
        if used < expected {
            debug!(used, expected, "dropping short frame");
            continue;
        }

        producer.reclaim();
        let Some(mut slot) = producer.take_empty() else {
            return Err(AppError::CaptureGrabFail("buffer pool exhausted".into()));
        };
        slot.data.clear();
        slot.data.extend_from_slice(&buf[..expected]);
        producer.commit(slot);
    }
}

/// Wait for the device fd to become readable, retrying on EINTR. A timeout
/// or poll error is fatal.
fn wait_readable(fd: std::os::fd::RawFd, timeout: Duration) -> Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
    loop {
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => {
                return Err(AppError::CaptureGrabFail(
                    "timeout waiting for frame".into(),
                ))
            }
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(AppError::CaptureGrabFail(format!(
                    "poll on device failed: {}",
                    e
                )))
            }
        }
    }
}
