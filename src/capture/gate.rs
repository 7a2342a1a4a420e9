//! Serializes still captures against the streaming pipeline

use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::capture::worker::StillRequest;
use crate::capture::Frame;
use crate::error::CaptureError;
use crate::relay::{Relay, WaitOutcome};

/// How a still capture gets the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Device must switch to its still mode; the capture worker pauses
    /// streaming for one capture.
    Exclusive,
    /// Device serves stills from the running stream; the latest relay frame
    /// is returned without touching the device.
    Shared,
}

struct GateInner {
    mode: CaptureMode,
    busy: Mutex<()>,
    stills: Sender<StillRequest>,
    relay: Relay,
    timeout: Duration,
}

#[derive(Clone)]
pub struct CaptureGate {
    inner: Arc<GateInner>,
}

impl CaptureGate {
    /// Returns the gate and the request queue the capture worker drains.
    pub fn new(mode: CaptureMode, relay: Relay, timeout: Duration) -> (Self, Receiver<StillRequest>) {
        let (stills, requests) = flume::bounded(1);
        let gate = Self {
            inner: Arc::new(GateInner {
                mode,
                busy: Mutex::new(()),
                stills,
                relay,
                timeout,
            }),
        };
        (gate, requests)
    }

    pub fn mode(&self) -> CaptureMode {
        self.inner.mode
    }

    /// Take one still.
    ///
    /// Callers queue behind each other, never behind streaming clients.
    /// Waiting longer than the configured timeout for the gate yields
    /// [`CaptureError::DeviceBusy`].
    #[instrument(skip(self), fields(mode = ?self.inner.mode))]
    pub async fn capture_still(&self) -> Result<Frame, CaptureError> {
        let deadline = Instant::now() + self.inner.timeout;
        let _held = tokio::time::timeout_at(deadline, self.inner.busy.lock())
            .await
            .map_err(|_| CaptureError::DeviceBusy)?;

        match self.inner.mode {
            CaptureMode::Shared => self.latest_frame(deadline).await,
            CaptureMode::Exclusive => self.switch_and_capture(deadline).await,
        }
    }

    async fn latest_frame(&self, deadline: Instant) -> Result<Frame, CaptureError> {
        if let Some((_, frame)) = self.inner.relay.latest() {
            return Ok(frame);
        }
        debug!("No frame yet, waiting for the first one");
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.inner.relay.wait_next(0, remaining).await {
            WaitOutcome::Frame { frame, .. } => Ok(frame),
            WaitOutcome::Timeout => Err(CaptureError::Device(
                "no frame received from camera".into(),
            )),
        }
    }

    async fn switch_and_capture(&self, deadline: Instant) -> Result<Frame, CaptureError> {
        let (reply, response) = oneshot::channel();
        // A request from a cancelled caller may still hold the queue slot
        // until the worker discards it; wait for it within the same deadline.
        let queued = self.inner.stills.send_async(StillRequest { reply });
        match tokio::time::timeout_at(deadline, queued).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(CaptureError::Device("capture worker is not running".into()));
            }
            Err(_) => return Err(CaptureError::DeviceBusy),
        }

        // Dropping this future closes the reply channel; the worker skips the
        // request if it has not started it yet.
        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaptureError::Device(
                "capture worker stopped during still capture".into(),
            )),
            Err(_) => Err(CaptureError::Device("still capture timed out".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CaptureWorker, FrameSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn shared_mode_returns_latest_frame() {
        let relay = Relay::new();
        let (gate, _requests) = CaptureGate::new(CaptureMode::Shared, relay.clone(), TIMEOUT);

        relay.publish(Frame::jpeg(&b"one"[..], 1, 1));
        relay.publish(Frame::jpeg(&b"two"[..], 1, 1));

        let frame = gate.capture_still().await.unwrap();
        assert_eq!(&frame.data[..], b"two");
        // reading the relay does not consume anything
        assert_eq!(relay.sequence(), 2);
    }

    #[tokio::test]
    async fn shared_mode_without_frames_fails_after_timeout() {
        let (gate, _requests) = CaptureGate::new(CaptureMode::Shared, Relay::new(), TIMEOUT);
        let err = gate.capture_still().await.unwrap_err();
        assert!(matches!(err, CaptureError::Device(_)));
    }

    #[tokio::test]
    async fn exclusive_mode_round_trips_through_worker_queue() {
        let (gate, requests) = CaptureGate::new(CaptureMode::Exclusive, Relay::new(), TIMEOUT);

        let device = tokio::spawn(async move {
            let request = requests.recv_async().await.unwrap();
            let _ = request.reply.send(Ok(Frame::still(&b"big"[..], 4, 4)));
        });

        let frame = gate.capture_still().await.unwrap();
        assert_eq!(&frame.data[..], b"big");
        device.await.unwrap();
    }

    #[tokio::test]
    async fn exclusive_mode_surfaces_device_errors() {
        let (gate, requests) = CaptureGate::new(CaptureMode::Exclusive, Relay::new(), TIMEOUT);

        tokio::spawn(async move {
            let request = requests.recv_async().await.unwrap();
            let _ = request
                .reply
                .send(Err(CaptureError::Device("sensor timeout".into())));
        });

        let err = gate.capture_still().await.unwrap_err();
        assert_eq!(err.to_string(), "capture device error: sensor timeout");
    }

    #[tokio::test]
    async fn exclusive_mode_without_worker_is_an_error() {
        let (gate, requests) = CaptureGate::new(CaptureMode::Exclusive, Relay::new(), TIMEOUT);
        drop(requests);
        let err = gate.capture_still().await.unwrap_err();
        assert!(matches!(err, CaptureError::Device(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_stills_queue_instead_of_failing() {
        let (gate, requests) =
            CaptureGate::new(CaptureMode::Exclusive, Relay::new(), Duration::from_secs(5));

        let _device = tokio::spawn(async move {
            while let Ok(request) = requests.recv_async().await {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let _ = request.reply.send(Ok(Frame::still(&b"still"[..], 4, 4)));
            }
        });

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.capture_still().await })
            })
            .collect();

        for caller in callers {
            assert!(caller.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn unserviced_request_reports_busy_device() {
        let (gate, requests) = CaptureGate::new(CaptureMode::Exclusive, Relay::new(), TIMEOUT);

        // Worker alive but stuck: the first request times out and stays queued
        let first = gate.capture_still().await.unwrap_err();
        assert!(matches!(first, CaptureError::Device(_)));

        // the second one cannot even be queued before its deadline
        let second = gate.capture_still().await.unwrap_err();
        assert!(matches!(second, CaptureError::DeviceBusy));
        drop(requests);
    }

    /// Stream reads take long enough for a queued request to be abandoned
    /// before the worker looks at it
    struct SlowSource {
        stills: Arc<AtomicUsize>,
    }

    impl FrameSource for SlowSource {
        fn name(&self) -> &str {
            "slow"
        }

        fn stream_frame(&mut self) -> Result<Frame, CaptureError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Frame::jpeg(&b"frame"[..], 1, 1))
        }

        fn capture_still(&mut self) -> Result<Frame, CaptureError> {
            self.stills.fetch_add(1, Ordering::SeqCst);
            Ok(Frame::still(&b"still"[..], 2, 2))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_capture_releases_the_gate() {
        let relay = Relay::new();
        let (gate, requests) =
            CaptureGate::new(CaptureMode::Exclusive, relay.clone(), Duration::from_secs(5));
        let stills = Arc::new(AtomicUsize::new(0));
        let worker = CaptureWorker::spawn(
            Box::new(SlowSource {
                stills: Arc::clone(&stills),
            }),
            relay.clone(),
            requests,
        )
        .unwrap();

        // once the first frame is out the worker sits in its next 300 ms read
        relay.wait_next(0, Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let abandoned = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.capture_still().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        let frame = gate.capture_still().await.unwrap();
        assert_eq!(&frame.data[..], b"still");
        // the abandoned request was skipped, not captured
        assert_eq!(stills.load(Ordering::SeqCst), 1);

        drop(gate);
        tokio::task::spawn_blocking(move || worker.stop()).await.unwrap();
    }
}
