//! Producer thread: pulls frames from the source into the relay

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, TryRecvError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::capture::{Frame, FrameSource};
use crate::error::CaptureError;
use crate::relay::Relay;

/// Pause before retrying after a failed read
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// A still capture handed to the worker by the gate
pub struct StillRequest {
    pub reply: oneshot::Sender<Result<Frame, CaptureError>>,
}

/// Owns the thread driving a [`FrameSource`]
pub struct CaptureWorker {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureWorker {
    /// Start the producer loop on a dedicated OS thread; camera I/O blocks.
    pub fn spawn(
        mut source: Box<dyn FrameSource>,
        relay: Relay,
        stills: Receiver<StillRequest>,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                info!("Capture worker running on {}", source.name());
                run(source.as_mut(), &relay, &stills, &stop);
                info!("Capture worker stopped");
            })?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the loop to exit and wait for it. Blocks for at most one frame read.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Capture worker panicked");
            }
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn run(
    source: &mut dyn FrameSource,
    relay: &Relay,
    stills: &Receiver<StillRequest>,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        match stills.try_recv() {
            Ok(request) => {
                if request.reply.is_closed() {
                    debug!("Skipping still capture, requester already gone");
                    continue;
                }
                let result = source.capture_still();
                match &result {
                    Ok(frame) => {
                        metrics::counter!("hermes_still_captures_total").increment(1);
                        info!(bytes = frame.len(), "Still captured");
                    }
                    Err(e) => error!("Still capture failed: {}", e),
                }
                if request.reply.send(result).is_err() {
                    warn!("Still capture requester went away before the reply");
                }
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                info!("Capture gate closed, stopping worker");
                break;
            }
        }

        match source.stream_frame() {
            Ok(frame) => {
                relay.publish(frame);
            }
            Err(e) => {
                error!("Capture error: {}", e);
                thread::sleep(RETRY_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WaitOutcome;
    use std::sync::atomic::AtomicUsize;

    /// Counts calls and fails every other stream read
    struct FlakySource {
        reads: Arc<AtomicUsize>,
        still_fails: bool,
    }

    impl FlakySource {
        fn new() -> Self {
            Self {
                reads: Arc::new(AtomicUsize::new(0)),
                still_fails: false,
            }
        }
    }

    impl FrameSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        fn stream_frame(&mut self) -> Result<Frame, CaptureError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            if n % 2 == 0 {
                Err(CaptureError::Device("transient".into()))
            } else {
                Ok(Frame::jpeg(vec![n as u8], 1, 1))
            }
        }

        fn capture_still(&mut self) -> Result<Frame, CaptureError> {
            if self.still_fails {
                return Err(CaptureError::Device("mode switch failed".into()));
            }
            Ok(Frame::still(&b"still"[..], 2, 2))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publishes_and_survives_read_errors() {
        let relay = Relay::new();
        let (_tx, rx) = flume::bounded(1);
        let reads = Arc::new(AtomicUsize::new(0));
        let worker = CaptureWorker::spawn(
            Box::new(FlakySource {
                reads: Arc::clone(&reads),
                still_fails: false,
            }),
            relay.clone(),
            rx,
        )
        .unwrap();

        let mut last_seen = 0;
        for _ in 0..3 {
            match relay.wait_next(last_seen, Duration::from_secs(5)).await {
                WaitOutcome::Frame { sequence, .. } => last_seen = sequence,
                WaitOutcome::Timeout => panic!("worker stopped publishing"),
            }
        }
        assert!(reads.load(Ordering::SeqCst) >= 6);
        assert!(worker.is_running());
        worker.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serves_still_requests_between_frames() {
        let relay = Relay::new();
        let (tx, rx) = flume::bounded(1);
        let worker = CaptureWorker::spawn(Box::new(FlakySource::new()), relay, rx).unwrap();

        let (reply, response) = oneshot::channel();
        tx.send_async(StillRequest { reply }).await.unwrap();
        let still = response.await.unwrap().unwrap();
        assert!(still.meta.still);
        assert_eq!(&still.data[..], b"still");
        worker.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exits_when_gate_is_dropped() {
        let (tx, rx) = flume::bounded(1);
        let worker = CaptureWorker::spawn(Box::new(FlakySource::new()), Relay::new(), rx).unwrap();

        drop(tx);
        for _ in 0..100 {
            if !worker.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!worker.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streaming_resumes_after_still_capture() {
        for still_fails in [false, true] {
            let relay = Relay::new();
            let (tx, rx) = flume::bounded(1);
            let worker = CaptureWorker::spawn(
                Box::new(FlakySource {
                    still_fails,
                    ..FlakySource::new()
                }),
                relay.clone(),
                rx,
            )
            .unwrap();

            let (reply, response) = oneshot::channel();
            tx.send_async(StillRequest { reply }).await.unwrap();
            let result = response.await.unwrap();
            assert_eq!(result.is_err(), still_fails);

            // publishing continues after the still
            let mut last_seen = relay.sequence();
            for _ in 0..2 {
                match relay.wait_next(last_seen, Duration::from_secs(5)).await {
                    WaitOutcome::Frame { sequence, .. } => last_seen = sequence,
                    WaitOutcome::Timeout => {
                        panic!("stream stalled after still capture (still_fails: {still_fails})")
                    }
                }
            }
            worker.stop();
        }
    }
}
