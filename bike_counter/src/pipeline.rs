// THEORY:
// The `pipeline` module is the top-level API of the engine. It wires the stages
// together for one viewer of the live feed:
//
//     VideoSource -> Detector -> Tracker -> SessionStore -> render -> encode -> part
//
// Key architectural principles:
// 1.  **Single Writer per Frame**: `FrameProcessor::process` is the only place that
//     mutates session state while streaming. It writes through a `SessionTicket`,
//     so a viewer of a replaced upload is fenced off instead of polluting the new
//     session. Each processor owns its tracker, so viewers whose frames interleave
//     never break each other's tracks.
// 2.  **Frame-local Failures**: A detector or tracker failure skips that frame's
//     updates. The frame is still streamed, unannotated, with the last known
//     statistics. Only the end of the video, a fenced session, or a departed client
//     stop the loop.
// 3.  **Blocking Worker, Async Transport**: Decoding, inference and encoding are
//     synchronous and CPU bound, so each viewer gets one blocking worker. Encoded
//     parts are handed to the async HTTP body through a channel with room for a
//     single part, so a slow client only slows its own worker. When the client
//     disconnects the receiver is dropped, the next send fails, and the worker
//     exits, releasing its decoder.
//
// Known limitation: there is no per-frame timeout. A stalled decode blocks that
// viewer's stream until the decoder returns.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::annotate::render;
use crate::config::PipelineConfig;
use crate::detector::Detector;
use crate::encode::encode;
use crate::error::{SourceError, StaleSession};
use crate::multipart::MultipartFramer;
use crate::session::{SessionStore, SessionTicket};
use crate::stats::{StatisticsSnapshot, snapshot};
use crate::tracker::Tracker;
use crate::types::{Detection, Frame, Track};
use crate::video::{VideoOpener, VideoSource};

/// What one processed frame contributed.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    /// Target-class detections above the confidence threshold.
    pub detections: Vec<Detection>,
    pub tracks: Vec<Track>,
    /// Statistics to draw on this frame.
    pub snapshot: StatisticsSnapshot,
    /// False when the detector or tracker failed and the frame was passed through.
    pub analysed: bool,
}

/// Runs detection and tracking for one viewer and records confirmations.
pub struct FrameProcessor {
    detector: Arc<dyn Detector>,
    tracker: Box<dyn Tracker>,
    store: SessionStore,
    ticket: SessionTicket,
    config: PipelineConfig,
    last_snapshot: StatisticsSnapshot,
}

impl FrameProcessor {
    pub fn new(
        detector: Arc<dyn Detector>,
        store: SessionStore,
        ticket: SessionTicket,
        config: PipelineConfig,
    ) -> Self {
        let last_snapshot = snapshot(store.count_for(&ticket).unwrap_or(0));
        let tracker = store.new_tracker();
        Self {
            detector,
            tracker,
            store,
            ticket,
            config,
            last_snapshot,
        }
    }

    /// Keep only detections of the counted class scoring strictly above the threshold.
    pub fn filter_detections(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.class_label == self.config.target_class && d.confidence > self.config.min_confidence)
            .collect()
    }

    /// Analyse one frame. `Err` means the session was replaced and this viewer
    /// must stop.
    pub fn process(&mut self, frame: &Frame) -> Result<FrameOutcome, StaleSession> {
        let detections = match self.detector.detect(&frame.image) {
            Ok(raw) => self.filter_detections(raw),
            Err(e) => {
                warn!(frame = frame.index, detector = self.detector.name(), error = %e, "detection failed, skipping frame");
                return self.passthrough();
            }
        };

        let tracks = match self.tracker.update(&frame.image, &detections) {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(frame = frame.index, error = %e, "tracking failed, skipping frame");
                return self.passthrough();
            }
        };

        let confirmed = tracks.iter().filter(|t| t.confirmed).map(|t| t.id);
        let count = self.store.record_all(&self.ticket, confirmed)?;
        self.last_snapshot = snapshot(count);

        Ok(FrameOutcome {
            detections,
            tracks,
            snapshot: self.last_snapshot,
            analysed: true,
        })
    }

    fn passthrough(&self) -> Result<FrameOutcome, StaleSession> {
        // Still a reader of the session: a replaced session ends the stream here too.
        self.store.count_for(&self.ticket)?;
        Ok(FrameOutcome {
            detections: Vec::new(),
            tracks: Vec::new(),
            snapshot: self.last_snapshot,
            analysed: false,
        })
    }
}

/// Why a stream worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The video ended or could not be decoded any further.
    Exhausted,
    /// The consumer stopped accepting parts.
    ClientGone,
    /// A newer upload replaced the session this stream belonged to.
    SessionReplaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub end: StreamEnd,
    pub frames_sent: u64,
}

/// One viewer's frame loop: source, processor, renderer, encoder, framer.
pub struct StreamWorker {
    source: VideoSource,
    processor: FrameProcessor,
    framer: MultipartFramer,
    jpeg_quality: u8,
}

impl StreamWorker {
    pub fn new(source: VideoSource, processor: FrameProcessor, framer: MultipartFramer, jpeg_quality: u8) -> Self {
        Self {
            source,
            processor,
            framer,
            jpeg_quality,
        }
    }

    /// Open the session's video and build the worker.
    pub fn open(
        opener: &dyn VideoOpener,
        detector: Arc<dyn Detector>,
        store: SessionStore,
        ticket: SessionTicket,
        config: &PipelineConfig,
    ) -> Result<Self, SourceError> {
        let source = VideoSource::open(opener, ticket.video_path(), config.frame_stride)?;
        let processor = FrameProcessor::new(detector, store, ticket, config.clone());
        Ok(Self::new(source, processor, MultipartFramer::default(), config.jpeg_quality))
    }

    /// Drive the loop, handing every framed part to `sink`. The sink returns
    /// `ControlFlow::Break` once the consumer is gone.
    pub fn run<F>(mut self, mut sink: F) -> StreamReport
    where
        F: FnMut(Bytes) -> ControlFlow<()>,
    {
        let mut frames_sent = 0u64;
        let end = loop {
            let Some(frame) = self.source.next() else {
                break StreamEnd::Exhausted;
            };

            let outcome = match self.processor.process(&frame) {
                Ok(outcome) => outcome,
                Err(stale) => {
                    info!(generation = stale.ticket, current = stale.current, "session replaced, stopping stream");
                    break StreamEnd::SessionReplaced;
                }
            };

            let annotated = render(&frame.image, &outcome.detections, &outcome.tracks, &outcome.snapshot);
            let jpeg = match encode(&annotated, self.jpeg_quality) {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    warn!(frame = frame.index, error = %e, "frame encoding failed, dropping frame");
                    continue;
                }
            };

            if sink(self.framer.part(&jpeg)).is_break() {
                break StreamEnd::ClientGone;
            }
            frames_sent += 1;
        };

        debug!(decoded = self.source.frames_decoded(), source = ?self.source.end_reason(), "stream worker finished");
        StreamReport { end, frames_sent }
    }
}

/// Spawn a blocking worker for one viewer of the active session. Parts arrive
/// on the returned receiver; dropping it stops the worker.
pub fn spawn_stream(
    opener: Arc<dyn VideoOpener>,
    detector: Arc<dyn Detector>,
    store: SessionStore,
    ticket: SessionTicket,
    config: PipelineConfig,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(1);
    tokio::task::spawn_blocking(move || {
        let path = ticket.video_path().to_path_buf();
        let generation = ticket.generation();
        let viewer = ticket.viewer();
        let worker = match StreamWorker::open(opener.as_ref(), detector, store, ticket, &config) {
            Ok(worker) => worker,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open video for streaming");
                return;
            }
        };
        info!(path = %path.display(), generation, %viewer, "stream started");

        let report = worker.run(|part| match tx.blocking_send(part) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        });
        log_report(&path, &report);
    });
    rx
}

fn log_report(path: &Path, report: &StreamReport) {
    info!(
        path = %path.display(),
        frames = report.frames_sent,
        reason = ?report.end,
        "stream stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use crate::error::{DetectorError, TrackerError};
    use crate::tracker::{Tracker, TrackerFactory, iou_tracker_factory};
    use crate::types::{BoundingBox, TrackId};
    use crate::video::FrameDecoder;
    use image::RgbImage;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Detector replaying a script, one entry per call.
    struct ScriptedDetector {
        script: Mutex<VecDeque<Result<Vec<Detection>, String>>>,
    }

    impl ScriptedDetector {
        fn new(script: Vec<Result<Vec<Detection>, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    impl Detector for ScriptedDetector {
        fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
            match self.script.lock().pop_front() {
                Some(Ok(d)) => Ok(d),
                Some(Err(e)) => Err(DetectorError::Inference(e)),
                None => Ok(Vec::new()),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Tracker confirming every detection immediately, id = class label.
    struct EchoTracker;

    impl Tracker for EchoTracker {
        fn update(&mut self, _frame: &RgbImage, detections: &[Detection]) -> Result<Vec<Track>, TrackerError> {
            Ok(detections
                .iter()
                .map(|d| Track {
                    id: TrackId(u64::from(d.class_label) * 1000 + d.bbox.x1 as u64),
                    bbox: d.bbox,
                    confirmed: true,
                })
                .collect())
        }
    }

    struct FailingTracker;

    impl Tracker for FailingTracker {
        fn update(&mut self, _frame: &RgbImage, _detections: &[Detection]) -> Result<Vec<Track>, TrackerError> {
            Err(TrackerError::Update("matrix singular".into()))
        }
    }

    struct Blank(u32);

    impl FrameDecoder for Blank {
        fn read_frame(&mut self) -> Result<Option<RgbImage>, SourceError> {
            if self.0 == 0 {
                return Ok(None);
            }
            self.0 -= 1;
            Ok(Some(RgbImage::new(64, 48)))
        }
    }

    fn bike(x: f32, confidence: f32) -> Detection {
        Detection::new(BoundingBox::new(x, 5.0, x + 10.0, 20.0), confidence, 0)
    }

    fn echo_factory() -> TrackerFactory {
        Arc::new(|| Box::new(EchoTracker) as Box<dyn Tracker>)
    }

    fn frame(index: u64) -> Frame {
        Frame {
            index,
            image: RgbImage::new(64, 48),
        }
    }

    fn session(factory: TrackerFactory) -> (SessionStore, SessionTicket) {
        let store = SessionStore::new(factory);
        store.reset("/media/x.mp4");
        let ticket = store.current_session().unwrap();
        (store, ticket)
    }

    #[test]
    fn filters_by_class_and_strict_confidence() {
        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![Ok(vec![
            bike(1.0, 0.9),
            bike(2.0, 0.60),
            Detection::new(BoundingBox::new(3.0, 0.0, 9.0, 9.0), 0.95, 2),
        ])]);
        let mut processor = FrameProcessor::new(detector, store.clone(), ticket, PipelineConfig::default());
        let outcome = processor.process(&frame(2)).unwrap();
        assert_eq!(outcome.detections, vec![bike(1.0, 0.9)]);
        assert_eq!(store.snapshot_count(), 1);
        assert_eq!(outcome.snapshot, snapshot(1));
    }

    #[test]
    fn unconfirmed_tracks_are_not_counted() {
        let (store, ticket) = session(iou_tracker_factory(TrackerConfig::default()));
        let detector = ScriptedDetector::new(vec![Ok(vec![bike(1.0, 0.9)]), Ok(vec![bike(1.0, 0.9)])]);
        let mut processor = FrameProcessor::new(detector, store.clone(), ticket, PipelineConfig::default());
        processor.process(&frame(2)).unwrap();
        processor.process(&frame(4)).unwrap();
        assert_eq!(store.snapshot_count(), 0);
    }

    #[test]
    fn detector_failure_passes_frame_through_with_last_statistics() {
        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![
            Ok(vec![bike(1.0, 0.9), bike(30.0, 0.9)]),
            Err("gpu lost".into()),
            Ok(vec![bike(1.0, 0.9)]),
        ]);
        let mut processor = FrameProcessor::new(detector, store.clone(), ticket, PipelineConfig::default());

        assert!(processor.process(&frame(2)).unwrap().analysed);
        let skipped = processor.process(&frame(4)).unwrap();
        assert!(!skipped.analysed);
        assert!(skipped.detections.is_empty());
        assert_eq!(skipped.snapshot, snapshot(2));
        assert!(processor.process(&frame(6)).unwrap().analysed);
        assert_eq!(store.snapshot_count(), 2);
    }

    #[test]
    fn tracker_failure_is_local_to_the_frame() {
        let factory: TrackerFactory = Arc::new(|| Box::new(FailingTracker) as Box<dyn Tracker>);
        let (store, ticket) = session(factory);
        let detector = ScriptedDetector::new(vec![Ok(vec![bike(1.0, 0.9)])]);
        let mut processor = FrameProcessor::new(detector, store.clone(), ticket, PipelineConfig::default());
        let outcome = processor.process(&frame(2)).unwrap();
        assert!(!outcome.analysed);
        assert_eq!(store.snapshot_count(), 0);
    }

    #[test]
    fn replaced_session_stops_the_processor() {
        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![Ok(vec![bike(1.0, 0.9)])]);
        let mut processor = FrameProcessor::new(detector, store.clone(), ticket, PipelineConfig::default());
        store.reset("/media/y.mp4");
        assert!(processor.process(&frame(2)).is_err());
        assert_eq!(store.snapshot_count(), 0);
    }

    #[test]
    fn staggered_viewers_each_count_their_own_bikes() {
        let store = SessionStore::new(iou_tracker_factory(TrackerConfig::default()));
        store.reset("/media/x.mp4");
        let config = PipelineConfig::default();
        let mut a = FrameProcessor::new(
            ScriptedDetector::new(vec![Ok(vec![bike(0.0, 0.9)]); 10]),
            store.clone(),
            store.current_session().unwrap(),
            config.clone(),
        );
        let mut b = FrameProcessor::new(
            ScriptedDetector::new(vec![Ok(vec![bike(200.0, 0.9)]); 10]),
            store.clone(),
            store.current_session().unwrap(),
            config,
        );

        for i in 0..10 {
            a.process(&frame(2 * i + 2)).unwrap();
            b.process(&frame(2 * i + 2)).unwrap();
        }
        assert_eq!(store.snapshot_count(), 2);
    }

    fn worker(frames: u32, detector: Arc<dyn Detector>, store: &SessionStore, ticket: SessionTicket) -> StreamWorker {
        let config = PipelineConfig::default();
        let source = VideoSource::new(Box::new(Blank(frames)), config.frame_stride);
        let processor = FrameProcessor::new(detector, store.clone(), ticket, config.clone());
        StreamWorker::new(source, processor, MultipartFramer::default(), config.jpeg_quality)
    }

    #[test]
    fn empty_video_emits_no_parts() {
        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![]);
        let mut parts = Vec::new();
        let report = worker(0, detector, &store, ticket).run(|p| {
            parts.push(p);
            ControlFlow::Continue(())
        });
        assert!(parts.is_empty());
        assert_eq!(report, StreamReport { end: StreamEnd::Exhausted, frames_sent: 0 });
    }

    #[test]
    fn worker_streams_every_strided_frame_as_a_jpeg_part() {
        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![
            Ok(vec![bike(1.0, 0.9)]),
            Ok(vec![bike(1.0, 0.9), bike(30.0, 0.8)]),
            Ok(vec![]),
        ]);
        let mut parts = Vec::new();
        let report = worker(7, detector, &store, ticket).run(|p| {
            parts.push(p);
            ControlFlow::Continue(())
        });
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.end, StreamEnd::Exhausted);
        for part in &parts {
            assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8"));
            assert!(part.ends_with(b"\r\n"));
        }
        assert_eq!(store.snapshot_count(), 2);
    }

    #[test]
    fn worker_stops_when_the_client_leaves() {
        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![]);
        let mut accepted = 0;
        let report = worker(100, detector, &store, ticket).run(|_| {
            accepted += 1;
            if accepted == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
        });
        assert_eq!(report, StreamReport { end: StreamEnd::ClientGone, frames_sent: 1 });
    }

    #[test]
    fn worker_stops_when_the_session_is_replaced() {
        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![]);
        let resetter = store.clone();
        let report = worker(100, detector, &store, ticket).run(|_| {
            resetter.reset("/media/next.mp4");
            ControlFlow::Continue(())
        });
        assert_eq!(report, StreamReport { end: StreamEnd::SessionReplaced, frames_sent: 1 });
    }

    #[tokio::test]
    async fn spawned_stream_ends_when_the_video_ends() {
        struct Opener;
        impl VideoOpener for Opener {
            fn open(&self, _path: &Path) -> Result<Box<dyn FrameDecoder>, SourceError> {
                Ok(Box::new(Blank(4)))
            }
        }

        let (store, ticket) = session(echo_factory());
        let detector = ScriptedDetector::new(vec![Ok(vec![bike(1.0, 0.9)]), Ok(vec![bike(40.0, 0.9)])]);
        let mut rx = spawn_stream(Arc::new(Opener), detector, store.clone(), ticket, PipelineConfig::default());
        let mut parts = 0;
        while let Some(_part) = rx.recv().await {
            parts += 1;
        }
        assert_eq!(parts, 2);
        assert_eq!(store.snapshot_count(), 2);
    }
}
