//! Recognition worker lifecycle.
//!
//! One dedicated OS thread per running session reads frames, resolves the
//! faces in them and publishes the results. [`WorkerController`] owns that
//! thread: start/stop/status may be called from any thread at any time.
//!
//! All mutable lifecycle state sits behind one mutex whose critical sections
//! never span camera, inference or store I/O. A condvar on the same mutex
//! lets the worker's sleeps end early when a stop arrives. Every start bumps
//! a session number; a worker exits as soon as its session is no longer the
//! current running one.

use crate::config::Config;
use crate::events::{Event, EventSink, RecognitionBatch, WorkerStatus};
use facetrack_core::schedule::parse_time_of_day;
use facetrack_core::{
    EmbeddingSource, MatchResolver, RecencyCache, Recognition, ScheduleError, ScheduleGate,
    ScheduleWindow,
};
use facetrack_hw::camera::CameraError;
use facetrack_hw::{Frame, FrameSource};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Recognition already running.")]
    AlreadyRunning,
    #[error("Recognition not running.")]
    NotRunning,
    #[error("Invalid time format. Use HH:MM.")]
    InvalidTime(#[from] ScheduleError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),
}

/// Result of a successful stop().
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// False when the worker was still running when the wait timed out. The
    /// session is cancelled either way and the worker exits after its
    /// current frame.
    pub exited: bool,
}

/// `{status, message}` reply handed to external callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: String,
    pub message: String,
}

impl ControlResponse {
    fn success(message: &str) -> Self {
        Self {
            status: "success".into(),
            message: message.into(),
        }
    }

    fn error(err: &ControlError) -> Self {
        Self {
            status: "error".into(),
            message: err.to_string(),
        }
    }

    pub fn from_start(result: &Result<(), ControlError>) -> Self {
        match result {
            Ok(()) => Self::success("Recognition process initiated."),
            Err(e) => Self::error(e),
        }
    }

    pub fn from_stop(result: &Result<StopOutcome, ControlError>) -> Self {
        match result {
            Ok(StopOutcome { exited: true }) => Self::success("Recognition stopped."),
            Ok(StopOutcome { exited: false }) => {
                Self::success("Recognition stopped; worker is still shutting down.")
            }
            Err(e) => Self::error(e),
        }
    }
}

/// Timing knobs of the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub frame_interval: Duration,
    pub idle_poll: Duration,
    pub read_retry: Duration,
    pub status_interval: Duration,
    pub stop_timeout: Duration,
    pub warmup_frames: usize,
}

impl From<&Config> for WorkerSettings {
    fn from(config: &Config) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            idle_poll: config.idle_poll(),
            read_retry: config.read_retry(),
            status_interval: config.status_interval(),
            stop_timeout: config.stop_timeout(),
            warmup_frames: config.warmup_frames,
        }
    }
}

/// Everything a session needs besides the camera. Locked by the worker for
/// the whole session.
pub struct Pipeline {
    pub embedder: Box<dyn EmbeddingSource>,
    pub resolver: MatchResolver,
}

impl Pipeline {
    /// Detect and resolve all faces in one frame. Detection failures count
    /// as a frame without faces.
    fn process(&mut self, frame: &Frame) -> Vec<Recognition> {
        let detections = match self.embedder.detect(&frame.data, frame.width, frame.height) {
            Ok(detections) => detections,
            Err(e) => {
                tracing::warn!(error = %e, seq = frame.sequence, "face detection failed");
                return Vec::new();
            }
        };
        if detections.is_empty() {
            return Vec::new();
        }
        self.resolver.resolve_all(&detections)
    }
}

type CameraOpener = dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync;

struct WorkerHandle {
    thread: JoinHandle<()>,
    /// Disconnects when the worker thread is done.
    done: mpsc::Receiver<()>,
}

impl WorkerHandle {
    fn is_finished(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Wait up to `timeout` for the thread to exit.
    fn join_within(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.thread.join().is_err() {
                    tracing::error!("recognition worker panicked");
                }
                true
            }
        }
    }
}

#[derive(Default)]
struct State {
    running: bool,
    window: Option<ScheduleWindow>,
    last_status_emit: Option<Instant>,
    session: u64,
    worker: Option<WorkerHandle>,
}

impl State {
    fn is_current(&self, session: u64) -> bool {
        self.running && self.session == session
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: self.running,
            scheduled: self.window.is_some(),
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`, waking early if `session` is cancelled.
    /// Returns whether the session is still current.
    fn wait(&self, session: u64, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |s| s.is_current(session))
            .unwrap_or_else(PoisonError::into_inner);
        guard.is_current(session)
    }
}

/// Owns the single recognition worker.
pub struct WorkerController {
    shared: Arc<Shared>,
    pipeline: Arc<Mutex<Pipeline>>,
    open_camera: Arc<CameraOpener>,
    events: Arc<dyn EventSink>,
    cache: Arc<RecencyCache>,
    settings: WorkerSettings,
}

impl WorkerController {
    /// `open_camera` runs on the worker thread at the start of every session.
    pub fn new<F>(
        pipeline: Pipeline,
        open_camera: F,
        events: Arc<dyn EventSink>,
        settings: WorkerSettings,
    ) -> Self
    where
        F: Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync + 'static,
    {
        let cache = pipeline.resolver.cache().clone();
        Self {
            shared: Arc::new(Shared::default()),
            pipeline: Arc::new(Mutex::new(pipeline)),
            open_camera: Arc::new(open_camera),
            events,
            cache,
            settings,
        }
    }

    /// Start recognition, optionally restricted to a daily `HH:MM` window.
    /// Returns as soon as the worker thread is spawned.
    pub fn start(&self, start_time: Option<&str>, end_time: Option<&str>) -> Result<(), ControlError> {
        let mut state = self.shared.lock();
        if state.running {
            return Err(ControlError::AlreadyRunning);
        }
        let window = parse_window(start_time, end_time)?;

        if let Some(previous) = state.worker.take() {
            if previous.is_finished() {
                if previous.thread.join().is_err() {
                    tracing::error!("recognition worker panicked");
                }
            } else {
                tracing::warn!("previous worker still exiting; detaching it");
            }
        }

        state.session += 1;
        let (done_tx, done_rx) = mpsc::channel();
        let session = Session {
            id: state.session,
            shared: self.shared.clone(),
            pipeline: self.pipeline.clone(),
            open_camera: self.open_camera.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
            _done: done_tx,
        };

        let thread = std::thread::Builder::new()
            .name("facetrack-worker".into())
            .spawn(move || session.run())
            .map_err(ControlError::Spawn)?;

        state.running = true;
        state.window = window;
        state.last_status_emit = None;
        state.worker = Some(WorkerHandle {
            thread,
            done: done_rx,
        });

        match window {
            Some(w) => tracing::info!(window = %w, "recognition scheduled"),
            None => tracing::info!("recognition starting (continuous)"),
        }
        Ok(())
    }

    /// Cancel the running session and wait, bounded, for the worker to exit.
    pub fn stop(&self) -> Result<StopOutcome, ControlError> {
        let handle = {
            let mut state = self.shared.lock();
            if !state.running {
                return Err(ControlError::NotRunning);
            }
            state.running = false;
            state.window = None;
            state.worker.take()
        };
        self.shared.wake.notify_all();
        tracing::info!("stop signal sent to recognition worker");

        let exited = handle.map_or(true, |h| h.join_within(self.settings.stop_timeout));
        if !exited {
            tracing::warn!(
                timeout_ms = self.settings.stop_timeout.as_millis() as u64,
                "recognition worker did not stop in time"
            );
        }
        Ok(StopOutcome { exited })
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.lock().status()
    }

    /// Identities whose visits are currently suppressed, with remaining TTL.
    pub fn cached_identities(&self) -> Vec<(String, Duration)> {
        self.cache.snapshot()
    }
}

impl Drop for WorkerController {
    fn drop(&mut self) {
        if self.status().running {
            let _ = self.stop();
        }
    }
}

/// Empty strings count as "not supplied". A window needs both ends; a
/// single supplied time is validated and then ignored.
fn parse_window(
    start_time: Option<&str>,
    end_time: Option<&str>,
) -> Result<Option<ScheduleWindow>, ControlError> {
    let start = start_time.filter(|s| !s.is_empty()).map(parse_time_of_day).transpose()?;
    let end = end_time.filter(|s| !s.is_empty()).map(parse_time_of_day).transpose()?;
    match (start, end) {
        (Some(start), Some(end)) => Ok(Some(ScheduleWindow::new(start, end))),
        (None, None) => Ok(None),
        _ => {
            tracing::info!("only one schedule time given; running continuously");
            Ok(None)
        }
    }
}

/// State moved onto the worker thread for one session. Dropping it, on a
/// normal exit or while unwinding, leaves Running and publishes the final
/// status.
struct Session {
    id: u64,
    shared: Arc<Shared>,
    pipeline: Arc<Mutex<Pipeline>>,
    open_camera: Arc<CameraOpener>,
    events: Arc<dyn EventSink>,
    settings: WorkerSettings,
    _done: mpsc::Sender<()>,
}

impl Session {
    fn run(&self) {
        tracing::info!(session = self.id, "recognition worker started");

        // Held until the camera is released, so a worker still exiting from
        // an earlier session keeps the device until it is done.
        let mut pipeline = self.pipeline.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.shared.lock().is_current(self.id) {
            return;
        }

        let camera = match (self.open_camera)() {
            Ok(camera) => camera,
            Err(e) => {
                tracing::error!(error = %e, "could not open camera; recognition stopped");
                return;
            }
        };

        self.run_with_camera(&mut pipeline, camera);
    }

    fn run_with_camera(&self, pipeline: &mut Pipeline, mut camera: Box<dyn FrameSource>) {
        for _ in 0..self.settings.warmup_frames {
            let _ = camera.read_frame();
        }

        match pipeline.resolver.refresh() {
            Ok(known) => tracing::info!(known, "identity index loaded"),
            Err(e) => {
                tracing::error!(error = %e, "could not load identities; recognition stopped");
                return;
            }
        }

        loop {
            let window = {
                let state = self.shared.lock();
                if !state.is_current(self.id) {
                    break;
                }
                state.window
            };
            self.emit_status_throttled();

            if !ScheduleGate::new(window).is_open_now() {
                tracing::debug!("outside scheduled window; idling");
                self.shared.wait(self.id, self.settings.idle_poll);
                continue;
            }

            let frame = match camera.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "could not read frame; skipping");
                    self.shared.wait(self.id, self.settings.read_retry);
                    continue;
                }
            };

            if frame.is_dark() {
                tracing::debug!(seq = frame.sequence, "dark frame skipped");
            } else {
                let results = pipeline.process(&frame);
                if !results.is_empty() {
                    tracing::debug!(count = results.len(), "publishing recognition results");
                    self.events
                        .publish(Event::Recognition(RecognitionBatch { results }));
                }
            }

            self.shared.wait(self.id, self.settings.frame_interval);
        }

        drop(camera);
        tracing::info!(session = self.id, "recognition loop stopped and camera released");
    }

    fn emit_status_throttled(&self) {
        let status = {
            let mut state = self.shared.lock();
            let due = state
                .last_status_emit
                .map_or(true, |at| at.elapsed() >= self.settings.status_interval);
            if !due {
                return;
            }
            state.last_status_emit = Some(Instant::now());
            state.status()
        };
        self.events.publish(Event::Status(status));
    }

    /// Leave Running if this session still owns it, then announce the
    /// resulting status.
    fn finish(&self) {
        if std::thread::panicking() {
            tracing::error!(session = self.id, "recognition worker panicked");
        }
        let status = {
            let mut state = self.shared.lock();
            if state.is_current(self.id) {
                state.running = false;
                state.window = None;
            }
            state.status()
        };
        self.events.publish(Event::Status(status));
        tracing::info!(session = self.id, "recognition worker exited");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetrack_core::{
        BoundingBox, Detection, EmbedderError, Embedding, Identity, MemoryStore, ResolverConfig,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DIM: usize = 4;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn batches(&self) -> Vec<RecognitionBatch> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Recognition(batch) => Some(batch),
                    Event::Status(_) => None,
                })
                .collect()
        }

        fn statuses(&self) -> Vec<WorkerStatus> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::Status(status) => Some(status),
                    Event::Recognition(_) => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct TestCamera {
        reads: Arc<AtomicUsize>,
        open: Arc<AtomicUsize>,
        fail_reads: bool,
    }

    impl Drop for TestCamera {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl FrameSource for TestCamera {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads {
                return Err(CameraError::CaptureFailed("unplugged".into()));
            }
            Ok(Frame::from_gray(vec![128; 16], 4, 4, n as u32))
        }
    }

    /// Reports one face with the same embedding in every frame.
    struct OneFace {
        embedding: Vec<f32>,
        delay: Duration,
    }

    impl EmbeddingSource for OneFace {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<Detection>, EmbedderError> {
            std::thread::sleep(self.delay);
            Ok(vec![Detection {
                region: BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 4.0, confidence: 0.99 },
                embedding: Embedding::new(self.embedding.clone()),
            }])
        }
    }

    /// Dies inside detection, as a malformed model would.
    struct Crashes;

    impl EmbeddingSource for Crashes {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<Detection>, EmbedderError> {
            panic!("detector produced no outputs");
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            frame_interval: Duration::from_millis(5),
            idle_poll: Duration::from_secs(30),
            read_retry: Duration::from_millis(5),
            status_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(2),
            warmup_frames: 0,
        }
    }

    struct Harness {
        controller: WorkerController,
        sink: Arc<RecordingSink>,
        store: MemoryStore,
        reads: Arc<AtomicUsize>,
        /// Most cameras ever open at the same time.
        max_open: Arc<AtomicUsize>,
    }

    fn harness_with(
        store: MemoryStore,
        camera_ok: bool,
        fail_reads: bool,
        embedder: impl EmbeddingSource + 'static,
        settings: WorkerSettings,
    ) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let reads = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let max_open = Arc::new(AtomicUsize::new(0));
        let resolver = MatchResolver::new(
            Box::new(store.clone()),
            Arc::new(RecencyCache::default()),
            ResolverConfig::with_tolerance(DIM, 0.6),
        );
        let pipeline = Pipeline {
            embedder: Box::new(embedder),
            resolver,
        };
        let camera_reads = reads.clone();
        let camera_max = max_open.clone();
        let controller = WorkerController::new(
            pipeline,
            move || {
                if !camera_ok {
                    return Err(CameraError::DeviceNotFound("/dev/video9".into()));
                }
                let now_open = open.fetch_add(1, Ordering::SeqCst) + 1;
                camera_max.fetch_max(now_open, Ordering::SeqCst);
                Ok(Box::new(TestCamera {
                    reads: camera_reads.clone(),
                    open: open.clone(),
                    fail_reads,
                }) as Box<dyn FrameSource>)
            },
            sink.clone(),
            settings,
        );
        Harness {
            controller,
            sink,
            store,
            reads,
            max_open,
        }
    }

    fn harness(store: MemoryStore) -> Harness {
        harness_with(
            store,
            true,
            false,
            OneFace { embedding: vec![0.1, 0.2, 0.3, 0.4], delay: Duration::ZERO },
            settings(),
        )
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn known(id: &str, values: [f32; DIM]) -> Identity {
        Identity {
            id: id.into(),
            name: Some("Grace".into()),
            email: None,
            embedding: Some(Embedding::new(values.to_vec())),
            last_visit: chrono::Utc::now(),
            visit_count: 1,
        }
    }

    #[test]
    fn test_start_stop_transitions() {
        let h = harness(MemoryStore::new());
        assert_eq!(h.controller.status(), WorkerStatus { running: false, scheduled: false });

        h.controller.start(None, None).unwrap();
        assert_eq!(h.controller.status(), WorkerStatus { running: true, scheduled: false });
        assert!(matches!(h.controller.start(None, None), Err(ControlError::AlreadyRunning)));
        assert!(h.controller.status().running);

        let outcome = h.controller.stop().unwrap();
        assert!(outcome.exited);
        assert!(!h.controller.status().running);
        assert!(matches!(h.controller.stop(), Err(ControlError::NotRunning)));

        // The final event announces the stop.
        assert_eq!(
            h.sink.statuses().last(),
            Some(&WorkerStatus { running: false, scheduled: false })
        );
    }

    #[test]
    fn test_restart_after_stop() {
        let h = harness(MemoryStore::new());
        h.controller.start(None, None).unwrap();
        h.controller.stop().unwrap();
        h.controller.start(None, None).unwrap();
        assert!(h.controller.status().running);
        h.controller.stop().unwrap();
    }

    #[test]
    fn test_invalid_schedule_leaves_state_untouched() {
        let h = harness(MemoryStore::new());
        assert!(matches!(
            h.controller.start(Some("25:00"), Some("06:00")),
            Err(ControlError::InvalidTime(_))
        ));
        assert!(matches!(
            h.controller.start(Some("22:00"), Some("6pm")),
            Err(ControlError::InvalidTime(_))
        ));
        assert!(matches!(
            h.controller.start(Some("7am"), None),
            Err(ControlError::InvalidTime(_))
        ));
        assert_eq!(h.controller.status(), WorkerStatus { running: false, scheduled: false });
        assert_eq!(h.reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_single_time_runs_continuously() {
        let h = harness(MemoryStore::new());
        h.controller.start(Some("22:00"), None).unwrap();
        assert_eq!(h.controller.status(), WorkerStatus { running: true, scheduled: false });
        h.controller.stop().unwrap();

        h.controller.start(None, Some("06:00")).unwrap();
        assert_eq!(h.controller.status(), WorkerStatus { running: true, scheduled: false });
        h.controller.stop().unwrap();
    }

    #[test]
    fn test_worker_panic_reverts_to_stopped() {
        let h = harness_with(MemoryStore::new(), true, false, Crashes, settings());
        h.controller.start(None, None).unwrap();

        assert!(wait_until(|| !h.controller.status().running));
        assert!(wait_until(|| h
            .sink
            .statuses()
            .contains(&WorkerStatus { running: false, scheduled: false })));
        assert!(matches!(h.controller.stop(), Err(ControlError::NotRunning)));

        // Not stuck in Running: a new session is accepted.
        h.controller.start(None, None).unwrap();
        assert!(wait_until(|| !h.controller.status().running));
    }

    #[test]
    fn test_empty_strings_mean_continuous() {
        let h = harness(MemoryStore::new());
        h.controller.start(Some(""), Some("")).unwrap();
        assert!(!h.controller.status().scheduled);
        h.controller.stop().unwrap();
    }

    #[test]
    fn test_scheduled_status() {
        let h = harness(MemoryStore::new());
        h.controller.start(Some("22:00"), Some("06:00")).unwrap();
        assert_eq!(h.controller.status(), WorkerStatus { running: true, scheduled: true });
        h.controller.stop().unwrap();
        assert_eq!(h.controller.status(), WorkerStatus { running: false, scheduled: false });
    }

    #[test]
    fn test_new_visitor_end_to_end() {
        let h = harness(MemoryStore::new());
        h.controller.start(None, None).unwrap();

        assert!(wait_until(|| h.reads.load(Ordering::SeqCst) >= 10));
        h.controller.stop().unwrap();

        let batches = h.sink.batches();
        assert_eq!(batches.len(), 1, "later frames are suppressed: {batches:?}");
        let identities = h.store.snapshot();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].visit_count, 1);
        assert_eq!(
            batches[0].results,
            vec![Recognition { identity_id: identities[0].id.clone(), is_new: true }]
        );

        let cached: Vec<String> = h.controller.cached_identities().into_iter().map(|(id, _)| id).collect();
        assert_eq!(cached, vec![identities[0].id.clone()]);
    }

    #[test]
    fn test_returning_visitor_end_to_end() {
        let store = MemoryStore::with_identities(vec![known("grace", [0.1, 0.2, 0.3, 0.45])]);
        let h = harness(store);
        h.controller.start(None, None).unwrap();

        assert!(wait_until(|| h.reads.load(Ordering::SeqCst) >= 10));
        h.controller.stop().unwrap();

        let batches = h.sink.batches();
        assert_eq!(
            batches,
            vec![RecognitionBatch {
                results: vec![Recognition { identity_id: "grace".into(), is_new: false }],
            }]
        );
        let grace = h.store.get("grace").unwrap();
        assert_eq!(grace.visit_count, 2);
        assert_eq!(h.store.snapshot().len(), 1);
    }

    #[test]
    fn test_camera_failure_reverts_to_stopped() {
        let h = harness_with(
            MemoryStore::new(),
            false,
            false,
            OneFace { embedding: vec![0.0; DIM], delay: Duration::ZERO },
            settings(),
        );
        h.controller.start(None, None).unwrap();

        assert!(wait_until(|| !h.controller.status().running));
        assert!(wait_until(|| h
            .sink
            .statuses()
            .contains(&WorkerStatus { running: false, scheduled: false })));
        assert!(matches!(h.controller.stop(), Err(ControlError::NotRunning)));

        // Restartable after the failure.
        h.controller.start(None, None).unwrap();
    }

    #[test]
    fn test_read_failures_are_transient() {
        let h = harness_with(
            MemoryStore::new(),
            true,
            true,
            OneFace { embedding: vec![0.0; DIM], delay: Duration::ZERO },
            settings(),
        );
        h.controller.start(None, None).unwrap();

        assert!(wait_until(|| h.reads.load(Ordering::SeqCst) >= 5));
        assert!(h.controller.status().running);
        assert!(h.sink.batches().is_empty());
        assert!(h.controller.stop().unwrap().exited);
    }

    #[test]
    fn test_closed_schedule_never_reads_camera() {
        let now = chrono::Local::now().time();
        let start = (now + chrono::Duration::hours(2)).format("%H:%M").to_string();
        let end = (now + chrono::Duration::hours(3)).format("%H:%M").to_string();

        let h = harness(MemoryStore::new());
        h.controller.start(Some(&start), Some(&end)).unwrap();
        assert!(wait_until(|| !h.sink.statuses().is_empty()));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(h.reads.load(Ordering::SeqCst), 0);

        // The 30 s idle wait is interrupted by stop.
        let began = Instant::now();
        assert!(h.controller.stop().unwrap().exited);
        assert!(began.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_first_iteration_publishes_status() {
        let h = harness(MemoryStore::new());
        h.controller.start(None, None).unwrap();
        assert!(wait_until(|| h
            .sink
            .statuses()
            .contains(&WorkerStatus { running: true, scheduled: false })));
        h.controller.stop().unwrap();
    }

    #[test]
    fn test_slow_worker_stop_times_out_but_reports_success() {
        let mut slow = settings();
        slow.stop_timeout = Duration::from_millis(20);
        let h = harness_with(
            MemoryStore::new(),
            true,
            false,
            OneFace { embedding: vec![0.0; DIM], delay: Duration::from_millis(300) },
            slow,
        );
        h.controller.start(None, None).unwrap();
        assert!(wait_until(|| h.reads.load(Ordering::SeqCst) >= 1));

        let outcome = h.controller.stop().unwrap();
        assert!(!outcome.exited);
        assert!(!h.controller.status().running);
        assert_eq!(
            ControlResponse::from_stop(&Ok(outcome)).status,
            "success"
        );

        // A new session may start while the old worker is still finishing.
        h.controller.start(None, None).unwrap();
        assert!(h.controller.status().running);
        assert!(wait_until(|| h.reads.load(Ordering::SeqCst) >= 2));
        h.controller.stop().unwrap();

        // The new session waited for the old one to release the camera.
        assert_eq!(h.max_open.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_control_responses() {
        assert_eq!(
            ControlResponse::from_start(&Ok(())),
            ControlResponse { status: "success".into(), message: "Recognition process initiated.".into() }
        );
        assert_eq!(
            ControlResponse::from_start(&Err(ControlError::AlreadyRunning)),
            ControlResponse { status: "error".into(), message: "Recognition already running.".into() }
        );
        assert_eq!(
            ControlResponse::from_stop(&Err(ControlError::NotRunning)).message,
            "Recognition not running."
        );
        assert_eq!(
            ControlResponse::from_stop(&Ok(StopOutcome { exited: true })).message,
            "Recognition stopped."
        );
    }
}
