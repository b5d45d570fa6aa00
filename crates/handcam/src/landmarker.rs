//! Lifecycle wrapper around the landmark [`Engine`].
//!
//! [`HandLandmarker`] owns at most one engine at a time. The engine runs on its own worker thread,
//! which accepts one submission at a time and reports exactly one [`LandmarkerEvent`] per
//! accepted submission over the channel passed to [`HandLandmarker::new`]. Submissions made while
//! the engine is busy are dropped. Completions of submissions made before a
//! [`HandLandmarker::shutdown`] are discarded.

use std::{
    fmt, io,
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use pawawwewism::Worker;

use crate::{
    engine::{Engine, EngineFactory, LandmarkerOptions},
    frame::Timestamp,
    image::Image,
    landmark::ResultBundle,
    timer::{FpsCounter, Timer},
};

/// Completion of one submission, or an initialization failure.
pub type LandmarkerEvent = Result<ResultBundle, LandmarkerError>;

/// Errors reported over the [`LandmarkerEvent`] channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LandmarkerError {
    /// The engine could not be constructed. Reported once per failed [`HandLandmarker::initialize`].
    Initialization(String),
    /// The engine failed to process a frame. The pipeline keeps running.
    Detection(String),
}

impl LandmarkerError {
    /// Returns the text shown to the user for this error.
    pub fn user_message(&self) -> String {
        match self {
            LandmarkerError::Initialization(_) => {
                "Hand Landmarker failed to initialize. See error logs for details".into()
            }
            LandmarkerError::Detection(msg) if msg.is_empty() => {
                "An unknown error has occurred".into()
            }
            LandmarkerError::Detection(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for LandmarkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LandmarkerError::Initialization(msg) => {
                write!(f, "hand landmarker failed to initialize: {msg}")
            }
            LandmarkerError::Detection(msg) => write!(f, "hand landmark detection failed: {msg}"),
        }
    }
}

impl std::error::Error for LandmarkerError {}

struct Job {
    image: Image,
    timestamp: Timestamp,
}

struct Running {
    worker: Worker<Job>,
    /// Holds a token while the engine waits for a submission.
    idle: Receiver<()>,
    /// Keeps `idle` connected if the engine thread dies.
    _idle_sender: Sender<()>,
}

/// Streaming hand landmark detector.
///
/// Lifecycle methods take `&mut self`; the landmarker is meant to be owned by a single thread (the
/// analyzer thread) that both submits frames and drives its lifecycle.
pub struct HandLandmarker {
    options: LandmarkerOptions,
    factory: Arc<dyn EngineFactory>,
    events: Sender<LandmarkerEvent>,
    /// Bumped whenever an engine is started or shut down. Engine workers only report completions
    /// while the generation they were started with is current, and hold the lock while doing so.
    generation: Arc<Mutex<u64>>,
    running: Option<Running>,
    last_timestamp: Option<Timestamp>,
}

impl HandLandmarker {
    /// Creates a closed landmarker. Call [`HandLandmarker::initialize`] to start the engine.
    pub fn new(
        options: LandmarkerOptions,
        factory: Arc<dyn EngineFactory>,
        events: Sender<LandmarkerEvent>,
    ) -> Self {
        Self {
            options,
            factory,
            events,
            generation: Arc::new(Mutex::new(0)),
            running: None,
            last_timestamp: None,
        }
    }

    pub fn options(&self) -> &LandmarkerOptions {
        &self.options
    }

    /// Constructs the engine and starts accepting submissions.
    ///
    /// If the engine cannot be constructed, a [`LandmarkerError::Initialization`] is sent on the
    /// event channel and the landmarker stays closed. Does nothing if the landmarker is already
    /// open.
    pub fn initialize(&mut self) {
        if self.running.is_some() {
            log::debug!("hand landmarker is already initialized");
            return;
        }

        let engine = match self.factory.create(&self.options) {
            Ok(engine) => engine,
            Err(e) => {
                log::error!("failed to create landmark engine: {e:#}");
                self.report_init_failure(format!("{e:#}"));
                return;
            }
        };

        let generation = {
            let mut current = lock(&self.generation);
            *current += 1;
            *current
        };
        let (idle_sender, idle) = channel::bounded(1);
        idle_sender.send(()).ok();
        match spawn_engine_worker(
            engine,
            generation,
            self.generation.clone(),
            self.events.clone(),
            idle_sender.clone(),
        ) {
            Ok(worker) => {
                log::debug!(
                    "hand landmarker initialized with '{}'",
                    self.options.get_model_asset_path().display()
                );
                self.running = Some(Running {
                    worker,
                    idle,
                    _idle_sender: idle_sender,
                });
                self.last_timestamp = None;
            }
            Err(e) => {
                log::error!("failed to spawn landmark engine worker: {e}");
                self.report_init_failure(e.to_string());
            }
        }
    }

    fn report_init_failure(&self, detail: String) {
        self.events
            .send(Err(LandmarkerError::Initialization(detail)))
            .ok();
    }

    /// Submits an upright image for detection, without waiting for the engine.
    ///
    /// Returns whether the image was accepted. It is dropped if the landmarker is closed, if the
    /// engine is still busy with the previous submission, or if `timestamp` is not later than the
    /// previous submission's.
    pub fn submit(&mut self, image: Image, timestamp: Timestamp) -> bool {
        let Some(running) = &mut self.running else {
            log::trace!("hand landmarker is closed, ignoring frame from {timestamp}");
            return false;
        };

        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                log::warn!(
                    "dropping frame from {timestamp}: timestamps must increase (previous: {last})"
                );
                return false;
            }
        }

        match running.idle.try_recv() {
            Ok(()) => {}
            Err(TryRecvError::Empty) => {
                log::trace!("engine is busy, dropping frame from {timestamp}");
                return false;
            }
            Err(TryRecvError::Disconnected) => unreachable!(),
        }
        self.last_timestamp = Some(timestamp);

        running.worker.send(Job { image, timestamp });
        true
    }

    /// Returns whether a submission is in flight.
    pub fn is_busy(&self) -> bool {
        self.running
            .as_ref()
            .map_or(false, |running| running.idle.is_empty())
    }

    /// Returns a channel that becomes ready when the engine can accept a submission.
    ///
    /// Only wait for readiness (e.g. with [`Select::ready`][channel::Select::ready]). Receiving
    /// from the channel takes the engine's idle token and makes the next [`submit`] drop its
    /// image.
    ///
    /// [`submit`]: HandLandmarker::submit
    pub(crate) fn idle_signal(&self) -> Option<&Receiver<()>> {
        self.running.as_ref().map(|running| &running.idle)
    }

    /// Releases the engine.
    ///
    /// Waits for the in-flight detection (if any) to finish. Its completion is discarded.
    pub fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            *lock(&self.generation) += 1;
            drop(running);
            log::debug!("hand landmarker closed");
        }
    }

    /// Returns whether the landmarker currently has no engine.
    pub fn is_closed(&self) -> bool {
        self.running.is_none()
    }
}

fn lock(generation: &Mutex<u64>) -> std::sync::MutexGuard<'_, u64> {
    generation.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for HandLandmarker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_engine_worker(
    mut engine: Box<dyn Engine>,
    generation: u64,
    current: Arc<Mutex<u64>>,
    events: Sender<LandmarkerEvent>,
    idle: Sender<()>,
) -> io::Result<Worker<Job>> {
    let mut fps = FpsCounter::new("hand landmarker");
    let t_detect = Timer::new("detect");

    Worker::builder()
        .name("hand landmarker")
        .spawn(move |Job { image, timestamp }| {
            let start = Instant::now();
            let res = t_detect.time(|| engine.detect(&image, timestamp));
            let inference_time = start.elapsed();

            let event = match res {
                Ok(result) => Ok(ResultBundle::new(
                    result,
                    image.resolution(),
                    timestamp,
                    inference_time,
                )),
                Err(e) => {
                    log::debug!("detection failed for frame from {timestamp}: {e}");
                    Err(LandmarkerError::Detection(e.to_string()))
                }
            };
            fps.tick_with([&t_detect]);

            // The engine accepts a new submission before its event is delivered.
            idle.try_send(()).ok();

            let latest = lock(&current);
            if *latest == generation {
                events.send(event).ok();
            } else {
                log::trace!("discarding completion for {timestamp}: landmarker was shut down");
            }
        })
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use crossbeam::channel::{self, Receiver};

    use super::*;
    use crate::{
        engine::EngineError,
        landmark::{Hand, HandLandmarkerResult, Handedness, Landmark, NUM_LANDMARKS},
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Engine that reports one hand and records every timestamp it sees.
    struct FakeEngine {
        seen: Arc<Mutex<Vec<Timestamp>>>,
        fail: bool,
    }

    impl Engine for FakeEngine {
        fn detect(
            &mut self,
            _image: &Image,
            timestamp: Timestamp,
        ) -> Result<HandLandmarkerResult, EngineError> {
            self.seen.lock().unwrap().push(timestamp);
            if self.fail {
                return Err(EngineError::new("model exploded"));
            }
            Ok(HandLandmarkerResult::new(vec![Hand::new(
                [Landmark::new(0.5, 0.5, 0.0); NUM_LANDMARKS],
                Handedness::Right,
                0.9,
            )]))
        }
    }

    struct Fixture {
        landmarker: HandLandmarker,
        events: Receiver<LandmarkerEvent>,
        seen: Arc<Mutex<Vec<Timestamp>>>,
        created: Arc<AtomicUsize>,
    }

    fn fixture(fail: bool) -> Fixture {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::new(AtomicUsize::new(0));
        let factory = {
            let seen = seen.clone();
            let created = created.clone();
            move |_: &LandmarkerOptions| -> anyhow::Result<Box<dyn Engine>> {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeEngine {
                    seen: seen.clone(),
                    fail,
                }))
            }
        };
        let (sender, events) = channel::unbounded();
        Fixture {
            landmarker: HandLandmarker::new(
                LandmarkerOptions::default(),
                Arc::new(factory),
                sender,
            ),
            events,
            seen,
            created,
        }
    }

    fn image() -> Image {
        Image::new(8, 6)
    }

    #[test]
    fn starts_closed() {
        let f = fixture(false);
        assert!(f.landmarker.is_closed());
        assert_eq!(f.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn submit_delivers_result() {
        let mut f = fixture(false);
        f.landmarker.initialize();
        assert!(!f.landmarker.is_closed());

        assert!(f.landmarker.submit(image(), Timestamp::from_millis(7)));
        let bundle = f.events.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(bundle.timestamp(), Timestamp::from_millis(7));
        assert_eq!(bundle.input_resolution(), image().resolution());
        assert_eq!(bundle.result().hands().len(), 1);
    }

    #[test]
    fn detection_errors_are_reported() {
        let mut f = fixture(true);
        f.landmarker.initialize();
        for millis in 1..=2 {
            assert!(f.landmarker.submit(image(), Timestamp::from_millis(millis)));
            let err = f.events.recv_timeout(TIMEOUT).unwrap().unwrap_err();
            assert_eq!(err, LandmarkerError::Detection("model exploded".into()));
        }
        // Still open after runtime errors.
        assert!(!f.landmarker.is_closed());
    }

    #[test]
    fn submit_after_shutdown_is_noop() {
        let mut f = fixture(false);
        f.landmarker.initialize();
        f.landmarker.shutdown();
        assert!(f.landmarker.is_closed());

        assert!(!f.landmarker.submit(image(), Timestamp::from_millis(1)));
        assert!(f.events.try_recv().is_err());
        assert!(f.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn reinitialize_after_shutdown() {
        let mut f = fixture(false);
        f.landmarker.initialize();
        f.landmarker.shutdown();
        f.landmarker.initialize();
        assert!(!f.landmarker.is_closed());
        assert_eq!(f.created.load(Ordering::SeqCst), 2);

        // Timestamps restart with the new engine.
        f.landmarker.submit(image(), Timestamp::from_millis(1));
        assert!(f.events.recv_timeout(TIMEOUT).unwrap().is_ok());
    }

    #[test]
    fn initialize_twice_builds_one_engine() {
        let mut f = fixture(false);
        f.landmarker.initialize();
        f.landmarker.initialize();
        assert_eq!(f.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_increasing_timestamps_are_dropped() {
        let mut f = fixture(false);
        f.landmarker.initialize();
        assert!(f.landmarker.submit(image(), Timestamp::from_millis(5)));
        f.events.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert!(!f.landmarker.submit(image(), Timestamp::from_millis(5)));
        assert!(!f.landmarker.submit(image(), Timestamp::from_millis(3)));
        assert!(f.landmarker.submit(image(), Timestamp::from_millis(6)));
        f.landmarker.shutdown();

        assert_eq!(
            *f.seen.lock().unwrap(),
            [Timestamp::from_millis(5), Timestamp::from_millis(6)]
        );
    }

    #[test]
    fn initialization_failure_is_reported_once() {
        let factory = |_: &LandmarkerOptions| -> anyhow::Result<Box<dyn Engine>> {
            anyhow::bail!("GPU delegate is not supported")
        };
        let (sender, events) = channel::unbounded();
        let mut landmarker =
            HandLandmarker::new(LandmarkerOptions::default(), Arc::new(factory), sender);
        landmarker.initialize();

        assert!(landmarker.is_closed());
        let err = events.try_recv().unwrap().unwrap_err();
        assert_eq!(
            err,
            LandmarkerError::Initialization("GPU delegate is not supported".into())
        );
        assert_eq!(
            err.user_message(),
            "Hand Landmarker failed to initialize. See error logs for details"
        );
        assert!(events.try_recv().is_err());

        // Degraded, but submitting is still harmless.
        assert!(!landmarker.submit(image(), Timestamp::from_millis(1)));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn in_flight_completion_is_discarded_on_shutdown() {
        struct SlowEngine(Arc<AtomicUsize>);

        impl Engine for SlowEngine {
            fn detect(
                &mut self,
                _image: &Image,
                _timestamp: Timestamp,
            ) -> Result<HandLandmarkerResult, EngineError> {
                std::thread::sleep(Duration::from_millis(50));
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(HandLandmarkerResult::default())
            }
        }

        let done = Arc::new(AtomicUsize::new(0));
        let factory = {
            let done = done.clone();
            move |_: &LandmarkerOptions| -> anyhow::Result<Box<dyn Engine>> {
                Ok(Box::new(SlowEngine(done.clone())))
            }
        };
        let (sender, events) = channel::unbounded();
        let mut landmarker =
            HandLandmarker::new(LandmarkerOptions::default(), Arc::new(factory), sender);
        landmarker.initialize();
        landmarker.submit(image(), Timestamp::from_millis(1));
        landmarker.shutdown();

        // `shutdown` waited for the detection, but nothing was delivered.
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn submit_while_busy_is_dropped() {
        struct Gated(Receiver<()>);

        impl Engine for Gated {
            fn detect(
                &mut self,
                _image: &Image,
                _timestamp: Timestamp,
            ) -> Result<HandLandmarkerResult, EngineError> {
                self.0.recv().ok();
                Ok(HandLandmarkerResult::default())
            }
        }

        let (release, gate) = channel::bounded(0);
        let factory = move |_: &LandmarkerOptions| -> anyhow::Result<Box<dyn Engine>> {
            Ok(Box::new(Gated(gate.clone())))
        };
        let (sender, events) = channel::unbounded();
        let mut landmarker =
            HandLandmarker::new(LandmarkerOptions::default(), Arc::new(factory), sender);
        landmarker.initialize();
        assert!(!landmarker.is_busy());

        assert!(landmarker.submit(image(), Timestamp::from_millis(1)));
        assert!(landmarker.is_busy());
        // Returns right away while the engine is held.
        assert!(!landmarker.submit(image(), Timestamp::from_millis(2)));

        release.send(()).unwrap();
        let bundle = events.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(bundle.timestamp(), Timestamp::from_millis(1));
        assert!(!landmarker.is_busy());

        // The dropped timestamp does not count as submitted.
        assert!(landmarker.submit(image(), Timestamp::from_millis(2)));
        release.send(()).unwrap();
        let bundle = events.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(bundle.timestamp(), Timestamp::from_millis(2));

        drop(release);
        landmarker.shutdown();
        assert!(!landmarker.is_busy());
    }

    #[test]
    fn completion_racing_shutdown_is_discarded() {
        struct Gated(Receiver<()>);

        impl Engine for Gated {
            fn detect(
                &mut self,
                _image: &Image,
                _timestamp: Timestamp,
            ) -> Result<HandLandmarkerResult, EngineError> {
                self.0.recv().ok();
                Ok(HandLandmarkerResult::default())
            }
        }

        let (release, gate) = channel::bounded(0);
        let factory = move |_: &LandmarkerOptions| -> anyhow::Result<Box<dyn Engine>> {
            Ok(Box::new(Gated(gate.clone())))
        };
        let (sender, events) = channel::unbounded();
        let mut landmarker =
            HandLandmarker::new(LandmarkerOptions::default(), Arc::new(factory), sender);
        landmarker.initialize();
        assert!(landmarker.submit(image(), Timestamp::from_millis(1)));

        // Finish the detection while the generation is locked, then bump it the way `shutdown`
        // does before the engine thread gets to report.
        let generation = landmarker.generation.clone();
        let mut current = lock(&generation);
        release.send(()).unwrap();
        let start = Instant::now();
        while landmarker.is_busy() {
            assert!(start.elapsed() < TIMEOUT, "engine did not finish");
            std::thread::sleep(Duration::from_millis(1));
        }
        *current += 1;
        drop(current);

        landmarker.shutdown();
        assert!(events.try_recv().is_err());
    }
}
