//! The frame analysis thread.
//!
//! An [`Analyzer`] owns a [`HandLandmarker`] on a dedicated thread. It takes frames out of a
//! [`latest`][crate::frame::latest] slot, converts them to upright images and submits them, and it
//! applies lifecycle [`Command`]s to the landmarker in the order they were sent.
//!
//! While the engine is busy, frames stay in the slot, so the next frame analyzed is the newest one
//! at the time the engine becomes available.

use std::{
    io,
    panic::resume_unwind,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam::channel::{self, Receiver, Select, Sender, TryRecvError};

use crate::{
    frame::{Frame, FrameReceiver, FrameStats},
    landmarker::HandLandmarker,
};

/// Lifecycle operations performed on the analyzer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Builds the engine. Does nothing if it is already running.
    Initialize,
    /// Builds the engine again if it was shut down.
    ResumeIfClosed,
    /// Releases the engine. Frames arriving afterwards are released without being analyzed.
    Shutdown,
}

struct Status {
    forwarded: AtomicU64,
    detector_closed: AtomicBool,
}

/// Handle to the frame analysis thread.
///
/// When dropped, the thread finishes the frame it is working on, shuts the landmarker down and
/// exits. If the thread has panicked, the panic is forwarded to the thread dropping the
/// [`Analyzer`].
pub struct Analyzer {
    commands: Option<Sender<Command>>,
    handle: Option<JoinHandle<()>>,
    status: Arc<Status>,
    frames: Arc<FrameReceiver>,
}

impl Analyzer {
    /// Spawns the analysis thread.
    ///
    /// If `mirror` is set, frames are flipped horizontally after rotating them upright, which is
    /// what front-facing cameras need.
    pub fn spawn(
        mut landmarker: HandLandmarker,
        frames: FrameReceiver,
        mirror: bool,
    ) -> io::Result<Self> {
        let (commands, command_recv) = channel::unbounded();
        let status = Arc::new(Status {
            forwarded: AtomicU64::new(0),
            detector_closed: AtomicBool::new(landmarker.is_closed()),
        });
        let frames = Arc::new(frames);

        let handle = thread::Builder::new().name("analyzer".into()).spawn({
            let status = status.clone();
            let frames = frames.clone();
            move || {
                log::trace!("analyzer starting");
                run(&mut landmarker, &frames, &command_recv, &status, mirror);
                landmarker.shutdown();
                log::trace!("analyzer exiting");
            }
        })?;

        Ok(Self {
            commands: Some(commands),
            handle: Some(handle),
            status,
            frames,
        })
    }

    /// Sends a lifecycle command to the analyzer thread.
    ///
    /// Commands are applied in order. If the analyzer thread has panicked, this will propagate the
    /// panic to the calling thread.
    pub fn send(&mut self, cmd: Command) {
        let sent = match &self.commands {
            Some(commands) => commands.send(cmd).is_ok(),
            None => false,
        };
        if !sent {
            self.wait_for_exit();
        }
    }

    /// Returns the number of frames that were submitted to the landmarker.
    pub fn forwarded_frames(&self) -> u64 {
        self.status.forwarded.load(Ordering::Relaxed)
    }

    /// Returns the counters of the frame slot feeding this analyzer.
    pub fn frame_stats(&self) -> FrameStats {
        self.frames.stats()
    }

    /// Returns whether the landmarker was closed after the last processed command.
    pub fn is_detector_closed(&self) -> bool {
        self.status.detector_closed.load(Ordering::Acquire)
    }

    /// Stops the analyzer thread, waiting for the frame in flight.
    pub fn stop(self) {
        drop(self);
    }

    fn wait_for_exit(&mut self) {
        // Close the channel to signal the thread to exit.
        drop(self.commands.take());

        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(()) => {}
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }
}

impl Drop for Analyzer {
    fn drop(&mut self) {
        self.wait_for_exit();
    }
}

enum Wake {
    Command,
    Frame,
    EngineIdle,
}

/// Blocks until a command arrives, or a frame arrives while the engine can take it, or the busy
/// engine finishes.
fn wait(
    landmarker: &HandLandmarker,
    commands: &Receiver<Command>,
    frames: &Receiver<Frame>,
) -> Wake {
    let mut sel = Select::new();
    let command_op = sel.recv(commands);
    let frame_op = match landmarker.idle_signal() {
        Some(idle) if landmarker.is_busy() => {
            sel.recv(idle);
            None
        }
        _ => Some(sel.recv(frames)),
    };

    // May return spuriously. The caller re-checks with `try_recv`.
    let index = sel.ready();
    if index == command_op {
        Wake::Command
    } else if Some(index) == frame_op {
        Wake::Frame
    } else {
        Wake::EngineIdle
    }
}

fn run(
    landmarker: &mut HandLandmarker,
    frames: &FrameReceiver,
    commands: &Receiver<Command>,
    status: &Status,
    mirror: bool,
) {
    let never = channel::never();
    let mut frame_recv = frames.channel();

    loop {
        match wait(landmarker, commands, frame_recv) {
            Wake::Command => match commands.try_recv() {
                Ok(cmd) => {
                    apply(landmarker, cmd);
                    status
                        .detector_closed
                        .store(landmarker.is_closed(), Ordering::Release);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return,
            },
            Wake::Frame => match frame_recv.try_recv() {
                Ok(frame) => {
                    if analyze(landmarker, frame, mirror) {
                        status.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    log::debug!("camera disconnected from analyzer");
                    frame_recv = &never;
                }
            },
            Wake::EngineIdle => {}
        }
    }
}

fn apply(landmarker: &mut HandLandmarker, cmd: Command) {
    log::trace!("analyzer: {cmd:?}");
    match cmd {
        Command::Initialize => landmarker.initialize(),
        Command::ResumeIfClosed => {
            if landmarker.is_closed() {
                landmarker.initialize();
            }
        }
        Command::Shutdown => landmarker.shutdown(),
    }
}

/// Returns whether the frame was submitted.
fn analyze(landmarker: &mut HandLandmarker, frame: Frame, mirror: bool) -> bool {
    if landmarker.is_closed() {
        log::trace!("landmarker is closed, releasing frame from {}", frame.timestamp());
        return false;
    }

    let timestamp = frame.timestamp();
    match frame.into_image(mirror) {
        Ok(image) => landmarker.submit(image, timestamp),
        Err(e) => {
            log::warn!("skipping frame from {timestamp}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use super::*;
    use crate::{
        engine::{Engine, EngineError, LandmarkerOptions},
        frame::{latest, Rotation, Timestamp},
        image::{Image, Resolution},
        landmark::HandLandmarkerResult,
        landmarker::LandmarkerEvent,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Waits for the analyzer thread to apply the commands sent so far.
    fn wait_for_detector(analyzer: &Analyzer, closed: bool) {
        let start = std::time::Instant::now();
        while analyzer.is_detector_closed() != closed {
            assert!(start.elapsed() < TIMEOUT, "analyzer did not apply command");
            thread::sleep(Duration::from_millis(1));
        }
    }

    struct Recorder(Arc<Mutex<Vec<Resolution>>>);

    impl Engine for Recorder {
        fn detect(
            &mut self,
            image: &Image,
            _timestamp: Timestamp,
        ) -> Result<HandLandmarkerResult, EngineError> {
            self.0.lock().unwrap().push(image.resolution());
            Ok(HandLandmarkerResult::default())
        }
    }

    fn analyzer(
        mirror: bool,
    ) -> (
        Analyzer,
        crate::frame::FrameSender,
        Receiver<LandmarkerEvent>,
        Arc<Mutex<Vec<Resolution>>>,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = {
            let seen = seen.clone();
            move |_: &LandmarkerOptions| -> anyhow::Result<Box<dyn Engine>> {
                Ok(Box::new(Recorder(seen.clone())))
            }
        };
        let (events, event_recv) = channel::unbounded();
        let landmarker = HandLandmarker::new(LandmarkerOptions::default(), Arc::new(factory), events);
        let (sender, recv) = latest();
        let analyzer = Analyzer::spawn(landmarker, recv, mirror).unwrap();
        (analyzer, sender, event_recv, seen)
    }

    fn frame(width: u32, height: u32, rotation: Rotation, millis: u64) -> Frame {
        Frame::from_image(
            &Image::new(width, height),
            rotation,
            Timestamp::from_millis(millis),
        )
    }

    #[test]
    fn frames_are_released_while_closed() {
        let (analyzer, sender, events, seen) = analyzer(false);
        let released = Arc::new(AtomicU64::new(0));
        let hook = {
            let released = released.clone();
            move || {
                released.fetch_add(1, Ordering::SeqCst);
            }
        };
        sender.offer(frame(4, 4, Rotation::Deg0, 1).on_release(hook)).unwrap();
        drop(analyzer);

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn converts_and_submits() {
        let (mut analyzer, sender, events, seen) = analyzer(true);
        analyzer.send(Command::Initialize);
        wait_for_detector(&analyzer, false);
        sender.offer(frame(6, 4, Rotation::Deg90, 1)).unwrap();
        let bundle = events.recv_timeout(TIMEOUT).unwrap().unwrap();

        assert_eq!(bundle.input_resolution(), Resolution::new(4, 6));
        assert_eq!(*seen.lock().unwrap(), [Resolution::new(4, 6)]);
        assert_eq!(analyzer.forwarded_frames(), 1);
        assert!(!analyzer.is_detector_closed());
    }

    #[test]
    fn commands_apply_in_order() {
        let (mut analyzer, _sender, _events, _seen) = analyzer(false);
        analyzer.send(Command::Initialize);
        analyzer.send(Command::Shutdown);
        analyzer.send(Command::ResumeIfClosed);
        wait_for_detector(&analyzer, false);
        analyzer.send(Command::Shutdown);
        wait_for_detector(&analyzer, true);
        analyzer.stop();
    }

    #[test]
    fn invalid_frames_are_skipped() {
        let (mut analyzer, sender, events, _seen) = analyzer(false);
        analyzer.send(Command::Initialize);
        wait_for_detector(&analyzer, false);
        let broken = Frame::new(
            vec![0; 8],
            Resolution::new(4, 4),
            16,
            Rotation::Deg0,
            Timestamp::from_millis(1),
        );
        sender.offer(broken).unwrap();
        sender.offer(frame(2, 2, Rotation::Deg0, 2)).unwrap();

        let bundle = events.recv_timeout(TIMEOUT).unwrap().unwrap();
        assert_eq!(bundle.timestamp(), Timestamp::from_millis(2));
    }

    #[test]
    fn busy_engine_leaves_frames_in_slot() {
        /// Records each timestamp, then holds the engine until the test releases it.
        struct Gated {
            seen: Arc<Mutex<Vec<Timestamp>>>,
            gate: Receiver<()>,
        }

        impl Engine for Gated {
            fn detect(
                &mut self,
                _image: &Image,
                timestamp: Timestamp,
            ) -> Result<HandLandmarkerResult, EngineError> {
                self.seen.lock().unwrap().push(timestamp);
                self.gate.recv().ok();
                Ok(HandLandmarkerResult::default())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = channel::bounded(0);
        let factory = {
            let seen = seen.clone();
            move |_: &LandmarkerOptions| -> anyhow::Result<Box<dyn Engine>> {
                Ok(Box::new(Gated {
                    seen: seen.clone(),
                    gate: gate.clone(),
                }))
            }
        };
        let (events, event_recv) = channel::unbounded();
        let landmarker = HandLandmarker::new(LandmarkerOptions::default(), Arc::new(factory), events);
        let (sender, recv) = latest();
        let mut analyzer = Analyzer::spawn(landmarker, recv, false).unwrap();
        analyzer.send(Command::Initialize);
        wait_for_detector(&analyzer, false);

        let wait_seen = |n: usize| {
            let start = std::time::Instant::now();
            while seen.lock().unwrap().len() < n {
                assert!(start.elapsed() < TIMEOUT, "engine did not start");
                thread::sleep(Duration::from_millis(1));
            }
        };

        sender.offer(frame(2, 2, Rotation::Deg0, 1)).unwrap();
        wait_seen(1);

        // The engine is busy, so these pile up in the slot and only the last one survives.
        for millis in 2..=4 {
            sender.offer(frame(2, 2, Rotation::Deg0, millis)).unwrap();
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(analyzer.forwarded_frames(), 1);

        release.send(()).unwrap();
        wait_seen(2);
        release.send(()).unwrap();
        for _ in 0..2 {
            event_recv.recv_timeout(TIMEOUT).unwrap().unwrap();
        }

        assert_eq!(
            *seen.lock().unwrap(),
            [Timestamp::from_millis(1), Timestamp::from_millis(4)]
        );
        assert_eq!(analyzer.forwarded_frames(), 2);
        assert_eq!(
            analyzer.frame_stats(),
            FrameStats { received: 4, dropped: 2 }
        );
        drop(release);
        analyzer.stop();
    }

    #[test]
    fn survives_camera_disconnect() {
        let (mut analyzer, sender, _events, _seen) = analyzer(false);
        drop(sender);
        analyzer.send(Command::Initialize);
        analyzer.send(Command::Shutdown);
        assert_eq!(analyzer.frame_stats(), FrameStats::default());
        analyzer.stop();
    }
}
