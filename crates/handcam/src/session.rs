//! Lifecycle of the camera to overlay pipeline.
//!
//! A [`Session`] is driven by the host UI through the `on_*` methods, mirroring the usual
//! create/resume/pause/destroy lifecycle of an app window. It acquires the camera permission,
//! binds the [`Camera`], runs the [`Analyzer`] thread and applies completed detections to the
//! [`Overlay`] whenever the UI thread calls [`Session::pump`].

use std::sync::Arc;

use crossbeam::channel::{self, Sender};

use crate::{
    analyzer::{Analyzer, Command},
    engine::{EngineFactory, LandmarkerOptions},
    frame::{self, FrameSender, FrameStats},
    image::Resolution,
    landmarker::{HandLandmarker, LandmarkerEvent},
    overlay::{Notifier, Overlay, ResultSink},
};

const MSG_PERMISSION_GRANTED: &str = "Permission granted";
const MSG_PERMISSION_REQUIRED: &str = "Camera permission is required to use this app.";
const MSG_PERMISSION_DENIED: &str = "Permission denied. Enable it in app settings.";
const MSG_CAMERA_FAILED: &str = "Camera initialization failed.";

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// [`Session::on_create`] has not been called yet.
    Uninitialized,
    /// Waiting for the user to answer a permission request.
    PermissionPending,
    /// The camera is bound and frames are analyzed.
    Active,
    /// The detector is released. The camera binding is kept.
    Paused,
    /// Terminal. Entered on destruction or when the permission was denied.
    Destroyed,
}

/// The user's answer to a camera permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionResult {
    Granted,
    /// `can_ask_again` is `false` if the user asked not to be asked again.
    Denied { can_ask_again: bool },
}

/// Which camera to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LensFacing {
    /// The camera on the back of the device, or a stationary webcam.
    #[default]
    Back,
    /// The user-facing camera. Frames are mirrored so the preview behaves like a mirror.
    Front,
}

impl LensFacing {
    /// Returns whether frames from this camera are flipped horizontally before analysis.
    pub fn mirrors(self) -> bool {
        self == LensFacing::Front
    }
}

/// Access to the platform's camera permission.
pub trait Permissions {
    fn is_granted(&mut self) -> bool;

    /// Asks the user for the permission.
    ///
    /// The answer is delivered later through [`Session::on_permission_result`].
    fn request(&mut self);
}

/// A camera that produces frames.
pub trait Camera {
    /// Starts delivering frames from the camera selected by `facing` to `frames`.
    ///
    /// Frames should be offered with [`FrameSender::offer`]; the camera should stop once that
    /// fails.
    fn bind(&mut self, facing: LensFacing, frames: FrameSender) -> anyhow::Result<()>;

    /// Stops delivering frames.
    fn unbind(&mut self);
}

/// Configuration of a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    facing: LensFacing,
    landmarker: LandmarkerOptions,
}

impl SessionOptions {
    pub fn lens_facing(self, facing: LensFacing) -> Self {
        Self { facing, ..self }
    }

    pub fn landmarker(self, landmarker: LandmarkerOptions) -> Self {
        Self { landmarker, ..self }
    }

    pub fn get_lens_facing(&self) -> LensFacing {
        self.facing
    }

    pub fn get_landmarker(&self) -> &LandmarkerOptions {
        &self.landmarker
    }
}

/// A camera to overlay session.
///
/// Like the [`Overlay`] it owns, a session stays on the UI thread.
pub struct Session<P, C, N> {
    state: SessionState,
    options: SessionOptions,
    factory: Arc<dyn EngineFactory>,
    permissions: P,
    camera: C,
    camera_bound: bool,
    sink: ResultSink<N>,
    events: Sender<LandmarkerEvent>,
    analyzer: Option<Analyzer>,
}

impl<P: Permissions, C: Camera, N: Notifier> Session<P, C, N> {
    /// Creates an uninitialized session drawing onto a view of size `view`.
    pub fn new(
        options: SessionOptions,
        factory: Arc<dyn EngineFactory>,
        permissions: P,
        camera: C,
        notifier: N,
        view: Resolution,
    ) -> Self {
        let (events, event_recv) = channel::unbounded();
        Self {
            state: SessionState::Uninitialized,
            options,
            factory,
            permissions,
            camera,
            camera_bound: false,
            sink: ResultSink::new(Overlay::new(view), notifier, event_recv),
            events,
            analyzer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[track_caller]
    fn assert_created(&self) {
        assert!(
            self.state != SessionState::Uninitialized,
            "session used before `on_create`"
        );
    }

    /// Starts the session.
    ///
    /// If the camera permission is already granted, the camera is bound and the detector is
    /// initialized right away. Otherwise the permission is requested.
    pub fn on_create(&mut self) {
        if self.state != SessionState::Uninitialized {
            log::warn!("`on_create` called in state {:?}, ignoring", self.state);
            return;
        }

        if self.permissions.is_granted() {
            self.start();
        } else {
            log::debug!("camera permission missing, requesting it");
            self.state = SessionState::PermissionPending;
            self.permissions.request();
        }
    }

    /// Delivers the user's answer to a permission request.
    ///
    /// # Panics
    ///
    /// Panics if called before [`Session::on_create`].
    pub fn on_permission_result(&mut self, result: PermissionResult) {
        self.assert_created();
        if self.state != SessionState::PermissionPending {
            log::warn!("unexpected permission result in state {:?}", self.state);
            return;
        }

        match result {
            PermissionResult::Granted => {
                self.sink.notify(MSG_PERMISSION_GRANTED);
                if self.analyzer.is_some() {
                    // Permission was revoked while paused.
                    self.resume_detector();
                } else {
                    self.start();
                }
            }
            PermissionResult::Denied { can_ask_again } => {
                log::warn!("camera permission denied (can ask again: {can_ask_again})");
                self.sink.notify(if can_ask_again {
                    MSG_PERMISSION_REQUIRED
                } else {
                    MSG_PERMISSION_DENIED
                });
                self.teardown();
            }
        }
    }

    /// Called when the UI returns to the foreground.
    ///
    /// Re-initializes the detector if it was released. Calling this repeatedly is harmless.
    ///
    /// # Panics
    ///
    /// Panics if called before [`Session::on_create`].
    pub fn on_resume(&mut self) {
        self.assert_created();
        match self.state {
            SessionState::Active | SessionState::Paused => {
                if !self.permissions.is_granted() {
                    log::warn!("camera permission was revoked, requesting it again");
                    self.state = SessionState::PermissionPending;
                    self.permissions.request();
                    return;
                }
                self.resume_detector();
            }
            SessionState::PermissionPending | SessionState::Destroyed => {
                log::debug!("`on_resume` in state {:?}, nothing to do", self.state);
            }
            SessionState::Uninitialized => unreachable!(),
        }
    }

    /// Called when the UI goes to the background. Releases the detector.
    ///
    /// A session waiting for a re-granted permission releases its detector too, but stays in
    /// [`SessionState::PermissionPending`].
    ///
    /// # Panics
    ///
    /// Panics if called before [`Session::on_create`].
    pub fn on_pause(&mut self) {
        self.assert_created();
        match self.state {
            SessionState::Active | SessionState::PermissionPending => {
                if let Some(analyzer) = &mut self.analyzer {
                    analyzer.send(Command::Shutdown);
                }
                if self.state == SessionState::Active {
                    self.state = SessionState::Paused;
                }
            }
            SessionState::Paused | SessionState::Destroyed => {
                log::debug!("`on_pause` in state {:?}, nothing to do", self.state);
            }
            SessionState::Uninitialized => unreachable!(),
        }
    }

    /// Ends the session.
    ///
    /// Unbinds the camera, waits for the frame in flight and releases the detector. Calling this
    /// more than once is harmless.
    pub fn on_destroy(&mut self) {
        if self.state != SessionState::Destroyed {
            self.teardown();
        }
    }

    /// Applies completed detections and errors to the overlay. Call this from the UI thread.
    ///
    /// Returns the number of completions that were applied.
    ///
    /// # Panics
    ///
    /// Panics if called before [`Session::on_create`].
    pub fn pump(&mut self) -> usize {
        self.assert_created();
        self.sink.pump()
    }

    pub fn overlay(&self) -> &Overlay {
        self.sink.overlay()
    }

    pub fn overlay_mut(&mut self) -> &mut Overlay {
        self.sink.overlay_mut()
    }

    pub fn notifier(&self) -> &N {
        self.sink.notifier()
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// Returns the number of frames that were submitted to the detector so far.
    pub fn forwarded_frames(&self) -> u64 {
        self.analyzer
            .as_ref()
            .map_or(0, |analyzer| analyzer.forwarded_frames())
    }

    /// Returns the frame counters of the current pipeline.
    pub fn frame_stats(&self) -> FrameStats {
        self.analyzer
            .as_ref()
            .map_or(FrameStats::default(), |analyzer| analyzer.frame_stats())
    }

    /// Returns whether the detector was running after the last lifecycle change was applied.
    pub fn is_detector_running(&self) -> bool {
        self.analyzer
            .as_ref()
            .map_or(false, |analyzer| !analyzer.is_detector_closed())
    }

    fn resume_detector(&mut self) {
        if let Some(analyzer) = &mut self.analyzer {
            analyzer.send(Command::ResumeIfClosed);
        }
        self.state = SessionState::Active;
    }

    fn start(&mut self) {
        let (frames, frame_recv) = frame::latest();
        let landmarker = HandLandmarker::new(
            self.options.landmarker.clone(),
            self.factory.clone(),
            self.events.clone(),
        );
        let mut analyzer = match Analyzer::spawn(landmarker, frame_recv, self.options.facing.mirrors())
        {
            Ok(analyzer) => analyzer,
            Err(e) => {
                log::error!("failed to spawn analyzer thread: {e}");
                self.sink.notify(MSG_CAMERA_FAILED);
                self.state = SessionState::Active;
                return;
            }
        };
        analyzer.send(Command::Initialize);
        self.analyzer = Some(analyzer);
        self.state = SessionState::Active;

        match self.camera.bind(self.options.facing, frames) {
            Ok(()) => self.camera_bound = true,
            Err(e) => {
                log::error!("camera binding failed: {e:#}");
                self.sink.notify(MSG_CAMERA_FAILED);
            }
        }
    }

    fn teardown(&mut self) {
        if self.camera_bound {
            self.camera.unbind();
            self.camera_bound = false;
        }
        if let Some(analyzer) = self.analyzer.take() {
            analyzer.stop();
        }
        self.state = SessionState::Destroyed;
        log::debug!("session destroyed");
    }
}
