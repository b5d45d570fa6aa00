//! Live camera to hand landmark overlay pipeline.
//!
//! Frames flow through the crate in one direction:
//!
//! 1. A [`session::Camera`] pushes [`frame::Frame`]s into a keep-only-latest slot
//!    ([`frame::latest`]). If the analyzer is still busy, the waiting frame is replaced and
//!    released instead of queued.
//! 2. The [`analyzer::Analyzer`] thread converts each frame to an upright [`image::Image`] and
//!    submits it to the [`landmarker::HandLandmarker`].
//! 3. The landmarker runs the opaque [`engine::Engine`] on its own worker and delivers exactly one
//!    completion per accepted submission over a channel.
//! 4. The UI thread drains the channel ([`session::Session::pump`]) into the
//!    [`overlay::Overlay`], which scales the normalized landmarks onto the view.
//!
//! # Environment Variables
//!
//! Some defaults can be overridden by setting environment variables:
//!
//! * `HANDCAM_MODEL`: Path of the model asset passed to the landmark engine.
//! * `HANDCAM_DELEGATE`: Acceleration backend requested from the engine (`cpu` or `gpu`).
//! * `HANDCAM_WEBCAM_NAME`: Forces the device to use for [`Webcam`]s created without an explicit
//!   device name. If unset, the first device that supports a compatible image format will be used.
//!
//! [`Webcam`]: video::webcam::Webcam

use log::LevelFilter;

pub mod analyzer;
pub mod draw;
pub mod engine;
pub mod frame;
pub mod image;
pub mod landmark;
pub mod landmarker;
pub mod overlay;
pub mod session;
pub mod timer;
pub mod video;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("tract_onnx"), LevelFilter::Warn)
        .filter(Some("tract_core"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and handcam will log at *debug* level, `tract` at *warn* level. `RUST_LOG`
/// overrides both.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
