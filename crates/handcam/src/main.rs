use std::{env, path::PathBuf, sync::Arc};

use anyhow::bail;
use handcam::{
    engine::{onnx::OnnxFactory, LandmarkerOptions},
    image::Resolution,
    overlay::LogNotifier,
    session::{LensFacing, PermissionResult, Permissions, Session, SessionOptions, SessionState},
    timer::FpsCounter,
    video::webcam::{self, ParamPreference, WebcamCamera, WebcamOptions},
};

const ENV_VAR_SNAPSHOT: &str = "HANDCAM_SNAPSHOT";

/// On Linux, camera access is governed by the permissions of the video device nodes.
struct DeviceAccess;

impl Permissions for DeviceAccess {
    fn is_granted(&mut self) -> bool {
        webcam::any_device_accessible()
    }

    fn request(&mut self) {
        log::warn!("no video device is accessible, check the permissions of `/dev/video*`");
    }
}

fn main() -> anyhow::Result<()> {
    handcam::init_logger!();

    let options = SessionOptions::default()
        .lens_facing(LensFacing::Front)
        .landmarker(
            LandmarkerOptions::default()
                .model_asset_path("hand_landmark_full.onnx")
                .with_env_overrides(),
        );
    let camera = WebcamCamera::new(
        WebcamOptions::default()
            .resolution(Resolution::RES_720P)
            .fps(30)
            .prefer(ParamPreference::Framerate),
    );
    let snapshot = env::var_os(ENV_VAR_SNAPSHOT).map(PathBuf::from);

    let mut session = Session::new(
        options,
        Arc::new(OnnxFactory),
        DeviceAccess,
        camera,
        LogNotifier,
        Resolution::RES_720P,
    );
    session.on_create();
    if session.state() == SessionState::PermissionPending {
        // There is nobody to ask.
        session.on_permission_result(PermissionResult::Denied {
            can_ask_again: false,
        });
        bail!("no video device is accessible");
    }
    if !session.camera().is_capturing() {
        session.on_destroy();
        bail!("failed to start the webcam");
    }

    let preview = session.camera().preview().clone();
    let mut fps = FpsCounter::new("overlay");
    let mut hands = 0;
    for mut image in preview.iter() {
        session.overlay_mut().resize(image.resolution());
        let updated = session.pump() > 0;

        let count = session.overlay().results().map_or(0, |res| res.hands().len());
        if count != hands {
            log::info!("tracking {count} hand(s)");
            hands = count;
        }

        session.overlay_mut().draw(&mut image);
        if let (true, Some(path)) = (updated, &snapshot) {
            image.save(path)?;
        }

        fps.tick();
    }

    let stats = session.frame_stats();
    log::info!(
        "webcam stopped: {} frames captured, {} analyzed, {} dropped",
        stats.received,
        session.forwarded_frames(),
        stats.dropped,
    );
    session.on_destroy();
    Ok(())
}
