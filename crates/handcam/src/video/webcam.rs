//! V4L2 webcam capture.
//!
//! Only V4L2 `VIDEO_CAPTURE` devices producing JFIF JPEG or Motion JPEG frames are supported.
//! [`WebcamCamera`] plugs a webcam into a [`Session`][crate::session::Session].

use std::{
    cmp::Reverse,
    env,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use linuxvideo::{
    format::{FrameIntervals, FrameSizes, PixFormat, Pixelformat},
    stream::ReadStream,
    BufType, CapabilityFlags, Device, Fract,
};
use pawawwewism::promise;

use crate::{
    frame::{Clock, Frame, FrameSender, Rotation},
    image::{Image, Resolution},
    session::{Camera, LensFacing},
    timer::{FpsCounter, Timer},
};

const ENV_VAR_WEBCAM_NAME: &str = "HANDCAM_WEBCAM_NAME";

/// Whether to keep the resolution or the frame rate when the webcam can't deliver both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum ParamPreference {
    /// Prefer increased resolution over higher frame rates.
    #[default]
    Resolution,
    /// Prefer higher frame rate over higher image resolution.
    Framerate,
}

#[derive(Debug, Default, Clone, Copy)]
struct FramePrefs {
    resolution: Option<Resolution>,
    fps: Option<u32>,
    pref: ParamPreference,
}

/// Format negotiation options.
#[derive(Debug, Default, Clone)]
pub struct WebcamOptions {
    name: Option<String>,
    frame: FramePrefs,
}

impl WebcamOptions {
    /// Sets the name of the webcam device to open.
    ///
    /// Takes precedence over `HANDCAM_WEBCAM_NAME`. If no webcam with this name exists, opening
    /// fails.
    #[inline]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the minimum desired image resolution.
    #[inline]
    pub fn resolution(mut self, resolution: Resolution) -> Self {
        self.frame.resolution = Some(resolution);
        self
    }

    /// Sets the minimum desired frame rate.
    #[inline]
    pub fn fps(mut self, fps: u32) -> Self {
        self.frame.fps = Some(fps);
        self
    }

    /// Selects which parameter to give up first if the webcam can't satisfy both, and which one to
    /// maximize if it can.
    #[inline]
    pub fn prefer(mut self, pref: ParamPreference) -> Self {
        self.frame.pref = pref;
        self
    }

    /// Returns the device name to look for, taking `HANDCAM_WEBCAM_NAME` into account.
    fn device_name(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| env::var(ENV_VAR_WEBCAM_NAME).ok())
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameFormat {
    resolution: Resolution,
    frame_interval: Fract,
}

impl FrameFormat {
    fn fps(&self) -> f32 {
        1.0 / self.frame_interval.as_f32()
    }

    fn satisfies(&self, prefs: &FramePrefs) -> bool {
        let res_ok = prefs.resolution.map_or(true, |res| {
            self.resolution.width() >= res.width() && self.resolution.height() >= res.height()
        });
        let fps_ok = prefs
            .fps
            .map_or(true, |fps| self.fps().round() >= fps as f32);
        res_ok && fps_ok
    }
}

fn supported_formats(device: &Device) -> anyhow::Result<(Pixelformat, Vec<FrameFormat>)> {
    let mut pixel_format = None;
    for format in device.formats(BufType::VIDEO_CAPTURE) {
        let format = format?;
        if format.pixelformat() == Pixelformat::JPEG || format.pixelformat() == Pixelformat::MJPG {
            pixel_format = Some(format.pixelformat());
            break;
        }
    }
    let Some(pixel_format) = pixel_format else {
        bail!("device does not support JPEG or MJPG capture");
    };

    let sizes = match device.frame_sizes(pixel_format)? {
        FrameSizes::Discrete(sizes) => sizes,
        FrameSizes::Stepwise(_) | FrameSizes::Continuous(_) => {
            bail!("stepwise or continuous resolutions are not supported");
        }
    };

    let mut formats = Vec::new();
    for size in sizes {
        let intervals = match device.frame_intervals(pixel_format, size.width(), size.height())? {
            FrameIntervals::Discrete(intervals) => intervals,
            FrameIntervals::Stepwise(_) | FrameIntervals::Continuous(_) => {
                bail!("stepwise or continuous frame rates are not supported")
            }
        };
        formats.extend(intervals.iter().map(|rate| FrameFormat {
            resolution: Resolution::new(size.width(), size.height()),
            frame_interval: *rate.fract(),
        }));
    }

    Ok((pixel_format, formats))
}

/// Picks the best format satisfying `prefs`, relaxing them until one is found.
fn negotiate_format(formats: &[FrameFormat], mut prefs: FramePrefs) -> Option<FrameFormat> {
    loop {
        let mut eligible = formats
            .iter()
            .filter(|fmt| fmt.satisfies(&prefs))
            .copied()
            .collect::<Vec<_>>();
        match prefs.pref {
            ParamPreference::Resolution => eligible
                .sort_by_key(|fmt| (fmt.resolution.num_pixels(), Reverse(fmt.frame_interval))),
            ParamPreference::Framerate => eligible
                .sort_by_key(|fmt| (Reverse(fmt.frame_interval), fmt.resolution.num_pixels())),
        }
        if let Some(fmt) = eligible.last() {
            return Some(*fmt);
        }

        log::debug!("no format matches {:?}, relaxing", prefs);
        let relaxed = match prefs.pref {
            ParamPreference::Resolution => {
                prefs.resolution.take().is_some() || prefs.fps.take().is_some()
            }
            ParamPreference::Framerate => {
                prefs.fps.take().is_some() || prefs.resolution.take().is_some()
            }
        };
        if !relaxed {
            return None;
        }
    }
}

/// Returns whether any video device can be opened by this process.
pub fn any_device_accessible() -> bool {
    match linuxvideo::list() {
        Ok(mut devices) => devices.any(|dev| dev.is_ok()),
        Err(e) => {
            log::debug!("failed to list video devices: {e}");
            false
        }
    }
}

/// A webcam yielding a stream of [`Image`]s.
pub struct Webcam {
    stream: ReadStream,
    resolution: Resolution,
    t_dequeue: Timer,
    t_decode: Timer,
}

impl Webcam {
    /// Opens the first webcam matching `options`.
    ///
    /// This can block for a few hundred milliseconds while the webcam initializes.
    pub fn open(options: WebcamOptions) -> anyhow::Result<Self> {
        let wanted = options.device_name();
        if let Some(name) = &wanted {
            log::debug!("looking for webcam '{name}'");
        }

        for res in linuxvideo::list()? {
            match res {
                Ok(dev) => match Self::open_device(dev, wanted.as_deref(), options.frame) {
                    Ok(Some(webcam)) => return Ok(webcam),
                    Ok(None) => {}
                    Err(e) => log::debug!("{e:#}"),
                },
                Err(e) => log::warn!("{e}"),
            }
        }

        match wanted {
            Some(name) => bail!("no supported webcam named '{name}' found"),
            None => bail!("no supported webcam device found"),
        }
    }

    fn open_device(
        dev: Device,
        wanted: Option<&str>,
        prefs: FramePrefs,
    ) -> anyhow::Result<Option<Self>> {
        let caps = dev.capabilities()?;
        if wanted.map_or(false, |name| caps.card() != name) {
            return Ok(None);
        }

        let cap_flags = caps.device_capabilities();
        let path = dev.path()?;
        log::debug!(
            "device {} ({}) capabilities: {:?}",
            caps.card(),
            path.display(),
            cap_flags,
        );
        if !cap_flags.contains(CapabilityFlags::VIDEO_CAPTURE) {
            return Ok(None);
        }

        let (pixel_format, formats) = supported_formats(&dev)?;
        let format = negotiate_format(&formats, prefs)
            .ok_or_else(|| anyhow!("failed to negotiate a webcam format"))?;

        let capture = dev.video_capture(PixFormat::new(
            format.resolution.width(),
            format.resolution.height(),
            pixel_format,
        ))?;
        let actual = capture.format();
        let resolution = Resolution::new(actual.width(), actual.height());
        let interval = capture.set_frame_interval(format.frame_interval)?;

        log::info!(
            "opened {} ({}), {} @ {:.1}Hz",
            caps.card(),
            path.display(),
            resolution,
            1.0 / interval.as_f32(),
        );

        Ok(Some(Self {
            stream: capture.into_stream(2)?,
            resolution,
            t_dequeue: Timer::new("dequeue"),
            t_decode: Timer::new("decode"),
        }))
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Blocks until the next frame arrives and decodes it.
    ///
    /// Corrupted frames are replaced with a blank image.
    pub fn read(&mut self) -> anyhow::Result<Image> {
        let dequeue_guard = self.t_dequeue.start();
        let (width, height) = (self.resolution.width(), self.resolution.height());
        let t_decode = &self.t_decode;
        self.stream
            .dequeue(|buf| {
                drop(dequeue_guard);
                let image = match t_decode.time(|| Image::decode_jpeg(&buf)) {
                    Ok(image) => image,
                    Err(e) => {
                        // USB transfers occasionally corrupt MJPG frames.
                        log::error!("webcam decode error: {e}");
                        Image::new(width, height)
                    }
                };
                Ok(image)
            })
            .map_err(Into::into)
    }

    /// Returns profiling timers for webcam access and decoding.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [&self.t_dequeue, &self.t_decode].into_iter()
    }
}

struct Capture {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// A [`Camera`] backed by a [`Webcam`].
///
/// Binding opens the webcam on a capture thread. Every captured image is offered to the session's
/// analyzer and also published on [`WebcamCamera::preview`] for display.
pub struct WebcamCamera {
    options: WebcamOptions,
    clock: Clock,
    capture: Option<Capture>,
    preview: Receiver<Image>,
}

impl WebcamCamera {
    pub fn new(options: WebcamOptions) -> Self {
        Self {
            options,
            clock: Clock::new(),
            capture: None,
            preview: channel::never(),
        }
    }

    /// Returns the channel carrying the latest preview image.
    ///
    /// Only the newest image is kept. The channel disconnects when the capture thread exits. For
    /// front-facing cameras, preview images are mirrored to match the analyzed frames.
    pub fn preview(&self) -> &Receiver<Image> {
        &self.preview
    }

    /// Returns whether the capture thread was started by the last [`Camera::bind`].
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

impl Camera for WebcamCamera {
    fn bind(&mut self, facing: LensFacing, frames: FrameSender) -> anyhow::Result<()> {
        self.unbind();

        let (preview, preview_recv) = channel::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let (opened, opened_handle) = promise();

        let options = self.options.clone();
        let clock = self.clock;
        let handle = thread::Builder::new().name("webcam".into()).spawn({
            let stop = stop.clone();
            let stale = preview_recv.clone();
            move || {
                log::trace!("webcam capture starting");
                let webcam = match Webcam::open(options) {
                    Ok(webcam) => {
                        opened.fulfill(Ok(()));
                        webcam
                    }
                    Err(e) => {
                        opened.fulfill(Err(e));
                        return;
                    }
                };
                capture(webcam, facing, &clock, &frames, &preview, &stale, &stop);
                log::trace!("webcam capture exiting");
            }
        })?;

        let open_result = opened_handle
            .block()
            .map_err(|_| anyhow!("webcam capture thread exited unexpectedly"));
        if let Err(e) = open_result.and_then(|res| res) {
            handle.join().ok();
            return Err(e);
        }

        self.preview = preview_recv;
        self.capture = Some(Capture { stop, handle });
        Ok(())
    }

    fn unbind(&mut self) {
        if let Some(Capture { stop, handle }) = self.capture.take() {
            stop.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                log::error!("webcam capture thread panicked");
            }
        }
    }
}

impl Drop for WebcamCamera {
    fn drop(&mut self) {
        self.unbind();
    }
}

fn capture(
    mut webcam: Webcam,
    facing: LensFacing,
    clock: &Clock,
    frames: &FrameSender,
    preview: &Sender<Image>,
    stale: &Receiver<Image>,
    stop: &AtomicBool,
) {
    let mut fps = FpsCounter::new("webcam");
    while !stop.load(Ordering::Relaxed) {
        let image = match webcam.read() {
            Ok(image) => image,
            Err(e) => {
                log::error!("failed to read from webcam: {e:#}");
                return;
            }
        };
        let timestamp = clock.now();

        if frames
            .offer(Frame::from_image(&image, Rotation::Deg0, timestamp))
            .is_err()
        {
            log::debug!("analyzer is gone, stopping capture");
            return;
        }

        let mut shown = if facing.mirrors() {
            image.flip_horizontal()
        } else {
            image
        };
        loop {
            match preview.try_send(shown) {
                Ok(()) => break,
                Err(TrySendError::Full(img)) => {
                    shown = img;
                    stale.try_recv().ok();
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        fps.tick_with(webcam.timers());
    }
}
