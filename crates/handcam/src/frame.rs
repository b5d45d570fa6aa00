//! Camera frames and the keep-only-latest hand-off to the analyzer thread.
//!
//! A [`Frame`] wraps a buffer owned by the camera. The buffer must be handed back as early as
//! possible, or the camera stalls: [`Frame::into_image`] releases it right after the pixel copy,
//! and dropping an unconverted frame releases it as well. The release hook runs exactly once.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam::channel::{self, Receiver, RecvError, Sender, TryRecvError, TrySendError};

use crate::image::{Image, Resolution};

/// Clockwise rotation that has to be applied to a frame to make it upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Converts a rotation in degrees to a [`Rotation`].
    ///
    /// Negative and out-of-range values are normalized. Returns `None` if `degrees` is not a
    /// multiple of 90.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Returns whether applying this rotation swaps width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// A point in time on a monotonic clock, relative to the clock's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const fn from_duration(since_start: Duration) -> Self {
        Self(since_start)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

/// Monotonic clock handing out capture [`Timestamp`]s.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        Timestamp(self.start.elapsed())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors produced when a [`Frame`]'s buffer does not describe a valid image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame has a width or height of zero.
    Empty,
    /// The row stride is smaller than one row of pixels.
    InvalidStride { stride: usize, row_bytes: usize },
    /// The buffer ends before the last row.
    BufferTooSmall { expected: usize, actual: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Empty => f.write_str("frame has no pixels"),
            FrameError::InvalidStride { stride, row_bytes } => write!(
                f,
                "row stride of {stride} bytes cannot hold a row of {row_bytes} bytes"
            ),
            FrameError::BufferTooSmall { expected, actual } => write!(
                f,
                "frame buffer holds {actual} bytes, but at least {expected} are needed"
            ),
        }
    }
}

impl std::error::Error for FrameError {}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A single RGBA8888 camera image, borrowed from the camera until released.
pub struct Frame {
    pixels: Vec<u8>,
    resolution: Resolution,
    stride: usize,
    rotation: Rotation,
    timestamp: Timestamp,
    release: Option<ReleaseHook>,
}

impl Frame {
    /// Creates a frame from RGBA8888 pixel data.
    ///
    /// `stride` is the distance between the starts of two consecutive rows, in bytes. Rows may be
    /// padded, so it can be larger than `4 * width`.
    pub fn new(
        pixels: Vec<u8>,
        resolution: Resolution,
        stride: usize,
        rotation: Rotation,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            pixels,
            resolution,
            stride,
            rotation,
            timestamp,
            release: None,
        }
    }

    /// Wraps an already decoded [`Image`] in a tightly packed frame.
    pub fn from_image(image: &Image, rotation: Rotation, timestamp: Timestamp) -> Self {
        let resolution = image.resolution();
        Self::new(
            image.data().to_vec(),
            resolution,
            resolution.width() as usize * 4,
            rotation,
            timestamp,
        )
    }

    /// Registers a hook that hands the underlying buffer back to the camera.
    ///
    /// The hook runs exactly once: after the pixel copy in [`Frame::into_image`], or when the frame
    /// is dropped without being converted.
    pub fn on_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    /// Returns the size of the frame as delivered by the camera (before rotation).
    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Copies the frame into an upright [`Image`].
    ///
    /// The camera buffer is released as soon as the copy is done, whether or not it succeeded.
    /// The copy is then rotated by the frame's [`Rotation`] and, if `mirror` is set, flipped
    /// horizontally (for front-facing cameras).
    pub fn into_image(mut self, mirror: bool) -> Result<Image, FrameError> {
        let copied = self.copy_pixels();
        self.release();

        let mut image = copied?.rotated(self.rotation);
        if mirror {
            image = image.flip_horizontal();
        }
        Ok(image)
    }

    fn copy_pixels(&self) -> Result<Image, FrameError> {
        if self.resolution.is_empty() {
            return Err(FrameError::Empty);
        }

        let row_bytes = self.resolution.width() as usize * 4;
        if self.stride < row_bytes {
            return Err(FrameError::InvalidStride {
                stride: self.stride,
                row_bytes,
            });
        }

        let rows = self.resolution.height() as usize;
        let expected = self.stride * (rows - 1) + row_bytes;
        if self.pixels.len() < expected {
            return Err(FrameError::BufferTooSmall {
                expected,
                actual: self.pixels.len(),
            });
        }

        let mut data = Vec::with_capacity(row_bytes * rows);
        for row in self.pixels.chunks(self.stride).take(rows) {
            data.extend_from_slice(&row[..row_bytes]);
        }

        // Length was checked above.
        Image::from_rgba8(self.resolution, data).map_err(|_| FrameError::BufferTooSmall {
            expected,
            actual: self.pixels.len(),
        })
    }

    fn release(&mut self) {
        self.pixels = Vec::new();
        if let Some(hook) = self.release.take() {
            hook();
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("resolution", &self.resolution)
            .field("stride", &self.stride)
            .field("rotation", &self.rotation)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Frame counters of a [`latest`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    /// Number of frames offered by the camera.
    pub received: u64,
    /// Number of frames that were replaced by a newer one before the analyzer picked them up.
    pub dropped: u64,
}

#[derive(Default)]
struct Shared {
    received: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Creates a keep-only-latest frame slot.
///
/// The slot holds at most one frame. Offering a frame while the slot is occupied releases the
/// waiting frame and stores the new one, so the receiver always gets the newest frame available at
/// the time it asks for one.
pub fn latest() -> (FrameSender, FrameReceiver) {
    let (sender, recv) = channel::bounded(1);
    let shared = Arc::new(Shared::default());
    (
        FrameSender {
            inner: sender,
            stale: recv.clone(),
            shared: shared.clone(),
        },
        FrameReceiver {
            inner: recv,
            shared,
        },
    )
}

/// Error returned by [`FrameSender::offer`] when the [`FrameReceiver`] is gone.
///
/// The camera should stop producing frames when it sees this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverClosed;

impl fmt::Display for ReceiverClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("frame receiver was closed")
    }
}

impl std::error::Error for ReceiverClosed {}

/// The camera-side half of a [`latest`] slot.
#[derive(Clone)]
pub struct FrameSender {
    inner: Sender<Frame>,
    /// Used to evict the waiting frame when a newer one arrives.
    stale: Receiver<Frame>,
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Offers a new frame to the analyzer, replacing the waiting frame if there is one.
    ///
    /// This never blocks.
    pub fn offer(&self, mut frame: Frame) -> Result<(), ReceiverClosed> {
        self.shared.received.fetch_add(1, Ordering::Relaxed);
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ReceiverClosed);
        }

        loop {
            match self.inner.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(f)) => {
                    frame = f;
                    if let Ok(stale) = self.stale.try_recv() {
                        log::trace!("replacing stale frame from {}", stale.timestamp());
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        drop(stale);
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(ReceiverClosed);
                }
            }
        }
    }

    /// Returns the frame counters of this slot.
    pub fn stats(&self) -> FrameStats {
        stats(&self.shared)
    }
}

/// The analyzer-side half of a [`latest`] slot.
pub struct FrameReceiver {
    inner: Receiver<Frame>,
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// Blocks until a frame is available.
    ///
    /// Returns an error once all [`FrameSender`]s are dropped and the slot is empty.
    pub fn recv(&self) -> Result<Frame, RecvError> {
        self.inner.recv()
    }

    pub fn try_recv(&self) -> Result<Frame, TryRecvError> {
        self.inner.try_recv()
    }

    /// Returns the frame counters of this slot.
    pub fn stats(&self) -> FrameStats {
        stats(&self.shared)
    }

    pub(crate) fn channel(&self) -> &Receiver<Frame> {
        &self.inner
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        // Release the waiting frame now instead of when the last sender goes away.
        while let Ok(frame) = self.inner.try_recv() {
            drop(frame);
        }
    }
}

fn stats(shared: &Shared) -> FrameStats {
    FrameStats {
        received: shared.received.load(Ordering::Relaxed),
        dropped: shared.dropped.load(Ordering::Relaxed),
    }
}
