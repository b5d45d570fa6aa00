//! Hand landmark results.
//!
//! Engines report 21 landmarks per detected hand. `x` and `y` are normalized to the input image
//! (`0.0..=1.0`, origin at the top left), `z` is depth relative to the wrist, roughly on the same
//! scale as `x`.

use std::time::Duration;

use crate::{frame::Timestamp, image::Resolution};

/// Number of landmarks in a [`Hand`].
pub const NUM_LANDMARKS: usize = 21;

/// A normalized landmark position.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Landmark {
    x: f32,
    y: f32,
    z: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn x(&self) -> f32 {
        self.x
    }

    #[inline]
    pub fn y(&self) -> f32 {
        self.y
    }

    #[inline]
    pub fn z(&self) -> f32 {
        self.z
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handedness {
    Left,
    Right,
}

/// A single detected hand.
#[derive(Debug, Clone, PartialEq)]
pub struct Hand {
    landmarks: Box<[Landmark; NUM_LANDMARKS]>,
    handedness: Handedness,
    score: f32,
}

impl Hand {
    /// Creates a hand from its landmarks and handedness classification.
    ///
    /// `score` is the confidence of the handedness classification.
    pub fn new(landmarks: [Landmark; NUM_LANDMARKS], handedness: Handedness, score: f32) -> Self {
        Self {
            landmarks: Box::new(landmarks),
            handedness,
            score,
        }
    }

    /// Returns all landmarks, indexable by [`LandmarkIdx`].
    #[inline]
    pub fn landmarks(&self) -> &[Landmark; NUM_LANDMARKS] {
        &self.landmarks
    }

    #[inline]
    pub fn landmark(&self, idx: LandmarkIdx) -> Landmark {
        self.landmarks[idx as usize]
    }

    #[inline]
    pub fn handedness(&self) -> Handedness {
        self.handedness
    }

    #[inline]
    pub fn score(&self) -> f32 {
        self.score
    }
}

/// Names for the hand landmarks.
///
/// # Terminology
///
/// - **CMC**: [Carpometacarpal joint], the lowest joint of the thumb, located near the wrist.
/// - **MCP**: [Metacarpophalangeal joint], the lower joint forming the knuckles near the palm of
///   the hand.
/// - **PIP**: Proximal Interphalangeal joint, the joint between the MCP and DIP.
/// - **DIP**: Distal Interphalangeal joint, the highest joint of a finger.
/// - **Tip**: This landmark is just placed on the tip of the finger, above the DIP.
///
/// [Carpometacarpal joint]: https://en.wikipedia.org/wiki/Carpometacarpal_joint
/// [Metacarpophalangeal joint]: https://en.wikipedia.org/wiki/Metacarpophalangeal_joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkIdx {
    Wrist,
    ThumbCmc,
    ThumbMcp,
    ThumbIp,
    ThumbTip,
    IndexFingerMcp,
    IndexFingerPip,
    IndexFingerDip,
    IndexFingerTip,
    MiddleFingerMcp,
    MiddleFingerPip,
    MiddleFingerDip,
    MiddleFingerTip,
    RingFingerMcp,
    RingFingerPip,
    RingFingerDip,
    RingFingerTip,
    PinkyMcp,
    PinkyPip,
    PinkyDip,
    PinkyTip,
}

/// Pairs of landmarks connected by the hand skeleton.
pub const CONNECTIONS: &[(LandmarkIdx, LandmarkIdx)] = {
    use LandmarkIdx::*;
    &[
        // Palm outline:
        (Wrist, ThumbCmc),
        (Wrist, IndexFingerMcp),
        (IndexFingerMcp, MiddleFingerMcp),
        (MiddleFingerMcp, RingFingerMcp),
        (RingFingerMcp, PinkyMcp),
        (Wrist, PinkyMcp),
        // Thumb:
        (ThumbCmc, ThumbMcp),
        (ThumbMcp, ThumbIp),
        (ThumbIp, ThumbTip),
        // Index:
        (IndexFingerMcp, IndexFingerPip),
        (IndexFingerPip, IndexFingerDip),
        (IndexFingerDip, IndexFingerTip),
        // Middle:
        (MiddleFingerMcp, MiddleFingerPip),
        (MiddleFingerPip, MiddleFingerDip),
        (MiddleFingerDip, MiddleFingerTip),
        // Ring:
        (RingFingerMcp, RingFingerPip),
        (RingFingerPip, RingFingerDip),
        (RingFingerDip, RingFingerTip),
        // Pinky:
        (PinkyMcp, PinkyPip),
        (PinkyPip, PinkyDip),
        (PinkyDip, PinkyTip),
    ]
};

/// All hands an engine found in one image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandLandmarkerResult {
    hands: Vec<Hand>,
}

impl HandLandmarkerResult {
    pub fn new(hands: Vec<Hand>) -> Self {
        Self { hands }
    }

    #[inline]
    pub fn hands(&self) -> &[Hand] {
        &self.hands
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hands.is_empty()
    }
}

/// A [`HandLandmarkerResult`] together with the input it was computed from.
#[derive(Debug, Clone)]
pub struct ResultBundle {
    result: HandLandmarkerResult,
    input_resolution: Resolution,
    timestamp: Timestamp,
    inference_time: Duration,
}

impl ResultBundle {
    pub fn new(
        result: HandLandmarkerResult,
        input_resolution: Resolution,
        timestamp: Timestamp,
        inference_time: Duration,
    ) -> Self {
        Self {
            result,
            input_resolution,
            timestamp,
            inference_time,
        }
    }

    #[inline]
    pub fn result(&self) -> &HandLandmarkerResult {
        &self.result
    }

    pub fn into_result(self) -> HandLandmarkerResult {
        self.result
    }

    /// Returns the size of the upright image the engine ran on.
    #[inline]
    pub fn input_resolution(&self) -> Resolution {
        self.input_resolution
    }

    /// Returns the capture timestamp of the frame the result belongs to.
    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    #[inline]
    pub fn inference_time(&self) -> Duration {
        self.inference_time
    }
}
