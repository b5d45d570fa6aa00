//! Landmark overlay and the UI-side end of the detection pipeline.
//!
//! [`Overlay`] holds the most recent detection and maps its normalized landmarks onto the view.
//! The preview is displayed in aspect-fill mode (the image covers the whole view and the overflow
//! is cropped at the right or bottom edge), so both axes are scaled by the same factor:
//!
//! ```text
//! scale = max(view_width / image_width, view_height / image_height)
//! ```
//!
//! A landmark at `(x, y)` is drawn at `(x * image_width * scale, y * image_height * scale)`.

use std::marker::PhantomData;

use crossbeam::channel::Receiver;

use crate::{
    draw::{Paint, Surface},
    image::{Color, Resolution},
    landmark::{HandLandmarkerResult, ResultBundle, CONNECTIONS},
    landmarker::{LandmarkerError, LandmarkerEvent},
};

const DEFAULT_LINE_PAINT: Paint = Paint::new(Color::BLUE, 8);
const DEFAULT_POINT_PAINT: Paint = Paint::new(Color::YELLOW, 8);

/// Draws the landmarks of the latest detection result.
///
/// Overlays are tied to the thread that created them (the UI thread) and can not be sent to
/// other threads. Results computed elsewhere have to go through a [`ResultSink`].
pub struct Overlay {
    view: Resolution,
    results: Option<HandLandmarkerResult>,
    image_width: u32,
    image_height: u32,
    scale_factor: f32,
    redraw: bool,
    line_paint: Paint,
    point_paint: Paint,
    /// Makes this type `!Send` and `!Sync`.
    _ui_thread: PhantomData<*const ()>,
}

impl Overlay {
    /// Creates an empty overlay for a view of the given size.
    pub fn new(view: Resolution) -> Self {
        Self {
            view,
            results: None,
            image_width: 1,
            image_height: 1,
            scale_factor: 1.0,
            redraw: false,
            line_paint: DEFAULT_LINE_PAINT,
            point_paint: DEFAULT_POINT_PAINT,
            _ui_thread: PhantomData,
        }
    }

    /// Sets the paint used for hand connection lines.
    pub fn line_paint(self, paint: Paint) -> Self {
        Self {
            line_paint: paint,
            ..self
        }
    }

    /// Sets the paint used for landmark points.
    pub fn point_paint(self, paint: Paint) -> Self {
        Self {
            point_paint: paint,
            ..self
        }
    }

    /// Replaces the held result with a new one and requests a redraw.
    ///
    /// The scale factor is recomputed from the bundle's input image size. A result without any
    /// hands still replaces the previous one.
    pub fn set_results(&mut self, bundle: ResultBundle) {
        let input = bundle.input_resolution();
        self.image_width = input.width();
        self.image_height = input.height();
        self.results = Some(bundle.into_result());
        self.update_scale();
        self.redraw = true;
    }

    /// Updates the size of the view, recomputing the scale factor for the held result.
    pub fn resize(&mut self, view: Resolution) {
        if view != self.view {
            self.view = view;
            self.update_scale();
            self.redraw = true;
        }
    }

    fn update_scale(&mut self) {
        if self.image_width == 0 || self.image_height == 0 {
            log::warn!(
                "ignoring empty input image size {}x{}",
                self.image_width,
                self.image_height
            );
            self.scale_factor = 1.0;
            return;
        }

        self.scale_factor = f32::max(
            self.view.width() as f32 / self.image_width as f32,
            self.view.height() as f32 / self.image_height as f32,
        );
    }

    /// Returns the factor that maps input image pixels to view pixels.
    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    pub fn view(&self) -> Resolution {
        self.view
    }

    pub fn results(&self) -> Option<&HandLandmarkerResult> {
        self.results.as_ref()
    }

    /// Returns whether the overlay has changed since it was last drawn.
    pub fn needs_redraw(&self) -> bool {
        self.redraw
    }

    /// Forgets the held result.
    pub fn clear(&mut self) {
        if self.results.take().is_some() {
            self.redraw = true;
        }
    }

    fn to_view(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.image_width as f32 * self.scale_factor,
            y * self.image_height as f32 * self.scale_factor,
        )
    }

    /// Draws the held result onto `surface`.
    ///
    /// For every hand, one point is drawn per landmark, followed by one line per hand connection.
    pub fn draw<S: Surface>(&mut self, mut surface: S) {
        self.redraw = false;

        let Some(results) = &self.results else {
            return;
        };

        for hand in results.hands() {
            for lm in hand.landmarks().iter() {
                let (x, y) = self.to_view(lm.x(), lm.y());
                surface.draw_point(x, y, &self.point_paint);
            }

            for &(start, end) in CONNECTIONS {
                let (start, end) = (hand.landmark(start), hand.landmark(end));
                surface.draw_line(
                    self.to_view(start.x(), start.y()),
                    self.to_view(end.x(), end.y()),
                    &self.line_paint,
                );
            }
        }
    }
}

/// Shows user-visible messages.
pub trait Notifier {
    fn notify(&mut self, message: &str);
}

/// Collects messages, for tests and for UIs that display them later.
impl Notifier for Vec<String> {
    fn notify(&mut self, message: &str) {
        self.push(message.to_string());
    }
}

impl<N: Notifier + ?Sized> Notifier for &mut N {
    fn notify(&mut self, message: &str) {
        (**self).notify(message)
    }
}

/// A [`Notifier`] that writes messages to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, message: &str) {
        log::info!("{message}");
    }
}

/// Receives landmarker completions on the UI thread.
///
/// Worker threads never touch the [`Overlay`] directly. Their completions are queued in the
/// landmarker's event channel and applied when the UI thread calls [`ResultSink::pump`].
pub struct ResultSink<N> {
    overlay: Overlay,
    notifier: N,
    events: Receiver<LandmarkerEvent>,
}

impl<N: Notifier> ResultSink<N> {
    pub fn new(overlay: Overlay, notifier: N, events: Receiver<LandmarkerEvent>) -> Self {
        Self {
            overlay,
            notifier,
            events,
        }
    }

    /// Applies all queued completions, in the order they were produced.
    ///
    /// Returns the number of completions that were applied.
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            match event {
                Ok(bundle) => self.on_results(bundle),
                Err(e) => self.on_error(&e),
            }
            count += 1;
        }
        count
    }

    pub fn on_results(&mut self, bundle: ResultBundle) {
        log::trace!(
            "{} hand(s) at {} ({:?} inference)",
            bundle.result().hands().len(),
            bundle.timestamp(),
            bundle.inference_time()
        );
        self.overlay.set_results(bundle);
    }

    /// Shows an error to the user. The held result is kept.
    pub fn on_error(&mut self, error: &LandmarkerError) {
        log::error!("{error}");
        self.notifier.notify(&error.user_message());
    }

    pub fn notify(&mut self, message: &str) {
        self.notifier.notify(message);
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn overlay_mut(&mut self) -> &mut Overlay {
        &mut self.overlay
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use approx::assert_relative_eq;
    use crossbeam::channel;

    use super::*;
    use crate::{
        draw::Recording,
        frame::Timestamp,
        landmark::{Hand, Handedness, Landmark, LandmarkIdx, NUM_LANDMARKS},
    };

    fn bundle(width: u32, height: u32, hands: Vec<Hand>) -> ResultBundle {
        ResultBundle::new(
            HandLandmarkerResult::new(hands),
            Resolution::new(width, height),
            Timestamp::from_millis(1),
            Duration::from_millis(3),
        )
    }

    fn hand_at(x: f32, y: f32) -> Hand {
        Hand::new(
            [Landmark::new(x, y, 0.0); NUM_LANDMARKS],
            Handedness::Left,
            1.0,
        )
    }

    #[test]
    fn aspect_fill_scale() {
        let mut overlay = Overlay::new(Resolution::new(1000, 800));
        overlay.set_results(bundle(500, 500, vec![]));
        assert_relative_eq!(overlay.scale_factor(), 2.0);
        assert!(overlay.needs_redraw());
    }

    #[test]
    fn scale_uses_latest_dimensions_only() {
        let mut overlay = Overlay::new(Resolution::new(1000, 800));
        overlay.set_results(bundle(500, 500, vec![]));
        overlay.set_results(bundle(250, 800, vec![]));
        assert_relative_eq!(overlay.scale_factor(), 4.0);
    }

    #[test]
    fn resize_recomputes_scale() {
        let mut overlay = Overlay::new(Resolution::new(1000, 800));
        overlay.set_results(bundle(500, 500, vec![]));
        overlay.resize(Resolution::new(500, 1500));
        assert_relative_eq!(overlay.scale_factor(), 3.0);
    }

    #[test]
    fn empty_image_size_is_ignored() {
        let mut overlay = Overlay::new(Resolution::new(100, 100));
        overlay.set_results(bundle(0, 10, vec![]));
        assert_relative_eq!(overlay.scale_factor(), 1.0);
    }

    #[test]
    fn draws_points_then_lines() {
        let mut overlay = Overlay::new(Resolution::new(1000, 800));
        overlay.set_results(bundle(500, 500, vec![hand_at(0.25, 0.5)]));

        let mut rec = Recording::new(overlay.view());
        overlay.draw(&mut rec);
        assert!(!overlay.needs_redraw());

        let points = rec.points().collect::<Vec<_>>();
        assert_eq!(points.len(), NUM_LANDMARKS);
        for (x, y) in points {
            assert_relative_eq!(x, 250.0);
            assert_relative_eq!(y, 500.0);
        }
        assert_eq!(rec.lines().count(), CONNECTIONS.len());
        assert_eq!(
            rec.calls()[NUM_LANDMARKS..].len(),
            CONNECTIONS.len(),
            "lines must follow the points"
        );
    }

    #[test]
    fn lines_connect_landmarks() {
        let mut landmarks = [Landmark::default(); NUM_LANDMARKS];
        landmarks[LandmarkIdx::Wrist as usize] = Landmark::new(0.0, 0.0, 0.0);
        landmarks[LandmarkIdx::ThumbCmc as usize] = Landmark::new(1.0, 1.0, 0.0);
        let hand = Hand::new(landmarks, Handedness::Right, 0.8);

        let mut overlay = Overlay::new(Resolution::new(200, 100));
        overlay.set_results(bundle(100, 100, vec![hand]));
        let mut rec = Recording::new(overlay.view());
        overlay.draw(&mut rec);

        assert!(rec
            .lines()
            .any(|line| line == ((0.0, 0.0), (200.0, 200.0))));
    }

    #[test]
    fn empty_result_replaces_previous() {
        let mut overlay = Overlay::new(Resolution::new(100, 100));
        overlay.set_results(bundle(100, 100, vec![hand_at(0.5, 0.5)]));
        overlay.set_results(bundle(100, 100, vec![]));

        let mut rec = Recording::new(overlay.view());
        overlay.draw(&mut rec);
        assert!(rec.calls().is_empty());
        assert!(overlay.results().unwrap().is_empty());
    }

    #[test]
    fn clear_forgets_results() {
        let mut overlay = Overlay::new(Resolution::new(100, 100));
        overlay.clear();
        assert!(!overlay.needs_redraw());

        overlay.set_results(bundle(100, 100, vec![hand_at(0.5, 0.5)]));
        let mut rec = Recording::new(overlay.view());
        overlay.draw(&mut rec);
        assert!(!rec.calls().is_empty());

        overlay.clear();
        assert!(overlay.results().is_none());
        assert!(overlay.needs_redraw());

        rec.clear();
        overlay.draw(&mut rec);
        assert!(rec.calls().is_empty());
        assert!(!overlay.needs_redraw());
    }

    #[test]
    fn custom_paints() {
        let paint = Paint::new(Color::RED, 2);
        let mut overlay = Overlay::new(Resolution::new(10, 10))
            .point_paint(paint)
            .line_paint(paint);
        overlay.set_results(bundle(10, 10, vec![hand_at(0.5, 0.5)]));
        let mut rec = Recording::new(overlay.view());
        overlay.draw(&mut rec);
        assert!(rec.calls().iter().all(|call| match *call {
            crate::draw::DrawCall::Point { paint: p, .. }
            | crate::draw::DrawCall::Line { paint: p, .. } => p == paint,
        }));
    }

    #[test]
    fn errors_keep_results() {
        let (sender, events) = channel::unbounded();
        let mut sink = ResultSink::new(Overlay::new(Resolution::new(100, 100)), Vec::new(), events);
        sender
            .send(Ok(bundle(50, 50, vec![hand_at(0.1, 0.1)])))
            .unwrap();
        sender
            .send(Err(LandmarkerError::Detection("engine failed".into())))
            .unwrap();

        assert_eq!(sink.pump(), 2);
        assert_eq!(sink.notifier(), &["engine failed".to_string()]);
        assert_eq!(sink.overlay().results().unwrap().hands().len(), 1);
        assert_relative_eq!(sink.overlay().scale_factor(), 2.0);
        assert_eq!(sink.pump(), 0);
    }
}
