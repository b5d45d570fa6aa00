//! Drawing surfaces the overlay renders onto.

use std::convert::Infallible;

use embedded_graphics::{
    draw_target::DrawTarget,
    prelude::*,
    primitives::{Circle, Line, PrimitiveStyle, Rectangle},
};

use crate::image::{Color, Image, Resolution};

/// Color and stroke width of a draw call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Paint {
    color: Color,
    stroke_width: u32,
}

impl Paint {
    pub const fn new(color: Color, stroke_width: u32) -> Self {
        Self {
            color,
            stroke_width,
        }
    }

    #[inline]
    pub fn color(&self) -> Color {
        self.color
    }

    /// Returns the line width, or the diameter of a point.
    #[inline]
    pub fn stroke_width(&self) -> u32 {
        self.stroke_width
    }
}

/// A pixel surface that accepts point and line primitives.
///
/// Coordinates are in surface pixels and may lie outside of the surface; those parts are clipped.
pub trait Surface {
    fn resolution(&self) -> Resolution;

    fn draw_point(&mut self, x: f32, y: f32, paint: &Paint);

    fn draw_line(&mut self, start: (f32, f32), end: (f32, f32), paint: &Paint);
}

impl<S: Surface + ?Sized> Surface for &mut S {
    fn resolution(&self) -> Resolution {
        (**self).resolution()
    }

    fn draw_point(&mut self, x: f32, y: f32, paint: &Paint) {
        (**self).draw_point(x, y, paint)
    }

    fn draw_line(&mut self, start: (f32, f32), end: (f32, f32), paint: &Paint) {
        (**self).draw_line(start, end, paint)
    }
}

fn point(x: f32, y: f32) -> Point {
    Point::new(x.round() as i32, y.round() as i32)
}

impl Surface for Image {
    fn resolution(&self) -> Resolution {
        Image::resolution(self)
    }

    fn draw_point(&mut self, x: f32, y: f32, paint: &Paint) {
        let diameter = paint.stroke_width().max(1);
        match Circle::with_center(point(x, y), diameter)
            .into_styled(PrimitiveStyle::with_fill(paint.color()))
            .draw(&mut Target(self))
        {
            Ok(()) => {}
            Err(infallible) => match infallible {},
        }
    }

    fn draw_line(&mut self, start: (f32, f32), end: (f32, f32), paint: &Paint) {
        match Line::new(point(start.0, start.1), point(end.0, end.1))
            .into_styled(PrimitiveStyle::with_stroke(
                paint.color(),
                paint.stroke_width().max(1),
            ))
            .draw(&mut Target(self))
        {
            Ok(()) => {}
            Err(infallible) => match infallible {},
        }
    }
}

struct Target<'a>(&'a mut Image);

impl Dimensions for Target<'_> {
    fn bounding_box(&self) -> Rectangle {
        let (width, height) = (self.0.width(), self.0.height());

        Rectangle {
            top_left: Point { x: 0, y: 0 },
            size: Size { width, height },
        }
    }
}

impl DrawTarget for Target<'_> {
    type Color = Color;

    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(pos, color) in pixels {
            if pos.x >= 0
                && (pos.x as u32) < self.0.width()
                && pos.y >= 0
                && (pos.y as u32) < self.0.height()
            {
                self.0.set(pos.x as u32, pos.y as u32, color);
            }
        }

        Ok(())
    }
}

/// A draw call captured by a [`Recording`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawCall {
    Point { x: f32, y: f32, paint: Paint },
    Line {
        start: (f32, f32),
        end: (f32, f32),
        paint: Paint,
    },
}

/// A [`Surface`] that records draw calls instead of rasterizing them.
///
/// Useful for inspecting what an overlay would draw, and for forwarding the calls to a rendering
/// backend that is not an [`Image`].
#[derive(Debug, Clone)]
pub struct Recording {
    resolution: Resolution,
    calls: Vec<DrawCall>,
}

impl Recording {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            calls: Vec::new(),
        }
    }

    pub fn calls(&self) -> &[DrawCall] {
        &self.calls
    }

    pub fn points(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.calls.iter().filter_map(|call| match *call {
            DrawCall::Point { x, y, .. } => Some((x, y)),
            DrawCall::Line { .. } => None,
        })
    }

    pub fn lines(&self) -> impl Iterator<Item = ((f32, f32), (f32, f32))> + '_ {
        self.calls.iter().filter_map(|call| match *call {
            DrawCall::Line { start, end, .. } => Some((start, end)),
            DrawCall::Point { .. } => None,
        })
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }
}

impl Surface for Recording {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn draw_point(&mut self, x: f32, y: f32, paint: &Paint) {
        self.calls.push(DrawCall::Point {
            x,
            y,
            paint: *paint,
        });
    }

    fn draw_line(&mut self, start: (f32, f32), end: (f32, f32), paint: &Paint) {
        self.calls.push(DrawCall::Line {
            start,
            end,
            paint: *paint,
        });
    }
}
