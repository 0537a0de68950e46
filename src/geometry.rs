//! Rectangle and rotation arithmetic
//!
//! Rectangles live in a page's own coordinate space at some zoom/rotation
//! epoch. The native rasterizer always takes the zero-rotation frame at zoom 1
//! and receives the effective rotation as a separate parameter, so rectangles
//! are moved between frames with [`Rect::rotate`] and [`Rect::scale`] before a
//! native call is issued.

use crate::error::{RenderError, Result};

/// Slack applied when snapping a transformed rectangle to whole pixels.
const ROUNDING_EPSILON: f32 = 0.001;

/// Axis-aligned rectangle, `x1 >= x0` and `y1 >= y0` once normalized
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub const ZERO: Rect = Rect::new(0.0, 0.0, 0.0, 0.0);

    #[must_use]
    pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Rectangle from an origin and a size
    #[must_use]
    pub fn from_size(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    /// Swap coordinates so that `x1 >= x0` and `y1 >= y0`
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            x0: self.x0.min(self.x1),
            y0: self.y0.min(self.y1),
            x1: self.x0.max(self.x1),
            y1: self.y0.max(self.y1),
        }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    #[must_use]
    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    /// True when the rectangle encloses no area
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    /// True for the all-zero rectangle, which native calls read as "whole page"
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Multiply all four coordinates by `factor`
    #[must_use]
    pub fn scale(&self, factor: f32) -> Self {
        Self::new(
            self.x0 * factor,
            self.y0 * factor,
            self.x1 * factor,
            self.y1 * factor,
        )
    }

    #[must_use]
    pub fn translate(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x0 + dx, self.y0 + dy, self.x1 + dx, self.y1 + dy)
    }

    /// Overlap of two rectangles; empty (zero-sized at `self`'s origin) when disjoint
    #[must_use]
    pub fn intersect(&self, other: &Rect) -> Self {
        let r = Self::new(
            self.x0.max(other.x0),
            self.y0.max(other.y0),
            self.x1.min(other.x1),
            self.y1.min(other.y1),
        );
        if r.x1 < r.x0 || r.y1 < r.y0 {
            Self::new(self.x0, self.y0, self.x0, self.y0)
        } else {
            r
        }
    }

    #[must_use]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x0 < other.x1 && other.x0 < self.x1 && self.y0 < other.y1 && other.y0 < self.y1
    }

    /// Map this rectangle, expressed in `reference`'s frame, into the frame
    /// rotated clockwise by `degrees` about `reference`.
    ///
    /// The reference keeps its origin; for quarter turns its width and height
    /// swap. Rotating the result by `-degrees` about
    /// `reference.rotate(reference, degrees)` gives back the original.
    pub fn rotate(&self, reference: &Rect, degrees: i32) -> Result<Self> {
        let degrees = normalize_degrees(degrees)?;
        let (ox, oy) = (reference.x0, reference.y0);
        let (w, h) = (reference.width(), reference.height());
        let (ax0, ay0, ax1, ay1) = (self.x0 - ox, self.y0 - oy, self.x1 - ox, self.y1 - oy);

        let (x0, y0, x1, y1) = match degrees {
            90 => (h - ay1, ax0, h - ay0, ax1),
            180 => (w - ax1, h - ay1, w - ax0, h - ay0),
            270 => (ay0, w - ax1, ay1, w - ax0),
            _ => (ax0, ay0, ax1, ay1),
        };
        Ok(Self::new(x0 + ox, y0 + oy, x1 + ox, y1 + oy))
    }

    /// Snap outwards to whole pixels, tolerating float noise at the edges
    #[must_use]
    pub fn round_out(&self) -> PixelBox {
        let r = self.normalized();
        PixelBox {
            x0: (r.x0 + ROUNDING_EPSILON).floor() as i32,
            y0: (r.y0 + ROUNDING_EPSILON).floor() as i32,
            x1: (r.x1 - ROUNDING_EPSILON).ceil() as i32,
            y1: (r.y1 - ROUNDING_EPSILON).ceil() as i32,
        }
    }
}

/// Integer pixel rectangle as produced by the rasterizer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelBox {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl PixelBox {
    #[must_use]
    pub const fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0).max(0) as u32
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0).max(0) as u32
    }

    #[must_use]
    pub fn to_rect(self) -> Rect {
        Rect::new(self.x0 as f32, self.y0 as f32, self.x1 as f32, self.y1 as f32)
    }
}

/// Bring `degrees` into [0, 360) and require a quarter turn
pub fn normalize_degrees(degrees: i32) -> Result<i32> {
    let d = degrees.rem_euclid(360);
    if d % 90 == 0 {
        Ok(d)
    } else {
        Err(RenderError::invalid(format!(
            "rotation {degrees} is not a multiple of 90 degrees"
        )))
    }
}

/// Requested rotation of a render
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Rotation {
    /// Follow the page's own declared rotation
    Auto,
    /// Render in the native frame, ignoring the declared rotation
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Numeric form; `Auto` is -1
    #[must_use]
    pub const fn degrees(self) -> i32 {
        match self {
            Self::Auto => -1,
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Parse a numeric rotation; -1 means `Auto`, anything else is normalized
    pub fn from_degrees(degrees: i32) -> Result<Self> {
        if degrees == -1 {
            return Ok(Self::Auto);
        }
        Ok(match normalize_degrees(degrees)? {
            90 => Self::Deg90,
            180 => Self::Deg180,
            270 => Self::Deg270,
            _ => Self::Deg0,
        })
    }

    /// Rotation handed to the native call, composed with the page's inherent one
    #[must_use]
    pub fn effective(self, inherent: i32) -> i32 {
        match self {
            Self::Auto => inherent.rem_euclid(360),
            Self::Deg0 => 0,
            other => (other.degrees() + inherent).rem_euclid(360),
        }
    }
}
