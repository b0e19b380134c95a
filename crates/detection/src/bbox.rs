//! A type-safe bounding box.
//!
//! [`Bbox`] wraps four `f32` coordinates; the type parameter encodes which
//! layout the values are in, so corner-form and center-form buffers cannot
//! be mixed up silently.
//!
//! # Conversion
//!
//! Boxes convert between layouts through the [`ConvertBbox`] trait:
//!
//! ```
//! use detection::bbox::*;
//!
//! let xyxy = Bbox::xyxy(4.0, 4.0, 10.0, 10.0);
//! let cxcywh: Bbox<Cxcywh> = xyxy.convert();
//!
//! assert_eq!(cxcywh.inner(), (7.0, 7.0, 6.0, 6.0));
//! ```
//!
//! # Formats
//!
//! - [`Xyxy`] (xmin, ymin, xmax, ymax)
//! - [`Cxcywh`] (center_x, center_y, width, height)

use std::marker::PhantomData;

/// A bounding box in the layout given by the marker type `T`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox<T> {
    coords: (f32, f32, f32, f32),
    _marker: PhantomData<T>,
}

impl<T> Bbox<T> {
    fn new(coords: (f32, f32, f32, f32)) -> Self {
        Bbox {
            coords,
            _marker: PhantomData,
        }
    }

    /// The raw coordinate tuple, in this box's layout.
    #[must_use]
    pub fn inner(&self) -> (f32, f32, f32, f32) {
        self.coords
    }
}

impl<T> Bbox<T>
where
    Bbox<T>: ConvertBbox<Xyxy>,
{
    /// Compute the area of the bounding box.
    ///
    /// Degenerate boxes (inverted or zero-extent) have area `0.0`.
    #[must_use]
    pub fn area(&self) -> f32 {
        let (x1, y1, x2, y2) = ConvertBbox::<Xyxy>::convert(self).coords;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    /// Whether the box has zero area.
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.area() <= 0.0
    }

    /// Compute the intersection area between two bounding boxes.
    ///
    /// If the boxes do not overlap, the intersection area is `0.0`.
    pub fn intersection<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Xyxy>,
    {
        let (x1, y1, x2, y2) = ConvertBbox::<Xyxy>::convert(self).coords;
        let (x3, y3, x4, y4) = ConvertBbox::<Xyxy>::convert(other).coords;

        let x1 = x1.max(x3);
        let y1 = y1.max(y3);
        let x2 = x2.min(x4);
        let y2 = y2.min(y4);

        if x2 < x1 || y2 < y1 {
            0.0
        } else {
            (x2 - x1) * (y2 - y1)
        }
    }

    /// Compute the union area between two bounding boxes.
    pub fn union<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Xyxy>,
    {
        let area1 = ConvertBbox::<Xyxy>::convert(self).area();
        let area2 = ConvertBbox::<Xyxy>::convert(other).area();
        area1 + area2 - self.intersection(other)
    }

    /// Compute the intersection over union (IoU) between two bounding boxes.
    ///
    /// Zero-area boxes have IoU `0.0` with every box, including themselves;
    /// the division is guarded so no NaN can escape.
    pub fn iou<S>(&self, other: &S) -> f32
    where
        S: ConvertBbox<Xyxy>,
    {
        let intersect = self.intersection(other);
        let union = self.union(other);

        if union <= 0.0 { 0.0 } else { intersect / union }
    }
}

impl<T> From<Bbox<T>> for (f32, f32, f32, f32) {
    fn from(bbox: Bbox<T>) -> Self {
        bbox.coords
    }
}

/// Trait for converting a bounding box to a different layout.
pub trait ConvertBbox<T> {
    /// Convert this box into the layout given by `T`.
    fn convert(&self) -> Bbox<T>;
}

/// Marker type for boxes holding the top-left and bottom-right corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Xyxy;

impl Bbox<Xyxy> {
    /// Create a bounding box from the top-left and bottom-right corners.
    #[must_use]
    pub fn xyxy(x1: f32, y1: f32, x2: f32, y2: f32) -> Bbox<Xyxy> {
        Bbox::new((x1, y1, x2, y2))
    }

    /// Clamp the bounding box to the given width and height.
    #[must_use]
    pub fn clamp(&self, width: f32, height: f32) -> Bbox<Xyxy> {
        let (x1, y1, x2, y2) = self.coords;
        Bbox::new((
            x1.clamp(0.0, width),
            y1.clamp(0.0, height),
            x2.clamp(0.0, width),
            y2.clamp(0.0, height),
        ))
    }

    /// Scale the coordinates by the given factors.
    #[must_use]
    pub fn scaled(&self, width: f32, height: f32) -> Bbox<Xyxy> {
        let (x1, y1, x2, y2) = self.coords;
        Bbox::new((x1 * width, y1 * height, x2 * width, y2 * height))
    }
}

impl ConvertBbox<Xyxy> for Bbox<Xyxy> {
    fn convert(&self) -> Bbox<Xyxy> {
        *self
    }
}

impl ConvertBbox<Cxcywh> for Bbox<Xyxy> {
    fn convert(&self) -> Bbox<Cxcywh> {
        let (x1, y1, x2, y2) = self.coords;
        Bbox::new(((x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1))
    }
}

/// Marker type for boxes holding the center and the width and height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cxcywh;

impl Bbox<Cxcywh> {
    /// Create a bounding box from the center and the width and height.
    #[must_use]
    pub fn cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Bbox<Cxcywh> {
        Bbox::new((cx, cy, w, h))
    }
}

impl ConvertBbox<Xyxy> for Bbox<Cxcywh> {
    fn convert(&self) -> Bbox<Xyxy> {
        let (cx, cy, w, h) = self.coords;
        Bbox::new((cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0))
    }
}

impl ConvertBbox<Cxcywh> for Bbox<Cxcywh> {
    fn convert(&self) -> Bbox<Cxcywh> {
        *self
    }
}
