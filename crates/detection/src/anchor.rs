//! Anchor and prior geometry.
//!
//! Anchors are fixed reference boxes; regression targets are expressed as
//! offsets from them. The geometry produced here is read-only and safe to
//! share across a whole batch.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Generates SSD default boxes for a set of feature maps.
///
/// Width/height pairs follow the SSD paper: per scale the pairs are the
/// scale itself, the geometric mean with the next scale, and one pair per
/// aspect ratio (and its inverse).
#[derive(Debug, Clone)]
pub struct DefaultBoxGenerator {
    aspect_ratios: Vec<Vec<f32>>,
    scales: Vec<f32>,
    wh_pairs: Vec<Array2<f32>>,
}

impl DefaultBoxGenerator {
    /// Create a generator with one aspect-ratio list per feature map.
    ///
    /// Scales are evenly distributed between `min_ratio` and `max_ratio`
    /// (common defaults `0.2` and `0.9`), with a trailing `1.0`.
    #[must_use]
    pub fn new(aspect_ratios: Vec<Vec<f32>>, min_ratio: f32, max_ratio: f32) -> Self {
        let num_outputs = aspect_ratios.len();
        let scales = Self::create_scales(num_outputs, min_ratio, max_ratio);
        let wh_pairs = Self::create_width_height_pairs(&aspect_ratios, &scales);

        DefaultBoxGenerator {
            aspect_ratios,
            scales,
            wh_pairs,
        }
    }

    fn create_scales(num_outputs: usize, min_ratio: f32, max_ratio: f32) -> Vec<f32> {
        let mut scales = Vec::with_capacity(num_outputs + 1);
        if num_outputs == 1 {
            scales.push(min_ratio);
        } else {
            let span = max_ratio - min_ratio;
            for i in 0..num_outputs {
                scales.push(min_ratio + span * i as f32 / (num_outputs - 1) as f32);
            }
        }

        scales.push(1.0);

        scales
    }

    fn create_width_height_pairs(
        aspect_ratios: &[Vec<f32>],
        scales: &[f32],
    ) -> Vec<Array2<f32>> {
        let mut pairs = Vec::with_capacity(aspect_ratios.len());
        for (i, ratios) in aspect_ratios.iter().enumerate() {
            let scale = scales[i];
            let scale_prime = (scale * scales[i + 1]).sqrt();

            let mut rows = vec![scale, scale, scale_prime, scale_prime];
            for ratio in ratios {
                let sqrt_ratio = ratio.sqrt();
                rows.extend([scale * sqrt_ratio, scale / sqrt_ratio]);
                rows.extend([scale / sqrt_ratio, scale * sqrt_ratio]);
            }

            let rows_len = rows.len() / 2;
            pairs.push(Array2::from_shape_vec((rows_len, 2), rows).expect("rows are pairs"));
        }

        pairs
    }

    /// The number of default boxes produced for the given feature-map sizes.
    #[must_use]
    pub fn num_boxes(&self, feature_sizes: &[(usize, usize)]) -> usize {
        feature_sizes
            .iter()
            .zip(&self.wh_pairs)
            .map(|((fh, fw), pairs)| fh * fw * pairs.nrows())
            .sum()
    }

    /// Generate the default boxes for the given `(height, width)` feature-map
    /// sizes, in normalized center form (`cx, cy, w, h` in `[0, 1]`).
    ///
    /// One aspect-ratio list must have been configured per feature map.
    pub fn center_boxes(&self, feature_sizes: &[(usize, usize)]) -> Result<Array2<f32>> {
        if feature_sizes.len() != self.aspect_ratios.len() {
            return Err(Error::ScaleCount {
                strides: feature_sizes.len(),
                anchor_lists: self.aspect_ratios.len(),
            });
        }

        let mut rows = Vec::new();
        for ((fh, fw), wh_pairs) in feature_sizes.iter().zip(&self.wh_pairs) {
            for y in 0..*fh {
                let cy = (y as f32 + 0.5) / *fh as f32;
                for x in 0..*fw {
                    let cx = (x as f32 + 0.5) / *fw as f32;
                    for pair in wh_pairs.rows() {
                        rows.extend([cx, cy, pair[0].clamp(0.0, 1.0), pair[1].clamp(0.0, 1.0)]);
                    }
                }
            }
        }

        let count = rows.len() / 4;
        Ok(Array2::from_shape_vec((count, 4), rows).expect("rows are boxes"))
    }

    /// The configured scale for each feature map, plus the trailing `1.0`.
    #[must_use]
    pub fn scales(&self) -> &[f32] {
        &self.scales
    }
}

/// Convert center-form boxes to corner form.
#[must_use]
pub fn center_to_corner(boxes: ArrayView2<f32>) -> Array2<f32> {
    let mut corners = Array2::<f32>::zeros(boxes.raw_dim());
    for (mut out, row) in corners.rows_mut().into_iter().zip(boxes.rows()) {
        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        out[0] = cx - w / 2.0;
        out[1] = cy - h / 2.0;
        out[2] = cx + w / 2.0;
        out[3] = cy + h / 2.0;
    }
    corners
}

/// Tile base anchors over a feature map, producing the full-image grid.
///
/// Row order is `(row, col, base)`, matching a `[H, W, A]` flatten. The base
/// anchors are corner-form offsets around the cell origin; `stride` is the
/// step between cells in image pixels.
#[must_use]
pub fn grid_anchors(
    base_anchors: ArrayView2<f32>,
    height: usize,
    width: usize,
    stride: usize,
) -> Array2<f32> {
    let num_base = base_anchors.nrows();
    let mut anchors = Array2::<f32>::zeros((height * width * num_base, 4));

    let mut row = 0;
    for y in 0..height {
        let shift_y = (y * stride) as f32;
        for x in 0..width {
            let shift_x = (x * stride) as f32;
            for base in base_anchors.rows() {
                anchors[(row, 0)] = base[0] + shift_x;
                anchors[(row, 1)] = base[1] + shift_y;
                anchors[(row, 2)] = base[2] + shift_x;
                anchors[(row, 3)] = base[3] + shift_y;
                row += 1;
            }
        }
    }

    anchors
}

/// Generate corner-form base anchors centered on a cell for every
/// ratio/scale combination, RPN style.
#[must_use]
pub fn base_anchors(base_size: f32, ratios: &[f32], scales: &[f32]) -> Array2<f32> {
    let mut rows = Vec::with_capacity(ratios.len() * scales.len() * 4);
    let center = base_size / 2.0;

    for ratio in ratios {
        for scale in scales {
            let w = base_size * scale / ratio.sqrt();
            let h = base_size * scale * ratio.sqrt();
            rows.extend([center - w / 2.0, center - h / 2.0, center + w / 2.0, center + h / 2.0]);
        }
    }

    let count = rows.len() / 4;
    Array2::from_shape_vec((count, 4), rows).expect("rows are boxes")
}

/// One YOLO output scale: the feature-map stride plus the anchor shapes
/// (width, height in input pixels) predicted at every grid cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YoloGridSpec {
    /// Step between grid cells, in input pixels.
    pub stride: usize,
    /// Anchor shapes at each cell, in input pixels.
    pub anchors: Vec<(f32, f32)>,
}

impl YoloGridSpec {
    /// Grid size `(width, height)` for the given input size.
    pub fn grid_size(&self, input_size: (usize, usize)) -> Result<(usize, usize)> {
        let (width, height) = input_size;
        if self.stride == 0 || width < self.stride || height < self.stride {
            return Err(Error::GridGeometry {
                stride: self.stride,
                width,
                height,
            });
        }

        Ok((width / self.stride, height / self.stride))
    }

    /// Number of target cells this scale contributes after flattening.
    pub fn num_cells(&self, input_size: (usize, usize)) -> Result<usize> {
        let (gw, gh) = self.grid_size(input_size)?;
        Ok(self.anchors.len() * gw * gh)
    }
}
