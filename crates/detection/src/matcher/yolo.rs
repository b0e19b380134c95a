//! Per-scale regression-grid assignment (YOLOv3 style).
//!
//! Unlike the anchor-sweeping policies this one walks the ground-truth
//! boxes: each object picks one grid cell per scale from its center and one
//! anchor shape by IoU, and writes its target into exactly that slot.

use ndarray::{Array2, Array3, ArrayView2, array, s};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::anchor::YoloGridSpec;
use crate::error::{Error, Result};
use crate::iou::iou_matrix;

/// Floor inside the log so degenerate boxes stay finite.
const LOG_FLOOR: f32 = 1e-16;

/// Grid geometry and thresholds for [`YoloMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YoloMatcherConfig {
    /// One spec per output scale, matching the network's heads.
    pub scales: Vec<YoloGridSpec>,
    /// Anchor shapes whose IoU with a ground truth exceeds this leave the
    /// no-object mask across their whole grid, without being forced
    /// positive.
    pub ignore_threshold: f32,
    /// Number of foreground classes.
    pub num_classes: usize,
    /// Network input size `(width, height)` in pixels.
    pub input_size: (usize, usize),
}

impl YoloMatcherConfig {
    /// Reject empty or degenerate grid configurations.
    pub fn validate(&self) -> Result<()> {
        if self.scales.is_empty() {
            return Err(Error::ScaleCount {
                strides: 0,
                anchor_lists: 0,
            });
        }
        for spec in &self.scales {
            spec.grid_size(self.input_size)?;
            if let Some(index) = spec
                .anchors
                .iter()
                .position(|&(w, h)| w <= 0.0 || h <= 0.0)
            {
                return Err(Error::DegenerateAnchor { index });
            }
        }

        Ok(())
    }

    /// Total number of target cells across all scales after flattening.
    pub fn num_cells(&self) -> Result<usize> {
        self.scales
            .iter()
            .map(|spec| spec.num_cells(self.input_size))
            .sum()
    }
}

/// Dense per-cell targets and masks for a whole batch.
///
/// Cells flatten in `(anchor, row, col)` order per scale and concatenate
/// across scales along the cell axis, matching the network's output layout.
#[derive(Debug)]
pub struct YoloTargets {
    /// `[batch, cells, 5 + C]` rows of `tx, ty, tw, th, tconf, one-hot class`.
    pub target: Array3<f32>,
    /// `[batch, cells, 1]`, `1.0` at the single responsible cell per object.
    pub obj_mask: Array3<f32>,
    /// `[batch, cells, 1]`, `0.0` where a cell is positive or belongs to an
    /// anchor shape that overlaps a ground truth too much to count as
    /// negative.
    pub noobj_mask: Array3<f32>,
}

/// Builds YOLO regression targets for batches of ground truth.
pub struct YoloMatcher {
    config: YoloMatcherConfig,
}

impl YoloMatcher {
    /// Create a matcher, validating the grid configuration.
    pub fn new(config: YoloMatcherConfig) -> Result<Self> {
        config.validate()?;

        Ok(YoloMatcher { config })
    }

    /// Assign targets for a whole batch.
    ///
    /// Ground-truth boxes are corner form, normalized to `[0, 1]`; all-zero
    /// rows are padding and skipped. `gt_labels` are 0-based class ids.
    pub fn assign_batch(
        &self,
        batch_gt_boxes: &[Array2<f32>],
        batch_gt_labels: &[Vec<usize>],
    ) -> Result<YoloTargets> {
        if batch_gt_boxes.len() != batch_gt_labels.len() {
            return Err(Error::LabelCount {
                boxes: batch_gt_boxes.len(),
                labels: batch_gt_labels.len(),
            });
        }

        let batch_size = batch_gt_boxes.len();
        let channels = 5 + self.config.num_classes;
        let total_cells = self.config.num_cells()?;

        let mut target = Array3::<f32>::zeros((batch_size, total_cells, channels));
        let mut obj_mask = Array3::<f32>::zeros((batch_size, total_cells, 1));
        let mut noobj_mask = Array3::<f32>::ones((batch_size, total_cells, 1));

        let mut scale_offset = 0;
        for spec in &self.config.scales {
            let (grid_w, grid_h) = spec.grid_size(self.config.input_size)?;

            // anchor shapes in grid units, zero-centered for shape-only IoU
            let stride = spec.stride as f32;
            let shapes: Vec<f32> = spec
                .anchors
                .iter()
                .flat_map(|&(w, h)| [0.0, 0.0, w / stride, h / stride])
                .collect();
            let anchor_shapes =
                Array2::from_shape_vec((spec.anchors.len(), 4), shapes).expect("rows are boxes");

            for (b, (gt_boxes, gt_labels)) in
                batch_gt_boxes.iter().zip(batch_gt_labels).enumerate()
            {
                if gt_boxes.nrows() != gt_labels.len() {
                    return Err(Error::LabelCount {
                        boxes: gt_boxes.nrows(),
                        labels: gt_labels.len(),
                    });
                }

                for (gt, &label) in gt_boxes.rows().into_iter().zip(gt_labels) {
                    if gt.iter().all(|&v| v == 0.0) {
                        continue;
                    }
                    if label >= self.config.num_classes {
                        return Err(Error::ClassId {
                            id: label,
                            num_classes: self.config.num_classes,
                        });
                    }

                    self.assign_one(
                        gt,
                        label,
                        anchor_shapes.view(),
                        (grid_w, grid_h),
                        scale_offset,
                        target.index_axis_mut(ndarray::Axis(0), b),
                        obj_mask.index_axis_mut(ndarray::Axis(0), b),
                        noobj_mask.index_axis_mut(ndarray::Axis(0), b),
                    )?;
                }
            }

            scale_offset += spec.num_cells(self.config.input_size)?;
        }

        debug!(
            batch = batch_size,
            cells = total_cells,
            positives = obj_mask.iter().filter(|&&v| v > 0.0).count(),
            "yolo assignment"
        );

        Ok(YoloTargets {
            target,
            obj_mask,
            noobj_mask,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn assign_one(
        &self,
        gt: ndarray::ArrayView1<f32>,
        label: usize,
        anchor_shapes: ArrayView2<f32>,
        (grid_w, grid_h): (usize, usize),
        scale_offset: usize,
        mut target: ndarray::ArrayViewMut2<f32>,
        mut obj_mask: ndarray::ArrayViewMut2<f32>,
        mut noobj_mask: ndarray::ArrayViewMut2<f32>,
    ) -> Result<()> {
        // object center and size in grid units
        let gx = (gt[0] + gt[2]) / 2.0 * grid_w as f32;
        let gy = (gt[1] + gt[3]) / 2.0 * grid_h as f32;
        let gw = (gt[2] - gt[0]) * grid_w as f32;
        let gh = (gt[3] - gt[1]) * grid_h as f32;

        let gi = (gx.max(0.0) as usize).min(grid_w - 1);
        let gj = (gy.max(0.0) as usize).min(grid_h - 1);

        let gt_shape = array![[0.0, 0.0, gw, gh]];
        let ious = iou_matrix(gt_shape.view(), anchor_shapes)?;

        let plane = grid_h * grid_w;
        let flat = |anchor: usize| scale_offset + anchor * plane + gj * grid_w + gi;

        // high-overlap shapes drop out of the negative pool across the
        // whole grid, the shape IoU does not depend on the cell
        let mut best = 0;
        for (anchor, &iou) in ious.row(0).iter().enumerate() {
            if iou > self.config.ignore_threshold {
                let start = scale_offset + anchor * plane;
                noobj_mask.slice_mut(s![start..start + plane, ..]).fill(0.0);
            }
            if iou > ious[(0, best)] {
                best = anchor;
            }
        }

        let cell = flat(best);
        obj_mask[(cell, 0)] = 1.0;
        noobj_mask[(cell, 0)] = 0.0;

        let (anchor_w, anchor_h) = (anchor_shapes[(best, 2)], anchor_shapes[(best, 3)]);
        target[(cell, 0)] = gx - gi as f32;
        target[(cell, 1)] = gy - gj as f32;
        target[(cell, 2)] = (gw / anchor_w + LOG_FLOOR).ln();
        target[(cell, 3)] = (gh / anchor_h + LOG_FLOOR).ln();
        target[(cell, 4)] = 1.0;
        target[(cell, 5 + label)] = 1.0;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> YoloMatcherConfig {
        YoloMatcherConfig {
            scales: vec![
                YoloGridSpec {
                    stride: 4,
                    anchors: vec![(4.0, 4.0), (8.0, 8.0)],
                },
                YoloGridSpec {
                    stride: 8,
                    anchors: vec![(8.0, 8.0)],
                },
            ],
            ignore_threshold: 0.5,
            num_classes: 3,
            input_size: (16, 16),
        }
    }

    #[test]
    fn cell_layout_concatenates_scales() {
        let config = config();
        // 2 anchors * 4x4 grid + 1 anchor * 2x2 grid
        assert_eq!(config.num_cells().unwrap(), 32 + 4);
    }

    #[test]
    fn one_object_claims_exactly_one_cell_per_scale() {
        let matcher = YoloMatcher::new(config()).unwrap();
        // object center (0.25, 0.25), a quarter of the image wide
        let boxes = vec![ndarray::array![[0.125, 0.125, 0.375, 0.375]]];
        let labels = vec![vec![1]];

        let targets = matcher.assign_batch(&boxes, &labels).unwrap();

        let positives: Vec<usize> = targets
            .obj_mask
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| (v > 0.0).then_some(i))
            .collect();
        assert_eq!(positives.len(), 2);

        // first scale: 4x4 grid, object is 1 cell wide, best anchor is the
        // 4px shape (index 0), cell (1, 1)
        let cell = positives[0];
        assert_eq!(cell, 4 + 1);
        assert!((targets.target[(0, cell, 0)] - 0.0).abs() < 1e-6);
        assert!((targets.target[(0, cell, 2)]).abs() < 1e-6);
        assert_eq!(targets.target[(0, cell, 4)], 1.0);
        assert_eq!(targets.target[(0, cell, 5 + 1)], 1.0);
        assert_eq!(targets.noobj_mask[(0, cell, 0)], 0.0);
    }

    #[test]
    fn high_overlap_shapes_leave_the_negative_pool() {
        let matcher = YoloMatcher::new(YoloMatcherConfig {
            scales: vec![YoloGridSpec {
                stride: 4,
                // nearly identical shapes: both overlap the object strongly
                anchors: vec![(4.0, 4.0), (4.4, 4.4)],
            }],
            ignore_threshold: 0.5,
            num_classes: 1,
            input_size: (16, 16),
        })
        .unwrap();

        let boxes = vec![ndarray::array![[0.125, 0.125, 0.375, 0.375]]];
        let labels = vec![vec![0]];

        let targets = matcher.assign_batch(&boxes, &labels).unwrap();

        let positives = targets.obj_mask.iter().filter(|&&v| v > 0.0).count();
        let ignored = targets.noobj_mask.iter().filter(|&&v| v == 0.0).count();
        assert_eq!(positives, 1);
        // both shapes overlap the object strongly, so both 4x4 planes leave
        // the negative pool entirely
        assert_eq!(ignored, 32);
    }

    #[test]
    fn low_overlap_shapes_stay_negative_outside_the_object_cell() {
        let matcher = YoloMatcher::new(YoloMatcherConfig {
            scales: vec![YoloGridSpec {
                stride: 4,
                anchors: vec![(4.0, 4.0), (16.0, 16.0)],
            }],
            ignore_threshold: 0.5,
            num_classes: 1,
            input_size: (16, 16),
        })
        .unwrap();

        let boxes = vec![ndarray::array![[0.125, 0.125, 0.375, 0.375]]];
        let labels = vec![vec![0]];

        let targets = matcher.assign_batch(&boxes, &labels).unwrap();

        // the 4px shape matches (IoU 1.0): its plane is fully excluded; the
        // 16px shape overlaps at IoU 1/16 and stays negative everywhere
        let ignored = targets.noobj_mask.iter().filter(|&&v| v == 0.0).count();
        assert_eq!(ignored, 16);
        assert_eq!(targets.obj_mask.iter().filter(|&&v| v > 0.0).count(), 1);
    }

    #[test]
    fn padding_rows_are_skipped() {
        let matcher = YoloMatcher::new(config()).unwrap();
        let boxes = vec![ndarray::array![[0.0, 0.0, 0.0, 0.0]]];
        let labels = vec![vec![2]];

        let targets = matcher.assign_batch(&boxes, &labels).unwrap();

        assert!(targets.obj_mask.iter().all(|&v| v == 0.0));
        assert!(targets.noobj_mask.iter().all(|&v| v == 1.0));
        assert!(targets.target.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_image_is_all_negative() {
        let matcher = YoloMatcher::new(config()).unwrap();
        let boxes = vec![Array2::<f32>::zeros((0, 4))];
        let labels = vec![vec![]];

        let targets = matcher.assign_batch(&boxes, &labels).unwrap();

        assert!(targets.obj_mask.iter().all(|&v| v == 0.0));
        assert!(targets.noobj_mask.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn out_of_range_class_is_rejected() {
        let matcher = YoloMatcher::new(config()).unwrap();
        let boxes = vec![ndarray::array![[0.1, 0.1, 0.4, 0.4]]];
        let labels = vec![vec![3]];

        assert!(matches!(
            matcher.assign_batch(&boxes, &labels),
            Err(Error::ClassId {
                id: 3,
                num_classes: 3
            })
        ));
    }

    #[test]
    fn centers_on_the_image_edge_stay_in_bounds() {
        let matcher = YoloMatcher::new(config()).unwrap();
        let boxes = vec![ndarray::array![[0.75, 0.75, 1.25, 1.25]]];
        let labels = vec![vec![0]];

        // center at exactly 1.0 would index one past the last cell without
        // the clamp
        let targets = matcher.assign_batch(&boxes, &labels).unwrap();
        assert_eq!(targets.obj_mask.iter().filter(|&&v| v > 0.0).count(), 2);
    }
}
