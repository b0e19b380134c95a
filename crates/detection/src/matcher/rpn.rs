//! Region-proposal anchor assignment (Faster R-CNN first stage).

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BACKGROUND, IGNORE, best_match_per_row, best_row_per_column, subsample_label};
use crate::box_coder::BoxCoder;
use crate::error::{Error, Result};
use crate::iou::iou_matrix;

/// Thresholds and quotas for [`RpnMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpnMatcherConfig {
    /// Total number of anchors sampled for the loss.
    pub n_sample: usize,
    /// Anchors with best IoU at or above this are foreground.
    pub pos_iou_thresh: f32,
    /// Anchors with best IoU below this are background.
    pub neg_iou_thresh: f32,
    /// Fraction of the sample reserved for positives.
    pub pos_ratio: f32,
}

impl Default for RpnMatcherConfig {
    fn default() -> Self {
        RpnMatcherConfig {
            n_sample: 256,
            pos_iou_thresh: 0.7,
            neg_iou_thresh: 0.3,
            pos_ratio: 0.5,
        }
    }
}

impl RpnMatcherConfig {
    /// Reject invalid threshold orderings and ratios before any geometry runs.
    pub fn validate(&self) -> Result<()> {
        if self.neg_iou_thresh > self.pos_iou_thresh {
            return Err(Error::ThresholdOrdering {
                neg: self.neg_iou_thresh,
                pos: self.pos_iou_thresh,
            });
        }
        if !(0.0..=1.0).contains(&self.pos_ratio) {
            return Err(Error::PositiveRatio(self.pos_ratio));
        }

        Ok(())
    }
}

/// Full-length per-anchor assignment: objectness labels plus regression
/// targets, aligned with the input anchor order.
#[derive(Debug)]
pub struct RpnTargets {
    /// `-1` ignore, `0` background, `1` foreground, one per anchor.
    pub labels: Array1<i32>,
    /// Encoded offsets to each anchor's best ground truth; zero rows for
    /// anchors outside the image.
    pub locs: Array2<f32>,
}

/// Assigns each anchor an objectness label and a regression target.
///
/// Only anchors fully inside the image take part in matching and sampling;
/// the rest stay ignored. The output is re-expanded to the original index
/// space, so callers always receive arrays aligned with their anchor grid.
pub struct RpnMatcher {
    config: RpnMatcherConfig,
    coder: BoxCoder,
}

impl RpnMatcher {
    /// Create a matcher, validating the configuration.
    pub fn new(config: RpnMatcherConfig) -> Result<Self> {
        config.validate()?;
        // plain ratio parameterization, no variance scaling
        let coder = BoxCoder::new((1.0, 1.0))?;

        Ok(RpnMatcher { config, coder })
    }

    /// Assign labels and regression targets for one image.
    ///
    /// `anchors` and `gt_boxes` are corner-form `Nx4`/`Kx4` matrices in
    /// image pixels; `image_size` is `(width, height)`. An empty ground-truth
    /// set produces all-background labels (still capped at `n_sample`) and
    /// zero targets.
    pub fn assign<R: Rng>(
        &self,
        anchors: ArrayView2<f32>,
        gt_boxes: ArrayView2<f32>,
        image_size: (f32, f32),
        rng: &mut R,
    ) -> Result<RpnTargets> {
        let (width, height) = image_size;
        let num_anchors = anchors.nrows();

        // anchors partially outside the image are excluded from matching,
        // sampling and loss
        let inside: Vec<usize> = anchors
            .axis_iter(Axis(0))
            .enumerate()
            .filter_map(|(i, a)| {
                (a[0] >= 0.0 && a[1] >= 0.0 && a[2] <= width && a[3] <= height).then_some(i)
            })
            .collect();

        // nothing to match or sample against when no anchor survives the
        // boundary filter
        if inside.is_empty() {
            debug!(anchors = num_anchors, inside = 0_usize, "rpn assignment");
            return Ok(RpnTargets {
                labels: Array1::from_elem(num_anchors, IGNORE),
                locs: Array2::zeros((num_anchors, 4)),
            });
        }

        let inside_anchors = anchors.select(Axis(0), &inside);
        let mut labels = Array1::<i32>::from_elem(inside.len(), IGNORE);

        let locs = if gt_boxes.nrows() == 0 {
            labels.fill(BACKGROUND);
            subsample_label(&mut labels, BACKGROUND, self.config.n_sample, rng);
            Array2::zeros((inside.len(), 4))
        } else {
            let ious = iou_matrix(inside_anchors.view(), gt_boxes)?;
            let (max_ious, argmax) = best_match_per_row(ious.view());
            let gt_best_anchors = best_row_per_column(ious.view());

            // assign negatives first so that positives can clobber them
            for (i, &max_iou) in max_ious.iter().enumerate() {
                if max_iou < self.config.neg_iou_thresh {
                    labels[i] = BACKGROUND;
                }
            }

            // every ground truth forces its best anchor to foreground,
            // regardless of the threshold
            for &i in &gt_best_anchors {
                labels[i] = 1;
            }

            for (i, &max_iou) in max_ious.iter().enumerate() {
                if max_iou >= self.config.pos_iou_thresh {
                    labels[i] = 1;
                }
            }

            let n_pos = (self.config.pos_ratio * self.config.n_sample as f32).round() as usize;
            subsample_label(&mut labels, 1, n_pos, rng);

            let actual_pos = labels.iter().filter(|&&l| l == 1).count();
            subsample_label(
                &mut labels,
                BACKGROUND,
                self.config.n_sample.saturating_sub(actual_pos),
                rng,
            );

            let matched = gt_boxes.select(Axis(0), &argmax);
            self.coder.encode(inside_anchors.view(), matched.view())?
        };

        debug!(
            anchors = num_anchors,
            inside = inside.len(),
            positives = labels.iter().filter(|&&l| l == 1).count(),
            negatives = labels.iter().filter(|&&l| l == BACKGROUND).count(),
            "rpn assignment"
        );

        // re-expand to the original anchor index space
        let mut full_labels = Array1::<i32>::from_elem(num_anchors, IGNORE);
        let mut full_locs = Array2::<f32>::zeros((num_anchors, 4));
        for (slot, &original) in inside.iter().enumerate() {
            full_labels[original] = labels[slot];
            full_locs.row_mut(original).assign(&locs.row(slot));
        }

        Ok(RpnTargets {
            labels: full_labels,
            locs: full_locs,
        })
    }
}
