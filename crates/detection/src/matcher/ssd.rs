//! Single-shot multibox default-box assignment.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BACKGROUND, IGNORE, best_match_per_row, best_row_per_column};
use crate::anchor::center_to_corner;
use crate::box_coder::BoxCoder;
use crate::error::{Error, Result};
use crate::iou::iou_matrix;

/// How below-threshold default boxes are labeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorMethod {
    /// Below-threshold boxes become background.
    Standard,
    /// RetinaNet-style split: below the threshold boxes are ignored, below
    /// `threshold - 0.1` they become background.
    Retina,
}

/// Matching threshold and codec variances for [`SsdMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SsdMatcherConfig {
    /// Default boxes with best IoU below this are background (or ignored,
    /// see [`AnchorMethod`]).
    pub iou_threshold: f32,
    /// Below-threshold labeling policy.
    pub anchor_method: AnchorMethod,
    /// Codec `(center, size)` variances.
    pub variances: (f32, f32),
}

impl Default for SsdMatcherConfig {
    fn default() -> Self {
        SsdMatcherConfig {
            iou_threshold: 0.5,
            anchor_method: AnchorMethod::Standard,
            variances: (0.1, 0.2),
        }
    }
}

/// Per-default-box class labels and regression targets for one image.
#[derive(Debug)]
pub struct SsdTargets {
    /// Encoded offsets to each default box's best ground truth.
    pub locs: Array2<f32>,
    /// `-1` ignore (retina only), `0` background, `1..=C` class ids, one
    /// per default box.
    pub conf: Array1<i32>,
}

/// Assigns every default box a class label and a regression target.
///
/// Unlike the RPN policy, all default boxes are candidates (no inside-image
/// restriction), and after per-box assignment every ground truth forces its
/// best default box to carry that ground truth's class regardless of the
/// threshold outcome.
pub struct SsdMatcher {
    config: SsdMatcherConfig,
    coder: BoxCoder,
}

impl SsdMatcher {
    /// Create a matcher, validating the configuration.
    pub fn new(config: SsdMatcherConfig) -> Result<Self> {
        let coder = BoxCoder::new(config.variances)?;

        Ok(SsdMatcher { config, coder })
    }

    /// Assign labels and targets for one image.
    ///
    /// `default_boxes` are center-form priors (the layout the grid generator
    /// produces); `gt_labels` are 0-based class ids. An empty ground-truth
    /// set yields all-zero targets and all-background labels.
    pub fn assign(
        &self,
        gt_boxes: ArrayView2<f32>,
        gt_labels: &[usize],
        default_boxes: ArrayView2<f32>,
    ) -> Result<SsdTargets> {
        if gt_boxes.nrows() != gt_labels.len() {
            return Err(Error::LabelCount {
                boxes: gt_boxes.nrows(),
                labels: gt_labels.len(),
            });
        }

        // an empty prior set has nothing for the override pass to claim
        let num_priors = default_boxes.nrows();
        if gt_boxes.nrows() == 0 || num_priors == 0 {
            return Ok(SsdTargets {
                locs: Array2::zeros((num_priors, 4)),
                conf: Array1::from_elem(num_priors, BACKGROUND),
            });
        }

        let priors = center_to_corner(default_boxes);
        let ious = iou_matrix(priors.view(), gt_boxes)?;
        let (prior_iou, assignment) = best_match_per_row(ious.view());

        let matched = gt_boxes.select(Axis(0), &assignment);
        let locs = self.coder.encode(priors.view(), matched.view())?;

        // background class stays 0
        let mut conf =
            Array1::from_iter(assignment.iter().map(|&gt| gt_labels[gt] as i32 + 1));

        match self.config.anchor_method {
            AnchorMethod::Standard => {
                for (i, &iou) in prior_iou.iter().enumerate() {
                    if iou < self.config.iou_threshold {
                        conf[i] = BACKGROUND;
                    }
                }
            }
            AnchorMethod::Retina => {
                for (i, &iou) in prior_iou.iter().enumerate() {
                    if iou < self.config.iou_threshold {
                        conf[i] = IGNORE;
                    }
                    if iou < self.config.iou_threshold - 0.1 {
                        conf[i] = BACKGROUND;
                    }
                }
            }
        }

        // second override pass: every ground truth claims its best default
        // box with its own class, whatever the threshold said
        for (gt, &prior) in best_row_per_column(ious.view()).iter().enumerate() {
            conf[prior] = gt_labels[gt] as i32 + 1;
        }

        debug!(
            priors = num_priors,
            foreground = conf.iter().filter(|&&c| c > 0).count(),
            "ssd assignment"
        );

        Ok(SsdTargets { locs, conf })
    }

    /// Assign a whole batch, one ground-truth set per image.
    pub fn assign_batch(
        &self,
        batch_gt_boxes: &[Array2<f32>],
        batch_gt_labels: &[Vec<usize>],
        default_boxes: ArrayView2<f32>,
    ) -> Result<Vec<SsdTargets>> {
        batch_gt_boxes
            .iter()
            .zip(batch_gt_labels)
            .map(|(boxes, labels)| self.assign(boxes.view(), labels, default_boxes))
            .collect()
    }
}
