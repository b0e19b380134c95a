//! Proposal (RoI) sampling and refinement targets (Faster R-CNN second stage).

use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate};
use rand::Rng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::BACKGROUND;
use crate::box_coder::BoxCoder;
use crate::error::{Error, Result};
use crate::iou::iou_matrix;

/// Thresholds, quotas and target normalization for [`RoiMatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoiMatcherConfig {
    /// Number of proposals sampled per image.
    pub n_sample: usize,
    /// Proposals with best IoU at or above this are foreground.
    pub pos_iou_thresh: f32,
    /// Background band upper bound (exclusive).
    pub neg_iou_thresh_hi: f32,
    /// Background band lower bound (inclusive).
    pub neg_iou_thresh_lo: f32,
    /// Fraction of the sample reserved for positives.
    pub pos_ratio: f32,
    /// Subtracted from encoded targets, per channel.
    pub loc_normalize_mean: [f32; 4],
    /// Divides encoded targets, per channel.
    pub loc_normalize_std: [f32; 4],
}

impl Default for RoiMatcherConfig {
    fn default() -> Self {
        RoiMatcherConfig {
            n_sample: 128,
            pos_iou_thresh: 0.5,
            neg_iou_thresh_hi: 0.5,
            neg_iou_thresh_lo: 0.0,
            pos_ratio: 0.25,
            loc_normalize_mean: [0.0, 0.0, 0.0, 0.0],
            loc_normalize_std: [0.1, 0.1, 0.2, 0.2],
        }
    }
}

impl RoiMatcherConfig {
    /// Reject invalid threshold orderings, ratios and normalizations.
    pub fn validate(&self) -> Result<()> {
        if self.neg_iou_thresh_lo > self.neg_iou_thresh_hi
            || self.neg_iou_thresh_hi > self.pos_iou_thresh
        {
            return Err(Error::ThresholdOrdering {
                neg: self.neg_iou_thresh_hi,
                pos: self.pos_iou_thresh,
            });
        }
        if !(0.0..=1.0).contains(&self.pos_ratio) {
            return Err(Error::PositiveRatio(self.pos_ratio));
        }
        if self.loc_normalize_std.contains(&0.0) {
            return Err(Error::ZeroNormalizationStd);
        }

        Ok(())
    }
}

/// The proposals picked for the loss, with their class labels and
/// normalized regression targets. Positives come first, then background.
#[derive(Debug)]
pub struct SampledRois {
    /// Sampled proposal boxes, corner form.
    pub rois: Array2<f32>,
    /// Normalized offsets from each sampled proposal to its ground truth.
    pub locs: Array2<f32>,
    /// `0` background, `1..=C` foreground class ids.
    pub labels: Array1<i32>,
}

/// Samples proposals against the ground truth and produces class-aware
/// refinement targets.
///
/// The ground-truth boxes are appended to the proposal set before matching,
/// so every object trivially self-matches as a positive. Class ids are
/// offset by `+1` to reserve `0` for background.
pub struct RoiMatcher {
    config: RoiMatcherConfig,
    coder: BoxCoder,
}

impl RoiMatcher {
    /// Create a matcher, validating the configuration.
    pub fn new(config: RoiMatcherConfig) -> Result<Self> {
        config.validate()?;
        let coder = BoxCoder::new((1.0, 1.0))?;

        Ok(RoiMatcher { config, coder })
    }

    /// Sample proposals for one image.
    ///
    /// `gt_labels` are 0-based foreground class ids, one per ground-truth
    /// box. An empty ground-truth set yields an all-background sample of at
    /// most `n_sample` proposals with zero targets.
    pub fn assign<R: Rng>(
        &self,
        rois: ArrayView2<f32>,
        gt_boxes: ArrayView2<f32>,
        gt_labels: &[usize],
        rng: &mut R,
    ) -> Result<SampledRois> {
        if gt_boxes.nrows() != gt_labels.len() {
            return Err(Error::LabelCount {
                boxes: gt_boxes.nrows(),
                labels: gt_labels.len(),
            });
        }

        if gt_boxes.nrows() == 0 {
            let keep = rois.nrows().min(self.config.n_sample);
            let rois = rois.slice_axis(Axis(0), ndarray::Slice::from(0..keep));
            return Ok(SampledRois {
                rois: rois.to_owned(),
                locs: Array2::zeros((keep, 4)),
                labels: Array1::from_elem(keep, BACKGROUND),
            });
        }

        // ground truths join the candidate pool and self-match as positives
        let pool = concatenate![Axis(0), rois, gt_boxes];
        let ious = iou_matrix(pool.view(), gt_boxes)?;
        let (max_ious, assignment) = super::best_match_per_row(ious.view());

        let pos_quota = (self.config.n_sample as f32 * self.config.pos_ratio).round() as usize;
        let pos_candidates: Vec<usize> = (0..pool.nrows())
            .filter(|&i| max_ious[i] >= self.config.pos_iou_thresh)
            .collect();
        let pos_keep = pick(&pos_candidates, pos_quota.min(pos_candidates.len()), rng);

        let neg_candidates: Vec<usize> = (0..pool.nrows())
            .filter(|&i| {
                max_ious[i] >= self.config.neg_iou_thresh_lo
                    && max_ious[i] < self.config.neg_iou_thresh_hi
            })
            .collect();
        let neg_quota = self.config.n_sample.saturating_sub(pos_keep.len());
        let neg_keep = pick(&neg_candidates, neg_quota.min(neg_candidates.len()), rng);

        debug!(
            proposals = rois.nrows(),
            positives = pos_keep.len(),
            negatives = neg_keep.len(),
            "roi sampling"
        );

        let num_pos = pos_keep.len();
        let keep: Vec<usize> = pos_keep.into_iter().chain(neg_keep).collect();

        // 0 stays background; foreground classes shift to 1..=C
        let labels = Array1::from_iter(keep.iter().enumerate().map(|(slot, &i)| {
            if slot < num_pos {
                gt_labels[assignment[i]] as i32 + 1
            } else {
                BACKGROUND
            }
        }));

        let sampled = pool.select(Axis(0), &keep);
        let matched_idx: Vec<usize> = keep.iter().map(|&i| assignment[i]).collect();
        let matched = gt_boxes.select(Axis(0), &matched_idx);

        let mut locs = self.coder.encode(sampled.view(), matched.view())?;
        for mut row in locs.rows_mut() {
            for c in 0..4 {
                row[c] = (row[c] - self.config.loc_normalize_mean[c])
                    / self.config.loc_normalize_std[c];
            }
        }

        Ok(SampledRois {
            rois: sampled,
            locs,
            labels,
        })
    }
}

/// Uniformly pick `amount` distinct entries, preserving no particular order.
fn pick<R: Rng>(candidates: &[usize], amount: usize, rng: &mut R) -> Vec<usize> {
    if candidates.len() == amount {
        return candidates.to_vec();
    }

    index::sample(rng, candidates.len(), amount)
        .iter()
        .map(|i| candidates[i])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn matcher() -> RoiMatcher {
        RoiMatcher::new(RoiMatcherConfig::default()).unwrap()
    }

    #[test]
    fn background_band_ordering_is_validated() {
        let result = RoiMatcher::new(RoiMatcherConfig {
            neg_iou_thresh_lo: 0.6,
            neg_iou_thresh_hi: 0.5,
            ..RoiMatcherConfig::default()
        });

        assert!(matches!(result, Err(Error::ThresholdOrdering { .. })));
    }

    #[test]
    fn ground_truths_self_match_with_offset_class() {
        let matcher = matcher();
        let rois = array![[40.0, 40.0, 60.0, 60.0]];
        let gt = array![[0.0, 0.0, 10.0, 10.0]];
        let mut rng = StdRng::seed_from_u64(1);

        let sampled = matcher.assign(rois.view(), gt.view(), &[4], &mut rng).unwrap();

        // the appended ground truth is the only positive; class 4 shifts to 5
        let positives: Vec<i32> = sampled
            .labels
            .iter()
            .copied()
            .filter(|&l| l > 0)
            .collect();
        assert_eq!(positives, vec![5]);

        // a self-matched positive encodes to (near) zero offsets
        assert!(sampled.locs.row(0).iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn sample_is_class_balanced() {
        let config = RoiMatcherConfig {
            n_sample: 8,
            ..RoiMatcherConfig::default()
        };
        let matcher = RoiMatcher::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(5);

        let mut rows = Vec::new();
        for i in 0..10 {
            let offset = i as f32 * 0.1;
            rows.extend([offset, offset, 10.0 + offset, 10.0 + offset]);
        }
        for i in 0..10 {
            let offset = 40.0 + 3.0 * i as f32;
            rows.extend([offset, offset, offset + 5.0, offset + 5.0]);
        }
        let rois = Array2::from_shape_vec((20, 4), rows).unwrap();
        let gt = array![[0.0, 0.0, 10.0, 10.0]];

        let sampled = matcher.assign(rois.view(), gt.view(), &[0], &mut rng).unwrap();

        let positives = sampled.labels.iter().filter(|&&l| l > 0).count();
        assert_eq!(positives, 2);
        assert_eq!(sampled.labels.len(), 8);
        // positives first, then background
        assert!(sampled.labels.iter().take(2).all(|&l| l == 1));
        assert!(sampled.labels.iter().skip(2).all(|&l| l == BACKGROUND));
    }

    #[test]
    fn targets_are_normalized() {
        let config = RoiMatcherConfig {
            loc_normalize_std: [0.5, 0.5, 0.5, 0.5],
            ..RoiMatcherConfig::default()
        };
        let matcher = RoiMatcher::new(config).unwrap();
        let mut rng = StdRng::seed_from_u64(2);

        let rois = array![[0.0, 0.0, 10.0, 10.0]];
        let gt = array![[1.0, 1.0, 9.0, 9.0]];

        let sampled = matcher.assign(rois.view(), gt.view(), &[0], &mut rng).unwrap();

        let positive = sampled
            .labels
            .iter()
            .position(|&l| l > 0)
            .expect("has a positive");
        // raw dw = ln(0.8), divided by std 0.5
        assert!((sampled.locs[(positive, 2)] - (0.8f32).ln() / 0.5).abs() < 1e-5);
    }

    #[test]
    fn empty_ground_truth_yields_background_sample() {
        let matcher = matcher();
        let rois = array![[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 15.0, 15.0]];
        let gt = Array2::<f32>::zeros((0, 4));
        let mut rng = StdRng::seed_from_u64(0);

        let sampled = matcher.assign(rois.view(), gt.view(), &[], &mut rng).unwrap();

        assert_eq!(sampled.labels.len(), 2);
        assert!(sampled.labels.iter().all(|&l| l == BACKGROUND));
        assert!(sampled.locs.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn label_count_mismatch_is_rejected() {
        let matcher = matcher();
        let rois = array![[0.0, 0.0, 10.0, 10.0]];
        let gt = array![[0.0, 0.0, 10.0, 10.0]];
        let mut rng = StdRng::seed_from_u64(0);

        assert!(matches!(
            matcher.assign(rois.view(), gt.view(), &[], &mut rng),
            Err(Error::LabelCount { boxes: 1, labels: 0 })
        ));
    }
}
