//! Offset/log-scale codec between matched box pairs and regression targets.

use ndarray::{Array2, ArrayView2, Axis, stack};

use crate::error::{Error, Result};
use crate::iou::check_box_shape;

/// Floor for width/height ratios before taking the log, so degenerate
/// ground-truth boxes encode to a large negative value instead of `-inf`.
const LOG_RATIO_FLOOR: f32 = 1e-16;

/// Encodes a matched ground-truth/anchor pair into a 4-value regression
/// target and decodes a predicted target back into an absolute box.
///
/// `variances` scale the center and size channels respectively; the plain
/// Faster R-CNN parameterization uses `(1.0, 1.0)`, SSD uses `(0.1, 0.2)`.
/// They are an explicit parameter so every matching policy shares this one
/// implementation.
pub struct BoxCoder {
    variances: (f32, f32),
    bbox_xform_clip: f32,
}

impl BoxCoder {
    /// Create a new [`BoxCoder`] with the given `(center, size)` variances.
    ///
    /// This will default to a `bbox_xform_clip` of `ln(1000/16)`.
    pub fn new(variances: (f32, f32)) -> Result<Self> {
        Self::with_clip(variances, (1000_f32 / 16_f32).ln())
    }

    /// Create a new [`BoxCoder`] with the given variances and clipping value.
    pub fn with_clip(variances: (f32, f32), bbox_xform_clip: f32) -> Result<Self> {
        if variances.0 == 0.0 || variances.1 == 0.0 {
            return Err(Error::ZeroVariance(variances.0, variances.1));
        }

        Ok(BoxCoder {
            variances,
            bbox_xform_clip,
        })
    }

    /// Encode matched boxes as offsets from their anchors.
    ///
    /// Both inputs are corner-form `Nx4` matrices, row `i` of `matched` being
    /// the ground-truth box assigned to anchor `i`. Fails with
    /// [`Error::DegenerateAnchor`] if any anchor has zero width or height;
    /// that is a configuration problem, not a runtime condition to mask.
    pub fn encode(&self, anchors: ArrayView2<f32>, matched: ArrayView2<f32>) -> Result<Array2<f32>> {
        check_box_shape(anchors)?;
        check_box_shape(matched)?;

        let (v_center, v_size) = self.variances;
        let mut targets = Array2::<f32>::zeros((anchors.nrows(), 4));

        for (i, (anchor, gt)) in anchors
            .axis_iter(Axis(0))
            .zip(matched.axis_iter(Axis(0)))
            .enumerate()
        {
            let anchor_w = anchor[2] - anchor[0];
            let anchor_h = anchor[3] - anchor[1];
            if anchor_w <= 0.0 || anchor_h <= 0.0 {
                return Err(Error::DegenerateAnchor { index: i });
            }

            let anchor_cx = (anchor[0] + anchor[2]) / 2.0;
            let anchor_cy = (anchor[1] + anchor[3]) / 2.0;
            let gt_cx = (gt[0] + gt[2]) / 2.0;
            let gt_cy = (gt[1] + gt[3]) / 2.0;
            let gt_w = gt[2] - gt[0];
            let gt_h = gt[3] - gt[1];

            targets[(i, 0)] = (gt_cx - anchor_cx) / anchor_w / v_center;
            targets[(i, 1)] = (gt_cy - anchor_cy) / anchor_h / v_center;
            targets[(i, 2)] = (gt_w / anchor_w).max(LOG_RATIO_FLOOR).ln() / v_size;
            targets[(i, 3)] = (gt_h / anchor_h).max(LOG_RATIO_FLOOR).ln() / v_size;
        }

        Ok(targets)
    }

    /// Decode regression targets back into absolute corner-form boxes.
    ///
    /// Exact inverse of [`encode`](Self::encode) up to floating-point
    /// tolerance and the `exp` overflow clamp.
    pub fn decode(&self, rel_codes: ArrayView2<f32>, anchors: ArrayView2<f32>) -> Array2<f32> {
        let widths = &anchors.column(2) - &anchors.column(0);
        let heights = &anchors.column(3) - &anchors.column(1);

        let ctr_x = &anchors.column(0) + &widths / 2.0;
        let ctr_y = &anchors.column(1) + &heights / 2.0;

        let (v_center, v_size) = self.variances;

        let dx = rel_codes.column(0).mapv(|x| x * v_center);
        let dy = rel_codes.column(1).mapv(|x| x * v_center);

        // clamp to avoid overflow in exp
        let dw = rel_codes
            .column(2)
            .mapv(|x| (x * v_size).min(self.bbox_xform_clip));
        let dh = rel_codes
            .column(3)
            .mapv(|x| (x * v_size).min(self.bbox_xform_clip));

        let pred_ctr_x = dx * &widths + ctr_x;
        let pred_ctr_y = dy * &heights + ctr_y;

        let pred_w = dw.mapv(f32::exp) * widths;
        let pred_h = dh.mapv(f32::exp) * heights;

        let c_to_c_w = pred_w / 2.0;
        let c_to_c_h = pred_h / 2.0;

        let x1 = &pred_ctr_x - &c_to_c_w;
        let y1 = &pred_ctr_y - &c_to_c_h;
        let x2 = &pred_ctr_x + &c_to_c_w;
        let y2 = &pred_ctr_y + &c_to_c_h;

        stack![Axis(1), x1, y1, x2, y2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(actual: ArrayView2<f32>, expected: ArrayView2<f32>, tolerance: f32) {
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < tolerance, "{a} != {e}");
        }
    }

    #[test]
    fn round_trips_with_unit_variances() {
        let coder = BoxCoder::new((1.0, 1.0)).unwrap();
        let anchors = array![[0.0, 0.0, 10.0, 10.0], [20.0, 5.0, 30.0, 25.0]];
        let matched = array![[1.0, 1.0, 9.0, 9.0], [18.0, 7.0, 33.0, 21.0]];

        let codes = coder.encode(anchors.view(), matched.view()).unwrap();
        let decoded = coder.decode(codes.view(), anchors.view());

        assert_close(decoded.view(), matched.view(), 1e-5);
    }

    #[test]
    fn round_trips_with_ssd_variances() {
        let coder = BoxCoder::new((0.1, 0.2)).unwrap();
        let anchors = array![[0.0, 0.0, 10.0, 10.0], [2.0, 2.0, 6.0, 9.0]];
        let matched = array![[1.0, 1.0, 9.0, 9.0], [0.0, 3.0, 8.0, 10.0]];

        let codes = coder.encode(anchors.view(), matched.view()).unwrap();
        let decoded = coder.decode(codes.view(), anchors.view());

        assert_close(decoded.view(), matched.view(), 1e-4);
    }

    #[test]
    fn encode_matches_manual_offsets() {
        let coder = BoxCoder::new((1.0, 1.0)).unwrap();
        let anchors = array![[0.0, 0.0, 10.0, 10.0]];
        let matched = array![[1.0, 1.0, 9.0, 9.0]];

        let codes = coder.encode(anchors.view(), matched.view()).unwrap();

        // centers coincide, sizes shrink from 10 to 8
        assert!((codes[(0, 0)]).abs() < 1e-6);
        assert!((codes[(0, 1)]).abs() < 1e-6);
        assert!((codes[(0, 2)] - (0.8f32).ln()).abs() < 1e-6);
        assert!((codes[(0, 3)] - (0.8f32).ln()).abs() < 1e-6);
    }

    #[test]
    fn zero_size_anchor_is_a_configuration_error() {
        let coder = BoxCoder::new((1.0, 1.0)).unwrap();
        let anchors = array![[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 5.0, 9.0]];
        let matched = array![[1.0, 1.0, 9.0, 9.0], [1.0, 1.0, 9.0, 9.0]];

        assert!(matches!(
            coder.encode(anchors.view(), matched.view()),
            Err(Error::DegenerateAnchor { index: 1 })
        ));
    }

    #[test]
    fn zero_size_ground_truth_stays_finite() {
        let coder = BoxCoder::new((1.0, 1.0)).unwrap();
        let anchors = array![[0.0, 0.0, 10.0, 10.0]];
        let matched = array![[4.0, 4.0, 4.0, 4.0]];

        let codes = coder.encode(anchors.view(), matched.view()).unwrap();
        assert!(codes.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn decode_clamps_exploding_scales() {
        let coder = BoxCoder::new((1.0, 1.0)).unwrap();
        let anchors = array![[0.0, 0.0, 10.0, 10.0]];
        let codes = array![[0.0, 0.0, 100.0, 100.0]];

        let decoded = coder.decode(codes.view(), anchors.view());
        assert!(decoded.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn zero_variance_is_rejected() {
        assert!(matches!(
            BoxCoder::new((0.0, 0.2)),
            Err(Error::ZeroVariance(..))
        ));
    }
}
