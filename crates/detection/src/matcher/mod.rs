//! Anchor/proposal target assignment.
//!
//! One policy module per detector family. All of them share the IoU
//! geometry, the box codec and the label conventions below; they differ in
//! override order, label semantics and output layout.

use ndarray::{Array1, ArrayView2, Axis};
use rand::Rng;
use rand::seq::index;

pub mod roi;
pub mod rpn;
pub mod ssd;
pub mod yolo;

/// Label value for anchors excluded from sampling and loss.
pub const IGNORE: i32 = -1;
/// Label value for background anchors.
pub const BACKGROUND: i32 = 0;

/// Per-row maximum and argmax of an IoU matrix: the best ground-truth match
/// for every anchor. Empty rows yield `(0.0, 0)`.
pub(crate) fn best_match_per_row(ious: ArrayView2<f32>) -> (Array1<f32>, Vec<usize>) {
    let mut max_ious = Array1::<f32>::zeros(ious.nrows());
    let mut argmax = vec![0; ious.nrows()];

    for (i, row) in ious.axis_iter(Axis(0)).enumerate() {
        for (j, &value) in row.iter().enumerate() {
            if value > max_ious[i] {
                max_ious[i] = value;
                argmax[i] = j;
            }
        }
    }

    (max_ious, argmax)
}

/// Per-column argmax of an IoU matrix: the best anchor for every ground
/// truth. Ties resolve to the lowest anchor index.
pub(crate) fn best_row_per_column(ious: ArrayView2<f32>) -> Vec<usize> {
    let mut argmax = vec![0; ious.ncols()];

    for j in 0..ious.ncols() {
        let mut best = f32::NEG_INFINITY;
        for i in 0..ious.nrows() {
            if ious[(i, j)] > best {
                best = ious[(i, j)];
                argmax[j] = i;
            }
        }
    }

    argmax
}

/// Demote uniformly random anchors labeled `value` to [`IGNORE`] until at
/// most `quota` remain. Demoted anchors never fall back into the negative
/// pool.
pub(crate) fn subsample_label<R: Rng>(
    labels: &mut Array1<i32>,
    value: i32,
    quota: usize,
    rng: &mut R,
) {
    let matching: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter_map(|(i, &label)| (label == value).then_some(i))
        .collect();

    if matching.len() <= quota {
        return;
    }

    let excess = matching.len() - quota;
    for picked in index::sample(rng, matching.len(), excess) {
        labels[matching[picked]] = IGNORE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn row_and_column_maxima() {
        let ious = array![[0.1, 0.7], [0.4, 0.2], [0.3, 0.3]];

        let (max_ious, argmax) = best_match_per_row(ious.view());
        assert_eq!(max_ious.to_vec(), vec![0.7, 0.4, 0.3]);
        assert_eq!(argmax, vec![1, 0, 0]);

        assert_eq!(best_row_per_column(ious.view()), vec![1, 0]);
    }

    #[test]
    fn subsample_respects_quota_and_ignores_excess() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut labels = Array1::from_elem(10, 1);

        subsample_label(&mut labels, 1, 4, &mut rng);

        assert_eq!(labels.iter().filter(|&&l| l == 1).count(), 4);
        assert_eq!(labels.iter().filter(|&&l| l == IGNORE).count(), 6);
        assert_eq!(labels.iter().filter(|&&l| l == BACKGROUND).count(), 0);
    }

    #[test]
    fn subsample_below_quota_is_a_no_op() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut labels = array![1, 0, 1, -1];

        subsample_label(&mut labels, 1, 5, &mut rng);
        assert_eq!(labels.to_vec(), vec![1, 0, 1, -1]);
    }
}
