//! Dense pairwise IoU between two sets of corner-form boxes.

use ndarray::{Array2, ArrayView2};

use crate::error::{Error, Result};

/// Union areas below this are treated as empty to avoid dividing by zero.
const UNION_EPS: f32 = 1e-10;

/// Compute the `N x M` IoU matrix between two sets of corner-form boxes.
///
/// Rows index `boxes`, columns index `query_boxes`. Zero-area boxes yield
/// IoU `0.0` against every box, including themselves.
///
/// Both inputs must be `Nx4` / `Mx4` matrices of `(xmin, ymin, xmax, ymax)`
/// rows. The only allocation is the output matrix itself.
pub fn iou_matrix(boxes: ArrayView2<f32>, query_boxes: ArrayView2<f32>) -> Result<Array2<f32>> {
    check_box_shape(boxes)?;
    check_box_shape(query_boxes)?;

    let n = boxes.nrows();
    let m = query_boxes.nrows();
    let mut overlaps = Array2::<f32>::zeros((n, m));

    for j in 0..m {
        let query_area = (query_boxes[(j, 2)] - query_boxes[(j, 0)]).max(0.0)
            * (query_boxes[(j, 3)] - query_boxes[(j, 1)]).max(0.0);

        if query_area <= 0.0 {
            continue;
        }

        for i in 0..n {
            let iw = boxes[(i, 2)].min(query_boxes[(j, 2)]) - boxes[(i, 0)].max(query_boxes[(j, 0)]);
            if iw <= 0.0 {
                continue;
            }

            let ih = boxes[(i, 3)].min(query_boxes[(j, 3)]) - boxes[(i, 1)].max(query_boxes[(j, 1)]);
            if ih <= 0.0 {
                continue;
            }

            let area =
                (boxes[(i, 2)] - boxes[(i, 0)]).max(0.0) * (boxes[(i, 3)] - boxes[(i, 1)]).max(0.0);
            let union = (area + query_area - iw * ih).max(UNION_EPS);

            overlaps[(i, j)] = iw * ih / union;
        }
    }

    Ok(overlaps)
}

pub(crate) fn check_box_shape(boxes: ArrayView2<f32>) -> Result<()> {
    if boxes.ncols() != 4 && boxes.nrows() != 0 {
        return Err(Error::BoxShape {
            rows: boxes.nrows(),
            cols: boxes.ncols(),
        });
    }

    Ok(())
}
