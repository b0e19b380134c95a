//! Target assignment and decoding for anchor-based object detectors.
//!
//! The crate converts between the two representations a detector works with:
//! raw ground-truth boxes and labels on one side, per-anchor regression
//! targets and classification labels on the other. At inference time the
//! [`decoder`] runs the inverse direction, turning dense per-anchor network
//! output into a sparse list of detections via confidence filtering and
//! non-maximum suppression.
//!
//! Four matching policies are supported, one per detector family:
//!
//! - [`matcher::rpn`]: region-proposal anchors (Faster R-CNN first stage)
//! - [`matcher::roi`]: proposal refinement (Faster R-CNN second stage)
//! - [`matcher::ssd`]: single-shot multibox default boxes
//! - [`matcher::yolo`]: per-scale regression grids
//!
//! All policies share the same geometry ([`iou`]), box codec ([`box_coder`])
//! and label conventions (`-1` ignore, `0` background, `1..=C` foreground).

pub mod anchor;
pub mod bbox;
pub mod box_coder;
pub mod decoder;
pub mod error;
pub mod iou;
pub mod matcher;

pub use error::{Error, Result};
