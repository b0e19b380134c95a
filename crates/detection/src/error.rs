//! See [`Error`].

use miette::Diagnostic;
use thiserror::Error;

/// Error types for this crate.
///
/// Every variant is a configuration or input-shape problem that is detected
/// before any geometry computation runs. Degenerate boxes and empty
/// ground-truth sets are *not* errors; they produce well-defined results.
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("negative IoU threshold ({neg}) must not exceed positive threshold ({pos})")]
    ThresholdOrdering { neg: f32, pos: f32 },

    #[error("positive sample ratio must lie in [0, 1], got {0}")]
    PositiveRatio(f32),

    #[error("suppression overlap threshold must lie in [0, 1], got {0}")]
    OverlapThreshold(f32),

    #[error("decoder needs at least one foreground class")]
    EmptyClassSet,

    #[error("target normalization std must be non-zero")]
    ZeroNormalizationStd,

    #[error("codec variance must be non-zero, got ({0}, {1})")]
    ZeroVariance(f32, f32),

    #[error("anchor {index} has zero width or height, cannot encode against it")]
    DegenerateAnchor { index: usize },

    #[error("got {boxes} ground-truth boxes but {labels} labels")]
    LabelCount { boxes: usize, labels: usize },

    #[error("class id {id} out of range for {num_classes} classes")]
    ClassId { id: usize, num_classes: usize },

    #[error("expected {expected} anchors for the configured grid geometry, got {actual}")]
    AnchorCount { expected: usize, actual: usize },

    #[error("got {strides} feature-map strides but {anchor_lists} anchor-shape lists")]
    ScaleCount { strides: usize, anchor_lists: usize },

    #[error("stride {stride} does not fit input size {width}x{height}")]
    GridGeometry {
        stride: usize,
        width: usize,
        height: usize,
    },

    #[error("prediction rows carry {got} channels, need {needed} for {num_classes} classes")]
    PredictionLayout {
        needed: usize,
        got: usize,
        num_classes: usize,
    },

    #[error("boxes must be Nx4 matrices, got {rows}x{cols}")]
    BoxShape { rows: usize, cols: usize },
}

/// Type alias for [`Result<T, Error>`].
pub type Result<T> = std::result::Result<T, Error>;
