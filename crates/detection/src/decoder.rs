//! Inference-time decoding: dense per-anchor predictions to sparse
//! detections via confidence filtering and per-class greedy NMS.

use itertools::Itertools;
use ndarray::{ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::bbox::{Bbox, ConvertBbox, Xyxy};
use crate::box_coder::BoxCoder;
use crate::error::{Error, Result};

/// Thresholds for [`DetectionDecoder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    /// Number of foreground classes in the score channels.
    pub num_classes: usize,
    /// Candidates with objectness at or below this are dropped.
    pub obj_threshold: f32,
    /// Boxes overlapping a kept detection at or above this are suppressed.
    pub overlap_threshold: f32,
}

impl DecoderConfig {
    /// Reject empty class sets and out-of-range thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::EmptyClassSet);
        }
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(Error::OverlapThreshold(self.overlap_threshold));
        }

        Ok(())
    }
}

/// One surviving box after suppression, in absolute pixel coordinates.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Corner-form box in image pixels.
    pub bbox: Bbox<Xyxy>,
    /// Objectness confidence.
    pub objectness: f32,
    /// Score of the predicted class.
    pub class_score: f32,
    /// 0-based predicted class id.
    pub class_id: usize,
}

/// A candidate box between decoding and suppression.
#[derive(Debug, Clone)]
struct Candidate {
    index: usize,
    detection: Detection,
}

/// Turns raw per-anchor network output into per-image detection lists.
///
/// Prediction rows are `[cx, cy, w, h, objectness, class_0..class_C-1]`,
/// the concatenated multi-scale layout. Images with no surviving candidate
/// simply yield an empty list.
pub struct DetectionDecoder {
    config: DecoderConfig,
}

impl DetectionDecoder {
    /// Create a decoder, validating the configuration.
    pub fn new(config: DecoderConfig) -> Result<Self> {
        config.validate()?;

        Ok(DetectionDecoder { config })
    }

    /// Decode one image of center-form predictions in `[0, 1]` space.
    ///
    /// `image_size` is `(width, height)` in pixels; boxes are de-normalized
    /// with it so detections come out in absolute pixel coordinates.
    pub fn decode(
        &self,
        prediction: ArrayView2<f32>,
        image_size: (f32, f32),
    ) -> Result<Vec<Detection>> {
        let needed = 5 + self.config.num_classes;
        if prediction.nrows() > 0 && prediction.ncols() != needed {
            return Err(Error::PredictionLayout {
                needed,
                got: prediction.ncols(),
                num_classes: self.config.num_classes,
            });
        }

        let candidates = prediction
            .rows()
            .into_iter()
            .enumerate()
            .filter(|(_, row)| row[4] > self.config.obj_threshold)
            .map(|(index, row)| {
                // highest class score wins; ties go to the lower class id
                let (class_id, class_score) = row
                    .iter()
                    .skip(5)
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (id, score)| {
                        if score > best.1 { (id, score) } else { best }
                    });

                let bbox: Bbox<Xyxy> = Bbox::cxcywh(row[0], row[1], row[2], row[3]).convert();
                Candidate {
                    index,
                    detection: Detection {
                        bbox: bbox.scaled(image_size.0, image_size.1),
                        objectness: row[4],
                        class_score,
                        class_id,
                    },
                }
            })
            .collect::<Vec<_>>();

        Ok(self.suppress(candidates))
    }

    /// Decode a whole batch, one prediction matrix per image.
    ///
    /// Shape `[batch, anchors, 5 + C]`. Each image decodes independently;
    /// per-image failures surface as errors without any shared state to
    /// unwind.
    pub fn decode_batch(
        &self,
        prediction: ArrayView3<f32>,
        image_size: (f32, f32),
    ) -> Result<Vec<Vec<Detection>>> {
        prediction
            .outer_iter()
            .map(|image| self.decode(image, image_size))
            .collect()
    }

    /// Decode anchored regression output (SSD / R-CNN heads) for one image.
    ///
    /// `locs` are codec offsets from `anchors` (corner form, in network
    /// input pixels); `scores` rows are `[objectness, class_0..]`. Boxes are
    /// clamped to `input_size` and then rescaled to `image_size`.
    pub fn decode_anchored(
        &self,
        locs: ArrayView2<f32>,
        scores: ArrayView2<f32>,
        anchors: ArrayView2<f32>,
        coder: &BoxCoder,
        input_size: (f32, f32),
        image_size: (f32, f32),
    ) -> Result<Vec<Detection>> {
        let needed = 1 + self.config.num_classes;
        if scores.nrows() > 0 && scores.ncols() != needed {
            return Err(Error::PredictionLayout {
                needed,
                got: scores.ncols(),
                num_classes: self.config.num_classes,
            });
        }
        if locs.nrows() != anchors.nrows() {
            return Err(Error::AnchorCount {
                expected: anchors.nrows(),
                actual: locs.nrows(),
            });
        }

        let boxes = coder.decode(locs, anchors);
        let (scale_w, scale_h) = (image_size.0 / input_size.0, image_size.1 / input_size.1);

        let candidates = boxes
            .rows()
            .into_iter()
            .zip(scores.rows())
            .enumerate()
            .filter(|(_, (_, score))| score[0] > self.config.obj_threshold)
            .map(|(index, (bbox, score))| {
                let (class_id, class_score) = score
                    .iter()
                    .skip(1)
                    .copied()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (id, s)| {
                        if s > best.1 { (id, s) } else { best }
                    });

                let bbox = Bbox::xyxy(bbox[0], bbox[1], bbox[2], bbox[3])
                    .clamp(input_size.0, input_size.1)
                    .scaled(scale_w, scale_h);

                Candidate {
                    index,
                    detection: Detection {
                        bbox,
                        objectness: score[0],
                        class_score,
                        class_id,
                    },
                }
            })
            .collect::<Vec<_>>();

        Ok(self.suppress(candidates))
    }

    /// Per-class greedy suppression.
    ///
    /// Within a class candidates sort by descending objectness, ties broken
    /// by original index, and the highest survivor repeatedly suppresses
    /// everything overlapping it at or above the threshold. The loop is
    /// inherently sequential: removal order decides which boxes survive
    /// when scores tie.
    fn suppress(&self, candidates: Vec<Candidate>) -> Vec<Detection> {
        let mut kept = Vec::new();

        for (class_id, group) in &candidates
            .into_iter()
            .sorted_by(|a, b| {
                a.detection
                    .class_id
                    .cmp(&b.detection.class_id)
                    .then(b.detection.objectness.total_cmp(&a.detection.objectness))
                    .then(a.index.cmp(&b.index))
            })
            .chunk_by(|c| c.detection.class_id)
        {
            let mut remaining: Vec<Candidate> = group.collect();
            let before = remaining.len();

            while let Some(best) = remaining.first().cloned() {
                remaining.remove(0);
                remaining.retain(|other| {
                    best.detection.bbox.iou(&other.detection.bbox) < self.config.overlap_threshold
                });
                kept.push(best.detection);
            }

            trace!(
                class = class_id,
                candidates = before,
                kept = kept.len(),
                "nms"
            );
        }

        kept
    }
}
