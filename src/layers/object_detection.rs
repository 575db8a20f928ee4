//! Object detection layers.
//!
//! `NonMaxSuppression` is the one layer whose execution runs directly over
//! raw tensor data instead of dispatching to the backend: maintaining the
//! per-class selection list is scalar bookkeeping, not bulk math.

use parten_tensor::Tensor;

use crate::backend::{Backend, RoiAlignMode};
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

/// A box retained by non-max suppression, with coordinates normalized to
/// top/left/bottom/right order.
#[derive(Copy, Clone, Debug)]
struct NmsBox {
    tlbr: [f32; 4],

    /// Index of this box within its image.
    index: usize,

    score: f32,
}

fn box_area(tlbr: [f32; 4]) -> f32 {
    let [top, left, bottom, right] = tlbr;
    (bottom - top).max(0.) * (right - left).max(0.)
}

impl NmsBox {
    fn from_coords(coords: [f32; 4], center_point_box: bool, index: usize, score: f32) -> NmsBox {
        let tlbr = if center_point_box {
            let [x, y, w, h] = coords;
            [y - h / 2., x - w / 2., y + h / 2., x + w / 2.]
        } else {
            // Corner pairs may be listed in either order.
            let [y1, x1, y2, x2] = coords;
            [y1.min(y2), x1.min(x2), y1.max(y2), x1.max(x2)]
        };
        NmsBox { tlbr, index, score }
    }

    /// Return the Intersection-over-Union score of this box and `other`.
    fn iou(&self, other: &NmsBox) -> f32 {
        let [top, left, bottom, right] = self.tlbr;
        let [other_top, other_left, other_bottom, other_right] = other.tlbr;
        let intersection = box_area([
            top.max(other_top),
            left.max(other_left),
            bottom.min(other_bottom),
            right.min(other_right),
        ]);
        let union = box_area(self.tlbr) + box_area(other.tlbr) - intersection;
        if union > 0. {
            intersection / union
        } else {
            0.
        }
    }
}

/// The number of selected boxes is data dependent, so only the column count
/// of the output is known ahead of execution.
pub(crate) fn infer_nms(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let boxes = inputs.require(0)?.shape().declare_rank(3)?;
    let scores = inputs.require(1)?.shape().declare_rank(3)?;
    boxes.dim(0).unify(&scores.dim(0))?;
    boxes.dim(1).unify(&scores.dim(2))?;
    boxes.dim(2).unify(&4.into())?;
    Ok(PartialTensor::new(
        DataType::Int,
        SymShape::from_dims(vec![SymDim::Unknown, 3.into()]),
    ))
}

/// Select boxes per (batch, class) pair, dropping candidates that overlap an
/// already-selected box with a higher score and evicting selected boxes that
/// overlap a candidate scoring at least as much.
pub(crate) fn execute_nms(center_point_box: bool, inputs: &Inputs) -> Result<Value, LayerError> {
    let boxes = inputs.require_float(0)?;
    let scores = inputs.require_float(1)?;
    let max_per_class = inputs.get_scalar_int(2)?.unwrap_or(0);
    let iou_threshold = inputs.get_scalar_float(3)?.unwrap_or(0.);
    let score_threshold = inputs.get_scalar_float(4)?.unwrap_or(0.);

    if boxes.ndim() != 3 {
        return Err(LayerError::RankMismatch {
            expected: 3,
            actual: boxes.ndim(),
        });
    }
    if scores.ndim() != 3 {
        return Err(LayerError::RankMismatch {
            expected: 3,
            actual: scores.ndim(),
        });
    }
    if boxes.size(2) != 4 {
        return Err(LayerError::ValueError(
            "boxes must have four coordinates per box",
        ));
    }
    let (batch, n_boxes) = (boxes.size(0), boxes.size(1));
    if scores.size(0) != batch || scores.size(2) != n_boxes {
        return Err(LayerError::ShapeMismatch(
            "boxes and scores have incompatible shapes",
        ));
    }
    if max_per_class < 0 {
        return Err(LayerError::ValueError(
            "max output boxes per class must be >= 0",
        ));
    }
    let max_per_class = max_per_class as usize;
    let n_classes = scores.size(1);

    let mut triples: Vec<i32> = Vec::new();
    for n in 0..batch {
        for c in 0..n_classes {
            // Sorted by descending score and capped at `max_per_class`.
            let mut selected: Vec<NmsBox> = Vec::new();
            for b in 0..n_boxes {
                let score = scores[[n, c, b]];
                if score < score_threshold {
                    continue;
                }
                let coords = [
                    boxes[[n, b, 0]],
                    boxes[[n, b, 1]],
                    boxes[[n, b, 2]],
                    boxes[[n, b, 3]],
                ];
                let candidate = NmsBox::from_coords(coords, center_point_box, b, score);

                // The list is sorted, so a higher-scored overlap is met
                // before any box the candidate could evict.
                let mut keep = true;
                let mut i = 0;
                while i < selected.len() {
                    let other = &selected[i];
                    if candidate.iou(other) > iou_threshold {
                        if other.score > candidate.score {
                            keep = false;
                            break;
                        }
                        selected.remove(i);
                    } else {
                        i += 1;
                    }
                }
                if keep {
                    let at = selected.partition_point(|other| other.score >= candidate.score);
                    selected.insert(at, candidate);
                    selected.truncate(max_per_class);
                }
            }
            for nms_box in &selected {
                triples.extend([n as i32, c as i32, nms_box.index as i32]);
            }
        }
    }

    let n_selected = triples.len() / 3;
    Ok(Tensor::from_data(&[n_selected, 3], triples).into())
}

/// Parameters for the `RoiAlign` layer.
#[derive(Clone, Debug, PartialEq)]
pub struct RoiAlign {
    pub mode: RoiAlignMode,
    pub output_height: usize,
    pub output_width: usize,
    /// Samples per bin along each axis, or zero to derive the count from
    /// the bin size.
    pub sampling_ratio: usize,
    /// Scale mapping box coordinates onto the feature map.
    pub spatial_scale: f32,
}

impl Default for RoiAlign {
    fn default() -> RoiAlign {
        RoiAlign {
            mode: RoiAlignMode::Avg,
            output_height: 1,
            output_width: 1,
            sampling_ratio: 0,
            spatial_scale: 1.,
        }
    }
}

pub(crate) fn infer_roi_align(
    params: &RoiAlign,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?.shape().declare_rank(4)?;
    let rois = inputs.require(1)?.shape().declare_rank(2)?;
    let indices = inputs.require(2)?.shape().declare_rank(1)?;
    rois.dim(1).unify(&4.into())?;
    let n_rois = rois.dim(0).unify(&indices.dim(0))?;
    Ok(PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(vec![
            n_rois,
            x.dim(1),
            params.output_height.into(),
            params.output_width.into(),
        ]),
    ))
}

pub(crate) fn execute_roi_align(
    params: &RoiAlign,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    let rois = inputs.require_float(1)?;
    let batch_indices = inputs.require_int(2)?;

    if x.ndim() != 4 {
        return Err(LayerError::RankMismatch {
            expected: 4,
            actual: x.ndim(),
        });
    }
    if rois.ndim() != 2 || rois.size(1) != 4 {
        return Err(LayerError::ValueError(
            "rois must have four coordinates per region",
        ));
    }
    if batch_indices.shape() != [rois.size(0)] {
        return Err(LayerError::ShapeMismatch(
            "batch indices must match the region count",
        ));
    }
    let batch = x.size(0) as i32;
    if batch_indices.iter().any(|&index| index < 0 || index >= batch) {
        return Err(LayerError::ValueError("roi batch index is out of range"));
    }
    if params.output_height == 0 || params.output_width == 0 {
        return Err(LayerError::ValueError(
            "roi align output size must be positive",
        ));
    }

    Ok(backend
        .roi_align(
            x,
            rois,
            batch_indices,
            params.mode,
            (params.output_height, params.output_width),
            params.sampling_ratio,
            params.spatial_scale,
        )
        .into())
}

#[cfg(test)]
mod tests {
    use parten_tensor::test_util::expect_equal;
    use parten_tensor::Tensor;

    use super::RoiAlign;
    use crate::backend::RoiAlignMode;
    use crate::error::LayerError;
    use crate::layer::LayerKind;
    use crate::layers::test_support::{execute, infer};
    use crate::partial::PartialTensor;
    use crate::shape::SymShape;
    use crate::value::{DataType, Value};

    fn floats(shape: &[usize], data: &[f32]) -> Value {
        Value::from(Tensor::from_data(shape, data.to_vec()))
    }

    fn nms(
        boxes: &Value,
        scores: &Value,
        max_per_class: i32,
        iou_threshold: f32,
        score_threshold: f32,
    ) -> Result<Value, LayerError> {
        let max_per_class = Value::from(Tensor::scalar(max_per_class));
        let iou_threshold = Value::from(Tensor::scalar(iou_threshold));
        let score_threshold = Value::from(Tensor::scalar(score_threshold));
        execute(
            LayerKind::NonMaxSuppression {
                center_point_box: false,
            },
            &[
                Some(boxes),
                Some(scores),
                Some(&max_per_class),
                Some(&iou_threshold),
                Some(&score_threshold),
            ],
        )
    }

    #[test]
    fn test_nms_suppresses_overlaps() {
        // Boxes 0 and 1 overlap with IoU 0.9 / 1.1; box 2 is separate.
        let boxes = floats(
            &[1, 3, 4],
            &[0., 0., 1., 1., 0., 0.1, 1., 1.1, 0., 5., 1., 6.],
        );
        let scores = floats(&[1, 1, 3], &[0.9, 0.8, 0.5]);

        let selected = nms(&boxes, &scores, 10, 0.5, 0.).unwrap();

        let expected = Tensor::from_data(&[2, 3], vec![0, 0, 0, 0, 0, 2]);
        expect_equal(selected.as_int().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_nms_later_candidate_evicts_lower_scored() {
        let boxes = floats(&[1, 2, 4], &[0., 0., 1., 1., 0., 0.1, 1., 1.1]);
        let scores = floats(&[1, 1, 2], &[0.8, 0.9]);

        let selected = nms(&boxes, &scores, 10, 0.5, 0.).unwrap();

        let expected = Tensor::from_data(&[1, 3], vec![0, 0, 1]);
        expect_equal(selected.as_int().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_nms_classes_are_independent() {
        let boxes = floats(&[1, 2, 4], &[0., 0., 1., 1., 0., 0.1, 1., 1.1]);
        let scores = floats(&[1, 2, 2], &[0.9, 0.8, 0.1, 0.7]);

        let selected = nms(&boxes, &scores, 10, 0.5, 0.).unwrap();

        // Class 0 keeps box 0; in class 1 the same overlap resolves the
        // other way around.
        let expected = Tensor::from_data(&[2, 3], vec![0, 0, 0, 0, 1, 1]);
        expect_equal(selected.as_int().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_nms_score_threshold_and_order() {
        // Three separated boxes, reported in descending score order.
        let boxes = floats(
            &[1, 3, 4],
            &[0., 0., 1., 1., 0., 5., 1., 6., 0., 10., 1., 11.],
        );
        let scores = floats(&[1, 1, 3], &[0.2, 0.9, 0.05]);

        let selected = nms(&boxes, &scores, 10, 0.5, 0.1).unwrap();

        let expected = Tensor::from_data(&[2, 3], vec![0, 0, 1, 0, 0, 0]);
        expect_equal(selected.as_int().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_nms_max_outputs_per_class() {
        let boxes = floats(
            &[1, 3, 4],
            &[0., 0., 1., 1., 0., 5., 1., 6., 0., 10., 1., 11.],
        );
        let scores = floats(&[1, 1, 3], &[0.2, 0.9, 0.4]);

        let selected = nms(&boxes, &scores, 2, 0.5, 0.).unwrap();
        let expected = Tensor::from_data(&[2, 3], vec![0, 0, 1, 0, 0, 2]);
        expect_equal(selected.as_int().unwrap(), &expected).unwrap();

        // The cap defaults to zero, which selects nothing.
        let iou_threshold = Value::from(Tensor::scalar(0.5f32));
        let selected = execute(
            LayerKind::NonMaxSuppression {
                center_point_box: false,
            },
            &[Some(&boxes), Some(&scores), None, Some(&iou_threshold)],
        )
        .unwrap();
        assert_eq!(selected.shape(), [0, 3]);
    }

    #[test]
    fn test_nms_center_point_boxes() {
        // The boxes from test_nms_suppresses_overlaps in center+size form.
        let boxes = floats(
            &[1, 3, 4],
            &[0.5, 0.5, 1., 1., 0.6, 0.5, 1., 1., 5.5, 0.5, 1., 1.],
        );
        let scores = floats(&[1, 1, 3], &[0.9, 0.8, 0.5]);
        let max_per_class = Value::from(Tensor::scalar(10i32));
        let iou_threshold = Value::from(Tensor::scalar(0.5f32));

        let selected = execute(
            LayerKind::NonMaxSuppression {
                center_point_box: true,
            },
            &[
                Some(&boxes),
                Some(&scores),
                Some(&max_per_class),
                Some(&iou_threshold),
            ],
        )
        .unwrap();

        let expected = Tensor::from_data(&[2, 3], vec![0, 0, 0, 0, 0, 2]);
        expect_equal(selected.as_int().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_nms_unordered_corners() {
        // The first box has its corners flipped; it still overlaps box 1.
        let boxes = floats(&[1, 2, 4], &[1., 1., 0., 0., 0., 0.1, 1., 1.1]);
        let scores = floats(&[1, 1, 2], &[0.9, 0.8]);

        let selected = nms(&boxes, &scores, 10, 0.5, 0.).unwrap();

        let expected = Tensor::from_data(&[1, 3], vec![0, 0, 0]);
        expect_equal(selected.as_int().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_nms_errors() {
        let boxes = floats(&[1, 2, 3], &[0.; 6]);
        let scores = floats(&[1, 1, 2], &[0.; 2]);
        let result = nms(&boxes, &scores, 10, 0.5, 0.);
        assert_eq!(
            result.unwrap_err(),
            LayerError::ValueError("boxes must have four coordinates per box")
        );

        let boxes = floats(&[1, 2, 4], &[0.; 8]);
        let scores = floats(&[1, 1, 3], &[0.; 3]);
        let result = nms(&boxes, &scores, 10, 0.5, 0.);
        assert_eq!(
            result.unwrap_err(),
            LayerError::ShapeMismatch("boxes and scores have incompatible shapes")
        );
    }

    #[test]
    fn test_infer_nms() {
        let boxes = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), "boxes".into(), 4.into()]),
        );
        let scores = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 80.into(), "boxes".into()]),
        );
        let kind = || LayerKind::NonMaxSuppression {
            center_point_box: false,
        };

        let out = infer(kind(), &[Some(&boxes), Some(&scores)]).unwrap();
        assert_eq!(out.dtype(), DataType::Int);
        assert_eq!(out.shape().to_string(), "[?, 3]");

        // Box counts that provably disagree are rejected.
        let boxes = PartialTensor::new(DataType::Float, SymShape::fixed(&[1, 9, 4]));
        let scores = PartialTensor::new(DataType::Float, SymShape::fixed(&[1, 80, 10]));
        let result = infer(kind(), &[Some(&boxes), Some(&scores)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_roi_align_identity_bins() {
        // With one sample per bin and a region covering the whole 2x2 input,
        // the half-pixel sampling grid lands exactly on the pixel centers.
        let x = floats(&[1, 1, 2, 2], &[1., 2., 3., 4.]);
        let rois = floats(&[1, 4], &[0., 0., 2., 2.]);
        let batch_indices = Value::from(Tensor::from_data(&[1], vec![0i32]));

        let result = execute(
            LayerKind::RoiAlign(RoiAlign {
                mode: RoiAlignMode::Avg,
                output_height: 2,
                output_width: 2,
                sampling_ratio: 1,
                spatial_scale: 1.,
            }),
            &[Some(&x), Some(&rois), Some(&batch_indices)],
        )
        .unwrap();

        let expected = Tensor::from_data(&[1, 1, 2, 2], vec![1., 2., 3., 4.]);
        expect_equal(result.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_roi_align_max_mode() {
        let x = floats(&[1, 1, 2, 2], &[1., 2., 3., 4.]);
        let rois = floats(&[1, 4], &[0., 0., 2., 2.]);
        let batch_indices = Value::from(Tensor::from_data(&[1], vec![0i32]));

        let result = execute(
            LayerKind::RoiAlign(RoiAlign {
                mode: RoiAlignMode::Max,
                output_height: 1,
                output_width: 1,
                sampling_ratio: 2,
                spatial_scale: 1.,
            }),
            &[Some(&x), Some(&rois), Some(&batch_indices)],
        )
        .unwrap();

        let expected = Tensor::from_data(&[1, 1, 1, 1], vec![4.]);
        expect_equal(result.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_roi_align_spatial_scale() {
        // Box coordinates are given at half resolution; sampling_ratio 0
        // derives two samples per bin from the 2x2 bin size.
        let x = floats(
            &[1, 1, 4, 4],
            &(1..=16).map(|v| v as f32).collect::<Vec<_>>(),
        );
        let rois = floats(&[1, 4], &[0., 0., 2., 2.]);
        let batch_indices = Value::from(Tensor::from_data(&[1], vec![0i32]));

        let result = execute(
            LayerKind::RoiAlign(RoiAlign {
                mode: RoiAlignMode::Avg,
                output_height: 2,
                output_width: 2,
                sampling_ratio: 0,
                spatial_scale: 2.,
            }),
            &[Some(&x), Some(&rois), Some(&batch_indices)],
        )
        .unwrap();

        let expected = Tensor::from_data(&[1, 1, 2, 2], vec![3.5, 5.5, 11.5, 13.5]);
        expect_equal(result.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_roi_align_errors() {
        let x = floats(&[1, 1, 2, 2], &[0.; 4]);
        let rois = floats(&[1, 4], &[0., 0., 1., 1.]);
        let out_of_range = Value::from(Tensor::from_data(&[1], vec![3i32]));

        let result = execute(
            LayerKind::RoiAlign(RoiAlign::default()),
            &[Some(&x), Some(&rois), Some(&out_of_range)],
        );
        assert_eq!(
            result.unwrap_err(),
            LayerError::ValueError("roi batch index is out of range")
        );

        let batch_indices = Value::from(Tensor::from_data(&[2], vec![0i32, 0]));
        let result = execute(
            LayerKind::RoiAlign(RoiAlign::default()),
            &[Some(&x), Some(&rois), Some(&batch_indices)],
        );
        assert_eq!(
            result.unwrap_err(),
            LayerError::ShapeMismatch("batch indices must match the region count")
        );
    }

    #[test]
    fn test_infer_roi_align() {
        let x = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 256.into(), "h".into(), "w".into()]),
        );
        let rois = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["rois".into(), 4.into()]),
        );
        let indices = PartialTensor::new(
            DataType::Int,
            SymShape::from_dims(vec!["rois".into()]),
        );

        let out = infer(
            LayerKind::RoiAlign(RoiAlign {
                mode: RoiAlignMode::Avg,
                output_height: 7,
                output_width: 7,
                sampling_ratio: 2,
                spatial_scale: 0.25,
            }),
            &[Some(&x), Some(&rois), Some(&indices)],
        )
        .unwrap();

        assert_eq!(out.dtype(), DataType::Float);
        assert_eq!(out.shape().to_string(), "[rois, 256, 7, 7]");
    }
}
