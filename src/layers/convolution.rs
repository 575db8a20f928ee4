//! Convolution layers.
//!
//! Inputs are laid out `[batch, channels, spatial...]` and weights
//! `[out_c, in_c / groups, kernel...]` for `Conv`, or
//! `[in_c, out_c / groups, kernel...]` for `ConvTranspose`. Any number of
//! spatial dimensions is supported.

use parten_tensor::Tensor;

use crate::backend::Backend;
use crate::dim::{AutoPad, SymDim};
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

use super::{defaulted, pooled_out_size, positive, resolve_window_pads, split_pads};

/// Parameters for the `Conv` layer.
///
/// Empty `strides` and `dilations` mean all ones, and empty `pads` means no
/// padding. Explicit `pads` are laid out `[starts..., ends...]` and only
/// apply with [`AutoPad::NotSet`].
#[derive(Clone, Debug, PartialEq)]
pub struct Conv {
    pub groups: usize,
    pub strides: Vec<usize>,
    pub pads: Vec<usize>,
    pub dilations: Vec<usize>,
    pub auto_pad: AutoPad,
}

impl Default for Conv {
    fn default() -> Conv {
        Conv {
            groups: 1,
            strides: Vec::new(),
            pads: Vec::new(),
            dilations: Vec::new(),
            auto_pad: AutoPad::NotSet,
        }
    }
}

/// Parameters for the `ConvTranspose` layer.
#[derive(Clone, Debug, PartialEq)]
pub struct ConvTranspose {
    pub groups: usize,
    pub strides: Vec<usize>,
    pub pads: Vec<usize>,
    pub dilations: Vec<usize>,
    pub output_padding: Vec<usize>,
    pub auto_pad: AutoPad,
}

impl Default for ConvTranspose {
    fn default() -> ConvTranspose {
        ConvTranspose {
            groups: 1,
            strides: Vec::new(),
            pads: Vec::new(),
            dilations: Vec::new(),
            output_padding: Vec::new(),
            auto_pad: AutoPad::NotSet,
        }
    }
}

/// Unify the ranks of the input and weight shapes. If neither rank is known
/// the result is `None`.
fn unify_ranks(
    x: &SymShape,
    w: &SymShape,
) -> Result<Option<(SymShape, SymShape)>, LayerError> {
    match (x.rank(), w.rank()) {
        (None, None) => Ok(None),
        (_, Some(rank)) => Ok(Some((x.declare_rank(rank)?, w.clone()))),
        (Some(rank), None) => Ok(Some((x.clone(), w.declare_rank(rank)?))),
    }
}

/// Total `[start + end]` padding per spatial dim from an explicit pads
/// attribute.
fn total_pads(pads: &[usize], spatial: usize) -> Result<Vec<i32>, LayerError> {
    Ok(split_pads(pads, spatial)?
        .iter()
        .map(|&(start, end)| (start + end) as i32)
        .collect())
}

pub(crate) fn infer_conv(
    params: &Conv,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let w = inputs.require(1)?;
    if params.groups == 0 {
        return Err(LayerError::ValueError("conv groups must be positive"));
    }
    let Some((x_shape, w_shape)) = unify_ranks(x.shape(), w.shape())? else {
        return Ok(PartialTensor::unknown(DataType::Float));
    };
    let rank = x_shape.rank().unwrap_or(0);
    if rank < 3 {
        return Err(LayerError::ValueError(
            "conv expects an input with at least 3 dimensions",
        ));
    }
    let spatial = rank - 2;
    let strides = defaulted(&params.strides, spatial, 1)?;
    let dilations = defaulted(&params.dilations, spatial, 1)?;
    positive(&strides, "conv strides must be positive")?;
    positive(&dilations, "conv dilations must be positive")?;
    let pads = total_pads(&params.pads, spatial)?;

    // The channel dim must match the weights times the group count.
    if let (Some(x_c), Some(w_c)) = (x_shape.dim(1).as_value(), w_shape.dim(1).as_value()) {
        if x_c as usize != w_c as usize * params.groups {
            return Err(LayerError::ShapeMismatch(
                "conv input channels do not match the weights",
            ));
        }
    }

    // The bias, when present, can pin down an unknown output channel count.
    let mut out_c = w_shape.dim(0);
    if let Some(bias) = inputs.get(2) {
        let bias_shape = bias.shape().declare_rank(1)?;
        out_c = out_c.max_defined(&bias_shape.dim(0));
    }

    let mut dims = vec![x_shape.dim(0), out_c];
    for i in 0..spatial {
        let dim = match w_shape.dim(2 + i).as_value() {
            Some(kernel) => x_shape.dim(2 + i).pool(
                kernel,
                strides[i] as i32,
                pads[i],
                dilations[i] as i32,
                false,
                params.auto_pad,
            ),
            None => SymDim::Unknown,
        };
        dims.push(dim);
    }
    Ok(PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(dims),
    ))
}

pub(crate) fn infer_conv_transpose(
    params: &ConvTranspose,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let w = inputs.require(1)?;
    if params.groups == 0 {
        return Err(LayerError::ValueError("conv groups must be positive"));
    }
    let Some((x_shape, w_shape)) = unify_ranks(x.shape(), w.shape())? else {
        return Ok(PartialTensor::unknown(DataType::Float));
    };
    let rank = x_shape.rank().unwrap_or(0);
    if rank < 3 {
        return Err(LayerError::ValueError(
            "conv expects an input with at least 3 dimensions",
        ));
    }
    let spatial = rank - 2;
    let strides = defaulted(&params.strides, spatial, 1)?;
    let dilations = defaulted(&params.dilations, spatial, 1)?;
    positive(&strides, "conv strides must be positive")?;
    positive(&dilations, "conv dilations must be positive")?;
    let output_padding = defaulted(&params.output_padding, spatial, 0)?;
    let pads = total_pads(&params.pads, spatial)?;

    if let (Some(x_c), Some(w_c)) = (x_shape.dim(1).as_value(), w_shape.dim(0).as_value()) {
        if x_c != w_c {
            return Err(LayerError::ShapeMismatch(
                "conv input channels do not match the weights",
            ));
        }
    }

    let mut out_c = w_shape.dim(1) * SymDim::Value(params.groups as i32);
    if let Some(bias) = inputs.get(2) {
        let bias_shape = bias.shape().declare_rank(1)?;
        out_c = out_c.max_defined(&bias_shape.dim(0));
    }

    let mut dims = vec![x_shape.dim(0), out_c];
    for i in 0..spatial {
        let dim = match w_shape.dim(2 + i).as_value() {
            Some(kernel) => x_shape.dim(2 + i).unpool(
                kernel,
                strides[i] as i32,
                pads[i],
                dilations[i] as i32,
                output_padding[i] as i32,
                params.auto_pad,
            ),
            None => SymDim::Unknown,
        };
        dims.push(dim);
    }
    Ok(PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(dims),
    ))
}

/// Validate the tensors shared by both convolution directions and return
/// `(x, w, bias, spatial_rank)`.
fn check_conv_inputs<'a>(
    groups: usize,
    inputs: &Inputs<'a>,
) -> Result<
    (
        &'a Tensor<f32>,
        &'a Tensor<f32>,
        Option<&'a Tensor<f32>>,
        usize,
    ),
    LayerError,
> {
    let x = inputs.require_float(0)?;
    let w = inputs.require_float(1)?;
    let bias = inputs.get_float(2)?;
    if groups == 0 {
        return Err(LayerError::ValueError("conv groups must be positive"));
    }
    if x.ndim() < 3 {
        return Err(LayerError::ValueError(
            "conv expects an input with at least 3 dimensions",
        ));
    }
    if w.ndim() != x.ndim() {
        return Err(LayerError::RankMismatch {
            expected: x.ndim(),
            actual: w.ndim(),
        });
    }
    if let Some(bias) = bias {
        if bias.ndim() != 1 {
            return Err(LayerError::RankMismatch {
                expected: 1,
                actual: bias.ndim(),
            });
        }
    }
    Ok((x, w, bias, x.ndim() - 2))
}

pub(crate) fn execute_conv(
    params: &Conv,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let (x, w, bias, spatial) = check_conv_inputs(params.groups, inputs)?;
    let strides = defaulted(&params.strides, spatial, 1)?;
    let dilations = defaulted(&params.dilations, spatial, 1)?;
    positive(&strides, "conv strides must be positive")?;
    positive(&dilations, "conv dilations must be positive")?;
    let in_dims = &x.shape()[2..];
    let kernel = &w.shape()[2..];
    let windows: Vec<usize> = kernel
        .iter()
        .zip(&dilations)
        .map(|(&k, &d)| d * (k - 1) + 1)
        .collect();
    let pads = resolve_window_pads(params.auto_pad, &params.pads, in_dims, &windows, &strides)?;

    let out_c = w.size(0);
    if out_c % params.groups != 0 {
        return Err(LayerError::ValueError(
            "conv output channels must be divisible by the group count",
        ));
    }
    if x.size(1) != w.size(1) * params.groups {
        return Err(LayerError::ShapeMismatch(
            "conv input channels do not match the weights",
        ));
    }
    if let Some(bias) = bias {
        if bias.size(0) != out_c {
            return Err(LayerError::ShapeMismatch(
                "conv bias length must match the output channels",
            ));
        }
    }

    let mut out_shape = vec![x.size(0), out_c];
    for i in 0..spatial {
        out_shape.push(pooled_out_size(
            in_dims[i],
            kernel[i],
            strides[i],
            pads[i].0 + pads[i].1,
            dilations[i],
            false,
        )?);
    }
    Ok(backend
        .conv(
            x,
            w,
            bias,
            params.groups,
            &strides,
            &pads,
            &dilations,
            &out_shape,
        )
        .into())
}

pub(crate) fn execute_conv_transpose(
    params: &ConvTranspose,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let (x, w, bias, spatial) = check_conv_inputs(params.groups, inputs)?;
    let strides = defaulted(&params.strides, spatial, 1)?;
    let dilations = defaulted(&params.dilations, spatial, 1)?;
    positive(&strides, "conv strides must be positive")?;
    positive(&dilations, "conv dilations must be positive")?;
    let output_padding = defaulted(&params.output_padding, spatial, 0)?;
    let in_dims = &x.shape()[2..];
    let kernel = &w.shape()[2..];
    let windows: Vec<usize> = kernel
        .iter()
        .zip(&dilations)
        .map(|(&k, &d)| d * (k - 1) + 1)
        .collect();

    // For the same-pad policies the output is `in * stride` and the pads are
    // derived from that, mirroring the symbolic arithmetic.
    let pads = match params.auto_pad {
        AutoPad::NotSet => split_pads(&params.pads, spatial)?,
        AutoPad::Valid => vec![(0, 0); spatial],
        AutoPad::SameUpper | AutoPad::SameLower => (0..spatial)
            .map(|i| {
                let total = (windows[i] + output_padding[i]).saturating_sub(strides[i]);
                let smaller = total / 2;
                let larger = total - smaller;
                if params.auto_pad == AutoPad::SameUpper {
                    (smaller, larger)
                } else {
                    (larger, smaller)
                }
            })
            .collect(),
    };

    if x.size(1) != w.size(0) {
        return Err(LayerError::ShapeMismatch(
            "conv input channels do not match the weights",
        ));
    }
    if x.size(1) % params.groups != 0 {
        return Err(LayerError::ValueError(
            "conv input channels must be divisible by the group count",
        ));
    }
    let out_c = w.size(1) * params.groups;
    if let Some(bias) = bias {
        if bias.size(0) != out_c {
            return Err(LayerError::ShapeMismatch(
                "conv bias length must match the output channels",
            ));
        }
    }

    let mut out_shape = vec![x.size(0), out_c];
    for i in 0..spatial {
        let out = (in_dims[i] as i32 - 1) * strides[i] as i32 + output_padding[i] as i32
            + windows[i] as i32
            - (pads[i].0 + pads[i].1) as i32;
        if out < 0 {
            return Err(LayerError::ValueError(
                "padding is larger than the transposed convolution output",
            ));
        }
        out_shape.push(out as usize);
    }
    Ok(backend
        .conv_transpose(
            x,
            w,
            bias,
            params.groups,
            &strides,
            &pads,
            &dilations,
            &out_shape,
        )
        .into())
}

#[cfg(test)]
mod tests {
    use parten_tensor::test_util::expect_equal;
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use super::{Conv, ConvTranspose};
    use crate::dim::{AutoPad, SymDim};
    use crate::error::LayerError;
    use crate::layer::LayerKind;
    use crate::layers::test_support::{execute, infer};
    use crate::partial::PartialTensor;
    use crate::shape::SymShape;
    use crate::value::{DataType, Value};

    fn floats(shape: &[usize], data: &[f32]) -> Value {
        Value::from(Tensor::from_data(shape, data.to_vec()))
    }

    #[test]
    fn test_conv_1d() {
        let x = floats(&[1, 1, 5], &[1., 2., 3., 4., 5.]);
        let w = floats(&[1, 1, 3], &[1., 0., -1.]);
        let out = execute(
            LayerKind::Conv(Conv::default()),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 3], vec![-2., -2., -2.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();

        let bias = floats(&[1], &[10.]);
        let out = execute(
            LayerKind::Conv(Conv::default()),
            &[Some(&x), Some(&w), Some(&bias)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 3], vec![8., 8., 8.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_1x1() {
        // A pointwise kernel mixes channels without touching the spatial
        // layout.
        let x = floats(&[1, 2, 2, 2], &[1., 2., 3., 4., 5., 6., 7., 8.]);
        let w = floats(&[1, 2, 1, 1], &[0.5, 0.5]);
        let out = execute(LayerKind::Conv(Conv::default()), &[Some(&x), Some(&w)]).unwrap();
        let expected = Tensor::from_data(&[1, 1, 2, 2], vec![3., 4., 5., 6.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_strides_and_pads() {
        // Output size follows (in + pads - window) / stride + 1.
        let x = floats(&[1, 1, 10], &[1., 2., 3., 4., 5., 6., 7., 8., 9., 10.]);
        let w = floats(&[1, 1, 3], &[1., 1., 1.]);
        let out = execute(
            LayerKind::Conv(Conv {
                strides: vec![2],
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 4], vec![6., 12., 18., 24.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();

        let x = floats(&[1, 1, 3], &[1., 2., 3.]);
        let out = execute(
            LayerKind::Conv(Conv {
                pads: vec![1, 1],
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 3], vec![3., 6., 5.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_same_pad() {
        let x = floats(&[1, 1, 4], &[1., 2., 3., 4.]);
        let w = floats(&[1, 1, 3], &[1., 1., 1.]);
        let out = execute(
            LayerKind::Conv(Conv {
                auto_pad: AutoPad::SameUpper,
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        // One zero on each side: [0 1 2 3 4 0].
        let expected = Tensor::from_data(&[1, 1, 4], vec![3., 6., 9., 7.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_groups() {
        let x = floats(&[1, 2, 3], &[1., 2., 3., 4., 5., 6.]);
        let w = floats(&[2, 1, 1], &[2., 3.]);
        let out = execute(
            LayerKind::Conv(Conv {
                groups: 2,
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 2, 3], vec![2., 4., 6., 12., 15., 18.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_dilation() {
        // Window extent is dilation * (k - 1) + 1.
        let x = floats(&[1, 1, 5], &[1., 2., 3., 4., 5.]);
        let w = floats(&[1, 1, 2], &[1., 1.]);
        let out = execute(
            LayerKind::Conv(Conv {
                dilations: vec![2],
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 3], vec![4., 6., 8.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_shape_errors() {
        #[derive(Debug)]
        struct Case {
            x: Vec<usize>,
            w: Vec<usize>,
            groups: usize,
            expected: LayerError,
        }

        let cases = [
            Case {
                x: vec![1, 2, 4],
                w: vec![1, 1, 3],
                groups: 1,
                expected: LayerError::ShapeMismatch(
                    "conv input channels do not match the weights",
                ),
            },
            Case {
                x: vec![2, 4],
                w: vec![1, 2, 3],
                groups: 1,
                expected: LayerError::ValueError(
                    "conv expects an input with at least 3 dimensions",
                ),
            },
            Case {
                x: vec![1, 6, 4],
                w: vec![4, 2, 3],
                groups: 3,
                expected: LayerError::ValueError(
                    "conv output channels must be divisible by the group count",
                ),
            },
        ];

        cases.test_each(|case| {
            let x = Value::from(Tensor::<f32>::zeros(&case.x));
            let w = Value::from(Tensor::<f32>::zeros(&case.w));
            let result = execute(
                LayerKind::Conv(Conv {
                    groups: case.groups,
                    ..Default::default()
                }),
                &[Some(&x), Some(&w)],
            );
            assert_eq!(result.unwrap_err(), case.expected);
        })
    }

    #[test]
    fn test_infer_conv() {
        #[derive(Debug)]
        struct Case {
            x: SymShape,
            w: SymShape,
            conv: Conv,
            expected: &'static str,
        }

        let cases = [
            Case {
                x: SymShape::from_dims(vec![
                    "batch".into(),
                    3.into(),
                    224.into(),
                    224.into(),
                ]),
                w: SymShape::fixed(&[8, 3, 3, 3]),
                conv: Conv {
                    strides: vec![2, 2],
                    pads: vec![1, 1, 1, 1],
                    ..Default::default()
                },
                expected: "[batch, 8, 112, 112]",
            },
            Case {
                // Same padding with stride 1 preserves symbolic dims.
                x: SymShape::from_dims(vec![1.into(), 4.into(), "len".into()]),
                w: SymShape::fixed(&[4, 4, 3]),
                conv: Conv {
                    auto_pad: AutoPad::SameUpper,
                    ..Default::default()
                },
                expected: "[1, 4, len]",
            },
            Case {
                // Unknown kernel extent leaves the spatial dim unknown.
                x: SymShape::fixed(&[1, 4, 10]),
                w: SymShape::from_dims(vec![8.into(), 4.into(), SymDim::Unknown]),
                conv: Conv::default(),
                expected: "[1, 8, ?]",
            },
        ];

        cases.test_each(|case| {
            let x = PartialTensor::new(DataType::Float, case.x.clone());
            let w = PartialTensor::new(DataType::Float, case.w.clone());
            let out = infer(
                LayerKind::Conv(case.conv.clone()),
                &[Some(&x), Some(&w)],
            )
            .unwrap();
            assert_eq!(out.dtype(), DataType::Float);
            assert_eq!(out.shape().to_string(), case.expected);
        })
    }

    #[test]
    fn test_infer_conv_bias_refines_channels() {
        let x = PartialTensor::new(DataType::Float, SymShape::unknown_of_rank(4));
        let w = PartialTensor::new(DataType::Float, SymShape::unknown_of_rank(4));
        let bias = PartialTensor::new(DataType::Float, SymShape::fixed(&[16]));
        let out = infer(
            LayerKind::Conv(Conv::default()),
            &[Some(&x), Some(&w), Some(&bias)],
        )
        .unwrap();
        assert_eq!(out.shape().to_string(), "[?, 16, ?, ?]");
    }

    #[test]
    fn test_conv_transpose_1d() {
        let x = floats(&[1, 1, 2], &[1., 2.]);
        let w = floats(&[1, 1, 2], &[1., 1.]);
        let out = execute(
            LayerKind::ConvTranspose(ConvTranspose {
                strides: vec![2],
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 4], vec![1., 1., 2., 2.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_transpose_2d() {
        let x = floats(&[1, 1, 2, 2], &[1., 2., 3., 4.]);
        let w = floats(&[1, 1, 2, 2], &[0.1, 0.2, 0.3, 0.4]);
        let out = execute(
            LayerKind::ConvTranspose(ConvTranspose {
                strides: vec![2, 2],
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(
            &[1, 1, 4, 4],
            vec![
                0.1, 0.2, 0.2, 0.4, //
                0.3, 0.4, 0.6, 0.8, //
                0.3, 0.6, 0.4, 0.8, //
                0.9, 1.2, 1.2, 1.6,
            ],
        );
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_conv_transpose_overlapping_windows() {
        // Stride 1 windows overlap, summing contributions.
        let x = floats(&[1, 1, 3], &[1., 2., 3.]);
        let w = floats(&[1, 1, 2], &[1., 1.]);
        let out = execute(
            LayerKind::ConvTranspose(ConvTranspose::default()),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 4], vec![1., 3., 5., 3.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_infer_conv_transpose() {
        let x = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 8.into(), 10.into()]),
        );
        let w = PartialTensor::new(DataType::Float, SymShape::fixed(&[8, 4, 3]));
        let out = infer(
            LayerKind::ConvTranspose(ConvTranspose {
                strides: vec![2],
                ..Default::default()
            }),
            &[Some(&x), Some(&w)],
        )
        .unwrap();
        // (10 - 1) * 2 + 3 = 21.
        assert_eq!(out.shape().to_string(), "[batch, 4, 21]");
    }
}
