//! Pooling layers.
//!
//! Like the convolutions, these expect `[batch, channels, spatial...]`
//! inputs with any number of spatial dimensions. The kernel shape fixes the
//! spatial rank.

use parten_tensor::Tensor;

use crate::backend::Backend;
use crate::dim::{AutoPad, SymDim};
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

use super::{defaulted, pooled_out_size, positive, resolve_window_pads, split_pads};

/// Parameters for the `AveragePool` layer.
///
/// With `count_include_pad`, padding cells count towards the divisor of each
/// window mean instead of being skipped.
#[derive(Clone, Debug, PartialEq)]
pub struct AveragePool {
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub pads: Vec<usize>,
    pub auto_pad: AutoPad,
    pub ceil_mode: bool,
    pub count_include_pad: bool,
}

impl Default for AveragePool {
    fn default() -> AveragePool {
        AveragePool {
            kernel: Vec::new(),
            strides: Vec::new(),
            pads: Vec::new(),
            auto_pad: AutoPad::NotSet,
            ceil_mode: false,
            count_include_pad: false,
        }
    }
}

/// Parameters for the `MaxPool` layer.
#[derive(Clone, Debug, PartialEq)]
pub struct MaxPool {
    pub kernel: Vec<usize>,
    pub strides: Vec<usize>,
    pub pads: Vec<usize>,
    pub auto_pad: AutoPad,
    pub ceil_mode: bool,
}

impl Default for MaxPool {
    fn default() -> MaxPool {
        MaxPool {
            kernel: Vec::new(),
            strides: Vec::new(),
            pads: Vec::new(),
            auto_pad: AutoPad::NotSet,
            ceil_mode: false,
        }
    }
}

fn infer_pool(
    kernel: &[usize],
    strides: &[usize],
    pads: &[usize],
    auto_pad: AutoPad,
    ceil_mode: bool,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let spatial = kernel.len();
    if spatial == 0 {
        return Err(LayerError::ValueError("pooling requires a kernel shape"));
    }
    positive(kernel, "pooling kernel sizes must be positive")?;
    let strides = defaulted(strides, spatial, 1)?;
    positive(&strides, "pooling strides must be positive")?;
    let pads = split_pads(pads, spatial)?;
    let x_shape = x.shape().declare_rank(spatial + 2)?;

    let mut dims = vec![x_shape.dim(0), x_shape.dim(1)];
    for i in 0..spatial {
        dims.push(x_shape.dim(2 + i).pool(
            kernel[i] as i32,
            strides[i] as i32,
            (pads[i].0 + pads[i].1) as i32,
            1,
            ceil_mode,
            auto_pad,
        ));
    }
    Ok(PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(dims),
    ))
}

pub(crate) fn infer_average_pool(
    params: &AveragePool,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    infer_pool(
        &params.kernel,
        &params.strides,
        &params.pads,
        params.auto_pad,
        params.ceil_mode,
        inputs,
    )
}

pub(crate) fn infer_max_pool(
    params: &MaxPool,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    infer_pool(
        &params.kernel,
        &params.strides,
        &params.pads,
        params.auto_pad,
        params.ceil_mode,
        inputs,
    )
}

/// Global pooling collapses every spatial dim to one, whatever its size.
pub(crate) fn infer_global_pool(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(DataType::Float));
    };
    if dims.len() < 3 {
        return Err(LayerError::ValueError(
            "pooling expects an input with at least 3 dimensions",
        ));
    }
    let mut out = dims[..2].to_vec();
    out.resize(dims.len(), SymDim::Value(1));
    Ok(PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(out),
    ))
}

/// Validate the input and resolve the window geometry shared by both pool
/// kinds, returning `(x, strides, pads, out_shape)`.
fn check_pool_inputs<'a>(
    kernel: &[usize],
    strides: &[usize],
    pads: &[usize],
    auto_pad: AutoPad,
    ceil_mode: bool,
    inputs: &Inputs<'a>,
) -> Result<
    (
        &'a Tensor<f32>,
        Vec<usize>,
        Vec<(usize, usize)>,
        Vec<usize>,
    ),
    LayerError,
> {
    let x = inputs.require_float(0)?;
    let spatial = kernel.len();
    if spatial == 0 {
        return Err(LayerError::ValueError("pooling requires a kernel shape"));
    }
    positive(kernel, "pooling kernel sizes must be positive")?;
    if x.ndim() != spatial + 2 {
        return Err(LayerError::RankMismatch {
            expected: spatial + 2,
            actual: x.ndim(),
        });
    }
    let strides = defaulted(strides, spatial, 1)?;
    positive(&strides, "pooling strides must be positive")?;
    let in_dims = &x.shape()[2..];
    let pads = resolve_window_pads(auto_pad, pads, in_dims, kernel, &strides)?;

    let mut out_shape = vec![x.size(0), x.size(1)];
    for i in 0..spatial {
        out_shape.push(pooled_out_size(
            in_dims[i],
            kernel[i],
            strides[i],
            pads[i].0 + pads[i].1,
            1,
            ceil_mode,
        )?);
    }
    Ok((x, strides, pads, out_shape))
}

pub(crate) fn execute_average_pool(
    params: &AveragePool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let (x, strides, pads, out_shape) = check_pool_inputs(
        &params.kernel,
        &params.strides,
        &params.pads,
        params.auto_pad,
        params.ceil_mode,
        inputs,
    )?;
    Ok(backend
        .average_pool(
            x,
            &params.kernel,
            &strides,
            &pads,
            params.count_include_pad,
            &out_shape,
        )
        .into())
}

pub(crate) fn execute_max_pool(
    params: &MaxPool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let (x, strides, pads, out_shape) = check_pool_inputs(
        &params.kernel,
        &params.strides,
        &params.pads,
        params.auto_pad,
        params.ceil_mode,
        inputs,
    )?;
    Ok(backend
        .max_pool(x, &params.kernel, &strides, &pads, &out_shape)
        .into())
}

fn check_global_pool_input<'a>(inputs: &Inputs<'a>) -> Result<&'a Tensor<f32>, LayerError> {
    let x = inputs.require_float(0)?;
    if x.ndim() < 3 {
        return Err(LayerError::ValueError(
            "pooling expects an input with at least 3 dimensions",
        ));
    }
    Ok(x)
}

pub(crate) fn execute_global_average_pool(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = check_global_pool_input(inputs)?;
    Ok(backend.global_average_pool(x).into())
}

pub(crate) fn execute_global_max_pool(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = check_global_pool_input(inputs)?;
    Ok(backend.global_max_pool(x).into())
}

#[cfg(test)]
mod tests {
    use parten_tensor::test_util::expect_equal;
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use super::{AveragePool, MaxPool};
    use crate::dim::AutoPad;
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
    fn test_max_pool() {
        let x = floats(
            &[1, 1, 4, 4],
            &[
                1., 2., 5., 6., //
                3., 4., 7., 8., //
                9., 10., 13., 14., //
                11., 12., 15., 16.,
            ],
        );
        let out = execute(
            LayerKind::MaxPool(MaxPool {
                kernel: vec![2, 2],
                strides: vec![2, 2],
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 2, 2], vec![4., 8., 12., 16.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_max_pool_default_strides() {
        // Strides default to 1, so windows overlap.
        let x = floats(&[1, 1, 4], &[1., 3., 2., 5.]);
        let out = execute(
            LayerKind::MaxPool(MaxPool {
                kernel: vec![2],
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 3], vec![3., 3., 5.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_average_pool() {
        let x = floats(&[1, 1, 2, 2], &[1., 2., 3., 4.]);
        let out = execute(
            LayerKind::AveragePool(AveragePool {
                kernel: vec![2, 2],
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 1, 1], vec![2.5]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_average_pool_pads() {
        // Padded cells are excluded from the mean unless count_include_pad
        // is set.
        let x = floats(&[1, 1, 2], &[2., 4.]);

        let out = execute(
            LayerKind::AveragePool(AveragePool {
                kernel: vec![2],
                strides: vec![2],
                pads: vec![1, 1],
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 2], vec![2., 4.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();

        let out = execute(
            LayerKind::AveragePool(AveragePool {
                kernel: vec![2],
                strides: vec![2],
                pads: vec![1, 1],
                count_include_pad: true,
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 2], vec![1., 2.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_pool_ceil_mode() {
        // With ceil_mode the final partial window survives.
        let x = floats(&[1, 1, 5], &[1., 2., 3., 4., 5.]);
        let out = execute(
            LayerKind::MaxPool(MaxPool {
                kernel: vec![2],
                strides: vec![2],
                ceil_mode: true,
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 3], vec![2., 4., 5.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();

        let out = execute(
            LayerKind::AveragePool(AveragePool {
                kernel: vec![2],
                strides: vec![2],
                ceil_mode: true,
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        let expected = Tensor::from_data(&[1, 1, 3], vec![1.5, 3.5, 5.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_pool_same_pad() {
        let x = floats(&[1, 1, 4], &[1., 2., 3., 4.]);
        let out = execute(
            LayerKind::MaxPool(MaxPool {
                kernel: vec![3],
                strides: vec![2],
                auto_pad: AutoPad::SameUpper,
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        // Output is ceil(4 / 2) = 2 with one cell of padding at the end.
        let expected = Tensor::from_data(&[1, 1, 2], vec![3., 4.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_global_pools() {
        let x = floats(&[1, 2, 2, 2], &[1., 2., 3., 4., -1., -2., -3., -4.]);

        let out = execute(LayerKind::GlobalAveragePool, &[Some(&x)]).unwrap();
        let expected = Tensor::from_data(&[1, 2, 1, 1], vec![2.5, -2.5]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();

        let out = execute(LayerKind::GlobalMaxPool, &[Some(&x)]).unwrap();
        let expected = Tensor::from_data(&[1, 2, 1, 1], vec![4., -1.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_pool_errors() {
        #[derive(Debug)]
        struct Case {
            shape: Vec<usize>,
            pool: MaxPool,
            expected: LayerError,
        }

        let cases = [
            Case {
                shape: vec![1, 1, 4],
                pool: MaxPool::default(),
                expected: LayerError::ValueError("pooling requires a kernel shape"),
            },
            Case {
                shape: vec![1, 1, 4],
                pool: MaxPool {
                    kernel: vec![2, 2],
                    ..Default::default()
                },
                expected: LayerError::RankMismatch {
                    expected: 4,
                    actual: 3,
                },
            },
            Case {
                shape: vec![1, 1, 4],
                pool: MaxPool {
                    kernel: vec![2],
                    strides: vec![0],
                    ..Default::default()
                },
                expected: LayerError::ValueError("pooling strides must be positive"),
            },
            Case {
                shape: vec![1, 1, 2],
                pool: MaxPool {
                    kernel: vec![5],
                    ..Default::default()
                },
                expected: LayerError::ValueError(
                    "pooling window is larger than the padded input",
                ),
            },
        ];

        cases.test_each(|case| {
            let x = Value::from(Tensor::<f32>::zeros(&case.shape));
            let result = execute(LayerKind::MaxPool(case.pool.clone()), &[Some(&x)]);
            assert_eq!(result.unwrap_err(), case.expected);
        })
    }

    #[test]
    fn test_infer_pool() {
        #[derive(Debug)]
        struct Case {
            x: SymShape,
            pool: MaxPool,
            expected: &'static str,
        }

        let cases = [
            Case {
                x: SymShape::from_dims(vec![
                    "batch".into(),
                    64.into(),
                    56.into(),
                    56.into(),
                ]),
                pool: MaxPool {
                    kernel: vec![2, 2],
                    strides: vec![2, 2],
                    ..Default::default()
                },
                expected: "[batch, 64, 28, 28]",
            },
            Case {
                // Same padding at stride 1 preserves symbolic spatial dims.
                x: SymShape::from_dims(vec![1.into(), 3.into(), "h".into(), "w".into()]),
                pool: MaxPool {
                    kernel: vec![3, 3],
                    auto_pad: AutoPad::SameUpper,
                    ..Default::default()
                },
                expected: "[1, 3, h, w]",
            },
            Case {
                // Unknown rank is pinned down by the kernel rank.
                x: SymShape::unknown(),
                pool: MaxPool {
                    kernel: vec![2],
                    ..Default::default()
                },
                expected: "[?, ?, ?]",
            },
        ];

        cases.test_each(|case| {
            let x = PartialTensor::new(DataType::Float, case.x.clone());
            let out = infer(LayerKind::MaxPool(case.pool.clone()), &[Some(&x)]).unwrap();
            assert_eq!(out.dtype(), DataType::Float);
            assert_eq!(out.shape().to_string(), case.expected);
        })
    }

    #[test]
    fn test_infer_pool_ceil_mode() {
        let x = PartialTensor::new(DataType::Float, SymShape::fixed(&[1, 1, 5]));
        let out = infer(
            LayerKind::MaxPool(MaxPool {
                kernel: vec![2],
                strides: vec![2],
                ceil_mode: true,
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        assert_eq!(out.shape().to_string(), "[1, 1, 3]");
    }

    #[test]
    fn test_infer_global_pool() {
        let x = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 8.into(), "h".into(), "w".into()]),
        );
        let out = infer(LayerKind::GlobalAveragePool, &[Some(&x)]).unwrap();
        assert_eq!(out.shape().to_string(), "[batch, 8, 1, 1]");

        let scalarish = PartialTensor::new(DataType::Float, SymShape::fixed(&[2, 3]));
        let result = infer(LayerKind::GlobalMaxPool, &[Some(&scalarish)]);
        assert_eq!(
            result.unwrap_err(),
            LayerError::ValueError("pooling expects an input with at least 3 dimensions")
        );
    }
}
