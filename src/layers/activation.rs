//! Activation layers.
//!
//! All activations preserve the shape of their first input. Apart from
//! `Relu`, which also runs over int tensors, they are float kernels.

use crate::backend::{Backend, BinaryFloatOp, UnaryFloatOp, UnaryIntOp};
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::value::{DataType, Value};

use super::resolve_axis;

/// Shape passes through unchanged; the result is float.
pub(crate) fn infer(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    Ok(PartialTensor::new(DataType::Float, x.shape().clone()))
}

/// PRelu also takes a slope input, but the slope only broadcasts up to the
/// input shape, so the output shape is the input's.
pub(crate) fn infer_prelu(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    inputs.require(1)?;
    Ok(PartialTensor::new(DataType::Float, x.shape().clone()))
}

pub(crate) fn execute_unary(
    op: UnaryFloatOp,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    Ok(backend.unary_float(op, x).into())
}

pub(crate) fn execute_relu(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    match inputs.require(0)? {
        Value::Float(x) => Ok(backend.unary_float(UnaryFloatOp::Relu, x).into()),
        Value::Int(x) => Ok(backend.unary_int(UnaryIntOp::Relu, x).into()),
    }
}

pub(crate) fn execute_softmax(
    axis: i32,
    log: bool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    let axis = resolve_axis(x.ndim(), axis)?;
    let out = if log {
        backend.log_softmax(x, axis)
    } else {
        backend.softmax(x, axis)
    };
    Ok(out.into())
}

pub(crate) fn execute_prelu(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    let slope = inputs.require_float(1)?;
    let out_shape = super::broadcast_shapes(x.shape(), slope.shape())?;
    Ok(backend
        .binary_float(BinaryFloatOp::PRelu, x, slope, &out_shape)
        .into())
}

#[cfg(test)]
mod tests {
    use parten_tensor::test_util::expect_equal;
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use crate::layer::LayerKind;
    use crate::layers::test_support::{execute, infer};
    use crate::partial::PartialTensor;
    use crate::shape::SymShape;
    use crate::value::{DataType, Value};

    #[test]
    fn test_infer_passes_shape_through() {
        let x = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 16.into()]),
        );
        let out = infer(LayerKind::Sigmoid, &[Some(&x)]).unwrap();
        assert_eq!(out.dtype(), DataType::Float);
        assert_eq!(out.shape().to_string(), "[batch, 16]");

        let x = PartialTensor::unknown(DataType::Float);
        let out = infer(LayerKind::Tanh, &[Some(&x)]).unwrap();
        assert_eq!(out.shape().to_string(), "unknown");
    }

    #[test]
    fn test_unary_activations() {
        #[derive(Debug)]
        struct Case {
            kind: LayerKind,
            reference: fn(f32) -> f32,
        }

        let cases = [
            Case {
                kind: LayerKind::Celu { alpha: 1.0 },
                reference: |x| x.max(0.) + (1.0 * ((x / 1.0).exp() - 1.)).min(0.),
            },
            Case {
                kind: LayerKind::Elu { alpha: 1.0 },
                reference: |x| if x >= 0. { x } else { x.exp() - 1. },
            },
            Case {
                kind: LayerKind::Erf,
                reference: libm::erff,
            },
            Case {
                kind: LayerKind::Gelu,
                reference: |x| 0.5 * x * (1. + libm::erff(x / 2f32.sqrt())),
            },
            Case {
                kind: LayerKind::HardSigmoid {
                    alpha: 0.2,
                    beta: 0.5,
                },
                reference: |x| (0.2 * x + 0.5).clamp(0., 1.),
            },
            Case {
                kind: LayerKind::HardSwish,
                reference: |x| x * (x / 6. + 0.5).clamp(0., 1.),
            },
            Case {
                kind: LayerKind::LeakyRelu { alpha: 0.1 },
                reference: |x| if x >= 0. { x } else { 0.1 * x },
            },
            Case {
                kind: LayerKind::Relu,
                reference: |x| x.max(0.),
            },
            Case {
                kind: LayerKind::Selu {
                    alpha: 1.673_263_2,
                    gamma: 1.050_701,
                },
                reference: |x| {
                    if x > 0. {
                        1.050_701 * x
                    } else {
                        1.050_701 * 1.673_263_2 * (x.exp() - 1.)
                    }
                },
            },
            Case {
                kind: LayerKind::Sigmoid,
                reference: |x| 1. / (1. + (-x).exp()),
            },
            Case {
                kind: LayerKind::Softplus,
                reference: |x| x.exp().ln_1p(),
            },
            Case {
                kind: LayerKind::Softsign,
                reference: |x| x / (1. + x.abs()),
            },
            Case {
                kind: LayerKind::Tanh,
                reference: |x| x.tanh(),
            },
        ];

        cases.test_each_value(|Case { kind, reference }| {
            let data = vec![-2.5, -1., -0.25, 0., 0.5, 1., 3.];
            let x = Value::from(Tensor::from_data(&[7], data.clone()));
            let out = execute(kind, &[Some(&x)]).unwrap();
            let expected: Vec<f32> = data.iter().map(|&x| reference(x)).collect();
            expect_equal(out.as_float().unwrap(), &Tensor::from_data(&[7], expected)).unwrap();
        })
    }

    #[test]
    fn test_relu_int() {
        let x = Value::from(Tensor::from_data(&[4], vec![-3, -1, 0, 5]));
        let out = execute(LayerKind::Relu, &[Some(&x)]).unwrap();
        assert_eq!(out.as_int().unwrap().data(), &[0, 0, 0, 5]);
    }

    #[test]
    fn test_float_only_activations_reject_int() {
        let x = Value::from(Tensor::from_data(&[2], vec![1, 2]));
        let result = execute(LayerKind::Sigmoid, &[Some(&x)]);
        assert!(matches!(
            result,
            Err(crate::error::LayerError::UnsupportedDataType(_))
        ));
    }

    #[test]
    fn test_softmax() {
        let x = Value::from(Tensor::from_data(&[2, 3], vec![1., 2., 3., 0., 0., 0.]));
        let out = execute(LayerKind::Softmax { axis: -1 }, &[Some(&x)]).unwrap();
        let out = out.as_float().unwrap();

        // Rows sum to one.
        for row in 0..2 {
            let sum: f32 = (0..3).map(|i| out[[row, i]]).sum();
            assert!((sum - 1.).abs() < 1e-6);
        }
        let third = 1. / 3.;
        let exp_sum = 1f32.exp() + 2f32.exp() + 3f32.exp();
        let expected = Tensor::from_data(
            &[2, 3],
            vec![
                1f32.exp() / exp_sum,
                2f32.exp() / exp_sum,
                3f32.exp() / exp_sum,
                third,
                third,
                third,
            ],
        );
        expect_equal(out, &expected).unwrap();
    }

    #[test]
    fn test_log_softmax() {
        let x = Value::from(Tensor::from_data(&[1, 4], vec![0.1, 0.7, 0.2, 1.5]));
        let out = execute(LayerKind::LogSoftmax { axis: 1 }, &[Some(&x)]).unwrap();
        let softmax = execute(LayerKind::Softmax { axis: 1 }, &[Some(&x)]).unwrap();
        let expected = softmax.as_float().unwrap().map(|x| x.ln());
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }

    #[test]
    fn test_prelu() {
        let x = Value::from(Tensor::from_data(&[2, 2], vec![-2., -1., 1., 2.]));
        let slope = Value::from(Tensor::from_data(&[2], vec![0.5, 0.1]));
        let out = execute(LayerKind::PRelu, &[Some(&x), Some(&slope)]).unwrap();
        let expected = Tensor::from_data(&[2, 2], vec![-1., -0.1, 1., 2.]);
        expect_equal(out.as_float().unwrap(), &expected).unwrap();
    }
}
