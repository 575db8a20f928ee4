//! Trigonometric and hyperbolic layers. Float-only, shape preserving.

use crate::backend::{Backend, UnaryFloatOp};
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::value::Value;

pub(crate) fn infer(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    super::activation::infer(inputs)
}

pub(crate) fn execute(
    op: UnaryFloatOp,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    super::activation::execute_unary(op, inputs, backend)
}

#[cfg(test)]
mod tests {
    use parten_tensor::test_util::expect_equal;
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use crate::layer::LayerKind;
    use crate::layers::test_support::execute;
    use crate::value::Value;

    #[test]
    fn test_trig_ops() {
        #[derive(Debug)]
        struct Case {
            kind: LayerKind,
            reference: fn(f32) -> f32,
        }

        let cases = [
            Case {
                kind: LayerKind::Acos,
                reference: |x| x.acos(),
            },
            Case {
                kind: LayerKind::Asin,
                reference: |x| x.asin(),
            },
            Case {
                kind: LayerKind::Atan,
                reference: |x| x.atan(),
            },
            Case {
                kind: LayerKind::Cos,
                reference: |x| x.cos(),
            },
            Case {
                kind: LayerKind::Cosh,
                reference: |x| x.cosh(),
            },
            Case {
                kind: LayerKind::Sin,
                reference: |x| x.sin(),
            },
            Case {
                kind: LayerKind::Sinh,
                reference: |x| x.sinh(),
            },
            Case {
                kind: LayerKind::Tan,
                reference: |x| x.tan(),
            },
        ];

        cases.test_each_value(|Case { kind, reference }| {
            let data = vec![-0.9, -0.5, 0., 0.3, 0.8];
            let x = Value::from(Tensor::from_data(&[5], data.clone()));
            let out = execute(kind, &[Some(&x)]).unwrap();
            let expected: Vec<f32> = data.iter().map(|&x| reference(x)).collect();
            expect_equal(out.as_float().unwrap(), &Tensor::from_data(&[5], expected)).unwrap();
        })
    }
}
