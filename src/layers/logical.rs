//! Boolean and comparison layers. Outputs use i32 with 0 and 1 as the two
//! truth values.

use crate::backend::{Backend, BinaryIntOp, CompareOp, UnaryIntOp};
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::{PartialElem, PartialTensor};
use crate::value::{DataType, Value};

use super::broadcast_shapes;
use super::math::{infer_broadcast, FoldFn};

fn fold_and(a: &PartialElem, b: &PartialElem) -> PartialElem {
    match (a, b) {
        (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int((*a != 0 && *b != 0) as i32),
        _ => PartialElem::Unknown,
    }
}

fn fold_or(a: &PartialElem, b: &PartialElem) -> PartialElem {
    match (a, b) {
        (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int((*a != 0 || *b != 0) as i32),
        _ => PartialElem::Unknown,
    }
}

fn fold_xor(a: &PartialElem, b: &PartialElem) -> PartialElem {
    match (a, b) {
        (PartialElem::Int(a), PartialElem::Int(b)) => {
            PartialElem::Int(((*a != 0) != (*b != 0)) as i32)
        }
        _ => PartialElem::Unknown,
    }
}

fn fold_equal(a: &PartialElem, b: &PartialElem) -> PartialElem {
    a.equal(b)
}

fn fold_greater(a: &PartialElem, b: &PartialElem) -> PartialElem {
    match (a, b) {
        (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int((a > b) as i32),
        (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Int((a > b) as i32),
        (PartialElem::Param(p), PartialElem::Param(q)) if p == q => PartialElem::Int(0),
        _ => PartialElem::Unknown,
    }
}

fn fold_greater_or_equal(a: &PartialElem, b: &PartialElem) -> PartialElem {
    match (a, b) {
        (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int((a >= b) as i32),
        (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Int((a >= b) as i32),
        (PartialElem::Param(p), PartialElem::Param(q)) if p == q => PartialElem::Int(1),
        _ => PartialElem::Unknown,
    }
}

fn fold_less(a: &PartialElem, b: &PartialElem) -> PartialElem {
    fold_greater(b, a)
}

fn fold_less_or_equal(a: &PartialElem, b: &PartialElem) -> PartialElem {
    fold_greater_or_equal(b, a)
}

fn fold_for(op: CompareOp) -> FoldFn {
    match op {
        CompareOp::Equal => fold_equal,
        CompareOp::Greater => fold_greater,
        CompareOp::GreaterOrEqual => fold_greater_or_equal,
        CompareOp::Less => fold_less,
        CompareOp::LessOrEqual => fold_less_or_equal,
    }
}

pub(crate) fn infer_and(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    infer_broadcast(inputs, Some(DataType::Int), Some(fold_and))
}

pub(crate) fn infer_or(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    infer_broadcast(inputs, Some(DataType::Int), Some(fold_or))
}

pub(crate) fn infer_xor(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    infer_broadcast(inputs, Some(DataType::Int), Some(fold_xor))
}

pub(crate) fn infer_compare(
    op: CompareOp,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    infer_broadcast(inputs, Some(DataType::Int), Some(fold_for(op)))
}

/// Shape passes through; the result is an i32 predicate mask.
pub(crate) fn infer_predicate(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    Ok(PartialTensor::new(DataType::Int, x.shape().clone()))
}

pub(crate) fn infer_where(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let cond = inputs.require(0)?;
    let x = inputs.require(1)?;
    let y = inputs.require(2)?;
    let shape = cond.shape().broadcast(x.shape())?.broadcast(y.shape())?;
    Ok(PartialTensor::new(x.dtype(), shape))
}

pub(crate) fn execute_logical_binary(
    op: BinaryIntOp,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let a = inputs.require_int(0)?;
    let b = inputs.require_int(1)?;
    let out_shape = broadcast_shapes(a.shape(), b.shape())?;
    Ok(backend.binary_int(op, a, b, &out_shape).into())
}

pub(crate) fn execute_not(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_int(0)?;
    Ok(backend.unary_int(UnaryIntOp::Not, x).into())
}

pub(crate) fn execute_compare(
    op: CompareOp,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let a = inputs.require(0)?;
    let b = inputs.require(1)?;
    let out_shape = broadcast_shapes(a.shape(), b.shape())?;
    match (a, b) {
        (Value::Float(a), Value::Float(b)) => Ok(backend.compare_float(op, a, b, &out_shape).into()),
        (Value::Int(a), Value::Int(b)) => Ok(backend.compare_int(op, a, b, &out_shape).into()),
        _ => Err(LayerError::UnsupportedDataType(
            "operands must have the same dtype",
        )),
    }
}

pub(crate) fn execute_where(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let cond = inputs.require_int(0)?;
    let x = inputs.require(1)?;
    let y = inputs.require(2)?;
    let out_shape = broadcast_shapes(
        &broadcast_shapes(cond.shape(), x.shape())?,
        y.shape(),
    )?;
    match (x, y) {
        (Value::Float(x), Value::Float(y)) => {
            Ok(backend.where_float(cond, x, y, &out_shape).into())
        }
        (Value::Int(x), Value::Int(y)) => Ok(backend.where_int(cond, x, y, &out_shape).into()),
        _ => Err(LayerError::UnsupportedDataType(
            "operands must have the same dtype",
        )),
    }
}

pub(crate) fn execute_is_inf(
    detect_negative: bool,
    detect_positive: bool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    Ok(backend.is_inf(x, detect_negative, detect_positive).into())
}

pub(crate) fn execute_is_nan(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    Ok(backend.is_nan(x).into())
}

#[cfg(test)]
mod tests {
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use crate::layer::LayerKind;
    use crate::layers::test_support::{execute, infer};
    use crate::partial::{PartialElem, PartialTensor};
    use crate::shape::SymShape;
    use crate::value::{DataType, Value};

    #[test]
    fn test_infer_compare_yields_int_mask() {
        let a = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 4.into()]),
        );
        let b = PartialTensor::new(DataType::Float, SymShape::fixed(&[4]));
        let out = infer(LayerKind::Less, &[Some(&a), Some(&b)]).unwrap();
        assert_eq!(out.dtype(), DataType::Int);
        assert_eq!(out.shape().to_string(), "[batch, 4]");
    }

    #[test]
    fn test_infer_equal_folds_params() {
        let batch = PartialTensor::from_dims(&["batch".into()]);
        let out = infer(LayerKind::Equal, &[Some(&batch), Some(&batch)]).unwrap();
        assert_eq!(out.elem(0), &PartialElem::Int(1));

        let four = PartialTensor::from_ints(&[4]);
        let out = infer(LayerKind::Equal, &[Some(&batch), Some(&four)]).unwrap();
        assert_eq!(out.elem(0), &PartialElem::Unknown);

        let five = PartialTensor::from_ints(&[5]);
        let out = infer(LayerKind::Equal, &[Some(&four), Some(&five)]).unwrap();
        assert_eq!(out.elem(0), &PartialElem::Int(0));
    }

    #[test]
    fn test_execute_compare() {
        #[derive(Debug)]
        struct Case {
            kind: LayerKind,
            expected: Vec<i32>,
        }

        let cases = [
            Case {
                kind: LayerKind::Equal,
                expected: vec![0, 1, 0],
            },
            Case {
                kind: LayerKind::Greater,
                expected: vec![0, 0, 1],
            },
            Case {
                kind: LayerKind::GreaterOrEqual,
                expected: vec![0, 1, 1],
            },
            Case {
                kind: LayerKind::Less,
                expected: vec![1, 0, 0],
            },
            Case {
                kind: LayerKind::LessOrEqual,
                expected: vec![1, 1, 0],
            },
        ];

        cases.test_each_value(|case| {
            let a = Value::from(Tensor::from_data(&[3], vec![1., 2., 3.]));
            let b = Value::from(Tensor::from_data(&[3], vec![2., 2., 2.]));
            let out = execute(case.kind, &[Some(&a), Some(&b)]).unwrap();
            assert_eq!(out.as_int().unwrap().data(), &case.expected);
        })
    }

    #[test]
    fn test_execute_logical() {
        let a = Value::from(Tensor::from_data(&[4], vec![0, 0, 1, 1]));
        let b = Value::from(Tensor::from_data(&[4], vec![0, 1, 0, 1]));

        let and = execute(LayerKind::And, &[Some(&a), Some(&b)]).unwrap();
        assert_eq!(and.as_int().unwrap().data(), &[0, 0, 0, 1]);

        let or = execute(LayerKind::Or, &[Some(&a), Some(&b)]).unwrap();
        assert_eq!(or.as_int().unwrap().data(), &[0, 1, 1, 1]);

        let xor = execute(LayerKind::Xor, &[Some(&a), Some(&b)]).unwrap();
        assert_eq!(xor.as_int().unwrap().data(), &[0, 1, 1, 0]);

        let not = execute(LayerKind::Not, &[Some(&a)]).unwrap();
        assert_eq!(not.as_int().unwrap().data(), &[1, 1, 0, 0]);
    }

    #[test]
    fn test_execute_where() {
        let cond = Value::from(Tensor::from_data(&[3], vec![1, 0, 1]));
        let x = Value::from(Tensor::from_data(&[3], vec![1., 2., 3.]));
        let y = Value::from(Tensor::from_data(&[3], vec![10., 20., 30.]));
        let out = execute(LayerKind::Where, &[Some(&cond), Some(&x), Some(&y)]).unwrap();
        assert_eq!(out.as_float().unwrap().data(), &[1., 20., 3.]);

        // The condition broadcasts against the branches.
        let cond = Value::from(Tensor::from_data(&[2, 1], vec![1, 0]));
        let x = Value::from(Tensor::from_data(&[2], vec![1, 2]));
        let y = Value::from(Tensor::scalar(-1i32));
        let out = execute(LayerKind::Where, &[Some(&cond), Some(&x), Some(&y)]).unwrap();
        assert_eq!(out.as_int().unwrap().shape(), &[2, 2]);
        assert_eq!(out.as_int().unwrap().data(), &[1, 2, -1, -1]);
    }

    #[test]
    fn test_execute_is_inf_is_nan() {
        let x = Value::from(Tensor::from_data(
            &[4],
            vec![1., f32::INFINITY, f32::NEG_INFINITY, f32::NAN],
        ));

        let out = execute(
            LayerKind::IsInf {
                detect_negative: true,
                detect_positive: true,
            },
            &[Some(&x)],
        )
        .unwrap();
        assert_eq!(out.as_int().unwrap().data(), &[0, 1, 1, 0]);

        let out = execute(
            LayerKind::IsInf {
                detect_negative: false,
                detect_positive: true,
            },
            &[Some(&x)],
        )
        .unwrap();
        assert_eq!(out.as_int().unwrap().data(), &[0, 1, 0, 0]);

        let out = execute(LayerKind::IsNaN, &[Some(&x)]).unwrap();
        assert_eq!(out.as_int().unwrap().data(), &[0, 0, 0, 1]);
    }
}
