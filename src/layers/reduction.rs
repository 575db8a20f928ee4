//! Reductions over tensor axes.

use crate::backend::{ArgReduceOp, Backend, ReduceOp};
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

use super::{resolve_axes, resolve_axis};

/// Parameters shared by the `Reduce*` layers. The axes to reduce arrive as
/// an optional second input.
#[derive(Clone, Debug, PartialEq)]
pub struct Reduce {
    pub keep_dims: bool,
    /// When the axes input is absent or empty, pass the input through
    /// unchanged instead of reducing every axis.
    pub noop_with_empty_axes: bool,
}

impl Default for Reduce {
    fn default() -> Reduce {
        Reduce {
            keep_dims: true,
            noop_with_empty_axes: false,
        }
    }
}

/// Parameters for `ArgMax` and `ArgMin`.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgReduce {
    pub axis: i32,
    pub keep_dims: bool,
    /// Break ties towards the highest index instead of the lowest.
    pub select_last_index: bool,
}

impl Default for ArgReduce {
    fn default() -> ArgReduce {
        ArgReduce {
            axis: 0,
            keep_dims: true,
            select_last_index: false,
        }
    }
}

/// The size of a reduced axis. Reducing an empty axis produces an empty
/// output, so a statically zero dimension survives.
fn reduced_dim(dim: &SymDim) -> SymDim {
    if dim.as_value() == Some(0) {
        SymDim::Value(0)
    } else {
        SymDim::Value(1)
    }
}

pub(crate) fn infer_reduce(
    params: &Reduce,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(x.dtype()));
    };

    // The axes input is either absent, a tracked value (possibly empty) or
    // present with unknown contents.
    let axes: Option<Option<Vec<i32>>> = match inputs.get(1) {
        None => Some(None),
        Some(t) => match t.as_i32s() {
            Some(values) if values.is_empty() => Some(None),
            Some(values) => Some(Some(values)),
            None => None,
        },
    };

    match axes {
        Some(Some(values)) => {
            let mut reduced = resolve_axes(dims.len(), &values)?;
            reduced.sort_unstable();
            reduced.dedup();
            let mut out = Vec::with_capacity(dims.len());
            for (i, dim) in dims.iter().enumerate() {
                if reduced.binary_search(&i).is_ok() {
                    if params.keep_dims {
                        out.push(reduced_dim(dim));
                    }
                } else {
                    out.push(dim.clone());
                }
            }
            Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
        }
        Some(None) => {
            if params.noop_with_empty_axes {
                Ok(x.clone())
            } else if params.keep_dims {
                let out = dims.iter().map(reduced_dim).collect();
                Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
            } else {
                Ok(PartialTensor::new(x.dtype(), SymShape::fixed(&[])))
            }
        }
        // The axes exist but their values are unknown. Any subset of axes
        // may be reduced, so only dimensions whose size is unaffected by
        // reduction survive.
        None => {
            if params.keep_dims {
                let out = dims
                    .iter()
                    .map(|dim| match dim.as_value() {
                        Some(0) => SymDim::Value(0),
                        Some(1) => SymDim::Value(1),
                        _ => SymDim::Unknown,
                    })
                    .collect();
                Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
            } else {
                Ok(PartialTensor::unknown(x.dtype()))
            }
        }
    }
}

pub(crate) fn infer_arg_reduce(
    params: &ArgReduce,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(DataType::Int));
    };
    let axis = resolve_axis(dims.len(), params.axis)?;
    let mut out = Vec::with_capacity(dims.len());
    for (i, dim) in dims.iter().enumerate() {
        if i == axis {
            if params.keep_dims {
                out.push(SymDim::Value(1));
            }
        } else {
            out.push(dim.clone());
        }
    }
    Ok(PartialTensor::new(DataType::Int, SymShape::from_dims(out)))
}

pub(crate) fn execute_reduce(
    op: ReduceOp,
    params: &Reduce,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let axes: Vec<i32> = match inputs.get_int(1)? {
        Some(t) => t.data().to_vec(),
        None => Vec::new(),
    };
    let resolved = if axes.is_empty() {
        if params.noop_with_empty_axes {
            return Ok(x.clone());
        }
        Vec::new()
    } else {
        resolve_axes(x.ndim(), &axes)?
    };

    match x {
        Value::Float(t) => Ok(backend.reduce_float(op, t, &resolved, params.keep_dims).into()),
        Value::Int(t) => match op {
            ReduceOp::L2 | ReduceOp::LogSum | ReduceOp::LogSumExp => {
                Err(LayerError::UnsupportedDataType(
                    "int tensors are not supported by this reduction",
                ))
            }
            _ => Ok(backend.reduce_int(op, t, &resolved, params.keep_dims).into()),
        },
    }
}

pub(crate) fn execute_arg_reduce(
    op: ArgReduceOp,
    params: &ArgReduce,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let axis = resolve_axis(x.ndim(), params.axis)?;
    if x.shape()[axis] == 0 {
        return Err(LayerError::ValueError(
            "cannot reduce an empty axis to an index",
        ));
    }
    match x {
        Value::Float(t) => Ok(backend
            .arg_reduce_float(op, t, axis, params.keep_dims, params.select_last_index)
            .into()),
        Value::Int(t) => Ok(backend
            .arg_reduce_int(op, t, axis, params.keep_dims, params.select_last_index)
            .into()),
    }
}

#[cfg(test)]
mod tests {
    use parten_tensor::test_util::expect_equal;
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use super::{ArgReduce, Reduce};
    use crate::layer::LayerKind;
    use crate::layers::test_support::{execute, infer};
    use crate::partial::PartialTensor;
    use crate::shape::SymShape;
    use crate::value::{DataType, Value};

    fn reduce_kind(op: &str, params: Reduce) -> LayerKind {
        match op {
            "l1" => LayerKind::ReduceL1(params),
            "l2" => LayerKind::ReduceL2(params),
            "log_sum" => LayerKind::ReduceLogSum(params),
            "log_sum_exp" => LayerKind::ReduceLogSumExp(params),
            "max" => LayerKind::ReduceMax(params),
            "mean" => LayerKind::ReduceMean(params),
            "min" => LayerKind::ReduceMin(params),
            "prod" => LayerKind::ReduceProd(params),
            "sum" => LayerKind::ReduceSum(params),
            "sum_square" => LayerKind::ReduceSumSquare(params),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_execute_reduce_ops() {
        #[derive(Debug)]
        struct Case {
            op: &'static str,
            expected: Vec<f32>,
        }

        let cases = [
            Case {
                op: "l1",
                expected: vec![6., 15.],
            },
            Case {
                op: "l2",
                expected: vec![14f32.sqrt(), 77f32.sqrt()],
            },
            Case {
                op: "log_sum",
                expected: vec![6f32.ln(), 15f32.ln()],
            },
            Case {
                op: "log_sum_exp",
                expected: vec![
                    (1f32.exp() + 2f32.exp() + 3f32.exp()).ln(),
                    (4f32.exp() + 5f32.exp() + 6f32.exp()).ln(),
                ],
            },
            Case {
                op: "max",
                expected: vec![3., 6.],
            },
            Case {
                op: "mean",
                expected: vec![2., 5.],
            },
            Case {
                op: "min",
                expected: vec![1., 4.],
            },
            Case {
                op: "prod",
                expected: vec![6., 120.],
            },
            Case {
                op: "sum",
                expected: vec![6., 15.],
            },
            Case {
                op: "sum_square",
                expected: vec![14., 77.],
            },
        ];

        cases.test_each(|case| {
            let x = Value::from(Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]));
            let axes = Value::from(Tensor::from_data(&[1], vec![1]));
            let kind = reduce_kind(
                case.op,
                Reduce {
                    keep_dims: false,
                    ..Default::default()
                },
            );
            let out = execute(kind, &[Some(&x), Some(&axes)]).unwrap();
            expect_equal(
                out.as_float().unwrap(),
                &Tensor::from_data(&[2], case.expected.clone()),
            )
            .unwrap();
        })
    }

    #[test]
    fn test_execute_reduce_shapes() {
        let x = Value::from(Tensor::from_data(&[2, 3], vec![1., 2., 3., 4., 5., 6.]));

        // keep_dims retains a size-1 axis.
        let axes = Value::from(Tensor::from_data(&[1], vec![1]));
        let kind = LayerKind::ReduceSum(Reduce::default());
        let out = execute(kind, &[Some(&x), Some(&axes)]).unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert_eq!(out.as_float().unwrap().data(), &[6., 15.]);

        // An absent axes input reduces everything.
        let sum_all = || {
            LayerKind::ReduceSum(Reduce {
                keep_dims: false,
                ..Default::default()
            })
        };
        let out = execute(sum_all(), &[Some(&x), None]).unwrap();
        assert_eq!(out.shape(), &[] as &[usize]);
        assert_eq!(out.as_float().unwrap().data(), &[21.]);

        // Negative axes count from the end.
        let axes = Value::from(Tensor::from_data(&[1], vec![-1]));
        let out = execute(sum_all(), &[Some(&x), Some(&axes)]).unwrap();
        assert_eq!(out.as_float().unwrap().data(), &[6., 15.]);
    }

    #[test]
    fn test_execute_reduce_noop_passes_input_through() {
        let x = Value::from(Tensor::from_data(&[2, 2], vec![1., 2., 3., 4.]));
        let kind = LayerKind::ReduceMax(Reduce {
            keep_dims: true,
            noop_with_empty_axes: true,
        });
        let out = execute(kind, &[Some(&x), None]).unwrap();
        expect_equal(out.as_float().unwrap(), x.as_float().unwrap()).unwrap();
    }

    #[test]
    fn test_execute_reduce_int() {
        let x = Value::from(Tensor::from_data(&[4], vec![1, 2, 3, 4]));
        let sum = execute(LayerKind::ReduceSum(Reduce::default()), &[Some(&x), None]).unwrap();
        assert_eq!(sum.as_int().unwrap().data(), &[10]);

        // Int mean truncates.
        let mean = execute(LayerKind::ReduceMean(Reduce::default()), &[Some(&x), None]).unwrap();
        assert_eq!(mean.as_int().unwrap().data(), &[2]);

        let err = execute(LayerKind::ReduceL2(Reduce::default()), &[Some(&x), None]);
        assert!(matches!(
            err,
            Err(crate::error::LayerError::UnsupportedDataType(_))
        ));
    }

    #[test]
    fn test_infer_reduce() {
        #[derive(Debug)]
        struct Case {
            shape: SymShape,
            axes: Option<Vec<i32>>,
            keep_dims: bool,
            expected: &'static str,
        }

        let symbolic = SymShape::from_dims(vec!["batch".into(), 1.into(), 7.into()]);
        let cases = [
            Case {
                shape: symbolic.clone(),
                axes: Some(vec![2]),
                keep_dims: true,
                expected: "[batch, 1, 1]",
            },
            Case {
                shape: symbolic.clone(),
                axes: Some(vec![-1]),
                keep_dims: false,
                expected: "[batch, 1]",
            },
            Case {
                shape: symbolic.clone(),
                axes: None,
                keep_dims: true,
                expected: "[1, 1, 1]",
            },
            Case {
                shape: symbolic.clone(),
                axes: None,
                keep_dims: false,
                expected: "[]",
            },
            // Reducing a statically empty axis keeps it empty.
            Case {
                shape: SymShape::fixed(&[0, 3]),
                axes: Some(vec![0]),
                keep_dims: true,
                expected: "[0, 3]",
            },
        ];

        cases.test_each(|case| {
            let x = PartialTensor::new(DataType::Float, case.shape.clone());
            let axes = case
                .axes
                .as_ref()
                .map(|values| PartialTensor::from_ints(values));
            let kind = LayerKind::ReduceSum(Reduce {
                keep_dims: case.keep_dims,
                ..Default::default()
            });
            let out = infer(kind, &[Some(&x), axes.as_ref()]).unwrap();
            assert_eq!(out.shape().to_string(), case.expected);
        })
    }

    #[test]
    fn test_infer_reduce_unknown_axes() {
        // With unknown axes values, only sizes that reduction cannot change
        // survive.
        let x = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 1.into(), 7.into()]),
        );
        let axes = PartialTensor::new(DataType::Int, SymShape::fixed(&[1]));

        let kind = LayerKind::ReduceSum(Reduce::default());
        let out = infer(kind, &[Some(&x), Some(&axes)]).unwrap();
        assert_eq!(out.shape().to_string(), "[?, 1, ?]");

        let kind = LayerKind::ReduceSum(Reduce {
            keep_dims: false,
            ..Default::default()
        });
        let out = infer(kind, &[Some(&x), Some(&axes)]).unwrap();
        assert_eq!(out.shape().to_string(), "unknown");
    }

    #[test]
    fn test_execute_arg_reduce() {
        let x = Value::from(Tensor::from_data(&[5], vec![3., 1., 4., 1., 5.]));

        let argmax = LayerKind::ArgMax(ArgReduce {
            keep_dims: false,
            ..Default::default()
        });
        let out = execute(argmax, &[Some(&x)]).unwrap();
        assert_eq!(out.as_int().unwrap().data(), &[4]);

        // Ties go to the first occurrence unless select_last_index is set.
        let argmin = LayerKind::ArgMin(ArgReduce {
            keep_dims: false,
            ..Default::default()
        });
        let out = execute(argmin, &[Some(&x)]).unwrap();
        assert_eq!(out.as_int().unwrap().data(), &[1]);

        let argmin_last = LayerKind::ArgMin(ArgReduce {
            keep_dims: false,
            select_last_index: true,
            ..Default::default()
        });
        let out = execute(argmin_last, &[Some(&x)]).unwrap();
        assert_eq!(out.as_int().unwrap().data(), &[3]);
    }

    #[test]
    fn test_arg_reduce_shapes() {
        let x = Value::from(Tensor::from_data(&[2, 3], vec![1, 5, 2, 9, 0, 4]));
        let out = execute(
            LayerKind::ArgMax(ArgReduce {
                axis: 1,
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert_eq!(out.as_int().unwrap().data(), &[1, 0]);

        let x = PartialTensor::new(
            DataType::Float,
            SymShape::from_dims(vec!["batch".into(), 3.into()]),
        );
        let out = infer(
            LayerKind::ArgMax(ArgReduce {
                axis: 1,
                keep_dims: false,
                ..Default::default()
            }),
            &[Some(&x)],
        )
        .unwrap();
        assert_eq!(out.dtype(), DataType::Int);
        assert_eq!(out.shape().to_string(), "[batch]");
    }
}
