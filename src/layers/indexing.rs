//! Index-driven lookups and updates.

use parten_tensor::Tensor;

use crate::backend::{Backend, ScatterReduction};
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::{PartialTensor, MAX_PARTIAL_ELEMENTS};
use crate::shape::SymShape;
use crate::value::{DataType, Value};

use super::{resolve_axis, resolve_index};

fn check_index_range(indices: &[i32], dim: usize) -> Result<(), LayerError> {
    let d = dim as i32;
    if indices.iter().any(|&i| i < -d || i >= d) {
        return Err(LayerError::ValueError("gather index out of range"));
    }
    Ok(())
}

pub(crate) fn infer_gather(axis: i32, inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require(1)?;

    // Gathering from a tracked vector with known indices picks the tracked
    // elements, so shapes survive indexing.
    if data.shape().rank() == Some(1) && data.is_partially_known() {
        if let (Some(d), Some(picks)) = (data.shape().dim(0).as_value(), indices.as_i32s()) {
            resolve_axis(1, axis)?;
            let mut elems = Vec::with_capacity(picks.len());
            for &pick in &picks {
                let Some(i) = resolve_index(d as usize, pick) else {
                    return Err(LayerError::ValueError("gather index out of range"));
                };
                elems.push(data.elem(i).clone());
            }
            if elems.len() <= MAX_PARTIAL_ELEMENTS {
                return Ok(PartialTensor::from_elems(
                    data.dtype(),
                    indices.shape().clone(),
                    elems,
                ));
            }
        }
    }

    let (Some(data_dims), Some(index_dims)) = (data.shape().dims(), indices.shape().dims())
    else {
        return Ok(PartialTensor::unknown(data.dtype()));
    };
    let axis = resolve_axis(data_dims.len(), axis)?;
    let mut out = data_dims[..axis].to_vec();
    out.extend(index_dims.iter().cloned());
    out.extend(data_dims[axis + 1..].iter().cloned());
    Ok(PartialTensor::new(data.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn infer_gather_elements(
    axis: i32,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require(1)?;
    if let (Some(data_rank), Some(index_rank)) = (data.shape().rank(), indices.shape().rank()) {
        if data_rank != index_rank {
            return Err(LayerError::RankMismatch {
                expected: data_rank,
                actual: index_rank,
            });
        }
        resolve_axis(data_rank, axis)?;
    }
    Ok(PartialTensor::new(data.dtype(), indices.shape().clone()))
}

pub(crate) fn infer_gather_nd(
    batch_dims: usize,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require(1)?;
    let (Some(data_dims), Some(index_dims)) = (data.shape().dims(), indices.shape().dims())
    else {
        return Ok(PartialTensor::unknown(data.dtype()));
    };
    if index_dims.is_empty() {
        return Err(LayerError::ValueError(
            "gather_nd indices must have rank >= 1",
        ));
    }
    if batch_dims >= index_dims.len() || batch_dims > data_dims.len() {
        return Err(LayerError::ValueError(
            "gather_nd batch dims exceed the input ranks",
        ));
    }
    let Some(k) = index_dims[index_dims.len() - 1].as_value() else {
        return Ok(PartialTensor::unknown(data.dtype()));
    };
    let k = k as usize;
    if batch_dims + k > data_dims.len() {
        return Err(LayerError::ValueError(
            "gather_nd index tuples are too long",
        ));
    }
    let mut out = index_dims[..index_dims.len() - 1].to_vec();
    out.extend(data_dims[batch_dims + k..].iter().cloned());
    Ok(PartialTensor::new(data.dtype(), SymShape::from_dims(out)))
}

/// The count of nonzero elements is data dependent, so only the coordinate
/// rank is known ahead of time.
pub(crate) fn infer_non_zero(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let rank_dim = match x.shape().rank() {
        Some(rank) => SymDim::Value(rank as i32),
        None => SymDim::Unknown,
    };
    Ok(PartialTensor::new(
        DataType::Int,
        SymShape::from_dims(vec![rank_dim, SymDim::Unknown]),
    ))
}

pub(crate) fn infer_one_hot(axis: i32, inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let indices = inputs.require(0)?;
    let depth = inputs.require(1)?;
    let values = inputs.require(2)?;
    let dtype = values.dtype();
    let Some(dims) = indices.shape().dims() else {
        return Ok(PartialTensor::unknown(dtype));
    };
    let axis = resolve_axis(dims.len() + 1, axis)?;
    let depth_dim = match depth.elem(0).to_dim() {
        SymDim::Value(d) if d <= 0 => {
            return Err(LayerError::ValueError("one_hot depth must be positive"))
        }
        dim => dim,
    };
    let mut out = dims.to_vec();
    out.insert(axis, depth_dim);
    Ok(PartialTensor::new(dtype, SymShape::from_dims(out)))
}

/// Scatter variants write into a copy of the data input, so the shape and
/// dtype pass straight through.
pub(crate) fn infer_scatter(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let data = inputs.require(0)?;
    inputs.require(1)?;
    inputs.require(2)?;
    Ok(PartialTensor::new(data.dtype(), data.shape().clone()))
}

pub(crate) fn infer_top_k(
    axis: i32,
    inputs: &PartialInputs,
) -> Result<Vec<PartialTensor>, LayerError> {
    let x = inputs.require(0)?;
    let k_input = inputs.require(1)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(vec![
            PartialTensor::unknown(x.dtype()),
            PartialTensor::unknown(DataType::Int),
        ]);
    };
    let axis = resolve_axis(dims.len(), axis)?;
    let k_dim = match k_input.elem(0).to_dim() {
        SymDim::Value(k) if k < 0 => {
            return Err(LayerError::ValueError("top_k k must be >= 0"))
        }
        dim => dim,
    };
    if let (Some(k), Some(d)) = (k_dim.as_value(), dims[axis].as_value()) {
        if k > d {
            return Err(LayerError::ValueError("top_k k exceeds the axis size"));
        }
    }
    let mut out = dims.to_vec();
    out[axis] = k_dim;
    let shape = SymShape::from_dims(out);
    Ok(vec![
        PartialTensor::new(x.dtype(), shape.clone()),
        PartialTensor::new(DataType::Int, shape),
    ])
}

pub(crate) fn execute_gather(
    axis: i32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require_int(1)?;
    let axis = resolve_axis(data.ndim(), axis)?;
    check_index_range(indices.data(), data.shape()[axis])?;
    match data {
        Value::Float(t) => Ok(backend.gather_float(t, indices, axis).into()),
        Value::Int(t) => Ok(backend.gather_int(t, indices, axis).into()),
    }
}

pub(crate) fn execute_gather_elements(
    axis: i32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require_int(1)?;
    if indices.ndim() != data.ndim() {
        return Err(LayerError::RankMismatch {
            expected: data.ndim(),
            actual: indices.ndim(),
        });
    }
    let axis = resolve_axis(data.ndim(), axis)?;
    for j in 0..data.ndim() {
        if j != axis && indices.size(j) > data.shape()[j] {
            return Err(LayerError::ShapeMismatch(
                "gather_elements indices exceed the input shape",
            ));
        }
    }
    check_index_range(indices.data(), data.shape()[axis])?;
    match data {
        Value::Float(t) => Ok(backend.gather_elements_float(t, indices, axis).into()),
        Value::Int(t) => Ok(backend.gather_elements_int(t, indices, axis).into()),
    }
}

fn check_nd_indices(
    data_shape: &[usize],
    indices: &Tensor<i32>,
    batch_dims: usize,
) -> Result<usize, LayerError> {
    if indices.ndim() == 0 {
        return Err(LayerError::ValueError(
            "gather_nd indices must have rank >= 1",
        ));
    }
    let k = indices.size(indices.ndim() - 1);
    if batch_dims >= indices.ndim() || batch_dims > data_shape.len() {
        return Err(LayerError::ValueError(
            "gather_nd batch dims exceed the input ranks",
        ));
    }
    if batch_dims + k > data_shape.len() {
        return Err(LayerError::ValueError(
            "gather_nd index tuples are too long",
        ));
    }
    for j in 0..batch_dims {
        if indices.size(j) != data_shape[j] {
            return Err(LayerError::ShapeMismatch(
                "gather_nd batch dimensions must match",
            ));
        }
    }
    for (pos, &i) in indices.data().iter().enumerate() {
        let d = data_shape[batch_dims + pos % k] as i32;
        if i < -d || i >= d {
            return Err(LayerError::ValueError("gather index out of range"));
        }
    }
    Ok(k)
}

pub(crate) fn execute_gather_nd(
    batch_dims: usize,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require_int(1)?;
    check_nd_indices(data.shape(), indices, batch_dims)?;
    match data {
        Value::Float(t) => Ok(backend.gather_nd_float(t, indices, batch_dims).into()),
        Value::Int(t) => Ok(backend.gather_nd_int(t, indices, batch_dims).into()),
    }
}

pub(crate) fn execute_non_zero(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    match inputs.require(0)? {
        Value::Float(t) => Ok(backend.non_zero_float(t).into()),
        Value::Int(t) => Ok(backend.non_zero_int(t).into()),
    }
}

pub(crate) fn execute_one_hot(
    axis: i32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let indices = inputs.require_int(0)?;
    let depth = inputs.require_scalar_int(1)?;
    if depth <= 0 {
        return Err(LayerError::ValueError("one_hot depth must be positive"));
    }
    let values = inputs.require(2)?;
    if values.len() != 2 {
        return Err(LayerError::ValueError(
            "one_hot values must hold two elements",
        ));
    }
    let axis = resolve_axis(indices.ndim() + 1, axis)?;
    // Negative indices count back from the depth. Anything still out of
    // range afterwards produces an all-off vector.
    let normalized = indices.map(|&i| if i < 0 { i + depth } else { i });
    let depth = depth as usize;
    match values {
        Value::Float(v) => Ok(backend
            .one_hot_float(&normalized, depth, axis, v.data()[0], v.data()[1])
            .into()),
        Value::Int(v) => Ok(backend
            .one_hot_int(&normalized, depth, axis, v.data()[0], v.data()[1])
            .into()),
    }
}

pub(crate) fn execute_scatter_elements(
    axis: i32,
    reduction: ScatterReduction,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require_int(1)?;
    let updates = inputs.require(2)?;
    if indices.ndim() != data.ndim() {
        return Err(LayerError::RankMismatch {
            expected: data.ndim(),
            actual: indices.ndim(),
        });
    }
    if updates.shape() != indices.shape() {
        return Err(LayerError::ShapeMismatch(
            "scatter updates must match the indices shape",
        ));
    }
    let axis = resolve_axis(data.ndim(), axis)?;
    for j in 0..data.ndim() {
        if j != axis && indices.size(j) > data.shape()[j] {
            return Err(LayerError::ShapeMismatch(
                "scatter indices exceed the input shape",
            ));
        }
    }
    check_index_range(indices.data(), data.shape()[axis])?;
    match (data, updates) {
        (Value::Float(d), Value::Float(u)) => Ok(backend
            .scatter_elements_float(d, indices, u, axis, reduction)
            .into()),
        (Value::Int(d), Value::Int(u)) => Ok(backend
            .scatter_elements_int(d, indices, u, axis, reduction)
            .into()),
        _ => Err(LayerError::UnsupportedDataType(
            "operands must have the same dtype",
        )),
    }
}

pub(crate) fn execute_scatter_nd(
    reduction: ScatterReduction,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let data = inputs.require(0)?;
    let indices = inputs.require_int(1)?;
    let updates = inputs.require(2)?;
    let k = check_nd_indices(data.shape(), indices, 0)?;
    let expected: Vec<usize> = indices.shape()[..indices.ndim() - 1]
        .iter()
        .chain(data.shape()[k..].iter())
        .copied()
        .collect();
    if updates.shape() != expected.as_slice() {
        return Err(LayerError::ShapeMismatch(
            "scatter updates must match the indices shape",
        ));
    }
    match (data, updates) {
        (Value::Float(d), Value::Float(u)) => {
            Ok(backend.scatter_nd_float(d, indices, u, reduction).into())
        }
        (Value::Int(d), Value::Int(u)) => {
            Ok(backend.scatter_nd_int(d, indices, u, reduction).into())
        }
        _ => Err(LayerError::UnsupportedDataType(
            "operands must have the same dtype",
        )),
    }
}

pub(crate) fn execute_top_k(
    axis: i32,
    largest: bool,
    sorted: bool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Vec<Value>, LayerError> {
    let x = inputs.require(0)?;
    let k = inputs.require_scalar_int(1)?;
    if k < 0 {
        return Err(LayerError::ValueError("top_k k must be >= 0"));
    }
    let axis = resolve_axis(x.ndim(), axis)?;
    let k = k as usize;
    if k > x.shape()[axis] {
        return Err(LayerError::ValueError("top_k k exceeds the axis size"));
    }
    match x {
        Value::Float(t) => {
            let (values, indices) = backend.top_k_float(t, k, axis, largest, sorted);
            Ok(vec![values.into(), indices.into()])
        }
        Value::Int(t) => {
            let (values, indices) = backend.top_k_int(t, k, axis, largest, sorted);
            Ok(vec![values.into(), indices.into()])
        }
    }
}
