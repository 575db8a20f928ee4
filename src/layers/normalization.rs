//! Normalization layers.

use parten_tensor::Tensor;

use crate::backend::Backend;
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

use super::resolve_axis;

/// Unify the channel dim of `shape` (dim 1) with a dimension gathered from
/// the per-channel parameter tensors.
fn refine_channel(shape: &SymShape, channel: &SymDim) -> Result<SymShape, LayerError> {
    let Some(dims) = shape.dims() else {
        return Ok(shape.clone());
    };
    if dims.len() < 2 {
        return Err(LayerError::ValueError(
            "normalization expects an input with channels",
        ));
    }
    let mut dims = dims.to_vec();
    dims[1] = dims[1].unify(channel)?;
    Ok(SymShape::from_dims(dims))
}

/// Merge the lengths of 1-D parameter inputs `range` into a single channel
/// dim.
fn channel_dim(
    inputs: &PartialInputs,
    range: std::ops::RangeInclusive<usize>,
) -> Result<SymDim, LayerError> {
    let mut channel = SymDim::Unknown;
    for i in range {
        let param = inputs.require(i)?;
        let shape = param.shape().declare_rank(1)?;
        channel = channel.unify(&shape.dim(0))?;
    }
    Ok(channel)
}

pub(crate) fn infer_batch_norm(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let channel = channel_dim(inputs, 1..=4)?;
    Ok(PartialTensor::new(
        DataType::Float,
        refine_channel(x.shape(), &channel)?,
    ))
}

pub(crate) fn infer_instance_norm(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let channel = channel_dim(inputs, 1..=2)?;
    if let Some(rank) = x.shape().rank() {
        if rank < 3 {
            return Err(LayerError::ValueError(
                "instance normalization expects spatial dimensions",
            ));
        }
    }
    Ok(PartialTensor::new(
        DataType::Float,
        refine_channel(x.shape(), &channel)?,
    ))
}

/// The output shape is the input's. When the rank is known the axis is
/// checked and the scale and bias shapes are unified with the normalized
/// suffix of the input shape.
pub(crate) fn infer_layer_norm(
    axis: i32,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let scale = inputs.require(1)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::new(DataType::Float, x.shape().clone()));
    };
    let axis = x.shape().axis(axis)?;
    let mut suffix = SymShape::from_dims(dims[axis..].to_vec());
    suffix = suffix.unify(scale.shape())?;
    if let Some(bias) = inputs.get(2) {
        suffix = suffix.unify(bias.shape())?;
    }
    let mut out = dims[..axis].to_vec();
    out.extend(suffix.dims().unwrap_or(&[]).iter().cloned());
    Ok(PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(out),
    ))
}

pub(crate) fn infer_lrn(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    if let Some(rank) = x.shape().rank() {
        if rank < 2 {
            return Err(LayerError::ValueError(
                "normalization expects an input with channels",
            ));
        }
    }
    Ok(PartialTensor::new(DataType::Float, x.shape().clone()))
}

/// Check that a per-channel parameter tensor is 1-D with one value per
/// channel of `x`.
fn check_channel_param(x: &Tensor<f32>, param: &Tensor<f32>) -> Result<(), LayerError> {
    if param.ndim() != 1 {
        return Err(LayerError::RankMismatch {
            expected: 1,
            actual: param.ndim(),
        });
    }
    if param.size(0) != x.size(1) {
        return Err(LayerError::ShapeMismatch(
            "normalization parameters must have one value per channel",
        ));
    }
    Ok(())
}

pub(crate) fn execute_batch_norm(
    epsilon: f32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    let scale = inputs.require_float(1)?;
    let bias = inputs.require_float(2)?;
    let mean = inputs.require_float(3)?;
    let var = inputs.require_float(4)?;
    if x.ndim() < 2 {
        return Err(LayerError::ValueError(
            "normalization expects an input with channels",
        ));
    }
    for param in [scale, bias, mean, var] {
        check_channel_param(x, param)?;
    }
    Ok(backend.batch_norm(x, scale, bias, mean, var, epsilon).into())
}

pub(crate) fn execute_instance_norm(
    epsilon: f32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    let scale = inputs.require_float(1)?;
    let bias = inputs.require_float(2)?;
    if x.ndim() < 3 {
        return Err(LayerError::ValueError(
            "instance normalization expects spatial dimensions",
        ));
    }
    check_channel_param(x, scale)?;
    check_channel_param(x, bias)?;
    Ok(backend.instance_norm(x, scale, bias, epsilon).into())
}

pub(crate) fn execute_layer_norm(
    axis: i32,
    epsilon: f32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    let scale = inputs.require_float(1)?;
    let bias = inputs.get_float(2)?;
    let axis = resolve_axis(x.ndim(), axis)?;
    let normalized = &x.shape()[axis..];
    if scale.shape() != normalized {
        return Err(LayerError::ShapeMismatch(
            "layer normalization scale must match the normalized dimensions",
        ));
    }
    if let Some(bias) = bias {
        if bias.shape() != normalized {
            return Err(LayerError::ShapeMismatch(
                "layer normalization bias must match the normalized dimensions",
            ));
        }
    }
    Ok(backend.layer_norm(x, scale, bias, axis, epsilon).into())
}

pub(crate) fn execute_lrn(
    alpha: f32,
    beta: f32,
    bias: f32,
    size: usize,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    if x.ndim() < 2 {
        return Err(LayerError::ValueError(
            "normalization expects an input with channels",
        ));
    }
    if size == 0 {
        return Err(LayerError::ValueError("lrn size must be positive"));
    }
    Ok(backend.lrn(x, alpha, beta, bias, size).into())
}
