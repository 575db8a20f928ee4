//! Layers that rearrange tensors without computing new values: reshapes,
//! slices, concatenation, padding and friends.

use parten_tensor::Tensor;

use crate::backend::{Backend, DepthToSpaceMode, PadMode, SliceRange};
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::{PartialElem, PartialTensor, MAX_PARTIAL_ELEMENTS};
use crate::shape::SymShape;
use crate::value::{DataType, Scalar, Value};

use super::{resolve_axes, resolve_axis};

/// Resolve an axis that may also point one past the last dimension, as
/// Flatten's split point does.
fn resolve_boundary_axis(rank: usize, axis: i32) -> Result<usize, LayerError> {
    let resolved = if axis < 0 { axis + rank as i32 } else { axis };
    if resolved < 0 || resolved > rank as i32 {
        return Err(LayerError::AxisOutOfRange { axis, rank });
    }
    Ok(resolved as usize)
}

fn check_permutation(rank: usize, perm: &[usize]) -> Result<(), LayerError> {
    if perm.len() != rank {
        return Err(LayerError::ValueError(
            "transpose permutation does not match the rank",
        ));
    }
    let mut seen = vec![false; rank];
    for &i in perm {
        if i >= rank || seen[i] {
            return Err(LayerError::ValueError("transpose permutation is invalid"));
        }
        seen[i] = true;
    }
    Ok(())
}

/// Read a 1-D int tensor as a concrete shape.
fn shape_from_input(input: &Value) -> Result<Vec<usize>, LayerError> {
    let t = input.as_int()?;
    if t.ndim() != 1 {
        return Err(LayerError::RankMismatch {
            expected: 1,
            actual: t.ndim(),
        });
    }
    t.data()
        .iter()
        .map(|&d| {
            if d < 0 {
                Err(LayerError::ValueError("shape entries must be >= 0"))
            } else {
                Ok(d as usize)
            }
        })
        .collect()
}

/// Resolve one slice range against a dimension of size `dim`, clamping
/// out-of-bounds endpoints the way numpy does.
pub(crate) fn resolve_slice_range(dim: usize, start: i32, end: i32, step: i32) -> SliceRange {
    let d = dim as i32;
    let norm = |v: i32| if v < 0 { v.saturating_add(d) } else { v };
    if step > 0 {
        let s = norm(start).clamp(0, d);
        let e = norm(end).clamp(0, d);
        let span = (e - s).max(0);
        SliceRange {
            start: s,
            step,
            len: ((span + step - 1) / step) as usize,
        }
    } else {
        if dim == 0 {
            return SliceRange { start: 0, step, len: 0 };
        }
        let s = norm(start).clamp(0, d - 1);
        let e = norm(end).clamp(-1, d - 1);
        let span = (s - e).max(0);
        SliceRange {
            start: s,
            step,
            len: ((span - step - 1) / -step) as usize,
        }
    }
}

fn resolve_slice(
    shape: &[usize],
    starts: &[i32],
    ends: &[i32],
    axes: Option<&[i32]>,
    steps: Option<&[i32]>,
) -> Result<Vec<SliceRange>, LayerError> {
    if starts.len() != ends.len() {
        return Err(LayerError::ValueError(
            "slice starts and ends must have the same length",
        ));
    }
    let resolved_axes: Vec<usize> = match axes {
        Some(axes) => {
            if axes.len() != starts.len() {
                return Err(LayerError::ValueError(
                    "slice axes must match the starts length",
                ));
            }
            resolve_axes(shape.len(), axes)?
        }
        None => {
            if starts.len() > shape.len() {
                return Err(LayerError::RankMismatch {
                    expected: shape.len(),
                    actual: starts.len(),
                });
            }
            (0..starts.len()).collect()
        }
    };
    let resolved_steps: Vec<i32> = match steps {
        Some(steps) => {
            if steps.len() != starts.len() {
                return Err(LayerError::ValueError(
                    "slice steps must match the starts length",
                ));
            }
            if steps.iter().any(|&s| s == 0) {
                return Err(LayerError::ValueError("slice step must be nonzero"));
            }
            steps.to_vec()
        }
        None => vec![1; starts.len()],
    };

    let mut ranges: Vec<SliceRange> = shape.iter().map(|&d| SliceRange::full(d)).collect();
    let mut seen = vec![false; shape.len()];
    for (k, &axis) in resolved_axes.iter().enumerate() {
        if seen[axis] {
            return Err(LayerError::ValueError("slice axes must be unique"));
        }
        seen[axis] = true;
        ranges[axis] = resolve_slice_range(shape[axis], starts[k], ends[k], resolved_steps[k]);
    }
    Ok(ranges)
}

pub(crate) fn infer_cast(to: DataType, inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    Ok(inputs.require(0)?.cast_to(to))
}

pub(crate) fn infer_identity(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    Ok(inputs.require(0)?.clone())
}

/// Shape's output is the value this module exists to track: a small int
/// vector holding the input's dimensions, symbolic entries included.
pub(crate) fn infer_shape(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    match x.shape().dims() {
        Some(dims) => Ok(PartialTensor::from_dims(dims)),
        None => Ok(PartialTensor::new(
            DataType::Int,
            SymShape::from_dims(vec![SymDim::Unknown]),
        )),
    }
}

pub(crate) fn infer_size(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    Ok(PartialTensor::from_elems(
        DataType::Int,
        SymShape::fixed(&[]),
        vec![PartialElem::from_dim(&x.shape().size())],
    ))
}

pub(crate) fn infer_constant_of_shape(
    value: Scalar,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let shape = inputs.require(0)?.to_shape();
    if let Some(sizes) = shape.to_concrete() {
        let len: usize = sizes.iter().product();
        if len <= MAX_PARTIAL_ELEMENTS {
            let elem = match value {
                Scalar::Float(v) => PartialElem::Float(v),
                Scalar::Int(v) => PartialElem::Int(v),
            };
            return Ok(PartialTensor::from_elems(value.dtype(), shape, vec![elem; len]));
        }
    }
    Ok(PartialTensor::new(value.dtype(), shape))
}

pub(crate) fn infer_expand(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let target = inputs.require(1)?.to_shape();
    Ok(PartialTensor::new(x.dtype(), x.shape().broadcast(&target)?))
}

pub(crate) fn infer_flatten(axis: i32, inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::new(x.dtype(), SymShape::unknown_of_rank(2)));
    };
    let axis = resolve_boundary_axis(dims.len(), axis)?;
    let product = |dims: &[SymDim]| {
        dims.iter()
            .fold(SymDim::Value(1), |acc, dim| acc * dim.clone())
    };
    let out = vec![product(&dims[..axis]), product(&dims[axis..])];
    Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn infer_transpose(
    perm: Option<&[usize]>,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(x.dtype()));
    };
    let out: Vec<SymDim> = match perm {
        Some(perm) => {
            check_permutation(dims.len(), perm)?;
            perm.iter().map(|&i| dims[i].clone()).collect()
        }
        None => dims.iter().rev().cloned().collect(),
    };
    Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn infer_reshape(
    allow_zero: bool,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let target = inputs.require(1)?;
    let target_shape = target.shape().declare_rank(1)?;

    let Some(entries) = target.elems() else {
        // The target's values are unknown, but its length still gives the
        // output rank.
        return Ok(match target_shape.dim(0).as_value() {
            Some(rank) => PartialTensor::new(x.dtype(), SymShape::unknown_of_rank(rank as usize)),
            None => PartialTensor::unknown(x.dtype()),
        });
    };

    let mut dims: Vec<SymDim> = Vec::with_capacity(entries.len());
    let mut wildcard = None;
    let mut literal_zero = false;
    for (i, entry) in entries.iter().enumerate() {
        match entry {
            PartialElem::Int(-1) => {
                if wildcard.is_some() {
                    return Err(LayerError::ValueError(
                        "reshape may have at most one -1 entry",
                    ));
                }
                wildcard = Some(i);
                dims.push(SymDim::Unknown);
            }
            PartialElem::Int(0) if !allow_zero => dims.push(x.shape().dim(i)),
            PartialElem::Int(n) if *n >= 0 => {
                literal_zero |= *n == 0;
                dims.push(SymDim::Value(*n));
            }
            PartialElem::Int(_) => {
                return Err(LayerError::ValueError("reshape entries must be >= -1"))
            }
            PartialElem::Param(name) => dims.push(SymDim::Param(name.clone())),
            PartialElem::Float(_) | PartialElem::Unknown => dims.push(SymDim::Unknown),
        }
    }

    if let Some(w) = wildcard {
        if literal_zero {
            return Err(LayerError::ValueError(
                "reshape cannot infer -1 alongside a zero dimension",
            ));
        }
        let others = dims
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != w)
            .fold(SymDim::Value(1), |acc, (_, dim)| acc * dim.clone());
        let total = x.shape().size();
        match (total.as_value(), others.as_value()) {
            (Some(total), Some(others)) if others > 0 && total % others == 0 => {
                dims[w] = SymDim::Value(total / others);
            }
            (_, Some(1)) => dims[w] = total,
            _ => {}
        }
    }

    Ok(x.reshaped(SymShape::from_dims(dims)))
}

pub(crate) fn infer_squeeze(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(x.dtype()));
    };
    match inputs.get(1) {
        Some(axes_input) => {
            let Some(axes) = axes_input.as_i32s() else {
                return Ok(PartialTensor::unknown(x.dtype()));
            };
            let mut resolved = resolve_axes(dims.len(), &axes)?;
            resolved.sort_unstable();
            resolved.dedup();
            let mut out = Vec::with_capacity(dims.len());
            for (i, dim) in dims.iter().enumerate() {
                if resolved.binary_search(&i).is_ok() {
                    if dim.as_value().is_some_and(|d| d != 1) {
                        return Err(LayerError::ShapeMismatch(
                            "squeezed dimension must have size 1",
                        ));
                    }
                } else {
                    out.push(dim.clone());
                }
            }
            Ok(x.reshaped(SymShape::from_dims(out)))
        }
        // Without axes every size-1 dimension goes, which requires knowing
        // them all.
        None => {
            if dims.iter().all(|dim| dim.as_value().is_some()) {
                let out = dims
                    .iter()
                    .filter(|dim| dim.as_value() != Some(1))
                    .cloned()
                    .collect();
                Ok(x.reshaped(SymShape::from_dims(out)))
            } else {
                Ok(PartialTensor::unknown(x.dtype()))
            }
        }
    }
}

pub(crate) fn infer_unsqueeze(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let axes_input = inputs.require(1)?;
    let (Some(dims), Some(axes)) = (x.shape().dims(), axes_input.as_i32s()) else {
        return Ok(PartialTensor::unknown(x.dtype()));
    };
    let out_rank = dims.len() + axes.len();
    let mut resolved = resolve_axes(out_rank, &axes)?;
    resolved.sort_unstable();
    if resolved.windows(2).any(|w| w[0] == w[1]) {
        return Err(LayerError::ValueError("unsqueeze axes must be unique"));
    }
    let mut out = dims.to_vec();
    for &axis in &resolved {
        out.insert(axis, SymDim::Value(1));
    }
    Ok(x.reshaped(SymShape::from_dims(out)))
}

pub(crate) fn infer_concat(axis: i32, inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let first = inputs.require(0)?;
    let mut rank = None;
    for i in 0..inputs.len() {
        if let Some(r) = inputs.require(i)?.shape().rank() {
            match rank {
                Some(existing) if existing != r => {
                    return Err(LayerError::RankMismatch {
                        expected: existing,
                        actual: r,
                    })
                }
                _ => rank = Some(r),
            }
        }
    }
    let Some(rank) = rank else {
        return Ok(PartialTensor::unknown(first.dtype()));
    };
    let axis = resolve_axis(rank, axis)?;

    let mut out = vec![SymDim::Unknown; rank];
    let mut axis_dim = SymDim::Value(0);
    for i in 0..inputs.len() {
        let shape = inputs.require(i)?.shape().declare_rank(rank)?;
        axis_dim = axis_dim + shape.dim(axis);
        for (j, dim) in out.iter_mut().enumerate() {
            if j != axis {
                *dim = dim.max_defined(&shape.dim(j));
            }
        }
    }
    out[axis] = axis_dim;
    let shape = SymShape::from_dims(out);

    // Concatenating tracked vectors tracks the result, which is how shape
    // fragments get glued back together.
    if rank == 1 {
        let mut elems = Vec::new();
        let mut tracked = true;
        for i in 0..inputs.len() {
            match inputs.require(i)?.elems() {
                Some(part) => elems.extend(part.iter().cloned()),
                None => {
                    tracked = false;
                    break;
                }
            }
        }
        if tracked && elems.len() <= MAX_PARTIAL_ELEMENTS && shape.is_fully_known() {
            return Ok(PartialTensor::from_elems(first.dtype(), shape, elems));
        }
    }

    Ok(PartialTensor::new(first.dtype(), shape))
}

pub(crate) fn infer_slice(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(x.dtype()));
    };
    let rank = dims.len();

    let starts = inputs.require(1)?.as_i32s();
    let ends = inputs.require(2)?.as_i32s();
    let axes = match inputs.get(3) {
        None => Some(None),
        Some(t) => t.as_i32s().map(Some),
    };
    let steps = match inputs.get(4) {
        None => Some(None),
        Some(t) => t.as_i32s().map(Some),
    };
    let (Some(starts), Some(ends), Some(axes), Some(steps)) = (starts, ends, axes, steps) else {
        return Ok(PartialTensor::new(x.dtype(), SymShape::unknown_of_rank(rank)));
    };

    if starts.len() != ends.len() {
        return Err(LayerError::ValueError(
            "slice starts and ends must have the same length",
        ));
    }
    let resolved_axes: Vec<usize> = match axes {
        Some(axes) => {
            if axes.len() != starts.len() {
                return Err(LayerError::ValueError(
                    "slice axes must match the starts length",
                ));
            }
            resolve_axes(rank, &axes)?
        }
        None => {
            if starts.len() > rank {
                return Err(LayerError::RankMismatch {
                    expected: rank,
                    actual: starts.len(),
                });
            }
            (0..starts.len()).collect()
        }
    };
    let resolved_steps = match steps {
        Some(steps) => {
            if steps.iter().any(|&s| s == 0) {
                return Err(LayerError::ValueError("slice step must be nonzero"));
            }
            steps
        }
        None => vec![1; starts.len()],
    };

    let mut out = dims.to_vec();
    let mut axis_params: Vec<Option<(i32, i32, i32)>> = vec![None; rank];
    for (k, &axis) in resolved_axes.iter().enumerate() {
        let (start, end, step) = (starts[k], ends[k], resolved_steps[k]);
        axis_params[axis] = Some((start, end, step));
        out[axis] = match dims[axis].as_value() {
            Some(d) => {
                SymDim::Value(resolve_slice_range(d as usize, start, end, step).len as i32)
            }
            // A full-range slice leaves a symbolic dimension alone.
            None if start == 0 && step == 1 && end == i32::MAX => dims[axis].clone(),
            None => SymDim::Unknown,
        };
    }

    if rank == 1 && x.is_partially_known() {
        if let Some(d) = dims[0].as_value() {
            let (start, end, step) = axis_params[0].unwrap_or((0, i32::MAX, 1));
            let range = resolve_slice_range(d as usize, start, end, step);
            let elems = (0..range.len)
                .map(|i| x.elem((range.start + i as i32 * range.step) as usize).clone())
                .collect();
            return Ok(PartialTensor::from_elems(
                x.dtype(),
                SymShape::from_dims(out),
                elems,
            ));
        }
    }

    Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn infer_pad(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let pads_input = inputs.require(1)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(x.dtype()));
    };
    let Some(pads) = pads_input.as_i32s() else {
        return Ok(PartialTensor::new(
            x.dtype(),
            SymShape::unknown_of_rank(dims.len()),
        ));
    };
    if pads.len() != dims.len() * 2 {
        return Err(LayerError::ValueError(
            "padding length must be twice the rank",
        ));
    }
    if pads.iter().any(|&p| p < 0) {
        return Err(LayerError::ValueError("negative padding is not supported"));
    }
    let out = dims
        .iter()
        .enumerate()
        .map(|(i, dim)| dim.clone() + SymDim::Value(pads[i] + pads[i + dims.len()]))
        .collect();
    Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn infer_tile(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let repeats_input = inputs.require(1)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(x.dtype()));
    };
    let Some(repeats) = repeats_input.as_i32s() else {
        return Ok(PartialTensor::new(
            x.dtype(),
            SymShape::unknown_of_rank(dims.len()),
        ));
    };
    if repeats.len() != dims.len() {
        return Err(LayerError::ValueError(
            "repeats length must match the rank",
        ));
    }
    if repeats.iter().any(|&r| r < 0) {
        return Err(LayerError::ValueError("repeats must be >= 0"));
    }
    let out = dims
        .iter()
        .zip(&repeats)
        .map(|(dim, &rep)| dim.clone() * SymDim::Value(rep))
        .collect();
    Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn infer_split(
    axis: i32,
    n_outputs: usize,
    inputs: &PartialInputs,
) -> Result<Vec<PartialTensor>, LayerError> {
    let x = inputs.require(0)?;
    let Some(dims) = x.shape().dims() else {
        return Ok(vec![PartialTensor::unknown(x.dtype()); n_outputs]);
    };
    let axis = resolve_axis(dims.len(), axis)?;

    let piece = |size: SymDim| {
        let mut out = dims.to_vec();
        out[axis] = size;
        PartialTensor::new(x.dtype(), SymShape::from_dims(out))
    };

    match inputs.get(1) {
        Some(sizes_input) => match sizes_input.as_i32s() {
            Some(sizes) => {
                if sizes.len() != n_outputs {
                    return Err(LayerError::ValueError(
                        "split sizes must match the output count",
                    ));
                }
                if sizes.iter().any(|&s| s < 0) {
                    return Err(LayerError::ValueError("split sizes must be >= 0"));
                }
                if let Some(d) = dims[axis].as_value() {
                    if sizes.iter().sum::<i32>() != d {
                        return Err(LayerError::ValueError(
                            "split sizes must sum to the split dimension",
                        ));
                    }
                }
                Ok(sizes.iter().map(|&s| piece(SymDim::Value(s))).collect())
            }
            None => Ok((0..n_outputs).map(|_| piece(SymDim::Unknown)).collect()),
        },
        None => match dims[axis].as_value() {
            Some(d) => {
                let n = n_outputs as i32;
                if n == 0 {
                    return Err(LayerError::ValueError("split requires at least one output"));
                }
                let chunk = (d + n - 1) / n;
                let last = d - chunk * (n - 1);
                if last < 0 {
                    return Err(LayerError::ValueError(
                        "input cannot be split into this many chunks",
                    ));
                }
                Ok((0..n_outputs)
                    .map(|i| {
                        piece(SymDim::Value(if i + 1 == n_outputs { last } else { chunk }))
                    })
                    .collect())
            }
            None => Ok((0..n_outputs).map(|_| piece(SymDim::Unknown)).collect()),
        },
    }
}

pub(crate) fn infer_trilu(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    Ok(PartialTensor::new(x.dtype(), x.shape().clone()))
}

pub(crate) fn infer_depth_to_space(
    block_size: usize,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let shape = x.shape().declare_rank(4)?;
    let b = block_size as i32;
    let channels = match shape.dim(1).as_value() {
        Some(c) if c % (b * b) == 0 => SymDim::Value(c / (b * b)),
        Some(_) => {
            return Err(LayerError::ValueError(
                "channel count must be divisible by the squared block size",
            ))
        }
        None => SymDim::Unknown,
    };
    let out = vec![
        shape.dim(0),
        channels,
        shape.dim(2) * SymDim::Value(b),
        shape.dim(3) * SymDim::Value(b),
    ];
    Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn infer_space_to_depth(
    block_size: usize,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let shape = x.shape().declare_rank(4)?;
    let b = block_size as i32;
    let spatial = |dim: SymDim| match dim.as_value() {
        Some(d) if d % b == 0 => Ok(SymDim::Value(d / b)),
        Some(_) => Err(LayerError::ValueError(
            "spatial dimensions must be divisible by the block size",
        )),
        None => Ok(SymDim::Unknown),
    };
    let out = vec![
        shape.dim(0),
        shape.dim(1) * SymDim::Value(b * b),
        spatial(shape.dim(2))?,
        spatial(shape.dim(3))?,
    ];
    Ok(PartialTensor::new(x.dtype(), SymShape::from_dims(out)))
}

pub(crate) fn execute_cast(
    to: DataType,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    Ok(backend.cast(inputs.require(0)?, to))
}

pub(crate) fn execute_identity(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    match inputs.require(0)? {
        Value::Float(src) => {
            let mut dest = backend.alloc(src.shape(), DataType::Float).into_float()?;
            backend.mem_copy_float(src, &mut dest);
            Ok(dest.into())
        }
        Value::Int(src) => {
            let mut dest = backend.alloc(src.shape(), DataType::Int).into_int()?;
            backend.mem_copy_int(src, &mut dest);
            Ok(dest.into())
        }
    }
}

pub(crate) fn execute_shape(inputs: &Inputs) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let dims: Vec<i32> = x.shape().iter().map(|&d| d as i32).collect();
    Ok(Tensor::from_data(&[dims.len()], dims).into())
}

pub(crate) fn execute_size(inputs: &Inputs) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    Ok(Tensor::scalar(x.len() as i32).into())
}

pub(crate) fn execute_constant_of_shape(
    value: Scalar,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let shape = shape_from_input(inputs.require(0)?)?;
    let mut out = backend.alloc(&shape, value.dtype());
    match &mut out {
        Value::Float(t) => backend.mem_set_float(t, value.to_f32()),
        Value::Int(t) => backend.mem_set_int(t, value.to_i32()),
    }
    Ok(out)
}

pub(crate) fn execute_expand(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let target = shape_from_input(inputs.require(1)?)?;
    let out_shape = super::broadcast_shapes(x.shape(), &target)?;
    match x {
        Value::Float(t) => Ok(backend.expand_float(t, &out_shape).into()),
        Value::Int(t) => Ok(backend.expand_int(t, &out_shape).into()),
    }
}

pub(crate) fn execute_flatten(
    axis: i32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let axis = resolve_boundary_axis(x.ndim(), axis)?;
    let head: usize = x.shape()[..axis].iter().product();
    let tail: usize = x.shape()[axis..].iter().product();
    match x {
        Value::Float(t) => Ok(backend.reshape_float(t, &[head, tail]).into()),
        Value::Int(t) => Ok(backend.reshape_int(t, &[head, tail]).into()),
    }
}

fn resolve_reshape(
    in_shape: &[usize],
    entries: &[i32],
    allow_zero: bool,
) -> Result<Vec<usize>, LayerError> {
    let mut out = Vec::with_capacity(entries.len());
    let mut wildcard = None;
    for (i, &entry) in entries.iter().enumerate() {
        match entry {
            -1 => {
                if wildcard.is_some() {
                    return Err(LayerError::ValueError(
                        "reshape may have at most one -1 entry",
                    ));
                }
                wildcard = Some(i);
                out.push(1);
            }
            0 if !allow_zero => {
                let Some(&d) = in_shape.get(i) else {
                    return Err(LayerError::ValueError(
                        "reshape 0 entry has no matching input dimension",
                    ));
                };
                out.push(d);
            }
            n if n >= 0 => out.push(n as usize),
            _ => return Err(LayerError::ValueError("reshape entries must be >= -1")),
        }
    }

    let in_len: usize = in_shape.iter().product();
    if let Some(w) = wildcard {
        let rest: usize = out.iter().product();
        if rest == 0 {
            return Err(LayerError::ValueError(
                "reshape cannot infer -1 alongside a zero dimension",
            ));
        }
        if in_len % rest != 0 {
            return Err(LayerError::ShapeMismatch(
                "reshape size does not match the input",
            ));
        }
        out[w] = in_len / rest;
    } else if out.iter().product::<usize>() != in_len {
        return Err(LayerError::ShapeMismatch(
            "reshape size does not match the input",
        ));
    }
    Ok(out)
}

pub(crate) fn execute_reshape(
    allow_zero: bool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let target = inputs.require_int(1)?;
    if target.ndim() != 1 {
        return Err(LayerError::RankMismatch {
            expected: 1,
            actual: target.ndim(),
        });
    }
    let out_shape = resolve_reshape(x.shape(), target.data(), allow_zero)?;
    match x {
        Value::Float(t) => Ok(backend.reshape_float(t, &out_shape).into()),
        Value::Int(t) => Ok(backend.reshape_int(t, &out_shape).into()),
    }
}

pub(crate) fn execute_transpose(
    perm: Option<&[usize]>,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let resolved: Vec<usize> = match perm {
        Some(perm) => {
            check_permutation(x.ndim(), perm)?;
            perm.to_vec()
        }
        None => (0..x.ndim()).rev().collect(),
    };
    match x {
        Value::Float(t) => Ok(backend.transpose_float(t, &resolved).into()),
        Value::Int(t) => Ok(backend.transpose_int(t, &resolved).into()),
    }
}

pub(crate) fn execute_squeeze(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let out_shape = match inputs.get_int(1)? {
        Some(axes) => {
            let mut resolved = resolve_axes(x.ndim(), axes.data())?;
            resolved.sort_unstable();
            resolved.dedup();
            let mut out = Vec::with_capacity(x.ndim());
            for (i, &d) in x.shape().iter().enumerate() {
                if resolved.binary_search(&i).is_ok() {
                    if d != 1 {
                        return Err(LayerError::ShapeMismatch(
                            "squeezed dimension must have size 1",
                        ));
                    }
                } else {
                    out.push(d);
                }
            }
            out
        }
        None => x.shape().iter().copied().filter(|&d| d != 1).collect(),
    };
    match x {
        Value::Float(t) => Ok(backend.reshape_float(t, &out_shape).into()),
        Value::Int(t) => Ok(backend.reshape_int(t, &out_shape).into()),
    }
}

pub(crate) fn execute_unsqueeze(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let axes = inputs.require_int(1)?;
    let out_rank = x.ndim() + axes.len();
    let mut resolved = resolve_axes(out_rank, axes.data())?;
    resolved.sort_unstable();
    if resolved.windows(2).any(|w| w[0] == w[1]) {
        return Err(LayerError::ValueError("unsqueeze axes must be unique"));
    }
    let mut out_shape = x.shape().to_vec();
    for &axis in &resolved {
        out_shape.insert(axis, 1);
    }
    match x {
        Value::Float(t) => Ok(backend.reshape_float(t, &out_shape).into()),
        Value::Int(t) => Ok(backend.reshape_int(t, &out_shape).into()),
    }
}

fn check_concat_shapes(shapes: &[&[usize]], axis: usize) -> Result<(), LayerError> {
    let first = shapes[0];
    for shape in &shapes[1..] {
        if shape.len() != first.len() {
            return Err(LayerError::RankMismatch {
                expected: first.len(),
                actual: shape.len(),
            });
        }
        for (j, (&a, &b)) in first.iter().zip(shape.iter()).enumerate() {
            if j != axis && a != b {
                return Err(LayerError::ShapeMismatch(
                    "concat inputs must match away from the concatenation axis",
                ));
            }
        }
    }
    Ok(())
}

pub(crate) fn execute_concat(
    axis: i32,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let first = inputs.require(0)?;
    let axis = resolve_axis(first.ndim(), axis)?;
    match first {
        Value::Float(_) => {
            let mut parts = Vec::with_capacity(inputs.len());
            for i in 0..inputs.len() {
                parts.push(inputs.require_float(i)?);
            }
            let shapes: Vec<&[usize]> = parts.iter().map(|t| t.shape()).collect();
            check_concat_shapes(&shapes, axis)?;
            Ok(backend.concat_float(&parts, axis).into())
        }
        Value::Int(_) => {
            let mut parts = Vec::with_capacity(inputs.len());
            for i in 0..inputs.len() {
                parts.push(inputs.require_int(i)?);
            }
            let shapes: Vec<&[usize]> = parts.iter().map(|t| t.shape()).collect();
            check_concat_shapes(&shapes, axis)?;
            Ok(backend.concat_int(&parts, axis).into())
        }
    }
}

pub(crate) fn execute_slice(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let starts = inputs.require_int(1)?.data().to_vec();
    let ends = inputs.require_int(2)?.data().to_vec();
    let axes: Option<Vec<i32>> = inputs.get_int(3)?.map(|t| t.data().to_vec());
    let steps: Option<Vec<i32>> = inputs.get_int(4)?.map(|t| t.data().to_vec());
    let ranges = resolve_slice(x.shape(), &starts, &ends, axes.as_deref(), steps.as_deref())?;
    match x {
        Value::Float(t) => Ok(backend.slice_float(t, &ranges).into()),
        Value::Int(t) => Ok(backend.slice_int(t, &ranges).into()),
    }
}

pub(crate) fn execute_pad(
    mode: PadMode,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let pads = inputs.require_int(1)?.data();
    if pads.len() != x.ndim() * 2 {
        return Err(LayerError::ValueError(
            "padding length must be twice the rank",
        ));
    }
    if pads.iter().any(|&p| p < 0) {
        return Err(LayerError::ValueError("negative padding is not supported"));
    }
    let pairs: Vec<(usize, usize)> = (0..x.ndim())
        .map(|i| (pads[i] as usize, pads[i + x.ndim()] as usize))
        .collect();
    match x {
        Value::Float(t) => {
            let value = inputs.get_scalar_float(2)?.unwrap_or(0.);
            Ok(backend.pad_float(t, &pairs, mode, value).into())
        }
        Value::Int(t) => {
            let value = inputs.get_scalar_int(2)?.unwrap_or(0);
            Ok(backend.pad_int(t, &pairs, mode, value).into())
        }
    }
}

pub(crate) fn execute_tile(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let repeats = inputs.require_int(1)?;
    if repeats.ndim() != 1 {
        return Err(LayerError::RankMismatch {
            expected: 1,
            actual: repeats.ndim(),
        });
    }
    if repeats.len() != x.ndim() {
        return Err(LayerError::ValueError(
            "repeats length must match the rank",
        ));
    }
    if repeats.data().iter().any(|&r| r < 0) {
        return Err(LayerError::ValueError("repeats must be >= 0"));
    }
    let repeats: Vec<usize> = repeats.data().iter().map(|&r| r as usize).collect();
    match x {
        Value::Float(t) => Ok(backend.tile_float(t, &repeats).into()),
        Value::Int(t) => Ok(backend.tile_int(t, &repeats).into()),
    }
}

pub(crate) fn execute_split(
    axis: i32,
    n_outputs: usize,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Vec<Value>, LayerError> {
    let x = inputs.require(0)?;
    let axis = resolve_axis(x.ndim(), axis)?;
    let dim = x.shape()[axis];

    let sizes: Vec<usize> = match inputs.get_int(1)? {
        Some(sizes) => {
            let sizes = sizes.data();
            if sizes.len() != n_outputs {
                return Err(LayerError::ValueError(
                    "split sizes must match the output count",
                ));
            }
            if sizes.iter().any(|&s| s < 0) {
                return Err(LayerError::ValueError("split sizes must be >= 0"));
            }
            if sizes.iter().sum::<i32>() as usize != dim {
                return Err(LayerError::ValueError(
                    "split sizes must sum to the split dimension",
                ));
            }
            sizes.iter().map(|&s| s as usize).collect()
        }
        None => {
            if n_outputs == 0 {
                return Err(LayerError::ValueError("split requires at least one output"));
            }
            let chunk = (dim + n_outputs - 1) / n_outputs;
            let last = dim as i64 - chunk as i64 * (n_outputs as i64 - 1);
            if last < 0 {
                return Err(LayerError::ValueError(
                    "input cannot be split into this many chunks",
                ));
            }
            let mut sizes = vec![chunk; n_outputs - 1];
            sizes.push(last as usize);
            sizes
        }
    };

    match x {
        Value::Float(t) => Ok(backend
            .split_float(t, axis, &sizes)
            .into_iter()
            .map(Value::from)
            .collect()),
        Value::Int(t) => Ok(backend
            .split_int(t, axis, &sizes)
            .into_iter()
            .map(Value::from)
            .collect()),
    }
}

pub(crate) fn execute_trilu(
    upper: bool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    if x.ndim() < 2 {
        return Err(LayerError::RankMismatch {
            expected: 2,
            actual: x.ndim(),
        });
    }
    let k = inputs.get_scalar_int(1)?.unwrap_or(0);
    match x {
        Value::Float(t) => Ok(backend.trilu_float(t, k, upper).into()),
        Value::Int(t) => Ok(backend.trilu_int(t, k, upper).into()),
    }
}

pub(crate) fn execute_depth_to_space(
    block_size: usize,
    mode: DepthToSpaceMode,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    if x.ndim() != 4 {
        return Err(LayerError::RankMismatch {
            expected: 4,
            actual: x.ndim(),
        });
    }
    if block_size == 0 {
        return Err(LayerError::ValueError("block size must be >= 1"));
    }
    if x.size(1) % (block_size * block_size) != 0 {
        return Err(LayerError::ValueError(
            "channel count must be divisible by the squared block size",
        ));
    }
    Ok(backend.depth_to_space(x, block_size, mode).into())
}

pub(crate) fn execute_space_to_depth(
    block_size: usize,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    if x.ndim() != 4 {
        return Err(LayerError::RankMismatch {
            expected: 4,
            actual: x.ndim(),
        });
    }
    if block_size == 0 {
        return Err(LayerError::ValueError("block size must be >= 1"));
    }
    if x.size(2) % block_size != 0 || x.size(3) % block_size != 0 {
        return Err(LayerError::ValueError(
            "spatial dimensions must be divisible by the block size",
        ));
    }
    Ok(backend.space_to_depth(x, block_size).into())
}
