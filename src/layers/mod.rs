//! The built-in layer catalog, grouped by operator family.
//!
//! Each family module defines the parameter structs for its layers plus the
//! partial-inference and execution entry points that [`Layer`](crate::Layer)
//! dispatches to. Helpers shared by several families live at the top level
//! of this module.

pub mod activation;
pub mod convolution;
pub mod custom;
pub mod indexing;
pub mod logical;
pub mod math;
pub mod normalization;
pub mod object_detection;
pub mod pooling;
pub mod random;
pub mod recurrent;
pub mod reduction;
pub mod transformation;
pub mod trigonometry;

pub use convolution::{Conv, ConvTranspose};
pub use custom::CustomLayer;
pub use object_detection::RoiAlign;
pub use pooling::{AveragePool, MaxPool};
pub use random::{
    Bernoulli, Multinomial, RandomNormal, RandomNormalLike, RandomSeed, RandomUniform,
    RandomUniformLike,
};
pub use recurrent::{Direction, LSTM};
pub use reduction::{ArgReduce, Reduce};

use crate::dim::{AutoPad, SymDim};
use crate::error::LayerError;

/// Resolve an axis, which may be negative and count from the back, to a
/// positive index in `[0, ndim)`.
pub fn resolve_axis(ndim: usize, axis: i32) -> Result<usize, LayerError> {
    let rank = ndim as i32;
    let resolved = if axis < 0 { axis + rank } else { axis };
    if resolved < 0 || resolved >= rank {
        Err(LayerError::AxisOutOfRange { axis, rank: ndim })
    } else {
        Ok(resolved as usize)
    }
}

/// Resolve a list of axes to positive indices in `[0, ndim)`.
pub fn resolve_axes(ndim: usize, axes: &[i32]) -> Result<Vec<usize>, LayerError> {
    axes.iter().map(|&axis| resolve_axis(ndim, axis)).collect()
}

/// Resolve an element index, which may be negative and count from the back,
/// to a positive offset in `[0, len)`.
pub fn resolve_index(len: usize, index: i32) -> Option<usize> {
    let len = len as i32;
    let resolved = if index < 0 { index + len } else { index };
    if resolved < 0 || resolved >= len {
        None
    } else {
        Some(resolved as usize)
    }
}

/// Compute the shape that two concrete shapes broadcast to under numpy
/// rules, right-aligned.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>, LayerError> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let ad = if a.len() + i >= rank { a[a.len() + i - rank] } else { 1 };
        let bd = if b.len() + i >= rank { b[b.len() + i - rank] } else { 1 };
        let dim = match (ad, bd) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => {
                return Err(LayerError::ShapeMismatch(
                    "shapes cannot be broadcast together",
                ))
            }
        };
        out.push(dim);
    }
    Ok(out)
}

/// Fill in a defaulted per-spatial-dim attribute such as strides or
/// dilations. An empty slice means "all `default`".
fn defaulted(values: &[usize], ndim: usize, default: usize) -> Result<Vec<usize>, LayerError> {
    if values.is_empty() {
        Ok(vec![default; ndim])
    } else if values.len() == ndim {
        Ok(values.to_vec())
    } else {
        Err(LayerError::ValueError(
            "attribute length does not match the spatial rank",
        ))
    }
}

/// Reject zero entries in a strides, dilations or kernel attribute.
fn positive(values: &[usize], what: &'static str) -> Result<(), LayerError> {
    if values.iter().any(|&value| value == 0) {
        Err(LayerError::ValueError(what))
    } else {
        Ok(())
    }
}

/// Split an explicit padding attribute laid out as `[starts..., ends...]`
/// into per-dim `(start, end)` pairs. An empty slice means no padding.
fn split_pads(pads: &[usize], ndim: usize) -> Result<Vec<(usize, usize)>, LayerError> {
    if pads.is_empty() {
        Ok(vec![(0, 0); ndim])
    } else if pads.len() == 2 * ndim {
        Ok((0..ndim).map(|i| (pads[i], pads[ndim + i])).collect())
    } else {
        Err(LayerError::ValueError(
            "padding length must be twice the spatial rank",
        ))
    }
}

/// Resolve per-dim `(start, end)` padding for a windowed op, honoring the
/// auto-pad policy. `windows` are effective window extents with dilation
/// applied, `(kernel - 1) * dilation + 1`.
fn resolve_window_pads(
    auto_pad: AutoPad,
    pads: &[usize],
    in_dims: &[usize],
    windows: &[usize],
    strides: &[usize],
) -> Result<Vec<(usize, usize)>, LayerError> {
    match auto_pad {
        AutoPad::NotSet => split_pads(pads, in_dims.len()),
        AutoPad::Valid => Ok(vec![(0, 0); in_dims.len()]),
        AutoPad::SameUpper | AutoPad::SameLower => Ok(in_dims
            .iter()
            .zip(windows.iter().zip(strides))
            .map(|(&size, (&window, &stride))| {
                let out_size = size.div_ceil(stride);
                let total = ((out_size - 1) * stride + window).saturating_sub(size);
                let smaller = total / 2;
                let larger = total - smaller;
                if auto_pad == AutoPad::SameUpper {
                    (smaller, larger)
                } else {
                    (larger, smaller)
                }
            })
            .collect()),
    }
}

/// Concrete output size of one pooled or convolved dim. Relies on the same
/// arithmetic as symbolic inference so the two passes cannot disagree.
fn pooled_out_size(
    in_size: usize,
    kernel: usize,
    stride: usize,
    pad_total: usize,
    dilation: usize,
    ceil_mode: bool,
) -> Result<usize, LayerError> {
    let dim = SymDim::Value(in_size as i32).pool(
        kernel as i32,
        stride as i32,
        pad_total as i32,
        dilation as i32,
        ceil_mode,
        AutoPad::NotSet,
    );
    match dim.as_value() {
        Some(size) if size >= 0 => Ok(size as usize),
        _ => Err(LayerError::ValueError(
            "pooling window is larger than the padded input",
        )),
    }
}
