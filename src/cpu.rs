//! The reference backend.
//!
//! Every kernel here allocates a fresh output and walks elements with plain
//! index arithmetic. The layer tests run against this implementation, so it
//! doubles as the baseline for checking faster backends.

use fastrand_contrib::RngExt;
use parten_tensor::Tensor;

use crate::backend::{
    ArgReduceOp, Backend, BinaryFloatOp, BinaryIntOp, CompareOp, DepthToSpaceMode, PadMode,
    ReduceOp, RoiAlignMode, ScatterReduction, SliceRange, UnaryFloatOp, UnaryIntOp,
};
use crate::value::{DataType, Value};

/// Visit every index of `shape` in row-major order.
fn for_each_index(shape: &[usize], mut visit: impl FnMut(&[usize])) {
    let len: usize = shape.iter().product();
    let mut index = vec![0; shape.len()];
    for _ in 0..len {
        visit(&index);
        for dim in (0..shape.len()).rev() {
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}

/// Collect every index of `shape` in row-major order.
fn index_list(shape: &[usize]) -> Vec<Vec<usize>> {
    let mut all = Vec::with_capacity(shape.iter().product());
    for_each_index(shape, |index| all.push(index.to_vec()));
    all
}

/// Linear offset into a buffer of `shape` for `index`, which indexes a
/// broadcast result with at least as many dimensions. Dimensions of size 1
/// absorb any index, and missing leading dimensions are implicit size 1.
fn shape_offset(shape: &[usize], index: &[usize]) -> usize {
    let base = index.len() - shape.len();
    let mut offset = 0;
    let mut stride = 1;
    for dim in (0..shape.len()).rev() {
        let i = if shape[dim] == 1 { 0 } else { index[base + dim] };
        offset += i * stride;
        stride *= shape[dim];
    }
    offset
}

fn broadcast_get<T: Copy>(t: &Tensor<T>, index: &[usize]) -> T {
    t.data()[shape_offset(t.shape(), index)]
}

fn binary_map<T: Copy, U>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    out_shape: &[usize],
    f: impl Fn(T, T) -> U,
) -> Tensor<U> {
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(out_shape, |index| {
        out.push(f(broadcast_get(a, index), broadcast_get(b, index)));
    });
    Tensor::from_data(out_shape, out)
}

/// Split `shape` into the element counts before, at and after `axis`.
fn axis_split(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

fn normalize_index(index: i32, dim: usize) -> usize {
    if index < 0 {
        (index + dim as i32) as usize
    } else {
        index as usize
    }
}

/// The error function, evaluated in double precision.
///
/// Small arguments use the Maclaurin series, which converges quickly there;
/// larger ones go through a rational approximation of erfc whose relative
/// error stays below 1.2e-7 where erfc is already small.
fn erf(x: f32) -> f32 {
    let xd = x as f64;
    if xd.abs() <= 1.5 {
        let mut term = xd;
        let mut sum = xd;
        for n in 1..30 {
            term *= -xd * xd / n as f64;
            sum += term / (2 * n + 1) as f64;
        }
        (sum * std::f64::consts::FRAC_2_SQRT_PI) as f32
    } else {
        (xd.signum() * (1.0 - erfc_tail(xd.abs()))) as f32
    }
}

/// Rational approximation of erfc for `x > 1.5`.
fn erfc_tail(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.5 * x);
    t * (-x * x - 1.26551223
        + t * (1.00002368
            + t * (0.37409196
                + t * (0.09678418
                    + t * (-0.18628806
                        + t * (0.27886807
                            + t * (-1.13520398
                                + t * (1.48851587 + t * (-0.82215223 + t * 0.17087277)))))))))
        .exp()
}

fn unary_float(op: UnaryFloatOp, x: f32) -> f32 {
    use UnaryFloatOp::*;
    match op {
        Abs => x.abs(),
        Acos => x.acos(),
        Asin => x.asin(),
        Atan => x.atan(),
        Ceil => x.ceil(),
        Celu { alpha } => x.max(0.) + (alpha * ((x / alpha).exp() - 1.)).min(0.),
        Clip { min, max } => {
            let mut y = x;
            if let Some(min) = min {
                y = y.max(min);
            }
            if let Some(max) = max {
                y = y.min(max);
            }
            y
        }
        Cos => x.cos(),
        Cosh => x.cosh(),
        Elu { alpha } => {
            if x >= 0. {
                x
            } else {
                alpha * (x.exp() - 1.)
            }
        }
        Erf => erf(x),
        Exp => x.exp(),
        Floor => x.floor(),
        Gelu => 0.5 * x * (1. + erf(x / std::f32::consts::SQRT_2)),
        HardSigmoid { alpha, beta } => (alpha * x + beta).clamp(0., 1.),
        HardSwish => x * (x / 6. + 0.5).clamp(0., 1.),
        LeakyRelu { alpha } => {
            if x >= 0. {
                x
            } else {
                alpha * x
            }
        }
        Log => x.ln(),
        Neg => -x,
        Reciprocal => 1. / x,
        Relu => x.max(0.),
        Round => x.round_ties_even(),
        Selu { alpha, gamma } => {
            if x > 0. {
                gamma * x
            } else {
                gamma * alpha * (x.exp() - 1.)
            }
        }
        Sigmoid => 1. / (1. + (-x).exp()),
        Sign => {
            if x > 0. {
                1.
            } else if x < 0. {
                -1.
            } else {
                0.
            }
        }
        Sin => x.sin(),
        Sinh => x.sinh(),
        Softplus => x.exp().ln_1p(),
        Softsign => x / (1. + x.abs()),
        Sqrt => x.sqrt(),
        Tan => x.tan(),
        Tanh => x.tanh(),
    }
}

fn unary_int(op: UnaryIntOp, x: i32) -> i32 {
    use UnaryIntOp::*;
    match op {
        Abs => x.abs(),
        Clip { min, max } => {
            let mut y = x;
            if let Some(min) = min {
                y = y.max(min);
            }
            if let Some(max) = max {
                y = y.min(max);
            }
            y
        }
        Neg => -x,
        Not => (x == 0) as i32,
        Relu => x.max(0),
        Sign => x.signum(),
    }
}

fn binary_float(op: BinaryFloatOp, a: f32, b: f32) -> f32 {
    use BinaryFloatOp::*;
    match op {
        Add => a + b,
        Div => a / b,
        Max => a.max(b),
        Min => a.min(b),
        Mod { fmod: true } => a % b,
        Mod { fmod: false } => ((a % b) + b) % b,
        Mul => a * b,
        Pow => a.powf(b),
        PRelu => {
            if a >= 0. {
                a
            } else {
                b * a
            }
        }
        Sub => a - b,
    }
}

fn binary_int(op: BinaryIntOp, a: i32, b: i32) -> i32 {
    use BinaryIntOp::*;
    match op {
        Add => a + b,
        And => (a != 0 && b != 0) as i32,
        Div => a / b,
        Max => a.max(b),
        Min => a.min(b),
        Mod { fmod: true } => a % b,
        Mod { fmod: false } => ((a % b) + b) % b,
        Mul => a * b,
        Or => (a != 0 || b != 0) as i32,
        Pow => a.pow(b.max(0) as u32),
        Sub => a - b,
        Xor => ((a != 0) != (b != 0)) as i32,
    }
}

fn compare<T: Copy + PartialOrd>(op: CompareOp, a: T, b: T) -> i32 {
    let result = match op {
        CompareOp::Equal => a == b,
        CompareOp::Greater => a > b,
        CompareOp::GreaterOrEqual => a >= b,
        CompareOp::Less => a < b,
        CompareOp::LessOrEqual => a <= b,
    };
    result as i32
}

fn where_map<T: Copy>(
    cond: &Tensor<i32>,
    x: &Tensor<T>,
    y: &Tensor<T>,
    out_shape: &[usize],
) -> Tensor<T> {
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(out_shape, |index| {
        let value = if broadcast_get(cond, index) != 0 {
            broadcast_get(x, index)
        } else {
            broadcast_get(y, index)
        };
        out.push(value);
    });
    Tensor::from_data(out_shape, out)
}

fn cum_sum<T: Copy + Default + std::ops::Add<Output = T>>(
    x: &Tensor<T>,
    axis: usize,
    exclusive: bool,
    reverse: bool,
) -> Tensor<T> {
    let (outer, n, inner) = axis_split(x.shape(), axis);
    let mut out = vec![T::default(); x.len()];
    for o in 0..outer {
        for i in 0..inner {
            let offset = |j: usize| (o * n + j) * inner + i;
            let mut sum = T::default();
            let steps: Box<dyn Iterator<Item = usize>> = if reverse {
                Box::new((0..n).rev())
            } else {
                Box::new(0..n)
            };
            for j in steps {
                let value = x.data()[offset(j)];
                if exclusive {
                    out[offset(j)] = sum;
                    sum = sum + value;
                } else {
                    sum = sum + value;
                    out[offset(j)] = sum;
                }
            }
        }
    }
    Tensor::from_data(x.shape(), out)
}

/// The output shape of a reduction, and the input shape with reduced dims
/// kept as size 1 for offset mapping.
fn reduce_shapes(shape: &[usize], axes: &[usize], keep_dims: bool) -> (Vec<usize>, Vec<usize>) {
    let reduced: Vec<bool> = if axes.is_empty() {
        vec![true; shape.len()]
    } else {
        (0..shape.len()).map(|d| axes.contains(&d)).collect()
    };
    let kept: Vec<usize> = shape
        .iter()
        .zip(&reduced)
        .map(|(&d, &r)| if r { 1 } else { d })
        .collect();
    let out = if keep_dims {
        kept.clone()
    } else {
        shape
            .iter()
            .zip(&reduced)
            .filter(|(_, &r)| !r)
            .map(|(&d, _)| d)
            .collect()
    };
    (out, kept)
}

fn arg_reduce<T: Copy + PartialOrd>(
    op: ArgReduceOp,
    x: &Tensor<T>,
    axis: usize,
    keep_dims: bool,
    select_last: bool,
) -> Tensor<i32> {
    let (outer, n, inner) = axis_split(x.shape(), axis);
    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let mut best = x.data()[o * n * inner + i];
            let mut best_index = 0;
            for j in 1..n {
                let value = x.data()[(o * n + j) * inner + i];
                let wins = match op {
                    ArgReduceOp::Max => value > best || (select_last && value == best),
                    ArgReduceOp::Min => value < best || (select_last && value == best),
                };
                if wins {
                    best = value;
                    best_index = j;
                }
            }
            out.push(best_index as i32);
        }
    }
    let mut out_shape = x.shape().to_vec();
    if keep_dims {
        out_shape[axis] = 1;
    } else {
        out_shape.remove(axis);
    }
    Tensor::from_data(&out_shape, out)
}

fn transpose<T: Copy>(x: &Tensor<T>, perm: &[usize]) -> Tensor<T> {
    let out_shape: Vec<usize> = perm.iter().map(|&d| x.size(d)).collect();
    let mut in_index = vec![0; x.ndim()];
    let mut out = Vec::with_capacity(x.len());
    for_each_index(&out_shape, |index| {
        for (dim, &p) in perm.iter().enumerate() {
            in_index[p] = index[dim];
        }
        out.push(x.data()[x.offset(&in_index)]);
    });
    Tensor::from_data(&out_shape, out)
}

fn slice<T: Copy>(x: &Tensor<T>, ranges: &[SliceRange]) -> Tensor<T> {
    let out_shape: Vec<usize> = ranges.iter().map(|r| r.len).collect();
    let mut in_index = vec![0; x.ndim()];
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(&out_shape, |index| {
        for (dim, range) in ranges.iter().enumerate() {
            in_index[dim] = (range.start + index[dim] as i32 * range.step) as usize;
        }
        out.push(x.data()[x.offset(&in_index)]);
    });
    Tensor::from_data(&out_shape, out)
}

fn pad<T: Copy>(x: &Tensor<T>, pads: &[(usize, usize)], mode: PadMode, value: T) -> Tensor<T> {
    let out_shape: Vec<usize> = x
        .shape()
        .iter()
        .zip(pads)
        .map(|(&d, &(start, end))| d + start + end)
        .collect();
    let mut in_index = vec![0; x.ndim()];
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(&out_shape, |index| {
        let mut in_bounds = true;
        for dim in 0..x.ndim() {
            let size = x.size(dim) as i32;
            let mut coord = index[dim] as i32 - pads[dim].0 as i32;
            if coord < 0 || coord >= size {
                match mode {
                    PadMode::Constant => {
                        in_bounds = false;
                        break;
                    }
                    PadMode::Edge => coord = coord.clamp(0, size - 1),
                    PadMode::Reflect => {
                        while coord < 0 || coord >= size {
                            if coord < 0 {
                                coord = -coord;
                            } else {
                                coord = 2 * (size - 1) - coord;
                            }
                        }
                    }
                }
            }
            in_index[dim] = coord as usize;
        }
        out.push(if in_bounds {
            x.data()[x.offset(&in_index)]
        } else {
            value
        });
    });
    Tensor::from_data(&out_shape, out)
}

fn tile<T: Copy>(x: &Tensor<T>, repeats: &[usize]) -> Tensor<T> {
    let out_shape: Vec<usize> = x
        .shape()
        .iter()
        .zip(repeats)
        .map(|(&d, &r)| d * r)
        .collect();
    let mut in_index = vec![0; x.ndim()];
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(&out_shape, |index| {
        for dim in 0..x.ndim() {
            in_index[dim] = index[dim] % x.size(dim);
        }
        out.push(x.data()[x.offset(&in_index)]);
    });
    Tensor::from_data(&out_shape, out)
}

fn concat<T: Copy>(inputs: &[&Tensor<T>], axis: usize) -> Tensor<T> {
    let mut out_shape = inputs[0].shape().to_vec();
    out_shape[axis] = inputs.iter().map(|t| t.size(axis)).sum();
    let (outer, _, inner) = axis_split(&out_shape, axis);
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for o in 0..outer {
        for t in inputs {
            let block = t.size(axis) * inner;
            out.extend_from_slice(&t.data()[o * block..(o + 1) * block]);
        }
    }
    Tensor::from_data(&out_shape, out)
}

fn split<T: Copy>(x: &Tensor<T>, axis: usize, sizes: &[usize]) -> Vec<Tensor<T>> {
    let (outer, n, inner) = axis_split(x.shape(), axis);
    let mut start = 0;
    sizes
        .iter()
        .map(|&size| {
            let mut out_shape = x.shape().to_vec();
            out_shape[axis] = size;
            let mut out = Vec::with_capacity(outer * size * inner);
            for o in 0..outer {
                let offset = (o * n + start) * inner;
                out.extend_from_slice(&x.data()[offset..offset + size * inner]);
            }
            start += size;
            Tensor::from_data(&out_shape, out)
        })
        .collect()
}

fn expand<T: Copy>(x: &Tensor<T>, out_shape: &[usize]) -> Tensor<T> {
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(out_shape, |index| out.push(broadcast_get(x, index)));
    Tensor::from_data(out_shape, out)
}

fn trilu<T: Copy + Default>(x: &Tensor<T>, k: i32, upper: bool) -> Tensor<T> {
    let ndim = x.ndim();
    let mut out = Vec::with_capacity(x.len());
    for_each_index(x.shape(), |index| {
        let row = index[ndim - 2] as i32;
        let col = index[ndim - 1] as i32;
        let keep = if upper { col >= row + k } else { col <= row + k };
        out.push(if keep {
            x.data()[x.offset(index)]
        } else {
            T::default()
        });
    });
    Tensor::from_data(x.shape(), out)
}

fn one_hot<T: Copy>(
    indices: &Tensor<i32>,
    depth: usize,
    axis: usize,
    off: T,
    on: T,
) -> Tensor<T> {
    let mut out_shape = indices.shape().to_vec();
    out_shape.insert(axis, depth);
    let mut idx_index = vec![0; indices.ndim()];
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(&out_shape, |index| {
        for dim in 0..indices.ndim() {
            idx_index[dim] = if dim < axis { index[dim] } else { index[dim + 1] };
        }
        let hot = indices.data()[indices.offset(&idx_index)] == index[axis] as i32;
        out.push(if hot { on } else { off });
    });
    Tensor::from_data(&out_shape, out)
}

fn non_zero<T: Copy, F: Fn(T) -> bool>(x: &Tensor<T>, nonzero: F) -> Tensor<i32> {
    let mut coords: Vec<Vec<usize>> = Vec::new();
    for_each_index(x.shape(), |index| {
        if nonzero(x.data()[x.offset(index)]) {
            coords.push(index.to_vec());
        }
    });
    let count = coords.len();
    let mut out = vec![0; x.ndim() * count];
    for (i, coord) in coords.iter().enumerate() {
        for dim in 0..x.ndim() {
            out[dim * count + i] = coord[dim] as i32;
        }
    }
    Tensor::from_data(&[x.ndim(), count], out)
}

fn gather<T: Copy>(x: &Tensor<T>, indices: &Tensor<i32>, axis: usize) -> Tensor<T> {
    let (outer, n, inner) = axis_split(x.shape(), axis);
    let mut out_shape = x.shape()[..axis].to_vec();
    out_shape.extend_from_slice(indices.shape());
    out_shape.extend_from_slice(&x.shape()[axis + 1..]);
    let mut out = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &index in indices.data() {
            let j = normalize_index(index, n);
            let offset = (o * n + j) * inner;
            out.extend_from_slice(&x.data()[offset..offset + inner]);
        }
    }
    Tensor::from_data(&out_shape, out)
}

fn gather_elements<T: Copy>(x: &Tensor<T>, indices: &Tensor<i32>, axis: usize) -> Tensor<T> {
    let mut in_index = vec![0; x.ndim()];
    let mut out = Vec::with_capacity(indices.len());
    for_each_index(indices.shape(), |index| {
        in_index.copy_from_slice(index);
        let j = indices.data()[indices.offset(index)];
        in_index[axis] = normalize_index(j, x.size(axis));
        out.push(x.data()[x.offset(&in_index)]);
    });
    Tensor::from_data(indices.shape(), out)
}

fn gather_nd<T: Copy>(x: &Tensor<T>, indices: &Tensor<i32>, batch_dims: usize) -> Tensor<T> {
    let k = indices.size(indices.ndim() - 1);
    let row_shape = &indices.shape()[..indices.ndim() - 1];
    let tail = &x.shape()[batch_dims + k..];
    let tail_len: usize = tail.iter().product();
    let x_strides = x.strides();

    let mut out_shape = row_shape.to_vec();
    out_shape.extend_from_slice(tail);
    let mut out = Vec::with_capacity(out_shape.iter().product());
    for_each_index(row_shape, |row| {
        let row_base = shape_offset(row_shape, row) * k;
        let mut offset = 0;
        for dim in 0..batch_dims {
            offset += row[dim] * x_strides[dim];
        }
        for dim in 0..k {
            let j = normalize_index(indices.data()[row_base + dim], x.size(batch_dims + dim));
            offset += j * x_strides[batch_dims + dim];
        }
        out.extend_from_slice(&x.data()[offset..offset + tail_len]);
    });
    Tensor::from_data(&out_shape, out)
}

fn scatter_combine_float(reduction: ScatterReduction, old: f32, update: f32) -> f32 {
    match reduction {
        ScatterReduction::None => update,
        ScatterReduction::Add => old + update,
        ScatterReduction::Mul => old * update,
        ScatterReduction::Min => old.min(update),
        ScatterReduction::Max => old.max(update),
    }
}

fn scatter_combine_int(reduction: ScatterReduction, old: i32, update: i32) -> i32 {
    match reduction {
        ScatterReduction::None => update,
        ScatterReduction::Add => old + update,
        ScatterReduction::Mul => old * update,
        ScatterReduction::Min => old.min(update),
        ScatterReduction::Max => old.max(update),
    }
}

fn scatter_elements<T: Copy>(
    x: &Tensor<T>,
    indices: &Tensor<i32>,
    updates: &Tensor<T>,
    axis: usize,
    combine: impl Fn(T, T) -> T,
) -> Tensor<T> {
    let mut out = x.clone();
    let mut out_index = vec![0; x.ndim()];
    for_each_index(indices.shape(), |index| {
        out_index.copy_from_slice(index);
        let j = indices.data()[indices.offset(index)];
        out_index[axis] = normalize_index(j, x.size(axis));
        let offset = out.offset(&out_index);
        let update = updates.data()[updates.offset(index)];
        out.data_mut()[offset] = combine(out.data()[offset], update);
    });
    out
}

fn scatter_nd<T: Copy>(
    x: &Tensor<T>,
    indices: &Tensor<i32>,
    updates: &Tensor<T>,
    combine: impl Fn(T, T) -> T,
) -> Tensor<T> {
    let k = indices.size(indices.ndim() - 1);
    let row_shape = &indices.shape()[..indices.ndim() - 1];
    let tail_len: usize = x.shape()[k..].iter().product();
    let x_strides = x.strides();

    let mut out = x.clone();
    let mut row_index = 0;
    for_each_index(row_shape, |_| {
        let mut offset = 0;
        for dim in 0..k {
            let j = normalize_index(indices.data()[row_index * k + dim], x.size(dim));
            offset += j * x_strides[dim];
        }
        for i in 0..tail_len {
            let update = updates.data()[row_index * tail_len + i];
            out.data_mut()[offset + i] = combine(out.data()[offset + i], update);
        }
        row_index += 1;
    });
    out
}

fn top_k<T: Copy>(
    x: &Tensor<T>,
    k: usize,
    axis: usize,
    largest: bool,
    sorted: bool,
    compare: impl Fn(&T, &T) -> std::cmp::Ordering,
) -> (Tensor<T>, Tensor<i32>) {
    let (outer, n, inner) = axis_split(x.shape(), axis);
    let mut values = Vec::with_capacity(outer * k * inner);
    let mut indices = Vec::with_capacity(outer * k * inner);
    for o in 0..outer {
        for i in 0..inner {
            let mut lane: Vec<(T, usize)> = (0..n)
                .map(|j| (x.data()[(o * n + j) * inner + i], j))
                .collect();
            lane.sort_by(|a, b| {
                let order = compare(&a.0, &b.0);
                let order = if largest { order.reverse() } else { order };
                order.then(a.1.cmp(&b.1))
            });
            lane.truncate(k);
            if !sorted {
                lane.sort_by_key(|&(_, j)| j);
            }
            // Lanes interleave when inner > 1, so stage into the output via
            // explicit offsets below.
            values.push(lane.iter().map(|&(v, _)| v).collect::<Vec<T>>());
            indices.push(lane.iter().map(|&(_, j)| j as i32).collect::<Vec<i32>>());
        }
    }
    let mut out_shape = x.shape().to_vec();
    out_shape[axis] = k;
    let mut out_values = Vec::with_capacity(outer * k * inner);
    let mut out_indices = Vec::with_capacity(outer * k * inner);
    for o in 0..outer {
        for j in 0..k {
            for i in 0..inner {
                out_values.push(values[o * inner + i][j]);
                out_indices.push(indices[o * inner + i][j]);
            }
        }
    }
    (
        Tensor::from_data(&out_shape, out_values),
        Tensor::from_data(&out_shape, out_indices),
    )
}

/// Bilinear sample of a `[H, W]` plane at fractional coordinates, with the
/// sample-point handling used by RoiAlign: points more than one pixel
/// outside the plane contribute zero, the rest clamp to the border.
fn bilinear_sample(plane: &[f32], height: usize, width: usize, y: f32, x: f32) -> f32 {
    if y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
        return 0.;
    }
    let y = y.clamp(0., height as f32 - 1.);
    let x = x.clamp(0., width as f32 - 1.);
    let y_low = y.floor() as usize;
    let x_low = x.floor() as usize;
    let y_high = (y_low + 1).min(height - 1);
    let x_high = (x_low + 1).min(width - 1);
    let ly = y - y_low as f32;
    let lx = x - x_low as f32;
    let top = plane[y_low * width + x_low] * (1. - lx) + plane[y_low * width + x_high] * lx;
    let bottom = plane[y_high * width + x_low] * (1. - lx) + plane[y_high * width + x_high] * lx;
    top * (1. - ly) + bottom * ly
}

/// The reference backend. [`Backend`] documents the kernel contracts.
#[derive(Clone, Debug, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> CpuBackend {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    fn alloc(&mut self, shape: &[usize], dtype: DataType) -> Value {
        match dtype {
            DataType::Float => Value::Float(Tensor::zeros(shape)),
            DataType::Int => Value::Int(Tensor::zeros(shape)),
        }
    }

    fn mem_set_float(&mut self, x: &mut Tensor<f32>, value: f32) {
        x.data_mut().fill(value);
    }

    fn mem_set_int(&mut self, x: &mut Tensor<i32>, value: i32) {
        x.data_mut().fill(value);
    }

    fn mem_copy_float(&mut self, src: &Tensor<f32>, dest: &mut Tensor<f32>) {
        dest.data_mut().copy_from_slice(src.data());
    }

    fn mem_copy_int(&mut self, src: &Tensor<i32>, dest: &mut Tensor<i32>) {
        dest.data_mut().copy_from_slice(src.data());
    }

    fn unary_float(&mut self, op: UnaryFloatOp, x: &Tensor<f32>) -> Tensor<f32> {
        x.map(|&v| unary_float(op, v))
    }

    fn unary_int(&mut self, op: UnaryIntOp, x: &Tensor<i32>) -> Tensor<i32> {
        x.map(|&v| unary_int(op, v))
    }

    fn binary_float(
        &mut self,
        op: BinaryFloatOp,
        a: &Tensor<f32>,
        b: &Tensor<f32>,
        out_shape: &[usize],
    ) -> Tensor<f32> {
        binary_map(a, b, out_shape, |a, b| binary_float(op, a, b))
    }

    fn binary_int(
        &mut self,
        op: BinaryIntOp,
        a: &Tensor<i32>,
        b: &Tensor<i32>,
        out_shape: &[usize],
    ) -> Tensor<i32> {
        binary_map(a, b, out_shape, |a, b| binary_int(op, a, b))
    }

    fn compare_float(
        &mut self,
        op: CompareOp,
        a: &Tensor<f32>,
        b: &Tensor<f32>,
        out_shape: &[usize],
    ) -> Tensor<i32> {
        binary_map(a, b, out_shape, |a, b| compare(op, a, b))
    }

    fn compare_int(
        &mut self,
        op: CompareOp,
        a: &Tensor<i32>,
        b: &Tensor<i32>,
        out_shape: &[usize],
    ) -> Tensor<i32> {
        binary_map(a, b, out_shape, |a, b| compare(op, a, b))
    }

    fn where_float(
        &mut self,
        cond: &Tensor<i32>,
        x: &Tensor<f32>,
        y: &Tensor<f32>,
        out_shape: &[usize],
    ) -> Tensor<f32> {
        where_map(cond, x, y, out_shape)
    }

    fn where_int(
        &mut self,
        cond: &Tensor<i32>,
        x: &Tensor<i32>,
        y: &Tensor<i32>,
        out_shape: &[usize],
    ) -> Tensor<i32> {
        where_map(cond, x, y, out_shape)
    }

    fn is_inf(
        &mut self,
        x: &Tensor<f32>,
        detect_negative: bool,
        detect_positive: bool,
    ) -> Tensor<i32> {
        x.map(|&v| {
            let hit = (v == f32::INFINITY && detect_positive)
                || (v == f32::NEG_INFINITY && detect_negative);
            hit as i32
        })
    }

    fn is_nan(&mut self, x: &Tensor<f32>) -> Tensor<i32> {
        x.map(|&v| v.is_nan() as i32)
    }

    fn cast(&mut self, x: &Value, to: DataType) -> Value {
        match (x, to) {
            (Value::Float(t), DataType::Int) => Value::Int(t.map(|&v| v as i32)),
            (Value::Int(t), DataType::Float) => Value::Float(t.map(|&v| v as f32)),
            (Value::Float(t), DataType::Float) => Value::Float(t.clone()),
            (Value::Int(t), DataType::Int) => Value::Int(t.clone()),
        }
    }

    fn softmax(&mut self, x: &Tensor<f32>, axis: usize) -> Tensor<f32> {
        let (outer, n, inner) = axis_split(x.shape(), axis);
        let mut out = vec![0.; x.len()];
        for o in 0..outer {
            for i in 0..inner {
                let offset = |j: usize| (o * n + j) * inner + i;
                let max = (0..n).map(|j| x.data()[offset(j)]).fold(f32::MIN, f32::max);
                let sum: f32 = (0..n).map(|j| (x.data()[offset(j)] - max).exp()).sum();
                for j in 0..n {
                    out[offset(j)] = (x.data()[offset(j)] - max).exp() / sum;
                }
            }
        }
        Tensor::from_data(x.shape(), out)
    }

    fn log_softmax(&mut self, x: &Tensor<f32>, axis: usize) -> Tensor<f32> {
        let (outer, n, inner) = axis_split(x.shape(), axis);
        let mut out = vec![0.; x.len()];
        for o in 0..outer {
            for i in 0..inner {
                let offset = |j: usize| (o * n + j) * inner + i;
                let max = (0..n).map(|j| x.data()[offset(j)]).fold(f32::MIN, f32::max);
                let sum: f32 = (0..n).map(|j| (x.data()[offset(j)] - max).exp()).sum();
                for j in 0..n {
                    out[offset(j)] = x.data()[offset(j)] - max - sum.ln();
                }
            }
        }
        Tensor::from_data(x.shape(), out)
    }

    fn cum_sum_float(
        &mut self,
        x: &Tensor<f32>,
        axis: usize,
        exclusive: bool,
        reverse: bool,
    ) -> Tensor<f32> {
        cum_sum(x, axis, exclusive, reverse)
    }

    fn cum_sum_int(
        &mut self,
        x: &Tensor<i32>,
        axis: usize,
        exclusive: bool,
        reverse: bool,
    ) -> Tensor<i32> {
        cum_sum(x, axis, exclusive, reverse)
    }

    fn reduce_float(
        &mut self,
        op: ReduceOp,
        x: &Tensor<f32>,
        axes: &[usize],
        keep_dims: bool,
    ) -> Tensor<f32> {
        use ReduceOp::*;
        let (out_shape, kept) = reduce_shapes(x.shape(), axes, keep_dims);
        let count = x.len() / kept.iter().product::<usize>().max(1);
        let (init, fold): (f32, fn(f32, f32) -> f32) = match op {
            Sum | Mean | LogSum => (0., |acc, v| acc + v),
            L1 => (0., |acc, v| acc + v.abs()),
            L2 | SumSquare => (0., |acc, v| acc + v * v),
            LogSumExp => (0., |acc, v| acc + v.exp()),
            Prod => (1., |acc, v| acc * v),
            Max => (f32::NEG_INFINITY, f32::max),
            Min => (f32::INFINITY, f32::min),
        };
        let mut acc = vec![init; kept.iter().product()];
        for_each_index(x.shape(), |index| {
            let offset = shape_offset(&kept, index);
            acc[offset] = fold(acc[offset], x.data()[x.offset(index)]);
        });
        let data = acc
            .into_iter()
            .map(|a| match op {
                Mean => a / count as f32,
                L2 => a.sqrt(),
                LogSum | LogSumExp => a.ln(),
                _ => a,
            })
            .collect();
        Tensor::from_data(&out_shape, data)
    }

    fn reduce_int(
        &mut self,
        op: ReduceOp,
        x: &Tensor<i32>,
        axes: &[usize],
        keep_dims: bool,
    ) -> Tensor<i32> {
        use ReduceOp::*;
        let (out_shape, kept) = reduce_shapes(x.shape(), axes, keep_dims);
        let count = x.len() / kept.iter().product::<usize>().max(1);
        let (init, fold): (i32, fn(i32, i32) -> i32) = match op {
            Sum | Mean => (0, |acc, v| acc + v),
            L1 => (0, |acc, v| acc + v.abs()),
            SumSquare => (0, |acc, v| acc + v * v),
            Prod => (1, |acc, v| acc * v),
            Max => (i32::MIN, i32::max),
            Min => (i32::MAX, i32::min),
            // Callers reject int inputs for the transcendental reductions.
            L2 | LogSum | LogSumExp => unreachable!("float-only reduction"),
        };
        let mut acc = vec![init; kept.iter().product()];
        for_each_index(x.shape(), |index| {
            let offset = shape_offset(&kept, index);
            acc[offset] = fold(acc[offset], x.data()[x.offset(index)]);
        });
        let data = acc
            .into_iter()
            .map(|a| match op {
                Mean => a / count as i32,
                _ => a,
            })
            .collect();
        Tensor::from_data(&out_shape, data)
    }

    fn arg_reduce_float(
        &mut self,
        op: ArgReduceOp,
        x: &Tensor<f32>,
        axis: usize,
        keep_dims: bool,
        select_last: bool,
    ) -> Tensor<i32> {
        arg_reduce(op, x, axis, keep_dims, select_last)
    }

    fn arg_reduce_int(
        &mut self,
        op: ArgReduceOp,
        x: &Tensor<i32>,
        axis: usize,
        keep_dims: bool,
        select_last: bool,
    ) -> Tensor<i32> {
        arg_reduce(op, x, axis, keep_dims, select_last)
    }

    fn reshape_float(&mut self, x: &Tensor<f32>, shape: &[usize]) -> Tensor<f32> {
        x.clone().into_shape(shape)
    }

    fn reshape_int(&mut self, x: &Tensor<i32>, shape: &[usize]) -> Tensor<i32> {
        x.clone().into_shape(shape)
    }

    fn transpose_float(&mut self, x: &Tensor<f32>, perm: &[usize]) -> Tensor<f32> {
        transpose(x, perm)
    }

    fn transpose_int(&mut self, x: &Tensor<i32>, perm: &[usize]) -> Tensor<i32> {
        transpose(x, perm)
    }

    fn slice_float(&mut self, x: &Tensor<f32>, ranges: &[SliceRange]) -> Tensor<f32> {
        slice(x, ranges)
    }

    fn slice_int(&mut self, x: &Tensor<i32>, ranges: &[SliceRange]) -> Tensor<i32> {
        slice(x, ranges)
    }

    fn pad_float(
        &mut self,
        x: &Tensor<f32>,
        pads: &[(usize, usize)],
        mode: PadMode,
        value: f32,
    ) -> Tensor<f32> {
        pad(x, pads, mode, value)
    }

    fn pad_int(
        &mut self,
        x: &Tensor<i32>,
        pads: &[(usize, usize)],
        mode: PadMode,
        value: i32,
    ) -> Tensor<i32> {
        pad(x, pads, mode, value)
    }

    fn tile_float(&mut self, x: &Tensor<f32>, repeats: &[usize]) -> Tensor<f32> {
        tile(x, repeats)
    }

    fn tile_int(&mut self, x: &Tensor<i32>, repeats: &[usize]) -> Tensor<i32> {
        tile(x, repeats)
    }

    fn concat_float(&mut self, inputs: &[&Tensor<f32>], axis: usize) -> Tensor<f32> {
        concat(inputs, axis)
    }

    fn concat_int(&mut self, inputs: &[&Tensor<i32>], axis: usize) -> Tensor<i32> {
        concat(inputs, axis)
    }

    fn split_float(&mut self, x: &Tensor<f32>, axis: usize, sizes: &[usize]) -> Vec<Tensor<f32>> {
        split(x, axis, sizes)
    }

    fn split_int(&mut self, x: &Tensor<i32>, axis: usize, sizes: &[usize]) -> Vec<Tensor<i32>> {
        split(x, axis, sizes)
    }

    fn expand_float(&mut self, x: &Tensor<f32>, out_shape: &[usize]) -> Tensor<f32> {
        expand(x, out_shape)
    }

    fn expand_int(&mut self, x: &Tensor<i32>, out_shape: &[usize]) -> Tensor<i32> {
        expand(x, out_shape)
    }

    fn trilu_float(&mut self, x: &Tensor<f32>, k: i32, upper: bool) -> Tensor<f32> {
        trilu(x, k, upper)
    }

    fn trilu_int(&mut self, x: &Tensor<i32>, k: i32, upper: bool) -> Tensor<i32> {
        trilu(x, k, upper)
    }

    fn depth_to_space(
        &mut self,
        x: &Tensor<f32>,
        block_size: usize,
        mode: DepthToSpaceMode,
    ) -> Tensor<f32> {
        let (n, c, h, w) = (x.size(0), x.size(1), x.size(2), x.size(3));
        let out_c = c / (block_size * block_size);
        let out_shape = [n, out_c, h * block_size, w * block_size];
        let mut out = Vec::with_capacity(x.len());
        for_each_index(&out_shape, |index| {
            let (bh, bw) = (index[2] % block_size, index[3] % block_size);
            let in_c = match mode {
                DepthToSpaceMode::Dcr => (bh * block_size + bw) * out_c + index[1],
                DepthToSpaceMode::Crd => index[1] * block_size * block_size + bh * block_size + bw,
            };
            out.push(x[[index[0], in_c, index[2] / block_size, index[3] / block_size]]);
        });
        Tensor::from_data(&out_shape, out)
    }

    fn space_to_depth(&mut self, x: &Tensor<f32>, block_size: usize) -> Tensor<f32> {
        let (n, c, h, w) = (x.size(0), x.size(1), x.size(2), x.size(3));
        let out_shape = [
            n,
            c * block_size * block_size,
            h / block_size,
            w / block_size,
        ];
        let mut out = Vec::with_capacity(x.len());
        for_each_index(&out_shape, |index| {
            let block = index[1] / c;
            let (bh, bw) = (block / block_size, block % block_size);
            out.push(x[[
                index[0],
                index[1] % c,
                index[2] * block_size + bh,
                index[3] * block_size + bw,
            ]]);
        });
        Tensor::from_data(&out_shape, out)
    }

    fn range_float(&mut self, start: f32, limit: f32, delta: f32) -> Tensor<f32> {
        let count = (((limit - start) / delta).ceil()).max(0.) as usize;
        Tensor::from_vec((0..count).map(|i| start + i as f32 * delta).collect())
    }

    fn range_int(&mut self, start: i32, limit: i32, delta: i32) -> Tensor<i32> {
        let count = (((limit - start) as f64 / delta as f64).ceil()).max(0.) as usize;
        Tensor::from_vec((0..count).map(|i| start + i as i32 * delta).collect())
    }

    fn one_hot_float(
        &mut self,
        indices: &Tensor<i32>,
        depth: usize,
        axis: usize,
        off: f32,
        on: f32,
    ) -> Tensor<f32> {
        one_hot(indices, depth, axis, off, on)
    }

    fn one_hot_int(
        &mut self,
        indices: &Tensor<i32>,
        depth: usize,
        axis: usize,
        off: i32,
        on: i32,
    ) -> Tensor<i32> {
        one_hot(indices, depth, axis, off, on)
    }

    fn non_zero_float(&mut self, x: &Tensor<f32>) -> Tensor<i32> {
        non_zero(x, |v| v != 0.)
    }

    fn non_zero_int(&mut self, x: &Tensor<i32>) -> Tensor<i32> {
        non_zero(x, |v| v != 0)
    }

    fn gather_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        axis: usize,
    ) -> Tensor<f32> {
        gather(x, indices, axis)
    }

    fn gather_int(&mut self, x: &Tensor<i32>, indices: &Tensor<i32>, axis: usize) -> Tensor<i32> {
        gather(x, indices, axis)
    }

    fn gather_elements_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        axis: usize,
    ) -> Tensor<f32> {
        gather_elements(x, indices, axis)
    }

    fn gather_elements_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        axis: usize,
    ) -> Tensor<i32> {
        gather_elements(x, indices, axis)
    }

    fn gather_nd_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        batch_dims: usize,
    ) -> Tensor<f32> {
        gather_nd(x, indices, batch_dims)
    }

    fn gather_nd_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        batch_dims: usize,
    ) -> Tensor<i32> {
        gather_nd(x, indices, batch_dims)
    }

    fn scatter_elements_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        updates: &Tensor<f32>,
        axis: usize,
        reduction: ScatterReduction,
    ) -> Tensor<f32> {
        scatter_elements(x, indices, updates, axis, |old, update| {
            scatter_combine_float(reduction, old, update)
        })
    }

    fn scatter_elements_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        updates: &Tensor<i32>,
        axis: usize,
        reduction: ScatterReduction,
    ) -> Tensor<i32> {
        scatter_elements(x, indices, updates, axis, |old, update| {
            scatter_combine_int(reduction, old, update)
        })
    }

    fn scatter_nd_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        updates: &Tensor<f32>,
        reduction: ScatterReduction,
    ) -> Tensor<f32> {
        scatter_nd(x, indices, updates, |old, update| {
            scatter_combine_float(reduction, old, update)
        })
    }

    fn scatter_nd_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        updates: &Tensor<i32>,
        reduction: ScatterReduction,
    ) -> Tensor<i32> {
        scatter_nd(x, indices, updates, |old, update| {
            scatter_combine_int(reduction, old, update)
        })
    }

    fn top_k_float(
        &mut self,
        x: &Tensor<f32>,
        k: usize,
        axis: usize,
        largest: bool,
        sorted: bool,
    ) -> (Tensor<f32>, Tensor<i32>) {
        top_k(x, k, axis, largest, sorted, |a, b| a.total_cmp(b))
    }

    fn top_k_int(
        &mut self,
        x: &Tensor<i32>,
        k: usize,
        axis: usize,
        largest: bool,
        sorted: bool,
    ) -> (Tensor<i32>, Tensor<i32>) {
        top_k(x, k, axis, largest, sorted, |a, b| a.cmp(b))
    }

    fn matmul(&mut self, a: &Tensor<f32>, b: &Tensor<f32>, out_shape: &[usize]) -> Tensor<f32> {
        let rank = out_shape.len();
        let (m, n) = (out_shape[rank - 2], out_shape[rank - 1]);
        let k = a.size(a.ndim() - 1);
        let batch = &out_shape[..rank - 2];
        let a_batch = &a.shape()[..a.ndim() - 2];
        let b_batch = &b.shape()[..b.ndim() - 2];
        let mut out = Vec::with_capacity(out_shape.iter().product());
        for_each_index(batch, |index| {
            let a_base = shape_offset(a_batch, index) * m * k;
            let b_base = shape_offset(b_batch, index) * k * n;
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.;
                    for q in 0..k {
                        sum += a.data()[a_base + i * k + q] * b.data()[b_base + q * n + j];
                    }
                    out.push(sum);
                }
            }
        });
        Tensor::from_data(out_shape, out)
    }

    fn matmul_2d(
        &mut self,
        a: &Tensor<f32>,
        b: &Tensor<f32>,
        transpose_a: bool,
        transpose_b: bool,
    ) -> Tensor<f32> {
        let m = if transpose_a { a.size(1) } else { a.size(0) };
        let k = if transpose_a { a.size(0) } else { a.size(1) };
        let n = if transpose_b { b.size(0) } else { b.size(1) };
        let mut out = Vec::with_capacity(m * n);
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.;
                for q in 0..k {
                    let a_v = if transpose_a { a[[q, i]] } else { a[[i, q]] };
                    let b_v = if transpose_b { b[[j, q]] } else { b[[q, j]] };
                    sum += a_v * b_v;
                }
                out.push(sum);
            }
        }
        Tensor::from_data(&[m, n], out)
    }

    fn dense(
        &mut self,
        x: &Tensor<f32>,
        w: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
    ) -> Tensor<f32> {
        let in_width = w.size(0);
        let out_width = w.size(1);
        let rows = x.len() / in_width.max(1);
        let mut out = Vec::with_capacity(rows * out_width);
        for i in 0..rows {
            for j in 0..out_width {
                let mut sum = bias.map(|b| b.data()[j]).unwrap_or(0.);
                for q in 0..in_width {
                    sum += x.data()[i * in_width + q] * w[[q, j]];
                }
                out.push(sum);
            }
        }
        let mut out_shape = x.shape()[..x.ndim() - 1].to_vec();
        out_shape.push(out_width);
        Tensor::from_data(&out_shape, out)
    }

    fn conv(
        &mut self,
        x: &Tensor<f32>,
        w: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
        groups: usize,
        strides: &[usize],
        pads: &[(usize, usize)],
        dilations: &[usize],
        out_shape: &[usize],
    ) -> Tensor<f32> {
        let spatial = strides.len();
        let in_c_per_group = x.size(1) / groups;
        let out_c_per_group = out_shape[1] / groups;
        let kernel_positions = index_list(&w.shape()[2..]);
        let mut x_index = vec![0; x.ndim()];
        let mut w_index = vec![0; w.ndim()];
        let mut out = Vec::with_capacity(out_shape.iter().product());
        for_each_index(out_shape, |index| {
            let oc = index[1];
            let group = oc / out_c_per_group;
            x_index[0] = index[0];
            w_index[0] = oc;
            let mut sum = bias.map(|b| b.data()[oc]).unwrap_or(0.);
            for ic in 0..in_c_per_group {
                x_index[1] = group * in_c_per_group + ic;
                w_index[1] = ic;
                'kernel: for position in &kernel_positions {
                    for dim in 0..spatial {
                        let coord = (index[2 + dim] * strides[dim]) as i32
                            - pads[dim].0 as i32
                            + (position[dim] * dilations[dim]) as i32;
                        if coord < 0 || coord >= x.size(2 + dim) as i32 {
                            continue 'kernel;
                        }
                        x_index[2 + dim] = coord as usize;
                        w_index[2 + dim] = position[dim];
                    }
                    sum += x.data()[x.offset(&x_index)] * w.data()[w.offset(&w_index)];
                }
            }
            out.push(sum);
        });
        Tensor::from_data(out_shape, out)
    }

    fn conv_transpose(
        &mut self,
        x: &Tensor<f32>,
        w: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
        groups: usize,
        strides: &[usize],
        pads: &[(usize, usize)],
        dilations: &[usize],
        out_shape: &[usize],
    ) -> Tensor<f32> {
        let spatial = strides.len();
        let in_c_per_group = x.size(1) / groups;
        let out_c_per_group = w.size(1);
        let kernel_positions = index_list(&w.shape()[2..]);
        let mut out = Tensor::zeros(out_shape);
        if let Some(bias) = bias {
            for_each_index(out_shape, |index| {
                let offset = out.offset(index);
                out.data_mut()[offset] = bias.data()[index[1]];
            });
        }
        let mut w_index = vec![0; w.ndim()];
        let mut out_index = vec![0; out_shape.len()];
        for_each_index(x.shape(), |index| {
            let ic = index[1];
            let group = ic / in_c_per_group;
            let value = x.data()[x.offset(index)];
            w_index[0] = ic;
            out_index[0] = index[0];
            for oc in 0..out_c_per_group {
                w_index[1] = oc;
                out_index[1] = group * out_c_per_group + oc;
                'kernel: for position in &kernel_positions {
                    for dim in 0..spatial {
                        let coord = (index[2 + dim] * strides[dim]) as i32
                            - pads[dim].0 as i32
                            + (position[dim] * dilations[dim]) as i32;
                        if coord < 0 || coord >= out_shape[2 + dim] as i32 {
                            continue 'kernel;
                        }
                        out_index[2 + dim] = coord as usize;
                        w_index[2 + dim] = position[dim];
                    }
                    let offset = out.offset(&out_index);
                    out.data_mut()[offset] += value * w.data()[w.offset(&w_index)];
                }
            }
        });
        out
    }

    fn average_pool(
        &mut self,
        x: &Tensor<f32>,
        kernel: &[usize],
        strides: &[usize],
        pads: &[(usize, usize)],
        count_include_pad: bool,
        out_shape: &[usize],
    ) -> Tensor<f32> {
        let spatial = kernel.len();
        let kernel_positions = index_list(kernel);
        let mut x_index = vec![0; x.ndim()];
        let mut out = Vec::with_capacity(out_shape.iter().product());
        for_each_index(out_shape, |index| {
            x_index[0] = index[0];
            x_index[1] = index[1];
            let mut sum = 0.;
            let mut count = 0;
            'window: for position in &kernel_positions {
                let mut padded = false;
                for dim in 0..spatial {
                    let size = x.size(2 + dim) as i32;
                    let coord = (index[2 + dim] * strides[dim]) as i32 - pads[dim].0 as i32
                        + position[dim] as i32;
                    // Cells beyond the padded extent belong to a partial
                    // ceil-mode window and never count.
                    if coord < -(pads[dim].0 as i32) || coord >= size + pads[dim].1 as i32 {
                        continue 'window;
                    }
                    if coord < 0 || coord >= size {
                        padded = true;
                    } else {
                        x_index[2 + dim] = coord as usize;
                    }
                }
                if padded {
                    if count_include_pad {
                        count += 1;
                    }
                } else {
                    sum += x.data()[x.offset(&x_index)];
                    count += 1;
                }
            }
            out.push(sum / count as f32);
        });
        Tensor::from_data(out_shape, out)
    }

    fn max_pool(
        &mut self,
        x: &Tensor<f32>,
        kernel: &[usize],
        strides: &[usize],
        pads: &[(usize, usize)],
        out_shape: &[usize],
    ) -> Tensor<f32> {
        let spatial = kernel.len();
        let kernel_positions = index_list(kernel);
        let mut x_index = vec![0; x.ndim()];
        let mut out = Vec::with_capacity(out_shape.iter().product());
        for_each_index(out_shape, |index| {
            x_index[0] = index[0];
            x_index[1] = index[1];
            let mut max = f32::NEG_INFINITY;
            'window: for position in &kernel_positions {
                for dim in 0..spatial {
                    let coord = (index[2 + dim] * strides[dim]) as i32 - pads[dim].0 as i32
                        + position[dim] as i32;
                    if coord < 0 || coord >= x.size(2 + dim) as i32 {
                        continue 'window;
                    }
                    x_index[2 + dim] = coord as usize;
                }
                max = max.max(x.data()[x.offset(&x_index)]);
            }
            out.push(max);
        });
        Tensor::from_data(out_shape, out)
    }

    fn global_average_pool(&mut self, x: &Tensor<f32>) -> Tensor<f32> {
        let plane: usize = x.shape()[2..].iter().product();
        let mut out_shape = x.shape()[..2].to_vec();
        out_shape.resize(x.ndim(), 1);
        let mut out = Vec::with_capacity(x.size(0) * x.size(1));
        for i in 0..x.size(0) * x.size(1) {
            let sum: f32 = x.data()[i * plane..(i + 1) * plane].iter().sum();
            out.push(sum / plane as f32);
        }
        Tensor::from_data(&out_shape, out)
    }

    fn global_max_pool(&mut self, x: &Tensor<f32>) -> Tensor<f32> {
        let plane: usize = x.shape()[2..].iter().product();
        let mut out_shape = x.shape()[..2].to_vec();
        out_shape.resize(x.ndim(), 1);
        let mut out = Vec::with_capacity(x.size(0) * x.size(1));
        for i in 0..x.size(0) * x.size(1) {
            let max = x.data()[i * plane..(i + 1) * plane]
                .iter()
                .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
            out.push(max);
        }
        Tensor::from_data(&out_shape, out)
    }

    fn batch_norm(
        &mut self,
        x: &Tensor<f32>,
        scale: &Tensor<f32>,
        bias: &Tensor<f32>,
        mean: &Tensor<f32>,
        var: &Tensor<f32>,
        epsilon: f32,
    ) -> Tensor<f32> {
        let mut out = Vec::with_capacity(x.len());
        for_each_index(x.shape(), |index| {
            let c = index[1];
            let v = x.data()[x.offset(index)];
            let norm = (v - mean.data()[c]) / (var.data()[c] + epsilon).sqrt();
            out.push(scale.data()[c] * norm + bias.data()[c]);
        });
        Tensor::from_data(x.shape(), out)
    }

    fn instance_norm(
        &mut self,
        x: &Tensor<f32>,
        scale: &Tensor<f32>,
        bias: &Tensor<f32>,
        epsilon: f32,
    ) -> Tensor<f32> {
        let plane: usize = x.shape()[2..].iter().product();
        let mut out = Vec::with_capacity(x.len());
        for n in 0..x.size(0) {
            for c in 0..x.size(1) {
                let base = (n * x.size(1) + c) * plane;
                let lane = &x.data()[base..base + plane];
                let mean: f32 = lane.iter().sum::<f32>() / plane as f32;
                let var: f32 =
                    lane.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / plane as f32;
                let inv_std = 1. / (var + epsilon).sqrt();
                for &v in lane {
                    out.push(scale.data()[c] * (v - mean) * inv_std + bias.data()[c]);
                }
            }
        }
        Tensor::from_data(x.shape(), out)
    }

    fn layer_norm(
        &mut self,
        x: &Tensor<f32>,
        scale: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
        axis: usize,
        epsilon: f32,
    ) -> Tensor<f32> {
        let inner: usize = x.shape()[axis..].iter().product();
        let outer = x.len() / inner.max(1);
        let mut out = Vec::with_capacity(x.len());
        for o in 0..outer {
            let lane = &x.data()[o * inner..(o + 1) * inner];
            let mean: f32 = lane.iter().sum::<f32>() / inner as f32;
            let var: f32 =
                lane.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / inner as f32;
            let inv_std = 1. / (var + epsilon).sqrt();
            for (i, &v) in lane.iter().enumerate() {
                let mut y = (v - mean) * inv_std * scale.data()[i];
                if let Some(bias) = bias {
                    y += bias.data()[i];
                }
                out.push(y);
            }
        }
        Tensor::from_data(x.shape(), out)
    }

    fn lrn(
        &mut self,
        x: &Tensor<f32>,
        alpha: f32,
        beta: f32,
        bias: f32,
        size: usize,
    ) -> Tensor<f32> {
        let channels = x.size(1);
        let lo_span = (size - 1) / 2;
        let hi_span = size / 2;
        let mut window_index = vec![0; x.ndim()];
        let mut out = Vec::with_capacity(x.len());
        for_each_index(x.shape(), |index| {
            let c = index[1];
            window_index.copy_from_slice(index);
            let lo = c.saturating_sub(lo_span);
            let hi = (c + hi_span).min(channels - 1);
            let mut square_sum = 0.;
            for cc in lo..=hi {
                window_index[1] = cc;
                let v = x.data()[x.offset(&window_index)];
                square_sum += v * v;
            }
            let denom = (bias + alpha / size as f32 * square_sum).powf(beta);
            out.push(x.data()[x.offset(index)] / denom);
        });
        Tensor::from_data(x.shape(), out)
    }

    fn random_uniform(&mut self, shape: &[usize], low: f32, high: f32, seed: u64) -> Tensor<f32> {
        let mut rng = fastrand::Rng::with_seed(seed);
        let len = shape.iter().product();
        Tensor::from_data(
            shape,
            (0..len).map(|_| low + rng.f32() * (high - low)).collect(),
        )
    }

    fn random_normal(&mut self, shape: &[usize], mean: f32, scale: f32, seed: u64) -> Tensor<f32> {
        let mut rng = fastrand::Rng::with_seed(seed);
        let len = shape.iter().product();
        Tensor::from_data(shape, (0..len).map(|_| rng.f32_normal(mean, scale)).collect())
    }

    fn bernoulli(&mut self, probs: &Tensor<f32>, seed: u64, dtype: DataType) -> Value {
        let mut rng = fastrand::Rng::with_seed(seed);
        // `f32()` samples [0, 1), so probabilities of zero and one are exact.
        let draws: Vec<bool> = probs.iter().map(|&p| rng.f32() < p).collect();
        match dtype {
            DataType::Float => Value::Float(Tensor::from_data(
                probs.shape(),
                draws.iter().map(|&hit| hit as i32 as f32).collect(),
            )),
            DataType::Int => Value::Int(Tensor::from_data(
                probs.shape(),
                draws.iter().map(|&hit| hit as i32).collect(),
            )),
        }
    }

    fn roi_align(
        &mut self,
        x: &Tensor<f32>,
        rois: &Tensor<f32>,
        batch_indices: &Tensor<i32>,
        mode: RoiAlignMode,
        output_size: (usize, usize),
        sampling_ratio: usize,
        spatial_scale: f32,
    ) -> Tensor<f32> {
        let (channels, height, width) = (x.size(1), x.size(2), x.size(3));
        let (out_h, out_w) = output_size;
        let out_shape = [rois.size(0), channels, out_h, out_w];
        let mut out = Vec::with_capacity(out_shape.iter().product());
        for roi in 0..rois.size(0) {
            let batch = batch_indices.data()[roi] as usize;
            // Half-pixel coordinates: the roi is shifted onto the continuous
            // feature-map grid after scaling.
            let start_x = rois[[roi, 0]] * spatial_scale - 0.5;
            let start_y = rois[[roi, 1]] * spatial_scale - 0.5;
            let end_x = rois[[roi, 2]] * spatial_scale - 0.5;
            let end_y = rois[[roi, 3]] * spatial_scale - 0.5;
            let bin_h = (end_y - start_y) / out_h as f32;
            let bin_w = (end_x - start_x) / out_w as f32;
            let samples_h = if sampling_ratio > 0 {
                sampling_ratio
            } else {
                (bin_h.ceil() as usize).max(1)
            };
            let samples_w = if sampling_ratio > 0 {
                sampling_ratio
            } else {
                (bin_w.ceil() as usize).max(1)
            };
            for c in 0..channels {
                let base = (batch * channels + c) * height * width;
                let plane = &x.data()[base..base + height * width];
                for oy in 0..out_h {
                    for ox in 0..out_w {
                        let mut acc = match mode {
                            RoiAlignMode::Avg => 0.,
                            RoiAlignMode::Max => f32::NEG_INFINITY,
                        };
                        for iy in 0..samples_h {
                            let y = start_y
                                + oy as f32 * bin_h
                                + (iy as f32 + 0.5) * bin_h / samples_h as f32;
                            for ix in 0..samples_w {
                                let sx = start_x
                                    + ox as f32 * bin_w
                                    + (ix as f32 + 0.5) * bin_w / samples_w as f32;
                                let sample = bilinear_sample(plane, height, width, y, sx);
                                acc = match mode {
                                    RoiAlignMode::Avg => acc + sample,
                                    RoiAlignMode::Max => acc.max(sample),
                                };
                            }
                        }
                        out.push(match mode {
                            RoiAlignMode::Avg => acc / (samples_h * samples_w) as f32,
                            RoiAlignMode::Max => acc,
                        });
                    }
                }
            }
        }
        Tensor::from_data(&out_shape, out)
    }
}

#[cfg(test)]
mod tests {
    use parten_tensor::test_util::expect_equal;
    use parten_tensor::Tensor;
    use parten_testing::TestCases;

    use super::{erf, CpuBackend};
    use crate::backend::{Backend, BinaryFloatOp, PadMode, SliceRange};

    #[test]
    fn test_erf_accuracy() {
        // The approximation must track libm within the default tolerances
        // used by the layer tests.
        let inputs: Vec<f32> = (-60..=60).map(|i| i as f32 / 10.).collect();
        let ours = Tensor::from_vec(inputs.iter().map(|&x| erf(x)).collect());
        let reference = Tensor::from_vec(inputs.iter().map(|&x| libm::erff(x)).collect());
        expect_equal(&ours, &reference).unwrap();
    }

    #[test]
    fn test_binary_broadcast() {
        #[derive(Debug)]
        struct Case {
            a: Tensor<f32>,
            b: Tensor<f32>,
            out_shape: Vec<usize>,
            expected: Vec<f32>,
        }

        let cases = [
            // Scalar against matrix.
            Case {
                a: Tensor::scalar(10.),
                b: Tensor::from_data(&[2, 2], vec![1., 2., 3., 4.]),
                out_shape: vec![2, 2],
                expected: vec![11., 12., 13., 14.],
            },
            // Row against column.
            Case {
                a: Tensor::from_data(&[1, 3], vec![1., 2., 3.]),
                b: Tensor::from_data(&[2, 1], vec![10., 20.]),
                out_shape: vec![2, 3],
                expected: vec![11., 12., 13., 21., 22., 23.],
            },
        ];

        cases.test_each(|case| {
            let mut backend = CpuBackend::new();
            let out = backend.binary_float(BinaryFloatOp::Add, &case.a, &case.b, &case.out_shape);
            assert_eq!(out.shape(), case.out_shape);
            assert_eq!(out.data(), case.expected);
        })
    }

    #[test]
    fn test_slice_negative_step() {
        let mut backend = CpuBackend::new();
        let x = Tensor::from_data(&[5], vec![0., 1., 2., 3., 4.]);
        let out = backend.slice_float(
            &x,
            &[SliceRange {
                start: 4,
                step: -2,
                len: 3,
            }],
        );
        assert_eq!(out.data(), &[4., 2., 0.]);
    }

    #[test]
    fn test_pad_reflect_wide() {
        // Reflection wider than the input keeps bouncing off both edges.
        let mut backend = CpuBackend::new();
        let x = Tensor::from_data(&[3], vec![1., 2., 3.]);
        let out = backend.pad_float(&x, &[(3, 3)], PadMode::Reflect, 0.);
        assert_eq!(out.data(), &[2., 3., 2., 1., 2., 3., 2., 1., 2.]);
    }

    #[test]
    fn test_random_seed_determinism() {
        let mut backend = CpuBackend::new();
        let a = backend.random_uniform(&[16], 0., 1., 42);
        let b = backend.random_uniform(&[16], 0., 1., 42);
        assert_eq!(a, b);
        let c = backend.random_uniform(&[16], 0., 1., 43);
        assert_ne!(a, c);
        assert!(a.iter().all(|&v| (0. ..1.).contains(&v)));
    }
}
