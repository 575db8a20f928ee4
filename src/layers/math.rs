//! Arithmetic and linear algebra layers.

use parten_tensor::Tensor;
use rustc_hash::FxHashMap;

use crate::backend::{Backend, BinaryFloatOp, BinaryIntOp, ReduceOp, UnaryFloatOp, UnaryIntOp};
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::{PartialElem, PartialTensor, MAX_PARTIAL_ELEMENTS};
use crate::shape::SymShape;
use crate::value::{DataType, Value};

use super::broadcast_shapes;

/// Element-folding rule a broadcast op applies during inference when its
/// operands are small, fully tracked vectors.
pub(crate) type FoldFn = fn(&PartialElem, &PartialElem) -> PartialElem;

pub(crate) fn fold_max(a: &PartialElem, b: &PartialElem) -> PartialElem {
    match (a, b) {
        (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int(*a.max(b)),
        (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Float(a.max(*b)),
        (PartialElem::Param(p), PartialElem::Param(q)) if p == q => a.clone(),
        _ => PartialElem::Unknown,
    }
}

pub(crate) fn fold_min(a: &PartialElem, b: &PartialElem) -> PartialElem {
    match (a, b) {
        (PartialElem::Int(a), PartialElem::Int(b)) => PartialElem::Int(*a.min(b)),
        (PartialElem::Float(a), PartialElem::Float(b)) => PartialElem::Float(a.min(*b)),
        (PartialElem::Param(p), PartialElem::Param(q)) if p == q => a.clone(),
        _ => PartialElem::Unknown,
    }
}

/// Shape and dtype pass through from the first input.
pub(crate) fn infer_same(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    Ok(PartialTensor::new(x.dtype(), x.shape().clone()))
}

pub(crate) fn infer_cum_sum(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    inputs.require(1)?;
    infer_same(inputs)
}

/// Broadcast every input shape together.
///
/// With exactly two inputs whose broadcast shape is a small, fully known
/// vector or scalar, the result is additionally folded element by element
/// using `fold`. This is what lets shape-carrying int vectors flow through
/// arithmetic without losing track of their values.
pub(crate) fn infer_broadcast(
    inputs: &PartialInputs,
    dtype: Option<DataType>,
    fold: Option<FoldFn>,
) -> Result<PartialTensor, LayerError> {
    let first = inputs.require(0)?;
    let dtype = dtype.unwrap_or(first.dtype());
    let mut shape = first.shape().clone();
    for i in 1..inputs.len() {
        shape = shape.broadcast(inputs.require(i)?.shape())?;
    }

    if let (Some(fold), 2) = (fold, inputs.len()) {
        let a = inputs.require(0)?;
        let b = inputs.require(1)?;
        let foldable = a.is_partially_known()
            && b.is_partially_known()
            && shape.rank().is_some_and(|rank| rank <= 1);
        if foldable {
            if let Some(sizes) = shape.to_concrete() {
                let len: usize = sizes.iter().product();
                if len <= MAX_PARTIAL_ELEMENTS {
                    // A broadcast operand either matches the output length
                    // or holds a single element.
                    fn pick(t: &PartialTensor, i: usize) -> &PartialElem {
                        let n = t.elems().map_or(0, |elems| elems.len());
                        t.elem(if n <= 1 { 0 } else { i })
                    }
                    let elems = (0..len).map(|i| fold(pick(a, i), pick(b, i))).collect();
                    return Ok(PartialTensor::from_elems(dtype, shape, elems));
                }
            }
        }
    }

    Ok(PartialTensor::new(dtype, shape))
}

pub(crate) fn infer_matmul(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let a = inputs.require(0)?;
    let b = inputs.require(1)?;
    let (Some(a_dims), Some(b_dims)) = (a.shape().dims(), b.shape().dims()) else {
        return Ok(PartialTensor::unknown(DataType::Float));
    };
    if a_dims.len() < 2 || b_dims.len() < 2 {
        return Err(LayerError::ValueError(
            "matmul operands must have at least 2 dimensions",
        ));
    }

    let a_batch = SymShape::from_dims(a_dims[..a_dims.len() - 2].to_vec());
    let b_batch = SymShape::from_dims(b_dims[..b_dims.len() - 2].to_vec());
    let batch = a_batch.broadcast(&b_batch)?;

    let k_a = &a_dims[a_dims.len() - 1];
    let k_b = &b_dims[b_dims.len() - 2];
    if let (Some(k_a), Some(k_b)) = (k_a.as_value(), k_b.as_value()) {
        if k_a != k_b {
            return Err(LayerError::ValueError(
                "matmul inner dimensions must match",
            ));
        }
    }

    let Some(batch_dims) = batch.dims() else {
        return Ok(PartialTensor::unknown(DataType::Float));
    };
    let mut dims = batch_dims.to_vec();
    dims.push(a_dims[a_dims.len() - 2].clone());
    dims.push(b_dims[b_dims.len() - 1].clone());
    Ok(PartialTensor::new(DataType::Float, SymShape::from_dims(dims)))
}

pub(crate) fn infer_matmul_2d(
    transpose_a: bool,
    transpose_b: bool,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let a = inputs.require(0)?.shape().declare_rank(2)?;
    let b = inputs.require(1)?.shape().declare_rank(2)?;
    let (m, k_a) = if transpose_a {
        (a.dim(1), a.dim(0))
    } else {
        (a.dim(0), a.dim(1))
    };
    let (k_b, n) = if transpose_b {
        (b.dim(1), b.dim(0))
    } else {
        (b.dim(0), b.dim(1))
    };
    if let (Some(k_a), Some(k_b)) = (k_a.as_value(), k_b.as_value()) {
        if k_a != k_b {
            return Err(LayerError::ValueError(
                "matmul inner dimensions must match",
            ));
        }
    }
    Ok(PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(vec![m, n]),
    ))
}

pub(crate) fn infer_dense(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let w = inputs.require(1)?.shape().declare_rank(2)?;
    let Some(x_dims) = x.shape().dims() else {
        return Ok(PartialTensor::unknown(DataType::Float));
    };
    if x_dims.is_empty() {
        return Err(LayerError::ValueError(
            "dense input must have at least 1 dimension",
        ));
    }
    if let (Some(actual), Some(rows)) = (x_dims[x_dims.len() - 1].as_value(), w.dim(0).as_value())
    {
        if actual != rows {
            return Err(LayerError::ValueError(
                "dense input width must match the weight rows",
            ));
        }
    }
    let mut out_dim = w.dim(1);
    if let Some(bias) = inputs.get(2) {
        let bias = bias.shape().declare_rank(1)?;
        out_dim = out_dim.max_defined(&bias.dim(0));
    }
    let mut dims = x_dims[..x_dims.len() - 1].to_vec();
    dims.push(out_dim);
    Ok(PartialTensor::new(DataType::Float, SymShape::from_dims(dims)))
}

/// Number of elements `start, start + delta, ...` produces before reaching
/// `limit`.
fn range_count(start: f64, limit: f64, delta: f64) -> usize {
    ((limit - start) / delta).ceil().max(0.) as usize
}

pub(crate) fn infer_range(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let start = inputs.require(0)?;
    let limit = inputs.require(1)?;
    let delta = inputs.require(2)?;
    let dtype = start.dtype();
    for input in [start, limit, delta] {
        if input.shape().rank().is_some_and(|rank| rank != 0) {
            return Err(LayerError::ValueError("range inputs must be scalars"));
        }
        if input.dtype() != dtype {
            return Err(LayerError::ValueError("range inputs must share a dtype"));
        }
    }

    match (start.elem(0), limit.elem(0), delta.elem(0)) {
        (PartialElem::Int(s), PartialElem::Int(l), PartialElem::Int(d)) if *d != 0 => {
            let count = range_count(*s as f64, *l as f64, *d as f64);
            let shape = SymShape::fixed(&[count]);
            if count <= MAX_PARTIAL_ELEMENTS {
                let elems = (0..count as i32).map(|i| PartialElem::Int(s + i * d)).collect();
                Ok(PartialTensor::from_elems(dtype, shape, elems))
            } else {
                Ok(PartialTensor::new(dtype, shape))
            }
        }
        (PartialElem::Float(s), PartialElem::Float(l), PartialElem::Float(d)) if *d != 0. => {
            let count = range_count(*s as f64, *l as f64, *d as f64);
            let shape = SymShape::fixed(&[count]);
            if count <= MAX_PARTIAL_ELEMENTS {
                let elems = (0..count)
                    .map(|i| PartialElem::Float(s + i as f32 * d))
                    .collect();
                Ok(PartialTensor::from_elems(dtype, shape, elems))
            } else {
                Ok(PartialTensor::new(dtype, shape))
            }
        }
        // A `0..n` range over a shape param keeps the param as its length.
        (PartialElem::Int(0), PartialElem::Param(name), PartialElem::Int(1)) => Ok(
            PartialTensor::new(dtype, SymShape::from_dims(vec![SymDim::Param(name.clone())])),
        ),
        _ => Ok(PartialTensor::new(
            dtype,
            SymShape::from_dims(vec![SymDim::Unknown]),
        )),
    }
}

/// A parsed einsum equation.
///
/// Terms are lists of dimension letters, one per input. If the equation has
/// no `->`, the output is implicit: the letters that occur exactly once
/// across all inputs, in alphabetical order.
#[derive(Debug, PartialEq)]
pub(crate) struct EinsumExpr {
    pub terms: Vec<Vec<char>>,
    pub output: Vec<char>,
}

impl EinsumExpr {
    pub fn parse(equation: &str) -> Result<EinsumExpr, LayerError> {
        let (input_str, output_str) = match equation.split_once("->") {
            Some((inputs, output)) => (inputs, Some(output)),
            None => (equation, None),
        };

        let mut terms = Vec::new();
        for term_str in input_str.split(',') {
            let mut term = Vec::new();
            for ch in term_str.chars() {
                if ch.is_ascii_lowercase() {
                    if term.contains(&ch) {
                        return Err(LayerError::ValueError(
                            "einsum terms with repeated letters are not supported",
                        ));
                    }
                    term.push(ch);
                } else if !ch.is_whitespace() {
                    return Err(LayerError::ValueError(
                        "einsum terms may only contain lowercase letters",
                    ));
                }
            }
            terms.push(term);
        }

        let output = match output_str {
            Some(output_str) => {
                let mut output = Vec::new();
                for ch in output_str.chars() {
                    if ch.is_ascii_lowercase() {
                        if output.contains(&ch) {
                            return Err(LayerError::ValueError(
                                "einsum output letters must be unique",
                            ));
                        }
                        if !terms.iter().any(|term| term.contains(&ch)) {
                            return Err(LayerError::ValueError(
                                "einsum output uses a letter that no input has",
                            ));
                        }
                        output.push(ch);
                    } else if !ch.is_whitespace() {
                        return Err(LayerError::ValueError(
                            "einsum output may only contain lowercase letters",
                        ));
                    }
                }
                output
            }
            None => ('a'..='z')
                .filter(|ch| {
                    let count: usize = terms
                        .iter()
                        .map(|term| term.iter().filter(|&&c| c == *ch).count())
                        .sum();
                    count == 1
                })
                .collect(),
        };

        Ok(EinsumExpr { terms, output })
    }

    /// Letters that are summed away, in order of first appearance.
    fn reduced_letters(&self) -> Vec<char> {
        let mut letters = Vec::new();
        for term in &self.terms {
            for &ch in term {
                if !self.output.contains(&ch) && !letters.contains(&ch) {
                    letters.push(ch);
                }
            }
        }
        letters
    }
}

pub(crate) fn infer_einsum(
    equation: &str,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let expr = EinsumExpr::parse(equation)?;
    if expr.terms.len() != inputs.len() {
        return Err(LayerError::ValueError(
            "einsum equation does not match the input count",
        ));
    }

    let mut letter_dims: FxHashMap<char, SymDim> = FxHashMap::default();
    for (i, term) in expr.terms.iter().enumerate() {
        let shape = inputs.require(i)?.shape().declare_rank(term.len())?;
        for (j, &ch) in term.iter().enumerate() {
            let dim = shape.dim(j);
            let merged = match letter_dims.get(&ch) {
                Some(existing) => existing.unify(&dim)?,
                None => dim,
            };
            letter_dims.insert(ch, merged);
        }
    }

    let dims = expr
        .output
        .iter()
        .map(|ch| letter_dims.get(ch).cloned().unwrap_or(SymDim::Unknown))
        .collect();
    Ok(PartialTensor::new(DataType::Float, SymShape::from_dims(dims)))
}

pub(crate) fn execute_unary(
    float_op: UnaryFloatOp,
    int_op: Option<UnaryIntOp>,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    match (inputs.require(0)?, int_op) {
        (Value::Float(x), _) => Ok(backend.unary_float(float_op, x).into()),
        (Value::Int(x), Some(op)) => Ok(backend.unary_int(op, x).into()),
        (Value::Int(_), None) => Err(LayerError::UnsupportedDataType(
            "int tensors are not supported by this operation",
        )),
    }
}

pub(crate) fn execute_binary(
    float_op: BinaryFloatOp,
    int_op: Option<BinaryIntOp>,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let a = inputs.require(0)?;
    let b = inputs.require(1)?;
    let out_shape = broadcast_shapes(a.shape(), b.shape())?;
    match (a, b, int_op) {
        (Value::Float(a), Value::Float(b), _) => {
            Ok(backend.binary_float(float_op, a, b, &out_shape).into())
        }
        (Value::Int(a), Value::Int(b), Some(op)) => {
            Ok(backend.binary_int(op, a, b, &out_shape).into())
        }
        (Value::Int(_), Value::Int(_), None) => Err(LayerError::UnsupportedDataType(
            "int tensors are not supported by this operation",
        )),
        _ => Err(LayerError::UnsupportedDataType(
            "operands must have the same dtype",
        )),
    }
}

/// Pow follows its base dtype; an exponent of the other dtype is converted
/// first.
pub(crate) fn execute_pow(inputs: &Inputs, backend: &mut dyn Backend) -> Result<Value, LayerError> {
    let base = inputs.require(0)?;
    let exponent = inputs.require(1)?;
    let out_shape = broadcast_shapes(base.shape(), exponent.shape())?;
    let converted;
    let exponent = if exponent.dtype() == base.dtype() {
        exponent
    } else {
        converted = backend.cast(exponent, base.dtype());
        &converted
    };
    match base {
        Value::Float(a) => {
            let b = exponent.as_float()?;
            Ok(backend
                .binary_float(BinaryFloatOp::Pow, a, b, &out_shape)
                .into())
        }
        Value::Int(a) => {
            let b = exponent.as_int()?;
            Ok(backend
                .binary_int(BinaryIntOp::Pow, a, b, &out_shape)
                .into())
        }
    }
}

/// Variadic reductions over any number of inputs: Max, Mean, Min and Sum.
pub(crate) fn execute_variadic(
    op: ReduceOp,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let first = inputs.require(0)?;
    let mut out_shape = first.shape().to_vec();
    for i in 1..inputs.len() {
        out_shape = broadcast_shapes(&out_shape, inputs.require(i)?.shape())?;
    }

    let (float_op, int_op) = match op {
        ReduceOp::Max => (BinaryFloatOp::Max, Some(BinaryIntOp::Max)),
        ReduceOp::Min => (BinaryFloatOp::Min, Some(BinaryIntOp::Min)),
        ReduceOp::Sum | ReduceOp::Mean => (BinaryFloatOp::Add, Some(BinaryIntOp::Add)),
        _ => {
            return Err(LayerError::ValueError(
                "operation is not a variadic reduction",
            ))
        }
    };
    if op == ReduceOp::Mean && first.dtype() == DataType::Int {
        return Err(LayerError::UnsupportedDataType(
            "int tensors are not supported by mean",
        ));
    }

    let mut acc = match first {
        Value::Float(t) => Value::Float(backend.expand_float(t, &out_shape)),
        Value::Int(t) => Value::Int(backend.expand_int(t, &out_shape)),
    };
    for i in 1..inputs.len() {
        let next = inputs.require(i)?;
        acc = match (&acc, next, int_op) {
            (Value::Float(a), Value::Float(b), _) => {
                backend.binary_float(float_op, a, b, &out_shape).into()
            }
            (Value::Int(a), Value::Int(b), Some(op)) => {
                backend.binary_int(op, a, b, &out_shape).into()
            }
            _ => {
                return Err(LayerError::UnsupportedDataType(
                    "operands must have the same dtype",
                ))
            }
        };
    }

    if op == ReduceOp::Mean {
        let n = Tensor::scalar(inputs.len() as f32);
        let acc = acc.as_float()?;
        return Ok(backend
            .binary_float(BinaryFloatOp::Div, acc, &n, &out_shape)
            .into());
    }
    Ok(acc)
}

/// Clip bounds arrive as optional scalar inputs of the clipped dtype.
pub(crate) fn execute_clip(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    match inputs.require(0)? {
        Value::Float(x) => {
            let min = inputs.get_scalar_float(1)?;
            let max = inputs.get_scalar_float(2)?;
            Ok(backend
                .unary_float(UnaryFloatOp::Clip { min, max }, x)
                .into())
        }
        Value::Int(x) => {
            let min = inputs.get_scalar_int(1)?;
            let max = inputs.get_scalar_int(2)?;
            Ok(backend.unary_int(UnaryIntOp::Clip { min, max }, x).into())
        }
    }
}

pub(crate) fn execute_cum_sum(
    exclusive: bool,
    reverse: bool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    let axis = super::resolve_axis(x.ndim(), inputs.require_scalar_int(1)?)?;
    match x {
        Value::Float(x) => Ok(backend.cum_sum_float(x, axis, exclusive, reverse).into()),
        Value::Int(x) => Ok(backend.cum_sum_int(x, axis, exclusive, reverse).into()),
    }
}

pub(crate) fn execute_matmul(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let a = inputs.require_float(0)?;
    let b = inputs.require_float(1)?;
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(LayerError::ValueError(
            "matmul operands must have at least 2 dimensions",
        ));
    }
    if a.size(a.ndim() - 1) != b.size(b.ndim() - 2) {
        return Err(LayerError::ValueError(
            "matmul inner dimensions must match",
        ));
    }
    let mut out_shape = broadcast_shapes(
        &a.shape()[..a.ndim() - 2],
        &b.shape()[..b.ndim() - 2],
    )?;
    out_shape.push(a.size(a.ndim() - 2));
    out_shape.push(b.size(b.ndim() - 1));
    Ok(backend.matmul(a, b, &out_shape).into())
}

pub(crate) fn execute_matmul_2d(
    transpose_a: bool,
    transpose_b: bool,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let a = inputs.require_float(0)?;
    let b = inputs.require_float(1)?;
    for operand in [a, b] {
        if operand.ndim() != 2 {
            return Err(LayerError::RankMismatch {
                expected: 2,
                actual: operand.ndim(),
            });
        }
    }
    let k_a = if transpose_a { a.size(0) } else { a.size(1) };
    let k_b = if transpose_b { b.size(1) } else { b.size(0) };
    if k_a != k_b {
        return Err(LayerError::ValueError(
            "matmul inner dimensions must match",
        ));
    }
    Ok(backend.matmul_2d(a, b, transpose_a, transpose_b).into())
}

pub(crate) fn execute_dense(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require_float(0)?;
    let w = inputs.require_float(1)?;
    let bias = inputs.get_float(2)?;
    if x.ndim() == 0 {
        return Err(LayerError::ValueError(
            "dense input must have at least 1 dimension",
        ));
    }
    if w.ndim() != 2 {
        return Err(LayerError::RankMismatch {
            expected: 2,
            actual: w.ndim(),
        });
    }
    if x.size(x.ndim() - 1) != w.size(0) {
        return Err(LayerError::ValueError(
            "dense input width must match the weight rows",
        ));
    }
    if let Some(bias) = bias {
        if bias.ndim() != 1 || bias.size(0) != w.size(1) {
            return Err(LayerError::ValueError(
                "dense bias must be a vector of the output width",
            ));
        }
    }
    Ok(backend.dense(x, w, bias).into())
}

pub(crate) fn execute_range(
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    match inputs.require(0)? {
        Value::Float(_) => {
            let start = inputs.require_scalar_float(0)?;
            let limit = inputs.require_scalar_float(1)?;
            let delta = inputs.require_scalar_float(2)?;
            if delta == 0. {
                return Err(LayerError::ValueError("range delta must be nonzero"));
            }
            Ok(backend.range_float(start, limit, delta).into())
        }
        Value::Int(_) => {
            let start = inputs.require_scalar_int(0)?;
            let limit = inputs.require_scalar_int(1)?;
            let delta = inputs.require_scalar_int(2)?;
            if delta == 0 {
                return Err(LayerError::ValueError("range delta must be nonzero"));
            }
            Ok(backend.range_int(start, limit, delta).into())
        }
    }
}

/// Evaluate an einsum by aligning every input to a shared dimension order
/// (output letters first, then reduced letters), multiplying with
/// broadcasting, and summing the reduced trailing dimensions away.
pub(crate) fn execute_einsum(
    equation: &str,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let expr = EinsumExpr::parse(equation)?;
    if expr.terms.len() != inputs.len() {
        return Err(LayerError::ValueError(
            "einsum equation does not match the input count",
        ));
    }

    let order: Vec<char> = expr
        .output
        .iter()
        .copied()
        .chain(expr.reduced_letters())
        .collect();

    let mut sizes: FxHashMap<char, usize> = FxHashMap::default();
    for (i, term) in expr.terms.iter().enumerate() {
        let x = inputs.require_float(i)?;
        if x.ndim() != term.len() {
            return Err(LayerError::RankMismatch {
                expected: term.len(),
                actual: x.ndim(),
            });
        }
        for (j, ch) in term.iter().enumerate() {
            match sizes.get(ch) {
                Some(&existing) if existing != x.size(j) => {
                    return Err(LayerError::ShapeMismatch(
                        "einsum inputs disagree on a dimension size",
                    ));
                }
                _ => {
                    sizes.insert(*ch, x.size(j));
                }
            }
        }
    }

    let mut acc: Option<Tensor<f32>> = None;
    for (i, term) in expr.terms.iter().enumerate() {
        let x = inputs.require_float(i)?;
        let mut perm = Vec::with_capacity(term.len());
        let mut aligned_shape = Vec::with_capacity(order.len());
        for ch in &order {
            if let Some(pos) = term.iter().position(|c| c == ch) {
                perm.push(pos);
                aligned_shape.push(x.size(pos));
            } else {
                aligned_shape.push(1);
            }
        }
        let aligned = backend.transpose_float(x, &perm).into_shape(&aligned_shape);
        acc = Some(match acc {
            None => aligned,
            Some(acc) => {
                let out_shape: Vec<usize> = acc
                    .shape()
                    .iter()
                    .zip(aligned.shape())
                    .map(|(&a, &b)| a.max(b))
                    .collect();
                backend.binary_float(BinaryFloatOp::Mul, &acc, &aligned, &out_shape)
            }
        });
    }
    let Some(mut result) = acc else {
        return Err(LayerError::ValueError(
            "einsum equation does not match the input count",
        ));
    };

    if order.len() > expr.output.len() {
        let axes: Vec<usize> = (expr.output.len()..order.len()).collect();
        result = backend.reduce_float(ReduceOp::Sum, &result, &axes, false);
    }
    Ok(result.into())
}
