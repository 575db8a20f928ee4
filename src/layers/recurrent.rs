//! Recurrent layers.
//!
//! `LSTM` follows the usual convention for stacked gate weights: the four
//! gates are laid out input, output, forget, cell along the `4 * hidden`
//! dimension of the weights, and the bias input stacks the input-side and
//! recurrent-side biases along its `8 * hidden` dimension.

use parten_tensor::Tensor;

use crate::backend::{Backend, BinaryFloatOp, SliceRange, UnaryFloatOp};
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

const INPUT_GATE: usize = 0;
const OUTPUT_GATE: usize = 1;
const FORGET_GATE: usize = 2;
const CELL_GATE: usize = 3;

/// Which way an `LSTM` walks the sequence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
    /// Both directions, with results stacked along the direction dim.
    Bidirectional,
}

impl Direction {
    pub fn num_directions(self) -> usize {
        match self {
            Direction::Forward | Direction::Reverse => 1,
            Direction::Bidirectional => 2,
        }
    }

    /// Return true if direction `index` walks the sequence backwards.
    fn is_reverse(self, index: usize) -> bool {
        match self {
            Direction::Forward => false,
            Direction::Reverse => true,
            Direction::Bidirectional => index == 1,
        }
    }
}

/// Parameters for the `LSTM` layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LSTM {
    pub direction: Direction,
    pub hidden_size: usize,
}

/// The three outputs are the full hidden sequence
/// `[seq, dirs, batch, hidden]` followed by the final hidden and cell
/// states, both `[dirs, batch, hidden]`.
pub(crate) fn infer_lstm(
    params: &LSTM,
    inputs: &PartialInputs,
) -> Result<Vec<PartialTensor>, LayerError> {
    let x = inputs.require(0)?;
    inputs.require(1)?;
    inputs.require(2)?;
    if inputs.get(7).is_some() {
        return Err(LayerError::ValueError(
            "lstm peephole weights are not supported",
        ));
    }
    let x_shape = x.shape().declare_rank(3)?;
    let mut batch = x_shape.dim(1);
    if let Some(initial_h) = inputs.get(5) {
        batch = batch.unify(&initial_h.shape().declare_rank(3)?.dim(1))?;
    }
    let dirs = SymDim::Value(params.direction.num_directions() as i32);
    let hidden = SymDim::Value(params.hidden_size as i32);

    let seq = PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(vec![
            x_shape.dim(0),
            dirs.clone(),
            batch.clone(),
            hidden.clone(),
        ]),
    );
    let state = PartialTensor::new(
        DataType::Float,
        SymShape::from_dims(vec![dirs, batch, hidden]),
    );
    Ok(vec![seq, state.clone(), state])
}

/// Slice direction `index` out of a stacked `[dirs, rows, cols]` weight and
/// drop the leading dim.
fn direction_slice(
    backend: &mut dyn Backend,
    stacked: &Tensor<f32>,
    index: usize,
) -> Tensor<f32> {
    let (rows, cols) = (stacked.size(1), stacked.size(2));
    let sliced = backend.slice_float(
        stacked,
        &[
            SliceRange {
                start: index as i32,
                step: 1,
                len: 1,
            },
            SliceRange::full(rows),
            SliceRange::full(cols),
        ],
    );
    backend.reshape_float(&sliced, &[rows, cols])
}

/// Slice gate `index` out of stacked `[batch, 4 * hidden]` activations.
fn gate_slice(
    backend: &mut dyn Backend,
    gates: &Tensor<f32>,
    index: usize,
    hidden: usize,
) -> Tensor<f32> {
    backend.slice_float(
        gates,
        &[
            SliceRange::full(gates.size(0)),
            SliceRange {
                start: (index * hidden) as i32,
                step: 1,
                len: hidden,
            },
        ],
    )
}

pub(crate) fn execute_lstm(
    params: &LSTM,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Vec<Value>, LayerError> {
    let x = inputs.require_float(0)?;
    let w = inputs.require_float(1)?;
    let r = inputs.require_float(2)?;
    let b = inputs.get_float(3)?;
    // Input 4 is sequence_lens; every sequence is taken at full length.
    let initial_h = inputs.get_float(5)?;
    let initial_c = inputs.get_float(6)?;
    if inputs.get(7).is_some() {
        return Err(LayerError::ValueError(
            "lstm peephole weights are not supported",
        ));
    }

    let hidden = params.hidden_size;
    if hidden == 0 {
        return Err(LayerError::ValueError("lstm hidden size must be positive"));
    }
    if x.ndim() != 3 {
        return Err(LayerError::RankMismatch {
            expected: 3,
            actual: x.ndim(),
        });
    }
    let (seq_len, batch, input_size) = (x.size(0), x.size(1), x.size(2));
    let dirs = params.direction.num_directions();

    for weights in [w, r] {
        if weights.ndim() != 3 {
            return Err(LayerError::RankMismatch {
                expected: 3,
                actual: weights.ndim(),
            });
        }
        if weights.size(0) != dirs {
            return Err(LayerError::ShapeMismatch(
                "lstm weights do not match the direction count",
            ));
        }
        if weights.size(1) != 4 * hidden {
            return Err(LayerError::ShapeMismatch(
                "lstm weights do not match the hidden size",
            ));
        }
    }
    if w.size(2) != input_size {
        return Err(LayerError::ShapeMismatch(
            "lstm input size does not match the weights",
        ));
    }
    if r.size(2) != hidden {
        return Err(LayerError::ShapeMismatch(
            "lstm weights do not match the hidden size",
        ));
    }
    if let Some(b) = b {
        if b.shape() != [dirs, 8 * hidden] {
            return Err(LayerError::ShapeMismatch(
                "lstm bias must stack input and recurrent parts per direction",
            ));
        }
    }
    for state in [initial_h, initial_c].into_iter().flatten() {
        if state.shape() != [dirs, batch, hidden] {
            return Err(LayerError::ShapeMismatch(
                "lstm initial state has the wrong shape",
            ));
        }
    }

    // Gate pre-activations for the whole sequence at once.
    let x_flat = backend.reshape_float(x, &[seq_len * batch, input_size]);

    let mut seq_by_dir: Vec<Vec<Tensor<f32>>> = Vec::with_capacity(dirs);
    let mut final_h: Vec<Tensor<f32>> = Vec::with_capacity(dirs);
    let mut final_c: Vec<Tensor<f32>> = Vec::with_capacity(dirs);

    for dir in 0..dirs {
        let w_dir = direction_slice(backend, w, dir);
        let r_dir = direction_slice(backend, r, dir);
        let gate_bias = b.map(|b| {
            let b_dir = backend.slice_float(
                b,
                &[
                    SliceRange {
                        start: dir as i32,
                        step: 1,
                        len: 1,
                    },
                    SliceRange::full(8 * hidden),
                ],
            );
            let b_dir = backend.reshape_float(&b_dir, &[8 * hidden]);
            let halves = backend.split_float(&b_dir, 0, &[4 * hidden, 4 * hidden]);
            backend.binary_float(BinaryFloatOp::Add, &halves[0], &halves[1], &[4 * hidden])
        });

        let x_gates = backend.matmul_2d(&x_flat, &w_dir, false, true);

        let mut h_state = match initial_h {
            Some(init) => direction_slice(backend, init, dir),
            None => Tensor::zeros(&[batch, hidden]),
        };
        let mut c_state = match initial_c {
            Some(init) => direction_slice(backend, init, dir),
            None => Tensor::zeros(&[batch, hidden]),
        };

        let mut states: Vec<Option<Tensor<f32>>> = vec![None; seq_len];
        let steps: Box<dyn Iterator<Item = usize>> = if params.direction.is_reverse(dir) {
            Box::new((0..seq_len).rev())
        } else {
            Box::new(0..seq_len)
        };
        for t in steps {
            let x_t = backend.slice_float(
                &x_gates,
                &[
                    SliceRange {
                        start: (t * batch) as i32,
                        step: 1,
                        len: batch,
                    },
                    SliceRange::full(4 * hidden),
                ],
            );
            let h_t = backend.matmul_2d(&h_state, &r_dir, false, true);
            let mut gates =
                backend.binary_float(BinaryFloatOp::Add, &x_t, &h_t, &[batch, 4 * hidden]);
            if let Some(bias) = &gate_bias {
                gates =
                    backend.binary_float(BinaryFloatOp::Add, &gates, bias, &[batch, 4 * hidden]);
            }

            let input_gate = gate_slice(backend, &gates, INPUT_GATE, hidden);
            let input_gate = backend.unary_float(UnaryFloatOp::Sigmoid, &input_gate);
            let output_gate = gate_slice(backend, &gates, OUTPUT_GATE, hidden);
            let output_gate = backend.unary_float(UnaryFloatOp::Sigmoid, &output_gate);
            let forget_gate = gate_slice(backend, &gates, FORGET_GATE, hidden);
            let forget_gate = backend.unary_float(UnaryFloatOp::Sigmoid, &forget_gate);
            let cell_input = gate_slice(backend, &gates, CELL_GATE, hidden);
            let cell_input = backend.unary_float(UnaryFloatOp::Tanh, &cell_input);

            let shape = [batch, hidden];
            let kept = backend.binary_float(BinaryFloatOp::Mul, &forget_gate, &c_state, &shape);
            let written =
                backend.binary_float(BinaryFloatOp::Mul, &input_gate, &cell_input, &shape);
            c_state = backend.binary_float(BinaryFloatOp::Add, &kept, &written, &shape);
            let cell_out = backend.unary_float(UnaryFloatOp::Tanh, &c_state);
            h_state = backend.binary_float(BinaryFloatOp::Mul, &output_gate, &cell_out, &shape);

            states[t] = Some(h_state.clone());
        }

        seq_by_dir.push(states.into_iter().flatten().collect());
        final_h.push(backend.reshape_float(&h_state, &[1, batch, hidden]));
        final_c.push(backend.reshape_float(&c_state, &[1, batch, hidden]));
    }

    // Assemble [seq, dirs, batch, hidden] from the per-direction states.
    let mut step_rows = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        let per_dir: Vec<Tensor<f32>> = seq_by_dir
            .iter()
            .map(|states| backend.reshape_float(&states[t], &[1, 1, batch, hidden]))
            .collect();
        let refs: Vec<&Tensor<f32>> = per_dir.iter().collect();
        step_rows.push(backend.concat_float(&refs, 1));
    }
    let row_refs: Vec<&Tensor<f32>> = step_rows.iter().collect();
    let hidden_seq = if seq_len > 0 {
        backend.concat_float(&row_refs, 0)
    } else {
        Tensor::zeros(&[0, dirs, batch, hidden])
    };

    let h_refs: Vec<&Tensor<f32>> = final_h.iter().collect();
    let c_refs: Vec<&Tensor<f32>> = final_c.iter().collect();
    let last_h = backend.concat_float(&h_refs, 0);
    let last_c = backend.concat_float(&c_refs, 0);

    Ok(vec![hidden_seq.into(), last_h.into(), last_c.into()])
}
