//! Random number generation layers.
//!
//! Every layer owns a [`RandomSeed`]. Two layers built from the same seed
//! attribute produce identical sequences, while re-executing one layer draws
//! fresh values each time.

use std::cell::RefCell;
use std::fmt;

use parten_tensor::Tensor;

use crate::backend::Backend;
use crate::dim::SymDim;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::shape::SymShape;
use crate::value::{DataType, Value};

/// Seed state for one random layer.
///
/// The root seed comes from the layer's optional float seed attribute, or
/// from OS entropy when the attribute is absent. Each execution draws the
/// next sub-seed from a generator rooted at that seed.
pub struct RandomSeed {
    seed: u64,
    rng: RefCell<Option<fastrand::Rng>>,
}

impl RandomSeed {
    pub fn new(seed: Option<f32>) -> RandomSeed {
        let seed = match seed {
            Some(seed) => seed.to_bits() as u64,
            None => fastrand::u64(..),
        };
        RandomSeed {
            seed,
            rng: RefCell::new(None),
        }
    }

    /// Return the root seed.
    pub fn value(&self) -> u64 {
        self.seed
    }

    /// Draw the seed for one execution.
    pub(crate) fn next_seed(&self) -> u64 {
        let mut rng = self.rng.borrow_mut();
        rng.get_or_insert_with(|| fastrand::Rng::with_seed(self.seed))
            .u64(..)
    }
}

impl Clone for RandomSeed {
    /// The clone restarts the sub-seed sequence from the root seed.
    fn clone(&self) -> RandomSeed {
        RandomSeed {
            seed: self.seed,
            rng: RefCell::new(None),
        }
    }
}

impl Default for RandomSeed {
    fn default() -> RandomSeed {
        RandomSeed::new(None)
    }
}

impl fmt::Debug for RandomSeed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RandomSeed")
            .field("seed", &self.seed)
            .finish()
    }
}

/// Parameters for the `RandomUniform` layer, drawing from `[low, high)`.
#[derive(Clone, Debug)]
pub struct RandomUniform {
    pub shape: Vec<usize>,
    pub low: f32,
    pub high: f32,
    pub seed: RandomSeed,
}

impl Default for RandomUniform {
    fn default() -> RandomUniform {
        RandomUniform {
            shape: Vec::new(),
            low: 0.,
            high: 1.,
            seed: RandomSeed::new(None),
        }
    }
}

/// Parameters for the `RandomNormal` layer.
#[derive(Clone, Debug)]
pub struct RandomNormal {
    pub shape: Vec<usize>,
    pub mean: f32,
    pub scale: f32,
    pub seed: RandomSeed,
}

impl Default for RandomNormal {
    fn default() -> RandomNormal {
        RandomNormal {
            shape: Vec::new(),
            mean: 0.,
            scale: 1.,
            seed: RandomSeed::new(None),
        }
    }
}

/// `RandomUniform` with the output shape taken from the input tensor.
#[derive(Clone, Debug)]
pub struct RandomUniformLike {
    pub low: f32,
    pub high: f32,
    pub seed: RandomSeed,
}

impl Default for RandomUniformLike {
    fn default() -> RandomUniformLike {
        RandomUniformLike {
            low: 0.,
            high: 1.,
            seed: RandomSeed::new(None),
        }
    }
}

/// `RandomNormal` with the output shape taken from the input tensor.
#[derive(Clone, Debug)]
pub struct RandomNormalLike {
    pub mean: f32,
    pub scale: f32,
    pub seed: RandomSeed,
}

impl Default for RandomNormalLike {
    fn default() -> RandomNormalLike {
        RandomNormalLike {
            mean: 0.,
            scale: 1.,
            seed: RandomSeed::new(None),
        }
    }
}

/// Parameters for the `Bernoulli` layer. `dtype` overrides the output
/// element type, which otherwise follows the input.
#[derive(Clone, Debug, Default)]
pub struct Bernoulli {
    pub dtype: Option<DataType>,
    pub seed: RandomSeed,
}

/// Parameters for the `Multinomial` layer, which draws `sample_size` class
/// indices per batch row from the distribution given by a logits input.
#[derive(Clone, Debug)]
pub struct Multinomial {
    pub sample_size: usize,
    pub seed: RandomSeed,
}

impl Default for Multinomial {
    fn default() -> Multinomial {
        Multinomial {
            sample_size: 1,
            seed: RandomSeed::new(None),
        }
    }
}

/// Generator layers know their output shape exactly from the attribute.
pub(crate) fn infer_generate(shape: &[usize]) -> PartialTensor {
    PartialTensor::new(DataType::Float, SymShape::fixed(shape))
}

pub(crate) fn infer_generate_like(inputs: &PartialInputs) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    Ok(PartialTensor::new(DataType::Float, x.shape().clone()))
}

pub(crate) fn infer_bernoulli(
    params: &Bernoulli,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let dtype = params.dtype.unwrap_or(x.dtype());
    Ok(PartialTensor::new(dtype, x.shape().clone()))
}

pub(crate) fn infer_multinomial(
    params: &Multinomial,
    inputs: &PartialInputs,
) -> Result<PartialTensor, LayerError> {
    let x = inputs.require(0)?;
    let shape = x.shape().declare_rank(2)?;
    Ok(PartialTensor::new(
        DataType::Int,
        SymShape::from_dims(vec![
            shape.dim(0),
            SymDim::Value(params.sample_size as i32),
        ]),
    ))
}

pub(crate) fn execute_uniform(params: &RandomUniform, backend: &mut dyn Backend) -> Value {
    backend
        .random_uniform(&params.shape, params.low, params.high, params.seed.next_seed())
        .into()
}

pub(crate) fn execute_normal(params: &RandomNormal, backend: &mut dyn Backend) -> Value {
    backend
        .random_normal(&params.shape, params.mean, params.scale, params.seed.next_seed())
        .into()
}

pub(crate) fn execute_uniform_like(
    params: &RandomUniformLike,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    Ok(backend
        .random_uniform(x.shape(), params.low, params.high, params.seed.next_seed())
        .into())
}

pub(crate) fn execute_normal_like(
    params: &RandomNormalLike,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let x = inputs.require(0)?;
    Ok(backend
        .random_normal(x.shape(), params.mean, params.scale, params.seed.next_seed())
        .into())
}

pub(crate) fn execute_bernoulli(
    params: &Bernoulli,
    inputs: &Inputs,
    backend: &mut dyn Backend,
) -> Result<Value, LayerError> {
    let probs = inputs.require_float(0)?;
    let dtype = params.dtype.unwrap_or(DataType::Float);
    Ok(backend.bernoulli(probs, params.seed.next_seed(), dtype))
}

/// Sample class indices from per-row logit distributions by inverse CDF
/// lookup. Runs in the core rather than the backend so every backend shares
/// one sampling definition.
pub(crate) fn execute_multinomial(
    params: &Multinomial,
    inputs: &Inputs,
) -> Result<Value, LayerError> {
    let logits = inputs.require_float(0)?;
    if logits.ndim() != 2 {
        return Err(LayerError::RankMismatch {
            expected: 2,
            actual: logits.ndim(),
        });
    }
    let classes = logits.size(1);
    if classes == 0 {
        return Err(LayerError::ValueError(
            "multinomial requires at least one class",
        ));
    }

    let mut rng = fastrand::Rng::with_seed(params.seed.next_seed());
    let mut out = Vec::with_capacity(logits.size(0) * params.sample_size);
    for row in logits.data().chunks(classes) {
        // Softmax numerator, max-subtracted so the exponentials cannot
        // overflow. The normalizing constant cancels in the CDF lookup.
        let max = row.iter().fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        let mut total = 0.;
        let cumulative: Vec<f32> = row
            .iter()
            .map(|&logit| {
                total += (logit - max).exp();
                total
            })
            .collect();
        for _ in 0..params.sample_size {
            let target = rng.f32() * total;
            let index = cumulative.partition_point(|&c| c <= target);
            out.push(index.min(classes - 1) as i32);
        }
    }
    Ok(Tensor::from_data(&[logits.size(0), params.sample_size], out).into())
}
