//! Layer descriptions and dispatch.
//!
//! A [`Layer`] names its input and output tensors and carries a
//! [`LayerKind`] describing the operation it performs. The kind is a closed
//! enum rather than a trait object so that the two dispatchers,
//! [`Layer::infer_partial`] and [`Layer::execute`], are plain exhaustive
//! matches. Applications that need an operation outside the built-in catalog
//! implement [`CustomLayer`] and wrap it in [`LayerKind::Custom`].

use std::ops::BitOr;

use parten_tensor::Tensor;
use smallvec::SmallVec;

use crate::backend::{
    ArgReduceOp, Backend, BinaryFloatOp, BinaryIntOp, CompareOp, DepthToSpaceMode, PadMode,
    ReduceOp, ScatterReduction, UnaryFloatOp, UnaryIntOp,
};
use crate::error::LayerError;
use crate::layers::{
    activation, convolution, custom::CustomLayer, indexing, logical, math, normalization,
    object_detection, pooling, random, recurrent, reduction, transformation, trigonometry,
    ArgReduce, AveragePool, Bernoulli, Conv, ConvTranspose, MaxPool, Multinomial, RandomNormal,
    RandomNormalLike, RandomUniform, RandomUniformLike, Reduce, RoiAlign, LSTM,
};
use crate::partial::{PartialElem, PartialTensor};
use crate::value::{DataType, Scalar, Value};

/// Bitset of markers attached to a layer.
///
/// Flags do not change how a layer runs. They carry intent for graph
/// tooling, such as protecting a layer from removal by an optimizer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerFlags(u32);

impl LayerFlags {
    /// No flags set.
    pub const NONE: LayerFlags = LayerFlags(0);

    /// The layer and its outputs must survive graph transformations.
    pub const PRESERVE: LayerFlags = LayerFlags(1);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: LayerFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: LayerFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: LayerFlags) {
        self.0 &= !other.0;
    }
}

impl BitOr for LayerFlags {
    type Output = LayerFlags;

    fn bitor(self, rhs: LayerFlags) -> LayerFlags {
        LayerFlags(self.0 | rhs.0)
    }
}

/// The operation a [`Layer`] performs.
///
/// Variants whose parameters are shared between several layers, or are too
/// numerous to inline, carry a parameter struct from [`crate::layers`].
#[derive(Debug)]
pub enum LayerKind {
    // Activations
    Celu { alpha: f32 },
    Elu { alpha: f32 },
    Erf,
    Gelu,
    HardSigmoid { alpha: f32, beta: f32 },
    HardSwish,
    LeakyRelu { alpha: f32 },
    LogSoftmax { axis: i32 },
    PRelu,
    Relu,
    Selu { alpha: f32, gamma: f32 },
    Sigmoid,
    Softmax { axis: i32 },
    Softplus,
    Softsign,
    Tanh,

    // Convolution
    Conv(Conv),
    ConvTranspose(ConvTranspose),

    // Indexing
    Gather { axis: i32 },
    GatherElements { axis: i32 },
    GatherND { batch_dims: usize },
    NonZero,
    OneHot { axis: i32 },
    ScatterElements { axis: i32, reduction: ScatterReduction },
    ScatterND { reduction: ScatterReduction },
    TopK { axis: i32, largest: bool, sorted: bool },

    // Logical and comparison
    And,
    Equal,
    Greater,
    GreaterOrEqual,
    IsInf { detect_negative: bool, detect_positive: bool },
    IsNaN,
    Less,
    LessOrEqual,
    Not,
    Or,
    Where,
    Xor,

    // Math
    Abs,
    Add,
    Ceil,
    Clip,
    CumSum { exclusive: bool, reverse: bool },
    Dense,
    Div,
    Einsum { equation: String },
    Exp,
    Floor,
    Log,
    MatMul,
    MatMul2D { transpose_a: bool, transpose_b: bool },
    Max,
    Mean,
    Min,
    Mod { fmod: bool },
    Mul,
    Neg,
    Pow,
    Range,
    Reciprocal,
    Round,
    Sign,
    Sqrt,
    Sub,
    Sum,

    // Normalization
    BatchNormalization { epsilon: f32 },
    InstanceNormalization { epsilon: f32 },
    LayerNormalization { axis: i32, epsilon: f32 },
    LRN { alpha: f32, beta: f32, bias: f32, size: usize },

    // Object detection
    NonMaxSuppression { center_point_box: bool },
    RoiAlign(RoiAlign),

    // Pooling
    AveragePool(AveragePool),
    GlobalAveragePool,
    GlobalMaxPool,
    MaxPool(MaxPool),

    // Random
    Bernoulli(Bernoulli),
    Multinomial(Multinomial),
    RandomNormal(RandomNormal),
    RandomNormalLike(RandomNormalLike),
    RandomUniform(RandomUniform),
    RandomUniformLike(RandomUniformLike),

    // Recurrent
    LSTM(LSTM),

    // Reduction
    ArgMax(ArgReduce),
    ArgMin(ArgReduce),
    ReduceL1(Reduce),
    ReduceL2(Reduce),
    ReduceLogSum(Reduce),
    ReduceLogSumExp(Reduce),
    ReduceMax(Reduce),
    ReduceMean(Reduce),
    ReduceMin(Reduce),
    ReduceProd(Reduce),
    ReduceSum(Reduce),
    ReduceSumSquare(Reduce),

    // Transformation
    Cast { to: DataType },
    Concat { axis: i32 },
    ConstantOfShape { value: Scalar },
    DepthToSpace { block_size: usize, mode: DepthToSpaceMode },
    Expand,
    Flatten { axis: i32 },
    Identity,
    Pad { mode: PadMode },
    Reshape { allow_zero: bool },
    Shape,
    Size,
    Slice,
    SpaceToDepth { block_size: usize },
    Split { axis: i32 },
    Squeeze,
    Tile,
    Transpose { perm: Option<Vec<usize>> },
    Trilu { upper: bool },
    Unsqueeze,

    // Trigonometry
    Acos,
    Asin,
    Atan,
    Cos,
    Cosh,
    Sin,
    Sinh,
    Tan,

    // Escape hatch for operations outside the catalog.
    Custom(Box<dyn CustomLayer>),
}

impl LayerKind {
    /// The operation name, as used in diagnostics and run traces.
    pub fn name(&self) -> &str {
        match self {
            LayerKind::Celu { .. } => "Celu",
            LayerKind::Elu { .. } => "Elu",
            LayerKind::Erf => "Erf",
            LayerKind::Gelu => "Gelu",
            LayerKind::HardSigmoid { .. } => "HardSigmoid",
            LayerKind::HardSwish => "HardSwish",
            LayerKind::LeakyRelu { .. } => "LeakyRelu",
            LayerKind::LogSoftmax { .. } => "LogSoftmax",
            LayerKind::PRelu => "PRelu",
            LayerKind::Relu => "Relu",
            LayerKind::Selu { .. } => "Selu",
            LayerKind::Sigmoid => "Sigmoid",
            LayerKind::Softmax { .. } => "Softmax",
            LayerKind::Softplus => "Softplus",
            LayerKind::Softsign => "Softsign",
            LayerKind::Tanh => "Tanh",
            LayerKind::Conv(_) => "Conv",
            LayerKind::ConvTranspose(_) => "ConvTranspose",
            LayerKind::Gather { .. } => "Gather",
            LayerKind::GatherElements { .. } => "GatherElements",
            LayerKind::GatherND { .. } => "GatherND",
            LayerKind::NonZero => "NonZero",
            LayerKind::OneHot { .. } => "OneHot",
            LayerKind::ScatterElements { .. } => "ScatterElements",
            LayerKind::ScatterND { .. } => "ScatterND",
            LayerKind::TopK { .. } => "TopK",
            LayerKind::And => "And",
            LayerKind::Equal => "Equal",
            LayerKind::Greater => "Greater",
            LayerKind::GreaterOrEqual => "GreaterOrEqual",
            LayerKind::IsInf { .. } => "IsInf",
            LayerKind::IsNaN => "IsNaN",
            LayerKind::Less => "Less",
            LayerKind::LessOrEqual => "LessOrEqual",
            LayerKind::Not => "Not",
            LayerKind::Or => "Or",
            LayerKind::Where => "Where",
            LayerKind::Xor => "Xor",
            LayerKind::Abs => "Abs",
            LayerKind::Add => "Add",
            LayerKind::Ceil => "Ceil",
            LayerKind::Clip => "Clip",
            LayerKind::CumSum { .. } => "CumSum",
            LayerKind::Dense => "Dense",
            LayerKind::Div => "Div",
            LayerKind::Einsum { .. } => "Einsum",
            LayerKind::Exp => "Exp",
            LayerKind::Floor => "Floor",
            LayerKind::Log => "Log",
            LayerKind::MatMul => "MatMul",
            LayerKind::MatMul2D { .. } => "MatMul2D",
            LayerKind::Max => "Max",
            LayerKind::Mean => "Mean",
            LayerKind::Min => "Min",
            LayerKind::Mod { .. } => "Mod",
            LayerKind::Mul => "Mul",
            LayerKind::Neg => "Neg",
            LayerKind::Pow => "Pow",
            LayerKind::Range => "Range",
            LayerKind::Reciprocal => "Reciprocal",
            LayerKind::Round => "Round",
            LayerKind::Sign => "Sign",
            LayerKind::Sqrt => "Sqrt",
            LayerKind::Sub => "Sub",
            LayerKind::Sum => "Sum",
            LayerKind::BatchNormalization { .. } => "BatchNormalization",
            LayerKind::InstanceNormalization { .. } => "InstanceNormalization",
            LayerKind::LayerNormalization { .. } => "LayerNormalization",
            LayerKind::LRN { .. } => "LRN",
            LayerKind::NonMaxSuppression { .. } => "NonMaxSuppression",
            LayerKind::RoiAlign(_) => "RoiAlign",
            LayerKind::AveragePool(_) => "AveragePool",
            LayerKind::GlobalAveragePool => "GlobalAveragePool",
            LayerKind::GlobalMaxPool => "GlobalMaxPool",
            LayerKind::MaxPool(_) => "MaxPool",
            LayerKind::Bernoulli(_) => "Bernoulli",
            LayerKind::Multinomial(_) => "Multinomial",
            LayerKind::RandomNormal(_) => "RandomNormal",
            LayerKind::RandomNormalLike(_) => "RandomNormalLike",
            LayerKind::RandomUniform(_) => "RandomUniform",
            LayerKind::RandomUniformLike(_) => "RandomUniformLike",
            LayerKind::LSTM(_) => "LSTM",
            LayerKind::ArgMax(_) => "ArgMax",
            LayerKind::ArgMin(_) => "ArgMin",
            LayerKind::ReduceL1(_) => "ReduceL1",
            LayerKind::ReduceL2(_) => "ReduceL2",
            LayerKind::ReduceLogSum(_) => "ReduceLogSum",
            LayerKind::ReduceLogSumExp(_) => "ReduceLogSumExp",
            LayerKind::ReduceMax(_) => "ReduceMax",
            LayerKind::ReduceMean(_) => "ReduceMean",
            LayerKind::ReduceMin(_) => "ReduceMin",
            LayerKind::ReduceProd(_) => "ReduceProd",
            LayerKind::ReduceSum(_) => "ReduceSum",
            LayerKind::ReduceSumSquare(_) => "ReduceSumSquare",
            LayerKind::Cast { .. } => "Cast",
            LayerKind::Concat { .. } => "Concat",
            LayerKind::ConstantOfShape { .. } => "ConstantOfShape",
            LayerKind::DepthToSpace { .. } => "DepthToSpace",
            LayerKind::Expand => "Expand",
            LayerKind::Flatten { .. } => "Flatten",
            LayerKind::Identity => "Identity",
            LayerKind::Pad { .. } => "Pad",
            LayerKind::Reshape { .. } => "Reshape",
            LayerKind::Shape => "Shape",
            LayerKind::Size => "Size",
            LayerKind::Slice => "Slice",
            LayerKind::SpaceToDepth { .. } => "SpaceToDepth",
            LayerKind::Split { .. } => "Split",
            LayerKind::Squeeze => "Squeeze",
            LayerKind::Tile => "Tile",
            LayerKind::Transpose { .. } => "Transpose",
            LayerKind::Trilu { .. } => "Trilu",
            LayerKind::Unsqueeze => "Unsqueeze",
            LayerKind::Acos => "Acos",
            LayerKind::Asin => "Asin",
            LayerKind::Atan => "Atan",
            LayerKind::Cos => "Cos",
            LayerKind::Cosh => "Cosh",
            LayerKind::Sin => "Sin",
            LayerKind::Sinh => "Sinh",
            LayerKind::Tan => "Tan",
            LayerKind::Custom(layer) => layer.name(),
        }
    }

    /// Infer the partial outputs for this operation.
    fn infer_partial(
        &self,
        inputs: &PartialInputs,
        n_outputs: usize,
    ) -> Result<Vec<PartialTensor>, LayerError> {
        use LayerKind::*;

        match self {
            Celu { .. } | Elu { .. } | Erf | Gelu | HardSigmoid { .. } | HardSwish
            | LeakyRelu { .. } | Selu { .. } | Sigmoid | Softplus | Softsign | Tanh
            | Softmax { .. } | LogSoftmax { .. } => Ok(vec![activation::infer(inputs)?]),
            PRelu => Ok(vec![activation::infer_prelu(inputs)?]),
            // Dtype passes through for the ops that also run over ints.
            Relu | Abs | Neg | Sign | Clip => Ok(vec![math::infer_same(inputs)?]),
            Ceil | Exp | Floor | Log | Reciprocal | Round | Sqrt => {
                Ok(vec![math::infer_same(inputs)?])
            }

            Conv(params) => Ok(vec![convolution::infer_conv(params, inputs)?]),
            ConvTranspose(params) => {
                Ok(vec![convolution::infer_conv_transpose(params, inputs)?])
            }

            Gather { axis } => Ok(vec![indexing::infer_gather(*axis, inputs)?]),
            GatherElements { axis } => {
                Ok(vec![indexing::infer_gather_elements(*axis, inputs)?])
            }
            GatherND { batch_dims } => {
                Ok(vec![indexing::infer_gather_nd(*batch_dims, inputs)?])
            }
            NonZero => Ok(vec![indexing::infer_non_zero(inputs)?]),
            OneHot { axis } => Ok(vec![indexing::infer_one_hot(*axis, inputs)?]),
            ScatterElements { .. } | ScatterND { .. } => {
                Ok(vec![indexing::infer_scatter(inputs)?])
            }
            TopK { axis, .. } => indexing::infer_top_k(*axis, inputs),

            And => Ok(vec![logical::infer_and(inputs)?]),
            Or => Ok(vec![logical::infer_or(inputs)?]),
            Xor => Ok(vec![logical::infer_xor(inputs)?]),
            Equal => Ok(vec![logical::infer_compare(CompareOp::Equal, inputs)?]),
            Greater => Ok(vec![logical::infer_compare(CompareOp::Greater, inputs)?]),
            GreaterOrEqual => Ok(vec![logical::infer_compare(
                CompareOp::GreaterOrEqual,
                inputs,
            )?]),
            Less => Ok(vec![logical::infer_compare(CompareOp::Less, inputs)?]),
            LessOrEqual => Ok(vec![logical::infer_compare(CompareOp::LessOrEqual, inputs)?]),
            IsInf { .. } | IsNaN | Not => Ok(vec![logical::infer_predicate(inputs)?]),
            Where => Ok(vec![logical::infer_where(inputs)?]),

            Add => Ok(vec![math::infer_broadcast(
                inputs,
                None,
                Some(PartialElem::add),
            )?]),
            Sub => Ok(vec![math::infer_broadcast(
                inputs,
                None,
                Some(PartialElem::sub),
            )?]),
            Mul => Ok(vec![math::infer_broadcast(
                inputs,
                None,
                Some(PartialElem::mul),
            )?]),
            Div => Ok(vec![math::infer_broadcast(
                inputs,
                None,
                Some(PartialElem::div),
            )?]),
            Max => Ok(vec![math::infer_broadcast(inputs, None, Some(math::fold_max))?]),
            Min => Ok(vec![math::infer_broadcast(inputs, None, Some(math::fold_min))?]),
            Sum => Ok(vec![math::infer_broadcast(
                inputs,
                None,
                Some(PartialElem::add),
            )?]),
            Mean | Mod { .. } | Pow => Ok(vec![math::infer_broadcast(inputs, None, None)?]),
            CumSum { .. } => Ok(vec![math::infer_cum_sum(inputs)?]),
            Dense => Ok(vec![math::infer_dense(inputs)?]),
            Einsum { equation } => Ok(vec![math::infer_einsum(equation, inputs)?]),
            MatMul => Ok(vec![math::infer_matmul(inputs)?]),
            MatMul2D {
                transpose_a,
                transpose_b,
            } => Ok(vec![math::infer_matmul_2d(
                *transpose_a,
                *transpose_b,
                inputs,
            )?]),
            Range => Ok(vec![math::infer_range(inputs)?]),

            BatchNormalization { .. } => Ok(vec![normalization::infer_batch_norm(inputs)?]),
            InstanceNormalization { .. } => {
                Ok(vec![normalization::infer_instance_norm(inputs)?])
            }
            LayerNormalization { axis, .. } => {
                Ok(vec![normalization::infer_layer_norm(*axis, inputs)?])
            }
            LRN { .. } => Ok(vec![normalization::infer_lrn(inputs)?]),

            NonMaxSuppression { .. } => Ok(vec![object_detection::infer_nms(inputs)?]),
            RoiAlign(params) => Ok(vec![object_detection::infer_roi_align(params, inputs)?]),

            AveragePool(params) => Ok(vec![pooling::infer_average_pool(params, inputs)?]),
            MaxPool(params) => Ok(vec![pooling::infer_max_pool(params, inputs)?]),
            GlobalAveragePool | GlobalMaxPool => Ok(vec![pooling::infer_global_pool(inputs)?]),

            Bernoulli(params) => Ok(vec![random::infer_bernoulli(params, inputs)?]),
            Multinomial(params) => Ok(vec![random::infer_multinomial(params, inputs)?]),
            RandomNormal(params) => Ok(vec![random::infer_generate(&params.shape)]),
            RandomUniform(params) => Ok(vec![random::infer_generate(&params.shape)]),
            RandomNormalLike(_) | RandomUniformLike(_) => {
                Ok(vec![random::infer_generate_like(inputs)?])
            }

            LSTM(params) => recurrent::infer_lstm(params, inputs),

            ArgMax(params) | ArgMin(params) => {
                Ok(vec![reduction::infer_arg_reduce(params, inputs)?])
            }
            ReduceL1(params) | ReduceL2(params) | ReduceLogSum(params)
            | ReduceLogSumExp(params) | ReduceMax(params) | ReduceMean(params)
            | ReduceMin(params) | ReduceProd(params) | ReduceSum(params)
            | ReduceSumSquare(params) => Ok(vec![reduction::infer_reduce(params, inputs)?]),

            Cast { to } => Ok(vec![transformation::infer_cast(*to, inputs)?]),
            Concat { axis } => Ok(vec![transformation::infer_concat(*axis, inputs)?]),
            ConstantOfShape { value } => {
                Ok(vec![transformation::infer_constant_of_shape(*value, inputs)?])
            }
            DepthToSpace { block_size, .. } => {
                Ok(vec![transformation::infer_depth_to_space(*block_size, inputs)?])
            }
            Expand => Ok(vec![transformation::infer_expand(inputs)?]),
            Flatten { axis } => Ok(vec![transformation::infer_flatten(*axis, inputs)?]),
            Identity => Ok(vec![transformation::infer_identity(inputs)?]),
            Pad { .. } => Ok(vec![transformation::infer_pad(inputs)?]),
            Reshape { allow_zero } => {
                Ok(vec![transformation::infer_reshape(*allow_zero, inputs)?])
            }
            Shape => Ok(vec![transformation::infer_shape(inputs)?]),
            Size => Ok(vec![transformation::infer_size(inputs)?]),
            Slice => Ok(vec![transformation::infer_slice(inputs)?]),
            SpaceToDepth { block_size } => {
                Ok(vec![transformation::infer_space_to_depth(*block_size, inputs)?])
            }
            Split { axis } => transformation::infer_split(*axis, n_outputs, inputs),
            Squeeze => Ok(vec![transformation::infer_squeeze(inputs)?]),
            Tile => Ok(vec![transformation::infer_tile(inputs)?]),
            Transpose { perm } => {
                Ok(vec![transformation::infer_transpose(perm.as_deref(), inputs)?])
            }
            Trilu { .. } => Ok(vec![transformation::infer_trilu(inputs)?]),
            Unsqueeze => Ok(vec![transformation::infer_unsqueeze(inputs)?]),

            Acos | Asin | Atan | Cos | Cosh | Sin | Sinh | Tan => {
                Ok(vec![trigonometry::infer(inputs)?])
            }

            Custom(layer) => layer.infer_partial(inputs),
        }
    }

    /// Execute this operation against `backend`.
    fn execute(
        &self,
        inputs: &Inputs,
        backend: &mut dyn Backend,
        n_outputs: usize,
    ) -> Result<Vec<Value>, LayerError> {
        use LayerKind::*;

        match self {
            Celu { alpha } => Ok(vec![activation::execute_unary(
                UnaryFloatOp::Celu { alpha: *alpha },
                inputs,
                backend,
            )?]),
            Elu { alpha } => Ok(vec![activation::execute_unary(
                UnaryFloatOp::Elu { alpha: *alpha },
                inputs,
                backend,
            )?]),
            Erf => Ok(vec![activation::execute_unary(UnaryFloatOp::Erf, inputs, backend)?]),
            Gelu => Ok(vec![activation::execute_unary(UnaryFloatOp::Gelu, inputs, backend)?]),
            HardSigmoid { alpha, beta } => Ok(vec![activation::execute_unary(
                UnaryFloatOp::HardSigmoid {
                    alpha: *alpha,
                    beta: *beta,
                },
                inputs,
                backend,
            )?]),
            HardSwish => Ok(vec![activation::execute_unary(
                UnaryFloatOp::HardSwish,
                inputs,
                backend,
            )?]),
            LeakyRelu { alpha } => Ok(vec![activation::execute_unary(
                UnaryFloatOp::LeakyRelu { alpha: *alpha },
                inputs,
                backend,
            )?]),
            LogSoftmax { axis } => {
                Ok(vec![activation::execute_softmax(*axis, true, inputs, backend)?])
            }
            PRelu => Ok(vec![activation::execute_prelu(inputs, backend)?]),
            Relu => Ok(vec![activation::execute_relu(inputs, backend)?]),
            Selu { alpha, gamma } => Ok(vec![activation::execute_unary(
                UnaryFloatOp::Selu {
                    alpha: *alpha,
                    gamma: *gamma,
                },
                inputs,
                backend,
            )?]),
            Sigmoid => Ok(vec![activation::execute_unary(
                UnaryFloatOp::Sigmoid,
                inputs,
                backend,
            )?]),
            Softmax { axis } => {
                Ok(vec![activation::execute_softmax(*axis, false, inputs, backend)?])
            }
            Softplus => Ok(vec![activation::execute_unary(
                UnaryFloatOp::Softplus,
                inputs,
                backend,
            )?]),
            Softsign => Ok(vec![activation::execute_unary(
                UnaryFloatOp::Softsign,
                inputs,
                backend,
            )?]),
            Tanh => Ok(vec![activation::execute_unary(UnaryFloatOp::Tanh, inputs, backend)?]),

            Conv(params) => Ok(vec![convolution::execute_conv(params, inputs, backend)?]),
            ConvTranspose(params) => Ok(vec![convolution::execute_conv_transpose(
                params, inputs, backend,
            )?]),

            Gather { axis } => Ok(vec![indexing::execute_gather(*axis, inputs, backend)?]),
            GatherElements { axis } => Ok(vec![indexing::execute_gather_elements(
                *axis, inputs, backend,
            )?]),
            GatherND { batch_dims } => Ok(vec![indexing::execute_gather_nd(
                *batch_dims,
                inputs,
                backend,
            )?]),
            NonZero => Ok(vec![indexing::execute_non_zero(inputs, backend)?]),
            OneHot { axis } => Ok(vec![indexing::execute_one_hot(*axis, inputs, backend)?]),
            ScatterElements { axis, reduction } => Ok(vec![indexing::execute_scatter_elements(
                *axis, *reduction, inputs, backend,
            )?]),
            ScatterND { reduction } => Ok(vec![indexing::execute_scatter_nd(
                *reduction, inputs, backend,
            )?]),
            TopK {
                axis,
                largest,
                sorted,
            } => indexing::execute_top_k(*axis, *largest, *sorted, inputs, backend),

            And => Ok(vec![logical::execute_logical_binary(
                BinaryIntOp::And,
                inputs,
                backend,
            )?]),
            Or => Ok(vec![logical::execute_logical_binary(
                BinaryIntOp::Or,
                inputs,
                backend,
            )?]),
            Xor => Ok(vec![logical::execute_logical_binary(
                BinaryIntOp::Xor,
                inputs,
                backend,
            )?]),
            Not => Ok(vec![logical::execute_not(inputs, backend)?]),
            Equal => Ok(vec![logical::execute_compare(CompareOp::Equal, inputs, backend)?]),
            Greater => Ok(vec![logical::execute_compare(
                CompareOp::Greater,
                inputs,
                backend,
            )?]),
            GreaterOrEqual => Ok(vec![logical::execute_compare(
                CompareOp::GreaterOrEqual,
                inputs,
                backend,
            )?]),
            Less => Ok(vec![logical::execute_compare(CompareOp::Less, inputs, backend)?]),
            LessOrEqual => Ok(vec![logical::execute_compare(
                CompareOp::LessOrEqual,
                inputs,
                backend,
            )?]),
            IsInf {
                detect_negative,
                detect_positive,
            } => Ok(vec![logical::execute_is_inf(
                *detect_negative,
                *detect_positive,
                inputs,
                backend,
            )?]),
            IsNaN => Ok(vec![logical::execute_is_nan(inputs, backend)?]),
            Where => Ok(vec![logical::execute_where(inputs, backend)?]),

            Abs => Ok(vec![math::execute_unary(
                UnaryFloatOp::Abs,
                Some(UnaryIntOp::Abs),
                inputs,
                backend,
            )?]),
            Neg => Ok(vec![math::execute_unary(
                UnaryFloatOp::Neg,
                Some(UnaryIntOp::Neg),
                inputs,
                backend,
            )?]),
            Sign => Ok(vec![math::execute_unary(
                UnaryFloatOp::Sign,
                Some(UnaryIntOp::Sign),
                inputs,
                backend,
            )?]),
            Ceil => Ok(vec![math::execute_unary(UnaryFloatOp::Ceil, None, inputs, backend)?]),
            Exp => Ok(vec![math::execute_unary(UnaryFloatOp::Exp, None, inputs, backend)?]),
            Floor => Ok(vec![math::execute_unary(
                UnaryFloatOp::Floor,
                None,
                inputs,
                backend,
            )?]),
            Log => Ok(vec![math::execute_unary(UnaryFloatOp::Log, None, inputs, backend)?]),
            Reciprocal => Ok(vec![math::execute_unary(
                UnaryFloatOp::Reciprocal,
                None,
                inputs,
                backend,
            )?]),
            Round => Ok(vec![math::execute_unary(
                UnaryFloatOp::Round,
                None,
                inputs,
                backend,
            )?]),
            Sqrt => Ok(vec![math::execute_unary(UnaryFloatOp::Sqrt, None, inputs, backend)?]),
            Add => Ok(vec![math::execute_binary(
                BinaryFloatOp::Add,
                Some(BinaryIntOp::Add),
                inputs,
                backend,
            )?]),
            Sub => Ok(vec![math::execute_binary(
                BinaryFloatOp::Sub,
                Some(BinaryIntOp::Sub),
                inputs,
                backend,
            )?]),
            Mul => Ok(vec![math::execute_binary(
                BinaryFloatOp::Mul,
                Some(BinaryIntOp::Mul),
                inputs,
                backend,
            )?]),
            Div => Ok(vec![math::execute_binary(
                BinaryFloatOp::Div,
                Some(BinaryIntOp::Div),
                inputs,
                backend,
            )?]),
            Mod { fmod } => Ok(vec![math::execute_binary(
                BinaryFloatOp::Mod { fmod: *fmod },
                Some(BinaryIntOp::Mod { fmod: *fmod }),
                inputs,
                backend,
            )?]),
            Pow => Ok(vec![math::execute_pow(inputs, backend)?]),
            Max => Ok(vec![math::execute_variadic(ReduceOp::Max, inputs, backend)?]),
            Mean => Ok(vec![math::execute_variadic(ReduceOp::Mean, inputs, backend)?]),
            Min => Ok(vec![math::execute_variadic(ReduceOp::Min, inputs, backend)?]),
            Sum => Ok(vec![math::execute_variadic(ReduceOp::Sum, inputs, backend)?]),
            Clip => Ok(vec![math::execute_clip(inputs, backend)?]),
            CumSum { exclusive, reverse } => Ok(vec![math::execute_cum_sum(
                *exclusive, *reverse, inputs, backend,
            )?]),
            Dense => Ok(vec![math::execute_dense(inputs, backend)?]),
            Einsum { equation } => Ok(vec![math::execute_einsum(equation, inputs, backend)?]),
            MatMul => Ok(vec![math::execute_matmul(inputs, backend)?]),
            MatMul2D {
                transpose_a,
                transpose_b,
            } => Ok(vec![math::execute_matmul_2d(
                *transpose_a,
                *transpose_b,
                inputs,
                backend,
            )?]),
            Range => Ok(vec![math::execute_range(inputs, backend)?]),

            BatchNormalization { epsilon } => Ok(vec![normalization::execute_batch_norm(
                *epsilon, inputs, backend,
            )?]),
            InstanceNormalization { epsilon } => Ok(vec![
                normalization::execute_instance_norm(*epsilon, inputs, backend)?,
            ]),
            LayerNormalization { axis, epsilon } => Ok(vec![normalization::execute_layer_norm(
                *axis, *epsilon, inputs, backend,
            )?]),
            LRN {
                alpha,
                beta,
                bias,
                size,
            } => Ok(vec![normalization::execute_lrn(
                *alpha, *beta, *bias, *size, inputs, backend,
            )?]),

            NonMaxSuppression { center_point_box } => {
                Ok(vec![object_detection::execute_nms(*center_point_box, inputs)?])
            }
            RoiAlign(params) => Ok(vec![object_detection::execute_roi_align(
                params, inputs, backend,
            )?]),

            AveragePool(params) => {
                Ok(vec![pooling::execute_average_pool(params, inputs, backend)?])
            }
            MaxPool(params) => Ok(vec![pooling::execute_max_pool(params, inputs, backend)?]),
            GlobalAveragePool => {
                Ok(vec![pooling::execute_global_average_pool(inputs, backend)?])
            }
            GlobalMaxPool => Ok(vec![pooling::execute_global_max_pool(inputs, backend)?]),

            Bernoulli(params) => Ok(vec![random::execute_bernoulli(params, inputs, backend)?]),
            Multinomial(params) => Ok(vec![random::execute_multinomial(params, inputs)?]),
            RandomNormal(params) => Ok(vec![random::execute_normal(params, backend)]),
            RandomNormalLike(params) => {
                Ok(vec![random::execute_normal_like(params, inputs, backend)?])
            }
            RandomUniform(params) => Ok(vec![random::execute_uniform(params, backend)]),
            RandomUniformLike(params) => {
                Ok(vec![random::execute_uniform_like(params, inputs, backend)?])
            }

            LSTM(params) => recurrent::execute_lstm(params, inputs, backend),

            ArgMax(params) => Ok(vec![reduction::execute_arg_reduce(
                ArgReduceOp::Max,
                params,
                inputs,
                backend,
            )?]),
            ArgMin(params) => Ok(vec![reduction::execute_arg_reduce(
                ArgReduceOp::Min,
                params,
                inputs,
                backend,
            )?]),
            ReduceL1(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::L1,
                params,
                inputs,
                backend,
            )?]),
            ReduceL2(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::L2,
                params,
                inputs,
                backend,
            )?]),
            ReduceLogSum(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::LogSum,
                params,
                inputs,
                backend,
            )?]),
            ReduceLogSumExp(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::LogSumExp,
                params,
                inputs,
                backend,
            )?]),
            ReduceMax(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::Max,
                params,
                inputs,
                backend,
            )?]),
            ReduceMean(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::Mean,
                params,
                inputs,
                backend,
            )?]),
            ReduceMin(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::Min,
                params,
                inputs,
                backend,
            )?]),
            ReduceProd(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::Prod,
                params,
                inputs,
                backend,
            )?]),
            ReduceSum(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::Sum,
                params,
                inputs,
                backend,
            )?]),
            ReduceSumSquare(params) => Ok(vec![reduction::execute_reduce(
                ReduceOp::SumSquare,
                params,
                inputs,
                backend,
            )?]),

            Cast { to } => Ok(vec![transformation::execute_cast(*to, inputs, backend)?]),
            Concat { axis } => Ok(vec![transformation::execute_concat(*axis, inputs, backend)?]),
            ConstantOfShape { value } => Ok(vec![transformation::execute_constant_of_shape(
                *value, inputs, backend,
            )?]),
            DepthToSpace { block_size, mode } => Ok(vec![transformation::execute_depth_to_space(
                *block_size,
                *mode,
                inputs,
                backend,
            )?]),
            Expand => Ok(vec![transformation::execute_expand(inputs, backend)?]),
            Flatten { axis } => Ok(vec![transformation::execute_flatten(*axis, inputs, backend)?]),
            Identity => Ok(vec![transformation::execute_identity(inputs, backend)?]),
            Pad { mode } => Ok(vec![transformation::execute_pad(*mode, inputs, backend)?]),
            Reshape { allow_zero } => Ok(vec![transformation::execute_reshape(
                *allow_zero,
                inputs,
                backend,
            )?]),
            Shape => Ok(vec![transformation::execute_shape(inputs)?]),
            Size => Ok(vec![transformation::execute_size(inputs)?]),
            Slice => Ok(vec![transformation::execute_slice(inputs, backend)?]),
            SpaceToDepth { block_size } => Ok(vec![transformation::execute_space_to_depth(
                *block_size,
                inputs,
                backend,
            )?]),
            Split { axis } => transformation::execute_split(*axis, n_outputs, inputs, backend),
            Squeeze => Ok(vec![transformation::execute_squeeze(inputs, backend)?]),
            Tile => Ok(vec![transformation::execute_tile(inputs, backend)?]),
            Transpose { perm } => Ok(vec![transformation::execute_transpose(
                perm.as_deref(),
                inputs,
                backend,
            )?]),
            Trilu { upper } => Ok(vec![transformation::execute_trilu(*upper, inputs, backend)?]),
            Unsqueeze => Ok(vec![transformation::execute_unsqueeze(inputs, backend)?]),

            Acos => Ok(vec![trigonometry::execute(UnaryFloatOp::Acos, inputs, backend)?]),
            Asin => Ok(vec![trigonometry::execute(UnaryFloatOp::Asin, inputs, backend)?]),
            Atan => Ok(vec![trigonometry::execute(UnaryFloatOp::Atan, inputs, backend)?]),
            Cos => Ok(vec![trigonometry::execute(UnaryFloatOp::Cos, inputs, backend)?]),
            Cosh => Ok(vec![trigonometry::execute(UnaryFloatOp::Cosh, inputs, backend)?]),
            Sin => Ok(vec![trigonometry::execute(UnaryFloatOp::Sin, inputs, backend)?]),
            Sinh => Ok(vec![trigonometry::execute(UnaryFloatOp::Sinh, inputs, backend)?]),
            Tan => Ok(vec![trigonometry::execute(UnaryFloatOp::Tan, inputs, backend)?]),

            Custom(layer) => layer.execute(inputs, backend),
        }
    }
}

/// Inference results paired with the output names they bind to. The primary
/// output comes first.
pub type InferredList = SmallVec<[(String, PartialTensor); 1]>;

/// Execution results paired with the output names they bind to. The primary
/// output comes first.
pub type OutputList = SmallVec<[(String, Value); 1]>;

/// A named operation in a model graph.
///
/// Inputs and outputs are referred to by tensor name. An empty input name
/// marks an omitted optional input. The first output shares the layer's
/// name.
#[derive(Debug)]
pub struct Layer {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    flags: LayerFlags,
    kind: LayerKind,
}

impl Layer {
    /// Create a layer with a single output named after the layer.
    pub fn new(name: &str, inputs: &[&str], kind: LayerKind) -> Layer {
        Layer {
            name: name.to_string(),
            inputs: inputs.iter().map(|name| name.to_string()).collect(),
            outputs: vec![name.to_string()],
            flags: LayerFlags::NONE,
            kind,
        }
    }

    /// Create a layer with several outputs. The first output must be named
    /// after the layer.
    pub fn with_outputs(name: &str, inputs: &[&str], outputs: &[&str], kind: LayerKind) -> Layer {
        assert!(!outputs.is_empty(), "a layer must have at least one output");
        assert_eq!(outputs[0], name, "the first output must match the layer name");
        Layer {
            name: name.to_string(),
            inputs: inputs.iter().map(|name| name.to_string()).collect(),
            outputs: outputs.iter().map(|name| name.to_string()).collect(),
            flags: LayerFlags::NONE,
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the input tensors. An empty name marks an omitted optional
    /// input.
    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    pub fn flags(&self) -> LayerFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: LayerFlags) {
        self.flags = flags;
    }

    /// Run shape and value inference over partially known inputs.
    ///
    /// Returns one `(name, tensor)` pair per declared output, primary output
    /// first. Fails if the operation produces a different number of results
    /// than the layer declares outputs.
    pub fn infer_partial(&self, inputs: &PartialInputs) -> Result<InferredList, LayerError> {
        let results = self.kind.infer_partial(inputs, self.outputs.len())?;
        self.pair_outputs(results)
    }

    /// Execute the layer over concrete inputs.
    ///
    /// All validation happens here; the backend is only handed calls that
    /// honor its documented preconditions.
    pub fn execute(
        &self,
        inputs: &Inputs,
        backend: &mut dyn Backend,
    ) -> Result<OutputList, LayerError> {
        let results = self.kind.execute(inputs, backend, self.outputs.len())?;
        self.pair_outputs(results)
    }

    fn pair_outputs<T>(&self, results: Vec<T>) -> Result<SmallVec<[(String, T); 1]>, LayerError> {
        if results.len() != self.outputs.len() {
            return Err(LayerError::ValueError(
                "layer declares the wrong number of outputs",
            ));
        }
        Ok(self.outputs.iter().cloned().zip(results).collect())
    }
}

/// The inputs to a layer during partial inference.
///
/// Entries are `None` where an optional input was omitted.
pub struct PartialInputs<'a> {
    inputs: &'a [Option<&'a PartialTensor>],
}

impl<'a> PartialInputs<'a> {
    pub fn from_slice(inputs: &'a [Option<&'a PartialTensor>]) -> PartialInputs<'a> {
        PartialInputs { inputs }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Get an optional input.
    pub fn get(&self, index: usize) -> Option<&'a PartialTensor> {
        self.inputs.get(index).copied().flatten()
    }

    /// Get a required input.
    pub fn require(&self, index: usize) -> Result<&'a PartialTensor, LayerError> {
        self.get(index)
            .ok_or(LayerError::ValueError("missing a required input"))
    }
}

/// The inputs to a layer during execution.
///
/// Entries are `None` where an optional input was omitted.
pub struct Inputs<'a> {
    inputs: &'a [Option<&'a Value>],
}

impl<'a> Inputs<'a> {
    pub fn from_slice(inputs: &'a [Option<&'a Value>]) -> Inputs<'a> {
        Inputs { inputs }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Get an optional input.
    pub fn get(&self, index: usize) -> Option<&'a Value> {
        self.inputs.get(index).copied().flatten()
    }

    /// Get a required input.
    pub fn require(&self, index: usize) -> Result<&'a Value, LayerError> {
        self.get(index)
            .ok_or(LayerError::ValueError("missing a required input"))
    }

    /// Get an optional input that must be a float tensor if present.
    pub fn get_float(&self, index: usize) -> Result<Option<&'a Tensor<f32>>, LayerError> {
        match self.get(index) {
            None => Ok(None),
            Some(Value::Float(t)) => Ok(Some(t)),
            Some(Value::Int(_)) => {
                Err(LayerError::UnsupportedDataType("expected a float tensor"))
            }
        }
    }

    /// Get a required float tensor input.
    pub fn require_float(&self, index: usize) -> Result<&'a Tensor<f32>, LayerError> {
        self.get_float(index)?
            .ok_or(LayerError::ValueError("missing a required input"))
    }

    /// Get an optional input that must be an int tensor if present.
    pub fn get_int(&self, index: usize) -> Result<Option<&'a Tensor<i32>>, LayerError> {
        match self.get(index) {
            None => Ok(None),
            Some(Value::Int(t)) => Ok(Some(t)),
            Some(Value::Float(_)) => {
                Err(LayerError::UnsupportedDataType("expected an int tensor"))
            }
        }
    }

    /// Get a required int tensor input.
    pub fn require_int(&self, index: usize) -> Result<&'a Tensor<i32>, LayerError> {
        self.get_int(index)?
            .ok_or(LayerError::ValueError("missing a required input"))
    }

    /// Get an optional single-element float input.
    pub fn get_scalar_float(&self, index: usize) -> Result<Option<f32>, LayerError> {
        match self.get_float(index)? {
            None => Ok(None),
            Some(t) if t.len() == 1 => Ok(Some(t.data()[0])),
            Some(_) => Err(LayerError::ValueError("expected a scalar input")),
        }
    }

    /// Get a required single-element float input.
    pub fn require_scalar_float(&self, index: usize) -> Result<f32, LayerError> {
        self.get_scalar_float(index)?
            .ok_or(LayerError::ValueError("missing a required input"))
    }

    /// Get an optional single-element int input.
    pub fn get_scalar_int(&self, index: usize) -> Result<Option<i32>, LayerError> {
        match self.get_int(index)? {
            None => Ok(None),
            Some(t) if t.len() == 1 => Ok(Some(t.data()[0])),
            Some(_) => Err(LayerError::ValueError("expected a scalar input")),
        }
    }

    /// Get a required single-element int input.
    pub fn require_scalar_int(&self, index: usize) -> Result<i32, LayerError> {
        self.get_scalar_int(index)?
            .ok_or(LayerError::ValueError("missing a required input"))
    }
}

#[cfg(test)]
mod tests {
    use parten_tensor::Tensor;

    use super::{Inputs, Layer, LayerFlags, LayerKind, PartialInputs};
    use crate::error::LayerError;
    use crate::partial::PartialTensor;
    use crate::value::{DataType, Value};

    #[test]
    fn test_layer_names() {
        let layer = Layer::new("relu_out", &["x"], LayerKind::Relu);
        assert_eq!(layer.name(), "relu_out");
        assert_eq!(layer.input_names(), &["x".to_string()]);
        assert_eq!(layer.output_names(), &["relu_out".to_string()]);
        assert_eq!(layer.n_outputs(), 1);
        assert_eq!(layer.kind().name(), "Relu");

        let layer = Layer::with_outputs(
            "values",
            &["x", "k"],
            &["values", "indices"],
            LayerKind::TopK {
                axis: -1,
                largest: true,
                sorted: true,
            },
        );
        assert_eq!(layer.n_outputs(), 2);
        assert_eq!(layer.output_names()[1], "indices");
    }

    #[test]
    #[should_panic(expected = "first output must match")]
    fn test_first_output_must_match_name() {
        Layer::with_outputs("out", &["x"], &["other", "out"], LayerKind::Relu);
    }

    #[test]
    fn test_flags() {
        let mut layer = Layer::new("out", &["x"], LayerKind::Relu);
        assert!(layer.flags().is_empty());
        assert!(!layer.flags().contains(LayerFlags::PRESERVE));

        layer.set_flags(LayerFlags::PRESERVE);
        assert!(layer.flags().contains(LayerFlags::PRESERVE));

        let mut flags = layer.flags();
        flags.remove(LayerFlags::PRESERVE);
        layer.set_flags(flags);
        assert!(layer.flags().is_empty());

        let mut flags = LayerFlags::NONE;
        flags.insert(LayerFlags::PRESERVE);
        assert_eq!(flags, LayerFlags::NONE | LayerFlags::PRESERVE);
    }

    #[test]
    fn test_output_count_mismatch() {
        let layer = Layer::with_outputs("out", &["x"], &["out", "extra"], LayerKind::Relu);
        let x = PartialTensor::unknown(DataType::Float);
        let result = layer.infer_partial(&PartialInputs::from_slice(&[Some(&x)]));
        assert_eq!(
            result.unwrap_err(),
            LayerError::ValueError("layer declares the wrong number of outputs")
        );
    }

    #[test]
    fn test_missing_required_input() {
        let layer = Layer::new("out", &["x"], LayerKind::Relu);
        let result = layer.infer_partial(&PartialInputs::from_slice(&[None]));
        assert_eq!(
            result.unwrap_err(),
            LayerError::ValueError("missing a required input")
        );
    }

    #[test]
    fn test_typed_accessors() {
        let float = Value::from(Tensor::from_data(&[2], vec![1.0f32, 2.0]));
        let int = Value::from(Tensor::from_data(&[2], vec![1, 2]));
        let scalar = Value::from(Tensor::scalar(3));
        let slice = [Some(&float), Some(&int), Some(&scalar), None];
        let inputs = Inputs::from_slice(&slice);

        assert_eq!(inputs.len(), 4);
        assert!(inputs.require_float(0).is_ok());
        assert!(inputs.require_int(1).is_ok());
        assert_eq!(inputs.require_scalar_int(2).unwrap(), 3);
        assert_eq!(inputs.get_scalar_float(3).unwrap(), None);

        assert_eq!(
            inputs.require_float(1).unwrap_err(),
            LayerError::UnsupportedDataType("expected a float tensor")
        );
        assert_eq!(
            inputs.require_int(0).unwrap_err(),
            LayerError::UnsupportedDataType("expected an int tensor")
        );
        assert_eq!(
            inputs.require_scalar_int(1).unwrap_err(),
            LayerError::ValueError("expected a scalar input")
        );
        assert_eq!(
            inputs.require(4).unwrap_err(),
            LayerError::ValueError("missing a required input")
        );
    }
}
