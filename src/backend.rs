//! The numeric capability interface that layers execute against.

use parten_tensor::Tensor;

use crate::value::{DataType, Value};

/// Unary elementwise operations over float tensors.
///
/// Parameterized operations carry their parameters as payload so that a
/// backend can dispatch on the whole operation at once.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnaryFloatOp {
    Abs,
    Acos,
    Asin,
    Atan,
    Ceil,
    Celu { alpha: f32 },
    Clip { min: Option<f32>, max: Option<f32> },
    Cos,
    Cosh,
    Elu { alpha: f32 },
    Erf,
    Exp,
    Floor,
    Gelu,
    HardSigmoid { alpha: f32, beta: f32 },
    HardSwish,
    LeakyRelu { alpha: f32 },
    Log,
    Neg,
    Reciprocal,
    Relu,
    Round,
    Selu { alpha: f32, gamma: f32 },
    Sigmoid,
    Sign,
    Sin,
    Sinh,
    Softplus,
    Softsign,
    Sqrt,
    Tan,
    Tanh,
}

/// Unary elementwise operations over int tensors.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnaryIntOp {
    Abs,
    Clip { min: Option<i32>, max: Option<i32> },
    Neg,
    /// Logical negation of a boolean tensor (zero or one per element).
    Not,
    Relu,
    Sign,
}

/// Binary elementwise operations over float tensors, with numpy
/// broadcasting.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinaryFloatOp {
    Add,
    Div,
    Max,
    Min,
    /// `fmod` selects C-style remainder (sign of the dividend) instead of
    /// Python-style modulus (sign of the divisor).
    Mod { fmod: bool },
    Mul,
    Pow,
    /// `max(0, x) + slope * min(0, x)` where the second operand is the
    /// slope.
    PRelu,
    Sub,
}

/// Binary elementwise operations over int tensors, with numpy
/// broadcasting.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinaryIntOp {
    Add,
    /// Boolean conjunction of zero-or-one tensors.
    And,
    Div,
    Max,
    Min,
    Mod { fmod: bool },
    Mul,
    Or,
    Pow,
    Sub,
    Xor,
}

/// Elementwise comparisons. The result is a boolean tensor with one int
/// per element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

/// Reductions over one or more axes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    L1,
    L2,
    LogSum,
    LogSumExp,
    Max,
    Mean,
    Min,
    Prod,
    Sum,
    SumSquare,
}

/// Reductions that return the index of an extreme element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgReduceOp {
    Max,
    Min,
}

/// How padded regions are filled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PadMode {
    Constant,
    Reflect,
    Edge,
}

/// Element order used when rearranging depth into spatial blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DepthToSpaceMode {
    /// Depth-column-row order.
    Dcr,
    /// Column-row-depth order.
    Crd,
}

/// How scatter operations combine an update with the existing element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScatterReduction {
    /// The update replaces the element.
    None,
    Add,
    Mul,
    Min,
    Max,
}

/// Pooling applied within each region of interest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RoiAlignMode {
    Avg,
    Max,
}

/// A normalized slice of one dimension.
///
/// Element `i` of the output reads input index `start + i * step`. Layers
/// resolve negative indices and clamp bounds before handing ranges to the
/// backend, so every index produced this way is in bounds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SliceRange {
    pub start: i32,
    pub step: i32,
    pub len: usize,
}

impl SliceRange {
    /// The identity slice over a dimension of `len` elements.
    pub fn full(len: usize) -> SliceRange {
        SliceRange {
            start: 0,
            step: 1,
            len,
        }
    }
}

/// The set of numeric primitives a layer may call during execution.
///
/// Layers validate dtypes, shapes and parameter ranges before calling into
/// the backend, so these methods are infallible: every call a layer makes
/// honors the documented preconditions. Primitives are keyed by operation
/// and element type; data-movement primitives come in `_float`/`_int`
/// pairs while numeric kernels that only make sense for floats (matmul,
/// convolution, normalization, softmax) have a single method.
///
/// The trait is object safe. Drivers hold a `&mut dyn Backend` so the same
/// graph can run against different implementations.
pub trait Backend {
    /// Allocate a zeroed tensor.
    fn alloc(&mut self, shape: &[usize], dtype: DataType) -> Value;

    /// Fill a tensor with a constant.
    fn mem_set_float(&mut self, x: &mut Tensor<f32>, value: f32);
    fn mem_set_int(&mut self, x: &mut Tensor<i32>, value: i32);

    /// Copy `src` into `dest`. Both tensors have the same element count.
    fn mem_copy_float(&mut self, src: &Tensor<f32>, dest: &mut Tensor<f32>);
    fn mem_copy_int(&mut self, src: &Tensor<i32>, dest: &mut Tensor<i32>);

    fn unary_float(&mut self, op: UnaryFloatOp, x: &Tensor<f32>) -> Tensor<f32>;
    fn unary_int(&mut self, op: UnaryIntOp, x: &Tensor<i32>) -> Tensor<i32>;

    /// Apply a binary operation with numpy broadcasting. `out_shape` is the
    /// broadcast of the operand shapes.
    fn binary_float(
        &mut self,
        op: BinaryFloatOp,
        a: &Tensor<f32>,
        b: &Tensor<f32>,
        out_shape: &[usize],
    ) -> Tensor<f32>;
    fn binary_int(
        &mut self,
        op: BinaryIntOp,
        a: &Tensor<i32>,
        b: &Tensor<i32>,
        out_shape: &[usize],
    ) -> Tensor<i32>;

    fn compare_float(
        &mut self,
        op: CompareOp,
        a: &Tensor<f32>,
        b: &Tensor<f32>,
        out_shape: &[usize],
    ) -> Tensor<i32>;
    fn compare_int(
        &mut self,
        op: CompareOp,
        a: &Tensor<i32>,
        b: &Tensor<i32>,
        out_shape: &[usize],
    ) -> Tensor<i32>;

    /// Select from `x` where `cond` is nonzero, else from `y`. All three
    /// operands broadcast to `out_shape`.
    fn where_float(
        &mut self,
        cond: &Tensor<i32>,
        x: &Tensor<f32>,
        y: &Tensor<f32>,
        out_shape: &[usize],
    ) -> Tensor<f32>;
    fn where_int(
        &mut self,
        cond: &Tensor<i32>,
        x: &Tensor<i32>,
        y: &Tensor<i32>,
        out_shape: &[usize],
    ) -> Tensor<i32>;

    fn is_inf(&mut self, x: &Tensor<f32>, detect_negative: bool, detect_positive: bool)
        -> Tensor<i32>;
    fn is_nan(&mut self, x: &Tensor<f32>) -> Tensor<i32>;

    /// Convert between element types. Float to int truncates toward zero.
    fn cast(&mut self, x: &Value, to: DataType) -> Value;

    fn softmax(&mut self, x: &Tensor<f32>, axis: usize) -> Tensor<f32>;
    fn log_softmax(&mut self, x: &Tensor<f32>, axis: usize) -> Tensor<f32>;

    fn cum_sum_float(
        &mut self,
        x: &Tensor<f32>,
        axis: usize,
        exclusive: bool,
        reverse: bool,
    ) -> Tensor<f32>;
    fn cum_sum_int(
        &mut self,
        x: &Tensor<i32>,
        axis: usize,
        exclusive: bool,
        reverse: bool,
    ) -> Tensor<i32>;

    /// Reduce over `axes`, which are sorted and deduplicated. An empty
    /// `axes` list reduces over all axes.
    fn reduce_float(
        &mut self,
        op: ReduceOp,
        x: &Tensor<f32>,
        axes: &[usize],
        keep_dims: bool,
    ) -> Tensor<f32>;
    fn reduce_int(
        &mut self,
        op: ReduceOp,
        x: &Tensor<i32>,
        axes: &[usize],
        keep_dims: bool,
    ) -> Tensor<i32>;

    /// Index of the extreme element along `axis`. Ties resolve to the
    /// first occurrence unless `select_last` is set.
    fn arg_reduce_float(
        &mut self,
        op: ArgReduceOp,
        x: &Tensor<f32>,
        axis: usize,
        keep_dims: bool,
        select_last: bool,
    ) -> Tensor<i32>;
    fn arg_reduce_int(
        &mut self,
        op: ArgReduceOp,
        x: &Tensor<i32>,
        axis: usize,
        keep_dims: bool,
        select_last: bool,
    ) -> Tensor<i32>;

    /// Copy a tensor into a new shape with the same element count.
    fn reshape_float(&mut self, x: &Tensor<f32>, shape: &[usize]) -> Tensor<f32>;
    fn reshape_int(&mut self, x: &Tensor<i32>, shape: &[usize]) -> Tensor<i32>;

    /// Permute dimensions. `perm` is a permutation of `0..x.ndim()`.
    fn transpose_float(&mut self, x: &Tensor<f32>, perm: &[usize]) -> Tensor<f32>;
    fn transpose_int(&mut self, x: &Tensor<i32>, perm: &[usize]) -> Tensor<i32>;

    /// Extract a slice. `ranges` has one entry per dimension.
    fn slice_float(&mut self, x: &Tensor<f32>, ranges: &[SliceRange]) -> Tensor<f32>;
    fn slice_int(&mut self, x: &Tensor<i32>, ranges: &[SliceRange]) -> Tensor<i32>;

    /// Pad with `pads` (start, end) pairs, one per dimension.
    fn pad_float(
        &mut self,
        x: &Tensor<f32>,
        pads: &[(usize, usize)],
        mode: PadMode,
        value: f32,
    ) -> Tensor<f32>;
    fn pad_int(
        &mut self,
        x: &Tensor<i32>,
        pads: &[(usize, usize)],
        mode: PadMode,
        value: i32,
    ) -> Tensor<i32>;

    /// Repeat the tensor `repeats[i]` times along each dimension.
    fn tile_float(&mut self, x: &Tensor<f32>, repeats: &[usize]) -> Tensor<f32>;
    fn tile_int(&mut self, x: &Tensor<i32>, repeats: &[usize]) -> Tensor<i32>;

    /// Concatenate along `axis`. Inputs agree on every other dimension.
    fn concat_float(&mut self, inputs: &[&Tensor<f32>], axis: usize) -> Tensor<f32>;
    fn concat_int(&mut self, inputs: &[&Tensor<i32>], axis: usize) -> Tensor<i32>;

    /// Split along `axis` into pieces of the given sizes, which sum to the
    /// size of that dimension.
    fn split_float(&mut self, x: &Tensor<f32>, axis: usize, sizes: &[usize]) -> Vec<Tensor<f32>>;
    fn split_int(&mut self, x: &Tensor<i32>, axis: usize, sizes: &[usize]) -> Vec<Tensor<i32>>;

    /// Broadcast-copy into `out_shape`.
    fn expand_float(&mut self, x: &Tensor<f32>, out_shape: &[usize]) -> Tensor<f32>;
    fn expand_int(&mut self, x: &Tensor<i32>, out_shape: &[usize]) -> Tensor<i32>;

    /// Zero the elements above (`upper` false) or below (`upper` true) the
    /// k-th diagonal of each innermost matrix.
    fn trilu_float(&mut self, x: &Tensor<f32>, k: i32, upper: bool) -> Tensor<f32>;
    fn trilu_int(&mut self, x: &Tensor<i32>, k: i32, upper: bool) -> Tensor<i32>;

    /// Rearrange a `[N, C, H, W]` tensor's channels into spatial blocks.
    fn depth_to_space(
        &mut self,
        x: &Tensor<f32>,
        block_size: usize,
        mode: DepthToSpaceMode,
    ) -> Tensor<f32>;
    fn space_to_depth(&mut self, x: &Tensor<f32>, block_size: usize) -> Tensor<f32>;

    /// Arithmetic sequence `start, start + delta, ...` of values less than
    /// (or greater than, for negative `delta`) `limit`.
    fn range_float(&mut self, start: f32, limit: f32, delta: f32) -> Tensor<f32>;
    fn range_int(&mut self, start: i32, limit: i32, delta: i32) -> Tensor<i32>;

    /// Expand indices into one-hot vectors along a new `axis`. Indices are
    /// already normalized to `[0, depth)`; out-of-range indices produce
    /// all-`off` rows.
    fn one_hot_float(
        &mut self,
        indices: &Tensor<i32>,
        depth: usize,
        axis: usize,
        off: f32,
        on: f32,
    ) -> Tensor<f32>;
    fn one_hot_int(
        &mut self,
        indices: &Tensor<i32>,
        depth: usize,
        axis: usize,
        off: i32,
        on: i32,
    ) -> Tensor<i32>;

    /// Coordinates of nonzero elements as a `[ndim, count]` tensor, in
    /// row-major element order.
    fn non_zero_float(&mut self, x: &Tensor<f32>) -> Tensor<i32>;
    fn non_zero_int(&mut self, x: &Tensor<i32>) -> Tensor<i32>;

    /// Look up slices of `x` along `axis` by index. Negative indices count
    /// from the end.
    fn gather_float(&mut self, x: &Tensor<f32>, indices: &Tensor<i32>, axis: usize)
        -> Tensor<f32>;
    fn gather_int(&mut self, x: &Tensor<i32>, indices: &Tensor<i32>, axis: usize) -> Tensor<i32>;

    /// Elementwise gather: the output has the shape of `indices` and reads
    /// `x` at the index given along `axis`.
    fn gather_elements_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        axis: usize,
    ) -> Tensor<f32>;
    fn gather_elements_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        axis: usize,
    ) -> Tensor<i32>;

    /// Gather slices addressed by the trailing dimension of `indices`,
    /// with the leading `batch_dims` dimensions shared between operands.
    fn gather_nd_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        batch_dims: usize,
    ) -> Tensor<f32>;
    fn gather_nd_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        batch_dims: usize,
    ) -> Tensor<i32>;

    /// Copy `x` and combine `updates` into it at the positions named by
    /// `indices` along `axis`.
    fn scatter_elements_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        updates: &Tensor<f32>,
        axis: usize,
        reduction: ScatterReduction,
    ) -> Tensor<f32>;
    fn scatter_elements_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        updates: &Tensor<i32>,
        axis: usize,
        reduction: ScatterReduction,
    ) -> Tensor<i32>;

    fn scatter_nd_float(
        &mut self,
        x: &Tensor<f32>,
        indices: &Tensor<i32>,
        updates: &Tensor<f32>,
        reduction: ScatterReduction,
    ) -> Tensor<f32>;
    fn scatter_nd_int(
        &mut self,
        x: &Tensor<i32>,
        indices: &Tensor<i32>,
        updates: &Tensor<i32>,
        reduction: ScatterReduction,
    ) -> Tensor<i32>;

    /// The `k` largest (or smallest) elements along `axis` and their
    /// indices. Values are sorted if `sorted` is set; ties resolve to the
    /// lower index.
    fn top_k_float(
        &mut self,
        x: &Tensor<f32>,
        k: usize,
        axis: usize,
        largest: bool,
        sorted: bool,
    ) -> (Tensor<f32>, Tensor<i32>);
    fn top_k_int(
        &mut self,
        x: &Tensor<i32>,
        k: usize,
        axis: usize,
        largest: bool,
        sorted: bool,
    ) -> (Tensor<i32>, Tensor<i32>);

    /// Batched matrix product with numpy broadcasting of the batch
    /// dimensions. Both operands have rank >= 2 and `out_shape` is the
    /// broadcast result shape.
    fn matmul(&mut self, a: &Tensor<f32>, b: &Tensor<f32>, out_shape: &[usize]) -> Tensor<f32>;

    /// Strict rank-2 matrix product with optional transposes.
    fn matmul_2d(
        &mut self,
        a: &Tensor<f32>,
        b: &Tensor<f32>,
        transpose_a: bool,
        transpose_b: bool,
    ) -> Tensor<f32>;

    /// Fully connected layer: `x @ w + bias` with `w` of shape
    /// `[in, out]` and an optional `[out]` bias.
    fn dense(
        &mut self,
        x: &Tensor<f32>,
        w: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
    ) -> Tensor<f32>;

    /// N-dimensional convolution over `[N, C, spatial...]` input with
    /// `[out_c, in_c / groups, kernel...]` weights. `pads` holds a
    /// (start, end) pair per spatial dimension.
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
    ) -> Tensor<f32>;

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
    ) -> Tensor<f32>;

    fn average_pool(
        &mut self,
        x: &Tensor<f32>,
        kernel: &[usize],
        strides: &[usize],
        pads: &[(usize, usize)],
        count_include_pad: bool,
        out_shape: &[usize],
    ) -> Tensor<f32>;

    fn max_pool(
        &mut self,
        x: &Tensor<f32>,
        kernel: &[usize],
        strides: &[usize],
        pads: &[(usize, usize)],
        out_shape: &[usize],
    ) -> Tensor<f32>;

    /// Reduce every spatial dimension to size 1.
    fn global_average_pool(&mut self, x: &Tensor<f32>) -> Tensor<f32>;
    fn global_max_pool(&mut self, x: &Tensor<f32>) -> Tensor<f32>;

    /// Normalize with running statistics, per channel (dimension 1).
    fn batch_norm(
        &mut self,
        x: &Tensor<f32>,
        scale: &Tensor<f32>,
        bias: &Tensor<f32>,
        mean: &Tensor<f32>,
        var: &Tensor<f32>,
        epsilon: f32,
    ) -> Tensor<f32>;

    /// Normalize over the spatial dimensions of each (batch, channel)
    /// plane using statistics computed from the input itself.
    fn instance_norm(
        &mut self,
        x: &Tensor<f32>,
        scale: &Tensor<f32>,
        bias: &Tensor<f32>,
        epsilon: f32,
    ) -> Tensor<f32>;

    /// Normalize over all dimensions from `axis` onwards.
    fn layer_norm(
        &mut self,
        x: &Tensor<f32>,
        scale: &Tensor<f32>,
        bias: Option<&Tensor<f32>>,
        axis: usize,
        epsilon: f32,
    ) -> Tensor<f32>;

    /// Local response normalization across channels.
    fn lrn(&mut self, x: &Tensor<f32>, alpha: f32, beta: f32, bias: f32, size: usize)
        -> Tensor<f32>;

    /// Fill a tensor with uniform samples from `[low, high)`.
    fn random_uniform(&mut self, shape: &[usize], low: f32, high: f32, seed: u64) -> Tensor<f32>;

    /// Fill a tensor with normal samples.
    fn random_normal(&mut self, shape: &[usize], mean: f32, scale: f32, seed: u64) -> Tensor<f32>;

    /// Draw a 0/1 sample per element with the given probabilities of one.
    fn bernoulli(&mut self, probs: &Tensor<f32>, seed: u64, dtype: DataType) -> Value;

    /// Pool regions of interest from a `[N, C, H, W]` feature map into
    /// fixed-size `[num_rois, C, out_h, out_w]` windows using bilinear
    /// sampling with half-pixel coordinates.
    #[allow(clippy::too_many_arguments)]
    fn roi_align(
        &mut self,
        x: &Tensor<f32>,
        rois: &Tensor<f32>,
        batch_indices: &Tensor<i32>,
        mode: RoiAlignMode,
        output_size: (usize, usize),
        sampling_ratio: usize,
        spatial_scale: f32,
    ) -> Tensor<f32>;
}
