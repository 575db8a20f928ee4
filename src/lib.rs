//! parten is an inference core for neural-network layer graphs.
//!
//! It models layers as values ([`LayerKind`]) rather than as a trait object
//! per operator, and separates what a layer computes from where it computes
//! it: layers validate their inputs and decide output shapes, while a
//! [`Backend`] implementation supplies the numeric kernels.
//!
//! # Symbolic shapes and partial tensors
//!
//! Before any data exists, layers can run in *partial inference* mode over
//! [`PartialTensor`] values. A partial tensor carries an element type and a
//! [`SymShape`], whose dimensions ([`SymDim`]) may be fixed numbers, named
//! parameters such as `batch`, or unknown. Small integer tensors also track
//! their element values, so shape-computing subgraphs (`Shape` feeding
//! `Reshape`, say) resolve symbolically.
//!
//! The basic workflow is:
//!
//! 1. Build [`Layer`] values describing the graph's operations.
//! 2. Run a [`PartialInferenceContext`] over them to propagate dtypes and
//!    symbolic shapes from the graph inputs.
//! 3. Bind concrete [`Value`] tensors to the inputs and run an
//!    [`ExecutionContext`] against a backend such as [`CpuBackend`].
//!
//! # Backends
//!
//! [`Backend`] is an object-safe trait of numeric primitives, keyed by
//! operation enums ([`UnaryFloatOp`], [`ReduceOp`], ...) so an
//! implementation dispatches on a whole operation at once. Layers check
//! dtypes, ranks and parameter ranges before calling in, which keeps the
//! kernel methods infallible. [`CpuBackend`] is the naive reference
//! implementation the tests run against.
//!
//! # Data types
//!
//! Tensors hold `f32` or `i32` elements ([`DataType`]). Boolean inputs and
//! 64-bit index tensors are expected to be converted to `i32` ahead of
//! time.

pub mod backend;
mod context;
mod cpu;
mod dim;
mod error;
mod layer;
pub mod layers;
mod partial;
mod shape;
mod value;

pub use backend::{
    ArgReduceOp, Backend, BinaryFloatOp, BinaryIntOp, CompareOp, DepthToSpaceMode, PadMode,
    ReduceOp, RoiAlignMode, ScatterReduction, SliceRange, UnaryFloatOp, UnaryIntOp,
};
pub use context::{ExecutionContext, PartialInferenceContext, RunOptions};
pub use cpu::CpuBackend;
pub use dim::{AutoPad, SymDim};
pub use error::{LayerError, RunError};
pub use layer::{InferredList, Inputs, Layer, LayerFlags, LayerKind, OutputList, PartialInputs};
pub use partial::{PartialElem, PartialTensor};
pub use shape::SymShape;
pub use value::{DataType, Scalar, Value};
