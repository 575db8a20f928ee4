//! The extension point for operations outside the built-in catalog.

use std::fmt;

use crate::backend::Backend;
use crate::error::LayerError;
use crate::layer::{Inputs, PartialInputs};
use crate::partial::PartialTensor;
use crate::value::{DataType, Value};

/// An externally implemented layer.
///
/// Implementations plug into [`LayerKind::Custom`](crate::LayerKind::Custom)
/// and take part in both graph passes. A custom layer whose shapes are
/// opaque to the core only has to declare its output dtypes; the default
/// [`infer_partial`](CustomLayer::infer_partial) then reports tensors of
/// those dtypes with fully unknown shapes, which downstream layers treat as
/// ordinary partial inputs.
pub trait CustomLayer: fmt::Debug + std::panic::UnwindSafe + std::panic::RefUnwindSafe {
    /// The operation name reported in diagnostics.
    fn name(&self) -> &str;

    /// Declare one dtype per output, given the dtypes of the inputs that
    /// are present.
    fn infer_output_dtypes(
        &self,
        input_dtypes: &[Option<DataType>],
    ) -> Result<Vec<DataType>, LayerError>;

    /// Partial inference over symbolic inputs.
    ///
    /// Override this when the layer can say something about its output
    /// shapes; the default knows only the dtypes.
    fn infer_partial(&self, inputs: &PartialInputs) -> Result<Vec<PartialTensor>, LayerError> {
        let dtypes: Vec<Option<DataType>> = (0..inputs.len())
            .map(|i| inputs.get(i).map(|input| input.dtype()))
            .collect();
        let output_dtypes = self.infer_output_dtypes(&dtypes)?;
        Ok(output_dtypes
            .into_iter()
            .map(PartialTensor::unknown)
            .collect())
    }

    /// Execute over concrete inputs.
    fn execute(
        &self,
        inputs: &Inputs,
        backend: &mut dyn Backend,
    ) -> Result<Vec<Value>, LayerError>;
}
