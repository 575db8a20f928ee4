//! Errors raised by shape inference and execution.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// An unrecoverable failure while inferring or executing a layer.
///
/// Every variant reflects a malformed graph rather than a transient
/// condition, so callers abort the current pass at the first error.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerError {
    /// Declared ranks for the same tensor conflict.
    RankMismatch { expected: usize, actual: usize },

    /// An axis falls outside `[0, rank)` after negative-index adjustment.
    AxisOutOfRange { axis: i32, rank: usize },

    /// Broadcasting or elementwise shape constraints cannot be satisfied.
    ShapeMismatch(&'static str),

    /// A layer-specific invariant was violated.
    ValueError(&'static str),

    /// A layer was used with a data type combination it does not implement.
    UnsupportedDataType(&'static str),
}

impl Display for LayerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LayerError::RankMismatch { expected, actual } => {
                write!(f, "rank mismatch: expected {} but have {}", expected, actual)
            }
            LayerError::AxisOutOfRange { axis, rank } => {
                write!(f, "axis {} is out of range for rank {}", axis, rank)
            }
            LayerError::ShapeMismatch(msg) => write!(f, "shape mismatch: {}", msg),
            LayerError::ValueError(msg) => write!(f, "invalid value: {}", msg),
            LayerError::UnsupportedDataType(msg) => {
                write!(f, "unsupported data type: {}", msg)
            }
        }
    }
}

impl Error for LayerError {}

/// Error reported when a layer fails during a driver pass.
///
/// Carries the name of the failing layer (its primary output) so the
/// offending node in a malformed graph can be located.
#[derive(Clone, Debug, PartialEq)]
pub struct RunError {
    /// Name of the layer that failed.
    pub layer: String,

    /// The underlying failure.
    pub error: LayerError,
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "layer \"{}\": {}", self.layer, self.error)
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::{LayerError, RunError};

    #[test]
    fn test_display() {
        let cases = [
            (
                LayerError::RankMismatch {
                    expected: 2,
                    actual: 3,
                },
                "rank mismatch: expected 2 but have 3",
            ),
            (
                LayerError::AxisOutOfRange { axis: -4, rank: 2 },
                "axis -4 is out of range for rank 2",
            ),
            (
                LayerError::ShapeMismatch("dimensions differ"),
                "shape mismatch: dimensions differ",
            ),
            (
                LayerError::ValueError("split sizes must be >= 0"),
                "invalid value: split sizes must be >= 0",
            ),
            (
                LayerError::UnsupportedDataType("expected float input"),
                "unsupported data type: expected float input",
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_run_error_display() {
        let error = RunError {
            layer: "conv1".to_string(),
            error: LayerError::ShapeMismatch("dimensions differ"),
        };
        assert_eq!(
            error.to_string(),
            "layer \"conv1\": shape mismatch: dimensions differ"
        );
    }
}
