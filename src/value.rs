//! Concrete tensor values exchanged between layers at execution time.

use std::fmt;
use std::fmt::Display;

use parten_tensor::Tensor;

use crate::error::LayerError;

/// The element type of a tensor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum DataType {
    #[default]
    Float,
    Int,
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataType::Float => write!(f, "f32"),
            DataType::Int => write!(f, "i32"),
        }
    }
}

/// A single number of either supported element type.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Scalar {
    Float(f32),
    Int(i32),
}

impl Scalar {
    pub fn dtype(&self) -> DataType {
        match self {
            Scalar::Float(_) => DataType::Float,
            Scalar::Int(_) => DataType::Int,
        }
    }

    /// Return the value converted to f32.
    pub fn to_f32(self) -> f32 {
        match self {
            Scalar::Float(x) => x,
            Scalar::Int(x) => x as f32,
        }
    }

    /// Return the value converted to i32. Float values truncate.
    pub fn to_i32(self) -> i32 {
        match self {
            Scalar::Float(x) => x as i32,
            Scalar::Int(x) => x,
        }
    }
}

impl From<f32> for Scalar {
    fn from(x: f32) -> Scalar {
        Scalar::Float(x)
    }
}

impl From<i32> for Scalar {
    fn from(x: i32) -> Scalar {
        Scalar::Int(x)
    }
}

/// A tensor of either supported element type.
///
/// This is the type of layer inputs and outputs during execution.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Float(Tensor<f32>),
    Int(Tensor<i32>),
}

impl Value {
    pub fn dtype(&self) -> DataType {
        match self {
            Value::Float(_) => DataType::Float,
            Value::Int(_) => DataType::Int,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Value::Float(t) => t.shape(),
            Value::Int(t) => t.shape(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Return the number of elements.
    pub fn len(&self) -> usize {
        match self {
            Value::Float(t) => t.len(),
            Value::Int(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the float tensor, or fail if this value holds ints.
    pub fn as_float(&self) -> Result<&Tensor<f32>, LayerError> {
        match self {
            Value::Float(t) => Ok(t),
            Value::Int(_) => Err(LayerError::UnsupportedDataType(
                "expected a float tensor but found int",
            )),
        }
    }

    /// Borrow the int tensor, or fail if this value holds floats.
    pub fn as_int(&self) -> Result<&Tensor<i32>, LayerError> {
        match self {
            Value::Int(t) => Ok(t),
            Value::Float(_) => Err(LayerError::UnsupportedDataType(
                "expected an int tensor but found float",
            )),
        }
    }

    pub fn into_float(self) -> Result<Tensor<f32>, LayerError> {
        match self {
            Value::Float(t) => Ok(t),
            Value::Int(_) => Err(LayerError::UnsupportedDataType(
                "expected a float tensor but found int",
            )),
        }
    }

    pub fn into_int(self) -> Result<Tensor<i32>, LayerError> {
        match self {
            Value::Int(t) => Ok(t),
            Value::Float(_) => Err(LayerError::UnsupportedDataType(
                "expected an int tensor but found float",
            )),
        }
    }
}

impl From<Tensor<f32>> for Value {
    fn from(t: Tensor<f32>) -> Value {
        Value::Float(t)
    }
}

impl From<Tensor<i32>> for Value {
    fn from(t: Tensor<i32>) -> Value {
        Value::Int(t)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {:?}", self.dtype(), self.shape())
    }
}

#[cfg(test)]
mod tests {
    use parten_tensor::Tensor;

    use super::{DataType, Scalar, Value};

    #[test]
    fn test_value_accessors() {
        let float: Value = Tensor::from_data(&[2, 3], vec![0.; 6]).into();
        assert_eq!(float.dtype(), DataType::Float);
        assert_eq!(float.shape(), &[2, 3]);
        assert_eq!(float.ndim(), 2);
        assert_eq!(float.len(), 6);
        assert!(float.as_float().is_ok());
        assert!(float.as_int().is_err());

        let int: Value = Tensor::from_vec(vec![1, 2, 3]).into();
        assert_eq!(int.dtype(), DataType::Int);
        assert!(int.as_int().is_ok());
        assert!(int.clone().into_int().is_ok());
        assert!(int.into_float().is_err());
    }

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(Scalar::Float(2.7).to_i32(), 2);
        assert_eq!(Scalar::Int(3).to_f32(), 3.0);
        assert_eq!(Scalar::from(1.5f32).dtype(), DataType::Float);
        assert_eq!(Scalar::from(4i32).dtype(), DataType::Int);
    }

    #[test]
    fn test_display() {
        let value: Value = Tensor::from_data(&[2, 3], vec![0.; 6]).into();
        assert_eq!(value.to_string(), "f32 [2, 3]");
        assert_eq!(DataType::Int.to_string(), "i32");
    }
}
