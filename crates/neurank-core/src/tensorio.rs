//! Named f32 arrays to and from safetensors bytes.

use std::collections::BTreeMap;

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::error::{RerankError, RerankResult};

/// Row-major f32 data with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedArray {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }
}

/// Encode arrays as a safetensors buffer.
pub fn encode(arrays: &BTreeMap<String, NamedArray>) -> RerankResult<Vec<u8>> {
    let views = arrays
        .iter()
        .map(|(name, array)| {
            let view = TensorView::new(
                Dtype::F32,
                array.shape.clone(),
                bytemuck::cast_slice(array.data.as_slice()),
            )
            .map_err(|e| RerankError::SerializationError {
                message: format!("TensorView for '{}' failed: {}", name, e),
            })?;
            Ok((name.clone(), view))
        })
        .collect::<RerankResult<Vec<_>>>()?;

    safetensors::tensor::serialize(views, &None).map_err(|e| RerankError::SerializationError {
        message: format!("safetensors encoding failed: {}", e),
    })
}

/// Decode every f32 tensor of a safetensors buffer.
pub fn decode(bytes: &[u8]) -> RerankResult<BTreeMap<String, NamedArray>> {
    let tensors = SafeTensors::deserialize(bytes).map_err(|e| RerankError::SerializationError {
        message: format!("safetensors decoding failed: {}", e),
    })?;

    tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            if view.dtype() != Dtype::F32 {
                return Err(RerankError::SerializationError {
                    message: format!("tensor '{}' has dtype {:?}, expected F32", name, view.dtype()),
                });
            }
            let data: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
            Ok((name, NamedArray::new(view.shape().to_vec(), data)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let mut arrays = BTreeMap::new();
        arrays.insert(
            "embedding".to_string(),
            NamedArray::new(vec![2, 3], vec![0.0, 0.0, 0.0, 1.0, -2.5, 3.25]),
        );
        arrays.insert("step".to_string(), NamedArray::new(vec![1], vec![7.0]));

        let bytes = encode(&arrays).unwrap();
        assert_eq!(decode(&bytes).unwrap(), arrays);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(b"not a tensor file").is_err());
    }
}
