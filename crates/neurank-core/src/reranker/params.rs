//! Named trainable variables with seeded initialization.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{RerankError, RerankResult};
use crate::tensorio::{self, NamedArray};

/// Ordered collection of a model's trainable variables.
///
/// Initial values come from a ChaCha8 stream seeded at construction, so two
/// stores built with the same seed and the same registration order hold
/// identical values.
pub struct ParamStore {
    vars: Vec<(String, Var)>,
    device: Device,
    rng: ChaCha8Rng,
}

impl ParamStore {
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            vars: Vec::new(),
            device: device.clone(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Register an existing tensor as a trainable variable.
    ///
    /// Returns a tensor sharing the variable's storage and gradient identity.
    pub fn register(&mut self, name: &str, value: &Tensor) -> RerankResult<Tensor> {
        if self.get(name).is_some() {
            return Err(RerankError::config(format!("parameter '{}' registered twice", name)));
        }
        let var = Var::from_tensor(&value.to_dtype(DType::F32).map_err(map_candle)?).map_err(map_candle)?;
        let tensor = var.as_tensor().clone();
        self.vars.push((name.to_string(), var));
        Ok(tensor)
    }

    /// Variable with values drawn uniformly from `[-bound, bound)`.
    pub fn uniform(&mut self, name: &str, shape: &[usize], bound: f64) -> RerankResult<Tensor> {
        let count: usize = shape.iter().product();
        let bound = bound as f32;
        let values: Vec<f32> = (0..count).map(|_| self.rng.gen_range(-bound..bound)).collect();
        let tensor = Tensor::from_vec(values, shape, &self.device).map_err(map_candle)?;
        self.register(name, &tensor)
    }

    /// Variable filled with one value.
    pub fn constant(&mut self, name: &str, shape: &[usize], value: f32) -> RerankResult<Tensor> {
        let tensor = Tensor::full(value, shape, &self.device).map_err(map_candle)?;
        self.register(name, &tensor)
    }

    /// Variable with explicit values.
    pub fn values(&mut self, name: &str, shape: &[usize], values: &[f32]) -> RerankResult<Tensor> {
        let tensor = Tensor::from_slice(values, shape, &self.device).map_err(map_candle)?;
        self.register(name, &tensor)
    }

    /// Dense layer `[out, in]` with uniform ±1/sqrt(in) initialization.
    pub fn linear(&mut self, name: &str, in_dim: usize, out_dim: usize, bias: bool) -> RerankResult<Linear> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let weight = self.uniform(&format!("{}.weight", name), &[out_dim, in_dim], bound)?;
        let bias = if bias {
            Some(self.uniform(&format!("{}.bias", name), &[out_dim], bound)?)
        } else {
            None
        };
        Ok(Linear::new(weight, bias))
    }

    /// Square convolution `[out, in, k, k]` without padding.
    pub fn conv2d(&mut self, name: &str, in_channels: usize, out_channels: usize, kernel: usize) -> RerankResult<Conv2d> {
        let bound = 1.0 / ((in_channels * kernel * kernel) as f64).sqrt();
        let weight = self.uniform(
            &format!("{}.weight", name),
            &[out_channels, in_channels, kernel, kernel],
            bound,
        )?;
        let bias = self.uniform(&format!("{}.bias", name), &[out_channels], bound)?;
        Ok(Conv2d::new(weight, Some(bias), Conv2dConfig::default()))
    }

    pub fn get(&self, name: &str) -> Option<&Var> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Variables in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Var)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn num_elements(&self) -> usize {
        self.vars.iter().map(|(_, v)| v.as_tensor().elem_count()).sum()
    }

    /// Copy current values to host arrays.
    pub fn to_arrays(&self) -> RerankResult<BTreeMap<String, NamedArray>> {
        self.vars
            .iter()
            .map(|(name, var)| Ok((name.clone(), tensor_to_array(var.as_tensor())?)))
            .collect()
    }

    /// Overwrite values from host arrays. Names and shapes must match exactly.
    pub fn load_arrays(&self, arrays: &BTreeMap<String, NamedArray>) -> RerankResult<()> {
        if arrays.len() != self.vars.len() {
            return Err(RerankError::CheckpointError {
                message: format!(
                    "checkpoint holds {} tensors, model has {}",
                    arrays.len(),
                    self.vars.len()
                ),
            });
        }
        for (name, var) in &self.vars {
            let array = arrays.get(name).ok_or_else(|| RerankError::CheckpointError {
                message: format!("checkpoint has no tensor '{}'", name),
            })?;
            if array.shape.as_slice() != var.as_tensor().dims() {
                return Err(RerankError::CheckpointError {
                    message: format!(
                        "tensor '{}' has shape {:?}, model expects {:?}",
                        name,
                        array.shape,
                        var.as_tensor().dims()
                    ),
                });
            }
            let value = Tensor::from_slice(&array.data, array.shape.as_slice(), &self.device)
                .map_err(map_candle)?;
            var.set(&value).map_err(map_candle)?;
        }
        Ok(())
    }

    /// Serialize values as safetensors bytes.
    pub fn to_bytes(&self) -> RerankResult<Vec<u8>> {
        tensorio::encode(&self.to_arrays()?)
    }

    /// Restore values from safetensors bytes.
    pub fn load_bytes(&self, bytes: &[u8]) -> RerankResult<()> {
        self.load_arrays(&tensorio::decode(bytes)?)
    }
}

/// Flatten a tensor into a host array.
pub(crate) fn tensor_to_array(tensor: &Tensor) -> RerankResult<NamedArray> {
    let data = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(map_candle)?;
    Ok(NamedArray::new(tensor.dims().to_vec(), data))
}

fn map_candle(e: candle_core::Error) -> RerankError {
    RerankError::TensorError {
        message: format!("Parameter error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Module;

    #[test]
    fn test_same_seed_same_values() {
        let mut a = ParamStore::new(5, &Device::Cpu);
        let mut b = ParamStore::new(5, &Device::Cpu);
        let ta = a.uniform("w", &[3, 4], 0.5).unwrap();
        let tb = b.uniform("w", &[3, 4], 0.5).unwrap();
        let va: Vec<f32> = ta.flatten_all().unwrap().to_vec1().unwrap();
        let vb: Vec<f32> = tb.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(va, vb);
        assert!(va.iter().all(|v| v.abs() <= 0.5));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut store = ParamStore::new(0, &Device::Cpu);
        store.constant("x", &[1], 0.0).unwrap();
        assert!(store.constant("x", &[1], 1.0).is_err());
    }

    #[test]
    fn test_linear_shapes_and_count() {
        let mut store = ParamStore::new(0, &Device::Cpu);
        let layer = store.linear("fc", 4, 2, true).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.num_elements(), 10);
        let x = Tensor::ones((3, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[3, 2]);
    }

    #[test]
    fn test_bytes_round_trip_updates_shared_tensor() {
        let mut src = ParamStore::new(1, &Device::Cpu);
        src.uniform("w", &[2, 2], 1.0).unwrap();
        let bytes = src.to_bytes().unwrap();

        let mut dst = ParamStore::new(2, &Device::Cpu);
        let shared = dst.uniform("w", &[2, 2], 1.0).unwrap();
        dst.load_bytes(&bytes).unwrap();

        let expected = src.to_arrays().unwrap()["w"].data.clone();
        let got: Vec<f32> = shared.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_load_rejects_shape_mismatch() {
        let mut src = ParamStore::new(1, &Device::Cpu);
        src.uniform("w", &[2, 3], 1.0).unwrap();
        let mut dst = ParamStore::new(1, &Device::Cpu);
        dst.uniform("w", &[3, 2], 1.0).unwrap();
        assert!(matches!(
            dst.load_bytes(&src.to_bytes().unwrap()),
            Err(RerankError::CheckpointError { .. })
        ));
    }
}
