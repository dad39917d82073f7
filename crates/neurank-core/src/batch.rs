//! Collation of feature maps into device tensors.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};

use crate::error::{RerankError, RerankResult};
use crate::extractor::{FeatureMap, FeatureVec};

/// A minibatch: identifiers plus one `[batch, len]` tensor per feature.
///
/// Id features become `u32` tensors, dense features `f32` tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    pub qids: Vec<String>,
    pub posdocids: Vec<String>,
    pub negdocids: Option<Vec<String>>,
    pub labels: Vec<Option<f32>>,
    features: BTreeMap<String, Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.qids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.qids.is_empty()
    }

    /// Tensor of a feature.
    ///
    /// # Errors
    /// - `FeatureShape` if the batch does not carry the feature
    pub fn feature(&self, name: &str) -> RerankResult<&Tensor> {
        self.features.get(name).ok_or_else(|| RerankError::FeatureShape {
            feature: name.to_string(),
            message: format!(
                "batch has no such feature (available: {:?})",
                self.features.keys().collect::<Vec<_>>()
            ),
        })
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }
}

/// Stack samples into a batch on `device`.
///
/// # Errors
/// - `EmptyDataset` for an empty slice
/// - `FeatureShape` when samples disagree in feature names, kinds or lengths
pub fn collate(samples: &[FeatureMap], device: &Device) -> RerankResult<Batch> {
    let first = samples.first().ok_or_else(|| RerankError::EmptyDataset {
        message: "cannot collate an empty batch".to_string(),
    })?;

    let mut features = BTreeMap::new();
    for (name, proto) in &first.features {
        let len = proto.len();
        let shape_err = |message: String| RerankError::FeatureShape {
            feature: name.clone(),
            message,
        };

        let tensor = match proto {
            FeatureVec::Ids(_) => {
                let mut flat: Vec<u32> = Vec::with_capacity(samples.len() * len);
                for sample in samples {
                    match sample.get(name) {
                        Some(FeatureVec::Ids(v)) if v.len() == len => flat.extend_from_slice(v),
                        Some(other) => {
                            return Err(shape_err(format!(
                                "sample {} has {} values of another kind or length, expected {} ids",
                                sample.qid,
                                other.len(),
                                len
                            )))
                        }
                        None => return Err(shape_err(format!("missing in sample {}", sample.qid))),
                    }
                }
                Tensor::from_vec(flat, (samples.len(), len), device)
            }
            FeatureVec::Dense(_) => {
                let mut flat: Vec<f32> = Vec::with_capacity(samples.len() * len);
                for sample in samples {
                    match sample.get(name) {
                        Some(FeatureVec::Dense(v)) if v.len() == len => flat.extend_from_slice(v),
                        Some(other) => {
                            return Err(shape_err(format!(
                                "sample {} has {} values of another kind or length, expected {} floats",
                                sample.qid,
                                other.len(),
                                len
                            )))
                        }
                        None => return Err(shape_err(format!("missing in sample {}", sample.qid))),
                    }
                }
                Tensor::from_vec(flat, (samples.len(), len), device)
            }
        }
        .map_err(|e| RerankError::TensorError {
            message: format!("Failed to collate '{}': {}", name, e),
        })?;
        features.insert(name.clone(), tensor);
    }

    if let Some(extra) = samples
        .iter()
        .find(|s| s.features.len() != first.features.len())
    {
        return Err(RerankError::FeatureShape {
            feature: "*".to_string(),
            message: format!(
                "sample {} has {} features, expected {}",
                extra.qid,
                extra.features.len(),
                first.features.len()
            ),
        });
    }

    let negdocids = if samples.iter().all(|s| s.negdocid.is_some()) {
        Some(samples.iter().filter_map(|s| s.negdocid.clone()).collect())
    } else {
        None
    };

    Ok(Batch {
        qids: samples.iter().map(|s| s.qid.clone()).collect(),
        posdocids: samples.iter().map(|s| s.posdocid.clone()).collect(),
        negdocids,
        labels: samples.iter().map(|s| s.label).collect(),
        features,
    })
}
