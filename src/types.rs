use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlError, Result};

/// Dense row-major array of model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NdArray {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), values.len());
        Self { shape, values }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self { shape, values: vec![0.0; len] }
    }

    pub fn len(&self) -> usize { self.values.len() }

    pub fn is_empty(&self) -> bool { self.values.is_empty() }
}

/// Ordered sequence of arrays holding every trainable weight of the model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub arrays: Vec<NdArray>,
}

impl Parameters {
    pub fn new(arrays: Vec<NdArray>) -> Self { Self { arrays } }

    pub fn shapes(&self) -> Vec<&[usize]> {
        self.arrays.iter().map(|a| a.shape.as_slice()).collect()
    }

    /// Fails unless `other` has the same number of arrays with identical shapes.
    pub fn check_compatible(&self, other: &Parameters) -> Result<()> {
        if self.arrays.len() != other.arrays.len() {
            return Err(FlError::ArrayCountMismatch { expected: self.arrays.len(), actual: other.arrays.len() });
        }
        for (index, (a, b)) in self.arrays.iter().zip(&other.arrays).enumerate() {
            if a.shape != b.shape {
                return Err(FlError::ShapeMismatch { index, expected: a.shape.clone(), actual: b.shape.clone() });
            }
        }
        Ok(())
    }
}

/// Typed value carried in configs and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(v) => Some(*v),
            Scalar::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for Scalar { fn from(v: f64) -> Self { Scalar::Float(v) } }
impl From<i64> for Scalar { fn from(v: i64) -> Self { Scalar::Int(v) } }
impl From<u64> for Scalar { fn from(v: u64) -> Self { Scalar::Int(v as i64) } }
impl From<bool> for Scalar { fn from(v: bool) -> Self { Scalar::Bool(v) } }
impl From<String> for Scalar { fn from(v: String) -> Self { Scalar::Str(v) } }
impl From<&str> for Scalar { fn from(v: &str) -> Self { Scalar::Str(v.to_string()) } }

pub type Metrics = BTreeMap<String, Scalar>;
pub type Config = BTreeMap<String, Scalar>;

/// Reads a numeric config value, failing when absent or not a number.
pub fn config_f64(config: &Config, key: &str) -> Result<f64> {
    config
        .get(key)
        .and_then(Scalar::as_f64)
        .ok_or_else(|| FlError::ConfigKey { key: key.to_string(), expected: "a number" })
}

/// What a client returns after local training.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitRes {
    pub parameters: Parameters,
    pub num_examples: u64,
    pub metrics: Metrics,
}

/// What a client returns after local validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRes {
    pub loss: f64,
    pub num_examples: u64,
    pub metrics: Metrics,
}

#[derive(Debug, Clone)]
pub struct FitIns {
    pub parameters: Parameters,
    pub config: Config,
}

#[derive(Debug, Clone)]
pub struct EvaluateIns {
    pub parameters: Parameters,
    pub config: Config,
}

/// A client that did not deliver a result this round.
#[derive(Debug, Clone)]
pub struct ClientFailure {
    pub cid: Uuid,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_json_keeps_variants() {
        let mut m = Metrics::new();
        m.insert("lr".into(), 0.01.into());
        m.insert("round".into(), 3u64.into());
        m.insert("payload".into(), "{\"mAP\": 0.4}".into());
        let text = serde_json::to_string(&m).unwrap();
        let back: Metrics = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn config_f64_rejects_missing_and_strings() {
        let mut c = Config::new();
        assert!(matches!(config_f64(&c, "lr"), Err(FlError::ConfigKey { .. })));
        c.insert("lr".into(), "fast".into());
        assert!(config_f64(&c, "lr").is_err());
        c.insert("lr".into(), 0.005.into());
        assert_eq!(config_f64(&c, "lr").unwrap(), 0.005);
    }

    #[test]
    fn compatibility_reports_first_bad_array() {
        let a = Parameters::new(vec![NdArray::zeros(vec![2, 2]), NdArray::zeros(vec![2])]);
        let b = Parameters::new(vec![NdArray::zeros(vec![2, 2]), NdArray::zeros(vec![3])]);
        match a.check_compatible(&b) {
            Err(FlError::ShapeMismatch { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {other:?}"),
        }
        let c = Parameters::new(vec![NdArray::zeros(vec![2, 2])]);
        assert!(matches!(a.check_compatible(&c), Err(FlError::ArrayCountMismatch { .. })));
    }
}
