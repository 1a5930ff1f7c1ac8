//! Per-round snapshots of the global model, stored as safetensors.

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{Device, Tensor};
use tracing::info;

use crate::error::{FlError, Result};
use crate::types::{NdArray, Parameters};

pub struct CheckpointStore {
    dir: PathBuf,
    names: Vec<String>,
}

impl CheckpointStore {
    /// `names` labels the parameter arrays in order; unnamed arrays fall back to `param_{i}`.
    pub fn new(dir: impl Into<PathBuf>, names: Vec<String>) -> Self {
        Self { dir: dir.into(), names }
    }

    pub fn path_for(&self, round: u64) -> PathBuf {
        self.dir.join(format!("global_model_{round}.safetensors"))
    }

    fn name(&self, idx: usize) -> String {
        self.names.get(idx).cloned().unwrap_or_else(|| format!("param_{idx}"))
    }

    /// Writes the checkpoint for `round`. The file appears atomically.
    pub fn save(&self, round: u64, parameters: &Parameters) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let mut tensors = HashMap::with_capacity(parameters.arrays.len());
        for (idx, array) in parameters.arrays.iter().enumerate() {
            let t = Tensor::from_vec(array.values.clone(), array.shape.clone(), &Device::Cpu)
                .map_err(|source| FlError::Checkpoint { round, source })?;
            tensors.insert(self.name(idx), t);
        }
        let path = self.path_for(round);
        let tmp = path.with_extension("safetensors.tmp");
        candle_core::safetensors::save(&tensors, &tmp).map_err(|source| FlError::Checkpoint { round, source })?;
        std::fs::rename(&tmp, &path)?;
        info!(round, path = %path.display(), "saved global model checkpoint");
        Ok(path)
    }

    pub fn load(&self, round: u64) -> Result<Parameters> {
        let mut tensors = candle_core::safetensors::load(self.path_for(round), &Device::Cpu)?;
        let mut arrays = Vec::with_capacity(tensors.len());
        for idx in 0..tensors.len() {
            let name = self.name(idx);
            let t = tensors.remove(&name).ok_or_else(|| FlError::MissingTensor(name.clone()))?;
            arrays.push(NdArray::new(t.dims().to_vec(), t.flatten_all()?.to_vec1::<f32>()?));
        }
        Ok(Parameters::new(arrays))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_returns_same_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), vec!["weight".into(), "bias".into()]);
        let params = Parameters::new(vec![
            NdArray::new(vec![2, 3], vec![0.5, -1.0, 2.0, 3.5, 0.0, 1.25]),
            NdArray::new(vec![2], vec![0.1, 0.2]),
        ]);
        let path = store.save(4, &params).unwrap();
        assert_eq!(path.file_name().unwrap(), "global_model_4.safetensors");
        assert!(!path.with_extension("safetensors.tmp").exists());
        assert_eq!(store.load(4).unwrap(), params);
    }

    #[test]
    fn unnamed_arrays_get_positional_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), vec![]);
        let params = Parameters::new(vec![NdArray::new(vec![1], vec![9.0]), NdArray::new(vec![1], vec![8.0])]);
        store.save(1, &params).unwrap();
        assert_eq!(store.load(1).unwrap(), params);
        assert!(store.load(2).is_err());
    }
}
