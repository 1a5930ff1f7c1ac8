use std::path::{Path, PathBuf};
use config::Source;

use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};

/// Settings of a single simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub num_server_rounds: u64,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub local_epochs: usize,
    /// Number of simulated clients, one data partition each.
    pub num_supernodes: usize,
    pub min_available_clients: usize,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub accept_failures: bool,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub decayed_learning_rate: f64,
    /// Last round trained with `learning_rate`.
    pub decay_after_round: u64,
    pub max_concurrency: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            num_server_rounds: 3,
            fraction_fit: 0.5,
            fraction_evaluate: 1.0,
            local_epochs: 1,
            num_supernodes: 10,
            min_available_clients: 2,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            accept_failures: true,
            batch_size: 32,
            learning_rate: 0.01,
            decayed_learning_rate: 0.005,
            decay_after_round: 2,
            max_concurrency: 4,
            seed: 42,
            output_dir: PathBuf::from("."),
        }
    }
}

fn normalize_key(key: &str) -> String { key.replace('-', "_") }

/// Splits `"num-server-rounds=5 fraction-fit=0.3"` into normalized `(key, value)` pairs.
pub fn parse_overrides(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split_whitespace()
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| FlError::InvalidOverride(pair.to_string()))?;
            if key.is_empty() {
                return Err(FlError::InvalidOverride(pair.to_string()));
            }
            Ok((normalize_key(key), value.trim_matches('"').to_string()))
        })
        .collect()
}

impl RunConfig {
    /// Defaults, then `file` (format picked from its extension), then `overrides`.
    ///
    /// Keys may be written kebab-case in both the file and the overrides.
    /// Unknown keys are rejected.
    pub fn load(file: Option<&Path>, overrides: &str) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&RunConfig::default())?);
        if let Some(path) = file {
            let from_file = config::Config::builder().add_source(config::File::from(path).required(true)).build()?;
            for (key, value) in from_file.collect()? {
                builder = builder.set_override(normalize_key(&key), value)?;
            }
        }
        for (key, value) in parse_overrides(overrides)? {
            builder = builder.set_override(key, value)?;
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn checkpoint_dir(&self) -> &Path { &self.output_dir }

    pub fn results_path(&self) -> PathBuf { self.output_dir.join("results.json") }
}
