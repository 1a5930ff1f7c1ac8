//! Cumulative centralized-evaluation results, one record per round.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlError, Result};
use crate::types::{Metrics, Scalar};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub loss: f64,
    #[serde(flatten)]
    pub metrics: Metrics,
}

pub type RoundRecords = BTreeMap<u64, RoundRecord>;

/// Keeps every round's record in memory and mirrors the full map to a JSON file.
pub struct ResultsStore {
    path: PathBuf,
    records: RoundRecords,
}

impl ResultsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), records: RoundRecords::new() }
    }

    /// Stores the record for `round` and rewrites the file.
    ///
    /// The new content goes to a sibling temp file first and is renamed over
    /// the old one, so an interrupted write leaves the previous rounds intact.
    /// A non-finite loss or metric is refused since JSON cannot hold it.
    pub fn record(&mut self, round: u64, loss: f64, metrics: Metrics) -> Result<()> {
        if !loss.is_finite() {
            return Err(FlError::NonFiniteResult { round, key: "loss".to_string() });
        }
        if let Some((key, _)) = metrics.iter().find(|(_, v)| matches!(v, Scalar::Float(f) if !f.is_finite())) {
            return Err(FlError::NonFiniteResult { round, key: key.clone() });
        }
        self.records.insert(round, RoundRecord { loss, metrics });
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::new();
        let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
        self.records.serialize(&mut ser)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), rounds = self.records.len(), "results file rewritten");
        Ok(())
    }

    pub fn records(&self) -> &RoundRecords { &self.records }

    pub fn path(&self) -> &Path { &self.path }

    pub fn read(path: impl AsRef<Path>) -> Result<RoundRecords> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(acc: f64) -> Metrics {
        Metrics::from([("cen_accuracy".to_string(), Scalar::Float(acc))])
    }

    #[test]
    fn file_holds_exactly_the_recorded_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut store = ResultsStore::new(&path);
        for round in 1..=3u64 {
            store.record(round, 1.0 / round as f64, metrics(0.1 * round as f64)).unwrap();
            let on_disk = ResultsStore::read(&path).unwrap();
            assert_eq!(on_disk.keys().copied().collect::<Vec<_>>(), (1..=round).collect::<Vec<_>>());
            assert_eq!(&on_disk, store.records());
        }
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn rerunning_a_round_replaces_only_that_round() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut store = ResultsStore::new(&path);
        store.record(1, 2.0, metrics(0.5)).unwrap();
        store.record(2, 1.5, metrics(0.6)).unwrap();
        store.record(2, 1.4, metrics(0.7)).unwrap();
        let on_disk = ResultsStore::read(&path).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk[&1].loss, 2.0);
        assert_eq!(on_disk[&2].loss, 1.4);
    }

    #[test]
    fn records_are_flat_objects_keyed_by_round() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut store = ResultsStore::new(&path);
        store.record(1, 0.25, metrics(0.75)).unwrap();
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["1"]["loss"], 0.25);
        assert_eq!(raw["1"]["cen_accuracy"], 0.75);
    }

    #[test]
    fn diverged_round_is_refused_and_earlier_rounds_stay_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        let mut store = ResultsStore::new(&path);
        store.record(1, 0.5, metrics(0.9)).unwrap();

        let err = store.record(2, f64::NAN, metrics(0.9)).unwrap_err();
        assert!(matches!(err, FlError::NonFiniteResult { round: 2, ref key } if key == "loss"));
        let err = store.record(2, 0.4, metrics(f64::INFINITY)).unwrap_err();
        assert!(matches!(err, FlError::NonFiniteResult { round: 2, ref key } if key == "cen_accuracy"));

        let on_disk = ResultsStore::read(&path).unwrap();
        assert_eq!(on_disk.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(store.records(), &on_disk);
    }
}
