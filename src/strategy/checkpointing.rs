use uuid::Uuid;

use super::{FedAvg, Strategy};
use crate::checkpoint::CheckpointStore;
use crate::client::{ClientManager, ClientProxy};
use crate::error::Result;
use crate::results::ResultsStore;
use crate::types::{ClientFailure, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, Parameters};

/// FedAvg that snapshots the global model after every aggregation and keeps a
/// cumulative results file of the centralized evaluations.
pub struct CheckpointingFedAvg {
    inner: FedAvg,
    checkpoints: CheckpointStore,
    results: ResultsStore,
}

impl CheckpointingFedAvg {
    pub fn new(inner: FedAvg, checkpoints: CheckpointStore, results: ResultsStore) -> Self {
        Self { inner, checkpoints, results }
    }

    pub fn checkpoints(&self) -> &CheckpointStore { &self.checkpoints }

    pub fn results(&self) -> &ResultsStore { &self.results }
}

impl Strategy for CheckpointingFedAvg {
    fn initialize_parameters(&mut self) -> Option<Parameters> {
        self.inner.initialize_parameters()
    }

    fn configure_fit(
        &self,
        round: u64,
        parameters: &Parameters,
        clients: &mut ClientManager,
    ) -> Result<Vec<(ClientProxy, FitIns)>> {
        self.inner.configure_fit(round, parameters, clients)
    }

    fn aggregate_fit(
        &mut self,
        round: u64,
        results: &[(Uuid, FitRes)],
        failures: &[ClientFailure],
    ) -> Result<(Parameters, Metrics)> {
        let (parameters, metrics) = self.inner.aggregate_fit(round, results, failures)?;
        self.checkpoints.save(round, &parameters)?;
        Ok((parameters, metrics))
    }

    fn configure_evaluate(
        &self,
        round: u64,
        parameters: &Parameters,
        clients: &mut ClientManager,
    ) -> Result<Vec<(ClientProxy, EvaluateIns)>> {
        self.inner.configure_evaluate(round, parameters, clients)
    }

    fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: &[(Uuid, EvaluateRes)],
        failures: &[ClientFailure],
    ) -> Result<(Option<f64>, Metrics)> {
        self.inner.aggregate_evaluate(round, results, failures)
    }

    fn evaluate(&mut self, round: u64, parameters: &Parameters) -> Result<Option<(f64, Metrics)>> {
        let result = self.inner.evaluate(round, parameters)?;
        // Round 0 is the untrained initial model; only trained rounds are recorded.
        match &result {
            Some((loss, metrics)) if round >= 1 => self.results.record(round, *loss, metrics.clone())?,
            _ => {}
        }
        Ok(result)
    }
}
