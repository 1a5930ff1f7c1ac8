//! Pluggable round policy: client selection, aggregation and server-side evaluation.

pub mod aggregate;
pub mod checkpointing;
pub mod fedavg;

pub use checkpointing::CheckpointingFedAvg;
pub use fedavg::{ConfigFn, EvaluateFn, FedAvg, FedAvgConfig, MetricsAggregationFn};

use uuid::Uuid;

use crate::client::{ClientManager, ClientProxy};
use crate::error::Result;
use crate::types::{ClientFailure, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, Parameters};

pub trait Strategy: Send {
    /// Starting global parameters, if the strategy provides them.
    fn initialize_parameters(&mut self) -> Option<Parameters>;

    fn configure_fit(
        &self,
        round: u64,
        parameters: &Parameters,
        clients: &mut ClientManager,
    ) -> Result<Vec<(ClientProxy, FitIns)>>;

    /// Combines successful fit results; failed clients never contribute.
    fn aggregate_fit(
        &mut self,
        round: u64,
        results: &[(Uuid, FitRes)],
        failures: &[ClientFailure],
    ) -> Result<(Parameters, Metrics)>;

    fn configure_evaluate(
        &self,
        round: u64,
        parameters: &Parameters,
        clients: &mut ClientManager,
    ) -> Result<Vec<(ClientProxy, EvaluateIns)>>;

    fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: &[(Uuid, EvaluateRes)],
        failures: &[ClientFailure],
    ) -> Result<(Option<f64>, Metrics)>;

    /// Centralized evaluation of the global parameters.
    fn evaluate(&mut self, round: u64, parameters: &Parameters) -> Result<Option<(f64, Metrics)>>;
}
