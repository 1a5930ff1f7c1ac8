use tracing::{info, warn};
use uuid::Uuid;

use super::aggregate::{weighted_average, weighted_loss_avg};
use super::Strategy;
use crate::client::{ClientManager, ClientProxy};
use crate::error::{FlError, Result};
use crate::types::{ClientFailure, Config, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, Parameters};

pub type ConfigFn = Box<dyn Fn(u64) -> Config + Send + Sync>;
pub type EvaluateFn = Box<dyn Fn(u64, &Parameters, &Config) -> Result<Option<(f64, Metrics)>> + Send + Sync>;
pub type MetricsAggregationFn = Box<dyn Fn(&[(u64, Metrics)]) -> Result<Metrics> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FedAvgConfig {
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub min_available_clients: usize,
    pub accept_failures: bool,
}

impl Default for FedAvgConfig {
    fn default() -> Self {
        Self {
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            min_available_clients: 2,
            accept_failures: true,
        }
    }
}

/// Federated averaging: sample-count weighted mean of client weights.
pub struct FedAvg {
    config: FedAvgConfig,
    initial_parameters: Option<Parameters>,
    on_fit_config: Option<ConfigFn>,
    on_evaluate_config: Option<ConfigFn>,
    evaluate_fn: Option<EvaluateFn>,
    fit_metrics_aggregation: Option<MetricsAggregationFn>,
    evaluate_metrics_aggregation: Option<MetricsAggregationFn>,
    warned_fit_metrics: bool,
    warned_evaluate_metrics: bool,
}

impl FedAvg {
    pub fn new(config: FedAvgConfig) -> Self {
        Self {
            config,
            initial_parameters: None,
            on_fit_config: None,
            on_evaluate_config: None,
            evaluate_fn: None,
            fit_metrics_aggregation: None,
            evaluate_metrics_aggregation: None,
            warned_fit_metrics: false,
            warned_evaluate_metrics: false,
        }
    }

    pub fn with_initial_parameters(mut self, parameters: Parameters) -> Self {
        self.initial_parameters = Some(parameters);
        self
    }

    pub fn with_fit_config(mut self, f: impl Fn(u64) -> Config + Send + Sync + 'static) -> Self {
        self.on_fit_config = Some(Box::new(f));
        self
    }

    pub fn with_evaluate_config(mut self, f: impl Fn(u64) -> Config + Send + Sync + 'static) -> Self {
        self.on_evaluate_config = Some(Box::new(f));
        self
    }

    pub fn with_evaluate_fn(
        mut self,
        f: impl Fn(u64, &Parameters, &Config) -> Result<Option<(f64, Metrics)>> + Send + Sync + 'static,
    ) -> Self {
        self.evaluate_fn = Some(Box::new(f));
        self
    }

    pub fn with_fit_metrics_aggregation(
        mut self,
        f: impl Fn(&[(u64, Metrics)]) -> Result<Metrics> + Send + Sync + 'static,
    ) -> Self {
        self.fit_metrics_aggregation = Some(Box::new(f));
        self
    }

    pub fn with_evaluate_metrics_aggregation(
        mut self,
        f: impl Fn(&[(u64, Metrics)]) -> Result<Metrics> + Send + Sync + 'static,
    ) -> Self {
        self.evaluate_metrics_aggregation = Some(Box::new(f));
        self
    }

    pub fn config(&self) -> &FedAvgConfig { &self.config }

    /// (clients to sample, clients that must be available) for a fit round.
    pub fn num_fit_clients(&self, available: usize) -> (usize, usize) {
        let n = (available as f64 * self.config.fraction_fit) as usize;
        (n.max(self.config.min_fit_clients), self.config.min_available_clients)
    }

    pub fn num_evaluation_clients(&self, available: usize) -> (usize, usize) {
        let n = (available as f64 * self.config.fraction_evaluate) as usize;
        (n.max(self.config.min_evaluate_clients), self.config.min_available_clients)
    }

    fn check_failures(&self, round: u64, failures: &[ClientFailure]) -> Result<()> {
        if !self.config.accept_failures && !failures.is_empty() {
            return Err(FlError::FailuresNotAccepted { round, failures: failures.len() });
        }
        Ok(())
    }
}

impl Strategy for FedAvg {
    fn initialize_parameters(&mut self) -> Option<Parameters> {
        // Handed out once; the server owns the global parameters afterwards.
        self.initial_parameters.take()
    }

    fn configure_fit(
        &self,
        round: u64,
        parameters: &Parameters,
        clients: &mut ClientManager,
    ) -> Result<Vec<(ClientProxy, FitIns)>> {
        let config = self.on_fit_config.as_ref().map(|f| f(round)).unwrap_or_default();
        let (sample_size, min_available) = self.num_fit_clients(clients.num_available());
        let selected = clients.sample(sample_size, min_available)?;
        Ok(selected
            .into_iter()
            .map(|proxy| (proxy, FitIns { parameters: parameters.clone(), config: config.clone() }))
            .collect())
    }

    fn aggregate_fit(
        &mut self,
        round: u64,
        results: &[(Uuid, FitRes)],
        failures: &[ClientFailure],
    ) -> Result<(Parameters, Metrics)> {
        if results.is_empty() {
            return Err(FlError::NoResults { round });
        }
        self.check_failures(round, failures)?;

        let contributions: Vec<(&Parameters, u64)> =
            results.iter().map(|(_, res)| (&res.parameters, res.num_examples)).collect();
        let parameters = weighted_average(&contributions)?;

        let metrics = match &self.fit_metrics_aggregation {
            Some(f) => {
                let per_client: Vec<(u64, Metrics)> =
                    results.iter().map(|(_, res)| (res.num_examples, res.metrics.clone())).collect();
                f(&per_client)?
            }
            None => {
                if !self.warned_fit_metrics {
                    warn!("no fit_metrics_aggregation_fn provided");
                    self.warned_fit_metrics = true;
                }
                Metrics::new()
            }
        };
        Ok((parameters, metrics))
    }

    fn configure_evaluate(
        &self,
        round: u64,
        parameters: &Parameters,
        clients: &mut ClientManager,
    ) -> Result<Vec<(ClientProxy, EvaluateIns)>> {
        if self.config.fraction_evaluate == 0.0 {
            return Ok(Vec::new());
        }
        let config = self.on_evaluate_config.as_ref().map(|f| f(round)).unwrap_or_default();
        let (sample_size, min_available) = self.num_evaluation_clients(clients.num_available());
        let selected = clients.sample(sample_size, min_available)?;
        Ok(selected
            .into_iter()
            .map(|proxy| (proxy, EvaluateIns { parameters: parameters.clone(), config: config.clone() }))
            .collect())
    }

    fn aggregate_evaluate(
        &mut self,
        round: u64,
        results: &[(Uuid, EvaluateRes)],
        failures: &[ClientFailure],
    ) -> Result<(Option<f64>, Metrics)> {
        if results.is_empty() {
            warn!(round, "no evaluate results to aggregate");
            return Ok((None, Metrics::new()));
        }
        self.check_failures(round, failures)?;

        let losses: Vec<(u64, f64)> = results.iter().map(|(_, res)| (res.num_examples, res.loss)).collect();
        let loss = weighted_loss_avg(&losses)?;

        let metrics = match &self.evaluate_metrics_aggregation {
            Some(f) => {
                let per_client: Vec<(u64, Metrics)> =
                    results.iter().map(|(_, res)| (res.num_examples, res.metrics.clone())).collect();
                f(&per_client)?
            }
            None => {
                if !self.warned_evaluate_metrics {
                    warn!("no evaluate_metrics_aggregation_fn provided");
                    self.warned_evaluate_metrics = true;
                }
                Metrics::new()
            }
        };
        Ok((Some(loss), metrics))
    }

    fn evaluate(&mut self, round: u64, parameters: &Parameters) -> Result<Option<(f64, Metrics)>> {
        let Some(f) = &self.evaluate_fn else { return Ok(None) };
        let result = f(round, parameters, &Config::new())?;
        if let Some((loss, metrics)) = &result {
            info!(round, loss, ?metrics, "centralized evaluation");
        }
        Ok(result)
    }
}
