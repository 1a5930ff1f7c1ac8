//! Server-side policy callbacks and strategy wiring for a run.

use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::config::RunConfig;
use crate::error::Result;
use crate::metrics::{aggregate_evaluate_metrics, aggregate_fit_metrics};
use crate::results::ResultsStore;
use crate::strategy::{CheckpointingFedAvg, FedAvg, FedAvgConfig};
use crate::types::{Config, Metrics, Parameters, Scalar};

pub const CENTRALIZED_ACCURACY: &str = "cen_accuracy";

/// Step schedule: `initial` through `decay_after_round`, `decayed` afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    pub initial: f64,
    pub decayed: f64,
    pub decay_after_round: u64,
}

impl LearningRateSchedule {
    pub fn from_run_config(cfg: &RunConfig) -> Self {
        Self { initial: cfg.learning_rate, decayed: cfg.decayed_learning_rate, decay_after_round: cfg.decay_after_round }
    }

    pub fn rate(&self, round: u64) -> f64 {
        if round > self.decay_after_round { self.decayed } else { self.initial }
    }

    /// Config sent with every fit instruction.
    pub fn fit_config(&self, round: u64) -> Config {
        Config::from([("lr".to_string(), Scalar::Float(self.rate(round)))])
    }
}

pub fn evaluate_config(round: u64) -> Config {
    Config::from([("server_round".to_string(), Scalar::from(round))])
}

/// Scores global parameters on the server's held-out set, returning (loss, accuracy).
pub trait GlobalEvaluator: Send + Sync {
    fn evaluate(&self, parameters: &Parameters) -> Result<(f64, f64)>;
}

pub fn build_fedavg(cfg: &RunConfig, initial: Parameters, evaluator: Arc<dyn GlobalEvaluator>) -> FedAvg {
    let schedule = LearningRateSchedule::from_run_config(cfg);
    FedAvg::new(FedAvgConfig {
        fraction_fit: cfg.fraction_fit,
        fraction_evaluate: cfg.fraction_evaluate,
        min_fit_clients: cfg.min_fit_clients,
        min_evaluate_clients: cfg.min_evaluate_clients,
        min_available_clients: cfg.min_available_clients,
        accept_failures: cfg.accept_failures,
    })
    .with_initial_parameters(initial)
    .with_fit_config(move |round| schedule.fit_config(round))
    .with_evaluate_config(evaluate_config)
    .with_evaluate_fn(move |_round, parameters, _config| {
        let (loss, accuracy) = evaluator.evaluate(parameters)?;
        Ok(Some((loss, Metrics::from([(CENTRALIZED_ACCURACY.to_string(), Scalar::Float(accuracy))]))))
    })
    .with_fit_metrics_aggregation(aggregate_fit_metrics)
    .with_evaluate_metrics_aggregation(aggregate_evaluate_metrics)
}

/// FedAvg with the run's policies, checkpointing into `output_dir`.
pub fn build_strategy(
    cfg: &RunConfig,
    initial: Parameters,
    param_names: Vec<String>,
    evaluator: Arc<dyn GlobalEvaluator>,
) -> CheckpointingFedAvg {
    CheckpointingFedAvg::new(
        build_fedavg(cfg, initial, evaluator),
        CheckpointStore::new(cfg.checkpoint_dir(), param_names),
        ResultsStore::new(cfg.results_path()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use crate::types::NdArray;

    struct MeanEvaluator;

    impl GlobalEvaluator for MeanEvaluator {
        fn evaluate(&self, parameters: &Parameters) -> Result<(f64, f64)> {
            let v = &parameters.arrays[0].values;
            Ok((v.iter().sum::<f32>() as f64, 0.5))
        }
    }

    #[test]
    fn learning_rate_drops_after_second_round() {
        let s = LearningRateSchedule::from_run_config(&RunConfig::default());
        assert_eq!(s.rate(1), 0.01);
        assert_eq!(s.rate(2), 0.01);
        assert_eq!(s.rate(3), 0.005);
        assert_eq!(s.fit_config(5)["lr"], Scalar::Float(0.005));
    }

    #[test]
    fn evaluate_config_carries_round() {
        assert_eq!(evaluate_config(4)["server_round"], Scalar::Int(4));
    }

    #[test]
    fn strategy_evaluates_with_global_set_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RunConfig { output_dir: dir.path().to_path_buf(), ..Default::default() };
        let initial = Parameters::new(vec![NdArray::new(vec![2], vec![1.0, 2.0])]);
        let mut strategy = build_strategy(&cfg, initial.clone(), vec!["w".into()], Arc::new(MeanEvaluator));
        assert_eq!(strategy.initialize_parameters(), Some(initial.clone()));
        let (loss, metrics) = strategy.evaluate(1, &initial).unwrap().unwrap();
        assert_eq!(loss, 3.0);
        assert_eq!(metrics[CENTRALIZED_ACCURACY], Scalar::Float(0.5));
        let on_disk = ResultsStore::read(cfg.results_path()).unwrap();
        assert_eq!(on_disk[&1].metrics[CENTRALIZED_ACCURACY], Scalar::Float(0.5));
    }
}
