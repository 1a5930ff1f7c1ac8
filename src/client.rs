use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FlError, Result};
use crate::metrics::{CustomMetrics, ACCURACY, CUSTOM_METRICS, TRAIN_LOSS};
use crate::model::Learner;
use crate::types::{config_f64, Config, EvaluateIns, EvaluateRes, FitIns, FitRes, Metrics, Parameters, Scalar};

pub type PartitionId = usize;

/// The two calls a server makes on a participant each round.
pub trait Client: Send {
    fn fit(&mut self, parameters: &Parameters, config: &Config) -> Result<FitRes>;
    fn evaluate(&mut self, parameters: &Parameters, config: &Config) -> Result<EvaluateRes>;
}

/// Run-scoped memory of each client, keyed by partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientRecord {
    pub train_loss_hist: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientStateStore {
    inner: Arc<RwLock<HashMap<PartitionId, ClientRecord>>>,
}

impl ClientStateStore {
    pub fn new() -> Self { Self::default() }

    pub fn append_train_loss(&self, partition_id: PartitionId, loss: f64) {
        self.inner.write().entry(partition_id).or_default().train_loss_hist.push(loss);
    }

    pub fn record(&self, partition_id: PartitionId) -> Option<ClientRecord> {
        self.inner.read().get(&partition_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<(PartitionId, ClientRecord)> {
        let mut all: Vec<_> = self.inner.read().iter().map(|(k, v)| (*k, v.clone())).collect();
        all.sort_by_key(|(k, _)| *k);
        all
    }
}

// The classifier has no detection head; these values exercise the structured
// metric path end to end.
const REPORTED_DETECTION: CustomMetrics = CustomMetrics { map: 0.42, giou_loss: 0.19, conf_loss: 0.21, cls_loss: 0.02 };

/// Client backed by a local learner holding one data partition.
pub struct LearnerClient<L> {
    partition_id: PartitionId,
    learner: L,
    local_epochs: usize,
    state: ClientStateStore,
}

impl<L: Learner> LearnerClient<L> {
    pub fn new(partition_id: PartitionId, learner: L, local_epochs: usize, state: ClientStateStore) -> Self {
        Self { partition_id, learner, local_epochs, state }
    }
}

impl<L: Learner> Client for LearnerClient<L> {
    fn fit(&mut self, parameters: &Parameters, config: &Config) -> Result<FitRes> {
        let lr = config_f64(config, "lr")?;
        self.learner.set_weights(parameters)?;
        let train_loss = self.learner.train(self.local_epochs, lr)?;
        self.state.append_train_loss(self.partition_id, train_loss);
        debug!(partition_id = self.partition_id, lr, train_loss, "local fit done");

        let mut metrics = Metrics::new();
        metrics.insert(TRAIN_LOSS.to_string(), Scalar::Float(train_loss));
        metrics.insert(CUSTOM_METRICS.to_string(), REPORTED_DETECTION.encode()?);
        Ok(FitRes {
            parameters: self.learner.get_weights()?,
            num_examples: self.learner.num_train_examples() as u64,
            metrics,
        })
    }

    fn evaluate(&mut self, parameters: &Parameters, _config: &Config) -> Result<EvaluateRes> {
        self.learner.set_weights(parameters)?;
        let (loss, accuracy) = self.learner.test()?;
        Ok(EvaluateRes {
            loss,
            num_examples: self.learner.num_test_examples() as u64,
            metrics: Metrics::from([(ACCURACY.to_string(), Scalar::Float(accuracy))]),
        })
    }
}

/// Handle the server schedules work on.
#[derive(Clone)]
pub struct ClientProxy {
    pub cid: Uuid,
    pub partition_id: PartitionId,
    client: Arc<Mutex<Box<dyn Client>>>,
}

impl ClientProxy {
    pub fn new(partition_id: PartitionId, client: impl Client + 'static) -> Self {
        Self { cid: Uuid::new_v4(), partition_id, client: Arc::new(Mutex::new(Box::new(client))) }
    }

    pub fn fit(&self, ins: &FitIns) -> Result<FitRes> {
        self.client.lock().fit(&ins.parameters, &ins.config)
    }

    pub fn evaluate(&self, ins: &EvaluateIns) -> Result<EvaluateRes> {
        self.client.lock().evaluate(&ins.parameters, &ins.config)
    }
}

/// Registered clients plus the seeded sampler used to pick them each round.
pub struct ClientManager {
    clients: Vec<ClientProxy>,
    rng: StdRng,
}

impl ClientManager {
    pub fn new(seed: u64) -> Self {
        Self { clients: Vec::new(), rng: StdRng::seed_from_u64(seed) }
    }

    pub fn register(&mut self, proxy: ClientProxy) {
        debug!(cid = %proxy.cid, partition_id = proxy.partition_id, "client registered");
        self.clients.push(proxy);
    }

    pub fn num_available(&self) -> usize { self.clients.len() }

    /// Picks `num_clients` distinct clients at random.
    pub fn sample(&mut self, num_clients: usize, min_available: usize) -> Result<Vec<ClientProxy>> {
        let available = self.clients.len();
        let required = num_clients.max(min_available);
        if available < required {
            return Err(FlError::NotEnoughClients { available, required });
        }
        Ok(self.clients.choose_multiple(&mut self.rng, num_clients).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NdArray;

    struct ConstLearner {
        weight: f32,
        after_train: f32,
        trained_with: Vec<f64>,
    }

    impl Learner for ConstLearner {
        fn get_weights(&self) -> Result<Parameters> {
            Ok(Parameters::new(vec![NdArray::new(vec![1], vec![self.weight])]))
        }
        fn set_weights(&mut self, parameters: &Parameters) -> Result<()> {
            self.weight = parameters.arrays[0].values[0];
            Ok(())
        }
        fn train(&mut self, _epochs: usize, lr: f64) -> Result<f64> {
            self.trained_with.push(lr);
            self.weight = self.after_train;
            Ok(lr)
        }
        fn test(&self) -> Result<(f64, f64)> { Ok((0.5, self.weight as f64)) }
        fn num_train_examples(&self) -> usize { 40 }
        fn num_test_examples(&self) -> usize { 10 }
    }

    fn client(state: &ClientStateStore) -> LearnerClient<ConstLearner> {
        LearnerClient::new(3, ConstLearner { weight: 0.0, after_train: 2.0, trained_with: vec![] }, 1, state.clone())
    }

    fn params(v: f32) -> Parameters { Parameters::new(vec![NdArray::new(vec![1], vec![v])]) }

    fn lr(v: f64) -> Config { Config::from([("lr".to_string(), Scalar::Float(v))]) }

    #[test]
    fn fit_reports_weights_count_and_metrics() {
        let state = ClientStateStore::new();
        let mut c = client(&state);
        let res = c.fit(&params(1.0), &lr(0.01)).unwrap();
        assert_eq!(res.parameters, params(2.0));
        assert_eq!(res.num_examples, 40);
        assert_eq!(res.metrics[TRAIN_LOSS].as_f64(), Some(0.01));
        assert_eq!(CustomMetrics::decode(&res.metrics).unwrap().map, 0.42);
    }

    #[test]
    fn train_loss_history_survives_rounds() {
        let state = ClientStateStore::new();
        let mut c = client(&state);
        c.fit(&params(1.0), &lr(0.01)).unwrap();
        c.fit(&params(1.0), &lr(0.005)).unwrap();
        assert_eq!(state.record(3).unwrap().train_loss_hist, vec![0.01, 0.005]);
        assert!(state.record(0).is_none());
    }

    #[test]
    fn fit_without_learning_rate_fails_before_training() {
        let state = ClientStateStore::new();
        let mut c = client(&state);
        assert!(matches!(c.fit(&params(1.0), &Config::new()), Err(FlError::ConfigKey { .. })));
        let wrong = Config::from([("lr".to_string(), Scalar::Str("0.1".into()))]);
        assert!(c.fit(&params(1.0), &wrong).is_err());
        assert!(c.learner.trained_with.is_empty());
        assert!(state.record(3).is_none());
    }

    #[test]
    fn evaluate_leaves_history_alone() {
        let state = ClientStateStore::new();
        let mut c = client(&state);
        let res = c.evaluate(&params(0.75), &Config::new()).unwrap();
        assert_eq!(res.num_examples, 10);
        assert_eq!(res.metrics[ACCURACY].as_f64(), Some(0.75));
        assert!(state.snapshot().is_empty());
    }

    #[test]
    fn sampling_respects_minimums() {
        let state = ClientStateStore::new();
        let mut manager = ClientManager::new(7);
        for _ in 0..5 {
            manager.register(ClientProxy::new(0, client(&state)));
        }
        let picked = manager.sample(3, 2).unwrap();
        assert_eq!(picked.len(), 3);
        let mut ids: Vec<_> = picked.iter().map(|p| p.cid).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(matches!(manager.sample(6, 2), Err(FlError::NotEnoughClients { available: 5, required: 6 })));
        assert!(manager.sample(1, 8).is_err());
    }
}
