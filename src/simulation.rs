use std::sync::Arc;

use candle_core::Device;
use tracing::info;

use crate::app::{build_strategy, GlobalEvaluator};
use crate::client::{ClientManager, ClientProxy, ClientStateStore, LearnerClient};
use crate::config::RunConfig;
use crate::error::Result;
use crate::model::{load_mnist, GlobalTestSet, Learner, LinearClassifier, MnistLearner, IMAGE_DIM, LABELS};
use crate::server::{History, Server, ServerConfig};
use crate::types::Parameters;

/// Everything a run needs apart from the model and data.
pub struct Simulation<L> {
    pub config: RunConfig,
    pub learners: Vec<L>,
    pub initial: Parameters,
    pub param_names: Vec<String>,
    pub evaluator: Arc<dyn GlobalEvaluator>,
}

impl<L: Learner + 'static> Simulation<L> {
    /// Registers one client per learner and runs all rounds.
    pub async fn run(self) -> Result<(History, ClientStateStore)> {
        let cfg = self.config;
        let state = ClientStateStore::new();
        let mut clients = ClientManager::new(cfg.seed);
        for (partition_id, learner) in self.learners.into_iter().enumerate() {
            let client = LearnerClient::new(partition_id, learner, cfg.local_epochs, state.clone());
            clients.register(ClientProxy::new(partition_id, client));
        }
        info!(clients = clients.num_available(), rounds = cfg.num_server_rounds, "starting simulation");

        let strategy = build_strategy(&cfg, self.initial, self.param_names, self.evaluator);
        let mut server = Server::new(
            clients,
            strategy,
            ServerConfig { num_rounds: cfg.num_server_rounds, max_concurrency: cfg.max_concurrency },
        );
        let history = server.fit().await?;

        for (partition_id, record) in state.snapshot() {
            info!(partition_id, train_loss_hist = ?record.train_loss_hist, "client history");
        }
        Ok((history, state))
    }
}

/// First CUDA device when the build and host have one, CPU otherwise.
pub fn select_device() -> Device {
    Device::cuda_if_available(0).unwrap_or_else(|_| Device::Cpu)
}

/// MNIST run with the linear classifier, one partition per simulated client.
pub async fn run(cfg: RunConfig) -> Result<History> {
    let device = select_device();
    let data = load_mnist(&device)?;
    let learners = (0..cfg.num_supernodes)
        .map(|pid| MnistLearner::for_partition(&data, pid, cfg.num_supernodes, cfg.batch_size, &device))
        .collect::<Result<Vec<_>>>()?;
    let initial = LinearClassifier::init(IMAGE_DIM, LABELS, &device)?.to_parameters()?;
    let simulation = Simulation {
        learners,
        initial,
        param_names: LinearClassifier::PARAM_NAMES.iter().map(|s| s.to_string()).collect(),
        evaluator: Arc::new(GlobalTestSet::new(data.test.clone(), &device)),
        config: cfg,
    };
    let (history, _) = simulation.run().await?;
    Ok(history)
}
