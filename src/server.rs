use std::collections::BTreeMap;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client::{ClientManager, ClientProxy};
use crate::error::{FlError, Result};
use crate::strategy::Strategy;
use crate::types::{ClientFailure, Metrics, Parameters, Scalar};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_rounds: u64,
    /// Upper bound on clients training at the same time.
    pub max_concurrency: usize,
}

/// Per-round losses and metrics collected over a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct History {
    pub losses_distributed: Vec<(u64, f64)>,
    pub losses_centralized: Vec<(u64, f64)>,
    pub metrics_distributed_fit: BTreeMap<String, Vec<(u64, Scalar)>>,
    pub metrics_distributed: BTreeMap<String, Vec<(u64, Scalar)>>,
    pub metrics_centralized: BTreeMap<String, Vec<(u64, Scalar)>>,
}

impl History {
    fn push_metrics(target: &mut BTreeMap<String, Vec<(u64, Scalar)>>, round: u64, metrics: &Metrics) {
        for (k, v) in metrics {
            target.entry(k.clone()).or_default().push((round, v.clone()));
        }
    }

    pub fn add_loss_distributed(&mut self, round: u64, loss: f64) { self.losses_distributed.push((round, loss)); }

    pub fn add_loss_centralized(&mut self, round: u64, loss: f64) { self.losses_centralized.push((round, loss)); }

    pub fn add_metrics_distributed_fit(&mut self, round: u64, metrics: &Metrics) {
        Self::push_metrics(&mut self.metrics_distributed_fit, round, metrics);
    }

    pub fn add_metrics_distributed(&mut self, round: u64, metrics: &Metrics) {
        Self::push_metrics(&mut self.metrics_distributed, round, metrics);
    }

    pub fn add_metrics_centralized(&mut self, round: u64, metrics: &Metrics) {
        Self::push_metrics(&mut self.metrics_centralized, round, metrics);
    }

    pub fn log_summary(&self) {
        for (round, loss) in &self.losses_distributed {
            info!(round, loss, "history (loss, distributed)");
        }
        for (round, loss) in &self.losses_centralized {
            info!(round, loss, "history (loss, centralized)");
        }
        for (name, values) in self
            .metrics_distributed_fit
            .iter()
            .chain(&self.metrics_distributed)
            .chain(&self.metrics_centralized)
        {
            info!(metric = %name, ?values, "history (metrics)");
        }
    }
}

/// Drives the rounds: one strategy, one set of clients, one global model.
pub struct Server<S> {
    clients: ClientManager,
    strategy: S,
    parameters: Parameters,
    config: ServerConfig,
}

impl<S: Strategy> Server<S> {
    pub fn new(clients: ClientManager, strategy: S, config: ServerConfig) -> Self {
        Self { clients, strategy, parameters: Parameters::default(), config }
    }

    pub fn parameters(&self) -> &Parameters { &self.parameters }

    /// Runs rounds `1..=num_rounds` strictly in sequence. Any strategy error ends the run.
    pub async fn fit(&mut self) -> Result<History> {
        let mut history = History::default();
        let started = Instant::now();

        info!("[INIT] requesting initial parameters from strategy");
        self.parameters = self.strategy.initialize_parameters().ok_or(FlError::NoInitialParameters)?;
        if let Some((loss, metrics)) = self.strategy.evaluate(0, &self.parameters)? {
            info!(loss, ?metrics, "initial parameters evaluated");
            history.add_loss_centralized(0, loss);
            history.add_metrics_centralized(0, &metrics);
        }

        for round in 1..=self.config.num_rounds {
            self.run_round(round, &mut history).instrument(info_span!("round", round)).await?;
        }

        info!(
            rounds = self.config.num_rounds,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "[SUMMARY] run finished"
        );
        history.log_summary();
        Ok(history)
    }

    async fn run_round(&mut self, round: u64, history: &mut History) -> Result<()> {
        info!("[ROUND {round}]");

        let instructions = self.strategy.configure_fit(round, &self.parameters, &mut self.clients)?;
        info!(
            "configure_fit: strategy sampled {} clients (out of {})",
            instructions.len(),
            self.clients.num_available()
        );
        let (results, failures) = dispatch(instructions, self.config.max_concurrency, ClientProxy::fit).await?;
        info!("aggregate_fit: received {} results and {} failures", results.len(), failures.len());
        let (parameters, fit_metrics) = self.strategy.aggregate_fit(round, &results, &failures)?;
        self.parameters = parameters;
        history.add_metrics_distributed_fit(round, &fit_metrics);

        if let Some((loss, metrics)) = self.strategy.evaluate(round, &self.parameters)? {
            history.add_loss_centralized(round, loss);
            history.add_metrics_centralized(round, &metrics);
        }

        let instructions = self.strategy.configure_evaluate(round, &self.parameters, &mut self.clients)?;
        if instructions.is_empty() {
            info!("configure_evaluate: no clients selected, skipping evaluation");
            return Ok(());
        }
        info!(
            "configure_evaluate: strategy sampled {} clients (out of {})",
            instructions.len(),
            self.clients.num_available()
        );
        let (results, failures) = dispatch(instructions, self.config.max_concurrency, ClientProxy::evaluate).await?;
        info!("aggregate_evaluate: received {} results and {} failures", results.len(), failures.len());
        let (loss, metrics) = self.strategy.aggregate_evaluate(round, &results, &failures)?;
        if let Some(loss) = loss {
            history.add_loss_distributed(round, loss);
        }
        history.add_metrics_distributed(round, &metrics);
        Ok(())
    }
}

/// Runs `call` for every selected client on the blocking pool, at most
/// `max_concurrency` at once, and splits the outcomes into results and failures.
async fn dispatch<I, R, F>(
    instructions: Vec<(ClientProxy, I)>,
    max_concurrency: usize,
    call: F,
) -> Result<(Vec<(Uuid, R)>, Vec<ClientFailure>)>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(&ClientProxy, &I) -> Result<R> + Copy + Send + 'static,
{
    let tasks = instructions.into_iter().map(|(proxy, ins)| async move {
        let cid = proxy.cid;
        (cid, tokio::task::spawn_blocking(move || call(&proxy, &ins)).await)
    });
    let mut outcomes = stream::iter(tasks).buffer_unordered(max_concurrency.max(1));

    let mut results = Vec::new();
    let mut failures = Vec::new();
    while let Some((cid, joined)) = outcomes.next().await {
        match joined {
            Ok(Ok(res)) => results.push((cid, res)),
            Ok(Err(e)) if e.halts_round() => return Err(e),
            Ok(Err(e)) => {
                warn!(%cid, error = %e, "client failed");
                failures.push(ClientFailure { cid, reason: e.to_string() });
            }
            Err(e) => {
                warn!(%cid, error = %e, "client task aborted");
                failures.push(ClientFailure { cid, reason: format!("client task aborted: {e}") });
            }
        }
    }
    Ok((results, failures))
}
