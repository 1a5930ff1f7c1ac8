//! Sequential batch runner: one child process per experiment, each logging to its own file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExperimentSpec {
    pub name: String,
    pub num_server_rounds: u64,
    pub fraction_fit: f64,
    pub local_epochs: usize,
}

impl ExperimentSpec {
    /// Value passed to `--run-config`; outputs land in `output_dir`.
    pub fn run_config_overrides(&self, output_dir: &Path) -> String {
        format!(
            "num-server-rounds={} fraction-fit={} local-epochs={} output-dir={}",
            self.num_server_rounds,
            self.fraction_fit,
            self.local_epochs,
            output_dir.display()
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentsFile {
    pub experiments: Vec<ExperimentSpec>,
}

impl ExperimentsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub name: String,
    pub log_path: PathBuf,
    /// Where the run wrote its results file and checkpoints.
    pub output_dir: PathBuf,
    /// `None` when the child was killed by a signal.
    pub exit_code: Option<i32>,
}

pub struct ExperimentRunner {
    program: PathBuf,
    base_args: Vec<String>,
    log_dir: PathBuf,
}

impl ExperimentRunner {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), base_args, log_dir: log_dir.into() }
    }

    /// Runner that re-invokes this binary's `run` subcommand.
    pub fn current_exe(log_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?, vec!["run".to_string()], log_dir))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        let stem = format!("output_{}_{}", name, Local::now().format("%Y%m%d_%H%M%S"));
        let mut path = self.log_dir.join(format!("{stem}.log"));
        let mut n = 1;
        while path.exists() {
            path = self.log_dir.join(format!("{stem}_{n}.log"));
            n += 1;
        }
        path
    }

    /// Runs one experiment to completion. A non-zero exit is reported, not raised.
    pub async fn run_one(&self, experiment: &ExperimentSpec) -> Result<ExperimentOutcome> {
        let log_path = self.log_path(&experiment.name);
        let output_dir = self.log_dir.join(&experiment.name);
        let stdout = File::create(&log_path)?;
        let stderr = stdout.try_clone()?;
        info!(name = %experiment.name, log = %log_path.display(), "running experiment");

        let status = Command::new(&self.program)
            .args(&self.base_args)
            .arg("--run-config")
            .arg(experiment.run_config_overrides(&output_dir))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .await?;

        let exit_code = status.code();
        if status.success() {
            info!(name = %experiment.name, "experiment completed");
        } else {
            warn!(name = %experiment.name, ?exit_code, "experiment exited with failure");
        }
        Ok(ExperimentOutcome { name: experiment.name.clone(), log_path, output_dir, exit_code })
    }

    /// Runs every experiment in order; each waits for the previous one.
    pub async fn run_all(&self, experiments: &[ExperimentSpec]) -> Result<Vec<ExperimentOutcome>> {
        let mut outcomes = Vec::with_capacity(experiments.len());
        for experiment in experiments {
            outcomes.push(self.run_one(experiment).await?);
        }
        info!(count = outcomes.len(), "all experiments finished");
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = "\
experiments:
  - name: baseline
    num-server-rounds: 3
    fraction-fit: 0.5
    local-epochs: 1
  - name: more_rounds
    num-server-rounds: 10
    fraction-fit: 0.3
    local-epochs: 2
  - name: full
    num-server-rounds: 2
    fraction-fit: 1.0
    local-epochs: 5
";

    fn failing_shell(log_dir: &Path) -> ExperimentRunner {
        // `$2` is the value following `--run-config`.
        let script = "echo \"config: $2\"; echo oops >&2; exit 3";
        ExperimentRunner::new("sh", vec!["-c".into(), script.into(), "sh".into()], log_dir)
    }

    #[test]
    fn parses_experiment_list() {
        let file: ExperimentsFile = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(file.experiments.len(), 3);
        assert_eq!(file.experiments[1].name, "more_rounds");
        assert_eq!(
            file.experiments[1].run_config_overrides(Path::new("runs/more_rounds")),
            "num-server-rounds=10 fraction-fit=0.3 local-epochs=2 output-dir=runs/more_rounds"
        );
    }

    #[tokio::test]
    async fn every_experiment_runs_despite_failures() {
        let dir = tempfile::tempdir().unwrap();
        let file: ExperimentsFile = serde_yaml::from_str(YAML).unwrap();
        let outcomes = failing_shell(dir.path()).run_all(&file.experiments).await.unwrap();

        assert_eq!(outcomes.len(), 3);
        let mut paths: Vec<_> = outcomes.iter().map(|o| o.log_path.clone()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 3);
        let mut output_dirs: Vec<_> = outcomes.iter().map(|o| o.output_dir.clone()).collect();
        output_dirs.dedup();
        assert_eq!(output_dirs.len(), 3);
        for (outcome, spec) in outcomes.iter().zip(&file.experiments) {
            assert_eq!(outcome.exit_code, Some(3));
            assert_eq!(outcome.output_dir, dir.path().join(&spec.name));
            let log = std::fs::read_to_string(&outcome.log_path).unwrap();
            assert!(log.contains(&spec.run_config_overrides(&outcome.output_dir)));
            assert!(log.contains("oops"));
        }
    }

    #[test]
    fn log_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let runner = failing_shell(dir.path());
        let first = runner.log_path("same");
        std::fs::write(&first, "").unwrap();
        let second = runner.log_path("same");
        assert_ne!(first, second);
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("output_same_"));
    }
}
