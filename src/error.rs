use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlError>;

#[derive(Debug, Error)]
pub enum FlError {
    #[error("config key `{key}` is missing or not {expected}")]
    ConfigKey { key: String, expected: &'static str },

    #[error("round {round}: no fit results to aggregate")]
    NoResults { round: u64 },

    #[error("round {round}: {failures} client failure(s) and failures are not accepted")]
    FailuresNotAccepted { round: u64, failures: usize },

    #[error("parameter shape mismatch at array {index}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { index: usize, expected: Vec<usize>, actual: Vec<usize> },

    #[error("parameter count mismatch: expected {expected} arrays, got {actual}")]
    ArrayCountMismatch { expected: usize, actual: usize },

    #[error("total sample count is zero")]
    ZeroSamples,

    #[error("nothing to aggregate")]
    NothingToAggregate,

    #[error("checkpoint has no tensor `{0}`")]
    MissingTensor(String),

    #[error("metric `{0}` missing or mistyped")]
    MissingMetric(String),

    #[error("malformed `{key}` payload: {source}")]
    MetricPayload {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("not enough clients: {available} available, {required} required")]
    NotEnoughClients { available: usize, required: usize },

    #[error("strategy provided no initial parameters")]
    NoInitialParameters,

    #[error("invalid run-config override `{0}` (expected key=value)")]
    InvalidOverride(String),

    #[error("round {round}: `{key}` is not finite and cannot be recorded")]
    NonFiniteResult { round: u64, key: String },

    #[error("checkpoint for round {round} failed: {source}")]
    Checkpoint {
        round: u64,
        #[source]
        source: candle_core::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl FlError {
    /// Client-side errors that stop the run instead of counting as a failed client.
    pub fn halts_round(&self) -> bool {
        matches!(self, FlError::ConfigKey { .. })
    }
}
