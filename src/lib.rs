//! Simulated federated learning with FedAvg: in-process clients, sample-weighted
//! aggregation, per-round checkpoints and a results file.

pub mod app;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod experiments;
pub mod metrics;
pub mod model;
pub mod results;
pub mod server;
pub mod simulation;
pub mod strategy;
pub mod types;

pub use config::RunConfig;
pub use error::{FlError, Result};
pub use server::{History, Server, ServerConfig};
pub use strategy::{FedAvg, Strategy};
pub use types::{Metrics, NdArray, Parameters, Scalar};
