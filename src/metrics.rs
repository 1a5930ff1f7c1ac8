//! Metric aggregation policies applied by the strategy each round.
//!
//! Client evaluate metrics are combined by sample-weighted mean. Client fit
//! metrics carry a structured [`CustomMetrics`] payload, JSON-encoded inside a
//! string value, which is decoded and averaged per client.

use serde::{Deserialize, Serialize};

use crate::error::{FlError, Result};
use crate::types::{Metrics, Scalar};

pub const ACCURACY: &str = "accuracy";
pub const CUSTOM_METRICS: &str = "custom_metrics";
pub const TRAIN_LOSS: &str = "train_loss";
pub const MAP: &str = "mAP";

/// Detection-style metrics a client attaches to its fit result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMetrics {
    #[serde(rename = "mAP")]
    pub map: f64,
    #[serde(default)]
    pub giou_loss: f64,
    #[serde(default)]
    pub conf_loss: f64,
    #[serde(default)]
    pub cls_loss: f64,
}

impl CustomMetrics {
    pub fn encode(&self) -> Result<Scalar> {
        Ok(Scalar::Str(serde_json::to_string(self)?))
    }

    pub fn decode(metrics: &Metrics) -> Result<Self> {
        let raw = metrics
            .get(CUSTOM_METRICS)
            .and_then(Scalar::as_str)
            .ok_or_else(|| FlError::MissingMetric(CUSTOM_METRICS.to_string()))?;
        serde_json::from_str(raw).map_err(|source| FlError::MetricPayload { key: CUSTOM_METRICS.to_string(), source })
    }
}

/// Sample-weighted mean of the clients' local validation accuracy.
pub fn aggregate_evaluate_metrics(evaluations: &[(u64, Metrics)]) -> Result<Metrics> {
    let total: u64 = evaluations.iter().map(|(n, _)| n).sum();
    if total == 0 {
        return Err(FlError::ZeroSamples);
    }
    let mut weighted = 0f64;
    for (n, m) in evaluations {
        let acc = m
            .get(ACCURACY)
            .and_then(Scalar::as_f64)
            .ok_or_else(|| FlError::MissingMetric(ACCURACY.to_string()))?;
        weighted += *n as f64 * acc;
    }
    let mut out = Metrics::new();
    out.insert(ACCURACY.to_string(), Scalar::Float(weighted / total as f64));
    Ok(out)
}

/// Unweighted mean of the decoded `mAP`, reported as a percentage.
///
/// A single malformed payload fails the whole aggregation.
pub fn aggregate_fit_metrics(fit_results: &[(u64, Metrics)]) -> Result<Metrics> {
    if fit_results.is_empty() {
        return Err(FlError::NothingToAggregate);
    }
    let mut sum = 0f64;
    for (_, m) in fit_results {
        sum += CustomMetrics::decode(m)?.map * 100.0;
    }
    let mut out = Metrics::new();
    out.insert(MAP.to_string(), Scalar::Float(sum / fit_results.len() as f64));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accuracy(acc: f64) -> Metrics {
        Metrics::from([(ACCURACY.to_string(), Scalar::Float(acc))])
    }

    fn custom(raw: &str) -> Metrics {
        Metrics::from([(CUSTOM_METRICS.to_string(), Scalar::Str(raw.to_string()))])
    }

    #[test]
    fn evaluate_accuracy_is_sample_weighted() {
        let out = aggregate_evaluate_metrics(&[(10, accuracy(0.8)), (30, accuracy(0.6))]).unwrap();
        let acc = out[ACCURACY].as_f64().unwrap();
        assert!((acc - 0.65).abs() < 1e-12);
    }

    #[test]
    fn evaluate_with_no_samples_fails() {
        assert!(matches!(aggregate_evaluate_metrics(&[(0, accuracy(0.9))]), Err(FlError::ZeroSamples)));
        assert!(aggregate_evaluate_metrics(&[]).is_err());
    }

    #[test]
    fn fit_map_is_unweighted_percentage() {
        let a = CustomMetrics { map: 0.40, giou_loss: 0.19, conf_loss: 0.21, cls_loss: 0.02 };
        let b = CustomMetrics { map: 0.50, ..a.clone() };
        let ma = Metrics::from([(CUSTOM_METRICS.to_string(), a.encode().unwrap())]);
        let mb = Metrics::from([(CUSTOM_METRICS.to_string(), b.encode().unwrap())]);
        // sample counts do not matter here
        let out = aggregate_fit_metrics(&[(1, ma), (1000, mb)]).unwrap();
        assert!((out[MAP].as_f64().unwrap() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn only_map_is_required() {
        let out = aggregate_fit_metrics(&[(5, custom(r#"{"mAP": 0.3}"#))]).unwrap();
        assert!((out[MAP].as_f64().unwrap() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn one_malformed_payload_fails_the_round() {
        let good = custom(r#"{"mAP": 0.42}"#);
        let bad = custom("{not json");
        assert!(matches!(
            aggregate_fit_metrics(&[(1, good.clone()), (1, bad)]),
            Err(FlError::MetricPayload { .. })
        ));
        assert!(matches!(aggregate_fit_metrics(&[(1, good), (1, Metrics::new())]), Err(FlError::MissingMetric(_))));
    }
}
