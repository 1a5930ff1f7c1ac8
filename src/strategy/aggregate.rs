//! Sample-count weighted averaging used by FedAvg.

use crate::error::{FlError, Result};
use crate::types::{NdArray, Parameters};

/// Element-wise weighted mean of parameter sets, weighted by sample count.
///
/// The divisor is the sum of the reported counts, so clients holding larger
/// partitions pull the result proportionally harder. Every contribution must
/// have the same array layout as the first one.
pub fn weighted_average(results: &[(&Parameters, u64)]) -> Result<Parameters> {
    let Some((first, _)) = results.first() else {
        return Err(FlError::NothingToAggregate);
    };
    let total: u64 = results.iter().map(|(_, n)| n).sum();
    if total == 0 {
        return Err(FlError::ZeroSamples);
    }
    for (params, _) in &results[1..] {
        first.check_compatible(params)?;
    }

    let total = total as f64;
    let arrays = first
        .arrays
        .iter()
        .enumerate()
        .map(|(idx, layout)| {
            let mut acc = vec![0f64; layout.len()];
            for (params, n) in results {
                let w = *n as f64;
                for (a, v) in acc.iter_mut().zip(&params.arrays[idx].values) {
                    *a += *v as f64 * w;
                }
            }
            NdArray::new(layout.shape.clone(), acc.into_iter().map(|v| (v / total) as f32).collect())
        })
        .collect();
    Ok(Parameters::new(arrays))
}

/// Sample-count weighted mean of client losses.
pub fn weighted_loss_avg(results: &[(u64, f64)]) -> Result<f64> {
    let total: u64 = results.iter().map(|(n, _)| n).sum();
    if total == 0 {
        return Err(FlError::ZeroSamples);
    }
    let weighted: f64 = results.iter().map(|(n, loss)| *n as f64 * loss).sum();
    Ok(weighted / total as f64)
}
