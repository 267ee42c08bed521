//! Reduction of raw batch samples to per-candidate statistics.
//!
//! Medians keep outlier batches (interrupts, frequency excursions on real
//! hardware) from steering the search. The chunk strip compresses each
//! candidate's sample sequence into a fixed-width string for the status
//! line. The trailing row of every measurement is the check: a
//! re-measurement of candidate 0 that feeds batch-size tuning and the
//! ratio, never acceptance.

use crate::error::{ForgeError, ForgeResult};
use crate::measure::{MeasureFault, RawMeasurement};
use itertools::Itertools;

pub const CHUNK_WIDTH: usize = 8;
const RAMP: &[u8] = b" .:-=+*#%";

#[derive(Debug, Clone)]
pub struct Analysis {
    /// Median batch sum divided by batch size: cycles per execution.
    pub raw_median: Vec<f64>,
    /// Median batch sum, unscaled.
    pub batch_scaled: Vec<u64>,
    /// Fixed-width compression of each candidate's sample sequence.
    pub chunks: Vec<String>,
}

impl Analysis {
    /// Candidates only, excluding the trailing check entry.
    pub fn candidate_count(&self) -> usize {
        self.raw_median.len().saturating_sub(1)
    }

    pub fn check_median(&self) -> f64 {
        *self.raw_median.last().unwrap_or(&0.0)
    }
}

fn median_u64(samples: &[u64]) -> u64 {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n == 0 {
        return 0;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2
    }
}

fn chunk_strip(samples: &[u64]) -> String {
    if samples.is_empty() {
        return " ".repeat(CHUNK_WIDTH);
    }
    let buckets: Vec<f64> = (0..CHUNK_WIDTH)
        .map(|i| {
            let lo = i * samples.len() / CHUNK_WIDTH;
            if lo >= samples.len() {
                return samples[samples.len() - 1] as f64;
            }
            let hi = (((i + 1) * samples.len()) / CHUNK_WIDTH).max(lo + 1).min(samples.len());
            let slice = &samples[lo..hi];
            slice.iter().sum::<u64>() as f64 / slice.len() as f64
        })
        .collect();
    let (min, max) = match buckets.iter().minmax_by(|a, b| a.total_cmp(b)) {
        itertools::MinMaxResult::NoElements => return " ".repeat(CHUNK_WIDTH),
        itertools::MinMaxResult::OneElement(&x) => (x, x),
        itertools::MinMaxResult::MinMax(&a, &b) => (a, b),
    };
    buckets
        .iter()
        .map(|&v| {
            let idx = if max > min {
                (((v - min) / (max - min)) * (RAMP.len() - 1) as f64).round() as usize
            } else {
                RAMP.len() / 2
            };
            RAMP[idx.min(RAMP.len() - 1)] as char
        })
        .collect()
}

/// Reduce one measurement. Faults reported by the measurer surface here as
/// the corresponding error class.
pub fn analyse(raw: &RawMeasurement) -> ForgeResult<Analysis> {
    match &raw.fault {
        Some(MeasureFault::Incorrect) => return Err(ForgeError::MeasureIncorrect),
        Some(MeasureFault::Invalid(msg)) => return Err(ForgeError::MeasureInvalid(msg.clone())),
        Some(MeasureFault::Generic(msg)) => return Err(ForgeError::MeasureGeneric(msg.clone())),
        None => {}
    }
    if raw.batch_sums.is_empty() || raw.batch_size == 0 {
        return Err(ForgeError::MeasureGeneric("empty measurement".into()));
    }

    let batch_scaled: Vec<u64> = raw.batch_sums.iter().map(|row| median_u64(row)).collect();
    let raw_median: Vec<f64> = batch_scaled
        .iter()
        .map(|&m| m as f64 / raw.batch_size as f64)
        .collect();
    let chunks: Vec<String> = raw.batch_sums.iter().map(|row| chunk_strip(row)).collect();

    Ok(Analysis {
        raw_median,
        batch_scaled,
        chunks,
    })
}
