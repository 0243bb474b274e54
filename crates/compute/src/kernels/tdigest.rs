//! Approximate quantiles via a merging t-digest sketch.
//!
//! Points are buffered and periodically folded into a centroid list; centroid
//! widths are bounded by the k-size scaling function, which keeps accuracy
//! highest near the distribution tails.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Builder};
use arrow_schema::DataType;
use brook_common::{BrookError, Result};

use crate::batch::Datum;

use super::{downcast_state, for_each_valid_f64, number_class, AggregateKernel, TDigestOptions};

#[derive(Debug, Clone, Copy)]
struct Centroid {
    mean: f64,
    weight: f64,
}

#[derive(Debug, Clone)]
struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    total_weight: f64,
    min: f64,
    max: f64,
}

impl TDigest {
    fn new(compression: f64) -> Self {
        Self {
            compression,
            centroids: Vec::new(),
            total_weight: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add_points(&mut self, points: &[f64]) {
        for &v in points {
            if !v.is_finite() {
                continue;
            }
            self.min = self.min.min(v);
            self.max = self.max.max(v);
            self.centroids.push(Centroid { mean: v, weight: 1.0 });
            self.total_weight += 1.0;
        }
        if self.centroids.len() as f64 > self.compression * 2.0 {
            self.compress();
        }
    }

    fn merge(&mut self, other: &TDigest) {
        if other.total_weight == 0.0 {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.centroids.extend(other.centroids.iter().copied());
        self.total_weight += other.total_weight;
        self.compress();
    }

    /// Cluster weight bound at quantile `q`: `4·n·q(1−q)/δ`.
    ///
    /// The bound shrinks toward the tails, which keeps extreme quantiles
    /// accurate, and falls below one point for small inputs, which keeps
    /// them exact.
    fn weight_limit(&self, q: f64) -> f64 {
        let q = q.clamp(0.0, 1.0);
        4.0 * self.total_weight * q * (1.0 - q) / self.compression
    }

    fn compress(&mut self) {
        if self.centroids.is_empty() {
            return;
        }
        self.centroids
            .sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap_or(Ordering::Equal));

        let mut compressed = Vec::new();
        let mut cumulative = 0.0;
        let mut current = self.centroids[0];

        for centroid in self.centroids.iter().skip(1) {
            let proposed = current.weight + centroid.weight;
            let q_mid = (cumulative + proposed / 2.0) / self.total_weight;

            if proposed <= self.weight_limit(q_mid) {
                current.mean =
                    (current.mean * current.weight + centroid.mean * centroid.weight) / proposed;
                current.weight = proposed;
            } else {
                cumulative += current.weight;
                compressed.push(current);
                current = *centroid;
            }
        }
        compressed.push(current);
        self.centroids = compressed;
    }

    /// Interpolate between centroid midpoints in cumulative-weight space.
    fn quantile(&self, q: f64) -> f64 {
        if self.centroids.is_empty() {
            return f64::NAN;
        }
        let q = q.clamp(0.0, 1.0);
        if q == 0.0 || self.centroids.len() == 1 {
            return self.min;
        }
        if q == 1.0 {
            return self.max;
        }

        let target = q * self.total_weight;
        let mut cumulative = 0.0;
        let mut prev_mid = 0.0;
        let mut prev_mean = self.min;
        for c in &self.centroids {
            let mid = cumulative + c.weight / 2.0;
            if target < mid {
                if mid <= prev_mid {
                    return c.mean;
                }
                return prev_mean + (target - prev_mid) / (mid - prev_mid) * (c.mean - prev_mean);
            }
            cumulative += c.weight;
            prev_mid = mid;
            prev_mean = c.mean;
        }
        let tail = self.total_weight - prev_mid;
        if tail <= 0.0 {
            return self.max;
        }
        prev_mean + (target - prev_mid) / tail * (self.max - prev_mean)
    }
}

/// Approximate quantile kernel backed by a merging t-digest.
///
/// Output is a `Float64` array with one element per requested quantile; all
/// elements are null when no values were seen.
#[derive(Debug)]
pub struct TDigestKernel {
    options: TDigestOptions,
    digest: TDigest,
    buffer: Vec<f64>,
}

impl TDigestKernel {
    pub(crate) fn try_new(options: TDigestOptions, input_type: &DataType) -> Result<Self> {
        if number_class(input_type).is_none() {
            return Err(BrookError::NotImplemented(format!(
                "tdigest over {input_type:?}"
            )));
        }
        for q in &options.q {
            if !(0.0..=1.0).contains(q) {
                return Err(BrookError::Invalid(format!(
                    "tdigest q must be in [0, 1], got {q}"
                )));
            }
        }
        let digest = TDigest::new(options.delta.max(1) as f64);
        Ok(Self {
            options,
            digest,
            buffer: Vec::new(),
        })
    }

    fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.buffer.sort_by(|a, b| a.total_cmp(b));
            let points = std::mem::take(&mut self.buffer);
            self.digest.add_points(&points);
        }
    }
}

impl AggregateKernel for TDigestKernel {
    fn consume(&mut self, input: &Datum, length: usize) -> Result<()> {
        match input {
            Datum::Array(a) => {
                let buffer = &mut self.buffer;
                for_each_valid_f64(a, |v| buffer.push(v))?;
            }
            Datum::Scalar(s) => {
                if !s.is_null() {
                    let v = s.as_f64().ok_or_else(|| {
                        BrookError::TypeError(format!("scalar {s} is not numeric"))
                    })?;
                    self.buffer.extend(std::iter::repeat(v).take(length));
                }
            }
        }
        if self.buffer.len() >= self.options.buffer_size.max(1) as usize {
            self.flush();
        }
        Ok(())
    }

    fn merge_from(&mut self, other: Box<dyn AggregateKernel>) -> Result<()> {
        let mut other = downcast_state::<Self>(other)?;
        other.flush();
        self.flush();
        self.digest.merge(&other.digest);
        Ok(())
    }

    fn finalize(&mut self) -> Result<Datum> {
        self.flush();
        let mut out = Float64Builder::with_capacity(self.options.q.len());
        if self.digest.total_weight == 0.0 {
            for _ in &self.options.q {
                out.append_null();
            }
        } else {
            for &q in &self.options.q {
                out.append_value(self.digest.quantile(q));
            }
        }
        let arr: ArrayRef = Arc::new(out.finish());
        Ok(Datum::Array(arr))
    }

    fn out_type(&self) -> DataType {
        DataType::Float64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Float64Array;

    use super::*;

    fn finalize_first(kernel: &mut TDigestKernel) -> Option<f64> {
        let out = match kernel.finalize().expect("finalize") {
            Datum::Array(a) => a,
            other => panic!("expected array, got {other:?}"),
        };
        let out = out
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("float64");
        use arrow::array::Array;
        (!out.is_null(0)).then(|| out.value(0))
    }

    #[test]
    fn small_inputs_are_exact_at_the_median() {
        let mut kernel =
            TDigestKernel::try_new(TDigestOptions::default(), &DataType::Float64).expect("kernel");
        let arr = Datum::Array(Arc::new(Float64Array::from(vec![
            5.0, 5.0, 5.0, 5.0, 6.0, 7.0,
        ])));
        kernel.consume(&arr, 6).expect("consume");
        assert_eq!(finalize_first(&mut kernel), Some(5.0));
    }

    #[test]
    fn large_inputs_stay_close_after_merges() {
        let mut left =
            TDigestKernel::try_new(TDigestOptions::default(), &DataType::Float64).expect("kernel");
        let mut right =
            TDigestKernel::try_new(TDigestOptions::default(), &DataType::Float64).expect("kernel");
        let low: Vec<f64> = (0..5000).map(|i| i as f64 / 5000.0).collect();
        let high: Vec<f64> = (5000..10000).map(|i| i as f64 / 5000.0).collect();
        left.consume(&Datum::Array(Arc::new(Float64Array::from(low))), 5000)
            .expect("consume");
        right
            .consume(&Datum::Array(Arc::new(Float64Array::from(high))), 5000)
            .expect("consume");
        left.merge_from(Box::new(right)).expect("merge");

        let median = finalize_first(&mut left).expect("median");
        assert!((median - 1.0).abs() < 0.05, "median drifted: {median}");
    }

    #[test]
    fn empty_digest_yields_null() {
        let mut kernel =
            TDigestKernel::try_new(TDigestOptions::default(), &DataType::Float64).expect("kernel");
        assert_eq!(finalize_first(&mut kernel), None);
    }
}
