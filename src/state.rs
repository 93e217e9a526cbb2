//! Probabilistic state representations.
//!
//! A session's belief about its model is always a `StateDistribution`: a point
//! value, a multivariate normal, or a cloud of unweighted samples. All three
//! answer the same questions (mean, covariance, samples, summary metrics) so
//! readers never need to know which estimator produced them.

use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ProgResult, ValidationError};

/// A vector of named scalar values (state, input, output or event state).
pub type NamedVector = BTreeMap<String, f64>;

/// Number of samples used when a non-point belief is pushed through a model function.
pub const DEFAULT_MAP_SAMPLES: usize = 100;

const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Summary statistics for one variable of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistributionMetrics {
    /// Expected value.
    pub mean: f64,
    /// Standard deviation.
    pub std: f64,
    /// Median.
    pub median: f64,
    /// 5th percentile.
    pub p05: f64,
    /// 95th percentile.
    pub p95: f64,
}

/// Belief over a set of named variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateDistribution {
    /// A single known value.
    Scalar {
        /// The value of every variable.
        values: NamedVector,
    },
    /// A multivariate normal distribution.
    MultivariateNormal {
        /// Variable names, in the order used by `mean` and `cov`.
        keys: Vec<String>,
        /// Mean vector.
        mean: Vec<f64>,
        /// Covariance matrix (row-major, square).
        cov: Vec<Vec<f64>>,
    },
    /// Equally weighted samples.
    Samples {
        /// The samples. Every sample has the same key set.
        samples: Vec<NamedVector>,
    },
}

impl From<NamedVector> for StateDistribution {
    fn from(values: NamedVector) -> Self {
        Self::Scalar { values }
    }
}

impl StateDistribution {
    /// Creates a point distribution.
    #[must_use]
    pub fn scalar(values: NamedVector) -> Self {
        Self::Scalar { values }
    }

    /// Creates a multivariate normal distribution, validating its shape.
    pub fn multivariate_normal(keys: Vec<String>, mean: Vec<f64>, cov: Vec<Vec<f64>>) -> ProgResult<Self> {
        let dist = Self::MultivariateNormal { keys, mean, cov };
        dist.validate()?;
        Ok(dist)
    }

    /// Creates an unweighted sample distribution, validating that it is non-empty
    /// and that every sample carries the same variables.
    pub fn samples(samples: Vec<NamedVector>) -> ProgResult<Self> {
        let dist = Self::Samples { samples };
        dist.validate()?;
        Ok(dist)
    }

    /// Checks structural consistency. Deserialized distributions should be
    /// validated before use.
    pub fn validate(&self) -> ProgResult<()> {
        match self {
            Self::Scalar { values } => ensure_finite(values.values().copied()),
            Self::MultivariateNormal { keys, mean, cov } => {
                let n = keys.len();
                let unique: BTreeSet<&String> = keys.iter().collect();
                if unique.len() != n {
                    return Err(invalid("duplicate keys in multivariate normal"));
                }
                if mean.len() != n {
                    return Err(invalid(format!("mean has {} entries, expected {n}", mean.len())));
                }
                if cov.len() != n || cov.iter().any(|row| row.len() != n) {
                    return Err(invalid(format!("covariance must be {n}x{n}")));
                }
                ensure_finite(mean.iter().copied())?;
                ensure_finite(cov.iter().flatten().copied())?;
                for i in 0..n {
                    if cov[i][i] < 0.0 {
                        return Err(invalid(format!("negative variance for '{}'", keys[i])));
                    }
                    for j in 0..i {
                        if (cov[i][j] - cov[j][i]).abs() > SYMMETRY_TOLERANCE {
                            return Err(invalid("covariance must be symmetric"));
                        }
                    }
                }
                cholesky(cov).map(|_| ())
            }
            Self::Samples { samples } => {
                let Some(first) = samples.first() else {
                    return Err(invalid("sample distribution must not be empty"));
                };
                let expected: Vec<&String> = first.keys().collect();
                for s in samples {
                    if !s.keys().eq(expected.iter().copied()) {
                        return Err(invalid("samples must share the same keys"));
                    }
                    ensure_finite(s.values().copied())?;
                }
                Ok(())
            }
        }
    }

    /// Variable names in canonical order (the order used by `cov`).
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Scalar { values } => values.keys().cloned().collect(),
            Self::MultivariateNormal { keys, .. } => keys.clone(),
            Self::Samples { samples } => samples
                .first()
                .map(|s| s.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Variable names as a set, for key-set comparisons.
    #[must_use]
    pub fn key_set(&self) -> BTreeSet<String> {
        self.keys().into_iter().collect()
    }

    /// True when the distribution is a single known value.
    #[must_use]
    pub const fn is_point(&self) -> bool {
        matches!(self, Self::Scalar { .. })
    }

    /// Expected value of every variable.
    #[must_use]
    pub fn mean(&self) -> NamedVector {
        match self {
            Self::Scalar { values } => values.clone(),
            Self::MultivariateNormal { keys, mean, .. } => {
                keys.iter().cloned().zip(mean.iter().copied()).collect()
            }
            Self::Samples { samples } => sample_mean(samples),
        }
    }

    /// Covariance matrix, ordered as `keys()`.
    #[must_use]
    pub fn cov(&self) -> Vec<Vec<f64>> {
        match self {
            Self::Scalar { values } => vec![vec![0.0; values.len()]; values.len()],
            Self::MultivariateNormal { cov, .. } => cov.clone(),
            Self::Samples { samples } => {
                let keys = self.keys();
                let mean = sample_mean(samples);
                let n = keys.len();
                let mut out = vec![vec![0.0; n]; n];
                if samples.len() < 2 {
                    return out;
                }
                let denom = (samples.len() - 1) as f64;
                for s in samples {
                    for (i, ki) in keys.iter().enumerate() {
                        let di = value_of(s, ki) - value_of(&mean, ki);
                        for (j, kj) in keys.iter().enumerate() {
                            out[i][j] += di * (value_of(s, kj) - value_of(&mean, kj)) / denom;
                        }
                    }
                }
                out
            }
        }
    }

    /// Draws `n` samples.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<NamedVector> {
        match self {
            Self::Scalar { values } => vec![values.clone(); n],
            Self::MultivariateNormal { keys, mean, cov } => {
                // Unvalidated input falls back to the mean.
                let Ok(l) = self.validate().and_then(|()| cholesky(cov)) else {
                    return vec![self.mean(); n];
                };
                (0..n)
                    .map(|_| {
                        let z: Vec<f64> = (0..keys.len()).map(|_| rng.sample(StandardNormal)).collect();
                        keys.iter()
                            .enumerate()
                            .map(|(i, k)| {
                                let offset: f64 = (0..=i).map(|j| l[i][j] * z[j]).sum();
                                (k.clone(), mean[i] + offset)
                            })
                            .collect()
                    })
                    .collect()
            }
            Self::Samples { samples } => {
                if samples.is_empty() {
                    return Vec::new();
                }
                (0..n)
                    .map(|_| samples[rng.gen_range(0..samples.len())].clone())
                    .collect()
            }
        }
    }

    /// Per-variable summary statistics.
    #[must_use]
    pub fn metrics(&self) -> BTreeMap<String, DistributionMetrics> {
        match self {
            Self::Scalar { values } => values
                .iter()
                .map(|(k, &v)| {
                    let m = DistributionMetrics {
                        mean: v,
                        std: 0.0,
                        median: v,
                        p05: v,
                        p95: v,
                    };
                    (k.clone(), m)
                })
                .collect(),
            Self::MultivariateNormal { keys, mean, cov } => keys
                .iter()
                .enumerate()
                .map(|(i, k)| {
                    let mu = mean.get(i).copied().unwrap_or(f64::NAN);
                    let var = cov.get(i).and_then(|row| row.get(i)).copied().unwrap_or(f64::NAN);
                    let std = var.max(0.0).sqrt();
                    // 1.645 sigma bounds the central 90% of a normal.
                    let m = DistributionMetrics {
                        mean: mu,
                        std,
                        median: mu,
                        p05: mu - 1.645 * std,
                        p95: mu + 1.645 * std,
                    };
                    (k.clone(), m)
                })
                .collect(),
            Self::Samples { samples } => {
                let mut out = BTreeMap::new();
                for key in self.keys() {
                    let values: Vec<f64> = samples.iter().map(|s| value_of(s, &key)).collect();
                    out.insert(key, empirical_metrics(values));
                }
                out
            }
        }
    }

    /// Pushes the belief through a model function.
    ///
    /// Point beliefs are evaluated once; sample beliefs are evaluated per sample;
    /// normal beliefs are evaluated on `n_samples` draws.
    pub fn map<F, R>(&self, f: F, n_samples: usize, rng: &mut R) -> StateDistribution
    where
        F: Fn(&NamedVector) -> NamedVector,
        R: Rng + ?Sized,
    {
        match self {
            Self::Scalar { values } => Self::Scalar { values: f(values) },
            Self::Samples { samples } => Self::Samples {
                samples: samples.iter().map(&f).collect(),
            },
            Self::MultivariateNormal { .. } => Self::Samples {
                samples: self.sample(n_samples.max(1), rng).iter().map(&f).collect(),
            },
        }
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::ProgError {
    ValidationError::InvalidDistribution { reason: reason.into() }.into()
}

/// Value of `key`, NaN when absent.
fn value_of(v: &NamedVector, key: &str) -> f64 {
    v.get(key).copied().unwrap_or(f64::NAN)
}

fn ensure_finite(values: impl Iterator<Item = f64>) -> ProgResult<()> {
    for v in values {
        if !v.is_finite() {
            return Err(invalid(format!("non-finite value {v}")));
        }
    }
    Ok(())
}

pub(crate) fn sample_mean(samples: &[NamedVector]) -> NamedVector {
    let mut out = NamedVector::new();
    if samples.is_empty() {
        return out;
    }
    let n = samples.len() as f64;
    for s in samples {
        for (k, v) in s {
            *out.entry(k.clone()).or_insert(0.0) += v / n;
        }
    }
    out
}

/// Empirical summary of a set of values. Empty input yields NaN fields.
pub(crate) fn empirical_metrics(mut values: Vec<f64>) -> DistributionMetrics {
    if values.is_empty() {
        return DistributionMetrics {
            mean: f64::NAN,
            std: f64::NAN,
            median: f64::NAN,
            p05: f64::NAN,
            p95: f64::NAN,
        };
    }
    values.sort_by(f64::total_cmp);
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = if values.len() > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    DistributionMetrics {
        mean,
        std: var.sqrt(),
        median: percentile(&values, 0.5),
        p05: percentile(&values, 0.05),
        p95: percentile(&values, 0.95),
    }
}

/// Linear-interpolated percentile of sorted values.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Lower-triangular Cholesky factor. Positive semi-definite matrices are
/// accepted: zero pivots produce zero columns.
fn cholesky(a: &[Vec<f64>]) -> ProgResult<Vec<Vec<f64>>> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    for j in 0..n {
        let d = a[j][j] - (0..j).map(|k| l[j][k] * l[j][k]).sum::<f64>();
        if d < -SYMMETRY_TOLERANCE {
            return Err(invalid("covariance is not positive semi-definite"));
        }
        let pivot = d.max(0.0).sqrt();
        l[j][j] = pivot;
        for i in (j + 1)..n {
            let s = a[i][j] - (0..j).map(|k| l[i][k] * l[j][k]).sum::<f64>();
            l[i][j] = if pivot > 0.0 { s / pivot } else { 0.0 };
        }
    }
    Ok(l)
}
