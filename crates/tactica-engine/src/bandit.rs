//! Bayesian linear bandit head
//!
//! Per-arm ridge regression over the encoder's feature space, scored by
//! Thompson sampling. The head owns only its sufficient statistics: the
//! precision matrix `A` (seeded to lambda*I) and the response vector `b`.
//!
//! `A` stays positive definite by construction (positive prior plus rank-1
//! updates), so the Cholesky factorization used for both sampling and the
//! posterior-mean solve should never fail; if it does, the factorization is
//! retried with exponentially increasing diagonal jitter before surfacing
//! `NumericError::CholeskyFailed`.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use tactica_common::NumericError;

/// Jitter retry budget for a non-positive-definite factorization
const MAX_CHOLESKY_ATTEMPTS: u32 = 6;

/// Starting diagonal jitter, grown by 10x per retry
const BASE_JITTER: f64 = 1e-9;

/// Sufficient statistics of one arm's value model
#[derive(Debug, Clone)]
pub struct BanditHead {
    dim: usize,
    /// Precision matrix, d x d row-major
    a: Vec<f64>,
    /// Response vector, length d
    b: Vec<f64>,
    /// Number of updates applied
    pulls: u64,
}

impl BanditHead {
    /// Fresh head with prior `A = lambda * I`, `b = 0`
    pub fn new(dim: usize, lambda: f64) -> Self {
        let mut a = vec![0.0; dim * dim];
        let diag = if lambda.is_finite() && lambda > 0.0 {
            lambda
        } else {
            1.0
        };
        for i in 0..dim {
            a[i * dim + i] = diag;
        }
        Self {
            dim,
            a,
            b: vec![0.0; dim],
            pulls: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn pulls(&self) -> u64 {
        self.pulls
    }

    /// Thompson-sampled score for context `x`.
    ///
    /// Draws `theta ~ N(mean, A^-1)` and returns `theta . x`. Every call
    /// draws a fresh sample from the supplied RNG; exploration comes from
    /// the posterior spread, determinism from the caller seeding the RNG
    /// per request.
    pub fn score<R: Rng + ?Sized>(&self, x: &[f64], rng: &mut R) -> Result<f64, NumericError> {
        if x.len() != self.dim {
            return Err(NumericError::DimensionMismatch {
                expected: self.dim,
                actual: x.len(),
            });
        }
        let chol = self.factorize()?;
        let mean = chol.solve(&self.b);

        // theta = mean + L^-T z, since Cov = A^-1 = L^-T L^-1
        let z: Vec<f64> = (0..self.dim).map(|_| rng.sample(StandardNormal)).collect();
        let spread = chol.solve_transposed(&z);

        let mut score = 0.0;
        for i in 0..self.dim {
            score += (mean[i] + spread[i]) * x[i];
        }
        Ok(score)
    }

    /// Apply one observed reward: `A <- gamma*A + x x^T`, `b <- gamma*b + r x`.
    ///
    /// `gamma` in (0, 1] is the exponential forgetting factor; recent
    /// evidence is weighted more heavily. This is the sole mutator of
    /// learned state.
    pub fn update(&mut self, x: &[f64], reward: f64, gamma: f64) {
        debug_assert_eq!(x.len(), self.dim);
        if x.len() != self.dim {
            return;
        }
        let g = if gamma.is_finite() && gamma > 0.0 && gamma <= 1.0 {
            gamma
        } else {
            1.0
        };
        let r = if reward.is_finite() { reward } else { 0.0 };

        for i in 0..self.dim {
            for j in 0..self.dim {
                self.a[i * self.dim + j] = g * self.a[i * self.dim + j] + x[i] * x[j];
            }
            self.b[i] = g * self.b[i] + r * x[i];
        }
        self.pulls += 1;
    }

    /// Posterior mean `theta_hat` solving `A theta_hat = b`.
    ///
    /// No sampling involved; for diagnostics and explanation only, never for
    /// selection.
    pub fn mean_theta(&self) -> Result<Vec<f64>, NumericError> {
        let chol = self.factorize()?;
        Ok(chol.solve(&self.b))
    }

    /// Snapshot the sufficient statistics for persistence
    pub fn snapshot(&self) -> BanditHeadState {
        BanditHeadState {
            dim: self.dim,
            a: self.a.clone(),
            b: self.b.clone(),
            pulls: self.pulls,
        }
    }

    /// Restore a head from a snapshot, validating shape and finiteness
    pub fn restore(state: BanditHeadState) -> Result<Self, NumericError> {
        let d = state.dim;
        if state.a.len() != d * d || state.b.len() != d {
            return Err(NumericError::DimensionMismatch {
                expected: d * d,
                actual: state.a.len(),
            });
        }
        if !state.a.iter().chain(state.b.iter()).all(|v| v.is_finite()) {
            return Err(NumericError::NonFinite {
                context: "bandit head snapshot".to_string(),
            });
        }
        Ok(Self {
            dim: d,
            a: state.a,
            b: state.b,
            pulls: state.pulls,
        })
    }

    /// Cholesky factorization with bounded jitter retries
    fn factorize(&self) -> Result<Cholesky, NumericError> {
        let mut jitter = 0.0;
        for attempt in 0..MAX_CHOLESKY_ATTEMPTS {
            if let Some(chol) = Cholesky::factor(&self.a, self.dim, jitter) {
                return Ok(chol);
            }
            jitter = BASE_JITTER * 10f64.powi(attempt as i32);
        }
        Err(NumericError::CholeskyFailed {
            attempts: MAX_CHOLESKY_ATTEMPTS,
        })
    }
}

/// Serializable head state: flat arrays plus shape, per the store contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanditHeadState {
    pub dim: usize,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub pulls: u64,
}

/// Lower-triangular Cholesky factor of a symmetric positive-definite matrix
pub(crate) struct Cholesky {
    dim: usize,
    /// Row-major, entries above the diagonal unused
    l: Vec<f64>,
}

impl Cholesky {
    /// Factor `a + jitter*I`; `None` if the matrix is not positive definite
    pub(crate) fn factor(a: &[f64], dim: usize, jitter: f64) -> Option<Self> {
        let mut l = vec![0.0; dim * dim];
        for i in 0..dim {
            for j in 0..=i {
                let mut sum = a[i * dim + j];
                if i == j {
                    sum += jitter;
                }
                for k in 0..j {
                    sum -= l[i * dim + k] * l[j * dim + k];
                }
                if i == j {
                    if !(sum.is_finite() && sum > 0.0) {
                        return None;
                    }
                    l[i * dim + j] = sum.sqrt();
                } else {
                    l[i * dim + j] = sum / l[j * dim + j];
                }
            }
        }
        Some(Self { dim, l })
    }

    /// Solve `A x = v` via forward then backward substitution
    pub(crate) fn solve(&self, v: &[f64]) -> Vec<f64> {
        let y = self.forward(v);
        self.backward(&y)
    }

    /// Solve `L^T x = v` (backward substitution only).
    ///
    /// Used to map a standard normal draw into the posterior covariance.
    fn solve_transposed(&self, v: &[f64]) -> Vec<f64> {
        self.backward(v)
    }

    /// Solve `L y = v`
    fn forward(&self, v: &[f64]) -> Vec<f64> {
        let d = self.dim;
        let mut y = vec![0.0; d];
        for i in 0..d {
            let mut sum = v[i];
            for k in 0..i {
                sum -= self.l[i * d + k] * y[k];
            }
            y[i] = sum / self.l[i * d + i];
        }
        y
    }

    /// Solve `L^T x = v`
    fn backward(&self, v: &[f64]) -> Vec<f64> {
        let d = self.dim;
        let mut x = vec![0.0; d];
        for i in (0..d).rev() {
            let mut sum = v[i];
            for k in (i + 1)..d {
                sum -= self.l[k * d + i] * x[k];
            }
            x[i] = sum / self.l[i * d + i];
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_fresh_head_mean_is_zero() {
        let head = BanditHead::new(4, 1.0);
        let theta = head.mean_theta().unwrap();
        assert!(theta.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_update_shifts_mean_toward_context() {
        let mut head = BanditHead::new(4, 1.0);
        let x = vec![1.0, 0.5, 0.0, 0.2];

        let before = dot(&head.mean_theta().unwrap(), &x);
        head.update(&x, 0.9, 1.0);
        let after = dot(&head.mean_theta().unwrap(), &x);
        assert!(after > before, "mean projection should grow: {after} <= {before}");
    }

    #[test]
    fn test_score_remains_computable_under_adversarial_rewards() {
        let mut head = BanditHead::new(8, 1.0);
        let x = vec![1.0, 0.3, -0.7, 2.0, 0.0, 0.1, -1.5, 0.4];
        for i in 0..50 {
            let r = if i % 2 == 0 { 1e6 } else { -1e6 };
            head.update(&x, r, 0.995);
        }
        let mut rng = StdRng::seed_from_u64(7);
        let score = head.score(&x, &mut rng).unwrap();
        assert!(score.is_finite());
        assert!(head.mean_theta().unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_score_is_deterministic_per_seed() {
        let mut head = BanditHead::new(4, 1.0);
        head.update(&[1.0, 0.2, 0.0, 0.5], 0.7, 1.0);

        let x = [1.0, 0.1, 0.3, 0.0];
        let s1 = head.score(&x, &mut StdRng::seed_from_u64(42)).unwrap();
        let s2 = head.score(&x, &mut StdRng::seed_from_u64(42)).unwrap();
        let s3 = head.score(&x, &mut StdRng::seed_from_u64(43)).unwrap();
        assert_eq!(s1, s2);
        assert_ne!(s1, s3);
    }

    #[test]
    fn test_forgetting_discounts_old_evidence() {
        let x = vec![1.0, 0.0];
        let mut sticky = BanditHead::new(2, 1.0);
        let mut forgetful = BanditHead::new(2, 1.0);

        // both see an early high reward, then many zeros
        sticky.update(&x, 1.0, 1.0);
        forgetful.update(&x, 1.0, 0.9);
        for _ in 0..20 {
            sticky.update(&x, 0.0, 1.0);
            forgetful.update(&x, 0.0, 0.9);
        }

        let m_sticky = dot(&sticky.mean_theta().unwrap(), &x);
        let m_forgetful = dot(&forgetful.mean_theta().unwrap(), &x);
        assert!(m_forgetful < m_sticky);
    }

    #[test]
    fn test_snapshot_restore_preserves_posterior() {
        let mut head = BanditHead::new(3, 0.5);
        head.update(&[1.0, 0.4, -0.2], 0.8, 0.995);
        head.update(&[0.5, 1.0, 0.1], -0.3, 0.995);

        let restored = BanditHead::restore(head.snapshot()).unwrap();
        assert_eq!(restored.pulls(), head.pulls());
        let t1 = head.mean_theta().unwrap();
        let t2 = restored.mean_theta().unwrap();
        for (a, b) in t1.iter().zip(&t2) {
            assert!((a - b).abs() < 1e-15);
        }
    }

    #[test]
    fn test_restore_rejects_corrupt_state() {
        let bad_shape = BanditHeadState {
            dim: 3,
            a: vec![1.0; 4],
            b: vec![0.0; 3],
            pulls: 0,
        };
        assert!(BanditHead::restore(bad_shape).is_err());

        let non_finite = BanditHeadState {
            dim: 2,
            a: vec![1.0, 0.0, 0.0, f64::NAN],
            b: vec![0.0, 0.0],
            pulls: 1,
        };
        assert!(BanditHead::restore(non_finite).is_err());
    }
}
