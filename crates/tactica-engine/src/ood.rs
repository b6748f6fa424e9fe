//! Distribution-shift detection
//!
//! Flags feature vectors statistically unlike the population the engine has
//! seen, via Mahalanobis distance against a fitted mean/covariance. The hot
//! read path only takes a read lock over an immutable snapshot; the
//! distribution itself is refitted by a separate, externally triggered batch
//! recompute over a fresh sample window, never incrementally per request.

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::bandit::Cholesky;

/// Ridge added to the covariance diagonal before inversion
const COV_RIDGE: f64 = 1e-6;

/// Result of a shift check
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftReport {
    pub is_ood: bool,
    /// Mahalanobis distance; absent when the detector declined to judge
    pub distance: Option<f64>,
    /// Why the detector declined, when it did
    pub reason: Option<&'static str>,
}

impl ShiftReport {
    fn undecided(reason: &'static str) -> Self {
        Self {
            is_ood: false,
            distance: None,
            reason: Some(reason),
        }
    }
}

/// Fitted distribution snapshot
struct Distribution {
    mean: Vec<f64>,
    /// Inverse covariance, row-major d x d
    inv_cov: Vec<f64>,
    sample_count: usize,
}

/// Mahalanobis-distance shift detector
pub struct OodDetector {
    state: RwLock<Option<Distribution>>,
    dim: usize,
    threshold: f64,
    min_samples: usize,
}

impl OodDetector {
    pub fn new(dim: usize, threshold: f64, min_samples: usize) -> Self {
        Self {
            state: RwLock::new(None),
            dim,
            threshold,
            min_samples,
        }
    }

    /// Check whether `x` is statistically unlike the fitted population.
    ///
    /// Below the minimum sample count the detector reports not-OOD with an
    /// "insufficient data" reason rather than guessing.
    pub fn check_shift(&self, x: &[f64]) -> ShiftReport {
        let state = self.state.read();
        let dist = match state.as_ref() {
            Some(d) if d.sample_count >= self.min_samples => d,
            _ => return ShiftReport::undecided("insufficient data"),
        };
        if x.len() != self.dim {
            return ShiftReport::undecided("dimension mismatch");
        }

        let diff: Vec<f64> = x.iter().zip(&dist.mean).map(|(a, b)| a - b).collect();
        let mut quad = 0.0;
        for i in 0..self.dim {
            let mut row = 0.0;
            for j in 0..self.dim {
                row += dist.inv_cov[i * self.dim + j] * diff[j];
            }
            quad += diff[i] * row;
        }
        let distance = quad.max(0.0).sqrt();

        ShiftReport {
            is_ood: distance > self.threshold,
            distance: Some(distance),
            reason: None,
        }
    }

    /// Refit the distribution from a fresh sample window.
    ///
    /// Batch recompute: mean, covariance (with a small diagonal ridge), and
    /// its inverse are built outside the lock and swapped in atomically.
    pub fn refresh(&self, window: &[Vec<f64>]) {
        let n = window.len();
        if n < 2 {
            debug!(samples = n, "ood refresh skipped: window too small");
            return;
        }
        let d = self.dim;
        if window.iter().any(|x| x.len() != d) {
            warn!("ood refresh skipped: sample dimension mismatch");
            return;
        }

        let mut mean = vec![0.0; d];
        for x in window {
            for i in 0..d {
                mean[i] += x[i];
            }
        }
        for m in &mut mean {
            *m /= n as f64;
        }

        let mut cov = vec![0.0; d * d];
        for x in window {
            for i in 0..d {
                let di = x[i] - mean[i];
                for j in 0..d {
                    cov[i * d + j] += di * (x[j] - mean[j]);
                }
            }
        }
        let denom = (n - 1) as f64;
        for (i, v) in cov.iter_mut().enumerate() {
            *v /= denom;
            if i % (d + 1) == 0 {
                *v += COV_RIDGE;
            }
        }

        let chol = match Cholesky::factor(&cov, d, 0.0) {
            Some(chol) => chol,
            None => {
                warn!("ood refresh skipped: covariance not positive definite");
                return;
            }
        };

        // invert column by column
        let mut inv_cov = vec![0.0; d * d];
        let mut basis = vec![0.0; d];
        for j in 0..d {
            basis[j] = 1.0;
            let col = chol.solve(&basis);
            basis[j] = 0.0;
            for i in 0..d {
                inv_cov[i * d + j] = col[i];
            }
        }

        debug!(samples = n, "ood distribution refreshed");
        *self.state.write() = Some(Distribution {
            mean,
            inv_cov,
            sample_count: n,
        });
    }

    /// Number of samples behind the current fit, if any
    pub fn sample_count(&self) -> usize {
        self.state.read().as_ref().map_or(0, |d| d.sample_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn near(v: f64, noise: f64, i: usize) -> f64 {
        // deterministic pseudo-noise, enough to make the covariance full rank
        v + noise * ((i as f64 * 0.7).sin())
    }

    fn fitted_detector(min_samples: usize) -> OodDetector {
        let detector = OodDetector::new(3, 2.5, min_samples);
        let window: Vec<Vec<f64>> = (0..200)
            .map(|i| {
                vec![
                    near(1.0, 0.1, i),
                    near(0.5, 0.1, i + 1),
                    near(-0.5, 0.1, i + 2),
                ]
            })
            .collect();
        detector.refresh(&window);
        detector
    }

    #[test]
    fn test_insufficient_data_never_flags() {
        let detector = OodDetector::new(3, 2.5, 100);
        let report = detector.check_shift(&[100.0, 100.0, 100.0]);
        assert!(!report.is_ood);
        assert_eq!(report.reason, Some("insufficient data"));
    }

    #[test]
    fn test_inlier_passes_outlier_flags() {
        let detector = fitted_detector(100);

        let inlier = detector.check_shift(&[1.0, 0.5, -0.5]);
        assert!(!inlier.is_ood, "distance {:?}", inlier.distance);
        assert!(inlier.reason.is_none());

        let outlier = detector.check_shift(&[50.0, -50.0, 50.0]);
        assert!(outlier.is_ood);
        assert!(outlier.distance.unwrap() > 2.5);
    }

    #[test]
    fn test_dimension_mismatch_is_undecided() {
        let detector = fitted_detector(100);
        let report = detector.check_shift(&[1.0, 0.5]);
        assert!(!report.is_ood);
        assert_eq!(report.reason, Some("dimension mismatch"));
    }

    #[test]
    fn test_refresh_replaces_fit() {
        let detector = fitted_detector(10);
        assert_eq!(detector.sample_count(), 200);

        let window: Vec<Vec<f64>> = (0..50)
            .map(|i| vec![near(10.0, 0.1, i), near(10.0, 0.1, i + 1), near(10.0, 0.1, i + 2)])
            .collect();
        detector.refresh(&window);
        assert_eq!(detector.sample_count(), 50);

        // the old center is now far away
        assert!(detector.check_shift(&[1.0, 0.5, -0.5]).is_ood);
    }
}
