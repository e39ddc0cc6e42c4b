//! Ordinary least squares fit of `y = slope * x + offset`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FitError {
    #[error("Linear fit needs at least 2 points, got {points}")]
    InsufficientData { points: usize },

    #[error("x has {x} points but y has {y}")]
    LengthMismatch { x: usize, y: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub offset: f64,
    /// Coefficient of determination, only computed when requested.
    pub r_squared: Option<f64>,
}

impl LinearFit {
    /// Result recorded for pixels that could not be fitted.
    pub fn unfit(with_r_squared: bool) -> Self {
        Self {
            slope: f64::NAN,
            offset: f64::NAN,
            r_squared: with_r_squared.then_some(f64::NAN),
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.offset
    }
}

/// Fits `y = slope * x + offset` in `f64`.
///
/// Constant `y` yields slope 0, offset equal to that constant and `r² = 1`.
/// When every `x` is equal but `y` varies the system has no unique solution
/// and every component is `NaN`.
pub fn fit_linear(x: &[f64], y: &[f64], with_r_squared: bool) -> Result<LinearFit, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        });
    }
    let n = x.len();
    if n < 2 {
        return Err(FitError::InsufficientData { points: n });
    }

    if y.iter().all(|&v| v == y[0]) {
        return Ok(LinearFit {
            slope: 0.0,
            offset: y[0],
            r_squared: with_r_squared.then_some(1.0),
        });
    }

    let n_f = n as f64;
    let mean_x = x.iter().sum::<f64>() / n_f;
    let mean_y = y.iter().sum::<f64>() / n_f;

    let (mut sxx, mut sxy) = (0.0, 0.0);
    for (&xi, &yi) in x.iter().zip(y) {
        let dx = xi - mean_x;
        sxx += dx * dx;
        sxy += dx * (yi - mean_y);
    }

    if sxx == 0.0 {
        return Ok(LinearFit::unfit(with_r_squared));
    }

    let slope = sxy / sxx;
    let offset = mean_y - slope * mean_x;

    let r_squared = with_r_squared.then(|| {
        let (mut ss_res, mut ss_tot) = (0.0, 0.0);
        for (&xi, &yi) in x.iter().zip(y) {
            let residual = yi - (slope * xi + offset);
            ss_res += residual * residual;
            let dy = yi - mean_y;
            ss_tot += dy * dy;
        }
        1.0 - ss_res / ss_tot
    });

    Ok(LinearFit {
        slope,
        offset,
        r_squared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_exact_line() {
        let fit = fit_linear(&[0.0, 1.0, 2.0, 3.0], &[1.0, 3.0, 5.0, 7.0], true).unwrap();
        assert!((fit.slope - 2.0).abs() < EPS);
        assert!((fit.offset - 1.0).abs() < EPS);
        assert!((fit.r_squared.unwrap() - 1.0).abs() < EPS);
    }

    #[test]
    fn test_recovers_arbitrary_line() {
        let x: Vec<f64> = (0..50).map(|i| 0.37 * i as f64 - 4.0).collect();
        let y: Vec<f64> = x.iter().map(|&v| -1.25 * v + 17.5).collect();
        let fit = fit_linear(&x, &y, false).unwrap();
        assert!((fit.slope + 1.25).abs() < 1e-9);
        assert!((fit.offset - 17.5).abs() < 1e-9);
        assert_eq!(fit.r_squared, None);
    }

    #[test]
    fn test_constant_y() {
        let fit = fit_linear(&[1.0, 2.0, 3.0], &[5.0, 5.0, 5.0], true).unwrap();
        assert_eq!(fit.slope, 0.0);
        assert_eq!(fit.offset, 5.0);
        assert_eq!(fit.r_squared, Some(1.0));
    }

    #[test]
    fn test_noisy_r_squared_below_one() {
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [0.1, 0.9, 2.2, 2.8, 4.1];
        let fit = fit_linear(&x, &y, true).unwrap();
        let r2 = fit.r_squared.unwrap();
        assert!(r2 > 0.98 && r2 < 1.0, "r² = {r2}");
        assert!((fit.slope - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_points() {
        assert_eq!(
            fit_linear(&[1.0], &[2.0], false).unwrap_err(),
            FitError::InsufficientData { points: 1 }
        );
        assert_eq!(
            fit_linear(&[], &[], false).unwrap_err(),
            FitError::InsufficientData { points: 0 }
        );
    }

    #[test]
    fn test_length_mismatch() {
        assert_eq!(
            fit_linear(&[1.0, 2.0], &[1.0], false).unwrap_err(),
            FitError::LengthMismatch { x: 2, y: 1 }
        );
    }

    #[test]
    fn test_constant_x_is_nan() {
        let fit = fit_linear(&[2.0, 2.0, 2.0], &[1.0, 2.0, 3.0], true).unwrap();
        assert!(fit.slope.is_nan());
        assert!(fit.offset.is_nan());
        assert!(fit.r_squared.unwrap().is_nan());
    }

    #[test]
    fn test_unfit() {
        let fit = LinearFit::unfit(false);
        assert!(fit.slope.is_nan() && fit.offset.is_nan());
        assert_eq!(fit.r_squared, None);
        assert!((LinearFit {
            slope: 2.0,
            offset: 1.0,
            r_squared: None
        }
        .eval(3.0)
            - 7.0)
            .abs()
            < EPS);
    }
}
