use rayon::prelude::*;

use crate::assert_same_len;
use crate::error::ConfigError;

///////////
// Types //
///////////

/// Degree of the local polynomial
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoessDegree {
    /// Local linear fit
    Linear,
    /// Local quadratic fit
    Quadratic,
}

impl LoessDegree {
    /// Number of polynomial coefficients
    fn n_coef(self) -> usize {
        match self {
            LoessDegree::Linear => 2,
            LoessDegree::Quadratic => 3,
        }
    }
}

impl TryFrom<usize> for LoessDegree {
    type Error = ConfigError;

    fn try_from(degree: usize) -> Result<Self, Self::Error> {
        match degree {
            1 => Ok(LoessDegree::Linear),
            2 => Ok(LoessDegree::Quadratic),
            _ => Err(ConfigError::InvalidOption {
                name: "loess_degree",
                value: degree.to_string(),
            }),
        }
    }
}

/// Result of a loess fit
///
/// ### Fields
///
/// * `fitted_vals` - Fitted value per input point. Points with non-finite
///   coordinates are not used and get `0.0`.
/// * `residuals` - `y - fitted`, `0.0` for points that were not used.
/// * `n_used` - Number of points with finite coordinates.
#[derive(Clone, Debug)]
pub struct LoessRes {
    pub fitted_vals: Vec<f64>,
    pub residuals: Vec<f64>,
    pub n_used: usize,
}

/////////////
// Helpers //
/////////////

/// Tricube kernel on `u` in `[0, 1]`
#[inline]
fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u * u;
        t * t * t
    }
}

/// Solve a small dense system with partial pivoting, in place
///
/// Returns `None` if the system is (numerically) singular.
fn solve_small_system(a: &mut [[f64; 3]; 3], b: &mut [f64; 3], n: usize) -> Option<[f64; 3]> {
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut coef = [0.0; 3];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * coef[k]).sum();
        coef[row] = (b[row] - tail) / a[row][row];
    }
    Some(coef)
}

////////////////
// Regression //
////////////////

/// Local polynomial regression with tricube weights
#[derive(Clone, Debug)]
pub struct LoessRegression {
    span: f64,
    degree: LoessDegree,
}

impl LoessRegression {
    /// Generate a new instance of the Loess regression
    ///
    /// ### Params
    ///
    /// * `span` - Fraction of the points used for each local fit, `(0, 1]`.
    /// * `degree` - Degree of the local polynomial (`1` or `2`).
    ///
    /// ### Return
    ///
    /// Initialised class or a `ConfigError` for invalid parameters.
    pub fn new(span: f64, degree: usize) -> Result<Self, ConfigError> {
        if !(span > 0.0 && span <= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "loess_span",
                value: span,
                range: "(0, 1]",
            });
        }
        Ok(Self {
            span,
            degree: LoessDegree::try_from(degree)?,
        })
    }

    /// Fit `y` on `x`
    ///
    /// ### Params
    ///
    /// * `x` - The predictor variable
    /// * `y` - The response variable
    ///
    /// ### Returns
    ///
    /// The `LoessRes`, aligned with the input.
    pub fn fit(&self, x: &[f64], y: &[f64]) -> LoessRes {
        assert_same_len!(x, y);

        let mut points: Vec<(usize, f64, f64)> = x
            .iter()
            .zip(y)
            .enumerate()
            .filter(|(_, (xi, yi))| xi.is_finite() && yi.is_finite())
            .map(|(i, (&xi, &yi))| (i, xi, yi))
            .collect();
        points.sort_by(|a, b| a.1.total_cmp(&b.1));

        let n_used = points.len();
        let mut fitted_vals = vec![0.0; x.len()];
        let mut residuals = vec![0.0; x.len()];
        if n_used == 0 {
            return LoessRes {
                fitted_vals,
                residuals,
                n_used,
            };
        }

        let window = ((n_used as f64 * self.span) as usize).clamp(1, n_used);
        let xs: Vec<f64> = points.iter().map(|p| p.1).collect();
        let ys: Vec<f64> = points.iter().map(|p| p.2).collect();

        let fits: Vec<f64> = (0..n_used)
            .into_par_iter()
            .map(|i| self.fit_at(&xs, &ys, i, window))
            .collect();

        for ((orig_idx, _, yi), fit) in points.iter().zip(fits) {
            fitted_vals[*orig_idx] = fit;
            residuals[*orig_idx] = yi - fit;
        }

        LoessRes {
            fitted_vals,
            residuals,
            n_used,
        }
    }

    /// Start of the `window` nearest sorted points around position `i`
    fn window_start(xs: &[f64], i: usize, window: usize) -> usize {
        let target = xs[i];
        let mut lo = i.saturating_sub(window - 1);
        let max_lo = xs.len() - window;
        lo = lo.min(max_lo);
        // slide right while the point dropped on the left is farther than
        // the one gained on the right
        while lo < max_lo && lo < i && target - xs[lo] > xs[lo + window] - target {
            lo += 1;
        }
        lo
    }

    /// Local weighted least squares fit at sorted position `i`
    fn fit_at(&self, xs: &[f64], ys: &[f64], i: usize, window: usize) -> f64 {
        let target = xs[i];
        let lo = Self::window_start(xs, i, window);
        let range = lo..lo + window;

        let max_dist = range
            .clone()
            .map(|j| (xs[j] - target).abs())
            .fold(0.0, f64::max);
        if max_dist == 0.0 {
            return ys[range.clone()].iter().sum::<f64>() / window as f64;
        }

        let n_coef = self.degree.n_coef().min(window);
        let mut a = [[0.0; 3]; 3];
        let mut b = [0.0; 3];
        let mut w_sum = 0.0;
        let mut wy_sum = 0.0;

        for j in range {
            let w = tricube((xs[j] - target).abs() / max_dist);
            // centred on the target for numerical stability
            let dx = xs[j] - target;
            let basis = [1.0, dx, dx * dx];
            for r in 0..n_coef {
                for c in 0..n_coef {
                    a[r][c] += w * basis[r] * basis[c];
                }
                b[r] += w * basis[r] * ys[j];
            }
            w_sum += w;
            wy_sum += w * ys[j];
        }

        match solve_small_system(&mut a, &mut b, n_coef) {
            // the intercept is the value at the target
            Some(coef) => coef[0],
            None if w_sum > 0.0 => wy_sum / w_sum,
            None => ys[i],
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_data_is_recovered() {
        let x: Vec<f64> = (0..50).map(|i| i as f64 / 10.0).collect();
        let y: Vec<f64> = x.iter().map(|&v| 2.0 * v + 1.0).collect();

        let loess = LoessRegression::new(0.3, 1).unwrap();
        let res = loess.fit(&x, &y);

        for (fitted, expected) in res.fitted_vals.iter().zip(y.iter()) {
            assert!((fitted - expected).abs() < 1e-8);
        }
        assert_eq!(res.n_used, 50);
    }

    #[test]
    fn test_quadratic_data_is_recovered() {
        let x: Vec<f64> = (0..40).map(|i| i as f64 / 4.0 - 5.0).collect();
        let y: Vec<f64> = x.iter().map(|&v| 0.5 * v * v - v + 2.0).collect();

        let loess = LoessRegression::new(0.5, 2).unwrap();
        let res = loess.fit(&x, &y);

        for (fitted, expected) in res.fitted_vals.iter().zip(y.iter()) {
            assert!((fitted - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_non_finite_points_are_skipped() {
        let x = vec![0.0, 1.0, f64::NAN, 3.0, 4.0];
        let y = vec![0.0, 1.0, 2.0, 3.0, f64::INFINITY];

        let loess = LoessRegression::new(1.0, 2).unwrap();
        let res = loess.fit(&x, &y);

        assert_eq!(res.n_used, 3);
        assert_eq!(res.fitted_vals[2], 0.0);
        assert_eq!(res.residuals[4], 0.0);
    }

    #[test]
    fn test_window_start() {
        let xs = [0.0, 1.0, 2.0, 10.0, 11.0];
        assert_eq!(LoessRegression::window_start(&xs, 0, 3), 0);
        assert_eq!(LoessRegression::window_start(&xs, 4, 3), 2);
        assert_eq!(LoessRegression::window_start(&xs, 1, 2), 0);
        assert_eq!(LoessRegression::window_start(&xs, 3, 2), 3);
    }

    #[test]
    fn test_invalid_params() {
        assert!(LoessRegression::new(0.0, 1).is_err());
        assert!(LoessRegression::new(0.5, 3).is_err());
    }
}
