use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::Normal;
use rayon::prelude::*;

use crate::error::DetectorError;

///////////
// Types //
///////////

/// Type alias for PCA results that keep the gene statistics
///
/// ### Fields
///
/// * `0` - PCA scores
/// * `1` - PCA loadings
/// * `2` - Gene means
/// * `3` - Gene standard deviations
pub type PcaWithStats = (Mat<f32>, Mat<f32>, Vec<f32>, Vec<f32>);

////////////////
// Structures //
////////////////

/// Structure for random SVD results
///
/// ### Fields
///
/// * `v` - Matrix v of the SVD decomposition
/// * `s` - Singular values of the SVD decomposition
#[derive(Clone, Debug)]
pub struct RandomSvdResults<T> {
    pub v: faer::Mat<T>,
    pub s: Vec<T>,
}

///////////////
// Functions //
///////////////

/// Randomised SVD (f32)
///
/// ### Params
///
/// * `x` - The matrix on which to apply the randomised SVD.
/// * `rank` - The target rank of the approximation (number of singular values,
///   vectors to compute).
/// * `seed` - Random seed for reproducible results.
/// * `oversampling` - Additional samples beyond the target rank to improve
///   accuracy. Defaults to 10 if not specified.
/// * `n_power_iter` - Number of power iterations to perform for better
///   approximation quality. Defaults to 2 if not specified.
///
/// ### Returns
///
/// The randomised SVD results in form of `RandomSvdResults`.
///
/// ### Algorithm Details
///
/// 1. Generate a random Gaussian matrix Ω of size n × (rank + oversampling)
/// 2. Compute Y = X * Ω to capture the range of X
/// 3. Orthogonalize Y using QR decomposition to get Q
/// 4. Apply power iterations: Z = X^T * Q, then Q = QR(X * Z)
/// 5. Form B = Q^T * X and compute its SVD
/// 6. Keep V = V_B and S = S_B. U is not formed, only the loadings are used.
pub fn randomised_svd_f32(
    x: MatRef<f32>,
    rank: usize,
    seed: u64,
    oversampling: Option<usize>,
    n_power_iter: Option<usize>,
) -> Result<RandomSvdResults<f32>, DetectorError> {
    let ncol = x.ncols();
    let nrow = x.nrows();

    let os = oversampling.unwrap_or(10);
    let sample_size = (rank + os).min(ncol.min(nrow));
    let n_iter = n_power_iter.unwrap_or(2);

    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0_f32, 1.0).map_err(|e| DetectorError::Svd(e.to_string()))?;
    let omega = Mat::from_fn(ncol, sample_size, |_, _| normal.sample(&mut rng));

    let y = x * omega;

    let mut q = y.qr().compute_thin_Q();
    for _ in 0..n_iter {
        let z = x.transpose() * q;
        q = (x * z).qr().compute_thin_Q();
    }

    let b = q.transpose() * x;
    let svd = b
        .thin_svd()
        .map_err(|e| DetectorError::Svd(format!("{:?}", e)))?;

    Ok(RandomSvdResults {
        v: svd.V().cloned(),
        s: svd.S().column_vector().iter().copied().collect(),
    })
}

/// Calculate mean and (population) standard deviation per column
///
/// ### Params
///
/// * `data` - Matrix with samples in rows and features in columns.
///
/// ### Returns
///
/// Tuple of (means, standard deviations)
pub fn column_stats(data: MatRef<f32>) -> (Vec<f32>, Vec<f32>) {
    let n = data.nrows() as f64;
    let stats: Vec<(f32, f32)> = (0..data.ncols())
        .into_par_iter()
        .map(|j| {
            let mut sum = 0.0_f64;
            let mut sum_sq = 0.0_f64;
            for i in 0..data.nrows() {
                let v = data[(i, j)] as f64;
                sum += v;
                sum_sq += v * v;
            }
            let mean = sum / n;
            let var = (sum_sq / n - mean * mean).max(0.0);
            (mean as f32, var.sqrt() as f32)
        })
        .collect();

    stats.into_iter().unzip()
}

/// Scale a dense matrix with pre-calculated column statistics
///
/// Columns with a standard deviation of zero are only centred.
///
/// ### Params
///
/// * `data` - Matrix with samples in rows and features in columns.
/// * `means` - Mean per column.
/// * `stds` - Standard deviation per column.
/// * `mean_center` - Shall the data be mean-centred.
/// * `normalise_variance` - Shall the data be divided by the standard
///   deviation.
///
/// ### Returns
///
/// The scaled matrix
pub fn scale_with_stats(
    data: MatRef<f32>,
    means: &[f32],
    stds: &[f32],
    mean_center: bool,
    normalise_variance: bool,
) -> Mat<f32> {
    Mat::from_fn(data.nrows(), data.ncols(), |i, j| {
        let mut v = data[(i, j)];
        if mean_center {
            v -= means[j];
        }
        if normalise_variance {
            let sd = if stds[j] > 0.0 { stds[j] } else { 1.0 };
            v /= sd;
        }
        v
    })
}

/// Calculate PCA and return the statistics used for scaling
///
/// The statistics are needed to project further samples (e.g. simulated
/// doublets) into the same PC space.
///
/// ### Params
///
/// * `data` - Normalised data with cells in rows and genes in columns.
/// * `no_pcs` - Number of principal components. Capped at
///   `min(n_rows, n_cols)`.
/// * `random_svd` - Shall randomised SVD be used.
/// * `mean_center` - Shall the data be mean-centred before the SVD.
/// * `normalise_variance` - Shall the data be variance normalised before the
///   SVD.
/// * `seed` - Seed for randomised SVD.
///
/// ### Returns
///
/// A tuple of the samples projected on the PC space, gene loadings, gene means
/// and gene standard deviations.
pub fn pca_with_stats(
    data: MatRef<f32>,
    no_pcs: usize,
    random_svd: bool,
    mean_center: bool,
    normalise_variance: bool,
    seed: u64,
) -> Result<PcaWithStats, DetectorError> {
    let num_genes = data.ncols();
    let no_pcs = no_pcs.min(data.nrows()).min(num_genes).max(1);

    let (means, stds) = column_stats(data);
    let scaled = scale_with_stats(data, &means, &stds, mean_center, normalise_variance);

    let loadings = if random_svd {
        let res = randomised_svd_f32(scaled.as_ref(), no_pcs, seed, Some(100_usize), None)?;
        let available = res.v.ncols().min(no_pcs);
        res.v.submatrix(0, 0, num_genes, available).to_owned()
    } else {
        let res = scaled
            .thin_svd()
            .map_err(|e| DetectorError::Svd(format!("{:?}", e)))?;
        res.V().submatrix(0, 0, num_genes, no_pcs).to_owned()
    };

    let scores = &scaled * &loadings;

    Ok((scores, loadings, means, stds))
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    fn rank_two_data() -> Mat<f32> {
        Mat::from_fn(40, 6, |i, j| {
            let a = (i % 5) as f32;
            let b = (i % 3) as f32;
            match j {
                0 | 1 => a * (j as f32 + 1.0),
                2 | 3 => b * (j as f32 - 1.0),
                _ => a + b,
            }
        })
    }

    #[test]
    fn test_column_stats() {
        let data = Mat::from_fn(4, 2, |i, j| if j == 0 { i as f32 } else { 3.0 });
        let (means, stds) = column_stats(data.as_ref());
        assert!((means[0] - 1.5).abs() < 1e-6);
        assert!((stds[0] - 1.25_f32.sqrt()).abs() < 1e-6);
        assert_eq!(means[1], 3.0);
        assert_eq!(stds[1], 0.0);
    }

    #[test]
    fn test_scale_zero_sd_only_centres() {
        let data = Mat::from_fn(3, 1, |_, _| 2.0_f32);
        let scaled = scale_with_stats(data.as_ref(), &[2.0], &[0.0], true, true);
        for i in 0..3 {
            assert_eq!(scaled[(i, 0)], 0.0);
        }
    }

    #[test]
    fn test_pca_caps_components() {
        let data = rank_two_data();
        let (scores, loadings, means, stds) =
            pca_with_stats(data.as_ref(), 30, false, true, true, 42).unwrap();
        assert_eq!(scores.nrows(), 40);
        assert_eq!(scores.ncols(), 6);
        assert_eq!(loadings.nrows(), 6);
        assert_eq!(means.len(), 6);
        assert_eq!(stds.len(), 6);
    }

    #[test]
    fn test_random_svd_matches_exact_leading_value() {
        let data = rank_two_data();
        let exact = data.thin_svd().unwrap();
        let exact_s0 = exact.S().column_vector().iter().copied().next().unwrap();
        let random = randomised_svd_f32(data.as_ref(), 2, 1, None, None).unwrap();
        assert!((random.s[0] - exact_s0).abs() / exact_s0 < 1e-3);
    }

    #[test]
    fn test_random_svd_deterministic() {
        let data = rank_two_data();
        let a = randomised_svd_f32(data.as_ref(), 2, 7, None, None).unwrap();
        let b = randomised_svd_f32(data.as_ref(), 2, 7, None, None).unwrap();
        assert_eq!(a.s, b.s);
        assert_eq!(a.v.nrows(), data.ncols());
        assert_eq!(a.v.ncols(), a.s.len());
    }
}
