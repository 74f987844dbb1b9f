//! Preprocessing of raw count matrices shared by the doublet detectors:
//! gene filtering, library size normalisation and the identification of
//! highly variable genes.

use faer::{Mat, MatRef};
use rayon::prelude::*;

use crate::core::base::loess::LoessRegression;
use crate::error::{ConfigError, DetectorError};

///////////
// Enums //
///////////

/// Enum for the different methods
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HvgMethod {
    /// Variance stabilising transformation
    Vst,
    /// Dispersion (variance over mean) on the normalised counts
    Dispersion,
}

/// Helper function to get the HVG Method
///
/// ### Params
///
/// * `s` - Type of HVG calculation to do
///
/// ### Returns
///
/// The `HvgMethod` or a `ConfigError` for unknown methods
pub fn parse_hvg_method(s: &str) -> Result<HvgMethod, ConfigError> {
    match s.to_lowercase().as_str() {
        "vst" => Ok(HvgMethod::Vst),
        "dispersion" => Ok(HvgMethod::Dispersion),
        _ => Err(ConfigError::InvalidOption {
            name: "hvg_method",
            value: s.to_string(),
        }),
    }
}

////////////////
// Structures //
////////////////

/// Structure for the HVG results
///
/// ### Fields
///
/// * `mean` - The mean per gene.
/// * `var` - The variance per gene.
/// * `var_exp` - The expected variance per gene (VST only).
/// * `var_std` - The standardised variance, i.e. the variability measure
///   that is used for ranking.
#[derive(Clone, Debug)]
pub struct HvgRes {
    pub mean: Vec<f64>,
    pub var: Vec<f64>,
    pub var_exp: Vec<f64>,
    pub var_std: Vec<f64>,
}

/////////////
// Helpers //
/////////////

/// Mean and unbiased variance of one column restricted to some rows
fn gene_mean_var(counts: MatRef<f32>, cells: &[usize], gene: usize) -> (f64, f64) {
    let n = cells.len() as f64;
    let mean = cells.iter().map(|&c| counts[(c, gene)] as f64).sum::<f64>() / n;
    let var = if cells.len() > 1 {
        cells
            .iter()
            .map(|&c| (counts[(c, gene)] as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0)
    } else {
        0.0
    };
    (mean, var)
}

///////////////
// Filtering //
///////////////

/// Library size (total counts) per cell
///
/// ### Params
///
/// * `counts` - Raw counts with cells in rows and genes in columns.
///
/// ### Returns
///
/// The library size for each cell
pub fn library_sizes(counts: MatRef<f32>) -> Vec<f32> {
    (0..counts.nrows())
        .into_par_iter()
        .map(|i| (0..counts.ncols()).map(|j| counts[(i, j)]).sum())
        .collect()
}

/// Keep genes that reach a minimum count in a minimum number of cells
///
/// ### Params
///
/// * `counts` - Raw counts with cells in rows and genes in columns.
/// * `min_counts` - Minimum UMI count for a cell to count as expressing the
///   gene.
/// * `min_cells` - Minimum number of cells that need to express the gene.
///
/// ### Returns
///
/// The indices of the genes that pass, in ascending order.
pub fn filter_genes(counts: MatRef<f32>, min_counts: f32, min_cells: usize) -> Vec<usize> {
    (0..counts.ncols())
        .into_par_iter()
        .filter(|&j| {
            let expressing = (0..counts.nrows())
                .filter(|&i| counts[(i, j)] >= min_counts && counts[(i, j)] > 0.0)
                .count();
            expressing >= min_cells
        })
        .collect()
}

///////////////////
// Normalisation //
///////////////////

/// Normalise a single value to the target library size
///
/// ### Params
///
/// * `count` - Raw count.
/// * `lib_size` - Library size of the cell.
/// * `target_size` - Target library size.
/// * `log_transform` - Apply `ln(1 + x)` after the scaling.
#[inline]
pub fn normalise_value(count: f32, lib_size: f32, target_size: f32, log_transform: bool) -> f32 {
    let scaled = if lib_size > 0.0 {
        count * target_size / lib_size
    } else {
        0.0
    };
    if log_transform {
        scaled.ln_1p()
    } else {
        scaled
    }
}

/// Library size normalisation of a subset of the count matrix
///
/// ### Params
///
/// * `counts` - Raw counts with cells in rows and genes in columns.
/// * `genes` - Column indices to keep.
/// * `lib_sizes` - Library size for every row of `counts`.
/// * `target_size` - Target library size.
/// * `log_transform` - Apply `ln(1 + x)` after the scaling.
///
/// ### Returns
///
/// Dense matrix of shape `n_cells x genes.len()`
pub fn normalise_subset(
    counts: MatRef<f32>,
    genes: &[usize],
    lib_sizes: &[f32],
    target_size: f32,
    log_transform: bool,
) -> Mat<f32> {
    Mat::from_fn(counts.nrows(), genes.len(), |i, j| {
        normalise_value(
            counts[(i, genes[j])],
            lib_sizes[i],
            target_size,
            log_transform,
        )
    })
}

/// Mean library size, used as the default target size
pub fn mean_library_size(lib_sizes: &[f32]) -> f32 {
    if lib_sizes.is_empty() {
        return 0.0;
    }
    lib_sizes.iter().map(|&x| x as f64).sum::<f64>() as f32 / lib_sizes.len() as f32
}

/////////
// HVG //
/////////

/// Calculate the standardised variance per gene with the VST approach
///
/// A loess regression of `log10(var)` on `log10(mean)` gives the expected
/// variance per gene. Values are standardised with the expected variance,
/// clipped at `clip_max` and the variance of the standardised values is used
/// for ranking.
///
/// ### Params
///
/// * `counts` - Raw counts with cells in rows and genes in columns.
/// * `genes` - The genes to consider.
/// * `loess_span` - Span of the loess regression.
/// * `clip_max` - Optional clipping value. Defaults to `sqrt(n_cells)`.
///
/// ### Returns
///
/// The `HvgRes`, aligned with `genes`.
pub fn get_hvg_vst(
    counts: MatRef<f32>,
    genes: &[usize],
    loess_span: f64,
    clip_max: Option<f32>,
) -> Result<HvgRes, ConfigError> {
    let cells: Vec<usize> = (0..counts.nrows()).collect();
    let n_cells = cells.len() as f64;
    let clip_max = clip_max.map(|c| c as f64).unwrap_or(n_cells.sqrt());

    let (mean, var): (Vec<f64>, Vec<f64>) = genes
        .par_iter()
        .map(|&g| gene_mean_var(counts, &cells, g))
        .unzip();

    let log_mean: Vec<f64> = mean.iter().map(|m| m.log10()).collect();
    let log_var: Vec<f64> = var.iter().map(|v| v.log10()).collect();

    let loess = LoessRegression::new(loess_span, 2)?;
    let fit = loess.fit(&log_mean, &log_var);

    let var_exp: Vec<f64> = fit.fitted_vals.iter().map(|f| 10_f64.powf(*f)).collect();

    let var_std: Vec<f64> = genes
        .par_iter()
        .enumerate()
        .map(|(idx, &g)| {
            if var[idx] <= 0.0 || var_exp[idx] <= 0.0 || cells.len() < 2 {
                return 0.0;
            }
            let sd_exp = var_exp[idx].sqrt();
            let m = mean[idx];
            let (sum, sum_sq) = cells.iter().fold((0.0, 0.0), |(s, sq), &c| {
                let z = ((counts[(c, g)] as f64 - m) / sd_exp).min(clip_max);
                (s + z, sq + z * z)
            });
            ((sum_sq - sum * sum / n_cells) / (n_cells - 1.0)).max(0.0)
        })
        .collect();

    Ok(HvgRes {
        mean,
        var,
        var_exp,
        var_std,
    })
}

/// Calculate the dispersion (variance over mean) per gene
///
/// ### Params
///
/// * `normalised` - Normalised data with cells in rows and the genes of
///   interest in columns.
///
/// ### Returns
///
/// The `HvgRes`, aligned with the columns of `normalised`.
pub fn get_hvg_dispersion(normalised: MatRef<f32>) -> HvgRes {
    let cells: Vec<usize> = (0..normalised.nrows()).collect();

    let (mean, var): (Vec<f64>, Vec<f64>) = (0..normalised.ncols())
        .into_par_iter()
        .map(|g| gene_mean_var(normalised, &cells, g))
        .unzip();

    let var_std: Vec<f64> = mean
        .iter()
        .zip(var.iter())
        .map(|(&m, &v)| if m > 0.0 { v / m } else { 0.0 })
        .collect();

    HvgRes {
        var_exp: vec![0.0; mean.len()],
        mean,
        var,
        var_std,
    }
}

/// Select the highly variable genes based on a percentile threshold
///
/// ### Params
///
/// * `var_std` - The variability measure per gene.
/// * `min_gene_var_pctl` - Percentile (0 to 100). Genes in the top
///   `100 - min_gene_var_pctl` percent are kept, at least one gene.
///
/// ### Returns
///
/// Positions into `var_std` of the selected genes, in ascending order.
pub fn select_hvg(var_std: &[f64], min_gene_var_pctl: f32) -> Vec<usize> {
    let n_genes = var_std.len();
    if n_genes == 0 {
        return Vec::new();
    }

    let keep_frac = (1.0 - min_gene_var_pctl as f64 / 100.0).clamp(0.0, 1.0);
    let n_genes_to_take = ((n_genes as f64 * keep_frac).ceil() as usize).clamp(1, n_genes);

    let mut indices: Vec<(usize, f64)> = var_std.iter().copied().enumerate().collect();
    indices.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    indices.truncate(n_genes_to_take);

    let mut result: Vec<usize> = indices.into_iter().map(|(i, _)| i).collect();
    result.sort_unstable();
    result
}

/// Run the HVG detection of choice and select the genes
///
/// ### Params
///
/// * `counts` - Raw counts with cells in rows and genes in columns.
/// * `genes` - Candidate genes (after filtering).
/// * `lib_sizes` - Library size per cell.
/// * `target_size` - Target library size for normalisation.
/// * `hvg_method` - The `HvgMethod`.
/// * `loess_span` - Span for the VST loess fit.
/// * `min_gene_var_pctl` - Percentile threshold (0 to 100).
///
/// ### Returns
///
/// Column indices into `counts` of the highly variable genes.
#[allow(clippy::too_many_arguments)]
pub fn highly_variable_genes(
    counts: MatRef<f32>,
    genes: &[usize],
    lib_sizes: &[f32],
    target_size: f32,
    hvg_method: HvgMethod,
    loess_span: f64,
    min_gene_var_pctl: f32,
) -> Result<Vec<usize>, DetectorError> {
    let hvg_res = match hvg_method {
        HvgMethod::Vst => get_hvg_vst(counts, genes, loess_span, None)?,
        HvgMethod::Dispersion => {
            let normalised = normalise_subset(counts, genes, lib_sizes, target_size, false);
            get_hvg_dispersion(normalised.as_ref())
        }
    };

    Ok(select_hvg(&hvg_res.var_std, min_gene_var_pctl)
        .into_iter()
        .map(|pos| genes[pos])
        .collect())
}

///////////
// Tests //
///////////
