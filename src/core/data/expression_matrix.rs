use faer::{Mat, MatRef};
use rustc_hash::FxHashSet;

use crate::error::InputError;
use crate::single_cell::processing::library_sizes;

/// Dense gene expression matrix with labelled rows (cells) and columns
/// (genes)
///
/// ### Fields
///
/// * `cell_ids` - Unique cell identifiers, one per row.
/// * `gene_ids` - Unique gene identifiers, one per column.
/// * `counts` - Non-negative, finite values of shape `n_cells x n_genes`.
#[derive(Clone, Debug)]
pub struct ExpressionMatrix {
    cell_ids: Vec<String>,
    gene_ids: Vec<String>,
    counts: Mat<f32>,
}

/// Returns the first duplicated label, if any
pub(crate) fn first_duplicate(labels: &[String]) -> Option<&String> {
    let mut seen: FxHashSet<&String> = FxHashSet::default();
    labels.iter().find(|label| !seen.insert(*label))
}

impl ExpressionMatrix {
    /// Generate a new, validated expression matrix
    ///
    /// ### Params
    ///
    /// * `cell_ids` - Row labels.
    /// * `gene_ids` - Column labels.
    /// * `counts` - The values with cells in rows and genes in columns.
    ///
    /// ### Returns
    ///
    /// The matrix or an `InputError::Shape` if dimensions, labels or values
    /// are invalid.
    pub fn new(
        cell_ids: Vec<String>,
        gene_ids: Vec<String>,
        counts: Mat<f32>,
    ) -> Result<Self, InputError> {
        if counts.nrows() != cell_ids.len() || counts.ncols() != gene_ids.len() {
            return Err(InputError::Shape(format!(
                "{} x {} values for {} cells and {} genes",
                counts.nrows(),
                counts.ncols(),
                cell_ids.len(),
                gene_ids.len()
            )));
        }
        if let Some(dup) = first_duplicate(&cell_ids) {
            return Err(InputError::Shape(format!("duplicated cell id {:?}", dup)));
        }
        if let Some(dup) = first_duplicate(&gene_ids) {
            return Err(InputError::Shape(format!("duplicated gene id {:?}", dup)));
        }
        for j in 0..counts.ncols() {
            for i in 0..counts.nrows() {
                let v = counts[(i, j)];
                if !v.is_finite() || v < 0.0 {
                    return Err(InputError::Shape(format!(
                        "invalid value {} for cell {:?} and gene {:?}",
                        v, cell_ids[i], gene_ids[j]
                    )));
                }
            }
        }

        Ok(Self {
            cell_ids,
            gene_ids,
            counts,
        })
    }

    /// Generate a matrix from row-major values with generated labels
    ///
    /// Cells are labelled `cell_{i}` and genes `gene_{j}`. Mostly useful for
    /// synthetic data.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self, InputError> {
        let n_cells = rows.len();
        let n_genes = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != n_genes) {
            return Err(InputError::Shape("rows of unequal length".to_string()));
        }
        let counts = Mat::from_fn(n_cells, n_genes, |i, j| rows[i][j]);
        Self::new(
            (0..n_cells).map(|i| format!("cell_{}", i)).collect(),
            (0..n_genes).map(|j| format!("gene_{}", j)).collect(),
            counts,
        )
    }

    /// Number of cells (rows)
    pub fn n_cells(&self) -> usize {
        self.cell_ids.len()
    }

    /// Number of genes (columns)
    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    /// View of the values, cells in rows and genes in columns
    pub fn counts(&self) -> MatRef<'_, f32> {
        self.counts.as_ref()
    }

    /// Total counts per cell
    pub fn library_sizes(&self) -> Vec<f32> {
        library_sizes(self.counts())
    }

    /// Number of cells with a non-zero value per gene
    pub fn genes_detected(&self) -> Vec<usize> {
        (0..self.n_genes())
            .map(|j| {
                (0..self.n_cells())
                    .filter(|&i| self.counts[(i, j)] > 0.0)
                    .count()
            })
            .collect()
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let matrix =
            ExpressionMatrix::from_rows(&[vec![1.0, 0.0], vec![2.0, 3.0], vec![0.0, 0.0]])
                .unwrap();
        assert_eq!(matrix.n_cells(), 3);
        assert_eq!(matrix.n_genes(), 2);
        assert_eq!(matrix.cell_ids()[1], "cell_1");
        assert_eq!(matrix.library_sizes(), vec![1.0, 5.0, 0.0]);
        assert_eq!(matrix.genes_detected(), vec![2, 1]);
    }

    #[test]
    fn test_invalid_matrices() {
        assert!(ExpressionMatrix::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(ExpressionMatrix::from_rows(&[vec![-1.0]]).is_err());
        assert!(ExpressionMatrix::from_rows(&[vec![f32::NAN]]).is_err());

        let dup = ExpressionMatrix::new(
            vec!["a".to_string(), "a".to_string()],
            vec!["g".to_string()],
            Mat::zeros(2, 1),
        );
        assert!(matches!(dup, Err(InputError::Shape(_))));
    }
}
