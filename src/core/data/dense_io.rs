//! Reader for delimited text files with a header row of gene identifiers
//! and a first column of cell identifiers.

use csv::{ReaderBuilder, Trim};
use faer::Mat;
use log::{debug, info};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;

use crate::core::data::expression_matrix::{first_duplicate, ExpressionMatrix};
use crate::error::InputError;

////////////
// Params //
////////////

/// Parameters for reading delimited expression files
///
/// ### Fields
///
/// * `delimiter` - Field delimiter, `b','` for CSV or `b'\t'` for TSV.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CsvReadParams {
    pub delimiter: u8,
}

impl Default for CsvReadParams {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

//////////
// Main //
//////////

/// Read a cells x genes expression matrix from a delimited text file
///
/// ### Params
///
/// * `path` - Path to the file. The header holds the gene identifiers
///   (its first field labels the index column and is ignored), the first
///   field of every record is the cell identifier.
/// * `params` - The `CsvReadParams`.
///
/// ### Returns
///
/// The `ExpressionMatrix` or an `InputError` describing the first problem
/// found.
pub fn read_expression_csv(
    path: &Path,
    params: &CsvReadParams,
) -> Result<ExpressionMatrix, InputError> {
    let start_reading = Instant::now();

    let file = File::open(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut reader = ReaderBuilder::new()
        .delimiter(params.delimiter)
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(BufReader::new(file));

    let csv_err = |source: csv::Error| InputError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let header = reader.headers().map_err(csv_err)?.clone();
    if header.is_empty() {
        return Err(InputError::Empty {
            path: path.to_path_buf(),
            details: "no header row".to_string(),
        });
    }
    let gene_ids: Vec<String> = header.iter().skip(1).map(|s| s.to_string()).collect();
    if gene_ids.is_empty() {
        return Err(InputError::Empty {
            path: path.to_path_buf(),
            details: "no gene columns in the header".to_string(),
        });
    }
    let n_fields = header.len();

    let mut cell_ids: Vec<String> = Vec::new();
    let mut values: Vec<f32> = Vec::new();

    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if record.len() != n_fields {
            return Err(InputError::HeaderMismatch {
                path: path.to_path_buf(),
                line,
                expected: n_fields,
                found: record.len(),
            });
        }

        cell_ids.push(record[0].to_string());

        for (column, field) in record.iter().enumerate().skip(1) {
            let value: f32 = match field.parse::<f32>() {
                Ok(v) if v.is_finite() => v,
                _ => {
                    return Err(InputError::Parse {
                        path: path.to_path_buf(),
                        line,
                        column: column + 1,
                        value: field.to_string(),
                    })
                }
            };
            if value < 0.0 {
                return Err(InputError::NegativeValue {
                    path: path.to_path_buf(),
                    line,
                    column: column + 1,
                });
            }
            values.push(value);
        }
    }

    if cell_ids.is_empty() {
        return Err(InputError::Empty {
            path: path.to_path_buf(),
            details: "no data rows".to_string(),
        });
    }

    for (kind, labels) in [("cell", &cell_ids), ("gene", &gene_ids)] {
        if let Some(dup) = first_duplicate(labels) {
            return Err(InputError::DuplicateLabel {
                path: path.to_path_buf(),
                kind,
                label: dup.clone(),
            });
        }
    }

    let n_cells = cell_ids.len();
    let n_genes = gene_ids.len();
    debug!("Parsed {} values from {:?}", values.len(), path);

    let counts = Mat::from_fn(n_cells, n_genes, |i, j| values[i * n_genes + j]);
    let matrix = ExpressionMatrix::new(cell_ids, gene_ids, counts)?;

    info!(
        "Loaded {} cells x {} genes from {:?} in {:.2?}",
        n_cells,
        n_genes,
        path,
        start_reading.elapsed()
    );

    Ok(matrix)
}

///////////
// Tests //
///////////
