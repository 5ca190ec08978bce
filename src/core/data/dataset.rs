use faer::{Mat, MatRef};
use rustc_hash::FxHashMap;

use crate::core::base::utils::row_sums;
use crate::error::{AlignError, AlignResult};
use crate::utils::general::{mean_var, select_cols, select_rows};

///////////
// Enums //
///////////

/// Gene naming convention of a species gene list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneNaming {
    /// Gene symbols, e.g. `Cd74`
    Symbol,
    /// Ensembl identifiers, e.g. `ENSMUSG00000024610`
    Ensembl,
}

/// Helper function to parse the gene naming convention
///
/// ### Params
///
/// * `s` - String to parse
///
/// ### Returns
///
/// Option of the `GeneNaming`
pub fn parse_gene_naming(s: &str) -> Option<GeneNaming> {
    match s.to_lowercase().as_str() {
        "symbol" | "gene_symbol" => Some(GeneNaming::Symbol),
        "ensembl" | "ensembl_id" => Some(GeneNaming::Ensembl),
        _ => None,
    }
}

////////////////
// Structures //
////////////////

/// A categorical per-cell annotation
///
/// ### Fields
///
/// * `key` - Name of the column, e.g. `cell_type_coarse`
/// * `categories` - The distinct values in order of first appearance
/// * `codes` - Per cell index into `categories`
#[derive(Clone, Debug, PartialEq)]
pub struct LabelColumn {
    pub key: String,
    pub categories: Vec<String>,
    pub codes: Vec<usize>,
}

impl LabelColumn {
    /// Encode a column of string values
    ///
    /// ### Params
    ///
    /// * `key` - Name of the column
    /// * `values` - One value per cell
    ///
    /// ### Returns
    ///
    /// The encoded `LabelColumn`
    pub fn from_values<S: AsRef<str>>(key: &str, values: &[S]) -> Self {
        let mut lookup: FxHashMap<String, usize> = FxHashMap::default();
        let mut categories = Vec::new();
        let codes = values
            .iter()
            .map(|v| {
                let v = v.as_ref();
                match lookup.get(v) {
                    Some(&code) => code,
                    None => {
                        let code = categories.len();
                        categories.push(v.to_string());
                        lookup.insert(v.to_string(), code);
                        code
                    }
                }
            })
            .collect();

        Self {
            key: key.to_string(),
            categories,
            codes,
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn n_categories(&self) -> usize {
        self.categories.len()
    }

    /// Label of one cell
    pub fn value(&self, cell: usize) -> &str {
        &self.categories[self.codes[cell]]
    }

    /// Code of a category name, if present
    pub fn code_of(&self, category: &str) -> Option<usize> {
        self.categories.iter().position(|c| c == category)
    }

    /// Subset to the given cells
    ///
    /// The category list is kept as is, so codes stay comparable between a
    /// dataset and its subsets (e.g. batch one-hot encodings).
    pub fn subset(&self, cells: &[usize]) -> Self {
        Self {
            key: self.key.clone(),
            categories: self.categories.clone(),
            codes: cells.iter().map(|&c| self.codes[c]).collect(),
        }
    }
}

/// One species' expression data
///
/// Immutable after construction. Rows are cells, columns are genes.
///
/// ### Fields
///
/// * `name` - Species name, e.g. `mouse`
/// * `genes` - Gene names, one per column
/// * `gene_naming` - Naming convention of `genes`
/// * `counts` - Cells x genes count matrix (non-negative)
/// * `batch` - Batch annotation per cell
/// * `labels` - Optional cell type annotations (any granularity)
/// * `library_sizes` - Per cell sum of counts
#[derive(Clone, Debug)]
pub struct SpeciesDataset {
    name: String,
    genes: Vec<String>,
    gene_naming: GeneNaming,
    counts: Mat<f32>,
    batch: LabelColumn,
    labels: Vec<LabelColumn>,
    library_sizes: Vec<f32>,
}

impl SpeciesDataset {
    /// Validate and assemble a dataset
    ///
    /// ### Params
    ///
    /// * `name` - Species name
    /// * `genes` - Gene names (one per column of `counts`)
    /// * `gene_naming` - Naming convention of the genes
    /// * `counts` - Cells x genes count matrix
    /// * `batch` - Batch annotation per cell
    /// * `labels` - Cell type annotation columns
    ///
    /// ### Returns
    ///
    /// The dataset or a `DataMismatch` / `Config` error.
    pub fn new(
        name: &str,
        genes: Vec<String>,
        gene_naming: GeneNaming,
        counts: Mat<f32>,
        batch: LabelColumn,
        labels: Vec<LabelColumn>,
    ) -> AlignResult<Self> {
        let (n_cells, n_genes) = counts.shape();

        if n_cells == 0 || n_genes == 0 {
            return Err(AlignError::data(format!(
                "Species '{}' has an empty count matrix ({} x {})",
                name, n_cells, n_genes
            )));
        }
        if genes.len() != n_genes {
            return Err(AlignError::data(format!(
                "Species '{}': {} gene names for {} count columns",
                name,
                genes.len(),
                n_genes
            )));
        }
        if batch.len() != n_cells {
            return Err(AlignError::data(format!(
                "Species '{}': batch column has {} entries for {} cells",
                name,
                batch.len(),
                n_cells
            )));
        }
        for col in &labels {
            if col.len() != n_cells {
                return Err(AlignError::data(format!(
                    "Species '{}': label column '{}' has {} entries for {} cells",
                    name,
                    col.key,
                    col.len(),
                    n_cells
                )));
            }
        }
        for j in 0..n_genes {
            for i in 0..n_cells {
                let v = counts[(i, j)];
                if !v.is_finite() || v < 0.0 {
                    return Err(AlignError::data(format!(
                        "Species '{}': invalid count {} at cell {}, gene {}",
                        name, v, i, j
                    )));
                }
            }
        }

        let library_sizes = row_sums(counts.as_ref());

        Ok(Self {
            name: name.to_string(),
            genes,
            gene_naming,
            counts,
            batch,
            labels,
            library_sizes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn gene_naming(&self) -> GeneNaming {
        self.gene_naming
    }

    pub fn counts(&self) -> MatRef<'_, f32> {
        self.counts.as_ref()
    }

    pub fn n_cells(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.ncols()
    }

    pub fn batch(&self) -> &LabelColumn {
        &self.batch
    }

    pub fn batch_codes(&self) -> &[usize] {
        &self.batch.codes
    }

    pub fn n_batches(&self) -> usize {
        self.batch.n_categories()
    }

    pub fn library_sizes(&self) -> &[f32] {
        &self.library_sizes
    }

    pub fn labels(&self) -> &[LabelColumn] {
        &self.labels
    }

    /// Label column by key
    pub fn label(&self, key: &str) -> Option<&LabelColumn> {
        self.labels.iter().find(|col| col.key == key)
    }

    /// Label column by key, failing with `MissingLabelKey`
    pub fn require_label(&self, key: &str) -> AlignResult<&LabelColumn> {
        self.label(key).ok_or_else(|| AlignError::MissingLabelKey {
            species: self.name.clone(),
            key: key.to_string(),
        })
    }

    /// Empirical mean and variance of the log library size per batch
    ///
    /// These parameterise the log-normal prior on the library size. Cells
    /// with zero counts are left out; batches without any usable cell fall
    /// back to `(0, 1)`.
    ///
    /// ### Returns
    ///
    /// Vector of `(mean, variance)` per batch.
    pub fn log_library_stats(&self) -> Vec<(f32, f32)> {
        let mut per_batch: Vec<Vec<f32>> = vec![Vec::new(); self.n_batches()];
        for (cell, &lib) in self.library_sizes.iter().enumerate() {
            if lib > 0.0 {
                per_batch[self.batch.codes[cell]].push(lib.ln());
            }
        }
        per_batch
            .iter()
            .map(|vals| {
                if vals.is_empty() {
                    (0.0, 1.0)
                } else {
                    let (mean, var) = mean_var(vals);
                    (mean, var.max(1e-4))
                }
            })
            .collect()
    }

    /// Restrict the dataset to a subset of cells
    ///
    /// ### Params
    ///
    /// * `cells` - Row indices to keep (in the given order)
    ///
    /// ### Returns
    ///
    /// The new dataset. Batch and label categories are preserved.
    pub fn subset_cells(&self, cells: &[usize]) -> AlignResult<Self> {
        if let Some(&bad) = cells.iter().find(|&&c| c >= self.n_cells()) {
            return Err(AlignError::data(format!(
                "Cell index {} out of range for species '{}' ({} cells)",
                bad,
                self.name,
                self.n_cells()
            )));
        }
        Self::new(
            &self.name,
            self.genes.clone(),
            self.gene_naming,
            select_rows(self.counts.as_ref(), cells),
            self.batch.subset(cells),
            self.labels.iter().map(|col| col.subset(cells)).collect(),
        )
    }

    /// Keep genes that are expressed in at least a fraction of the cells
    ///
    /// ### Params
    ///
    /// * `min_expression_fraction` - Minimum fraction of cells with a count
    ///   above zero.
    ///
    /// ### Returns
    ///
    /// Tuple of the filtered dataset and the kept original gene indices.
    pub fn filter_genes(&self, min_expression_fraction: f32) -> AlignResult<(Self, Vec<usize>)> {
        let n_cells = self.n_cells() as f32;
        let kept: Vec<usize> = (0..self.n_genes())
            .filter(|&j| {
                let expressed = (0..self.n_cells())
                    .filter(|&i| self.counts[(i, j)] > 0.0)
                    .count();
                expressed as f32 / n_cells >= min_expression_fraction
            })
            .collect();

        let genes = kept.iter().map(|&j| self.genes[j].clone()).collect();
        let filtered = Self::new(
            &self.name,
            genes,
            self.gene_naming,
            select_cols(self.counts.as_ref(), &kept),
            self.batch.clone(),
            self.labels.clone(),
        )?;

        Ok((filtered, kept))
    }
}

///////////
// Tests //
///////////
