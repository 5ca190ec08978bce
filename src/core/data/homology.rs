use faer::{Mat, MatRef};
use rustc_hash::FxHashMap;

use crate::core::data::dataset::{GeneNaming, SpeciesDataset};
use crate::error::{AlignError, AlignResult};

////////////////
// Structures //
////////////////

/// Gene correspondences between a context and a target species
///
/// Pairs are `(context_gene, target_gene)` column indices. Several context
/// genes may map onto the same target gene; in the shared feature space
/// these get summed. The shared space is ordered by the first appearance of
/// each target gene.
///
/// ### Fields
///
/// * `pairs` - The raw index pairs
/// * `target_genes` - Distinct target genes, defining the shared features
/// * `context_groups` - Per shared feature the context genes feeding it
#[derive(Clone, Debug)]
pub struct HomologyMap {
    pairs: Vec<(usize, usize)>,
    target_genes: Vec<usize>,
    context_groups: Vec<Vec<usize>>,
}

impl HomologyMap {
    /// Build a homology map from index pairs
    ///
    /// ### Params
    ///
    /// * `pairs` - `(context_gene, target_gene)` pairs
    /// * `n_context_genes` - Gene count of the context species
    /// * `n_target_genes` - Gene count of the target species
    ///
    /// ### Returns
    ///
    /// The map, or an error for out of range indices. An empty pair list is
    /// allowed here and rejected when the alignment run is assembled.
    pub fn new(
        pairs: Vec<(usize, usize)>,
        n_context_genes: usize,
        n_target_genes: usize,
    ) -> AlignResult<Self> {
        for &(c, t) in &pairs {
            if c >= n_context_genes || t >= n_target_genes {
                return Err(AlignError::data(format!(
                    "Homology pair ({}, {}) out of range for {} context / {} target genes",
                    c, t, n_context_genes, n_target_genes
                )));
            }
        }

        let mut feature_of: FxHashMap<usize, usize> = FxHashMap::default();
        let mut target_genes = Vec::new();
        let mut context_groups: Vec<Vec<usize>> = Vec::new();
        for &(c, t) in &pairs {
            let feature = *feature_of.entry(t).or_insert_with(|| {
                target_genes.push(t);
                context_groups.push(Vec::new());
                target_genes.len() - 1
            });
            if !context_groups[feature].contains(&c) {
                context_groups[feature].push(c);
            }
        }

        Ok(Self {
            pairs,
            target_genes,
            context_groups,
        })
    }

    /// Resolve a name based homology table against two gene lists
    ///
    /// Table rows whose genes are missing from either species are ignored.
    ///
    /// ### Params
    ///
    /// * `context` - The context species
    /// * `target` - The target species
    /// * `table` - `(context_gene_name, target_gene_name)` rows
    /// * `table_naming` - Naming convention used in the table
    ///
    /// ### Returns
    ///
    /// The resolved map, or a `Config` error if naming conventions disagree.
    pub fn from_gene_table(
        context: &SpeciesDataset,
        target: &SpeciesDataset,
        table: &[(String, String)],
        table_naming: GeneNaming,
    ) -> AlignResult<Self> {
        if context.gene_naming() != table_naming || target.gene_naming() != table_naming {
            return Err(AlignError::config(format!(
                "Homology table uses {:?} names but '{}' uses {:?} and '{}' uses {:?}",
                table_naming,
                context.name(),
                context.gene_naming(),
                target.name(),
                target.gene_naming()
            )));
        }

        let ctx_index: FxHashMap<&str, usize> = context
            .genes()
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect();
        let tgt_index: FxHashMap<&str, usize> = target
            .genes()
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect();

        let pairs = table
            .iter()
            .filter_map(|(c, t)| {
                let ci = ctx_index.get(c.as_str())?;
                let ti = tgt_index.get(t.as_str())?;
                Some((*ci, *ti))
            })
            .collect();

        Self::new(pairs, context.n_genes(), target.n_genes())
    }

    pub fn pairs(&self) -> &[(usize, usize)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of features of the shared subspace
    pub fn n_shared(&self) -> usize {
        self.target_genes.len()
    }

    /// Target gene of every shared feature
    pub fn target_genes(&self) -> &[usize] {
        &self.target_genes
    }

    /// Context genes of every shared feature
    pub fn context_groups(&self) -> &[Vec<usize>] {
        &self.context_groups
    }

    /// Re-index the map after gene filtering of one or both species
    ///
    /// ### Params
    ///
    /// * `context_kept` - Kept original context gene indices
    /// * `target_kept` - Kept original target gene indices
    ///
    /// ### Returns
    ///
    /// A map over the filtered gene indices; pairs touching removed genes
    /// are dropped.
    pub fn remap(&self, context_kept: &[usize], target_kept: &[usize]) -> AlignResult<Self> {
        let ctx_new: FxHashMap<usize, usize> = context_kept
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();
        let tgt_new: FxHashMap<usize, usize> = target_kept
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();

        let pairs = self
            .pairs
            .iter()
            .filter_map(|(c, t)| Some((*ctx_new.get(c)?, *tgt_new.get(t)?)))
            .collect();

        Self::new(pairs, context_kept.len(), target_kept.len())
    }

    /// Project context data onto the shared subspace
    ///
    /// ### Params
    ///
    /// * `counts` - Context cells x context genes
    ///
    /// ### Returns
    ///
    /// Cells x shared features; grouped context genes are summed.
    pub fn project_context(&self, counts: MatRef<f32>) -> Mat<f32> {
        Mat::from_fn(counts.nrows(), self.n_shared(), |i, f| {
            self.context_groups[f]
                .iter()
                .map(|&g| counts[(i, g)])
                .sum()
        })
    }

    /// Project target data onto the shared subspace
    ///
    /// ### Params
    ///
    /// * `counts` - Target cells x target genes
    ///
    /// ### Returns
    ///
    /// Cells x shared features.
    pub fn project_target(&self, counts: MatRef<f32>) -> Mat<f32> {
        Mat::from_fn(counts.nrows(), self.n_shared(), |i, f| {
            counts[(i, self.target_genes[f])]
        })
    }
}

///////////
// Tests //
///////////
