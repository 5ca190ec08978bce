use std::cmp::Ordering;

use crate::core::base::utils::{log_normalise_rows, row_sums};
use crate::core::data::dataset::SpeciesDataset;
use crate::core::data::homology::HomologyMap;
use crate::core::graph::knn::{knn_cross, KnnMetric};
use crate::error::{AlignError, AlignResult};

/// Library size the homologous counts get scaled to before `ln(1 + x)`
const CPM_SCALE: f32 = 1e6;

/// Data-level nearest context cells of every target cell
///
/// Lists are sorted by decreasing similarity. Indices are not range checked
/// here; consumers skip out of range entries.
///
/// ### Fields
///
/// * `lists` - Per target cell `(context_cell, similarity)` pairs
/// * `n_context` - Number of context cells the indices refer to
#[derive(Clone, Debug)]
pub struct DataNeighbours {
    lists: Vec<Vec<(usize, f32)>>,
    n_context: usize,
}

impl DataNeighbours {
    /// Wrap an externally computed mapping
    ///
    /// ### Params
    ///
    /// * `lists` - One neighbour list per target cell
    /// * `n_context` - Number of context cells
    /// * `n_target` - Number of target cells
    ///
    /// ### Returns
    ///
    /// The mapping with every list sorted by decreasing similarity (stable,
    /// so equal similarities keep their given order; NaN entries go last),
    /// or `DataMismatch` if the number of lists differs from `n_target`.
    pub fn from_lists(
        mut lists: Vec<Vec<(usize, f32)>>,
        n_context: usize,
        n_target: usize,
    ) -> AlignResult<Self> {
        if lists.len() != n_target {
            return Err(AlignError::data(format!(
                "Got {} neighbour lists for {} target cells",
                lists.len(),
                n_target
            )));
        }
        for list in lists.iter_mut() {
            list.sort_by(|a, b| {
                a.1.is_nan()
                    .cmp(&b.1.is_nan())
                    .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
            });
        }
        Ok(Self { lists, n_context })
    }

    pub fn n_target(&self) -> usize {
        self.lists.len()
    }

    pub fn n_context(&self) -> usize {
        self.n_context
    }

    /// Neighbour list of one target cell
    pub fn neighbours(&self, target_cell: usize) -> &[(usize, f32)] {
        &self.lists[target_cell]
    }

    /// Best valid context match of a target cell
    pub fn top(&self, target_cell: usize) -> Option<usize> {
        self.lists[target_cell]
            .iter()
            .find(|&&(c, sim)| c < self.n_context && sim.is_finite())
            .map(|&(c, _)| c)
    }
}

/// Nearest context cells of each target cell on the homologous genes
///
/// Both species get projected onto the shared feature space, normalised to
/// counts per million and log transformed; similarity is the cosine. Target
/// cells without any homologous expression get an empty list.
///
/// ### Params
///
/// * `context` - The context species
/// * `target` - The target species
/// * `homology` - Gene correspondence between the two
/// * `k` - Neighbours per target cell
///
/// ### Returns
///
/// The `DataNeighbours` or `EmptyHomology`.
pub fn compute_data_neighbours(
    context: &SpeciesDataset,
    target: &SpeciesDataset,
    homology: &HomologyMap,
    k: usize,
) -> AlignResult<DataNeighbours> {
    if homology.is_empty() {
        return Err(AlignError::EmptyHomology {
            context: context.name().to_string(),
            target: target.name().to_string(),
        });
    }

    let ctx_shared = homology.project_context(context.counts());
    let tgt_shared = homology.project_target(target.counts());
    let ctx_norm = log_normalise_rows(ctx_shared.as_ref(), CPM_SCALE);
    let tgt_norm = log_normalise_rows(tgt_shared.as_ref(), CPM_SCALE);

    let tgt_expressed = row_sums(tgt_shared.as_ref());
    let lists = knn_cross(tgt_norm.as_ref(), ctx_norm.as_ref(), k, KnnMetric::Cosine)
        .into_iter()
        .zip(tgt_expressed)
        .map(|(list, total)| if total > 0.0 { list } else { Vec::new() })
        .collect();

    DataNeighbours::from_lists(lists, context.n_cells(), target.n_cells())
}

///////////
// Tests //
///////////
