use faer::Mat;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::base::utils::col_means;
use crate::core::data::dataset::SpeciesDataset;
use crate::core::graph::clustering::kmeans;
use crate::error::AlignResult;
use crate::single_cell::alignment::config::{PrototypeParams, PrototypePolicy, TieBreak};
use crate::single_cell::alignment::data_neighbours::DataNeighbours;
use crate::single_cell::alignment::model::LatentCodes;
use crate::utils::general::{majority_vote, row_sq_dist, select_rows};

/// Lloyd iterations for latent space clustering
const KMEANS_ITERS: usize = 100;

////////////////
// Structures //
////////////////

/// Context cells whose latent codes anchor the target fit
///
/// Fixed once selected; the target trainer never changes it.
///
/// ### Fields
///
/// * `cells` - Context cell index per prototype
/// * `clusters` - Cluster id per prototype
/// * `codes` - Prototypes x latent codes (context posterior means)
/// * `cluster_of_cell` - Cluster id of every context cell
/// * `cluster_names` - Name per cluster id
/// * `from_labels` - Whether clusters come from a label column
#[derive(Clone, Debug)]
pub struct PrototypeSet {
    pub cells: Vec<usize>,
    pub clusters: Vec<usize>,
    pub codes: Mat<f32>,
    pub cluster_of_cell: Vec<usize>,
    pub cluster_names: Vec<String>,
    pub from_labels: bool,
}

impl PrototypeSet {
    pub fn n_prototypes(&self) -> usize {
        self.cells.len()
    }

    pub fn n_clusters(&self) -> usize {
        self.cluster_names.len()
    }

    /// Prototype indices belonging to a cluster
    pub fn of_cluster(&self, cluster: usize) -> Vec<usize> {
        self.clusters
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == cluster)
            .map(|(p, _)| p)
            .collect()
    }
}

/// Why a target cell did not get a prototype (or lost a neighbour)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WarningReason {
    /// The data-level mapping lists no usable context cell
    NoNeighbours,
    /// A listed context index does not exist; the entry was ignored
    NeighbourOutOfRange { context_cell: usize },
    /// A listed similarity is NaN or infinite; the entry was ignored
    NonFiniteSimilarity { context_cell: usize },
    /// The chosen cluster carries no prototype
    NoPrototypeInCluster { cluster: usize },
}

/// Non-fatal data problem found while assigning prototypes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlignmentWarning {
    pub target_cell: usize,
    pub reason: WarningReason,
}

/// Prototype per target cell
///
/// ### Fields
///
/// * `per_cell` - Prototype index per target cell; `None` is left out of
///   the alignment loss
/// * `warnings` - Everything that was skipped
#[derive(Clone, Debug)]
pub struct PrototypeAssignment {
    pub per_cell: Vec<Option<usize>>,
    pub warnings: Vec<AlignmentWarning>,
}

impl PrototypeAssignment {
    pub fn n_assigned(&self) -> usize {
        self.per_cell.iter().filter(|p| p.is_some()).count()
    }
}

///////////////
// Selection //
///////////////

/// Pick the prototypes from a fitted context model
///
/// ### Params
///
/// * `context` - The context species
/// * `latent` - Latent codes of all context cells
/// * `params` - The `PrototypeParams`
///
/// ### Returns
///
/// The `PrototypeSet`, or `MissingLabelKey` if the configured cluster column
/// does not exist.
pub fn select_prototypes(
    context: &SpeciesDataset,
    latent: &LatentCodes,
    params: &PrototypeParams,
) -> AlignResult<PrototypeSet> {
    let (cluster_of_cell, cluster_names, from_labels) = match &params.cluster_key {
        Some(key) => {
            let column = context.require_label(key)?;
            (column.codes.clone(), column.categories.clone(), true)
        }
        None => {
            let labels = kmeans(
                latent.mean.as_ref(),
                params.n_clusters,
                KMEANS_ITERS,
                params.seed,
            );
            let n = labels.iter().max().map(|m| m + 1).unwrap_or(0);
            let names = (0..n).map(|c| format!("cluster_{}", c)).collect();
            (labels, names, false)
        }
    };

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); cluster_names.len()];
    for (cell, &cluster) in cluster_of_cell.iter().enumerate() {
        members[cluster].push(cell);
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut cells = Vec::new();
    let mut clusters = Vec::new();

    for (cluster, cluster_cells) in members.iter().enumerate() {
        if cluster_cells.is_empty() {
            continue;
        }
        match params.policy {
            PrototypePolicy::PerCluster => {
                let sub = select_rows(latent.mean.as_ref(), cluster_cells);
                let centroid = col_means(sub.as_ref());
                let centroid = Mat::from_fn(1, centroid.len(), |_, d| centroid[d]);
                let mut best = 0;
                let mut best_dist = f32::INFINITY;
                for row in 0..sub.nrows() {
                    let dist = row_sq_dist(&sub, row, &centroid, 0);
                    if dist < best_dist {
                        best_dist = dist;
                        best = row;
                    }
                }
                cells.push(cluster_cells[best]);
                clusters.push(cluster);
            }
            PrototypePolicy::Stratified { per_cluster } => {
                let mut sampled = cluster_cells.clone();
                sampled.shuffle(&mut rng);
                sampled.truncate(per_cluster);
                sampled.sort_unstable();
                for cell in sampled {
                    cells.push(cell);
                    clusters.push(cluster);
                }
            }
        }
    }

    let codes = select_rows(latent.mean.as_ref(), &cells);

    Ok(PrototypeSet {
        cells,
        clusters,
        codes,
        cluster_of_cell,
        cluster_names,
        from_labels,
    })
}

////////////////
// Assignment //
////////////////

/// Assign a prototype to every target cell from its data-level neighbours
///
/// Neighbours within `tie_tolerance` of the best similarity are tied. The
/// cluster is decided by the tie break rule (`FirstRank` whenever the
/// clusters do not come from labels); inside that cluster the prototype
/// closest to the first tied neighbour of the cluster wins.
///
/// ### Params
///
/// * `prototypes` - The selected prototypes
/// * `neighbours` - Data-level neighbours per target cell
/// * `context_latent` - Latent codes of all context cells
/// * `params` - The `PrototypeParams`
///
/// ### Returns
///
/// The `PrototypeAssignment`; skipped cells are listed as warnings and
/// logged.
pub fn assign_prototypes(
    prototypes: &PrototypeSet,
    neighbours: &DataNeighbours,
    context_latent: &LatentCodes,
    params: &PrototypeParams,
) -> PrototypeAssignment {
    let n_context = prototypes.cluster_of_cell.len();
    let tie_break = if prototypes.from_labels {
        params.tie_break
    } else {
        TieBreak::FirstRank
    };

    let mut per_cell = Vec::with_capacity(neighbours.n_target());
    let mut warnings = Vec::new();

    for target_cell in 0..neighbours.n_target() {
        let mut valid: Vec<(usize, f32)> = Vec::new();
        for &(context_cell, sim) in neighbours.neighbours(target_cell) {
            if context_cell >= n_context {
                warnings.push(AlignmentWarning {
                    target_cell,
                    reason: WarningReason::NeighbourOutOfRange { context_cell },
                });
            } else if !sim.is_finite() {
                warnings.push(AlignmentWarning {
                    target_cell,
                    reason: WarningReason::NonFiniteSimilarity { context_cell },
                });
            } else {
                valid.push((context_cell, sim));
            }
        }

        let ties: Vec<usize> = match valid.first() {
            Some(&(_, best_sim)) => valid
                .iter()
                .take_while(|(_, sim)| *sim >= best_sim - params.tie_tolerance)
                .map(|&(c, _)| c)
                .collect(),
            None => Vec::new(),
        };
        let Some(&first) = ties.first() else {
            warnings.push(AlignmentWarning {
                target_cell,
                reason: WarningReason::NoNeighbours,
            });
            per_cell.push(None);
            continue;
        };

        let cluster = match tie_break {
            TieBreak::FirstRank => prototypes.cluster_of_cell[first],
            TieBreak::MajorityLabel => {
                majority_vote(ties.iter().map(|&c| prototypes.cluster_of_cell[c]))
                    .unwrap_or(prototypes.cluster_of_cell[first])
            }
        };
        let anchor = ties
            .iter()
            .copied()
            .find(|&c| prototypes.cluster_of_cell[c] == cluster)
            .unwrap_or(first);

        let candidates = prototypes.of_cluster(cluster);
        let mut best: Option<(usize, f32)> = None;
        for p in candidates {
            let dist = row_sq_dist(&context_latent.mean, anchor, &prototypes.codes, p);
            if best.map(|(_, d)| dist < d).unwrap_or(true) {
                best = Some((p, dist));
            }
        }

        match best {
            Some((p, _)) => per_cell.push(Some(p)),
            None => {
                warnings.push(AlignmentWarning {
                    target_cell,
                    reason: WarningReason::NoPrototypeInCluster { cluster },
                });
                per_cell.push(None);
            }
        }
    }

    for w in &warnings {
        warn!(target_cell = w.target_cell, reason = ?w.reason, "Alignment skipped a neighbour");
    }

    PrototypeAssignment { per_cell, warnings }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::dataset::{GeneNaming, LabelColumn};

    /// Six context cells in two well separated latent groups
    fn context_fixture() -> (SpeciesDataset, LatentCodes) {
        let labels = ["A", "A", "A", "B", "B", "B"];
        let data = SpeciesDataset::new(
            "ctx",
            vec!["g0".to_string()],
            GeneNaming::Symbol,
            Mat::from_fn(6, 1, |_, _| 1.0),
            LabelColumn::from_values("batch", &["b"; 6]),
            vec![LabelColumn::from_values("cell_type", &labels)],
        )
        .unwrap();
        let positions = [0.0_f32, 1.0, 2.0, 10.0, 11.0, 12.0];
        let latent = LatentCodes {
            mean: Mat::from_fn(6, 2, |i, d| if d == 0 { positions[i] } else { 0.0 }),
            var: Mat::from_fn(6, 2, |_, _| 1.0),
        };
        (data, latent)
    }

    fn labelled_params() -> PrototypeParams {
        PrototypeParams {
            cluster_key: Some("cell_type".to_string()),
            ..PrototypeParams::default()
        }
    }

    #[test]
    fn test_per_cluster_picks_centroid_cell() {
        let (data, latent) = context_fixture();
        let set = select_prototypes(&data, &latent, &labelled_params()).unwrap();
        assert_eq!(set.cells, vec![1, 4]);
        assert_eq!(set.clusters, vec![0, 1]);
        assert_eq!(set.codes[(1, 0)], 11.0);
        assert!(set.from_labels);
    }

    #[test]
    fn test_stratified_and_kmeans_clusters() {
        let (data, latent) = context_fixture();
        let params = PrototypeParams {
            policy: PrototypePolicy::Stratified { per_cluster: 2 },
            ..labelled_params()
        };
        let set = select_prototypes(&data, &latent, &params).unwrap();
        assert_eq!(set.n_prototypes(), 4);
        assert_eq!(set.of_cluster(0).len(), 2);
        assert!(set.of_cluster(0).iter().all(|&p| set.cells[p] < 3));

        let params = PrototypeParams {
            n_clusters: 2,
            ..PrototypeParams::default()
        };
        let set = select_prototypes(&data, &latent, &params).unwrap();
        assert!(!set.from_labels);
        assert_eq!(set.n_clusters(), 2);
        assert_ne!(set.cluster_of_cell[0], set.cluster_of_cell[5]);
        assert_eq!(set.cluster_of_cell[0], set.cluster_of_cell[2]);
    }

    #[test]
    fn test_missing_cluster_key() {
        let (data, latent) = context_fixture();
        let params = PrototypeParams {
            cluster_key: Some("nope".to_string()),
            ..PrototypeParams::default()
        };
        assert!(select_prototypes(&data, &latent, &params).is_err());
    }

    #[test]
    fn test_tie_break_rules() {
        let (data, latent) = context_fixture();
        let set = select_prototypes(&data, &latent, &labelled_params()).unwrap();

        // top match is cluster A, but two of three tied matches are cluster B
        let lists = vec![vec![(0, 0.9), (3, 0.9), (5, 0.9), (1, 0.5)]];
        let nn = DataNeighbours::from_lists(lists, 6, 1).unwrap();

        let majority = assign_prototypes(&set, &nn, &latent, &labelled_params());
        assert_eq!(majority.per_cell, vec![Some(1)]);

        let first = PrototypeParams {
            tie_break: TieBreak::FirstRank,
            ..labelled_params()
        };
        let assigned = assign_prototypes(&set, &nn, &latent, &first);
        assert_eq!(assigned.per_cell, vec![Some(0)]);

        // no ties with a tight tolerance and distinct similarities
        let lists = vec![vec![(0, 0.91), (3, 0.9), (5, 0.9)]];
        let nn = DataNeighbours::from_lists(lists, 6, 1).unwrap();
        let assigned = assign_prototypes(&set, &nn, &latent, &labelled_params());
        assert_eq!(assigned.per_cell, vec![Some(0)]);
    }

    #[test]
    fn test_count_ties_fall_back_to_rank_order() {
        let (data, latent) = context_fixture();
        let set = select_prototypes(&data, &latent, &labelled_params()).unwrap();
        let lists = vec![vec![(4, 0.8), (0, 0.8)]];
        let nn = DataNeighbours::from_lists(lists, 6, 1).unwrap();
        let assigned = assign_prototypes(&set, &nn, &latent, &labelled_params());
        assert_eq!(assigned.per_cell, vec![Some(1)]);
    }

    #[test]
    fn test_unlabelled_context_uses_first_rank() {
        let (data, latent) = context_fixture();
        let params = PrototypeParams {
            n_clusters: 2,
            ..PrototypeParams::default()
        };
        let set = select_prototypes(&data, &latent, &params).unwrap();
        let lists = vec![vec![(0, 0.9), (3, 0.9), (5, 0.9)]];
        let nn = DataNeighbours::from_lists(lists, 6, 1).unwrap();
        let assigned = assign_prototypes(&set, &nn, &latent, &params);
        let p = assigned.per_cell[0].unwrap();
        assert_eq!(set.clusters[p], set.cluster_of_cell[0]);
    }

    #[test]
    fn test_missing_and_invalid_neighbours_become_warnings() {
        let (data, latent) = context_fixture();
        let set = select_prototypes(&data, &latent, &labelled_params()).unwrap();
        let lists = vec![vec![], vec![(42, 0.99), (5, 0.7)], vec![(99, 0.5)]];
        let nn = DataNeighbours::from_lists(lists, 6, 3).unwrap();
        let assigned = assign_prototypes(&set, &nn, &latent, &labelled_params());

        assert_eq!(assigned.per_cell, vec![None, Some(1), None]);
        assert_eq!(assigned.n_assigned(), 1);
        assert_eq!(
            assigned.warnings,
            vec![
                AlignmentWarning {
                    target_cell: 0,
                    reason: WarningReason::NoNeighbours
                },
                AlignmentWarning {
                    target_cell: 1,
                    reason: WarningReason::NeighbourOutOfRange { context_cell: 42 }
                },
                AlignmentWarning {
                    target_cell: 2,
                    reason: WarningReason::NeighbourOutOfRange { context_cell: 99 }
                },
                AlignmentWarning {
                    target_cell: 2,
                    reason: WarningReason::NoNeighbours
                },
            ]
        );
    }

    #[test]
    fn test_non_finite_similarities_are_skipped() {
        let (data, latent) = context_fixture();
        let set = select_prototypes(&data, &latent, &labelled_params()).unwrap();
        let lists = vec![
            vec![(0, f32::NAN), (1, 0.5)],
            vec![(4, f32::NAN)],
            vec![(3, f32::INFINITY), (4, 0.3)],
        ];
        let nn = DataNeighbours::from_lists(lists, 6, 3).unwrap();
        let assigned = assign_prototypes(&set, &nn, &latent, &labelled_params());

        assert_eq!(assigned.per_cell, vec![Some(0), None, Some(1)]);
        assert_eq!(
            assigned.warnings,
            vec![
                AlignmentWarning {
                    target_cell: 0,
                    reason: WarningReason::NonFiniteSimilarity { context_cell: 0 }
                },
                AlignmentWarning {
                    target_cell: 1,
                    reason: WarningReason::NonFiniteSimilarity { context_cell: 4 }
                },
                AlignmentWarning {
                    target_cell: 1,
                    reason: WarningReason::NoNeighbours
                },
                AlignmentWarning {
                    target_cell: 2,
                    reason: WarningReason::NonFiniteSimilarity { context_cell: 3 }
                },
            ]
        );
    }
}
