use serde::{Deserialize, Serialize};

use crate::core::data::dataset::SpeciesDataset;
use crate::core::graph::knn::{knn_cross, KnnMetric};
use crate::error::{AlignError, AlignResult};
use crate::single_cell::alignment::data_neighbours::DataNeighbours;
use crate::single_cell::alignment::model::LatentCodes;
use crate::utils::general::majority_vote;

/// A context label column paired with the matching target label column
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelKeyPair {
    pub context: String,
    pub target: String,
}

impl LabelKeyPair {
    pub fn new(context: &str, target: &str) -> Self {
        Self {
            context: context.to_string(),
            target: target.to_string(),
        }
    }
}

/// Predicted target labels for one label key pair
///
/// ### Fields
///
/// * `keys` - The label columns used
/// * `k` - Number of latent neighbours that voted
/// * `predicted` - Predicted label per target cell
/// * `accuracy` - Fraction of correct predictions; `None` without target
///   labels
/// * `baseline_predicted` - Label of the best data-level neighbour, if any
/// * `baseline_accuracy` - Accuracy of the data-level baseline; `None`
///   without target labels or data-level neighbours
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LabelTransferResult {
    pub keys: LabelKeyPair,
    pub k: usize,
    pub predicted: Vec<String>,
    pub accuracy: Option<f32>,
    pub baseline_predicted: Vec<Option<String>>,
    pub baseline_accuracy: Option<f32>,
}

/// Fraction of matching entries; missing predictions count as wrong
fn accuracy<'a, I>(predicted: I, truth: &[&str]) -> Option<f32>
where
    I: Iterator<Item = Option<&'a str>>,
{
    if truth.is_empty() {
        return None;
    }
    let correct = predicted
        .zip(truth.iter())
        .filter(|(p, t)| p.map(|p| p == **t).unwrap_or(false))
        .count();
    Some(correct as f32 / truth.len() as f32)
}

/// Transfer labels from the context to the target species via the latent
/// space
///
/// Every target cell gets the majority label of its `k` nearest context
/// cells (Euclidean on posterior means); count ties go to the label seen
/// first, i.e. the nearest.
///
/// ### Params
///
/// * `context` - The context species
/// * `context_latent` - Latent codes of the context cells
/// * `target` - The target species (or any held out subset of it)
/// * `target_latent` - Latent codes of the target cells
/// * `neighbours` - Optional data-level neighbours for the baseline
/// * `keys` - Label columns to use
/// * `k` - Number of neighbours
///
/// ### Returns
///
/// The `LabelTransferResult`, `MissingLabelKey` for a missing context
/// column, or `DataMismatch` for inconsistent inputs.
pub fn transfer_labels(
    context: &SpeciesDataset,
    context_latent: &LatentCodes,
    target: &SpeciesDataset,
    target_latent: &LatentCodes,
    neighbours: Option<&DataNeighbours>,
    keys: &LabelKeyPair,
    k: usize,
) -> AlignResult<LabelTransferResult> {
    if k == 0 {
        return Err(AlignError::config("Label transfer needs k >= 1"));
    }
    if context_latent.n_cells() != context.n_cells() || target_latent.n_cells() != target.n_cells()
    {
        return Err(AlignError::data(
            "Latent codes and datasets differ in their number of cells",
        ));
    }
    if context_latent.latent_dim() != target_latent.latent_dim() {
        return Err(AlignError::LatentWidthMismatch {
            component: "target latent codes".to_string(),
            expected: context_latent.latent_dim(),
            got: target_latent.latent_dim(),
        });
    }
    if let Some(nn) = neighbours {
        if nn.n_target() != target.n_cells() {
            return Err(AlignError::data(format!(
                "Data-level neighbours cover {} target cells, got {}",
                nn.n_target(),
                target.n_cells()
            )));
        }
    }

    let ctx_labels = context.require_label(&keys.context)?;
    let truth: Option<Vec<&str>> = target
        .label(&keys.target)
        .map(|col| (0..target.n_cells()).map(|i| col.value(i)).collect());

    let knn = knn_cross(
        target_latent.mean.as_ref(),
        context_latent.mean.as_ref(),
        k,
        KnnMetric::Euclidean,
    );
    let predicted: Vec<String> = knn
        .iter()
        .map(|list| {
            majority_vote(list.iter().map(|&(c, _)| ctx_labels.value(c)))
                .unwrap_or_default()
                .to_string()
        })
        .collect();

    let baseline_predicted: Vec<Option<String>> = match neighbours {
        Some(nn) => (0..target.n_cells())
            .map(|t| nn.top(t).map(|c| ctx_labels.value(c).to_string()))
            .collect(),
        None => Vec::new(),
    };

    let accuracy_value = truth
        .as_ref()
        .and_then(|t| accuracy(predicted.iter().map(|p| Some(p.as_str())), t));
    let baseline_accuracy = match (&truth, neighbours) {
        (Some(t), Some(_)) => accuracy(baseline_predicted.iter().map(|p| p.as_deref()), t),
        _ => None,
    };

    Ok(LabelTransferResult {
        keys: keys.clone(),
        k,
        predicted,
        accuracy: accuracy_value,
        baseline_predicted,
        baseline_accuracy,
    })
}

///////////
// Tests //
///////////
