use faer::Mat;
use rand::prelude::*;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::assert_same_len;
use crate::core::base::stats::median_in_place;
use crate::core::data::dataset::SpeciesDataset;
use crate::core::data::homology::HomologyMap;
use crate::error::{AlignError, AlignResult};
use crate::single_cell::alignment::label_transfer::LabelKeyPair;
use crate::single_cell::alignment::model::{LatentCodes, SpeciesModel};

////////////
// Params //
////////////

/// Settings of the log-fold change estimation
///
/// ### Fields
///
/// * `keys` - Label columns defining the cell groups in both species
/// * `threshold` - Minimum absolute log2 fold change that counts as a
///   difference
/// * `n_samples` - Posterior samples per species and group
/// * `de_prob_cutoff` - Genes with `P(|lfc| > threshold)` at or above this
///   value are flagged differentially expressed
/// * `epsilon` - Pseudo count added before taking logarithms
/// * `seed` - Seed for the posterior sampling
#[derive(Clone, Debug)]
pub struct LfcParams {
    pub keys: LabelKeyPair,
    pub threshold: f32,
    pub n_samples: usize,
    pub de_prob_cutoff: f32,
    pub epsilon: f32,
    pub seed: u64,
}

impl LfcParams {
    /// Default settings for a label key pair
    pub fn new(keys: LabelKeyPair) -> Self {
        Self {
            keys,
            threshold: 1.0,
            n_samples: 500,
            de_prob_cutoff: 0.9,
            epsilon: 1e-6,
            seed: 42,
        }
    }
}

/////////////
// Results //
/////////////

/// Fold change of one homologous feature
///
/// ### Fields
///
/// * `first_gene` - Gene name(s) of the first species (`+` joined if several
///   genes feed the feature)
/// * `second_gene` - Gene name(s) of the second species
/// * `lfc` - log2 fold change first vs second from posterior means
/// * `median_lfc` - Median over posterior samples
/// * `prob_de` - Fraction of samples with `|lfc| > threshold`
/// * `is_de` - `prob_de >= de_prob_cutoff`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneLfc {
    pub first_gene: String,
    pub second_gene: String,
    pub lfc: f32,
    pub median_lfc: f32,
    pub prob_de: f32,
    pub is_de: bool,
}

/// Fold changes of one cell group present in both species
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupLfc {
    pub group: String,
    pub n_first: usize,
    pub n_second: usize,
    pub genes: Vec<GeneLfc>,
}

/// All group wise fold changes between two species
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LfcResult {
    pub first_species: String,
    pub second_species: String,
    pub threshold: f32,
    pub de_prob_cutoff: f32,
    pub groups: Vec<GroupLfc>,
}

impl LfcResult {
    /// Look up a group by name
    pub fn group(&self, name: &str) -> Option<&GroupLfc> {
        self.groups.iter().find(|g| g.group == name)
    }
}

///////////
// Sides //
///////////

/// One species as it enters a fold change comparison
///
/// ### Fields
///
/// * `dataset` - The species data
/// * `model` - Its trained model
/// * `latent` - Latent codes of all its cells
/// * `features` - Per homologous feature the species genes summed into it
/// * `feature_names` - Display name per feature
pub struct LfcSide<'a> {
    pub dataset: &'a SpeciesDataset,
    pub model: &'a SpeciesModel,
    pub latent: &'a LatentCodes,
    pub features: Vec<Vec<usize>>,
    pub feature_names: Vec<String>,
}

impl<'a> LfcSide<'a> {
    fn build(
        dataset: &'a SpeciesDataset,
        model: &'a SpeciesModel,
        latent: &'a LatentCodes,
        homology: &HomologyMap,
        features: Vec<Vec<usize>>,
    ) -> AlignResult<Self> {
        if homology.is_empty() {
            return Err(AlignError::EmptyHomology {
                context: dataset.name().to_string(),
                target: "other species".to_string(),
            });
        }
        model.check_dataset(dataset)?;
        if latent.n_cells() != dataset.n_cells() {
            return Err(AlignError::data(format!(
                "{} latent codes for {} cells of '{}'",
                latent.n_cells(),
                dataset.n_cells(),
                dataset.name()
            )));
        }
        let feature_names = features
            .iter()
            .map(|genes| {
                genes
                    .iter()
                    .map(|&g| dataset.genes()[g].as_str())
                    .collect::<Vec<_>>()
                    .join("+")
            })
            .collect();
        Ok(Self {
            dataset,
            model,
            latent,
            features,
            feature_names,
        })
    }

    /// The context species of a homology map
    pub fn context(
        dataset: &'a SpeciesDataset,
        model: &'a SpeciesModel,
        latent: &'a LatentCodes,
        homology: &HomologyMap,
    ) -> AlignResult<Self> {
        let features = homology.context_groups().to_vec();
        Self::build(dataset, model, latent, homology, features)
    }

    /// The target species of a homology map
    pub fn target(
        dataset: &'a SpeciesDataset,
        model: &'a SpeciesModel,
        latent: &'a LatentCodes,
        homology: &HomologyMap,
    ) -> AlignResult<Self> {
        let features = homology.target_genes().iter().map(|&g| vec![g]).collect();
        Self::build(dataset, model, latent, homology, features)
    }

    /// Decoded expression restricted to the features, renormalised per row
    fn feature_expression(&self, z: &Mat<f32>, batch_codes: &[usize]) -> Vec<Vec<f64>> {
        let rho = self.model.decode_normalised(z, batch_codes);
        (0..rho.nrows())
            .map(|i| {
                let raw: Vec<f64> = self
                    .features
                    .iter()
                    .map(|genes| genes.iter().map(|&g| rho[(i, g)] as f64).sum())
                    .collect();
                let total: f64 = raw.iter().sum();
                if total > 0.0 {
                    raw.into_iter().map(|v| v / total).collect()
                } else {
                    raw
                }
            })
            .collect()
    }

    /// Mean expression of a group from posterior means, averaged over all
    /// batches of the species
    fn mean_expression(&self, cells: &[usize]) -> Vec<f64> {
        let n_features = self.features.len();
        let z = Mat::from_fn(cells.len(), self.latent.latent_dim(), |i, d| {
            self.latent.mean[(cells[i], d)]
        });
        let n_batches = self.model.n_batches();
        let mut acc = vec![0_f64; n_features];
        for batch in 0..n_batches {
            let rows = self.feature_expression(&z, &vec![batch; cells.len()]);
            for row in rows {
                for (f, v) in row.into_iter().enumerate() {
                    acc[f] += v;
                }
            }
        }
        let denom = (cells.len() * n_batches) as f64;
        acc.into_iter().map(|v| v / denom).collect()
    }

    /// Feature expression of posterior samples of random group cells
    fn sample_expression(
        &self,
        cells: &[usize],
        n_samples: usize,
        rng: &mut StdRng,
    ) -> Vec<Vec<f64>> {
        let latent_dim = self.latent.latent_dim();
        let picked: Vec<usize> = (0..n_samples)
            .map(|_| cells[rng.random_range(0..cells.len())])
            .collect();
        let noise: Vec<f32> = (0..n_samples * latent_dim)
            .map(|_| StandardNormal.sample(rng))
            .collect();
        let z = Mat::from_fn(n_samples, latent_dim, |s, d| {
            let cell = picked[s];
            self.latent.mean[(cell, d)]
                + self.latent.var[(cell, d)].sqrt() * noise[s * latent_dim + d]
        });
        let batch_codes: Vec<usize> = picked
            .iter()
            .map(|&c| self.dataset.batch_codes()[c])
            .collect();
        self.feature_expression(&z, &batch_codes)
    }
}

////////////////////
// Main functions //
////////////////////

/// Cell type wise log2 fold changes between two species on homologous genes
///
/// For every group present in both label columns the posterior mean
/// expression is decoded for all batches of the species, restricted to the
/// homologous features and renormalised. The point estimate
/// `log2(first + eps) - log2(second + eps)` is exactly antisymmetric when
/// the two sides are swapped. Posterior samples give the median fold change
/// and the probability of exceeding the threshold.
///
/// ### Params
///
/// * `first` - Numerator species
/// * `second` - Denominator species
/// * `params` - The `LfcParams`; `keys.context` is looked up in `first` and
///   `keys.target` in `second`
///
/// ### Returns
///
/// The `LfcResult`
pub fn compute_lfc(
    first: &LfcSide,
    second: &LfcSide,
    params: &LfcParams,
) -> AlignResult<LfcResult> {
    if first.features.len() != second.features.len() {
        return Err(AlignError::data(format!(
            "'{}' has {} homologous features, '{}' has {}",
            first.dataset.name(),
            first.features.len(),
            second.dataset.name(),
            second.features.len()
        )));
    }
    if params.n_samples == 0 {
        return Err(AlignError::config("n_samples must be positive"));
    }

    let first_labels = first.dataset.require_label(&params.keys.context)?;
    let second_labels = second.dataset.require_label(&params.keys.target)?;
    let eps = params.epsilon as f64;

    let mut rng_first = StdRng::seed_from_u64(params.seed);
    let mut rng_second = StdRng::seed_from_u64(params.seed.wrapping_add(1));
    let mut groups = Vec::new();

    for (code, group) in first_labels.categories.iter().enumerate() {
        let Some(other_code) = second_labels.code_of(group) else {
            continue;
        };
        let first_cells: Vec<usize> = (0..first.dataset.n_cells())
            .filter(|&c| first_labels.codes[c] == code)
            .collect();
        let second_cells: Vec<usize> = (0..second.dataset.n_cells())
            .filter(|&c| second_labels.codes[c] == other_code)
            .collect();
        if first_cells.is_empty() || second_cells.is_empty() {
            continue;
        }

        let mean_first = first.mean_expression(&first_cells);
        let mean_second = second.mean_expression(&second_cells);
        let samples_first =
            first.sample_expression(&first_cells, params.n_samples, &mut rng_first);
        let samples_second =
            second.sample_expression(&second_cells, params.n_samples, &mut rng_second);
        assert_same_len!(samples_first, samples_second);

        let genes = (0..first.features.len())
            .map(|f| {
                let lfc = ((mean_first[f] + eps).log2() - (mean_second[f] + eps).log2()) as f32;
                let mut sampled: Vec<f32> = samples_first
                    .iter()
                    .zip(samples_second.iter())
                    .map(|(a, b)| ((a[f] + eps).log2() - (b[f] + eps).log2()) as f32)
                    .collect();
                let exceed = sampled
                    .iter()
                    .filter(|v| v.abs() > params.threshold)
                    .count();
                let prob_de = exceed as f32 / params.n_samples as f32;
                GeneLfc {
                    first_gene: first.feature_names[f].clone(),
                    second_gene: second.feature_names[f].clone(),
                    lfc,
                    median_lfc: median_in_place(&mut sampled),
                    prob_de,
                    is_de: prob_de >= params.de_prob_cutoff,
                }
            })
            .collect();

        groups.push(GroupLfc {
            group: group.clone(),
            n_first: first_cells.len(),
            n_second: second_cells.len(),
            genes,
        });
    }

    Ok(LfcResult {
        first_species: first.dataset.name().to_string(),
        second_species: second.dataset.name().to_string(),
        threshold: params.threshold,
        de_prob_cutoff: params.de_prob_cutoff,
        groups,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{
        generate_two_species_data, SyntheticPair, SyntheticPairParams, COARSE_KEY,
    };
    use crate::single_cell::alignment::config::{LibraryMode, ModelParams};

    fn models(pair: &SyntheticPair) -> (SpeciesModel, SpeciesModel) {
        let params = ModelParams {
            latent_dim: 3,
            hidden_dim: 8,
            library_mode: LibraryMode::Observed,
            seed: 21,
        };
        let ctx = SpeciesModel::for_dataset(&pair.context, &params).unwrap();
        let tgt = SpeciesModel::for_dataset(
            &pair.target,
            &ModelParams {
                seed: 22,
                ..params
            },
        )
        .unwrap();
        (ctx, tgt)
    }

    fn params() -> LfcParams {
        LfcParams {
            n_samples: 50,
            ..LfcParams::new(LabelKeyPair::new(COARSE_KEY, COARSE_KEY))
        }
    }

    #[test]
    fn test_lfc_is_antisymmetric() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let (ctx_model, tgt_model) = models(&pair);
        let ctx_latent = ctx_model.encode(&pair.context).unwrap();
        let tgt_latent = tgt_model.encode(&pair.target).unwrap();

        let ctx_side =
            LfcSide::context(&pair.context, &ctx_model, &ctx_latent, &pair.homology).unwrap();
        let tgt_side =
            LfcSide::target(&pair.target, &tgt_model, &tgt_latent, &pair.homology).unwrap();

        let forward = compute_lfc(&ctx_side, &tgt_side, &params()).unwrap();
        let backward = compute_lfc(&tgt_side, &ctx_side, &params()).unwrap();

        assert_eq!(forward.groups.len(), 2);
        for group in &forward.groups {
            let other = backward.group(&group.group).unwrap();
            assert_eq!(group.genes.len(), pair.homology.n_shared());
            for (a, b) in group.genes.iter().zip(other.genes.iter()) {
                assert_eq!(a.lfc, -b.lfc);
                assert_eq!(a.first_gene, b.second_gene);
                assert!((0.0..=1.0).contains(&a.prob_de));
            }
        }
    }

    #[test]
    fn test_identical_sides_and_de_flags() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let (ctx_model, _) = models(&pair);
        let ctx_latent = ctx_model.encode(&pair.context).unwrap();
        let side =
            LfcSide::context(&pair.context, &ctx_model, &ctx_latent, &pair.homology).unwrap();

        let same = compute_lfc(&side, &side, &params()).unwrap();
        for group in &same.groups {
            assert!(group.genes.iter().all(|g| g.lfc == 0.0));
        }

        // with a zero threshold nearly every sampled difference counts
        let loose = LfcParams {
            threshold: 0.0,
            de_prob_cutoff: 0.5,
            ..params()
        };
        let res = compute_lfc(&side, &side, &loose).unwrap();
        assert!(res.groups[0].genes.iter().all(|g| g.is_de));
    }

    #[test]
    fn test_missing_group_key() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let (ctx_model, tgt_model) = models(&pair);
        let ctx_latent = ctx_model.encode(&pair.context).unwrap();
        let tgt_latent = tgt_model.encode(&pair.target).unwrap();
        let ctx_side =
            LfcSide::context(&pair.context, &ctx_model, &ctx_latent, &pair.homology).unwrap();
        let tgt_side =
            LfcSide::target(&pair.target, &tgt_model, &tgt_latent, &pair.homology).unwrap();

        let bad = LfcParams::new(LabelKeyPair::new(COARSE_KEY, "missing"));
        let err = compute_lfc(&ctx_side, &tgt_side, &bad);
        assert!(matches!(err, Err(AlignError::MissingLabelKey { .. })));
    }
}
