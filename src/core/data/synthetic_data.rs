use faer::Mat;
use rand::prelude::*;
use rand_distr::{Distribution, Gamma, Normal, Poisson};
use rayon::prelude::*;

use crate::core::data::dataset::{GeneNaming, LabelColumn, SpeciesDataset};
use crate::core::data::homology::HomologyMap;
use crate::error::AlignResult;

/// Key of the coarse cell type column in the synthetic data
pub const COARSE_KEY: &str = "cell_type_coarse";
/// Key of the fine cell type column in the synthetic data
pub const FINE_KEY: &str = "cell_type_fine";
/// Key of the batch column in the synthetic data
pub const BATCH_KEY: &str = "batch";

////////////
// Params //
////////////

/// Parameters for a synthetic pair of species
///
/// ### Fields
///
/// * `context_cells` - Number of context cells
/// * `context_genes` - Number of context genes
/// * `target_cells` - Number of target cells
/// * `target_genes` - Number of target genes
/// * `n_homologous` - Number of one-to-one homologous genes. Must not exceed
///   either gene count.
/// * `n_coarse` - Number of coarse cell types
/// * `n_fine_per_coarse` - Fine cell types per coarse type
/// * `n_batches` - Batches per species
/// * `mean_library` - Average library size
/// * `theta` - Negative binomial inverse dispersion
/// * `marker_fold` - Expression fold of marker genes in their cell type
/// * `seed` - Seed for reproducibility purposes
#[derive(Clone, Debug)]
pub struct SyntheticPairParams {
    pub context_cells: usize,
    pub context_genes: usize,
    pub target_cells: usize,
    pub target_genes: usize,
    pub n_homologous: usize,
    pub n_coarse: usize,
    pub n_fine_per_coarse: usize,
    pub n_batches: usize,
    pub mean_library: f64,
    pub theta: f64,
    pub marker_fold: f64,
    pub seed: u64,
}

impl Default for SyntheticPairParams {
    fn default() -> Self {
        Self {
            context_cells: 50,
            context_genes: 20,
            target_cells: 50,
            target_genes: 20,
            n_homologous: 10,
            n_coarse: 2,
            n_fine_per_coarse: 2,
            n_batches: 2,
            mean_library: 2000.0,
            theta: 10.0,
            marker_fold: 8.0,
            seed: 42,
        }
    }
}

/// A synthetic context/target pair
///
/// ### Fields
///
/// * `context` - The context species
/// * `target` - The target species
/// * `homology` - The one-to-one homologous genes
#[derive(Clone, Debug)]
pub struct SyntheticPair {
    pub context: SpeciesDataset,
    pub target: SpeciesDataset,
    pub homology: HomologyMap,
}

/////////////
// Helpers //
/////////////

/// Gene expression profile per fine cell type for one species
///
/// The homologous genes come first in the profile and are split into one
/// block per coarse type; inside each block the first half is additionally
/// raised for even fine types and the second half for odd ones. The
/// remaining species specific genes get their own random cell type program.
fn species_profiles(
    n_genes: usize,
    params: &SyntheticPairParams,
    rng: &mut StdRng,
) -> Vec<Vec<f64>> {
    let n_fine = params.n_coarse * params.n_fine_per_coarse;
    let base_noise = Normal::<f64>::new(0.0, 0.4).unwrap();
    let base: Vec<f64> = (0..n_genes).map(|_| base_noise.sample(rng).exp()).collect();
    let block = (params.n_homologous / params.n_coarse.max(1)).max(1);

    let private_markers: Vec<usize> = (0..n_genes)
        .map(|_| rng.random_range(0..n_fine.max(1)))
        .collect();

    (0..n_fine)
        .map(|fine| {
            let coarse = fine / params.n_fine_per_coarse.max(1);
            let raw: Vec<f64> = (0..n_genes)
                .map(|g| {
                    let mut rate = base[g];
                    if g < params.n_homologous {
                        let gene_block = (g / block).min(params.n_coarse - 1);
                        if gene_block == coarse {
                            rate *= params.marker_fold;
                            let in_first_half = (g % block) < block.div_ceil(2);
                            if in_first_half == (fine % 2 == 0) {
                                rate *= 2.0;
                            }
                        }
                    } else if private_markers[g] == fine {
                        rate *= params.marker_fold / 2.0;
                    }
                    rate
                })
                .collect();
            let total: f64 = raw.iter().sum();
            raw.into_iter().map(|r| r / total).collect()
        })
        .collect()
}

/// Sample one species
fn sample_species(
    name: &str,
    prefix: &str,
    n_cells: usize,
    gene_order: &[usize],
    profiles: &[Vec<f64>],
    params: &SyntheticPairParams,
    seed: u64,
) -> AlignResult<SpeciesDataset> {
    let n_genes = gene_order.len();
    let n_fine = profiles.len();

    // per batch multiplicative gene effects
    let mut rng = StdRng::seed_from_u64(seed);
    let batch_noise = Normal::<f64>::new(0.0, 0.15).unwrap();
    let batch_effects: Vec<Vec<f64>> = (0..params.n_batches.max(1))
        .map(|_| (0..n_genes).map(|_| batch_noise.sample(&mut rng).exp()).collect())
        .collect();

    let lib_noise = Normal::new(params.mean_library.ln(), 0.25).unwrap();

    let cells: Vec<(usize, usize, Vec<f64>)> = (0..n_cells)
        .into_par_iter()
        .map(|cell_idx| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1 + cell_idx as u64));
            let fine = cell_idx % n_fine;
            let batch = rng.random_range(0..params.n_batches.max(1));
            let library = lib_noise.sample(&mut rng).exp();

            let counts = (0..n_genes)
                .map(|col| {
                    // column `col` holds profile gene `gene_order[col]`
                    let g = gene_order[col];
                    let mu = library * profiles[fine][g] * batch_effects[batch][g];
                    let scale = mu / params.theta;
                    if scale <= 0.0 {
                        return 0.0;
                    }
                    let lambda = Gamma::new(params.theta, scale).unwrap().sample(&mut rng);
                    if lambda <= 1e-12 {
                        0.0
                    } else {
                        Poisson::new(lambda).unwrap().sample(&mut rng)
                    }
                })
                .collect();

            (fine, batch, counts)
        })
        .collect();

    let counts = Mat::from_fn(n_cells, n_genes, |i, j| cells[i].2[j] as f32);
    let fine_labels: Vec<String> = cells
        .iter()
        .map(|(fine, _, _)| {
            let coarse = fine / params.n_fine_per_coarse.max(1);
            format!("type_{}_{}", coarse, fine % params.n_fine_per_coarse.max(1))
        })
        .collect();
    let coarse_labels: Vec<String> = cells
        .iter()
        .map(|(fine, _, _)| format!("type_{}", fine / params.n_fine_per_coarse.max(1)))
        .collect();
    let batches: Vec<String> = cells
        .iter()
        .map(|(_, batch, _)| format!("{}_batch_{}", name, batch))
        .collect();

    let genes = (0..n_genes).map(|j| format!("{}{}", prefix, j)).collect();

    SpeciesDataset::new(
        name,
        genes,
        GeneNaming::Symbol,
        counts,
        LabelColumn::from_values(BATCH_KEY, &batches),
        vec![
            LabelColumn::from_values(COARSE_KEY, &coarse_labels),
            LabelColumn::from_values(FINE_KEY, &fine_labels),
        ],
    )
}

////////////////////
// Main functions //
////////////////////

/// Generate a synthetic context/target species pair
///
/// Both species share the cell type hierarchy. The homologous genes carry
/// the same cell type signal in both species; in the context species they
/// occupy the first columns, in the target species the last ones, so the
/// homology map is not the identity. Counts are gamma-Poisson (i.e.,
/// negative binomial) draws with log-normal library sizes and per-batch gene
/// effects.
///
/// ### Params
///
/// * `params` - The `SyntheticPairParams`
///
/// ### Returns
///
/// The `SyntheticPair`
pub fn generate_two_species_data(params: &SyntheticPairParams) -> AlignResult<SyntheticPair> {
    assert!(
        params.n_homologous <= params.context_genes && params.n_homologous <= params.target_genes,
        "More homologous genes than genes in a species"
    );
    assert!(params.n_coarse > 0 && params.n_fine_per_coarse > 0);

    let mut rng = StdRng::seed_from_u64(params.seed);
    let ctx_profiles = species_profiles(params.context_genes, params, &mut rng);
    let tgt_profiles = species_profiles(params.target_genes, params, &mut rng);

    let ctx_order: Vec<usize> = (0..params.context_genes).collect();
    // target columns: private genes first, homologous genes last
    let tgt_order: Vec<usize> = (params.n_homologous..params.target_genes)
        .chain(0..params.n_homologous)
        .collect();

    let context = sample_species(
        "context",
        "ctx_gene_",
        params.context_cells,
        &ctx_order,
        &ctx_profiles,
        params,
        params.seed.wrapping_mul(31).wrapping_add(1),
    )?;
    let target = sample_species(
        "target",
        "TGT_GENE_",
        params.target_cells,
        &tgt_order,
        &tgt_profiles,
        params,
        params.seed.wrapping_mul(31).wrapping_add(100_003),
    )?;

    let offset = params.target_genes - params.n_homologous;
    let pairs = (0..params.n_homologous).map(|h| (h, offset + h)).collect();
    let homology = HomologyMap::new(pairs, params.context_genes, params.target_genes)?;

    Ok(SyntheticPair {
        context,
        target,
        homology,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_pair_shapes_and_labels() {
        let params = SyntheticPairParams {
            target_genes: 25,
            ..SyntheticPairParams::default()
        };
        let pair = generate_two_species_data(&params).unwrap();

        assert_eq!(pair.context.n_cells(), 50);
        assert_eq!(pair.context.n_genes(), 20);
        assert_eq!(pair.target.n_genes(), 25);
        assert_eq!(pair.homology.n_shared(), 10);
        assert_eq!(pair.homology.pairs()[0], (0, 15));

        let coarse = pair.target.label(COARSE_KEY).unwrap();
        let fine = pair.target.label(FINE_KEY).unwrap();
        assert_eq!(coarse.n_categories(), 2);
        assert_eq!(fine.n_categories(), 4);
        // fine labels refine coarse labels
        for cell in 0..pair.target.n_cells() {
            assert!(fine.value(cell).starts_with(coarse.value(cell)));
        }
    }

    #[test]
    fn test_synthetic_markers_carry_signal() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let coarse = pair.context.label(COARSE_KEY).unwrap();
        let counts = pair.context.counts();

        // gene 0 sits in the marker block of coarse type 0
        let mut sums = [0.0_f32; 2];
        let mut n = [0_usize; 2];
        for cell in 0..pair.context.n_cells() {
            let c = if coarse.value(cell) == "type_0" { 0 } else { 1 };
            sums[c] += counts[(cell, 0)] / pair.context.library_sizes()[cell];
            n[c] += 1;
        }
        assert!(sums[0] / n[0] as f32 > 2.0 * sums[1] / n[1] as f32);
    }

    #[test]
    fn test_synthetic_is_reproducible() {
        let a = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let b = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        assert_eq!(a.target.library_sizes(), b.target.library_sizes());
    }
}
