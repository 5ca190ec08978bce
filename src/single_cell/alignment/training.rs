use faer::Mat;
use rand::prelude::*;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::warn;

use crate::core::base::stats::{kl_normal, kl_std_normal};
use crate::core::base::utils::all_finite;
use crate::core::data::dataset::SpeciesDataset;
use crate::core::nn::optimiser::Adam;
use crate::error::{AlignError, AlignResult};
use crate::single_cell::alignment::checkpoint::{
    CheckpointStore, ComponentSnapshot, ModelComponent,
};
use crate::single_cell::alignment::config::{AlignmentParams, LibraryMode, TrainParams};
use crate::single_cell::alignment::likelihood::nb_batch_log_likelihood;
use crate::single_cell::alignment::model::SpeciesModel;
use crate::utils::general::{one_hot, select_rows};

///////////
// Types //
///////////

/// Mean per cell losses of one epoch
///
/// ### Fields
///
/// * `epoch` - Zero based epoch index
/// * `reconstruction` - Negative log-likelihood
/// * `kl` - Unweighted KL divergence (latent plus library)
/// * `alignment` - Unweighted squared prototype distance, averaged over all
///   cells (unaligned cells contribute zero)
/// * `total` - Weighted sum that was minimised
/// * `kl_weight` - KL weight used in this epoch
/// * `alignment_weight` - Alignment weight used in this epoch
/// * `seconds` - Wall time of the epoch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochLoss {
    pub epoch: usize,
    pub reconstruction: f64,
    pub kl: f64,
    pub alignment: f64,
    pub total: f64,
    pub kl_weight: f32,
    pub alignment_weight: f32,
    pub seconds: f64,
}

/// Loss curve of a training run
///
/// ### Fields
///
/// * `epochs` - One entry per finished epoch
/// * `prototype_distances` - Per epoch the mean squared latent distance of
///   each prototype to its assigned cells; `None` where no cell was assigned.
///   Empty unless tracking was requested.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochLoss>,
    pub prototype_distances: Vec<Vec<Option<f32>>>,
}

impl TrainingHistory {
    /// Total loss of the last epoch
    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.total)
    }
}

/// Which components receive optimiser updates
#[derive(Clone, Copy, Debug)]
pub(crate) struct UpdateSet {
    pub encoder: bool,
    pub decoder: bool,
}

/// Prototype pull on the target encoder means
///
/// ### Fields
///
/// * `codes` - Prototypes x latent fixed codes
/// * `assignment` - Per cell of the trained dataset its prototype, if any
/// * `params` - Weight schedule and tracking flag
pub(crate) struct AlignmentTerm<'a> {
    pub codes: &'a Mat<f32>,
    pub assignment: &'a [Option<usize>],
    pub params: &'a AlignmentParams,
}

/// Where to write checkpoints during training
pub(crate) struct CheckpointTarget<'a> {
    pub store: &'a CheckpointStore,
    pub tag: &'a str,
}

/// Losses and gradients of one minibatch (gradients live in the model)
struct StepOutcome {
    reconstruction: f64,
    kl: f64,
    alignment: f64,
    total: f64,
    prototype_sq: Vec<(usize, f64)>,
}

/////////////
// Helpers //
/////////////

fn kl_weight_at(epoch: usize, warmup: usize) -> f32 {
    if warmup == 0 {
        1.0
    } else {
        ((epoch + 1) as f32 / warmup as f32).min(1.0)
    }
}

fn model_is_finite(model: &SpeciesModel) -> bool {
    model
        .encoder
        .params()
        .iter()
        .chain(model.decoder.params().iter())
        .all(|p| all_finite(p.value.as_ref()))
}

fn restore_snapshot(
    model: &mut SpeciesModel,
    snapshot: &(ComponentSnapshot, ComponentSnapshot),
) -> AlignResult<()> {
    model.restore(&snapshot.0)?;
    model.restore(&snapshot.1)
}

/// Forward and backward pass of one minibatch
///
/// Parameter gradients are accumulated in the model; gradients are averaged
/// over the minibatch. When the loss is not finite the backward pass is
/// skipped.
#[allow(clippy::too_many_arguments)]
fn minibatch_step(
    model: &mut SpeciesModel,
    dataset: &SpeciesDataset,
    cells: &[usize],
    kl_weight: f32,
    alignment: Option<(&AlignmentTerm, f32)>,
    update: UpdateSet,
    rng: &mut StdRng,
) -> StepOutcome {
    let n = cells.len();
    let scale = 1.0 / n as f32;
    let latent_dim = model.latent_dim();

    let counts = select_rows(dataset.counts(), cells);
    let codes: Vec<usize> = cells.iter().map(|&c| dataset.batch_codes()[c]).collect();
    let onehot = one_hot(&codes, model.n_batches());

    // encoder and reparametrisation
    let enc = model.encoder.forward(counts.as_ref(), &onehot);
    let noise: Vec<f32> = (0..n * latent_dim)
        .map(|_| StandardNormal.sample(rng))
        .collect();
    let eps = Mat::from_fn(n, latent_dim, |i, d| noise[i * latent_dim + d]);
    let z = Mat::from_fn(n, latent_dim, |i, d| {
        enc.mean[(i, d)] + (0.5 * enc.log_var[(i, d)]).exp() * eps[(i, d)]
    });

    let (log_library, library_eps): (Vec<f32>, Vec<f32>) = match (&enc.library, model.library_mode()) {
        (Some(lib), LibraryMode::Latent) => {
            let lib_eps: Vec<f32> = (0..n).map(|_| StandardNormal.sample(rng)).collect();
            let log_lib = (0..n)
                .map(|i| lib[(i, 0)] + (0.5 * lib[(i, 1)]).exp() * lib_eps[i])
                .collect();
            (log_lib, lib_eps)
        }
        _ => (
            cells
                .iter()
                .map(|&c| dataset.library_sizes()[c].max(1.0).ln())
                .collect(),
            Vec::new(),
        ),
    };

    // decoder and likelihood
    let dec = model.decoder.forward(&z, &onehot);
    let nb = nb_batch_log_likelihood(
        counts.as_ref(),
        dec.rho.as_ref(),
        &log_library,
        model.decoder.log_theta(),
    );
    let reconstruction = -nb.total();

    // KL terms
    let mut kl = 0_f64;
    let mut d_mean = Mat::<f32>::zeros(n, latent_dim);
    let mut d_log_var = Mat::<f32>::zeros(n, latent_dim);
    for i in 0..n {
        for d in 0..latent_dim {
            let (value, dm, dlv) =
                kl_std_normal(enc.mean[(i, d)] as f64, enc.log_var[(i, d)] as f64);
            kl += value;
            d_mean[(i, d)] = kl_weight * scale * dm as f32;
            d_log_var[(i, d)] = kl_weight * scale * dlv as f32;
        }
    }

    let mut d_library = enc.library.as_ref().map(|_| Mat::<f32>::zeros(n, 2));
    if let (Some(lib), Some(d_lib)) = (&enc.library, d_library.as_mut()) {
        let prior = model.library_prior();
        for i in 0..n {
            let (prior_mean, prior_var) = prior[codes[i]];
            let (value, dm, dlv) = kl_normal(
                lib[(i, 0)] as f64,
                lib[(i, 1)] as f64,
                prior_mean as f64,
                prior_var as f64,
            );
            kl += value;
            d_lib[(i, 0)] = kl_weight * scale * dm as f32;
            d_lib[(i, 1)] = kl_weight * scale * dlv as f32;
        }
    }

    // prototype alignment
    let mut alignment_loss = 0_f64;
    let mut prototype_sq = Vec::new();
    let mut align_weight = 0_f32;
    if let Some((term, weight)) = alignment {
        align_weight = weight;
        for (i, &cell) in cells.iter().enumerate() {
            if let Some(proto) = term.assignment[cell] {
                let mut sq = 0_f64;
                for d in 0..latent_dim {
                    let diff = enc.mean[(i, d)] - term.codes[(proto, d)];
                    sq += (diff * diff) as f64;
                    d_mean[(i, d)] += 2.0 * weight * scale * diff;
                }
                alignment_loss += sq;
                prototype_sq.push((proto, sq));
            }
        }
    }

    let total = reconstruction + kl_weight as f64 * kl + align_weight as f64 * alignment_loss;
    let outcome = StepOutcome {
        reconstruction,
        kl,
        alignment: alignment_loss,
        total,
        prototype_sq,
    };
    if !total.is_finite() {
        return outcome;
    }

    // backward through the decoder; always needed to reach the encoder
    let d_logits = Mat::from_fn(n, model.n_genes(), |i, g| -scale * nb.d_logits[(i, g)]);
    let d_log_theta: Vec<f32> = nb
        .d_log_theta
        .iter()
        .map(|&d| -(scale as f64 * d) as f32)
        .collect();
    let d_z = model.decoder.backward(&dec, &d_logits, &d_log_theta);

    if update.encoder {
        for i in 0..n {
            for d in 0..latent_dim {
                let std = (0.5 * enc.log_var[(i, d)]).exp();
                d_mean[(i, d)] += d_z[(i, d)];
                d_log_var[(i, d)] += d_z[(i, d)] * eps[(i, d)] * 0.5 * std;
            }
        }
        if let (Some(lib), Some(d_lib)) = (&enc.library, d_library.as_mut()) {
            for i in 0..n {
                let d_s = -scale * nb.d_log_library[i];
                let std = (0.5 * lib[(i, 1)]).exp();
                d_lib[(i, 0)] += d_s;
                d_lib[(i, 1)] += d_s * library_eps[i] * 0.5 * std;
            }
        }
        model
            .encoder
            .backward(&enc, &d_mean, &d_log_var, d_library.as_ref());
    }

    outcome
}

///////////////////
// Training loop //
///////////////////

/// Minibatch training of one species model
///
/// Cells are reshuffled every epoch with a seeded RNG. After every epoch
/// the parameters are snapshotted in memory; a non-finite loss (or
/// non-finite parameters after an update) restores the last snapshot and
/// stops with `NonFiniteLoss`.
///
/// ### Params
///
/// * `model` - Model to train; only the components in `update` move
/// * `dataset` - Training data for the model's species
/// * `params` - The `TrainParams`
/// * `update` - Components that get optimiser steps
/// * `alignment` - Optional prototype alignment term
/// * `checkpoint` - Optional store to write the components into
/// * `label` - Name used in progress messages
///
/// ### Returns
///
/// The `TrainingHistory`
pub(crate) fn train_model(
    model: &mut SpeciesModel,
    dataset: &SpeciesDataset,
    params: &TrainParams,
    update: UpdateSet,
    alignment: Option<AlignmentTerm>,
    checkpoint: Option<CheckpointTarget>,
    label: &str,
) -> AlignResult<TrainingHistory> {
    model.check_dataset(dataset)?;
    if let Some(term) = &alignment {
        if term.assignment.len() != dataset.n_cells() {
            return Err(AlignError::data(format!(
                "Alignment assignment covers {} cells, dataset '{}' has {}",
                term.assignment.len(),
                dataset.name(),
                dataset.n_cells()
            )));
        }
    }

    let n_cells = dataset.n_cells();
    let n_prototypes = alignment.as_ref().map(|a| a.codes.nrows()).unwrap_or(0);
    let track = alignment
        .as_ref()
        .map(|a| a.params.track_prototypes)
        .unwrap_or(false);

    let mut optimiser = Adam::new(params.adam.clone());
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut order: Vec<usize> = (0..n_cells).collect();
    let mut history = TrainingHistory::default();

    let mut last_good = (
        model.snapshot(ModelComponent::Encoder),
        model.snapshot(ModelComponent::Decoder),
    );
    let mut last_finite_epoch: Option<usize> = None;

    let start_total = Instant::now();

    for epoch in 0..params.epochs {
        let start_epoch = Instant::now();
        order.shuffle(&mut rng);

        let kl_weight = kl_weight_at(epoch, params.kl_warmup_epochs);
        let align_weight = alignment
            .as_ref()
            .map(|a| a.params.weight_at(epoch, params.epochs))
            .unwrap_or(0.0);

        let mut reconstruction = 0_f64;
        let mut kl = 0_f64;
        let mut alignment_loss = 0_f64;
        let mut proto_sums = vec![(0_f64, 0_usize); n_prototypes];

        for (batch_idx, chunk) in order.chunks(params.batch_size).enumerate() {
            model.zero_grad();
            let outcome = minibatch_step(
                model,
                dataset,
                chunk,
                kl_weight,
                alignment.as_ref().map(|a| (a, align_weight)),
                update,
                &mut rng,
            );

            if outcome.total.is_finite() {
                let mut to_update = Vec::new();
                if update.encoder {
                    to_update.extend(model.encoder.params_mut());
                }
                if update.decoder {
                    to_update.extend(model.decoder.params_mut());
                }
                optimiser.step(to_update);
            }

            if !outcome.total.is_finite() || !model_is_finite(model) {
                restore_snapshot(model, &last_good)?;
                warn!(
                    species = dataset.name(),
                    epoch,
                    batch = batch_idx,
                    "Non-finite loss; restored parameters of the last finite epoch"
                );
                return Err(AlignError::NonFiniteLoss {
                    epoch,
                    batch: batch_idx,
                    last_finite_epoch,
                });
            }

            reconstruction += outcome.reconstruction;
            kl += outcome.kl;
            alignment_loss += outcome.alignment;
            for (proto, sq) in outcome.prototype_sq {
                proto_sums[proto].0 += sq;
                proto_sums[proto].1 += 1;
            }
        }

        let n = n_cells as f64;
        let entry = EpochLoss {
            epoch,
            reconstruction: reconstruction / n,
            kl: kl / n,
            alignment: alignment_loss / n,
            total: (reconstruction + kl_weight as f64 * kl + align_weight as f64 * alignment_loss)
                / n,
            kl_weight,
            alignment_weight: align_weight,
            seconds: start_epoch.elapsed().as_secs_f64(),
        };

        if params.verbose {
            println!(
                "{} epoch {} / {}: loss {:.3} (reconstruction {:.3}, kl {:.3}, alignment {:.3}) in {:.2?}",
                label,
                epoch + 1,
                params.epochs,
                entry.total,
                entry.reconstruction,
                entry.kl,
                entry.alignment,
                start_epoch.elapsed()
            );
        }

        history.epochs.push(entry);
        if track {
            history.prototype_distances.push(
                proto_sums
                    .iter()
                    .map(|&(sum, count)| {
                        if count > 0 {
                            Some((sum / count as f64) as f32)
                        } else {
                            None
                        }
                    })
                    .collect(),
            );
        }

        last_good = (
            model.snapshot(ModelComponent::Encoder),
            model.snapshot(ModelComponent::Decoder),
        );
        last_finite_epoch = Some(epoch);

        if let (Some(target), Some(every)) = (&checkpoint, params.checkpoint_every) {
            if (epoch + 1) % every == 0 && epoch + 1 < params.epochs {
                target.store.save(target.tag, &last_good.0)?;
                target.store.save(target.tag, &last_good.1)?;
            }
        }
    }

    if let Some(target) = &checkpoint {
        target.store.save(target.tag, &last_good.0)?;
        target.store.save(target.tag, &last_good.1)?;
    }

    if params.verbose {
        println!(
            "{}: finished {} epochs in {:.2?}",
            label,
            params.epochs,
            start_total.elapsed()
        );
    }

    Ok(history)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{generate_two_species_data, SyntheticPairParams};
    use crate::core::nn::optimiser::AdamParams;
    use crate::single_cell::alignment::config::ModelParams;

    fn train_params(epochs: usize) -> TrainParams {
        TrainParams {
            epochs,
            batch_size: 16,
            adam: AdamParams {
                learning_rate: 5e-3,
                ..AdamParams::default()
            },
            kl_warmup_epochs: 3,
            checkpoint_every: None,
            seed: 1,
            verbose: false,
        }
    }

    fn model_params(library_mode: LibraryMode) -> ModelParams {
        ModelParams {
            latent_dim: 4,
            hidden_dim: 16,
            library_mode,
            seed: 3,
        }
    }

    const FULL: UpdateSet = UpdateSet {
        encoder: true,
        decoder: true,
    };

    #[test]
    fn test_kl_warmup() {
        assert_eq!(kl_weight_at(0, 0), 1.0);
        assert!((kl_weight_at(0, 4) - 0.25).abs() < 1e-6);
        assert_eq!(kl_weight_at(10, 4), 1.0);
    }

    #[test]
    fn test_training_reduces_loss() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        for mode in [LibraryMode::Observed, LibraryMode::Latent] {
            let mut model = SpeciesModel::for_dataset(&pair.context, &model_params(mode)).unwrap();
            let history =
                train_model(&mut model, &pair.context, &train_params(30), FULL, None, None, "test")
                    .unwrap();
            assert_eq!(history.epochs.len(), 30);
            let first = history.epochs[0].reconstruction;
            let last = history.epochs[29].reconstruction;
            assert!(last < first, "{:?}: {} -> {}", mode, first, last);
            assert!(history.prototype_distances.is_empty());
        }
    }

    #[test]
    fn test_seeded_training_is_reproducible() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let run = || {
            let mut model =
                SpeciesModel::for_dataset(&pair.context, &model_params(LibraryMode::Observed))
                    .unwrap();
            let history =
                train_model(&mut model, &pair.context, &train_params(5), FULL, None, None, "test")
                    .unwrap();
            (history, model.encode(&pair.context).unwrap())
        };
        let (h1, l1) = run();
        let (h2, l2) = run();
        for (a, b) in h1.epochs.iter().zip(h2.epochs.iter()) {
            assert!((a.total - b.total).abs() <= 1e-6 * (1.0 + a.total.abs()));
        }
        for i in 0..l1.n_cells() {
            for d in 0..l1.latent_dim() {
                assert!((l1.mean[(i, d)] - l2.mean[(i, d)]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_alignment_pulls_means_to_prototypes() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let n = pair.target.n_cells();
        let codes = Mat::from_fn(2, 4, |p, d| if d == 0 { 3.0 * (p as f32 * 2.0 - 1.0) } else { 0.0 });
        let assignment: Vec<Option<usize>> =
            (0..n).map(|i| if i % 5 == 0 { None } else { Some(i % 2) }).collect();
        let align = AlignmentParams {
            weight_start: 20.0,
            weight_end: 5.0,
            track_prototypes: true,
        };

        let mut model =
            SpeciesModel::for_dataset(&pair.target, &model_params(LibraryMode::Observed)).unwrap();
        let history = train_model(
            &mut model,
            &pair.target,
            &train_params(25),
            FULL,
            Some(AlignmentTerm {
                codes: &codes,
                assignment: &assignment,
                params: &align,
            }),
            None,
            "test",
        )
        .unwrap();

        assert_eq!(history.prototype_distances.len(), 25);
        let first = history.prototype_distances[0][0].unwrap();
        let last = history.prototype_distances[24][0].unwrap();
        assert!(last < first);
        assert!(history.epochs[0].alignment_weight > history.epochs[24].alignment_weight);
    }

    #[test]
    fn test_non_finite_loss_restores_parameters() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let mut model =
            SpeciesModel::for_dataset(&pair.context, &model_params(LibraryMode::Observed)).unwrap();
        let before = model.snapshot(ModelComponent::Decoder);

        // an infinite prototype makes the alignment loss diverge immediately
        let codes = Mat::from_fn(1, 4, |_, _| f32::INFINITY);
        let assignment = vec![Some(0); pair.context.n_cells()];
        let align = AlignmentParams::default();
        let err = train_model(
            &mut model,
            &pair.context,
            &train_params(3),
            FULL,
            Some(AlignmentTerm {
                codes: &codes,
                assignment: &assignment,
                params: &align,
            }),
            None,
            "test",
        );

        match err {
            Err(AlignError::NonFiniteLoss {
                epoch,
                batch,
                last_finite_epoch,
            }) => {
                assert_eq!((epoch, batch, last_finite_epoch), (0, 0, None));
            }
            other => panic!("expected NonFiniteLoss, got {:?}", other.map(|_| ())),
        }
        assert_eq!(model.snapshot(ModelComponent::Decoder), before);
    }

    #[test]
    fn test_checkpoints_are_written() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let mut model =
            SpeciesModel::for_dataset(&pair.context, &model_params(LibraryMode::Observed)).unwrap();
        let params = TrainParams {
            checkpoint_every: Some(1),
            ..train_params(2)
        };
        train_model(
            &mut model,
            &pair.context,
            &params,
            FULL,
            None,
            Some(CheckpointTarget {
                store: &store,
                tag: "ctx",
            }),
            "test",
        )
        .unwrap();

        let stored = store.load("ctx", ModelComponent::Encoder).unwrap();
        assert_eq!(stored, model.snapshot(ModelComponent::Encoder));
    }
}
