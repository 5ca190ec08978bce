use crate::core::data::dataset::SpeciesDataset;
use crate::error::AlignResult;
use crate::single_cell::alignment::checkpoint::CheckpointStore;
use crate::single_cell::alignment::config::{ContextTrainMode, TrainParams};
use crate::single_cell::alignment::model::{LatentCodes, SpeciesModel};
use crate::single_cell::alignment::training::{
    train_model, CheckpointTarget, TrainingHistory, UpdateSet,
};

/// Result of fitting the context model
///
/// ### Fields
///
/// * `mode` - Which components were trained
/// * `history` - Loss curve
/// * `latent` - Posterior of every context cell after training
#[derive(Clone, Debug)]
pub struct ContextFit {
    pub mode: ContextTrainMode,
    pub history: TrainingHistory,
    pub latent: LatentCodes,
}

/// Fit the context species model by maximising the ELBO
///
/// ### Params
///
/// * `model` - Context model; updated in place
/// * `dataset` - Context data
/// * `params` - Training settings
/// * `mode` - `Full`, or `DecoderOnly` to keep the encoder frozen
/// * `checkpoint` - Optional store and tag for the trained components
///
/// ### Returns
///
/// The `ContextFit`, or `NonFiniteLoss` after restoring the last finite
/// parameters.
pub fn fit_context_model(
    model: &mut SpeciesModel,
    dataset: &SpeciesDataset,
    params: &TrainParams,
    mode: ContextTrainMode,
    checkpoint: Option<(&CheckpointStore, &str)>,
) -> AlignResult<ContextFit> {
    let update = match mode {
        ContextTrainMode::Full => UpdateSet {
            encoder: true,
            decoder: true,
        },
        ContextTrainMode::DecoderOnly => UpdateSet {
            encoder: false,
            decoder: true,
        },
    };
    let label = format!("Context '{}' ({:?})", dataset.name(), mode);

    let history = train_model(
        model,
        dataset,
        params,
        update,
        None,
        checkpoint.map(|(store, tag)| CheckpointTarget { store, tag }),
        &label,
    )?;
    let latent = model.encode(dataset)?;

    Ok(ContextFit {
        mode,
        history,
        latent,
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{generate_two_species_data, SyntheticPairParams};
    use crate::single_cell::alignment::checkpoint::ModelComponent;
    use crate::single_cell::alignment::config::{LibraryMode, ModelParams};

    fn setup() -> (SpeciesDataset, SpeciesModel, TrainParams) {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let model = SpeciesModel::for_dataset(
            &pair.context,
            &ModelParams {
                latent_dim: 3,
                hidden_dim: 16,
                library_mode: LibraryMode::Observed,
                seed: 5,
            },
        )
        .unwrap();
        let params = TrainParams {
            epochs: 4,
            batch_size: 16,
            ..TrainParams::default()
        };
        (pair.context, model, params)
    }

    #[test]
    fn test_full_fit_returns_latent() {
        let (data, mut model, params) = setup();
        let fit = fit_context_model(&mut model, &data, &params, ContextTrainMode::Full, None).unwrap();
        assert_eq!(fit.history.epochs.len(), 4);
        assert_eq!(fit.latent.n_cells(), data.n_cells());
        assert_eq!(fit.latent.latent_dim(), 3);
    }

    #[test]
    fn test_decoder_only_keeps_encoder() {
        let (data, mut model, params) = setup();
        let encoder_before = model.snapshot(ModelComponent::Encoder);
        let decoder_before = model.snapshot(ModelComponent::Decoder);

        fit_context_model(&mut model, &data, &params, ContextTrainMode::DecoderOnly, None).unwrap();

        assert_eq!(model.snapshot(ModelComponent::Encoder), encoder_before);
        assert_ne!(model.snapshot(ModelComponent::Decoder), decoder_before);
    }

    #[test]
    fn test_context_fit_is_reproducible() {
        let (data, model, params) = setup();
        let mut a = model.clone();
        let mut b = model;
        let fit_a = fit_context_model(&mut a, &data, &params, ContextTrainMode::Full, None).unwrap();
        let fit_b = fit_context_model(&mut b, &data, &params, ContextTrainMode::Full, None).unwrap();
        for (x, y) in fit_a.history.epochs.iter().zip(fit_b.history.epochs.iter()) {
            assert!((x.total - y.total).abs() <= 1e-6 * (1.0 + x.total.abs()));
        }
    }
}
