use crate::core::data::dataset::SpeciesDataset;
use crate::error::AlignResult;
use crate::single_cell::alignment::checkpoint::CheckpointStore;
use crate::single_cell::alignment::config::{AlignmentParams, TargetTrainMode, TrainParams};
use crate::single_cell::alignment::model::{LatentCodes, SpeciesModel};
use crate::single_cell::alignment::prototypes::{
    AlignmentWarning, PrototypeAssignment, PrototypeSet,
};
use crate::single_cell::alignment::training::{
    train_model, AlignmentTerm, CheckpointTarget, TrainingHistory, UpdateSet,
};

/// Result of fitting the target model
///
/// ### Fields
///
/// * `mode` - Which components were trained
/// * `history` - Loss curve incl. optional per prototype distances
/// * `latent` - Posterior of every target cell after training
/// * `n_aligned` - Target cells that carried an alignment term
/// * `warnings` - Cells or neighbours skipped by the prototype assignment
#[derive(Clone, Debug)]
pub struct TargetFit {
    pub mode: TargetTrainMode,
    pub history: TrainingHistory,
    pub latent: LatentCodes,
    pub n_aligned: usize,
    pub warnings: Vec<AlignmentWarning>,
}

/// Fit the target species model with the prototype alignment loss
///
/// ### Params
///
/// * `model` - Target model; updated in place
/// * `dataset` - Target data
/// * `prototypes` - Fixed prototypes from the context model
/// * `assignment` - Prototype per target cell
/// * `params` - Training settings
/// * `alignment` - Alignment weight schedule and tracking flag
/// * `mode` - `Full`, or `TransferOnly` to keep the decoder frozen
/// * `checkpoint` - Optional store and tag for the trained components
///
/// ### Returns
///
/// The `TargetFit`, `LatentWidthMismatch` if prototype and model widths
/// differ, or `NonFiniteLoss` after restoring the last finite parameters.
#[allow(clippy::too_many_arguments)]
pub fn fit_target_model(
    model: &mut SpeciesModel,
    dataset: &SpeciesDataset,
    prototypes: &PrototypeSet,
    assignment: &PrototypeAssignment,
    params: &TrainParams,
    alignment: &AlignmentParams,
    mode: TargetTrainMode,
    checkpoint: Option<(&CheckpointStore, &str)>,
) -> AlignResult<TargetFit> {
    model.check_latent_width("prototype codes", prototypes.codes.ncols())?;

    let update = match mode {
        TargetTrainMode::Full => UpdateSet {
            encoder: true,
            decoder: true,
        },
        TargetTrainMode::TransferOnly => UpdateSet {
            encoder: true,
            decoder: false,
        },
    };
    let label = format!("Target '{}' ({:?})", dataset.name(), mode);

    let history = train_model(
        model,
        dataset,
        params,
        update,
        Some(AlignmentTerm {
            codes: &prototypes.codes,
            assignment: &assignment.per_cell,
            params: alignment,
        }),
        checkpoint.map(|(store, tag)| CheckpointTarget { store, tag }),
        &label,
    )?;
    let latent = model.encode(dataset)?;

    Ok(TargetFit {
        mode,
        history,
        latent,
        n_aligned: assignment.n_assigned(),
        warnings: assignment.warnings.clone(),
    })
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{
        generate_two_species_data, SyntheticPairParams, COARSE_KEY,
    };
    use crate::error::AlignError;
    use crate::single_cell::alignment::checkpoint::ModelComponent;
    use crate::single_cell::alignment::config::{
        ContextTrainMode, LibraryMode, ModelParams, PrototypeParams,
    };
    use crate::single_cell::alignment::context_trainer::fit_context_model;
    use crate::single_cell::alignment::data_neighbours::compute_data_neighbours;
    use crate::single_cell::alignment::prototypes::{assign_prototypes, select_prototypes};

    fn model_params(latent_dim: usize) -> ModelParams {
        ModelParams {
            latent_dim,
            hidden_dim: 16,
            library_mode: LibraryMode::Observed,
            seed: 9,
        }
    }

    fn train_params() -> TrainParams {
        TrainParams {
            epochs: 5,
            batch_size: 16,
            ..TrainParams::default()
        }
    }

    #[test]
    fn test_transfer_only_freezes_decoder() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let mut context = SpeciesModel::for_dataset(&pair.context, &model_params(3)).unwrap();
        let ctx_fit = fit_context_model(
            &mut context,
            &pair.context,
            &train_params(),
            ContextTrainMode::Full,
            None,
        )
        .unwrap();

        let proto_params = PrototypeParams {
            cluster_key: Some(COARSE_KEY.to_string()),
            ..PrototypeParams::default()
        };
        let prototypes = select_prototypes(&pair.context, &ctx_fit.latent, &proto_params).unwrap();
        let nn = compute_data_neighbours(&pair.context, &pair.target, &pair.homology, 5).unwrap();
        let assignment = assign_prototypes(&prototypes, &nn, &ctx_fit.latent, &proto_params);

        let mut target = SpeciesModel::for_dataset(&pair.target, &model_params(3)).unwrap();
        let decoder_before = target.snapshot(ModelComponent::Decoder);
        let encoder_before = target.snapshot(ModelComponent::Encoder);

        let fit = fit_target_model(
            &mut target,
            &pair.target,
            &prototypes,
            &assignment,
            &train_params(),
            &AlignmentParams {
                track_prototypes: true,
                ..AlignmentParams::default()
            },
            TargetTrainMode::TransferOnly,
            None,
        )
        .unwrap();

        // frozen decoder is bit for bit unchanged, encoder moved
        assert_eq!(target.snapshot(ModelComponent::Decoder), decoder_before);
        assert_ne!(target.snapshot(ModelComponent::Encoder), encoder_before);

        assert_eq!(fit.n_aligned, pair.target.n_cells());
        assert!(fit.warnings.is_empty());
        assert_eq!(fit.history.prototype_distances.len(), 5);
        assert_eq!(fit.history.prototype_distances[0].len(), prototypes.n_prototypes());
    }

    #[test]
    fn test_prototype_width_must_match() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let context = SpeciesModel::for_dataset(&pair.context, &model_params(3)).unwrap();
        let latent = context.encode(&pair.context).unwrap();
        let proto_params = PrototypeParams {
            cluster_key: Some(COARSE_KEY.to_string()),
            ..PrototypeParams::default()
        };
        let prototypes = select_prototypes(&pair.context, &latent, &proto_params).unwrap();
        let nn = compute_data_neighbours(&pair.context, &pair.target, &pair.homology, 5).unwrap();
        let assignment = assign_prototypes(&prototypes, &nn, &latent, &proto_params);

        let mut target = SpeciesModel::for_dataset(&pair.target, &model_params(4)).unwrap();
        let err = fit_target_model(
            &mut target,
            &pair.target,
            &prototypes,
            &assignment,
            &train_params(),
            &AlignmentParams::default(),
            TargetTrainMode::Full,
            None,
        );
        assert!(matches!(err, Err(AlignError::LatentWidthMismatch { .. })));
    }
}
