use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::core::data::dataset::SpeciesDataset;
use crate::core::data::homology::HomologyMap;
use crate::error::{AlignError, AlignResult};
use crate::single_cell::alignment::checkpoint::{CheckpointStore, ModelComponent};
use crate::single_cell::alignment::config::{
    AlignmentConfig, ContextTrainMode, ModelParams, SpeciesConfig, TargetTrainMode,
};
use crate::single_cell::alignment::context_trainer::{fit_context_model, ContextFit};
use crate::single_cell::alignment::data_neighbours::{compute_data_neighbours, DataNeighbours};
use crate::single_cell::alignment::label_transfer::{
    transfer_labels, LabelKeyPair, LabelTransferResult,
};
use crate::single_cell::alignment::lfc::{compute_lfc, LfcParams, LfcResult, LfcSide};
use crate::single_cell::alignment::model::{LatentCodes, LatentExport, SpeciesModel};
use crate::single_cell::alignment::prototypes::{
    assign_prototypes, select_prototypes, AlignmentWarning, PrototypeAssignment, PrototypeSet,
};
use crate::single_cell::alignment::target_trainer::{fit_target_model, TargetFit};
use crate::single_cell::alignment::training::TrainingHistory;

///////////
// Types //
///////////

/// Which of the two models of a run an operation addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelRole {
    Context,
    Target,
}

/// Serialisable record of a run
///
/// ### Fields
///
/// * `context_species` - Name of the context species
/// * `target_species` - Name of the target species
/// * `latent_dim` - Width of the shared latent space
/// * `context_history` - Loss curve of the last context fit
/// * `target_history` - Loss curve of the last target fit
/// * `warnings` - Prototype assignment warnings
/// * `context_latent` - Latent codes of the context cells, if fitted
/// * `target_latent` - Latent codes of the target cells, if fitted
/// * `label_transfer` - Label transfer results the caller attached
/// * `lfc` - Fold change results the caller attached
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub context_species: String,
    pub target_species: String,
    pub latent_dim: usize,
    pub context_history: Option<TrainingHistory>,
    pub target_history: Option<TrainingHistory>,
    pub warnings: Vec<AlignmentWarning>,
    pub context_latent: Option<LatentExport>,
    pub target_latent: Option<LatentExport>,
    pub label_transfer: Vec<LabelTransferResult>,
    pub lfc: Option<LfcResult>,
}

/////////////
// Helpers //
/////////////

/// Check a dataset against its species settings
fn check_species(
    dataset: &SpeciesDataset,
    config: &SpeciesConfig,
    required_labels: bool,
) -> AlignResult<()> {
    if dataset.name() != config.name {
        return Err(AlignError::config(format!(
            "Dataset '{}' given for species '{}'",
            dataset.name(),
            config.name
        )));
    }
    if dataset.batch().key != config.batch_key {
        return Err(AlignError::config(format!(
            "Species '{}' expects batch key '{}', dataset has '{}'",
            config.name,
            config.batch_key,
            dataset.batch().key
        )));
    }
    if dataset.gene_naming() != config.gene_naming {
        return Err(AlignError::config(format!(
            "Species '{}' expects {:?} gene names, dataset has {:?}",
            config.name,
            config.gene_naming,
            dataset.gene_naming()
        )));
    }
    if required_labels {
        for key in &config.cell_type_keys {
            dataset.require_label(key)?;
        }
    }
    Ok(())
}

//////////
// Main //
//////////

/// One context/target alignment
///
/// Owns both datasets and both models. Every step returns its own result
/// object; the run only keeps what later steps need (latent codes,
/// prototypes and the loss curves for the summary).
///
/// ### Fields
///
/// * `config` - The validated `AlignmentConfig`
/// * `context` - Context species data
/// * `target` - Target species data
/// * `homology` - Gene correspondence between the two
/// * `neighbours` - Data-level neighbours of the target cells
/// * `context_model` - Model of the context species
/// * `target_model` - Model of the target species
/// * `store` - Optional checkpoint store
pub struct AlignmentRun {
    config: AlignmentConfig,
    context: SpeciesDataset,
    target: SpeciesDataset,
    homology: HomologyMap,
    neighbours: DataNeighbours,
    context_model: SpeciesModel,
    target_model: SpeciesModel,
    store: Option<CheckpointStore>,
    context_latent: Option<LatentCodes>,
    target_latent: Option<LatentCodes>,
    prototypes: Option<PrototypeSet>,
    assignment: Option<PrototypeAssignment>,
    context_history: Option<TrainingHistory>,
    target_history: Option<TrainingHistory>,
}

impl AlignmentRun {
    /// Assemble a run and initialise both models
    ///
    /// All configuration problems surface here, before any training.
    ///
    /// ### Params
    ///
    /// * `config` - The `AlignmentConfig`
    /// * `context` - Context species data
    /// * `target` - Target species data
    /// * `homology` - Gene correspondence; must not be empty
    /// * `neighbours` - Data-level neighbours per target cell. `None`
    ///   computes them on the homologous genes.
    ///
    /// ### Returns
    ///
    /// The run, or `Config`, `MissingLabelKey`, `EmptyHomology` or
    /// `DataMismatch`.
    pub fn new(
        config: AlignmentConfig,
        context: SpeciesDataset,
        target: SpeciesDataset,
        homology: HomologyMap,
        neighbours: Option<DataNeighbours>,
    ) -> AlignResult<Self> {
        config.validate()?;
        check_species(&context, &config.context, true)?;
        check_species(&target, &config.target, false)?;

        if homology.is_empty() {
            return Err(AlignError::EmptyHomology {
                context: context.name().to_string(),
                target: target.name().to_string(),
            });
        }
        if let Some(&(c, t)) = homology
            .pairs()
            .iter()
            .find(|&&(c, t)| c >= context.n_genes() || t >= target.n_genes())
        {
            return Err(AlignError::data(format!(
                "Homology pair ({}, {}) out of range for {} context / {} target genes",
                c,
                t,
                context.n_genes(),
                target.n_genes()
            )));
        }

        let neighbours = match neighbours {
            Some(nn) => {
                if nn.n_target() != target.n_cells() || nn.n_context() != context.n_cells() {
                    return Err(AlignError::data(format!(
                        "Data-level neighbours cover {} target / {} context cells, datasets have {} / {}",
                        nn.n_target(),
                        nn.n_context(),
                        target.n_cells(),
                        context.n_cells()
                    )));
                }
                nn
            }
            None => {
                compute_data_neighbours(&context, &target, &homology, config.data_neighbours_k)?
            }
        };

        let context_model = SpeciesModel::for_dataset(&context, &config.model)?;
        let target_model = SpeciesModel::for_dataset(
            &target,
            &ModelParams {
                seed: config.model.seed.wrapping_add(1),
                ..config.model.clone()
            },
        )?;

        Ok(Self {
            config,
            context,
            target,
            homology,
            neighbours,
            context_model,
            target_model,
            store: None,
            context_latent: None,
            target_latent: None,
            prototypes: None,
            assignment: None,
            context_history: None,
            target_history: None,
        })
    }

    /// Replace the freshly initialised models, e.g. with pretrained ones
    ///
    /// ### Returns
    ///
    /// The run, `LatentWidthMismatch` if a model deviates from the run's
    /// latent width, or `DataMismatch` if it does not fit its dataset.
    pub fn with_models(
        mut self,
        context_model: SpeciesModel,
        target_model: SpeciesModel,
    ) -> AlignResult<Self> {
        let width = self.config.model.latent_dim;
        context_model.check_latent_width("context model", width)?;
        target_model.check_latent_width("target model", width)?;
        context_model.check_dataset(&self.context)?;
        target_model.check_dataset(&self.target)?;

        self.context_model = context_model;
        self.target_model = target_model;
        self.context_latent = None;
        self.target_latent = None;
        self.prototypes = None;
        self.assignment = None;
        Ok(self)
    }

    /// Attach a checkpoint store; fits then save under the configured tags
    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    pub fn context(&self) -> &SpeciesDataset {
        &self.context
    }

    pub fn target(&self) -> &SpeciesDataset {
        &self.target
    }

    pub fn homology(&self) -> &HomologyMap {
        &self.homology
    }

    pub fn neighbours(&self) -> &DataNeighbours {
        &self.neighbours
    }

    pub fn context_model(&self) -> &SpeciesModel {
        &self.context_model
    }

    pub fn target_model(&self) -> &SpeciesModel {
        &self.target_model
    }

    pub fn prototypes(&self) -> Option<&PrototypeSet> {
        self.prototypes.as_ref()
    }

    pub fn assignment(&self) -> Option<&PrototypeAssignment> {
        self.assignment.as_ref()
    }

    /// Latent codes of the context cells under the current context model
    pub fn context_latent(&self) -> AlignResult<LatentCodes> {
        match &self.context_latent {
            Some(latent) => Ok(latent.clone()),
            None => self.context_model.encode(&self.context),
        }
    }

    /// Latent codes of the target cells under the current target model
    pub fn target_latent(&self) -> AlignResult<LatentCodes> {
        match &self.target_latent {
            Some(latent) => Ok(latent.clone()),
            None => self.target_model.encode(&self.target),
        }
    }

    fn context_changed(&mut self, fit: &ContextFit) {
        self.context_latent = Some(fit.latent.clone());
        self.context_history = Some(fit.history.clone());
        self.prototypes = None;
        self.assignment = None;
    }

    /// Train the context model (encoder and decoder)
    pub fn fit_context(&mut self) -> AlignResult<ContextFit> {
        self.run_context(ContextTrainMode::Full)
    }

    /// Retrain only the context decoder, keeping the encoder and thereby the
    /// context latent space fixed
    pub fn refit_context_decoder(&mut self) -> AlignResult<ContextFit> {
        self.run_context(ContextTrainMode::DecoderOnly)
    }

    fn run_context(&mut self, mode: ContextTrainMode) -> AlignResult<ContextFit> {
        let checkpoint = self.store.as_ref().map(|s| (s, self.config.context_tag.as_str()));
        let fit = fit_context_model(
            &mut self.context_model,
            &self.context,
            &self.config.context_training,
            mode,
            checkpoint,
        )?;
        self.context_changed(&fit);
        Ok(fit)
    }

    /// Select the prototypes on the context latent space and assign one to
    /// every target cell
    ///
    /// ### Returns
    ///
    /// The `PrototypeSet`, or `MissingLabelKey` for a missing cluster column.
    pub fn select_prototypes(&mut self) -> AlignResult<&PrototypeSet> {
        let start = Instant::now();
        let latent = self.context_latent()?;
        let prototypes = select_prototypes(&self.context, &latent, &self.config.prototypes)?;
        let assignment =
            assign_prototypes(&prototypes, &self.neighbours, &latent, &self.config.prototypes);

        if self.config.target_training.verbose {
            println!(
                "Selected {} prototypes in {} clusters, {} of {} target cells assigned in {:.2?}",
                prototypes.n_prototypes(),
                prototypes.n_clusters(),
                assignment.n_assigned(),
                self.target.n_cells(),
                start.elapsed()
            );
        }

        self.context_latent = Some(latent);
        self.assignment = Some(assignment);
        Ok(&*self.prototypes.insert(prototypes))
    }

    /// Train the target model with the prototype alignment loss
    ///
    /// Prototypes get selected first if that has not happened since the last
    /// change of the context model.
    ///
    /// ### Params
    ///
    /// * `mode` - `Full`, or `TransferOnly` to keep the target decoder frozen
    ///
    /// ### Returns
    ///
    /// The `TargetFit`
    pub fn fit_target(&mut self, mode: TargetTrainMode) -> AlignResult<TargetFit> {
        if self.prototypes.is_none() || self.assignment.is_none() {
            self.select_prototypes()?;
        }
        let checkpoint = self.store.as_ref().map(|s| (s, self.config.target_tag.as_str()));
        let (Some(prototypes), Some(assignment)) = (&self.prototypes, &self.assignment) else {
            return Err(AlignError::config("Prototypes are not available"));
        };

        let fit = fit_target_model(
            &mut self.target_model,
            &self.target,
            prototypes,
            assignment,
            &self.config.target_training,
            &self.config.alignment,
            mode,
            checkpoint,
        )?;
        self.target_latent = Some(fit.latent.clone());
        self.target_history = Some(fit.history.clone());
        Ok(fit)
    }

    /// Transfer labels from the context to the run's target cells
    ///
    /// ### Params
    ///
    /// * `pairs` - Label key pairs to evaluate
    /// * `k` - Latent neighbours per target cell
    ///
    /// ### Returns
    ///
    /// One `LabelTransferResult` per pair, with the data-level baseline.
    pub fn evaluate_label_transfer(
        &self,
        pairs: &[LabelKeyPair],
        k: usize,
    ) -> AlignResult<Vec<LabelTransferResult>> {
        let ctx_latent = self.context_latent()?;
        let tgt_latent = self.target_latent()?;
        pairs
            .iter()
            .map(|keys| {
                transfer_labels(
                    &self.context,
                    &ctx_latent,
                    &self.target,
                    &tgt_latent,
                    Some(&self.neighbours),
                    keys,
                    k,
                )
            })
            .collect()
    }

    /// Transfer labels to cells of the target species the run was not
    /// trained on, e.g. a held out subset
    ///
    /// ### Params
    ///
    /// * `cells` - Target species cells with the run's genes and batches
    /// * `pairs` - Label key pairs to evaluate
    /// * `k` - Latent neighbours per cell
    ///
    /// ### Returns
    ///
    /// One `LabelTransferResult` per pair, without baseline.
    pub fn transfer_to(
        &self,
        cells: &SpeciesDataset,
        pairs: &[LabelKeyPair],
        k: usize,
    ) -> AlignResult<Vec<LabelTransferResult>> {
        let ctx_latent = self.context_latent()?;
        let latent = self.target_model.encode(cells)?;
        pairs
            .iter()
            .map(|keys| transfer_labels(&self.context, &ctx_latent, cells, &latent, None, keys, k))
            .collect()
    }

    /// Log2 fold changes of context vs target per shared cell type
    pub fn compute_lfc(&self, params: &LfcParams) -> AlignResult<LfcResult> {
        let ctx_latent = self.context_latent()?;
        let tgt_latent = self.target_latent()?;
        let context = LfcSide::context(
            &self.context,
            &self.context_model,
            &ctx_latent,
            &self.homology,
        )?;
        let target =
            LfcSide::target(&self.target, &self.target_model, &tgt_latent, &self.homology)?;
        compute_lfc(&context, &target, params)
    }

    /// Copy a stored component into one of the run's models
    ///
    /// Shapes and latent width are validated before anything is written.
    ///
    /// ### Params
    ///
    /// * `store` - Store to read from
    /// * `source_tag` - Tag the component was saved under
    /// * `component` - Encoder or decoder
    /// * `role` - Model that receives the parameters
    ///
    /// ### Returns
    ///
    /// `Ok(())`, `CheckpointNotFound`, `LatentWidthMismatch` or
    /// `ShapeMismatch`.
    pub fn import_parameters(
        &mut self,
        store: &CheckpointStore,
        source_tag: &str,
        component: ModelComponent,
        role: ModelRole,
    ) -> AlignResult<()> {
        let snapshot = store.load(source_tag, component)?;
        match role {
            ModelRole::Context => {
                self.context_model.restore(&snapshot)?;
                if component == ModelComponent::Encoder {
                    self.context_latent = None;
                    self.prototypes = None;
                    self.assignment = None;
                }
            }
            ModelRole::Target => {
                self.target_model.restore(&snapshot)?;
                if component == ModelComponent::Encoder {
                    self.target_latent = None;
                }
            }
        }
        Ok(())
    }

    /// Serialisable record of the run so far
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            context_species: self.context.name().to_string(),
            target_species: self.target.name().to_string(),
            latent_dim: self.config.model.latent_dim,
            context_history: self.context_history.clone(),
            target_history: self.target_history.clone(),
            warnings: self
                .assignment
                .as_ref()
                .map(|a| a.warnings.clone())
                .unwrap_or_default(),
            context_latent: self.context_latent.as_ref().map(|l| l.to_export()),
            target_latent: self.target_latent.as_ref().map(|l| l.to_export()),
            label_transfer: Vec::new(),
            lfc: None,
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::synthetic_data::{
        generate_two_species_data, SyntheticPair, SyntheticPairParams, BATCH_KEY, COARSE_KEY,
        FINE_KEY,
    };
    use crate::core::nn::optimiser::AdamParams;
    use crate::single_cell::alignment::checkpoint::{load_results, save_results};
    use crate::single_cell::alignment::config::{LibraryMode, TrainParams};
    use statrs::distribution::{Binomial, DiscreteCDF};

    fn config(pair: &SyntheticPair) -> AlignmentConfig {
        let mut context = SpeciesConfig::new(pair.context.name(), &[COARSE_KEY, FINE_KEY]);
        context.batch_key = BATCH_KEY.to_string();
        let mut target = SpeciesConfig::new(pair.target.name(), &[COARSE_KEY]);
        target.batch_key = BATCH_KEY.to_string();

        let train = TrainParams {
            epochs: 60,
            batch_size: 16,
            adam: AdamParams {
                learning_rate: 1e-2,
                ..AdamParams::default()
            },
            kl_warmup_epochs: 10,
            ..TrainParams::default()
        };

        let mut config = AlignmentConfig::new(context, target);
        config.model = ModelParams {
            latent_dim: 4,
            hidden_dim: 32,
            library_mode: LibraryMode::Observed,
            seed: 3,
        };
        config.context_training = train.clone();
        config.target_training = train;
        config.prototypes.cluster_key = Some(COARSE_KEY.to_string());
        config.data_neighbours_k = 5;
        config
    }

    #[test]
    fn test_end_to_end_held_out_transfer() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let train_cells: Vec<usize> = (0..35).collect();
        let held_out_cells: Vec<usize> = (35..50).collect();
        let train_target = pair.target.subset_cells(&train_cells).unwrap();
        let held_out = pair.target.subset_cells(&held_out_cells).unwrap();

        let mut run = AlignmentRun::new(
            config(&pair),
            pair.context.clone(),
            train_target,
            pair.homology.clone(),
            None,
        )
        .unwrap();

        let ctx_fit = run.fit_context().unwrap();
        assert_eq!(ctx_fit.latent.latent_dim(), 4);

        let n_prototypes = run.select_prototypes().unwrap().n_prototypes();
        assert_eq!(n_prototypes, 2);

        let tgt_fit = run.fit_target(TargetTrainMode::Full).unwrap();
        assert_eq!(tgt_fit.latent.n_cells(), 35);
        assert_eq!(tgt_fit.latent.latent_dim(), 4);

        let keys = [LabelKeyPair::new(COARSE_KEY, COARSE_KEY)];
        let held = run.transfer_to(&held_out, &keys, 1).unwrap();
        let truth = held_out.label(COARSE_KEY).unwrap();
        let n_correct = held[0]
            .predicted
            .iter()
            .enumerate()
            .filter(|(i, p)| p.as_str() == truth.value(*i))
            .count();

        // one sided binomial test against guessing between the two types
        let n = held_out.n_cells() as u64;
        let guessing = Binomial::new(0.5, n).unwrap();
        let p_value = match n_correct {
            0 => 1.0,
            k => guessing.sf(k as u64 - 1),
        };
        assert!(
            p_value < 0.05,
            "{} of {} held out cells correct, p = {}",
            n_correct,
            n,
            p_value
        );

        let in_run = run.evaluate_label_transfer(&keys, 1).unwrap();
        assert!(in_run[0].baseline_accuracy.is_some());

        let lfc = run
            .compute_lfc(&LfcParams {
                n_samples: 20,
                ..LfcParams::new(LabelKeyPair::new(COARSE_KEY, COARSE_KEY))
            })
            .unwrap();
        assert_eq!(lfc.groups.len(), 2);

        let summary = run.summary();
        assert_eq!(summary.context_history.unwrap().epochs.len(), 60);
        assert_eq!(summary.target_latent.unwrap().n_cells, 35);
    }

    #[test]
    fn test_prototypes_fixed_during_target_fit() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let mut cfg = config(&pair);
        cfg.context_training.epochs = 3;
        cfg.target_training.epochs = 3;
        let mut run = AlignmentRun::new(
            cfg,
            pair.context.clone(),
            pair.target.clone(),
            pair.homology.clone(),
            None,
        )
        .unwrap();
        run.fit_context().unwrap();

        let selected = run.select_prototypes().unwrap();
        let cells_before = selected.cells.clone();
        let codes_before = selected.codes.clone();

        for mode in [TargetTrainMode::Full, TargetTrainMode::TransferOnly] {
            run.fit_target(mode).unwrap();
            let after = run.prototypes().unwrap();
            assert_eq!(after.cells, cells_before);
            assert_eq!(after.codes, codes_before);
        }
    }

    #[test]
    fn test_construction_errors() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();

        let mut wrong_name = config(&pair);
        wrong_name.context.name = "mouse".to_string();
        wrong_name.context_tag = "mouse_context".to_string();
        let err = AlignmentRun::new(
            wrong_name,
            pair.context.clone(),
            pair.target.clone(),
            pair.homology.clone(),
            None,
        );
        assert!(matches!(err, Err(AlignError::Config { .. })));

        let mut missing_key = config(&pair);
        missing_key.context.cell_type_keys.push("not_there".to_string());
        let err = AlignmentRun::new(
            missing_key,
            pair.context.clone(),
            pair.target.clone(),
            pair.homology.clone(),
            None,
        );
        assert!(matches!(err, Err(AlignError::MissingLabelKey { .. })));

        let empty = HomologyMap::new(Vec::new(), 20, 20).unwrap();
        let err = AlignmentRun::new(
            config(&pair),
            pair.context.clone(),
            pair.target.clone(),
            empty,
            None,
        );
        assert!(matches!(err, Err(AlignError::EmptyHomology { .. })));

        let short = DataNeighbours::from_lists(vec![Vec::new(); 3], 50, 3).unwrap();
        let err = AlignmentRun::new(
            config(&pair),
            pair.context.clone(),
            pair.target.clone(),
            pair.homology.clone(),
            Some(short),
        );
        assert!(matches!(err, Err(AlignError::DataMismatch { .. })));
    }

    #[test]
    fn test_with_models_checks_latent_width() {
        let pair = generate_two_species_data(&SyntheticPairParams::default()).unwrap();
        let run = AlignmentRun::new(
            config(&pair),
            pair.context.clone(),
            pair.target.clone(),
            pair.homology.clone(),
            None,
        )
        .unwrap();
        let wide = ModelParams {
            latent_dim: 6,
            ..run.config().model.clone()
        };
        let ctx = SpeciesModel::for_dataset(&pair.context, &run.config().model).unwrap();
        let tgt = SpeciesModel::for_dataset(&pair.target, &wide).unwrap();
        let err = run.with_models(ctx, tgt);
        assert!(matches!(err, Err(AlignError::LatentWidthMismatch { .. })));
    }

    #[test]
    fn test_checkpoint_import_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let params = SyntheticPairParams {
            target_genes: 25,
            ..SyntheticPairParams::default()
        };
        let pair = generate_two_species_data(&params).unwrap();

        let mut cfg = config(&pair);
        cfg.context_training.epochs = 3;
        let mut run = AlignmentRun::new(
            cfg.clone(),
            pair.context.clone(),
            pair.target.clone(),
            pair.homology.clone(),
            None,
        )
        .unwrap()
        .with_checkpoints(CheckpointStore::new(dir.path()).unwrap());
        run.fit_context().unwrap();
        let tag = cfg.context_tag.clone();
        assert!(store.contains(&tag, ModelComponent::Encoder));
        assert!(store.contains(&tag, ModelComponent::Decoder));

        // a fresh run picks up the trained context decoder
        let mut fresh = AlignmentRun::new(
            cfg,
            pair.context.clone(),
            pair.target.clone(),
            pair.homology.clone(),
            None,
        )
        .unwrap();
        fresh
            .import_parameters(&store, &tag, ModelComponent::Decoder, ModelRole::Context)
            .unwrap();
        assert_eq!(
            fresh.context_model().snapshot(ModelComponent::Decoder),
            run.context_model().snapshot(ModelComponent::Decoder)
        );

        // the context decoder has 20 outputs, the target one 25
        let err =
            fresh.import_parameters(&store, &tag, ModelComponent::Decoder, ModelRole::Target);
        assert!(matches!(err, Err(AlignError::ShapeMismatch { .. })));

        let err =
            fresh.import_parameters(&store, "unknown", ModelComponent::Encoder, ModelRole::Target);
        assert!(matches!(err, Err(AlignError::CheckpointNotFound { .. })));

        let path = dir.path().join("summary.bin");
        let summary = run.summary();
        save_results(&path, &summary).unwrap();
        let loaded: RunSummary = load_results(&path).unwrap();
        assert_eq!(loaded, summary);
    }
}
