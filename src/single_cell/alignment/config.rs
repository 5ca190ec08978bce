use crate::core::data::dataset::GeneNaming;
use crate::core::nn::optimiser::AdamParams;
use crate::ensure_config;
use crate::error::AlignResult;
use crate::single_cell::alignment::checkpoint::check_tag;

///////////
// Enums //
///////////

/// How the library size enters the decoder
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LibraryMode {
    /// Use the observed per cell count sum
    Observed,
    /// Infer a log-library latent variable with a per batch log-normal prior
    Latent,
}

/// Helper function to parse the library mode
///
/// ### Params
///
/// * `s` - String to parse
///
/// ### Returns
///
/// Option of the `LibraryMode`
pub fn parse_library_mode(s: &str) -> Option<LibraryMode> {
    match s.to_lowercase().as_str() {
        "observed" | "fixed" => Some(LibraryMode::Observed),
        "latent" | "inferred" => Some(LibraryMode::Latent),
        _ => None,
    }
}

/// Which context cells become alignment prototypes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrototypePolicy {
    /// One prototype per cluster: the cell closest to the cluster centroid
    PerCluster,
    /// Up to `per_cluster` randomly sampled cells per cluster
    Stratified { per_cluster: usize },
}

/// Helper function to parse the prototype policy
///
/// `"stratified"` defaults to five cells per cluster; `"stratified:10"`
/// sets the number explicitly.
///
/// ### Params
///
/// * `s` - String to parse
///
/// ### Returns
///
/// Option of the `PrototypePolicy`
pub fn parse_prototype_policy(s: &str) -> Option<PrototypePolicy> {
    let lower = s.to_lowercase();
    let mut parts = lower.splitn(2, ':');
    match (parts.next()?, parts.next()) {
        ("per_cluster" | "centroid", None) => Some(PrototypePolicy::PerCluster),
        ("stratified", None) => Some(PrototypePolicy::Stratified { per_cluster: 5 }),
        ("stratified", Some(n)) => n
            .trim()
            .parse()
            .ok()
            .map(|per_cluster| PrototypePolicy::Stratified { per_cluster }),
        _ => None,
    }
}

/// How to resolve several equally similar data-level neighbours
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreak {
    /// Majority cluster among the ties; rank order breaks count ties
    MajorityLabel,
    /// Cluster of the best ranked neighbour
    FirstRank,
}

/// Helper function to parse the tie break rule
///
/// ### Params
///
/// * `s` - String to parse
///
/// ### Returns
///
/// Option of the `TieBreak`
pub fn parse_tie_break(s: &str) -> Option<TieBreak> {
    match s.to_lowercase().as_str() {
        "majority" | "majority_label" => Some(TieBreak::MajorityLabel),
        "first" | "first_rank" => Some(TieBreak::FirstRank),
        _ => None,
    }
}

/// Which parts of the context model get updated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextTrainMode {
    Full,
    /// Encoder frozen; refits the generative part only
    DecoderOnly,
}

/// Which parts of the target model get updated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetTrainMode {
    Full,
    /// Decoder frozen; only the encoder moves
    TransferOnly,
}

////////////
// Params //
////////////

/// Per species settings
///
/// ### Fields
///
/// * `name` - Species name; must match the dataset name
/// * `batch_key` - Key of the batch column; must match the dataset
/// * `cell_type_keys` - Label columns that must be present. Required for the
///   context species, optional for the target species.
/// * `gene_naming` - Expected gene naming convention
/// * `min_expression_fraction` - Gene filter threshold used by callers that
///   preprocess through `SpeciesDataset::filter_genes`
#[derive(Clone, Debug)]
pub struct SpeciesConfig {
    pub name: String,
    pub batch_key: String,
    pub cell_type_keys: Vec<String>,
    pub gene_naming: GeneNaming,
    pub min_expression_fraction: f32,
}

impl SpeciesConfig {
    /// Settings with default batch key and gene naming
    pub fn new(name: &str, cell_type_keys: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            batch_key: "batch".to_string(),
            cell_type_keys: cell_type_keys.iter().map(|k| k.to_string()).collect(),
            gene_naming: GeneNaming::Symbol,
            min_expression_fraction: 0.0,
        }
    }
}

/// Network architecture
///
/// ### Fields
///
/// * `latent_dim` - Width of the shared latent space
/// * `hidden_dim` - Width of the hidden layer in encoder and decoder
/// * `library_mode` - Observed or inferred library sizes
/// * `seed` - Seed for the weight initialisation
#[derive(Clone, Debug)]
pub struct ModelParams {
    pub latent_dim: usize,
    pub hidden_dim: usize,
    pub library_mode: LibraryMode,
    pub seed: u64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            latent_dim: 10,
            hidden_dim: 128,
            library_mode: LibraryMode::Observed,
            seed: 42,
        }
    }
}

/// Training loop settings
///
/// ### Fields
///
/// * `epochs` - Number of passes over the data
/// * `batch_size` - Minibatch size
/// * `adam` - Optimiser settings incl. learning rate and gradient clipping
/// * `kl_warmup_epochs` - KL weight rises linearly to one over this many
///   epochs; zero disables warm-up
/// * `checkpoint_every` - Write a checkpoint every n epochs (only with a
///   store attached); the final state is always written
/// * `seed` - Seed for shuffling and reparametrisation noise
/// * `verbose` - Print progress per epoch
#[derive(Clone, Debug)]
pub struct TrainParams {
    pub epochs: usize,
    pub batch_size: usize,
    pub adam: AdamParams,
    pub kl_warmup_epochs: usize,
    pub checkpoint_every: Option<usize>,
    pub seed: u64,
    pub verbose: bool,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            epochs: 40,
            batch_size: 128,
            adam: AdamParams::default(),
            kl_warmup_epochs: 10,
            checkpoint_every: None,
            seed: 42,
            verbose: false,
        }
    }
}

/// Prototype selection and assignment
///
/// ### Fields
///
/// * `policy` - How prototypes are picked
/// * `tie_break` - How tied data-level neighbours are resolved
/// * `tie_tolerance` - Neighbours within this similarity of the best one
///   count as tied
/// * `cluster_key` - Context label column that defines the clusters. `None`
///   clusters the context latent means with k-means.
/// * `n_clusters` - Number of k-means clusters when no label column is used
/// * `seed` - Seed for k-means and stratified sampling
#[derive(Clone, Debug)]
pub struct PrototypeParams {
    pub policy: PrototypePolicy,
    pub tie_break: TieBreak,
    pub tie_tolerance: f32,
    pub cluster_key: Option<String>,
    pub n_clusters: usize,
    pub seed: u64,
}

impl Default for PrototypeParams {
    fn default() -> Self {
        Self {
            policy: PrototypePolicy::PerCluster,
            tie_break: TieBreak::MajorityLabel,
            tie_tolerance: 1e-6,
            cluster_key: None,
            n_clusters: 20,
            seed: 42,
        }
    }
}

/// Alignment loss settings for the target fit
///
/// ### Fields
///
/// * `weight_start` - Alignment weight in the first epoch
/// * `weight_end` - Alignment weight in the last epoch
/// * `track_prototypes` - Record the mean distance per prototype and epoch
#[derive(Clone, Debug)]
pub struct AlignmentParams {
    pub weight_start: f32,
    pub weight_end: f32,
    pub track_prototypes: bool,
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            weight_start: 50.0,
            weight_end: 5.0,
            track_prototypes: false,
        }
    }
}

impl AlignmentParams {
    /// Linear interpolation of the alignment weight over the epochs
    pub fn weight_at(&self, epoch: usize, n_epochs: usize) -> f32 {
        if n_epochs <= 1 {
            return self.weight_start;
        }
        let frac = epoch as f32 / (n_epochs - 1) as f32;
        self.weight_start + (self.weight_end - self.weight_start) * frac
    }
}

/// Full configuration of a context/target alignment run
///
/// ### Fields
///
/// * `context` - Context species settings
/// * `target` - Target species settings
/// * `model` - Shared architecture; the latent width is the run's width
/// * `context_training` - Training settings of the context fit
/// * `target_training` - Training settings of the target fit
/// * `prototypes` - Prototype selection / assignment settings
/// * `alignment` - Alignment loss settings
/// * `data_neighbours_k` - Data-level neighbours per target cell when the run
///   computes them itself
/// * `context_tag` - Checkpoint tag of the context model
/// * `target_tag` - Checkpoint tag of the target model
#[derive(Clone, Debug)]
pub struct AlignmentConfig {
    pub context: SpeciesConfig,
    pub target: SpeciesConfig,
    pub model: ModelParams,
    pub context_training: TrainParams,
    pub target_training: TrainParams,
    pub prototypes: PrototypeParams,
    pub alignment: AlignmentParams,
    pub data_neighbours_k: usize,
    pub context_tag: String,
    pub target_tag: String,
}

impl AlignmentConfig {
    /// Configuration with default parameters for two species
    pub fn new(context: SpeciesConfig, target: SpeciesConfig) -> Self {
        let context_tag = format!("{}_context", context.name);
        let target_tag = format!("{}_target", target.name);
        Self {
            context,
            target,
            model: ModelParams::default(),
            context_training: TrainParams::default(),
            target_training: TrainParams::default(),
            prototypes: PrototypeParams::default(),
            alignment: AlignmentParams::default(),
            data_neighbours_k: 25,
            context_tag,
            target_tag,
        }
    }

    /// Check all parameters that can be checked without data
    ///
    /// ### Returns
    ///
    /// `Ok(())` or a `Config` error naming the first offending parameter
    pub fn validate(&self) -> AlignResult<()> {
        ensure_config!(self.model.latent_dim > 0, "latent_dim must be positive");
        ensure_config!(self.model.hidden_dim > 0, "hidden_dim must be positive");
        ensure_config!(
            self.context.name != self.target.name,
            "Context and target species must differ, got '{}' twice",
            self.context.name
        );
        ensure_config!(
            !self.context.cell_type_keys.is_empty(),
            "The context species needs at least one cell type key"
        );
        for species in [&self.context, &self.target] {
            ensure_config!(
                (0.0..=1.0).contains(&species.min_expression_fraction),
                "min_expression_fraction of '{}' must lie in [0, 1], got {}",
                species.name,
                species.min_expression_fraction
            );
        }
        for (label, train) in [
            ("context", &self.context_training),
            ("target", &self.target_training),
        ] {
            ensure_config!(train.epochs > 0, "{} epochs must be positive", label);
            ensure_config!(
                train.batch_size > 0,
                "{} batch_size must be positive",
                label
            );
            ensure_config!(
                train.adam.learning_rate > 0.0 && train.adam.learning_rate.is_finite(),
                "{} learning rate must be positive and finite, got {}",
                label,
                train.adam.learning_rate
            );
            ensure_config!(
                train.checkpoint_every != Some(0),
                "{} checkpoint_every must be positive when set",
                label
            );
        }
        ensure_config!(
            self.alignment.weight_start >= 0.0 && self.alignment.weight_end >= 0.0,
            "Alignment weights must be non-negative"
        );
        ensure_config!(
            self.prototypes.tie_tolerance >= 0.0,
            "tie_tolerance must be non-negative"
        );
        if let PrototypePolicy::Stratified { per_cluster } = self.prototypes.policy {
            ensure_config!(per_cluster > 0, "Stratified per_cluster must be positive");
        }
        if self.prototypes.cluster_key.is_none() {
            ensure_config!(
                self.prototypes.n_clusters > 0,
                "n_clusters must be positive when no cluster_key is set"
            );
        }
        ensure_config!(
            self.data_neighbours_k > 0,
            "data_neighbours_k must be positive"
        );
        ensure_config!(
            !self.context_tag.is_empty() && !self.target_tag.is_empty(),
            "Checkpoint tags must not be empty"
        );
        ensure_config!(
            self.context_tag != self.target_tag,
            "Context and target checkpoint tags must differ"
        );
        check_tag(&self.context_tag)?;
        check_tag(&self.target_tag)?;
        Ok(())
    }
}

///////////
// Tests //
///////////
