use faer::{Mat, MatRef};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::base::utils::{log1p_mat, softmax_rows};
use crate::core::data::dataset::SpeciesDataset;
use crate::core::nn::linear::{relu, relu_backward, Dense, Parameter};
use crate::error::{AlignError, AlignResult};
use crate::single_cell::alignment::checkpoint::{ComponentSnapshot, ModelComponent};
use crate::single_cell::alignment::config::{LibraryMode, ModelParams};
use crate::utils::general::{hcat, mat_to_vec, one_hot, select_rows};

/// Log variances are clamped to `[-LOG_VAR_CLAMP, LOG_VAR_CLAMP]`
pub const LOG_VAR_CLAMP: f32 = 10.0;

/// Cells per forward pass when encoding a full dataset
const ENCODE_CHUNK: usize = 1024;

/// Lower bound of the library prior variance
const MIN_PRIOR_VAR: f32 = 1e-4;

/////////////
// Helpers //
/////////////

fn clamp_log_var(raw: &Mat<f32>) -> Mat<f32> {
    Mat::from_fn(raw.nrows(), raw.ncols(), |i, j| {
        raw[(i, j)].clamp(-LOG_VAR_CLAMP, LOG_VAR_CLAMP)
    })
}

/// Gradients do not flow through the clamp where it was active
fn clamp_backward(raw: &Mat<f32>, grad: &Mat<f32>) -> Mat<f32> {
    Mat::from_fn(grad.nrows(), grad.ncols(), |i, j| {
        if raw[(i, j)].abs() <= LOG_VAR_CLAMP {
            grad[(i, j)]
        } else {
            0.0
        }
    })
}

/////////////
// Encoder //
/////////////

/// Amortised posterior `q(z | x, batch)` and, optionally, `q(log l | x, batch)`
#[derive(Clone, Debug)]
pub struct Encoder {
    hidden: Dense,
    mean: Dense,
    log_var: Dense,
    library: Option<Dense>,
}

/// Intermediate values of one encoder forward pass
///
/// ### Fields
///
/// * `mean` - Cells x latent posterior means
/// * `log_var` - Cells x latent clamped posterior log variances
/// * `library` - Cells x 2 `(lib_mean, lib_log_var)` in latent-library mode
#[derive(Clone, Debug)]
pub struct EncoderPass {
    input: Mat<f32>,
    hidden_pre: Mat<f32>,
    hidden: Mat<f32>,
    log_var_raw: Mat<f32>,
    library_raw: Option<Mat<f32>>,
    pub mean: Mat<f32>,
    pub log_var: Mat<f32>,
    pub library: Option<Mat<f32>>,
}

impl Encoder {
    fn new(
        n_genes: usize,
        n_batches: usize,
        params: &ModelParams,
        rng: &mut StdRng,
    ) -> Self {
        let n_in = n_genes + n_batches;
        let library = match params.library_mode {
            LibraryMode::Latent => Some(Dense::new("encoder.library", params.hidden_dim, 2, rng)),
            LibraryMode::Observed => None,
        };
        Self {
            hidden: Dense::new("encoder.hidden", n_in, params.hidden_dim, rng),
            mean: Dense::new("encoder.mean", params.hidden_dim, params.latent_dim, rng),
            log_var: Dense::new("encoder.log_var", params.hidden_dim, params.latent_dim, rng),
            library,
        }
    }

    /// Forward pass on raw counts
    ///
    /// ### Params
    ///
    /// * `counts` - Cells x genes raw counts
    /// * `batch_onehot` - Cells x batches one-hot batch encoding
    pub fn forward(&self, counts: MatRef<f32>, batch_onehot: &Mat<f32>) -> EncoderPass {
        let input = hcat(&log1p_mat(counts), batch_onehot);
        let hidden_pre = self.hidden.forward(input.as_ref());
        let hidden = relu(&hidden_pre);
        let mean = self.mean.forward(hidden.as_ref());
        let log_var_raw = self.log_var.forward(hidden.as_ref());
        let log_var = clamp_log_var(&log_var_raw);

        let (library_raw, library) = match &self.library {
            Some(layer) => {
                let raw = layer.forward(hidden.as_ref());
                let clamped = Mat::from_fn(raw.nrows(), 2, |i, j| {
                    if j == 1 {
                        raw[(i, j)].clamp(-LOG_VAR_CLAMP, LOG_VAR_CLAMP)
                    } else {
                        raw[(i, j)]
                    }
                });
                (Some(raw), Some(clamped))
            }
            None => (None, None),
        };

        EncoderPass {
            input,
            hidden_pre,
            hidden,
            log_var_raw,
            library_raw,
            mean,
            log_var,
            library,
        }
    }

    /// Backward pass; accumulates parameter gradients
    ///
    /// ### Params
    ///
    /// * `pass` - The forward pass the gradients belong to
    /// * `d_mean` - Loss gradient with respect to the means
    /// * `d_log_var` - Loss gradient with respect to the clamped log variances
    /// * `d_library` - Loss gradient with respect to `(lib_mean, lib_log_var)`
    pub fn backward(
        &mut self,
        pass: &EncoderPass,
        d_mean: &Mat<f32>,
        d_log_var: &Mat<f32>,
        d_library: Option<&Mat<f32>>,
    ) {
        let d_log_var_raw = clamp_backward(&pass.log_var_raw, d_log_var);
        let mut d_hidden = self.mean.backward(pass.hidden.as_ref(), d_mean.as_ref());
        d_hidden += &self
            .log_var
            .backward(pass.hidden.as_ref(), d_log_var_raw.as_ref());

        if let (Some(layer), Some(raw), Some(d_lib)) =
            (self.library.as_mut(), pass.library_raw.as_ref(), d_library)
        {
            let d_raw = Mat::from_fn(d_lib.nrows(), 2, |i, j| {
                if j == 1 && raw[(i, j)].abs() > LOG_VAR_CLAMP {
                    0.0
                } else {
                    d_lib[(i, j)]
                }
            });
            d_hidden += &layer.backward(pass.hidden.as_ref(), d_raw.as_ref());
        }

        let d_hidden_pre = relu_backward(&pass.hidden_pre, &d_hidden);
        self.hidden
            .backward(pass.input.as_ref(), d_hidden_pre.as_ref());
    }

    pub fn params(&self) -> Vec<&Parameter> {
        let mut params = self.hidden.params();
        params.extend(self.mean.params());
        params.extend(self.log_var.params());
        if let Some(layer) = &self.library {
            params.extend(layer.params());
        }
        params
    }

    pub fn params_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.hidden.params_mut();
        params.extend(self.mean.params_mut());
        params.extend(self.log_var.params_mut());
        if let Some(layer) = self.library.as_mut() {
            params.extend(layer.params_mut());
        }
        params
    }
}

/////////////
// Decoder //
/////////////

/// Generative network `p(x | z, batch)` with per gene dispersion
#[derive(Clone, Debug)]
pub struct Decoder {
    hidden: Dense,
    output: Dense,
    log_theta: Parameter,
    latent_dim: usize,
}

/// Intermediate values of one decoder forward pass
///
/// ### Fields
///
/// * `rho` - Cells x genes normalised expression (rows sum to one)
#[derive(Clone, Debug)]
pub struct DecoderPass {
    input: Mat<f32>,
    hidden_pre: Mat<f32>,
    hidden: Mat<f32>,
    pub rho: Mat<f32>,
}

impl Decoder {
    fn new(n_genes: usize, n_batches: usize, params: &ModelParams, rng: &mut StdRng) -> Self {
        Self {
            hidden: Dense::new(
                "decoder.hidden",
                params.latent_dim + n_batches,
                params.hidden_dim,
                rng,
            ),
            output: Dense::new("decoder.output", params.hidden_dim, n_genes, rng),
            log_theta: Parameter::new("decoder.log_theta", Mat::zeros(1, n_genes)),
            latent_dim: params.latent_dim,
        }
    }

    /// Forward pass from latent codes
    ///
    /// ### Params
    ///
    /// * `z` - Cells x latent codes
    /// * `batch_onehot` - Cells x batches one-hot batch encoding
    pub fn forward(&self, z: &Mat<f32>, batch_onehot: &Mat<f32>) -> DecoderPass {
        let input = hcat(z, batch_onehot);
        let hidden_pre = self.hidden.forward(input.as_ref());
        let hidden = relu(&hidden_pre);
        let logits = self.output.forward(hidden.as_ref());
        let rho = softmax_rows(logits.as_ref());
        DecoderPass {
            input,
            hidden_pre,
            hidden,
            rho,
        }
    }

    /// Backward pass; accumulates parameter gradients
    ///
    /// ### Params
    ///
    /// * `pass` - The forward pass the gradients belong to
    /// * `d_logits` - Loss gradient with respect to the logits
    /// * `d_log_theta` - Loss gradient with respect to the log dispersion
    ///
    /// ### Returns
    ///
    /// Loss gradient with respect to the latent codes
    pub fn backward(
        &mut self,
        pass: &DecoderPass,
        d_logits: &Mat<f32>,
        d_log_theta: &[f32],
    ) -> Mat<f32> {
        for (g, d) in d_log_theta.iter().enumerate() {
            self.log_theta.grad[(0, g)] += d;
        }
        let d_hidden = self.output.backward(pass.hidden.as_ref(), d_logits.as_ref());
        let d_hidden_pre = relu_backward(&pass.hidden_pre, &d_hidden);
        let d_input = self
            .hidden
            .backward(pass.input.as_ref(), d_hidden_pre.as_ref());
        Mat::from_fn(d_input.nrows(), self.latent_dim, |i, j| d_input[(i, j)])
    }

    pub fn log_theta(&self) -> MatRef<'_, f32> {
        self.log_theta.value.as_ref()
    }

    pub fn params(&self) -> Vec<&Parameter> {
        let mut params = self.hidden.params();
        params.extend(self.output.params());
        params.push(&self.log_theta);
        params
    }

    pub fn params_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.hidden.params_mut();
        params.extend(self.output.params_mut());
        params.push(&mut self.log_theta);
        params
    }
}

//////////////////
// Latent codes //
//////////////////

/// Gaussian posterior per cell
///
/// ### Fields
///
/// * `mean` - Cells x latent means
/// * `var` - Cells x latent variances
#[derive(Clone, Debug)]
pub struct LatentCodes {
    pub mean: Mat<f32>,
    pub var: Mat<f32>,
}

/// Serialisable form of `LatentCodes` (column-major)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatentExport {
    pub n_cells: usize,
    pub latent_dim: usize,
    pub mean: Vec<f32>,
    pub var: Vec<f32>,
}

impl LatentCodes {
    pub fn n_cells(&self) -> usize {
        self.mean.nrows()
    }

    pub fn latent_dim(&self) -> usize {
        self.mean.ncols()
    }

    /// Copy into a serialisable structure
    pub fn to_export(&self) -> LatentExport {
        LatentExport {
            n_cells: self.n_cells(),
            latent_dim: self.latent_dim(),
            mean: mat_to_vec(&self.mean),
            var: mat_to_vec(&self.var),
        }
    }
}

///////////
// Model //
///////////

/// Encoder/decoder pair of one species
///
/// ### Fields
///
/// * `species` - Species name
/// * `n_genes` - Input and output width
/// * `n_batches` - Width of the one-hot batch encoding
/// * `latent_dim` - Latent width
/// * `library_mode` - Observed or inferred library
/// * `encoder` - The inference network
/// * `decoder` - The generative network
/// * `library_prior` - Per batch `(mean, var)` of the log library sizes
#[derive(Clone, Debug)]
pub struct SpeciesModel {
    species: String,
    n_genes: usize,
    n_batches: usize,
    latent_dim: usize,
    library_mode: LibraryMode,
    pub encoder: Encoder,
    pub decoder: Decoder,
    library_prior: Vec<(f32, f32)>,
}

impl SpeciesModel {
    /// Randomly initialise a model
    ///
    /// ### Params
    ///
    /// * `species` - Species name
    /// * `n_genes` - Number of genes of the species
    /// * `n_batches` - Number of batches of the species
    /// * `params` - The `ModelParams`
    ///
    /// ### Returns
    ///
    /// The model or a `Config` error for zero sized layers.
    pub fn new(
        species: &str,
        n_genes: usize,
        n_batches: usize,
        params: &ModelParams,
    ) -> AlignResult<Self> {
        if n_genes == 0 || n_batches == 0 {
            return Err(AlignError::config(format!(
                "Model for '{}' needs genes and batches, got {} and {}",
                species, n_genes, n_batches
            )));
        }
        if params.latent_dim == 0 || params.hidden_dim == 0 {
            return Err(AlignError::config("latent_dim and hidden_dim must be positive"));
        }

        let mut rng = StdRng::seed_from_u64(params.seed);
        let encoder = Encoder::new(n_genes, n_batches, params, &mut rng);
        let decoder = Decoder::new(n_genes, n_batches, params, &mut rng);

        Ok(Self {
            species: species.to_string(),
            n_genes,
            n_batches,
            latent_dim: params.latent_dim,
            library_mode: params.library_mode,
            encoder,
            decoder,
            library_prior: vec![(0.0, 1.0); n_batches],
        })
    }

    /// Initialise a model sized for a dataset, with the library prior set
    /// from its empirical log library statistics
    pub fn for_dataset(dataset: &SpeciesDataset, params: &ModelParams) -> AlignResult<Self> {
        let mut model = Self::new(
            dataset.name(),
            dataset.n_genes(),
            dataset.n_batches(),
            params,
        )?;
        model.library_prior = dataset
            .log_library_stats()
            .into_iter()
            .map(|(mean, var)| (mean, var.max(MIN_PRIOR_VAR)))
            .collect();
        Ok(model)
    }

    pub fn species(&self) -> &str {
        &self.species
    }

    pub fn n_genes(&self) -> usize {
        self.n_genes
    }

    pub fn n_batches(&self) -> usize {
        self.n_batches
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn library_mode(&self) -> LibraryMode {
        self.library_mode
    }

    pub fn library_prior(&self) -> &[(f32, f32)] {
        &self.library_prior
    }

    /// Fail unless the latent width equals `expected`
    pub fn check_latent_width(&self, component: &str, expected: usize) -> AlignResult<()> {
        if self.latent_dim != expected {
            return Err(AlignError::LatentWidthMismatch {
                component: format!("{} {}", self.species, component),
                expected,
                got: self.latent_dim,
            });
        }
        Ok(())
    }

    /// Fail unless the dataset fits the model's input layer
    pub fn check_dataset(&self, dataset: &SpeciesDataset) -> AlignResult<()> {
        if dataset.n_genes() != self.n_genes || dataset.n_batches() != self.n_batches {
            return Err(AlignError::data(format!(
                "Model '{}' expects {} genes and {} batches, dataset '{}' has {} and {}",
                self.species,
                self.n_genes,
                self.n_batches,
                dataset.name(),
                dataset.n_genes(),
                dataset.n_batches()
            )));
        }
        Ok(())
    }

    /// Posterior of every cell of a dataset
    ///
    /// ### Params
    ///
    /// * `dataset` - Dataset with the model's genes and batches
    ///
    /// ### Returns
    ///
    /// The `LatentCodes`; always `latent_dim` wide.
    pub fn encode(&self, dataset: &SpeciesDataset) -> AlignResult<LatentCodes> {
        self.check_dataset(dataset)?;
        let n = dataset.n_cells();
        let mut mean = Mat::<f32>::zeros(n, self.latent_dim);
        let mut var = Mat::<f32>::zeros(n, self.latent_dim);

        let cells: Vec<usize> = (0..n).collect();
        for chunk in cells.chunks(ENCODE_CHUNK) {
            let counts = select_rows(dataset.counts(), chunk);
            let codes: Vec<usize> = chunk.iter().map(|&c| dataset.batch_codes()[c]).collect();
            let pass = self
                .encoder
                .forward(counts.as_ref(), &one_hot(&codes, self.n_batches));
            for (row, &cell) in chunk.iter().enumerate() {
                for d in 0..self.latent_dim {
                    mean[(cell, d)] = pass.mean[(row, d)];
                    var[(cell, d)] = pass.log_var[(row, d)].exp();
                }
            }
        }

        Ok(LatentCodes { mean, var })
    }

    /// Normalised expression decoded from latent codes
    ///
    /// ### Params
    ///
    /// * `z` - Cells x latent codes
    /// * `batch_codes` - Batch per row of `z`
    ///
    /// ### Returns
    ///
    /// Cells x genes matrix with rows summing to one.
    pub fn decode_normalised(&self, z: &Mat<f32>, batch_codes: &[usize]) -> Mat<f32> {
        self.decoder
            .forward(z, &one_hot(batch_codes, self.n_batches))
            .rho
    }

    fn component_params(&self, component: ModelComponent) -> Vec<&Parameter> {
        match component {
            ModelComponent::Encoder => self.encoder.params(),
            ModelComponent::Decoder => self.decoder.params(),
        }
    }

    fn component_params_mut(&mut self, component: ModelComponent) -> Vec<&mut Parameter> {
        match component {
            ModelComponent::Encoder => self.encoder.params_mut(),
            ModelComponent::Decoder => self.decoder.params_mut(),
        }
    }

    /// Copy the parameters of one component
    pub fn snapshot(&self, component: ModelComponent) -> ComponentSnapshot {
        ComponentSnapshot {
            species: self.species.clone(),
            component,
            latent_dim: self.latent_dim,
            tensors: self
                .component_params(component)
                .iter()
                .map(|p| p.snapshot())
                .collect(),
        }
    }

    /// Overwrite one component from a snapshot
    ///
    /// Every tensor is validated before anything is written, so a failed
    /// import leaves the model untouched.
    ///
    /// ### Params
    ///
    /// * `snapshot` - Parameters to load
    ///
    /// ### Returns
    ///
    /// `LatentWidthMismatch`, `ShapeMismatch` or `DataMismatch` (missing
    /// tensor) on incompatible snapshots.
    pub fn restore(&mut self, snapshot: &ComponentSnapshot) -> AlignResult<()> {
        if snapshot.latent_dim != self.latent_dim {
            return Err(AlignError::LatentWidthMismatch {
                component: format!("imported {} of '{}'", snapshot.component, snapshot.species),
                expected: self.latent_dim,
                got: snapshot.latent_dim,
            });
        }

        for param in self.component_params(snapshot.component) {
            let tensor = snapshot.tensor(&param.name).ok_or_else(|| {
                AlignError::data(format!(
                    "Snapshot of {} from '{}' lacks tensor '{}'",
                    snapshot.component, snapshot.species, param.name
                ))
            })?;
            let got = (tensor.nrows, tensor.ncols);
            if got != param.shape() || tensor.data.len() != got.0 * got.1 {
                return Err(AlignError::ShapeMismatch {
                    name: param.name.clone(),
                    expected: param.shape(),
                    got,
                });
            }
        }

        for param in self.component_params_mut(snapshot.component) {
            if let Some(tensor) = snapshot.tensor(&param.name) {
                param.restore(tensor);
            }
        }
        Ok(())
    }

    pub(crate) fn zero_grad(&mut self) {
        for p in self.encoder.params_mut() {
            p.zero_grad();
        }
        for p in self.decoder.params_mut() {
            p.zero_grad();
        }
    }
}

///////////
// Tests //
///////////
