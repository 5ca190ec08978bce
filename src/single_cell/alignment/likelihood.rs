use faer::{Mat, MatRef};
use rayon::prelude::*;

use crate::assert_same_dims;
use crate::core::base::stats::nb_log_likelihood_grad;

/// Log-likelihood of a minibatch with gradients for the decoder outputs
///
/// ### Fields
///
/// * `ll` - Per cell log-likelihood summed over genes
/// * `d_logits` - Cells x genes gradient with respect to the decoder logits
/// * `d_log_library` - Per cell gradient with respect to the log library
/// * `d_log_theta` - Per gene gradient with respect to the log dispersion,
///   summed over cells
#[derive(Clone, Debug)]
pub struct NbBatchTerms {
    pub ll: Vec<f64>,
    pub d_logits: Mat<f32>,
    pub d_log_library: Vec<f32>,
    pub d_log_theta: Vec<f64>,
}

impl NbBatchTerms {
    /// Sum of the per cell log-likelihoods
    pub fn total(&self) -> f64 {
        self.ll.iter().sum()
    }
}

/// Negative binomial log-likelihood of a count matrix
///
/// The rates are `mu = exp(log_library) * rho` where `rho` is the row-wise
/// softmax of the decoder logits, so the logit gradient is
/// `mu_k * a_k - rho_k * sum_g(mu_g * a_g)` with `a_g = d ll / d mu_g`.
/// Cells are processed in parallel; the reduction over cells runs serially
/// so results do not depend on the thread count.
///
/// ### Params
///
/// * `counts` - Cells x genes observed counts
/// * `rho` - Cells x genes normalised expression (rows sum to one)
/// * `log_library` - Per cell log library size
/// * `log_theta` - `1 x genes` log inverse dispersion
///
/// ### Returns
///
/// The `NbBatchTerms`
pub fn nb_batch_log_likelihood(
    counts: MatRef<f32>,
    rho: MatRef<f32>,
    log_library: &[f32],
    log_theta: MatRef<f32>,
) -> NbBatchTerms {
    assert_same_dims!(counts, rho);
    assert_eq!(counts.nrows(), log_library.len());
    assert_eq!(log_theta.ncols(), counts.ncols());

    let (n_cells, n_genes) = counts.shape();
    let theta: Vec<f64> = (0..n_genes)
        .map(|g| (log_theta[(0, g)] as f64).exp())
        .collect();

    let per_cell: Vec<(f64, Vec<f32>, f32, Vec<f64>)> = (0..n_cells)
        .into_par_iter()
        .map(|i| {
            let library = (log_library[i] as f64).exp();
            let mut ll = 0_f64;
            let mut mu_a = vec![0_f64; n_genes];
            let mut d_theta = vec![0_f64; n_genes];
            let mut total_mu_a = 0_f64;

            for g in 0..n_genes {
                let mu = library * rho[(i, g)] as f64;
                let term = nb_log_likelihood_grad(counts[(i, g)] as f64, mu, theta[g]);
                ll += term.ll;
                mu_a[g] = mu * term.d_mu;
                total_mu_a += mu_a[g];
                d_theta[g] = term.d_log_theta;
            }

            let d_logits = (0..n_genes)
                .map(|g| (mu_a[g] - rho[(i, g)] as f64 * total_mu_a) as f32)
                .collect();

            (ll, d_logits, total_mu_a as f32, d_theta)
        })
        .collect();

    let mut ll = Vec::with_capacity(n_cells);
    let mut d_log_library = Vec::with_capacity(n_cells);
    let mut d_log_theta = vec![0_f64; n_genes];
    let mut d_logits = Mat::<f32>::zeros(n_cells, n_genes);
    for (i, (cell_ll, cell_logits, cell_lib, cell_theta)) in per_cell.into_iter().enumerate() {
        ll.push(cell_ll);
        d_log_library.push(cell_lib);
        for g in 0..n_genes {
            d_logits[(i, g)] = cell_logits[g];
            d_log_theta[g] += cell_theta[g];
        }
    }

    NbBatchTerms {
        ll,
        d_logits,
        d_log_library,
        d_log_theta,
    }
}

///////////
// Tests //
///////////
