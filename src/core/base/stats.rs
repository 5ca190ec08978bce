use statrs::function::gamma::{digamma, ln_gamma};

/// Lower clamp for rates and dispersions before taking logarithms
pub const NB_EPS: f64 = 1e-8;

///////////
// Types //
///////////

/// Log-likelihood of a single count together with its partial derivatives
///
/// ### Fields
///
/// * `ll` - Log-likelihood value
/// * `d_mu` - Derivative with respect to the mean
/// * `d_log_theta` - Derivative with respect to the log dispersion
#[derive(Clone, Copy, Debug)]
pub struct NbTerm {
    pub ll: f64,
    pub d_mu: f64,
    pub d_log_theta: f64,
}

////////////////////////////
// Negative binomial NLLs //
////////////////////////////

/// Negative binomial log-likelihood in the mean/inverse-dispersion
/// parameterisation
///
/// `lnΓ(x+θ) − lnΓ(θ) − lnΓ(x+1) + θ(lnθ − ln(θ+μ)) + x(lnμ − ln(θ+μ))`
///
/// The log-gamma terms go through `statrs`; the series expansion is not
/// stable enough for very large counts.
///
/// ### Params
///
/// * `x` - Observed count
/// * `mu` - Mean of the distribution
/// * `theta` - Inverse dispersion
///
/// ### Returns
///
/// The log-likelihood
#[inline]
pub fn nb_log_likelihood(x: f64, mu: f64, theta: f64) -> f64 {
    let mu = mu.max(NB_EPS);
    let theta = theta.max(NB_EPS);
    let log_theta_mu = (theta + mu).ln();

    ln_gamma(x + theta) - ln_gamma(theta) - ln_gamma(x + 1.0)
        + theta * (theta.ln() - log_theta_mu)
        + x * (mu.ln() - log_theta_mu)
}

/// Negative binomial log-likelihood with the analytic gradients
///
/// ### Params
///
/// * `x` - Observed count
/// * `mu` - Mean of the distribution
/// * `theta` - Inverse dispersion
///
/// ### Returns
///
/// `NbTerm` with the value and the derivatives with respect to `mu` and
/// `ln(theta)`.
#[inline]
pub fn nb_log_likelihood_grad(x: f64, mu: f64, theta: f64) -> NbTerm {
    let mu = mu.max(NB_EPS);
    let theta = theta.max(NB_EPS);
    let theta_mu = theta + mu;
    let ll = nb_log_likelihood(x, mu, theta);

    let d_mu = x / mu - (x + theta) / theta_mu;
    let d_theta = digamma(x + theta) - digamma(theta) + theta.ln() + 1.0
        - theta_mu.ln()
        - (x + theta) / theta_mu;

    NbTerm {
        ll,
        d_mu,
        d_log_theta: d_theta * theta,
    }
}

////////////////////
// KL divergences //
////////////////////

/// KL divergence of a diagonal Gaussian against a Gaussian prior for one
/// dimension
///
/// ### Params
///
/// * `mean` - Posterior mean
/// * `log_var` - Posterior log variance
/// * `prior_mean` - Prior mean
/// * `prior_var` - Prior variance
///
/// ### Returns
///
/// Tuple of `(kl, d_mean, d_log_var)`
#[inline]
pub fn kl_normal(mean: f64, log_var: f64, prior_mean: f64, prior_var: f64) -> (f64, f64, f64) {
    let var = log_var.exp();
    let diff = mean - prior_mean;
    let kl = 0.5 * (prior_var.ln() - log_var + (var + diff * diff) / prior_var - 1.0);
    let d_mean = diff / prior_var;
    let d_log_var = 0.5 * (var / prior_var - 1.0);
    (kl, d_mean, d_log_var)
}

/// KL divergence of a diagonal Gaussian against `N(0, 1)` for one dimension
#[inline]
pub fn kl_std_normal(mean: f64, log_var: f64) -> (f64, f64, f64) {
    kl_normal(mean, log_var, 0.0, 1.0)
}

///////////////
// Quantiles //
///////////////

/// Median of a slice (the slice gets sorted in place)
pub fn median_in_place(x: &mut [f32]) -> f32 {
    if x.is_empty() {
        return f32::NAN;
    }
    x.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = x.len();
    if n % 2 == 1 {
        x[n / 2]
    } else {
        0.5 * (x[n / 2 - 1] + x[n / 2])
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nb_matches_direct_formula() {
        // theta = 1 reduces NB to a geometric distribution:
        // P(x) = (1 / (1 + mu)) * (mu / (1 + mu))^x
        let cases: [(f64, f64); 3] = [(0.0, 2.0), (3.0, 2.0), (7.0, 0.5)];
        for &(x, mu) in &cases {
            let expected = (1.0 / (1.0 + mu) * (mu / (1.0 + mu)).powf(x)).ln();
            let got = nb_log_likelihood(x, mu, 1.0);
            assert!((expected - got).abs() < 1e-9, "x={} mu={}", x, mu);
        }
    }

    #[test]
    fn test_nb_is_finite_for_extremes() {
        assert!(nb_log_likelihood(0.0, 0.0, 1e-12).is_finite());
        assert!(nb_log_likelihood(0.0, 1e7, 5.0).is_finite());
        assert!(nb_log_likelihood(65_000.0, 1e6, 1e4).is_finite());
        let term = nb_log_likelihood_grad(1e5, 1e5, 0.1);
        assert!(term.ll.is_finite() && term.d_mu.is_finite() && term.d_log_theta.is_finite());
    }

    #[test]
    fn test_nb_gradients_numerically() {
        let (x, mu, theta): (f64, f64, f64) = (4.0, 3.0, 2.5);
        let h = 1e-6;
        let term = nb_log_likelihood_grad(x, mu, theta);

        let num_mu =
            (nb_log_likelihood(x, mu + h, theta) - nb_log_likelihood(x, mu - h, theta)) / (2.0 * h);
        assert!((num_mu - term.d_mu).abs() < 1e-5);

        let log_theta = theta.ln();
        let num_lt = (nb_log_likelihood(x, mu, (log_theta + h).exp())
            - nb_log_likelihood(x, mu, (log_theta - h).exp()))
            / (2.0 * h);
        assert!((num_lt - term.d_log_theta).abs() < 1e-5);
    }

    #[test]
    fn test_kl_zero_at_prior() {
        let (kl, dm, dv) = kl_normal(1.5, 2.0_f64.ln(), 1.5, 2.0);
        assert!(kl.abs() < 1e-12);
        assert!(dm.abs() < 1e-12);
        assert!(dv.abs() < 1e-12);

        let (kl, _, _) = kl_std_normal(1.0, 0.0);
        assert!((kl - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_median() {
        let mut odd = vec![3.0, 1.0, 2.0];
        assert_eq!(median_in_place(&mut odd), 2.0);
        let mut even = vec![4.0, 1.0, 3.0, 2.0];
        assert_eq!(median_in_place(&mut even), 2.5);
    }
}
