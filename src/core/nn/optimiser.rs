use faer::Mat;
use rustc_hash::FxHashMap;

use crate::core::nn::linear::Parameter;

////////////
// Params //
////////////

/// Adam optimiser configuration
///
/// ### Fields
///
/// * `learning_rate` - Step size
/// * `beta1` - First moment decay rate
/// * `beta2` - Second moment decay rate
/// * `epsilon` - Numerical stability constant
/// * `max_grad_norm` - Global gradient norm above which gradients get
///   rescaled. `None` disables clipping.
#[derive(Clone, Debug)]
pub struct AdamParams {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub max_grad_norm: Option<f32>,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            max_grad_norm: Some(10.0),
        }
    }
}

///////////////
// Optimiser //
///////////////

/// Moment estimates for one parameter
struct Moments {
    m: Mat<f32>,
    v: Mat<f32>,
}

/// Adam optimiser keyed by parameter name
///
/// Parameters that are never handed to `step()` are never touched, which is
/// how frozen components are implemented.
pub struct Adam {
    params: AdamParams,
    moments: FxHashMap<String, Moments>,
    step: usize,
}

impl Adam {
    /// Create a new optimiser
    pub fn new(params: AdamParams) -> Self {
        Self {
            params,
            moments: FxHashMap::default(),
            step: 0,
        }
    }

    /// Number of steps taken so far
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Perform one update on the given parameters using their accumulated
    /// gradients
    ///
    /// ### Params
    ///
    /// * `params` - The parameters to update. Gradients are not reset.
    pub fn step(&mut self, params: Vec<&mut Parameter>) {
        self.step += 1;
        let t = self.step as i32;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;

        let clip_scale = match self.params.max_grad_norm {
            Some(max_norm) => {
                let mut total_sq = 0_f64;
                for p in params.iter() {
                    for j in 0..p.grad.ncols() {
                        for i in 0..p.grad.nrows() {
                            let g = p.grad[(i, j)] as f64;
                            total_sq += g * g;
                        }
                    }
                }
                let norm = total_sq.sqrt() as f32;
                if norm > max_norm {
                    max_norm / (norm + self.params.epsilon)
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let lr = self.params.learning_rate;
        let eps = self.params.epsilon;

        for p in params {
            let (nrows, ncols) = p.shape();
            let moments = self.moments.entry(p.name.clone()).or_insert_with(|| Moments {
                m: Mat::zeros(nrows, ncols),
                v: Mat::zeros(nrows, ncols),
            });

            for j in 0..ncols {
                for i in 0..nrows {
                    let g = p.grad[(i, j)] * clip_scale;
                    let m = beta1 * moments.m[(i, j)] + (1.0 - beta1) * g;
                    let v = beta2 * moments.v[(i, j)] + (1.0 - beta2) * g * g;
                    moments.m[(i, j)] = m;
                    moments.v[(i, j)] = v;

                    let m_hat = m / bc1;
                    let v_hat = v / bc2;
                    p.value[(i, j)] -= lr * m_hat / (v_hat.sqrt() + eps);
                }
            }
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adam_minimises_quadratic() {
        // f(w) = (w - 3)^2
        let mut p = Parameter::new("w", Mat::zeros(1, 1));
        let mut adam = Adam::new(AdamParams {
            learning_rate: 0.1,
            ..AdamParams::default()
        });
        for _ in 0..500 {
            p.zero_grad();
            p.grad[(0, 0)] = 2.0 * (p.value[(0, 0)] - 3.0);
            adam.step(vec![&mut p]);
        }
        assert!((p.value[(0, 0)] - 3.0).abs() < 5e-2);
        assert_eq!(adam.steps(), 500);
    }

    #[test]
    fn test_untouched_params_stay_identical() {
        let mut trained = Parameter::new("a", Mat::from_fn(2, 2, |i, j| (i + j) as f32));
        let frozen = Parameter::new("b", Mat::from_fn(2, 2, |i, j| (i * j) as f32));
        let before = frozen.snapshot();

        let mut adam = Adam::new(AdamParams::default());
        trained.grad = Mat::from_fn(2, 2, |_, _| 1.0);
        adam.step(vec![&mut trained]);

        assert_eq!(frozen.snapshot(), before);
        assert!(trained.value[(0, 0)] < 0.0);
    }
}
