use faer::{Mat, MatRef};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::utils::general::{mat_to_vec, vec_to_mat};

////////////////
// Structures //
////////////////

/// A trainable tensor with its accumulated gradient
///
/// ### Fields
///
/// * `name` - Fully qualified name, e.g. `encoder.hidden.weight`
/// * `value` - Current value
/// * `grad` - Gradient accumulated since the last `zero_grad()`
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub value: Mat<f32>,
    pub grad: Mat<f32>,
}

/// Serialisable copy of a `Parameter` value
///
/// Data is stored column-major.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TensorSnapshot {
    pub name: String,
    pub nrows: usize,
    pub ncols: usize,
    pub data: Vec<f32>,
}

impl Parameter {
    /// Wrap a value as a parameter with a zeroed gradient
    pub fn new(name: impl Into<String>, value: Mat<f32>) -> Self {
        let grad = Mat::zeros(value.nrows(), value.ncols());
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    /// Shape of the underlying matrix
    pub fn shape(&self) -> (usize, usize) {
        (self.value.nrows(), self.value.ncols())
    }

    /// Reset the gradient to zero
    pub fn zero_grad(&mut self) {
        self.grad = Mat::zeros(self.value.nrows(), self.value.ncols());
    }

    /// Copy the current value out
    pub fn snapshot(&self) -> TensorSnapshot {
        TensorSnapshot {
            name: self.name.clone(),
            nrows: self.value.nrows(),
            ncols: self.value.ncols(),
            data: mat_to_vec(&self.value),
        }
    }

    /// Overwrite the value from a snapshot. The caller checks shapes.
    pub fn restore(&mut self, snapshot: &TensorSnapshot) {
        self.value = vec_to_mat(&snapshot.data, snapshot.nrows, snapshot.ncols);
    }
}

/// Fully connected layer `y = x W + b`
///
/// ### Fields
///
/// * `weight` - `in x out` weight matrix
/// * `bias` - `1 x out` bias row
#[derive(Clone, Debug)]
pub struct Dense {
    pub weight: Parameter,
    pub bias: Parameter,
}

impl Dense {
    /// Create a new layer with He-normal initialised weights and zero bias
    ///
    /// ### Params
    ///
    /// * `name` - Prefix for the parameter names
    /// * `input_dim` - Number of input features
    /// * `output_dim` - Number of output features
    /// * `rng` - Random number generator for the initialisation
    ///
    /// ### Returns
    ///
    /// The initialised layer
    pub fn new(name: &str, input_dim: usize, output_dim: usize, rng: &mut StdRng) -> Self {
        let std = (2.0 / input_dim.max(1) as f32).sqrt();
        let normal = Normal::new(0.0_f32, std).unwrap();
        let weight = Mat::from_fn(input_dim, output_dim, |_, _| normal.sample(rng));

        Self {
            weight: Parameter::new(format!("{}.weight", name), weight),
            bias: Parameter::new(format!("{}.bias", name), Mat::zeros(1, output_dim)),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value.ncols()
    }

    /// Forward pass
    ///
    /// ### Params
    ///
    /// * `input` - Batch x in matrix
    ///
    /// ### Returns
    ///
    /// Batch x out matrix
    pub fn forward(&self, input: MatRef<f32>) -> Mat<f32> {
        assert_eq!(
            input.ncols(),
            self.input_dim(),
            "Dense layer '{}' expects {} inputs, got {}",
            self.weight.name,
            self.input_dim(),
            input.ncols()
        );
        let mut out = input * self.weight.value.as_ref();
        for j in 0..out.ncols() {
            let b = self.bias.value[(0, j)];
            for i in 0..out.nrows() {
                out[(i, j)] += b;
            }
        }
        out
    }

    /// Backward pass
    ///
    /// Accumulates the parameter gradients and returns the gradient with
    /// respect to the input. `grad_output` is expected to already carry any
    /// batch averaging.
    ///
    /// ### Params
    ///
    /// * `input` - The input that was used in the forward pass
    /// * `grad_output` - Gradient of the loss with respect to the output
    ///
    /// ### Returns
    ///
    /// Gradient of the loss with respect to the input
    pub fn backward(&mut self, input: MatRef<f32>, grad_output: MatRef<f32>) -> Mat<f32> {
        let grad_w = input.transpose() * grad_output;
        self.weight.grad += &grad_w;

        for j in 0..grad_output.ncols() {
            let mut total = 0_f32;
            for i in 0..grad_output.nrows() {
                total += grad_output[(i, j)];
            }
            self.bias.grad[(0, j)] += total;
        }

        grad_output * self.weight.value.transpose()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.weight, &mut self.bias]
    }

    pub fn params(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }
}

/////////////////
// Activations //
/////////////////

/// ReLU forward
pub fn relu(x: &Mat<f32>) -> Mat<f32> {
    Mat::from_fn(x.nrows(), x.ncols(), |i, j| x[(i, j)].max(0.0))
}

/// ReLU backward: gradient is passed where the pre-activation was positive
pub fn relu_backward(pre_activation: &Mat<f32>, grad_output: &Mat<f32>) -> Mat<f32> {
    Mat::from_fn(grad_output.nrows(), grad_output.ncols(), |i, j| {
        if pre_activation[(i, j)] > 0.0 {
            grad_output[(i, j)]
        } else {
            0.0
        }
    })
}

///////////
// Tests //
///////////
