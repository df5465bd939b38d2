//! Dense layers evaluated in inference mode
use crate::weights::{WeightError, WeightMap};
use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1};
use rand::rngs::StdRng;
use rand::Rng;

/// PyTorch `BatchNorm1d` default epsilon
pub const BATCH_NORM_EPS: f32 = 1e-5;

/// Fully connected layer, weight stored `[out, in]` as in PyTorch
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self, WeightError> {
        if bias.len() != weight.nrows() {
            return Err(WeightError::Shape {
                name: "bias".to_string(),
                expected: vec![weight.nrows()],
                actual: vec![bias.len()],
            });
        }
        Ok(Self { weight, bias })
    }

    /// Load `{prefix}.weight` and `{prefix}.bias`
    pub fn load(
        weights: &mut WeightMap,
        prefix: &str,
        in_features: usize,
        out_features: usize,
    ) -> Result<Self, WeightError> {
        let weight = weights.take_matrix(&format!("{prefix}.weight"), out_features, in_features)?;
        let bias = weights.take_vector(&format!("{prefix}.bias"), out_features)?;
        Self::new(weight, bias)
    }

    /// Uniform(-1/sqrt(in), 1/sqrt(in)) initialization
    pub fn random(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let mut sample = || (rng.random::<f32>() * 2.0 - 1.0) * bound;
        let weight = Array2::from_shape_simple_fn((out_features, in_features), &mut sample);
        let bias = Array1::from_shape_simple_fn(out_features, &mut sample);
        Self { weight, bias }
    }

    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    #[must_use]
    pub fn forward(&self, x: ArrayView1<'_, f32>) -> Array1<f32> {
        self.weight.dot(&x) + &self.bias
    }

    pub fn store(&self, weights: &mut WeightMap, prefix: &str) {
        weights.insert_array(format!("{prefix}.weight"), &self.weight.view().into_dyn());
        weights.insert_array(format!("{prefix}.bias"), &self.bias.view().into_dyn());
    }
}

/// `BatchNorm1d` using running statistics only
#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    weight: Array1<f32>,
    bias: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    eps: f32,
}

impl BatchNorm1d {
    /// Identity statistics: unit scale, zero shift, mean 0, variance 1
    #[must_use]
    pub fn identity(features: usize) -> Self {
        Self {
            weight: Array1::ones(features),
            bias: Array1::zeros(features),
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
            eps: BATCH_NORM_EPS,
        }
    }

    /// Load `{prefix}.{weight,bias,running_mean,running_var}`
    ///
    /// `num_batches_tracked` is ignored if present.
    pub fn load(
        weights: &mut WeightMap,
        prefix: &str,
        features: usize,
    ) -> Result<Self, WeightError> {
        let running_var = weights.take_vector(&format!("{prefix}.running_var"), features)?;
        if let Some(v) = running_var.iter().find(|v| **v < 0.0 || !v.is_finite()) {
            return Err(WeightError::InvalidValue {
                name: format!("{prefix}.running_var"),
                reason: format!("variance must be finite and non-negative, found {v}"),
            });
        }
        let _ = weights.remove(&format!("{prefix}.num_batches_tracked"));

        Ok(Self {
            weight: weights.take_vector(&format!("{prefix}.weight"), features)?,
            bias: weights.take_vector(&format!("{prefix}.bias"), features)?,
            running_mean: weights.take_vector(&format!("{prefix}.running_mean"), features)?,
            running_var,
            eps: BATCH_NORM_EPS,
        })
    }

    #[must_use]
    pub fn forward(&self, x: ArrayView1<'_, f32>) -> Array1<f32> {
        let mut out = x.to_owned();
        for i in 0..out.len() {
            let scale = self.weight[i] / (self.running_var[i] + self.eps).sqrt();
            out[i] = (out[i] - self.running_mean[i]) * scale + self.bias[i];
        }
        out
    }

    pub fn store(&self, weights: &mut WeightMap, prefix: &str) {
        weights.insert_array(format!("{prefix}.weight"), &self.weight.view().into_dyn());
        weights.insert_array(format!("{prefix}.bias"), &self.bias.view().into_dyn());
        weights.insert_array(
            format!("{prefix}.running_mean"),
            &self.running_mean.view().into_dyn(),
        );
        weights.insert_array(
            format!("{prefix}.running_var"),
            &self.running_var.view().into_dyn(),
        );
    }
}

#[must_use]
pub fn relu(x: Array1<f32>) -> Array1<f32> {
    x.mapv_into(|v| v.max(0.0))
}

/// Layer normalization of one feature vector, in place
pub fn layer_norm(
    mut x: ArrayViewMut1<'_, f32>,
    gamma: ArrayView1<'_, f32>,
    beta: ArrayView1<'_, f32>,
    eps: f32,
) {
    let n = x.len() as f32;
    let mean = x.sum() / n;
    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv = 1.0 / (var + eps).sqrt();
    for ((v, g), b) in x.iter_mut().zip(gamma.iter()).zip(beta.iter()) {
        *v = (*v - mean) * inv * g + b;
    }
}
