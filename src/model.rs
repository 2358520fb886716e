//! Classifier Model
//!
//! Feed-forward network over the standardized feature vector:
//! `[Linear → BatchNorm1d → ReLU → Dropout] × hidden_dims → Linear`.
//! Forward, backward and the optimizer are written directly against `ndarray`.

use crate::FlowGuardError;
use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayViewMutD, Axis, Zip};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

const BN_EPS: f64 = 1e-5;
const BN_MOMENTUM: f64 = 0.1;

/// Architecture hyperparameters, persisted with the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Number of input features
    pub input_dim: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Hidden layer widths
    pub hidden_dims: Vec<usize>,
    /// Dropout rate after each hidden block
    pub dropout: f64,
}

impl MlpConfig {
    fn validate(&self) -> Result<(), FlowGuardError> {
        if self.input_dim == 0 || self.num_classes == 0 {
            return Err(FlowGuardError::InvalidInput(format!(
                "input_dim ({}) and num_classes ({}) must be positive",
                self.input_dim, self.num_classes
            )));
        }
        if self.hidden_dims.iter().any(|&h| h == 0) {
            return Err(FlowGuardError::InvalidInput("hidden widths must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(FlowGuardError::InvalidInput(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Dense layer, `y = x · W + b` with `W` shaped (in, out).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// (in, out)
    pub weight: Array2<f64>,
    /// (out)
    pub bias: Array1<f64>,
}

impl Linear {
    fn init(fan_in: usize, fan_out: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (fan_in as f64).sqrt();
        Self {
            weight: Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-bound..bound)),
            bias: Array1::from_shape_fn(fan_out, |_| rng.gen_range(-bound..bound)),
        }
    }

    fn forward(&self, x: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.weight) + &self.bias
    }
}

/// Batch normalization over the feature axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    /// Scale
    pub gamma: Array1<f64>,
    /// Shift
    pub beta: Array1<f64>,
    /// Running mean used in eval mode
    pub running_mean: Array1<f64>,
    /// Running (unbiased) variance used in eval mode
    pub running_var: Array1<f64>,
}

impl BatchNorm {
    fn new(width: usize) -> Self {
        Self {
            gamma: Array1::ones(width),
            beta: Array1::zeros(width),
            running_mean: Array1::zeros(width),
            running_var: Array1::ones(width),
        }
    }

    fn eval_scale(&self) -> Array1<f64> {
        &self.gamma / &self.running_var.mapv(|v| (v + BN_EPS).sqrt())
    }

    fn forward_eval(&self, z: &Array2<f64>) -> Array2<f64> {
        (z - &self.running_mean) * &self.eval_scale() + &self.beta
    }
}

/// One hidden block: linear projection plus its batch norm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiddenBlock {
    /// Projection
    pub linear: Linear,
    /// Normalization
    pub norm: BatchNorm,
}

/// Batch statistics observed in one training forward pass.
#[derive(Debug, Clone)]
pub struct BatchStats {
    mean: Array1<f64>,
    var: Array1<f64>,
}

/// Parameter gradients, in [`Mlp::parameters_mut`] order.
#[derive(Debug, Clone)]
pub struct Gradients(pub Vec<ArrayD<f64>>);

struct BlockCache {
    input: Array2<f64>,
    xhat: Array2<f64>,
    inv_std: Array1<f64>,
    pre_relu: Array2<f64>,
    mask: Option<Array2<f64>>,
}

/// Multi-layer perceptron classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Mlp {
    config: MlpConfig,
    blocks: Vec<HiddenBlock>,
    head: Linear,
}

impl Mlp {
    /// Randomly initialized network
    pub fn new(config: MlpConfig, rng: &mut StdRng) -> Result<Self, FlowGuardError> {
        config.validate()?;
        let mut blocks = Vec::with_capacity(config.hidden_dims.len());
        let mut prev = config.input_dim;
        for &width in &config.hidden_dims {
            blocks.push(HiddenBlock {
                linear: Linear::init(prev, width, rng),
                norm: BatchNorm::new(width),
            });
            prev = width;
        }
        let head = Linear::init(prev, config.num_classes, rng);
        Ok(Self { config, blocks, head })
    }

    /// Rebuild from persisted weights, checking every shape against `config`.
    pub fn from_parts(
        config: MlpConfig,
        blocks: Vec<HiddenBlock>,
        head: Linear,
    ) -> Result<Self, FlowGuardError> {
        config.validate()?;
        if blocks.len() != config.hidden_dims.len() {
            return Err(FlowGuardError::Artifact(format!(
                "expected {} hidden blocks, found {}",
                config.hidden_dims.len(),
                blocks.len()
            )));
        }

        let mut prev = config.input_dim;
        for (i, (block, &width)) in blocks.iter().zip(&config.hidden_dims).enumerate() {
            let norm = &block.norm;
            let ok = block.linear.weight.dim() == (prev, width)
                && block.linear.bias.len() == width
                && [&norm.gamma, &norm.beta, &norm.running_mean, &norm.running_var]
                    .iter()
                    .all(|a| a.len() == width);
            if !ok {
                return Err(FlowGuardError::Artifact(format!(
                    "hidden block {} does not match shape ({}, {})",
                    i, prev, width
                )));
            }
            prev = width;
        }
        if head.weight.dim() != (prev, config.num_classes) || head.bias.len() != config.num_classes {
            return Err(FlowGuardError::Artifact(format!(
                "output layer does not match shape ({}, {})",
                prev, config.num_classes
            )));
        }

        Ok(Self { config, blocks, head })
    }

    /// Architecture
    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    /// Hidden blocks
    pub fn blocks(&self) -> &[HiddenBlock] {
        &self.blocks
    }

    /// Output layer
    pub fn head(&self) -> &Linear {
        &self.head
    }

    /// Trainable parameters: per block weight, bias, gamma, beta; then head weight, bias.
    pub fn parameters_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        let mut params = Vec::with_capacity(self.blocks.len() * 4 + 2);
        for block in &mut self.blocks {
            params.push(block.linear.weight.view_mut().into_dyn());
            params.push(block.linear.bias.view_mut().into_dyn());
            params.push(block.norm.gamma.view_mut().into_dyn());
            params.push(block.norm.beta.view_mut().into_dyn());
        }
        params.push(self.head.weight.view_mut().into_dyn());
        params.push(self.head.bias.view_mut().into_dyn());
        params
    }

    /// Eval-mode logits (running statistics, no dropout).
    pub fn logits(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut h = x.clone();
        for block in &self.blocks {
            let z = block.linear.forward(&h);
            h = block.norm.forward_eval(&z).mapv(relu);
        }
        self.head.forward(&h)
    }

    /// Eval-mode class probabilities.
    pub fn predict_proba(&self, x: &Array2<f64>) -> Array2<f64> {
        softmax(&self.logits(x))
    }

    /// Class-weighted cross entropy and its gradients for one training batch.
    ///
    /// Uses batch statistics and dropout; does not touch the running statistics.
    pub fn backprop(
        &self,
        x: &Array2<f64>,
        y: &[usize],
        class_weights: &[f64],
        rng: &mut StdRng,
    ) -> (f64, Gradients, Vec<BatchStats>) {
        let batch = x.nrows() as f64;
        let keep = 1.0 - self.config.dropout;

        let mut caches = Vec::with_capacity(self.blocks.len());
        let mut stats = Vec::with_capacity(self.blocks.len());
        let mut h = x.clone();
        for block in &self.blocks {
            let z = block.linear.forward(&h);
            let mean = z.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(z.ncols()));
            let centered = &z - &mean;
            let var = centered.mapv(|v| v * v).sum_axis(Axis(0)) / batch;
            let inv_std = var.mapv(|v| 1.0 / (v + BN_EPS).sqrt());
            let xhat = &centered * &inv_std;
            let pre_relu = &xhat * &block.norm.gamma + &block.norm.beta;
            let mut out = pre_relu.mapv(relu);

            let mask = if self.config.dropout > 0.0 {
                let mask = Array2::from_shape_fn(out.dim(), |_| {
                    if rng.gen::<f64>() < keep { 1.0 / keep } else { 0.0 }
                });
                out *= &mask;
                Some(mask)
            } else {
                None
            };

            caches.push(BlockCache { input: h, xhat, inv_std, pre_relu, mask });
            stats.push(BatchStats { mean, var });
            h = out;
        }

        let logits = self.head.forward(&h);
        let (loss, d_logits) = weighted_cross_entropy(&logits, y, class_weights);

        let mut grads: Vec<ArrayD<f64>> = Vec::with_capacity(self.blocks.len() * 4 + 2);
        let head_w = h.t().dot(&d_logits);
        let head_b = d_logits.sum_axis(Axis(0));
        let mut d_h = d_logits.dot(&self.head.weight.t());

        let mut block_grads = Vec::with_capacity(self.blocks.len());
        for (block, cache) in self.blocks.iter().zip(caches).rev() {
            if let Some(mask) = &cache.mask {
                d_h *= mask;
            }
            let d_y = &d_h * &cache.pre_relu.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
            let d_gamma = (&d_y * &cache.xhat).sum_axis(Axis(0));
            let d_beta = d_y.sum_axis(Axis(0));

            let d_xhat = &d_y * &block.norm.gamma;
            let sum_dxhat = d_xhat.sum_axis(Axis(0));
            let sum_dxhat_xhat = (&d_xhat * &cache.xhat).sum_axis(Axis(0));
            let d_z = (&d_xhat * batch - &sum_dxhat - &cache.xhat * &sum_dxhat_xhat)
                * &(&cache.inv_std / batch);

            let d_w = cache.input.t().dot(&d_z);
            let d_b = d_z.sum_axis(Axis(0));
            d_h = d_z.dot(&block.linear.weight.t());

            block_grads.push([d_w.into_dyn(), d_b.into_dyn(), d_gamma.into_dyn(), d_beta.into_dyn()]);
        }
        for group in block_grads.into_iter().rev() {
            grads.extend(group);
        }
        grads.push(head_w.into_dyn());
        grads.push(head_b.into_dyn());

        (loss, Gradients(grads), stats)
    }

    /// Fold one batch's statistics into the running mean/variance.
    pub fn update_running_stats(&mut self, stats: &[BatchStats], batch_size: usize) {
        let n = batch_size as f64;
        let correction = if batch_size > 1 { n / (n - 1.0) } else { 1.0 };
        for (block, s) in self.blocks.iter_mut().zip(stats) {
            let norm = &mut block.norm;
            norm.running_mean = &norm.running_mean * (1.0 - BN_MOMENTUM) + &s.mean * BN_MOMENTUM;
            norm.running_var =
                &norm.running_var * (1.0 - BN_MOMENTUM) + &(&s.var * correction) * BN_MOMENTUM;
        }
    }

    /// One optimization step on a batch, returning the batch loss.
    pub fn train_step(
        &mut self,
        x: &Array2<f64>,
        y: &[usize],
        class_weights: &[f64],
        optimizer: &mut Adam,
        rng: &mut StdRng,
    ) -> f64 {
        let (loss, grads, stats) = self.backprop(x, y, class_weights, rng);
        self.update_running_stats(&stats, x.nrows());
        optimizer.step(self.parameters_mut(), &grads.0);
        loss
    }

    /// Eval-mode gradient of logit `class` with respect to one input vector.
    pub fn input_gradient(&self, x: ArrayView1<f64>, class: usize) -> Array1<f64> {
        let mut h = x.to_owned().insert_axis(Axis(0));
        let mut pre_relus = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let z = block.linear.forward(&h);
            let y = block.norm.forward_eval(&z);
            h = y.mapv(relu);
            pre_relus.push(y);
        }

        let mut grad = self.head.weight.column(class).to_owned();
        for (block, pre_relu) in self.blocks.iter().zip(pre_relus).rev() {
            let active = pre_relu.row(0).mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
            let d_z = &grad * &active * &block.norm.eval_scale();
            grad = block.linear.weight.dot(&d_z);
        }
        grad
    }
}

#[inline]
fn relu(v: f64) -> f64 {
    v.max(0.0)
}

/// Row-wise softmax.
pub fn softmax(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Index of the largest entry (first on ties).
pub fn argmax(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

/// Row-wise argmax
pub fn predict_classes(logits: &Array2<f64>) -> Vec<usize> {
    logits.rows().into_iter().map(argmax).collect()
}

/// Weighted mean cross entropy `Σ w_y · -ln p_y / Σ w_y` and its gradient on the logits.
pub fn weighted_cross_entropy(
    logits: &Array2<f64>,
    y: &[usize],
    class_weights: &[f64],
) -> (f64, Array2<f64>) {
    let mut grad = softmax(logits);
    let total_weight: f64 = y.iter().map(|&c| class_weights[c]).sum();
    if total_weight <= 0.0 {
        return (0.0, Array2::zeros(logits.dim()));
    }

    let mut loss = 0.0;
    for (i, mut row) in grad.axis_iter_mut(Axis(0)).enumerate() {
        let target = y[i];
        let w = class_weights[target];
        loss -= w * row[target].max(f64::MIN_POSITIVE).ln();
        row[target] -= 1.0;
        row *= w / total_weight;
    }
    (loss / total_weight, grad)
}

/// Adam optimizer
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i32,
    m: Vec<ArrayD<f64>>,
    v: Vec<ArrayD<f64>>,
}

impl Adam {
    /// Adam with the usual defaults (β1 0.9, β2 0.999, eps 1e-8)
    pub fn new(lr: f64) -> Self {
        Self { lr, beta1: 0.9, beta2: 0.999, eps: 1e-8, t: 0, m: Vec::new(), v: Vec::new() }
    }

    /// Apply one update
    pub fn step(&mut self, params: Vec<ArrayViewMutD<'_, f64>>, grads: &[ArrayD<f64>]) {
        if self.m.is_empty() {
            self.m = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
            self.v = grads.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect();
        }
        self.t += 1;
        let (b1, b2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);
        let bc1 = 1.0 - b1.powi(self.t);
        let bc2 = 1.0 - b2.powi(self.t);

        for (((mut p, g), m), v) in params
            .into_iter()
            .zip(grads)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            Zip::from(&mut p)
                .and(g)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= lr * (*m / bc1) / ((*v / bc2).sqrt() + eps);
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    fn small_net(dropout: f64) -> Mlp {
        let mut rng = StdRng::seed_from_u64(11);
        Mlp::new(
            MlpConfig { input_dim: 3, num_classes: 3, hidden_dims: vec![5, 4], dropout },
            &mut rng,
        )
        .unwrap()
    }

    fn batch() -> (Array2<f64>, Vec<usize>) {
        let x = array![
            [0.5, -1.2, 0.3],
            [1.5, 0.2, -0.7],
            [-0.3, 0.8, 1.1],
            [0.9, -0.4, -1.3],
            [-1.1, 1.6, 0.4],
            [0.2, 0.1, 0.9]
        ];
        (x, vec![0, 1, 2, 1, 0, 2])
    }

    #[test]
    fn test_backprop_matches_finite_differences() {
        let net = small_net(0.0);
        let (x, y) = batch();
        let weights = [0.5, 1.0, 2.0];
        let mut rng = StdRng::seed_from_u64(0);
        let (_, grads, _) = net.backprop(&x, &y, &weights, &mut rng);

        let h = 1e-6;
        for (k, analytic) in grads.0.iter().enumerate() {
            for idx in 0..analytic.len().min(4) {
                let mut plus = net.clone();
                let mut minus = net.clone();
                plus.parameters_mut()[k].as_slice_mut().unwrap()[idx] += h;
                minus.parameters_mut()[k].as_slice_mut().unwrap()[idx] -= h;
                let lp = plus.backprop(&x, &y, &weights, &mut rng).0;
                let lm = minus.backprop(&x, &y, &weights, &mut rng).0;
                let numeric = (lp - lm) / (2.0 * h);
                let a = analytic.as_slice().unwrap()[idx];
                assert!(
                    (numeric - a).abs() < 1e-5 + 1e-4 * a.abs(),
                    "param {k}[{idx}]: analytic {a} numeric {numeric}"
                );
            }
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_differences() {
        let mut net = small_net(0.0);
        let (x, y) = batch();
        let mut opt = Adam::new(1e-2);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..5 {
            net.train_step(&x, &y, &[1.0, 1.0, 1.0], &mut opt, &mut rng);
        }

        let sample = array![0.4, -0.2, 0.7];
        let class = 2;
        let grad = net.input_gradient(sample.view(), class);
        let h = 1e-6;
        for i in 0..3 {
            let mut plus = sample.clone();
            let mut minus = sample.clone();
            plus[i] += h;
            minus[i] -= h;
            let lp = net.logits(&plus.insert_axis(Axis(0)))[[0, class]];
            let lm = net.logits(&minus.insert_axis(Axis(0)))[[0, class]];
            let numeric = (lp - lm) / (2.0 * h);
            assert!((numeric - grad[i]).abs() < 1e-6, "feature {i}: {} vs {}", grad[i], numeric);
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut net = small_net(0.1);
        let (x, y) = batch();
        let weights = [1.0, 1.0, 1.0];
        let mut opt = Adam::new(1e-2);
        let mut rng = StdRng::seed_from_u64(5);
        let before = weighted_cross_entropy(&net.logits(&x), &y, &weights).0;
        for _ in 0..300 {
            net.train_step(&x, &y, &weights, &mut opt, &mut rng);
        }
        let after = weighted_cross_entropy(&net.logits(&x), &y, &weights).0;
        assert!(after < before, "loss went from {before} to {after}");
    }

    #[test]
    fn test_probabilities_sum_to_one() {
        let net = small_net(0.3);
        let (x, _) = batch();
        let p = net.predict_proba(&x);
        assert_eq!(p.shape(), &[6, 3]);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_from_parts_rejects_shape_mismatch() {
        let net = small_net(0.0);
        let mut config = net.config().clone();
        config.hidden_dims = vec![5, 6];
        let err = Mlp::from_parts(config, net.blocks().to_vec(), net.head().clone()).unwrap_err();
        assert!(matches!(err, FlowGuardError::Artifact(_)));

        let ok = Mlp::from_parts(net.config().clone(), net.blocks().to_vec(), net.head().clone());
        assert_eq!(ok.unwrap(), net);
    }

    #[test]
    fn test_invalid_dropout() {
        let mut rng = StdRng::seed_from_u64(0);
        let config = MlpConfig { input_dim: 2, num_classes: 2, hidden_dims: vec![2], dropout: 1.0 };
        assert!(Mlp::new(config, &mut rng).is_err());
    }
}
