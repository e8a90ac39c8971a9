//! Parameter-holding layers: [`Conv2d`], [`Linear`] and [`BatchNorm`].
//!
//! Each layer owns its tensors as public `ndarray` fields so an external
//! optimizer can update them between forward passes, and can export itself
//! to / import itself from a [`StateDict`] under PyTorch-compatible names.

use ndarray::{Array1, Array2, Array4, Axis};
use parking_lot::RwLock;
use rand::{Rng, RngCore};

use crate::checkpoint::{join_key, StateDict, StateLoader};
use crate::error::{GcnError, GcnResult};
use crate::init;
use crate::ops::{self, TemporalConvSpec};

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Whether a forward pass runs with frozen statistics or in training mode.
pub enum Mode<'a> {
    /// Batch norms use running statistics; dropout is disabled.
    Inference,
    /// Batch norms use and accumulate batch statistics; dropout draws from
    /// the given generator.
    Training(&'a mut dyn RngCore),
}

impl Mode<'_> {
    /// `true` for [`Mode::Training`].
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Training(_))
    }
}

// ---------------------------------------------------------------------------
// Conv2d
// ---------------------------------------------------------------------------

/// Convolution with a `(Kt, 1)` kernel sliding along time.
#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `(Cout, Cin, Kt, 1)`.
    pub weight: Array4<f32>,
    /// `(Cout,)` when the layer has a bias.
    pub bias: Option<Array1<f32>>,
    /// Temporal geometry.
    pub spec: TemporalConvSpec,
}

impl Conv2d {
    /// Create a convolution with the framework-default uniform
    /// `±1/sqrt(fan_in)` initialisation.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        spec: TemporalConvSpec,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * spec.kernel;
        let weight = init::uniform_fan_in((out_channels, in_channels, spec.kernel, 1), fan_in, rng);
        let bias = bias.then(|| init::uniform_fan_in(out_channels, fan_in, rng));
        Conv2d { weight, bias, spec }
    }

    /// Input channel count.
    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    /// Output channel count.
    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    /// Apply the convolution to `(N, Cin, T, V)`.
    pub fn forward(&self, x: &Array4<f32>) -> GcnResult<Array4<f32>> {
        ops::temporal_conv(x, &self.weight, self.bias.as_ref(), self.spec)
    }

    pub(crate) fn export(&self, prefix: &str, dict: &mut StateDict) {
        dict.insert_array(join_key(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            dict.insert_array(join_key(prefix, "bias"), bias);
        }
    }

    pub(crate) fn import(&mut self, prefix: &str, loader: &mut StateLoader<'_>) {
        loader.load(&join_key(prefix, "weight"), &mut self.weight);
        if let Some(bias) = self.bias.as_mut() {
            loader.load(&join_key(prefix, "bias"), bias);
        }
    }
}

// ---------------------------------------------------------------------------
// Linear
// ---------------------------------------------------------------------------

/// Fully connected layer applied over the channel axis.
#[derive(Debug, Clone)]
pub struct Linear {
    /// `(out, in)`.
    pub weight: Array2<f32>,
    /// `(out,)`.
    pub bias: Array1<f32>,
}

impl Linear {
    /// Create a layer with the framework-default uniform initialisation.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Linear {
            weight: init::uniform_fan_in((out_features, in_features), in_features, rng),
            bias: init::uniform_fan_in(out_features, in_features, rng),
        }
    }

    /// Input feature count.
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    /// Output feature count.
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    /// Project `(N, in, T, V)` to `(N, out, T, V)`.
    pub fn forward(&self, x: &Array4<f32>) -> GcnResult<Array4<f32>> {
        ops::channel_linear(x, self.weight.view(), &self.bias)
    }

    pub(crate) fn export(&self, prefix: &str, dict: &mut StateDict) {
        dict.insert_array(join_key(prefix, "weight"), &self.weight);
        dict.insert_array(join_key(prefix, "bias"), &self.bias);
    }

    pub(crate) fn import(&mut self, prefix: &str, loader: &mut StateLoader<'_>) {
        loader.load(&join_key(prefix, "weight"), &mut self.weight);
        loader.load(&join_key(prefix, "bias"), &mut self.bias);
    }
}

// ---------------------------------------------------------------------------
// BatchNorm
// ---------------------------------------------------------------------------

/// Running statistics tracked by a [`BatchNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunningStats {
    /// Per-channel running mean.
    pub mean: Array1<f32>,
    /// Per-channel running (unbiased) variance.
    pub var: Array1<f32>,
}

/// Batch normalisation over axis 1 of a `(N, C, T, V)` tensor.
///
/// One-dimensional normalisation of `(N, C, L)` data is expressed by passing
/// `(N, C, L, 1)`.
#[derive(Debug)]
pub struct BatchNorm {
    /// Affine scale.
    pub weight: Array1<f32>,
    /// Affine shift.
    pub bias: Array1<f32>,
    /// Added to the variance before the square root.
    pub eps: f32,
    /// Weight of the newest batch in the running averages.
    pub momentum: f32,
    running: RwLock<RunningStats>,
}

impl BatchNorm {
    /// Identity-initialised normalisation for `channels` channels.
    pub fn new(channels: usize) -> Self {
        BatchNorm {
            weight: Array1::ones(channels),
            bias: Array1::zeros(channels),
            eps: 1e-5,
            momentum: 0.1,
            running: RwLock::new(RunningStats {
                mean: Array1::zeros(channels),
                var: Array1::ones(channels),
            }),
        }
    }

    /// Number of normalised channels.
    pub fn num_features(&self) -> usize {
        self.weight.len()
    }

    /// Snapshot of the running statistics.
    pub fn running_stats(&self) -> RunningStats {
        self.running.read().clone()
    }

    /// Normalise `x`. Training mode normalises with the batch statistics and
    /// folds them into the running averages.
    pub fn forward(&self, x: &Array4<f32>, mode: &Mode<'_>) -> GcnResult<Array4<f32>> {
        let channels = x.len_of(Axis(1));
        if channels != self.num_features() {
            return Err(GcnError::shape_mismatch(
                "batch_norm",
                vec![0, self.num_features(), 0, 0],
                x.shape().to_vec(),
            ));
        }

        let (mean, var) = if mode.is_training() {
            let (mean, var, count) = batch_statistics(x);
            if count < 2 {
                return Err(GcnError::invalid_input(format!(
                    "expected more than 1 value per channel when training, got input shape {:?}",
                    x.shape()
                )));
            }
            let unbiased = count as f32 / (count - 1) as f32;
            let mut running = self.running.write();
            let m = self.momentum;
            running.mean.zip_mut_with(&mean, |r, &b| *r = (1.0 - m) * *r + m * b);
            running.var.zip_mut_with(&var, |r, &b| *r = (1.0 - m) * *r + m * b * unbiased);
            (mean, var)
        } else {
            let running = self.running.read();
            (running.mean.clone(), running.var.clone())
        };

        let mut out = x.clone();
        for (c, mut lane) in out.axis_iter_mut(Axis(1)).enumerate() {
            let scale = self.weight[c] / (var[c] + self.eps).sqrt();
            let shift = self.bias[c] - mean[c] * scale;
            lane.mapv_inplace(|e| e * scale + shift);
        }
        Ok(out)
    }

    pub(crate) fn export(&self, prefix: &str, dict: &mut StateDict) {
        let running = self.running.read();
        dict.insert_array(join_key(prefix, "weight"), &self.weight);
        dict.insert_array(join_key(prefix, "bias"), &self.bias);
        dict.insert_array(join_key(prefix, "running_mean"), &running.mean);
        dict.insert_array(join_key(prefix, "running_var"), &running.var);
    }

    pub(crate) fn import(&mut self, prefix: &str, loader: &mut StateLoader<'_>) {
        loader.load(&join_key(prefix, "weight"), &mut self.weight);
        loader.load(&join_key(prefix, "bias"), &mut self.bias);
        let running = self.running.get_mut();
        loader.load(&join_key(prefix, "running_mean"), &mut running.mean);
        loader.load(&join_key(prefix, "running_var"), &mut running.var);
    }
}

/// Per-channel mean and biased variance over `(N, T, V)`, plus the sample
/// count per channel.
fn batch_statistics(x: &Array4<f32>) -> (Array1<f32>, Array1<f32>, usize) {
    let channels = x.len_of(Axis(1));
    let count = x.len() / channels.max(1);
    let mut mean = Array1::<f32>::zeros(channels);
    let mut var = Array1::<f32>::zeros(channels);
    if count == 0 {
        return (mean, var, 0);
    }
    for (c, lane) in x.axis_iter(Axis(1)).enumerate() {
        let m = lane.sum() / count as f32;
        mean[c] = m;
        var[c] = lane.fold(0.0, |acc, &e| acc + (e - m) * (e - m)) / count as f32;
    }
    (mean, var, count)
}
