//! Weight-initialisation schemes.
//!
//! Construction uses the framework-default uniform `±1/sqrt(fan_in)` draw.
//! [`Glbgcn::init_weights`](crate::backbone::Glbgcn::init_weights) then
//! re-initialises from scratch with the schemes below: Kaiming-normal for
//! convolutions, a narrow normal for linear layers and identity batch norms.

use ndarray::{Array, Dimension, ShapeBuilder};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::layers::{BatchNorm, Conv2d, Linear};

/// Standard deviation of the normal draw for linear weights. Narrower than
/// the framework's `normal_init` default of 1.
pub const LINEAR_INIT_STD: f32 = 0.01;

/// Uniform draw in `[-1/sqrt(fan_in), 1/sqrt(fan_in))`.
pub fn uniform_fan_in<Sh, D, R>(shape: Sh, fan_in: usize, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    Array::from_shape_simple_fn(shape, || rng.gen_range(-bound..bound))
}

/// Normal draw with the given mean and standard deviation.
pub fn normal<Sh, D, R>(shape: Sh, mean: f32, std: f32, rng: &mut R) -> Array<f32, D>
where
    Sh: ShapeBuilder<Dim = D>,
    D: Dimension,
    R: Rng + ?Sized,
{
    Array::from_shape_simple_fn(shape, || {
        let z: f32 = rng.sample(StandardNormal);
        mean + std * z
    })
}

/// Kaiming-normal in `fan_out` mode with the ReLU gain; bias set to zero.
pub fn kaiming_conv<R: Rng + ?Sized>(conv: &mut Conv2d, rng: &mut R) {
    let (out_channels, _, kt, kw) = conv.weight.dim();
    let fan_out = (out_channels * kt * kw).max(1);
    let std = (2.0 / fan_out as f32).sqrt();
    conv.weight = normal(conv.weight.raw_dim(), 0.0, std, rng);
    if let Some(bias) = conv.bias.as_mut() {
        bias.fill(0.0);
    }
}

/// Normal(0, [`LINEAR_INIT_STD`]) weights; bias set to zero.
pub fn normal_linear<R: Rng + ?Sized>(linear: &mut Linear, rng: &mut R) {
    linear.weight = normal(linear.weight.raw_dim(), 0.0, LINEAR_INIT_STD, rng);
    linear.bias.fill(0.0);
}

/// Unit scale, zero shift. Running statistics are left alone.
pub fn constant_batch_norm(bn: &mut BatchNorm, value: f32) {
    bn.weight.fill(value);
    bn.bias.fill(0.0);
}
