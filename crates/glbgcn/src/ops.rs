//! Dense tensor kernels used by the layers.
//!
//! All tensors use the `(N, C, T, V)` layout: batch, channels, time, graph
//! nodes. Convolutions only ever slide along time, so every kernel here is a
//! sequence of `(Cout × Cin) · (Cin × T·V)` matrix products.

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, Array4, ArrayView2, ArrayView3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GcnError, GcnResult};

/// Kernel geometry of a convolution along the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalConvSpec {
    /// Number of taps along time.
    pub kernel: usize,
    /// Step between output frames.
    pub stride: usize,
    /// Zero frames added on both ends.
    pub padding: usize,
    /// Spacing between taps.
    pub dilation: usize,
}

impl Default for TemporalConvSpec {
    fn default() -> Self {
        TemporalConvSpec { kernel: 1, stride: 1, padding: 0, dilation: 1 }
    }
}

impl TemporalConvSpec {
    /// Number of output frames for `frames` input frames, or `None` when the
    /// padded sequence is shorter than the dilated kernel.
    pub fn output_frames(&self, frames: usize) -> Option<usize> {
        if self.kernel == 0 || self.stride == 0 {
            return None;
        }
        let span = self.dilation * (self.kernel - 1) + 1;
        let padded = frames + 2 * self.padding;
        if padded < span {
            return None;
        }
        Some((padded - span) / self.stride + 1)
    }
}

/// 2-D convolution with a `(Kt, 1)` kernel.
///
/// `weight` is `(Cout, Cin, Kt, 1)`; `x` is `(N, Cin, T, V)`; the result is
/// `(N, Cout, T', V)`.
pub fn temporal_conv(
    x: &Array4<f32>,
    weight: &Array4<f32>,
    bias: Option<&Array1<f32>>,
    spec: TemporalConvSpec,
) -> GcnResult<Array4<f32>> {
    let (n, cin, t, v) = x.dim();
    let (cout, wcin, kt, kw) = weight.dim();
    if wcin != cin || kw != 1 || kt != spec.kernel {
        return Err(GcnError::shape_mismatch(
            "temporal_conv weight",
            vec![0, cin, spec.kernel, 1],
            weight.shape().to_vec(),
        ));
    }
    let t_out = spec.output_frames(t).ok_or_else(|| {
        GcnError::invalid_input(format!(
            "sequence of {t} frames is too short for a temporal kernel of {kt} (padding {}, dilation {})",
            spec.padding, spec.dilation
        ))
    })?;

    let mut out = Array4::<f32>::zeros((n, cout, t_out, v));
    let mut cols = Array2::<f32>::zeros((cin, t_out * v));
    let mut acc = Array2::<f32>::zeros((cout, t_out * v));

    for b in 0..n {
        let xb = x.index_axis(Axis(0), b);
        acc.fill(0.0);
        for k in 0..kt {
            cols.fill(0.0);
            for to in 0..t_out {
                let ti = (to * spec.stride + k * spec.dilation) as isize - spec.padding as isize;
                if ti < 0 || ti >= t as isize {
                    continue;
                }
                cols.slice_mut(s![.., to * v..(to + 1) * v])
                    .assign(&xb.index_axis(Axis(1), ti as usize));
            }
            let wk = weight.slice(s![.., .., k, 0]);
            general_mat_mul(1.0, &wk, &cols, 1.0, &mut acc);
        }
        if let Some(bias) = bias {
            for (mut row, &bb) in acc.axis_iter_mut(Axis(0)).zip(bias.iter()) {
                row.mapv_inplace(|e| e + bb);
            }
        }
        let shaped = acc.view().into_shape((cout, t_out, v))?;
        out.index_axis_mut(Axis(0), b).assign(&shaped);
    }
    Ok(out)
}

/// Contract kernel-stacked channels against the adjacency:
/// `out[n, c, t, w] = Σ_k Σ_v x[n, k·C + c, t, v] · a[k, v, w]`.
pub fn graph_contract(x: &Array4<f32>, a: ArrayView3<'_, f32>) -> GcnResult<Array4<f32>> {
    let (n, kc, t, v) = x.dim();
    let (k, av, aw) = a.dim();
    if k == 0 || kc % k != 0 || av != v {
        return Err(GcnError::shape_mismatch(
            "graph_contract adjacency",
            vec![k, v, 0],
            a.shape().to_vec(),
        ));
    }
    let c = kc / k;

    let mut out = Array4::<f32>::zeros((n, c, t, aw));
    let mut acc = Array2::<f32>::zeros((c * t, aw));
    for b in 0..n {
        acc.fill(0.0);
        for ki in 0..k {
            let xs = x.slice(s![b, ki * c..(ki + 1) * c, .., ..]).to_owned();
            let xs = xs.into_shape((c * t, v))?;
            general_mat_mul(1.0, &xs, &a.index_axis(Axis(0), ki), 1.0, &mut acc);
        }
        let shaped = acc.view().into_shape((c, t, aw))?;
        out.index_axis_mut(Axis(0), b).assign(&shaped);
    }
    Ok(out)
}

/// Affine map over the channel axis: `out[n, o, t, v] = Σ_c W[o, c] x[n, c, t, v] + b[o]`.
pub fn channel_linear(
    x: &Array4<f32>,
    weight: ArrayView2<'_, f32>,
    bias: &Array1<f32>,
) -> GcnResult<Array4<f32>> {
    let (n, cin, t, v) = x.dim();
    let (cout, wcin) = weight.dim();
    if wcin != cin || bias.len() != cout {
        return Err(GcnError::shape_mismatch(
            "channel_linear weight",
            vec![cout, cin],
            weight.shape().to_vec(),
        ));
    }
    let mut out = Array4::<f32>::zeros((n, cout, t, v));
    for b in 0..n {
        let xb = x.index_axis(Axis(0), b).to_owned().into_shape((cin, t * v))?;
        let mut yb = weight.dot(&xb);
        for (mut row, &bb) in yb.axis_iter_mut(Axis(0)).zip(bias.iter()) {
            row.mapv_inplace(|e| e + bb);
        }
        out.index_axis_mut(Axis(0), b).assign(&yb.into_shape((cout, t, v))?);
    }
    Ok(out)
}

/// Element-wise `max(x, 0)`.
pub fn relu(mut x: Array4<f32>) -> Array4<f32> {
    x.mapv_inplace(|e| e.max(0.0));
    x
}

/// Inverted dropout: zero each element with probability `p` and scale the
/// survivors by `1 / (1 - p)`.
pub fn dropout<R: Rng + ?Sized>(mut x: Array4<f32>, p: f32, rng: &mut R) -> Array4<f32> {
    if p <= 0.0 {
        return x;
    }
    let keep = 1.0 / (1.0 - p);
    x.mapv_inplace(|e| if rng.gen::<f32>() < p { 0.0 } else { e * keep });
    x
}

/// Append `extra` (`(N, C, T, 1)`) to `x` (`(N, C, T, V)`) along the node axis.
pub fn concat_nodes(x: &Array4<f32>, extra: &Array4<f32>) -> GcnResult<Array4<f32>> {
    let (n, c, t, _) = x.dim();
    if extra.dim() != (n, c, t, 1) {
        return Err(GcnError::shape_mismatch(
            "concat_nodes",
            vec![n, c, t, 1],
            extra.shape().to_vec(),
        ));
    }
    Ok(ndarray::concatenate(Axis(3), &[x.view(), extra.view()])?)
}

/// Split `(N, C, T, V + 1)` into the first `V` nodes and the last node.
pub fn split_last_node(x: &Array4<f32>) -> GcnResult<(Array4<f32>, Array4<f32>)> {
    let nodes = x.len_of(Axis(3));
    if nodes < 2 {
        return Err(GcnError::invalid_input(format!(
            "cannot split a virtual node from a tensor with {nodes} node(s)"
        )));
    }
    let joints = x.slice(s![.., .., .., ..nodes - 1]).to_owned();
    let last = x.slice(s![.., .., .., nodes - 1..]).to_owned();
    Ok((joints, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn output_frames_matches_conv_arithmetic() {
        let spec = TemporalConvSpec { kernel: 9, stride: 2, padding: 4, dilation: 1 };
        assert_eq!(spec.output_frames(30), Some(15));
        assert_eq!(spec.output_frames(15), Some(8));
        let spec = TemporalConvSpec { kernel: 3, stride: 1, padding: 0, dilation: 2 };
        assert_eq!(spec.output_frames(4), None);
        assert_eq!(spec.output_frames(5), Some(1));
    }

    #[test]
    fn identity_kernel_copies_input() {
        let x = Array4::from_shape_fn((2, 3, 4, 5), |(n, c, t, v)| (n * 1000 + c * 100 + t * 10 + v) as f32);
        let mut w = Array4::<f32>::zeros((3, 3, 1, 1));
        for c in 0..3 {
            w[[c, c, 0, 0]] = 1.0;
        }
        let y = temporal_conv(&x, &w, None, TemporalConvSpec::default()).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn padded_kernel_sums_neighbouring_frames() {
        let x = Array4::from_shape_fn((1, 1, 4, 1), |(_, _, t, _)| (t + 1) as f32);
        let w = Array4::<f32>::ones((1, 1, 3, 1));
        let spec = TemporalConvSpec { kernel: 3, stride: 1, padding: 1, dilation: 1 };
        let y = temporal_conv(&x, &w, Some(&Array1::from_elem(1, 0.5)), spec).unwrap();
        let got: Vec<f32> = y.iter().copied().collect();
        assert_eq!(got, vec![3.5, 6.5, 9.5, 7.5]);
    }

    #[test]
    fn stride_only_touches_time() {
        let x = Array4::<f32>::ones((1, 2, 9, 7));
        let w = Array4::<f32>::ones((4, 2, 9, 1));
        let spec = TemporalConvSpec { kernel: 9, stride: 2, padding: 4, dilation: 1 };
        let y = temporal_conv(&x, &w, None, spec).unwrap();
        assert_eq!(y.dim(), (1, 4, 5, 7));
    }

    #[test]
    fn strided_padded_conv_matches_direct_sum() {
        let x = Array4::from_shape_fn((2, 3, 11, 4), |(n, c, t, v)| ((n * 37 + c * 11 + t * 5 + v) as f32 * 0.13).sin());
        let w = Array4::from_shape_fn((5, 3, 9, 1), |(o, c, k, _)| ((o * 7 + c * 3 + k) as f32 * 0.21).cos());
        let bias = Array1::from_shape_fn(5, |o| o as f32 * 0.1);
        let spec = TemporalConvSpec { kernel: 9, stride: 2, padding: 4, dilation: 1 };
        let y = temporal_conv(&x, &w, Some(&bias), spec).unwrap();
        assert_eq!(y.dim(), (2, 5, 6, 4));

        for ((n, o, to, v), &got) in y.indexed_iter() {
            let mut want = bias[o];
            for c in 0..3 {
                for k in 0..9 {
                    let ti = (to * 2 + k) as isize - 4;
                    if (0..11).contains(&ti) {
                        want += w[[o, c, k, 0]] * x[[n, c, ti as usize, v]];
                    }
                }
            }
            assert!((got - want).abs() < 1e-4, "({n}, {o}, {to}, {v}): {got} vs {want}");
        }
    }

    #[test]
    fn contraction_matches_direct_sum() {
        let x = Array4::from_shape_fn((2, 6, 3, 4), |(n, c, t, v)| ((n * 5 + c * 3 + t * 2 + v) as f32 * 0.17).sin());
        let a = Array3::from_shape_fn((3, 4, 4), |(k, v, w)| ((k * 16 + v * 4 + w) as f32 * 0.07).cos());
        let y = graph_contract(&x, a.view()).unwrap();
        assert_eq!(y.dim(), (2, 2, 3, 4));

        for ((n, c, t, w), &got) in y.indexed_iter() {
            let mut want = 0.0f32;
            for k in 0..3 {
                for v in 0..4 {
                    want += x[[n, k * 2 + c, t, v]] * a[[k, v, w]];
                }
            }
            assert!((got - want).abs() < 1e-5, "({n}, {c}, {t}, {w}): {got} vs {want}");
        }
    }

    #[test]
    fn contraction_with_identity_adjacency_sums_kernels() {
        let x = Array4::from_shape_fn((1, 4, 2, 3), |(_, c, t, v)| (c * 10 + t + v) as f32);
        let mut a = Array3::<f32>::zeros((2, 3, 3));
        for k in 0..2 {
            for v in 0..3 {
                a[[k, v, v]] = 1.0;
            }
        }
        let y = graph_contract(&x, a.view()).unwrap();
        assert_eq!(y.dim(), (1, 2, 2, 3));
        // channel 0 gathers kernel 0 channel 0 and kernel 1 channel 0 (= input channel 2)
        assert_eq!(y[[0, 0, 1, 2]], x[[0, 0, 1, 2]] + x[[0, 2, 1, 2]]);
    }

    #[test]
    fn contraction_rejects_indivisible_channels() {
        let x = Array4::<f32>::zeros((1, 5, 2, 3));
        let a = Array3::<f32>::zeros((2, 3, 3));
        assert!(graph_contract(&x, a.view()).is_err());
    }

    #[test]
    fn split_undoes_concat() {
        let x = Array4::from_shape_fn((2, 3, 4, 5), |(n, c, t, v)| (n + c + t + v) as f32);
        let f = Array4::from_elem((2, 3, 4, 1), -1.0f32);
        let joined = concat_nodes(&x, &f).unwrap();
        assert_eq!(joined.dim(), (2, 3, 4, 6));
        let (joints, last) = split_last_node(&joined).unwrap();
        assert_eq!(joints, x);
        assert_eq!(last, f);
    }

    #[test]
    fn zero_rate_dropout_is_identity() {
        let x = Array4::<f32>::ones((1, 2, 3, 4));
        let mut rng = rand::thread_rng();
        assert_eq!(dropout(x.clone(), 0.0, &mut rng), x);
    }
}
