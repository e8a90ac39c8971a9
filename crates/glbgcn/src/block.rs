//! Spatio-temporal graph convolution blocks.
//!
//! ```text
//! x ──► GraphConvolution ──► BN ─ ReLU ─ Conv(Kt×1, stride s) ─ BN ─ Dropout ──+── ReLU ──► y
//!  │                                                                           │
//!  └──────────────────── Residual (none | identity | 1×1 conv + BN) ───────────┘
//! ```
//!
//! The adjacency travels alongside the activations and is handed back
//! unchanged, so blocks can be chained without re-supplying it.

use ndarray::{Array4, ArrayView3};
use rand::Rng;

use crate::checkpoint::{join_key, StateDict, StateLoader};
use crate::error::{ConfigError, GcnError, GcnResult};
use crate::layers::{BatchNorm, Conv2d, Mode};
use crate::ops::{self, TemporalConvSpec};

// ---------------------------------------------------------------------------
// GraphConvolution
// ---------------------------------------------------------------------------

/// Shared temporal convolution followed by an adjacency contraction.
///
/// Input `(N, Cin, T, V)` with adjacency `(K, V, V)`; output
/// `(N, Cout, T', V)`.
#[derive(Debug, Clone)]
pub struct GraphConvolution {
    kernel_size: usize,
    /// Expands `Cin` to `Cout · K`.
    pub conv: Conv2d,
}

impl GraphConvolution {
    /// Unit with the default temporal geometry (`1×1`, stride 1, no padding)
    /// and a bias.
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        rng: &mut R,
    ) -> Self {
        Self::with_temporal(in_channels, out_channels, kernel_size, TemporalConvSpec::default(), true, rng)
    }

    /// Unit with an explicit temporal kernel, stride, padding and dilation.
    pub fn with_temporal<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        temporal: TemporalConvSpec,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let conv = Conv2d::new(in_channels, out_channels * kernel_size, temporal, bias, rng);
        GraphConvolution { kernel_size, conv }
    }

    /// Number of adjacency partitions this unit expects.
    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Convolve and contract. Fails when `a` has a different number of
    /// partitions than the unit was built for.
    pub fn forward<'a>(
        &self,
        x: &Array4<f32>,
        a: ArrayView3<'a, f32>,
    ) -> GcnResult<(Array4<f32>, ArrayView3<'a, f32>)> {
        if a.dim().0 != self.kernel_size {
            return Err(GcnError::shape_mismatch(
                "graph convolution adjacency",
                vec![self.kernel_size, x.dim().3, x.dim().3],
                a.shape().to_vec(),
            ));
        }
        let y = self.conv.forward(x)?;
        let y = ops::graph_contract(&y, a)?;
        Ok((y, a))
    }

    fn export(&self, prefix: &str, dict: &mut StateDict) {
        self.conv.export(&join_key(prefix, "conv"), dict);
    }

    fn import(&mut self, prefix: &str, loader: &mut StateLoader<'_>) {
        self.conv.import(&join_key(prefix, "conv"), loader);
    }
}

// ---------------------------------------------------------------------------
// Residual
// ---------------------------------------------------------------------------

/// Skip path of a [`SpatioTemporalBlock`].
#[derive(Debug)]
pub enum Residual {
    /// Contributes exactly zero.
    None,
    /// Passes the input through.
    Identity,
    /// `1×1` convolution with the block's temporal stride, then BN.
    Projected {
        /// Channel/stride projection.
        conv: Conv2d,
        /// Normalisation after the projection.
        bn: BatchNorm,
    },
}

impl Residual {
    /// Pick the skip path for a block: disabled → `None`; same shape →
    /// `Identity`; otherwise a learned projection.
    pub fn select<R: Rng + ?Sized>(
        enabled: bool,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        rng: &mut R,
    ) -> Self {
        if !enabled {
            Residual::None
        } else if in_channels == out_channels && stride == 1 {
            Residual::Identity
        } else {
            let spec = TemporalConvSpec { kernel: 1, stride, padding: 0, dilation: 1 };
            Residual::Projected {
                conv: Conv2d::new(in_channels, out_channels, spec, true, rng),
                bn: BatchNorm::new(out_channels),
            }
        }
    }

    /// Evaluate the skip path; `None` yields no tensor.
    pub fn forward(&self, x: &Array4<f32>, mode: &Mode<'_>) -> GcnResult<Option<Array4<f32>>> {
        match self {
            Residual::None => Ok(None),
            Residual::Identity => Ok(Some(x.clone())),
            Residual::Projected { conv, bn } => Ok(Some(bn.forward(&conv.forward(x)?, mode)?)),
        }
    }
}

// ---------------------------------------------------------------------------
// SpatioTemporalBlock
// ---------------------------------------------------------------------------

/// Hyper-parameters of one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// `(temporal kernel, spatial kernel)`; the temporal kernel must be odd.
    pub kernel_size: (usize, usize),
    /// Temporal stride.
    pub stride: usize,
    /// Dropout after the temporal convolution.
    pub dropout: f32,
    /// Whether the block has a skip path.
    pub residual: bool,
}

/// Graph convolution, temporal convolution and skip path.
#[derive(Debug)]
pub struct SpatioTemporalBlock {
    /// Spatial graph convolution.
    pub gcn: GraphConvolution,
    /// BN before the temporal convolution (`tcn.0`).
    pub tcn_bn_in: BatchNorm,
    /// Temporal convolution (`tcn.2`).
    pub tcn_conv: Conv2d,
    /// BN after the temporal convolution (`tcn.3`).
    pub tcn_bn_out: BatchNorm,
    /// Skip path.
    pub residual: Residual,
    dropout: f32,
    stride: usize,
}

impl SpatioTemporalBlock {
    /// Build a block.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] when the temporal kernel is even or the
    /// spatial kernel or stride is zero.
    pub fn new<R: Rng + ?Sized>(cfg: BlockConfig, rng: &mut R) -> Result<Self, ConfigError> {
        let (t_kernel, s_kernel) = cfg.kernel_size;
        if t_kernel % 2 != 1 {
            return Err(ConfigError::invalid_value(
                "kernel_size",
                format!("temporal kernel must be odd, got {t_kernel}"),
            ));
        }
        if s_kernel == 0 {
            return Err(ConfigError::invalid_value("kernel_size", "spatial kernel must be > 0"));
        }
        if cfg.stride == 0 {
            return Err(ConfigError::invalid_value("stride", "must be > 0"));
        }

        let gcn = GraphConvolution::new(cfg.in_channels, cfg.out_channels, s_kernel, rng);
        let tcn_bn_in = BatchNorm::new(cfg.out_channels);
        let spec = TemporalConvSpec {
            kernel: t_kernel,
            stride: cfg.stride,
            padding: (t_kernel - 1) / 2,
            dilation: 1,
        };
        let tcn_conv = Conv2d::new(cfg.out_channels, cfg.out_channels, spec, true, rng);
        let tcn_bn_out = BatchNorm::new(cfg.out_channels);
        let residual = Residual::select(cfg.residual, cfg.in_channels, cfg.out_channels, cfg.stride, rng);

        Ok(SpatioTemporalBlock {
            gcn,
            tcn_bn_in,
            tcn_conv,
            tcn_bn_out,
            residual,
            dropout: cfg.dropout,
            stride: cfg.stride,
        })
    }

    /// Input channel count.
    pub fn in_channels(&self) -> usize {
        self.gcn.conv.in_channels()
    }

    /// Output channel count.
    pub fn out_channels(&self) -> usize {
        self.tcn_conv.out_channels()
    }

    /// Temporal stride.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Run the block on `(N, Cin, T, V)` with adjacency `(K, V, V)`.
    pub fn forward<'a>(
        &self,
        x: &Array4<f32>,
        a: ArrayView3<'a, f32>,
        mode: &mut Mode<'_>,
    ) -> GcnResult<(Array4<f32>, ArrayView3<'a, f32>)> {
        let res = self.residual.forward(x, mode)?;
        let (g, a) = self.gcn.forward(x, a)?;

        let h = self.tcn_bn_in.forward(&g, mode)?;
        let h = ops::relu(h);
        let h = self.tcn_conv.forward(&h)?;
        let mut h = self.tcn_bn_out.forward(&h, mode)?;
        if let Mode::Training(rng) = mode {
            h = ops::dropout(h, self.dropout, &mut **rng);
        }

        if let Some(res) = res {
            if res.dim() != h.dim() {
                return Err(GcnError::shape_mismatch(
                    "block residual",
                    h.shape().to_vec(),
                    res.shape().to_vec(),
                ));
            }
            h += &res;
        }
        Ok((ops::relu(h), a))
    }

    pub(crate) fn export(&self, prefix: &str, dict: &mut StateDict) {
        self.gcn.export(&join_key(prefix, "gcn"), dict);
        self.tcn_bn_in.export(&join_key(prefix, "tcn.0"), dict);
        self.tcn_conv.export(&join_key(prefix, "tcn.2"), dict);
        self.tcn_bn_out.export(&join_key(prefix, "tcn.3"), dict);
        if let Residual::Projected { conv, bn } = &self.residual {
            conv.export(&join_key(prefix, "residual.0"), dict);
            bn.export(&join_key(prefix, "residual.1"), dict);
        }
    }

    pub(crate) fn import(&mut self, prefix: &str, loader: &mut StateLoader<'_>) {
        self.gcn.import(&join_key(prefix, "gcn"), loader);
        self.tcn_bn_in.import(&join_key(prefix, "tcn.0"), loader);
        self.tcn_conv.import(&join_key(prefix, "tcn.2"), loader);
        self.tcn_bn_out.import(&join_key(prefix, "tcn.3"), loader);
        if let Residual::Projected { conv, bn } = &mut self.residual {
            conv.import(&join_key(prefix, "residual.0"), loader);
            bn.import(&join_key(prefix, "residual.1"), loader);
        }
    }

    /// Every convolution in the block, for re-initialisation.
    pub(crate) fn convs_mut(&mut self) -> Vec<&mut Conv2d> {
        let mut convs = vec![&mut self.gcn.conv, &mut self.tcn_conv];
        if let Residual::Projected { conv, .. } = &mut self.residual {
            convs.push(conv);
        }
        convs
    }

    /// Every batch norm in the block, for re-initialisation.
    pub(crate) fn batch_norms_mut(&mut self) -> Vec<&mut BatchNorm> {
        let mut bns = vec![&mut self.tcn_bn_in, &mut self.tcn_bn_out];
        if let Residual::Projected { bn, .. } = &mut self.residual {
            bns.push(bn);
        }
        bns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn identity_adjacency(k: usize, v: usize) -> Array3<f32> {
        Array3::from_shape_fn((k, v, v), |(_, i, j)| if i == j { 1.0 / k as f32 } else { 0.0 })
    }

    #[test]
    fn even_temporal_kernel_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let cfg = BlockConfig {
            in_channels: 3,
            out_channels: 8,
            kernel_size: (4, 3),
            stride: 1,
            dropout: 0.0,
            residual: true,
        };
        assert!(SpatioTemporalBlock::new(cfg, &mut rng).is_err());
    }

    #[test]
    fn residual_selection_follows_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(Residual::select(false, 8, 8, 1, &mut rng), Residual::None));
        assert!(matches!(Residual::select(true, 8, 8, 1, &mut rng), Residual::Identity));
        assert!(matches!(Residual::select(true, 8, 8, 2, &mut rng), Residual::Projected { .. }));
        assert!(matches!(Residual::select(true, 4, 8, 1, &mut rng), Residual::Projected { .. }));
    }

    #[test]
    fn graph_convolution_rejects_wrong_partition_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let unit = GraphConvolution::new(3, 4, 3, &mut rng);
        let x = Array4::<f32>::ones((1, 3, 5, 6));
        let a = identity_adjacency(2, 6);
        assert!(matches!(
            unit.forward(&x, a.view()),
            Err(GcnError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn graph_convolution_passes_adjacency_through() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let unit = GraphConvolution::new(3, 4, 3, &mut rng);
        let x = Array4::<f32>::ones((2, 3, 5, 6));
        let a = identity_adjacency(3, 6);
        let (y, a_out) = unit.forward(&x, a.view()).unwrap();
        assert_eq!(y.dim(), (2, 4, 5, 6));
        assert_eq!(a_out, a.view());
    }

    #[test]
    fn strided_block_halves_time_only() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let cfg = BlockConfig {
            in_channels: 4,
            out_channels: 8,
            kernel_size: (9, 3),
            stride: 2,
            dropout: 0.0,
            residual: true,
        };
        let block = SpatioTemporalBlock::new(cfg, &mut rng).unwrap();
        let x = Array4::from_shape_fn((2, 4, 10, 6), |(n, c, t, v)| ((n + c + t + v) % 5) as f32 * 0.1);
        let a = identity_adjacency(3, 6);
        let (y, _) = block.forward(&x, a.view(), &mut Mode::Inference).unwrap();
        assert_eq!(y.dim(), (2, 8, 5, 6));
        assert!(y.iter().all(|&e| e >= 0.0));
    }
}
