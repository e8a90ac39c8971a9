//! The ten-stage GLBGCN backbone.
//!
//! # Forward pass
//!
//! ```text
//! x (N, Cp+Cf, T, V, M)
//!   │
//!   ├── pose    (first Cp channels) ── data_bn ─────────────────────► pose (N·M, Cp, T, V)
//!   └── feature (last Cf channels)  ── data_bn_feature ── reduce V ─► feature (N·M, Cf, T, 1)
//!                                                                   └► clone (captured once)
//!
//! for stage in 0..10:
//!   feature = transform[stage](feature) (+ residue[stage](clone) for stage < 4)
//!   x       = block[stage](pose ⧺ feature, A ⊙ importance[stage])      (V+1 nodes)
//!   pose, feature = x[.., ..V], x[.., V..]
//!
//! return x (N·M, 256, T', V+1)
//! ```

use std::path::Path;

use ndarray::{s, Array3, Array4, Array5, ArrayView5, Axis, CowArray, Ix3};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::block::{BlockConfig, SpatioTemporalBlock};
use crate::checkpoint::{LoadReport, StateDict, StateLoader};
use crate::config::BackboneConfig;
use crate::error::{GcnError, GcnResult};
use crate::fusion::FeatureFusion;
use crate::graph::Graph;
use crate::init;
use crate::layers::{BatchNorm, Linear, Mode};
use crate::ops;

/// Number of spatio-temporal stages.
pub const NUM_STAGES: usize = 10;

/// Leading stages that re-inject the captured feature clone.
pub const NUM_RESIDUE_STAGES: usize = 4;

/// Temporal kernel of every block.
pub const TEMPORAL_KERNEL_SIZE: usize = 9;

/// `(out_channels, temporal stride)` per stage.
pub const STAGE_SCHEDULE: [(usize, usize); NUM_STAGES] = [
    (64, 1),
    (64, 1),
    (64, 1),
    (64, 1),
    (128, 2),
    (128, 1),
    (128, 1),
    (256, 2),
    (256, 1),
    (256, 1),
];

/// Output channels of the final stage.
pub const OUTPUT_CHANNELS: usize = STAGE_SCHEDULE[NUM_STAGES - 1].0;

// ---------------------------------------------------------------------------
// EdgeImportance
// ---------------------------------------------------------------------------

/// Per-stage multiplier on the adjacency.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeImportance {
    /// Constant 1; the adjacency is used as-is.
    Fixed,
    /// Learnable weights with the adjacency's shape, initialised to ones.
    Learned(Array3<f32>),
}

impl EdgeImportance {
    /// `A ⊙ W`, borrowing `A` when there is nothing to multiply.
    pub fn apply<'a>(&self, adjacency: &'a Array3<f32>) -> GcnResult<CowArray<'a, f32, Ix3>> {
        match self {
            EdgeImportance::Fixed => Ok(CowArray::from(adjacency.view())),
            EdgeImportance::Learned(w) => {
                if w.dim() != adjacency.dim() {
                    return Err(GcnError::shape_mismatch(
                        "edge importance",
                        adjacency.shape().to_vec(),
                        w.shape().to_vec(),
                    ));
                }
                Ok(CowArray::from(adjacency * w))
            }
        }
    }

    /// The learnable weights, if any.
    pub fn weights(&self) -> Option<&Array3<f32>> {
        match self {
            EdgeImportance::Fixed => None,
            EdgeImportance::Learned(w) => Some(w),
        }
    }

    /// Mutable access to the learnable weights, if any.
    pub fn weights_mut(&mut self) -> Option<&mut Array3<f32>> {
        match self {
            EdgeImportance::Fixed => None,
            EdgeImportance::Learned(w) => Some(w),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Everything one stage owns.
#[derive(Debug)]
pub struct Stage {
    /// Spatio-temporal block.
    pub block: SpatioTemporalBlock,
    /// Adjacency multiplier.
    pub importance: EdgeImportance,
    /// Projections for the auxiliary stream.
    pub fusion: FeatureFusion,
}

impl Stage {
    /// Feature node for this stage: `transform(feature)`, plus
    /// `residue(clone)` for the leading stages.
    pub fn fuse_feature(&self, feature: &Array4<f32>, clone: &Array4<f32>) -> GcnResult<Array4<f32>> {
        self.fusion.fuse(feature, clone)
    }

    /// Run the stage on the pose stream and current feature stream, returning
    /// the full `(N, Cout, T', V+1)` block output.
    pub fn forward(
        &self,
        pose: &Array4<f32>,
        feature: &Array4<f32>,
        clone: &Array4<f32>,
        adjacency: &Array3<f32>,
        mode: &mut Mode<'_>,
    ) -> GcnResult<Array4<f32>> {
        let fused = self.fuse_feature(feature, clone)?;
        let x = ops::concat_nodes(pose, &fused)?;
        let a = self.importance.apply(adjacency)?;
        let (y, _) = self.block.forward(&x, a.view(), mode)?;
        Ok(y)
    }
}

// ---------------------------------------------------------------------------
// Glbgcn
// ---------------------------------------------------------------------------

/// Graph convolutional backbone with a fused global feature node.
#[derive(Debug)]
pub struct Glbgcn {
    config: BackboneConfig,
    graph: Graph,
    data_bn: Option<BatchNorm>,
    data_bn_feature: Option<BatchNorm>,
    stages: [Stage; NUM_STAGES],
}

impl Glbgcn {
    /// Build the backbone with default-initialised parameters drawn from a
    /// generator seeded with `config.seed`.
    ///
    /// # Errors
    ///
    /// Configuration errors from [`BackboneConfig::validate`] or from block
    /// construction.
    pub fn new(config: &BackboneConfig) -> GcnResult<Self> {
        config.validate()?;
        let graph = Graph::new(&config.graph);
        let (kernels, num_node, _) = graph.adjacency().dim();
        if num_node < 2 {
            return Err(GcnError::invalid_input(format!(
                "graph has {num_node} node(s); a joint and the feature node are required"
            )));
        }
        let joints = num_node - 1;

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);

        let data_bn = config.data_bn.then(|| BatchNorm::new(config.in_channels * joints));
        let data_bn_feature =
            config.data_bn.then(|| BatchNorm::new(config.feature_channels * joints));

        let mut blocks = Vec::with_capacity(NUM_STAGES);
        let mut in_channels = config.in_channels;
        for (i, &(out_channels, stride)) in STAGE_SCHEDULE.iter().enumerate() {
            let cfg = BlockConfig {
                in_channels,
                out_channels,
                kernel_size: (TEMPORAL_KERNEL_SIZE, kernels),
                stride,
                dropout: if i == 0 { 0.0 } else { config.dropout },
                residual: i != 0,
            };
            blocks.push(SpatioTemporalBlock::new(cfg, &mut rng)?);
            in_channels = out_channels;
        }

        let transforms: Vec<_> = (0..NUM_STAGES)
            .map(|i| {
                let feature_in = if i == 0 { config.feature_channels } else { STAGE_SCHEDULE[i - 1].0 };
                Linear::new(feature_in, blocks[i].in_channels(), &mut rng)
            })
            .collect();
        let residues: Vec<_> = (0..NUM_RESIDUE_STAGES)
            .map(|i| Linear::new(config.feature_channels, blocks[i].in_channels(), &mut rng))
            .collect();

        let mut residues = residues.into_iter();
        let mut stages = Vec::with_capacity(NUM_STAGES);
        for (block, transform) in blocks.into_iter().zip(transforms) {
            let importance = if config.edge_importance_weighting {
                EdgeImportance::Learned(Array3::ones(graph.adjacency().raw_dim()))
            } else {
                EdgeImportance::Fixed
            };
            let fusion = FeatureFusion::new(transform, residues.next())?;
            stages.push(Stage { block, importance, fusion });
        }
        let stages: [Stage; NUM_STAGES] = stages
            .try_into()
            .map_err(|v: Vec<Stage>| GcnError::invalid_input(format!("built {} stages", v.len())))?;

        tracing::debug!(
            layout = ?config.graph.layout,
            kernels,
            num_node,
            reduction = %config.reduction,
            edge_importance = config.edge_importance_weighting,
            "constructed GLBGCN backbone"
        );

        Ok(Glbgcn { config: config.clone(), graph, data_bn, data_bn_feature, stages })
    }

    /// Configuration the backbone was built from.
    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    /// Skeleton graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// `(K, V+1, V+1)` adjacency shared by every stage.
    pub fn adjacency(&self) -> &Array3<f32> {
        self.graph.adjacency()
    }

    /// Number of skeleton joints expected in the input.
    pub fn num_joints(&self) -> usize {
        self.adjacency().dim().1 - 1
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Stage; NUM_STAGES] {
        &self.stages
    }

    /// Mutable stages, e.g. for an external optimizer.
    pub fn stages_mut(&mut self) -> &mut [Stage; NUM_STAGES] {
        &mut self.stages
    }

    /// Pose-stream input normalisation, `None` when disabled.
    pub fn data_bn(&self) -> Option<&BatchNorm> {
        self.data_bn.as_ref()
    }

    /// Feature-stream input normalisation, `None` when disabled.
    pub fn data_bn_feature(&self) -> Option<&BatchNorm> {
        self.data_bn_feature.as_ref()
    }

    /// Frames left after the strided stages, or `None` if `frames` is too
    /// short for the temporal kernel.
    pub fn output_frames(&self, frames: usize) -> Option<usize> {
        self.stages
            .iter()
            .try_fold(frames, |t, stage| stage.block.tcn_conv.spec.output_frames(t))
    }

    /// Total number of scalar parameters (running statistics excluded).
    pub fn num_parameters(&self) -> usize {
        let mut dict = self.state_dict();
        dict.retain(|k| !k.ends_with("running_mean") && !k.ends_with("running_var"));
        dict.keys().filter_map(|k| dict.get(k)).map(|r| r.data.len()).sum()
    }

    // -----------------------------------------------------------------------
    // Initialisation and checkpoints
    // -----------------------------------------------------------------------

    /// Load `config.pretrained` non-strictly, or re-initialise every layer
    /// from scratch when no checkpoint is configured.
    ///
    /// Returns the load report when a checkpoint was read.
    pub fn init_weights(&mut self) -> GcnResult<Option<LoadReport>> {
        if let Some(path) = self.config.pretrained.clone() {
            tracing::info!("load model from: {}", path.display());
            return self.load_checkpoint(&path).map(Some);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed.wrapping_add(1));
        for bn in self.data_bn.iter_mut().chain(self.data_bn_feature.iter_mut()) {
            init::constant_batch_norm(bn, 1.0);
        }
        for stage in self.stages.iter_mut() {
            for conv in stage.block.convs_mut() {
                init::kaiming_conv(conv, &mut rng);
            }
            for bn in stage.block.batch_norms_mut() {
                init::constant_batch_norm(bn, 1.0);
            }
        }
        for stage in self.stages.iter_mut() {
            init::normal_linear(&mut stage.fusion.transform, &mut rng);
        }
        for stage in self.stages.iter_mut() {
            if let Some(residue) = stage.fusion.residue.as_mut() {
                init::normal_linear(residue, &mut rng);
            }
        }
        tracing::debug!("initialised backbone weights from scratch");
        Ok(None)
    }

    /// Every parameter and running statistic under its dotted name. The
    /// adjacency is derived from the configuration and is not included.
    pub fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new();
        if let Some(bn) = &self.data_bn {
            bn.export("data_bn", &mut dict);
        }
        if let Some(bn) = &self.data_bn_feature {
            bn.export("data_bn_feature", &mut dict);
        }
        for (i, stage) in self.stages.iter().enumerate() {
            stage.block.export(&format!("st_gcn_networks.{i}"), &mut dict);
            if let Some(w) = stage.importance.weights() {
                dict.insert_array(format!("edge_importance.{i}"), w);
            }
            stage.fusion.export(i, &mut dict);
        }
        dict
    }

    /// Copy every tensor of `dict` whose name and shape match; everything
    /// else keeps its current value. Never fails.
    pub fn load_state_dict(&mut self, dict: &StateDict) -> LoadReport {
        let mut loader = StateLoader::new(dict);
        if let Some(bn) = &mut self.data_bn {
            bn.import("data_bn", &mut loader);
        }
        if let Some(bn) = &mut self.data_bn_feature {
            bn.import("data_bn_feature", &mut loader);
        }
        for (i, stage) in self.stages.iter_mut().enumerate() {
            stage.block.import(&format!("st_gcn_networks.{i}"), &mut loader);
            if let Some(w) = stage.importance.weights_mut() {
                loader.load(&format!("edge_importance.{i}"), w);
            }
            stage.fusion.import(i, &mut loader);
        }
        let report = loader.finish();

        if !report.missing.is_empty() {
            tracing::warn!(keys = ?report.missing, "missing keys in source state_dict");
        }
        if !report.unexpected.is_empty() {
            tracing::warn!(keys = ?report.unexpected, "unexpected key in source state_dict");
        }
        for conflict in &report.mismatched {
            tracing::warn!(
                key = %conflict.name,
                expected = ?conflict.expected,
                found = ?conflict.found,
                "size mismatch, tensor skipped"
            );
        }
        tracing::debug!(loaded = report.loaded.len(), "state dict applied");
        report
    }

    /// Read a checkpoint from disk and apply it with [`Self::load_state_dict`].
    ///
    /// # Errors
    ///
    /// I/O and parse failures. Partial key overlap is not an error.
    pub fn load_checkpoint(&mut self, path: &Path) -> GcnResult<LoadReport> {
        let dict = StateDict::load(path)?;
        Ok(self.load_state_dict(&dict))
    }

    /// Write [`Self::state_dict`] to `path`.
    pub fn save(&self, path: &Path) -> GcnResult<()> {
        self.state_dict().save(path)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Forward
    // -----------------------------------------------------------------------

    /// Inference forward pass: running statistics, no dropout.
    ///
    /// `x` is `(N, in_channels + feature_channels, T, V, M)`; the result is
    /// `(N·M, 256, T', V+1)`.
    pub fn forward(&self, x: &Array5<f32>) -> GcnResult<Array4<f32>> {
        self.forward_impl(x.view(), &mut Mode::Inference)
    }

    /// Training forward pass: batch statistics (running averages are
    /// updated) and dropout drawn from `rng`.
    pub fn forward_train(&self, x: &Array5<f32>, rng: &mut dyn RngCore) -> GcnResult<Array4<f32>> {
        self.forward_impl(x.view(), &mut Mode::Training(rng))
    }

    fn forward_impl(&self, x: ArrayView5<'_, f32>, mode: &mut Mode<'_>) -> GcnResult<Array4<f32>> {
        self.check_input(&x)?;
        let cp = self.config.in_channels;

        let feature = normalize_stream(x.slice(s![.., cp.., .., .., ..]), self.data_bn_feature.as_ref(), mode)?;
        let mut feature = self.config.reduction.reduce(&feature);
        let clone = feature.clone();

        let mut pose = normalize_stream(x.slice(s![.., ..cp, .., .., ..]), self.data_bn.as_ref(), mode)?;

        let adjacency = self.adjacency();
        let mut out = None;
        for i in 0..NUM_STAGES {
            let stage = &self.stages[i];
            let y = stage.forward(&pose, &feature, &clone, adjacency, mode)?;
            let (p, f) = ops::split_last_node(&y)?;
            pose = p;
            feature = f;
            out = Some(y);
        }
        out.ok_or_else(|| GcnError::invalid_input("backbone has no stages"))
    }

    fn check_input(&self, x: &ArrayView5<'_, f32>) -> GcnResult<()> {
        let (n, c, t, v, m) = x.dim();
        let expected_c = self.config.in_channels + self.config.feature_channels;
        let expected_v = self.num_joints();
        if c != expected_c || v != expected_v {
            return Err(GcnError::shape_mismatch(
                "backbone input",
                vec![0, expected_c, 0, expected_v, 0],
                x.shape().to_vec(),
            ));
        }
        if n == 0 || t == 0 || m == 0 {
            return Err(GcnError::invalid_input(format!(
                "input {:?} has an empty batch, time or instance axis",
                x.shape()
            )));
        }
        Ok(())
    }
}

/// `(N, C, T, V, M)` to `(N·M, C, T, V)`, batch-normalising each
/// `(instance, joint, channel)` lane over time when `bn` is given.
fn normalize_stream(
    x: ArrayView5<'_, f32>,
    bn: Option<&BatchNorm>,
    mode: &Mode<'_>,
) -> GcnResult<Array4<f32>> {
    let (n, c, t, v, m) = x.dim();
    // N M V C T
    let lanes = x.permuted_axes([0, 4, 3, 1, 2]).as_standard_layout().into_owned();
    let lanes = lanes.into_shape((n * m, v * c, t))?.insert_axis(Axis(3));
    let lanes = match bn {
        Some(bn) => bn.forward(&lanes, mode)?,
        None => lanes,
    };
    // N M C T V
    let stream = lanes
        .into_shape((n, m, v, c, t))?
        .permuted_axes([0, 1, 3, 4, 2])
        .as_standard_layout()
        .into_owned();
    Ok(stream.into_shape((n * m, c, t, v))?)
}
