//! Backbone configuration.
//!
//! [`BackboneConfig`] carries exactly the arguments needed to construct a
//! [`Glbgcn`](crate::backbone::Glbgcn): channel counts, the graph layout,
//! edge-importance and data-normalisation switches, the optional pretrained
//! checkpoint and the node-axis reduction. It is serializable via [`serde`]
//! so experiments can keep it next to their checkpoints as JSON.
//!
//! # Example
//!
//! ```rust
//! use glbgcn::config::{BackboneConfig, Reduction};
//!
//! let cfg = BackboneConfig::default();
//! cfg.validate().expect("default config is valid");
//!
//! assert_eq!(cfg.in_channels, 3);
//! assert_eq!(cfg.feature_channels, 32);
//! assert_eq!(cfg.reduction, Reduction::Average);
//! ```

use ndarray::{Array4, Axis};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

/// How the auxiliary feature stream is collapsed over the joint axis before
/// the first stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reduction {
    /// Mean over joints (`"avg"`).
    #[default]
    #[serde(rename = "avg")]
    Average,
    /// Maximum over joints (`"max"`).
    #[serde(rename = "max")]
    Max,
}

impl Reduction {
    /// Reduce `(N, C, T, V)` over the joint axis to `(N, C, T, 1)`.
    pub fn reduce(self, x: &Array4<f32>) -> Array4<f32> {
        let nodes = x.len_of(Axis(3));
        let reduced = match self {
            Reduction::Average => {
                let scale = 1.0 / nodes.max(1) as f32;
                x.sum_axis(Axis(3)).mapv(|v| v * scale)
            }
            Reduction::Max => x.fold_axis(Axis(3), f32::NEG_INFINITY, |acc, &v| acc.max(v)),
        };
        reduced.insert_axis(Axis(3))
    }
}

impl FromStr for Reduction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avg" => Ok(Reduction::Average),
            "max" => Ok(Reduction::Max),
            other => Err(ConfigError::invalid_value(
                "reduction",
                format!("reduction must be either 'avg' or 'max', got '{other}'"),
            )),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Average => write!(f, "avg"),
            Reduction::Max => write!(f, "max"),
        }
    }
}

// ---------------------------------------------------------------------------
// GraphConfig
// ---------------------------------------------------------------------------

/// Named skeleton layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Layout {
    /// OpenPose 18-joint skeleton.
    #[serde(rename = "openpose")]
    OpenPose,
    /// NTU RGB+D 25-joint skeleton.
    #[serde(rename = "ntu-rgb+d")]
    NtuRgbD,
    /// NTU RGB+D skeleton re-indexed around the spine edge (24 joints).
    #[serde(rename = "ntu_edge")]
    NtuEdge,
    /// COCO 17-keypoint skeleton.
    #[serde(rename = "coco")]
    Coco,
}

/// Neighbour partitioning strategy used to split the adjacency into
/// `K` kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// A single normalised adjacency (`K = 1`).
    Uniform,
    /// One partition per hop distance.
    Distance,
    /// Root / centripetal / centrifugal partitions.
    Spatial,
}

/// Arguments for building the skeleton graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Skeleton layout.
    pub layout: Layout,
    /// Partitioning strategy.
    pub strategy: Strategy,
    /// Largest hop distance that still counts as a neighbour. Default: **1**.
    #[serde(default = "default_max_hop")]
    pub max_hop: usize,
    /// Step between the hop distances that are kept. Default: **1**.
    #[serde(default = "default_dilation")]
    pub dilation: usize,
    /// Append a virtual node linked to every joint; it carries the fused
    /// feature stream. Default: **true**.
    #[serde(default = "default_true")]
    pub global_node: bool,
}

fn default_max_hop() -> usize {
    1
}

fn default_dilation() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            layout: Layout::Coco,
            strategy: Strategy::Spatial,
            max_hop: default_max_hop(),
            dilation: default_dilation(),
            global_node: true,
        }
    }
}

impl GraphConfig {
    /// Shorthand for a layout/strategy pair with default hop settings.
    pub fn new(layout: Layout, strategy: Strategy) -> Self {
        GraphConfig { layout, strategy, ..Default::default() }
    }

    /// Validate the hop settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_hop == 0 {
            return Err(ConfigError::invalid_value("graph_cfg.max_hop", "must be > 0"));
        }
        if self.dilation == 0 {
            return Err(ConfigError::invalid_value("graph_cfg.dilation", "must be > 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BackboneConfig
// ---------------------------------------------------------------------------

/// Complete configuration for a [`Glbgcn`](crate::backbone::Glbgcn)
/// backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneConfig {
    /// Number of pose channels at the front of the input. Default: **3**.
    pub in_channels: usize,

    /// Number of auxiliary feature channels following the pose channels.
    /// Default: **32**.
    #[serde(default = "default_feature_channels")]
    pub feature_channels: usize,

    /// Graph layout and partitioning.
    #[serde(rename = "graph_cfg")]
    pub graph: GraphConfig,

    /// Learn a per-edge multiplier for every stage. Default: **true**.
    #[serde(default = "default_true")]
    pub edge_importance_weighting: bool,

    /// Batch-normalise both input streams. Default: **true**.
    #[serde(default = "default_true")]
    pub data_bn: bool,

    /// Checkpoint to initialise from instead of the random schemes.
    #[serde(default, deserialize_with = "deserialize_pretrained")]
    pub pretrained: Option<PathBuf>,

    /// Joint-axis reduction for the feature stream. Default: **avg**.
    #[serde(default)]
    pub reduction: Reduction,

    /// Dropout rate after the temporal convolution of stages 1..10.
    /// Default: **0.0**.
    #[serde(default)]
    pub dropout: f32,

    /// Seed for parameter construction and initialisation. Default: **42**.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_feature_channels() -> usize {
    32
}

fn default_seed() -> u64 {
    42
}

/// `pretrained` must be a path string or null; anything else is rejected
/// with a field-specific message rather than serde's generic one.
fn deserialize_pretrained<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(PathBuf::from(s))),
        other => Err(serde::de::Error::custom(format!(
            "pretrained must be a str or None, got {other}"
        ))),
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        BackboneConfig {
            in_channels: 3,
            feature_channels: default_feature_channels(),
            graph: GraphConfig::default(),
            edge_importance_weighting: true,
            data_bn: true,
            pretrained: None,
            reduction: Reduction::Average,
            dropout: 0.0,
            seed: default_seed(),
        }
    }
}

impl BackboneConfig {
    /// Load a [`BackboneConfig`] from a JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FileAccess`] if the file cannot be read,
    /// [`ConfigError::ParseError`] if the JSON is malformed or a field has the
    /// wrong type, and [`ConfigError::InvalidValue`] if validation fails.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: BackboneConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a configuration from an in-memory JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: BackboneConfig = serde_json::from_str(json).map_err(|source| {
            ConfigError::ParseError { path: PathBuf::from("<string>"), source }
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize this configuration to pretty-printed JSON and write it to
    /// `path`, creating parent directories if necessary.
    pub fn to_json(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::FileAccess {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::invalid_value("(serialization)", e.to_string()))?;
        std::fs::write(path, json).map_err(|source| ConfigError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    /// Validate all fields and return an error describing the first problem
    /// found.
    ///
    /// # Validated invariants
    ///
    /// - `in_channels` and `feature_channels` must be non-zero.
    /// - `dropout` must lie in `[0, 1)`.
    /// - The graph hop settings must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.in_channels == 0 {
            return Err(ConfigError::invalid_value("in_channels", "must be > 0"));
        }
        if self.feature_channels == 0 {
            return Err(ConfigError::invalid_value("feature_channels", "must be > 0"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::invalid_value("dropout", "must be in [0.0, 1.0)"));
        }
        self.graph.validate()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn default_config_is_valid() {
        BackboneConfig::default().validate().expect("default config should be valid");
    }

    #[test]
    fn reduction_parses_known_names() {
        assert_eq!("avg".parse::<Reduction>().unwrap(), Reduction::Average);
        assert_eq!("max".parse::<Reduction>().unwrap(), Reduction::Max);
        assert!("sum".parse::<Reduction>().is_err());
    }

    #[test]
    fn reduction_display_round_trips() {
        for r in [Reduction::Average, Reduction::Max] {
            assert_eq!(r.to_string().parse::<Reduction>().unwrap(), r);
        }
    }

    #[test]
    fn average_and_max_reduce_the_joint_axis() {
        let x = Array4::from_shape_fn((1, 2, 3, 4), |(_, c, t, v)| (c * 100 + t * 10 + v) as f32);
        let avg = Reduction::Average.reduce(&x);
        let max = Reduction::Max.reduce(&x);
        assert_eq!(avg.shape(), &[1, 2, 3, 1]);
        assert_eq!(max.shape(), &[1, 2, 3, 1]);
        assert!((avg[[0, 1, 2, 0]] - 121.5).abs() < 1e-5);
        assert!((max[[0, 1, 2, 0]] - 123.0).abs() < 1e-5);
    }

    #[test]
    fn single_joint_reductions_agree() {
        let x = Array4::from_shape_fn((2, 3, 5, 1), |(n, c, t, _)| (n + c) as f32 - t as f32 * 0.5);
        assert_eq!(Reduction::Average.reduce(&x), Reduction::Max.reduce(&x));
    }

    #[test]
    fn dropout_of_one_is_invalid() {
        let cfg = BackboneConfig { dropout: 1.0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_max_hop_is_invalid() {
        let mut cfg = BackboneConfig::default();
        cfg.graph.max_hop = 0;
        assert!(cfg.validate().is_err());
    }
}
