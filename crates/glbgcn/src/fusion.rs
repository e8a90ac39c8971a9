//! Auxiliary feature branch.
//!
//! Before every stage the feature stream `(N, Cf, T, 1)` is projected to the
//! stage's input width by `transform`. The first
//! [`NUM_RESIDUE_STAGES`](crate::backbone::NUM_RESIDUE_STAGES) stages also add
//! `residue(clone)`, where `clone` is the normalised, node-reduced feature
//! stream captured once before the first stage. Deeper stages see only the
//! accumulated stream.

use ndarray::Array4;

use crate::checkpoint::{StateDict, StateLoader};
use crate::error::{GcnError, GcnResult};
use crate::layers::Linear;

/// Projections feeding the auxiliary stream into one stage.
#[derive(Debug, Clone)]
pub struct FeatureFusion {
    /// Current feature width to the stage's input width.
    pub transform: Linear,
    /// Captured clone width to the stage's input width. Present only for the
    /// leading stages.
    pub residue: Option<Linear>,
}

impl FeatureFusion {
    /// Pair an already-built transform with an optional residue.
    pub fn new(transform: Linear, residue: Option<Linear>) -> GcnResult<Self> {
        if let Some(res) = &residue {
            if res.out_features() != transform.out_features() {
                return Err(GcnError::shape_mismatch(
                    "feature residue",
                    vec![transform.out_features()],
                    vec![res.out_features()],
                ));
            }
        }
        Ok(FeatureFusion { transform, residue })
    }

    /// Whether this stage re-injects the captured clone.
    pub fn has_residue(&self) -> bool {
        self.residue.is_some()
    }

    /// Width of the fused feature node.
    pub fn out_channels(&self) -> usize {
        self.transform.out_features()
    }

    /// `transform(feature)`, plus `residue(clone)` when this stage has one.
    pub fn fuse(&self, feature: &Array4<f32>, clone: &Array4<f32>) -> GcnResult<Array4<f32>> {
        let mut fused = self.transform.forward(feature)?;
        if let Some(residue) = &self.residue {
            let extra = residue.forward(clone)?;
            if extra.dim() != fused.dim() {
                return Err(GcnError::shape_mismatch(
                    "feature residue",
                    fused.shape().to_vec(),
                    extra.shape().to_vec(),
                ));
            }
            fused += &extra;
        }
        Ok(fused)
    }

    pub(crate) fn export(&self, stage: usize, dict: &mut StateDict) {
        self.transform.export(&format!("feature_transform.{stage}"), dict);
        if let Some(residue) = &self.residue {
            residue.export(&format!("feature_residue.{stage}"), dict);
        }
    }

    pub(crate) fn import(&mut self, stage: usize, loader: &mut StateLoader<'_>) {
        self.transform.import(&format!("feature_transform.{stage}"), loader);
        if let Some(residue) = &mut self.residue {
            residue.import(&format!("feature_residue.{stage}"), loader);
        }
    }
}
