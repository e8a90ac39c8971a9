//! # GLBGCN
//!
//! Spatio-temporal graph convolution backbone for skeleton-based action
//! recognition, with an auxiliary per-joint feature branch that is reduced
//! over the joints and fused into the skeleton as an extra global node before
//! every stage.
//!
//! ## Architecture
//!
//! ```text
//! BackboneConfig ──► Graph (layout, strategy) ──► A (K, V+1, V+1)
//!       │
//!       ▼
//!    Glbgcn ──► [Stage; 10]
//!                 ├── FeatureFusion   transform (+ residue for stages 0..4)
//!                 ├── EdgeImportance  A ⊙ W
//!                 └── SpatioTemporalBlock
//!                       ├── GraphConvolution  conv → einsum(nkctv,kvw->nctw)
//!                       ├── BN · ReLU · Conv(9×1, stride s) · BN · Dropout
//!                       └── Residual (none | identity | 1×1 conv + BN)
//!       │
//!       └──► StateDict (JSON) ◄──► checkpoint files
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use glbgcn::{BackboneConfig, Glbgcn};
//! use ndarray::Array5;
//!
//! let config = BackboneConfig::default();
//! let mut model = Glbgcn::new(&config).expect("valid config");
//! model.init_weights().expect("initialised");
//!
//! // (batch, pose + feature channels, frames, joints, instances)
//! let x = Array5::<f32>::zeros((1, 3 + 32, 30, model.num_joints(), 2));
//! let y = model.forward(&x).expect("forward");
//! println!("output shape: {:?}", y.shape());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backbone;
pub mod block;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod init;
pub mod layers;
pub mod ops;

// Convenient re-exports at the crate root.
pub use backbone::{EdgeImportance, Glbgcn, Stage, NUM_RESIDUE_STAGES, NUM_STAGES, OUTPUT_CHANNELS};
pub use block::{BlockConfig, GraphConvolution, Residual, SpatioTemporalBlock};
pub use checkpoint::{LoadReport, StateDict};
pub use config::{BackboneConfig, GraphConfig, Layout, Reduction, Strategy};
pub use error::{CheckpointError, ConfigError, GcnError, GcnResult};
pub use fusion::FeatureFusion;
pub use graph::Graph;
pub use layers::Mode;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
