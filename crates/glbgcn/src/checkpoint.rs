//! Named-tensor checkpoints.
//!
//! A [`StateDict`] maps PyTorch-style dotted names
//! (`st_gcn_networks.3.tcn.2.weight`, `edge_importance.0`, ...) to flat
//! tensors. It is stored as JSON so checkpoints stay diffable and can be
//! produced by converters from other frameworks.
//!
//! Loading is non-strict: a [`StateLoader`] copies every tensor whose name and
//! shape match a model tensor and records everything else in a
//! [`LoadReport`] instead of failing.

use ndarray::{ArrayBase, ArrayD, Data, DataMut, Dimension, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::CheckpointError;

const FORMAT_TAG: &str = "glbgcn-state-dict";
const FORMAT_VERSION: u32 = 1;

/// Join a module prefix and a tensor name with a dot.
pub fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

// ---------------------------------------------------------------------------
// StateDict
// ---------------------------------------------------------------------------

/// One serialized tensor: its shape and its values in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    /// Dimensions.
    pub shape: Vec<usize>,
    /// Row-major values.
    pub data: Vec<f32>,
}

impl TensorRecord {
    /// Copy an array of any dimensionality into a record.
    pub fn from_array<S, D>(array: &ArrayBase<S, D>) -> Self
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        TensorRecord { shape: array.shape().to_vec(), data: array.iter().copied().collect() }
    }

    /// Rebuild a dynamic-dimensional array.
    pub fn to_array(&self) -> Result<ArrayD<f32>, ndarray::ShapeError> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())
    }
}

/// An ordered collection of named tensors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    tensors: BTreeMap<String, TensorRecord>,
}

#[derive(Serialize, Deserialize)]
struct StateFile {
    format: String,
    version: u32,
    tensors: BTreeMap<String, TensorRecord>,
}

impl StateDict {
    /// An empty state dict.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the dict holds no tensors.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Look up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&TensorRecord> {
        self.tensors.get(name)
    }

    /// Insert (or replace) a tensor record.
    pub fn insert(&mut self, name: impl Into<String>, record: TensorRecord) {
        self.tensors.insert(name.into(), record);
    }

    /// Copy `array` in under `name`.
    pub fn insert_array<S, D>(&mut self, name: impl Into<String>, array: &ArrayBase<S, D>)
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        self.insert(name, TensorRecord::from_array(array));
    }

    /// Keep only the tensors for which `keep` returns `true`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.tensors.retain(|k, _| keep(k));
    }

    /// Write the dict as JSON to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
            }
        }
        let file = StateFile {
            format: FORMAT_TAG.to_string(),
            version: FORMAT_VERSION,
            tensors: self.tensors.clone(),
        };
        let json = serde_json::to_string(&file).map_err(|e| CheckpointError::parse(path, e))?;
        std::fs::write(path, json).map_err(|e| CheckpointError::io(path, e))?;
        tracing::debug!(path = %path.display(), tensors = self.len(), "saved state dict");
        Ok(())
    }

    /// Read a dict previously written by [`StateDict::save`].
    ///
    /// # Errors
    ///
    /// I/O failures, malformed JSON, and records whose data length disagrees
    /// with their shape.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let json = std::fs::read_to_string(path).map_err(|e| CheckpointError::io(path, e))?;
        let file: StateFile =
            serde_json::from_str(&json).map_err(|e| CheckpointError::parse(path, e))?;
        if file.format != FORMAT_TAG || file.version != FORMAT_VERSION {
            tracing::warn!(
                format = %file.format,
                version = file.version,
                "unrecognised checkpoint header, attempting to load anyway"
            );
        }
        for (name, record) in &file.tensors {
            let expected: usize = record.shape.iter().product();
            if expected != record.data.len() {
                return Err(CheckpointError::CorruptTensor {
                    name: name.clone(),
                    shape: record.shape.clone(),
                    len: record.data.len(),
                });
            }
        }
        Ok(StateDict { tensors: file.tensors })
    }
}

// ---------------------------------------------------------------------------
// Non-strict loading
// ---------------------------------------------------------------------------

/// A checkpoint tensor whose name matched but whose shape did not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeConflict {
    /// Tensor name.
    pub name: String,
    /// Shape of the model tensor.
    pub expected: Vec<usize>,
    /// Shape stored in the checkpoint.
    pub found: Vec<usize>,
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model tensors overwritten from the checkpoint.
    pub loaded: Vec<String>,
    /// Model tensors absent from the checkpoint (left untouched).
    pub missing: Vec<String>,
    /// Checkpoint tensors the model has no slot for.
    pub unexpected: Vec<String>,
    /// Name matches skipped because the shapes differ.
    pub mismatched: Vec<ShapeConflict>,
}

impl LoadReport {
    /// `true` when every model tensor was loaded and nothing was left over.
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Copies matching tensors out of a [`StateDict`] while tracking which
/// entries were consumed.
#[derive(Debug)]
pub struct StateLoader<'a> {
    dict: &'a StateDict,
    seen: BTreeSet<String>,
    report: LoadReport,
}

impl<'a> StateLoader<'a> {
    /// Start loading from `dict`.
    pub fn new(dict: &'a StateDict) -> Self {
        StateLoader { dict, seen: BTreeSet::new(), report: LoadReport::default() }
    }

    /// Overwrite `target` with the tensor called `name`, if present with the
    /// same shape.
    pub fn load<S, D>(&mut self, name: &str, target: &mut ArrayBase<S, D>)
    where
        S: DataMut<Elem = f32>,
        D: Dimension,
    {
        self.seen.insert(name.to_string());
        let Some(record) = self.dict.get(name) else {
            self.report.missing.push(name.to_string());
            return;
        };
        if record.shape != target.shape() {
            self.report.mismatched.push(ShapeConflict {
                name: name.to_string(),
                expected: target.shape().to_vec(),
                found: record.shape.clone(),
            });
            return;
        }
        for (dst, &src) in target.iter_mut().zip(record.data.iter()) {
            *dst = src;
        }
        self.report.loaded.push(name.to_string());
    }

    /// Finish loading and list the checkpoint entries nobody asked for.
    pub fn finish(mut self) -> LoadReport {
        self.report.unexpected = self
            .dict
            .keys()
            .filter(|k| !self.seen.contains(*k))
            .map(str::to_string)
            .collect();
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    #[test]
    fn join_key_skips_empty_prefix() {
        assert_eq!(join_key("", "weight"), "weight");
        assert_eq!(join_key("tcn.2", "weight"), "tcn.2.weight");
    }

    #[test]
    fn loader_classifies_every_key() {
        let mut dict = StateDict::new();
        dict.insert_array("a", &Array1::from(vec![1.0f32, 2.0]));
        dict.insert_array("b", &Array1::from(vec![5.0f32]));
        dict.insert_array("stray", &Array1::from(vec![0.0f32]));

        let mut a = Array1::<f32>::zeros(2);
        let mut b = Array2::<f32>::zeros((1, 1));
        let mut c = Array1::<f32>::from(vec![7.0f32]);

        let mut loader = StateLoader::new(&dict);
        loader.load("a", &mut a);
        loader.load("b", &mut b);
        loader.load("c", &mut c);
        let report = loader.finish();

        assert_eq!(a.to_vec(), vec![1.0, 2.0]);
        assert_eq!(b[[0, 0]], 0.0);
        assert_eq!(c[0], 7.0);
        assert_eq!(report.loaded, vec!["a".to_string()]);
        assert_eq!(report.missing, vec!["c".to_string()]);
        assert_eq!(report.unexpected, vec!["stray".to_string()]);
        assert_eq!(report.mismatched.len(), 1);
        assert!(!report.is_exact());
    }

    #[test]
    fn record_round_trips_to_array() {
        let arr = Array2::from_shape_fn((2, 3), |(i, j)| (i * 3 + j) as f32);
        let rec = TensorRecord::from_array(&arr);
        assert_eq!(rec.shape, vec![2, 3]);
        assert_eq!(rec.to_array().unwrap().into_dimensionality::<ndarray::Ix2>().unwrap(), arr);
    }
}
