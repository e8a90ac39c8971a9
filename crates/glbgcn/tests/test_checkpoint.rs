//! Integration tests for [`glbgcn::checkpoint`] and the backbone's
//! state-dict loading.
//!
//! Checkpoint files live in a [`tempfile::TempDir`] per test.

use glbgcn::backbone::Glbgcn;
use glbgcn::checkpoint::{StateDict, TensorRecord};
use glbgcn::config::{BackboneConfig, GraphConfig, Layout, Strategy};
use glbgcn::error::{CheckpointError, GcnError};
use tempfile::TempDir;

fn seeded(seed: u64) -> BackboneConfig {
    BackboneConfig {
        graph: GraphConfig::new(Layout::Coco, Strategy::Spatial),
        seed,
        ..BackboneConfig::default()
    }
}

fn model(seed: u64) -> Glbgcn {
    let mut m = Glbgcn::new(&seeded(seed)).expect("valid config");
    m.init_weights().expect("scratch init");
    m
}

// ---------------------------------------------------------------------------
// StateDict files
// ---------------------------------------------------------------------------

/// Saving and loading a state dict reproduces every tensor.
#[test]
fn state_dict_file_round_trip() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("ckpt").join("glbgcn.json");

    let original = model(1).state_dict();
    original.save(&path).expect("save");
    let restored = StateDict::load(&path).expect("load");
    assert_eq!(restored, original);
    assert!(restored.get("st_gcn_networks.9.tcn.3.running_var").is_some());
    assert!(restored.get("edge_importance.0").is_some());
}

/// Every parameter of the backbone is named after its PyTorch counterpart.
#[test]
fn state_dict_uses_pytorch_names() {
    let dict = model(1).state_dict();
    for key in [
        "data_bn.weight",
        "data_bn_feature.running_mean",
        "st_gcn_networks.0.gcn.conv.weight",
        "st_gcn_networks.0.tcn.0.weight",
        "st_gcn_networks.0.tcn.2.weight",
        "st_gcn_networks.0.tcn.3.bias",
        "st_gcn_networks.7.residual.0.weight",
        "st_gcn_networks.7.residual.1.running_var",
        "edge_importance.9",
        "feature_transform.9.weight",
        "feature_residue.3.bias",
    ] {
        assert!(dict.get(key).is_some(), "missing {key}");
    }
    // 3 pose channels expand to 64 · K(3) in the first graph convolution
    assert_eq!(dict.get("st_gcn_networks.0.gcn.conv.weight").unwrap().shape, vec![192, 3, 1, 1]);
    assert_eq!(dict.get("feature_transform.0.weight").unwrap().shape, vec![3, 32]);
}

/// A record whose data does not fill its shape is a corrupt checkpoint.
#[test]
fn corrupt_tensor_is_rejected() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("bad.json");

    let mut dict = StateDict::new();
    dict.insert("w", TensorRecord { shape: vec![2, 2], data: vec![1.0, 2.0, 3.0] });
    dict.save(&path).expect("save");

    match StateDict::load(&path) {
        Err(CheckpointError::CorruptTensor { name, len, .. }) => {
            assert_eq!(name, "w");
            assert_eq!(len, 3);
        }
        other => panic!("expected CorruptTensor, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Non-strict loading
// ---------------------------------------------------------------------------

/// A partially overlapping checkpoint loads without error: matching tensors
/// are copied exactly, everything else keeps its prior value, and the report
/// lists the leftovers.
#[test]
fn partial_checkpoint_updates_only_matching_tensors() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("partial.json");

    let source = model(1).state_dict();
    let mut partial = source.clone();
    partial.retain(|k| k.starts_with("st_gcn_networks.0.") || k.starts_with("feature_transform."));
    partial.insert("cls_head.fc.weight", TensorRecord { shape: vec![1], data: vec![0.0] });
    partial.insert(
        "feature_transform.1.weight",
        TensorRecord { shape: vec![2, 2], data: vec![0.0; 4] },
    );
    partial.save(&path).expect("save");

    let mut target = model(2);
    let prior = target.state_dict();
    let report = target.load_checkpoint(&path).expect("partial load must not fail");
    let after = target.state_dict();

    for key in after.keys() {
        let expected = if key.starts_with("st_gcn_networks.0.")
            || (key.starts_with("feature_transform.") && key != "feature_transform.1.weight")
        {
            source.get(key)
        } else {
            prior.get(key)
        };
        assert_eq!(after.get(key), expected, "tensor {key}");
    }

    assert!(!report.is_exact());
    assert_eq!(report.unexpected, vec!["cls_head.fc.weight".to_string()]);
    assert_eq!(report.mismatched.len(), 1);
    assert_eq!(report.mismatched[0].name, "feature_transform.1.weight");
    assert_eq!(report.mismatched[0].expected, vec![64, 64]);
    assert!(report.missing.iter().any(|k| k == "data_bn.weight"));
    assert!(report.loaded.iter().any(|k| k == "st_gcn_networks.0.gcn.conv.weight"));
}

/// Loading a model's own state dict is exact and makes two differently
/// seeded models compute the same function.
#[test]
fn full_checkpoint_makes_models_equal() {
    let source = model(1);
    let mut target = model(2);
    let report = target.load_state_dict(&source.state_dict());
    assert!(report.is_exact(), "{report:?}");
    assert_eq!(target.state_dict(), source.state_dict());

    let x = ndarray::Array5::from_shape_fn((1, 35, 6, 17, 1), |(_, c, t, v, _)| {
        ((c * 3 + t + v) as f32 * 0.1).cos()
    });
    assert_eq!(target.forward(&x).unwrap(), source.forward(&x).unwrap());
}

/// `init_weights` with a configured checkpoint loads it instead of
/// re-initialising.
#[test]
fn init_weights_loads_pretrained_path() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("pretrained.json");
    let source = model(1);
    source.save(&path).expect("save");

    let cfg = BackboneConfig { pretrained: Some(path), ..seeded(5) };
    let mut target = Glbgcn::new(&cfg).unwrap();
    let report = target.init_weights().unwrap().expect("a checkpoint was loaded");
    assert!(report.is_exact());
    assert_eq!(target.state_dict(), source.state_dict());
}

/// A configured checkpoint that cannot be read is an error, not a silent
/// fallback to scratch initialisation.
#[test]
fn missing_pretrained_file_propagates() {
    let tmp = TempDir::new().expect("tempdir");
    let cfg = BackboneConfig { pretrained: Some(tmp.path().join("absent.json")), ..seeded(5) };
    let mut target = Glbgcn::new(&cfg).unwrap();
    assert!(matches!(
        target.init_weights(),
        Err(GcnError::Checkpoint(CheckpointError::Io { .. }))
    ));
}

/// Malformed JSON is a parse error.
#[test]
fn malformed_checkpoint_is_parse_error() {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("garbage.json");
    std::fs::write(&path, "{ not json").unwrap();
    let mut target = model(3);
    assert!(matches!(
        target.load_checkpoint(&path),
        Err(GcnError::Checkpoint(CheckpointError::Parse { .. }))
    ));
}
