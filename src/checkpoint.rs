//! Checkpointing
//!
//! Persists the search state: epoch, per-operation parameter blobs
//! keyed by descriptor identity, and optimizer state. Writes go to a
//! temp file then an atomic rename, so a concurrent reader never
//! observes a half-written checkpoint. Round-trips reproduce identical
//! continued-training behavior.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use chrono::Utc;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::desc::ModelDesc;
use crate::error::Result;
use crate::search::{AdamState, SgdState};
use crate::supernet::Supernet;

/// Serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointFormat {
    /// Compact bincode.
    Binary,
    /// Human-readable JSON.
    Json,
}

impl Default for CheckpointFormat {
    fn default() -> Self {
        CheckpointFormat::Binary
    }
}

/// Checkpoint metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub name: String,
    /// ISO 8601 capture time.
    pub saved_at: String,
    pub extra: BTreeMap<String, String>,
}

impl CheckpointMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            saved_at: Utc::now().to_rfc3339(),
            extra: BTreeMap::new(),
        }
    }
}

/// A complete, resumable snapshot of a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub desc: ModelDesc,
    /// Every parameter (weights and alphas) keyed by descriptor
    /// identity path.
    pub model_params: BTreeMap<String, ArrayD<f64>>,
    pub w_optim: SgdState,
    pub alpha_optim: AdamState,
    pub meta: CheckpointMeta,
}

impl Checkpoint {
    /// Capture the current state of a model and its optimizers.
    pub fn capture(
        epoch: usize,
        model: &Supernet,
        w_optim: SgdState,
        alpha_optim: AdamState,
        name: impl Into<String>,
    ) -> Self {
        Self {
            epoch,
            desc: model.desc().clone(),
            model_params: model.named_params().into_iter().collect(),
            w_optim,
            alpha_optim,
            meta: CheckpointMeta::new(name),
        }
    }

    /// Restore model parameters from this checkpoint.
    pub fn restore_model(&self, model: &mut Supernet) -> Result<()> {
        model.load_named_params(&self.model_params)
    }

    /// Write atomically: serialize to `<path>.tmp`, then rename over
    /// the destination.
    pub fn save(&self, path: &Path, format: CheckpointFormat) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            match format {
                CheckpointFormat::Binary => bincode::serialize_into(&mut writer, self)?,
                CheckpointFormat::Json => serde_json::to_writer(&mut writer, self)?,
            }
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path, format: CheckpointFormat) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let checkpoint = match format {
            CheckpointFormat::Binary => bincode::deserialize_from(reader)?,
            CheckpointFormat::Json => serde_json::from_reader(reader)?,
        };
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{CellDesc, ConvMacroParams, EdgeDesc, OpDesc};
    use crate::ops::OpCatalog;

    fn tiny_desc() -> ModelDesc {
        let ch = ConvMacroParams::new(4, 4);
        let mut cell = CellDesc::new(false, 4, 4);
        cell.add_node(vec![EdgeDesc::new(0, &["identity", "sep_conv_3x3"], ch, 1)]);
        ModelDesc::new(
            3,
            2,
            OpDesc::new("stem", ConvMacroParams::new(3, 4), 1),
            vec![cell],
            OpDesc::new("pool_linear", ConvMacroParams::new(4, 2), 1),
        )
    }

    #[test]
    fn test_round_trip_both_formats() {
        let catalog = OpCatalog::with_defaults();
        let model = Supernet::new(&tiny_desc(), &catalog, 8).unwrap();
        let checkpoint = Checkpoint::capture(
            5,
            &model,
            SgdState::default(),
            AdamState::default(),
            "unit",
        );

        let dir = tempfile::tempdir().unwrap();
        for (format, file) in [
            (CheckpointFormat::Binary, "ckpt.bin"),
            (CheckpointFormat::Json, "ckpt.json"),
        ] {
            let path = dir.path().join(file);
            checkpoint.save(&path, format).unwrap();
            let loaded = Checkpoint::load(&path, format).unwrap();
            assert_eq!(loaded.epoch, 5);
            assert_eq!(loaded.desc, checkpoint.desc);
            assert_eq!(loaded.model_params, checkpoint.model_params);
        }
    }

    #[test]
    fn test_restore_reproduces_model_state() {
        let catalog = OpCatalog::with_defaults();
        let model = Supernet::new(&tiny_desc(), &catalog, 8).unwrap();
        let checkpoint = Checkpoint::capture(
            0,
            &model,
            SgdState::default(),
            AdamState::default(),
            "unit",
        );

        let mut other = Supernet::new(&tiny_desc(), &catalog, 1234).unwrap();
        checkpoint.restore_model(&mut other).unwrap();
        let a: BTreeMap<_, _> = model.named_params().into_iter().collect();
        let b: BTreeMap<_, _> = other.named_params().into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let catalog = OpCatalog::with_defaults();
        let model = Supernet::new(&tiny_desc(), &catalog, 8).unwrap();
        let checkpoint = Checkpoint::capture(
            0,
            &model,
            SgdState::default(),
            AdamState::default(),
            "unit",
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.bin");
        checkpoint.save(&path, CheckpointFormat::Binary).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}
