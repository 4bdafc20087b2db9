//! Pretrained-weight source resolution.

use std::path::PathBuf;

use tracing::warn;

pub const IMAGENET: &str = "IMAGENET";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PretrainWeights {
    /// Named weights the engine knows how to fetch.
    Imagenet,
    /// A state-dict file on disk.
    Path(PathBuf),
}

/// Interpret the `pretrain_weights` setting. `None` means train from scratch.
///
/// A value that is neither `IMAGENET` nor an existing file falls back to `IMAGENET`.
pub fn resolve_pretrain_weights(value: Option<&str>) -> Option<PretrainWeights> {
    let value = value?;
    if value == IMAGENET {
        return Some(PretrainWeights::Imagenet);
    }
    let path = PathBuf::from(value);
    if path.exists() {
        return Some(PretrainWeights::Path(path));
    }
    warn!("Path of pretrain_weights('{}') does not exist!", value);
    warn!(
        "Pretrain_weights is forcibly set to '{}'. If don't want to use pretrain weights, \
         set pretrain_weights to be None.",
        IMAGENET
    );
    Some(PretrainWeights::Imagenet)
}
