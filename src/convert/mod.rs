//! Checkpoint conversion from the legacy LDM naming scheme to the modular one

pub mod assign;
pub mod bert;
pub mod config;
pub mod error;
pub mod paths;
pub mod state;
pub mod unet;

use std::collections::HashMap;

use candle_core::Tensor;

/// A flat mapping from dotted parameter name to tensor.
pub type FlatCheckpoint = HashMap<String, Tensor>;

// Re-export key types
pub use assign::{assign_to_checkpoint, AttentionSplit, SplitTargets};
pub use bert::{convert_ldm_bert_checkpoint, BertConfig, BERT_PREFIX};
pub use config::{create_unet_config, LdmConfig, UNetConfig};
pub use error::ConvertError;
pub use paths::{
    apply_replacements, renew_attention_paths, renew_resnet_paths, shave_segments, PathPair,
    ReplacementRule,
};
pub use state::StateDict;
pub use unet::{convert_ldm_unet_checkpoint, UNET_PREFIX};
