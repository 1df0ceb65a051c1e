//! Assignment engine: the step that actually moves tensors
//!
//! Takes locally renamed paths, applies the global (block-level) renames, and
//! writes tensors into the destination checkpoint. This is also where the two
//! layout changes happen: the fused qkv projection is split into separate
//! query/key/value tensors, and the 1D-conv attention output projection is
//! squeezed into a linear weight.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use candle_core::Tensor;

use super::config::UNetConfig;
use super::error::ConvertError;
use super::paths::{apply_replacements, replace_all, PathPair, ReplacementRule};
use super::state::StateDict;
use super::FlatCheckpoint;

/// New key names for the three tensors produced by splitting one fused qkv
/// tensor (or its bias).
#[derive(Debug, Clone)]
pub struct SplitTargets {
    pub query: String,
    pub key: String,
    pub value: String,
}

/// Old fused-tensor key to split targets.
pub type AttentionSplit = HashMap<String, SplitTargets>;

/// The legacy middle block is a flat triple (resnet, attention, resnet);
/// the modular model names its members explicitly.
const MID_BLOCK_RULES: &[(&str, &str)] = &[
    ("middle_block.0", "mid.resnets.0"),
    ("middle_block.1", "mid.attentions.0"),
    ("middle_block.2", "mid.resnets.1"),
];

/// Insert into the destination, refusing to overwrite. A duplicate write
/// means two conversion rules collided, which is a logic error worth
/// surfacing rather than papering over.
pub(crate) fn insert_unique(
    dest: &mut FlatCheckpoint,
    key: String,
    tensor: Tensor,
) -> Result<(), ConvertError> {
    match dest.entry(key) {
        Entry::Occupied(entry) => Err(ConvertError::DuplicateKey(entry.key().clone())),
        Entry::Vacant(entry) => {
            entry.insert(tensor);
            Ok(())
        }
    }
}

/// Split a fused qkv tensor into (query, key, value).
///
/// The fused layout interleaves heads: for each head, its query, key and
/// value rows are contiguous. Folding the head count into a leading axis and
/// chunking the second axis in three therefore recovers the per-projection
/// rows in head order. Weights (rank 3) come back as `(channels, channels)`
/// linear weights; biases flatten to `(channels,)`.
fn split_qkv(tensor: &Tensor, head_channels: usize, key: &str) -> Result<[Tensor; 3], ConvertError> {
    let dim0 = tensor.dim(0)?;
    if head_channels == 0 || dim0 % (3 * head_channels) != 0 {
        return Err(ConvertError::ShapeMismatch {
            key: key.to_string(),
            dim: dim0,
            head_channels,
        });
    }
    let channels = dim0 / 3;
    let num_heads = dim0 / head_channels / 3;

    let mut folded_shape = vec![num_heads, 3 * channels / num_heads];
    folded_shape.extend_from_slice(&tensor.dims()[1..]);
    let folded = tensor.reshape(folded_shape)?;

    let chunks = folded.chunk(3, 1)?;
    let mut out = Vec::with_capacity(3);
    for chunk in chunks {
        let reshaped = if tensor.rank() >= 3 {
            let rows = chunk.elem_count() / channels;
            chunk.reshape((rows, channels))?
        } else {
            chunk.flatten_all()?
        };
        out.push(reshaped);
    }
    // chunk(3, ..) on a divisible axis always yields exactly three tensors
    Ok([out[0].clone(), out[1].clone(), out[2].clone()])
}

/// Write every `{old, new}` pair into the destination checkpoint.
///
/// If a split spec is given, its fused tensors are split and written first;
/// pairs whose new path is claimed by the spec are then skipped in the main
/// loop. All other pairs get the middle-block renames, then the supplied
/// replacement rules in order, then a verbatim copy, except for the
/// attention output projection whose trailing conv-kernel axis is dropped.
pub fn assign_to_checkpoint(
    paths: &[PathPair],
    new_checkpoint: &mut FlatCheckpoint,
    old_state: &mut StateDict,
    attention_split: Option<&AttentionSplit>,
    additional_replacements: &[ReplacementRule],
    config: &UNetConfig,
) -> Result<(), ConvertError> {
    if let Some(split) = attention_split {
        for (old_key, targets) in split {
            let tensor = old_state.fetch(old_key)?;
            let [query, key, value] = split_qkv(&tensor, config.attention_head_dim, old_key)?;
            insert_unique(new_checkpoint, targets.query.clone(), query)?;
            insert_unique(new_checkpoint, targets.key.clone(), key)?;
            insert_unique(new_checkpoint, targets.value.clone(), value)?;
        }
    }

    for pair in paths {
        // already written by the split above
        if attention_split.is_some_and(|split| split.contains_key(&pair.new)) {
            continue;
        }

        let new_path = replace_all(&pair.new, MID_BLOCK_RULES);
        let new_path = apply_replacements(&new_path, additional_replacements);

        let tensor = old_state.fetch(&pair.old)?;
        let tensor = if new_path.contains("proj_attn.weight") {
            // conv 1D weight (out, in, 1) becomes a linear weight (out, in)
            tensor.narrow(2, 0, 1)?.squeeze(2)?
        } else {
            tensor
        };
        insert_unique(new_checkpoint, new_path, tensor)?;
    }

    Ok(())
}
