//! LDMBert conversion path
//!
//! The legacy text encoder stores its transformer as an interleaved layer
//! list: even indices hold (norm, attention), odd indices hold (norm,
//! feed-forward). The modular implementation keeps one entry per layer with
//! named members, so layer `i` draws from source layers `2i` and `2i + 1`.
//! Same pattern as the U-Net walk, at finer granularity: every key is a
//! fixed correspondence, there is nothing to split or reshape.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::assign::insert_unique;
use super::error::ConvertError;
use super::paths::PathPair;
use super::state::StateDict;
use super::FlatCheckpoint;

/// Top-level prefix of the text-encoder weights inside a legacy checkpoint.
pub const BERT_PREFIX: &str = "cond_stage_model.transformer.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BertConfig {
    pub num_hidden_layers: usize,
}

fn fixed_pairs() -> Vec<PathPair> {
    [
        ("token_emb.weight", "model.embed_tokens.weight"),
        ("pos_emb.emb.weight", "model.embed_positions.weight"),
        ("norm.weight", "model.layer_norm.weight"),
        ("norm.bias", "model.layer_norm.bias"),
        ("to_logits.weight", "to_logits.weight"),
        ("to_logits.bias", "to_logits.bias"),
    ]
    .into_iter()
    .map(|(old, new)| PathPair {
        old: old.to_string(),
        new: new.to_string(),
    })
    .collect()
}

fn layer_pairs(i: usize) -> Vec<PathPair> {
    let attn = format!("attn_layers.layers.{}", 2 * i);
    let ff = format!("attn_layers.layers.{}", 2 * i + 1);
    let dst = format!("model.layers.{i}");
    [
        (format!("{attn}.0.weight"), format!("{dst}.self_attn_layer_norm.weight")),
        (format!("{attn}.0.bias"), format!("{dst}.self_attn_layer_norm.bias")),
        (format!("{attn}.1.to_q.weight"), format!("{dst}.self_attn.q_proj.weight")),
        (format!("{attn}.1.to_k.weight"), format!("{dst}.self_attn.k_proj.weight")),
        (format!("{attn}.1.to_v.weight"), format!("{dst}.self_attn.v_proj.weight")),
        (format!("{attn}.1.to_out.weight"), format!("{dst}.self_attn.out_proj.weight")),
        (format!("{attn}.1.to_out.bias"), format!("{dst}.self_attn.out_proj.bias")),
        (format!("{ff}.0.weight"), format!("{dst}.final_layer_norm.weight")),
        (format!("{ff}.0.bias"), format!("{dst}.final_layer_norm.bias")),
        (format!("{ff}.1.net.0.0.weight"), format!("{dst}.fc1.weight")),
        (format!("{ff}.1.net.0.0.bias"), format!("{dst}.fc1.bias")),
        (format!("{ff}.1.net.2.weight"), format!("{dst}.fc2.weight")),
        (format!("{ff}.1.net.2.bias"), format!("{dst}.fc2.bias")),
    ]
    .into_iter()
    .map(|(old, new)| PathPair { old, new })
    .collect()
}

/// Number of interleaved source layers, read off the key names.
fn source_layer_count(keys: &[String]) -> usize {
    keys.iter()
        .filter_map(|key| {
            let rest = key.strip_prefix("attn_layers.layers.")?;
            let (index, _) = rest.split_once('.')?;
            index.parse::<usize>().ok()
        })
        .max()
        .map_or(0, |max| max + 1)
}

/// Convert a legacy checkpoint's text-encoder weights into the modular
/// BERT-style naming.
pub fn convert_ldm_bert_checkpoint(
    checkpoint: &FlatCheckpoint,
    config: &BertConfig,
) -> Result<FlatCheckpoint, ConvertError> {
    let mut state = StateDict::from_prefixed(checkpoint, BERT_PREFIX);
    info!("converting bert checkpoint: {} source tensors", state.len());

    let source_layers = source_layer_count(&state.unconsumed());
    if source_layers != 2 * config.num_hidden_layers {
        return Err(ConvertError::UnexpectedBlockShape {
            block: "attn_layers".to_string(),
            detail: format!(
                "{} interleaved source layers, config expects {} hidden layers",
                source_layers, config.num_hidden_layers
            ),
        });
    }

    let mut new_checkpoint = FlatCheckpoint::new();
    let mut pairs = fixed_pairs();
    for i in 0..config.num_hidden_layers {
        pairs.extend(layer_pairs(i));
    }
    for pair in &pairs {
        let tensor = state.fetch(&pair.old)?;
        insert_unique(&mut new_checkpoint, pair.new.clone(), tensor)?;
    }

    let leftover = state.unconsumed();
    if !leftover.is_empty() {
        warn!(
            "{} bert keys were not converted, e.g. {:?}",
            leftover.len(),
            &leftover[..leftover.len().min(5)]
        );
    }

    Ok(new_checkpoint)
}
