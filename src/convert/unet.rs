//! U-Net block walker: drives the whole checkpoint conversion
//!
//! The legacy model stores the U-Net as three flat block stacks
//! (`input_blocks.<i>`, `middle_block.<i>`, `output_blocks.<i>`); the modular
//! model groups blocks by resolution stage. The walker classifies every key,
//! recovers the (stage, position-within-stage) pair from the flat index, and
//! hands each block to the renamers and the assignment engine.
//!
//! Flat index arithmetic: each stage holds `layers_per_block` residual
//! blocks followed by one optional down/upsampling block, so the stage
//! stride is `layers_per_block + 1`. The input stack additionally starts
//! with the bare input convolution at flat index 0, hence the `- 1` offset
//! on that side only.

use std::collections::BTreeMap;

use log::{debug, info, warn};

use super::assign::{assign_to_checkpoint, insert_unique, AttentionSplit, SplitTargets};
use super::config::UNetConfig;
use super::error::ConvertError;
use super::paths::{renew_attention_paths, renew_resnet_paths, ReplacementRule};
use super::state::StateDict;
use super::FlatCheckpoint;

/// Top-level prefix of the noise-predictor weights inside a legacy
/// checkpoint.
pub const UNET_PREFIX: &str = "model.diffusion_model.";

/// Single, unambiguous keys copied by fixed correspondence: time embedding,
/// input convolution, output normalization and convolution.
const FIXED_KEYS: &[(&str, &str)] = &[
    ("time_embed.0.weight", "time_embedding.linear_1.weight"),
    ("time_embed.0.bias", "time_embedding.linear_1.bias"),
    ("time_embed.2.weight", "time_embedding.linear_2.weight"),
    ("time_embed.2.bias", "time_embedding.linear_2.bias"),
    ("input_blocks.0.0.weight", "conv_in.weight"),
    ("input_blocks.0.0.bias", "conv_in.bias"),
    ("out.0.weight", "conv_norm_out.weight"),
    ("out.0.bias", "conv_norm_out.bias"),
    ("out.2.weight", "conv_out.weight"),
    ("out.2.bias", "conv_out.bias"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockFamily {
    Input,
    Middle,
    Output,
}

/// A block key parsed into structured form, so downstream logic never
/// re-parses strings.
#[derive(Debug, Clone)]
struct BlockKey {
    family: BlockFamily,
    block_index: usize,
    sublayer: usize,
    remainder: String,
    full: String,
}

fn classify_key(key: &str) -> Option<BlockKey> {
    let (family, rest) = if let Some(rest) = key.strip_prefix("input_blocks.") {
        (BlockFamily::Input, rest)
    } else if let Some(rest) = key.strip_prefix("middle_block.") {
        (BlockFamily::Middle, rest)
    } else if let Some(rest) = key.strip_prefix("output_blocks.") {
        (BlockFamily::Output, rest)
    } else {
        return None;
    };

    // the middle block has no block index: its first segment is already the
    // sublayer position in the (resnet, attention, resnet) triple
    let (block_index, rest) = match family {
        BlockFamily::Middle => (0, rest),
        _ => {
            let (index, rest) = rest.split_once('.')?;
            (index.parse().ok()?, rest)
        }
    };
    let (sublayer, remainder) = rest.split_once('.')?;
    Some(BlockKey {
        family,
        block_index,
        sublayer: sublayer.parse().ok()?,
        remainder: remainder.to_string(),
        full: key.to_string(),
    })
}

#[derive(Debug, Default)]
struct BlockGroups {
    input: BTreeMap<usize, Vec<BlockKey>>,
    /// Keyed by sublayer position within the single middle block.
    middle: BTreeMap<usize, Vec<String>>,
    output: BTreeMap<usize, Vec<BlockKey>>,
}

fn group_blocks(keys: &[String]) -> BlockGroups {
    let mut groups = BlockGroups::default();
    for key in keys {
        let Some(block_key) = classify_key(key) else {
            continue;
        };
        match block_key.family {
            BlockFamily::Input => groups
                .input
                .entry(block_key.block_index)
                .or_default()
                .push(block_key),
            BlockFamily::Middle => groups
                .middle
                .entry(block_key.sublayer)
                .or_default()
                .push(block_key.full),
            BlockFamily::Output => groups
                .output
                .entry(block_key.block_index)
                .or_default()
                .push(block_key),
        }
    }
    groups
}

/// Map an input-stack flat index to (stage, position within stage).
/// Index 0 is the input convolution and never reaches this.
fn input_block_position(i: usize, layers_per_block: usize) -> (usize, usize) {
    let stride = layers_per_block + 1;
    ((i - 1) / stride, (i - 1) % stride)
}

/// Map an output-stack flat index to (stage, position within stage).
fn output_block_position(i: usize, layers_per_block: usize) -> (usize, usize) {
    let stride = layers_per_block + 1;
    (i / stride, i % stride)
}

/// Build a split spec for the fused qkv weight/bias under `old_prefix`,
/// targeting `<new_prefix>.{query,key,value}.*`. Returns `None` when the
/// block has no fused tensor to split.
fn qkv_split_spec(old_prefix: &str, new_prefix: &str, state: &StateDict) -> Option<AttentionSplit> {
    let mut split = AttentionSplit::new();
    for suffix in ["weight", "bias"] {
        let old = format!("{old_prefix}.{suffix}");
        if state.contains(&old) {
            split.insert(
                old,
                SplitTargets {
                    query: format!("{new_prefix}.query.{suffix}"),
                    key: format!("{new_prefix}.key.{suffix}"),
                    value: format!("{new_prefix}.value.{suffix}"),
                },
            );
        }
    }
    if split.is_empty() {
        None
    } else {
        Some(split)
    }
}

fn unexpected(block: impl Into<String>, detail: impl Into<String>) -> ConvertError {
    ConvertError::UnexpectedBlockShape {
        block: block.into(),
        detail: detail.into(),
    }
}

fn is_upsampler_key(key: &BlockKey) -> bool {
    key.remainder == "conv.weight" || key.remainder == "conv.bias"
}

/// Convert a legacy LDM checkpoint's noise-predictor weights into the
/// modular naming scheme. The source checkpoint is read-only; the returned
/// mapping holds every converted tensor.
pub fn convert_ldm_unet_checkpoint(
    checkpoint: &FlatCheckpoint,
    config: &UNetConfig,
) -> Result<FlatCheckpoint, ConvertError> {
    let mut state = StateDict::from_prefixed(checkpoint, UNET_PREFIX);
    info!("converting unet checkpoint: {} source tensors", state.len());

    let mut new_checkpoint = FlatCheckpoint::new();

    for (old, new) in FIXED_KEYS {
        let tensor = state.fetch(old)?;
        insert_unique(&mut new_checkpoint, (*new).to_string(), tensor)?;
    }

    let groups = group_blocks(&state.unconsumed());
    debug!(
        "block groups: {} input, {} middle sublayers, {} output",
        groups.input.len(),
        groups.middle.len(),
        groups.output.len()
    );

    for (&i, keys) in &groups.input {
        if i == 0 {
            // only the input convolution lives at index 0, and it is already
            // consumed by the fixed-key pass
            return Err(unexpected(
                "input_blocks.0",
                "keys beyond the input convolution",
            ));
        }
        let (block_id, layer_in_block_id) = input_block_position(i, config.layers_per_block);

        // a downsampling block holds a single strided convolution and
        // nothing else
        if keys.iter().any(|k| k.sublayer == 0 && k.remainder.starts_with("op.")) {
            if keys.len() != 2 {
                return Err(unexpected(
                    format!("input_blocks.{i}"),
                    "downsample block with extra sublayers",
                ));
            }
            for suffix in ["weight", "bias"] {
                let tensor = state.fetch(&format!("input_blocks.{i}.0.op.{suffix}"))?;
                insert_unique(
                    &mut new_checkpoint,
                    format!("downsample_blocks.{block_id}.downsamplers.0.conv.{suffix}"),
                    tensor,
                )?;
            }
            continue;
        }

        if keys.iter().any(|k| k.sublayer > 1) {
            return Err(unexpected(
                format!("input_blocks.{i}"),
                "more than two sublayers",
            ));
        }
        let resnets: Vec<String> = keys
            .iter()
            .filter(|k| k.sublayer == 0)
            .map(|k| k.full.clone())
            .collect();
        let attentions: Vec<String> = keys
            .iter()
            .filter(|k| k.sublayer == 1)
            .map(|k| k.full.clone())
            .collect();
        if resnets.is_empty() {
            return Err(unexpected(format!("input_blocks.{i}"), "no residual sublayer"));
        }

        let paths = renew_resnet_paths(&resnets, 0);
        let meta_path = ReplacementRule::new(
            format!("input_blocks.{i}.0"),
            format!("downsample_blocks.{block_id}.resnets.{layer_in_block_id}"),
        );
        assign_to_checkpoint(&paths, &mut new_checkpoint, &mut state, None, &[meta_path], config)?;

        if !attentions.is_empty() {
            let paths = renew_attention_paths(&attentions, 0);
            let new_prefix =
                format!("downsample_blocks.{block_id}.attentions.{layer_in_block_id}");
            let meta_path = ReplacementRule::new(format!("input_blocks.{i}.1"), new_prefix.clone());
            let split = qkv_split_spec(&format!("input_blocks.{i}.1.qkv"), &new_prefix, &state);
            assign_to_checkpoint(
                &paths,
                &mut new_checkpoint,
                &mut state,
                split.as_ref(),
                &[meta_path],
                config,
            )?;
        }
    }

    // the middle block is always the fixed triple (resnet, attention, resnet)
    let middle_sublayers: Vec<usize> = groups.middle.keys().copied().collect();
    if middle_sublayers != [0, 1, 2] {
        return Err(unexpected(
            "middle_block",
            format!("sublayers {middle_sublayers:?}, expected [0, 1, 2]"),
        ));
    }
    for sublayer in [0usize, 2] {
        let paths = renew_resnet_paths(&groups.middle[&sublayer], 0);
        assign_to_checkpoint(&paths, &mut new_checkpoint, &mut state, None, &[], config)?;
    }
    let paths = renew_attention_paths(&groups.middle[&1], 0);
    let split = qkv_split_spec("middle_block.1.qkv", "mid_block.attentions.0", &state);
    assign_to_checkpoint(
        &paths,
        &mut new_checkpoint,
        &mut state,
        split.as_ref(),
        &[],
        config,
    )?;

    for (&i, keys) in &groups.output {
        let (block_id, layer_in_block_id) = output_block_position(i, config.layers_per_block);

        let mut sublayers: BTreeMap<usize, Vec<&BlockKey>> = BTreeMap::new();
        for key in keys {
            sublayers.entry(key.sublayer).or_default().push(key);
        }

        if sublayers.len() == 1 {
            // a lone residual block: rename its sublayers directly, there is
            // nothing to split and no middle-block collision to rewrite
            let (&sublayer, group) = sublayers.iter().next().expect("non-empty block");
            if sublayer != 0 {
                return Err(unexpected(
                    format!("output_blocks.{i}"),
                    "single sublayer is not a residual block",
                ));
            }
            let locals: Vec<String> = group
                .iter()
                .map(|k| format!("{}.{}", k.sublayer, k.remainder))
                .collect();
            for pair in renew_resnet_paths(&locals, 1) {
                let old_path = format!("output_blocks.{i}.{}", pair.old);
                let new_path =
                    format!("up_blocks.{block_id}.resnets.{layer_in_block_id}.{}", pair.new);
                let tensor = state.fetch(&old_path)?;
                insert_unique(&mut new_checkpoint, new_path, tensor)?;
            }
            continue;
        }

        // classify each sublayer group by its key names: an upsampler group
        // holds exactly the bare `conv.*` convolution, anything else past
        // sublayer 0 is attention
        let mut resnets: Vec<String> = Vec::new();
        let mut attention: Option<(usize, Vec<String>)> = None;
        let mut upsampler: Option<usize> = None;
        for (&sublayer, group) in &sublayers {
            let all_upsampler = group.iter().all(|k| is_upsampler_key(k));
            if sublayer == 0 {
                if all_upsampler {
                    return Err(unexpected(
                        format!("output_blocks.{i}"),
                        "upsampler in the residual position",
                    ));
                }
                resnets = group.iter().map(|k| k.full.clone()).collect();
            } else if all_upsampler {
                if upsampler.replace(sublayer).is_some() {
                    return Err(unexpected(format!("output_blocks.{i}"), "two upsamplers"));
                }
            } else if attention
                .replace((sublayer, group.iter().map(|k| k.full.clone()).collect()))
                .is_some()
            {
                return Err(unexpected(
                    format!("output_blocks.{i}"),
                    "more than one attention sublayer",
                ));
            }
        }
        if resnets.is_empty() {
            return Err(unexpected(format!("output_blocks.{i}"), "no residual sublayer"));
        }

        let paths = renew_resnet_paths(&resnets, 0);
        let meta_path = ReplacementRule::new(
            format!("output_blocks.{i}.0"),
            format!("up_blocks.{block_id}.resnets.{layer_in_block_id}"),
        );
        assign_to_checkpoint(&paths, &mut new_checkpoint, &mut state, None, &[meta_path], config)?;

        if let Some(sublayer) = upsampler {
            for suffix in ["weight", "bias"] {
                let tensor = state.fetch(&format!("output_blocks.{i}.{sublayer}.conv.{suffix}"))?;
                insert_unique(
                    &mut new_checkpoint,
                    format!("up_blocks.{block_id}.upsamplers.0.conv.{suffix}"),
                    tensor,
                )?;
            }
        }

        if let Some((sublayer, attentions)) = attention {
            let paths = renew_attention_paths(&attentions, 0);
            let new_prefix = format!("up_blocks.{block_id}.attentions.{layer_in_block_id}");
            let meta_path =
                ReplacementRule::new(format!("output_blocks.{i}.{sublayer}"), new_prefix.clone());
            let split =
                qkv_split_spec(&format!("output_blocks.{i}.{sublayer}.qkv"), &new_prefix, &state);
            assign_to_checkpoint(
                &paths,
                &mut new_checkpoint,
                &mut state,
                split.as_ref(),
                &[meta_path],
                config,
            )?;
        }
    }

    let leftover = state.unconsumed();
    if !leftover.is_empty() {
        warn!(
            "{} unet keys were not converted, e.g. {:?}",
            leftover.len(),
            &leftover[..leftover.len().min(5)]
        );
    }
    info!("converted unet checkpoint: {} tensors", new_checkpoint.len());

    Ok(new_checkpoint)
}
