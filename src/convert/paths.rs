//! Key-path rewriting for checkpoint conversion
//!
//! The legacy UNet stores weights under positional module names
//! (`in_layers.0`, `emb_layers.1`, ...); the modular implementation names the
//! same layers semantically (`norm1`, `time_emb_proj`, ...). Everything here
//! is pure string manipulation: the tensors are touched later, by the
//! assignment engine.

/// One key's old dotted path and its locally computed new path, before any
/// global (block-level) replacement is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPair {
    pub old: String,
    pub new: String,
}

/// A substring substitution applied to a new path after local rewriting.
/// Rule lists are applied left to right.
#[derive(Debug, Clone)]
pub struct ReplacementRule {
    pub old: String,
    pub new: String,
}

impl ReplacementRule {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Drop dot-separated segments from a path. Positive `n` shaves the first
/// `n` segments, negative shaves the last `|n|`. Callers guarantee the path
/// has more segments than requested; shorter paths come back empty.
pub fn shave_segments(path: &str, n_shave_prefix_segments: i32) -> String {
    let segments: Vec<&str> = path.split('.').collect();
    if n_shave_prefix_segments >= 0 {
        let n = (n_shave_prefix_segments as usize).min(segments.len());
        segments[n..].join(".")
    } else {
        let n = (-n_shave_prefix_segments as usize).min(segments.len());
        segments[..segments.len() - n].join(".")
    }
}

/// Left-to-right fold of substring substitutions over a path.
pub fn apply_replacements(path: &str, rules: &[ReplacementRule]) -> String {
    rules
        .iter()
        .fold(path.to_string(), |acc, rule| acc.replace(&rule.old, &rule.new))
}

pub(crate) fn replace_all(path: &str, rules: &[(&str, &str)]) -> String {
    rules
        .iter()
        .fold(path.to_string(), |acc, (old, new)| acc.replace(old, new))
}

/// Sublayer renames inside a residual block.
const RESNET_RULES: &[(&str, &str)] = &[
    ("in_layers.0", "norm1"),
    ("in_layers.2", "conv1"),
    ("out_layers.0", "norm2"),
    ("out_layers.3", "conv2"),
    ("emb_layers.1", "time_emb_proj"),
    ("skip_connection", "conv_shortcut"),
];

/// Sublayer renames inside an attention block. The fused `qkv` tensor is
/// deliberately untouched: it is resolved by the split spec, not by renaming.
const ATTENTION_RULES: &[(&str, &str)] = &[
    ("norm.weight", "group_norm.weight"),
    ("norm.bias", "group_norm.bias"),
    ("proj_out.weight", "proj_attn.weight"),
    ("proj_out.bias", "proj_attn.bias"),
];

/// Rewrite every key of a residual block to the new naming scheme.
/// Input order is preserved.
pub fn renew_resnet_paths(old_list: &[String], n_shave_prefix_segments: i32) -> Vec<PathPair> {
    old_list
        .iter()
        .map(|old_item| {
            let new_item = replace_all(old_item, RESNET_RULES);
            PathPair {
                old: old_item.clone(),
                new: shave_segments(&new_item, n_shave_prefix_segments),
            }
        })
        .collect()
}

/// Rewrite every key of an attention block to the new naming scheme.
pub fn renew_attention_paths(old_list: &[String], n_shave_prefix_segments: i32) -> Vec<PathPair> {
    old_list
        .iter()
        .map(|old_item| {
            let new_item = replace_all(old_item, ATTENTION_RULES);
            PathPair {
                old: old_item.clone(),
                new: shave_segments(&new_item, n_shave_prefix_segments),
            }
        })
        .collect()
}
