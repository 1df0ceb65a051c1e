//! Target architecture config and its derivation from the legacy YAML
//!
//! The legacy config describes the U-Net by base channel count and per-stage
//! multipliers; the modular implementation wants explicit per-stage output
//! channels and block types. The derivation is deterministic.

use serde::{Deserialize, Serialize};

/// Structured description of the target U-Net.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UNetConfig {
    pub sample_size: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub down_block_types: Vec<String>,
    pub up_block_types: Vec<String>,
    pub block_out_channels: Vec<usize>,
    /// Residual blocks per resolution stage.
    pub layers_per_block: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_attention_dim: Option<usize>,
    /// Channels per attention head; also the stride used when splitting the
    /// fused qkv projection.
    pub attention_head_dim: usize,
}

/// The slice of the legacy YAML config the conversion needs
/// (`model.params.unet_config.params`). Unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct LdmConfig {
    pub model: LdmModel,
}

#[derive(Debug, Deserialize)]
pub struct LdmModel {
    pub params: LdmModelParams,
}

#[derive(Debug, Deserialize)]
pub struct LdmModelParams {
    pub unet_config: LdmUnetConfig,
}

#[derive(Debug, Deserialize)]
pub struct LdmUnetConfig {
    pub params: LdmUnetParams,
}

#[derive(Debug, Deserialize)]
pub struct LdmUnetParams {
    pub image_size: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub model_channels: usize,
    pub channel_mult: Vec<usize>,
    pub num_res_blocks: usize,
    #[serde(default)]
    pub context_dim: Option<usize>,
    #[serde(default)]
    pub num_heads: Option<usize>,
    /// Legacy configs use -1 to mean "fixed head count instead".
    #[serde(default)]
    pub num_head_channels: Option<i64>,
}

/// Derive the target config from a parsed legacy config.
///
/// Every stage but the last downsamples and carries cross-attention; the
/// up path mirrors it with the innermost stage plain.
pub fn create_unet_config(original: &LdmConfig) -> UNetConfig {
    let unet_params = &original.model.params.unet_config.params;

    let block_out_channels: Vec<usize> = unet_params
        .channel_mult
        .iter()
        .map(|mult| unet_params.model_channels * mult)
        .collect();

    let num_stages = block_out_channels.len();
    let down_block_types: Vec<String> = (0..num_stages)
        .map(|i| {
            if i < num_stages - 1 {
                "CrossAttnDownBlock2D".to_string()
            } else {
                "DownBlock2D".to_string()
            }
        })
        .collect();
    let up_block_types: Vec<String> = (0..num_stages)
        .map(|i| {
            if i == 0 {
                "UpBlock2D".to_string()
            } else {
                "CrossAttnUpBlock2D".to_string()
            }
        })
        .collect();

    let attention_head_dim = match unet_params.num_head_channels {
        Some(channels) if channels > 0 => channels as usize,
        _ => unet_params.num_heads.unwrap_or(1),
    };

    UNetConfig {
        sample_size: unet_params.image_size,
        in_channels: unet_params.in_channels,
        out_channels: unet_params.out_channels,
        down_block_types,
        up_block_types,
        block_out_channels,
        layers_per_block: unet_params.num_res_blocks,
        cross_attention_dim: unet_params.context_dim,
        attention_head_dim,
    }
}
