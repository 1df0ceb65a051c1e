//! End-to-end conversion of small synthetic checkpoints

use candle_core::{DType, Device, Tensor};
use std::collections::HashSet;

use ldmconvert::convert::{convert_ldm_unet_checkpoint, FlatCheckpoint, UNetConfig, UNET_PREFIX};

const C: usize = 4;

fn zeros(shape: &[usize]) -> Tensor {
    Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
}

fn insert_resnet(ckpt: &mut FlatCheckpoint, prefix: &str, with_shortcut: bool) {
    for name in ["in_layers.0", "out_layers.0"] {
        ckpt.insert(format!("{UNET_PREFIX}{prefix}.{name}.weight"), zeros(&[C]));
        ckpt.insert(format!("{UNET_PREFIX}{prefix}.{name}.bias"), zeros(&[C]));
    }
    for name in ["in_layers.2", "out_layers.3"] {
        ckpt.insert(format!("{UNET_PREFIX}{prefix}.{name}.weight"), zeros(&[C, C, 3, 3]));
        ckpt.insert(format!("{UNET_PREFIX}{prefix}.{name}.bias"), zeros(&[C]));
    }
    ckpt.insert(format!("{UNET_PREFIX}{prefix}.emb_layers.1.weight"), zeros(&[C, C]));
    ckpt.insert(format!("{UNET_PREFIX}{prefix}.emb_layers.1.bias"), zeros(&[C]));
    if with_shortcut {
        ckpt.insert(
            format!("{UNET_PREFIX}{prefix}.skip_connection.weight"),
            zeros(&[C, 2 * C, 1, 1]),
        );
        ckpt.insert(format!("{UNET_PREFIX}{prefix}.skip_connection.bias"), zeros(&[C]));
    }
}

fn insert_attention(ckpt: &mut FlatCheckpoint, prefix: &str) {
    ckpt.insert(format!("{UNET_PREFIX}{prefix}.norm.weight"), zeros(&[C]));
    ckpt.insert(format!("{UNET_PREFIX}{prefix}.norm.bias"), zeros(&[C]));
    let qkv_weight: Vec<f32> = (0..3 * C * C).map(|v| v as f32).collect();
    ckpt.insert(
        format!("{UNET_PREFIX}{prefix}.qkv.weight"),
        Tensor::from_vec(qkv_weight, &[3 * C, C, 1], &Device::Cpu).unwrap(),
    );
    ckpt.insert(
        format!("{UNET_PREFIX}{prefix}.qkv.bias"),
        Tensor::arange(0f32, (3 * C) as f32, &Device::Cpu).unwrap(),
    );
    ckpt.insert(format!("{UNET_PREFIX}{prefix}.proj_out.weight"), zeros(&[C, C, 1]));
    ckpt.insert(format!("{UNET_PREFIX}{prefix}.proj_out.bias"), zeros(&[C]));
}

fn insert_fixed(ckpt: &mut FlatCheckpoint) {
    ckpt.insert(format!("{UNET_PREFIX}time_embed.0.weight"), zeros(&[C, C]));
    ckpt.insert(format!("{UNET_PREFIX}time_embed.0.bias"), zeros(&[C]));
    ckpt.insert(format!("{UNET_PREFIX}time_embed.2.weight"), zeros(&[C, C]));
    ckpt.insert(format!("{UNET_PREFIX}time_embed.2.bias"), zeros(&[C]));
    ckpt.insert(format!("{UNET_PREFIX}input_blocks.0.0.weight"), zeros(&[C, 4, 3, 3]));
    ckpt.insert(format!("{UNET_PREFIX}input_blocks.0.0.bias"), zeros(&[C]));
    ckpt.insert(format!("{UNET_PREFIX}out.0.weight"), zeros(&[C]));
    ckpt.insert(format!("{UNET_PREFIX}out.0.bias"), zeros(&[C]));
    ckpt.insert(format!("{UNET_PREFIX}out.2.weight"), zeros(&[4, C, 3, 3]));
    ckpt.insert(format!("{UNET_PREFIX}out.2.bias"), zeros(&[4]));
}

fn config(num_stages: usize) -> UNetConfig {
    UNetConfig {
        sample_size: 8,
        in_channels: 4,
        out_channels: 4,
        down_block_types: vec!["DownBlock2D".to_string(); num_stages],
        up_block_types: vec!["UpBlock2D".to_string(); num_stages],
        block_out_channels: vec![C; num_stages],
        layers_per_block: 1,
        cross_attention_dim: None,
        attention_head_dim: C,
    }
}

fn resnet_keys(prefix: &str, with_shortcut: bool) -> Vec<String> {
    let mut names = vec!["norm1", "conv1", "time_emb_proj", "norm2", "conv2"];
    if with_shortcut {
        names.push("conv_shortcut");
    }
    names
        .iter()
        .flat_map(|name| {
            vec![format!("{prefix}.{name}.weight"), format!("{prefix}.{name}.bias")]
        })
        .collect()
}

fn attention_keys(prefix: &str, split_prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for name in ["group_norm", "proj_attn"] {
        keys.push(format!("{prefix}.{name}.weight"));
        keys.push(format!("{prefix}.{name}.bias"));
    }
    for name in ["query", "key", "value"] {
        keys.push(format!("{split_prefix}.{name}.weight"));
        keys.push(format!("{split_prefix}.{name}.bias"));
    }
    keys
}

/// One down stage with attention, the middle triple, one up stage whose
/// second block is a lone residual block. The converted key set must match
/// the hand-enumerated target set exactly.
#[test]
fn test_single_stage_key_set() {
    let mut ckpt = FlatCheckpoint::new();
    insert_fixed(&mut ckpt);
    insert_resnet(&mut ckpt, "input_blocks.1.0", false);
    insert_attention(&mut ckpt, "input_blocks.1.1");
    insert_resnet(&mut ckpt, "middle_block.0", false);
    insert_attention(&mut ckpt, "middle_block.1");
    insert_resnet(&mut ckpt, "middle_block.2", false);
    insert_resnet(&mut ckpt, "output_blocks.0.0", true);
    insert_attention(&mut ckpt, "output_blocks.0.1");
    insert_resnet(&mut ckpt, "output_blocks.1.0", true);
    // keys outside the unet prefix are ignored
    ckpt.insert("first_stage_model.encoder.conv_in.weight".to_string(), zeros(&[C]));

    let converted = convert_ldm_unet_checkpoint(&ckpt, &config(1)).unwrap();

    let mut expected: HashSet<String> = HashSet::new();
    for name in [
        "time_embedding.linear_1",
        "time_embedding.linear_2",
        "conv_in",
        "conv_norm_out",
        "conv_out",
    ] {
        expected.insert(format!("{name}.weight"));
        expected.insert(format!("{name}.bias"));
    }
    expected.extend(resnet_keys("downsample_blocks.0.resnets.0", false));
    expected.extend(attention_keys(
        "downsample_blocks.0.attentions.0",
        "downsample_blocks.0.attentions.0",
    ));
    expected.extend(resnet_keys("mid.resnets.0", false));
    expected.extend(resnet_keys("mid.resnets.1", false));
    expected.extend(attention_keys("mid.attentions.0", "mid_block.attentions.0"));
    expected.extend(resnet_keys("up_blocks.0.resnets.0", true));
    expected.extend(attention_keys("up_blocks.0.attentions.0", "up_blocks.0.attentions.0"));
    expected.extend(resnet_keys("up_blocks.0.resnets.1", true));

    let got: HashSet<String> = converted.keys().cloned().collect();
    let missing: Vec<&String> = expected.difference(&got).collect();
    let extra: Vec<&String> = got.difference(&expected).collect();
    assert!(missing.is_empty(), "missing keys: {missing:?}");
    assert!(extra.is_empty(), "extra keys: {extra:?}");
}

#[test]
fn test_single_stage_shapes_and_values() {
    let mut ckpt = FlatCheckpoint::new();
    insert_fixed(&mut ckpt);
    insert_resnet(&mut ckpt, "input_blocks.1.0", false);
    insert_attention(&mut ckpt, "input_blocks.1.1");
    insert_resnet(&mut ckpt, "middle_block.0", false);
    insert_attention(&mut ckpt, "middle_block.1");
    insert_resnet(&mut ckpt, "middle_block.2", false);
    insert_resnet(&mut ckpt, "output_blocks.0.0", true);
    insert_attention(&mut ckpt, "output_blocks.0.1");
    insert_resnet(&mut ckpt, "output_blocks.1.0", true);

    let converted = convert_ldm_unet_checkpoint(&ckpt, &config(1)).unwrap();

    // the conv 1D projection weight lost its trailing kernel axis
    let proj = &converted["downsample_blocks.0.attentions.0.proj_attn.weight"];
    assert_eq!(proj.dims(), &[C, C]);

    // single head: the fused (3C, C, 1) weight splits into plain thirds
    let query = &converted["downsample_blocks.0.attentions.0.query.weight"];
    let value = &converted["downsample_blocks.0.attentions.0.value.weight"];
    assert_eq!(query.dims(), &[C, C]);
    assert_eq!(query.to_vec2::<f32>().unwrap()[0][0], 0.0);
    assert_eq!(
        value.to_vec2::<f32>().unwrap()[0][0],
        (2 * C * C) as f32
    );
    let bias = &converted["mid_block.attentions.0.key.bias"];
    assert_eq!(bias.dims(), &[C]);
    assert_eq!(bias.to_vec1::<f32>().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);

    // untouched tensors keep their shape
    assert_eq!(
        converted["up_blocks.0.resnets.0.conv_shortcut.weight"].dims(),
        &[C, 2 * C, 1, 1]
    );
    assert_eq!(converted["conv_in.weight"].dims(), &[C, 4, 3, 3]);
}

/// Two stages: the down path has a strided downsampler between stages and
/// the up path carries an upsampler alongside attention. Suffix-based
/// classification must route the upsampler without swallowing the attention
/// keys next to it.
#[test]
fn test_two_stage_with_samplers() {
    let mut ckpt = FlatCheckpoint::new();
    insert_fixed(&mut ckpt);
    insert_resnet(&mut ckpt, "input_blocks.1.0", false);
    insert_attention(&mut ckpt, "input_blocks.1.1");
    ckpt.insert(format!("{UNET_PREFIX}input_blocks.2.0.op.weight"), zeros(&[C, C, 3, 3]));
    ckpt.insert(format!("{UNET_PREFIX}input_blocks.2.0.op.bias"), zeros(&[C]));
    insert_resnet(&mut ckpt, "input_blocks.3.0", false);
    insert_resnet(&mut ckpt, "middle_block.0", false);
    insert_attention(&mut ckpt, "middle_block.1");
    insert_resnet(&mut ckpt, "middle_block.2", false);
    insert_resnet(&mut ckpt, "output_blocks.0.0", true);
    insert_attention(&mut ckpt, "output_blocks.0.1");
    insert_resnet(&mut ckpt, "output_blocks.1.0", true);
    insert_attention(&mut ckpt, "output_blocks.1.1");
    ckpt.insert(format!("{UNET_PREFIX}output_blocks.1.2.conv.weight"), zeros(&[C, C, 3, 3]));
    ckpt.insert(format!("{UNET_PREFIX}output_blocks.1.2.conv.bias"), zeros(&[C]));
    insert_resnet(&mut ckpt, "output_blocks.2.0", true);
    insert_resnet(&mut ckpt, "output_blocks.3.0", true);

    let converted = convert_ldm_unet_checkpoint(&ckpt, &config(2)).unwrap();

    assert!(converted.contains_key("downsample_blocks.0.downsamplers.0.conv.weight"));
    assert!(converted.contains_key("downsample_blocks.1.resnets.0.norm1.weight"));
    assert!(converted.contains_key("up_blocks.0.upsamplers.0.conv.weight"));
    assert!(converted.contains_key("up_blocks.0.upsamplers.0.conv.bias"));
    // the attention block next to the upsampler is still converted
    assert!(converted.contains_key("up_blocks.0.attentions.1.query.weight"));
    assert!(converted.contains_key("up_blocks.0.attentions.1.proj_attn.weight"));
    assert!(converted.contains_key("up_blocks.1.resnets.0.conv_shortcut.weight"));
    assert!(converted.contains_key("up_blocks.1.resnets.1.norm2.bias"));

    // no source tensor is dropped: count both sides
    let sources = ckpt.len();
    // each qkv tensor becomes three outputs (+4 per attention block x 4)
    assert_eq!(converted.len(), sources + 4 * 4);
}
