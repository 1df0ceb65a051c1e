//! Convert a legacy LDM checkpoint to the modular naming scheme.

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use log::info;
use std::fs;
use std::path::PathBuf;

use ldmconvert::convert::{
    convert_ldm_bert_checkpoint, convert_ldm_unet_checkpoint, create_unet_config, BertConfig,
    LdmConfig, UNetConfig,
};
use ldmconvert::loaders::{load_checkpoint, save_checkpoint};

#[derive(Parser, Debug)]
#[command(about = "Convert a legacy LDM checkpoint to the modular naming scheme")]
struct Args {
    /// Path to the safetensors checkpoint to convert
    #[arg(long)]
    checkpoint_path: PathBuf,

    /// The YAML config file describing the original architecture
    #[arg(long)]
    original_config_file: PathBuf,

    /// Optional JSON config for the target architecture; derived from the
    /// original config when omitted
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Optional JSON config for the LDMBert text encoder; the text encoder
    /// is skipped when omitted
    #[arg(long)]
    ldm_bert_config_file: Option<PathBuf>,

    /// Output directory
    #[arg(long)]
    dump_path: PathBuf,
}

fn main() -> Result<()> {
    ldmconvert::logging::init_logger();
    let args = Args::parse();

    let device = Device::Cpu;
    let checkpoint = load_checkpoint(&args.checkpoint_path, &device)?;

    let config: UNetConfig = match &args.config_file {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&json)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => {
            let yaml = fs::read_to_string(&args.original_config_file).with_context(|| {
                format!("failed to read {}", args.original_config_file.display())
            })?;
            let original: LdmConfig = serde_yaml::from_str(&yaml).with_context(|| {
                format!("failed to parse {}", args.original_config_file.display())
            })?;
            create_unet_config(&original)
        }
    };

    let converted = convert_ldm_unet_checkpoint(&checkpoint, &config)?;

    let unet_dir = args.dump_path.join("unet");
    save_checkpoint(&converted, &unet_dir.join("diffusion_pytorch_model.safetensors"))?;
    fs::write(
        unet_dir.join("config.json"),
        serde_json::to_string_pretty(&config)?,
    )
    .context("failed to write unet config")?;

    if let Some(path) = &args.ldm_bert_config_file {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let bert_config: BertConfig = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let bert = convert_ldm_bert_checkpoint(&checkpoint, &bert_config)?;
        save_checkpoint(&bert, &args.dump_path.join("bert").join("model.safetensors"))?;
    }

    info!("conversion complete: {}", args.dump_path.display());
    Ok(())
}
