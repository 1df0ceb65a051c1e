//! Safetensors checkpoint I/O
//!
//! Thin wrappers over candle's safetensors helpers; the conversion core
//! only ever sees the flat key-to-tensor mapping.

use anyhow::{Context, Result};
use candle_core::Device;
use std::path::Path;

use crate::convert::FlatCheckpoint;

/// Load every tensor of a safetensors file into a flat mapping.
pub fn load_checkpoint(path: &Path, device: &Device) -> Result<FlatCheckpoint> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("failed to load checkpoint from {}", path.display()))?;
    log::info!("loaded {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Save a flat mapping as a safetensors file, creating parent directories.
pub fn save_checkpoint(tensors: &FlatCheckpoint, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    candle_core::safetensors::save(tensors, path)
        .with_context(|| format!("failed to save checkpoint to {}", path.display()))?;
    log::info!("saved {} tensors to {}", tensors.len(), path.display());
    Ok(())
}
