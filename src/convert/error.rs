//! Error taxonomy for checkpoint conversion
//! Every error is fatal: conversion is a one-shot offline transformation
//! and a partial output would load cleanly but compute wrong numbers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// The fused qkv tensor cannot be split with the configured head size.
    /// The architecture config does not match the checkpoint.
    #[error("attention tensor '{key}' has leading dim {dim}, not divisible by 3 x {head_channels} head channels")]
    ShapeMismatch {
        key: String,
        dim: usize,
        head_channels: usize,
    },

    /// A fixed-name tensor (time embedding, input/output conv) is absent.
    #[error("checkpoint is missing expected key '{0}'")]
    MissingKey(String),

    /// A block's sublayer grouping matches none of the supported patterns.
    #[error("block '{block}' has an unexpected sublayer layout: {detail}")]
    UnexpectedBlockShape { block: String, detail: String },

    /// Two conversion rules produced the same destination key.
    #[error("key '{0}' was written twice into the converted checkpoint")]
    DuplicateKey(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
