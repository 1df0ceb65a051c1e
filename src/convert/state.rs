//! Read-only view of a source state dict with consumed-key tracking
//!
//! The conversion never mutates the loaded checkpoint. Instead every tensor
//! read is recorded, so that after the walk we can verify no source key was
//! silently dropped.

use std::collections::{HashMap, HashSet};

use candle_core::Tensor;

use super::error::ConvertError;
use super::FlatCheckpoint;

pub struct StateDict {
    tensors: HashMap<String, Tensor>,
    consumed: HashSet<String>,
}

impl StateDict {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self {
            tensors,
            consumed: HashSet::new(),
        }
    }

    /// Build a state dict from every checkpoint key under `prefix`, with the
    /// prefix stripped. The source checkpoint is left untouched.
    pub fn from_prefixed(checkpoint: &FlatCheckpoint, prefix: &str) -> Self {
        let tensors = checkpoint
            .iter()
            .filter_map(|(key, tensor)| {
                key.strip_prefix(prefix)
                    .map(|stripped| (stripped.to_string(), tensor.clone()))
            })
            .collect();
        Self::new(tensors)
    }

    /// Fetch a tensor and mark it consumed. Tensor clones are shallow.
    pub fn fetch(&mut self, key: &str) -> Result<Tensor, ConvertError> {
        let tensor = self
            .tensors
            .get(key)
            .ok_or_else(|| ConvertError::MissingKey(key.to_string()))?
            .clone();
        self.consumed.insert(key.to_string());
        Ok(tensor)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Keys not yet consumed, sorted for stable reporting.
    pub fn unconsumed(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .tensors
            .keys()
            .filter(|key| !self.consumed.contains(*key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}
