//! Attention mask utilities for the BDH linear attention
//!
//! BDH attention keeps only strictly-past positions: the score matrix is
//! multiplied by a strictly lower-triangular 0/1 mask instead of receiving an
//! additive `-inf` mask before a softmax.
//!
//! ## Caching Strategy
//!
//! Masks are cached by `(seq_len, device_id, dtype)` inside a [`MaskCache`]
//! owned by the model. The cache sits behind a `Mutex`, so a model shared
//! across threads can build masks lazily; cached tensors are immutable and
//! handed out as shallow clones (Arc bump, no data copy).

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Get device identifier for cache key
///
/// Note: This simplified approach assumes a single device per type.
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Build a strictly lower-triangular mask of shape `[seq_len, seq_len]`
///
/// For seq_len=4:
/// ```text
/// [[0, 0, 0, 0],
///  [1, 0, 0, 0],
///  [1, 1, 0, 0],
///  [1, 1, 1, 0]]
/// ```
pub fn create_strict_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j < i { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)?)
}

/// Lock-protected cache of strict causal masks
#[derive(Debug, Default)]
pub struct MaskCache {
    masks: Mutex<HashMap<(usize, usize, DType), Tensor>>,
}

impl MaskCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or retrieve the mask for `seq_len`
    pub fn strict_causal(&self, seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let key = (seq_len, device_id(device), dtype);
        {
            let masks = self
                .masks
                .lock()
                .map_err(|_| anyhow::anyhow!("mask cache lock poisoned"))?;
            if let Some(cached) = masks.get(&key) {
                return Ok(cached.clone());
            }
        }

        let mask = create_strict_causal_mask(seq_len, device, dtype)?;
        let mut masks = self
            .masks
            .lock()
            .map_err(|_| anyhow::anyhow!("mask cache lock poisoned"))?;
        Ok(masks.entry(key).or_insert(mask).clone())
    }

    /// Number of cached masks
    pub fn len(&self) -> usize {
        self.masks.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached mask
    pub fn clear(&self) {
        if let Ok(mut masks) = self.masks.lock() {
            masks.clear();
        }
    }
}
