//! Spatial self-attention over flattened feature maps

use candle_core::{Module, Tensor};
use candle_nn as nn;

use super::layers::{dims4, group_norm, resolve_num_groups, GroupNorm, VarBuilder};
use crate::error::{DiffusionError, Result};

#[derive(Debug, Clone, Copy)]
pub struct AttentionBlockConfig {
    pub num_heads: usize,
    /// Overrides the `min(32, channels / 4)` group count.
    pub num_groups: Option<usize>,
}

impl Default for AttentionBlockConfig {
    fn default() -> Self {
        Self {
            num_heads: 8,
            num_groups: None,
        }
    }
}

/// Group norm, multi-head self-attention across the `H*W` positions, then a
/// residual connection to the un-normalized input.
#[derive(Debug)]
pub struct AttentionBlock {
    norm: GroupNorm,
    q_proj: nn::Linear,
    k_proj: nn::Linear,
    v_proj: nn::Linear,
    out_proj: nn::Linear,
    channels: usize,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl AttentionBlock {
    pub fn new(vb: VarBuilder, channels: usize, config: AttentionBlockConfig) -> Result<Self> {
        if config.num_heads == 0 || channels % config.num_heads != 0 {
            return Err(DiffusionError::config(
                "num_heads",
                format!("{channels} channels are not divisible by {} heads", config.num_heads),
            ));
        }
        let num_groups = resolve_num_groups(channels, config.num_groups)?;
        let head_dim = channels / config.num_heads;

        let norm = group_norm(num_groups, channels, vb.pp("norm"))?;
        let q_proj = nn::linear(channels, channels, vb.pp("q_proj"))?;
        let k_proj = nn::linear(channels, channels, vb.pp("k_proj"))?;
        let v_proj = nn::linear(channels, channels, vb.pp("v_proj"))?;
        let out_proj = nn::linear(channels, channels, vb.pp("out_proj"))?;

        Ok(Self {
            norm,
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            channels,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// `(B, seq, C)` -> `(B * heads, seq, head_dim)`
    fn split_heads(&self, xs: &Tensor, batch_size: usize, seq_len: usize) -> Result<Tensor> {
        Ok(xs
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size * self.num_heads, seq_len, self.head_dim))?)
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, channels, height, width) = dims4(xs, "attention input")?;
        if channels != self.channels {
            return Err(DiffusionError::shape(
                "attention input",
                format!("{} channels", self.channels),
                xs.dims(),
            ));
        }
        let seq_len = height * width;

        let hs = self.norm.forward(xs)?;
        let hs = hs
            .reshape((batch_size, channels, seq_len))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.split_heads(&self.q_proj.forward(&hs)?, batch_size, seq_len)?;
        let k = self.split_heads(&self.k_proj.forward(&hs)?, batch_size, seq_len)?;
        let v = self.split_heads(&self.v_proj.forward(&hs)?, batch_size, seq_len)?;

        let scores = q.matmul(&k.t()?.contiguous()?)?.affine(self.scale, 0.0)?;
        let weights = nn::ops::softmax_last_dim(&scores)?;
        let attn = weights
            .matmul(&v)?
            .reshape((batch_size, self.num_heads, seq_len, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, channels))?;

        let out = self
            .out_proj
            .forward(&attn)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, channels, height, width))?;
        Ok((out + xs)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_attention_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = AttentionBlockConfig {
            num_heads: 4,
            num_groups: None,
        };
        let attn = AttentionBlock::new(vb, 16, config)?;
        let xs = Tensor::randn(0f32, 1f32, (2, 16, 5, 3), &device)?;
        let out = attn.forward(&xs)?;
        assert_eq!(out.dims(), &[2, 16, 5, 3]);

        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn test_zero_output_projection_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = AttentionBlock::new(vb, 8, AttentionBlockConfig { num_heads: 2, num_groups: None })?;

        // Zero the output projection so only the residual path remains.
        for (name, var) in varmap.data().lock().expect("varmap lock").iter() {
            if name.starts_with("out_proj") {
                var.set(&var.as_tensor().zeros_like()?)?;
            }
        }

        let xs = Tensor::randn(0f32, 1f32, (1, 8, 4, 4), &device)?;
        let out = attn.forward(&xs)?;
        let diff = out.sub(&xs)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_head_count_must_divide_channels() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let err = AttentionBlock::new(vb.pp("a"), 12, AttentionBlockConfig { num_heads: 5, num_groups: None })
            .unwrap_err();
        assert!(err.is_config());
        let err = AttentionBlock::new(vb.pp("b"), 12, AttentionBlockConfig { num_heads: 0, num_groups: None })
            .unwrap_err();
        assert!(err.is_config());
    }
}
