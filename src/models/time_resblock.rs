//! Time-conditioned residual block
//!
//! Two 3x3 convolutions with group normalization, conditioned on a per-sample
//! time embedding either additively or by feature-wise scaling (FiLM).

use candle_core::{Module, Tensor};
use candle_nn as nn;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::layers::{conv1x1, conv3x3, dims4, group_norm, resolve_num_groups, Conv2d, GroupNorm, VarBuilder};
use crate::error::{DiffusionError, Result};

/// How the projected time embedding enters the main path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInjection {
    /// `h + proj(e)`
    #[default]
    Add,
    /// `h * (1 + proj(e))`, scale only.
    #[serde(rename = "FiLM")]
    Film,
}

impl FromStr for TimeInjection {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Add" | "add" => Ok(Self::Add),
            "FiLM" | "film" => Ok(Self::Film),
            other => Err(DiffusionError::config(
                "time_injection",
                format!("unknown mode {other:?}, expected \"Add\" or \"FiLM\""),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimeResidualBlockConfig {
    pub time_injection: TimeInjection,
    /// Overrides the `min(32, out_channels / 4)` group count.
    pub num_groups: Option<usize>,
}

#[derive(Debug)]
pub struct TimeResidualBlock {
    conv1: Conv2d,
    norm1: GroupNorm,
    conv2: Conv2d,
    norm2: GroupNorm,
    time_emb_proj: nn::Linear,
    conv_shortcut: Option<Conv2d>,
    in_channels: usize,
    out_channels: usize,
    time_emb_dim: usize,
    time_injection: TimeInjection,
}

impl TimeResidualBlock {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        config: TimeResidualBlockConfig,
    ) -> Result<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(DiffusionError::config(
                "channels",
                format!("residual block needs non-zero channels, got {in_channels} -> {out_channels}"),
            ));
        }
        if time_emb_dim == 0 {
            return Err(DiffusionError::config("time_emb_dim", "must be positive"));
        }
        let num_groups = resolve_num_groups(out_channels, config.num_groups)?;

        let conv1 = conv3x3(in_channels, out_channels, vb.pp("conv1"))?;
        let norm1 = group_norm(num_groups, out_channels, vb.pp("norm1"))?;
        let conv2 = conv3x3(out_channels, out_channels, vb.pp("conv2"))?;
        let norm2 = group_norm(num_groups, out_channels, vb.pp("norm2"))?;
        let time_emb_proj = nn::linear(time_emb_dim, out_channels, vb.pp("time_emb_proj"))?;
        let conv_shortcut = if in_channels != out_channels {
            Some(conv1x1(in_channels, out_channels, vb.pp("conv_shortcut"))?)
        } else {
            None
        };

        Ok(Self {
            conv1,
            norm1,
            conv2,
            norm2,
            time_emb_proj,
            conv_shortcut,
            in_channels,
            out_channels,
            time_emb_dim,
            time_injection: config.time_injection,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn time_injection(&self) -> TimeInjection {
        self.time_injection
    }

    /// `xs`: `(B, in_channels, H, W)`, `temb`: `(B, time_emb_dim)`.
    pub fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let (batch_size, channels, _, _) = dims4(xs, "residual block input")?;
        if channels != self.in_channels {
            return Err(DiffusionError::shape(
                "residual block input",
                format!("{} channels", self.in_channels),
                xs.dims(),
            ));
        }
        match temb.dims2() {
            Ok((b, e)) if b == batch_size && e == self.time_emb_dim => {}
            _ => {
                return Err(DiffusionError::shape(
                    "residual block time embedding",
                    format!("({batch_size}, {})", self.time_emb_dim),
                    temb.dims(),
                ))
            }
        }

        let shortcut = match &self.conv_shortcut {
            Some(conv_shortcut) => conv_shortcut.forward(xs)?,
            None => xs.clone(),
        };

        let hs = self.conv1.forward(xs)?;
        let hs = nn::ops::silu(&self.norm1.forward(&hs)?)?;

        let time_signal = self
            .time_emb_proj
            .forward(&nn::ops::silu(temb)?)?
            .reshape((batch_size, self.out_channels, 1, 1))?;
        let hs = match self.time_injection {
            TimeInjection::Add => hs.broadcast_add(&time_signal)?,
            TimeInjection::Film => hs.broadcast_mul(&time_signal.affine(1.0, 1.0)?)?,
        };

        let hs = self.norm2.forward(&self.conv2.forward(&hs)?)?;
        Ok((hs + shortcut)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_output_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let block = TimeResidualBlock::new(vb.pp("proj"), 8, 16, 32, Default::default())?;
        let xs = Tensor::randn(0f32, 1f32, (2, 8, 6, 6), &device)?;
        let temb = Tensor::randn(0f32, 1f32, (2, 32), &device)?;
        assert_eq!(block.forward(&xs, &temb)?.dims(), &[2, 16, 6, 6]);

        let film = TimeResidualBlockConfig {
            time_injection: TimeInjection::Film,
            ..Default::default()
        };
        let block = TimeResidualBlock::new(vb.pp("same"), 8, 8, 32, film)?;
        assert!(block.conv_shortcut.is_none());
        assert_eq!(block.forward(&xs, &temb)?.dims(), &[2, 8, 6, 6]);
        Ok(())
    }

    #[test]
    fn test_zero_embedding_adds_bias_only() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        // min(32, 3 / 4) is zero groups, so three channels need an explicit group count.
        let config = TimeResidualBlockConfig {
            time_injection: TimeInjection::Add,
            num_groups: Some(1),
        };
        let block = TimeResidualBlock::new(vb, 3, 3, 8, config)?;
        assert!(block.conv_shortcut.is_none());

        let xs = Tensor::randn(0f32, 1f32, (2, 3, 5, 5), &device)?;
        let temb = Tensor::zeros((2, 8), DType::F32, &device)?;
        let out = block.forward(&xs, &temb)?;

        // silu(0) = 0, so the projection reduces to its bias.
        let bias = block
            .time_emb_proj
            .bias()
            .expect("linear layer has a bias")
            .reshape((1, 3, 1, 1))?;
        let hs = nn::ops::silu(&block.norm1.forward(&block.conv1.forward(&xs)?)?)?;
        let hs = hs.broadcast_add(&bias)?;
        let expected = (block.norm2.forward(&block.conv2.forward(&hs)?)? + &xs)?;

        assert!(max_abs_diff(&out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_film_scales_by_one_plus_bias() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = TimeResidualBlockConfig {
            time_injection: TimeInjection::Film,
            num_groups: None,
        };
        let block = TimeResidualBlock::new(vb, 4, 8, 8, config)?;

        let xs = Tensor::randn(0f32, 1f32, (1, 4, 4, 4), &device)?;
        let temb = Tensor::zeros((1, 8), DType::F32, &device)?;
        let out = block.forward(&xs, &temb)?;

        let scale = block
            .time_emb_proj
            .bias()
            .expect("linear layer has a bias")
            .affine(1.0, 1.0)?
            .reshape((1, 8, 1, 1))?;
        let hs = nn::ops::silu(&block.norm1.forward(&block.conv1.forward(&xs)?)?)?;
        let hs = hs.broadcast_mul(&scale)?;
        let shortcut = block.conv_shortcut.as_ref().expect("4 -> 8 projects").forward(&xs)?;
        let expected = (block.norm2.forward(&block.conv2.forward(&hs)?)? + shortcut)?;

        assert!(max_abs_diff(&out, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_construction_errors() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let err = TimeResidualBlock::new(vb.pp("a"), 3, 3, 8, Default::default()).unwrap_err();
        assert!(err.is_config());
        let err = TimeResidualBlock::new(vb.pp("b"), 4, 8, 0, Default::default()).unwrap_err();
        assert!(err.is_config());

        assert!("Cross".parse::<TimeInjection>().unwrap_err().is_config());
        assert_eq!("FiLM".parse::<TimeInjection>()?, TimeInjection::Film);
        assert_eq!("Add".parse::<TimeInjection>()?, TimeInjection::Add);
        Ok(())
    }

    #[test]
    fn test_forward_shape_errors() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = TimeResidualBlock::new(vb, 8, 8, 16, Default::default())?;

        let temb = Tensor::zeros((2, 16), DType::F32, &device)?;
        let wrong_channels = Tensor::zeros((2, 4, 4, 4), DType::F32, &device)?;
        assert!(block.forward(&wrong_channels, &temb).unwrap_err().is_shape());

        let xs = Tensor::zeros((2, 8, 4, 4), DType::F32, &device)?;
        let wrong_batch = Tensor::zeros((3, 16), DType::F32, &device)?;
        assert!(block.forward(&xs, &wrong_batch).unwrap_err().is_shape());

        let flat = Tensor::zeros((2, 8, 16), DType::F32, &device)?;
        assert!(block.forward(&flat, &temb).unwrap_err().is_shape());
        Ok(())
    }
}
