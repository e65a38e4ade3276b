//! Reference time-conditioned U-Net
//!
//! Encoder of `DownBlock`s, a `MidBlock` bottleneck and a mirrored decoder of
//! `UpBlock`s, conditioned on a sinusoidal timestep embedding.

use candle_core::{Module, Tensor};
use log::debug;
use serde::{Deserialize, Serialize};

use super::blocks::{DownBlock, MidBlock, SkipConnections, StageConfig, UpBlock};
use super::embeddings::TimestepEmbedding;
use super::layers::{conv1x1, conv3x3, dims4, Conv2d, VarBuilder};
use super::network::DenoisingNetwork;
use super::time_resblock::TimeInjection;
use crate::error::{DiffusionError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeUnetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Width of the first stage; stage `i` uses `chans * 2^i`.
    pub chans: usize,
    pub num_pool_layers: usize,
    pub time_emb_dim: usize,
    pub layers_per_block: usize,
    /// Attention per encoder stage (mirrored in the decoder). Empty disables it everywhere.
    pub attention_levels: Vec<bool>,
    pub mid_attention: bool,
    pub num_heads: usize,
    pub time_injection: TimeInjection,
}

impl Default for TimeUnetConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            chans: 64,
            num_pool_layers: 3,
            time_emb_dim: 256,
            layers_per_block: 2,
            attention_levels: Vec::new(),
            mid_attention: true,
            num_heads: 8,
            time_injection: TimeInjection::Add,
        }
    }
}

impl TimeUnetConfig {
    fn stage_channels(&self) -> Vec<usize> {
        (0..self.num_pool_layers).map(|i| self.chans << i).collect()
    }

    fn attention_at(&self, level: usize) -> bool {
        self.attention_levels.get(level).copied().unwrap_or(false)
    }

    fn stage_config(&self, use_attention: bool) -> StageConfig {
        StageConfig {
            num_layers: self.layers_per_block,
            use_attention,
            num_heads: self.num_heads,
            time_injection: self.time_injection,
        }
    }
}

#[derive(Debug)]
pub struct TimeUnet {
    time_embedding: TimestepEmbedding,
    conv_in: Conv2d,
    down_blocks: Vec<DownBlock>,
    mid_block: MidBlock,
    up_blocks: Vec<UpBlock>,
    conv_out: Conv2d,
    config: TimeUnetConfig,
}

impl TimeUnet {
    pub fn new(vb: VarBuilder, config: TimeUnetConfig) -> Result<Self> {
        if config.num_pool_layers == 0 {
            return Err(DiffusionError::config("num_pool_layers", "the U-Net needs at least one pooling stage"));
        }
        if config.in_channels == 0 || config.out_channels == 0 || config.chans == 0 {
            return Err(DiffusionError::config("channels", "in/out channels and chans must be positive"));
        }
        if !config.attention_levels.is_empty() && config.attention_levels.len() != config.num_pool_layers {
            return Err(DiffusionError::config(
                "attention_levels",
                format!(
                    "expected {} entries (one per pooling stage), got {}",
                    config.num_pool_layers,
                    config.attention_levels.len()
                ),
            ));
        }

        let time_embedding = TimestepEmbedding::new(vb.pp("time_embedding"), config.time_emb_dim)?;
        let conv_in = conv3x3(config.in_channels, config.chans, vb.pp("conv_in"))?;

        let stage_channels = config.stage_channels();
        let vb_down = vb.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(config.num_pool_layers);
        let mut channels = config.chans;
        for (level, &out_channels) in stage_channels.iter().enumerate() {
            let stage = config.stage_config(config.attention_at(level));
            down_blocks.push(DownBlock::new(
                vb_down.pp(level.to_string()),
                channels,
                out_channels,
                config.time_emb_dim,
                stage,
            )?);
            channels = out_channels;
        }

        let mid_block = MidBlock::new(
            vb.pp("mid_block"),
            channels,
            config.time_emb_dim,
            config.stage_config(config.mid_attention),
        )?;

        let vb_up = vb.pp("up_blocks");
        let mut up_blocks = Vec::with_capacity(config.num_pool_layers);
        for (i, level) in (0..config.num_pool_layers).rev().enumerate() {
            let out_channels = stage_channels[level];
            let stage = config.stage_config(config.attention_at(level));
            up_blocks.push(UpBlock::new(
                vb_up.pp(i.to_string()),
                channels,
                out_channels,
                out_channels,
                config.time_emb_dim,
                stage,
            )?);
            channels = out_channels;
        }

        let conv_out = conv1x1(channels, config.out_channels, vb.pp("conv_out"))?;

        Ok(Self {
            time_embedding,
            conv_in,
            down_blocks,
            mid_block,
            up_blocks,
            conv_out,
            config,
        })
    }

    pub fn config(&self) -> &TimeUnetConfig {
        &self.config
    }

    pub fn forward(&self, xs: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let (batch_size, channels, height, width) = dims4(xs, "u-net input")?;
        let factor = 1usize << self.config.num_pool_layers;
        if channels != self.config.in_channels || height % factor != 0 || width % factor != 0 {
            return Err(DiffusionError::shape(
                "u-net input",
                format!(
                    "{} channels with height and width divisible by {factor}",
                    self.config.in_channels
                ),
                xs.dims(),
            ));
        }
        if timesteps.dims() != [batch_size] {
            return Err(DiffusionError::shape(
                "u-net timesteps",
                format!("({batch_size},)"),
                timesteps.dims(),
            ));
        }

        let temb = self.time_embedding.forward(timesteps)?.to_dtype(xs.dtype())?;
        let mut hs = self.conv_in.forward(xs)?;

        let mut skips = SkipConnections::new();
        for down in &self.down_blocks {
            let (next, skip) = down.forward(&hs, &temb)?;
            skips.push(skip);
            hs = next;
        }

        hs = self.mid_block.forward(&hs, &temb)?;

        for up in &self.up_blocks {
            let skip = skips.pop()?;
            hs = up.forward(&hs, &temb, Some(&skip))?;
        }
        debug!("u-net forward: {:?} -> {:?}", xs.dims(), hs.dims());

        Ok(self.conv_out.forward(&hs)?)
    }
}

impl DenoisingNetwork for TimeUnet {
    fn predict_noise(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        self.forward(x_t, timesteps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn small_config() -> TimeUnetConfig {
        TimeUnetConfig {
            in_channels: 1,
            out_channels: 1,
            chans: 8,
            num_pool_layers: 2,
            time_emb_dim: 16,
            layers_per_block: 1,
            attention_levels: vec![false, true],
            mid_attention: true,
            num_heads: 2,
            time_injection: TimeInjection::Film,
        }
    }

    #[test]
    fn test_unet_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = TimeUnet::new(vb, small_config())?;
        assert_eq!(unet.down_blocks.len(), 2);
        assert_eq!(unet.up_blocks.len(), 2);
        assert_eq!(unet.up_blocks[0].in_channels(), 16);
        assert_eq!(unet.up_blocks[1].out_channels(), 8);

        let xs = Tensor::randn(0f32, 1f32, (2, 1, 8, 8), &device)?;
        let ts = Tensor::new(&[3f32, 700.], &device)?;
        let eps = unet.predict_noise(&xs, &ts)?;
        assert_eq!(eps.dims(), &[2, 1, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_unet_rejects_bad_inputs() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let unet = TimeUnet::new(vb, small_config())?;

        let ts = Tensor::new(&[1f32], &device)?;
        let odd = Tensor::zeros((1, 1, 6, 6), DType::F32, &device)?;
        assert!(unet.forward(&odd, &ts).unwrap_err().is_shape());

        let xs = Tensor::zeros((1, 1, 8, 8), DType::F32, &device)?;
        let two = Tensor::new(&[1f32, 2.], &device)?;
        assert!(unet.forward(&xs, &two).unwrap_err().is_shape());
        Ok(())
    }

    #[test]
    fn test_unet_config_errors() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let config = TimeUnetConfig {
            attention_levels: vec![true],
            ..small_config()
        };
        assert!(TimeUnet::new(vb.pp("a"), config).unwrap_err().is_config());

        let config = TimeUnetConfig {
            num_heads: 3,
            ..small_config()
        };
        assert!(TimeUnet::new(vb.pp("b"), config).unwrap_err().is_config());
    }
}
