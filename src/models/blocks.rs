//! Encoder, bottleneck and decoder stages built from time-conditioned residual blocks
//!
//! Each stage owns an ordered list of residual blocks and, when attention is
//! enabled, a parallel list of attention blocks applied after each residual
//! block. Skip tensors flow from `DownBlock` to `UpBlock` through
//! [`SkipConnections`], consumed in reverse order of production.

use candle_core::{Module, Tensor};
use log::debug;

use super::attention::{AttentionBlock, AttentionBlockConfig};
use super::layers::{dims4, downsample_conv, upsample_conv, Conv2d, ConvTranspose2d, VarBuilder};
use super::time_resblock::{TimeInjection, TimeResidualBlock, TimeResidualBlockConfig};
use crate::error::{DiffusionError, Result};

/// Configuration shared by the Mid/Down/Up stages
#[derive(Debug, Clone, Copy)]
pub struct StageConfig {
    pub num_layers: usize,
    pub use_attention: bool,
    pub num_heads: usize,
    pub time_injection: TimeInjection,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            num_layers: 2,
            use_attention: false,
            num_heads: 8,
            time_injection: TimeInjection::Add,
        }
    }
}

/// Residual blocks with optional interleaved attention.
#[derive(Debug)]
struct ResidualStack {
    resnets: Vec<TimeResidualBlock>,
    attentions: Option<Vec<AttentionBlock>>,
}

impl ResidualStack {
    fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        config: StageConfig,
    ) -> Result<Self> {
        if config.num_layers == 0 {
            return Err(DiffusionError::config("num_layers", "a stage needs at least one residual block"));
        }
        let resnet_cfg = TimeResidualBlockConfig {
            time_injection: config.time_injection,
            num_groups: None,
        };
        let vb_resnets = vb.pp("resnets");
        let resnets = (0..config.num_layers)
            .map(|i| {
                let in_channels = if i == 0 { in_channels } else { out_channels };
                TimeResidualBlock::new(vb_resnets.pp(i.to_string()), in_channels, out_channels, time_emb_dim, resnet_cfg)
            })
            .collect::<Result<Vec<_>>>()?;

        let attentions = if config.use_attention {
            let attn_cfg = AttentionBlockConfig {
                num_heads: config.num_heads,
                num_groups: None,
            };
            let vb_attn = vb.pp("attentions");
            let attentions = (0..config.num_layers)
                .map(|i| AttentionBlock::new(vb_attn.pp(i.to_string()), out_channels, attn_cfg))
                .collect::<Result<Vec<_>>>()?;
            Some(attentions)
        } else {
            None
        };

        Ok(Self { resnets, attentions })
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (i, resnet) in self.resnets.iter().enumerate() {
            xs = resnet.forward(&xs, temb)?;
            if let Some(attentions) = &self.attentions {
                xs = attentions[i].forward(&xs)?;
            }
        }
        Ok(xs)
    }
}

/// Bottleneck stage: constant channels and resolution.
#[derive(Debug)]
pub struct MidBlock {
    stack: ResidualStack,
}

impl MidBlock {
    pub fn new(vb: VarBuilder, channels: usize, time_emb_dim: usize, config: StageConfig) -> Result<Self> {
        let stack = ResidualStack::new(vb, channels, channels, time_emb_dim, config)?;
        Ok(Self { stack })
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<Tensor> {
        self.stack.forward(xs, temb)
    }
}

/// Encoder stage: residual stack then a stride-2 convolution.
#[derive(Debug)]
pub struct DownBlock {
    stack: ResidualStack,
    downsampler: Conv2d,
    out_channels: usize,
}

impl DownBlock {
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        config: StageConfig,
    ) -> Result<Self> {
        let stack = ResidualStack::new(vb.clone(), in_channels, out_channels, time_emb_dim, config)?;
        let downsampler = downsample_conv(out_channels, vb.pp("downsampler"))?;
        Ok(Self {
            stack,
            downsampler,
            out_channels,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Returns `(downsampled, skip)` where `skip` is the full-resolution
    /// output of the residual stack.
    pub fn forward(&self, xs: &Tensor, temb: &Tensor) -> Result<(Tensor, Tensor)> {
        let skip = self.stack.forward(xs, temb)?;
        let xs = self.downsampler.forward(&skip)?;
        debug!("down block: {:?} -> {:?}", skip.dims(), xs.dims());
        Ok((xs, skip))
    }
}

/// Decoder stage: transposed-conv upsample, optional skip concatenation, residual stack.
#[derive(Debug)]
pub struct UpBlock {
    upsampler: ConvTranspose2d,
    stack: ResidualStack,
    in_channels: usize,
    out_channels: usize,
    skip_channels: usize,
}

impl UpBlock {
    /// `skip_channels` is the width of the skip tensor concatenated after
    /// upsampling (zero for a block that takes no skip); the first residual
    /// block absorbs `out_channels + skip_channels`.
    pub fn new(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        skip_channels: usize,
        time_emb_dim: usize,
        config: StageConfig,
    ) -> Result<Self> {
        let upsampler = upsample_conv(in_channels, out_channels, vb.pp("upsampler"))?;
        let stack = ResidualStack::new(vb, out_channels + skip_channels, out_channels, time_emb_dim, config)?;
        Ok(Self {
            upsampler,
            stack,
            in_channels,
            out_channels,
            skip_channels,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn skip_channels(&self) -> usize {
        self.skip_channels
    }

    pub fn forward(&self, xs: &Tensor, temb: &Tensor, skip: Option<&Tensor>) -> Result<Tensor> {
        let (_, channels, _, _) = dims4(xs, "up block input")?;
        if channels != self.in_channels {
            return Err(DiffusionError::shape(
                "up block input",
                format!("{} channels", self.in_channels),
                xs.dims(),
            ));
        }
        let xs = self.upsampler.forward(xs)?;
        let xs = match skip {
            Some(skip) => {
                let (b, _, h, w) = dims4(&xs, "up block input")?;
                let (sb, sc, sh, sw) = dims4(skip, "up block skip")?;
                if (sb, sc, sh, sw) != (b, self.skip_channels, h, w) {
                    return Err(DiffusionError::shape(
                        "up block skip",
                        format!("({b}, {}, {h}, {w})", self.skip_channels),
                        skip.dims(),
                    ));
                }
                Tensor::cat(&[&xs, skip], 1)?
            }
            None if self.skip_channels > 0 => {
                return Err(DiffusionError::shape(
                    "up block skip",
                    format!("a skip tensor with {} channels", self.skip_channels),
                    &[],
                ))
            }
            None => xs,
        };
        self.stack.forward(&xs, temb)
    }
}

/// LIFO store of encoder skip tensors, drained by the decoder in reverse order.
#[derive(Debug, Default)]
pub struct SkipConnections {
    skips: Vec<Tensor>,
}

impl SkipConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, skip: Tensor) {
        self.skips.push(skip);
    }

    /// Most recently pushed skip; an error if the decoder asks for more skips than were produced.
    pub fn pop(&mut self) -> Result<Tensor> {
        self.skips
            .pop()
            .ok_or_else(|| DiffusionError::shape("skip connections", "a pending skip tensor", &[]))
    }

    pub fn len(&self) -> usize {
        self.skips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skips.is_empty()
    }
}
