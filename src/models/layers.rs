//! Layer constructors shared by the time-conditioned blocks

use candle_core::Tensor;
pub use candle_nn::{Conv2d, ConvTranspose2d, GroupNorm, VarBuilder};
use candle_nn::{Conv2dConfig, ConvTranspose2dConfig};

use crate::error::{DiffusionError, Result};

pub const GROUP_NORM_EPS: f64 = 1e-5;

/// Default group count for a normalization over `channels`: `min(32, channels / 4)`.
pub fn default_num_groups(channels: usize) -> usize {
    (channels / 4).min(32)
}

/// Resolve the group count (explicit override or the default rule) and check it
/// actually partitions `channels`.
pub fn resolve_num_groups(channels: usize, requested: Option<usize>) -> Result<usize> {
    let groups = requested.unwrap_or_else(|| default_num_groups(channels));
    if groups < 1 {
        return Err(DiffusionError::config(
            "num_groups",
            format!("{channels} channels yield {groups} normalization groups (min(32, channels / 4))"),
        ));
    }
    if channels % groups != 0 {
        return Err(DiffusionError::config(
            "num_groups",
            format!("{channels} channels are not divisible into {groups} groups"),
        ));
    }
    Ok(groups)
}

pub fn group_norm(num_groups: usize, channels: usize, vb: VarBuilder) -> Result<GroupNorm> {
    Ok(candle_nn::group_norm(num_groups, channels, GROUP_NORM_EPS, vb)?)
}

/// 3x3 convolution keeping the spatial size.
pub fn conv3x3(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(candle_nn::conv2d(in_channels, out_channels, 3, config, vb)?)
}

/// 1x1 channel projection.
pub fn conv1x1(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    Ok(candle_nn::conv2d(in_channels, out_channels, 1, Default::default(), vb)?)
}

/// Stride-2 3x3 convolution halving the spatial size.
pub fn downsample_conv(channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        padding: 1,
        stride: 2,
        ..Default::default()
    };
    Ok(candle_nn::conv2d(channels, channels, 3, config, vb)?)
}

/// Stride-2 3x3 transposed convolution doubling the spatial size.
pub fn upsample_conv(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<ConvTranspose2d> {
    let config = ConvTranspose2dConfig {
        padding: 1,
        output_padding: 1,
        stride: 2,
        dilation: 1,
    };
    Ok(candle_nn::conv_transpose2d(in_channels, out_channels, 3, config, vb)?)
}

/// Dimensions of a `(B, C, H, W)` tensor, or a shape error naming `context`.
pub fn dims4(xs: &Tensor, context: &'static str) -> Result<(usize, usize, usize, usize)> {
    xs.dims4()
        .map_err(|_| DiffusionError::shape(context, "a 4D (B, C, H, W) tensor", xs.dims()))
}
