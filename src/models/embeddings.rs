//! Timestep embeddings: sinusoidal features followed by a SiLU MLP

use candle_core::{DType, Module, Tensor, D};
use candle_nn as nn;

use super::layers::VarBuilder;
use crate::error::{DiffusionError, Result};

/// Maps a `(B,)` float timestep tensor to `(B, dim)` sin/cos features.
#[derive(Debug, Clone, Copy)]
pub struct SinusoidalTimesteps {
    dim: usize,
    max_period: f64,
}

impl SinusoidalTimesteps {
    pub fn new(dim: usize) -> Result<Self> {
        if dim < 2 || dim % 2 != 0 {
            return Err(DiffusionError::config(
                "time_emb_dim",
                format!("sinusoidal features need an even width >= 2, got {dim}"),
            ));
        }
        Ok(Self {
            dim,
            max_period: 10_000.,
        })
    }

    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let half_dim = self.dim / 2;
        let device = timesteps.device();
        let exponent = (Tensor::arange(0u32, half_dim as u32, device)?.to_dtype(DType::F32)?
            * (-self.max_period.ln() / half_dim as f64))?;
        let freqs = exponent.exp()?;
        let args = timesteps
            .to_dtype(DType::F32)?
            .unsqueeze(D::Minus1)?
            .broadcast_mul(&freqs.unsqueeze(0)?)?;
        Ok(Tensor::cat(&[&args.sin()?, &args.cos()?], D::Minus1)?)
    }
}

/// Sinusoidal features projected by `linear -> silu -> linear`.
#[derive(Debug)]
pub struct TimestepEmbedding {
    features: SinusoidalTimesteps,
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl TimestepEmbedding {
    pub fn new(vb: VarBuilder, time_emb_dim: usize) -> Result<Self> {
        let features = SinusoidalTimesteps::new(time_emb_dim)?;
        let linear_1 = nn::linear(time_emb_dim, time_emb_dim, vb.pp("linear_1"))?;
        let linear_2 = nn::linear(time_emb_dim, time_emb_dim, vb.pp("linear_2"))?;
        Ok(Self {
            features,
            linear_1,
            linear_2,
        })
    }

    pub fn forward(&self, timesteps: &Tensor) -> Result<Tensor> {
        let xs = self.features.forward(timesteps)?;
        let xs = nn::ops::silu(&self.linear_1.forward(&xs)?)?;
        Ok(self.linear_2.forward(&xs)?)
    }
}
