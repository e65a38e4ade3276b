//! Contract between the diffusion process and whatever network predicts the noise

use candle_core::Tensor;
use std::sync::Arc;

use crate::error::Result;

/// Noise-prediction network used by [`DiffusionProcess`](crate::DiffusionProcess).
pub trait DenoisingNetwork: Send + Sync {
    /// `x_t`: `(B, C, H, W)` noisy latent, `timesteps`: `(B,)` float timesteps.
    /// Returns the predicted noise, same shape as `x_t`.
    fn predict_noise(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor>;
}

impl<T: DenoisingNetwork + ?Sized> DenoisingNetwork for &T {
    fn predict_noise(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        (**self).predict_noise(x_t, timesteps)
    }
}

impl<T: DenoisingNetwork + ?Sized> DenoisingNetwork for Box<T> {
    fn predict_noise(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        (**self).predict_noise(x_t, timesteps)
    }
}

impl<T: DenoisingNetwork + ?Sized> DenoisingNetwork for Arc<T> {
    fn predict_noise(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        (**self).predict_noise(x_t, timesteps)
    }
}
