//! Random draws for the diffusion process.
//! Every draw takes the caller's RNG so runs can be seeded without global state.

use candle_core::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::Result;

/// Standard-normal tensor of the given shape.
pub fn standard_normal<R, S>(shape: S, dtype: DType, device: &Device, rng: &mut R) -> Result<Tensor>
where
    R: Rng + ?Sized,
    S: Into<Shape>,
{
    let shape: Shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    let tensor = Tensor::from_vec(values, shape, device)?;
    Ok(tensor.to_dtype(dtype)?)
}

/// Standard-normal tensor with the shape, dtype and device of `like`.
pub fn standard_normal_like<R: Rng + ?Sized>(like: &Tensor, rng: &mut R) -> Result<Tensor> {
    standard_normal(like.shape().clone(), like.dtype(), like.device(), rng)
}

/// One timestep per batch element, uniform over `[0, num_timesteps)`.
pub fn sample_timesteps<R: Rng + ?Sized>(batch_size: usize, num_timesteps: usize, rng: &mut R) -> Vec<usize> {
    (0..batch_size).map(|_| rng.gen_range(0..num_timesteps)).collect()
}
