//! Reverse-process timestep pairing and the two update rules (ancestral DDPM and DDIM)

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

/// Where the last reverse transition lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStep {
    /// Land on the smallest scheduled timestep and use its `alpha_cumprod`.
    #[default]
    Keep,
    /// Treat the last target as clean data (`alpha_cumprod = 1`): the final
    /// transition returns the `x_0` estimate and draws no noise, for DDIM and
    /// ancestral sampling alike.
    Clean,
}

/// One reverse update from `time` to `time_next`; `None` means the clean sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub time: usize,
    pub time_next: Option<usize>,
}

/// Decreasing timesteps visited by the sampler: `max(ceil(T / step_interval), 2)`
/// evenly spaced integers over `[0, T - 1]`, largest first.
pub fn sampling_timesteps(num_timesteps: usize, step_interval: usize) -> Result<Vec<usize>> {
    if num_timesteps < 2 {
        return Err(DiffusionError::config(
            "num_timesteps",
            format!("sampling needs at least 2 timesteps, got {num_timesteps}"),
        ));
    }
    if step_interval == 0 || step_interval > num_timesteps {
        return Err(DiffusionError::config(
            "step_interval",
            format!("must be in [1, {num_timesteps}], got {step_interval}"),
        ));
    }

    let count = num_timesteps.div_ceil(step_interval).max(2);
    let last = num_timesteps - 1;
    Ok((0..count).rev().map(|i| i * last / (count - 1)).collect())
}

/// Consecutive `(time, time_next)` pairs of [`sampling_timesteps`].
pub fn timestep_pairs(num_timesteps: usize, step_interval: usize, final_step: FinalStep) -> Result<Vec<Transition>> {
    let times = sampling_timesteps(num_timesteps, step_interval)?;
    let mut pairs: Vec<Transition> = times
        .windows(2)
        .map(|w| Transition {
            time: w[0],
            time_next: Some(w[1]),
        })
        .collect();
    if final_step == FinalStep::Clean {
        if let Some(last) = pairs.last_mut() {
            last.time_next = None;
        }
    }
    Ok(pairs)
}

/// Coefficients of one ancestral (DDPM) step.
#[derive(Debug, Clone, Copy)]
pub struct AncestralCoefficients {
    pub alpha_t: f64,
    pub alpha_cumprod_t: f64,
    pub alpha_cumprod_next: f64,
}

impl AncestralCoefficients {
    /// Posterior standard deviation `sqrt((1 - a_t) * (1 - ac_next) / (1 - ac_t))`.
    pub fn sigma(&self) -> f64 {
        ((1.0 - self.alpha_t) * (1.0 - self.alpha_cumprod_next) / (1.0 - self.alpha_cumprod_t)).sqrt()
    }
}

/// `mu = (x_t - (1 - a_t) / sqrt(1 - ac_t) * eps) / sqrt(a_t)`, then `mu + sigma * noise`.
/// `noise` may be `None` when sigma is zero.
pub fn ancestral_step(
    x_t: &Tensor,
    predicted_noise: &Tensor,
    coeffs: AncestralCoefficients,
    noise: Option<&Tensor>,
) -> Result<Tensor> {
    let eps_coeff = (1.0 - coeffs.alpha_t) / (1.0 - coeffs.alpha_cumprod_t).sqrt();
    let mu = x_t
        .sub(&predicted_noise.affine(eps_coeff, 0.0)?)?
        .affine(1.0 / coeffs.alpha_t.sqrt(), 0.0)?;
    match noise {
        Some(noise) => Ok(mu.add(&noise.affine(coeffs.sigma(), 0.0)?)?),
        None => Ok(mu),
    }
}

/// Deterministic DDIM jump: recover `x_0` from the noise estimate, then re-noise it to `ac_next`.
pub fn ddim_step(
    x_t: &Tensor,
    predicted_noise: &Tensor,
    alpha_cumprod_t: f64,
    alpha_cumprod_next: f64,
) -> Result<Tensor> {
    let pred_x0 = x_t
        .sub(&predicted_noise.affine((1.0 - alpha_cumprod_t).sqrt(), 0.0)?)?
        .affine(1.0 / alpha_cumprod_t.sqrt(), 0.0)?;
    let x_next = pred_x0
        .affine(alpha_cumprod_next.sqrt(), 0.0)?
        .add(&predicted_noise.affine((1.0 - alpha_cumprod_next).sqrt(), 0.0)?)?;
    Ok(x_next)
}
