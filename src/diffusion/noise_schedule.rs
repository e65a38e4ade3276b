//! DDPM noise schedule
//! Precomputes the per-timestep mixing coefficients used by the forward and reverse processes

use candle_core::Tensor;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{DiffusionError, Result};

/// Upper bound applied to every beta so that `alpha_cumprod` never reaches zero.
const MAX_BETA: f64 = 0.999;

/// Offset used by the squared-cosine schedule.
const COSINE_S: f64 = 0.008;

/// Beta schedule type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Linear betas from `1e-4 * 1000/T` to `0.02 * 1000/T`.
    #[default]
    #[serde(rename = "linear")]
    Linear,
    /// Linear in `sqrt(beta)` between the same endpoints.
    #[serde(rename = "scaled_linear")]
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

/// Per-timestep noise-mixing coefficients, all of length `num_timesteps`.
///
/// Built once and read-only afterwards, so a schedule can be shared freely
/// between concurrent forward and sampling calls.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    num_timesteps: usize,
    beta_schedule: BetaSchedule,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Linear schedule scaled so the effective noise level does not depend on `num_timesteps`.
    pub fn new(num_timesteps: usize) -> Result<Self> {
        Self::with_schedule(num_timesteps, BetaSchedule::Linear)
    }

    pub fn with_schedule(num_timesteps: usize, beta_schedule: BetaSchedule) -> Result<Self> {
        if num_timesteps < 2 {
            return Err(DiffusionError::config(
                "num_timesteps",
                format!("a schedule needs at least 2 timesteps, got {num_timesteps}"),
            ));
        }

        let scale = 1000.0 / num_timesteps as f64;
        let beta_start = 0.0001 * scale;
        let beta_end = 0.02 * scale;

        let raw_betas = match beta_schedule {
            BetaSchedule::Linear => Self::linear_beta_schedule(num_timesteps, beta_start, beta_end),
            BetaSchedule::ScaledLinear => {
                Self::scaled_linear_beta_schedule(num_timesteps, beta_start, beta_end)
            }
            BetaSchedule::SquaredCosCapV2 => Self::cosine_beta_schedule(num_timesteps),
        };

        let clipped = raw_betas.iter().filter(|&&b| b > MAX_BETA).count();
        if clipped > 0 {
            warn!(
                "{} of {} betas exceed {} for T={} and were clipped",
                clipped, num_timesteps, MAX_BETA, num_timesteps
            );
        }
        let betas: Vec<f64> = raw_betas.into_iter().map(|b| b.min(MAX_BETA)).collect();

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alphas_cumprod: Vec<f64> = alphas
            .iter()
            .scan(1.0f64, |acc, &alpha| {
                *acc *= alpha;
                Some(*acc)
            })
            .collect();

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Ok(Self {
            num_timesteps,
            beta_schedule,
            betas,
            alphas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        })
    }

    fn linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
        let last = (num_timesteps - 1) as f64;
        (0..num_timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * i as f64 / last)
            .collect()
    }

    fn scaled_linear_beta_schedule(num_timesteps: usize, beta_start: f64, beta_end: f64) -> Vec<f64> {
        Self::linear_beta_schedule(num_timesteps, beta_start.sqrt(), beta_end.sqrt())
            .into_iter()
            .map(|b| b * b)
            .collect()
    }

    fn cosine_beta_schedule(num_timesteps: usize) -> Vec<f64> {
        let alpha_bar = |i: usize| {
            let t = i as f64 / num_timesteps as f64;
            ((t + COSINE_S) / (1.0 + COSINE_S) * std::f64::consts::FRAC_PI_2)
                .cos()
                .powi(2)
        };
        (1..=num_timesteps)
            .map(|i| 1.0 - alpha_bar(i) / alpha_bar(i - 1))
            .collect()
    }

    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn beta_schedule(&self) -> BetaSchedule {
        self.beta_schedule
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas(&self) -> &[f64] {
        &self.alphas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }

    /// Signal-to-noise ratio `alpha_cumprod / (1 - alpha_cumprod)` for each timestep.
    pub fn snr(&self, timesteps: &[usize]) -> Result<Vec<f64>> {
        timesteps
            .iter()
            .map(|&t| {
                self.check_timestep(t)?;
                let a = self.alphas_cumprod[t];
                Ok(a / (1.0 - a))
            })
            .collect()
    }

    fn check_timestep(&self, t: usize) -> Result<()> {
        if t >= self.num_timesteps {
            return Err(DiffusionError::shape(
                "timestep index",
                format!("an index below {}", self.num_timesteps),
                &[t],
            ));
        }
        Ok(())
    }

    /// Gather `values[t]` for every batch element into a `(B, 1, 1, 1)` tensor
    /// with the dtype and device of `like`, ready to broadcast over `(B, C, H, W)`.
    pub(crate) fn gather(values: &[f64], timesteps: &[usize], like: &Tensor) -> Result<Tensor> {
        let picked: Vec<f64> = timesteps.iter().map(|&t| values[t]).collect();
        let batch_size = picked.len();
        let coeffs = Tensor::from_vec(picked, (batch_size, 1, 1, 1), like.device())?;
        Ok(coeffs.to_dtype(like.dtype())?)
    }

    /// Closed-form forward diffusion:
    /// `x_t = sqrt(alpha_cumprod[t]) * original + sqrt(1 - alpha_cumprod[t]) * noise`
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timesteps: &[usize]) -> Result<Tensor> {
        let (batch_size, _, _, _) = original
            .dims4()
            .map_err(|_| DiffusionError::shape("add_noise input", "a 4D (B, C, H, W) tensor", original.dims()))?;
        if noise.dims() != original.dims() {
            return Err(DiffusionError::shape(
                "add_noise noise",
                format!("{:?}", original.dims()),
                noise.dims(),
            ));
        }
        if timesteps.len() != batch_size {
            return Err(DiffusionError::shape(
                "add_noise timesteps",
                format!("one timestep per batch element ({batch_size})"),
                &[timesteps.len()],
            ));
        }
        for &t in timesteps {
            self.check_timestep(t)?;
        }

        let sqrt_alpha_prod = Self::gather(&self.sqrt_alphas_cumprod, timesteps, original)?;
        let sqrt_one_minus_alpha_prod =
            Self::gather(&self.sqrt_one_minus_alphas_cumprod, timesteps, original)?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    const SCHEDULES: [BetaSchedule; 3] = [
        BetaSchedule::Linear,
        BetaSchedule::ScaledLinear,
        BetaSchedule::SquaredCosCapV2,
    ];

    #[test]
    fn test_alphas_cumprod_strictly_decreasing() -> Result<()> {
        for schedule in SCHEDULES {
            for t in [2, 3, 10, 20, 50, 250, 1000] {
                let sched = NoiseSchedule::with_schedule(t, schedule)?;
                let ac = sched.alphas_cumprod();
                assert_eq!(ac.len(), t);
                assert!(ac.iter().all(|&a| a > 0.0 && a <= 1.0), "{schedule:?} T={t}: {ac:?}");
                assert!(
                    ac.windows(2).all(|w| w[1] < w[0]),
                    "{schedule:?} T={t} not strictly decreasing"
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_linear_schedule_values() -> Result<()> {
        let sched = NoiseSchedule::new(1000)?;
        let betas = sched.betas();
        assert!((betas[0] - 1e-4).abs() < 1e-12);
        assert!((betas[999] - 0.02).abs() < 1e-12);
        assert!(betas[0] < betas[999]);
        assert!((sched.alphas_cumprod()[0] - (1.0 - betas[0])).abs() < 1e-12);
        assert!(sched.alphas_cumprod()[999] < 1e-3);

        // Fewer steps, proportionally larger betas.
        let short = NoiseSchedule::new(100)?;
        assert!((short.betas()[0] - 1e-3).abs() < 1e-12);
        assert!((short.betas()[99] - 0.2).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_cached_square_roots() -> Result<()> {
        let sched = NoiseSchedule::new(50)?;
        for t in 0..50 {
            let a = sched.alphas_cumprod()[t];
            assert!((sched.sqrt_alphas_cumprod()[t].powi(2) - a).abs() < 1e-12);
            assert!((sched.sqrt_one_minus_alphas_cumprod()[t].powi(2) - (1.0 - a)).abs() < 1e-12);
            assert!((sched.alphas()[t] + sched.betas()[t] - 1.0).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn test_rejects_single_step() {
        let err = NoiseSchedule::new(1).unwrap_err();
        assert!(err.is_config());
        assert!(NoiseSchedule::new(0).unwrap_err().is_config());
    }

    #[test]
    fn test_add_noise_closed_form() -> Result<()> {
        let device = Device::Cpu;
        let sched = NoiseSchedule::new(1000)?;
        let clean = Tensor::arange(0f32, 32., &device)?.reshape((2, 1, 4, 4))?;
        let noise = Tensor::ones((2, 1, 4, 4), candle_core::DType::F32, &device)?;
        let timesteps = [3usize, 900];

        let x_t = sched.add_noise(&clean, &noise, &timesteps)?;
        assert_eq!(x_t.dims(), &[2, 1, 4, 4]);

        let got = x_t.flatten_all()?.to_vec1::<f32>()?;
        let clean_v = clean.flatten_all()?.to_vec1::<f32>()?;
        for (i, (&g, &c)) in got.iter().zip(clean_v.iter()).enumerate() {
            let t = timesteps[i / 16];
            let expected = sched.sqrt_alphas_cumprod()[t] * c as f64
                + sched.sqrt_one_minus_alphas_cumprod()[t];
            assert!((g as f64 - expected).abs() < 1e-4, "element {i}: {g} vs {expected}");
        }
        Ok(())
    }

    #[test]
    fn test_add_noise_validates_inputs() -> Result<()> {
        let device = Device::Cpu;
        let sched = NoiseSchedule::new(10)?;
        let clean = Tensor::zeros((2, 1, 4, 4), candle_core::DType::F32, &device)?;
        let noise = Tensor::zeros((2, 1, 4, 4), candle_core::DType::F32, &device)?;

        assert!(sched.add_noise(&clean, &noise, &[0]).unwrap_err().is_shape());
        assert!(sched.add_noise(&clean, &noise, &[0, 10]).unwrap_err().is_shape());

        let flat = Tensor::zeros((2, 16), candle_core::DType::F32, &device)?;
        assert!(sched.add_noise(&flat, &flat, &[0, 1]).unwrap_err().is_shape());
        Ok(())
    }

    #[test]
    fn test_snr_decreases() -> Result<()> {
        let sched = NoiseSchedule::new(1000)?;
        let snr = sched.snr(&[0, 500, 999])?;
        assert!(snr[0] > snr[1] && snr[1] > snr[2]);
        assert!(sched.snr(&[1000]).is_err());
        Ok(())
    }
}
