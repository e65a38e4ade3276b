//! Diffusion process: closed-form forward corruption for training and
//! ancestral/DDIM reverse sampling for inference, driving an external
//! noise-prediction network.

use candle_core::{DType, Device, Shape, Tensor};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::noise::{sample_timesteps, standard_normal, standard_normal_like};
use super::noise_schedule::NoiseSchedule;
use super::sampling::{ancestral_step, ddim_step, timestep_pairs, AncestralCoefficients, FinalStep};
use super::{DiffusionConfig, SamplingConfig};
use crate::error::{DiffusionError, Result};
use crate::models::network::DenoisingNetwork;

pub struct DiffusionProcess<N> {
    network: N,
    schedule: NoiseSchedule,
    final_step: FinalStep,
    device: Device,
}

impl<N: DenoisingNetwork> DiffusionProcess<N> {
    pub fn new(network: N, config: &DiffusionConfig, device: &Device) -> Result<Self> {
        let schedule = NoiseSchedule::with_schedule(config.num_timesteps, config.beta_schedule)?;
        Ok(Self::with_schedule(network, schedule, config.final_step, device))
    }

    pub fn with_schedule(network: N, schedule: NoiseSchedule, final_step: FinalStep, device: &Device) -> Self {
        Self {
            network,
            schedule,
            final_step,
            device: device.clone(),
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.num_timesteps()
    }

    pub fn final_step(&self) -> FinalStep {
        self.final_step
    }

    /// Run the network and check it kept the latent's shape.
    fn predict(&self, x_t: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let predicted = self.network.predict_noise(x_t, timesteps)?;
        if predicted.dims() != x_t.dims() {
            return Err(DiffusionError::shape(
                "network output",
                format!("{:?}", x_t.dims()),
                predicted.dims(),
            ));
        }
        Ok(predicted)
    }

    /// Training step: draw a timestep per batch element and standard-normal
    /// noise, corrupt `clean` and return `(predicted_noise, noise)`.
    pub fn forward<R: Rng + ?Sized>(&self, clean: &Tensor, rng: &mut R) -> Result<(Tensor, Tensor)> {
        let (batch_size, _, _, _) = clean
            .dims4()
            .map_err(|_| DiffusionError::shape("forward input", "a 4D (B, C, H, W) tensor", clean.dims()))?;
        let timesteps = sample_timesteps(batch_size, self.num_timesteps(), rng);
        let noise = standard_normal_like(clean, rng)?;
        self.forward_with(clean, &timesteps, &noise)
    }

    /// [`forward`](Self::forward) with caller-chosen timesteps and noise.
    pub fn forward_with(&self, clean: &Tensor, timesteps: &[usize], noise: &Tensor) -> Result<(Tensor, Tensor)> {
        let x_t = self.schedule.add_noise(clean, noise, timesteps)?;
        let t: Vec<f32> = timesteps.iter().map(|&t| t as f32).collect();
        let t = Tensor::from_vec(t, timesteps.len(), clean.device())?;
        debug!("forward: batch {:?}, timesteps {:?}", clean.dims(), timesteps);

        let prediction = self.predict(&x_t, &t)?;
        Ok((prediction, noise.clone()))
    }

    /// Generate a batch of `shape` starting from fresh standard-normal noise.
    pub fn sample<S, R>(&self, shape: S, step_interval: usize, rng: &mut R) -> Result<Tensor>
    where
        S: Into<Shape>,
        R: Rng + ?Sized,
    {
        let shape: Shape = shape.into();
        if shape.rank() != 4 {
            return Err(DiffusionError::shape(
                "sample output shape",
                "a 4D (B, C, H, W) shape",
                shape.dims(),
            ));
        }
        let x_t = standard_normal(shape, DType::F32, &self.device, rng)?;
        self.sample_from(&x_t, step_interval, rng)
    }

    /// Seeds the RNG from `config.seed` (or entropy) and samples with `config.step_interval`.
    pub fn sample_with<S: Into<Shape>>(&self, shape: S, config: &SamplingConfig) -> Result<Tensor> {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        self.sample(shape, config.step_interval, &mut rng)
    }

    /// Reverse process from the given initial noise. `step_interval == 1`
    /// runs the stochastic ancestral chain; any larger interval uses
    /// deterministic DDIM jumps and never touches `rng`.
    ///
    /// A transition to the clean sample (`time_next == None`) returns the
    /// `x_0` estimate in both modes. Network outputs are detached, so the
    /// result carries no autograd graph back to the network's variables.
    pub fn sample_from<R: Rng + ?Sized>(&self, x_init: &Tensor, step_interval: usize, rng: &mut R) -> Result<Tensor> {
        let (batch_size, _, _, _) = x_init
            .dims4()
            .map_err(|_| DiffusionError::shape("initial noise", "a 4D (B, C, H, W) tensor", x_init.dims()))?;
        let transitions = timestep_pairs(self.num_timesteps(), step_interval, self.final_step)?;
        let ancestral = step_interval == 1;
        info!(
            "Sampling {:?} with {} {} steps",
            x_init.dims(),
            transitions.len(),
            if ancestral { "ancestral" } else { "DDIM" }
        );

        let alphas = self.schedule.alphas();
        let alphas_cumprod = self.schedule.alphas_cumprod();
        let mut x_t = x_init.detach();

        for (step, transition) in transitions.iter().enumerate() {
            let t_batch = Tensor::full(transition.time as f32, batch_size, x_t.device())?;
            let predicted_noise = self.predict(&x_t, &t_batch)?.detach();

            let alpha_cumprod_t = alphas_cumprod[transition.time];
            let alpha_cumprod_next = transition.time_next.map_or(1.0, |t| alphas_cumprod[t]);
            debug!(
                "step {}/{}: t={} -> {:?}",
                step + 1,
                transitions.len(),
                transition.time,
                transition.time_next
            );

            x_t = if ancestral && transition.time_next.is_some() {
                let coeffs = AncestralCoefficients {
                    alpha_t: alphas[transition.time],
                    alpha_cumprod_t,
                    alpha_cumprod_next,
                };
                let noise = if coeffs.sigma() > 0.0 {
                    Some(standard_normal_like(&x_t, rng)?)
                } else {
                    None
                };
                ancestral_step(&x_t, &predicted_noise, coeffs, noise.as_ref())?
            } else {
                ddim_step(&x_t, &predicted_noise, alpha_cumprod_t, alpha_cumprod_next)?
            };
        }

        info!("Sampling complete");
        Ok(x_t)
    }
}
