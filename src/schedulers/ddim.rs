use ndarray::{s, Array1, Array4, ArrayView4};
use rand::Rng;

use super::{alphas_cumprod, betas_for_schedule, validate_betas, BetaSchedule, DiffusionScheduler, SchedulerStepOutput};
use crate::SchedulerOptimizedDefaults;

// Stable Diffusion v1 exports are trained with a one-step offset and without resetting the final alpha.
const STEPS_OFFSET: usize = 1;

/// [Denoising diffusion implicit models][ddim] is a scheduler that extends the denoising procedure introduced in
/// denoising diffusion probabilistic models (DDPMs) with non-Markovian guidance.
///
/// This implementation is deterministic (eta = 0) and predicts epsilon, matching the configuration Stable Diffusion v1
/// ships with.
///
/// [ddim]: https://arxiv.org/abs/2010.02502
#[derive(Clone)]
pub struct DdimScheduler {
	alphas_cumprod: Array1<f32>,
	final_alpha_cumprod: f32,
	timesteps: Array1<f32>,
	num_train_timesteps: usize,
	num_inference_steps: Option<usize>
}

impl Default for DdimScheduler {
	fn default() -> Self {
		Self::new(1000, 0.0001, 0.02, &BetaSchedule::Linear).unwrap()
	}
}

impl DdimScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Can error if:
	/// - `num_train_timesteps` is 0
	/// - `beta_start` or `beta_end` are not normal numbers (not zero, infinite, `NaN`, or subnormal)
	/// - `beta_end` is less than or equal to `beta_start`
	pub fn new(num_train_timesteps: usize, beta_start: f32, beta_end: f32, beta_schedule: &BetaSchedule) -> anyhow::Result<Self> {
		validate_betas(num_train_timesteps, beta_start, beta_end)?;

		let betas = betas_for_schedule(beta_schedule, beta_start, beta_end, num_train_timesteps);
		let alphas_cumprod = alphas_cumprod(&betas);
		let final_alpha_cumprod = alphas_cumprod[0];

		let timesteps = Array1::linspace(0.0, num_train_timesteps as f32 - 1.0, num_train_timesteps)
			.slice(s![..;-1])
			.to_owned();

		Ok(Self {
			alphas_cumprod,
			final_alpha_cumprod,
			timesteps,
			num_inference_steps: None,
			num_train_timesteps
		})
	}

	fn step_ratio(&self) -> usize {
		self.num_train_timesteps / self.num_inference_steps.expect("set_timesteps must be called before stepping")
	}
}

impl DiffusionScheduler for DdimScheduler {
	/// DDIM does not scale model inputs; the sample is returned unchanged.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, _: f32) -> Array4<f32> {
		sample.to_owned()
	}

	fn set_timesteps(&mut self, num_inference_steps: usize) {
		self.num_inference_steps = Some(num_inference_steps);

		let step_ratio = self.num_train_timesteps / num_inference_steps;
		self.timesteps = Array1::range(0.0, num_inference_steps as f32, 1.0)
			.slice(s![..;-1])
			.map(|f| (f * step_ratio as f32).round() + STEPS_OFFSET as f32)
			.to_owned();
	}

	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, _rng: &mut R) -> SchedulerStepOutput {
		let timestep = timestep as usize;
		let prev_timestep = timestep as isize - self.step_ratio() as isize;

		let alpha_prod_t = self.alphas_cumprod[timestep];
		let alpha_prod_t_prev = if prev_timestep >= 0 {
			self.alphas_cumprod[prev_timestep as usize]
		} else {
			self.final_alpha_cumprod
		};
		let beta_prod_t = 1.0 - alpha_prod_t;

		// predicted x_0 of formula (12), for epsilon prediction
		let pred_original_sample = (sample.to_owned() - beta_prod_t.sqrt() * model_output.to_owned()) / alpha_prod_t.sqrt();

		// direction pointing to x_t of formula (12); with eta = 0 the variance term vanishes
		let pred_sample_direction = (1.0 - alpha_prod_t_prev).sqrt() * model_output.to_owned();

		let prev_sample = alpha_prod_t_prev.sqrt() * pred_original_sample.clone() + pred_sample_direction;

		SchedulerStepOutput {
			prev_sample,
			pred_original_sample: Some(pred_original_sample)
		}
	}

	fn timesteps(&self) -> ndarray::ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn init_noise_sigma(&self) -> f32 {
		1.0
	}
}

impl SchedulerOptimizedDefaults for DdimScheduler {
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(1000, 0.00085, 0.012, &BetaSchedule::ScaledLinear)
	}
}

#[cfg(test)]
mod tests {
	use ndarray::Array4;
	use rand::rngs::mock::StepRng;

	use super::{DdimScheduler, DiffusionScheduler};

	#[test]
	fn model_input_is_not_scaled() {
		let mut scheduler = DdimScheduler::default();
		let sample = Array4::<f32>::from_elem((1, 4, 8, 8), 0.75);
		assert_eq!(scheduler.scale_model_input(sample.view(), 999.0), sample);
	}

	#[test]
	fn set_timesteps_spaces_steps_across_the_training_schedule() {
		let mut scheduler = DdimScheduler::default();
		scheduler.set_timesteps(10);
		let timesteps = scheduler.timesteps();
		assert_eq!(timesteps.len(), 10);
		assert_eq!(timesteps[0], 901.0);
		assert_eq!(timesteps[9], 1.0);
	}

	#[test]
	fn stepping_with_zero_noise_prediction_rescales_the_sample() {
		let mut scheduler = DdimScheduler::default();
		scheduler.set_timesteps(10);
		let sample = Array4::<f32>::from_elem((1, 4, 8, 8), 1.0);
		let noise = Array4::<f32>::zeros((1, 4, 8, 8));
		let output = scheduler.step(noise.view(), 901.0, sample.view(), &mut StepRng::new(0, 1));
		// with zero predicted noise, x_0 = x_t / sqrt(alpha_t) and the step only rescales
		assert!(output.prev_sample().iter().all(|v| v.is_finite() && *v > 0.0));
	}

	#[test]
	fn initial_noise_is_unit_sigma() {
		assert_eq!(DdimScheduler::default().init_noise_sigma(), 1.0);
	}
}
