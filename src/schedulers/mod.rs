//! The schedule functions, denoted Schedulers in the library take in the output of a trained model, a sample which the
//! diffusion process is iterating on, and a timestep to return a denoised sample.
//!
//! * Schedulers define the methodology for iteratively adding noise to an image or for updating a sample based on model
//! outputs.
//!   - for inference, the scheduler defines how to update a sample based on an output from a pretrained model.
//! * Schedulers are often defined by a noise schedule and an update rule to solve the differential equation
//! solution.

use ndarray::{Array1, Array4, ArrayBase, ArrayView1, ArrayView4};
use rand::Rng;

mod ddim;
mod euler_discrete;

pub use self::ddim::DdimScheduler;
pub use self::euler_discrete::EulerDiscreteScheduler;

/// A mapping from a beta range to a sequence of betas for stepping the model.
#[derive(Debug, Clone)]
pub enum BetaSchedule {
	/// Linear beta schedule.
	Linear,
	/// Scaled linear beta schedule.
	ScaledLinear,
	/// Pre-trained betas.
	TrainedBetas(Array1<f32>)
}

pub(crate) fn betas_for_schedule(schedule: &BetaSchedule, beta_start: f32, beta_end: f32, num_train_timesteps: usize) -> Array1<f32> {
	match schedule {
		BetaSchedule::TrainedBetas(betas) => betas.clone(),
		BetaSchedule::Linear => Array1::linspace(beta_start, beta_end, num_train_timesteps),
		BetaSchedule::ScaledLinear => {
			let mut betas = Array1::linspace(beta_start.sqrt(), beta_end.sqrt(), num_train_timesteps);
			betas.par_map_inplace(|f| *f = f.powi(2));
			betas
		}
	}
}

pub(crate) fn alphas_cumprod(betas: &Array1<f32>) -> Array1<f32> {
	betas
		.view()
		.into_iter()
		.scan(1.0, |prod, beta| {
			*prod *= 1.0 - *beta;
			Some(*prod)
		})
		.collect::<Array1<_>>()
}

pub(crate) fn validate_betas(num_train_timesteps: usize, beta_start: f32, beta_end: f32) -> anyhow::Result<()> {
	if num_train_timesteps == 0 {
		anyhow::bail!("num_train_timesteps ({num_train_timesteps}) must be >0");
	}
	if !beta_start.is_normal() || !beta_end.is_normal() {
		anyhow::bail!("beta_start ({beta_start}) and beta_end ({beta_end}) must be normal (not zero, infinite, NaN, or subnormal)");
	}
	if beta_start >= beta_end {
		anyhow::bail!("beta_start must be < beta_end");
	}
	Ok(())
}

/// The output returned by a scheduler's `step` function.
pub struct SchedulerStepOutput {
	pub(crate) prev_sample: Array4<f32>,
	pub(crate) pred_original_sample: Option<Array4<f32>>
}

impl SchedulerStepOutput {
	/// Computed sample (`x_{t-1}`) of the previous timestep. `prev_sample` should be used as the next model input in
	/// the denoising loop.
	pub fn prev_sample(&self) -> ArrayView4<'_, f32> {
		self.prev_sample.view()
	}

	/// The predicted denoised sample (`x_{0}`) based on the model output from the current timestep.
	/// `pred_original_sample` can be used to preview progress or for guidance.
	pub fn pred_original_sample(&self) -> Option<ArrayView4<'_, f32>> {
		self.pred_original_sample.as_ref().map(ArrayBase::view)
	}
}

/// A scheduler to be used in diffusion pipelines.
pub trait DiffusionScheduler: Clone + Send {
	/// Scales the denoising model input to match the scheduler's algorithm, if it requires scaling.
	fn scale_model_input(&mut self, sample: ArrayView4<'_, f32>, timestep: f32) -> Array4<f32>;

	/// Sets the number of inference steps. This should be called before `step` to properly compute the sigmas and
	/// timesteps.
	fn set_timesteps(&mut self, num_inference_steps: usize);

	/// Predict the sample at the previous timestep by reversing the SDE. Core function to propagate the diffusion
	/// process from the learned model outputs (most often the predicted noise).
	fn step<R: Rng + ?Sized>(&mut self, model_output: ArrayView4<'_, f32>, timestep: f32, sample: ArrayView4<'_, f32>, rng: &mut R) -> SchedulerStepOutput;

	/// Returns the computed scheduler timesteps.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f32;
}

/// Schedulers with a preset configuration optimized for certain models.
pub trait SchedulerOptimizedDefaults: DiffusionScheduler {
	/// Configuration optimized for Stable Diffusion v1 models.
	fn stable_diffusion_v1_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized;
}
