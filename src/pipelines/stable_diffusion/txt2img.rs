use image::DynamicImage;
use ndarray::{concatenate, s, Array1, Array4, ArrayD, Axis, IxDyn};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use num_traits::ToPrimitive;
use ort::tensor::{FromArray, InputTensor, OrtOwnedTensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{DiffusionScheduler, Prompt, StableDiffusionPipeline};

/// Options for text-to-image generation. All parameters other than the prompt have defaults matching the original
/// pretrained pipeline: 100 steps at 512x512 with a guidance scale of 7.5.
pub struct Txt2ImgOptions {
	pub(crate) height: u32,
	pub(crate) width: u32,
	pub(crate) guidance_scale: f32,
	pub(crate) steps: usize,
	pub(crate) seed: Option<u64>,
	pub(crate) positive_prompt: Prompt,
	pub(crate) negative_prompt: Option<Prompt>,
	pub(crate) progress: Option<Box<dyn Fn(usize, f32) -> bool>>
}

impl Default for Txt2ImgOptions {
	fn default() -> Self {
		Self {
			height: 512,
			width: 512,
			guidance_scale: 7.5,
			steps: 100,
			seed: None,
			positive_prompt: Prompt::default(),
			negative_prompt: None,
			progress: None
		}
	}
}

impl Txt2ImgOptions {
	/// Set the size of the image. **Size will be rounded to a multiple of 8.**
	pub fn with_size(self, width: u32, height: u32) -> Self {
		self.with_width(width).with_height(height)
	}

	/// Set the width of the image. **Width will be rounded to a multiple of 8.**
	#[inline]
	pub fn with_width(mut self, width: u32) -> Self {
		self.width = (width / 8).max(1) * 8;
		self
	}

	/// Set the height of the image. **Height will be rounded to a multiple of 8.**
	#[inline]
	pub fn with_height(mut self, height: u32) -> Self {
		self.height = (height / 8).max(1) * 8;
		self
	}

	/// The number of steps to take to generate the image. More steps typically yields higher quality images.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}

	/// Set the prompt(s) to use when generating the image.
	pub fn with_prompts<P>(mut self, positive_prompt: P, negative_prompt: Option<P>) -> Self
	where
		P: Into<Prompt>
	{
		self.positive_prompt = positive_prompt.into();
		self.negative_prompt = negative_prompt.map(|p| p.into());
		self
	}

	/// Set the seed to use when first generating noise. Generation is only deterministic when a seed is set; without
	/// one, each run draws a fresh seed from thread RNG.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}

	/// The 'guidance scale' for classifier-free guidance. A lower guidance scale gives the model more freedom, but the
	/// output may not match the prompt. A higher guidance scale means the model will match the prompt(s) more
	/// strictly, but may introduce artifacts; `7.5` is a good balance.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}

	/// Register a callback invoked on each denoising step with the step number and this step's timestep. Returning
	/// `false` stops generation early.
	pub fn callback_progress<F>(mut self, callback: F) -> Self
	where
		F: Fn(usize, f32) -> bool + 'static
	{
		self.progress = Some(Box::new(callback));
		self
	}

	/// Generates images from the configured prompt(s). Returns a vector of [`image::DynamicImage`]s using float32
	/// buffers; in most cases you'll want to convert them into RGB8 via `img.into_rgb8()`.
	///
	/// `scheduler` must be a Stable Diffusion-compatible scheduler.
	pub fn run<S: DiffusionScheduler>(&self, pipeline: &StableDiffusionPipeline, scheduler: &mut S) -> anyhow::Result<Vec<DynamicImage>> {
		if self.steps == 0 {
			anyhow::bail!("`steps` must be greater than 0");
		}
		if self.height % 8 != 0 || self.width % 8 != 0 {
			anyhow::bail!("`width` ({}) and `height` ({}) must be divisible by 8 for Stable Diffusion", self.width, self.height);
		}
		if self.positive_prompt.is_empty() {
			anyhow::bail!("no prompt was provided");
		}

		let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen::<u64>());
		let mut rng = StdRng::seed_from_u64(seed);

		let batch_size = self.positive_prompt.len();
		let do_classifier_free_guidance = self.guidance_scale > 1.0;
		let text_embeddings = pipeline.encode_prompt(&self.positive_prompt, do_classifier_free_guidance, self.negative_prompt.as_ref())?;

		let latents_shape = (batch_size, 4_usize, (self.height / 8) as usize, (self.width / 8) as usize);
		let mut latents = Array4::<f32>::random_using(latents_shape, StandardNormal, &mut rng);

		scheduler.set_timesteps(self.steps);
		latents *= scheduler.init_noise_sigma();

		let timesteps = scheduler.timesteps().to_owned();
		for (i, t) in timesteps.indexed_iter() {
			let latent_model_input = if do_classifier_free_guidance {
				concatenate![Axis(0), latents, latents]
			} else {
				latents.clone()
			};
			let latent_model_input = scheduler.scale_model_input(latent_model_input.view(), *t);
			let latent_model_input: ArrayD<f32> = latent_model_input.into_dyn();
			let timestep: ArrayD<f32> = Array1::from_iter([t.to_f32().unwrap()]).into_dyn();
			let encoder_hidden_states: ArrayD<f32> = text_embeddings.clone();

			let noise_pred = pipeline.unet.run(vec![
				InputTensor::from_array(latent_model_input),
				InputTensor::from_array(timestep),
				InputTensor::from_array(encoder_hidden_states),
			])?;
			let noise_pred: OrtOwnedTensor<'_, f32, IxDyn> = noise_pred[0].try_extract()?;
			let noise_pred: Array4<f32> = noise_pred.view().to_owned().into_dimensionality()?;

			let noise_pred = if do_classifier_free_guidance {
				let split_len = (noise_pred.shape()[0] / 2) as isize;
				let noise_pred_uncond = noise_pred.slice(s![..split_len, .., .., ..]);
				let noise_pred_text = noise_pred.slice(s![split_len.., .., .., ..]);
				&noise_pred_uncond + self.guidance_scale * (&noise_pred_text - &noise_pred_uncond)
			} else {
				noise_pred
			};

			let scheduler_output = scheduler.step(noise_pred.view(), *t, latents.view(), &mut rng);
			latents = scheduler_output.prev_sample().to_owned();

			if let Some(progress) = self.progress.as_ref() {
				if !progress(i, t.to_f32().unwrap()) {
					break;
				}
			}
		}

		pipeline.decode_latents(latents.view())
	}
}

#[cfg(test)]
mod tests {
	use super::Txt2ImgOptions;

	#[test]
	fn defaults_match_the_pretrained_pipeline() {
		let options = Txt2ImgOptions::default();
		assert_eq!(options.steps, 100);
		assert_eq!((options.width, options.height), (512, 512));
		assert!((options.guidance_scale - 7.5).abs() < f32::EPSILON);
		assert!(options.seed.is_none());
	}

	#[test]
	fn sizes_are_rounded_to_a_multiple_of_8() {
		let options = Txt2ImgOptions::default().with_size(513, 511);
		assert_eq!((options.width, options.height), (512, 504));
	}

	#[test]
	fn tiny_sizes_round_up_to_the_latent_granule() {
		let options = Txt2ImgOptions::default().with_size(1, 7);
		assert_eq!((options.width, options.height), (8, 8));
	}
}
