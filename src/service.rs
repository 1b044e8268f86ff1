// Copyright 2024 the mirage developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The text-to-image service: a pipeline bound to a scheduler, constructed once at process start and read concurrently
//! until process exit.

use std::time::Instant;

use image::DynamicImage;
use tracing::{debug, info};

use crate::{prompting::normalize_prompt, DiffusionScheduler, StableDiffusionPipeline, Txt2ImgOptions};

/// Parameters for a single generation. Defaults match the pretrained pipeline: 100 steps at 512x512 with a guidance
/// scale of 7.5 and a random seed.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
	/// The text prompt to generate an image for. Must be non-empty after trimming.
	pub prompt: String,
	/// Number of denoising steps; must be greater than 0.
	pub steps: usize,
	/// Output image width in pixels; must be a positive multiple of 8.
	pub width: u32,
	/// Output image height in pixels; must be a positive multiple of 8.
	pub height: u32,
	/// Classifier-free guidance scale.
	pub guidance_scale: f32,
	/// Noise seed. Generation is only deterministic when this is set.
	pub seed: Option<u64>
}

impl Default for GenerationRequest {
	fn default() -> Self {
		Self {
			prompt: String::new(),
			steps: 100,
			width: 512,
			height: 512,
			guidance_scale: 7.5,
			seed: None
		}
	}
}

impl GenerationRequest {
	/// A request for `prompt` with every other parameter taken from `defaults`.
	pub fn with_prompt(prompt: impl Into<String>, defaults: &GenerationRequest) -> Self {
		Self {
			prompt: prompt.into(),
			..defaults.clone()
		}
	}

	/// Validates this request, rejecting parameters the underlying model cannot accept **before** any compute is
	/// attempted.
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.prompt.trim().is_empty() {
			anyhow::bail!("prompt must not be empty");
		}
		if self.steps == 0 {
			anyhow::bail!("`steps` must be greater than 0");
		}
		if self.width == 0 || self.height == 0 {
			anyhow::bail!("`width` and `height` must be greater than 0");
		}
		if self.width % 8 != 0 || self.height % 8 != 0 {
			anyhow::bail!("`width` ({}) and `height` ({}) must be divisible by 8 for Stable Diffusion", self.width, self.height);
		}
		Ok(())
	}
}

/// A plain `(prompt, parameters) -> image` capability.
///
/// The HTTP layer depends on this trait rather than on [`StableDiffusionPipeline`] directly, so any interface
/// technology (or a test stub) can be layered on top of the core.
pub trait TextToImage: Send + Sync {
	/// Generates one image for the given request, blocking until it is ready.
	fn generate(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}

/// A [`StableDiffusionPipeline`] bound to a scheduler.
///
/// The service is immutable after construction: each generation clones the scheduler template, so concurrent callers
/// never contend on scheduler state. Contention for the underlying compute device is delegated to ONNX Runtime.
pub struct GeneratorService<S: DiffusionScheduler> {
	pipeline: StableDiffusionPipeline,
	scheduler: S
}

impl<S: DiffusionScheduler> GeneratorService<S> {
	/// Binds `pipeline` to `scheduler`, producing the process-wide generation service.
	pub fn new(pipeline: StableDiffusionPipeline, scheduler: S) -> Self {
		Self { pipeline, scheduler }
	}
}

impl<S: DiffusionScheduler + Send + Sync> TextToImage for GeneratorService<S> {
	fn generate(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
		request.validate()?;

		let prompt = normalize_prompt(&request.prompt);
		let started = Instant::now();

		let mut options = Txt2ImgOptions::default()
			.with_prompts(prompt.as_str(), None)
			.with_steps(request.steps)
			.with_size(request.width, request.height)
			.with_guidance_scale(request.guidance_scale)
			.callback_progress(move |step, _| {
				if step % 10 == 0 {
					debug!(step, "denoising");
				}
				true
			});
		if let Some(seed) = request.seed {
			options = options.with_seed(seed);
		}

		let mut scheduler = self.scheduler.clone();
		let mut images = options.run(&self.pipeline, &mut scheduler)?;

		info!(prompt = %prompt, steps = request.steps, width = request.width, height = request.height, elapsed = ?started.elapsed(), "generated image");

		Ok(images.remove(0))
	}
}

#[cfg(test)]
mod tests {
	use super::GenerationRequest;

	#[test]
	fn default_parameters_are_valid_except_the_prompt() {
		let request = GenerationRequest::default();
		assert!(request.validate().is_err());
		assert!(GenerationRequest::with_prompt("photo of a red fox", &request).validate().is_ok());
	}

	#[test]
	fn whitespace_prompts_are_rejected() {
		let request = GenerationRequest::with_prompt("  \t ", &GenerationRequest::default());
		assert!(request.validate().is_err());
	}

	#[test]
	fn zero_steps_are_rejected() {
		let request = GenerationRequest {
			steps: 0,
			..GenerationRequest::with_prompt("a", &GenerationRequest::default())
		};
		assert!(request.validate().is_err());
	}

	#[test]
	fn resolutions_not_divisible_by_8_are_rejected() {
		let request = GenerationRequest {
			width: 513,
			..GenerationRequest::with_prompt("a", &GenerationRequest::default())
		};
		assert!(request.validate().is_err());
	}

	#[test]
	fn zero_resolution_is_rejected() {
		let request = GenerationRequest {
			height: 0,
			..GenerationRequest::with_prompt("a", &GenerationRequest::default())
		};
		assert!(request.validate().is_err());
	}

	#[test]
	fn with_prompt_keeps_the_other_defaults() {
		let defaults = GenerationRequest {
			steps: 20,
			width: 256,
			height: 192,
			..Default::default()
		};
		let request = GenerationRequest::with_prompt("a boat", &defaults);
		assert_eq!(request.prompt, "a boat");
		assert_eq!((request.steps, request.width, request.height), (20, 256, 192));
	}
}
