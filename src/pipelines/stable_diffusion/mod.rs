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

use std::time::Instant;
use std::{path::PathBuf, sync::Arc};

use image::{DynamicImage, Rgb32FImage};
use ndarray::{concatenate, Array4, ArrayD, ArrayView4, Axis, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, Session, SessionBuilder
};
use tracing::info;

mod txt2img;

pub use self::txt2img::Txt2ImgOptions;
use crate::{
	clip::CLIPTokenizer,
	config::{PipelineManifest, TokenizerManifest, MANIFEST_FILENAME},
	DiffusionDeviceControl, Prompt
};

/// Options for the Stable Diffusion pipeline.
#[derive(Default, Debug, Clone)]
pub struct StableDiffusionOptions {
	/// A [`DiffusionDeviceControl`] object, mapping what device to place each model on.
	pub devices: DiffusionDeviceControl
}

/// A [Stable Diffusion](https://github.com/CompVis/stable-diffusion) pipeline.
///
/// The pipeline holds the tokenizer and one ONNX Runtime session per model (text encoder, UNet, VAE decoder). It is
/// constructed once at process start and is read-only afterwards; generation never mutates it.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use mirage::{EulerDiscreteScheduler, OrtEnvironment, SchedulerOptimizedDefaults, StableDiffusionOptions, StableDiffusionPipeline, Txt2ImgOptions};
///
/// let environment = std::sync::Arc::new(OrtEnvironment::builder().with_name("mirage").build()?);
/// let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default()?;
/// let pipeline = StableDiffusionPipeline::new(&environment, "./stable-diffusion-v1-5/", StableDiffusionOptions::default())?;
///
/// let imgs = Txt2ImgOptions::default().with_prompts("photo of a red fox", None).run(&pipeline, &mut scheduler)?;
/// # Ok(())
/// # }
/// ```
pub struct StableDiffusionPipeline {
	// sessions reference the environment; keep it alive for as long as they are
	#[allow(dead_code)]
	environment: Arc<Environment>,
	tokenizer: CLIPTokenizer,
	text_encoder: Session,
	vae_decoder: Session,
	pub(crate) unet: Session
}

impl StableDiffusionPipeline {
	/// Creates a new Stable Diffusion pipeline, loading models from the `pipeline.toml` manifest in `root`.
	///
	/// Fails if the manifest or any model it references cannot be read, or if the manifest declares a float16 export
	/// and a session is placed on the CPU. There is no fallback precision.
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>, options: StableDiffusionOptions) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let started = Instant::now();

		let manifest = PipelineManifest::from_file(root.join(MANIFEST_FILENAME))?.into_stable_diffusion()?;
		manifest.require_device_support(&options.devices)?;

		let tokenizer = match &manifest.tokenizer {
			TokenizerManifest::CLIPTokenizer {
				path,
				model_max_length,
				bos_token,
				eos_token
			} => CLIPTokenizer::new(root.join(path), *model_max_length, *bos_token, *eos_token)?
		};

		let text_encoder = SessionBuilder::new(environment)?
			.with_execution_providers([options.devices.text_encoder.clone().into()])?
			.with_model_from_file(manifest.resolve(&root, &manifest.text_encoder.path))?;

		let unet = SessionBuilder::new(environment)?
			.with_execution_providers([options.devices.unet.clone().into()])?
			.with_model_from_file(manifest.resolve(&root, &manifest.unet.path))?;

		let vae_decoder = SessionBuilder::new(environment)?
			.with_execution_providers([options.devices.vae_decoder.clone().into()])?
			.with_model_from_file(manifest.resolve(&root, &manifest.vae.decoder))?;

		info!(root = %root.display(), precision = ?manifest.precision, elapsed = ?started.elapsed(), "loaded pipeline");

		Ok(Self {
			environment: Arc::clone(environment),
			tokenizer,
			text_encoder,
			vae_decoder,
			unet
		})
	}

	/// Encodes the given prompt(s) into an array of text embeddings to be used as input to the UNet.
	///
	/// When performing classifier-free guidance, the unconditional embeddings (from `negative_prompt`, or empty
	/// prompts if none is given) are concatenated in front of the conditional ones. A single negative prompt is
	/// broadcast across the whole batch.
	pub fn encode_prompt(&self, prompt: &Prompt, do_classifier_free_guidance: bool, negative_prompt: Option<&Prompt>) -> anyhow::Result<ArrayD<f32>> {
		let batch_size = prompt.len();
		let negative_prompt = match negative_prompt {
			Some(negative_prompt) if batch_size > 1 && negative_prompt.len() == 1 => Some(Prompt::from(vec![negative_prompt[0].clone(); batch_size])),
			Some(negative_prompt) => {
				if negative_prompt.len() != batch_size {
					anyhow::bail!("got {} negative prompts for a batch of {batch_size}", negative_prompt.len());
				}
				Some(negative_prompt.clone())
			}
			None => None
		};

		let text_embeddings = self.encode_text(prompt)?;
		if !do_classifier_free_guidance {
			return Ok(text_embeddings);
		}

		let uncond_prompt = negative_prompt.unwrap_or_else(|| Prompt::default_batched(batch_size));
		let uncond_embeddings = self.encode_text(&uncond_prompt)?;
		Ok(concatenate(Axis(0), &[uncond_embeddings.view(), text_embeddings.view()])?)
	}

	fn encode_text(&self, prompt: &Prompt) -> anyhow::Result<ArrayD<f32>> {
		let text_input_ids = self.tokenizer.encode_for_text_model(prompt)?;
		let output = self.text_encoder.run(vec![InputTensor::from_array(text_input_ids.into_dyn())])?;
		let embeddings: OrtOwnedTensor<'_, f32, IxDyn> = output[0].try_extract()?;
		Ok(embeddings.view().to_owned())
	}

	fn to_image(&self, width: u32, height: u32, arr: &Array4<f32>) -> anyhow::Result<DynamicImage> {
		Ok(DynamicImage::ImageRgb32F(
			Rgb32FImage::from_raw(width, height, arr.map(|f| f.clamp(0.0, 1.0)).into_iter().collect::<Vec<_>>())
				.ok_or_else(|| anyhow::anyhow!("failed to construct image"))?
		))
	}

	/// Decodes UNet latents via the variational autoencoder into an array of [`image::DynamicImage`]s.
	pub fn decode_latents(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Vec<DynamicImage>> {
		// reverse the latent scaling applied by the VAE encoder at training time
		let latents = 1.0 / 0.18215 * &latents;

		let mut images = Vec::new();
		for latent_chunk in latents.axis_iter(Axis(0)) {
			let latent_chunk = latent_chunk.into_dyn().insert_axis(Axis(0));
			let image = self.vae_decoder.run(vec![InputTensor::from_array(latent_chunk.to_owned())])?;
			let image: OrtOwnedTensor<'_, f32, IxDyn> = image[0].try_extract()?;
			let f_image: Array4<f32> = image.view().to_owned().into_dimensionality()?;
			let f_image = f_image.permuted_axes([0, 2, 3, 1]) / 2.0 + 0.5;

			let image = self.to_image(f_image.shape()[2] as _, f_image.shape()[1] as _, &f_image)?;
			images.push(image);
		}

		Ok(images)
	}
}
