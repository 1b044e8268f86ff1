//! `mirage` wraps a pretrained [Stable Diffusion] pipeline, running on [ONNX Runtime], in a single inference call and a
//! minimal web form.
//!
//! The library half exposes the pipeline directly:
//! ```ignore
//! use mirage::{EulerDiscreteScheduler, OrtEnvironment, SchedulerOptimizedDefaults, StableDiffusionOptions, StableDiffusionPipeline, Txt2ImgOptions};
//!
//! let environment = std::sync::Arc::new(OrtEnvironment::builder().with_name("mirage").build()?);
//! let mut scheduler = EulerDiscreteScheduler::stable_diffusion_v1_optimized_default()?;
//! let pipeline = StableDiffusionPipeline::new(&environment, "./stable-diffusion-v1-5/", StableDiffusionOptions::default())?;
//!
//! let mut images = Txt2ImgOptions::default().with_prompts("photo of a red fox", None).run(&pipeline, &mut scheduler)?;
//! images.remove(0).into_rgb8().save("result.png")?;
//! ```
//!
//! The binary half (`mirage <model>`) loads the pipeline once, binds it to the configured device, and serves a
//! one-field prompt form over HTTP; see the [`server`] module.
//!
//! [Stable Diffusion]: https://github.com/CompVis/stable-diffusion
//! [ONNX Runtime]: https://onnxruntime.ai/

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

#[doc(hidden)]
pub mod clip;
pub(crate) mod config;
pub mod model_source;
pub mod pipelines;
pub mod prompting;
pub mod schedulers;
pub mod server;
pub mod service;

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;

pub use self::model_source::ModelSource;
pub use self::pipelines::*;
pub use self::schedulers::*;
pub use self::service::{GenerationRequest, GeneratorService, TextToImage};

/// The strategy to use for extending the device memory arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Subsequent memory allocations extend by larger amounts (multiplied by powers of two)
	PowerOfTwo,
	/// Memory allocations extend only by the requested amount.
	SameAsRequested
}

impl Default for ArenaExtendStrategy {
	fn default() -> Self {
		Self::PowerOfTwo
	}
}

impl From<ArenaExtendStrategy> for String {
	fn from(val: ArenaExtendStrategy) -> Self {
		match val {
			ArenaExtendStrategy::PowerOfTwo => "kNextPowerOfTwo".to_string(),
			ArenaExtendStrategy::SameAsRequested => "kSameAsRequested".to_string()
		}
	}
}

/// Device options for the CUDA execution provider.
///
/// For low-VRAM GPUs running a float16 Stable Diffusion v1 UNet at 512x512, a memory limit of ~3 GB with
/// [`ArenaExtendStrategy::SameAsRequested`] is a good starting point.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CudaDeviceOptions {
	/// The strategy to use for extending the device memory arena. See [`ArenaExtendStrategy`] for more info.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (aka per-model) memory limit, in bytes. Models may use all available VRAM if a memory limit is not
	/// set.
	pub memory_limit: Option<usize>
}

impl From<CudaDeviceOptions> for ExecutionProvider {
	fn from(val: CudaDeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(arena_extend_strategy) = val.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", arena_extend_strategy);
		}
		if let Some(memory_limit) = val.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		ep
	}
}

/// A compute device on which to place a model of the diffusion pipeline.
///
/// If the configured execution provider is not available at runtime, ONNX Runtime falls back to the CPU.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	Cpu,
	/// Use NVIDIA CUDA as a device; requires the `ort-cuda` feature. First value is the device ID (0 in most cases),
	/// second value is additional execution provider parameters for fine tuning on low-VRAM GPUs.
	Cuda(usize, Option<CudaDeviceOptions>)
}

impl DiffusionDevice {
	/// Whether this device is an accelerator. Reduced-precision (float16) pipelines are only supported on
	/// accelerators.
	pub fn is_accelerator(&self) -> bool {
		!matches!(self, DiffusionDevice::Cpu)
	}
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::Cpu => ExecutionProvider::cpu(),
			DiffusionDevice::Cuda(device, options) => {
				let options = options.unwrap_or_default();
				let mut ep: ExecutionProvider = options.into();
				ep = ep.with("device_id", device.to_string());
				ep
			}
		}
	}
}

/// Selects which device each model of the pipeline should be placed on.
///
/// On GPUs with <6 GB VRAM it may be favorable to keep the text encoder and VAE decoder on the CPU so the much more
/// intensive UNet can have the GPU to itself:
/// ```ignore
/// DiffusionDeviceControl {
/// 	unet: DiffusionDevice::Cuda(0, None),
/// 	..Default::default()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DiffusionDeviceControl {
	/// The device on which to place the text encoder (CLIP).
	pub text_encoder: DiffusionDevice,
	/// The device on which to place the UNet.
	pub unet: DiffusionDevice,
	/// The device on which to place the variational autoencoder decoder.
	pub vae_decoder: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Constructs [`DiffusionDeviceControl`] with all models on the same device.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			text_encoder: device.clone(),
			unet: device.clone(),
			vae_decoder: device
		}
	}

	/// Whether every model of the pipeline is placed on an accelerator device.
	pub fn is_fully_accelerated(&self) -> bool {
		self.text_encoder.is_accelerator() && self.unet.is_accelerator() && self.vae_decoder.is_accelerator()
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		DiffusionDeviceControl::all(DiffusionDevice::Cpu)
	}
}
