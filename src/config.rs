use std::path::Path;
use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

/// The numeric precision the pipeline's ONNX graphs were exported with.
///
/// Reduced precision halves the bits per weight for a large throughput and memory win, but is only usable on
/// accelerator devices; see [`StableDiffusionManifest::require_device_support`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Precision {
	/// 16-bit floating point weights.
	Fp16,
	/// Full 32-bit floating point weights.
	Fp32
}

impl Default for Precision {
	fn default() -> Self {
		Self::Fp32
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum TokenizerManifest {
	#[serde(rename_all = "kebab-case")]
	CLIPTokenizer {
		path: String,
		model_max_length: usize,
		bos_token: u32,
		eos_token: u32
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TextEncoderManifest {
	pub path: String
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UNetManifest {
	pub path: String
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VAEManifest {
	pub decoder: String
}

/// Contents of a `pipeline.toml`, describing where each artifact of a converted Stable Diffusion checkpoint lives
/// relative to the manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StableDiffusionManifest {
	#[serde(default)]
	pub precision: Precision,
	pub tokenizer: TokenizerManifest,
	pub text_encoder: TextEncoderManifest,
	pub unet: UNetManifest,
	pub vae: VAEManifest
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "pipeline", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum PipelineManifest {
	StableDiffusion {
		#[serde(flatten)]
		inner: StableDiffusionManifest
	}
}

/// Name of the manifest file expected at the root of a model directory or repository.
pub const MANIFEST_FILENAME: &str = "pipeline.toml";

impl PipelineManifest {
	pub fn from_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let path: PathBuf = path.into();
		let manifest = toml::from_str(&fs::read_to_string(&path)?)?;
		Ok(manifest)
	}

	pub fn into_stable_diffusion(self) -> anyhow::Result<StableDiffusionManifest> {
		match self {
			PipelineManifest::StableDiffusion { inner } => Ok(inner),
			#[allow(unreachable_patterns)]
			_ => anyhow::bail!("not a stable diffusion pipeline")
		}
	}
}

impl StableDiffusionManifest {
	/// Paths of every artifact this manifest references, relative to the manifest itself.
	pub fn artifacts(&self) -> Vec<&str> {
		let TokenizerManifest::CLIPTokenizer { path: tokenizer_path, .. } = &self.tokenizer;
		vec![tokenizer_path, &self.text_encoder.path, &self.unet.path, &self.vae.decoder]
	}

	/// Validates that the devices the pipeline is about to be placed on support this manifest's declared precision.
	/// Float16 graphs contain operators with no CPU kernels, so they require every session to sit on an accelerator.
	pub fn require_device_support(&self, devices: &crate::DiffusionDeviceControl) -> anyhow::Result<()> {
		if self.precision == Precision::Fp16 && !devices.is_fully_accelerated() {
			anyhow::bail!("this is a float16 pipeline; it cannot be placed on the CPU. re-run with an accelerator device or use an fp32 export");
		}
		Ok(())
	}

	pub fn resolve(&self, root: &Path, artifact: &str) -> PathBuf {
		root.join(artifact)
	}
}

#[cfg(test)]
mod tests {
	use crate::{DiffusionDevice, DiffusionDeviceControl};

	use super::{PipelineManifest, Precision};

	const MANIFEST: &str = r#"
pipeline = "stable-diffusion"
precision = "fp16"

[tokenizer]
type = "CLIPTokenizer"
path = "tokenizer.json"
model-max-length = 77
bos-token = 49406
eos-token = 49407

[text-encoder]
path = "text_encoder.onnx"

[unet]
path = "unet.onnx"

[vae]
decoder = "vae_decoder.onnx"
"#;

	#[test]
	fn parse_manifest() {
		let manifest: PipelineManifest = toml::from_str(MANIFEST).unwrap();
		let sd = manifest.into_stable_diffusion().unwrap();
		assert_eq!(sd.precision, Precision::Fp16);
		assert_eq!(sd.unet.path, "unet.onnx");
		assert_eq!(sd.artifacts(), vec!["tokenizer.json", "text_encoder.onnx", "unet.onnx", "vae_decoder.onnx"]);
	}

	#[test]
	fn precision_defaults_to_fp32() {
		let manifest: PipelineManifest = toml::from_str(&MANIFEST.replace("precision = \"fp16\"\n", "")).unwrap();
		let sd = manifest.into_stable_diffusion().unwrap();
		assert_eq!(sd.precision, Precision::Fp32);
	}

	#[test]
	fn fp16_requires_an_accelerator() {
		let manifest: PipelineManifest = toml::from_str(MANIFEST).unwrap();
		let sd = manifest.into_stable_diffusion().unwrap();
		assert!(sd.require_device_support(&DiffusionDeviceControl::default()).is_err());
		assert!(sd.require_device_support(&DiffusionDeviceControl::all(DiffusionDevice::Cuda(0, None))).is_ok());
	}
}
