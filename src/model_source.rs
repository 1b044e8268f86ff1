//! Resolution of model identifiers to local pipeline directories.

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

use hf_hub::api::sync::ApiBuilder;
use tracing::info;

use crate::config::{PipelineManifest, MANIFEST_FILENAME};

/// Source from which to load a pipeline: a directory already on disk, or a Hugging Face repository to fetch it from.
///
/// Hub downloads are cached by `hf-hub`'s own mechanism, so weights are only fetched the first time a repository is
/// used.
#[derive(Debug, Clone)]
pub enum ModelSource {
	/// A local directory containing a `pipeline.toml` and the artifacts it references.
	Local(PathBuf),
	/// A Hugging Face repository ID, e.g. `someuser/stable-diffusion-v1-5-onnx`.
	Hub(String)
}

impl ModelSource {
	/// Interprets a model identifier: an existing local path loads from disk, anything else is treated as a Hugging
	/// Face repository ID.
	pub fn parse(identifier: &str) -> Self {
		let path = Path::new(identifier);
		if path.exists() { Self::Local(path.to_path_buf()) } else { Self::Hub(identifier.to_string()) }
	}

	/// Resolves this source to a local directory containing the pipeline manifest and all of its artifacts,
	/// downloading them if necessary. Fails fatally on network or storage errors; there is no retry.
	pub fn resolve(&self) -> anyhow::Result<PathBuf> {
		match self {
			Self::Local(path) => {
				let manifest = path.join(MANIFEST_FILENAME);
				if !manifest.is_file() {
					anyhow::bail!("no {MANIFEST_FILENAME} found in `{}`; is this a converted pipeline directory?", path.display());
				}
				Ok(path.clone())
			}
			Self::Hub(repo_id) => {
				info!("fetching `{repo_id}` from the Hugging Face Hub");
				let api = ApiBuilder::new().with_progress(true).build()?;
				let repo = api.model(repo_id.clone());

				let manifest_path = repo.get(MANIFEST_FILENAME)?;
				let manifest = PipelineManifest::from_file(&manifest_path)?.into_stable_diffusion()?;
				for artifact in manifest.artifacts() {
					info!("fetching artifact `{artifact}`");
					repo.get(artifact)?;
				}

				let root = manifest_path
					.parent()
					.ok_or_else(|| anyhow::anyhow!("manifest has no parent directory - this should never happen"))?
					.to_path_buf();
				Ok(root)
			}
		}
	}
}

impl Display for ModelSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Local(path) => write!(f, "local path: {}", path.display()),
			Self::Hub(repo_id) => write!(f, "hub repository: {repo_id}")
		}
	}
}

#[cfg(test)]
mod tests {
	use super::ModelSource;

	#[test]
	fn existing_paths_parse_as_local() {
		assert!(matches!(ModelSource::parse(env!("CARGO_MANIFEST_DIR")), ModelSource::Local(_)));
	}

	#[test]
	fn anything_else_parses_as_a_repository() {
		assert!(matches!(ModelSource::parse("someuser/stable-diffusion-v1-5-onnx"), ModelSource::Hub(_)));
	}

	#[test]
	fn local_directories_without_a_manifest_are_rejected() {
		let source = ModelSource::Local(std::env::temp_dir());
		assert!(source.resolve().is_err());
	}
}
