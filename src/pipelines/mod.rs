//! Diffusion pipelines.

use std::ops::Deref;

mod stable_diffusion;
pub use self::stable_diffusion::*;

/// Text prompt(s) used as input in diffusion pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prompt(pub(crate) Vec<String>);

impl Prompt {
	/// A batch of `batch_size` empty prompts, used as the unconditional input for classifier-free guidance.
	pub(crate) fn default_batched(batch_size: usize) -> Self {
		Self(vec![String::new(); batch_size])
	}
}

impl Deref for Prompt {
	type Target = Vec<String>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl From<&str> for Prompt {
	fn from(value: &str) -> Self {
		Self(vec![value.to_string()])
	}
}

impl From<String> for Prompt {
	fn from(value: String) -> Self {
		Self(vec![value])
	}
}

impl From<&[String]> for Prompt {
	fn from(value: &[String]) -> Self {
		Self(value.to_vec())
	}
}

impl From<Vec<String>> for Prompt {
	fn from(value: Vec<String>) -> Self {
		Self(value)
	}
}

impl From<Vec<&str>> for Prompt {
	fn from(value: Vec<&str>) -> Self {
		Self(value.iter().map(|v| v.to_string()).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::Prompt;

	#[test]
	fn single_strings_become_a_batch_of_one() {
		assert_eq!(Prompt::from("photo of a red fox").len(), 1);
	}

	#[test]
	fn vectors_keep_their_batch_size() {
		assert_eq!(Prompt::from(vec!["a", "b", "c"]).len(), 3);
	}

	#[test]
	fn default_batched_is_empty_strings() {
		let uncond = Prompt::default_batched(2);
		assert_eq!(*uncond, vec![String::new(), String::new()]);
	}
}
