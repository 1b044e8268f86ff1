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

//! CLIP tokenizer implementation.

use std::path::PathBuf;

use ndarray::Array2;
use tokenizers::Tokenizer;

use crate::Prompt;

/// A basic [CLIP](https://arxiv.org/abs/2103.00020) tokenizer.
///
/// CLIP is used by many diffusion models, including Stable Diffusion, for prompt tokenization and feature extraction.
pub struct CLIPTokenizer {
	inner: Tokenizer,
	model_max_length: usize,
	bos_token_id: u32,
	eos_token_id: u32
}

unsafe impl Send for CLIPTokenizer {}
unsafe impl Sync for CLIPTokenizer {}

impl CLIPTokenizer {
	/// Loads a CLIP tokenizer from a serialized `tokenizer.json`.
	pub fn new(path: impl Into<PathBuf>, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let path = path.into();
		let bytes = std::fs::read(path)?;
		Self::from_bytes(bytes, model_max_length, bos_token_id, eos_token_id)
	}

	/// Loads a CLIP tokenizer from a byte array.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, bos_token_id: u32, eos_token_id: u32) -> anyhow::Result<Self> {
		let tokenizer: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		Ok(Self {
			inner: tokenizer,
			model_max_length,
			bos_token_id,
			eos_token_id
		})
	}

	/// Returns the maximum length of token sequences this tokenizer produces. For most CLIP models, this is 77 tokens.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.model_max_length
	}

	/// Returns the ID of the end-of-string token.
	pub fn eos(&self) -> u32 {
		self.eos_token_id
	}

	/// Returns the ID of the beginning-of-string token.
	pub fn bos(&self) -> u32 {
		self.bos_token_id
	}

	/// Encodes the given prompt(s) into an [`Array2`] of token IDs to be passed to a CLIP text model. Each row is
	/// padded or truncated to exactly `model_max_length` entries, with the final entry always being the end-of-string
	/// token.
	pub fn encode_for_text_model(&self, prompt: &Prompt) -> anyhow::Result<Array2<i32>> {
		let batch_size = prompt.len();
		let inputs: Vec<&str> = prompt.iter().map(String::as_str).collect();
		let encodings = self.inner.encode_batch(inputs, true).map_err(|e| anyhow::anyhow!("{e:?}"))?;

		let mut ids = Vec::with_capacity(batch_size * self.model_max_length);
		for encoding in &encodings {
			let row = fit_to_length(encoding.get_ids(), self.model_max_length, self.eos_token_id);
			ids.extend(row.into_iter().map(|tok| tok as i32));
		}

		Ok(Array2::from_shape_vec((batch_size, self.model_max_length), ids)?)
	}
}

/// Pads a token sequence out to `length` with `eos_token_id`, or truncates it, forcing the final entry to remain the
/// end-of-string token so over-long prompts stay well-formed.
pub(crate) fn fit_to_length(ids: &[u32], length: usize, eos_token_id: u32) -> Vec<u32> {
	let mut out = ids.to_vec();
	if out.len() > length {
		out.truncate(length);
		out[length - 1] = eos_token_id;
	} else {
		out.resize(length, eos_token_id);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::fit_to_length;

	const EOS: u32 = 49407;

	#[test]
	fn short_sequences_are_padded_with_eos() {
		assert_eq!(fit_to_length(&[49406, 320, 1125, EOS], 8, EOS), vec![49406, 320, 1125, EOS, EOS, EOS, EOS, EOS]);
	}

	#[test]
	fn long_sequences_are_truncated_and_terminated() {
		let ids: Vec<u32> = (0..100).collect();
		let out = fit_to_length(&ids, 8, EOS);
		assert_eq!(out.len(), 8);
		assert_eq!(out[..7], [0, 1, 2, 3, 4, 5, 6]);
		assert_eq!(out[7], EOS);
	}

	#[test]
	fn exact_length_is_untouched() {
		let ids = [49406, 320, EOS];
		assert_eq!(fit_to_length(&ids, 3, EOS), ids.to_vec());
	}
}
