//! Utilities for cleaning up prompts before they reach the tokenizer.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
	static ref COMMA_RUNS: Regex = Regex::new(r"\s*,+\s*").unwrap();
	static ref WHITESPACE_RUNS: Regex = Regex::new(r"\s+").unwrap();
	static ref EDGE_COMMAS: Regex = Regex::new(r"^[\s,]+|[\s,]+$").unwrap();
}

/// Cleans up a potentially dirty prompt: collapses repeated commas and whitespace and strips leading/trailing commas.
///
/// ```
/// # use mirage::prompting::normalize_prompt;
/// assert_eq!(normalize_prompt("a serene  lake,, snow-capped mountains, ").as_str(), "a serene lake, snow-capped mountains");
/// ```
pub fn normalize_prompt<S: AsRef<str>>(prompt: S) -> String {
	let prompt = WHITESPACE_RUNS.replace_all(prompt.as_ref(), " ");
	let prompt = COMMA_RUNS.replace_all(prompt.as_ref(), ", ");
	let prompt = EDGE_COMMAS.replace_all(prompt.as_ref(), "");
	prompt.trim().to_string()
}

#[cfg(test)]
mod tests {
	use super::normalize_prompt;

	#[test]
	fn collapses_commas_and_whitespace() {
		assert_eq!(normalize_prompt("photo of a red fox,,  in the snow,").as_str(), "photo of a red fox, in the snow");
	}

	#[test]
	fn strips_leading_commas() {
		assert_eq!(normalize_prompt(", , 1girl, solo").as_str(), "1girl, solo");
	}

	#[test]
	fn whitespace_only_normalizes_to_empty() {
		assert_eq!(normalize_prompt("   \t ").as_str(), "");
	}
}
