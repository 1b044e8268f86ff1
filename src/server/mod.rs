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

//! The HTTP interface: a single-field prompt form over the [`TextToImage`] capability.
//!
//! Submissions are handled synchronously; the form waits for the generated image. Concurrent submissions are
//! serialized only by contention for the compute device - this layer adds no queueing or backpressure of its own.

use std::io::Cursor;
use std::sync::Arc;

use axum::{
	extract::State,
	http::{header, StatusCode},
	response::{Html, IntoResponse, Response},
	routing::{get, post},
	Form, Json, Router
};
use image::{DynamicImage, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::service::{GenerationRequest, TextToImage};

/// Shared server state: the generation service plus the parameters every form submission is bound to.
pub struct AppState {
	/// The process-wide generation service.
	pub generator: Arc<dyn TextToImage>,
	/// Generation parameters applied to every submission; only the prompt varies per request.
	pub defaults: GenerationRequest
}

/// [`AppState`] as shared with every handler.
pub type SharedState = Arc<AppState>;

#[derive(Deserialize)]
struct GenerateForm {
	prompt: String
}

/// JSON error body returned for rejected or failed submissions.
#[derive(Debug, Serialize)]
pub struct ApiError {
	/// Human-readable description of the failure.
	pub message: String,
	/// Coarse error category, e.g. `invalid_request_error` or `server_error`.
	#[serde(rename = "type")]
	pub kind: String
}

impl ApiError {
	/// Creates a new API error with the given message and category.
	pub fn new(message: impl Into<String>, kind: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			kind: kind.into()
		}
	}
}

/// Builds the application router: the form page at `/`, the generation endpoint at `POST /generate`, and a health
/// check at `/health`.
pub fn router(state: SharedState) -> Router {
	Router::new()
		.route("/", get(index))
		.route("/generate", post(generate))
		.route("/health", get(health))
		.with_state(state)
}

async fn index() -> Html<&'static str> {
	Html(include_str!("index.html"))
}

async fn health() -> Json<Value> {
	Json(json!({ "status": "ok" }))
}

async fn generate(State(state): State<SharedState>, Form(form): Form<GenerateForm>) -> Result<Response, (StatusCode, Json<ApiError>)> {
	let request = GenerationRequest::with_prompt(form.prompt, &state.defaults);

	// reject invalid input before it occupies the blocking pool
	request
		.validate()
		.map_err(|e| (StatusCode::BAD_REQUEST, Json(ApiError::new(e.to_string(), "invalid_request_error"))))?;

	let generator = Arc::clone(&state.generator);
	let image = tokio::task::spawn_blocking(move || generator.generate(&request))
		.await
		.map_err(|_| {
			(
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(ApiError::new("generation task panicked", "server_error"))
			)
		})?
		.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(e.to_string(), "server_error"))))?;

	let png = encode_png(image).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(e.to_string(), "server_error"))))?;

	Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

fn encode_png(image: DynamicImage) -> anyhow::Result<Vec<u8>> {
	let mut buf = Vec::new();
	// the pipeline produces float32 buffers; PNG wants 8-bit channels
	DynamicImage::ImageRgb8(image.into_rgb8()).write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)?;
	Ok(buf)
}
