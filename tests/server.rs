use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc
};

use axum::{
	body::Body,
	http::{header, Request, StatusCode}
};
use http_body_util::BodyExt;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use mirage::server::{router, AppState, SharedState};
use mirage::service::{GenerationRequest, TextToImage};
use tower::ServiceExt;

/// A generator that paints a solid raster of the requested size, standing in for the real pipeline.
struct StubGenerator {
	inits: AtomicUsize,
	calls: AtomicUsize,
	fail: bool
}

impl StubGenerator {
	fn new() -> Self {
		let stub = Self {
			inits: AtomicUsize::new(0),
			calls: AtomicUsize::new(0),
			fail: false
		};
		stub.inits.fetch_add(1, Ordering::SeqCst);
		stub
	}

	fn failing() -> Self {
		Self { fail: true, ..Self::new() }
	}
}

impl TextToImage for StubGenerator {
	fn generate(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self.fail {
			anyhow::bail!("onnx runtime error: out of memory");
		}
		request.validate()?;
		Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(request.width, request.height, Rgb([90, 120, 200]))))
	}
}

fn state_with(generator: Arc<StubGenerator>, defaults: GenerationRequest) -> SharedState {
	Arc::new(AppState { generator, defaults })
}

fn form_submission(prompt: &str) -> Request<Body> {
	Request::builder()
		.method("POST")
		.uri("/generate")
		.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
		.body(Body::from(format!("prompt={}", urlencode(prompt))))
		.unwrap()
}

fn urlencode(s: &str) -> String {
	s.replace(' ', "+")
}

#[tokio::test]
async fn form_submission_returns_a_png_of_the_configured_size() {
	let generator = Arc::new(StubGenerator::new());
	let defaults = GenerationRequest {
		steps: 4,
		width: 256,
		height: 192,
		..Default::default()
	};
	let app = router(state_with(Arc::clone(&generator), defaults));

	let response = app.oneshot(form_submission("photo of a red fox")).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

	let body = response.into_body().collect().await.unwrap().to_bytes();
	let image = image::load_from_memory(&body).unwrap();
	assert_eq!(image.dimensions(), (256, 192));
}

#[tokio::test]
async fn empty_prompts_are_rejected_before_generation() {
	let generator = Arc::new(StubGenerator::new());
	let app = router(state_with(Arc::clone(&generator), GenerationRequest::default()));

	let response = app.oneshot(form_submission("")).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	assert_eq!(generator.calls.load(Ordering::SeqCst), 0);

	let body = response.into_body().collect().await.unwrap().to_bytes();
	let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(error["type"], "invalid_request_error");
}

#[tokio::test]
async fn malformed_submissions_never_reach_the_generator() {
	let generator = Arc::new(StubGenerator::new());
	let app = router(state_with(Arc::clone(&generator), GenerationRequest::default()));

	// JSON instead of a form submission
	let response = app
		.clone()
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/generate")
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(r#"{"prompt": 42}"#))
				.unwrap()
		)
		.await
		.unwrap();
	assert!(response.status().is_client_error());

	// a form submission missing the prompt field
	let response = app
		.oneshot(
			Request::builder()
				.method("POST")
				.uri("/generate")
				.header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
				.body(Body::from("steps=3"))
				.unwrap()
		)
		.await
		.unwrap();
	assert!(response.status().is_client_error());

	assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn the_generator_is_initialized_once_across_submissions() {
	let generator = Arc::new(StubGenerator::new());
	let app = router(state_with(Arc::clone(&generator), GenerationRequest::default()));

	for prompt in ["a lake", "a mountain", "a sunset"] {
		let response = app.clone().oneshot(form_submission(prompt)).await.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}

	assert_eq!(generator.inits.load(Ordering::SeqCst), 1);
	assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn generation_failures_map_to_a_server_error() {
	let generator = Arc::new(StubGenerator::failing());
	let app = router(state_with(generator, GenerationRequest::default()));

	let response = app.oneshot(form_submission("photo of a red fox")).await.unwrap();
	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

	let body = response.into_body().collect().await.unwrap().to_bytes();
	let error: serde_json::Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(error["type"], "server_error");
	assert!(error["message"].as_str().unwrap().contains("out of memory"));
}

#[tokio::test]
async fn the_index_page_serves_the_prompt_form() {
	let app = router(state_with(Arc::new(StubGenerator::new()), GenerationRequest::default()));

	let response = app.oneshot(Request::builder().uri("/").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	let body = response.into_body().collect().await.unwrap().to_bytes();
	let page = std::str::from_utf8(&body).unwrap();
	assert!(page.contains(r#"name="prompt""#));
}

#[tokio::test]
async fn health_reports_ok() {
	let app = router(state_with(Arc::new(StubGenerator::new()), GenerationRequest::default()));

	let response = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
	assert_eq!(response.status(), StatusCode::OK);

	let body = response.into_body().collect().await.unwrap().to_bytes();
	let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(health["status"], "ok");
}
