use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use mirage::{
	server::{self, AppState},
	DdimScheduler, DiffusionDevice, DiffusionDeviceControl, EulerDiscreteScheduler, GenerationRequest, GeneratorService, ModelSource, OrtEnvironment,
	SchedulerOptimizedDefaults, StableDiffusionOptions, StableDiffusionPipeline, TextToImage
};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SchedulerChoice {
	/// Euler discrete scheduler (recommended).
	Euler,
	/// Denoising diffusion implicit models scheduler.
	Ddim
}

/// Serve a Stable Diffusion pipeline behind a one-field web form.
#[derive(Parser)]
#[command(version, about)]
struct Args {
	/// Path to a converted pipeline directory, or a Hugging Face repository ID to fetch one from.
	model: String,

	/// Port to serve on.
	#[arg(long, default_value_t = 8080)]
	port: u16,

	/// Listen on all interfaces instead of loopback. The endpoint has no authentication; only use this on networks
	/// you trust.
	#[arg(long)]
	public: bool,

	/// Place every model on the CPU, even if a CUDA build is available.
	#[arg(long)]
	cpu: bool,

	/// CUDA device ID to place models on.
	#[arg(long, default_value_t = 0)]
	cuda_device: usize,

	/// Scheduler driving the denoising loop.
	#[arg(long, value_enum, default_value = "euler")]
	scheduler: SchedulerChoice,

	/// Number of denoising steps per generation.
	#[arg(long, default_value_t = 100)]
	steps: usize,

	/// Output image width; must be a multiple of 8.
	#[arg(long, default_value_t = 512)]
	width: u32,

	/// Output image height; must be a multiple of 8.
	#[arg(long, default_value_t = 512)]
	height: u32,

	/// Classifier-free guidance scale.
	#[arg(long, default_value_t = 7.5)]
	guidance_scale: f32
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt::init();
	let args = Args::parse();

	if args.steps == 0 {
		anyhow::bail!("--steps must be greater than 0");
	}
	if args.width == 0 || args.height == 0 || args.width % 8 != 0 || args.height % 8 != 0 {
		anyhow::bail!("--width and --height must be positive multiples of 8");
	}

	let device = if args.cpu || !cfg!(feature = "ort-cuda") {
		info!("placing models on the CPU");
		DiffusionDevice::Cpu
	} else {
		info!(device = args.cuda_device, "placing models on CUDA");
		DiffusionDevice::Cuda(args.cuda_device, None)
	};

	let source = ModelSource::parse(&args.model);
	info!(%source, "resolving model");
	let root = source.resolve()?;

	let environment = Arc::new(OrtEnvironment::builder().with_name("mirage").build()?);
	let pipeline = StableDiffusionPipeline::new(
		&environment,
		root,
		StableDiffusionOptions {
			devices: DiffusionDeviceControl::all(device)
		}
	)?;

	let generator: Arc<dyn TextToImage> = match args.scheduler {
		SchedulerChoice::Euler => Arc::new(GeneratorService::new(pipeline, EulerDiscreteScheduler::stable_diffusion_v1_optimized_default()?)),
		SchedulerChoice::Ddim => Arc::new(GeneratorService::new(pipeline, DdimScheduler::stable_diffusion_v1_optimized_default()?))
	};

	let defaults = GenerationRequest {
		steps: args.steps,
		width: args.width,
		height: args.height,
		guidance_scale: args.guidance_scale,
		..Default::default()
	};

	let ip = if args.public {
		warn!("serving on all interfaces with no authentication - anyone who can reach this host can run generations");
		"0.0.0.0"
	} else {
		"127.0.0.1"
	};
	let listener = tokio::net::TcpListener::bind(format!("{ip}:{}", args.port)).await?;
	info!("listening on http://{}", listener.local_addr()?);

	let app = server::router(Arc::new(AppState { generator, defaults }));
	axum::serve(listener, app).await?;

	Ok(())
}
