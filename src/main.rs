use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use stereo_depth::{run, FrameProgress, PipelineConfig, StereoRig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stereo-depth")]
#[command(about = "Dense stereo depth estimation and evaluation for rectified image sequences")]
#[command(version)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Process a capture directory frame by frame.
	Run(RunArgs),

	/// Print focal length and disparity search range for a rig.
	Plan(PlanArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
	/// JSON pipeline configuration; flags below override it.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Capture directory holding the left/right render products.
	#[arg(short, long)]
	input: Option<PathBuf>,

	/// Output directory.
	#[arg(short, long)]
	output: Option<PathBuf>,

	/// Skip evaluation against ground truth.
	#[arg(long)]
	no_eval: bool,

	/// Write disparity and depth visualizations.
	#[arg(long)]
	visualize: bool,

	/// Enable temporal smoothing with this weight for the newest frame.
	#[arg(long)]
	temporal_alpha: Option<f32>,

	/// Enable edge-aware disparity refinement.
	#[arg(long)]
	refine: bool,

	#[arg(long, allow_negative_numbers = true)]
	min_disparity: Option<i32>,

	/// Disparity search width (multiple of 16).
	#[arg(long)]
	num_disparities: Option<usize>,

	/// Odd matching window size.
	#[arg(long)]
	block_size: Option<usize>,

	/// Process at most this many frames.
	#[arg(long)]
	frames: Option<usize>,

	/// Export a colored PLY point cloud per frame.
	#[arg(long)]
	point_cloud: bool,

	/// Focal length in pixels.
	#[arg(long)]
	focal_length: Option<f32>,

	/// Baseline in meters.
	#[arg(long)]
	baseline: Option<f32>,
}

#[derive(Debug, Clone, Args)]
struct PlanArgs {
	/// Focal length in pixels. Derived from the sensor geometry when omitted.
	#[arg(long)]
	focal_length: Option<f32>,

	/// Lens focal length in millimeters.
	#[arg(long, default_value = "3.5")]
	focal_length_mm: f32,

	/// Horizontal sensor aperture in millimeters.
	#[arg(long, default_value = "6.912")]
	aperture_mm: f32,

	/// Image width in pixels.
	#[arg(long, default_value = "1920")]
	width: u32,

	/// Baseline in meters.
	#[arg(long, default_value = "0.12")]
	baseline: f32,

	/// Nearest working distance in meters.
	#[arg(long, default_value = "1.0")]
	near: f32,

	/// Farthest working distance in meters.
	#[arg(long, default_value = "2.0")]
	far: f32,
}

fn build_config(args: &RunArgs) -> Result<PipelineConfig> {
	let mut config = match &args.config {
		Some(path) => PipelineConfig::load(path)?,
		None => PipelineConfig::default(),
	};

	if let Some(ref input) = args.input {
		config.input_dir = input.clone();
	}
	if let Some(ref output) = args.output {
		config.output_dir = output.clone();
	}
	if args.no_eval {
		config.evaluate = false;
	}
	if args.visualize {
		config.visualize = true;
	}
	if let Some(alpha) = args.temporal_alpha {
		config.temporal.enabled = true;
		config.temporal.alpha = alpha;
	}
	if args.refine {
		config.refinement.enabled = true;
	}
	if let Some(min) = args.min_disparity {
		config.matcher.min_disparity = min;
	}
	if let Some(num) = args.num_disparities {
		config.matcher.num_disparities = num;
	}
	if let Some(block) = args.block_size {
		config.matcher.block_size = block;
	}
	if let Some(frames) = args.frames {
		config.frame_limit = Some(frames);
	}
	if args.point_cloud {
		config.export_point_cloud = true;
	}
	if let Some(f) = args.focal_length {
		config.rig.focal_length_px = f;
	}
	if let Some(b) = args.baseline {
		config.rig.baseline_m = b;
	}

	config.validate()?;
	Ok(config)
}

fn run_command(args: RunArgs) -> Result<()> {
	let config = build_config(&args)?;

	let start = std::time::Instant::now();
	let report = run(
		&config,
		Some(Box::new(|progress: FrameProgress| {
			eprint!(
				"\r[{}] Frame {} ({}/{}, {:.1}%)",
				progress.stage, progress.frame_index, progress.current, progress.total, progress.percent
			);
		})),
	)
	.with_context(|| format!("stereo run over {:?} failed", config.input_dir))?;
	eprintln!();

	eprintln!(
		"Attempted {}, succeeded {}, skipped {}, failed {}, evaluated {} (refinement {:?})",
		report.attempted, report.succeeded, report.skipped, report.failed, report.evaluated, report.refinement
	);
	if let Some(agg) = report.aggregate {
		eprintln!(
			"MAE {:.4} m  RMSE {:.4} m  AbsRel {:.4}  δ1 {:.3}  δ2 {:.3}  δ3 {:.3}  ({} frames)",
			agg.mae, agg.rmse, agg.abs_rel, agg.delta1, agg.delta2, agg.delta3, agg.frames
		);
	}
	eprintln!("✓ Results in {:?}", config.output_dir);
	eprintln!("Total time: {:.1}s", start.elapsed().as_secs_f64());

	if !report.is_success() {
		bail!("no frame in {:?} could be processed", config.input_dir);
	}
	Ok(())
}

fn plan_command(args: PlanArgs) -> Result<()> {
	let rig = match args.focal_length {
		Some(f) => StereoRig::new(f, args.baseline),
		None => StereoRig::from_sensor(args.focal_length_mm, args.aperture_mm, args.width, args.baseline),
	};
	rig.validate()?;
	let (min_disparity, num_disparities) = rig.search_range(args.near, args.far)?;

	println!("focal length:      {:.2} px", rig.focal_length_px);
	println!("baseline:          {:.3} m", rig.baseline_m);
	println!("disparity @ {:.2} m: {:.2} px", args.near, rig.disparity_at(args.near));
	println!("disparity @ {:.2} m: {:.2} px", args.far, rig.disparity_at(args.far));
	println!("min_disparity:     {}", min_disparity);
	println!("num_disparities:   {}", num_disparities);
	Ok(())
}

fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	match cli.command {
		Commands::Run(args) => run_command(args),
		Commands::Plan(args) => plan_command(args),
	}
}
