use crate::camera::StereoRig;
use crate::cloud::{project, PointCloud};
use crate::config::{DepthClip, GroundTruthKind, PipelineConfig};
use crate::depth::{clip_depth, disparity_to_depth, distance_to_planar_depth};
use crate::depth_filter::TemporalStabilizer;
use crate::disparity::DisparityEstimator;
use crate::error::{StereoError, StereoResult};
use crate::frame::{DepthMap, DisparityMap, StereoFramePair};
use crate::image_loader::FrameLoader;
use crate::metrics::{evaluate, AggregateMetrics, FrameMetrics, MetricsAccumulator};
use crate::output::{OutputWriter, CONFIG_FILE, SUMMARY_FILE};
use crate::refine::{select_refiner, DisparityRefiner, RefinementStatus};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct FrameProgress {
	/// Frames finished so far in this run.
	pub current: usize,
	pub total: usize,
	pub frame_index: u32,
	pub stage: String,
	pub percent: f64,
}

impl FrameProgress {
	pub fn new(current: usize, total: usize, frame_index: u32, stage: &str) -> Self {
		let percent = if total > 0 {
			(current as f64 / total as f64 * 100.0).min(100.0)
		} else {
			0.0
		};
		Self {
			current,
			total,
			frame_index,
			stage: stage.to_string(),
			percent,
		}
	}
}

pub type ProgressCallback = Box<dyn Fn(FrameProgress) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EvaluationOutcome {
	Disabled,
	/// No ground truth for this frame.
	Skipped,
	/// Ground truth present, but no pixel was valid in both maps.
	Undefined,
	Scored { metrics: FrameMetrics },
}

impl EvaluationOutcome {
	pub fn metrics(&self) -> Option<&FrameMetrics> {
		match self {
			EvaluationOutcome::Scored { metrics } => Some(metrics),
			_ => None,
		}
	}

	fn has_ground_truth(&self) -> bool {
		matches!(self, EvaluationOutcome::Undefined | EvaluationOutcome::Scored { .. })
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameRecord {
	pub frame_index: u32,
	pub width: usize,
	pub height: usize,
	pub valid_disparity_pixels: usize,
	pub valid_depth_pixels: usize,
	pub depth_range: Option<(f32, f32)>,
	pub evaluation: EvaluationOutcome,
}

/// Everything one frame produced.
#[derive(Clone, Debug)]
pub struct FrameOutput {
	pub record: FrameRecord,
	pub disparity: DisparityMap,
	/// Stabilized when a stabilizer was supplied.
	pub depth: DepthMap,
	pub cloud: Option<PointCloud>,
}

/// The per-frame stages, built once per run.
pub struct FrameProcessor {
	estimator: DisparityEstimator,
	refiner: Box<dyn DisparityRefiner>,
	refinement: RefinementStatus,
	rig: StereoRig,
	ground_truth: GroundTruthKind,
	depth_clip: Option<DepthClip>,
	evaluate: bool,
	point_cloud: bool,
}

impl FrameProcessor {
	pub fn new(config: &PipelineConfig) -> StereoResult<Self> {
		config.validate()?;
		let estimator = DisparityEstimator::new(config.matcher.clone())?;
		let (refiner, refinement) = select_refiner(config.refinement.enabled, &config.refinement.wls);
		Ok(Self {
			estimator,
			refiner,
			refinement,
			rig: config.rig,
			ground_truth: config.ground_truth,
			depth_clip: config.depth_clip,
			evaluate: config.evaluate,
			point_cloud: config.export_point_cloud,
		})
	}

	pub fn refinement_status(&self) -> RefinementStatus {
		self.refinement
	}

	/// Run one frame through matching, refinement, conversion, optional
	/// stabilization, projection and evaluation.
	pub fn process(
		&self,
		pair: &StereoFramePair,
		ground_truth: Option<&DepthMap>,
		stabilizer: Option<&mut TemporalStabilizer>,
	) -> StereoResult<FrameOutput> {
		let (rows, cols) = pair.dim();
		let (left, right) = pair.to_luma();

		let started = Instant::now();
		let matched = self
			.estimator
			.estimate(&left, &right, self.refiner.wants_right_view())?;
		tracing::debug!(
			"frame {}: matched in {:.0?}, {} valid disparities",
			pair.index,
			started.elapsed(),
			matched.left.valid_count()
		);

		let started = Instant::now();
		let floor = self.estimator.params().validity_floor;
		let refined = self.refiner.refine(&matched.left, &left, matched.right.as_ref())?;
		let disparity = DisparityMap::new(refined.into_values(), floor);
		tracing::debug!("frame {}: {} refine in {:.0?}", pair.index, self.refiner.name(), started.elapsed());

		let mut depth = disparity_to_depth(&disparity, &self.rig, floor);
		if let Some(clip) = self.depth_clip {
			clip_depth(&mut depth, clip.min, clip.max);
		}
		if let Some(stabilizer) = stabilizer {
			depth = stabilizer.apply(pair.index, &depth)?;
		}

		let cloud = if self.point_cloud {
			Some(project(&depth, &self.rig, Some(&pair.left_rgb()))?)
		} else {
			None
		};

		let evaluation = if !self.evaluate {
			EvaluationOutcome::Disabled
		} else {
			match ground_truth {
				None => EvaluationOutcome::Skipped,
				Some(gt) => {
					let planar = match self.ground_truth {
						GroundTruthKind::DistanceToCamera => distance_to_planar_depth(gt, &self.rig),
						GroundTruthKind::PlanarDepth => gt.clone(),
					};
					match evaluate(&depth, &planar)? {
						Some(metrics) => EvaluationOutcome::Scored { metrics },
						None => EvaluationOutcome::Undefined,
					}
				}
			}
		};

		let record = FrameRecord {
			frame_index: pair.index,
			width: cols,
			height: rows,
			valid_disparity_pixels: disparity.valid_count(),
			valid_depth_pixels: depth.valid_count(),
			depth_range: depth.valid_range(),
			evaluation,
		};

		Ok(FrameOutput {
			record,
			disparity,
			depth,
			cloud,
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	/// Missing or unreadable input artifacts.
	Skipped,
	/// Processing or persistence failed.
	Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FrameFailure {
	pub frame_index: u32,
	pub kind: FailureKind,
	pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
	pub input_dir: PathBuf,
	pub output_dir: PathBuf,
	pub attempted: usize,
	pub succeeded: usize,
	pub skipped: usize,
	pub failed: usize,
	pub evaluated: usize,
	pub evaluation_skipped: usize,
	pub evaluation_undefined: usize,
	pub refinement: RefinementStatus,
	pub temporal_alpha: Option<f32>,
	pub failures: Vec<FrameFailure>,
	pub aggregate: Option<AggregateMetrics>,
	pub elapsed_secs: f64,
}

impl RunReport {
	/// At least one frame made it through the whole pipeline.
	pub fn is_success(&self) -> bool {
		self.succeeded > 0
	}

	fn fail(&mut self, frame_index: u32, kind: FailureKind, err: &StereoError) {
		match kind {
			FailureKind::Skipped => {
				tracing::warn!("Skipping frame {}: {}", frame_index, err);
				self.skipped += 1;
			}
			FailureKind::Failed => {
				tracing::warn!("Frame {} failed: {}", frame_index, err);
				self.failed += 1;
			}
		}
		self.failures.push(FrameFailure {
			frame_index,
			kind,
			reason: err.to_string(),
		});
	}
}

fn with_retries<T>(
	retries: u32,
	what: &str,
	frame_index: u32,
	mut op: impl FnMut() -> StereoResult<T>,
) -> StereoResult<T> {
	let mut attempt = 0;
	loop {
		match op() {
			Err(e) if e.is_retryable() && attempt < retries => {
				attempt += 1;
				tracing::warn!(
					"{} frame {} failed ({}), retry {}/{}",
					what,
					frame_index,
					e,
					attempt,
					retries
				);
			}
			result => return result,
		}
	}
}

fn persist(writer: &OutputWriter, config: &PipelineConfig, output: &FrameOutput) -> StereoResult<()> {
	let index = output.record.frame_index;
	if config.visualize {
		writer.write_disparity_visualization(index, &output.disparity)?;
		writer.write_depth_visualization(index, &output.depth)?;
	}
	if config.export_raw_depth {
		writer.write_raw_depth(index, &output.depth)?;
	}
	if let Some(ref cloud) = output.cloud {
		writer.write_point_cloud(index, cloud)?;
	}
	if output.record.evaluation.has_ground_truth() {
		writer.write_frame_record(index, &output.record)?;
	}
	Ok(())
}

/// Process every frame of a capture directory in increasing index order.
///
/// Configuration problems, a missing input directory, or one holding no
/// frames abort before any frame runs. Per-frame problems are recorded in the
/// returned report and never stop the run.
pub fn run(config: &PipelineConfig, progress_cb: Option<ProgressCallback>) -> StereoResult<RunReport> {
	let started = Instant::now();
	let processor = FrameProcessor::new(config)?;

	let loader = FrameLoader::open(&config.input_dir, config.layout.clone())?;
	let mut indices = loader.frame_indices()?;
	if indices.is_empty() {
		return Err(StereoError::NoFrames(config.input_dir.clone()));
	}
	if let Some(limit) = config.frame_limit {
		indices.truncate(limit);
	}

	let writer = OutputWriter::create(&config.output_dir, config.visualization_encoding)?;
	writer.write_root_json(CONFIG_FILE, config)?;

	let mut stabilizer = if config.temporal.enabled {
		Some(TemporalStabilizer::new(config.temporal.alpha)?)
	} else {
		None
	};

	tracing::info!(
		"Processing {} frames from {:?} (refinement {:?}, temporal smoothing {})",
		indices.len(),
		config.input_dir,
		processor.refinement_status(),
		stabilizer
			.as_ref()
			.map_or_else(|| "off".to_string(), |s| format!("alpha={}", s.alpha()))
	);

	let mut report = RunReport {
		input_dir: config.input_dir.clone(),
		output_dir: config.output_dir.clone(),
		attempted: 0,
		succeeded: 0,
		skipped: 0,
		failed: 0,
		evaluated: 0,
		evaluation_skipped: 0,
		evaluation_undefined: 0,
		refinement: processor.refinement_status(),
		temporal_alpha: stabilizer.as_ref().map(|s| s.alpha()),
		failures: Vec::new(),
		aggregate: None,
		elapsed_secs: 0.0,
	};
	let mut accumulator = MetricsAccumulator::new();
	let total = indices.len();

	for (position, &index) in indices.iter().enumerate() {
		if let Some(ref cb) = progress_cb {
			cb(FrameProgress::new(position, total, index, "loading"));
		}
		report.attempted += 1;

		let frame = match with_retries(config.io_retries, "Loading", index, || {
			loader.load(index, config.evaluate)
		}) {
			Ok(frame) => frame,
			// Frames that still cannot be read after retrying are input errors.
			Err(e) => {
				report.fail(index, FailureKind::Skipped, &e);
				continue;
			}
		};

		if let Some(ref cb) = progress_cb {
			cb(FrameProgress::new(position, total, index, "processing"));
		}
		let output = match processor.process(&frame.pair, frame.ground_truth.as_ref(), stabilizer.as_mut()) {
			Ok(output) => output,
			Err(e) => {
				report.fail(index, FailureKind::Failed, &e);
				continue;
			}
		};

		if let Err(e) = with_retries(config.io_retries, "Saving", index, || {
			persist(&writer, config, &output)
		}) {
			report.fail(index, FailureKind::Failed, &e);
			continue;
		}

		report.succeeded += 1;
		match &output.record.evaluation {
			EvaluationOutcome::Scored { metrics } => {
				report.evaluated += 1;
				accumulator.push(Some(metrics));
				tracing::info!(
					"Frame {}: {} valid depth pixels, abs_rel={:.4} rmse={:.4} delta1={:.3}",
					index,
					output.record.valid_depth_pixels,
					metrics.abs_rel,
					metrics.rmse,
					metrics.delta1
				);
			}
			EvaluationOutcome::Undefined => {
				report.evaluation_undefined += 1;
				tracing::info!("Frame {}: no pixel valid in both estimate and ground truth", index);
			}
			EvaluationOutcome::Skipped => {
				report.evaluation_skipped += 1;
				tracing::info!("Frame {}: no ground truth, evaluation skipped", index);
			}
			EvaluationOutcome::Disabled => {
				tracing::info!("Frame {}: {} valid depth pixels", index, output.record.valid_depth_pixels);
			}
		}

		if let Some(ref cb) = progress_cb {
			cb(FrameProgress::new(position + 1, total, index, "complete"));
		}
	}

	report.aggregate = accumulator.finish();
	report.elapsed_secs = started.elapsed().as_secs_f64();
	writer.write_root_json(SUMMARY_FILE, &report)?;

	tracing::info!(
		"Attempted {}, succeeded {}, skipped {}, failed {}, evaluated {}",
		report.attempted,
		report.succeeded,
		report.skipped,
		report.failed,
		report.evaluated
	);
	if let Some(ref agg) = report.aggregate {
		tracing::info!(
			"Mean over {} frames: mae={:.4} rmse={:.4} abs_rel={:.4} delta1={:.3}",
			agg.frames,
			agg.mae,
			agg.rmse,
			agg.abs_rel,
			agg.delta1
		);
	}

	Ok(report)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::disparity::tests::shifted_pair;
	use crate::disparity::SgbmParams;
	use crate::frame::INVALID_DISPARITY;
	use approx::assert_relative_eq;
	use image::DynamicImage;

	fn config() -> PipelineConfig {
		PipelineConfig {
			rig: StereoRig::new(100.0, 0.5),
			matcher: SgbmParams {
				min_disparity: 0,
				num_disparities: 32,
				speckle_window_size: 20,
				..SgbmParams::default()
			},
			ground_truth: GroundTruthKind::PlanarDepth,
			..PipelineConfig::default()
		}
	}

	fn pair(index: u32, shift: u32) -> StereoFramePair {
		let (left, right) = shifted_pair(96, 48, shift);
		StereoFramePair::new(index, DynamicImage::ImageLuma8(left), DynamicImage::ImageLuma8(right)).unwrap()
	}

	#[test]
	fn scores_against_true_depth() {
		let processor = FrameProcessor::new(&config()).unwrap();
		// f * B / 10 px = 5 m
		let gt = DepthMap::filled(48, 96, Some(5.0));
		let out = processor.process(&pair(0, 10), Some(&gt), None).unwrap();

		assert_eq!(out.record.frame_index, 0);
		assert_eq!((out.record.height, out.record.width), (48, 96));
		let metrics = out.record.evaluation.metrics().unwrap();
		assert!(metrics.valid_pixels > 48 * 40);
		assert!(metrics.delta1 > 0.8, "delta1 = {}", metrics.delta1);
		assert!(out.cloud.is_none());
	}

	#[test]
	fn evaluation_outcomes() {
		let processor = FrameProcessor::new(&config()).unwrap();
		let out = processor.process(&pair(0, 10), None, None).unwrap();
		assert_eq!(out.record.evaluation, EvaluationOutcome::Skipped);

		let empty_gt = DepthMap::filled(48, 96, None);
		let out = processor.process(&pair(1, 10), Some(&empty_gt), None).unwrap();
		assert_eq!(out.record.evaluation, EvaluationOutcome::Undefined);

		let processor = FrameProcessor::new(&PipelineConfig {
			evaluate: false,
			..config()
		})
		.unwrap();
		let gt = DepthMap::filled(48, 96, Some(5.0));
		let out = processor.process(&pair(2, 10), Some(&gt), None).unwrap();
		assert_eq!(out.record.evaluation, EvaluationOutcome::Disabled);
	}

	#[test]
	fn stabilizer_state_advances_with_frames() {
		let processor = FrameProcessor::new(&config()).unwrap();
		let mut stabilizer = TemporalStabilizer::new(0.5).unwrap();
		let first = processor.process(&pair(0, 10), None, Some(&mut stabilizer)).unwrap();
		assert_eq!(stabilizer.state(), Some(&first.depth));

		processor.process(&pair(1, 10), None, Some(&mut stabilizer)).unwrap();
		assert_eq!(stabilizer.frames_seen(), 2);
		let err = processor.process(&pair(1, 10), None, Some(&mut stabilizer)).unwrap_err();
		assert!(matches!(err, StereoError::OutOfOrder { .. }));
	}

	#[test]
	fn point_cloud_is_colored_from_left_image() {
		let processor = FrameProcessor::new(&PipelineConfig {
			export_point_cloud: true,
			..config()
		})
		.unwrap();
		let out = processor.process(&pair(0, 10), None, None).unwrap();
		let cloud = out.cloud.unwrap();
		assert_eq!(cloud.len(), out.depth.valid_count());
		assert_eq!(cloud.colors.as_ref().map(Vec::len), Some(cloud.len()));
		for (&(v, u), p) in cloud.pixels.iter().zip(&cloud.points) {
			assert_eq!(Some(p[2]), out.depth.get(v as usize, u as usize));
		}
	}

	#[test]
	fn depth_clip_invalidates_far_pixels() {
		let processor = FrameProcessor::new(&PipelineConfig {
			depth_clip: Some(DepthClip { min: 0.1, max: 4.0 }),
			..config()
		})
		.unwrap();
		let out = processor.process(&pair(0, 10), None, None).unwrap();
		assert!(out.depth.values().iter().flatten().all(|&z| z <= 4.0));
	}

	#[test]
	fn invalid_config_fails_before_processing() {
		let mut bad = config();
		bad.matcher.num_disparities = 20;
		assert!(matches!(FrameProcessor::new(&bad), Err(StereoError::Config(_))));
	}

	#[test]
	fn retries_only_retryable_errors() {
		let mut calls = 0;
		let result: StereoResult<()> = with_retries(2, "Loading", 0, || {
			calls += 1;
			Err(StereoError::Io(std::io::Error::other("flaky")))
		});
		assert!(result.is_err());
		assert_eq!(calls, 3);

		let mut calls = 0;
		let result: StereoResult<()> = with_retries(2, "Loading", 0, || {
			calls += 1;
			Err(StereoError::Input("bad".to_string()))
		});
		assert!(result.is_err());
		assert_eq!(calls, 1);

		let mut calls = 0;
		let result = with_retries(3, "Saving", 0, || {
			calls += 1;
			if calls < 2 {
				Err(StereoError::Io(std::io::Error::other("flaky")))
			} else {
				Ok(calls)
			}
		});
		assert_eq!(result.unwrap(), 2);
	}

	#[test]
	fn refined_disparity_respects_validity_floor() {
		let mut cfg = config();
		cfg.refinement.enabled = true;
		cfg.matcher.validity_floor = 9.5;
		let processor = FrameProcessor::new(&cfg).unwrap();
		let out = processor.process(&pair(0, 10), None, None).unwrap();

		assert!(out.disparity.values().iter().all(|&d| d == INVALID_DISPARITY || d > 9.5));
		let above = out.disparity.values().iter().filter(|&&d| d > 9.5).count();
		assert_eq!(out.record.valid_disparity_pixels, above);
	}

	#[test]
	fn unreadable_frames_are_retried() {
		let dir = tempfile::tempdir().unwrap();
		let rgb = dir.path().join("RenderProduct_Replicator/rgb");
		std::fs::create_dir_all(rgb.join("rgb_0000.png")).unwrap();
		let right = dir.path().join("RenderProduct_Replicator_01/rgb");
		std::fs::create_dir_all(&right).unwrap();
		let (_, img) = shifted_pair(16, 8, 2);
		img.save(right.join("rgb_0000.png")).unwrap();

		let loader = FrameLoader::open(dir.path(), Default::default()).unwrap();
		let mut calls = 0;
		let result = with_retries(2, "Loading", 0, || {
			calls += 1;
			loader.load(0, false)
		});
		assert!(result.unwrap_err().is_retryable());
		assert_eq!(calls, 3);
	}

	#[test]
	fn progress_percent() {
		let p = FrameProgress::new(1, 4, 9, "complete");
		assert_relative_eq!(p.percent, 25.0);
		assert_eq!(FrameProgress::new(0, 0, 0, "loading").percent, 0.0);
	}
}
