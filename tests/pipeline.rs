mod common;

use common::synthetic_capture::{SyntheticCapture, BASELINE_M, FOCAL_PX, HEIGHT, TRUE_DEPTH_M, WIDTH};
use ndarray::Array2;
use std::path::Path;
use std::sync::{Arc, Mutex};
use stereo_depth::{
	run, FrameProgress, PipelineConfig, RefinementStatus, SgbmParams, StereoError, StereoRig,
};
use tempfile::tempdir;

fn config(input: &Path, output: &Path) -> PipelineConfig {
	PipelineConfig {
		input_dir: input.to_path_buf(),
		output_dir: output.to_path_buf(),
		rig: StereoRig::new(FOCAL_PX, BASELINE_M),
		matcher: SgbmParams {
			min_disparity: 0,
			num_disparities: 32,
			speckle_window_size: 20,
			..SgbmParams::default()
		},
		..PipelineConfig::default()
	}
}

#[test]
fn full_run_evaluates_frames_with_ground_truth() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(0);
	capture.write_frame(1);
	capture.write_left(2);
	capture.write_right(2);
	let out = dir.path().join("out");

	let mut cfg = config(&capture.root, &out);
	cfg.visualize = true;
	cfg.export_point_cloud = true;
	cfg.temporal.enabled = true;
	cfg.temporal.alpha = 0.5;

	let report = run(&cfg, None).unwrap();
	assert!(report.is_success());
	assert_eq!(report.attempted, 3);
	assert_eq!(report.succeeded, 3);
	assert_eq!(report.skipped, 0);
	assert_eq!(report.failed, 0);
	assert_eq!(report.evaluated, 2);
	assert_eq!(report.evaluation_skipped, 1);
	assert_eq!(report.evaluation_undefined, 0);
	assert_eq!(report.refinement, RefinementStatus::Disabled);
	assert_eq!(report.temporal_alpha, Some(0.5));

	let agg = report.aggregate.unwrap();
	assert_eq!(agg.frames, 2);
	assert!(agg.delta1 > 0.8, "delta1 = {}", agg.delta1);
	assert!(agg.abs_rel < 0.1, "abs_rel = {}", agg.abs_rel);

	for rel in [
		"summary.json",
		"config.json",
		"disparity/frame_0000.png",
		"depth/frame_0001.png",
		"depth_raw/frame_0002.npy",
		"clouds/frame_0000.ply",
		"metrics/frame_0000.json",
		"metrics/frame_0001.json",
	] {
		assert!(out.join(rel).exists(), "missing {}", rel);
	}
	assert!(!out.join("metrics/frame_0002.json").exists());

	let raw: Array2<f32> = ndarray_npy::read_npy(out.join("depth_raw/frame_0000.npy")).unwrap();
	assert_eq!(raw.dim(), (HEIGHT as usize, WIDTH as usize));
	let row = raw.row(HEIGHT as usize / 2);
	let close = (20..WIDTH as usize - 8)
		.filter(|&x| (row[x] - TRUE_DEPTH_M).abs() < 0.5)
		.count();
	assert!(close > (WIDTH as usize - 28) * 8 / 10, "{} pixels near the plane", close);

	let summary: serde_json::Value =
		serde_json::from_str(&std::fs::read_to_string(out.join("summary.json")).unwrap()).unwrap();
	assert_eq!(summary["attempted"], 3);
	assert_eq!(summary["evaluated"], 2);
	assert_eq!(summary["refinement"], "disabled");

	let record: serde_json::Value =
		serde_json::from_str(&std::fs::read_to_string(out.join("metrics/frame_0001.json")).unwrap()).unwrap();
	assert_eq!(record["frame_index"], 1);
	assert_eq!(record["evaluation"]["status"], "scored");
	assert!(record["evaluation"]["metrics"]["delta1"].as_f64().unwrap() > 0.8);
}

#[test]
fn refinement_is_reported_active() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(0);

	let mut cfg = config(&capture.root, &dir.path().join("out"));
	cfg.refinement.enabled = true;
	let report = run(&cfg, None).unwrap();
	assert_eq!(report.succeeded, 1);
	if cfg!(feature = "wls") {
		assert_eq!(report.refinement, RefinementStatus::Active);
	} else {
		assert_eq!(report.refinement, RefinementStatus::Unavailable);
	}
	assert!(report.aggregate.unwrap().delta1 > 0.8);
}

#[test]
fn missing_right_image_skips_only_that_frame() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(0);
	capture.write_left(1);
	capture.write_frame(2);

	let report = run(&config(&capture.root, &dir.path().join("out")), None).unwrap();
	assert_eq!(report.attempted, 3);
	assert_eq!(report.succeeded, 2);
	assert_eq!(report.skipped, 1);
	assert_eq!(report.failed, 0);
	assert_eq!(report.failures.len(), 1);
	assert_eq!(report.failures[0].frame_index, 1);
	assert!(report.is_success());
}

#[test]
fn unreadable_frame_is_skipped_after_retries() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(0);
	capture.write_right(1);
	std::fs::create_dir_all(capture.root.join("RenderProduct_Replicator/rgb/rgb_0001.png")).unwrap();

	let mut cfg = config(&capture.root, &dir.path().join("out"));
	cfg.io_retries = 1;
	let report = run(&cfg, None).unwrap();
	assert_eq!(report.attempted, 2);
	assert_eq!(report.succeeded, 1);
	assert_eq!(report.skipped, 1);
	assert_eq!(report.failed, 0);
	assert_eq!(report.failures[0].frame_index, 1);
}

#[test]
fn run_with_every_frame_skipped_is_not_a_success() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_left(0);
	capture.write_left(1);

	let report = run(&config(&capture.root, &dir.path().join("out")), None).unwrap();
	assert_eq!(report.attempted, 2);
	assert_eq!(report.skipped, 2);
	assert!(!report.is_success());
}

#[test]
fn frames_without_overlap_are_excluded_from_aggregate() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(0);
	capture.write_left(1);
	capture.write_right(1);
	capture.write_depth_array(1, &Array2::zeros((HEIGHT as usize, WIDTH as usize)));

	let report = run(&config(&capture.root, &dir.path().join("out")), None).unwrap();
	assert_eq!(report.succeeded, 2);
	assert_eq!(report.evaluated, 1);
	assert_eq!(report.evaluation_undefined, 1);
	assert_eq!(report.aggregate.unwrap().frames, 1);
}

#[test]
fn evaluation_can_be_disabled() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(0);
	let out = dir.path().join("out");

	let mut cfg = config(&capture.root, &out);
	cfg.evaluate = false;
	let report = run(&cfg, None).unwrap();
	assert_eq!(report.succeeded, 1);
	assert_eq!(report.evaluated, 0);
	assert_eq!(report.evaluation_skipped, 0);
	assert!(report.aggregate.is_none());
	assert!(!out.join("metrics").exists());
}

#[test]
fn frame_limit_stops_early() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	for i in 0..4 {
		capture.write_frame(i);
	}

	let mut cfg = config(&capture.root, &dir.path().join("out"));
	cfg.frame_limit = Some(2);
	cfg.temporal.enabled = true;
	let report = run(&cfg, None).unwrap();
	assert_eq!(report.attempted, 2);
	assert_eq!(report.succeeded, 2);
}

#[test]
fn progress_reports_every_frame() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(3);
	capture.write_frame(7);

	let seen: Arc<Mutex<Vec<FrameProgress>>> = Arc::new(Mutex::new(Vec::new()));
	let sink = Arc::clone(&seen);
	let report = run(
		&config(&capture.root, &dir.path().join("out")),
		Some(Box::new(move |p: FrameProgress| sink.lock().unwrap().push(p))),
	)
	.unwrap();
	assert_eq!(report.succeeded, 2);

	let seen = seen.lock().unwrap();
	let completed: Vec<(usize, u32)> = seen
		.iter()
		.filter(|p| p.stage == "complete")
		.map(|p| (p.current, p.frame_index))
		.collect();
	assert_eq!(completed, vec![(1, 3), (2, 7)]);
	assert_eq!(seen.last().unwrap().percent, 100.0);
}

#[test]
fn missing_input_directory_is_fatal() {
	let dir = tempdir().unwrap();
	let cfg = config(&dir.path().join("nope"), &dir.path().join("out"));
	assert!(matches!(run(&cfg, None), Err(StereoError::NotFound(_))));
}

#[test]
fn empty_input_directory_is_fatal() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	let cfg = config(&capture.root, &dir.path().join("out"));
	assert!(matches!(run(&cfg, None), Err(StereoError::NoFrames(_))));
}

#[test]
fn invalid_config_aborts_before_output() {
	let dir = tempdir().unwrap();
	let capture = SyntheticCapture::new(&dir.path().join("capture"));
	capture.write_frame(0);
	let out = dir.path().join("out");

	let mut cfg = config(&capture.root, &out);
	cfg.matcher.num_disparities = 30;
	assert!(matches!(run(&cfg, None), Err(StereoError::Config(_))));
	assert!(!out.exists());
}
