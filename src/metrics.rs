//! Depth accuracy against ground truth.
//!
//! Only pixels valid in both maps are scored. A frame with no such pixel has
//! undefined metrics and contributes nothing to the run aggregate.

use crate::error::StereoResult;
use crate::frame::DepthMap;
use serde::{Deserialize, Serialize};

pub const DELTA_BASE: f64 = 1.25;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
	pub valid_pixels: usize,
	pub mae: f64,
	pub rmse: f64,
	pub abs_rel: f64,
	pub sq_rel: f64,
	pub rmse_log: f64,
	pub delta1: f64,
	pub delta2: f64,
	pub delta3: f64,
}

/// Score `estimate` against `ground_truth`. Returns `Ok(None)` when no pixel
/// is valid in both.
pub fn evaluate(estimate: &DepthMap, ground_truth: &DepthMap) -> StereoResult<Option<FrameMetrics>> {
	estimate.ensure_same_shape(ground_truth, "estimate vs ground truth")?;

	let mut n = 0usize;
	let mut abs = 0.0f64;
	let mut sq = 0.0f64;
	let mut abs_rel = 0.0f64;
	let mut sq_rel = 0.0f64;
	let mut sq_log = 0.0f64;
	let mut within = [0usize; 3];
	let thresholds = [DELTA_BASE, DELTA_BASE.powi(2), DELTA_BASE.powi(3)];

	for (est, gt) in estimate.values().iter().zip(ground_truth.values()) {
		let (Some(est), Some(gt)) = (*est, *gt) else { continue };
		if !(gt.is_finite() && gt > 0.0 && est.is_finite() && est > 0.0) {
			continue;
		}
		let (est, gt) = (est as f64, gt as f64);
		let diff = est - gt;

		n += 1;
		abs += diff.abs();
		sq += diff * diff;
		abs_rel += diff.abs() / gt;
		sq_rel += diff * diff / gt;
		let log_diff = est.ln() - gt.ln();
		sq_log += log_diff * log_diff;

		let ratio = (est / gt).max(gt / est);
		for (count, &t) in within.iter_mut().zip(&thresholds) {
			if ratio < t {
				*count += 1;
			}
		}
	}

	if n == 0 {
		return Ok(None);
	}

	let nf = n as f64;
	Ok(Some(FrameMetrics {
		valid_pixels: n,
		mae: abs / nf,
		rmse: (sq / nf).sqrt(),
		abs_rel: abs_rel / nf,
		sq_rel: sq_rel / nf,
		rmse_log: (sq_log / nf).sqrt(),
		delta1: within[0] as f64 / nf,
		delta2: within[1] as f64 / nf,
		delta3: within[2] as f64 / nf,
	}))
}

/// Per-metric means over the frames that produced defined metrics.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
	pub frames: usize,
	pub mae: f64,
	pub rmse: f64,
	pub abs_rel: f64,
	pub sq_rel: f64,
	pub rmse_log: f64,
	pub delta1: f64,
	pub delta2: f64,
	pub delta3: f64,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsAccumulator {
	frames: usize,
	sums: [f64; 8],
}

impl MetricsAccumulator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Undefined frames (`None`) are ignored.
	pub fn push(&mut self, metrics: Option<&FrameMetrics>) {
		let Some(m) = metrics else { return };
		let values = [
			m.mae, m.rmse, m.abs_rel, m.sq_rel, m.rmse_log, m.delta1, m.delta2, m.delta3,
		];
		for (sum, v) in self.sums.iter_mut().zip(values) {
			*sum += v;
		}
		self.frames += 1;
	}

	pub fn frames(&self) -> usize {
		self.frames
	}

	pub fn finish(&self) -> Option<AggregateMetrics> {
		if self.frames == 0 {
			return None;
		}
		let n = self.frames as f64;
		let [mae, rmse, abs_rel, sq_rel, rmse_log, delta1, delta2, delta3] = self.sums.map(|s| s / n);
		Some(AggregateMetrics {
			frames: self.frames,
			mae,
			rmse,
			abs_rel,
			sq_rel,
			rmse_log,
			delta1,
			delta2,
			delta3,
		})
	}
}
