//! Edge-aware disparity refinement.
//!
//! The refiner is picked once per run by [`select_refiner`]. When the `wls`
//! feature is compiled out, a requested refinement degrades to
//! [`Passthrough`] and the run records it as unavailable.

use crate::error::{StereoError, StereoResult};
use crate::frame::DisparityMap;
use image::GrayImage;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WlsParams {
	/// Regularization weight. Larger values smooth more.
	pub lambda: f32,
	/// Guide-intensity difference (0..255 scale) over which smoothing decays
	/// by `1/e`. Smaller values hold edges harder.
	pub sigma_color: f32,
	/// Max left/right disagreement (px) for a pixel to count as confident.
	pub lrc_threshold: f32,
	pub iterations: usize,
}

impl Default for WlsParams {
	fn default() -> Self {
		Self {
			lambda: 8000.0,
			sigma_color: 1.5,
			lrc_threshold: 1.5,
			iterations: 3,
		}
	}
}

impl WlsParams {
	pub fn validate(&self) -> StereoResult<()> {
		if !(self.lambda.is_finite() && self.lambda > 0.0) {
			return Err(StereoError::Config(format!("WLS lambda must be positive, got {}", self.lambda)));
		}
		if !(self.sigma_color.is_finite() && self.sigma_color > 0.0) {
			return Err(StereoError::Config(format!(
				"WLS sigma_color must be positive, got {}",
				self.sigma_color
			)));
		}
		if !(self.lrc_threshold.is_finite() && self.lrc_threshold >= 0.0) {
			return Err(StereoError::Config(format!(
				"WLS lrc_threshold must be non-negative, got {}",
				self.lrc_threshold
			)));
		}
		if self.iterations == 0 {
			return Err(StereoError::Config("WLS needs at least one iteration".to_string()));
		}
		Ok(())
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStatus {
	Disabled,
	Active,
	/// Requested, but this build has no refinement backend.
	Unavailable,
}

pub trait DisparityRefiner: Send + Sync {
	fn name(&self) -> &'static str;

	/// Whether [`refine`](Self::refine) makes use of a right-view map.
	fn wants_right_view(&self) -> bool {
		false
	}

	fn refine(
		&self,
		disparity: &DisparityMap,
		guide: &GrayImage,
		right: Option<&DisparityMap>,
	) -> StereoResult<DisparityMap>;
}

/// Returns the input unchanged.
pub struct Passthrough;

impl DisparityRefiner for Passthrough {
	fn name(&self) -> &'static str {
		"passthrough"
	}

	fn refine(
		&self,
		disparity: &DisparityMap,
		_guide: &GrayImage,
		_right: Option<&DisparityMap>,
	) -> StereoResult<DisparityMap> {
		Ok(disparity.clone())
	}
}

pub fn wls_available() -> bool {
	cfg!(feature = "wls")
}

/// Resolve the refinement strategy for a run.
pub fn select_refiner(enabled: bool, params: &WlsParams) -> (Box<dyn DisparityRefiner>, RefinementStatus) {
	if !enabled {
		return (Box::new(Passthrough), RefinementStatus::Disabled);
	}

	#[cfg(feature = "wls")]
	{
		(Box::new(wls::WlsRefiner::new(params.clone())), RefinementStatus::Active)
	}

	#[cfg(not(feature = "wls"))]
	{
		let _ = params;
		tracing::warn!("Edge-aware refinement requested but not built in; disparity passes through unrefined");
		(Box::new(Passthrough), RefinementStatus::Unavailable)
	}
}

#[cfg(feature = "wls")]
pub use wls::WlsRefiner;

#[cfg(feature = "wls")]
mod wls {
	use super::{DisparityRefiner, WlsParams};
	use crate::error::{StereoError, StereoResult};
	use crate::frame::{DisparityMap, INVALID_DISPARITY};
	use image::GrayImage;
	use ndarray::{Array2, ArrayView1, ArrayViewMut1, Zip};

	/// Filtered confidence below this leaves the pixel invalid.
	const MIN_CONFIDENCE: f32 = 1e-3;

	/// Weighted-least-squares smoothing solved with the separable fast global
	/// smoother (Min et al., "Fast Global Image Smoothing Based on Weighted
	/// Least Squares"), normalized by a left/right confidence map.
	pub struct WlsRefiner {
		params: WlsParams,
		weight_table: [f32; 256],
	}

	impl WlsRefiner {
		pub fn new(params: WlsParams) -> Self {
			let weight_table = std::array::from_fn(|diff| (-(diff as f32) / params.sigma_color).exp());
			Self { params, weight_table }
		}

		fn weights(&self, guide: &GrayImage) -> (Array2<f32>, Array2<f32>) {
			let (w, h) = (guide.width() as usize, guide.height() as usize);
			let px = |x: usize, y: usize| guide.get_pixel(x as u32, y as u32)[0];
			let table = &self.weight_table;

			// horizontal[y, x] links (x, x+1); vertical[y, x] links (y, y+1).
			let horizontal = Array2::from_shape_fn((h, w), |(y, x)| {
				if x + 1 < w {
					table[px(x, y).abs_diff(px(x + 1, y)) as usize]
				} else {
					0.0
				}
			});
			let vertical = Array2::from_shape_fn((h, w), |(y, x)| {
				if y + 1 < h {
					table[px(x, y).abs_diff(px(x, y + 1)) as usize]
				} else {
					0.0
				}
			});
			(horizontal, vertical)
		}

		fn confidence(&self, disparity: &DisparityMap, right: Option<&DisparityMap>) -> Array2<f32> {
			let (h, w) = disparity.dim();
			let threshold = self.params.lrc_threshold;
			Array2::from_shape_fn((h, w), |(y, x)| {
				let Some(d) = disparity.get(y, x) else {
					return 0.0;
				};
				let Some(right) = right else {
					return 1.0;
				};
				let xr = x as i64 - d.round() as i64;
				if xr < 0 || xr >= w as i64 {
					return 0.0;
				}
				match right.get(y, xr as usize) {
					Some(dr) if (d - dr).abs() <= threshold => 1.0,
					_ => 0.0,
				}
			})
		}
	}

	impl DisparityRefiner for WlsRefiner {
		fn name(&self) -> &'static str {
			"wls"
		}

		fn wants_right_view(&self) -> bool {
			true
		}

		fn refine(
			&self,
			disparity: &DisparityMap,
			guide: &GrayImage,
			right: Option<&DisparityMap>,
		) -> StereoResult<DisparityMap> {
			let dim = disparity.dim();
			let guide_dim = (guide.height() as usize, guide.width() as usize);
			if dim != guide_dim {
				return Err(StereoError::Shape(format!(
					"disparity is {:?} but guide image is {:?}",
					dim, guide_dim
				)));
			}
			if let Some(r) = right {
				if r.dim() != dim {
					return Err(StereoError::Shape(format!(
						"right-view disparity is {:?} but left is {:?}",
						r.dim(),
						dim
					)));
				}
			}

			let (horizontal, vertical) = self.weights(guide);
			let mut confidence = self.confidence(disparity, right);
			let mut weighted = disparity.values() * &confidence;

			let iterations = self.params.iterations as i32;
			let denom = 4f32.powi(iterations) - 1.0;
			for t in 1..=iterations {
				let lambda = 1.5 * self.params.lambda * 4f32.powi(iterations - t) / denom;

				Zip::from(weighted.rows_mut())
					.and(confidence.rows_mut())
					.and(horizontal.rows())
					.par_for_each(|num, conf, w| solve_lane(num, conf, w, lambda));

				Zip::from(weighted.columns_mut())
					.and(confidence.columns_mut())
					.and(vertical.columns())
					.par_for_each(|num, conf, w| solve_lane(num, conf, w, lambda));
			}

			let refined = Zip::from(&weighted).and(&confidence).map_collect(|&num, &conf| {
				if conf > MIN_CONFIDENCE {
					num / conf
				} else {
					INVALID_DISPARITY
				}
			});
			Ok(DisparityMap::new(refined, INVALID_DISPARITY))
		}
	}

	/// Solve `(I + λ L_w) u = f` along one lane for two right-hand sides that
	/// share the system matrix (Thomas algorithm). `w[i]` links `i` and `i+1`.
	fn solve_lane(
		mut a: ArrayViewMut1<f32>,
		mut b: ArrayViewMut1<f32>,
		w: ArrayView1<f32>,
		lambda: f32,
	) {
		let n = a.len();
		if n < 2 {
			return;
		}

		let mut upper = vec![0.0f32; n];
		let mut prev_link = 0.0f32;
		let mut prev_upper = 0.0f32;
		for i in 0..n {
			let link = if i + 1 < n { lambda * w[i] } else { 0.0 };
			let diag = 1.0 + prev_link + link;
			let pivot = diag - prev_link * prev_upper;
			upper[i] = -link / pivot;
			if i > 0 {
				a[i] = (a[i] + prev_link * a[i - 1]) / pivot;
				b[i] = (b[i] + prev_link * b[i - 1]) / pivot;
			} else {
				a[i] /= pivot;
				b[i] /= pivot;
			}
			prev_upper = -upper[i];
			prev_link = link;
		}

		for i in (0..n - 1).rev() {
			a[i] -= upper[i] * a[i + 1];
			b[i] -= upper[i] * b[i + 1];
		}
	}

}
