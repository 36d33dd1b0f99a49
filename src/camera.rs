//! Stereo rig calibration constants.
//!
//! Focal length and baseline are pipeline-level constants: every frame of a
//! run shares them, so they live in configuration rather than on the frame.

use crate::disparity::DISP_SCALE;
use crate::error::{StereoError, StereoResult};
use serde::{Deserialize, Serialize};

/// Disparity levels the matcher searches must come in blocks of this size.
pub const DISPARITY_ALIGNMENT: usize = 16;

/// Margins (px) added below the far disparity and above the near disparity
/// when planning a search range.
const FAR_MARGIN_PX: i32 = 10;
const NEAR_MARGIN_PX: i32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StereoRig {
	/// Focal length in pixels (rectified, shared by both cameras).
	pub focal_length_px: f32,
	/// Distance between the camera centres in meters.
	pub baseline_m: f32,
	/// Principal point `(cx, cy)` in pixels; image centre when absent.
	#[serde(default)]
	pub principal_point: Option<(f32, f32)>,
}

impl Default for StereoRig {
	fn default() -> Self {
		// 3.5 mm lens on a 6.912 mm wide sensor imaged at 1920 px, 120 mm apart.
		Self::from_sensor(3.5, 6.912, 1920, 0.12)
	}
}

impl StereoRig {
	pub fn new(focal_length_px: f32, baseline_m: f32) -> Self {
		Self {
			focal_length_px,
			baseline_m,
			principal_point: None,
		}
	}

	/// Build a rig from physical lens/sensor geometry.
	pub fn from_sensor(
		focal_length_mm: f32,
		horizontal_aperture_mm: f32,
		image_width_px: u32,
		baseline_m: f32,
	) -> Self {
		let pixel_pitch_mm = horizontal_aperture_mm / image_width_px as f32;
		Self::new(focal_length_mm / pixel_pitch_mm, baseline_m)
	}

	pub fn with_principal_point(mut self, cx: f32, cy: f32) -> Self {
		self.principal_point = Some((cx, cy));
		self
	}

	pub fn validate(&self) -> StereoResult<()> {
		if !(self.focal_length_px.is_finite() && self.focal_length_px > 0.0) {
			return Err(StereoError::Config(format!(
				"focal length must be a positive number of pixels, got {}",
				self.focal_length_px
			)));
		}
		if !(self.baseline_m.is_finite() && self.baseline_m > 0.0) {
			return Err(StereoError::Config(format!(
				"baseline must be a positive number of meters, got {}",
				self.baseline_m
			)));
		}
		if let Some((cx, cy)) = self.principal_point {
			if !cx.is_finite() || !cy.is_finite() {
				return Err(StereoError::Config("principal point must be finite".to_string()));
			}
		}
		Ok(())
	}

	/// `f * B`, the numerator of the pinhole stereo relation.
	pub fn depth_scale(&self) -> f32 {
		self.focal_length_px * self.baseline_m
	}

	/// Principal point for an image of the given size, falling back to the
	/// centre of the pixel grid.
	pub fn principal_point_for(&self, width: usize, height: usize) -> (f32, f32) {
		self.principal_point.unwrap_or((
			(width as f32 - 1.0) / 2.0,
			(height as f32 - 1.0) / 2.0,
		))
	}

	pub fn disparity_at(&self, depth_m: f32) -> f32 {
		self.depth_scale() / depth_m
	}

	/// Disparity search window `(min_disparity, num_disparities)` covering a
	/// working range from `near_m` to `far_m`.
	pub fn search_range(&self, near_m: f32, far_m: f32) -> StereoResult<(i32, usize)> {
		if !(near_m > 0.0 && far_m > near_m) {
			return Err(StereoError::Config(format!(
				"working range must satisfy 0 < near < far, got {} .. {}",
				near_m, far_m
			)));
		}
		let min = self.disparity_at(far_m).floor() as i64 - FAR_MARGIN_PX as i64;
		let max = self.disparity_at(near_m).floor() as i64 + NEAR_MARGIN_PX as i64;
		let span = (max - min).max(1);
		let count = (span as u64).div_ceil(DISPARITY_ALIGNMENT as u64) as i64 * DISPARITY_ALIGNMENT as i64;

		// The matcher reports disparities as i16 in 1/DISP_SCALE pixel steps.
		let limit = i16::MAX as i64 / DISP_SCALE as i64;
		if min + count > limit || min - 1 < i16::MIN as i64 / DISP_SCALE as i64 {
			return Err(StereoError::Config(format!(
				"working range {} .. {} m needs disparities {} .. {} px, beyond the matcher's {} px limit",
				near_m, far_m, min, min + count, limit
			)));
		}
		Ok((min as i32, count as usize))
	}
}
