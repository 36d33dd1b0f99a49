//! Per-frame data: the stereo pair and the dense maps derived from it.
//!
//! Invalid pixels are explicit. A [`DisparityMap`] marks them with
//! [`INVALID_DISPARITY`]; a [`DepthMap`] stores `None`.

use crate::error::{StereoError, StereoResult};
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array2;

/// Sentinel for pixels without a usable match.
pub const INVALID_DISPARITY: f32 = 0.0;

/// A rectified left/right image pair captured at one instant.
#[derive(Clone, Debug)]
pub struct StereoFramePair {
	pub index: u32,
	pub left: DynamicImage,
	pub right: DynamicImage,
}

impl StereoFramePair {
	pub fn new(index: u32, left: DynamicImage, right: DynamicImage) -> StereoResult<Self> {
		if left.width() != right.width() || left.height() != right.height() {
			return Err(StereoError::Input(format!(
				"frame {}: left is {}x{} but right is {}x{}",
				index,
				left.width(),
				left.height(),
				right.width(),
				right.height()
			)));
		}
		if left.width() == 0 || left.height() == 0 {
			return Err(StereoError::Input(format!("frame {}: empty images", index)));
		}
		Ok(Self { index, left, right })
	}

	pub fn width(&self) -> usize {
		self.left.width() as usize
	}

	pub fn height(&self) -> usize {
		self.left.height() as usize
	}

	/// `(rows, cols)`, the shape of every map derived from this pair.
	pub fn dim(&self) -> (usize, usize) {
		(self.height(), self.width())
	}

	pub fn to_luma(&self) -> (GrayImage, GrayImage) {
		(self.left.to_luma8(), self.right.to_luma8())
	}

	pub fn left_rgb(&self) -> RgbImage {
		self.left.to_rgb8()
	}
}

/// Horizontal pixel shift between matching left and right pixels, indexed
/// `[row, col]` in left-image coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct DisparityMap {
	values: Array2<f32>,
}

impl DisparityMap {
	/// Wrap raw values, invalidating anything non-finite or at/below `floor`.
	pub fn new(mut values: Array2<f32>, floor: f32) -> Self {
		let floor = floor.max(INVALID_DISPARITY);
		values.mapv_inplace(|d| if d.is_finite() && d > floor { d } else { INVALID_DISPARITY });
		Self { values }
	}

	pub fn invalid(rows: usize, cols: usize) -> Self {
		Self {
			values: Array2::from_elem((rows, cols), INVALID_DISPARITY),
		}
	}

	pub fn dim(&self) -> (usize, usize) {
		self.values.dim()
	}

	pub fn get(&self, row: usize, col: usize) -> Option<f32> {
		self.values
			.get((row, col))
			.copied()
			.filter(|&d| d > INVALID_DISPARITY)
	}

	pub fn values(&self) -> &Array2<f32> {
		&self.values
	}

	pub fn into_values(self) -> Array2<f32> {
		self.values
	}

	pub fn valid_count(&self) -> usize {
		self.values.iter().filter(|&&d| d > INVALID_DISPARITY).count()
	}

	/// `(min, max)` over valid pixels.
	pub fn valid_range(&self) -> Option<(f32, f32)> {
		valid_range(self.values.iter().copied().filter(|&d| d > INVALID_DISPARITY))
	}
}

/// Metric depth in meters along the optical axis.
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
	values: Array2<Option<f32>>,
}

impl DepthMap {
	pub fn new(values: Array2<Option<f32>>) -> Self {
		Self { values }
	}

	/// Interpret a raw float array: non-finite or non-positive entries are
	/// invalid.
	pub fn from_raw(raw: &Array2<f32>) -> Self {
		Self {
			values: raw.mapv(|z| (z.is_finite() && z > 0.0).then_some(z)),
		}
	}

	pub fn filled(rows: usize, cols: usize, depth: Option<f32>) -> Self {
		Self {
			values: Array2::from_elem((rows, cols), depth),
		}
	}

	pub fn dim(&self) -> (usize, usize) {
		self.values.dim()
	}

	pub fn get(&self, row: usize, col: usize) -> Option<f32> {
		self.values.get((row, col)).copied().flatten()
	}

	pub fn values(&self) -> &Array2<Option<f32>> {
		&self.values
	}

	pub fn values_mut(&mut self) -> &mut Array2<Option<f32>> {
		&mut self.values
	}

	/// Dense float copy with `sentinel` at invalid pixels.
	pub fn to_raw(&self, sentinel: f32) -> Array2<f32> {
		self.values.mapv(|z| z.unwrap_or(sentinel))
	}

	pub fn valid_count(&self) -> usize {
		self.values.iter().filter(|z| z.is_some()).count()
	}

	pub fn valid_range(&self) -> Option<(f32, f32)> {
		valid_range(self.values.iter().flatten().copied())
	}

	pub(crate) fn ensure_same_shape(&self, other: &DepthMap, what: &str) -> StereoResult<()> {
		if self.dim() != other.dim() {
			return Err(StereoError::Shape(format!(
				"{}: {:?} vs {:?}",
				what,
				self.dim(),
				other.dim()
			)));
		}
		Ok(())
	}
}

fn valid_range(values: impl Iterator<Item = f32>) -> Option<(f32, f32)> {
	values.fold(None, |acc, v| match acc {
		None => Some((v, v)),
		Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
	})
}
