//! Semi-global block matching on rectified grayscale pairs.
//!
//! Matching costs are computed per pixel from a clipped horizontal Sobel
//! response plus intensity, summed over a square block, then aggregated along
//! 5 or 8 scanline paths (Hirschmüller, "Stereo Processing by Semiglobal
//! Matching and Mutual Information"). The raw result is fixed-point with
//! [`DISP_SCALE`] steps per pixel; [`DisparityEstimator::estimate`] returns
//! it descaled to pixels.

use crate::camera::DISPARITY_ALIGNMENT;
use crate::error::{StereoError, StereoResult};
use crate::frame::DisparityMap;
use image::{imageops, GrayImage};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const DISP_SHIFT: u32 = 4;
pub const DISP_SCALE: i32 = 1 << DISP_SHIFT;

/// Most paths summed into one pixel's aggregated cost. Block costs are capped
/// so that this many paths still fit in `u16`.
const MAX_PATHS: u32 = 8;
/// Default penalties only fit up to 11; larger blocks need explicit P1/P2.
const MAX_BLOCK_SIZE: usize = 51;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
	/// Eight aggregation paths over two full sweeps. Slower, but keeps thin
	/// structures that the five-path variant tends to erode.
	Full,
	/// Five paths in a single forward sweep.
	Fast,
}

impl MatchMode {
	pub fn name(&self) -> &'static str {
		match self {
			MatchMode::Full => "full",
			MatchMode::Fast => "fast",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgbmParams {
	pub min_disparity: i32,
	/// Search width; a positive multiple of 16.
	pub num_disparities: usize,
	/// Odd matching window side.
	pub block_size: usize,
	pub mode: MatchMode,
	/// Penalty for a ±1 disparity change between neighbours. Defaults to `8 * block_size²`.
	pub p1: Option<u32>,
	/// Penalty for larger jumps, typically at texture edges. Defaults to `32 * block_size²`.
	pub p2: Option<u32>,
	pub pre_filter_cap: u8,
	/// Percent margin by which the best cost must beat every non-adjacent
	/// candidate.
	pub uniqueness_ratio: u32,
	/// Connected regions of at most this many pixels are treated as speckle.
	/// Zero disables the filter.
	pub speckle_window_size: usize,
	/// Max disparity step (px) between neighbours of the same region.
	pub speckle_range: u32,
	/// Max left/right disagreement in px; `None` skips the consistency check.
	pub disp12_max_diff: Option<u32>,
	/// Disparities at or below this value (px) are invalid.
	pub validity_floor: f32,
}

impl Default for SgbmParams {
	fn default() -> Self {
		Self {
			min_disparity: 48,
			num_disparities: 96,
			block_size: 5,
			mode: MatchMode::Full,
			p1: None,
			p2: None,
			pre_filter_cap: 31,
			uniqueness_ratio: 10,
			speckle_window_size: 100,
			speckle_range: 2,
			disp12_max_diff: Some(1),
			validity_floor: 0.0,
		}
	}
}

impl SgbmParams {
	pub fn penalties(&self) -> (u32, u32) {
		let area = (self.block_size * self.block_size) as u32;
		(self.p1.unwrap_or(8 * area), self.p2.unwrap_or(32 * area))
	}

	pub fn validate(&self) -> StereoResult<()> {
		if self.num_disparities == 0 || self.num_disparities % DISPARITY_ALIGNMENT != 0 {
			return Err(StereoError::Config(format!(
				"num_disparities must be a positive multiple of {}, got {}",
				DISPARITY_ALIGNMENT, self.num_disparities
			)));
		}
		if self.block_size % 2 == 0 || self.block_size > MAX_BLOCK_SIZE {
			return Err(StereoError::Config(format!(
				"block_size must be odd and at most {}, got {}",
				MAX_BLOCK_SIZE, self.block_size
			)));
		}
		let max_raw = (self.min_disparity as i64 + self.num_disparities as i64) * DISP_SCALE as i64;
		let min_raw = (self.min_disparity as i64 - 1) * DISP_SCALE as i64;
		if max_raw > i16::MAX as i64 || min_raw < i16::MIN as i64 {
			return Err(StereoError::Config(format!(
				"disparity range {}..{} does not fit the fixed-point output",
				self.min_disparity,
				self.min_disparity + self.num_disparities as i32
			)));
		}
		let (p1, p2) = self.penalties();
		if p2 <= p1 {
			return Err(StereoError::Config(format!("P2 ({}) must exceed P1 ({})", p2, p1)));
		}
		let p2_limit = u16::MAX as u32 / MAX_PATHS / 2;
		if p2 >= p2_limit {
			if self.p2.is_none() {
				return Err(StereoError::Config(format!(
					"default P2 = 32 * block_size^2 ({}) for block_size {} must stay below {}; \
					 use block_size <= 11 or set p1/p2 explicitly",
					p2, self.block_size, p2_limit
				)));
			}
			return Err(StereoError::Config(format!("P2 ({}) must stay below {}", p2, p2_limit)));
		}
		if self.pre_filter_cap == 0 || self.pre_filter_cap > 63 {
			return Err(StereoError::Config(format!(
				"pre_filter_cap must be within 1..=63, got {}",
				self.pre_filter_cap
			)));
		}
		if self.uniqueness_ratio > 100 {
			return Err(StereoError::Config(format!(
				"uniqueness_ratio is a percentage, got {}",
				self.uniqueness_ratio
			)));
		}
		if !self.validity_floor.is_finite() {
			return Err(StereoError::Config("validity_floor must be finite".to_string()));
		}
		Ok(())
	}

	/// Fixed-point value written for unmatched pixels.
	pub fn invalid_raw(&self) -> i16 {
		((self.min_disparity - 1) * DISP_SCALE) as i16
	}
}

/// Fixed-point disparity as produced by the matcher, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDisparity {
	pub width: usize,
	pub height: usize,
	pub data: Vec<i16>,
	pub invalid: i16,
}

impl RawDisparity {
	pub fn get(&self, x: usize, y: usize) -> i16 {
		self.data[y * self.width + x]
	}

	pub fn valid_count(&self) -> usize {
		self.data.iter().filter(|&&d| d != self.invalid).count()
	}

	/// Convert to pixels, mapping unmatched and sub-floor values to invalid.
	pub fn descale(&self, floor: f32) -> StereoResult<DisparityMap> {
		let invalid = self.invalid;
		let values: Vec<f32> = self
			.data
			.iter()
			.map(|&d| {
				if d == invalid {
					f32::NAN
				} else {
					d as f32 / DISP_SCALE as f32
				}
			})
			.collect();
		let values = Array2::from_shape_vec((self.height, self.width), values)?;
		Ok(DisparityMap::new(values, floor))
	}

	fn flip_rows(&mut self) {
		for row in self.data.chunks_mut(self.width) {
			row.reverse();
		}
	}
}

/// Left-view disparity, plus the right view when it was requested.
#[derive(Clone, Debug)]
pub struct StereoDisparity {
	pub left: DisparityMap,
	pub right: Option<DisparityMap>,
}

/// Matching cost per pixel and disparity, laid out `[y][x][d]`.
struct CostVolume {
	width: usize,
	height: usize,
	disparities: usize,
	data: Vec<u16>,
}

impl CostVolume {
	fn pixel(&self, x: usize, y: usize) -> &[u16] {
		let start = (y * self.width + x) * self.disparities;
		&self.data[start..start + self.disparities]
	}
}

#[derive(Clone, Debug)]
pub struct DisparityEstimator {
	params: SgbmParams,
}

impl DisparityEstimator {
	pub fn new(params: SgbmParams) -> StereoResult<Self> {
		params.validate()?;
		Ok(Self { params })
	}

	pub fn params(&self) -> &SgbmParams {
		&self.params
	}

	/// Left-view disparity in pixels. When `with_right_view` is set, or the
	/// left/right consistency check is enabled, the right view is matched
	/// concurrently.
	pub fn estimate(
		&self,
		left: &GrayImage,
		right: &GrayImage,
		with_right_view: bool,
	) -> StereoResult<StereoDisparity> {
		ensure_same_size(left, right)?;
		let need_right = with_right_view || self.params.disp12_max_diff.is_some();

		let (mut raw_left, raw_right) = if need_right {
			rayon::join(
				|| self.compute_raw(left, right),
				|| Some(self.compute_right_raw(left, right)),
			)
		} else {
			(self.compute_raw(left, right), None)
		};

		if let (Some(max_diff), Some(raw_right)) = (self.params.disp12_max_diff, raw_right.as_ref()) {
			let rejected = left_right_check(&mut raw_left, raw_right, max_diff);
			tracing::debug!("left/right check rejected {} pixels", rejected);
		}

		let mut raw_right = raw_right;
		if self.params.speckle_window_size > 0 {
			let max_diff = self.params.speckle_range as i32 * DISP_SCALE;
			let removed = filter_speckles(&mut raw_left, self.params.speckle_window_size, max_diff);
			tracing::debug!("speckle filter removed {} pixels", removed);
			if let Some(ref mut r) = raw_right {
				filter_speckles(r, self.params.speckle_window_size, max_diff);
			}
		}

		let floor = self.params.validity_floor;
		let left_map = raw_left.descale(floor)?;
		let right_map = if with_right_view {
			raw_right.map(|r| r.descale(floor)).transpose()?
		} else {
			None
		};

		Ok(StereoDisparity {
			left: left_map,
			right: right_map,
		})
	}

	/// Fixed-point disparity for the left view.
	pub fn compute_raw(&self, left: &GrayImage, right: &GrayImage) -> RawDisparity {
		let (width, height) = (left.width() as usize, left.height() as usize);
		let cost = self.cost_volume(left, right);
		let mut sum = vec![0u16; cost.data.len()];

		match self.params.mode {
			MatchMode::Full => {
				self.aggregate(&cost, &mut sum, false, false);
				self.aggregate(&cost, &mut sum, true, false);
			}
			MatchMode::Fast => {
				self.aggregate(&cost, &mut sum, false, false);
				self.aggregate(&cost, &mut sum, true, true);
			}
		}

		let invalid = self.params.invalid_raw();
		let nd = self.params.num_disparities;
		let mut data = vec![invalid; width * height];
		data.par_chunks_mut(width)
			.zip(sum.par_chunks(width * nd))
			.for_each(|(out_row, sum_row)| {
				for (x, out) in out_row.iter_mut().enumerate() {
					if !self.has_candidates(x, width) {
						continue;
					}
					if let Some(d) = self.select(&sum_row[x * nd..(x + 1) * nd]) {
						*out = d;
					}
				}
			});

		RawDisparity {
			width,
			height,
			data,
			invalid,
		}
	}

	/// Fixed-point disparity for the right view: positive values mean the
	/// matching left pixel lies `d` columns to the right.
	pub fn compute_right_raw(&self, left: &GrayImage, right: &GrayImage) -> RawDisparity {
		// Mirroring both images and swapping them turns right-view matching
		// into the ordinary left-view search.
		let mirrored_left = imageops::flip_horizontal(left);
		let mirrored_right = imageops::flip_horizontal(right);
		let mut raw = self.compute_raw(&mirrored_right, &mirrored_left);
		raw.flip_rows();
		raw
	}

	fn has_candidates(&self, x: usize, width: usize) -> bool {
		let x = x as i64;
		let nearest = x - self.params.min_disparity as i64;
		let farthest = nearest - self.params.num_disparities as i64 + 1;
		nearest >= 0 && farthest < width as i64
	}

	/// Winner-take-all with uniqueness check and parabolic sub-pixel fit.
	fn select(&self, costs: &[u16]) -> Option<i16> {
		let (best, &min_cost) = costs.iter().enumerate().min_by_key(|&(_, c)| *c)?;

		let ratio = self.params.uniqueness_ratio as u64;
		for (d, &c) in costs.iter().enumerate() {
			if d.abs_diff(best) > 1 && (c as u64) * (100 - ratio) < (min_cost as u64) * 100 {
				return None;
			}
		}

		let mut raw = (self.params.min_disparity + best as i32) * DISP_SCALE;
		if best > 0 && best + 1 < costs.len() {
			let prev = costs[best - 1] as i32;
			let next = costs[best + 1] as i32;
			let denom = (prev + next - 2 * min_cost as i32).max(1);
			raw += ((prev - next) * DISP_SCALE + denom) / (denom * 2);
		}
		Some(raw as i16)
	}

	fn cost_volume(&self, left: &GrayImage, right: &GrayImage) -> CostVolume {
		let (width, height) = (left.width() as usize, left.height() as usize);
		let nd = self.params.num_disparities;
		let cap = self.params.pre_filter_cap as i32;
		let (_, p2) = self.params.penalties();
		let block_cap = u16::MAX as u32 / MAX_PATHS - p2;

		let grad_l = sobel_x_clipped(left, cap);
		let grad_r = sobel_x_clipped(right, cap);
		let (int_l, int_r) = (left.as_raw(), right.as_raw());
		let mismatch = (2 * cap + (255 >> 2)) as u16;

		let radius = (self.params.block_size / 2) as i64;
		let min_d = self.params.min_disparity as i64;

		let pixel_cost = |x: usize, y: usize, d: usize| -> u16 {
			let xr = x as i64 - (min_d + d as i64);
			if xr < 0 || xr >= width as i64 {
				return mismatch;
			}
			let li = y * width + x;
			let ri = y * width + xr as usize;
			let grad = (grad_l[li] as i32 - grad_r[ri] as i32).unsigned_abs();
			let inten = (int_l[li] as i32 - int_r[ri] as i32).unsigned_abs() >> 2;
			(grad + inten) as u16
		};

		let mut data = vec![0u16; width * height * nd];
		data.par_chunks_mut(width * nd)
			.enumerate()
			.for_each(|(y, row)| {
				let y0 = (y as i64 - radius).max(0) as usize;
				let y1 = (y as i64 + radius).min(height as i64 - 1) as usize;
				let mut column = vec![0u32; width];
				for d in 0..nd {
					for (x, col) in column.iter_mut().enumerate() {
						*col = (y0..=y1).map(|yy| pixel_cost(x, yy, d) as u32).sum();
					}
					// Sliding horizontal window over the column sums.
					let mut acc: u32 = column[..=(radius as usize).min(width - 1)].iter().sum();
					for x in 0..width {
						row[x * nd + d] = acc.min(block_cap) as u16;
						let enter = x as i64 + radius + 1;
						let leave = x as i64 - radius;
						if enter < width as i64 {
							acc += column[enter as usize];
						}
						if leave >= 0 {
							acc -= column[leave as usize];
						}
					}
				}
			});

		CostVolume {
			width,
			height,
			disparities: nd,
			data,
		}
	}

	/// Accumulate scanline-optimized costs into `sum`.
	///
	/// A forward sweep runs top-to-bottom, left-to-right and covers the
	/// horizontal, vertical and both diagonal paths arriving from above; the
	/// reverse sweep covers their mirror images. With `horizontal_only` only
	/// the in-row path is accumulated.
	fn aggregate(&self, cost: &CostVolume, sum: &mut [u16], reverse: bool, horizontal_only: bool) {
		let (width, height, nd) = (cost.width, cost.height, cost.disparities);
		let (p1, p2) = self.params.penalties();

		// Row buffers for the vertical and two diagonal paths.
		let mut prev_rows: [Vec<u16>; 3] = std::array::from_fn(|_| vec![0u16; width * nd]);
		let mut cur_rows: [Vec<u16>; 3] = std::array::from_fn(|_| vec![0u16; width * nd]);
		let mut prev_mins: [Vec<u16>; 3] = std::array::from_fn(|_| vec![0u16; width]);
		let mut cur_mins: [Vec<u16>; 3] = std::array::from_fn(|_| vec![0u16; width]);
		let mut horiz = vec![0u16; nd];
		let mut horiz_next = vec![0u16; nd];
		let mut horiz_min = 0u16;

		for step_y in 0..height {
			let y = if reverse { height - 1 - step_y } else { step_y };
			let have_prev_row = step_y > 0 && !horizontal_only;

			for step_x in 0..width {
				let x = if reverse { width - 1 - step_x } else { step_x };
				let c = cost.pixel(x, y);
				let start = (y * width + x) * nd;
				let acc = &mut sum[start..start + nd];

				let prev = (step_x > 0).then_some((&horiz[..], horiz_min));
				horiz_min = path_cost(c, prev, p1, p2, &mut horiz_next);
				accumulate(acc, &horiz_next);
				std::mem::swap(&mut horiz, &mut horiz_next);

				if horizontal_only {
					continue;
				}

				// Predecessor columns in the previous row: straight above,
				// the column visited before x, and the one visited after.
				let before = if reverse { x.checked_add(1).filter(|&v| v < width) } else { x.checked_sub(1) };
				let after = if reverse { x.checked_sub(1) } else { x.checked_add(1).filter(|&v| v < width) };
				let sources = [Some(x), before, after];

				for (k, src) in sources.iter().enumerate() {
					let prev = match (have_prev_row, src) {
						(true, Some(px)) => Some((&prev_rows[k][px * nd..(px + 1) * nd], prev_mins[k][*px])),
						_ => None,
					};
					let out = &mut cur_rows[k][x * nd..(x + 1) * nd];
					cur_mins[k][x] = path_cost(c, prev, p1, p2, out);
					accumulate(acc, out);
				}
			}

			if !horizontal_only {
				std::mem::swap(&mut prev_rows, &mut cur_rows);
				std::mem::swap(&mut prev_mins, &mut cur_mins);
			}
		}
	}
}

/// One step of the SGM recurrence:
/// `L(p, d) = C(p, d) + min(L(p-r, d), L(p-r, d±1) + P1, min_k L(p-r, k) + P2) - min_k L(p-r, k)`.
fn path_cost(cost: &[u16], prev: Option<(&[u16], u16)>, p1: u32, p2: u32, out: &mut [u16]) -> u16 {
	let Some((prev, prev_min)) = prev else {
		out.copy_from_slice(cost);
		return cost.iter().copied().min().unwrap_or(0);
	};

	let n = cost.len();
	let prev_min = prev_min as u32;
	let jump = prev_min + p2;
	let mut min = u16::MAX;
	for d in 0..n {
		let mut best = (prev[d] as u32).min(jump);
		if d > 0 {
			best = best.min(prev[d - 1] as u32 + p1);
		}
		if d + 1 < n {
			best = best.min(prev[d + 1] as u32 + p1);
		}
		let v = (cost[d] as u32 + best - prev_min).min(u16::MAX as u32) as u16;
		out[d] = v;
		min = min.min(v);
	}
	min
}

fn accumulate(acc: &mut [u16], path: &[u16]) {
	for (a, &p) in acc.iter_mut().zip(path) {
		*a = a.saturating_add(p);
	}
}

/// Horizontal Sobel response clipped to `[-cap, cap]` and shifted to
/// `[0, 2 * cap]`.
fn sobel_x_clipped(image: &GrayImage, cap: i32) -> Vec<u8> {
	let (width, height) = (image.width() as usize, image.height() as usize);
	let px = image.as_raw();
	let at = |x: i64, y: i64| -> i32 {
		let xc = x.clamp(0, width as i64 - 1) as usize;
		let yc = y.clamp(0, height as i64 - 1) as usize;
		px[yc * width + xc] as i32
	};

	let mut out = vec![0u8; width * height];
	out.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
		let y = y as i64;
		for (x, v) in row.iter_mut().enumerate() {
			let x = x as i64;
			let gx = (at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1))
				- (at(x - 1, y - 1) + 2 * at(x - 1, y) + at(x - 1, y + 1));
			*v = (gx.clamp(-cap, cap) + cap) as u8;
		}
	});
	out
}

/// Invalidate left-view pixels whose right-view match disagrees by more than
/// `max_diff` px. Returns the number of pixels rejected.
pub fn left_right_check(left: &mut RawDisparity, right: &RawDisparity, max_diff: u32) -> usize {
	let max_diff = max_diff as i32 * DISP_SCALE;
	let width = left.width;
	let mut rejected = 0;

	for (y, row) in left.data.chunks_mut(width).enumerate() {
		for (x, d) in row.iter_mut().enumerate() {
			if *d == left.invalid {
				continue;
			}
			let shift = (*d as f32 / DISP_SCALE as f32).round() as i64;
			let xr = x as i64 - shift;
			let consistent = xr >= 0
				&& xr < width as i64
				&& {
					let dr = right.get(xr as usize, y);
					dr != right.invalid && (*d as i32 - dr as i32).abs() <= max_diff
				};
			if !consistent {
				*d = left.invalid;
				rejected += 1;
			}
		}
	}
	rejected
}

/// Invalidate 4-connected regions of at most `max_size` pixels, where
/// neighbours belong to the same region when their raw disparities differ by
/// at most `max_diff`. Returns the number of pixels removed.
pub fn filter_speckles(disparity: &mut RawDisparity, max_size: usize, max_diff: i32) -> usize {
	let (width, height) = (disparity.width, disparity.height);
	let invalid = disparity.invalid;
	let mut visited = vec![false; width * height];
	let mut stack = Vec::new();
	let mut region = Vec::new();
	let mut removed = 0;

	for seed in 0..width * height {
		if visited[seed] || disparity.data[seed] == invalid {
			continue;
		}
		visited[seed] = true;
		stack.push(seed);
		region.clear();

		while let Some(i) = stack.pop() {
			region.push(i);
			let d = disparity.data[i] as i32;
			let (x, y) = (i % width, i / width);
			let neighbours = [
				(x > 0).then(|| i - 1),
				(x + 1 < width).then(|| i + 1),
				(y > 0).then(|| i - width),
				(y + 1 < height).then(|| i + width),
			];
			for n in neighbours.into_iter().flatten() {
				if visited[n] || disparity.data[n] == invalid {
					continue;
				}
				if (disparity.data[n] as i32 - d).abs() <= max_diff {
					visited[n] = true;
					stack.push(n);
				}
			}
		}

		if region.len() <= max_size {
			for &i in &region {
				disparity.data[i] = invalid;
			}
			removed += region.len();
		}
	}
	removed
}

fn ensure_same_size(left: &GrayImage, right: &GrayImage) -> StereoResult<()> {
	if left.dimensions() != right.dimensions() {
		return Err(StereoError::Shape(format!(
			"left image is {:?} but right image is {:?}",
			left.dimensions(),
			right.dimensions()
		)));
	}
	let (width, height) = left.dimensions();
	if width == 0 || height == 0 {
		return Err(StereoError::Shape(format!("cannot match empty {}x{} images", width, height)));
	}
	Ok(())
}
