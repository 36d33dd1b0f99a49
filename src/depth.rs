use crate::camera::StereoRig;
use crate::error::{StereoError, StereoResult};
use crate::frame::{DepthMap, DisparityMap};
use ndarray::{Array2, Zip};

/// Pinhole stereo relation `Z = f * B / d`. Pixels with disparity at or below
/// `floor` have no depth.
pub fn disparity_to_depth(disparity: &DisparityMap, rig: &StereoRig, floor: f32) -> DepthMap {
	let scale = rig.depth_scale();
	let floor = floor.max(0.0);
	DepthMap::new(
		disparity
			.values()
			.mapv(|d| (d.is_finite() && d > floor).then(|| scale / d)),
	)
}

/// Convert per-pixel distance along the viewing ray into depth along the
/// optical axis.
pub fn distance_to_planar_depth(distance: &DepthMap, rig: &StereoRig) -> DepthMap {
	let (rows, cols) = distance.dim();
	let (cx, cy) = rig.principal_point_for(cols, rows);
	let f = rig.focal_length_px;

	let mut planar = Array2::from_elem((rows, cols), None);
	Zip::indexed(&mut planar)
		.and(distance.values())
		.for_each(|(v, u), out, &r| {
			*out = r.map(|r| {
				let xn = (u as f32 - cx) / f;
				let yn = (v as f32 - cy) / f;
				r / (1.0 + xn * xn + yn * yn).sqrt()
			});
		});
	DepthMap::new(planar)
}

/// Invalidate depths outside `[min, max]`.
pub fn clip_depth(depth: &mut DepthMap, min: f32, max: f32) {
	depth
		.values_mut()
		.mapv_inplace(|z| z.filter(|&z| z >= min && z <= max));
}

pub fn validate_clip(min: f32, max: f32) -> StereoResult<()> {
	if !(min.is_finite() && max.is_finite() && min >= 0.0 && max > min) {
		return Err(StereoError::Config(format!(
			"depth clip range must satisfy 0 <= min < max, got {} .. {}",
			min, max
		)));
	}
	Ok(())
}
