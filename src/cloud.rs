use crate::camera::StereoRig;
use crate::error::{StereoError, StereoResult};
use crate::frame::DepthMap;
use image::RgbImage;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Camera-frame points, x right, y down, z forward, in meters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointCloud {
	pub points: Vec<[f32; 3]>,
	/// Parallel to `points` when the cloud was colored.
	pub colors: Option<Vec<[u8; 3]>>,
	/// `(row, col)` each point was projected from.
	pub pixels: Vec<(u32, u32)>,
}

impl PointCloud {
	pub fn len(&self) -> usize {
		self.points.len()
	}

	pub fn is_empty(&self) -> bool {
		self.points.is_empty()
	}
}

/// Back-project every valid depth pixel through the pinhole model.
///
/// The principal point defaults to the image center. `color`, if given, must
/// match the depth map's size.
pub fn project(depth: &DepthMap, rig: &StereoRig, color: Option<&RgbImage>) -> StereoResult<PointCloud> {
	let (rows, cols) = depth.dim();
	if let Some(img) = color {
		if (img.height() as usize, img.width() as usize) != (rows, cols) {
			return Err(StereoError::Shape(format!(
				"point cloud color image is {}x{} but depth is {}x{}",
				img.width(),
				img.height(),
				cols,
				rows
			)));
		}
	}

	let (cx, cy) = rig.principal_point_for(cols, rows);
	let f = rig.focal_length_px;
	let capacity = depth.valid_count();
	let mut points = Vec::with_capacity(capacity);
	let mut pixels = Vec::with_capacity(capacity);
	let mut colors = color.map(|_| Vec::with_capacity(capacity));

	for ((v, u), z) in depth.values().indexed_iter() {
		let Some(z) = *z else { continue };
		points.push([(u as f32 - cx) * z / f, (v as f32 - cy) * z / f, z]);
		pixels.push((v as u32, u as u32));
		if let (Some(colors), Some(img)) = (colors.as_mut(), color) {
			colors.push(img.get_pixel(u as u32, v as u32).0);
		}
	}

	Ok(PointCloud {
		points,
		colors,
		pixels,
	})
}

/// Rebuild a depth map from the z coordinate of each point.
pub fn depth_from_cloud(cloud: &PointCloud, rows: usize, cols: usize) -> DepthMap {
	let mut depth = DepthMap::filled(rows, cols, None);
	let values = depth.values_mut();
	for (&(v, u), p) in cloud.pixels.iter().zip(&cloud.points) {
		if let Some(slot) = values.get_mut((v as usize, u as usize)) {
			*slot = Some(p[2]);
		}
	}
	depth
}

/// ASCII PLY, with `red green blue` properties when the cloud is colored.
pub fn write_ply(cloud: &PointCloud, path: &Path) -> StereoResult<()> {
	let mut out = BufWriter::new(File::create(path)?);

	writeln!(out, "ply")?;
	writeln!(out, "format ascii 1.0")?;
	writeln!(out, "element vertex {}", cloud.len())?;
	writeln!(out, "property float x")?;
	writeln!(out, "property float y")?;
	writeln!(out, "property float z")?;
	if cloud.colors.is_some() {
		writeln!(out, "property uchar red")?;
		writeln!(out, "property uchar green")?;
		writeln!(out, "property uchar blue")?;
	}
	writeln!(out, "end_header")?;

	match &cloud.colors {
		Some(colors) => {
			for (p, c) in cloud.points.iter().zip(colors) {
				writeln!(out, "{} {} {} {} {} {}", p[0], p[1], p[2], c[0], c[1], c[2])?;
			}
		}
		None => {
			for p in &cloud.points {
				writeln!(out, "{} {} {}", p[0], p[1], p[2])?;
			}
		}
	}

	out.flush()?;
	Ok(())
}
