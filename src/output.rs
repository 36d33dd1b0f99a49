//! Artifact persistence: visualizations, raw arrays, point clouds and JSON
//! records, laid out per frame under one output directory.

use crate::cloud::{write_ply, PointCloud};
use crate::error::{StereoError, StereoResult};
use crate::frame::{DepthMap, DisparityMap};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub const SUMMARY_FILE: &str = "summary.json";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "format")]
pub enum ImageEncoding {
	Jpeg { quality: u8 },
	Png,
}

impl ImageEncoding {
	pub fn extension(&self) -> &'static str {
		match self {
			ImageEncoding::Jpeg { .. } => "jpg",
			ImageEncoding::Png => "png",
		}
	}
}

pub fn save_image(image: &DynamicImage, path: &Path, encoding: ImageEncoding) -> StereoResult<()> {
	match encoding {
		ImageEncoding::Jpeg { quality } => {
			let rgb_image = image.to_rgb8();
			let file = File::create(path)?;
			let mut jpeg_encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
				BufWriter::new(file),
				quality,
			);
			jpeg_encoder.encode(
				rgb_image.as_ref(),
				rgb_image.width(),
				rgb_image.height(),
				image::ExtendedColorType::Rgb8,
			)?;
		}
		ImageEncoding::Png => {
			image.save_with_format(path, image::ImageFormat::Png)?;
		}
	}

	Ok(())
}

/// Valid disparities stretched over 1..=255, invalid pixels 0.
pub fn disparity_visualization(disparity: &DisparityMap) -> GrayImage {
	let (rows, cols) = disparity.dim();
	let range = disparity.valid_range();
	GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
		let level = match (disparity.get(y as usize, x as usize), range) {
			(Some(d), Some((lo, hi))) => 1.0 + 254.0 * normalize(d, lo, hi),
			_ => 0.0,
		};
		Luma([level.round() as u8])
	})
}

/// Jet colormap with near depths red and far depths blue; invalid pixels
/// black.
pub fn depth_visualization(depth: &DepthMap) -> RgbImage {
	let (rows, cols) = depth.dim();
	let range = depth.valid_range();
	RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
		match (depth.get(y as usize, x as usize), range) {
			(Some(z), Some((lo, hi))) => Rgb(jet(1.0 - normalize(z, lo, hi))),
			_ => Rgb([0, 0, 0]),
		}
	})
}

fn normalize(v: f32, lo: f32, hi: f32) -> f32 {
	if hi > lo {
		((v - lo) / (hi - lo)).clamp(0.0, 1.0)
	} else {
		1.0
	}
}

/// `t = 0` is dark blue, `t = 1` dark red.
fn jet(t: f32) -> [u8; 3] {
	let channel = |offset: f32| ((1.5 - (4.0 * t - offset).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
	[channel(3.0), channel(2.0), channel(1.0)]
}

/// `float32` `.npy` with NaN at invalid pixels.
pub fn write_depth_npy(depth: &DepthMap, path: &Path) -> StereoResult<()> {
	ndarray_npy::write_npy(path, &depth.to_raw(f32::NAN))?;
	Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) -> StereoResult<()> {
	let file = File::create(path)?;
	serde_json::to_writer_pretty(BufWriter::new(file), value)?;
	Ok(())
}

/// Writes one run's artifacts beneath `root`:
///
/// ```text
/// root/
///   disparity/frame_0000.png
///   depth/frame_0000.png
///   depth_raw/frame_0000.npy
///   clouds/frame_0000.ply
///   metrics/frame_0000.json
///   summary.json
/// ```
#[derive(Clone, Debug)]
pub struct OutputWriter {
	root: PathBuf,
	encoding: ImageEncoding,
}

impl OutputWriter {
	pub fn create(root: impl AsRef<Path>, encoding: ImageEncoding) -> StereoResult<Self> {
		let root = root.as_ref();
		fs::create_dir_all(root).map_err(|e| {
			StereoError::Io(std::io::Error::new(
				e.kind(),
				format!("Failed to create output directory {}: {}", root.display(), e),
			))
		})?;
		Ok(Self {
			root: root.to_path_buf(),
			encoding,
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn frame_path(&self, dir: &str, index: u32, extension: &str) -> StereoResult<PathBuf> {
		let dir = self.root.join(dir);
		fs::create_dir_all(&dir)?;
		Ok(dir.join(format!("frame_{:04}.{}", index, extension)))
	}

	pub fn write_disparity_visualization(&self, index: u32, disparity: &DisparityMap) -> StereoResult<PathBuf> {
		let path = self.frame_path("disparity", index, self.encoding.extension())?;
		save_image(
			&DynamicImage::ImageLuma8(disparity_visualization(disparity)),
			&path,
			self.encoding,
		)?;
		Ok(path)
	}

	pub fn write_depth_visualization(&self, index: u32, depth: &DepthMap) -> StereoResult<PathBuf> {
		let path = self.frame_path("depth", index, self.encoding.extension())?;
		save_image(
			&DynamicImage::ImageRgb8(depth_visualization(depth)),
			&path,
			self.encoding,
		)?;
		Ok(path)
	}

	pub fn write_raw_depth(&self, index: u32, depth: &DepthMap) -> StereoResult<PathBuf> {
		let path = self.frame_path("depth_raw", index, "npy")?;
		write_depth_npy(depth, &path)?;
		Ok(path)
	}

	pub fn write_point_cloud(&self, index: u32, cloud: &PointCloud) -> StereoResult<PathBuf> {
		let path = self.frame_path("clouds", index, "ply")?;
		write_ply(cloud, &path)?;
		Ok(path)
	}

	pub fn write_frame_record<T: Serialize>(&self, index: u32, record: &T) -> StereoResult<PathBuf> {
		let path = self.frame_path("metrics", index, "json")?;
		write_json(record, &path)?;
		Ok(path)
	}

	pub fn write_root_json<T: Serialize>(&self, name: &str, value: &T) -> StereoResult<PathBuf> {
		let path = self.root.join(name);
		write_json(value, &path)?;
		Ok(path)
	}
}
