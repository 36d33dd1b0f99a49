use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::Array2;
use std::path::{Path, PathBuf};

pub const WIDTH: u32 = 96;
pub const HEIGHT: u32 = 48;
pub const SHIFT: u32 = 10;
pub const FOCAL_PX: f32 = 100.0;
pub const BASELINE_M: f32 = 0.5;

/// `FOCAL_PX * BASELINE_M / SHIFT`
pub const TRUE_DEPTH_M: f32 = 5.0;

fn texture(x: i64, y: i64) -> u8 {
	let mut h = (x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663)) as u64;
	h ^= h >> 13;
	h = h.wrapping_mul(0x5bd1_e995);
	h ^= h >> 15;
	(h & 0xff) as u8
}

/// Capture directory in the replicator layout, holding a fronto-parallel
/// textured plane seen at a constant disparity of `SHIFT` pixels.
pub struct SyntheticCapture {
	pub root: PathBuf,
}

impl SyntheticCapture {
	pub fn new(root: &Path) -> Self {
		std::fs::create_dir_all(root).unwrap();
		Self {
			root: root.to_path_buf(),
		}
	}

	fn left_rgb(&self) -> PathBuf {
		self.root.join("RenderProduct_Replicator/rgb")
	}

	fn right_rgb(&self) -> PathBuf {
		self.root.join("RenderProduct_Replicator_01/rgb")
	}

	fn depth_dir(&self) -> PathBuf {
		self.root.join("RenderProduct_Replicator/distance_to_camera")
	}

	pub fn write_left(&self, index: u32) {
		std::fs::create_dir_all(self.left_rgb()).unwrap();
		RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
			let v = texture(x as i64, y as i64);
			Rgb([v, v, v])
		})
		.save(self.left_rgb().join(format!("rgb_{:04}.png", index)))
		.unwrap();
	}

	pub fn write_right(&self, index: u32) {
		std::fs::create_dir_all(self.right_rgb()).unwrap();
		GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
			Luma([texture(x as i64 + SHIFT as i64, y as i64)])
		})
		.save(self.right_rgb().join(format!("rgb_{:04}.png", index)))
		.unwrap();
	}

	/// Ray distance to the plane, as the capture writer stores it.
	pub fn write_distance(&self, index: u32) {
		let cx = (WIDTH as f32 - 1.0) / 2.0;
		let cy = (HEIGHT as f32 - 1.0) / 2.0;
		let raw = Array2::from_shape_fn((HEIGHT as usize, WIDTH as usize), |(v, u)| {
			let xn = (u as f32 - cx) / FOCAL_PX;
			let yn = (v as f32 - cy) / FOCAL_PX;
			TRUE_DEPTH_M * (1.0 + xn * xn + yn * yn).sqrt()
		});
		self.write_depth_array(index, &raw);
	}

	pub fn write_depth_array(&self, index: u32, raw: &Array2<f32>) {
		std::fs::create_dir_all(self.depth_dir()).unwrap();
		ndarray_npy::write_npy(
			self.depth_dir().join(format!("distance_to_camera_{:04}.npy", index)),
			raw,
		)
		.unwrap();
	}

	pub fn write_frame(&self, index: u32) {
		self.write_left(index);
		self.write_right(index);
		self.write_distance(index);
	}
}
