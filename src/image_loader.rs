use crate::error::{StereoError, StereoResult};
use crate::frame::{DepthMap, StereoFramePair};
use image::DynamicImage;
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 8] = ["png", "jpg", "jpeg", "bmp", "tiff", "tif", "webp", "gif"];

/// Where per-frame artifacts live inside a capture directory.
///
/// The defaults follow the replicator writer: one directory per render
/// product, with `rgb/rgb_0000.png` and
/// `distance_to_camera/distance_to_camera_0000.npy` beneath it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureLayout {
	pub left_dir: PathBuf,
	pub right_dir: PathBuf,
	pub image_dir: PathBuf,
	pub image_prefix: String,
	pub depth_dir: PathBuf,
	pub depth_prefix: String,
	pub index_width: usize,
}

impl Default for CaptureLayout {
	fn default() -> Self {
		Self {
			left_dir: PathBuf::from("RenderProduct_Replicator"),
			right_dir: PathBuf::from("RenderProduct_Replicator_01"),
			image_dir: PathBuf::from("rgb"),
			image_prefix: "rgb_".to_string(),
			depth_dir: PathBuf::from("distance_to_camera"),
			depth_prefix: "distance_to_camera_".to_string(),
			index_width: 4,
		}
	}
}

impl CaptureLayout {
	fn stem(&self, prefix: &str, index: u32) -> String {
		format!("{}{:0width$}", prefix, index, width = self.index_width)
	}
}

/// One loaded frame: the stereo pair plus ground truth, if the capture has it.
#[derive(Clone, Debug)]
pub struct LoadedFrame {
	pub pair: StereoFramePair,
	pub ground_truth: Option<DepthMap>,
}

/// Read-only access to a capture directory.
#[derive(Clone, Debug)]
pub struct FrameLoader {
	root: PathBuf,
	layout: CaptureLayout,
}

impl FrameLoader {
	pub fn open(root: impl AsRef<Path>, layout: CaptureLayout) -> StereoResult<Self> {
		let root = root.as_ref();
		if !root.is_dir() {
			return Err(StereoError::NotFound(root.to_path_buf()));
		}
		Ok(Self {
			root: root.to_path_buf(),
			layout,
		})
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn left_images(&self) -> PathBuf {
		self.root.join(&self.layout.left_dir).join(&self.layout.image_dir)
	}

	fn right_images(&self) -> PathBuf {
		self.root.join(&self.layout.right_dir).join(&self.layout.image_dir)
	}

	fn depth_arrays(&self) -> PathBuf {
		self.root.join(&self.layout.left_dir).join(&self.layout.depth_dir)
	}

	/// Frame indices with a left image, ascending by numeric value.
	pub fn frame_indices(&self) -> StereoResult<Vec<u32>> {
		let dir = self.left_images();
		if !dir.is_dir() {
			return Ok(Vec::new());
		}

		let mut indices = Vec::new();
		for entry in std::fs::read_dir(&dir)? {
			let path = entry?.path();
			if !has_image_extension(&path) {
				continue;
			}
			if let Some(index) = parse_index(&path, &self.layout.image_prefix) {
				indices.push(index);
			}
		}
		indices.sort_unstable();
		indices.dedup();
		Ok(indices)
	}

	pub fn load_pair(&self, index: u32) -> StereoResult<StereoFramePair> {
		let stem = self.layout.stem(&self.layout.image_prefix, index);
		let left = load_image(find_image(&self.left_images(), &stem)?)?;
		let right = load_image(find_image(&self.right_images(), &stem)?)?;
		StereoFramePair::new(index, left, right)
	}

	/// Ground-truth depth for `index`, or `None` when the capture has no
	/// array for that frame.
	pub fn load_ground_truth(&self, index: u32) -> StereoResult<Option<DepthMap>> {
		let stem = self.layout.stem(&self.layout.depth_prefix, index);
		let path = self.depth_arrays().join(format!("{}.npy", stem));
		if !path.exists() {
			return Ok(None);
		}
		read_depth_array(&path).map(|raw| Some(DepthMap::from_raw(&raw)))
	}

	pub fn load(&self, index: u32, with_ground_truth: bool) -> StereoResult<LoadedFrame> {
		let pair = self.load_pair(index)?;
		let ground_truth = if with_ground_truth {
			let gt = self.load_ground_truth(index)?;
			if let Some(ref depth) = gt {
				if depth.dim() != pair.dim() {
					return Err(StereoError::Input(format!(
						"frame {}: ground truth is {:?} but images are {:?}",
						index,
						depth.dim(),
						pair.dim()
					)));
				}
			}
			gt
		} else {
			None
		};
		Ok(LoadedFrame { pair, ground_truth })
	}
}

pub fn load_image(path: impl AsRef<Path>) -> StereoResult<DynamicImage> {
	let path = path.as_ref();

	if !path.exists() {
		return Err(StereoError::NotFound(path.to_path_buf()));
	}

	if !has_image_extension(path) {
		return Err(StereoError::Input(format!(
			"Unsupported image format: {:?}",
			path
		)));
	}

	image::open(path).map_err(|e| match e {
		image::ImageError::IoError(e) => StereoError::Io(e),
		e => StereoError::Input(format!("Failed to load image {:?}: {}", path, e)),
	})
}

/// Read a 2D float depth array. Accepts `f32` or `f64` data shaped
/// `(rows, cols)` or `(rows, cols, 1)`.
pub fn read_depth_array(path: &Path) -> StereoResult<Array2<f32>> {
	if let Ok(raw) = ndarray_npy::read_npy::<_, Array2<f32>>(path) {
		return Ok(raw);
	}
	if let Ok(raw) = ndarray_npy::read_npy::<_, Array2<f64>>(path) {
		return Ok(raw.mapv(|v| v as f32));
	}
	let raw: Array3<f32> = ndarray_npy::read_npy(path)?;
	if raw.len_of(Axis(2)) != 1 {
		return Err(StereoError::Input(format!(
			"depth array {:?} has {} channels, expected 1",
			path,
			raw.len_of(Axis(2))
		)));
	}
	Ok(raw.index_axis_move(Axis(2), 0))
}

fn find_image(dir: &Path, stem: &str) -> StereoResult<PathBuf> {
	IMAGE_EXTENSIONS
		.iter()
		.map(|ext| dir.join(format!("{}.{}", stem, ext)))
		.find(|p| p.exists())
		.ok_or_else(|| StereoError::NotFound(dir.join(format!("{}.png", stem))))
}

fn has_image_extension(path: &Path) -> bool {
	path.extension()
		.and_then(|ext| ext.to_str())
		.map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
		.unwrap_or(false)
}

fn parse_index(path: &Path, prefix: &str) -> Option<u32> {
	let stem = path.file_stem()?.to_str()?;
	let digits = stem.strip_prefix(prefix)?;
	if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	digits.parse().ok()
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::{GrayImage, Luma};
	use ndarray::array;
	use tempfile::tempdir;

	fn write_gray(path: &Path, width: u32, height: u32) {
		std::fs::create_dir_all(path.parent().unwrap()).unwrap();
		GrayImage::from_fn(width, height, |x, y| Luma([(x * 7 + y * 3) as u8]))
			.save(path)
			.unwrap();
	}

	#[test]
	fn indices_sorted_numerically() {
		let dir = tempdir().unwrap();
		let layout = CaptureLayout::default();
		let left = dir.path().join(&layout.left_dir).join(&layout.image_dir);
		for name in ["rgb_0010.png", "rgb_0002.png", "rgb_0001.png", "notes.txt", "rgb_x.png"] {
			std::fs::create_dir_all(&left).unwrap();
			std::fs::write(left.join(name), b"").unwrap();
		}

		let loader = FrameLoader::open(dir.path(), layout).unwrap();
		assert_eq!(loader.frame_indices().unwrap(), vec![1, 2, 10]);
	}

	#[test]
	fn missing_root_is_not_found() {
		let dir = tempdir().unwrap();
		let missing = dir.path().join("nope");
		assert!(matches!(
			FrameLoader::open(&missing, CaptureLayout::default()),
			Err(StereoError::NotFound(_))
		));
	}

	#[test]
	fn missing_right_image_is_not_found() {
		let dir = tempdir().unwrap();
		let layout = CaptureLayout::default();
		write_gray(&dir.path().join("RenderProduct_Replicator/rgb/rgb_0000.png"), 8, 4);

		let loader = FrameLoader::open(dir.path(), layout).unwrap();
		let err = loader.load(0, true).unwrap_err();
		assert!(matches!(err, StereoError::NotFound(_)));
		assert!(err.is_input());
	}

	#[test]
	fn ground_truth_absent_is_not_an_error() {
		let dir = tempdir().unwrap();
		write_gray(&dir.path().join("RenderProduct_Replicator/rgb/rgb_0003.png"), 8, 4);
		write_gray(&dir.path().join("RenderProduct_Replicator_01/rgb/rgb_0003.png"), 8, 4);

		let loader = FrameLoader::open(dir.path(), CaptureLayout::default()).unwrap();
		let frame = loader.load(3, true).unwrap();
		assert_eq!(frame.pair.index, 3);
		assert_eq!(frame.pair.dim(), (4, 8));
		assert!(frame.ground_truth.is_none());
	}

	#[test]
	fn ground_truth_read_from_npy() {
		let dir = tempdir().unwrap();
		let depth_dir = dir.path().join("RenderProduct_Replicator/distance_to_camera");
		std::fs::create_dir_all(&depth_dir).unwrap();
		let raw: Array2<f32> = array![[1.0, f32::INFINITY], [2.0, 0.0]];
		ndarray_npy::write_npy(depth_dir.join("distance_to_camera_0007.npy"), &raw).unwrap();

		let loader = FrameLoader::open(dir.path(), CaptureLayout::default()).unwrap();
		let gt = loader.load_ground_truth(7).unwrap().unwrap();
		assert_eq!(gt.get(0, 0), Some(1.0));
		assert_eq!(gt.get(0, 1), None);
		assert_eq!(gt.get(1, 0), Some(2.0));
		assert_eq!(gt.get(1, 1), None);
	}

	#[test]
	fn unreadable_artifacts_are_retryable() {
		let dir = tempdir().unwrap();
		let image_path = dir.path().join("rgb_0000.png");
		let depth_path = dir.path().join("distance_to_camera_0000.npy");
		std::fs::create_dir(&image_path).unwrap();
		std::fs::create_dir(&depth_path).unwrap();

		let err = load_image(&image_path).unwrap_err();
		assert!(err.is_retryable(), "{:?}", err);
		let err = read_depth_array(&depth_path).unwrap_err();
		assert!(err.is_retryable(), "{:?}", err);
	}

	#[test]
	fn undecodable_image_is_an_input_error() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("rgb_0000.png");
		std::fs::write(&path, b"not a png").unwrap();
		let err = load_image(&path).unwrap_err();
		assert!(err.is_input());
		assert!(!err.is_retryable());
	}

	#[test]
	fn single_channel_3d_arrays_are_squeezed() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("d.npy");
		let raw = Array3::<f32>::from_elem((2, 3, 1), 1.5);
		ndarray_npy::write_npy(&path, &raw).unwrap();
		let depth = read_depth_array(&path).unwrap();
		assert_eq!(depth.dim(), (2, 3));
		assert_eq!(depth[[1, 2]], 1.5);
	}
}
