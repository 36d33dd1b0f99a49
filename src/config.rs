use crate::camera::StereoRig;
use crate::depth::validate_clip;
use crate::depth_filter::validate_alpha;
use crate::disparity::SgbmParams;
use crate::error::{StereoError, StereoResult};
use crate::image_loader::CaptureLayout;
use crate::output::ImageEncoding;
use crate::refine::WlsParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// What the capture's per-frame depth arrays measure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundTruthKind {
	/// Euclidean distance from the camera centre along each pixel's ray.
	#[default]
	DistanceToCamera,
	/// Depth along the optical axis, directly comparable to estimates.
	PlanarDepth,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
	pub enabled: bool,
	pub wls: WlsParams,
}

impl Default for RefinementConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			wls: WlsParams::default(),
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
	pub enabled: bool,
	/// Weight of the newest frame, in `(0, 1]`.
	pub alpha: f32,
}

impl Default for TemporalConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			alpha: 0.3,
		}
	}
}

/// Valid depth window in meters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepthClip {
	pub min: f32,
	pub max: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
	pub input_dir: PathBuf,
	pub output_dir: PathBuf,
	pub rig: StereoRig,
	pub layout: CaptureLayout,
	pub ground_truth: GroundTruthKind,
	pub matcher: SgbmParams,
	pub refinement: RefinementConfig,
	pub temporal: TemporalConfig,
	pub evaluate: bool,
	pub visualize: bool,
	pub export_point_cloud: bool,
	pub export_raw_depth: bool,
	pub visualization_encoding: ImageEncoding,
	pub depth_clip: Option<DepthClip>,
	/// Process at most this many frames, in index order.
	pub frame_limit: Option<usize>,
	/// Extra attempts for a frame's loading or persistence after an I/O error.
	pub io_retries: u32,
}

impl Default for PipelineConfig {
	fn default() -> Self {
		Self {
			input_dir: PathBuf::from("capture"),
			output_dir: PathBuf::from("output"),
			rig: StereoRig::default(),
			layout: CaptureLayout::default(),
			ground_truth: GroundTruthKind::default(),
			matcher: SgbmParams::default(),
			refinement: RefinementConfig::default(),
			temporal: TemporalConfig::default(),
			evaluate: true,
			visualize: false,
			export_point_cloud: false,
			export_raw_depth: true,
			visualization_encoding: ImageEncoding::Png,
			depth_clip: None,
			frame_limit: None,
			io_retries: 2,
		}
	}
}

impl PipelineConfig {
	pub fn load(path: &Path) -> StereoResult<Self> {
		let contents = fs::read_to_string(path).map_err(|e| {
			StereoError::Config(format!("Failed to read config {}: {e}", path.display()))
		})?;
		serde_json::from_str(&contents).map_err(|e| {
			StereoError::Config(format!("Failed to parse config {}: {e}", path.display()))
		})
	}

	pub fn to_json(&self) -> StereoResult<String> {
		Ok(serde_json::to_string_pretty(self)?)
	}

	/// Reject parameter combinations no frame could run with.
	pub fn validate(&self) -> StereoResult<()> {
		self.rig.validate()?;
		self.matcher.validate()?;
		if self.refinement.enabled {
			self.refinement.wls.validate()?;
		}
		if self.temporal.enabled {
			validate_alpha(self.temporal.alpha)?;
		}
		if let Some(clip) = self.depth_clip {
			validate_clip(clip.min, clip.max)?;
		}
		if let ImageEncoding::Jpeg { quality } = self.visualization_encoding {
			if !(1..=100).contains(&quality) {
				return Err(StereoError::Config(format!(
					"JPEG quality must be in 1..=100, got {}",
					quality
				)));
			}
		}
		if self.frame_limit == Some(0) {
			return Err(StereoError::Config("frame limit must be at least 1".to_string()));
		}
		Ok(())
	}
}
