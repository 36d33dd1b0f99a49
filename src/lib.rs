//! Stereo depth estimation over rectified image sequences: semi-global
//! matching, optional edge-aware refinement, metric depth, temporal
//! smoothing, point clouds, and evaluation against ground truth.

pub mod camera;
pub mod cloud;
pub mod config;
pub mod depth;
pub mod depth_filter;
pub mod disparity;
pub mod error;
pub mod frame;
pub mod image_loader;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod refine;

pub use camera::StereoRig;
pub use cloud::{project, write_ply, PointCloud};
pub use config::{DepthClip, GroundTruthKind, PipelineConfig, RefinementConfig, TemporalConfig};
pub use depth::{disparity_to_depth, distance_to_planar_depth};
pub use depth_filter::TemporalStabilizer;
pub use disparity::{DisparityEstimator, MatchMode, SgbmParams};
pub use error::{StereoError, StereoResult};
pub use frame::{DepthMap, DisparityMap, StereoFramePair, INVALID_DISPARITY};
pub use image_loader::{CaptureLayout, FrameLoader, LoadedFrame};
pub use metrics::{evaluate, AggregateMetrics, FrameMetrics, MetricsAccumulator};
pub use output::{ImageEncoding, OutputWriter};
pub use pipeline::{
	run, EvaluationOutcome, FrameOutput, FrameProcessor, FrameProgress, FrameRecord, ProgressCallback, RunReport,
};
pub use refine::{select_refiner, DisparityRefiner, Passthrough, RefinementStatus, WlsParams};

#[cfg(feature = "wls")]
pub use refine::WlsRefiner;
