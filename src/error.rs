use std::path::PathBuf;

pub type StereoResult<T> = Result<T, StereoError>;

#[derive(Debug, thiserror::Error)]
pub enum StereoError {
	#[error("Input error: {0}")]
	Input(String),
	#[error("Not found: {}", .0.display())]
	NotFound(PathBuf),
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Shape mismatch: {0}")]
	Shape(String),
	#[error("Frame {index} received after frame {last}; temporal state only advances in increasing order")]
	OutOfOrder { index: u32, last: u32 },
	#[error("No valid stereo frame pairs in {}", .0.display())]
	NoFrames(PathBuf),
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Image error: {0}")]
	Image(image::ImageError),
	#[error("Array error: {0}")]
	Array(String),
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl StereoError {
	/// Missing or malformed per-frame artifacts. Frames failing this way are
	/// counted as skipped rather than failed.
	pub fn is_input(&self) -> bool {
		matches!(
			self,
			StereoError::Input(_) | StereoError::NotFound(_) | StereoError::Image(_) | StereoError::Array(_)
		)
	}

	/// Transient failures worth another attempt.
	pub fn is_retryable(&self) -> bool {
		matches!(self, StereoError::Io(_))
	}
}

impl From<ndarray::ShapeError> for StereoError {
	fn from(e: ndarray::ShapeError) -> Self {
		StereoError::Shape(e.to_string())
	}
}

// Read/write failures underneath a codec stay `Io` so they can be retried.
impl From<image::ImageError> for StereoError {
	fn from(e: image::ImageError) -> Self {
		match e {
			image::ImageError::IoError(e) => StereoError::Io(e),
			e => StereoError::Image(e),
		}
	}
}

impl From<ndarray_npy::ReadNpyError> for StereoError {
	fn from(e: ndarray_npy::ReadNpyError) -> Self {
		match e {
			ndarray_npy::ReadNpyError::Io(e) => StereoError::Io(e),
			e => StereoError::Array(e.to_string()),
		}
	}
}

impl From<ndarray_npy::WriteNpyError> for StereoError {
	fn from(e: ndarray_npy::WriteNpyError) -> Self {
		match e {
			ndarray_npy::WriteNpyError::Io(e) => StereoError::Io(e),
			e => StereoError::Array(e.to_string()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn input_errors_are_classified() {
		assert!(StereoError::NotFound(PathBuf::from("left.png")).is_input());
		assert!(StereoError::Input("bad".into()).is_input());
		assert!(!StereoError::Config("bad".into()).is_input());
		assert!(!StereoError::OutOfOrder { index: 1, last: 2 }.is_input());
	}

	#[test]
	fn only_io_errors_are_retried() {
		let io = StereoError::from(std::io::Error::new(std::io::ErrorKind::Interrupted, "busy"));
		assert!(io.is_retryable());
		assert!(!StereoError::NotFound(PathBuf::from("x")).is_retryable());
	}

	#[test]
	fn codec_io_failures_stay_retryable() {
		let busy = || std::io::Error::new(std::io::ErrorKind::Interrupted, "busy");
		assert!(StereoError::from(image::ImageError::IoError(busy())).is_retryable());
		assert!(StereoError::from(ndarray_npy::ReadNpyError::Io(busy())).is_retryable());
		assert!(StereoError::from(ndarray_npy::WriteNpyError::Io(busy())).is_retryable());
		assert!(!StereoError::from(ndarray_npy::ReadNpyError::MissingData).is_retryable());
	}
}
