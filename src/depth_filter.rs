use crate::error::{StereoError, StereoResult};
use crate::frame::DepthMap;
use ndarray::Zip;

/// Per-pixel exponential moving average over a frame sequence.
///
/// Owned by one pipeline run. Frames must arrive in strictly increasing index
/// order; anything else is rejected and leaves the state untouched.
#[derive(Clone, Debug)]
pub struct TemporalStabilizer {
	state: Option<DepthMap>,
	alpha: f32,
	last_index: Option<u32>,
	frames_seen: u32,
}

impl TemporalStabilizer {
	pub fn new(alpha: f32) -> StereoResult<Self> {
		validate_alpha(alpha)?;
		Ok(Self {
			state: None,
			alpha,
			last_index: None,
			frames_seen: 0,
		})
	}

	pub fn alpha(&self) -> f32 {
		self.alpha
	}

	pub fn state(&self) -> Option<&DepthMap> {
		self.state.as_ref()
	}

	pub fn frames_seen(&self) -> u32 {
		self.frames_seen
	}

	pub fn reset(&mut self) {
		self.state = None;
		self.last_index = None;
		self.frames_seen = 0;
	}

	/// Blend `current` into the running state and return the smoothed map.
	///
	/// Valid pixels become `alpha * current + (1 - alpha) * previous`; where
	/// the current frame is invalid the previous value is held.
	pub fn apply(&mut self, index: u32, current: &DepthMap) -> StereoResult<DepthMap> {
		if let Some(last) = self.last_index {
			if index <= last {
				return Err(StereoError::OutOfOrder { index, last });
			}
		}

		let next = match self.state.take() {
			Some(prev) if prev.dim() == current.dim() => {
				let alpha = self.alpha;
				let mut blended = prev;
				Zip::from(blended.values_mut())
					.and(current.values())
					.for_each(|state, &cur| {
						*state = match (cur, *state) {
							(Some(c), Some(p)) => Some(alpha * c + (1.0 - alpha) * p),
							(Some(c), None) => Some(c),
							(None, held) => held,
						};
					});
				blended
			}
			Some(prev) => {
				tracing::warn!(
					"frame {} is {:?} but temporal state is {:?}; restarting smoothing",
					index,
					current.dim(),
					prev.dim()
				);
				current.clone()
			}
			None => current.clone(),
		};

		self.state = Some(next.clone());
		self.last_index = Some(index);
		self.frames_seen += 1;
		Ok(next)
	}
}

pub fn validate_alpha(alpha: f32) -> StereoResult<()> {
	if !(alpha > 0.0 && alpha <= 1.0) {
		return Err(StereoError::Config(format!(
			"temporal alpha must be in (0, 1], got {}",
			alpha
		)));
	}
	Ok(())
}
