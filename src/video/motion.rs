//! Frame-differencing motion detection

use image::GrayImage;

use super::convert::{absdiff_binarize, bgr_to_half_gray};
use super::format::Resolution;

/// Stateful motion gate keyed by the previous frame.
///
/// Each update downscales the input by half, converts to grayscale and
/// compares against the previous reduced frame. Only the pipeline worker
/// calls `update`; the threshold arrives per call so it can live in the
/// shared tuning atomics.
pub struct MotionGate {
    previous: Option<GrayImage>,
    last_diff: Option<GrayImage>,
}

impl MotionGate {
    pub fn new() -> Self {
        Self {
            previous: None,
            last_diff: None,
        }
    }

    /// Feed one BGR frame. Returns whether motion is present relative to the
    /// previous frame; the very first frame never reports motion.
    pub fn update(&mut self, bgr: &[u8], resolution: Resolution, threshold: u8) -> bool {
        let current = bgr_to_half_gray(bgr, resolution);

        let mut vote_count = 0;
        if let Some(previous) = &self.previous {
            let (diff, count) = absdiff_binarize(previous, &current, threshold);
            vote_count = count;
            if count > 0 {
                tracing::debug!(count, "motion pixels over threshold");
            }
            self.last_diff = Some(diff);
        }
        self.previous = Some(current);

        vote_count > 0
    }

    /// The binarized difference of the last update, used as the display
    /// frame in MotionDetect mode. None until two frames have been seen.
    pub fn diff_frame(&self) -> Option<&GrayImage> {
        self.last_diff.as_ref()
    }
}

impl Default for MotionGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: Resolution = Resolution { width: 8, height: 8 };

    fn frame(value: u8) -> Vec<u8> {
        vec![value; RES.pixels() * 3]
    }

    #[test]
    fn first_frame_never_reports_motion() {
        let mut gate = MotionGate::new();
        assert!(!gate.update(&frame(200), RES, 10));
        assert!(gate.diff_frame().is_none());
    }

    #[test]
    fn change_beyond_threshold_is_motion() {
        let mut gate = MotionGate::new();
        gate.update(&frame(10), RES, 20);
        assert!(gate.update(&frame(200), RES, 20));
        let diff = gate.diff_frame().unwrap();
        assert!(diff.as_raw().iter().any(|&p| p == 255));
    }

    #[test]
    fn change_at_threshold_is_not_motion() {
        let mut gate = MotionGate::new();
        gate.update(&frame(100), RES, 20);
        // Delta of exactly the threshold must not trip the gate.
        assert!(!gate.update(&frame(120), RES, 20));
    }

    #[test]
    fn static_scene_stays_quiet() {
        let mut gate = MotionGate::new();
        gate.update(&frame(42), RES, 1);
        assert!(!gate.update(&frame(42), RES, 1));
        assert!(!gate.update(&frame(42), RES, 1));
    }

    #[test]
    fn comparison_is_against_immediately_previous_frame() {
        let mut gate = MotionGate::new();
        gate.update(&frame(10), RES, 5);
        assert!(gate.update(&frame(100), RES, 5));
        // Back at rest: second static frame compares against the first.
        assert!(gate.update(&frame(10), RES, 5));
        assert!(!gate.update(&frame(10), RES, 5));
    }
}
