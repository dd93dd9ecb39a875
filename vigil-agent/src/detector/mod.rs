//! Motion-based intrusion detection
//!
//! Pipeline per frame:
//! - Smooth with a binomial kernel
//! - Per-pixel statistical differencing against the background model
//! - 8-connected region extraction, largest area wins
//! - Intrusion when the largest area exceeds the threshold and warm-up is over
//!
//! The background model is owned by the detector and mutated on every call,
//! warm-up frames included.

mod background;
mod regions;

pub use background::BackgroundModel;
pub use regions::{region_areas, smooth};

use crate::config::DetectionConfig;
use crate::error::DetectorError;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

/// One observation classified as a possible intrusion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub id: Uuid,
    pub timestamp: Duration,
    /// Largest foreground region, in pixels
    pub area: u32,
    /// 0.0 - 1.0
    pub confidence: f32,
}

/// Classification of a single frame
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub intrusion: bool,
    pub largest_area: u32,
    pub timestamp: Duration,
    pub warming_up: bool,
    pub confidence: f32,
}

impl DetectionResult {
    /// The detection event for an intrusion frame
    pub fn event(&self) -> Option<DetectionEvent> {
        self.intrusion.then(|| DetectionEvent {
            id: Uuid::new_v4(),
            timestamp: self.timestamp,
            area: self.largest_area,
            confidence: self.confidence,
        })
    }
}

pub struct MotionDetector {
    model: BackgroundModel,
    area_threshold: u32,
    warmup_frames: u32,
    variance_threshold: f32,
}

impl MotionDetector {
    pub fn new(config: &DetectionConfig) -> Self {
        Self {
            model: BackgroundModel::new(
                config.learning_rate,
                config.initial_variance,
                config.min_variance,
            ),
            area_threshold: config.area_threshold,
            warmup_frames: config.warmup_frames,
            variance_threshold: config.variance_threshold,
        }
    }

    pub fn area_threshold(&self) -> u32 {
        self.area_threshold
    }

    pub fn set_area_threshold(&mut self, area: u32) {
        debug!("Detection area threshold {} -> {}", self.area_threshold, area);
        self.area_threshold = area;
    }

    pub fn frames_seen(&self) -> u32 {
        self.model.samples()
    }

    /// Classify `frame` and absorb it into the background model
    pub fn observe(&mut self, frame: &Frame) -> Result<DetectionResult, DetectorError> {
        if frame.width == 0 || frame.height == 0 {
            return Err(DetectorError::Empty);
        }
        if frame.pixels.len() != frame.pixel_count() {
            return Err(DetectorError::BufferSize {
                expected: frame.pixel_count(),
                got: frame.pixels.len(),
            });
        }
        if let Some((width, height)) = self.model.dimensions() {
            if (width, height) != (frame.width, frame.height) {
                return Err(DetectorError::DimensionMismatch {
                    width,
                    height,
                    got_width: frame.width,
                    got_height: frame.height,
                });
            }
        }

        // frames absorbed before this one decide warm-up
        let warming_up = self.model.samples() < self.warmup_frames;

        let smoothed = smooth(frame.width, frame.height, &frame.pixels);
        let mask = self
            .model
            .apply(frame.width, frame.height, &smoothed, self.variance_threshold);
        let largest_area = region_areas(frame.width, frame.height, &mask)
            .first()
            .copied()
            .unwrap_or(0);

        let intrusion = !warming_up && largest_area > self.area_threshold;
        let confidence = if intrusion {
            (largest_area as f32 / (2.0 * self.area_threshold as f32)).min(1.0)
        } else {
            0.0
        };

        trace!(
            area = largest_area,
            warming_up,
            intrusion,
            "Frame at {:?} classified",
            frame.timestamp
        );

        Ok(DetectionResult {
            intrusion,
            largest_area,
            timestamp: frame.timestamp,
            warming_up,
            confidence,
        })
    }
}
