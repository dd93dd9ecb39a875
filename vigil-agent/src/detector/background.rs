//! Adaptive per-pixel background model
//!
//! Each pixel holds a running Gaussian (mean, variance). During warm-up the
//! model is a cumulative average of every frame seen; afterwards it adapts with
//! a fixed learning rate.

/// Statistical model of the stationary scene
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    width: u32,
    height: u32,
    mean: Vec<f32>,
    variance: Vec<f32>,
    samples: u32,
    learning_rate: f32,
    initial_variance: f32,
    min_variance: f32,
}

impl BackgroundModel {
    pub fn new(learning_rate: f32, initial_variance: f32, min_variance: f32) -> Self {
        Self {
            width: 0,
            height: 0,
            mean: Vec::new(),
            variance: Vec::new(),
            samples: 0,
            learning_rate,
            initial_variance,
            min_variance,
        }
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        (self.samples > 0).then_some((self.width, self.height))
    }

    /// Compare `pixels` against the model, then absorb them.
    ///
    /// Returns the foreground mask computed before the update. The very first
    /// frame seeds the model and is all background.
    pub fn apply(&mut self, width: u32, height: u32, pixels: &[f32], variance_threshold: f32) -> Vec<bool> {
        if self.samples == 0 {
            self.width = width;
            self.height = height;
            self.mean = pixels.to_vec();
            self.variance = vec![self.initial_variance; pixels.len()];
            self.samples = 1;
            return vec![false; pixels.len()];
        }

        self.samples = self.samples.saturating_add(1);
        // cumulative average until the adaptive rate takes over
        let alpha = (1.0 / self.samples as f32).max(self.learning_rate);

        let mut mask = Vec::with_capacity(pixels.len());
        for (i, &value) in pixels.iter().enumerate() {
            let diff = value - self.mean[i];
            let var = self.variance[i].max(self.min_variance);
            mask.push(diff * diff > variance_threshold * var);

            self.mean[i] += alpha * diff;
            let updated = self.variance[i] + alpha * (diff * diff - self.variance[i]);
            self.variance[i] = updated.max(self.min_variance);
        }
        mask
    }
}
