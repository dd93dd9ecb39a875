/*!
Sources d'images scriptées

Les images sont en niveaux de gris 64x48 par défaut, fond uniforme à 20.
Une "intrusion" est un carré à 240, assez grand pour dépasser le seuil de
détection par défaut (500 px).
*/

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use vigil_agent::error::FrameAcquisitionError;
use vigil_agent::frame::{Frame, FrameSource};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
const BACKGROUND: u8 = 20;
const FOREGROUND: u8 = 240;

pub fn blank_frame(width: u32, height: u32, timestamp: Duration) -> Frame {
    Frame::new(width, height, vec![BACKGROUND; (width * height) as usize], timestamp)
}

/// Uniform frame with a bright `side`x`side` square at (8, 8)
pub fn frame_with_square(width: u32, height: u32, side: u32, timestamp: Duration) -> Frame {
    frame_with_square_at(width, height, 8, 8, side, timestamp)
}

/// Uniform frame with a bright square whose top-left corner is (`x`, `y`)
pub fn frame_with_square_at(width: u32, height: u32, x: u32, y: u32, side: u32, timestamp: Duration) -> Frame {
    let mut frame = blank_frame(width, height, timestamp);
    for py in y..(y + side).min(height) {
        for px in x..(x + side).min(width) {
            frame.pixels[(py * width + px) as usize] = FOREGROUND;
        }
    }
    frame
}

/// Builder d'un scénario d'images, horodatées à intervalle fixe
pub struct FrameScript {
    interval: Duration,
    now: Duration,
    items: Vec<Result<Frame, FrameAcquisitionError>>,
}

impl FrameScript {
    /// 100 ms entre deux images
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(100))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self { interval, now: Duration::ZERO, items: Vec::new() }
    }

    fn tick(&mut self) -> Duration {
        let ts = self.now;
        self.now += self.interval;
        ts
    }

    pub fn blank(mut self, count: usize) -> Self {
        for _ in 0..count {
            let ts = self.tick();
            self.items.push(Ok(blank_frame(WIDTH, HEIGHT, ts)));
        }
        self
    }

    /// Une image avec un carré de 30x30 (900 px)
    pub fn intrusion(mut self) -> Self {
        let ts = self.tick();
        self.items.push(Ok(frame_with_square(WIDTH, HEIGHT, 30, ts)));
        self
    }

    /// Intrusion 30x30 ailleurs dans l'image (coin haut-gauche en `x`, `y`)
    pub fn intrusion_at(mut self, x: u32, y: u32) -> Self {
        let ts = self.tick();
        self.items.push(Ok(frame_with_square_at(WIDTH, HEIGHT, x, y, 30, ts)));
        self
    }

    /// Avance l'horloge sans produire d'image
    pub fn skip(mut self, gap: Duration) -> Self {
        self.now += gap;
        self
    }

    pub fn failures(mut self, count: usize) -> Self {
        for i in 0..count {
            self.tick();
            self.items.push(Err(FrameAcquisitionError::Unavailable(format!("camera dropout #{}", i + 1))));
        }
        self
    }

    pub fn build(self) -> ScriptedFrameSource {
        ScriptedFrameSource::new(self.items)
    }
}

impl Default for FrameScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejoue un scénario puis signale `EndOfStream`
pub struct ScriptedFrameSource {
    items: VecDeque<Result<Frame, FrameAcquisitionError>>,
    pulled: usize,
}

impl ScriptedFrameSource {
    pub fn new(items: Vec<Result<Frame, FrameAcquisitionError>>) -> Self {
        Self { items: items.into(), pulled: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    pub fn pulled(&self) -> usize {
        self.pulled
    }
}

#[async_trait]
impl FrameSource for ScriptedFrameSource {
    async fn pull(&mut self) -> Result<Frame, FrameAcquisitionError> {
        self.pulled += 1;
        self.items.pop_front().unwrap_or(Err(FrameAcquisitionError::EndOfStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_timestamps_and_end() {
        let mut source = FrameScript::new().blank(2).skip(Duration::from_secs(1)).intrusion().build();
        assert_eq!(source.pull().await.unwrap().timestamp, Duration::ZERO);
        assert_eq!(source.pull().await.unwrap().timestamp, Duration::from_millis(100));
        assert_eq!(source.pull().await.unwrap().timestamp, Duration::from_millis(1200));
        assert_eq!(source.pull().await, Err(FrameAcquisitionError::EndOfStream));
        assert_eq!(source.pulled(), 4);
    }

    #[test]
    fn test_square_area() {
        let frame = frame_with_square(WIDTH, HEIGHT, 30, Duration::ZERO);
        assert_eq!(frame.pixels.iter().filter(|&&p| p == FOREGROUND).count(), 900);
    }
}
