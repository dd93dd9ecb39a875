//! Frames and frame sources
//!
//! A frame is a grayscale buffer stamped with a monotonic timestamp relative
//! to the start of its source. Sources are pulled once per acquisition cycle.

use crate::error::FrameAcquisitionError;
use async_trait::async_trait;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Grayscale image with its capture time
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>, timestamp: Duration) -> Self {
        Self { width, height, pixels, timestamp }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Producer of frames for the acquisition cycle
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or why none could be produced
    async fn pull(&mut self) -> Result<Frame, FrameAcquisitionError>;
}

/// Reads binary PGM (P5) frames from a directory in file-name order
pub struct PgmDirectorySource {
    files: Vec<PathBuf>,
    next: usize,
    started: Instant,
}

impl PgmDirectorySource {
    pub fn open(dir: &Path) -> Result<Self, FrameAcquisitionError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| FrameAcquisitionError::Unavailable(format!("{}: {}", dir.display(), e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("pgm"))
            .collect();
        files.sort();

        info!("Frame source opened: {} frames in {}", files.len(), dir.display());
        Ok(Self { files, next: 0, started: Instant::now() })
    }
}

#[async_trait]
impl FrameSource for PgmDirectorySource {
    async fn pull(&mut self) -> Result<Frame, FrameAcquisitionError> {
        let Some(path) = self.files.get(self.next).cloned() else {
            return Err(FrameAcquisitionError::EndOfStream);
        };
        self.next += 1;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| FrameAcquisitionError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let (width, height, pixels) = decode_pgm(&bytes)?;
        debug!("Read frame {} ({}x{})", path.display(), width, height);

        Ok(Frame::new(width, height, pixels, self.started.elapsed()))
    }
}

/// Decode a PNM image (PGM expected) into 8-bit luma
pub fn decode_pgm(bytes: &[u8]) -> Result<(u32, u32, Vec<u8>), FrameAcquisitionError> {
    let luma = image::load_from_memory_with_format(bytes, ImageFormat::Pnm)
        .map_err(|e| FrameAcquisitionError::Decode(e.to_string()))?
        .to_luma8();
    let (width, height) = luma.dimensions();
    Ok((width, height, luma.into_raw()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgm(width: u32, height: u32, value: u8) -> Vec<u8> {
        let mut bytes = format!("P5\n# test frame\n{} {}\n255\n", width, height).into_bytes();
        bytes.extend(std::iter::repeat(value).take((width * height) as usize));
        bytes
    }

    #[test]
    fn test_decode_pgm() {
        let (w, h, pixels) = decode_pgm(&pgm(4, 3, 9)).unwrap();
        assert_eq!((w, h), (4, 3));
        assert_eq!(pixels.len(), 12);
        assert!(pixels.iter().all(|&p| p == 9));
    }

    #[test]
    fn test_decode_rejects_truncated_raster() {
        let mut bytes = pgm(4, 3, 9);
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(decode_pgm(&bytes), Err(FrameAcquisitionError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_non_pnm() {
        assert!(matches!(decode_pgm(b"GIF89a not a frame"), Err(FrameAcquisitionError::Decode(_))));
    }

    #[tokio::test]
    async fn test_directory_source_reads_in_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0002.pgm"), pgm(2, 2, 200)).unwrap();
        std::fs::write(dir.path().join("0001.pgm"), pgm(2, 2, 100)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let mut source = PgmDirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.pull().await.unwrap().pixels[0], 100);
        assert_eq!(source.pull().await.unwrap().pixels[0], 200);
        assert_eq!(source.pull().await, Err(FrameAcquisitionError::EndOfStream));
    }
}
