use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

/// One sampled image: packed RGB8 rows, `width * height * 3` bytes.
///
/// A zero `width` or `height` means the source did not report its
/// dimensions yet; the encoder substitutes its fallback resolution.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn has_dimensions(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Byte length of a packed RGB8 raster of the given size.
    pub fn rgb_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Supplies the most recent decodable frame on demand.
///
/// Must not block: `None` means the source is not ready and the caller skips
/// this sample. Reading never mutates the source.
pub trait FrameSource: Send + 'static {
    fn current_frame(&self) -> Option<Frame>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn current_frame(&self) -> Option<Frame> {
        (**self).current_frame()
    }
}

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("Failed to load image {path}: {source}")]
    LoadImage {
        path: String,
        source: image::ImageError,
    },
    #[error("Invalid synthetic resolution {0}x{1}")]
    InvalidResolution(u32, u32),
}

/// Single-frame mailbox written by a capture producer.
#[derive(Debug, Clone, Default)]
pub struct LatestFrame {
    slot: Arc<RwLock<Option<Frame>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        *self.slot.write() = Some(frame);
    }

    pub fn clear(&self) {
        self.slot.write().take();
    }
}

impl FrameSource for LatestFrame {
    fn current_frame(&self) -> Option<Frame> {
        self.slot.read().clone()
    }
}

/// Serves the same decoded image file on every call.
#[derive(Debug, Clone)]
pub struct StillImageSource {
    frame: Frame,
}

impl StillImageSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FrameSourceError> {
        let path = path.as_ref();
        let image = image::open(path)
            .map_err(|source| FrameSourceError::LoadImage {
                path: path.display().to_string(),
                source,
            })?
            .to_rgb8();

        let (width, height) = image.dimensions();
        tracing::info!(path = %path.display(), width, height, "Loaded still image source");

        Ok(Self {
            frame: Frame::new(width, height, image.into_raw()),
        })
    }
}

impl FrameSource for StillImageSource {
    fn current_frame(&self) -> Option<Frame> {
        Some(self.frame.clone().with_timestamp(now_ms()))
    }
}

/// Random RGB noise, for exercising the pipeline without a camera.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    width: u32,
    height: u32,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Result<Self, FrameSourceError> {
        if width == 0 || height == 0 {
            return Err(FrameSourceError::InvalidResolution(width, height));
        }
        Ok(Self { width, height })
    }
}

impl FrameSource for SyntheticSource {
    fn current_frame(&self) -> Option<Frame> {
        let mut data = vec![0u8; Frame::rgb_len(self.width, self.height)];
        rand::rng().fill(&mut data[..]);
        Some(Frame::new(self.width, self.height, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_frame_reads_do_not_consume() {
        let latest = LatestFrame::new();
        assert!(latest.current_frame().is_none());

        latest.publish(Frame::new(2, 1, vec![1, 2, 3, 4, 5, 6]).with_timestamp(42));

        let first = latest.current_frame().unwrap();
        let second = latest.current_frame().unwrap();
        assert_eq!(first.timestamp_ms, 42);
        assert_eq!(first.data, second.data);

        latest.clear();
        assert!(latest.current_frame().is_none());
    }

    #[test]
    fn test_synthetic_source_fills_buffer() {
        let source = SyntheticSource::new(4, 3).unwrap();
        let frame = source.current_frame().unwrap();

        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.data.len(), 4 * 3 * 3);
        assert!(SyntheticSource::new(0, 480).is_err());
    }

    #[test]
    fn test_rgb_len_does_not_wrap_for_large_resolutions() {
        assert_eq!(Frame::rgb_len(640, 480), 921_600);
        assert_eq!(Frame::rgb_len(65_536, 65_536), 12_884_901_888);
    }

    #[test]
    fn test_still_image_source_decodes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        image::RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let source = StillImageSource::open(&path).unwrap();
        let frame = source.current_frame().unwrap();

        assert_eq!((frame.width, frame.height), (8, 6));
        assert_eq!(&frame.data[..3], &[10, 20, 30]);
    }

    #[test]
    fn test_still_image_source_missing_file() {
        let err = StillImageSource::open("/nonexistent/still.png").unwrap_err();
        assert!(matches!(err, FrameSourceError::LoadImage { .. }));
    }
}
