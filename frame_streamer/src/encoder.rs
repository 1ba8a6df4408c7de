use crate::frame::Frame;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use frame_proto::DATA_URL_JPEG_PREFIX;
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, RgbImage};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Frame not ready: empty pixel buffer")]
    NotReady,
    #[error("Frame buffer holds {actual} bytes, expected {expected} for {width}x{height} RGB")]
    BufferMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("Failed to encode JPEG: {0}")]
    Jpeg(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Transport-ready encoding of a frame. Consumed by the send that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub trait FrameEncoder: Send + 'static {
    fn encode(&self, frame: &Frame) -> Result<Payload, EncodeError>;
}

impl<E: FrameEncoder + ?Sized> FrameEncoder for Box<E> {
    fn encode(&self, frame: &Frame) -> Result<Payload, EncodeError> {
        (**self).encode(frame)
    }
}

/// Encodes frames as `data:image/jpeg;base64,...` strings.
#[derive(Debug, Clone)]
pub struct JpegDataUrlEncoder {
    fallback: Resolution,
    target: Option<Resolution>,
    quality: u8,
}

impl Default for JpegDataUrlEncoder {
    fn default() -> Self {
        Self {
            fallback: Resolution::default(),
            target: None,
            quality: 92,
        }
    }
}

impl JpegDataUrlEncoder {
    pub fn new(fallback: Resolution, target: Option<Resolution>, quality: u8) -> Self {
        Self {
            fallback,
            target,
            quality: quality.clamp(1, 100),
        }
    }

    fn rasterize(&self, frame: &Frame) -> Result<RgbImage, EncodeError> {
        if frame.data.is_empty() {
            return Err(EncodeError::NotReady);
        }

        let resolution = if frame.has_dimensions() {
            Resolution {
                width: frame.width,
                height: frame.height,
            }
        } else {
            let fallback = self.fallback;
            tracing::debug!(fallback = %fallback, "Frame has no dimensions, using fallback");
            if frame.data.len() != Frame::rgb_len(fallback.width, fallback.height) {
                return Ok(RgbImage::new(fallback.width, fallback.height));
            }
            fallback
        };

        let expected = Frame::rgb_len(resolution.width, resolution.height);
        let mismatch = || EncodeError::BufferMismatch {
            width: resolution.width,
            height: resolution.height,
            expected,
            actual: frame.data.len(),
        };
        if frame.data.len() != expected {
            return Err(mismatch());
        }

        RgbImage::from_raw(resolution.width, resolution.height, frame.data.to_vec())
            .ok_or_else(mismatch)
    }
}

impl FrameEncoder for JpegDataUrlEncoder {
    fn encode(&self, frame: &Frame) -> Result<Payload, EncodeError> {
        let mut raster = self.rasterize(frame)?;

        if let Some(target) = self.target {
            if raster.dimensions() != (target.width, target.height) {
                raster = image::imageops::resize(
                    &raster,
                    target.width,
                    target.height,
                    FilterType::Triangle,
                );
            }
        }

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode_image(&raster)?;

        let mut encoded = String::with_capacity(DATA_URL_JPEG_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
        encoded.push_str(DATA_URL_JPEG_PREFIX);
        BASE64.encode_string(&jpeg, &mut encoded);

        Ok(Payload(encoded))
    }
}
