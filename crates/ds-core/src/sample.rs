//! Per-sample input records

use ndarray::Array3;

use crate::Pixel;
use crate::error::{RecordError, RecordResult};

/// One rendered spectrogram image (H x W x C) with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    /// Source identifier (file name, optionally with chunk suffix)
    pub identifier: String,
    /// Position of the sample in its source, in seconds
    pub timestamp: f64,
    /// Pixel intensities in row-major H x W x C order
    pub image: Array3<Pixel>,
}

impl SampleRecord {
    /// Create new sample record
    pub fn new(identifier: impl Into<String>, timestamp: f64, image: Array3<Pixel>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp,
            image,
        }
    }

    /// Image shape as (height, width, channels)
    pub fn shape(&self) -> (usize, usize, usize) {
        self.image.dim()
    }

    /// Number of color channels
    pub fn channels(&self) -> usize {
        self.image.dim().2
    }

    /// Reject images with a zero-sized axis
    pub fn check_image(&self) -> RecordResult<()> {
        let (h, w, c) = self.shape();
        if h == 0 || w == 0 || c == 0 {
            return Err(RecordError::DegenerateImage {
                identifier: self.identifier.clone(),
                shape: (h, w, c),
            });
        }
        Ok(())
    }
}
