//! Dense sample batches
//!
//! A [`Batch`] is the unit handed to an extraction backend. Its fields are
//! private so the length invariant between identifiers, timestamps and the
//! leading image axis cannot be broken after construction.

use ndarray::{Array3, Array4, ArrayView3, Axis};

use crate::Pixel;
use crate::error::{RecordError, RecordResult};
use crate::sample::SampleRecord;

/// Fixed-size group of samples stacked into one n x H x W x C tensor
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    identifiers: Vec<String>,
    timestamps: Vec<f64>,
    images: Array4<Pixel>,
}

impl Batch {
    /// Create batch from already stacked parts
    pub fn new(
        identifiers: Vec<String>,
        timestamps: Vec<f64>,
        images: Array4<Pixel>,
    ) -> RecordResult<Self> {
        let n = images.len_of(Axis(0));
        if identifiers.len() != timestamps.len() || identifiers.len() != n {
            return Err(RecordError::LengthMismatch {
                identifiers: identifiers.len(),
                timestamps: timestamps.len(),
                images: n,
            });
        }
        if n == 0 {
            return Err(RecordError::EmptyBatch);
        }

        Ok(Self {
            identifiers,
            timestamps,
            images,
        })
    }

    /// Stack per-field buffers into a batch
    ///
    /// All images must share the shape of the first one. The image buffers
    /// are consumed and released once the stacked tensor exists.
    pub fn stack(
        identifiers: Vec<String>,
        timestamps: Vec<f64>,
        images: Vec<Array3<Pixel>>,
    ) -> RecordResult<Self> {
        if identifiers.len() != timestamps.len() || identifiers.len() != images.len() {
            return Err(RecordError::LengthMismatch {
                identifiers: identifiers.len(),
                timestamps: timestamps.len(),
                images: images.len(),
            });
        }
        let Some(first) = images.first() else {
            return Err(RecordError::EmptyBatch);
        };

        let expected = first.dim();
        for (identifier, image) in identifiers.iter().zip(&images) {
            if image.dim() != expected {
                return Err(RecordError::ShapeMismatch {
                    identifier: identifier.clone(),
                    expected,
                    got: image.dim(),
                });
            }
        }

        let views: Vec<ArrayView3<'_, Pixel>> = images.iter().map(|image| image.view()).collect();
        let stacked = ndarray::stack(Axis(0), &views).map_err(|_| RecordError::ShapeMismatch {
            identifier: identifiers[0].clone(),
            expected,
            got: expected,
        })?;
        drop(views);
        drop(images);

        Self::new(identifiers, timestamps, stacked)
    }

    /// Build batch from whole sample records
    pub fn from_samples(samples: Vec<SampleRecord>) -> RecordResult<Self> {
        let mut identifiers = Vec::with_capacity(samples.len());
        let mut timestamps = Vec::with_capacity(samples.len());
        let mut images = Vec::with_capacity(samples.len());

        for sample in samples {
            identifiers.push(sample.identifier);
            timestamps.push(sample.timestamp);
            images.push(sample.image);
        }

        Self::stack(identifiers, timestamps, images)
    }

    /// Number of samples (always >= 1)
    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    /// Always false; kept for API symmetry with collections
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Sample identifiers in batch order
    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// Sample timestamps in batch order
    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    /// Stacked images, n x H x W x C
    pub fn images(&self) -> &Array4<Pixel> {
        &self.images
    }

    /// Per-sample image shape (H, W, C)
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let (_, h, w, c) = self.images.dim();
        (h, w, c)
    }

    /// First and last identifier, used in fault reports
    pub fn identifier_range(&self) -> (&str, &str) {
        let first = self.identifiers.first().map(String::as_str).unwrap_or_default();
        let last = self.identifiers.last().map(String::as_str).unwrap_or_default();
        (first, last)
    }

    /// Split into identifiers, timestamps and image tensor
    pub fn into_parts(self) -> (Vec<String>, Vec<f64>, Array4<Pixel>) {
        (self.identifiers, self.timestamps, self.images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(value: u8) -> Array3<u8> {
        Array3::from_elem((2, 3, 3), value)
    }

    #[test]
    fn test_stack_preserves_order() {
        let batch = Batch::stack(
            vec!["a".into(), "b".into(), "c".into()],
            vec![0.0, 1.0, 2.0],
            vec![image(1), image(2), image(3)],
        )
        .unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.images().dim(), (3, 2, 3, 3));
        assert_eq!(batch.images()[[0, 0, 0, 0]], 1);
        assert_eq!(batch.images()[[2, 1, 2, 2]], 3);
        assert_eq!(batch.identifier_range(), ("a", "c"));
        assert_eq!(batch.image_shape(), (2, 3, 3));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let result = Batch::stack(vec![], vec![], vec![]);
        assert_eq!(result, Err(RecordError::EmptyBatch));

        let result = Batch::new(vec![], vec![], Array4::zeros((0, 2, 2, 3)));
        assert_eq!(result, Err(RecordError::EmptyBatch));
    }

    #[test]
    fn test_length_mismatch() {
        let result = Batch::new(
            vec!["a".into(), "b".into()],
            vec![0.0],
            Array4::zeros((2, 2, 2, 3)),
        );
        assert!(matches!(result, Err(RecordError::LengthMismatch { .. })));
    }

    #[test]
    fn test_shape_mismatch_names_offender() {
        let result = Batch::stack(
            vec!["a".into(), "b".into()],
            vec![0.0, 1.0],
            vec![image(0), Array3::zeros((4, 3, 3))],
        );

        match result {
            Err(RecordError::ShapeMismatch {
                identifier,
                expected,
                got,
            }) => {
                assert_eq!(identifier, "b");
                assert_eq!(expected, (2, 3, 3));
                assert_eq!(got, (4, 3, 3));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_from_samples() {
        let samples = vec![
            SampleRecord::new("x", 0.0, image(7)),
            SampleRecord::new("y", 0.5, image(8)),
        ];
        let batch = Batch::from_samples(samples).unwrap();
        assert_eq!(batch.identifiers(), &["x".to_string(), "y".to_string()]);
        assert_eq!(batch.timestamps(), &[0.0, 0.5]);

        let (ids, ts, images) = batch.into_parts();
        assert_eq!(ids.len(), 2);
        assert_eq!(ts.len(), 2);
        assert_eq!(images[[1, 0, 0, 0]], 8);
    }
}
