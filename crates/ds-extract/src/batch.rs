//! Lazy batching of sample streams
//!
//! [`BatchSource`] pulls [`SampleRecord`]s from a producer and groups them into
//! dense [`Batch`]es. Only the in-progress buffer and the batch most recently
//! handed out are alive at any time.

use std::iter::FusedIterator;
use std::mem;

use ds_core::{Batch, Pixel, SampleRecord};
use ndarray::Array3;

use crate::config::ShapePolicy;
use crate::error::{MlError, MlResult};
use crate::preprocess;

/// Per-field accumulation buffers for one batch
#[derive(Debug, Default)]
struct BatchBuffer {
    identifiers: Vec<String>,
    timestamps: Vec<f64>,
    images: Vec<Array3<Pixel>>,
}

impl BatchBuffer {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            identifiers: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
            images: Vec::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.identifiers.len()
    }

    fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    fn first_shape(&self) -> Option<(usize, usize, usize)> {
        self.images.first().map(|image| image.dim())
    }
}

/// Groups a sample stream into batches of `batch_size`
///
/// The final batch holds the remainder and is smaller when the stream length
/// is not a multiple of the batch size. An empty stream yields no batches.
/// After the first error the source is exhausted.
pub struct BatchSource<I> {
    /// Upstream producer
    stream: I,
    /// In-progress buffer
    buffer: BatchBuffer,
    /// Samples per batch
    batch_size: usize,
    /// Uneven shape handling
    policy: ShapePolicy,
    /// Batches emitted so far
    emitted: usize,
    /// Samples consumed so far
    consumed: usize,
    /// Stream exhausted or failed
    finished: bool,
}

impl<I> BatchSource<I>
where
    I: Iterator<Item = SampleRecord>,
{
    /// Create batch source over a sample stream
    pub fn new<S>(stream: S, batch_size: usize, policy: ShapePolicy) -> MlResult<Self>
    where
        S: IntoIterator<IntoIter = I>,
    {
        if batch_size == 0 {
            return Err(MlError::InvalidConfig(
                "batch_size must be a positive integer".into(),
            ));
        }

        Ok(Self {
            stream: stream.into_iter(),
            buffer: BatchBuffer::with_capacity(batch_size),
            batch_size,
            policy,
            emitted: 0,
            consumed: 0,
            finished: false,
        })
    }

    /// Configured batch size
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Shape policy in effect
    pub fn policy(&self) -> ShapePolicy {
        self.policy
    }

    /// Number of batches emitted so far
    pub fn batches_emitted(&self) -> usize {
        self.emitted
    }

    /// Number of samples pulled from the stream so far
    pub fn samples_consumed(&self) -> usize {
        self.consumed
    }

    /// Add one sample to the in-progress buffer
    fn push(&mut self, sample: SampleRecord) -> MlResult<()> {
        sample.check_image()?;
        let SampleRecord {
            identifier,
            timestamp,
            image,
        } = sample;

        let image = match self.buffer.first_shape() {
            Some(expected) if image.dim() != expected => match self.policy {
                ShapePolicy::Reject => {
                    return Err(MlError::ShapeMismatch {
                        identifier,
                        expected,
                        got: image.dim(),
                    });
                }
                ShapePolicy::ResizeToFirst => {
                    let (h, w, c) = expected;
                    if image.dim().2 != c {
                        return Err(MlError::ShapeMismatch {
                            identifier,
                            expected,
                            got: image.dim(),
                        });
                    }
                    log::debug!(
                        "Resizing '{}' from {:?} to {:?}",
                        identifier,
                        image.dim(),
                        expected
                    );
                    preprocess::resize_image(image.view(), h, w)?
                }
            },
            _ => image,
        };

        self.buffer.identifiers.push(identifier);
        self.buffer.timestamps.push(timestamp);
        self.buffer.images.push(image);
        self.consumed += 1;
        Ok(())
    }

    /// Check if a full batch is buffered
    fn has_batch(&self) -> bool {
        self.buffer.len() >= self.batch_size
    }

    /// Stack the buffered samples and start a fresh buffer
    fn take_batch(&mut self) -> MlResult<Batch> {
        let capacity = if self.finished { 0 } else { self.batch_size };
        let BatchBuffer {
            identifiers,
            timestamps,
            images,
        } = mem::replace(&mut self.buffer, BatchBuffer::with_capacity(capacity));

        let batch = Batch::stack(identifiers, timestamps, images)?;
        self.emitted += 1;
        Ok(batch)
    }

    fn fill(&mut self) -> MlResult<Option<Batch>> {
        while !self.has_batch() {
            match self.stream.next() {
                Some(sample) => self.push(sample)?,
                None => {
                    self.finished = true;
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    return self.take_batch().map(Some);
                }
            }
        }
        self.take_batch().map(Some)
    }
}

impl<I> Iterator for BatchSource<I>
where
    I: Iterator<Item = SampleRecord>,
{
    type Item = MlResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.fill() {
            Ok(batch) => batch.map(Ok),
            Err(e) => {
                self.finished = true;
                self.buffer = BatchBuffer::default();
                Some(Err(e))
            }
        }
    }
}

impl<I> FusedIterator for BatchSource<I> where I: Iterator<Item = SampleRecord> {}

/// Group `stream` into batches of `batch_size`, rejecting uneven shapes
pub fn batches<S>(stream: S, batch_size: usize) -> MlResult<BatchSource<S::IntoIter>>
where
    S: IntoIterator<Item = SampleRecord>,
{
    BatchSource::new(stream, batch_size, ShapePolicy::default())
}
