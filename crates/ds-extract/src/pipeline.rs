//! Batched extraction pipeline
//!
//! Composes a [`BatchSource`] with an [`ExtractionBackend`] into one lazy,
//! order-preserving sequence of [`FeatureRecord`]s. Work happens only when
//! the consumer pulls; at most one batch is extracted at a time.

use std::collections::VecDeque;
use std::iter::FusedIterator;

use ds_core::{BackendCapability, Batch, FeatureRecord, SampleRecord};

use crate::backend::{ExtractionBackend, load_backend};
use crate::batch::BatchSource;
use crate::config::{ExtractorConfig, ShapePolicy};
use crate::error::{MlError, MlResult};

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Pipeline execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Nothing pulled yet
    Idle,
    /// Pulling the next batch
    Streaming,
    /// Backend running on the current batch
    Extracting,
    /// Handing out records of the current batch
    Emitting,
    /// Source exhausted and all records emitted
    Done,
    /// Terminated by an error
    Failed,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Idle
    }
}

impl PipelineState {
    /// Check if the pipeline will not produce more records
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }
}

/// Counters of a running pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Batches extracted
    pub batches: usize,
    /// Records handed to the consumer
    pub records: usize,
    /// Feature dimension, fixed by the first batch
    pub feature_dim: Option<usize>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// FEATURE PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Lazy sequence of feature records
///
/// Owns its batch source and backend; dropping the pipeline releases both,
/// whether or not the sequence ran to completion. The first error ends the
/// sequence.
pub struct FeaturePipeline<I, B> {
    source: BatchSource<I>,
    backend: B,
    pending: VecDeque<FeatureRecord>,
    state: PipelineState,
    stats: PipelineStats,
}

impl<I, B> FeaturePipeline<I, B>
where
    I: Iterator<Item = SampleRecord>,
    B: ExtractionBackend,
{
    /// Create pipeline over a batch source and a loaded backend
    pub fn new(source: BatchSource<I>, backend: B) -> Self {
        Self {
            pending: VecDeque::with_capacity(source.batch_size()),
            source,
            backend,
            state: PipelineState::Idle,
            stats: PipelineStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Counters so far
    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Backend descriptor
    pub fn capability(&self) -> BackendCapability {
        self.backend.capability()
    }

    /// Give back the backend, dropping the source
    pub fn into_backend(self) -> B {
        self.backend
    }

    /// Extract one batch and queue its records in batch order
    fn extract_batch(&mut self, batch: Batch) -> MlResult<()> {
        let index = self.stats.batches;
        let n = batch.len();
        let (first, last) = batch.identifier_range();
        let (first, last) = (first.to_string(), last.to_string());

        log::debug!(
            "Extracting batch {} ({} samples, '{}'..'{}')",
            index,
            n,
            first,
            last
        );

        self.state = PipelineState::Extracting;
        let features = self
            .backend
            .extract(&batch)
            .map_err(|e| e.in_batch(index, &first, &last))?;

        let (rows, dim) = features.dim();
        if rows != n {
            return Err(MlError::InvalidOutputShape {
                expected: format!("{} feature rows", n),
                got: format!("{} rows", rows),
            }
            .in_batch(index, &first, &last));
        }
        match self.stats.feature_dim {
            Some(expected) if expected != dim => {
                return Err(MlError::InvalidOutputShape {
                    expected: format!("feature dimension {}", expected),
                    got: format!("dimension {}", dim),
                }
                .in_batch(index, &first, &last));
            }
            Some(_) => {}
            None => {
                log::info!("Feature dimension is {}", dim);
                self.stats.feature_dim = Some(dim);
            }
        }

        // images are released here, before any record is emitted
        let (identifiers, timestamps, images) = batch.into_parts();
        drop(images);

        self.pending.extend(
            identifiers
                .into_iter()
                .zip(timestamps)
                .zip(features.rows())
                .map(|((identifier, timestamp), row)| {
                    FeatureRecord::new(identifier, timestamp, row.to_vec())
                }),
        );
        self.stats.batches += 1;
        self.state = PipelineState::Emitting;
        Ok(())
    }

    fn fail(&mut self, error: MlError) -> Option<MlResult<FeatureRecord>> {
        log::warn!(
            "Pipeline failed after {} records: {}",
            self.stats.records,
            error
        );
        self.state = PipelineState::Failed;
        self.pending.clear();
        Some(Err(error))
    }
}

impl<I, B> Iterator for FeaturePipeline<I, B>
where
    I: Iterator<Item = SampleRecord>,
    B: ExtractionBackend,
{
    type Item = MlResult<FeatureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                self.stats.records += 1;
                return Some(Ok(record));
            }
            if self.state.is_terminal() {
                return None;
            }

            self.state = PipelineState::Streaming;
            match self.source.next() {
                None => {
                    log::debug!(
                        "Pipeline done: {} records in {} batches",
                        self.stats.records,
                        self.stats.batches
                    );
                    self.state = PipelineState::Done;
                    return None;
                }
                Some(Err(e)) => return self.fail(e),
                Some(Ok(batch)) => {
                    if let Err(e) = self.extract_batch(batch) {
                        return self.fail(e);
                    }
                }
            }
        }
    }
}

impl<I, B> FusedIterator for FeaturePipeline<I, B>
where
    I: Iterator<Item = SampleRecord>,
    B: ExtractionBackend,
{
}

/// Stream `stream` through `backend` in batches of `batch_size`
pub fn run<S, B>(
    stream: S,
    backend: B,
    batch_size: usize,
) -> MlResult<FeaturePipeline<S::IntoIter, B>>
where
    S: IntoIterator<Item = SampleRecord>,
    B: ExtractionBackend,
{
    let source = BatchSource::new(stream, batch_size, ShapePolicy::default())?;
    Ok(FeaturePipeline::new(source, backend))
}

// ═══════════════════════════════════════════════════════════════════════════════
// FEATURE EXTRACTOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Loaded backend plus batching settings
#[derive(Debug)]
pub struct FeatureExtractor {
    backend: Box<dyn ExtractionBackend>,
    batch_size: usize,
    shape_policy: ShapePolicy,
}

impl FeatureExtractor {
    /// Load the configured backend; fails before any sample is read
    pub fn from_config(config: &ExtractorConfig) -> MlResult<Self> {
        let backend = load_backend(config)?;
        Ok(Self {
            backend,
            batch_size: config.batch_size,
            shape_policy: config.shape_policy,
        })
    }

    /// Wrap an already loaded backend
    pub fn with_backend(backend: Box<dyn ExtractionBackend>, batch_size: usize) -> Self {
        Self {
            backend,
            batch_size,
            shape_policy: ShapePolicy::default(),
        }
    }

    /// Set the uneven shape policy
    pub fn with_shape_policy(mut self, policy: ShapePolicy) -> Self {
        self.shape_policy = policy;
        self
    }

    /// Backend descriptor
    pub fn capability(&self) -> BackendCapability {
        self.backend.capability()
    }

    /// Samples per batch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Start extracting features from `stream`
    pub fn run<S>(
        self,
        stream: S,
    ) -> MlResult<FeaturePipeline<S::IntoIter, Box<dyn ExtractionBackend>>>
    where
        S: IntoIterator<Item = SampleRecord>,
    {
        let source = BatchSource::new(stream, self.batch_size, self.shape_policy)?;
        Ok(FeaturePipeline::new(source, self.backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use ndarray::{Array2, Array3};
    use std::collections::BTreeSet;

    /// Emits `[index, mean pixel]` per sample; row count and width configurable
    #[derive(Debug)]
    struct CountingBackend {
        rows_delta: isize,
        widen_after: Option<usize>,
        calls: usize,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                rows_delta: 0,
                widen_after: None,
                calls: 0,
            }
        }
    }

    impl ExtractionBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Graph
        }

        fn available_layers(&self) -> BTreeSet<String> {
            BTreeSet::from(["counting".to_string()])
        }

        fn capability(&self) -> BackendCapability {
            BackendCapability::new(self.available_layers(), "counting", None)
        }

        fn extract(&mut self, batch: &Batch) -> MlResult<Array2<f32>> {
            self.calls += 1;
            let rows = (batch.len() as isize + self.rows_delta).max(0) as usize;
            let dim = match self.widen_after {
                Some(after) if self.calls > after => 3,
                _ => 2,
            };
            let means: Vec<f32> = batch
                .images()
                .outer_iter()
                .map(|image| image.mapv(f32::from).mean().unwrap_or(0.0))
                .collect();
            Ok(Array2::from_shape_fn((rows, dim), |(i, j)| {
                if j == 0 { i as f32 } else { means.get(i).copied().unwrap_or(0.0) }
            }))
        }
    }

    fn samples(n: usize) -> Vec<SampleRecord> {
        (0..n)
            .map(|i| {
                let image = Array3::from_elem((2, 2, 3), i as u8);
                SampleRecord::new(format!("s{}", i), i as f64, image)
            })
            .collect()
    }

    #[test]
    fn test_state_transitions() {
        let mut pipeline = run(samples(3), CountingBackend::new(), 2).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.next().unwrap().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Emitting);
        assert_eq!(pipeline.stats().batches, 1);

        let rest: Vec<_> = pipeline.by_ref().collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(pipeline.state(), PipelineState::Done);
        assert_eq!(
            pipeline.stats(),
            PipelineStats {
                batches: 2,
                records: 3,
                feature_dim: Some(2),
            }
        );
    }

    #[test]
    fn test_records_carry_sample_features() {
        let records: Vec<FeatureRecord> = run(samples(5), CountingBackend::new(), 2)
            .unwrap()
            .collect::<MlResult<_>>()
            .unwrap();

        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.identifier, format!("s{}", i));
            assert_eq!(record.timestamp, i as f64);
            assert_eq!(record.features[0], (i % 2) as f32);
            assert_eq!(record.features[1], i as f32);
        }
    }

    #[test]
    fn test_row_count_mismatch_is_fatal() {
        let mut backend = CountingBackend::new();
        backend.rows_delta = -1;
        let mut pipeline = run(samples(4), backend, 2).unwrap();

        match pipeline.next() {
            Some(Err(MlError::BatchFailed { index, first, last, source })) => {
                assert_eq!(index, 0);
                assert_eq!((first.as_str(), last.as_str()), ("s0", "s1"));
                assert!(matches!(*source, MlError::InvalidOutputShape { .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(pipeline.next().is_none());
        assert_eq!(pipeline.state(), PipelineState::Failed);
    }

    #[test]
    fn test_feature_dimension_must_stay_constant() {
        let mut backend = CountingBackend::new();
        backend.widen_after = Some(1);
        let results: Vec<_> = run(samples(4), backend, 2).unwrap().collect();

        assert_eq!(results.len(), 3);
        assert!(results[..2].iter().all(Result::is_ok));
        assert!(matches!(results[2], Err(MlError::BatchFailed { index: 1, .. })));
    }

    #[test]
    fn test_batching_error_ends_sequence() {
        let mut stream = samples(4);
        stream[3].image = Array3::zeros((3, 3, 3));
        let results: Vec<_> = run(stream, CountingBackend::new(), 2).unwrap().collect();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[2], Err(MlError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_into_backend() {
        let mut pipeline = run(samples(3), CountingBackend::new(), 3).unwrap();
        pipeline.next();
        let backend = pipeline.into_backend();
        assert_eq!(backend.calls, 1);
    }
}
