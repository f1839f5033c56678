//! Fixed-batch compiled plans shared by the graph runtimes

use ndarray::{Array2, Array4, Axis};

use crate::error::{MlError, MlResult};
use crate::inference::{CompiledGraph, ModelGraph};
use crate::preprocess;

/// Compiled graph whose leading input axis is fixed to `batch_size`
///
/// Smaller batches are zero-padded before the forward pass and the padding
/// rows are dropped from the output. Larger batches run as several passes.
pub struct FixedBatchPlan {
    plan: Box<dyn CompiledGraph>,
    batch_size: usize,
    sample_shape: (usize, usize, usize),
    output_node: String,
}

impl FixedBatchPlan {
    /// Compile `input -> output` for `batch_size` samples of `sample_shape` (H, W, C)
    pub fn compile(
        graph: &dyn ModelGraph,
        input: &str,
        output: &str,
        sample_shape: (usize, usize, usize),
        batch_size: usize,
    ) -> MlResult<Self> {
        let (h, w, c) = sample_shape;
        let plan = graph.compile(input, output, &[batch_size, h, w, c])?;

        match plan.output_shape() {
            Some(shape) if shape.first() != Some(&batch_size) || shape.len() < 2 => {
                return Err(MlError::InvalidOutputShape {
                    expected: format!("[{}, ...] at '{}'", batch_size, output),
                    got: format!("{:?}", shape),
                });
            }
            Some(shape) => log::debug!("Output '{}' has shape {:?}", output, shape),
            None => log::debug!("Output '{}' has no static shape", output),
        }

        Ok(Self {
            plan,
            batch_size,
            sample_shape,
            output_node: output.to_string(),
        })
    }

    /// Samples per forward pass
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Per-sample input shape (H, W, C)
    pub fn sample_shape(&self) -> (usize, usize, usize) {
        self.sample_shape
    }

    /// Node the features are read from
    pub fn output_node(&self) -> &str {
        &self.output_node
    }

    /// Run a preprocessed NHWC batch and return one flat row per sample
    pub fn run(&self, input: Array4<f32>) -> MlResult<Array2<f32>> {
        let (n, h, w, c) = input.dim();
        if (h, w, c) != self.sample_shape {
            return Err(MlError::InvalidInputShape {
                expected: format!("{:?}", self.sample_shape),
                got: format!("{:?}", (h, w, c)),
            });
        }

        if n <= self.batch_size {
            return self.run_pass(input);
        }

        log::debug!(
            "Splitting {} samples into passes of {}",
            n,
            self.batch_size
        );
        let passes = input
            .axis_chunks_iter(Axis(0), self.batch_size)
            .map(|chunk| self.run_pass(chunk.to_owned()))
            .collect::<MlResult<Vec<_>>>()?;
        let views: Vec<_> = passes.iter().map(|rows| rows.view()).collect();
        ndarray::concatenate(Axis(0), &views).map_err(|e| MlError::InvalidOutputShape {
            expected: format!("equal feature width across {} passes", passes.len()),
            got: e.to_string(),
        })
    }

    fn run_pass(&self, input: Array4<f32>) -> MlResult<Array2<f32>> {
        let n = input.len_of(Axis(0));
        let padded = preprocess::pad_batch(input, self.batch_size)?;
        let output = self.plan.run(padded.into_dyn())?;
        preprocess::flatten_per_sample(output, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeGraph;

    #[test]
    fn test_partial_batch_is_padded() {
        let graph = FakeGraph::new(&["net/input", "net/fc7"]);
        let plan = FixedBatchPlan::compile(&graph, "net/input", "net/fc7", (2, 2, 3), 4).unwrap();

        let input = Array4::<f32>::from_elem((3, 2, 2, 3), 2.0);
        let rows = plan.run(input).unwrap();
        assert_eq!(rows.nrows(), 3);
        assert_eq!(graph.last_input_shape(), Some(vec![4, 2, 2, 3]));
    }

    #[test]
    fn test_oversized_batch_runs_in_passes() {
        let graph = FakeGraph::new(&["net/input", "net/fc7"]);
        let plan = FixedBatchPlan::compile(&graph, "net/input", "net/fc7", (1, 1, 1), 2).unwrap();

        let input = Array4::from_shape_fn((5, 1, 1, 1), |(i, _, _, _)| i as f32 * 10.0);
        let rows = plan.run(input).unwrap();

        assert_eq!(rows.dim(), (5, 4));
        let firsts: Vec<f32> = rows.column(0).to_vec();
        assert_eq!(firsts, vec![0.0, 10.0, 20.0, 30.0, 40.0]);
        // last pass holds one sample plus padding
        assert_eq!(graph.last_input_shape(), Some(vec![2, 1, 1, 1]));
    }

    #[test]
    fn test_output_without_batch_axis_rejected_at_compile() {
        let graph = FakeGraph::new(&["net/input", "net/fc7"]).with_output_batch(1);
        let result = FixedBatchPlan::compile(&graph, "net/input", "net/fc7", (2, 2, 3), 4);
        assert!(matches!(result, Err(MlError::InvalidOutputShape { .. })));
    }

    #[test]
    fn test_wrong_sample_shape_rejected() {
        let graph = FakeGraph::new(&["net/input", "net/fc7"]);
        let plan = FixedBatchPlan::compile(&graph, "net/input", "net/fc7", (2, 2, 3), 4).unwrap();
        let input = Array4::<f32>::zeros((1, 3, 3, 3));
        assert!(matches!(plan.run(input), Err(MlError::InvalidInputShape { .. })));
    }
}
