//! In-memory graph for backend tests

use std::sync::{Arc, Mutex};

use ndarray::{ArrayD, Axis, IxDyn};

use crate::error::{MlError, MlResult};
use crate::inference::{CompiledGraph, ModelGraph};

/// Number of features per sample the fake plan produces (2 x 2)
pub const FAKE_FEATURE_DIM: usize = 4;

/// Graph with named nodes whose plans emit `mean(sample) + k` for k in 0..4
pub struct FakeGraph {
    nodes: Vec<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    input_dims: Option<Vec<Option<usize>>>,
    output_batch: Option<usize>,
    last_input: Arc<Mutex<Option<ArrayD<f32>>>>,
    compiled: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeGraph {
    pub fn new(nodes: &[&str]) -> Self {
        Self {
            nodes: nodes.iter().map(|s| s.to_string()).collect(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_dims: None,
            output_batch: None,
            last_input: Arc::new(Mutex::new(None)),
            compiled: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Declared input dimensions, `None` for symbolic axes
    pub fn with_input_dims(mut self, dims: &[Option<usize>]) -> Self {
        self.input_dims = Some(dims.to_vec());
        self
    }

    /// Report a fixed leading output axis regardless of the input batch
    pub fn with_output_batch(mut self, rows: usize) -> Self {
        self.output_batch = Some(rows);
        self
    }

    pub fn last_input(&self) -> Option<ArrayD<f32>> {
        self.last_input.lock().ok()?.clone()
    }

    pub fn last_input_shape(&self) -> Option<Vec<usize>> {
        self.last_input().map(|input| input.shape().to_vec())
    }

    /// (input, output) pairs passed to `compile`
    pub fn compiled(&self) -> Vec<(String, String)> {
        self.compiled.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Share state with a clone handed to a backend
    pub fn handle(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            input_dims: self.input_dims.clone(),
            output_batch: self.output_batch,
            last_input: Arc::clone(&self.last_input),
            compiled: Arc::clone(&self.compiled),
        }
    }
}

impl ModelGraph for FakeGraph {
    fn location(&self) -> String {
        "memory://fake".into()
    }

    fn node_names(&self) -> Vec<String> {
        self.nodes.clone()
    }

    fn declared_inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn declared_outputs(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn input_dims(&self, node: &str) -> Option<Vec<Option<usize>>> {
        if !self.nodes.iter().any(|n| n == node) {
            return None;
        }
        self.input_dims.clone()
    }

    fn compile(
        &self,
        input: &str,
        output: &str,
        input_shape: &[usize],
    ) -> MlResult<Box<dyn CompiledGraph>> {
        for node in [input, output] {
            if !self.nodes.iter().any(|n| n == node) {
                return Err(MlError::ModelLoadFailed {
                    reason: format!("node '{}' not in graph", node),
                });
            }
        }
        if let Ok(mut compiled) = self.compiled.lock() {
            compiled.push((input.to_string(), output.to_string()));
        }

        Ok(Box::new(FakePlan {
            input_shape: input_shape.to_vec(),
            output_batch: self.output_batch,
            last_input: Arc::clone(&self.last_input),
        }))
    }
}

struct FakePlan {
    input_shape: Vec<usize>,
    output_batch: Option<usize>,
    last_input: Arc<Mutex<Option<ArrayD<f32>>>>,
}

impl CompiledGraph for FakePlan {
    fn run(&self, input: ArrayD<f32>) -> MlResult<ArrayD<f32>> {
        if input.shape() != self.input_shape.as_slice() {
            return Err(MlError::InvalidInputShape {
                expected: format!("{:?}", self.input_shape),
                got: format!("{:?}", input.shape()),
            });
        }

        let rows = input.len_of(Axis(0));
        let mut output = ArrayD::<f32>::zeros(IxDyn(&[rows, 2, 2]));
        for (i, sample) in input.axis_iter(Axis(0)).enumerate() {
            let mean = sample.mean().unwrap_or(0.0);
            for (k, value) in output.index_axis_mut(Axis(0), i).iter_mut().enumerate() {
                *value = mean + k as f32;
            }
        }

        if let Ok(mut last) = self.last_input.lock() {
            *last = Some(input);
        }
        Ok(output)
    }

    fn output_shape(&self) -> Option<Vec<usize>> {
        let rows = self.output_batch.or_else(|| self.input_shape.first().copied())?;
        Some(vec![rows, 2, 2])
    }
}
