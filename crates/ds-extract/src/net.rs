//! Layer-list network runtime (candle)
//!
//! Networks are described by a JSON definition listing layers in execution
//! order, each reading one blob and writing one blob, with parameters stored
//! separately in a safetensors file under `<layer>.weight` / `<layer>.bias`.
//! Only inference-time behavior is implemented.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear};
use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};

fn one() -> usize {
    1
}

fn one_f64() -> f64 {
    1.0
}

fn default_input() -> String {
    "data".to_string()
}

/// Pooling reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolMethod {
    #[default]
    Max,
    Ave,
}

/// Layer operation and its hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Convolution {
        num_output: usize,
        kernel_size: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        pad: usize,
        #[serde(default = "one")]
        group: usize,
    },
    Relu,
    Pooling {
        #[serde(default)]
        pool: PoolMethod,
        #[serde(default)]
        kernel_size: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        global: bool,
    },
    InnerProduct {
        num_output: usize,
    },
    /// Local response normalization across channels
    Lrn {
        local_size: usize,
        alpha: f64,
        beta: f64,
        #[serde(default = "one_f64")]
        k: f64,
    },
    Dropout,
    Flatten,
    Softmax,
}

/// One entry of the layer list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub bottom: String,
    pub top: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

/// Network definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetDefinition {
    pub name: String,
    /// Input blob name
    #[serde(default = "default_input")]
    pub input: String,
    /// Input blob shape [N, C, H, W]
    pub input_shape: [usize; 4],
    /// Per-channel pixel mean in network channel order (BGR)
    #[serde(default)]
    pub mean: Vec<f32>,
    /// Factor applied to [0, 255] pixel values before mean subtraction
    #[serde(default)]
    pub raw_scale: Option<f32>,
    pub layers: Vec<LayerSpec>,
}

impl NetDefinition {
    /// Parse definition JSON from disk
    pub fn read(path: &Path) -> MlResult<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| MlError::ModelLoadFailed {
            reason: format!("{}: {}", path.display(), e),
        })
    }
}

enum Op {
    Conv(Conv2d),
    Relu,
    MaxPool { kernel: usize, stride: usize },
    AvePool { kernel: usize, stride: usize },
    GlobalMax,
    GlobalAve,
    Linear(Linear),
    Lrn { size: usize, alpha: f64, beta: f64, k: f64 },
    Identity,
    Flatten,
    Softmax,
}

impl Op {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Op::Conv(conv) => conv.forward(x),
            Op::Relu => x.relu(),
            Op::MaxPool { kernel, stride } => x.max_pool2d_with_stride(*kernel, *stride),
            Op::AvePool { kernel, stride } => x.avg_pool2d_with_stride(*kernel, *stride),
            Op::GlobalMax => x.max_keepdim(3)?.max_keepdim(2),
            Op::GlobalAve => x.mean_keepdim(3)?.mean_keepdim(2),
            Op::Linear(linear) => {
                if x.rank() > 2 {
                    linear.forward(&x.flatten_from(1)?)
                } else {
                    linear.forward(x)
                }
            }
            Op::Lrn {
                size,
                alpha,
                beta,
                k,
            } => lrn(x, *size, *alpha, *beta, *k),
            Op::Identity => Ok(x.clone()),
            Op::Flatten => x.flatten_from(1),
            Op::Softmax => candle_nn::ops::softmax(x, 1),
        }
    }
}

/// x / (k + alpha / n * sum of squares over n neighbouring channels) ^ beta
fn lrn(x: &Tensor, size: usize, alpha: f64, beta: f64, k: f64) -> candle_core::Result<Tensor> {
    let channels = x.dim(1)?;
    let half = (size - 1) / 2;
    let padded = x.sqr()?.pad_with_zeros(1, half, size - 1 - half)?;

    let mut sum = padded.narrow(1, 0, channels)?;
    for offset in 1..size {
        sum = (sum + padded.narrow(1, offset, channels)?)?;
    }

    let scale = sum.affine(alpha / size as f64, k)?.powf(beta)?;
    x.div(&scale)
}

struct Layer {
    name: String,
    bottom: String,
    top: String,
    op: Op,
}

/// Network ready for inference on one device
pub struct Network {
    name: String,
    input: String,
    input_shape: [usize; 4],
    mean: Vec<f32>,
    raw_scale: Option<f32>,
    layers: Vec<Layer>,
    device: Device,
}

impl Network {
    /// Load definition and safetensors weights
    pub fn load(definition: &Path, weights: &Path, device: &Device) -> MlResult<Self> {
        let definition = NetDefinition::read(definition)?;
        let tensors = candle_core::safetensors::load(weights, device).map_err(|e| {
            MlError::ModelLoadFailed {
                reason: format!("{}: {}", weights.display(), e),
            }
        })?;
        Self::from_parts(definition, tensors, device)
    }

    /// Build network from a parsed definition and named weight tensors
    pub fn from_parts(
        definition: NetDefinition,
        mut weights: HashMap<String, Tensor>,
        device: &Device,
    ) -> MlResult<Self> {
        let mut known = vec![definition.input.clone()];
        let mut layers = Vec::with_capacity(definition.layers.len());

        for spec in definition.layers {
            if !known.contains(&spec.bottom) {
                return Err(MlError::ModelLoadFailed {
                    reason: format!(
                        "layer '{}' reads blob '{}' before it is written",
                        spec.name, spec.bottom
                    ),
                });
            }

            let op = prepare(&spec, &mut weights)?;
            if !known.contains(&spec.top) {
                known.push(spec.top.clone());
            }
            layers.push(Layer {
                name: spec.name,
                bottom: spec.bottom,
                top: spec.top,
                op,
            });
        }

        log::debug!(
            "Built network '{}' with {} layers",
            definition.name,
            layers.len()
        );

        Ok(Self {
            name: definition.name,
            input: definition.input,
            input_shape: definition.input_shape,
            mean: definition.mean,
            raw_scale: definition.raw_scale,
            layers,
            device: device.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Input blob shape [N, C, H, W]
    pub fn input_shape(&self) -> [usize; 4] {
        self.input_shape
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn raw_scale(&self) -> Option<f32> {
        self.raw_scale
    }

    /// Reshape the input blob to `n` samples
    pub fn reshape_input(&mut self, n: usize) {
        if self.input_shape[0] != n {
            log::debug!(
                "Reshaping '{}' input from {} to {} samples",
                self.name,
                self.input_shape[0],
                n
            );
            self.input_shape[0] = n;
        }
    }

    /// Blob names in order of first write, excluding the input
    pub fn blobs(&self) -> Vec<String> {
        let mut blobs: Vec<String> = Vec::new();
        for layer in &self.layers {
            if layer.top != self.input && !blobs.contains(&layer.top) {
                blobs.push(layer.top.clone());
            }
        }
        blobs
    }

    /// Run layers up to the last writer of `target` and return that blob
    pub fn forward(&self, input: Tensor, target: &str) -> MlResult<Tensor> {
        let dims = input.dims();
        if dims != self.input_shape.as_slice() {
            return Err(MlError::InvalidInputShape {
                expected: format!("{:?}", self.input_shape),
                got: format!("{:?}", dims),
            });
        }

        let last = self
            .layers
            .iter()
            .rposition(|layer| layer.top == target)
            .ok_or_else(|| MlError::unknown_layer(target, self.blobs()))?;

        let mut blobs: HashMap<&str, Tensor> = HashMap::new();
        blobs.insert(self.input.as_str(), input);

        for layer in &self.layers[..=last] {
            let output = {
                let x = blobs.get(layer.bottom.as_str()).ok_or_else(|| MlError::InferenceFailed {
                    reason: format!("blob '{}' missing for layer '{}'", layer.bottom, layer.name),
                })?;
                layer.op.forward(x).map_err(|e| {
                    MlError::from_runtime(format!("layer '{}': {}", layer.name, e))
                })?
            };
            blobs.insert(layer.top.as_str(), output);
        }

        blobs.remove(target).ok_or_else(|| MlError::InferenceFailed {
            reason: format!("blob '{}' was not produced", target),
        })
    }
}

fn take_param(
    weights: &mut HashMap<String, Tensor>,
    layer: &str,
    param: &str,
) -> MlResult<Tensor> {
    let key = format!("{}.{}", layer, param);
    let tensor = weights.remove(&key).ok_or_else(|| MlError::ModelLoadFailed {
        reason: format!("missing parameter '{}'", key),
    })?;
    tensor.to_dtype(DType::F32).map_err(|e| MlError::ModelLoadFailed {
        reason: format!("parameter '{}': {}", key, e),
    })
}

fn check_dims(layer: &str, tensor: &Tensor, expected: &[usize]) -> MlResult<()> {
    let dims = tensor.dims();
    let matches = dims.len() == expected.len()
        && dims
            .iter()
            .zip(expected)
            .all(|(&got, &want)| want == 0 || got == want);
    if matches {
        Ok(())
    } else {
        Err(MlError::ModelLoadFailed {
            reason: format!("layer '{}' weight shape {:?}, expected {:?}", layer, dims, expected),
        })
    }
}

fn prepare(spec: &LayerSpec, weights: &mut HashMap<String, Tensor>) -> MlResult<Op> {
    let op = match spec.kind {
        LayerKind::Convolution {
            num_output,
            kernel_size,
            stride,
            pad,
            group,
        } => {
            let weight = take_param(weights, &spec.name, "weight")?;
            let bias = take_param(weights, &spec.name, "bias")?;
            check_dims(&spec.name, &weight, &[num_output, 0, kernel_size, kernel_size])?;
            check_dims(&spec.name, &bias, &[num_output])?;
            let config = Conv2dConfig {
                padding: pad,
                stride,
                groups: group,
                ..Default::default()
            };
            Op::Conv(Conv2d::new(weight, Some(bias), config))
        }
        LayerKind::InnerProduct { num_output } => {
            let weight = take_param(weights, &spec.name, "weight")?;
            let bias = take_param(weights, &spec.name, "bias")?;
            check_dims(&spec.name, &weight, &[num_output, 0])?;
            check_dims(&spec.name, &bias, &[num_output])?;
            Op::Linear(Linear::new(weight, Some(bias)))
        }
        LayerKind::Pooling { global: true, pool, .. } => match pool {
            PoolMethod::Max => Op::GlobalMax,
            PoolMethod::Ave => Op::GlobalAve,
        },
        LayerKind::Pooling {
            pool,
            kernel_size,
            stride,
            ..
        } => {
            if kernel_size == 0 || stride == 0 {
                return Err(MlError::ModelLoadFailed {
                    reason: format!("pooling layer '{}' needs kernel_size and stride", spec.name),
                });
            }
            match pool {
                PoolMethod::Max => Op::MaxPool {
                    kernel: kernel_size,
                    stride,
                },
                PoolMethod::Ave => Op::AvePool {
                    kernel: kernel_size,
                    stride,
                },
            }
        }
        LayerKind::Lrn {
            local_size,
            alpha,
            beta,
            k,
        } => {
            if local_size == 0 {
                return Err(MlError::ModelLoadFailed {
                    reason: format!("lrn layer '{}' has local_size 0", spec.name),
                });
            }
            Op::Lrn {
                size: local_size,
                alpha,
                beta,
                k,
            }
        }
        LayerKind::Relu => Op::Relu,
        LayerKind::Dropout => Op::Identity,
        LayerKind::Flatten => Op::Flatten,
        LayerKind::Softmax => Op::Softmax,
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tensor(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn tiny_definition() -> NetDefinition {
        serde_json::from_str(
            r#"{
                "name": "tiny",
                "input_shape": [1, 1, 4, 4],
                "layers": [
                    {"name": "conv1", "type": "convolution", "bottom": "data", "top": "conv1",
                     "num_output": 2, "kernel_size": 3},
                    {"name": "relu1", "type": "relu", "bottom": "conv1", "top": "conv1"},
                    {"name": "pool1", "type": "pooling", "bottom": "conv1", "top": "pool1",
                     "pool": "max", "global": true},
                    {"name": "drop1", "type": "dropout", "bottom": "pool1", "top": "pool1"},
                    {"name": "fc", "type": "inner_product", "bottom": "pool1", "top": "fc",
                     "num_output": 1},
                    {"name": "prob", "type": "softmax", "bottom": "fc", "top": "prob"}
                ]
            }"#,
        )
        .unwrap()
    }

    fn tiny_weights() -> HashMap<String, Tensor> {
        HashMap::from([
            (
                "conv1.weight".to_string(),
                Tensor::ones((2, 1, 3, 3), DType::F32, &Device::Cpu).unwrap(),
            ),
            ("conv1.bias".to_string(), tensor(&[0.0, 1.0], &[2])),
            ("fc.weight".to_string(), tensor(&[1.0, -1.0], &[1, 2])),
            ("fc.bias".to_string(), tensor(&[0.5], &[1])),
        ])
    }

    fn tiny() -> Network {
        Network::from_parts(tiny_definition(), tiny_weights(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_definition_defaults() {
        let def = tiny_definition();
        assert_eq!(def.input, "data");
        assert!(def.mean.is_empty());
        assert!(matches!(
            def.layers[0].kind,
            LayerKind::Convolution { stride: 1, pad: 0, group: 1, .. }
        ));
    }

    #[test]
    fn test_blobs_exclude_input() {
        assert_eq!(tiny().blobs(), vec!["conv1", "pool1", "fc", "prob"]);
    }

    #[test]
    fn test_forward_stops_at_target() {
        let net = tiny();
        let input = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();

        let pool = net.forward(input.clone(), "pool1").unwrap();
        assert_eq!(pool.dims(), &[1, 2, 1, 1]);
        let values = pool.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![9.0, 10.0]);

        let fc = net.forward(input.clone(), "fc").unwrap();
        let values = fc.to_vec2::<f32>().unwrap();
        assert_abs_diff_eq!(values[0][0], -0.5, epsilon = 1e-5);

        let prob = net.forward(input, "prob").unwrap();
        assert_abs_diff_eq!(prob.to_vec2::<f32>().unwrap()[0][0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_in_place_relu() {
        let net = tiny();
        let input = tensor(&[-1.0; 16], &[1, 1, 4, 4]);
        let conv = net.forward(input, "conv1").unwrap();
        let values = conv.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        // channel 0: -9 clipped, channel 1: -8 clipped
        assert!(values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_unknown_blob() {
        let net = tiny();
        let input = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        match net.forward(input, "fc7") {
            Err(MlError::UnknownLayer { available, .. }) => {
                assert_eq!(available, vec!["conv1", "fc", "pool1", "prob"]);
            }
            other => panic!("unexpected result: {:?}", other.map(|t| t.dims().to_vec())),
        }
    }

    #[test]
    fn test_reshape_input() {
        let mut net = tiny();
        net.reshape_input(3);
        assert_eq!(net.input_shape(), [3, 1, 4, 4]);

        let input = Tensor::ones((3, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let fc = net.forward(input, "fc").unwrap();
        assert_eq!(fc.dims(), &[3, 1]);

        let wrong = Tensor::ones((2, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(net.forward(wrong, "fc"), Err(MlError::InvalidInputShape { .. })));
    }

    #[test]
    fn test_missing_weight() {
        let mut weights = tiny_weights();
        weights.remove("fc.bias");
        let result = Network::from_parts(tiny_definition(), weights, &Device::Cpu);
        assert!(matches!(result, Err(MlError::ModelLoadFailed { .. })));
    }

    #[test]
    fn test_wrong_weight_shape() {
        let mut weights = tiny_weights();
        weights.insert("fc.weight".into(), tensor(&[1.0, 1.0, 1.0], &[1, 3]));
        // shape [1, 3] passes the load check, the forward pass rejects it
        let net = Network::from_parts(tiny_definition(), weights.clone(), &Device::Cpu).unwrap();
        let input = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(net.forward(input, "fc").is_err());

        weights.insert("fc.weight".into(), tensor(&[1.0, 1.0], &[2, 1]));
        let result = Network::from_parts(tiny_definition(), weights, &Device::Cpu);
        assert!(matches!(result, Err(MlError::ModelLoadFailed { .. })));
    }

    #[test]
    fn test_bottom_must_exist() {
        let mut def = tiny_definition();
        def.layers[2].bottom = "conv9".into();
        let result = Network::from_parts(def, tiny_weights(), &Device::Cpu);
        assert!(matches!(result, Err(MlError::ModelLoadFailed { .. })));
    }

    #[test]
    fn test_strided_pooling() {
        let x = tensor(&(0..16).map(|v| v as f32).collect::<Vec<_>>(), &[1, 1, 4, 4]);
        let max = Op::MaxPool { kernel: 2, stride: 2 }.forward(&x).unwrap();
        let max = max.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(max, vec![5.0, 7.0, 13.0, 15.0]);

        let ave = Op::AvePool { kernel: 2, stride: 2 }.forward(&x).unwrap();
        let ave = ave.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(ave, vec![2.5, 4.5, 10.5, 12.5]);
    }

    #[test]
    fn test_lrn_across_channels() {
        let x = tensor(&[1.0, 2.0, 3.0], &[1, 3, 1, 1]);
        let y = lrn(&x, 3, 3.0, 1.0, 1.0).unwrap();
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(values[0], 1.0 / 6.0, epsilon = 1e-6);
        assert_abs_diff_eq!(values[1], 2.0 / 15.0, epsilon = 1e-6);
        assert_abs_diff_eq!(values[2], 3.0 / 14.0, epsilon = 1e-6);
    }
}
