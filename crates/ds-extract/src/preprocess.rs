//! Image batch preprocessing
//!
//! Conversions between the renderer's n x H x W x C `u8` batches and the
//! float tensors the runtimes consume: resizing, channel order, pixel
//! normalization, layout changes and batch padding.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel as ImagePixel, Rgb, Rgba};
use ndarray::{Array2, Array3, Array4, ArrayD, ArrayView3, ArrayView4, Axis, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};

/// ImageNet channel means in BGR order (caffe convention)
pub const IMAGENET_BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

/// ImageNet channel means in RGB order, for [0, 1] scaled input
pub const IMAGENET_RGB_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations in RGB order
pub const IMAGENET_RGB_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-pixel normalization applied to an NHWC float batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PixelTransform {
    /// Leave values in [0, 255]
    #[default]
    Identity,
    /// Reverse channel order (RGB -> BGR)
    ChannelReverse,
    /// RGB -> BGR, then subtract per-channel mean (BGR order)
    Caffe { mean: [f32; 3] },
    /// Scale to [-1, 1]
    Tf,
    /// Scale to [0, 1], subtract mean and divide by std (RGB order)
    Torch { mean: [f32; 3], std: [f32; 3] },
}

impl PixelTransform {
    /// Apply in place
    pub fn apply(&self, batch: &mut Array4<f32>) {
        match self {
            PixelTransform::Identity => {}
            PixelTransform::ChannelReverse => reverse_channels(batch),
            PixelTransform::Caffe { mean } => {
                reverse_channels(batch);
                subtract_mean(batch, mean);
            }
            PixelTransform::Tf => batch.mapv_inplace(|v| v / 127.5 - 1.0),
            PixelTransform::Torch { mean, std } => {
                batch.mapv_inplace(|v| v / 255.0);
                for (c, mut channel) in batch.axis_iter_mut(Axis(3)).enumerate() {
                    let m = mean.get(c).copied().unwrap_or(0.0);
                    let d = std.get(c).copied().unwrap_or(1.0);
                    channel.mapv_inplace(|v| (v - m) / d);
                }
            }
        }
    }
}

/// Convert u8 batch to f32
pub fn to_float(images: ArrayView4<'_, u8>) -> Array4<f32> {
    images.mapv(f32::from)
}

/// Reverse channel order of an NHWC batch in place
pub fn reverse_channels(batch: &mut Array4<f32>) {
    let reversed = batch.slice(s![.., .., .., ..;-1]).to_owned();
    *batch = reversed;
}

/// Subtract per-channel mean from an NHWC batch
///
/// Channels beyond the mean's length are left untouched.
pub fn subtract_mean(batch: &mut Array4<f32>, mean: &[f32]) {
    for (c, mut channel) in batch.axis_iter_mut(Axis(3)).enumerate() {
        if let Some(&m) = mean.get(c) {
            channel.mapv_inplace(|v| v - m);
        }
    }
}

/// NHWC -> NCHW
pub fn to_channel_first(batch: Array4<f32>) -> Array4<f32> {
    batch.permuted_axes([0, 3, 1, 2]).as_standard_layout().to_owned()
}

/// Zero-pad the batch axis up to `target` samples
pub fn pad_batch(batch: Array4<f32>, target: usize) -> MlResult<Array4<f32>> {
    let (n, h, w, c) = batch.dim();
    if n > target {
        return Err(MlError::InvalidInputShape {
            expected: format!("at most {} samples", target),
            got: format!("{} samples", n),
        });
    }
    if n == target {
        return Ok(batch);
    }

    let mut padded = Array4::<f32>::zeros((target, h, w, c));
    padded.slice_mut(s![..n, .., .., ..]).assign(&batch);
    Ok(padded)
}

/// Flatten all but the first axis and keep the first `n` rows
pub fn flatten_per_sample(output: ArrayD<f32>, n: usize) -> MlResult<Array2<f32>> {
    let shape = output.shape().to_vec();
    let Some((&rows, rest)) = shape.split_first() else {
        return Err(MlError::InvalidOutputShape {
            expected: format!("tensor with leading batch axis of at least {}", n),
            got: "scalar".into(),
        });
    };
    if rows < n {
        return Err(MlError::InvalidOutputShape {
            expected: format!("leading batch axis of at least {}", n),
            got: format!("{:?}", shape),
        });
    }

    let dim: usize = rest.iter().product();
    let flat = output
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((rows, dim))
        .map_err(|e| MlError::InvalidOutputShape {
            expected: format!("({}, {})", rows, dim),
            got: e.to_string(),
        })?;

    Ok(flat.slice(s![..n, ..]).to_owned())
}

/// Resize every image in the batch to `height` x `width`
pub fn resize_batch(
    images: ArrayView4<'_, u8>,
    height: usize,
    width: usize,
) -> MlResult<Array4<u8>> {
    let (n, h, w, c) = images.dim();
    if h == height && w == width {
        return Ok(images.to_owned());
    }

    let resized: Vec<Array3<u8>> = (0..n)
        .into_par_iter()
        .map(|i| resize_image(images.index_axis(Axis(0), i), height, width))
        .collect::<MlResult<_>>()?;

    let mut out = Array4::<u8>::zeros((n, height, width, c));
    for (mut slot, image) in out.axis_iter_mut(Axis(0)).zip(resized) {
        slot.assign(&image);
    }
    Ok(out)
}

/// Resize one H x W x C image with bilinear filtering
pub fn resize_image(
    image: ArrayView3<'_, u8>,
    height: usize,
    width: usize,
) -> MlResult<Array3<u8>> {
    let (h, w, c) = image.dim();
    if h == height && w == width {
        return Ok(image.to_owned());
    }

    let raw: Vec<u8> = image.iter().copied().collect();
    let data = match c {
        1 => resize_raw::<Luma<u8>>(raw, h, w, height, width),
        3 => resize_raw::<Rgb<u8>>(raw, h, w, height, width),
        4 => resize_raw::<Rgba<u8>>(raw, h, w, height, width),
        _ => {
            return Err(MlError::InvalidInputShape {
                expected: "1, 3 or 4 channels".into(),
                got: format!("{} channels", c),
            });
        }
    }?;

    Array3::from_shape_vec((height, width, c), data).map_err(|e| MlError::InvalidInputShape {
        expected: format!("({}, {}, {})", height, width, c),
        got: e.to_string(),
    })
}

fn resize_raw<P>(raw: Vec<u8>, h: usize, w: usize, height: usize, width: usize) -> MlResult<Vec<u8>>
where
    P: ImagePixel<Subpixel = u8> + 'static,
{
    let buffer: ImageBuffer<P, Vec<u8>> = ImageBuffer::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| MlError::InvalidInputShape {
            expected: format!("{} x {} pixel buffer", h, w),
            got: "short buffer".into(),
        })?;
    let resized = imageops::resize(&buffer, width as u32, height as u32, FilterType::Triangle);
    Ok(resized.into_raw())
}
