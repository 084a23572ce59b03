// 该文件是 Xunji （寻迹） 项目的一部分。
// src/preprocess.rs - 图像预处理（填充、缩放、归一化）
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{
  RgbImage,
  imageops::{self, FilterType},
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::tensor::{Tensor, TensorError};

const RGB_CHANNELS: usize = 3;
const PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidImage { width: u32, height: u32 },
  #[error("模型输入尺寸无效: {width}x{height}")]
  InvalidModelSize { width: u32, height: u32 },
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
}

/// 填充比例 `(maxSide / w, maxSide / h)`，两者均不小于 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScaleRatio {
  pub x: f32,
  pub y: f32,
}

impl ScaleRatio {
  pub fn from_dimensions(width: u32, height: u32) -> Result<Self, PreprocessError> {
    if width == 0 || height == 0 {
      return Err(PreprocessError::InvalidImage { width, height });
    }
    let max_side = width.max(height) as f32;
    Ok(Self {
      x: max_side / width as f32,
      y: max_side / height as f32,
    })
  }

  pub fn as_pair(&self) -> [f32; 2] {
    [self.x, self.y]
  }
}

/// 预处理结果，`ratio` 只对本次调用有效
#[derive(Debug)]
pub struct Preprocessed {
  /// NHWC 张量 `[1, model_height, model_width, 3]`，取值 `[0, 1]`
  pub input: Tensor,
  pub ratio: ScaleRatio,
  pub source_width: u32,
  pub source_height: u32,
}

/// 只在右侧和下方补零，使图像成为 `maxSide x maxSide` 的正方形。
/// 原点不变，因此反向映射无需平移。
pub fn letterbox(image: &RgbImage) -> RgbImage {
  let (width, height) = image.dimensions();
  if width == height {
    return image.clone();
  }
  let max_side = width.max(height);
  let mut canvas = RgbImage::new(max_side, max_side);
  imageops::replace(&mut canvas, image, 0, 0);
  canvas
}

pub fn preprocess(
  image: &RgbImage,
  model_width: u32,
  model_height: u32,
) -> Result<Preprocessed, PreprocessError> {
  let (width, height) = image.dimensions();
  let ratio = ScaleRatio::from_dimensions(width, height)?;
  if model_width == 0 || model_height == 0 {
    return Err(PreprocessError::InvalidModelSize {
      width: model_width,
      height: model_height,
    });
  }

  let padded = letterbox(image);
  // Triangle 即双线性插值
  let resized = imageops::resize(&padded, model_width, model_height, FilterType::Triangle);

  let data: Vec<f32> = resized
    .as_raw()
    .iter()
    .map(|&v| v as f32 / PIXEL_SCALE)
    .collect();
  let input = Tensor::from_f32(
    &[model_height as usize, model_width as usize, RGB_CHANNELS],
    data,
  )?
  .expand_dims(0)?;

  debug!(
    "预处理: {}x{} -> 填充 {} -> {}x{}, 比例 ({:.4}, {:.4})",
    width,
    height,
    width.max(height),
    model_width,
    model_height,
    ratio.x,
    ratio.y
  );

  Ok(Preprocessed {
    input,
    ratio,
    source_width: width,
    source_height: height,
  })
}
