// 该文件是 Xunji （寻迹） 项目的一部分。
// src/model.rs - 模型能力接口与加载
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

use std::{io::Read, path::Path};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::tensor::Tensor;

const BOX_CHANNELS: usize = 4;
const LOAD_CHUNK_SIZE: usize = 1 << 20;

/// 模型声明的输入形状 `[batch, width, height, channels]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
  pub batch: usize,
  pub width: u32,
  pub height: u32,
  pub channels: usize,
}

impl InputShape {
  pub fn square(size: u32) -> Self {
    Self {
      batch: 1,
      width: size,
      height: size,
      channels: 3,
    }
  }
}

impl TryFrom<[usize; 4]> for InputShape {
  type Error = std::num::TryFromIntError;

  fn try_from(dims: [usize; 4]) -> Result<Self, Self::Error> {
    Ok(Self {
      batch: dims[0],
      width: u32::try_from(dims[1])?,
      height: u32::try_from(dims[2])?,
      channels: dims[3],
    })
  }
}

/// 推理后端需要提供的能力：声明输入形状，并执行一次推理。
///
/// 输入为 NHWC 的 `[1, height, width, 3]` 张量，输出为 `[1, C, A]`，
/// 其中 `C = 4 + 类别数 + 关键点通道数`，`A` 为锚点数。
pub trait Model {
  type Error: std::error::Error + Send + Sync + 'static;

  fn input_shape(&self) -> InputShape;

  /// 模型声明的关键点通道数，未声明时由输出推断
  fn keypoint_channels(&self) -> Option<usize> {
    None
  }

  fn execute(&self, input: &Tensor) -> Result<Tensor, Self::Error>;
}

impl<M: Model + ?Sized> Model for &M {
  type Error = M::Error;

  fn input_shape(&self) -> InputShape {
    (**self).input_shape()
  }

  fn keypoint_channels(&self) -> Option<usize> {
    (**self).keypoint_channels()
  }

  fn execute(&self, input: &Tensor) -> Result<Tensor, Self::Error> {
    (**self).execute(input)
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("推理输出形状不符: 期望 {expected}, 实际 {actual:?}")]
  InferenceShape { expected: String, actual: Vec<usize> },
  #[error("推理失败: {0}")]
  Execute(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// 原始输出的通道数与锚点数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLayout {
  pub channels: usize,
  pub anchors: usize,
  pub keypoints: usize,
}

/// 检查原始输出是否满足 `[1, 4 + num_classes + K, A]`
pub fn check_output(
  output: &Tensor,
  num_classes: usize,
  keypoints: Option<usize>,
) -> Result<OutputLayout, ModelError> {
  let min_channels = BOX_CHANNELS + num_classes;
  let expected = match keypoints {
    Some(k) => format!("[1, {}, A]", min_channels + k),
    None => format!("[1, >={}, A]", min_channels),
  };
  let mismatch = || ModelError::InferenceShape {
    expected: expected.clone(),
    actual: output.shape().to_vec(),
  };

  let &[batch, channels, anchors] = output.shape() else {
    return Err(mismatch());
  };
  if batch != 1 || channels < min_channels {
    return Err(mismatch());
  }
  if let Some(k) = keypoints
    && channels != min_channels + k
  {
    return Err(mismatch());
  }

  Ok(OutputLayout {
    channels,
    anchors,
    keypoints: channels - min_channels,
  })
}

/// 执行推理并检查输出形状，形状错误对本次调用是致命的
pub fn infer<M: Model>(
  model: &M,
  input: &Tensor,
  num_classes: usize,
) -> Result<(Tensor, OutputLayout), ModelError> {
  debug!("执行模型推理, 输入形状 {:?}", input.shape());
  let output = model
    .execute(input)
    .map_err(|e| ModelError::Execute(Box::new(e)))?;
  let layout = check_output(&output, num_classes, model.keypoint_channels()).inspect_err(|e| {
    error!("{}", e);
  })?;
  debug!(
    "模型输出: {} 通道, {} 锚点, {} 关键点通道",
    layout.channels, layout.anchors, layout.keypoints
  );
  Ok((output, layout))
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型文件读取错误 {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },
  #[error("模型文件为空: {0}")]
  Empty(String),
  #[error("模型路径错误: {0}")]
  ModelPath(String),
  #[error("模型后端错误: {0}")]
  Backend(String),
}

/// 模型加载进度回调，参数为 `[0, 1]` 内的完成比例
pub trait LoadProgress {
  fn on_progress(&mut self, fraction: f32);
}

impl<F: FnMut(f32)> LoadProgress for F {
  fn on_progress(&mut self, fraction: f32) {
    self(fraction)
  }
}

/// 以日志输出加载进度
#[derive(Debug, Default)]
pub struct LogProgress {
  last_percent: Option<u32>,
}

impl LoadProgress for LogProgress {
  fn on_progress(&mut self, fraction: f32) {
    let percent = (fraction * 100.0) as u32 / 10 * 10;
    if self.last_percent != Some(percent) {
      self.last_percent = Some(percent);
      info!("模型加载中... {:.2}%", fraction * 100.0);
    }
  }
}

/// 分块读取模型文件并上报进度，最后一次上报恒为 1.0
pub fn read_model_bytes<P: LoadProgress + ?Sized>(
  path: &Path,
  progress: &mut P,
) -> Result<Vec<u8>, ModelLoadError> {
  let path_str = path.display().to_string();
  let io_err = |source: std::io::Error| ModelLoadError::Io {
    path: path_str.clone(),
    source,
  };

  info!("加载模型文件: {}", path_str);
  let mut file = std::fs::File::open(path).map_err(io_err)?;
  let total = file.metadata().map_err(io_err)?.len() as usize;
  if total == 0 {
    error!("模型文件为空: {}", path_str);
    return Err(ModelLoadError::Empty(path_str.clone()));
  }

  let mut data = Vec::with_capacity(total);
  let mut chunk = vec![0u8; LOAD_CHUNK_SIZE];
  progress.on_progress(0.0);
  loop {
    let n = file.read(&mut chunk).map_err(io_err)?;
    if n == 0 {
      break;
    }
    data.extend_from_slice(&chunk[..n]);
    progress.on_progress((data.len() as f32 / total as f32).min(1.0));
  }
  progress.on_progress(1.0);

  debug!(
    "模型文件大小: {:.2} MB",
    data.len() as f64 / (1024.0 * 1024.0)
  );
  Ok(data)
}

#[cfg(feature = "onnx_model")]
mod onnx;
#[cfg(feature = "onnx_model")]
pub use self::onnx::{OnnxModel, OnnxModelBuilder};

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn accepts_declared_layout() {
    let out = Tensor::zeros(&[1, 56, 10]);
    let layout = check_output(&out, 1, Some(51)).unwrap();
    assert_eq!(
      layout,
      OutputLayout {
        channels: 56,
        anchors: 10,
        keypoints: 51
      }
    );
  }

  #[test]
  fn infers_keypoints_when_undeclared() {
    let out = Tensor::zeros(&[1, 8, 3]);
    assert_eq!(check_output(&out, 1, None).unwrap().keypoints, 3);
  }

  #[test]
  fn rejects_wrong_channel_count() {
    let out = Tensor::zeros(&[1, 56, 10]);
    assert!(matches!(
      check_output(&out, 1, Some(50)),
      Err(ModelError::InferenceShape { .. })
    ));
    let out = Tensor::zeros(&[1, 4, 10]);
    assert!(check_output(&out, 1, None).is_err());
  }

  #[test]
  fn accepts_layout_without_keypoints() {
    let out = Tensor::zeros(&[1, 5, 7]);
    let layout = check_output(&out, 1, Some(0)).unwrap();
    assert_eq!(layout.keypoints, 0);
    assert_eq!(check_output(&out, 1, None).unwrap().keypoints, 0);
    assert!(check_output(&out, 1, Some(3)).is_err());
  }

  #[test]
  fn input_shape_from_dims() {
    let shape = InputShape::try_from([1, 640, 480, 3]).unwrap();
    assert_eq!((shape.width, shape.height), (640, 480));
    assert!(InputShape::try_from([1, usize::MAX, 480, 3]).is_err());
  }

  #[test]
  fn rejects_wrong_rank_or_batch() {
    assert!(check_output(&Tensor::zeros(&[56, 10]), 1, None).is_err());
    assert!(check_output(&Tensor::zeros(&[2, 56, 10]), 1, None).is_err());
  }

  #[test]
  fn reports_progress_up_to_one() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[7u8; 3000]).unwrap();

    let mut fractions = Vec::new();
    let mut progress = |f: f32| fractions.push(f);
    let data = read_model_bytes(file.path(), &mut progress).unwrap();

    assert_eq!(data.len(), 3000);
    assert_eq!(fractions.first(), Some(&0.0));
    assert_eq!(fractions.last(), Some(&1.0));
    assert!(fractions.iter().all(|f| (0.0..=1.0).contains(f)));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
  }

  #[test]
  fn empty_or_missing_model_fails_to_load() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let mut progress = LogProgress::default();
    assert!(matches!(
      read_model_bytes(file.path(), &mut progress),
      Err(ModelLoadError::Empty(_))
    ));
    assert!(matches!(
      read_model_bytes(Path::new("/nonexistent/model.onnx"), &mut progress),
      Err(ModelLoadError::Io { .. })
    ));
  }
}
