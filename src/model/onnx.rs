// 该文件是 Xunji （寻迹） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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

use std::{path::Path, sync::Mutex};

use ort::{session::Session, value::Tensor as OrtTensor};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{InputShape, LoadProgress, LogProgress, Model, ModelLoadError, read_model_bytes},
  tensor::{Tensor, TensorError},
};

const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Error, Debug)]
pub enum OnnxModelError {
  #[error("ONNX Runtime 错误: {0}")]
  Ort(#[from] ort::Error),
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("推理会话锁已损坏")]
  Poisoned,
  #[error("模型没有输出")]
  NoOutput,
}

/// ONNX 模型。会话由互斥锁保护，重叠的调用会被串行化。
pub struct OnnxModel {
  session: Mutex<Session>,
  input_shape: InputShape,
  keypoints: Option<usize>,
}

pub struct OnnxModelBuilder {
  model_path: String,
  input_size: u32,
  keypoints: Option<usize>,
  intra_threads: Option<usize>,
}

impl FromUrlWithScheme for OnnxModelBuilder {
  const SCHEME: &'static str = "onnx";
}

fn parse_query<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ModelLoadError> {
  value
    .parse()
    .map_err(|_| ModelLoadError::ModelPath(format!("参数 {} 的值无效: {}", key, value)))
}

impl FromUrl for OnnxModelBuilder {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelLoadError::ModelPath(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = OnnxModelBuilder {
      model_path: url.path().to_string(),
      input_size: DEFAULT_INPUT_SIZE,
      keypoints: None,
      intra_threads: None,
    };
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "size" => builder.input_size = parse_query(&k, &v)?,
        "keypoints" => builder.keypoints = Some(parse_query(&k, &v)?),
        "threads" => builder.intra_threads = Some(parse_query(&k, &v)?),
        other => debug!("忽略未知的模型参数: {}", other),
      }
    }
    Ok(builder)
  }
}

fn backend_error<E: std::fmt::Display>(e: E) -> ModelLoadError {
  error!("创建 ONNX 会话失败: {}", e);
  ModelLoadError::Backend(e.to_string())
}

impl OnnxModelBuilder {
  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size;
    self
  }

  pub fn keypoints(mut self, keypoints: Option<usize>) -> Self {
    self.keypoints = keypoints;
    self
  }

  pub fn build(self) -> Result<OnnxModel, ModelLoadError> {
    self.build_with_progress(&mut LogProgress::default())
  }

  pub fn build_with_progress<P: LoadProgress + ?Sized>(
    self,
    progress: &mut P,
  ) -> Result<OnnxModel, ModelLoadError> {
    let data = read_model_bytes(Path::new(&self.model_path), progress)?;

    info!("创建 ONNX 推理会话");
    let mut builder = Session::builder().map_err(backend_error)?;
    if let Some(threads) = self.intra_threads {
      builder = builder
        .with_intra_threads(threads)
        .map_err(backend_error)?;
    }
    let session = builder.commit_from_memory(&data).map_err(backend_error)?;
    info!("模型加载完成");

    Ok(OnnxModel {
      session: Mutex::new(session),
      input_shape: InputShape::square(self.input_size),
      keypoints: self.keypoints,
    })
  }
}

impl Model for OnnxModel {
  type Error = OnnxModelError;

  fn input_shape(&self) -> InputShape {
    self.input_shape
  }

  fn keypoint_channels(&self) -> Option<usize> {
    self.keypoints
  }

  fn execute(&self, input: &Tensor) -> Result<Tensor, Self::Error> {
    // NHWC -> NCHW
    let nchw = input.permute(&[0, 3, 1, 2])?;
    let value = OrtTensor::from_array(nchw.into_f32()?)?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| OnnxModelError::Poisoned)?;
    let outputs = session.run(ort::inputs![value])?;
    let (_name, first) = outputs.iter().next().ok_or(OnnxModelError::NoOutput)?;
    let array = first.try_extract_array::<f32>()?;
    debug!("ONNX 输出形状: {:?}", array.shape());

    Ok(Tensor::from_array(array.to_owned()))
  }
}
