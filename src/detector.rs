// 该文件是 Xunji （寻迹） 项目的一部分。
// src/detector.rs - 关键点检测器
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

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  config::{DetectorConfig, LabelList},
  decode::{DecodeError, decode},
  mapping::CoordinateMapper,
  model::{Model, ModelError, infer},
  nms::non_max_suppression,
  output::Render,
  preprocess::{PreprocessError, Preprocessed, ScaleRatio, preprocess},
  tensor::{TensorError, TensorScope},
};

const KEYPOINT_STRIDE: usize = 3;

/// 关键点，坐标为原图像素
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keypoint {
  pub x: f32,
  pub y: f32,
  pub confidence: f32,
}

/// 检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  /// 边界框 `(y1, x1, y2, x2)`，原图像素坐标
  pub bbox: [f32; 4],
  /// 置信度
  pub score: f32,
  /// 类别索引
  pub class_id: u32,
  /// 类别名称
  pub label: String,
  pub keypoints: Vec<Keypoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
  pub ratio: ScaleRatio,
  pub width: u32,
  pub height: u32,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidImage { width: u32, height: u32 },
  #[error("模型输入尺寸无效: {width}x{height}")]
  InvalidModelSize { width: u32, height: u32 },
  #[error("推理输出形状不符: 期望 {expected}, 实际 {actual:?}")]
  InferenceShape { expected: String, actual: Vec<usize> },
  #[error("推理失败: {0}")]
  Inference(#[source] Box<dyn std::error::Error + Send + Sync>),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
  #[error("渲染错误: {0}")]
  Render(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<PreprocessError> for DetectError {
  fn from(err: PreprocessError) -> Self {
    match err {
      PreprocessError::InvalidImage { width, height } => DetectError::InvalidImage { width, height },
      PreprocessError::InvalidModelSize { width, height } => {
        DetectError::InvalidModelSize { width, height }
      }
      PreprocessError::Tensor(e) => DetectError::Tensor(e),
    }
  }
}

impl From<ModelError> for DetectError {
  fn from(err: ModelError) -> Self {
    match err {
      ModelError::InferenceShape { expected, actual } => {
        DetectError::InferenceShape { expected, actual }
      }
      ModelError::Execute(e) => DetectError::Inference(e),
    }
  }
}

/// 单图检测器。
///
/// 除只读的模型外不持有任何跨调用状态，每次调用的张量都在调用内部创建并释放。
pub struct Detector<M> {
  model: M,
  config: DetectorConfig,
}

impl<M: Model> Detector<M> {
  pub fn new(model: M, config: DetectorConfig) -> Self {
    Self { model, config }
  }

  pub fn model(&self) -> &M {
    &self.model
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  /// 对一张图像执行完整的检测流程，依次调用 `render_boxes`、`render_points`
  /// 和 `on_complete`，最后返回结果。没有目标时返回空结果而非错误。
  pub fn detect<R, F>(
    &self,
    image: &RgbImage,
    render: &mut R,
    on_complete: F,
  ) -> Result<DetectResult, DetectError>
  where
    R: Render,
    F: FnOnce(&DetectResult),
  {
    let scope = TensorScope::begin("detect");
    let num_classes = self.config.num_classes();
    let shape = self.model.input_shape();

    let pre = preprocess(image, shape.width, shape.height)?;
    let mapper = CoordinateMapper::from_preprocessed(&pre, shape.width, shape.height);
    let Preprocessed {
      input,
      ratio,
      source_width,
      source_height,
    } = pre;

    let (raw, _layout) = infer(&self.model, &input, num_classes)?;
    drop(input);

    let set = decode(&raw, num_classes)?;
    let selected = non_max_suppression(&set.boxes, &set.scores, &self.config.suppress)?;
    let indices: Vec<usize> = selected.as_i32()?.iter().map(|&i| i as usize).collect();

    let mut boxes = set.boxes.gather_rows(&indices)?.as_f32()?.to_vec();
    let scores = set.scores.gather_rows(&indices)?.as_f32()?.to_vec();
    let class_ids = set.class_ids.gather_rows(&indices)?.as_i32()?.to_vec();
    let mut keypoints = set.keypoints.gather_rows(&indices)?.as_f32()?.to_vec();
    let kp_len = set.keypoint_len();

    // 数据已拷出
    scope.release([
      raw,
      set.boxes,
      set.scores,
      set.class_ids,
      set.keypoints,
      selected,
    ]);

    mapper.map_boxes(&mut boxes);
    if kp_len > 0 {
      for kps in keypoints.chunks_exact_mut(kp_len) {
        mapper.map_keypoints(kps);
      }
    }

    let result = emit(
      &self.config.labels,
      &boxes,
      &scores,
      &class_ids,
      &keypoints,
      kp_len,
      ratio,
      (source_width, source_height),
    );

    render
      .render_boxes(&self.config.labels, &boxes, &scores, &class_ids, ratio)
      .map_err(|e| DetectError::Render(Box::new(e)))?;
    render
      .render_points(&keypoints, ratio)
      .map_err(|e| DetectError::Render(Box::new(e)))?;

    info!("检测到 {} 个目标", result.len());
    debug!("检测结果: {:?}", result.items);
    on_complete(&result);

    Ok(result)
  }
}

/// 将按索引对齐的数组打包为 [`DetectResult`]
#[allow(clippy::too_many_arguments)]
fn emit(
  labels: &LabelList,
  boxes: &[f32],
  scores: &[f32],
  class_ids: &[i32],
  keypoints: &[f32],
  kp_len: usize,
  ratio: ScaleRatio,
  (width, height): (u32, u32),
) -> DetectResult {
  let items = scores
    .iter()
    .enumerate()
    .map(|(i, &score)| {
      let kps = if kp_len > 0 {
        &keypoints[i * kp_len..(i + 1) * kp_len]
      } else {
        &[][..]
      };
      Detection {
        bbox: [
          boxes[i * 4],
          boxes[i * 4 + 1],
          boxes[i * 4 + 2],
          boxes[i * 4 + 3],
        ],
        score,
        class_id: class_ids[i].max(0) as u32,
        label: labels.name(class_ids[i]).to_string(),
        keypoints: kps
          .chunks_exact(KEYPOINT_STRIDE)
          .map(|kp| Keypoint {
            x: kp[0],
            y: kp[1],
            confidence: kp[2],
          })
          .collect(),
      }
    })
    .collect();

  DetectResult {
    items,
    ratio,
    width,
    height,
  }
}
