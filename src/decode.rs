// 该文件是 Xunji （寻迹） 项目的一部分。
// src/decode.rs - 原始输出解码
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

use thiserror::Error;
use tracing::debug;

use crate::tensor::{Tensor, TensorError};

const BOX_CHANNELS: usize = 4;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("原始输出形状无效: {shape:?}, 类别数 {num_classes}")]
  Shape {
    shape: Vec<usize>,
    num_classes: usize,
  },
  #[error("张量错误: {0}")]
  Tensor(#[from] TensorError),
}

/// 按锚点对齐的解码结果，尚未过滤
#[derive(Debug)]
pub struct RawDetectionSet {
  /// `[A, 4]`，每行为 `(y1, x1, y2, x2)`
  pub boxes: Tensor,
  /// `[A]`，各类别分数的最大值
  pub scores: Tensor,
  /// `[A]`，i32，分数最大的类别
  pub class_ids: Tensor,
  /// `[A, K]`，原样保留的关键点通道
  pub keypoints: Tensor,
}

impl RawDetectionSet {
  pub fn anchors(&self) -> usize {
    self.scores.len()
  }

  pub fn keypoint_len(&self) -> usize {
    self.keypoints.shape().get(1).copied().unwrap_or(0)
  }
}

/// 将 `[1, C, A]` 的原始输出转置为 `[1, A, C]` 后逐锚点切分。
///
/// 通道布局：`[0, 4)` 为中心点与宽高，`[4, 4 + num_classes)` 为类别分数，
/// 其余为关键点。
pub fn decode(raw: &Tensor, num_classes: usize) -> Result<RawDetectionSet, DecodeError> {
  let shape_error = || DecodeError::Shape {
    shape: raw.shape().to_vec(),
    num_classes,
  };
  let &[1, channels, anchors] = raw.shape() else {
    return Err(shape_error());
  };
  let kp_start = BOX_CHANNELS + num_classes;
  if num_classes == 0 || channels < kp_start {
    return Err(shape_error());
  }
  let kp_len = channels - kp_start;

  let transposed = raw.permute(&[0, 2, 1])?;
  let rows = transposed.as_f32()?;

  let mut boxes = Vec::with_capacity(anchors * BOX_CHANNELS);
  let mut scores = Vec::with_capacity(anchors);
  let mut class_ids = Vec::with_capacity(anchors);
  let mut keypoints = Vec::with_capacity(anchors * kp_len);

  for row in rows.chunks_exact(channels) {
    let (cx, cy, bw, bh) = (row[0], row[1], row[2], row[3]);
    let x1 = cx - bw / 2.0;
    let y1 = cy - bh / 2.0;
    boxes.extend_from_slice(&[y1, x1, y1 + bh, x1 + bw]);

    // 并列时取第一个
    let (class_id, score) = row[BOX_CHANNELS..kp_start].iter().enumerate().fold(
      (0usize, f32::NEG_INFINITY),
      |best, (i, &s)| if s > best.1 { (i, s) } else { best },
    );
    scores.push(score);
    class_ids.push(class_id as i32);

    keypoints.extend_from_slice(&row[kp_start..]);
  }

  debug!(
    "解码 {} 个锚点, {} 个类别, {} 个关键点通道",
    anchors, num_classes, kp_len
  );

  Ok(RawDetectionSet {
    boxes: Tensor::from_f32(&[anchors, BOX_CHANNELS], boxes)?,
    scores: Tensor::from_f32(&[anchors], scores)?,
    class_ids: Tensor::from_i32(&[anchors], class_ids)?,
    keypoints: Tensor::from_f32(&[anchors, kp_len], keypoints)?,
  })
}
