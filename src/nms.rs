// 该文件是 Xunji （寻迹） 项目的一部分。
// src/nms.rs - 非极大值抑制
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

use std::cmp::Ordering;

use tracing::debug;

use crate::tensor::{Tensor, TensorError};

/// 抑制参数。
///
/// `max_outputs` 默认为 1：本系统面向单一主体的检测，每次调用只保留
/// 得分最高的一个结果。需要多目标时调大该值即可。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuppressConfig {
  pub max_outputs: usize,
  pub iou_threshold: f32,
  pub score_threshold: f32,
}

impl Default for SuppressConfig {
  fn default() -> Self {
    Self {
      max_outputs: 1,
      iou_threshold: 0.45,
      score_threshold: 0.3,
    }
  }
}

/// `(y1, x1, y2, x2)` 框的交并比，角点顺序颠倒时自动纠正
pub fn iou(a: &[f32], b: &[f32]) -> f32 {
  let (a_y1, a_y2) = (a[0].min(a[2]), a[0].max(a[2]));
  let (a_x1, a_x2) = (a[1].min(a[3]), a[1].max(a[3]));
  let (b_y1, b_y2) = (b[0].min(b[2]), b[0].max(b[2]));
  let (b_x1, b_x2) = (b[1].min(b[3]), b[1].max(b[3]));

  let area_a = (a_y2 - a_y1) * (a_x2 - a_x1);
  let area_b = (b_y2 - b_y1) * (b_x2 - b_x1);
  if area_a <= 0.0 || area_b <= 0.0 {
    return 0.0;
  }

  let inter_h = (a_y2.min(b_y2) - a_y1.max(b_y1)).max(0.0);
  let inter_w = (a_x2.min(b_x2) - a_x1.max(b_x1)).max(0.0);
  let intersection = inter_h * inter_w;
  intersection / (area_a + area_b - intersection)
}

/// 贪心 NMS，返回按分数降序排列的锚点索引，长度不超过 `max_outputs`
pub fn select(boxes: &[f32], scores: &[f32], config: &SuppressConfig) -> Vec<usize> {
  let mut candidates: Vec<usize> = (0..scores.len())
    .filter(|&i| scores[i] >= config.score_threshold)
    .collect();
  // 稳定排序，同分时保留锚点顺序
  candidates.sort_by(|&a, &b| {
    scores[b]
      .partial_cmp(&scores[a])
      .unwrap_or(Ordering::Equal)
  });

  let mut selected: Vec<usize> = Vec::with_capacity(config.max_outputs.min(candidates.len()));
  for i in candidates {
    if selected.len() >= config.max_outputs {
      break;
    }
    let current = &boxes[i * 4..i * 4 + 4];
    let suppressed = selected
      .iter()
      .any(|&k| iou(current, &boxes[k * 4..k * 4 + 4]) > config.iou_threshold);
    if !suppressed {
      selected.push(i);
    }
  }
  selected
}

/// 张量接口：`boxes` 为 `[A, 4]`，`scores` 为 `[A]`，返回 i32 索引张量 `[N]`
pub fn non_max_suppression(
  boxes: &Tensor,
  scores: &Tensor,
  config: &SuppressConfig,
) -> Result<Tensor, TensorError> {
  let box_data = boxes.as_f32()?;
  let score_data = scores.as_f32()?;
  if box_data.len() != score_data.len() * 4 {
    return Err(TensorError::ShapeMismatch {
      shape: boxes.shape().to_vec(),
      expected: score_data.len() * 4,
      actual: box_data.len(),
    });
  }

  let selected = select(box_data, score_data, config);
  debug!(
    "NMS: {} 个锚点中保留 {} 个 (上限 {}, IoU {}, 分数 {})",
    score_data.len(),
    selected.len(),
    config.max_outputs,
    config.iou_threshold,
    config.score_threshold
  );
  Tensor::from_i32(
    &[selected.len()],
    selected.into_iter().map(|i| i as i32).collect(),
  )
}
