// 该文件是 Xunji （寻迹） 项目的一部分。
// src/mapping.rs - 模型坐标到原图坐标的映射
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

use tracing::warn;

use crate::preprocess::{Preprocessed, ScaleRatio};

const KEYPOINT_STRIDE: usize = 3;

/// 撤销缩放与右下填充。
///
/// 模型坐标先乘以 `ratio` 得到与模型同尺寸、去掉填充后的画布坐标，
/// 再按 `原图边长 / 模型边长` 拉伸回原图，即 `v * maxSide / modelSide`。
/// 填充只在右侧和下方，所以不需要平移。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMapper {
  ratio: ScaleRatio,
  scale_x: f32,
  scale_y: f32,
}

impl CoordinateMapper {
  pub fn new(
    ratio: ScaleRatio,
    source_width: u32,
    source_height: u32,
    model_width: u32,
    model_height: u32,
  ) -> Self {
    Self {
      ratio,
      scale_x: ratio.x * source_width as f32 / model_width as f32,
      scale_y: ratio.y * source_height as f32 / model_height as f32,
    }
  }

  pub fn from_preprocessed(pre: &Preprocessed, model_width: u32, model_height: u32) -> Self {
    Self::new(
      pre.ratio,
      pre.source_width,
      pre.source_height,
      model_width,
      model_height,
    )
  }

  pub fn ratio(&self) -> ScaleRatio {
    self.ratio
  }

  pub fn map_x(&self, x: f32) -> f32 {
    x * self.scale_x
  }

  pub fn map_y(&self, y: f32) -> f32 {
    y * self.scale_y
  }

  /// `(y1, x1, y2, x2)`
  pub fn map_box(&self, b: [f32; 4]) -> [f32; 4] {
    [
      self.map_y(b[0]),
      self.map_x(b[1]),
      self.map_y(b[2]),
      self.map_x(b[3]),
    ]
  }

  pub fn map_boxes(&self, boxes: &mut [f32]) {
    for b in boxes.chunks_exact_mut(4) {
      let mapped = self.map_box([b[0], b[1], b[2], b[3]]);
      b.copy_from_slice(&mapped);
    }
  }

  /// 关键点按 `(x, y, confidence)` 三元组映射，置信度不变
  pub fn map_keypoints(&self, keypoints: &mut [f32]) {
    let mut triples = keypoints.chunks_exact_mut(KEYPOINT_STRIDE);
    for kp in triples.by_ref() {
      kp[0] = self.map_x(kp[0]);
      kp[1] = self.map_y(kp[1]);
    }
    let rest = triples.into_remainder();
    if !rest.is_empty() {
      warn!("关键点通道数不是 3 的倍数, 末尾 {} 个值未映射", rest.len());
    }
  }
}
