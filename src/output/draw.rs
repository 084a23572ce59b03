// 该文件是 Xunji （寻迹） 项目的一部分。
// src/output/draw.rs - 检测框与关键点可视化
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

use std::{convert::Infallible, path::Path};

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{config::LabelList, output::Render, preprocess::ScaleRatio};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const BOX_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const BOX_THICKNESS: i32 = 2;
const POINT_COLOR: [u8; 3] = [255, 0, 0]; // 红色
const POINT_RADIUS: i32 = 3;
const POINT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const KEYPOINT_STRIDE: usize = 3;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("字体文件无效")]
  InvalidFont,
}

/// 绘制样式。未配置字体时只画框和点，不画标签文字。
pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  font: Option<FontVec>,
  box_color: [u8; 3],
  box_thickness: i32,
  point_color: [u8; 3],
  point_radius: i32,
  point_threshold: f32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      font: None,
      box_color: BOX_COLOR,
      box_thickness: BOX_THICKNESS,
      point_color: POINT_COLOR,
      point_radius: POINT_RADIUS,
      point_threshold: POINT_CONFIDENCE_THRESHOLD,
    }
  }
}

impl Draw {
  pub fn with_font_file(mut self, path: &Path) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data).map_err(|_| DrawError::InvalidFont)?;
    info!("加载标签字体: {}", path.display());
    self.font = Some(font);
    Ok(self)
  }

  pub fn with_point_threshold(mut self, threshold: f32) -> Self {
    self.point_threshold = threshold;
    self
  }

  /// 在图像上绘制一个矩形边框，bbox 为原图坐标 `(y1, x1, y2, x2)`
  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &[f32], label: &str) {
    let (w, h) = (image.width() as i32, image.height() as i32);

    let y_min = (bbox[0].floor() as i32).clamp(0, h - 1);
    let x_min = (bbox[1].floor() as i32).clamp(0, w - 1);
    let y_max = (bbox[2].ceil() as i32).clamp(0, h - 1);
    let x_max = (bbox[3].ceil() as i32).clamp(0, w - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(self.box_color);
    for t in 0..self.box_thickness {
      let width = x_max - x_min - 2 * t;
      let height = y_max - y_min - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32 + 1, height as u32 + 1);
      draw_hollow_rect_mut(image, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    // 估算文本大小（粗略估计）
    let text_width = (label.chars().count() as f32 * self.label_char_width) as i32;
    let text_height = self.label_text_height;

    // 标签放在边框上方
    let label_x = x_min;
    let label_y = (y_min - text_height).max(0);
    let label_width = text_width.min(w - label_x).max(0) as u32;

    if label_width > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width, text_height as u32);
      draw_filled_rect_mut(image, rect, color);
      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x,
        label_y + self.label_text_vertical_padding,
        PxScale::from(self.font_size),
        font,
        label,
      );
    }
  }

  fn draw_point(&self, image: &mut RgbImage, x: f32, y: f32) {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if !(0.0..w).contains(&x) || !(0.0..h).contains(&y) {
      return;
    }
    draw_filled_circle_mut(
      image,
      (x.round() as i32, y.round() as i32),
      self.point_radius,
      Rgb(self.point_color),
    );
  }
}

/// 画布：持有原图副本，作为 [`Render`] 的实现
pub struct Canvas<'a> {
  image: RgbImage,
  draw: &'a Draw,
  detections: usize,
}

impl<'a> Canvas<'a> {
  pub fn new(image: &RgbImage, draw: &'a Draw) -> Self {
    Self {
      image: image.clone(),
      draw,
      detections: 0,
    }
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_image(self) -> RgbImage {
    self.image
  }
}

impl Render for Canvas<'_> {
  type Error = Infallible;

  fn render_boxes(
    &mut self,
    labels: &LabelList,
    boxes: &[f32],
    scores: &[f32],
    class_ids: &[i32],
    ratio: ScaleRatio,
  ) -> Result<(), Self::Error> {
    debug!("绘制 {} 个检测框, 比例 {:?}", scores.len(), ratio.as_pair());
    self.detections = scores.len();
    for (i, (&score, &class_id)) in scores.iter().zip(class_ids).enumerate() {
      let label = format!("{} {:.1}%", labels.name(class_id), score * 100.0);
      self
        .draw
        .draw_bbox_with_label(&mut self.image, &boxes[i * 4..i * 4 + 4], &label);
    }
    Ok(())
  }

  fn render_points(&mut self, keypoints: &[f32], ratio: ScaleRatio) -> Result<(), Self::Error> {
    debug!("绘制关键点 {} 个值, 比例 {:?}", keypoints.len(), ratio.as_pair());
    // 按检测分组，避免三元组跨越两个检测
    let per_detection = match self.detections {
      0 => keypoints.len(),
      n => keypoints.len() / n,
    };
    if per_detection == 0 {
      return Ok(());
    }
    for group in keypoints.chunks_exact(per_detection) {
      for kp in group.chunks_exact(KEYPOINT_STRIDE) {
        if kp[2] >= self.draw.point_threshold {
          self.draw.draw_point(&mut self.image, kp[0], kp[1]);
        }
      }
    }
    Ok(())
  }
}
