// 该文件是 Xunji （寻迹） 项目的一部分。
// src/args.rs - 命令行参数
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

use std::path::PathBuf;

use clap::Args;
use url::Url;

use crate::{
  config::{DetectorConfig, LabelError, LabelList},
  nms::SuppressConfig,
  output::draw::{Draw, DrawError},
};

/// 各个程序共用的检测参数
#[derive(Args, Debug, Clone)]
pub struct DetectArgs {
  /// 模型地址，例如 onnx:///models/pose.onnx?size=640&keypoints=51
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 image:///data/person.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///tmp/out.png 或 folder:///tmp/records?record
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 类别名称列表（JSON 数组），缺省为 ["person"]
  #[arg(long, value_name = "FILE")]
  pub labels: Option<PathBuf>,
  /// 置信度阈值，低于该值的锚点被丢弃
  #[arg(long, default_value_t = 0.3, value_name = "THRESHOLD")]
  pub score_threshold: f32,
  /// NMS IoU 阈值
  #[arg(long, default_value_t = 0.45, value_name = "THRESHOLD")]
  pub iou_threshold: f32,
  /// 最多保留的检测数量
  #[arg(long, default_value_t = 1, value_name = "COUNT")]
  pub max_outputs: usize,
  /// 标签字体文件（TTF/OTF），不指定时不绘制标签文字
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
  /// 关键点绘制的最低置信度
  #[arg(long, default_value_t = 0.5, value_name = "THRESHOLD")]
  pub point_threshold: f32,
}

impl DetectArgs {
  pub fn detector_config(&self) -> Result<DetectorConfig, LabelError> {
    let labels = match &self.labels {
      Some(path) => LabelList::from_json_file(path)?,
      None => LabelList::default(),
    };
    Ok(
      DetectorConfig::default()
        .with_labels(labels)
        .with_suppress(SuppressConfig {
          max_outputs: self.max_outputs,
          iou_threshold: self.iou_threshold,
          score_threshold: self.score_threshold,
        }),
    )
  }

  pub fn draw(&self) -> Result<Draw, DrawError> {
    let draw = Draw::default().with_point_threshold(self.point_threshold);
    match &self.font {
      Some(path) => draw.with_font_file(path),
      None => Ok(draw),
    }
  }
}
