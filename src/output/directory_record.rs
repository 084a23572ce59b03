// 该文件是 Xunji （寻迹） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::{
  path::{Path, PathBuf},
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  detector::DetectResult,
  output::{
    Output,
    draw::{Canvas, Draw},
  },
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 按日期分目录保存渲染后的图像。
///
/// `folder:///path?record` 额外保存同名的 JSON 检测记录，
/// `always` 表示没有检测结果时也保存。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: Draw,
  record: bool,
  always: bool,
  counter: AtomicU16,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let record = uri.query_pairs().any(|(k, _)| k == "record");
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      draw: Draw::default(),
      record,
      always,
      counter: AtomicU16::new(0),
    })
  }
}

impl DirectoryRecordOutput {
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  fn frame_id(&self) -> u16 {
    self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }

  fn record(&self, result: &DetectResult, path: &Path) -> Result<(), DirectoryRecordOutputError> {
    let json = serde_json::to_string_pretty(result)?;
    let path = path.with_extension("json");
    std::fs::write(&path, json)?;
    debug!("保存检测记录: {}", path.display());
    Ok(())
  }
}

impl Output for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn draw(&self) -> &Draw {
    &self.draw
  }

  fn write_result(&self, canvas: Canvas<'_>, result: &DetectResult) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      debug!("没有检测结果, 跳过保存");
      return Ok(());
    }

    let path = self.frame_path()?;
    canvas.image().save(&path)?;
    if self.record {
      self.record(result, &path)?;
    }
    info!("保存检测图像: {}", path.display());
    Ok(())
  }
}
