// 该文件是 Xunji （寻迹） 项目的一部分。
// src/config.rs - 检测参数与类别标签
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

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::nms::SuppressConfig;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("标签文件读取错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("标签文件解析错误: {0}")]
  Json(#[from] serde_json::Error),
  #[error("标签列表为空")]
  Empty,
}

/// 类别名称列表，类别数即列表长度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelList(Vec<String>);

impl Default for LabelList {
  fn default() -> Self {
    Self(vec!["person".to_string()])
  }
}

impl LabelList {
  pub fn new(labels: Vec<String>) -> Result<Self, LabelError> {
    if labels.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(Self(labels))
  }

  /// 从 JSON 数组读取，例如 `["person"]`
  pub fn from_json_str(json: &str) -> Result<Self, LabelError> {
    let labels: Vec<String> = serde_json::from_str(json)?;
    Self::new(labels)
  }

  pub fn from_json_file(path: &Path) -> Result<Self, LabelError> {
    let json = std::fs::read_to_string(path)?;
    let labels = Self::from_json_str(&json)?;
    info!("读取 {} 个类别标签: {}", labels.len(), path.display());
    Ok(labels)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn get(&self, class_id: usize) -> Option<&str> {
    self.0.get(class_id).map(String::as_str)
  }

  /// 类别名称，越界时返回 `unknown`
  pub fn name(&self, class_id: i32) -> &str {
    usize::try_from(class_id)
      .ok()
      .and_then(|id| self.get(id))
      .unwrap_or("unknown")
  }
}

/// 一次检测所需的全部参数
#[derive(Debug, Clone, Default)]
pub struct DetectorConfig {
  pub labels: LabelList,
  pub suppress: SuppressConfig,
}

impl DetectorConfig {
  pub fn with_labels(mut self, labels: LabelList) -> Self {
    self.labels = labels;
    self
  }

  pub fn with_suppress(mut self, suppress: SuppressConfig) -> Self {
    self.suppress = suppress;
    self
  }

  pub fn num_classes(&self) -> usize {
    self.labels.len()
  }
}
