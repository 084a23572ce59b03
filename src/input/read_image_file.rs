// 该文件是 Xunji （寻迹） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 单张图像文件，迭代一次后耗尽
pub struct ImageFileInput {
  image: Option<RgbImage>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    Self::from_path(Path::new(url.path()))
  }
}

impl ImageFileInput {
  pub fn from_path(path: &Path) -> Result<Self, ImageFileInputError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    info!(
      "读取图像 {}: {}x{}",
      path.display(),
      image.width(),
      image.height()
    );

    Ok(ImageFileInput {
      image: Some(image.into_rgb8()),
    })
  }
}

impl Iterator for ImageFileInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_once_and_converts_to_rgb() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gray.png");
    image::GrayImage::from_pixel(5, 4, image::Luma([200])).save(&path).unwrap();

    let mut input = ImageFileInput::from_path(&path).unwrap();
    let image = input.next().unwrap();
    assert_eq!(image.dimensions(), (5, 4));
    assert_eq!(image.get_pixel(0, 0), &image::Rgb([200, 200, 200]));
    assert!(input.next().is_none());
  }

  #[test]
  fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ImageFileInput::from_path(&dir.path().join("missing.png"));
    assert!(matches!(result, Err(ImageFileInputError::IoError(_))));
  }
}
