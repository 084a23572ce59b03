// 该文件是 Xunji （寻迹） 项目的一部分。
// src/task.rs - 检测任务
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

use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{info, warn};

use crate::{
  detector::{DetectResult, Detector},
  model::Model,
  output::{Output, draw::Canvas},
};

pub trait Task<I, M, O>: Sized {
  type Error;
  type Output;
  fn run_task(self, input: I, detector: &Detector<M>, output: &O)
  -> Result<Self::Output, Self::Error>;
}

fn detect_and_write<M: Model, O: Output>(
  image: &RgbImage,
  detector: &Detector<M>,
  output: &O,
) -> anyhow::Result<DetectResult> {
  let mut canvas = Canvas::new(image, output.draw());
  let result = detector.detect(image, &mut canvas, |result| {
    for (i, item) in result.items.iter().enumerate() {
      info!(
        "({}) {} {:.1}% bbox={:?}",
        i,
        item.label,
        item.score * 100.0,
        item.bbox
      );
    }
  })?;
  output.write_result(canvas, &result)?;
  Ok(result)
}

/// 取第一张图像检测一次
pub struct OneShotTask;

impl<I, M, O> Task<I, M, O> for OneShotTask
where
  I: Iterator<Item = RgbImage>,
  M: Model,
  O: Output,
{
  type Error = anyhow::Error;
  type Output = DetectResult;

  fn run_task(
    self,
    mut input: I,
    detector: &Detector<M>,
    output: &O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像获取成功，开始推理...");
    let now = Instant::now();
    let result = detect_and_write(&image, detector, output)?;
    info!("检测完成，耗时: {:.2?}", now.elapsed());

    Ok(result)
  }
}

/// 对同一张图像重复检测，统计平均耗时
pub struct RepeatShotTask {
  times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { times: 1000 }
  }
}

impl RepeatShotTask {
  pub fn with_times(mut self, times: usize) -> Self {
    self.times = times.max(1);
    self
  }
}

impl<I, M, O> Task<I, M, O> for RepeatShotTask
where
  I: Iterator<Item = RgbImage>,
  M: Model,
  O: Output,
{
  type Error = anyhow::Error;
  type Output = Duration;

  fn run_task(
    self,
    mut input: I,
    detector: &Detector<M>,
    output: &O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像获取成功，开始推理...");

    let mut times = Vec::with_capacity(self.times);
    for i in 0..self.times {
      let now = Instant::now();
      detect_and_write(&image, detector, output)?;
      let elapsed = now.elapsed();
      info!("({})检测完成，耗时: {:.2?}", i, elapsed);
      times.push(elapsed);
    }

    // 前两次包含预热开销
    let warm = if times.len() > 2 { &times[2..] } else { &times[..] };
    let average = warm.iter().sum::<Duration>() / warm.len() as u32;
    warn!("平均检测时间: {:.2?}", average);

    Ok(average)
  }
}
