// 该文件是 Xunji （寻迹） 项目的一部分。
// src/main.rs - 单图关键点检测程序
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use xunji::{
  FromUrl,
  args::DetectArgs,
  detector::Detector,
  input::InputWrapper,
  model::OnnxModelBuilder,
  output::OutputWrapper,
  task::{OneShotTask, Task},
};

/// Xunji 单图目标与关键点检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  #[command(flatten)]
  pub detect: DetectArgs,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.detect.model);
  info!("输入来源: {}", args.detect.input);
  info!("输出路径: {}", args.detect.output);

  let config = args.detect.detector_config()?;
  let draw = args.detect.draw()?;

  let input = InputWrapper::from_url(&args.detect.input)?;
  let model = OnnxModelBuilder::from_url(&args.detect.model)?.build()?;
  let output = OutputWrapper::from_url(&args.detect.output)?.with_draw(draw);

  let detector = Detector::new(model, config);
  let result = OneShotTask.run_task(input, &detector, &output)?;
  info!("共检测到 {} 个目标", result.len());

  Ok(())
}
