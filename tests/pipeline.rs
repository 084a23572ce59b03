// 该文件是 Xunji （寻迹） 项目的一部分。
// tests/pipeline.rs - 检测流程集成测试
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

use std::{convert::Infallible, iter};

use approx::assert_abs_diff_eq;
use image::RgbImage;

use xunji::{
  FromUrl,
  config::{DetectorConfig, LabelList, LabelError},
  detector::{DetectError, Detector},
  model::{InputShape, Model},
  nms::SuppressConfig,
  output::{Render, SaveImageFileOutput},
  preprocess::ScaleRatio,
  task::{OneShotTask, RepeatShotTask, Task},
  tensor::{Tensor, TensorError, live_tensors},
};

const MODEL_SIZE: u32 = 640;

/// 一个锚点的原始输出：中心、宽高、各类别分数、关键点三元组
struct Anchor {
  cx: f32,
  cy: f32,
  w: f32,
  h: f32,
  scores: Vec<f32>,
  keypoints: Vec<f32>,
}

/// 忽略输入，返回预先编码的 `[1, C, A]` 输出
struct FakeModel {
  channels: usize,
  data: Vec<f32>,
  anchors: usize,
  declared_keypoints: Option<usize>,
}

impl FakeModel {
  fn new(anchors: &[Anchor]) -> Self {
    let channels = 4 + anchors[0].scores.len() + anchors[0].keypoints.len();
    let count = anchors.len();
    let mut data = vec![0.0; channels * count];
    for (a, anchor) in anchors.iter().enumerate() {
      let row: Vec<f32> = [anchor.cx, anchor.cy, anchor.w, anchor.h]
        .into_iter()
        .chain(anchor.scores.iter().copied())
        .chain(anchor.keypoints.iter().copied())
        .collect();
      for (c, v) in row.into_iter().enumerate() {
        data[c * count + a] = v;
      }
    }
    Self {
      channels,
      data,
      anchors: count,
      declared_keypoints: None,
    }
  }

  fn declare_keypoints(mut self, keypoints: usize) -> Self {
    self.declared_keypoints = Some(keypoints);
    self
  }
}

impl Model for FakeModel {
  type Error = TensorError;

  fn input_shape(&self) -> InputShape {
    InputShape::square(MODEL_SIZE)
  }

  fn keypoint_channels(&self) -> Option<usize> {
    self.declared_keypoints
  }

  fn execute(&self, input: &Tensor) -> Result<Tensor, Self::Error> {
    assert_eq!(
      input.shape(),
      &[1, MODEL_SIZE as usize, MODEL_SIZE as usize, 3]
    );
    Tensor::from_f32(&[1, self.channels, self.anchors], self.data.clone())
  }
}

#[derive(Default)]
struct Recorder {
  calls: Vec<&'static str>,
  boxes: Vec<f32>,
  scores: Vec<f32>,
  points: Vec<f32>,
  ratio: Option<ScaleRatio>,
}

impl Render for Recorder {
  type Error = Infallible;

  fn render_boxes(
    &mut self,
    _labels: &LabelList,
    boxes: &[f32],
    scores: &[f32],
    _class_ids: &[i32],
    ratio: ScaleRatio,
  ) -> Result<(), Self::Error> {
    self.calls.push("boxes");
    self.boxes = boxes.to_vec();
    self.scores = scores.to_vec();
    self.ratio = Some(ratio);
    Ok(())
  }

  fn render_points(&mut self, keypoints: &[f32], _ratio: ScaleRatio) -> Result<(), Self::Error> {
    self.calls.push("points");
    self.points = keypoints.to_vec();
    Ok(())
  }
}

/// 200x100 原图中的框 (x1=20, y1=10, x2=200, y2=60) 与关键点 (50, 30)，
/// 按 640 输入编码：缩放系数 640/200 = 3.2
fn person_anchor(score: f32) -> Anchor {
  Anchor {
    cx: 352.0,
    cy: 112.0,
    w: 576.0,
    h: 160.0,
    scores: vec![score],
    keypoints: vec![160.0, 96.0, 0.9],
  }
}

fn background_anchor() -> Anchor {
  Anchor {
    cx: 30.0,
    cy: 30.0,
    w: 20.0,
    h: 20.0,
    scores: vec![0.1],
    keypoints: vec![0.0, 0.0, 0.0],
  }
}

fn background_anchor_without_keypoints() -> Anchor {
  Anchor {
    keypoints: vec![],
    ..background_anchor()
  }
}

#[test]
fn decodes_and_maps_back_to_source_pixels() {
  let model = FakeModel::new(&[background_anchor(), person_anchor(0.9)]);
  let detector = Detector::new(model, DetectorConfig::default());
  let image = RgbImage::new(200, 100);

  let mut recorder = Recorder::default();
  let mut completed = 0;
  let result = detector
    .detect(&image, &mut recorder, |_| completed += 1)
    .unwrap();

  assert_eq!(completed, 1);
  assert_eq!(recorder.calls, vec!["boxes", "points"]);
  assert_eq!(result.len(), 1);
  assert_eq!((result.width, result.height), (200, 100));
  assert_eq!(result.ratio, ScaleRatio { x: 1.0, y: 2.0 });

  let det = &result.items[0];
  assert_eq!(det.label, "person");
  assert_eq!(det.class_id, 0);
  assert_abs_diff_eq!(det.score, 0.9);
  for (got, want) in det.bbox.iter().zip([10.0, 20.0, 60.0, 200.0]) {
    assert_abs_diff_eq!(*got, want, epsilon = 1e-3);
  }
  assert_eq!(det.keypoints.len(), 1);
  assert_abs_diff_eq!(det.keypoints[0].x, 50.0, epsilon = 1e-3);
  assert_abs_diff_eq!(det.keypoints[0].y, 30.0, epsilon = 1e-3);
  assert_abs_diff_eq!(det.keypoints[0].confidence, 0.9);

  assert_eq!(recorder.boxes.len(), 4);
  assert_abs_diff_eq!(recorder.boxes[3], 200.0, epsilon = 1e-3);
  assert_eq!(recorder.points.len(), 3);
  assert_eq!(recorder.ratio, Some(result.ratio));
}

#[test]
fn square_image_maps_without_padding() {
  // 320x320 原图, 640 输入, 缩放系数 2
  let anchor = Anchor {
    cx: 320.0,
    cy: 320.0,
    w: 640.0,
    h: 640.0,
    scores: vec![0.8],
    keypoints: vec![100.0, 200.0, 0.7],
  };
  let detector = Detector::new(FakeModel::new(&[anchor]), DetectorConfig::default());
  let result = detector
    .detect(&RgbImage::new(320, 320), &mut Recorder::default(), |_| {})
    .unwrap();

  let det = &result.items[0];
  for (got, want) in det.bbox.iter().zip([0.0, 0.0, 320.0, 320.0]) {
    assert_abs_diff_eq!(*got, want, epsilon = 1e-3);
  }
  assert_abs_diff_eq!(det.keypoints[0].x, 50.0, epsilon = 1e-3);
  assert_abs_diff_eq!(det.keypoints[0].y, 100.0, epsilon = 1e-3);
}

#[test]
fn tall_image_edge_maps_to_edge() {
  // 100x400 原图, 右边缘 x=100 在模型空间为 160
  let anchor = Anchor {
    cx: 80.0,
    cy: 320.0,
    w: 160.0,
    h: 640.0,
    scores: vec![0.8],
    keypoints: vec![160.0, 640.0, 0.5],
  };
  let detector = Detector::new(FakeModel::new(&[anchor]), DetectorConfig::default());
  let result = detector
    .detect(&RgbImage::new(100, 400), &mut Recorder::default(), |_| {})
    .unwrap();

  let det = &result.items[0];
  assert_abs_diff_eq!(det.bbox[2], 400.0, epsilon = 1e-3);
  assert_abs_diff_eq!(det.bbox[3], 100.0, epsilon = 1e-3);
  assert_abs_diff_eq!(det.keypoints[0].x, 100.0, epsilon = 1e-3);
  assert_abs_diff_eq!(det.keypoints[0].y, 400.0, epsilon = 1e-3);
}

#[test]
fn low_scores_give_empty_result_not_error() {
  let model = FakeModel::new(&[background_anchor(), background_anchor()]);
  let detector = Detector::new(model, DetectorConfig::default());
  let mut recorder = Recorder::default();
  let mut completed = false;

  let result = detector
    .detect(&RgbImage::new(64, 48), &mut recorder, |r| {
      completed = r.is_empty();
    })
    .unwrap();

  assert!(result.is_empty());
  assert!(completed);
  assert_eq!(recorder.calls, vec!["boxes", "points"]);
  assert!(recorder.boxes.is_empty());
  assert!(recorder.points.is_empty());
}

#[test]
fn max_outputs_caps_and_suppresses_overlaps() {
  let mut duplicate = person_anchor(0.8);
  duplicate.cx += 4.0;
  let far = Anchor {
    cx: 40.0,
    cy: 200.0,
    w: 40.0,
    h: 40.0,
    scores: vec![0.7],
    keypoints: vec![40.0, 200.0, 0.6],
  };
  let anchors = [person_anchor(0.9), duplicate, far, background_anchor()];

  let detector = Detector::new(FakeModel::new(&anchors), DetectorConfig::default());
  let result = detector
    .detect(&RgbImage::new(200, 100), &mut Recorder::default(), |_| {})
    .unwrap();
  assert_eq!(result.len(), 1);
  assert_abs_diff_eq!(result.items[0].score, 0.9);

  let config = DetectorConfig::default().with_suppress(SuppressConfig {
    max_outputs: 10,
    ..SuppressConfig::default()
  });
  let detector = Detector::new(FakeModel::new(&anchors), config);
  let mut recorder = Recorder::default();
  let result = detector
    .detect(&RgbImage::new(200, 100), &mut recorder, |_| {})
    .unwrap();
  let scores: Vec<f32> = result.items.iter().map(|d| d.score).collect();
  assert_eq!(scores, vec![0.9, 0.7]);
  assert_eq!(recorder.scores, scores);
  assert_eq!(recorder.points.len(), 6);
}

#[test]
fn picks_best_class_and_names_it() {
  let anchor = Anchor {
    scores: vec![0.2, 0.85],
    ..person_anchor(0.0)
  };
  let labels = LabelList::from_json_str(r#"["person", "dog"]"#).unwrap();
  let detector = Detector::new(
    FakeModel::new(&[anchor]),
    DetectorConfig::default().with_labels(labels),
  );
  let result = detector
    .detect(&RgbImage::new(200, 100), &mut Recorder::default(), |_| {})
    .unwrap();
  assert_eq!(result.items[0].class_id, 1);
  assert_eq!(result.items[0].label, "dog");
  assert_eq!(result.items[0].keypoints.len(), 1);
}

#[test]
fn wrong_channel_count_is_inference_shape_error() {
  // 1 个类别至少需要 5 个通道，这里只有 4 个
  let anchor = Anchor {
    scores: vec![],
    keypoints: vec![],
    ..person_anchor(0.9)
  };
  let detector = Detector::new(FakeModel::new(&[anchor]), DetectorConfig::default());
  let baseline = live_tensors();
  let mut recorder = Recorder::default();
  let mut completed = false;

  let err = detector
    .detect(&RgbImage::new(200, 100), &mut recorder, |_| completed = true)
    .unwrap_err();

  assert!(matches!(err, DetectError::InferenceShape { .. }));
  assert!(!completed);
  assert!(recorder.calls.is_empty());
  assert_eq!(live_tensors(), baseline);
}

#[test]
fn model_without_keypoints_still_detects() {
  let anchor = Anchor {
    keypoints: vec![],
    ..person_anchor(0.9)
  };
  let model =
    FakeModel::new(&[anchor, background_anchor_without_keypoints()]).declare_keypoints(0);
  let detector = Detector::new(model, DetectorConfig::default());
  let mut recorder = Recorder::default();

  let result = detector
    .detect(&RgbImage::new(200, 100), &mut recorder, |_| {})
    .unwrap();

  assert_eq!(result.len(), 1);
  assert!(result.items[0].keypoints.is_empty());
  assert_abs_diff_eq!(result.items[0].bbox[3], 200.0, epsilon = 1e-3);
  assert_eq!(recorder.calls, vec!["boxes", "points"]);
  assert!(recorder.points.is_empty());
}

#[test]
fn declared_keypoints_must_match_output() {
  let model = FakeModel::new(&[person_anchor(0.9)]).declare_keypoints(51);
  let detector = Detector::new(model, DetectorConfig::default());
  let err = detector
    .detect(&RgbImage::new(200, 100), &mut Recorder::default(), |_| {})
    .unwrap_err();
  assert!(matches!(
    err,
    DetectError::InferenceShape { ref actual, .. } if actual == &vec![1, 8, 1]
  ));
}

#[test]
fn zero_sized_image_is_rejected() {
  let detector = Detector::new(
    FakeModel::new(&[person_anchor(0.9)]),
    DetectorConfig::default(),
  );
  let err = detector
    .detect(&RgbImage::new(0, 10), &mut Recorder::default(), |_| {})
    .unwrap_err();
  assert!(matches!(
    err,
    DetectError::InvalidImage {
      width: 0,
      height: 10
    }
  ));
}

#[test]
fn repeated_calls_do_not_leak_tensors() {
  let detector = Detector::new(
    FakeModel::new(&[person_anchor(0.9), background_anchor()]),
    DetectorConfig::default(),
  );
  let image = RgbImage::new(200, 100);
  let baseline = live_tensors();

  let first = detector
    .detect(&image, &mut Recorder::default(), |_| {})
    .unwrap();
  assert_eq!(live_tensors(), baseline);
  for _ in 0..3 {
    let again = detector
      .detect(&image, &mut Recorder::default(), |_| {})
      .unwrap();
    assert_eq!(again, first);
  }
  assert_eq!(live_tensors(), baseline);
}

#[test]
fn one_shot_task_writes_rendered_image() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("out.png");
  let url = url::Url::parse(&format!("image://{}", path.display())).unwrap();
  let output = SaveImageFileOutput::from_url(&url).unwrap();
  let detector = Detector::new(
    FakeModel::new(&[person_anchor(0.9)]),
    DetectorConfig::default(),
  );

  let result = OneShotTask
    .run_task(iter::once(RgbImage::new(200, 100)), &detector, &output)
    .unwrap();
  assert_eq!(result.len(), 1);

  let saved = image::open(&path).unwrap().into_rgb8();
  assert_eq!(saved.dimensions(), (200, 100));
  assert!(saved.pixels().any(|p| p != &image::Rgb([0, 0, 0])));
}

#[test]
fn one_shot_task_fails_without_input() {
  let dir = tempfile::tempdir().unwrap();
  let url = url::Url::parse(&format!("image://{}/out.png", dir.path().display())).unwrap();
  let output = SaveImageFileOutput::from_url(&url).unwrap();
  let detector = Detector::new(
    FakeModel::new(&[person_anchor(0.9)]),
    DetectorConfig::default(),
  );

  assert!(
    OneShotTask
      .run_task(iter::empty::<RgbImage>(), &detector, &output)
      .is_err()
  );
  assert!(!dir.path().join("out.png").exists());
}

#[test]
fn repeat_shot_task_detects_each_round_and_writes_output() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("out.png");
  let url = url::Url::parse(&format!("image://{}", path.display())).unwrap();
  let output = SaveImageFileOutput::from_url(&url).unwrap();
  let detector = Detector::new(
    FakeModel::new(&[person_anchor(0.9)]),
    DetectorConfig::default(),
  );
  let baseline = live_tensors();

  RepeatShotTask::default()
    .with_times(3)
    .run_task(iter::once(RgbImage::new(200, 100)), &detector, &output)
    .unwrap();

  assert!(path.exists());
  assert_eq!(live_tensors(), baseline);
}

#[test]
fn empty_label_list_is_rejected() {
  assert!(matches!(
    LabelList::from_json_str("[]"),
    Err(LabelError::Empty)
  ));
}
