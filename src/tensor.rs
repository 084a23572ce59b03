// 该文件是 Xunji （寻迹） 项目的一部分。
// src/tensor.rs - 张量与调用作用域
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

use std::cell::Cell;

use ndarray::{ArrayD, Axis, IxDyn};
use thiserror::Error;
use tracing::{debug, warn};

thread_local! {
  // 当前线程上存活的张量数量
  static LIVE_TENSORS: Cell<usize> = const { Cell::new(0) };
}

/// 当前线程上存活的张量数量
pub fn live_tensors() -> usize {
  LIVE_TENSORS.with(Cell::get)
}

fn track_alloc() {
  LIVE_TENSORS.with(|c| c.set(c.get() + 1));
}

fn track_release() {
  LIVE_TENSORS.with(|c| c.set(c.get().saturating_sub(1)));
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
  #[error("张量形状错误: {0}")]
  Shape(#[from] ndarray::ShapeError),
  #[error("张量形状 {shape:?} 需要 {expected} 个元素, 实际为 {actual}")]
  ShapeMismatch {
    shape: Vec<usize>,
    expected: usize,
    actual: usize,
  },
  #[error("张量元素类型不匹配: 期望 {expected}, 实际 {actual}")]
  TypeMismatch {
    expected: &'static str,
    actual: &'static str,
  },
  #[error("轴顺序无效: {axes:?} (维数 {ndim})")]
  InvalidAxes { axes: Vec<usize>, ndim: usize },
  #[error("索引 {index} 越界 (长度 {len})")]
  IndexOutOfRange { index: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq)]
enum TensorData {
  F32(ArrayD<f32>),
  I32(ArrayD<i32>),
}

impl TensorData {
  fn dtype(&self) -> &'static str {
    match self {
      TensorData::F32(_) => "f32",
      TensorData::I32(_) => "i32",
    }
  }

  fn shape(&self) -> &[usize] {
    match self {
      TensorData::F32(a) => a.shape(),
      TensorData::I32(a) => a.shape(),
    }
  }
}

/// 单次检测调用内使用的数值缓冲区，总是以行优先布局存储。
///
/// 每个存活的 `Tensor` 都计入当前线程的计数器，可通过 [`live_tensors`] 查询，
/// 用于确认一次调用结束后没有遗留缓冲区。
#[derive(Debug, PartialEq)]
pub struct Tensor {
  data: TensorData,
}

impl Tensor {
  fn wrap(data: TensorData) -> Self {
    track_alloc();
    Self { data }
  }

  pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self, TensorError> {
    let array = ArrayD::from_shape_vec(IxDyn(shape), data)?;
    Ok(Self::wrap(TensorData::F32(array)))
  }

  pub fn from_i32(shape: &[usize], data: Vec<i32>) -> Result<Self, TensorError> {
    let array = ArrayD::from_shape_vec(IxDyn(shape), data)?;
    Ok(Self::wrap(TensorData::I32(array)))
  }

  /// 接管一个数组，非标准布局时先转换为行优先
  pub fn from_array(array: ArrayD<f32>) -> Self {
    let array = if array.is_standard_layout() {
      array
    } else {
      array.as_standard_layout().into_owned()
    };
    Self::wrap(TensorData::F32(array))
  }

  pub fn zeros(shape: &[usize]) -> Self {
    Self::wrap(TensorData::F32(ArrayD::zeros(IxDyn(shape))))
  }

  pub fn shape(&self) -> &[usize] {
    self.data.shape()
  }

  pub fn ndim(&self) -> usize {
    self.shape().len()
  }

  pub fn len(&self) -> usize {
    self.shape().iter().product()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn dtype(&self) -> &'static str {
    self.data.dtype()
  }

  fn type_mismatch(&self, expected: &'static str) -> TensorError {
    TensorError::TypeMismatch {
      expected,
      actual: self.dtype(),
    }
  }

  pub fn as_f32(&self) -> Result<&[f32], TensorError> {
    match &self.data {
      TensorData::F32(a) => a.as_slice().ok_or_else(|| self.type_mismatch("f32")),
      _ => Err(self.type_mismatch("f32")),
    }
  }

  pub fn as_i32(&self) -> Result<&[i32], TensorError> {
    match &self.data {
      TensorData::I32(a) => a.as_slice().ok_or_else(|| self.type_mismatch("i32")),
      _ => Err(self.type_mismatch("i32")),
    }
  }

  /// 取出底层数组，张量随之释放
  pub fn into_f32(mut self) -> Result<ArrayD<f32>, TensorError> {
    if let TensorData::F32(a) = &mut self.data {
      return Ok(std::mem::take(a));
    }
    Err(self.type_mismatch("f32"))
  }

  /// 按 `axes` 重新排列各轴，等价于 numpy 的 `transpose`
  pub fn permute(&self, axes: &[usize]) -> Result<Tensor, TensorError> {
    let ndim = self.ndim();
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    if !sorted.iter().copied().eq(0..ndim) {
      return Err(TensorError::InvalidAxes {
        axes: axes.to_vec(),
        ndim,
      });
    }

    let data = match &self.data {
      TensorData::F32(a) => {
        TensorData::F32(a.view().permuted_axes(IxDyn(axes)).as_standard_layout().into_owned())
      }
      TensorData::I32(a) => {
        TensorData::I32(a.view().permuted_axes(IxDyn(axes)).as_standard_layout().into_owned())
      }
    };
    Ok(Tensor::wrap(data))
  }

  /// 在 `axis` 处插入长度为 1 的轴
  pub fn expand_dims(mut self, axis: usize) -> Result<Tensor, TensorError> {
    let ndim = self.ndim();
    if axis > ndim {
      return Err(TensorError::InvalidAxes {
        axes: vec![axis],
        ndim,
      });
    }
    match &mut self.data {
      TensorData::F32(a) => *a = std::mem::take(a).insert_axis(Axis(axis)),
      TensorData::I32(a) => *a = std::mem::take(a).insert_axis(Axis(axis)),
    }
    Ok(self)
  }

  /// 沿第 0 轴按索引收集，结果保持 `indices` 的顺序
  pub fn gather_rows(&self, indices: &[usize]) -> Result<Tensor, TensorError> {
    let Some(&rows) = self.shape().first() else {
      return Err(TensorError::InvalidAxes {
        axes: vec![0],
        ndim: 0,
      });
    };
    if let Some(&index) = indices.iter().find(|&&i| i >= rows) {
      return Err(TensorError::IndexOutOfRange { index, len: rows });
    }

    let data = match &self.data {
      TensorData::F32(a) => TensorData::F32(a.select(Axis(0), indices)),
      TensorData::I32(a) => TensorData::I32(a.select(Axis(0), indices)),
    };
    Ok(Tensor::wrap(data))
  }
}

impl Clone for Tensor {
  fn clone(&self) -> Self {
    Self::wrap(self.data.clone())
  }
}

impl Drop for Tensor {
  fn drop(&mut self) {
    track_release();
  }
}

/// 一次检测调用的张量作用域。
///
/// 创建时记录当前存活张量数，析构时检查是否回到该基线。跨越抑制步骤的
/// 张量在数据拷出后应通过 [`TensorScope::release`] 显式释放。
pub struct TensorScope {
  name: &'static str,
  baseline: usize,
}

impl TensorScope {
  pub fn begin(name: &'static str) -> Self {
    let baseline = live_tensors();
    debug!("进入张量作用域 {}, 基线 {}", name, baseline);
    Self { name, baseline }
  }

  /// 本作用域内新增且仍存活的张量数量
  pub fn live(&self) -> usize {
    live_tensors().saturating_sub(self.baseline)
  }

  pub fn release<I: IntoIterator<Item = Tensor>>(&self, tensors: I) {
    let mut count = 0usize;
    for tensor in tensors {
      drop(tensor);
      count += 1;
    }
    debug!("作用域 {} 显式释放 {} 个张量", self.name, count);
  }
}

impl Drop for TensorScope {
  fn drop(&mut self) {
    let leaked = self.live();
    if leaked > 0 {
      warn!("张量作用域 {} 结束时仍有 {} 个张量存活", self.name, leaked);
    } else {
      debug!("离开张量作用域 {}", self.name);
    }
  }
}
