// 该文件是 Tianmu （天目） 项目的一部分。
// src/model.rs - 推理后端调用
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
  cell::Cell,
  fmt::Display,
  path::{Path, PathBuf},
  rc::Rc,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::frame::PixelBuffer;

#[cfg(feature = "rknn_backend")]
mod rknn;
#[cfg(feature = "rknn_backend")]
pub use self::rknn::{RknnBackend, RknnBackendError};

/// 结果向量长度：[类别索引, 置信度]
pub const RESULT_LEN: usize = 2;

/// 一次推理的结果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InferenceResult {
  /// 以浮点数编码的非负整数类别索引
  pub class_index: f32,
  /// 置信度，范围 [0, 1]
  pub confidence: f32,
}

impl InferenceResult {
  pub fn new(class_index: f32, confidence: f32) -> Self {
    Self {
      class_index,
      confidence,
    }
  }
}

impl From<[f32; RESULT_LEN]> for InferenceResult {
  fn from([class_index, confidence]: [f32; RESULT_LEN]) -> Self {
    Self {
      class_index,
      confidence,
    }
  }
}

/// 推理后端写入的定长结果向量。
///
/// 模型加载时把一个克隆交给后端，此后每次推理由后端写入、由解码器读取，
/// 在模型生命周期内始终是同一块存储，长度固定为 [`RESULT_LEN`]。
#[derive(Debug, Clone, Default)]
pub struct ResultSlot {
  inner: Rc<Cell<[f32; RESULT_LEN]>>,
}

impl ResultSlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn write(&self, values: [f32; RESULT_LEN]) {
    self.inner.set(values);
  }

  pub fn read(&self) -> InferenceResult {
    self.inner.get().into()
  }

  pub const fn len(&self) -> usize {
    RESULT_LEN
  }

  pub const fn is_empty(&self) -> bool {
    false
  }

  /// 两个句柄是否指向同一块存储
  pub fn same_slot(&self, other: &ResultSlot) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }
}

/// 外部推理后端的调用约定
pub trait InferenceBackend {
  type Error: Display;

  /// 加载模型，并绑定结果向量
  fn load_model(&mut self, path: &Path, slot: ResultSlot) -> Result<(), Self::Error>;

  /// 切换计算后端
  fn set_compute_backend(&mut self, name: &str) -> Result<(), Self::Error>;

  /// 可用的计算后端名称
  fn backends(&self) -> &[&'static str];

  /// 对一帧 RGB 数据执行推理，返回模型是否就绪。结果写入绑定的结果向量。
  fn infer(
    &mut self,
    pixels: &[u8],
    byte_count: usize,
    width: u32,
    height: u32,
  ) -> Result<bool, Self::Error>;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InferenceError {
  /// 调用方错误：字节数与尺寸不符
  #[error("输入字节数不匹配: {width}x{height}x3 需要 {expected} 字节, 实际 {actual} 字节")]
  ByteCountMismatch {
    width: u32,
    height: u32,
    expected: usize,
    actual: usize,
  },
  #[error("推理后端错误: {0}")]
  Backend(String),
}

/// 推理调用适配器，记录模型就绪状态
pub struct InferenceAdapter<B: InferenceBackend> {
  backend: B,
  slot: ResultSlot,
  ready: bool,
  model: Option<PathBuf>,
  compute_backend: Option<String>,
}

impl<B: InferenceBackend> InferenceAdapter<B> {
  pub fn new(backend: B) -> Self {
    Self {
      backend,
      slot: ResultSlot::new(),
      ready: false,
      model: None,
      compute_backend: None,
    }
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  pub fn slot(&self) -> &ResultSlot {
    &self.slot
  }

  /// 最近一次推理是否给出可信结果
  pub fn ready(&self) -> bool {
    self.ready
  }

  pub fn result(&self) -> InferenceResult {
    self.slot.read()
  }

  pub fn model(&self) -> Option<&Path> {
    self.model.as_deref()
  }

  pub fn compute_backend(&self) -> Option<&str> {
    self.compute_backend.as_deref()
  }

  pub fn backends(&self) -> &[&'static str] {
    self.backend.backends()
  }

  /// 加载模型。完成前推理结果不可信。
  pub fn load_model(&mut self, path: &Path) -> Result<(), InferenceError> {
    self.ready = false;
    info!("加载模型: {}", path.display());
    self
      .backend
      .load_model(path, self.slot.clone())
      .map_err(|e| InferenceError::Backend(e.to_string()))?;
    self.model = Some(path.to_path_buf());
    info!("模型加载完成");
    Ok(())
  }

  /// 切换计算后端，下一次成功推理前不就绪
  pub fn set_compute_backend(&mut self, name: &str) -> Result<(), InferenceError> {
    self.ready = false;
    info!("切换计算后端: {}", name);
    self
      .backend
      .set_compute_backend(name)
      .map_err(|e| InferenceError::Backend(e.to_string()))?;
    self.compute_backend = Some(name.to_string());
    Ok(())
  }

  pub fn infer(&mut self, pixels: &PixelBuffer) -> Result<bool, InferenceError> {
    self.infer_raw(pixels.as_bytes(), pixels.width(), pixels.height())
  }

  /// 字节数必须等于 `width * height * 3`
  pub fn infer_raw(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<bool, InferenceError> {
    let expected = width as usize * height as usize * 3;
    if pixels.len() != expected {
      self.ready = false;
      return Err(InferenceError::ByteCountMismatch {
        width,
        height,
        expected,
        actual: pixels.len(),
      });
    }

    self.ready = match self.backend.infer(pixels, expected, width, height) {
      Ok(ready) => ready,
      Err(e) => {
        warn!("推理失败: {}", e);
        false
      }
    };
    debug!("推理完成: ready={}, result={:?}", self.ready, self.slot.read());
    Ok(self.ready)
  }
}

/// 对分类输出取最大值，返回 (类别索引, 置信度)。
///
/// 并列时取索引较小者；`softmax` 为真时先把 logits 归一化为概率。
pub fn top1(scores: &[f32], softmax: bool) -> Option<(usize, f32)> {
  let (index, &max) = scores
    .iter()
    .enumerate()
    .rev()
    .filter(|(_, s)| !s.is_nan())
    .max_by(|(_, a), (_, b)| a.total_cmp(b))?;

  if !softmax {
    return Some((index, max));
  }
  let sum: f32 = scores
    .iter()
    .filter(|s| !s.is_nan())
    .map(|s| (s - max).exp())
    .sum();
  Some((index, 1.0 / sum))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dims::Resolution;

  #[derive(Default)]
  struct EchoBackend {
    slot: Option<ResultSlot>,
    calls: usize,
  }

  impl InferenceBackend for EchoBackend {
    type Error = String;

    fn load_model(&mut self, _path: &Path, slot: ResultSlot) -> Result<(), String> {
      self.slot = Some(slot);
      Ok(())
    }

    fn set_compute_backend(&mut self, name: &str) -> Result<(), String> {
      if name == "cpu" {
        Ok(())
      } else {
        Err(format!("unknown backend {}", name))
      }
    }

    fn backends(&self) -> &[&'static str] {
      &["cpu"]
    }

    fn infer(&mut self, pixels: &[u8], byte_count: usize, _w: u32, _h: u32) -> Result<bool, String> {
      self.calls += 1;
      assert_eq!(pixels.len(), byte_count);
      match &self.slot {
        Some(slot) => {
          slot.write([1.0, pixels[0] as f32 / 255.0]);
          Ok(true)
        }
        None => Ok(false),
      }
    }
  }

  #[test]
  fn not_ready_until_model_loaded() {
    let mut adapter = InferenceAdapter::new(EchoBackend::default());
    let pixels = PixelBuffer::with_resolution(Resolution::new(4, 4));
    assert_eq!(adapter.infer(&pixels), Ok(false));
    assert!(!adapter.ready());

    adapter.load_model(Path::new("model.rknn")).unwrap();
    assert!(!adapter.ready());
    assert_eq!(adapter.infer(&pixels), Ok(true));
    assert!(adapter.ready());
  }

  #[test]
  fn backend_writes_into_bound_slot() {
    let mut adapter = InferenceAdapter::new(EchoBackend::default());
    adapter.load_model(Path::new("model.rknn")).unwrap();
    let bound = adapter.backend().slot.clone().unwrap();
    assert!(bound.same_slot(adapter.slot()));

    let mut pixels = PixelBuffer::with_resolution(Resolution::new(2, 2));
    pixels.as_mut()[0] = 255;
    adapter.infer(&pixels).unwrap();
    assert_eq!(adapter.result(), InferenceResult::new(1.0, 1.0));
    assert_eq!(adapter.slot().len(), RESULT_LEN);
  }

  #[test]
  fn byte_count_mismatch_is_rejected() {
    let mut adapter = InferenceAdapter::new(EchoBackend::default());
    adapter.load_model(Path::new("model.rknn")).unwrap();
    let err = adapter.infer_raw(&[0u8; 10], 2, 2).unwrap_err();
    assert_eq!(
      err,
      InferenceError::ByteCountMismatch {
        width: 2,
        height: 2,
        expected: 12,
        actual: 10
      }
    );
    assert_eq!(adapter.backend().calls, 0);
  }

  #[test]
  fn backend_switch_resets_readiness() {
    let mut adapter = InferenceAdapter::new(EchoBackend::default());
    adapter.load_model(Path::new("model.rknn")).unwrap();
    let pixels = PixelBuffer::with_resolution(Resolution::new(2, 2));
    adapter.infer(&pixels).unwrap();
    assert!(adapter.ready());

    adapter.set_compute_backend("cpu").unwrap();
    assert!(!adapter.ready());
    assert_eq!(adapter.compute_backend(), Some("cpu"));

    assert!(matches!(
      adapter.set_compute_backend("webgl"),
      Err(InferenceError::Backend(_))
    ));
  }

  #[test]
  fn top1_plain_and_softmax() {
    assert_eq!(top1(&[0.1, 0.7, 0.2], false), Some((1, 0.7)));
    assert_eq!(top1(&[], false), None);

    let (index, prob) = top1(&[1.0, 3.0, 1.0], true).unwrap();
    assert_eq!(index, 1);
    let expected = 1.0 / (1.0 + 2.0 * (-2.0f32).exp());
    assert!((prob - expected).abs() < 1e-6);

    let (_, uniform) = top1(&[0.0; 4], true).unwrap();
    assert!((uniform - 0.25).abs() < 1e-6);
  }
}
