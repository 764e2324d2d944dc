// 该文件是 Tianmu （天目） 项目的一部分。
// src/model/rknn.rs - RKNN 分类推理后端
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

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};

use super::{InferenceBackend, ResultSlot, top1};

const RKNN_NUM_INPUTS: u32 = 1;
const RKNN_BACKENDS: &[&str] = &["npu"];

#[derive(Error, Debug)]
pub enum RknnBackendError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("获取输出失败: {0}")]
  OutputError(String),
  #[error("不支持的计算后端: {0}")]
  UnsupportedBackend(String),
}

impl From<std::io::Error> for RknnBackendError {
  fn from(err: std::io::Error) -> Self {
    RknnBackendError::ModelLoadError(err)
  }
}

impl From<rknpu::Error> for RknnBackendError {
  fn from(err: rknpu::Error) -> Self {
    RknnBackendError::RknnError(err)
  }
}

impl RknnBackendError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnBackendError::ModelInvalid(msg.to_string(), e)
  }
}

/// 基于 RKNPU 的分类模型后端。
///
/// 模型输入为 NHWC 排列的 `u8` RGB 数据，第 0 个输出为各类别得分。
pub struct RknnBackend {
  context: Option<Context>,
  slot: Option<ResultSlot>,
  softmax: bool,
}

impl Default for RknnBackend {
  fn default() -> Self {
    Self {
      context: None,
      slot: None,
      softmax: true,
    }
  }
}

impl RknnBackend {
  /// 模型输出已经是概率时关闭 softmax
  pub fn softmax(mut self, softmax: bool) -> Self {
    self.softmax = softmax;
    self
  }
}

impl InferenceBackend for RknnBackend {
  type Error = RknnBackendError;

  fn load_model(&mut self, path: &Path, slot: ResultSlot) -> Result<(), Self::Error> {
    // 旧模型先释放
    self.context = None;

    info!("加载模型文件: {}", path.display());
    let model_data = std::fs::read(path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    info!("创建 RKNN 推理上下文");
    let context = Context::new(&model_data, InitFlags::default())?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!(" 查询 SDK 版本失败: {}", e);
        return Err(RknnBackendError::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnBackendError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnBackendError::invalid("无法获取输出数量", e))?;

    if num_inputs != RKNN_NUM_INPUTS || num_outputs < 1 {
      let msg = format!(
        "预期模型输入数量为 {}、输出数量至少为 1, 实际为 {} / {}",
        RKNN_NUM_INPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(RknnBackendError::invalid(&msg, rknpu::Error::InvalidModel));
    }

    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    self.context = Some(context);
    self.slot = Some(slot);
    Ok(())
  }

  fn set_compute_backend(&mut self, name: &str) -> Result<(), Self::Error> {
    if RKNN_BACKENDS.contains(&name) {
      Ok(())
    } else {
      Err(RknnBackendError::UnsupportedBackend(name.to_string()))
    }
  }

  fn backends(&self) -> &[&'static str] {
    RKNN_BACKENDS
  }

  fn infer(
    &mut self,
    pixels: &[u8],
    byte_count: usize,
    width: u32,
    height: u32,
  ) -> Result<bool, Self::Error> {
    let (Some(context), Some(slot)) = (&self.context, &self.slot) else {
      return Ok(false);
    };

    debug!("设置模型输入: {}x{}", width, height);
    context.set_input(
      0,
      &pixels[..byte_count],
      TensorFormat::NHWC,
      TensorType::UInt8,
    )?;

    debug!("执行模型推理");
    context.run()?;

    let output = context.get_outputs()?;
    let scores = output
      .get_f32(0)
      .map_err(|e| RknnBackendError::OutputError(e.to_string()))?;

    match top1(&scores, self.softmax) {
      Some((index, confidence)) => {
        slot.write([index as f32, confidence]);
        Ok(true)
      }
      None => {
        error!("模型输出为空");
        Ok(false)
      }
    }
  }
}
