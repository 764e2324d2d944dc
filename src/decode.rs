// 该文件是 Tianmu （天目） 项目的一部分。
// src/decode.rs - 推理结果解码
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

use std::fmt;

use thiserror::Error;

use crate::{labels::ClassLabelTable, model::InferenceResult};

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
  /// 标签表与模型输出的类别数不一致
  #[error("类别索引 {index} 超出标签表范围 (共 {len} 个类别)")]
  LabelOutOfRange { index: f32, len: usize },
}

/// 面向显示的分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
  /// 模型尚未就绪
  NotReady,
  /// 置信度低于阈值
  BelowThreshold,
  Classified {
    label: String,
    /// 百分比，保留两位小数
    confidence_percent: String,
  },
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Outcome::NotReady => write!(f, "Loading Model..."),
      Outcome::BelowThreshold => write!(f, "Predicted Class: None"),
      Outcome::Classified {
        label,
        confidence_percent,
      } => write!(f, "Predicted Class: {} {}%", label, confidence_percent),
    }
  }
}

/// 按置信度阈值解码推理结果，阈值本身视为通过
pub fn decode(
  ready: bool,
  result: InferenceResult,
  labels: &ClassLabelTable,
  threshold: f32,
) -> Result<Outcome, DecodeError> {
  if !ready {
    return Ok(Outcome::NotReady);
  }
  if result.confidence < threshold {
    return Ok(Outcome::BelowThreshold);
  }

  let out_of_range = || DecodeError::LabelOutOfRange {
    index: result.class_index,
    len: labels.len(),
  };
  let index = result.class_index;
  if !index.is_finite() || index < 0.0 {
    return Err(out_of_range());
  }
  let label = labels.get(index as usize).ok_or_else(out_of_range)?;

  Ok(Outcome::Classified {
    label: label.to_string(),
    confidence_percent: format!("{:.2}", result.confidence * 100.0),
  })
}
