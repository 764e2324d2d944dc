// 该文件是 Tianmu （天目） 项目的一部分。
// src/labels.rs - 类别标签表
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

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("标签文件格式错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("标签表为空")]
  Empty,
}

#[derive(Deserialize)]
struct ClassLabels {
  classes: Vec<String>,
}

/// 有序的类别标签表，加载后不可修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabelTable {
  classes: Box<[String]>,
}

impl ClassLabelTable {
  /// 解析 `{"classes": [...]}` 格式的 JSON
  pub fn from_json_str(json: &str) -> Result<Self, LabelError> {
    let labels: ClassLabels = serde_json::from_str(json)?;
    if labels.classes.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(Self {
      classes: labels.classes.into_boxed_slice(),
    })
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)?;
    let table = Self::from_json_str(&json)?;
    info!("已加载 {} 个类别标签: {}", table.len(), path.display());
    Ok(table)
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.classes.get(index).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.classes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.classes.is_empty()
  }
}

impl<S: Into<String>> FromIterator<S> for ClassLabelTable {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Self {
      classes: iter.into_iter().map(Into::into).collect(),
    }
  }
}
