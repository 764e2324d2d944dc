// 该文件是 Tianmu （天目） 项目的一部分。
// src/dims.rs - 输入尺寸计算
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

/// 目标最短边的下限
pub const MIN_TARGET_DIM: u32 = 64;
/// 默认目标最短边
pub const DEFAULT_TARGET_DIM: u32 = 216;
/// 宽度不超过该值的实时输入视为尚未就绪
pub const MIN_READY_WIDTH: u32 = 16;

/// 图像分辨率（宽 x 高）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
  pub width: u32,
  pub height: u32,
}

impl Resolution {
  pub const fn new(width: u32, height: u32) -> Self {
    Self { width, height }
  }

  pub fn is_landscape(&self) -> bool {
    self.width >= self.height
  }

  /// 实时输入是否已经完成预热
  pub fn is_warmed_up(&self) -> bool {
    self.width > MIN_READY_WIDTH
  }

  /// RGB 交错排列时的字节数
  pub fn rgb_len(&self) -> usize {
    self.width as usize * self.height as usize * 3
  }
}

impl fmt::Display for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}x{}", self.width, self.height)
  }
}

impl From<(u32, u32)> for Resolution {
  fn from((width, height): (u32, u32)) -> Self {
    Self { width, height }
  }
}

/// 目标最短边长度，构造时下限截断到 [`MIN_TARGET_DIM`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDim(u32);

impl TargetDim {
  pub fn new(value: u32) -> Self {
    Self(value.max(MIN_TARGET_DIM))
  }

  pub fn get(&self) -> u32 {
    self.0
  }
}

impl Default for TargetDim {
  fn default() -> Self {
    Self(DEFAULT_TARGET_DIM)
  }
}

/// 按目标最短边缩放输入分辨率，保持宽高比。
///
/// 计算使用单精度浮点并向零截断，结果直接决定传输缓冲区的大小，
/// 需要与推理端逐位一致。
pub fn compute_input_dims(source: Resolution, target_dim: u32) -> Resolution {
  let target = TargetDim::new(target_dim).get();
  let t = target as f32;

  if source.is_landscape() {
    let width = (source.width as f32 / (source.height as f32 / t)) as u32;
    Resolution::new(width, target)
  } else {
    let height = (source.height as f32 / (source.width as f32 / t)) as u32;
    Resolution::new(target, height)
  }
}
