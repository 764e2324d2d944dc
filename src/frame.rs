// 该文件是 Tianmu （天目） 项目的一部分。
// src/frame.rs - RGB 像素缓冲区定义
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

use crate::dims::Resolution;

pub const RGB_CHANNELS: usize = 3;

/// NHWC 排列的 RGB 像素缓冲区（左上角为原点，行优先，无行填充）
#[derive(Debug, Clone)]
pub struct PixelBuffer {
  resolution: Resolution,
  data: Box<[u8]>,
}

impl PixelBuffer {
  pub fn with_resolution(resolution: Resolution) -> Self {
    let data = vec![0u8; resolution.rgb_len()].into_boxed_slice();
    Self { resolution, data }
  }

  pub fn resolution(&self) -> Resolution {
    self.resolution
  }

  pub fn width(&self) -> u32 {
    self.resolution.width
  }

  pub fn height(&self) -> u32 {
    self.resolution.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn byte_count(&self) -> usize {
    self.data.len()
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 读取 (x, y) 处的像素
  pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
    if x >= self.width() || y >= self.height() {
      return None;
    }
    let idx = (y as usize * self.width() as usize + x as usize) * RGB_CHANNELS;
    Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
  }
}

impl AsMut<[u8]> for PixelBuffer {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl AsRef<[u8]> for PixelBuffer {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}
