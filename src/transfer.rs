// 该文件是 Tianmu （天目） 项目的一部分。
// src/transfer.rs - 传输缓冲区管理
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

//! # 传输缓冲区
//!
//! 每一帧的数据搬运分为四步：
//! 1. 将当前输入源的画面缩放拷贝到暂存表面；
//! 2. 将暂存表面标记为当前读取目标；
//! 3. 同步读回像素到 CPU 侧的 [`PixelBuffer`]（RGB，行优先，无填充）；
//! 4. 释放本帧使用的临时资源。
//!
//! 暂存表面与 CPU 缓冲区成对分配，只有目标尺寸变化时才会重新分配。

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, info};

use crate::{dims::Resolution, frame::PixelBuffer};

#[derive(Error, Debug)]
pub enum TransferError {
  #[error("暂存表面分配失败 ({resolution}): {reason}")]
  Allocation {
    resolution: Resolution,
    reason: String,
  },
  #[error("输入画面为空")]
  EmptySource,
  #[error("读回缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  ReadbackSizeMismatch { expected: usize, actual: usize },
}

/// 暂存表面
pub trait Surface {
  fn resolution(&self) -> Resolution;

  /// 将输入画面缩放拷贝到表面
  fn blit(&mut self, source: &RgbImage) -> Result<(), TransferError>;

  /// 按 RGB 行优先顺序读回全部像素
  fn read_pixels(&self, dst: &mut [u8]) -> Result<(), TransferError>;
}

/// 暂存表面分配器
pub trait SurfaceAllocator {
  type Surface: Surface;

  fn allocate(&mut self, resolution: Resolution) -> Result<Self::Surface, TransferError>;

  /// 归还不再使用的表面
  fn release(&mut self, surface: Self::Surface);
}

/// 基于内存图像的暂存表面
pub struct CpuSurface {
  image: RgbImage,
  filter: FilterType,
}

impl Surface for CpuSurface {
  fn resolution(&self) -> Resolution {
    self.image.dimensions().into()
  }

  fn blit(&mut self, source: &RgbImage) -> Result<(), TransferError> {
    if source.width() == 0 || source.height() == 0 {
      return Err(TransferError::EmptySource);
    }

    let (width, height) = self.image.dimensions();
    if source.dimensions() == (width, height) {
      self.image.copy_from_slice(source.as_raw());
    } else {
      // 缩放结果只在本帧内存在，拷贝后即释放
      let scaled = image::imageops::resize(source, width, height, self.filter);
      self.image.copy_from_slice(scaled.as_raw());
    }
    Ok(())
  }

  fn read_pixels(&self, dst: &mut [u8]) -> Result<(), TransferError> {
    let src = self.image.as_raw();
    if dst.len() != src.len() {
      return Err(TransferError::ReadbackSizeMismatch {
        expected: src.len(),
        actual: dst.len(),
      });
    }
    dst.copy_from_slice(src);
    Ok(())
  }
}

/// [`CpuSurface`] 分配器
#[derive(Debug)]
pub struct CpuAllocator {
  filter: FilterType,
  live: usize,
}

impl Default for CpuAllocator {
  fn default() -> Self {
    Self {
      filter: FilterType::Triangle,
      live: 0,
    }
  }
}

impl CpuAllocator {
  pub fn with_filter(mut self, filter: FilterType) -> Self {
    self.filter = filter;
    self
  }

  /// 当前尚未归还的表面数量
  pub fn live_surfaces(&self) -> usize {
    self.live
  }
}

impl SurfaceAllocator for CpuAllocator {
  type Surface = CpuSurface;

  fn allocate(&mut self, resolution: Resolution) -> Result<CpuSurface, TransferError> {
    if resolution.width == 0 || resolution.height == 0 {
      return Err(TransferError::Allocation {
        resolution,
        reason: "尺寸为零".to_string(),
      });
    }
    self.live += 1;
    Ok(CpuSurface {
      image: RgbImage::new(resolution.width, resolution.height),
      filter: self.filter,
    })
  }

  fn release(&mut self, surface: CpuSurface) {
    self.live = self.live.saturating_sub(1);
    drop(surface);
  }
}

/// 成对分配的暂存表面与 CPU 像素缓冲区
pub struct TransferBuffer<S> {
  resolution: Resolution,
  surface: S,
  pixels: PixelBuffer,
}

impl<S: Surface> TransferBuffer<S> {
  pub fn resolution(&self) -> Resolution {
    self.resolution
  }

  pub fn pixels(&self) -> &PixelBuffer {
    &self.pixels
  }

  fn activate(&mut self) -> ActiveSurface<'_, S> {
    ActiveSurface {
      surface: &self.surface,
      pixels: &mut self.pixels,
    }
  }
}

/// 当前读取目标。同一时刻只能存在一个，离开作用域即失效。
struct ActiveSurface<'a, S: Surface> {
  surface: &'a S,
  pixels: &'a mut PixelBuffer,
}

impl<S: Surface> ActiveSurface<'_, S> {
  fn read_back(&mut self) -> Result<(), TransferError> {
    self.surface.read_pixels(self.pixels.as_mut())
  }
}

impl<S: Surface> Drop for ActiveSurface<'_, S> {
  fn drop(&mut self) {
    debug!("读取目标已释放: {}", self.surface.resolution());
  }
}

/// 传输缓冲区管理器
pub struct TransferManager<A: SurfaceAllocator> {
  allocator: A,
  buffer: Option<TransferBuffer<A::Surface>>,
  allocations: usize,
}

impl<A: SurfaceAllocator> TransferManager<A> {
  pub fn new(allocator: A) -> Self {
    Self {
      allocator,
      buffer: None,
      allocations: 0,
    }
  }

  pub fn allocator(&self) -> &A {
    &self.allocator
  }

  /// 已发生的分配次数
  pub fn allocations(&self) -> usize {
    self.allocations
  }

  pub fn current(&self) -> Option<&TransferBuffer<A::Surface>> {
    self.buffer.as_ref()
  }

  /// 复用或重新分配传输缓冲区
  pub fn ensure(
    &mut self,
    target: Resolution,
  ) -> Result<&mut TransferBuffer<A::Surface>, TransferError> {
    let stale = self
      .buffer
      .as_ref()
      .is_none_or(|buffer| buffer.resolution != target);

    if stale {
      if let Some(old) = self.buffer.take() {
        info!("目标尺寸变化: {} -> {}", old.resolution, target);
        self.allocator.release(old.surface);
      }
      let surface = self.allocator.allocate(target)?;
      self.buffer = Some(TransferBuffer {
        resolution: target,
        surface,
        pixels: PixelBuffer::with_resolution(target),
      });
      self.allocations += 1;
      debug!("已分配传输缓冲区: {}", target);
    }

    self
      .buffer
      .as_mut()
      .ok_or_else(|| TransferError::Allocation {
        resolution: target,
        reason: "缓冲区缺失".to_string(),
      })
  }

  /// 将输入画面搬运到 CPU 像素缓冲区
  pub fn transfer(
    &mut self,
    source: &RgbImage,
    target: Resolution,
  ) -> Result<&PixelBuffer, TransferError> {
    let buffer = self.ensure(target)?;
    buffer.surface.blit(source)?;
    {
      let mut active = buffer.activate();
      active.read_back()?;
    }
    Ok(&buffer.pixels)
  }
}

impl<A: SurfaceAllocator> Drop for TransferManager<A> {
  fn drop(&mut self) {
    if let Some(buffer) = self.buffer.take() {
      self.allocator.release(buffer.surface);
    }
  }
}
