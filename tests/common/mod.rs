// 该文件是 Tianmu （天目） 项目的一部分。
// tests/common/mod.rs - 测试用的采集、推理与分配器替身
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

#![allow(dead_code)]

use std::{
  cell::{Cell, RefCell},
  path::{Path, PathBuf},
  rc::Rc,
};

use image::{Rgb, RgbImage};
use tianmu::{
  dims::Resolution,
  labels::ClassLabelTable,
  model::{InferenceBackend, ResultSlot},
  source::{
    CaptureBackend, CaptureDevice, CaptureRequest, DeviceInfo, SourceError, SourceManager,
    StaticImage,
  },
  transfer::{CpuAllocator, CpuSurface, SurfaceAllocator, TransferError},
};

pub fn labels() -> ClassLabelTable {
  ["cat", "dog", "fox", "owl"].into_iter().collect()
}

pub fn still(width: u32, height: u32) -> StaticImage {
  StaticImage::new(RgbImage::from_pixel(width, height, Rgb([90, 120, 30]))).unwrap()
}

/// 已打开句柄计数
#[derive(Debug, Default, Clone)]
pub struct HandleCounter {
  open: Rc<Cell<usize>>,
  peak: Rc<Cell<usize>>,
  total: Rc<Cell<usize>>,
}

impl HandleCounter {
  fn acquire(&self) {
    self.open.set(self.open.get() + 1);
    self.total.set(self.total.get() + 1);
    self.peak.set(self.peak.get().max(self.open.get()));
  }

  fn release(&self) {
    self.open.set(self.open.get() - 1);
  }

  pub fn open(&self) -> usize {
    self.open.get()
  }

  pub fn peak(&self) -> usize {
    self.peak.get()
  }

  pub fn total(&self) -> usize {
    self.total.get()
  }
}

/// 模拟摄像头，实际分辨率与故障状态可以在运行中修改
#[derive(Debug, Clone)]
pub struct FakeCamera {
  pub name: String,
  resolution: Rc<Cell<Resolution>>,
  fail_play: Rc<Cell<bool>>,
  stalled: Rc<Cell<bool>>,
  fail_refresh: Rc<Cell<bool>>,
}

impl FakeCamera {
  pub fn new(name: &str, width: u32, height: u32) -> Self {
    Self {
      name: name.to_string(),
      resolution: Rc::new(Cell::new(Resolution::new(width, height))),
      fail_play: Rc::new(Cell::new(false)),
      stalled: Rc::new(Cell::new(false)),
      fail_refresh: Rc::new(Cell::new(false)),
    }
  }

  /// 启动后不会进入播放状态
  pub fn failing(name: &str) -> Self {
    let camera = Self::new(name, 640, 480);
    camera.set_fail_play(true);
    camera
  }

  pub fn set_fail_play(&self, fail: bool) {
    self.fail_play.set(fail);
  }

  /// 模拟采集中途停止（例如设备被拔出）
  pub fn stall(&self) {
    self.stalled.set(true);
  }

  pub fn set_fail_refresh(&self, fail: bool) {
    self.fail_refresh.set(fail);
  }

  pub fn set_resolution(&self, width: u32, height: u32) {
    self.resolution.set(Resolution::new(width, height));
  }
}

#[derive(Debug, Default)]
pub struct FakeBackend {
  pub cameras: Vec<FakeCamera>,
  pub handles: HandleCounter,
}

impl FakeBackend {
  pub fn new(cameras: Vec<FakeCamera>) -> Self {
    Self {
      cameras,
      handles: HandleCounter::default(),
    }
  }
}

pub struct FakeDevice {
  camera: FakeCamera,
  handles: HandleCounter,
  frame: Option<RgbImage>,
  playing: bool,
}

impl CaptureBackend for FakeBackend {
  type Device = FakeDevice;

  fn enumerate(&self) -> Vec<DeviceInfo> {
    self
      .cameras
      .iter()
      .enumerate()
      .map(|(index, camera)| DeviceInfo {
        index,
        name: camera.name.clone(),
        path: PathBuf::from(format!("/dev/fake{}", index)),
      })
      .collect()
  }

  fn open(&self, device: &DeviceInfo, _request: &CaptureRequest) -> Result<FakeDevice, SourceError> {
    let camera = self.cameras[device.index].clone();
    self.handles.acquire();
    Ok(FakeDevice {
      camera,
      handles: self.handles.clone(),
      frame: None,
      playing: false,
    })
  }
}

impl CaptureDevice for FakeDevice {
  fn play(&mut self) -> Result<(), SourceError> {
    self.playing = !self.camera.fail_play.get();
    if self.playing {
      self.camera.stalled.set(false);
    }
    Ok(())
  }

  fn stop(&mut self) {
    self.playing = false;
  }

  fn is_playing(&self) -> bool {
    self.playing && !self.camera.stalled.get()
  }

  fn refresh(&mut self) -> Result<(), SourceError> {
    if self.camera.fail_refresh.get() {
      return Err(SourceError::IoError(std::io::Error::other("device unplugged")));
    }
    let resolution = self.camera.resolution.get();
    let stale = self
      .frame
      .as_ref()
      .is_none_or(|f| Resolution::from(f.dimensions()) != resolution);
    if stale {
      self.frame = Some(RgbImage::from_pixel(
        resolution.width,
        resolution.height,
        Rgb([10, 200, 40]),
      ));
    }
    Ok(())
  }

  fn resolution(&self) -> Resolution {
    self.camera.resolution.get()
  }

  fn frame(&self) -> Option<&RgbImage> {
    self.frame.as_ref()
  }
}

impl Drop for FakeDevice {
  fn drop(&mut self) {
    self.handles.release();
  }
}

pub fn sources(cameras: Vec<FakeCamera>) -> (SourceManager<FakeBackend>, HandleCounter) {
  let backend = FakeBackend::new(cameras);
  let handles = backend.handles.clone();
  (
    SourceManager::new(backend, still(1280, 720), CaptureRequest::default()),
    handles,
  )
}

/// 按脚本返回结果的推理后端
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
  pub result: Rc<Cell<[f32; 2]>>,
  /// 每次推理收到的 (宽, 高, 字节数)
  pub calls: Rc<RefCell<Vec<(u32, u32, usize)>>>,
  pub loaded: Rc<RefCell<Option<PathBuf>>>,
  slot: Option<ResultSlot>,
}

impl ScriptedBackend {
  pub fn new(result: [f32; 2]) -> Self {
    let backend = Self::default();
    backend.result.set(result);
    backend
  }
}

impl InferenceBackend for ScriptedBackend {
  type Error = String;

  fn load_model(&mut self, path: &Path, slot: ResultSlot) -> Result<(), String> {
    if path.as_os_str().is_empty() {
      return Err("empty model path".to_string());
    }
    *self.loaded.borrow_mut() = Some(path.to_path_buf());
    self.slot = Some(slot);
    Ok(())
  }

  fn set_compute_backend(&mut self, name: &str) -> Result<(), String> {
    match name {
      "cpu" | "npu" => Ok(()),
      _ => Err(format!("unsupported backend {}", name)),
    }
  }

  fn backends(&self) -> &[&'static str] {
    &["cpu", "npu"]
  }

  fn infer(&mut self, _pixels: &[u8], byte_count: usize, width: u32, height: u32) -> Result<bool, String> {
    self.calls.borrow_mut().push((width, height, byte_count));
    match &self.slot {
      Some(slot) => {
        slot.write(self.result.get());
        Ok(true)
      }
      None => Ok(false),
    }
  }
}

/// 可以按需让下一次分配失败的分配器
#[derive(Debug, Default)]
pub struct FailingAllocator {
  inner: CpuAllocator,
  pub fail_next: Rc<Cell<usize>>,
}

impl SurfaceAllocator for FailingAllocator {
  type Surface = CpuSurface;

  fn allocate(&mut self, resolution: Resolution) -> Result<CpuSurface, TransferError> {
    let remaining = self.fail_next.get();
    if remaining > 0 {
      self.fail_next.set(remaining - 1);
      return Err(TransferError::Allocation {
        resolution,
        reason: "out of memory".to_string(),
      });
    }
    self.inner.allocate(resolution)
  }

  fn release(&mut self, surface: CpuSurface) {
    self.inner.release(surface);
  }
}
