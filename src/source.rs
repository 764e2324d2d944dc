// 该文件是 Tianmu （天目） 项目的一部分。
// src/source.rs - 画面输入源
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
  collections::HashMap,
  path::{Path, PathBuf},
};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{FromUrl, dims::Resolution};

mod still;
pub use self::still::StaticImage;

mod v4l_capture;
pub use self::v4l_capture::{V4lCapture, V4lDevice};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_capture;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_capture::{GStreamerCapture, GStreamerCaptureError, GStreamerDevice};

#[derive(Error, Debug)]
pub enum SourceError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("图像尺寸为零: {0}")]
  EmptyImage(String),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
  #[error("采集缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("摄像头 {0} 启动后未处于播放状态")]
  NotPlaying(String),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer capture error: {0}")]
  GStreamerCaptureError(#[from] GStreamerCaptureError),
}

/// 摄像头设备描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
  pub index: usize,
  pub name: String,
  pub path: PathBuf,
}

/// 向摄像头请求的采集参数，实际分辨率以设备协商结果为准
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
  pub width: u32,
  pub height: u32,
  pub fps: u32,
}

impl Default for CaptureRequest {
  fn default() -> Self {
    Self {
      width: 1280,
      height: 720,
      fps: 60,
    }
  }
}

impl CaptureRequest {
  fn from_query(query: &HashMap<String, String>) -> Self {
    let default = Self::default();
    let parse = |key: &str, fallback: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(fallback)
    };
    Self {
      width: parse("width", default.width),
      height: parse("height", default.height),
      fps: parse("fps", default.fps),
    }
  }
}

/// 已打开的采集句柄
pub trait CaptureDevice {
  /// 开始采集
  fn play(&mut self) -> Result<(), SourceError>;

  /// 停止采集，调用返回时设备已释放
  fn stop(&mut self);

  fn is_playing(&self) -> bool;

  /// 拉取最新一帧
  fn refresh(&mut self) -> Result<(), SourceError>;

  /// 设备实际输出的分辨率（可能与请求值不同）
  fn resolution(&self) -> Resolution;

  fn frame(&self) -> Option<&RgbImage>;
}

/// 采集后端：枚举设备并打开句柄
pub trait CaptureBackend {
  type Device: CaptureDevice;

  fn enumerate(&self) -> Vec<DeviceInfo>;

  fn open(
    &self,
    device: &DeviceInfo,
    request: &CaptureRequest,
  ) -> Result<Self::Device, SourceError>;
}

/// 连续解码失败达到该次数后停止采集，交由 `SourceManager::poll` 重启
pub const MAX_DECODE_ERRORS: u32 = 5;

/// 连续解码失败计数
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DecodeErrorRun {
  count: u32,
}

impl DecodeErrorRun {
  pub(crate) fn success(&mut self) {
    self.count = 0;
  }

  /// 记录一次失败，达到上限时返回 true 并重新计数
  pub(crate) fn failure(&mut self) -> bool {
    self.count += 1;
    if self.count >= MAX_DECODE_ERRORS {
      self.count = 0;
      true
    } else {
      false
    }
  }
}

/// 实时采集输入
pub struct LiveCapture<D> {
  device: DeviceInfo,
  request: CaptureRequest,
  handle: D,
}

impl<D: CaptureDevice> LiveCapture<D> {
  pub fn device(&self) -> &DeviceInfo {
    &self.device
  }

  pub fn request(&self) -> CaptureRequest {
    self.request
  }
}

/// 当前画面输入源，任一时刻只有一个处于活动状态
pub enum FrameSource<D> {
  LiveCapture(LiveCapture<D>),
  StaticImage(StaticImage),
}

impl<D: CaptureDevice> FrameSource<D> {
  pub fn resolution(&self) -> Resolution {
    match self {
      FrameSource::LiveCapture(live) => live.handle.resolution(),
      FrameSource::StaticImage(still) => still.resolution(),
    }
  }

  pub fn frame(&self) -> Option<&RgbImage> {
    match self {
      FrameSource::LiveCapture(live) => live.handle.frame(),
      FrameSource::StaticImage(still) => Some(still.image()),
    }
  }

  pub fn is_live(&self) -> bool {
    matches!(self, FrameSource::LiveCapture(_))
  }

  fn stop(self) {
    if let FrameSource::LiveCapture(mut live) = self {
      if live.handle.is_playing() {
        info!("停止摄像头: {}", live.device.name);
      }
      live.handle.stop();
    }
  }
}

/// 请求切换到的输入源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceSelection {
  Camera(usize),
  Still,
}

/// 切换结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
  Live(DeviceInfo),
  Still,
  /// 摄像头启动失败，已回退到静态图像
  FellBack { reason: String },
}

/// 每帧开始时的输入源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
  /// 摄像头尚未预热完成
  NotReady,
  Ready {
    resolution: Resolution,
    /// 实际分辨率与上次观察到的不同
    changed: bool,
  },
}

/// 输入源生命周期管理
pub struct SourceManager<C: CaptureBackend> {
  backend: C,
  devices: Vec<DeviceInfo>,
  still: StaticImage,
  active: FrameSource<C::Device>,
  request: CaptureRequest,
  current_device: usize,
  use_camera: bool,
  observed: Option<Resolution>,
}

impl<C: CaptureBackend> SourceManager<C> {
  pub fn new(backend: C, still: StaticImage, request: CaptureRequest) -> Self {
    let devices = backend.enumerate();
    for device in &devices {
      info!(
        "发现摄像头 [{}]: {} ({})",
        device.index,
        device.name,
        device.path.display()
      );
    }
    if devices.is_empty() {
      info!("未发现摄像头，仅使用静态图像");
    }

    Self {
      backend,
      devices,
      active: FrameSource::StaticImage(still.clone()),
      still,
      request,
      current_device: 0,
      use_camera: false,
      observed: None,
    }
  }

  pub fn devices(&self) -> &[DeviceInfo] {
    &self.devices
  }

  pub fn active(&self) -> &FrameSource<C::Device> {
    &self.active
  }

  pub fn is_live(&self) -> bool {
    self.active.is_live()
  }

  pub fn current_device(&self) -> usize {
    self.current_device
  }

  /// 是否请求使用摄像头
  pub fn use_camera(&self) -> bool {
    self.use_camera
  }

  /// 当前打开的采集句柄数量（0 或 1）
  pub fn open_handles(&self) -> usize {
    usize::from(self.is_live())
  }

  pub fn frame(&self) -> Option<&RgbImage> {
    self.active.frame()
  }

  /// 切换输入源：先同步停止旧的摄像头，再启动新的输入源
  pub fn switch_to(&mut self, selection: SourceSelection) -> SwitchOutcome {
    let previous = std::mem::replace(
      &mut self.active,
      FrameSource::StaticImage(self.still.clone()),
    );
    previous.stop();

    let index = match selection {
      SourceSelection::Still => {
        self.use_camera = false;
        return SwitchOutcome::Still;
      }
      SourceSelection::Camera(index) => index,
    };

    let Some(device) = self.devices.get(index).cloned() else {
      if self.devices.is_empty() {
        debug!("没有可用的摄像头，使用静态图像");
      } else {
        warn!("摄像头索引 {} 超出范围，使用静态图像", index);
      }
      self.use_camera = false;
      return SwitchOutcome::Still;
    };

    self.current_device = index;
    match self.start_live(&device) {
      Ok(live) => {
        info!("摄像头已启动: {}", device.name);
        self.active = FrameSource::LiveCapture(live);
        self.use_camera = true;
        SwitchOutcome::Live(device)
      }
      Err(e) => {
        warn!("摄像头未能启动，回退到静态图像: {}", e);
        self.use_camera = false;
        SwitchOutcome::FellBack {
          reason: e.to_string(),
        }
      }
    }
  }

  fn start_live(&self, device: &DeviceInfo) -> Result<LiveCapture<C::Device>, SourceError> {
    let mut handle = self.backend.open(device, &self.request)?;
    if let Err(e) = handle.play() {
      handle.stop();
      return Err(e);
    }
    if !handle.is_playing() {
      handle.stop();
      return Err(SourceError::NotPlaying(device.name.clone()));
    }
    Ok(LiveCapture {
      device: device.clone(),
      request: self.request,
      handle,
    })
  }

  /// 打开或关闭摄像头输入
  pub fn set_use_camera(&mut self, use_camera: bool) -> SwitchOutcome {
    if use_camera {
      self.switch_to(SourceSelection::Camera(self.current_device))
    } else {
      self.switch_to(SourceSelection::Still)
    }
  }

  /// 选择摄像头；若当前正在使用摄像头则立即切换
  pub fn select_device(&mut self, index: usize) -> Option<SwitchOutcome> {
    if self.devices.is_empty() {
      debug!("没有可用的摄像头");
      return None;
    }
    if index >= self.devices.len() {
      warn!("摄像头索引 {} 超出范围", index);
      return None;
    }
    self.current_device = index;
    info!("选择摄像头: {}", self.devices[index].name);
    if self.use_camera {
      Some(self.switch_to(SourceSelection::Camera(index)))
    } else {
      None
    }
  }

  fn live_stalled(&self) -> bool {
    match &self.active {
      FrameSource::LiveCapture(live) => !live.handle.is_playing(),
      FrameSource::StaticImage(_) => true,
    }
  }

  /// 每帧开始时调用：必要时重启摄像头，拉取最新画面并检查分辨率变化
  pub fn poll(&mut self) -> Result<SourceStatus, SourceError> {
    if self.use_camera && self.live_stalled() {
      warn!("摄像头未在运行，尝试重新启动");
      self.switch_to(SourceSelection::Camera(self.current_device));
    }

    let resolution = match &mut self.active {
      FrameSource::LiveCapture(live) => {
        live.handle.refresh()?;
        let resolution = live.handle.resolution();
        if !resolution.is_warmed_up() || live.handle.frame().is_none() {
          return Ok(SourceStatus::NotReady);
        }
        resolution
      }
      FrameSource::StaticImage(still) => still.resolution(),
    };

    let changed = self.observed != Some(resolution);
    if changed {
      match self.observed {
        Some(old) => info!("输入分辨率变化: {} -> {}", old, resolution),
        None => info!("输入分辨率: {}", resolution),
      }
      self.observed = Some(resolution);
    }

    Ok(SourceStatus::Ready {
      resolution,
      changed,
    })
  }
}

impl<C: CaptureBackend> Drop for SourceManager<C> {
  fn drop(&mut self) {
    let active = std::mem::replace(
      &mut self.active,
      FrameSource::StaticImage(self.still.clone()),
    );
    active.stop();
  }
}

/// 按 URL 选择的采集后端
pub enum CaptureWrapper {
  V4l(V4lCapture),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerCapture),
}

/// [`CaptureWrapper`] 打开的采集句柄
pub enum CaptureWrapperDevice {
  V4l(V4lDevice),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerDevice),
}

/// 由 URL 解析出的采集配置
pub struct CaptureConfig {
  pub backend: CaptureWrapper,
  pub request: CaptureRequest,
  /// URL 中指定的设备路径
  pub device_path: Option<PathBuf>,
}

/// 在设备列表中查找指定路径的设备，找不到时使用第一个
pub fn preferred_index(device_path: Option<&Path>, devices: &[DeviceInfo]) -> usize {
  device_path
    .and_then(|path| devices.iter().position(|d| d.path == path))
    .unwrap_or(0)
}

impl FromUrl for CaptureConfig {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let backend = match url.scheme() {
      v4l_capture::V4L_SCHEME => CaptureWrapper::V4l(V4lCapture),
      #[cfg(feature = "gstreamer_input")]
      gstreamer_capture::GSTREAMER_SCHEME => {
        let io_mode = query.get("io-mode").and_then(|v| v.parse::<u32>().ok());
        CaptureWrapper::GStreamer(GStreamerCapture::default().io_mode(io_mode))
      }
      _ => return Err(SourceError::SchemeMismatch),
    };

    let path = crate::url_path(url);
    let device_path = match path.as_str() {
      "" | "/" => None,
      p => Some(PathBuf::from(p)),
    };

    Ok(CaptureConfig {
      backend,
      request: CaptureRequest::from_query(&query),
      device_path,
    })
  }
}

impl CaptureBackend for CaptureWrapper {
  type Device = CaptureWrapperDevice;

  fn enumerate(&self) -> Vec<DeviceInfo> {
    match self {
      CaptureWrapper::V4l(backend) => backend.enumerate(),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapper::GStreamer(backend) => backend.enumerate(),
    }
  }

  fn open(
    &self,
    device: &DeviceInfo,
    request: &CaptureRequest,
  ) -> Result<Self::Device, SourceError> {
    match self {
      CaptureWrapper::V4l(backend) => backend.open(device, request).map(CaptureWrapperDevice::V4l),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapper::GStreamer(backend) => backend
        .open(device, request)
        .map(CaptureWrapperDevice::GStreamer),
    }
  }
}

impl CaptureDevice for CaptureWrapperDevice {
  fn play(&mut self) -> Result<(), SourceError> {
    match self {
      CaptureWrapperDevice::V4l(device) => device.play(),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapperDevice::GStreamer(device) => device.play(),
    }
  }

  fn stop(&mut self) {
    match self {
      CaptureWrapperDevice::V4l(device) => device.stop(),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapperDevice::GStreamer(device) => device.stop(),
    }
  }

  fn is_playing(&self) -> bool {
    match self {
      CaptureWrapperDevice::V4l(device) => device.is_playing(),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapperDevice::GStreamer(device) => device.is_playing(),
    }
  }

  fn refresh(&mut self) -> Result<(), SourceError> {
    match self {
      CaptureWrapperDevice::V4l(device) => device.refresh(),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapperDevice::GStreamer(device) => device.refresh(),
    }
  }

  fn resolution(&self) -> Resolution {
    match self {
      CaptureWrapperDevice::V4l(device) => device.resolution(),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapperDevice::GStreamer(device) => device.resolution(),
    }
  }

  fn frame(&self) -> Option<&RgbImage> {
    match self {
      CaptureWrapperDevice::V4l(device) => device.frame(),
      #[cfg(feature = "gstreamer_input")]
      CaptureWrapperDevice::GStreamer(device) => device.frame(),
    }
  }
}
