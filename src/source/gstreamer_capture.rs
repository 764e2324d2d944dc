// 该文件是 Tianmu （天目） 项目的一部分。
// src/source/gstreamer_capture.rs - GStreamer 摄像头采集
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

//! # GStreamer 摄像头采集
//!
//! 使用 `v4l2src` 打开摄像头，经 `videoconvert` 转换为 RGB 后由 `appsink` 取帧。
//! 与直接使用 V4L2 相比，可以处理更多的像素格式。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## URL 格式
//!
//! ```text
//! gst:///dev/video0?width=1280&height=720&fps=30&io-mode=2
//! ```
//!
//! 实际分辨率取自每一帧的 caps，在第一帧到达之前分辨率为 0x0，
//! 输入源在此期间视为尚未就绪。

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{
  CaptureBackend, CaptureDevice, CaptureRequest, DecodeErrorRun, DeviceInfo, MAX_DECODE_ERRORS,
  SourceError,
};
use crate::dims::Resolution;

pub(super) const GSTREAMER_SCHEME: &str = "gst";

const PULL_TIMEOUT_MS: u64 = 100;
const STATE_TIMEOUT_SECS: u64 = 2;

/// GStreamer 采集错误类型
#[derive(Error, Debug)]
pub enum GStreamerCaptureError {
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

/// GStreamer 采集后端
#[derive(Debug, Default, Clone)]
pub struct GStreamerCapture {
  io_mode: Option<u32>,
}

impl GStreamerCapture {
  pub fn io_mode(mut self, io_mode: Option<u32>) -> Self {
    self.io_mode = io_mode;
    self
  }

  fn pipeline_description(&self, device: &DeviceInfo, request: &CaptureRequest) -> String {
    let io_mode = self
      .io_mode
      .map(|mode| format!(" io-mode={}", mode))
      .unwrap_or_default();
    let framerate = if request.fps > 0 {
      format!(",framerate={}/1", request.fps)
    } else {
      String::new()
    };
    format!(
      "v4l2src device={}{} ! video/x-raw,width={},height={}{} ! videoconvert ! \
       video/x-raw,format=RGB ! appsink max-buffers=2 drop=true name=sink",
      device.path.display(),
      io_mode,
      request.width,
      request.height,
      framerate
    )
  }
}

impl CaptureBackend for GStreamerCapture {
  type Device = GStreamerDevice;

  fn enumerate(&self) -> Vec<DeviceInfo> {
    super::v4l_capture::enumerate_nodes()
  }

  fn open(
    &self,
    device: &DeviceInfo,
    request: &CaptureRequest,
  ) -> Result<GStreamerDevice, SourceError> {
    gst::init().map_err(GStreamerCaptureError::from)?;

    let description = self.pipeline_description(device, request);
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(&description)
      .map_err(GStreamerCaptureError::from)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerCaptureError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerCaptureError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerCaptureError::AppSinkConversionFailed)?;

    Ok(GStreamerDevice {
      pipeline,
      appsink,
      frame: None,
      resolution: Resolution::new(0, 0),
      playing: false,
      decode_errors: DecodeErrorRun::default(),
    })
  }
}

/// 已打开的 GStreamer 采集管道
pub struct GStreamerDevice {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  frame: Option<RgbImage>,
  resolution: Resolution,
  playing: bool,
  decode_errors: DecodeErrorRun,
}

impl GStreamerDevice {
  /// 处理总线上的错误与流结束消息
  fn drain_bus(&mut self) {
    let Some(bus) = self.pipeline.bus() else {
      return;
    };
    while let Some(msg) =
      bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])
    {
      match msg.view() {
        gst::MessageView::Error(err) => {
          error!("GStreamer 管道错误: {} ({:?})", err.error(), err.debug());
          self.playing = false;
        }
        gst::MessageView::Eos(_) => {
          warn!("GStreamer 管道已结束");
          self.playing = false;
        }
        _ => {}
      }
    }
  }
}

impl CaptureDevice for GStreamerDevice {
  fn play(&mut self) -> Result<(), SourceError> {
    self
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(GStreamerCaptureError::from)?;
    let (result, current, _pending) = self
      .pipeline
      .state(gst::ClockTime::from_seconds(STATE_TIMEOUT_SECS));
    self.playing = result.is_ok() && current == gst::State::Playing;
    debug!("GStreamer 管道状态: {:?}", current);
    Ok(())
  }

  fn stop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
    self.playing = false;
  }

  fn is_playing(&self) -> bool {
    self.playing
  }

  fn refresh(&mut self) -> Result<(), SourceError> {
    self.drain_bus();
    if !self.playing {
      return Ok(());
    }

    let Some(sample) = self
      .appsink
      .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
    else {
      // 没有新帧时沿用上一帧
      return Ok(());
    };

    let image = match convert_sample(sample, self.frame.take()) {
      Ok(image) => image,
      Err(e) => {
        if self.decode_errors.failure() {
          error!("连续 {} 帧转换失败, 停止采集: {}", MAX_DECODE_ERRORS, e);
          self.stop();
        }
        return Err(e.into());
      }
    };
    self.decode_errors.success();
    self.resolution = image.dimensions().into();
    self.frame = Some(image);
    Ok(())
  }

  fn resolution(&self) -> Resolution {
    self.resolution
  }

  fn frame(&self) -> Option<&RgbImage> {
    self.frame.as_ref()
  }
}

impl Drop for GStreamerDevice {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

/// 将 appsink 样本转换为 RGB 图像，尺寸不变时复用上一帧的内存
fn convert_sample(
  sample: gst::Sample,
  reuse: Option<RgbImage>,
) -> Result<RgbImage, GStreamerCaptureError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerCaptureError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerCaptureError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerCaptureError::VideoInfoError)?;

  let width = video_info.width();
  let height = video_info.height();
  let stride = video_info.stride()[0] as usize;
  let row = width as usize * 3;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerCaptureError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  if width == 0 || height == 0 {
    return Err(GStreamerCaptureError::VideoInfoError);
  }
  let expected = stride * (height as usize - 1) + row;
  if data.len() < expected {
    return Err(GStreamerCaptureError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut image = match reuse {
    Some(image) if image.dimensions() == (width, height) => image,
    _ => RgbImage::new(width, height),
  };
  let out: &mut [u8] = &mut image;

  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for (y, dst) in out.chunks_exact_mut(row).enumerate() {
        dst.copy_from_slice(&data[y * stride..y * stride + row]);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for (y, dst) in out.chunks_exact_mut(row).enumerate() {
        let src = &data[y * stride..y * stride + row];
        for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
          d[0] = s[2];
          d[1] = s[1];
          d[2] = s[0];
        }
      }
    }
    _ => return Err(GStreamerCaptureError::UnsupportedFormat),
  }

  Ok(image)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pipeline_description_contains_request() {
    let device = DeviceInfo {
      index: 0,
      name: "cam".to_string(),
      path: "/dev/video0".into(),
    };
    let request = CaptureRequest {
      width: 640,
      height: 480,
      fps: 30,
    };
    let desc = GStreamerCapture::default()
      .io_mode(Some(2))
      .pipeline_description(&device, &request);
    assert!(desc.starts_with("v4l2src device=/dev/video0 io-mode=2 ! "));
    assert!(desc.contains("width=640,height=480,framerate=30/1"));
    assert!(desc.ends_with("appsink max-buffers=2 drop=true name=sink"));
  }
}
